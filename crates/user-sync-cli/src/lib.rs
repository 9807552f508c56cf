//! Operator command surface for the user bridge.
//!
//! Every command prints one pretty JSON document on stdout shaped like the
//! matching HTTP payload, so scripts can switch between the two freely.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::info;
use user_sync_core::{
    apply_batch, changed_since, fields, list_all, parse_cursor, StoreProvider, SystemClock,
};
use user_sync_store_sqlite::SqliteStoreProvider;

#[derive(Debug, Parser)]
#[command(name = "usync")]
#[command(about = "User sync bridge CLI")]
pub struct Cli {
    #[arg(long, env = "USER_SYNC_DB", default_value = "./user_sync.sqlite3")]
    db: PathBuf,

    #[arg(long, env = "USER_SYNC_BUSY_TIMEOUT_MS", default_value_t = 5000)]
    busy_timeout_ms: u64,

    /// Log filter; logs go to stderr.
    #[arg(long, env = "USER_SYNC_LOG", default_value = "warn")]
    log: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Create or upgrade the users schema.
    Migrate,
    /// Report current and target schema versions.
    Status,
    /// Print every user modified strictly after a cursor.
    Changes {
        #[arg(long)]
        since: String,
    },
    /// Merge a `{"users": [...]}` batch file (`-` reads stdin).
    Apply {
        #[arg(long)]
        file: PathBuf,
    },
    /// Print every stored user, newest first.
    List,
}

impl Cli {
    #[must_use]
    pub fn log_filter(&self) -> &str {
        &self.log
    }

    fn provider(&self) -> SqliteStoreProvider {
        SqliteStoreProvider::new(self.db.clone())
            .with_busy_timeout(Duration::from_millis(self.busy_timeout_ms))
    }
}

/// Executes the parsed CLI and prints its JSON result.
///
/// # Errors
/// Returns an error for call-level failures: an unreadable or malformed batch,
/// an invalid cursor, or an unavailable store.
pub fn run_cli(cli: Cli) -> Result<()> {
    let provider = cli.provider();
    let output = run_command(&provider, cli.command, &mut std::io::stdin())?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

/// Executes one command against `provider`. `stdin` backs `apply --file -`.
///
/// # Errors
/// See [`run_cli`].
pub fn run_command(
    provider: &SqliteStoreProvider,
    command: Command,
    stdin: &mut dyn Read,
) -> Result<Value> {
    match command {
        Command::Migrate => {
            let status = provider
                .migrate()
                .with_context(|| format!("failed to migrate {}", provider.path().display()))?;
            info!(schema_version = status.current_version, "users schema ready");
            to_json(&status)
        }
        Command::Status => to_json(&provider.schema_status()?),
        Command::Changes { since } => {
            let cursor = parse_cursor(&since)?;
            let store = provider.acquire()?;
            success(&changed_since(&store, cursor)?)
        }
        Command::Apply { file } => {
            let body = read_batch(&file, stdin)?;
            let mut store = provider.acquire()?;
            let result = apply_batch(&mut store, &SystemClock, body.get(fields::USERS))?;
            success(&result)
        }
        Command::List => {
            let store = provider.acquire()?;
            success(&list_all(&store)?)
        }
    }
}

fn read_batch(file: &Path, stdin: &mut dyn Read) -> Result<Value> {
    let (raw, source) = if file.as_os_str() == "-" {
        let mut raw = String::new();
        stdin
            .read_to_string(&mut raw)
            .context("failed to read batch from stdin")?;
        (raw, "stdin".to_string())
    } else {
        let raw = std::fs::read_to_string(file)
            .with_context(|| format!("failed to read batch file {}", file.display()))?;
        (raw, file.display().to_string())
    };

    serde_json::from_str(&raw).with_context(|| format!("invalid batch: {source} is not valid JSON"))
}

fn to_json<T: Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value).context("failed to serialize output")
}

/// Prefixes `success: true` the way the HTTP service shapes its payloads.
fn success<T: Serialize>(data: &T) -> Result<Value> {
    let Value::Object(body) = to_json(data)? else {
        return Err(anyhow!("expected a JSON object payload"));
    };
    let mut envelope = Map::with_capacity(body.len() + 1);
    envelope.insert("success".to_string(), Value::Bool(true));
    envelope.extend(body);
    Ok(Value::Object(envelope))
}
