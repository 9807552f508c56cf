use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::signal;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};
use user_sync_core::{
    apply_batch, batch_records, changed_since, fields, format_instant, list_all, parse_cursor,
    BatchResult, ChangeSet, Clock, StoreProvider, SyncError, SystemClock, UserListing,
};
use user_sync_store_sqlite::{SchemaStatus, SqliteStoreProvider, SqliteUserStore};

const SERVICE_NAME: &str = "user-sync-service";

#[derive(Clone)]
struct ServiceState {
    provider: SqliteStoreProvider,
    clock: Arc<dyn Clock>,
    operation_timeout: Duration,
    telemetry: Arc<ServiceTelemetry>,
}

#[derive(Debug, Clone, Serialize)]
struct Success<T>
where
    T: Serialize,
{
    success: bool,
    #[serde(flatten)]
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct FailureBody {
    success: bool,
    error: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<Value>,
}

/// How `operation_timeout` applies to a blocking operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Deadline {
    /// Reads are abandoned with 504 once the timeout elapses.
    Enforced,
    /// Writes always run to completion; an overrun is only logged and counted.
    Advisory,
}

#[derive(Debug, Clone)]
struct ServiceFailure {
    status: StatusCode,
    code: &'static str,
    message: String,
    details: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    message: &'static str,
    timestamp: String,
    timeout_ms: u64,
    telemetry: ServiceTelemetrySnapshot,
}

#[derive(Debug, Clone, Serialize)]
struct ReadinessResponse {
    status: &'static str,
    checks: SchemaStatus,
}

#[derive(Debug, Default)]
#[allow(clippy::struct_field_names)]
struct ServiceTelemetry {
    requests_total: AtomicU64,
    requests_success_total: AtomicU64,
    requests_failure_total: AtomicU64,
    timeout_total: AtomicU64,
    deadline_overrun_total: AtomicU64,
    invalid_cursor_total: AtomicU64,
    invalid_batch_total: AtomicU64,
    store_unavailable_total: AtomicU64,
    internal_error_total: AtomicU64,
    records_applied_total: AtomicU64,
    record_errors_total: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
#[allow(clippy::struct_field_names)]
struct ServiceTelemetrySnapshot {
    requests_total: u64,
    requests_success_total: u64,
    requests_failure_total: u64,
    timeout_total: u64,
    deadline_overrun_total: u64,
    invalid_cursor_total: u64,
    invalid_batch_total: u64,
    store_unavailable_total: u64,
    internal_error_total: u64,
    records_applied_total: u64,
    record_errors_total: u64,
}

#[derive(Debug, Parser)]
#[command(name = "user-sync-service")]
#[command(about = "HTTP bridge exchanging user records with an external CRM")]
struct Args {
    #[arg(long, env = "USER_SYNC_DB", default_value = "./user_sync.sqlite3")]
    db: PathBuf,
    #[arg(long, env = "USER_SYNC_BIND", default_value = "127.0.0.1:3000")]
    bind: SocketAddr,
    /// Overrides the port of `--bind`.
    #[arg(long, env = "PORT")]
    port: Option<u16>,
    #[arg(long, env = "USER_SYNC_OPERATION_TIMEOUT_MS", default_value_t = 2500)]
    operation_timeout_ms: u64,
    #[arg(long, env = "USER_SYNC_BUSY_TIMEOUT_MS", default_value_t = 5000)]
    busy_timeout_ms: u64,
    #[arg(long, env = "USER_SYNC_LOG", default_value = "info")]
    log: String,
    /// Serve without applying pending schema migrations at startup.
    #[arg(long)]
    skip_migrate: bool,
}

impl Args {
    fn listen_addr(&self) -> SocketAddr {
        let mut addr = self.bind;
        if let Some(port) = self.port {
            addr.set_port(port);
        }
        addr
    }
}

impl IntoResponse for ServiceFailure {
    fn into_response(self) -> Response {
        let body = FailureBody {
            success: false,
            error: self.code,
            message: self.message,
            details: self.details,
        };
        (self.status, Json(body)).into_response()
    }
}

impl ServiceState {
    fn failure(
        status: StatusCode,
        code: &'static str,
        message: impl Into<String>,
        details: Option<Value>,
    ) -> ServiceFailure {
        ServiceFailure { status, code, message: message.into(), details }
    }

    fn classify_sync_error(err: &SyncError) -> ServiceFailure {
        let (status, code) = match err {
            SyncError::InvalidCursor { .. } => (StatusCode::BAD_REQUEST, "invalid_cursor"),
            SyncError::InvalidBatch(_) => (StatusCode::BAD_REQUEST, "invalid_batch"),
            SyncError::StoreUnavailable(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "store_unavailable")
            }
            SyncError::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        };
        Self::failure(status, code, err.to_string(), None)
    }

    /// Counts and maps an error raised before any blocking work was scheduled.
    fn reject(&self, err: &SyncError) -> ServiceFailure {
        self.telemetry.requests_total.fetch_add(1, Ordering::Relaxed);
        let failure = Self::classify_sync_error(err);
        self.telemetry.record_failure(failure.code, false);
        failure
    }

    fn invalid_json(&self, rejection: &JsonRejection) -> ServiceFailure {
        self.telemetry.requests_total.fetch_add(1, Ordering::Relaxed);
        self.telemetry.record_failure("invalid_batch", false);
        Self::failure(
            StatusCode::BAD_REQUEST,
            "invalid_batch",
            rejection.body_text(),
            Some(json!({ "rejection": rejection.to_string() })),
        )
    }

    fn timeout_ms(&self) -> u64 {
        u64::try_from(self.operation_timeout.as_millis()).unwrap_or(u64::MAX)
    }

    async fn run_blocking<T, F>(
        &self,
        operation_label: &'static str,
        deadline: Deadline,
        op: F,
    ) -> Result<T, ServiceFailure>
    where
        T: Send + 'static,
        F: FnOnce(SqliteStoreProvider, Arc<dyn Clock>) -> Result<T, SyncError> + Send + 'static,
    {
        self.telemetry.requests_total.fetch_add(1, Ordering::Relaxed);
        let provider = self.provider.clone();
        let clock = Arc::clone(&self.clock);
        let started = Instant::now();
        let handle = tokio::task::spawn_blocking(move || op(provider, clock));

        let join_result = match deadline {
            Deadline::Enforced => tokio::time::timeout(self.operation_timeout, handle)
                .await
                .map_err(|_| {
                    self.telemetry.record_failure("timeout", true);
                    Self::failure(
                        StatusCode::GATEWAY_TIMEOUT,
                        "timeout",
                        format!("{operation_label} timed out after {} ms", self.timeout_ms()),
                        Some(json!({ "timeout_ms": self.timeout_ms() })),
                    )
                })?,
            Deadline::Advisory => {
                // A started write cannot be cancelled.
                let joined = handle.await;
                let elapsed = started.elapsed();
                if elapsed > self.operation_timeout {
                    self.telemetry.deadline_overrun_total.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        operation = operation_label,
                        elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                        timeout_ms = self.timeout_ms(),
                        "write outlived the operation timeout"
                    );
                }
                joined
            }
        };

        let op_result = join_result.map_err(|err| {
            self.telemetry.record_failure("internal_error", false);
            Self::failure(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                format!("{operation_label} join failure: {err}"),
                None,
            )
        })?;

        match op_result {
            Ok(value) => {
                self.telemetry.requests_success_total.fetch_add(1, Ordering::Relaxed);
                Ok(value)
            }
            Err(err) => {
                error!(operation = operation_label, error = %err, "operation failed");
                let failure = Self::classify_sync_error(&err);
                self.telemetry.record_failure(failure.code, false);
                Err(failure)
            }
        }
    }

    /// Runs `op` against a store handle acquired for this request only.
    async fn with_store<T, F>(
        &self,
        operation_label: &'static str,
        deadline: Deadline,
        op: F,
    ) -> Result<T, ServiceFailure>
    where
        T: Send + 'static,
        F: FnOnce(&mut SqliteUserStore, &dyn Clock) -> Result<T, SyncError> + Send + 'static,
    {
        self.run_blocking(operation_label, deadline, move |provider, clock| {
            let mut store = provider.acquire()?;
            op(&mut store, clock.as_ref())
        })
        .await
    }
}

impl ServiceTelemetry {
    fn record_failure(&self, code: &str, timeout: bool) {
        self.requests_failure_total.fetch_add(1, Ordering::Relaxed);
        if timeout {
            self.timeout_total.fetch_add(1, Ordering::Relaxed);
        }
        match code {
            "invalid_cursor" => {
                self.invalid_cursor_total.fetch_add(1, Ordering::Relaxed);
            }
            "invalid_batch" => {
                self.invalid_batch_total.fetch_add(1, Ordering::Relaxed);
            }
            "store_unavailable" => {
                self.store_unavailable_total.fetch_add(1, Ordering::Relaxed);
            }
            "internal_error" => {
                self.internal_error_total.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }

    fn record_batch(&self, result: &BatchResult) {
        self.records_applied_total
            .fetch_add(result.processed as u64, Ordering::Relaxed);
        self.record_errors_total
            .fetch_add(result.errors.len() as u64, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ServiceTelemetrySnapshot {
        ServiceTelemetrySnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_success_total: self.requests_success_total.load(Ordering::Relaxed),
            requests_failure_total: self.requests_failure_total.load(Ordering::Relaxed),
            timeout_total: self.timeout_total.load(Ordering::Relaxed),
            deadline_overrun_total: self.deadline_overrun_total.load(Ordering::Relaxed),
            invalid_cursor_total: self.invalid_cursor_total.load(Ordering::Relaxed),
            invalid_batch_total: self.invalid_batch_total.load(Ordering::Relaxed),
            store_unavailable_total: self.store_unavailable_total.load(Ordering::Relaxed),
            internal_error_total: self.internal_error_total.load(Ordering::Relaxed),
            records_applied_total: self.records_applied_total.load(Ordering::Relaxed),
            record_errors_total: self.record_errors_total.load(Ordering::Relaxed),
        }
    }
}

fn success<T>(data: T) -> Json<Success<T>>
where
    T: Serialize,
{
    Json(Success { success: true, data })
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/users", get(users_list))
        .route("/users/changes-since/:timestamp", get(users_changed_since))
        .route("/users/from-salesforce", post(users_from_external))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .or_else(|_| EnvFilter::try_new("info"))
        .map_err(|err| anyhow!("invalid log filter: {err}"))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .try_init()
        .map_err(|err| anyhow!("failed to install tracing subscriber: {err}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log)?;

    let provider = SqliteStoreProvider::new(args.db.clone())
        .with_busy_timeout(Duration::from_millis(args.busy_timeout_ms));
    if !args.skip_migrate {
        let status = provider
            .migrate()
            .with_context(|| format!("failed to migrate {}", args.db.display()))?;
        info!(schema_version = status.current_version, "users schema ready");
    }

    let state = ServiceState {
        provider,
        clock: Arc::new(SystemClock),
        operation_timeout: Duration::from_millis(args.operation_timeout_ms),
        telemetry: Arc::new(ServiceTelemetry::default()),
    };

    let addr = args.listen_addr();
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(service = SERVICE_NAME, %addr, db = %args.db.display(), "listening");

    axum::serve(listener, app(state))
        .with_graceful_shutdown(wait_for_shutdown())
        .await
        .context("server error")?;

    info!("shut down gracefully");
    Ok(())
}

async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    info!("shutdown signal received");
}

async fn health(State(state): State<ServiceState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "OK",
        message: "user sync bridge is running",
        timestamp: format_instant(state.clock.now()).unwrap_or_default(),
        timeout_ms: state.timeout_ms(),
        telemetry: state.telemetry.snapshot(),
    })
}

async fn ready(
    State(state): State<ServiceState>,
) -> Result<Json<Success<ReadinessResponse>>, ServiceFailure> {
    let status = state
        .run_blocking("schema_status", Deadline::Enforced, |provider, _clock| {
            provider
                .schema_status()
                .map_err(|err| SyncError::StoreUnavailable(format!("{err:#}")))
        })
        .await?;

    if status.is_current() {
        return Ok(success(ReadinessResponse { status: "ready", checks: status }));
    }

    state.telemetry.record_failure("store_unavailable", false);
    Err(ServiceState::failure(
        StatusCode::SERVICE_UNAVAILABLE,
        "store_unavailable",
        "users schema is not migrated",
        Some(json!({
            "current_version": status.current_version,
            "target_version": status.target_version,
            "pending_versions": status.pending_versions,
        })),
    ))
}

async fn users_changed_since(
    State(state): State<ServiceState>,
    Path(timestamp): Path<String>,
) -> Result<Json<Success<ChangeSet>>, ServiceFailure> {
    let cursor = parse_cursor(&timestamp).map_err(|err| state.reject(&err))?;
    info!(%cursor, "fetching users changed since cursor");
    let changes = state
        .with_store("changes_since", Deadline::Enforced, move |store, _clock| {
            changed_since(&*store, cursor)
        })
        .await?;
    Ok(success(changes))
}

async fn users_from_external(
    State(state): State<ServiceState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<Json<Success<BatchResult>>, ServiceFailure> {
    let Json(body) = payload.map_err(|rejection| state.invalid_json(&rejection))?;
    let users = body.get(fields::USERS).cloned();
    let total = batch_records(users.as_ref())
        .map_err(|err| state.reject(&err))?
        .len();
    info!(total, "received user batch");

    let result = state
        .with_store("apply_batch", Deadline::Advisory, move |store, clock| {
            apply_batch(store, clock, users.as_ref())
        })
        .await?;
    state.telemetry.record_batch(&result);
    Ok(success(result))
}

async fn users_list(
    State(state): State<ServiceState>,
) -> Result<Json<Success<UserListing>>, ServiceFailure> {
    let listing = state
        .with_store("list_users", Deadline::Enforced, |store, _clock| list_all(&*store))
        .await?;
    Ok(success(listing))
}
