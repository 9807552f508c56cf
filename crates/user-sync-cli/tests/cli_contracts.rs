#![allow(clippy::single_match_else, clippy::uninlined_format_args)]

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};

use jsonschema::JSONSchema;
use serde_json::Value;
use ulid::Ulid;

fn usync_binary_path() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_usync"))
}

fn repo_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .unwrap_or_else(|err| panic!("failed to canonicalize repo root: {err}"))
}

fn unique_temp_db_path() -> PathBuf {
    std::env::temp_dir().join(format!("user-sync-cli-contract-{}.sqlite3", Ulid::new()))
}

fn remove_db(path: &Path) {
    for suffix in ["", "-wal", "-shm"] {
        let _ = std::fs::remove_file(format!("{}{suffix}", path.display()));
    }
}

fn usync_command(db_path: &Path, args: &[&str]) -> Command {
    let mut command = Command::new(usync_binary_path());
    command.env_remove("USER_SYNC_DB").env_remove("RUST_LOG");
    command.arg("--db").arg(db_path);
    command.args(args);
    command
}

fn usync_output(db_path: &Path, args: &[&str]) -> Output {
    match usync_command(db_path, args).output() {
        Ok(output) => output,
        Err(err) => panic!("failed to run usync command {:?}: {err}", args),
    }
}

fn usync_with_stdin(db_path: &Path, args: &[&str], stdin: &str) -> Output {
    let mut child = match usync_command(db_path, args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
    {
        Ok(child) => child,
        Err(err) => panic!("failed to spawn usync {:?}: {err}", args),
    };

    match child.stdin.take() {
        Some(mut pipe) => {
            if let Err(err) = pipe.write_all(stdin.as_bytes()) {
                panic!("failed to write stdin: {err}");
            }
        }
        None => panic!("stdin pipe missing"),
    }

    match child.wait_with_output() {
        Ok(output) => output,
        Err(err) => panic!("failed to wait for usync: {err}"),
    }
}

fn stdout_json(output: &Output) -> Value {
    match serde_json::from_slice::<Value>(&output.stdout) {
        Ok(value) => value,
        Err(err) => panic!(
            "failed to parse stdout as JSON: {err}\nstdout={}\nstderr={}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        ),
    }
}

fn assert_schema(schema_name: &str, value: &Value) {
    let schema_path = repo_root().join("contracts/v1/schemas").join(schema_name);
    let raw = std::fs::read_to_string(&schema_path)
        .unwrap_or_else(|err| panic!("failed to read {}: {err}", schema_path.display()));
    let schema: Value = serde_json::from_str(&raw)
        .unwrap_or_else(|err| panic!("failed to parse {}: {err}", schema_path.display()));
    let compiled = JSONSchema::compile(&schema)
        .unwrap_or_else(|err| panic!("failed to compile {}: {err}", schema_path.display()));
    if let Some(errors) = compiled
        .validate(value)
        .err()
        .map(|iter| iter.map(|err| err.to_string()).collect::<Vec<_>>())
    {
        panic!(
            "schema validation failed for {}:\n{}",
            schema_path.display(),
            errors.join("\n")
        );
    }
}

fn migrated_db() -> PathBuf {
    let db_path = unique_temp_db_path();
    let output = usync_output(&db_path, &["migrate"]);
    assert!(
        output.status.success(),
        "migrate failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    db_path
}

fn sample_batch_path() -> PathBuf {
    repo_root().join("contracts/v1/fixtures/sample-batch.json")
}

#[test]
fn help_lists_expected_subcommands() {
    let output = match Command::new(usync_binary_path()).arg("--help").output() {
        Ok(value) => value,
        Err(err) => panic!("failed to run help command: {err}"),
    };

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for required in ["migrate", "status", "changes", "apply", "list"] {
        assert!(stdout.contains(required), "help output missing {required}: {stdout}");
    }
}

#[test]
fn migrate_is_idempotent_and_status_reports_current_schema() {
    let db_path = migrated_db();
    let again = usync_output(&db_path, &["migrate"]);
    assert!(again.status.success());

    let status = stdout_json(&usync_output(&db_path, &["status"]));
    assert_eq!(status["current_version"], status["target_version"]);
    assert_eq!(status["pending_versions"], Value::Array(Vec::new()));
    remove_db(&db_path);
}

#[test]
fn every_published_schema_compiles_with_absolute_id() {
    let dir = repo_root().join("contracts/v1/schemas");
    let entries = std::fs::read_dir(&dir)
        .unwrap_or_else(|err| panic!("failed to list {}: {err}", dir.display()));

    let mut compiled = 0;
    for entry in entries {
        let path = entry.unwrap_or_else(|err| panic!("failed to read dir entry: {err}")).path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
            continue;
        }
        let raw = std::fs::read_to_string(&path)
            .unwrap_or_else(|err| panic!("failed to read {}: {err}", path.display()));
        let schema: Value = serde_json::from_str(&raw)
            .unwrap_or_else(|err| panic!("failed to parse {}: {err}", path.display()));
        let id = schema.get("$id").and_then(Value::as_str).unwrap_or_default();
        assert!(id.starts_with("https://"), "{} has a non-absolute $id: {id:?}", path.display());
        if let Err(err) = JSONSchema::compile(&schema) {
            panic!("failed to compile {}: {err}", path.display());
        }
        compiled += 1;
    }
    assert_eq!(compiled, 5);
}

#[test]
fn sample_fixture_matches_request_contract() {
    let raw = std::fs::read_to_string(sample_batch_path())
        .unwrap_or_else(|err| panic!("failed to read sample batch: {err}"));
    let batch: Value =
        serde_json::from_str(&raw).unwrap_or_else(|err| panic!("invalid sample batch: {err}"));
    assert_schema("batch-request.schema.json", &batch);
}

#[test]
fn apply_fixture_reports_partial_success_and_feeds_changes() {
    let db_path = migrated_db();
    let fixture = sample_batch_path();
    let fixture_arg = fixture.to_string_lossy().to_string();

    let applied = usync_output(&db_path, &["apply", "--file", &fixture_arg]);
    assert!(applied.status.success(), "{}", String::from_utf8_lossy(&applied.stderr));
    let result = stdout_json(&applied);
    assert_schema("batch-result.schema.json", &result);
    assert_eq!(result["processed"], Value::from(2));
    assert_eq!(result["total"], Value::from(3));
    let errors = result["errors"].as_array().cloned().unwrap_or_default();
    assert_eq!(errors.len(), 1);
    assert!(errors[0]
        .as_str()
        .is_some_and(|message| message.starts_with("record 2: missing externalId")));

    let changes =
        stdout_json(&usync_output(&db_path, &["changes", "--since", "2000-01-01T00:00:00Z"]));
    assert_schema("change-set.schema.json", &changes);
    assert_eq!(changes["count"], Value::from(2));
    assert_eq!(changes["users"][0]["externalId"], Value::from("0035g00000A1bCdEAF"));
    assert_eq!(changes["users"][1]["deleted"], Value::from(true));

    let last_modified =
        changes["users"][1]["lastModified"].as_str().unwrap_or_default().to_string();
    let after_last = stdout_json(&usync_output(&db_path, &["changes", "--since", &last_modified]));
    assert_eq!(after_last["count"], Value::from(0));

    let listing = stdout_json(&usync_output(&db_path, &["list"]));
    assert_schema("user-listing.schema.json", &listing);
    assert_eq!(listing["count"], Value::from(2));
    remove_db(&db_path);
}

#[test]
fn apply_reads_batch_from_stdin() {
    let db_path = migrated_db();
    let output = usync_with_stdin(
        &db_path,
        &["apply", "--file", "-"],
        r#"{"users": [{"externalId": "ext-stdin", "phone": 5551234}]}"#,
    );
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    assert_eq!(stdout_json(&output)["processed"], Value::from(1));

    let listing = stdout_json(&usync_output(&db_path, &["list"]));
    assert_eq!(listing["users"][0]["phone"], Value::from("5551234"));
    remove_db(&db_path);
}

#[test]
fn call_level_failures_exit_non_zero() {
    let db_path = migrated_db();

    let bad_cursor = usync_output(&db_path, &["changes", "--since", "last tuesday"]);
    assert!(!bad_cursor.status.success());
    assert!(String::from_utf8_lossy(&bad_cursor.stderr).contains("invalid cursor"));
    assert!(bad_cursor.stdout.is_empty());

    let empty_batch = usync_with_stdin(&db_path, &["apply", "--file", "-"], r#"{"users": []}"#);
    assert!(!empty_batch.status.success());
    assert!(String::from_utf8_lossy(&empty_batch.stderr).contains("invalid batch"));

    let missing_file = usync_output(&db_path, &["apply", "--file", "/nonexistent/batch.json"]);
    assert!(!missing_file.status.success());
    remove_db(&db_path);
}

#[test]
fn unmigrated_database_is_reported_unavailable() {
    let db_path = unique_temp_db_path();
    let output = usync_output(&db_path, &["list"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("store unavailable"));
    remove_db(&db_path);
}
