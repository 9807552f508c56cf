#![allow(clippy::missing_errors_doc)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use tracing::{debug, info};
use user_sync_core::{
    format_instant, Clock, StoreError, StoreProvider, SystemClock, Timestamp, UserFields,
    UserRecord, UserStore, ValidatedRecord,
};

const USERS_MIGRATION_VERSION: i64 = 1;
const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_millis(5000);

const SCHEMA_USERS_V1: &str = r"
CREATE TABLE IF NOT EXISTS users (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  external_user_id TEXT NOT NULL UNIQUE CHECK (length(external_user_id) > 0),
  email TEXT,
  first_name TEXT,
  last_name TEXT,
  phone TEXT,
  deleted INTEGER NOT NULL DEFAULT 0 CHECK (deleted IN (0, 1)),
  created_at INTEGER NOT NULL,
  updated_at INTEGER NOT NULL CHECK (updated_at >= created_at)
);

CREATE INDEX IF NOT EXISTS idx_users_updated_at_id
  ON users(updated_at, id);

CREATE TRIGGER IF NOT EXISTS trg_users_identity_immutable
BEFORE UPDATE OF id, external_user_id, created_at ON users
WHEN NEW.id IS NOT OLD.id
  OR NEW.external_user_id IS NOT OLD.external_user_id
  OR NEW.created_at IS NOT OLD.created_at
BEGIN
  SELECT RAISE(FAIL, 'users identity columns are immutable');
END;
";

const USER_COLUMNS: &str =
    "id, external_user_id, email, first_name, last_name, phone, deleted, created_at, updated_at";

pub struct SqliteUserStore {
    conn: Connection,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

impl SchemaStatus {
    #[must_use]
    pub fn is_current(&self) -> bool {
        self.pending_versions.is_empty() && self.current_version == self.target_version
    }
}

impl SqliteUserStore {
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_busy_timeout(path, DEFAULT_BUSY_TIMEOUT)
    }

    pub fn open_with_busy_timeout(path: &Path, busy_timeout: Duration) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;",
        )
        .context("failed to configure sqlite pragmas")?;
        conn.busy_timeout(busy_timeout)
            .context("failed to configure sqlite busy_timeout")?;

        Ok(Self { conn })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_USERS_V1)
            .context("failed to apply users schema")?;

        ensure_users_contract(&self.conn)?;

        let now = format_instant(SystemClock.now()).map_err(|err| anyhow!(err.to_string()))?;
        let inserted = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![USERS_MIGRATION_VERSION, now],
            )
            .context("failed to register users schema migration")?;

        if inserted > 0 {
            info!(version = USERS_MIGRATION_VERSION, "applied users schema migration");
        }

        Ok(())
    }

    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let current_version = if table_exists(&self.conn, "schema_migrations")? {
            self.conn
                .query_row(
                    "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
                    [],
                    |row| row.get::<_, i64>(0),
                )
                .context("failed to read schema_migrations")?
        } else {
            0
        };

        let pending_versions = (current_version + 1..=USERS_MIGRATION_VERSION).collect();
        Ok(SchemaStatus {
            current_version,
            target_version: USERS_MIGRATION_VERSION,
            pending_versions,
        })
    }

    fn select_one(
        &self,
        clause: &str,
        param: &dyn rusqlite::ToSql,
    ) -> Result<Option<UserRecord>, StoreError> {
        self.conn
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE {clause}"),
                [param],
                parse_user_row,
            )
            .optional()
            .map_err(|err| classify_error(&err, "failed to read user"))
    }

    fn select_many(
        &self,
        query: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<UserRecord>, StoreError> {
        let mut stmt = self
            .conn
            .prepare(query)
            .map_err(|err| classify_error(&err, "failed to prepare user query"))?;
        let rows = stmt
            .query_map(params, parse_user_row)
            .map_err(|err| classify_error(&err, "failed to query users"))?;
        collect_rows(rows).map_err(|err| classify_error(&err, "failed to decode user row"))
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl UserStore for SqliteUserStore {
    fn find_by_external_id(&self, external_id: &str) -> Result<Option<UserRecord>, StoreError> {
        self.select_one("external_user_id = ?1", &external_id)
    }

    fn insert(
        &mut self,
        record: &ValidatedRecord,
        at: Timestamp,
    ) -> Result<UserRecord, StoreError> {
        let fields = &record.fields;
        let inserted = self
            .conn
            .query_row(
                &format!(
                    "INSERT INTO users(
                        external_user_id, email, first_name, last_name, phone,
                        deleted, created_at, updated_at
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
                     RETURNING {USER_COLUMNS}"
                ),
                params![
                    record.external_id,
                    fields.email,
                    fields.first_name,
                    fields.last_name,
                    fields.phone,
                    bool_to_sql(fields.deleted),
                    at.unix_micros(),
                ],
                parse_user_row,
            )
            .map_err(|err| classify_error(&err, "failed to insert user"))?;

        debug!(id = inserted.id, external_id = %inserted.external_id, "inserted user");
        Ok(inserted)
    }

    fn update(
        &mut self,
        id: i64,
        fields: &UserFields,
        updated_at: Timestamp,
    ) -> Result<UserRecord, StoreError> {
        // MAX keeps updated_at strictly increasing when writers race on one row.
        let updated = self
            .conn
            .query_row(
                &format!(
                    "UPDATE users SET
                        email = ?1,
                        first_name = ?2,
                        last_name = ?3,
                        phone = ?4,
                        deleted = ?5,
                        updated_at = MAX(?6, updated_at + 1)
                     WHERE id = ?7
                     RETURNING {USER_COLUMNS}"
                ),
                params![
                    fields.email,
                    fields.first_name,
                    fields.last_name,
                    fields.phone,
                    bool_to_sql(fields.deleted),
                    updated_at.unix_micros(),
                    id,
                ],
                parse_user_row,
            )
            .optional()
            .map_err(|err| classify_error(&err, "failed to update user"))?
            .ok_or_else(|| StoreError::Backend(format!("no user row with id {id}")))?;

        debug!(id, external_id = %updated.external_id, "updated user");
        Ok(updated)
    }

    fn changed_since(&self, cursor: Timestamp) -> Result<Vec<UserRecord>, StoreError> {
        self.select_many(
            &format!(
                "SELECT {USER_COLUMNS} FROM users
                 WHERE updated_at > ?1
                 ORDER BY updated_at ASC, id ASC"
            ),
            params![cursor.unix_micros()],
        )
    }

    fn list_all(&self) -> Result<Vec<UserRecord>, StoreError> {
        self.select_many(
            &format!("SELECT {USER_COLUMNS} FROM users ORDER BY updated_at DESC, id DESC"),
            [],
        )
    }
}

/// Opens one connection per acquisition against a shared database file.
#[derive(Debug, Clone)]
pub struct SqliteStoreProvider {
    path: PathBuf,
    busy_timeout: Duration,
}

impl SqliteStoreProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_busy_timeout(mut self, busy_timeout: Duration) -> Self {
        self.busy_timeout = busy_timeout;
        self
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn migrate(&self) -> Result<SchemaStatus> {
        let store = SqliteUserStore::open_with_busy_timeout(&self.path, self.busy_timeout)?;
        store.migrate()?;
        store.schema_status()
    }

    pub fn schema_status(&self) -> Result<SchemaStatus> {
        SqliteUserStore::open_with_busy_timeout(&self.path, self.busy_timeout)?.schema_status()
    }
}

impl StoreProvider for SqliteStoreProvider {
    type Store = SqliteUserStore;

    fn acquire(&self) -> Result<SqliteUserStore, StoreError> {
        let store = SqliteUserStore::open_with_busy_timeout(&self.path, self.busy_timeout)
            .map_err(|err| StoreError::Unavailable(format!("{err:#}")))?;
        let status = store
            .schema_status()
            .map_err(|err| StoreError::Unavailable(format!("{err:#}")))?;
        if !status.is_current() {
            return Err(StoreError::Unavailable(format!(
                "users schema is at version {} but {} is required; run migrate first",
                status.current_version, status.target_version
            )));
        }
        Ok(store)
    }
}

fn parse_user_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserRecord> {
    let deleted_raw: i64 = row.get(6)?;
    let deleted = match deleted_raw {
        0 => false,
        1 => true,
        other => {
            return Err(rusqlite::Error::FromSqlConversionFailure(
                6,
                rusqlite::types::Type::Integer,
                Box::new(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("invalid deleted flag: {other}"),
                )),
            ))
        }
    };

    Ok(UserRecord {
        id: row.get(0)?,
        external_id: row.get(1)?,
        fields: UserFields {
            email: row.get(2)?,
            first_name: row.get(3)?,
            last_name: row.get(4)?,
            phone: row.get(5)?,
            deleted,
        },
        created_at: Timestamp::from_unix_micros(row.get(7)?),
        updated_at: Timestamp::from_unix_micros(row.get(8)?),
    })
}

fn classify_error(err: &rusqlite::Error, action: &str) -> StoreError {
    if let Some(code) = err.sqlite_error() {
        if code.code == ErrorCode::ConstraintViolation
            && code.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
        {
            return StoreError::Conflict(format!("{action}: {err}"));
        }
        if matches!(code.code, ErrorCode::CannotOpen | ErrorCode::NotADatabase) {
            return StoreError::Unavailable(format!("{action}: {err}"));
        }
    }
    StoreError::Backend(format!("{action}: {err}"))
}

fn bool_to_sql(value: bool) -> i64 {
    i64::from(value)
}

fn ensure_users_contract(conn: &Connection) -> Result<()> {
    ensure_table_has_columns(
        conn,
        "users",
        &[
            "id",
            "external_user_id",
            "email",
            "first_name",
            "last_name",
            "phone",
            "deleted",
            "created_at",
            "updated_at",
        ],
    )?;
    ensure_unique_index_on_columns(conn, "users", &["external_user_id"])
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT 1
             FROM sqlite_master
             WHERE type = 'table' AND name = ?1
             LIMIT 1",
            params![table_name],
            |_| Ok(()),
        )
        .optional()
        .context("failed to query sqlite_master")?
        .is_some();

    Ok(exists)
}

fn ensure_table_has_columns(conn: &Connection, table_name: &str, columns: &[&str]) -> Result<()> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table_name})"))
        .with_context(|| format!("failed to inspect table_info for {table_name}"))?;
    let mut rows = stmt.query([])?;

    let mut available = Vec::new();
    while let Some(row) = rows.next()? {
        available.push(row.get::<_, String>(1)?);
    }

    for required in columns {
        if !available.iter().any(|candidate| candidate == required) {
            return Err(anyhow!(
                "users schema check failed: missing column {table_name}.{required}"
            ));
        }
    }

    Ok(())
}

fn ensure_unique_index_on_columns(
    conn: &Connection,
    table_name: &str,
    columns: &[&str],
) -> Result<()> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA index_list({table_name})"))
        .with_context(|| format!("failed to inspect index_list for {table_name}"))?;
    let mut rows = stmt.query([])?;

    while let Some(row) = rows.next()? {
        let index_name: String = row.get(1)?;
        let is_unique: i64 = row.get(2)?;
        if is_unique != 1 {
            continue;
        }

        let indexed_columns = index_columns(conn, &index_name)?;
        if indexed_columns == columns {
            return Ok(());
        }
    }

    Err(anyhow!(
        "users schema check failed: expected UNIQUE({}) on {table_name}",
        columns.join(", ")
    ))
}

fn index_columns(conn: &Connection, index_name: &str) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA index_info({index_name})"))
        .with_context(|| format!("failed to inspect index_info for {index_name}"))?;
    let mut rows = stmt.query([])?;

    let mut columns = Vec::new();
    while let Some(row) = rows.next()? {
        columns.push(row.get::<_, String>(2)?);
    }

    Ok(columns)
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> rusqlite::Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}
