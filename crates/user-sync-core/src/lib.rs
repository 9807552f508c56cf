//! Synchronization semantics shared by every surface of the user bridge.
//!
//! The pull side is [`find_changed_since`]: a strict `updated_at > cursor`
//! change feed in deterministic replay order. The push side is
//! [`apply_batch`]: a per-record validate-then-upsert fold keyed by external
//! identifier that accumulates failures instead of aborting. Both run against
//! any [`UserStore`]; the relational implementation lives in
//! `user-sync-store-sqlite`.

use std::cmp::Reverse;
use std::fmt::{Display, Formatter};

use serde::{Serialize, Serializer};
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{Date, OffsetDateTime, PrimitiveDateTime, UtcOffset};
use tracing::{debug, info, warn};

/// Wire names of the external record schema.
pub mod fields {
    pub const USERS: &str = "users";
    pub const EXTERNAL_ID: &str = "externalId";
    pub const EMAIL: &str = "email";
    pub const FIRST_NAME: &str = "firstName";
    pub const LAST_NAME: &str = "lastName";
    pub const PHONE: &str = "phone";
    pub const DELETED: &str = "deleted";
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum SyncError {
    #[error("invalid cursor {input:?}: {reason}")]
    InvalidCursor { input: String, reason: String },
    #[error("invalid batch: {0}")]
    InvalidBatch(String),
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("store failure: {0}")]
    Store(String),
}

impl From<StoreError> for SyncError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(detail) => Self::StoreUnavailable(detail),
            other => Self::Store(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("external id conflict: {0}")]
    Conflict(String),
    #[error("{0}")]
    Backend(String),
}

/// A single record's failure inside a batch. Never aborts the batch.
#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum RecordError {
    #[error("record {index}: {reason}: {record}")]
    Validation {
        index: usize,
        reason: String,
        record: String,
    },
    #[error("user {external_id}: {cause}")]
    Persistence {
        external_id: String,
        cause: StoreError,
    },
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum TimestampError {
    #[error("timestamp out of range: {0}us since epoch")]
    OutOfRange(i64),
    #[error("failed to format timestamp: {0}")]
    Format(String),
}

/// A UTC instant with microsecond precision, stored as Unix microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(i64);

impl Timestamp {
    #[must_use]
    pub fn from_unix_micros(micros: i64) -> Self {
        Self(micros)
    }

    #[must_use]
    pub fn unix_micros(self) -> i64 {
        self.0
    }

    /// Floors to the microsecond and clamps to the representable range.
    #[must_use]
    pub fn from_unix_nanos(nanos: i128) -> Self {
        let micros = nanos.div_euclid(1_000);
        match i64::try_from(micros) {
            Ok(value) => Self(value),
            Err(_) if micros < 0 => Self(i64::MIN),
            Err(_) => Self(i64::MAX),
        }
    }

    #[must_use]
    pub fn from_datetime(value: OffsetDateTime) -> Self {
        Self::from_unix_nanos(value.unix_timestamp_nanos())
    }

    /// # Errors
    /// Returns [`TimestampError::OutOfRange`] when the instant cannot be
    /// represented as a calendar date.
    pub fn to_datetime(self) -> Result<OffsetDateTime, TimestampError> {
        OffsetDateTime::from_unix_timestamp_nanos(i128::from(self.0) * 1_000)
            .map_err(|_| TimestampError::OutOfRange(self.0))
    }

    #[must_use]
    pub fn successor(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match format_instant(*self) {
            Ok(rendered) => f.write_str(&rendered),
            Err(_) => write!(f, "{}us", self.0),
        }
    }
}

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let rendered = format_instant(*self).map_err(serde::ser::Error::custom)?;
        serializer.serialize_str(&rendered)
    }
}

/// Renders an instant as RFC 3339 in UTC (`Z` suffix).
///
/// # Errors
/// Returns [`TimestampError`] when the instant is outside the calendar range.
pub fn format_instant(value: Timestamp) -> Result<String, TimestampError> {
    value
        .to_datetime()?
        .to_offset(UtcOffset::UTC)
        .format(&Rfc3339)
        .map_err(|err| TimestampError::Format(err.to_string()))
}

/// Parses a puller-supplied cursor.
///
/// Accepts RFC 3339 with any offset, plus offset-less
/// `YYYY-MM-DD[T ]HH:MM:SS[.fff]` and bare `YYYY-MM-DD`, both read as UTC.
///
/// # Errors
/// Returns [`SyncError::InvalidCursor`] for anything else. Malformed cursors
/// are never coerced to the epoch or to the current time.
pub fn parse_cursor(raw: &str) -> Result<Timestamp, SyncError> {
    let invalid = |reason: &str| SyncError::InvalidCursor {
        input: raw.to_string(),
        reason: reason.to_string(),
    };

    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(invalid("cursor is empty"));
    }

    if let Ok(parsed) = OffsetDateTime::parse(trimmed, &Rfc3339) {
        return Ok(Timestamp::from_datetime(parsed));
    }

    let normalized = trimmed.replacen(' ', "T", 1);
    if let Ok(parsed) = PrimitiveDateTime::parse(
        &normalized,
        format_description!(
            "[year]-[month]-[day]T[hour]:[minute]:[second][optional [.[subsecond]]]"
        ),
    ) {
        return Ok(Timestamp::from_datetime(parsed.assume_utc()));
    }

    if let Ok(parsed) = Date::parse(trimmed, format_description!("[year]-[month]-[day]")) {
        return Ok(Timestamp::from_datetime(parsed.midnight().assume_utc()));
    }

    Err(invalid("expected an RFC 3339 instant"))
}

/// The `updated_at` a mutation must write so it strictly exceeds the
/// previous value even when the clock has not advanced.
#[must_use]
pub fn next_modification(previous: Option<Timestamp>, now: Timestamp) -> Timestamp {
    match previous {
        Some(previous) if now <= previous => previous.successor(),
        _ => now,
    }
}

pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Timestamp::from_datetime(OffsetDateTime::now_utc())
    }
}

/// Mutable attributes of a user. Every upsert replaces all of them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserFields {
    pub email: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub phone: Option<String>,
    pub deleted: bool,
}

/// Canonical store-owned user row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub id: i64,
    pub external_id: String,
    pub fields: UserFields,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

/// An externally sourced record that passed schema validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedRecord {
    pub external_id: String,
    pub fields: UserFields,
}

/// Persistence contract for user rows.
///
/// Implementations must keep `external_id` unique (a duplicate insert fails
/// with [`StoreError::Conflict`]) and must make every `update` store an
/// `updated_at` strictly greater than the row's previous one.
pub trait UserStore {
    /// # Errors
    /// Returns [`StoreError`] when the lookup fails.
    fn find_by_external_id(&self, external_id: &str) -> Result<Option<UserRecord>, StoreError>;

    /// Inserts a new row with `created_at = updated_at = at`.
    ///
    /// # Errors
    /// Returns [`StoreError::Conflict`] when the external id already exists.
    fn insert(&mut self, record: &ValidatedRecord, at: Timestamp)
        -> Result<UserRecord, StoreError>;

    /// Overwrites all mutable fields of row `id`, leaving `id`, `external_id`
    /// and `created_at` untouched.
    ///
    /// # Errors
    /// Returns [`StoreError`] when the row is missing or the write fails.
    fn update(
        &mut self,
        id: i64,
        fields: &UserFields,
        updated_at: Timestamp,
    ) -> Result<UserRecord, StoreError>;

    /// Rows with `updated_at > cursor`, ascending by `(updated_at, id)`.
    ///
    /// # Errors
    /// Returns [`StoreError`] when the query fails.
    fn changed_since(&self, cursor: Timestamp) -> Result<Vec<UserRecord>, StoreError>;

    /// Every row, descending by `(updated_at, id)`.
    ///
    /// # Errors
    /// Returns [`StoreError`] when the query fails.
    fn list_all(&self) -> Result<Vec<UserRecord>, StoreError>;
}

/// A shared store resource handing out one scoped handle per operation.
pub trait StoreProvider: Send + Sync {
    type Store: UserStore;

    /// # Errors
    /// Returns [`StoreError::Unavailable`] when no handle can be acquired.
    fn acquire(&self) -> Result<Self::Store, StoreError>;
}

/// Pull-side projection in the external system's field names.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ExternalUser {
    pub external_id: String,
    pub email: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub phone: Option<String>,
    pub deleted: bool,
    pub last_modified: Timestamp,
}

impl From<UserRecord> for ExternalUser {
    fn from(record: UserRecord) -> Self {
        Self {
            external_id: record.external_id,
            email: record.fields.email,
            first_name: record.fields.first_name,
            last_name: record.fields.last_name,
            phone: record.fields.phone,
            deleted: record.fields.deleted,
            last_modified: record.updated_at,
        }
    }
}

/// Diagnostic projection including the internal id and both timestamps.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UserView {
    pub id: i64,
    pub external_id: String,
    pub email: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub phone: Option<String>,
    pub deleted: bool,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl From<UserRecord> for UserView {
    fn from(record: UserRecord) -> Self {
        Self {
            id: record.id,
            external_id: record.external_id,
            email: record.fields.email,
            first_name: record.fields.first_name,
            last_name: record.fields.last_name,
            phone: record.fields.phone,
            deleted: record.fields.deleted,
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ChangeSet {
    pub users: Vec<ExternalUser>,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct UserListing {
    pub users: Vec<UserView>,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct BatchResult {
    pub processed: usize,
    pub total: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl BatchResult {
    #[must_use]
    pub fn empty(total: usize) -> Self {
        Self {
            processed: 0,
            total,
            errors: Vec::new(),
        }
    }

    fn record(mut self, outcome: Result<UserRecord, RecordError>) -> Self {
        match outcome {
            Ok(_) => self.processed += 1,
            Err(err) => self.errors.push(err.to_string()),
        }
        self
    }
}

/// Change Extractor: every record modified strictly after `raw_cursor`.
///
/// # Errors
/// Returns [`SyncError::InvalidCursor`] before touching the store when the
/// cursor does not parse, and a store error when the query fails.
pub fn find_changed_since<S>(store: &S, raw_cursor: &str) -> Result<ChangeSet, SyncError>
where
    S: UserStore + ?Sized,
{
    let cursor = parse_cursor(raw_cursor)?;
    changed_since(store, cursor)
}

/// # Errors
/// Returns a store error when the query fails.
pub fn changed_since<S>(store: &S, cursor: Timestamp) -> Result<ChangeSet, SyncError>
where
    S: UserStore + ?Sized,
{
    let mut records = store.changed_since(cursor)?;
    records.retain(|record| record.updated_at > cursor);
    records.sort_by_key(|record| (record.updated_at, record.id));

    let users: Vec<ExternalUser> = records.into_iter().map(ExternalUser::from).collect();
    debug!(%cursor, count = users.len(), "extracted changed users");
    Ok(ChangeSet {
        count: users.len(),
        users,
    })
}

/// Diagnostic listing, newest first. Unbounded.
///
/// # Errors
/// Returns a store error when the query fails.
pub fn list_all<S>(store: &S) -> Result<UserListing, SyncError>
where
    S: UserStore + ?Sized,
{
    let mut records = store.list_all()?;
    records.sort_by_key(|record| Reverse((record.updated_at, record.id)));

    let users: Vec<UserView> = records.into_iter().map(UserView::from).collect();
    Ok(UserListing {
        count: users.len(),
        users,
    })
}

/// Checks the batch envelope and returns its records.
///
/// # Errors
/// Returns [`SyncError::InvalidBatch`] when `users` is absent, not an array,
/// or empty.
pub fn batch_records(users: Option<&Value>) -> Result<&[Value], SyncError> {
    match users {
        None | Some(Value::Null) => Err(SyncError::InvalidBatch(format!(
            "{} array is required",
            fields::USERS
        ))),
        Some(Value::Array(records)) if records.is_empty() => Err(SyncError::InvalidBatch(
            format!("{} array must not be empty", fields::USERS),
        )),
        Some(Value::Array(records)) => Ok(records),
        Some(_) => Err(SyncError::InvalidBatch(format!(
            "{} must be an array",
            fields::USERS
        ))),
    }
}

/// Merge Applier: validates and upserts each record in input order.
///
/// Per-record failures land in [`BatchResult::errors`]; only an invalid
/// envelope fails the call.
///
/// # Errors
/// Returns [`SyncError::InvalidBatch`] when the envelope is invalid. Nothing
/// is written in that case.
pub fn apply_batch<S>(
    store: &mut S,
    clock: &dyn Clock,
    users: Option<&Value>,
) -> Result<BatchResult, SyncError>
where
    S: UserStore + ?Sized,
{
    let records = batch_records(users)?;

    let result = records
        .iter()
        .enumerate()
        .fold(BatchResult::empty(records.len()), |acc, (index, raw)| {
            let outcome = validate_record(index, raw)
                .and_then(|record| apply_record(store, clock, &record));
            match &outcome {
                Ok(applied) => debug!(
                    external_id = %applied.external_id,
                    updated_at = %applied.updated_at,
                    "applied user"
                ),
                Err(err) => warn!(index, error = %err, "user not applied"),
            }
            acc.record(outcome)
        });

    info!(
        processed = result.processed,
        total = result.total,
        failed = result.errors.len(),
        "batch complete"
    );
    Ok(result)
}

/// Upserts one validated record.
///
/// # Errors
/// Returns [`RecordError::Persistence`] tagged with the external id.
pub fn apply_record<S>(
    store: &mut S,
    clock: &dyn Clock,
    record: &ValidatedRecord,
) -> Result<UserRecord, RecordError>
where
    S: UserStore + ?Sized,
{
    upsert(store, clock, record).map_err(|cause| RecordError::Persistence {
        external_id: record.external_id.clone(),
        cause,
    })
}

fn upsert<S>(
    store: &mut S,
    clock: &dyn Clock,
    record: &ValidatedRecord,
) -> Result<UserRecord, StoreError>
where
    S: UserStore + ?Sized,
{
    if let Some(existing) = store.find_by_external_id(&record.external_id)? {
        return overwrite(store, clock, &existing, &record.fields);
    }

    match store.insert(record, clock.now()) {
        Err(StoreError::Conflict(detail)) => {
            // A concurrent writer created the row between lookup and insert.
            debug!(external_id = %record.external_id, "insert lost race, updating instead");
            let existing = store
                .find_by_external_id(&record.external_id)?
                .ok_or(StoreError::Conflict(detail))?;
            overwrite(store, clock, &existing, &record.fields)
        }
        other => other,
    }
}

fn overwrite<S>(
    store: &mut S,
    clock: &dyn Clock,
    existing: &UserRecord,
    fields: &UserFields,
) -> Result<UserRecord, StoreError>
where
    S: UserStore + ?Sized,
{
    let updated_at = next_modification(Some(existing.updated_at), clock.now());
    store.update(existing.id, fields, updated_at)
}

/// Schema validation for one raw element of the `users` array.
///
/// # Errors
/// Returns [`RecordError::Validation`] naming the record index, the reason,
/// and the offending JSON.
pub fn validate_record(index: usize, raw: &Value) -> Result<ValidatedRecord, RecordError> {
    let invalid = |reason: String| RecordError::Validation {
        index,
        reason,
        record: raw.to_string(),
    };

    let Value::Object(object) = raw else {
        return Err(invalid("record is not a JSON object".to_string()));
    };

    let external_id = optional_text(object.get(fields::EXTERNAL_ID))
        .map_err(|kind| invalid(format!("{} must be a string, got {kind}", fields::EXTERNAL_ID)))?
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .ok_or_else(|| invalid(format!("missing {}", fields::EXTERNAL_ID)))?;

    let text = |name: &'static str| {
        optional_text(object.get(name))
            .map_err(|kind| invalid(format!("{name} must be a string, got {kind}")))
    };

    let attributes = UserFields {
        email: text(fields::EMAIL)?,
        first_name: text(fields::FIRST_NAME)?,
        last_name: text(fields::LAST_NAME)?,
        phone: text(fields::PHONE)?,
        deleted: deleted_flag(object.get(fields::DELETED)).map_err(|kind| {
            invalid(format!("{} must be a boolean, got {kind}", fields::DELETED))
        })?,
    };

    Ok(ValidatedRecord {
        external_id,
        fields: attributes,
    })
}

/// Absent, null and empty strings normalize to `None`. Other strings are kept verbatim.
fn optional_text(value: Option<&Value>) -> Result<Option<String>, &'static str> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(text)) if text.is_empty() => Ok(None),
        Some(Value::String(text)) => Ok(Some(text.clone())),
        Some(Value::Number(number)) => Ok(Some(number.to_string())),
        Some(other) => Err(json_kind(other)),
    }
}

fn deleted_flag(value: Option<&Value>) -> Result<bool, &'static str> {
    match value {
        None | Some(Value::Null) => Ok(false),
        Some(Value::Bool(flag)) => Ok(*flag),
        Some(Value::Number(number)) => match number.as_u64() {
            Some(0) => Ok(false),
            Some(1) => Ok(true),
            _ => Err("number"),
        },
        Some(other) => Err(json_kind(other)),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
