//! Standalone query functions that work with any Connection.
//!
//! Each function takes a `&Connection` as its first parameter so it can run
//! on a plain connection in tests or inside [`crate::ExceptionStore::call`].

use crate::models::{format_timestamp, parse_timestamp};
use crate::{ExceptionRecord, NewExceptionRecord, Severity, StoreError, StoreResult};
use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection, Row};
use tracing::debug;

const RECORD_COLUMNS: &str = "id, service_name, severity, message, occurred_at, security_id, processed_at, stacktrace, correlation_id";

/// Column values as read from SQLite, before validation.
struct RawRecord {
    id: i64,
    service_name: String,
    severity: String,
    message: String,
    occurred_at: String,
    security_id: String,
    processed_at: Option<String>,
    stacktrace: Option<String>,
    correlation_id: Option<String>,
}

impl RawRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            service_name: row.get(1)?,
            severity: row.get(2)?,
            message: row.get(3)?,
            occurred_at: row.get(4)?,
            security_id: row.get(5)?,
            processed_at: row.get(6)?,
            stacktrace: row.get(7)?,
            correlation_id: row.get(8)?,
        })
    }

    fn into_record(self) -> StoreResult<ExceptionRecord> {
        let severity = Severity::parse(&self.severity).ok_or_else(|| {
            StoreError::InvalidData(format!(
                "record {} has unknown severity {:?}",
                self.id, self.severity
            ))
        })?;
        let occurred_at = parse_timestamp(&self.occurred_at).ok_or_else(|| {
            StoreError::InvalidData(format!(
                "record {} has invalid occurred_at {:?}",
                self.id, self.occurred_at
            ))
        })?;
        let processed_at = match self.processed_at {
            Some(raw) => Some(parse_timestamp(&raw).ok_or_else(|| {
                StoreError::InvalidData(format!(
                    "record {} has invalid processed_at {:?}",
                    self.id, raw
                ))
            })?),
            None => None,
        };

        Ok(ExceptionRecord {
            id: self.id,
            service_name: self.service_name,
            severity,
            message: self.message,
            occurred_at,
            security_id: self.security_id,
            processed_at,
            stacktrace: self.stacktrace,
            correlation_id: self.correlation_id,
        })
    }
}

/// Insert a new exception record and return it with its assigned id.
pub fn insert_record(conn: &Connection, record: &NewExceptionRecord) -> StoreResult<ExceptionRecord> {
    conn.execute(
        "INSERT INTO exception_record (service_name, severity, message, occurred_at, security_id, stacktrace, correlation_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            record.service_name,
            record.severity.as_str(),
            record.message,
            format_timestamp(&record.occurred_at),
            record.security_id,
            record.stacktrace,
            record.correlation_id,
        ],
    )?;
    let id = conn.last_insert_rowid();
    get_record(conn, id)?
        .ok_or_else(|| StoreError::NotFound(format!("exception record {} after insert", id)))
}

/// Get a record by id.
pub fn get_record(conn: &Connection, id: i64) -> StoreResult<Option<ExceptionRecord>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {RECORD_COLUMNS} FROM exception_record WHERE id = ?1"
    ))?;

    let result = stmt.query_row(params![id], RawRecord::from_row);
    match result {
        Ok(raw) => Ok(Some(raw.into_record()?)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Head of the pending set for a subject key, oldest occurrence first.
///
/// There is deliberately no offset: callers re-read the head after each
/// commit, because committed rows leave the `processed_at IS NULL` predicate.
pub fn pending_page(
    conn: &Connection,
    security_id: &str,
    limit: usize,
) -> StoreResult<Vec<ExceptionRecord>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {RECORD_COLUMNS} FROM exception_record
         WHERE security_id = ?1 AND processed_at IS NULL
         ORDER BY occurred_at ASC, id ASC
         LIMIT ?2"
    ))?;

    let raw = stmt
        .query_map(params![security_id, limit as i64], RawRecord::from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    raw.into_iter().map(RawRecord::into_record).collect()
}

/// Number of pending records for a subject key.
pub fn count_pending(conn: &Connection, security_id: &str) -> StoreResult<usize> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM exception_record WHERE security_id = ?1 AND processed_at IS NULL",
        params![security_id],
        |row| row.get(0),
    )?;
    Ok(count as usize)
}

/// Ids bound per UPDATE; SQLite allows at most 32766 variables per statement.
pub const MARK_CHUNK_SIZE: usize = 32_000;

/// Stamp a batch of records as processed in one transaction.
///
/// Only rows that are still pending are touched, so the first commit's
/// timestamp wins. Large batches are split into several statements inside
/// the same transaction. Returns the number of rows updated.
pub fn mark_processed(
    conn: &Connection,
    ids: &[i64],
    processed_at: &DateTime<Utc>,
) -> StoreResult<usize> {
    mark_processed_chunked(conn, ids, processed_at, MARK_CHUNK_SIZE)
}

fn mark_processed_chunked(
    conn: &Connection,
    ids: &[i64],
    processed_at: &DateTime<Utc>,
    chunk_size: usize,
) -> StoreResult<usize> {
    if ids.is_empty() {
        return Ok(0);
    }

    let stamp = format_timestamp(processed_at);
    let tx = conn.unchecked_transaction()?;
    let mut updated = 0;
    for chunk in ids.chunks(chunk_size.max(1)) {
        let placeholders = vec!["?"; chunk.len()].join(", ");
        let sql = format!(
            "UPDATE exception_record SET processed_at = ? WHERE processed_at IS NULL AND id IN ({placeholders})"
        );
        let mut stmt = tx.prepare(&sql)?;
        let values = std::iter::once(rusqlite::types::Value::Text(stamp.clone()))
            .chain(chunk.iter().map(|id| rusqlite::types::Value::Integer(*id)));
        updated += stmt.execute(params_from_iter(values))?;
    }
    tx.commit()?;

    debug!(requested = ids.len(), updated, "Marked records processed");
    Ok(updated)
}
