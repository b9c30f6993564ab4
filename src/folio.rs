//! Folio and sequential-id allocation.
//!
//! Sequential values are computed as `max + 1` over the stored column. The
//! caller must run the allocation inside the same `BEGIN IMMEDIATE`
//! transaction as the insert that uses it; SQLite then serializes writers and
//! two terminals can no longer hand out the same number. The folio columns
//! also carry UNIQUE indexes, so a duplicate is rejected by the store.

use rand::Rng;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::warn;

use crate::error::{AppError, AppResult};

/// Attempts made by the random fallback before giving up.
const RANDOM_FOLIO_ATTEMPTS: usize = 20;

/// Columns that hold sequential numbers. Closed set: table and column names
/// are interpolated into SQL, so they never come from callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceColumn {
    ProgramFolio,
    HistoryFolio,
    AccessId,
}

impl SequenceColumn {
    fn table(self) -> &'static str {
        match self {
            Self::ProgramFolio => "loyalty_programs",
            Self::HistoryFolio => "order_history",
            Self::AccessId => "client_access_credentials",
        }
    }

    fn column(self) -> &'static str {
        match self {
            Self::ProgramFolio | Self::HistoryFolio => "folio",
            Self::AccessId => "access_id",
        }
    }
}

/// Highest stored numeric value plus one, or `base` when nothing is stored.
pub fn next_sequential(conn: &Connection, seq: SequenceColumn, base: i64) -> AppResult<i64> {
    let sql = format!(
        "SELECT {col} FROM {table}
         WHERE {col} IS NOT NULL AND TRIM({col}) != ''
         ORDER BY CAST({col} AS INTEGER) DESC
         LIMIT 1",
        col = seq.column(),
        table = seq.table(),
    );
    let max: Option<String> = conn.query_row(&sql, [], |row| row.get(0)).optional()?;

    let parsed = max.as_deref().and_then(last_digit_run).and_then(|digits| digits.parse::<i64>().ok());
    Ok(match parsed {
        Some(n) => n + 1,
        None => base,
    })
}

/// Next folio as a zero-padded string.
///
/// Falls back to an unused random 3-digit folio when the max query fails.
pub fn allocate_folio(conn: &Connection, seq: SequenceColumn, base: i64) -> AppResult<String> {
    match next_sequential(conn, seq, base) {
        Ok(n) => Ok(to_folio_string(n)),
        Err(e) => {
            warn!(table = seq.table(), error = %e, "Sequential folio query failed, using random folio");
            random_unused_folio(conn, seq)
        }
    }
}

fn random_unused_folio(conn: &Connection, seq: SequenceColumn) -> AppResult<String> {
    let sql = format!(
        "SELECT 1 FROM {table} WHERE {col} = ?1 LIMIT 1",
        table = seq.table(),
        col = seq.column(),
    );
    for _ in 0..RANDOM_FOLIO_ATTEMPTS {
        let candidate = random_folio();
        let taken: Option<i64> = conn
            .query_row(&sql, params![candidate], |row| row.get(0))
            .optional()?;
        if taken.is_none() {
            return Ok(candidate);
        }
    }
    Err(AppError::conflict("Could not find a free folio, try again"))
}

/// Uniformly random folio in `[1, 999]`, zero-padded to 3 digits.
pub fn random_folio() -> String {
    let n: i64 = rand::rng().random_range(1..=999);
    to_folio_string(n)
}

pub fn to_folio_string(n: i64) -> String {
    format!("{n:03}")
}

/// Normalize a stored folio for display: the last run of digits, left-padded
/// with zeros to 3 characters or cut to its last 3. No digits gives `""`.
pub fn format_folio(raw: &str) -> String {
    let Some(digits) = last_digit_run(raw) else {
        return String::new();
    };
    if digits.len() >= 3 {
        digits[digits.len() - 3..].to_string()
    } else {
        format!("{digits:0>3}")
    }
}

fn last_digit_run(raw: &str) -> Option<&str> {
    let bytes = raw.as_bytes();
    let end = bytes.iter().rposition(u8::is_ascii_digit)? + 1;
    let start = bytes[..end]
        .iter()
        .rposition(|b| !b.is_ascii_digit())
        .map(|i| i + 1)
        .unwrap_or(0);
    Some(&raw[start..end])
}
