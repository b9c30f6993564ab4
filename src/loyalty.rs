//! Loyalty meters ledger.
//!
//! A customer buys a package of meters (`loyalty_programs`); every job
//! printed against it appends an immutable row to `order_history`. The
//! program keeps a running `remaining_meters` counter for fast reads, but the
//! history is the source of truth: [`reconcile_program`] re-derives the
//! counter as `total - sum(history)` and overwrites it when they drift.
//!
//! Manual corrections are written to the same log as signed `ajuste` rows so
//! a later reconciliation does not undo them.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::data_helpers::like_contains;
use crate::db::DbState;
use crate::error::{AppError, AppResult};
use crate::folio::{self, SequenceColumn};
use crate::round2;
use crate::session::Session;

/// Stored and derived balances closer than this are considered equal.
pub const RECONCILE_EPSILON: f64 = 0.001;

const DEFAULT_HISTORY_LIMIT: i64 = 500;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgramStatus {
    Activo,
    Completado,
    Expirado,
}

impl ProgramStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Activo => "activo",
            Self::Completado => "completado",
            Self::Expirado => "expirado",
        }
    }
}

impl fmt::Display for ProgramStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProgramStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "activo" => Ok(Self::Activo),
            "completado" => Ok(Self::Completado),
            "expirado" => Ok(Self::Expirado),
            other => Err(AppError::validation(format!("Unknown program status: {other}"))),
        }
    }
}

impl ToSql for ProgramStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for ProgramStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let raw = value.as_str()?;
        raw.parse().map_err(|e: AppError| FromSqlError::Other(Box::new(e)))
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LoyaltyProgram {
    pub id: String,
    pub customer_id: String,
    pub customer_name: Option<String>,
    pub program_type: String,
    pub total_meters: f64,
    pub remaining_meters: f64,
    pub status: ProgramStatus,
    pub purchase_date: String,
    pub folio: Option<String>,
    pub completed_at: Option<String>,
    pub edit_reason: Option<String>,
    pub edited_by: Option<String>,
    pub edited_at: Option<String>,
    pub notes: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    /// Most recent history row for this program, if any.
    pub last_activity_at: Option<String>,
}

/// Program plus the status the desk should display.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgramView {
    #[serde(flatten)]
    pub program: LoyaltyProgram,
    pub display_status: ProgramStatus,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryType {
    #[default]
    Consumo,
    Ajuste,
}

impl EntryType {
    fn as_str(self) -> &'static str {
        match self {
            Self::Consumo => "consumo",
            Self::Ajuste => "ajuste",
        }
    }
}

impl FromSql for EntryType {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value.as_str()? {
            "consumo" => Ok(Self::Consumo),
            "ajuste" => Ok(Self::Ajuste),
            _ => Err(FromSqlError::InvalidType),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRecord {
    pub id: String,
    pub program_id: String,
    pub customer_id: String,
    pub folio: Option<String>,
    pub entry_type: EntryType,
    pub meters_consumed: f64,
    pub remaining_before: f64,
    pub remaining_after: f64,
    pub recorded_by: String,
    pub register_id: Option<String>,
    pub notes: Option<String>,
    pub recorded_at: String,
    pub customer_name: Option<String>,
    pub program_type: Option<String>,
    pub program_folio: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewProgram {
    #[serde(alias = "customer_id")]
    pub customer_id: String,
    #[serde(alias = "program_type", alias = "type")]
    pub program_type: String,
    #[serde(alias = "total_meters")]
    pub total_meters: f64,
    #[serde(default, alias = "purchase_date")]
    pub purchase_date: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default = "default_true", alias = "assign_folio")]
    pub assign_folio: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumptionInput {
    #[serde(alias = "program_id")]
    pub program_id: String,
    pub meters: f64,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgramAdjustment {
    #[serde(default, alias = "total_meters")]
    pub total_meters: Option<f64>,
    #[serde(default, alias = "remaining_meters")]
    pub remaining_meters: Option<f64>,
    pub reason: String,
    #[serde(alias = "authorized_by")]
    pub authorized_by: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgramFilter {
    #[serde(default, alias = "customer_id")]
    pub customer_id: Option<String>,
    #[serde(default)]
    pub status: Option<ProgramStatus>,
    #[serde(default)]
    pub search: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryFilter {
    #[serde(default, alias = "date_from")]
    pub date_from: Option<String>,
    #[serde(default, alias = "date_to")]
    pub date_to: Option<String>,
    #[serde(default)]
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileOutcome {
    pub program_id: String,
    pub consumed_total: f64,
    pub stored_remaining: f64,
    pub expected_remaining: f64,
    pub corrected: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumptionReceipt {
    pub program: LoyaltyProgram,
    pub history: HistoryRecord,
    /// `None` when the post-write reconciliation failed (logged, not fatal).
    pub reconciled: Option<ReconcileOutcome>,
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

const PROGRAM_SELECT: &str = "
    SELECT p.id, p.customer_id, c.name, p.program_type, p.total_meters, p.remaining_meters,
           p.status, p.purchase_date, p.folio, p.completed_at, p.edit_reason, p.edited_by,
           p.edited_at, p.notes, p.created_at, p.updated_at,
           (SELECT MAX(h.recorded_at) FROM order_history h WHERE h.program_id = p.id)
    FROM loyalty_programs p
    LEFT JOIN customers_ c ON c.id = p.customer_id";

fn program_from_row(row: &rusqlite::Row) -> rusqlite::Result<LoyaltyProgram> {
    Ok(LoyaltyProgram {
        id: row.get(0)?,
        customer_id: row.get(1)?,
        customer_name: row.get(2)?,
        program_type: row.get(3)?,
        total_meters: row.get(4)?,
        remaining_meters: row.get(5)?,
        status: row.get(6)?,
        purchase_date: row.get(7)?,
        folio: row.get(8)?,
        completed_at: row.get(9)?,
        edit_reason: row.get(10)?,
        edited_by: row.get(11)?,
        edited_at: row.get(12)?,
        notes: row.get(13)?,
        created_at: row.get(14)?,
        updated_at: row.get(15)?,
        last_activity_at: row.get(16)?,
    })
}

const HISTORY_SELECT: &str = "
    SELECT h.id, h.program_id, h.customer_id, h.folio, h.entry_type, h.meters_consumed,
           h.remaining_before, h.remaining_after, h.recorded_by, h.register_id, h.notes,
           h.recorded_at, c.name, p.program_type, p.folio
    FROM order_history h
    LEFT JOIN loyalty_programs p ON p.id = h.program_id
    LEFT JOIN customers_ c ON c.id = h.customer_id";

fn history_from_row(row: &rusqlite::Row) -> rusqlite::Result<HistoryRecord> {
    Ok(HistoryRecord {
        id: row.get(0)?,
        program_id: row.get(1)?,
        customer_id: row.get(2)?,
        folio: row.get(3)?,
        entry_type: row.get(4)?,
        meters_consumed: row.get(5)?,
        remaining_before: row.get(6)?,
        remaining_after: row.get(7)?,
        recorded_by: row.get(8)?,
        register_id: row.get(9)?,
        notes: row.get(10)?,
        recorded_at: row.get(11)?,
        customer_name: row.get(12)?,
        program_type: row.get(13)?,
        program_folio: row.get(14)?,
    })
}

pub(crate) fn get_program_with(conn: &Connection, id: &str) -> AppResult<LoyaltyProgram> {
    conn.query_row(
        &format!("{PROGRAM_SELECT} WHERE p.id = ?1"),
        params![id],
        program_from_row,
    )
    .optional()?
    .ok_or_else(|| AppError::not_found("loyalty program", id))
}

pub(crate) fn get_history_with(conn: &Connection, id: &str) -> AppResult<HistoryRecord> {
    conn.query_row(
        &format!("{HISTORY_SELECT} WHERE h.id = ?1"),
        params![id],
        history_from_row,
    )
    .optional()?
    .ok_or_else(|| AppError::not_found("history record", id))
}

fn clean_text(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

// ---------------------------------------------------------------------------
// Programs
// ---------------------------------------------------------------------------

/// Open a new meters package for a customer.
pub fn create_program(
    db: &DbState,
    session: &Session,
    input: &NewProgram,
    folio_base: i64,
) -> AppResult<LoyaltyProgram> {
    let program_type = input.program_type.trim();
    if program_type.is_empty() {
        return Err(AppError::validation("Program type is required"));
    }
    if !input.total_meters.is_finite() || input.total_meters <= 0.0 {
        return Err(AppError::validation("Total meters must be greater than zero"));
    }
    let total = round2(input.total_meters);

    let purchase_date = match clean_text(input.purchase_date.as_deref()) {
        Some(raw) => {
            parse_timestamp(&raw)
                .ok_or_else(|| AppError::validation(format!("Invalid purchase date: {raw}")))?;
            raw
        }
        None => Utc::now().format("%Y-%m-%d").to_string(),
    };

    let mut conn = db.lock()?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let customer_exists: Option<i64> = tx
        .query_row(
            "SELECT 1 FROM customers_ WHERE id = ?1",
            params![input.customer_id],
            |row| row.get(0),
        )
        .optional()?;
    if customer_exists.is_none() {
        return Err(AppError::not_found("customer", input.customer_id.as_str()));
    }

    let folio = if input.assign_folio {
        Some(folio::allocate_folio(&tx, SequenceColumn::ProgramFolio, folio_base)?)
    } else {
        None
    };

    let id = Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();
    tx.execute(
        "INSERT INTO loyalty_programs (
            id, customer_id, program_type, total_meters, remaining_meters, status,
            purchase_date, folio, notes, created_at, updated_at
         ) VALUES (?1, ?2, ?3, ?4, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
        params![
            id,
            input.customer_id,
            program_type,
            total,
            ProgramStatus::Activo,
            purchase_date,
            folio,
            clean_text(input.notes.as_deref()),
            now,
        ],
    )?;
    let program = get_program_with(&tx, &id)?;
    tx.commit()?;

    info!(
        program_id = %id,
        customer_id = %input.customer_id,
        folio = ?program.folio,
        total_meters = total,
        operator = %session.operator_name,
        "Loyalty program created"
    );
    Ok(program)
}

pub fn get_program(db: &DbState, id: &str) -> AppResult<LoyaltyProgram> {
    let conn = db.lock()?;
    get_program_with(&conn, id)
}

/// Programs matching the filter, with the inferred display status.
pub fn list_programs(
    db: &DbState,
    filter: &ProgramFilter,
    expiry_days: i64,
) -> AppResult<Vec<ProgramView>> {
    let search = clean_text(filter.search.as_deref()).unwrap_or_default();
    let pattern = like_contains(&search);
    let status = filter.status.map(ProgramStatus::as_str).unwrap_or("");
    let customer_id = clean_text(filter.customer_id.as_deref()).unwrap_or_default();

    let conn = db.lock()?;
    let mut stmt = conn.prepare(&format!(
        "{PROGRAM_SELECT}
         WHERE (?1 = '' OR p.customer_id = ?1)
           AND (?2 = '' OR p.status = ?2)
           AND (?3 = '' OR c.name LIKE ?4 ESCAPE '\\' COLLATE NOCASE
                OR p.folio LIKE ?4 ESCAPE '\\'
                OR p.program_type LIKE ?4 ESCAPE '\\' COLLATE NOCASE)
         ORDER BY p.created_at DESC"
    ))?;
    let rows = stmt.query_map(params![customer_id, status, search, pattern], program_from_row)?;

    let now = Utc::now();
    let mut views = Vec::new();
    for row in rows {
        let program = row?;
        let display_status = effective_status(&program, now, expiry_days);
        views.push(ProgramView {
            program,
            display_status,
        });
    }
    Ok(views)
}

/// Status shown to the operator.
///
/// A stored status other than `activo` is shown as is. An `activo` program
/// with no activity (last history row, else purchase date) in the last
/// `expiry_days` days is shown as `expirado`. Nothing is persisted.
pub fn effective_status(
    program: &LoyaltyProgram,
    now: DateTime<Utc>,
    expiry_days: i64,
) -> ProgramStatus {
    if program.status != ProgramStatus::Activo || expiry_days <= 0 {
        return program.status;
    }
    let last_activity = program
        .last_activity_at
        .as_deref()
        .and_then(parse_timestamp)
        .or_else(|| parse_timestamp(&program.purchase_date));
    match last_activity {
        Some(at) if now.signed_duration_since(at).num_days() >= expiry_days => {
            ProgramStatus::Expirado
        }
        _ => program.status,
    }
}

/// Accepts RFC 3339, SQLite `datetime()` output, or a bare `YYYY-MM-DD`.
pub(crate) fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        return Some(naive.and_utc());
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Explicit status change from the back office.
pub fn set_status(db: &DbState, id: &str, status: ProgramStatus) -> AppResult<LoyaltyProgram> {
    let conn = db.lock()?;
    let program = get_program_with(&conn, id)?;
    if program.status == status {
        return Ok(program);
    }

    match status {
        ProgramStatus::Activo if program.remaining_meters <= 0.0 => {
            return Err(AppError::conflict(
                "A program without remaining meters cannot be reactivated",
            ));
        }
        ProgramStatus::Completado if program.remaining_meters > 0.0 => {
            return Err(AppError::conflict(
                "A program with remaining meters cannot be marked as completed",
            ));
        }
        _ => {}
    }

    let now = Utc::now().to_rfc3339();
    conn.execute(
        "UPDATE loyalty_programs
         SET status = ?1,
             completed_at = CASE WHEN ?1 = 'completado' THEN COALESCE(completed_at, ?2) ELSE completed_at END,
             updated_at = ?2
         WHERE id = ?3",
        params![status, now, id],
    )?;
    info!(program_id = %id, from = %program.status, to = %status, "Program status changed");

    get_program_with(&conn, id)
}

// ---------------------------------------------------------------------------
// Consumption
// ---------------------------------------------------------------------------

/// Register meters printed against a program.
///
/// The counter update and the history row are written in one transaction.
/// The reconciliation pass that follows is best effort: its failure is
/// logged and the committed consumption is still reported as a success.
pub fn register_consumption(
    db: &DbState,
    session: &Session,
    input: &ConsumptionInput,
    folio_base: i64,
) -> AppResult<ConsumptionReceipt> {
    if !input.meters.is_finite() {
        return Err(AppError::validation("Meters must be greater than zero"));
    }
    // The logged amount and the counter move by the same cent-rounded value.
    let meters = round2(input.meters);
    if meters <= 0.0 {
        return Err(AppError::validation(
            "Meters must be at least 0.01 after rounding to cents",
        ));
    }

    let mut conn = db.lock()?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let program = get_program_with(&tx, &input.program_id)?;
    if program.status != ProgramStatus::Activo {
        return Err(AppError::conflict(format!(
            "Program {} is {}, consumption is only allowed on active programs",
            program.folio.as_deref().unwrap_or(&program.id),
            program.status
        )));
    }
    if meters > program.remaining_meters {
        return Err(AppError::validation(format!(
            "Cannot consume {meters} m: only {} m remaining",
            program.remaining_meters
        )));
    }

    let new_remaining = round2(program.remaining_meters - meters).max(0.0);
    let completed = new_remaining <= 0.0;
    let new_status = if completed {
        ProgramStatus::Completado
    } else {
        program.status
    };
    let now = Utc::now().to_rfc3339();

    tx.execute(
        "UPDATE loyalty_programs
         SET remaining_meters = ?1,
             status = ?2,
             completed_at = CASE WHEN ?3 = 1 THEN ?4 ELSE completed_at END,
             updated_at = ?4
         WHERE id = ?5",
        params![new_remaining, new_status, completed as i64, now, program.id],
    )?;

    let history_id = Uuid::new_v4().to_string();
    let history_folio = folio::allocate_folio(&tx, SequenceColumn::HistoryFolio, folio_base)?;
    tx.execute(
        "INSERT INTO order_history (
            id, program_id, customer_id, folio, entry_type, meters_consumed,
            remaining_before, remaining_after, recorded_by, register_id, notes, recorded_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            history_id,
            program.id,
            program.customer_id,
            history_folio,
            EntryType::Consumo.as_str(),
            meters,
            program.remaining_meters,
            new_remaining,
            session.operator_name,
            session.register_id,
            clean_text(input.notes.as_deref()),
            now,
        ],
    )?;
    let history = get_history_with(&tx, &history_id)?;
    tx.commit()?;

    info!(
        program_id = %program.id,
        history_id = %history_id,
        meters,
        remaining = new_remaining,
        completed,
        operator = %session.operator_name,
        "Consumption registered"
    );

    let reconciled = match reconcile_program(&conn, &program.id) {
        Ok(outcome) => Some(outcome),
        Err(e) => {
            warn!(program_id = %program.id, error = %e, "Post-consumption reconciliation failed");
            None
        }
    };

    let program = match get_program_with(&conn, &program.id) {
        Ok(p) => p,
        Err(e) => {
            warn!(program_id = %program.id, error = %e, "Re-read after consumption failed");
            LoyaltyProgram {
                remaining_meters: new_remaining,
                status: new_status,
                completed_at: if completed {
                    Some(now.clone())
                } else {
                    program.completed_at.clone()
                },
                last_activity_at: Some(now.clone()),
                updated_at: now,
                ..program
            }
        }
    };

    Ok(ConsumptionReceipt {
        program,
        history,
        reconciled,
    })
}

// ---------------------------------------------------------------------------
// Reconciliation
// ---------------------------------------------------------------------------

/// Re-derive `remaining_meters` from the history and fix the stored counter
/// when it differs by more than [`RECONCILE_EPSILON`].
pub fn reconcile_program(conn: &Connection, program_id: &str) -> AppResult<ReconcileOutcome> {
    let (total, stored, status): (f64, f64, ProgramStatus) = conn
        .query_row(
            "SELECT total_meters, remaining_meters, status FROM loyalty_programs WHERE id = ?1",
            params![program_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?
        .ok_or_else(|| AppError::not_found("loyalty program", program_id))?;

    let consumed: f64 = conn.query_row(
        "SELECT COALESCE(SUM(meters_consumed), 0) FROM order_history WHERE program_id = ?1",
        params![program_id],
        |row| row.get(0),
    )?;
    let consumed = round2(consumed);

    let derived = round2(total - consumed);
    if derived < 0.0 {
        warn!(
            program_id,
            total, consumed, "History exceeds the package size; clamping remaining to zero"
        );
    }
    let expected = derived.max(0.0);

    let corrected = (expected - stored).abs() > RECONCILE_EPSILON;
    if corrected {
        let new_status = match status {
            ProgramStatus::Activo if expected <= 0.0 => ProgramStatus::Completado,
            ProgramStatus::Completado if expected > 0.0 => ProgramStatus::Activo,
            other => other,
        };
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "UPDATE loyalty_programs
             SET remaining_meters = ?1,
                 status = ?2,
                 completed_at = CASE
                     WHEN ?2 = 'completado' THEN COALESCE(completed_at, ?3)
                     WHEN ?2 = 'activo' THEN NULL
                     ELSE completed_at END,
                 updated_at = ?3
             WHERE id = ?4",
            params![expected, new_status, now, program_id],
        )?;
        warn!(
            program_id,
            stored,
            expected,
            consumed,
            status = %new_status,
            "Remaining meters drifted from history; corrected"
        );
    } else {
        debug!(program_id, remaining = stored, "Program balance consistent");
    }

    Ok(ReconcileOutcome {
        program_id: program_id.to_string(),
        consumed_total: consumed,
        stored_remaining: stored,
        expected_remaining: expected,
        corrected,
    })
}

/// Reconcile every program; returns only the corrected ones.
pub fn reconcile_all(db: &DbState) -> AppResult<Vec<ReconcileOutcome>> {
    let conn = db.lock()?;
    let ids: Vec<String> = {
        let mut stmt = conn.prepare("SELECT id FROM loyalty_programs ORDER BY created_at")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        rows.collect::<Result<Vec<_>, _>>()?
    };

    let mut corrections = Vec::new();
    for id in &ids {
        match reconcile_program(&conn, id) {
            Ok(outcome) if outcome.corrected => corrections.push(outcome),
            Ok(_) => {}
            Err(e) => warn!(program_id = %id, error = %e, "Reconciliation failed"),
        }
    }

    info!(
        programs = ids.len(),
        corrected = corrections.len(),
        "Reconciliation sweep finished"
    );
    Ok(corrections)
}

// ---------------------------------------------------------------------------
// Manual corrections
// ---------------------------------------------------------------------------

/// Manual correction of a program's size and/or balance.
///
/// The new total applies directly. A requested remaining balance is
/// recorded as a signed `ajuste` history row (positive = meters taken,
/// negative = meters returned) so reconciliation keeps it.
pub fn adjust_program(
    db: &DbState,
    session: &Session,
    id: &str,
    adjustment: &ProgramAdjustment,
) -> AppResult<LoyaltyProgram> {
    let reason = clean_text(Some(&adjustment.reason))
        .ok_or_else(|| AppError::validation("An edit reason is required"))?;
    let authorized_by = clean_text(Some(&adjustment.authorized_by))
        .ok_or_else(|| AppError::validation("The authorizing person is required"))?;

    let mut conn = db.lock()?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let program = get_program_with(&tx, id)?;

    let new_total = match adjustment.total_meters {
        Some(t) if !t.is_finite() || t <= 0.0 => {
            return Err(AppError::validation("Total meters must be greater than zero"));
        }
        Some(t) => round2(t),
        None => program.total_meters,
    };

    let logged: f64 = tx.query_row(
        "SELECT COALESCE(SUM(meters_consumed), 0) FROM order_history WHERE program_id = ?1",
        params![id],
        |row| row.get(0),
    )?;
    let derived_remaining = round2(new_total - logged);

    let new_remaining = match adjustment.remaining_meters {
        Some(r) if !r.is_finite() => {
            return Err(AppError::validation("Remaining meters must be a number"));
        }
        Some(r) => round2(r),
        None => derived_remaining,
    };
    if new_remaining < 0.0 {
        return Err(AppError::validation("Remaining meters cannot be negative"));
    }
    if new_remaining > new_total {
        return Err(AppError::validation(format!(
            "Remaining meters ({new_remaining}) cannot exceed total meters ({new_total})"
        )));
    }

    let now = Utc::now().to_rfc3339();
    let ledger_delta = round2(derived_remaining - new_remaining);
    if ledger_delta.abs() > RECONCILE_EPSILON {
        tx.execute(
            "INSERT INTO order_history (
                id, program_id, customer_id, folio, entry_type, meters_consumed,
                remaining_before, remaining_after, recorded_by, register_id, notes, recorded_at
             ) VALUES (?1, ?2, ?3, NULL, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                Uuid::new_v4().to_string(),
                id,
                program.customer_id,
                EntryType::Ajuste.as_str(),
                ledger_delta,
                program.remaining_meters,
                new_remaining,
                session.operator_name,
                session.register_id,
                format!("{reason} (autorizó: {authorized_by})"),
                now,
            ],
        )?;
    }

    let new_status = match program.status {
        ProgramStatus::Activo if new_remaining <= 0.0 => ProgramStatus::Completado,
        ProgramStatus::Completado if new_remaining > 0.0 => ProgramStatus::Activo,
        other => other,
    };

    tx.execute(
        "UPDATE loyalty_programs
         SET total_meters = ?1,
             remaining_meters = ?2,
             status = ?3,
             completed_at = CASE
                 WHEN ?3 = 'completado' THEN COALESCE(completed_at, ?4)
                 WHEN ?3 = 'activo' THEN NULL
                 ELSE completed_at END,
             edit_reason = ?5,
             edited_by = ?6,
             edited_at = ?4,
             updated_at = ?4
         WHERE id = ?7",
        params![new_total, new_remaining, new_status, now, reason, authorized_by, id],
    )?;
    let updated = get_program_with(&tx, id)?;
    tx.commit()?;

    info!(
        program_id = %id,
        total_from = program.total_meters,
        total_to = new_total,
        remaining_from = program.remaining_meters,
        remaining_to = new_remaining,
        authorized_by = %authorized_by,
        operator = %session.operator_name,
        "Program manually adjusted"
    );
    Ok(updated)
}

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

/// All history rows of one program, newest first.
pub fn program_history(db: &DbState, program_id: &str) -> AppResult<Vec<HistoryRecord>> {
    let conn = db.lock()?;
    // Surface a missing program as NotFound instead of an empty list
    get_program_with(&conn, program_id)?;

    let mut stmt = conn.prepare(&format!(
        "{HISTORY_SELECT} WHERE h.program_id = ?1 ORDER BY h.recorded_at DESC, h.rowid DESC"
    ))?;
    let rows = stmt.query_map(params![program_id], history_from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

/// History across every program, newest first, optionally by date range
/// (`YYYY-MM-DD`, inclusive).
pub fn global_history(db: &DbState, filter: &HistoryFilter) -> AppResult<Vec<HistoryRecord>> {
    let date_from = clean_text(filter.date_from.as_deref()).unwrap_or_default();
    let date_to = clean_text(filter.date_to.as_deref()).unwrap_or_default();
    let limit = filter.limit.filter(|l| *l > 0).unwrap_or(DEFAULT_HISTORY_LIMIT);

    let conn = db.lock()?;
    let mut stmt = conn.prepare(&format!(
        "{HISTORY_SELECT}
         WHERE (?1 = '' OR substr(h.recorded_at, 1, 10) >= ?1)
           AND (?2 = '' OR substr(h.recorded_at, 1, 10) <= ?2)
         ORDER BY h.recorded_at DESC, h.rowid DESC
         LIMIT ?3"
    ))?;
    let rows = stmt.query_map(params![date_from, date_to, limit], history_from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}
