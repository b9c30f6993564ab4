//! Cash cuts (end-of-shift cash counts).
//!
//! A cut is counted denomination by denomination. While `is_draft = 1` the
//! count can be saved repeatedly; finalizing freezes it. The stored total is
//! always recomputed here from the items, never taken from the caller.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::db::DbState;
use crate::denominations::{denomination_total, DenominationLine};
use crate::error::{AppError, AppResult};
use crate::round2;
use crate::session::Session;

const DEFAULT_LIST_LIMIT: i64 = 100;

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CashCutItem {
    pub denomination_value: f64,
    pub denomination_label: String,
    pub quantity: f64,
    pub subtotal: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CashCut {
    pub id: String,
    pub register_id: Option<String>,
    pub operator: String,
    pub total: f64,
    pub notes: Option<String>,
    pub is_draft: bool,
    pub created_at: String,
    pub updated_at: String,
    pub finalized_at: Option<String>,
    /// Empty in list results.
    pub items: Vec<CashCutItem>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CashCutInput {
    /// Existing draft to overwrite; a new draft is created when absent.
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default, alias = "denominations", alias = "lines")]
    pub items: Vec<DenominationLine>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CashCutFilter {
    #[serde(default, alias = "include_drafts")]
    pub include_drafts: bool,
    #[serde(default, alias = "date_from")]
    pub date_from: Option<String>,
    #[serde(default, alias = "date_to")]
    pub date_to: Option<String>,
    #[serde(default)]
    pub limit: Option<i64>,
}

fn cut_from_row(row: &rusqlite::Row) -> rusqlite::Result<CashCut> {
    Ok(CashCut {
        id: row.get(0)?,
        register_id: row.get(1)?,
        operator: row.get(2)?,
        total: row.get(3)?,
        notes: row.get(4)?,
        is_draft: row.get::<_, i64>(5)? != 0,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
        finalized_at: row.get(8)?,
        items: Vec::new(),
    })
}

const CUT_SELECT: &str = "SELECT id, register_id, operator, total, notes, is_draft,
        created_at, updated_at, finalized_at
 FROM cash_cuts";

fn load_cut(conn: &Connection, id: &str) -> AppResult<CashCut> {
    let mut cut = conn
        .query_row(&format!("{CUT_SELECT} WHERE id = ?1"), params![id], cut_from_row)
        .optional()?
        .ok_or_else(|| AppError::not_found("cash cut", id))?;

    let mut stmt = conn.prepare(
        "SELECT denomination_value, denomination_label, quantity, subtotal
         FROM cash_cut_items
         WHERE cash_cut_id = ?1
         ORDER BY denomination_value DESC",
    )?;
    let items = stmt.query_map(params![id], |row| {
        Ok(CashCutItem {
            denomination_value: row.get(0)?,
            denomination_label: row.get(1)?,
            quantity: row.get(2)?,
            subtotal: row.get(3)?,
        })
    })?;
    cut.items = items.collect::<Result<Vec<_>, _>>()?;
    Ok(cut)
}

fn clean_text(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Replace the items of `cut_id` with the counted lines; returns the total.
fn write_items(tx: &Transaction, cut_id: &str, items: &[DenominationLine]) -> AppResult<f64> {
    for line in items {
        if !line.value.is_finite() || line.value <= 0.0 {
            return Err(AppError::validation(format!(
                "Invalid denomination value: {}",
                line.value
            )));
        }
    }

    tx.execute(
        "DELETE FROM cash_cut_items WHERE cash_cut_id = ?1",
        params![cut_id],
    )?;
    for line in items.iter().filter(|l| l.subtotal() > 0.0) {
        tx.execute(
            "INSERT INTO cash_cut_items (id, cash_cut_id, denomination_value,
                denomination_label, quantity, subtotal)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                Uuid::new_v4().to_string(),
                cut_id,
                line.value,
                line.display_label(),
                line.quantity,
                round2(line.subtotal()),
            ],
        )?;
    }
    Ok(round2(denomination_total(items)))
}

fn save_inner(
    tx: &Transaction,
    session: &Session,
    input: &CashCutInput,
    finalize: bool,
) -> AppResult<String> {
    let now = Utc::now().to_rfc3339();
    let notes = clean_text(input.notes.as_deref());

    let id = match input.id.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        Some(existing) => {
            let is_draft: Option<i64> = tx
                .query_row(
                    "SELECT is_draft FROM cash_cuts WHERE id = ?1",
                    params![existing],
                    |row| row.get(0),
                )
                .optional()?;
            match is_draft {
                None => return Err(AppError::not_found("cash cut", existing)),
                Some(0) => {
                    return Err(AppError::conflict(
                        "This cash cut is already finalized and cannot be edited",
                    ))
                }
                Some(_) => existing.to_string(),
            }
        }
        None => {
            let id = Uuid::new_v4().to_string();
            tx.execute(
                "INSERT INTO cash_cuts (id, register_id, operator, total, notes, is_draft,
                    created_at, updated_at)
                 VALUES (?1, ?2, ?3, 0, ?4, 1, ?5, ?5)",
                params![id, session.register_id, session.operator_name, notes, now],
            )?;
            id
        }
    };

    let total = write_items(tx, &id, &input.items)?;
    tx.execute(
        "UPDATE cash_cuts
         SET total = ?1, notes = ?2, operator = ?3, updated_at = ?4,
             is_draft = CASE WHEN ?5 = 1 THEN 0 ELSE is_draft END,
             finalized_at = CASE WHEN ?5 = 1 THEN ?4 ELSE finalized_at END
         WHERE id = ?6",
        params![total, notes, session.operator_name, now, finalize as i64, id],
    )?;
    Ok(id)
}

/// Create a draft, or overwrite the lines of an existing draft.
pub fn save_draft(db: &DbState, session: &Session, input: &CashCutInput) -> AppResult<CashCut> {
    let mut conn = db.lock()?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let id = save_inner(&tx, session, input, false)?;
    let cut = load_cut(&tx, &id)?;
    tx.commit()?;

    info!(cash_cut_id = %id, total = cut.total, operator = %session.operator_name, "Cash cut draft saved");
    Ok(cut)
}

/// Close a draft. The total is recomputed from the stored items.
pub fn finalize(db: &DbState, session: &Session, id: &str) -> AppResult<CashCut> {
    let mut conn = db.lock()?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let cut = load_cut(&tx, id)?;
    if !cut.is_draft {
        return Err(AppError::conflict("This cash cut is already finalized"));
    }
    let total = round2(cut.items.iter().map(|i| i.subtotal).sum());

    let now = Utc::now().to_rfc3339();
    tx.execute(
        "UPDATE cash_cuts
         SET is_draft = 0, total = ?1, finalized_at = ?2, updated_at = ?2, operator = ?3
         WHERE id = ?4",
        params![total, now, session.operator_name, id],
    )?;
    let cut = load_cut(&tx, id)?;
    tx.commit()?;

    info!(cash_cut_id = %id, total, operator = %session.operator_name, "Cash cut finalized");
    Ok(cut)
}

/// Count and close in one step.
pub fn create_finalized(db: &DbState, session: &Session, input: &CashCutInput) -> AppResult<CashCut> {
    let mut conn = db.lock()?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let id = save_inner(&tx, session, input, true)?;
    let cut = load_cut(&tx, &id)?;
    tx.commit()?;

    info!(cash_cut_id = %id, total = cut.total, operator = %session.operator_name, "Cash cut created");
    Ok(cut)
}

pub fn get(db: &DbState, id: &str) -> AppResult<CashCut> {
    let conn = db.lock()?;
    load_cut(&conn, id)
}

/// Cuts newest first, without items. Dates are `YYYY-MM-DD`, inclusive,
/// compared against `created_at`.
pub fn list(db: &DbState, filter: &CashCutFilter) -> AppResult<Vec<CashCut>> {
    let date_from = clean_text(filter.date_from.as_deref()).unwrap_or_default();
    let date_to = clean_text(filter.date_to.as_deref()).unwrap_or_default();
    let limit = filter.limit.filter(|l| *l > 0).unwrap_or(DEFAULT_LIST_LIMIT);

    let conn = db.lock()?;
    let mut stmt = conn.prepare(&format!(
        "{CUT_SELECT}
         WHERE (?1 = 1 OR is_draft = 0)
           AND (?2 = '' OR substr(created_at, 1, 10) >= ?2)
           AND (?3 = '' OR substr(created_at, 1, 10) <= ?3)
         ORDER BY created_at DESC, rowid DESC
         LIMIT ?4"
    ))?;
    let rows = stmt.query_map(
        params![filter.include_drafts as i64, date_from, date_to, limit],
        cut_from_row,
    )?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

/// Discard a draft. Finalized cuts are permanent.
pub fn delete_draft(db: &DbState, id: &str) -> AppResult<()> {
    let conn = db.lock()?;
    let is_draft: Option<i64> = conn
        .query_row(
            "SELECT is_draft FROM cash_cuts WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional()?;
    match is_draft {
        None => Err(AppError::not_found("cash cut", id)),
        Some(0) => Err(AppError::conflict("Finalized cash cuts cannot be deleted")),
        Some(_) => {
            conn.execute("DELETE FROM cash_cuts WHERE id = ?1", params![id])?;
            info!(cash_cut_id = %id, "Cash cut draft deleted");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn count(lines: &[(f64, f64)]) -> CashCutInput {
        CashCutInput {
            id: None,
            items: lines
                .iter()
                .map(|(value, qty)| DenominationLine::new(*value, *qty))
                .collect(),
            notes: Some("turno matutino".to_string()),
        }
    }

    #[test]
    fn draft_total_is_computed_and_zero_lines_skipped() {
        let state = db::test_state();
        let session = Session::for_test("Luis");

        let cut = save_draft(&state, &session, &count(&[(500.0, 2.0), (20.0, 3.0), (1.0, 0.0)])).unwrap();
        assert!(cut.is_draft);
        assert_eq!(cut.total, 1060.0);
        assert_eq!(cut.items.len(), 2);
        assert_eq!(cut.items[0].denomination_value, 500.0);
        assert_eq!(cut.items[0].subtotal, 1000.0);
        assert_eq!(cut.operator, "Luis");
        assert_eq!(cut.register_id.as_deref(), Some("register-test"));
    }

    #[test]
    fn saving_a_draft_again_replaces_its_lines() {
        let state = db::test_state();
        let session = Session::for_test("Luis");
        let first = save_draft(&state, &session, &count(&[(100.0, 5.0)])).unwrap();

        let mut edit = count(&[(50.0, 1.0), (0.5, 3.0)]);
        edit.id = Some(first.id.clone());
        let second = save_draft(&state, &session, &edit).unwrap();

        assert_eq!(second.id, first.id);
        assert_eq!(second.total, 51.5);
        assert_eq!(second.items.len(), 2);
    }

    #[test]
    fn finalized_cut_is_immutable() {
        let state = db::test_state();
        let session = Session::for_test("Luis");
        let draft = save_draft(&state, &session, &count(&[(200.0, 1.0)])).unwrap();
        let closed = finalize(&state, &session, &draft.id).unwrap();
        assert!(!closed.is_draft);
        assert!(closed.finalized_at.is_some());
        assert_eq!(closed.total, 200.0);

        assert!(matches!(finalize(&state, &session, &draft.id), Err(AppError::Conflict(_))));
        let mut edit = count(&[(1.0, 1.0)]);
        edit.id = Some(draft.id.clone());
        assert!(matches!(save_draft(&state, &session, &edit), Err(AppError::Conflict(_))));
        assert!(matches!(delete_draft(&state, &draft.id), Err(AppError::Conflict(_))));
    }

    #[test]
    fn create_finalized_closes_immediately() {
        let state = db::test_state();
        let session = Session::for_test("Ana");
        let cut = create_finalized(&state, &session, &count(&[(1000.0, 1.0), (10.0, 4.0)])).unwrap();
        assert!(!cut.is_draft);
        assert_eq!(cut.total, 1040.0);
    }

    #[test]
    fn invalid_denomination_value_rolls_back() {
        let state = db::test_state();
        let session = Session::for_test("Ana");
        let err = save_draft(&state, &session, &count(&[(-5.0, 1.0)])).unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        assert!(list(&state, &CashCutFilter { include_drafts: true, ..Default::default() })
            .unwrap()
            .is_empty());
    }

    #[test]
    fn list_hides_drafts_unless_asked() {
        let state = db::test_state();
        let session = Session::for_test("Ana");
        let draft = save_draft(&state, &session, &count(&[(20.0, 1.0)])).unwrap();
        create_finalized(&state, &session, &count(&[(50.0, 1.0)])).unwrap();

        assert_eq!(list(&state, &CashCutFilter::default()).unwrap().len(), 1);
        let all = list(
            &state,
            &CashCutFilter {
                include_drafts: true,
                ..CashCutFilter::default()
            },
        )
        .unwrap();
        assert_eq!(all.len(), 2);

        delete_draft(&state, &draft.id).unwrap();
        assert!(matches!(get(&state, &draft.id), Err(AppError::NotFound { .. })));
    }
}
