use serde::Deserialize;
use serde_json::{json, Value};

use super::{id_from_payload, parse_payload, to_json};
use crate::cash_cuts::{self, CashCutFilter, CashCutInput};
use crate::denominations::{self, DenominationLine};
use crate::{value_bool, value_i64, AppContext};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CountPayload {
    #[serde(default, alias = "denominations", alias = "lines")]
    items: Vec<DenominationLine>,
}

/// Catalog plus an empty count sheet for the active denominations.
pub(super) fn denominations_list(ctx: &AppContext, payload: Value) -> Result<Value, String> {
    let include_inactive =
        value_bool(&payload, &["includeInactive", "include_inactive"]).unwrap_or(false);
    let conn = ctx.db.lock()?;
    let catalog = denominations::list_denominations(&conn, include_inactive)?;
    let sheet = denominations::blank_count_sheet(&conn)?;
    Ok(json!({
        "denominations": to_json(catalog)?,
        "countSheet": to_json(sheet)?,
    }))
}

/// Live total while the operator is counting; nothing is stored.
pub(super) fn denominations_total(ctx: &AppContext, payload: Value) -> Result<Value, String> {
    let parsed: CountPayload = match payload {
        Value::Array(_) => CountPayload {
            items: serde_json::from_value(payload)
                .map_err(|e| format!("Invalid denomination count: {e}"))?,
        },
        other => parse_payload(other, "denomination count")?,
    };
    let total = denominations::denomination_total(&parsed.items);
    Ok(json!({
        "total": total,
        "formatted": denominations::format_currency(total, &ctx.config.currency_symbol),
    }))
}

pub(super) fn denominations_set_active(ctx: &AppContext, payload: Value) -> Result<Value, String> {
    let id = value_i64(&payload, &["id", "denominationId", "denomination_id"])
        .ok_or("Missing denomination id")?;
    let active = value_bool(&payload, &["active", "isActive", "is_active"])
        .ok_or("Missing active flag")?;
    let conn = ctx.db.lock()?;
    denominations::set_denomination_active(&conn, id, active)?;
    Ok(json!({ "success": true }))
}

pub(super) fn cash_cut_save_draft(ctx: &AppContext, payload: Value) -> Result<Value, String> {
    let input: CashCutInput = parse_payload(payload, "cash cut")?;
    let session = ctx.session_snapshot()?;
    to_json(cash_cuts::save_draft(&ctx.db, &session, &input)?)
}

pub(super) fn cash_cut_finalize(ctx: &AppContext, payload: Value) -> Result<Value, String> {
    let id = id_from_payload(&payload, &["id", "cashCutId", "cash_cut_id"], "Missing cash cut id")?;
    let session = ctx.session_snapshot()?;
    to_json(cash_cuts::finalize(&ctx.db, &session, &id)?)
}

pub(super) fn cash_cut_create(ctx: &AppContext, payload: Value) -> Result<Value, String> {
    let input: CashCutInput = parse_payload(payload, "cash cut")?;
    let session = ctx.session_snapshot()?;
    to_json(cash_cuts::create_finalized(&ctx.db, &session, &input)?)
}

pub(super) fn cash_cut_get(ctx: &AppContext, payload: Value) -> Result<Value, String> {
    let id = id_from_payload(&payload, &["id", "cashCutId", "cash_cut_id"], "Missing cash cut id")?;
    to_json(cash_cuts::get(&ctx.db, &id)?)
}

pub(super) fn cash_cut_list(ctx: &AppContext, payload: Value) -> Result<Value, String> {
    let filter: CashCutFilter = parse_payload(payload, "cash cut filter")?;
    to_json(cash_cuts::list(&ctx.db, &filter)?)
}

pub(super) fn cash_cut_delete_draft(ctx: &AppContext, payload: Value) -> Result<Value, String> {
    let id = id_from_payload(&payload, &["id", "cashCutId", "cash_cut_id"], "Missing cash cut id")?;
    cash_cuts::delete_draft(&ctx.db, &id)?;
    Ok(json!({ "success": true, "id": id }))
}
