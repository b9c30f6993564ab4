use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{id_from_payload, parse_payload, to_json};
use crate::loyalty::{
    self, ConsumptionInput, HistoryFilter, NewProgram, ProgramAdjustment, ProgramFilter,
    ProgramStatus, ProgramView,
};
use crate::{reconcile, AppContext};

const PROGRAM_ID_KEYS: &[&str] = &["programId", "program_id", "id"];

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AdjustPayload {
    #[serde(alias = "program_id", alias = "id")]
    program_id: String,
    #[serde(flatten)]
    adjustment: ProgramAdjustment,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusPayload {
    #[serde(alias = "program_id", alias = "id")]
    program_id: String,
    status: ProgramStatus,
}

pub(super) fn loyalty_create_program(ctx: &AppContext, payload: Value) -> Result<Value, String> {
    let input: NewProgram = parse_payload(payload, "program")?;
    let session = ctx.session_snapshot()?;
    to_json(loyalty::create_program(
        &ctx.db,
        &session,
        &input,
        ctx.config.folio_base,
    )?)
}

pub(super) fn loyalty_register_consumption(
    ctx: &AppContext,
    payload: Value,
) -> Result<Value, String> {
    let input: ConsumptionInput = parse_payload(payload, "consumption")?;
    let session = ctx.session_snapshot()?;
    to_json(loyalty::register_consumption(
        &ctx.db,
        &session,
        &input,
        ctx.config.folio_base,
    )?)
}

pub(super) fn loyalty_adjust_program(ctx: &AppContext, payload: Value) -> Result<Value, String> {
    let parsed: AdjustPayload = parse_payload(payload, "program adjustment")?;
    let session = ctx.session_snapshot()?;
    to_json(loyalty::adjust_program(
        &ctx.db,
        &session,
        parsed.program_id.trim(),
        &parsed.adjustment,
    )?)
}

pub(super) fn loyalty_set_status(ctx: &AppContext, payload: Value) -> Result<Value, String> {
    let parsed: StatusPayload = parse_payload(payload, "program status")?;
    to_json(loyalty::set_status(
        &ctx.db,
        parsed.program_id.trim(),
        parsed.status,
    )?)
}

pub(super) fn loyalty_get_program(ctx: &AppContext, payload: Value) -> Result<Value, String> {
    let id = id_from_payload(&payload, PROGRAM_ID_KEYS, "Missing program id")?;
    let program = loyalty::get_program(&ctx.db, &id)?;
    let display_status =
        loyalty::effective_status(&program, Utc::now(), ctx.config.program_expiry_days);
    to_json(ProgramView {
        program,
        display_status,
    })
}

pub(super) fn loyalty_list_programs(ctx: &AppContext, payload: Value) -> Result<Value, String> {
    let filter: ProgramFilter = parse_payload(payload, "program filter")?;
    to_json(loyalty::list_programs(
        &ctx.db,
        &filter,
        ctx.config.program_expiry_days,
    )?)
}

pub(super) fn loyalty_program_history(ctx: &AppContext, payload: Value) -> Result<Value, String> {
    let id = id_from_payload(&payload, PROGRAM_ID_KEYS, "Missing program id")?;
    to_json(loyalty::program_history(&ctx.db, &id)?)
}

pub(super) fn loyalty_global_history(ctx: &AppContext, payload: Value) -> Result<Value, String> {
    let filter: HistoryFilter = parse_payload(payload, "history filter")?;
    to_json(loyalty::global_history(&ctx.db, &filter)?)
}

pub(super) fn loyalty_reconcile(ctx: &AppContext, payload: Value) -> Result<Value, String> {
    let id = id_from_payload(&payload, PROGRAM_ID_KEYS, "Missing program id")?;
    let conn = ctx.db.lock()?;
    to_json(loyalty::reconcile_program(&conn, &id)?)
}

pub(super) fn loyalty_reconcile_all(ctx: &AppContext) -> Result<Value, String> {
    let corrections = reconcile::run_once(&ctx.db, &ctx.reconcile)?;
    Ok(json!({
        "corrected": corrections.len(),
        "corrections": to_json(corrections)?,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::tests::test_ctx;

    fn program_for(ctx: &AppContext, total: f64) -> String {
        let customer = crate::commands::customers::customer_create(ctx, json!({"name": "Ana"})).unwrap();
        let program = loyalty_create_program(
            ctx,
            json!({
                "customer_id": customer["id"],
                "program_type": "vinil",
                "total_meters": total,
            }),
        )
        .unwrap();
        program["id"].as_str().unwrap().to_string()
    }

    #[test]
    fn adjust_and_status_payloads() {
        let ctx = test_ctx();
        let id = program_for(&ctx, 20.0);

        let adjusted = loyalty_adjust_program(
            &ctx,
            json!({
                "programId": id,
                "remainingMeters": 15,
                "reason": "merma",
                "authorizedBy": "Gerente",
            }),
        )
        .unwrap();
        assert_eq!(adjusted["remainingMeters"], 15.0);
        assert_eq!(adjusted["editedBy"], "Gerente");

        let rejected = loyalty_adjust_program(
            &ctx,
            json!({"programId": id, "remainingMeters": 25, "reason": "x", "authorizedBy": "y"}),
        );
        assert!(rejected.is_err());

        let expired = loyalty_set_status(&ctx, json!({"id": id, "status": "expirado"})).unwrap();
        assert_eq!(expired["status"], "expirado");
        assert!(loyalty_set_status(&ctx, json!({"id": id, "status": "pausado"})).is_err());

        let view = loyalty_get_program(&ctx, json!(id)).unwrap();
        assert_eq!(view["displayStatus"], "expirado");
    }

    #[test]
    fn histories_and_reconcile() {
        let ctx = test_ctx();
        let id = program_for(&ctx, 10.0);
        loyalty_register_consumption(&ctx, json!({"programId": id, "meters": 2.5})).unwrap();

        let history = loyalty_program_history(&ctx, json!({"program_id": id})).unwrap();
        assert_eq!(history.as_array().unwrap().len(), 1);
        assert_eq!(history[0]["entryType"], "consumo");

        let global = loyalty_global_history(&ctx, json!({"limit": 10})).unwrap();
        assert_eq!(global.as_array().unwrap().len(), 1);

        let outcome = loyalty_reconcile(&ctx, json!(id)).unwrap();
        assert_eq!(outcome["corrected"], false);
        let sweep = loyalty_reconcile_all(&ctx).unwrap();
        assert_eq!(sweep["corrected"], 0);

        let listed = loyalty_list_programs(&ctx, json!({"status": "activo"})).unwrap();
        assert_eq!(listed[0]["remainingMeters"], 7.5);
        assert_eq!(listed[0]["displayStatus"], "activo");
    }
}
