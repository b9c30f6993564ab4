use serde::Deserialize;
use serde_json::{json, Value};

use super::{id_from_payload, parse_payload, to_json};
use crate::credentials;
use crate::AppContext;

const CUSTOMER_ID_KEYS: &[&str] = &["customerId", "customer_id", "id"];

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct VerifyPayload {
    #[serde(alias = "access_id", alias = "accessID")]
    access_id: String,
    password: String,
}

pub(super) fn credentials_issue(ctx: &AppContext, payload: Value) -> Result<Value, String> {
    let customer_id = id_from_payload(&payload, CUSTOMER_ID_KEYS, "Missing customer id")?;
    let issued = credentials::issue(&ctx.db, &customer_id, ctx.config.access_id_base)?;
    to_json(&issued)
}

pub(super) fn credentials_get(ctx: &AppContext, payload: Value) -> Result<Value, String> {
    let customer_id = id_from_payload(&payload, CUSTOMER_ID_KEYS, "Missing customer id")?;
    to_json(credentials::get_for_customer(&ctx.db, &customer_id)?)
}

pub(super) fn credentials_verify(ctx: &AppContext, payload: Value) -> Result<Value, String> {
    let parsed: VerifyPayload = parse_payload(payload, "credential check")?;
    let valid = credentials::verify(&ctx.db, &parsed.access_id, &parsed.password)?;
    Ok(json!({ "valid": valid }))
}

pub(super) fn credentials_revoke(ctx: &AppContext, payload: Value) -> Result<Value, String> {
    let customer_id = id_from_payload(&payload, CUSTOMER_ID_KEYS, "Missing customer id")?;
    credentials::revoke(&ctx.db, &customer_id)?;
    Ok(json!({ "success": true }))
}
