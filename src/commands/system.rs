use serde::Deserialize;
use serde_json::{json, Value};

use super::{parse_payload, to_json};
use crate::config::BUSINESS_SETTINGS;
use crate::{db, diagnostics, folio, value_str, AppContext};

/// Business keys the counter may override; read at startup by
/// `AppConfig::apply_settings`.
const BUSINESS_KEYS: &[&str] = &["business_name", "currency_symbol", "program_expiry_days"];

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OperatorPayload {
    #[serde(alias = "operator_name", alias = "operator", alias = "name")]
    operator_name: String,
}

pub(super) fn app_about() -> Result<Value, String> {
    Ok(diagnostics::get_about_info())
}

pub(super) fn app_health(ctx: &AppContext) -> Result<Value, String> {
    let mut health = diagnostics::get_system_health(&ctx.db)?;
    health["reconcile"] = ctx.reconcile.status();
    health["config"] = to_json(&ctx.config)?;
    Ok(health)
}

pub(super) fn session_get(ctx: &AppContext) -> Result<Value, String> {
    to_json(ctx.session_snapshot()?)
}

pub(super) fn session_set_operator(ctx: &AppContext, payload: Value) -> Result<Value, String> {
    let parsed: OperatorPayload = match payload {
        Value::String(name) => OperatorPayload {
            operator_name: name,
        },
        other => parse_payload(other, "operator")?,
    };

    let mut session = ctx.session()?;
    let conn = ctx.db.lock()?;
    session.set_operator(&conn, &parsed.operator_name)?;
    to_json(&*session)
}

pub(super) fn settings_get_business(ctx: &AppContext) -> Result<Value, String> {
    let conn = ctx.db.lock()?;
    Ok(db::get_category_settings(&conn, BUSINESS_SETTINGS)?)
}

/// Store business overrides. They take effect on the next start.
pub(super) fn settings_update_business(ctx: &AppContext, payload: Value) -> Result<Value, String> {
    let Value::Object(entries) = payload else {
        return Err("Invalid settings payload: expected an object".to_string());
    };

    let mut updates = Vec::with_capacity(entries.len());
    for (key, value) in entries {
        if !BUSINESS_KEYS.contains(&key.as_str()) {
            return Err(format!("Unknown business setting: {key}"));
        }
        let value = match value {
            Value::String(s) => s.trim().to_string(),
            Value::Number(n) => n.to_string(),
            _ => return Err(format!("Invalid value for {key}")),
        };
        if value.is_empty() {
            return Err(format!("{key} cannot be empty"));
        }
        if key == "program_expiry_days" && !value.parse::<i64>().is_ok_and(|d| d > 0) {
            return Err("program_expiry_days must be a positive whole number".to_string());
        }
        updates.push((key, value));
    }

    let conn = ctx.db.lock()?;
    for (key, value) in &updates {
        db::set_setting(&conn, BUSINESS_SETTINGS, key, value)?;
    }
    Ok(json!({
        "settings": db::get_category_settings(&conn, BUSINESS_SETTINGS)?,
        "appliesOnRestart": true,
    }))
}

pub(super) fn settings_reset_business(ctx: &AppContext) -> Result<Value, String> {
    let conn = ctx.db.lock()?;
    db::delete_all_settings(&conn, BUSINESS_SETTINGS)?;
    Ok(json!({ "success": true }))
}

pub(super) fn folio_format(payload: Value) -> Result<Value, String> {
    let raw = match &payload {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        other => value_str(other, &["folio", "raw", "value"]).unwrap_or_default(),
    };
    Ok(json!({ "folio": folio::format_folio(&raw) }))
}
