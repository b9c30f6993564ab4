//! Command surface of the desk.
//!
//! Every front-end action is a named command taking a JSON payload and
//! returning JSON or an error message for the operator. Payloads accept
//! camelCase keys with snake_case aliases; commands that only need an id
//! also accept the bare id string.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::AppContext;

mod cash_cuts;
mod credentials;
mod customers;
mod loyalty;
mod system;
mod tickets;

/// Dispatch one command.
pub fn invoke(ctx: &AppContext, command: &str, payload: Value) -> Result<Value, String> {
    debug!(command, "Invoking command");
    let result = match command {
        // -- System ----------------------------------------------------------
        "app_about" => system::app_about(),
        "app_health" => system::app_health(ctx),
        "session_get" => system::session_get(ctx),
        "session_set_operator" => system::session_set_operator(ctx, payload),
        "folio_format" => system::folio_format(payload),
        "settings_get_business" => system::settings_get_business(ctx),
        "settings_update_business" => system::settings_update_business(ctx, payload),
        "settings_reset_business" => system::settings_reset_business(ctx),

        // -- Cash ------------------------------------------------------------
        "denominations_list" => cash_cuts::denominations_list(ctx, payload),
        "denominations_total" => cash_cuts::denominations_total(ctx, payload),
        "denominations_set_active" => cash_cuts::denominations_set_active(ctx, payload),
        "cash_cut_save_draft" => cash_cuts::cash_cut_save_draft(ctx, payload),
        "cash_cut_finalize" => cash_cuts::cash_cut_finalize(ctx, payload),
        "cash_cut_create" => cash_cuts::cash_cut_create(ctx, payload),
        "cash_cut_get" => cash_cuts::cash_cut_get(ctx, payload),
        "cash_cut_list" => cash_cuts::cash_cut_list(ctx, payload),
        "cash_cut_delete_draft" => cash_cuts::cash_cut_delete_draft(ctx, payload),

        // -- Customers -------------------------------------------------------
        "customer_create" => customers::customer_create(ctx, payload),
        "customer_update" => customers::customer_update(ctx, payload),
        "customer_get" => customers::customer_get(ctx, payload),
        "customer_search" => customers::customer_search(ctx, payload),
        "customer_delete" => customers::customer_delete(ctx, payload),

        // -- Loyalty ---------------------------------------------------------
        "loyalty_create_program" => loyalty::loyalty_create_program(ctx, payload),
        "loyalty_register_consumption" => loyalty::loyalty_register_consumption(ctx, payload),
        "loyalty_adjust_program" => loyalty::loyalty_adjust_program(ctx, payload),
        "loyalty_set_status" => loyalty::loyalty_set_status(ctx, payload),
        "loyalty_get_program" => loyalty::loyalty_get_program(ctx, payload),
        "loyalty_list_programs" => loyalty::loyalty_list_programs(ctx, payload),
        "loyalty_program_history" => loyalty::loyalty_program_history(ctx, payload),
        "loyalty_global_history" => loyalty::loyalty_global_history(ctx, payload),
        "loyalty_reconcile" => loyalty::loyalty_reconcile(ctx, payload),
        "loyalty_reconcile_all" => loyalty::loyalty_reconcile_all(ctx),

        // -- Portal credentials ----------------------------------------------
        "credentials_issue" => credentials::credentials_issue(ctx, payload),
        "credentials_get" => credentials::credentials_get(ctx, payload),
        "credentials_verify" => credentials::credentials_verify(ctx, payload),
        "credentials_revoke" => credentials::credentials_revoke(ctx, payload),

        // -- Tickets and export ----------------------------------------------
        "ticket_render" => tickets::ticket_render(ctx, payload),
        "ticket_print" => tickets::ticket_print(ctx, payload),
        "ticket_whatsapp" => tickets::ticket_whatsapp(ctx, payload),
        "history_export" => tickets::history_export(ctx, payload),

        other => return Err(format!("Unknown command: {other}")),
    };

    if let Err(error) = &result {
        warn!(command, error = %error, "Command failed");
    }
    result
}

// ---------------------------------------------------------------------------
// Payload helpers
// ---------------------------------------------------------------------------

fn to_json<T: Serialize>(value: T) -> Result<Value, String> {
    serde_json::to_value(value).map_err(|e| format!("Failed to serialize response: {e}"))
}

/// Deserialize a payload object; `null` is treated as `{}`.
fn parse_payload<T: DeserializeOwned>(payload: Value, what: &str) -> Result<T, String> {
    let payload = match payload {
        Value::Null => Value::Object(Default::default()),
        other => other,
    };
    serde_json::from_value(payload).map_err(|e| format!("Invalid {what} payload: {e}"))
}

/// Id from a bare string payload or from the first non-empty key.
fn id_from_payload(payload: &Value, keys: &[&str], missing: &str) -> Result<String, String> {
    let id = match payload {
        Value::String(s) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
        other => crate::value_str(other, keys),
    };
    id.ok_or_else(|| missing.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::db;
    use crate::session::Session;
    use serde_json::json;
    use std::sync::Arc;

    pub(super) fn test_ctx() -> AppContext {
        let data_dir = std::env::temp_dir().join(format!("desk_cmd_{}", uuid::Uuid::new_v4()));
        let config = AppConfig {
            log_dir: data_dir.join("logs"),
            data_dir,
            business_name: "Imprenta Centro".to_string(),
            ..AppConfig::default()
        };
        AppContext::new(Arc::new(db::test_state()), config, Session::for_test("Luis"))
    }

    #[test]
    fn unknown_command_is_reported() {
        let ctx = test_ctx();
        let err = invoke(&ctx, "does_not_exist", json!({})).unwrap_err();
        assert_eq!(err, "Unknown command: does_not_exist");
    }

    #[test]
    fn id_accepts_bare_string_or_alias() {
        assert_eq!(
            id_from_payload(&json!(" lp-1 "), &["programId"], "missing").unwrap(),
            "lp-1"
        );
        assert_eq!(
            id_from_payload(&json!({"program_id": "lp-2"}), &["programId", "program_id"], "missing")
                .unwrap(),
            "lp-2"
        );
        assert_eq!(
            id_from_payload(&json!({}), &["programId"], "Missing program id").unwrap_err(),
            "Missing program id"
        );
    }

    #[test]
    fn full_counter_flow_through_commands() {
        let ctx = test_ctx();

        let customer = invoke(
            &ctx,
            "customer_create",
            json!({"name": "Ana López", "phone": "55 1234 5678"}),
        )
        .unwrap();
        let customer_id = customer["id"].as_str().unwrap().to_string();

        let program = invoke(
            &ctx,
            "loyalty_create_program",
            json!({"customerId": customer_id, "type": "lona", "totalMeters": 100}),
        )
        .unwrap();
        let program_id = program["id"].as_str().unwrap().to_string();
        assert_eq!(program["folio"], "001");

        invoke(
            &ctx,
            "loyalty_register_consumption",
            json!({"program_id": program_id, "meters": 60}),
        )
        .unwrap();
        let receipt = invoke(
            &ctx,
            "loyalty_register_consumption",
            json!({"programId": program_id, "meters": 40}),
        )
        .unwrap();
        assert_eq!(receipt["program"]["status"], "completado");
        assert_eq!(receipt["program"]["remainingMeters"], 0.0);

        let history_id = receipt["history"]["id"].as_str().unwrap().to_string();
        let rendered = invoke(&ctx, "ticket_render", json!({"historyId": history_id})).unwrap();
        assert!(rendered["html"].as_str().unwrap().contains("Imprenta Centro"));

        let message = invoke(&ctx, "ticket_whatsapp", json!({"historyId": history_id})).unwrap();
        assert!(message["url"]
            .as_str()
            .unwrap()
            .starts_with("https://wa.me/5512345678?text="));

        let rejected = invoke(
            &ctx,
            "loyalty_register_consumption",
            json!({"programId": program_id, "meters": 1}),
        );
        assert!(rejected.is_err());
    }
}
