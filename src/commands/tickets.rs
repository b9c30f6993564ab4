use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::PathBuf;

use super::{parse_payload, to_json};
use crate::ticket::{self, TicketLayout, TicketSnapshot};
use crate::{export, AppContext};

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TicketPayload {
    #[serde(default, alias = "history_id", alias = "id")]
    history_id: Option<String>,
    /// Caller-built snapshot, used when no history id is given.
    #[serde(default)]
    snapshot: Option<TicketSnapshot>,
    /// Overrides the stored customer phone.
    #[serde(default)]
    phone: Option<String>,
    #[serde(default)]
    open: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExportPayload {
    #[serde(default, alias = "output_dir")]
    output_dir: Option<PathBuf>,
}

fn parse_ticket_payload(payload: Value) -> Result<TicketPayload, String> {
    match payload {
        Value::String(id) => Ok(TicketPayload {
            history_id: Some(id),
            ..TicketPayload::default()
        }),
        other => parse_payload(other, "ticket"),
    }
}

fn resolve_snapshot(ctx: &AppContext, payload: &TicketPayload) -> Result<TicketSnapshot, String> {
    if let Some(id) = payload
        .history_id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty())
    {
        return Ok(ticket::snapshot_for_history(&ctx.db, id)?);
    }
    payload
        .snapshot
        .clone()
        .ok_or_else(|| "Missing history id or ticket snapshot".to_string())
}

pub(super) fn ticket_render(ctx: &AppContext, payload: Value) -> Result<Value, String> {
    let parsed = parse_ticket_payload(payload)?;
    let snapshot = resolve_snapshot(ctx, &parsed)?;
    let rendered_at = Utc::now();
    let html = ticket::render_ticket_html(
        &snapshot,
        &TicketLayout::from_config(&ctx.config),
        rendered_at,
    );
    Ok(json!({
        "html": html,
        "renderedAt": rendered_at.to_rfc3339(),
    }))
}

/// Write the ticket under the data dir and hand it to the browser for the
/// print dialog (unless `open: false`).
pub(super) fn ticket_print(ctx: &AppContext, payload: Value) -> Result<Value, String> {
    let parsed = parse_ticket_payload(payload)?;
    let snapshot = resolve_snapshot(ctx, &parsed)?;
    let path = ticket::write_ticket_file(
        &ctx.config.tickets_dir(),
        &snapshot,
        &TicketLayout::from_config(&ctx.config),
        Utc::now(),
    )?;

    let path_str = path.to_string_lossy().into_owned();
    if parsed.open.unwrap_or(true) {
        let outcome = ticket::open_in_browser(&path_str)?;
        Ok(json!({ "path": path_str, "opened": outcome.opened, "target": outcome.target }))
    } else {
        Ok(json!({ "path": path_str, "opened": false, "target": path_str }))
    }
}

/// Build the WhatsApp message and link; opens it only with `open: true`.
pub(super) fn ticket_whatsapp(ctx: &AppContext, payload: Value) -> Result<Value, String> {
    let parsed = parse_ticket_payload(payload)?;
    let snapshot = resolve_snapshot(ctx, &parsed)?;
    let phone = parsed
        .phone
        .clone()
        .or_else(|| snapshot.client.phone.clone())
        .unwrap_or_default();

    let message = ticket::whatsapp_message(&snapshot, &TicketLayout::from_config(&ctx.config));
    let url = ticket::whatsapp_url(&phone, &message)?;

    let (opened, target) = if parsed.open.unwrap_or(false) {
        let outcome = ticket::open_in_browser(&url)?;
        (outcome.opened, outcome.target)
    } else {
        (false, url.clone())
    };
    Ok(json!({
        "message": message,
        "url": url,
        "opened": opened,
        "target": target,
    }))
}

pub(super) fn history_export(ctx: &AppContext, payload: Value) -> Result<Value, String> {
    let parsed: ExportPayload = parse_payload(payload, "export")?;
    let dir = parsed
        .output_dir
        .filter(|d| !d.as_os_str().is_empty())
        .unwrap_or_else(|| ctx.config.exports_dir());
    to_json(export::export_history_xlsx(&ctx.db, &dir)?)
}

#[cfg(test)]
mod dto_tests {
    use super::*;
    use crate::commands::tests::test_ctx;

    fn snapshot_json() -> Value {
        json!({
            "client": {
                "name": "Ana",
                "type": "lona",
                "totalMeters": 50,
                "remainingMeters": 40,
                "phone": "55 0000 1111"
            },
            "order": {
                "metersConsumed": 10,
                "folio": "17",
                "recordedAt": "2026-02-01 09:15:00",
                "recordedBy": "Luis"
            }
        })
    }

    #[test]
    fn caller_snapshot_renders_without_database_rows() {
        let ctx = test_ctx();
        let rendered = ticket_render(&ctx, json!({"snapshot": snapshot_json()})).unwrap();
        let html = rendered["html"].as_str().unwrap();
        assert!(html.contains(">017<"));
        assert!(html.contains("50.00 m"));
    }

    #[test]
    fn whatsapp_phone_override() {
        let ctx = test_ctx();
        let result = ticket_whatsapp(
            &ctx,
            json!({"snapshot": snapshot_json(), "phone": "+52 1 55 2222 3333"}),
        )
        .unwrap();
        assert!(result["url"]
            .as_str()
            .unwrap()
            .starts_with("https://wa.me/5215522223333?text="));
        assert_eq!(result["opened"], false);
    }

    #[test]
    fn print_without_open_writes_file() {
        let ctx = test_ctx();
        let result =
            ticket_print(&ctx, json!({"snapshot": snapshot_json(), "open": false})).unwrap();
        let path = PathBuf::from(result["path"].as_str().unwrap());
        assert!(path.is_file());
        assert!(path.starts_with(ctx.config.tickets_dir()));
        let _ = std::fs::remove_dir_all(&ctx.config.data_dir);
    }

    #[test]
    fn missing_source_is_an_error() {
        let ctx = test_ctx();
        let err = ticket_render(&ctx, json!({})).unwrap_err();
        assert_eq!(err, "Missing history id or ticket snapshot");
    }

    #[test]
    fn export_defaults_to_data_dir() {
        let ctx = test_ctx();
        let result = history_export(&ctx, Value::Null).unwrap();
        assert_eq!(result["rows"], 0);
        let path = PathBuf::from(result["path"].as_str().unwrap());
        assert!(path.starts_with(ctx.config.exports_dir()));
        let _ = std::fs::remove_dir_all(&ctx.config.data_dir);
    }
}
