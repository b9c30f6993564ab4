//! Consumption tickets and WhatsApp messages.
//!
//! Rendering is pure: the same snapshot, layout and render time always
//! produce the same bytes. Loading the snapshot, writing the file and
//! handing it to the system browser are separate steps below.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::data_helpers::{normalize_phone, percent_encode_component, validate_external_url};
use crate::db::DbState;
use crate::error::{AppError, AppResult};
use crate::folio::format_folio;
use crate::loyalty::{self, parse_timestamp, EntryType};
use crate::round2;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TicketClient {
    pub name: String,
    #[serde(alias = "type", alias = "program_type")]
    pub program_type: String,
    #[serde(alias = "total_meters")]
    pub total_meters: f64,
    /// Balance after this order.
    #[serde(alias = "remaining_meters")]
    pub remaining_meters: f64,
    #[serde(default)]
    pub phone: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TicketOrder {
    #[serde(default, alias = "entry_type")]
    pub entry_type: EntryType,
    /// Signed for adjustments: positive takes meters, negative returns them.
    #[serde(alias = "meters_consumed")]
    pub meters_consumed: f64,
    /// Stored balance before the entry; derived when absent.
    #[serde(default, alias = "remaining_before")]
    pub remaining_before: Option<f64>,
    #[serde(default)]
    pub folio: Option<String>,
    #[serde(alias = "recorded_at")]
    pub recorded_at: String,
    #[serde(alias = "recorded_by")]
    pub recorded_by: String,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TicketSnapshot {
    pub client: TicketClient,
    pub order: TicketOrder,
}

impl TicketSnapshot {
    pub fn balance_before(&self) -> f64 {
        self.order
            .remaining_before
            .map(round2)
            .unwrap_or_else(|| round2(self.client.remaining_meters + self.order.meters_consumed))
    }

    fn is_adjustment(&self) -> bool {
        self.order.entry_type == EntryType::Ajuste
    }

    /// Label and value of the movement line.
    fn movement(&self) -> (&'static str, String) {
        if self.is_adjustment() {
            let change = round2(-self.order.meters_consumed);
            ("Ajuste", format!("{change:+.2} m"))
        } else {
            ("Consumido", meters(self.order.meters_consumed))
        }
    }

    fn folio_display(&self) -> String {
        let folio = self.order.folio.as_deref().map(format_folio).unwrap_or_default();
        if folio.is_empty() {
            "---".to_string()
        } else {
            folio
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TicketLayout {
    pub business_name: String,
    pub footer: Option<String>,
}

impl TicketLayout {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            business_name: config.business_name.clone(),
            footer: Some("Gracias por su preferencia".to_string()),
        }
    }
}

fn esc(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

fn meters(value: f64) -> String {
    format!("{value:.2} m")
}

/// `dd/mm/yyyy HH:MM` when the stored value parses, else as stored.
fn display_date(raw: &str) -> String {
    parse_timestamp(raw)
        .map(|dt| dt.format("%d/%m/%Y %H:%M").to_string())
        .unwrap_or_else(|| raw.to_string())
}

fn html_shell(title: &str, body: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html lang="es">
<head>
<meta charset="UTF-8"/>
<title>{}</title>
<style>
@page {{ size: 80mm auto; margin: 0; }}
body {{ font-family: ui-monospace, SFMono-Regular, Menlo, monospace; width: 80mm; margin: 0; padding: 4mm; box-sizing: border-box; color: #000; }}
.center {{ text-align: center; }}
.title {{ font-size: 14px; font-weight: bold; }}
.line {{ display: flex; justify-content: space-between; gap: 8px; font-size: 11px; }}
.section {{ margin-top: 6px; border-top: 1px dashed #000; padding-top: 4px; }}
.strong {{ font-weight: bold; }}
.note {{ font-size: 10px; }}
.signature {{ margin-top: 28px; border-top: 1px solid #000; text-align: center; font-size: 10px; padding-top: 2px; }}
</style>
</head>
<body>
{}
</body>
</html>
"#,
        esc(title),
        body
    )
}

fn line(label: &str, value: &str) -> String {
    format!(
        "<div class=\"line\"><span>{}</span><span>{}</span></div>\n",
        esc(label),
        esc(value)
    )
}

/// Printable 80 mm ticket for one consumption or adjustment.
pub fn render_ticket_html(
    snapshot: &TicketSnapshot,
    layout: &TicketLayout,
    rendered_at: DateTime<Utc>,
) -> String {
    let client = &snapshot.client;
    let order = &snapshot.order;
    let folio = snapshot.folio_display();
    let kind = if snapshot.is_adjustment() {
        "Ticket de ajuste"
    } else {
        "Ticket de consumo"
    };

    let mut body = format!(
        "<div class=\"center title\">{}</div>\n<div class=\"center\">{kind}</div>\n",
        esc(&layout.business_name)
    );

    body.push_str("<div class=\"section\">\n");
    body.push_str(&line("Folio", &folio));
    body.push_str(&line("Fecha", &display_date(&order.recorded_at)));
    body.push_str(&line("Atendió", &order.recorded_by));
    body.push_str("</div>\n");

    body.push_str("<div class=\"section\">\n");
    body.push_str(&line("Cliente", &client.name));
    body.push_str(&line("Programa", &client.program_type));
    body.push_str(&line("Metros totales", &meters(client.total_meters)));
    body.push_str("</div>\n");

    body.push_str("<div class=\"section\">\n");
    body.push_str(&line("Saldo anterior", &meters(snapshot.balance_before())));
    let (movement_label, movement_value) = snapshot.movement();
    body.push_str(&line(movement_label, &movement_value));
    body.push_str("<div class=\"strong\">\n");
    body.push_str(&line("Saldo actual", &meters(client.remaining_meters)));
    body.push_str("</div>\n</div>\n");

    if let Some(notes) = order.notes.as_deref().map(str::trim).filter(|n| !n.is_empty()) {
        body.push_str(&format!(
            "<div class=\"section note\">Notas: {}</div>\n",
            esc(notes)
        ));
    }

    body.push_str("<div class=\"signature\">Firma del cliente</div>\n");
    if let Some(footer) = layout.footer.as_deref().filter(|f| !f.trim().is_empty()) {
        body.push_str(&format!("<div class=\"center note\">{}</div>\n", esc(footer)));
    }
    body.push_str(&format!(
        "<div class=\"center note\">Impreso {}</div>",
        rendered_at.format("%d/%m/%Y %H:%M:%S")
    ));

    html_shell(&format!("Ticket {folio}"), &body)
}

/// Plain-text message sent through WhatsApp after a consumption.
pub fn whatsapp_message(snapshot: &TicketSnapshot, layout: &TicketLayout) -> String {
    let client = &snapshot.client;
    let order = &snapshot.order;
    let (subject, movement_label, movement_value) = if snapshot.is_adjustment() {
        let (_, value) = snapshot.movement();
        ("el ajuste de tu programa", "Ajuste", value)
    } else {
        ("el detalle de tu consumo", "Metros consumidos", meters(order.meters_consumed))
    };
    let mut message = format!(
        "Hola {}, te compartimos {subject} en {}.\n\
         Folio: {}\n\
         Programa: {}\n\
         Fecha: {}\n\
         Saldo anterior: {}\n\
         {movement_label}: {movement_value}\n\
         Saldo actual: {}",
        client.name.trim(),
        layout.business_name.trim(),
        snapshot.folio_display(),
        client.program_type.trim(),
        display_date(&order.recorded_at),
        meters(snapshot.balance_before()),
        meters(client.remaining_meters),
    );
    if let Some(notes) = order.notes.as_deref().map(str::trim).filter(|n| !n.is_empty()) {
        message.push_str(&format!("\nNotas: {notes}"));
    }
    message.push_str("\n¡Gracias por tu preferencia!");
    message
}

/// `https://wa.me/<digits>?text=<message>`.
pub fn whatsapp_url(phone: &str, message: &str) -> AppResult<String> {
    let digits = normalize_phone(phone);
    if digits.is_empty() {
        return Err(AppError::validation(
            "The customer has no phone number to send the message to",
        ));
    }
    Ok(format!(
        "https://wa.me/{digits}?text={}",
        percent_encode_component(message)
    ))
}

/// Snapshot of a stored history row, as the ticket should show it.
pub fn snapshot_for_history(db: &DbState, history_id: &str) -> AppResult<TicketSnapshot> {
    let conn = db.lock()?;
    let history = loyalty::get_history_with(&conn, history_id)?;
    let program = loyalty::get_program_with(&conn, &history.program_id)?;
    let phone: Option<String> = conn
        .query_row(
            "SELECT phone FROM customers_ WHERE id = ?1",
            rusqlite::params![program.customer_id],
            |row| row.get(0),
        )?;

    Ok(TicketSnapshot {
        client: TicketClient {
            name: program.customer_name.unwrap_or_default(),
            program_type: program.program_type,
            total_meters: program.total_meters,
            remaining_meters: history.remaining_after,
            phone,
        },
        order: TicketOrder {
            entry_type: history.entry_type,
            meters_consumed: history.meters_consumed,
            remaining_before: Some(history.remaining_before),
            folio: history.folio,
            recorded_at: history.recorded_at,
            recorded_by: history.recorded_by,
            notes: history.notes,
        },
    })
}

/// Write the rendered ticket to `dir` and return its path.
pub fn write_ticket_file(
    dir: &Path,
    snapshot: &TicketSnapshot,
    layout: &TicketLayout,
    rendered_at: DateTime<Utc>,
) -> AppResult<PathBuf> {
    fs::create_dir_all(dir)?;
    let folio = snapshot.order.folio.as_deref().map(format_folio).unwrap_or_default();
    let stem = if folio.is_empty() { "sin-folio".to_string() } else { folio };
    let path = dir.join(format!(
        "ticket-{stem}-{}.html",
        rendered_at.format("%Y%m%d%H%M%S")
    ));
    fs::write(&path, render_ticket_html(snapshot, layout, rendered_at))?;
    info!(path = %path.display(), "Ticket written");
    Ok(path)
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OpenOutcome {
    pub opened: bool,
    /// What the caller should navigate to itself when `opened` is false.
    pub target: String,
}

/// Open a ticket file or an allow-listed URL in the system browser.
///
/// A browser that cannot be launched is not an error: the target comes back
/// with `opened: false` so the front end can navigate to it instead.
pub fn open_in_browser(target: &str) -> AppResult<OpenOutcome> {
    let target = target.trim();
    let resolved = if target.starts_with("https://") || target.starts_with("http://") {
        validate_external_url(target)?.to_string()
    } else {
        let path = Path::new(target);
        if !path.is_file() {
            return Err(AppError::Browser {
                target: target.to_string(),
                reason: "file does not exist".to_string(),
            });
        }
        path.to_string_lossy().into_owned()
    };

    match webbrowser::open(&resolved) {
        Ok(()) => Ok(OpenOutcome {
            opened: true,
            target: resolved,
        }),
        Err(e) => {
            warn!(target = %resolved, error = %e, "Could not open browser, returning fallback target");
            Ok(OpenOutcome {
                opened: false,
                target: resolved,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::customers::{self, CustomerInput};
    use crate::db;
    use crate::loyalty::{ConsumptionInput, NewProgram, ProgramAdjustment};
    use crate::session::Session;
    use chrono::TimeZone;

    fn snapshot() -> TicketSnapshot {
        TicketSnapshot {
            client: TicketClient {
                name: "Ana <López>".to_string(),
                program_type: "lona".to_string(),
                total_meters: 100.0,
                remaining_meters: 55.5,
                phone: Some("+52 (55) 1234-5678".to_string()),
            },
            order: TicketOrder {
                entry_type: EntryType::Consumo,
                meters_consumed: 4.5,
                remaining_before: None,
                folio: Some("PROG-00042".to_string()),
                recorded_at: "2026-03-14T10:30:00+00:00".to_string(),
                recorded_by: "Luis".to_string(),
                notes: Some("lona & ojillos".to_string()),
            },
        }
    }

    fn layout() -> TicketLayout {
        TicketLayout {
            business_name: "Imprenta Centro".to_string(),
            footer: None,
        }
    }

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 14, 11, 0, 0).unwrap()
    }

    #[test]
    fn ticket_shows_balances_and_escapes_text() {
        let html = render_ticket_html(&snapshot(), &layout(), at());
        assert!(html.starts_with("<!DOCTYPE html>"));
        assert!(html.contains("80mm"));
        assert!(html.contains("Ana &lt;López&gt;"));
        assert!(!html.contains("Ana <López>"));
        assert!(html.contains("lona &amp; ojillos"));
        assert!(html.contains("60.00 m"));
        assert!(html.contains("4.50 m"));
        assert!(html.contains("55.50 m"));
        assert!(html.contains("100.00 m"));
        assert!(html.contains(">042<"));
        assert!(html.contains("Firma del cliente"));
        assert!(html.contains("14/03/2026 10:30"));
    }

    #[test]
    fn ticket_is_deterministic_for_same_input_and_time() {
        let a = render_ticket_html(&snapshot(), &layout(), at());
        let b = render_ticket_html(&snapshot(), &layout(), at());
        assert_eq!(a, b);
        let later = render_ticket_html(&snapshot(), &layout(), at() + chrono::Duration::seconds(1));
        assert_ne!(a, later);
    }

    #[test]
    fn missing_folio_renders_placeholder() {
        let mut snap = snapshot();
        snap.order.folio = None;
        let html = render_ticket_html(&snap, &layout(), at());
        assert!(html.contains(">---<"));
    }

    #[test]
    fn whatsapp_url_strips_phone_and_encodes_text() {
        let message = whatsapp_message(&snapshot(), &layout());
        assert!(message.starts_with("Hola Ana <López>"));
        assert!(message.contains("Saldo anterior: 60.00 m"));

        let url = whatsapp_url("+52 (55) 1234-5678", &message).unwrap();
        assert!(url.starts_with("https://wa.me/525512345678?text=Hola%20Ana%20%3CL%C3%B3pez%3E"));
        assert!(!url.contains(' '));
        assert!(!url.contains('\n'));
        assert!(url.contains("%0A"));
        assert!(validate_external_url(&url).is_ok());
    }

    #[test]
    fn whatsapp_url_requires_digits() {
        assert!(matches!(
            whatsapp_url("sin número", "hola"),
            Err(AppError::Validation(_))
        ));
    }

    #[test]
    fn snapshot_is_built_from_stored_rows() {
        let state = db::test_state();
        let session = Session::for_test("Luis");
        let customer = customers::create(
            &state,
            &CustomerInput {
                name: "Ana".to_string(),
                phone: Some("55 1111 2222".to_string()),
                ..CustomerInput::default()
            },
        )
        .unwrap();
        let program = loyalty::create_program(
            &state,
            &session,
            &NewProgram {
                customer_id: customer.id.clone(),
                program_type: "vinil".to_string(),
                total_meters: 30.0,
                purchase_date: None,
                notes: None,
                assign_folio: true,
            },
            1,
        )
        .unwrap();
        let receipt = loyalty::register_consumption(
            &state,
            &session,
            &ConsumptionInput {
                program_id: program.id.clone(),
                meters: 7.5,
                notes: None,
            },
            1,
        )
        .unwrap();

        let snap = snapshot_for_history(&state, &receipt.history.id).unwrap();
        assert_eq!(snap.client.name, "Ana");
        assert_eq!(snap.client.remaining_meters, 22.5);
        assert_eq!(snap.balance_before(), 30.0);
        assert_eq!(snap.client.phone.as_deref(), Some("55 1111 2222"));
        assert_eq!(snap.order.recorded_by, "Luis");
        assert!(snapshot_for_history(&state, "missing").is_err());
    }

    #[test]
    fn adjustment_rows_render_as_adjustments_with_stored_balance() {
        let state = db::test_state();
        let session = Session::for_test("Luis");
        let customer = customers::create(
            &state,
            &CustomerInput {
                name: "Ana".to_string(),
                ..CustomerInput::default()
            },
        )
        .unwrap();
        let program = loyalty::create_program(
            &state,
            &session,
            &NewProgram {
                customer_id: customer.id.clone(),
                program_type: "vinil".to_string(),
                total_meters: 30.0,
                purchase_date: None,
                notes: None,
                assign_folio: true,
            },
            1,
        )
        .unwrap();
        loyalty::register_consumption(
            &state,
            &session,
            &ConsumptionInput {
                program_id: program.id.clone(),
                meters: 7.5,
                notes: None,
            },
            1,
        )
        .unwrap();
        {
            let conn = state.lock().unwrap();
            conn.execute(
                "UPDATE loyalty_programs SET remaining_meters = 20 WHERE id = ?1",
                rusqlite::params![program.id],
            )
            .unwrap();
        }
        loyalty::adjust_program(
            &state,
            &session,
            &program.id,
            &ProgramAdjustment {
                total_meters: None,
                remaining_meters: Some(25.0),
                reason: "Reimpresión por defecto".to_string(),
                authorized_by: "Gerente".to_string(),
            },
        )
        .unwrap();

        let adjustment = loyalty::program_history(&state, &program.id)
            .unwrap()
            .into_iter()
            .find(|h| h.entry_type == EntryType::Ajuste)
            .unwrap();
        let snap = snapshot_for_history(&state, &adjustment.id).unwrap();
        assert_eq!(snap.order.entry_type, EntryType::Ajuste);
        assert_eq!(snap.balance_before(), 20.0);
        assert_eq!(snap.client.remaining_meters, 25.0);

        let html = render_ticket_html(&snap, &layout(), at());
        assert!(html.contains("Ticket de ajuste"));
        assert!(!html.contains("Ticket de consumo"));
        assert!(!html.contains("Consumido"));
        assert!(html.contains("+2.50 m"));
        assert!(html.contains("20.00 m"));

        let message = whatsapp_message(&snap, &layout());
        assert!(message.contains("el ajuste de tu programa"));
        assert!(message.contains("Ajuste: +2.50 m"));
        assert!(message.contains("Saldo anterior: 20.00 m"));
    }

    #[test]
    fn ticket_file_is_written_under_dir() {
        let dir = std::env::temp_dir().join(format!("desk_tickets_{}", uuid::Uuid::new_v4()));
        let path = write_ticket_file(&dir, &snapshot(), &layout(), at()).unwrap();
        assert_eq!(
            path.file_name().and_then(|n| n.to_str()),
            Some("ticket-042-20260314110000.html")
        );
        let written = fs::read_to_string(&path).unwrap();
        assert_eq!(written, render_ticket_html(&snapshot(), &layout(), at()));
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn open_rejects_unknown_targets() {
        assert!(open_in_browser("https://evil.example/x").is_err());
        assert!(matches!(
            open_in_browser("/definitely/not/here.html"),
            Err(AppError::Browser { .. })
        ));
    }
}
