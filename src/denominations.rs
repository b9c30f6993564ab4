//! Denomination counting for cash cuts.
//!
//! The counter is a pure function over `(value, quantity)` lines. Quantities
//! arrive straight from form inputs, so blanks and garbage count as zero
//! instead of poisoning the total with NaN.

use rusqlite::{params, Connection};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::{AppError, AppResult};

/// One row of a denomination count.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DenominationLine {
    pub value: f64,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default, deserialize_with = "lenient_quantity")]
    pub quantity: f64,
}

impl DenominationLine {
    pub fn new(value: f64, quantity: f64) -> Self {
        Self {
            value,
            label: None,
            quantity: sanitize_quantity(quantity),
        }
    }

    pub fn subtotal(&self) -> f64 {
        let value = if self.value.is_finite() { self.value } else { 0.0 };
        value * sanitize_quantity(self.quantity)
    }

    /// Label shown on the cut; falls back to the formatted value.
    pub fn display_label(&self) -> String {
        self.label
            .as_deref()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format_currency(self.value, "$"))
    }
}

/// `Σ value × quantity`; blank or invalid quantities count as zero.
pub fn denomination_total(lines: &[DenominationLine]) -> f64 {
    lines.iter().map(DenominationLine::subtotal).sum()
}

fn sanitize_quantity(quantity: f64) -> f64 {
    if quantity.is_finite() && quantity > 0.0 {
        quantity
    } else {
        0.0
    }
}

/// Interpret a raw JSON quantity: numbers and numeric strings count,
/// everything else (`""`, `null`, text) is zero.
pub fn quantity_from_value(value: &Value) -> f64 {
    let parsed = match value {
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        Value::String(s) => s.trim().parse::<f64>().unwrap_or(0.0),
        _ => 0.0,
    };
    sanitize_quantity(parsed)
}

fn lenient_quantity<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Value>::deserialize(deserializer)?;
    Ok(raw.as_ref().map(quantity_from_value).unwrap_or(0.0))
}

/// Display formatting: symbol, `,` thousands, `.` decimals, two places.
pub fn format_currency(amount: f64, symbol: &str) -> String {
    let amount = if amount.is_finite() { amount } else { 0.0 };
    let cents = (amount.abs() * 100.0).round() as u64;
    let whole = (cents / 100).to_string();
    let fraction = cents % 100;

    let mut grouped = String::with_capacity(whole.len() + whole.len() / 3);
    for (i, ch) in whole.chars().enumerate() {
        if i > 0 && (whole.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }

    let sign = if amount < 0.0 && cents > 0 { "-" } else { "" };
    format!("{sign}{symbol}{grouped}.{fraction:02}")
}

// ---------------------------------------------------------------------------
// Catalog
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Denomination {
    pub id: i64,
    pub value: f64,
    pub label: String,
    pub kind: String,
    pub sort_order: i64,
    pub is_active: bool,
}

/// Denominations in counting order (largest bill first).
pub fn list_denominations(conn: &Connection, include_inactive: bool) -> AppResult<Vec<Denomination>> {
    let mut stmt = conn.prepare(
        "SELECT id, value, label, kind, sort_order, is_active
         FROM denominations
         WHERE (?1 = 1 OR is_active = 1)
         ORDER BY sort_order, value DESC",
    )?;
    let rows = stmt.query_map(params![include_inactive as i64], |row| {
        Ok(Denomination {
            id: row.get(0)?,
            value: row.get(1)?,
            label: row.get(2)?,
            kind: row.get(3)?,
            sort_order: row.get(4)?,
            is_active: row.get::<_, i64>(5)? != 0,
        })
    })?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

pub fn set_denomination_active(conn: &Connection, id: i64, active: bool) -> AppResult<()> {
    let changed = conn.execute(
        "UPDATE denominations SET is_active = ?1 WHERE id = ?2",
        params![active as i64, id],
    )?;
    if changed == 0 {
        return Err(AppError::not_found("denomination", id.to_string()));
    }
    Ok(())
}

/// Empty count sheet built from the active catalog.
pub fn blank_count_sheet(conn: &Connection) -> AppResult<Vec<DenominationLine>> {
    Ok(list_denominations(conn, false)?
        .into_iter()
        .map(|d| DenominationLine {
            value: d.value,
            label: Some(d.label),
            quantity: 0.0,
        })
        .collect())
}
