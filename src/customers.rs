//! Customer records and the deletion audit trail.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use crate::data_helpers::{like_contains, normalize_phone};
use crate::db::DbState;
use crate::error::{AppError, AppResult};
use crate::session::Session;

const DEFAULT_SEARCH_LIMIT: i64 = 50;

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Customer {
    pub id: String,
    pub name: String,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub notes: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Search row: the customer plus how many programs are still active.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomerSummary {
    #[serde(flatten)]
    pub customer: Customer,
    pub active_programs: i64,
    pub remaining_meters: f64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomerInput {
    pub name: String,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl CustomerInput {
    fn validated(&self) -> AppResult<(String, Option<String>, Option<String>, Option<String>)> {
        let name = self.name.trim();
        if name.is_empty() {
            return Err(AppError::validation("Customer name is required"));
        }
        let email = trimmed(&self.email);
        if let Some(email) = email.as_deref() {
            if !email.contains('@') {
                return Err(AppError::validation(format!("Invalid email: {email}")));
            }
        }
        Ok((name.to_string(), trimmed(&self.phone), email, trimmed(&self.notes)))
    }
}

fn trimmed(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

const CUSTOMER_COLUMNS: &str = "id, name, phone, email, notes, created_at, updated_at";

fn customer_from_row(row: &rusqlite::Row) -> rusqlite::Result<Customer> {
    Ok(Customer {
        id: row.get(0)?,
        name: row.get(1)?,
        phone: row.get(2)?,
        email: row.get(3)?,
        notes: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

pub fn create(db: &DbState, input: &CustomerInput) -> AppResult<Customer> {
    let (name, phone, email, notes) = input.validated()?;
    let id = Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();
    let phone_digits = phone.as_deref().map(normalize_phone);

    let conn = db.lock()?;
    conn.execute(
        "INSERT INTO customers_ (id, name, phone, phone_digits, email, notes, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
        params![id, name, phone, phone_digits, email, notes, now],
    )?;
    info!(customer_id = %id, "Customer created");

    get_with(&conn, &id)
}

pub fn update(db: &DbState, id: &str, input: &CustomerInput) -> AppResult<Customer> {
    let (name, phone, email, notes) = input.validated()?;
    let now = Utc::now().to_rfc3339();
    let phone_digits = phone.as_deref().map(normalize_phone);

    let conn = db.lock()?;
    let changed = conn.execute(
        "UPDATE customers_
         SET name = ?1, phone = ?2, phone_digits = ?3, email = ?4, notes = ?5, updated_at = ?6
         WHERE id = ?7",
        params![name, phone, phone_digits, email, notes, now, id],
    )?;
    if changed == 0 {
        return Err(AppError::not_found("customer", id));
    }
    info!(customer_id = %id, "Customer updated");

    get_with(&conn, id)
}

pub fn get(db: &DbState, id: &str) -> AppResult<Customer> {
    let conn = db.lock()?;
    get_with(&conn, id)
}

pub(crate) fn get_with(conn: &Connection, id: &str) -> AppResult<Customer> {
    conn.query_row(
        &format!("SELECT {CUSTOMER_COLUMNS} FROM customers_ WHERE id = ?1"),
        params![id],
        customer_from_row,
    )
    .optional()?
    .ok_or_else(|| AppError::not_found("customer", id))
}

/// Search by name, email or phone digits. Empty query lists the newest.
pub fn search(db: &DbState, query: &str, limit: Option<i64>) -> AppResult<Vec<CustomerSummary>> {
    let query = query.trim();
    let pattern = like_contains(query);
    let digits = normalize_phone(query);
    let digits_pattern = if digits.is_empty() {
        String::new()
    } else {
        like_contains(&digits)
    };
    let limit = limit.filter(|l| *l > 0).unwrap_or(DEFAULT_SEARCH_LIMIT);

    let conn = db.lock()?;
    let mut stmt = conn.prepare(
        "SELECT c.id, c.name, c.phone, c.email, c.notes, c.created_at, c.updated_at,
                COALESCE(SUM(CASE WHEN p.status = 'activo' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN p.status = 'activo' THEN p.remaining_meters ELSE 0 END), 0)
         FROM customers_ c
         LEFT JOIN loyalty_programs p ON p.customer_id = c.id
         WHERE ?1 = ''
            OR c.name LIKE ?2 ESCAPE '\\' COLLATE NOCASE
            OR c.email LIKE ?2 ESCAPE '\\' COLLATE NOCASE
            OR (?3 != '' AND c.phone_digits LIKE ?3 ESCAPE '\\')
         GROUP BY c.id
         ORDER BY c.created_at DESC
         LIMIT ?4",
    )?;
    let rows = stmt.query_map(params![query, pattern, digits_pattern, limit], |row| {
        Ok(CustomerSummary {
            customer: customer_from_row(row)?,
            active_programs: row.get(7)?,
            remaining_meters: row.get(8)?,
        })
    })?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

/// Delete a customer, keeping a JSON snapshot of everything that cascades.
pub fn delete(db: &DbState, session: &Session, id: &str, reason: Option<&str>) -> AppResult<String> {
    let mut conn = db.lock()?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let customer = get_with(&tx, id)?;

    let programs = {
        let mut stmt = tx.prepare(
            "SELECT id, program_type, total_meters, remaining_meters, status, folio, purchase_date
             FROM loyalty_programs WHERE customer_id = ?1 ORDER BY created_at",
        )?;
        let rows = stmt.query_map(params![id], |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "programType": row.get::<_, String>(1)?,
                "totalMeters": row.get::<_, f64>(2)?,
                "remainingMeters": row.get::<_, f64>(3)?,
                "status": row.get::<_, String>(4)?,
                "folio": row.get::<_, Option<String>>(5)?,
                "purchaseDate": row.get::<_, String>(6)?,
            }))
        })?;
        rows.collect::<Result<Vec<_>, _>>()?
    };
    let history_count: i64 = tx.query_row(
        "SELECT COUNT(*) FROM order_history WHERE customer_id = ?1",
        params![id],
        |row| row.get(0),
    )?;
    let access_id: Option<String> = tx
        .query_row(
            "SELECT access_id FROM client_access_credentials WHERE customer_id = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional()?;

    let snapshot = json!({
        "customer": customer,
        "programs": programs,
        "historyCount": history_count,
        "accessId": access_id,
    });

    let audit_id = Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();
    let reason = reason.map(str::trim).filter(|r| !r.is_empty());
    tx.execute(
        "INSERT INTO deleted_clients_audit (id, customer_id, snapshot, reason, deleted_by, deleted_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            audit_id,
            id,
            serde_json::to_string(&snapshot)?,
            reason,
            session.operator_name,
            now
        ],
    )?;
    tx.execute("DELETE FROM customers_ WHERE id = ?1", params![id])?;
    tx.commit()?;

    info!(
        customer_id = %id,
        audit_id = %audit_id,
        deleted_by = %session.operator_name,
        programs = programs.len(),
        "Customer deleted"
    );
    Ok(audit_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn input(name: &str, phone: Option<&str>) -> CustomerInput {
        CustomerInput {
            name: name.to_string(),
            phone: phone.map(str::to_string),
            ..CustomerInput::default()
        }
    }

    #[test]
    fn create_trims_and_reads_back() {
        let state = db::test_state();
        let created = create(&state, &input("  Ana López ", Some(" 55 1234 5678 "))).unwrap();
        assert_eq!(created.name, "Ana López");
        assert_eq!(created.phone.as_deref(), Some("55 1234 5678"));
        assert_eq!(get(&state, &created.id).unwrap(), created);
    }

    #[test]
    fn blank_name_and_bad_email_are_rejected() {
        let state = db::test_state();
        assert!(create(&state, &input("   ", None)).is_err());
        let bad_email = CustomerInput {
            email: Some("ana.example.com".to_string()),
            ..input("Ana", None)
        };
        assert!(create(&state, &bad_email).is_err());
    }

    #[test]
    fn update_missing_customer_is_not_found() {
        let state = db::test_state();
        let err = update(&state, "nope", &input("Ana", None)).unwrap_err();
        assert!(matches!(err, AppError::NotFound { .. }));
    }

    #[test]
    fn search_matches_name_and_phone_digits() {
        let state = db::test_state();
        create(&state, &input("Ana López", Some("55-1234-5678"))).unwrap();
        create(&state, &input("Bruno Díaz", Some("33 9876 5432"))).unwrap();

        let by_name = search(&state, "ana", None).unwrap();
        assert_eq!(by_name.len(), 1);
        assert_eq!(by_name[0].customer.name, "Ana López");

        let by_phone = search(&state, "(33) 9876", None).unwrap();
        assert_eq!(by_phone.len(), 1);
        assert_eq!(by_phone[0].customer.name, "Bruno Díaz");

        assert_eq!(search(&state, "", None).unwrap().len(), 2);
        assert_eq!(search(&state, "", Some(1)).unwrap().len(), 1);
    }

    #[test]
    fn search_treats_wildcards_literally() {
        let state = db::test_state();
        create(&state, &input("Ana López", None)).unwrap();
        create(&state, &input("Textiles 100% Algodón", None)).unwrap();

        let percent = search(&state, "%", None).unwrap();
        assert_eq!(percent.len(), 1);
        assert_eq!(percent[0].customer.name, "Textiles 100% Algodón");
        assert!(search(&state, "_", None).unwrap().is_empty());
    }

    #[test]
    fn delete_writes_one_audit_row_and_cascades() {
        let state = db::test_state();
        let customer = create(&state, &input("Ana", None)).unwrap();
        {
            let conn = state.lock().unwrap();
            conn.execute(
                "INSERT INTO loyalty_programs (id, customer_id, program_type, total_meters,
                    remaining_meters, purchase_date, folio, created_at, updated_at)
                 VALUES ('lp-1', ?1, 'lona', 50, 20, datetime('now'), '004', datetime('now'), datetime('now'))",
                params![customer.id],
            )
            .unwrap();
        }

        let session = Session::for_test("Marta");
        let audit_id = delete(&state, &session, &customer.id, Some("duplicado")).unwrap();

        let conn = state.lock().unwrap();
        let (count, snapshot, deleted_by): (i64, String, String) = conn
            .query_row(
                "SELECT COUNT(*), snapshot, deleted_by FROM deleted_clients_audit WHERE id = ?1",
                params![audit_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(deleted_by, "Marta");
        let snapshot: serde_json::Value = serde_json::from_str(&snapshot).unwrap();
        assert_eq!(snapshot["customer"]["name"], "Ana");
        assert_eq!(snapshot["programs"][0]["folio"], "004");

        let programs: i64 = conn
            .query_row("SELECT COUNT(*) FROM loyalty_programs", [], |row| row.get(0))
            .unwrap();
        assert_eq!(programs, 0);
    }

    #[test]
    fn delete_missing_customer_leaves_no_audit() {
        let state = db::test_state();
        let session = Session::for_test("Marta");
        assert!(delete(&state, &session, "ghost", None).is_err());
        let conn = state.lock().unwrap();
        let audits: i64 = conn
            .query_row("SELECT COUNT(*) FROM deleted_clients_audit", [], |row| row.get(0))
            .unwrap();
        assert_eq!(audits, 0);
    }
}
