//! Customer portal credentials.
//!
//! Each customer gets at most one `(access_id, password)` pair. The access
//! id is a sequential number starting at the configured base; the password
//! is random and only its bcrypt hash is stored. The plaintext leaves this
//! module exactly once, inside [`IssuedCredential`].

use chrono::Utc;
use rand::Rng;
use rusqlite::{params, OptionalExtension, TransactionBehavior};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::db::DbState;
use crate::error::{AppError, AppResult};
use crate::folio::{self, SequenceColumn};

pub const PASSWORD_LEN: usize = 8;

/// No `0/O`, `1/l/I`: the password is read aloud or copied from a ticket.
const PASSWORD_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnpqrstuvwxyz23456789";

/// Returned once, at issue time. Wiped from memory when dropped.
#[derive(Debug, Serialize, Zeroize, ZeroizeOnDrop)]
#[serde(rename_all = "camelCase")]
pub struct IssuedCredential {
    pub customer_id: String,
    pub access_id: String,
    pub password: String,
    pub rotated: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CredentialInfo {
    pub customer_id: String,
    pub access_id: String,
    pub created_at: String,
    pub updated_at: String,
}

fn generate_password() -> String {
    let mut rng = rand::rng();
    (0..PASSWORD_LEN)
        .map(|_| PASSWORD_ALPHABET[rng.random_range(0..PASSWORD_ALPHABET.len())] as char)
        .collect()
}

/// Issue portal access for a customer, or rotate the password of an
/// existing credential (the access id is kept).
pub fn issue(db: &DbState, customer_id: &str, access_id_base: i64) -> AppResult<IssuedCredential> {
    issue_with_cost(db, customer_id, access_id_base, bcrypt::DEFAULT_COST)
}

fn issue_with_cost(
    db: &DbState,
    customer_id: &str,
    access_id_base: i64,
    cost: u32,
) -> AppResult<IssuedCredential> {
    let password = generate_password();
    // Hash before taking the lock.
    let hash = bcrypt::hash(&password, cost)?;

    let mut conn = db.lock()?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let customer: Option<i64> = tx
        .query_row(
            "SELECT 1 FROM customers_ WHERE id = ?1",
            params![customer_id],
            |row| row.get(0),
        )
        .optional()?;
    if customer.is_none() {
        return Err(AppError::not_found("customer", customer_id));
    }

    let existing: Option<String> = tx
        .query_row(
            "SELECT access_id FROM client_access_credentials WHERE customer_id = ?1",
            params![customer_id],
            |row| row.get(0),
        )
        .optional()?;

    let now = Utc::now().to_rfc3339();
    let (access_id, rotated) = match existing {
        Some(access_id) => {
            tx.execute(
                "UPDATE client_access_credentials
                 SET password_hash = ?1, updated_at = ?2
                 WHERE customer_id = ?3",
                params![hash, now, customer_id],
            )?;
            (access_id, true)
        }
        None => {
            let access_id =
                folio::next_sequential(&tx, SequenceColumn::AccessId, access_id_base)?.to_string();
            tx.execute(
                "INSERT INTO client_access_credentials
                    (id, customer_id, access_id, password_hash, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                params![Uuid::new_v4().to_string(), customer_id, access_id, hash, now],
            )?;
            (access_id, false)
        }
    };
    tx.commit()?;

    info!(customer_id, access_id = %access_id, rotated, "Portal credential issued");
    Ok(IssuedCredential {
        customer_id: customer_id.to_string(),
        access_id,
        password,
        rotated,
    })
}

/// Check a portal login. Unknown ids and wrong passwords both give `false`.
pub fn verify(db: &DbState, access_id: &str, password: &str) -> AppResult<bool> {
    let hash: Option<String> = {
        let conn = db.lock()?;
        conn.query_row(
            "SELECT password_hash FROM client_access_credentials WHERE access_id = ?1",
            params![access_id.trim()],
            |row| row.get(0),
        )
        .optional()?
    };

    let Some(hash) = hash else {
        return Ok(false);
    };
    match bcrypt::verify(password, &hash) {
        Ok(ok) => Ok(ok),
        Err(e) => {
            warn!(access_id, error = %e, "Stored credential hash is unreadable");
            Ok(false)
        }
    }
}

pub fn get_for_customer(db: &DbState, customer_id: &str) -> AppResult<Option<CredentialInfo>> {
    let conn = db.lock()?;
    let info = conn
        .query_row(
            "SELECT customer_id, access_id, created_at, updated_at
             FROM client_access_credentials WHERE customer_id = ?1",
            params![customer_id],
            |row| {
                Ok(CredentialInfo {
                    customer_id: row.get(0)?,
                    access_id: row.get(1)?,
                    created_at: row.get(2)?,
                    updated_at: row.get(3)?,
                })
            },
        )
        .optional()?;
    Ok(info)
}

pub fn revoke(db: &DbState, customer_id: &str) -> AppResult<()> {
    let conn = db.lock()?;
    let removed = conn.execute(
        "DELETE FROM client_access_credentials WHERE customer_id = ?1",
        params![customer_id],
    )?;
    if removed == 0 {
        return Err(AppError::not_found("access credential", customer_id));
    }
    info!(customer_id, "Portal credential revoked");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::customers::{self, CustomerInput};
    use crate::db;

    const TEST_COST: u32 = 4;

    fn customer(state: &DbState, name: &str) -> String {
        customers::create(
            state,
            &CustomerInput {
                name: name.to_string(),
                ..CustomerInput::default()
            },
        )
        .unwrap()
        .id
    }

    #[test]
    fn password_uses_unambiguous_alphabet() {
        for _ in 0..100 {
            let pw = generate_password();
            assert_eq!(pw.len(), PASSWORD_LEN);
            assert!(pw.bytes().all(|b| PASSWORD_ALPHABET.contains(&b)));
            assert!(!pw.contains('0') && !pw.contains('O') && !pw.contains('l'));
        }
    }

    #[test]
    fn access_ids_are_sequential_from_base() {
        let state = db::test_state();
        let ana = customer(&state, "Ana");
        let beto = customer(&state, "Beto");

        let first = issue_with_cost(&state, &ana, 1000, TEST_COST).unwrap();
        let second = issue_with_cost(&state, &beto, 1000, TEST_COST).unwrap();
        assert_eq!(first.access_id, "1000");
        assert_eq!(second.access_id, "1001");
        assert!(!first.rotated);
    }

    #[test]
    fn verify_accepts_only_the_issued_password() {
        let state = db::test_state();
        let ana = customer(&state, "Ana");
        let issued = issue_with_cost(&state, &ana, 1000, TEST_COST).unwrap();

        assert!(verify(&state, &issued.access_id, &issued.password).unwrap());
        assert!(!verify(&state, &issued.access_id, "wrong-pw").unwrap());
        assert!(!verify(&state, "9999", &issued.password).unwrap());

        let stored: String = state
            .lock()
            .unwrap()
            .query_row(
                "SELECT password_hash FROM client_access_credentials WHERE customer_id = ?1",
                params![ana],
                |row| row.get(0),
            )
            .unwrap();
        assert_ne!(stored, issued.password);
    }

    #[test]
    fn rotating_keeps_access_id_and_replaces_password() {
        let state = db::test_state();
        let ana = customer(&state, "Ana");
        let first = issue_with_cost(&state, &ana, 1000, TEST_COST).unwrap();
        let second = issue_with_cost(&state, &ana, 1000, TEST_COST).unwrap();

        assert!(second.rotated);
        assert_eq!(second.access_id, first.access_id);
        assert!(verify(&state, &second.access_id, &second.password).unwrap());
        if first.password != second.password {
            assert!(!verify(&state, &first.access_id, &first.password).unwrap());
        }
    }

    #[test]
    fn info_and_revoke() {
        let state = db::test_state();
        let ana = customer(&state, "Ana");
        assert!(get_for_customer(&state, &ana).unwrap().is_none());
        assert!(issue_with_cost(&state, "ghost", 1000, TEST_COST).is_err());

        let issued = issue_with_cost(&state, &ana, 1000, TEST_COST).unwrap();
        let info = get_for_customer(&state, &ana).unwrap().unwrap();
        assert_eq!(info.access_id, issued.access_id);
        let serialized = serde_json::to_string(&info).unwrap();
        assert!(!serialized.contains("password"));

        revoke(&state, &ana).unwrap();
        assert!(get_for_customer(&state, &ana).unwrap().is_none());
        assert!(revoke(&state, &ana).is_err());
    }
}
