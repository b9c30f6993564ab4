//! Operator session passed explicitly to every mutating operation.
//!
//! The station identity (`user_id`, `register_id`) is generated once and
//! persisted in `local_settings` (category `session`); the operator name is
//! whoever is working the counter right now.

use rusqlite::Connection;
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::db;
use crate::error::{AppError, AppResult};

const SESSION_SETTINGS: &str = "session";
const KEY_USER_ID: &str = "user_id";
const KEY_REGISTER_ID: &str = "register_id";
const KEY_OPERATOR: &str = "operator_name";

pub const DEFAULT_OPERATOR: &str = "Mostrador";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub user_id: String,
    pub register_id: String,
    pub operator_name: String,
}

impl Session {
    /// Load the persisted station identity, creating it on first use.
    ///
    /// `operator_name` overrides the last stored operator when given.
    pub fn load_or_create(conn: &Connection, operator_name: Option<&str>) -> AppResult<Self> {
        let user_id = get_or_generate(conn, KEY_USER_ID)?;
        let register_id = get_or_generate(conn, KEY_REGISTER_ID)?;

        let operator_name = match operator_name.map(str::trim).filter(|s| !s.is_empty()) {
            Some(name) => {
                db::set_setting(conn, SESSION_SETTINGS, KEY_OPERATOR, name)?;
                name.to_string()
            }
            None => db::get_setting(conn, SESSION_SETTINGS, KEY_OPERATOR)
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_OPERATOR.to_string()),
        };

        Ok(Self {
            user_id,
            register_id,
            operator_name,
        })
    }

    /// Change the operator recorded on subsequent history rows and cash cuts.
    pub fn set_operator(&mut self, conn: &Connection, name: &str) -> AppResult<()> {
        let name = name.trim();
        if name.is_empty() {
            return Err(AppError::validation("Operator name is required"));
        }
        db::set_setting(conn, SESSION_SETTINGS, KEY_OPERATOR, name)?;
        info!(register_id = %self.register_id, operator = %name, "Operator changed");
        self.operator_name = name.to_string();
        Ok(())
    }

    /// Session for unit tests that never touches the database.
    #[cfg(test)]
    pub fn for_test(operator_name: &str) -> Self {
        Self {
            user_id: "user-test".to_string(),
            register_id: "register-test".to_string(),
            operator_name: operator_name.to_string(),
        }
    }
}

fn get_or_generate(conn: &Connection, key: &str) -> AppResult<String> {
    if let Some(existing) = db::get_setting(conn, SESSION_SETTINGS, key) {
        if !existing.trim().is_empty() {
            return Ok(existing);
        }
    }
    let generated = Uuid::new_v4().to_string();
    db::set_setting(conn, SESSION_SETTINGS, key, &generated)?;
    info!(key, "Generated station identifier");
    Ok(generated)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_is_stable_across_loads() {
        let state = db::test_state();
        let conn = state.lock().unwrap();

        let first = Session::load_or_create(&conn, None).unwrap();
        let second = Session::load_or_create(&conn, None).unwrap();
        assert_eq!(first.user_id, second.user_id);
        assert_eq!(first.register_id, second.register_id);
        assert_ne!(first.user_id, first.register_id);
        assert_eq!(first.operator_name, DEFAULT_OPERATOR);
    }

    #[test]
    fn operator_is_remembered() {
        let state = db::test_state();
        let conn = state.lock().unwrap();

        let mut session = Session::load_or_create(&conn, Some("Luis")).unwrap();
        assert_eq!(session.operator_name, "Luis");

        session.set_operator(&conn, "  Marta ").unwrap();
        assert_eq!(session.operator_name, "Marta");

        let reloaded = Session::load_or_create(&conn, None).unwrap();
        assert_eq!(reloaded.operator_name, "Marta");
    }

    #[test]
    fn blank_operator_is_rejected() {
        let state = db::test_state();
        let conn = state.lock().unwrap();
        let mut session = Session::load_or_create(&conn, None).unwrap();
        assert!(session.set_operator(&conn, "   ").is_err());
    }
}
