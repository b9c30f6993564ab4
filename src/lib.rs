//! Print Shop Desk backend.
//!
//! Domain logic for a print shop counter: cash cuts counted by
//! denomination, customers and their loyalty meters packages, the
//! consumption ledger with its reconciler, ticket and WhatsApp rendering,
//! portal access credentials and the spreadsheet export.
//!
//! Front ends talk to it through [`commands::invoke`], either in-process or
//! through the JSON-lines bridge binary.

use std::sync::{Arc, Mutex, MutexGuard};

pub mod bridge;
pub mod cash_cuts;
pub mod commands;
pub mod config;
pub mod credentials;
pub mod customers;
mod data_helpers;
pub mod db;
pub mod denominations;
pub mod diagnostics;
pub mod error;
pub mod export;
pub mod folio;
pub mod loyalty;
pub mod reconcile;
pub mod session;
pub mod ticket;

pub use bridge::run;
pub use config::AppConfig;
pub use error::{AppError, AppResult};

use db::DbState;
use reconcile::ReconcileState;
use session::Session;

/// Everything a command handler needs, shared by the bridge and the
/// background sweep.
pub struct AppContext {
    pub db: Arc<DbState>,
    pub config: AppConfig,
    pub session: Mutex<Session>,
    pub reconcile: Arc<ReconcileState>,
}

impl AppContext {
    pub fn new(db: Arc<DbState>, config: AppConfig, session: Session) -> Self {
        Self {
            db,
            config,
            session: Mutex::new(session),
            reconcile: Arc::new(ReconcileState::new()),
        }
    }

    pub fn session(&self) -> AppResult<MutexGuard<'_, Session>> {
        self.session.lock().map_err(|_| AppError::Lock)
    }

    /// Copy of the current session, so the session lock is never held while
    /// the database lock is taken.
    pub fn session_snapshot(&self) -> AppResult<Session> {
        Ok(self.session()?.clone())
    }
}

/// Round to 2 decimal places (meters and money).
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

pub(crate) fn value_str(v: &serde_json::Value, keys: &[&str]) -> Option<String> {
    for key in keys {
        if let Some(s) = v.get(*key).and_then(|x| x.as_str()) {
            let trimmed = s.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }
    None
}

pub(crate) fn value_i64(v: &serde_json::Value, keys: &[&str]) -> Option<i64> {
    for key in keys {
        if let Some(n) = v.get(*key).and_then(|x| x.as_i64()) {
            return Some(n);
        }
    }
    None
}

pub(crate) fn value_bool(v: &serde_json::Value, keys: &[&str]) -> Option<bool> {
    for key in keys {
        match v.get(*key) {
            Some(serde_json::Value::Bool(b)) => return Some(*b),
            Some(serde_json::Value::Number(n)) => return n.as_i64().map(|n| n != 0),
            _ => {}
        }
    }
    None
}
