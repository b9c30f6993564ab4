//! Runtime configuration.
//!
//! Values come from `PRINTSHOP_*` environment variables with built-in
//! defaults. Business-facing fields can then be overridden from the
//! `local_settings` table (category `business`) so the counter staff can
//! change them without restarting with a new environment.

use rusqlite::Connection;
use serde::Serialize;
use std::path::PathBuf;
use tracing::warn;

use crate::db;

const APP_DIR_NAME: &str = "com.printshop.desk";

pub const ENV_DATA_DIR: &str = "PRINTSHOP_DATA_DIR";
pub const ENV_LOG_DIR: &str = "PRINTSHOP_LOG_DIR";
pub const ENV_BUSINESS_NAME: &str = "PRINTSHOP_BUSINESS_NAME";
pub const ENV_CURRENCY_SYMBOL: &str = "PRINTSHOP_CURRENCY_SYMBOL";
pub const ENV_PROGRAM_EXPIRY_DAYS: &str = "PRINTSHOP_PROGRAM_EXPIRY_DAYS";
pub const ENV_RECONCILE_INTERVAL_SECS: &str = "PRINTSHOP_RECONCILE_INTERVAL_SECS";

/// Settings category holding the business overrides.
pub const BUSINESS_SETTINGS: &str = "business";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    pub data_dir: PathBuf,
    pub log_dir: PathBuf,
    pub business_name: String,
    pub currency_symbol: String,
    /// Days without activity after which an active program is shown as expired.
    pub program_expiry_days: i64,
    /// Background reconciliation period; 0 disables the sweep.
    pub reconcile_interval_secs: u64,
    /// First folio handed out when a table has none yet.
    pub folio_base: i64,
    /// First portal access id handed out when none exist yet.
    pub access_id_base: i64,
}

impl Default for AppConfig {
    fn default() -> Self {
        let data_dir = default_data_dir();
        Self {
            log_dir: data_dir.join("logs"),
            data_dir,
            business_name: "Print Shop".to_string(),
            currency_symbol: "$".to_string(),
            program_expiry_days: 365,
            reconcile_interval_secs: 300,
            folio_base: 1,
            access_id_base: 1000,
        }
    }
}

impl AppConfig {
    /// Build the configuration from the process environment.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Some(dir) = env_string(ENV_DATA_DIR) {
            cfg.data_dir = PathBuf::from(dir);
            cfg.log_dir = cfg.data_dir.join("logs");
        }
        if let Some(dir) = env_string(ENV_LOG_DIR) {
            cfg.log_dir = PathBuf::from(dir);
        }
        if let Some(name) = env_string(ENV_BUSINESS_NAME) {
            cfg.business_name = name;
        }
        if let Some(symbol) = env_string(ENV_CURRENCY_SYMBOL) {
            cfg.currency_symbol = symbol;
        }
        if let Some(days) = env_parsed::<i64>(ENV_PROGRAM_EXPIRY_DAYS).filter(|d| *d > 0) {
            cfg.program_expiry_days = days;
        }
        if let Some(secs) = env_parsed::<u64>(ENV_RECONCILE_INTERVAL_SECS) {
            cfg.reconcile_interval_secs = secs;
        }

        cfg
    }

    /// Apply overrides stored in `local_settings` (category `business`).
    pub fn apply_settings(&mut self, conn: &Connection) {
        if let Some(name) = non_empty(db::get_setting(conn, BUSINESS_SETTINGS, "business_name")) {
            self.business_name = name;
        }
        if let Some(symbol) =
            non_empty(db::get_setting(conn, BUSINESS_SETTINGS, "currency_symbol"))
        {
            self.currency_symbol = symbol;
        }
        if let Some(raw) = db::get_setting(conn, BUSINESS_SETTINGS, "program_expiry_days") {
            match raw.trim().parse::<i64>() {
                Ok(days) if days > 0 => self.program_expiry_days = days,
                _ => warn!(value = %raw, "Ignoring invalid program_expiry_days setting"),
            }
        }
    }

    pub fn tickets_dir(&self) -> PathBuf {
        self.data_dir.join("tickets")
    }

    pub fn exports_dir(&self) -> PathBuf {
        self.data_dir.join("exports")
    }
}

/// Platform data directory, mirroring where desktop apps keep their state.
fn default_data_dir() -> PathBuf {
    let base = std::env::var("LOCALAPPDATA")
        .or_else(|_| std::env::var("XDG_DATA_HOME"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            #[cfg(target_os = "windows")]
            {
                PathBuf::from(std::env::var("USERPROFILE").unwrap_or_else(|_| ".".into()))
                    .join("AppData")
                    .join("Local")
            }
            #[cfg(not(target_os = "windows"))]
            {
                PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()))
                    .join(".local")
                    .join("share")
            }
        });
    base.join(APP_DIR_NAME)
}

fn env_string(key: &str) -> Option<String> {
    non_empty(std::env::var(key).ok())
}

fn env_parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = env_string(key)?;
    match raw.parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key, value = %raw, "Ignoring invalid numeric environment value");
            None
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        for key in [
            ENV_DATA_DIR,
            ENV_LOG_DIR,
            ENV_BUSINESS_NAME,
            ENV_CURRENCY_SYMBOL,
            ENV_PROGRAM_EXPIRY_DAYS,
            ENV_RECONCILE_INTERVAL_SECS,
        ] {
            std::env::remove_var(key);
        }
    }

    #[test]
    #[serial]
    fn defaults_without_environment() {
        clear_env();
        let cfg = AppConfig::from_env();
        assert_eq!(cfg.business_name, "Print Shop");
        assert_eq!(cfg.program_expiry_days, 365);
        assert_eq!(cfg.reconcile_interval_secs, 300);
        assert!(cfg.data_dir.ends_with(APP_DIR_NAME));
        assert_eq!(cfg.log_dir, cfg.data_dir.join("logs"));
    }

    #[test]
    #[serial]
    fn environment_overrides() {
        clear_env();
        std::env::set_var(ENV_DATA_DIR, "/tmp/desk-data");
        std::env::set_var(ENV_BUSINESS_NAME, "Copias Luna");
        std::env::set_var(ENV_RECONCILE_INTERVAL_SECS, "0");
        let cfg = AppConfig::from_env();
        clear_env();

        assert_eq!(cfg.data_dir, PathBuf::from("/tmp/desk-data"));
        assert_eq!(cfg.log_dir, PathBuf::from("/tmp/desk-data/logs"));
        assert_eq!(cfg.business_name, "Copias Luna");
        assert_eq!(cfg.reconcile_interval_secs, 0);
    }

    #[test]
    #[serial]
    fn invalid_numbers_are_ignored() {
        clear_env();
        std::env::set_var(ENV_PROGRAM_EXPIRY_DAYS, "soon");
        std::env::set_var(ENV_RECONCILE_INTERVAL_SECS, "-5");
        let cfg = AppConfig::from_env();
        clear_env();

        assert_eq!(cfg.program_expiry_days, 365);
        assert_eq!(cfg.reconcile_interval_secs, 300);
    }

    #[test]
    fn settings_override_business_fields() {
        let state = db::test_state();
        let conn = state.lock().unwrap();
        db::set_setting(&conn, BUSINESS_SETTINGS, "business_name", "Impresos Norte").unwrap();
        db::set_setting(&conn, BUSINESS_SETTINGS, "program_expiry_days", "90").unwrap();
        db::set_setting(&conn, BUSINESS_SETTINGS, "currency_symbol", "  ").unwrap();

        let mut cfg = AppConfig::default();
        cfg.apply_settings(&conn);
        assert_eq!(cfg.business_name, "Impresos Norte");
        assert_eq!(cfg.program_expiry_days, 90);
        assert_eq!(cfg.currency_symbol, "$");
    }
}
