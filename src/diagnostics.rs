//! Diagnostics module for Print Shop Desk.
//!
//! Provides:
//! - **About info**: version, build timestamp, git SHA, platform
//! - **System health**: program counts, ledger drift, open cash cut drafts
//! - **Logging**: subscriber setup with a daily rolling file and log pruning

use rusqlite::Connection;
use serde_json::{json, Value};
use std::fs;
use std::path::Path;
use tracing::warn;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::AppConfig;
use crate::db::{self, DbState};
use crate::error::AppResult;

/// Maximum number of log files to retain.
pub const MAX_LOG_FILES: usize = 10;

/// Prefix of the rolling log files (`desk.2026-10-19`).
pub const LOG_FILE_PREFIX: &str = "desk";

const DEFAULT_LOG_FILTER: &str = "info,printshop_desk_lib=debug,printshop_desk=debug";

// ---------------------------------------------------------------------------
// About info
// ---------------------------------------------------------------------------

/// Returns version, build timestamp, git SHA, and platform info.
pub fn get_about_info() -> Value {
    json!({
        "version": env!("CARGO_PKG_VERSION"),
        "buildTimestamp": env!("BUILD_TIMESTAMP"),
        "gitSha": env!("BUILD_GIT_SHA"),
        "platform": std::env::consts::OS,
        "arch": std::env::consts::ARCH,
        "rustVersion": env!("CARGO_PKG_RUST_VERSION"),
    })
}

// ---------------------------------------------------------------------------
// System health
// ---------------------------------------------------------------------------

/// Collects health figures for the back-office status screen.
pub fn get_system_health(db: &DbState) -> AppResult<Value> {
    let conn = db.lock()?;

    let schema_version = db::schema_version(&conn);
    let programs_by_status = count_programs_by_status(&conn)?;
    let drifted_programs = count_drifted_programs(&conn)?;
    let open_drafts: i64 = conn.query_row(
        "SELECT COUNT(*) FROM cash_cuts WHERE is_draft = 1",
        [],
        |row| row.get(0),
    )?;
    let last_cash_cut: Option<String> = conn
        .query_row(
            "SELECT MAX(finalized_at) FROM cash_cuts WHERE is_draft = 0",
            [],
            |row| row.get(0),
        )
        .unwrap_or(None);
    let db_size = fs::metadata(&db.db_path).map(|m| m.len()).unwrap_or(0);

    Ok(json!({
        "schemaVersion": schema_version,
        "programsByStatus": programs_by_status,
        "driftedPrograms": drifted_programs,
        "openCashCutDrafts": open_drafts,
        "lastCashCutAt": last_cash_cut,
        "databaseSizeBytes": db_size,
    }))
}

fn count_programs_by_status(conn: &Connection) -> AppResult<Value> {
    let mut stmt =
        conn.prepare("SELECT status, COUNT(*) FROM loyalty_programs GROUP BY status")?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
    })?;

    let mut counts = json!({ "activo": 0, "completado": 0, "expirado": 0 });
    for row in rows {
        let (status, count) = row?;
        counts[status] = json!(count);
    }
    Ok(counts)
}

/// Programs whose stored remaining disagrees with `total - sum(history)`.
fn count_drifted_programs(conn: &Connection) -> AppResult<i64> {
    let count = conn.query_row(
        "SELECT COUNT(*) FROM loyalty_programs p
         WHERE ABS(p.remaining_meters - (p.total_meters - COALESCE(
                (SELECT SUM(h.meters_consumed) FROM order_history h WHERE h.program_id = p.id),
                0))) > 0.001",
        [],
        |row| row.get(0),
    )?;
    Ok(count)
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

/// Initialize structured logging: console layer plus a daily rolling file.
///
/// `console_to_stderr` keeps stdout free for the bridge reply channel.
/// The returned guard flushes the file writer when dropped, so keep it alive
/// for the whole process.
pub fn init_logging(config: &AppConfig, console_to_stderr: bool) -> AppResult<WorkerGuard> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    fs::create_dir_all(&config.log_dir)?;
    prune_old_logs(&config.log_dir);

    let file_appender = tracing_appender::rolling::daily(&config.log_dir, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true);

    let registry = tracing_subscriber::registry().with(env_filter).with(file_layer);
    let result = if console_to_stderr {
        registry
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .try_init()
    } else {
        registry.with(fmt::layer().with_target(true)).try_init()
    };
    if let Err(e) = result {
        // A subscriber is already installed (tests, embedding host); keep it.
        warn!("Logging already initialized: {e}");
    }

    Ok(guard)
}

/// Deletes the oldest log files so at most `MAX_LOG_FILES` remain.
pub fn prune_old_logs(log_dir: &Path) {
    let entries = match fs::read_dir(log_dir) {
        Ok(entries) => entries,
        Err(_) => return,
    };

    let mut log_files: Vec<(std::path::PathBuf, std::time::SystemTime)> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(&format!("{LOG_FILE_PREFIX}.")))
        })
        .map(|path| {
            let modified = fs::metadata(&path)
                .and_then(|m| m.modified())
                .unwrap_or(std::time::UNIX_EPOCH);
            (path, modified)
        })
        .collect();

    // Newest first
    log_files.sort_by(|a, b| b.1.cmp(&a.1));

    for (path, _) in log_files.iter().skip(MAX_LOG_FILES) {
        if let Err(e) = fs::remove_file(path) {
            warn!("Failed to prune log file {}: {e}", path.display());
        }
    }
}
