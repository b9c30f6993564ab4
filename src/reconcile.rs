//! Periodic ledger reconciliation.
//!
//! A background tokio task that sweeps every program with
//! [`loyalty::reconcile_all`] so counters that drifted while nobody touched
//! the program still get corrected.

use chrono::Utc;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};

use crate::db::DbState;
use crate::error::{AppError, AppResult};
use crate::loyalty::{self, ReconcileOutcome};

/// Shared state of the sweep.
pub struct ReconcileState {
    pub is_running: Arc<AtomicBool>,
    pub last_run: Arc<Mutex<Option<String>>>,
    pub last_corrections: Arc<Mutex<Vec<ReconcileOutcome>>>,
}

impl ReconcileState {
    pub fn new() -> Self {
        Self {
            is_running: Arc::new(AtomicBool::new(false)),
            last_run: Arc::new(Mutex::new(None)),
            last_corrections: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn status(&self) -> Value {
        let last_run = self.last_run.lock().map(|g| g.clone()).unwrap_or(None);
        let corrections = self
            .last_corrections
            .lock()
            .map(|g| g.clone())
            .unwrap_or_default();
        json!({
            "isRunning": self.is_running.load(Ordering::SeqCst),
            "lastRun": last_run,
            "lastCorrections": corrections,
        })
    }

    fn record(&self, corrections: &[ReconcileOutcome]) {
        if let Ok(mut guard) = self.last_run.lock() {
            *guard = Some(Utc::now().to_rfc3339());
        }
        if let Ok(mut guard) = self.last_corrections.lock() {
            *guard = corrections.to_vec();
        }
    }
}

impl Default for ReconcileState {
    fn default() -> Self {
        Self::new()
    }
}

/// Run one sweep now and remember its result.
pub fn run_once(db: &DbState, state: &ReconcileState) -> AppResult<Vec<ReconcileOutcome>> {
    let corrections = loyalty::reconcile_all(db)?;
    state.record(&corrections);
    Ok(corrections)
}

/// Start the background sweep. Spawns a tokio task that runs every
/// `interval_secs` seconds until [`stop_reconcile_loop`] is called.
pub fn start_reconcile_loop(
    db: Arc<DbState>,
    state: Arc<ReconcileState>,
    interval_secs: u64,
) -> AppResult<tokio::task::JoinHandle<()>> {
    if interval_secs == 0 {
        return Err(AppError::validation("Reconcile interval must be at least 1 second"));
    }
    if state.is_running.swap(true, Ordering::SeqCst) {
        return Err(AppError::conflict("Reconciliation loop is already running"));
    }

    let is_running = state.is_running.clone();
    Ok(tokio::spawn(async move {
        info!("Reconcile loop started (interval: {interval_secs}s)");

        loop {
            tokio::time::sleep(Duration::from_secs(interval_secs)).await;

            if !is_running.load(Ordering::SeqCst) {
                info!("Reconcile loop stopped");
                break;
            }

            let db = db.clone();
            let sweep_state = state.clone();
            let result =
                tokio::task::spawn_blocking(move || run_once(&db, &sweep_state)).await;
            match result {
                Ok(Ok(corrections)) if !corrections.is_empty() => {
                    warn!(corrected = corrections.len(), "Reconcile sweep corrected drifted programs");
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => warn!("Reconcile sweep failed: {e}"),
                Err(e) => warn!("Reconcile sweep task panicked: {e}"),
            }
        }
    }))
}

/// Ask the loop to exit after its current sleep.
pub fn stop_reconcile_loop(state: &ReconcileState) {
    state.is_running.store(false, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use rusqlite::params;

    fn seed_drifted_program(state: &DbState) {
        let conn = state.lock().unwrap();
        conn.execute(
            "INSERT INTO customers_ (id, name, created_at, updated_at)
             VALUES ('c-1', 'Ana', datetime('now'), datetime('now'))",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO loyalty_programs (id, customer_id, program_type, total_meters,
                remaining_meters, purchase_date, created_at, updated_at)
             VALUES ('lp-1', 'c-1', 'vinil', 20, 20, date('now'), datetime('now'), datetime('now'))",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO order_history (id, program_id, customer_id, meters_consumed,
                remaining_before, remaining_after, recorded_by, recorded_at)
             VALUES ('oh-1', 'lp-1', 'c-1', ?1, 20, 12, 'Luis', datetime('now'))",
            params![8.0],
        )
        .unwrap();
    }

    #[test]
    fn run_once_records_corrections() {
        let state = db::test_state();
        seed_drifted_program(&state);
        let reconcile = ReconcileState::new();

        let corrections = run_once(&state, &reconcile).unwrap();
        assert_eq!(corrections.len(), 1);
        assert_eq!(corrections[0].expected_remaining, 12.0);

        let status = reconcile.status();
        assert!(status["lastRun"].is_string());
        assert_eq!(status["lastCorrections"].as_array().unwrap().len(), 1);

        // Second sweep finds nothing left to fix
        assert!(run_once(&state, &reconcile).unwrap().is_empty());
    }

    #[tokio::test]
    async fn background_loop_sweeps_and_stops() {
        let state = Arc::new(db::test_state());
        seed_drifted_program(&state);
        let reconcile = Arc::new(ReconcileState::new());

        let handle = start_reconcile_loop(state.clone(), reconcile.clone(), 1).unwrap();
        assert!(start_reconcile_loop(state.clone(), reconcile.clone(), 1).is_err());

        tokio::time::sleep(Duration::from_millis(1500)).await;
        stop_reconcile_loop(&reconcile);
        tokio::time::timeout(Duration::from_secs(3), handle)
            .await
            .expect("loop exits after stop")
            .unwrap();

        let remaining: f64 = state
            .lock()
            .unwrap()
            .query_row(
                "SELECT remaining_meters FROM loyalty_programs WHERE id = 'lp-1'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(remaining, 12.0);
        assert!(!reconcile.is_running.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn zero_interval_is_rejected() {
        let state = Arc::new(db::test_state());
        let reconcile = Arc::new(ReconcileState::new());
        assert!(start_reconcile_loop(state, reconcile.clone(), 0).is_err());
        assert!(!reconcile.is_running.load(Ordering::SeqCst));
    }
}
