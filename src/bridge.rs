//! JSON-lines bridge between a front end and [`commands::invoke`].
//!
//! Each input line is `{"id": ..., "command": "...", "payload": {...}}`.
//! Each reply is one line: `{"id": ..., "ok": true, "data": ...}` or
//! `{"id": ..., "ok": false, "error": "..."}`. Replies go out in request
//! order. Logs go to stderr and the log file, never to stdout.

use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};

use crate::error::AppResult;
use crate::session::Session;
use crate::{commands, db, diagnostics, reconcile, AppConfig, AppContext};

#[derive(Debug, Deserialize)]
struct BridgeRequest {
    #[serde(default)]
    id: Value,
    command: String,
    #[serde(default)]
    payload: Value,
}

async fn handle_line(ctx: &Arc<AppContext>, line: &str) -> Value {
    let request: BridgeRequest = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(e) => {
            warn!(error = %e, "Malformed bridge request");
            return json!({ "id": Value::Null, "ok": false, "error": format!("Malformed request: {e}") });
        }
    };

    let id = request.id;
    let task_ctx = ctx.clone();
    let result = tokio::task::spawn_blocking(move || {
        commands::invoke(&task_ctx, &request.command, request.payload)
    })
    .await;

    match result {
        Ok(Ok(data)) => json!({ "id": id, "ok": true, "data": data }),
        Ok(Err(error)) => json!({ "id": id, "ok": false, "error": error }),
        Err(e) => json!({ "id": id, "ok": false, "error": format!("Command task failed: {e}") }),
    }
}

/// Serve requests until `reader` hits EOF. Returns how many were answered.
pub async fn serve<R, W>(ctx: Arc<AppContext>, mut reader: R, mut writer: W) -> AppResult<usize>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = Vec::new();
    let mut handled = 0usize;

    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf).await? == 0 {
            break;
        }
        let reply = match std::str::from_utf8(&buf) {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                handle_line(&ctx, line).await
            }
            Err(e) => {
                warn!(error = %e, "Bridge request is not valid UTF-8");
                json!({ "id": Value::Null, "ok": false, "error": format!("Malformed request: {e}") })
            }
        };
        let mut out = serde_json::to_vec(&reply)?;
        out.push(b'\n');
        writer.write_all(&out).await?;
        writer.flush().await?;
        handled += 1;
    }

    debug!(handled, "Bridge reader closed");
    Ok(handled)
}

/// Process entry point: configuration, logging, database, session, the
/// background reconcile sweep, then the stdin/stdout bridge.
pub async fn run() -> AppResult<()> {
    let mut config = AppConfig::from_env();
    // Dropping the guard flushes the log file, so it lives until return.
    let _log_guard = diagnostics::init_logging(&config, true)?;
    info!("Starting Print Shop Desk v{}", env!("CARGO_PKG_VERSION"));

    let db = Arc::new(db::init(&config.data_dir)?);
    let session = {
        let conn = db.lock()?;
        config.apply_settings(&conn);
        Session::load_or_create(&conn, None)?
    };
    info!(
        register_id = %session.register_id,
        operator = %session.operator_name,
        data_dir = %config.data_dir.display(),
        "Session ready"
    );

    let interval = config.reconcile_interval_secs;
    let ctx = Arc::new(AppContext::new(db, config, session));
    if interval > 0 {
        reconcile::start_reconcile_loop(ctx.db.clone(), ctx.reconcile.clone(), interval)?;
    } else {
        info!("Background reconciliation disabled");
    }

    let served = serve(
        ctx.clone(),
        BufReader::new(tokio::io::stdin()),
        tokio::io::stdout(),
    )
    .await;
    reconcile::stop_reconcile_loop(&ctx.reconcile);

    let handled = served?;
    info!(requests = handled, "Bridge input closed, shutting down");
    Ok(())
}
