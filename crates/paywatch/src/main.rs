// paywatch entry point.
//
// Usage: paywatch [CHECKOUT_REQUEST_ID] [AMOUNT]
//
// Startup sequence:
// 1. Initialize tracing (log to file, not terminal)
// 2. Load config
// 3. Open the ledger and pick the attempt to watch (argument or resume)
// 4. Spawn the watcher task
// 5. Run the TUI until redirect or quit
// 6. Print the redirect target

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use paywatch::tui;
use paywatch_app::watcher::{self, WatchContext};
use paywatch_core::config;
use paywatch_core::db::Database;
use paywatch_core::status::CheckoutRequestId;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing()?;
    info!("paywatch starting up");

    let config = config::load_config().context("failed to load configuration")?;
    info!(status = %config.endpoints.status, "config loaded");

    let db = Database::open(&config.db_path).context("failed to open database")?;
    info!("Database opened at {}", config.db_path);

    let args: Vec<String> = std::env::args().skip(1).collect();
    let (id, amount) = resolve_attempt(&args, &db)?;
    info!(checkout_request_id = %id, "watching attempt");

    let ctx = WatchContext::from_config(&config, id, amount, Arc::new(db))
        .context("failed to build watcher")?;

    let (cmd_tx, cmd_rx) = mpsc::channel(64);
    let (ui_tx, ui_rx) = mpsc::channel(256);

    let watch_handle = tokio::spawn(async move {
        match watcher::run(ctx, cmd_rx, ui_tx).await {
            Ok(summary) => {
                info!(
                    status = %summary.status,
                    checks = summary.checks,
                    transport = %summary.transport,
                    "watcher finished"
                );
                Some(summary)
            }
            Err(e) => {
                error!("watcher error: {e:#}");
                None
            }
        }
    });

    let redirect = match tui::run(ui_rx, cmd_tx).await {
        Ok(redirect) => redirect,
        Err(e) => {
            error!("TUI error: {e:#}");
            None
        }
    };

    // `tui::run` consumed the command sender; an unsettled watcher stops as
    // soon as it sees the channel close, a settled one after its redirect.
    let summary = match tokio::time::timeout(Duration::from_secs(5), watch_handle).await {
        Ok(Ok(summary)) => summary,
        Ok(Err(e)) => {
            error!("watcher task failed: {e}");
            None
        }
        Err(_) => {
            warn!("watcher did not stop in time");
            None
        }
    };

    if let Some(summary) = &summary {
        println!("Payment status: {}", summary.status);
    }
    if let Some(target) = redirect.or_else(|| summary.and_then(|s| s.redirect)) {
        println!("Redirect: {target}");
    }

    info!("paywatch shut down cleanly");
    Ok(())
}

/// Pick the attempt to watch: the ID given on the command line, or the most
/// recent attempt the ledger still has as pending (crash recovery).
fn resolve_attempt(
    args: &[String],
    db: &Database,
) -> anyhow::Result<(CheckoutRequestId, Option<String>)> {
    if let Some(raw) = args.first() {
        let id = CheckoutRequestId::new(raw.as_str()).context("invalid checkout request ID")?;
        return Ok((id, args.get(1).cloned()));
    }

    match db.latest_pending().context("failed to read payment ledger")? {
        Some(record) => {
            // The ledger stores a check count only once an attempt settles,
            // so a resumed watch always starts with the full budget.
            info!(
                checkout_request_id = %record.checkout_request_id,
                created_at = %record.created_at,
                "resuming pending attempt"
            );
            let id = CheckoutRequestId::new(record.checkout_request_id)
                .context("ledger holds an invalid checkout request ID")?;
            Ok((id, record.amount))
        }
        None => bail!("no checkout request ID given and no pending attempt to resume"),
    }
}

/// Initialize tracing to log to a file (not the terminal, which is used by
/// the TUI). Falls back to the per-user data directory when the working
/// directory is not writable.
fn init_tracing() -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let log_file = match open_log_file(std::env::current_dir()?.join("logs")) {
        Ok(file) => file,
        Err(_) => {
            let dirs = directories::ProjectDirs::from("", "", "paywatch")
                .context("no home directory for log files")?;
            open_log_file(dirs.data_local_dir().join("logs"))?
        }
    };

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("paywatch=info,warn")),
        )
        .with_writer(log_file)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set tracing subscriber")?;

    Ok(())
}

fn open_log_file(dir: PathBuf) -> anyhow::Result<std::fs::File> {
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create log directory {}", dir.display()))?;
    let file = std::fs::File::create(dir.join("paywatch.log"))?;
    Ok(file)
}
