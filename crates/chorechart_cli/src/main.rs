//! Headless chore chart client.
//!
//! # Responsibility
//! - Load configuration and start logging.
//! - Build the configured store, keep a live view in sync and run the
//!   daily reset until Ctrl-C.

use chorechart_core::{
    init_logging, AppConfig, ChildRotation, ChildView, DevicePrefs, FirebaseStore, MemoryStore,
    ResetPolicy, ResetScheduler, Schema, SqliteDocumentStore, StoreAdapter, StoreBackend,
    SyncService, SyncSnapshot,
};
use log::{error, info, warn};
use std::error::Error;
use std::process::ExitCode;
use std::sync::Arc;

type CliResult<T> = Result<T, Box<dyn Error>>;

#[tokio::main]
async fn main() -> ExitCode {
    let config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("chorechart: {err}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(err) = init_logging(&config.log_level, config.log_dir.as_deref()) {
        eprintln!("chorechart: {err}");
        return ExitCode::FAILURE;
    }

    match serve(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("event=cli_exit module=cli status=error error={err}");
            ExitCode::FAILURE
        }
    }
}

async fn serve(config: AppConfig) -> CliResult<()> {
    let schema = Arc::new(Schema::with_fallback(config.fallback_task_set_id.clone())?);
    let prefs = Arc::new(DevicePrefs::open(&config.prefs_path)?);
    info!(
        "event=cli_start module=cli status=ok backend={} version={}",
        config.store.name(),
        chorechart_core::core_version()
    );

    match &config.store {
        StoreBackend::Firebase(firebase) => {
            let store = Arc::new(FirebaseStore::new(firebase, Arc::clone(&schema))?);
            store.start_listener();
            run(store, schema, prefs, &config).await
        }
        StoreBackend::Sqlite { path, feed_period } => {
            let store = Arc::new(SqliteDocumentStore::open(
                path,
                &config.document_path,
                Arc::clone(&schema),
            )?);
            store.start_change_feed(*feed_period);
            run(store, schema, prefs, &config).await
        }
        StoreBackend::Memory => {
            let store = Arc::new(MemoryStore::new(Arc::clone(&schema)));
            run(store, schema, prefs, &config).await
        }
    }
}

async fn run<S: StoreAdapter + 'static>(
    store: Arc<S>,
    schema: Arc<Schema>,
    prefs: Arc<DevicePrefs>,
    config: &AppConfig,
) -> CliResult<()> {
    let sync = SyncService::new(Arc::clone(&store), schema);
    let mut snapshots = sync.watch();
    let initial = sync.start().await?;

    let rotation = ChildRotation::restore(&initial, &prefs)?;
    if let Some(view) = rotation
        .current()
        .and_then(|child| ChildView::build(&initial, child))
    {
        info!(
            "event=child_view module=cli status=ok child={} completed={} total={} all_done={}",
            view.child_id, view.completed_count, view.total_count, view.all_done
        );
    }

    let scheduler = ResetScheduler::new(store, ResetPolicy::new(config.reset_timezone))
        .with_poll_interval(config.reset_poll_interval)
        .with_device_prefs(prefs);
    let reset = Arc::new(scheduler).spawn();

    loop {
        tokio::select! {
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = snapshots.borrow_and_update().clone();
                log_snapshot(&snapshot);
            }
            signal = tokio::signal::ctrl_c() => {
                if let Err(err) = signal {
                    warn!("event=cli_signal module=cli status=error error={err}");
                }
                break;
            }
        }
    }

    info!("event=cli_stop module=cli status=start");
    reset.shutdown().await;
    sync.shutdown();
    info!("event=cli_stop module=cli status=ok");
    Ok(())
}

fn log_snapshot(snapshot: &SyncSnapshot) {
    let completed = snapshot.state.as_ref().map_or(0, |state| {
        state
            .children
            .values()
            .map(|child| child.completed_tasks.len())
            .sum::<usize>()
    });
    match &snapshot.last_error {
        Some(err) => warn!(
            "event=snapshot module=cli status=error phase={:?} online={} error={err}",
            snapshot.phase, snapshot.online
        ),
        None => info!(
            "event=snapshot module=cli status=ok phase={:?} online={} completed={completed}",
            snapshot.phase, snapshot.online
        ),
    }
}
