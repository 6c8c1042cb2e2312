//! SealDB entrypoint. `serve` (default) bootstraps the store, flushes in the
//! background and writes a final flush on SIGINT/SIGTERM or a `shutdown` line
//! on stdin. `status`, `migration-status` and `cleanup` are one-shot commands
//! that never open the database.

use sealdb::{
    config::StoreConfig,
    context::{self, PersistenceContext},
    crypto::{HardwareFingerprint, SecretPolicy, SecretStore},
    logging::StructuredLogger,
    storage::{self, DataPaths, FlushScheduler},
};
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

const KEY_PURGE_INTERVAL: Duration = Duration::from_secs(60);

fn print_json(value: &impl serde::Serialize) {
    StructuredLogger::emit_json(value, &mut std::io::stdout().lock());
}

fn serve(config: StoreConfig) -> Result<(), BoxError> {
    let ctx = Arc::new(PersistenceContext::bootstrap(config.clone())?);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let (stop_tx, mut stop_rx) = mpsc::unbounded_channel::<&'static str>();

        let signal_tx = stop_tx.clone();
        if let Err(e) = ctrlc::set_handler(move || {
            let _ = signal_tx.send("signal");
        }) {
            tracing::warn!(error = %e, "could not install signal handler");
        }

        // Host processes may ask for a clean stop over stdin.
        std::thread::spawn(move || {
            for line in std::io::stdin().lock().lines() {
                match line {
                    Ok(l) if l.trim() == "shutdown" => {
                        let _ = stop_tx.send("stdin");
                        break;
                    }
                    Ok(_) => {}
                    Err(_) => break,
                }
            }
        });

        let scheduler = FlushScheduler::spawn(Arc::clone(ctx.database()), &config.flush);

        let purge_ctx = Arc::clone(&ctx);
        let purger = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(KEY_PURGE_INTERVAL);
            loop {
                ticker.tick().await;
                let purged = purge_ctx.purge_expired_keys();
                if purged > 0 {
                    info!(purged, "expired user data keys dropped");
                }
            }
        });

        info!(
            data_dir = %config.data_dir.display(),
            interval_secs = config.flush.interval_secs,
            "serving (Ctrl+C or `shutdown` on stdin to stop)"
        );
        let cause = stop_rx.recv().await.unwrap_or("channel closed");
        info!(cause, "shutting down");

        purger.abort();
        scheduler.stop().await;
    });

    ctx.shutdown()?;
    info!("SealDB stopped");
    Ok(())
}

fn main() -> Result<(), BoxError> {
    let config_path = std::env::var("SEALDB_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("config.json"));
    let config = StoreConfig::from_env(&config_path);

    StructuredLogger::init(config.log.json, &config.log.level);

    let command = std::env::args().nth(1).unwrap_or_else(|| "serve".to_string());
    info!(command = %command, data_dir = ?config.data_dir, "SealDB starting");

    match command.as_str() {
        "serve" => serve(config),
        "status" => {
            let secrets = SecretStore::from_process_env(config.env_file_path(), SecretPolicy::default());
            let fingerprint = Arc::new(HardwareFingerprint::new(config.encryption.fingerprint_seed.clone()));
            print_json(&context::inspect_disk(&config, &secrets, fingerprint)?);
            Ok(())
        }
        "migration-status" => {
            print_json(&storage::classify(&DataPaths::new(&config.data_dir))?);
            Ok(())
        }
        "cleanup" => {
            let removed = storage::cleanup_artifacts(
                &DataPaths::new(&config.data_dir),
                storage::legacy::RETAINED_ARTIFACTS,
            )?;
            print_json(&serde_json::json!({ "removed": removed }));
            Ok(())
        }
        other => Err(format!("unknown command {other:?}; expected serve, status, migration-status or cleanup").into()),
    }
}
