use crate::commands::cache_store;
use crate::config::UpdateSettings;
use crate::core::{CatalogBuilder, HttpDownloader};
use crate::db::{Catalog, UpdateReason, UpdateStatus};
use crate::error::RunOutcome;
use crate::AppContext;
use anyhow::Result;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Refresh the local cache and catalog. `download_roms` forces ROM downloads on
/// for this run without touching the saved settings.
pub async fn update(
    ctx: &AppContext,
    download_roms: bool,
    cancel: CancellationToken,
) -> Result<Option<Arc<Catalog>>> {
    let mut settings = UpdateSettings::load(&ctx.config_dir);
    settings.download_roms |= download_roms;
    let store = cache_store(ctx, &settings);
    info!("Updating cache at {:?}", store.root());

    let builder = CatalogBuilder::new(settings, store, Arc::new(HttpDownloader::new()?));
    let (tx, mut rx) = mpsc::channel::<UpdateStatus>(64);
    let printer = tokio::spawn(async move {
        while let Some(status) = rx.recv().await {
            if status.fresh && !status.complete {
                println!("[{:?}] {} (first run, this may take a while)", status.phase, status.message);
            } else if !status.message.is_empty() {
                println!("[{:?}] {}", status.phase, status.message);
            }
            if let Some(updates) = &status.updates {
                let count = |reason: UpdateReason| updates.iter().filter(|u| u.reason == reason).count();
                println!(
                    "{} missing, {} updated, {} corrupt, {} shared",
                    count(UpdateReason::Missing),
                    count(UpdateReason::Updated),
                    count(UpdateReason::Corrupt),
                    count(UpdateReason::Fulfilled)
                );
            }
        }
    });

    let outcome = builder.run_update(Some(tx), cancel).await;
    let _ = printer.await;

    match outcome {
        RunOutcome::Ok(catalog) => Ok(Some(catalog)),
        RunOutcome::Canceled => Ok(None),
        RunOutcome::Failed(e) => Err(e.into()),
    }
}
