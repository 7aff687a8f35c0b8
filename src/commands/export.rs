use crate::commands::plan::resolve_plan_path;
use crate::commands::{cache_store, load_catalog};
use crate::config::{ExportSettings, UpdateSettings};
use crate::core::{DiffPolicy, ExportEngine, ExportOptions, ExportReport, Plan};
use crate::db::{ExportMode, ExportPhase, ExportStatus, TransportConfig, TransportType};
use crate::error::RunOutcome;
use crate::transport::create_transport;
use crate::AppContext;
use anyhow::Result;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Per-run overrides from the command line
#[derive(Debug, Clone, Default)]
pub struct ExportOverrides {
    pub mode: Option<ExportMode>,
    /// Local directory used instead of the configured transport
    pub dest: Option<String>,
}

fn effective_settings(ctx: &AppContext, overrides: &ExportOverrides) -> ExportSettings {
    let mut settings = ExportSettings::load(&ctx.config_dir);
    if let Some(mode) = overrides.mode {
        settings.mode = mode;
    }
    if let Some(dest) = &overrides.dest {
        settings.transport = TransportConfig {
            typ: TransportType::Local,
            path: Some(dest.clone()),
            ..Default::default()
        };
    }
    settings
}

/// Export a plan. `Ok(None)` means the run was canceled.
pub async fn export(
    ctx: &AppContext,
    plan: &str,
    overrides: ExportOverrides,
    cancel: CancellationToken,
) -> Result<Option<ExportReport>> {
    let settings = effective_settings(ctx, &overrides);
    let plan = Plan::load(&resolve_plan_path(ctx, plan))?;
    let store = cache_store(ctx, &UpdateSettings::load(&ctx.config_dir));
    let catalog = load_catalog(&store)?;
    let mut transport = create_transport(&settings.transport)?;

    let engine = ExportEngine::new(
        store,
        ExportOptions {
            mode: settings.mode,
            policy: DiffPolicy {
                recopy_metadata: settings.recopy_metadata,
            },
            initiator: settings.initiator.clone(),
            log_dir: Some(ctx.export_log_dir()),
        },
    );

    let (tx, mut rx) = mpsc::channel::<ExportStatus>(64);
    let printer = tokio::spawn(async move {
        while let Some(status) = rx.recv().await {
            match status.phase {
                ExportPhase::Transferring => {
                    println!("[{}/{}] {}", status.done + 1, status.total, status.message)
                }
                ExportPhase::Failed => {
                    if let Some(op) = &status.operation {
                        println!("failed on {:?}", op);
                    }
                }
                _ if !status.message.is_empty() => {
                    println!("[{:?}] {}", status.phase, status.message)
                }
                _ => {}
            }
        }
    });

    let outcome = engine
        .run_export(&plan, &catalog, transport.as_mut(), Some(tx), cancel)
        .await;
    let _ = printer.await;

    match outcome {
        RunOutcome::Ok(report) => {
            for skipped in &report.skipped {
                println!("skipped (not cached): {}", skipped);
            }
            if let Some(path) = &report.log_path {
                println!("log: {}", path.display());
            }
            Ok(Some(report))
        }
        RunOutcome::Canceled => Ok(None),
        RunOutcome::Failed(e) => Err(e.into()),
    }
}
