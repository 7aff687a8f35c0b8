use arcadesync_lib::commands::{self, export::ExportOverrides};
use arcadesync_lib::db::ExportMode;
use arcadesync_lib::{logging, AppContext};
use clap::{Parser, Subcommand, ValueEnum};
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

#[derive(Parser)]
#[command(name = "arcadesync", version, about = "Arcade cache updater and MiSTer exporter")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Refresh manifests and the local cache
    Update {
        /// Download ROMs for this run even if disabled in settings
        #[arg(long)]
        roms: bool,
    },
    /// Mirror a plan onto the configured destination
    Export {
        plan: String,
        #[arg(long, value_enum)]
        mode: Option<ModeArg>,
        /// Export into this local directory instead of the configured destination
        #[arg(long)]
        dest: Option<String>,
    },
    /// Check that every game in a plan is present in the cache
    Audit { plan: String },
    /// Create and inspect plans
    Plan {
        #[command(subcommand)]
        action: PlanAction,
    },
    /// Show or change log settings
    Log {
        #[arg(long)]
        level: Option<String>,
        #[arg(long)]
        max_size_mb: Option<u32>,
        #[arg(long)]
        enabled: Option<bool>,
    },
}

#[derive(Subcommand)]
enum PlanAction {
    New { name: String },
    Add {
        plan: String,
        source: String,
        /// MRA path inside the source, e.g. `_Arcade/1942.mra`
        mra: String,
        /// Directory inside the plan, `/` separated
        #[arg(long, default_value = "")]
        dir: String,
    },
    Show { plan: String },
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Space,
    Speed,
}

impl From<ModeArg> for ExportMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Space => ExportMode::Space,
            ModeArg::Speed => ExportMode::Speed,
        }
    }
}

async fn run(ctx: AppContext, command: Command, cancel: CancellationToken) -> anyhow::Result<()> {
    match command {
        Command::Update { roms } => match commands::update::update(&ctx, roms, cancel).await? {
            Some(catalog) => println!("Catalog has {} games", catalog.record_count()),
            None => println!("Update canceled"),
        },
        Command::Export { plan, mode, dest } => {
            let overrides = ExportOverrides {
                mode: mode.map(Into::into),
                dest,
            };
            match commands::export::export(&ctx, &plan, overrides, cancel).await? {
                Some(report) => println!(
                    "{} copied, {} deleted, {} directories removed in {:.1}s",
                    report.files_copied, report.files_deleted, report.dirs_removed, report.duration
                ),
                None => println!("Export canceled"),
            }
        }
        Command::Audit { plan } => {
            commands::audit::audit(&ctx, &plan).await?;
        }
        Command::Plan { action } => match action {
            PlanAction::New { name } => {
                let path = commands::plan::new_plan(&ctx, &name)?;
                println!("Created {}", path.display());
            }
            PlanAction::Add {
                plan,
                source,
                mra,
                dir,
            } => {
                if !commands::plan::add_game(&ctx, &plan, &dir, &source, &mra)? {
                    println!("{} is already in {}", mra, plan);
                }
            }
            PlanAction::Show { plan } => print!("{}", commands::plan::show(&ctx, &plan)?),
        },
        Command::Log {
            level,
            max_size_mb,
            enabled,
        } => {
            let config = if level.is_none() && max_size_mb.is_none() && enabled.is_none() {
                commands::log::get_log_config(&ctx)
            } else {
                commands::log::set_log_config(&ctx, enabled, max_size_mb, level)?
            };
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let ctx = match AppContext::new() {
        Ok(ctx) => ctx,
        Err(e) => {
            eprintln!("Failed to initialize: {:#}", e);
            return ExitCode::FAILURE;
        }
    };
    let _log_guard = logging::init(&ctx.config_dir, &ctx.data_dir);

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, canceling");
            on_interrupt.cancel();
        }
    });

    match run(ctx, cli.command, cancel).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
