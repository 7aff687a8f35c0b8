use crate::commands::plan::{render, resolve_plan_path};
use crate::commands::{cache_store, load_catalog};
use crate::config::UpdateSettings;
use crate::core::{AuditReport, Plan};
use crate::AppContext;
use anyhow::Result;

/// Check a plan against the cache, printing the marked tree
pub async fn audit(ctx: &AppContext, plan: &str) -> Result<AuditReport> {
    let plan = Plan::load(&resolve_plan_path(ctx, plan))?;
    let store = cache_store(ctx, &UpdateSettings::load(&ctx.config_dir));
    let catalog = load_catalog(&store)?;

    let report = store.audit(&plan, &catalog).await;
    print!("{}", render(&report.plan));
    for entry in &report.unexpectedly_missing {
        println!("vanished from cache: {}", entry.cache_key());
    }
    if report.missing_leaves == 0 {
        println!("All {} games present", plan.leaf_count());
    } else {
        println!(
            "{} of {} games missing, run `arcadesync update` to repair",
            report.missing_leaves,
            plan.leaf_count()
        );
    }
    Ok(report)
}
