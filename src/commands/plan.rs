use crate::commands::{cache_store, load_catalog};
use crate::config::UpdateSettings;
use crate::core::plan::with_plan_extension;
use crate::core::{Plan, PlanNode};
use crate::AppContext;
use anyhow::Result;
use std::fmt::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// An existing path is used as is, anything else names a plan in the plans directory
pub fn resolve_plan_path(ctx: &AppContext, plan: &str) -> PathBuf {
    let direct = Path::new(plan);
    if direct.is_file() {
        return direct.to_path_buf();
    }
    with_plan_extension(&ctx.plans_dir().join(plan))
}

pub fn new_plan(ctx: &AppContext, name: &str) -> Result<PathBuf> {
    let path = resolve_plan_path(ctx, name);
    if path.exists() {
        anyhow::bail!("Plan {:?} already exists", path);
    }
    let path = Plan::new(name).save(&path)?;
    info!("Created plan {:?}", path);
    Ok(path)
}

/// Add a game below `dir` (`/` separated, empty for the top level)
pub fn add_game(ctx: &AppContext, plan: &str, dir: &str, source_id: &str, mra_path: &str) -> Result<bool> {
    let path = resolve_plan_path(ctx, plan);
    let mut loaded = Plan::load(&path)?;

    let store = cache_store(ctx, &UpdateSettings::load(&ctx.config_dir));
    match load_catalog(&store) {
        Ok(catalog) if catalog.record(source_id, mra_path).is_none() => {
            warn!("{}/{} is not in the catalog", source_id, mra_path);
        }
        Ok(_) => {}
        Err(e) => warn!("Cannot check catalog: {}", e),
    }

    let dirs: Vec<&str> = dir.split('/').filter(|d| !d.is_empty()).collect();
    let added = loaded.add_leaf(&dirs, source_id, mra_path);
    if added {
        loaded.save(&path)?;
    }
    Ok(added)
}

/// Indented tree, missing leaves flagged
pub fn render(plan: &Plan) -> String {
    fn walk(nodes: &[PlanNode], depth: usize, out: &mut String) {
        for node in nodes {
            let indent = "  ".repeat(depth);
            match node {
                PlanNode::Directory {
                    name,
                    children,
                    invalid_descendant,
                } => {
                    let flag = if *invalid_descendant { " (!)" } else { "" };
                    let _ = writeln!(out, "{}{}/{}", indent, name, flag);
                    walk(children, depth + 1, out);
                }
                PlanNode::Leaf { source_id, path } => {
                    let _ = writeln!(out, "{}{} [{}]", indent, path, source_id);
                }
                PlanNode::MissingLeaf { source_id, path } => {
                    let _ = writeln!(out, "{}{} [{}] MISSING", indent, path, source_id);
                }
            }
        }
    }

    let mut out = format!("{} ({} games)\n", plan.name, plan.leaf_count());
    walk(&plan.children, 1, &mut out);
    out
}

pub fn show(ctx: &AppContext, plan: &str) -> Result<String> {
    let loaded = Plan::load(&resolve_plan_path(ctx, plan))?;
    Ok(render(&loaded))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plans_are_created_and_extended_by_name() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = AppContext::at(dir.path());

        let path = new_plan(&ctx, "favorites").unwrap();
        assert!(path.ends_with("plans/favorites.arcplan"));
        assert!(new_plan(&ctx, "favorites").is_err());

        assert!(add_game(&ctx, "favorites", "Shooters/Vertical", "jtcores", "_Arcade/1942.mra").unwrap());
        assert!(!add_game(&ctx, "favorites", "Shooters/Vertical", "jtcores", "_Arcade/1942.mra").unwrap());
        assert!(add_game(&ctx, "favorites", "", "jtcores", "_Arcade/pang.mra").unwrap());

        let shown = show(&ctx, "favorites").unwrap();
        assert_eq!(
            shown,
            "favorites (2 games)\n  Shooters/\n    Vertical/\n      _Arcade/1942.mra [jtcores]\n  _Arcade/pang.mra [jtcores]\n"
        );
    }

    #[test]
    fn missing_leaves_are_flagged() {
        let mut plan = Plan::new("p");
        plan.children = vec![PlanNode::Directory {
            name: "Broken".into(),
            children: vec![PlanNode::MissingLeaf {
                source_id: "db".into(),
                path: "_Arcade/x.mra".into(),
            }],
            invalid_descendant: true,
        }];
        assert_eq!(render(&plan), "p (1 games)\n  Broken/ (!)\n    _Arcade/x.mra [db] MISSING\n");
    }
}
