//! User-curated export plans
//!
//! A plan is a tree of named directories whose leaves point at catalog
//! records by `(source_id, mra path)`. The tree is independent of catalog
//! content: leaves may reference records that no longer exist, which the
//! cache audit reports as `MissingLeaf`.

use crate::error::SyncError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

pub const PLAN_EXTENSION: &str = "arcplan";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PlanNode {
    #[serde(rename_all = "camelCase")]
    Directory {
        name: String,
        #[serde(default)]
        children: Vec<PlanNode>,
        #[serde(default)]
        invalid_descendant: bool,
    },
    #[serde(rename_all = "camelCase")]
    Leaf { source_id: String, path: String },
    #[serde(rename_all = "camelCase")]
    MissingLeaf { source_id: String, path: String },
}

impl PlanNode {
    pub fn directory(name: impl Into<String>, children: Vec<PlanNode>) -> Self {
        Self::Directory {
            name: name.into(),
            children,
            invalid_descendant: false,
        }
    }

    pub fn leaf(source_id: impl Into<String>, path: impl Into<String>) -> Self {
        Self::Leaf {
            source_id: source_id.into(),
            path: path.into(),
        }
    }
}

/// A leaf together with the directory names leading to it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanLeaf {
    pub dirs: Vec<String>,
    pub source_id: String,
    pub path: String,
    pub missing: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    pub name: String,
    #[serde(default)]
    pub children: Vec<PlanNode>,
}

fn collect_leaves(nodes: &[PlanNode], dirs: &mut Vec<String>, out: &mut Vec<PlanLeaf>) {
    for node in nodes {
        match node {
            PlanNode::Directory { name, children, .. } => {
                dirs.push(name.clone());
                collect_leaves(children, dirs, out);
                dirs.pop();
            }
            PlanNode::Leaf { source_id, path } | PlanNode::MissingLeaf { source_id, path } => {
                out.push(PlanLeaf {
                    dirs: dirs.clone(),
                    source_id: source_id.clone(),
                    path: path.clone(),
                    missing: matches!(node, PlanNode::MissingLeaf { .. }),
                });
            }
        }
    }
}

impl Plan {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            children: Vec::new(),
        }
    }

    /// Depth-first, in tree order
    pub fn leaves(&self) -> Vec<PlanLeaf> {
        let mut out = Vec::new();
        collect_leaves(&self.children, &mut Vec::new(), &mut out);
        out
    }

    pub fn leaf_count(&self) -> usize {
        self.leaves().len()
    }

    /// Add a leaf below `dirs`, creating directories on the way. Returns false if
    /// the same leaf already sits in that directory.
    pub fn add_leaf(&mut self, dirs: &[&str], source_id: &str, path: &str) -> bool {
        let mut children = &mut self.children;
        for dir in dirs {
            let index = children
                .iter()
                .position(|n| matches!(n, PlanNode::Directory { name, .. } if name == dir));
            let index = match index {
                Some(i) => i,
                None => {
                    children.push(PlanNode::directory(*dir, Vec::new()));
                    children.len() - 1
                }
            };
            let PlanNode::Directory { children: next, .. } = &mut children[index] else {
                return false;
            };
            children = next;
        }

        let exists = children.iter().any(|n| match n {
            PlanNode::Leaf { source_id: s, path: p }
            | PlanNode::MissingLeaf { source_id: s, path: p } => s == source_id && p == path,
            PlanNode::Directory { .. } => false,
        });
        if !exists {
            children.push(PlanNode::leaf(source_id, path));
        }
        !exists
    }

    pub fn load(path: &Path) -> Result<Plan, SyncError> {
        let content = std::fs::read(path)
            .map_err(|e| SyncError::file(format!("Failed to read plan {:?}: {}", path, e)))?;
        let plan: Plan = serde_json::from_slice(&content)
            .map_err(|e| SyncError::format(format!("Invalid plan {:?}: {}", path, e)))?;
        debug!("Loaded plan {} with {} leaves", plan.name, plan.leaf_count());
        Ok(plan)
    }

    /// Save as JSON, appending `.arcplan` when the path lacks it. Returns the written path.
    pub fn save(&self, path: &Path) -> Result<PathBuf, SyncError> {
        let path = with_plan_extension(path);
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_vec_pretty(self)?;
        std::fs::write(&path, content)?;
        Ok(path)
    }
}

pub fn with_plan_extension(path: &Path) -> PathBuf {
    let has_extension = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case(PLAN_EXTENSION));
    if has_extension {
        path.to_path_buf()
    } else {
        let mut name = path.as_os_str().to_os_string();
        name.push(".");
        name.push(PLAN_EXTENSION);
        PathBuf::from(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Plan {
        let mut plan = Plan::new("favorites");
        plan.add_leaf(&["Shooters", "Vertical"], "mockdb", "_Arcade/1942.mra");
        plan.add_leaf(&["Shooters"], "mockdb", "_Arcade/gradius.mra");
        plan.add_leaf(&[], "jtcores", "_Arcade/pang.mra");
        plan
    }

    #[test]
    fn leaves_carry_their_directory_stack() {
        let leaves = sample().leaves();
        assert_eq!(leaves.len(), 3);
        assert_eq!(leaves[0].dirs, vec!["Shooters", "Vertical"]);
        assert_eq!(leaves[1].dirs, vec!["Shooters"]);
        assert!(leaves[2].dirs.is_empty());
    }

    #[test]
    fn adding_twice_keeps_one_leaf() {
        let mut plan = sample();
        assert!(!plan.add_leaf(&["Shooters"], "mockdb", "_Arcade/gradius.mra"));
        assert_eq!(plan.leaf_count(), 3);
    }

    #[test]
    fn save_enforces_extension() {
        let dir = tempfile::tempdir().unwrap();
        let plan = sample();

        let written = plan.save(&dir.path().join("favorites")).unwrap();
        assert_eq!(written, dir.path().join("favorites.arcplan"));
        assert_eq!(Plan::load(&written).unwrap(), plan);

        let kept = plan.save(&dir.path().join("other.ARCPLAN")).unwrap();
        assert_eq!(kept, dir.path().join("other.ARCPLAN"));
    }

    #[test]
    fn tagged_json_layout() {
        let json = serde_json::to_value(sample()).unwrap();
        assert_eq!(json["children"][0]["type"], "directory");
        assert_eq!(json["children"][1]["type"], "leaf");
        assert_eq!(json["children"][1]["sourceId"], "jtcores");

        let missing: PlanNode = serde_json::from_str(
            r#"{"type": "missingLeaf", "sourceId": "mockdb", "path": "_Arcade/x.mra"}"#,
        )
        .unwrap();
        assert!(matches!(missing, PlanNode::MissingLeaf { .. }));
    }
}
