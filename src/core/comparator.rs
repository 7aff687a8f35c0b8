use crate::core::classifier::{FileOperationKey, SourceKey};
use crate::error::SyncError;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Extensions copied on every export even when present at the destination.
/// MRA files are tiny, so overwriting is cheaper than verifying them remotely.
pub const ALWAYS_RECOPY_EXTENSIONS: [&str; 1] = [".mra"];

/// One step needed to converge the destination
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum FileOperation {
    /// `src` is `<sourceId>/<relativePath>` inside the cache
    Copy { src: String, dest: String },
    Delete { dest: String },
}

impl FileOperation {
    pub fn dest(&self) -> &str {
        match self {
            Self::Copy { dest, .. } | Self::Delete { dest } => dest,
        }
    }

    /// Copies sort before deletes
    fn action_order(&self) -> u8 {
        match self {
            Self::Copy { .. } => 0,
            Self::Delete { .. } => 1,
        }
    }
}

/// Diff knobs
#[derive(Debug, Clone)]
pub struct DiffPolicy {
    /// Re-copy files with an `ALWAYS_RECOPY_EXTENSIONS` extension regardless of presence
    pub recopy_metadata: bool,
}

impl Default for DiffPolicy {
    fn default() -> Self {
        Self {
            recopy_metadata: true,
        }
    }
}

impl DiffPolicy {
    fn always_recopy(&self, path: &str) -> bool {
        if !self.recopy_metadata {
            return false;
        }
        let lower = path.to_lowercase();
        ALWAYS_RECOPY_EXTENSIONS
            .iter()
            .any(|ext| lower.ends_with(ext))
    }
}

type Group = (String, String, String);

fn copy_of(source: &SourceKey) -> Result<FileOperation, SyncError> {
    if source.source_id.is_empty() {
        return Err(SyncError::unknown(format!(
            "source key for {} has no database id",
            source.key.path()
        )));
    }
    Ok(FileOperation::Copy {
        src: source.cache_path(),
        dest: source.key.path().to_string(),
    })
}

/// Diff the desired layout against the destination listing.
///
/// Four passes over exact and dated keys on each side, then dedupe and sort:
/// copies first, then deletes, each by destination path.
pub fn build_file_operations(
    sources: &[SourceKey],
    dests: &[FileOperationKey],
    policy: &DiffPolicy,
) -> Result<Vec<FileOperation>, SyncError> {
    let mut operations = Vec::new();

    let dest_exact: HashSet<String> = dests
        .iter()
        .filter(|k| !k.is_dated())
        .map(|k| k.match_path())
        .collect();

    let mut dest_dated: HashMap<Group, Vec<(NaiveDate, &FileOperationKey)>> = HashMap::new();
    for key in dests {
        if let (Some(group), Some(date)) = (key.group(), key.date()) {
            dest_dated.entry(group).or_default().push((date, key));
        }
    }

    // newest source per group; on equal dates the first listed wins
    let mut source_dated: HashMap<Group, &SourceKey> = HashMap::new();
    let mut source_exact: HashSet<String> = HashSet::new();
    for source in sources {
        match (source.key.group(), source.key.date()) {
            (Some(group), Some(date)) => {
                let newer = source_dated
                    .get(&group)
                    .and_then(|current| current.key.date())
                    .map_or(true, |current| date > current);
                if newer {
                    source_dated.insert(group, source);
                }
            }
            _ => {
                source_exact.insert(source.key.match_path());
            }
        }
    }

    // 1. exact sources
    for source in sources.iter().filter(|s| !s.key.is_dated()) {
        let present = dest_exact.contains(&source.key.match_path());
        if !present || policy.always_recopy(source.key.path()) {
            operations.push(copy_of(source)?);
        }
    }

    // 2. dated sources
    for (group, source) in &source_dated {
        let Some(date) = source.key.date() else {
            continue;
        };
        let current = dest_dated
            .get(group)
            .is_some_and(|existing| existing.iter().any(|(d, _)| *d >= date));
        if !current {
            operations.push(copy_of(source)?);
        }
    }

    // 3. exact dests
    for key in dests.iter().filter(|k| !k.is_dated()) {
        if !source_exact.contains(&key.match_path()) {
            operations.push(FileOperation::Delete {
                dest: key.path().to_string(),
            });
        }
    }

    // 4. dated dests: only a strictly newer source supersedes
    for (group, existing) in &dest_dated {
        let source_date = source_dated.get(group).and_then(|s| s.key.date());
        for (date, key) in existing {
            let stale = source_date.map_or(true, |newest| newest > *date);
            if stale {
                operations.push(FileOperation::Delete {
                    dest: key.path().to_string(),
                });
            }
        }
    }

    // one action per destination; the first source listed wins
    let mut seen = HashSet::new();
    operations.retain(|op| seen.insert((op.action_order(), op.dest().to_lowercase())));
    operations.sort_by(|a, b| {
        a.action_order()
            .cmp(&b.action_order())
            .then_with(|| a.dest().cmp(b.dest()))
    });

    Ok(operations)
}

/// Operation counts
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionSummary {
    pub copy_count: usize,
    pub delete_count: usize,
}

impl ActionSummary {
    pub fn total(&self) -> usize {
        self.copy_count + self.delete_count
    }
}

pub fn summarize_operations(operations: &[FileOperation]) -> ActionSummary {
    let mut summary = ActionSummary::default();
    for op in operations {
        match op {
            FileOperation::Copy { .. } => summary.copy_count += 1,
            FileOperation::Delete { .. } => summary.delete_count += 1,
        }
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::classifier::{classify_dest, classify_source};

    fn src(path: &str) -> SourceKey {
        classify_source("mockdb", path, path)
    }

    fn dest(path: &str) -> FileOperationKey {
        classify_dest(path)
    }

    fn copy(path: &str) -> FileOperation {
        FileOperation::Copy {
            src: format!("mockdb/{}", path),
            dest: path.to_string(),
        }
    }

    fn delete(path: &str) -> FileOperation {
        FileOperation::Delete {
            dest: path.to_string(),
        }
    }

    fn diff(sources: &[SourceKey], dests: &[FileOperationKey]) -> Vec<FileOperation> {
        build_file_operations(sources, dests, &DiffPolicy::default()).unwrap()
    }

    /// Apply operations to a destination listing
    fn apply(dests: &[FileOperationKey], ops: &[FileOperation]) -> Vec<FileOperationKey> {
        let deleted: HashSet<&str> = ops
            .iter()
            .filter_map(|op| match op {
                FileOperation::Delete { dest } => Some(dest.as_str()),
                _ => None,
            })
            .collect();
        let mut result: Vec<FileOperationKey> = dests
            .iter()
            .filter(|k| !deleted.contains(k.path()))
            .cloned()
            .collect();
        for op in ops {
            if let FileOperation::Copy { dest: path, .. } = op {
                if !result.iter().any(|k| k.match_path() == path.to_lowercase()) {
                    result.push(dest(path));
                }
            }
        }
        result
    }

    #[test]
    fn stale_destination_file_is_deleted() {
        let ops = diff(&[], &[dest("_Arcade/foo.mra")]);
        assert_eq!(ops, vec![delete("_Arcade/foo.mra")]);
    }

    #[test]
    fn missing_destination_file_is_copied() {
        let ops = diff(&[src("_Arcade/foo.mra")], &[]);
        assert_eq!(ops, vec![copy("_Arcade/foo.mra")]);
    }

    #[test]
    fn newer_core_replaces_older() {
        let ops = diff(
            &[src("foo_20230102.rbf")],
            &[dest("foo_20230101.rbf")],
        );
        assert_eq!(
            ops,
            vec![copy("foo_20230102.rbf"), delete("foo_20230101.rbf")]
        );
    }

    #[test]
    fn newer_destination_core_is_kept() {
        let ops = diff(
            &[src("foo_20230101.rbf")],
            &[dest("foo_20230102.rbf")],
        );
        assert!(ops.is_empty());
    }

    #[test]
    fn equal_date_core_is_left_alone() {
        let ops = diff(
            &[src("_Arcade/cores/foo_20230101.rbf")],
            &[dest("_Arcade/cores/foo_20230101.rbf")],
        );
        assert!(ops.is_empty());
    }

    #[test]
    fn metadata_is_recopied_unless_disabled() {
        let sources = [src("_Arcade/foo.mra")];
        let dests = [dest("_Arcade/foo.mra")];
        assert_eq!(diff(&sources, &dests), vec![copy("_Arcade/foo.mra")]);

        let policy = DiffPolicy {
            recopy_metadata: false,
        };
        assert!(build_file_operations(&sources, &dests, &policy)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn exact_match_is_case_insensitive() {
        let ops = diff(&[src("games/mame/1942.zip")], &[dest("games/MAME/1942.ZIP")]);
        assert!(ops.is_empty());
    }

    #[test]
    fn only_newest_of_several_source_versions_is_used() {
        let ops = diff(
            &[
                src("_Arcade/cores/foo_20230101.rbf"),
                src("_Arcade/cores/foo_20230301.rbf"),
            ],
            &[dest("_Arcade/cores/foo_20230101.rbf")],
        );
        assert_eq!(
            ops,
            vec![
                copy("_Arcade/cores/foo_20230301.rbf"),
                delete("_Arcade/cores/foo_20230101.rbf"),
            ]
        );
    }

    #[test]
    fn copies_sort_before_deletes_then_by_path() {
        let ops = diff(
            &[src("b.zip"), src("a.zip")],
            &[dest("z.zip"), dest("c.zip")],
        );
        assert_eq!(
            ops,
            vec![copy("a.zip"), copy("b.zip"), delete("c.zip"), delete("z.zip")]
        );
    }

    #[test]
    fn duplicate_sources_produce_one_copy() {
        let ops = diff(&[src("a.zip"), src("a.zip")], &[]);
        assert_eq!(ops, vec![copy("a.zip")]);
    }

    #[test]
    fn empty_source_id_fails_loudly() {
        let orphan = classify_source("", "a.zip", "games/mame/a.zip");
        let err = build_file_operations(&[orphan], &[], &DiffPolicy::default()).unwrap_err();
        assert!(err.to_string().contains("games/mame/a.zip"));
    }

    #[test]
    fn no_destination_gets_conflicting_actions() {
        let sources = [
            src("_Arcade/cores/foo_20230201.rbf"),
            src("_Arcade/cores/bar_20230101.rbf"),
            src("_Arcade/a.mra"),
            src("games/mame/a.zip"),
        ];
        let dests = [
            dest("_Arcade/cores/foo_20230101.rbf"),
            dest("_Arcade/cores/foo_20230301.rbf"),
            dest("_Arcade/cores/bar_20230101.rbf"),
            dest("_Arcade/a.mra"),
            dest("_Arcade/b.mra"),
            dest("games/mame/old.zip"),
        ];
        let ops = diff(&sources, &dests);
        let mut actions: HashMap<String, FileOperation> = HashMap::new();
        for op in &ops {
            if let Some(previous) = actions.insert(op.dest().to_lowercase(), op.clone()) {
                panic!("{:?} conflicts with {:?}", previous, op);
            }
        }
    }

    #[test]
    fn rerun_after_applying_is_empty() {
        let policy = DiffPolicy {
            recopy_metadata: false,
        };
        let sources = [
            src("_Arcade/cores/foo_20230201.rbf"),
            src("_Arcade/cores/baz_20220101.rbf"),
            src("_Arcade/_Shooters/a.mra"),
            src("games/mame/a.zip"),
        ];
        let dests = [
            dest("_Arcade/cores/foo_20230101.rbf"),
            dest("_Arcade/cores/foo_20230301.rbf"),
            dest("_Arcade/cores/bar_20230101.rbf"),
            dest("_Arcade/b.mra"),
            dest("games/mame/old.zip"),
        ];
        let ops = build_file_operations(&sources, &dests, &policy).unwrap();
        assert!(!ops.is_empty());

        let converged = apply(&dests, &ops);
        let rerun = build_file_operations(&sources, &converged, &policy).unwrap();
        assert!(rerun.is_empty(), "unexpected operations: {:?}", rerun);
    }

    #[test]
    fn summary_counts_actions() {
        let ops = vec![copy("a.zip"), delete("b.zip"), delete("c.zip")];
        let summary = summarize_operations(&ops);
        assert_eq!(summary.copy_count, 1);
        assert_eq!(summary.delete_count, 2);
        assert_eq!(summary.total(), 3);
    }
}
