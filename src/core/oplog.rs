//! Per-run export log, one JSON array per run

use crate::core::comparator::FileOperation;
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%SZ";

/// Logs older than this are pruned when a new run starts
pub const LOG_RETENTION_DAYS: i64 = 7;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OpLogEntry {
    pub time: DateTime<Utc>,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src: Option<String>,
    pub dest: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Open log file. Entries are spliced in before the closing `]`, so the file
/// parses as an array after every append.
pub struct OpLog {
    path: PathBuf,
    file: File,
    count: usize,
}

fn sanitize(initiator: &str) -> String {
    let cleaned: String = initiator
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect();
    if cleaned.is_empty() {
        "unknown".to_string()
    } else {
        cleaned
    }
}

pub fn log_file_name(initiator: &str, at: DateTime<Utc>) -> String {
    format!("export_{}_{}.json", sanitize(initiator), at.format(TIMESTAMP_FORMAT))
}

/// Timestamp of a log written for `initiator`, `None` for other files
fn log_time(file_name: &str, initiator: &str) -> Option<DateTime<Utc>> {
    let prefix = format!("export_{}_", sanitize(initiator));
    let stamp = file_name.strip_prefix(&prefix)?.strip_suffix(".json")?;
    NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FORMAT)
        .ok()
        .map(|t| t.and_utc())
}

/// Delete this initiator's logs older than `max_age`. Returns how many were removed.
pub fn prune_logs(log_dir: &Path, initiator: &str, max_age: Duration, now: DateTime<Utc>) -> usize {
    let Ok(entries) = std::fs::read_dir(log_dir) else {
        return 0;
    };
    let mut removed = 0;
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        let Some(written) = log_time(&name, initiator) else {
            continue;
        };
        if now - written > max_age {
            match std::fs::remove_file(entry.path()) {
                Ok(()) => removed += 1,
                Err(e) => warn!("Failed to prune {}: {}", name, e),
            }
        }
    }
    if removed > 0 {
        debug!("Pruned {} old export logs", removed);
    }
    removed
}

impl OpLog {
    /// Start a new log in `log_dir`, pruning this initiator's stale logs first
    pub fn create(log_dir: &Path, initiator: &str) -> Result<Self> {
        std::fs::create_dir_all(log_dir)
            .with_context(|| format!("Failed to create {:?}", log_dir))?;
        let now = Utc::now();
        prune_logs(log_dir, initiator, Duration::days(LOG_RETENTION_DAYS), now);

        let path = log_dir.join(log_file_name(initiator, now));
        let mut file = File::create(&path).with_context(|| format!("Failed to create {:?}", path))?;
        file.write_all(b"[]")
            .with_context(|| format!("Failed to write {:?}", path))?;
        Ok(Self {
            path,
            file,
            count: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&mut self, entry: OpLogEntry) -> Result<()> {
        let json = serde_json::to_string(&entry)?;
        // overwrite `]` on the first entry, `\n]` after that
        let (back, separator) = if self.count == 0 { (1, "\n") } else { (2, ",\n") };
        self.file
            .seek(SeekFrom::End(-back))
            .and_then(|_| write!(self.file, "{}  {}\n]", separator, json))
            .with_context(|| format!("Failed to write {:?}", self.path))?;
        self.count += 1;
        Ok(())
    }

    pub fn record(&mut self, op: &FileOperation, error: Option<String>) -> Result<()> {
        let (action, src) = match op {
            FileOperation::Copy { src, .. } => ("copy", Some(src.clone())),
            FileOperation::Delete { .. } => ("delete", None),
        };
        self.append(OpLogEntry {
            time: Utc::now(),
            action: action.to_string(),
            src,
            dest: op.dest().to_string(),
            ok: error.is_none(),
            error,
        })
    }

    /// Directory removals during cleanup
    pub fn record_rmdir(&mut self, dest: &str, error: Option<String>) -> Result<()> {
        self.append(OpLogEntry {
            time: Utc::now(),
            action: "rmdir".to_string(),
            src: None,
            dest: dest.to_string(),
            ok: error.is_none(),
            error,
        })
    }

    pub fn flush(&mut self) -> Result<()> {
        self.file
            .sync_data()
            .with_context(|| format!("Failed to sync {:?}", self.path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_is_always_a_valid_array() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = OpLog::create(dir.path(), "cli").unwrap();
        let empty: Vec<OpLogEntry> =
            serde_json::from_slice(&std::fs::read(log.path()).unwrap()).unwrap();
        assert!(empty.is_empty());

        let copy = FileOperation::Copy {
            src: "mockdb/_Arcade/a.mra".into(),
            dest: "_Arcade/a.mra".into(),
        };
        log.record(&copy, None).unwrap();
        log.record(
            &FileOperation::Delete {
                dest: "games/mame/b.zip".into(),
            },
            Some("permission denied".into()),
        )
        .unwrap();

        let written: Vec<OpLogEntry> =
            serde_json::from_slice(&std::fs::read(log.path()).unwrap()).unwrap();
        assert_eq!(written.len(), 2);
        assert_eq!(written[0].action, "copy");
        assert_eq!(written[0].src.as_deref(), Some("mockdb/_Arcade/a.mra"));
        assert!(!written[1].ok);
    }

    #[test]
    fn appends_only_extend_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = OpLog::create(dir.path(), "cli").unwrap();
        let mut previous = std::fs::read(log.path()).unwrap();

        for n in 0..500 {
            let dest = format!("games/mame/{}.zip", n);
            log.record(&FileOperation::Delete { dest: dest.clone() }, None)
                .unwrap();

            let current = std::fs::read(log.path()).unwrap();
            // everything before the closing bracket is left in place
            let kept = if n == 0 { 1 } else { previous.len() - 2 };
            assert_eq!(current[..kept], previous[..kept]);

            let parsed: Vec<OpLogEntry> = serde_json::from_slice(&current).unwrap();
            assert_eq!(parsed.len(), n + 1);
            assert_eq!(parsed[n].dest, dest);
            previous = current;
        }
        log.flush().unwrap();
    }

    #[test]
    fn name_follows_initiator_and_time() {
        let at = DateTime::parse_from_rfc3339("2024-03-05T06:07:08Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(log_file_name("cli", at), "export_cli_20240305T060708Z.json");
        assert_eq!(log_time("export_cli_20240305T060708Z.json", "cli"), Some(at));
        assert_eq!(log_time("export_gui_20240305T060708Z.json", "cli"), None);
    }

    #[test]
    fn prune_removes_only_old_logs_of_same_initiator() {
        let dir = tempfile::tempdir().unwrap();
        let now = Utc::now();
        let old = now - Duration::days(8);
        let recent = now - Duration::days(1);
        for name in [
            log_file_name("cli", old),
            log_file_name("cli", recent),
            log_file_name("gui", old),
            "notes.txt".to_string(),
        ] {
            std::fs::write(dir.path().join(name), b"[]").unwrap();
        }

        let removed = prune_logs(dir.path(), "cli", Duration::days(7), now);
        assert_eq!(removed, 1);
        assert!(!dir.path().join(log_file_name("cli", old)).exists());
        assert!(dir.path().join(log_file_name("cli", recent)).exists());
        assert!(dir.path().join(log_file_name("gui", old)).exists());
    }
}
