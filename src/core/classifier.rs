//! Turns export paths into the keys the diff engine compares

use chrono::NaiveDate;
use regex::Regex;
use std::sync::OnceLock;

/// Identity of a file for diffing purposes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOperationKey {
    /// Identified by its full relative path (case-insensitive)
    Exact { path: String },
    /// `<base>_<YYYYMMDD><ext>`, identified by `(dir, base, ext)` and ordered by date
    Dated {
        dir: String,
        base: String,
        ext: String,
        date: NaiveDate,
        path: String,
    },
}

impl FileOperationKey {
    pub fn path(&self) -> &str {
        match self {
            Self::Exact { path } | Self::Dated { path, .. } => path,
        }
    }

    /// Lowercased path, used for exact comparisons
    pub fn match_path(&self) -> String {
        self.path().to_lowercase()
    }

    /// Lowercased `(dir, base, ext)` for dated keys
    pub fn group(&self) -> Option<(String, String, String)> {
        match self {
            Self::Dated { dir, base, ext, .. } => Some((
                dir.to_lowercase(),
                base.to_lowercase(),
                ext.to_lowercase(),
            )),
            Self::Exact { .. } => None,
        }
    }

    pub fn date(&self) -> Option<NaiveDate> {
        match self {
            Self::Dated { date, .. } => Some(*date),
            Self::Exact { .. } => None,
        }
    }

    pub fn is_dated(&self) -> bool {
        matches!(self, Self::Dated { .. })
    }
}

/// A cached file and where the export wants it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceKey {
    pub source_id: String,
    /// Path inside the source's cache directory
    pub relative_path: String,
    /// Classified on the intended destination path
    pub key: FileOperationKey,
}

impl SourceKey {
    /// `<sourceId>/<relativePath>`
    pub fn cache_path(&self) -> String {
        format!("{}/{}", self.source_id, self.relative_path)
    }
}

fn dated_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(.+)_([0-9]{8})(\.[^./]+)$").expect("dated filename pattern is valid")
    })
}

/// Parse `YYYYMMDD`; only 20xx calendar dates qualify
pub fn parse_filename_date(digits: &str) -> Option<NaiveDate> {
    if digits.len() != 8 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if !digits.starts_with("20") {
        return None;
    }
    let iso = format!("{}-{}-{}", &digits[0..4], &digits[4..6], &digits[6..8]);
    NaiveDate::parse_from_str(&iso, "%Y-%m-%d").ok()
}

/// Classify a relative path; anything not exactly `name_YYYYMMDD.ext` is exact
pub fn classify(path: &str) -> FileOperationKey {
    let (dir, file_name) = match path.rsplit_once('/') {
        Some((dir, name)) => (dir, name),
        None => ("", path),
    };

    let dated = dated_pattern().captures(file_name).and_then(|caps| {
        let base = caps.get(1)?.as_str();
        let date = parse_filename_date(caps.get(2)?.as_str())?;
        let ext = caps.get(3)?.as_str();
        Some(FileOperationKey::Dated {
            dir: dir.to_string(),
            base: base.to_string(),
            ext: ext.to_string(),
            date,
            path: path.to_string(),
        })
    });

    dated.unwrap_or_else(|| FileOperationKey::Exact {
        path: path.to_string(),
    })
}

/// Cache-side key: the owning source plus the intended destination path
pub fn classify_source(source_id: &str, relative_path: &str, dest_path: &str) -> SourceKey {
    SourceKey {
        source_id: source_id.to_string(),
        relative_path: relative_path.to_string(),
        key: classify(dest_path),
    }
}

/// Destination-side key
pub fn classify_dest(path: &str) -> FileOperationKey {
    classify(path)
}
