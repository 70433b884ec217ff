//! Append-only index log
//!
//! One line per insertion at the cache root:
//!
//! ```text
//! 20240131 <digest>: "https://example.com/page"
//! ```
//!
//! The key is written as a JSON string so keys with quotes or line breaks
//! still occupy exactly one line.

use chrono::NaiveDate;
use regex::Regex;
use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use super::hasher::KeyHash;
use super::types::{IndexRecord, Result};

pub const INDEX_FILE_NAME: &str = "index";
pub const DATE_FORMAT: &str = "%Y%m%d";

fn line_regex() -> &'static Regex {
    static LINE_RE: OnceLock<Regex> = OnceLock::new();
    LINE_RE.get_or_init(|| {
        Regex::new(r#"^(?P<date>\d{8}) (?P<digest>[0-9a-f]+): (?P<key>".*")\s*$"#)
            .expect("index line pattern is valid")
    })
}

/// Render one index line, without the trailing newline.
///
/// The key is written as a JSON string. Plain URLs come out as `"<key>"`;
/// quotes, backslashes and newlines are escaped so every record stays on one line.
pub fn format_record(date: NaiveDate, digest: &KeyHash, key: &str) -> Result<String> {
    Ok(format!(
        "{} {}: {}",
        date.format(DATE_FORMAT),
        digest,
        serde_json::to_string(key)?
    ))
}

/// Parse one index line. Returns `None` for anything malformed.
pub fn parse_line(line: &str) -> Option<IndexRecord> {
    let caps = line_regex().captures(line)?;
    let date = NaiveDate::parse_from_str(&caps["date"], DATE_FORMAT).ok()?;
    let digest = KeyHash::parse_hex(&caps["digest"]).ok()?;
    let raw_key = &caps["key"];
    let key = serde_json::from_str::<String>(raw_key)
        .unwrap_or_else(|_| raw_key.trim_matches('"').to_string());
    Some(IndexRecord {
        date,
        digest: digest.to_hex(),
        key,
    })
}

/// Handle to the index file under a cache root.
#[derive(Debug, Clone)]
pub struct IndexLog {
    root: PathBuf,
    path: PathBuf,
}

impl IndexLog {
    pub fn new(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref().to_path_buf();
        let path = root.join(INDEX_FILE_NAME);
        Self { root, path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a record, creating the file on first use.
    pub fn append(&self, date: NaiveDate, digest: &KeyHash, key: &str) -> Result<()> {
        let line = format_record(date, digest, key)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{line}")?;
        Ok(())
    }

    fn read_lines(&self) -> Result<Vec<String>> {
        let file = match fs::File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut lines = Vec::new();
        for line in BufReader::new(file).lines() {
            lines.push(line?);
        }
        Ok(lines)
    }

    /// Number of non-empty lines; zero when the index does not exist yet.
    pub fn line_count(&self) -> Result<usize> {
        Ok(self
            .read_lines()?
            .iter()
            .filter(|line| !line.trim().is_empty())
            .count())
    }

    /// Every well-formed record in file order. Malformed lines are logged and skipped.
    pub fn records(&self) -> Result<Vec<IndexRecord>> {
        let mut records = Vec::new();
        for (number, line) in self.read_lines()?.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match parse_line(line) {
                Some(record) => records.push(record),
                None => warn!(
                    "Skipping malformed index line {} in {}: {:?}",
                    number + 1,
                    self.path.display(),
                    line
                ),
            }
        }
        Ok(records)
    }

    /// Rewrite the index without any line referencing one of `digests`.
    /// Lines that do not parse are kept as they are. Returns the surviving line count.
    pub fn remove_digests(&self, digests: &HashSet<String>) -> Result<usize> {
        if !self.path.exists() {
            return Ok(0);
        }
        let mut kept = Vec::new();
        let mut dropped = 0usize;
        for line in self.read_lines()? {
            if line.trim().is_empty() {
                continue;
            }
            let referenced = parse_line(&line)
                .map(|record| digests.contains(&record.digest))
                .unwrap_or(false);
            if referenced {
                dropped += 1;
            } else {
                kept.push(line);
            }
        }

        let mut tmp = NamedTempFile::new_in(&self.root)?;
        for line in &kept {
            writeln!(tmp, "{line}")?;
        }
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| e.error)?;

        debug!(
            "Rewrote index {}: kept {} lines, dropped {}",
            self.path.display(),
            kept.len(),
            dropped
        );
        Ok(kept.len())
    }
}
