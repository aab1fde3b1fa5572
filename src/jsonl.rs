// JSONL snapshot file operations

use eyre::{Context, Result};
use fs2::FileExt;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use tracing::{info, warn};

/// One persisted line of substrate state
///
/// A tombstone (`deleted: true`) carries no value and removes the key when
/// the snapshot is loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub deleted: bool,
    pub updated_at: i64,
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl SnapshotEntry {
    pub fn live(key: impl Into<String>, value: Value, updated_at: i64) -> Self {
        Self {
            key: key.into(),
            value: Some(value),
            deleted: false,
            updated_at,
        }
    }

    pub fn tombstone(key: impl Into<String>, updated_at: i64) -> Self {
        Self {
            key: key.into(),
            value: None,
            deleted: true,
            updated_at,
        }
    }
}

/// Types that can be deduplicated by key when reading a JSONL file
pub trait Versioned {
    fn key(&self) -> &str;

    /// Write stamp in milliseconds since epoch; a store never reuses or
    /// lowers one, so the highest stamp is the latest write
    fn updated_at(&self) -> i64;
}

impl Versioned for SnapshotEntry {
    fn key(&self) -> &str {
        &self.key
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }
}

/// Append records to a JSONL file under an exclusive lock
pub fn append_jsonl<T: Serialize>(path: &Path, records: &[T]) -> Result<()> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .context("Failed to open JSONL file for appending")?;

    file.lock_exclusive().context("Failed to acquire file lock")?;
    write_lines(&file, records)?;
    file.sync_all()?; // Ensure data is flushed to disk

    // Lock is released when file is dropped
    Ok(())
}

/// Replace a JSONL file with exactly `records`
///
/// Writes to a sibling temp file first and renames it over `path`.
pub fn write_jsonl<T: Serialize>(path: &Path, records: &[T]) -> Result<()> {
    let tmp_path = path.with_extension("jsonl.tmp");

    let file = File::create(&tmp_path).context("Failed to create temporary JSONL file")?;
    file.lock_exclusive().context("Failed to acquire file lock")?;
    write_lines(&file, records)?;
    file.sync_all()?;
    drop(file);

    fs::rename(&tmp_path, path).context("Failed to replace JSONL file")?;
    Ok(())
}

fn write_lines<T: Serialize>(file: &File, records: &[T]) -> Result<()> {
    let mut writer = BufWriter::new(file);
    for record in records {
        let json = serde_json::to_string(record)?;
        writeln!(writer, "{}", json)?;
    }
    writer.flush()?;
    Ok(())
}

/// Read all records from a JSONL file, returning the latest version per key
///
/// A later line replaces an earlier one unless it carries an older
/// `updated_at`. Blank and malformed lines are skipped.
pub fn read_jsonl_latest<T>(path: &Path) -> Result<HashMap<String, T>>
where
    T: DeserializeOwned + Versioned,
{
    if !path.exists() {
        // File doesn't exist yet, return empty map
        return Ok(HashMap::new());
    }

    let file = File::open(path).context("Failed to open JSONL file")?;
    file.lock_shared().context("Failed to acquire file lock")?;
    let mut records: HashMap<String, T> = HashMap::new();

    let parsed = BufReader::new(&file)
        .lines()
        .enumerate()
        .filter_map(|(index, line)| parse_line::<T>(path, index + 1, line));

    for record in parsed {
        // An existing record survives only if its stamp is strictly higher
        let superseded = records
            .get(record.key())
            .is_none_or(|existing| record.updated_at() >= existing.updated_at());
        if superseded {
            records.insert(record.key().to_string(), record);
        }
    }

    info!(
        file = ?path,
        count = records.len(),
        "Loaded latest records from JSONL"
    );

    Ok(records)
}

/// Decode one snapshot line; blank lines are skipped silently, unreadable
/// ones with a warning
fn parse_line<T: DeserializeOwned>(path: &Path, line_no: usize, line: io::Result<String>) -> Option<T> {
    let parsed = line
        .map_err(eyre::Report::from)
        .and_then(|text| match text.trim() {
            "" => Ok(None),
            json => serde_json::from_str(json).map(Some).map_err(eyre::Report::from),
        });

    parsed.unwrap_or_else(|e| {
        warn!(file = ?path, line = line_no, error = %e, "Skipping unreadable snapshot line");
        None
    })
}
