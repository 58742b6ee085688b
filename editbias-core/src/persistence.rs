//! Shared persistence utilities: atomic file writes, JSON and JSONL load/save.
//!
//! Whole-file artifacts (run manifest, report) use the write-to-`.tmp`-then-rename
//! pattern. Per-record stage outputs are JSON Lines: one complete line per record,
//! appended and flushed before the writer returns.

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs::OpenOptions;
use std::io::{self, BufRead, BufReader, Write};
use std::path::Path;

/// Atomically write JSON data to a file.
///
/// Serializes `data` to pretty-printed JSON, writes to a `.tmp` sibling file,
/// then atomically renames to the target path. Creates parent directories if
/// they don't exist.
pub fn atomic_write_json<T: Serialize>(path: &Path, data: &T) -> io::Result<()> {
    let json = serde_json::to_string_pretty(data).map_err(io::Error::other)?;
    atomic_write(path, json.as_bytes())
}

/// Atomically write raw bytes to a file.
pub fn atomic_write(path: &Path, data: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Load and deserialize JSON from a file.
///
/// Returns `Ok(None)` if the file doesn't exist.
pub fn load_json<T: DeserializeOwned>(path: &Path) -> io::Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let data = std::fs::read_to_string(path)?;
    let value =
        serde_json::from_str(&data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    Ok(Some(value))
}

/// Append one record as a single JSON line and sync it to disk.
pub fn append_jsonl<T: Serialize>(path: &Path, record: &T) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut line = serde_json::to_vec(record).map_err(io::Error::other)?;
    line.push(b'\n');
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(&line)?;
    file.sync_data()?;
    Ok(())
}

/// Write a full JSONL file atomically, replacing any previous content.
pub fn atomic_write_jsonl<T: Serialize>(path: &Path, records: &[T]) -> io::Result<()> {
    let mut buf = Vec::new();
    for record in records {
        serde_json::to_writer(&mut buf, record).map_err(io::Error::other)?;
        buf.push(b'\n');
    }
    atomic_write(path, &buf)
}

/// Truncate a JSONL file back to its last complete line.
///
/// Returns `true` when a partial trailing line was removed. Must run before
/// appending to a file that may have been written by a crashed process.
pub fn repair_jsonl_tail(path: &Path) -> io::Result<bool> {
    if !path.exists() {
        return Ok(false);
    }
    let data = std::fs::read(path)?;
    if data.is_empty() || data.ends_with(b"\n") {
        return Ok(false);
    }
    let keep = data
        .iter()
        .rposition(|b| *b == b'\n')
        .map(|i| i + 1)
        .unwrap_or(0);
    let file = OpenOptions::new().write(true).open(path)?;
    file.set_len(keep as u64)?;
    file.sync_data()?;
    Ok(true)
}

/// Load every record from a JSONL file.
///
/// A missing file yields an empty list. Lines that fail to parse are skipped and
/// counted in the second tuple element; a crash mid-append leaves at most one
/// such line at the end of the file.
pub fn load_jsonl<T: DeserializeOwned>(path: &Path) -> io::Result<(Vec<T>, usize)> {
    if !path.exists() {
        return Ok((Vec::new(), 0));
    }
    let reader = BufReader::new(std::fs::File::open(path)?);
    let mut records = Vec::new();
    let mut skipped = 0;
    for (lineno, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(&line) {
            Ok(record) => records.push(record),
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    line = lineno + 1,
                    error = %e,
                    "Skipping unreadable JSONL line"
                );
                skipped += 1;
            }
        }
    }
    Ok((records, skipped))
}
