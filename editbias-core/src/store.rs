//! Append-only checkpoint store for stage records.
//!
//! The store is the only shared mutable state in a run. Each stage writes one
//! JSONL file; every line is one complete record keyed by its [`RecordKey`].
//! Writers go through a mutex per file, and a key already present is never
//! written twice, so concurrent workers and resumed runs cannot duplicate or
//! clobber records.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::persistence::{append_jsonl, load_jsonl, repair_jsonl_tail};
use crate::types::{EvaluationRecord, GenerationRecord, RecordKey};

pub const GENERATIONS_FILE: &str = "generations.jsonl";
pub const EVALUATIONS_FILE: &str = "evaluations.jsonl";

/// Records that carry their own idempotency key.
pub trait Keyed {
    fn key(&self) -> &RecordKey;
}

impl Keyed for GenerationRecord {
    fn key(&self) -> &RecordKey {
        &self.key
    }
}

impl Keyed for EvaluationRecord {
    fn key(&self) -> &RecordKey {
        &self.key
    }
}

/// One append-only stage file plus its in-memory index.
struct StageFile<T> {
    path: PathBuf,
    records: HashMap<RecordKey, T>,
    order: Vec<RecordKey>,
}

impl<T: Keyed + Clone + Serialize + DeserializeOwned> StageFile<T> {
    fn open(path: PathBuf) -> Result<Self, StoreError> {
        let load_err = |e: std::io::Error| StoreError::LoadFailed {
            path: path.clone(),
            message: e.to_string(),
        };
        if repair_jsonl_tail(&path).map_err(load_err)? {
            warn!(path = %path.display(), "Truncated partial record left by an interrupted run");
        }
        let (loaded, skipped): (Vec<T>, usize) = load_jsonl(&path).map_err(load_err)?;
        if skipped > 0 {
            warn!(path = %path.display(), skipped, "Ignored unreadable records");
        }

        let mut records = HashMap::new();
        let mut order = Vec::new();
        for record in loaded {
            let key = record.key().clone();
            if records.contains_key(&key) {
                // First write wins; a duplicate line can only come from manual edits.
                continue;
            }
            order.push(key.clone());
            records.insert(key, record);
        }
        Ok(Self {
            path,
            records,
            order,
        })
    }

    fn append(&mut self, record: T) -> Result<(), StoreError> {
        append_jsonl(&self.path, &record).map_err(|e| StoreError::Unwritable {
            path: self.path.clone(),
            message: e.to_string(),
        })?;
        let key = record.key().clone();
        self.order.push(key.clone());
        self.records.insert(key, record);
        Ok(())
    }

    fn ordered(&self) -> Vec<T> {
        self.order
            .iter()
            .filter_map(|k| self.records.get(k).cloned())
            .collect()
    }
}

/// Checkpoint store for one run directory.
pub struct CheckpointStore {
    dir: PathBuf,
    generations: Mutex<StageFile<GenerationRecord>>,
    evaluations: Mutex<StageFile<EvaluationRecord>>,
}

impl CheckpointStore {
    /// Open (or create) the store in `dir`, loading any completed records.
    pub fn open(dir: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(dir).map_err(|e| StoreError::Unwritable {
            path: dir.to_path_buf(),
            message: e.to_string(),
        })?;
        let generations = StageFile::open(dir.join(GENERATIONS_FILE))?;
        let evaluations = StageFile::open(dir.join(EVALUATIONS_FILE))?;
        info!(
            dir = %dir.display(),
            generations = generations.order.len(),
            evaluations = evaluations.order.len(),
            "Checkpoint store opened"
        );
        Ok(Self {
            dir: dir.to_path_buf(),
            generations: Mutex::new(generations),
            evaluations: Mutex::new(evaluations),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn generation(&self, key: &RecordKey) -> Option<GenerationRecord> {
        lock(&self.generations).records.get(key).cloned()
    }

    /// Persist a terminal generation record.
    ///
    /// Returns the stored record: the given one if the key was new, or the
    /// previously stored record if another writer got there first.
    pub fn put_generation(&self, record: GenerationRecord) -> Result<GenerationRecord, StoreError> {
        debug_assert!(record.is_terminal(), "pending records are never checkpointed");
        let mut file = lock(&self.generations);
        if let Some(existing) = file.records.get(&record.key) {
            debug!(key = %record.key, "Generation already checkpointed");
            return Ok(existing.clone());
        }
        file.append(record.clone())?;
        Ok(record)
    }

    /// All generation records in completion order.
    pub fn generations(&self) -> Vec<GenerationRecord> {
        lock(&self.generations).ordered()
    }

    pub fn has_evaluation(&self, key: &RecordKey) -> bool {
        lock(&self.evaluations).records.contains_key(key)
    }

    pub fn evaluation(&self, key: &RecordKey) -> Option<EvaluationRecord> {
        lock(&self.evaluations).records.get(key).cloned()
    }

    /// Persist an evaluation record. A stored verdict is immutable.
    pub fn put_evaluation(&self, record: EvaluationRecord) -> Result<(), StoreError> {
        let mut file = lock(&self.evaluations);
        if file.records.contains_key(&record.key) {
            return Err(StoreError::VerdictImmutable {
                key: record.key.to_string(),
            });
        }
        file.append(record)
    }

    /// All evaluation records in completion order.
    pub fn evaluations(&self) -> Vec<EvaluationRecord> {
        lock(&self.evaluations).ordered()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    // A panicking writer can't leave a half-written line behind the index, so a
    // poisoned lock is still consistent.
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
