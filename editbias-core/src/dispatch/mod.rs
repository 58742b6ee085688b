//! Stage II: generation dispatch.
//!
//! Every (prompt, source, backend, seed) request is issued at most once per
//! run directory. Completed records are checkpointed before the next one
//! starts on the same worker, so a cancelled or crashed run resumes by skipping
//! keys the store already holds.

pub mod source;

use chrono::Utc;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{
    Attempt, BackendRegistry, EditBackend, EditRequest, EditResponse, EditStatus, RetryOutcome,
    retry_bounded,
};
use crate::config::{AuditConfig, RetryConfig};
use crate::error::{AuditError, BackendError, StoreError};
use crate::persistence::atomic_write;
use crate::store::CheckpointStore;
use crate::types::{BackendOutcome, GenerationRecord, GenerationStatus, Mode, Prompt, RecordKey};
use source::SourceImage;

/// Directory under the run directory holding output images.
pub const ARTIFACTS_DIR: &str = "artifacts";

/// One unit of Stage II work.
#[derive(Debug, Clone)]
pub struct DispatchJob {
    pub prompt: Arc<Prompt>,
    pub source: Option<Arc<SourceImage>>,
    pub backend: String,
    pub seed: u64,
}

impl DispatchJob {
    pub fn key(&self) -> RecordKey {
        RecordKey::new(
            &self.prompt.prompt_id,
            self.source.as_ref().map(|s| s.id.as_str()),
            &self.backend,
            self.seed,
        )
    }
}

/// Counts from one `dispatch_all` pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    pub completed: usize,
    /// Already checkpointed by an earlier pass.
    pub skipped: usize,
    pub errors: usize,
    pub backend_refusals: usize,
    pub cancelled: bool,
}

/// Issues generation requests and checkpoints their records.
#[derive(Clone)]
pub struct Dispatcher {
    store: Arc<CheckpointStore>,
    run_dir: PathBuf,
    retry: RetryConfig,
    mode: Mode,
    cancel: CancellationToken,
}

impl Dispatcher {
    pub fn new(
        store: Arc<CheckpointStore>,
        run_dir: PathBuf,
        retry: RetryConfig,
        mode: Mode,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            run_dir,
            retry,
            mode,
            cancel,
        }
    }

    /// Dispatch one request, or return the record already stored for its key.
    pub async fn dispatch(
        &self,
        prompt: &Prompt,
        source: Option<&SourceImage>,
        backend: &dyn EditBackend,
        seed: u64,
    ) -> Result<GenerationRecord, StoreError> {
        let key = RecordKey::new(
            &prompt.prompt_id,
            source.map(|s| s.id.as_str()),
            backend.name(),
            seed,
        );
        if let Some(existing) = self.store.generation(&key) {
            debug!(key = %key, "Skipping checkpointed generation");
            return Ok(existing);
        }

        let request = EditRequest {
            key: key.clone(),
            instruction: prompt.expanded_text.clone(),
            source_image: match self.mode {
                Mode::I2i => source.map(|s| Arc::clone(&s.bytes)),
                Mode::T2i => None,
            },
            seed,
        };

        let started = Instant::now();
        let outcome = retry_bounded(&self.retry, |_| {
            let request = request.clone();
            async move { Attempt::from(backend.edit(request).await) }
        })
        .await;
        let latency_ms = started.elapsed().as_millis() as u64;

        let mut record = GenerationRecord::pending(key.clone(), self.mode);
        record.latency_ms = latency_ms;
        record.attempts = outcome.attempts();
        record.completed_at = Some(Utc::now());
        if let Some(source) = source {
            record.source_path = source.path.clone();
            record.source_group = source.group.clone();
            record.synthetic_source = source.synthetic;
        }

        match outcome {
            RetryOutcome::Completed { value, .. } => self.complete(&mut record, value)?,
            RetryOutcome::Exhausted { error, attempts } => {
                record.status = GenerationStatus::Error;
                record.status_reason = format!("gave up after {attempts} attempts: {error}");
            }
            RetryOutcome::Failed { error, .. } => {
                record.status = GenerationStatus::Error;
                record.status_reason = format!("terminal backend failure: {error}");
            }
        }

        if record.status == GenerationStatus::Error {
            warn!(key = %key, reason = %record.status_reason, "Generation failed");
        }
        self.store.put_generation(record)
    }

    fn complete(
        &self,
        record: &mut GenerationRecord,
        response: EditResponse,
    ) -> Result<(), StoreError> {
        record.status = GenerationStatus::Success;
        record.backend_message = response.message.clone();
        match response.status {
            EditStatus::Success => {
                record.outcome = Some(BackendOutcome::Edited);
                record.status_reason = "edited".into();
                if let Some(image) = response.image {
                    record.artifact = Some(self.write_artifact(&record.key, &image)?);
                } else {
                    record.status_reason = "edited, but no image was returned".into();
                }
            }
            EditStatus::Refused => {
                record.outcome = Some(BackendOutcome::Refused);
                record.status_reason = format!(
                    "refused by backend: {}",
                    response.message.as_deref().unwrap_or("no message")
                );
            }
            EditStatus::Error => {
                record.outcome = Some(BackendOutcome::PolicyError);
                record.status_reason = format!(
                    "backend error signal: {}",
                    response.message.as_deref().unwrap_or("no message")
                );
            }
        }
        Ok(())
    }

    fn write_artifact(&self, key: &RecordKey, bytes: &[u8]) -> Result<PathBuf, StoreError> {
        let relative = PathBuf::from(ARTIFACTS_DIR).join(format!("{}.png", key.digest()));
        let path = self.run_dir.join(&relative);
        atomic_write(&path, bytes).map_err(|e| StoreError::Unwritable {
            path,
            message: e.to_string(),
        })?;
        Ok(relative)
    }

    /// Dispatch every job on per-backend bounded pools.
    ///
    /// Stops issuing new requests once the cancellation token fires; records
    /// already in flight finish and are checkpointed.
    pub async fn dispatch_all(
        &self,
        jobs: Vec<DispatchJob>,
        registry: &BackendRegistry,
        config: &AuditConfig,
    ) -> Result<DispatchSummary, AuditError> {
        let mut summary = DispatchSummary::default();
        let mut pools: HashMap<String, Arc<Semaphore>> = HashMap::new();
        let mut backends: HashMap<String, Arc<dyn EditBackend>> = HashMap::new();
        let mut tasks = JoinSet::new();

        for job in jobs {
            if self.store.generation(&job.key()).is_some() {
                summary.skipped += 1;
                continue;
            }
            if !backends.contains_key(&job.backend) {
                let backend = registry.get(&job.backend)?;
                backends.insert(job.backend.clone(), backend);
                pools.insert(
                    job.backend.clone(),
                    Arc::new(Semaphore::new(config.backend_concurrency(&job.backend))),
                );
            }
            let (Some(backend), Some(pool)) = (
                backends.get(&job.backend).cloned(),
                pools.get(&job.backend).cloned(),
            ) else {
                return Err(BackendError::NotRegistered { name: job.backend }.into());
            };

            let dispatcher = self.clone();
            tasks.spawn(async move {
                let Ok(_permit) = pool.acquire_owned().await else {
                    return Ok(None);
                };
                if dispatcher.cancel.is_cancelled() {
                    return Ok(None);
                }
                dispatcher
                    .dispatch(
                        &job.prompt,
                        job.source.as_deref(),
                        backend.as_ref(),
                        job.seed,
                    )
                    .await
                    .map(Some)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let result = joined.map_err(|e| {
                AuditError::Io(std::io::Error::other(format!("dispatch task failed: {e}")))
            })?;
            match result {
                Ok(Some(record)) => {
                    summary.completed += 1;
                    if record.status == GenerationStatus::Error {
                        summary.errors += 1;
                    }
                    if matches!(
                        record.outcome,
                        Some(BackendOutcome::Refused | BackendOutcome::PolicyError)
                    ) {
                        summary.backend_refusals += 1;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tasks.abort_all();
                    return Err(e.into());
                }
            }
        }

        summary.cancelled = self.cancel.is_cancelled();
        info!(
            completed = summary.completed,
            skipped = summary.skipped,
            errors = summary.errors,
            backend_refusals = summary.backend_refusals,
            cancelled = summary.cancelled,
            "Stage II dispatch finished"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{Script, ScriptedBackend};
    use crate::types::Congruence;
    use source::SourcePool;
    use std::time::Duration;
    use tempfile::TempDir;

    fn prompt(id: &str) -> Prompt {
        Prompt {
            prompt_id: id.into(),
            base_id: "b1".into(),
            category: "healthcare".into(),
            domain: "medical".into(),
            benign: true,
            attribute: None,
            congruence: Congruence::Baseline,
            rephrased_text: "Put a bandage on the nurse's arm".into(),
            expanded_text: "Put a bandage on the nurse's arm".into(),
            fallback_clause: false,
        }
    }

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_retries: 2,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }

    fn dispatcher(dir: &TempDir) -> Dispatcher {
        let store = Arc::new(CheckpointStore::open(dir.path()).unwrap());
        Dispatcher::new(
            store,
            dir.path().to_path_buf(),
            fast_retry(),
            Mode::I2i,
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_dispatch_writes_artifact_and_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let d = dispatcher(&dir);
        let backend = ScriptedBackend::new("mock");
        let pool = SourcePool::synthetic(1).unwrap();
        let source = &pool.images()[0];

        let first = d.dispatch(&prompt("p1"), Some(source), &backend, 7).await.unwrap();
        assert_eq!(first.status, GenerationStatus::Success);
        assert_eq!(first.outcome, Some(BackendOutcome::Edited));
        assert!(first.synthetic_source);
        let artifact = dir.path().join(first.artifact.as_ref().unwrap());
        assert!(artifact.exists());

        let second = d.dispatch(&prompt("p1"), Some(source), &backend, 7).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test]
    async fn test_transient_failures_retried_then_recorded() {
        let dir = TempDir::new().unwrap();
        let d = dispatcher(&dir);
        let backend = ScriptedBackend::new("mock");
        backend.fail_next(2);

        let record = d.dispatch(&prompt("p1"), None, &backend, 0).await.unwrap();
        assert_eq!(record.status, GenerationStatus::Success);
        assert_eq!(record.attempts, 3);

        backend.fail_next(10);
        let record = d.dispatch(&prompt("p2"), None, &backend, 0).await.unwrap();
        assert_eq!(record.status, GenerationStatus::Error);
        assert_eq!(record.attempts, 3);
        assert!(record.status_reason.starts_with("gave up after 3 attempts"));
        assert_eq!(record.outcome, None);
    }

    #[tokio::test]
    async fn test_refusal_is_not_an_error() {
        let dir = TempDir::new().unwrap();
        let d = dispatcher(&dir);
        let backend = ScriptedBackend::new("mock");
        backend.script("p1", None, Script::Refuse);
        backend.script(
            "p2",
            None,
            Script::Fail(BackendError::Terminal {
                message: "invalid request".into(),
            }),
        );

        let refused = d.dispatch(&prompt("p1"), None, &backend, 0).await.unwrap();
        assert_eq!(refused.status, GenerationStatus::Success);
        assert_eq!(refused.outcome, Some(BackendOutcome::Refused));

        let failed = d.dispatch(&prompt("p2"), None, &backend, 0).await.unwrap();
        assert_eq!(failed.status, GenerationStatus::Error);
        assert_eq!(failed.attempts, 1);
    }

    #[tokio::test]
    async fn test_dispatch_all_skips_done_and_honors_cancel() {
        let dir = TempDir::new().unwrap();
        let d = dispatcher(&dir);
        let backend = Arc::new(ScriptedBackend::new("mock"));
        let mut registry = BackendRegistry::new();
        registry.register(backend.clone());
        let config = AuditConfig::default();

        let jobs: Vec<DispatchJob> = (0..4)
            .map(|seed| DispatchJob {
                prompt: Arc::new(prompt("p1")),
                source: None,
                backend: "mock".into(),
                seed,
            })
            .collect();

        let summary = d.dispatch_all(jobs.clone(), &registry, &config).await.unwrap();
        assert_eq!(summary.completed, 4);
        let again = d.dispatch_all(jobs.clone(), &registry, &config).await.unwrap();
        assert_eq!(again.skipped, 4);
        assert_eq!(backend.calls(), 4);

        d.cancel.cancel();
        let more: Vec<DispatchJob> = jobs
            .into_iter()
            .map(|mut j| {
                j.seed += 100;
                j
            })
            .collect();
        let cancelled = d.dispatch_all(more, &registry, &config).await.unwrap();
        assert!(cancelled.cancelled);
        assert_eq!(cancelled.completed, 0);
        assert_eq!(backend.calls(), 4);
    }

    fn capped(name: &str, max_concurrency: usize) -> crate::config::BackendConfig {
        crate::config::BackendConfig {
            name: name.into(),
            kind: crate::config::AdapterKind::External,
            endpoint: None,
            api_key_env: None,
            model: None,
            max_concurrency: Some(max_concurrency),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_backend_pools_are_capped_independently() {
        let dir = TempDir::new().unwrap();
        let d = dispatcher(&dir);
        let slow = Arc::new(ScriptedBackend::new("slow"));
        slow.delay(Duration::from_secs(10));
        let fast = Arc::new(ScriptedBackend::new("fast"));
        fast.delay(Duration::from_secs(1));
        let mut registry = BackendRegistry::new();
        registry.register(slow.clone());
        registry.register(fast.clone());

        let mut config = AuditConfig::default();
        config.backends.push(capped("slow", 1));
        config.backends.push(capped("fast", 3));

        let job = |backend: &str, seed: u64| DispatchJob {
            prompt: Arc::new(prompt("p1")),
            source: None,
            backend: backend.into(),
            seed,
        };
        let jobs: Vec<DispatchJob> = (0..3)
            .map(|seed| job("slow", seed))
            .chain((0..6).map(|seed| job("fast", seed)))
            .collect();

        let midway = async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            (fast.calls(), fast.in_flight(), slow.calls())
        };
        let (summary, (fast_calls, fast_running, slow_calls)) =
            tokio::join!(d.dispatch_all(jobs, &registry, &config), midway);

        // The fast pool drained while the slow one was still on its first request.
        assert_eq!((fast_calls, fast_running, slow_calls), (6, 0, 1));
        assert_eq!(summary.unwrap().completed, 9);
        assert_eq!(slow.peak_in_flight(), 1);
        assert_eq!(fast.peak_in_flight(), 3);
    }

    #[tokio::test]
    async fn test_unknown_backend_is_error() {
        let dir = TempDir::new().unwrap();
        let d = dispatcher(&dir);
        let jobs = vec![DispatchJob {
            prompt: Arc::new(prompt("p1")),
            source: None,
            backend: "nope".into(),
            seed: 0,
        }];
        let err = d
            .dispatch_all(jobs, &BackendRegistry::new(), &AuditConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AuditError::Backend(BackendError::NotRegistered { .. })));
    }
}
