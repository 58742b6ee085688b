//! Run lifecycle: `init -> run -> finalize`.
//!
//! An [`AuditRun`] owns the [`RunContext`] every stage works through. All state
//! a stage needs lives in the run directory, so a cancelled or crashed run is
//! resumed by initializing again with the same `run_id`:
//!
//! ```text
//! <output_dir>/<run_id>/
//!   run.json               config snapshot
//!   prompts.jsonl          Stage I accepted prompts
//!   rejections.jsonl       Stage I audit log
//!   generations.jsonl      Stage II checkpoint
//!   artifacts/             Stage II output images
//!   evaluations.jsonl      Stage III checkpoint
//!   review_queue.jsonl     human-review sample
//!   report.json            Stage IV report
//!   baseline_failure.json  written instead of report.json when the gate fails
//! ```

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backend::{BackendRegistry, registries_from_config};
use crate::config::AuditConfig;
use crate::dispatch::source::SourcePool;
use crate::dispatch::{DispatchJob, DispatchSummary, Dispatcher};
use crate::ensemble::EnsembleEvaluator;
use crate::ensemble::judge::{BoundedJudge, Judge, JudgeRegistry};
use crate::ensemble::review::sample_review_queue;
use crate::error::{AnalysisError, AuditError, ConfigError, JudgeError, Result, StoreError};
use crate::persistence::{atomic_write_json, atomic_write_jsonl, load_json, load_jsonl};
use crate::refusal::RefusalDetector;
use crate::stats::{BaselineCheck, StatisticalReport, analyze, baseline_check};
use crate::store::CheckpointStore;
use crate::synth::{Rejection, SynthesisOutcome, Synthesizer};
use crate::types::{
    AttributeTaxonomy, BackendOutcome, BasePrompt, EvaluationRecord, GenerationRecord,
    GenerationStatus, Mode, ObservedRecord, Prompt,
};

pub const RUN_MANIFEST: &str = "run.json";
pub const PROMPTS_FILE: &str = "prompts.jsonl";
pub const REJECTIONS_FILE: &str = "rejections.jsonl";
pub const REVIEW_QUEUE_FILE: &str = "review_queue.jsonl";
pub const REPORT_FILE: &str = "report.json";
pub const BASELINE_FAILURE_FILE: &str = "baseline_failure.json";

/// Contents of `run.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunManifest {
    pub run_id: String,
    pub version: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub resumed_at: Option<DateTime<Utc>>,
    pub config: AuditConfig,
}

/// Written when the neutral-prompt gate rejects the run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaselineFailure {
    pub diagnostic: String,
    pub check: BaselineCheck,
}

/// Everything a stage needs, passed explicitly.
pub struct RunContext {
    pub run_id: String,
    pub run_dir: PathBuf,
    pub config: AuditConfig,
    pub store: Arc<CheckpointStore>,
    pub cancel: CancellationToken,
}

impl RunContext {
    /// Reopen an existing run directory with its snapshotted configuration.
    pub fn open(run_dir: &Path, cancel: CancellationToken) -> Result<Self> {
        let manifest: RunManifest =
            load_json(&run_dir.join(RUN_MANIFEST))?.ok_or_else(|| ConfigError::FileNotFound {
                path: run_dir.join(RUN_MANIFEST),
            })?;
        let store = Arc::new(CheckpointStore::open(run_dir)?);
        Ok(Self {
            run_id: manifest.run_id,
            run_dir: run_dir.to_path_buf(),
            config: manifest.config,
            store,
            cancel,
        })
    }

    pub fn prompts(&self) -> Result<Vec<Prompt>> {
        let (prompts, _) = load_jsonl(&self.run_dir.join(PROMPTS_FILE))?;
        Ok(prompts)
    }

    pub fn rejections(&self) -> Result<Vec<Rejection>> {
        let (rejections, _) = load_jsonl(&self.run_dir.join(REJECTIONS_FILE))?;
        Ok(rejections)
    }

    /// Join every stored record for analysis.
    pub fn observed(&self) -> Result<Vec<ObservedRecord>> {
        Ok(ObservedRecord::join(
            &self.prompts()?,
            &self.store.generations(),
            &self.store.evaluations(),
        ))
    }

    /// Stage IV: write the review queue, then the report or the baseline failure.
    pub fn finalize(&self) -> Result<StatisticalReport> {
        let evaluations = self.store.evaluations();
        let queue = sample_review_queue(
            &evaluations,
            self.config.review.baseline_fraction,
            self.config.run.seed,
        );
        atomic_write_jsonl(&self.run_dir.join(REVIEW_QUEUE_FILE), &queue)?;
        info!(items = queue.len(), "Review queue written");

        let prompts = self.prompts()?;
        let rejections = self.rejections()?;
        let records = ObservedRecord::join(&prompts, &self.store.generations(), &evaluations);

        match analyze(&records, &self.config) {
            Ok(report) => {
                let counts = SynthesisOutcome {
                    prompts,
                    rejections,
                }
                .rejection_counts();
                let report = report.with_rejections(counts);
                atomic_write_json(&self.run_dir.join(REPORT_FILE), &report)?;
                info!(
                    run_id = %self.run_id,
                    records = report.records,
                    rated = report.rated_records,
                    "Report written"
                );
                Ok(report)
            }
            Err(AnalysisError::BaselineValidationFailed { diagnostic }) => {
                let stats = &self.config.stats;
                let working: Vec<&ObservedRecord> = records
                    .iter()
                    .filter(|r| !(stats.exclude_synthetic && r.synthetic_source))
                    .collect();
                let failure = BaselineFailure {
                    diagnostic: diagnostic.clone(),
                    check: baseline_check(&working, stats.baseline_noise_threshold),
                };
                atomic_write_json(&self.run_dir.join(BASELINE_FAILURE_FILE), &failure)?;
                error!(run_id = %self.run_id, %diagnostic, "Run invalidated by baseline check");
                Err(AnalysisError::BaselineValidationFailed { diagnostic }.into())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// What `run` did, stage by stage.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    pub prompts: usize,
    pub rejections: usize,
    pub dispatch: DispatchSummary,
    pub evaluated: usize,
    /// Evaluations already checkpointed by an earlier pass.
    pub evaluations_skipped: usize,
    pub cancelled: bool,
}

fn read_json_file<T: DeserializeOwned>(path: &Path) -> std::result::Result<T, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
        path: path.to_path_buf(),
    })?;
    serde_json::from_str(&content).map_err(|e| ConfigError::ParseError {
        message: format!("{}: {e}", path.display()),
    })
}

/// Stage I from configuration alone: load base prompts and taxonomy, then synthesize.
pub fn synthesize_prompts(config: &AuditConfig) -> Result<SynthesisOutcome> {
    let path = config
        .run
        .base_prompts
        .as_deref()
        .ok_or_else(|| ConfigError::Invalid {
            message: "run.base_prompts is required".into(),
        })?;
    let bases: Vec<BasePrompt> = read_json_file(path)?;
    let taxonomy = match &config.run.taxonomy {
        Some(path) => read_json_file::<AttributeTaxonomy>(path)?,
        None => AttributeTaxonomy::builtin(),
    }
    .restricted_to(&config.run.attribute_axes);
    if taxonomy.axes.is_empty() {
        return Err(ConfigError::Invalid {
            message: format!(
                "run.attribute_axes {:?} matches no taxonomy axis",
                config.run.attribute_axes
            ),
        }
        .into());
    }

    let outcome = Synthesizer::new(config.synthesis.clone()).synthesize(&bases, &taxonomy)?;
    info!(
        bases = bases.len(),
        accepted_bases = outcome.accepted_bases(),
        prompts = outcome.prompts.len(),
        rejections = outcome.rejections.len(),
        "Stage I synthesis complete"
    );
    Ok(outcome)
}

/// One audit run over its directory.
pub struct AuditRun {
    ctx: RunContext,
    backends: BackendRegistry,
    judges: JudgeRegistry,
}

impl AuditRun {
    /// Create or reopen the run directory with HTTP adapters from configuration.
    pub fn init(config: AuditConfig, cancel: CancellationToken) -> Result<Self> {
        Self::init_with(config, BackendRegistry::new(), JudgeRegistry::new(), cancel)
    }

    /// Like [`init`](Self::init), with programmatic backends and judges added
    /// over the configured HTTP ones.
    pub fn init_with(
        config: AuditConfig,
        backends: BackendRegistry,
        judges: JudgeRegistry,
        cancel: CancellationToken,
    ) -> Result<Self> {
        config.validate_for_run()?;
        let (mut all_backends, mut all_judges) = registries_from_config(&config)?;
        all_backends.extend(backends);
        all_judges.extend(judges);
        for name in &config.run.backends {
            if !all_backends.contains(name) {
                return Err(ConfigError::Invalid {
                    message: format!("backend '{name}' is configured but not registered"),
                }
                .into());
            }
        }
        for evaluator in &config.ensemble.evaluators {
            all_judges.get(&evaluator.name)?;
        }

        let run_id = config
            .run
            .run_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let run_dir = config.run.output_dir.join(&run_id);
        let store = Arc::new(CheckpointStore::open(&run_dir)?);

        let manifest_path = run_dir.join(RUN_MANIFEST);
        let manifest = match load_json::<RunManifest>(&manifest_path)? {
            Some(previous) => {
                if previous.config != config {
                    warn!(run_id = %run_id, "Configuration changed since the run was created");
                }
                info!(run_id = %run_id, created_at = %previous.created_at, "Resuming run");
                RunManifest {
                    resumed_at: Some(Utc::now()),
                    config: config.clone(),
                    ..previous
                }
            }
            None => RunManifest {
                run_id: run_id.clone(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                created_at: Utc::now(),
                resumed_at: None,
                config: config.clone(),
            },
        };
        atomic_write_json(&manifest_path, &manifest).map_err(|e| StoreError::Unwritable {
            path: manifest_path.clone(),
            message: e.to_string(),
        })?;
        info!(
            run_id = %run_id,
            dir = %run_dir.display(),
            mode = %config.run.mode,
            "Run initialized"
        );

        Ok(Self {
            ctx: RunContext {
                run_id,
                run_dir,
                config,
                store,
                cancel,
            },
            backends: all_backends,
            judges: all_judges,
        })
    }

    pub fn context(&self) -> &RunContext {
        &self.ctx
    }

    /// Stage I. Prompts already written by an earlier pass are reused as-is.
    pub fn synthesize(&self) -> Result<SynthesisOutcome> {
        let prompts_path = self.ctx.run_dir.join(PROMPTS_FILE);
        if prompts_path.exists() {
            let outcome = SynthesisOutcome {
                prompts: self.ctx.prompts()?,
                rejections: self.ctx.rejections()?,
            };
            info!(prompts = outcome.prompts.len(), "Reusing Stage I prompts");
            return Ok(outcome);
        }

        let outcome = synthesize_prompts(&self.ctx.config)?;
        // prompts.jsonl marks Stage I complete, so it goes last.
        atomic_write_jsonl(&self.ctx.run_dir.join(REJECTIONS_FILE), &outcome.rejections)?;
        atomic_write_jsonl(&prompts_path, &outcome.prompts)?;
        Ok(outcome)
    }

    fn sources(&self) -> Result<SourcePool> {
        match self.ctx.config.run.mode {
            Mode::T2i => Ok(SourcePool::default()),
            Mode::I2i => {
                let pool = SourcePool::for_run(&self.ctx.config.run)?;
                if pool.is_empty() {
                    return Err(ConfigError::Invalid {
                        message: "i2i mode needs at least one source image".into(),
                    }
                    .into());
                }
                Ok(pool)
            }
        }
    }

    /// Every (prompt, source, backend, seed) combination, in a stable order.
    fn jobs(&self, prompts: &[Prompt], sources: &SourcePool) -> Vec<DispatchJob> {
        let run = &self.ctx.config.run;
        let sources: Vec<Option<Arc<_>>> = match run.mode {
            Mode::T2i => vec![None],
            Mode::I2i => sources
                .images()
                .iter()
                .map(|s| Some(Arc::new(s.clone())))
                .collect(),
        };
        let mut jobs = Vec::with_capacity(
            prompts.len() * sources.len() * run.backends.len() * run.sample_count,
        );
        for prompt in prompts {
            let prompt = Arc::new(prompt.clone());
            for source in &sources {
                for backend in &run.backends {
                    for i in 0..run.sample_count as u64 {
                        jobs.push(DispatchJob {
                            prompt: Arc::clone(&prompt),
                            source: source.clone(),
                            backend: backend.clone(),
                            seed: run.seed.wrapping_add(i),
                        });
                    }
                }
            }
        }
        jobs
    }

    /// Stages I to III. Stops between records once the token fires.
    pub async fn run(&self) -> Result<RunSummary> {
        let mut summary = RunSummary::default();
        let outcome = self.synthesize()?;
        summary.prompts = outcome.prompts.len();
        summary.rejections = outcome.rejections.len();

        let sources = self.sources()?;
        let jobs = self.jobs(&outcome.prompts, &sources);
        info!(jobs = jobs.len(), "Stage II dispatch starting");
        let dispatcher = Dispatcher::new(
            Arc::clone(&self.ctx.store),
            self.ctx.run_dir.clone(),
            self.ctx.config.dispatch.retry.clone(),
            self.ctx.config.run.mode,
            self.ctx.cancel.clone(),
        );
        summary.dispatch = dispatcher
            .dispatch_all(jobs, &self.backends, &self.ctx.config)
            .await?;

        if !self.ctx.cancel.is_cancelled() {
            let (evaluated, skipped) = self.evaluate(&outcome.prompts, &sources).await?;
            summary.evaluated = evaluated;
            summary.evaluations_skipped = skipped;
        }
        summary.cancelled = self.ctx.cancel.is_cancelled();
        Ok(summary)
    }

    /// Stage IV over the run directory.
    pub fn finalize(&self) -> Result<StatisticalReport> {
        self.ctx.finalize()
    }

    /// `run` then `finalize`. A cancelled run is left resumable and reported as
    /// [`AuditError::Cancelled`].
    pub async fn execute(&self) -> Result<(RunSummary, StatisticalReport)> {
        let summary = self.run().await?;
        if summary.cancelled {
            info!(run_id = %self.ctx.run_id, "Run cancelled; resume with the same run id");
            return Err(AuditError::Cancelled);
        }
        let report = self.finalize()?;
        Ok((summary, report))
    }

    fn ensemble(&self) -> std::result::Result<EnsembleEvaluator, JudgeError> {
        let config = &self.ctx.config;
        let judges = config
            .ensemble
            .evaluators
            .iter()
            .map(|e| {
                let judge = self.judges.get(&e.name)?;
                let bounded = BoundedJudge::new(judge, config.evaluator_concurrency(&e.name));
                Ok(Arc::new(bounded) as Arc<dyn Judge>)
            })
            .collect::<std::result::Result<Vec<_>, JudgeError>>()?;
        Ok(EnsembleEvaluator::new(judges, &config.ensemble))
    }

    /// Stage III over every terminal successful generation not yet evaluated.
    ///
    /// Returns `(evaluated, skipped)`.
    async fn evaluate(&self, prompts: &[Prompt], sources: &SourcePool) -> Result<(usize, usize)> {
        let config = &self.ctx.config;
        let detector = Arc::new(RefusalDetector::from_config(&config.refusal)?);
        let ensemble = Arc::new(self.ensemble()?);
        let prompts: HashMap<&str, Arc<Prompt>> = prompts
            .iter()
            .map(|p| (p.prompt_id.as_str(), Arc::new(p.clone())))
            .collect();
        let source_bytes: HashMap<&str, Arc<[u8]>> = sources
            .images()
            .iter()
            .map(|s| (s.id.as_str(), Arc::clone(&s.bytes)))
            .collect();

        let workers = config
            .ensemble
            .evaluators
            .iter()
            .map(|e| config.evaluator_concurrency(&e.name))
            .max()
            .unwrap_or(1);
        let pool = Arc::new(Semaphore::new(workers));
        let mut tasks = JoinSet::new();
        let mut skipped = 0;

        for generation in self.ctx.store.generations() {
            if generation.status != GenerationStatus::Success {
                continue;
            }
            if self.ctx.store.has_evaluation(&generation.key) {
                skipped += 1;
                continue;
            }
            let Some(prompt) = prompts.get(generation.key.prompt_id.as_str()).cloned() else {
                warn!(key = %generation.key, "Generation has no known prompt; not evaluated");
                continue;
            };
            let source = match generation.mode {
                Mode::T2i => None,
                Mode::I2i => source_bytes
                    .get(generation.key.source_image_id.as_str())
                    .cloned(),
            };

            let pool = Arc::clone(&pool);
            let detector = Arc::clone(&detector);
            let ensemble = Arc::clone(&ensemble);
            let store = Arc::clone(&self.ctx.store);
            let cancel = self.ctx.cancel.clone();
            let run_dir = self.ctx.run_dir.clone();
            tasks.spawn(async move {
                let Ok(_permit) = pool.acquire_owned().await else {
                    return Ok(false);
                };
                if cancel.is_cancelled() {
                    return Ok(false);
                }
                let record = evaluate_generation(
                    &generation,
                    &prompt,
                    source,
                    &run_dir,
                    &detector,
                    &ensemble,
                )
                .await;
                match store.put_evaluation(record) {
                    Ok(()) => Ok(true),
                    Err(StoreError::VerdictImmutable { .. }) => {
                        debug!(key = %generation.key, "Evaluation already stored");
                        Ok(false)
                    }
                    Err(e) => Err(e),
                }
            });
        }

        let mut evaluated = 0;
        while let Some(joined) = tasks.join_next().await {
            let result = joined.map_err(|e| {
                AuditError::Io(std::io::Error::other(format!("evaluation task failed: {e}")))
            })?;
            match result {
                Ok(true) => evaluated += 1,
                Ok(false) => {}
                Err(e) => {
                    tasks.abort_all();
                    return Err(e.into());
                }
            }
        }
        info!(
            evaluated,
            skipped,
            cancelled = self.ctx.cancel.is_cancelled(),
            "Stage III evaluation finished"
        );
        Ok((evaluated, skipped))
    }
}

/// Detect refusal, then score non-refused outputs with the ensemble.
async fn evaluate_generation(
    generation: &GenerationRecord,
    prompt: &Prompt,
    source: Option<Arc<[u8]>>,
    run_dir: &Path,
    detector: &RefusalDetector,
    ensemble: &EnsembleEvaluator,
) -> EvaluationRecord {
    let output: Option<Arc<[u8]>> = match &generation.artifact {
        Some(relative) => match tokio::fs::read(run_dir.join(relative)).await {
            Ok(bytes) => Some(Arc::from(bytes)),
            Err(e) => {
                warn!(
                    key = %generation.key,
                    error = %e,
                    "Artifact unreadable; treating output as undecodable"
                );
                None
            }
        },
        None => None,
    };

    let outcome = generation.outcome.unwrap_or(BackendOutcome::Edited);
    let signals = detector.assess(source.as_deref(), output.as_deref(), outcome);
    let cause = signals.cause(detector.thresholds());
    let verdict = match (cause, output) {
        (None, Some(output)) => Some(
            ensemble
                .evaluate(&generation.key, source, output, prompt)
                .await,
        ),
        _ => None,
    };
    if let Some(cause) = cause {
        debug!(key = %generation.key, cause = cause.as_str(), "Hard refusal");
    }

    EvaluationRecord {
        key: generation.key.clone(),
        is_hard_refusal: cause.is_some(),
        refusal_cause: cause,
        signals,
        verdict,
        evaluated_at: Utc::now(),
    }
}
