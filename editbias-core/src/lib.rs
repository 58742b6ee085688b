//! # editbias Core
//!
//! Measurement pipeline for auditing image-editing models for
//! attribute-conditioned refusal, erasure, and identity drift.
//!
//! Stage I synthesizes attribute variants of base prompts, Stage II dispatches
//! them to backends, Stage III detects refusals and scores the rest with an
//! evaluator ensemble, and Stage IV turns the joined records into disparity
//! statistics. Every stage checkpoints to the run directory so runs resume.

pub mod backend;
pub mod config;
pub mod dispatch;
pub mod ensemble;
pub mod error;
pub mod mock;
pub mod persistence;
pub mod refusal;
pub mod run;
pub mod stats;
pub mod store;
pub mod synth;
pub mod types;

// Re-export commonly used types at the crate root.
pub use backend::{BackendRegistry, EditBackend, EditRequest, EditResponse, EditStatus};
pub use config::{AuditConfig, load_config};
pub use dispatch::{DispatchJob, DispatchSummary, Dispatcher};
pub use ensemble::judge::{Judge, JudgeRegistry, JudgeRequest};
pub use ensemble::{EnsembleEvaluator, EnsembleVerdict};
pub use error::{AuditError, Result};
pub use refusal::{RefusalCause, RefusalDetector, RefusalSignals, RefusalThresholds};
pub use run::{AuditRun, RunContext, RunSummary, synthesize_prompts};
pub use stats::{StatisticalReport, analyze};
pub use store::CheckpointStore;
pub use synth::{SynthesisOutcome, Synthesizer};
pub use types::{
    AttributeTaxonomy, BasePrompt, EvaluationRecord, GenerationRecord, Mode, ObservedRecord,
    Prompt, RecordKey,
};
