//! Core data model for the audit pipeline.
//!
//! Records flow strictly forward: `Prompt` → `GenerationRecord` →
//! `EvaluationRecord`, each keyed by a [`RecordKey`]. Statistics only ever read
//! them through [`ObservedRecord`] joins.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use crate::ensemble::EnsembleVerdict;
use crate::refusal::{RefusalCause, RefusalSignals};

/// Attribute value label used for the control variant of every base prompt.
pub const NEUTRAL: &str = "neutral";

/// Source image id written into keys for text-to-image records.
pub const NO_SOURCE: &str = "-";

/// A base scenario before rephrasing and attribute expansion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BasePrompt {
    pub id: String,
    pub text: String,
    /// Safety domain tag (`medical`, `violence`, ...).
    pub domain: String,
    /// Prompt category used for disparity grouping.
    pub category: String,
    #[serde(default = "default_true")]
    pub benign: bool,
    /// Attribute values that are stereotype-congruent for this scenario.
    #[serde(default)]
    pub congruent_values: Vec<String>,
}

fn default_true() -> bool {
    true
}

/// One value on an attribute axis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeValue {
    pub value: String,
    /// Text inserted into the prompt. Defaults to `value`.
    #[serde(default)]
    pub marker: Option<String>,
}

impl AttributeValue {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            marker: None,
        }
    }

    pub fn with_marker(value: impl Into<String>, marker: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            marker: Some(marker.into()),
        }
    }

    pub fn marker(&self) -> &str {
        self.marker.as_deref().unwrap_or(&self.value)
    }
}

/// A demographic axis (race, gender, age, culture, disability, religion).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeAxis {
    pub name: String,
    pub values: Vec<AttributeValue>,
}

/// The set of axes and values to expand every base prompt over.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttributeTaxonomy {
    pub axes: Vec<AttributeAxis>,
}

impl AttributeTaxonomy {
    /// Keep only the named axes. An empty filter keeps everything.
    pub fn restricted_to(&self, include: &[String]) -> AttributeTaxonomy {
        if include.is_empty() {
            return self.clone();
        }
        AttributeTaxonomy {
            axes: self
                .axes
                .iter()
                .filter(|a| include.iter().any(|name| name == &a.name))
                .cloned()
                .collect(),
        }
    }

    /// Number of variants each base prompt must produce, neutral included.
    pub fn variants_per_base(&self) -> usize {
        self.axes.iter().map(|a| a.values.len()).sum::<usize>() + 1
    }

    /// A small taxonomy covering the six audited axes.
    pub fn builtin() -> Self {
        let axis = |name: &str, values: &[&str]| AttributeAxis {
            name: name.to_string(),
            values: values.iter().map(|v| AttributeValue::new(*v)).collect(),
        };
        Self {
            axes: vec![
                axis("race", &["Black", "White", "East Asian", "South Asian"]),
                axis("gender", &["female", "male", "nonbinary"]),
                axis("age", &["young", "middle-aged", "elderly"]),
                axis("culture", &["Nigerian", "Korean", "Mexican", "Norwegian"]),
                AttributeAxis {
                    name: "disability".into(),
                    values: vec![
                        AttributeValue::with_marker("wheelchair", "wheelchair-using"),
                        AttributeValue::with_marker("blind", "blind"),
                    ],
                },
                axis("religion", &["Muslim", "Christian", "Hindu", "Jewish"]),
            ],
        }
    }
}

/// Reference to the single attribute a prompt variant carries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttributeRef {
    pub axis: String,
    pub value: String,
}

/// Whether a variant's attribute matches the stereotype expected for its scenario.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Congruence {
    Baseline,
    Congruent,
    Incongruent,
}

/// A validated, immutable prompt variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prompt {
    pub prompt_id: String,
    pub base_id: String,
    pub category: String,
    pub domain: String,
    pub benign: bool,
    pub attribute: Option<AttributeRef>,
    pub congruence: Congruence,
    pub rephrased_text: String,
    pub expanded_text: String,
    /// The marker was appended as a clause because no person/role noun was found.
    #[serde(default)]
    pub fallback_clause: bool,
}

impl Prompt {
    pub fn is_neutral(&self) -> bool {
        self.attribute.is_none()
    }

    pub fn axis(&self) -> Option<&str> {
        self.attribute.as_ref().map(|a| a.axis.as_str())
    }

    /// The attribute value, or [`NEUTRAL`] for the control variant.
    pub fn attribute_value(&self) -> &str {
        self.attribute
            .as_ref()
            .map(|a| a.value.as_str())
            .unwrap_or(NEUTRAL)
    }

    pub fn make_id(base_id: &str, attribute: Option<&AttributeRef>) -> String {
        match attribute {
            Some(attr) => format!("{base_id}::{}={}", attr.axis, attr.value),
            None => format!("{base_id}::{NEUTRAL}"),
        }
    }
}

/// Generation mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Text-to-image: the backend receives the instruction only.
    T2i,
    /// Image-to-image: the backend edits a resolved source image.
    #[default]
    I2i,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::T2i => write!(f, "t2i"),
            Mode::I2i => write!(f, "i2i"),
        }
    }
}

/// Idempotency key shared by every stage's record for one request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey {
    pub prompt_id: String,
    pub source_image_id: String,
    pub backend: String,
    pub seed: u64,
}

impl RecordKey {
    pub fn new(
        prompt_id: impl Into<String>,
        source_image_id: Option<&str>,
        backend: impl Into<String>,
        seed: u64,
    ) -> Self {
        Self {
            prompt_id: prompt_id.into(),
            source_image_id: source_image_id.unwrap_or(NO_SOURCE).to_string(),
            backend: backend.into(),
            seed,
        }
    }

    pub fn has_source(&self) -> bool {
        self.source_image_id != NO_SOURCE
    }

    /// Hex SHA-256 of the key, used for artifact file names.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.to_string().as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|{}|{}",
            self.prompt_id, self.source_image_id, self.backend, self.seed
        )
    }
}

/// Lifecycle status of a generation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationStatus {
    Pending,
    Success,
    Error,
}

/// What the backend said when a call completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendOutcome {
    /// An image was returned.
    Edited,
    /// The model declined the edit.
    Refused,
    /// The model answered with an error or policy-violation signal.
    PolicyError,
}

/// Result of dispatching one prompt + source to one backend with one seed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRecord {
    pub key: RecordKey,
    pub mode: Mode,
    pub status: GenerationStatus,
    pub outcome: Option<BackendOutcome>,
    /// Output image, relative to the run directory.
    pub artifact: Option<PathBuf>,
    /// Source image location, when it lives on disk.
    pub source_path: Option<PathBuf>,
    pub source_group: Option<String>,
    /// Source came from the synthetic fallback rather than a dataset index.
    #[serde(default)]
    pub synthetic_source: bool,
    pub latency_ms: u64,
    pub attempts: u32,
    /// Human-readable status and reason.
    pub status_reason: String,
    #[serde(default)]
    pub backend_message: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl GenerationRecord {
    /// A record for a request that has been issued but not completed.
    pub fn pending(key: RecordKey, mode: Mode) -> Self {
        Self {
            key,
            mode,
            status: GenerationStatus::Pending,
            outcome: None,
            artifact: None,
            source_path: None,
            source_group: None,
            synthetic_source: false,
            latency_ms: 0,
            attempts: 0,
            status_reason: "pending".into(),
            backend_message: None,
            completed_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status != GenerationStatus::Pending
    }
}

/// Stage III output, attached 1:1 to a terminal successful generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationRecord {
    pub key: RecordKey,
    pub is_hard_refusal: bool,
    pub refusal_cause: Option<RefusalCause>,
    /// Raw detector signals, kept so threshold sweeps never re-run detection.
    pub signals: RefusalSignals,
    /// Present only when the record was not refused.
    pub verdict: Option<EnsembleVerdict>,
    pub evaluated_at: DateTime<Utc>,
}

impl EvaluationRecord {
    pub fn needs_review(&self) -> bool {
        self.verdict.as_ref().is_some_and(|v| v.needs_review)
    }
}

/// A read-only join of one prompt, its generation, and its evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct ObservedRecord {
    pub key: RecordKey,
    pub base_id: String,
    pub category: String,
    pub axis: Option<String>,
    pub value: String,
    pub congruence: Congruence,
    pub source_group: Option<String>,
    pub synthetic_source: bool,
    pub status: GenerationStatus,
    pub evaluation: Option<EvaluationRecord>,
}

impl ObservedRecord {
    /// Join records by key. Generations whose prompt is unknown are skipped.
    pub fn join(
        prompts: &[Prompt],
        generations: &[GenerationRecord],
        evaluations: &[EvaluationRecord],
    ) -> Vec<ObservedRecord> {
        let by_prompt: HashMap<&str, &Prompt> =
            prompts.iter().map(|p| (p.prompt_id.as_str(), p)).collect();
        let by_key: HashMap<&RecordKey, &EvaluationRecord> =
            evaluations.iter().map(|e| (&e.key, e)).collect();

        generations
            .iter()
            .filter_map(|generation| {
                let prompt = by_prompt.get(generation.key.prompt_id.as_str())?;
                Some(ObservedRecord {
                    key: generation.key.clone(),
                    base_id: prompt.base_id.clone(),
                    category: prompt.category.clone(),
                    axis: prompt.axis().map(str::to_string),
                    value: prompt.attribute_value().to_string(),
                    congruence: prompt.congruence,
                    source_group: generation.source_group.clone(),
                    synthetic_source: generation.synthetic_source,
                    status: generation.status,
                    evaluation: by_key.get(&generation.key).map(|e| (*e).clone()),
                })
            })
            .collect()
    }

    pub fn is_neutral(&self) -> bool {
        self.value == NEUTRAL
    }

    /// Completed successfully and evaluated: counts toward rates.
    pub fn is_rated(&self) -> bool {
        self.status == GenerationStatus::Success && self.evaluation.is_some()
    }

    pub fn is_refused(&self) -> bool {
        self.evaluation.as_ref().is_some_and(|e| e.is_hard_refusal)
    }
}
