//! Stage I: prompt synthesis.
//!
//! Base scenarios are deduplicated, rephrased toward their safety domain, then
//! expanded once per attribute value plus a neutral control. Every variant runs
//! through the validity gates; a base prompt that loses any variant is excluded
//! whole and reported as `incomplete_coverage`.

pub mod dedup;
pub mod embed;
pub mod expand;
pub mod intent;
pub mod rephrase;

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use tracing::{debug, info, warn};

use crate::config::SynthesisConfig;
use crate::error::ConfigError;
use crate::types::{AttributeRef, AttributeTaxonomy, BasePrompt, Congruence, Prompt};
use dedup::NearDuplicateIndex;
use embed::{Embedder, LocalEmbedder};
use expand::{ExpansionGates, insert_marker, noun_pattern};
use intent::{IntentClassifier, KeywordIntentClassifier};

/// Lowercased alphanumeric word tokens.
pub(crate) fn tokens(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Tokens joined by single spaces and padded, for whole-word containment checks.
pub(crate) fn normalized(text: &str) -> String {
    format!(" {} ", tokens(text).join(" "))
}

/// Whether `term` (a word or phrase) occurs in `normalized` on word boundaries.
pub(crate) fn contains_term(normalized: &str, term: &str) -> bool {
    let needle = tokens(term).join(" ");
    !needle.is_empty() && normalized.contains(&format!(" {needle} "))
}

/// Why a base prompt or variant was discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    DuplicateBase,
    MissingDomainTrigger,
    CrossDomainContamination,
    MissingAttributeMarker,
    SimilarityBelowFloor,
    LengthDrift,
    IntentBelowFloor,
    IncompleteCoverage,
    InvalidBase,
}

impl RejectionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectionReason::DuplicateBase => "duplicate_base",
            RejectionReason::MissingDomainTrigger => "missing_domain_trigger",
            RejectionReason::CrossDomainContamination => "cross_domain_contamination",
            RejectionReason::MissingAttributeMarker => "missing_attribute_marker",
            RejectionReason::SimilarityBelowFloor => "similarity_below_floor",
            RejectionReason::LengthDrift => "length_drift",
            RejectionReason::IntentBelowFloor => "intent_below_floor",
            RejectionReason::IncompleteCoverage => "incomplete_coverage",
            RejectionReason::InvalidBase => "invalid_base",
        }
    }
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An audit-log entry for a discarded base prompt or variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rejection {
    pub base_id: String,
    /// The variant that failed; `None` for base-level rejections.
    pub attribute: Option<AttributeRef>,
    pub reason: RejectionReason,
    pub detail: String,
}

impl Rejection {
    pub fn base(base_id: &str, reason: RejectionReason, detail: impl Into<String>) -> Self {
        Self {
            base_id: base_id.to_string(),
            attribute: None,
            reason,
            detail: detail.into(),
        }
    }
}

/// Accepted prompts in insertion order, plus every rejection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SynthesisOutcome {
    pub prompts: Vec<Prompt>,
    pub rejections: Vec<Rejection>,
}

impl SynthesisOutcome {
    pub fn rejection_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for r in &self.rejections {
            *counts.entry(r.reason.as_str().to_string()).or_insert(0) += 1;
        }
        counts
    }

    pub fn accepted_bases(&self) -> usize {
        self.prompts
            .iter()
            .map(|p| p.base_id.as_str())
            .collect::<HashSet<_>>()
            .len()
    }
}

/// Builds and validates attribute-conditioned prompt variants.
pub struct Synthesizer {
    config: SynthesisConfig,
    embedder: Box<dyn Embedder>,
    classifier: Box<dyn IntentClassifier>,
    nouns: Option<Regex>,
}

impl Synthesizer {
    /// Synthesizer with the local embedder and keyword intent classifier.
    pub fn new(config: SynthesisConfig) -> Self {
        let embedder = Box::new(LocalEmbedder::new(config.embedding_dimensions));
        Self::with_components(config, embedder, Box::new(KeywordIntentClassifier::default()))
    }

    pub fn with_components(
        config: SynthesisConfig,
        embedder: Box<dyn Embedder>,
        classifier: Box<dyn IntentClassifier>,
    ) -> Self {
        let nouns = noun_pattern(&config.person_nouns);
        if nouns.is_none() {
            warn!("No person nouns configured; every marker uses the fallback clause");
        }
        debug!(
            embedder = embedder.provider_name(),
            dimensions = embedder.dimensions(),
            "Similarity gate embedder ready"
        );
        Self {
            config,
            embedder,
            classifier,
            nouns,
        }
    }

    /// Run rephrasing, expansion, and gating over `bases`.
    ///
    /// Fails only when the taxonomy itself is unusable; per-prompt problems are
    /// reported as rejections.
    pub fn synthesize(
        &self,
        bases: &[BasePrompt],
        taxonomy: &AttributeTaxonomy,
    ) -> Result<SynthesisOutcome, ConfigError> {
        validate_taxonomy(taxonomy)?;

        let mut outcome = SynthesisOutcome::default();
        let mut seen_ids = HashSet::new();
        let mut index = NearDuplicateIndex::new(self.config.dedup_max_hamming);

        for base in bases {
            if base.id.trim().is_empty() || base.text.trim().is_empty() {
                outcome.rejections.push(Rejection::base(
                    &base.id,
                    RejectionReason::InvalidBase,
                    "empty id or text",
                ));
                continue;
            }
            if !seen_ids.insert(base.id.as_str()) {
                outcome.rejections.push(Rejection::base(
                    &base.id,
                    RejectionReason::InvalidBase,
                    "duplicate base id",
                ));
                continue;
            }
            if let Some(earlier) = index.insert(&base.id, &base.text) {
                debug!(base_id = %base.id, duplicate_of = %earlier, "Near-duplicate base prompt");
                outcome.rejections.push(Rejection::base(
                    &base.id,
                    RejectionReason::DuplicateBase,
                    format!("near-duplicate of {earlier}"),
                ));
                continue;
            }

            match self.expand_base(base, taxonomy) {
                Ok(prompts) => outcome.prompts.extend(prompts),
                Err(rejections) => {
                    for r in &rejections {
                        debug!(
                            base_id = %r.base_id,
                            reason = %r.reason,
                            detail = %r.detail,
                            "Prompt rejected"
                        );
                    }
                    outcome.rejections.extend(rejections);
                }
            }
        }

        info!(
            bases = bases.len(),
            accepted_bases = outcome.accepted_bases(),
            prompts = outcome.prompts.len(),
            rejections = outcome.rejections.len(),
            embedder = self.embedder.provider_name(),
            "Prompt synthesis complete"
        );
        Ok(outcome)
    }

    /// All variants of one base, or every reason it lost coverage.
    fn expand_base(
        &self,
        base: &BasePrompt,
        taxonomy: &AttributeTaxonomy,
    ) -> Result<Vec<Prompt>, Vec<Rejection>> {
        let rephrased = rephrase::rephrase(base, &self.config.domains).map_err(|r| vec![r])?;
        let gates = ExpansionGates {
            config: &self.config,
            embedder: self.embedder.as_ref(),
            classifier: self.classifier.as_ref(),
        };

        let mut prompts = Vec::with_capacity(taxonomy.variants_per_base());
        let mut rejections = Vec::new();

        match gates.check(base, None, &rephrased) {
            Ok(()) => prompts.push(self.prompt(base, None, &rephrased, rephrased.clone(), false)),
            Err(r) => rejections.push(r),
        }

        for axis in &taxonomy.axes {
            for value in &axis.values {
                let attribute = AttributeRef {
                    axis: axis.name.clone(),
                    value: value.value.clone(),
                };
                let (expanded, fallback) =
                    insert_marker(&rephrased, value.marker(), self.nouns.as_ref());
                match gates.check(base, Some((&attribute, value.marker())), &expanded) {
                    Ok(()) => prompts.push(self.prompt(
                        base,
                        Some(attribute),
                        &rephrased,
                        expanded,
                        fallback,
                    )),
                    Err(r) => rejections.push(r),
                }
            }
        }

        let expected = taxonomy.variants_per_base();
        if rejections.is_empty() && prompts.len() == expected {
            return Ok(prompts);
        }
        rejections.push(Rejection::base(
            &base.id,
            RejectionReason::IncompleteCoverage,
            format!("{} of {expected} variants passed", prompts.len()),
        ));
        Err(rejections)
    }

    fn prompt(
        &self,
        base: &BasePrompt,
        attribute: Option<AttributeRef>,
        rephrased: &str,
        expanded: String,
        fallback_clause: bool,
    ) -> Prompt {
        let congruence = match &attribute {
            None => Congruence::Baseline,
            Some(a) if base.congruent_values.iter().any(|v| v == &a.value) => {
                Congruence::Congruent
            }
            Some(_) => Congruence::Incongruent,
        };
        Prompt {
            prompt_id: Prompt::make_id(&base.id, attribute.as_ref()),
            base_id: base.id.clone(),
            category: base.category.clone(),
            domain: base.domain.clone(),
            benign: base.benign,
            attribute,
            congruence,
            rephrased_text: rephrased.to_string(),
            expanded_text: expanded,
            fallback_clause,
        }
    }
}

fn validate_taxonomy(taxonomy: &AttributeTaxonomy) -> Result<(), ConfigError> {
    let mut axes = HashSet::new();
    for axis in &taxonomy.axes {
        if !axes.insert(axis.name.as_str()) {
            return Err(ConfigError::Invalid {
                message: format!("attribute axis '{}' listed twice", axis.name),
            });
        }
        if axis.values.is_empty() {
            return Err(ConfigError::Invalid {
                message: format!("attribute axis '{}' has no values", axis.name),
            });
        }
        let mut values = HashSet::new();
        for v in &axis.values {
            if v.value == crate::types::NEUTRAL {
                return Err(ConfigError::Invalid {
                    message: format!("axis '{}' uses the reserved value 'neutral'", axis.name),
                });
            }
            if !values.insert(v.value.as_str()) {
                return Err(ConfigError::Invalid {
                    message: format!("value '{}' listed twice on axis '{}'", v.value, axis.name),
                });
            }
        }
    }
    Ok(())
}
