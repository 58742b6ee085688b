//! Human-review queue sampling.

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::types::{EvaluationRecord, RecordKey};

/// Why a record is in the review queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleReason {
    /// The ensemble flagged it.
    Flagged,
    /// Randomly drawn from agreeing records to measure the baseline.
    Baseline,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewItem {
    pub key: RecordKey,
    pub sampled_because: SampleReason,
    pub review_reasons: Vec<String>,
}

/// Every flagged record, plus a seeded `fraction` of the rest.
///
/// Refused records carry no verdict and are never sampled.
pub fn sample_review_queue(
    evaluations: &[EvaluationRecord],
    fraction: f64,
    seed: u64,
) -> Vec<ReviewItem> {
    let mut scored: Vec<&EvaluationRecord> =
        evaluations.iter().filter(|e| e.verdict.is_some()).collect();
    scored.sort_by(|a, b| a.key.cmp(&b.key));

    let (flagged, mut rest): (Vec<_>, Vec<_>) =
        scored.into_iter().partition(|e| e.needs_review());

    let mut queue: Vec<ReviewItem> = flagged
        .into_iter()
        .map(|e| ReviewItem {
            key: e.key.clone(),
            sampled_because: SampleReason::Flagged,
            review_reasons: e
                .verdict
                .as_ref()
                .map(|v| v.review_reasons.clone())
                .unwrap_or_default(),
        })
        .collect();

    let take = (rest.len() as f64 * fraction.clamp(0.0, 1.0)).round() as usize;
    let mut rng = StdRng::seed_from_u64(seed);
    rest.shuffle(&mut rng);
    let mut baseline: Vec<&EvaluationRecord> = rest.into_iter().take(take).collect();
    baseline.sort_by(|a, b| a.key.cmp(&b.key));
    queue.extend(baseline.into_iter().map(|e| ReviewItem {
        key: e.key.clone(),
        sampled_because: SampleReason::Baseline,
        review_reasons: Vec::new(),
    }));

    queue
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ensemble::EnsembleVerdict;
    use crate::refusal::RefusalSignals;
    use std::collections::BTreeMap;

    fn record(prompt: &str, flagged: Option<bool>) -> EvaluationRecord {
        EvaluationRecord {
            key: RecordKey::new(prompt, Some("img"), "mock", 0),
            is_hard_refusal: flagged.is_none(),
            refusal_cause: None,
            signals: RefusalSignals::default(),
            verdict: flagged.map(|needs_review| EnsembleVerdict {
                dimensions: BTreeMap::new(),
                raw_responses: Vec::new(),
                needs_review,
                review_reasons: if needs_review {
                    vec!["identity_drift needs review".into()]
                } else {
                    Vec::new()
                },
                responding_evaluators: Vec::new(),
            }),
            evaluated_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn test_flagged_always_sampled_and_baseline_seeded() {
        let mut records = vec![record("p0", Some(true)), record("refused", None)];
        records.extend((1..=20).map(|i| record(&format!("p{i}"), Some(false))));

        let queue = sample_review_queue(&records, 0.1, 42);
        assert_eq!(queue.len(), 3);
        assert_eq!(queue[0].key.prompt_id, "p0");
        assert_eq!(queue[0].sampled_because, SampleReason::Flagged);
        assert!(
            queue[1..]
                .iter()
                .all(|i| i.sampled_because == SampleReason::Baseline)
        );
        assert!(queue.iter().all(|i| i.key.prompt_id != "refused"));

        assert_eq!(queue, sample_review_queue(&records, 0.1, 42));
    }

    #[test]
    fn test_zero_fraction_only_flagged() {
        let records = vec![record("a", Some(false)), record("b", Some(true))];
        let queue = sample_review_queue(&records, 0.0, 1);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].key.prompt_id, "b");
    }
}
