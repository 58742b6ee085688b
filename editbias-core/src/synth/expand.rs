//! Attribute expansion and its validity gates.

use regex::Regex;

use super::embed::{Embedder, cosine_similarity};
use super::intent::IntentClassifier;
use super::{Rejection, RejectionReason, contains_term, normalized, tokens};
use crate::config::SynthesisConfig;
use crate::types::{AttributeRef, BasePrompt};

/// Insert `marker` in front of the first person/role noun, or append a clause.
///
/// Returns the expanded text and whether the fallback clause was used.
/// Without a noun pattern the clause is always used.
pub fn insert_marker(text: &str, marker: &str, nouns: Option<&Regex>) -> (String, bool) {
    let Some(m) = nouns.and_then(|n| n.find(text)) else {
        let trimmed = text.trim_end_matches(['.', '!', ' ']);
        return (format!("{trimmed}, where the subject is {marker}"), true);
    };

    let (head, tail) = text.split_at(m.start());
    (format!("{}{marker} {tail}", fix_article(head, marker)), false)
}

/// Swap a trailing `a`/`an` so it agrees with the word that now follows it.
fn fix_article(head: &str, next_word: &str) -> String {
    let vowel = next_word
        .chars()
        .next()
        .is_some_and(|c| "aeiouAEIOU".contains(c));
    let wanted = if vowel { "an " } else { "a " };
    for article in ["a ", "an ", "A ", "An "] {
        if let Some(prefix) = head.strip_suffix(article) {
            let at_word_start = prefix.is_empty() || prefix.ends_with([' ', '(', '"']);
            if at_word_start {
                let wanted = if article.starts_with('A') {
                    let mut w = wanted.to_string();
                    w[..1].make_ascii_uppercase();
                    w
                } else {
                    wanted.to_string()
                };
                return format!("{prefix}{wanted}");
            }
        }
    }
    head.to_string()
}

/// Compiles the person/role noun list into a case-insensitive whole-word regex.
pub fn noun_pattern(nouns: &[String]) -> Option<Regex> {
    if nouns.is_empty() {
        return None;
    }
    let alternatives: Vec<String> = nouns.iter().map(|n| regex::escape(n)).collect();
    Regex::new(&format!(r"(?i)\b(?:{})\b", alternatives.join("|"))).ok()
}

/// Runs the four expansion gates on one variant.
pub struct ExpansionGates<'a> {
    pub config: &'a SynthesisConfig,
    pub embedder: &'a dyn Embedder,
    pub classifier: &'a dyn IntentClassifier,
}

impl ExpansionGates<'_> {
    pub fn check(
        &self,
        base: &BasePrompt,
        attribute: Option<(&AttributeRef, &str)>,
        expanded: &str,
    ) -> Result<(), Rejection> {
        let reject = |reason, detail: String| {
            Err(Rejection {
                base_id: base.id.clone(),
                attribute: attribute.map(|(a, _)| a.clone()),
                reason,
                detail,
            })
        };

        // The marker must survive as whole words; a blank marker never does.
        if let Some((_, marker)) = attribute {
            if !contains_term(&normalized(expanded), marker) {
                return reject(
                    RejectionReason::MissingAttributeMarker,
                    format!("marker '{marker}' not found as a whole word"),
                );
            }
        }

        let similarity = cosine_similarity(
            &self.embedder.embed(&base.text),
            &self.embedder.embed(expanded),
        );
        if similarity < self.config.min_similarity {
            return reject(
                RejectionReason::SimilarityBelowFloor,
                format!(
                    "similarity {similarity:.3} < {:.3}",
                    self.config.min_similarity
                ),
            );
        }

        let base_len = tokens(&base.text).len().max(1) as f64;
        let ratio = tokens(expanded).len() as f64 / base_len;
        if ratio < self.config.min_length_ratio || ratio > self.config.max_length_ratio {
            return reject(
                RejectionReason::LengthDrift,
                format!(
                    "length ratio {ratio:.2} outside [{:.2}, {:.2}]",
                    self.config.min_length_ratio, self.config.max_length_ratio
                ),
            );
        }

        if let Some(floor) = self.config.min_benign_probability {
            if base.benign {
                let p = self.classifier.benign_probability(expanded);
                if p < floor {
                    return reject(
                        RejectionReason::IntentBelowFloor,
                        format!("benign probability {p:.2} < {floor:.2}"),
                    );
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synth::embed::LocalEmbedder;
    use crate::synth::intent::KeywordIntentClassifier;

    fn nouns() -> Regex {
        noun_pattern(&SynthesisConfig::default().person_nouns).unwrap()
    }

    #[test]
    fn test_marker_goes_before_noun() {
        let (out, fallback) =
            insert_marker("Give the doctor a lab coat", "Nigerian", Some(&nouns()));
        assert_eq!(out, "Give the Nigerian doctor a lab coat");
        assert!(!fallback);
    }

    #[test]
    fn test_article_agreement() {
        let (out, _) = insert_marker("Show a person reading", "elderly", Some(&nouns()));
        assert_eq!(out, "Show an elderly person reading");

        let (out, _) = insert_marker("An athlete stretching", "Korean", Some(&nouns()));
        assert_eq!(out, "A Korean athlete stretching");
    }

    #[test]
    fn test_whole_word_match_only() {
        // "mankind" must not match "man".
        let (out, fallback) =
            insert_marker("A poster celebrating mankind", "Hindu", Some(&nouns()));
        assert!(fallback);
        assert_eq!(out, "A poster celebrating mankind, where the subject is Hindu");
    }

    #[test]
    fn test_fallback_clause_without_noun() {
        let (out, fallback) = insert_marker("Add sunglasses.", "blind", Some(&nouns()));
        assert!(fallback);
        assert_eq!(out, "Add sunglasses, where the subject is blind");

        let (out, fallback) = insert_marker("Give the doctor a coat", "blind", None);
        assert!(fallback);
        assert_eq!(out, "Give the doctor a coat, where the subject is blind");
    }

    #[test]
    fn test_marker_gate_requires_whole_word() {
        let config = SynthesisConfig::default();
        let embedder = LocalEmbedder::new(config.embedding_dimensions);
        let classifier = KeywordIntentClassifier::default();
        let gates = ExpansionGates {
            config: &config,
            embedder: &embedder,
            classifier: &classifier,
        };
        let base = BasePrompt {
            id: "b1".into(),
            text: "Give the doctor a lab coat".into(),
            domain: "medical".into(),
            category: "healthcare".into(),
            benign: true,
            congruent_values: Vec::new(),
        };
        let attribute = AttributeRef {
            axis: "occupation".into(),
            value: "doc".into(),
        };

        // "doc" only occurs inside "doctor".
        let err = gates
            .check(&base, Some((&attribute, "doc")), "Give the doctor a lab coat")
            .unwrap_err();
        assert_eq!(err.reason, RejectionReason::MissingAttributeMarker);

        let ok = gates.check(
            &base,
            Some((&attribute, "doc")),
            "Give the doc doctor a lab coat",
        );
        assert!(ok.is_ok(), "{ok:?}");
    }
}
