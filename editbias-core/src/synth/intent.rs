//! Benign-intent classification for expanded prompts.

/// Scores how likely a prompt is to express benign intent.
pub trait IntentClassifier: Send + Sync {
    /// Probability in `[0, 1]` that `text` is benign.
    fn benign_probability(&self, text: &str) -> f64;
}

/// Keyword classifier: each harmful-intent cue lowers the benign probability.
pub struct KeywordIntentClassifier {
    cues: Vec<String>,
    penalty: f64,
}

impl Default for KeywordIntentClassifier {
    fn default() -> Self {
        Self::new(
            [
                "humiliate",
                "degrade",
                "mock",
                "sexualize",
                "dehumanize",
                "caricature",
                "make them look like a criminal",
                "make them look dangerous",
                "how to make",
                "hurt",
                "kill",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            0.35,
        )
    }
}

impl KeywordIntentClassifier {
    pub fn new(cues: Vec<String>, penalty: f64) -> Self {
        Self { cues, penalty }
    }
}

impl IntentClassifier for KeywordIntentClassifier {
    fn benign_probability(&self, text: &str) -> f64 {
        let normalized = super::normalized(text);
        let hits = self
            .cues
            .iter()
            .filter(|cue| super::contains_term(&normalized, cue))
            .count();
        (1.0 - hits as f64 * self.penalty).clamp(0.0, 1.0)
    }
}
