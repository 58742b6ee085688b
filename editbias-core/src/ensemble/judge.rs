//! Vision-language judge capability.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;

use crate::error::JudgeError;
use crate::types::RecordKey;

/// One structured question about an edited image.
#[derive(Debug, Clone)]
pub struct JudgeRequest {
    /// Correlates the call with its record; judges must not use it for scoring.
    pub key: RecordKey,
    pub source_image: Option<Arc<[u8]>>,
    pub output_image: Arc<[u8]>,
    /// Question schema shared by every judge for this record.
    pub question: serde_json::Value,
}

/// An independent evaluator.
#[async_trait]
pub trait Judge: Send + Sync {
    fn name(&self) -> &str;

    /// Answer the question schema with a JSON object keyed by dimension name.
    async fn judge(&self, request: JudgeRequest) -> Result<serde_json::Value, JudgeError>;
}

/// Judges keyed by name.
#[derive(Default, Clone)]
pub struct JudgeRegistry {
    judges: HashMap<String, Arc<dyn Judge>>,
}

impl JudgeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, judge: Arc<dyn Judge>) {
        self.judges.insert(judge.name().to_string(), judge);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Judge>, JudgeError> {
        self.judges
            .get(name)
            .cloned()
            .ok_or_else(|| JudgeError::NotRegistered {
                name: name.to_string(),
            })
    }

    /// Add every judge of `other`, replacing same-named entries.
    pub fn extend(&mut self, other: JudgeRegistry) {
        self.judges.extend(other.judges);
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.judges.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.judges.is_empty()
    }
}

/// A judge whose concurrent calls are capped by a shared semaphore.
pub struct BoundedJudge {
    inner: Arc<dyn Judge>,
    permits: Arc<Semaphore>,
}

impl BoundedJudge {
    pub fn new(inner: Arc<dyn Judge>, max_concurrency: usize) -> Self {
        Self {
            inner,
            permits: Arc::new(Semaphore::new(max_concurrency.max(1))),
        }
    }
}

#[async_trait]
impl Judge for BoundedJudge {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn judge(&self, request: JudgeRequest) -> Result<serde_json::Value, JudgeError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| JudgeError::Request {
                name: self.inner.name().to_string(),
                message: "concurrency pool closed".into(),
            })?;
        self.inner.judge(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::ScriptedJudge;
    use crate::types::RecordKey;
    use std::time::Duration;

    fn request() -> JudgeRequest {
        JudgeRequest {
            key: RecordKey::new("b1::neutral", None, "mock", 0),
            source_image: None,
            output_image: Arc::from(vec![0u8; 4]),
            question: serde_json::json!({}),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_judge_serializes_calls() {
        let inner = Arc::new(ScriptedJudge::new("judge-a"));
        inner.delay(Duration::from_secs(1));
        let bounded = Arc::new(BoundedJudge::new(inner.clone(), 1));
        assert_eq!(bounded.name(), "judge-a");

        let started = tokio::time::Instant::now();
        let (a, b) = tokio::join!(bounded.judge(request()), bounded.judge(request()));
        assert!(a.is_ok() && b.is_ok());
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert_eq!(inner.calls(), 2);
    }

    #[test]
    fn test_registry_lookup() {
        let mut registry = JudgeRegistry::new();
        assert!(registry.is_empty());
        registry.register(Arc::new(ScriptedJudge::new("judge-b")));
        registry.register(Arc::new(ScriptedJudge::new("judge-a")));
        assert_eq!(registry.names(), vec!["judge-a", "judge-b"]);
        assert!(matches!(
            registry.get("missing"),
            Err(JudgeError::NotRegistered { .. })
        ));
    }
}
