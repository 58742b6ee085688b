//! Image-editing backend capability.
//!
//! Concrete models live outside the crate. The pipeline only sees the
//! [`EditBackend`] trait and looks implementations up by name in a
//! [`BackendRegistry`].

pub mod http;
pub mod retry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::{AdapterKind, AuditConfig};
use crate::error::{BackendError, ConfigError};
use crate::ensemble::judge::JudgeRegistry;
use crate::types::RecordKey;

pub use http::{HttpEditBackend, HttpJudge};
pub use retry::{Attempt, RetryOutcome, retry_bounded};

/// One edit (image-to-image) or generation (text-to-image) request.
#[derive(Debug, Clone)]
pub struct EditRequest {
    /// Correlates the call with its record.
    pub key: RecordKey,
    pub instruction: String,
    /// Absent in text-to-image mode.
    pub source_image: Option<Arc<[u8]>>,
    pub seed: u64,
}

/// What the backend reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EditStatus {
    Success,
    Refused,
    Error,
}

/// A completed backend call. `Refused` and `Error` are model answers, not
/// transport failures.
#[derive(Debug, Clone)]
pub struct EditResponse {
    pub image: Option<Vec<u8>>,
    pub status: EditStatus,
    pub message: Option<String>,
}

impl EditResponse {
    pub fn success(image: Vec<u8>) -> Self {
        Self {
            image: Some(image),
            status: EditStatus::Success,
            message: None,
        }
    }

    pub fn refused(message: impl Into<String>) -> Self {
        Self {
            image: None,
            status: EditStatus::Refused,
            message: Some(message.into()),
        }
    }
}

/// An image-editing model.
#[async_trait]
pub trait EditBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn edit(&self, request: EditRequest) -> Result<EditResponse, BackendError>;
}

/// Backends keyed by name.
#[derive(Default, Clone)]
pub struct BackendRegistry {
    backends: HashMap<String, Arc<dyn EditBackend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, backend: Arc<dyn EditBackend>) {
        self.backends.insert(backend.name().to_string(), backend);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn EditBackend>, BackendError> {
        self.backends
            .get(name)
            .cloned()
            .ok_or_else(|| BackendError::NotRegistered {
                name: name.to_string(),
            })
    }

    /// Add every backend of `other`, replacing same-named entries.
    pub fn extend(&mut self, other: BackendRegistry) {
        self.backends.extend(other.backends);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.backends.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.backends.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Build HTTP adapters for every `http` entry in the configuration.
///
/// `external` entries are left for the caller to register.
pub fn registries_from_config(
    config: &AuditConfig,
) -> Result<(BackendRegistry, JudgeRegistry), ConfigError> {
    let timeout = config.dispatch.request_timeout_secs;
    let mut backends = BackendRegistry::new();
    for entry in config.backends.iter().filter(|b| b.kind == AdapterKind::Http) {
        backends.register(Arc::new(HttpEditBackend::from_config(entry, timeout)?));
    }

    let mut judges = JudgeRegistry::new();
    for entry in config
        .ensemble
        .evaluators
        .iter()
        .filter(|e| e.kind == AdapterKind::Http)
    {
        let judge = HttpJudge::from_config(entry, config.ensemble.call_timeout_secs)?;
        judges.register(Arc::new(judge));
    }
    Ok((backends, judges))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::ScriptedBackend;

    #[test]
    fn test_registry_lookup() {
        let mut registry = BackendRegistry::new();
        registry.register(Arc::new(ScriptedBackend::new("mock")));
        assert!(registry.contains("mock"));
        assert_eq!(registry.names(), vec!["mock"]);
        assert!(matches!(
            registry.get("other"),
            Err(BackendError::NotRegistered { .. })
        ));
    }

    #[test]
    fn test_external_entries_not_built() {
        let mut config = AuditConfig::default();
        config.backends.push(crate::config::BackendConfig {
            name: "in-process".into(),
            kind: AdapterKind::External,
            endpoint: None,
            api_key_env: None,
            model: None,
            max_concurrency: None,
        });
        let (backends, judges) = registries_from_config(&config).unwrap();
        assert!(!backends.contains("in-process"));
        assert!(judges.is_empty());
    }
}
