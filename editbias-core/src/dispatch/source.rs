//! Source images for image-to-image mode.
//!
//! Sources come from a dataset index (`[{ "id", "path", "group" }]`, paths
//! relative to the index file) or, when none is configured, from a set of
//! generated gradients that every record flags as `synthetic_source`.

use image::{Rgb, RgbImage};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::RunConfig;
use crate::error::ConfigError;
use crate::refusal::perceptual::encode_png;

/// Group label carried by synthetic sources.
pub const SYNTHETIC_GROUP: &str = "synthetic";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexEntry {
    id: String,
    path: PathBuf,
    #[serde(default)]
    group: Option<String>,
}

/// A resolved source image and its bytes.
#[derive(Debug, Clone)]
pub struct SourceImage {
    pub id: String,
    pub path: Option<PathBuf>,
    /// Demographic group of the depicted subject.
    pub group: Option<String>,
    pub synthetic: bool,
    pub bytes: Arc<[u8]>,
}

/// Every source image a run dispatches against.
#[derive(Debug, Clone, Default)]
pub struct SourcePool {
    images: Vec<SourceImage>,
}

impl SourcePool {
    /// Dataset index when configured, otherwise the synthetic fallback.
    pub fn for_run(run: &RunConfig) -> Result<Self, ConfigError> {
        match &run.dataset_index {
            Some(index) => Self::load(index),
            None => {
                warn!(
                    count = run.synthetic_sources,
                    "No dataset index configured; using synthetic source images"
                );
                Self::synthetic(run.synthetic_sources)
            }
        }
    }

    /// Load a dataset index and read every listed image.
    pub fn load(index: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(index).map_err(|_| ConfigError::FileNotFound {
            path: index.to_path_buf(),
        })?;
        let entries: Vec<IndexEntry> =
            serde_json::from_str(&content).map_err(|e| ConfigError::ParseError {
                message: format!("{}: {e}", index.display()),
            })?;
        let base = index.parent().unwrap_or_else(|| Path::new("."));

        let mut images = Vec::with_capacity(entries.len());
        let mut seen = HashSet::new();
        for entry in entries {
            // The id is part of every record key.
            if !seen.insert(entry.id.clone()) {
                return Err(ConfigError::Invalid {
                    message: format!(
                        "{}: source image id '{}' listed twice",
                        index.display(),
                        entry.id
                    ),
                });
            }
            let path = if entry.path.is_absolute() {
                entry.path
            } else {
                base.join(entry.path)
            };
            let bytes = std::fs::read(&path)
                .map_err(|_| ConfigError::FileNotFound { path: path.clone() })?;
            images.push(SourceImage {
                id: entry.id,
                path: Some(path),
                group: entry.group,
                synthetic: false,
                bytes: Arc::from(bytes),
            });
        }
        info!(index = %index.display(), images = images.len(), "Dataset index loaded");
        Ok(Self { images })
    }

    /// `count` deterministic gradient images, ids `synthetic-<n>`.
    pub fn synthetic(count: usize) -> Result<Self, ConfigError> {
        let images = (0..count)
            .map(|n| {
                let bytes = encode_png(gradient(n as u32)).map_err(|e| ConfigError::Invalid {
                    message: format!("failed to encode synthetic source: {e}"),
                })?;
                Ok(SourceImage {
                    id: format!("synthetic-{n}"),
                    path: None,
                    group: Some(SYNTHETIC_GROUP.to_string()),
                    synthetic: true,
                    bytes: Arc::from(bytes),
                })
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;
        Ok(Self { images })
    }

    pub fn from_images(images: Vec<SourceImage>) -> Self {
        Self { images }
    }

    pub fn images(&self) -> &[SourceImage] {
        &self.images
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }
}

fn gradient(n: u32) -> RgbImage {
    RgbImage::from_fn(64, 64, |x, y| {
        Rgb([
            ((x * 4 + n * 37) % 256) as u8,
            ((y * 4 + n * 53) % 256) as u8,
            (((x + y) * 2 + n * 71) % 256) as u8,
        ])
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::refusal::perceptual::LumaFrame;

    #[test]
    fn test_synthetic_sources_are_flagged_and_decodable() {
        let pool = SourcePool::synthetic(3).unwrap();
        assert_eq!(pool.images().len(), 3);
        for (n, image) in pool.images().iter().enumerate() {
            assert_eq!(image.id, format!("synthetic-{n}"));
            assert!(image.synthetic);
            assert_eq!(image.group.as_deref(), Some(SYNTHETIC_GROUP));
            assert!(LumaFrame::decode(&image.bytes).is_ok());
        }
    }

    #[test]
    fn test_load_dataset_index() {
        let dir = tempfile::tempdir().unwrap();
        let png = encode_png(gradient(0)).unwrap();
        std::fs::write(dir.path().join("a.png"), &png).unwrap();
        std::fs::write(
            dir.path().join("index.json"),
            r#"[{"id": "face-a", "path": "a.png", "group": "group-1"}]"#,
        )
        .unwrap();

        let pool = SourcePool::load(&dir.path().join("index.json")).unwrap();
        assert_eq!(pool.images().len(), 1);
        let image = &pool.images()[0];
        assert_eq!(image.id, "face-a");
        assert_eq!(image.group.as_deref(), Some("group-1"));
        assert!(!image.synthetic);
        assert_eq!(&image.bytes[..], &png[..]);
    }

    #[test]
    fn test_duplicate_index_id_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let png = encode_png(gradient(0)).unwrap();
        std::fs::write(dir.path().join("a.png"), &png).unwrap();
        std::fs::write(dir.path().join("b.png"), &png).unwrap();
        std::fs::write(
            dir.path().join("index.json"),
            r#"[{"id": "face-a", "path": "a.png", "group": "group-1"},
                {"id": "face-a", "path": "b.png", "group": "group-2"}]"#,
        )
        .unwrap();

        let err = SourcePool::load(&dir.path().join("index.json")).unwrap_err();
        let ConfigError::Invalid { message } = &err else {
            panic!("unexpected error {err:?}");
        };
        assert!(message.contains("'face-a' listed twice"));
    }

    #[test]
    fn test_missing_image_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("index.json"),
            r#"[{"id": "x", "path": "missing.png"}]"#,
        )
        .unwrap();
        assert!(matches!(
            SourcePool::load(&dir.path().join("index.json")),
            Err(ConfigError::FileNotFound { .. })
        ));
    }
}
