//! The trained model artifact: classifier state plus id → name table, kept
//! together in one file so they can never be replaced independently.

use crate::lbph::LbphModel;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Bumped whenever the on-disk layout changes.
pub const ARTIFACT_FORMAT: u32 = 1;

#[derive(Error, Debug)]
pub enum ArtifactError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("artifact encoding: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported artifact format {found}")]
    UnsupportedFormat { found: u32 },
    #[error("artifact is inconsistent: {0}")]
    Inconsistent(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub format: u32,
    /// Identity store revision the model was trained from.
    pub revision: u64,
    pub trained_at: String,
    /// Identity id → display name at training time.
    pub names: BTreeMap<String, String>,
    pub model: LbphModel,
}

impl ModelArtifact {
    pub fn new(revision: u64, names: BTreeMap<String, String>, model: LbphModel) -> Self {
        Self {
            format: ARTIFACT_FORMAT,
            revision,
            trained_at: chrono::Local::now().to_rfc3339(),
            names,
            model,
        }
    }

    /// Read an artifact. `Ok(None)` when nothing has been trained yet.
    pub fn load(path: &Path) -> Result<Option<Self>, ArtifactError> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let artifact: ModelArtifact = serde_json::from_slice(&bytes)?;
        if artifact.format != ARTIFACT_FORMAT {
            return Err(ArtifactError::UnsupportedFormat {
                found: artifact.format,
            });
        }
        artifact.validate()?;
        Ok(Some(artifact))
    }

    fn validate(&self) -> Result<(), ArtifactError> {
        if self.model.is_empty() {
            return Err(ArtifactError::Inconsistent("model has no samples".into()));
        }
        if !self.model.is_consistent() {
            return Err(ArtifactError::Inconsistent(
                "histogram length does not match model parameters".into(),
            ));
        }
        if let Some(orphan) = self
            .model
            .samples
            .iter()
            .find(|s| !self.names.contains_key(&s.label))
        {
            return Err(ArtifactError::Inconsistent(format!(
                "label {:?} missing from names table",
                orphan.label
            )));
        }
        Ok(())
    }

    /// Replace the artifact at `path` all-or-nothing: write a sibling temp
    /// file, flush it to disk, then rename it over the target.
    pub fn write_atomic(&self, path: &Path) -> Result<(), ArtifactError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = temp_path(path);

        let result = (|| -> Result<(), ArtifactError> {
            let mut writer = BufWriter::new(fs::File::create(&tmp)?);
            serde_json::to_writer(&mut writer, self)?;
            writer.flush()?;
            let file = writer.into_inner().map_err(|e| e.into_error())?;
            file.sync_all()?;
            fs::rename(&tmp, path)?;
            Ok(())
        })();

        if result.is_err() {
            let _ = fs::remove_file(&tmp);
        }
        result
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "artifact".into());
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lbph::LbphParams;
    use tempfile::TempDir;

    fn artifact() -> ModelArtifact {
        let mut model = LbphModel::new(LbphParams::default());
        model.add("1", &image::GrayImage::from_pixel(100, 100, image::Luma([80])));
        let names = BTreeMap::from([("1".to_string(), "Alice".to_string())]);
        ModelArtifact::new(7, names, model)
    }

    #[test]
    fn test_load_missing_is_none() {
        let dir = TempDir::new().unwrap();
        assert!(ModelArtifact::load(&dir.path().join("model.json")).unwrap().is_none());
    }

    #[test]
    fn test_write_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("trainer").join("model.json");
        artifact().write_atomic(&path).unwrap();

        let loaded = ModelArtifact::load(&path).unwrap().unwrap();
        assert_eq!(loaded.revision, 7);
        assert_eq!(loaded.names.get("1").map(String::as_str), Some("Alice"));
        assert_eq!(loaded.model.len(), 1);
        assert!(!temp_path(&path).exists());
    }

    #[test]
    fn test_rejects_orphan_label() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("model.json");
        let mut bad = artifact();
        bad.names.clear();
        fs::write(&path, serde_json::to_vec(&bad).unwrap()).unwrap();
        assert!(matches!(ModelArtifact::load(&path), Err(ArtifactError::Inconsistent(_))));
    }

    #[test]
    fn test_rejects_other_format() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("model.json");
        let mut future = artifact();
        future.format = ARTIFACT_FORMAT + 1;
        fs::write(&path, serde_json::to_vec(&future).unwrap()).unwrap();
        assert!(matches!(
            ModelArtifact::load(&path),
            Err(ArtifactError::UnsupportedFormat { .. })
        ));
    }

    #[test]
    fn test_rejects_truncated_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("model.json");
        fs::write(&path, b"{\"format\":1,").unwrap();
        assert!(matches!(ModelArtifact::load(&path), Err(ArtifactError::Json(_))));
    }

    #[test]
    fn test_failed_rename_leaves_target_and_no_temp() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("model.json");
        // A non-empty directory where the artifact should go.
        fs::create_dir_all(&path).unwrap();
        fs::write(path.join("keep"), b"previous").unwrap();

        assert!(artifact().write_atomic(&path).is_err());
        assert_eq!(fs::read(path.join("keep")).unwrap(), b"previous");
        assert!(!temp_path(&path).exists());
    }

    #[test]
    fn test_failed_write_keeps_previous_artifact() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("model.json");
        artifact().write_atomic(&path).unwrap();
        let before = fs::read(&path).unwrap();

        // Temp file cannot be created, so nothing reaches the target.
        fs::create_dir_all(temp_path(&path).join("blocked")).unwrap();
        let mut newer = artifact();
        newer.revision = 8;
        assert!(newer.write_atomic(&path).is_err());

        assert_eq!(fs::read(&path).unwrap(), before);
        assert_eq!(ModelArtifact::load(&path).unwrap().unwrap().revision, 7);
    }
}
