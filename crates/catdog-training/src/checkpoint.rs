//! Model records and their JSON metadata sidecars.
//!
//! A checkpoint named `<dir>/<name>` consists of the burn record
//! `<name>.mpk` written by `CompactRecorder` and `<name>.json` with the
//! [`CheckpointMetadata`] needed to rebuild the module before loading it.

use crate::backbone::{record_base, record_exists, ResNetConfig};
use crate::composed::ComposedModel;
use crate::head::{BinaryHead, BinaryHeadConfig};
use burn::{module::Module, record::CompactRecorder, tensor::backend::Backend};
use catdog_core::{Error, ModelArchitecture, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

pub const HEAD_CHECKPOINT: &str = "head";
pub const FINETUNED_CHECKPOINT: &str = "finetuned";

/// Which pipeline stage produced a checkpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointKind {
    Head,
    Finetuned,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub kind: CheckpointKind,
    pub architecture: ModelArchitecture,
    pub feature_dim: usize,
    /// First trainable unit; unset for a head-only checkpoint
    pub trainable_from: Option<usize>,
    pub validation_accuracy: Option<f64>,
    pub created_at: DateTime<Utc>,
}

impl CheckpointMetadata {
    pub fn new(kind: CheckpointKind, architecture: ModelArchitecture, feature_dim: usize) -> Self {
        Self {
            kind,
            architecture,
            feature_dim,
            trainable_from: None,
            validation_accuracy: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_trainable_from(mut self, trainable_from: usize) -> Self {
        self.trainable_from = Some(trainable_from);
        self
    }

    pub fn with_validation_accuracy(mut self, accuracy: f64) -> Self {
        self.validation_accuracy = Some(accuracy);
        self
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(Error::NotFound(format!("checkpoint metadata {}", path.display())));
        }
        Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
    }
}

/// `<base>.json` next to the record
pub fn metadata_path(path: &Path) -> PathBuf {
    let mut file = record_base(path).into_os_string();
    file.push(".json");
    PathBuf::from(file)
}

/// Writes the module record and its metadata
pub fn save_checkpoint<B: Backend, M: Module<B>>(
    module: M,
    path: &Path,
    metadata: &CheckpointMetadata,
) -> Result<()> {
    let base = record_base(path);
    if let Some(parent) = base.parent() {
        fs::create_dir_all(parent)?;
    }
    module.save_file(base.clone(), &CompactRecorder::new())?;
    metadata.save(&metadata_path(&base))?;
    info!("Saved {:?} checkpoint to {}", metadata.kind, base.display());
    Ok(())
}

fn load_record<B: Backend, M: Module<B>>(module: M, path: &Path, device: &B::Device) -> Result<M> {
    if !record_exists(path) {
        return Err(Error::NotFound(format!("checkpoint {}", path.display())));
    }
    Ok(module.load_file(record_base(path), &CompactRecorder::new(), device)?)
}

fn expect_kind(metadata: &CheckpointMetadata, kind: CheckpointKind, path: &Path) -> Result<()> {
    if metadata.kind != kind {
        return Err(Error::Model(format!(
            "{} holds a {:?} checkpoint, expected {:?}",
            path.display(),
            metadata.kind,
            kind
        )));
    }
    Ok(())
}

/// Loads a head saved by the head-training stage
pub fn load_head<B: Backend>(
    path: &Path,
    device: &B::Device,
) -> Result<(BinaryHead<B>, CheckpointMetadata)> {
    let metadata = CheckpointMetadata::load(&metadata_path(path))?;
    expect_kind(&metadata, CheckpointKind::Head, path)?;

    let head = BinaryHeadConfig::new(metadata.feature_dim).init(device);
    Ok((load_record(head, path, device)?, metadata))
}

/// Loads a fine-tuned model and re-applies its freeze boundary
pub fn load_composed<B: Backend>(
    config: &ResNetConfig,
    path: &Path,
    device: &B::Device,
) -> Result<(ComposedModel<B>, CheckpointMetadata)> {
    let metadata = CheckpointMetadata::load(&metadata_path(path))?;
    expect_kind(&metadata, CheckpointKind::Finetuned, path)?;
    if metadata.feature_dim != config.feature_dim() {
        return Err(Error::shape_mismatch(
            "checkpoint feature width",
            format!("D={}", config.feature_dim()),
            format!("D={}", metadata.feature_dim),
        ));
    }

    let backbone = config.init(device);
    let head = BinaryHeadConfig::new(metadata.feature_dim).init(device);
    let model = load_record(ComposedModel::new(backbone, head)?, path, device)?;
    let model = model.freeze_before(metadata.trainable_from.unwrap_or(0))?;
    Ok((model, metadata))
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::Tensor;
    use burn_ndarray::NdArray;
    use tempfile::TempDir;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_metadata_path() {
        assert_eq!(metadata_path(Path::new("out/head")), PathBuf::from("out/head.json"));
        assert_eq!(metadata_path(Path::new("out/head.mpk")), PathBuf::from("out/head.json"));
    }

    #[test]
    fn test_head_checkpoint_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("models").join(HEAD_CHECKPOINT);
        let device = Default::default();

        let head: BinaryHead<TestBackend> = BinaryHeadConfig::new(8).init(&device);
        let metadata = CheckpointMetadata::new(CheckpointKind::Head, ModelArchitecture::ResNet50, 8)
            .with_validation_accuracy(0.9);
        save_checkpoint(head.clone(), &path, &metadata).unwrap();

        let (loaded, meta) = load_head::<TestBackend>(&path, &device).unwrap();
        assert_eq!(meta.kind, CheckpointKind::Head);
        assert_eq!(meta.validation_accuracy, Some(0.9));

        let x = Tensor::<TestBackend, 2>::ones([2, 8], &device);
        let expected = head.forward(x.clone()).into_data().to_vec::<f32>().unwrap();
        let actual = loaded.forward(x).into_data().to_vec::<f32>().unwrap();
        assert_eq!(expected, actual);

        assert!(matches!(
            load_composed::<TestBackend>(&ResNetConfig::tiny(), &path, &device),
            Err(Error::Model(_))
        ));
    }

    #[test]
    fn test_composed_checkpoint_keeps_boundary() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(FINETUNED_CHECKPOINT);
        let device = Default::default();
        let config = ResNetConfig::tiny();

        let backbone = config.init::<TestBackend>(&device);
        let head = BinaryHeadConfig::new(config.feature_dim()).init(&device);
        let model = ComposedModel::new(backbone, head).unwrap().freeze_before(4).unwrap();
        let metadata = CheckpointMetadata::new(
            CheckpointKind::Finetuned,
            ModelArchitecture::ResNet50,
            config.feature_dim(),
        )
        .with_trainable_from(model.trainable_from());
        save_checkpoint(model, &path, &metadata).unwrap();

        let (loaded, _) = load_composed::<TestBackend>(&config, &path, &device).unwrap();
        assert_eq!(loaded.trainable_from(), 4);
    }

    #[test]
    fn test_missing_checkpoint() {
        let temp_dir = TempDir::new().unwrap();
        let result = load_head::<TestBackend>(&temp_dir.path().join("head"), &Default::default());
        assert!(matches!(result, Err(Error::NotFound(_))));
    }
}
