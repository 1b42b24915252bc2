//! End-to-end run of every stage on a small synthetic dataset.

use burn::backend::Autodiff;
use burn_ndarray::NdArray;
use catdog_core::{ImageDimensions, Normalization, PipelineConfig};
use catdog_training::{CheckpointKind, Pipeline, ResNetConfig};
use std::fs;
use std::path::Path;
use tempfile::TempDir;

type TrainBackend = Autodiff<NdArray<f32>>;
type InferBackend = NdArray<f32>;

/// Flat Kaggle-style `train/` folder: `cat.<i>.png`, `dog.<i>.png`
fn write_flat_train_dir(root: &Path, per_class: u32) {
    let train = root.join("train");
    fs::create_dir_all(&train).unwrap();
    for i in 0..per_class {
        image::RgbImage::from_fn(40, 40, |x, _| image::Rgb([230, (x * 3 + i) as u8, 20]))
            .save(train.join(format!("cat.{i}.png")))
            .unwrap();
        image::RgbImage::from_fn(40, 40, |_, y| image::Rgb([20, (y * 3 + i) as u8, 230]))
            .save(train.join(format!("dog.{i}.png")))
            .unwrap();
    }
}

fn config(root: &Path) -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.data.data_root = root.join("dogscats");
    config.data.archive = root.join("missing.zip");
    config.data.validation_per_class = 2;
    config.backbone.allow_random_init = true;
    config.image.normalization = Normalization::Caffe;
    config.image.size = ImageDimensions::new(32, 32, 3);
    config.extraction.batch_size = 4;
    config.extraction.cache_dir = root.join("out").join("features");
    config.head.epochs = 2;
    config.head.batch_size = 4;
    config.head.validation_fraction = 0.25;
    config.finetune.epochs = 1;
    config.finetune.batch_size = 4;
    config.finetune.steps_per_epoch = Some(2);
    config.evaluation.batch_size = 3;
    config.output.output_dir = root.join("out");
    config
}

#[test]
fn test_run_all_writes_every_artifact() {
    let temp_dir = TempDir::new().unwrap();
    write_flat_train_dir(&temp_dir.path().join("dogscats"), 6);

    let pipeline = Pipeline::new(config(temp_dir.path()))
        .unwrap()
        .with_resnet_config(ResNetConfig::tiny());
    let device = Default::default();

    let summary = pipeline.run_all::<TrainBackend>(&device).unwrap();

    assert!(!summary.organize.extracted);
    assert_eq!(summary.feature_shape, (8, 128));
    assert_eq!(summary.head_history.len(), 2);
    assert_eq!(summary.finetune_history.len(), 1);
    assert_eq!(summary.evaluation.total, 4);
    assert!((0.0..=1.0).contains(&summary.evaluation.accuracy));

    let artifacts = pipeline.artifacts();
    assert!(artifacts.feature_cache().exists());
    for path in [
        artifacts.head_history(),
        artifacts.finetune_history(),
        artifacts.evaluation(),
        artifacts.output_dir().join("head.json"),
        artifacts.output_dir().join("head.mpk"),
        artifacts.output_dir().join("finetuned.json"),
        artifacts.output_dir().join("finetuned.mpk"),
        artifacts.output_dir().join("backbone_init.mpk"),
        artifacts.feature_cache().key_path(),
    ] {
        assert!(path.is_file(), "missing {}", path.display());
    }

    let validation = temp_dir.path().join("dogscats/validation");
    assert_eq!(fs::read_dir(validation.join("cat")).unwrap().count(), 2);
    assert_eq!(fs::read_dir(validation.join("dog")).unwrap().count(), 2);
}

#[test]
fn test_extraction_requires_weights_unless_opted_out() {
    let temp_dir = TempDir::new().unwrap();
    write_flat_train_dir(&temp_dir.path().join("dogscats"), 5);

    let mut config = config(temp_dir.path());
    config.backbone.allow_random_init = false;
    let pipeline = Pipeline::new(config)
        .unwrap()
        .with_resnet_config(ResNetConfig::tiny());

    pipeline.organize().unwrap();
    assert!(pipeline.extract::<InferBackend>(&Default::default()).is_err());
    assert!(!pipeline.artifacts().feature_cache().exists());
}

#[test]
fn test_stages_run_independently_from_artifacts() {
    let temp_dir = TempDir::new().unwrap();
    write_flat_train_dir(&temp_dir.path().join("dogscats"), 5);

    let pipeline = Pipeline::new(config(temp_dir.path()))
        .unwrap()
        .with_resnet_config(ResNetConfig::tiny());
    let device = Default::default();

    pipeline.organize().unwrap();
    let extracted = pipeline.extract::<InferBackend>(&device).unwrap();
    assert_eq!(extracted.shape(), (6, 128));

    // Second run is served from the cache.
    let cached = pipeline.extract::<InferBackend>(&device).unwrap();
    assert_eq!(extracted, cached);

    // Capping the image count invalidates the cache.
    let mut capped = config(temp_dir.path());
    capped.extraction.max_images = Some(4);
    let capped = Pipeline::new(capped)
        .unwrap()
        .with_resnet_config(ResNetConfig::tiny());
    assert!(capped.train_head::<TrainBackend>(&device).is_err());
    assert_eq!(capped.extract::<InferBackend>(&device).unwrap().len(), 4);
    assert!(pipeline.train_head::<TrainBackend>(&device).is_err());
    pipeline.extract::<InferBackend>(&device).unwrap();

    // Evaluating before a fine-tuned checkpoint exists fails; the head alone works.
    assert!(pipeline
        .evaluate::<InferBackend>(CheckpointKind::Finetuned, &device)
        .is_err());
    pipeline.train_head::<TrainBackend>(&device).unwrap();
    let report = pipeline
        .evaluate::<InferBackend>(CheckpointKind::Head, &device)
        .unwrap();
    assert_eq!(report.total, 4);
}
