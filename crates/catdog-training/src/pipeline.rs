//! The pipeline as named stages with explicit on-disk artifacts.
//!
//! ```text
//! organize   -> data_root/{train,validation}/<class>/
//! extract    -> cache_dir/{features,labels}_train.safetensors, features_train.json
//! train_head -> output_dir/head.{mpk,json}, head_history.json
//! finetune   -> output_dir/finetuned.{mpk,json}, finetune_history.json
//! evaluate   -> output_dir/evaluation.json
//! ```
//!
//! Each stage reads only the artifacts of earlier stages, so any of them
//! can be run on its own once its inputs exist.

use crate::backbone::{record_exists, ResNet, ResNetConfig};
use crate::checkpoint::{
    load_composed, load_head, save_checkpoint, CheckpointKind, CheckpointMetadata,
    FINETUNED_CHECKPOINT, HEAD_CHECKPOINT,
};
use crate::composed::ComposedModel;
use crate::evaluator::{EvaluationReport, Evaluator};
use crate::features::{extract_or_load_with, CacheKey, FeatureCache, FeatureSet};
use crate::finetune::FineTuner;
use crate::head_trainer::HeadTrainer;
use burn::module::Module;
use burn::record::CompactRecorder;
use burn::tensor::backend::{AutodiffBackend, Backend};
use catdog_core::{DataSplit, Error, PipelineConfig, Result, TrainingHistory};
use catdog_dataset::{
    DatasetOrganizer, DirectoryFlow, FlowOptions, ImageDataGenerator, OrganizeReport,
};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Paths of everything the pipeline writes under `output_dir`
#[derive(Debug, Clone)]
pub struct PipelineArtifacts {
    output_dir: PathBuf,
    cache_dir: PathBuf,
}

impl PipelineArtifacts {
    pub fn new(output_dir: impl Into<PathBuf>, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            cache_dir: cache_dir.into(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn feature_cache(&self) -> FeatureCache {
        FeatureCache::new(&self.cache_dir)
    }

    /// Backbone record saved when running without pretrained weights
    pub fn random_backbone(&self) -> PathBuf {
        self.output_dir.join("backbone_init")
    }

    pub fn head(&self) -> PathBuf {
        self.output_dir.join(HEAD_CHECKPOINT)
    }

    pub fn finetuned(&self) -> PathBuf {
        self.output_dir.join(FINETUNED_CHECKPOINT)
    }

    pub fn head_history(&self) -> PathBuf {
        self.output_dir.join("head_history.json")
    }

    pub fn finetune_history(&self) -> PathBuf {
        self.output_dir.join("finetune_history.json")
    }

    pub fn evaluation(&self) -> PathBuf {
        self.output_dir.join("evaluation.json")
    }
}

/// Summary returned by [`Pipeline::run_all`]
#[derive(Debug, Clone)]
pub struct PipelineSummary {
    pub organize: OrganizeReport,
    pub feature_shape: (usize, usize),
    pub head_history: TrainingHistory,
    pub finetune_history: TrainingHistory,
    pub evaluation: EvaluationReport,
}

pub struct Pipeline {
    config: PipelineConfig,
    resnet: ResNetConfig,
    artifacts: PipelineArtifacts,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        let resnet = ResNetConfig::for_architecture(config.backbone.architecture);
        let artifacts =
            PipelineArtifacts::new(&config.output.output_dir, &config.extraction.cache_dir);
        Ok(Self {
            config,
            resnet,
            artifacts,
        })
    }

    /// Replaces the network shape derived from the configured architecture
    pub fn with_resnet_config(mut self, resnet: ResNetConfig) -> Self {
        self.resnet = resnet;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn resnet_config(&self) -> &ResNetConfig {
        &self.resnet
    }

    pub fn artifacts(&self) -> &PipelineArtifacts {
        &self.artifacts
    }

    /// First trainable unit for the configured freeze boundary
    pub fn trainable_from(&self) -> Result<usize> {
        self.resnet.resolve_boundary(&self.config.backbone.freeze_boundary)
    }

    fn split_dir(&self, split: DataSplit) -> PathBuf {
        DatasetOrganizer::new(&self.config.data).split_dir(split)
    }

    /// Stage 1: extract, sort by class, carve validation, check balance
    pub fn organize(&self) -> Result<OrganizeReport> {
        info!("Stage organize: {}", self.config.data.data_root.display());
        DatasetOrganizer::new(&self.config.data).organize()
    }

    /// Backbone with the configured pretrained weights.
    ///
    /// Without weights this fails unless `backbone.allow_random_init` is set.
    /// A random backbone is saved on first use and reloaded afterwards, so
    /// every stage sees the same weights.
    pub fn backbone<B: Backend>(&self, device: &B::Device) -> Result<ResNet<B>> {
        let backbone = self.resnet.init(device);
        if let Some(path) = &self.config.backbone.weights {
            return backbone.load_pretrained(path, device);
        }
        if !self.config.backbone.allow_random_init {
            return Err(Error::Config(
                "backbone.weights is not set; point it at a pretrained record or set \
                 backbone.allow_random_init = true"
                    .into(),
            ));
        }

        let path = self.artifacts.random_backbone();
        if record_exists(&path) {
            warn!("No backbone weights configured; reusing {}", path.display());
            return Ok(backbone.load_file(path, &CompactRecorder::new(), device)?);
        }
        warn!(
            "No backbone weights configured; saving a randomly initialised backbone to {}",
            path.display()
        );
        fs::create_dir_all(self.artifacts.output_dir())?;
        backbone.clone().save_file(path, &CompactRecorder::new())?;
        Ok(backbone)
    }

    /// Generator without random transforms that keeps the configured rescale
    fn evaluation_generator(&self) -> ImageDataGenerator {
        ImageDataGenerator::new(
            self.config.augmentation.deterministic(),
            self.config.image.clone(),
        )
    }

    fn train_flow(&self, generator: &ImageDataGenerator, options: FlowOptions) -> Result<DirectoryFlow> {
        generator.flow_from_directory(&self.split_dir(DataSplit::Train), options)
    }

    /// Non-augmenting pass over the training split, as fed to the extractor
    pub fn extraction_flow(&self) -> Result<DirectoryFlow> {
        let extraction = &self.config.extraction;
        self.train_flow(
            &self.evaluation_generator(),
            FlowOptions::new(extraction.batch_size)
                .with_shuffle(extraction.shuffle)
                .with_seed(self.config.seed)
                .with_max_samples(extraction.max_images),
        )
    }

    /// Augmented stream over the training split for fine-tuning
    pub fn finetune_flow(&self) -> Result<DirectoryFlow> {
        let generator =
            ImageDataGenerator::new(self.config.augmentation.clone(), self.config.image.clone());
        self.train_flow(
            &generator,
            FlowOptions::new(self.config.finetune.batch_size).with_seed(self.config.seed),
        )
    }

    /// Ordered, non-augmenting pass over the validation split
    pub fn validation_flow(&self, batch_size: usize) -> Result<DirectoryFlow> {
        self.evaluation_generator().flow_from_directory(
            &self.split_dir(DataSplit::Validation),
            FlowOptions::new(batch_size)
                .with_shuffle(false)
                .with_seed(self.config.seed),
        )
    }

    /// Feature cache keyed on the settings extraction depends on
    pub fn feature_cache(&self) -> FeatureCache {
        let extraction = &self.config.extraction;
        self.artifacts.feature_cache().with_key(CacheKey {
            architecture: self.config.backbone.architecture,
            weights: self.config.backbone.weights.clone(),
            max_images: extraction.max_images,
            shuffle: extraction.shuffle,
            seed: self.config.seed,
        })
    }

    /// Stage 2: backbone features of the training split, cached on disk
    pub fn extract<B: Backend>(&self, device: &B::Device) -> Result<FeatureSet> {
        info!("Stage extract: cache in {}", self.config.extraction.cache_dir.display());
        let mut flow = self.extraction_flow()?;
        extract_or_load_with(
            &self.feature_cache(),
            self.resnet.feature_dim(),
            &mut flow,
            device,
            || self.backbone::<B>(device),
        )
    }

    /// Stage 3: dense head on the cached features
    pub fn train_head<B: AutodiffBackend>(&self, device: &B::Device) -> Result<TrainingHistory> {
        info!("Stage train_head");
        let cache = self.feature_cache();
        if !cache.is_current() {
            return Err(Error::NotFound(format!(
                "features for the current extraction settings in {}; run extract first",
                cache.dir().display()
            )));
        }
        let features = cache.load(self.resnet.feature_dim())?;

        let trainer = HeadTrainer::<B>::new(self.config.head.clone(), self.config.seed, device.clone());
        let (head, history) = trainer.fit(&features)?;

        let mut metadata = CheckpointMetadata::new(
            CheckpointKind::Head,
            self.config.backbone.architecture,
            features.dim(),
        );
        if let Some(last) = history.last() {
            metadata = metadata.with_validation_accuracy(last.val_accuracy);
        }
        save_checkpoint(head, &self.artifacts.head(), &metadata)?;
        write_json(&self.artifacts.head_history(), &history)?;
        Ok(history)
    }

    /// Stage 4: fine-tune the layers past the freeze boundary together with the head
    pub fn finetune<B: AutodiffBackend>(&self, device: &B::Device) -> Result<TrainingHistory> {
        let trainable_from = self.trainable_from()?;
        info!(
            "Stage finetune: boundary {} resolves to unit {trainable_from}",
            self.config.backbone.freeze_boundary
        );

        let backbone = self.backbone::<B>(device)?;
        let (head, _) = load_head::<B>(&self.artifacts.head(), device)?;
        let model = ComposedModel::new(backbone, head)?.freeze_before(trainable_from)?;

        let finetune = &self.config.finetune;
        let mut train_flow = self.finetune_flow()?;
        let mut val_flow = self.validation_flow(finetune.batch_size)?;

        let tuner = FineTuner::<B>::new(finetune.clone(), device.clone());
        let (model, history) = tuner.fit(model, &mut train_flow, &mut val_flow)?;

        let mut metadata = CheckpointMetadata::new(
            CheckpointKind::Finetuned,
            self.config.backbone.architecture,
            self.resnet.feature_dim(),
        )
        .with_trainable_from(trainable_from);
        if let Some(last) = history.last() {
            metadata = metadata.with_validation_accuracy(last.val_accuracy);
        }
        save_checkpoint(model, &self.artifacts.finetuned(), &metadata)?;
        write_json(&self.artifacts.finetune_history(), &history)?;
        Ok(history)
    }

    /// Stage 5: accuracy of a saved model on the validation split.
    ///
    /// A head checkpoint is evaluated on top of the configured backbone.
    pub fn evaluate<B: Backend>(
        &self,
        kind: CheckpointKind,
        device: &B::Device,
    ) -> Result<EvaluationReport> {
        info!("Stage evaluate: {kind:?} checkpoint");
        let model = match kind {
            CheckpointKind::Finetuned => {
                load_composed::<B>(&self.resnet, &self.artifacts.finetuned(), device)?.0
            }
            CheckpointKind::Head => {
                let (head, _) = load_head::<B>(&self.artifacts.head(), device)?;
                ComposedModel::new(self.backbone::<B>(device)?, head)?
            }
        };

        let evaluation = &self.config.evaluation;
        let mut flow = self.validation_flow(evaluation.batch_size)?;
        let report = Evaluator::new(evaluation.threshold).evaluate_model(&model, &mut flow, device)?;

        for mistake in report.most_confident_mistakes(evaluation.top_mistakes) {
            info!(
                "Confident mistake: {} p={:.3} label={}",
                mistake.path.display(),
                mistake.probability,
                mistake.label
            );
        }
        write_json(&self.artifacts.evaluation(), &report)?;
        Ok(report)
    }

    /// Every stage in order; extraction and evaluation run without autodiff
    pub fn run_all<B: AutodiffBackend>(&self, device: &B::Device) -> Result<PipelineSummary> {
        let organize = self.organize()?;
        let features = self.extract::<B::InnerBackend>(device)?;
        let head_history = self.train_head::<B>(device)?;
        let finetune_history = self.finetune::<B>(device)?;
        let evaluation = self.evaluate::<B::InnerBackend>(CheckpointKind::Finetuned, device)?;

        if let (Some(head), Some(tuned)) = (head_history.last(), finetune_history.last()) {
            info!(
                "Validation accuracy: head {:.4}, fine-tuned {:.4}, final evaluation {:.4}",
                head.val_accuracy, tuned.val_accuracy, evaluation.accuracy
            );
        }

        Ok(PipelineSummary {
            organize,
            feature_shape: features.shape(),
            head_history,
            finetune_history,
            evaluation,
        })
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, serde_json::to_string_pretty(value)?)?;
    Ok(())
}

/// Reads a history written by [`Pipeline::train_head`] or [`Pipeline::finetune`]
pub fn read_history(path: &Path) -> Result<TrainingHistory> {
    if !path.is_file() {
        return Err(Error::NotFound(format!("training history {}", path.display())));
    }
    Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
}
