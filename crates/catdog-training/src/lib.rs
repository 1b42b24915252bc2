//! Models and training loops for the cats-vs-dogs pipeline.
//!
//! - [`backbone`]: bottleneck ResNet addressed as a flat list of units
//! - [`features`]: one-pass feature extraction and the safetensors cache
//! - [`head_trainer`]: dense head trained on cached features
//! - [`composed`] / [`finetune`]: backbone + head with a freeze boundary
//! - [`evaluator`]: thresholded accuracy on the validation split
//! - [`pipeline`]: the stages above wired to their on-disk artifacts

pub mod backbone;
pub mod checkpoint;
pub mod composed;
pub mod evaluator;
pub mod features;
pub mod finetune;
pub mod head;
pub mod head_trainer;
pub mod loss;
pub mod pipeline;

pub use backbone::{LayerInfo, ResNet, ResNetConfig, STAGE_NAMES};
pub use checkpoint::{CheckpointKind, CheckpointMetadata};
pub use composed::ComposedModel;
pub use evaluator::{EvaluationReport, Evaluator, Prediction};
pub use features::{CacheKey, FeatureCache, FeatureExtractor, FeatureSet};
pub use finetune::FineTuner;
pub use head::{BinaryHead, BinaryHeadConfig};
pub use head_trainer::HeadTrainer;
pub use pipeline::{Pipeline, PipelineArtifacts, PipelineSummary};
