//! Configuration structures for the pipeline.
//!
//! Every stage receives its section of [`PipelineConfig`] explicitly; nothing
//! is captured from global state.

use crate::types::{ImageDimensions, ModelArchitecture};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration, usually loaded from TOML
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Random seed for shuffling, augmentation and initialisation
    pub seed: u64,
    pub data: DataConfig,
    pub image: ImageConfig,
    /// Augmentation applied to the training stream during fine-tuning
    pub augmentation: AugmentationConfig,
    pub backbone: BackboneConfig,
    pub extraction: ExtractionConfig,
    pub head: HeadConfig,
    pub finetune: FinetuneConfig,
    pub evaluation: EvaluationConfig,
    pub output: OutputConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            data: DataConfig::default(),
            image: ImageConfig::default(),
            augmentation: AugmentationConfig::default(),
            backbone: BackboneConfig::default(),
            extraction: ExtractionConfig::default(),
            head: HeadConfig::default(),
            finetune: FinetuneConfig::default(),
            evaluation: EvaluationConfig::default(),
            output: OutputConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Checks value ranges that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.data.classes.len() < 2 {
            return Err(Error::Config(format!(
                "at least two classes are required, got {:?}",
                self.data.classes
            )));
        }
        if self.data.validation_per_class == 0 {
            return Err(Error::Config("validation_per_class must be > 0".into()));
        }
        if self.data.max_imbalance_ratio < 1.0 {
            return Err(Error::Config(format!(
                "max_imbalance_ratio must be >= 1.0, got {}",
                self.data.max_imbalance_ratio
            )));
        }
        let dims = self.image.size;
        if dims.width == 0 || dims.height == 0 || dims.channels != 3 {
            return Err(Error::Config(format!(
                "image size must be non-empty RGB, got {}x{}x{}",
                dims.width, dims.height, dims.channels
            )));
        }
        for (name, size) in [
            ("extraction.batch_size", self.extraction.batch_size),
            ("head.batch_size", self.head.batch_size),
            ("finetune.batch_size", self.finetune.batch_size),
            ("evaluation.batch_size", self.evaluation.batch_size),
        ] {
            if size == 0 {
                return Err(Error::Config(format!("{name} must be > 0")));
            }
        }
        if !(self.head.validation_fraction > 0.0 && self.head.validation_fraction < 1.0) {
            return Err(Error::Config(format!(
                "head.validation_fraction must be in (0, 1), got {}",
                self.head.validation_fraction
            )));
        }
        if self.head.learning_rate <= 0.0 || self.finetune.learning_rate <= 0.0 {
            return Err(Error::Config("learning rates must be positive".into()));
        }
        if !(0.0..1.0).contains(&self.finetune.momentum) {
            return Err(Error::Config(format!(
                "finetune.momentum must be in [0, 1), got {}",
                self.finetune.momentum
            )));
        }
        if !(self.evaluation.threshold > 0.0 && self.evaluation.threshold < 1.0) {
            return Err(Error::Config(format!(
                "evaluation.threshold must be in (0, 1), got {}",
                self.evaluation.threshold
            )));
        }
        self.augmentation.validate()
    }
}

/// Dataset location and split layout
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    /// Root holding `train/` and `validation/`; `~` is expanded
    pub data_root: PathBuf,
    /// Zip archive extracted into `data_root` on first run
    pub archive: PathBuf,
    /// Class names, also the filename prefixes of the flat archive
    pub classes: Vec<String>,
    /// Images moved from train to validation per class
    pub validation_per_class: usize,
    /// Largest allowed ratio between the biggest and smallest train class
    pub max_imbalance_ratio: f64,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("~/data/dogscats"),
            archive: PathBuf::from("~/data/train.zip"),
            classes: vec!["cat".to_string(), "dog".to_string()],
            validation_per_class: 500,
            max_imbalance_ratio: 1.5,
        }
    }
}

/// Pixel normalisation applied before images reach the backbone
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Normalization {
    /// Keep 0-255 RGB values
    None,
    /// RGB to BGR and ImageNet channel mean subtraction on 0-255 values
    #[default]
    Caffe,
    /// Scale to [0, 1] then ImageNet mean/std standardisation
    Torch,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    pub normalization: Normalization,
    pub size: ImageDimensions,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            normalization: Normalization::Caffe,
            size: ImageDimensions::imagenet(),
        }
    }
}

/// How pixels outside the source image are filled after an affine transform
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum FillMode {
    #[default]
    Nearest,
    Constant,
    Reflect,
}

/// Randomised label-preserving transforms
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AugmentationConfig {
    /// Maximum rotation in degrees, sampled in [-r, r]
    pub rotation_range: f32,
    /// Horizontal shift as a fraction of width
    pub width_shift_range: f32,
    /// Vertical shift as a fraction of height
    pub height_shift_range: f32,
    /// Maximum shear angle in degrees
    pub shear_range: f32,
    /// Zoom factor sampled in [1 - z, 1 + z]
    pub zoom_range: f32,
    pub horizontal_flip: bool,
    pub vertical_flip: bool,
    /// Per-image uniform offset added to every channel value, in [-c, c]
    pub channel_shift_range: f32,
    /// Multiplier applied after normalisation
    pub rescale: Option<f32>,
    pub fill_mode: FillMode,
    /// Value used with [`FillMode::Constant`]
    pub fill_value: f32,
}

impl Default for AugmentationConfig {
    fn default() -> Self {
        Self {
            rotation_range: 10.0,
            width_shift_range: 0.1,
            height_shift_range: 0.1,
            shear_range: 5.0,
            zoom_range: 0.1,
            horizontal_flip: true,
            vertical_flip: false,
            channel_shift_range: 10.0,
            rescale: None,
            fill_mode: FillMode::Nearest,
            fill_value: 0.0,
        }
    }
}

impl AugmentationConfig {
    /// No random transforms; only resize and normalisation happen.
    pub fn none() -> Self {
        Self {
            rotation_range: 0.0,
            width_shift_range: 0.0,
            height_shift_range: 0.0,
            shear_range: 0.0,
            zoom_range: 0.0,
            horizontal_flip: false,
            vertical_flip: false,
            channel_shift_range: 0.0,
            rescale: None,
            fill_mode: FillMode::Nearest,
            fill_value: 0.0,
        }
    }

    /// Whether any random transform is enabled
    pub fn is_random(&self) -> bool {
        self.rotation_range > 0.0
            || self.width_shift_range > 0.0
            || self.height_shift_range > 0.0
            || self.shear_range > 0.0
            || self.zoom_range > 0.0
            || self.horizontal_flip
            || self.vertical_flip
            || self.channel_shift_range > 0.0
    }

    /// Same rescale but no randomness, for evaluation streams
    pub fn deterministic(&self) -> Self {
        Self {
            rescale: self.rescale,
            ..Self::none()
        }
    }

    pub fn validate(&self) -> Result<()> {
        let ranges = [
            ("rotation_range", self.rotation_range),
            ("width_shift_range", self.width_shift_range),
            ("height_shift_range", self.height_shift_range),
            ("shear_range", self.shear_range),
            ("zoom_range", self.zoom_range),
            ("channel_shift_range", self.channel_shift_range),
        ];
        for (name, value) in ranges {
            if value < 0.0 || !value.is_finite() {
                return Err(Error::Config(format!(
                    "augmentation.{name} must be a non-negative number, got {value}"
                )));
            }
        }
        if self.zoom_range >= 1.0 {
            return Err(Error::Config(format!(
                "augmentation.zoom_range must be < 1.0, got {}",
                self.zoom_range
            )));
        }
        Ok(())
    }
}

/// Where fine-tuning starts to train the backbone
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FreezeBoundary {
    /// First unit of a named residual stage, e.g. `layer4`
    Stage(String),
    /// Raw unit index (0 is the stem)
    Index(usize),
}

impl Default for FreezeBoundary {
    fn default() -> Self {
        FreezeBoundary::Stage("layer4".to_string())
    }
}

impl std::fmt::Display for FreezeBoundary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FreezeBoundary::Stage(name) => write!(f, "stage {name}"),
            FreezeBoundary::Index(index) => write!(f, "index {index}"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackboneConfig {
    pub architecture: ModelArchitecture,
    /// Pretrained record file, required unless `allow_random_init` is set
    pub weights: Option<PathBuf>,
    /// Run without pretrained weights on a randomly initialised backbone
    pub allow_random_init: bool,
    pub freeze_boundary: FreezeBoundary,
}

impl Default for BackboneConfig {
    fn default() -> Self {
        Self {
            architecture: ModelArchitecture::ResNet50,
            weights: None,
            allow_random_init: false,
            freeze_boundary: FreezeBoundary::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    pub batch_size: usize,
    /// Stop after this many images instead of a full pass
    pub max_images: Option<usize>,
    pub shuffle: bool,
    /// Directory for `features_train.safetensors` and `labels_train.safetensors`
    pub cache_dir: PathBuf,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            max_images: None,
            shuffle: false,
            cache_dir: PathBuf::from("artifacts/features"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeadConfig {
    /// Adam learning rate
    pub learning_rate: f64,
    pub epochs: usize,
    pub batch_size: usize,
    /// Trailing fraction of cached features held out for validation
    pub validation_fraction: f64,
}

impl Default for HeadConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-3,
            epochs: 10,
            batch_size: 32,
            validation_fraction: 0.1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FinetuneConfig {
    /// SGD learning rate
    pub learning_rate: f64,
    pub momentum: f64,
    pub epochs: usize,
    pub batch_size: usize,
    /// Batches per epoch; a full pass when unset
    pub steps_per_epoch: Option<usize>,
    /// Validation batches per epoch; a full pass when unset
    pub validation_steps: Option<usize>,
}

impl Default for FinetuneConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-4,
            momentum: 0.9,
            epochs: 3,
            batch_size: 32,
            steps_per_epoch: None,
            validation_steps: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluationConfig {
    pub batch_size: usize,
    /// Probability at or above which an image is labelled as class 1
    pub threshold: f64,
    /// Number of most confident mistakes kept in the report
    pub top_mistakes: usize,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            threshold: 0.5,
            top_mistakes: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub output_dir: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("artifacts"),
        }
    }
}
