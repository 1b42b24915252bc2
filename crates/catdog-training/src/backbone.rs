//! Bottleneck ResNet backbone used as the feature extractor.
//!
//! The network is addressed as a flat sequence of *units*: unit 0 is the
//! stem (7x7 conv, batch norm, max pool) and every following unit is one
//! bottleneck block, in stage order `layer1`..`layer4`. Freezing and partial
//! forward passes are expressed in unit indices, and stage names resolve to
//! the index of the stage's first block from the configured depths.
//!
//! Architecture (ResNet-50):
//! - Input: 224x224x3
//! - Stem: Conv 7x7 stride 2, MaxPool 3x3 stride 2
//! - Stages of [3, 4, 6, 3] bottleneck blocks, widths 64..512, expansion 4
//! - Global average pooling to 2048 features

use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d, MaxPool2dConfig},
        BatchNorm, BatchNormConfig, PaddingConfig2d, Relu,
    },
    record::CompactRecorder,
    tensor::{backend::Backend, Tensor},
};
use catdog_core::{Error, FreezeBoundary, ModelArchitecture};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

pub const STAGE_NAMES: [&str; 4] = ["layer1", "layer2", "layer3", "layer4"];

#[derive(Config, Debug)]
pub struct ResNetConfig {
    /// Bottleneck blocks in each of the four stages
    pub stage_depths: [usize; 4],
    /// Inner width of the first stage; doubles every stage
    #[config(default = "64")]
    pub base_width: usize,
    /// Output width over inner width of a bottleneck block
    #[config(default = "4")]
    pub expansion: usize,
    #[config(default = "3")]
    pub in_channels: usize,
}

/// One row of [`ResNetConfig::layer_table`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerInfo {
    pub index: usize,
    /// `stem` or `<stage>.<block>`, e.g. `layer4.0`
    pub name: String,
    pub stage: String,
    pub out_channels: usize,
}

impl ResNetConfig {
    pub fn resnet50() -> Self {
        Self::for_architecture(ModelArchitecture::ResNet50)
    }

    pub fn for_architecture(architecture: ModelArchitecture) -> Self {
        Self::new(architecture.stage_depths())
    }

    /// Miniature network for tests
    pub fn tiny() -> Self {
        Self::new([1, 1, 1, 1]).with_base_width(4)
    }

    /// Width of the pooled feature vector
    pub fn feature_dim(&self) -> usize {
        self.base_width * 8 * self.expansion
    }

    /// Stem plus every bottleneck block
    pub fn num_units(&self) -> usize {
        1 + self.stage_depths.iter().sum::<usize>()
    }

    /// Unit index of the first block of a stage; `stem` is 0 and `head`
    /// is one past the last unit
    pub fn stage_start(&self, stage: &str) -> Option<usize> {
        match stage {
            "stem" => return Some(0),
            "head" => return Some(self.num_units()),
            _ => {}
        }
        let position = STAGE_NAMES.iter().position(|name| *name == stage)?;
        Some(1 + self.stage_depths[..position].iter().sum::<usize>())
    }

    /// First trainable unit for a freeze boundary
    pub fn resolve_boundary(&self, boundary: &FreezeBoundary) -> catdog_core::Result<usize> {
        match boundary {
            FreezeBoundary::Stage(stage) => self.stage_start(stage).ok_or_else(|| {
                Error::Config(format!(
                    "unknown stage '{stage}', expected stem, {} or head",
                    STAGE_NAMES.join(", ")
                ))
            }),
            FreezeBoundary::Index(index) if *index <= self.num_units() => Ok(*index),
            FreezeBoundary::Index(index) => Err(Error::Config(format!(
                "freeze index {index} is past the last unit ({})",
                self.num_units()
            ))),
        }
    }

    pub fn layer_table(&self) -> Vec<LayerInfo> {
        let mut table = vec![LayerInfo {
            index: 0,
            name: "stem".to_string(),
            stage: "stem".to_string(),
            out_channels: self.base_width,
        }];
        for (stage, (name, depth)) in STAGE_NAMES.iter().zip(self.stage_depths).enumerate() {
            let out_channels = self.base_width * (1 << stage) * self.expansion;
            for block in 0..depth {
                table.push(LayerInfo {
                    index: table.len(),
                    name: format!("{name}.{block}"),
                    stage: name.to_string(),
                    out_channels,
                });
            }
        }
        table
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> ResNet<B> {
        let stem = Stem::new(self.in_channels, self.base_width, device);

        let mut in_channels = self.base_width;
        let mut stages = Vec::with_capacity(4);
        for (stage, depth) in self.stage_depths.iter().enumerate() {
            let width = self.base_width << stage;
            let stride = if stage == 0 { 1 } else { 2 };
            let mut blocks = Vec::with_capacity(*depth);
            for block in 0..*depth {
                let block_stride = if block == 0 { stride } else { 1 };
                blocks.push(Bottleneck::new(
                    in_channels,
                    width,
                    width * self.expansion,
                    block_stride,
                    device,
                ));
                in_channels = width * self.expansion;
            }
            stages.push(blocks);
        }

        let mut stages = stages.into_iter();
        ResNet {
            stem,
            layer1: stages.next().unwrap_or_default(),
            layer2: stages.next().unwrap_or_default(),
            layer3: stages.next().unwrap_or_default(),
            layer4: stages.next().unwrap_or_default(),
            pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            feature_dim: self.feature_dim(),
        }
    }
}

fn conv<B: Backend>(
    channels: [usize; 2],
    kernel: usize,
    stride: usize,
    padding: usize,
    device: &B::Device,
) -> Conv2d<B> {
    Conv2dConfig::new(channels, [kernel, kernel])
        .with_stride([stride, stride])
        .with_padding(PaddingConfig2d::Explicit(padding, padding))
        .with_bias(false)
        .init(device)
}

#[derive(Module, Debug)]
pub struct Stem<B: Backend> {
    pub conv: Conv2d<B>,
    pub bn: BatchNorm<B, 2>,
    pub relu: Relu,
    pub pool: MaxPool2d,
}

impl<B: Backend> Stem<B> {
    fn new(in_channels: usize, out_channels: usize, device: &B::Device) -> Self {
        Self {
            conv: conv([in_channels, out_channels], 7, 2, 3, device),
            bn: BatchNormConfig::new(out_channels).init(device),
            relu: Relu::new(),
            pool: MaxPool2dConfig::new([3, 3])
                .with_strides([2, 2])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(x);
        let x = self.bn.forward(x);
        let x = self.relu.forward(x);
        self.pool.forward(x)
    }
}

/// 1x1 projection on the residual path when shape changes
#[derive(Module, Debug)]
pub struct Downsample<B: Backend> {
    pub conv: Conv2d<B>,
    pub bn: BatchNorm<B, 2>,
}

/// 1x1 reduce, 3x3 (strided), 1x1 expand, plus the residual connection
#[derive(Module, Debug)]
pub struct Bottleneck<B: Backend> {
    pub conv1: Conv2d<B>,
    pub bn1: BatchNorm<B, 2>,
    pub conv2: Conv2d<B>,
    pub bn2: BatchNorm<B, 2>,
    pub conv3: Conv2d<B>,
    pub bn3: BatchNorm<B, 2>,
    pub downsample: Option<Downsample<B>>,
    pub relu: Relu,
}

impl<B: Backend> Bottleneck<B> {
    fn new(
        in_channels: usize,
        width: usize,
        out_channels: usize,
        stride: usize,
        device: &B::Device,
    ) -> Self {
        let downsample = (stride != 1 || in_channels != out_channels).then(|| Downsample {
            conv: conv([in_channels, out_channels], 1, stride, 0, device),
            bn: BatchNormConfig::new(out_channels).init(device),
        });

        Self {
            conv1: conv([in_channels, width], 1, 1, 0, device),
            bn1: BatchNormConfig::new(width).init(device),
            conv2: conv([width, width], 3, stride, 1, device),
            bn2: BatchNormConfig::new(width).init(device),
            conv3: conv([width, out_channels], 1, 1, 0, device),
            bn3: BatchNormConfig::new(out_channels).init(device),
            downsample,
            relu: Relu::new(),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let identity = match &self.downsample {
            Some(down) => down.bn.forward(down.conv.forward(x.clone())),
            None => x.clone(),
        };

        let out = self.relu.forward(self.bn1.forward(self.conv1.forward(x)));
        let out = self.relu.forward(self.bn2.forward(self.conv2.forward(out)));
        let out = self.bn3.forward(self.conv3.forward(out));

        self.relu.forward(out + identity)
    }
}

#[derive(Module, Debug)]
pub struct ResNet<B: Backend> {
    pub stem: Stem<B>,
    pub layer1: Vec<Bottleneck<B>>,
    pub layer2: Vec<Bottleneck<B>>,
    pub layer3: Vec<Bottleneck<B>>,
    pub layer4: Vec<Bottleneck<B>>,
    pub pool: AdaptiveAvgPool2d,
    feature_dim: usize,
}

impl<B: Backend> ResNet<B> {
    /// Width of the vectors returned by [`ResNet::features`]
    pub fn feature_dim(&self) -> usize {
        self.feature_dim
    }

    pub fn num_units(&self) -> usize {
        1 + self.blocks().count()
    }

    fn blocks(&self) -> impl Iterator<Item = &Bottleneck<B>> {
        self.layer1
            .iter()
            .chain(&self.layer2)
            .chain(&self.layer3)
            .chain(&self.layer4)
    }

    /// Runs units `from..to` only
    pub fn forward_units(&self, x: Tensor<B, 4>, from: usize, to: usize) -> Tensor<B, 4> {
        let mut x = x;
        if from == 0 && to > 0 {
            x = self.stem.forward(x);
        }
        for (index, block) in self.blocks().enumerate().map(|(i, b)| (i + 1, b)) {
            if index >= from && index < to {
                x = block.forward(x);
            }
        }
        x
    }

    /// Global average pooling, [N, C, H, W] to [N, C]
    pub fn pool_features(&self, x: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self.pool.forward(x);
        let [batch, channels, _, _] = x.dims();
        x.reshape([batch, channels])
    }

    /// Penultimate activations, [N, feature_dim]
    pub fn features(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self.forward_units(images, 0, self.num_units());
        self.pool_features(x)
    }

    /// Marks units before `trainable_from` as not requiring gradients
    pub fn freeze_before(mut self, trainable_from: usize) -> Self {
        if trainable_from > 0 {
            self.stem = self.stem.no_grad();
        }
        let mut index = 1;
        for stage in [
            &mut self.layer1,
            &mut self.layer2,
            &mut self.layer3,
            &mut self.layer4,
        ] {
            let blocks = std::mem::take(stage);
            *stage = blocks
                .into_iter()
                .map(|block| {
                    let frozen = index < trainable_from;
                    index += 1;
                    if frozen {
                        block.no_grad()
                    } else {
                        block
                    }
                })
                .collect();
        }
        self
    }

    /// Loads pretrained weights saved with burn's `CompactRecorder`.
    ///
    /// A missing file is an error, never a silent fallback to random weights.
    pub fn load_pretrained(self, path: &Path, device: &B::Device) -> catdog_core::Result<Self> {
        if !record_exists(path) {
            return Err(Error::NotFound(format!(
                "pretrained weights {}",
                path.display()
            )));
        }
        info!("Loading pretrained backbone from {}", path.display());
        Ok(self.load_file(record_base(path), &CompactRecorder::new(), device)?)
    }
}

/// Extension `CompactRecorder` (named MessagePack) appends to a record path
pub const RECORD_EXTENSION: &str = ".mpk";

/// Whether a `CompactRecorder` file exists, with or without its extension
pub fn record_exists(path: &Path) -> bool {
    record_file(path).is_file()
}

/// The file `CompactRecorder` reads and writes for `path`
pub fn record_file(path: &Path) -> PathBuf {
    let mut file = record_base(path).into_os_string();
    file.push(RECORD_EXTENSION);
    PathBuf::from(file)
}

/// `path` without the recorder extension; the recorder appends it itself
pub fn record_base(path: &Path) -> PathBuf {
    let text = path.to_string_lossy();
    match text.strip_suffix(RECORD_EXTENSION) {
        Some(base) => PathBuf::from(base),
        None => path.to_path_buf(),
    }
}
