//! Core type definitions shared across the pipeline.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// An image file on disk with its class label
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageSample {
    /// Path to the image file
    pub path: PathBuf,
    /// Class label (index into the sorted class list)
    pub label: usize,
    /// Class name, i.e. the directory the file lives in
    pub class_name: Option<String>,
}

impl ImageSample {
    pub fn new(path: PathBuf, label: usize) -> Self {
        Self {
            path,
            label,
            class_name: None,
        }
    }

    pub fn with_class_name(path: PathBuf, label: usize, class_name: impl Into<String>) -> Self {
        Self {
            path,
            label,
            class_name: Some(class_name.into()),
        }
    }
}

/// On-disk partition of the dataset
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DataSplit {
    Train,
    Validation,
}

impl DataSplit {
    /// Directory name under the data root
    pub fn dir_name(&self) -> &'static str {
        match self {
            DataSplit::Train => "train",
            DataSplit::Validation => "validation",
        }
    }
}

impl std::fmt::Display for DataSplit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.dir_name())
    }
}

/// Backbone architecture
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ModelArchitecture {
    #[serde(rename = "resnet50")]
    ResNet50,
    #[serde(rename = "resnet101")]
    ResNet101,
    #[serde(rename = "resnet152")]
    ResNet152,
}

impl ModelArchitecture {
    /// Bottleneck blocks per residual stage
    pub fn stage_depths(&self) -> [usize; 4] {
        match self {
            ModelArchitecture::ResNet50 => [3, 4, 6, 3],
            ModelArchitecture::ResNet101 => [3, 4, 23, 3],
            ModelArchitecture::ResNet152 => [3, 8, 36, 3],
        }
    }
}

impl std::fmt::Display for ModelArchitecture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelArchitecture::ResNet50 => write!(f, "resnet50"),
            ModelArchitecture::ResNet101 => write!(f, "resnet101"),
            ModelArchitecture::ResNet152 => write!(f, "resnet152"),
        }
    }
}

impl std::str::FromStr for ModelArchitecture {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "resnet50" => Ok(ModelArchitecture::ResNet50),
            "resnet101" => Ok(ModelArchitecture::ResNet101),
            "resnet152" => Ok(ModelArchitecture::ResNet152),
            other => Err(crate::Error::InvalidArgument(format!(
                "unknown architecture '{other}'"
            ))),
        }
    }
}

/// Image dimensions
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageDimensions {
    pub width: u32,
    pub height: u32,
    pub channels: u32,
}

impl ImageDimensions {
    pub fn new(width: u32, height: u32, channels: u32) -> Self {
        Self {
            width,
            height,
            channels,
        }
    }

    /// Standard ImageNet dimensions (224x224x3)
    pub fn imagenet() -> Self {
        Self::new(224, 224, 3)
    }

    /// Number of values in one CHW image
    pub fn total_values(&self) -> usize {
        (self.width * self.height * self.channels) as usize
    }
}

impl Default for ImageDimensions {
    fn default() -> Self {
        Self::imagenet()
    }
}
