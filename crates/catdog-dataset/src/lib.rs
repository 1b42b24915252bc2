//! Dataset handling for the cats-vs-dogs pipeline.
//!
//! - [`organizer`]: archive extraction, per-class folders, validation carve-out
//! - [`generator`]: seeded, augmenting batch streams over a class directory tree
//! - [`batcher`]: burn batcher from decoded items to tensors

pub mod augmentation;
pub mod batcher;
pub mod generator;
pub mod loader;
pub mod organizer;
pub mod preprocess;
pub mod statistics;

pub use augmentation::{Augmenter, TransformParams};
pub use batcher::{ImageBatch, ImageBatcher};
pub use generator::{DirectoryFlow, FlowOptions, ImageDataGenerator, ImageItem};
pub use loader::ImageLoader;
pub use organizer::{DatasetOrganizer, OrganizeReport};
pub use preprocess::{NormalizationExt, Preprocessor};
pub use statistics::{DatasetStatistics, SplitStatistics};
