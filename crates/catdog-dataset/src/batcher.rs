//! Burn batcher turning [`ImageItem`]s into tensors.

use crate::generator::ImageItem;
use burn::data::dataloader::batcher::Batcher;
use burn::prelude::*;
use catdog_core::ImageDimensions;
use std::path::PathBuf;

#[derive(Clone, Debug)]
pub struct ImageBatch<B: Backend> {
    /// [batch_size, 3, height, width]
    pub images: Tensor<B, 4>,
    /// Binary targets as floats, [batch_size, 1]
    pub targets: Tensor<B, 2>,
    pub labels: Vec<usize>,
    pub paths: Vec<PathBuf>,
}

impl<B: Backend> ImageBatch<B> {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

#[derive(Clone, Debug)]
pub struct ImageBatcher {
    dims: ImageDimensions,
}

impl ImageBatcher {
    pub fn new(dims: ImageDimensions) -> Self {
        Self { dims }
    }
}

impl<B: Backend> Batcher<B, ImageItem, ImageBatch<B>> for ImageBatcher {
    fn batch(&self, items: Vec<ImageItem>, device: &B::Device) -> ImageBatch<B> {
        let batch_size = items.len();
        let (channels, height, width) = (
            self.dims.channels as usize,
            self.dims.height as usize,
            self.dims.width as usize,
        );

        let mut images_data = Vec::with_capacity(batch_size * channels * height * width);
        let mut targets_data = Vec::with_capacity(batch_size);
        let mut labels = Vec::with_capacity(batch_size);
        let mut paths = Vec::with_capacity(batch_size);
        for item in items {
            images_data.extend_from_slice(&item.image);
            targets_data.push(item.label as f32);
            labels.push(item.label);
            paths.push(item.path);
        }

        let images = Tensor::<B, 4>::from_floats(
            TensorData::new(images_data, [batch_size, channels, height, width]),
            device,
        );
        let targets =
            Tensor::<B, 2>::from_floats(TensorData::new(targets_data, [batch_size, 1]), device);

        ImageBatch {
            images,
            targets,
            labels,
            paths,
        }
    }
}
