//! Batched image streams over a `<dir>/<class>/<file>` tree.
//!
//! [`ImageDataGenerator`] holds the transform configuration;
//! [`ImageDataGenerator::flow_from_directory`] binds it to a directory and
//! returns a [`DirectoryFlow`], an unbounded iterator of batches that walks
//! the samples epoch after epoch. Shuffling and augmentation are driven by
//! the flow's seed, so two flows built with the same options yield the same
//! batches.

use crate::augmentation::Augmenter;
use crate::loader::ImageLoader;
use crate::preprocess::Preprocessor;
use catdog_core::{AugmentationConfig, Error, ImageConfig, ImageDimensions, ImageSample, Result};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// One decoded, transformed and normalised image
#[derive(Debug, Clone)]
pub struct ImageItem {
    /// Flattened CHW values [3 * H * W]
    pub image: Vec<f32>,
    pub label: usize,
    pub path: PathBuf,
}

/// Per-flow options
#[derive(Debug, Clone)]
pub struct FlowOptions {
    pub batch_size: usize,
    /// Reshuffle the sample order at the start of every epoch
    pub shuffle: bool,
    pub seed: u64,
    /// Restrict the flow to a fixed random subset of this size
    pub max_samples: Option<usize>,
}

impl FlowOptions {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size,
            shuffle: true,
            seed: 42,
            max_samples: None,
        }
    }

    pub fn with_shuffle(mut self, shuffle: bool) -> Self {
        self.shuffle = shuffle;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_max_samples(mut self, max_samples: Option<usize>) -> Self {
        self.max_samples = max_samples;
        self
    }
}

/// Transform configuration shared by every flow it creates
#[derive(Debug, Clone)]
pub struct ImageDataGenerator {
    augmentation: AugmentationConfig,
    image: ImageConfig,
}

impl ImageDataGenerator {
    pub fn new(augmentation: AugmentationConfig, image: ImageConfig) -> Self {
        Self {
            augmentation,
            image,
        }
    }

    /// Resize and normalisation only
    pub fn plain(image: ImageConfig) -> Self {
        Self::new(AugmentationConfig::none(), image)
    }

    pub fn augmentation(&self) -> &AugmentationConfig {
        &self.augmentation
    }

    pub fn flow_from_directory(&self, dir: &Path, options: FlowOptions) -> Result<DirectoryFlow> {
        if options.batch_size == 0 {
            return Err(Error::InvalidArgument("batch_size must be > 0".into()));
        }

        let (classes, mut samples) = ImageLoader::new(dir).load_samples()?;
        if samples.is_empty() {
            return Err(Error::Dataset(format!("no images found in {}", dir.display())));
        }

        if let Some(max) = options.max_samples.filter(|max| *max < samples.len()) {
            let mut rng = ChaCha8Rng::seed_from_u64(options.seed);
            samples.shuffle(&mut rng);
            samples.truncate(max);
            samples.sort_by(|a, b| (a.label, &a.path).cmp(&(b.label, &b.path)));
        }

        info!(
            "Found {} images belonging to {} classes in {}",
            samples.len(),
            classes.len(),
            dir.display()
        );

        let mut flow = DirectoryFlow {
            samples,
            classes,
            batch_size: options.batch_size,
            shuffle: options.shuffle,
            seed: options.seed,
            augmenter: Augmenter::new(self.augmentation.clone()),
            preprocessor: Preprocessor::new(&self.image, self.augmentation.rescale),
            order: Vec::new(),
            cursor: 0,
            epoch: 0,
            item_rng: ChaCha8Rng::seed_from_u64(options.seed),
        };
        flow.reset();
        Ok(flow)
    }
}

/// Unbounded, restartable stream of image batches
pub struct DirectoryFlow {
    samples: Vec<ImageSample>,
    classes: Vec<String>,
    batch_size: usize,
    shuffle: bool,
    seed: u64,
    augmenter: Augmenter,
    preprocessor: Preprocessor,
    order: Vec<usize>,
    cursor: usize,
    epoch: usize,
    item_rng: ChaCha8Rng,
}

impl DirectoryFlow {
    pub fn num_samples(&self) -> usize {
        self.samples.len()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Batches per full pass; the last one may be short
    pub fn steps_per_epoch(&self) -> usize {
        self.samples.len().div_ceil(self.batch_size)
    }

    /// Zero-based index of the epoch the next batch belongs to
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    pub fn class_names(&self) -> &[String] {
        &self.classes
    }

    /// Class name to label
    pub fn class_indices(&self) -> BTreeMap<String, usize> {
        self.classes
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i))
            .collect()
    }

    pub fn samples(&self) -> &[ImageSample] {
        &self.samples
    }

    pub fn image_dimensions(&self) -> ImageDimensions {
        self.preprocessor.dimensions()
    }

    /// Restarts from the first batch of epoch 0
    pub fn reset(&mut self) {
        self.epoch = 0;
        self.item_rng = ChaCha8Rng::seed_from_u64(self.seed);
        self.start_epoch();
    }

    fn start_epoch(&mut self) {
        self.order = (0..self.samples.len()).collect();
        if self.shuffle {
            let mut rng = ChaCha8Rng::seed_from_u64(self.seed.wrapping_add(self.epoch as u64));
            self.order.shuffle(&mut rng);
        }
        self.cursor = 0;
        debug!("Starting epoch {} of {} samples", self.epoch, self.samples.len());
    }

    /// Decodes the next batch, moving on to a new epoch when the current one is exhausted
    pub fn next_batch(&mut self) -> Result<Vec<ImageItem>> {
        if self.cursor >= self.order.len() {
            self.epoch += 1;
            self.start_epoch();
        }

        let end = (self.cursor + self.batch_size).min(self.order.len());
        let indices = self.order[self.cursor..end].to_vec();
        self.cursor = end;

        // Seeds are drawn in batch order so decoding can run in parallel.
        let seeds: Vec<u64> = indices.iter().map(|_| self.item_rng.gen()).collect();

        let flow = &*self;
        indices
            .par_iter()
            .zip(seeds.par_iter())
            .map(|(&index, &seed)| flow.load_item(&flow.samples[index], seed))
            .collect()
    }

    fn load_item(&self, sample: &ImageSample, seed: u64) -> Result<ImageItem> {
        let img = ImageLoader::load_image(&sample.path)?;
        let resized = self.preprocessor.resize(&img);
        let (width, height) = resized.dimensions();

        let mut image = Preprocessor::to_chw(&resized);
        if self.augmenter.is_random() {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            image = self.augmenter.augment(image, width, height, &mut rng);
        }
        self.preprocessor.finish(&mut image);

        Ok(ImageItem {
            image,
            label: sample.label,
            path: sample.path.clone(),
        })
    }
}

impl Iterator for DirectoryFlow {
    type Item = Result<Vec<ImageItem>>;

    fn next(&mut self) -> Option<Self::Item> {
        Some(self.next_batch())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::test_util::create_test_image;
    use catdog_core::Normalization;
    use std::collections::HashSet;
    use tempfile::TempDir;

    fn image_config() -> ImageConfig {
        ImageConfig {
            normalization: Normalization::None,
            size: ImageDimensions::new(8, 8, 3),
        }
    }

    fn dataset(cats: usize, dogs: usize) -> TempDir {
        let dir = TempDir::new().unwrap();
        for i in 0..cats {
            create_test_image(&dir.path().join(format!("cat/cat.{i}.png")), [200, 10, 10]);
        }
        for i in 0..dogs {
            create_test_image(&dir.path().join(format!("dog/dog.{i}.png")), [10, 10, 200]);
        }
        dir
    }

    fn paths(batch: &[ImageItem]) -> Vec<PathBuf> {
        batch.iter().map(|item| item.path.clone()).collect()
    }

    #[test]
    fn test_unshuffled_flow_wraps_epochs() {
        let dir = dataset(3, 2);
        let generator = ImageDataGenerator::plain(image_config());
        let mut flow = generator
            .flow_from_directory(dir.path(), FlowOptions::new(2).with_shuffle(false))
            .unwrap();

        assert_eq!(flow.num_samples(), 5);
        assert_eq!(flow.steps_per_epoch(), 3);
        assert_eq!(flow.class_indices()["dog"], 1);

        let sizes: Vec<usize> = (0..4).map(|_| flow.next_batch().unwrap().len()).collect();
        assert_eq!(sizes, vec![2, 2, 1, 2]);
        assert_eq!(flow.epoch(), 1);

        flow.reset();
        let first = flow.next_batch().unwrap();
        assert_eq!(first[0].path, dir.path().join("cat/cat.0.png"));
        assert_eq!(first[0].label, 0);
        assert_eq!(first[0].image.len(), 3 * 8 * 8);
        assert_eq!(first[0].image[0], 200.0);
    }

    #[test]
    fn test_shuffled_epoch_visits_every_sample_once() {
        let dir = dataset(4, 4);
        let generator = ImageDataGenerator::plain(image_config());
        let mut flow = generator
            .flow_from_directory(dir.path(), FlowOptions::new(3).with_seed(11))
            .unwrap();

        let mut seen = HashSet::new();
        for _ in 0..flow.steps_per_epoch() {
            for item in flow.next_batch().unwrap() {
                assert!(seen.insert(item.path));
            }
        }
        assert_eq!(seen.len(), 8);
    }

    #[test]
    fn test_same_seed_same_batches() {
        let dir = dataset(4, 4);
        let generator = ImageDataGenerator::new(AugmentationConfig::default(), image_config());
        let options = FlowOptions::new(4).with_seed(5);

        let mut a = generator.flow_from_directory(dir.path(), options.clone()).unwrap();
        let mut b = generator.flow_from_directory(dir.path(), options).unwrap();
        for _ in 0..3 {
            let batch_a = a.next_batch().unwrap();
            let batch_b = b.next_batch().unwrap();
            assert_eq!(paths(&batch_a), paths(&batch_b));
            for (x, y) in batch_a.iter().zip(&batch_b) {
                assert_eq!(x.image, y.image);
            }
        }
    }

    #[test]
    fn test_max_samples_keeps_subset() {
        let dir = dataset(6, 6);
        let generator = ImageDataGenerator::plain(image_config());
        let flow = generator
            .flow_from_directory(
                dir.path(),
                FlowOptions::new(4).with_shuffle(false).with_max_samples(Some(5)),
            )
            .unwrap();

        assert_eq!(flow.num_samples(), 5);
        let labels: Vec<usize> = flow.samples().iter().map(|s| s.label).collect();
        let mut sorted = labels.clone();
        sorted.sort();
        assert_eq!(labels, sorted);
    }

    #[test]
    fn test_iterator_is_unbounded() {
        let dir = dataset(1, 1);
        let generator = ImageDataGenerator::plain(image_config());
        let flow = generator
            .flow_from_directory(dir.path(), FlowOptions::new(2))
            .unwrap();
        assert_eq!(flow.take(5).filter(|b| b.is_ok()).count(), 5);
    }

    #[test]
    fn test_empty_directory() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("cat")).unwrap();
        let generator = ImageDataGenerator::plain(image_config());
        let result = generator.flow_from_directory(dir.path(), FlowOptions::new(2));
        assert!(matches!(result, Err(Error::Dataset(_))));
    }
}
