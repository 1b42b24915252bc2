//! Backbone feature extraction and the on-disk feature cache.
//!
//! Extraction runs one full pass of a non-augmenting flow through the frozen
//! backbone and keeps the pooled penultimate activations alongside the
//! labels. The cache stores them as two safetensors files so later runs
//! skip the expensive forward passes; loading checks both files against
//! each other and against the current backbone's feature width. A JSON
//! sidecar records what produced the cache, and a cache written under
//! different extraction settings is re-extracted instead of reused.

use crate::backbone::ResNet;
use burn::data::dataloader::batcher::Batcher;
use burn::prelude::*;
use catdog_core::{Error, ModelArchitecture, Result};
use catdog_dataset::{DirectoryFlow, ImageBatch, ImageBatcher};
use indicatif::{ProgressBar, ProgressStyle};
use rand::seq::SliceRandom;
use rand::Rng;
use safetensors::tensor::{Dtype, TensorView};
use safetensors::SafeTensors;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const FEATURES_FILE: &str = "features_train.safetensors";
pub const LABELS_FILE: &str = "labels_train.safetensors";
pub const CACHE_KEY_FILE: &str = "features_train.json";
const TENSOR_NAME: &str = "data";

/// Embeddings [N, D] and labels [N], row-aligned
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureSet {
    features: Vec<f32>,
    labels: Vec<f32>,
    dim: usize,
}

impl FeatureSet {
    pub fn new(features: Vec<f32>, labels: Vec<f32>, dim: usize) -> Result<Self> {
        if dim == 0 || features.len() % dim != 0 {
            return Err(Error::shape_mismatch(
                "feature matrix",
                format!("a multiple of D={dim}"),
                format!("{} values", features.len()),
            ));
        }
        if features.len() / dim != labels.len() {
            return Err(Error::shape_mismatch(
                "feature rows vs labels",
                format!("N={}", features.len() / dim),
                format!("N={}", labels.len()),
            ));
        }
        Ok(Self {
            features,
            labels,
            dim,
        })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// (N, D)
    pub fn shape(&self) -> (usize, usize) {
        (self.len(), self.dim)
    }

    pub fn features(&self) -> &[f32] {
        &self.features
    }

    pub fn labels(&self) -> &[f32] {
        &self.labels
    }

    pub fn row(&self, index: usize) -> &[f32] {
        &self.features[index * self.dim..(index + 1) * self.dim]
    }

    /// Splits off the trailing `fraction` of rows, like a Keras `validation_split`
    pub fn split_tail(&self, fraction: f64) -> (FeatureSet, FeatureSet) {
        let held_out = ((self.len() as f64) * fraction).round() as usize;
        let held_out = held_out.min(self.len());
        let cut = self.len() - held_out;

        let head = FeatureSet {
            features: self.features[..cut * self.dim].to_vec(),
            labels: self.labels[..cut].to_vec(),
            dim: self.dim,
        };
        let tail = FeatureSet {
            features: self.features[cut * self.dim..].to_vec(),
            labels: self.labels[cut..].to_vec(),
            dim: self.dim,
        };
        (head, tail)
    }

    /// The same rows in a random order
    pub fn shuffled<R: Rng>(&self, rng: &mut R) -> FeatureSet {
        let mut indices: Vec<usize> = (0..self.len()).collect();
        indices.shuffle(rng);
        self.select(&indices)
    }

    /// A new set holding `indices` in that order
    pub fn select(&self, indices: &[usize]) -> FeatureSet {
        let mut features = Vec::with_capacity(indices.len() * self.dim);
        for &i in indices {
            features.extend_from_slice(self.row(i));
        }
        FeatureSet {
            features,
            labels: indices.iter().map(|&i| self.labels[i]).collect(),
            dim: self.dim,
        }
    }

    /// Selected rows as tensors, [k, D] and [k, 1]
    pub fn to_tensors<B: Backend>(
        &self,
        indices: &[usize],
        device: &B::Device,
    ) -> (Tensor<B, 2>, Tensor<B, 2>) {
        let mut features = Vec::with_capacity(indices.len() * self.dim);
        let mut labels = Vec::with_capacity(indices.len());
        for &i in indices {
            features.extend_from_slice(self.row(i));
            labels.push(self.labels[i]);
        }
        (
            Tensor::from_floats(TensorData::new(features, [indices.len(), self.dim]), device),
            Tensor::from_floats(TensorData::new(labels, [indices.len(), 1]), device),
        )
    }

    /// Accuracy of always predicting the most frequent label
    pub fn majority_baseline(&self) -> f64 {
        if self.is_empty() {
            return 0.0;
        }
        let positives = self.labels.iter().filter(|y| **y >= 0.5).count();
        positives.max(self.len() - positives) as f64 / self.len() as f64
    }
}

/// Runs images through a backbone and collects pooled features
pub struct FeatureExtractor<'a, B: Backend> {
    backbone: &'a ResNet<B>,
    device: B::Device,
}

impl<'a, B: Backend> FeatureExtractor<'a, B> {
    pub fn new(backbone: &'a ResNet<B>, device: B::Device) -> Self {
        Self { backbone, device }
    }

    /// One full pass over `flow`, from its first batch
    pub fn extract(&self, flow: &mut DirectoryFlow) -> Result<FeatureSet> {
        flow.reset();
        let steps = flow.steps_per_epoch();
        let dim = self.backbone.feature_dim();
        let batcher = ImageBatcher::new(flow.image_dimensions());

        let progress = ProgressBar::new(flow.num_samples() as u64);
        progress.set_style(
            ProgressStyle::default_bar()
                .template("  Extracting [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
                .map_err(|e| Error::Other(e.to_string()))?
                .progress_chars("=>-"),
        );

        let mut features = Vec::with_capacity(flow.num_samples() * dim);
        let mut labels = Vec::with_capacity(flow.num_samples());

        for _ in 0..steps {
            let items = flow.next_batch()?;
            let count = items.len();
            let batch: ImageBatch<B> = batcher.batch(items, &self.device);

            let output = self.backbone.features(batch.images);
            let [rows, cols] = output.dims();
            if rows != count || cols != dim {
                return Err(Error::shape_mismatch(
                    "backbone output",
                    format!("[{count}, {dim}]"),
                    format!("[{rows}, {cols}]"),
                ));
            }

            let values = output
                .into_data()
                .to_vec::<f32>()
                .map_err(|e| Error::Model(format!("{e:?}")))?;
            features.extend(values);
            labels.extend(batch.labels.iter().map(|l| *l as f32));
            progress.inc(count as u64);
        }
        progress.finish_and_clear();

        let set = FeatureSet::new(features, labels, dim)?;
        info!("Extracted features of shape {:?}", set.shape());
        Ok(set)
    }
}

/// Settings a cached feature matrix depends on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheKey {
    pub architecture: ModelArchitecture,
    /// Pretrained record, `None` for a randomly initialised backbone
    pub weights: Option<PathBuf>,
    pub max_images: Option<usize>,
    pub shuffle: bool,
    pub seed: u64,
}

/// `features_train` / `labels_train` safetensors files in one directory
#[derive(Debug, Clone)]
pub struct FeatureCache {
    dir: PathBuf,
    key: Option<CacheKey>,
}

impl FeatureCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            key: None,
        }
    }

    /// Only reuse a cache written with the same `key`
    pub fn with_key(mut self, key: CacheKey) -> Self {
        self.key = Some(key);
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn key_path(&self) -> PathBuf {
        self.dir.join(CACHE_KEY_FILE)
    }

    pub fn features_path(&self) -> PathBuf {
        self.dir.join(FEATURES_FILE)
    }

    pub fn labels_path(&self) -> PathBuf {
        self.dir.join(LABELS_FILE)
    }

    pub fn exists(&self) -> bool {
        self.features_path().is_file() && self.labels_path().is_file()
    }

    /// Both files exist and were written with this cache's key
    pub fn is_current(&self) -> bool {
        if !self.exists() {
            return false;
        }
        let Some(key) = &self.key else {
            return true;
        };
        match self.stored_key() {
            Ok(stored) => stored == *key,
            Err(e) => {
                debug!("Unreadable cache key in {}: {e}", self.dir.display());
                false
            }
        }
    }

    /// Key recorded by the last [`FeatureCache::save`]
    pub fn stored_key(&self) -> Result<CacheKey> {
        let path = self.key_path();
        if !path.is_file() {
            return Err(Error::NotFound(format!("feature cache key {}", path.display())));
        }
        Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
    }

    pub fn save(&self, set: &FeatureSet) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        write_f32_tensor(&self.features_path(), set.features(), vec![set.len(), set.dim()])?;
        write_f32_tensor(&self.labels_path(), set.labels(), vec![set.len()])?;
        match &self.key {
            Some(key) => fs::write(self.key_path(), serde_json::to_string_pretty(key)?)?,
            None if self.key_path().is_file() => fs::remove_file(self.key_path())?,
            None => {}
        }
        info!("Cached {:?} features in {}", set.shape(), self.dir.display());
        Ok(())
    }

    /// Loads the cache, failing fast when the stored width differs from
    /// `expected_dim` or the two files disagree on N.
    pub fn load(&self, expected_dim: usize) -> Result<FeatureSet> {
        let (features, feature_shape) = read_f32_tensor(&self.features_path())?;
        let (labels, label_shape) = read_f32_tensor(&self.labels_path())?;

        let [n, dim] = feature_shape[..] else {
            return Err(Error::shape_mismatch(
                FEATURES_FILE,
                "rank 2 (N, D)",
                format!("{feature_shape:?}"),
            ));
        };
        if dim != expected_dim {
            return Err(Error::shape_mismatch(
                FEATURES_FILE,
                format!("D={expected_dim} (current backbone)"),
                format!("D={dim}"),
            ));
        }
        if label_shape != [n] {
            return Err(Error::shape_mismatch(
                LABELS_FILE,
                format!("[{n}]"),
                format!("{label_shape:?}"),
            ));
        }

        FeatureSet::new(features, labels, dim)
    }
}

fn write_f32_tensor(path: &Path, values: &[f32], shape: Vec<usize>) -> Result<()> {
    let bytes: &[u8] = bytemuck::cast_slice(values);
    let view = TensorView::new(Dtype::F32, shape, bytes)?;
    let serialized = safetensors::serialize(vec![(TENSOR_NAME, view)], None)?;
    fs::write(path, serialized)?;
    Ok(())
}

fn read_f32_tensor(path: &Path) -> Result<(Vec<f32>, Vec<usize>)> {
    if !path.is_file() {
        return Err(Error::NotFound(format!("feature cache {}", path.display())));
    }
    let bytes = fs::read(path)?;
    let tensors = SafeTensors::deserialize(&bytes)?;
    let view = tensors.tensor(TENSOR_NAME)?;
    if view.dtype() != Dtype::F32 {
        return Err(Error::Serialization(format!(
            "{} holds {:?}, expected F32",
            path.display(),
            view.dtype()
        )));
    }

    let values = view
        .data()
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();
    Ok((values, view.shape().to_vec()))
}

/// Reuses the cache when present, otherwise extracts and writes it
pub fn extract_or_load<B: Backend>(
    cache: &FeatureCache,
    backbone: &ResNet<B>,
    flow: &mut DirectoryFlow,
    device: &B::Device,
) -> Result<FeatureSet> {
    extract_or_load_with(cache, backbone.feature_dim(), flow, device, || {
        Ok(backbone.clone())
    })
}

/// Like [`extract_or_load`], building the backbone only when the cache
/// cannot be reused
pub fn extract_or_load_with<B, F>(
    cache: &FeatureCache,
    feature_dim: usize,
    flow: &mut DirectoryFlow,
    device: &B::Device,
    backbone: F,
) -> Result<FeatureSet>
where
    B: Backend,
    F: FnOnce() -> Result<ResNet<B>>,
{
    if cache.is_current() {
        info!("Using cached features from {}", cache.dir.display());
        return cache.load(feature_dim);
    }
    if cache.exists() {
        warn!(
            "Feature cache in {} was written with different settings, re-extracting",
            cache.dir.display()
        );
    } else if cache.features_path().is_file() != cache.labels_path().is_file() {
        warn!("Incomplete feature cache in {}, re-extracting", cache.dir.display());
    }

    let backbone = backbone()?;
    let set = FeatureExtractor::new(&backbone, device.clone()).extract(flow)?;
    cache.save(&set)?;
    Ok(set)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backbone::ResNetConfig;
    use burn_ndarray::NdArray;
    use catdog_core::{ImageConfig, ImageDimensions, Normalization};
    use catdog_dataset::{FlowOptions, ImageDataGenerator};
    use rand::SeedableRng;
    use tempfile::TempDir;

    type TestBackend = NdArray<f32>;

    fn write_image(path: &Path, rgb: [u8; 3]) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        image::ImageBuffer::from_fn(40, 40, |x, y| {
            image::Rgb([rgb[0], rgb[1].wrapping_add((x + y) as u8), rgb[2]])
        })
        .save(path)
        .unwrap();
    }

    fn flow(dir: &Path) -> DirectoryFlow {
        for i in 0..3 {
            write_image(&dir.join(format!("cat/cat.{i}.png")), [220, 30, 30]);
            write_image(&dir.join(format!("dog/dog.{i}.png")), [30, 30, 220]);
        }
        let image = ImageConfig {
            normalization: Normalization::Caffe,
            size: ImageDimensions::new(32, 32, 3),
        };
        ImageDataGenerator::plain(image)
            .flow_from_directory(dir, FlowOptions::new(4).with_shuffle(false))
            .unwrap()
    }

    #[test]
    fn test_extract_shape_and_determinism() {
        let temp_dir = TempDir::new().unwrap();
        let mut flow = flow(temp_dir.path());
        let device = Default::default();
        let backbone: ResNet<TestBackend> = ResNetConfig::tiny().init(&device);

        let extractor = FeatureExtractor::new(&backbone, device);
        let first = extractor.extract(&mut flow).unwrap();
        assert_eq!(first.shape(), (6, 128));
        assert_eq!(first.labels(), &[0.0, 0.0, 0.0, 1.0, 1.0, 1.0]);

        // Advance the flow; extraction restarts from the first batch.
        flow.next_batch().unwrap();
        let second = extractor.extract(&mut flow).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_cache_roundtrip_and_reuse() {
        let temp_dir = TempDir::new().unwrap();
        let mut flow = flow(&temp_dir.path().join("train"));
        let cache = FeatureCache::new(temp_dir.path().join("cache"));
        let device = Default::default();
        let backbone: ResNet<TestBackend> = ResNetConfig::tiny().init(&device);

        assert!(!cache.exists());
        let extracted = extract_or_load(&cache, &backbone, &mut flow, &device).unwrap();
        assert!(cache.exists());

        let loaded = extract_or_load(&cache, &backbone, &mut flow, &device).unwrap();
        assert_eq!(extracted, loaded);
    }

    #[test]
    fn test_cache_dimension_mismatch_fails_fast() {
        let temp_dir = TempDir::new().unwrap();
        let cache = FeatureCache::new(temp_dir.path());
        let set = FeatureSet::new(vec![0.5; 3 * 512], vec![0.0, 1.0, 1.0], 512).unwrap();
        cache.save(&set).unwrap();

        assert_eq!(cache.load(512).unwrap(), set);
        let err = cache.load(2048).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { .. }), "{err}");
    }

    #[test]
    fn test_cache_row_count_mismatch() {
        let temp_dir = TempDir::new().unwrap();
        let cache = FeatureCache::new(temp_dir.path());
        write_f32_tensor(&cache.features_path(), &[0.0; 8], vec![2, 4]).unwrap();
        write_f32_tensor(&cache.labels_path(), &[0.0; 3], vec![3]).unwrap();

        assert!(matches!(cache.load(4), Err(Error::ShapeMismatch { .. })));
    }

    fn key(max_images: Option<usize>) -> CacheKey {
        CacheKey {
            architecture: ModelArchitecture::ResNet50,
            weights: Some(PathBuf::from("weights/resnet50")),
            max_images,
            shuffle: false,
            seed: 42,
        }
    }

    #[test]
    fn test_cache_with_other_key_is_re_extracted() {
        let temp_dir = TempDir::new().unwrap();
        let mut flow = flow(&temp_dir.path().join("train"));
        let device = Default::default();
        let backbone: ResNet<TestBackend> = ResNetConfig::tiny().init(&device);

        // A stale cache with one row and the right width.
        let stale = FeatureSet::new(vec![0.0; 128], vec![1.0], 128).unwrap();
        let dir = temp_dir.path().join("cache");
        FeatureCache::new(&dir).with_key(key(Some(1))).save(&stale).unwrap();

        let cache = FeatureCache::new(&dir).with_key(key(None));
        assert!(cache.exists());
        assert!(!cache.is_current());

        let set = extract_or_load(&cache, &backbone, &mut flow, &device).unwrap();
        assert_eq!(set.len(), 6);
        assert_eq!(cache.stored_key().unwrap(), key(None));
        assert!(cache.is_current());

        let mut built = false;
        let reused = extract_or_load_with(&cache, 128, &mut flow, &device, || {
            built = true;
            Ok(backbone.clone())
        })
        .unwrap();
        assert!(!built);
        assert_eq!(reused, set);
    }

    #[test]
    fn test_cache_without_key_file_is_stale() {
        let temp_dir = TempDir::new().unwrap();
        let set = FeatureSet::new(vec![0.5; 4], vec![0.0, 1.0], 2).unwrap();
        FeatureCache::new(temp_dir.path()).save(&set).unwrap();

        assert!(FeatureCache::new(temp_dir.path()).is_current());
        assert!(!FeatureCache::new(temp_dir.path()).with_key(key(None)).is_current());
    }

    #[test]
    fn test_shuffled_keeps_rows_aligned() {
        let labels = vec![0.0, 0.0, 0.0, 1.0, 1.0, 1.0];
        let features: Vec<f32> = labels.iter().flat_map(|y| [*y, *y * 10.0]).collect();
        let set = FeatureSet::new(features, labels, 2).unwrap();

        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(7);
        let shuffled = set.shuffled(&mut rng);
        assert_eq!(shuffled.len(), 6);
        for i in 0..shuffled.len() {
            let y = shuffled.labels()[i];
            assert_eq!(shuffled.row(i), &[y, y * 10.0]);
        }
        assert_eq!(shuffled.majority_baseline(), set.majority_baseline());
    }

    #[test]
    fn test_split_tail_and_baseline() {
        let labels = vec![0.0, 0.0, 0.0, 1.0, 1.0, 0.0, 1.0, 1.0, 0.0, 1.0];
        let features: Vec<f32> = (0..20).map(|v| v as f32).collect();
        let set = FeatureSet::new(features, labels, 2).unwrap();

        let (train, held_out) = set.split_tail(0.2);
        assert_eq!(train.len(), 8);
        assert_eq!(held_out.len(), 2);
        assert_eq!(held_out.row(0), &[16.0, 17.0]);
        assert_eq!(set.majority_baseline(), 0.5);

        assert!(FeatureSet::new(vec![0.0; 5], vec![0.0], 2).is_err());
        assert!(FeatureSet::new(vec![0.0; 4], vec![0.0], 2).is_err());
    }
}
