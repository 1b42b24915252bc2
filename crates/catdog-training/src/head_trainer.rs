//! Trains the dense head on cached backbone features.
//!
//! Cached rows arrive in class order, so they are shuffled once with the
//! seed before the trailing `validation_fraction` is held out. The rest is
//! reshuffled every epoch and fed to Adam in mini-batches. Each epoch logs train loss/accuracy and validation
//! loss/accuracy.

use crate::features::FeatureSet;
use crate::head::{BinaryHead, BinaryHeadConfig};
use crate::loss::{binary_cross_entropy_with_logits, count_correct};
use burn::{
    module::AutodiffModule,
    optim::{AdamConfig, GradientsParams, Optimizer},
    tensor::{backend::AutodiffBackend, backend::Backend, ElementConversion},
};
use catdog_core::{EpochRecord, Error, HeadConfig, Result, TrainingHistory};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::{debug, info};

pub struct HeadTrainer<B: AutodiffBackend> {
    config: HeadConfig,
    seed: u64,
    device: B::Device,
}

impl<B: AutodiffBackend> HeadTrainer<B> {
    pub fn new(config: HeadConfig, seed: u64, device: B::Device) -> Self {
        Self {
            config,
            seed,
            device,
        }
    }

    /// Fits a freshly initialised head
    pub fn fit(&self, features: &FeatureSet) -> Result<(BinaryHead<B>, TrainingHistory)> {
        let head = BinaryHeadConfig::new(features.dim()).init(&self.device);
        self.fit_from(head, features)
    }

    /// Continues training `head` on `features`
    pub fn fit_from(
        &self,
        mut head: BinaryHead<B>,
        features: &FeatureSet,
    ) -> Result<(BinaryHead<B>, TrainingHistory)> {
        if head.input_dim() != features.dim() {
            return Err(Error::shape_mismatch(
                "head input",
                format!("D={}", head.input_dim()),
                format!("D={}", features.dim()),
            ));
        }

        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        let (train, validation) = features
            .shuffled(&mut rng)
            .split_tail(self.config.validation_fraction);
        if train.is_empty() {
            return Err(Error::Training(format!(
                "no training rows left after holding out {:.0}% of {}",
                self.config.validation_fraction * 100.0,
                features.len()
            )));
        }
        info!(
            "Training head on {} rows, validating on {} (D={})",
            train.len(),
            validation.len(),
            train.dim()
        );
        info!(
            "Majority baseline: train={:.4} validation={:.4}",
            train.majority_baseline(),
            validation.majority_baseline()
        );

        let batch_size = self.config.batch_size.max(1);
        let mut optimizer = AdamConfig::new().init();
        let mut history = TrainingHistory::new();

        for epoch in 0..self.config.epochs {
            let mut indices: Vec<usize> = (0..train.len()).collect();
            indices.shuffle(&mut rng);

            let mut epoch_loss = 0.0f64;
            let mut correct = 0usize;

            for chunk in indices.chunks(batch_size) {
                let (x, y) = train.to_tensors::<B>(chunk, &self.device);
                let logits = head.forward(x);
                let loss = binary_cross_entropy_with_logits(logits.clone(), y);

                let loss_value: f64 = loss.clone().into_scalar().elem();
                epoch_loss += loss_value * chunk.len() as f64;
                correct += batch_correct(logits, chunk, &train, 0.5)?;

                let grads = loss.backward();
                let grads = GradientsParams::from_grads(grads, &head);
                head = optimizer.step(self.config.learning_rate, head, grads);
            }

            let (val_loss, val_accuracy) = evaluate_head(&head.valid(), &validation, batch_size)?;
            let record = EpochRecord {
                epoch: epoch + 1,
                train_loss: epoch_loss / train.len() as f64,
                train_accuracy: correct as f64 / train.len() as f64,
                val_loss,
                val_accuracy,
                learning_rate: self.config.learning_rate,
            };
            info!(
                "Head epoch {}/{}: loss={:.4} acc={:.4} val_loss={:.4} val_acc={:.4}",
                record.epoch,
                self.config.epochs,
                record.train_loss,
                record.train_accuracy,
                record.val_loss,
                record.val_accuracy
            );
            history.add_epoch(record);
        }

        Ok((head, history))
    }
}

fn batch_correct<B: Backend>(
    logits: burn::tensor::Tensor<B, 2>,
    rows: &[usize],
    set: &FeatureSet,
    threshold: f64,
) -> Result<usize> {
    let probs = burn::tensor::activation::sigmoid(logits)
        .into_data()
        .to_vec::<f32>()
        .map_err(|e| Error::Training(format!("{e:?}")))?;
    let labels: Vec<f32> = rows.iter().map(|&i| set.labels()[i]).collect();
    Ok(count_correct(&probs, &labels, threshold))
}

/// Mean loss and accuracy of `head` over every row of `set`.
///
/// An empty set yields `(0.0, 0.0)`.
pub fn evaluate_head<B: Backend>(
    head: &BinaryHead<B>,
    set: &FeatureSet,
    batch_size: usize,
) -> Result<(f64, f64)> {
    if set.is_empty() {
        debug!("Empty validation set, skipping head evaluation");
        return Ok((0.0, 0.0));
    }

    let device = head.linear.weight.device();
    let indices: Vec<usize> = (0..set.len()).collect();
    let mut total_loss = 0.0f64;
    let mut correct = 0usize;

    for chunk in indices.chunks(batch_size.max(1)) {
        let (x, y) = set.to_tensors::<B>(chunk, &device);
        let logits = head.forward(x);
        let loss: f64 = binary_cross_entropy_with_logits(logits.clone(), y)
            .into_scalar()
            .elem();
        total_loss += loss * chunk.len() as f64;
        correct += batch_correct(logits, chunk, set, 0.5)?;
    }

    Ok((
        total_loss / set.len() as f64,
        correct as f64 / set.len() as f64,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::Autodiff;
    use burn_ndarray::NdArray;

    type TestBackend = Autodiff<NdArray<f32>>;

    /// Classes split on the sign of the first coordinate, 30% positive
    fn separable(n: usize, dim: usize) -> FeatureSet {
        let mut features = Vec::with_capacity(n * dim);
        let mut labels = Vec::with_capacity(n);
        for i in 0..n {
            let positive = i % 10 < 3;
            let sign = if positive { 1.0 } else { -1.0 };
            for d in 0..dim {
                let jitter = ((i * 7 + d * 3) % 11) as f32 / 11.0 - 0.5;
                let value = if d == 0 { sign * 2.0 + jitter * 0.5 } else { jitter };
                features.push(value);
            }
            labels.push(if positive { 1.0 } else { 0.0 });
        }
        FeatureSet::new(features, labels, dim).unwrap()
    }

    fn config() -> HeadConfig {
        HeadConfig {
            learning_rate: 0.05,
            epochs: 15,
            batch_size: 16,
            validation_fraction: 0.2,
        }
    }

    /// Rows ordered by class, the way extraction emits them
    fn class_sorted(n: usize, dim: usize) -> FeatureSet {
        let set = separable(n, dim);
        let mut order: Vec<usize> = (0..n).collect();
        order.sort_by(|a, b| set.labels()[*a].total_cmp(&set.labels()[*b]));
        set.select(&order)
    }

    fn held_out(set: &FeatureSet, fraction: f64) -> FeatureSet {
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        set.shuffled(&mut rng).split_tail(fraction).1
    }

    #[test]
    fn test_head_beats_majority_baseline() {
        let set = separable(200, 8);
        let baseline = held_out(&set, 0.2).majority_baseline();

        let trainer = HeadTrainer::<TestBackend>::new(config(), 42, Default::default());
        let (_, history) = trainer.fit(&set).unwrap();

        assert_eq!(history.len(), 15);
        let last = history.last().unwrap();
        assert!(
            last.val_accuracy > baseline,
            "val acc {} vs baseline {}",
            last.val_accuracy,
            baseline
        );
        assert!(last.train_loss < history.epochs[0].train_loss);
    }

    #[test]
    fn test_class_sorted_rows_hold_out_both_classes() {
        let set = class_sorted(200, 8);
        assert_eq!(set.split_tail(0.2).1.majority_baseline(), 1.0);

        let validation = held_out(&set, 0.2);
        assert_eq!(validation.len(), 40);
        let baseline = validation.majority_baseline();
        assert!(baseline < 1.0, "held-out split has a single class");

        let trainer = HeadTrainer::<TestBackend>::new(config(), 42, Default::default());
        let (_, history) = trainer.fit(&set).unwrap();
        let last = history.last().unwrap();
        assert!(
            last.val_accuracy > baseline,
            "val acc {} vs baseline {}",
            last.val_accuracy,
            baseline
        );
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let set = separable(20, 4);
        let trainer = HeadTrainer::<TestBackend>::new(config(), 1, Default::default());
        let head = BinaryHeadConfig::new(8).init(&Default::default());
        assert!(matches!(
            trainer.fit_from(head, &set),
            Err(Error::ShapeMismatch { .. })
        ));
    }
}
