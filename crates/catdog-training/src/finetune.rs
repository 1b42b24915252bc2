//! Fine-tuning of the unfrozen suffix and the head on augmented batches.

use crate::composed::ComposedModel;
use crate::loss::{binary_cross_entropy_with_logits, count_correct};
use burn::{
    data::dataloader::batcher::Batcher,
    module::AutodiffModule,
    optim::{momentum::MomentumConfig, GradientsParams, Optimizer, SgdConfig},
    tensor::{activation::sigmoid, backend::AutodiffBackend, backend::Backend, ElementConversion},
};
use catdog_core::{EpochRecord, Error, FinetuneConfig, Result, TrainingHistory};
use catdog_dataset::{DirectoryFlow, ImageBatch, ImageBatcher};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

pub struct FineTuner<B: AutodiffBackend> {
    config: FinetuneConfig,
    device: B::Device,
}

impl<B: AutodiffBackend> FineTuner<B> {
    pub fn new(config: FinetuneConfig, device: B::Device) -> Self {
        Self { config, device }
    }

    /// Trains `model` on `train_flow` with SGD + momentum, validating on
    /// `val_flow` after every epoch.
    ///
    /// The returned model always carries the last epoch's weights, whether
    /// or not validation accuracy improved.
    pub fn fit(
        &self,
        mut model: ComposedModel<B>,
        train_flow: &mut DirectoryFlow,
        val_flow: &mut DirectoryFlow,
    ) -> Result<(ComposedModel<B>, TrainingHistory)> {
        let steps = self
            .config
            .steps_per_epoch
            .unwrap_or_else(|| train_flow.steps_per_epoch());
        let val_steps = self
            .config
            .validation_steps
            .unwrap_or_else(|| val_flow.steps_per_epoch());
        if steps == 0 {
            return Err(Error::Training("fine-tuning needs at least one step per epoch".into()));
        }

        info!(
            "Fine-tuning units [{}, {}) plus head: {} epochs x {} steps, lr={}, momentum={}",
            model.trainable_from(),
            model.backbone.num_units(),
            self.config.epochs,
            steps,
            self.config.learning_rate,
            self.config.momentum
        );

        let mut optimizer = SgdConfig::new()
            .with_momentum(Some(
                MomentumConfig::new()
                    .with_momentum(self.config.momentum)
                    .with_dampening(0.0),
            ))
            .init();
        let batcher = ImageBatcher::new(train_flow.image_dimensions());
        let mut history = TrainingHistory::new();

        for epoch in 0..self.config.epochs {
            let progress = ProgressBar::new(steps as u64);
            progress.set_style(
                ProgressStyle::default_bar()
                    .template("  Epoch {prefix} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                    .map_err(|e| Error::Other(e.to_string()))?
                    .progress_chars("=>-"),
            );
            progress.set_prefix(format!("{}/{}", epoch + 1, self.config.epochs));

            let mut epoch_loss = 0.0f64;
            let mut correct = 0usize;
            let mut seen = 0usize;

            for _ in 0..steps {
                let batch: ImageBatch<B> = batcher.batch(train_flow.next_batch()?, &self.device);
                let labels = float_labels(&batch.labels);

                let logits = model.forward_finetune(batch.images);
                let loss = binary_cross_entropy_with_logits(logits.clone(), batch.targets);
                let loss_value: f64 = loss.clone().into_scalar().elem();

                epoch_loss += loss_value * labels.len() as f64;
                correct += count_correct(&probabilities(logits)?, &labels, 0.5);
                seen += labels.len();

                let grads = GradientsParams::from_grads(loss.backward(), &model);
                model = optimizer.step(self.config.learning_rate, model, grads);

                progress.set_message(format!("loss={loss_value:.4}"));
                progress.inc(1);
            }
            progress.finish_and_clear();

            val_flow.reset();
            let (val_loss, val_accuracy) = validate(&model.valid(), val_flow, val_steps)?;

            let record = EpochRecord {
                epoch: epoch + 1,
                train_loss: epoch_loss / seen.max(1) as f64,
                train_accuracy: correct as f64 / seen.max(1) as f64,
                val_loss,
                val_accuracy,
                learning_rate: self.config.learning_rate,
            };
            info!(
                "Fine-tune epoch {}/{}: loss={:.4} acc={:.4} val_loss={:.4} val_acc={:.4}",
                record.epoch,
                self.config.epochs,
                record.train_loss,
                record.train_accuracy,
                record.val_loss,
                record.val_accuracy
            );
            history.add_epoch(record);
        }

        if let Some(delta) = history.val_accuracy_delta() {
            if delta < 0.0 {
                warn!(
                    "Validation accuracy dropped by {:.4} during fine-tuning; keeping the final weights",
                    -delta
                );
            }
        }

        Ok((model, history))
    }
}

/// Mean loss and accuracy over `steps` batches of `flow`
pub fn validate<B: Backend>(
    model: &ComposedModel<B>,
    flow: &mut DirectoryFlow,
    steps: usize,
) -> Result<(f64, f64)> {
    let device = model.head.linear.weight.device();
    let batcher = ImageBatcher::new(flow.image_dimensions());
    let mut total_loss = 0.0f64;
    let mut correct = 0usize;
    let mut seen = 0usize;

    for _ in 0..steps {
        let batch: ImageBatch<B> = batcher.batch(flow.next_batch()?, &device);
        let labels = float_labels(&batch.labels);
        let logits = model.forward(batch.images);
        let loss: f64 = binary_cross_entropy_with_logits(logits.clone(), batch.targets)
            .into_scalar()
            .elem();

        total_loss += loss * labels.len() as f64;
        correct += count_correct(&probabilities(logits)?, &labels, 0.5);
        seen += labels.len();
    }

    if seen == 0 {
        return Ok((0.0, 0.0));
    }
    Ok((total_loss / seen as f64, correct as f64 / seen as f64))
}

fn float_labels(labels: &[usize]) -> Vec<f32> {
    labels.iter().map(|l| *l as f32).collect()
}

fn probabilities<B: Backend>(logits: burn::tensor::Tensor<B, 2>) -> Result<Vec<f32>> {
    sigmoid(logits)
        .into_data()
        .to_vec::<f32>()
        .map_err(|e| Error::Training(format!("{e:?}")))
}
