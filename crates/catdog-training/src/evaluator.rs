//! Accuracy on the held-out validation split.

use crate::composed::ComposedModel;
use burn::{
    data::dataloader::batcher::Batcher,
    tensor::{backend::Backend, Tensor},
};
use catdog_core::{Error, Result};
use catdog_dataset::{DirectoryFlow, ImageBatch, ImageBatcher};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::path::PathBuf;
use tracing::info;

/// Model output for one validation image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub path: PathBuf,
    /// Probability of class 1
    pub probability: f32,
    pub label: usize,
}

impl Prediction {
    pub fn predicted_label(&self, threshold: f64) -> usize {
        usize::from(f64::from(self.probability) >= threshold)
    }

    pub fn is_correct(&self, threshold: f64) -> bool {
        self.predicted_label(threshold) == self.label
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub accuracy: f64,
    pub correct: usize,
    pub total: usize,
    pub threshold: f64,
    pub class_names: Vec<String>,
    pub predictions: Vec<Prediction>,
}

impl EvaluationReport {
    pub fn from_predictions(
        predictions: Vec<Prediction>,
        threshold: f64,
        class_names: Vec<String>,
    ) -> Self {
        let total = predictions.len();
        let correct = predictions.iter().filter(|p| p.is_correct(threshold)).count();
        let accuracy = if total == 0 {
            0.0
        } else {
            correct as f64 / total as f64
        };
        Self {
            accuracy,
            correct,
            total,
            threshold,
            class_names,
            predictions,
        }
    }

    /// Wrong predictions, furthest from the threshold first
    pub fn most_confident_mistakes(&self, k: usize) -> Vec<&Prediction> {
        let mut mistakes: Vec<&Prediction> = self
            .predictions
            .iter()
            .filter(|p| !p.is_correct(self.threshold))
            .collect();
        let margin = |p: &Prediction| (f64::from(p.probability) - self.threshold).abs();
        mistakes.sort_by(|a, b| margin(b).partial_cmp(&margin(a)).unwrap_or(Ordering::Equal));
        mistakes.truncate(k);
        mistakes
    }

    /// Correct predictions per true class
    pub fn per_class_accuracy(&self) -> Vec<(String, f64)> {
        self.class_names
            .iter()
            .enumerate()
            .map(|(label, name)| {
                let of_class: Vec<_> = self.predictions.iter().filter(|p| p.label == label).collect();
                let correct = of_class.iter().filter(|p| p.is_correct(self.threshold)).count();
                let accuracy = if of_class.is_empty() {
                    0.0
                } else {
                    correct as f64 / of_class.len() as f64
                };
                (name.clone(), accuracy)
            })
            .collect()
    }
}

pub struct Evaluator {
    threshold: f64,
}

impl Evaluator {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    /// Streams one full epoch of `flow` through `predict`.
    ///
    /// `predict` returns one class-1 probability per image of the batch.
    pub fn evaluate<B, F>(
        &self,
        flow: &mut DirectoryFlow,
        device: &B::Device,
        mut predict: F,
    ) -> Result<EvaluationReport>
    where
        B: Backend,
        F: FnMut(Tensor<B, 4>) -> Result<Vec<f32>>,
    {
        flow.reset();
        let batcher = ImageBatcher::new(flow.image_dimensions());
        let mut predictions = Vec::with_capacity(flow.num_samples());

        for _ in 0..flow.steps_per_epoch() {
            let batch: ImageBatch<B> = batcher.batch(flow.next_batch()?, device);
            let probabilities = predict(batch.images)?;
            if probabilities.len() != batch.labels.len() {
                return Err(Error::shape_mismatch(
                    "predictions per batch",
                    batch.labels.len().to_string(),
                    probabilities.len().to_string(),
                ));
            }

            predictions.extend(
                batch
                    .paths
                    .into_iter()
                    .zip(batch.labels)
                    .zip(probabilities)
                    .map(|((path, label), probability)| Prediction {
                        path,
                        probability,
                        label,
                    }),
            );
        }

        let report =
            EvaluationReport::from_predictions(predictions, self.threshold, flow.class_names().to_vec());
        info!(
            "Validation accuracy: {:.4} ({}/{})",
            report.accuracy, report.correct, report.total
        );
        Ok(report)
    }

    pub fn evaluate_model<B: Backend>(
        &self,
        model: &ComposedModel<B>,
        flow: &mut DirectoryFlow,
        device: &B::Device,
    ) -> Result<EvaluationReport> {
        self.evaluate::<B, _>(flow, device, |images| {
            model
                .predict_proba(images)
                .into_data()
                .to_vec::<f32>()
                .map_err(|e| Error::Model(format!("{e:?}")))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;
    use catdog_core::{ImageConfig, ImageDimensions, Normalization};
    use catdog_dataset::{FlowOptions, ImageDataGenerator};
    use std::path::Path;
    use tempfile::TempDir;

    type TestBackend = NdArray<f32>;

    fn prediction(name: &str, probability: f32, label: usize) -> Prediction {
        Prediction {
            path: PathBuf::from(name),
            probability,
            label,
        }
    }

    fn write_images(dir: &Path, class: &str, count: usize) {
        let class_dir = dir.join(class);
        std::fs::create_dir_all(&class_dir).unwrap();
        for i in 0..count {
            image::RgbImage::from_pixel(8, 8, image::Rgb([i as u8 * 20, 0, 0]))
                .save(class_dir.join(format!("{class}.{i}.png")))
                .unwrap();
        }
    }

    #[test]
    fn test_stubbed_predictions_give_expected_accuracy() {
        let temp_dir = TempDir::new().unwrap();
        write_images(temp_dir.path(), "cat", 2);
        write_images(temp_dir.path(), "dog", 3);

        let image = ImageConfig {
            normalization: Normalization::None,
            size: ImageDimensions::new(8, 8, 3),
        };
        let mut flow = ImageDataGenerator::plain(image)
            .flow_from_directory(temp_dir.path(), FlowOptions::new(2).with_shuffle(false))
            .unwrap();

        // Labels in flow order: cat, cat, dog, dog, dog. The third dog is wrong.
        let mut stub = vec![0.1f32, 0.3, 0.9, 0.7, 0.2].into_iter();
        let report = Evaluator::new(0.5)
            .evaluate::<TestBackend, _>(&mut flow, &Default::default(), |images| {
                let n = images.dims()[0];
                Ok(stub.by_ref().take(n).collect())
            })
            .unwrap();

        assert_eq!(report.total, 5);
        assert_eq!(report.correct, 4);
        assert!((report.accuracy - 0.8).abs() < 1e-12);

        let mistakes = report.most_confident_mistakes(3);
        assert_eq!(mistakes.len(), 1);
        assert!(mistakes[0].path.ends_with("dog/dog.2.png"));
        assert_eq!(report.per_class_accuracy()[0], ("cat".to_string(), 1.0));
    }

    #[test]
    fn test_mistakes_sorted_by_confidence() {
        let report = EvaluationReport::from_predictions(
            vec![
                prediction("a", 0.6, 0),
                prediction("b", 0.95, 0),
                prediction("c", 0.1, 1),
                prediction("d", 0.8, 1),
            ],
            0.5,
            vec!["cat".into(), "dog".into()],
        );

        let names: Vec<_> = report
            .most_confident_mistakes(10)
            .iter()
            .map(|p| p.path.to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, ["b", "c", "a"]);
        assert_eq!(report.most_confident_mistakes(1).len(), 1);
        assert!((report.accuracy - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_report_serializes() {
        let report = EvaluationReport::from_predictions(
            vec![prediction("x.jpg", 0.5, 1)],
            0.5,
            vec!["cat".into(), "dog".into()],
        );
        let json = serde_json::to_string(&report).unwrap();
        let back: EvaluationReport = serde_json::from_str(&json).unwrap();
        assert_eq!(back.correct, 1);
        assert_eq!(back.predictions, report.predictions);
    }

    #[test]
    fn test_empty_flow_report() {
        let report = EvaluationReport::from_predictions(Vec::new(), 0.5, Vec::new());
        assert_eq!(report.accuracy, 0.0);
        assert!(report.most_confident_mistakes(5).is_empty());
    }
}
