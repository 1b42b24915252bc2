//! Binary cross-entropy and thresholded accuracy.

use burn::tensor::{activation::log_sigmoid, backend::Backend, Tensor};

/// Mean binary cross-entropy on logits, numerically stable for large |z|.
///
/// `-(y * log(sigmoid(z)) + (1 - y) * log(sigmoid(-z)))`
pub fn binary_cross_entropy_with_logits<B: Backend>(
    logits: Tensor<B, 2>,
    targets: Tensor<B, 2>,
) -> Tensor<B, 1> {
    let log_p = log_sigmoid(logits.clone());
    let log_not_p = log_sigmoid(logits.neg());
    let not_targets = targets.clone().neg().add_scalar(1.0);

    (targets.mul(log_p) + not_targets.mul(log_not_p)).mean().neg()
}

/// Predictions at or above `threshold` count as class 1
pub fn count_correct(probabilities: &[f32], labels: &[f32], threshold: f64) -> usize {
    probabilities
        .iter()
        .zip(labels)
        .filter(|(p, y)| (f64::from(**p) >= threshold) == (**y >= 0.5))
        .count()
}
