//! Per-epoch training history.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Metrics recorded at the end of one epoch
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct EpochRecord {
    /// 1-based epoch number
    pub epoch: usize,
    pub train_loss: f64,
    pub train_accuracy: f64,
    pub val_loss: f64,
    pub val_accuracy: f64,
    pub learning_rate: f64,
}

/// Loss/accuracy history of one training run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainingHistory {
    pub epochs: Vec<EpochRecord>,
}

impl TrainingHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_epoch(&mut self, record: EpochRecord) {
        self.epochs.push(record);
    }

    pub fn len(&self) -> usize {
        self.epochs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.epochs.is_empty()
    }

    pub fn last(&self) -> Option<&EpochRecord> {
        self.epochs.last()
    }

    /// Gets the best validation accuracy
    pub fn best_val_accuracy(&self) -> Option<f64> {
        self.best_record().map(|r| r.val_accuracy)
    }

    /// Gets the epoch with best validation accuracy (first one on ties)
    pub fn best_epoch(&self) -> Option<usize> {
        self.best_record().map(|r| r.epoch)
    }

    fn best_record(&self) -> Option<&EpochRecord> {
        self.epochs.iter().fold(None, |best: Option<&EpochRecord>, r| match best {
            Some(b)
                if b.val_accuracy.partial_cmp(&r.val_accuracy).unwrap_or(Ordering::Equal)
                    != Ordering::Less =>
            {
                Some(b)
            }
            _ => Some(r),
        })
    }

    /// Change in validation accuracy from the first to the last epoch
    pub fn val_accuracy_delta(&self) -> Option<f64> {
        match (self.epochs.first(), self.epochs.last()) {
            (Some(first), Some(last)) => Some(last.val_accuracy - first.val_accuracy),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(epoch: usize, val_accuracy: f64) -> EpochRecord {
        EpochRecord {
            epoch,
            train_loss: 0.5,
            train_accuracy: 0.7,
            val_loss: 0.4,
            val_accuracy,
            learning_rate: 1e-3,
        }
    }

    #[test]
    fn test_best_epoch() {
        let mut history = TrainingHistory::new();
        assert!(history.best_epoch().is_none());

        history.add_epoch(record(1, 0.80));
        history.add_epoch(record(2, 0.91));
        history.add_epoch(record(3, 0.91));
        history.add_epoch(record(4, 0.88));

        assert_eq!(history.len(), 4);
        assert_eq!(history.best_epoch(), Some(2));
        assert_eq!(history.best_val_accuracy(), Some(0.91));
        assert!((history.val_accuracy_delta().unwrap() - 0.08).abs() < 1e-9);
    }
}
