//! Per-split class counts.

use crate::loader::is_image_file;
use catdog_core::{DataSplit, Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Image counts per class within one split
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SplitStatistics {
    pub split: DataSplit,
    pub class_counts: BTreeMap<String, usize>,
    pub total: usize,
}

impl SplitStatistics {
    /// Counts images in every class directory of `split_dir`
    pub fn compute(split_dir: &Path, split: DataSplit) -> Result<Self> {
        if !split_dir.is_dir() {
            return Err(Error::NotFound(format!(
                "{split} split not found at {}",
                split_dir.display()
            )));
        }

        let mut class_counts = BTreeMap::new();
        for entry in fs::read_dir(split_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let mut count = 0;
            for file in fs::read_dir(entry.path())? {
                let file = file?;
                if file.file_type()?.is_file() && is_image_file(&file.path()) {
                    count += 1;
                }
            }
            class_counts.insert(entry.file_name().to_string_lossy().into_owned(), count);
        }

        let total = class_counts.values().sum();
        Ok(Self {
            split,
            class_counts,
            total,
        })
    }

    pub fn count(&self, class_name: &str) -> usize {
        self.class_counts.get(class_name).copied().unwrap_or(0)
    }

    pub fn min_class(&self) -> usize {
        self.class_counts.values().copied().min().unwrap_or(0)
    }

    pub fn max_class(&self) -> usize {
        self.class_counts.values().copied().max().unwrap_or(0)
    }

    /// Largest over smallest class; infinite when a class is empty
    pub fn imbalance_ratio(&self) -> f64 {
        match self.min_class() {
            0 => f64::INFINITY,
            min => self.max_class() as f64 / min as f64,
        }
    }

    /// Accuracy of always predicting the largest class
    pub fn majority_baseline(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.max_class() as f64 / self.total as f64
        }
    }
}

/// Statistics for both splits
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatasetStatistics {
    pub train: SplitStatistics,
    pub validation: SplitStatistics,
}

impl DatasetStatistics {
    pub fn compute(data_root: &Path) -> Result<Self> {
        Ok(Self {
            train: SplitStatistics::compute(
                &data_root.join(DataSplit::Train.dir_name()),
                DataSplit::Train,
            )?,
            validation: SplitStatistics::compute(
                &data_root.join(DataSplit::Validation.dir_name()),
                DataSplit::Validation,
            )?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_split_statistics() {
        let temp_dir = TempDir::new().unwrap();
        let train = temp_dir.path().join("train");
        fs::create_dir_all(train.join("cat")).unwrap();
        fs::create_dir_all(train.join("dog")).unwrap();
        for i in 0..3 {
            fs::write(train.join(format!("cat/cat.{i}.jpg")), b"x").unwrap();
        }
        for i in 0..6 {
            fs::write(train.join(format!("dog/dog.{i}.jpg")), b"x").unwrap();
        }
        fs::write(train.join("dog/labels.csv"), b"x").unwrap();

        let stats = SplitStatistics::compute(&train, DataSplit::Train).unwrap();
        assert_eq!(stats.total, 9);
        assert_eq!(stats.count("dog"), 6);
        assert_eq!(stats.count("horse"), 0);
        assert_eq!(stats.imbalance_ratio(), 2.0);
        assert!((stats.majority_baseline() - 6.0 / 9.0).abs() < 1e-12);
    }

    #[test]
    fn test_missing_split() {
        let temp_dir = TempDir::new().unwrap();
        let result = SplitStatistics::compute(&temp_dir.path().join("validation"), DataSplit::Validation);
        assert!(matches!(result, Err(Error::NotFound(_))));
    }
}
