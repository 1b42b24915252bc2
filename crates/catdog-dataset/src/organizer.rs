//! One-time preparation of the on-disk dataset.
//!
//! The raw archive holds a flat `train/` directory of `cat.123.jpg` style
//! names. Preparation extracts it, moves every file into `train/<class>/`
//! and carves a fixed-size, lexicographically-last validation split out of
//! each class. Each step detects completed work and becomes a no-op, so the
//! whole sequence can be re-run safely.

use crate::loader::{is_image_file, ImageLoader};
use crate::statistics::DatasetStatistics;
use catdog_core::{DataConfig, DataSplit, Error, Result};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// What one [`DatasetOrganizer::organize`] call changed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrganizeReport {
    /// Whether the archive was extracted by this call
    pub extracted: bool,
    /// Flat files moved into class directories
    pub organized_files: usize,
    /// Files moved from train to validation
    pub validation_files: usize,
    pub statistics: DatasetStatistics,
}

impl OrganizeReport {
    /// True when the dataset was already fully prepared
    pub fn was_noop(&self) -> bool {
        !self.extracted && self.organized_files == 0 && self.validation_files == 0
    }
}

pub struct DatasetOrganizer {
    data_root: PathBuf,
    archive: PathBuf,
    classes: Vec<String>,
    validation_per_class: usize,
    max_imbalance_ratio: f64,
}

impl DatasetOrganizer {
    pub fn new(config: &DataConfig) -> Self {
        Self {
            data_root: config.data_root.clone(),
            archive: config.archive.clone(),
            classes: config.classes.clone(),
            validation_per_class: config.validation_per_class,
            max_imbalance_ratio: config.max_imbalance_ratio,
        }
    }

    pub fn data_root(&self) -> &Path {
        &self.data_root
    }

    pub fn split_dir(&self, split: DataSplit) -> PathBuf {
        self.data_root.join(split.dir_name())
    }

    /// Runs extraction, class sorting and the validation carve-out, then
    /// checks class balance.
    pub fn organize(&self) -> Result<OrganizeReport> {
        let extracted = self.ensure_extracted()?;
        let organized_files = self.organize_by_class()?;
        let validation_files = self.carve_validation()?;
        let statistics = self.check_balance()?;

        let report = OrganizeReport {
            extracted,
            organized_files,
            validation_files,
            statistics,
        };
        if report.was_noop() {
            info!("Dataset at {} already organized", self.data_root.display());
        }
        Ok(report)
    }

    /// Extracts the archive unless `train/` already exists.
    ///
    /// Returns whether extraction happened. A missing archive is fatal.
    pub fn ensure_extracted(&self) -> Result<bool> {
        let train_dir = self.split_dir(DataSplit::Train);
        if train_dir.is_dir() {
            debug!("Skipping extraction, {} exists", train_dir.display());
            return Ok(false);
        }

        if !self.archive.is_file() {
            return Err(Error::NotFound(format!(
                "dataset archive {}",
                self.archive.display()
            )));
        }

        info!(
            "Extracting {} into {}",
            self.archive.display(),
            self.data_root.display()
        );
        fs::create_dir_all(&self.data_root)?;
        let mut archive = zip::ZipArchive::new(File::open(&self.archive)?)?;
        archive.extract(&self.data_root)?;

        if !train_dir.is_dir() {
            return Err(Error::Dataset(format!(
                "archive {} has no top-level train/ directory",
                self.archive.display()
            )));
        }
        Ok(true)
    }

    /// Moves flat `train/<class>.<rest>` files into `train/<class>/`.
    ///
    /// Files whose prefix is not a configured class are left in place.
    pub fn organize_by_class(&self) -> Result<usize> {
        let train_dir = self.split_dir(DataSplit::Train);
        let mut moved = 0;
        let mut unknown = 0;

        let mut entries = Vec::new();
        for entry in fs::read_dir(&train_dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                entries.push(entry.path());
            }
        }
        entries.sort();

        for path in entries {
            let Some(class_name) = self.class_of(&path) else {
                unknown += 1;
                continue;
            };
            let class_dir = train_dir.join(class_name);
            fs::create_dir_all(&class_dir)?;
            if let Some(file_name) = path.file_name() {
                fs::rename(&path, class_dir.join(file_name))?;
                moved += 1;
            }
        }

        if unknown > 0 {
            warn!("{unknown} files in {} match no class prefix", train_dir.display());
        }
        if moved > 0 {
            info!("Moved {moved} files into class directories");
        }
        Ok(moved)
    }

    fn class_of(&self, path: &Path) -> Option<&str> {
        if !is_image_file(path) {
            return None;
        }
        let name = path.file_name()?.to_str()?;
        let (prefix, _) = name.split_once('.')?;
        self.classes
            .iter()
            .map(String::as_str)
            .find(|class| *class == prefix)
    }

    /// Moves the lexicographically-last `validation_per_class` files of each
    /// class into `validation/<class>/`, only when `validation/` is absent.
    pub fn carve_validation(&self) -> Result<usize> {
        let validation_dir = self.split_dir(DataSplit::Validation);
        if validation_dir.exists() {
            debug!("Skipping validation split, {} exists", validation_dir.display());
            return Ok(0);
        }

        let train_dir = self.split_dir(DataSplit::Train);
        let n = self.validation_per_class;

        // Check every class before touching the filesystem.
        let mut plan = Vec::with_capacity(self.classes.len());
        for class_name in &self.classes {
            let class_dir = train_dir.join(class_name);
            let files = if class_dir.is_dir() {
                ImageLoader::scan_directory(&class_dir)?
            } else {
                Vec::new()
            };
            if files.len() <= n {
                return Err(Error::Dataset(format!(
                    "class '{class_name}' has {} training images, need more than {n} to hold out {n}",
                    files.len()
                )));
            }
            let held_out = files[files.len() - n..].to_vec();
            plan.push((class_name, held_out));
        }

        let mut moved = 0;
        for (class_name, files) in plan {
            let target = validation_dir.join(class_name);
            fs::create_dir_all(&target)?;
            for path in files {
                if let Some(file_name) = path.file_name() {
                    fs::rename(&path, target.join(file_name))?;
                    moved += 1;
                }
            }
        }

        info!(
            "Moved {moved} files into {} ({n} per class)",
            validation_dir.display()
        );
        Ok(moved)
    }

    /// Fails early when the splits are too uneven to train on: every
    /// configured class must appear in both splits, validation must hold
    /// exactly `validation_per_class` per class, and the train split must
    /// stay within `max_imbalance_ratio`.
    pub fn check_balance(&self) -> Result<DatasetStatistics> {
        let stats = DatasetStatistics::compute(&self.data_root)?;

        for class_name in &self.classes {
            let train = stats.train.count(class_name);
            let validation = stats.validation.count(class_name);
            if train == 0 {
                return Err(Error::Imbalance(format!(
                    "class '{class_name}' has no training images"
                )));
            }
            if validation != self.validation_per_class {
                return Err(Error::Imbalance(format!(
                    "class '{class_name}' has {validation} validation images, expected {}",
                    self.validation_per_class
                )));
            }
        }

        let ratio = stats.train.imbalance_ratio();
        if ratio > self.max_imbalance_ratio {
            return Err(Error::Imbalance(format!(
                "train split ratio {ratio:.2} exceeds {:.2} ({:?})",
                self.max_imbalance_ratio, stats.train.class_counts
            )));
        }

        info!(
            "Class balance ok: train {:?}, validation {:?}",
            stats.train.class_counts, stats.validation.class_counts
        );
        Ok(stats)
    }
}
