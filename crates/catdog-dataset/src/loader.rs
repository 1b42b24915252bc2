//! Directory scanning and image decoding.

use catdog_core::{Error, ImageSample, Result};
use image::DynamicImage;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

const IMAGE_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "bmp"];

/// Whether the path has an image file extension
pub fn is_image_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Loads samples from a `<root>/<class>/<file>` tree
pub struct ImageLoader {
    root_dir: PathBuf,
}

impl ImageLoader {
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
        }
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    /// Decodes an image from disk
    pub fn load_image(path: &Path) -> Result<DynamicImage> {
        if !path.exists() {
            return Err(Error::NotFound(format!(
                "Image file not found: {}",
                path.display()
            )));
        }

        image::open(path)
            .map_err(|e| Error::Image(format!("Failed to load image {}: {e}", path.display())))
    }

    /// Image files directly inside `dir`, sorted by file name
    pub fn scan_directory(dir: &Path) -> Result<Vec<PathBuf>> {
        if !dir.is_dir() {
            return Err(Error::NotFound(format!(
                "Directory not found: {}",
                dir.display()
            )));
        }

        let mut images = Vec::new();
        for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
            let entry = entry.map_err(|e| Error::Dataset(e.to_string()))?;
            if entry.file_type().is_file() && is_image_file(entry.path()) {
                images.push(entry.into_path());
            }
        }
        images.sort();

        Ok(images)
    }

    /// Class names in alphabetical order; the position is the label
    pub fn discover_classes(&self) -> Result<Vec<String>> {
        if !self.root_dir.is_dir() {
            return Err(Error::NotFound(format!(
                "Directory not found: {}",
                self.root_dir.display()
            )));
        }

        let mut classes = Vec::new();
        for entry in WalkDir::new(&self.root_dir).min_depth(1).max_depth(1) {
            let entry = entry.map_err(|e| Error::Dataset(e.to_string()))?;
            if entry.file_type().is_dir() {
                classes.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        classes.sort();

        if classes.is_empty() {
            return Err(Error::Dataset(format!(
                "no class directories in {}",
                self.root_dir.display()
            )));
        }
        Ok(classes)
    }

    /// All samples grouped by class, classes sorted, files sorted within a class
    pub fn load_samples(&self) -> Result<(Vec<String>, Vec<ImageSample>)> {
        let classes = self.discover_classes()?;
        let mut samples = Vec::new();

        for (label, class_name) in classes.iter().enumerate() {
            let class_dir = self.root_dir.join(class_name);
            samples.extend(
                Self::scan_directory(&class_dir)?
                    .into_iter()
                    .map(|path| ImageSample::with_class_name(path, label, class_name.clone())),
            );
        }

        Ok((classes, samples))
    }
}
