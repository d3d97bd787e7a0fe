//! Lesion Dataset Loader
//!
//! Scans a directory tree with one subdirectory per class. Classes are
//! sorted by directory name and labelled `0..N-1` in that order. A second
//! split can be opened with the class mapping of the first so both agree on
//! every label.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::utils::error::{LesionError, Result};

/// File extensions accepted as images
pub const IMAGE_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "bmp"];

/// A single image sample with its label
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSample {
    pub path: PathBuf,
    /// Class label index
    pub label: usize,
    /// Class directory name (e.g. "malignant")
    pub class_name: String,
}

/// Class name <-> label mapping, fixed when the first split is opened
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassMapping {
    names: Vec<String>,
}

impl ClassMapping {
    /// Build a mapping from class names; labels follow sorted name order
    pub fn new(mut names: Vec<String>) -> Result<Self> {
        names.sort();
        names.dedup();
        if names.is_empty() {
            return Err(LesionError::config("no classes found"));
        }
        Ok(Self { names })
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn label_of(&self, name: &str) -> Option<usize> {
        self.names.binary_search_by(|n| n.as_str().cmp(name)).ok()
    }

    pub fn name_of(&self, label: usize) -> Option<&str> {
        self.names.get(label).map(String::as_str)
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }
}

/// Labelled image set created by a directory scan
#[derive(Debug, Clone)]
pub struct LesionDataset {
    pub root_dir: PathBuf,
    pub samples: Vec<ImageSample>,
    pub classes: ClassMapping,
}

impl LesionDataset {
    /// Open a dataset directory, deriving the class mapping from it
    ///
    /// ```text
    /// root_dir/
    /// ├── benign/
    /// │   ├── 0001.jpg
    /// │   └── ...
    /// └── malignant/
    ///     └── ...
    /// ```
    pub fn open<P: AsRef<Path>>(root_dir: P) -> Result<Self> {
        let root_dir = root_dir.as_ref();
        let classes = ClassMapping::new(class_directories(root_dir)?)?;
        Self::open_with_classes(root_dir, &classes)
    }

    /// Open a dataset directory using an existing class mapping
    ///
    /// Every class of the mapping must be present and non-empty, and the
    /// directory must not contain classes the mapping does not know.
    pub fn open_with_classes<P: AsRef<Path>>(root_dir: P, classes: &ClassMapping) -> Result<Self> {
        let root_dir = root_dir.as_ref().to_path_buf();
        info!("Loading lesion dataset from: {:?}", root_dir);

        let found = class_directories(&root_dir)?;
        if let Some(unknown) = found.iter().find(|name| classes.label_of(name).is_none()) {
            return Err(LesionError::config(format!(
                "class directory '{}' in {:?} is not one of {:?}",
                unknown,
                root_dir,
                classes.names()
            )));
        }

        let mut samples = Vec::new();
        for (label, class_name) in classes.names().iter().enumerate() {
            let class_dir = root_dir.join(class_name);
            if !class_dir.is_dir() {
                return Err(LesionError::config(format!(
                    "class directory {:?} is missing",
                    class_dir
                )));
            }

            let before = samples.len();
            for entry in WalkDir::new(&class_dir)
                .min_depth(1)
                .max_depth(1)
                .sort_by_file_name()
                .into_iter()
                .filter_map(|e| e.ok())
            {
                let path = entry.path();
                if entry.file_type().is_file() && is_image_file(path) {
                    samples.push(ImageSample {
                        path: path.to_path_buf(),
                        label,
                        class_name: class_name.clone(),
                    });
                }
            }

            let count = samples.len() - before;
            if count == 0 {
                return Err(LesionError::config(format!(
                    "class directory {:?} contains no images",
                    class_dir
                )));
            }
            debug!("Class '{}' (label {}): {} samples", class_name, label, count);
        }

        info!(
            "Loaded {} samples across {} classes",
            samples.len(),
            classes.len()
        );

        Ok(Self {
            root_dir,
            samples,
            classes: classes.clone(),
        })
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn num_classes(&self) -> usize {
        self.classes.len()
    }

    /// Number of samples per label
    pub fn class_counts(&self) -> Vec<usize> {
        let mut counts = vec![0usize; self.num_classes()];
        for sample in &self.samples {
            counts[sample.label] += 1;
        }
        counts
    }

    /// Stratified split into (train, validation)
    ///
    /// Each class contributes `round(count * validation_fraction)` samples to
    /// validation, keeping at least one sample on each side when the class
    /// has two or more images.
    pub fn split(&self, validation_fraction: f64, seed: u64) -> Result<(Self, Self)> {
        if !(0.0..1.0).contains(&validation_fraction) {
            return Err(LesionError::config(format!(
                "validation fraction {} must be in [0, 1)",
                validation_fraction
            )));
        }

        let mut by_class: BTreeMap<usize, Vec<ImageSample>> = BTreeMap::new();
        for sample in &self.samples {
            by_class.entry(sample.label).or_default().push(sample.clone());
        }

        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut train = Vec::new();
        let mut val = Vec::new();
        for (_, mut class_samples) in by_class {
            class_samples.shuffle(&mut rng);
            let n = class_samples.len();
            let mut n_val = (n as f64 * validation_fraction).round() as usize;
            if validation_fraction > 0.0 && n >= 2 {
                n_val = n_val.clamp(1, n - 1);
            }
            let rest = class_samples.split_off(n_val);
            val.extend(class_samples);
            train.extend(rest);
        }

        // Keep a stable, directory-like order inside each split
        train.sort_by(|a, b| (a.label, &a.path).cmp(&(b.label, &b.path)));
        val.sort_by(|a, b| (a.label, &a.path).cmp(&(b.label, &b.path)));

        let make = |samples| Self {
            root_dir: self.root_dir.clone(),
            samples,
            classes: self.classes.clone(),
        };
        Ok((make(train), make(val)))
    }

    pub fn stats(&self) -> DatasetStats {
        DatasetStats {
            total_samples: self.len(),
            class_names: self.classes.names().to_vec(),
            class_counts: self.class_counts(),
        }
    }
}

/// Statistics about the dataset
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetStats {
    pub total_samples: usize,
    pub class_names: Vec<String>,
    pub class_counts: Vec<usize>,
}

impl DatasetStats {
    /// Print statistics to console
    pub fn print(&self) {
        println!("\n📊 Dataset Statistics:");
        println!("  Total samples: {}", self.total_samples);
        println!("  Number of classes: {}", self.class_names.len());
        println!("\n  Samples per class:");

        for (idx, (name, count)) in self.class_names.iter().zip(&self.class_counts).enumerate() {
            let bar_len = (*count as f32 / self.total_samples.max(1) as f32 * 40.0) as usize;
            println!("    {:3}. {:24} {:6} {}", idx, name, count, "█".repeat(bar_len));
        }
    }
}

fn is_image_file(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.as_str()))
}

/// Sorted names of the subdirectories of `root_dir`
fn class_directories(root_dir: &Path) -> Result<Vec<String>> {
    if !root_dir.is_dir() {
        return Err(LesionError::config(format!(
            "dataset directory {:?} does not exist",
            root_dir
        )));
    }

    let mut names = Vec::new();
    for entry in std::fs::read_dir(root_dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
    }
    names.sort();

    if names.is_empty() {
        return Err(LesionError::config(format!(
            "dataset directory {:?} has no class subdirectories",
            root_dir
        )));
    }
    Ok(names)
}
