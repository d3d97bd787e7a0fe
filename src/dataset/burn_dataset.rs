//! Burn Dataset Integration
//!
//! `LesionBurnDataset` decodes images on demand and implements Burn's
//! `Dataset` trait; `LesionBatcher` turns decoded items into normalized
//! tensors. `BatchIter` is the lazy batch sequence used by training and
//! evaluation: it walks a (possibly shuffled) index order until the data is
//! exhausted, so the final batch may be short and no sample is visited
//! twice.
//!
//! Decoding and augmentation of a batch run on the rayon pool. With
//! `prefetch > 0` a background thread prepares the following batches while
//! the caller consumes the current one; the order of batches is unchanged.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{sync_channel, Receiver};
use std::sync::Arc;
use std::thread::JoinHandle;

use burn::data::dataloader::batcher::Batcher;
use burn::data::dataset::Dataset;
use burn::prelude::*;
use image::ImageReader;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::dataset::augmentation::{AugmentationConfig, Augmenter};
use crate::dataset::loader::{ImageSample, LesionDataset};
use crate::utils::error::{LesionError, Result};

/// ImageNet channel statistics
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// How pixel values are normalized after rescaling to [0, 1]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Normalization {
    /// Rescale only (x / 255)
    Rescale,
    /// Rescale, then subtract the ImageNet mean and divide by its std
    #[default]
    ImageNet,
}

/// A decoded sample ready for batching
#[derive(Clone, Debug)]
pub struct LesionItem {
    /// Image data as flattened CHW float array [3 * H * W] in [0, 1]
    pub image: Vec<f32>,
    pub label: usize,
    /// Position of the sample in its dataset
    pub index: usize,
}

/// Shared counter of attempted and skipped sample loads
#[derive(Debug, Clone, Default)]
pub struct SkipCounter {
    attempted: Arc<AtomicUsize>,
    skipped: Arc<AtomicUsize>,
}

impl SkipCounter {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, ok: bool) {
        self.attempted.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.skipped.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn attempted(&self) -> usize {
        self.attempted.load(Ordering::Relaxed)
    }

    pub fn skipped(&self) -> usize {
        self.skipped.load(Ordering::Relaxed)
    }

    pub fn skip_rate(&self) -> f64 {
        let attempted = self.attempted();
        if attempted == 0 {
            0.0
        } else {
            self.skipped() as f64 / attempted as f64
        }
    }

    /// Log a warning if the skip rate exceeds `max_fraction`; returns whether it did
    pub fn report(&self, context: &str, max_fraction: f64) -> bool {
        let exceeded = self.skipped() > 0 && self.skip_rate() > max_fraction;
        if exceeded {
            warn!(
                "{}: skipped {} of {} samples ({:.1}%), above the {:.1}% threshold",
                context,
                self.skipped(),
                self.attempted(),
                self.skip_rate() * 100.0,
                max_fraction * 100.0
            );
        } else if self.skipped() > 0 {
            debug!("{}: skipped {} unreadable samples", context, self.skipped());
        }
        exceeded
    }

    pub fn reset(&self) {
        self.attempted.store(0, Ordering::Relaxed);
        self.skipped.store(0, Ordering::Relaxed);
    }
}

/// Options of one pass over a dataset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchOptions {
    pub batch_size: usize,
    pub shuffle: bool,
    pub augment: bool,
    pub seed: u64,
    /// Number of batches prepared ahead on a background thread (0 = inline)
    pub prefetch: usize,
}

impl BatchOptions {
    /// Fixed order, no augmentation
    pub fn evaluation(batch_size: usize) -> Self {
        Self {
            batch_size,
            shuffle: false,
            augment: false,
            seed: 0,
            prefetch: 0,
        }
    }

    /// Shuffled and augmented
    pub fn training(batch_size: usize, seed: u64) -> Self {
        Self {
            batch_size,
            shuffle: true,
            augment: true,
            seed,
            prefetch: 0,
        }
    }

    pub fn with_prefetch(mut self, prefetch: usize) -> Self {
        self.prefetch = prefetch;
        self
    }
}

struct DatasetInner {
    samples: Vec<ImageSample>,
    num_classes: usize,
    augmenter: Augmenter,
    plain: Augmenter,
}

/// Lesion dataset implementing Burn's Dataset trait
///
/// Images are decoded lazily. Cloning is cheap and clones share the skip
/// counter.
#[derive(Clone)]
pub struct LesionBurnDataset {
    inner: Arc<DatasetInner>,
    skips: SkipCounter,
}

impl std::fmt::Debug for LesionBurnDataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LesionBurnDataset")
            .field("len", &self.inner.samples.len())
            .field("image_size", &self.image_size())
            .finish()
    }
}

impl LesionBurnDataset {
    /// Build from a scanned dataset; `augmentation` is used only by augmented passes
    pub fn new(dataset: &LesionDataset, image_size: usize, augmentation: AugmentationConfig) -> Self {
        Self::from_samples(
            dataset.samples.clone(),
            dataset.num_classes(),
            image_size,
            augmentation,
        )
    }

    pub fn from_samples(
        samples: Vec<ImageSample>,
        num_classes: usize,
        image_size: usize,
        augmentation: AugmentationConfig,
    ) -> Self {
        Self {
            inner: Arc::new(DatasetInner {
                samples,
                num_classes,
                augmenter: Augmenter::new(augmentation, image_size as u32),
                plain: Augmenter::no_augmentation(image_size as u32),
            }),
            skips: SkipCounter::new(),
        }
    }

    pub fn image_size(&self) -> usize {
        self.inner.plain.image_size() as usize
    }

    pub fn num_classes(&self) -> usize {
        self.inner.num_classes
    }

    pub fn samples(&self) -> &[ImageSample] {
        &self.inner.samples
    }

    pub fn skips(&self) -> &SkipCounter {
        &self.skips
    }

    /// Samples per class
    pub fn class_counts(&self) -> Vec<usize> {
        let mut counts = vec![0usize; self.num_classes()];
        for sample in &self.inner.samples {
            if sample.label < counts.len() {
                counts[sample.label] += 1;
            }
        }
        counts
    }

    /// Decode, resize and (optionally) augment one sample
    pub fn load_item(&self, index: usize, rng: Option<&mut ChaCha8Rng>) -> Result<LesionItem> {
        let sample = self.inner.samples.get(index).ok_or_else(|| {
            LesionError::config(format!(
                "sample index {} out of range ({} samples)",
                index,
                self.inner.samples.len()
            ))
        })?;

        let image = decode_image(&sample.path)?;
        let data = match rng {
            Some(rng) => self.inner.augmenter.preprocess(&image, Some(rng)),
            None => self.inner.plain.preprocess(&image, None),
        };

        Ok(LesionItem {
            image: data,
            label: sample.label,
            index,
        })
    }

    /// Load a group of indices in parallel, skipping unreadable samples
    fn load_chunk(&self, indices: &[usize], augment_seed: Option<u64>) -> Vec<LesionItem> {
        indices
            .par_iter()
            .filter_map(|&index| {
                let result = match augment_seed {
                    Some(seed) => {
                        let mut rng = ChaCha8Rng::seed_from_u64(sample_seed(seed, index));
                        self.load_item(index, Some(&mut rng))
                    }
                    None => self.load_item(index, None),
                };
                self.skips.record(result.is_ok());
                match result {
                    Ok(item) => Some(item),
                    Err(err) => {
                        warn!("Skipping sample: {}", err);
                        None
                    }
                }
            })
            .collect()
    }

    /// Index order for one pass
    pub fn pass_order(&self, options: &BatchOptions, epoch: usize) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.inner.samples.len()).collect();
        if options.shuffle {
            let mut rng = ChaCha8Rng::seed_from_u64(epoch_seed(options.seed, epoch));
            order.shuffle(&mut rng);
        }
        order
    }

    /// Lazy batch sequence for one pass over the data
    pub fn iter_batches<B: Backend>(
        &self,
        options: BatchOptions,
        epoch: usize,
        normalization: Normalization,
        device: &B::Device,
    ) -> BatchIter<B> {
        let batch_size = options.batch_size.max(1);
        let chunks: Vec<Vec<usize>> = self
            .pass_order(&options, epoch)
            .chunks(batch_size)
            .map(|c| c.to_vec())
            .collect();
        let augment_seed = options.augment.then(|| epoch_seed(options.seed, epoch));

        let source = if options.prefetch > 0 {
            let (tx, rx) = sync_channel(options.prefetch);
            let dataset = self.clone();
            let handle = std::thread::spawn(move || {
                for chunk in chunks {
                    let items = dataset.load_chunk(&chunk, augment_seed);
                    if tx.send(items).is_err() {
                        break;
                    }
                }
            });
            ChunkSource::Prefetch {
                rx: Some(rx),
                handle: Some(handle),
            }
        } else {
            ChunkSource::Inline {
                dataset: self.clone(),
                chunks: chunks.into_iter(),
                augment_seed,
            }
        };

        BatchIter {
            source,
            batcher: LesionBatcher::new(self.image_size(), normalization),
            device: device.clone(),
        }
    }
}

impl Dataset<LesionItem> for LesionBurnDataset {
    fn get(&self, index: usize) -> Option<LesionItem> {
        if index >= self.inner.samples.len() {
            return None;
        }
        let result = self.load_item(index, None);
        self.skips.record(result.is_ok());
        match result {
            Ok(item) => Some(item),
            Err(err) => {
                warn!("Skipping sample: {}", err);
                None
            }
        }
    }

    fn len(&self) -> usize {
        self.inner.samples.len()
    }
}

/// Open and decode an image file, mapping failures to `DataLoad`
pub fn decode_image(path: &PathBuf) -> Result<image::DynamicImage> {
    let load_err = |reason: String| LesionError::DataLoad {
        path: path.clone(),
        reason,
    };
    ImageReader::open(path)
        .map_err(|e| load_err(e.to_string()))?
        .with_guessed_format()
        .map_err(|e| load_err(e.to_string()))?
        .decode()
        .map_err(|e| load_err(e.to_string()))
}

fn epoch_seed(seed: u64, epoch: usize) -> u64 {
    seed.wrapping_mul(0x9E37_79B9_7F4A_7C15) ^ (epoch as u64).wrapping_add(1)
}

fn sample_seed(epoch_seed: u64, index: usize) -> u64 {
    epoch_seed ^ (index as u64).wrapping_mul(0xBF58_476D_1CE4_E5B9)
}

enum ChunkSource {
    Inline {
        dataset: LesionBurnDataset,
        chunks: std::vec::IntoIter<Vec<usize>>,
        augment_seed: Option<u64>,
    },
    Prefetch {
        rx: Option<Receiver<Vec<LesionItem>>>,
        handle: Option<JoinHandle<()>>,
    },
}

impl ChunkSource {
    fn next_chunk(&mut self) -> Option<Vec<LesionItem>> {
        match self {
            ChunkSource::Inline {
                dataset,
                chunks,
                augment_seed,
            } => chunks
                .next()
                .map(|chunk| dataset.load_chunk(&chunk, *augment_seed)),
            ChunkSource::Prefetch { rx, .. } => rx.as_ref().and_then(|rx| rx.recv().ok()),
        }
    }
}

impl Drop for ChunkSource {
    fn drop(&mut self) {
        if let ChunkSource::Prefetch { rx, handle } = self {
            // Disconnect first so a blocked producer returns
            drop(rx.take());
            if let Some(handle) = handle.take() {
                let _ = handle.join();
            }
        }
    }
}

/// Lazy iterator over the batches of one pass
pub struct BatchIter<B: Backend> {
    source: ChunkSource,
    batcher: LesionBatcher,
    device: B::Device,
}

impl<B: Backend> Iterator for BatchIter<B> {
    type Item = LesionBatch<B>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let items = self.source.next_chunk()?;
            // A chunk whose every sample failed to load yields no batch
            if !items.is_empty() {
                return Some(self.batcher.batch(items, &self.device));
            }
        }
    }
}

/// A batch of images for training or evaluation
#[derive(Clone, Debug)]
pub struct LesionBatch<B: Backend> {
    /// Shape [batch_size, 3, height, width]
    pub images: Tensor<B, 4>,
    /// Shape [batch_size]
    pub targets: Tensor<B, 1, Int>,
    /// Dataset positions of the samples, in batch order
    pub indices: Vec<usize>,
    /// Labels on the host, in batch order
    pub labels: Vec<usize>,
}

impl<B: Backend> LesionBatch<B> {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Batcher turning decoded items into normalized tensors
#[derive(Clone, Debug)]
pub struct LesionBatcher {
    image_size: usize,
    normalization: Normalization,
}

impl LesionBatcher {
    pub fn new(image_size: usize, normalization: Normalization) -> Self {
        Self {
            image_size,
            normalization,
        }
    }
}

impl<B: Backend> Batcher<B, LesionItem, LesionBatch<B>> for LesionBatcher {
    fn batch(&self, items: Vec<LesionItem>, device: &B::Device) -> LesionBatch<B> {
        let batch_size = items.len();
        let (height, width) = (self.image_size, self.image_size);

        let mut images_data = Vec::with_capacity(batch_size * 3 * height * width);
        let mut targets_data = Vec::with_capacity(batch_size);
        let mut indices = Vec::with_capacity(batch_size);
        let mut labels = Vec::with_capacity(batch_size);
        for item in items {
            images_data.extend(item.image);
            targets_data.push(item.label as i64);
            indices.push(item.index);
            labels.push(item.label);
        }

        let images = Tensor::<B, 4>::from_floats(
            TensorData::new(images_data, [batch_size, 3, height, width]),
            device,
        );

        let images = match self.normalization {
            Normalization::Rescale => images,
            Normalization::ImageNet => {
                let mean = Tensor::<B, 4>::from_floats(
                    TensorData::new(IMAGENET_MEAN.to_vec(), [1, 3, 1, 1]),
                    device,
                );
                let std = Tensor::<B, 4>::from_floats(
                    TensorData::new(IMAGENET_STD.to_vec(), [1, 3, 1, 1]),
                    device,
                );
                (images - mean) / std
            }
        };

        let targets =
            Tensor::<B, 1, Int>::from_data(TensorData::new(targets_data, [batch_size]), device);

        LesionBatch {
            images,
            targets,
            indices,
            labels,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{write_class_tree, write_corrupt_image};
    use burn_ndarray::NdArray;
    use tempfile::TempDir;

    type TestBackend = NdArray;

    fn dataset(dir: &TempDir, classes: &[(&str, usize)]) -> LesionBurnDataset {
        write_class_tree(dir.path(), classes);
        let scanned = LesionDataset::open(dir.path()).unwrap();
        LesionBurnDataset::new(&scanned, 8, AugmentationConfig::keras_default())
    }

    #[test]
    fn test_short_final_batch_and_exact_coverage() {
        let dir = TempDir::new().unwrap();
        let ds = dataset(&dir, &[("benign", 4), ("malignant", 3)]);
        let device = Default::default();

        let batches: Vec<_> = ds
            .iter_batches::<TestBackend>(BatchOptions::evaluation(3), 0, Normalization::ImageNet, &device)
            .collect();

        let sizes: Vec<usize> = batches.iter().map(|b| b.len()).collect();
        assert_eq!(sizes, vec![3, 3, 1]);
        let indices: Vec<usize> = batches.iter().flat_map(|b| b.indices.clone()).collect();
        assert_eq!(indices, (0..7).collect::<Vec<_>>());
        assert_eq!(batches[0].images.dims(), [3, 3, 8, 8]);
        assert_eq!(batches[2].targets.dims(), [1]);
    }

    #[test]
    fn test_shuffle_is_a_permutation_and_seeded() {
        let dir = TempDir::new().unwrap();
        let ds = dataset(&dir, &[("benign", 5), ("malignant", 5)]);
        let options = BatchOptions::training(4, 42);

        let epoch0 = ds.pass_order(&options, 0);
        let epoch1 = ds.pass_order(&options, 1);
        let mut sorted = epoch0.clone();
        sorted.sort();
        assert_eq!(sorted, (0..10).collect::<Vec<_>>());
        assert_eq!(epoch0, ds.pass_order(&options, 0));
        assert_ne!(epoch0, epoch1);

        let fixed = ds.pass_order(&BatchOptions::evaluation(4), 3);
        assert_eq!(fixed, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_prefetch_yields_same_batches() {
        let dir = TempDir::new().unwrap();
        let ds = dataset(&dir, &[("benign", 5), ("malignant", 4)]);
        let device = Default::default();
        let options = BatchOptions::training(2, 7);

        let inline: Vec<Vec<usize>> = ds
            .iter_batches::<TestBackend>(options, 1, Normalization::Rescale, &device)
            .map(|b| b.indices)
            .collect();
        let prefetched: Vec<Vec<usize>> = ds
            .iter_batches::<TestBackend>(options.with_prefetch(2), 1, Normalization::Rescale, &device)
            .map(|b| b.indices)
            .collect();

        assert_eq!(inline, prefetched);
        assert_eq!(inline.len(), 5);
    }

    #[test]
    fn test_early_drop_of_prefetching_iterator() {
        let dir = TempDir::new().unwrap();
        let ds = dataset(&dir, &[("benign", 6), ("malignant", 6)]);
        let device = Default::default();

        let mut iter = ds.iter_batches::<TestBackend>(
            BatchOptions::evaluation(1).with_prefetch(1),
            0,
            Normalization::Rescale,
            &device,
        );
        assert!(iter.next().is_some());
        drop(iter);
    }

    #[test]
    fn test_corrupt_images_are_skipped_and_counted() {
        let dir = TempDir::new().unwrap();
        write_class_tree(dir.path(), &[("benign", 3), ("malignant", 2)]);
        write_corrupt_image(&dir.path().join("benign").join("zzz_broken.png"));
        let scanned = LesionDataset::open(dir.path()).unwrap();
        let ds = LesionBurnDataset::new(&scanned, 8, AugmentationConfig::none());
        let device = Default::default();

        let total: usize = ds
            .iter_batches::<TestBackend>(BatchOptions::evaluation(4), 0, Normalization::Rescale, &device)
            .map(|b| b.len())
            .sum();

        assert_eq!(total, 5);
        assert_eq!(ds.skips().attempted(), 6);
        assert_eq!(ds.skips().skipped(), 1);
        assert!(ds.skips().report("test", 0.05));
        assert!(!ds.skips().report("test", 0.5));

        let err = ds.load_item(3, None).unwrap_err();
        assert!(matches!(err, LesionError::DataLoad { .. }));
    }

    #[test]
    fn test_batcher_normalization() {
        let batcher = LesionBatcher::new(1, Normalization::ImageNet);
        let item = LesionItem {
            image: IMAGENET_MEAN.to_vec(),
            label: 1,
            index: 0,
        };
        let batch: LesionBatch<TestBackend> = batcher.batch(vec![item], &Default::default());
        let values = batch.images.into_data().to_vec::<f32>().unwrap();
        assert!(values.iter().all(|v| v.abs() < 1e-6));
        assert_eq!(batch.labels, vec![1]);
    }

    #[test]
    fn test_dataset_trait_get() {
        let dir = TempDir::new().unwrap();
        let ds = dataset(&dir, &[("benign", 1), ("malignant", 1)]);
        assert_eq!(ds.len(), 2);
        assert_eq!(ds.get(1).map(|i| i.label), Some(1));
        assert!(ds.get(2).is_none());
        assert_eq!(ds.class_counts(), vec![1, 1]);
    }
}
