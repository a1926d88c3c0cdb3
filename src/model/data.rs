use burn::data::dataloader::batcher::Batcher;
use burn::data::dataset::Dataset;
use burn::prelude::*;
use image::{ImageReader, imageops::FilterType};
use rand::{SeedableRng, rngs::StdRng, seq::SliceRandom};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{GanError, GanResult};
use crate::model::constants::{CHANNELS, HEIGHT, WIDTH};

/// One image in planar CHW order, normalized to [-1, 1].
#[derive(Debug, Clone)]
pub struct ImageItem {
    pub image: Vec<f32>,
}

/// Every decodable image file of a directory, resized to a fixed geometry.
pub struct ImageFolderDataset {
    pub image_paths: Vec<PathBuf>,
    height: u32,
    width: u32,
}

impl ImageFolderDataset {
    pub fn new<P: AsRef<Path>>(path: P) -> GanResult<Self> {
        Self::with_size(path, HEIGHT as u32, WIDTH as u32)
    }

    pub fn with_size<P: AsRef<Path>>(path: P, height: u32, width: u32) -> GanResult<Self> {
        let path = path.as_ref();
        let mut image_paths = Vec::new();

        for entry in std::fs::read_dir(path)? {
            let entry = entry?;
            let path = entry.path();

            if path.is_file() {
                if let Some(ext) = path.extension().and_then(|s| s.to_str()) {
                    match ext.to_lowercase().as_str() {
                        "jpg" | "jpeg" | "png" | "bmp" | "tiff" => {
                            image_paths.push(path);
                        }
                        _ => {}
                    }
                }
            }
        }
        if image_paths.is_empty() {
            return Err(GanError::Dataset(format!(
                "no image files found in {}",
                path.display()
            )));
        }
        // read_dir order is platform dependent
        image_paths.sort();

        Ok(Self {
            image_paths,
            height,
            width,
        })
    }
}

impl Dataset<ImageItem> for ImageFolderDataset {
    fn len(&self) -> usize {
        self.image_paths.len()
    }

    fn get(&self, index: usize) -> Option<ImageItem> {
        let path = self.image_paths.get(index)?;
        let image = ImageReader::open(path)
            .ok()?
            .decode()
            .ok()?
            .resize_exact(self.width, self.height, FilterType::Triangle)
            .to_rgb8();

        let plane = (self.width * self.height) as usize;
        let mut image_data = vec![0.0f32; CHANNELS * plane];
        for (i, pixel) in image.pixels().enumerate() {
            for c in 0..CHANNELS {
                image_data[c * plane + i] = (pixel[c] as f32 / 127.5) - 1.0;
            }
        }

        Some(ImageItem { image: image_data })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    Train,
    Test,
}

/// CIFAR-10 binary release: records of one label byte followed by a 32x32x3
/// image stored channel-major. Labels are dropped.
pub struct Cifar10Dataset {
    pixels: Vec<u8>,
}

impl Cifar10Dataset {
    pub const IMAGE_BYTES: usize = CHANNELS * HEIGHT * WIDTH;
    pub const RECORD_BYTES: usize = 1 + Self::IMAGE_BYTES;

    pub fn new<P: AsRef<Path>>(dir: P, split: Split) -> GanResult<Self> {
        let files: Vec<String> = match split {
            Split::Train => (1..=5).map(|i| format!("data_batch_{i}.bin")).collect(),
            Split::Test => vec!["test_batch.bin".to_string()],
        };

        let mut pixels = Vec::new();
        for file in files {
            let path = dir.as_ref().join(file);
            let bytes = std::fs::read(&path).map_err(|e| {
                GanError::Dataset(format!("failed to read {}: {e}", path.display()))
            })?;
            pixels.extend(Self::from_bytes(&bytes)?.pixels);
            debug!("loaded {}", path.display());
        }

        Ok(Self { pixels })
    }

    pub fn from_bytes(bytes: &[u8]) -> GanResult<Self> {
        if bytes.is_empty() || bytes.len() % Self::RECORD_BYTES != 0 {
            return Err(GanError::Dataset(format!(
                "CIFAR-10 data must be a non-empty multiple of {} bytes, got {}",
                Self::RECORD_BYTES,
                bytes.len()
            )));
        }
        let pixels = bytes
            .chunks_exact(Self::RECORD_BYTES)
            .flat_map(|record| record[1..].iter().copied())
            .collect();

        Ok(Self { pixels })
    }
}

impl Dataset<ImageItem> for Cifar10Dataset {
    fn len(&self) -> usize {
        self.pixels.len() / Self::IMAGE_BYTES
    }

    fn get(&self, index: usize) -> Option<ImageItem> {
        let start = index.checked_mul(Self::IMAGE_BYTES)?;
        let bytes = self.pixels.get(start..start + Self::IMAGE_BYTES)?;
        // [0, 255] -> [0, 1] -> [-1, 1]
        let image = bytes
            .iter()
            .map(|&b| (b as f32 / 255.0) * 2.0 - 1.0)
            .collect();

        Some(ImageItem { image })
    }
}

#[derive(Clone, Debug)]
pub struct ImageBatcher {
    pub channels: usize,
    pub height: usize,
    pub width: usize,
}

impl Default for ImageBatcher {
    fn default() -> Self {
        Self {
            channels: CHANNELS,
            height: HEIGHT,
            width: WIDTH,
        }
    }
}

impl ImageBatcher {
    pub fn item_len(&self) -> usize {
        self.channels * self.height * self.width
    }
}

#[derive(Clone, Debug)]
pub struct ImageBatch<B: Backend> {
    pub images: Tensor<B, 4>, // Shape: [batch_size, channels, height, width]
}

impl<B: Backend> Batcher<B, ImageItem, ImageBatch<B>> for ImageBatcher {
    fn batch(&self, items: Vec<ImageItem>, device: &B::Device) -> ImageBatch<B> {
        let batch_size = items.len();
        let data: Vec<f32> = items.into_iter().flat_map(|item| item.image).collect();
        let images = Tensor::<B, 4>::from_data(
            TensorData::new(data, [batch_size, self.channels, self.height, self.width])
                .convert::<B::FloatElem>(),
            device,
        );
        ImageBatch { images }
    }
}

/// Infinite stream of fixed-size batches.
pub trait BatchSource<B: Backend> {
    fn batch_size(&self) -> usize;

    /// Never runs dry: the stream restarts on a new epoch instead.
    fn next_batch(&mut self, device: &B::Device) -> GanResult<Tensor<B, 4>>;

    /// Number of completed passes over the data.
    fn epoch(&self) -> usize;
}

/// Draws without replacement within an epoch and reshuffles at the boundary.
/// A batch crossing the boundary is completed from the next epoch, which
/// burn's `DataLoaderBuilder` cannot do: it ends the epoch on a short batch.
pub struct ShuffledBatches<D> {
    dataset: D,
    batcher: ImageBatcher,
    batch_size: usize,
    order: Vec<usize>,
    cursor: usize,
    epoch: usize,
    rng: StdRng,
}

impl<D: Dataset<ImageItem>> ShuffledBatches<D> {
    pub fn new(dataset: D, batcher: ImageBatcher, batch_size: usize, seed: u64) -> GanResult<Self> {
        if dataset.is_empty() {
            return Err(GanError::Dataset("dataset is empty".to_string()));
        }
        if batch_size == 0 {
            return Err(GanError::Config("batch_size must be at least 1".to_string()));
        }

        let mut rng = StdRng::seed_from_u64(seed);
        let mut order: Vec<usize> = (0..dataset.len()).collect();
        order.shuffle(&mut rng);

        Ok(Self {
            dataset,
            batcher,
            batch_size,
            order,
            cursor: 0,
            epoch: 0,
            rng,
        })
    }

    fn next_index(&mut self) -> usize {
        let index = self.order[self.cursor];
        self.cursor += 1;
        if self.cursor == self.order.len() {
            self.order.shuffle(&mut self.rng);
            self.cursor = 0;
            self.epoch += 1;
            debug!("data stream finished epoch {}", self.epoch);
        }
        index
    }
}

impl<B: Backend, D: Dataset<ImageItem>> BatchSource<B> for ShuffledBatches<D> {
    fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn next_batch(&mut self, device: &B::Device) -> GanResult<Tensor<B, 4>> {
        let item_len = self.batcher.item_len();
        let mut items = Vec::with_capacity(self.batch_size);

        while items.len() < self.batch_size {
            let index = self.next_index();
            let item = self
                .dataset
                .get(index)
                .ok_or_else(|| GanError::Dataset(format!("failed to load item {index}")))?;
            if item.image.len() != item_len {
                return Err(GanError::Dataset(format!(
                    "item {index} has {} values, expected {item_len}",
                    item.image.len()
                )));
            }
            items.push(item);
        }

        let batch: ImageBatch<B> =
            Batcher::<B, ImageItem, ImageBatch<B>>::batch(&self.batcher, items, device);
        Ok(batch.images)
    }

    fn epoch(&self) -> usize {
        self.epoch
    }
}
