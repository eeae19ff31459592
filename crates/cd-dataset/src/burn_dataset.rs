//! Burn dataset integration for change detection
//!
//! `ChangeDetectionDataset` runs the loading transforms lazily per index and
//! `PairBatcher` pads the loaded pairs into `[B, C, H, W]` batches.

use std::path::PathBuf;
use std::sync::Arc;

use burn::data::dataloader::batcher::Batcher;
use burn::data::dataset::Dataset;
use burn::prelude::*;
use cd_core::{BatchConfig, Error, ImageShape, Result};
use tracing::{error, warn};

use crate::annotations::{LoadAnnotations, SegMap};
use crate::dataset::PairDataset;
use crate::loader::{LoadImagePair, PixelArray};

/// A loaded image pair ready for batching
#[derive(Clone, Debug)]
pub struct PairItem {
    /// Channel-stacked pair, `H x W x C`
    pub image: PixelArray,
    pub gt_seg: Option<SegMap>,
    /// Sample name relative to the pair-key directory
    pub stem: String,
    pub image_paths: Vec<PathBuf>,
    pub ori_shape: ImageShape,
}

/// Lazily loaded change detection dataset
#[derive(Clone)]
pub struct ChangeDetectionDataset {
    dataset: Arc<dyn PairDataset>,
    loader: LoadImagePair,
    annotations: LoadAnnotations,
}

impl ChangeDetectionDataset {
    pub fn new(dataset: Arc<dyn PairDataset>, loader: LoadImagePair) -> Self {
        Self {
            dataset,
            loader,
            annotations: LoadAnnotations::new(),
        }
    }

    pub fn inner(&self) -> &dyn PairDataset {
        self.dataset.as_ref()
    }

    /// Loads sample `index`.
    ///
    /// `Ok(None)` when the index is out of range or the loader skipped the pair.
    pub fn try_get(&self, index: usize) -> Result<Option<PairItem>> {
        let Some(sample) = self.dataset.get_data_info(index) else {
            return Ok(None);
        };
        let Some(mut pair) = self.loader.transform(&sample)? else {
            warn!("Skipping sample {} with missing images", index);
            return Ok(None);
        };
        self.annotations.transform(&mut pair)?;

        Ok(Some(PairItem {
            image: pair.image,
            gt_seg: pair.gt_seg_map,
            stem: pair.sample.stem,
            image_paths: pair.sample.image_paths,
            ori_shape: pair.ori_shape,
        }))
    }
}

impl std::fmt::Debug for ChangeDetectionDataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeDetectionDataset")
            .field("len", &PairDataset::len(self.dataset.as_ref()))
            .field("loader", &self.loader)
            .finish()
    }
}

impl Dataset<PairItem> for ChangeDetectionDataset {
    fn get(&self, index: usize) -> Option<PairItem> {
        match self.try_get(index) {
            Ok(item) => item,
            Err(e) => {
                error!("Failed to load sample {}: {}", index, e);
                None
            }
        }
    }

    fn len(&self) -> usize {
        PairDataset::len(self.dataset.as_ref())
    }
}

/// A batch of image pairs
#[derive(Clone, Debug)]
pub struct PairBatch<B: Backend> {
    /// Padded pairs with shape [batch_size, channels, height, width]
    pub inputs: Tensor<B, 4>,
    /// Padded label maps with shape [batch_size, height, width], when every item has one
    pub gt_seg: Option<Tensor<B, 3, Int>>,
    pub ori_shapes: Vec<ImageShape>,
    pub stems: Vec<String>,
    pub image_paths: Vec<Vec<PathBuf>>,
}

/// Pads image pairs bottom/right to a common size and stacks them
#[derive(Clone, Debug)]
pub struct PairBatcher<B: Backend> {
    device: B::Device,
    size: Option<[usize; 2]>,
    pad_val: f32,
    seg_pad_val: u8,
}

impl<B: Backend> PairBatcher<B> {
    /// Batcher padding to the largest item of each batch
    pub fn new(device: B::Device) -> Self {
        Self::from_config(device, &BatchConfig::default())
    }

    pub fn from_config(device: B::Device, config: &BatchConfig) -> Self {
        Self {
            device,
            size: config.size,
            pad_val: config.pad_val,
            seg_pad_val: config.seg_pad_val,
        }
    }

    fn target_size(&self, items: &[PairItem]) -> (usize, usize) {
        match self.size {
            Some([height, width]) => (height, width),
            None => items.iter().fold((0, 0), |(h, w), item| {
                (h.max(item.image.height), w.max(item.image.width))
            }),
        }
    }

    /// Batches `items`, failing when their channel counts differ.
    pub fn try_batch(&self, items: Vec<PairItem>) -> Result<PairBatch<B>> {
        if let Some(first) = items.first() {
            if let Some(other) = items.iter().find(|item| item.image.channels != first.image.channels) {
                return Err(Error::Shape(format!(
                    "pair '{}' has {} channels but pair '{}' in the same batch has {}",
                    other.stem, other.image.channels, first.stem, first.image.channels
                )));
            }
        }
        Ok(self.collate(items))
    }

    /// Every item must have the channel count of the first one
    fn collate(&self, items: Vec<PairItem>) -> PairBatch<B> {
        let batch_size = items.len();
        let channels = items.first().map(|item| item.image.channels).unwrap_or(0);
        let (height, width) = self.target_size(&items);
        let plane = height * width;

        let mut inputs = vec![self.pad_val; batch_size * channels * plane];
        for (b, item) in items.iter().enumerate() {
            if item.image.height > height || item.image.width > width {
                warn!(
                    "Cropping {}x{} pair to the batch size {}x{}",
                    item.image.height, item.image.width, height, width
                );
            }

            // HWC -> CHW
            let pixels = item.image.to_f32_vec();
            for y in 0..item.image.height.min(height) {
                for x in 0..item.image.width.min(width) {
                    let src = (y * item.image.width + x) * channels;
                    for c in 0..channels {
                        inputs[(b * channels + c) * plane + y * width + x] = pixels[src + c];
                    }
                }
            }
        }

        let inputs = Tensor::<B, 4>::from_floats(
            TensorData::new(inputs, [batch_size, channels, height, width]),
            &self.device,
        );

        let gt_seg = if !items.is_empty() && items.iter().all(|item| item.gt_seg.is_some()) {
            let mut labels = vec![self.seg_pad_val as i64; batch_size * plane];
            for (b, seg) in items.iter().filter_map(|item| item.gt_seg.as_ref()).enumerate() {
                for y in 0..seg.height.min(height) {
                    for x in 0..seg.width.min(width) {
                        labels[b * plane + y * width + x] = seg.get(y, x) as i64;
                    }
                }
            }
            Some(Tensor::<B, 3, Int>::from_data(
                TensorData::new(labels, [batch_size, height, width]),
                &self.device,
            ))
        } else {
            None
        };

        PairBatch {
            inputs,
            gt_seg,
            ori_shapes: items.iter().map(|item| item.ori_shape).collect(),
            stems: items.iter().map(|item| item.stem.clone()).collect(),
            image_paths: items.into_iter().map(|item| item.image_paths).collect(),
        }
    }
}

impl<B: Backend> Batcher<PairItem, PairBatch<B>> for PairBatcher<B> {
    /// Pairs whose channel count differs from the first pair are dropped.
    fn batch(&self, items: Vec<PairItem>) -> PairBatch<B> {
        let channels = items.first().map(|item| item.image.channels);
        let items = items
            .into_iter()
            .filter(|item| {
                let keep = Some(item.image.channels) == channels;
                if !keep {
                    error!(
                        "Dropping pair '{}' with {} channels from a batch of {:?}-channel pairs",
                        item.stem, item.image.channels, channels
                    );
                }
                keep
            })
            .collect();
        self.collate(items)
    }
}
