//! Paired-image dataset library for change detection.
//!
//! This crate indexes image pairs on disk, loads and channel-stacks them,
//! reads their annotation maps and batches everything for burn.

pub mod annotations;
pub mod builder;
pub mod burn_dataset;
pub mod dataset;
pub mod levir;
pub mod loader;

pub use annotations::{LoadAnnotations, SegMap};
pub use builder::{build_change_detection_dataset, build_dataset, build_loader};
pub use burn_dataset::{ChangeDetectionDataset, PairBatch, PairBatcher, PairItem};
pub use dataset::{BaseCdDataset, PairDataset, PairDatasetOptions, PairSample};
pub use levir::{levir_metainfo, LevirCdDataset};
pub use loader::{LoadImagePair, LoadedPair, PixelArray, PixelData};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::annotations::*;
    pub use crate::builder::*;
    pub use crate::burn_dataset::*;
    pub use crate::dataset::*;
    pub use crate::levir::*;
    pub use crate::loader::*;
}
