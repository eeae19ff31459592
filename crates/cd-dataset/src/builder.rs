//! Builders resolving the dataset and transform tags of a configuration.

use std::sync::Arc;

use cd_core::{DatasetConfig, DatasetKind, ExperimentConfig, LoaderConfig, Result, TransformKind};
use tracing::debug;

use crate::burn_dataset::ChangeDetectionDataset;
use crate::dataset::{BaseCdDataset, PairDataset};
use crate::levir::LevirCdDataset;
use crate::loader::LoadImagePair;

pub fn build_dataset(config: &DatasetConfig) -> Result<Arc<dyn PairDataset>> {
    debug!("Building dataset '{}'", config.kind);
    let dataset: Arc<dyn PairDataset> = match config.kind {
        DatasetKind::BaseCd => Arc::new(BaseCdDataset::from_config(config)?),
        DatasetKind::LevirCd => Arc::new(LevirCdDataset::from_config(config)?),
    };
    Ok(dataset)
}

pub fn build_loader(config: &LoaderConfig) -> LoadImagePair {
    match config.kind {
        TransformKind::LoadImagePair => LoadImagePair::from_config(config),
    }
}

/// Indexer plus loading transforms, ready for a burn `DataLoader`.
pub fn build_change_detection_dataset(config: &ExperimentConfig) -> Result<ChangeDetectionDataset> {
    let dataset = build_dataset(&config.dataset)?;
    Ok(ChangeDetectionDataset::new(dataset, build_loader(&config.loader)))
}
