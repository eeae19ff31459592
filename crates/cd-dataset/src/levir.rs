//! LEVIR-CD building change detection benchmark.

use cd_core::{DatasetConfig, MetaInfo, Result};

use crate::dataset::{BaseCdDataset, PairDataset, PairDatasetOptions, PairSample};

pub const LEVIR_CLASSES: [&str; 2] = ["background", "changed"];
pub const LEVIR_PALETTE: [[u8; 3]; 2] = [[0, 0, 0], [255, 255, 255]];

/// LEVIR-CD metainfo: background and changed pixels
pub fn levir_metainfo() -> MetaInfo {
    MetaInfo::new(&LEVIR_CLASSES, &LEVIR_PALETTE)
}

/// Defaults of the LEVIR-CD layout: `A`/`B` halves, PNG images and masks.
pub fn levir_defaults() -> PairDatasetOptions {
    PairDatasetOptions {
        pair_keys: vec!["A".to_string(), "B".to_string()],
        img_suffix: ".png".to_string(),
        seg_map_suffix: ".png".to_string(),
        ignore_background: false,
        ..PairDatasetOptions::default()
    }
}

#[derive(Debug, Clone)]
pub struct LevirCdDataset {
    inner: BaseCdDataset,
}

impl LevirCdDataset {
    pub fn new(options: PairDatasetOptions) -> Result<Self> {
        Ok(Self {
            inner: BaseCdDataset::new(options, levir_metainfo())?,
        })
    }

    pub fn from_config(config: &DatasetConfig) -> Result<Self> {
        Self::new(PairDatasetOptions::from_config(config, levir_defaults()))
    }

    pub fn inner(&self) -> &BaseCdDataset {
        &self.inner
    }
}

impl PairDataset for LevirCdDataset {
    fn load_data_list(&self) -> Result<Vec<PairSample>> {
        self.inner.load_data_list()
    }

    fn data_list(&self) -> &[PairSample] {
        self.inner.data_list()
    }

    fn metainfo(&self) -> &MetaInfo {
        self.inner.metainfo()
    }
}
