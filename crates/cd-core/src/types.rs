//! Core type definitions shared by the dataset and model crates.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Label used for pixels excluded from the loss
pub const IGNORE_INDEX: u8 = 255;

/// Class names and display colors of a dataset
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MetaInfo {
    pub classes: Vec<String>,
    pub palette: Vec<[u8; 3]>,
}

impl MetaInfo {
    pub fn new(classes: &[&str], palette: &[[u8; 3]]) -> Self {
        Self {
            classes: classes.iter().map(|c| c.to_string()).collect(),
            palette: palette.to_vec(),
        }
    }

    pub fn num_classes(&self) -> usize {
        self.classes.len()
    }

    /// Color for a label, black for unknown labels and the ignore index
    pub fn color(&self, label: u8) -> [u8; 3] {
        self.palette
            .get(label as usize)
            .copied()
            .unwrap_or([0, 0, 0])
    }
}

/// Mapping from annotation labels on disk to training labels
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LabelRemap {
    table: BTreeMap<u8, u8>,
}

impl LabelRemap {
    pub fn new(pairs: impl IntoIterator<Item = (u8, u8)>) -> Self {
        Self {
            table: pairs.into_iter().collect(),
        }
    }

    pub fn get(&self, label: u8) -> Option<u8> {
        self.table.get(&label).copied()
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u8, u8)> + '_ {
        self.table.iter().map(|(k, v)| (*k, *v))
    }
}

/// Spatial size of an image or map
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageShape {
    pub height: usize,
    pub width: usize,
}

impl ImageShape {
    pub fn new(height: usize, width: usize) -> Self {
        Self { height, width }
    }

    pub fn area(&self) -> usize {
        self.height * self.width
    }
}

impl std::fmt::Display for ImageShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.height, self.width)
    }
}
