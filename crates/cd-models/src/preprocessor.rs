//! Per-channel input normalization.

use burn::tensor::{backend::Backend, Tensor, TensorData};
use cd_core::{Error, PreprocessorConfig, Result};

/// Applies `(x - mean) / std` per input channel
#[derive(Debug, Clone, PartialEq)]
pub struct DataPreprocessor {
    mean: Vec<f32>,
    std: Vec<f32>,
}

impl DataPreprocessor {
    pub fn new(mean: Vec<f32>, std: Vec<f32>) -> Result<Self> {
        if mean.len() != std.len() {
            return Err(Error::Config(format!(
                "preprocessor mean has {} values but std has {}",
                mean.len(),
                std.len()
            )));
        }
        if std.iter().any(|&s| s <= 0.0) {
            return Err(Error::Config("preprocessor std values must be positive".into()));
        }
        Ok(Self { mean, std })
    }

    pub fn from_config(config: &PreprocessorConfig) -> Result<Self> {
        Self::new(config.mean.clone(), config.std.clone())
    }

    /// Number of input channels the statistics cover
    pub fn channels(&self) -> usize {
        self.mean.len()
    }

    pub fn forward<B: Backend>(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let device = x.device();
        let channels = self.channels();
        let mean = Tensor::<B, 4>::from_floats(
            TensorData::new(self.mean.clone(), [1, channels, 1, 1]),
            &device,
        );
        let std = Tensor::<B, 4>::from_floats(
            TensorData::new(self.std.clone(), [1, channels, 1, 1]),
            &device,
        );
        (x - mean) / std
    }
}
