//! Convolutional pyramid encoder.
//!
//! A patch embedding conv (kernel = stride = `patch_size`) is followed by one
//! stage per entry of `depths`. Every stage after the first starts with a 2x2
//! max pool and doubles the width, giving a four-level pyramid at strides
//! 4, 8, 16 and 32 with the default configuration.

use burn::{
    module::{Ignored, Module},
    nn::pool::{MaxPool2d, MaxPool2dConfig},
    tensor::{backend::Backend, Tensor},
};
use cd_core::{BackboneConfig, Error, Result};
use tracing::debug;

use crate::blocks::{ConvModule, ConvModuleConfig};

/// An encoder producing a feature pyramid, finest level first.
pub trait Backbone<B: Backend> {
    fn forward(&self, x: Tensor<B, 4>) -> Vec<Tensor<B, 4>>;

    /// Channels of every returned level
    fn out_channels(&self) -> Vec<usize>;
}

#[derive(Module, Debug)]
pub struct PyramidStage<B: Backend> {
    pub pool: Option<MaxPool2d>,
    pub convs: Vec<ConvModule<B>>,
}

impl<B: Backend> PyramidStage<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = match &self.pool {
            Some(pool) => pool.forward(x),
            None => x,
        };
        self.convs.iter().fold(x, |x, conv| conv.forward(x))
    }
}

#[derive(Module, Debug)]
pub struct ConvPyramid<B: Backend> {
    pub patch_embed: ConvModule<B>,
    pub stages: Vec<PyramidStage<B>>,
    out_indices: Ignored<Vec<usize>>,
    stage_channels: Ignored<Vec<usize>>,
}

impl<B: Backend> ConvPyramid<B> {
    pub fn new(config: &BackboneConfig, device: &B::Device) -> Result<Self> {
        if config.depths.is_empty() || config.depths.contains(&0) {
            return Err(Error::Config(format!(
                "backbone depths must list at least one stage and no empty stage, got {:?}",
                config.depths
            )));
        }
        if config.in_channels == 0 || config.embed_dims == 0 || config.patch_size == 0 {
            return Err(Error::Config(
                "backbone in_channels, embed_dims and patch_size must be positive".into(),
            ));
        }

        let out_indices = match &config.out_indices {
            Some(indices) => indices.clone(),
            None => (0..config.depths.len()).collect(),
        };
        if let Some(bad) = out_indices.iter().find(|&&i| i >= config.depths.len()) {
            return Err(Error::Config(format!(
                "out index {bad} is out of range for {} stages",
                config.depths.len()
            )));
        }

        let patch_embed = ConvModuleConfig::new(config.in_channels, config.embed_dims, config.patch_size)
            .with_stride(config.patch_size)
            .with_padding(Some(0))
            .init(device);

        let stage_channels: Vec<usize> = (0..config.depths.len())
            .map(|i| config.embed_dims << i)
            .collect();

        let mut stages = Vec::with_capacity(config.depths.len());
        let mut input = config.embed_dims;
        for (i, (&depth, &width)) in config.depths.iter().zip(&stage_channels).enumerate() {
            let pool = (i > 0).then(|| MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init());
            let convs = (0..depth)
                .map(|d| {
                    let conv_in = if d == 0 { input } else { width };
                    ConvModule::new(conv_in, width, 3, 1, device)
                })
                .collect();
            stages.push(PyramidStage { pool, convs });
            input = width;
        }

        debug!(
            "Built conv pyramid with stage channels {:?}, returning levels {:?}",
            stage_channels, out_indices
        );

        Ok(Self {
            patch_embed,
            stages,
            out_indices: Ignored(out_indices),
            stage_channels: Ignored(stage_channels),
        })
    }
}

impl<B: Backend> Backbone<B> for ConvPyramid<B> {
    fn forward(&self, x: Tensor<B, 4>) -> Vec<Tensor<B, 4>> {
        let mut x = self.patch_embed.forward(x);
        let mut levels = Vec::with_capacity(self.stages.len());
        for stage in &self.stages {
            x = stage.forward(x);
            levels.push(x.clone());
        }
        self.out_indices.0.iter().map(|&i| levels[i].clone()).collect()
    }

    fn out_channels(&self) -> Vec<usize> {
        self.out_indices.0.iter().map(|&i| self.stage_channels.0[i]).collect()
    }
}
