//! U-Net style decode head.
//!
//! With `k + 1` pyramid levels the head owns `k` decoder stages. Stage `i`
//! fuses the decoded feature coming from stage `i + 1` (or the coarsest
//! level for the last stage) with skip level `i`:
//!
//! ```text
//! level k ──► stage k-1 ──► ... ──► stage 0 ──► [final upsample] ──► cls_seg
//!               ▲                     ▲
//!          level k-1               level 0
//! ```
//!
//! Stage `i` outputs `channels * 2^i` channels, so the finest stage ends at
//! `channels`.

use burn::{
    module::{Ignored, Module},
    tensor::{backend::Backend, Tensor},
};
use cd_core::{DecodeHeadConfig, Error, InterpMode, LossConfig, Result, UpsampleKind};
use tracing::debug;

use crate::blocks::{BasicConvBlock, ConvModule, Deconv, InterpConv, UpBranch, UpConvBlock};
use crate::decode_head::{ClsSeg, DecodeHead};

#[derive(Module, Debug)]
pub struct UNetHead<B: Backend> {
    /// Finest stage first
    pub decoder: Vec<UpConvBlock<B>>,
    pub final_upsample: Option<UpConvBlock<B>>,
    pub cls_seg: ClsSeg<B>,
    in_index: Ignored<Vec<usize>>,
    num_classes: usize,
    interp_mode: Ignored<InterpMode>,
    loss: Ignored<LossConfig>,
}

fn check_len(name: &str, len: usize, stages: usize) -> Result<()> {
    if len != stages {
        return Err(Error::Config(format!(
            "{name} has {len} entries but the head has {stages} decoder stages"
        )));
    }
    Ok(())
}

impl<B: Backend> UNetHead<B> {
    /// Builds the head for pyramid levels with `in_channels` channels, finest first.
    pub fn new(config: &DecodeHeadConfig, in_channels: &[usize], device: &B::Device) -> Result<Self> {
        if in_channels.len() < 2 {
            return Err(Error::Config(format!(
                "the U-Net head needs at least two input levels, got {}",
                in_channels.len()
            )));
        }
        if config.channels == 0 || config.num_classes == 0 {
            return Err(Error::Config(
                "decode head channels and num_classes must be positive".into(),
            ));
        }

        let in_index = match &config.in_index {
            Some(index) => index.clone(),
            None => (0..in_channels.len()).collect(),
        };
        if in_index.len() != in_channels.len() {
            return Err(Error::Config(format!(
                "in_index selects {} levels but in_channels lists {}",
                in_index.len(),
                in_channels.len()
            )));
        }

        let stages = in_channels.len() - 1;
        check_len("num_convs", config.num_convs.len(), stages)?;
        check_len("dilations", config.dilations.len(), stages)?;
        check_len("upsamples", config.upsamples.len(), stages)?;

        let branch = |input: usize, output: usize, upsample: bool| -> UpBranch<B> {
            match (upsample, config.upsample) {
                (false, _) => UpBranch::Project(ConvModule::new(input, output, 1, 1, device)),
                (true, UpsampleKind::InterpConv) => {
                    UpBranch::Interp(InterpConv::new(input, output, config.interp_mode, device))
                }
                (true, UpsampleKind::Deconv) => {
                    UpBranch::Deconv(Deconv::new(input, output, config.interp_mode, device))
                }
            }
        };

        let mut decoder = Vec::with_capacity(stages);
        for i in 0..stages {
            let input = if i == stages - 1 {
                in_channels[stages]
            } else {
                config.channels << (i + 1)
            };
            let skip = in_channels[i];
            let output = config.channels << i;

            debug!("U-Net stage {i}: input {input}, skip {skip}, output {output}");
            decoder.push(UpConvBlock::new(
                branch(input, skip, config.upsamples[i]),
                BasicConvBlock::new(2 * skip, output, config.num_convs[i], config.dilations[i], device),
            ));
        }

        let final_upsample = config.final_upsample.then(|| {
            UpConvBlock::new(
                branch(config.channels, config.channels, true),
                BasicConvBlock::new(config.channels, config.channels, config.num_convs[0], 1, device),
            )
        });

        Ok(Self {
            decoder,
            final_upsample,
            cls_seg: ClsSeg::new(config.channels, config.num_classes, config.dropout_ratio, device),
            in_index: Ignored(in_index),
            num_classes: config.num_classes,
            interp_mode: Ignored(config.interp_mode),
            loss: Ignored(config.loss.clone()),
        })
    }

    pub fn num_stages(&self) -> usize {
        self.decoder.len()
    }

    /// Output resolution for a finest selected level of size `finest`
    pub fn output_size(&self, finest: [usize; 2]) -> [usize; 2] {
        match self.final_upsample {
            Some(_) => [finest[0] * 2, finest[1] * 2],
            None => finest,
        }
    }
}

impl<B: Backend> DecodeHead<B> for UNetHead<B> {
    fn forward(&self, inputs: &[Tensor<B, 4>]) -> Tensor<B, 4> {
        let feats: Vec<Tensor<B, 4>> = self.in_index.0.iter().map(|&i| inputs[i].clone()).collect();

        let mut output = feats[self.decoder.len()].clone();
        for (stage, skip) in self.decoder.iter().zip(feats).rev() {
            output = stage.forward(Some(skip), output);
        }
        if let Some(stage) = &self.final_upsample {
            output = stage.forward(None, output);
        }

        self.cls_seg.forward(output)
    }

    fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn loss_config(&self) -> &LossConfig {
        &self.loss.0
    }

    fn interp_mode(&self) -> InterpMode {
        self.interp_mode.0
    }
}
