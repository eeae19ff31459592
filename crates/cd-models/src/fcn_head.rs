//! FCN auxiliary head.

use burn::{
    module::{Ignored, Module},
    tensor::{backend::Backend, Tensor},
};
use cd_core::{AuxiliaryHeadConfig, Error, InterpMode, LossConfig, Result};

use crate::blocks::ConvModule;
use crate::decode_head::{ClsSeg, DecodeHead};

/// Conv stack on a single pyramid level
#[derive(Module, Debug)]
pub struct FcnHead<B: Backend> {
    pub convs: Vec<ConvModule<B>>,
    pub conv_cat: Option<ConvModule<B>>,
    pub cls_seg: ClsSeg<B>,
    in_index: usize,
    num_classes: usize,
    interp_mode: Ignored<InterpMode>,
    loss: Ignored<LossConfig>,
}

impl<B: Backend> FcnHead<B> {
    pub fn new(config: &AuxiliaryHeadConfig, in_channels: usize, device: &B::Device) -> Result<Self> {
        if config.num_classes == 0 || config.channels == 0 {
            return Err(Error::Config(
                "auxiliary head channels and num_classes must be positive".into(),
            ));
        }
        if config.num_convs == 0 && in_channels != config.channels {
            return Err(Error::Config(format!(
                "an FCN head without convs needs in_channels ({in_channels}) == channels ({})",
                config.channels
            )));
        }

        let convs = (0..config.num_convs)
            .map(|i| {
                let input = if i == 0 { in_channels } else { config.channels };
                ConvModule::new(input, config.channels, 3, 1, device)
            })
            .collect();
        let conv_cat = config
            .concat_input
            .then(|| ConvModule::new(in_channels + config.channels, config.channels, 3, 1, device));

        Ok(Self {
            convs,
            conv_cat,
            cls_seg: ClsSeg::new(config.channels, config.num_classes, config.dropout_ratio, device),
            in_index: config.in_index,
            num_classes: config.num_classes,
            interp_mode: Ignored(config.interp_mode),
            loss: Ignored(config.loss.clone()),
        })
    }

    pub fn in_index(&self) -> usize {
        self.in_index
    }
}

impl<B: Backend> DecodeHead<B> for FcnHead<B> {
    fn forward(&self, inputs: &[Tensor<B, 4>]) -> Tensor<B, 4> {
        let x = inputs[self.in_index].clone();
        let mut output = self.convs.iter().fold(x.clone(), |x, conv| conv.forward(x));
        if let Some(conv_cat) = &self.conv_cat {
            output = conv_cat.forward(Tensor::cat(vec![x, output], 1));
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
