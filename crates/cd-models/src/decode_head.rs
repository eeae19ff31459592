//! Decode-head contract: classification projection, resizing and loss.

use burn::{
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        Dropout, DropoutConfig,
    },
    tensor::{
        activation::log_softmax,
        backend::Backend,
        module::interpolate,
        ops::{InterpolateMode, InterpolateOptions},
        Int, Tensor,
    },
};
use cd_core::{InterpMode, LossConfig};

/// Resizes `x` to `size`, returning it untouched when it already matches.
pub fn resize<B: Backend>(x: Tensor<B, 4>, size: [usize; 2], mode: InterpMode) -> Tensor<B, 4> {
    let [_, _, height, width] = x.dims();
    if [height, width] == size {
        return x;
    }

    let mode = match mode {
        InterpMode::Bilinear => InterpolateMode::Bilinear,
        InterpMode::Nearest => InterpolateMode::Nearest,
    };
    interpolate(x, size, InterpolateOptions::new(mode))
}

/// Pixel-wise cross entropy over `[B, C, H, W]` logits and `[B, H, W]` labels.
///
/// Pixels labelled `ignore_index` contribute nothing. The sum is divided by
/// the number of pixels, or by the number of labelled pixels with
/// `avg_non_ignore`, and scaled by `loss_weight`.
pub fn cross_entropy<B: Backend>(
    logits: Tensor<B, 4>,
    target: Tensor<B, 3, Int>,
    config: &LossConfig,
) -> Tensor<B, 1> {
    let [batch, classes, height, width] = logits.dims();
    let n = batch * height * width;

    let logits = logits.permute([0, 2, 3, 1]).reshape([n, classes]);
    let target = target.reshape([n]);

    let ignored = target.clone().equal_elem(config.ignore_index as i64);
    let safe_target = target.mask_fill(ignored.clone(), 0);
    let valid = ignored.bool_not().float();

    let picked = log_softmax(logits, 1)
        .gather(1, safe_target.reshape([n, 1]))
        .reshape([n]);
    let total = (picked.neg() * valid.clone()).sum();

    let loss = if config.avg_non_ignore {
        total / valid.sum().clamp_min(1.0)
    } else {
        total.div_scalar(n.max(1) as f32)
    };
    loss.mul_scalar(config.loss_weight)
}

/// Dropout followed by a 1x1 conv to `num_classes` channels
#[derive(Module, Debug)]
pub struct ClsSeg<B: Backend> {
    pub dropout: Option<Dropout>,
    pub conv_seg: Conv2d<B>,
}

impl<B: Backend> ClsSeg<B> {
    pub fn new(channels: usize, num_classes: usize, dropout_ratio: f64, device: &B::Device) -> Self {
        let dropout = (dropout_ratio > 0.0).then(|| DropoutConfig::new(dropout_ratio).init());
        Self {
            dropout,
            conv_seg: Conv2dConfig::new([channels, num_classes], [1, 1]).init(device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = match &self.dropout {
            Some(dropout) => dropout.forward(x),
            None => x,
        };
        self.conv_seg.forward(x)
    }
}

/// A head mapping a feature pyramid to per-pixel class scores.
pub trait DecodeHead<B: Backend> {
    /// Class scores `[B, num_classes, H', W']`
    fn forward(&self, inputs: &[Tensor<B, 4>]) -> Tensor<B, 4>;

    fn num_classes(&self) -> usize;

    fn loss_config(&self) -> &LossConfig;

    fn interp_mode(&self) -> InterpMode;

    /// Weighted cross entropy of the logits resized to the label size
    fn loss(&self, inputs: &[Tensor<B, 4>], gt_seg: Tensor<B, 3, Int>) -> Tensor<B, 1> {
        let [_, height, width] = gt_seg.dims();
        let logits = resize(self.forward(inputs), [height, width], self.interp_mode());
        cross_entropy(logits, gt_seg, self.loss_config())
    }

    /// Logits resized to `size`
    fn predict(&self, inputs: &[Tensor<B, 4>], size: [usize; 2]) -> Tensor<B, 4> {
        resize(self.forward(inputs), size, self.interp_mode())
    }
}
