//! Convolution building blocks shared by the encoder and the decode heads.

use burn::{
    config::Config,
    module::{Ignored, Module},
    nn::{
        conv::{Conv2d, Conv2dConfig, ConvTranspose2d, ConvTranspose2dConfig},
        BatchNorm, BatchNormConfig, PaddingConfig2d, Relu,
    },
    tensor::{backend::Backend, Tensor},
};
use cd_core::InterpMode;

use crate::decode_head::resize;

/// Configuration of a conv-BN-ReLU layer
#[derive(Config, Debug)]
pub struct ConvModuleConfig {
    pub in_channels: usize,
    pub out_channels: usize,
    pub kernel_size: usize,
    #[config(default = "1")]
    pub stride: usize,
    #[config(default = "1")]
    pub dilation: usize,
    /// Defaults to the padding that keeps the spatial size at stride 1
    #[config(default = "None")]
    pub padding: Option<usize>,
}

impl ConvModuleConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> ConvModule<B> {
        let padding = self
            .padding
            .unwrap_or(self.dilation * (self.kernel_size - 1) / 2);

        let conv = Conv2dConfig::new(
            [self.in_channels, self.out_channels],
            [self.kernel_size, self.kernel_size],
        )
        .with_stride([self.stride, self.stride])
        .with_dilation([self.dilation, self.dilation])
        .with_padding(PaddingConfig2d::Explicit(padding, padding))
        .with_bias(false)
        .init(device);

        ConvModule {
            conv,
            bn: BatchNormConfig::new(self.out_channels).init(device),
            relu: Relu::new(),
        }
    }
}

/// Conv2d followed by BatchNorm and ReLU
#[derive(Module, Debug)]
pub struct ConvModule<B: Backend> {
    pub conv: Conv2d<B>,
    pub bn: BatchNorm<B, 2>,
    pub relu: Relu,
}

impl<B: Backend> ConvModule<B> {
    /// Same-size `kernel x kernel` layer
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        dilation: usize,
        device: &B::Device,
    ) -> Self {
        ConvModuleConfig::new(in_channels, out_channels, kernel_size)
            .with_dilation(dilation)
            .init(device)
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(x);
        let x = self.bn.forward(x);
        self.relu.forward(x)
    }
}

/// Stack of 3x3 conv layers; only the layers after the first are dilated
#[derive(Module, Debug)]
pub struct BasicConvBlock<B: Backend> {
    pub convs: Vec<ConvModule<B>>,
}

impl<B: Backend> BasicConvBlock<B> {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        num_convs: usize,
        dilation: usize,
        device: &B::Device,
    ) -> Self {
        let convs = (0..num_convs)
            .map(|i| {
                let (input, dilation) = if i == 0 {
                    (in_channels, 1)
                } else {
                    (out_channels, dilation)
                };
                ConvModule::new(input, out_channels, 3, dilation, device)
            })
            .collect();

        Self { convs }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.convs.iter().fold(x, |x, conv| conv.forward(x))
    }
}

/// Interpolation to a target size followed by a 1x1 conv
#[derive(Module, Debug)]
pub struct InterpConv<B: Backend> {
    pub conv: ConvModule<B>,
    mode: Ignored<InterpMode>,
}

impl<B: Backend> InterpConv<B> {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        mode: InterpMode,
        device: &B::Device,
    ) -> Self {
        Self {
            conv: ConvModule::new(in_channels, out_channels, 1, 1, device),
            mode: Ignored(mode),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>, size: [usize; 2]) -> Tensor<B, 4> {
        self.conv.forward(resize(x, size, self.mode.0))
    }
}

/// Stride-2 transposed convolution with BatchNorm and ReLU, doubles the resolution.
///
/// Outputs that miss the target size (odd skip sizes) are resized with `mode`.
#[derive(Module, Debug)]
pub struct Deconv<B: Backend> {
    pub deconv: ConvTranspose2d<B>,
    pub bn: BatchNorm<B, 2>,
    pub relu: Relu,
    mode: Ignored<InterpMode>,
}

impl<B: Backend> Deconv<B> {
    pub fn new(in_channels: usize, out_channels: usize, mode: InterpMode, device: &B::Device) -> Self {
        let deconv = ConvTranspose2dConfig::new([in_channels, out_channels], [4, 4])
            .with_stride([2, 2])
            .with_padding([1, 1])
            .with_bias(false)
            .init(device);

        Self {
            deconv,
            bn: BatchNormConfig::new(out_channels).init(device),
            relu: Relu::new(),
            mode: Ignored(mode),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>, size: [usize; 2]) -> Tensor<B, 4> {
        let x = self.deconv.forward(x);
        let x = self.bn.forward(x);
        resize(self.relu.forward(x), size, self.mode.0)
    }
}

/// Input branch of an [`UpConvBlock`]
#[derive(Module, Debug)]
pub enum UpBranch<B: Backend> {
    Interp(InterpConv<B>),
    Deconv(Deconv<B>),
    /// 1x1 conv without resampling
    Project(ConvModule<B>),
}

impl<B: Backend> UpBranch<B> {
    /// `size` is the skip feature size, or twice the input size without a skip
    pub fn forward(&self, x: Tensor<B, 4>, size: [usize; 2]) -> Tensor<B, 4> {
        match self {
            UpBranch::Interp(block) => block.forward(x, size),
            UpBranch::Deconv(block) => block.forward(x, size),
            UpBranch::Project(block) => block.forward(x),
        }
    }
}

/// Decoder stage: bring the coarser feature to the skip feature, concatenate, convolve
#[derive(Module, Debug)]
pub struct UpConvBlock<B: Backend> {
    pub branch: UpBranch<B>,
    pub conv_block: BasicConvBlock<B>,
}

impl<B: Backend> UpConvBlock<B> {
    pub fn new(branch: UpBranch<B>, conv_block: BasicConvBlock<B>) -> Self {
        Self { branch, conv_block }
    }

    /// Fuses `x` with `skip`; without a skip the stage only upsamples `x` by two.
    pub fn forward(&self, skip: Option<Tensor<B, 4>>, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = match skip {
            Some(skip) => {
                let [_, _, height, width] = skip.dims();
                let up = self.branch.forward(x, [height, width]);
                Tensor::cat(vec![skip, up], 1)
            }
            None => {
                let [_, _, height, width] = x.dims();
                self.branch.forward(x, [height * 2, width * 2])
            }
        };
        self.conv_block.forward(x)
    }
}
