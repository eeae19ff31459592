//! Burn modules for paired-image change detection.
//!
//! This crate provides:
//! - Conv building blocks and a conv pyramid encoder
//! - The decode-head contract with a U-Net head and an FCN auxiliary head
//! - An encoder-decoder segmentor and the change detector built on it
//! - A builder resolving the model configuration, with pretrained loading

pub mod backbone;
pub mod blocks;
pub mod builder;
pub mod change_detector;
pub mod decode_head;
pub mod fcn_head;
pub mod preprocessor;
pub mod segmentor;
pub mod unet_head;

pub use backbone::{Backbone, ConvPyramid};
pub use builder::{build_segmentor, images_per_input, load_pretrained, save_weights};
pub use change_detector::ChangeDetector;
pub use decode_head::{cross_entropy, resize, DecodeHead};
pub use fcn_head::FcnHead;
pub use preprocessor::DataPreprocessor;
pub use segmentor::{EncoderDecoder, SegLosses, SegPrediction, Segmentor, SegmentorModel};
pub use unet_head::UNetHead;

/// Re-export commonly used types
pub mod prelude {
    pub use super::backbone::Backbone;
    pub use super::builder::build_segmentor;
    pub use super::decode_head::DecodeHead;
    pub use super::segmentor::{Segmentor, SegmentorModel};
}
