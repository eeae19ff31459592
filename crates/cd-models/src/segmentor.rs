//! Encoder-decoder segmentation.
//!
//! `loss` and `predict` take raw pixel batches and normalize them first;
//! `extract_feat` and `encode_decode` expect normalized inputs.

use burn::{
    module::{Ignored, Module},
    tensor::{backend::Backend, Int, Tensor},
};

use crate::backbone::{Backbone, ConvPyramid};
use crate::change_detector::ChangeDetector;
use crate::decode_head::DecodeHead;
use crate::fcn_head::FcnHead;
use crate::preprocessor::DataPreprocessor;
use crate::unet_head::UNetHead;

/// Losses of one training step
#[derive(Debug, Clone)]
pub struct SegLosses<B: Backend> {
    pub decode: Tensor<B, 1>,
    pub auxiliary: Option<Tensor<B, 1>>,
}

impl<B: Backend> SegLosses<B> {
    /// Sum of the decode and auxiliary losses
    pub fn total(&self) -> Tensor<B, 1> {
        match &self.auxiliary {
            Some(aux) => self.decode.clone() + aux.clone(),
            None => self.decode.clone(),
        }
    }
}

/// Inference output
#[derive(Debug, Clone)]
pub struct SegPrediction<B: Backend> {
    /// `[B, num_classes, H, W]` at the input resolution
    pub logits: Tensor<B, 4>,
    /// `[B, H, W]` argmax labels
    pub labels: Tensor<B, 3, Int>,
}

/// Capability interface of a segmentor.
///
/// Implementors provide feature extraction and their heads; the encode,
/// loss and predict steps are shared.
pub trait Segmentor<B: Backend> {
    fn extract_feat(&self, inputs: Tensor<B, 4>) -> Vec<Tensor<B, 4>>;

    fn decode_head(&self) -> &dyn DecodeHead<B>;

    fn auxiliary_head(&self) -> Option<&dyn DecodeHead<B>>;

    fn data_preprocessor(&self) -> &DataPreprocessor;

    /// Decode-head logits resized to the input size
    fn encode_decode(&self, inputs: Tensor<B, 4>) -> Tensor<B, 4> {
        let [_, _, height, width] = inputs.dims();
        let feats = self.extract_feat(inputs);
        self.decode_head().predict(&feats, [height, width])
    }

    fn loss(&self, inputs: Tensor<B, 4>, gt_seg: Tensor<B, 3, Int>) -> SegLosses<B> {
        let inputs = self.data_preprocessor().forward(inputs);
        let feats = self.extract_feat(inputs);

        let decode = self.decode_head().loss(&feats, gt_seg.clone());
        let auxiliary = self.auxiliary_head().map(|head| head.loss(&feats, gt_seg));
        SegLosses { decode, auxiliary }
    }

    fn predict(&self, inputs: Tensor<B, 4>) -> SegPrediction<B> {
        let inputs = self.data_preprocessor().forward(inputs);
        let logits = self.encode_decode(inputs);
        let labels = logits.clone().argmax(1).squeeze::<3>(1);
        SegPrediction { logits, labels }
    }
}

/// Single-image segmentor: backbone, decode head and optional auxiliary head
#[derive(Module, Debug)]
pub struct EncoderDecoder<B: Backend> {
    pub backbone: ConvPyramid<B>,
    pub decode_head: UNetHead<B>,
    pub auxiliary_head: Option<FcnHead<B>>,
    data_preprocessor: Ignored<DataPreprocessor>,
}

impl<B: Backend> EncoderDecoder<B> {
    pub fn new(
        backbone: ConvPyramid<B>,
        decode_head: UNetHead<B>,
        auxiliary_head: Option<FcnHead<B>>,
        data_preprocessor: DataPreprocessor,
    ) -> Self {
        Self {
            backbone,
            decode_head,
            auxiliary_head,
            data_preprocessor: Ignored(data_preprocessor),
        }
    }

    pub fn num_classes(&self) -> usize {
        self.decode_head.num_classes()
    }
}

impl<B: Backend> Segmentor<B> for EncoderDecoder<B> {
    fn extract_feat(&self, inputs: Tensor<B, 4>) -> Vec<Tensor<B, 4>> {
        self.backbone.forward(inputs)
    }

    fn decode_head(&self) -> &dyn DecodeHead<B> {
        &self.decode_head
    }

    fn auxiliary_head(&self) -> Option<&dyn DecodeHead<B>> {
        self.auxiliary_head
            .as_ref()
            .map(|head| head as &dyn DecodeHead<B>)
    }

    fn data_preprocessor(&self) -> &DataPreprocessor {
        &self.data_preprocessor.0
    }
}

/// Segmentor selected by the model configuration
#[derive(Module, Debug)]
pub enum SegmentorModel<B: Backend> {
    EncoderDecoder(EncoderDecoder<B>),
    ChangeDetector(ChangeDetector<B>),
}

impl<B: Backend> SegmentorModel<B> {
    pub fn num_classes(&self) -> usize {
        self.decode_head().num_classes()
    }

    pub fn name(&self) -> &'static str {
        match self {
            SegmentorModel::EncoderDecoder(_) => "encoder_decoder",
            SegmentorModel::ChangeDetector(_) => "change_detector",
        }
    }
}

impl<B: Backend> Segmentor<B> for SegmentorModel<B> {
    fn extract_feat(&self, inputs: Tensor<B, 4>) -> Vec<Tensor<B, 4>> {
        match self {
            SegmentorModel::EncoderDecoder(model) => model.extract_feat(inputs),
            SegmentorModel::ChangeDetector(model) => model.extract_feat(inputs),
        }
    }

    fn decode_head(&self) -> &dyn DecodeHead<B> {
        match self {
            SegmentorModel::EncoderDecoder(model) => model.decode_head(),
            SegmentorModel::ChangeDetector(model) => model.decode_head(),
        }
    }

    fn auxiliary_head(&self) -> Option<&dyn DecodeHead<B>> {
        match self {
            SegmentorModel::EncoderDecoder(model) => model.auxiliary_head(),
            SegmentorModel::ChangeDetector(model) => model.auxiliary_head(),
        }
    }

    fn data_preprocessor(&self) -> &DataPreprocessor {
        match self {
            SegmentorModel::EncoderDecoder(model) => model.data_preprocessor(),
            SegmentorModel::ChangeDetector(model) => model.data_preprocessor(),
        }
    }
}
