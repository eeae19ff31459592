//! Change detection on channel-stacked image pairs.
//!
//! The input carries both images on the channel axis (`[B, 2C, H, W]`). The
//! shared encoder sees each image separately and the two pyramids are fused
//! level by level on the channel axis, `[first, second]`, so level `i` of the
//! fused pyramid has twice the encoder's channels.

use burn::{
    module::{Ignored, Module},
    tensor::{backend::Backend, Tensor},
};
use cd_core::FusionStrategy;

use crate::decode_head::DecodeHead;
use crate::preprocessor::DataPreprocessor;
use crate::segmentor::{EncoderDecoder, Segmentor};

#[derive(Module, Debug)]
pub struct ChangeDetector<B: Backend> {
    pub segmentor: EncoderDecoder<B>,
    fusion: Ignored<FusionStrategy>,
}

fn split_pair<B: Backend>(inputs: Tensor<B, 4>, dim: usize) -> (Tensor<B, 4>, Tensor<B, 4>) {
    let mut halves = inputs.chunk(2, dim).into_iter();
    match (halves.next(), halves.next()) {
        (Some(first), Some(second)) => (first, second),
        _ => panic!("paired input must split into two halves along dim {dim}"),
    }
}

impl<B: Backend> ChangeDetector<B> {
    pub fn new(segmentor: EncoderDecoder<B>, fusion: FusionStrategy) -> Self {
        Self {
            segmentor,
            fusion: Ignored(fusion),
        }
    }

    pub fn fusion(&self) -> FusionStrategy {
        self.fusion.0
    }

    /// Same model with another fusion strategy
    pub fn with_fusion(mut self, fusion: FusionStrategy) -> Self {
        self.fusion = Ignored(fusion);
        self
    }
}

impl<B: Backend> Segmentor<B> for ChangeDetector<B> {
    fn extract_feat(&self, inputs: Tensor<B, 4>) -> Vec<Tensor<B, 4>> {
        let (first, second) = split_pair(inputs, 1);

        match self.fusion.0 {
            FusionStrategy::SplitThenBatch => {
                let first = self.segmentor.extract_feat(first);
                let second = self.segmentor.extract_feat(second);
                first
                    .into_iter()
                    .zip(second)
                    .map(|(a, b)| Tensor::cat(vec![a, b], 1))
                    .collect()
            }
            FusionStrategy::BatchThenSplit => {
                let stacked = Tensor::cat(vec![first, second], 0);
                self.segmentor
                    .extract_feat(stacked)
                    .into_iter()
                    .map(|level| {
                        let (a, b) = split_pair(level, 0);
                        Tensor::cat(vec![a, b], 1)
                    })
                    .collect()
            }
        }
    }

    fn decode_head(&self) -> &dyn DecodeHead<B> {
        self.segmentor.decode_head()
    }

    fn auxiliary_head(&self) -> Option<&dyn DecodeHead<B>> {
        self.segmentor.auxiliary_head()
    }

    fn data_preprocessor(&self) -> &DataPreprocessor {
        self.segmentor.data_preprocessor()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backbone::{Backbone, ConvPyramid};
    use crate::segmentor::tests::{small_backbone, small_head};
    use crate::unet_head::UNetHead;
    use burn::tensor::Distribution;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn detector(fusion: FusionStrategy, device: &<TestBackend as Backend>::Device) -> ChangeDetector<TestBackend> {
        let backbone = ConvPyramid::new(&small_backbone(), device).unwrap();
        let fused: Vec<usize> = backbone.out_channels().iter().map(|c| c * 2).collect();
        let head = UNetHead::new(&small_head(), &fused, device).unwrap();
        let preprocessor = DataPreprocessor::new(vec![0.0; 6], vec![1.0; 6]).unwrap();
        ChangeDetector::new(EncoderDecoder::new(backbone, head, None, preprocessor), fusion)
    }

    #[test]
    fn test_fused_pyramid_doubles_channels() {
        let device = Default::default();
        let model = detector(FusionStrategy::SplitThenBatch, &device);
        let x = Tensor::<TestBackend, 4>::zeros([2, 6, 32, 32], &device);

        let feats = model.extract_feat(x);
        let dims: Vec<[usize; 4]> = feats.iter().map(|t| t.dims()).collect();
        assert_eq!(dims, vec![[2, 8, 8, 8], [2, 16, 4, 4], [2, 32, 2, 2]]);
    }

    #[test]
    fn test_fusion_strategies_agree_under_inference_normalization() {
        let device = Default::default();
        let split = detector(FusionStrategy::SplitThenBatch, &device);
        let x = Tensor::<TestBackend, 4>::random([2, 6, 32, 32], Distribution::Uniform(0.0, 1.0), &device);

        let split_feats = split.extract_feat(x.clone());
        let batched = split.with_fusion(FusionStrategy::BatchThenSplit);
        let batch_feats = batched.extract_feat(x);

        assert_eq!(split_feats.len(), batch_feats.len());
        for (a, b) in split_feats.into_iter().zip(batch_feats) {
            assert_eq!(a.dims(), b.dims());
            a.into_data().assert_approx_eq(&b.into_data(), 4);
        }
    }

    #[test]
    fn test_first_image_channels_come_first() {
        let device = Default::default();
        let model = detector(FusionStrategy::SplitThenBatch, &device);
        let first = Tensor::<TestBackend, 4>::zeros([1, 3, 16, 16], &device);
        let second = Tensor::<TestBackend, 4>::ones([1, 3, 16, 16], &device);

        let fused = model.extract_feat(Tensor::cat(vec![first.clone(), second], 1));
        let alone = model.segmentor.extract_feat(first);
        let [_, channels, _, _] = alone[0].dims();

        let head = fused[0].clone().narrow(1, 0, channels);
        head.into_data()
            .assert_approx_eq(&alone[0].clone().into_data(), 4);
    }

    #[test]
    fn test_predict_on_pair() {
        let device = Default::default();
        let model = detector(FusionStrategy::SplitThenBatch, &device);
        let x = Tensor::<TestBackend, 4>::ones([1, 6, 32, 32], &device);

        let prediction = model.predict(x);
        assert_eq!(prediction.logits.dims(), [1, 2, 32, 32]);
        assert_eq!(prediction.labels.dims(), [1, 32, 32]);
    }

    #[test]
    #[should_panic]
    fn test_odd_channels_fail_in_tensor_layer() {
        let device = Default::default();
        let model = detector(FusionStrategy::SplitThenBatch, &device);
        let x = Tensor::<TestBackend, 4>::zeros([1, 5, 16, 16], &device);
        let _ = model.extract_feat(x);
    }
}
