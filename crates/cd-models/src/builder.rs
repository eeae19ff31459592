//! Builds a segmentor from its configuration.

use std::path::Path;

use burn::{module::Module, record::CompactRecorder, tensor::backend::Backend};
use cd_core::{
    AuxiliaryHeadKind, BackboneKind, DecodeHeadKind, Error, ModelConfig, Result, SegmentorKind,
};
use tracing::{debug, info};

use crate::backbone::{Backbone, ConvPyramid};
use crate::change_detector::ChangeDetector;
use crate::fcn_head::FcnHead;
use crate::preprocessor::DataPreprocessor;
use crate::segmentor::{EncoderDecoder, SegmentorModel};
use crate::unet_head::UNetHead;

/// Number of images stacked on the channel axis of the segmentor input
pub fn images_per_input(kind: SegmentorKind) -> usize {
    match kind {
        SegmentorKind::EncoderDecoder => 1,
        SegmentorKind::ChangeDetector => 2,
    }
}

fn level_channels(out_channels: &[usize], index: usize, factor: usize) -> Result<usize> {
    out_channels
        .get(index)
        .map(|c| c * factor)
        .ok_or_else(|| {
            Error::Config(format!(
                "level {index} is not produced by the backbone ({} levels)",
                out_channels.len()
            ))
        })
}

pub fn build_segmentor<B: Backend>(config: &ModelConfig, device: &B::Device) -> Result<SegmentorModel<B>> {
    let factor = images_per_input(config.kind);

    let backbone = match config.backbone.kind {
        BackboneKind::ConvPyramid => ConvPyramid::new(&config.backbone, device)?,
    };
    let out_channels = backbone.out_channels();

    let preprocessor = DataPreprocessor::from_config(&config.preprocessor)?;
    let expected = config.backbone.in_channels * factor;
    if preprocessor.channels() != expected {
        return Err(Error::Config(format!(
            "preprocessor covers {} channels but a {} input has {expected}",
            preprocessor.channels(),
            config.kind.name()
        )));
    }

    let head_config = &config.decode_head;
    let in_channels = match (&head_config.in_channels, &head_config.in_index) {
        (Some(channels), _) => channels.clone(),
        (None, Some(index)) => index
            .iter()
            .map(|&i| level_channels(&out_channels, i, factor))
            .collect::<Result<Vec<_>>>()?,
        (None, None) => out_channels.iter().map(|c| c * factor).collect(),
    };
    let decode_head = match head_config.kind {
        DecodeHeadKind::Unet | DecodeHeadKind::SiameseUnet => {
            UNetHead::new(head_config, &in_channels, device)?
        }
    };
    debug!(
        "Decode head '{}' with input channels {:?}",
        head_config.kind.name(),
        in_channels
    );

    let auxiliary_head = match &config.auxiliary_head {
        Some(aux) => {
            let channels = match aux.in_channels {
                Some(channels) => channels,
                None => level_channels(&out_channels, aux.in_index, factor)?,
            };
            match aux.kind {
                AuxiliaryHeadKind::Fcn => Some(FcnHead::new(aux, channels, device)?),
            }
        }
        None => None,
    };

    let segmentor = EncoderDecoder::new(backbone, decode_head, auxiliary_head, preprocessor);
    let model = match config.kind {
        SegmentorKind::EncoderDecoder => SegmentorModel::EncoderDecoder(segmentor),
        SegmentorKind::ChangeDetector => {
            SegmentorModel::ChangeDetector(ChangeDetector::new(segmentor, config.fusion))
        }
    };
    info!(
        "Built {} with {} parameters",
        config.kind.name(),
        model.num_params()
    );

    match &config.pretrained {
        Some(path) => load_pretrained(model, path, device),
        None => Ok(model),
    }
}

/// Loads weights saved with [`save_weights`] into `module`.
pub fn load_pretrained<B: Backend, M: Module<B>>(module: M, path: &Path, device: &B::Device) -> Result<M> {
    info!("Loading pretrained weights from {}", path.display());
    let recorder = CompactRecorder::new();
    module
        .load_file(path, &recorder, device)
        .map_err(|e| Error::Model(format!("Failed to load weights from {}: {:?}", path.display(), e)))
}

pub fn save_weights<B: Backend, M: Module<B>>(module: M, path: &Path) -> Result<()> {
    let recorder = CompactRecorder::new();
    module
        .save_file(path, &recorder)
        .map_err(|e| Error::Model(format!("Failed to save weights to {}: {:?}", path.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segmentor::tests::{small_backbone, small_head};
    use crate::segmentor::Segmentor;
    use burn::tensor::Tensor;
    use burn_ndarray::NdArray;
    use cd_core::{AuxiliaryHeadConfig, DecodeHeadConfig, FusionStrategy, PreprocessorConfig};
    use tempfile::TempDir;

    type TestBackend = NdArray<f32>;

    fn small_model(kind: SegmentorKind) -> ModelConfig {
        let preprocessor = match kind {
            SegmentorKind::EncoderDecoder => PreprocessorConfig {
                mean: vec![0.0; 3],
                std: vec![1.0; 3],
            },
            SegmentorKind::ChangeDetector => PreprocessorConfig::default(),
        };
        ModelConfig {
            kind,
            preprocessor,
            backbone: small_backbone(),
            decode_head: small_head(),
            ..ModelConfig::default()
        }
    }

    #[test]
    fn test_change_detector_derives_doubled_channels() {
        let device = Default::default();
        let model = build_segmentor::<TestBackend>(&small_model(SegmentorKind::ChangeDetector), &device).unwrap();
        assert_eq!(model.name(), "change_detector");

        let x = Tensor::<TestBackend, 4>::zeros([1, 6, 32, 32], &device);
        let feats = model.extract_feat(x.clone());
        assert_eq!(feats[0].dims(), [1, 8, 8, 8]);
        assert_eq!(model.predict(x).logits.dims(), [1, 2, 32, 32]);
    }

    #[test]
    fn test_encoder_decoder_kind() {
        let device = Default::default();
        let model = build_segmentor::<TestBackend>(&small_model(SegmentorKind::EncoderDecoder), &device).unwrap();
        assert_eq!(model.name(), "encoder_decoder");

        let x = Tensor::<TestBackend, 4>::zeros([1, 3, 32, 32], &device);
        assert_eq!(model.encode_decode(x).dims(), [1, 2, 32, 32]);
    }

    #[test]
    fn test_fusion_is_forwarded() {
        let device = Default::default();
        let config = ModelConfig {
            fusion: FusionStrategy::BatchThenSplit,
            ..small_model(SegmentorKind::ChangeDetector)
        };
        match build_segmentor::<TestBackend>(&config, &device).unwrap() {
            SegmentorModel::ChangeDetector(model) => {
                assert_eq!(model.fusion(), FusionStrategy::BatchThenSplit)
            }
            other => panic!("unexpected segmentor {}", other.name()),
        }
    }

    #[test]
    fn test_auxiliary_head_channels_derived() {
        let device = Default::default();
        let config = ModelConfig {
            auxiliary_head: Some(AuxiliaryHeadConfig {
                in_index: 1,
                channels: 4,
                ..AuxiliaryHeadConfig::default()
            }),
            ..small_model(SegmentorKind::ChangeDetector)
        };
        let model = build_segmentor::<TestBackend>(&config, &device).unwrap();
        assert!(model.auxiliary_head().is_some());

        let bad = ModelConfig {
            auxiliary_head: Some(AuxiliaryHeadConfig {
                in_index: 7,
                ..AuxiliaryHeadConfig::default()
            }),
            ..small_model(SegmentorKind::ChangeDetector)
        };
        assert!(matches!(
            build_segmentor::<TestBackend>(&bad, &device),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_stage_list_mismatch_fails_at_build() {
        let device = Default::default();
        let config = ModelConfig {
            decode_head: DecodeHeadConfig {
                num_convs: vec![2, 2, 2],
                ..small_head()
            },
            ..small_model(SegmentorKind::ChangeDetector)
        };
        assert!(matches!(
            build_segmentor::<TestBackend>(&config, &device),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_preprocessor_channel_mismatch() {
        let device = Default::default();
        let config = ModelConfig {
            preprocessor: PreprocessorConfig {
                mean: vec![0.0; 3],
                std: vec![1.0; 3],
            },
            ..small_model(SegmentorKind::ChangeDetector)
        };
        assert!(matches!(
            build_segmentor::<TestBackend>(&config, &device),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_pretrained_round_trip() {
        let device = Default::default();
        let temp_dir = TempDir::new().unwrap();
        let weights = temp_dir.path().join("levir_unet");

        let config = small_model(SegmentorKind::ChangeDetector);
        let model = build_segmentor::<TestBackend>(&config, &device).unwrap();
        save_weights(model, &weights).unwrap();

        let pretrained = ModelConfig {
            pretrained: Some(weights),
            ..config
        };
        let model = build_segmentor::<TestBackend>(&pretrained, &device).unwrap();
        let x = Tensor::<TestBackend, 4>::zeros([1, 6, 16, 16], &device);
        assert_eq!(model.predict(x).labels.dims(), [1, 16, 16]);
    }

    #[test]
    fn test_missing_pretrained_is_model_error() {
        let device = Default::default();
        let config = ModelConfig {
            pretrained: Some("/nonexistent/weights".into()),
            ..small_model(SegmentorKind::ChangeDetector)
        };
        assert!(matches!(
            build_segmentor::<TestBackend>(&config, &device),
            Err(Error::Model(_))
        ));
    }
}
