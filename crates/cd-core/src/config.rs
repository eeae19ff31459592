//! Configuration structures for the change detection workspace.
//!
//! Every component is selected by an enumerated tag (`kind`) that is resolved
//! once, when the builders in `cd-dataset` and `cd-models` run. Fields left out
//! of a TOML file fall back to the defaults below.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Complete configuration for a change detection experiment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    /// Dataset indexing
    pub dataset: DatasetConfig,
    /// Image pair loading
    pub loader: LoaderConfig,
    /// Batch collation
    pub batch: BatchConfig,
    /// Segmentor architecture
    pub model: ModelConfig,
}

/// Registered dataset implementations
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DatasetKind {
    /// Generic paired-image layout with configurable pair keys
    #[default]
    BaseCd,
    /// LEVIR-CD benchmark defaults
    LevirCd,
}

impl DatasetKind {
    pub fn name(&self) -> &'static str {
        match self {
            DatasetKind::BaseCd => "base_cd",
            DatasetKind::LevirCd => "levir_cd",
        }
    }
}

impl std::fmt::Display for DatasetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Dataset configuration.
///
/// Options left as `None` take the defaults of the selected [`DatasetKind`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetConfig {
    pub kind: DatasetKind,
    /// Root that relative directories and the manifest are joined onto
    pub data_root: Option<PathBuf>,
    /// Directory holding one subdirectory per pair key
    pub img_dir: Option<PathBuf>,
    /// Directory holding annotation maps
    pub ann_dir: Option<PathBuf>,
    /// Manifest with one sample stem per line
    pub ann_file: Option<PathBuf>,
    /// Subdirectory names of the pair halves, in load order
    pub pair_keys: Option<Vec<String>>,
    pub img_suffix: Option<String>,
    pub seg_map_suffix: Option<String>,
    /// Treat label 0 as ignored and shift the remaining labels down by one
    pub ignore_background: Option<bool>,
    /// Subset of the dataset classes to train on
    pub classes: Option<Vec<String>>,
    /// Explicit `(old, new)` label pairs, overrides the table derived from `classes`
    pub label_remap: Option<Vec<(u8, u8)>>,
    /// Keep only the first N samples
    pub indices: Option<usize>,
}

/// Registered data-loading transforms
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransformKind {
    #[default]
    LoadImagePair,
}

impl TransformKind {
    pub fn name(&self) -> &'static str {
        match self {
            TransformKind::LoadImagePair => "load_image_pair",
        }
    }
}

/// How decoded images are converted before concatenation
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ColorType {
    /// Three channel RGB
    #[default]
    Color,
    /// Single luminance channel
    Grayscale,
    /// Native channel count of the file, at 8 bits
    Unchanged,
}

/// Image pair loader configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    pub kind: TransformKind,
    /// Convert pixels to `f32` instead of keeping `u8`
    pub to_float32: bool,
    pub color_type: ColorType,
    /// Return no sample instead of an error when a file is missing
    pub ignore_empty: bool,
}

/// Batch collation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub batch_size: usize,
    /// Fixed `[height, width]` to pad every sample to; the batch maximum when unset
    pub size: Option<[usize; 2]>,
    pub pad_val: f32,
    pub seg_pad_val: u8,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 2,
            size: None,
            pad_val: 0.0,
            seg_pad_val: 255,
        }
    }
}

/// Registered segmentors
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SegmentorKind {
    /// Single image encoder-decoder
    EncoderDecoder,
    /// Paired-image change detector
    #[default]
    ChangeDetector,
}

impl SegmentorKind {
    pub fn name(&self) -> &'static str {
        match self {
            SegmentorKind::EncoderDecoder => "encoder_decoder",
            SegmentorKind::ChangeDetector => "change_detector",
        }
    }
}

/// How the change detector merges the features of the two images.
///
/// Both strategies produce the same fused shapes. They differ numerically when
/// normalization layers use batch statistics, because `BatchThenSplit` computes
/// those statistics over both images at once.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FusionStrategy {
    /// Split channels, one encoder call per image
    #[default]
    SplitThenBatch,
    /// Stack images on the batch axis, one encoder call
    BatchThenSplit,
}

/// Segmentor configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub kind: SegmentorKind,
    pub fusion: FusionStrategy,
    pub preprocessor: PreprocessorConfig,
    pub backbone: BackboneConfig,
    pub decode_head: DecodeHeadConfig,
    pub auxiliary_head: Option<AuxiliaryHeadConfig>,
    /// Weights saved with burn's `CompactRecorder`
    pub pretrained: Option<PathBuf>,
}

/// Per-channel normalization applied before the backbone
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessorConfig {
    pub mean: Vec<f32>,
    pub std: Vec<f32>,
}

impl Default for PreprocessorConfig {
    fn default() -> Self {
        // ImageNet statistics, once per image of the pair
        Self {
            mean: [123.675, 116.28, 103.53].repeat(2),
            std: [58.395, 57.12, 57.375].repeat(2),
        }
    }
}

/// Registered backbones
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BackboneKind {
    #[default]
    ConvPyramid,
}

/// Backbone configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackboneConfig {
    pub kind: BackboneKind,
    /// Channels of a single image
    pub in_channels: usize,
    /// Kernel size and stride of the patch embedding
    pub patch_size: usize,
    /// Width of the first stage, doubled at every following stage
    pub embed_dims: usize,
    /// Number of conv layers per stage
    pub depths: Vec<usize>,
    /// Stages returned by the backbone, all when unset
    pub out_indices: Option<Vec<usize>>,
}

impl Default for BackboneConfig {
    fn default() -> Self {
        Self {
            kind: BackboneKind::ConvPyramid,
            in_channels: 3,
            patch_size: 4,
            embed_dims: 96,
            depths: vec![2, 2, 2, 2],
            out_indices: None,
        }
    }
}

/// Registered decode heads
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DecodeHeadKind {
    #[default]
    Unet,
    SiameseUnet,
}

impl DecodeHeadKind {
    pub fn name(&self) -> &'static str {
        match self {
            DecodeHeadKind::Unet => "unet",
            DecodeHeadKind::SiameseUnet => "siamese_unet",
        }
    }
}

/// Upsample block used by decoder stages
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UpsampleKind {
    /// Interpolation followed by a 1x1 conv
    #[default]
    InterpConv,
    /// Stride-2 transposed convolution
    Deconv,
}

/// Interpolation mode for resizing feature maps and logits
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InterpMode {
    #[default]
    Bilinear,
    Nearest,
}

/// Pixel-wise cross entropy settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LossConfig {
    pub loss_weight: f32,
    /// Label excluded from the loss
    pub ignore_index: u8,
    /// Average over labelled pixels only instead of all pixels
    pub avg_non_ignore: bool,
}

impl Default for LossConfig {
    fn default() -> Self {
        Self {
            loss_weight: 1.0,
            ignore_index: 255,
            avg_non_ignore: false,
        }
    }
}

/// U-Net decode head configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecodeHeadConfig {
    pub kind: DecodeHeadKind,
    /// Channels of every pyramid level, finest first; derived from the backbone when unset
    pub in_channels: Option<Vec<usize>>,
    /// Pyramid levels consumed by the head, all when unset
    pub in_index: Option<Vec<usize>>,
    /// Base width of the decoder
    pub channels: usize,
    pub num_classes: usize,
    /// Conv layers per decoder stage, finest stage first
    pub num_convs: Vec<usize>,
    /// Whether each stage upsamples its input
    pub upsamples: Vec<bool>,
    /// Dilation of each stage
    pub dilations: Vec<usize>,
    pub upsample: UpsampleKind,
    pub interp_mode: InterpMode,
    pub dropout_ratio: f64,
    /// Append a stage without skip connection that doubles the output resolution
    pub final_upsample: bool,
    pub loss: LossConfig,
}

impl Default for DecodeHeadConfig {
    fn default() -> Self {
        Self {
            kind: DecodeHeadKind::Unet,
            in_channels: None,
            in_index: None,
            channels: 64,
            num_classes: 2,
            num_convs: vec![2, 2, 2],
            upsamples: vec![true, true, true],
            dilations: vec![1, 1, 1],
            upsample: UpsampleKind::InterpConv,
            interp_mode: InterpMode::Bilinear,
            dropout_ratio: 0.1,
            final_upsample: false,
            loss: LossConfig::default(),
        }
    }
}

/// Registered auxiliary heads
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuxiliaryHeadKind {
    #[default]
    Fcn,
}

/// FCN auxiliary head configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuxiliaryHeadConfig {
    pub kind: AuxiliaryHeadKind,
    /// Channels of the selected level; derived from the backbone when unset
    pub in_channels: Option<usize>,
    pub in_index: usize,
    pub channels: usize,
    pub num_convs: usize,
    /// Fuse the head input with the conv output before classification
    pub concat_input: bool,
    pub num_classes: usize,
    pub interp_mode: InterpMode,
    pub dropout_ratio: f64,
    pub loss: LossConfig,
}

impl Default for AuxiliaryHeadConfig {
    fn default() -> Self {
        Self {
            kind: AuxiliaryHeadKind::Fcn,
            in_channels: None,
            in_index: 2,
            channels: 256,
            num_convs: 1,
            concat_input: false,
            num_classes: 2,
            interp_mode: InterpMode::Bilinear,
            dropout_ratio: 0.1,
            loss: LossConfig {
                loss_weight: 0.4,
                ..LossConfig::default()
            },
        }
    }
}
