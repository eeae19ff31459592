//! Change Detection Prediction Tool
//!
//! Runs a configured change detector over a paired-image dataset, writes one
//! palette mask per sample and a JSON summary of the predicted change.

mod backend;

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use backend::{backend_name, default_device, DefaultBackend};
use burn::data::dataset::Dataset;
use burn::prelude::*;
use cd_core::{load_toml_config, setup_cli_logging, ExperimentConfig, ImageShape, MetaInfo, IGNORE_INDEX};
use cd_dataset::{build_change_detection_dataset, PairBatcher, PairDataset};
use cd_models::prelude::*;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Prediction configuration file: the experiment tables plus `[output]`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictConfig {
    #[serde(flatten)]
    pub experiment: ExperimentConfig,
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Directory receiving masks and the summary
    pub dir: PathBuf,
    /// Write a palette PNG per sample
    pub write_masks: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("work_dirs/predict"),
            write_masks: true,
        }
    }
}

/// Per-sample entry of `summary.json`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SampleSummary {
    pub name: String,
    pub image_paths: Vec<PathBuf>,
    pub shape: ImageShape,
    /// Fraction of pixels predicted as a non-background class
    pub changed_ratio: f32,
    /// Agreement with the annotation over non-ignored pixels
    pub pixel_accuracy: Option<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictSummary {
    pub model: String,
    pub classes: Vec<String>,
    pub samples: Vec<SampleSummary>,
}

#[derive(Parser, Debug)]
#[command(
    name = "predict",
    about = "Predict change masks for paired images",
    long_about = "Run a change detector over a paired-image dataset and write \
                  palette masks with a JSON summary."
)]
struct Args {
    /// Path to the configuration file (TOML)
    #[arg(short, long, value_name = "FILE")]
    config: PathBuf,

    /// Only predict the first N samples
    #[arg(short, long, value_name = "N")]
    limit: Option<usize>,

    /// Override batch size
    #[arg(short, long, value_name = "SIZE")]
    batch_size: Option<usize>,

    /// Override output directory
    #[arg(short, long, value_name = "DIR")]
    output: Option<PathBuf>,

    /// Validate the configuration and index the dataset without predicting
    #[arg(long)]
    dry_run: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    setup_cli_logging(args.verbose)?;

    info!("Change Detection - Prediction Tool");
    info!("==================================");

    let mut config: PredictConfig = load_toml_config(&args.config)
        .context("Failed to load configuration file")?;
    apply_overrides(&mut config, &args);
    validate_config(&config)?;
    print_config_summary(&config);

    if args.dry_run {
        let dataset = build_change_detection_dataset(&config.experiment)
            .context("Failed to build dataset")?;
        info!(
            "Configuration validated successfully (dry run), {} samples indexed",
            Dataset::len(&dataset)
        );
        return Ok(());
    }

    let summary = run_prediction(&config, args.limit)?;
    info!("Predicted {} samples", summary.samples.len());

    Ok(())
}

fn apply_overrides(config: &mut PredictConfig, args: &Args) {
    if let Some(batch_size) = args.batch_size {
        config.experiment.batch.batch_size = batch_size;
    }
    if let Some(ref output) = args.output {
        config.output.dir = output.clone();
    }
}

fn validate_config(config: &PredictConfig) -> Result<()> {
    if config.experiment.batch.batch_size == 0 {
        anyhow::bail!("Batch size must be greater than 0");
    }
    if config.experiment.dataset.img_dir.is_none() {
        anyhow::bail!("[dataset] img_dir must be set");
    }
    if config.experiment.model.decode_head.num_classes == 0 {
        anyhow::bail!("Number of classes must be greater than 0");
    }
    Ok(())
}

fn print_config_summary(config: &PredictConfig) {
    let experiment = &config.experiment;
    info!("");
    info!("Configuration Summary:");
    info!("  Dataset: {}", experiment.dataset.kind);
    if let Some(dir) = &experiment.dataset.img_dir {
        info!("  Image dir: {}", dir.display());
    }
    info!("  Model: {}", experiment.model.kind.name());
    info!("  Decode head: {}", experiment.model.decode_head.kind.name());
    info!("  Fusion: {:?}", experiment.model.fusion);
    info!("  Batch size: {}", experiment.batch.batch_size);
    info!("  Backend: {}", backend_name());
    info!("  Output dir: {}", config.output.dir.display());
    info!("");
}

fn run_prediction(config: &PredictConfig, limit: Option<usize>) -> Result<PredictSummary> {
    let experiment = &config.experiment;
    let device = default_device();

    let dataset = build_change_detection_dataset(experiment).context("Failed to build dataset")?;
    let metainfo = dataset.inner().metainfo().clone();
    let model = build_segmentor::<DefaultBackend>(&experiment.model, &device)
        .context("Failed to build segmentor")?;
    let batcher = PairBatcher::<DefaultBackend>::from_config(device, &experiment.batch);

    let total = limit.map_or(Dataset::len(&dataset), |n| n.min(Dataset::len(&dataset)));
    info!("Predicting {} samples", total);

    fs::create_dir_all(&config.output.dir).with_context(|| {
        format!("Failed to create output directory: {}", config.output.dir.display())
    })?;
    let mask_dir = config.output.dir.join("masks");
    if config.output.write_masks {
        fs::create_dir_all(&mask_dir).context("Failed to create mask directory")?;
    }

    let progress = ProgressBar::new(total as u64);
    progress.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} pairs ({eta})")?
            .progress_chars("=>-"),
    );

    let mut samples = Vec::with_capacity(total);
    let indices: Vec<usize> = (0..total).collect();
    for chunk in indices.chunks(experiment.batch.batch_size) {
        let mut items = Vec::with_capacity(chunk.len());
        for &index in chunk {
            match dataset.try_get(index)? {
                Some(item) => items.push(item),
                None => warn!("Sample {} was skipped", index),
            }
        }
        progress.inc(chunk.len() as u64);
        if items.is_empty() {
            continue;
        }

        let batch = batcher.try_batch(items)?;
        let [batch_size, height, width] = [
            batch.inputs.dims()[0],
            batch.inputs.dims()[2],
            batch.inputs.dims()[3],
        ];
        let labels = int_tensor_to_vec(model.predict(batch.inputs).labels)?;
        let gt = batch.gt_seg.map(int_tensor_to_vec).transpose()?;

        for b in 0..batch_size {
            let offset = b * height * width;
            let shape = ImageShape::new(
                batch.ori_shapes[b].height.min(height),
                batch.ori_shapes[b].width.min(width),
            );
            let mask = crop(&labels[offset..offset + height * width], width, shape);
            let gt_mask = gt
                .as_ref()
                .map(|gt| crop(&gt[offset..offset + height * width], width, shape));

            let image_paths = batch.image_paths[b].clone();
            let name = sample_name(&batch.stems[b], samples.len());
            if config.output.write_masks {
                let path = mask_dir.join(format!("{name}.png"));
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)
                        .with_context(|| format!("Failed to create {}", parent.display()))?;
                }
                write_mask(&path, &mask, shape, &metainfo, model.num_classes())?;
                debug!("Mask written to {}", path.display());
            }

            samples.push(SampleSummary {
                name,
                image_paths,
                shape,
                changed_ratio: changed_ratio(&mask),
                pixel_accuracy: gt_mask.and_then(|gt| pixel_accuracy(&mask, &gt)),
            });
        }
    }
    progress.finish_with_message("Prediction completed");

    let summary = PredictSummary {
        model: model.name().to_string(),
        classes: metainfo.classes.clone(),
        samples,
    };
    let summary_path = config.output.dir.join("summary.json");
    let json = serde_json::to_string_pretty(&summary)?;
    fs::write(&summary_path, json)
        .with_context(|| format!("Failed to write summary: {}", summary_path.display()))?;
    info!("Summary saved to: {}", summary_path.display());

    Ok(summary)
}

fn int_tensor_to_vec<B: Backend>(tensor: Tensor<B, 3, Int>) -> Result<Vec<u8>> {
    let values = tensor
        .into_data()
        .convert::<i64>()
        .to_vec::<i64>()
        .map_err(|e| anyhow::anyhow!("Failed to read label tensor: {:?}", e))?;
    Ok(values.into_iter().map(|v| v.clamp(0, 255) as u8).collect())
}

/// Top-left `shape` window of a row-major map with `stride` columns
fn crop(map: &[u8], stride: usize, shape: ImageShape) -> Vec<u8> {
    (0..shape.height)
        .flat_map(|y| map[y * stride..y * stride + shape.width].iter().copied())
        .collect()
}

fn changed_ratio(mask: &[u8]) -> f32 {
    if mask.is_empty() {
        return 0.0;
    }
    mask.iter().filter(|&&l| l != 0).count() as f32 / mask.len() as f32
}

fn pixel_accuracy(mask: &[u8], gt: &[u8]) -> Option<f32> {
    let (correct, valid) = mask
        .iter()
        .zip(gt)
        .filter(|(_, g)| **g != IGNORE_INDEX)
        .fold((0usize, 0usize), |(c, v), (&p, &g)| (c + usize::from(p == g), v + 1));
    (valid > 0).then(|| correct as f32 / valid as f32)
}

/// Mask name from the sample stem, keeping its subdirectories.
///
/// Stems that are empty or would leave the mask directory fall back to the
/// running index.
fn sample_name(stem: &str, index: usize) -> String {
    let path = Path::new(stem);
    let inside = path
        .components()
        .all(|c| matches!(c, std::path::Component::Normal(_)));
    if stem.is_empty() || !inside {
        return format!("{index:06}");
    }
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Palette color of `label`; labels without one are drawn as gray levels
fn mask_color(metainfo: &MetaInfo, label: u8, num_classes: usize) -> [u8; 3] {
    if (label as usize) < metainfo.palette.len() {
        return metainfo.color(label);
    }
    let level = (label as usize * 255 / num_classes.saturating_sub(1).max(1)).min(255) as u8;
    [level; 3]
}

fn write_mask(
    path: &Path,
    mask: &[u8],
    shape: ImageShape,
    metainfo: &MetaInfo,
    num_classes: usize,
) -> Result<()> {
    let width = shape.width as u32;
    let height = shape.height as u32;
    let image = image::RgbImage::from_fn(width, height, |x, y| {
        let label = mask[y as usize * shape.width + x as usize];
        image::Rgb(mask_color(metainfo, label, num_classes))
    });
    image
        .save(path)
        .with_context(|| format!("Failed to write mask: {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cd_core::{BackboneConfig, ColorType, DatasetConfig, DatasetKind, DecodeHeadConfig};
    use tempfile::TempDir;

    #[test]
    fn test_args_parse() {
        let args = Args::try_parse_from([
            "predict", "--config", "levir.toml", "--limit", "4", "-b", "8", "--dry-run",
        ])
        .unwrap();
        assert_eq!(args.config, PathBuf::from("levir.toml"));
        assert_eq!(args.limit, Some(4));
        assert_eq!(args.batch_size, Some(8));
        assert!(args.dry_run);
        assert!(!args.verbose);

        assert!(Args::try_parse_from(["predict"]).is_err());
    }

    #[test]
    fn test_config_with_output_section() {
        let config: PredictConfig = toml::from_str(
            r#"
            [dataset]
            kind = "levir_cd"
            img_dir = "data/test"

            [batch]
            batch_size = 4

            [output]
            dir = "out"
            write_masks = false
            "#,
        )
        .unwrap();

        assert_eq!(config.experiment.batch.batch_size, 4);
        assert_eq!(config.output.dir, PathBuf::from("out"));
        assert!(!config.output.write_masks);
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_overrides_and_validation() {
        let mut config = PredictConfig::default();
        assert!(validate_config(&config).is_err());

        config.experiment.dataset.img_dir = Some("data".into());
        let args = Args::try_parse_from(["predict", "-c", "x.toml", "-b", "0", "-o", "elsewhere"]).unwrap();
        apply_overrides(&mut config, &args);
        assert_eq!(config.output.dir, PathBuf::from("elsewhere"));
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_crop_and_ratios() {
        let map = [1, 0, 9, 0, 1, 9, 9, 9, 9];
        let mask = crop(&map, 3, ImageShape::new(2, 2));
        assert_eq!(mask, vec![1, 0, 0, 1]);
        assert_eq!(changed_ratio(&mask), 0.5);

        let gt = [1, 1, IGNORE_INDEX, 1];
        assert_eq!(pixel_accuracy(&mask, &gt), Some(2.0 / 3.0));
        assert_eq!(pixel_accuracy(&mask, &[IGNORE_INDEX; 4]), None);
    }

    #[test]
    fn test_mask_color_fallback() {
        let levir = MetaInfo::new(&["background", "changed"], &[[0, 0, 0], [255, 255, 255]]);
        assert_eq!(mask_color(&levir, 1, 2), [255, 255, 255]);
        assert_eq!(mask_color(&MetaInfo::default(), 1, 2), [255; 3]);
        assert_eq!(mask_color(&MetaInfo::default(), 1, 3), [127; 3]);
        assert_eq!(mask_color(&MetaInfo::default(), 0, 1), [0; 3]);
    }

    #[test]
    fn test_sample_name() {
        assert_eq!(sample_name("train_1", 3), "train_1");
        assert_eq!(sample_name("east/tile", 3), "east/tile");
        assert_eq!(sample_name("", 3), "000003");
        assert_eq!(sample_name("../escape", 4), "000004");
        assert_eq!(sample_name("/abs/tile", 5), "000005");
    }

    fn save_pair(data: &Path, stem: &str) {
        for (key, value) in [("A", 40u8), ("B", 200u8)] {
            let path = data.join(key).join(format!("{stem}.png"));
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            image::RgbImage::from_fn(24, 16, |_, _| image::Rgb([value; 3]))
                .save(path)
                .unwrap();
        }
    }

    fn small_config(data: &Path, out: &Path) -> PredictConfig {
        let mut config = PredictConfig::default();
        config.output.dir = out.to_path_buf();
        config.experiment.dataset = DatasetConfig {
            kind: DatasetKind::LevirCd,
            img_dir: Some(data.to_path_buf()),
            ..DatasetConfig::default()
        };
        config.experiment.loader.color_type = ColorType::Color;
        config.experiment.model.backbone = BackboneConfig {
            embed_dims: 4,
            depths: vec![1, 1, 1],
            ..BackboneConfig::default()
        };
        config.experiment.model.decode_head = DecodeHeadConfig {
            channels: 4,
            num_convs: vec![1, 1],
            upsamples: vec![true, true],
            dilations: vec![1, 1],
            ..DecodeHeadConfig::default()
        };
        config
    }

    #[test]
    fn test_run_prediction_writes_masks_and_summary() {
        let temp_dir = TempDir::new().unwrap();
        let data = temp_dir.path().join("data");
        save_pair(&data, "pair_0");
        let config = small_config(&data, &temp_dir.path().join("out"));

        let summary = run_prediction(&config, None).unwrap();
        assert_eq!(summary.samples.len(), 1);
        let sample = &summary.samples[0];
        assert_eq!(sample.name, "pair_0");
        assert_eq!(sample.shape, ImageShape::new(16, 24));
        assert!((0.0..=1.0).contains(&sample.changed_ratio));
        assert_eq!(sample.pixel_accuracy, None);

        let mask = image::open(config.output.dir.join("masks/pair_0.png")).unwrap();
        assert_eq!((mask.width(), mask.height()), (24, 16));
        assert!(config.output.dir.join("summary.json").exists());
    }

    #[test]
    fn test_nested_samples_get_distinct_masks() {
        let temp_dir = TempDir::new().unwrap();
        let data = temp_dir.path().join("data");
        save_pair(&data, "east/tile");
        save_pair(&data, "west/tile");
        let config = small_config(&data, &temp_dir.path().join("out"));

        let summary = run_prediction(&config, None).unwrap();
        let names: Vec<&str> = summary.samples.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["east/tile", "west/tile"]);
        assert!(config.output.dir.join("masks/east/tile.png").is_file());
        assert!(config.output.dir.join("masks/west/tile.png").is_file());
    }
}
