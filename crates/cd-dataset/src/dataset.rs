//! Paired-image dataset indexing.
//!
//! A change detection sample is made of one image per pair key plus an
//! optional annotation map:
//!
//! ```text
//! img_dir/
//! ├── pre/
//! │   ├── xxx{img_suffix}
//! │   └── yyy{img_suffix}
//! └── post/
//!     ├── xxx{img_suffix}
//!     └── yyy{img_suffix}
//! ann_dir/
//! ├── xxx{seg_map_suffix}
//! └── yyy{seg_map_suffix}
//! ```
//!
//! When a manifest file exists, the stems are read from it, one per line.
//! Otherwise every file with the image suffix under the first pair key's
//! directory is indexed.

use std::collections::BTreeSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use cd_core::{DatasetConfig, Error, LabelRemap, MetaInfo, Result, IGNORE_INDEX};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// One indexed sample: the paths of an image pair and its annotation.
#[derive(Debug, Clone, PartialEq)]
pub struct PairSample {
    /// Name relative to the pair-key directory, without the image suffix
    pub stem: String,
    /// One path per pair key, in pair-key order
    pub image_paths: Vec<PathBuf>,
    pub annotation_path: Option<PathBuf>,
    /// Shared by every sample of the dataset
    pub label_remap: Option<Arc<LabelRemap>>,
    pub ignore_background: bool,
    /// Names of the per-sample fields added by later transforms
    pub auxiliary_fields: BTreeSet<String>,
}

/// Capability interface of a paired-image dataset.
pub trait PairDataset: Send + Sync {
    /// Index the samples from disk.
    fn load_data_list(&self) -> Result<Vec<PairSample>>;

    /// Samples indexed at construction.
    fn data_list(&self) -> &[PairSample];

    fn metainfo(&self) -> &MetaInfo;

    fn get_data_info(&self, index: usize) -> Option<PairSample> {
        self.data_list().get(index).cloned()
    }

    fn len(&self) -> usize {
        self.data_list().len()
    }

    fn is_empty(&self) -> bool {
        self.data_list().is_empty()
    }
}

/// Resolved options of a paired-image dataset
#[derive(Debug, Clone)]
pub struct PairDatasetOptions {
    pub data_root: Option<PathBuf>,
    pub img_dir: Option<PathBuf>,
    pub ann_dir: Option<PathBuf>,
    pub ann_file: Option<PathBuf>,
    pub pair_keys: Vec<String>,
    pub img_suffix: String,
    pub seg_map_suffix: String,
    pub ignore_background: bool,
    pub classes: Option<Vec<String>>,
    pub label_remap: Option<Vec<(u8, u8)>>,
    pub indices: Option<usize>,
}

impl Default for PairDatasetOptions {
    fn default() -> Self {
        Self {
            data_root: None,
            img_dir: None,
            ann_dir: None,
            ann_file: None,
            pair_keys: vec!["pre".to_string(), "post".to_string()],
            img_suffix: ".jpg".to_string(),
            seg_map_suffix: ".png".to_string(),
            ignore_background: false,
            classes: None,
            label_remap: None,
            indices: None,
        }
    }
}

impl PairDatasetOptions {
    /// Overlays the options set in `config` on top of `defaults`.
    pub fn from_config(config: &DatasetConfig, defaults: Self) -> Self {
        Self {
            data_root: config.data_root.clone().or(defaults.data_root),
            img_dir: config.img_dir.clone().or(defaults.img_dir),
            ann_dir: config.ann_dir.clone().or(defaults.ann_dir),
            ann_file: config.ann_file.clone().or(defaults.ann_file),
            pair_keys: config.pair_keys.clone().unwrap_or(defaults.pair_keys),
            img_suffix: config.img_suffix.clone().unwrap_or(defaults.img_suffix),
            seg_map_suffix: config
                .seg_map_suffix
                .clone()
                .unwrap_or(defaults.seg_map_suffix),
            ignore_background: config.ignore_background.unwrap_or(defaults.ignore_background),
            classes: config.classes.clone().or(defaults.classes),
            label_remap: config.label_remap.clone().or(defaults.label_remap),
            indices: config.indices.or(defaults.indices),
        }
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        match &self.data_root {
            Some(root) if path.is_relative() => root.join(path),
            _ => path.to_path_buf(),
        }
    }
}

/// Generic change detection dataset over a paired directory layout.
#[derive(Debug, Clone)]
pub struct BaseCdDataset {
    img_dir: PathBuf,
    ann_dir: Option<PathBuf>,
    ann_file: Option<PathBuf>,
    pair_keys: Vec<String>,
    img_suffix: String,
    seg_map_suffix: String,
    ignore_background: bool,
    label_remap: Option<Arc<LabelRemap>>,
    metainfo: MetaInfo,
    data_list: Vec<PairSample>,
}

impl BaseCdDataset {
    /// Validates the options and indexes the samples.
    pub fn new(options: PairDatasetOptions, metainfo: MetaInfo) -> Result<Self> {
        let img_dir = options
            .img_dir
            .as_deref()
            .map(|dir| options.resolve(dir))
            .ok_or_else(|| Error::Config("img_dir must be set for a change detection dataset".into()))?;
        if options.pair_keys.is_empty() {
            return Err(Error::Config("pair_keys must name at least one subdirectory".into()));
        }
        if options.img_suffix.is_empty() {
            return Err(Error::Config("img_suffix must not be empty".into()));
        }

        let ann_dir = options.ann_dir.as_deref().map(|dir| options.resolve(dir));
        let ann_file = options.ann_file.as_deref().map(|file| options.resolve(file));

        let (metainfo, derived) = select_classes(metainfo, options.classes.as_deref())?;
        let label_remap = match &options.label_remap {
            Some(pairs) => Some(LabelRemap::new(pairs.iter().copied())),
            None => derived,
        }
        .map(Arc::new);

        let mut dataset = Self {
            img_dir,
            ann_dir,
            ann_file,
            pair_keys: options.pair_keys,
            img_suffix: options.img_suffix,
            seg_map_suffix: options.seg_map_suffix,
            ignore_background: options.ignore_background,
            label_remap,
            metainfo,
            data_list: Vec::new(),
        };

        let mut data_list = dataset.load_data_list()?;
        if let Some(limit) = options.indices {
            data_list.truncate(limit);
        }
        info!(
            "Indexed {} image pairs from {}",
            data_list.len(),
            dataset.img_dir.display()
        );
        dataset.data_list = data_list;

        Ok(dataset)
    }

    pub fn from_config(config: &DatasetConfig) -> Result<Self> {
        let options = PairDatasetOptions::from_config(config, PairDatasetOptions::default());
        Self::new(options, MetaInfo::default())
    }

    pub fn pair_keys(&self) -> &[String] {
        &self.pair_keys
    }

    pub fn img_dir(&self) -> &Path {
        &self.img_dir
    }

    pub fn label_remap(&self) -> Option<&LabelRemap> {
        self.label_remap.as_deref()
    }

    fn describe(
        &self,
        stem: &str,
        image_paths: Vec<PathBuf>,
        annotation_path: Option<PathBuf>,
    ) -> PairSample {
        PairSample {
            stem: stem.to_string(),
            image_paths,
            annotation_path,
            label_remap: self.label_remap.clone(),
            ignore_background: self.ignore_background,
            auxiliary_fields: BTreeSet::new(),
        }
    }

    fn load_from_manifest(&self, manifest: &Path) -> Result<Vec<PairSample>> {
        let content = std::fs::read_to_string(manifest)?;
        let mut data_list = Vec::new();

        for line in content.lines() {
            let stem = line.trim();
            if stem.is_empty() {
                continue;
            }
            let image_paths = self
                .pair_keys
                .iter()
                .map(|key| self.img_dir.join(key).join(format!("{stem}{}", self.img_suffix)))
                .collect();
            let annotation_path = self
                .ann_dir
                .as_ref()
                .map(|dir| dir.join(format!("{stem}{}", self.seg_map_suffix)));
            data_list.push(self.describe(stem, image_paths, annotation_path));
        }

        debug!("Read {} stems from {}", data_list.len(), manifest.display());
        Ok(data_list)
    }

    fn load_from_directory(&self) -> Result<Vec<PairSample>> {
        let first_dir = self.img_dir.join(&self.pair_keys[0]);
        if !first_dir.is_dir() {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("Image directory not found: {}", first_dir.display()),
            )));
        }

        let mut data_list = Vec::new();
        for entry in WalkDir::new(&first_dir).follow_links(true) {
            let entry = entry.map_err(|e| Error::Io(e.into()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(&first_dir)
                .map_err(|e| Error::Dataset(e.to_string()))?;
            let relative_name = relative.to_string_lossy();
            let Some(stem) = relative_name.strip_suffix(self.img_suffix.as_str()) else {
                continue;
            };

            let image_paths = self
                .pair_keys
                .iter()
                .map(|key| self.img_dir.join(key).join(relative))
                .collect();
            let annotation_path = self
                .ann_dir
                .as_ref()
                .map(|dir| dir.join(format!("{stem}{}", self.seg_map_suffix)));
            data_list.push(self.describe(stem, image_paths, annotation_path));
        }

        data_list.sort_by(|a, b| a.image_paths[0].cmp(&b.image_paths[0]));
        Ok(data_list)
    }
}

impl PairDataset for BaseCdDataset {
    fn load_data_list(&self) -> Result<Vec<PairSample>> {
        match &self.ann_file {
            Some(manifest) if manifest.is_file() => self.load_from_manifest(manifest),
            Some(manifest) => {
                warn!(
                    "Manifest {} does not exist, scanning {} instead",
                    manifest.display(),
                    self.img_dir.display()
                );
                self.load_from_directory()
            }
            None => self.load_from_directory(),
        }
    }

    fn data_list(&self) -> &[PairSample] {
        &self.data_list
    }

    fn metainfo(&self) -> &MetaInfo {
        &self.metainfo
    }
}

/// Restricts `metainfo` to `classes` and derives the matching label remap.
///
/// Labels of dropped classes map to the ignore index. A dataset without
/// declared classes simply adopts the requested ones.
fn select_classes(
    metainfo: MetaInfo,
    classes: Option<&[String]>,
) -> Result<(MetaInfo, Option<LabelRemap>)> {
    let Some(classes) = classes else {
        return Ok((metainfo, None));
    };

    if metainfo.classes.is_empty() {
        let palette = (0..classes.len()).map(default_color).collect();
        return Ok((
            MetaInfo {
                classes: classes.to_vec(),
                palette,
            },
            None,
        ));
    }
    if metainfo.classes == classes {
        return Ok((metainfo, None));
    }

    if let Some(unknown) = classes.iter().find(|c| !metainfo.classes.contains(c)) {
        return Err(Error::Config(format!(
            "class '{unknown}' is not one of {:?}",
            metainfo.classes
        )));
    }

    let mut pairs = Vec::with_capacity(metainfo.classes.len());
    for (old_id, name) in metainfo.classes.iter().enumerate() {
        let new_id = classes
            .iter()
            .position(|c| c == name)
            .map(|i| i as u8)
            .unwrap_or(IGNORE_INDEX);
        pairs.push((old_id as u8, new_id));
    }

    let palette = classes
        .iter()
        .map(|name| {
            let old_id = metainfo.classes.iter().position(|c| c == name).unwrap_or(0);
            metainfo.color(old_id as u8)
        })
        .collect();

    Ok((
        MetaInfo {
            classes: classes.to_vec(),
            palette,
        },
        Some(LabelRemap::new(pairs)),
    ))
}

fn default_color(index: usize) -> [u8; 3] {
    let i = index as u32;
    [
        (i * 67 % 256) as u8,
        (i * 137 % 256) as u8,
        (i * 199 % 256) as u8,
    ]
}
