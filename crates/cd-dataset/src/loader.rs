//! Image pair loading.
//!
//! Every image of a pair is decoded on its own and the results are stacked on
//! the channel axis, so a pair of RGB images becomes one `H x W x 6` array.

use std::io;
use std::path::{Path, PathBuf};

use cd_core::{ColorType, Error, ImageShape, LoaderConfig, Result};
use image::DynamicImage;
use tracing::{debug, warn};

use crate::annotations::SegMap;
use crate::dataset::PairSample;

/// Pixel storage of a [`PixelArray`]
#[derive(Debug, Clone, PartialEq)]
pub enum PixelData {
    U8(Vec<u8>),
    F32(Vec<f32>),
}

impl PixelData {
    fn len(&self) -> usize {
        match self {
            PixelData::U8(data) => data.len(),
            PixelData::F32(data) => data.len(),
        }
    }
}

/// Interleaved `H x W x C` pixel buffer
#[derive(Debug, Clone, PartialEq)]
pub struct PixelArray {
    pub height: usize,
    pub width: usize,
    pub channels: usize,
    pub data: PixelData,
}

impl PixelArray {
    pub fn from_u8(height: usize, width: usize, channels: usize, data: Vec<u8>) -> Result<Self> {
        Self::with_data(height, width, channels, PixelData::U8(data))
    }

    pub fn from_f32(height: usize, width: usize, channels: usize, data: Vec<f32>) -> Result<Self> {
        Self::with_data(height, width, channels, PixelData::F32(data))
    }

    fn with_data(height: usize, width: usize, channels: usize, data: PixelData) -> Result<Self> {
        if data.len() != height * width * channels {
            return Err(Error::Shape(format!(
                "{} values do not fill a {height}x{width}x{channels} array",
                data.len()
            )));
        }
        Ok(Self {
            height,
            width,
            channels,
            data,
        })
    }

    /// `(height, width, channels)`
    pub fn shape(&self) -> (usize, usize, usize) {
        (self.height, self.width, self.channels)
    }

    pub fn spatial_shape(&self) -> ImageShape {
        ImageShape::new(self.height, self.width)
    }

    pub fn is_float(&self) -> bool {
        matches!(self.data, PixelData::F32(_))
    }

    /// Value at `(y, x, c)` as `f32`
    pub fn get(&self, y: usize, x: usize, c: usize) -> f32 {
        let index = (y * self.width + x) * self.channels + c;
        match &self.data {
            PixelData::U8(data) => data[index] as f32,
            PixelData::F32(data) => data[index],
        }
    }

    pub fn to_f32_vec(&self) -> Vec<f32> {
        match &self.data {
            PixelData::U8(data) => data.iter().map(|&v| v as f32).collect(),
            PixelData::F32(data) => data.clone(),
        }
    }

    /// Stacks arrays of the same spatial size along the channel axis.
    ///
    /// The result stays `u8` only when every input is `u8`.
    pub fn concat_channels(arrays: &[PixelArray]) -> Result<PixelArray> {
        let first = arrays
            .first()
            .ok_or_else(|| Error::Shape("cannot concatenate zero arrays".into()))?;
        let (height, width) = (first.height, first.width);
        if let Some(other) = arrays
            .iter()
            .find(|a| a.height != height || a.width != width)
        {
            return Err(Error::Shape(format!(
                "pair images differ in size: {}x{} and {}x{}",
                height, width, other.height, other.width
            )));
        }

        let channels: usize = arrays.iter().map(|a| a.channels).sum();
        let pixels = height * width;

        if arrays.iter().all(|a| !a.is_float()) {
            let mut data = Vec::with_capacity(pixels * channels);
            for p in 0..pixels {
                for array in arrays {
                    if let PixelData::U8(src) = &array.data {
                        data.extend_from_slice(&src[p * array.channels..(p + 1) * array.channels]);
                    }
                }
            }
            return PixelArray::from_u8(height, width, channels, data);
        }

        let sources: Vec<Vec<f32>> = arrays.iter().map(|a| a.to_f32_vec()).collect();
        let mut data = Vec::with_capacity(pixels * channels);
        for p in 0..pixels {
            for (array, src) in arrays.iter().zip(&sources) {
                data.extend_from_slice(&src[p * array.channels..(p + 1) * array.channels]);
            }
        }
        PixelArray::from_f32(height, width, channels, data)
    }
}

/// A sample after its image pair has been read from disk.
#[derive(Debug, Clone)]
pub struct LoadedPair {
    pub sample: PairSample,
    /// Channel-stacked pixels of every image of the pair
    pub image: PixelArray,
    /// Always `None`: the record no longer stands for a single file
    pub img_path: Option<PathBuf>,
    pub ori_shape: ImageShape,
    pub img_shape: ImageShape,
    /// Filled in by [`crate::LoadAnnotations`]
    pub gt_seg_map: Option<SegMap>,
}

/// Loads and channel-concatenates the images of a pair.
#[derive(Debug, Clone, Default)]
pub struct LoadImagePair {
    pub to_float32: bool,
    pub color_type: ColorType,
    pub ignore_empty: bool,
}

impl LoadImagePair {
    pub fn new(to_float32: bool, color_type: ColorType, ignore_empty: bool) -> Self {
        Self {
            to_float32,
            color_type,
            ignore_empty,
        }
    }

    pub fn from_config(config: &LoaderConfig) -> Self {
        Self::new(config.to_float32, config.color_type, config.ignore_empty)
    }

    /// Loads a single image, `Ok(None)` when it is missing and empties are tolerated.
    pub fn load_image(&self, path: &Path) -> Result<Option<PixelArray>> {
        match self.decode(path) {
            Ok(array) => Ok(Some(array)),
            Err(e) if self.ignore_empty => {
                warn!("Skipping unreadable image {}: {}", path.display(), e);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn decode(&self, path: &Path) -> Result<PixelArray> {
        if !path.is_file() {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("Image file not found: {}", path.display()),
            )));
        }

        let img = image::open(path).map_err(|e| Error::image(path, e))?;
        let (width, height) = (img.width() as usize, img.height() as usize);
        let (channels, raw) = self.convert(img);

        if self.to_float32 {
            let data = raw.into_iter().map(f32::from).collect();
            PixelArray::from_f32(height, width, channels, data)
        } else {
            PixelArray::from_u8(height, width, channels, raw)
        }
    }

    fn convert(&self, img: DynamicImage) -> (usize, Vec<u8>) {
        match self.color_type {
            ColorType::Color => (3, img.into_rgb8().into_raw()),
            ColorType::Grayscale => (1, img.into_luma8().into_raw()),
            ColorType::Unchanged => match img.color().channel_count() {
                1 => (1, img.into_luma8().into_raw()),
                2 => (2, img.into_luma_alpha8().into_raw()),
                3 => (3, img.into_rgb8().into_raw()),
                _ => (4, img.into_rgba8().into_raw()),
            },
        }
    }

    /// Loads every image of `sample`.
    ///
    /// The images after the first are read before the first one, which then
    /// provides the shape metadata. Channels are stacked in path order.
    pub fn transform(&self, sample: &PairSample) -> Result<Option<LoadedPair>> {
        let Some((first_path, rest)) = sample.image_paths.split_first() else {
            return Err(Error::Dataset("sample has no image paths".into()));
        };

        let mut others = Vec::with_capacity(rest.len());
        for path in rest {
            match self.load_image(path)? {
                Some(array) => others.push(array),
                None => return Ok(None),
            }
        }
        let Some(primary) = self.load_image(first_path)? else {
            return Ok(None);
        };

        let ori_shape = primary.spatial_shape();
        let mut arrays = Vec::with_capacity(others.len() + 1);
        arrays.push(primary);
        arrays.extend(others);
        let image = PixelArray::concat_channels(&arrays)?;

        debug!(
            "Loaded pair {} with shape {:?}",
            first_path.display(),
            image.shape()
        );

        Ok(Some(LoadedPair {
            sample: sample.clone(),
            image,
            img_path: None,
            ori_shape,
            img_shape: ori_shape,
            gt_seg_map: None,
        }))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use tempfile::TempDir;

    pub(crate) fn create_gray_image(path: &Path, width: u32, height: u32, f: impl Fn(u32, u32) -> u8) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let img = image::GrayImage::from_fn(width, height, |x, y| image::Luma([f(x, y)]));
        img.save(path).unwrap();
    }

    pub(crate) fn create_rgb_image(path: &Path, width: u32, height: u32, color: [u8; 3]) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let img = image::RgbImage::from_fn(width, height, |_, _| image::Rgb(color));
        img.save(path).unwrap();
    }

    fn sample(paths: Vec<PathBuf>) -> PairSample {
        PairSample {
            stem: "0".to_string(),
            image_paths: paths,
            annotation_path: None,
            label_remap: None,
            ignore_background: false,
            auxiliary_fields: BTreeSet::new(),
        }
    }

    #[test]
    fn test_grayscale_pair_concat_byte_for_byte() {
        let temp_dir = TempDir::new().unwrap();
        let pre = temp_dir.path().join("pre/0.png");
        let post = temp_dir.path().join("post/0.png");
        create_gray_image(&pre, 5, 4, |x, y| (x + 10 * y) as u8);
        create_gray_image(&post, 5, 4, |x, y| 200 - (x + y) as u8);

        let loader = LoadImagePair::new(false, ColorType::Grayscale, false);
        let loaded = loader.transform(&sample(vec![pre, post])).unwrap().unwrap();

        assert_eq!(loaded.image.shape(), (4, 5, 2));
        for y in 0..4 {
            for x in 0..5 {
                assert_eq!(loaded.image.get(y, x, 0), (x + 10 * y) as f32);
                assert_eq!(loaded.image.get(y, x, 1), (200 - (x + y)) as f32);
            }
        }
        assert_eq!(loaded.img_path, None);
        assert_eq!(loaded.ori_shape, ImageShape::new(4, 5));
        assert_eq!(loaded.img_shape, loaded.ori_shape);
    }

    #[test]
    fn test_color_pair_has_six_channels() {
        let temp_dir = TempDir::new().unwrap();
        let pre = temp_dir.path().join("pre/0.png");
        let post = temp_dir.path().join("post/0.png");
        create_rgb_image(&pre, 8, 6, [10, 20, 30]);
        create_rgb_image(&post, 8, 6, [40, 50, 60]);

        let loader = LoadImagePair::default();
        let loaded = loader.transform(&sample(vec![pre, post])).unwrap().unwrap();

        assert_eq!(loaded.image.shape(), (6, 8, 6));
        assert!(!loaded.image.is_float());
        let pixel: Vec<f32> = (0..6).map(|c| loaded.image.get(2, 3, c)).collect();
        assert_eq!(pixel, vec![10.0, 20.0, 30.0, 40.0, 50.0, 60.0]);
    }

    #[test]
    fn test_to_float32() {
        let temp_dir = TempDir::new().unwrap();
        let pre = temp_dir.path().join("pre/0.png");
        let post = temp_dir.path().join("post/0.png");
        create_gray_image(&pre, 2, 2, |_, _| 7);
        create_gray_image(&post, 2, 2, |_, _| 9);

        let loader = LoadImagePair::new(true, ColorType::Grayscale, false);
        let loaded = loader.transform(&sample(vec![pre, post])).unwrap().unwrap();

        assert!(loaded.image.is_float());
        assert_eq!(loaded.image.to_f32_vec(), vec![7.0, 9.0, 7.0, 9.0, 7.0, 9.0, 7.0, 9.0]);
    }

    #[test]
    fn test_missing_image_is_io_error() {
        let temp_dir = TempDir::new().unwrap();
        let pre = temp_dir.path().join("pre/0.png");
        create_gray_image(&pre, 2, 2, |_, _| 0);

        let loader = LoadImagePair::default();
        let result = loader.transform(&sample(vec![pre, temp_dir.path().join("post/0.png")]));
        assert!(matches!(result, Err(Error::Io(_))));
    }

    #[test]
    fn test_ignore_empty_yields_none() {
        let temp_dir = TempDir::new().unwrap();
        let pre = temp_dir.path().join("pre/0.png");
        create_gray_image(&pre, 2, 2, |_, _| 0);

        let loader = LoadImagePair::new(false, ColorType::Color, true);
        let result = loader
            .transform(&sample(vec![pre, temp_dir.path().join("post/0.png")]))
            .unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_corrupt_image_is_image_error() {
        let temp_dir = TempDir::new().unwrap();
        let pre = temp_dir.path().join("pre.png");
        std::fs::write(&pre, b"not a png").unwrap();

        let result = LoadImagePair::default().load_image(&pre);
        assert!(matches!(result, Err(Error::Image { .. })));
    }

    #[test]
    fn test_size_mismatch_is_shape_error() {
        let temp_dir = TempDir::new().unwrap();
        let pre = temp_dir.path().join("pre/0.png");
        let post = temp_dir.path().join("post/0.png");
        create_gray_image(&pre, 4, 4, |_, _| 0);
        create_gray_image(&post, 3, 4, |_, _| 0);

        let result = LoadImagePair::default().transform(&sample(vec![pre, post]));
        assert!(matches!(result, Err(Error::Shape(_))));
    }

    #[test]
    fn test_empty_sample_is_dataset_error() {
        let result = LoadImagePair::default().transform(&sample(Vec::new()));
        assert!(matches!(result, Err(Error::Dataset(_))));
    }

    #[test]
    fn test_pixel_array_rejects_bad_length() {
        assert!(PixelArray::from_u8(2, 2, 3, vec![0; 11]).is_err());
    }
}
