//! Segmentation map loading.
//!
//! Maps are read unchanged: indexed PNGs yield their palette indices, not
//! the palette colors. Only 8-bit (or packed sub-byte) single channel maps
//! are accepted.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use cd_core::{Error, ImageShape, LabelRemap, Result, IGNORE_INDEX};
use image::DynamicImage;
use tracing::debug;

use crate::loader::LoadedPair;

pub const GT_SEG_MAP: &str = "gt_seg_map";

/// Single channel `H x W` label map
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegMap {
    pub height: usize,
    pub width: usize,
    pub data: Vec<u8>,
}

impl SegMap {
    pub fn new(height: usize, width: usize, data: Vec<u8>) -> Result<Self> {
        if data.len() != height * width {
            return Err(Error::Shape(format!(
                "{} labels do not fill a {height}x{width} map",
                data.len()
            )));
        }
        Ok(Self {
            height,
            width,
            data,
        })
    }

    pub fn shape(&self) -> ImageShape {
        ImageShape::new(self.height, self.width)
    }

    pub fn get(&self, y: usize, x: usize) -> u8 {
        self.data[y * self.width + x]
    }

    /// Rewrites labels through `remap`.
    ///
    /// Lookups read the original labels, so `a -> b` followed by `b -> c`
    /// does not send `a` to `c`.
    pub fn apply_remap(&mut self, remap: &LabelRemap) {
        let original = self.data.clone();
        for (old, new) in remap.iter() {
            for (dst, src) in self.data.iter_mut().zip(&original) {
                if *src == old {
                    *dst = new;
                }
            }
        }
    }

    /// Drops label 0: it becomes the ignore index and every other label shifts down by one.
    pub fn reduce_zero_label(&mut self) {
        for label in &mut self.data {
            *label = match *label {
                0 | IGNORE_INDEX => IGNORE_INDEX,
                v => v - 1,
            };
        }
    }
}

fn decode_error(path: &Path, message: impl std::fmt::Display) -> Error {
    Error::Image {
        path: path.to_path_buf(),
        message: message.to_string(),
    }
}

fn is_png(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("png"))
}

/// Reads a label map without palette expansion or rescaling.
pub fn read_seg_map(path: &Path) -> Result<SegMap> {
    if is_png(path) {
        read_png_labels(path)
    } else {
        match image::open(path).map_err(|e| Error::image(path, e))? {
            DynamicImage::ImageLuma8(img) => {
                let (width, height) = (img.width() as usize, img.height() as usize);
                SegMap::new(height, width, img.into_raw())
            }
            other => Err(Error::Shape(format!(
                "annotation {} is {:?}, expected an 8-bit single channel map",
                path.display(),
                other.color()
            ))),
        }
    }
}

fn read_png_labels(path: &Path) -> Result<SegMap> {
    let mut decoder = png::Decoder::new(BufReader::new(File::open(path)?));
    decoder.set_transformations(png::Transformations::IDENTITY);
    let mut reader = decoder.read_info().map_err(|e| decode_error(path, e))?;
    let mut buf = vec![0; reader.output_buffer_size()];
    let info = reader.next_frame(&mut buf).map_err(|e| decode_error(path, e))?;

    match info.color_type {
        png::ColorType::Indexed | png::ColorType::Grayscale => {}
        other => {
            return Err(Error::Shape(format!(
                "annotation {} is {:?}, expected an indexed or grayscale map",
                path.display(),
                other
            )))
        }
    }

    let bits = match info.bit_depth {
        png::BitDepth::One => 1,
        png::BitDepth::Two => 2,
        png::BitDepth::Four => 4,
        png::BitDepth::Eight => 8,
        png::BitDepth::Sixteen => {
            return Err(decode_error(path, "16-bit label maps are not supported"));
        }
    };

    let (width, height) = (info.width as usize, info.height as usize);
    let data = unpack_rows(&buf, width, height, info.line_size, bits);
    SegMap::new(height, width, data)
}

/// Expands `bits`-wide samples, packed high bits first, into one byte each.
fn unpack_rows(buf: &[u8], width: usize, height: usize, line_size: usize, bits: usize) -> Vec<u8> {
    if bits == 8 {
        return (0..height)
            .flat_map(|y| buf[y * line_size..y * line_size + width].iter().copied())
            .collect();
    }

    let mask = (1u8 << bits) - 1;
    let mut data = Vec::with_capacity(width * height);
    for y in 0..height {
        let row = &buf[y * line_size..(y + 1) * line_size];
        for x in 0..width {
            let bit = x * bits;
            let shift = 8 - bits - bit % 8;
            data.push((row[bit / 8] >> shift) & mask);
        }
    }
    data
}

/// Loads the annotation map of a [`LoadedPair`].
#[derive(Debug, Clone, Copy, Default)]
pub struct LoadAnnotations;

impl LoadAnnotations {
    pub fn new() -> Self {
        Self
    }

    /// Fills `pair.gt_seg_map`; samples without annotation are left untouched.
    pub fn transform(&self, pair: &mut LoadedPair) -> Result<()> {
        let Some(path) = pair.sample.annotation_path.clone() else {
            return Ok(());
        };

        let mut seg_map = read_seg_map(&path)?;

        if seg_map.shape() != pair.img_shape {
            return Err(Error::Shape(format!(
                "annotation {} is {} but the image pair is {}",
                path.display(),
                seg_map.shape(),
                pair.img_shape
            )));
        }

        if let Some(remap) = &pair.sample.label_remap {
            seg_map.apply_remap(remap);
        }
        if pair.sample.ignore_background {
            seg_map.reduce_zero_label();
        }

        debug!("Loaded annotation {}", path.display());
        pair.gt_seg_map = Some(seg_map);
        pair.sample.auxiliary_fields.insert(GT_SEG_MAP.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::PairSample;
    use crate::loader::tests::create_gray_image;
    use crate::loader::PixelArray;
    use std::collections::BTreeSet;
    use std::path::Path;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn loaded_pair(annotation: std::path::PathBuf, remap: Option<LabelRemap>, ignore_background: bool) -> LoadedPair {
        LoadedPair {
            sample: PairSample {
                stem: "0".to_string(),
                image_paths: Vec::new(),
                annotation_path: Some(annotation),
                label_remap: remap.map(Arc::new),
                ignore_background,
                auxiliary_fields: BTreeSet::new(),
            },
            image: PixelArray::from_u8(2, 3, 2, vec![0; 12]).unwrap(),
            img_path: None,
            ori_shape: ImageShape::new(2, 3),
            img_shape: ImageShape::new(2, 3),
            gt_seg_map: None,
        }
    }

    #[test]
    fn test_remap_reads_original_labels() {
        let mut map = SegMap::new(1, 3, vec![0, 1, 2]).unwrap();
        map.apply_remap(&LabelRemap::new([(0, 1), (1, 2)]));
        assert_eq!(map.data, vec![1, 2, 2]);
    }

    #[test]
    fn test_reduce_zero_label() {
        let mut map = SegMap::new(1, 4, vec![0, 1, 2, 255]).unwrap();
        map.reduce_zero_label();
        assert_eq!(map.data, vec![255, 0, 1, 255]);
    }

    #[test]
    fn test_load_binary_mask_with_remap() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("ann/0.png");
        create_gray_image(&path, 3, 2, |x, _| if x == 1 { 255 } else { 0 });

        let mut pair = loaded_pair(path, Some(LabelRemap::new([(255, 1)])), false);
        LoadAnnotations::new().transform(&mut pair).unwrap();

        let map = pair.gt_seg_map.unwrap();
        assert_eq!(map.data, vec![0, 1, 0, 0, 1, 0]);
        assert!(pair.sample.auxiliary_fields.contains(GT_SEG_MAP));
    }

    #[test]
    fn test_load_with_ignore_background() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("0.png");
        create_gray_image(&path, 3, 2, |x, _| x as u8);

        let mut pair = loaded_pair(path, None, true);
        LoadAnnotations::new().transform(&mut pair).unwrap();

        assert_eq!(pair.gt_seg_map.unwrap().data, vec![255, 0, 1, 255, 0, 1]);
    }

    #[test]
    fn test_annotation_size_must_match() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("0.png");
        create_gray_image(&path, 4, 4, |_, _| 0);

        let mut pair = loaded_pair(path, None, false);
        let result = LoadAnnotations::new().transform(&mut pair);
        assert!(matches!(result, Err(Error::Shape(_))));
    }

    fn write_indexed_png(path: &Path, width: u32, height: u32, depth: png::BitDepth, data: &[u8]) {
        let file = std::fs::File::create(path).unwrap();
        let mut encoder = png::Encoder::new(std::io::BufWriter::new(file), width, height);
        encoder.set_color(png::ColorType::Indexed);
        encoder.set_depth(depth);
        encoder.set_palette(vec![0, 0, 0, 128, 0, 0, 0, 128, 0]);
        let mut writer = encoder.write_header().unwrap();
        writer.write_image_data(data).unwrap();
    }

    #[test]
    fn test_indexed_png_keeps_palette_indices() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("0.png");
        write_indexed_png(&path, 3, 2, png::BitDepth::Eight, &[0, 1, 2, 0, 1, 2]);

        let mut pair = loaded_pair(path, None, false);
        LoadAnnotations::new().transform(&mut pair).unwrap();
        assert_eq!(pair.gt_seg_map.unwrap().data, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn test_packed_indexed_png() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("0.png");
        // 2-bit samples, one byte per row: 00 01 10 padding
        write_indexed_png(&path, 3, 2, png::BitDepth::Two, &[0b0001_1000, 0b1001_0000]);

        let map = read_seg_map(&path).unwrap();
        assert_eq!(map.data, vec![0, 1, 2, 2, 1, 0]);
    }

    #[test]
    fn test_rgb_annotation_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("0.png");
        image::RgbImage::from_fn(3, 2, |_, _| image::Rgb([1, 2, 3]))
            .save(&path)
            .unwrap();

        let mut pair = loaded_pair(path, None, false);
        let result = LoadAnnotations::new().transform(&mut pair);
        assert!(matches!(result, Err(Error::Shape(_))));
    }

    #[test]
    fn test_sixteen_bit_annotation_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("0.png");
        image::ImageBuffer::<image::Luma<u16>, Vec<u16>>::from_fn(3, 2, |_, _| image::Luma([300]))
            .save(&path)
            .unwrap();

        assert!(matches!(read_seg_map(&path), Err(Error::Image { .. })));
    }

    #[test]
    fn test_no_annotation_path_is_noop() {
        let mut pair = loaded_pair("unused.png".into(), None, false);
        pair.sample.annotation_path = None;
        LoadAnnotations::new().transform(&mut pair).unwrap();
        assert!(pair.gt_seg_map.is_none());
        assert!(pair.sample.auxiliary_fields.is_empty());
    }
}
