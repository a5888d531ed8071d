//! Image decoding and the in-memory image cache.
//!
//! Every indexed image is decoded once, resized to a square, centre-cropped
//! and stored as `3 x crop x crop` floats in `[0, 1]`. Row `i` of the cache is
//! image id `i`.

use crate::dataset::{DatasetIndex, ImageId};
use image::imageops::FilterType;
use ndarray::{s, Array3, Array4, ArrayView3, ArrayView4, Axis};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_RESIZE: u32 = 100;
pub const DEFAULT_CROP: u32 = 60;

/// Log a progress line every this many decoded images.
const PROGRESS_EVERY: usize = 1000;

#[derive(Error, Debug)]
pub enum ImageLoadError {
    #[error("failed to decode {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("crop size {crop} exceeds resize size {resize}")]
    CropTooLarge { crop: u32, resize: u32 },
    #[error("image id {0} out of range")]
    UnknownImage(ImageId),
}

/// Geometry applied to every image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ImageConfig {
    /// Side of the square each image is first resized to.
    pub resize: u32,
    /// Side of the centred square kept after resizing.
    pub crop: u32,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            resize: DEFAULT_RESIZE,
            crop: DEFAULT_CROP,
        }
    }
}

impl ImageConfig {
    /// Offset of the centre crop inside the resized square.
    pub fn crop_offset(&self) -> u32 {
        self.resize.saturating_sub(self.crop) / 2
    }

    fn validate(&self) -> Result<(), ImageLoadError> {
        if self.crop > self.resize || self.crop == 0 {
            return Err(ImageLoadError::CropTooLarge {
                crop: self.crop,
                resize: self.resize,
            });
        }
        Ok(())
    }
}

/// Decode one file into a `3 x crop x crop` tensor.
pub fn load_image(path: &Path, config: &ImageConfig) -> Result<Array3<f32>, ImageLoadError> {
    config.validate()?;
    let img = image::open(path).map_err(|source| ImageLoadError::Decode {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(preprocess(&img, config))
}

/// Resize, centre-crop and convert to channels-first floats.
pub fn preprocess(img: &image::DynamicImage, config: &ImageConfig) -> Array3<f32> {
    let offset = config.crop_offset();
    let rgb = img
        .resize_exact(config.resize, config.resize, FilterType::Triangle)
        .crop_imm(offset, offset, config.crop, config.crop)
        .to_rgb8();

    let size = config.crop as usize;
    Array3::from_shape_fn((3, size, size), |(c, y, x)| {
        rgb.get_pixel(x as u32, y as u32).0[c] as f32 / 255.0
    })
}

/// All dataset images, decoded once and read-only afterwards.
#[derive(Debug, Clone)]
pub struct ImageStore {
    pixels: Array4<f32>,
    config: ImageConfig,
}

impl ImageStore {
    /// Decode every image in `index`, in image-id order.
    pub fn load(index: &DatasetIndex, config: &ImageConfig) -> Result<Self, ImageLoadError> {
        config.validate()?;
        let size = config.crop as usize;
        let total = index.num_images();
        let mut pixels = Array4::<f32>::zeros((total, 3, size, size));

        for (i, path) in index.paths().enumerate() {
            let tensor = load_image(path, config)?;
            pixels.slice_mut(s![i, .., .., ..]).assign(&tensor);

            if (i + 1) % PROGRESS_EVERY == 0 {
                tracing::info!(loaded = i + 1, total, "decoding images");
            }
        }

        tracing::info!(
            images = total,
            size,
            megabytes = pixels.len() * std::mem::size_of::<f32>() / (1 << 20),
            "image cache ready"
        );

        Ok(Self {
            pixels,
            config: *config,
        })
    }

    /// Wrap an existing `N x 3 x S x S` tensor.
    pub fn from_pixels(pixels: Array4<f32>, config: ImageConfig) -> Self {
        Self { pixels, config }
    }

    pub fn len(&self) -> usize {
        self.pixels.len_of(Axis(0))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn config(&self) -> &ImageConfig {
        &self.config
    }

    pub fn pixels(&self) -> ArrayView4<'_, f32> {
        self.pixels.view()
    }

    pub fn get(&self, id: ImageId) -> Result<ArrayView3<'_, f32>, ImageLoadError> {
        if id >= self.len() {
            return Err(ImageLoadError::UnknownImage(id));
        }
        Ok(self.pixels.index_axis(Axis(0), id))
    }

    /// Copy the images for `ids` into a new `len(ids) x 3 x S x S` batch.
    pub fn gather(&self, ids: &[ImageId]) -> Result<Array4<f32>, ImageLoadError> {
        if let Some(&bad) = ids.iter().find(|&&id| id >= self.len()) {
            return Err(ImageLoadError::UnknownImage(bad));
        }
        Ok(self.pixels.select(Axis(0), ids))
    }
}
