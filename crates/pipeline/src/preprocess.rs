//! CLIP-style image preprocessing.
//!
//! Decode, resize the shortest side to the target resolution, center crop to a
//! square, then normalize each channel with the CLIP mean and std.

use image::imageops::FilterType;
use image::RgbImage;
use ndarray::Array3;

use crate::PipelineError;

pub const CLIP_MEAN: [f32; 3] = [0.481_454_66, 0.457_827_5, 0.408_210_73];
pub const CLIP_STD: [f32; 3] = [0.268_629_54, 0.261_302_58, 0.275_777_11];

/// Normalized pixels in channel-major layout, shape `(3, resolution, resolution)`.
pub type ImageTensor = Array3<f32>;

/// Decodes `bytes` and resizes/crops them to `resolution x resolution`.
pub fn load_rgb(bytes: &[u8], resolution: u32) -> Result<RgbImage, PipelineError> {
    if bytes.is_empty() {
        return Err(PipelineError::invalid_image("empty image payload"));
    }
    if resolution == 0 {
        return Err(PipelineError::invalid_image("target resolution must be positive"));
    }
    let decoded = image::load_from_memory(bytes).map_err(PipelineError::invalid_image)?;
    let rgb = decoded.to_rgb8();
    let (width, height) = rgb.dimensions();
    if width == 0 || height == 0 {
        return Err(PipelineError::invalid_image("image has zero area"));
    }

    let scale = resolution as f64 / width.min(height) as f64;
    let new_w = ((width as f64 * scale).round() as u32).max(resolution);
    let new_h = ((height as f64 * scale).round() as u32).max(resolution);
    let resized = image::imageops::resize(&rgb, new_w, new_h, FilterType::CatmullRom);

    let left = (new_w - resolution) / 2;
    let top = (new_h - resolution) / 2;
    Ok(image::imageops::crop_imm(&resized, left, top, resolution, resolution).to_image())
}

/// Full preprocessing: [`load_rgb`] followed by per-channel normalization.
pub fn preprocess(bytes: &[u8], resolution: u32) -> Result<ImageTensor, PipelineError> {
    let rgb = load_rgb(bytes, resolution)?;
    let side = resolution as usize;
    let mut tensor = Array3::<f32>::zeros((3, side, side));
    for (x, y, pixel) in rgb.enumerate_pixels() {
        for c in 0..3 {
            let value = pixel[c] as f32 / 255.0;
            tensor[[c, y as usize, x as usize]] = (value - CLIP_MEAN[c]) / CLIP_STD[c];
        }
    }
    Ok(tensor)
}
