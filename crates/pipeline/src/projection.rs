//! Joint image/text projection used as the model behind both CLIP pipelines.
//!
//! Images are summarized as a `grid x grid` patch grid (mean RGB plus luminance
//! spread per patch). Prompts are hashed into the same feature space as signed
//! word and bigram buckets. One weight matrix projects both into the embedding
//! space, so image and text vectors are directly comparable with cosine similarity.
//!
//! Weights come from a raw little-endian `f32` file (row-major, `dimension x feature_len`) when a
//! path is configured, otherwise they are synthesized from a seed derived from the
//! model id. Both paths are deterministic for a given input.

use std::fs;
use std::path::PathBuf;

use fxhash::hash64;
use ndarray::{Array1, Array2};

use crate::normalize::l2_normalize_in_place;
use crate::preprocess::ImageTensor;
use crate::PipelineError;

const STOP_WORDS: &[&str] = &["a", "an", "the", "of", "in", "at", "with", "and", "is"];
const BIGRAM_WEIGHT: f32 = 0.5;

/// Everything needed to materialize a [`ProjectionModel`].
#[derive(Debug, Clone)]
pub struct ProjectionSpec {
    pub pipeline_id: String,
    pub model_id: String,
    pub dimension: usize,
    pub patch_grid: usize,
    pub weights_path: Option<PathBuf>,
}

impl ProjectionSpec {
    pub fn feature_len(&self) -> usize {
        self.patch_grid * self.patch_grid * 4
    }
}

#[derive(Debug)]
pub struct ProjectionModel {
    grid: usize,
    weights: Array2<f32>,
    version: String,
}

impl ProjectionModel {
    pub fn load(spec: &ProjectionSpec) -> Result<Self, PipelineError> {
        if spec.dimension == 0 || spec.patch_grid == 0 {
            return Err(PipelineError::unavailable(
                &spec.pipeline_id,
                "dimension and patch grid must be positive",
            ));
        }
        let feature_len = spec.feature_len();
        let data = match &spec.weights_path {
            Some(path) => {
                let bytes = fs::read(path).map_err(|e| {
                    PipelineError::unavailable(
                        &spec.pipeline_id,
                        format!("failed to read weights {}: {e}", path.display()),
                    )
                })?;
                let expected = spec.dimension * feature_len * std::mem::size_of::<f32>();
                if bytes.len() != expected {
                    return Err(PipelineError::unavailable(
                        &spec.pipeline_id,
                        format!(
                            "weights {} hold {} bytes, expected {expected}",
                            path.display(),
                            bytes.len()
                        ),
                    ));
                }
                let mut values = vec![0.0f32; spec.dimension * feature_len];
                bytemuck::cast_slice_mut::<f32, u8>(&mut values).copy_from_slice(&bytes);
                if cfg!(target_endian = "big") {
                    for v in &mut values {
                        *v = f32::from_bits(u32::from_le(v.to_bits()));
                    }
                }
                if values.iter().any(|v| !v.is_finite()) {
                    return Err(PipelineError::unavailable(
                        &spec.pipeline_id,
                        "weights contain non-finite values",
                    ));
                }
                values
            }
            None => synthesize_weights(&spec.model_id, spec.dimension, feature_len),
        };

        let digest = hash64(bytemuck::cast_slice::<f32, u8>(&data));
        let weights = Array2::from_shape_vec((spec.dimension, feature_len), data)
            .map_err(|e| PipelineError::unavailable(&spec.pipeline_id, e))?;

        Ok(Self {
            grid: spec.patch_grid,
            weights,
            version: format!("{}+{digest:016x}", spec.model_id),
        })
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn dimension(&self) -> usize {
        self.weights.nrows()
    }

    pub fn feature_len(&self) -> usize {
        self.weights.ncols()
    }

    /// Patch statistics of a preprocessed image tensor.
    pub fn image_features(&self, tensor: &ImageTensor) -> Result<Vec<f32>, PipelineError> {
        let (_, height, width) = tensor.dim();
        if height < self.grid || width < self.grid {
            return Err(PipelineError::Inference(format!(
                "image {width}x{height} smaller than patch grid {}",
                self.grid
            )));
        }
        let patch_h = height / self.grid;
        let patch_w = width / self.grid;
        let mut features = Vec::with_capacity(self.feature_len());

        for gy in 0..self.grid {
            let y0 = gy * patch_h;
            let y1 = if gy + 1 == self.grid { height } else { y0 + patch_h };
            for gx in 0..self.grid {
                let x0 = gx * patch_w;
                let x1 = if gx + 1 == self.grid { width } else { x0 + patch_w };

                let mut sums = [0.0f32; 3];
                let mut luma_sum = 0.0f32;
                let mut luma_sq = 0.0f32;
                for y in y0..y1 {
                    for x in x0..x1 {
                        let r = tensor[[0, y, x]];
                        let g = tensor[[1, y, x]];
                        let b = tensor[[2, y, x]];
                        sums[0] += r;
                        sums[1] += g;
                        sums[2] += b;
                        let luma = 0.299 * r + 0.587 * g + 0.114 * b;
                        luma_sum += luma;
                        luma_sq += luma * luma;
                    }
                }
                let n = ((y1 - y0) * (x1 - x0)) as f32;
                let luma_mean = luma_sum / n;
                let variance = (luma_sq / n - luma_mean * luma_mean).max(0.0);
                features.extend_from_slice(&[sums[0] / n, sums[1] / n, sums[2] / n, variance.sqrt()]);
            }
        }
        Ok(features)
    }

    /// Projects a feature vector into the embedding space and L2-normalizes it.
    pub fn project(&self, features: &[f32]) -> Result<Vec<f32>, PipelineError> {
        if features.len() != self.feature_len() {
            return Err(PipelineError::Inference(format!(
                "feature length {} does not match model input {}",
                features.len(),
                self.feature_len()
            )));
        }
        let input = Array1::from(features.to_vec());
        let mut out = self.weights.dot(&input).to_vec();
        l2_normalize_in_place(&mut out);
        Ok(out)
    }

    pub fn embed_tensor(&self, tensor: &ImageTensor) -> Result<Vec<f32>, PipelineError> {
        let features = self.image_features(tensor)?;
        self.project(&features)
    }

    /// Embeds a prompt. Prompts without any content word are rejected.
    pub fn embed_text(&self, prompt: &str) -> Result<Vec<f32>, String> {
        let tokens = tokenize(prompt);
        if tokens.is_empty() {
            return Err(format!("prompt '{prompt}' has no usable tokens"));
        }
        let feature_len = self.feature_len();
        let mut features = vec![0.0f32; feature_len];
        let mut bump = |key: &str, weight: f32| {
            let h = hash64(key.as_bytes());
            let idx = (h % feature_len as u64) as usize;
            let sign = if h >> 63 == 1 { -1.0 } else { 1.0 };
            features[idx] += sign * weight;
        };
        for token in &tokens {
            bump(token, 1.0);
        }
        for pair in tokens.windows(2) {
            bump(&format!("{} {}", pair[0], pair[1]), BIGRAM_WEIGHT);
        }
        self.project(&features).map_err(|e| e.to_string())
    }
}

fn tokenize(prompt: &str) -> Vec<String> {
    prompt
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .filter(|t| !STOP_WORDS.contains(&t.as_str()))
        .collect()
}

fn synthesize_weights(model_id: &str, dimension: usize, feature_len: usize) -> Vec<f32> {
    let mut rng = fastrand::Rng::with_seed(hash64(model_id.as_bytes()));
    let scale = (feature_len as f32).sqrt().recip();
    (0..dimension * feature_len)
        .map(|_| (rng.f32() * 2.0 - 1.0) * scale)
        .collect()
}
