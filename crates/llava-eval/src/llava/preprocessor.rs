use std::path::Path;

use candle_core::{DType, Device, Shape, Tensor};
use image::{imageops, imageops::FilterType, Rgb, RgbImage};
use serde::Deserialize;

use super::utils::LlavaError;

// OpenAI CLIP normalization constants, used when the checkpoint ships no
// preprocessor config.
const CLIP_MEAN: [f32; 3] = [0.481_454_66, 0.457_827_5, 0.408_210_73];
const CLIP_STD: [f32; 3] = [0.268_629_54, 0.261_302_6, 0.275_777_1];

/// `crop_size`/`size` appear as a bare pixel count or a small object
/// depending on the processor version that wrote the config.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(untagged)]
enum SizeSpec {
    Edge(u32),
    Dims { height: u32, width: u32 },
    Shortest { shortest_edge: u32 },
}

impl SizeSpec {
    fn pixels(self) -> u32 {
        match self {
            SizeSpec::Edge(v) => v,
            SizeSpec::Dims { height, width } => height.min(width),
            SizeSpec::Shortest { shortest_edge } => shortest_edge,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct PreprocessorFile {
    #[serde(default)]
    crop_size: Option<SizeSpec>,
    #[serde(default)]
    size: Option<SizeSpec>,
    #[serde(default)]
    image_mean: Option<[f32; 3]>,
    #[serde(default)]
    image_std: Option<[f32; 3]>,
}

/// CLIP-style image preprocessor, configured from the vision encoder's
/// `preprocessor_config.json`.
#[derive(Debug, Clone)]
pub struct ClipImagePreprocessor {
    pub crop_size: u32,
    pub image_mean: [f32; 3],
    pub image_std: [f32; 3],
}

impl Default for ClipImagePreprocessor {
    fn default() -> Self {
        Self {
            crop_size: 224,
            image_mean: CLIP_MEAN,
            image_std: CLIP_STD,
        }
    }
}

impl ClipImagePreprocessor {
    pub fn from_dir(dir: &Path) -> Result<Self, LlavaError> {
        let path = dir.join("preprocessor_config.json");
        if !path.is_file() {
            return Ok(Self::default());
        }
        let file: PreprocessorFile = serde_json::from_slice(&std::fs::read(path)?)?;
        Ok(Self {
            crop_size: file.crop_size.or(file.size).map_or(224, SizeSpec::pixels),
            image_mean: file.image_mean.unwrap_or(CLIP_MEAN),
            image_std: file.image_std.unwrap_or(CLIP_STD),
        })
    }

    /// Square-padding fill color: the per-channel mean scaled to 0-255, the
    /// value the encoder was trained to treat as background.
    pub fn fill_color(&self) -> Rgb<u8> {
        Rgb(self.image_mean.map(|m| (m * 255.0) as u8))
    }

    /// Pad to a square canvas, resize to the crop size and normalize into a
    /// `[1, 3, H, W]` tensor on `device`.
    pub fn preprocess(
        &self,
        img: &RgbImage,
        device: &Device,
        dtype: DType,
    ) -> Result<Tensor, LlavaError> {
        let squared = expand_to_square(img, self.fill_color());
        let resized = imageops::resize(
            &squared,
            self.crop_size,
            self.crop_size,
            FilterType::CatmullRom,
        );
        let (width, height) = (resized.width() as usize, resized.height() as usize);

        let mut tensor = Tensor::from_vec(
            resized.into_raw(),
            Shape::from_dims(&[height, width, 3]),
            device,
        )?
        .permute(vec![2, 0, 1])?
        .to_dtype(DType::F32)?;

        tensor = (tensor / 255.0)?;
        let mean = Tensor::from_slice(&self.image_mean, (3, 1, 1), device)?;
        let std = Tensor::from_slice(&self.image_std, (3, 1, 1), device)?;
        tensor = tensor.broadcast_sub(&mean)?.broadcast_div(&std)?;

        Ok(tensor.to_dtype(dtype)?.unsqueeze(0)?)
    }
}

/// Pad `img` to a square canvas filled with `fill`, centering the original
/// and preserving its aspect ratio.
pub fn expand_to_square(img: &RgbImage, fill: Rgb<u8>) -> RgbImage {
    let (width, height) = img.dimensions();
    if width == height {
        return img.clone();
    }
    let side = width.max(height);
    let mut canvas = RgbImage::from_pixel(side, side, fill);
    let x = (side - width) / 2;
    let y = (side - height) / 2;
    imageops::replace(&mut canvas, img, i64::from(x), i64::from(y));
    canvas
}
