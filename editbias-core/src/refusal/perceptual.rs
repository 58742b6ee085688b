//! Perceptual image similarity.
//!
//! Images are decoded, resized to a 64×64 luminance frame, and compared with
//! mean SSIM over non-overlapping 8×8 windows. Scores are clamped to `[0, 1]`.

use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat, ImageResult, RgbImage};
use std::io::Cursor;

const FRAME: u32 = 64;
const WINDOW: usize = 8;
const C1: f64 = (0.01 * 255.0) * (0.01 * 255.0);
const C2: f64 = (0.03 * 255.0) * (0.03 * 255.0);

/// A normalized 64×64 luminance frame.
#[derive(Debug, Clone, PartialEq)]
pub struct LumaFrame {
    pixels: Vec<f64>,
}

impl LumaFrame {
    /// Decode any supported format and normalize it.
    pub fn decode(bytes: &[u8]) -> ImageResult<Self> {
        let image = image::load_from_memory(bytes)?;
        Ok(Self::from_image(&image))
    }

    pub fn from_image(image: &DynamicImage) -> Self {
        let luma = image
            .resize_exact(FRAME, FRAME, FilterType::Triangle)
            .to_luma8();
        Self {
            pixels: luma.as_raw().iter().map(|&p| p as f64).collect(),
        }
    }

    /// A uniform frame, used for the built-in blank templates.
    pub fn flat(level: u8) -> Self {
        Self {
            pixels: vec![level as f64; (FRAME * FRAME) as usize],
        }
    }

    fn window(&self, wx: usize, wy: usize) -> impl Iterator<Item = f64> + '_ {
        let side = FRAME as usize;
        (0..WINDOW).flat_map(move |dy| {
            let row = (wy * WINDOW + dy) * side + wx * WINDOW;
            self.pixels[row..row + WINDOW].iter().copied()
        })
    }
}

/// Mean structural similarity of two frames, clamped to `[0, 1]`.
pub fn ssim(a: &LumaFrame, b: &LumaFrame) -> f64 {
    let windows = FRAME as usize / WINDOW;
    let n = (WINDOW * WINDOW) as f64;
    let mut total = 0.0;

    for wy in 0..windows {
        for wx in 0..windows {
            let xs: Vec<f64> = a.window(wx, wy).collect();
            let ys: Vec<f64> = b.window(wx, wy).collect();
            let mx = xs.iter().sum::<f64>() / n;
            let my = ys.iter().sum::<f64>() / n;
            let (mut vx, mut vy, mut cov) = (0.0, 0.0, 0.0);
            for (x, y) in xs.iter().zip(&ys) {
                vx += (x - mx).powi(2);
                vy += (y - my).powi(2);
                cov += (x - mx) * (y - my);
            }
            vx /= n - 1.0;
            vy /= n - 1.0;
            cov /= n - 1.0;

            total += ((2.0 * mx * my + C1) * (2.0 * cov + C2))
                / ((mx * mx + my * my + C1) * (vx + vy + C2));
        }
    }

    (total / (windows * windows) as f64).clamp(0.0, 1.0)
}

/// Encode an RGB buffer as PNG bytes.
pub fn encode_png(image: RgbImage) -> ImageResult<Vec<u8>> {
    let mut bytes = Vec::new();
    DynamicImage::ImageRgb8(image).write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)?;
    Ok(bytes)
}
