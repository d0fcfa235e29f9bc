//! Data Augmentation Module for Sorghum Cultivar Classification
//!
//! Augmentations are described as an ordered list of [`Step`]s. Each step is
//! either a single [`Transform`] gated by its own probability, or a `one_of`
//! group that, when its gate passes, fires exactly one member picked by
//! weight.
//!
//! Images travel through the pipeline as `Rgb32FImage` holding raw 0-255
//! values until a `Normalize` step rescales them.
//!
//! # Augmentation Strategy
//!
//! - **Training**: [`AugmentationPipeline::training_default`]
//! - **Validation/Test**: [`AugmentationPipeline::evaluation_counterpart`]
//!   (normalization only, applied deterministically)

use image::{imageops, Rgb, Rgb32FImage};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::utils::error::{Result, SorghumError};

/// Upper bound of the raw pixel range before normalization
const PIXEL_MAX: f32 = 255.0;

/// How a rotation fills pixels that fall outside the source image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BorderMode {
    /// Mirror without repeating the edge pixel (`dcb|abcd|cba`)
    #[default]
    Reflect101,
    /// Fill with zeros
    Constant,
}

fn default_max_pixel_value() -> f32 {
    PIXEL_MAX
}

fn default_weight() -> f32 {
    1.0
}

/// A single image transform
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Transform {
    HorizontalFlip,
    VerticalFlip,
    /// Rotate counter-clockwise by `k * 90` degrees, `k` uniform in `0..4`
    RandomRotate90,
    /// Rotate by an angle uniform in `[-limit, limit]` degrees
    Rotate {
        limit: f32,
        #[serde(default)]
        border: BorderMode,
    },
    /// Brightness, contrast, saturation and hue jitter in random order.
    ///
    /// The first three draw a factor from `[max(0, 1 - v), 1 + v]`; hue draws
    /// a shift from `[-hue, hue]` turns of the colour wheel.
    ColorJitter {
        brightness: f32,
        contrast: f32,
        saturation: f32,
        hue: f32,
    },
    /// Random permutation of the RGB channels
    ChannelShuffle,
    /// `(x / max_pixel_value - mean) / std` per channel
    Normalize {
        mean: [f32; 3],
        std: [f32; 3],
        #[serde(default = "default_max_pixel_value")]
        max_pixel_value: f32,
    },
    /// Marks the end of the pipeline; the layout change happens when the
    /// sample tensor is built
    ToTensor,
}

impl Transform {
    fn validate(&self) -> Result<()> {
        match self {
            Transform::Rotate { limit, .. } if !(limit.is_finite() && *limit >= 0.0) => Err(
                SorghumError::Augmentation(format!("rotate limit must be >= 0, got {}", limit)),
            ),
            Transform::ColorJitter {
                brightness,
                contrast,
                saturation,
                hue,
            } => {
                for (name, value) in [
                    ("brightness", brightness),
                    ("contrast", contrast),
                    ("saturation", saturation),
                ] {
                    if !(value.is_finite() && *value >= 0.0) {
                        return Err(SorghumError::Augmentation(format!(
                            "color jitter {} must be >= 0, got {}",
                            name, value
                        )));
                    }
                }
                if !(0.0..=0.5).contains(hue) {
                    return Err(SorghumError::Augmentation(format!(
                        "color jitter hue must be in [0, 0.5], got {}",
                        hue
                    )));
                }
                Ok(())
            }
            Transform::Normalize {
                std,
                max_pixel_value,
                ..
            } => {
                if std.iter().any(|s| *s == 0.0 || !s.is_finite()) {
                    return Err(SorghumError::Augmentation(format!(
                        "normalize std entries must be non-zero, got {:?}",
                        std
                    )));
                }
                if !(max_pixel_value.is_finite() && *max_pixel_value > 0.0) {
                    return Err(SorghumError::Augmentation(format!(
                        "normalize max_pixel_value must be > 0, got {}",
                        max_pixel_value
                    )));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Apply the transform to an image
    pub fn apply<R: Rng + ?Sized>(&self, img: Rgb32FImage, rng: &mut R) -> Rgb32FImage {
        match self {
            Transform::HorizontalFlip => imageops::flip_horizontal(&img),
            Transform::VerticalFlip => imageops::flip_vertical(&img),
            Transform::RandomRotate90 => match rng.gen_range(0..4u8) {
                1 => imageops::rotate270(&img),
                2 => imageops::rotate180(&img),
                3 => imageops::rotate90(&img),
                _ => img,
            },
            Transform::Rotate { limit, border } => {
                let angle = if *limit > 0.0 {
                    rng.gen_range(-*limit..=*limit)
                } else {
                    0.0
                };
                rotate(&img, angle, *border)
            }
            Transform::ColorJitter {
                brightness,
                contrast,
                saturation,
                hue,
            } => color_jitter(img, [*brightness, *contrast, *saturation], *hue, rng),
            Transform::ChannelShuffle => {
                let mut order = [0usize, 1, 2];
                order.shuffle(rng);
                let mut img = img;
                for pixel in img.pixels_mut() {
                    let src = pixel.0;
                    pixel.0 = [src[order[0]], src[order[1]], src[order[2]]];
                }
                img
            }
            Transform::Normalize {
                mean,
                std,
                max_pixel_value,
            } => {
                let mut img = img;
                for pixel in img.pixels_mut() {
                    for c in 0..3 {
                        pixel[c] = (pixel[c] / max_pixel_value - mean[c]) / std[c];
                    }
                }
                img
            }
            Transform::ToTensor => img,
        }
    }
}

/// A transform with its selection weight inside a `one_of` group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightedTransform {
    pub transform: Transform,
    #[serde(default = "default_weight")]
    pub weight: f32,
}

/// One entry of an augmentation pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum Step {
    /// Apply `transform` with probability `p`
    Apply { transform: Transform, p: f32 },
    /// With probability `p`, apply exactly one of `choices` chosen by weight
    OneOf {
        choices: Vec<WeightedTransform>,
        p: f32,
    },
}

impl Step {
    pub fn always(transform: Transform) -> Self {
        Step::Apply { transform, p: 1.0 }
    }

    pub fn with_p(transform: Transform, p: f32) -> Self {
        Step::Apply { transform, p }
    }

    pub fn p(&self) -> f32 {
        match self {
            Step::Apply { p, .. } | Step::OneOf { p, .. } => *p,
        }
    }

    fn transforms(&self) -> Vec<&Transform> {
        match self {
            Step::Apply { transform, .. } => vec![transform],
            Step::OneOf { choices, .. } => choices.iter().map(|c| &c.transform).collect(),
        }
    }

    fn apply<R: Rng + ?Sized>(&self, img: Rgb32FImage, rng: &mut R) -> Rgb32FImage {
        if !gate(self.p(), rng) {
            return img;
        }
        match self {
            Step::Apply { transform, .. } => transform.apply(img, rng),
            Step::OneOf { choices, .. } => {
                let choice = choices
                    .choose_weighted(rng, |c| c.weight)
                    .ok()
                    .or_else(|| choices.first());
                match choice {
                    Some(choice) => choice.transform.apply(img, rng),
                    None => img,
                }
            }
        }
    }
}

fn gate<R: Rng + ?Sized>(p: f32, rng: &mut R) -> bool {
    p >= 1.0 || rng.gen::<f32>() < p
}

/// Validated, ordered list of augmentation steps
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(try_from = "Vec<Step>", into = "Vec<Step>")]
pub struct AugmentationPipeline {
    steps: Vec<Step>,
}

impl AugmentationPipeline {
    /// Build a pipeline, rejecting invalid step lists
    pub fn new(steps: Vec<Step>) -> Result<Self> {
        let last = steps.len().saturating_sub(1);
        let mut normalized = false;

        for (i, step) in steps.iter().enumerate() {
            let p = step.p();
            if !(0.0..=1.0).contains(&p) {
                return Err(SorghumError::Augmentation(format!(
                    "step {}: probability must be in [0, 1], got {}",
                    i, p
                )));
            }

            if let Step::OneOf { choices, .. } = step {
                if choices.is_empty() {
                    return Err(SorghumError::Augmentation(format!(
                        "step {}: one_of group is empty",
                        i
                    )));
                }
                if choices
                    .iter()
                    .any(|c| !(c.weight.is_finite() && c.weight >= 0.0))
                {
                    return Err(SorghumError::Augmentation(format!(
                        "step {}: one_of weights must be finite and non-negative",
                        i
                    )));
                }
                let total = choices.iter().map(|c| c.weight).sum::<f32>();
                if !(total.is_finite() && total > 0.0) {
                    return Err(SorghumError::Augmentation(format!(
                        "step {}: one_of weights must sum to a finite positive value",
                        i
                    )));
                }
            }

            for transform in step.transforms() {
                transform.validate()?;
                match transform {
                    Transform::ToTensor => {
                        let terminal = i == last && matches!(step, Step::Apply { .. });
                        if !terminal {
                            return Err(SorghumError::Augmentation(format!(
                                "step {}: to_tensor may only be the final step",
                                i
                            )));
                        }
                    }
                    Transform::ColorJitter { .. } if normalized => {
                        return Err(SorghumError::Augmentation(format!(
                            "step {}: color_jitter must come before normalize",
                            i
                        )));
                    }
                    _ => {}
                }
            }

            if step
                .transforms()
                .iter()
                .any(|t| matches!(t, Transform::Normalize { .. }))
            {
                normalized = true;
            }
        }

        Ok(Self { steps })
    }

    /// Training composition: flips, rotation, colour jitter, channel shuffle,
    /// then normalization to `[-1, 1]`
    pub fn training_default() -> Self {
        Self {
            steps: vec![
                Step::with_p(Transform::HorizontalFlip, 0.5),
                Step::with_p(Transform::VerticalFlip, 0.5),
                Step::OneOf {
                    choices: vec![
                        WeightedTransform {
                            transform: Transform::RandomRotate90,
                            weight: 0.5,
                        },
                        WeightedTransform {
                            transform: Transform::Rotate {
                                limit: 90.0,
                                border: BorderMode::Reflect101,
                            },
                            weight: 0.5,
                        },
                    ],
                    p: 0.5,
                },
                Step::with_p(
                    Transform::ColorJitter {
                        brightness: 0.2,
                        contrast: 0.2,
                        saturation: 0.2,
                        hue: 0.2,
                    },
                    0.3,
                ),
                Step::with_p(Transform::ChannelShuffle, 0.3),
                Step::always(Transform::Normalize {
                    mean: [0.5; 3],
                    std: [0.5; 3],
                    max_pixel_value: PIXEL_MAX,
                }),
                Step::always(Transform::ToTensor),
            ],
        }
    }

    /// Deterministic counterpart for validation and inference: only the
    /// normalize and to_tensor steps, each forced to `p = 1`
    pub fn evaluation_counterpart(&self) -> Self {
        let steps = self
            .steps
            .iter()
            .filter_map(|step| match step {
                Step::Apply { transform, .. }
                    if matches!(transform, Transform::Normalize { .. } | Transform::ToTensor) =>
                {
                    Some(Step::always(transform.clone()))
                }
                _ => None,
            })
            .collect();
        Self { steps }
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Run every step in order
    pub fn apply<R: Rng + ?Sized>(&self, img: Rgb32FImage, rng: &mut R) -> Rgb32FImage {
        self.steps
            .iter()
            .fold(img, |img, step| step.apply(img, rng))
    }
}

impl TryFrom<Vec<Step>> for AugmentationPipeline {
    type Error = SorghumError;

    fn try_from(steps: Vec<Step>) -> Result<Self> {
        Self::new(steps)
    }
}

impl From<AugmentationPipeline> for Vec<Step> {
    fn from(pipeline: AugmentationPipeline) -> Self {
        pipeline.steps
    }
}

/// Map an integer coordinate into `0..n` by mirroring without repeating the edge
fn reflect101(i: i64, n: i64) -> i64 {
    if n == 1 {
        return 0;
    }
    let period = 2 * (n - 1);
    let i = i.rem_euclid(period);
    if i >= n {
        period - i
    } else {
        i
    }
}

/// Bilinear sample at a fractional position
fn bilinear_sample(img: &Rgb32FImage, x: f32, y: f32, border: BorderMode) -> Rgb<f32> {
    let (width, height) = img.dimensions();
    let (w, h) = (width as i64, height as i64);

    let x0 = x.floor() as i64;
    let y0 = y.floor() as i64;
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;

    let fetch = |px: i64, py: i64| -> [f32; 3] {
        match border {
            BorderMode::Reflect101 => {
                img.get_pixel(reflect101(px, w) as u32, reflect101(py, h) as u32)
                    .0
            }
            BorderMode::Constant => {
                if px < 0 || py < 0 || px >= w || py >= h {
                    [0.0; 3]
                } else {
                    img.get_pixel(px as u32, py as u32).0
                }
            }
        }
    };

    let p00 = fetch(x0, y0);
    let p10 = fetch(x0 + 1, y0);
    let p01 = fetch(x0, y0 + 1);
    let p11 = fetch(x0 + 1, y0 + 1);

    let mut out = [0.0f32; 3];
    for c in 0..3 {
        out[c] = p00[c] * (1.0 - fx) * (1.0 - fy)
            + p10[c] * fx * (1.0 - fy)
            + p01[c] * (1.0 - fx) * fy
            + p11[c] * fx * fy;
    }
    Rgb(out)
}

/// Rotate around the image centre by `angle_degrees`
fn rotate(img: &Rgb32FImage, angle_degrees: f32, border: BorderMode) -> Rgb32FImage {
    if angle_degrees == 0.0 {
        return img.clone();
    }

    let (width, height) = img.dimensions();
    let cx = (width as f32 - 1.0) / 2.0;
    let cy = (height as f32 - 1.0) / 2.0;

    let angle = angle_degrees.to_radians();
    let (sin_a, cos_a) = angle.sin_cos();

    Rgb32FImage::from_fn(width, height, |x, y| {
        let dx = x as f32 - cx;
        let dy = y as f32 - cy;

        let src_x = cx + dx * cos_a + dy * sin_a;
        let src_y = cy - dx * sin_a + dy * cos_a;

        bilinear_sample(img, src_x, src_y, border)
    })
}

fn luma(p: &[f32; 3]) -> f32 {
    0.299 * p[0] + 0.587 * p[1] + 0.114 * p[2]
}

fn jitter_factor<R: Rng + ?Sized>(amount: f32, rng: &mut R) -> Option<f32> {
    (amount > 0.0).then(|| rng.gen_range((1.0 - amount).max(0.0)..=1.0 + amount))
}

fn color_jitter<R: Rng + ?Sized>(
    mut img: Rgb32FImage,
    factors: [f32; 3],
    hue: f32,
    rng: &mut R,
) -> Rgb32FImage {
    let mut order = [0usize, 1, 2, 3];
    order.shuffle(rng);

    for op in order {
        match op {
            0 => {
                if let Some(f) = jitter_factor(factors[0], rng) {
                    for pixel in img.pixels_mut() {
                        for v in pixel.0.iter_mut() {
                            *v = (*v * f).clamp(0.0, PIXEL_MAX);
                        }
                    }
                }
            }
            1 => {
                if let Some(f) = jitter_factor(factors[1], rng) {
                    let count = (img.width() as f32 * img.height() as f32).max(1.0);
                    let mean = img.pixels().map(|p| luma(&p.0)).sum::<f32>() / count;
                    for pixel in img.pixels_mut() {
                        for v in pixel.0.iter_mut() {
                            *v = (*v * f + mean * (1.0 - f)).clamp(0.0, PIXEL_MAX);
                        }
                    }
                }
            }
            2 => {
                if let Some(f) = jitter_factor(factors[2], rng) {
                    for pixel in img.pixels_mut() {
                        let gray = luma(&pixel.0);
                        for v in pixel.0.iter_mut() {
                            *v = (*v * f + gray * (1.0 - f)).clamp(0.0, PIXEL_MAX);
                        }
                    }
                }
            }
            _ => {
                if hue > 0.0 {
                    let shift = rng.gen_range(-hue..=hue);
                    if shift != 0.0 {
                        for pixel in img.pixels_mut() {
                            pixel.0 = shift_hue(pixel.0, shift);
                        }
                    }
                }
            }
        }
    }

    img
}

/// Rotate the hue of a 0-255 RGB triple by `shift` turns
fn shift_hue(rgb: [f32; 3], shift: f32) -> [f32; 3] {
    let [r, g, b] = rgb.map(|v| v / PIXEL_MAX);
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;

    if delta <= f32::EPSILON {
        return rgb;
    }

    let hue = if max == r {
        ((g - b) / delta).rem_euclid(6.0)
    } else if max == g {
        (b - r) / delta + 2.0
    } else {
        (r - g) / delta + 4.0
    };
    let saturation = delta / max;
    let value = max;

    let sector = (hue / 6.0 + shift).rem_euclid(1.0) * 6.0;
    hsv_to_rgb(sector, saturation, value).map(|v| (v * PIXEL_MAX).clamp(0.0, PIXEL_MAX))
}

/// `h` is the hue in sixths of a turn, `[0, 6)`
fn hsv_to_rgb(h: f32, s: f32, v: f32) -> [f32; 3] {
    let c = v * s;
    let x = c * (1.0 - ((h % 2.0) - 1.0).abs());
    let m = v - c;

    let (r, g, b) = match h as u32 {
        0 => (c, x, 0.0),
        1 => (x, c, 0.0),
        2 => (0.0, c, x),
        3 => (0.0, x, c),
        4 => (x, 0.0, c),
        _ => (c, 0.0, x),
    };
    [r + m, g + m, b + m]
}
