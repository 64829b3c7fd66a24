// src/metrics.rs

use crate::config::DEFAULT_FRAME_CAP;
use crate::error::Result;
use crate::session::TrialId;
use crate::source::{Frame, FrameSource, SourceOpener};
use image::GrayImage;
use image::imageops::{self, FilterType};
use log::{debug, info, warn};
use quantiles::ckms::CKMS;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::path::{Path, PathBuf};

/// PSNR reported for pixel-identical frames instead of infinity.
pub const PSNR_IDENTICAL: f64 = 100.0;

const SSIM_WINDOW: usize = 7;
const SSIM_K1: f64 = 0.01;
const SSIM_K2: f64 = 0.03;
const DATA_RANGE: f64 = 255.0;

// --- Data Structures ---

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MetricStats {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub p1: f64,
    pub p25: f64,
    pub p75: f64,
}

impl MetricStats {
    /// Summary of a per-frame series; `None` when the series is empty.
    pub fn from_series(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let mut quantiles = CKMS::<f64>::new(0.001);
        for v in values {
            quantiles.insert(*v);
        }
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let query = |q: f64| quantiles.query(q).map_or(f64::NAN, |(_, v)| v);
        Some(Self {
            min,
            max,
            mean: mean(values),
            p1: query(0.01),
            p25: query(0.25),
            p75: query(0.75),
        })
    }
}

/// Objective scores for one trial.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MetricSample {
    pub trial_id: TrialId,
    pub distorted: PathBuf,
    pub psnr: f64,
    pub ssim: f64,
    pub frames_compared: usize,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub psnr_stats: Option<MetricStats>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub ssim_stats: Option<MetricStats>,
}

/// Mean of a series, 0.0 when empty.
fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

// --- Per-frame metrics ---

/// Brings a frame pair to a common size, shrinking whichever side is larger.
///
/// Frames are never upscaled; already matching frames are borrowed as is.
pub fn equalize<'a>(reference: &'a GrayImage, distorted: &'a GrayImage) -> (Cow<'a, GrayImage>, Cow<'a, GrayImage>) {
    if reference.dimensions() == distorted.dimensions() {
        return (Cow::Borrowed(reference), Cow::Borrowed(distorted));
    }
    let (rw, rh) = reference.dimensions();
    let (dw, dh) = distorted.dimensions();
    let (w, h) = (rw.min(dw).max(1), rh.min(dh).max(1));
    debug!("Resizing frame pair {}x{} / {}x{} to {}x{}", rw, rh, dw, dh, w, h);
    let shrink = |img: &'a GrayImage| -> Cow<'a, GrayImage> {
        if img.dimensions() == (w, h) {
            Cow::Borrowed(img)
        } else {
            Cow::Owned(imageops::resize(img, w, h, FilterType::Triangle))
        }
    };
    (shrink(reference), shrink(distorted))
}

/// PSNR in dB between two equally sized luminance frames.
pub fn frame_psnr(reference: &GrayImage, distorted: &GrayImage) -> f64 {
    let (reference, distorted) = equalize(reference, distorted);
    let n = reference.as_raw().len();
    if n == 0 {
        return PSNR_IDENTICAL;
    }
    let sse: f64 = reference
        .as_raw()
        .iter()
        .zip(distorted.as_raw())
        .map(|(&a, &b)| {
            let d = f64::from(a) - f64::from(b);
            d * d
        })
        .sum();
    let mse = sse / n as f64;
    if mse == 0.0 {
        PSNR_IDENTICAL
    } else {
        20.0 * (DATA_RANGE / mse.sqrt()).log10()
    }
}

/// Summed-area table over a per-pixel quantity.
struct Integral {
    stride: usize,
    sums: Vec<f64>,
}

impl Integral {
    fn build(width: usize, height: usize, value: impl Fn(usize, usize) -> f64) -> Self {
        let stride = width + 1;
        let mut sums = vec![0.0; stride * (height + 1)];
        for y in 0..height {
            let mut row = 0.0;
            for x in 0..width {
                row += value(x, y);
                sums[(y + 1) * stride + x + 1] = sums[y * stride + x + 1] + row;
            }
        }
        Self { stride, sums }
    }

    /// Sum over the half-open box `[x0, x1) x [y0, y1)`.
    fn sum(&self, x0: usize, y0: usize, x1: usize, y1: usize) -> f64 {
        let s = self.stride;
        self.sums[y1 * s + x1] - self.sums[y0 * s + x1] - self.sums[y1 * s + x0] + self.sums[y0 * s + x0]
    }
}

/// Mean structural similarity over 7x7 uniform windows, data range 255.
///
/// Windows use sample covariance and only positions where the window fits
/// entirely inside the frame are averaged. Frames smaller than one window
/// fall back to a single window covering the whole frame.
pub fn frame_ssim(reference: &GrayImage, distorted: &GrayImage) -> f64 {
    let (reference, distorted) = equalize(reference, distorted);
    let (w, h) = (reference.width() as usize, reference.height() as usize);
    if w == 0 || h == 0 {
        return 1.0;
    }
    let a: &[u8] = reference.as_raw();
    let b: &[u8] = distorted.as_raw();
    let px = |buf: &[u8], x: usize, y: usize| f64::from(buf[y * w + x]);

    let sa = Integral::build(w, h, |x, y| px(a, x, y));
    let sb = Integral::build(w, h, |x, y| px(b, x, y));
    let saa = Integral::build(w, h, |x, y| px(a, x, y).powi(2));
    let sbb = Integral::build(w, h, |x, y| px(b, x, y).powi(2));
    let sab = Integral::build(w, h, |x, y| px(a, x, y) * px(b, x, y));

    let window = |x0: usize, y0: usize, x1: usize, y1: usize| -> f64 {
        let np = ((x1 - x0) * (y1 - y0)) as f64;
        let cov_norm = if np > 1.0 { np / (np - 1.0) } else { 1.0 };
        let ux = sa.sum(x0, y0, x1, y1) / np;
        let uy = sb.sum(x0, y0, x1, y1) / np;
        let vx = cov_norm * (saa.sum(x0, y0, x1, y1) / np - ux * ux);
        let vy = cov_norm * (sbb.sum(x0, y0, x1, y1) / np - uy * uy);
        let vxy = cov_norm * (sab.sum(x0, y0, x1, y1) / np - ux * uy);
        ssim_index(ux, uy, vx, vy, vxy)
    };

    if w < SSIM_WINDOW || h < SSIM_WINDOW {
        return window(0, 0, w, h);
    }

    let mut total = 0.0;
    let mut count = 0usize;
    for y0 in 0..=(h - SSIM_WINDOW) {
        for x0 in 0..=(w - SSIM_WINDOW) {
            total += window(x0, y0, x0 + SSIM_WINDOW, y0 + SSIM_WINDOW);
            count += 1;
        }
    }
    total / count as f64
}

fn ssim_index(ux: f64, uy: f64, vx: f64, vy: f64, vxy: f64) -> f64 {
    let c1 = (SSIM_K1 * DATA_RANGE).powi(2);
    let c2 = (SSIM_K2 * DATA_RANGE).powi(2);
    let numerator = (2.0 * ux * uy + c1) * (2.0 * vxy + c2);
    let denominator = (ux * ux + uy * uy + c1) * (vx + vy + c2);
    numerator / denominator
}

// --- Per-video metrics ---

/// Computes objective scores between a reference and a distorted video.
///
/// Every call opens its own handles on both files, independent of any
/// playback that may have the same paths open.
pub struct MetricEngine<'a> {
    opener: &'a dyn SourceOpener,
    frame_cap: usize,
}

impl<'a> MetricEngine<'a> {
    pub fn new(opener: &'a dyn SourceOpener) -> Self {
        Self {
            opener,
            frame_cap: DEFAULT_FRAME_CAP,
        }
    }

    /// Limits how many leading frame pairs are compared.
    pub fn with_frame_cap(mut self, frame_cap: usize) -> Self {
        self.frame_cap = frame_cap.max(1);
        self
    }

    pub fn frame_cap(&self) -> usize {
        self.frame_cap
    }

    /// Mean PSNR over the compared frames, 0.0 when nothing was compared.
    pub fn psnr(&self, reference: &Path, distorted: &Path) -> f64 {
        mean(&self.psnr_series(reference, distorted))
    }

    /// Mean SSIM over the compared frames, 0.0 when nothing was compared.
    pub fn ssim(&self, reference: &Path, distorted: &Path) -> f64 {
        mean(&self.ssim_series(reference, distorted))
    }

    pub fn psnr_series(&self, reference: &Path, distorted: &Path) -> Vec<f64> {
        self.pair_series(reference, distorted, frame_psnr)
    }

    pub fn ssim_series(&self, reference: &Path, distorted: &Path) -> Vec<f64> {
        self.pair_series(reference, distorted, frame_ssim)
    }

    /// PSNR and SSIM for one trial in a single decoding pass.
    pub fn measure(&self, trial_id: TrialId, reference: &Path, distorted: &Path) -> MetricSample {
        let pairs = self.pair_series(reference, distorted, |a, b| (frame_psnr(a, b), frame_ssim(a, b)));
        let (psnr, ssim): (Vec<f64>, Vec<f64>) = pairs.into_iter().unzip();
        let sample = MetricSample {
            trial_id,
            distorted: distorted.to_path_buf(),
            psnr: mean(&psnr),
            ssim: mean(&ssim),
            frames_compared: psnr.len(),
            psnr_stats: MetricStats::from_series(&psnr),
            ssim_stats: MetricStats::from_series(&ssim),
        };
        info!(
            "Trial {} ({}): PSNR {:.2} dB, SSIM {:.4} over {} frames",
            trial_id,
            distorted.display(),
            sample.psnr,
            sample.ssim,
            sample.frames_compared
        );
        sample
    }

    /// Applies `metric` to up to `frame_cap` leading luminance frame pairs.
    ///
    /// Stops early when either stream ends or fails to decode; unreadable
    /// inputs give an empty series.
    fn pair_series<T>(
        &self,
        reference: &Path,
        distorted: &Path,
        metric: impl Fn(&GrayImage, &GrayImage) -> T,
    ) -> Vec<T> {
        let (mut ref_src, mut dist_src) = match (self.opener.open(reference), self.opener.open(distorted)) {
            (Ok(r), Ok(d)) => (r, d),
            (Err(e), _) | (_, Err(e)) => {
                warn!("Skipping metric pass for {}: {}", distorted.display(), e);
                return Vec::new();
            }
        };

        let mut values = Vec::new();
        while values.len() < self.frame_cap {
            let pair = read_pair(ref_src.as_mut(), dist_src.as_mut());
            let (r, d) = match pair {
                Ok(Some(pair)) => pair,
                Ok(None) => break,
                Err(e) => {
                    warn!("Decode failed after {} frame pairs of {}: {}", values.len(), distorted.display(), e);
                    break;
                }
            };
            values.push(metric(&r.pixels.to_luma(), &d.pixels.to_luma()));
        }
        ref_src.close();
        dist_src.close();

        debug!("Compared {} frame pairs for {}", values.len(), distorted.display());
        values
    }
}

fn read_pair(
    reference: &mut dyn FrameSource,
    distorted: &mut dyn FrameSource,
) -> Result<Option<(Frame, Frame)>> {
    let Some(r) = reference.next_frame()? else {
        return Ok(None);
    };
    let Some(d) = distorted.next_frame()? else {
        return Ok(None);
    };
    Ok(Some((r, d)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{MemoryClip, MemoryOpener, Pixels};
    use image::Luma;

    fn textured(w: u32, h: u32, seed: u32) -> GrayImage {
        GrayImage::from_fn(w, h, |x, y| Luma([((x * 37 + y * 91 + seed * 13) % 251) as u8]))
    }

    fn clip(frames: Vec<GrayImage>) -> MemoryClip {
        MemoryClip::new(30.0, frames.into_iter().map(Pixels::Luma).collect())
    }

    #[test]
    fn identical_frames_hit_psnr_sentinel_and_unit_ssim() {
        let img = textured(32, 24, 1);
        assert_eq!(frame_psnr(&img, &img), PSNR_IDENTICAL);
        assert!((frame_ssim(&img, &img) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn psnr_matches_closed_form() {
        let a = GrayImage::from_pixel(8, 8, Luma([100]));
        let b = GrayImage::from_pixel(8, 8, Luma([110]));
        // MSE = 100 -> 20*log10(255/10)
        let expected = 20.0 * (25.5f64).log10();
        assert!((frame_psnr(&a, &b) - expected).abs() < 1e-9);
    }

    #[test]
    fn ssim_drops_for_noisy_frames() {
        let a = textured(32, 32, 1);
        let b = GrayImage::from_fn(32, 32, |x, y| {
            let v = a.get_pixel(x, y).0[0];
            Luma([if (x + y) % 2 == 0 { v.saturating_add(60) } else { v.saturating_sub(60) }])
        });
        let s = frame_ssim(&a, &b);
        assert!(s < 0.95 && s > -1.0, "ssim {}", s);
    }

    #[test]
    fn mismatched_sizes_shrink_to_common_dimensions() {
        let big = GrayImage::from_pixel(20, 10, Luma([50]));
        let small = GrayImage::from_pixel(10, 20, Luma([50]));
        let (a, b) = equalize(&big, &small);
        assert_eq!(a.dimensions(), (10, 10));
        assert_eq!(b.dimensions(), (10, 10));
        assert!((frame_ssim(&big, &small) - 1.0).abs() < 1e-9);
        assert_eq!(frame_psnr(&big, &small), PSNR_IDENTICAL);
    }

    #[test]
    fn tiny_frames_use_single_window() {
        let a = GrayImage::from_pixel(3, 3, Luma([9]));
        assert!((frame_ssim(&a, &a) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn video_against_itself() {
        let mut opener = MemoryOpener::new();
        opener.insert("ref.mp4", clip((0..5).map(|i| textured(16, 16, i)).collect()));
        let engine = MetricEngine::new(&opener);
        let series = engine.psnr_series(Path::new("ref.mp4"), Path::new("ref.mp4"));
        assert_eq!(series, vec![PSNR_IDENTICAL; 5]);
        assert_eq!(engine.psnr(Path::new("ref.mp4"), Path::new("ref.mp4")), 100.0);
        assert!((engine.ssim(Path::new("ref.mp4"), Path::new("ref.mp4")) - 1.0).abs() < 1e-9);
        assert_eq!(opener.open_handles(), 0);
    }

    #[test]
    fn frame_cap_and_shorter_stream_bound_the_pass() {
        let mut opener = MemoryOpener::new();
        opener.insert("long.mp4", MemoryClip::solid(8, 8, 150, 10, 30.0));
        opener.insert("long2.mp4", MemoryClip::solid(8, 8, 150, 20, 30.0));
        opener.insert("short.mp4", MemoryClip::solid(8, 8, 4, 20, 30.0));

        let engine = MetricEngine::new(&opener);
        assert_eq!(engine.psnr_series(Path::new("long.mp4"), Path::new("long2.mp4")).len(), 100);
        assert_eq!(engine.psnr_series(Path::new("long.mp4"), Path::new("short.mp4")).len(), 4);

        let capped = MetricEngine::new(&opener).with_frame_cap(7);
        assert_eq!(capped.ssim_series(Path::new("long.mp4"), Path::new("long2.mp4")).len(), 7);
    }

    #[test]
    fn unreadable_or_empty_inputs_score_zero() {
        let mut opener = MemoryOpener::new();
        opener.insert("ref.mp4", MemoryClip::solid(8, 8, 3, 10, 30.0));
        opener.insert("empty.mp4", MemoryClip::new(30.0, Vec::new()));
        let engine = MetricEngine::new(&opener);
        assert_eq!(engine.psnr(Path::new("ref.mp4"), Path::new("missing.mp4")), 0.0);
        assert_eq!(engine.ssim(Path::new("ref.mp4"), Path::new("empty.mp4")), 0.0);

        let sample = engine.measure(TrialId(0), Path::new("ref.mp4"), Path::new("missing.mp4"));
        assert_eq!((sample.psnr, sample.ssim, sample.frames_compared), (0.0, 0.0, 0));
        assert!(sample.psnr_stats.is_none());
        assert_eq!(opener.open_handles(), 0);
    }

    #[test]
    fn measure_reports_series_statistics() {
        let mut opener = MemoryOpener::new();
        opener.insert("ref.mp4", MemoryClip::solid(8, 8, 10, 100, 30.0));
        opener.insert("dist.mp4", MemoryClip::solid(8, 8, 10, 110, 30.0));
        let sample = MetricEngine::new(&opener).measure(TrialId(3), Path::new("ref.mp4"), Path::new("dist.mp4"));
        assert_eq!(sample.frames_compared, 10);
        let stats = sample.psnr_stats.unwrap();
        assert!((stats.min - stats.max).abs() < 1e-12);
        assert!((stats.mean - sample.psnr).abs() < 1e-12);
    }
}
