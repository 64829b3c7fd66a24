// src/source.rs

use crate::config::DEFAULT_FPS;
use crate::error::{Result, VqError};
use image::{GrayImage, Luma, Rgb, RgbImage};
use log::debug;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Decoded pixel data, either 3-channel colour or single-channel luminance.
#[derive(Debug, Clone, PartialEq)]
pub enum Pixels {
    Rgb(RgbImage),
    Luma(GrayImage),
}

impl Pixels {
    pub fn dimensions(&self) -> (u32, u32) {
        match self {
            Pixels::Rgb(img) => img.dimensions(),
            Pixels::Luma(img) => img.dimensions(),
        }
    }

    /// Single-channel luminance using BT.601 weights.
    pub fn to_luma(&self) -> GrayImage {
        match self {
            Pixels::Luma(img) => img.clone(),
            Pixels::Rgb(img) => {
                let (w, h) = img.dimensions();
                GrayImage::from_fn(w, h, |x, y| {
                    let Rgb([r, g, b]) = *img.get_pixel(x, y);
                    let y = 0.299 * f64::from(r) + 0.587 * f64::from(g) + 0.114 * f64::from(b);
                    Luma([y.round().clamp(0.0, 255.0) as u8])
                })
            }
        }
    }

    pub fn to_rgb(&self) -> RgbImage {
        match self {
            Pixels::Rgb(img) => img.clone(),
            Pixels::Luma(img) => {
                let (w, h) = img.dimensions();
                RgbImage::from_fn(w, h, |x, y| {
                    let Luma([v]) = *img.get_pixel(x, y);
                    Rgb([v, v, v])
                })
            }
        }
    }
}

/// One decoded frame, tagged with its source and position in that source.
#[derive(Debug, Clone)]
pub struct Frame {
    pub source: Arc<Path>,
    pub index: u64,
    pub pixels: Pixels,
}

/// An open, sequentially decodable video stream.
///
/// Each `next_frame` call advances the read position by exactly one frame.
/// `Ok(None)` signals end of stream. `close` is idempotent.
pub trait FrameSource: Send {
    fn path(&self) -> &Path;

    /// Reported frame rate, already falling back to a default when the
    /// stream reports none.
    fn frame_rate(&self) -> f64;

    fn frame_count(&self) -> Option<u64>;

    fn position(&self) -> u64;

    fn next_frame(&mut self) -> Result<Option<Frame>>;

    fn rewind(&mut self) -> Result<()>;

    fn close(&mut self);
}

/// Opens independent handles on video paths.
pub trait SourceOpener: Send + Sync {
    fn open(&self, path: &Path) -> Result<Box<dyn FrameSource>>;
}

/// Applies the default-rate fallback to a stream's reported rate.
pub fn effective_frame_rate(reported: Option<f64>, default_fps: f64) -> f64 {
    match reported {
        Some(fps) if fps.is_finite() && fps > 0.0 => fps,
        _ => default_fps,
    }
}

/// A clip held entirely in memory.
#[derive(Debug, Clone)]
pub struct MemoryClip {
    pub fps: f64,
    pub frames: Arc<Vec<Pixels>>,
}

impl MemoryClip {
    pub fn new(fps: f64, frames: Vec<Pixels>) -> Self {
        Self {
            fps,
            frames: Arc::new(frames),
        }
    }

    /// `count` frames of a single flat luminance value.
    pub fn solid(width: u32, height: u32, count: usize, value: u8, fps: f64) -> Self {
        let frame = Pixels::Luma(GrayImage::from_pixel(width, height, Luma([value])));
        Self::new(fps, vec![frame; count])
    }
}

/// Serves registered in-memory clips; used for headless runs and tests.
///
/// Tracks how many handles are open so callers can check that decoders are
/// released between trials.
#[derive(Debug, Default)]
pub struct MemoryOpener {
    clips: HashMap<PathBuf, MemoryClip>,
    open_handles: Arc<AtomicUsize>,
    default_fps: Option<f64>,
}

impl MemoryOpener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default_fps(mut self, fps: f64) -> Self {
        self.default_fps = Some(fps);
        self
    }

    pub fn insert(&mut self, path: impl Into<PathBuf>, clip: MemoryClip) -> &mut Self {
        self.clips.insert(path.into(), clip);
        self
    }

    pub fn open_handles(&self) -> usize {
        self.open_handles.load(Ordering::SeqCst)
    }
}

impl SourceOpener for MemoryOpener {
    fn open(&self, path: &Path) -> Result<Box<dyn FrameSource>> {
        let clip = self
            .clips
            .get(path)
            .ok_or_else(|| VqError::unavailable(path, "no such in-memory clip"))?;
        self.open_handles.fetch_add(1, Ordering::SeqCst);
        debug!("Opened in-memory clip {} ({} frames)", path.display(), clip.frames.len());
        Ok(Box::new(MemorySource {
            path: Arc::from(path),
            fps: effective_frame_rate(Some(clip.fps), self.default_fps.unwrap_or(DEFAULT_FPS)),
            frames: Arc::clone(&clip.frames),
            position: 0,
            open_handles: Some(Arc::clone(&self.open_handles)),
        }))
    }
}

pub struct MemorySource {
    path: Arc<Path>,
    fps: f64,
    frames: Arc<Vec<Pixels>>,
    position: u64,
    open_handles: Option<Arc<AtomicUsize>>,
}

impl FrameSource for MemorySource {
    fn path(&self) -> &Path {
        &self.path
    }

    fn frame_rate(&self) -> f64 {
        self.fps
    }

    fn frame_count(&self) -> Option<u64> {
        Some(self.frames.len() as u64)
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.open_handles.is_none() {
            return Err(VqError::InvalidState(format!(
                "read from closed source {}",
                self.path.display()
            )));
        }
        let Some(pixels) = self.frames.get(self.position as usize) else {
            return Ok(None);
        };
        let frame = Frame {
            source: Arc::clone(&self.path),
            index: self.position,
            pixels: pixels.clone(),
        };
        self.position += 1;
        Ok(Some(frame))
    }

    fn rewind(&mut self) -> Result<()> {
        self.position = 0;
        Ok(())
    }

    fn close(&mut self) {
        if let Some(counter) = self.open_handles.take() {
            counter.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for MemorySource {
    fn drop(&mut self) {
        self.close();
    }
}
