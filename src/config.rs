// src/config.rs

use crate::error::{Result, VqError};
use log::{debug, info};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

/// Frame rate assumed when a stream reports none (or a non-positive one).
pub const DEFAULT_FPS: f64 = 30.0;

/// Number of frame pairs the metric passes look at per trial.
///
/// This bounds analysis latency on long clips. It trades accuracy for speed:
/// only the leading frames of each video contribute to the trial's score.
pub const DEFAULT_FRAME_CAP: usize = 100;

static CANVAS_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(?P<w>\d+)\s*[xX]\s*(?P<h>\d+)\s*$").expect("Invalid canvas size Regex")
});

/// Fixed presentation area each video is letterboxed into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanvasSize {
    pub width: u32,
    pub height: u32,
}

impl CanvasSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl Default for CanvasSize {
    fn default() -> Self {
        Self::new(500, 400)
    }
}

impl fmt::Display for CanvasSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl FromStr for CanvasSize {
    type Err = VqError;

    fn from_str(s: &str) -> Result<Self> {
        let caps = CANVAS_REGEX
            .captures(s)
            .ok_or_else(|| VqError::Parse(format!("Invalid canvas size '{}', expected WxH", s)))?;
        let parse = |name: &str| -> Result<u32> {
            caps[name]
                .parse::<u32>()
                .map_err(|_| VqError::Parse(format!("Invalid canvas dimension in '{}'", s)))
        };
        let (width, height) = (parse("w")?, parse("h")?);
        if width == 0 || height == 0 {
            return Err(VqError::Parse(format!("Canvas dimensions must be positive: '{}'", s)));
        }
        Ok(Self::new(width, height))
    }
}

/// How ratings are captured: integral buttons or a continuous slider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RatingScale {
    #[default]
    Discrete,
    Continuous,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub canvas: CanvasSize,
    pub frame_cap: usize,
    pub default_fps: f64,
    pub autoplay: bool,
    pub rating_scale: RatingScale,
    pub workers: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            canvas: CanvasSize::default(),
            frame_cap: DEFAULT_FRAME_CAP,
            default_fps: DEFAULT_FPS,
            autoplay: false,
            rating_scale: RatingScale::Discrete,
            workers: num_cpus::get(),
        }
    }
}

impl Config {
    /// Loads a JSON config file. Missing fields keep their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        info!("Loading configuration from {}", path.display());
        let content = fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        debug!("Loaded configuration: {:?}", config);
        config.validated()
    }

    pub fn validated(self) -> Result<Self> {
        if self.frame_cap == 0 {
            return Err(VqError::Input("frame_cap must be at least 1".to_string()));
        }
        if self.canvas.width == 0 || self.canvas.height == 0 {
            return Err(VqError::Input(format!("Invalid canvas size {}", self.canvas)));
        }
        if !(self.default_fps.is_finite() && self.default_fps > 0.0) {
            return Err(VqError::Input(format!("Invalid default_fps {}", self.default_fps)));
        }
        Ok(Self {
            workers: self.workers.max(1),
            ..self
        })
    }
}
