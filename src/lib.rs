// src/lib.rs

pub mod analysis;
pub mod canvas;
pub mod cli;
pub mod config;
pub mod error;
pub mod experiment;
pub mod ffmpeg;
pub mod metrics;
pub mod playback;
pub mod plot;
pub mod report;
pub mod session;
pub mod source;
