// src/cli.rs

use crate::config::{CanvasSize, RatingScale};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about = "Subjective video quality experiments with PSNR/SSIM analysis", long_about = None)]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Command,

    /// JSON configuration file; command-line flags override its values
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Directory for results, reports and charts (default: current directory)
    #[arg(long, global = true, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Enable logging to file (e.g., vqlab_YYYYMMDD_HHMMSS.log)
    #[arg(long, global = true)]
    pub log: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run an interactive rating session on the console
    Run(RunArgs),
    /// Recompute the analysis from a saved results_<stamp>.json
    Analyze(AnalyzeArgs),
    /// Print PSNR and SSIM for one reference/distorted pair
    Measure(MeasureArgs),
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Session label, also used as the output folder name
    #[arg(long)]
    pub name: String,

    /// Original/reference video file
    #[arg(long, required = true)]
    pub reference: PathBuf,

    /// Distorted video files to rate (repeat or separate with spaces)
    #[arg(long, required = true, num_args = 1..)]
    pub distorted: Vec<PathBuf>,

    /// Seed for the presentation order shuffle (default: random)
    #[arg(long)]
    pub seed: Option<u64>,

    /// Presentation canvas size, e.g. 640x360
    #[arg(long, value_name = "WxH")]
    pub canvas: Option<CanvasSize>,

    /// Maximum frame pairs compared per trial
    #[arg(long)]
    pub frame_cap: Option<usize>,

    /// Start each trial playing instead of paused
    #[arg(long)]
    pub autoplay: bool,

    /// Rating scale
    #[arg(long, value_enum)]
    pub scale: Option<RatingScale>,
}

#[derive(Args, Debug)]
pub struct AnalyzeArgs {
    /// results_<stamp>.json written by a previous session
    #[arg(long, value_name = "FILE")]
    pub results: PathBuf,

    /// Maximum frame pairs compared per trial
    #[arg(long)]
    pub frame_cap: Option<usize>,
}

#[derive(Args, Debug)]
pub struct MeasureArgs {
    /// Original/reference video file
    #[arg(required = true)]
    pub reference: PathBuf,

    /// Encoded/processed video file to compare
    #[arg(required = true)]
    pub distorted: PathBuf,

    /// Maximum frame pairs compared
    #[arg(long)]
    pub frame_cap: Option<usize>,
}

pub fn parse_args() -> CliArgs {
    CliArgs::parse()
}
