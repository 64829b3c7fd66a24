// src/main.rs

use chrono::Local;
use log::{LevelFilter, error, info, warn};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::fs;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;
use vqlab::analysis;
use vqlab::cli::{self, AnalyzeArgs, CliArgs, Command, MeasureArgs, RunArgs};
use vqlab::config::Config;
use vqlab::error::{Result, VqError};
use vqlab::experiment::Experiment;
use vqlab::ffmpeg::FfmpegOpener;
use vqlab::metrics::{MetricEngine, MetricStats};
use vqlab::playback::LatestFrameSlot;
use vqlab::report::{self, ReportPaths, SessionResults};
use vqlab::session::{Progress, SessionSetup, TrialId};

fn main() -> ExitCode {
    let start_time = Instant::now();
    let args = cli::parse_args();

    if let Err(e) = setup_logging(args.log, args.output_dir.as_deref()) {
        eprintln!("Error setting up logging: {}", e);
        return ExitCode::FAILURE;
    }

    info!("Starting vqlab...");
    info!("Arguments: {:?}", args);

    match run(args) {
        Ok(()) => {
            info!("Finished in {:.2?}", start_time.elapsed());
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Failed after {:.2?}: {}", start_time.elapsed(), e);
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

/// Sets up logging to console and optionally to a file.
fn setup_logging(log_to_file: bool, output_dir: Option<&Path>) -> std::result::Result<(), fern::InitError> {
    let base_config = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{} {} {}] {}",
                Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(LevelFilter::Info)
        .level_for("vqlab", LevelFilter::Debug);

    // The console driver reads ratings from stdin, so logs go to stderr.
    let mut logger = base_config.chain(fern::Dispatch::new().chain(io::stderr()));

    let mut log_path = None;
    if log_to_file {
        let dir = output_dir.map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        if !dir.exists() {
            fs::create_dir_all(&dir)?;
        }
        let path = dir.join(format!("vqlab_{}.log", Local::now().format("%Y%m%d_%H%M%S")));
        logger = logger.chain(fern::Dispatch::new().chain(fern::log_file(&path)?));
        log_path = Some(path);
    }

    logger.apply()?;
    if let Some(path) = log_path {
        info!("Logging to file: {}", path.display());
    }
    Ok(())
}

fn load_config(args: &CliArgs) -> Result<Config> {
    match &args.config {
        Some(path) => Config::load(path),
        None => Ok(Config::default()),
    }
}

fn output_dir(args: &CliArgs) -> PathBuf {
    args.output_dir.clone().unwrap_or_else(|| PathBuf::from("."))
}

fn run(args: CliArgs) -> Result<()> {
    let config = load_config(&args)?;
    let output_dir = output_dir(&args);
    match &args.command {
        Command::Run(run) => run_session(run, config, &output_dir),
        Command::Analyze(analyze) => analyze_results(analyze, config, &output_dir),
        Command::Measure(measure) => measure_pair(measure, config),
    }
}

fn run_session(args: &RunArgs, config: Config, output_dir: &Path) -> Result<()> {
    let config = Config {
        canvas: args.canvas.unwrap_or(config.canvas),
        frame_cap: args.frame_cap.unwrap_or(config.frame_cap),
        autoplay: args.autoplay || config.autoplay,
        rating_scale: args.scale.unwrap_or(config.rating_scale),
        ..config
    }
    .validated()?;

    let mut rng = match args.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let session = SessionSetup::new()
        .label(args.name.clone())
        .reference(&args.reference)
        .distorted_all(&args.distorted)
        .scale(config.rating_scale)
        .start(&mut rng)?;

    let opener = Arc::new(FfmpegOpener::new(config.default_fps));
    let slot = Arc::new(LatestFrameSlot::new());
    let mut experiment = Experiment::new(session, opener, slot.clone(), config);

    let completed = drive_console(&mut experiment, &slot)?;
    let (session, report) = experiment.finish();
    let results = SessionResults::from_session(&session);
    if !completed {
        warn!(
            "Session aborted after {} of {} trials, saving partial results without analysis",
            session.position(),
            session.trials().len()
        );
    }
    let mut paths = report::write_all(output_dir, &results, report.as_ref())?;
    if let Some(report) = &report {
        paths.figures = report::write_charts(&paths.dir, &paths.stamp, report);
    }
    print_paths(&paths);
    Ok(())
}

/// Runs the interactive trial loop. Returns false if the user quit early.
fn drive_console(experiment: &mut Experiment, slot: &LatestFrameSlot) -> Result<bool> {
    let scale = experiment.session().scale();
    println!("Commands: p = play/pause, r = restart, s = status, 0-10 = submit rating ({:?} scale), q = quit", scale);

    let mut lines = io::stdin().lock().lines();
    open_current(experiment);
    loop {
        if slot.take_ended() {
            println!("Playback reached the end and was rewound; press p to watch again.");
        }
        print!("> ");
        io::stdout().flush()?;
        let Some(line) = lines.next() else {
            return Ok(false);
        };
        let line = line?;
        match line.trim() {
            "" => {}
            "q" => return Ok(false),
            "p" => match experiment.toggle_playback() {
                Ok(true) => println!("Playing"),
                Ok(false) => println!("Paused"),
                Err(e) => println!("{}", e),
            },
            "r" => {
                if let Err(e) = experiment.restart_playback() {
                    println!("{}", e);
                }
            }
            "s" => print_status(experiment, slot),
            input => {
                let Ok(score) = input.parse::<f64>() else {
                    println!("Unknown command '{}'", input);
                    continue;
                };
                match experiment.submit_rating(score) {
                    Ok(Progress::Next(_)) => open_current(experiment),
                    Ok(Progress::Complete) => {
                        println!("All trials rated.");
                        return Ok(true);
                    }
                    Err(e @ VqError::OutOfRange { .. }) => println!("{}", e),
                    Err(e) => return Err(e),
                }
            }
        }
    }
}

fn open_current(experiment: &mut Experiment) {
    let total = experiment.session().trials().len();
    match experiment.open_trial() {
        Ok(trial) => println!("Trial {}/{}", trial.presentation_index + 1, total),
        Err(e) => {
            error!("{}", e);
            println!("This trial cannot be played; rate it anyway or press q to quit.");
        }
    }
}

fn print_status(experiment: &Experiment, slot: &LatestFrameSlot) {
    let session = experiment.session();
    println!("Trial {}/{}", session.position() + 1, session.trials().len());
    let Some(sync) = experiment.playback() else {
        println!("No playback");
        return;
    };
    let (reference, distorted) = sync.positions();
    println!(
        "{} at {:.3} fps, frame {} / {}, {} pairs shown, {} dropped",
        if sync.is_playing() { "Playing" } else { "Paused" },
        sync.shared_rate(),
        reference,
        distorted,
        sync.presented_frames(),
        slot.overwritten()
    );
    if let Some(pair) = slot.take() {
        println!("Latest pair #{} ({}x{})", pair.sequence, pair.reference.width(), pair.reference.height());
    }
    if let Some(e) = sync.last_error() {
        println!("Last decode error: {}", e);
    }
}

fn analyze_results(args: &AnalyzeArgs, config: Config, output_dir: &Path) -> Result<()> {
    let results = SessionResults::load(&args.results)?;
    let frame_cap = args.frame_cap.unwrap_or(config.frame_cap);
    let opener = FfmpegOpener::new(config.default_fps);
    let engine = MetricEngine::new(&opener).with_frame_cap(frame_cap);
    let report = analysis::analyze(&results.label, &results.reference, &results.records, &engine, config.workers);
    let mut paths = report::write_all(output_dir, &results, Some(&report))?;
    paths.figures = report::write_charts(&paths.dir, &paths.stamp, &report);
    print_paths(&paths);
    Ok(())
}

fn measure_pair(args: &MeasureArgs, config: Config) -> Result<()> {
    let opener = FfmpegOpener::new(config.default_fps);
    let engine = MetricEngine::new(&opener).with_frame_cap(args.frame_cap.unwrap_or(config.frame_cap));
    let sample = engine.measure(TrialId(0), &args.reference, &args.distorted);
    if sample.frames_compared == 0 {
        return Err(VqError::Input(format!(
            "No frames could be compared between {} and {}",
            args.reference.display(),
            args.distorted.display()
        )));
    }
    println!("Frames compared: {}", sample.frames_compared);
    println!("PSNR: {:.2} dB", sample.psnr);
    print_stats(sample.psnr_stats.as_ref());
    println!("SSIM: {:.4}", sample.ssim);
    print_stats(sample.ssim_stats.as_ref());
    Ok(())
}

fn print_stats(stats: Option<&MetricStats>) {
    if let Some(s) = stats {
        println!(
            "  min {:.4}  1% {:.4}  25% {:.4}  mean {:.4}  75% {:.4}  max {:.4}",
            s.min, s.p1, s.p25, s.mean, s.p75, s.max
        );
    }
}

fn print_paths(paths: &ReportPaths) {
    println!("Results saved to {}:", paths.dir.display());
    for path in [&paths.results, &paths.analysis_json, &paths.analysis_md].into_iter().flatten() {
        println!("  {}", path.display());
    }
    for path in &paths.figures {
        println!("  {}", path.display());
    }
}
