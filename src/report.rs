// src/report.rs

use crate::analysis::{AnalysisReport, Metric, ModelKind, RegressionModel};
use crate::config::RatingScale;
use crate::error::{Result, VqError};
use crate::plot;
use crate::session::{RatingRecord, Session};
use chrono::{DateTime, Local};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};

pub const RESULTS_PREFIX: &str = "results";
pub const ANALYSIS_PREFIX: &str = "analysis";
pub const FIGURES_PREFIX: &str = "figures";
/// Same layout as the log file name, so a run's files sort together.
pub const STAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Saved outcome of a session: enough to rerun the analysis later.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionResults {
    pub label: String,
    pub reference: PathBuf,
    pub rating_scale: RatingScale,
    pub saved_at: DateTime<Local>,
    pub records: Vec<RatingRecord>,
}

impl SessionResults {
    pub fn from_session(session: &Session) -> Self {
        Self {
            label: session.label().to_string(),
            reference: session.reference().to_path_buf(),
            rating_scale: session.scale(),
            saved_at: Local::now(),
            records: session.export(),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        info!("Loading session results from {}", path.display());
        let content = fs::read_to_string(path)?;
        let results: SessionResults = serde_json::from_str(&content)?;
        if results.records.is_empty() {
            return Err(VqError::Input(format!("{} holds no ratings", path.display())));
        }
        Ok(results)
    }
}

/// Files written for one session.
#[derive(Debug, Clone, Default)]
pub struct ReportPaths {
    pub dir: PathBuf,
    /// Suffix shared by every file of this write, e.g. `20240105_143000`.
    pub stamp: String,
    pub results: Option<PathBuf>,
    pub analysis_json: Option<PathBuf>,
    pub analysis_md: Option<PathBuf>,
    pub figures: Vec<PathBuf>,
}

/// Turns a free-form session label into a single safe path component.
pub fn sanitize_label(label: &str) -> String {
    let cleaned: String = label
        .trim()
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    let cleaned = cleaned.trim_matches('_');
    if cleaned.is_empty() { "session".to_string() } else { cleaned.to_string() }
}

/// Directory a session's outputs go to, created if missing.
pub fn session_dir(output_dir: &Path, label: &str) -> Result<PathBuf> {
    let dir = output_dir.join(sanitize_label(label));
    if !dir.exists() {
        info!("Creating output directory: {}", dir.display());
        fs::create_dir_all(&dir)?;
    }
    Ok(dir)
}

fn results_path(dir: &Path, stamp: &str) -> PathBuf {
    dir.join(format!("{}_{}.json", RESULTS_PREFIX, stamp))
}

fn analysis_json_path(dir: &Path, stamp: &str) -> PathBuf {
    dir.join(format!("{}_{}.json", ANALYSIS_PREFIX, stamp))
}

fn analysis_md_path(dir: &Path, stamp: &str) -> PathBuf {
    dir.join(format!("{}_{}.md", ANALYSIS_PREFIX, stamp))
}

/// Name of the chart directory belonging to `stamp`, relative to the session dir.
pub fn figures_dir_name(stamp: &str) -> String {
    format!("{}_{}", FIGURES_PREFIX, stamp)
}

/// Picks a stamp from `now` that no existing file in `dir` uses yet.
///
/// Runs saved within the same second get `_2`, `_3`, ... appended.
pub fn unused_stamp(dir: &Path, now: DateTime<Local>) -> String {
    let base = now.format(STAMP_FORMAT).to_string();
    let taken = |stamp: &str| {
        results_path(dir, stamp).exists()
            || analysis_json_path(dir, stamp).exists()
            || analysis_md_path(dir, stamp).exists()
            || dir.join(figures_dir_name(stamp)).exists()
    };
    if !taken(&base) {
        return base;
    }
    let mut n = 2u32;
    loop {
        let stamp = format!("{}_{}", base, n);
        if !taken(&stamp) {
            return stamp;
        }
        n += 1;
    }
}

fn write_new(path: &Path, content: &str) -> Result<()> {
    let mut file = fs::OpenOptions::new().write(true).create_new(true).open(path)?;
    file.write_all(content.as_bytes())?;
    Ok(())
}

/// Writes `results_<stamp>.json`. Never replaces an existing file.
pub fn write_results(dir: &Path, stamp: &str, results: &SessionResults) -> Result<PathBuf> {
    let path = results_path(dir, stamp);
    write_new(&path, &serde_json::to_string_pretty(results)?)?;
    info!("Wrote {} ratings to {}", results.records.len(), path.display());
    Ok(path)
}

pub fn write_analysis_json(dir: &Path, stamp: &str, report: &AnalysisReport) -> Result<PathBuf> {
    let path = analysis_json_path(dir, stamp);
    write_new(&path, &serde_json::to_string_pretty(report)?)?;
    info!("Wrote analysis data to {}", path.display());
    Ok(path)
}

pub fn write_markdown(dir: &Path, stamp: &str, report: &AnalysisReport) -> Result<PathBuf> {
    let path = analysis_md_path(dir, stamp);
    write_new(&path, &render_markdown(report, &figures_dir_name(stamp)))?;
    info!("Wrote analysis summary to {}", path.display());
    Ok(path)
}

/// Writes the data files for a session: ratings, plus the analysis when present.
///
/// Every call gets its own timestamped file names, so sessions sharing a
/// label never overwrite each other.
pub fn write_all(output_dir: &Path, results: &SessionResults, report: Option<&AnalysisReport>) -> Result<ReportPaths> {
    let dir = session_dir(output_dir, &results.label)?;
    let stamp = unused_stamp(&dir, Local::now());
    let mut paths = ReportPaths {
        results: Some(write_results(&dir, &stamp, results)?),
        ..ReportPaths::default()
    };
    if let Some(report) = report {
        paths.analysis_json = Some(write_analysis_json(&dir, &stamp, report)?);
        paths.analysis_md = Some(write_markdown(&dir, &stamp, report)?);
    }
    paths.dir = dir;
    paths.stamp = stamp;
    Ok(paths)
}

/// Renders the charts into `<dir>/figures_<stamp>`, the directory the
/// Markdown summary of the same stamp links to.
///
/// Chart failures are logged and yield no files; the data files stay valid.
pub fn write_charts(dir: &Path, stamp: &str, report: &AnalysisReport) -> Vec<PathBuf> {
    let figures = dir.join(figures_dir_name(stamp));
    if let Err(e) = fs::create_dir_all(&figures) {
        warn!("Cannot create {}: {}", figures.display(), e);
        return Vec::new();
    }
    match plot::generate_all(report, &figures) {
        Ok(files) => files,
        Err(e) => {
            warn!("Skipping charts: {}", e);
            Vec::new()
        }
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn equation(model: &RegressionModel) -> String {
    let x = model.metric.label();
    match (model.kind, model.coefficients.as_slice()) {
        (ModelKind::Linear, [slope, intercept]) => {
            format!("MOS = {:.3} × {} + {:.3}", slope, x, intercept)
        }
        (ModelKind::Quadratic, [a, b, c]) => {
            format!("MOS = {:.3} × {}² + {:.3} × {} + {:.3}", a, x, b, x, c)
        }
        _ => format!("MOS = {:?}", model.coefficients),
    }
}

/// Markdown summary: metrics table, correlations and fitted models.
/// Charts are linked from `figures_dir`, relative to the summary.
pub fn render_markdown(report: &AnalysisReport, figures_dir: &str) -> String {
    let mut md = String::new();
    // Writing to a String cannot fail.
    let _ = writeln!(md, "# Video Quality Analysis\n");
    let _ = writeln!(md, "**Session:** {}\n", report.label);
    let _ = writeln!(md, "**Reference:** {}\n", file_name(&report.reference));
    let _ = writeln!(md, "**Date:** {}\n", report.generated_at.format("%Y-%m-%d %H:%M:%S"));
    let _ = writeln!(md, "---\n");

    let _ = writeln!(md, "## Objective and Subjective Scores\n");
    let _ = writeln!(md, "| Video | Shown | MOS | PSNR (dB) | SSIM | Frames |");
    let _ = writeln!(md, "|-------|-------|-----|-----------|------|--------|");
    for t in &report.trials {
        let _ = writeln!(
            md,
            "| {} | {} | {:.1} | {:.2} | {:.3} | {} |",
            file_name(&t.distorted),
            t.presentation_index + 1,
            t.mos,
            t.psnr,
            t.ssim,
            t.frames_compared
        );
    }
    let _ = writeln!(md);

    let _ = writeln!(md, "## Correlations\n");
    let _ = writeln!(md, "| Metric | Pearson | Spearman |");
    let _ = writeln!(md, "|--------|---------|----------|");
    for c in &report.correlations {
        let _ = writeln!(md, "| {} | {:.3} | {:.3} |", c.metric, c.pearson, c.spearman);
    }
    let _ = writeln!(md);

    let _ = writeln!(md, "## Regression Models\n");
    for metric in Metric::ALL {
        let _ = writeln!(md, "### {} → MOS\n", metric);
        if let Some(linear) = report.model(metric, ModelKind::Linear) {
            let _ = writeln!(md, "- **Linear:** {}", equation(linear));
            let _ = writeln!(md, "- **R² (linear):** {:.3}", linear.r_squared);
            if let Some(p) = linear.p_value {
                let _ = writeln!(md, "- **p-value:** {:.4}", p);
            }
        }
        if let Some(quad) = report.model(metric, ModelKind::Quadratic) {
            let _ = writeln!(md, "- **Quadratic:** {}", equation(quad));
            let _ = writeln!(md, "- **R² (quadratic):** {:.3}", quad.r_squared);
        }
        if report.models.iter().any(|m| m.metric == metric && m.degenerate) {
            let _ = writeln!(md, "- _Too few or constant data points; neutral fallback model shown._");
        }
        let _ = writeln!(md);
    }

    let _ = writeln!(md, "## Charts\n");
    for (title, file) in plot::CHARTS {
        let _ = writeln!(md, "![{}]({}/{})\n", title, figures_dir, file);
    }
    md
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::build_report;
    use crate::metrics::MetricSample;
    use crate::session::TrialId;

    fn record(id: usize, name: &str, shown: usize, score: f64) -> RatingRecord {
        RatingRecord {
            trial_id: TrialId(id),
            distorted: PathBuf::from(format!("/videos/{}", name)),
            presentation_index: shown,
            score,
            timestamp: Local::now(),
        }
    }

    fn sample(id: usize, name: &str, psnr: f64, ssim: f64) -> MetricSample {
        MetricSample {
            trial_id: TrialId(id),
            distorted: PathBuf::from(format!("/videos/{}", name)),
            psnr,
            ssim,
            frames_compared: 100,
            psnr_stats: None,
            ssim_stats: None,
        }
    }

    fn results() -> SessionResults {
        SessionResults {
            label: "Panel #1 / evening".to_string(),
            reference: PathBuf::from("/videos/ref.mp4"),
            rating_scale: RatingScale::Discrete,
            saved_at: Local::now(),
            records: vec![
                record(1, "b.mp4", 0, 7.0),
                record(0, "a.mp4", 1, 4.0),
                record(2, "c.mp4", 2, 9.0),
            ],
        }
    }

    fn report(results: &SessionResults) -> AnalysisReport {
        let samples = [
            sample(0, "a.mp4", 28.0, 0.80),
            sample(1, "b.mp4", 33.0, 0.90),
            sample(2, "c.mp4", 41.0, 0.97),
        ];
        build_report(&results.label, &results.reference, &results.records, &samples)
    }

    #[test]
    fn sanitizes_labels() {
        assert_eq!(sanitize_label("Panel #1 / evening"), "Panel__1___evening");
        assert_eq!(sanitize_label("  ../..  "), "session");
        assert_eq!(sanitize_label("run-2_b"), "run-2_b");
    }

    #[test]
    fn markdown_lists_every_trial_and_model() {
        let results = results();
        let md = render_markdown(&report(&results), "figures_20240105_143000");
        assert!(md.contains("| b.mp4 | 1 | 7.0 | 33.00 | 0.900 | 100 |"));
        assert!(md.contains("| a.mp4 | 2 | 4.0 | 28.00 | 0.800 | 100 |"));
        assert!(md.contains("### PSNR → MOS"));
        assert!(md.contains("### SSIM → MOS"));
        assert!(md.contains("- **Quadratic:** MOS = "));
        assert!(md.contains("](figures_20240105_143000/psnr_vs_mos.png)"));
        assert!(!md.contains("neutral fallback"));
    }

    #[test]
    fn results_survive_a_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let results = results();
        let session = session_dir(dir.path(), &results.label).unwrap();
        assert!(session.ends_with("Panel__1___evening"));

        let path = write_results(&session, "20240105_143000", &results).unwrap();
        assert!(path.ends_with("results_20240105_143000.json"));
        let loaded = SessionResults::load(&path).unwrap();
        assert_eq!(loaded.records, results.records);
        assert_eq!(loaded.label, results.label);
    }

    #[test]
    fn empty_results_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let results = SessionResults {
            records: Vec::new(),
            ..results()
        };
        let path = write_results(dir.path(), "20240105_143000", &results).unwrap();
        assert!(matches!(SessionResults::load(&path), Err(VqError::Input(_))));
    }

    #[test]
    fn write_all_writes_data_files() {
        let dir = tempfile::tempdir().unwrap();
        let results = results();
        let report = report(&results);
        let paths = write_all(dir.path(), &results, Some(&report)).unwrap();

        assert!(paths.results.unwrap().is_file());
        assert!(paths.analysis_md.unwrap().is_file());
        let json = fs::read_to_string(paths.analysis_json.unwrap()).unwrap();
        let parsed: AnalysisReport = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.trials, report.trials);
    }

    #[test]
    fn repeated_label_keeps_earlier_results() {
        let dir = tempfile::tempdir().unwrap();
        let first = SessionResults {
            label: "panel".to_string(),
            records: vec![record(0, "a.mp4", 0, 2.0)],
            ..results()
        };
        let second = SessionResults {
            records: vec![record(0, "a.mp4", 0, 9.0)],
            ..first.clone()
        };

        let first_paths = write_all(dir.path(), &first, None).unwrap();
        let second_paths = write_all(dir.path(), &second, None).unwrap();
        let first_file = first_paths.results.unwrap();
        let second_file = second_paths.results.unwrap();
        assert_ne!(first_file, second_file);
        assert_ne!(first_paths.stamp, second_paths.stamp);

        let saved = fs::read_dir(&first_paths.dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(RESULTS_PREFIX))
            .count();
        assert_eq!(saved, 2);
        assert_eq!(SessionResults::load(&first_file).unwrap().records[0].score, 2.0);
        assert_eq!(SessionResults::load(&second_file).unwrap().records[0].score, 9.0);
    }

    #[test]
    fn stamps_skip_names_already_in_use() {
        let dir = tempfile::tempdir().unwrap();
        let now = Local::now();
        let base = now.format(STAMP_FORMAT).to_string();
        assert_eq!(unused_stamp(dir.path(), now), base);

        fs::write(dir.path().join(format!("results_{}.json", base)), "{}").unwrap();
        assert_eq!(unused_stamp(dir.path(), now), format!("{}_2", base));
        fs::create_dir(dir.path().join(figures_dir_name(&format!("{}_2", base)))).unwrap();
        assert_eq!(unused_stamp(dir.path(), now), format!("{}_3", base));
    }

    #[test]
    fn existing_results_file_is_never_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let results = results();
        write_results(dir.path(), "20240105_143000", &results).unwrap();
        assert!(matches!(
            write_results(dir.path(), "20240105_143000", &results),
            Err(VqError::Io(_))
        ));
    }
}
