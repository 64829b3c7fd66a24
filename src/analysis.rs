// src/analysis.rs

use crate::metrics::{MetricEngine, MetricSample};
use crate::session::{RatingRecord, TrialId};
use chrono::{DateTime, Local};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::thread;

/// Objective metric a model or correlation refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    Psnr,
    Ssim,
}

impl Metric {
    pub const ALL: [Metric; 2] = [Metric::Psnr, Metric::Ssim];

    pub fn label(self) -> &'static str {
        match self {
            Metric::Psnr => "PSNR",
            Metric::Ssim => "SSIM",
        }
    }

    pub fn unit(self) -> Option<&'static str> {
        match self {
            Metric::Psnr => Some("dB"),
            Metric::Ssim => None,
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    Linear,
    Quadratic,
}

// --- Correlation ---

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

fn has_variance(values: &[f64]) -> bool {
    values.windows(2).any(|w| w[0] != w[1])
}

/// Pearson's r, or 0.0 for fewer than two points or a constant series.
pub fn pearson(x: &[f64], y: &[f64]) -> f64 {
    if x.len() != y.len() || x.len() < 2 || !has_variance(x) || !has_variance(y) {
        return 0.0;
    }
    let (mx, my) = (mean(x), mean(y));
    let (mut sxy, mut sxx, mut syy) = (0.0, 0.0, 0.0);
    for (&a, &b) in x.iter().zip(y) {
        let (dx, dy) = (a - mx, b - my);
        sxy += dx * dy;
        sxx += dx * dx;
        syy += dy * dy;
    }
    let r = sxy / (sxx * syy).sqrt();
    if r.is_finite() { r.clamp(-1.0, 1.0) } else { 0.0 }
}

/// 1-based ranks, ties sharing their average rank.
pub fn rank(values: &[f64]) -> Vec<f64> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| values[a].partial_cmp(&values[b]).unwrap_or(Ordering::Equal));
    let mut ranks = vec![0.0; values.len()];
    let mut i = 0;
    while i < order.len() {
        let mut j = i;
        while j + 1 < order.len() && values[order[j + 1]] == values[order[i]] {
            j += 1;
        }
        let shared = (i + j) as f64 / 2.0 + 1.0;
        for &idx in &order[i..=j] {
            ranks[idx] = shared;
        }
        i = j + 1;
    }
    ranks
}

/// Spearman's rank correlation with the same degenerate-input guard as [`pearson`].
pub fn spearman(x: &[f64], y: &[f64]) -> f64 {
    if x.len() != y.len() || x.len() < 2 || !has_variance(x) || !has_variance(y) {
        return 0.0;
    }
    pearson(&rank(x), &rank(y))
}

// --- Regression ---

/// Ordinary least squares of `y` on `x`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LinearFit {
    pub slope: f64,
    pub intercept: f64,
    pub r_value: f64,
    pub r_squared: f64,
    pub p_value: f64,
    pub stderr: f64,
    /// True when the data could not support a fit and neutral values were used.
    pub degenerate: bool,
}

impl LinearFit {
    pub const NONE: LinearFit = LinearFit {
        slope: 0.0,
        intercept: 0.0,
        r_value: 0.0,
        r_squared: 0.0,
        p_value: 1.0,
        stderr: 0.0,
        degenerate: true,
    };

    pub fn predict(&self, x: f64) -> f64 {
        self.slope * x + self.intercept
    }
}

pub fn linear_regression(x: &[f64], y: &[f64]) -> LinearFit {
    let n = x.len();
    if n != y.len() || n < 2 || !has_variance(x) {
        debug!("Linear regression over {} points is degenerate", n);
        return LinearFit::NONE;
    }
    let (mx, my) = (mean(x), mean(y));
    let (mut sxy, mut sxx, mut syy) = (0.0, 0.0, 0.0);
    for (&a, &b) in x.iter().zip(y) {
        let (dx, dy) = (a - mx, b - my);
        sxy += dx * dy;
        sxx += dx * dx;
        syy += dy * dy;
    }
    let slope = sxy / sxx;
    let intercept = my - slope * mx;
    let r = if syy == 0.0 { 0.0 } else { (sxy / (sxx * syy).sqrt()).clamp(-1.0, 1.0) };

    let (p_value, stderr) = if n == 2 {
        (if y[0] == y[1] { 1.0 } else { 0.0 }, 0.0)
    } else {
        let df = (n - 2) as f64;
        let stderr = ((1.0 - r * r).max(0.0) * syy / sxx / df).sqrt();
        if r.abs() >= 1.0 {
            (0.0, stderr)
        } else {
            let t = r * (df / ((1.0 - r) * (1.0 + r))).sqrt();
            (student_t_two_sided(t, df), stderr)
        }
    };

    if !(slope.is_finite() && intercept.is_finite()) {
        return LinearFit::NONE;
    }
    LinearFit {
        slope,
        intercept,
        r_value: r,
        r_squared: r * r,
        p_value,
        stderr,
        degenerate: false,
    }
}

/// Least-squares parabola `a*x^2 + b*x + c`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuadraticFit {
    /// `[a, b, c]`, highest power first.
    pub coefficients: [f64; 3],
    pub r_squared: f64,
    /// True when the linear fit was used in place of a parabola.
    pub degenerate: bool,
}

impl QuadraticFit {
    pub fn predict(&self, x: f64) -> f64 {
        let [a, b, c] = self.coefficients;
        (a * x + b) * x + c
    }
}

/// Fits a parabola, falling back to `0*x^2 + slope*x + intercept` from
/// `linear` when fewer than three distinct x values are available or the
/// system is singular.
pub fn quadratic_regression(x: &[f64], y: &[f64], linear: &LinearFit) -> QuadraticFit {
    let fallback = |reason: &str| {
        debug!("Quadratic fit falls back to linear model: {}", reason);
        let coefficients = [0.0, linear.slope, linear.intercept];
        QuadraticFit {
            coefficients,
            r_squared: r_squared(x, y, |v| linear.predict(v)),
            degenerate: true,
        }
    };

    let n = x.len();
    if n != y.len() || n < 3 {
        return fallback("fewer than three points");
    }
    let mut distinct = x.to_vec();
    distinct.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
    distinct.dedup();
    if distinct.len() < 3 {
        return fallback("fewer than three distinct x values");
    }

    // Centre and scale x for a well-conditioned system.
    let m = mean(x);
    let s = (x.iter().map(|v| (v - m).powi(2)).sum::<f64>() / n as f64).sqrt();
    let t: Vec<f64> = x.iter().map(|v| (v - m) / s).collect();

    let mut sums = [0.0f64; 5];
    let mut rhs = [0.0f64; 3];
    for (&ti, &yi) in t.iter().zip(y) {
        let mut p = 1.0;
        for (k, slot) in sums.iter_mut().enumerate() {
            *slot += p;
            if k < 3 {
                rhs[k] += p * yi;
            }
            p *= ti;
        }
    }
    // Unknowns ordered [gamma, beta, alpha] for gamma + beta*t + alpha*t^2.
    let normal = [
        [sums[0], sums[1], sums[2]],
        [sums[1], sums[2], sums[3]],
        [sums[2], sums[3], sums[4]],
    ];
    let Some([gamma, beta, alpha]) = solve3(normal, rhs) else {
        return fallback("singular normal equations");
    };

    let a = alpha / (s * s);
    let b = beta / s - 2.0 * alpha * m / (s * s);
    let c = gamma - beta * m / s + alpha * m * m / (s * s);
    if !(a.is_finite() && b.is_finite() && c.is_finite()) {
        return fallback("non-finite coefficients");
    }
    let fit = QuadraticFit {
        coefficients: [a, b, c],
        r_squared: 0.0,
        degenerate: false,
    };
    QuadraticFit {
        r_squared: r_squared(x, y, |v| fit.predict(v)),
        ..fit
    }
}

/// Gaussian elimination with partial pivoting.
fn solve3(mut m: [[f64; 3]; 3], mut v: [f64; 3]) -> Option<[f64; 3]> {
    let scale = m.iter().flatten().fold(0.0f64, |acc, x| acc.max(x.abs()));
    if scale == 0.0 {
        return None;
    }
    for col in 0..3 {
        let pivot = (col..3).max_by(|&a, &b| m[a][col].abs().partial_cmp(&m[b][col].abs()).unwrap_or(Ordering::Equal))?;
        if m[pivot][col].abs() <= scale * 1e-12 {
            return None;
        }
        m.swap(col, pivot);
        v.swap(col, pivot);
        for row in (col + 1)..3 {
            let factor = m[row][col] / m[col][col];
            for k in col..3 {
                m[row][k] -= factor * m[col][k];
            }
            v[row] -= factor * v[col];
        }
    }
    let mut out = [0.0; 3];
    for row in (0..3).rev() {
        let tail: f64 = ((row + 1)..3).map(|k| m[row][k] * out[k]).sum();
        out[row] = (v[row] - tail) / m[row][row];
    }
    Some(out)
}

/// Coefficient of determination, 0.0 when `y` has no variance.
fn r_squared(x: &[f64], y: &[f64], predict: impl Fn(f64) -> f64) -> f64 {
    if y.len() < 2 || !has_variance(y) {
        return 0.0;
    }
    let my = mean(y);
    let ss_tot: f64 = y.iter().map(|v| (v - my).powi(2)).sum();
    let ss_res: f64 = x.iter().zip(y).map(|(&a, &b)| (b - predict(a)).powi(2)).sum();
    1.0 - ss_res / ss_tot
}

// --- Student's t distribution ---

/// Two-sided p-value of a t statistic with `df` degrees of freedom.
fn student_t_two_sided(t: f64, df: f64) -> f64 {
    if !t.is_finite() {
        return 0.0;
    }
    regularized_incomplete_beta(df / 2.0, 0.5, df / (df + t * t)).clamp(0.0, 1.0)
}

fn ln_gamma(x: f64) -> f64 {
    // Lanczos approximation, g = 7
    const COEFFS: [f64; 9] = [
        0.999_999_999_999_809_9,
        676.520_368_121_885_1,
        -1_259.139_216_722_402_8,
        771.323_428_777_653_1,
        -176.615_029_162_140_6,
        12.507_343_278_686_905,
        -0.138_571_095_265_720_12,
        9.984_369_578_019_572e-6,
        1.505_632_735_149_311_6e-7,
    ];
    if x < 0.5 {
        let pi = std::f64::consts::PI;
        return (pi / (pi * x).sin()).ln() - ln_gamma(1.0 - x);
    }
    let x = x - 1.0;
    let mut acc = COEFFS[0];
    for (i, c) in COEFFS.iter().enumerate().skip(1) {
        acc += c / (x + i as f64);
    }
    let t = x + 7.5;
    0.5 * (2.0 * std::f64::consts::PI).ln() + (x + 0.5) * t.ln() - t + acc.ln()
}

fn regularized_incomplete_beta(a: f64, b: f64, x: f64) -> f64 {
    if x <= 0.0 {
        return 0.0;
    }
    if x >= 1.0 {
        return 1.0;
    }
    let front = (ln_gamma(a + b) - ln_gamma(a) - ln_gamma(b) + a * x.ln() + b * (1.0 - x).ln()).exp();
    if x < (a + 1.0) / (a + b + 2.0) {
        front * beta_continued_fraction(a, b, x) / a
    } else {
        1.0 - front * beta_continued_fraction(b, a, 1.0 - x) / b
    }
}

/// Modified Lentz evaluation of the incomplete beta continued fraction.
fn beta_continued_fraction(a: f64, b: f64, x: f64) -> f64 {
    const MAX_ITER: usize = 300;
    const EPS: f64 = 1e-15;
    const TINY: f64 = 1e-300;

    let guard = |v: f64| if v.abs() < TINY { TINY } else { v };
    let (qab, qap, qam) = (a + b, a + 1.0, a - 1.0);
    let mut c = 1.0;
    let mut d = 1.0 / guard(1.0 - qab * x / qap);
    let mut h = d;
    for m in 1..=MAX_ITER {
        let m = m as f64;
        let m2 = 2.0 * m;
        let aa = m * (b - m) * x / ((qam + m2) * (a + m2));
        d = 1.0 / guard(1.0 + aa * d);
        c = guard(1.0 + aa / c);
        h *= d * c;
        let aa = -(a + m) * (qab + m) * x / ((a + m2) * (qap + m2));
        d = 1.0 / guard(1.0 + aa * d);
        c = guard(1.0 + aa / c);
        let delta = d * c;
        h *= delta;
        if (delta - 1.0).abs() < EPS {
            break;
        }
    }
    h
}

// --- Normalization ---

/// Rescales values linearly into [0, 10].
///
/// A constant series maps to the midpoint 5.0 everywhere.
pub fn normalize_to_ten(values: &[f64]) -> Vec<f64> {
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let span = max - min;
    values
        .iter()
        .map(|v| if span > 0.0 && span.is_finite() { (v - min) / span * 10.0 } else { 5.0 })
        .collect()
}

// --- Result bundle ---

/// One fitted model of rating as a function of a metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressionModel {
    pub metric: Metric,
    pub kind: ModelKind,
    /// Highest power first: `[slope, intercept]` or `[a, b, c]`.
    pub coefficients: Vec<f64>,
    pub r_squared: f64,
    /// Only reported for linear models.
    pub p_value: Option<f64>,
    pub pearson: f64,
    pub spearman: f64,
    pub degenerate: bool,
}

impl RegressionModel {
    pub fn predict(&self, x: f64) -> f64 {
        self.coefficients.iter().fold(0.0, |acc, c| acc * x + c)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Correlation {
    pub metric: Metric,
    pub pearson: f64,
    pub spearman: f64,
}

/// Subjective and objective scores of one trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialMetrics {
    pub trial_id: TrialId,
    pub distorted: PathBuf,
    pub presentation_index: usize,
    pub mos: f64,
    pub psnr: f64,
    pub ssim: f64,
    pub frames_compared: usize,
}

impl TrialMetrics {
    pub fn metric(&self, metric: Metric) -> f64 {
        match metric {
            Metric::Psnr => self.psnr,
            Metric::Ssim => self.ssim,
        }
    }
}

/// Everything analysis produces for a completed session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisReport {
    pub label: String,
    pub reference: PathBuf,
    pub generated_at: DateTime<Local>,
    /// In presentation order.
    pub trials: Vec<TrialMetrics>,
    pub correlations: Vec<Correlation>,
    pub models: Vec<RegressionModel>,
    pub psnr_normalized: Vec<f64>,
    /// SSIM scaled by 10 for comparison against ratings.
    pub ssim_scaled: Vec<f64>,
}

impl AnalysisReport {
    pub fn model(&self, metric: Metric, kind: ModelKind) -> Option<&RegressionModel> {
        self.models.iter().find(|m| m.metric == metric && m.kind == kind)
    }

    pub fn correlation(&self, metric: Metric) -> Option<&Correlation> {
        self.correlations.iter().find(|c| c.metric == metric)
    }

    pub fn ratings(&self) -> Vec<f64> {
        self.trials.iter().map(|t| t.mos).collect()
    }

    pub fn metric_values(&self, metric: Metric) -> Vec<f64> {
        self.trials.iter().map(|t| t.metric(metric)).collect()
    }
}

/// Joins ratings to metric samples by trial id and fits every model.
pub fn build_report(
    label: &str,
    reference: &Path,
    records: &[RatingRecord],
    samples: &[MetricSample],
) -> AnalysisReport {
    let by_id: HashMap<TrialId, &MetricSample> = samples.iter().map(|s| (s.trial_id, s)).collect();
    let trials: Vec<TrialMetrics> = records
        .iter()
        .filter_map(|record| {
            let Some(sample) = by_id.get(&record.trial_id) else {
                warn!("No metric sample for trial {} ({}), leaving it out", record.trial_id, record.distorted.display());
                return None;
            };
            Some(TrialMetrics {
                trial_id: record.trial_id,
                distorted: record.distorted.clone(),
                presentation_index: record.presentation_index,
                mos: record.score,
                psnr: sample.psnr,
                ssim: sample.ssim,
                frames_compared: sample.frames_compared,
            })
        })
        .collect();

    let ratings: Vec<f64> = trials.iter().map(|t| t.mos).collect();
    let mut correlations = Vec::new();
    let mut models = Vec::new();
    for metric in Metric::ALL {
        let values: Vec<f64> = trials.iter().map(|t| t.metric(metric)).collect();
        let pearson = pearson(&ratings, &values);
        let spearman = spearman(&ratings, &values);
        correlations.push(Correlation { metric, pearson, spearman });

        let linear = linear_regression(&values, &ratings);
        let quadratic = quadratic_regression(&values, &ratings, &linear);
        if linear.degenerate {
            warn!("{} -> rating linear fit is degenerate over {} trials, using neutral model", metric, trials.len());
        }
        info!(
            "{}: pearson {:.3}, spearman {:.3}, linear rating = {:.3} * x + {:.3} (R^2 {:.3}, p {:.4})",
            metric, pearson, spearman, linear.slope, linear.intercept, linear.r_squared, linear.p_value
        );
        models.push(RegressionModel {
            metric,
            kind: ModelKind::Linear,
            coefficients: vec![linear.slope, linear.intercept],
            r_squared: linear.r_squared,
            p_value: Some(linear.p_value),
            pearson,
            spearman,
            degenerate: linear.degenerate,
        });
        models.push(RegressionModel {
            metric,
            kind: ModelKind::Quadratic,
            coefficients: quadratic.coefficients.to_vec(),
            r_squared: quadratic.r_squared,
            p_value: None,
            pearson,
            spearman,
            degenerate: quadratic.degenerate,
        });
    }

    let psnr: Vec<f64> = trials.iter().map(|t| t.psnr).collect();
    AnalysisReport {
        label: label.to_string(),
        reference: reference.to_path_buf(),
        generated_at: Local::now(),
        psnr_normalized: normalize_to_ten(&psnr),
        ssim_scaled: trials.iter().map(|t| t.ssim * 10.0).collect(),
        trials,
        correlations,
        models,
    }
}

/// Measures every rated trial against the reference and builds the report.
///
/// Trials are measured on up to `workers` threads; each pass opens its own
/// decoders, so trials share no state.
pub fn analyze(
    label: &str,
    reference: &Path,
    records: &[RatingRecord],
    engine: &MetricEngine<'_>,
    workers: usize,
) -> AnalysisReport {
    info!("Computing objective metrics for {} trials on {} workers...", records.len(), workers.max(1));
    let samples = measure_all(reference, records, engine, workers);
    build_report(label, reference, records, &samples)
}

fn measure_all(
    reference: &Path,
    records: &[RatingRecord],
    engine: &MetricEngine<'_>,
    workers: usize,
) -> Vec<MetricSample> {
    if records.is_empty() {
        return Vec::new();
    }
    let chunk = records.len().div_ceil(workers.max(1));
    thread::scope(|scope| {
        let handles: Vec<_> = records
            .chunks(chunk)
            .map(|batch| {
                scope.spawn(move || {
                    batch
                        .iter()
                        .map(|r| engine.measure(r.trial_id, reference, &r.distorted))
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        handles
            .into_iter()
            .zip(records.chunks(chunk))
            .flat_map(|(handle, batch)| match handle.join() {
                Ok(samples) => samples,
                Err(_) => {
                    warn!("Metric worker panicked, scoring {} trials as 0", batch.len());
                    batch
                        .iter()
                        .map(|r| MetricSample {
                            trial_id: r.trial_id,
                            distorted: r.distorted.clone(),
                            psnr: 0.0,
                            ssim: 0.0,
                            frames_compared: 0,
                            psnr_stats: None,
                            ssim_stats: None,
                        })
                        .collect()
                }
            })
            .collect()
    })
}
