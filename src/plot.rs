// src/plot.rs

use crate::analysis::{AnalysisReport, Metric, ModelKind, RegressionModel};
use crate::error::{Result, VqError};
use crate::session::{MAX_SCORE, MIN_SCORE};
use log::{debug, info};
use plotters::prelude::*;
use plotters::style::full_palette::{GREEN, ORANGE};
use std::fmt::Debug;
use std::path::{Path, PathBuf};

/// Chart titles and file names, in the order they are generated.
pub const CHARTS: [(&str, &str); 3] = [
    ("PSNR vs MOS", "psnr_vs_mos.png"),
    ("SSIM vs MOS", "ssim_vs_mos.png"),
    ("MOS vs normalized PSNR", "mos_vs_psnr_comparison.png"),
];

const CHART_SIZE: (u32, u32) = (1280, 720);
const CURVE_SAMPLES: usize = 100;

fn plot_err<E: Debug>(what: &'static str) -> impl FnOnce(E) -> VqError {
    move |e| VqError::Plot(format!("Failed to {}: {:?}", what, e))
}

/// Renders every chart into `dir` and returns the written files.
pub fn generate_all(report: &AnalysisReport, dir: &Path) -> Result<Vec<PathBuf>> {
    if report.trials.is_empty() {
        return Err(VqError::Plot("no trials to plot".to_string()));
    }
    let psnr = dir.join(CHARTS[0].1);
    let ssim = dir.join(CHARTS[1].1);
    let comparison = dir.join(CHARTS[2].1);
    metric_vs_mos(report, Metric::Psnr, &psnr)?;
    metric_vs_mos(report, Metric::Ssim, &ssim)?;
    mos_vs_psnr_comparison(report, &comparison)?;
    Ok(vec![psnr, ssim, comparison])
}

/// Padded axis range covering `values`, never empty.
fn axis_range(values: &[f64]) -> (f64, f64) {
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !(min.is_finite() && max.is_finite()) {
        return (0.0, 1.0);
    }
    let span = max - min;
    let pad = if span > 0.0 { span * 0.08 } else { min.abs().max(1.0) * 0.1 };
    (min - pad, max + pad)
}

fn curve_points(model: &RegressionModel, lo: f64, hi: f64) -> Vec<(f64, f64)> {
    (0..=CURVE_SAMPLES)
        .map(|i| {
            let x = lo + (hi - lo) * i as f64 / CURVE_SAMPLES as f64;
            (x, model.predict(x))
        })
        .collect()
}

/// Scatter of rating against one metric with the fitted linear and
/// quadratic curves.
pub fn metric_vs_mos(report: &AnalysisReport, metric: Metric, output_path: &Path) -> Result<()> {
    info!("Generating {} vs MOS chart: {}", metric, output_path.display());
    let points: Vec<(f64, f64)> = report.trials.iter().map(|t| (t.metric(metric), t.mos)).collect();
    let xs: Vec<f64> = points.iter().map(|(x, _)| *x).collect();
    let (x_min, x_max) = axis_range(&xs);
    let pearson = report.correlation(metric).map_or(0.0, |c| c.pearson);

    let root = BitMapBackend::new(output_path, CHART_SIZE).into_drawing_area();
    root.fill(&WHITE).map_err(plot_err("fill plot background"))?;

    let mut chart = ChartBuilder::on(&root)
        .caption(
            format!("{} vs MOS - Pearson correlation: {:.3}", metric, pearson),
            ("sans-serif", 24).into_font(),
        )
        .margin(15)
        .x_label_area_size(50)
        .y_label_area_size(70)
        .build_cartesian_2d(x_min..x_max, (MIN_SCORE - 0.5)..(MAX_SCORE + 0.5))
        .map_err(plot_err("build chart"))?;

    let x_desc = match metric.unit() {
        Some(unit) => format!("{} ({})", metric, unit),
        None => metric.to_string(),
    };
    let x_label_format = |x: &f64| match metric {
        Metric::Psnr => format!("{:.1}", x),
        Metric::Ssim => format!("{:.3}", x),
    };
    chart
        .configure_mesh()
        .x_desc(x_desc)
        .y_desc("MOS (Mean Opinion Score)")
        .x_label_formatter(&x_label_format)
        .axis_desc_style(("sans-serif", 16))
        .label_style(("sans-serif", 14))
        .y_labels(11)
        .draw()
        .map_err(plot_err("draw mesh"))?;

    chart
        .draw_series(points.iter().map(|&p| Circle::new(p, 7, BLUE.mix(0.6).filled())))
        .map_err(plot_err("draw ratings"))?
        .label("Trials")
        .legend(|(x, y)| Circle::new((x + 10, y), 5, BLUE.mix(0.6).filled()));

    if let Some(linear) = report.model(metric, ModelKind::Linear) {
        chart
            .draw_series(LineSeries::new(curve_points(linear, x_min, x_max), RED.stroke_width(2)))
            .map_err(plot_err("draw linear fit"))?
            .label(format!("Linear (R² = {:.3})", linear.r_squared))
            .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], RED.stroke_width(2)));
    }
    if let Some(quad) = report.model(metric, ModelKind::Quadratic) {
        chart
            .draw_series(LineSeries::new(curve_points(quad, x_min, x_max), GREEN.stroke_width(2)))
            .map_err(plot_err("draw quadratic fit"))?
            .label(format!("Quadratic (R² = {:.3})", quad.r_squared))
            .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], GREEN.stroke_width(2)));
    }

    chart
        .configure_series_labels()
        .position(SeriesLabelPosition::LowerRight)
        .margin(10)
        .label_font(("sans-serif", 12))
        .background_style(WHITE.mix(0.8))
        .border_style(BLACK)
        .draw()
        .map_err(plot_err("draw legend"))?;

    root.present().map_err(plot_err("save plot"))?;
    debug!("Plotted {} trials for {}", points.len(), metric);
    Ok(())
}

/// Side-by-side bars of each trial's rating and its normalized PSNR.
pub fn mos_vs_psnr_comparison(report: &AnalysisReport, output_path: &Path) -> Result<()> {
    info!("Generating MOS vs PSNR comparison chart: {}", output_path.display());
    let count = report.trials.len();
    const BAR_WIDTH: f64 = 0.35;

    let root = BitMapBackend::new(output_path, CHART_SIZE).into_drawing_area();
    root.fill(&WHITE).map_err(plot_err("fill plot background"))?;

    let mut chart = ChartBuilder::on(&root)
        .caption("MOS vs normalized PSNR", ("sans-serif", 24).into_font())
        .margin(15)
        .x_label_area_size(50)
        .y_label_area_size(70)
        .build_cartesian_2d(-0.6..(count as f64 - 0.4), MIN_SCORE..(MAX_SCORE + 0.5))
        .map_err(plot_err("build chart"))?;

    let x_label_format = |x: &f64| {
        let nearest = x.round();
        if (x - nearest).abs() < 1e-6 && nearest >= 0.0 {
            format!("V{}", nearest as usize + 1)
        } else {
            String::new()
        }
    };
    chart
        .configure_mesh()
        .disable_x_mesh()
        .x_desc("Distorted video")
        .y_desc("Score (0-10)")
        .x_labels(count + 1)
        .x_label_formatter(&x_label_format)
        .axis_desc_style(("sans-serif", 16))
        .label_style(("sans-serif", 14))
        .draw()
        .map_err(plot_err("draw mesh"))?;

    let bars = |values: &[f64], offset: f64, color: RGBColor| {
        values
            .iter()
            .enumerate()
            .map(move |(i, &v)| {
                let x = i as f64 + offset;
                Rectangle::new([(x - BAR_WIDTH / 2.0, 0.0), (x + BAR_WIDTH / 2.0, v)], color.mix(0.8).filled())
            })
            .collect::<Vec<_>>()
    };

    let mos = report.ratings();
    chart
        .draw_series(bars(&mos, -BAR_WIDTH / 2.0, BLUE))
        .map_err(plot_err("draw MOS bars"))?
        .label("MOS (subjective)")
        .legend(|(x, y)| Rectangle::new([(x, y - 5), (x + 15, y + 5)], BLUE.mix(0.8).filled()));
    chart
        .draw_series(bars(&report.psnr_normalized, BAR_WIDTH / 2.0, ORANGE))
        .map_err(plot_err("draw PSNR bars"))?
        .label("PSNR (normalized)")
        .legend(|(x, y)| Rectangle::new([(x, y - 5), (x + 15, y + 5)], ORANGE.mix(0.8).filled()));

    chart
        .configure_series_labels()
        .position(SeriesLabelPosition::UpperRight)
        .margin(10)
        .label_font(("sans-serif", 12))
        .background_style(WHITE.mix(0.8))
        .border_style(BLACK)
        .draw()
        .map_err(plot_err("draw legend"))?;

    root.present().map_err(plot_err("save plot"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn axis_range_pads_data() {
        let (lo, hi) = axis_range(&[30.0, 40.0]);
        assert!(lo < 30.0 && hi > 40.0);
        let (lo, hi) = axis_range(&[0.9, 0.9]);
        assert!(lo < 0.9 && hi > 0.9);
        assert_eq!(axis_range(&[]), (0.0, 1.0));
    }

    #[test]
    fn curve_spans_the_axis() {
        let model = RegressionModel {
            metric: Metric::Psnr,
            kind: ModelKind::Linear,
            coefficients: vec![0.5, 1.0],
            r_squared: 1.0,
            p_value: Some(0.0),
            pearson: 1.0,
            spearman: 1.0,
            degenerate: false,
        };
        let points = curve_points(&model, 20.0, 40.0);
        assert_eq!(points.len(), CURVE_SAMPLES + 1);
        assert_eq!(points[0], (20.0, 11.0));
        assert_eq!(points[CURVE_SAMPLES], (40.0, 21.0));
    }
}
