//! SVG Charts and CSV export for training curves
//!
//! Produces the loss and accuracy curves of a training run as standalone
//! SVG files plus a CSV dump of the per-epoch history.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use crate::training::EpochRecord;
use crate::utils::error::Result;
use crate::utils::report::write_atomic;

const CHART_WIDTH: f64 = 800.0;
const CHART_HEIGHT: f64 = 500.0;
const MARGIN_TOP: f64 = 60.0;
const MARGIN_RIGHT: f64 = 40.0;
const MARGIN_BOTTOM: f64 = 80.0;
const MARGIN_LEFT: f64 = 80.0;

const COLOR_PRIMARY: &str = "#3498db";
const COLOR_SECONDARY: &str = "#e74c3c";
const COLOR_GRID: &str = "#ecf0f1";
const COLOR_AXIS: &str = "#2c3e50";
const COLOR_TEXT: &str = "#2c3e50";

/// A named line on a chart
#[derive(Debug, Clone)]
pub struct DataSeries {
    pub name: String,
    /// (x, y) pairs in data coordinates
    pub points: Vec<(f64, f64)>,
    pub color: String,
}

/// Render a line chart as an SVG document
pub fn render_line_chart(title: &str, x_label: &str, y_label: &str, series: &[DataSeries]) -> String {
    let plot_width = CHART_WIDTH - MARGIN_LEFT - MARGIN_RIGHT;
    let plot_height = CHART_HEIGHT - MARGIN_TOP - MARGIN_BOTTOM;

    let (x_min, x_max, y_min, y_max) = find_ranges(series);
    // Degenerate ranges would divide by zero
    let x_span = if x_max > x_min { x_max - x_min } else { 1.0 };
    let y_span = if y_max > y_min { y_max - y_min } else { 1.0 };

    let sx = |x: f64| MARGIN_LEFT + ((x - x_min) / x_span) * plot_width;
    let sy = |y: f64| MARGIN_TOP + plot_height - ((y - y_min) / y_span) * plot_height;

    let mut svg = String::new();
    let _ = write!(
        svg,
        r#"<svg xmlns="http://www.w3.org/2000/svg" viewBox="0 0 {w} {h}" width="{w}" height="{h}">"#,
        w = CHART_WIDTH,
        h = CHART_HEIGHT
    );
    let _ = write!(
        svg,
        r#"<rect width="{}" height="{}" fill="white"/>"#,
        CHART_WIDTH, CHART_HEIGHT
    );
    let _ = write!(
        svg,
        r#"<text x="{}" y="35" text-anchor="middle" font-family="Arial, sans-serif" font-size="18" font-weight="bold" fill="{}">{}</text>"#,
        CHART_WIDTH / 2.0,
        COLOR_TEXT,
        escape_xml(title)
    );

    for i in 0..=5 {
        let value = y_min + (i as f64 / 5.0) * y_span;
        let y = sy(value);
        let _ = write!(
            svg,
            r#"<line x1="{}" y1="{}" x2="{}" y2="{}" stroke="{}" stroke-width="1"/>"#,
            MARGIN_LEFT,
            y,
            MARGIN_LEFT + plot_width,
            y,
            COLOR_GRID
        );
        let _ = write!(
            svg,
            r#"<text x="{}" y="{}" text-anchor="end" font-family="Arial, sans-serif" font-size="12" fill="{}">{:.3}</text>"#,
            MARGIN_LEFT - 10.0,
            y + 4.0,
            COLOR_TEXT,
            value
        );
    }

    let _ = write!(
        svg,
        r#"<line x1="{}" y1="{}" x2="{}" y2="{}" stroke="{}" stroke-width="2"/>"#,
        MARGIN_LEFT,
        MARGIN_TOP + plot_height,
        MARGIN_LEFT + plot_width,
        MARGIN_TOP + plot_height,
        COLOR_AXIS
    );
    let _ = write!(
        svg,
        r#"<line x1="{}" y1="{}" x2="{}" y2="{}" stroke="{}" stroke-width="2"/>"#,
        MARGIN_LEFT,
        MARGIN_TOP,
        MARGIN_LEFT,
        MARGIN_TOP + plot_height,
        COLOR_AXIS
    );
    let _ = write!(
        svg,
        r#"<text x="{}" y="{}" text-anchor="middle" font-family="Arial, sans-serif" font-size="14" fill="{}">{}</text>"#,
        MARGIN_LEFT + plot_width / 2.0,
        CHART_HEIGHT - 20.0,
        COLOR_TEXT,
        escape_xml(x_label)
    );
    let _ = write!(
        svg,
        r#"<text x="20" y="{}" text-anchor="middle" font-family="Arial, sans-serif" font-size="14" fill="{}" transform="rotate(-90 20 {})">{}</text>"#,
        CHART_HEIGHT / 2.0,
        COLOR_TEXT,
        CHART_HEIGHT / 2.0,
        escape_xml(y_label)
    );

    for s in series.iter().filter(|s| !s.points.is_empty()) {
        let path: Vec<String> = s
            .points
            .iter()
            .enumerate()
            .map(|(i, &(x, y))| format!("{} {} {}", if i == 0 { "M" } else { "L" }, sx(x), sy(y)))
            .collect();
        let _ = write!(
            svg,
            r#"<path d="{}" fill="none" stroke="{}" stroke-width="3"/>"#,
            path.join(" "),
            s.color
        );
        for &(x, y) in &s.points {
            let _ = write!(
                svg,
                r#"<circle cx="{}" cy="{}" r="4" fill="{}" stroke="white" stroke-width="2"/>"#,
                sx(x),
                sy(y),
                s.color
            );
        }
    }

    if let Some(first) = series.first() {
        for &(x, _) in &first.points {
            let _ = write!(
                svg,
                r#"<text x="{}" y="{}" text-anchor="middle" font-family="Arial, sans-serif" font-size="11" fill="{}">{:.0}</text>"#,
                sx(x),
                MARGIN_TOP + plot_height + 20.0,
                COLOR_TEXT,
                x
            );
        }
    }

    let mut legend_y = MARGIN_TOP + 10.0;
    for s in series {
        let _ = write!(
            svg,
            r#"<rect x="{}" y="{}" width="15" height="15" fill="{}"/>"#,
            CHART_WIDTH - MARGIN_RIGHT - 130.0,
            legend_y,
            s.color
        );
        let _ = write!(
            svg,
            r#"<text x="{}" y="{}" font-family="Arial, sans-serif" font-size="12" fill="{}">{}</text>"#,
            CHART_WIDTH - MARGIN_RIGHT - 110.0,
            legend_y + 12.0,
            COLOR_TEXT,
            escape_xml(&s.name)
        );
        legend_y += 25.0;
    }

    svg.push_str("</svg>");
    svg
}

/// CSV rendering of the per-epoch history
pub fn history_csv(history: &[EpochRecord]) -> String {
    let mut csv = String::from("epoch,train_loss,train_accuracy,val_loss,val_accuracy,learning_rate\n");
    for r in history {
        let _ = writeln!(
            csv,
            "{},{:.6},{:.6},{:.6},{:.6},{:.8}",
            r.epoch + 1,
            r.train_loss,
            r.train_accuracy,
            r.val_loss,
            r.val_accuracy,
            r.learning_rate
        );
    }
    csv
}

/// Write `training_history.csv`, `loss_curve.svg` and `accuracy_curve.svg`
pub fn save_training_curves(history: &[EpochRecord], dir: &Path) -> Result<Vec<PathBuf>> {
    let epoch_x = |r: &EpochRecord| (r.epoch + 1) as f64;

    let loss = [
        DataSeries {
            name: "train loss".to_string(),
            points: history.iter().map(|r| (epoch_x(r), r.train_loss)).collect(),
            color: COLOR_PRIMARY.to_string(),
        },
        DataSeries {
            name: "val loss".to_string(),
            points: history.iter().map(|r| (epoch_x(r), r.val_loss)).collect(),
            color: COLOR_SECONDARY.to_string(),
        },
    ];
    let accuracy = [
        DataSeries {
            name: "train accuracy".to_string(),
            points: history.iter().map(|r| (epoch_x(r), r.train_accuracy)).collect(),
            color: COLOR_PRIMARY.to_string(),
        },
        DataSeries {
            name: "val accuracy".to_string(),
            points: history.iter().map(|r| (epoch_x(r), r.val_accuracy)).collect(),
            color: COLOR_SECONDARY.to_string(),
        },
    ];

    let csv_path = dir.join("training_history.csv");
    let loss_path = dir.join("loss_curve.svg");
    let acc_path = dir.join("accuracy_curve.svg");

    write_atomic(&csv_path, history_csv(history).as_bytes())?;
    write_atomic(
        &loss_path,
        render_line_chart("Model Loss", "Epoch", "Loss", &loss).as_bytes(),
    )?;
    write_atomic(
        &acc_path,
        render_line_chart("Model Accuracy", "Epoch", "Accuracy", &accuracy).as_bytes(),
    )?;

    Ok(vec![csv_path, loss_path, acc_path])
}

fn find_ranges(series: &[DataSeries]) -> (f64, f64, f64, f64) {
    let mut x_min = f64::INFINITY;
    let mut x_max = f64::NEG_INFINITY;
    let mut y_min = f64::INFINITY;
    let mut y_max = f64::NEG_INFINITY;

    for &(x, y) in series.iter().flat_map(|s| s.points.iter()) {
        if !x.is_finite() || !y.is_finite() {
            continue;
        }
        x_min = x_min.min(x);
        x_max = x_max.max(x);
        y_min = y_min.min(y);
        y_max = y_max.max(y);
    }

    if x_min > x_max {
        return (0.0, 1.0, 0.0, 1.0);
    }
    (x_min, x_max, y_min.min(0.0), y_max)
}

fn escape_xml(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn history() -> Vec<EpochRecord> {
        (0..3)
            .map(|epoch| EpochRecord {
                epoch,
                train_loss: 0.7 - 0.1 * epoch as f64,
                train_accuracy: 0.5 + 0.1 * epoch as f64,
                val_loss: 0.65 - 0.05 * epoch as f64,
                val_accuracy: 0.55 + 0.05 * epoch as f64,
                learning_rate: 1e-3,
            })
            .collect()
    }

    #[test]
    fn test_history_csv() {
        let csv = history_csv(&history());
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("epoch,train_loss"));
        assert!(lines[1].starts_with("1,0.700000"));
    }

    #[test]
    fn test_render_handles_single_point() {
        let svg = render_line_chart(
            "One <point>",
            "Epoch",
            "Loss",
            &[DataSeries {
                name: "loss".to_string(),
                points: vec![(1.0, 0.5)],
                color: COLOR_PRIMARY.to_string(),
            }],
        );
        assert!(svg.starts_with("<svg"));
        assert!(svg.contains("One &lt;point&gt;"));
        assert!(!svg.contains("NaN"));
    }

    #[test]
    fn test_save_training_curves() {
        let dir = TempDir::new().unwrap();
        let paths = save_training_curves(&history(), dir.path()).unwrap();
        assert_eq!(paths.len(), 3);
        for path in paths {
            assert!(path.exists());
        }
    }
}
