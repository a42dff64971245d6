//! Figure rendering helpers. Charts are drawn into an RGB buffer with the
//! plotters bitmap backend and encoded to PNG with `image`.

use std::io::Cursor;
use std::path::Path;

use image::{DynamicImage, ImageBuffer, ImageFormat, Rgb};
use plotters::coord::Shift;
use plotters::prelude::*;

use crate::error::EphysError;

#[derive(Clone, Debug)]
pub struct PlotStyle {
    pub width: u32,
    pub height: u32,
    pub background: RGBColor,
    pub palette: Vec<RGBColor>,
}

impl Default for PlotStyle {
    fn default() -> Self {
        Self {
            width: 600,
            height: 800,
            background: WHITE,
            palette: vec![
                RGBColor(31, 119, 180),
                RGBColor(214, 39, 40),
                RGBColor(44, 160, 44),
                RGBColor(148, 103, 189),
                RGBColor(255, 127, 14),
                RGBColor(23, 190, 207),
            ],
        }
    }
}

impl PlotStyle {
    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn color(&self, index: usize) -> RGBColor {
        self.palette[index % self.palette.len()]
    }
}

/// One sweep's traces prepared for display, on a shared time base.
#[derive(Clone, Debug)]
pub struct SweepTraces {
    /// Sample period (ms).
    pub dt_ms: f64,
    /// Voltage (mV), junction potential already subtracted.
    pub voltage: Vec<f64>,
    /// Command current (pA).
    pub current: Vec<f64>,
    /// Spike times (ms from sweep start).
    pub events_ms: Vec<f64>,
}

/// The diagnostic figure for one epoch: spike raster over all sweeps,
/// stacked voltage traces, and the command current.
#[derive(Clone, Debug)]
pub struct EpochFigure {
    pub title: String,
    pub sweeps: Vec<SweepTraces>,
    /// Plot all voltage traces on a shared axis instead of offsetting them.
    pub combine: bool,
    pub ylim: (f64, f64),
    pub xlim: Option<(f64, f64)>,
}

pub fn render_epoch_png(fig: &EpochFigure, style: &PlotStyle) -> Result<Vec<u8>, EphysError> {
    if fig.sweeps.is_empty() {
        return Err(EphysError::Plot("epoch has no sweeps".into()));
    }
    let mut buffer = vec![0u8; (style.width * style.height * 3) as usize];
    {
        let root = BitMapBackend::with_buffer(&mut buffer, (style.width, style.height))
            .into_drawing_area();
        root.fill(&style.background)?;
        let (raster_area, rest) = root.split_vertically((style.height as f64 * 0.18) as u32);
        let (v_area, i_area) = rest.split_vertically((style.height as f64 * 0.62) as u32);

        let t_max = fig
            .sweeps
            .iter()
            .map(|s| s.dt_ms * s.voltage.len() as f64)
            .fold(0.0, f64::max);
        let xr = fig.xlim.unwrap_or((0.0, t_max));
        let n_sweeps = fig.sweeps.len();

        // raster: one row of tick marks per sweep, no axes
        let mut raster = ChartBuilder::on(&raster_area)
            .caption(&fig.title, ("sans-serif", 16).into_font())
            .margin(5)
            .build_cartesian_2d(xr.0..xr.1, -0.5..(n_sweeps as f64 - 0.5))?;
        for (idx, sweep) in fig.sweeps.iter().enumerate() {
            let color = style.color(idx);
            raster.draw_series(sweep.events_ms.iter().map(|&t| {
                PathElement::new(
                    vec![(t, idx as f64 - 0.4), (t, idx as f64 + 0.4)],
                    color.stroke_width(1),
                )
            }))?;
        }

        // voltage traces, offset so each sweep gets its own band unless the
        // caller asked for a shared axis
        let step = fig
            .sweeps
            .iter()
            .map(|s| peak_to_peak(&s.voltage))
            .fold(0.0, f64::max);
        let yr = if fig.combine {
            fig.ylim
        } else {
            let base = fig
                .sweeps
                .iter()
                .flat_map(|s| s.voltage.iter().copied())
                .fold(f64::INFINITY, f64::min);
            (base - 5.0, base + step * n_sweeps as f64 + 5.0)
        };
        let mut v_chart = ChartBuilder::on(&v_area)
            .margin(5)
            .x_label_area_size(if fig.combine { 0 } else { 25 })
            .y_label_area_size(if fig.combine { 40 } else { 0 })
            .build_cartesian_2d(xr.0..xr.1, yr.0..yr.1)?;
        if fig.combine {
            v_chart
                .configure_mesh()
                .disable_mesh()
                .y_desc("V (mV)")
                .draw()?;
        }
        for (idx, sweep) in fig.sweeps.iter().enumerate() {
            let color = style.color(idx);
            let offset = if fig.combine {
                0.0
            } else {
                step * idx as f64
            };
            v_chart.draw_series(LineSeries::new(
                sweep
                    .voltage
                    .iter()
                    .enumerate()
                    .map(|(k, v)| (k as f64 * sweep.dt_ms, v + offset)),
                color.stroke_width(1),
            ))?;
            if !fig.combine {
                if let Some(&v0) = sweep.voltage.first() {
                    v_chart.draw_series(std::iter::once(Text::new(
                        format!("{v0:.0}"),
                        (xr.0, v0 + offset),
                        ("sans-serif", 11).into_font(),
                    )))?;
                }
            }
        }

        // command current
        let (i_min, i_max) = fig
            .sweeps
            .iter()
            .flat_map(|s| s.current.iter().copied())
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
                (lo.min(v), hi.max(v))
            });
        let pad = ((i_max - i_min).abs() * 0.05).max(1.0);
        let mut i_chart = ChartBuilder::on(&i_area)
            .margin(5)
            .x_label_area_size(25)
            .y_label_area_size(40)
            .build_cartesian_2d(xr.0..xr.1, (i_min - pad)..(i_max + pad))?;
        i_chart
            .configure_mesh()
            .disable_mesh()
            .x_desc("Time (ms)")
            .y_desc("I (pA)")
            .draw()?;
        for (idx, sweep) in fig.sweeps.iter().enumerate() {
            let color = style.color(idx);
            i_chart.draw_series(LineSeries::new(
                sweep
                    .current
                    .iter()
                    .enumerate()
                    .map(|(k, v)| (k as f64 * sweep.dt_ms, *v)),
                color.stroke_width(1),
            ))?;
        }
        root.present()?;
    }
    encode_png(&buffer, style.width, style.height)
}

/// One labeled x-y series (one epoch) in a comparison panel.
#[derive(Clone, Debug)]
pub struct EpochCurve {
    pub label: String,
    pub points: Vec<(f64, f64)>,
}

/// One point of a per-epoch time course, with an optional standard error.
#[derive(Clone, Copy, Debug)]
pub struct TimePoint {
    pub time_s: f64,
    pub value: f64,
    pub sem: Option<f64>,
}

#[derive(Clone, Debug)]
pub struct TimeCourse {
    pub label: String,
    pub points: Vec<TimePoint>,
}

/// Raster plus example traces for one displayed epoch.
#[derive(Clone, Debug)]
pub struct ExampleEpoch {
    pub label: String,
    /// Spike times (ms) for every sweep of the epoch.
    pub raster: Vec<Vec<f64>>,
    /// Traces for the selected display sweeps.
    pub traces: Vec<SweepTraces>,
}

/// The multi-panel plasticity figure: example epochs, binned I-V and f-I
/// curves per epoch, and the per-epoch time courses.
#[derive(Clone, Debug)]
pub struct PlasticityFigure {
    pub title: String,
    pub iv: Vec<EpochCurve>,
    pub fi: Vec<EpochCurve>,
    pub courses: Vec<TimeCourse>,
    pub examples: Vec<ExampleEpoch>,
}

pub fn render_plasticity_png(
    fig: &PlasticityFigure,
    style: &PlotStyle,
) -> Result<Vec<u8>, EphysError> {
    let mut buffer = vec![0u8; (style.width * style.height * 3) as usize];
    {
        let root = BitMapBackend::with_buffer(&mut buffer, (style.width, style.height))
            .into_drawing_area();
        root.fill(&style.background)?;
        let (title_area, body) = root.split_vertically(24);
        title_area.draw(&Text::new(
            fig.title.clone(),
            (10, 4),
            ("sans-serif", 16).into_font(),
        ))?;
        let columns = body.split_evenly((1, 3));

        // left: example epochs (raster, offset voltage traces, current)
        if !fig.examples.is_empty() {
            let rows = columns[0].split_evenly((fig.examples.len(), 1));
            for (example, area) in fig.examples.iter().zip(rows) {
                draw_example(example, &area, style)?;
            }
        }

        // middle: I-V and f-I curves per epoch
        let middle = columns[1].split_evenly((2, 1));
        draw_curves(&fig.iv, &middle[0], "I (pA)", "V (mV)", style)?;
        draw_curves(&fig.fi, &middle[1], "Current (pA)", "Freq (Hz)", style)?;

        // right: time courses
        if !fig.courses.is_empty() {
            let rows = columns[2].split_evenly((fig.courses.len(), 1));
            for (course, area) in fig.courses.iter().zip(rows) {
                draw_course(course, &area)?;
            }
        }
        root.present()?;
    }
    encode_png(&buffer, style.width, style.height)
}

fn draw_example(
    example: &ExampleEpoch,
    area: &DrawingArea<BitMapBackend<'_>, Shift>,
    style: &PlotStyle,
) -> Result<(), EphysError> {
    let (raster_area, rest) = area.split_vertically(area.dim_in_pixel().1 / 4);
    let (v_area, i_area) = rest.split_vertically(rest.dim_in_pixel().1 * 3 / 4);
    let t_max = example
        .traces
        .iter()
        .map(|s| s.dt_ms * s.voltage.len() as f64)
        .fold(0.0, f64::max)
        .max(1.0);

    let mut raster = ChartBuilder::on(&raster_area)
        .caption(&example.label, ("sans-serif", 12).into_font())
        .margin(4)
        .build_cartesian_2d(0.0..t_max, -0.5..(example.raster.len() as f64 - 0.5))?;
    for (idx, events) in example.raster.iter().enumerate() {
        let color = style.color(idx);
        raster.draw_series(events.iter().map(|&t| {
            PathElement::new(
                vec![(t, idx as f64 - 0.4), (t, idx as f64 + 0.4)],
                color.stroke_width(1),
            )
        }))?;
    }

    if example.traces.is_empty() {
        return Ok(());
    }
    let step = example
        .traces
        .iter()
        .map(|s| peak_to_peak(&s.voltage))
        .fold(0.0, f64::max);
    let base = example
        .traces
        .iter()
        .flat_map(|s| s.voltage.iter().copied())
        .fold(f64::INFINITY, f64::min);
    let top = base + step * example.traces.len().max(1) as f64 + 5.0;
    let mut v_chart = ChartBuilder::on(&v_area)
        .margin(4)
        .build_cartesian_2d(0.0..t_max, (base - 5.0)..top)?;
    for (idx, sweep) in example.traces.iter().enumerate() {
        let color = style.color(idx);
        let offset = step * idx as f64;
        v_chart.draw_series(LineSeries::new(
            sweep
                .voltage
                .iter()
                .enumerate()
                .map(|(k, v)| (k as f64 * sweep.dt_ms, v + offset)),
            color.stroke_width(1),
        ))?;
    }

    let (i_min, i_max) = example
        .traces
        .iter()
        .flat_map(|s| s.current.iter().copied())
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
            (lo.min(v), hi.max(v))
        });
    let (i_min, i_max) = if i_min.is_finite() {
        (i_min - 1.0, i_max + 1.0)
    } else {
        (-1.0, 1.0)
    };
    let mut i_chart = ChartBuilder::on(&i_area)
        .margin(4)
        .build_cartesian_2d(0.0..t_max, i_min..i_max)?;
    for (idx, sweep) in example.traces.iter().enumerate() {
        let color = style.color(idx);
        i_chart.draw_series(LineSeries::new(
            sweep
                .current
                .iter()
                .enumerate()
                .map(|(k, v)| (k as f64 * sweep.dt_ms, *v)),
            color.stroke_width(1),
        ))?;
    }
    Ok(())
}

fn draw_curves(
    curves: &[EpochCurve],
    area: &DrawingArea<BitMapBackend<'_>, Shift>,
    x_desc: &str,
    y_desc: &str,
    style: &PlotStyle,
) -> Result<(), EphysError> {
    let points: Vec<(f64, f64)> = curves.iter().flat_map(|c| c.points.iter().copied()).collect();
    if points.is_empty() {
        return Ok(());
    }
    let (xr, yr) = bounds(&points);
    let mut chart = ChartBuilder::on(area)
        .margin(8)
        .x_label_area_size(28)
        .y_label_area_size(40)
        .build_cartesian_2d(xr, yr)?;
    chart
        .configure_mesh()
        .disable_mesh()
        .x_desc(x_desc)
        .y_desc(y_desc)
        .label_style(("sans-serif", 11))
        .draw()?;
    for (idx, curve) in curves.iter().enumerate() {
        let color = style.color(idx);
        chart
            .draw_series(LineSeries::new(
                curve.points.iter().copied(),
                color.stroke_width(1),
            ))?
            .label(curve.label.clone())
            .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], color));
    }
    chart
        .configure_series_labels()
        .border_style(BLACK.mix(0.2))
        .background_style(WHITE.mix(0.8))
        .label_font(("sans-serif", 11))
        .draw()?;
    Ok(())
}

fn draw_course(
    course: &TimeCourse,
    area: &DrawingArea<BitMapBackend<'_>, Shift>,
) -> Result<(), EphysError> {
    if course.points.is_empty() {
        return Ok(());
    }
    let points: Vec<(f64, f64)> = course.points.iter().map(|p| (p.time_s, p.value)).collect();
    let spans: Vec<(f64, f64)> = course
        .points
        .iter()
        .map(|p| {
            let sem = p.sem.unwrap_or(0.0);
            (p.value - sem, p.value + sem)
        })
        .collect();
    let x_lo = points.iter().map(|p| p.0).fold(f64::INFINITY, f64::min);
    let x_hi = points.iter().map(|p| p.0).fold(f64::NEG_INFINITY, f64::max);
    let y_lo = spans.iter().map(|s| s.0).fold(f64::INFINITY, f64::min);
    let y_hi = spans.iter().map(|s| s.1).fold(f64::NEG_INFINITY, f64::max);
    let x_pad = ((x_hi - x_lo) * 0.05).max(1.0);
    let y_pad = ((y_hi - y_lo) * 0.1).max(1e-3);
    let mut chart = ChartBuilder::on(area)
        .margin(8)
        .x_label_area_size(24)
        .y_label_area_size(44)
        .build_cartesian_2d((x_lo - x_pad)..(x_hi + x_pad), (y_lo - y_pad)..(y_hi + y_pad))?;
    chart
        .configure_mesh()
        .disable_mesh()
        .x_desc("Time (s)")
        .y_desc(course.label.clone())
        .label_style(("sans-serif", 11))
        .draw()?;
    chart.draw_series(course.points.iter().filter(|p| p.sem.is_some()).map(|p| {
        let sem = p.sem.unwrap_or(0.0);
        ErrorBar::new_vertical(p.time_s, p.value - sem, p.value, p.value + sem, BLACK.filled(), 4)
    }))?;
    chart.draw_series(
        points
            .iter()
            .map(|&(x, y)| Circle::new((x, y), 3, BLACK.stroke_width(1))),
    )?;
    Ok(())
}

/// Range bounds with a small padding around the data.
fn bounds(points: &[(f64, f64)]) -> (std::ops::Range<f64>, std::ops::Range<f64>) {
    let x_lo = points.iter().map(|p| p.0).fold(f64::INFINITY, f64::min);
    let x_hi = points.iter().map(|p| p.0).fold(f64::NEG_INFINITY, f64::max);
    let y_lo = points.iter().map(|p| p.1).fold(f64::INFINITY, f64::min);
    let y_hi = points.iter().map(|p| p.1).fold(f64::NEG_INFINITY, f64::max);
    let x_pad = ((x_hi - x_lo) * 0.05).max(1.0);
    let y_pad = ((y_hi - y_lo) * 0.05).max(1e-3);
    (
        (x_lo - x_pad)..(x_hi + x_pad),
        (y_lo - y_pad)..(y_hi + y_pad),
    )
}

fn peak_to_peak(values: &[f64]) -> f64 {
    let (lo, hi) = values
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });
    if lo.is_finite() {
        hi - lo
    } else {
        0.0
    }
}

fn encode_png(buffer: &[u8], width: u32, height: u32) -> Result<Vec<u8>, EphysError> {
    let img = ImageBuffer::<Rgb<u8>, _>::from_raw(width, height, buffer.to_vec())
        .ok_or_else(|| EphysError::Plot("failed to allocate image buffer".into()))?;
    let mut output = Vec::new();
    DynamicImage::ImageRgb8(img).write_to(&mut Cursor::new(&mut output), ImageFormat::Png)?;
    Ok(output)
}

/// Render and write a figure to `path`, logging the destination.
pub fn save_png(path: &Path, png: &[u8]) -> Result<(), EphysError> {
    std::fs::write(path, png)?;
    log::info!("- saving plot to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sweep(events: &[f64]) -> SweepTraces {
        SweepTraces {
            dt_ms: 0.1,
            voltage: (0..1000)
                .map(|k| -70.0 + ((k as f64) * 0.02).sin() * 5.0)
                .collect(),
            current: (0..1000).map(|k| if k > 500 { 50.0 } else { 0.0 }).collect(),
            events_ms: events.to_vec(),
        }
    }

    #[test]
    fn epoch_figure_renders_to_png() {
        let fig = EpochFigure {
            title: "cell01_01".into(),
            sweeps: vec![sweep(&[55.0, 60.0]), sweep(&[]), sweep(&[70.0])],
            combine: false,
            ylim: (-140.0, 30.0),
            xlim: None,
        };
        let png = render_epoch_png(&fig, &PlotStyle::default()).unwrap();
        assert_eq!(&png[1..4], b"PNG");
    }

    #[test]
    fn empty_epoch_figure_is_an_error() {
        let fig = EpochFigure {
            title: "empty".into(),
            sweeps: vec![],
            combine: true,
            ylim: (-140.0, 30.0),
            xlim: None,
        };
        assert!(matches!(
            render_epoch_png(&fig, &PlotStyle::default()),
            Err(EphysError::Plot(_))
        ));
    }

    #[test]
    fn plasticity_figure_renders_to_png() {
        let fig = PlasticityFigure {
            title: "cell01".into(),
            iv: vec![EpochCurve {
                label: "0 s".into(),
                points: vec![(-100.0, -90.0), (-50.0, -80.0), (0.0, -70.0), (50.0, -60.0)],
            }],
            fi: vec![EpochCurve {
                label: "0 s".into(),
                points: vec![(0.0, 0.0), (50.0, 10.0), (100.0, 25.0)],
            }],
            courses: vec![TimeCourse {
                label: "Rm (MΩ)".into(),
                points: vec![
                    TimePoint {
                        time_s: 0.0,
                        value: 200.0,
                        sem: Some(12.0),
                    },
                    TimePoint {
                        time_s: 600.0,
                        value: 180.0,
                        sem: Some(9.0),
                    },
                ],
            }],
            examples: vec![ExampleEpoch {
                label: "epoch 1".into(),
                raster: vec![vec![550.0, 600.0], vec![], vec![700.0]],
                traces: vec![sweep(&[550.0])],
            }],
        };
        let png = render_plasticity_png(&fig, &PlotStyle::default().with_size(900, 600)).unwrap();
        assert_eq!(&png[1..4], b"PNG");
    }
}
