use crate::Error;
use plotters::prelude::*;
use std::path::Path;

const PLOT_SIZE: (u32, u32) = (1600, 900);

/// Colours of the curves of a comparison plot, reused once exhausted. There
/// is no legend, a curve's colour is its index in the plotted order.
pub(crate) const SERIES_COLOURS: [RGBColor; 8] = [
    RGBColor(31, 119, 180),
    RGBColor(255, 127, 14),
    RGBColor(44, 160, 44),
    RGBColor(214, 39, 40),
    RGBColor(148, 103, 189),
    RGBColor(140, 86, 75),
    RGBColor(227, 119, 194),
    RGBColor(23, 190, 207),
];

fn plot_error<E: std::fmt::Display>(err: E) -> Error {
    Error::Plot(err.to_string())
}

/// Draws the loss against the step number and saves it as a PNG.
pub(crate) fn save_loss_curve(path: &Path, history: &[f64]) -> Result<(), Error> {
    save_loss_curves(path, &[history])
}

/// Draws several loss histories onto the same axes, each in the colour of
/// its index in `SERIES_COLOURS`, and saves them as a PNG.
///
/// The y axis is logarithmic unless a loss is zero or negative, which can
/// happen with negative loss coefficients. Non-finite losses are skipped.
pub(crate) fn save_loss_curves(path: &Path, histories: &[&[f64]]) -> Result<(), Error> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let series: Vec<Vec<(usize, f64)>> = histories
        .iter()
        .map(|history| {
            history
                .iter()
                .enumerate()
                .filter(|(_, loss)| loss.is_finite())
                .map(|(i, &loss)| (i + 1, loss))
                .collect()
        })
        .collect();

    let (lo, hi) = series
        .iter()
        .flatten()
        .fold(None, |bounds: Option<(f64, f64)>, &(_, loss)| match bounds {
            Some((lo, hi)) => Some((lo.min(loss), hi.max(loss))),
            None => Some((loss, loss)),
        })
        .unwrap_or((1.0, 10.0));

    let longest = histories.iter().map(|h| h.len()).max().unwrap_or(0);
    let steps = 1..longest.max(1) + 1;

    let root = BitMapBackend::new(path, PLOT_SIZE).into_drawing_area();
    root.fill(&WHITE).map_err(plot_error)?;

    if lo > 0.0 {
        let hi = if hi > lo { hi } else { lo * 10.0 };

        let mut chart = ChartBuilder::on(&root)
            .margin(20)
            .build_cartesian_2d(steps, (lo..hi).log_scale())
            .map_err(plot_error)?;

        for (i, points) in series.into_iter().enumerate() {
            chart
                .draw_series(LineSeries::new(
                    points,
                    &SERIES_COLOURS[i % SERIES_COLOURS.len()],
                ))
                .map_err(plot_error)?;
        }
    } else {
        let (lo, hi) = if hi > lo { (lo, hi) } else { (lo - 1.0, hi + 1.0) };

        let mut chart = ChartBuilder::on(&root)
            .margin(20)
            .build_cartesian_2d(steps, lo..hi)
            .map_err(plot_error)?;

        for (i, points) in series.into_iter().enumerate() {
            chart
                .draw_series(LineSeries::new(
                    points,
                    &SERIES_COLOURS[i % SERIES_COLOURS.len()],
                ))
                .map_err(plot_error)?;
        }
    }

    root.present().map_err(plot_error)?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    fn scratch(name: &str) -> std::path::PathBuf {
        std::env::temp_dir()
            .join(format!("neural-style-plot-{}", std::process::id()))
            .join(name)
    }

    fn contains_colour(img: &image::RgbImage, colour: RGBColor) -> bool {
        img.pixels()
            .any(|p| p.0 == [colour.0, colour.1, colour.2])
    }

    #[test]
    fn draws_decreasing_loss() {
        let path = scratch("loss.png");
        let history: Vec<f64> = (0..50).map(|i| 1e6 / f64::from(i + 1)).collect();

        save_loss_curve(&path, &history).unwrap();

        let img = image::open(&path).unwrap();
        assert_eq!(image::GenericImageView::dimensions(&img), PLOT_SIZE);
    }

    #[test]
    fn tolerates_degenerate_histories() {
        save_loss_curve(&scratch("empty.png"), &[]).unwrap();
        save_loss_curve(&scratch("flat.png"), &[3.0, 3.0, 3.0]).unwrap();
        save_loss_curve(&scratch("negative.png"), &[-2.0, 0.0, 4.5]).unwrap();
        save_loss_curve(&scratch("nan.png"), &[f64::NAN, 2.0, f64::INFINITY, 1.0]).unwrap();
        save_loss_curves(&scratch("none.png"), &[]).unwrap();
    }

    #[test]
    fn comparison_plot_colours_each_series() {
        let path = scratch("comparison.png");

        // the constant series are horizontal lines, drawn in their exact colour
        let spread = [1.0, 1000.0];
        let low = [10.0, 10.0];
        let high = [100.0, 100.0];
        save_loss_curves(&path, &[&spread[..], &low[..], &high[..]]).unwrap();

        let img = image::open(&path).unwrap().to_rgb();
        assert_eq!(img.dimensions(), PLOT_SIZE);
        assert!(contains_colour(&img, SERIES_COLOURS[1]));
        assert!(contains_colour(&img, SERIES_COLOURS[2]));
        assert!(!contains_colour(&img, SERIES_COLOURS[3]));
    }
}
