use crate::common::*;
use image::{Rgb, RgbImage};

pub mod colors {
    use image::Rgb;

    pub const WHITE: Rgb<u8> = Rgb([255, 255, 255]);
    pub const DARK_GRAY: Rgb<u8> = Rgb([30, 30, 30]);
    pub const LIGHT_GRAY: Rgb<u8> = Rgb([220, 220, 220]);
    pub const BLUE: Rgb<u8> = Rgb([33, 150, 243]);
    pub const ORANGE: Rgb<u8> = Rgb([255, 152, 0]);
    pub const GREEN: Rgb<u8> = Rgb([0, 200, 83]);
    pub const RED: Rgb<u8> = Rgb([255, 68, 68]);

    pub const PALETTE: [Rgb<u8>; 4] = [BLUE, ORANGE, GREEN, RED];
}

#[derive(Debug, Clone)]
pub struct PlotConfig {
    pub panel_width: u32,
    pub panel_height: u32,
    pub margin: u32,
    pub background: Rgb<u8>,
    pub axis: Rgb<u8>,
    pub grid: Rgb<u8>,
}

impl Default for PlotConfig {
    fn default() -> Self {
        Self {
            panel_width: 640,
            panel_height: 160,
            margin: 12,
            background: colors::WHITE,
            axis: colors::DARK_GRAY,
            grid: colors::LIGHT_GRAY,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Panel<'a> {
    pub series: Vec<&'a [f64]>,
    /// Fixed y range. The range of the data is used if absent.
    pub y_range: Option<(f64, f64)>,
}

impl<'a> Panel<'a> {
    pub fn new(series: Vec<&'a [f64]>) -> Self {
        Self {
            series,
            y_range: None,
        }
    }

    pub fn with_range(series: Vec<&'a [f64]>, min: f64, max: f64) -> Self {
        Self {
            series,
            y_range: Some((min, max)),
        }
    }
}

pub fn render_panels(config: &PlotConfig, panels: &[Panel<'_>]) -> RgbImage {
    let PlotConfig {
        panel_width,
        panel_height,
        margin,
        background,
        axis,
        grid,
    } = *config;
    let num_panels = panels.len().max(1) as u32;
    let mut image = RgbImage::from_pixel(panel_width, panel_height * num_panels, background);

    for (index, panel) in panels.iter().enumerate() {
        let top = index as u32 * panel_height;
        let frame = Frame {
            left: margin as i64,
            right: (panel_width - margin) as i64,
            top: (top + margin) as i64,
            bottom: (top + panel_height - margin) as i64,
        };

        // horizontal grid lines at quarters
        for quarter in 1..4 {
            let y = frame.top + (frame.bottom - frame.top) * quarter / 4;
            draw_line(&mut image, (frame.left, y), (frame.right, y), grid);
        }
        frame.draw_box(&mut image, axis);

        let num_steps = panel.series.iter().map(|series| series.len()).max().unwrap_or(0);
        let (y_min, y_max) = match panel.y_range {
            Some(range) => range,
            None => data_range(&panel.series),
        };

        for (series, &color) in panel.series.iter().zip(colors::PALETTE.iter().cycle()) {
            let points: Vec<_> = series
                .iter()
                .enumerate()
                .filter(|(_, value)| value.is_finite())
                .map(|(step, &value)| frame.project(step, num_steps, value, y_min, y_max))
                .collect();

            match points.as_slice() {
                [] => {}
                [point] => put_pixel(&mut image, *point, color),
                _ => points
                    .iter()
                    .tuple_windows()
                    .for_each(|(&from, &to)| draw_line(&mut image, from, to, color)),
            }
        }
    }

    image
}

pub fn save_plot(image: &RgbImage, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    image
        .save(path)
        .with_context(|| format!("unable to save plot '{}'", path.display()))?;
    Ok(())
}

#[derive(Debug, Clone, Copy)]
struct Frame {
    left: i64,
    right: i64,
    top: i64,
    bottom: i64,
}

impl Frame {
    fn draw_box(&self, image: &mut RgbImage, color: Rgb<u8>) {
        let Self {
            left,
            right,
            top,
            bottom,
        } = *self;
        draw_line(image, (left, top), (right, top), color);
        draw_line(image, (left, bottom), (right, bottom), color);
        draw_line(image, (left, top), (left, bottom), color);
        draw_line(image, (right, top), (right, bottom), color);
    }

    fn project(&self, step: usize, num_steps: usize, value: f64, y_min: f64, y_max: f64) -> (i64, i64) {
        let width = (self.right - self.left) as f64;
        let height = (self.bottom - self.top) as f64;

        let x_ratio = if num_steps > 1 {
            step as f64 / (num_steps - 1) as f64
        } else {
            0.5
        };
        let y_ratio = if y_max > y_min {
            ((value - y_min) / (y_max - y_min)).clamp(0.0, 1.0)
        } else {
            0.5
        };

        let x = self.left + (x_ratio * width).round() as i64;
        let y = self.bottom - (y_ratio * height).round() as i64;
        (x, y)
    }
}

fn data_range(series: &[&[f64]]) -> (f64, f64) {
    let (min, max) = series
        .iter()
        .flat_map(|series| series.iter().copied())
        .filter(|value| value.is_finite())
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(min, max), value| {
            (min.min(value), max.max(value))
        });

    if min.is_finite() {
        (min, max)
    } else {
        (0.0, 1.0)
    }
}

fn put_pixel(image: &mut RgbImage, (x, y): (i64, i64), color: Rgb<u8>) {
    if (0..image.width() as i64).contains(&x) && (0..image.height() as i64).contains(&y) {
        image.put_pixel(x as u32, y as u32, color);
    }
}

fn draw_line(image: &mut RgbImage, from: (i64, i64), to: (i64, i64), color: Rgb<u8>) {
    let (mut x, mut y) = from;
    let (x1, y1) = to;
    let dx = (x1 - x).abs();
    let dy = -(y1 - y).abs();
    let sx = if x < x1 { 1 } else { -1 };
    let sy = if y < y1 { 1 } else { -1 };
    let mut err = dx + dy;

    loop {
        put_pixel(image, (x, y), color);
        if x == x1 && y == y1 {
            break;
        }
        let e2 = 2 * err;
        if e2 >= dy {
            err += dy;
            x += sx;
        }
        if e2 <= dx {
            err += dx;
            y += sy;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_panels_test() {
        let config = PlotConfig::default();
        let losses = [3.0, 2.0, 1.5, 1.0];
        let accuracy = [0.5, 0.75, 1.0, 1.0];
        let image = render_panels(
            &config,
            &[
                Panel::new(vec![&losses]),
                Panel::with_range(vec![&accuracy], 0.0, 1.0),
            ],
        );

        assert_eq!(image.width(), config.panel_width);
        assert_eq!(image.height(), config.panel_height * 2);

        // the first point of the first series sits at the top-left corner
        let corner = image.get_pixel(config.margin, config.margin);
        assert_eq!(*corner, colors::BLUE);

        // accuracy 1.0 is drawn on the top edge of the second panel
        let right = config.panel_width - config.margin;
        let top = config.panel_height + config.margin;
        assert_eq!(*image.get_pixel(right, top), colors::BLUE);
    }

    #[test]
    fn empty_and_constant_series_test() {
        let config = PlotConfig::default();
        let constant = [1.0, 1.0];
        let image = render_panels(
            &config,
            &[Panel::new(vec![]), Panel::new(vec![&constant, &[]])],
        );
        assert_eq!(image.height(), config.panel_height * 2);
    }
}
