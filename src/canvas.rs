// src/canvas.rs

use crate::config::CanvasSize;
use crate::source::Pixels;
use image::imageops::{self, FilterType};
use image::RgbImage;

/// Placement of a scaled frame inside the canvas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub width: u32,
    pub height: u32,
    pub x: u32,
    pub y: u32,
}

/// Largest aspect-preserving size that fits the canvas, centred.
pub fn placement(canvas: CanvasSize, frame_width: u32, frame_height: u32) -> Placement {
    let (cw, ch) = (canvas.width.max(1), canvas.height.max(1));
    if frame_width == 0 || frame_height == 0 {
        return Placement { width: cw, height: ch, x: 0, y: 0 };
    }
    // scale = min(cw/fw, ch/fh), kept in integers so the limiting side is exact
    let (fw, fh) = (u64::from(frame_width), u64::from(frame_height));
    let (width, height) = if u64::from(cw) * fh <= u64::from(ch) * fw {
        (u64::from(cw), fh * u64::from(cw) / fw)
    } else {
        (fw * u64::from(ch) / fh, u64::from(ch))
    };
    let width = (width as u32).clamp(1, cw);
    let height = (height as u32).clamp(1, ch);
    Placement {
        width,
        height,
        x: (cw - width) / 2,
        y: (ch - height) / 2,
    }
}

/// Letterboxes a frame onto a black canvas of exactly `canvas` size.
///
/// The output size never depends on the input, so a presentation surface
/// sized from it cannot grow from frame to frame.
pub fn fit_to_canvas(pixels: &Pixels, canvas: CanvasSize) -> RgbImage {
    let (cw, ch) = (canvas.width.max(1), canvas.height.max(1));
    let mut out = RgbImage::new(cw, ch);
    let (w, h) = pixels.dimensions();
    if w == 0 || h == 0 {
        return out;
    }
    let place = placement(canvas, w, h);
    let rgb = pixels.to_rgb();
    let scaled = if (place.width, place.height) == (w, h) {
        rgb
    } else {
        imageops::resize(&rgb, place.width, place.height, FilterType::Triangle)
    };
    imageops::replace(&mut out, &scaled, i64::from(place.x), i64::from(place.y));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma, Rgb};

    #[test]
    fn wide_frame_is_letterboxed_vertically() {
        let p = placement(CanvasSize::new(500, 400), 1920, 1080);
        assert_eq!((p.width, p.height), (500, 281));
        assert_eq!((p.x, p.y), (0, 59));
    }

    #[test]
    fn tall_frame_is_pillarboxed() {
        let p = placement(CanvasSize::new(500, 400), 400, 800);
        assert_eq!((p.width, p.height), (200, 400));
        assert_eq!((p.x, p.y), (150, 0));
    }

    #[test]
    fn tiny_scaled_dimension_clamps_to_one() {
        let p = placement(CanvasSize::new(10, 10), 10_000, 1);
        assert_eq!((p.width, p.height), (10, 1));
    }

    #[test]
    fn output_is_always_canvas_sized_with_black_borders() {
        let canvas = CanvasSize::new(40, 30);
        for (w, h) in [(16, 9), (9, 16), (40, 30), (3, 200), (1000, 1000)] {
            let frame = Pixels::Rgb(RgbImage::from_pixel(w, h, Rgb([200, 200, 200])));
            let out = fit_to_canvas(&frame, canvas);
            assert_eq!(out.dimensions(), (40, 30), "input {}x{}", w, h);
        }

        let frame = Pixels::Luma(GrayImage::from_pixel(16, 9, Luma([255])));
        let out = fit_to_canvas(&frame, canvas);
        assert_eq!(*out.get_pixel(0, 0), Rgb([0, 0, 0]));
        assert_eq!(*out.get_pixel(20, 15), Rgb([255, 255, 255]));
    }
}
