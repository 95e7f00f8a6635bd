//! PNG quicklooks of raster outputs.
//!
//! Data cells are stretched linearly between the raster's minimum and
//! maximum onto gray levels 0-255; no-data cells are fully transparent.

use std::path::Path;

use floodline_pipeline::{CellValue, Raster};
use image::ImageEncoder;

use crate::StageError;
use crate::runner::write_atomic;

/// Encode `raster` as a gray-plus-alpha PNG.
///
/// # Errors
///
/// Returns [`image::ImageError`] if PNG encoding fails.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
pub fn encode_preview<T: CellValue>(raster: &Raster<T>) -> Result<Vec<u8>, image::ImageError> {
    let (lo, hi) = raster
        .iter_data()
        .map(|(_, _, v)| v.to_f64())
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
            (lo.min(v), hi.max(v))
        });
    let span = if hi > lo { hi - lo } else { 1.0 };

    let mut pixels = Vec::with_capacity(raster.rows() * raster.cols() * 2);
    for row in 0..raster.rows() {
        for col in 0..raster.cols() {
            match raster.get(row, col) {
                Some(v) => {
                    let level = ((v.to_f64() - lo) / span * 255.0).round().clamp(0.0, 255.0);
                    pixels.extend([level as u8, u8::MAX]);
                }
                None => pixels.extend([0, 0]),
            }
        }
    }

    let mut png = Vec::new();
    image::codecs::png::PngEncoder::new(&mut png).write_image(
        &pixels,
        raster.cols() as u32,
        raster.rows() as u32,
        image::ExtendedColorType::La8,
    )?;
    Ok(png)
}

/// Write a quicklook of `raster` to `path`.
///
/// # Errors
///
/// Returns [`StageError::Preview`] if encoding fails and
/// [`StageError::Io`] if the file cannot be written.
pub fn write_preview<T: CellValue>(path: &Path, raster: &Raster<T>) -> Result<(), StageError> {
    let png = encode_preview(raster)?;
    write_atomic(path, &png)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use floodline_pipeline::{GeoTransform, GridSpec};

    use super::*;

    #[test]
    fn stretch_and_transparency() {
        let grid = GridSpec {
            transform: GeoTransform::new(0.0, 2.0, 1.0),
            rows: 2,
            cols: 2,
        };
        let mut raster = Raster::filled(grid, 10_i32, Some(-1));
        raster.set(0, 1, 20);
        raster.clear(1, 1);
        let png = encode_preview(&raster).unwrap();
        assert_eq!(&png[1..4], b"PNG");

        let decoded = image::load_from_memory(&png).unwrap().to_luma_alpha8();
        assert_eq!(decoded.get_pixel(0, 0).0, [0, 255]);
        assert_eq!(decoded.get_pixel(1, 0).0, [255, 255]);
        assert_eq!(decoded.get_pixel(1, 1).0[1], 0);
    }

    #[test]
    fn constant_raster_is_black() {
        let grid = GridSpec {
            transform: GeoTransform::new(0.0, 1.0, 1.0),
            rows: 1,
            cols: 3,
        };
        let png = encode_preview(&Raster::filled(grid, 1_u8, None)).unwrap();
        let decoded = image::load_from_memory(&png).unwrap().to_luma_alpha8();
        assert!(decoded.pixels().all(|p| p.0 == [0, 255]));
    }
}
