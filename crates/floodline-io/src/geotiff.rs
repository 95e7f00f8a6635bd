//! Single-band GeoTIFF reading and writing.
//!
//! Georeferencing uses the `ModelPixelScale` and `ModelTiepoint` tags
//! (north-up grids only), the coordinate system is the EPSG code of the
//! `GeoKeyDirectory`, and no-data is the GDAL ASCII `GDAL_NODATA` tag.
//! Cell values are converted into the requested [`CellValue`] type on
//! read and stored in that type's native sample format on write.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, Write};
use std::path::Path;

use floodline_pipeline::{CellValue, GeoTransform, Raster, ValueKind};
use tiff::TiffResult;
use tiff::decoder::{Decoder, DecodingResult, Limits};
use tiff::encoder::colortype::{ColorType, Gray8, Gray32, Gray32Float, Gray64Float, GrayI32};
use tiff::encoder::{TiffEncoder, TiffValue};
use tiff::tags::Tag;

use crate::StageError;

const GT_MODEL_TYPE: u16 = 1024;
const GT_RASTER_TYPE: u16 = 1025;
const GEOGRAPHIC_TYPE: u16 = 2048;
const PROJECTED_CS_TYPE: u16 = 3072;

const MODEL_PROJECTED: u16 = 1;
const MODEL_GEOGRAPHIC: u16 = 2;
const RASTER_PIXEL_IS_AREA: u16 = 1;

/// Metadata carried next to the cell values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GeoTiffMetadata {
    /// EPSG code of the coordinate reference system.
    pub epsg: Option<u32>,
}

/// Read a GeoTIFF from `path`.
///
/// # Errors
///
/// Returns [`StageError::Io`] if the file cannot be opened,
/// [`StageError::Tiff`] if it cannot be decoded and
/// [`StageError::Format`] if it lacks georeferencing.
pub fn read_geotiff<T: CellValue>(path: &Path) -> Result<(Raster<T>, GeoTiffMetadata), StageError> {
    let file = File::open(path).map_err(|e| StageError::io(path, e))?;
    decode(BufReader::new(file)).map_err(|e| e.at(path))
}

/// Write `raster` to `path` in its native sample format.
///
/// # Errors
///
/// Returns [`StageError::Io`] if the file cannot be created and
/// [`StageError::Tiff`] if encoding fails.
pub fn write_geotiff<T: CellValue>(
    path: &Path,
    raster: &Raster<T>,
    metadata: &GeoTiffMetadata,
) -> Result<(), StageError> {
    let file = File::create(path).map_err(|e| StageError::io(path, e))?;
    let mut writer = BufWriter::new(file);
    encode(&mut writer, raster, metadata).map_err(|e| StageError::Tiff {
        path: path.to_path_buf(),
        source: e,
    })?;
    writer.flush().map_err(|e| StageError::io(path, e))
}

enum DecodeError {
    Tiff(tiff::TiffError),
    Format(String),
}

impl From<tiff::TiffError> for DecodeError {
    fn from(e: tiff::TiffError) -> Self {
        Self::Tiff(e)
    }
}

impl DecodeError {
    fn at(self, path: &Path) -> StageError {
        match self {
            Self::Tiff(source) => StageError::Tiff {
                path: path.to_path_buf(),
                source,
            },
            Self::Format(message) => StageError::Format {
                path: path.to_path_buf(),
                message,
            },
        }
    }
}

#[allow(clippy::cast_precision_loss)]
fn decode<T: CellValue, R: Read + Seek>(
    reader: R,
) -> Result<(Raster<T>, GeoTiffMetadata), DecodeError> {
    let mut decoder = Decoder::new(reader)?.with_limits(Limits::unlimited());
    let (width, height) = decoder.dimensions()?;
    let transform = read_transform(&mut decoder)?;
    let nodata = read_nodata::<T, R>(&mut decoder)?;
    let epsg = read_epsg(&mut decoder)?;

    let values: Vec<f64> = match decoder.read_image()? {
        DecodingResult::U8(buf) => buf.into_iter().map(f64::from).collect(),
        DecodingResult::U16(buf) => buf.into_iter().map(f64::from).collect(),
        DecodingResult::U32(buf) => buf.into_iter().map(f64::from).collect(),
        DecodingResult::U64(buf) => buf.into_iter().map(|v| v as f64).collect(),
        DecodingResult::I8(buf) => buf.into_iter().map(f64::from).collect(),
        DecodingResult::I16(buf) => buf.into_iter().map(f64::from).collect(),
        DecodingResult::I32(buf) => buf.into_iter().map(f64::from).collect(),
        DecodingResult::I64(buf) => buf.into_iter().map(|v| v as f64).collect(),
        DecodingResult::F32(buf) => buf.into_iter().map(f64::from).collect(),
        DecodingResult::F64(buf) => buf,
        #[allow(unreachable_patterns)]
        _ => return Err(DecodeError::Format("unsupported sample format".to_string())),
    };
    let values = values.into_iter().map(T::from_f64).collect();
    let raster = Raster::from_vec(height as usize, width as usize, values, transform, nodata)
        .map_err(|e| DecodeError::Format(e.to_string()))?;
    Ok((raster, GeoTiffMetadata { epsg }))
}

fn read_transform<R: Read + Seek>(decoder: &mut Decoder<R>) -> Result<GeoTransform, DecodeError> {
    let scale = match decoder.find_tag(Tag::ModelPixelScaleTag)? {
        Some(value) => value.into_f64_vec()?,
        None => return Err(DecodeError::Format("missing ModelPixelScale tag".to_string())),
    };
    let tiepoint = match decoder.find_tag(Tag::ModelTiepointTag)? {
        Some(value) => value.into_f64_vec()?,
        None => return Err(DecodeError::Format("missing ModelTiepoint tag".to_string())),
    };
    if scale.len() < 2 || tiepoint.len() < 6 {
        return Err(DecodeError::Format(format!(
            "malformed georeference: scale {scale:?}, tiepoint {tiepoint:?}"
        )));
    }
    let (sx, sy) = (scale[0], scale[1]);
    if !(sx > 0.0 && sy > 0.0) {
        return Err(DecodeError::Format(format!(
            "pixel scale must be positive, got ({sx}, {sy})"
        )));
    }
    // Tiepoint maps raster (I, J) to model (X, Y).
    Ok(GeoTransform {
        origin_x: tiepoint[0].mul_add(-sx, tiepoint[3]),
        origin_y: tiepoint[1].mul_add(sy, tiepoint[4]),
        cell_width: sx,
        cell_height: -sy,
    })
}

fn read_nodata<T: CellValue, R: Read + Seek>(
    decoder: &mut Decoder<R>,
) -> Result<Option<T>, DecodeError> {
    let Some(value) = decoder.find_tag(Tag::GdalNodata)? else {
        return Ok(None);
    };
    let text = value.into_string()?;
    let text = text.trim_matches(char::from(0)).trim();
    text.parse::<f64>()
        .map(|v| Some(T::from_f64(v)))
        .map_err(|_| DecodeError::Format(format!("unparsable GDAL_NODATA {text:?}")))
}

fn read_epsg<R: Read + Seek>(decoder: &mut Decoder<R>) -> Result<Option<u32>, DecodeError> {
    let Some(value) = decoder.find_tag(Tag::GeoKeyDirectoryTag)? else {
        return Ok(None);
    };
    let keys = value.into_u16_vec()?;
    // Header (version, revision, minor, count), then (key, location, count, value).
    Ok(keys
        .get(4..)
        .unwrap_or_default()
        .chunks_exact(4)
        .find(|entry| {
            matches!(entry[0], PROJECTED_CS_TYPE | GEOGRAPHIC_TYPE) && entry[1] == 0
        })
        .map(|entry| u32::from(entry[3])))
}

fn geokeys(epsg: Option<u32>) -> Vec<u16> {
    let epsg = epsg.and_then(|code| u16::try_from(code).ok());
    let geographic = epsg.is_some_and(|code| (4000..5000).contains(&code));
    let model = if geographic {
        MODEL_GEOGRAPHIC
    } else {
        MODEL_PROJECTED
    };
    let mut keys = vec![
        GT_MODEL_TYPE,
        0,
        1,
        model,
        GT_RASTER_TYPE,
        0,
        1,
        RASTER_PIXEL_IS_AREA,
    ];
    if let Some(code) = epsg {
        let key = if geographic {
            GEOGRAPHIC_TYPE
        } else {
            PROJECTED_CS_TYPE
        };
        keys.extend([key, 0, 1, code]);
    }
    let count = u16::try_from(keys.len() / 4).unwrap_or(u16::MAX);
    let mut directory = vec![1, 1, 0, count];
    directory.extend(keys);
    directory
}

fn encode<T: CellValue, W: Write + Seek>(
    writer: W,
    raster: &Raster<T>,
    metadata: &GeoTiffMetadata,
) -> TiffResult<()> {
    let mut encoder = TiffEncoder::new(writer)?;
    let values = || raster.data().iter().map(|v| v.to_f64());
    match T::KIND {
        ValueKind::U8 => {
            let data: Vec<u8> = values().map(u8::from_f64).collect();
            write_image::<Gray8, _, _>(&mut encoder, raster, metadata, &data)
        }
        ValueKind::U32 => {
            let data: Vec<u32> = values().map(u32::from_f64).collect();
            write_image::<Gray32, _, _>(&mut encoder, raster, metadata, &data)
        }
        ValueKind::I32 => {
            let data: Vec<i32> = values().map(i32::from_f64).collect();
            write_image::<GrayI32, _, _>(&mut encoder, raster, metadata, &data)
        }
        ValueKind::F32 => {
            let data: Vec<f32> = values().map(f32::from_f64).collect();
            write_image::<Gray32Float, _, _>(&mut encoder, raster, metadata, &data)
        }
        ValueKind::F64 => {
            let data: Vec<f64> = values().collect();
            write_image::<Gray64Float, _, _>(&mut encoder, raster, metadata, &data)
        }
    }
}

#[allow(clippy::cast_possible_truncation)]
fn write_image<C: ColorType, W: Write + Seek, T: CellValue>(
    encoder: &mut TiffEncoder<W>,
    raster: &Raster<T>,
    metadata: &GeoTiffMetadata,
    data: &[C::Inner],
) -> TiffResult<()>
where
    [C::Inner]: TiffValue,
{
    let transform = raster.transform();
    let mut image = encoder.new_image::<C>(raster.cols() as u32, raster.rows() as u32)?;
    let scale = [transform.cell_width, transform.cell_height.abs(), 0.0];
    let tiepoint = [0.0, 0.0, 0.0, transform.origin_x, transform.origin_y, 0.0];
    image
        .encoder()
        .write_tag(Tag::ModelPixelScaleTag, &scale[..])?;
    image
        .encoder()
        .write_tag(Tag::ModelTiepointTag, &tiepoint[..])?;
    image
        .encoder()
        .write_tag(Tag::GeoKeyDirectoryTag, &geokeys(metadata.epsg)[..])?;
    if let Some(nodata) = raster.nodata() {
        let text = nodata.to_f64().to_string();
        image.encoder().write_tag(Tag::GdalNodata, text.as_str())?;
    }
    image.write_data(data)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp)]
mod tests {
    use floodline_pipeline::GridSpec;

    use super::*;

    fn grid() -> GridSpec {
        GridSpec {
            transform: GeoTransform::new(500_000.0, 7_000_000.0, 30.0),
            rows: 3,
            cols: 4,
        }
    }

    fn round_trip<T: CellValue>(raster: &Raster<T>, epsg: Option<u32>) -> (Raster<T>, GeoTiffMetadata) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("r.tif");
        write_geotiff(&path, raster, &GeoTiffMetadata { epsg }).unwrap();
        read_geotiff(&path).unwrap()
    }

    #[test]
    fn integer_raster_keeps_values_grid_and_nodata() {
        let mut raster = Raster::filled(grid(), 7_i32, Some(i32::MIN));
        raster.set(1, 2, -3);
        raster.clear(0, 0);
        let (back, meta) = round_trip(&raster, Some(26910));
        assert_eq!(back, raster);
        assert_eq!(meta.epsg, Some(26910));
        assert!(!back.is_data(0, 0));
    }

    #[test]
    fn float_nan_nodata_survives() {
        let mut raster = Raster::filled(grid(), 1.5_f64, Some(f64::NAN));
        raster.clear(2, 3);
        let (back, meta) = round_trip(&raster, None);
        assert_eq!(meta.epsg, None);
        assert!(back.nodata().unwrap().is_nan());
        assert!(!back.is_data(2, 3));
        assert_eq!(back.get(1, 1), Some(1.5));
        assert!(back.transform().approx_eq(raster.transform()));
    }

    #[test]
    fn geographic_codes_use_geographic_key() {
        let keys = geokeys(Some(4326));
        assert_eq!(keys[3], 3);
        assert!(keys.chunks_exact(4).any(|e| e == [GEOGRAPHIC_TYPE, 0, 1, 4326]));
        assert!(keys.chunks_exact(4).any(|e| e == [GT_MODEL_TYPE, 0, 1, MODEL_GEOGRAPHIC]));
    }

    #[test]
    fn values_convert_to_requested_type() {
        let raster = Raster::filled(grid(), 2_u8, Some(255));
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mask.tif");
        write_geotiff(&path, &raster, &GeoTiffMetadata::default()).unwrap();
        let (wide, _) = read_geotiff::<f64>(&path).unwrap();
        assert_eq!(wide.get(2, 2), Some(2.0));
        assert_eq!(wide.nodata(), Some(255.0));
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = read_geotiff::<u8>(Path::new("/nonexistent/floodline.tif")).unwrap_err();
        assert!(matches!(err, StageError::Io { .. }), "{err}");
    }
}
