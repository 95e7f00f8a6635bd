//! Georeferenced raster grids.
//!
//! A [`Raster`] is an `ndarray` grid of cell values plus a north-up
//! [`GeoTransform`] and an optional no-data sentinel. Rows run north to
//! south, columns west to east, and cell `(row, col)` covers the square
//! whose top-left corner is `origin + (col, row) * cell`.
//!
//! Floating point rasters additionally treat `NaN` as no-data.

use geo::{Coord, Rect, coord};
use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::types::PipelineError;

/// Relative tolerance used when comparing grid geometry.
const GRID_EPSILON: f64 = 1e-6;

/// Storage type of a raster's cells, preserved through I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueKind {
    /// Unsigned 8-bit integer.
    U8,
    /// Unsigned 32-bit integer.
    U32,
    /// Signed 32-bit integer.
    I32,
    /// 32-bit float.
    F32,
    /// 64-bit float.
    F64,
}

/// A value that can be stored in a [`Raster`] cell.
pub trait CellValue: Copy + PartialEq + PartialOrd + Default + std::fmt::Debug + Send + Sync {
    /// Storage kind written to disk for this type.
    const KIND: ValueKind;

    /// Widen to `f64` for arithmetic.
    fn to_f64(self) -> f64;

    /// Narrow from `f64`, rounding and saturating for integer types.
    fn from_f64(value: f64) -> Self;

    /// `true` for `NaN` float values.
    fn is_nan(self) -> bool {
        false
    }
}

macro_rules! impl_integer_cell {
    ($t:ty, $kind:ident) => {
        impl CellValue for $t {
            const KIND: ValueKind = ValueKind::$kind;

            fn to_f64(self) -> f64 {
                f64::from(self)
            }

            #[allow(
                clippy::cast_possible_truncation,
                clippy::cast_sign_loss,
                clippy::cast_lossless
            )]
            fn from_f64(value: f64) -> Self {
                value.round() as $t
            }
        }
    };
}

impl_integer_cell!(u8, U8);
impl_integer_cell!(u32, U32);
impl_integer_cell!(i32, I32);

impl CellValue for f32 {
    const KIND: ValueKind = ValueKind::F32;

    fn to_f64(self) -> f64 {
        f64::from(self)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn from_f64(value: f64) -> Self {
        value as Self
    }

    fn is_nan(self) -> bool {
        self.is_nan()
    }
}

impl CellValue for f64 {
    const KIND: ValueKind = ValueKind::F64;

    fn to_f64(self) -> f64 {
        self
    }

    fn from_f64(value: f64) -> Self {
        value
    }

    fn is_nan(self) -> bool {
        self.is_nan()
    }
}

/// North-up affine transform from cell indices to map coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform {
    /// X coordinate of the top-left corner of the grid.
    pub origin_x: f64,
    /// Y coordinate of the top-left corner of the grid.
    pub origin_y: f64,
    /// Cell width in map units (positive).
    pub cell_width: f64,
    /// Cell height in map units (negative for north-up grids).
    pub cell_height: f64,
}

impl GeoTransform {
    /// Create a transform from an origin and square cell size.
    #[must_use]
    pub const fn new(origin_x: f64, origin_y: f64, cell_size: f64) -> Self {
        Self {
            origin_x,
            origin_y,
            cell_width: cell_size,
            cell_height: -cell_size,
        }
    }

    /// Cell size along x (map units).
    #[must_use]
    pub const fn cell_size(&self) -> f64 {
        self.cell_width.abs()
    }

    /// Area of one cell (square map units).
    #[must_use]
    pub const fn cell_area(&self) -> f64 {
        (self.cell_width * self.cell_height).abs()
    }

    /// Map coordinate of a grid corner, `col` and `row` in corner indices.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn corner(&self, col: usize, row: usize) -> Coord<f64> {
        coord! {
            x: (col as f64).mul_add(self.cell_width, self.origin_x),
            y: (row as f64).mul_add(self.cell_height, self.origin_y),
        }
    }

    /// Map coordinate of a cell center.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn cell_center(&self, row: usize, col: usize) -> Coord<f64> {
        coord! {
            x: (col as f64 + 0.5).mul_add(self.cell_width, self.origin_x),
            y: (row as f64 + 0.5).mul_add(self.cell_height, self.origin_y),
        }
    }

    /// Fractional `(row, col)` position of a map coordinate.
    #[must_use]
    pub fn fractional_index(&self, point: Coord<f64>) -> (f64, f64) {
        (
            (point.y - self.origin_y) / self.cell_height,
            (point.x - self.origin_x) / self.cell_width,
        )
    }

    /// Whether two transforms describe the same lattice.
    #[must_use]
    pub fn approx_eq(&self, other: &Self) -> bool {
        let tol = GRID_EPSILON * self.cell_size().max(1.0);
        (self.origin_x - other.origin_x).abs() <= tol
            && (self.origin_y - other.origin_y).abs() <= tol
            && (self.cell_width - other.cell_width).abs() <= tol
            && (self.cell_height - other.cell_height).abs() <= tol
    }
}

/// Shape and placement of a grid without its values.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GridSpec {
    /// Transform of the top-left corner.
    pub transform: GeoTransform,
    /// Number of rows.
    pub rows: usize,
    /// Number of columns.
    pub cols: usize,
}

impl GridSpec {
    /// The smallest grid with the given cell size, aligned to `snap`'s
    /// lattice, that covers `bounds`.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Config`] if `cell_size` is not a positive
    /// finite number.
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    pub fn covering(
        bounds: Rect<f64>,
        cell_size: f64,
        snap: &GeoTransform,
    ) -> Result<Self, PipelineError> {
        if !(cell_size.is_finite() && cell_size > 0.0) {
            return Err(PipelineError::Config(format!(
                "cell size must be positive, got {cell_size}"
            )));
        }
        let cols_left = ((bounds.min().x - snap.origin_x) / cell_size + GRID_EPSILON).floor();
        let rows_down = ((snap.origin_y - bounds.max().y) / cell_size + GRID_EPSILON).floor();
        let origin_x = cols_left.mul_add(cell_size, snap.origin_x);
        let origin_y = (-rows_down).mul_add(cell_size, snap.origin_y);
        let cols = ((bounds.max().x - origin_x) / cell_size - GRID_EPSILON)
            .ceil()
            .max(1.0) as usize;
        let rows = ((origin_y - bounds.min().y) / cell_size - GRID_EPSILON)
            .ceil()
            .max(1.0) as usize;
        Ok(Self {
            transform: GeoTransform::new(origin_x, origin_y, cell_size),
            rows,
            cols,
        })
    }

    /// Map-space extent of the grid.
    #[must_use]
    pub fn bounds(&self) -> Rect<f64> {
        Rect::new(
            self.transform.corner(0, self.rows),
            self.transform.corner(self.cols, 0),
        )
    }

    /// Cell containing `point`, if it falls inside the grid.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn cell_of(&self, point: Coord<f64>) -> Option<(usize, usize)> {
        let (r, c) = self.transform.fractional_index(point);
        if !(r.is_finite() && c.is_finite()) || r < 0.0 || c < 0.0 {
            return None;
        }
        let (row, col) = (r.floor() as usize, c.floor() as usize);
        (row < self.rows && col < self.cols).then_some((row, col))
    }

    /// Inclusive cell range `(row0, row1, col0, col1)` whose cells
    /// intersect `rect`, clipped to the grid. `None` when disjoint.
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    pub fn window(&self, rect: Rect<f64>) -> Option<(usize, usize, usize, usize)> {
        let t = &self.transform;
        let (r_top, c_left) = t.fractional_index(coord! { x: rect.min().x, y: rect.max().y });
        let (r_bottom, c_right) = t.fractional_index(coord! { x: rect.max().x, y: rect.min().y });
        let row0 = r_top.min(r_bottom).floor().max(0.0);
        let row1 = r_top.max(r_bottom).floor().min(self.rows as f64 - 1.0);
        let col0 = c_left.min(c_right).floor().max(0.0);
        let col1 = c_left.max(c_right).floor().min(self.cols as f64 - 1.0);
        if row0 > row1 || col0 > col1 {
            return None;
        }
        Some((row0 as usize, row1 as usize, col0 as usize, col1 as usize))
    }

    /// Whether two grids share shape and lattice.
    #[must_use]
    pub fn approx_eq(&self, other: &Self) -> bool {
        self.rows == other.rows && self.cols == other.cols && self.transform.approx_eq(&other.transform)
    }
}

/// A georeferenced single-band grid.
#[derive(Debug, Clone, PartialEq)]
pub struct Raster<T> {
    data: Array2<T>,
    transform: GeoTransform,
    nodata: Option<T>,
}

impl<T: CellValue> Raster<T> {
    /// A raster covering `grid` with every cell set to `value`.
    #[must_use]
    pub fn filled(grid: GridSpec, value: T, nodata: Option<T>) -> Self {
        Self {
            data: Array2::from_elem((grid.rows, grid.cols), value),
            transform: grid.transform,
            nodata,
        }
    }

    /// A raster covering `grid` with every cell set to `nodata`.
    #[must_use]
    pub fn empty(grid: GridSpec, nodata: T) -> Self {
        Self::filled(grid, nodata, Some(nodata))
    }

    /// Wrap an existing array.
    #[must_use]
    pub const fn from_array(data: Array2<T>, transform: GeoTransform, nodata: Option<T>) -> Self {
        Self {
            data,
            transform,
            nodata,
        }
    }

    /// Build from row-major values.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Engine`] if `values.len() != rows * cols`.
    pub fn from_vec(
        rows: usize,
        cols: usize,
        values: Vec<T>,
        transform: GeoTransform,
        nodata: Option<T>,
    ) -> Result<Self, PipelineError> {
        let len = values.len();
        let data = Array2::from_shape_vec((rows, cols), values).map_err(|_| {
            PipelineError::Engine(format!("{len} values do not fill a {rows}x{cols} grid"))
        })?;
        Ok(Self::from_array(data, transform, nodata))
    }

    /// Number of rows.
    #[must_use]
    pub fn rows(&self) -> usize {
        self.data.nrows()
    }

    /// Number of columns.
    #[must_use]
    pub fn cols(&self) -> usize {
        self.data.ncols()
    }

    /// Shape and placement.
    #[must_use]
    pub fn grid(&self) -> GridSpec {
        GridSpec {
            transform: self.transform,
            rows: self.rows(),
            cols: self.cols(),
        }
    }

    /// Transform of the top-left corner.
    #[must_use]
    pub const fn transform(&self) -> &GeoTransform {
        &self.transform
    }

    /// Cell size in map units.
    #[must_use]
    pub const fn cell_size(&self) -> f64 {
        self.transform.cell_size()
    }

    /// The no-data sentinel, if any.
    #[must_use]
    pub const fn nodata(&self) -> Option<T> {
        self.nodata
    }

    /// Underlying cell array, no-data sentinels included.
    #[must_use]
    pub const fn data(&self) -> &Array2<T> {
        &self.data
    }

    /// Whether `value` is the no-data sentinel (or `NaN`).
    #[must_use]
    pub fn is_nodata_value(&self, value: T) -> bool {
        value.is_nan() || self.nodata.is_some_and(|nd| nd == value)
    }

    /// Cell value, or `None` for no-data and out-of-range indices.
    #[must_use]
    pub fn get(&self, row: usize, col: usize) -> Option<T> {
        let value = *self.data.get((row, col))?;
        (!self.is_nodata_value(value)).then_some(value)
    }

    /// Whether the cell holds data.
    #[must_use]
    pub fn is_data(&self, row: usize, col: usize) -> bool {
        self.get(row, col).is_some()
    }

    /// Overwrite a cell. Out-of-range indices are ignored.
    pub fn set(&mut self, row: usize, col: usize, value: T) {
        if let Some(cell) = self.data.get_mut((row, col)) {
            *cell = value;
        }
    }

    /// Mark a cell as no-data. Requires a sentinel.
    pub fn clear(&mut self, row: usize, col: usize) {
        if let Some(nd) = self.nodata {
            self.set(row, col, nd);
        }
    }

    /// Value of the cell containing `point`.
    #[must_use]
    pub fn value_at(&self, point: Coord<f64>) -> Option<T> {
        let (row, col) = self.grid().cell_of(point)?;
        self.get(row, col)
    }

    /// Map-space center of a cell.
    #[must_use]
    pub fn cell_center(&self, row: usize, col: usize) -> Coord<f64> {
        self.transform.cell_center(row, col)
    }

    /// Number of data cells.
    #[must_use]
    pub fn data_count(&self) -> usize {
        self.data.iter().filter(|v| !self.is_nodata_value(**v)).count()
    }

    /// Iterate `(row, col, value)` over data cells in row-major order.
    pub fn iter_data(&self) -> impl Iterator<Item = (usize, usize, T)> + '_ {
        self.data
            .indexed_iter()
            .filter(|(_, v)| !self.is_nodata_value(**v))
            .map(|((r, c), v)| (r, c, *v))
    }

    /// Apply `f` to every data cell; `None` results become `nodata`.
    #[must_use]
    pub fn map<U: CellValue>(&self, nodata: U, f: impl Fn(T) -> Option<U>) -> Raster<U> {
        let data = self.data.mapv(|v| {
            if self.is_nodata_value(v) {
                nodata
            } else {
                f(v).unwrap_or(nodata)
            }
        });
        Raster::from_array(data, self.transform, Some(nodata))
    }

    /// Sample this raster onto another grid (nearest cell by cell center).
    #[must_use]
    pub fn resample_to(&self, grid: &GridSpec, nodata: T) -> Self {
        if grid.approx_eq(&self.grid()) {
            let mut out = self.clone();
            out.replace_nodata(nodata);
            return out;
        }
        let mut out = Self::empty(*grid, nodata);
        for ((row, col), cell) in out.data.indexed_iter_mut() {
            if let Some(v) = self.value_at(grid.transform.cell_center(row, col)) {
                *cell = v;
            }
        }
        out
    }

    /// Rewrite no-data cells to a new sentinel.
    pub fn replace_nodata(&mut self, nodata: T) {
        let old = self.nodata;
        for v in &mut self.data {
            if v.is_nan() || old.is_some_and(|nd| nd == *v) {
                *v = nodata;
            }
        }
        self.nodata = Some(nodata);
    }

    /// Keep only cells where `mask` (on the same grid) holds data.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Config`] if the grids differ.
    pub fn extract_by_mask<M: CellValue>(&self, mask: &Raster<M>) -> Result<Self, PipelineError> {
        ensure_same_grid(&self.grid(), &mask.grid(), "mask")?;
        let nodata = self.nodata.ok_or_else(|| {
            PipelineError::Engine("extract by mask needs a no-data sentinel".to_string())
        })?;
        let mut out = self.clone();
        for ((row, col), cell) in out.data.indexed_iter_mut() {
            if !mask.is_data(row, col) {
                *cell = nodata;
            }
        }
        Ok(out)
    }

    /// Crop to the bounding window of the data cells. `None` if there are
    /// no data cells.
    #[must_use]
    pub fn crop_to_data(&self) -> Option<Self> {
        let (mut r0, mut r1, mut c0, mut c1) = (usize::MAX, 0, usize::MAX, 0);
        for (r, c, _) in self.iter_data() {
            r0 = r0.min(r);
            r1 = r1.max(r);
            c0 = c0.min(c);
            c1 = c1.max(c);
        }
        if r0 == usize::MAX {
            return None;
        }
        let data = self
            .data
            .slice(ndarray::s![r0..=r1, c0..=c1])
            .to_owned();
        let corner = self.transform.corner(c0, r0);
        let transform = GeoTransform {
            origin_x: corner.x,
            origin_y: corner.y,
            ..self.transform
        };
        Some(Self::from_array(data, transform, self.nodata))
    }
}

/// Fail with a configuration error when two grids do not line up.
///
/// # Errors
///
/// Returns [`PipelineError::Config`] naming `what` if the grids differ.
pub fn ensure_same_grid(expected: &GridSpec, found: &GridSpec, what: &str) -> Result<(), PipelineError> {
    if expected.approx_eq(found) {
        Ok(())
    } else {
        Err(PipelineError::Config(format!(
            "{what} grid {}x{} at ({}, {}) does not match {}x{} at ({}, {})",
            found.rows,
            found.cols,
            found.transform.origin_x,
            found.transform.origin_y,
            expected.rows,
            expected.cols,
            expected.transform.origin_x,
            expected.transform.origin_y,
        )))
    }
}
