//! D8 hydrology on elevation rasters.
//!
//! - [`fill`]: priority-flood depression filling with a depth limit
//! - [`direction`]: D8 steepest-descent flow direction
//! - [`accumulation`]: upstream cell counts and the channel mask
//! - [`order`]: Strahler stream order over the channel mask
//!
//! Directions use the ESRI codes (E=1, SE=2, S=4, SW=8, W=16, NW=32,
//! N=64, NE=128). The neighbour arrays below are in that order, which is
//! also the tie-break priority for equal drops.

pub mod accumulation;
pub mod direction;
pub mod fill;
pub mod order;

pub use accumulation::{channel_mask, flow_accumulation};
pub use direction::flow_direction;
pub use fill::fill_depressions;
pub use order::stream_order;

use crate::raster::Raster;

/// `(row, col)` offsets of the eight neighbours in priority order.
pub const D8_OFFSETS: [(isize, isize); 8] = [
    (0, 1),
    (1, 1),
    (1, 0),
    (1, -1),
    (0, -1),
    (-1, -1),
    (-1, 0),
    (-1, 1),
];

/// ESRI direction code for each entry of [`D8_OFFSETS`].
pub const D8_CODES: [u8; 8] = [1, 2, 4, 8, 16, 32, 64, 128];

/// Code for a data cell with no downslope neighbour.
pub const NO_FLOW: u8 = 0;

/// No-data sentinel of direction rasters.
pub const DIRECTION_NODATA: u8 = 255;

/// Distance factor of each neighbour (1 for edges, sqrt 2 for corners).
pub(crate) const D8_DISTANCE: [f64; 8] = [
    1.0,
    std::f64::consts::SQRT_2,
    1.0,
    std::f64::consts::SQRT_2,
    1.0,
    std::f64::consts::SQRT_2,
    1.0,
    std::f64::consts::SQRT_2,
];

/// Neighbour `index` of `(row, col)`, or `None` outside the grid.
#[must_use]
pub fn neighbor(
    row: usize,
    col: usize,
    index: usize,
    rows: usize,
    cols: usize,
) -> Option<(usize, usize)> {
    let (dr, dc) = D8_OFFSETS[index];
    let r = row.checked_add_signed(dr)?;
    let c = col.checked_add_signed(dc)?;
    (r < rows && c < cols).then_some((r, c))
}

/// Index into [`D8_OFFSETS`] for a direction code.
#[must_use]
pub fn code_index(code: u8) -> Option<usize> {
    D8_CODES.iter().position(|&c| c == code)
}

/// The cell a direction raster drains `(row, col)` into, if it stays
/// inside the grid.
#[must_use]
pub fn downstream(direction: &Raster<u8>, row: usize, col: usize) -> Option<(usize, usize)> {
    let code = direction.get(row, col)?;
    let index = code_index(code)?;
    neighbor(row, col, index, direction.rows(), direction.cols())
}
