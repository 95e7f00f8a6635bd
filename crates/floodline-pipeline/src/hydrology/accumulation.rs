//! Flow accumulation and channel extraction.

use std::collections::VecDeque;

use ndarray::Array2;

use super::downstream;
use crate::raster::Raster;

/// No-data sentinel of accumulation rasters.
pub const ACCUMULATION_NODATA: f64 = -1.0;

/// Value of channel cells in a channel mask; everything else is no-data.
pub const CHANNEL: u8 = 1;

/// Number of upstream cells draining through each cell.
///
/// Headwater cells get 0. Cells are released in topological order
/// (in-degree zero first), so every cell is visited once.
#[must_use]
pub fn flow_accumulation(direction: &Raster<u8>) -> Raster<f64> {
    let (rows, cols) = (direction.rows(), direction.cols());
    let mut indegree = Array2::<u8>::zeros((rows, cols));
    for (row, col, _) in direction.iter_data() {
        if let Some((r, c)) = downstream(direction, row, col)
            && direction.is_data(r, c)
        {
            indegree[[r, c]] += 1;
        }
    }

    let mut acc = direction.map(ACCUMULATION_NODATA, |_| Some(0.0));
    let mut queue: VecDeque<(usize, usize)> = direction
        .iter_data()
        .filter(|&(r, c, _)| indegree[[r, c]] == 0)
        .map(|(r, c, _)| (r, c))
        .collect();

    while let Some((row, col)) = queue.pop_front() {
        let Some((r, c)) = downstream(direction, row, col) else {
            continue;
        };
        let (Some(here), Some(there)) = (acc.get(row, col), acc.get(r, c)) else {
            continue;
        };
        acc.set(r, c, there + here + 1.0);
        indegree[[r, c]] -= 1;
        if indegree[[r, c]] == 0 {
            queue.push_back((r, c));
        }
    }
    acc
}

/// Cells whose accumulation reaches `threshold`.
#[must_use]
pub fn channel_mask(accumulation: &Raster<f64>, threshold: f64) -> Raster<u8> {
    accumulation.map(0, |a| (a >= threshold).then_some(CHANNEL))
}
