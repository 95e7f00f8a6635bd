//! Priority-flood depression filling with a depth limit.
//!
//! Cells are processed in elevation order from the data boundary inward
//! (Barnes et al. 2014). Every visited neighbour is raised to at least the
//! popped cell plus a small gradient, so filled flats still drain.
//!
//! The flood also tracks the water level each cell would reach without
//! the gradient. Cells below that level form the true depressions; with a
//! depth limit, each 8-connected depression whose deepest point lies more
//! than the limit below its water level is restored to its original
//! surface. Flats that only received the gradient keep it.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};

use ndarray::Array2;
use tracing::debug;

use super::{D8_OFFSETS, neighbor};
use crate::raster::Raster;

/// Increment enforced between a filled cell and its spill cell.
pub const FILL_GRADIENT: f64 = 1e-5;

#[derive(Debug, Clone, Copy)]
struct QueuedCell {
    elevation: f64,
    water: f64,
    row: usize,
    col: usize,
}

impl PartialEq for QueuedCell {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueuedCell {}

impl PartialOrd for QueuedCell {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedCell {
    // Reversed so the max-heap pops the lowest cell; ties by position keep
    // the fill deterministic.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .elevation
            .total_cmp(&self.elevation)
            .then_with(|| other.row.cmp(&self.row))
            .then_with(|| other.col.cmp(&self.col))
    }
}

/// Fill depressions in `dem`.
///
/// `depth_limit` of `None` fills every depression.
#[must_use]
pub fn fill_depressions(dem: &Raster<f64>, depth_limit: Option<f64>) -> Raster<f64> {
    let (rows, cols) = (dem.rows(), dem.cols());
    let mut filled = dem.clone();
    let mut visited = Array2::from_elem((rows, cols), false);
    let mut water = Array2::from_elem((rows, cols), f64::NEG_INFINITY);
    let mut heap = BinaryHeap::new();

    for row in 0..rows {
        for col in 0..cols {
            let Some(z) = dem.get(row, col) else {
                visited[[row, col]] = true;
                continue;
            };
            if is_boundary(dem, row, col) {
                visited[[row, col]] = true;
                water[[row, col]] = z;
                heap.push(QueuedCell {
                    elevation: z,
                    water: z,
                    row,
                    col,
                });
            }
        }
    }

    while let Some(cell) = heap.pop() {
        for index in 0..D8_OFFSETS.len() {
            let Some((r, c)) = neighbor(cell.row, cell.col, index, rows, cols) else {
                continue;
            };
            if visited[[r, c]] {
                continue;
            }
            visited[[r, c]] = true;
            let Some(z) = dem.get(r, c) else {
                continue;
            };
            let spill = cell.elevation + FILL_GRADIENT;
            let level = if z < spill { spill } else { z };
            let still = cell.water.max(z);
            filled.set(r, c, level);
            water[[r, c]] = still;
            heap.push(QueuedCell {
                elevation: level,
                water: still,
                row: r,
                col: c,
            });
        }
    }

    if let Some(limit) = depth_limit {
        restore_deep_depressions(dem, &water, &mut filled, limit);
    }
    filled
}

/// A data cell on the grid edge or next to no-data.
fn is_boundary(dem: &Raster<f64>, row: usize, col: usize) -> bool {
    (0..D8_OFFSETS.len()).any(|index| {
        neighbor(row, col, index, dem.rows(), dem.cols()).is_none_or(|(r, c)| !dem.is_data(r, c))
    })
}

fn restore_deep_depressions(
    dem: &Raster<f64>,
    water: &Array2<f64>,
    filled: &mut Raster<f64>,
    limit: f64,
) {
    let (rows, cols) = (dem.rows(), dem.cols());
    let depth = |r: usize, c: usize| -> f64 { dem.get(r, c).map_or(0.0, |z| water[[r, c]] - z) };
    let mut seen = Array2::from_elem((rows, cols), false);
    let mut restored = 0_usize;

    for row in 0..rows {
        for col in 0..cols {
            if seen[[row, col]] || depth(row, col) <= 0.0 {
                continue;
            }
            let mut region = Vec::new();
            let mut deepest = 0.0_f64;
            let mut queue = VecDeque::from([(row, col)]);
            seen[[row, col]] = true;
            while let Some((r, c)) = queue.pop_front() {
                deepest = deepest.max(depth(r, c));
                region.push((r, c));
                for index in 0..D8_OFFSETS.len() {
                    if let Some((nr, nc)) = neighbor(r, c, index, rows, cols)
                        && !seen[[nr, nc]]
                        && depth(nr, nc) > 0.0
                    {
                        seen[[nr, nc]] = true;
                        queue.push_back((nr, nc));
                    }
                }
            }
            if deepest > limit {
                restored += 1;
                for (r, c) in region {
                    if let Some(z) = dem.get(r, c) {
                        filled.set(r, c, z);
                    }
                }
            }
        }
    }
    debug!(restored, limit, "depressions deeper than the fill limit left unfilled");
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::raster::GeoTransform;

    /// A 5x5 bowl: rim at 10, one pit cell in the middle.
    fn pit(depth: f64) -> Raster<f64> {
        let mut values = vec![10.0; 25];
        values[12] = 10.0 - depth;
        // Outlet on the west edge.
        values[10] = 5.0;
        Raster::from_vec(5, 5, values, GeoTransform::new(0.0, 5.0, 1.0), Some(-9999.0)).unwrap()
    }

    #[test]
    fn fills_shallow_pit_to_spill_level() {
        let filled = fill_depressions(&pit(3.0), Some(5.0));
        let z = filled.get(2, 2).unwrap();
        assert!(z >= 10.0, "pit should be raised to the rim, got {z}");
        assert!(z < 10.0 + 1e-3);
    }

    #[test]
    fn leaves_deep_pit_when_limited() {
        let filled = fill_depressions(&pit(8.0), Some(5.0));
        assert!((filled.get(2, 2).unwrap() - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn draining_flat_keeps_gradient_next_to_deep_pit() {
        // West outlet at 5, a flat at 10, then a pit at 2 walled in at 20.
        let mut values = vec![20.0; 27];
        values[9..18].copy_from_slice(&[5.0, 10.0, 10.0, 10.0, 10.0, 10.0, 10.0, 2.0, 20.0]);
        let dem =
            Raster::from_vec(3, 9, values, GeoTransform::new(0.0, 3.0, 1.0), Some(-9999.0)).unwrap();

        let filled = fill_depressions(&dem, Some(5.0));
        assert!((filled.get(1, 7).unwrap() - 2.0).abs() < f64::EPSILON);
        assert!(filled.get(1, 4).unwrap() > 10.0);

        let direction = crate::hydrology::flow_direction(&filled);
        let flat: Vec<u8> = (1..=5).map(|col| direction.get(1, col).unwrap()).collect();
        assert_eq!(flat, vec![16; 5]);
        // The cell beside the pit drains into it.
        assert_eq!(direction.get(1, 6), Some(1));
    }

    #[test]
    fn fills_deep_pit_without_limit() {
        let filled = fill_depressions(&pit(8.0), None);
        assert!(filled.get(2, 2).unwrap() >= 10.0);
    }

    #[test]
    fn boundary_and_sloping_cells_untouched() {
        let dem = Raster::from_vec(
            3,
            3,
            vec![9.0, 8.0, 7.0, 8.0, 7.0, 6.0, 7.0, 6.0, 5.0],
            GeoTransform::new(0.0, 3.0, 1.0),
            Some(-9999.0),
        )
        .unwrap();
        let filled = fill_depressions(&dem, Some(5.0));
        assert_eq!(filled, dem);
    }

    #[test]
    fn nodata_stays_nodata() {
        let mut dem = pit(3.0);
        dem.set(0, 0, -9999.0);
        let filled = fill_depressions(&dem, None);
        assert_eq!(filled.get(0, 0), None);
    }
}
