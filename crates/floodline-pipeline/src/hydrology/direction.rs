//! D8 flow direction.

use super::{D8_CODES, D8_DISTANCE, D8_OFFSETS, DIRECTION_NODATA, NO_FLOW, neighbor};
use crate::raster::Raster;

/// Steepest-descent direction of every data cell.
///
/// The drop to each neighbour is `(z - z_n) / distance`; the strictly
/// largest positive drop wins, so equal drops resolve to the earlier
/// neighbour in [`D8_OFFSETS`] order. A cell without a lower neighbour
/// drains off the grid when it touches the grid edge or no-data, and is
/// marked [`NO_FLOW`] otherwise.
#[must_use]
pub fn flow_direction(filled: &Raster<f64>) -> Raster<u8> {
    let (rows, cols) = (filled.rows(), filled.cols());
    let cell = filled.cell_size();
    let mut out = Raster::empty(filled.grid(), DIRECTION_NODATA);

    for (row, col, z) in filled.iter_data() {
        let mut best: Option<(usize, f64)> = None;
        let mut outlet: Option<usize> = None;
        for index in 0..D8_OFFSETS.len() {
            match neighbor(row, col, index, rows, cols).and_then(|(r, c)| filled.get(r, c)) {
                Some(zn) => {
                    let drop = (z - zn) / (D8_DISTANCE[index] * cell);
                    if drop > 0.0 && best.is_none_or(|(_, d)| drop > d) {
                        best = Some((index, drop));
                    }
                }
                None => {
                    outlet.get_or_insert(index);
                }
            }
        }
        let code = best
            .map(|(index, _)| index)
            .or(outlet)
            .map_or(NO_FLOW, |index| D8_CODES[index]);
        out.set(row, col, code);
    }
    out
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::raster::GeoTransform;

    fn dem(rows: usize, cols: usize, values: Vec<f64>) -> Raster<f64> {
        Raster::from_vec(rows, cols, values, GeoTransform::new(0.0, 0.0, 1.0), Some(-9999.0))
            .unwrap()
    }

    #[test]
    fn steepest_neighbour_wins() {
        #[rustfmt::skip]
        let d = dem(3, 3, vec![
            9.0, 9.0, 9.0,
            9.0, 5.0, 4.0,
            9.0, 1.0, 9.0,
        ]);
        let dir = flow_direction(&d);
        // Drop south is 4, drop east is 1.
        assert_eq!(dir.get(1, 1), Some(4));
    }

    #[test]
    fn diagonal_drop_is_distance_weighted() {
        #[rustfmt::skip]
        let d = dem(3, 3, vec![
            9.0, 9.0, 9.0,
            9.0, 5.0, 4.0,
            9.0, 9.0, 3.6,
        ]);
        // East: 1.0, SE: 1.4 / sqrt2 < 1.0.
        assert_eq!(flow_direction(&d).get(1, 1), Some(1));
    }

    #[test]
    fn ties_follow_priority_order() {
        #[rustfmt::skip]
        let d = dem(3, 3, vec![
            9.0, 9.0, 9.0,
            3.0, 5.0, 3.0,
            9.0, 3.0, 9.0,
        ]);
        // East, south and west all drop 2; east comes first.
        assert_eq!(flow_direction(&d).get(1, 1), Some(1));
    }

    #[test]
    fn edge_cells_without_lower_neighbour_drain_outward() {
        let d = dem(1, 3, vec![1.0, 2.0, 3.0]);
        let dir = flow_direction(&d);
        // (0,0) has no lower neighbour; SE is the first off-grid one.
        assert_eq!(dir.get(0, 0), Some(2));
        assert_eq!(dir.get(0, 1), Some(16));
    }

    #[test]
    fn interior_pit_has_no_flow() {
        #[rustfmt::skip]
        let d = dem(3, 3, vec![
            9.0, 9.0, 9.0,
            9.0, 1.0, 9.0,
            9.0, 9.0, 9.0,
        ]);
        assert_eq!(flow_direction(&d).get(1, 1), Some(NO_FLOW));
    }
}
