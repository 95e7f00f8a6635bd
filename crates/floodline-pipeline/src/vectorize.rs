//! Raster to vector conversion.
//!
//! - [`trace_flowlines`] turns a stream-order raster into one polyline
//!   per link, following the D8 direction raster.
//! - [`label_regions`] finds 4-connected regions of equal value.
//! - [`polygonize`] traces each region's boundary into a polygon with
//!   holes. Edges follow cell sides (staircase), collinear corners are
//!   removed.

use std::cmp::Ordering;
use std::collections::HashMap;

use geo::orient::Direction;
use geo::{Coord, LineString, Orient, Polygon};
use image::{ImageBuffer, Luma};
use imageproc::region_labelling::{Connectivity, connected_components};
use ndarray::Array2;

use crate::hydrology::{D8_OFFSETS, downstream, neighbor};
use crate::raster::{CellValue, Raster};
use crate::simplify::{simplify_line, simplify_ring};
use crate::types::{Flowline, PipelineError};

/// Trace the cells of `order` accepted by `include` into flowlines.
///
/// A link starts at every included cell that does not have exactly one
/// included upstream neighbour (sources and confluences) and follows
/// `direction` downstream until it leaves the included cells or enters
/// the next confluence, which closes the link. Each link carries the
/// order of its first cell as `grid_code`. Single-cell links are
/// dropped.
#[must_use]
pub fn trace_flowlines(
    order: &Raster<u32>,
    direction: &Raster<u8>,
    include: impl Fn(u32) -> bool,
) -> Vec<Flowline> {
    let (rows, cols) = (order.rows(), order.cols());
    let included = |r: usize, c: usize| order.get(r, c).is_some_and(&include);

    let mut upstream = Array2::<u8>::zeros((rows, cols));
    for (row, col, _) in order.iter_data() {
        if !included(row, col) {
            continue;
        }
        if let Some((r, c)) = downstream(direction, row, col)
            && included(r, c)
        {
            upstream[[r, c]] += 1;
        }
    }

    let mut lines = Vec::new();
    for (row, col, grid_code) in order.iter_data() {
        if !included(row, col) || upstream[[row, col]] == 1 {
            continue;
        }
        let mut coords = vec![order.cell_center(row, col)];
        let mut current = (row, col);
        while let Some(next) = downstream(direction, current.0, current.1)
            && included(next.0, next.1)
        {
            coords.push(order.cell_center(next.0, next.1));
            if upstream[next] != 1 || coords.len() > rows * cols {
                break;
            }
            current = next;
        }
        if coords.len() >= 2 {
            lines.push(Flowline {
                geometry: simplify_line(&LineString::new(coords)),
                grid_code,
            });
        }
    }
    lines
}

/// One 4-connected region of equal cell value.
#[derive(Debug, Clone, PartialEq)]
pub struct Region<T> {
    /// Shared cell value.
    pub value: T,
    /// Member cells in row-major order.
    pub cells: Vec<(usize, usize)>,
    /// Whether the region reaches the grid edge or a no-data cell.
    pub touches_border: bool,
}

/// Region labels of a raster.
#[derive(Debug, Clone)]
pub struct RegionLabels<T> {
    /// Region index plus one per cell; 0 for no-data.
    pub labels: Array2<u32>,
    /// Regions in order of their first cell.
    pub regions: Vec<Region<T>>,
}

impl<T> RegionLabels<T> {
    /// Region of a cell, if the cell holds data.
    #[must_use]
    pub fn region_of(&self, row: usize, col: usize) -> Option<usize> {
        match self.labels.get((row, col)) {
            Some(&label) if label > 0 => Some(label as usize - 1),
            _ => None,
        }
    }
}

/// Label the 4-connected regions of equal value in `raster`.
///
/// # Errors
///
/// Returns [`PipelineError::Engine`] if the grid is too large to label.
pub fn label_regions<T: CellValue>(raster: &Raster<T>) -> Result<RegionLabels<T>, PipelineError> {
    let (rows, cols) = (raster.rows(), raster.cols());
    let too_large =
        |_| PipelineError::Engine(format!("a {rows}x{cols} grid is too large to label"));
    let width = u32::try_from(cols).map_err(too_large)?;
    let height = u32::try_from(rows).map_err(too_large)?;

    // Distinct data values, sorted so each cell finds its key by binary
    // search. The key image holds value index plus one, 0 for no-data.
    let mut values: Vec<T> = raster.iter_data().map(|(_, _, v)| v).collect();
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
    values.dedup();
    let key_of = |v: T| {
        values
            .binary_search_by(|candidate| candidate.partial_cmp(&v).unwrap_or(Ordering::Equal))
            .map_or(0, |i| u32::try_from(i + 1).unwrap_or(0))
    };
    u32::try_from(values.len()).map_err(too_large)?;

    // Component label -> provisional region id.
    let mut provisional = Array2::<usize>::from_elem((rows, cols), usize::MAX);
    let mut count = 0_usize;
    if rows * cols == 1 {
        // connected_components asserts on a single-pixel image.
        if raster.is_data(0, 0) {
            provisional[[0, 0]] = 0;
            count = 1;
        }
    } else if rows * cols > 1 {
        let keyed: ImageBuffer<Luma<u32>, Vec<u32>> = ImageBuffer::from_fn(width, height, |x, y| {
            Luma([raster.get(y as usize, x as usize).map_or(0, key_of)])
        });
        let components = connected_components(&keyed, Connectivity::Four, Luma([0_u32]));
        let mut ids: HashMap<u32, usize> = HashMap::new();
        for (x, y, label) in components.enumerate_pixels() {
            if label[0] == 0 {
                continue;
            }
            let id = *ids.entry(label[0]).or_insert_with(|| {
                count += 1;
                count - 1
            });
            provisional[[y as usize, x as usize]] = id;
        }
    }

    // Renumber by first cell in row-major order so labels do not depend
    // on the component numbering.
    let mut renumber = vec![usize::MAX; count];
    let mut labels = Array2::<u32>::zeros((rows, cols));
    let mut regions: Vec<Region<T>> = Vec::new();
    for ((row, col), &id) in provisional.indexed_iter() {
        if id == usize::MAX {
            continue;
        }
        if renumber[id] == usize::MAX {
            renumber[id] = regions.len();
            regions.push(Region {
                value: raster.get(row, col).unwrap_or_default(),
                cells: Vec::new(),
                touches_border: false,
            });
        }
        let index = renumber[id];
        let label = u32::try_from(index + 1).map_err(too_large)?;
        labels[[row, col]] = label;
        let region = &mut regions[index];
        region.cells.push((row, col));
        if !region.touches_border {
            region.touches_border = (0..D8_OFFSETS.len()).step_by(2).any(|i| {
                neighbor(row, col, i, rows, cols).is_none_or(|(r, c)| !raster.is_data(r, c))
            });
        }
    }
    Ok(RegionLabels { labels, regions })
}

/// A polygon traced from one region.
#[derive(Debug, Clone, PartialEq)]
pub struct RegionPolygon<T> {
    /// Cell value of the region.
    pub value: T,
    /// Outer ring counter-clockwise, holes clockwise.
    pub polygon: Polygon<f64>,
    /// Number of cells in the region.
    pub cell_count: usize,
    /// Whether the region reaches the grid edge or a no-data cell.
    pub touches_border: bool,
}

/// Polygonize every region of `raster`.
///
/// # Errors
///
/// Propagates [`label_regions`] errors.
pub fn polygonize<T: CellValue>(raster: &Raster<T>) -> Result<Vec<RegionPolygon<T>>, PipelineError> {
    let labeled = label_regions(raster)?;
    Ok(polygonize_labeled(raster, &labeled, |_| true))
}

/// Polygonize the regions of an existing labeling accepted by `keep`.
#[must_use]
pub fn polygonize_labeled<T: CellValue>(
    raster: &Raster<T>,
    labeled: &RegionLabels<T>,
    keep: impl Fn(&Region<T>) -> bool,
) -> Vec<RegionPolygon<T>> {
    let transform = raster.transform();
    let mut out = Vec::new();
    for (index, region) in labeled.regions.iter().enumerate() {
        if !keep(region) {
            continue;
        }
        let label = index + 1;
        let rings = trace_rings(region, |r, c| {
            labeled.labels.get((r, c)).is_some_and(|&l| l as usize == label)
        });
        let to_world = |ring: Vec<(usize, usize)>| -> LineString<f64> {
            let coords: Vec<Coord<f64>> = ring
                .into_iter()
                .map(|(x, y)| transform.corner(x, y))
                .collect();
            simplify_ring(&LineString::new(coords))
        };

        let (mut exteriors, holes): (Vec<_>, Vec<_>) =
            rings.into_iter().partition(|ring| shoelace(ring) > 0);
        exteriors.sort_by_key(|ring| std::cmp::Reverse(shoelace(ring)));
        let mut exteriors = exteriors.into_iter();
        let Some(outer) = exteriors.next() else {
            continue;
        };
        let polygon = Polygon::new(to_world(outer), holes.into_iter().map(&to_world).collect());
        out.push(RegionPolygon {
            value: region.value,
            polygon: polygon.orient(Direction::Default),
            cell_count: region.cells.len(),
            touches_border: region.touches_border,
        });
        // A 4-connected region has a single outer boundary; anything else
        // would be a tracing fault, kept as separate parts.
        for extra in exteriors {
            out.push(RegionPolygon {
                value: region.value,
                polygon: Polygon::new(to_world(extra), vec![]).orient(Direction::Default),
                cell_count: region.cells.len(),
                touches_border: region.touches_border,
            });
        }
    }
    out
}

/// A directed cell side in corner coordinates `(x, y)`, y pointing down.
type Edge = ((usize, usize), (usize, usize));

/// Boundary rings of a region as closed corner sequences, traversed with
/// the region on the right.
fn trace_rings(region: &Region<impl Copy>, inside: impl Fn(usize, usize) -> bool) -> Vec<Vec<(usize, usize)>> {
    let mut edges: Vec<Edge> = Vec::new();
    for &(r, c) in &region.cells {
        let outside = |dr: isize, dc: isize| {
            match (r.checked_add_signed(dr), c.checked_add_signed(dc)) {
                (Some(nr), Some(nc)) => !inside(nr, nc),
                _ => true,
            }
        };
        if outside(-1, 0) {
            edges.push(((c, r), (c + 1, r)));
        }
        if outside(0, 1) {
            edges.push(((c + 1, r), (c + 1, r + 1)));
        }
        if outside(1, 0) {
            edges.push(((c + 1, r + 1), (c, r + 1)));
        }
        if outside(0, -1) {
            edges.push(((c, r + 1), (c, r)));
        }
    }

    let mut by_start: HashMap<(usize, usize), Vec<usize>> = HashMap::new();
    for (i, edge) in edges.iter().enumerate() {
        by_start.entry(edge.0).or_default().push(i);
    }
    let mut used = vec![false; edges.len()];
    let mut rings = Vec::new();

    for first in 0..edges.len() {
        if used[first] {
            continue;
        }
        let mut ring = vec![edges[first].0];
        let mut current = first;
        loop {
            used[current] = true;
            let (from, to) = edges[current];
            let heading = step(from, to);
            let candidates = by_start.get(&to).map_or(&[][..], Vec::as_slice);
            let next = candidates
                .iter()
                .copied()
                .filter(|&e| e == first || !used[e])
                .min_by_key(|&e| turn_rank(heading, step(edges[e].0, edges[e].1)));
            match next {
                Some(e) if e == first => break,
                Some(e) => {
                    ring.push(to);
                    current = e;
                }
                None => break,
            }
        }
        ring.push(edges[first].0);
        rings.push(ring);
    }
    rings
}

fn step(from: (usize, usize), to: (usize, usize)) -> (isize, isize) {
    (
        to.0.cast_signed() - from.0.cast_signed(),
        to.1.cast_signed() - from.1.cast_signed(),
    )
}

/// Right turn first, then straight, then left (y pointing down).
fn turn_rank(heading: (isize, isize), next: (isize, isize)) -> u8 {
    let (dx, dy) = heading;
    if next == (-dy, dx) {
        0
    } else if next == heading {
        1
    } else if next == (dy, -dx) {
        2
    } else {
        3
    }
}

/// Twice the signed area of a corner ring; positive for outer rings.
fn shoelace(ring: &[(usize, usize)]) -> i64 {
    ring.windows(2)
        .map(|w| {
            let (x0, y0) = (to_i64(w[0].0), to_i64(w[0].1));
            let (x1, y1) = (to_i64(w[1].0), to_i64(w[1].1));
            x0 * y1 - x1 * y0
        })
        .sum()
}

fn to_i64(v: usize) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use geo::{Area, Contains, Point};

    use super::*;
    use crate::hydrology::DIRECTION_NODATA;
    use crate::raster::GeoTransform;

    fn mask(rows: usize, cols: usize, values: Vec<u8>) -> Raster<u8> {
        Raster::from_vec(rows, cols, values, GeoTransform::new(0.0, 10.0 * rows as f64, 10.0), Some(255))
            .unwrap()
    }

    #[test]
    fn single_cell_polygon() {
        let polys = polygonize(&mask(1, 1, vec![1])).unwrap();
        assert_eq!(polys.len(), 1);
        assert!((polys[0].polygon.unsigned_area() - 100.0).abs() < 1e-9);
        assert_eq!(polys[0].polygon.exterior().0.len(), 5);
        assert!(polys[0].touches_border);
    }

    #[test]
    fn single_nodata_cell_has_no_regions() {
        let labeled = label_regions(&mask(1, 1, vec![255])).unwrap();
        assert!(labeled.regions.is_empty());
        assert_eq!(labeled.region_of(0, 0), None);
    }

    #[test]
    fn many_values_label_in_one_pass() {
        #[rustfmt::skip]
        let r = mask(2, 4, vec![
            3, 7, 7, 1,
            3, 9, 1, 1,
        ]);
        let labeled = label_regions(&r).unwrap();
        let values: Vec<u8> = labeled.regions.iter().map(|g| g.value).collect();
        assert_eq!(values, vec![3, 7, 1, 9]);
        assert_eq!(labeled.regions[2].cells, vec![(0, 3), (1, 2), (1, 3)]);
        assert_eq!(labeled.region_of(1, 1), Some(3));
    }

    #[test]
    fn float_regions_split_on_distinct_values() {
        let r = Raster::from_vec(
            1,
            3,
            vec![0.5_f64, 0.5, 2.25],
            GeoTransform::new(0.0, 10.0, 10.0),
            None,
        )
        .unwrap();
        let labeled = label_regions(&r).unwrap();
        assert_eq!(labeled.regions.len(), 2);
        assert_eq!(labeled.regions[0].cells.len(), 2);
    }

    #[test]
    fn donut_has_one_hole() {
        #[rustfmt::skip]
        let r = mask(3, 3, vec![
            1, 1, 1,
            1, 0, 1,
            1, 1, 1,
        ]);
        let polys = polygonize(&r).unwrap();
        let ring = polys.iter().find(|p| p.value == 1).unwrap();
        let hole = polys.iter().find(|p| p.value == 0).unwrap();
        assert_eq!(ring.polygon.interiors().len(), 1);
        assert!((ring.polygon.unsigned_area() - 800.0).abs() < 1e-9);
        assert_eq!(ring.cell_count, 8);
        assert!(!hole.touches_border);
        assert!(ring.polygon.contains(&Point::new(5.0, 25.0)));
        assert!(!ring.polygon.contains(&Point::new(15.0, 15.0)));
    }

    #[test]
    fn diagonal_cells_are_separate_regions() {
        #[rustfmt::skip]
        let r = mask(2, 2, vec![
            1, 0,
            0, 1,
        ]);
        let labeled = label_regions(&r).unwrap();
        assert_eq!(labeled.regions.len(), 4);
        let polys = polygonize(&r).unwrap();
        assert_eq!(polys.iter().filter(|p| p.value == 1).count(), 2);
        for p in &polys {
            assert!((p.polygon.unsigned_area() - 100.0).abs() < 1e-9);
        }
    }

    #[test]
    fn pinched_region_keeps_one_outer_ring() {
        // The ones form a single 4-connected region whose outline touches
        // itself at the corner shared by (0,1) and (1,2).
        #[rustfmt::skip]
        let r = mask(3, 3, vec![
            1, 1, 0,
            1, 0, 1,
            1, 1, 1,
        ]);
        let polys = polygonize(&r).unwrap();
        let ones: Vec<_> = polys.iter().filter(|p| p.value == 1).collect();
        assert_eq!(ones.len(), 1);
        assert!((ones[0].polygon.unsigned_area() - 700.0).abs() < 1e-9);
    }

    #[test]
    fn labels_ignore_nodata() {
        let r = mask(1, 3, vec![1, 255, 1]);
        let labeled = label_regions(&r).unwrap();
        assert_eq!(labeled.regions.len(), 2);
        assert_eq!(labeled.region_of(0, 1), None);
        assert!(labeled.regions.iter().all(|reg| reg.touches_border));
    }

    #[test]
    fn flowlines_split_at_confluence() {
        let t = GeoTransform::new(0.0, 4.0, 1.0);
        #[rustfmt::skip]
        let dir = Raster::from_vec(4, 3, vec![
            4, DIRECTION_NODATA, 4,
            2, DIRECTION_NODATA, 8,
            DIRECTION_NODATA, 4, DIRECTION_NODATA,
            DIRECTION_NODATA, 4, DIRECTION_NODATA,
        ], t, Some(DIRECTION_NODATA)).unwrap();
        #[rustfmt::skip]
        let order = Raster::from_vec(4, 3, vec![
            1, 0, 1,
            1, 0, 1,
            0, 2, 0,
            0, 2, 0,
        ], t, Some(0)).unwrap();
        let lines = trace_flowlines(&order, &dir, |_| true);
        assert_eq!(lines.len(), 3);
        assert_eq!(lines.iter().filter(|l| l.grid_code == 1).count(), 2);
        let trunk = lines.iter().find(|l| l.grid_code == 2).unwrap();
        assert_eq!(trunk.geometry.0.len(), 2);

        let upper: Vec<_> = trace_flowlines(&order, &dir, |o| o > 1);
        assert_eq!(upper.len(), 1);
    }

    #[test]
    fn straight_flowline_is_two_vertices() {
        let t = GeoTransform::new(0.0, 1.0, 1.0);
        let dir = Raster::from_vec(1, 5, vec![1; 5], t, Some(DIRECTION_NODATA)).unwrap();
        let order = Raster::from_vec(1, 5, vec![1; 5], t, Some(0)).unwrap();
        let lines = trace_flowlines(&order, &dir, |_| true);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].geometry.0.len(), 2);
        assert!((lines[0].geometry.0[0].x - 0.5).abs() < 1e-12);
        assert!((lines[0].geometry.0[1].x - 4.5).abs() < 1e-12);
    }
}
