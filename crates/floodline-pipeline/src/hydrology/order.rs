//! Strahler stream order.

use std::collections::HashMap;

use petgraph::Direction;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};

use super::downstream;
use crate::raster::Raster;
use crate::types::PipelineError;

/// No-data sentinel of stream-order rasters.
pub const ORDER_NODATA: u32 = 0;

/// Strahler order of every channel cell.
///
/// Channel cells become graph nodes with an edge to the downstream
/// channel cell. Sources get order 1; a cell whose two or more highest
/// tributaries share the maximum order `n` gets `n + 1`, otherwise `n`.
///
/// # Errors
///
/// Returns [`PipelineError::Engine`] if the direction raster contains a
/// cycle, which a direction derived from a filled surface never does.
pub fn stream_order(
    direction: &Raster<u8>,
    channel: &Raster<u8>,
) -> Result<Raster<u32>, PipelineError> {
    let mut graph: DiGraph<(usize, usize), ()> = DiGraph::new();
    let mut nodes: HashMap<(usize, usize), NodeIndex> = HashMap::new();
    for (row, col, _) in channel.iter_data() {
        nodes.insert((row, col), graph.add_node((row, col)));
    }
    for (&cell, &node) in &nodes {
        if let Some(next) = downstream(direction, cell.0, cell.1)
            && let Some(&target) = nodes.get(&next)
        {
            graph.add_edge(node, target, ());
        }
    }

    let sorted = toposort(&graph, None).map_err(|cycle| {
        let (row, col) = graph[cycle.node_id()];
        PipelineError::Engine(format!("flow direction cycle through cell ({row}, {col})"))
    })?;

    let mut order = vec![0_u32; graph.node_count()];
    for node in sorted {
        let mut highest = 0;
        let mut count = 0;
        for upstream in graph.neighbors_directed(node, Direction::Incoming) {
            let o = order[upstream.index()];
            match o.cmp(&highest) {
                std::cmp::Ordering::Greater => {
                    highest = o;
                    count = 1;
                }
                std::cmp::Ordering::Equal => count += 1,
                std::cmp::Ordering::Less => {}
            }
        }
        order[node.index()] = match (highest, count) {
            (0, _) => 1,
            (n, c) if c >= 2 => n + 1,
            (n, _) => n,
        };
    }

    let mut out = Raster::empty(channel.grid(), ORDER_NODATA);
    for node in graph.node_indices() {
        let (row, col) = graph[node];
        out.set(row, col, order[node.index()]);
    }
    Ok(out)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::hydrology::DIRECTION_NODATA;
    use crate::hydrology::accumulation::CHANNEL;
    use crate::raster::GeoTransform;

    fn grids(rows: usize, cols: usize, codes: Vec<u8>) -> (Raster<u8>, Raster<u8>) {
        let t = GeoTransform::new(0.0, 0.0, 1.0);
        let dir = Raster::from_vec(rows, cols, codes, t, Some(DIRECTION_NODATA)).unwrap();
        let channel = dir.map(0, |_| Some(CHANNEL));
        (dir, channel)
    }

    #[test]
    fn two_first_order_branches_make_second_order() {
        // Columns 0 and 2 flow south, then converge on (2,1).
        #[rustfmt::skip]
        let (dir, channel) = grids(4, 3, vec![
            4, DIRECTION_NODATA, 4,
            2, DIRECTION_NODATA, 8,
            DIRECTION_NODATA, 4, DIRECTION_NODATA,
            DIRECTION_NODATA, 4, DIRECTION_NODATA,
        ]);
        let order = stream_order(&dir, &channel).unwrap();
        assert_eq!(order.get(0, 0), Some(1));
        assert_eq!(order.get(1, 2), Some(1));
        assert_eq!(order.get(2, 1), Some(2));
        assert_eq!(order.get(3, 1), Some(2));
    }

    #[test]
    fn lower_order_tributary_does_not_raise_order() {
        // A 2nd-order stem at (2,1) gains a 1st-order tributary from (2,2).
        #[rustfmt::skip]
        let (dir, channel) = grids(4, 3, vec![
            2, DIRECTION_NODATA, 8,
            DIRECTION_NODATA, 4, DIRECTION_NODATA,
            DIRECTION_NODATA, 4, 16,
            DIRECTION_NODATA, 4, DIRECTION_NODATA,
        ]);
        let order = stream_order(&dir, &channel).unwrap();
        assert_eq!(order.get(1, 1), Some(2));
        assert_eq!(order.get(2, 2), Some(1));
        assert_eq!(order.get(3, 1), Some(2));
    }

    #[test]
    fn non_channel_cells_are_nodata() {
        let (dir, _) = grids(1, 3, vec![1, 1, 1]);
        let channel = Raster::from_vec(
            1,
            3,
            vec![0, CHANNEL, CHANNEL],
            GeoTransform::new(0.0, 0.0, 1.0),
            Some(0),
        )
        .unwrap();
        let order = stream_order(&dir, &channel).unwrap();
        assert_eq!(order.get(0, 0), None);
        assert_eq!(order.get(0, 1), Some(1));
        assert_eq!(order.get(0, 2), Some(1));
    }
}
