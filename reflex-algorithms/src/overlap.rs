//! Overlap detection between reflection shoeboxes.
//!
//! Boxes are grouped by a partition key (panel, optionally combined with
//! an experiment group), each partition is swept independently and the
//! local pairs are mapped back to table indices.

use crate::spatial::detect_collisions3d;
use rayon::prelude::*;
use reflex_core::{AdjacencyList, BoundingBox, Error, Result};

/// Overlaps between all boxes, ignoring panels.
#[must_use]
pub fn find_overlapping(bboxes: &[BoundingBox]) -> AdjacencyList {
    let mut graph = AdjacencyList::new(bboxes.len());
    for (a, b) in detect_collisions3d(bboxes) {
        graph.add_edge(a, b);
    }
    graph
}

/// Overlaps between boxes on the same panel.
pub fn find_overlapping_multi_panel(
    bboxes: &[BoundingBox],
    panels: &[usize],
) -> Result<AdjacencyList> {
    if bboxes.len() != panels.len() {
        return Err(Error::ConfigError(format!(
            "{} bounding boxes but {} panel ids",
            bboxes.len(),
            panels.len()
        )));
    }
    Ok(find_partitioned(bboxes, panels))
}

/// Sweeps each run of equal `keys` independently.
fn find_partitioned(bboxes: &[BoundingBox], keys: &[usize]) -> AdjacencyList {
    let mut order: Vec<usize> = (0..bboxes.len()).collect();
    order.sort_by_key(|&i| keys[i]);

    let partitions: Vec<&[usize]> = order.chunk_by(|&a, &b| keys[a] == keys[b]).collect();
    let pairs: Vec<(usize, usize)> = partitions
        .par_iter()
        .flat_map_iter(|members| {
            let local: Vec<BoundingBox> = members.iter().map(|&i| bboxes[i]).collect();
            detect_collisions3d(&local)
                .into_iter()
                .map(move |(a, b)| (members[a], members[b]))
        })
        .collect();

    log::debug!(
        "overlap: {} boxes in {} partitions, {} overlapping pairs",
        bboxes.len(),
        partitions.len(),
        pairs.len()
    );

    let mut graph = AdjacencyList::new(bboxes.len());
    for (a, b) in pairs {
        graph.add_edge(a, b);
    }
    graph
}

/// Overlap finder restricted to experiment groups.
///
/// Each group is a half-open range `[start, end)` of experiment ids;
/// boxes overlap only when they share a panel and a group. Ids outside
/// every group form their own group.
#[derive(Debug, Clone, Default)]
pub struct OverlapFinder {
    groups: Vec<(usize, usize)>,
}

impl OverlapFinder {
    /// Finder over half-open experiment id ranges.
    pub fn new(groups: Vec<(usize, usize)>) -> Result<Self> {
        for &(start, end) in &groups {
            if end <= start {
                return Err(Error::ConfigError(format!(
                    "empty experiment group [{start}, {end})"
                )));
            }
        }
        Ok(Self { groups })
    }

    /// One group holding every experiment.
    #[must_use]
    pub fn single_group() -> Self {
        Self::default()
    }

    fn group_of(&self, id: usize) -> usize {
        self.groups
            .iter()
            .position(|&(start, end)| (start..end).contains(&id))
            .unwrap_or(self.groups.len())
    }

    /// Overlap graph of reflections sharing a panel and an experiment
    /// group.
    pub fn find(
        &self,
        ids: &[usize],
        panels: &[usize],
        bboxes: &[BoundingBox],
    ) -> Result<AdjacencyList> {
        if ids.len() != bboxes.len() || panels.len() != bboxes.len() {
            return Err(Error::ConfigError(format!(
                "{} ids, {} panel ids and {} bounding boxes",
                ids.len(),
                panels.len(),
                bboxes.len()
            )));
        }
        let max_panel = panels.iter().copied().max().map_or(1, |p| p + 1);
        let keys: Vec<usize> = ids
            .iter()
            .zip(panels)
            .map(|(&id, &panel)| panel + self.group_of(id) * max_panel)
            .collect();
        Ok(find_partitioned(bboxes, &keys))
    }
}
