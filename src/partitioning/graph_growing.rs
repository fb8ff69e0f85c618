//! Breadth-first region growing over the tetra dual graph.
//!
//! Parts are grown one after the other. Each part starts from a seed on the
//! frontier of the parts already grown (a random unassigned tetra for the
//! first part) and absorbs neighbours breadth-first until it reaches its
//! share of the remaining tetrahedra.

use super::{PartId, Partitioner};
use crate::mesh_error::ParMeshError;
use crate::topology::group::Group;
use rand::Rng;
use rand::SeedableRng;
use rand::rngs::SmallRng;
use std::collections::VecDeque;

const UNSET: PartId = PartId::MAX;

#[derive(Clone, Debug)]
pub struct GraphGrowing {
    pub seed: u64,
}

impl GraphGrowing {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }
}

fn unassigned_degree(graph: &[Vec<usize>], part: &[PartId], t: usize) -> usize {
    graph[t].iter().filter(|&&n| part[n] == UNSET).count()
}

/// Pick the next seed: the frontier tetra with the fewest free neighbours,
/// or a random free tetra when the frontier is empty.
fn pick_seed(
    graph: &[Vec<usize>],
    part: &[PartId],
    frontier: &[usize],
    rng: &mut SmallRng,
) -> Option<usize> {
    let best = frontier
        .iter()
        .copied()
        .filter(|&t| part[t] == UNSET)
        .min_by_key(|&t| (unassigned_degree(graph, part, t), t));
    if best.is_some() {
        return best;
    }
    let free: Vec<usize> = (0..part.len()).filter(|&t| part[t] == UNSET).collect();
    if free.is_empty() {
        None
    } else {
        Some(free[rng.gen_range(0..free.len())])
    }
}

impl Partitioner for GraphGrowing {
    fn partition(&self, group: &Group, nparts: usize) -> Result<Vec<PartId>, ParMeshError> {
        if nparts == 0 {
            return Err(ParMeshError::Partition("cannot partition into 0 parts".into()));
        }
        let n = group.n_tetra();
        if nparts == 1 || n == 0 {
            return Ok(vec![0; n]);
        }
        let graph = group.adjacency(0)?.dual_graph();
        let mut rng = SmallRng::seed_from_u64(self.seed);
        let mut part = vec![UNSET; n];
        let mut assigned = 0usize;
        let mut frontier: Vec<usize> = Vec::new();

        for p in 0..nparts {
            let remaining_parts = nparts - p;
            let target = (n - assigned).div_ceil(remaining_parts);
            let mut count = 0usize;
            let mut queue = VecDeque::new();
            let mut next_frontier = Vec::new();
            while count < target {
                let t = match queue.pop_front() {
                    Some(t) => t,
                    None => match pick_seed(&graph, &part, &frontier, &mut rng) {
                        Some(t) => t,
                        None => break,
                    },
                };
                if part[t] != UNSET {
                    continue;
                }
                part[t] = p;
                count += 1;
                for &nb in &graph[t] {
                    if part[nb] == UNSET {
                        queue.push_back(nb);
                        next_frontier.push(nb);
                    }
                }
            }
            assigned += count;
            frontier.retain(|&t| part[t] == UNSET);
            frontier.extend(next_frontier.into_iter().filter(|&t| part[t] == UNSET));
            frontier.sort_unstable();
            frontier.dedup();
        }
        if let Some(t) = part.iter().position(|&p| p == UNSET) {
            return Err(ParMeshError::Partition(format!(
                "tetra {t} left unassigned by graph growing"
            )));
        }
        Ok(part)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::meshgen::cube_mesh;
    use crate::partitioning::part_loads;

    #[test]
    fn parts_are_balanced_and_complete() {
        let g = cube_mesh(4, 4, 4);
        let parts = GraphGrowing::new(7).partition(&g, 4).unwrap();
        let loads = part_loads(&parts, 4);
        assert_eq!(loads.iter().sum::<usize>(), g.n_tetra());
        assert!(loads.iter().all(|&l| l == g.n_tetra() / 4), "{loads:?}");
    }

    #[test]
    fn same_seed_same_partition() {
        let g = cube_mesh(3, 3, 2);
        let a = GraphGrowing::new(1).partition(&g, 3).unwrap();
        let b = GraphGrowing::new(1).partition(&g, 3).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn more_parts_than_tetra_leaves_empty_parts() {
        let g = cube_mesh(1, 1, 1);
        let parts = GraphGrowing::new(0).partition(&g, 8).unwrap();
        let loads = part_loads(&parts, 8);
        assert_eq!(loads.iter().filter(|&&l| l == 1).count(), 6);
    }
}
