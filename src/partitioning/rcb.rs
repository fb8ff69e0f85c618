//! Recursive coordinate bisection of tetra centroids.

use super::{PartId, Partitioner};
use crate::mesh_error::ParMeshError;
use crate::topology::group::Group;

#[derive(Clone, Debug, Default)]
pub struct Rcb;

fn centroid(group: &Group, t: usize) -> [f64; 3] {
    let pts = group.points();
    let mut c = [0.0; 3];
    for &v in &group.tetras()[t].v {
        for d in 0..3 {
            c[d] += 0.25 * pts[v].coords[d];
        }
    }
    c
}

fn longest_axis(centroids: &[[f64; 3]], ids: &[usize]) -> usize {
    let mut lo = [f64::INFINITY; 3];
    let mut hi = [f64::NEG_INFINITY; 3];
    for &i in ids {
        for d in 0..3 {
            lo[d] = lo[d].min(centroids[i][d]);
            hi[d] = hi[d].max(centroids[i][d]);
        }
    }
    (0..3)
        .max_by(|&a, &b| (hi[a] - lo[a]).total_cmp(&(hi[b] - lo[b])))
        .unwrap_or(0)
}

fn bisect(
    centroids: &[[f64; 3]],
    ids: &mut [usize],
    first_part: PartId,
    nparts: usize,
    out: &mut [PartId],
) {
    if nparts <= 1 || ids.len() <= 1 {
        ids.iter().for_each(|&i| out[i] = first_part);
        return;
    }
    let axis = longest_axis(centroids, ids);
    ids.sort_unstable_by(|&a, &b| {
        centroids[a][axis]
            .total_cmp(&centroids[b][axis])
            .then(a.cmp(&b))
    });
    let left_parts = nparts / 2;
    let cut = ids.len() * left_parts / nparts;
    let (left, right) = ids.split_at_mut(cut);
    bisect(centroids, left, first_part, left_parts, out);
    bisect(centroids, right, first_part + left_parts, nparts - left_parts, out);
}

impl Partitioner for Rcb {
    fn partition(&self, group: &Group, nparts: usize) -> Result<Vec<PartId>, ParMeshError> {
        if nparts == 0 {
            return Err(ParMeshError::Partition("cannot partition into 0 parts".into()));
        }
        let n = group.n_tetra();
        let centroids: Vec<[f64; 3]> = (0..n).map(|t| centroid(group, t)).collect();
        let mut ids: Vec<usize> = (0..n).collect();
        let mut out = vec![0; n];
        bisect(&centroids, &mut ids, 0, nparts, &mut out);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::meshgen::box_mesh;
    use crate::partitioning::part_loads;

    #[test]
    fn splits_along_longest_axis() {
        let g = box_mesh([4, 1, 1], [4.0, 1.0, 1.0]);
        let parts = Rcb.partition(&g, 2).unwrap();
        for (t, &p) in parts.iter().enumerate() {
            let x = centroid(&g, t)[0];
            assert_eq!(p, usize::from(x > 2.0), "tetra {t} at x = {x}");
        }
    }

    #[test]
    fn odd_part_counts_balance() {
        let g = box_mesh([3, 3, 3], [1.0; 3]);
        let loads = part_loads(&Rcb.partition(&g, 3).unwrap(), 3);
        assert_eq!(loads, vec![54, 54, 54]);
    }
}
