//! A group: one self-contained tetrahedral partition with its metric.
//!
//! A group owns its points, tetrahedra and metric outright. Points shared with
//! other groups carry [`PointFlags::INTERFACE`]; the faces on the cut carry
//! [`FaceFlags::INTERFACE`]. Which *other* group or process holds the twin copy
//! is recorded only in the communicators, never in the group itself.

use crate::debug_invariants::DebugInvariants;
use crate::geometry::metric::{Metric, MetricKind};
use crate::geometry::quality::{EPS_VOLUME, QualitySummary, tetra_volume};
use crate::mesh_error::ParMeshError;
use crate::topology::adjacency::Adjacency;
use crate::topology::entity::{
    FaceFlags, GlobalId, Point, PointFlags, Tetra, UNASSIGNED_GID,
};
use hashbrown::HashSet;
use log::warn;

/// Affine map used to bring a group into the unit box and back.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct ScaleInfo {
    pub origin: [f64; 3],
    pub delta: f64,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Group {
    points: Vec<Point>,
    tetras: Vec<Tetra>,
    metric: Metric,
}

impl Group {
    pub fn new(points: Vec<Point>, tetras: Vec<Tetra>, metric: Metric) -> Self {
        Self {
            points,
            tetras,
            metric,
        }
    }

    pub fn empty(kind: MetricKind) -> Self {
        Self::new(Vec::new(), Vec::new(), Metric::empty(kind))
    }

    /// Replace the metric.
    pub fn with_metric(mut self, metric: Metric) -> Self {
        self.metric = metric;
        self
    }

    pub fn n_points(&self) -> usize {
        self.points.len()
    }

    pub fn n_tetra(&self) -> usize {
        self.tetras.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tetras.is_empty()
    }

    pub fn points(&self) -> &[Point] {
        &self.points
    }

    pub fn tetras(&self) -> &[Tetra] {
        &self.tetras
    }

    pub fn metric(&self) -> &Metric {
        &self.metric
    }

    pub fn points_mut(&mut self) -> &mut Vec<Point> {
        &mut self.points
    }

    pub fn tetras_mut(&mut self) -> &mut Vec<Tetra> {
        &mut self.tetras
    }

    pub fn metric_mut(&mut self) -> &mut Metric {
        &mut self.metric
    }

    /// Bytes this group charges against a memory budget.
    pub fn footprint(&self) -> usize {
        footprint_of(
            self.points.len(),
            self.tetras.len(),
            self.metric.values().len(),
        )
    }

    pub fn adjacency(&self, group: usize) -> Result<Adjacency, ParMeshError> {
        Adjacency::build(&self.tetras, group)
    }

    /// Indices of the points flagged as interface.
    pub fn interface_points(&self) -> impl Iterator<Item = usize> + '_ {
        self.points
            .iter()
            .enumerate()
            .filter(|(_, p)| p.is_interface())
            .map(|(i, _)| i)
    }

    /// `(tetra, face)` pairs flagged as interface.
    pub fn interface_faces(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.tetras.iter().enumerate().flat_map(|(k, t)| {
            (0..4)
                .filter(move |&i| t.faces[i].contains(FaceFlags::INTERFACE))
                .map(move |i| (k, i))
        })
    }

    /// Global ids of the three vertices of a face, sorted.
    pub fn face_gids(&self, k: usize, i: usize) -> [GlobalId; 3] {
        let [a, b, c] = self.tetras[k].face_vertices(i);
        let mut key = [self.points[a].gid, self.points[b].gid, self.points[c].gid];
        key.sort_unstable();
        key
    }

    pub fn max_gid(&self) -> GlobalId {
        self.points.iter().map(|p| p.gid).max().unwrap_or(0)
    }

    /// Number the points created by the kernel: `base + offset + j * stride`.
    ///
    /// Returns how many points received an id.
    pub fn assign_fresh_gids(&mut self, base: GlobalId, offset: u64, stride: u64) -> usize {
        let mut next = base + offset;
        let mut n = 0;
        for p in self.points.iter_mut().filter(|p| p.gid == UNASSIGNED_GID) {
            p.gid = next;
            next += stride;
            n += 1;
        }
        n
    }

    /// Total (signed) volume.
    pub fn volume(&self) -> f64 {
        self.tetras
            .iter()
            .map(|t| tetra_volume(&self.points, t))
            .sum()
    }

    pub fn quality(&self) -> QualitySummary {
        QualitySummary::of(&self.points, &self.tetras)
    }

    /// Flip inverted tetrahedra; degenerate ones are an error.
    pub fn orient(&mut self, group: usize) -> Result<usize, ParMeshError> {
        let mut flipped = 0;
        for (k, t) in self.tetras.iter_mut().enumerate() {
            let vol = tetra_volume(&self.points, t);
            if vol.abs() <= EPS_VOLUME {
                return Err(ParMeshError::InvalidTetra {
                    group,
                    tetra: k,
                    reason: format!("degenerate volume {vol:e}"),
                });
            }
            if vol < 0.0 {
                t.flip();
                flipped += 1;
            }
        }
        if flipped > 0 {
            warn!("group {group}: {flipped} tetrahedra with wrong orientation were reoriented");
        }
        Ok(flipped)
    }

    /// Move the group into the unit box; the metric follows.
    pub fn scale(&mut self) -> ScaleInfo {
        let mut lo = [f64::INFINITY; 3];
        let mut hi = [f64::NEG_INFINITY; 3];
        for p in &self.points {
            for d in 0..3 {
                lo[d] = lo[d].min(p.coords[d]);
                hi[d] = hi[d].max(p.coords[d]);
            }
        }
        let delta = (0..3).map(|d| hi[d] - lo[d]).fold(0.0, f64::max);
        let info = ScaleInfo {
            origin: if self.points.is_empty() { [0.0; 3] } else { lo },
            delta: if delta > 0.0 { delta } else { 1.0 },
        };
        let inv = 1.0 / info.delta;
        for p in &mut self.points {
            for d in 0..3 {
                p.coords[d] = inv * (p.coords[d] - info.origin[d]);
            }
        }
        self.metric.scale_lengths(inv);
        info
    }

    /// Undo [`Group::scale`].
    pub fn unscale(&mut self, info: &ScaleInfo) {
        for p in &mut self.points {
            for d in 0..3 {
                p.coords[d] = info.origin[d] + info.delta * p.coords[d];
            }
        }
        self.metric.scale_lengths(info.delta);
    }

    /// Drop every interface flag (points and faces).
    pub fn clear_interface(&mut self) {
        self.points
            .iter_mut()
            .for_each(|p| p.flags.remove(PointFlags::INTERFACE));
        for t in &mut self.tetras {
            t.faces.iter_mut().for_each(|f| f.remove(FaceFlags::INTERFACE));
        }
    }

    /// Snapshot `(gid, coords)` of every interface point, sorted by gid.
    pub fn interface_snapshot(&self) -> Vec<(GlobalId, [f64; 3])> {
        let mut snap: Vec<_> = self
            .points
            .iter()
            .filter(|p| p.is_interface())
            .map(|p| (p.gid, p.coords))
            .collect();
        snap.sort_unstable_by_key(|&(g, _)| g);
        snap
    }
}

/// Bytes charged for a group of the given dimensions.
pub fn footprint_of(n_points: usize, n_tetra: usize, n_metric_values: usize) -> usize {
    n_points * std::mem::size_of::<Point>()
        + n_tetra * std::mem::size_of::<Tetra>()
        + n_metric_values * std::mem::size_of::<f64>()
}

impl DebugInvariants for Group {
    fn validate_invariants(&self) -> Result<(), ParMeshError> {
        let np = self.points.len();
        for (k, t) in self.tetras.iter().enumerate() {
            if let Some(&bad) = t.v.iter().find(|&&v| v >= np) {
                return Err(ParMeshError::InvalidTetra {
                    group: usize::MAX,
                    tetra: k,
                    reason: format!("vertex {bad} out of range (np = {np})"),
                });
            }
            let mut v = t.v;
            v.sort_unstable();
            if v.windows(2).any(|w| w[0] == w[1]) {
                return Err(ParMeshError::InvalidTetra {
                    group: usize::MAX,
                    tetra: k,
                    reason: "repeated vertex".into(),
                });
            }
        }
        self.metric.check(np)?;
        let mut seen = HashSet::with_capacity(np);
        for p in &self.points {
            if p.gid != UNASSIGNED_GID && !seen.insert(p.gid) {
                return Err(ParMeshError::MergeMismatch {
                    gid: p.gid,
                    reason: "global id used twice in one group".into(),
                });
            }
        }
        Ok(())
    }

    fn debug_assert_invariants(&self) {
        crate::debug_invariants!(self.validate_invariants(), "Group");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::meshgen::cube_mesh;

    #[test]
    fn cube_is_valid_and_positive() {
        let g = cube_mesh(2, 2, 2);
        g.validate_invariants().unwrap();
        assert_eq!(g.n_tetra(), 48);
        assert!((g.volume() - 1.0).abs() < 1e-12);
        assert_eq!(g.quality().n_inverted, 0);
    }

    #[test]
    fn scale_roundtrip() {
        let mut g = cube_mesh(1, 1, 1);
        for p in g.points_mut() {
            p.coords = [p.coords[0] * 4.0 + 1.0, p.coords[1] * 2.0, p.coords[2] - 3.0];
        }
        let before = g.points().to_vec();
        let info = g.scale();
        assert_eq!(info.delta, 4.0);
        assert!(g.points().iter().all(|p| p.coords.iter().all(|&c| (0.0..=1.0).contains(&c))));
        g.unscale(&info);
        for (a, b) in before.iter().zip(g.points()) {
            assert!(a.dist2(b) < 1e-24);
        }
    }

    #[test]
    fn orient_flips_inverted() {
        let mut g = cube_mesh(1, 1, 1);
        g.tetras_mut()[0].flip();
        assert_eq!(g.orient(0).unwrap(), 1);
        assert_eq!(g.quality().n_inverted, 0);
    }

    #[test]
    fn fresh_gids_are_strided() {
        let mut g = cube_mesh(1, 1, 1);
        g.points_mut()[3].gid = UNASSIGNED_GID;
        g.points_mut()[5].gid = UNASSIGNED_GID;
        assert_eq!(g.assign_fresh_gids(100, 2, 4), 2);
        assert_eq!(g.points()[3].gid, 102);
        assert_eq!(g.points()[5].gid, 106);
    }

    #[test]
    fn out_of_range_vertex_is_reported() {
        let mut g = cube_mesh(1, 1, 1);
        g.tetras_mut()[0].v[0] = 1000;
        assert!(matches!(
            g.validate_invariants(),
            Err(ParMeshError::InvalidTetra { tetra: 0, .. })
        ));
    }
}
