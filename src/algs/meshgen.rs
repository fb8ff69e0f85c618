//! Structured tetrahedral meshes of boxes.
//!
//! Each hexahedral cell is cut into six tetrahedra along its main diagonal
//! (Kuhn subdivision), so neighbouring cells always agree on their shared
//! face diagonals and the result is conforming.

use crate::geometry::metric::{Metric, MetricKind};
use crate::geometry::quality::tetra_volume;
use crate::topology::adjacency::Adjacency;
use crate::topology::entity::{FaceFlags, Point, PointFlags, Tetra};
use crate::topology::group::Group;
use itertools::iproduct;

const AXIS_ORDERS: [[usize; 3]; 6] = [
    [0, 1, 2],
    [0, 2, 1],
    [1, 0, 2],
    [1, 2, 0],
    [2, 0, 1],
    [2, 1, 0],
];

/// Mesh the box `[0,lx] x [0,ly] x [0,lz]` with `nx * ny * nz` cells.
///
/// Points get global ids `1..=np`; boundary faces and points are flagged
/// [`FaceFlags::BOUNDARY`] / [`PointFlags::BOUNDARY`]. The metric is empty.
pub fn box_mesh(n: [usize; 3], l: [f64; 3]) -> Group {
    let [nx, ny, nz] = n;
    let vid = |i: usize, j: usize, k: usize| i + (nx + 1) * (j + (ny + 1) * k);

    let mut points = Vec::with_capacity((nx + 1) * (ny + 1) * (nz + 1));
    for (k, j, i) in iproduct!(0..=nz, 0..=ny, 0..=nx) {
        let coords = [
            l[0] * i as f64 / nx.max(1) as f64,
            l[1] * j as f64 / ny.max(1) as f64,
            l[2] * k as f64 / nz.max(1) as f64,
        ];
        points.push(Point::new(coords, points.len() as u64 + 1));
    }

    let mut tetras = Vec::with_capacity(6 * nx * ny * nz);
    for (k, j, i) in iproduct!(0..nz, 0..ny, 0..nx) {
        let corner = |bits: usize| vid(i + (bits & 1), j + ((bits >> 1) & 1), k + ((bits >> 2) & 1));
        for order in AXIS_ORDERS {
            let b1 = 1 << order[0];
            let b2 = b1 | (1 << order[1]);
            let mut t = Tetra::new([corner(0), corner(b1), corner(b2), corner(7)]);
            if tetra_volume(&points, &t) < 0.0 {
                t.flip();
            }
            tetras.push(t);
        }
    }

    if let Ok(adj) = Adjacency::build(&tetras, 0) {
        for (kt, i) in adj.free_faces().collect::<Vec<_>>() {
            tetras[kt].faces[i].insert(FaceFlags::BOUNDARY);
            for v in tetras[kt].face_vertices(i) {
                points[v].flags.insert(PointFlags::BOUNDARY);
            }
        }
    }

    Group::new(points, tetras, Metric::empty(MetricKind::Isotropic))
}

/// Unit cube with `nx * ny * nz` cells (`6 * nx * ny * nz` tetrahedra).
pub fn cube_mesh(nx: usize, ny: usize, nz: usize) -> Group {
    box_mesh([nx, ny, nz], [1.0; 3])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debug_invariants::DebugInvariants;

    #[test]
    fn kuhn_cube_is_conforming() {
        let g = cube_mesh(3, 2, 2);
        g.validate_invariants().unwrap();
        assert_eq!(g.n_tetra(), 72);
        assert_eq!(g.n_points(), 4 * 3 * 3);
        let adj = g.adjacency(0).unwrap();
        // boundary of a 3x2x2 box: 2 triangles per cell face on the surface
        let surface_quads = 2 * (3 * 2 + 3 * 2 + 2 * 2);
        assert_eq!(adj.free_faces().count(), 2 * surface_quads);
        assert!((g.volume() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn boundary_points_are_flagged() {
        let g = cube_mesh(2, 2, 2);
        let interior: Vec<_> = g
            .points()
            .iter()
            .filter(|p| !p.flags.contains(PointFlags::BOUNDARY))
            .collect();
        assert_eq!(interior.len(), 1);
        assert_eq!(interior[0].coords, [0.5, 0.5, 0.5]);
    }
}
