//! Boundary surface reconstruction on the merged mesh.
//!
//! Faces with no opposite tetrahedron are boundary faces; their points are
//! boundary points. Interior faces lose any stale boundary flag. The
//! resulting surface must be closed: every surface edge is shared by an even
//! number of boundary faces, and no face may still be an open interface.
//!
//! The working arrays are charged against a scratch budget, usually the spare
//! memory handed over once the communicators are gone.

use crate::memory::MemoryBudget;
use crate::mesh_error::ParMeshError;
use crate::topology::entity::{FaceFlags, PointFlags};
use crate::topology::group::Group;
use hashbrown::HashMap;
use log::debug;

/// Summary of a reconstructed boundary.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BoundaryStats {
    pub faces: usize,
    pub points: usize,
}

/// Rebuild the boundary flags of `group`. Scratch charges are returned to
/// `scratch` before this returns, on success or failure.
pub fn reconstruct_boundary(
    group: &mut Group,
    scratch: &mut MemoryBudget,
) -> Result<BoundaryStats, ParMeshError> {
    let base = scratch.current();
    let stats = flag_surface(group, scratch);
    let used = scratch.current().saturating_sub(base);
    scratch.release(used);
    stats
}

fn flag_surface(group: &mut Group, scratch: &mut MemoryBudget) -> Result<BoundaryStats, ParMeshError> {
    scratch.reserve_for::<Option<usize>>(4 * group.n_tetra(), "boundary adjacency")?;
    let adj = group.adjacency(0)?;
    let n_free = adj.free_faces().count();
    scratch.reserve_for::<((usize, usize), u32)>(3 * n_free, "boundary edges")?;
    scratch.reserve_for::<bool>(group.n_points(), "boundary points")?;
    let mut on_surface = vec![false; group.n_points()];
    let mut edges: HashMap<(usize, usize), u32> = HashMap::new();
    let mut faces = 0;
    for (k, t) in group.tetras_mut().iter_mut().enumerate() {
        for i in 0..4 {
            let free = adj.is_free(k, i);
            t.faces[i].set(FaceFlags::BOUNDARY, free);
            if !free {
                continue;
            }
            if t.faces[i].contains(FaceFlags::INTERFACE) {
                return Err(ParMeshError::Boundary(format!(
                    "face {i} of tetra {k} is an unmatched interface face"
                )));
            }
            faces += 1;
            let fv = t.face_vertices(i);
            for j in 0..3 {
                let (a, b) = (fv[j], fv[(j + 1) % 3]);
                *edges.entry((a.min(b), a.max(b))).or_default() += 1;
                on_surface[a] = true;
            }
        }
    }
    if let Some(((a, b), n)) = edges.iter().find(|(_, n)| **n % 2 == 1) {
        return Err(ParMeshError::Boundary(format!(
            "surface edge ({a}, {b}) bounds {n} faces; the surface is not closed"
        )));
    }
    let mut points = 0;
    for (p, &s) in group.points_mut().iter_mut().zip(&on_surface) {
        p.flags.set(PointFlags::BOUNDARY, s);
        points += usize::from(s);
    }
    debug!("boundary: {faces} faces, {points} points");
    Ok(BoundaryStats { faces, points })
}
