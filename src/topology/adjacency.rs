//! Face-to-face adjacency of a tetrahedral group.
//!
//! For every face index `4 * k + i` the adjacency stores the index of the
//! opposite face in the neighbouring tetrahedron, or `None` when the face is
//! free (domain boundary or interface with another group).

use crate::mesh_error::ParMeshError;
use crate::topology::entity::{Tetra, face_index, split_face_index};
use hashbrown::HashMap;
use hashbrown::hash_map::Entry;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Adjacency {
    opposite: Vec<Option<usize>>,
}

impl Adjacency {
    /// Hash the faces of `tetras` and pair them up.
    ///
    /// `group` only labels errors. A face shared by more than two tetrahedra
    /// is a non-manifold configuration and is rejected.
    pub fn build(tetras: &[Tetra], group: usize) -> Result<Self, ParMeshError> {
        let mut opposite = vec![None; 4 * tetras.len()];
        let mut pending: HashMap<[usize; 3], usize> = HashMap::with_capacity(2 * tetras.len());
        for (k, t) in tetras.iter().enumerate() {
            for i in 0..4 {
                let idx = face_index(k, i);
                match pending.entry(t.face_key(i)) {
                    Entry::Vacant(slot) => {
                        slot.insert(idx);
                    }
                    Entry::Occupied(slot) => {
                        let other = *slot.get();
                        if opposite[other].is_some() {
                            return Err(ParMeshError::InvalidTetra {
                                group,
                                tetra: k,
                                reason: format!(
                                    "face {i} shared by more than two tetrahedra"
                                ),
                            });
                        }
                        opposite[other] = Some(idx);
                        opposite[idx] = Some(other);
                    }
                }
            }
        }
        Ok(Self { opposite })
    }

    pub fn n_faces(&self) -> usize {
        self.opposite.len()
    }

    /// Opposite `(tetra, face)` of face `i` of tetra `k`.
    #[inline]
    pub fn neighbor(&self, k: usize, i: usize) -> Option<(usize, usize)> {
        self.opposite[face_index(k, i)].map(split_face_index)
    }

    #[inline]
    pub fn is_free(&self, k: usize, i: usize) -> bool {
        self.opposite[face_index(k, i)].is_none()
    }

    /// All free faces as `(tetra, face)`, in face-index order.
    pub fn free_faces(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.opposite
            .iter()
            .enumerate()
            .filter(|(_, o)| o.is_none())
            .map(|(idx, _)| split_face_index(idx))
    }

    /// Tetra-to-tetra neighbour lists (the dual graph), used by partitioners.
    pub fn dual_graph(&self) -> Vec<Vec<usize>> {
        let n = self.opposite.len() / 4;
        (0..n)
            .map(|k| (0..4).filter_map(|i| self.neighbor(k, i).map(|(t, _)| t)).collect())
            .collect()
    }
}
