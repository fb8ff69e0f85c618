//! Mesh entities: points, tetrahedra, and their flag sets.
//!
//! # Local face numbering
//! Face `i` of a tetrahedron is the face opposite vertex `i`. Its vertices are
//! listed in [`FACE_VERTICES`] so that, for a positively oriented tetrahedron,
//! the face normal points outward.
//!
//! Faces are addressed process-locally by the index `4 * tetra + face`
//! (see [`face_index`]).

use serde::{Deserialize, Serialize};

/// Global point identifier, stable across split, merge and migration.
///
/// `0` is reserved for points the local kernel just created and that have not
/// been numbered yet.
pub type GlobalId = u64;

/// Sentinel for a not-yet-numbered point.
pub const UNASSIGNED_GID: GlobalId = 0;

/// Vertices of face `i` (opposite vertex `i`), outward oriented.
pub const FACE_VERTICES: [[usize; 3]; 4] = [[1, 2, 3], [0, 3, 2], [0, 1, 3], [0, 2, 1]];

/// The six edges of a tetrahedron as local vertex pairs.
pub const EDGE_VERTICES: [[usize; 2]; 6] = [[0, 1], [0, 2], [0, 3], [1, 2], [1, 3], [2, 3]];

macro_rules! flag_set {
    ($(#[$meta:meta])* $name:ident { $($(#[$fmeta:meta])* $flag:ident = $bit:expr),* $(,)? }) => {
        $(#[$meta])*
        #[derive(Copy, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[repr(transparent)]
        pub struct $name(u8);

        impl $name {
            pub const NONE: Self = Self(0);
            $($(#[$fmeta])* pub const $flag: Self = Self($bit);)*

            #[inline]
            pub const fn bits(self) -> u8 {
                self.0
            }

            #[inline]
            pub const fn from_bits(bits: u8) -> Self {
                Self(bits)
            }

            #[inline]
            pub const fn contains(self, other: Self) -> bool {
                self.0 & other.0 == other.0
            }

            #[inline]
            pub fn insert(&mut self, other: Self) {
                self.0 |= other.0;
            }

            #[inline]
            pub fn remove(&mut self, other: Self) {
                self.0 &= !other.0;
            }

            #[inline]
            pub fn set(&mut self, other: Self, on: bool) {
                if on {
                    self.insert(other)
                } else {
                    self.remove(other)
                }
            }
        }

        impl std::ops::BitOr for $name {
            type Output = Self;
            fn bitor(self, rhs: Self) -> Self {
                Self(self.0 | rhs.0)
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                let mut set = f.debug_set();
                $(if self.contains(Self::$flag) && Self::$flag.0 != 0 {
                    set.entry(&stringify!($flag));
                })*
                set.finish()
            }
        }
    };
}

flag_set! {
    /// Per-point flags.
    PointFlags {
        /// Shared with at least one other group.
        INTERFACE = 0b001,
        /// Lies on the domain boundary surface.
        BOUNDARY = 0b010,
        /// Must not be moved or removed by the local kernel.
        REQUIRED = 0b100,
    }
}

flag_set! {
    /// Per-face flags, stored on each tetrahedron.
    FaceFlags {
        /// Face on a cut between groups (no opposite tetra in this group).
        INTERFACE = 0b01,
        /// Face on the domain boundary.
        BOUNDARY = 0b10,
    }
}

/// A mesh vertex.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub coords: [f64; 3],
    pub gid: GlobalId,
    pub flags: PointFlags,
}

impl Point {
    pub fn new(coords: [f64; 3], gid: GlobalId) -> Self {
        Self {
            coords,
            gid,
            flags: PointFlags::NONE,
        }
    }

    #[inline]
    pub fn is_interface(&self) -> bool {
        self.flags.contains(PointFlags::INTERFACE)
    }

    /// Squared distance to another point.
    pub fn dist2(&self, other: &Point) -> f64 {
        (0..3)
            .map(|d| (self.coords[d] - other.coords[d]).powi(2))
            .sum()
    }
}

/// A tetrahedron: four local point indices plus per-face flags.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tetra {
    pub v: [usize; 4],
    pub faces: [FaceFlags; 4],
    /// Material / region reference carried through remeshing.
    pub reference: i32,
}

impl Tetra {
    pub fn new(v: [usize; 4]) -> Self {
        Self {
            v,
            faces: [FaceFlags::NONE; 4],
            reference: 0,
        }
    }

    /// Local point indices of face `i`, outward oriented.
    #[inline]
    pub fn face_vertices(&self, i: usize) -> [usize; 3] {
        let [a, b, c] = FACE_VERTICES[i];
        [self.v[a], self.v[b], self.v[c]]
    }

    /// Sorted local point indices of face `i`, used as a hash key.
    #[inline]
    pub fn face_key(&self, i: usize) -> [usize; 3] {
        let mut k = self.face_vertices(i);
        k.sort_unstable();
        k
    }

    /// Swap two vertices to flip orientation; face flags follow the vertices.
    pub fn flip(&mut self) {
        self.v.swap(2, 3);
        self.faces.swap(2, 3);
    }
}

/// Process-local face address `4 * tetra + face`.
#[inline]
pub const fn face_index(tetra: usize, face: usize) -> usize {
    4 * tetra + face
}

/// Inverse of [`face_index`].
#[inline]
pub const fn split_face_index(idx: usize) -> (usize, usize) {
    (idx / 4, idx % 4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_compose() {
        let mut f = PointFlags::NONE;
        f.insert(PointFlags::INTERFACE | PointFlags::REQUIRED);
        assert!(f.contains(PointFlags::INTERFACE));
        assert!(!f.contains(PointFlags::BOUNDARY));
        f.remove(PointFlags::INTERFACE);
        assert_eq!(f, PointFlags::REQUIRED);
        assert_eq!(format!("{f:?}"), "{\"REQUIRED\"}");
    }

    #[test]
    fn faces_cover_every_vertex_but_one() {
        let t = Tetra::new([10, 11, 12, 13]);
        for i in 0..4 {
            let f = t.face_vertices(i);
            assert!(!f.contains(&t.v[i]));
        }
        assert_eq!(split_face_index(face_index(7, 3)), (7, 3));
    }

    #[test]
    fn flip_keeps_face_flags_with_vertices() {
        let mut t = Tetra::new([0, 1, 2, 3]);
        t.faces[2] = FaceFlags::INTERFACE;
        let key_before = t.face_key(2);
        t.flip();
        assert_eq!(t.face_key(3), key_before);
        assert!(t.faces[3].contains(FaceFlags::INTERFACE));
    }
}
