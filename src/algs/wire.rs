//! Fixed, versioned, little-endian wire types for group migration and
//! communicator matching.
//!
//! A payload is a [`WireHdr`] followed by sections. Each section is a
//! [`WireCount`] and that many `Pod` records. All multi-byte integers are
//! stored pre-LE with `.to_le()` and decoded with `::from_le()`; floats travel
//! as the LE bits of their `f64` representation.

use crate::geometry::metric::{Metric, MetricKind};
use crate::mesh_error::ParMeshError;
use crate::topology::entity::{FaceFlags, GlobalId, Point, PointFlags, Tetra};
use crate::topology::group::{Group, footprint_of};
use bytemuck::{Pod, Zeroable};
use bytes::{BufMut, BytesMut};
use static_assertions::const_assert_eq;
use std::mem::size_of;

/// Bump when the layout or semantics change in incompatible ways.
pub const WIRE_VERSION: u16 = 1;

pub const KIND_GROUP: u16 = 1;
pub const KIND_IDS: u16 = 2;
pub const KIND_FACE_KEYS: u16 = 3;
pub const KIND_NODES: u16 = 4;

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct WireHdr {
    pub version_le: u16,
    pub kind_le: u16,
    pub reserved_le: u32,
}

impl WireHdr {
    pub fn new(kind: u16) -> Self {
        Self {
            version_le: WIRE_VERSION.to_le(),
            kind_le: kind.to_le(),
            reserved_le: 0,
        }
    }
    pub fn kind(&self) -> u16 {
        u16::from_le(self.kind_le)
    }
    pub fn version(&self) -> u16 {
        u16::from_le(self.version_le)
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct WireCount {
    pub n_le: u64,
}

impl WireCount {
    pub fn new(n: usize) -> Self {
        Self {
            n_le: (n as u64).to_le(),
        }
    }
    pub fn get(&self) -> usize {
        u64::from_le(self.n_le) as usize
    }
}

#[repr(transparent)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct WireF64(pub u64);

impl WireF64 {
    pub fn of(x: f64) -> Self {
        Self(x.to_bits().to_le())
    }
    pub fn get(self) -> f64 {
        f64::from_bits(u64::from_le(self.0))
    }
}

#[repr(transparent)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct WireId(pub u64);

impl WireId {
    pub fn of(id: GlobalId) -> Self {
        Self(id.to_le())
    }
    pub fn get(self) -> GlobalId {
        u64::from_le(self.0)
    }
}

/// A point with its global id and flags.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct WirePoint {
    pub xyz: [WireF64; 3],
    pub gid_le: u64,
    pub flags_le: u32,
    pub _pad: u32,
}

impl WirePoint {
    pub fn of(p: &Point) -> Self {
        Self {
            xyz: p.coords.map(WireF64::of),
            gid_le: p.gid.to_le(),
            flags_le: u32::from(p.flags.bits()).to_le(),
            _pad: 0,
        }
    }
    pub fn get(&self) -> Point {
        let mut p = Point::new(self.xyz.map(WireF64::get), u64::from_le(self.gid_le));
        p.flags = PointFlags::from_bits(u32::from_le(self.flags_le) as u8);
        p
    }
}

/// A tetrahedron in payload-local point indices.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct WireTetra {
    pub v_le: [u64; 4],
    pub faces: [u8; 4],
    pub reference_le: i32,
}

impl WireTetra {
    pub fn of(t: &Tetra) -> Self {
        Self {
            v_le: t.v.map(|v| (v as u64).to_le()),
            faces: t.faces.map(FaceFlags::bits),
            reference_le: t.reference.to_le(),
        }
    }
    pub fn get(&self) -> Tetra {
        let mut t = Tetra::new(self.v_le.map(|v| u64::from_le(v) as usize));
        t.faces = self.faces.map(FaceFlags::from_bits);
        t.reference = i32::from_le(self.reference_le);
        t
    }
}

/// Sorted global ids of a face.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct WireFaceKey {
    pub gid_le: [u64; 3],
}

impl WireFaceKey {
    pub fn of(key: [GlobalId; 3]) -> Self {
        Self {
            gid_le: key.map(u64::to_le),
        }
    }
    pub fn get(&self) -> [GlobalId; 3] {
        self.gid_le.map(u64::from_le)
    }
}

/// Global id plus coordinates, for coincidence checks and resync.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct WireNode {
    pub gid_le: u64,
    pub xyz: [WireF64; 3],
}

impl WireNode {
    pub fn new(gid: GlobalId, coords: [f64; 3]) -> Self {
        Self {
            gid_le: gid.to_le(),
            xyz: coords.map(WireF64::of),
        }
    }
    pub fn gid(&self) -> GlobalId {
        u64::from_le(self.gid_le)
    }
    pub fn coords(&self) -> [f64; 3] {
        self.xyz.map(WireF64::get)
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
struct WireGroupHead {
    metric_size_le: u32,
    reserved_le: u32,
}

const_assert_eq!(size_of::<WireHdr>(), 8);
const_assert_eq!(size_of::<WireCount>(), 8);
const_assert_eq!(size_of::<WirePoint>(), 40);
const_assert_eq!(size_of::<WireTetra>(), 40);
const_assert_eq!(size_of::<WireFaceKey>(), 24);
const_assert_eq!(size_of::<WireNode>(), 32);

/// Builds a payload section by section.
pub struct WireWriter {
    buf: BytesMut,
}

impl WireWriter {
    pub fn new(kind: u16) -> Self {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_slice(bytemuck::bytes_of(&WireHdr::new(kind)));
        Self { buf }
    }

    pub fn section<T: Pod>(&mut self, records: &[T]) -> &mut Self {
        self.buf
            .put_slice(bytemuck::bytes_of(&WireCount::new(records.len())));
        self.buf.put_slice(bytemuck::cast_slice(records));
        self
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf.to_vec()
    }
}

/// Reads a payload produced by [`WireWriter`], checking every length.
pub struct WireReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub fn open(bytes: &'a [u8], kind: u16) -> Result<Self, ParMeshError> {
        let mut r = Self { bytes, pos: 0 };
        let hdr: WireHdr = r.read_one()?;
        if hdr.version() != WIRE_VERSION {
            return Err(ParMeshError::Wire(format!(
                "unsupported wire version {} (expected {WIRE_VERSION})",
                hdr.version()
            )));
        }
        if hdr.kind() != kind {
            return Err(ParMeshError::Wire(format!(
                "unexpected payload kind {} (expected {kind})",
                hdr.kind()
            )));
        }
        Ok(r)
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ParMeshError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.bytes.len())
            .ok_or_else(|| {
                ParMeshError::Wire(format!(
                    "truncated payload: need {n} bytes at offset {}, have {}",
                    self.pos,
                    self.bytes.len()
                ))
            })?;
        let out = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn read_one<T: Pod>(&mut self) -> Result<T, ParMeshError> {
        let raw = self.take(size_of::<T>())?;
        Ok(bytemuck::pod_read_unaligned(raw))
    }

    pub fn section<T: Pod>(&mut self) -> Result<Vec<T>, ParMeshError> {
        let n = self.read_one::<WireCount>()?.get();
        let len = n
            .checked_mul(size_of::<T>())
            .ok_or_else(|| ParMeshError::Wire(format!("section count {n} overflows")))?;
        let raw = self.take(len)?;
        Ok(raw
            .chunks_exact(size_of::<T>())
            .map(bytemuck::pod_read_unaligned)
            .collect())
    }

    /// Step over a section without decoding it; returns its record count.
    pub fn skip_section<T: Pod>(&mut self) -> Result<usize, ParMeshError> {
        let n = self.read_one::<WireCount>()?.get();
        let len = n
            .checked_mul(size_of::<T>())
            .ok_or_else(|| ParMeshError::Wire(format!("section count {n} overflows")))?;
        self.take(len)?;
        Ok(n)
    }

    /// Fails if bytes remain.
    pub fn finish(self) -> Result<(), ParMeshError> {
        if self.pos == self.bytes.len() {
            Ok(())
        } else {
            Err(ParMeshError::Wire(format!(
                "{} trailing bytes",
                self.bytes.len() - self.pos
            )))
        }
    }
}

/// Single-section payload.
pub fn encode_records<T: Pod>(kind: u16, records: &[T]) -> Vec<u8> {
    let mut w = WireWriter::new(kind);
    w.section(records);
    w.finish()
}

pub fn decode_records<T: Pod>(kind: u16, bytes: &[u8]) -> Result<Vec<T>, ParMeshError> {
    let mut r = WireReader::open(bytes, kind)?;
    let out = r.section()?;
    r.finish()?;
    Ok(out)
}

pub fn encode_ids(ids: &[GlobalId]) -> Vec<u8> {
    let recs: Vec<WireId> = ids.iter().copied().map(WireId::of).collect();
    encode_records(KIND_IDS, &recs)
}

pub fn decode_ids(bytes: &[u8]) -> Result<Vec<GlobalId>, ParMeshError> {
    Ok(decode_records::<WireId>(KIND_IDS, bytes)?
        .into_iter()
        .map(WireId::get)
        .collect())
}

/// Full migration payload of one group.
pub fn encode_group(group: &Group) -> Vec<u8> {
    let head = WireGroupHead {
        metric_size_le: (group.metric().size() as u32).to_le(),
        reserved_le: 0,
    };
    let points: Vec<WirePoint> = group.points().iter().map(WirePoint::of).collect();
    let tetras: Vec<WireTetra> = group.tetras().iter().map(WireTetra::of).collect();
    let metric: Vec<WireF64> = group
        .metric()
        .values()
        .iter()
        .copied()
        .map(WireF64::of)
        .collect();
    let mut w = WireWriter::new(KIND_GROUP);
    w.section(&[head])
        .section(&points)
        .section(&tetras)
        .section(&metric);
    w.finish()
}

/// Footprint of the group a payload decodes to, read from the section counts
/// alone so the memory can be reserved before decoding.
pub fn group_payload_footprint(bytes: &[u8]) -> Result<usize, ParMeshError> {
    let mut r = WireReader::open(bytes, KIND_GROUP)?;
    r.skip_section::<WireGroupHead>()?;
    let np = r.skip_section::<WirePoint>()?;
    let nt = r.skip_section::<WireTetra>()?;
    let nm = r.skip_section::<WireF64>()?;
    r.finish()?;
    Ok(footprint_of(np, nt, nm))
}

pub fn decode_group(bytes: &[u8]) -> Result<Group, ParMeshError> {
    let mut r = WireReader::open(bytes, KIND_GROUP)?;
    let head = r.section::<WireGroupHead>()?;
    let [head] = head.as_slice() else {
        return Err(ParMeshError::Wire(format!(
            "group payload has {} heads",
            head.len()
        )));
    };
    let kind = MetricKind::from_size(u32::from_le(head.metric_size_le) as usize)?;
    let points: Vec<Point> = r.section::<WirePoint>()?.iter().map(WirePoint::get).collect();
    let tetras: Vec<Tetra> = r.section::<WireTetra>()?.iter().map(WireTetra::get).collect();
    let values: Vec<f64> = r
        .section::<WireF64>()?
        .into_iter()
        .map(WireF64::get)
        .collect();
    r.finish()?;
    let np = points.len();
    if let Some((k, t)) = tetras.iter().enumerate().find(|(_, t)| t.v.iter().any(|&v| v >= np)) {
        return Err(ParMeshError::Wire(format!(
            "tetra {k} references point outside payload ({:?}, np = {np})",
            t.v
        )));
    }
    Ok(Group::new(points, tetras, Metric::from_values(kind, values)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::meshgen::cube_mesh;

    #[test]
    fn group_payload_preserves_everything() {
        let mut g = cube_mesh(2, 1, 1);
        g.points_mut()[3].flags.insert(PointFlags::INTERFACE);
        g.tetras_mut()[1].faces[2].insert(FaceFlags::INTERFACE);
        g.tetras_mut()[1].reference = 9;
        *g.metric_mut() = Metric::constant(g.n_points(), 0.25);
        let bytes = encode_group(&g);
        assert_eq!(group_payload_footprint(&bytes).unwrap(), g.footprint());
        let back = decode_group(&bytes).unwrap();
        assert_eq!(back, g);
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let bytes = encode_group(&cube_mesh(1, 1, 1));
        let cut = &bytes[..bytes.len() - 3];
        assert!(matches!(decode_group(cut), Err(ParMeshError::Wire(_))));
        assert!(matches!(group_payload_footprint(cut), Err(ParMeshError::Wire(_))));
    }

    #[test]
    fn kind_and_version_are_checked() {
        let ids = encode_ids(&[1, 2, 3]);
        assert!(matches!(decode_group(&ids), Err(ParMeshError::Wire(_))));
        let mut bad = ids.clone();
        bad[0] = 0xFF;
        assert!(decode_ids(&bad).is_err());
        assert_eq!(decode_ids(&ids).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn version_guard() {
        let hdr = WireHdr::new(KIND_NODES);
        assert_eq!(hdr.version(), WIRE_VERSION);
        assert_eq!(hdr.kind(), KIND_NODES);
    }
}
