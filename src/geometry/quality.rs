//! Tetrahedron measures: signed volume, edge lengths, shape quality.
//!
//! The shape quality is `72√3 · V / (Σ l²)^{3/2}`, which equals `1` for the
//! regular tetrahedron and tends to `0` for degenerate ones. Negative values
//! flag inverted elements.

use crate::geometry::metric::Metric;
use crate::topology::entity::{EDGE_VERTICES, Point, Tetra};

const ALPHA: f64 = 124.707_658_144_959_2; // 72 * sqrt(3)

/// Volumes below this are treated as degenerate.
pub const EPS_VOLUME: f64 = 1e-30;

#[inline]
fn sub(a: &[f64; 3], b: &[f64; 3]) -> [f64; 3] {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

/// Signed volume of the tetrahedron `(a, b, c, d)`.
pub fn signed_volume(a: &[f64; 3], b: &[f64; 3], c: &[f64; 3], d: &[f64; 3]) -> f64 {
    let u = sub(b, a);
    let v = sub(c, a);
    let w = sub(d, a);
    let det = u[0] * (v[1] * w[2] - v[2] * w[1]) - u[1] * (v[0] * w[2] - v[2] * w[0])
        + u[2] * (v[0] * w[1] - v[1] * w[0]);
    det / 6.0
}

/// Signed volume of a tetra whose vertices index into `points`.
pub fn tetra_volume(points: &[Point], t: &Tetra) -> f64 {
    signed_volume(
        &points[t.v[0]].coords,
        &points[t.v[1]].coords,
        &points[t.v[2]].coords,
        &points[t.v[3]].coords,
    )
}

/// Squared Euclidean lengths of the six edges.
pub fn edge_lengths2(points: &[Point], t: &Tetra) -> [f64; 6] {
    let mut out = [0.0; 6];
    for (slot, [i, j]) in out.iter_mut().zip(EDGE_VERTICES) {
        *slot = points[t.v[i]].dist2(&points[t.v[j]]);
    }
    out
}

/// Isotropic shape quality in `[-1, 1]`.
pub fn tetra_quality(points: &[Point], t: &Tetra) -> f64 {
    let vol = tetra_volume(points, t);
    let sum: f64 = edge_lengths2(points, t).iter().sum();
    if sum <= 0.0 {
        return 0.0;
    }
    ALPHA * vol / sum.powf(1.5)
}

/// Volume of the regular tetrahedron with edge length `h`.
pub fn regular_volume(h: f64) -> f64 {
    h * h * h / (6.0 * std::f64::consts::SQRT_2)
}

/// Mean target size over the four vertices, `None` without a metric.
///
/// Tensors contribute `det(M)^(-1/6)` computed from their diagonal.
pub fn mean_metric_size(metric: &Metric, t: &Tetra) -> Option<f64> {
    if metric.is_empty() {
        return None;
    }
    let size_at = |v: usize| {
        let m = metric.at(v);
        match m.len() {
            1 => m[0],
            _ => (m[0] * m[3] * m[5]).powf(-1.0 / 6.0),
        }
    };
    Some(t.v.iter().map(|&v| size_at(v)).sum::<f64>() / 4.0)
}

/// Aggregate quality figures of a set of tetrahedra.
#[derive(Clone, Copy, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct QualitySummary {
    pub n_tetra: usize,
    pub min: f64,
    pub mean: f64,
    pub volume: f64,
    /// Number of elements with non-positive volume.
    pub n_inverted: usize,
}

impl Default for QualitySummary {
    fn default() -> Self {
        Self {
            n_tetra: 0,
            min: 1.0,
            mean: 0.0,
            volume: 0.0,
            n_inverted: 0,
        }
    }
}

impl QualitySummary {
    pub fn of(points: &[Point], tetras: &[Tetra]) -> Self {
        let mut s = Self::default();
        let mut sum = 0.0;
        for t in tetras {
            let q = tetra_quality(points, t);
            let vol = tetra_volume(points, t);
            if vol <= EPS_VOLUME {
                s.n_inverted += 1;
            }
            s.min = s.min.min(q);
            sum += q;
            s.volume += vol;
        }
        s.n_tetra = tetras.len();
        if s.n_tetra > 0 {
            s.mean = sum / s.n_tetra as f64;
        }
        s
    }

    /// Combine two summaries, e.g. across groups.
    pub fn combine(self, other: Self) -> Self {
        let n = self.n_tetra + other.n_tetra;
        let mean = if n == 0 {
            0.0
        } else {
            (self.mean * self.n_tetra as f64 + other.mean * other.n_tetra as f64) / n as f64
        };
        Self {
            n_tetra: n,
            min: self.min.min(other.min),
            mean,
            volume: self.volume + other.volume,
            n_inverted: self.n_inverted + other.n_inverted,
        }
    }
}
