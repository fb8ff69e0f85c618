//! Sizing metric attached to the points of a group.
//!
//! An isotropic metric stores one target edge size `h` per point; an
//! anisotropic metric stores the six upper-triangular entries
//! `(m11, m12, m13, m22, m23, m33)` of a symmetric tensor per point.
//! An empty metric means "no sizing given".

use crate::mesh_error::ParMeshError;
use serde::{Deserialize, Serialize};

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetricKind {
    #[default]
    Isotropic,
    Anisotropic,
}

impl MetricKind {
    pub const fn values_per_point(self) -> usize {
        match self {
            MetricKind::Isotropic => 1,
            MetricKind::Anisotropic => 6,
        }
    }

    /// Inverse of [`MetricKind::values_per_point`].
    pub fn from_size(size: usize) -> Result<Self, ParMeshError> {
        match size {
            1 => Ok(MetricKind::Isotropic),
            6 => Ok(MetricKind::Anisotropic),
            other => Err(ParMeshError::InvalidMetric(format!(
                "wrong data type: {other} values per point (expected 1 or 6)"
            ))),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    kind: MetricKind,
    values: Vec<f64>,
}

impl Metric {
    pub fn empty(kind: MetricKind) -> Self {
        Self {
            kind,
            values: Vec::new(),
        }
    }

    pub fn isotropic(sizes: Vec<f64>) -> Self {
        Self {
            kind: MetricKind::Isotropic,
            values: sizes,
        }
    }

    /// Uniform isotropic size for `n` points.
    pub fn constant(n: usize, h: f64) -> Self {
        Self::isotropic(vec![h; n])
    }

    /// Build from a flat value array; its length must be a multiple of the kind's size.
    pub fn from_values(kind: MetricKind, values: Vec<f64>) -> Result<Self, ParMeshError> {
        if values.len() % kind.values_per_point() != 0 {
            return Err(ParMeshError::InvalidMetric(format!(
                "{} values is not a multiple of {}",
                values.len(),
                kind.values_per_point()
            )));
        }
        Ok(Self { kind, values })
    }

    pub fn kind(&self) -> MetricKind {
        self.kind
    }

    pub fn size(&self) -> usize {
        self.kind.values_per_point()
    }

    /// Number of points carrying a value.
    pub fn len(&self) -> usize {
        self.values.len() / self.size()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    #[inline]
    pub fn at(&self, point: usize) -> &[f64] {
        let s = self.size();
        &self.values[point * s..(point + 1) * s]
    }

    #[inline]
    pub fn at_mut(&mut self, point: usize) -> &mut [f64] {
        let s = self.size();
        &mut self.values[point * s..(point + 1) * s]
    }

    pub fn push(&mut self, value: &[f64]) {
        debug_assert_eq!(value.len(), self.size());
        self.values.extend_from_slice(value);
    }

    /// Drop every value, keeping the kind.
    pub fn clear(&mut self) {
        self.values.clear();
    }

    /// Keep only the entries of the listed points, in that order.
    pub fn gather(&self, points: &[usize]) -> Self {
        if self.is_empty() {
            return Self::empty(self.kind);
        }
        let mut out = Self::empty(self.kind);
        out.values.reserve(points.len() * self.size());
        for &p in points {
            out.push(self.at(p));
        }
        out
    }

    /// Multiply lengths by `factor` (sizes scale linearly, tensors by `1/factor^2`).
    pub fn scale_lengths(&mut self, factor: f64) {
        match self.kind {
            MetricKind::Isotropic => self.values.iter_mut().for_each(|h| *h *= factor),
            MetricKind::Anisotropic => {
                let inv2 = 1.0 / (factor * factor);
                self.values.iter_mut().for_each(|m| *m *= inv2)
            }
        }
    }

    /// Validate the values against a point count.
    pub fn check(&self, n_points: usize) -> Result<(), ParMeshError> {
        if self.is_empty() {
            return Ok(());
        }
        if self.len() != n_points {
            return Err(ParMeshError::InvalidMetric(format!(
                "metric has {} entries for {n_points} points",
                self.len()
            )));
        }
        match self.kind {
            MetricKind::Isotropic => {
                if let Some(p) = self.values.iter().position(|h| !(h.is_finite() && *h > 0.0)) {
                    return Err(ParMeshError::InvalidMetric(format!(
                        "non-positive size {} at point {p}",
                        self.values[p]
                    )));
                }
            }
            MetricKind::Anisotropic => {
                for p in 0..self.len() {
                    let m = self.at(p);
                    if !(m[0] > 0.0 && m[3] > 0.0 && m[5] > 0.0) {
                        return Err(ParMeshError::InvalidMetric(format!(
                            "tensor at point {p} is not positive definite"
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_rejects_bad_sizes() {
        assert!(Metric::constant(3, 1.0).check(4).is_err());
        assert!(Metric::isotropic(vec![1.0, -1.0]).check(2).is_err());
        assert!(MetricKind::from_size(3).is_err());
        assert!(Metric::empty(MetricKind::Isotropic).check(10).is_ok());
    }

    #[test]
    fn gather_and_scale() {
        let mut m = Metric::isotropic(vec![1.0, 2.0, 3.0]);
        let g = m.gather(&[2, 0]);
        assert_eq!(g.values(), &[3.0, 1.0]);
        m.scale_lengths(2.0);
        assert_eq!(m.values(), &[2.0, 4.0, 6.0]);
    }
}
