//! Driver configuration.
//!
//! Everything the driver needs to decide is carried by [`ParMeshConfig`]:
//! iteration budget, entry mode, balance and partition policies, memory
//! ceiling and the options forwarded to the local remesh kernel. The
//! configuration is plain serde data and is validated once, before the loop
//! starts.

use crate::mesh_error::ParMeshError;
use serde::{Deserialize, Serialize};

/// Options forwarded to the local kernel and checked before the loop.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemeshOptions {
    /// Lagrangian motion mode (not supported in parallel).
    pub lagrangian: Option<u8>,
    /// Level-set discretization (not supported in parallel).
    pub iso: bool,
    /// Keep the existing edge lengths (builds a metric from the mesh).
    pub optim: bool,
    /// Strong mesh optimisation for LES; isotropic metrics only.
    pub optim_les: bool,
    /// Constant target size.
    pub hsiz: Option<f64>,
    /// Metric edge length above which the kernel refines.
    pub refine_threshold: f64,
}

impl Default for RemeshOptions {
    fn default() -> Self {
        Self {
            lagrangian: None,
            iso: false,
            optim: false,
            optim_les: false,
            hsiz: None,
            refine_threshold: std::f64::consts::SQRT_2,
        }
    }
}

/// Where the input mesh lives when the run starts.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum InputMode {
    /// Rank 0 holds the whole mesh.
    #[default]
    Centralized,
    /// Every rank holds its own groups with consistent global ids.
    Distributed,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BalancePolicy {
    pub enabled: bool,
    /// Rebalance when `max_load / mean_load - 1` exceeds this.
    pub imbalance_threshold: f64,
    /// Groups larger than `mean_load / grains_per_proc` are split before moving.
    pub grains_per_proc: usize,
    /// Merge the groups of a rank into one after migration.
    pub merge_arrivals: bool,
}

impl Default for BalancePolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            imbalance_threshold: 0.2,
            grains_per_proc: 4,
            merge_arrivals: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartitionPolicy {
    /// Breadth-first region growing over the tetra dual graph.
    GraphGrowing { seed: u64 },
    /// Recursive coordinate bisection of tetra centroids.
    Rcb,
}

impl Default for PartitionPolicy {
    fn default() -> Self {
        PartitionPolicy::GraphGrowing { seed: 42 }
    }
}

/// How the balancer weighs a group.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum WeightPolicy {
    #[default]
    TetraCount,
    /// Tetra count scaled by the expected refinement from the metric.
    MetricCost,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParMeshConfig {
    /// Maximum number of balance/remesh iterations.
    pub niter: usize,
    pub mode: InputMode,
    pub balance: BalancePolicy,
    pub partition: PartitionPolicy,
    pub weight: WeightPolicy,
    /// Let the kernel move interface points; they are resynchronized after.
    pub interface_motion: bool,
    /// Process memory ceiling in bytes; `None` means unlimited.
    pub mem_glo_max: Option<usize>,
    /// Coordinates closer than this are the same point.
    pub geometric_tolerance: f64,
    pub remesh: RemeshOptions,
    /// Log the phase trace at `info` level.
    pub verbose: bool,
}

impl Default for ParMeshConfig {
    fn default() -> Self {
        Self {
            niter: 3,
            mode: InputMode::default(),
            balance: BalancePolicy::default(),
            partition: PartitionPolicy::default(),
            weight: WeightPolicy::default(),
            interface_motion: false,
            mem_glo_max: None,
            geometric_tolerance: 1e-9,
            remesh: RemeshOptions::default(),
            verbose: false,
        }
    }
}

impl ParMeshConfig {
    pub fn validate(&self) -> Result<(), ParMeshError> {
        let bad = |msg: String| Err(ParMeshError::InvalidConfig(msg));
        let b = &self.balance;
        if !b.imbalance_threshold.is_finite() || b.imbalance_threshold < 0.0 {
            return bad(format!(
                "imbalance threshold must be finite and >= 0, got {}",
                b.imbalance_threshold
            ));
        }
        if b.grains_per_proc == 0 {
            return bad("grains_per_proc must be >= 1".into());
        }
        if !self.geometric_tolerance.is_finite() || self.geometric_tolerance < 0.0 {
            return bad(format!(
                "geometric tolerance must be finite and >= 0, got {}",
                self.geometric_tolerance
            ));
        }
        if self.mem_glo_max == Some(0) {
            return bad("memory ceiling must be > 0".into());
        }
        if let Some(h) = self.remesh.hsiz {
            if !(h.is_finite() && h > 0.0) {
                return bad(format!("hsiz must be > 0, got {h}"));
            }
        }
        if !(self.remesh.refine_threshold.is_finite() && self.remesh.refine_threshold > 1.0) {
            return bad(format!(
                "refine threshold must be > 1, got {}",
                self.remesh.refine_threshold
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        ParMeshConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_bad_values() {
        let mut cfg = ParMeshConfig::default();
        cfg.balance.grains_per_proc = 0;
        assert!(matches!(cfg.validate(), Err(ParMeshError::InvalidConfig(_))));

        let mut cfg = ParMeshConfig::default();
        cfg.remesh.hsiz = Some(-1.0);
        assert!(cfg.validate().is_err());

        let mut cfg = ParMeshConfig::default();
        cfg.balance.imbalance_threshold = f64::NAN;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let cfg: ParMeshConfig =
            serde_json::from_str(r#"{ "niter": 1, "partition": "Rcb" }"#).unwrap();
        assert_eq!(cfg.niter, 1);
        assert_eq!(cfg.partition, PartitionPolicy::Rcb);
        assert_eq!(cfg.balance, BalancePolicy::default());
    }
}
