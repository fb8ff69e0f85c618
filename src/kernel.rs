//! The local remeshing kernel as a capability trait.
//!
//! The driver never looks inside a kernel: it hands over one group at a time
//! and reads back an [`Outcome`]. Quality evaluation, scaling and boundary
//! reconstruction have default implementations that kernels may override.

use crate::algs::boundary::{BoundaryStats, reconstruct_boundary};
use crate::config::RemeshOptions;
use crate::geometry::quality::{QualitySummary, mean_metric_size, regular_volume, tetra_volume};
use crate::memory::MemoryBudget;
use crate::mesh_error::{Outcome, ParMeshError};
use crate::topology::entity::{FaceFlags, Point, Tetra, UNASSIGNED_GID};
use crate::topology::group::{Group, ScaleInfo};
use log::debug;

/// What the kernel knows about the group it is working on.
#[derive(Clone, Copy, Debug)]
pub struct KernelContext<'a> {
    pub rank: usize,
    pub group: usize,
    pub options: &'a RemeshOptions,
    /// Interface points must keep their position.
    pub interface_fixed: bool,
}

pub trait RemeshKernel {
    fn name(&self) -> &str;

    /// Remesh `group` in place. Interface faces must survive unchanged and,
    /// when `ctx.interface_fixed`, so must interface points. New points carry
    /// [`UNASSIGNED_GID`].
    fn remesh(&self, group: &mut Group, ctx: &KernelContext<'_>) -> Outcome;

    /// Whether another pass would still change `group`.
    fn needs_adaptation(&self, _group: &Group, _options: &RemeshOptions) -> bool {
        false
    }

    fn quality(&self, group: &Group) -> QualitySummary {
        group.quality()
    }

    fn scale(&self, group: &mut Group) -> ScaleInfo {
        group.scale()
    }

    fn unscale(&self, group: &mut Group, info: &ScaleInfo) {
        group.unscale(info)
    }

    /// Rebuild the boundary of the merged mesh. Working memory is charged
    /// against `scratch`, the spare left once the communicators are gone.
    fn build_boundary(
        &self,
        group: &mut Group,
        scratch: &mut MemoryBudget,
    ) -> Result<BoundaryStats, ParMeshError> {
        reconstruct_boundary(group, scratch)
    }
}

/// Leaves every group untouched.
#[derive(Clone, Copy, Debug, Default)]
pub struct IdentityKernel;

impl RemeshKernel for IdentityKernel {
    fn name(&self) -> &str {
        "identity"
    }

    fn remesh(&self, _group: &mut Group, _ctx: &KernelContext<'_>) -> Outcome {
        Outcome::Success
    }
}

/// Refines by inserting the centroid of every tetrahedron that is too large
/// for the metric and splitting it into four. Faces are never split, so the
/// interface and the boundary are left exactly as they were.
#[derive(Clone, Copy, Debug, Default)]
pub struct CentroidSplitKernel;

impl CentroidSplitKernel {
    fn too_large(group: &Group, t: &Tetra, threshold: f64) -> bool {
        mean_metric_size(group.metric(), t).is_some_and(|h| {
            tetra_volume(group.points(), t) > regular_volume(h * threshold)
        })
    }
}

impl RemeshKernel for CentroidSplitKernel {
    fn name(&self) -> &str {
        "centroid-split"
    }

    fn remesh(&self, group: &mut Group, ctx: &KernelContext<'_>) -> Outcome {
        let threshold = ctx.options.refine_threshold;
        let marked: Vec<usize> = (0..group.n_tetra())
            .filter(|&k| Self::too_large(group, &group.tetras()[k], threshold))
            .collect();
        if marked.is_empty() {
            return Outcome::Success;
        }
        let with_metric = !group.metric().is_empty();
        for &k in &marked {
            let t = group.tetras()[k];
            let mut c = [0.0; 3];
            for &v in &t.v {
                for d in 0..3 {
                    c[d] += 0.25 * group.points()[v].coords[d];
                }
            }
            let mut metric_value = vec![0.0; group.metric().size()];
            if with_metric {
                for &v in &t.v {
                    for (m, x) in metric_value.iter_mut().zip(group.metric().at(v)) {
                        *m += 0.25 * x;
                    }
                }
            }
            let ci = group.n_points();
            group
                .points_mut()
                .push(Point::new(c, UNASSIGNED_GID));
            if with_metric {
                group.metric_mut().push(&metric_value);
            }
            for i in 0..4 {
                let mut sub = t;
                sub.v[i] = ci;
                sub.faces = [FaceFlags::NONE; 4];
                sub.faces[i] = t.faces[i];
                if i == 0 {
                    group.tetras_mut()[k] = sub;
                } else {
                    group.tetras_mut().push(sub);
                }
            }
        }
        debug!(
            "rank {} group {}: split {} tetra, now {}",
            ctx.rank,
            ctx.group,
            marked.len(),
            group.n_tetra()
        );
        Outcome::Success
    }

    fn needs_adaptation(&self, group: &Group, options: &RemeshOptions) -> bool {
        group
            .tetras()
            .iter()
            .any(|t| Self::too_large(group, t, options.refine_threshold))
    }
}
