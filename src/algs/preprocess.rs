//! Input validation and per-group preprocessing, run once before the loop.

use crate::algs::collective::agree;
use crate::algs::transport::Transport;
use crate::config::RemeshOptions;
use crate::geometry::metric::{Metric, MetricKind};
use crate::geometry::quality::EPS_VOLUME;
use crate::mesh_error::{Outcome, ParMeshError};
use crate::topology::entity::EDGE_VERTICES;
use crate::topology::group::Group;
use hashbrown::HashSet;
use log::{debug, warn};

/// Reject option combinations the parallel remesher cannot honour.
pub fn check_options(opts: &RemeshOptions, groups: &[Group]) -> Result<(), ParMeshError> {
    let bad = |msg: &str| Err(ParMeshError::InvalidOptions(msg.to_string()));
    if opts.lagrangian.is_some() {
        return bad("lagrangian mode unavailable");
    }
    if opts.iso {
        return bad("level-set discretization unavailable");
    }
    let has_metric = groups.iter().any(|g| !g.metric().is_empty());
    let aniso = groups
        .iter()
        .any(|g| !g.metric().is_empty() && g.metric().kind() == MetricKind::Anisotropic);
    if opts.optim_les && aniso {
        return bad("strong mesh optimization for LES methods unavailable with an anisotropic metric");
    }
    if opts.optim && has_metric {
        return bad("mesh optimization unavailable with an input metric");
    }
    if opts.hsiz.is_some() && has_metric {
        return bad("constant size unavailable with an input metric");
    }
    if opts.optim && opts.hsiz.is_some() {
        return bad("mesh optimization and constant size are mutually exclusive");
    }
    Ok(())
}

/// Drop metrics that do not match their group, then check the options.
pub fn check_input_data(groups: &mut [Group], opts: &RemeshOptions) -> Result<(), ParMeshError> {
    for (g, group) in groups.iter_mut().enumerate() {
        let np = group.n_points();
        let metric = group.metric_mut();
        if !metric.is_empty() && metric.len() != np {
            warn!(
                "group {g}: metric has {} entries for {np} points, ignored",
                metric.len()
            );
            metric.clear();
        }
    }
    check_options(opts, groups)
}

/// [`check_input_data`] on every rank; any failure fails all. Collective.
pub fn check_input<C: Transport>(
    comm: &C,
    groups: &mut [Group],
    opts: &RemeshOptions,
) -> Result<(), ParMeshError> {
    agree(comm, check_input_data(groups, opts))
}

/// Mean length of the edges incident to each point.
pub fn mean_edge_length_metric(group: &Group) -> Metric {
    let pts = group.points();
    let mut sum = vec![0.0; pts.len()];
    let mut cnt = vec![0usize; pts.len()];
    let mut seen = HashSet::with_capacity(group.n_tetra() * 2);
    for t in group.tetras() {
        for [a, b] in EDGE_VERTICES {
            let (a, b) = (t.v[a].min(t.v[b]), t.v[a].max(t.v[b]));
            if !seen.insert((a, b)) {
                continue;
            }
            let len = pts[a].dist2(&pts[b]).sqrt();
            for v in [a, b] {
                sum[v] += len;
                cnt[v] += 1;
            }
        }
    }
    Metric::isotropic(
        sum.iter()
            .zip(&cnt)
            .map(|(&s, &c)| if c > 0 { s / c as f64 } else { 1.0 })
            .collect(),
    )
}

fn preprocess_scaled(
    group: &mut Group,
    g: usize,
    opts: &RemeshOptions,
    delta: f64,
) -> Result<(), ParMeshError> {
    group.orient(g)?;
    if opts.optim && group.metric().is_empty() {
        *group.metric_mut() = mean_edge_length_metric(group);
    }
    if let Some(h) = opts.hsiz {
        *group.metric_mut() = Metric::constant(group.n_points(), h / delta);
    }
    group.metric().check(group.n_points())?;
    let q = group.quality();
    if q.n_tetra > 0 && q.min <= EPS_VOLUME {
        return Err(ParMeshError::InvalidTetra {
            group: g,
            tetra: usize::MAX,
            reason: format!("worst quality {:e}", q.min),
        });
    }
    debug!(
        "group {g}: {} tetra, quality min {:.4} mean {:.4}",
        q.n_tetra, q.min, q.mean
    );
    Ok(())
}

/// Scale into the unit box, orient, derive the metric, evaluate quality and
/// scale back. The group is always restored to its input frame, so a strong
/// failure here is reported as [`ParMeshError::Preprocess`].
pub fn preprocess_group(group: &mut Group, g: usize, opts: &RemeshOptions) -> Result<(), ParMeshError> {
    if group.is_empty() {
        return Ok(());
    }
    let info = group.scale();
    let res = preprocess_scaled(group, g, opts, info.delta);
    group.unscale(&info);
    res.map_err(|e| match e.outcome() {
        Outcome::StrongFailure => ParMeshError::Preprocess {
            group: g,
            reason: e.to_string(),
        },
        _ => e,
    })
}

pub fn preprocess_all(groups: &mut [Group], opts: &RemeshOptions) -> Result<(), ParMeshError> {
    groups
        .iter_mut()
        .enumerate()
        .try_for_each(|(g, group)| preprocess_group(group, g, opts))
}
