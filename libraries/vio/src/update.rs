//! Visual measurement update.
//!
//! Each instate landmark is projected through the body pose (extrapolated
//! by the camera clock offset) and the camera extrinsics. Observations are
//! gated one landmark at a time with a chi-square test on the 2D innovation,
//! and the survivors are fused in a single batched EKF correction.

use log::debug;
use nalgebra as na;

use crate::camera::Camera;
use crate::config::EstimatorConfig;
use crate::error::{helpers, VioResult};
use crate::gauge::Gauge;
use crate::state::{StateStore, T, TBC, TD, V, W, WBC};
use crate::types::LandmarkId;
use crate::utils;

/// Update parameters taken from the estimator configuration
#[derive(Debug, Clone)]
pub struct UpdateParams {
    pub pixel_noise: f64,
    pub outlier_gate: f64,
    pub psd_tolerance: f64,
}

impl UpdateParams {
    pub fn from_config(config: &EstimatorConfig) -> Self {
        Self {
            pixel_noise: config.camera.pixel_noise,
            outlier_gate: config.update.outlier_gate,
            psd_tolerance: config.update.psd_tolerance,
        }
    }
}

/// What the correction did with each observation
#[derive(Debug, Clone, Default)]
pub struct UpdateOutcome {
    /// Landmarks fused into the correction
    pub inliers: Vec<LandmarkId>,

    /// Landmarks excluded by the gate, with their squared Mahalanobis distance
    pub outliers: Vec<(LandmarkId, f64)>,

    /// Landmarks that project behind the camera
    pub behind_camera: Vec<LandmarkId>,

    /// Pixel innovation (observed - predicted) of every projectable observation
    pub residuals: Vec<(LandmarkId, na::Vector2<f64>)>,

    /// Applied error-state correction, `None` when nothing was fused
    pub correction: Option<na::DVector<f64>>,
}

impl UpdateOutcome {
    pub fn is_noop(&self) -> bool {
        self.correction.is_none()
    }
}

/// Predicted pixel of an instate landmark and its 2 x n Jacobian with
/// respect to the error state. `None` if the landmark is unknown or behind
/// the camera.
pub fn predict(
    store: &StateStore,
    id: LandmarkId,
    camera: &Camera,
) -> Option<(na::Vector2<f64>, na::DMatrix<f64>)> {
    let offset = store.landmark_offset(id)?;
    let position = store.landmark_position(id)?;
    let core = store.core();

    let r_td = utils::so3_exp(&(core.angular_velocity * core.td));
    let rsb = core.rsb.to_rotation_matrix().into_inner();
    let rsb_cam = rsb * r_td;
    let tsb_cam = core.tsb + core.vsb * core.td;
    let rbc = core.rbc.to_rotation_matrix().into_inner();

    let y = rsb.transpose() * (position - tsb_cam);
    let xb = r_td.transpose() * y;
    let xc = rbc.transpose() * (xb - core.tbc);
    let (pixel, d_proj) = camera.project(&xc)?;

    let to_cam = d_proj * rbc.transpose();
    let mut jac = na::DMatrix::zeros(2, store.dim());
    jac.fixed_view_mut::<2, 3>(0, W)
        .copy_from(&(to_cam * r_td.transpose() * utils::skew_symmetric(&y)));
    jac.fixed_view_mut::<2, 3>(0, T)
        .copy_from(&(-to_cam * rsb_cam.transpose()));
    jac.fixed_view_mut::<2, 3>(0, V)
        .copy_from(&(-to_cam * rsb_cam.transpose() * core.td));
    jac.fixed_view_mut::<2, 3>(0, WBC)
        .copy_from(&(d_proj * utils::skew_symmetric(&xc)));
    jac.fixed_view_mut::<2, 3>(0, TBC)
        .copy_from(&(-d_proj * rbc.transpose()));
    let dxb_dtd = -utils::skew_symmetric(&core.angular_velocity) * xb - rsb_cam.transpose() * core.vsb;
    jac.fixed_view_mut::<2, 1>(0, TD).copy_from(&(to_cam * dxb_dtd));
    jac.fixed_view_mut::<2, 3>(0, offset)
        .copy_from(&(to_cam * rsb_cam.transpose()));

    Some((pixel, jac))
}

/// Gate, fuse and commit the observations of one frame.
///
/// The store is replaced only if the whole correction succeeds. With no
/// inliers the store is left untouched.
pub fn correct(
    store: &mut StateStore,
    observations: &[(LandmarkId, na::Vector2<f64>)],
    camera: &Camera,
    params: &UpdateParams,
    gauge: &mut Gauge,
) -> VioResult<UpdateOutcome> {
    let mut outcome = UpdateOutcome::default();
    let noise_var = params.pixel_noise * params.pixel_noise;
    let p = store.covariance();

    let mut rows: Vec<(na::DMatrix<f64>, na::Vector2<f64>)> = Vec::with_capacity(observations.len());
    for (id, observed) in observations {
        let Some((predicted, jac)) = predict(store, *id, camera) else {
            outcome.behind_camera.push(*id);
            continue;
        };
        let residual = observed - predicted;
        outcome.residuals.push((*id, residual));

        let s: na::Matrix2<f64> = (&jac * p * jac.transpose()).fixed_view::<2, 2>(0, 0).into_owned()
            + na::Matrix2::identity() * noise_var;
        let mahalanobis_sq = match s.try_inverse() {
            Some(s_inv) => (residual.transpose() * s_inv * residual)[(0, 0)],
            None => f64::INFINITY,
        };
        if mahalanobis_sq > params.outlier_gate {
            debug!("{} gated out (d2 = {:.2})", id, mahalanobis_sq);
            outcome.outliers.push((*id, mahalanobis_sq));
            continue;
        }
        outcome.inliers.push(*id);
        rows.push((jac, residual));
    }

    if rows.is_empty() {
        return Ok(outcome);
    }

    let n = store.dim();
    let m = 2 * rows.len();
    let mut h = na::DMatrix::zeros(m, n);
    let mut r = na::DVector::zeros(m);
    for (k, (jac, residual)) in rows.iter().enumerate() {
        h.view_mut((2 * k, 0), (2, n)).copy_from(jac);
        r.fixed_rows_mut::<2>(2 * k).copy_from(residual);
    }

    let pht = p * h.transpose();
    let s = &h * &pht + na::DMatrix::<f64>::identity(m, m) * noise_var;
    let chol = na::Cholesky::new(s).ok_or_else(|| {
        helpers::degeneracy("innovation covariance is not positive definite", "update", None)
    })?;
    let gain = chol.solve(&pht.transpose()).transpose();

    let mut delta = &gain * &r;
    let i_kh = na::DMatrix::<f64>::identity(n, n) - &gain * &h;
    let mut covariance = &i_kh * p * i_kh.transpose() + &gain * gain.transpose() * noise_var;

    gauge.constrain(store, &mut delta, &mut covariance)?;

    let mut next = store.clone();
    next.set_covariance(covariance)?;
    next.inject(&delta)?;
    next.condition(params.psd_tolerance)?;
    *store = next;

    debug!(
        "correction: {} inliers, {} outliers, |dx| = {:.3e}",
        outcome.inliers.len(),
        outcome.outliers.len(),
        delta.norm()
    );
    outcome.correction = Some(delta);
    Ok(outcome)
}
