//! Gauge handling.
//!
//! Visual-inertial measurements are invariant to a global translation and
//! to a rotation about the gravity axis. Those four directions of the error
//! state are unobservable. In [`GaugeMode::Fixed`] they are projected out of
//! every correction and out of the covariance; in [`GaugeMode::Floating`]
//! they are left alone and the variance along them is only monitored.

use log::{info, warn};
use nalgebra as na;

pub use crate::config::GaugeMode;
use crate::error::{helpers, VioResult};
use crate::state::{StateStore, CORE_DIM, LANDMARK_DIM, T, V, W};
use crate::utils;

/// Number of unobservable directions (3 translation + yaw)
pub const GAUGE_DIM: usize = 4;

/// Yaw standard deviation (rad) above which a floating gauge is reported
const FLOATING_YAW_WARN_STD: f64 = 1.0;

/// Gauge state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GaugeGroup {
    Uninitialized,
    Fixed,
    Floating,
}

impl GaugeGroup {
    /// The only legal transitions leave `Uninitialized`
    pub fn select(self, mode: GaugeMode) -> VioResult<GaugeGroup> {
        match self {
            GaugeGroup::Uninitialized => Ok(match mode {
                GaugeMode::Fixed => GaugeGroup::Fixed,
                GaugeMode::Floating => GaugeGroup::Floating,
            }),
            current => Err(helpers::config_error(
                format!("gauge already selected as {:?}", current),
                "gauge",
            )),
        }
    }
}

/// Basis of the unobservable subspace at the current estimate, one column
/// per direction: x, y, z translation, then yaw about gravity
pub fn unobservable_basis(store: &StateStore) -> na::DMatrix<f64> {
    let n = store.dim();
    let core = store.core();
    let mut basis = na::DMatrix::zeros(n, GAUGE_DIM);

    for axis in 0..3 {
        basis[(T + axis, axis)] = 1.0;
        for slot in 0..store.num_landmarks() {
            basis[(CORE_DIM + slot * LANDMARK_DIM + axis, axis)] = 1.0;
        }
    }

    let up = -core.gravity(1.0);
    let up_skew = utils::skew_symmetric(&up);
    let yaw = GAUGE_DIM - 1;
    let body_up = core.rsb.inverse() * up;
    basis.fixed_view_mut::<3, 1>(W, yaw).copy_from(&body_up);
    basis.fixed_view_mut::<3, 1>(T, yaw).copy_from(&(up_skew * core.tsb));
    basis.fixed_view_mut::<3, 1>(V, yaw).copy_from(&(up_skew * core.vsb));
    for (slot, (_, position)) in store.landmarks().enumerate() {
        let offset = CORE_DIM + slot * LANDMARK_DIM;
        basis.fixed_view_mut::<3, 1>(offset, yaw).copy_from(&(up_skew * position));
    }
    basis
}

/// Pseudo-inverse (N^T N)^-1 N^T of the basis
fn basis_pinv(basis: &na::DMatrix<f64>) -> VioResult<na::DMatrix<f64>> {
    let gram = basis.transpose() * basis;
    let chol = na::Cholesky::new(gram)
        .ok_or_else(|| helpers::matrix_error("gauge basis is rank deficient", "basis_pinv"))?;
    Ok(chol.solve(&basis.transpose()))
}

/// Session gauge
#[derive(Debug, Clone)]
pub struct Gauge {
    group: GaugeGroup,
    warned: bool,
}

impl Default for Gauge {
    fn default() -> Self {
        Self::new()
    }
}

impl Gauge {
    pub fn new() -> Self {
        Self {
            group: GaugeGroup::Uninitialized,
            warned: false,
        }
    }

    pub fn group(&self) -> GaugeGroup {
        self.group
    }

    /// Select the gauge once, at filter initialization
    pub fn initialize(&mut self, mode: GaugeMode, store: &mut StateStore) -> VioResult<()> {
        self.group = self.group.select(mode)?;
        info!("gauge selected: {:?}", self.group);
        if self.group == GaugeGroup::Fixed {
            let mut covariance = store.covariance().clone();
            project_covariance(store, &mut covariance)?;
            store.set_covariance(covariance)?;
        }
        Ok(())
    }

    /// Apply the gauge to a pending correction and posterior covariance
    /// computed against `store`
    pub fn constrain(
        &mut self,
        store: &StateStore,
        delta: &mut na::DVector<f64>,
        covariance: &mut na::DMatrix<f64>,
    ) -> VioResult<()> {
        match self.group {
            GaugeGroup::Fixed => {
                let basis = unobservable_basis(store);
                let pinv = basis_pinv(&basis)?;
                let along = &pinv * &*delta;
                *delta -= &basis * along;
                project_with(&basis, &pinv, covariance);
                Ok(())
            }
            GaugeGroup::Floating => {
                let variance = variance_along(store, covariance)?;
                let yaw_std = variance[GAUGE_DIM - 1].max(0.0).sqrt();
                if yaw_std > FLOATING_YAW_WARN_STD && !self.warned {
                    warn!("floating gauge: yaw standard deviation reached {:.2} rad", yaw_std);
                    self.warned = true;
                }
                Ok(())
            }
            GaugeGroup::Uninitialized => Err(helpers::not_initialized(
                "gauge is applied before the filter is initialized",
            )),
        }
    }
}

/// Remove the unobservable subspace from a covariance
pub fn project_covariance(store: &StateStore, covariance: &mut na::DMatrix<f64>) -> VioResult<()> {
    let basis = unobservable_basis(store);
    let pinv = basis_pinv(&basis)?;
    project_with(&basis, &pinv, covariance);
    Ok(())
}

fn project_with(basis: &na::DMatrix<f64>, pinv: &na::DMatrix<f64>, covariance: &mut na::DMatrix<f64>) {
    let n = basis.nrows();
    let projector = na::DMatrix::<f64>::identity(n, n) - basis * pinv;
    let projected = &projector * &*covariance * projector.transpose();
    *covariance = projected;
    utils::symmetrize(covariance);
}

/// Variance of the state along each unobservable direction
pub fn variance_along(store: &StateStore, covariance: &na::DMatrix<f64>) -> VioResult<na::Vector4<f64>> {
    let basis = unobservable_basis(store);
    let pinv = basis_pinv(&basis)?;
    let projected = &pinv * covariance * pinv.transpose();
    Ok(na::Vector4::new(
        projected[(0, 0)],
        projected[(1, 1)],
        projected[(2, 2)],
        projected[(3, 3)],
    ))
}
