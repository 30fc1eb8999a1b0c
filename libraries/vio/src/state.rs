//! State & covariance store.
//!
//! The mean is split into a fixed-size core (pose, velocity, biases,
//! gravity direction, camera extrinsics, time offset) and an arena of
//! landmark positions. The covariance is a dense matrix over the error
//! state whose landmark blocks follow the arena's slot order, so adding or
//! removing a landmark is an explicit block append / block delete.

use std::collections::HashMap;

use nalgebra as na;

use crate::error::{helpers, VioResult};
use crate::types::LandmarkId;
use crate::utils;

/// Error-state offsets of the core blocks
pub const W: usize = 0;
pub const T: usize = 3;
pub const V: usize = 6;
pub const BG: usize = 9;
pub const BA: usize = 12;
pub const WG: usize = 15;
pub const WBC: usize = 17;
pub const TBC: usize = 20;
pub const TD: usize = 23;

/// Dimension of the core error state
pub const CORE_DIM: usize = 24;

/// Error-state dimension of one landmark
pub const LANDMARK_DIM: usize = 3;

/// Core mean estimate
#[derive(Debug, Clone, PartialEq)]
pub struct CoreState {
    /// Body-to-spatial rotation
    pub rsb: na::UnitQuaternion<f64>,

    /// Body position in the spatial frame
    pub tsb: na::Vector3<f64>,

    /// Body velocity in the spatial frame
    pub vsb: na::Vector3<f64>,

    /// Gyroscope bias (rad/s)
    pub bg: na::Vector3<f64>,

    /// Accelerometer bias (m/s^2)
    pub ba: na::Vector3<f64>,

    /// Rotation applied to the nominal gravity direction (0, 0, -1)
    pub rg: na::UnitQuaternion<f64>,

    /// Camera-to-body rotation
    pub rbc: na::UnitQuaternion<f64>,

    /// Camera position in the body frame
    pub tbc: na::Vector3<f64>,

    /// Camera clock offset (s)
    pub td: f64,

    /// Latest bias-corrected angular velocity, used to extrapolate by `td`
    pub angular_velocity: na::Vector3<f64>,
}

impl Default for CoreState {
    fn default() -> Self {
        Self {
            rsb: na::UnitQuaternion::identity(),
            tsb: na::Vector3::zeros(),
            vsb: na::Vector3::zeros(),
            bg: na::Vector3::zeros(),
            ba: na::Vector3::zeros(),
            rg: na::UnitQuaternion::identity(),
            rbc: na::UnitQuaternion::identity(),
            tbc: na::Vector3::zeros(),
            td: 0.0,
            angular_velocity: na::Vector3::zeros(),
        }
    }
}

impl CoreState {
    /// Gravity vector in the spatial frame
    pub fn gravity(&self, magnitude: f64) -> na::Vector3<f64> {
        self.rg * na::Vector3::new(0.0, 0.0, -magnitude)
    }

    /// Derivative of the gravity vector with respect to the two tangent
    /// components of the gravity error
    pub fn gravity_jacobian(&self, magnitude: f64) -> na::Matrix3x2<f64> {
        let g0 = na::Vector3::new(0.0, 0.0, -magnitude);
        let full = -(self.rg.to_rotation_matrix().into_inner() * utils::skew_symmetric(&g0));
        full.fixed_view::<3, 2>(0, 0).into_owned()
    }

    /// Body pose in the spatial frame
    pub fn gsb(&self) -> na::Isometry3<f64> {
        na::Isometry3::from_parts(na::Translation3::from(self.tsb), self.rsb)
    }

    /// Camera pose in the body frame
    pub fn gbc(&self) -> na::Isometry3<f64> {
        na::Isometry3::from_parts(na::Translation3::from(self.tbc), self.rbc)
    }

    /// Camera pose in the spatial frame
    pub fn gsc(&self) -> na::Isometry3<f64> {
        self.gsb() * self.gbc()
    }

    /// Body pose extrapolated by the camera clock offset
    pub fn gsb_at_camera_time(&self) -> na::Isometry3<f64> {
        let rotation = self.rsb * na::UnitQuaternion::from_scaled_axis(self.angular_velocity * self.td);
        let translation = self.tsb + self.vsb * self.td;
        na::Isometry3::from_parts(na::Translation3::from(translation), rotation)
    }

    /// Camera pose at the (offset-corrected) frame time
    pub fn gsc_at_camera_time(&self) -> na::Isometry3<f64> {
        self.gsb_at_camera_time() * self.gbc()
    }

    /// Check if every component is finite
    pub fn is_finite(&self) -> bool {
        self.rsb.coords.iter().all(|v| v.is_finite())
            && self.tsb.iter().all(|v| v.is_finite())
            && self.vsb.iter().all(|v| v.is_finite())
            && self.bg.iter().all(|v| v.is_finite())
            && self.ba.iter().all(|v| v.is_finite())
            && self.rg.coords.iter().all(|v| v.is_finite())
            && self.rbc.coords.iter().all(|v| v.is_finite())
            && self.tbc.iter().all(|v| v.is_finite())
            && self.td.is_finite()
    }
}

/// One landmark block of the arena
#[derive(Debug, Clone, PartialEq)]
struct Slot {
    id: LandmarkId,
    position: na::Vector3<f64>,
}

/// Owner of the filter mean and covariance
#[derive(Debug, Clone, PartialEq)]
pub struct StateStore {
    core: CoreState,
    slots: Vec<Slot>,
    slot_of: HashMap<LandmarkId, usize>,
    covariance: na::DMatrix<f64>,
    gravity_magnitude: f64,
}

impl StateStore {
    /// Create a store holding only the core state
    pub fn new(
        core: CoreState,
        core_covariance: na::DMatrix<f64>,
        gravity_magnitude: f64,
    ) -> VioResult<Self> {
        if core_covariance.nrows() != CORE_DIM || core_covariance.ncols() != CORE_DIM {
            return Err(helpers::matrix_error(
                format!(
                    "core covariance must be {}x{}, got {}x{}",
                    CORE_DIM,
                    CORE_DIM,
                    core_covariance.nrows(),
                    core_covariance.ncols()
                ),
                "StateStore::new",
            ));
        }
        Ok(Self {
            core,
            slots: Vec::new(),
            slot_of: HashMap::new(),
            covariance: core_covariance,
            gravity_magnitude,
        })
    }

    pub fn core(&self) -> &CoreState {
        &self.core
    }

    pub fn gravity_magnitude(&self) -> f64 {
        self.gravity_magnitude
    }

    /// Full error-state covariance
    pub fn covariance(&self) -> &na::DMatrix<f64> {
        &self.covariance
    }

    /// Covariance of the core block only
    pub fn core_covariance(&self) -> na::DMatrix<f64> {
        self.covariance.view((0, 0), (CORE_DIM, CORE_DIM)).into_owned()
    }

    /// Covariance of a core sub-block, e.g. `(V, 3)` for velocity
    pub fn block_covariance(&self, offset: usize, size: usize) -> na::DMatrix<f64> {
        self.covariance.view((offset, offset), (size, size)).into_owned()
    }

    /// Error-state dimension
    pub fn dim(&self) -> usize {
        self.covariance.nrows()
    }

    pub fn num_landmarks(&self) -> usize {
        self.slots.len()
    }

    pub fn contains(&self, id: LandmarkId) -> bool {
        self.slot_of.contains_key(&id)
    }

    /// Instate landmark ids in slot order
    pub fn landmark_ids(&self) -> impl Iterator<Item = LandmarkId> + '_ {
        self.slots.iter().map(|s| s.id)
    }

    /// Instate landmarks with their positions, in slot order
    pub fn landmarks(&self) -> impl Iterator<Item = (LandmarkId, &na::Vector3<f64>)> + '_ {
        self.slots.iter().map(|s| (s.id, &s.position))
    }

    /// Error-state offset of a landmark block
    pub fn landmark_offset(&self, id: LandmarkId) -> Option<usize> {
        self.slot_of
            .get(&id)
            .map(|slot| CORE_DIM + slot * LANDMARK_DIM)
    }

    pub fn landmark_position(&self, id: LandmarkId) -> Option<na::Vector3<f64>> {
        self.slot_of.get(&id).map(|slot| self.slots[*slot].position)
    }

    /// Marginal covariance of a landmark position
    pub fn landmark_covariance(&self, id: LandmarkId) -> Option<na::Matrix3<f64>> {
        self.landmark_offset(id).map(|offset| {
            self.covariance
                .fixed_view::<3, 3>(offset, offset)
                .into_owned()
        })
    }

    /// Append a landmark block.
    ///
    /// Existing covariance entries are kept bit-for-bit; the new block has
    /// zero cross-covariance with the rest of the state.
    pub fn insert_landmark(
        &mut self,
        id: LandmarkId,
        position: na::Vector3<f64>,
        covariance: na::Matrix3<f64>,
    ) -> VioResult<()> {
        if self.contains(id) {
            return Err(helpers::matrix_error(
                format!("landmark {} is already in the state", id),
                "insert_landmark",
            ));
        }
        if !position.iter().all(|v| v.is_finite()) || !covariance.iter().all(|v| v.is_finite()) {
            return Err(helpers::degeneracy(
                format!("landmark {} has a non-finite initial estimate", id),
                "insert_landmark",
                None,
            ));
        }

        let n = self.dim();
        let grown = std::mem::replace(&mut self.covariance, na::DMatrix::zeros(0, 0))
            .resize(n + LANDMARK_DIM, n + LANDMARK_DIM, 0.0);
        self.covariance = grown;
        self.covariance
            .fixed_view_mut::<3, 3>(n, n)
            .copy_from(&covariance);

        self.slot_of.insert(id, self.slots.len());
        self.slots.push(Slot { id, position });
        Ok(())
    }

    /// Delete a landmark block, returning its last position estimate.
    ///
    /// The remaining covariance entries keep their values and relative order.
    pub fn remove_landmark(&mut self, id: LandmarkId) -> VioResult<na::Vector3<f64>> {
        let slot = match self.slot_of.remove(&id) {
            Some(slot) => slot,
            None => {
                return Err(helpers::matrix_error(
                    format!("landmark {} is not in the state", id),
                    "remove_landmark",
                ))
            }
        };
        let offset = CORE_DIM + slot * LANDMARK_DIM;

        let shrunk = std::mem::replace(&mut self.covariance, na::DMatrix::zeros(0, 0))
            .remove_rows(offset, LANDMARK_DIM)
            .remove_columns(offset, LANDMARK_DIM);
        self.covariance = shrunk;

        let removed = self.slots.remove(slot);
        for later in &self.slots[slot..] {
            if let Some(index) = self.slot_of.get_mut(&later.id) {
                *index -= 1;
            }
        }
        Ok(removed.position)
    }

    /// Replace the core mean and propagate the covariance with the core
    /// transition `phi` and process noise `q`.
    ///
    /// Landmarks are static, so only the core block and the core/landmark
    /// cross terms change.
    pub fn propagate(
        &mut self,
        core: CoreState,
        phi: &na::SMatrix<f64, CORE_DIM, CORE_DIM>,
        q: &na::SMatrix<f64, CORE_DIM, CORE_DIM>,
    ) {
        let n = self.dim();
        let pcc: na::SMatrix<f64, CORE_DIM, CORE_DIM> = self
            .covariance
            .fixed_view::<CORE_DIM, CORE_DIM>(0, 0)
            .into_owned();
        let new_pcc = phi * pcc * phi.transpose() + q;
        self.covariance
            .fixed_view_mut::<CORE_DIM, CORE_DIM>(0, 0)
            .copy_from(&new_pcc);

        if n > CORE_DIM {
            let m = n - CORE_DIM;
            let pcl = self.covariance.view((0, CORE_DIM), (CORE_DIM, m)).into_owned();
            let new_pcl = phi * pcl;
            self.covariance
                .view_mut((0, CORE_DIM), (CORE_DIM, m))
                .copy_from(&new_pcl);
            self.covariance
                .view_mut((CORE_DIM, 0), (m, CORE_DIM))
                .copy_from(&new_pcl.transpose());
        }
        self.core = core;
    }

    /// Apply an error-state correction to the mean
    pub fn inject(&mut self, delta: &na::DVector<f64>) -> VioResult<()> {
        if delta.len() != self.dim() {
            return Err(helpers::matrix_error(
                format!("correction has length {}, state has {}", delta.len(), self.dim()),
                "inject",
            ));
        }
        if !delta.iter().all(|v| v.is_finite()) {
            return Err(helpers::degeneracy(
                "correction contains NaN or infinite values",
                "inject",
                None,
            ));
        }

        let block = |offset: usize| -> na::Vector3<f64> {
            delta.fixed_rows::<3>(offset).into_owned()
        };

        let core = &mut self.core;
        core.rsb *= na::UnitQuaternion::from_scaled_axis(block(W));
        core.rsb.renormalize();
        core.tsb += block(T);
        core.vsb += block(V);
        core.bg += block(BG);
        core.ba += block(BA);
        core.rg *= na::UnitQuaternion::from_scaled_axis(na::Vector3::new(delta[WG], delta[WG + 1], 0.0));
        core.rg.renormalize();
        core.rbc *= na::UnitQuaternion::from_scaled_axis(block(WBC));
        core.rbc.renormalize();
        core.tbc += block(TBC);
        core.td += delta[TD];

        for (slot, entry) in self.slots.iter_mut().enumerate() {
            entry.position += block(CORE_DIM + slot * LANDMARK_DIM);
        }
        Ok(())
    }

    /// Overwrite the covariance with a same-sized matrix
    pub(crate) fn set_covariance(&mut self, covariance: na::DMatrix<f64>) -> VioResult<()> {
        if covariance.shape() != self.covariance.shape() {
            return Err(helpers::matrix_error(
                format!(
                    "covariance shape {:?} does not match state shape {:?}",
                    covariance.shape(),
                    self.covariance.shape()
                ),
                "set_covariance",
            ));
        }
        self.covariance = covariance;
        Ok(())
    }

    /// Symmetrize and clip the covariance, and check the mean for finiteness
    pub fn condition(&mut self, tolerance: f64) -> VioResult<usize> {
        if !self.core.is_finite() || !self.slots.iter().all(|s| s.position.iter().all(|v| v.is_finite())) {
            return Err(helpers::degeneracy(
                "state contains NaN or infinite values",
                "state",
                None,
            ));
        }
        utils::condition_covariance(&mut self.covariance, tolerance, "covariance")
    }

    /// Lighter conditioning for the high-rate path: the whole covariance is
    /// symmetrized and checked for finiteness, and only the core block (the
    /// only block propagation rewrites on the diagonal) is eigen-clipped.
    /// With landmarks in the state the full matrix must still admit a
    /// Cholesky factor after a jitter of `tolerance` times its largest
    /// variance; if it does not, the whole matrix is conditioned too.
    pub fn condition_core(&mut self, tolerance: f64) -> VioResult<usize> {
        if !self.core.is_finite() {
            return Err(helpers::degeneracy(
                "core state contains NaN or infinite values",
                "state",
                None,
            ));
        }
        if !utils::all_finite(&self.covariance) {
            return Err(helpers::degeneracy(
                "covariance contains NaN or infinite values",
                "covariance",
                None,
            ));
        }
        utils::symmetrize(&mut self.covariance);

        let mut pcc = self.core_covariance();
        let clipped = utils::condition_covariance(&mut pcc, tolerance, "core covariance")?;
        if clipped > 0 {
            self.covariance
                .view_mut((0, 0), (CORE_DIM, CORE_DIM))
                .copy_from(&pcc);
        }
        if self.slots.is_empty() {
            return Ok(clipped);
        }

        let scale = self.covariance.diagonal().iter().fold(1.0_f64, |acc, v| acc.max(v.abs()));
        let jitter = tolerance.max(f64::EPSILON) * scale;
        let shifted = &self.covariance + na::DMatrix::<f64>::identity(self.dim(), self.dim()) * jitter;
        if na::Cholesky::new(shifted).is_some() {
            return Ok(clipped);
        }
        let full = utils::condition_covariance(&mut self.covariance, tolerance, "covariance")?;
        Ok(clipped + full)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn store_with_random_covariance() -> StateStore {
        let a = na::DMatrix::<f64>::from_fn(CORE_DIM, CORE_DIM, |i, j| {
            ((i * 7 + j * 13) % 11) as f64 * 0.01 + if i == j { 1.0 } else { 0.0 }
        });
        let p = &a * a.transpose();
        StateStore::new(CoreState::default(), p, 9.8).unwrap()
    }

    #[test]
    fn test_insert_then_remove_restores_covariance_exactly() {
        let mut store = store_with_random_covariance();
        let before = store.covariance().clone();

        let cov = na::Matrix3::new(0.5, 0.1, 0.0, 0.1, 0.4, 0.0, 0.0, 0.0, 0.3);
        store
            .insert_landmark(LandmarkId(7), na::Vector3::new(1.0, 2.0, 3.0), cov)
            .unwrap();
        assert_eq!(store.dim(), CORE_DIM + LANDMARK_DIM, "promotion adds exactly three rows");
        assert_eq!(
            store.covariance().view((0, 0), (CORE_DIM, CORE_DIM)).into_owned(),
            before,
            "prior entries must be untouched"
        );
        assert_eq!(store.landmark_covariance(LandmarkId(7)).unwrap(), cov);

        store.remove_landmark(LandmarkId(7)).unwrap();
        assert_eq!(store.covariance(), &before, "round trip must be bit-exact");
    }

    #[test]
    fn test_remove_middle_block_keeps_neighbours() {
        let mut store = store_with_random_covariance();
        for k in 0..3u64 {
            let cov = na::Matrix3::identity() * (k as f64 + 1.0);
            store
                .insert_landmark(LandmarkId(k), na::Vector3::repeat(k as f64), cov)
                .unwrap();
        }
        // Correlate the outer blocks so the test sees cross terms move with them
        let (o0, o2) = (
            store.landmark_offset(LandmarkId(0)).unwrap(),
            store.landmark_offset(LandmarkId(2)).unwrap(),
        );
        let mut p = store.covariance().clone();
        p[(o0, o2)] = 0.25;
        p[(o2, o0)] = 0.25;
        store.set_covariance(p).unwrap();

        store.remove_landmark(LandmarkId(1)).unwrap();
        assert_eq!(store.num_landmarks(), 2);
        let new_o2 = store.landmark_offset(LandmarkId(2)).unwrap();
        assert_eq!(new_o2, CORE_DIM + LANDMARK_DIM);
        assert_eq!(store.covariance()[(o0, new_o2)], 0.25);
        assert_eq!(store.landmark_covariance(LandmarkId(2)).unwrap(), na::Matrix3::identity() * 3.0);
        assert_eq!(store.landmark_position(LandmarkId(2)).unwrap(), na::Vector3::repeat(2.0));
    }

    #[test]
    fn test_duplicate_insert_and_missing_remove_fail() {
        let mut store = store_with_random_covariance();
        store
            .insert_landmark(LandmarkId(1), na::Vector3::zeros(), na::Matrix3::identity())
            .unwrap();
        assert!(store
            .insert_landmark(LandmarkId(1), na::Vector3::zeros(), na::Matrix3::identity())
            .is_err());
        assert!(store.remove_landmark(LandmarkId(2)).is_err());
    }

    /// Core block and landmark block both positive definite, but a cross
    /// term large enough to make the full matrix indefinite
    fn store_with_inconsistent_cross_term(cross: f64) -> StateStore {
        let mut store = StateStore::new(
            CoreState::default(),
            na::DMatrix::identity(CORE_DIM, CORE_DIM),
            9.8,
        )
        .unwrap();
        store
            .insert_landmark(LandmarkId(0), na::Vector3::new(0.0, 0.0, 3.0), na::Matrix3::identity())
            .unwrap();
        let mut p = store.covariance().clone();
        p[(T, CORE_DIM)] = cross;
        p[(CORE_DIM, T)] = cross;
        store.set_covariance(p).unwrap();
        store
    }

    #[test]
    fn test_condition_core_detects_indefinite_landmark_coupling() {
        // Eigenvalue 1 - 3 = -2 lies far below any tolerance
        let mut store = store_with_inconsistent_cross_term(3.0);
        let err = store.condition_core(1e-6).unwrap_err();
        assert!(err.is_fatal(), "expected degeneracy, got {:?}", err);
    }

    #[test]
    fn test_condition_core_accepts_roundoff_in_landmark_coupling() {
        // Eigenvalue 1 - (1 + 1e-9) is roundoff-sized, well inside tolerance
        let mut store = store_with_inconsistent_cross_term(1.0 + 1e-9);
        store.condition_core(1e-6).unwrap();
        assert!(utils::min_eigenvalue(store.covariance()) > -1e-6);
    }

    #[test]
    fn test_inject_keeps_rotation_orthonormal() {
        let mut store = store_with_random_covariance();
        let mut delta = na::DVector::zeros(store.dim());
        for _ in 0..1000 {
            delta[W] = 0.01;
            delta[W + 1] = -0.02;
            delta[W + 2] = 0.03;
            store.inject(&delta).unwrap();
        }
        let r = store.core().rsb.to_rotation_matrix().into_inner();
        assert!(utils::orthonormality_error(&r) < 1e-9);
    }

    #[test]
    fn test_gravity_jacobian_matches_finite_difference() {
        let mut core = CoreState::default();
        core.rg = na::UnitQuaternion::from_euler_angles(0.1, -0.2, 0.3);
        let g = core.gravity(9.8);
        let jac = core.gravity_jacobian(9.8);
        let h = 1e-7;
        for k in 0..2 {
            let mut perturbed = core.clone();
            let mut d = na::Vector3::zeros();
            d[k] = h;
            perturbed.rg *= na::UnitQuaternion::from_scaled_axis(d);
            let column = (perturbed.gravity(9.8) - g) / h;
            assert_relative_eq!(column, jac.column(k).into_owned(), epsilon = 1e-5);
        }
    }
}
