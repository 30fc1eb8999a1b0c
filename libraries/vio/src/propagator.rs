//! Inertial propagation of the mean and the error-state covariance.

use log::warn;
use nalgebra as na;

use crate::config::{EstimatorConfig, ImuNoise};
use crate::error::{helpers, SensorType, VioResult};
use crate::state::{CoreState, StateStore, BA, BG, CORE_DIM, T, V, W, WG};
use crate::utils;

type CoreMatrix = na::SMatrix<f64, CORE_DIM, CORE_DIM>;

/// Strapdown integrator with first-order covariance propagation
#[derive(Debug, Clone)]
pub struct ImuPropagator {
    noise: ImuNoise,
    ca: na::Matrix3<f64>,
    cg: na::Matrix3<f64>,
    max_step: f64,
    max_substeps: usize,
    max_gap: f64,
    psd_tolerance: f64,
}

impl ImuPropagator {
    pub fn new(config: &EstimatorConfig) -> Self {
        Self {
            noise: config.imu_noise.clone(),
            ca: config.imu_intrinsics.ca_matrix(),
            cg: config.imu_intrinsics.cg_matrix(),
            max_step: config.timing.max_integration_step,
            max_substeps: config.timing.max_substeps,
            max_gap: config.timing.max_imu_gap,
            psd_tolerance: config.update.psd_tolerance,
        }
    }

    pub fn ca(&self) -> &na::Matrix3<f64> {
        &self.ca
    }

    pub fn cg(&self) -> &na::Matrix3<f64> {
        &self.cg
    }

    /// Calibrated, bias-free angular velocity and specific force
    pub fn corrected(
        &self,
        core: &CoreState,
        gyro: &na::Vector3<f64>,
        accel: &na::Vector3<f64>,
    ) -> (na::Vector3<f64>, na::Vector3<f64>) {
        (self.cg * gyro - core.bg, self.ca * accel - core.ba)
    }

    /// Advance the store by `dt` seconds holding the raw reading constant.
    ///
    /// Long intervals are split into equal sub-steps. The store is only
    /// modified if every sub-step succeeds and the result is well
    /// conditioned.
    pub fn propagate(
        &self,
        store: &mut StateStore,
        gyro: &na::Vector3<f64>,
        accel: &na::Vector3<f64>,
        dt: f64,
    ) -> VioResult<()> {
        helpers::check_time_delta(dt)?;
        helpers::check_vector_finite(gyro, "gyroscope reading", SensorType::Imu)?;
        helpers::check_vector_finite(accel, "accelerometer reading", SensorType::Imu)?;

        if dt > self.max_gap {
            warn!("inertial gap of {:.3}s exceeds {:.3}s", dt, self.max_gap);
        }

        let steps = self.substeps(dt);
        let h = dt / steps as f64;

        let mut next = store.clone();
        for _ in 0..steps {
            self.step(&mut next, gyro, accel, h);
        }
        next.condition_core(self.psd_tolerance)?;

        *store = next;
        Ok(())
    }

    /// Equal sub-steps no longer than `max_integration_step`, capped at
    /// `max_substeps`
    fn substeps(&self, dt: f64) -> usize {
        let wanted = (dt / self.max_step * (1.0 - 1e-9)).ceil();
        if wanted > self.max_substeps as f64 {
            warn!(
                "integrating {:.3}s in {} steps of {:.3}s",
                dt,
                self.max_substeps,
                dt / self.max_substeps as f64
            );
            return self.max_substeps.max(1);
        }
        (wanted as usize).max(1)
    }

    /// One integration step of length `h`
    fn step(&self, store: &mut StateStore, gyro: &na::Vector3<f64>, accel: &na::Vector3<f64>, h: f64) {
        let core = store.core().clone();
        let (omega, acc) = self.corrected(&core, gyro, accel);

        let gravity = core.gravity(store.gravity_magnitude());
        let dg = core.gravity_jacobian(store.gravity_magnitude());
        let r = core.rsb.to_rotation_matrix().into_inner();
        let accel_spatial = r * acc + gravity;

        let mut next = core.clone();
        next.rsb = core.rsb * na::UnitQuaternion::from_scaled_axis(omega * h);
        next.rsb.renormalize();
        next.tsb = core.tsb + core.vsb * h + 0.5 * accel_spatial * h * h;
        next.vsb = core.vsb + accel_spatial * h;
        next.angular_velocity = omega;

        let phi = self.transition(&r, &omega, &acc, &dg, h);
        let q = self.process_noise(h);
        store.propagate(next, &phi, &q);
    }

    /// Error-state transition over one step
    fn transition(
        &self,
        r: &na::Matrix3<f64>,
        omega: &na::Vector3<f64>,
        acc: &na::Vector3<f64>,
        dg: &na::Matrix3x2<f64>,
        h: f64,
    ) -> CoreMatrix {
        let mut phi = CoreMatrix::identity();
        let r_acc_skew = r * utils::skew_symmetric(acc);
        let i3 = na::Matrix3::<f64>::identity();

        // Orientation
        phi.fixed_view_mut::<3, 3>(W, W)
            .copy_from(&utils::so3_exp(&(-omega * h)));
        phi.fixed_view_mut::<3, 3>(W, BG)
            .copy_from(&(-utils::right_jacobian(&(omega * h)) * h));

        // Velocity
        phi.fixed_view_mut::<3, 3>(V, W).copy_from(&(-r_acc_skew * h));
        phi.fixed_view_mut::<3, 3>(V, BA).copy_from(&(-r * h));
        phi.fixed_view_mut::<3, 2>(V, WG).copy_from(&(dg * h));

        // Position
        let half_h2 = 0.5 * h * h;
        phi.fixed_view_mut::<3, 3>(T, V).copy_from(&(i3 * h));
        phi.fixed_view_mut::<3, 3>(T, W).copy_from(&(-r_acc_skew * half_h2));
        phi.fixed_view_mut::<3, 3>(T, BA).copy_from(&(-r * half_h2));
        phi.fixed_view_mut::<3, 2>(T, WG).copy_from(&(dg * half_h2));

        phi
    }

    /// Discretized process noise for one step
    fn process_noise(&self, h: f64) -> CoreMatrix {
        let mut q = CoreMatrix::zeros();
        let var_g = self.noise.gyro_noise * self.noise.gyro_noise;
        let var_a = self.noise.accel_noise * self.noise.accel_noise;
        let var_bg = self.noise.gyro_bias_walk * self.noise.gyro_bias_walk;
        let var_ba = self.noise.accel_bias_walk * self.noise.accel_bias_walk;

        for i in 0..3 {
            q[(W + i, W + i)] = var_g * h;
            q[(V + i, V + i)] = var_a * h;
            q[(T + i, T + i)] = var_a * h * h * h / 3.0;
            q[(T + i, V + i)] = var_a * h * h / 2.0;
            q[(V + i, T + i)] = var_a * h * h / 2.0;
            q[(BG + i, BG + i)] = var_bg * h;
            q[(BA + i, BA + i)] = var_ba * h;
        }
        q
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::LandmarkId;
    use approx::assert_relative_eq;

    fn store() -> StateStore {
        let p = na::DMatrix::identity(CORE_DIM, CORE_DIM) * 1e-2;
        StateStore::new(CoreState::default(), p, 9.8).unwrap()
    }

    #[test]
    fn test_rest_keeps_pose() {
        let propagator = ImuPropagator::new(&EstimatorConfig::default());
        let mut store = store();
        let gyro = na::Vector3::zeros();
        let accel = na::Vector3::new(0.0, 0.0, 9.8);
        for _ in 0..200 {
            propagator.propagate(&mut store, &gyro, &accel, 0.005).unwrap();
        }
        assert_relative_eq!(store.core().tsb, na::Vector3::zeros(), epsilon = 1e-12);
        assert_relative_eq!(store.core().vsb, na::Vector3::zeros(), epsilon = 1e-12);
    }

    #[test]
    fn test_constant_acceleration_kinematics() {
        let propagator = ImuPropagator::new(&EstimatorConfig::default());
        let mut store = store();
        let gyro = na::Vector3::zeros();
        let accel = na::Vector3::new(1.0, 0.0, 9.8);
        propagator.propagate(&mut store, &gyro, &accel, 1.0).unwrap();
        assert_relative_eq!(store.core().vsb, na::Vector3::new(1.0, 0.0, 0.0), epsilon = 1e-9);
        assert_relative_eq!(store.core().tsb, na::Vector3::new(0.5, 0.0, 0.0), epsilon = 1e-9);
    }

    #[test]
    fn test_constant_rotation_rate() {
        let propagator = ImuPropagator::new(&EstimatorConfig::default());
        let mut store = store();
        let gyro = na::Vector3::new(0.0, 0.0, std::f64::consts::FRAC_PI_2);
        let accel = na::Vector3::new(0.0, 0.0, 9.8);
        propagator.propagate(&mut store, &gyro, &accel, 1.0).unwrap();
        let expected = na::UnitQuaternion::from_euler_angles(0.0, 0.0, std::f64::consts::FRAC_PI_2);
        assert!(store.core().rsb.angle_to(&expected) < 1e-9);
        let r = store.core().rsb.to_rotation_matrix().into_inner();
        assert!(utils::orthonormality_error(&r) < 1e-12);
    }

    #[test]
    fn test_covariance_grows_and_stays_psd() {
        let propagator = ImuPropagator::new(&EstimatorConfig::default());
        let mut store = store();
        store
            .insert_landmark(LandmarkId(0), na::Vector3::new(0.0, 0.0, 3.0), na::Matrix3::identity() * 0.1)
            .unwrap();
        let before = store.covariance().clone();
        let gyro = na::Vector3::new(0.1, -0.2, 0.3);
        let accel = na::Vector3::new(0.5, 0.2, 9.6);
        for _ in 0..100 {
            propagator.propagate(&mut store, &gyro, &accel, 0.005).unwrap();
        }
        let after = store.covariance();
        assert!(after[(V, V)] > before[(V, V)], "velocity variance must grow");
        assert!(utils::min_eigenvalue(after) > -1e-9, "covariance must remain PSD");
        assert_relative_eq!(after.clone(), after.transpose(), epsilon = 0.0);
        assert_eq!(
            store.landmark_covariance(LandmarkId(0)).unwrap(),
            na::Matrix3::identity() * 0.1,
            "static landmark block is untouched by propagation"
        );
    }

    #[test]
    fn test_invalid_step_leaves_store_unchanged() {
        let propagator = ImuPropagator::new(&EstimatorConfig::default());
        let mut store = store();
        let before = store.covariance().clone();
        let bad = na::Vector3::new(f64::NAN, 0.0, 0.0);
        assert!(propagator
            .propagate(&mut store, &bad, &na::Vector3::zeros(), 0.01)
            .is_err());
        assert!(propagator
            .propagate(&mut store, &na::Vector3::zeros(), &na::Vector3::zeros(), 0.0)
            .is_err());
        assert_eq!(store.covariance(), &before);
    }

    #[test]
    fn test_substeps_are_bounded() {
        let propagator = ImuPropagator::new(&EstimatorConfig::default());
        assert_eq!(propagator.substeps(0.005), 1);
        assert_eq!(propagator.substeps(0.01), 1);
        assert_eq!(propagator.substeps(0.1), 10);
        assert_eq!(propagator.substeps(3600.0), 100, "an hour-long gap must not take 360000 steps");
    }

    #[test]
    fn test_hour_long_gap_completes() {
        let propagator = ImuPropagator::new(&EstimatorConfig::default());
        let mut store = store();
        propagator
            .propagate(&mut store, &na::Vector3::zeros(), &na::Vector3::new(0.0, 0.0, 9.8), 3600.0)
            .unwrap();
        assert!(store.core().is_finite());
        assert!(utils::all_finite(store.covariance()));
    }

    #[test]
    fn test_long_interval_is_substepped() {
        let propagator = ImuPropagator::new(&EstimatorConfig::default());
        let mut coarse = store();
        let mut fine = store();
        let gyro = na::Vector3::new(0.0, 0.0, 0.5);
        let accel = na::Vector3::new(0.3, 0.0, 9.8);
        propagator.propagate(&mut coarse, &gyro, &accel, 0.1).unwrap();
        for _ in 0..10 {
            propagator.propagate(&mut fine, &gyro, &accel, 0.01).unwrap();
        }
        assert_relative_eq!(coarse.core().tsb, fine.core().tsb, epsilon = 1e-9);
        assert_relative_eq!(coarse.core().vsb, fine.core().vsb, epsilon = 1e-9);
    }
}
