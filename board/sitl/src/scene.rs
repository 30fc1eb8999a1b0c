use std::thread::JoinHandle;

use crossbeam_channel::Sender;
use log::{debug, info};
use nalgebra as na;
use vio::camera::Camera;
use vio::{EstimatorConfig, FeatureFrame, FeatureObservation, ImuSample, Measurement, Timestamp, VisualInput};

const GRAVITY: f64 = 9.8;
const NANOS_PER_SEC: f64 = 1e9;

/// Half extent of the square room (m)
const ROOM_HALF_WIDTH: f64 = 5.0;
const ROOM_HEIGHT: f64 = 3.0;

/// Closest point a camera reports (m)
const MIN_VISIBLE_DEPTH: f64 = 0.3;

/// Points on the four walls and the ceiling of a square room centered on
/// the spatial origin
pub fn room() -> Vec<na::Vector3<f64>> {
    let mut points = Vec::new();
    let steps = (2.0 * (ROOM_HALF_WIDTH - 0.5) / 0.5).round() as usize;
    for i in 0..=steps {
        let along = -ROOM_HALF_WIDTH + 0.5 + 0.5 * i as f64;
        for row in 0..6 {
            let z = 0.25 + 0.5 * row as f64;
            // Stagger alternate rows so no two walls share a pattern
            let shift = if row % 2 == 0 { 0.0 } else { 0.17 };
            points.push(na::Vector3::new(ROOM_HALF_WIDTH, along + shift, z));
            points.push(na::Vector3::new(-ROOM_HALF_WIDTH, along - shift, z));
            points.push(na::Vector3::new(along - shift, ROOM_HALF_WIDTH, z));
            points.push(na::Vector3::new(along + shift, -ROOM_HALF_WIDTH, z));
        }
    }
    for i in 0..9 {
        for j in 0..9 {
            let x = -4.0 + i as f64;
            let y = -4.0 + j as f64;
            points.push(na::Vector3::new(x, y, ROOM_HEIGHT));
        }
    }
    points
}

/// Body circling the room center, facing outward, with gentle roll/pitch
/// and height oscillations. Every derivative starts at zero so the
/// trajectory begins at rest.
#[derive(Debug, Clone)]
pub struct Trajectory {
    pub radius: f64,
    pub height: f64,
    /// Steady-state angular rate around the circle (rad/s)
    pub rate: f64,
    /// Time to reach the steady rate (s)
    pub ramp: f64,
}

impl Default for Trajectory {
    fn default() -> Self {
        Self {
            radius: 2.0,
            height: 1.5,
            rate: 2.0 * std::f64::consts::PI / 20.0,
            ramp: 5.0,
        }
    }
}

/// Value, first and second derivative of a scalar signal
type Signal3 = (f64, f64, f64);

impl Trajectory {
    /// Angle around the circle, also used as yaw
    fn heading(&self, t: f64) -> Signal3 {
        if t < self.ramp {
            let accel = self.rate / self.ramp;
            (0.5 * accel * t * t, accel * t, accel)
        } else {
            (self.rate * (t - 0.5 * self.ramp), self.rate, 0.0)
        }
    }

    /// a * (1 - cos(w t))
    fn swing(amplitude: f64, frequency: f64, t: f64) -> Signal3 {
        let phase = frequency * t;
        (
            amplitude * (1.0 - phase.cos()),
            amplitude * frequency * phase.sin(),
            amplitude * frequency * frequency * phase.cos(),
        )
    }

    fn attitude(&self, t: f64) -> (Signal3, Signal3, Signal3) {
        (Self::swing(0.08, 1.3, t), Self::swing(0.06, 0.9, t), self.heading(t))
    }

    /// Body pose in the spatial frame
    pub fn pose(&self, t: f64) -> na::Isometry3<f64> {
        let ((roll, ..), (pitch, ..), (yaw, ..)) = self.attitude(t);
        let (z, ..) = Self::swing(0.2, 0.5, t);
        na::Isometry3::from_parts(
            na::Translation3::new(self.radius * yaw.cos(), self.radius * yaw.sin(), self.height + z),
            na::UnitQuaternion::from_euler_angles(roll, pitch, yaw),
        )
    }

    pub fn velocity(&self, t: f64) -> na::Vector3<f64> {
        let (angle, rate, _) = self.heading(t);
        let (_, vz, _) = Self::swing(0.2, 0.5, t);
        na::Vector3::new(-self.radius * angle.sin() * rate, self.radius * angle.cos() * rate, vz)
    }

    /// Noise-free gyroscope and accelerometer readings
    pub fn imu(&self, t: f64) -> (na::Vector3<f64>, na::Vector3<f64>) {
        let ((roll, roll_rate, _), (pitch, pitch_rate, _), (yaw, yaw_rate, yaw_accel)) = self.attitude(t);

        let gyro = na::Vector3::new(
            roll_rate - yaw_rate * pitch.sin(),
            pitch_rate * roll.cos() + yaw_rate * pitch.cos() * roll.sin(),
            -pitch_rate * roll.sin() + yaw_rate * pitch.cos() * roll.cos(),
        );

        let (s, c) = yaw.sin_cos();
        let r = self.radius;
        let (_, _, az) = Self::swing(0.2, 0.5, t);
        let acceleration = na::Vector3::new(
            -r * c * yaw_rate * yaw_rate - r * s * yaw_accel,
            -r * s * yaw_rate * yaw_rate + r * c * yaw_accel,
            az,
        );
        let rotation = na::UnitQuaternion::from_euler_angles(roll, pitch, yaw);
        let accel = rotation.inverse() * (acceleration + na::Vector3::new(0.0, 0.0, GRAVITY));
        (gyro, accel)
    }
}

/// Producer side of the intake queue
pub struct Simulator {
    trajectory: Trajectory,
    landmarks: Vec<na::Vector3<f64>>,
    camera: Camera,
    mount: na::Isometry3<f64>,
    imu_period: u64,
    camera_period: u64,
    end: u64,
    depth_hints: bool,
}

impl Simulator {
    pub fn new(
        config: &EstimatorConfig,
        trajectory: Trajectory,
        duration: f64,
        imu_rate: f64,
        camera_rate: f64,
        depth_hints: bool,
    ) -> Self {
        let camera_config = &config.camera;
        Self {
            trajectory,
            landmarks: room(),
            camera: Camera::from_config(camera_config),
            mount: na::Isometry3::from_parts(
                na::Translation3::from(camera_config.translation_bc()),
                camera_config.rotation_bc(),
            ),
            imu_period: (NANOS_PER_SEC / imu_rate).round() as u64,
            camera_period: (NANOS_PER_SEC / camera_rate).round() as u64,
            end: (duration * NANOS_PER_SEC).round() as u64,
            depth_hints,
        }
    }

    /// What the camera sees at `t`: one observation per visible landmark,
    /// keyed by landmark index
    pub fn frame(&self, t: f64) -> FeatureFrame {
        let gsc = self.trajectory.pose(t) * self.mount;
        let inverse = gsc.inverse();
        let observations = self
            .landmarks
            .iter()
            .enumerate()
            .filter_map(|(index, point)| {
                let xc = inverse * na::Point3::from(*point);
                if xc.z < MIN_VISIBLE_DEPTH {
                    return None;
                }
                let (pixel, _) = self.camera.project(&xc.coords)?;
                if !self.camera.contains(&pixel, 1.0) {
                    return None;
                }
                let observation = FeatureObservation::new(index as u64, pixel);
                Some(if self.depth_hints {
                    observation.with_depth(xc.z)
                } else {
                    observation
                })
            })
            .collect();
        FeatureFrame { observations }
    }

    fn inertial(&self, k: u64) -> Measurement {
        let timestamp = Timestamp(k * self.imu_period);
        let (gyro, accel) = self.trajectory.imu(timestamp.as_secs_f64());
        Measurement::Inertial(ImuSample::new(timestamp, gyro, accel))
    }

    fn visual(&self, j: u64) -> Measurement {
        let timestamp = Timestamp(j * self.camera_period);
        Measurement::Visual {
            timestamp,
            input: VisualInput::Features(self.frame(timestamp.as_secs_f64())),
        }
    }

    /// Stream every measurement up to the end time, in timestamp order,
    /// inertial first on ties. Stops early if the consumer hangs up.
    pub fn run(self, tx: Sender<Measurement>) -> JoinHandle<()> {
        std::thread::spawn(move || {
            info!(
                "simulating {:.1}s over {} landmarks",
                self.end as f64 / NANOS_PER_SEC,
                self.landmarks.len()
            );
            let (mut k, mut j) = (0u64, 0u64);
            loop {
                let imu_time = k * self.imu_period;
                let camera_time = j * self.camera_period;
                if imu_time > self.end && camera_time > self.end {
                    break;
                }
                let measurement = if imu_time <= camera_time {
                    k += 1;
                    self.inertial(k - 1)
                } else {
                    j += 1;
                    self.visual(j - 1)
                };
                if tx.send(measurement).is_err() {
                    debug!("consumer hung up, stopping simulation");
                    return;
                }
            }
            debug!("simulation finished: {} inertial samples, {} frames", k, j);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_imu_matches_pose_derivative() {
        let trajectory = Trajectory::default();
        let h = 1e-5;
        for &t in &[0.5, 3.0, 7.5, 12.0] {
            let (gyro, accel) = trajectory.imu(t);

            let before = trajectory.pose(t - h).rotation;
            let after = trajectory.pose(t + h).rotation;
            let numeric_gyro = (before.inverse() * after).scaled_axis() / (2.0 * h);
            assert!((gyro - numeric_gyro).norm() < 1e-6, "gyro mismatch at t = {}", t);

            let numeric_accel = (trajectory.velocity(t + h) - trajectory.velocity(t - h)) / (2.0 * h);
            let specific = trajectory.pose(t).rotation.inverse() * (numeric_accel + na::Vector3::new(0.0, 0.0, GRAVITY));
            assert!((accel - specific).norm() < 1e-5, "accel mismatch at t = {}", t);
        }
    }

    #[test]
    fn test_starts_at_rest() {
        let trajectory = Trajectory::default();
        assert!(trajectory.velocity(0.0).norm() < 1e-12);
        let (gyro, _) = trajectory.imu(0.0);
        assert!(gyro.norm() < 1e-12);
    }

    #[test]
    fn test_camera_sees_enough_landmarks() {
        let mut config = EstimatorConfig::default();
        config.camera.rotation_bc = crate::forward_mount();
        let simulator = Simulator::new(&config, Trajectory::default(), 1.0, 200.0, 20.0, true);
        for &t in &[0.0, 5.0, 10.0, 15.0] {
            let frame = simulator.frame(t);
            assert!(frame.observations.len() > 20, "only {} landmarks visible at t = {}", frame.observations.len(), t);
            assert!(frame.observations.iter().all(|o| o.depth.unwrap() > MIN_VISIBLE_DEPTH));
        }
    }

    #[test]
    fn test_measurements_are_time_ordered() {
        let config = EstimatorConfig::default();
        let simulator = Simulator::new(&config, Trajectory::default(), 0.5, 200.0, 30.0, false);
        let (tx, rx) = crossbeam_channel::unbounded();
        simulator.run(tx).join().unwrap();
        let times: Vec<_> = rx.iter().map(|m| m.timestamp()).collect();
        assert!(times.windows(2).all(|w| w[0] <= w[1]), "measurements out of order");
        assert_eq!(times.first(), Some(&Timestamp(0)));
    }
}
