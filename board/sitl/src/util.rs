use nalgebra as na;

/// Roll, pitch, yaw in degrees
pub fn euler_deg(q: &na::UnitQuaternion<f64>) -> (f64, f64, f64) {
    let (w, x, y, z) = (q.w, q.i, q.j, q.k);

    let sinr_cosp = 2.0 * (w * x + y * z);
    let cosr_cosp = 1.0 - 2.0 * (x * x + y * y);
    let roll = sinr_cosp.atan2(cosr_cosp);

    let sinp = 2.0 * (w * y - z * x);
    let pitch = if sinp.abs() >= 1.0 {
        sinp.signum() * std::f64::consts::FRAC_PI_2
    } else {
        sinp.asin()
    };

    let siny_cosp = 2.0 * (w * z + x * y);
    let cosy_cosp = 1.0 - 2.0 * (y * y + z * z);
    let yaw = siny_cosp.atan2(cosy_cosp);

    (roll.to_degrees(), pitch.to_degrees(), yaw.to_degrees())
}

/// Angle of the rotation taking `truth` to `estimate`, in degrees
pub fn rotation_error_deg(estimate: &na::UnitQuaternion<f64>, truth: &na::UnitQuaternion<f64>) -> f64 {
    truth.rotation_to(estimate).angle().to_degrees()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_euler_round_trip() {
        let q = na::UnitQuaternion::from_euler_angles(0.1, -0.2, 1.0);
        let (roll, pitch, yaw) = euler_deg(&q);
        assert!((roll - 0.1f64.to_degrees()).abs() < 1e-9);
        assert!((pitch + 0.2f64.to_degrees()).abs() < 1e-9);
        assert!((yaw - 1.0f64.to_degrees()).abs() < 1e-9);
    }

    #[test]
    fn test_rotation_error() {
        let a = na::UnitQuaternion::from_euler_angles(0.0, 0.0, 0.3);
        let b = na::UnitQuaternion::from_euler_angles(0.0, 0.0, 0.5);
        assert!((rotation_error_deg(&a, &b) - 0.2f64.to_degrees()).abs() < 1e-9);
    }
}
