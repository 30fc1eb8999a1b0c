use nalgebra as na;

use crate::error::{helpers, VioResult};

const SMALL_ANGLE: f64 = 1e-8;

/// Create a skew-symmetric matrix from a 3D vector
#[rustfmt::skip]
pub fn skew_symmetric(v: &na::Vector3<f64>) -> na::Matrix3<f64> {
    na::Matrix3::new(
        0.0, -v.z, v.y,
        v.z, 0.0, -v.x,
        -v.y, v.x, 0.0,
    )
}

/// Rotation matrix exp([phi]x)
pub fn so3_exp(phi: &na::Vector3<f64>) -> na::Matrix3<f64> {
    na::Rotation3::from_scaled_axis(*phi).into_inner()
}

/// Right Jacobian of SO(3)
pub fn right_jacobian(phi: &na::Vector3<f64>) -> na::Matrix3<f64> {
    let theta = phi.norm();
    let k = skew_symmetric(phi);
    if theta < SMALL_ANGLE {
        return na::Matrix3::identity() - 0.5 * k;
    }
    let theta_sq = theta * theta;
    na::Matrix3::identity() - ((1.0 - theta.cos()) / theta_sq) * k
        + ((theta - theta.sin()) / (theta_sq * theta)) * k * k
}

/// Check if all entries of a dynamic matrix are finite
pub fn all_finite(m: &na::DMatrix<f64>) -> bool {
    m.iter().all(|v| v.is_finite())
}

/// Replace `m` with (m + m^T) / 2
pub fn symmetrize(m: &mut na::DMatrix<f64>) {
    let n = m.nrows();
    for i in 0..n {
        for j in (i + 1)..n {
            let avg = 0.5 * (m[(i, j)] + m[(j, i)]);
            m[(i, j)] = avg;
            m[(j, i)] = avg;
        }
    }
}

/// Smallest eigenvalue of a symmetric matrix
pub fn min_eigenvalue(m: &na::DMatrix<f64>) -> f64 {
    if m.nrows() == 0 {
        return 0.0;
    }
    na::SymmetricEigen::new(m.clone()).eigenvalues.min()
}

/// Symmetrize a covariance, check it for finiteness, and clip slightly
/// negative eigenvalues to zero.
///
/// Eigenvalues below `-tolerance` (scaled by the largest diagonal entry)
/// mean the filter has lost its covariance and are reported as a
/// degeneracy. Returns the number of eigenvalues that were clipped.
pub fn condition_covariance(
    m: &mut na::DMatrix<f64>,
    tolerance: f64,
    component: &str,
) -> VioResult<usize> {
    if !all_finite(m) {
        return Err(helpers::degeneracy(
            "covariance contains NaN or infinite values",
            component,
            None,
        ));
    }
    symmetrize(m);
    if m.nrows() == 0 {
        return Ok(0);
    }

    let scale = m.diagonal().iter().fold(1.0_f64, |acc, v| acc.max(v.abs()));
    let eigen = na::SymmetricEigen::new(m.clone());
    let min = eigen.eigenvalues.min();
    if min < -tolerance * scale {
        return Err(helpers::degeneracy(
            format!("covariance is not positive-semidefinite (min eigenvalue {:e})", min),
            component,
            Some(min),
        ));
    }
    if min >= 0.0 {
        return Ok(0);
    }

    let clipped = eigen.eigenvalues.iter().filter(|v| **v < 0.0).count();
    let values = eigen.eigenvalues.map(|v| v.max(0.0));
    let rebuilt = &eigen.eigenvectors * na::DMatrix::from_diagonal(&values) * eigen.eigenvectors.transpose();
    m.copy_from(&rebuilt);
    symmetrize(m);
    Ok(clipped)
}

/// Rotation taking `from` onto `to`, handling the antiparallel case
pub fn rotation_between(from: &na::Vector3<f64>, to: &na::Vector3<f64>) -> na::UnitQuaternion<f64> {
    match na::UnitQuaternion::rotation_between(from, to) {
        Some(q) => q,
        None => {
            // Antiparallel: turn half a revolution about any axis orthogonal to `from`
            let helper = if from.x.abs() < 0.9 {
                na::Vector3::x()
            } else {
                na::Vector3::y()
            };
            let axis = na::Unit::new_normalize(from.cross(&helper));
            na::UnitQuaternion::from_axis_angle(&axis, std::f64::consts::PI)
        }
    }
}

/// Maximum deviation of a rotation matrix from orthonormality
pub fn orthonormality_error(r: &na::Matrix3<f64>) -> f64 {
    let gram = r.transpose() * r - na::Matrix3::identity();
    gram.abs().max().max((r.determinant() - 1.0).abs())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_skew_matches_cross_product() {
        let a = na::Vector3::new(0.3, -1.2, 2.0);
        let b = na::Vector3::new(-0.7, 0.1, 0.5);
        assert_relative_eq!(skew_symmetric(&a) * b, a.cross(&b), epsilon = 1e-12);
    }

    #[test]
    fn test_right_jacobian_small_angle() {
        let phi = na::Vector3::new(1e-10, 0.0, 0.0);
        assert_relative_eq!(right_jacobian(&phi), na::Matrix3::identity(), epsilon = 1e-9);
    }

    #[test]
    fn test_condition_clips_tiny_negative_eigenvalue() {
        let mut m = na::DMatrix::from_row_slice(2, 2, &[1.0, 1.0, 1.0, 1.0 - 1e-9]);
        let clipped = condition_covariance(&mut m, 1e-6, "test").unwrap();
        assert_eq!(clipped, 1);
        assert!(min_eigenvalue(&m) > -1e-12);
    }

    #[test]
    fn test_condition_rejects_indefinite() {
        let mut m = na::DMatrix::from_row_slice(2, 2, &[1.0, 0.0, 0.0, -0.5]);
        let err = condition_covariance(&mut m, 1e-6, "test").unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_condition_leaves_psd_untouched() {
        let original = na::DMatrix::from_row_slice(2, 2, &[2.0, 0.5, 0.5, 1.0]);
        let mut m = original.clone();
        assert_eq!(condition_covariance(&mut m, 1e-6, "test").unwrap(), 0);
        assert_eq!(m, original);
    }

    #[test]
    fn test_rotation_between_antiparallel() {
        let a = na::Vector3::z();
        let q = rotation_between(&a, &(-a));
        assert_relative_eq!(q * a, -a, epsilon = 1e-12);
    }
}
