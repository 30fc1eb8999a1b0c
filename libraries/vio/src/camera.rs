//! Pinhole camera with radial-tangential distortion.

use nalgebra as na;

use crate::config::CameraConfig;

/// Points closer than this to the image plane are not projected
const MIN_PROJECTION_DEPTH: f64 = 1e-6;

/// Calibrated monocular camera
#[derive(Debug, Clone)]
pub struct Camera {
    pub width: u32,
    pub height: u32,
    fx: f64,
    fy: f64,
    cx: f64,
    cy: f64,
    k1: f64,
    k2: f64,
    p1: f64,
    p2: f64,
}

impl Camera {
    pub fn from_config(config: &CameraConfig) -> Self {
        let [k1, k2, p1, p2] = config.distortion;
        Self {
            width: config.width,
            height: config.height,
            fx: config.fx,
            fy: config.fy,
            cx: config.cx,
            cy: config.cy,
            k1,
            k2,
            p1,
            p2,
        }
    }

    /// Mean focal length, used to convert pixel errors to angles
    pub fn focal(&self) -> f64 {
        0.5 * (self.fx + self.fy)
    }

    /// Whether a pixel lies inside the image with a margin
    pub fn contains(&self, pixel: &na::Vector2<f64>, margin: f64) -> bool {
        pixel.x >= margin
            && pixel.y >= margin
            && pixel.x < self.width as f64 - margin
            && pixel.y < self.height as f64 - margin
    }

    /// Apply distortion to normalized coordinates, with its 2x2 Jacobian
    fn distort(&self, xn: &na::Vector2<f64>) -> (na::Vector2<f64>, na::Matrix2<f64>) {
        let (x, y) = (xn.x, xn.y);
        let r2 = x * x + y * y;
        let radial = 1.0 + self.k1 * r2 + self.k2 * r2 * r2;
        let d_radial = self.k1 + 2.0 * self.k2 * r2;

        let xd = x * radial + 2.0 * self.p1 * x * y + self.p2 * (r2 + 2.0 * x * x);
        let yd = y * radial + self.p1 * (r2 + 2.0 * y * y) + 2.0 * self.p2 * x * y;

        let dxd_dx = radial + 2.0 * x * x * d_radial + 2.0 * self.p1 * y + 6.0 * self.p2 * x;
        let dxd_dy = 2.0 * x * y * d_radial + 2.0 * self.p1 * x + 2.0 * self.p2 * y;
        let dyd_dx = 2.0 * x * y * d_radial + 2.0 * self.p1 * x + 2.0 * self.p2 * y;
        let dyd_dy = radial + 2.0 * y * y * d_radial + 6.0 * self.p1 * y + 2.0 * self.p2 * x;

        (
            na::Vector2::new(xd, yd),
            na::Matrix2::new(dxd_dx, dxd_dy, dyd_dx, dyd_dy),
        )
    }

    /// Project a point in camera coordinates to pixels.
    ///
    /// Returns the pixel and the 2x3 Jacobian with respect to the point, or
    /// `None` when the point is behind the camera.
    pub fn project(&self, xc: &na::Vector3<f64>) -> Option<(na::Vector2<f64>, na::Matrix2x3<f64>)> {
        if xc.z < MIN_PROJECTION_DEPTH {
            return None;
        }
        let inv_z = 1.0 / xc.z;
        let xn = na::Vector2::new(xc.x * inv_z, xc.y * inv_z);
        let (xd, d_dist) = self.distort(&xn);

        let pixel = na::Vector2::new(self.fx * xd.x + self.cx, self.fy * xd.y + self.cy);

        #[rustfmt::skip]
        let d_norm = na::Matrix2x3::new(
            inv_z, 0.0, -xc.x * inv_z * inv_z,
            0.0, inv_z, -xc.y * inv_z * inv_z,
        );
        let d_focal = na::Matrix2::new(self.fx, 0.0, 0.0, self.fy);

        Some((pixel, d_focal * d_dist * d_norm))
    }

    /// Recover normalized coordinates from a pixel by Gauss-Newton on the
    /// distortion model
    pub fn unproject(&self, pixel: &na::Vector2<f64>) -> na::Vector2<f64> {
        let target = na::Vector2::new((pixel.x - self.cx) / self.fx, (pixel.y - self.cy) / self.fy);
        let mut xn = target;
        for _ in 0..10 {
            let (xd, jac) = self.distort(&xn);
            let residual = xd - target;
            if residual.norm_squared() < 1e-24 {
                break;
            }
            match jac.try_inverse() {
                Some(inv) => xn -= inv * residual,
                None => break,
            }
        }
        xn
    }

    /// Unit-depth ray through a pixel
    pub fn bearing(&self, pixel: &na::Vector2<f64>) -> na::Vector3<f64> {
        let xn = self.unproject(pixel);
        na::Vector3::new(xn.x, xn.y, 1.0)
    }
}
