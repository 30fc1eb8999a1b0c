//! Initial 3D estimates for landmarks about to enter the filter state.
//!
//! Multi-view points go through linear DLT, Gauss-Newton refinement and
//! parallax / depth / reprojection checks. A feature with a depth hint is
//! back-projected directly.

use nalgebra as na;

use crate::camera::Camera;
use crate::config::LandmarkConfig;
use crate::types::TriangulationIssue;

const REFINE_ITERATIONS: usize = 10;

/// One observation of a point: camera pose in the spatial frame and pixel
#[derive(Debug, Clone, Copy)]
pub struct View {
    pub gsc: na::Isometry3<f64>,
    pub pixel: na::Vector2<f64>,
}

/// Position estimate with its covariance, in the spatial frame
#[derive(Debug, Clone, Copy)]
pub struct PointEstimate {
    pub position: na::Vector3<f64>,
    pub covariance: na::Matrix3<f64>,
    /// RMS reprojection error over the views (px)
    pub rms_error: f64,
}

/// Thresholds shared by both initialization paths
#[derive(Debug, Clone)]
pub struct Triangulator {
    min_parallax_rad: f64,
    max_reprojection_error: f64,
    min_depth: f64,
    max_depth: f64,
    inflation: f64,
    depth_std_ratio: f64,
    pixel_noise: f64,
}

impl Triangulator {
    pub fn new(config: &LandmarkConfig, pixel_noise: f64) -> Self {
        Self {
            min_parallax_rad: config.min_parallax_deg.to_radians(),
            max_reprojection_error: config.max_reprojection_error,
            min_depth: config.min_depth,
            max_depth: config.max_depth,
            inflation: config.init_cov_inflation,
            depth_std_ratio: config.depth_hint_std_ratio,
            pixel_noise,
        }
    }

    /// Triangulate from two or more views
    pub fn triangulate(&self, camera: &Camera, views: &[View]) -> Result<PointEstimate, TriangulationIssue> {
        if views.len() < 2 {
            return Err(TriangulationIssue::TooFewViews);
        }

        let rays: Vec<na::Vector3<f64>> = views
            .iter()
            .map(|v| (v.gsc.rotation * camera.bearing(&v.pixel)).normalize())
            .collect();
        if max_ray_angle(&rays) < self.min_parallax_rad {
            return Err(TriangulationIssue::LowParallax);
        }

        let mut position = linear_triangulation(camera, views)?;
        self.check_depths(views, &position)?;

        let mut information = na::Matrix3::zeros();
        for _ in 0..REFINE_ITERATIONS {
            let mut h = na::Matrix3::zeros();
            let mut b = na::Vector3::zeros();
            for view in views {
                let (residual, jac) =
                    reprojection(camera, view, &position).ok_or(TriangulationIssue::BadDepth)?;
                h += jac.transpose() * jac;
                b += jac.transpose() * residual;
            }
            information = h;
            let step = na::Cholesky::new(h)
                .ok_or(TriangulationIssue::Singular)?
                .solve(&b);
            position += step;
            if step.norm() < 1e-9 * position.norm().max(1.0) {
                break;
            }
        }
        self.check_depths(views, &position)?;

        let mut sum_sq = 0.0;
        for view in views {
            let (residual, _) = reprojection(camera, view, &position).ok_or(TriangulationIssue::BadDepth)?;
            sum_sq += residual.norm_squared();
        }
        let rms_error = (sum_sq / views.len() as f64).sqrt();
        if rms_error > self.max_reprojection_error {
            return Err(TriangulationIssue::ReprojectionError);
        }

        let inverse = information.try_inverse().ok_or(TriangulationIssue::Singular)?;
        let covariance = inverse * (self.pixel_noise * self.pixel_noise * self.inflation);
        if !position.iter().chain(covariance.iter()).all(|v| v.is_finite()) {
            return Err(TriangulationIssue::Singular);
        }

        Ok(PointEstimate {
            position,
            covariance,
            rms_error,
        })
    }

    /// Back-project a pixel with a metric depth along the optical axis
    pub fn from_depth(
        &self,
        camera: &Camera,
        view: &View,
        depth: f64,
    ) -> Result<PointEstimate, TriangulationIssue> {
        if !(depth >= self.min_depth && depth <= self.max_depth) {
            return Err(TriangulationIssue::BadDepth);
        }
        let xc = camera.bearing(&view.pixel) * depth;

        let lateral = depth * self.pixel_noise / camera.focal();
        let axial = depth * self.depth_std_ratio;
        let cov_c = na::Matrix3::from_diagonal(&na::Vector3::new(
            lateral * lateral,
            lateral * lateral,
            axial * axial,
        ));
        let r = view.gsc.rotation.to_rotation_matrix().into_inner();

        Ok(PointEstimate {
            position: (view.gsc * na::Point3::from(xc)).coords,
            covariance: r * cov_c * r.transpose(),
            rms_error: 0.0,
        })
    }

    fn check_depths(&self, views: &[View], position: &na::Vector3<f64>) -> Result<(), TriangulationIssue> {
        for view in views {
            let depth = view.gsc.inverse_transform_point(&na::Point3::from(*position)).z;
            if !(depth >= self.min_depth && depth <= self.max_depth) {
                return Err(TriangulationIssue::BadDepth);
            }
        }
        Ok(())
    }
}

/// Largest angle between any two rays
fn max_ray_angle(rays: &[na::Vector3<f64>]) -> f64 {
    let mut best = 0.0f64;
    for (i, a) in rays.iter().enumerate() {
        for b in &rays[i + 1..] {
            best = best.max(a.angle(b));
        }
    }
    best
}

/// Homogeneous DLT, solved as the smallest eigenvector of the 4x4 normal matrix
fn linear_triangulation(camera: &Camera, views: &[View]) -> Result<na::Vector3<f64>, TriangulationIssue> {
    let mut normal = na::Matrix4::<f64>::zeros();
    for view in views {
        let xn = camera.unproject(&view.pixel);
        let pose = view.gsc.inverse().to_homogeneous();
        let p1 = pose.fixed_view::<1, 4>(0, 0).into_owned();
        let p2 = pose.fixed_view::<1, 4>(1, 0).into_owned();
        let p3 = pose.fixed_view::<1, 4>(2, 0).into_owned();
        let row_x = p3 * xn.x - p1;
        let row_y = p3 * xn.y - p2;
        normal += row_x.transpose() * row_x + row_y.transpose() * row_y;
    }

    let eigen = na::SymmetricEigen::new(normal);
    let index = eigen.eigenvalues.imin();
    let v = eigen.eigenvectors.column(index);
    if v[3].abs() < 1e-12 {
        return Err(TriangulationIssue::Singular);
    }
    Ok(na::Vector3::new(v[0] / v[3], v[1] / v[3], v[2] / v[3]))
}

/// Pixel residual and its Jacobian with respect to the spatial position
fn reprojection(
    camera: &Camera,
    view: &View,
    position: &na::Vector3<f64>,
) -> Option<(na::Vector2<f64>, na::Matrix2x3<f64>)> {
    let xc = view.gsc.inverse_transform_point(&na::Point3::from(*position)).coords;
    let (predicted, d_proj) = camera.project(&xc)?;
    let r_cs = view.gsc.rotation.inverse().to_rotation_matrix().into_inner();
    Some((view.pixel - predicted, d_proj * r_cs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CameraConfig;
    use approx::assert_relative_eq;

    fn camera() -> Camera {
        Camera::from_config(&CameraConfig::default())
    }

    fn view_at(camera: &Camera, center: na::Vector3<f64>, point: &na::Vector3<f64>) -> View {
        let gsc = na::Isometry3::from_parts(na::Translation3::from(center), na::UnitQuaternion::identity());
        let xc = gsc.inverse_transform_point(&na::Point3::from(*point)).coords;
        let (pixel, _) = camera.project(&xc).unwrap();
        View { gsc, pixel }
    }

    #[test]
    fn test_triangulates_exact_point() {
        let camera = camera();
        let point = na::Vector3::new(0.3, -0.2, 4.0);
        let views: Vec<View> = (0..5)
            .map(|k| view_at(&camera, na::Vector3::new(0.1 * k as f64, 0.02 * k as f64, 0.0), &point))
            .collect();
        let estimate = Triangulator::new(&LandmarkConfig::default(), 1.0)
            .triangulate(&camera, &views)
            .unwrap();
        assert_relative_eq!(estimate.position, point, epsilon = 1e-6);
        assert!(estimate.rms_error < 1e-6);
        assert!(estimate.covariance[(2, 2)] > estimate.covariance[(0, 0)], "depth is the weakest direction");
    }

    #[test]
    fn test_rejects_pure_rotation() {
        let camera = camera();
        let point = na::Vector3::new(0.0, 0.0, 5.0);
        let views = vec![view_at(&camera, na::Vector3::zeros(), &point); 3];
        let result = Triangulator::new(&LandmarkConfig::default(), 1.0).triangulate(&camera, &views);
        assert_eq!(result.unwrap_err(), TriangulationIssue::LowParallax);
    }

    #[test]
    fn test_rejects_single_view() {
        let camera = camera();
        let point = na::Vector3::new(0.0, 0.0, 5.0);
        let views = vec![view_at(&camera, na::Vector3::zeros(), &point)];
        let result = Triangulator::new(&LandmarkConfig::default(), 1.0).triangulate(&camera, &views);
        assert_eq!(result.unwrap_err(), TriangulationIssue::TooFewViews);
    }

    #[test]
    fn test_rejects_inconsistent_views() {
        let camera = camera();
        let point = na::Vector3::new(0.0, 0.0, 4.0);
        let mut views: Vec<View> = (0..4)
            .map(|k| view_at(&camera, na::Vector3::new(0.15 * k as f64, 0.0, 0.0), &point))
            .collect();
        views[1].pixel.y += 25.0;
        views[3].pixel.y -= 25.0;
        let result = Triangulator::new(&LandmarkConfig::default(), 1.0).triangulate(&camera, &views);
        assert_eq!(result.unwrap_err(), TriangulationIssue::ReprojectionError);
    }

    #[test]
    fn test_depth_hint_backprojects() {
        let camera = camera();
        let point = na::Vector3::new(0.5, 0.25, 2.5);
        let view = view_at(&camera, na::Vector3::new(0.0, 0.0, 0.5), &point);
        let estimate = Triangulator::new(&LandmarkConfig::default(), 1.0)
            .from_depth(&camera, &view, 2.0)
            .unwrap();
        assert_relative_eq!(estimate.position, point, epsilon = 1e-9);
        assert!(Triangulator::new(&LandmarkConfig::default(), 1.0)
            .from_depth(&camera, &view, -1.0)
            .is_err());
    }
}
