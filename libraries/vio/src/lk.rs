//! Pyramidal Lucas-Kanade optical flow.

use image::{imageops, GrayImage};

use crate::config::LkConfig;

/// Image pyramid, finest level first
#[derive(Debug, Clone)]
pub struct Pyramid {
    levels: Vec<GrayImage>,
}

impl Pyramid {
    pub fn build(image: &GrayImage, num_levels: usize) -> Self {
        let mut levels = Vec::with_capacity(num_levels);
        levels.push(image.clone());
        for level in 1..num_levels {
            let prev = &levels[level - 1];
            let (width, height) = prev.dimensions();
            if width < 16 || height < 16 {
                break;
            }
            let next = imageops::resize(prev, width / 2, height / 2, imageops::FilterType::Triangle);
            levels.push(next);
        }
        Self { levels }
    }

    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }

    pub fn base(&self) -> &GrayImage {
        &self.levels[0]
    }
}

/// Lucas-Kanade tracker
#[derive(Debug, Clone)]
pub struct LkTracker {
    config: LkConfig,
}

impl LkTracker {
    pub fn new(config: LkConfig) -> Self {
        Self { config }
    }

    /// Track one point from `prev` to `next`; `None` if it cannot be
    /// followed confidently
    pub fn track_point(&self, prev: &Pyramid, next: &Pyramid, point: (f32, f32)) -> Option<(f32, f32)> {
        let levels = prev.num_levels().min(next.num_levels());
        let mut flow = (0.0f32, 0.0f32);

        for level in (0..levels).rev() {
            let scale = (1u32 << level) as f32;
            let prev_pt = (point.0 / scale, point.1 / scale);
            let guess = (prev_pt.0 + flow.0, prev_pt.1 + flow.1);
            match self.track_at_level(&prev.levels[level], &next.levels[level], prev_pt, guess) {
                Some(found) => flow = (found.0 - prev_pt.0, found.1 - prev_pt.1),
                // Near the border the window no longer fits on coarse
                // levels; carry the current guess down and let the finer
                // levels decide.
                None if level > 0 => {}
                None => return None,
            }
            if level > 0 {
                flow = (flow.0 * 2.0, flow.1 * 2.0);
            }
        }

        let result = (point.0 + flow.0, point.1 + flow.1);
        let (width, height) = prev.base().dimensions();
        if result.0 < 0.0 || result.1 < 0.0 || result.0 >= width as f32 || result.1 >= height as f32 {
            return None;
        }
        Some(result)
    }

    /// Track forward, then back, and keep the point only if the round trip
    /// lands within `max_fb_error` of where it started
    pub fn track_checked(&self, prev: &Pyramid, next: &Pyramid, point: (f32, f32)) -> Option<(f32, f32)> {
        let forward = self.track_point(prev, next, point)?;
        let backward = self.track_point(next, prev, forward)?;
        let dx = backward.0 - point.0;
        let dy = backward.1 - point.1;
        if (dx * dx + dy * dy).sqrt() > self.config.max_fb_error {
            return None;
        }
        Some(forward)
    }

    /// Iterative Lucas-Kanade at a single pyramid level
    fn track_at_level(
        &self,
        prev: &GrayImage,
        next: &GrayImage,
        prev_pt: (f32, f32),
        init_guess: (f32, f32),
    ) -> Option<(f32, f32)> {
        let win = self.config.win_size as i32;
        if !inside(prev, prev_pt, win) {
            return None;
        }

        let side = (2 * win + 1) as usize;
        let mut template = Vec::with_capacity(side * side);
        let mut grad_x = Vec::with_capacity(side * side);
        let mut grad_y = Vec::with_capacity(side * side);
        let (mut gxx, mut gxy, mut gyy) = (0.0f32, 0.0f32, 0.0f32);

        for dy in -win..=win {
            for dx in -win..=win {
                let x = prev_pt.0 + dx as f32;
                let y = prev_pt.1 + dy as f32;
                let ix = 0.5 * (sample(prev, x + 1.0, y) - sample(prev, x - 1.0, y));
                let iy = 0.5 * (sample(prev, x, y + 1.0) - sample(prev, x, y - 1.0));
                template.push(sample(prev, x, y));
                grad_x.push(ix);
                grad_y.push(iy);
                gxx += ix * ix;
                gxy += ix * iy;
                gyy += iy * iy;
            }
        }

        let area = (side * side) as f32;
        let trace = gxx + gyy;
        let det = gxx * gyy - gxy * gxy;
        let min_eig = 0.5 * (trace - (trace * trace - 4.0 * det).max(0.0).sqrt());
        if min_eig / area < self.config.min_eigenvalue || det.abs() < 1e-6 {
            return None;
        }

        let mut pos = init_guess;
        for _ in 0..self.config.max_iterations {
            if !inside(next, pos, win) {
                return None;
            }
            let (mut bx, mut by) = (0.0f32, 0.0f32);
            let mut idx = 0;
            for dy in -win..=win {
                for dx in -win..=win {
                    let diff = template[idx] - sample(next, pos.0 + dx as f32, pos.1 + dy as f32);
                    bx += grad_x[idx] * diff;
                    by += grad_y[idx] * diff;
                    idx += 1;
                }
            }
            let step_x = (gyy * bx - gxy * by) / det;
            let step_y = (gxx * by - gxy * bx) / det;
            pos = (pos.0 + step_x, pos.1 + step_y);
            if step_x * step_x + step_y * step_y < self.config.epsilon * self.config.epsilon {
                break;
            }
        }

        if inside(next, pos, win) {
            Some(pos)
        } else {
            None
        }
    }
}

fn inside(image: &GrayImage, pt: (f32, f32), win: i32) -> bool {
    let (width, height) = image.dimensions();
    let margin = (win + 1) as f32;
    pt.0 >= margin && pt.1 >= margin && pt.0 < width as f32 - margin && pt.1 < height as f32 - margin
}

/// Bilinear interpolation, clamped to the image
fn sample(image: &GrayImage, x: f32, y: f32) -> f32 {
    let (width, height) = image.dimensions();
    let max_x = width as i32 - 1;
    let max_y = height as i32 - 1;

    let x0 = x.floor() as i32;
    let y0 = y.floor() as i32;
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;

    let px = |xi: i32, yi: i32| -> f32 {
        image.get_pixel(xi.clamp(0, max_x) as u32, yi.clamp(0, max_y) as u32).0[0] as f32
    };

    let top = px(x0, y0) * (1.0 - fx) + px(x0 + 1, y0) * fx;
    let bottom = px(x0, y0 + 1) * (1.0 - fx) + px(x0 + 1, y0 + 1) * fx;
    top * (1.0 - fy) + bottom * fy
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Smooth blob pattern that gives LK a well-conditioned gradient field
    fn blob_image(width: u32, height: u32, shift_x: f32, shift_y: f32) -> GrayImage {
        GrayImage::from_fn(width, height, |x, y| {
            let fx = x as f32 - shift_x;
            let fy = y as f32 - shift_y;
            let v = 128.0 + 60.0 * (fx * 0.15).sin() * (fy * 0.11).cos() + 40.0 * ((fx + fy) * 0.07).sin();
            image::Luma([v.clamp(0.0, 255.0) as u8])
        })
    }

    #[test]
    fn test_stationary_point() {
        let tracker = LkTracker::new(LkConfig::default());
        let image = blob_image(120, 100, 0.0, 0.0);
        let pyramid = Pyramid::build(&image, 3);
        let found = tracker.track_checked(&pyramid, &pyramid, (60.0, 50.0)).unwrap();
        assert!((found.0 - 60.0).abs() < 0.1 && (found.1 - 50.0).abs() < 0.1);
    }

    #[test]
    fn test_shifted_image() {
        let tracker = LkTracker::new(LkConfig::default());
        let prev = Pyramid::build(&blob_image(160, 120, 0.0, 0.0), 3);
        let next = Pyramid::build(&blob_image(160, 120, 3.0, -2.0), 3);
        let found = tracker.track_point(&prev, &next, (80.0, 60.0)).unwrap();
        assert!((found.0 - 83.0).abs() < 0.5, "x was {}", found.0);
        assert!((found.1 - 58.0).abs() < 0.5, "y was {}", found.1);
    }

    #[test]
    fn test_points_near_border_survive_identical_frames() {
        let tracker = LkTracker::new(LkConfig::default());
        let pyramid = Pyramid::build(&blob_image(160, 120, 0.0, 0.0), 3);
        for &x in &[10.0f32, 20.0, 30.0, 150.0] {
            let found = tracker
                .track_checked(&pyramid, &pyramid, (x, 60.0))
                .unwrap_or_else(|| panic!("point at x = {} lost on an unchanged image", x));
            assert!((found.0 - x).abs() < 0.1 && (found.1 - 60.0).abs() < 0.1);
        }
    }

    #[test]
    fn test_flat_image_is_untrackable() {
        let tracker = LkTracker::new(LkConfig::default());
        let flat = Pyramid::build(&GrayImage::from_pixel(100, 100, image::Luma([128])), 3);
        assert!(tracker.track_point(&flat, &flat, (50.0, 50.0)).is_none());
    }
}
