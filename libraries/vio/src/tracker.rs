//! Feature tracker.
//!
//! Two intake modes share the same output: a list of [`TrackUpdate`]s, one
//! per track that is new, still alive, or was lost in this frame.
//!
//! - Image mode extends live tracks with pyramidal Lucas-Kanade, validates
//!   them with a forward-backward check and tops the track set up with
//!   grid-spread FAST-9 corners.
//! - Feature mode takes an external tracker's `(track_id, pixel)` list and
//!   derives New / Tracked / Lost by comparing id sets between frames.

use std::collections::{HashMap, HashSet};

use image::GrayImage;
use imageproc::corners::corners_fast9;
use log::debug;
use nalgebra as na;

use crate::config::TrackerConfig;
use crate::error::{helpers, SensorType, VioResult};
use crate::lk::{LkTracker, Pyramid};
use crate::types::{FeatureFrame, TrackId, VisualInput};

/// Per-frame status of a 2D track
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackStatus {
    /// First seen in this frame
    New,
    /// Extended into this frame
    Tracked,
    /// Could not be extended; `pixel` is its last known position
    Lost,
}

/// Tracker output for one track
#[derive(Debug, Clone)]
pub struct TrackUpdate {
    pub track_id: TrackId,
    pub pixel: na::Vector2<f64>,
    pub status: TrackStatus,
    /// Detection strength, used to rank promotion candidates
    pub score: f64,
    /// Metric depth reported alongside the feature, if any
    pub depth: Option<f64>,
}

#[derive(Debug, Clone)]
struct LiveTrack {
    id: TrackId,
    pixel: (f32, f32),
    score: f64,
}

#[derive(Debug, Clone)]
enum Mode {
    /// No frame seen yet
    Unset,
    Image {
        previous: Pyramid,
        tracks: Vec<LiveTrack>,
    },
    Features {
        live: HashMap<TrackId, na::Vector2<f64>>,
    },
}

/// Front end turning frames into track updates
#[derive(Debug, Clone)]
pub struct FeatureTracker {
    config: TrackerConfig,
    lk: LkTracker,
    mode: Mode,
    next_track_id: TrackId,
}

impl FeatureTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            lk: LkTracker::new(config.lk.clone()),
            config,
            mode: Mode::Unset,
            next_track_id: 0,
        }
    }

    /// Number of tracks alive after the last frame
    pub fn num_live(&self) -> usize {
        match &self.mode {
            Mode::Unset => 0,
            Mode::Image { tracks, .. } => tracks.len(),
            Mode::Features { live } => live.len(),
        }
    }

    /// Process one frame
    pub fn track(&mut self, input: &VisualInput) -> VioResult<Vec<TrackUpdate>> {
        match input {
            VisualInput::Image(image) => self.track_image(image),
            VisualInput::Features(frame) => self.track_features(frame),
        }
    }

    fn track_image(&mut self, image: &GrayImage) -> VioResult<Vec<TrackUpdate>> {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Err(helpers::invalid_input("image is empty", SensorType::Camera));
        }

        let pyramid = Pyramid::build(image, self.config.lk.num_levels);
        let (mut updates, mut survivors) = match &self.mode {
            Mode::Unset => (Vec::new(), Vec::new()),
            Mode::Features { .. } => {
                return Err(helpers::invalid_input(
                    "raw image received after the session started with feature lists",
                    SensorType::Camera,
                ))
            }
            Mode::Image { previous, tracks } => {
                if previous.base().dimensions() != (width, height) {
                    return Err(helpers::invalid_input(
                        format!(
                            "image size changed from {:?} to {:?}",
                            previous.base().dimensions(),
                            (width, height)
                        ),
                        SensorType::Camera,
                    ));
                }
                self.extend_tracks(previous, &pyramid, tracks)
            }
        };

        if survivors.len() < self.config.target_tracks {
            let fresh = self.detect(image, &survivors);
            for track in fresh {
                updates.push(TrackUpdate {
                    track_id: track.id,
                    pixel: to_vector(track.pixel),
                    status: TrackStatus::New,
                    score: track.score,
                    depth: None,
                });
                survivors.push(track);
            }
        }

        debug!(
            "image tracker: {} live, {} new, {} lost",
            survivors.len(),
            updates.iter().filter(|u| u.status == TrackStatus::New).count(),
            updates.iter().filter(|u| u.status == TrackStatus::Lost).count()
        );

        self.mode = Mode::Image {
            previous: pyramid,
            tracks: survivors,
        };
        Ok(updates)
    }

    /// Follow every live track into the new frame
    fn extend_tracks(
        &self,
        previous: &Pyramid,
        next: &Pyramid,
        tracks: &[LiveTrack],
    ) -> (Vec<TrackUpdate>, Vec<LiveTrack>) {
        let (width, height) = next.base().dimensions();
        let border = self.config.border as f32;
        let mut updates = Vec::with_capacity(tracks.len());
        let mut survivors = Vec::with_capacity(tracks.len());

        for track in tracks {
            let extended = self
                .lk
                .track_checked(previous, next, track.pixel)
                .filter(|p| {
                    p.0 >= border && p.1 >= border && p.0 < width as f32 - border && p.1 < height as f32 - border
                });
            match extended {
                Some(pixel) => {
                    updates.push(TrackUpdate {
                        track_id: track.id,
                        pixel: to_vector(pixel),
                        status: TrackStatus::Tracked,
                        score: track.score,
                        depth: None,
                    });
                    survivors.push(LiveTrack { pixel, ..track.clone() });
                }
                None => updates.push(TrackUpdate {
                    track_id: track.id,
                    pixel: to_vector(track.pixel),
                    status: TrackStatus::Lost,
                    score: track.score,
                    depth: None,
                }),
            }
        }
        (updates, survivors)
    }

    /// Detect FAST-9 corners in grid cells not covered by a live track
    fn detect(&mut self, image: &GrayImage, existing: &[LiveTrack]) -> Vec<LiveTrack> {
        let (width, height) = image.dimensions();
        let cell = self.config.grid_size;
        let grid_w = ((width + cell - 1) / cell) as usize;
        let grid_h = ((height + cell - 1) / cell) as usize;
        let cell_of = |x: f32, y: f32| -> Option<usize> {
            let gx = (x.max(0.0) as u32 / cell) as usize;
            let gy = (y.max(0.0) as u32 / cell) as usize;
            (gx < grid_w && gy < grid_h).then_some(gy * grid_w + gx)
        };

        let mut occupied = vec![false; grid_w * grid_h];
        for track in existing {
            if let Some(index) = cell_of(track.pixel.0, track.pixel.1) {
                occupied[index] = true;
            }
        }

        // Strongest corner of each free cell
        let border = self.config.border as f32;
        let mut best: Vec<Option<(f32, f32, f32)>> = vec![None; grid_w * grid_h];
        for corner in corners_fast9(image, self.config.fast_threshold) {
            let (x, y) = (corner.x as f32, corner.y as f32);
            if x < border || y < border || x >= width as f32 - border || y >= height as f32 - border {
                continue;
            }
            let Some(index) = cell_of(x, y) else { continue };
            if occupied[index] {
                continue;
            }
            if best[index].map_or(true, |b| corner.score > b.2) {
                best[index] = Some((x, y, corner.score));
            }
        }

        let mut candidates: Vec<(f32, f32, f32)> = best.into_iter().flatten().collect();
        candidates.sort_by(|a, b| b.2.total_cmp(&a.2));

        let room = self.config.target_tracks.saturating_sub(existing.len());
        candidates
            .into_iter()
            .take(room)
            .map(|(x, y, score)| {
                let id = self.next_track_id;
                self.next_track_id += 1;
                LiveTrack {
                    id,
                    pixel: (x, y),
                    score: score as f64,
                }
            })
            .collect()
    }

    fn track_features(&mut self, frame: &FeatureFrame) -> VioResult<Vec<TrackUpdate>> {
        let previous = match &self.mode {
            Mode::Unset => HashMap::new(),
            Mode::Features { live } => live.clone(),
            Mode::Image { .. } => {
                return Err(helpers::invalid_input(
                    "feature list received after the session started with raw images",
                    SensorType::Camera,
                ))
            }
        };

        let mut seen = HashSet::with_capacity(frame.observations.len());
        for obs in &frame.observations {
            if !seen.insert(obs.track_id) {
                return Err(helpers::invalid_input(
                    format!("track id {} appears twice in one frame", obs.track_id),
                    SensorType::Camera,
                ));
            }
            if !obs.pixel.iter().all(|v| v.is_finite()) {
                return Err(helpers::invalid_input(
                    format!("track {} has a non-finite pixel", obs.track_id),
                    SensorType::Camera,
                ));
            }
            if let Some(depth) = obs.depth {
                if !depth.is_finite() {
                    return Err(helpers::invalid_input(
                        format!("track {} has a non-finite depth", obs.track_id),
                        SensorType::Camera,
                    ));
                }
            }
        }

        let mut updates = Vec::with_capacity(frame.observations.len() + previous.len());
        let mut live = HashMap::with_capacity(frame.observations.len());
        for obs in &frame.observations {
            let status = if previous.contains_key(&obs.track_id) {
                TrackStatus::Tracked
            } else {
                TrackStatus::New
            };
            updates.push(TrackUpdate {
                track_id: obs.track_id,
                pixel: obs.pixel,
                status,
                score: 1.0,
                depth: obs.depth,
            });
            live.insert(obs.track_id, obs.pixel);
        }

        let mut lost: Vec<_> = previous
            .into_iter()
            .filter(|(id, _)| !live.contains_key(id))
            .collect();
        lost.sort_by_key(|(id, _)| *id);
        for (track_id, pixel) in lost {
            updates.push(TrackUpdate {
                track_id,
                pixel,
                status: TrackStatus::Lost,
                score: 0.0,
                depth: None,
            });
        }

        self.mode = Mode::Features { live };
        Ok(updates)
    }
}

fn to_vector(pixel: (f32, f32)) -> na::Vector2<f64> {
    na::Vector2::new(pixel.0 as f64, pixel.1 as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FeatureObservation;

    fn frame(ids: &[u64]) -> VisualInput {
        VisualInput::Features(FeatureFrame {
            observations: ids
                .iter()
                .map(|id| FeatureObservation::new(*id, na::Vector2::new(10.0 * *id as f64, 20.0)))
                .collect(),
        })
    }

    /// Bright squares on a dark background, shifted by `(dx, dy)`
    fn checker(dx: u32, dy: u32) -> GrayImage {
        GrayImage::from_fn(320, 240, |x, y| {
            let (x, y) = (x.wrapping_sub(dx), y.wrapping_sub(dy));
            let on = (x / 16 + y / 16) % 2 == 0 && (x % 16) > 3 && (y % 16) > 3;
            image::Luma([if on { 220 } else { 30 }])
        })
    }

    #[test]
    fn test_feature_mode_statuses() {
        let mut tracker = FeatureTracker::new(TrackerConfig::default());
        let first = tracker.track(&frame(&[1, 2, 3])).unwrap();
        assert!(first.iter().all(|u| u.status == TrackStatus::New));

        let second = tracker.track(&frame(&[2, 3, 4])).unwrap();
        let status_of = |id: u64| second.iter().find(|u| u.track_id == id).unwrap().status;
        assert_eq!(status_of(1), TrackStatus::Lost);
        assert_eq!(status_of(2), TrackStatus::Tracked);
        assert_eq!(status_of(4), TrackStatus::New);
        assert_eq!(tracker.num_live(), 3);
    }

    #[test]
    fn test_duplicate_track_id_rejected() {
        let mut tracker = FeatureTracker::new(TrackerConfig::default());
        assert!(tracker.track(&frame(&[5, 5])).is_err());
    }

    #[test]
    fn test_mixing_modes_rejected() {
        let mut tracker = FeatureTracker::new(TrackerConfig::default());
        tracker.track(&frame(&[1])).unwrap();
        let image = VisualInput::Image(checker(0, 0));
        assert!(tracker.track(&image).is_err(), "switching intake mode must fail");
    }

    #[test]
    fn test_image_mode_detects_and_tracks() {
        let mut tracker = FeatureTracker::new(TrackerConfig::default());
        let first = tracker.track(&VisualInput::Image(checker(0, 0))).unwrap();
        assert!(!first.is_empty(), "textured image must yield corners");
        assert!(first.iter().all(|u| u.status == TrackStatus::New));

        let second = tracker.track(&VisualInput::Image(checker(2, 1))).unwrap();
        let tracked: Vec<_> = second.iter().filter(|u| u.status == TrackStatus::Tracked).collect();
        assert!(!tracked.is_empty(), "small shift must keep tracks alive");
        for update in tracked {
            let origin = first.iter().find(|u| u.track_id == update.track_id).unwrap();
            let shift = update.pixel - origin.pixel;
            assert!((shift.x - 2.0).abs() < 1.0 && (shift.y - 1.0).abs() < 1.0, "shift was {:?}", shift);
        }
    }

    #[test]
    fn test_unchanged_image_keeps_every_track() {
        let mut tracker = FeatureTracker::new(TrackerConfig::default());
        let first = tracker.track(&VisualInput::Image(checker(0, 0))).unwrap();
        let second = tracker.track(&VisualInput::Image(checker(0, 0))).unwrap();

        let lost: Vec<_> = second
            .iter()
            .filter(|u| u.status == TrackStatus::Lost)
            .map(|u| u.pixel)
            .collect();
        assert!(lost.is_empty(), "tracks lost on an identical frame: {:?}", lost);
        for update in &first {
            assert!(
                second
                    .iter()
                    .any(|u| u.track_id == update.track_id && u.status == TrackStatus::Tracked),
                "track {} at {:?} was not extended",
                update.track_id,
                update.pixel
            );
        }
    }

    #[test]
    fn test_image_size_change_rejected() {
        let mut tracker = FeatureTracker::new(TrackerConfig::default());
        tracker.track(&VisualInput::Image(checker(0, 0))).unwrap();
        let small = GrayImage::new(100, 100);
        assert!(tracker.track(&VisualInput::Image(small)).is_err());
    }
}
