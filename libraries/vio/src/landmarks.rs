//! Landmark lifecycle.
//!
//! Every new track gets a [`LandmarkId`] from a monotonic counter. The
//! record collects observations until the track is long enough to be
//! promoted into the filter state. Instate landmarks leave the state when
//! their track is lost, when they repeatedly fail the outlier gate, when
//! they end up behind the camera, or when a better candidate needs the slot.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use log::{debug, info};
use nalgebra as na;

use crate::camera::Camera;
use crate::config::LandmarkConfig;
use crate::error::VioResult;
use crate::state::StateStore;
use crate::tracker::{TrackStatus, TrackUpdate};
use crate::triangulation::{PointEstimate, Triangulator, View};
use crate::types::{LandmarkId, Signal, TrackId, TriangulationIssue};
use crate::update::UpdateOutcome;

/// Where a landmark is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LandmarkStatus {
    /// Observed, but not part of the filter state
    Tracked,
    /// Position is estimated by the filter
    Instate,
    /// Track ended or the landmark was dropped; the id is retired
    Lost,
}

#[derive(Debug, Clone)]
struct Observation {
    frame: u64,
    pixel: na::Vector2<f64>,
    gsc: na::Isometry3<f64>,
    depth: Option<f64>,
}

#[derive(Debug, Clone)]
struct Record {
    track_id: TrackId,
    status: LandmarkStatus,
    history: VecDeque<Observation>,
    score: f64,
    last_inlier_frame: u64,
    consecutive_outliers: usize,
}

impl Record {
    fn observed_in(&self, frame: u64) -> bool {
        self.history.back().map_or(false, |o| o.frame == frame)
    }
}

/// Owner of landmark metadata and of the id space
#[derive(Debug, Clone)]
pub struct LandmarkManager {
    config: LandmarkConfig,
    triangulator: Triangulator,
    next_id: u64,
    frame: u64,
    records: BTreeMap<LandmarkId, Record>,
    by_track: HashMap<TrackId, LandmarkId>,
    /// Tracks whose landmark was demoted; ignored until the track ends
    retired_tracks: HashSet<TrackId>,
}

impl LandmarkManager {
    pub fn new(config: &LandmarkConfig, pixel_noise: f64) -> Self {
        Self {
            config: config.clone(),
            triangulator: Triangulator::new(config, pixel_noise),
            next_id: 0,
            frame: 0,
            records: BTreeMap::new(),
            by_track: HashMap::new(),
            retired_tracks: HashSet::new(),
        }
    }

    /// Number of ids issued so far
    pub fn issued(&self) -> u64 {
        self.next_id
    }

    pub fn landmark_for_track(&self, track_id: TrackId) -> Option<LandmarkId> {
        self.by_track.get(&track_id).copied()
    }

    /// Status of a landmark; ids that were issued but are gone report `Lost`
    pub fn status(&self, id: LandmarkId) -> Option<LandmarkStatus> {
        match self.records.get(&id) {
            Some(record) => Some(record.status),
            None if id.0 < self.next_id => Some(LandmarkStatus::Lost),
            None => None,
        }
    }

    /// Landmarks that are tracked but not yet in the state
    pub fn num_candidates(&self) -> usize {
        self.records
            .values()
            .filter(|r| r.status == LandmarkStatus::Tracked)
            .count()
    }

    fn issue_id(&mut self) -> LandmarkId {
        let id = LandmarkId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Fold one frame of track updates into the landmark records.
    ///
    /// Lost tracks destroy their landmark (and its state block). Returns the
    /// observations of instate landmarks for the measurement update.
    pub fn ingest(
        &mut self,
        updates: &[TrackUpdate],
        gsc: &na::Isometry3<f64>,
        store: &mut StateStore,
        signals: &mut Vec<Signal>,
    ) -> VioResult<Vec<(LandmarkId, na::Vector2<f64>)>> {
        self.frame += 1;
        let frame = self.frame;
        let mut instate = Vec::new();

        for update in updates {
            if update.status == TrackStatus::Lost {
                self.retired_tracks.remove(&update.track_id);
                if let Some(id) = self.by_track.remove(&update.track_id) {
                    let was_instate = self.destroy(id, store)?;
                    signals.push(Signal::TrackLost {
                        landmark: id,
                        was_instate,
                    });
                }
                continue;
            }
            if self.retired_tracks.contains(&update.track_id) {
                continue;
            }

            let id = match self.by_track.get(&update.track_id) {
                Some(id) => *id,
                None => {
                    let id = self.issue_id();
                    self.by_track.insert(update.track_id, id);
                    self.records.insert(
                        id,
                        Record {
                            track_id: update.track_id,
                            status: LandmarkStatus::Tracked,
                            history: VecDeque::with_capacity(self.config.max_track_history),
                            score: update.score,
                            last_inlier_frame: frame,
                            consecutive_outliers: 0,
                        },
                    );
                    id
                }
            };

            if let Some(record) = self.records.get_mut(&id) {
                if record.history.len() == self.config.max_track_history {
                    record.history.pop_front();
                }
                record.history.push_back(Observation {
                    frame,
                    pixel: update.pixel,
                    gsc: *gsc,
                    depth: update.depth,
                });
                record.score = update.score;
                if record.status == LandmarkStatus::Instate {
                    instate.push((id, update.pixel));
                }
            }
        }

        Ok(instate)
    }

    /// Remove a record and, if instate, its state block
    fn destroy(&mut self, id: LandmarkId, store: &mut StateStore) -> VioResult<bool> {
        let was_instate = match self.records.remove(&id) {
            Some(record) => record.status == LandmarkStatus::Instate,
            None => false,
        };
        if was_instate {
            store.remove_landmark(id)?;
        }
        Ok(was_instate)
    }

    /// Book-keeping after the measurement update: gate statistics, demotion
    /// and refreshing this frame's observation poses with the corrected one
    pub fn apply_outcome(
        &mut self,
        outcome: &UpdateOutcome,
        gsc: &na::Isometry3<f64>,
        store: &mut StateStore,
        signals: &mut Vec<Signal>,
    ) -> VioResult<()> {
        let frame = self.frame;
        for id in &outcome.inliers {
            if let Some(record) = self.records.get_mut(id) {
                record.last_inlier_frame = frame;
                record.consecutive_outliers = 0;
            }
        }

        let mut demote = Vec::new();
        for (id, mahalanobis_sq) in &outcome.outliers {
            signals.push(Signal::OutlierRejected {
                landmark: *id,
                mahalanobis_sq: *mahalanobis_sq,
            });
            if let Some(record) = self.records.get_mut(id) {
                record.consecutive_outliers += 1;
                if record.consecutive_outliers >= self.config.max_consecutive_outliers {
                    demote.push(*id);
                }
            }
        }
        demote.extend(outcome.behind_camera.iter().copied());

        // Landmarks the correction pushed behind the camera
        for (id, position) in store.landmarks() {
            let depth = gsc.inverse_transform_point(&na::Point3::from(*position)).z;
            if depth <= 0.0 && !demote.contains(&id) {
                demote.push(id);
            }
        }

        for id in demote {
            if let Some(record) = self.records.remove(&id) {
                self.by_track.remove(&record.track_id);
                self.retired_tracks.insert(record.track_id);
                if record.status == LandmarkStatus::Instate {
                    store.remove_landmark(id)?;
                }
                debug!("demoted landmark {}", id);
                signals.push(Signal::Demoted { landmark: id });
            }
        }

        for record in self.records.values_mut() {
            if let Some(last) = record.history.back_mut() {
                if last.frame == frame {
                    last.gsc = *gsc;
                }
            }
        }
        Ok(())
    }

    /// Promote ready candidates, evicting weaker instate landmarks when the
    /// state is full
    pub fn promote(
        &mut self,
        store: &mut StateStore,
        camera: &Camera,
        signals: &mut Vec<Signal>,
    ) -> VioResult<()> {
        let frame = self.frame;
        let mut candidates: Vec<(LandmarkId, f64, usize)> = self
            .records
            .iter()
            .filter(|(_, r)| {
                r.status == LandmarkStatus::Tracked
                    && r.observed_in(frame)
                    && (r.history.len() >= self.config.min_track_length
                        || r.history.back().map_or(false, |o| o.depth.is_some()))
            })
            .map(|(id, r)| (*id, r.score, r.history.len()))
            .collect();
        candidates.sort_by(|a, b| b.1.total_cmp(&a.1).then(b.2.cmp(&a.2)).then(a.0.cmp(&b.0)));

        for (id, _, _) in candidates.into_iter().take(self.config.max_promotions_per_frame) {
            let estimate = match self.initial_estimate(id, camera) {
                Ok(estimate) => estimate,
                Err(issue) => {
                    debug!("promotion of {} deferred: {:?}", id, issue);
                    signals.push(Signal::TriangulationFailure { landmark: id, issue });
                    continue;
                }
            };

            if store.num_landmarks() >= self.config.max_instate {
                match self.weakest_instate(store) {
                    Some((weakest, stale, trace)) if stale > 0 || trace > estimate.covariance.trace() => {
                        store.remove_landmark(weakest)?;
                        if let Some(record) = self.records.get_mut(&weakest) {
                            record.status = LandmarkStatus::Tracked;
                            record.history.clear();
                        }
                        debug!("evicted {} (stale {} frames, trace {:.3e})", weakest, stale, trace);
                        signals.push(Signal::Evicted { landmark: weakest });
                    }
                    _ => break,
                }
            }

            store.insert_landmark(id, estimate.position, estimate.covariance)?;
            if let Some(record) = self.records.get_mut(&id) {
                record.status = LandmarkStatus::Instate;
                record.last_inlier_frame = frame;
                record.consecutive_outliers = 0;
            }
            info!("promoted {} at {:?}", id, estimate.position.as_slice());
            signals.push(Signal::Promoted { landmark: id });
        }
        Ok(())
    }

    fn initial_estimate(
        &self,
        id: LandmarkId,
        camera: &Camera,
    ) -> Result<PointEstimate, TriangulationIssue> {
        let record = self
            .records
            .get(&id)
            .ok_or(TriangulationIssue::TooFewViews)?;
        let latest = record
            .history
            .back()
            .ok_or(TriangulationIssue::TooFewViews)?;

        if let Some(depth) = latest.depth {
            let view = View {
                gsc: latest.gsc,
                pixel: latest.pixel,
            };
            return self.triangulator.from_depth(camera, &view, depth);
        }

        let views: Vec<View> = record
            .history
            .iter()
            .map(|o| View {
                gsc: o.gsc,
                pixel: o.pixel,
            })
            .collect();
        self.triangulator.triangulate(camera, &views)
    }

    /// Instate landmark with the most frames since its last inlier, ties
    /// broken by the largest marginal covariance trace
    fn weakest_instate(&self, store: &StateStore) -> Option<(LandmarkId, u64, f64)> {
        store
            .landmark_ids()
            .filter_map(|id| {
                let record = self.records.get(&id)?;
                let trace = store.landmark_covariance(id)?.trace();
                Some((id, self.frame.saturating_sub(record.last_inlier_frame), trace))
            })
            .max_by(|a, b| a.1.cmp(&b.1).then(a.2.total_cmp(&b.2)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CameraConfig;
    use crate::state::{CoreState, CORE_DIM};

    fn store() -> StateStore {
        StateStore::new(CoreState::default(), na::DMatrix::identity(CORE_DIM, CORE_DIM) * 1e-2, 9.8).unwrap()
    }

    fn update(track_id: TrackId, status: TrackStatus, pixel: (f64, f64), depth: Option<f64>) -> TrackUpdate {
        TrackUpdate {
            track_id,
            pixel: na::Vector2::new(pixel.0, pixel.1),
            status,
            score: 1.0 + track_id as f64,
            depth,
        }
    }

    fn camera() -> Camera {
        Camera::from_config(&CameraConfig::default())
    }

    #[test]
    fn test_ids_are_never_reused() {
        let mut manager = LandmarkManager::new(&LandmarkConfig::default(), 1.0);
        let mut store = store();
        let mut signals = Vec::new();
        let gsc = na::Isometry3::identity();

        manager
            .ingest(&[update(1, TrackStatus::New, (100.0, 100.0), None)], &gsc, &mut store, &mut signals)
            .unwrap();
        let first = manager.landmark_for_track(1).unwrap();

        manager
            .ingest(&[update(1, TrackStatus::Lost, (100.0, 100.0), None)], &gsc, &mut store, &mut signals)
            .unwrap();
        assert_eq!(manager.status(first), Some(LandmarkStatus::Lost));

        // Same external track id comes back: a fresh landmark
        manager
            .ingest(&[update(1, TrackStatus::New, (120.0, 90.0), None)], &gsc, &mut store, &mut signals)
            .unwrap();
        let second = manager.landmark_for_track(1).unwrap();
        assert_ne!(first, second, "landmark ids must never be reassigned");
        assert!(second > first);
    }

    #[test]
    fn test_depth_hint_promotes_immediately() {
        let mut manager = LandmarkManager::new(&LandmarkConfig::default(), 1.0);
        let mut store = store();
        let mut signals = Vec::new();
        let gsc = na::Isometry3::identity();

        manager
            .ingest(
                &[update(3, TrackStatus::New, (320.0, 240.0), Some(4.0))],
                &gsc,
                &mut store,
                &mut signals,
            )
            .unwrap();
        manager.promote(&mut store, &camera(), &mut signals).unwrap();

        let id = manager.landmark_for_track(3).unwrap();
        assert_eq!(manager.status(id), Some(LandmarkStatus::Instate));
        let position = store.landmark_position(id).unwrap();
        assert!((position - na::Vector3::new(0.0, 0.0, 4.0)).norm() < 1e-9);
        assert!(signals.contains(&Signal::Promoted { landmark: id }));
    }

    #[test]
    fn test_short_track_without_depth_is_not_promoted() {
        let mut manager = LandmarkManager::new(&LandmarkConfig::default(), 1.0);
        let mut store = store();
        let mut signals = Vec::new();
        let gsc = na::Isometry3::identity();
        manager
            .ingest(&[update(1, TrackStatus::New, (300.0, 200.0), None)], &gsc, &mut store, &mut signals)
            .unwrap();
        manager.promote(&mut store, &camera(), &mut signals).unwrap();
        assert_eq!(store.num_landmarks(), 0);
        assert_eq!(manager.num_candidates(), 1);
    }

    #[test]
    fn test_capacity_evicts_stale_landmark() {
        let config = LandmarkConfig {
            max_instate: 1,
            ..LandmarkConfig::default()
        };
        let mut manager = LandmarkManager::new(&config, 1.0);
        let mut store = store();
        let mut signals = Vec::new();
        let gsc = na::Isometry3::identity();

        manager
            .ingest(&[update(1, TrackStatus::New, (320.0, 240.0), Some(3.0))], &gsc, &mut store, &mut signals)
            .unwrap();
        manager.promote(&mut store, &camera(), &mut signals).unwrap();
        let first = manager.landmark_for_track(1).unwrap();

        // Next frame: the instate landmark gets no inlier, a new depth-hinted track appears
        manager
            .ingest(
                &[
                    update(1, TrackStatus::Tracked, (320.0, 240.0), Some(3.0)),
                    update(2, TrackStatus::New, (200.0, 240.0), Some(2.0)),
                ],
                &gsc,
                &mut store,
                &mut signals,
            )
            .unwrap();
        manager.promote(&mut store, &camera(), &mut signals).unwrap();

        let second = manager.landmark_for_track(2).unwrap();
        assert_eq!(store.num_landmarks(), 1, "capacity is respected");
        assert!(store.contains(second));
        assert!(signals.contains(&Signal::Evicted { landmark: first }));
        assert_eq!(manager.status(first), Some(LandmarkStatus::Tracked));
    }

    #[test]
    fn test_lost_instate_track_removes_block() {
        let mut manager = LandmarkManager::new(&LandmarkConfig::default(), 1.0);
        let mut store = store();
        let mut signals = Vec::new();
        let gsc = na::Isometry3::identity();
        manager
            .ingest(&[update(5, TrackStatus::New, (320.0, 240.0), Some(3.0))], &gsc, &mut store, &mut signals)
            .unwrap();
        manager.promote(&mut store, &camera(), &mut signals).unwrap();
        let id = manager.landmark_for_track(5).unwrap();
        assert_eq!(store.dim(), CORE_DIM + 3);

        manager
            .ingest(&[update(5, TrackStatus::Lost, (320.0, 240.0), None)], &gsc, &mut store, &mut signals)
            .unwrap();
        assert_eq!(store.dim(), CORE_DIM);
        assert!(signals.contains(&Signal::TrackLost {
            landmark: id,
            was_instate: true
        }));
    }
}
