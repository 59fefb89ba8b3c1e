//! ZoneTracker - Debounced zone occupancy
//!
//! ## Responsibilities
//!
//! - Turn noisy per-frame detections into stable per-zone occupancy
//! - Per-(zone, track) dwell counters with hysteresis
//! - Purge tracks only after the patience window expires
//!
//! A zone registers occupied once any resident track has been present
//! for `occupancy_threshold` frames. A brief dropout (shorter than
//! `patience_threshold` frames) never resets accumulated dwell; the
//! track resumes counting where it left off. When several tracks
//! qualify, the longest-resident one is the zone's occupant.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::models::SizeClass;

/// Frames of continuous-enough presence before a zone counts as occupied
/// (~1s at 30fps)
pub const OCCUPANCY_THRESHOLD: u32 = 30;

/// Frames of absence tolerated before a track's dwell is discarded
pub const PATIENCE_THRESHOLD: u32 = 30;

/// Fixed geometric region for one parking slot, camera-space footprint.
/// Rect is normalized `[x1, y1, x2, y2]`. Static after provisioning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Zone {
    /// Lowercase zone id, e.g. "b3"
    pub id: String,
    pub rect: [f64; 4],
    pub size_class: SizeClass,
}

impl Zone {
    /// Point-in-zone test on the detection centroid
    pub fn contains(&self, cx: f64, cy: f64, frame_w: f64, frame_h: f64) -> bool {
        let [x1n, y1n, x2n, y2n] = self.rect;
        let (x1, y1) = (x1n * frame_w, y1n * frame_h);
        let (x2, y2) = (x2n * frame_w, y2n * frame_h);
        x1 <= cx && cx <= x2 && y1 <= cy && cy <= y2
    }
}

/// One detection this frame, as the upstream tracker yields it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Detection {
    pub track_id: i64,
    /// Centroid in pixels
    pub cx: f64,
    pub cy: f64,
    /// Oriented box corners in pixels
    pub corners: Vec<[f64; 2]>,
    /// Oriented box heading in radians, if the detector provides one
    #[serde(default)]
    pub angle: Option<f64>,
}

/// Dwell counters for one (zone, track) pair
#[derive(Debug, Clone, Default)]
struct TrackResidency {
    present_count: u32,
    absent_count: u32,
}

/// Per-zone occupancy after one tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZoneOccupancy {
    /// Track id of the occupant once the dwell threshold is met
    pub occupant: Option<i64>,
}

impl ZoneOccupancy {
    pub fn is_occupied(&self) -> bool {
        self.occupant.is_some()
    }
}

/// Output of one tracker tick
#[derive(Debug, Clone)]
pub struct ZoneTick {
    /// Zone id -> occupancy
    pub zones: BTreeMap<String, ZoneOccupancy>,
    /// Raw geometry passed through for the overlay stream
    pub detections: Vec<Detection>,
}

/// Tracks dwell per (zone, track) and derives debounced occupancy
pub struct ZoneTracker {
    zones: Vec<Zone>,
    occupancy_threshold: u32,
    patience_threshold: u32,
    residents: HashMap<(String, i64), TrackResidency>,
}

impl ZoneTracker {
    pub fn new(zones: Vec<Zone>) -> Self {
        Self::with_thresholds(zones, OCCUPANCY_THRESHOLD, PATIENCE_THRESHOLD)
    }

    pub fn with_thresholds(zones: Vec<Zone>, occupancy: u32, patience: u32) -> Self {
        Self {
            zones,
            occupancy_threshold: occupancy.max(1),
            patience_threshold: patience.max(1),
            residents: HashMap::new(),
        }
    }

    pub fn zones(&self) -> &[Zone] {
        &self.zones
    }

    /// Advance one frame. Presence bumps `present_count` and clears
    /// `absent_count`; absence bumps `absent_count`; a track is purged
    /// (dwell discarded) only once `absent_count` reaches patience.
    pub fn update(&mut self, detections: Vec<Detection>, frame_w: f64, frame_h: f64) -> ZoneTick {
        // Which tracks sit inside which zone this frame
        let mut inside: HashMap<&str, Vec<i64>> = HashMap::new();
        for det in &detections {
            for zone in &self.zones {
                if zone.contains(det.cx, det.cy, frame_w, frame_h) {
                    inside.entry(zone.id.as_str()).or_default().push(det.track_id);
                }
            }
        }

        for zone in &self.zones {
            let present = inside.get(zone.id.as_str()).cloned().unwrap_or_default();
            for &tid in &present {
                let entry = self
                    .residents
                    .entry((zone.id.clone(), tid))
                    .or_default();
                entry.present_count += 1;
                entry.absent_count = 0;
            }
            // Absent residents accumulate toward the patience expiry
            let patience = self.patience_threshold;
            self.residents.retain(|(zid, tid), res| {
                if zid != &zone.id || present.contains(tid) {
                    return true;
                }
                res.absent_count += 1;
                if res.absent_count >= patience {
                    tracing::debug!(zone = %zid, track_id = tid, "Track dwell expired");
                    false
                } else {
                    true
                }
            });
        }

        let mut zones = BTreeMap::new();
        for zone in &self.zones {
            zones.insert(
                zone.id.clone(),
                ZoneOccupancy {
                    occupant: self.occupant_of(&zone.id),
                },
            );
        }

        ZoneTick { zones, detections }
    }

    /// Longest-resident qualifying track, ties broken by lower id
    fn occupant_of(&self, zone_id: &str) -> Option<i64> {
        self.residents
            .iter()
            .filter(|((zid, _), res)| zid == zone_id && res.present_count >= self.occupancy_threshold)
            .max_by_key(|((_, tid), res)| (res.present_count, std::cmp::Reverse(*tid)))
            .map(|((_, tid), _)| *tid)
    }

    /// Zone currently occupied by the given track, if any
    pub fn zone_of_track(&self, track_id: i64) -> Option<&str> {
        self.zones
            .iter()
            .find(|z| self.occupant_of(&z.id) == Some(track_id))
            .map(|z| z.id.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one_zone() -> Vec<Zone> {
        vec![Zone {
            id: "b3".into(),
            rect: [0.0, 0.0, 0.5, 0.5],
            size_class: SizeClass::Midsize,
        }]
    }

    fn in_zone(track_id: i64) -> Detection {
        Detection {
            track_id,
            cx: 100.0,
            cy: 100.0,
            corners: vec![],
            angle: None,
        }
    }

    fn tick_present(t: &mut ZoneTracker, track_id: i64) -> ZoneTick {
        t.update(vec![in_zone(track_id)], 1000.0, 1000.0)
    }

    fn tick_absent(t: &mut ZoneTracker) -> ZoneTick {
        t.update(vec![], 1000.0, 1000.0)
    }

    #[test]
    fn occupied_after_threshold_frames() {
        let mut t = ZoneTracker::with_thresholds(one_zone(), 30, 30);
        for _ in 0..29 {
            let tick = tick_present(&mut t, 7);
            assert!(!tick.zones["b3"].is_occupied());
        }
        let tick = tick_present(&mut t, 7);
        assert_eq!(tick.zones["b3"].occupant, Some(7));
    }

    #[test]
    fn sub_threshold_dwell_never_registers() {
        let mut t = ZoneTracker::with_thresholds(one_zone(), 30, 30);
        for _ in 0..29 {
            tick_present(&mut t, 7);
        }
        for _ in 0..31 {
            let tick = tick_absent(&mut t);
            assert!(!tick.zones["b3"].is_occupied());
        }
        // Dwell was discarded on patience expiry; returning starts over
        let tick = tick_present(&mut t, 7);
        assert!(!tick.zones["b3"].is_occupied());
    }

    #[test]
    fn brief_dropout_does_not_reset_dwell() {
        let mut t = ZoneTracker::with_thresholds(one_zone(), 30, 30);
        for _ in 0..20 {
            tick_present(&mut t, 7);
        }
        // Occlusion shorter than the patience window
        for _ in 0..10 {
            tick_absent(&mut t);
        }
        for _ in 0..9 {
            let tick = tick_present(&mut t, 7);
            assert!(!tick.zones["b3"].is_occupied());
        }
        let tick = tick_present(&mut t, 7);
        assert_eq!(tick.zones["b3"].occupant, Some(7));
    }

    #[test]
    fn occupant_survives_brief_absence() {
        let mut t = ZoneTracker::with_thresholds(one_zone(), 5, 10);
        for _ in 0..5 {
            tick_present(&mut t, 7);
        }
        for _ in 0..9 {
            let tick = tick_absent(&mut t);
            assert_eq!(tick.zones["b3"].occupant, Some(7));
        }
        let tick = tick_absent(&mut t);
        assert!(!tick.zones["b3"].is_occupied());
    }

    #[test]
    fn longest_resident_wins() {
        let mut t = ZoneTracker::with_thresholds(one_zone(), 3, 10);
        for _ in 0..2 {
            tick_present(&mut t, 1);
        }
        // Both inside from here on; track 1 has the head start
        for _ in 0..3 {
            t.update(vec![in_zone(1), in_zone(2)], 1000.0, 1000.0);
        }
        let tick = t.update(vec![in_zone(1), in_zone(2)], 1000.0, 1000.0);
        assert_eq!(tick.zones["b3"].occupant, Some(1));
    }

    #[test]
    fn centroid_outside_zone_is_absence() {
        let mut t = ZoneTracker::with_thresholds(one_zone(), 2, 2);
        let outside = Detection {
            track_id: 7,
            cx: 900.0,
            cy: 900.0,
            corners: vec![],
            angle: None,
        };
        for _ in 0..5 {
            let tick = t.update(vec![outside.clone()], 1000.0, 1000.0);
            assert!(!tick.zones["b3"].is_occupied());
        }
    }

    #[test]
    fn zone_of_track_reports_occupied_zone() {
        let mut t = ZoneTracker::with_thresholds(one_zone(), 2, 2);
        tick_present(&mut t, 7);
        assert_eq!(t.zone_of_track(7), None);
        tick_present(&mut t, 7);
        assert_eq!(t.zone_of_track(7), Some("b3"));
    }
}
