//! EdgeAgent - Lot-side decision loop
//!
//! ## Responsibilities
//!
//! - Drive the zone tracker from per-frame detections
//! - Resolve slot requests against the local slot mirror (size-class
//!   match first, any free slot as fallback)
//! - Detect parked-off-slot and preempted reservations and rebind
//! - Produce one telemetry frame per tick plus the acknowledged
//!   reports the tick triggered
//!
//! The agent holds its own slot-status mirror; the coordinator's
//! canonical state catches up through the reports. Scoring is a
//! strategy seam so the alignment heuristic can be swapped out.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::Deserialize;

use crate::models::{SizeClass, SpaceStatus};
use crate::wire::{EdgeMessage, Point, VehicleObservation};
use crate::zone_tracker::{Detection, Zone, ZoneTracker};

/// One detection as the upstream tracker emits it, with the plate when
/// recognition has resolved one for the track
#[derive(Debug, Clone, Deserialize)]
pub struct FrameDetection {
    pub track_id: i64,
    pub cx: f64,
    pub cy: f64,
    #[serde(default)]
    pub corners: Vec<[f64; 2]>,
    #[serde(default)]
    pub angle: Option<f64>,
    #[serde(default)]
    pub plate: Option<String>,
}

/// One frame of detector output
#[derive(Debug, Clone, Deserialize)]
pub struct Frame {
    pub detections: Vec<FrameDetection>,
}

/// What one tick produced
#[derive(Debug)]
pub struct AgentTick {
    /// Latest-wins telemetry frame
    pub telemetry: EdgeMessage,
    /// Acknowledged reports triggered this tick, in order
    pub reports: Vec<EdgeMessage>,
}

/// Parking quality scoring seam
pub trait ScoreStrategy: Send + Sync {
    fn score(&self, zone: &Zone, detection: &Detection) -> i64;
}

/// Scores by how far the oriented box heading is off the slot axis:
/// perfectly square is 100, 45 degrees off is 10.
pub struct AngleScore;

impl ScoreStrategy for AngleScore {
    fn score(&self, _zone: &Zone, detection: &Detection) -> i64 {
        match detection.angle {
            Some(angle) => {
                let deg = angle.to_degrees().rem_euclid(90.0);
                let deviation = deg.min(90.0 - deg);
                (100.0 - deviation * 2.0).round().clamp(0.0, 100.0) as i64
            }
            // Detector gave no heading; neutral midpoint
            None => 50,
        }
    }
}

/// Lot-side state machine fed one frame at a time
pub struct EdgeAgent {
    tracker: ZoneTracker,
    frame_w: f64,
    frame_h: f64,
    /// Zone id -> debounced occupant track
    occupied: BTreeMap<String, i64>,
    /// Plate -> zone id the plate is bound to
    assigned: HashMap<String, String>,
    /// Size class learned from the slot request, for reassignment
    sizes: HashMap<String, SizeClass>,
    /// Track -> resolved plate
    plates: HashMap<i64, String>,
    /// Plates already scored this visit
    scored: HashSet<String>,
    scorer: Box<dyn ScoreStrategy>,
}

impl EdgeAgent {
    pub fn new(zones: Vec<Zone>, frame_w: f64, frame_h: f64) -> Self {
        Self::with_options(ZoneTracker::new(zones), frame_w, frame_h, Box::new(AngleScore))
    }

    pub fn with_options(
        tracker: ZoneTracker,
        frame_w: f64,
        frame_h: f64,
        scorer: Box<dyn ScoreStrategy>,
    ) -> Self {
        Self {
            tracker,
            frame_w,
            frame_h,
            occupied: BTreeMap::new(),
            assigned: HashMap::new(),
            sizes: HashMap::new(),
            plates: HashMap::new(),
            scored: HashSet::new(),
            scorer,
        }
    }

    /// Current slot-status mirror, keyed by zone id
    pub fn statuses(&self) -> BTreeMap<String, SpaceStatus> {
        self.tracker
            .zones()
            .iter()
            .map(|zone| {
                let status = if self.occupied.contains_key(&zone.id) {
                    SpaceStatus::Occupied
                } else if self.assigned.values().any(|z| z == &zone.id) {
                    SpaceStatus::Reserved
                } else {
                    SpaceStatus::Free
                };
                (zone.id.clone(), status)
            })
            .collect()
    }

    /// Resolve a slot for a requested plate. Exact size-class match
    /// first, then any free slot the vehicle fits, then any free slot.
    /// Reserves locally and returns the report to send; `None` when the
    /// lot is full.
    pub fn handle_request(&mut self, plate: &str, size: SizeClass) -> Option<EdgeMessage> {
        self.sizes.insert(plate.to_string(), size);
        // A fresh request starts a new visit; the plate scores again
        self.scored.remove(plate);
        let statuses = self.statuses();
        let free = |zone: &&Zone| statuses.get(&zone.id) == Some(&SpaceStatus::Free);

        let pick = self
            .tracker
            .zones()
            .iter()
            .filter(free)
            .find(|z| z.size_class == size)
            .or_else(|| {
                self.tracker
                    .zones()
                    .iter()
                    .filter(free)
                    .find(|z| size.fits(z.size_class))
            })
            .or_else(|| self.tracker.zones().iter().find(free))
            .map(|z| z.id.clone());

        match pick {
            Some(zone_id) => {
                tracing::info!(plate = %plate, zone = %zone_id, "Slot resolved");
                self.assigned.insert(plate.to_string(), zone_id.clone());
                Some(EdgeMessage::Assignment {
                    license_plate: plate.to_string(),
                    assignment: zone_id,
                })
            }
            None => {
                tracing::warn!(plate = %plate, "No free slot for request");
                None
            }
        }
    }

    /// Drop a local reservation (assignment ack came back as an error)
    pub fn release_assignment(&mut self, plate: &str) {
        if let Some(zone) = self.assigned.remove(plate) {
            tracing::info!(plate = %plate, zone = %zone, "Reservation released");
        }
    }

    /// Advance one frame
    pub fn process_frame(&mut self, frame: Frame) -> AgentTick {
        for det in &frame.detections {
            if let Some(plate) = &det.plate {
                self.plates.insert(det.track_id, plate.clone());
            }
        }

        let detections: Vec<Detection> = frame
            .detections
            .iter()
            .map(|d| Detection {
                track_id: d.track_id,
                cx: d.cx,
                cy: d.cy,
                corners: d.corners.clone(),
                angle: d.angle,
            })
            .collect();
        let tick = self
            .tracker
            .update(detections.clone(), self.frame_w, self.frame_h);

        let now_occupied: BTreeMap<String, i64> = tick
            .zones
            .iter()
            .filter_map(|(id, occ)| occ.occupant.map(|t| (id.clone(), t)))
            .collect();

        // A departing occupant may be scored again on its next visit
        for (zone_id, track) in &self.occupied {
            if now_occupied.get(zone_id) != Some(track) {
                if let Some(plate) = self.plates.get(track) {
                    self.scored.remove(plate);
                }
            }
        }

        // Commit the new occupancy first so transition handling (and any
        // reassignment it triggers) sees the current mirror
        let transitions: Vec<(String, i64)> = now_occupied
            .iter()
            .filter(|(zone_id, track)| self.occupied.get(*zone_id) != Some(*track))
            .map(|(zone_id, track)| (zone_id.clone(), *track))
            .collect();
        self.occupied = now_occupied;

        let mut reports = Vec::new();
        for (zone_id, track) in &transitions {
            self.on_zone_occupied(zone_id, *track, &detections, &mut reports);
        }

        let telemetry = EdgeMessage::CarPosition {
            slot: self.statuses(),
            vehicles: self.observations(&detections),
        };
        AgentTick { telemetry, reports }
    }

    /// A track just settled in a zone. Bind, rebind or preempt.
    fn on_zone_occupied(
        &mut self,
        zone_id: &str,
        track: i64,
        detections: &[Detection],
        reports: &mut Vec<EdgeMessage>,
    ) {
        match self.plates.get(&track).cloned() {
            Some(plate) => {
                match self.assigned.get(&plate).map(String::as_str) {
                    Some(assigned) if assigned == zone_id => {}
                    Some(assigned) => {
                        // Parked off its slot; the confirmation follows the car
                        tracing::warn!(
                            plate = %plate,
                            assigned = %assigned,
                            actual = %zone_id,
                            "Vehicle parked off its assigned slot"
                        );
                        self.assigned.insert(plate.clone(), zone_id.to_string());
                        reports.push(EdgeMessage::Assignment {
                            license_plate: plate.clone(),
                            assignment: zone_id.to_string(),
                        });
                    }
                    None => {
                        // Self-parked without a request; bind where it is
                        tracing::info!(plate = %plate, zone = %zone_id, "Unrequested park, binding slot");
                        self.assigned.insert(plate.clone(), zone_id.to_string());
                        reports.push(EdgeMessage::Assignment {
                            license_plate: plate.clone(),
                            assignment: zone_id.to_string(),
                        });
                    }
                }
                self.emit_score(&plate, zone_id, track, detections, reports);
            }
            None => {
                // Unidentified occupant on a reserved slot: the displaced
                // plate gets a fresh resolution
                let displaced = self
                    .assigned
                    .iter()
                    .find(|(_, z)| z.as_str() == zone_id)
                    .map(|(p, _)| p.clone());
                if let Some(plate) = displaced {
                    tracing::warn!(zone = %zone_id, plate = %plate, "Reserved slot preempted");
                    self.assigned.remove(&plate);
                    let size = self.sizes.get(&plate).copied().unwrap_or_default();
                    if let Some(report) = self.handle_request(&plate, size) {
                        reports.push(report);
                    }
                }
            }
        }
    }

    fn emit_score(
        &mut self,
        plate: &str,
        zone_id: &str,
        track: i64,
        detections: &[Detection],
        reports: &mut Vec<EdgeMessage>,
    ) {
        if self.scored.contains(plate) {
            return;
        }
        let Some(zone) = self.tracker.zones().iter().find(|z| z.id == zone_id) else {
            return;
        };
        let Some(detection) = detections.iter().find(|d| d.track_id == track) else {
            return;
        };
        let score = self.scorer.score(zone, detection);
        tracing::info!(plate = %plate, zone = %zone_id, score, "Parking scored");
        reports.push(EdgeMessage::Score {
            license_plate: plate.to_string(),
            score,
        });
        self.scored.insert(plate.to_string());
        // The visit is complete; drop the binding so the slot follows
        // occupancy from here and the mirror never leaks reservations
        self.assigned.remove(plate);
        self.sizes.remove(plate);
    }

    fn observations(&self, detections: &[Detection]) -> Vec<VehicleObservation> {
        detections
            .iter()
            .map(|d| {
                let plate = self
                    .plates
                    .get(&d.track_id)
                    .cloned()
                    .unwrap_or_else(|| format!("ID:{}", d.track_id));
                let parked_in = self
                    .occupied
                    .iter()
                    .find(|(_, &t)| t == d.track_id)
                    .map(|(z, _)| z.clone());
                let suggested = parked_in
                    .clone()
                    .or_else(|| self.assigned.get(&plate).cloned())
                    .unwrap_or_default();
                VehicleObservation {
                    plate,
                    center: Point { x: d.cx, y: d.cy },
                    corners: d.corners.clone(),
                    state: (if parked_in.is_some() { "parked" } else { "running" }).to_string(),
                    suggested,
                }
            })
            .collect()
    }
}
