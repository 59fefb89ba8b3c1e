//! Wire messages exchanged between the edge agent and the coordinator
//!
//! ## Responsibilities
//!
//! - One tagged union per message kind (`message_type` discriminant)
//! - One typed decoder; unknown kinds are a protocol error, never
//!   silent misbehavior
//!
//! Telemetry (`car_position`) is fire-and-forget; `assignment` and
//! `score` are acknowledged (`assignment_ack` / `score_ack`, correlated
//! by plate + kind).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::models::{SizeClass, SpaceStatus};

/// 2D point in overlay coordinates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

/// One vehicle as seen by the detector, for frontend overlay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleObservation {
    /// License plate if resolved, otherwise a track placeholder like "ID:7"
    pub plate: String,
    pub center: Point,
    /// Four corner points of the oriented box
    pub corners: Vec<[f64; 2]>,
    /// "parked" | "running"
    pub state: String,
    /// Zone label the vehicle currently occupies, empty if none
    pub suggested: String,
}

/// Ack delivery status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    Success,
    Error,
}

/// Which acknowledged report kind an ack correlates to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AckKind {
    Assignment,
    Score,
}

/// Messages on the edge <-> coordinator socket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "message_type", rename_all = "snake_case")]
pub enum EdgeMessage {
    /// Edge -> coordinator, per tick, at-most-once
    CarPosition {
        /// Zone label -> status, e.g. {"B3": "reserved"}
        slot: BTreeMap<String, SpaceStatus>,
        vehicles: Vec<VehicleObservation>,
    },
    /// Edge -> coordinator, confirmed slot for a plate, requires ack
    Assignment {
        license_plate: String,
        /// Slot label, e.g. "B3"
        assignment: String,
    },
    /// Edge -> coordinator, parking score report, requires ack
    Score { license_plate: String, score: i64 },
    /// Coordinator -> edge, ask for a slot resolution
    RequestAssignment {
        license_plate: String,
        size_class: SizeClass,
    },
    AssignmentAck {
        license_plate: String,
        status: AckStatus,
        detail: String,
    },
    ScoreAck {
        license_plate: String,
        status: AckStatus,
        detail: String,
    },
}

impl EdgeMessage {
    /// Decode one frame. Unknown `message_type` or malformed fields
    /// yield `Error::Protocol`; the caller logs and skips the frame.
    pub fn decode(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| Error::Protocol(e.to_string()))
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Correlation key for acknowledged reports and their acks
    pub fn ack_key(&self) -> Option<(String, AckKind)> {
        match self {
            Self::Assignment { license_plate, .. } => {
                Some((license_plate.clone(), AckKind::Assignment))
            }
            Self::Score { license_plate, .. } => Some((license_plate.clone(), AckKind::Score)),
            Self::AssignmentAck { license_plate, .. } => {
                Some((license_plate.clone(), AckKind::Assignment))
            }
            Self::ScoreAck { license_plate, .. } => Some((license_plate.clone(), AckKind::Score)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_car_position() {
        let text = r#"{
            "message_type": "car_position",
            "slot": {"B3": "reserved", "C1": "free"},
            "vehicles": [{
                "plate": "12가3456",
                "center": {"x": 120.5, "y": 44.0},
                "corners": [[0,0],[10,0],[10,4],[0,4]],
                "state": "running",
                "suggested": ""
            }]
        }"#;
        let msg = EdgeMessage::decode(text).unwrap();
        match msg {
            EdgeMessage::CarPosition { slot, vehicles } => {
                assert_eq!(slot.get("B3"), Some(&SpaceStatus::Reserved));
                assert_eq!(slot.get("C1"), Some(&SpaceStatus::Free));
                assert_eq!(vehicles.len(), 1);
                assert_eq!(vehicles[0].plate, "12가3456");
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn unknown_kind_is_protocol_error() {
        let err = EdgeMessage::decode(r#"{"message_type": "car_postion"}"#).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn malformed_json_is_protocol_error() {
        let err = EdgeMessage::decode("{not json").unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn request_assignment_round_trip() {
        let msg = EdgeMessage::RequestAssignment {
            license_plate: "12가3456".into(),
            size_class: SizeClass::Midsize,
        };
        let text = msg.encode().unwrap();
        assert!(text.contains(r#""message_type":"request_assignment""#));
        assert!(text.contains(r#""size_class":"midsize""#));
        assert_eq!(EdgeMessage::decode(&text).unwrap(), msg);
    }

    #[test]
    fn ack_correlates_by_plate_and_kind() {
        let report = EdgeMessage::Assignment {
            license_plate: "12가3456".into(),
            assignment: "B3".into(),
        };
        let ack = EdgeMessage::AssignmentAck {
            license_plate: "12가3456".into(),
            status: AckStatus::Success,
            detail: "ok".into(),
        };
        assert_eq!(report.ack_key(), ack.ack_key());

        let score_ack = EdgeMessage::ScoreAck {
            license_plate: "12가3456".into(),
            status: AckStatus::Success,
            detail: "ok".into(),
        };
        assert_ne!(report.ack_key(), score_ack.ack_key());
    }

    #[test]
    fn telemetry_has_no_ack_key() {
        let msg = EdgeMessage::CarPosition {
            slot: BTreeMap::new(),
            vehicles: vec![],
        };
        assert!(msg.ack_key().is_none());
    }
}
