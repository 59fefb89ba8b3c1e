//! Visit lifecycle, from detector frames to subscriber messages.
//!
//! Wires the edge agent and the event hub together without a server in
//! between: agent ticks produce the reports the coordinator would
//! consume, and hub publishes mirror the deltas the coordinator emits
//! after commit.

use std::collections::BTreeMap;

use lotserver::edge_agent::{EdgeAgent, Frame, FrameDetection};
use lotserver::event_hub::{EventHub, Group, HubEvent, SpaceInfo};
use lotserver::models::{SizeClass, SpaceStatus};
use lotserver::wire::EdgeMessage;
use lotserver::zone_tracker::{Zone, ZoneTracker};

fn lot() -> EdgeAgent {
    let zones = vec![
        Zone {
            id: "B3".into(),
            rect: [0.0, 0.0, 0.2, 0.5],
            size_class: SizeClass::Midsize,
        },
        Zone {
            id: "C1".into(),
            rect: [0.3, 0.0, 0.5, 0.5],
            size_class: SizeClass::Midsize,
        },
    ];
    EdgeAgent::with_options(
        ZoneTracker::with_thresholds(zones, 1, 2),
        1000.0,
        1000.0,
        Box::new(lotserver::edge_agent::AngleScore),
    )
}

fn det(track_id: i64, cx: f64, plate: &str) -> FrameDetection {
    FrameDetection {
        track_id,
        cx,
        cy: 100.0,
        corners: vec![[0.0, 0.0], [10.0, 0.0], [10.0, 4.0], [0.0, 4.0]],
        angle: Some(0.0),
        plate: Some(plate.to_string()),
    }
}

fn space_event(label: &str, status: SpaceStatus) -> HubEvent {
    let mut rows = BTreeMap::new();
    rows.insert(
        label.to_string(),
        SpaceInfo {
            status,
            size: SizeClass::Midsize,
            vehicle_id: None,
            license_plate: None,
        },
    );
    HubEvent::SpacesChanged(rows)
}

fn space_statuses(messages: &[String]) -> Vec<(String, String)> {
    messages
        .iter()
        .filter_map(|text| {
            let v: serde_json::Value = serde_json::from_str(text).ok()?;
            if v["message_type"] != "parking_space" || v["snapshot"].as_bool().unwrap_or(false) {
                return None;
            }
            let (label, info) = v["spaces"].as_object()?.iter().next()?;
            Some((label.clone(), info["status"].as_str()?.to_string()))
        })
        .collect()
}

#[test]
fn agent_flow_from_request_to_score() {
    let mut agent = lot();

    // Coordinator asks for a slot after the entrance
    let report = agent.handle_request("12가3456", SizeClass::Midsize).unwrap();
    assert_eq!(
        report,
        EdgeMessage::Assignment {
            license_plate: "12가3456".into(),
            assignment: "B3".into(),
        }
    );

    // The car settles in its slot; one score, no re-assignment
    let tick = agent.process_frame(Frame {
        detections: vec![det(7, 100.0, "12가3456")],
    });
    assert_eq!(
        tick.reports,
        vec![EdgeMessage::Score {
            license_plate: "12가3456".into(),
            score: 100,
        }]
    );

    // Telemetry mirrors the occupied slot
    match tick.telemetry {
        EdgeMessage::CarPosition { slot, vehicles } => {
            assert_eq!(slot["B3"], SpaceStatus::Occupied);
            assert_eq!(slot["C1"], SpaceStatus::Free);
            assert_eq!(vehicles[0].plate, "12가3456");
            assert_eq!(vehicles[0].state, "parked");
            assert_eq!(vehicles[0].suggested, "B3");
        }
        other => panic!("unexpected telemetry: {other:?}"),
    }
}

#[tokio::test]
async fn subscriber_sees_visit_transitions_in_commit_order() {
    let hub = EventHub::new();
    let (_, mut rx) = hub.subscribe([Group::SpaceStatus].into()).await;

    // Entrance -> confirm -> parked -> exit, as the coordinator
    // publishes after each commit
    hub.publish(space_event("B3", SpaceStatus::Reserved)).await;
    hub.publish(space_event("B3", SpaceStatus::Occupied)).await;
    hub.publish(space_event("B3", SpaceStatus::Free)).await;

    let mut messages = Vec::new();
    while let Ok(msg) = rx.try_recv() {
        messages.push(msg);
    }
    assert_eq!(
        space_statuses(&messages),
        vec![
            ("B3".to_string(), "reserved".to_string()),
            ("B3".to_string(), "occupied".to_string()),
            ("B3".to_string(), "free".to_string()),
        ]
    );
}

#[tokio::test]
async fn reassignment_frees_old_slot_before_reserving_new() {
    let hub = EventHub::new();
    hub.publish(space_event("B3", SpaceStatus::Reserved)).await;

    let (_, mut rx) = hub.subscribe([Group::SpaceStatus].into()).await;

    // A move commit publishes the freed slot first, then the new one
    hub.publish(space_event("B3", SpaceStatus::Free)).await;
    hub.publish(space_event("C1", SpaceStatus::Reserved)).await;

    let mut messages = Vec::new();
    while let Ok(msg) = rx.try_recv() {
        messages.push(msg);
    }
    assert_eq!(
        space_statuses(&messages),
        vec![
            ("B3".to_string(), "free".to_string()),
            ("C1".to_string(), "reserved".to_string()),
        ]
    );
}

#[tokio::test]
async fn edge_telemetry_reaches_overlay_subscribers() {
    let mut agent = lot();
    let hub = EventHub::new();
    let (_, mut rx) = hub.subscribe([Group::VehicleOverlay].into()).await;

    let tick = agent.process_frame(Frame {
        detections: vec![det(7, 700.0, "12가3456")],
    });

    // The server republishes telemetry vehicles as the overlay stream
    let encoded = match tick.telemetry {
        EdgeMessage::CarPosition { vehicles, .. } => vehicles,
        other => panic!("unexpected telemetry: {other:?}"),
    };
    hub.publish(HubEvent::Overlay(encoded)).await;

    let mut messages = Vec::new();
    while let Ok(msg) = rx.try_recv() {
        messages.push(msg);
    }
    // Snapshot plus one overlay frame
    assert_eq!(messages.len(), 2);
    let v: serde_json::Value = serde_json::from_str(&messages[1]).unwrap();
    assert_eq!(v["message_type"], "vehicle_overlay");
    assert_eq!(v["vehicles"][0]["plate"], "12가3456");
    assert_eq!(v["vehicles"][0]["state"], "running");
}
