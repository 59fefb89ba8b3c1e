//! EventHub - Snapshot + delta distribution
//!
//! ## Responsibilities
//!
//! - WebSocket subscriber group management
//! - Materialized lot view (spaces, active visits, latest overlay)
//! - Per-group sequence numbers; delivery order equals commit order
//! - New subscribers get one full snapshot, then deltas
//!
//! The coordinator publishes only the rows a commit affected; the hub
//! applies them to the view and fans the delta out under the same lock,
//! so a subscriber that connects at any time converges to the same
//! state as one connected from the start. A subscriber whose buffer is
//! full is disconnected rather than delaying the rest.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::models::{SizeClass, SpaceStatus, VisitStatus};
use crate::wire::VehicleObservation;

/// Outbound buffer per subscriber; a full buffer disconnects the client
const SUBSCRIBER_BUFFER: usize = 64;

/// Subscriber groups
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Group {
    /// Space-status map keyed by slot label
    SpaceStatus,
    /// In-progress visits with resolved assigned space
    ActiveVehicles,
    /// Raw vehicle geometry passed through from edge telemetry
    VehicleOverlay,
    /// Visit lifecycle log entries
    ParkingLog,
    /// Coordinator -> edge control messages
    EdgeControl,
}

impl Group {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "space_status" => Some(Self::SpaceStatus),
            "active_vehicles" => Some(Self::ActiveVehicles),
            "vehicle_overlay" => Some(Self::VehicleOverlay),
            "parking_log" => Some(Self::ParkingLog),
            _ => None,
        }
    }
}

/// One space row as subscribers see it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpaceInfo {
    pub status: SpaceStatus,
    pub size: SizeClass,
    pub vehicle_id: Option<i64>,
    pub license_plate: Option<String>,
}

/// Assigned space summary carried by active-vehicle entries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignedSpace {
    pub zone: String,
    pub slot_number: u32,
    pub label: String,
    pub status: SpaceStatus,
}

/// One in-progress visit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveVehicle {
    /// VehicleEvent id
    pub id: i64,
    pub vehicle_id: i64,
    pub license_plate: String,
    pub entrance_time: DateTime<Utc>,
    pub status: VisitStatus,
    pub assigned_space: Option<AssignedSpace>,
}

/// One visit lifecycle log entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisitLogEntry {
    pub id: i64,
    pub license_plate: String,
    pub status: VisitStatus,
    pub entrance_time: DateTime<Utc>,
    pub parking_time: Option<DateTime<Utc>>,
    pub exit_time: Option<DateTime<Utc>>,
}

/// Events the coordinator publishes after commit
#[derive(Debug, Clone)]
pub enum HubEvent {
    /// Affected space rows only, keyed by slot label
    SpacesChanged(BTreeMap<String, SpaceInfo>),
    /// Upserted / removed visits (removed = now exited, by event id)
    ActiveVehiclesChanged {
        upsert: Vec<ActiveVehicle>,
        remove: Vec<i64>,
    },
    /// Raw overlay frame from edge telemetry
    Overlay(Vec<VehicleObservation>),
    /// Visit lifecycle log entry
    VisitLogged(VisitLogEntry),
    /// Ask the edge side to resolve a slot for a plate
    RequestAssignment {
        license_plate: String,
        size_class: SizeClass,
    },
}

impl HubEvent {
    fn group(&self) -> Group {
        match self {
            Self::SpacesChanged(_) => Group::SpaceStatus,
            Self::ActiveVehiclesChanged { .. } => Group::ActiveVehicles,
            Self::Overlay(_) => Group::VehicleOverlay,
            Self::VisitLogged(_) => Group::ParkingLog,
            Self::RequestAssignment { .. } => Group::EdgeControl,
        }
    }
}

/// Materialized lot state kept in step with published deltas
#[derive(Debug, Default, Clone)]
struct LotView {
    spaces: BTreeMap<String, SpaceInfo>,
    active: BTreeMap<i64, ActiveVehicle>,
    overlay: Vec<VehicleObservation>,
}

struct Subscriber {
    id: Uuid,
    groups: HashSet<Group>,
    tx: mpsc::Sender<String>,
}

#[derive(Default)]
struct Inner {
    view: LotView,
    subscribers: HashMap<Uuid, Subscriber>,
    seq: HashMap<Group, u64>,
}

/// EventHub instance
#[derive(Default)]
pub struct EventHub {
    inner: RwLock<Inner>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the materialized view from canonical state at startup
    pub async fn seed(&self, spaces: BTreeMap<String, SpaceInfo>, active: Vec<ActiveVehicle>) {
        let mut inner = self.inner.write().await;
        inner.view.spaces = spaces;
        inner.view.active = active.into_iter().map(|v| (v.id, v)).collect();
    }

    /// Register a subscriber. The snapshot for each requested group is
    /// queued ahead of any delta published after this call returns, so
    /// replaying deltas on top of it converges.
    pub async fn subscribe(&self, groups: HashSet<Group>) -> (Uuid, mpsc::Receiver<String>) {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);

        let mut inner = self.inner.write().await;
        for group in &groups {
            if let Some(snapshot) = Self::snapshot_message(&inner, *group) {
                // Fresh channel with capacity for one snapshot per group
                let _ = tx.try_send(snapshot);
            }
        }
        inner.subscribers.insert(id, Subscriber { id, groups, tx });
        tracing::info!(connection_id = %id, "Subscriber connected");
        (id, rx)
    }

    /// Remove a subscriber from every group
    pub async fn unsubscribe(&self, id: &Uuid) {
        let mut inner = self.inner.write().await;
        if inner.subscribers.remove(id).is_some() {
            tracing::info!(connection_id = %id, "Subscriber disconnected");
        }
    }

    pub async fn subscriber_count(&self) -> u64 {
        self.inner.read().await.subscribers.len() as u64
    }

    /// Whether any edge session is attached
    pub async fn edge_connected(&self) -> bool {
        self.inner
            .read()
            .await
            .subscribers
            .values()
            .any(|s| s.groups.contains(&Group::EdgeControl))
    }

    /// Current space-status view (REST snapshot endpoint)
    pub async fn space_snapshot(&self) -> BTreeMap<String, SpaceInfo> {
        self.inner.read().await.view.spaces.clone()
    }

    /// Current active-visit view (REST snapshot endpoint)
    pub async fn active_snapshot(&self) -> Vec<ActiveVehicle> {
        self.inner.read().await.view.active.values().cloned().collect()
    }

    /// Apply one committed change to the view and fan the delta out.
    /// View update and fan-out happen under one lock, so per-group
    /// delivery order equals publish order.
    pub async fn publish(&self, event: HubEvent) {
        let group = event.group();
        let mut inner = self.inner.write().await;

        let seq = {
            let counter = inner.seq.entry(group).or_insert(0);
            *counter += 1;
            *counter
        };

        let message = match &event {
            HubEvent::SpacesChanged(rows) => {
                for (label, info) in rows {
                    inner.view.spaces.insert(label.clone(), info.clone());
                }
                serde_json::json!({
                    "message_type": "parking_space",
                    "seq": seq,
                    "spaces": rows,
                })
            }
            HubEvent::ActiveVehiclesChanged { upsert, remove } => {
                for v in upsert {
                    inner.view.active.insert(v.id, v.clone());
                }
                for id in remove {
                    inner.view.active.remove(id);
                }
                serde_json::json!({
                    "message_type": "active_vehicles",
                    "seq": seq,
                    "upsert": upsert,
                    "remove": remove,
                })
            }
            HubEvent::Overlay(vehicles) => {
                inner.view.overlay = vehicles.clone();
                serde_json::json!({
                    "message_type": "vehicle_overlay",
                    "seq": seq,
                    "vehicles": vehicles,
                })
            }
            HubEvent::VisitLogged(entry) => serde_json::json!({
                "message_type": "parking_log",
                "seq": seq,
                "event": entry,
            }),
            HubEvent::RequestAssignment {
                license_plate,
                size_class,
            } => serde_json::json!({
                "message_type": "request_assignment",
                "license_plate": license_plate,
                "size_class": size_class,
            }),
        };

        let text = message.to_string();
        tracing::debug!(group = ?group, seq = seq, "Broadcasting delta");

        let mut dropped: Vec<Uuid> = Vec::new();
        for sub in inner.subscribers.values() {
            if !sub.groups.contains(&group) {
                continue;
            }
            if let Err(e) = sub.tx.try_send(text.clone()) {
                tracing::warn!(
                    connection_id = %sub.id,
                    error = %e,
                    "Subscriber lagging, disconnecting"
                );
                dropped.push(sub.id);
            }
        }
        for id in dropped {
            inner.subscribers.remove(&id);
        }
    }

    /// Full snapshot message for one group, from the materialized view
    fn snapshot_message(inner: &Inner, group: Group) -> Option<String> {
        let seq = inner.seq.get(&group).copied().unwrap_or(0);
        let message = match group {
            Group::SpaceStatus => serde_json::json!({
                "message_type": "parking_space",
                "seq": seq,
                "snapshot": true,
                "spaces": inner.view.spaces,
            }),
            Group::ActiveVehicles => serde_json::json!({
                "message_type": "active_vehicles",
                "seq": seq,
                "snapshot": true,
                "upsert": inner.view.active.values().collect::<Vec<_>>(),
                "remove": Vec::<i64>::new(),
            }),
            Group::VehicleOverlay => serde_json::json!({
                "message_type": "vehicle_overlay",
                "seq": seq,
                "snapshot": true,
                "vehicles": inner.view.overlay,
            }),
            // Logs and edge control are streams, not state
            Group::ParkingLog | Group::EdgeControl => return None,
        };
        Some(message.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn space(status: SpaceStatus, plate: Option<&str>) -> SpaceInfo {
        SpaceInfo {
            status,
            size: SizeClass::Midsize,
            vehicle_id: plate.map(|_| 1),
            license_plate: plate.map(String::from),
        }
    }

    fn spaces_event(label: &str, status: SpaceStatus, plate: Option<&str>) -> HubEvent {
        let mut rows = BTreeMap::new();
        rows.insert(label.to_string(), space(status, plate));
        HubEvent::SpacesChanged(rows)
    }

    /// Apply parking_space messages to a local mirror the way a client would
    fn replay(messages: &[String]) -> BTreeMap<String, SpaceInfo> {
        let mut state = BTreeMap::new();
        for text in messages {
            let v: serde_json::Value = serde_json::from_str(text).unwrap();
            if v["message_type"] != "parking_space" {
                continue;
            }
            let rows: BTreeMap<String, SpaceInfo> =
                serde_json::from_value(v["spaces"].clone()).unwrap();
            if v["snapshot"].as_bool().unwrap_or(false) {
                state = rows;
            } else {
                state.extend(rows);
            }
        }
        state
    }

    async fn drain(rx: &mut mpsc::Receiver<String>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    #[tokio::test]
    async fn delivery_order_equals_publish_order() {
        let hub = EventHub::new();
        let (_, mut rx) = hub.subscribe([Group::SpaceStatus].into()).await;

        hub.publish(spaces_event("B3", SpaceStatus::Reserved, Some("12가3456")))
            .await;
        hub.publish(spaces_event("B3", SpaceStatus::Occupied, Some("12가3456")))
            .await;
        hub.publish(spaces_event("B3", SpaceStatus::Free, None)).await;

        let msgs = drain(&mut rx).await;
        // Snapshot first, then the three deltas in publish order
        assert_eq!(msgs.len(), 4);
        let statuses: Vec<String> = msgs[1..]
            .iter()
            .map(|m| {
                let v: serde_json::Value = serde_json::from_str(m).unwrap();
                v["spaces"]["B3"]["status"].as_str().unwrap().to_string()
            })
            .collect();
        assert_eq!(statuses, ["reserved", "occupied", "free"]);
    }

    #[tokio::test]
    async fn late_subscriber_converges() {
        let hub = EventHub::new();
        let (_, mut early_rx) = hub.subscribe([Group::SpaceStatus].into()).await;

        hub.publish(spaces_event("B3", SpaceStatus::Reserved, Some("12가3456")))
            .await;
        hub.publish(spaces_event("C1", SpaceStatus::Occupied, Some("98너7654")))
            .await;

        let (_, mut late_rx) = hub.subscribe([Group::SpaceStatus].into()).await;

        hub.publish(spaces_event("B3", SpaceStatus::Free, None)).await;

        let early = replay(&drain(&mut early_rx).await);
        let late = replay(&drain(&mut late_rx).await);
        assert_eq!(early, late);
        assert_eq!(late["B3"].status, SpaceStatus::Free);
        assert_eq!(late["C1"].status, SpaceStatus::Occupied);
    }

    #[tokio::test]
    async fn slow_subscriber_is_dropped_not_blocking() {
        let hub = EventHub::new();
        let (slow_id, _slow_rx) = hub.subscribe([Group::SpaceStatus].into()).await;
        let (_, mut ok_rx) = hub.subscribe([Group::SpaceStatus].into()).await;

        // Overflow the slow subscriber's buffer; the healthy one drains
        let mut received = Vec::new();
        for i in 0..(SUBSCRIBER_BUFFER + 8) {
            let status = if i % 2 == 0 {
                SpaceStatus::Reserved
            } else {
                SpaceStatus::Free
            };
            hub.publish(spaces_event("B3", status, None)).await;
            received.extend(drain(&mut ok_rx).await);
        }

        assert_eq!(hub.subscriber_count().await, 1);
        assert!(hub.inner.read().await.subscribers.get(&slow_id).is_none());
        // snapshot + every delta, none lost for the healthy subscriber
        assert_eq!(received.len(), SUBSCRIBER_BUFFER + 8 + 1);
    }

    #[tokio::test]
    async fn unsubscribe_removes_from_all_groups() {
        let hub = EventHub::new();
        let (id, _rx) = hub
            .subscribe([Group::SpaceStatus, Group::ActiveVehicles].into())
            .await;
        assert_eq!(hub.subscriber_count().await, 1);
        hub.unsubscribe(&id).await;
        assert_eq!(hub.subscriber_count().await, 0);
    }

    #[tokio::test]
    async fn active_vehicle_removal_applies_to_view() {
        let hub = EventHub::new();
        let visit = ActiveVehicle {
            id: 5,
            vehicle_id: 1,
            license_plate: "12가3456".into(),
            entrance_time: Utc::now(),
            status: VisitStatus::Entrance,
            assigned_space: None,
        };
        hub.publish(HubEvent::ActiveVehiclesChanged {
            upsert: vec![visit],
            remove: vec![],
        })
        .await;
        assert_eq!(hub.active_snapshot().await.len(), 1);

        hub.publish(HubEvent::ActiveVehiclesChanged {
            upsert: vec![],
            remove: vec![5],
        })
        .await;
        assert!(hub.active_snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn request_assignment_reaches_edge_group_only() {
        let hub = EventHub::new();
        let (_, mut edge_rx) = hub.subscribe([Group::EdgeControl].into()).await;
        let (_, mut status_rx) = hub.subscribe([Group::SpaceStatus].into()).await;

        hub.publish(HubEvent::RequestAssignment {
            license_plate: "12가3456".into(),
            size_class: SizeClass::Midsize,
        })
        .await;

        let edge_msgs = drain(&mut edge_rx).await;
        assert_eq!(edge_msgs.len(), 1);
        assert!(edge_msgs[0].contains("request_assignment"));
        // Status subscriber got its snapshot only
        assert_eq!(drain(&mut status_rx).await.len(), 1);
    }
}
