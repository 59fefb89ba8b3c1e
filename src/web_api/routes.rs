//! API Routes

use std::collections::HashSet;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::event_hub::{EventHub, Group, HubEvent};
use crate::models::ApiResponse;
use crate::state::AppState;
use crate::wire::{AckStatus, EdgeMessage};

/// Create API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health
        .route("/healthz", get(super::health_check))
        // Snapshots
        .route("/api/spaces", get(list_spaces))
        .route("/api/vehicles/active", get(list_active_vehicles))
        .route("/api/scores/:plate", get(get_score_history))
        // Visit lifecycle (gate integrations)
        .route("/api/events/entrance", post(register_entrance))
        .route("/api/events/parking-complete", post(parking_complete))
        .route("/api/events/exit", post(register_exit))
        // WebSocket
        .route("/ws/status", get(status_ws_handler))
        .route("/ws/edge", get(edge_ws_handler))
        .with_state(state)
}

/// Publish committed events in order
async fn publish_all(hub: &EventHub, events: Vec<HubEvent>) {
    for event in events {
        hub.publish(event).await;
    }
}

// ========================================
// Snapshot endpoints
// ========================================

async fn list_spaces(State(state): State<AppState>) -> impl IntoResponse {
    Json(ApiResponse::success(state.hub.space_snapshot().await))
}

async fn list_active_vehicles(State(state): State<AppState>) -> impl IntoResponse {
    Json(ApiResponse::success(state.hub.active_snapshot().await))
}

#[derive(Debug, Deserialize)]
struct ScoreQuery {
    limit: Option<u32>,
}

async fn get_score_history(
    State(state): State<AppState>,
    Path(plate): Path<String>,
    Query(query): Query<ScoreQuery>,
) -> Result<impl IntoResponse> {
    let limit = query.limit.unwrap_or(20).min(200);
    let scores = state.coordinator.score_history(&plate, limit).await?;
    Ok(Json(ApiResponse::success(scores)))
}

// ========================================
// Visit lifecycle
// ========================================

#[derive(Debug, Deserialize)]
struct PlateRequest {
    license_plate: String,
}

async fn register_entrance(
    State(state): State<AppState>,
    Json(req): Json<PlateRequest>,
) -> Result<impl IntoResponse> {
    let plate = validate_plate(&req.license_plate)?;
    let (event, events) = state.coordinator.register_entrance(plate).await?;
    publish_all(&state.hub, events).await;
    Ok(Json(ApiResponse::success(json!({
        "event_id": event.id,
        "status": event.status,
    }))))
}

async fn parking_complete(
    State(state): State<AppState>,
    Json(req): Json<PlateRequest>,
) -> Result<impl IntoResponse> {
    let plate = validate_plate(&req.license_plate)?;
    let (event, events) = state.coordinator.mark_parking_complete(plate).await?;
    publish_all(&state.hub, events).await;
    Ok(Json(ApiResponse::success(json!({
        "event_id": event.id,
        "status": event.status,
    }))))
}

async fn register_exit(
    State(state): State<AppState>,
    Json(req): Json<PlateRequest>,
) -> Result<impl IntoResponse> {
    let plate = validate_plate(&req.license_plate)?;
    let (event, events) = state.coordinator.mark_exit(plate).await?;
    publish_all(&state.hub, events).await;
    Ok(Json(ApiResponse::success(json!({
        "event_id": event.id,
        "status": event.status,
    }))))
}

fn validate_plate(plate: &str) -> Result<&str> {
    let plate = plate.trim();
    if plate.is_empty() {
        return Err(Error::Validation("license_plate must not be empty".into()));
    }
    Ok(plate)
}

// ========================================
// Status subscriptions (frontend)
// ========================================

#[derive(Debug, Deserialize)]
struct StatusWsQuery {
    /// Comma-separated group names; all frontend groups when omitted
    groups: Option<String>,
}

fn parse_groups(query: &StatusWsQuery) -> Result<HashSet<Group>> {
    let Some(raw) = query.groups.as_deref() else {
        return Ok([
            Group::SpaceStatus,
            Group::ActiveVehicles,
            Group::VehicleOverlay,
            Group::ParkingLog,
        ]
        .into());
    };
    let mut groups = HashSet::new();
    for name in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let group = Group::parse(name)
            .ok_or_else(|| Error::Validation(format!("unknown group: {name}")))?;
        groups.insert(group);
    }
    if groups.is_empty() {
        return Err(Error::Validation("no groups requested".into()));
    }
    Ok(groups)
}

/// WebSocket upgrade handler for status subscribers
async fn status_ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<StatusWsQuery>,
    State(state): State<AppState>,
) -> Result<impl IntoResponse> {
    let groups = parse_groups(&query)?;
    Ok(ws.on_upgrade(move |socket| handle_status_socket(socket, state, groups)))
}

/// Forward hub messages to one subscriber until either side closes
async fn handle_status_socket(socket: WebSocket, state: AppState, groups: HashSet<Group>) {
    let (mut sender, mut receiver) = socket.split();
    let (conn_id, mut rx) = state.hub.subscribe(groups).await;

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sender.send(Message::Text(msg)).await.is_err() {
                break;
            }
        }
    });

    let recv_task = tokio::spawn(async move {
        while let Some(result) = receiver.next().await {
            match result {
                Ok(Message::Close(_)) => break,
                Err(e) => {
                    tracing::warn!(connection_id = %conn_id, error = %e, "WebSocket error");
                    break;
                }
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = send_task => {}
        _ = recv_task => {}
    }
    state.hub.unsubscribe(&conn_id).await;
}

// ========================================
// Edge session
// ========================================

/// WebSocket upgrade handler for the edge agent
async fn edge_ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_edge_socket(socket, state))
}

/// One edge agent session: inbound telemetry and reports, outbound
/// control messages and acks
async fn handle_edge_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let (conn_id, mut control_rx) = state.hub.subscribe([Group::EdgeControl].into()).await;
    let (ack_tx, mut ack_rx) = mpsc::channel::<String>(16);

    tracing::info!(connection_id = %conn_id, "Edge agent connected");

    let send_task = tokio::spawn(async move {
        loop {
            let msg = tokio::select! {
                control = control_rx.recv() => control,
                ack = ack_rx.recv() => ack,
            };
            let Some(text) = msg else { break };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let recv_state = state.clone();
    let recv_task = tokio::spawn(async move {
        while let Some(result) = receiver.next().await {
            match result {
                Ok(Message::Text(text)) => {
                    handle_edge_frame(&recv_state, &text, &ack_tx).await;
                }
                Ok(Message::Close(_)) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "Edge socket error");
                    break;
                }
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = send_task => {}
        _ = recv_task => {}
    }
    state.hub.unsubscribe(&conn_id).await;
    tracing::info!(connection_id = %conn_id, "Edge agent disconnected");
}

/// Dispatch one edge frame. A malformed frame is logged and skipped;
/// the session stays up.
async fn handle_edge_frame(state: &AppState, text: &str, ack_tx: &mpsc::Sender<String>) {
    match EdgeMessage::decode(text) {
        Ok(EdgeMessage::CarPosition { vehicles, .. }) => {
            state.hub.publish(HubEvent::Overlay(vehicles)).await;
        }
        Ok(EdgeMessage::Assignment {
            license_plate,
            assignment,
        }) => {
            let ack = match state
                .coordinator
                .confirm_assignment(&license_plate, &assignment)
                .await
            {
                Ok((outcome, events)) => {
                    publish_all(&state.hub, events).await;
                    EdgeMessage::AssignmentAck {
                        license_plate,
                        status: AckStatus::Success,
                        detail: outcome.detail(),
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, slot = %assignment, "Assignment rejected");
                    EdgeMessage::AssignmentAck {
                        license_plate,
                        status: AckStatus::Error,
                        detail: e.to_string(),
                    }
                }
            };
            send_ack(ack_tx, ack).await;
        }
        Ok(EdgeMessage::Score {
            license_plate,
            score,
        }) => {
            let ack = match state.coordinator.report_score(&license_plate, score).await {
                Ok(()) => EdgeMessage::ScoreAck {
                    license_plate,
                    status: AckStatus::Success,
                    detail: "score recorded".into(),
                },
                Err(e) => {
                    tracing::warn!(error = %e, score, "Score rejected");
                    EdgeMessage::ScoreAck {
                        license_plate,
                        status: AckStatus::Error,
                        detail: e.to_string(),
                    }
                }
            };
            send_ack(ack_tx, ack).await;
        }
        Ok(other) => {
            tracing::warn!(message = ?other, "Unexpected edge message");
        }
        Err(e) => {
            tracing::warn!(error = %e, "Undecodable edge frame, skipping");
        }
    }
}

async fn send_ack(ack_tx: &mpsc::Sender<String>, ack: EdgeMessage) {
    match ack.encode() {
        Ok(text) => {
            let _ = ack_tx.send(text).await;
        }
        Err(e) => tracing::error!(error = %e, "Ack encode failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn groups_default_to_all_frontend_groups() {
        let groups = parse_groups(&StatusWsQuery { groups: None }).unwrap();
        assert_eq!(groups.len(), 4);
        assert!(groups.contains(&Group::SpaceStatus));
        assert!(!groups.contains(&Group::EdgeControl));
    }

    #[test]
    fn groups_parse_comma_separated() {
        let groups = parse_groups(&StatusWsQuery {
            groups: Some("space_status, parking_log".into()),
        })
        .unwrap();
        assert_eq!(groups.len(), 2);
        assert!(groups.contains(&Group::ParkingLog));
    }

    #[test]
    fn unknown_group_is_rejected() {
        let err = parse_groups(&StatusWsQuery {
            groups: Some("edge_control".into()),
        })
        .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn empty_plate_is_rejected() {
        assert!(validate_plate("  ").is_err());
        assert_eq!(validate_plate(" 12가3456 ").unwrap(), "12가3456");
    }
}
