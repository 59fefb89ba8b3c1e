//! Edge agent - lot-side process
//!
//! Reads detector frames as JSON lines on stdin, drives the agent
//! state machine and keeps the uplink to the coordination server.
//! Each stdin line is one frame: `{"detections": [{"track_id": 7,
//! "cx": 120.5, "cy": 44.0, "corners": [...], "angle": 0.1,
//! "plate": "12가3456"}]}`.

use std::time::Duration;

use lotserver::edge_agent::{EdgeAgent, Frame};
use lotserver::telemetry_client::{TelemetryClient, TelemetryConfig};
use lotserver::wire::{AckStatus, EdgeMessage};
use lotserver::zone_tracker::Zone;
use lotserver::{Error, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Edge process configuration, environment-driven
struct EdgeConfig {
    server_url: String,
    zones_path: String,
    frame_w: f64,
    frame_h: f64,
}

impl Default for EdgeConfig {
    fn default() -> Self {
        Self {
            server_url: std::env::var("SERVER_WS_URL")
                .unwrap_or_else(|_| "ws://127.0.0.1:8123/ws/edge".to_string()),
            zones_path: std::env::var("ZONES_PATH").unwrap_or_else(|_| "zones.json".to_string()),
            frame_w: std::env::var("FRAME_W")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(1920.0),
            frame_h: std::env::var("FRAME_H")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(1080.0),
        }
    }
}

fn load_zones(path: &str) -> Result<Vec<Zone>> {
    let text = std::fs::read_to_string(path)?;
    let zones: Vec<Zone> = serde_json::from_str(&text)?;
    if zones.is_empty() {
        return Err(Error::Config(format!("no zones defined in {path}")));
    }
    Ok(zones)
}

/// Send one acknowledged report off the frame loop. An assignment
/// rejected by the coordinator releases the local reservation.
fn spawn_report(
    client: TelemetryClient,
    report: EdgeMessage,
    release_tx: mpsc::UnboundedSender<String>,
) {
    tokio::spawn(async move {
        let assignment_plate = match &report {
            EdgeMessage::Assignment { license_plate, .. } => Some(license_plate.clone()),
            _ => None,
        };
        match client.send_report(report).await {
            Ok(ack) if ack.status == AckStatus::Success => {
                tracing::debug!(detail = %ack.detail, "Report acknowledged");
            }
            Ok(ack) => {
                tracing::warn!(detail = %ack.detail, "Report rejected");
                if let Some(plate) = assignment_plate {
                    let _ = release_tx.send(plate);
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Report delivery failed");
            }
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lotserver=debug,edge_agent=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = EdgeConfig::default();
    let zones = load_zones(&config.zones_path)?;
    tracing::info!(
        zones = zones.len(),
        server_url = %config.server_url,
        "Edge agent starting"
    );

    let mut agent = EdgeAgent::new(zones, config.frame_w, config.frame_h);
    let (client, mut control_rx) = TelemetryClient::spawn(TelemetryConfig {
        url: config.server_url,
        ack_timeout: Duration::from_secs(5),
        backoff_base: Duration::from_millis(500),
        backoff_cap: Duration::from_secs(30),
    });
    let (release_tx, mut release_rx) = mpsc::unbounded_channel::<String>();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    tracing::info!("Detector stream ended");
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                let frame: Frame = match serde_json::from_str(&line) {
                    Ok(frame) => frame,
                    Err(e) => {
                        tracing::warn!(error = %e, "Undecodable frame line, skipping");
                        continue;
                    }
                };
                let tick = agent.process_frame(frame);
                if let Err(e) = client.send_telemetry(&tick.telemetry) {
                    tracing::warn!(error = %e, "Telemetry handoff failed");
                }
                for report in tick.reports {
                    spawn_report(client.clone(), report, release_tx.clone());
                }
            }
            Some(msg) = control_rx.recv() => {
                if let EdgeMessage::RequestAssignment { license_plate, size_class } = msg {
                    match agent.handle_request(&license_plate, size_class) {
                        Some(report) => spawn_report(client.clone(), report, release_tx.clone()),
                        None => tracing::warn!(plate = %license_plate, "Lot full, request unanswered"),
                    }
                }
            }
            Some(plate) = release_rx.recv() => {
                agent.release_assignment(&plate);
            }
        }
    }

    Ok(())
}
