//! TelemetryClient - Persistent uplink from the edge agent
//!
//! ## Responsibilities
//!
//! - One persistent WebSocket to the coordinator, reconnect with
//!   bounded exponential backoff + jitter
//! - Telemetry (`car_position`) is latest-wins: frames produced while
//!   offline are dropped, never queued
//! - Acknowledged reports (`assignment` / `score`) correlate to their
//!   acks by (plate, kind) with a delivery deadline
//! - Inbound `request_assignment` control messages are handed to the
//!   agent over a channel

use std::collections::HashMap;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use rand::Rng;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use crate::error::{Error, Result};
use crate::wire::{AckKind, AckStatus, EdgeMessage};

/// In-flight acknowledged reports per session
const REPORT_QUEUE: usize = 32;

/// Uplink settings
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// e.g. "ws://127.0.0.1:8123/ws/edge"
    pub url: String,
    pub ack_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8123/ws/edge".into(),
            ack_timeout: Duration::from_secs(5),
            backoff_base: Duration::from_millis(500),
            backoff_cap: Duration::from_secs(30),
        }
    }
}

/// Ack outcome handed back to the reporter
#[derive(Debug, Clone)]
pub struct AckResponse {
    pub status: AckStatus,
    pub detail: String,
}

struct Report {
    message: EdgeMessage,
    respond: oneshot::Sender<AckResponse>,
}

/// Bounded exponential reconnect delay
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            current: base,
        }
    }

    /// Delay to sleep before the next attempt, then double toward the cap
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.cap);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.base;
    }

    /// Up to 10% jitter so a fleet of agents does not reconnect in step
    pub fn jittered(delay: Duration) -> Duration {
        let jitter = rand::thread_rng().gen_range(0..=delay.as_millis().max(1) as u64 / 10);
        delay + Duration::from_millis(jitter)
    }
}

/// Handle the agent uses to feed the uplink
#[derive(Clone)]
pub struct TelemetryClient {
    telemetry: watch::Sender<Option<String>>,
    reports: mpsc::Sender<Report>,
    ack_timeout: Duration,
}

impl TelemetryClient {
    /// Spawn the connection task. Returns the client handle and the
    /// receiver for inbound control messages.
    pub fn spawn(config: TelemetryConfig) -> (Self, mpsc::Receiver<EdgeMessage>) {
        let (telemetry_tx, telemetry_rx) = watch::channel(None);
        let (report_tx, report_rx) = mpsc::channel(REPORT_QUEUE);
        let (control_tx, control_rx) = mpsc::channel(REPORT_QUEUE);

        let client = Self {
            telemetry: telemetry_tx,
            reports: report_tx,
            ack_timeout: config.ack_timeout,
        };
        tokio::spawn(run_uplink(config, telemetry_rx, report_rx, control_tx));
        (client, control_rx)
    }

    /// Publish the latest telemetry frame. Overwrites any frame not yet
    /// sent; while the uplink is down frames are simply replaced.
    pub fn send_telemetry(&self, message: &EdgeMessage) -> Result<()> {
        let text = message.encode()?;
        self.telemetry
            .send(Some(text))
            .map_err(|_| Error::Network("uplink task stopped".into()))
    }

    /// Send an acknowledged report and wait for its ack, bounded by the
    /// ack timeout.
    pub async fn send_report(&self, message: EdgeMessage) -> Result<AckResponse> {
        if message.ack_key().is_none() {
            return Err(Error::Internal("message is not an acknowledged report".into()));
        }
        let (respond, rx) = oneshot::channel();
        self.reports
            .send(Report { message, respond })
            .await
            .map_err(|_| Error::Network("uplink task stopped".into()))?;
        match tokio::time::timeout(self.ack_timeout, rx).await {
            Ok(Ok(ack)) => Ok(ack),
            Ok(Err(_)) => Err(Error::Network("uplink dropped before ack".into())),
            Err(_) => Err(Error::Network("ack timeout".into())),
        }
    }
}

async fn run_uplink(
    config: TelemetryConfig,
    mut telemetry_rx: watch::Receiver<Option<String>>,
    mut report_rx: mpsc::Receiver<Report>,
    control_tx: mpsc::Sender<EdgeMessage>,
) {
    let mut backoff = Backoff::new(config.backoff_base, config.backoff_cap);
    loop {
        match connect_async(config.url.as_str()).await {
            Ok((socket, _)) => {
                tracing::info!(url = %config.url, "Uplink connected");
                backoff.reset();
                run_session(
                    socket,
                    &mut telemetry_rx,
                    &mut report_rx,
                    &control_tx,
                    config.ack_timeout,
                )
                .await;
                tracing::warn!(url = %config.url, "Uplink session ended");
            }
            Err(e) => {
                tracing::warn!(url = %config.url, error = %e, "Uplink connect failed");
            }
        }
        let delay = Backoff::jittered(backoff.next_delay());
        tracing::info!(delay_ms = delay.as_millis() as u64, "Reconnecting after backoff");
        tokio::time::sleep(delay).await;
    }
}

async fn run_session<S>(
    socket: tokio_tungstenite::WebSocketStream<S>,
    telemetry_rx: &mut watch::Receiver<Option<String>>,
    report_rx: &mut mpsc::Receiver<Report>,
    control_tx: &mpsc::Sender<EdgeMessage>,
    ack_timeout: Duration,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut sink, mut stream) = socket.split();
    let mut pending: HashMap<(String, AckKind), (Instant, oneshot::Sender<AckResponse>)> =
        HashMap::new();
    let mut sweep = tokio::time::interval(Duration::from_millis(250));

    loop {
        tokio::select! {
            changed = telemetry_rx.changed() => {
                if changed.is_err() {
                    return;
                }
                let frame = telemetry_rx.borrow_and_update().clone();
                if let Some(text) = frame {
                    if let Err(e) = sink.send(Message::Text(text)).await {
                        tracing::warn!(error = %e, "Telemetry send failed");
                        break;
                    }
                }
            }
            report = report_rx.recv() => {
                let Some(report) = report else { return };
                let Some(key) = report.message.ack_key() else { continue };
                let text = match report.message.encode() {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::error!(error = %e, "Report encode failed");
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Text(text)).await {
                    tracing::warn!(error = %e, "Report send failed");
                    break;
                }
                // A newer report for the same key supersedes the old one
                pending.insert(key, (Instant::now() + ack_timeout, report.respond));
            }
            _ = sweep.tick() => {
                let now = Instant::now();
                pending.retain(|key, (deadline, _)| {
                    if *deadline <= now {
                        tracing::warn!(plate = %key.0, kind = ?key.1, "Ack deadline expired");
                        false
                    } else {
                        true
                    }
                });
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        match EdgeMessage::decode(&text) {
                            Ok(msg @ (EdgeMessage::AssignmentAck { .. }
                                | EdgeMessage::ScoreAck { .. })) => {
                                route_ack(&mut pending, &msg);
                            }
                            Ok(msg @ EdgeMessage::RequestAssignment { .. }) => {
                                if control_tx.send(msg).await.is_err() {
                                    return;
                                }
                            }
                            Ok(other) => {
                                tracing::warn!(message = ?other, "Unexpected uplink message");
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, "Undecodable uplink frame, skipping");
                            }
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if sink.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "Uplink read error");
                        break;
                    }
                }
            }
        }
    }
    // Pending reporters learn the session died via the dropped senders
    pending.clear();
}

fn route_ack(
    pending: &mut HashMap<(String, AckKind), (Instant, oneshot::Sender<AckResponse>)>,
    ack: &EdgeMessage,
) {
    let Some(key) = ack.ack_key() else { return };
    let (status, detail) = match ack {
        EdgeMessage::AssignmentAck { status, detail, .. }
        | EdgeMessage::ScoreAck { status, detail, .. } => (*status, detail.clone()),
        _ => return,
    };
    match pending.remove(&key) {
        Some((_, respond)) => {
            let _ = respond.send(AckResponse { status, detail });
        }
        None => {
            tracing::debug!(plate = %key.0, kind = ?key.1, "Ack without pending report");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let mut b = Backoff::new(Duration::from_millis(500), Duration::from_secs(4));
        assert_eq!(b.next_delay(), Duration::from_millis(500));
        assert_eq!(b.next_delay(), Duration::from_secs(1));
        assert_eq!(b.next_delay(), Duration::from_secs(2));
        assert_eq!(b.next_delay(), Duration::from_secs(4));
        assert_eq!(b.next_delay(), Duration::from_secs(4));
        b.reset();
        assert_eq!(b.next_delay(), Duration::from_millis(500));
    }

    #[test]
    fn jitter_stays_within_ten_percent() {
        let delay = Duration::from_secs(10);
        for _ in 0..100 {
            let j = Backoff::jittered(delay);
            assert!(j >= delay);
            assert!(j <= delay + Duration::from_secs(1));
        }
    }

    #[tokio::test]
    async fn telemetry_is_latest_wins() {
        let (tx, mut rx) = watch::channel::<Option<String>>(None);
        tx.send(Some("frame-1".into())).unwrap();
        tx.send(Some("frame-2".into())).unwrap();
        // A consumer waking up now sees only the newest frame
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().as_deref(), Some("frame-2"));
        assert!(!rx.has_changed().unwrap());
    }

    #[tokio::test]
    async fn ack_routes_to_matching_pending_report() {
        let mut pending = HashMap::new();
        let (tx_a, rx_a) = oneshot::channel();
        let (tx_s, mut rx_s) = oneshot::channel();
        let deadline = Instant::now() + Duration::from_secs(5);
        pending.insert(("12가3456".to_string(), AckKind::Assignment), (deadline, tx_a));
        pending.insert(("12가3456".to_string(), AckKind::Score), (deadline, tx_s));

        route_ack(
            &mut pending,
            &EdgeMessage::AssignmentAck {
                license_plate: "12가3456".into(),
                status: AckStatus::Success,
                detail: "assignment created".into(),
            },
        );

        let ack = rx_a.await.unwrap();
        assert_eq!(ack.status, AckStatus::Success);
        assert_eq!(ack.detail, "assignment created");
        // The score report is still waiting for its own ack
        assert!(rx_s.try_recv().is_err());
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn unmatched_ack_is_ignored() {
        let mut pending: HashMap<(String, AckKind), (Instant, oneshot::Sender<AckResponse>)> =
            HashMap::new();
        route_ack(
            &mut pending,
            &EdgeMessage::ScoreAck {
                license_plate: "99누9999".into(),
                status: AckStatus::Error,
                detail: "vehicle not found".into(),
            },
        );
        assert!(pending.is_empty());
    }
}
