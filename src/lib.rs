//! Lotserver Library
//!
//! Smart parking occupancy and assignment coordination
//!
//! ## Architecture (6 Components)
//!
//! 1. ZoneTracker - Debounced zone occupancy from per-frame detections
//! 2. EdgeAgent - Lot-side decision loop (slot resolution, scoring)
//! 3. TelemetryClient - Persistent uplink from the edge agent
//! 4. AssignmentCoordinator - Canonical space/assignment/visit state
//! 5. EventHub - Snapshot + delta distribution to subscribers
//! 6. WebAPI - REST endpoints and WebSocket sessions
//!
//! ## Design Principles
//!
//! - The coordinator owns every canonical mutation; the hub only
//!   distributes what the coordinator committed
//! - Telemetry is at-most-once; reports are acknowledged
//! - The edge agent keeps working (and dropping telemetry) while the
//!   uplink is down

pub mod coordinator;
pub mod edge_agent;
pub mod error;
pub mod event_hub;
pub mod models;
pub mod state;
pub mod telemetry_client;
pub mod web_api;
pub mod wire;
pub mod zone_tracker;

pub use error::{Error, Result};
pub use state::AppState;
