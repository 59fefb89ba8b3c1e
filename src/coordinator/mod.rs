//! AssignmentCoordinator - Canonical space / assignment / visit state
//!
//! ## Responsibilities
//!
//! - Owns every mutation of parking_space / parking_assignment /
//!   vehicle_event
//! - Short row-locked transactions; two-space confirmations lock in
//!   ascending space-id order
//! - Bounded retry on lock contention, `Busy` after exhaustion
//! - Returns domain events for the hub; the caller publishes them
//!   strictly after commit
//!
//! Resolution failures come back synchronously: `NotFound` for an
//! unknown vehicle or space, `InvalidState` for a vehicle without an
//! active visit (including confirmations arriving after exit).

mod plan;

pub use plan::{lock_order, plan_confirmation, AssignmentRow, ConfirmationPlan, SpaceRow};

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::mysql::{MySqlPool, MySqlRow};
use sqlx::Row;

use crate::error::{Error, Result};
use crate::event_hub::{ActiveVehicle, AssignedSpace, HubEvent, SpaceInfo, VisitLogEntry};
use crate::models::{AssignmentStatus, SizeClass, SlotLabel, SpaceStatus, VisitStatus};

/// Attempts per operation before surfacing `Busy`
const MAX_TX_RETRIES: u32 = 3;

/// One `vehicle` row (collaborator-owned, read-only here)
#[derive(Debug, Clone)]
pub struct VehicleRow {
    pub id: i64,
    pub license_plate: String,
    pub size_class: SizeClass,
}

/// One `vehicle_event` row
#[derive(Debug, Clone)]
pub struct EventRow {
    pub id: i64,
    pub vehicle_id: i64,
    pub status: VisitStatus,
    pub entrance_time: DateTime<Utc>,
    pub parking_time: Option<DateTime<Utc>>,
    pub exit_time: Option<DateTime<Utc>>,
}

/// What a confirmation did, for the ack detail string
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmOutcome {
    Created,
    Moved { from: String },
    Corrected,
    Unchanged,
}

impl ConfirmOutcome {
    pub fn detail(&self) -> String {
        match self {
            Self::Created => "assignment created".into(),
            Self::Moved { from } => format!("reassigned from {from}"),
            Self::Corrected => "space state corrected".into(),
            Self::Unchanged => "already assigned".into(),
        }
    }
}

/// One score history row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreRecord {
    pub id: i64,
    pub assignment_id: Option<i64>,
    pub score: i64,
    pub created_at: DateTime<Utc>,
}

/// Transactional mutation owner for the lot's canonical state
pub struct AssignmentCoordinator {
    pool: MySqlPool,
}

fn is_lock_conflict(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .and_then(|db| db.try_downcast_ref::<sqlx::mysql::MySqlDatabaseError>())
        // 1213 = deadlock victim, 1205 = lock wait timeout
        .map(|m| matches!(m.number(), 1205 | 1213))
        .unwrap_or(false)
}

/// Run `f` with bounded retry on row-lock contention
async fn with_tx_retry<T, F, Fut>(op: &'static str, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match f().await {
            Err(Error::Sqlx(e)) if is_lock_conflict(&e) => {
                attempt += 1;
                if attempt > MAX_TX_RETRIES {
                    return Err(Error::Busy(format!("{op}: lock contention")));
                }
                tracing::warn!(op, attempt, "Lock contention, retrying transaction");
                tokio::time::sleep(Duration::from_millis(20 * u64::from(attempt))).await;
            }
            other => return other,
        }
    }
}

fn space_from_row(row: &MySqlRow) -> Result<SpaceRow> {
    Ok(SpaceRow {
        id: row.try_get("id")?,
        zone: row.try_get("zone")?,
        slot_number: row.try_get("slot_number")?,
        size_class: SizeClass::parse(&row.try_get::<String, _>("size_class")?)?,
        status: SpaceStatus::parse(&row.try_get::<String, _>("status")?)?,
        current_vehicle_id: row.try_get("current_vehicle_id")?,
    })
}

fn event_from_row(row: &MySqlRow) -> Result<EventRow> {
    Ok(EventRow {
        id: row.try_get("id")?,
        vehicle_id: row.try_get("vehicle_id")?,
        status: VisitStatus::parse(&row.try_get::<String, _>("status")?)?,
        entrance_time: row.try_get("entrance_time")?,
        parking_time: row.try_get("parking_time")?,
        exit_time: row.try_get("exit_time")?,
    })
}

fn vehicle_from_row(row: &MySqlRow) -> Result<VehicleRow> {
    Ok(VehicleRow {
        id: row.try_get("id")?,
        license_plate: row.try_get("license_plate")?,
        size_class: SizeClass::parse(&row.try_get::<String, _>("size_class")?)?,
    })
}

async fn fetch_vehicle<'e>(
    ex: impl sqlx::MySqlExecutor<'e>,
    plate: &str,
) -> Result<Option<VehicleRow>> {
    let row = sqlx::query("SELECT id, license_plate, size_class FROM vehicle WHERE license_plate = ?")
        .bind(plate)
        .fetch_optional(ex)
        .await?;
    row.as_ref().map(vehicle_from_row).transpose()
}

const EVENT_COLS: &str = "id, vehicle_id, status, entrance_time, parking_time, exit_time";

async fn fetch_active_event<'e>(
    ex: impl sqlx::MySqlExecutor<'e>,
    vehicle_id: i64,
    for_update: bool,
) -> Result<Option<EventRow>> {
    let sql = format!(
        "SELECT {EVENT_COLS} FROM vehicle_event \
         WHERE vehicle_id = ? AND exit_time IS NULL \
         ORDER BY id DESC LIMIT 1{}",
        if for_update { " FOR UPDATE" } else { "" }
    );
    let row = sqlx::query(&sql).bind(vehicle_id).fetch_optional(ex).await?;
    row.as_ref().map(event_from_row).transpose()
}

const SPACE_COLS: &str = "id, zone, slot_number, size_class, status, current_vehicle_id";

async fn lock_space<'e>(ex: impl sqlx::MySqlExecutor<'e>, space_id: i64) -> Result<SpaceRow> {
    let sql = format!("SELECT {SPACE_COLS} FROM parking_space WHERE id = ? FOR UPDATE");
    let row = sqlx::query(&sql).bind(space_id).fetch_one(ex).await?;
    space_from_row(&row)
}

impl AssignmentCoordinator {
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }

    // ========================================
    // Entrance
    // ========================================

    /// Open a visit for a plate and ask the edge side for a slot.
    /// Idempotent while a visit is already active: the open event is
    /// returned and no duplicate request is emitted.
    pub async fn register_entrance(&self, plate: &str) -> Result<(EventRow, Vec<HubEvent>)> {
        with_tx_retry("register_entrance", || self.register_entrance_tx(plate)).await
    }

    async fn register_entrance_tx(&self, plate: &str) -> Result<(EventRow, Vec<HubEvent>)> {
        let mut tx = self.pool.begin().await?;

        let vehicle = fetch_vehicle(&mut *tx, plate)
            .await?
            .ok_or_else(|| Error::NotFound("vehicle not found".into()))?;

        if let Some(open) = fetch_active_event(&mut *tx, vehicle.id, true).await? {
            tx.commit().await?;
            tracing::info!(plate = %plate, event_id = open.id, "Entrance already open");
            return Ok((open, Vec::new()));
        }

        let now = Utc::now();
        let result = sqlx::query(
            "INSERT INTO vehicle_event (vehicle_id, status, entrance_time) VALUES (?, ?, ?)",
        )
        .bind(vehicle.id)
        .bind(VisitStatus::Entrance.as_str())
        .bind(now)
        .execute(&mut *tx)
        .await?;
        let event_id = result.last_insert_id() as i64;
        tx.commit().await?;

        let event = EventRow {
            id: event_id,
            vehicle_id: vehicle.id,
            status: VisitStatus::Entrance,
            entrance_time: now,
            parking_time: None,
            exit_time: None,
        };

        tracing::info!(plate = %plate, event_id, "Entrance registered");

        let events = vec![
            HubEvent::ActiveVehiclesChanged {
                upsert: vec![active_vehicle(&event, &vehicle, None)],
                remove: vec![],
            },
            HubEvent::VisitLogged(visit_log(&event, &vehicle)),
            HubEvent::RequestAssignment {
                license_plate: vehicle.license_plate.clone(),
                size_class: vehicle.size_class,
            },
        ];
        Ok((event, events))
    }

    // ========================================
    // Assignment confirmation
    // ========================================

    /// Bind a vehicle's visit to the confirmed slot. Creates, moves or
    /// corrects the assignment; same-slot repeats are a no-op with no
    /// duplicate broadcast.
    pub async fn confirm_assignment(
        &self,
        plate: &str,
        slot_label: &str,
    ) -> Result<(ConfirmOutcome, Vec<HubEvent>)> {
        with_tx_retry("confirm_assignment", || {
            self.confirm_assignment_tx(plate, slot_label)
        })
        .await
    }

    async fn confirm_assignment_tx(
        &self,
        plate: &str,
        slot_label: &str,
    ) -> Result<(ConfirmOutcome, Vec<HubEvent>)> {
        let label = SlotLabel::parse(slot_label)?;
        let mut tx = self.pool.begin().await?;

        let vehicle = fetch_vehicle(&mut *tx, plate)
            .await?
            .ok_or_else(|| Error::NotFound("vehicle not found".into()))?;

        let event = fetch_active_event(&mut *tx, vehicle.id, true)
            .await?
            .ok_or_else(|| Error::InvalidState("no active event for vehicle".into()))?;

        let target_id: i64 =
            sqlx::query("SELECT id FROM parking_space WHERE zone = ? AND slot_number = ?")
                .bind(&label.zone)
                .bind(label.slot_number)
                .fetch_optional(&mut *tx)
                .await?
                .map(|row| row.try_get("id"))
                .transpose()?
                .ok_or_else(|| Error::NotFound("parking space not found".into()))?;

        let existing = sqlx::query(
            "SELECT id, vehicle_id, space_id, status FROM parking_assignment \
             WHERE entrance_event_id = ? FOR UPDATE",
        )
        .bind(event.id)
        .fetch_optional(&mut *tx)
        .await?
        .map(|row| -> Result<AssignmentRow> {
            Ok(AssignmentRow {
                id: row.try_get("id")?,
                vehicle_id: row.try_get("vehicle_id")?,
                space_id: row.try_get("space_id")?,
                status: match row.try_get::<String, _>("status")?.as_str() {
                    "completed" => AssignmentStatus::Completed,
                    _ => AssignmentStatus::Assigned,
                },
            })
        })
        .transpose()?;

        // Lock the involved spaces in ascending-id order
        let old_id = existing.as_ref().map(|a| a.space_id).filter(|&id| id != target_id);
        let mut target = None;
        let mut old_space = None;
        match old_id {
            Some(old) => {
                let (first, second) = lock_order(old, target_id);
                for id in [first, second] {
                    let row = lock_space(&mut *tx, id).await?;
                    if id == target_id {
                        target = Some(row);
                    } else {
                        old_space = Some(row);
                    }
                }
            }
            None => target = Some(lock_space(&mut *tx, target_id).await?),
        }
        let target = target.ok_or_else(|| Error::Internal("target space not locked".into()))?;

        let plan = plan_confirmation(vehicle.id, existing.as_ref(), &target, old_space.as_ref());

        let mut events: Vec<HubEvent> = Vec::new();
        let outcome = match plan {
            ConfirmationPlan::Create { reserve } => {
                sqlx::query(
                    "INSERT INTO parking_assignment \
                     (entrance_event_id, vehicle_id, space_id, status, start_time) \
                     VALUES (?, ?, ?, ?, ?)",
                )
                .bind(event.id)
                .bind(vehicle.id)
                .bind(reserve)
                .bind(AssignmentStatus::Assigned.as_str())
                .bind(Utc::now())
                .execute(&mut *tx)
                .await?;
                self.reserve_space(&mut tx, reserve, vehicle.id).await?;
                events.push(space_delta(&target, SpaceStatus::Reserved, Some(&vehicle)));
                ConfirmOutcome::Created
            }
            ConfirmationPlan::Move { free, reserve } => {
                let assignment = existing.as_ref().ok_or_else(|| {
                    Error::Internal("move plan without existing assignment".into())
                })?;
                sqlx::query("UPDATE parking_assignment SET space_id = ? WHERE id = ?")
                    .bind(reserve)
                    .bind(assignment.id)
                    .execute(&mut *tx)
                    .await?;
                if let Some(free_id) = free {
                    sqlx::query(
                        "UPDATE parking_space \
                         SET status = 'free', current_vehicle_id = NULL WHERE id = ?",
                    )
                    .bind(free_id)
                    .execute(&mut *tx)
                    .await?;
                }
                self.reserve_space(&mut tx, reserve, vehicle.id).await?;
                // Old freed first, then the new reservation, in commit order
                if let Some(old) = old_space.as_ref() {
                    events.push(space_delta(old, SpaceStatus::Free, None));
                }
                events.push(space_delta(&target, SpaceStatus::Reserved, Some(&vehicle)));
                ConfirmOutcome::Moved {
                    from: old_space
                        .as_ref()
                        .map(SpaceRow::label)
                        .unwrap_or_default(),
                }
            }
            ConfirmationPlan::Correct { reserve } => {
                self.reserve_space(&mut tx, reserve, vehicle.id).await?;
                events.push(space_delta(&target, SpaceStatus::Reserved, Some(&vehicle)));
                ConfirmOutcome::Corrected
            }
            ConfirmationPlan::Noop => ConfirmOutcome::Unchanged,
        };

        tx.commit().await?;

        if outcome != ConfirmOutcome::Unchanged {
            let assigned = AssignedSpace {
                zone: target.zone.clone(),
                slot_number: target.slot_number,
                label: target.label(),
                status: SpaceStatus::Reserved,
            };
            events.push(HubEvent::ActiveVehiclesChanged {
                upsert: vec![active_vehicle(&event, &vehicle, Some(assigned))],
                remove: vec![],
            });
            events.push(HubEvent::VisitLogged(visit_log(&event, &vehicle)));
        }

        tracing::info!(
            plate = %plate,
            slot = %label,
            outcome = ?outcome,
            "Assignment confirmed"
        );
        Ok((outcome, events))
    }

    async fn reserve_space(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::MySql>,
        space_id: i64,
        vehicle_id: i64,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE parking_space SET status = 'reserved', current_vehicle_id = ? WHERE id = ?",
        )
        .bind(vehicle_id)
        .bind(space_id)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    // ========================================
    // Parking complete / exit
    // ========================================

    /// Active visit -> Parking; the bound space goes occupied. Idempotent.
    pub async fn mark_parking_complete(
        &self,
        plate: &str,
    ) -> Result<(EventRow, Vec<HubEvent>)> {
        with_tx_retry("mark_parking_complete", || {
            self.mark_parking_complete_tx(plate)
        })
        .await
    }

    async fn mark_parking_complete_tx(&self, plate: &str) -> Result<(EventRow, Vec<HubEvent>)> {
        let mut tx = self.pool.begin().await?;

        let vehicle = fetch_vehicle(&mut *tx, plate)
            .await?
            .ok_or_else(|| Error::NotFound("vehicle not found".into()))?;
        let mut event = fetch_active_event(&mut *tx, vehicle.id, true)
            .await?
            .ok_or_else(|| Error::InvalidState("no active event for vehicle".into()))?;

        if event.status == VisitStatus::Parking {
            tx.commit().await?;
            return Ok((event, Vec::new()));
        }

        let now = Utc::now();
        sqlx::query("UPDATE vehicle_event SET parking_time = ?, status = ? WHERE id = ?")
            .bind(now)
            .bind(VisitStatus::Parking.as_str())
            .bind(event.id)
            .execute(&mut *tx)
            .await?;
        event.parking_time = Some(now);
        event.status = VisitStatus::Parking;

        let mut events: Vec<HubEvent> = Vec::new();
        let mut assigned = None;
        if let Some(space_id) = self.assigned_space_id(&mut tx, event.id).await? {
            let space = lock_space(&mut *tx, space_id).await?;
            sqlx::query("UPDATE parking_space SET status = 'occupied' WHERE id = ?")
                .bind(space_id)
                .execute(&mut *tx)
                .await?;
            events.push(space_delta(&space, SpaceStatus::Occupied, Some(&vehicle)));
            assigned = Some(AssignedSpace {
                zone: space.zone.clone(),
                slot_number: space.slot_number,
                label: space.label(),
                status: SpaceStatus::Occupied,
            });
        }
        tx.commit().await?;

        events.push(HubEvent::ActiveVehiclesChanged {
            upsert: vec![active_vehicle(&event, &vehicle, assigned)],
            remove: vec![],
        });
        events.push(HubEvent::VisitLogged(visit_log(&event, &vehicle)));

        tracing::info!(plate = %plate, event_id = event.id, "Parking complete");
        Ok((event, events))
    }

    /// Active visit -> Exit; assignment completed, space freed and
    /// unbound. Idempotent per visit (a second call finds no active
    /// event and fails `InvalidState`).
    pub async fn mark_exit(&self, plate: &str) -> Result<(EventRow, Vec<HubEvent>)> {
        with_tx_retry("mark_exit", || self.mark_exit_tx(plate)).await
    }

    async fn mark_exit_tx(&self, plate: &str) -> Result<(EventRow, Vec<HubEvent>)> {
        let mut tx = self.pool.begin().await?;

        let vehicle = fetch_vehicle(&mut *tx, plate)
            .await?
            .ok_or_else(|| Error::NotFound("vehicle not found".into()))?;
        let mut event = fetch_active_event(&mut *tx, vehicle.id, true)
            .await?
            .ok_or_else(|| Error::InvalidState("no active event for vehicle".into()))?;

        let now = Utc::now();
        sqlx::query("UPDATE vehicle_event SET exit_time = ?, status = ? WHERE id = ?")
            .bind(now)
            .bind(VisitStatus::Exit.as_str())
            .bind(event.id)
            .execute(&mut *tx)
            .await?;
        event.exit_time = Some(now);
        event.status = VisitStatus::Exit;

        let mut events: Vec<HubEvent> = Vec::new();
        let assignment = sqlx::query(
            "SELECT id, space_id FROM parking_assignment \
             WHERE entrance_event_id = ? AND status = 'assigned' FOR UPDATE",
        )
        .bind(event.id)
        .fetch_optional(&mut *tx)
        .await?;
        if let Some(row) = assignment {
            let assignment_id: i64 = row.try_get("id")?;
            let space_id: i64 = row.try_get("space_id")?;
            sqlx::query(
                "UPDATE parking_assignment SET status = 'completed', end_time = ? WHERE id = ?",
            )
            .bind(now)
            .bind(assignment_id)
            .execute(&mut *tx)
            .await?;

            let space = lock_space(&mut *tx, space_id).await?;
            sqlx::query(
                "UPDATE parking_space SET status = 'free', current_vehicle_id = NULL WHERE id = ?",
            )
            .bind(space_id)
            .execute(&mut *tx)
            .await?;
            events.push(space_delta(&space, SpaceStatus::Free, None));
        }
        tx.commit().await?;

        events.push(HubEvent::ActiveVehiclesChanged {
            upsert: vec![],
            remove: vec![event.id],
        });
        events.push(HubEvent::VisitLogged(visit_log(&event, &vehicle)));

        tracing::info!(plate = %plate, event_id = event.id, "Exit recorded");
        Ok((event, events))
    }

    async fn assigned_space_id(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::MySql>,
        event_id: i64,
    ) -> Result<Option<i64>> {
        let row = sqlx::query(
            "SELECT space_id FROM parking_assignment \
             WHERE entrance_event_id = ? AND status = 'assigned' FOR UPDATE",
        )
        .bind(event_id)
        .fetch_optional(&mut **tx)
        .await?;
        row.map(|r| r.try_get("space_id")).transpose().map_err(Error::from)
    }

    // ========================================
    // Score side channel
    // ========================================

    /// Append a score linked to the vehicle's latest assignment
    /// (nullable); independent of space state.
    pub async fn report_score(&self, plate: &str, score: i64) -> Result<()> {
        let vehicle = fetch_vehicle(&self.pool, plate)
            .await?
            .ok_or_else(|| Error::NotFound("vehicle not found".into()))?;

        let assignment_id: Option<i64> = match fetch_active_event(&self.pool, vehicle.id, false)
            .await?
        {
            Some(event) => {
                sqlx::query("SELECT id FROM parking_assignment WHERE entrance_event_id = ?")
                    .bind(event.id)
                    .fetch_optional(&self.pool)
                    .await?
                    .map(|r| r.try_get("id"))
                    .transpose()?
            }
            None => None,
        };
        let assignment_id = match assignment_id {
            Some(id) => Some(id),
            None => sqlx::query(
                "SELECT id FROM parking_assignment WHERE vehicle_id = ? \
                 ORDER BY start_time DESC LIMIT 1",
            )
            .bind(vehicle.id)
            .fetch_optional(&self.pool)
            .await?
            .map(|r| r.try_get("id"))
            .transpose()?,
        };

        sqlx::query(
            "INSERT INTO parking_score_history (vehicle_id, assignment_id, score) VALUES (?, ?, ?)",
        )
        .bind(vehicle.id)
        .bind(assignment_id)
        .bind(score)
        .execute(&self.pool)
        .await?;

        tracing::info!(plate = %plate, score, assignment_id = ?assignment_id, "Score recorded");
        Ok(())
    }

    /// Latest score records for a plate (most recent first)
    pub async fn score_history(&self, plate: &str, limit: u32) -> Result<Vec<ScoreRecord>> {
        let vehicle = fetch_vehicle(&self.pool, plate)
            .await?
            .ok_or_else(|| Error::NotFound("vehicle not found".into()))?;
        let rows = sqlx::query(
            "SELECT id, assignment_id, score, created_at FROM parking_score_history \
             WHERE vehicle_id = ? ORDER BY id DESC LIMIT ?",
        )
        .bind(vehicle.id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(ScoreRecord {
                    id: row.try_get("id")?,
                    assignment_id: row.try_get("assignment_id")?,
                    score: row.try_get("score")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }

    // ========================================
    // Snapshot loaders (hub seeding)
    // ========================================

    /// Full space-status map, for seeding the hub view at startup
    pub async fn load_space_snapshot(&self) -> Result<BTreeMap<String, SpaceInfo>> {
        let rows = sqlx::query(
            "SELECT s.zone, s.slot_number, s.size_class, s.status, \
                    s.current_vehicle_id, v.license_plate \
             FROM parking_space s \
             LEFT JOIN vehicle v ON v.id = s.current_vehicle_id",
        )
        .fetch_all(&self.pool)
        .await?;
        let mut out = BTreeMap::new();
        for row in rows {
            let zone: String = row.try_get("zone")?;
            let slot_number: u32 = row.try_get("slot_number")?;
            out.insert(
                format!("{zone}{slot_number}"),
                SpaceInfo {
                    status: SpaceStatus::parse(&row.try_get::<String, _>("status")?)?,
                    size: SizeClass::parse(&row.try_get::<String, _>("size_class")?)?,
                    vehicle_id: row.try_get("current_vehicle_id")?,
                    license_plate: row.try_get("license_plate")?,
                },
            );
        }
        Ok(out)
    }

    /// In-progress visits with resolved assigned space, for hub seeding
    pub async fn load_active_snapshot(&self) -> Result<Vec<ActiveVehicle>> {
        let rows = sqlx::query(
            "SELECT e.id, e.vehicle_id, e.status, e.entrance_time, \
                    v.license_plate, \
                    s.zone AS s_zone, s.slot_number AS s_slot, s.status AS s_status \
             FROM vehicle_event e \
             JOIN vehicle v ON v.id = e.vehicle_id \
             LEFT JOIN parking_assignment a \
                    ON a.entrance_event_id = e.id AND a.status = 'assigned' \
             LEFT JOIN parking_space s ON s.id = a.space_id \
             WHERE e.exit_time IS NULL \
             ORDER BY e.id DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        let mut out = Vec::new();
        for row in rows {
            let assigned = match row.try_get::<Option<String>, _>("s_zone")? {
                Some(zone) => {
                    let slot_number: u32 = row.try_get("s_slot")?;
                    Some(AssignedSpace {
                        label: format!("{zone}{slot_number}"),
                        zone,
                        slot_number,
                        status: SpaceStatus::parse(&row.try_get::<String, _>("s_status")?)?,
                    })
                }
                None => None,
            };
            out.push(ActiveVehicle {
                id: row.try_get("id")?,
                vehicle_id: row.try_get("vehicle_id")?,
                license_plate: row.try_get("license_plate")?,
                entrance_time: row.try_get("entrance_time")?,
                status: VisitStatus::parse(&row.try_get::<String, _>("status")?)?,
                assigned_space: assigned,
            });
        }
        Ok(out)
    }

    /// DB liveness probe for the health endpoint
    pub async fn ping(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }
}

fn space_delta(space: &SpaceRow, status: SpaceStatus, vehicle: Option<&VehicleRow>) -> HubEvent {
    let mut rows = BTreeMap::new();
    rows.insert(
        space.label(),
        SpaceInfo {
            status,
            size: space.size_class,
            vehicle_id: vehicle.map(|v| v.id),
            license_plate: vehicle.map(|v| v.license_plate.clone()),
        },
    );
    HubEvent::SpacesChanged(rows)
}

fn active_vehicle(
    event: &EventRow,
    vehicle: &VehicleRow,
    assigned: Option<AssignedSpace>,
) -> ActiveVehicle {
    ActiveVehicle {
        id: event.id,
        vehicle_id: vehicle.id,
        license_plate: vehicle.license_plate.clone(),
        entrance_time: event.entrance_time,
        status: event.status,
        assigned_space: assigned,
    }
}

fn visit_log(event: &EventRow, vehicle: &VehicleRow) -> VisitLogEntry {
    VisitLogEntry {
        id: event.id,
        license_plate: vehicle.license_plate.clone(),
        status: event.status,
        entrance_time: event.entrance_time,
        parking_time: event.parking_time,
        exit_time: event.exit_time,
    }
}
