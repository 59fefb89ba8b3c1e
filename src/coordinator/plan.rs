//! Pure decision logic for assignment confirmation
//!
//! Separated from the transaction layer so the create / move / correct
//! branching can be exercised without a database. The executor locks
//! the rows, calls [`plan_confirmation`], and applies the plan.

use crate::models::{AssignmentStatus, SizeClass, SpaceStatus};

/// One `parking_space` row as read inside a transaction
#[derive(Debug, Clone, PartialEq)]
pub struct SpaceRow {
    pub id: i64,
    pub zone: String,
    pub slot_number: u32,
    pub size_class: SizeClass,
    pub status: SpaceStatus,
    pub current_vehicle_id: Option<i64>,
}

impl SpaceRow {
    pub fn label(&self) -> String {
        format!("{}{}", self.zone, self.slot_number)
    }
}

/// One `parking_assignment` row as read inside a transaction
#[derive(Debug, Clone, PartialEq)]
pub struct AssignmentRow {
    pub id: i64,
    pub vehicle_id: i64,
    pub space_id: i64,
    pub status: AssignmentStatus,
}

/// What the transaction must do for one confirmation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmationPlan {
    /// First confirmation for this visit: create the assignment and
    /// reserve the target space
    Create { reserve: i64 },
    /// Reassignment: repoint the assignment, free the old space (when it
    /// is not already free) and reserve the new one
    Move { free: Option<i64>, reserve: i64 },
    /// Same space confirmed again but its row drifted: correct status /
    /// binding, touch nothing else
    Correct { reserve: i64 },
    /// Same space, already reserved and bound: nothing to do, nothing
    /// to broadcast
    Noop,
}

/// Decide what a confirmation does, given the rows under lock.
/// `old_space` is the row currently targeted by `existing`, when any.
pub fn plan_confirmation(
    vehicle_id: i64,
    existing: Option<&AssignmentRow>,
    target: &SpaceRow,
    old_space: Option<&SpaceRow>,
) -> ConfirmationPlan {
    let Some(assignment) = existing else {
        return ConfirmationPlan::Create { reserve: target.id };
    };

    if assignment.space_id != target.id {
        let free = old_space
            .filter(|s| s.status != SpaceStatus::Free)
            .map(|s| s.id);
        return ConfirmationPlan::Move {
            free,
            reserve: target.id,
        };
    }

    // Same space re-confirmed
    if target.status != SpaceStatus::Reserved || target.current_vehicle_id != Some(vehicle_id) {
        ConfirmationPlan::Correct { reserve: target.id }
    } else {
        ConfirmationPlan::Noop
    }
}

/// Space ids in global lock order (ascending) to avoid deadlock when a
/// confirmation touches two rows
pub fn lock_order(a: i64, b: i64) -> (i64, i64) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn space(id: i64, status: SpaceStatus, vehicle: Option<i64>) -> SpaceRow {
        SpaceRow {
            id,
            zone: "B".into(),
            slot_number: id as u32,
            size_class: SizeClass::Midsize,
            status,
            current_vehicle_id: vehicle,
        }
    }

    fn assignment(space_id: i64) -> AssignmentRow {
        AssignmentRow {
            id: 1,
            vehicle_id: 10,
            space_id,
            status: AssignmentStatus::Assigned,
        }
    }

    #[test]
    fn first_confirmation_creates() {
        let target = space(3, SpaceStatus::Free, None);
        let plan = plan_confirmation(10, None, &target, None);
        assert_eq!(plan, ConfirmationPlan::Create { reserve: 3 });
    }

    #[test]
    fn different_space_moves_and_frees_old() {
        let target = space(5, SpaceStatus::Free, None);
        let old = space(3, SpaceStatus::Reserved, Some(10));
        let plan = plan_confirmation(10, Some(&assignment(3)), &target, Some(&old));
        assert_eq!(
            plan,
            ConfirmationPlan::Move {
                free: Some(3),
                reserve: 5
            }
        );
    }

    #[test]
    fn move_skips_freeing_an_already_free_space() {
        let target = space(5, SpaceStatus::Free, None);
        let old = space(3, SpaceStatus::Free, None);
        let plan = plan_confirmation(10, Some(&assignment(3)), &target, Some(&old));
        assert_eq!(
            plan,
            ConfirmationPlan::Move {
                free: None,
                reserve: 5
            }
        );
    }

    #[test]
    fn same_space_in_line_is_noop() {
        let target = space(3, SpaceStatus::Reserved, Some(10));
        let plan = plan_confirmation(10, Some(&assignment(3)), &target, None);
        assert_eq!(plan, ConfirmationPlan::Noop);
    }

    #[test]
    fn same_space_drifted_status_corrects() {
        let target = space(3, SpaceStatus::Free, None);
        let plan = plan_confirmation(10, Some(&assignment(3)), &target, None);
        assert_eq!(plan, ConfirmationPlan::Correct { reserve: 3 });
    }

    #[test]
    fn same_space_bound_to_other_vehicle_corrects() {
        let target = space(3, SpaceStatus::Reserved, Some(99));
        let plan = plan_confirmation(10, Some(&assignment(3)), &target, None);
        assert_eq!(plan, ConfirmationPlan::Correct { reserve: 3 });
    }

    #[test]
    fn lock_order_is_ascending() {
        assert_eq!(lock_order(7, 3), (3, 7));
        assert_eq!(lock_order(3, 7), (3, 7));
        assert_eq!(lock_order(4, 4), (4, 4));
    }
}
