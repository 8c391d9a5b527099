//! Plans the clicks needed to move the portal's week view from the week it
//! shows to the week we want.
//!
//! Weeks are compared on a linear axis built from per-year ISO week counts,
//! so crossing a year boundary costs exactly one step whether the year had
//! 52 or 53 weeks.

use crate::errors::SyncError;
use crate::models::period::Period;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Forward,
    Backward,
}

impl Direction {
    pub fn reversed(self) -> Self {
        match self {
            Direction::Forward => Direction::Backward,
            Direction::Backward => Direction::Forward,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NavigationStep {
    pub direction: Direction,
}

/// Steps from `current` to `target`; empty when they are the same week.
/// The direction never changes within one plan.
pub fn plan(current: Period, target: Period) -> Vec<NavigationStep> {
    let delta = current.weeks_until(&target);
    let direction = if delta >= 0 {
        Direction::Forward
    } else {
        Direction::Backward
    };
    // i64 -> usize: week distances between valid periods are small.
    let count = usize::try_from(delta.unsigned_abs()).unwrap_or(usize::MAX);
    vec![NavigationStep { direction }; count]
}

/// Same as [`plan`], starting from raw labels such as `"2025 week 40"` or
/// `"2025-W40"`. Invalid weeks are rejected before planning.
pub fn plan_labels(current: &str, target: &str) -> Result<Vec<NavigationStep>, SyncError> {
    let current: Period = current.parse()?;
    let target: Period = target.parse()?;
    Ok(plan(current, target))
}
