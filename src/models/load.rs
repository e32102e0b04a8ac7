use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub type LoadId = Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DriverId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DispatcherId(pub String);

impl fmt::Display for DriverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for DispatcherId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum LoadStatus {
    Pending,
    InTransit,
    Completed,
    Cancelled,
}

impl LoadStatus {
    /// Legal lifecycle edges. Completed and Cancelled are terminal.
    pub fn can_transition_to(self, next: LoadStatus) -> bool {
        matches!(
            (self, next),
            (LoadStatus::Pending, LoadStatus::InTransit)
                | (LoadStatus::Pending, LoadStatus::Cancelled)
                | (LoadStatus::InTransit, LoadStatus::Completed)
                | (LoadStatus::InTransit, LoadStatus::Cancelled)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LoadStatus::Pending => "pending",
            LoadStatus::InTransit => "in_transit",
            LoadStatus::Completed => "completed",
            LoadStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for LoadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("illegal transition {from} -> {to}")]
pub struct TransitionError {
    pub from: LoadStatus,
    pub to: LoadStatus,
}

/// Intake payload. Descriptive fields are carried through untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewLoad {
    pub pickup: String,
    pub dropoff: String,
    #[serde(default)]
    pub distance: String,
    #[serde(default)]
    pub price: String,
    #[serde(rename = "type", default)]
    pub load_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intake_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Load {
    pub id: LoadId,
    pub pickup: String,
    pub dropoff: String,
    pub distance: String,
    pub price: String,
    #[serde(rename = "type")]
    pub load_type: String,
    pub status: LoadStatus,
    pub driver_id: Option<DriverId>,
    pub created_at: DateTime<Utc>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub assigned_by: Option<DispatcherId>,
    pub version: u64,
}

impl Load {
    pub fn new(id: LoadId, input: NewLoad, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            pickup: input.pickup,
            dropoff: input.dropoff,
            distance: input.distance,
            price: input.price,
            load_type: input.load_type,
            status: LoadStatus::Pending,
            driver_id: None,
            created_at,
            assigned_at: None,
            assigned_by: None,
            version: 0,
        }
    }

    /// Pending -> InTransit. Sets driver and the one-shot audit fields.
    pub fn assign(
        &mut self,
        driver_id: DriverId,
        dispatcher_id: DispatcherId,
        at: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.check(LoadStatus::InTransit)?;
        self.status = LoadStatus::InTransit;
        self.driver_id = Some(driver_id);
        self.assigned_at = Some(at);
        self.assigned_by = Some(dispatcher_id);
        Ok(())
    }

    pub fn complete(&mut self) -> Result<(), TransitionError> {
        self.check(LoadStatus::Completed)?;
        self.status = LoadStatus::Completed;
        Ok(())
    }

    /// Cancelling drops the driver; `assigned_at`/`assigned_by` stay as audit.
    pub fn cancel(&mut self) -> Result<(), TransitionError> {
        self.check(LoadStatus::Cancelled)?;
        self.status = LoadStatus::Cancelled;
        self.driver_id = None;
        Ok(())
    }

    /// `driver_id` is present iff the load is InTransit or Completed.
    pub fn driver_invariant_holds(&self) -> bool {
        let carries_driver = matches!(self.status, LoadStatus::InTransit | LoadStatus::Completed);
        self.driver_id.is_some() == carries_driver
    }

    fn check(&self, to: LoadStatus) -> Result<(), TransitionError> {
        if self.status.can_transition_to(to) {
            Ok(())
        } else {
            Err(TransitionError {
                from: self.status,
                to,
            })
        }
    }
}

/// Newest first by `created_at`, ties broken by `id` descending.
pub fn newest_first(a: &Load, b: &Load) -> Ordering {
    b.created_at
        .cmp(&a.created_at)
        .then_with(|| b.id.cmp(&a.id))
}

pub fn sort_newest_first(loads: &mut [Load]) {
    loads.sort_by(newest_first);
}
