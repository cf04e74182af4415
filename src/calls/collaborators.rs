//! Roster and call history collaborators.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jinglecore::address::Address;
use jinglecore::protocol::SessionId;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[async_trait]
pub trait Roster: Send + Sync {
    /// True when `peer` (a bare address) is a known contact.
    async fn is_trusted(&self, peer: &Address) -> bool;

    /// Number of our other online devices able to take calls.
    async fn own_devices_with_call_support(&self) -> usize;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallDirection {
    Incoming,
    Outgoing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallOutcome {
    Success { duration: Duration },
    Missed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallLogEntry {
    /// Bare address of the other party.
    pub peer: Address,
    pub session_id: SessionId,
    pub direction: CallDirection,
    pub outcome: CallOutcome,
    pub recorded_at: DateTime<Utc>,
}

#[async_trait]
pub trait CallLog: Send + Sync {
    async fn record(&self, entry: CallLogEntry);
}
