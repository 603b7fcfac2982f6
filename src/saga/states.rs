//! # Saga State Machine
//!
//! Snake_case string states, stored verbatim in the `sagas` table and in the
//! serialized step list. Transitions:
//!
//! ```text
//! pending -> started -> {command_sent <-> event_received}* -> completed
//!                                      \-> failed -> compensating -> compensated
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle state of a saga.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SagaState {
    Pending,
    Started,
    CommandSent,
    EventReceived,
    Completed,
    Failed,
    Compensating,
    Compensated,
}

impl SagaState {
    /// Terminal states are never left; the coordinator drops the saga from
    /// its active cache once one is persisted.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Compensated)
    }
}

impl fmt::Display for SagaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Started => "started",
            Self::CommandSent => "command_sent",
            Self::EventReceived => "event_received",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Compensating => "compensating",
            Self::Compensated => "compensated",
        };
        write!(f, "{s}")
    }
}

impl FromStr for SagaState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "started" => Ok(Self::Started),
            "command_sent" => Ok(Self::CommandSent),
            "event_received" => Ok(Self::EventReceived),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "compensating" => Ok(Self::Compensating),
            "compensated" => Ok(Self::Compensated),
            _ => Err(format!("Invalid saga state: {s}")),
        }
    }
}

/// What a step does when the coordinator reaches it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    /// Publish a command to a downstream service
    Command,
    /// Block until the expected event is observed, or time out
    WaitEvent,
    /// Runs only during the reverse compensation walk
    Compensate,
}

/// Execution status of one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Completed,
    Failed,
    Compensated,
}
