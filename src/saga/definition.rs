//! # Saga Definitions
//!
//! A saga is an ordered, immutable list of steps plus the mutable execution
//! cursor and state. Definitions are persisted after every transition so a
//! crashed coordinator can reload and resume from the last recorded step.

use crate::saga::states::{SagaState, StepStatus, StepType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// One step of a saga.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaStep {
    pub step_id: String,
    pub step_type: StepType,
    /// Downstream service this step addresses, for operator visibility
    pub target_service: String,
    /// Command published when the step runs (COMMAND steps)
    pub command_type: Option<String>,
    /// Event that satisfies the step (WAIT_EVENT steps)
    pub expected_event_type: Option<String>,
    /// Command published if this step must be undone
    pub compensation_command: Option<String>,
    /// Per-step deadline; the coordinator default applies when absent
    pub timeout_seconds: Option<u64>,
    pub payload: serde_json::Value,
    pub status: StepStatus,
    pub retry_count: u32,
    pub max_retries: u32,
}

impl SagaStep {
    /// A step that publishes `command_type` to `target_service`.
    pub fn command(
        step_id: impl Into<String>,
        target_service: impl Into<String>,
        command_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            step_id: step_id.into(),
            step_type: StepType::Command,
            target_service: target_service.into(),
            command_type: Some(command_type.into()),
            expected_event_type: None,
            compensation_command: None,
            timeout_seconds: None,
            payload,
            status: StepStatus::Pending,
            retry_count: 0,
            max_retries: 0,
        }
    }

    /// A step that blocks until `expected_event_type` is observed for the
    /// saga's correlation id.
    pub fn wait_event(
        step_id: impl Into<String>,
        target_service: impl Into<String>,
        expected_event_type: impl Into<String>,
    ) -> Self {
        Self {
            step_id: step_id.into(),
            step_type: StepType::WaitEvent,
            target_service: target_service.into(),
            command_type: None,
            expected_event_type: Some(expected_event_type.into()),
            compensation_command: None,
            timeout_seconds: None,
            payload: serde_json::Value::Null,
            status: StepStatus::Pending,
            retry_count: 0,
            max_retries: 0,
        }
    }

    pub fn with_compensation(mut self, compensation_command: impl Into<String>) -> Self {
        self.compensation_command = Some(compensation_command.into());
        self
    }

    pub fn with_timeout(mut self, timeout_seconds: u64) -> Self {
        self.timeout_seconds = Some(timeout_seconds);
        self
    }
}

/// A saga instance: immutable step list, mutable cursor and state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaDefinition {
    pub saga_id: Uuid,
    pub saga_type: String,
    pub tenant_id: String,
    /// Stamped on every command this saga publishes; events carrying it back
    /// are how WAIT_EVENT steps complete
    pub correlation_id: Uuid,
    pub steps: Vec<SagaStep>,
    /// Index of the next step to execute; moves only forward
    pub current_step_index: usize,
    pub state: SagaState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl SagaDefinition {
    pub fn new(
        saga_type: impl Into<String>,
        tenant_id: impl Into<String>,
        steps: Vec<SagaStep>,
        metadata: HashMap<String, serde_json::Value>,
    ) -> Self {
        let now = Utc::now();
        Self {
            saga_id: Uuid::new_v4(),
            saga_type: saga_type.into(),
            tenant_id: tenant_id.into(),
            correlation_id: Uuid::new_v4(),
            steps,
            current_step_index: 0,
            state: SagaState::Pending,
            created_at: now,
            updated_at: now,
            metadata,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_step_builders() {
        let command = SagaStep::command("reserve", "billing", "billing.reserve", json!({"n": 1}))
            .with_compensation("billing.release")
            .with_timeout(30);
        assert_eq!(command.step_type, StepType::Command);
        assert_eq!(command.command_type.as_deref(), Some("billing.reserve"));
        assert_eq!(
            command.compensation_command.as_deref(),
            Some("billing.release")
        );
        assert_eq!(command.timeout_seconds, Some(30));
        assert_eq!(command.status, StepStatus::Pending);

        let wait = SagaStep::wait_event("reserved", "billing", "billing.reserved");
        assert_eq!(wait.step_type, StepType::WaitEvent);
        assert_eq!(wait.expected_event_type.as_deref(), Some("billing.reserved"));
        assert!(wait.command_type.is_none());
    }

    #[test]
    fn test_new_saga_starts_pending() {
        let saga = SagaDefinition::new(
            "order_fulfillment",
            "tenant-1",
            vec![SagaStep::command("ship", "logistics", "logistics.ship", json!({}))],
            HashMap::new(),
        );
        assert_eq!(saga.state, SagaState::Pending);
        assert_eq!(saga.current_step_index, 0);
        assert!(!saga.is_terminal());
    }

    #[test]
    fn test_definition_round_trips_through_json() {
        let saga = SagaDefinition::new(
            "order_fulfillment",
            "tenant-1",
            vec![
                SagaStep::command("ship", "logistics", "logistics.ship", json!({"order": 7}))
                    .with_compensation("logistics.cancel"),
                SagaStep::wait_event("shipped", "logistics", "logistics.shipped"),
            ],
            HashMap::from([("origin".to_string(), json!("api"))]),
        );

        let value = serde_json::to_value(&saga).unwrap();
        let restored: SagaDefinition = serde_json::from_value(value).unwrap();
        assert_eq!(restored.saga_id, saga.saga_id);
        assert_eq!(restored.steps.len(), 2);
        assert_eq!(restored.state, SagaState::Pending);
        assert_eq!(restored.metadata["origin"], json!("api"));
    }
}
