//! # Saga Coordinator
//!
//! Drives saga definitions over the messaging substrate: COMMAND steps
//! publish through the producer, WAIT_EVENT steps poll the traceability store
//! for the expected event under a deadline. The definition is persisted after
//! every step transition, so a crashed coordinator reloads non-terminal sagas
//! and resumes from the last recorded cursor.
//!
//! Failure of any step moves the saga to `failed` and triggers the reverse
//! compensation walk: every already-completed step carrying a compensation
//! command gets that command published, best effort, tagged
//! `reason=SAGA_COMPENSATION`. The walk always terminates in `compensated`.

use crate::config::{SagaConfig, TopicConfig};
use crate::consumer::handler::MessageHandler;
use crate::consumer::idempotency::{IdempotencyManager, ProcessingStatus};
use crate::messaging::{MessageEnvelope, MessagingError, MessagingResult, Producer};
use crate::saga::definition::{SagaDefinition, SagaStep};
use crate::saga::states::{SagaState, StepStatus, StepType};
use crate::saga::store::SagaStore;
use dashmap::DashMap;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Metadata tag on every compensation command.
pub const COMPENSATION_REASON: &str = "SAGA_COMPENSATION";

/// Consumer-group label on traceability rows written by `handle_event`.
const COORDINATOR_GROUP: &str = "saga-coordinator";

/// Orchestrates saga execution, event routing, and compensation.
pub struct SagaCoordinator {
    store: Arc<dyn SagaStore>,
    producer: Arc<Producer>,
    idempotency: IdempotencyManager,
    config: SagaConfig,
    topics: TopicConfig,
    /// Non-terminal sagas this coordinator is driving, keyed by saga id
    active: DashMap<Uuid, SagaDefinition>,
    /// Externally registered per-event-type handlers
    event_handlers: DashMap<String, Arc<dyn MessageHandler>>,
}

impl SagaCoordinator {
    pub fn new(
        store: Arc<dyn SagaStore>,
        producer: Arc<Producer>,
        idempotency: IdempotencyManager,
        config: SagaConfig,
        topics: TopicConfig,
    ) -> Self {
        Self {
            store,
            producer,
            idempotency,
            config,
            topics,
            active: DashMap::new(),
            event_handlers: DashMap::new(),
        }
    }

    /// Register a handler invoked for every routed event of `event_type`.
    pub fn register_event_handler(
        &self,
        event_type: impl Into<String>,
        handler: Arc<dyn MessageHandler>,
    ) {
        self.event_handlers.insert(event_type.into(), handler);
    }

    pub fn active_saga_count(&self) -> usize {
        self.active.len()
    }

    /// Allocate and persist a new saga in `pending` state.
    pub async fn create_saga(
        &self,
        saga_type: impl Into<String>,
        tenant_id: impl Into<String>,
        steps: Vec<SagaStep>,
        metadata: HashMap<String, serde_json::Value>,
    ) -> MessagingResult<SagaDefinition> {
        let saga = SagaDefinition::new(saga_type, tenant_id, steps, metadata);
        self.store.insert(&saga).await?;
        self.active.insert(saga.saga_id, saga.clone());
        info!(
            saga_id = %saga.saga_id,
            saga_type = %saga.saga_type,
            tenant_id = %saga.tenant_id,
            steps = saga.steps.len(),
            "Saga created"
        );
        Ok(saga)
    }

    /// Execute a saga from its persisted cursor to a terminal state.
    ///
    /// Safe to call again after a crash: execution resumes at
    /// `current_step_index`, never re-running completed steps.
    pub async fn execute_saga(&self, saga_id: Uuid) -> MessagingResult<SagaState> {
        let mut saga = self
            .store
            .load(saga_id)
            .await?
            .ok_or_else(|| MessagingError::saga(saga_id.to_string(), "unknown saga"))?;

        if saga.is_terminal() {
            debug!(saga_id = %saga_id, state = %saga.state, "Saga already terminal");
            return Ok(saga.state);
        }

        saga.state = SagaState::Started;
        self.persist(&mut saga).await?;

        while saga.current_step_index < saga.steps.len() {
            let index = saga.current_step_index;
            let step = saga.steps[index].clone();

            match step.step_type {
                StepType::Command => match self.publish_step_command(&saga, &step).await {
                    Ok(()) => {
                        saga.steps[index].status = StepStatus::Completed;
                        saga.state = SagaState::CommandSent;
                    }
                    Err(err) => {
                        warn!(
                            saga_id = %saga.saga_id,
                            step_id = %step.step_id,
                            error = %err,
                            "Command step failed; compensating"
                        );
                        saga.steps[index].status = StepStatus::Failed;
                        return self.fail_and_compensate(saga, index).await;
                    }
                },
                StepType::WaitEvent => match self.await_step_event(&saga, &step).await {
                    Ok(()) => {
                        saga.steps[index].status = StepStatus::Completed;
                        saga.state = SagaState::EventReceived;
                    }
                    Err(err) => {
                        warn!(
                            saga_id = %saga.saga_id,
                            step_id = %step.step_id,
                            error = %err,
                            "Wait step failed; compensating"
                        );
                        saga.steps[index].status = StepStatus::Failed;
                        return self.fail_and_compensate(saga, index).await;
                    }
                },
                StepType::Compensate => {
                    // Runs only during the reverse walk.
                    debug!(
                        saga_id = %saga.saga_id,
                        step_id = %step.step_id,
                        "Compensation-only step skipped during forward execution"
                    );
                }
            }

            saga.current_step_index += 1;
            self.persist(&mut saga).await?;
        }

        saga.state = SagaState::Completed;
        self.persist(&mut saga).await?;
        self.active.remove(&saga.saga_id);
        info!(saga_id = %saga.saga_id, saga_type = %saga.saga_type, "Saga completed");
        Ok(SagaState::Completed)
    }

    /// Route an inbound event to waiting sagas and registered handlers.
    ///
    /// Writing the `processed` traceability row here is what a WAIT_EVENT
    /// poll observes; events matching no active saga and no handler are
    /// logged and dropped.
    pub async fn handle_event(&self, envelope: &MessageEnvelope) -> MessagingResult<()> {
        let waiting_saga = self
            .active
            .iter()
            .find(|entry| entry.value().correlation_id == envelope.correlation_id)
            .map(|entry| *entry.key());
        let registered = self
            .event_handlers
            .get(&envelope.message_type)
            .map(|entry| entry.value().clone());

        if waiting_saga.is_none() && registered.is_none() {
            debug!(
                message_id = %envelope.message_id,
                event_type = %envelope.message_type,
                correlation_id = %envelope.correlation_id,
                "Event matched no active saga or registered handler; dropped"
            );
            return Ok(());
        }

        self.idempotency
            .record_traceability(
                envelope.message_id,
                &self.topics.events,
                0,
                0,
                COORDINATOR_GROUP,
                ProcessingStatus::Processed,
                Some(envelope.correlation_id),
                Some(&envelope.message_type),
            )
            .await?;

        if let Some(saga_id) = waiting_saga {
            debug!(
                saga_id = %saga_id,
                event_type = %envelope.message_type,
                "Event routed to active saga"
            );
        }

        if let Some(handler) = registered {
            if let Err(err) = handler.handle(envelope).await {
                warn!(
                    event_type = %envelope.message_type,
                    error = %err,
                    "Registered event handler failed"
                );
            }
        }

        Ok(())
    }

    /// Reload every non-terminal saga into the active cache after a restart.
    /// Returns the ids; the caller decides which to re-execute.
    pub async fn recover_active_sagas(&self) -> MessagingResult<Vec<Uuid>> {
        let sagas = self.store.load_active().await?;
        let mut recovered = Vec::with_capacity(sagas.len());
        for saga in sagas {
            info!(
                saga_id = %saga.saga_id,
                state = %saga.state,
                current_step = saga.current_step_index,
                "Recovered active saga"
            );
            recovered.push(saga.saga_id);
            self.active.insert(saga.saga_id, saga);
        }
        Ok(recovered)
    }

    async fn publish_step_command(
        &self,
        saga: &SagaDefinition,
        step: &SagaStep,
    ) -> MessagingResult<()> {
        let command_type = step.command_type.as_deref().ok_or_else(|| {
            MessagingError::saga(
                saga.saga_id.to_string(),
                format!("step {} has no command_type", step.step_id),
            )
        })?;

        let envelope = self.command_envelope(saga, step, command_type);
        let accepted = self.producer.produce_command(&envelope).await?;
        if !accepted {
            return Err(MessagingError::saga(
                saga.saga_id.to_string(),
                format!("command for step {} rejected by producer", step.step_id),
            ));
        }

        info!(
            saga_id = %saga.saga_id,
            step_id = %step.step_id,
            command_type = %command_type,
            target_service = %step.target_service,
            "Saga command published"
        );
        Ok(())
    }

    async fn await_step_event(
        &self,
        saga: &SagaDefinition,
        step: &SagaStep,
    ) -> MessagingResult<()> {
        let event_type = step.expected_event_type.as_deref().ok_or_else(|| {
            MessagingError::saga(
                saga.saga_id.to_string(),
                format!("step {} has no expected_event_type", step.step_id),
            )
        })?;

        let timeout = Duration::from_secs(
            step.timeout_seconds
                .unwrap_or(self.config.default_step_timeout_seconds),
        );
        let deadline = Instant::now() + timeout;
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);

        loop {
            if self
                .idempotency
                .find_processed_event(saga.correlation_id, event_type)
                .await?
                .is_some()
            {
                info!(
                    saga_id = %saga.saga_id,
                    step_id = %step.step_id,
                    event_type = %event_type,
                    "Expected event observed"
                );
                return Ok(());
            }

            if Instant::now() >= deadline {
                return Err(MessagingError::saga(
                    saga.saga_id.to_string(),
                    format!(
                        "timed out after {}s waiting for {event_type}",
                        timeout.as_secs()
                    ),
                ));
            }

            tokio::time::sleep(poll_interval).await;
        }
    }

    /// Mark the saga failed, then walk completed steps in reverse publishing
    /// their compensation commands. Publish failures are logged, never raised;
    /// the walk always ends in `compensated`.
    async fn fail_and_compensate(
        &self,
        mut saga: SagaDefinition,
        failing_index: usize,
    ) -> MessagingResult<SagaState> {
        saga.state = SagaState::Failed;
        self.persist(&mut saga).await?;
        saga.state = SagaState::Compensating;
        self.persist(&mut saga).await?;

        for index in (0..failing_index).rev() {
            if saga.steps[index].status != StepStatus::Completed {
                continue;
            }
            let Some(compensation) = saga.steps[index].compensation_command.clone() else {
                continue;
            };

            let envelope = self
                .command_envelope(&saga, &saga.steps[index], &compensation)
                .with_metadata_entry("reason", json!(COMPENSATION_REASON));

            match self.producer.produce_command(&envelope).await {
                Ok(true) => {
                    info!(
                        saga_id = %saga.saga_id,
                        step_id = %saga.steps[index].step_id,
                        compensation_command = %compensation,
                        "Compensation command published"
                    );
                    saga.steps[index].status = StepStatus::Compensated;
                }
                Ok(false) => {
                    warn!(
                        saga_id = %saga.saga_id,
                        step_id = %saga.steps[index].step_id,
                        "Compensation command not accepted by producer"
                    );
                }
                Err(err) => {
                    warn!(
                        saga_id = %saga.saga_id,
                        step_id = %saga.steps[index].step_id,
                        error = %err,
                        "Compensation command publish failed"
                    );
                }
            }
            self.persist(&mut saga).await?;
        }

        saga.state = SagaState::Compensated;
        self.persist(&mut saga).await?;
        self.active.remove(&saga.saga_id);
        info!(saga_id = %saga.saga_id, "Saga compensated");
        Ok(SagaState::Compensated)
    }

    fn command_envelope(
        &self,
        saga: &SagaDefinition,
        step: &SagaStep,
        command_type: &str,
    ) -> MessageEnvelope {
        MessageEnvelope::new(command_type, saga.tenant_id.as_str(), step.payload.clone())
            .with_correlation_id(saga.correlation_id)
            .with_metadata_entry("saga_id", json!(saga.saga_id))
            .with_metadata_entry("saga_type", json!(saga.saga_type))
            .with_metadata_entry("step_id", json!(step.step_id))
    }

    async fn persist(&self, saga: &mut SagaDefinition) -> MessagingResult<()> {
        saga.updated_at = chrono::Utc::now();
        self.store.update(saga).await?;
        self.active.insert(saga.saga_id, saga.clone());
        Ok(())
    }
}
