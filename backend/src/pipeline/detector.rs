use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::service::IntelligencePipeline;
use crate::cache::CacheStore;
use crate::config::DetectionSettings;
use crate::error::PipelineResult;
use crate::shutdown::ShutdownSignal;
use crate::types::InboundEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionState {
    Idle,
    Sleeping { iteration: u32 },
    Iterating { iteration: u32 },
    Cancelled,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionOutcome {
    Completed { iterations: u32 },
    Cancelled { iterations: u32 },
    /// Another worker holds this event's lease.
    Skipped,
    /// The lease expired mid-loop and was taken by another worker.
    LeaseLost { iterations: u32 },
}

/// A detection loop in progress, carried between deferred steps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectionTicket {
    pub event: InboundEvent,
    pub owner: String,
    pub completed: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepResult {
    /// Schedule the ticket again after `delay`.
    Continue { ticket: DetectionTicket, delay: Duration },
    Finished { ticket: DetectionTicket, outcome: DetectionOutcome },
}

/// Re-runs the pipeline for one event at a fixed interval, at most
/// `max_iterations` times, with at most one loop per event across instances.
pub struct DetectionScheduler {
    pipeline: Arc<IntelligencePipeline>,
    store: Arc<dyn CacheStore>,
    settings: DetectionSettings,
    lease_prefix: String,
    shutdown: ShutdownSignal,
}

impl DetectionScheduler {
    pub fn new(
        pipeline: Arc<IntelligencePipeline>,
        store: Arc<dyn CacheStore>,
        settings: DetectionSettings,
        lease_prefix: String,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            pipeline,
            store,
            settings,
            lease_prefix,
            shutdown,
        }
    }

    pub fn pipeline(&self) -> &Arc<IntelligencePipeline> {
        &self.pipeline
    }

    pub fn interval(&self) -> Duration {
        self.settings.interval()
    }

    fn lease_key(&self, event_id: &str) -> String {
        format!("{}{}", self.lease_prefix, event_id)
    }

    fn transition(&self, event_id: &str, state: DetectionState) {
        debug!(event_id, ?state, "Detection state");
    }

    /// Refresh plus the whole loop inside the caller's task. The lease is
    /// released even if an iteration panics; the panic is then resumed.
    pub async fn process_event(&self, event: &InboundEvent) -> PipelineResult<DetectionOutcome> {
        let Some(ticket) = self.begin(event).await? else {
            return Ok(DetectionOutcome::Skipped);
        };
        let owner = ticket.owner.clone();

        match AssertUnwindSafe(self.drive(ticket)).catch_unwind().await {
            Ok((ticket, outcome)) => {
                self.finish(&ticket, &outcome).await;
                Ok(outcome)
            }
            Err(panic) => {
                self.release_owner(&event.event_id, &owner).await;
                std::panic::resume_unwind(panic)
            }
        }
    }

    async fn drive(&self, mut ticket: DetectionTicket) -> (DetectionTicket, DetectionOutcome) {
        loop {
            if self.shutdown.is_triggered() {
                let outcome = self.cancel(&ticket);
                return (ticket, outcome);
            }
            self.transition(
                &ticket.event.event_id,
                DetectionState::Sleeping {
                    iteration: ticket.completed + 1,
                },
            );
            tokio::select! {
                _ = tokio::time::sleep(self.settings.interval()) => {}
                _ = self.shutdown.cancelled() => {}
            }
            match self.step(ticket).await {
                StepResult::Continue { ticket: next, .. } => ticket = next,
                StepResult::Finished { ticket, outcome } => return (ticket, outcome),
            }
        }
    }

    /// Takes the event's lease and refreshes its cached members. `None` when
    /// the lease is held elsewhere. A failed or panicking refresh gives the
    /// lease back.
    pub async fn begin(&self, event: &InboundEvent) -> PipelineResult<Option<DetectionTicket>> {
        let event_id = event.event_id.as_str();
        self.transition(event_id, DetectionState::Idle);

        let owner = Uuid::new_v4().to_string();
        if !self
            .store
            .try_acquire_lease(&self.lease_key(event_id), &owner, self.settings.lease_ttl())
            .await?
        {
            info!(event_id, "Detection already running elsewhere, skipping");
            return Ok(None);
        }

        match AssertUnwindSafe(self.pipeline.refresh_market_data(event_id))
            .catch_unwind()
            .await
        {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                self.release_owner(event_id, &owner).await;
                return Err(e);
            }
            Err(panic) => {
                self.release_owner(event_id, &owner).await;
                std::panic::resume_unwind(panic)
            }
        }

        Ok(Some(DetectionTicket {
            event: event.clone(),
            owner,
            completed: 0,
        }))
    }

    /// Runs the next iteration. Call after the interval has elapsed. The
    /// lease is pushed out by a full `lease_ttl` before each iteration.
    pub async fn step(&self, mut ticket: DetectionTicket) -> StepResult {
        let event_id = ticket.event.event_id.clone();
        if self.shutdown.is_triggered() {
            let outcome = self.cancel(&ticket);
            return StepResult::Finished { ticket, outcome };
        }

        match self
            .store
            .renew_lease(&self.lease_key(&event_id), &ticket.owner, self.settings.lease_ttl())
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                warn!(event_id = %event_id, "Detection lease lost, stopping loop");
                self.transition(&event_id, DetectionState::Terminated);
                let outcome = DetectionOutcome::LeaseLost {
                    iterations: ticket.completed,
                };
                return StepResult::Finished { ticket, outcome };
            }
            Err(e) => warn!(event_id = %event_id, error = %e, "Failed to renew detection lease"),
        }

        let iteration = ticket.completed + 1;
        self.transition(&event_id, DetectionState::Iterating { iteration });
        match self.pipeline.run_iteration(&ticket.event).await {
            Ok(report) => debug!(event_id = %event_id, iteration, ?report, "Detection iteration done"),
            Err(e) => warn!(event_id = %event_id, iteration, error = %e, "Detection iteration aborted"),
        }
        ticket.completed = iteration;

        if iteration >= self.settings.max_iterations {
            self.transition(&event_id, DetectionState::Terminated);
            return StepResult::Finished {
                ticket,
                outcome: DetectionOutcome::Completed { iterations: iteration },
            };
        }
        StepResult::Continue {
            ticket,
            delay: self.settings.interval(),
        }
    }

    /// Logs the outcome and gives the event lease back.
    pub async fn finish(&self, ticket: &DetectionTicket, outcome: &DetectionOutcome) {
        info!(event_id = %ticket.event.event_id, ?outcome, "Detection finished");
        self.release_owner(&ticket.event.event_id, &ticket.owner).await;
    }

    fn cancel(&self, ticket: &DetectionTicket) -> DetectionOutcome {
        let event_id = ticket.event.event_id.as_str();
        self.transition(event_id, DetectionState::Cancelled);
        self.transition(event_id, DetectionState::Terminated);
        DetectionOutcome::Cancelled {
            iterations: ticket.completed,
        }
    }

    async fn release_owner(&self, event_id: &str, owner: &str) {
        if let Err(e) = self.store.release_lease(&self.lease_key(event_id), owner).await {
            warn!(event_id, error = %e, "Failed to release detection lease");
        }
    }
}
