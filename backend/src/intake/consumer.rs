use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, OwnedSemaphorePermit, RwLock, Semaphore};
use tokio::task::JoinError;
use tracing::{debug, error, info, warn};

use super::message::decode_event;
use super::queue::{Delivery, WorkQueue};
use crate::config::{ConsumerSettings, DetectionMode};
use crate::error::{PipelineError, PipelineResult};
use crate::pipeline::{DetectionOutcome, DetectionScheduler, DetectionTicket, StepResult};
use crate::shutdown::ShutdownSignal;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    pub received: u64,
    pub acked: u64,
    pub requeued: u64,
    pub dropped: u64,
    pub panics: u64,
    pub followups: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Ack,
    Requeue,
    Drop,
}

/// Pulls intelligence events off the work queue and runs one worker per
/// event, at most `max_concurrent` at a time.
pub struct IntelligenceConsumer {
    queue: Arc<dyn WorkQueue>,
    scheduler: Arc<DetectionScheduler>,
    settings: ConsumerSettings,
    mode: DetectionMode,
    semaphore: Arc<Semaphore>,
    shutdown: ShutdownSignal,
    stats: Arc<RwLock<ConsumerStats>>,
    followup_tx: mpsc::UnboundedSender<DetectionTicket>,
    followup_rx: Mutex<Option<mpsc::UnboundedReceiver<DetectionTicket>>>,
}

impl IntelligenceConsumer {
    pub fn new(
        queue: Arc<dyn WorkQueue>,
        scheduler: Arc<DetectionScheduler>,
        settings: ConsumerSettings,
        mode: DetectionMode,
        shutdown: ShutdownSignal,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(settings.max_concurrent.max(1)));
        let (followup_tx, followup_rx) = mpsc::unbounded_channel();
        Self {
            queue,
            scheduler,
            settings,
            mode,
            semaphore,
            shutdown,
            stats: Arc::new(RwLock::new(ConsumerStats::default())),
            followup_tx,
            followup_rx: Mutex::new(Some(followup_rx)),
        }
    }

    pub async fn stats(&self) -> ConsumerStats {
        self.stats.read().await.clone()
    }

    /// Runs until the shutdown signal fires, then waits for in-flight work.
    pub async fn run(self: Arc<Self>) -> PipelineResult<()> {
        let receiver = self
            .followup_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| PipelineError::Queue("consumer is already running".to_string()))?;

        info!(
            queue = %self.settings.queue_name,
            max_concurrent = self.settings.max_concurrent,
            mode = ?self.mode,
            "Intelligence consumer started"
        );

        match self.queue.recover_in_flight().await {
            Ok(0) => {}
            Ok(moved) => info!(moved, "Recovered unacked deliveries from a previous run"),
            Err(e) => warn!(error = %e, "Failed to recover unacked deliveries"),
        }

        let followups = tokio::spawn(self.clone().followup_loop(receiver));
        let wait = Duration::from_secs(self.settings.receive_timeout_secs.max(1));

        loop {
            // Take a worker slot before pulling, so nothing is received that
            // cannot start right away.
            let permit = tokio::select! {
                permit = self.semaphore.clone().acquire_owned() => permit
                    .map_err(|e| PipelineError::Queue(format!("worker pool closed: {}", e)))?,
                _ = self.shutdown.cancelled() => break,
            };
            if self.shutdown.is_triggered() {
                break;
            }

            match self.queue.receive(wait).await {
                Ok(Some(delivery)) => {
                    self.stats.write().await.received += 1;
                    self.dispatch(delivery, permit);
                }
                Ok(None) => {}
                Err(e) => {
                    error!(error = %e, "Failed to receive from work queue");
                    drop(permit);
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                        _ = self.shutdown.cancelled() => break,
                    }
                }
            }
        }

        if let Err(e) = followups.await {
            error!(error = %e, "Follow-up loop ended abnormally");
        }
        let all = self.settings.max_concurrent.max(1) as u32;
        let _drained = self.semaphore.acquire_many(all).await;
        info!("Intelligence consumer stopped");
        Ok(())
    }

    /// Spawns the worker plus a supervisor that settles the delivery from
    /// the worker's exit: success acks, a malformed payload is dropped,
    /// errors and panics are redelivered.
    fn dispatch(self: &Arc<Self>, delivery: Delivery, permit: OwnedSemaphorePermit) {
        let consumer = self.clone();
        let worker = tokio::spawn({
            let consumer = consumer.clone();
            let payload = delivery.payload.clone();
            async move { consumer.handle_payload(&payload).await }
        });

        tokio::spawn(async move {
            let _permit = permit;
            let disposition = match worker.await {
                Ok(Ok(())) => Disposition::Ack,
                Ok(Err(PipelineError::MalformedPayload(reason))) => {
                    warn!(tag = delivery.tag, %reason, "Dropping malformed message");
                    Disposition::Drop
                }
                Ok(Err(e)) => {
                    error!(tag = delivery.tag, error = %e, "Processing failed, requeueing");
                    Disposition::Requeue
                }
                Err(join_error) => {
                    consumer.record_panic(join_error).await;
                    Disposition::Requeue
                }
            };
            consumer.settle(&delivery, disposition).await;
        });
    }

    async fn handle_payload(&self, payload: &str) -> PipelineResult<()> {
        let event = decode_event(payload.as_bytes())?;
        info!(event_id = %event.event_id, names = event.candidate_names.len(), "Processing intelligence event");

        match self.mode {
            DetectionMode::Inline => {
                self.scheduler.process_event(&event).await?;
            }
            DetectionMode::Deferred => {
                if let Some(ticket) = self.scheduler.begin(&event).await? {
                    self.schedule_followup(ticket, self.scheduler.interval());
                }
            }
        }
        Ok(())
    }

    /// Re-enqueues `ticket` after `delay`. On shutdown the loop is finished
    /// as cancelled instead.
    fn schedule_followup(&self, ticket: DetectionTicket, delay: Duration) {
        let shutdown = self.shutdown.clone();
        let sender = self.followup_tx.clone();
        let scheduler = self.scheduler.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    if let Err(returned) = sender.send(ticket) {
                        finish_cancelled(&scheduler, returned.0).await;
                    }
                }
                _ = shutdown.cancelled() => finish_cancelled(&scheduler, ticket).await,
            }
        });
    }

    async fn followup_loop(self: Arc<Self>, mut receiver: mpsc::UnboundedReceiver<DetectionTicket>) {
        loop {
            let ticket = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                ticket = receiver.recv() => match ticket {
                    Some(ticket) => ticket,
                    None => break,
                },
            };

            let permit = match self.semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    finish_cancelled(&self.scheduler, ticket).await;
                    break;
                }
            };
            self.stats.write().await.followups += 1;

            let consumer = self.clone();
            let fallback = ticket.clone();
            let worker = tokio::spawn({
                let scheduler = self.scheduler.clone();
                async move { scheduler.step(ticket).await }
            });
            tokio::spawn(async move {
                let _permit = permit;
                match worker.await {
                    Ok(StepResult::Continue { ticket, delay }) => consumer.schedule_followup(ticket, delay),
                    Ok(StepResult::Finished { ticket, outcome }) => {
                        consumer.scheduler.finish(&ticket, &outcome).await;
                    }
                    Err(join_error) => {
                        consumer.record_panic(join_error).await;
                        finish_cancelled(&consumer.scheduler, fallback).await;
                    }
                }
            });
        }

        while let Ok(ticket) = receiver.try_recv() {
            finish_cancelled(&self.scheduler, ticket).await;
        }
        debug!("Follow-up loop stopped");
    }

    async fn record_panic(&self, join_error: JoinError) {
        self.stats.write().await.panics += 1;
        match join_error.try_into_panic() {
            Ok(payload) => {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".to_string());
                error!(panic = %message, "Worker panicked");
            }
            Err(join_error) => error!(error = %join_error, "Worker was cancelled"),
        }
    }

    async fn settle(&self, delivery: &Delivery, disposition: Disposition) {
        let result = match disposition {
            Disposition::Ack => self.queue.ack(delivery).await,
            Disposition::Requeue => self.queue.nack(delivery, true).await,
            Disposition::Drop => self.queue.nack(delivery, false).await,
        };
        if let Err(e) = result {
            error!(tag = delivery.tag, ?disposition, error = %e, "Failed to settle delivery");
            return;
        }

        let mut stats = self.stats.write().await;
        match disposition {
            Disposition::Ack => stats.acked += 1,
            Disposition::Requeue => stats.requeued += 1,
            Disposition::Drop => stats.dropped += 1,
        }
    }
}

async fn finish_cancelled(scheduler: &DetectionScheduler, ticket: DetectionTicket) {
    let outcome = DetectionOutcome::Cancelled {
        iterations: ticket.completed,
    };
    scheduler.finish(&ticket, &outcome).await;
}
