//! Retrying dispatcher
//!
//! Delivers events to a [`Handler`], retries failed attempts up to the configured
//! budget and moves exhausted events into the dead-letter store. Every attempt is
//! reported to a [`RecordSink`] as an [`ExecutionRecord`].

mod backoff;
mod handler;

pub use backoff::RetryDelay;
pub use handler::{handler_fn, FnHandler, Handler, ShouldFailHandler};

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use futures::FutureExt;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::collector::RecordSink;
use crate::config::DispatcherConfig;
use crate::dlq::DeadLetterStore;
use crate::error::{Error, Result};
use crate::models::{
    AttemptOutcome, DeadLetterRecord, DeliveryAttempt, DeliveryOutcome, DispatchedEvent, Event,
    ExecutionRecord, FailureReason,
};

/// Totals of a [`Dispatcher::run`] loop
#[derive(Debug, Default)]
pub struct DispatchSummary {
    /// Events the handler accepted
    pub delivered: u64,
    /// Events moved to the dead-letter store
    pub dead_lettered: u64,
    /// Events handed back because of cancellation
    pub cancelled: Vec<DispatchedEvent>,
    /// Events still queued when the loop stopped; never attempted
    pub unsent: Vec<Event>,
}

impl DispatchSummary {
    /// Number of events the loop accounted for
    pub fn total(&self) -> u64 {
        self.delivered
            + self.dead_lettered
            + self.cancelled.len() as u64
            + self.unsent.len() as u64
    }
}

/// Delivers events to a handler with bounded retries
pub struct Dispatcher {
    config: DispatcherConfig,
    handler: Arc<dyn Handler>,
    store: Arc<dyn DeadLetterStore>,
    sink: Arc<dyn RecordSink>,
    sequence: AtomicU64,
}

impl Dispatcher {
    /// Create a new dispatcher
    pub fn new(
        config: DispatcherConfig,
        handler: Arc<dyn Handler>,
        store: Arc<dyn DeadLetterStore>,
        sink: Arc<dyn RecordSink>,
    ) -> Self {
        Self {
            config,
            handler,
            store,
            sink,
            sequence: AtomicU64::new(1),
        }
    }

    /// Dispatcher configuration
    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Total attempts per event
    pub fn max_attempts(&self) -> u32 {
        self.config.max_retries.saturating_add(1)
    }

    /// Deliver one event, retrying until it succeeds or the budget is spent
    pub async fn dispatch(&self, event: Event) -> Result<DeliveryOutcome> {
        self.dispatch_with_cancel(event, &CancellationToken::new())
            .await
    }

    /// Deliver one event; `cancel` is honored between attempts only
    pub async fn dispatch_with_cancel(
        &self,
        event: Event,
        cancel: &CancellationToken,
    ) -> Result<DeliveryOutcome> {
        let dispatched = DispatchedEvent {
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
            received_at: Utc::now(),
            event,
        };
        let sequence = dispatched.sequence;
        let max_attempts = self.max_attempts();
        let mut last_failure: Option<FailureReason> = None;

        for attempt in 0..max_attempts {
            if attempt > 0 {
                let delay = self.config.retry_delay.delay_for(attempt);
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => {}
                    () = tokio::time::sleep(delay) => {}
                }
            }

            if cancel.is_cancelled() {
                info!(sequence, attempts = attempt, "Dispatch cancelled between attempts");
                return Ok(DeliveryOutcome::Cancelled {
                    sequence,
                    attempts: attempt,
                    event: Box::new(dispatched),
                });
            }

            let outcome = self.attempt(&dispatched).await;
            let delivery = DeliveryAttempt {
                sequence,
                attempt,
                outcome,
                timestamp: Utc::now(),
            };
            self.report(&dispatched, &delivery).await;

            match delivery.outcome {
                AttemptOutcome::Success => {
                    debug!(sequence, attempt, "Event delivered");
                    return Ok(DeliveryOutcome::Delivered {
                        sequence,
                        attempts: attempt + 1,
                    });
                }
                AttemptOutcome::Failure(reason) => {
                    warn!(
                        sequence,
                        attempt,
                        remaining = max_attempts - attempt - 1,
                        reason = %reason,
                        "Handler attempt failed"
                    );
                    last_failure = Some(reason);
                }
            }
        }

        let Some(reason) = last_failure else {
            return Err(Error::internal("retry loop finished without any attempt"));
        };

        self.dead_letter(dispatched, reason, max_attempts).await
    }

    /// Consume events until the channel closes or `cancel` fires.
    ///
    /// Events are dispatched concurrently up to `max_concurrency`. The first fatal
    /// error cancels the remaining dispatches and is returned once they settle.
    /// On cancellation the channel is closed and whatever it still buffers is
    /// returned in [`DispatchSummary::unsent`].
    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::Receiver<Event>,
        cancel: CancellationToken,
    ) -> Result<DispatchSummary> {
        let permits = Arc::new(Semaphore::new(self.config.max_concurrency));
        let inflight = cancel.child_token();
        let mut tasks: JoinSet<Result<DeliveryOutcome>> = JoinSet::new();
        let mut summary = DispatchSummary::default();
        let mut fatal: Option<Error> = None;

        info!(
            max_concurrency = self.config.max_concurrency,
            max_retries = self.config.max_retries,
            "Dispatcher started"
        );

        loop {
            tokio::select! {
                biased;
                () = inflight.cancelled() => break,
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = tally(joined, &mut summary) {
                        error!(error = %e, "Fatal dispatch error, stopping dispatcher");
                        inflight.cancel();
                        fatal = Some(e);
                        break;
                    }
                }
                received = events.recv() => {
                    let Some(event) = received else { break };
                    let permit = tokio::select! {
                        biased;
                        () = inflight.cancelled() => None,
                        permit = permits.clone().acquire_owned() => {
                            Some(permit.map_err(|e| Error::internal(e.to_string()))?)
                        }
                    };
                    let Some(permit) = permit else {
                        summary.unsent.push(event);
                        break;
                    };
                    let dispatcher = Arc::clone(&self);
                    let token = inflight.clone();
                    tasks.spawn(async move {
                        let outcome = dispatcher.dispatch_with_cancel(event, &token).await;
                        drop(permit);
                        outcome
                    });
                }
            }
        }

        events.close();
        while let Ok(event) = events.try_recv() {
            summary.unsent.push(event);
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = tally(joined, &mut summary) {
                error!(error = %e, "Fatal dispatch error while draining");
                inflight.cancel();
                fatal.get_or_insert(e);
            }
        }

        info!(
            delivered = summary.delivered,
            dead_lettered = summary.dead_lettered,
            cancelled = summary.cancelled.len(),
            unsent = summary.unsent.len(),
            "Dispatcher stopped"
        );

        match fatal {
            Some(e) => Err(e),
            None => Ok(summary),
        }
    }

    /// Run one attempt under the hard timeout, catching panics
    async fn attempt(&self, event: &DispatchedEvent) -> AttemptOutcome {
        let call = AssertUnwindSafe(self.handler.handle(event)).catch_unwind();

        match tokio::time::timeout(self.config.attempt_timeout, call).await {
            Ok(Ok(Ok(()))) => AttemptOutcome::Success,
            Ok(Ok(Err(reason))) => AttemptOutcome::Failure(reason),
            Ok(Err(panic)) => AttemptOutcome::Failure(FailureReason::Panicked(panic_message(&panic))),
            Err(_) => AttemptOutcome::Failure(FailureReason::Timeout(self.config.attempt_timeout)),
        }
    }

    /// Emit the execution record and self-monitoring counters for an attempt
    async fn report(&self, event: &DispatchedEvent, attempt: &DeliveryAttempt) {
        let component = self.config.component.clone();
        metrics::counter!("deadletter_dispatch_attempts_total", "component" => component.clone())
            .increment(1);
        if let AttemptOutcome::Failure(reason) = &attempt.outcome {
            metrics::counter!(
                "deadletter_dispatch_failures_total",
                "component" => component,
                "reason" => reason.kind()
            )
            .increment(1);
        }

        let record = ExecutionRecord::for_attempt(&self.config.component, event, attempt);
        if let Err(e) = self.sink.emit(record).await {
            warn!(sequence = event.sequence, error = %e, "Failed to emit execution record");
        }
    }

    /// Move an exhausted event into the store; failure here is fatal
    async fn dead_letter(
        &self,
        event: DispatchedEvent,
        reason: FailureReason,
        attempts: u32,
    ) -> Result<DeliveryOutcome> {
        let sequence = event.sequence;
        let record = DeadLetterRecord::new(event, reason, attempts);
        let record_id = record.id;

        if let Err(e) = self.store.enqueue(record).await {
            error!(sequence, error = %e, "Failed to dead-letter exhausted event");
            return Err(match e {
                Error::StorageUnavailable(_) => e,
                other => Error::storage(other.to_string()),
            });
        }

        metrics::counter!(
            "deadletter_dead_lettered_total",
            "component" => self.config.component.clone()
        )
        .increment(1);
        warn!(sequence, attempts, record_id = %record_id, "Event moved to dead-letter store");

        Ok(DeliveryOutcome::DeadLettered {
            sequence,
            attempts,
            record_id,
        })
    }
}

fn tally(
    joined: std::result::Result<Result<DeliveryOutcome>, tokio::task::JoinError>,
    summary: &mut DispatchSummary,
) -> Result<()> {
    match joined.map_err(|e| Error::internal(format!("dispatch task failed: {e}")))?? {
        DeliveryOutcome::Delivered { .. } => summary.delivered += 1,
        DeliveryOutcome::DeadLettered { .. } => summary.dead_lettered += 1,
        DeliveryOutcome::Cancelled { event, .. } => summary.cancelled.push(*event),
    }
    Ok(())
}

fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
