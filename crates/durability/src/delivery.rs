//! In-process delivery of envelopes to their handlers.
//!
//! [`LocalDeliveryQueue`] is both the node's [`LocalQueue`] and the
//! [`ListeningAgent`] for its local destinations. A worker task drains a
//! bounded channel one envelope at a time.
//!
//! Durable envelopes are already stored and owned by this node; the handler
//! runs inside an envelope transaction that commits the handled marker with
//! the handler's outgoing messages. Buffered envelopes were never stored, so
//! the eager idempotency check claims their id before the handler runs.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use wharf_core::{Clock, DurabilitySettings, ResultExt};
use wharf_store::{Envelope, ErrorReport, MessageInbox, MessageStore};

use crate::error::{DurabilityError, DurabilityResult, HandlerError};
use crate::handlers::{HandlerContext, HandlerRegistry};
use crate::outbox::Publisher;
use crate::transport::{BufferingLimits, ListenerStatus, ListeningAgent, LocalQueue};

/// Exception type recorded when no handler exists for a message type.
pub const NO_HANDLER_EXCEPTION: &str = "NoHandlerForMessage";

#[derive(Debug)]
enum Delivery {
    Durable(Envelope),
    Buffered(Envelope),
}

/// What happened to one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Handled,
    /// Past its deliver-by time; marked handled without running the handler
    Expired,
    /// Buffered envelope whose id was already stored
    Duplicate,
    /// Failed and rescheduled for another attempt
    Retried,
    DeadLettered,
}

struct DeliveryWorker {
    store: Arc<dyn MessageStore>,
    handlers: HandlerRegistry,
    publisher: Publisher,
    settings: DurabilitySettings,
    clock: Arc<dyn Clock>,
}

impl DeliveryWorker {
    async fn deliver(&self, delivery: Delivery) -> DurabilityResult<DeliveryOutcome> {
        match delivery {
            Delivery::Durable(envelope) => self.deliver_durable(envelope).await,
            Delivery::Buffered(envelope) => self.deliver_buffered(envelope).await,
        }
    }

    async fn deliver_durable(&self, envelope: Envelope) -> DurabilityResult<DeliveryOutcome> {
        let Some(handler) = self.handlers.resolve(&envelope.message_type) else {
            return self.dead_letter_unhandled(&envelope).await;
        };

        let now = self.clock.now();
        if envelope.is_expired(now) {
            tracing::info!(envelope_id = %envelope.id, "Envelope expired before delivery");
            self.store
                .mark_incoming_handled(std::slice::from_ref(&envelope), self.settings.keep_until(now))
                .await?;
            return Ok(DeliveryOutcome::Expired);
        }

        let mut context = HandlerContext::new(now);
        match handler.handle(&envelope, &mut context).await {
            Ok(()) => {
                let mut tx = self.store.begin_transaction().await?;
                self.publisher
                    .enlist(tx.as_mut(), context.into_outgoing())
                    .await?;
                tx.mark_incoming_handled(&envelope, self.settings.keep_until(now))
                    .await?;
                let committed = tx.commit().await?;
                self.publisher.dispatch(committed).await;
                Ok(DeliveryOutcome::Handled)
            }
            Err(e) => self.record_failure(envelope, &e).await,
        }
    }

    async fn deliver_buffered(&self, envelope: Envelope) -> DurabilityResult<DeliveryOutcome> {
        let Some(handler) = self.handlers.resolve(&envelope.message_type) else {
            return self.dead_letter_unhandled(&envelope).await;
        };

        let now = self.clock.now();
        let mut tx = self.store.begin_transaction().await?;
        if !tx
            .try_make_eager_idempotency_check(&envelope, self.settings.keep_until(now))
            .await?
        {
            tx.rollback().await?;
            return Ok(DeliveryOutcome::Duplicate);
        }

        let mut context = HandlerContext::new(now);
        match handler.handle(&envelope, &mut context).await {
            Ok(()) => {
                self.publisher
                    .enlist(tx.as_mut(), context.into_outgoing())
                    .await?;
                match tx.commit().await {
                    Ok(committed) => {
                        self.publisher.dispatch(committed).await;
                        Ok(DeliveryOutcome::Handled)
                    }
                    Err(e) if self.store.is_duplicate_envelope_error(&e) => {
                        Ok(DeliveryOutcome::Duplicate)
                    }
                    Err(e) => Err(e.into()),
                }
            }
            Err(e) => {
                tx.rollback().await?;
                self.record_failure(envelope, &e).await
            }
        }
    }

    async fn dead_letter_unhandled(&self, envelope: &Envelope) -> DurabilityResult<DeliveryOutcome> {
        tracing::error!(
            envelope_id = %envelope.id,
            message_type = %envelope.message_type,
            "No handler registered, moving to dead letters"
        );
        let report = ErrorReport::new(
            NO_HANDLER_EXCEPTION,
            format!("no handler for message type '{}'", envelope.message_type),
        );
        self.store
            .move_to_dead_letter_storage(
                envelope,
                &report,
                self.settings.dead_letter_expiry(self.clock.now()),
            )
            .await?;
        Ok(DeliveryOutcome::DeadLettered)
    }

    /// Count the failed attempt, then retry later or dead-letter.
    async fn record_failure(
        &self,
        mut envelope: Envelope,
        error: &HandlerError,
    ) -> DurabilityResult<DeliveryOutcome> {
        let now = self.clock.now();
        envelope.attempts = envelope.attempts.saturating_add(1);

        if envelope.attempts >= self.settings.max_processing_attempts {
            tracing::warn!(
                envelope_id = %envelope.id,
                attempts = envelope.attempts,
                error = %error,
                "Processing attempts exhausted, moving to dead letters"
            );
            self.store
                .move_to_dead_letter_storage(
                    &envelope,
                    &ErrorReport::new(&error.kind, &error.message),
                    self.settings.dead_letter_expiry(now),
                )
                .await?;
            return Ok(DeliveryOutcome::DeadLettered);
        }

        let retry_at = now + self.settings.retry_delay(envelope.attempts);
        tracing::info!(
            envelope_id = %envelope.id,
            attempts = envelope.attempts,
            %retry_at,
            error = %error,
            "Handler failed, rescheduling"
        );
        envelope.schedule_at(retry_at);
        self.store.schedule_execution(&envelope).await?;
        Ok(DeliveryOutcome::Retried)
    }
}

/// Bounded in-process queue feeding message handlers.
pub struct LocalDeliveryQueue {
    sender: mpsc::Sender<Delivery>,
    depth: Arc<AtomicUsize>,
    limits: BufferingLimits,
    latched: AtomicBool,
    shutdown: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl LocalDeliveryQueue {
    /// Start the queue and its worker task.
    #[must_use]
    pub fn start(
        store: Arc<dyn MessageStore>,
        handlers: HandlerRegistry,
        publisher: Publisher,
        settings: DurabilitySettings,
        clock: Arc<dyn Clock>,
        limits: BufferingLimits,
    ) -> Arc<Self> {
        Self::start_observed(store, handlers, publisher, settings, clock, limits, None)
    }

    /// Start the queue, reporting every outcome on `observer`.
    #[must_use]
    pub fn start_observed(
        store: Arc<dyn MessageStore>,
        handlers: HandlerRegistry,
        publisher: Publisher,
        settings: DurabilitySettings,
        clock: Arc<dyn Clock>,
        limits: BufferingLimits,
        observer: Option<mpsc::UnboundedSender<(uuid::Uuid, DeliveryOutcome)>>,
    ) -> Arc<Self> {
        let (sender, mut receiver) = mpsc::channel::<Delivery>(limits.maximum.max(1));
        let depth = Arc::new(AtomicUsize::new(0));
        let worker = DeliveryWorker {
            store,
            handlers,
            publisher,
            settings,
            clock,
        };

        let (shutdown, mut stopping) = watch::channel(false);
        let worker_depth = Arc::clone(&depth);
        let handle = tokio::spawn(async move {
            loop {
                let delivery = tokio::select! {
                    biased;
                    _ = stopping.changed() => break,
                    delivery = receiver.recv() => match delivery {
                        Some(delivery) => delivery,
                        None => break,
                    },
                };
                let id = match &delivery {
                    Delivery::Durable(e) | Delivery::Buffered(e) => e.id,
                };
                let delivered = worker
                    .deliver(delivery)
                    .await
                    .inspect_error(|e| tracing::error!(envelope_id = %id, error = %e, "Delivery failed"));
                if let Ok(outcome) = delivered {
                    tracing::debug!(envelope_id = %id, ?outcome, "Delivered envelope");
                    if let Some(observer) = &observer {
                        let _ = observer.send((id, outcome));
                    }
                }
                worker_depth.fetch_sub(1, Ordering::AcqRel);
            }
            tracing::debug!("Local delivery worker stopped");
        });

        Arc::new(Self {
            sender,
            depth,
            limits,
            latched: AtomicBool::new(false),
            shutdown,
            worker: Mutex::new(Some(handle)),
        })
    }

    /// Deliver an envelope that was never persisted.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue is latched or closed.
    pub async fn enqueue_buffered(&self, envelope: Envelope) -> DurabilityResult<()> {
        self.push(Delivery::Buffered(envelope)).await
    }

    fn try_push(&self, delivery: Delivery) -> DurabilityResult<()> {
        if self.latched.load(Ordering::Acquire) {
            return Err(DurabilityError::not_accepting("local delivery queue"));
        }
        self.depth.fetch_add(1, Ordering::AcqRel);
        if self.sender.try_send(delivery).is_err() {
            self.depth.fetch_sub(1, Ordering::AcqRel);
            return Err(DurabilityError::not_accepting("local delivery queue"));
        }
        Ok(())
    }

    async fn push(&self, delivery: Delivery) -> DurabilityResult<()> {
        if self.latched.load(Ordering::Acquire) {
            return Err(DurabilityError::not_accepting("local delivery queue"));
        }
        self.depth.fetch_add(1, Ordering::AcqRel);
        if self.sender.send(delivery).await.is_err() {
            self.depth.fetch_sub(1, Ordering::AcqRel);
            return Err(DurabilityError::not_accepting("local delivery queue"));
        }
        Ok(())
    }

    /// Stop accepting envelopes and wait for the in-flight delivery.
    ///
    /// Envelopes still queued stay owned by this node in the store until
    /// its ownership is released.
    pub async fn stop(&self) {
        self.latched.store(true, Ordering::Release);
        let _ = self.shutdown.send(true);
        let handle = self.worker.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Kill the worker without draining.
    pub fn abort(&self) {
        self.latched.store(true, Ordering::Release);
        if let Ok(mut worker) = self.worker.try_lock() {
            if let Some(handle) = worker.take() {
                handle.abort();
            }
        }
    }
}

#[async_trait]
impl LocalQueue for LocalDeliveryQueue {
    fn capacity(&self) -> usize {
        if self.latched.load(Ordering::Acquire) {
            return 0;
        }
        self.limits
            .maximum
            .saturating_sub(self.queue_count())
            .min(self.sender.capacity())
    }

    async fn enqueue(&self, envelope: Envelope) -> DurabilityResult<()> {
        self.try_push(Delivery::Durable(envelope))
    }
}

#[async_trait]
impl ListeningAgent for LocalDeliveryQueue {
    fn status(&self) -> ListenerStatus {
        if self.latched.load(Ordering::Acquire) {
            ListenerStatus::Latched
        } else if self.queue_count() >= self.limits.maximum {
            ListenerStatus::TooBusy
        } else {
            ListenerStatus::Accepting
        }
    }

    fn queue_count(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }

    fn buffering_limits(&self) -> BufferingLimits {
        self.limits
    }

    async fn enqueue_directly(&self, envelopes: Vec<Envelope>) -> DurabilityResult<()> {
        if envelopes.is_empty() {
            return Ok(());
        }
        if self.latched.load(Ordering::Acquire) {
            return Err(DurabilityError::not_accepting("local delivery queue"));
        }
        let permits = self
            .sender
            .try_reserve_many(envelopes.len())
            .map_err(|_| DurabilityError::not_accepting("local delivery queue"))?;
        self.depth.fetch_add(envelopes.len(), Ordering::AcqRel);
        for (permit, envelope) in permits.zip(envelopes) {
            permit.send(Delivery::Durable(envelope));
        }
        Ok(())
    }
}
