// Shared fixtures for the durability integration tests.

#![allow(dead_code)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use url::Url;
use uuid::Uuid;
use wharf_core::{DurabilitySettings, ManualClock};
use wharf_durability::{
    DeliveryOutcome, DurableNode, HandlerContext, HandlerError, HandlerRegistry, MessageHandler,
};
use wharf_store::{Envelope, InMemoryMessageStore};

/// Print logs when `RUST_LOG` is set.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub type Outcomes = mpsc::UnboundedReceiver<(Uuid, DeliveryOutcome)>;

pub fn orders() -> Url {
    Url::parse("local://orders").unwrap()
}

pub fn invoices() -> Url {
    Url::parse("local://invoices").unwrap()
}

/// Store and clock shared by every simulated node.
pub fn cluster() -> (InMemoryMessageStore, ManualClock) {
    let clock = ManualClock::starting_now();
    let store = InMemoryMessageStore::new().with_clock(Arc::new(clock.clone()));
    (store, clock)
}

/// Records the id of every envelope it handles.
#[derive(Default)]
pub struct Recorder {
    pub handled: Mutex<Vec<Uuid>>,
}

impl Recorder {
    pub fn count(&self, id: Uuid) -> usize {
        self.handled
            .lock()
            .unwrap()
            .iter()
            .filter(|seen| **seen == id)
            .count()
    }

    pub fn total(&self) -> usize {
        self.handled.lock().unwrap().len()
    }
}

#[async_trait]
impl MessageHandler for Recorder {
    async fn handle(
        &self,
        envelope: &Envelope,
        _context: &mut HandlerContext,
    ) -> Result<(), HandlerError> {
        self.handled.lock().unwrap().push(envelope.id);
        Ok(())
    }
}

/// Always fails.
pub struct Declining;

#[async_trait]
impl MessageHandler for Declining {
    async fn handle(
        &self,
        _envelope: &Envelope,
        _context: &mut HandlerContext,
    ) -> Result<(), HandlerError> {
        Err(HandlerError::new("PaymentDeclined", "card refused"))
    }
}

/// Answers every order with an invoice.
pub struct Invoicing;

#[async_trait]
impl MessageHandler for Invoicing {
    async fn handle(
        &self,
        envelope: &Envelope,
        context: &mut HandlerContext,
    ) -> Result<(), HandlerError> {
        context.send(
            Envelope::new("InvoiceRequested", envelope.data.clone(), invoices())
                .with_correlation_id(envelope.id.to_string()),
        );
        Ok(())
    }
}

pub fn handlers(recorder: &Arc<Recorder>) -> HandlerRegistry {
    HandlerRegistry::new()
        .with_handler("OrderPlaced", recorder.clone())
        .with_handler("InvoiceRequested", recorder.clone())
        .with_handler("PaymentTaken", Arc::new(Declining))
}

/// Start a node listening on `local://orders` and `local://invoices`, with
/// timers off so tests drive every action.
pub async fn start_node(
    store: &InMemoryMessageStore,
    clock: &ManualClock,
    handlers: HandlerRegistry,
) -> (DurableNode, Outcomes) {
    let (observer, outcomes) = mpsc::unbounded_channel();
    let node = DurableNode::builder(Arc::new(store.clone()))
        .with_settings(DurabilitySettings::for_testing())
        .with_clock(Arc::new(clock.clone()))
        .with_handlers(handlers)
        .with_local_queue(orders())
        .with_local_queue(invoices())
        .with_delivery_observer(observer)
        .without_timers()
        .start()
        .await
        .unwrap();
    (node, outcomes)
}

pub async fn next_outcome(outcomes: &mut Outcomes) -> (Uuid, DeliveryOutcome) {
    tokio::time::timeout(Duration::from_secs(5), outcomes.recv())
        .await
        .expect("no delivery within five seconds")
        .expect("delivery queue closed")
}

/// Assert nothing else is delivered for a short while.
pub async fn assert_quiet(outcomes: &mut Outcomes) {
    let next = tokio::time::timeout(Duration::from_millis(200), outcomes.recv()).await;
    assert!(next.is_err(), "unexpected delivery: {next:?}");
}

pub fn order() -> Envelope {
    Envelope::new("OrderPlaced", br#"{"sku":"A-1"}"#.to_vec(), orders())
}
