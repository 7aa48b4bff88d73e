//! Message handlers resolved by message type.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use url::Url;
use wharf_store::Envelope;

use crate::error::HandlerError;

/// Side effects a handler asks for, committed with the handled marker.
#[derive(Debug)]
pub struct HandlerContext {
    now: DateTime<Utc>,
    outgoing: Vec<Envelope>,
}

impl HandlerContext {
    #[must_use]
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now,
            outgoing: Vec::new(),
        }
    }

    /// Time the delivery started.
    #[must_use]
    pub const fn now(&self) -> DateTime<Utc> {
        self.now
    }

    /// Send `envelope` once the handler's work commits.
    pub fn send(&mut self, envelope: Envelope) {
        self.outgoing.push(envelope.with_sent_at(self.now));
    }

    /// Send a new message to `destination` after `delay`.
    pub fn schedule(
        &mut self,
        message_type: impl Into<String>,
        data: impl Into<Vec<u8>>,
        destination: Url,
        delay: Duration,
    ) {
        let envelope = Envelope::new(message_type, data, destination)
            .with_sent_at(self.now)
            .delayed(self.now, delay);
        self.outgoing.push(envelope);
    }

    #[must_use]
    pub fn outgoing(&self) -> &[Envelope] {
        &self.outgoing
    }

    #[must_use]
    pub fn into_outgoing(self) -> Vec<Envelope> {
        self.outgoing
    }
}

/// Application logic for one message type.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handle `envelope`; an error counts as a failed attempt.
    async fn handle(
        &self,
        envelope: &Envelope,
        context: &mut HandlerContext,
    ) -> Result<(), HandlerError>;
}

/// Handlers keyed by message type, fixed once built.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn MessageHandler>>,
}

impl HandlerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `message_type`, replacing any earlier one.
    #[must_use]
    pub fn with_handler(
        mut self,
        message_type: impl Into<String>,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        self.handlers.insert(message_type.into(), handler);
        self
    }

    #[must_use]
    pub fn resolve(&self, message_type: &str) -> Option<Arc<dyn MessageHandler>> {
        self.handlers.get(message_type).cloned()
    }

    #[must_use]
    pub fn message_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    struct Echo;

    #[async_trait]
    impl MessageHandler for Echo {
        async fn handle(
            &self,
            envelope: &Envelope,
            context: &mut HandlerContext,
        ) -> Result<(), HandlerError> {
            context.send(Envelope::new("Echoed", envelope.data.clone(), envelope.destination.clone()));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_registry_resolves_by_message_type() {
        let registry = HandlerRegistry::new().with_handler("Ping", Arc::new(Echo));
        assert_eq!(registry.message_types(), vec!["Ping"]);
        assert!(registry.resolve("Pong").is_none());

        let handler = registry.resolve("Ping").unwrap();
        let envelope = Envelope::new("Ping", b"hi".to_vec(), Url::parse("local://q").unwrap());
        let mut context = HandlerContext::new(Utc::now());
        handler.handle(&envelope, &mut context).await.unwrap();

        assert_eq!(context.outgoing().len(), 1);
        assert_eq!(context.outgoing()[0].data, b"hi".to_vec());
    }

    #[test]
    fn test_send_stamps_delivery_time() {
        let now = Utc::now() - Duration::hours(2);
        let mut context = HandlerContext::new(now);
        context.send(Envelope::new("Pong", Vec::new(), Url::parse("local://q").unwrap()));

        assert_eq!(context.outgoing()[0].sent_at, now);
    }

    #[test]
    fn test_schedule_sets_execution_time() {
        let now = Utc::now();
        let mut context = HandlerContext::new(now);
        context.schedule("Reminder", Vec::new(), Url::parse("local://q").unwrap(), Duration::seconds(30));

        let outgoing = context.into_outgoing();
        assert_eq!(outgoing[0].scheduled_time, Some(now + Duration::seconds(30)));
    }
}
