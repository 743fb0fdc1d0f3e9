//! Domain event publishers.

use async_trait::async_trait;
use tracing::debug;

use crate::domain::events::DomainEvent;
use crate::ports::EventPublisher;
use crate::{Result, StorefrontError};

/// Publishes JSON-encoded events on `storefront.<aggregate>.<event>`.
pub struct NatsPublisher { client: async_nats::Client }

impl NatsPublisher {
    pub fn new(client: async_nats::Client) -> Self { Self { client } }
}

#[async_trait]
impl EventPublisher for NatsPublisher {
    async fn publish(&self, event: &DomainEvent) -> Result<()> {
        let payload = serde_json::to_vec(event)?;
        self.client
            .publish(event.subject(), payload.into())
            .await
            .map_err(|e| StorefrontError::Events(e.to_string()))
    }
}

/// Fallback when no broker is configured: events only reach the log.
#[derive(Default)]
pub struct TracingPublisher;

#[async_trait]
impl EventPublisher for TracingPublisher {
    async fn publish(&self, event: &DomainEvent) -> Result<()> {
        let payload = serde_json::to_string(event)?;
        debug!(subject = %event.subject(), %payload, "domain event");
        Ok(())
    }
}
