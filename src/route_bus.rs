//! Route change broadcast
//!
//! Delivery is at-most-once and unordered. A node that misses a message
//! stays stale until its next reload.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::lock_utils::lock_or_recover;
use crate::route::RouteUpdateEvent;

#[async_trait]
pub trait RouteEventBus: Send + Sync {
    /// Fire a route change at every subscribed node, including this one
    async fn publish(&self, event: &RouteUpdateEvent) -> Result<()>;

    /// Start receiving route changes
    async fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<RouteUpdateEvent>>;
}

/// Configuration for the NATS route channel
#[derive(Debug, Clone)]
pub struct NatsBusConfig {
    /// NATS server URL (e.g., "nats://localhost:4222")
    pub server_url: String,
    /// Subject route changes are published on
    pub subject: String,
}

impl Default for NatsBusConfig {
    fn default() -> Self {
        Self {
            server_url: "nats://localhost:4222".to_string(),
            subject: "aegis.gateway.routes".to_string(),
        }
    }
}

/// Core NATS publish/subscribe (no JetStream: route sync is best-effort)
pub struct NatsRouteBus {
    client: async_nats::Client,
    subject: String,
}

impl NatsRouteBus {
    pub async fn connect(config: NatsBusConfig) -> Result<Self> {
        info!("Connecting route bus to NATS server: {}", config.server_url);

        let client = async_nats::connect(config.server_url.as_str())
            .await
            .context("Failed to connect to NATS server")?;

        info!("Route bus connected, subject: {}", config.subject);

        Ok(Self {
            client,
            subject: config.subject,
        })
    }
}

#[async_trait]
impl RouteEventBus for NatsRouteBus {
    async fn publish(&self, event: &RouteUpdateEvent) -> Result<()> {
        let json = event.to_json()?;
        self.client
            .publish(self.subject.clone(), json.into())
            .await
            .context("Failed to publish route event")?;

        debug!("Published {} event to {}", event.op_type, self.subject);
        Ok(())
    }

    async fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<RouteUpdateEvent>> {
        let mut subscriber = self
            .client
            .subscribe(self.subject.clone())
            .await
            .context("Failed to subscribe to route subject")?;

        info!("Subscribed to route events on subject: {}", self.subject);

        let (tx, rx) = mpsc::unbounded_channel();
        let subject = self.subject.clone();

        tokio::spawn(async move {
            while let Some(msg) = subscriber.next().await {
                match RouteUpdateEvent::from_json(&msg.payload) {
                    Ok(event) => {
                        if tx.send(event).is_err() {
                            debug!("Route event receiver dropped, stopping subscription");
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("Dropping undecodable route event on {}: {}", subject, e);
                    }
                }
            }
            info!("Route subscription on {} ended", subject);
        });

        Ok(rx)
    }
}

/// In-process fan-out, for single-node deployments and tests
#[derive(Default)]
pub struct LocalRouteBus {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<RouteUpdateEvent>>>,
}

impl LocalRouteBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscriber_count(&self) -> usize {
        lock_or_recover(&self.subscribers, "local route bus").len()
    }
}

#[async_trait]
impl RouteEventBus for LocalRouteBus {
    async fn publish(&self, event: &RouteUpdateEvent) -> Result<()> {
        let mut subscribers = lock_or_recover(&self.subscribers, "local route bus");
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        debug!(
            "Published {} event to {} local subscribers",
            event.op_type,
            subscribers.len()
        );
        Ok(())
    }

    async fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<RouteUpdateEvent>> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock_or_recover(&self.subscribers, "local route bus").push(tx);
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_bus_fans_out_to_every_subscriber() {
        let bus = LocalRouteBus::new();
        let mut a = bus.subscribe().await.unwrap();
        let mut b = bus.subscribe().await.unwrap();

        bus.publish(&RouteUpdateEvent::delete("svc-a")).await.unwrap();

        assert_eq!(a.recv().await.unwrap(), RouteUpdateEvent::delete("svc-a"));
        assert_eq!(b.recv().await.unwrap(), RouteUpdateEvent::delete("svc-a"));
    }

    #[tokio::test]
    async fn test_local_bus_forgets_closed_subscribers() {
        let bus = LocalRouteBus::new();
        let a = bus.subscribe().await.unwrap();
        let _b = bus.subscribe().await.unwrap();
        drop(a);

        bus.publish(&RouteUpdateEvent::reload()).await.unwrap();
        assert_eq!(bus.subscriber_count(), 1);
    }
}
