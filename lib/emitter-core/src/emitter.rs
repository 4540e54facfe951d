//! Delivery channels for routing table deltas

use crate::bus::MessageBus;
use crate::{CoreError, Result};
use async_trait::async_trait;
use emitter_api::messages::{REGISTER_SUBJECT, UNREGISTER_SUBJECT};
use emitter_api::{MessagesToEmit, RegistryMessage, TcpRouteMappings};
use futures::stream::{self, StreamExt};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, error};

/// Announces HTTP route registrations to the router fleet
#[async_trait]
pub trait RegistryEmitter: Send + Sync {
    async fn emit(&self, messages: &MessagesToEmit) -> Result<()>;
}

/// Announces TCP route mapping changes to the routing API
#[async_trait]
pub trait TcpMappingEmitter: Send + Sync {
    async fn emit(&self, mappings: &TcpRouteMappings) -> Result<()>;
}

/// Publishes registry messages on the bus with a bounded number of
/// concurrent publishes
pub struct NatsEmitter {
    bus: Arc<dyn MessageBus>,
    workers: usize,
}

impl NatsEmitter {
    pub fn new(bus: Arc<dyn MessageBus>, workers: usize) -> Self {
        Self {
            bus,
            workers: workers.max(1),
        }
    }
}

#[async_trait]
impl RegistryEmitter for NatsEmitter {
    async fn emit(&self, messages: &MessagesToEmit) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }

        let outgoing: Vec<(&'static str, &RegistryMessage)> = messages
            .registration_messages
            .iter()
            .map(|m| (REGISTER_SUBJECT, m))
            .chain(
                messages
                    .unregistration_messages
                    .iter()
                    .map(|m| (UNREGISTER_SUBJECT, m)),
            )
            .collect();
        let total = outgoing.len();
        let failures = AtomicUsize::new(0);

        stream::iter(outgoing)
            .for_each_concurrent(self.workers, |(subject, message)| {
                let failures = &failures;
                async move {
                    let result = match serde_json::to_vec(message) {
                        Ok(payload) => self.bus.publish(subject, None, payload).await,
                        Err(e) => Err(e.into()),
                    };
                    if let Err(e) = result {
                        error!(subject, address = %message.address(), error = %e, "Failed to publish registry message");
                        failures.fetch_add(1, Ordering::Relaxed);
                    }
                }
            })
            .await;

        let failed = failures.into_inner();
        debug!(total, failed, "Emitted registry messages");
        if failed > 0 {
            return Err(CoreError::Emit(format!(
                "{} of {} registry messages failed to publish",
                failed, total
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::LocalBus;
    use std::collections::BTreeMap;

    fn message(host: &str) -> RegistryMessage {
        RegistryMessage {
            host: host.to_string(),
            port: 1234,
            tls_port: None,
            uris: vec!["a.com".to_string()],
            app: "log-guid".to_string(),
            private_instance_id: "instance".to_string(),
            private_instance_index: "0".to_string(),
            route_service_url: None,
            tags: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_publishes_on_register_and_unregister_subjects() {
        let bus = LocalBus::new();
        let mut register = bus.subscribe(REGISTER_SUBJECT).await.expect("subscribe");
        let mut unregister = bus.subscribe(UNREGISTER_SUBJECT).await.expect("subscribe");
        let emitter = NatsEmitter::new(Arc::new(bus), 4);

        let messages = MessagesToEmit {
            registration_messages: vec![message("1.2.3.4"), message("1.2.3.5")],
            unregistration_messages: vec![message("1.2.3.6")],
        };
        emitter.emit(&messages).await.expect("emit");

        let mut registered = Vec::new();
        while let Ok(msg) = register.receiver.try_recv() {
            let decoded: RegistryMessage =
                serde_json::from_slice(&msg.payload).expect("decode");
            registered.push(decoded.host);
        }
        registered.sort();
        assert_eq!(registered, vec!["1.2.3.4", "1.2.3.5"]);

        let msg = unregister.receiver.try_recv().expect("unregistration");
        let decoded: RegistryMessage = serde_json::from_slice(&msg.payload).expect("decode");
        assert_eq!(decoded.host, "1.2.3.6");
    }

    #[tokio::test]
    async fn test_empty_batch_publishes_nothing() {
        let bus = LocalBus::new();
        let mut register = bus.subscribe(REGISTER_SUBJECT).await.expect("subscribe");
        let emitter = NatsEmitter::new(Arc::new(bus), 0);

        emitter.emit(&MessagesToEmit::default()).await.expect("emit");
        assert!(register.receiver.try_recv().is_err());
    }
}
