//! TCP route mapping emitter backed by the routing API

use crate::{ClientError, Result};
use async_trait::async_trait;
use emitter_api::{TcpRouteMapping, TcpRouteMappings};
use emitter_core::{CoreError, TcpMappingEmitter};
use std::time::Duration;
use tracing::{debug, error};
use url::Url;

const CREATE_PATH: &str = "routing/v1/tcp_routes/create";
const DELETE_PATH: &str = "routing/v1/tcp_routes/delete";

/// Posts TCP route mapping registrations and unregistrations
pub struct RoutingApiEmitter {
    client: reqwest::Client,
    base: Url,
}

impl RoutingApiEmitter {
    /// `uri` is the routing API base, e.g. `http://routing-api.service.internal`
    pub fn new(uri: &str, port: u16, timeout: Duration) -> Result<Self> {
        let mut base = Url::parse(uri).map_err(|e| ClientError::InvalidUrl(format!("{}: {}", uri, e)))?;
        base.set_port(Some(port))
            .map_err(|_| ClientError::InvalidUrl(format!("{}: cannot carry a port", uri)))?;
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, base })
    }

    async fn post(&self, path: &str, mappings: &[TcpRouteMapping]) -> Result<()> {
        let url = self
            .base
            .join(path)
            .map_err(|e| ClientError::InvalidUrl(format!("{}: {}", path, e)))?;
        let response = self.client.post(url.clone()).json(mappings).send().await?;
        if !response.status().is_success() {
            return Err(ClientError::Status {
                status: response.status().as_u16(),
                url: url.to_string(),
            });
        }
        debug!(url = %url, count = mappings.len(), "Posted tcp route mappings");
        Ok(())
    }
}

#[async_trait]
impl TcpMappingEmitter for RoutingApiEmitter {
    async fn emit(&self, mappings: &TcpRouteMappings) -> emitter_core::Result<()> {
        let mut failures = Vec::new();

        if !mappings.registrations.is_empty() {
            if let Err(e) = self.post(CREATE_PATH, &mappings.registrations).await {
                error!(error = %e, count = mappings.registrations.len(), "Failed to register tcp routes");
                failures.push(e.to_string());
            }
        }
        if !mappings.unregistrations.is_empty() {
            if let Err(e) = self.post(DELETE_PATH, &mappings.unregistrations).await {
                error!(error = %e, count = mappings.unregistrations.len(), "Failed to unregister tcp routes");
                failures.push(e.to_string());
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(CoreError::Emit(failures.join("; ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::tests::serve_once;

    fn mapping(port: u32) -> TcpRouteMapping {
        TcpRouteMapping {
            router_group_guid: "rg-1".to_string(),
            external_port: port,
            host_ip: "10.0.0.1".to_string(),
            host_port: 61000,
        }
    }

    fn emitter_for(address: &str) -> RoutingApiEmitter {
        let url = Url::parse(address).expect("address");
        let base = format!("http://{}", url.host_str().expect("host"));
        RoutingApiEmitter::new(&base, url.port().expect("port"), Duration::from_secs(5))
            .expect("emitter")
    }

    #[tokio::test]
    async fn test_registrations_are_posted_to_create() {
        let (address, server) = serve_once(200, "application/json", String::new()).await;
        let emitter = emitter_for(&address);

        emitter
            .emit(&TcpRouteMappings {
                registrations: vec![mapping(5000)],
                unregistrations: Vec::new(),
            })
            .await
            .expect("emit");

        let request = server.await.expect("server");
        assert_eq!(request.method, "POST");
        assert_eq!(request.uri, "/routing/v1/tcp_routes/create");
        let posted: serde_json::Value = serde_json::from_str(&request.body).expect("json body");
        assert_eq!(
            posted,
            serde_json::json!([{
                "router_group_guid": "rg-1",
                "port": 5000,
                "backend_ip": "10.0.0.1",
                "backend_port": 61000
            }])
        );
    }

    #[tokio::test]
    async fn test_rejected_unregistration_is_an_error() {
        let (address, server) = serve_once(500, "text/plain", "boom".to_string()).await;
        let emitter = emitter_for(&address);

        let result = emitter
            .emit(&TcpRouteMappings {
                registrations: Vec::new(),
                unregistrations: vec![mapping(5001)],
            })
            .await;
        assert!(matches!(result, Err(CoreError::Emit(_))));

        let request = server.await.expect("server");
        assert_eq!(request.method, "POST");
        assert_eq!(request.uri, "/routing/v1/tcp_routes/delete");
    }

    #[tokio::test]
    async fn test_empty_batch_sends_nothing() {
        let emitter = RoutingApiEmitter::new("http://127.0.0.1", 1, Duration::from_secs(1))
            .expect("emitter");
        emitter.emit(&TcpRouteMappings::default()).await.expect("emit");
    }
}
