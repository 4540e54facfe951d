//! Cluster event source over HTTP
//!
//! Snapshots come from JSON endpoints; lifecycle events arrive on a
//! long-lived server-sent events stream where the SSE event name is the
//! cluster event type and the data is its JSON payload.

use crate::sse::{SseEvent, SseParser};
use crate::{ClientError, Result};
use async_trait::async_trait;
use emitter_api::{ActualEndpointInfo, ClusterEvent, DesiredRouteInfo, DomainSet};
use emitter_core::{ClusterEventSource, CoreError};
use futures::stream::{self, BoxStream, StreamExt};
use serde::de::DeserializeOwned;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

/// Connection settings for the cluster event source
#[derive(Clone, Debug)]
pub struct SourceConfig {
    pub address: String,
    pub ca_cert_file: Option<PathBuf>,
    pub client_cert_file: Option<PathBuf>,
    pub client_key_file: Option<PathBuf>,
    /// Bound on every request except the event stream
    pub timeout: Duration,
}

impl SourceConfig {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ca_cert_file: None,
            client_cert_file: None,
            client_key_file: None,
            timeout: Duration::from_secs(30),
        }
    }
}

fn client_builder(config: &SourceConfig) -> Result<reqwest::ClientBuilder> {
    let mut builder = reqwest::Client::builder().connect_timeout(config.timeout);

    if let Some(ca_cert_file) = &config.ca_cert_file {
        let pem = std::fs::read(ca_cert_file)?;
        let cert = reqwest::Certificate::from_pem(&pem)
            .map_err(|e| ClientError::Tls(format!("{}: {}", ca_cert_file.display(), e)))?;
        builder = builder.add_root_certificate(cert);
    }

    match (&config.client_cert_file, &config.client_key_file) {
        (Some(cert_file), Some(key_file)) => {
            let mut pem = std::fs::read(cert_file)?;
            pem.push(b'\n');
            pem.extend(std::fs::read(key_file)?);
            let identity = reqwest::Identity::from_pem(&pem)
                .map_err(|e| ClientError::Tls(format!("{}: {}", cert_file.display(), e)))?;
            builder = builder.identity(identity);
        }
        (None, None) => {}
        _ => {
            return Err(ClientError::Tls(
                "client certificate and key must be configured together".to_string(),
            ))
        }
    }

    Ok(builder)
}

pub struct HttpEventSource {
    client: reqwest::Client,
    /// No overall timeout, the event stream stays open indefinitely
    stream_client: reqwest::Client,
    base: Url,
}

impl HttpEventSource {
    pub fn new(config: &SourceConfig) -> Result<Self> {
        let base = Url::parse(&config.address)
            .map_err(|e| ClientError::InvalidUrl(format!("{}: {}", config.address, e)))?;
        let client = client_builder(config)?.timeout(config.timeout).build()?;
        let stream_client = client_builder(config)?.build()?;
        Ok(Self {
            client,
            stream_client,
            base,
        })
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.base
            .join(path)
            .map_err(|e| ClientError::InvalidUrl(format!("{}: {}", path, e)))
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T> {
        debug!(url = %url, "Fetching");
        let response = self.client.get(url.clone()).send().await?;
        if !response.status().is_success() {
            return Err(ClientError::Status {
                status: response.status().as_u16(),
                url: url.to_string(),
            });
        }
        Ok(response.json().await?)
    }
}

struct EventStream {
    body: BoxStream<'static, reqwest::Result<Vec<u8>>>,
    parser: SseParser,
    pending: VecDeque<SseEvent>,
    done: bool,
}

fn decode_events(body: BoxStream<'static, reqwest::Result<Vec<u8>>>) -> BoxStream<'static, emitter_core::Result<ClusterEvent>> {
    let state = EventStream {
        body,
        parser: SseParser::new(),
        pending: VecDeque::new(),
        done: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(event) = state.pending.pop_front() {
                let decoded = ClusterEvent::from_parts(&event.event_type, &event.data)
                    .map_err(CoreError::from);
                return Some((decoded, state));
            }
            if state.done {
                return None;
            }
            match state.body.next().await {
                Some(Ok(chunk)) => {
                    let events = state.parser.push(&chunk);
                    state.pending.extend(events);
                }
                Some(Err(e)) => {
                    state.done = true;
                    return Some((Err(CoreError::EventSource(e.to_string())), state));
                }
                None => return None,
            }
        }
    })
    .boxed()
}

#[async_trait]
impl ClusterEventSource for HttpEventSource {
    async fn subscribe(&self) -> emitter_core::Result<BoxStream<'static, emitter_core::Result<ClusterEvent>>> {
        let url = self.url("v1/events")?;
        let response = self
            .stream_client
            .get(url.clone())
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(ClientError::from)?;
        if !response.status().is_success() {
            return Err(ClientError::Status {
                status: response.status().as_u16(),
                url: url.to_string(),
            }
            .into());
        }

        info!(url = %url, "Streaming cluster events");
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()))
            .boxed();
        Ok(decode_events(body))
    }

    async fn desired_routes(&self) -> emitter_core::Result<Vec<DesiredRouteInfo>> {
        Ok(self.get_json(self.url("v1/desired_routes")?).await?)
    }

    async fn desired_routes_for(
        &self,
        process_guids: &[String],
    ) -> emitter_core::Result<Vec<DesiredRouteInfo>> {
        let mut url = self.url("v1/desired_routes")?;
        url.query_pairs_mut()
            .append_pair("process_guids", &process_guids.join(","));
        Ok(self.get_json(url).await?)
    }

    async fn actual_endpoints(&self) -> emitter_core::Result<Vec<ActualEndpointInfo>> {
        Ok(self.get_json(self.url("v1/actual_endpoints")?).await?)
    }

    async fn domains(&self) -> emitter_core::Result<DomainSet> {
        Ok(self.get_json(self.url("v1/domains")?).await?)
    }
}
