//! Route emitter core
//!
//! This library provides:
//! - RoutingTable: desired routes joined with live endpoints, producing
//!   registration deltas on every mutation
//! - EventHandler: applies cluster events and full syncs to the table
//! - Syncer: sync and emit signals driven by the router greeting protocol
//! - Watcher: the single loop serializing events, syncs and emits
//! - Emitter, bus, event source and metrics seams

pub mod bus;
pub mod emitter;
pub mod endpoint;
pub mod error;
pub mod handler;
pub mod metrics;
pub mod routing_table;
pub mod source;
pub mod syncer;
pub mod watcher;

pub use bus::{BusMessage, LocalBus, MessageBus, Subscription};
pub use emitter::{NatsEmitter, RegistryEmitter, TcpMappingEmitter};
pub use endpoint::{DesiredRoutes, Endpoint, EndpointKey, RoutingKey};
pub use error::{CoreError, Result};
pub use handler::EventHandler;
pub use metrics::{MetricsSink, NoopMetrics, PrometheusMetrics};
pub use routing_table::{RouteDelta, RoutingTable};
pub use source::{ClusterEventSource, Snapshot};
pub use syncer::{Syncer, SyncerEvents};
pub use watcher::Watcher;
