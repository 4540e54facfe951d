//! HTTP adapters for the route emitter
//!
//! This library provides:
//! - HttpEventSource: cluster snapshots over JSON and lifecycle events over
//!   server-sent events
//! - RoutingApiEmitter: TCP route mapping changes posted to the routing API

pub mod error;
pub mod routing_api;
pub mod source;
pub mod sse;

pub use error::{ClientError, Result};
pub use routing_api::RoutingApiEmitter;
pub use source::{HttpEventSource, SourceConfig};
