//! NATS client for the route emitter
//!
//! A minimal client for the NATS text protocol, enough to publish registry
//! messages and run the router greeting protocol. Lost connections are not
//! re-established; callers watch [`NatsClient::closed`] and restart.

pub mod client;
pub mod error;
pub mod protocol;

pub use client::{NatsClient, NatsOptions};
pub use error::{NatsError, Result};
