//! Route emitter data model and wire types
//!
//! This library defines the values exchanged between the route emitter and
//! its collaborators:
//! - DesiredRouteInfo: routes declared by the orchestrator for a process
//! - ActualEndpointInfo: observed placements of a process instance
//! - ClusterEvent: lifecycle events delivered by the cluster event source
//! - RegistryMessage / TcpRouteMapping: what gets announced to routers

pub mod models;
pub mod events;
pub mod messages;

pub use models::{
    ActualEndpointInfo, ActualState, DesiredRouteInfo, DomainSet, HttpRoute, ModificationTag,
    PortMapping, TcpRoute,
};
pub use events::ClusterEvent;
pub use messages::{
    MessagesToEmit, RegistryMessage, RouterGreeting, TcpRouteMapping, TcpRouteMappings,
};
