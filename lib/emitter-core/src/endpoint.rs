//! Routing keys and the per-key desired/actual records held by the table
use emitter_api::messages::COMPONENT_TAG;
use emitter_api::{
    ActualEndpointInfo, DesiredRouteInfo, ModificationTag, PortMapping, RegistryMessage, TcpRoute,
    TcpRouteMapping,
};
use std::collections::BTreeMap;
use std::fmt;

/// Joins desired routes to actual endpoints: a process and one of its container ports
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RoutingKey {
    pub process_guid: String,
    pub container_port: u32,
}

impl RoutingKey {
    pub fn new(process_guid: impl Into<String>, container_port: u32) -> Self {
        Self {
            process_guid: process_guid.into(),
            container_port,
        }
    }
}

impl fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.process_guid, self.container_port)
    }
}

/// Identifies an endpoint within a routing key. An evacuating instance and
/// its replacement share an instance guid but are tracked separately.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EndpointKey {
    pub instance_guid: String,
    pub evacuating: bool,
}

/// A live instance address serving a routing key
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    pub instance_guid: String,
    pub index: i32,
    pub host: String,
    /// Host-assigned port
    pub port: u32,
    pub container_port: u32,
    pub tls_port: Option<u32>,
    pub evacuating: bool,
    pub domain: String,
    pub modification_tag: ModificationTag,
}

impl Endpoint {
    pub fn from_actual(actual: &ActualEndpointInfo, mapping: &PortMapping) -> Self {
        Self {
            instance_guid: actual.instance_guid.clone(),
            index: actual.index,
            host: actual.address.clone(),
            port: mapping.host_port,
            container_port: mapping.container_port,
            tls_port: mapping.host_tls_proxy_port,
            evacuating: actual.evacuating,
            domain: actual.domain.clone(),
            modification_tag: actual.modification_tag.clone(),
        }
    }

    pub fn key(&self) -> EndpointKey {
        EndpointKey {
            instance_guid: self.instance_guid.clone(),
            evacuating: self.evacuating,
        }
    }

    pub fn same_address(&self, other: &Endpoint) -> bool {
        self.host == other.host && self.port == other.port
    }
}

/// Desired routes for a single routing key
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DesiredRoutes {
    pub hostnames: Vec<String>,
    pub route_service_url: Option<String>,
    pub tcp_routes: Vec<TcpRoute>,
    pub log_guid: String,
    pub domain: String,
    pub modification_tag: ModificationTag,
}

impl DesiredRoutes {
    pub fn from_info(desired: &DesiredRouteInfo, container_port: u32) -> Self {
        Self {
            hostnames: desired.hostnames_for(container_port),
            route_service_url: desired.route_service_url_for(container_port),
            tcp_routes: desired.tcp_routes_for(container_port),
            log_guid: desired.log_guid.clone(),
            domain: desired.domain.clone(),
            modification_tag: desired.modification_tag.clone(),
        }
    }

    pub fn has_external_routes(&self) -> bool {
        !self.hostnames.is_empty() || !self.tcp_routes.is_empty()
    }

    /// Registration of every hostname against `endpoint`
    pub fn registry_message(&self, endpoint: &Endpoint) -> RegistryMessage {
        RegistryMessage {
            host: endpoint.host.clone(),
            port: endpoint.port,
            tls_port: endpoint.tls_port,
            uris: self.hostnames.clone(),
            app: self.log_guid.clone(),
            private_instance_id: endpoint.instance_guid.clone(),
            private_instance_index: endpoint.index.to_string(),
            route_service_url: self.route_service_url.clone(),
            tags: BTreeMap::from([("component".to_string(), COMPONENT_TAG.to_string())]),
        }
    }

    pub fn tcp_mappings(&self, endpoint: &Endpoint) -> impl Iterator<Item = TcpRouteMapping> + '_ {
        let host = endpoint.host.clone();
        let port = endpoint.port;
        self.tcp_routes.iter().map(move |route| TcpRouteMapping {
            router_group_guid: route.router_group_guid.clone(),
            external_port: route.external_port,
            host_ip: host.clone(),
            host_port: port,
        })
    }
}
