use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::ModificationTag;

/// Desired routing information for a process, as declared by the orchestrator
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredRouteInfo {
    /// Identity of the process these routes belong to
    pub process_guid: String,

    /// Domain (freshness scope) the process belongs to
    #[serde(default)]
    pub domain: String,

    /// Log correlation identifier carried on every registration
    #[serde(default)]
    pub log_guid: String,

    /// HTTP routes, one or more per container port
    #[serde(default)]
    pub http_routes: Vec<HttpRoute>,

    /// TCP routes exposed through router groups
    #[serde(default)]
    pub tcp_routes: Vec<TcpRoute>,

    #[serde(default)]
    pub modification_tag: ModificationTag,
}

/// Hostnames served by a container port
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpRoute {
    #[serde(default)]
    pub hostnames: Vec<String>,

    /// Container port receiving the traffic
    pub port: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route_service_url: Option<String>,
}

/// A frontend port on a TCP router group mapped onto a container port
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpRoute {
    pub router_group_guid: String,
    pub external_port: u32,
    pub container_port: u32,
}

impl DesiredRouteInfo {
    /// Every container port referenced by an HTTP or TCP route
    pub fn container_ports(&self) -> BTreeSet<u32> {
        self.http_routes
            .iter()
            .map(|route| route.port)
            .chain(self.tcp_routes.iter().map(|route| route.container_port))
            .collect()
    }

    /// Hostnames declared for `port`, in declaration order without duplicates
    pub fn hostnames_for(&self, port: u32) -> Vec<String> {
        let mut hostnames: Vec<String> = Vec::new();
        for route in self.http_routes.iter().filter(|r| r.port == port) {
            for hostname in &route.hostnames {
                if !hostnames.contains(hostname) {
                    hostnames.push(hostname.clone());
                }
            }
        }
        hostnames
    }

    /// Route service URL for `port`; the first route declaring one wins
    pub fn route_service_url_for(&self, port: u32) -> Option<String> {
        self.http_routes
            .iter()
            .filter(|r| r.port == port)
            .find_map(|r| r.route_service_url.clone())
    }

    pub fn tcp_routes_for(&self, port: u32) -> Vec<TcpRoute> {
        let mut routes: Vec<TcpRoute> = Vec::new();
        for route in self.tcp_routes.iter().filter(|r| r.container_port == port) {
            if !routes.contains(route) {
                routes.push(route.clone());
            }
        }
        routes
    }
}
