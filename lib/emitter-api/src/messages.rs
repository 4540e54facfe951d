//! Messages announced to the router fleet

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Subject carrying route registrations
pub const REGISTER_SUBJECT: &str = "router.register";
/// Subject carrying route unregistrations
pub const UNREGISTER_SUBJECT: &str = "router.unregister";
/// Subject on which emitters ask routers for their register interval
pub const GREET_SUBJECT: &str = "router.greet";
/// Subject on which routers broadcast their register interval at startup
pub const START_SUBJECT: &str = "router.start";

/// Component tag attached to every registry message
pub const COMPONENT_TAG: &str = "route-emitter";

/// A single route (un)registration for one endpoint address
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryMessage {
    pub host: String,
    pub port: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_port: Option<u32>,

    /// Hostnames being (un)registered against this address
    pub uris: Vec<String>,

    /// Log correlation identifier
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub app: String,

    #[serde(default)]
    pub private_instance_id: String,

    #[serde(default)]
    pub private_instance_index: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route_service_url: Option<String>,

    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl RegistryMessage {
    /// `host:port` of the endpoint
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Everything except the uris, used to tell a re-registration from a no-op
    pub fn same_payload(&self, other: &RegistryMessage) -> bool {
        self.host == other.host
            && self.port == other.port
            && self.tls_port == other.tls_port
            && self.app == other.app
            && self.private_instance_id == other.private_instance_id
            && self.private_instance_index == other.private_instance_index
            && self.route_service_url == other.route_service_url
            && self.tags == other.tags
    }
}

/// Registrations and unregistrations produced by a table mutation
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagesToEmit {
    pub registration_messages: Vec<RegistryMessage>,
    pub unregistration_messages: Vec<RegistryMessage>,
}

impl MessagesToEmit {
    pub fn is_empty(&self) -> bool {
        self.registration_messages.is_empty() && self.unregistration_messages.is_empty()
    }

    pub fn merge(&mut self, other: MessagesToEmit) {
        self.registration_messages.extend(other.registration_messages);
        self.unregistration_messages.extend(other.unregistration_messages);
    }

    /// Number of (hostname, address) pairs being registered
    pub fn route_registration_count(&self) -> usize {
        self.registration_messages.iter().map(|m| m.uris.len()).sum()
    }

    /// Number of (hostname, address) pairs being unregistered
    pub fn route_unregistration_count(&self) -> usize {
        self.unregistration_messages.iter().map(|m| m.uris.len()).sum()
    }
}

/// A TCP router group frontend port mapped to a backend address
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TcpRouteMapping {
    pub router_group_guid: String,
    #[serde(rename = "port")]
    pub external_port: u32,
    #[serde(rename = "backend_ip")]
    pub host_ip: String,
    #[serde(rename = "backend_port")]
    pub host_port: u32,
}

/// TCP route mapping changes for the routing API
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpRouteMappings {
    pub registrations: Vec<TcpRouteMapping>,
    pub unregistrations: Vec<TcpRouteMapping>,
}

impl TcpRouteMappings {
    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty() && self.unregistrations.is_empty()
    }

    pub fn merge(&mut self, other: TcpRouteMappings) {
        self.registrations.extend(other.registrations);
        self.unregistrations.extend(other.unregistrations);
    }
}

/// Heartbeat parameters announced by routers on `router.start` and in
/// replies to `router.greet`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterGreeting {
    #[serde(rename = "minimumRegisterIntervalInSeconds")]
    pub minimum_register_interval_in_seconds: u64,
    #[serde(rename = "pruneThresholdInSeconds")]
    pub prune_threshold_in_seconds: u64,
}

impl RouterGreeting {
    pub fn register_interval(&self) -> Duration {
        Duration::from_secs(self.minimum_register_interval_in_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(uris: &[&str]) -> RegistryMessage {
        RegistryMessage {
            host: "1.2.3.4".to_string(),
            port: 1234,
            tls_port: None,
            uris: uris.iter().map(|u| u.to_string()).collect(),
            app: "log-guid".to_string(),
            private_instance_id: "instance-1".to_string(),
            private_instance_index: "0".to_string(),
            route_service_url: None,
            tags: BTreeMap::from([("component".to_string(), COMPONENT_TAG.to_string())]),
        }
    }

    #[test]
    fn test_registry_message_wire_format() {
        let value = serde_json::to_value(message(&["a.com"])).expect("serializable");
        assert_eq!(value["host"], "1.2.3.4");
        assert_eq!(value["port"], 1234);
        assert_eq!(value["uris"][0], "a.com");
        assert_eq!(value["app"], "log-guid");
        assert_eq!(value["tags"]["component"], "route-emitter");
        assert!(value.get("tls_port").is_none());
        assert!(value.get("route_service_url").is_none());
    }

    #[test]
    fn test_route_counts() {
        let messages = MessagesToEmit {
            registration_messages: vec![message(&["a.com", "b.com"]), message(&["c.com"])],
            unregistration_messages: vec![message(&["d.com"])],
        };
        assert_eq!(messages.route_registration_count(), 3);
        assert_eq!(messages.route_unregistration_count(), 1);
        assert!(!messages.is_empty());
        assert!(MessagesToEmit::default().is_empty());
    }

    #[test]
    fn test_same_payload_ignores_uris() {
        let a = message(&["a.com"]);
        let mut b = message(&["b.com"]);
        assert!(a.same_payload(&b));
        b.tls_port = Some(61001);
        assert!(!a.same_payload(&b));
    }

    #[test]
    fn test_router_greeting_wire_format() {
        let greeting: RouterGreeting = serde_json::from_str(
            r#"{"minimumRegisterIntervalInSeconds":1, "pruneThresholdInSeconds": 3}"#,
        )
        .expect("valid greeting");
        assert_eq!(greeting.register_interval(), Duration::from_secs(1));
        assert_eq!(greeting.prune_threshold_in_seconds, 3);
    }

    #[test]
    fn test_tcp_mapping_wire_format() {
        let mapping = TcpRouteMapping {
            router_group_guid: "rg".to_string(),
            external_port: 61000,
            host_ip: "10.0.0.1".to_string(),
            host_port: 60000,
        };
        let value = serde_json::to_value(&mapping).expect("serializable");
        assert_eq!(value["port"], 61000);
        assert_eq!(value["backend_ip"], "10.0.0.1");
        assert_eq!(value["backend_port"], 60000);
    }
}
