use serde::{Deserialize, Serialize};

use super::ModificationTag;

/// Placement state of an actual instance. Only `Running` instances serve traffic.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ActualState {
    #[default]
    Unclaimed,
    Claimed,
    Running,
    Crashed,
}

/// Container port to host port binding of an instance
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub container_port: u32,
    pub host_port: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_tls_proxy_port: Option<u32>,
}

/// Observed placement of a single process instance
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActualEndpointInfo {
    pub process_guid: String,
    pub instance_guid: String,

    #[serde(default)]
    pub index: i32,

    #[serde(default)]
    pub domain: String,

    /// Cell hosting the instance
    #[serde(default)]
    pub cell_id: String,

    /// Host address reachable by routers
    #[serde(default)]
    pub address: String,

    #[serde(default)]
    pub ports: Vec<PortMapping>,

    #[serde(default)]
    pub state: ActualState,

    /// Set while the instance is being drained off its cell
    #[serde(default)]
    pub evacuating: bool,

    #[serde(default)]
    pub modification_tag: ModificationTag,
}

impl ActualEndpointInfo {
    pub fn is_running(&self) -> bool {
        self.state == ActualState::Running
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_wire_format() {
        let json = serde_json::to_string(&ActualState::Running).expect("serializable");
        assert_eq!(json, "\"RUNNING\"");
        let state: ActualState = serde_json::from_str("\"CRASHED\"").expect("valid state");
        assert_eq!(state, ActualState::Crashed);
    }

    #[test]
    fn test_is_running() {
        let mut actual = ActualEndpointInfo::default();
        assert!(!actual.is_running());
        actual.state = ActualState::Running;
        assert!(actual.is_running());
    }
}
