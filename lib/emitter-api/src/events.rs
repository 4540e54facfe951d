//! Lifecycle events delivered by the cluster event source

use serde::{Deserialize, Serialize};

use crate::models::{ActualEndpointInfo, DesiredRouteInfo};

/// A lifecycle event for desired routes or actual endpoints.
///
/// The wire form is adjacently tagged: `{"type": "desired_created", "data": {...}}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClusterEvent {
    DesiredCreated {
        desired: DesiredRouteInfo,
    },
    DesiredChanged {
        before: DesiredRouteInfo,
        after: DesiredRouteInfo,
    },
    DesiredRemoved {
        desired: DesiredRouteInfo,
    },
    ActualCreated {
        actual: ActualEndpointInfo,
    },
    ActualChanged {
        before: ActualEndpointInfo,
        after: ActualEndpointInfo,
    },
    ActualRemoved {
        actual: ActualEndpointInfo,
    },
    /// An event type this emitter does not know how to handle
    #[serde(skip)]
    Unrecognized { event_type: String },
}

const KNOWN_EVENT_TYPES: &[&str] = &[
    "desired_created",
    "desired_changed",
    "desired_removed",
    "actual_created",
    "actual_changed",
    "actual_removed",
];

impl ClusterEvent {
    /// Build an event from a type name and its JSON payload, as carried by
    /// a server-sent event. Unknown type names yield `Unrecognized`.
    pub fn from_parts(event_type: &str, data: &str) -> Result<Self, serde_json::Error> {
        if !KNOWN_EVENT_TYPES.contains(&event_type) {
            return Ok(Self::Unrecognized {
                event_type: event_type.to_string(),
            });
        }
        let data: serde_json::Value = serde_json::from_str(data)?;
        serde_json::from_value(serde_json::json!({ "type": event_type, "data": data }))
    }

    pub fn event_type(&self) -> &str {
        match self {
            Self::DesiredCreated { .. } => "desired_created",
            Self::DesiredChanged { .. } => "desired_changed",
            Self::DesiredRemoved { .. } => "desired_removed",
            Self::ActualCreated { .. } => "actual_created",
            Self::ActualChanged { .. } => "actual_changed",
            Self::ActualRemoved { .. } => "actual_removed",
            Self::Unrecognized { event_type } => event_type.as_str(),
        }
    }

    /// Identity used to coalesce events of the same object: the process guid
    /// for desired events, the instance guid for actual events.
    pub fn key(&self) -> Option<&str> {
        match self {
            Self::DesiredCreated { desired } | Self::DesiredRemoved { desired } => {
                Some(desired.process_guid.as_str())
            }
            Self::DesiredChanged { after, .. } => Some(after.process_guid.as_str()),
            Self::ActualCreated { actual } | Self::ActualRemoved { actual } => {
                Some(actual.instance_guid.as_str())
            }
            Self::ActualChanged { after, .. } => Some(after.instance_guid.as_str()),
            Self::Unrecognized { .. } => None,
        }
    }

    /// Actual endpoint records carried by the event, if any
    pub fn actuals(&self) -> Vec<&ActualEndpointInfo> {
        match self {
            Self::ActualCreated { actual } | Self::ActualRemoved { actual } => vec![actual],
            Self::ActualChanged { before, after } => vec![before, after],
            _ => Vec::new(),
        }
    }
}
