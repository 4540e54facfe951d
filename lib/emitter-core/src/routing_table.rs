//! Routing table joining desired routes with live endpoints
//!
//! Every mutator applies its change and returns the registrations and
//! unregistrations needed to bring routers from the previous state to the
//! new one. The table itself is the source of truth; the returned deltas are
//! only ever a view of the change.

use crate::endpoint::{DesiredRoutes, Endpoint, EndpointKey, RoutingKey};
use emitter_api::{
    ActualEndpointInfo, DesiredRouteInfo, DomainSet, MessagesToEmit, RegistryMessage,
    TcpRouteMapping, TcpRouteMappings,
};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Changes produced by a table mutation, for both route classes
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RouteDelta {
    pub messages: MessagesToEmit,
    pub tcp_mappings: TcpRouteMappings,
}

impl RouteDelta {
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty() && self.tcp_mappings.is_empty()
    }

    pub fn merge(&mut self, other: RouteDelta) {
        self.messages.merge(other.messages);
        self.tcp_mappings.merge(other.tcp_mappings);
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
struct RoutableEntry {
    desired: Option<DesiredRoutes>,
    endpoints: BTreeMap<EndpointKey, Endpoint>,
}

impl RoutableEntry {
    fn is_empty(&self) -> bool {
        self.desired.is_none() && self.endpoints.is_empty()
    }

    fn domain(&self) -> Option<&str> {
        match &self.desired {
            Some(desired) => Some(desired.domain.as_str()),
            None => self.endpoints.values().next().map(|e| e.domain.as_str()),
        }
    }

    /// One registration per distinct endpoint address
    fn registrations(&self) -> Vec<RegistryMessage> {
        let desired = match &self.desired {
            Some(desired) if !desired.hostnames.is_empty() => desired,
            _ => return Vec::new(),
        };

        let mut registered: Vec<&Endpoint> = Vec::new();
        let mut messages = Vec::new();
        for endpoint in self.endpoints.values() {
            if registered.iter().any(|e| e.same_address(endpoint)) {
                continue;
            }
            registered.push(endpoint);
            messages.push(desired.registry_message(endpoint));
        }
        messages
    }

    fn tcp_mappings(&self) -> BTreeSet<TcpRouteMapping> {
        match &self.desired {
            Some(desired) => self
                .endpoints
                .values()
                .flat_map(|endpoint| desired.tcp_mappings(endpoint))
                .collect(),
            None => BTreeSet::new(),
        }
    }
}

/// Messages that move routers from the `before` registrations to `after`.
///
/// Pairs are compared by (address, hostname); a pair whose payload changed
/// is re-registered, never unregistered.
fn diff_messages(before: &[RegistryMessage], after: &[RegistryMessage]) -> MessagesToEmit {
    let mut messages = MessagesToEmit::default();

    for next in after {
        let prev = before
            .iter()
            .find(|prev| prev.host == next.host && prev.port == next.port);
        match prev {
            Some(prev) if prev.same_payload(next) => {
                let added: Vec<String> = next
                    .uris
                    .iter()
                    .filter(|uri| !prev.uris.contains(uri))
                    .cloned()
                    .collect();
                if !added.is_empty() {
                    messages.registration_messages.push(RegistryMessage {
                        uris: added,
                        ..next.clone()
                    });
                }
            }
            _ => messages.registration_messages.push(next.clone()),
        }
    }

    for prev in before {
        let next = after
            .iter()
            .find(|next| next.host == prev.host && next.port == prev.port);
        let removed: Vec<String> = match next {
            Some(next) => prev
                .uris
                .iter()
                .filter(|uri| !next.uris.contains(uri))
                .cloned()
                .collect(),
            None => prev.uris.clone(),
        };
        if !removed.is_empty() {
            messages.unregistration_messages.push(RegistryMessage {
                uris: removed,
                ..prev.clone()
            });
        }
    }

    messages
}

fn diff_entries(before: Option<&RoutableEntry>, after: Option<&RoutableEntry>) -> RouteDelta {
    let before_messages = before.map(RoutableEntry::registrations).unwrap_or_default();
    let after_messages = after.map(RoutableEntry::registrations).unwrap_or_default();

    let before_mappings = before.map(RoutableEntry::tcp_mappings).unwrap_or_default();
    let after_mappings = after.map(RoutableEntry::tcp_mappings).unwrap_or_default();

    RouteDelta {
        messages: diff_messages(&before_messages, &after_messages),
        tcp_mappings: TcpRouteMappings {
            registrations: after_mappings.difference(&before_mappings).cloned().collect(),
            unregistrations: before_mappings.difference(&after_mappings).cloned().collect(),
        },
    }
}

/// In-memory index of routing keys to desired routes and live endpoints
#[derive(Clone, Debug, Default)]
pub struct RoutingTable {
    entries: BTreeMap<RoutingKey, RoutableEntry>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a table by applying every desired route and actual endpoint
    pub fn from_snapshot(desired: &[DesiredRouteInfo], actuals: &[ActualEndpointInfo]) -> Self {
        let mut table = Self::new();
        for info in desired {
            table.set_routes(None, info);
        }
        for actual in actuals {
            table.add_endpoint(actual);
        }
        table
    }

    /// Apply `update` to the entry for `key`, dropping the entry once it is
    /// empty, and return the resulting delta
    fn update_entry(
        &mut self,
        key: &RoutingKey,
        update: impl FnOnce(&mut RoutableEntry),
    ) -> RouteDelta {
        let before = self.entries.get(key).cloned();
        let mut after = before.clone().unwrap_or_default();
        update(&mut after);

        let delta = diff_entries(before.as_ref(), Some(&after));
        if after.is_empty() {
            self.entries.remove(key);
        } else {
            self.entries.insert(key.clone(), after);
        }
        delta
    }

    /// Reconcile a desired route transition. `before` is `None` on creation.
    ///
    /// Ports present before (or already in the table) but absent from
    /// `after` lose their routes. Updates older than the stored version are
    /// ignored.
    pub fn set_routes(
        &mut self,
        before: Option<&DesiredRouteInfo>,
        after: &DesiredRouteInfo,
    ) -> RouteDelta {
        let after_ports = after.container_ports();

        let mut keys: BTreeSet<RoutingKey> = after_ports
            .iter()
            .map(|port| RoutingKey::new(after.process_guid.as_str(), *port))
            .collect();
        if let Some(before) = before {
            keys.extend(
                before
                    .container_ports()
                    .into_iter()
                    .map(|port| RoutingKey::new(before.process_guid.as_str(), port)),
            );
        }
        keys.extend(
            self.entries
                .iter()
                .filter(|(key, entry)| {
                    key.process_guid == after.process_guid && entry.desired.is_some()
                })
                .map(|(key, _)| key.clone()),
        );

        let mut delta = RouteDelta::default();
        for key in keys {
            let stored = self.entries.get(&key).and_then(|e| e.desired.as_ref());
            if let Some(stored) = stored {
                if !stored.modification_tag.succeeded_by(&after.modification_tag) {
                    debug!(key = %key, "Ignoring stale desired route update");
                    continue;
                }
            }

            let routes = if key.process_guid == after.process_guid
                && after_ports.contains(&key.container_port)
            {
                Some(DesiredRoutes::from_info(after, key.container_port))
            } else {
                None
            };
            delta.merge(self.update_entry(&key, |entry| entry.desired = routes));
        }
        delta
    }

    /// Drop the desired routes of a process; live endpoints are unregistered
    pub fn remove_routes(&mut self, desired: &DesiredRouteInfo) -> RouteDelta {
        let keys: Vec<RoutingKey> = self
            .entries
            .iter()
            .filter(|(key, entry)| {
                key.process_guid == desired.process_guid && entry.desired.is_some()
            })
            .map(|(key, _)| key.clone())
            .collect();

        let mut delta = RouteDelta::default();
        for key in keys {
            let stored = self.entries.get(&key).and_then(|e| e.desired.as_ref());
            if let Some(stored) = stored {
                if stored.modification_tag != desired.modification_tag
                    && !stored.modification_tag.succeeded_by(&desired.modification_tag)
                {
                    debug!(key = %key, "Ignoring stale desired route removal");
                    continue;
                }
            }
            delta.merge(self.update_entry(&key, |entry| entry.desired = None));
        }
        delta
    }

    /// Insert or replace the endpoints of a running instance
    pub fn add_endpoint(&mut self, actual: &ActualEndpointInfo) -> RouteDelta {
        let mut delta = RouteDelta::default();
        if !actual.is_running() {
            return delta;
        }

        for mapping in &actual.ports {
            let key = RoutingKey::new(actual.process_guid.as_str(), mapping.container_port);
            let endpoint = Endpoint::from_actual(actual, mapping);
            let endpoint_key = endpoint.key();

            let stored = self
                .entries
                .get(&key)
                .and_then(|e| e.endpoints.get(&endpoint_key));
            if let Some(stored) = stored {
                if !stored.modification_tag.succeeded_by(&endpoint.modification_tag) {
                    debug!(key = %key, instance_guid = %endpoint.instance_guid, "Ignoring stale endpoint");
                    continue;
                }
            }

            delta.merge(self.update_entry(&key, |entry| {
                entry.endpoints.insert(endpoint_key, endpoint);
            }));
        }
        delta
    }

    /// Remove the endpoints of an instance that was running
    pub fn remove_endpoint(&mut self, actual: &ActualEndpointInfo) -> RouteDelta {
        let mut delta = RouteDelta::default();
        if !actual.is_running() {
            return delta;
        }

        let endpoint_key = EndpointKey {
            instance_guid: actual.instance_guid.clone(),
            evacuating: actual.evacuating,
        };
        for mapping in &actual.ports {
            let key = RoutingKey::new(actual.process_guid.as_str(), mapping.container_port);
            let stored = match self
                .entries
                .get(&key)
                .and_then(|e| e.endpoints.get(&endpoint_key))
            {
                Some(stored) => stored,
                None => continue,
            };
            if stored.modification_tag != actual.modification_tag
                && !stored.modification_tag.succeeded_by(&actual.modification_tag)
            {
                debug!(key = %key, instance_guid = %actual.instance_guid, "Ignoring stale endpoint removal");
                continue;
            }

            delta.merge(self.update_entry(&key, |entry| {
                entry.endpoints.remove(&endpoint_key);
            }));
        }
        delta
    }

    /// Replace this table's contents with `new_table`, keeping only entries
    /// whose domain is fresh.
    ///
    /// Entries of this table in domains that are not fresh are dropped
    /// without unregistering them; the router prunes them once they stop
    /// being re-announced.
    pub fn swap(&mut self, new_table: RoutingTable, domains: &DomainSet) -> RouteDelta {
        let is_fresh =
            |entry: &RoutableEntry| entry.domain().map_or(false, |d| domains.contains(d));

        let next: BTreeMap<RoutingKey, RoutableEntry> = new_table
            .entries
            .into_iter()
            .filter(|(_, entry)| is_fresh(entry))
            .collect();

        let keys: BTreeSet<&RoutingKey> = self.entries.keys().chain(next.keys()).collect();
        let mut delta = RouteDelta::default();
        for key in keys {
            let old = self.entries.get(key).filter(|entry| is_fresh(entry));
            delta.merge(diff_entries(old, next.get(key)));
        }

        debug!(
            old_entries = self.entries.len(),
            new_entries = next.len(),
            "Swapped routing table"
        );
        self.entries = next;
        delta
    }

    /// Registrations for every live (route, endpoint) pair
    pub fn emit(&self) -> RouteDelta {
        let mut delta = RouteDelta::default();
        for entry in self.entries.values() {
            delta
                .messages
                .registration_messages
                .extend(entry.registrations());
            delta
                .tcp_mappings
                .registrations
                .extend(entry.tcp_mappings());
        }
        delta
    }

    /// Whether any port of this instance currently has desired routes
    pub fn has_external_routes(&self, actual: &ActualEndpointInfo) -> bool {
        actual.ports.iter().any(|mapping| {
            let key = RoutingKey::new(actual.process_guid.as_str(), mapping.container_port);
            self.entries
                .get(&key)
                .and_then(|e| e.desired.as_ref())
                .map_or(false, DesiredRoutes::has_external_routes)
        })
    }

    /// Number of endpoint addresses registered under at least one hostname
    pub fn http_endpoint_count(&self) -> usize {
        self.entries.values().map(|e| e.registrations().len()).sum()
    }

    /// Number of TCP route mappings currently announced
    pub fn tcp_route_count(&self) -> usize {
        self.entries.values().map(|e| e.tcp_mappings().len()).sum()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains_key(&self, key: &RoutingKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Endpoints currently held for `key`
    pub fn endpoints(&self, key: &RoutingKey) -> Vec<&Endpoint> {
        self.entries
            .get(key)
            .map(|e| e.endpoints.values().collect())
            .unwrap_or_default()
    }
}
