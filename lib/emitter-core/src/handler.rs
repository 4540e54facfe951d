//! Event handler owning the active routing table
//!
//! Translates cluster lifecycle events into routing table mutations and
//! forwards every resulting delta to the configured emitters. A full sync
//! rebuilds the table from a snapshot, silently replays events that raced
//! with the snapshot, and swaps it in, emitting only the final diff.

use crate::emitter::{RegistryEmitter, TcpMappingEmitter};
use crate::metrics::{MetricsSink, NoopMetrics};
use crate::routing_table::{RouteDelta, RoutingTable};
use crate::source::Snapshot;
use emitter_api::{ActualEndpointInfo, ClusterEvent, DesiredRouteInfo};
use indexmap::IndexMap;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Apply one event to `table` and return the delta it produced
pub fn apply(table: &mut RoutingTable, event: &ClusterEvent) -> RouteDelta {
    match event {
        ClusterEvent::DesiredCreated { desired } => table.set_routes(None, desired),
        ClusterEvent::DesiredChanged { before, after } => table.set_routes(Some(before), after),
        ClusterEvent::DesiredRemoved { desired } => table.remove_routes(desired),
        ClusterEvent::ActualCreated { actual } => table.add_endpoint(actual),
        ClusterEvent::ActualChanged { before, after } => {
            if after.is_running() {
                table.add_endpoint(after)
            } else if before.is_running() {
                table.remove_endpoint(before)
            } else {
                RouteDelta::default()
            }
        }
        ClusterEvent::ActualRemoved { actual } => table.remove_endpoint(actual),
        ClusterEvent::Unrecognized { event_type } => {
            error!(event_type = %event_type, "Did not handle unrecognized event type");
            RouteDelta::default()
        }
    }
}

pub struct EventHandler {
    table: RoutingTable,
    registry_emitter: Option<Arc<dyn RegistryEmitter>>,
    tcp_emitter: Option<Arc<dyn TcpMappingEmitter>>,
    metrics: Arc<dyn MetricsSink>,
    local_mode: bool,
}

impl Default for EventHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHandler {
    /// A handler with an empty table and no emitters
    pub fn new() -> Self {
        Self {
            table: RoutingTable::new(),
            registry_emitter: None,
            tcp_emitter: None,
            metrics: Arc::new(NoopMetrics),
            local_mode: false,
        }
    }

    pub fn with_registry_emitter(mut self, emitter: Arc<dyn RegistryEmitter>) -> Self {
        self.registry_emitter = Some(emitter);
        self
    }

    pub fn with_tcp_emitter(mut self, emitter: Arc<dyn TcpMappingEmitter>) -> Self {
        self.tcp_emitter = Some(emitter);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Report route counts after each sync
    pub fn with_local_mode(mut self, local_mode: bool) -> Self {
        self.local_mode = local_mode;
        self
    }

    pub fn table(&self) -> &RoutingTable {
        &self.table
    }

    pub async fn handle_event(&mut self, event: &ClusterEvent) {
        debug!(event_type = event.event_type(), key = ?event.key(), "Handling event");
        let delta = apply(&mut self.table, event);
        self.emit_delta(delta).await;
    }

    /// Re-announce every live route
    pub async fn emit(&self) {
        let delta = self.table.emit();
        let count = delta.messages.route_registration_count();
        self.metrics.routes_total(self.table.http_endpoint_count());
        self.metrics.routes_synced(count);
        debug!(routes = count, "Emitting full routing table");
        self.emit_delta(delta).await;
    }

    /// Replace the active table with one rebuilt from `snapshot`.
    ///
    /// `cached` holds events seen while the snapshot was fetched; they are
    /// replayed in order against the rebuilt table without emitting.
    pub async fn sync(&mut self, snapshot: Snapshot, cached: &IndexMap<String, ClusterEvent>) {
        info!(
            desired = snapshot.desired.len(),
            actuals = snapshot.actuals.len(),
            domains = snapshot.domains.len(),
            cached_events = cached.len(),
            "Syncing routing table"
        );

        let mut table = RoutingTable::from_snapshot(&snapshot.desired, &snapshot.actuals);
        for event in cached.values() {
            apply(&mut table, event);
        }

        let delta = self.table.swap(table, &snapshot.domains);
        debug!(
            registrations = delta.messages.registration_messages.len(),
            unregistrations = delta.messages.unregistration_messages.len(),
            "Routing table swapped"
        );
        self.emit_delta(delta).await;

        if self.local_mode {
            self.metrics.http_route_count(self.table.http_endpoint_count());
            self.metrics.tcp_route_count(self.table.tcp_route_count());
        }
    }

    /// Re-apply desired routes that may have been missed
    pub async fn refresh_desired(&mut self, desired: &[DesiredRouteInfo]) {
        let mut delta = RouteDelta::default();
        for info in desired {
            delta.merge(self.table.set_routes(None, info));
        }
        self.emit_delta(delta).await;
    }

    /// Whether the routes of this endpoint's process are unknown
    pub fn should_refresh_desired(&self, actual: &ActualEndpointInfo) -> bool {
        !self.table.has_external_routes(actual)
    }

    async fn emit_delta(&self, delta: RouteDelta) {
        if let Some(emitter) = &self.registry_emitter {
            if !delta.messages.is_empty() {
                if let Err(e) = emitter.emit(&delta.messages).await {
                    error!(error = %e, "Failed to emit registry messages");
                }
                self.metrics
                    .routes_registered(delta.messages.route_registration_count());
                self.metrics
                    .routes_unregistered(delta.messages.route_unregistration_count());
            }
        }

        if let Some(emitter) = &self.tcp_emitter {
            if !delta.tcp_mappings.is_empty() {
                if let Err(e) = emitter.emit(&delta.tcp_mappings).await {
                    error!(error = %e, "Failed to emit tcp route mappings");
                }
            }
        }
    }
}
