//! Cluster event source seam

use crate::Result;
use async_trait::async_trait;
use emitter_api::{ActualEndpointInfo, ClusterEvent, DesiredRouteInfo, DomainSet};
use futures::stream::BoxStream;

/// Full cluster state used to rebuild the routing table
#[derive(Clone, Debug, Default)]
pub struct Snapshot {
    pub desired: Vec<DesiredRouteInfo>,
    pub actuals: Vec<ActualEndpointInfo>,
    pub domains: DomainSet,
}

impl Snapshot {
    /// Keep only the actuals placed on `cell_id`
    pub fn retain_cell(&mut self, cell_id: &str) {
        self.actuals.retain(|actual| actual.cell_id == cell_id);
    }
}

/// Lifecycle events and bulk state from the orchestrator
#[async_trait]
pub trait ClusterEventSource: Send + Sync {
    /// Long-lived stream of lifecycle events. The stream ends when the
    /// underlying subscription is lost.
    async fn subscribe(&self) -> Result<BoxStream<'static, Result<ClusterEvent>>>;

    async fn desired_routes(&self) -> Result<Vec<DesiredRouteInfo>>;

    async fn desired_routes_for(&self, process_guids: &[String]) -> Result<Vec<DesiredRouteInfo>>;

    async fn actual_endpoints(&self) -> Result<Vec<ActualEndpointInfo>>;

    async fn domains(&self) -> Result<DomainSet>;

    async fn snapshot(&self) -> Result<Snapshot> {
        let (desired, actuals, domains) = futures::try_join!(
            self.desired_routes(),
            self.actual_endpoints(),
            self.domains()
        )?;
        Ok(Snapshot {
            desired,
            actuals,
            domains,
        })
    }
}
