/// Orchestrator-side records consumed by the routing table

pub mod desired;
pub mod actual;
pub mod tag;

pub use desired::{DesiredRouteInfo, HttpRoute, TcpRoute};
pub use actual::{ActualEndpointInfo, ActualState, PortMapping};
pub use tag::ModificationTag;

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Domains whose state is known to be fresh at snapshot time
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DomainSet(BTreeSet<String>);

impl DomainSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, domain: &str) -> bool {
        self.0.contains(domain)
    }

    pub fn insert(&mut self, domain: impl Into<String>) {
        self.0.insert(domain.into());
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<S: Into<String>> FromIterator<S> for DomainSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}
