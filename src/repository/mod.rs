//! Seams to the systems the flow depends on but does not own.
//!
//! [`ShipmentRepository`] fronts the commerce API (shipment reads, quote job
//! status, the purchase action) and [`Authorizer`] answers permission
//! questions for the current actor. Transport, caching and role lookup live
//! behind these traits.

use std::collections::HashSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::{RateId, Shipment, ShipmentId};
use crate::error::Result;

pub mod mock;

pub use mock::{MockCall, MockShipmentRepository, Operation};

/// Status of the quote job for one shipment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RatesStatus {
    /// A quote job is still asking carriers for rates.
    pub is_refreshing: bool,
}

/// Access to shipments held by the commerce API.
///
/// Implementations return [`LabelFlowError::ShipmentNotFound`] for unknown ids
/// and [`LabelFlowError::Remote`] for rejected calls, carrying the remote
/// message when there is one.
///
/// [`LabelFlowError::ShipmentNotFound`]: crate::error::LabelFlowError::ShipmentNotFound
/// [`LabelFlowError::Remote`]: crate::error::LabelFlowError::Remote
#[async_trait]
pub trait ShipmentRepository: Send + Sync {
    /// Fetch the shipment with its current rates and carrier errors.
    async fn fetch_shipment(&self, id: &ShipmentId) -> Result<Shipment>;

    /// Ask for the quote job status of a shipment, starting a job if the
    /// backend decides one is needed.
    async fn fetch_rates(&self, id: &ShipmentId) -> Result<RatesStatus>;

    /// Buy the label for `rate_id`.
    ///
    /// This is irreversible and not idempotent on the remote side: callers
    /// must not retry it. The returned shipment reflects the outcome.
    async fn purchase(&self, id: &ShipmentId, rate_id: &RateId) -> Result<Shipment>;
}

/// Operations the actor can be allowed to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Update,
    Destroy,
}

/// Resource kinds permissions are granted on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    Shipments,
}

/// Permission lookup for the current actor.
pub trait Authorizer: Send + Sync {
    fn can_perform(&self, action: Action, resource: ResourceType) -> bool;
}

/// Authorizer backed by a fixed set of grants.
#[derive(Debug, Clone, Default)]
pub struct StaticAuthorizer {
    granted: HashSet<(Action, ResourceType)>,
}

impl StaticAuthorizer {
    /// An actor with no permissions at all.
    pub fn deny_all() -> Self {
        Self::default()
    }

    /// An actor allowed to do everything.
    pub fn allow_all() -> Self {
        Self::default()
            .grant(Action::Update, ResourceType::Shipments)
            .grant(Action::Destroy, ResourceType::Shipments)
    }

    pub fn grant(mut self, action: Action, resource: ResourceType) -> Self {
        self.granted.insert((action, resource));
        self
    }
}

impl Authorizer for StaticAuthorizer {
    fn can_perform(&self, action: Action, resource: ResourceType) -> bool {
        self.granted.contains(&(action, resource))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_authorizer_grants() {
        let updater = StaticAuthorizer::deny_all().grant(Action::Update, ResourceType::Shipments);

        assert!(updater.can_perform(Action::Update, ResourceType::Shipments));
        assert!(!updater.can_perform(Action::Destroy, ResourceType::Shipments));
        assert!(!StaticAuthorizer::deny_all().can_perform(Action::Update, ResourceType::Shipments));
        assert!(StaticAuthorizer::allow_all().can_perform(Action::Destroy, ResourceType::Shipments));
    }
}
