//! Label purchase flow for shipments.
//!
//! This crate drives a user from "view shipment" to "label purchased": it checks
//! entry conditions, waits for carrier rate quotes to settle, exposes a stable
//! list of selectable rates, and performs exactly one purchase per user action.
//!
//! Remote calls go through a [`ShipmentRepository`]; permissions come from an
//! [`Authorizer`]. A [`FlowController`] owns the state machine and publishes
//! [`FlowSnapshot`]s for the presentation layer.

pub mod domain;
pub mod error;
pub mod flow;
pub mod repository;

// Re-export commonly used types
pub use domain::{
    CarrierError, FlowId, FlowState, RateCatalog, RateId, RateOption, RateQuote, Shipment,
    ShipmentId,
};
pub use error::{LabelFlowError, Result};
pub use flow::{FlowConfig, FlowController, FlowSnapshot, PurchaseOutcome};
pub use repository::{
    Action, Authorizer, MockShipmentRepository, RatesStatus, ResourceType, ShipmentRepository,
    StaticAuthorizer,
};
