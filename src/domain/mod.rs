//! Core domain types for the label purchase flow.
//!
//! Pure values with no I/O:
//! - Shipments, rate quotes and carrier errors
//! - The rate catalog derived from a shipment
//! - Flow state tags and their legal transitions

pub mod catalog;
pub mod flow;
pub mod shipment;

pub use catalog::{RateCatalog, RateOption};
pub use flow::FlowState;
pub use shipment::{CarrierError, FlowId, RateId, RateQuote, Shipment, ShipmentId};
