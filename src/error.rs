//! Error types for the label purchase flow.

use thiserror::Error;

use crate::domain::ShipmentId;

/// Fallback shown when a purchase fails without a usable remote message.
pub const GENERIC_PURCHASE_ERROR: &str = "Unable to purchase the shipping label";

/// Fallback shown when the shipment could not be loaded.
pub const GENERIC_LOAD_ERROR: &str = "Unable to load the shipment";

/// Result type alias using the labelflow error type.
pub type Result<T> = std::result::Result<T, LabelFlowError>;

/// Main error type for the label purchase flow.
#[derive(Error, Debug)]
pub enum LabelFlowError {
    /// Shipment does not exist (or is not visible to the actor)
    #[error("Shipment not found: {0}")]
    ShipmentNotFound(ShipmentId),

    /// The commerce API rejected a call
    #[error("Remote API error{}: {message}", .status.map(|s| format!(" ({s})")).unwrap_or_default())]
    Remote {
        status: Option<u16>,
        message: String,
    },

    /// A purchase for this shipment is still pending
    #[error("Purchase already in progress for shipment {0}")]
    PurchaseInFlight(ShipmentId),

    /// Purchase was triggered without a selection present in the current rate options
    #[error("No rate from the current options is selected for shipment {0}")]
    NoRateSelected(ShipmentId),

    /// The flow is in a state that does not allow the requested operation
    #[error("Invalid state transition: flow for shipment {0} is in state '{1}', expected '{2}'")]
    InvalidState(ShipmentId, String, String),

    /// The flow instance was torn down before the operation completed
    #[error("Flow for shipment {0} has been torn down")]
    TornDown(ShipmentId),

    /// General error from anyhow
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl LabelFlowError {
    /// Message suitable for showing to the person buying the label.
    ///
    /// Remote messages are passed through verbatim; anything else collapses
    /// to [`GENERIC_PURCHASE_ERROR`].
    pub fn user_message(&self) -> String {
        self.remote_message_or(GENERIC_PURCHASE_ERROR)
    }

    /// The remote message when there is a usable one, else `fallback`.
    pub fn remote_message_or(&self, fallback: &str) -> String {
        match self {
            LabelFlowError::Remote { message, .. } if !message.trim().is_empty() => {
                message.clone()
            }
            _ => fallback.to_string(),
        }
    }

    /// Whether repeating the same read could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            LabelFlowError::Remote { status, .. } => {
                matches!(status, None | Some(408) | Some(429) | Some(500..=599))
            }
            LabelFlowError::Other(_) => true,
            _ => false,
        }
    }
}
