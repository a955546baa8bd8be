//! States of the label purchase flow and the transitions allowed between them.
//!
//! ```text
//! Loading ──> Unauthorized
//!    │──────> LoadFailed
//!    │──────> AlreadyPurchased
//!    └──────> AwaitingRates ──ready──> ReadyToSelect ──confirm──> Purchasing ──ok──> Purchased
//!                                            ▲                        │
//!                                            └────────failure─────────┘
//! ```
//!
//! `PurchaseFailed` names the moment a failed attempt is reported; the flow
//! does not rest there but returns to `ReadyToSelect` with the error kept for
//! display. `LoadFailed` ends a flow whose shipment could not be read.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowState {
    Loading,
    Unauthorized,
    LoadFailed,
    AlreadyPurchased,
    AwaitingRates,
    ReadyToSelect,
    Purchasing,
    Purchased,
    PurchaseFailed,
}

impl FlowState {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlowState::Loading => "LOADING",
            FlowState::Unauthorized => "UNAUTHORIZED",
            FlowState::LoadFailed => "LOAD_FAILED",
            FlowState::AlreadyPurchased => "ALREADY_PURCHASED",
            FlowState::AwaitingRates => "AWAITING_RATES",
            FlowState::ReadyToSelect => "READY_TO_SELECT",
            FlowState::Purchasing => "PURCHASING",
            FlowState::Purchased => "PURCHASED",
            FlowState::PurchaseFailed => "PURCHASE_FAILED",
        }
    }

    /// Terminal states end the flow instance.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FlowState::Unauthorized
                | FlowState::LoadFailed
                | FlowState::AlreadyPurchased
                | FlowState::Purchased
        )
    }

    /// Whether moving from `self` to `next` is a legal step.
    pub fn can_transition_to(&self, next: FlowState) -> bool {
        use FlowState::*;
        matches!(
            (self, next),
            (Loading, Unauthorized)
                | (Loading, LoadFailed)
                | (Loading, AlreadyPurchased)
                | (Loading, AwaitingRates)
                | (AwaitingRates, ReadyToSelect)
                | (ReadyToSelect, Purchasing)
                | (Purchasing, Purchased)
                | (Purchasing, PurchaseFailed)
                | (PurchaseFailed, ReadyToSelect)
        )
    }
}

impl std::fmt::Display for FlowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for FlowState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "LOADING" => Ok(FlowState::Loading),
            "UNAUTHORIZED" => Ok(FlowState::Unauthorized),
            "LOAD_FAILED" => Ok(FlowState::LoadFailed),
            "ALREADY_PURCHASED" => Ok(FlowState::AlreadyPurchased),
            "AWAITING_RATES" => Ok(FlowState::AwaitingRates),
            "READY_TO_SELECT" => Ok(FlowState::ReadyToSelect),
            "PURCHASING" => Ok(FlowState::Purchasing),
            "PURCHASED" => Ok(FlowState::Purchased),
            "PURCHASE_FAILED" => Ok(FlowState::PurchaseFailed),
            _ => Err(format!("Invalid flow state: {}", s)),
        }
    }
}
