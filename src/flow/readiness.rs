//! One-way "first full data available" latch.

use serde::Serialize;

/// The independent reasons the flow may still be loading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LoadingSignals {
    /// The quote job is still in flight.
    pub is_refreshing: bool,
    /// The first shipment fetch has not completed.
    pub is_loading: bool,
    /// The poller is still waiting out the settle delay.
    pub is_waiting: bool,
    /// A shipment re-fetch is in flight.
    pub is_validating: bool,
}

impl LoadingSignals {
    /// Signals at the start of a flow: nothing is known yet.
    pub fn initial() -> Self {
        Self {
            is_refreshing: true,
            is_loading: true,
            is_waiting: true,
            is_validating: false,
        }
    }

    pub fn all_settled(&self) -> bool {
        !(self.is_refreshing || self.is_loading || self.is_waiting || self.is_validating)
    }
}

impl Default for LoadingSignals {
    fn default() -> Self {
        Self::initial()
    }
}

/// Latches to ready the first time every loading signal is clear at once,
/// and stays ready for the rest of the flow's life.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadinessGate {
    ready: bool,
}

impl ReadinessGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the current signals. Returns the (possibly just latched) flag.
    pub fn observe(&mut self, signals: LoadingSignals) -> bool {
        self.ready = self.ready || signals.all_settled();
        self.ready
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }
}
