//! Selectable rate options derived from a shipment snapshot.

use std::collections::HashSet;

use serde::Serialize;

use super::shipment::{RateId, RateQuote, Shipment};

/// One selectable rate, ready for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateOption {
    pub id: RateId,
    pub service: String,
    pub carrier: Option<String>,
    pub formatted_rate: String,
    pub avatar_src: Option<String>,
}

impl From<&RateQuote> for RateOption {
    fn from(quote: &RateQuote) -> Self {
        RateOption {
            id: quote.id.clone(),
            service: quote.service.clone(),
            carrier: quote.carrier.clone(),
            formatted_rate: quote.formatted_rate.clone(),
            avatar_src: quote.avatar_src.clone(),
        }
    }
}

/// Rate options and carrier error lines for one shipment snapshot.
///
/// Options keep the server's order; a repeated quote id keeps its first
/// occurrence. An empty rate list is a valid, empty catalog.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RateCatalog {
    options: Vec<RateOption>,
    rate_errors: Vec<String>,
}

impl RateCatalog {
    pub fn from_shipment(shipment: &Shipment) -> Self {
        let mut seen = HashSet::new();
        let options = shipment
            .rates
            .iter()
            .filter(|quote| seen.insert(quote.id.clone()))
            .map(RateOption::from)
            .collect::<Vec<_>>();

        if options.len() < shipment.rates.len() {
            tracing::debug!(
                shipment_id = %shipment.id,
                quotes = shipment.rates.len(),
                options = options.len(),
                "Dropped duplicate rate quotes"
            );
        }

        let rate_errors = shipment
            .rate_errors
            .iter()
            .map(|error| error.display_message())
            .collect();

        Self {
            options,
            rate_errors,
        }
    }

    pub fn options(&self) -> &[RateOption] {
        &self.options
    }

    pub fn rate_errors(&self) -> &[String] {
        &self.rate_errors
    }

    pub fn get(&self, rate_id: &RateId) -> Option<&RateOption> {
        self.options.iter().find(|option| &option.id == rate_id)
    }

    pub fn contains(&self, rate_id: &RateId) -> bool {
        self.get(rate_id).is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.options.is_empty()
    }
}
