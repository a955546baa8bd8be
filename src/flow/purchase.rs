//! Exactly-once label purchase for one shipment.
//!
//! The purchase action is irreversible and not idempotent remotely, so the
//! orchestrator enforces at most one attempt in flight per shipment and never
//! retries on its own. An attempt is a token: claiming it flips the in-flight
//! flag synchronously, before any `.await`, and dropping it (after
//! completion, failure, or the future being abandoned) releases the flag.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use metrics::{counter, histogram};
use scopeguard::ScopeGuard;
use thiserror::Error;

use crate::domain::{RateId, Shipment, ShipmentId};
use crate::repository::ShipmentRepository;

/// Why a purchase did not go through.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PurchaseError {
    /// Rejected locally: another attempt for this shipment is still pending.
    #[error("Purchase already in progress for shipment {0}")]
    InFlight(ShipmentId),

    /// The remote system refused or failed the purchase.
    #[error("{0}")]
    Failed(String),
}

type InFlightRelease = ScopeGuard<Arc<AtomicBool>, fn(Arc<AtomicBool>)>;

fn release_in_flight(flag: Arc<AtomicBool>) {
    flag.store(false, Ordering::Release);
}

/// Runs purchases for one shipment, one at a time.
pub struct PurchaseOrchestrator<R: ?Sized> {
    shipment_id: ShipmentId,
    repository: Arc<R>,
    in_flight: Arc<AtomicBool>,
}

impl<R> PurchaseOrchestrator<R>
where
    R: ShipmentRepository + ?Sized,
{
    pub fn new(shipment_id: ShipmentId, repository: Arc<R>) -> Self {
        Self {
            shipment_id,
            repository,
            in_flight: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_purchasing(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Claim the in-flight token for a purchase of `rate_id`.
    ///
    /// Fails with [`PurchaseError::InFlight`] while another attempt holds it.
    pub fn try_begin(&self, rate_id: RateId) -> Result<PurchaseAttempt<R>, PurchaseError> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            counter!("labelflow_purchases_total", "outcome" => "rejected").increment(1);
            tracing::warn!(
                shipment_id = %self.shipment_id,
                rate_id = %rate_id,
                "Purchase rejected, another attempt is still in flight"
            );
            return Err(PurchaseError::InFlight(self.shipment_id.clone()));
        }

        Ok(PurchaseAttempt {
            shipment_id: self.shipment_id.clone(),
            rate_id,
            repository: self.repository.clone(),
            _release: scopeguard::guard(
                self.in_flight.clone(),
                release_in_flight as fn(Arc<AtomicBool>),
            ),
        })
    }

    /// Claim the token and run the purchase to completion.
    pub async fn purchase(&self, rate_id: &RateId) -> Result<Shipment, PurchaseError> {
        self.try_begin(rate_id.clone())?.execute().await
    }
}

/// A claimed purchase slot. Holding one keeps the shipment marked as purchasing.
pub struct PurchaseAttempt<R: ?Sized> {
    shipment_id: ShipmentId,
    rate_id: RateId,
    repository: Arc<R>,
    _release: InFlightRelease,
}

impl<R> PurchaseAttempt<R>
where
    R: ShipmentRepository + ?Sized,
{
    pub fn rate_id(&self) -> &RateId {
        &self.rate_id
    }

    /// Issue the purchase action once and classify the outcome.
    ///
    /// Remote failures, whether returned as errors or reported on the
    /// returned shipment, come back as [`PurchaseError::Failed`] carrying a
    /// message fit for display.
    #[tracing::instrument(skip(self), fields(shipment_id = %self.shipment_id, rate_id = %self.rate_id))]
    pub async fn execute(self) -> Result<Shipment, PurchaseError> {
        tracing::info!("Purchasing shipping label");
        let started = Instant::now();

        let outcome = match self
            .repository
            .purchase(&self.shipment_id, &self.rate_id)
            .await
        {
            Ok(shipment) => match shipment.purchase_failure() {
                Some(message) => Err(message.to_string()),
                None => Ok(shipment),
            },
            Err(e) => {
                tracing::error!(error = %e, "Purchase call failed");
                Err(e.user_message())
            }
        };

        histogram!("labelflow_purchase_duration_seconds").record(started.elapsed().as_secs_f64());

        match outcome {
            Ok(shipment) => {
                counter!("labelflow_purchases_total", "outcome" => "purchased").increment(1);
                if !shipment.is_purchased() {
                    tracing::debug!("Purchase accepted, completion not yet visible on shipment");
                }
                tracing::info!("Shipping label purchased");
                Ok(shipment)
            }
            Err(message) => {
                counter!("labelflow_purchases_total", "outcome" => "failed").increment(1);
                tracing::warn!(error = %message, "Shipping label purchase failed");
                Err(PurchaseError::Failed(message))
            }
        }
    }
}
