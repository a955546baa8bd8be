//! In-process shipment repository for tests.
//!
//! Responses are queued per operation and handed out in FIFO order. A
//! response can be held back until a trigger fires, which lets tests park a
//! call mid-flight and observe the flow while it waits.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use super::{RatesStatus, ShipmentRepository};
use crate::domain::{RateId, Shipment, ShipmentId};
use crate::error::{LabelFlowError, Result};

/// Repository operation a call or response belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    FetchShipment,
    FetchRates,
    Purchase,
}

/// Record of a call made to the mock repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockCall {
    pub operation: Operation,
    pub shipment_id: ShipmentId,
    pub rate_id: Option<RateId>,
}

/// A queued response that can optionally wait for a trigger before completing.
enum MockResponse<T> {
    Immediate(Result<T>),
    Triggered {
        response: Result<T>,
        trigger: oneshot::Receiver<()>,
    },
}

impl<T> MockResponse<T> {
    async fn resolve(self) -> Result<T> {
        match self {
            MockResponse::Immediate(response) => response,
            MockResponse::Triggered { response, trigger } => {
                // Proceed on send or on sender drop alike
                let _ = trigger.await;
                response
            }
        }
    }
}

#[derive(Default)]
struct Queues {
    shipments: VecDeque<MockResponse<Shipment>>,
    rates: VecDeque<MockResponse<RatesStatus>>,
    purchases: VecDeque<MockResponse<Shipment>>,
    /// Served by `fetch_shipment` once its queue is drained.
    current: Option<Shipment>,
}

/// Mock shipment repository.
///
/// # Example
/// ```ignore
/// let repo = MockShipmentRepository::new();
/// repo.set_shipment(Shipment::new("S1"));
/// repo.add_rates_response(Ok(RatesStatus { is_refreshing: true }));
/// let trigger = repo.add_purchase_response_with_trigger(Ok(purchased));
/// // ... purchase is now parked ...
/// trigger.send(()).unwrap();
/// ```
#[derive(Clone, Default)]
pub struct MockShipmentRepository {
    queues: Arc<Mutex<Queues>>,
    calls: Arc<Mutex<Vec<MockCall>>>,
    in_flight: Arc<AtomicUsize>,
}

impl MockShipmentRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shipment returned by `fetch_shipment` whenever no queued response is left.
    pub fn set_shipment(&self, shipment: Shipment) {
        self.queues.lock().current = Some(shipment);
    }

    pub fn add_shipment_response(&self, response: Result<Shipment>) {
        self.queues
            .lock()
            .shipments
            .push_back(MockResponse::Immediate(response));
    }

    /// Queue a shipment response that completes only once the returned sender
    /// fires (or is dropped).
    pub fn add_shipment_response_with_trigger(
        &self,
        response: Result<Shipment>,
    ) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.queues.lock().shipments.push_back(MockResponse::Triggered {
            response,
            trigger: rx,
        });
        tx
    }

    /// Queue a quote job status. Once drained, `fetch_rates` reports the job
    /// as finished.
    pub fn add_rates_response(&self, response: Result<RatesStatus>) {
        self.queues
            .lock()
            .rates
            .push_back(MockResponse::Immediate(response));
    }

    pub fn add_purchase_response(&self, response: Result<Shipment>) {
        self.queues
            .lock()
            .purchases
            .push_back(MockResponse::Immediate(response));
    }

    pub fn add_purchase_response_with_trigger(
        &self,
        response: Result<Shipment>,
    ) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.queues.lock().purchases.push_back(MockResponse::Triggered {
            response,
            trigger: rx,
        });
        tx
    }

    /// Get all calls that have been made to this mock repository.
    pub fn get_calls(&self) -> Vec<MockCall> {
        self.calls.lock().clone()
    }

    /// Number of calls made for one operation.
    pub fn call_count(&self, operation: Operation) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|call| call.operation == operation)
            .count()
    }

    /// Number of calls currently executing.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    fn record(&self, operation: Operation, shipment_id: &ShipmentId, rate_id: Option<&RateId>) {
        self.calls.lock().push(MockCall {
            operation,
            shipment_id: shipment_id.clone(),
            rate_id: rate_id.cloned(),
        });
    }

    fn begin(&self) -> InFlightGuard {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        InFlightGuard {
            in_flight: self.in_flight.clone(),
        }
    }
}

#[async_trait]
impl ShipmentRepository for MockShipmentRepository {
    async fn fetch_shipment(&self, id: &ShipmentId) -> Result<Shipment> {
        let _guard = self.begin();
        self.record(Operation::FetchShipment, id, None);

        let queued = {
            let mut queues = self.queues.lock();
            match queues.shipments.pop_front() {
                Some(response) => Ok(response),
                None => queues
                    .current
                    .clone()
                    .filter(|shipment| &shipment.id == id)
                    .map(|shipment| MockResponse::Immediate(Ok(shipment)))
                    .ok_or_else(|| id.clone()),
            }
        };

        match queued {
            Ok(response) => response.resolve().await,
            Err(id) => Err(LabelFlowError::ShipmentNotFound(id)),
        }
    }

    async fn fetch_rates(&self, id: &ShipmentId) -> Result<RatesStatus> {
        let _guard = self.begin();
        self.record(Operation::FetchRates, id, None);

        let queued = self.queues.lock().rates.pop_front();
        match queued {
            Some(response) => response.resolve().await,
            None => Ok(RatesStatus {
                is_refreshing: false,
            }),
        }
    }

    async fn purchase(&self, id: &ShipmentId, rate_id: &RateId) -> Result<Shipment> {
        let _guard = self.begin();
        self.record(Operation::Purchase, id, Some(rate_id));

        let queued = self.queues.lock().purchases.pop_front();
        match queued {
            Some(response) => response.resolve().await,
            None => Err(LabelFlowError::Other(anyhow::anyhow!(
                "No mock purchase response configured for shipment {}",
                id
            ))),
        }
    }
}

/// Guard that decrements the in-flight counter when dropped.
struct InFlightGuard {
    in_flight: Arc<AtomicUsize>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_serves_queued_then_current_shipment() {
        let mock = MockShipmentRepository::new();
        let id = ShipmentId::from("S1");
        let mut first = Shipment::new("S1");
        first.purchase_error_message = Some("stale".to_string());
        mock.add_shipment_response(Ok(first.clone()));
        mock.set_shipment(Shipment::new("S1"));

        assert_eq!(mock.fetch_shipment(&id).await.unwrap(), first);
        assert_eq!(mock.fetch_shipment(&id).await.unwrap(), Shipment::new("S1"));
        assert!(matches!(
            mock.fetch_shipment(&ShipmentId::from("S2")).await,
            Err(LabelFlowError::ShipmentNotFound(_))
        ));
        assert_eq!(mock.call_count(Operation::FetchShipment), 3);
    }

    #[tokio::test]
    async fn test_mock_rates_default_to_finished() {
        let mock = MockShipmentRepository::new();
        let id = ShipmentId::from("S1");
        mock.add_rates_response(Ok(RatesStatus { is_refreshing: true }));

        assert!(mock.fetch_rates(&id).await.unwrap().is_refreshing);
        assert!(!mock.fetch_rates(&id).await.unwrap().is_refreshing);
    }

    #[tokio::test]
    async fn test_mock_purchase_without_response_fails() {
        let mock = MockShipmentRepository::new();
        let result = mock
            .purchase(&ShipmentId::from("S1"), &RateId::from("r1"))
            .await;

        assert!(result.is_err());
        let calls = mock.get_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].operation, Operation::Purchase);
        assert_eq!(calls[0].rate_id, Some(RateId::from("r1")));
    }

    #[tokio::test]
    async fn test_mock_purchase_with_trigger() {
        let mock = MockShipmentRepository::new();
        let trigger = mock.add_purchase_response_with_trigger(Ok(Shipment::new("S1")));

        let mock_clone = mock.clone();
        let handle = tokio::spawn(async move {
            mock_clone
                .purchase(&ShipmentId::from("S1"), &RateId::from("r1"))
                .await
        });

        tokio::time::sleep(tokio::time::Duration::from_millis(10)).await;
        assert!(!handle.is_finished());
        assert_eq!(mock.in_flight_count(), 1);

        trigger.send(()).unwrap();

        let shipment = handle.await.unwrap().unwrap();
        assert_eq!(shipment.id, ShipmentId::from("S1"));
        assert_eq!(mock.in_flight_count(), 0);
    }
}
