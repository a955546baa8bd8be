//! Quote job polling with a single settle-delayed refresh.
//!
//! Rate quoting is a one-shot backend job per shipment. The poller asks for
//! the job status on a fixed cadence until it is observed finished, then
//! waits out the settle delay and asks the flow for exactly one more shipment
//! refresh before stopping.
//!
//! ```text
//! fetch_rates ─refreshing─> sleep(poll_interval) ─> fetch_rates ─finished─> sleep(settle_delay) ─> Settled
//! ```

use std::future::Future;
use std::time::Duration;

use metrics::counter;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::domain::ShipmentId;
use crate::repository::ShipmentRepository;

/// What the poller reports back to its flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerEvent {
    /// Latest observation of the quote job.
    Refreshing(bool),
    /// The settle delay has elapsed; the flow should re-fetch the shipment.
    Settled,
}

/// A task that runs once after a delay unless cancelled first.
///
/// Dropping the handle aborts the task, so a deferred refresh never outlives
/// the poller that scheduled it.
pub struct DeferredRefresh {
    handle: JoinHandle<()>,
}

impl DeferredRefresh {
    pub fn schedule<F>(delay: Duration, token: CancellationToken, task: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    tracing::debug!("Deferred refresh cancelled before firing");
                }
                _ = tokio::time::sleep(delay) => {
                    counter!("labelflow_settle_refreshes_total").increment(1);
                    task.await;
                }
            }
        });
        Self { handle }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait until the task has fired or been cancelled.
    pub async fn finished(&mut self) {
        if let Err(e) = (&mut self.handle).await
            && !e.is_cancelled()
        {
            tracing::error!(error = %e, "Deferred refresh panicked");
        }
    }
}

impl Drop for DeferredRefresh {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Watches the quote job of one shipment.
pub struct RatePoller {
    shipment_id: ShipmentId,
    poll_interval: Duration,
    settle_delay: Duration,
    token: CancellationToken,
    /// Last observed job state; a fresh poller assumes the job is running.
    was_refreshing: bool,
    pending: Option<DeferredRefresh>,
}

impl RatePoller {
    pub fn new(
        shipment_id: ShipmentId,
        poll_interval: Duration,
        settle_delay: Duration,
        token: CancellationToken,
    ) -> Self {
        Self {
            shipment_id,
            poll_interval,
            settle_delay,
            token,
            was_refreshing: true,
            pending: None,
        }
    }

    /// Feed one observation of the quote job.
    ///
    /// On a refreshing -> finished edge, `refresh` is scheduled to run once
    /// after the settle delay, replacing any refresh still pending from an
    /// earlier edge. Returns whether a refresh was scheduled.
    pub fn observe<F>(&mut self, is_refreshing: bool, refresh: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let finished_edge = self.was_refreshing && !is_refreshing;
        self.was_refreshing = is_refreshing;

        if !finished_edge || self.token.is_cancelled() {
            return false;
        }

        tracing::debug!(
            shipment_id = %self.shipment_id,
            settle_delay_ms = self.settle_delay.as_millis() as u64,
            "Quote job finished, scheduling settle refresh"
        );
        self.pending = Some(DeferredRefresh::schedule(
            self.settle_delay,
            self.token.clone(),
            refresh,
        ));
        true
    }

    /// A settle refresh is scheduled and has not fired yet.
    pub fn has_pending(&self) -> bool {
        self.pending.as_ref().is_some_and(|p| !p.is_finished())
    }

    /// Poll the quote job until it finishes, then wait for the settle refresh
    /// to fire. Returns early when the token is cancelled or the flow stops
    /// listening.
    ///
    /// A failed status call counts as "finished": fetch errors are the
    /// repository's concern and the settle refresh goes ahead regardless.
    #[tracing::instrument(skip_all, fields(shipment_id = %self.shipment_id))]
    pub async fn run<R>(mut self, repository: &R, events: mpsc::UnboundedSender<PollerEvent>)
    where
        R: ShipmentRepository + ?Sized,
    {
        tracing::debug!("Rate polling started");

        loop {
            let status = tokio::select! {
                biased;
                _ = self.token.cancelled() => {
                    tracing::debug!("Rate polling cancelled");
                    return;
                }
                status = repository.fetch_rates(&self.shipment_id) => status,
            };
            counter!("labelflow_rate_polls_total").increment(1);

            let is_refreshing = match status {
                Ok(status) => status.is_refreshing,
                Err(e) => {
                    tracing::warn!(error = %e, "Quote job status unavailable, treating as finished");
                    false
                }
            };

            if events.send(PollerEvent::Refreshing(is_refreshing)).is_err() {
                tracing::debug!("Flow stopped listening, ending rate polling");
                return;
            }

            let settled_tx = events.clone();
            if self.observe(is_refreshing, async move {
                let _ = settled_tx.send(PollerEvent::Settled);
            }) {
                break;
            }

            tokio::select! {
                biased;
                _ = self.token.cancelled() => {
                    tracing::debug!("Rate polling cancelled");
                    return;
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        if let Some(pending) = self.pending.as_mut() {
            pending.finished().await;
        }
        tracing::debug!("Rate polling finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LabelFlowError;
    use crate::repository::{MockShipmentRepository, Operation, RatesStatus};
    use tokio::time::Instant;

    const SETTLE: Duration = Duration::from_millis(5000);
    const POLL: Duration = Duration::from_millis(1000);

    fn poller(token: &CancellationToken) -> RatePoller {
        RatePoller::new(ShipmentId::from("S1"), POLL, SETTLE, token.clone())
    }

    fn settle_sender(tx: &mpsc::UnboundedSender<PollerEvent>) -> impl Future<Output = ()> + use<> {
        let tx = tx.clone();
        async move {
            let _ = tx.send(PollerEvent::Settled);
        }
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_one_refresh_per_finished_edge() {
        let token = CancellationToken::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut poller = poller(&token);

        assert!(!poller.observe(true, settle_sender(&tx)));
        assert!(poller.observe(false, settle_sender(&tx)));
        // Still finished: no new edge, nothing new scheduled
        assert!(!poller.observe(false, settle_sender(&tx)));
        assert!(poller.has_pending());

        tokio::time::sleep(SETTLE + Duration::from_millis(1)).await;
        assert_eq!(rx.try_recv(), Ok(PollerEvent::Settled));
        assert!(rx.try_recv().is_err());

        // A second job run produces a second edge and exactly one more refresh
        assert!(!poller.observe(true, settle_sender(&tx)));
        assert!(poller.observe(false, settle_sender(&tx)));
        tokio::time::sleep(SETTLE * 3).await;
        assert_eq!(rx.try_recv(), Ok(PollerEvent::Settled));
        assert!(rx.try_recv().is_err());
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_refresh_fires_only_after_settle_delay() {
        let token = CancellationToken::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut poller = poller(&token);

        poller.observe(false, settle_sender(&tx));

        tokio::time::sleep(SETTLE - Duration::from_millis(1)).await;
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(rx.try_recv(), Ok(PollerEvent::Settled));
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_cancelling_before_delay_prevents_refresh() {
        let token = CancellationToken::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut poller = poller(&token);

        assert!(poller.observe(false, settle_sender(&tx)));
        tokio::time::sleep(Duration::from_millis(1000)).await;
        token.cancel();

        tokio::time::sleep(SETTLE * 2).await;
        assert!(rx.try_recv().is_err());
        assert!(!poller.has_pending());
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_dropping_poller_aborts_pending_refresh() {
        let token = CancellationToken::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut poller = poller(&token);

        assert!(poller.observe(false, settle_sender(&tx)));
        drop(poller);

        tokio::time::sleep(SETTLE * 2).await;
        assert!(rx.try_recv().is_err());
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_run_polls_until_finished_then_settles() {
        let repository = MockShipmentRepository::new();
        repository.add_rates_response(Ok(RatesStatus { is_refreshing: true }));
        repository.add_rates_response(Ok(RatesStatus { is_refreshing: true }));

        let token = CancellationToken::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let started = Instant::now();

        poller(&token).run(&repository, tx).await;

        assert!(started.elapsed() >= POLL * 2 + SETTLE);
        assert_eq!(repository.call_count(Operation::FetchRates), 3);

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert_eq!(
            events,
            vec![
                PollerEvent::Refreshing(true),
                PollerEvent::Refreshing(true),
                PollerEvent::Refreshing(false),
                PollerEvent::Settled,
            ]
        );
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_run_treats_status_failure_as_finished() {
        let repository = MockShipmentRepository::new();
        repository.add_rates_response(Err(LabelFlowError::Remote {
            status: Some(503),
            message: "quote service unavailable".to_string(),
        }));

        let token = CancellationToken::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        poller(&token).run(&repository, tx).await;

        assert_eq!(rx.try_recv(), Ok(PollerEvent::Refreshing(false)));
        assert_eq!(rx.try_recv(), Ok(PollerEvent::Settled));
        assert_eq!(repository.call_count(Operation::FetchRates), 1);
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_run_stops_on_cancellation() {
        let repository = MockShipmentRepository::new();
        for _ in 0..100 {
            repository.add_rates_response(Ok(RatesStatus { is_refreshing: true }));
        }

        let token = CancellationToken::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(2500)).await;
            canceller.cancel();
        });

        poller(&token).run(&repository, tx).await;

        assert_eq!(repository.call_count(Operation::FetchRates), 3);
        let mut settled = false;
        while let Ok(event) = rx.try_recv() {
            settled |= event == PollerEvent::Settled;
        }
        assert!(!settled);
    }
}
