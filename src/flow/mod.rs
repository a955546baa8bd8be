//! Controller for one label purchase flow.
//!
//! A [`FlowController`] is scoped to a single shipment and UI session. It
//! fetches the shipment, checks entry conditions once, watches the quote job
//! through a [`RatePoller`], latches readiness through a [`ReadinessGate`],
//! and hands the chosen rate to a [`PurchaseOrchestrator`]. The presentation
//! layer reads [`FlowSnapshot`]s and calls [`FlowController::select`] and
//! [`FlowController::confirm_purchase`].
//!
//! Async completions are applied in the order they arrive, but only if the
//! flow is still alive, the payload is for this flow's shipment, and no newer
//! fetch has already been applied.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::domain::{FlowId, FlowState, RateCatalog, RateId, RateOption, Shipment, ShipmentId};
use crate::error::{GENERIC_LOAD_ERROR, LabelFlowError, Result};
use crate::repository::{Action, Authorizer, ResourceType, ShipmentRepository};

pub mod poller;
pub mod purchase;
pub mod readiness;

pub use poller::{DeferredRefresh, PollerEvent, RatePoller};
pub use purchase::{PurchaseAttempt, PurchaseError, PurchaseOrchestrator};
pub use readiness::{LoadingSignals, ReadinessGate};

/// Configuration for a flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    /// Wait after the quote job is seen finished before the final shipment refresh
    pub settle_delay_ms: u64,

    /// How often to ask for the quote job status while it is running
    pub rates_poll_interval_ms: u64,

    /// Retries for the first shipment fetch (reads only; purchases are never retried)
    pub fetch_max_retries: u32,

    /// Base backoff for fetch retries in milliseconds (will be exponentially increased)
    pub fetch_backoff_ms: u64,

    /// Factor by which the fetch backoff is increased with each retry
    pub fetch_backoff_factor: u64,

    /// Maximum fetch backoff in milliseconds
    pub fetch_max_backoff_ms: u64,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            settle_delay_ms: 5000,
            rates_poll_interval_ms: 1000,
            fetch_max_retries: 3,
            fetch_backoff_ms: 250,
            fetch_backoff_factor: 2,
            fetch_max_backoff_ms: 4000,
        }
    }
}

impl FlowConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn rates_poll_interval(&self) -> Duration {
        Duration::from_millis(self.rates_poll_interval_ms)
    }

    /// Backoff before retry number `attempt` (0-based): `backoff * factor^attempt`, capped.
    pub fn fetch_backoff(&self, attempt: u32) -> Duration {
        let exponential = self
            .fetch_backoff_ms
            .saturating_mul(self.fetch_backoff_factor.saturating_pow(attempt));
        Duration::from_millis(exponential.min(self.fetch_max_backoff_ms))
    }
}

/// What the presentation layer sees of a flow at one point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlowSnapshot {
    /// Increases with every published change.
    pub revision: u64,
    pub flow_id: FlowId,
    pub shipment_id: ShipmentId,
    pub state: FlowState,
    pub is_ready: bool,
    pub is_polling: bool,
    /// Empty until the flow is ready.
    pub options: Vec<RateOption>,
    pub selected_rate_id: Option<RateId>,
    /// Whether the purchase trigger should be enabled.
    pub can_purchase: bool,
    pub is_purchasing: bool,
    pub purchase_error: Option<String>,
    /// Empty until the flow is ready.
    pub rate_errors: Vec<String>,
    /// Why the shipment could not be loaded; set with `LOAD_FAILED`.
    pub load_error: Option<String>,
}

/// Result of a purchase the flow accepted and ran.
#[derive(Debug, Clone, PartialEq)]
pub enum PurchaseOutcome {
    /// The label was bought; the flow is finished.
    Purchased(Shipment),
    /// The purchase failed; the flow is back to rate selection.
    Failed { message: String },
}

/// Private mutable state of a flow. Never held across an `.await`.
struct FlowInner {
    state: FlowState,
    signals: LoadingSignals,
    gate: ReadinessGate,
    is_polling: bool,
    shipment: Option<Shipment>,
    catalog: RateCatalog,
    selected_rate_id: Option<RateId>,
    purchase_error: Option<String>,
    load_error: Option<String>,
    revision: u64,
    /// Sequence number of the newest shipment fetch issued.
    issued_fetch_seq: u64,
    /// Sequence number of the newest shipment fetch applied.
    applied_fetch_seq: u64,
}

impl FlowInner {
    fn new() -> Self {
        Self {
            state: FlowState::Loading,
            signals: LoadingSignals::initial(),
            gate: ReadinessGate::new(),
            is_polling: false,
            shipment: None,
            catalog: RateCatalog::default(),
            selected_rate_id: None,
            purchase_error: None,
            load_error: None,
            revision: 0,
            issued_fetch_seq: 0,
            applied_fetch_seq: 0,
        }
    }

    /// The selection, if it names an option in the current catalog.
    fn selected_rate(&self) -> Option<&RateOption> {
        self.selected_rate_id
            .as_ref()
            .and_then(|rate_id| self.catalog.get(rate_id))
    }

    fn can_purchase(&self, is_purchasing: bool) -> bool {
        self.state == FlowState::ReadyToSelect && !is_purchasing && self.selected_rate().is_some()
    }
}

/// The label purchase state machine for one shipment.
pub struct FlowController<R, A>
where
    R: ShipmentRepository + ?Sized,
    A: Authorizer + ?Sized,
{
    flow_id: FlowId,
    shipment_id: ShipmentId,
    repository: Arc<R>,
    authorizer: Arc<A>,
    config: FlowConfig,
    orchestrator: PurchaseOrchestrator<R>,
    inner: Mutex<FlowInner>,
    snapshot_tx: watch::Sender<FlowSnapshot>,
    /// Cancelled on teardown (navigation away).
    shutdown_token: CancellationToken,
    /// Child of `shutdown_token`; also cancelled when the flow reaches a terminal state.
    done_token: CancellationToken,
    next_fetch_seq: AtomicU64,
    started_at: Instant,
}

impl<R, A> FlowController<R, A>
where
    R: ShipmentRepository + ?Sized + 'static,
    A: Authorizer + ?Sized + 'static,
{
    pub fn new(
        shipment_id: impl Into<ShipmentId>,
        repository: Arc<R>,
        authorizer: Arc<A>,
        config: FlowConfig,
    ) -> Self {
        let shipment_id = shipment_id.into();
        let flow_id = FlowId::from(uuid::Uuid::new_v4());
        let shutdown_token = CancellationToken::new();
        let done_token = shutdown_token.child_token();

        let (snapshot_tx, _) = watch::channel(FlowSnapshot {
            revision: 0,
            flow_id,
            shipment_id: shipment_id.clone(),
            state: FlowState::Loading,
            is_ready: false,
            is_polling: false,
            options: Vec::new(),
            selected_rate_id: None,
            can_purchase: false,
            is_purchasing: false,
            purchase_error: None,
            rate_errors: Vec::new(),
            load_error: None,
        });

        Self {
            flow_id,
            orchestrator: PurchaseOrchestrator::new(shipment_id.clone(), repository.clone()),
            shipment_id,
            repository,
            authorizer,
            config,
            inner: Mutex::new(FlowInner::new()),
            snapshot_tx,
            shutdown_token,
            done_token,
            next_fetch_seq: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    pub fn flow_id(&self) -> FlowId {
        self.flow_id
    }

    pub fn shipment_id(&self) -> &ShipmentId {
        &self.shipment_id
    }

    pub fn state(&self) -> FlowState {
        self.inner.lock().state
    }

    pub fn snapshot(&self) -> FlowSnapshot {
        self.snapshot_tx.borrow().clone()
    }

    /// Receive every snapshot the flow publishes from now on.
    pub fn subscribe(&self) -> watch::Receiver<FlowSnapshot> {
        self.snapshot_tx.subscribe()
    }

    pub fn can_purchase(&self) -> bool {
        self.inner
            .lock()
            .can_purchase(self.orchestrator.is_purchasing())
    }

    pub fn is_torn_down(&self) -> bool {
        self.shutdown_token.is_cancelled()
    }

    /// Tear the flow down. Pending timers stop and late completions are ignored.
    pub fn teardown(&self) {
        if !self.shutdown_token.is_cancelled() {
            tracing::info!(flow_id = %self.flow_id, shipment_id = %self.shipment_id, "Tearing down flow");
            self.shutdown_token.cancel();
        }
    }

    /// Spawn [`run`](Self::run) on the current runtime.
    pub fn start(self: &Arc<Self>) -> JoinHandle<Result<()>> {
        tokio::spawn(self.clone().run())
    }

    /// Drive the flow until it reaches a terminal state or is torn down.
    #[tracing::instrument(skip(self), fields(flow_id = %self.flow_id, shipment_id = %self.shipment_id))]
    pub async fn run(self: Arc<Self>) -> Result<()> {
        tracing::info!("Label purchase flow starting");

        if self.shipment_id.is_absent() {
            tracing::warn!("No shipment id, denying access");
            self.enter(FlowState::Unauthorized, None);
            return Ok(());
        }

        let shipment = match self.initial_fetch().await {
            Ok(Some(shipment)) => shipment,
            Ok(None) => {
                tracing::info!("Flow torn down during initial fetch");
                return Ok(());
            }
            Err(LabelFlowError::ShipmentNotFound(_)) => {
                tracing::warn!("Shipment not found, denying access");
                self.enter(FlowState::Unauthorized, None);
                return Ok(());
            }
            Err(e) => {
                tracing::error!(error = %e, "Initial shipment fetch failed, giving up");
                self.fail_load(&e);
                return Err(e);
            }
        };

        if shipment.is_purchased() {
            tracing::info!("Shipping label already purchased");
            self.enter(FlowState::AlreadyPurchased, Some(shipment));
            return Ok(());
        }

        if !self
            .authorizer
            .can_perform(Action::Update, ResourceType::Shipments)
        {
            tracing::warn!("Actor may not update shipments, denying access");
            self.enter(FlowState::Unauthorized, Some(shipment));
            return Ok(());
        }

        self.enter(FlowState::AwaitingRates, Some(shipment));

        let (poller_tx, mut poller_rx) = mpsc::unbounded_channel();
        let (fetch_tx, mut fetch_rx) = mpsc::unbounded_channel();

        let poller = RatePoller::new(
            self.shipment_id.clone(),
            self.config.rates_poll_interval(),
            self.config.settle_delay(),
            self.done_token.clone(),
        );
        let repository = self.repository.clone();
        let poller_handle =
            tokio::spawn(async move { poller.run(repository.as_ref(), poller_tx).await });

        loop {
            tokio::select! {
                biased;
                _ = self.done_token.cancelled() => break,
                Some(event) = poller_rx.recv() => self.handle_poller_event(event, &fetch_tx),
                Some((seq, result)) = fetch_rx.recv() => self.apply_fetch(seq, result),
            }
        }

        poller_handle.abort();

        if self.shutdown_token.is_cancelled() {
            tracing::info!("Flow torn down");
        } else {
            tracing::info!(state = %self.state(), "Flow finished");
        }
        Ok(())
    }

    /// Choose a rate. Only allowed while the flow is ready for selection.
    ///
    /// An id that is not among the current options is recorded but does not
    /// enable the purchase trigger.
    pub fn select(&self, rate_id: impl Into<RateId>) -> Result<()> {
        let rate_id = rate_id.into();
        let mut inner = self.inner.lock();

        if inner.state != FlowState::ReadyToSelect {
            return Err(LabelFlowError::InvalidState(
                self.shipment_id.clone(),
                inner.state.to_string(),
                FlowState::ReadyToSelect.to_string(),
            ));
        }
        if self.orchestrator.is_purchasing() {
            return Err(LabelFlowError::PurchaseInFlight(self.shipment_id.clone()));
        }

        if !inner.catalog.contains(&rate_id) {
            tracing::debug!(
                shipment_id = %self.shipment_id,
                rate_id = %rate_id,
                "Selected rate is not among the current options"
            );
        }
        inner.selected_rate_id = Some(rate_id);
        self.publish(inner);
        Ok(())
    }

    /// Buy the label for the selected rate.
    ///
    /// Guard failures (wrong state, no valid selection, a purchase already in
    /// flight, teardown) are errors. A purchase that was issued but failed
    /// remotely is an `Ok(PurchaseOutcome::Failed)`: the flow returns to
    /// selection with the message kept for display.
    #[tracing::instrument(skip(self), fields(flow_id = %self.flow_id, shipment_id = %self.shipment_id))]
    pub async fn confirm_purchase(&self) -> Result<PurchaseOutcome> {
        let attempt = {
            let mut inner = self.inner.lock();

            if self.shutdown_token.is_cancelled() {
                return Err(LabelFlowError::TornDown(self.shipment_id.clone()));
            }
            match inner.state {
                FlowState::ReadyToSelect => {}
                FlowState::Purchasing => {
                    return Err(LabelFlowError::PurchaseInFlight(self.shipment_id.clone()));
                }
                state => {
                    return Err(LabelFlowError::InvalidState(
                        self.shipment_id.clone(),
                        state.to_string(),
                        FlowState::ReadyToSelect.to_string(),
                    ));
                }
            }

            let Some(rate_id) = inner.selected_rate().map(|rate| rate.id.clone()) else {
                return Err(LabelFlowError::NoRateSelected(self.shipment_id.clone()));
            };

            let attempt = self
                .orchestrator
                .try_begin(rate_id)
                .map_err(|_| LabelFlowError::PurchaseInFlight(self.shipment_id.clone()))?;

            inner.purchase_error = None;
            self.transition(&mut inner, FlowState::Purchasing);
            self.publish(inner);
            attempt
        };

        let result = attempt.execute().await;

        if self.shutdown_token.is_cancelled() {
            counter!("labelflow_stale_responses_total", "reason" => "torn_down").increment(1);
            tracing::debug!("Dropping purchase outcome for torn down flow");
            return Err(LabelFlowError::TornDown(self.shipment_id.clone()));
        }

        let mut inner = self.inner.lock();
        let outcome = match result {
            Ok(shipment) => {
                self.transition(&mut inner, FlowState::Purchased);
                inner.shipment = Some(shipment.clone());
                self.done_token.cancel();
                PurchaseOutcome::Purchased(shipment)
            }
            Err(PurchaseError::Failed(message)) => {
                self.transition(&mut inner, FlowState::PurchaseFailed);
                inner.purchase_error = Some(message.clone());
                self.transition(&mut inner, FlowState::ReadyToSelect);
                PurchaseOutcome::Failed { message }
            }
            Err(PurchaseError::InFlight(id)) => {
                return Err(LabelFlowError::PurchaseInFlight(id));
            }
        };
        self.publish(inner);
        Ok(outcome)
    }

    /// First shipment fetch, retried with backoff on transient failures.
    /// `Ok(None)` means the flow was torn down while fetching.
    async fn initial_fetch(&self) -> Result<Option<Shipment>> {
        let mut attempt = 0;
        loop {
            let seq = self.next_fetch_seq.fetch_add(1, Ordering::Relaxed) + 1;
            let result = tokio::select! {
                biased;
                _ = self.done_token.cancelled() => return Ok(None),
                result = self.repository.fetch_shipment(&self.shipment_id) => result,
            };

            match result {
                Ok(shipment) if shipment.id != self.shipment_id => {
                    counter!("labelflow_stale_responses_total", "reason" => "shipment_mismatch")
                        .increment(1);
                    tracing::warn!(returned = %shipment.id, "Repository returned another shipment");
                    return Err(LabelFlowError::ShipmentNotFound(self.shipment_id.clone()));
                }
                Ok(shipment) => {
                    let mut inner = self.inner.lock();
                    inner.issued_fetch_seq = seq;
                    inner.applied_fetch_seq = seq;
                    return Ok(Some(shipment));
                }
                Err(e) if e.is_transient() && attempt < self.config.fetch_max_retries => {
                    let backoff = self.config.fetch_backoff(attempt);
                    tracing::warn!(
                        attempt = attempt + 1,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Shipment fetch failed, retrying"
                    );
                    attempt += 1;
                    tokio::select! {
                        biased;
                        _ = self.done_token.cancelled() => return Ok(None),
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// End a flow whose first fetch failed for good.
    fn fail_load(&self, error: &LabelFlowError) {
        self.inner.lock().load_error = Some(error.remote_message_or(GENERIC_LOAD_ERROR));
        self.enter(FlowState::LoadFailed, None);
    }

    /// Settle into the state chosen at entry, with the first shipment if any.
    fn enter(&self, state: FlowState, shipment: Option<Shipment>) {
        let mut inner = self.inner.lock();
        inner.signals.is_loading = false;

        if let Some(shipment) = shipment {
            inner.purchase_error = shipment.purchase_failure().map(str::to_string);
            inner.catalog = RateCatalog::from_shipment(&shipment);
            inner.shipment = Some(shipment);
        }

        self.transition(&mut inner, state);
        if state == FlowState::AwaitingRates {
            inner.is_polling = true;
        }
        if state.is_terminal() {
            self.done_token.cancel();
        }
        self.reevaluate(&mut inner);
        self.publish(inner);
    }

    fn handle_poller_event(
        &self,
        event: PollerEvent,
        fetch_tx: &mpsc::UnboundedSender<(u64, Result<Shipment>)>,
    ) {
        let mut inner = self.inner.lock();
        match event {
            PollerEvent::Refreshing(is_refreshing) => {
                inner.signals.is_refreshing = is_refreshing;
            }
            PollerEvent::Settled => {
                inner.signals.is_waiting = false;
                inner.is_polling = false;
                self.spawn_refresh(&mut inner, fetch_tx.clone());
            }
        }
        self.reevaluate(&mut inner);
        self.publish(inner);
    }

    /// Re-fetch the shipment in the background; the result comes back through `fetch_tx`.
    fn spawn_refresh(
        &self,
        inner: &mut FlowInner,
        fetch_tx: mpsc::UnboundedSender<(u64, Result<Shipment>)>,
    ) {
        let seq = self.next_fetch_seq.fetch_add(1, Ordering::Relaxed) + 1;
        inner.issued_fetch_seq = seq;
        inner.signals.is_validating = true;

        tracing::debug!(shipment_id = %self.shipment_id, seq, "Refreshing shipment");

        let repository = self.repository.clone();
        let shipment_id = self.shipment_id.clone();
        let token = self.done_token.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => {}
                result = repository.fetch_shipment(&shipment_id) => {
                    let _ = fetch_tx.send((seq, result));
                }
            }
        });
    }

    fn apply_fetch(&self, seq: u64, result: Result<Shipment>) {
        if self.done_token.is_cancelled() {
            counter!("labelflow_stale_responses_total", "reason" => "torn_down").increment(1);
            return;
        }

        let mut inner = self.inner.lock();
        if seq == inner.issued_fetch_seq {
            inner.signals.is_validating = false;
        }

        match result {
            Ok(shipment) if shipment.id != self.shipment_id => {
                counter!("labelflow_stale_responses_total", "reason" => "shipment_mismatch")
                    .increment(1);
                tracing::debug!(seq, returned = %shipment.id, "Dropping refresh for another shipment");
            }
            Ok(_) if seq < inner.applied_fetch_seq => {
                counter!("labelflow_stale_responses_total", "reason" => "superseded").increment(1);
                tracing::debug!(seq, applied = inner.applied_fetch_seq, "Dropping superseded refresh");
            }
            Ok(shipment) => {
                inner.applied_fetch_seq = seq;
                inner.catalog = RateCatalog::from_shipment(&shipment);
                inner.shipment = Some(shipment);
                tracing::debug!(
                    seq,
                    options = inner.catalog.options().len(),
                    rate_errors = inner.catalog.rate_errors().len(),
                    "Applied shipment refresh"
                );
            }
            Err(e) => {
                tracing::warn!(seq, error = %e, "Shipment refresh failed, keeping previous data");
            }
        }

        self.reevaluate(&mut inner);
        self.publish(inner);
    }

    /// Feed the readiness gate and open selection once it latches.
    fn reevaluate(&self, inner: &mut FlowInner) {
        let ready = inner.gate.observe(inner.signals);
        if ready && inner.state == FlowState::AwaitingRates {
            histogram!("labelflow_time_to_ready_seconds")
                .record(self.started_at.elapsed().as_secs_f64());
            tracing::info!(
                shipment_id = %self.shipment_id,
                options = inner.catalog.options().len(),
                rate_errors = inner.catalog.rate_errors().len(),
                "Rates ready for selection"
            );
            self.transition(inner, FlowState::ReadyToSelect);
        }
    }

    fn transition(&self, inner: &mut FlowInner, next: FlowState) -> bool {
        if !inner.state.can_transition_to(next) {
            tracing::warn!(
                shipment_id = %self.shipment_id,
                from = %inner.state,
                to = %next,
                "Ignoring illegal flow transition"
            );
            return false;
        }
        tracing::debug!(shipment_id = %self.shipment_id, from = %inner.state, to = %next, "Flow transition");
        inner.state = next;
        true
    }

    /// Publish the state in `inner`. The snapshot is built under the lock and
    /// sent after releasing it; an older revision never replaces a newer one.
    fn publish(&self, mut inner: MutexGuard<'_, FlowInner>) {
        inner.revision += 1;
        let is_ready = inner.gate.is_ready();
        let is_purchasing = self.orchestrator.is_purchasing();
        let (options, rate_errors) = if is_ready {
            (
                inner.catalog.options().to_vec(),
                inner.catalog.rate_errors().to_vec(),
            )
        } else {
            (Vec::new(), Vec::new())
        };

        let snapshot = FlowSnapshot {
            revision: inner.revision,
            flow_id: self.flow_id,
            shipment_id: self.shipment_id.clone(),
            state: inner.state,
            is_ready,
            is_polling: inner.is_polling,
            options,
            selected_rate_id: inner.selected_rate_id.clone(),
            can_purchase: inner.can_purchase(is_purchasing),
            is_purchasing,
            purchase_error: inner.purchase_error.clone(),
            rate_errors,
            load_error: inner.load_error.clone(),
        };
        drop(inner);

        self.snapshot_tx.send_if_modified(|current| {
            if snapshot.revision > current.revision {
                *current = snapshot;
                true
            } else {
                false
            }
        });
    }
}

impl<R, A> Drop for FlowController<R, A>
where
    R: ShipmentRepository + ?Sized,
    A: Authorizer + ?Sized,
{
    fn drop(&mut self) {
        self.shutdown_token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::RateQuote;
    use crate::repository::{MockShipmentRepository, StaticAuthorizer};

    type TestFlow = FlowController<MockShipmentRepository, StaticAuthorizer>;

    fn controller() -> (TestFlow, Arc<MockShipmentRepository>) {
        let repository = Arc::new(MockShipmentRepository::new());
        let flow = FlowController::new(
            "S1",
            repository.clone(),
            Arc::new(StaticAuthorizer::allow_all()),
            FlowConfig::default(),
        );
        (flow, repository)
    }

    fn shipment_with_rate(id: &str, rate_id: &str) -> Shipment {
        let mut shipment = Shipment::new(id);
        shipment.rates.push(RateQuote {
            id: RateId::from(rate_id),
            carrier: Some("UPS".to_string()),
            service: "Ground".to_string(),
            formatted_rate: "$5.00".to_string(),
            avatar_src: None,
        });
        shipment
    }

    #[tokio::test]
    async fn test_ready_only_after_settle_refresh_applies() {
        let (flow, repository) = controller();
        repository.set_shipment(shipment_with_rate("S1", "r1"));
        flow.enter(FlowState::AwaitingRates, Some(Shipment::new("S1")));
        let (fetch_tx, mut fetch_rx) = mpsc::unbounded_channel();

        flow.handle_poller_event(PollerEvent::Refreshing(false), &fetch_tx);
        assert!(!flow.snapshot().is_ready);
        assert!(flow.snapshot().is_polling);

        flow.handle_poller_event(PollerEvent::Settled, &fetch_tx);
        let snapshot = flow.snapshot();
        assert!(!snapshot.is_ready, "refresh still in flight");
        assert!(!snapshot.is_polling);
        assert_eq!(snapshot.state, FlowState::AwaitingRates);

        let (seq, result) = fetch_rx.recv().await.unwrap();
        flow.apply_fetch(seq, result);

        let snapshot = flow.snapshot();
        assert!(snapshot.is_ready);
        assert_eq!(snapshot.state, FlowState::ReadyToSelect);
        assert_eq!(snapshot.options.len(), 1);
        assert_eq!(snapshot.options[0].id, RateId::from("r1"));
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_previous_data_and_still_settles() {
        let (flow, repository) = controller();
        repository.add_shipment_response(Err(LabelFlowError::Remote {
            status: Some(500),
            message: "boom".to_string(),
        }));
        flow.enter(FlowState::AwaitingRates, Some(shipment_with_rate("S1", "r1")));
        let (fetch_tx, mut fetch_rx) = mpsc::unbounded_channel();

        flow.handle_poller_event(PollerEvent::Refreshing(false), &fetch_tx);
        flow.handle_poller_event(PollerEvent::Settled, &fetch_tx);
        let (seq, result) = fetch_rx.recv().await.unwrap();
        assert!(result.is_err());
        flow.apply_fetch(seq, result);

        let snapshot = flow.snapshot();
        assert_eq!(snapshot.state, FlowState::ReadyToSelect);
        assert_eq!(snapshot.options.len(), 1);
    }

    #[test]
    fn test_superseded_refresh_is_dropped() {
        let (flow, _) = controller();
        flow.enter(FlowState::AwaitingRates, Some(shipment_with_rate("S1", "new")));
        {
            let mut inner = flow.inner.lock();
            inner.issued_fetch_seq = 3;
            inner.applied_fetch_seq = 3;
        }

        flow.apply_fetch(2, Ok(shipment_with_rate("S1", "old")));

        let inner = flow.inner.lock();
        assert_eq!(inner.applied_fetch_seq, 3);
        assert!(inner.catalog.contains(&RateId::from("new")));
        assert!(!inner.catalog.contains(&RateId::from("old")));
    }

    #[test]
    fn test_refresh_for_other_shipment_is_dropped() {
        let (flow, _) = controller();
        flow.enter(FlowState::AwaitingRates, Some(Shipment::new("S1")));

        flow.apply_fetch(2, Ok(shipment_with_rate("S2", "r9")));

        let inner = flow.inner.lock();
        assert!(inner.catalog.is_empty());
        assert_eq!(inner.shipment.as_ref().map(|s| s.id.clone()), Some(ShipmentId::from("S1")));
    }

    #[test]
    fn test_completion_after_teardown_is_dropped() {
        let (flow, _) = controller();
        flow.enter(FlowState::AwaitingRates, Some(Shipment::new("S1")));
        flow.teardown();

        flow.apply_fetch(2, Ok(shipment_with_rate("S1", "r1")));

        assert!(flow.is_torn_down());
        assert!(flow.inner.lock().catalog.is_empty());
        assert!(!flow.snapshot().is_ready);
    }

    #[test]
    fn test_entry_surfaces_previous_remote_failure() {
        let (flow, _) = controller();
        let mut shipment = Shipment::new("S1");
        shipment.purchase_error_message = Some("Address invalid".to_string());

        flow.enter(FlowState::AwaitingRates, Some(shipment));

        assert_eq!(flow.snapshot().purchase_error.as_deref(), Some("Address invalid"));
    }

    #[test]
    fn test_terminal_entry_stops_the_flow() {
        let (flow, _) = controller();

        flow.enter(FlowState::Unauthorized, None);

        assert_eq!(flow.state(), FlowState::Unauthorized);
        assert!(flow.done_token.is_cancelled());
        assert!(!flow.is_torn_down());
    }

    #[test]
    fn test_state_readable_while_publish_waits_on_a_snapshot_borrow() {
        let (flow, _) = controller();
        flow.enter(FlowState::AwaitingRates, Some(shipment_with_rate("S1", "r1")));
        flow.inner.lock().state = FlowState::ReadyToSelect;
        let rx = flow.subscribe();
        let before = flow.snapshot().revision;

        std::thread::scope(|scope| {
            let held = rx.borrow();
            let selecting = scope.spawn(|| flow.select("r1"));
            std::thread::sleep(Duration::from_millis(50));

            // The selecting thread waits on the snapshot, not on the flow state.
            assert_eq!(flow.state(), FlowState::ReadyToSelect);

            drop(held);
            selecting.join().unwrap().unwrap();
        });

        let snapshot = flow.snapshot();
        assert_eq!(snapshot.selected_rate_id, Some(RateId::from("r1")));
        assert!(snapshot.revision > before);
    }

    #[test]
    fn test_illegal_transition_is_ignored() {
        let (flow, _) = controller();
        let mut inner = flow.inner.lock();

        assert!(!flow.transition(&mut inner, FlowState::Purchased));
        assert_eq!(inner.state, FlowState::Loading);
    }

    #[test]
    fn test_select_before_ready_is_rejected() {
        let (flow, _) = controller();
        flow.enter(FlowState::AwaitingRates, Some(shipment_with_rate("S1", "r1")));

        assert!(matches!(
            flow.select("r1"),
            Err(LabelFlowError::InvalidState(..))
        ));
        assert!(flow.snapshot().options.is_empty(), "catalog hidden until ready");
    }

    #[test]
    fn test_fetch_backoff_is_exponential_and_capped() {
        let config = FlowConfig::default();

        assert_eq!(config.fetch_backoff(0), Duration::from_millis(250));
        assert_eq!(config.fetch_backoff(1), Duration::from_millis(500));
        assert_eq!(config.fetch_backoff(3), Duration::from_millis(2000));
        assert_eq!(config.fetch_backoff(10), Duration::from_millis(4000));
        assert_eq!(config.fetch_backoff(u32::MAX), Duration::from_millis(4000));
    }

    #[test]
    fn test_config_from_partial_json() {
        let config: FlowConfig =
            serde_json::from_str(r#"{"settle_delay_ms": 2000}"#).unwrap();

        assert_eq!(config.settle_delay(), Duration::from_millis(2000));
        assert_eq!(config.rates_poll_interval(), Duration::from_millis(1000));
        assert_eq!(config.fetch_max_retries, 3);
    }
}
