//! Drives one trading cycle through the staged pipeline.
//!
//! The orchestrator owns the single active-cycle slot. Each cycle runs its
//! stages in sequence, checking the cooperative stop flag and the risk
//! emergency state before every stage. Every transition is persisted and
//! emitted; a terminal cycle always carries a summary.

use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, info, instrument, warn};

use super::types::*;
use crate::broker::BrokerClient;
use crate::config::{Config, ModeProfile};
use crate::error::{CycleError, ExecutionError};
use crate::events::{CycleEvent, EventSink};
use crate::execution::OrderManager;
use crate::persistence::{AuditEvent, AuditKind, TradeStore};
use crate::providers::{CatalystScorer, MarketDataFeed, PatternDetector, TechnicalConfirmer};
use crate::risk::{ApprovedTrade, RiskDecision, RiskValidator};
use crate::strategy::{
    rank_candidates, Candidate, FilterStage, ProposalBuilder, Stage, StageParams, StagePipeline,
    UniverseSelector,
};

/// External systems a cycle talks to.
pub struct Collaborators {
    pub feed: Arc<dyn MarketDataFeed>,
    pub catalyst: Arc<dyn CatalystScorer>,
    pub pattern: Arc<dyn PatternDetector>,
    pub technical: Arc<dyn TechnicalConfirmer>,
    pub broker: Arc<dyn BrokerClient>,
    pub store: Arc<dyn TradeStore>,
    pub sink: Arc<dyn EventSink>,
}

impl Collaborators {
    /// One provider set backing the feed and every signal source.
    pub fn from_providers<P>(
        providers: Arc<P>,
        broker: Arc<dyn BrokerClient>,
        store: Arc<dyn TradeStore>,
        sink: Arc<dyn EventSink>,
    ) -> Self
    where
        P: MarketDataFeed + CatalystScorer + PatternDetector + TechnicalConfirmer + 'static,
    {
        Self {
            feed: providers.clone(),
            catalyst: providers.clone(),
            pattern: providers.clone(),
            technical: providers,
            broker,
            store,
            sink,
        }
    }
}

#[derive(Default)]
struct Slot {
    active: Option<CycleHandle>,
    /// The running cycle, or the last one to finish
    current: Option<Cycle>,
    stop_reason: Option<String>,
}

/// How a cycle ended before reaching `Monitoring` normally.
type StageResult = Result<(), AbortReason>;

pub struct CycleOrchestrator {
    config: Config,
    universe: UniverseSelector,
    pipeline: StagePipeline,
    proposals: ProposalBuilder,
    feed: Arc<dyn MarketDataFeed>,
    broker: Arc<dyn BrokerClient>,
    store: Arc<dyn TradeStore>,
    sink: Arc<dyn EventSink>,
    risk: Arc<RiskValidator>,
    orders: Arc<OrderManager>,
    slot: RwLock<Slot>,
}

impl CycleOrchestrator {
    pub fn new(config: Config, collaborators: Collaborators) -> Self {
        let risk = Arc::new(RiskValidator::new(&config.risk));
        let orders = Arc::new(OrderManager::new(
            collaborators.broker.clone(),
            risk.clone(),
            collaborators.store.clone(),
            collaborators.sink.clone(),
            config.execution.clone(),
        ));

        Self {
            universe: UniverseSelector::new(config.universe.clone()),
            pipeline: StagePipeline::new(
                collaborators.catalyst,
                collaborators.pattern,
                collaborators.technical,
            ),
            proposals: ProposalBuilder::new(config.risk.clone()),
            feed: collaborators.feed,
            broker: collaborators.broker,
            store: collaborators.store,
            sink: collaborators.sink,
            risk,
            orders,
            slot: RwLock::new(Slot::default()),
            config,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn risk(&self) -> Arc<RiskValidator> {
        self.risk.clone()
    }

    pub fn orders(&self) -> Arc<OrderManager> {
        self.orders.clone()
    }

    // =========================================================================
    // Public contract
    // =========================================================================

    /// Claim the active-cycle slot.
    pub async fn start_cycle(&self, request: CycleRequest) -> Result<CycleHandle, CycleError> {
        let mode = request.mode.unwrap_or(self.config.cycle.mode);
        let limits = match request.limits {
            Some(limits) => limits,
            None => CycleLimits::from_profile(self.config.modes.profile(mode), &self.config.risk),
        };
        limits.validate()?;

        let mut slot = self.slot.write().await;
        if let Some(active) = &slot.active {
            return Err(CycleError::AlreadyActive {
                cycle_id: active.cycle_id,
            });
        }

        let cycle = Cycle::new(CycleId::new(), mode, limits.clone());
        let handle = CycleHandle::new(cycle.id, mode, limits);
        if let Err(e) = self.store.record_cycle(&cycle) {
            warn!(cycle_id = %cycle.id, error = %e, "Failed to persist cycle");
        }

        info!(
            cycle_id = %cycle.id,
            mode = %mode,
            max_positions = handle.limits.max_positions,
            max_risk_per_trade = %handle.limits.max_risk_per_trade,
            max_daily_loss = %handle.limits.max_daily_loss,
            "Cycle started"
        );

        slot.active = Some(handle.clone());
        slot.current = Some(cycle);
        slot.stop_reason = None;
        Ok(handle)
    }

    /// Ask the active cycle to stop before its next stage.
    pub async fn stop_cycle(&self, reason: &str) -> StopAck {
        let mut slot = self.slot.write().await;
        match slot.active.clone() {
            Some(handle) => {
                handle.request_stop();
                slot.stop_reason = Some(reason.to_string());
                info!(cycle_id = %handle.cycle_id, reason, "Cycle stop requested");
                StopAck {
                    cycle_id: Some(handle.cycle_id),
                    accepted: true,
                    reason: reason.to_string(),
                }
            }
            None => StopAck {
                cycle_id: None,
                accepted: false,
                reason: "no active cycle".to_string(),
            },
        }
    }

    pub async fn status(&self) -> CycleSnapshot {
        let slot = self.slot.read().await;
        CycleSnapshot {
            status: slot
                .current
                .as_ref()
                .map(|c| c.status)
                .unwrap_or(CycleStatus::Idle),
            active: slot.active.is_some(),
            cycle: slot.current.clone(),
        }
    }

    /// Start a cycle and drive it to a terminal state.
    pub async fn run_once(&self, request: CycleRequest) -> Result<CycleSnapshot, CycleError> {
        let handle = self.start_cycle(request).await?;
        Ok(self.run(&handle).await)
    }

    /// Drive a claimed cycle to `Completed` or `Aborted`.
    #[instrument(skip(self, handle), fields(cycle_id = %handle.cycle_id.short(), mode = %handle.mode))]
    pub async fn run(&self, handle: &CycleHandle) -> CycleSnapshot {
        let claimed = {
            let slot = self.slot.read().await;
            match (&slot.active, &slot.current) {
                (Some(active), Some(cycle)) if active.cycle_id == handle.cycle_id => {
                    Some(cycle.clone())
                }
                _ => None,
            }
        };
        let Some(mut cycle) = claimed else {
            warn!(cycle_id = %handle.cycle_id, "Run requested for a cycle that does not hold the slot");
            return self.status().await;
        };

        let profile = self.config.modes.profile(handle.mode).clone();
        match self.drive(handle, &profile, &mut cycle).await {
            Ok(()) => {
                let note = cycle.completion_note.clone();
                self.transition(&mut cycle, CycleStatus::Completed, note).await;
            }
            Err(reason) => self.abort(&mut cycle, reason).await,
        }

        let summary = cycle.summary.clone().unwrap_or_else(|| cycle.summary_text());
        info!(
            cycle_id = %cycle.id,
            status = %cycle.status,
            degraded = cycle.degraded,
            summary = %summary,
            "Cycle finished"
        );
        self.sink.emit(&CycleEvent::CycleCompleted {
            cycle_id: cycle.id,
            status: cycle.status,
            degraded: cycle.degraded,
            summary,
        });
        if let Err(e) = self.store.record_cycle(&cycle) {
            warn!(cycle_id = %cycle.id, error = %e, "Failed to persist cycle");
        }

        let mut slot = self.slot.write().await;
        slot.active = None;
        slot.stop_reason = None;
        slot.current = Some(cycle);
        CycleSnapshot {
            status: slot
                .current
                .as_ref()
                .map(|c| c.status)
                .unwrap_or(CycleStatus::Idle),
            active: false,
            cycle: slot.current.clone(),
        }
    }

    /// Clear a latched emergency and let the order manager submit again.
    pub async fn resume(&self) {
        self.risk.reset_emergency().await;
        self.orders.resume().await;
        info!("Trading resumed");
    }

    // =========================================================================
    // Stages
    // =========================================================================

    async fn drive(
        &self,
        handle: &CycleHandle,
        profile: &ModeProfile,
        cycle: &mut Cycle,
    ) -> StageResult {
        // Scanning
        self.enter(handle, cycle, CycleStatus::Scanning).await?;
        let members = self
            .universe
            .select(self.feed.as_ref())
            .await
            .map_err(|e| match e {
                CycleError::DataUnavailable(detail) => AbortReason::DataUnavailable(detail),
                other => AbortReason::DataUnavailable(other.to_string()),
            })?;

        let mut candidates: Vec<Candidate> = members
            .into_iter()
            .map(|m| Candidate::new(cycle.id, m.instrument, m.last_price, m.dollar_volume))
            .collect();
        cycle.counters.scanned = candidates.len();
        self.record_candidates(cycle.id, Stage::Universe, &candidates);
        if candidates.is_empty() {
            cycle.completion_note = Some("no candidates after Universe".to_string());
            return Ok(());
        }

        // Catalyst, Pattern, Technical
        for (status, stage) in [
            (CycleStatus::CatalystFiltering, FilterStage::Catalyst),
            (CycleStatus::PatternFiltering, FilterStage::Pattern),
            (CycleStatus::TechnicalFiltering, FilterStage::Technical),
        ] {
            self.enter(handle, cycle, status).await?;

            let params = self.stage_params(stage, profile);
            let (passed, report) = self.pipeline.filter(stage, candidates, &params).await;

            match stage {
                FilterStage::Catalyst => cycle.counters.catalyst_passed = passed.len(),
                FilterStage::Pattern => cycle.counters.pattern_passed = passed.len(),
                FilterStage::Technical => cycle.counters.technical_passed = passed.len(),
            }
            if report.degraded || report.provider_timeouts > 0 {
                cycle.degraded = true;
            }
            cycle.stage_reports.push(report.clone());
            self.sink.emit(&CycleEvent::StageCompleted {
                cycle_id: cycle.id,
                report: report.clone(),
            });
            self.record_candidates(cycle.id, stage.stage(), &passed);

            if report.aborted {
                return Err(AbortReason::StageFailed(stage.stage()));
            }
            if report.degraded && self.config.cycle.abort_on_degraded_stage {
                return Err(AbortReason::StageDegraded(stage.stage()));
            }
            if passed.is_empty() {
                cycle.completion_note = Some(format!("no candidates after {}", stage.stage()));
                return Ok(());
            }
            candidates = passed;
        }

        let selected = rank_candidates(
            candidates,
            &self.config.pipeline.weights,
            self.config.pipeline.tie_break,
            self.config.pipeline.final_selection_size,
        );
        cycle.counters.selected = selected.len();
        self.record_candidates(cycle.id, Stage::Selected, &selected);

        // RiskValidating
        self.enter(handle, cycle, CycleStatus::RiskValidating).await?;
        let approved = self.validate(handle, cycle, &selected).await?;
        if approved.is_empty() {
            cycle.completion_note = Some("no proposals approved".to_string());
            return Ok(());
        }

        // Executing
        if let Err(reason) = self.enter(handle, cycle, CycleStatus::Executing).await {
            for trade in &approved {
                self.risk.release(trade.instrument()).await;
            }
            return Err(reason);
        }
        self.execute(handle, cycle, approved).await;

        // Monitoring
        self.enter(handle, cycle, CycleStatus::Monitoring).await?;
        let result = self.monitor(handle, cycle).await;
        cycle.counters.positions_opened = self.orders.positions_for(cycle.id).await.len();
        result
    }

    async fn validate(
        &self,
        handle: &CycleHandle,
        cycle: &mut Cycle,
        selected: &[Candidate],
    ) -> Result<Vec<ApprovedTrade>, AbortReason> {
        let account = tokio::time::timeout(self.broker_timeout(), self.broker.get_account())
            .await
            .map_err(|_| AbortReason::AccountUnavailable("account read timed out".to_string()))?
            .map_err(|e| AbortReason::AccountUnavailable(e.to_string()))?;
        let equity = account.equity;
        self.check_daily_loss(equity, handle.limits.max_daily_loss).await?;

        let mut approved = Vec::new();
        for candidate in selected {
            let proposal = match self.proposals.build(candidate, equity, handle.limits.max_risk_per_trade) {
                Ok(proposal) => proposal,
                Err(e) => {
                    warn!(symbol = %candidate.symbol(), error = %e, "Could not size proposal");
                    cycle.counters.rejected += 1;
                    continue;
                }
            };
            cycle.counters.proposals += 1;

            match self.risk.validate(&proposal, &handle.limits, equity).await {
                RiskDecision::Approved(trade) => {
                    cycle.counters.approved += 1;
                    self.sink.emit(&CycleEvent::ProposalApproved {
                        cycle_id: cycle.id,
                        symbol: candidate.symbol().to_string(),
                        quantity: trade.quantity(),
                        risk: trade.risk,
                        resized: trade.resized,
                    });
                    approved.push(trade);
                }
                RiskDecision::Rejected(reason) => {
                    cycle.counters.rejected += 1;
                    self.sink.emit(&CycleEvent::RiskRejected {
                        cycle_id: cycle.id,
                        instrument: candidate.id(),
                        symbol: candidate.symbol().to_string(),
                        limit: reason.limit_name(),
                        reason,
                    });
                }
            }
        }

        info!(
            cycle_id = %cycle.id,
            equity = %equity,
            proposals = cycle.counters.proposals,
            approved = cycle.counters.approved,
            rejected = cycle.counters.rejected,
            "Risk validation complete"
        );
        Ok(approved)
    }

    async fn execute(&self, handle: &CycleHandle, cycle: &mut Cycle, approved: Vec<ApprovedTrade>) {
        for trade in approved {
            if handle.is_stop_requested() {
                // no new submissions once a stop is requested
                self.risk.release(trade.instrument()).await;
                continue;
            }

            let symbol = trade.proposal.instrument().symbol.clone();
            match self.orders.submit_order(&trade).await {
                Ok(order) => {
                    cycle.counters.orders_submitted += 1;
                    debug!(client_order_id = %order.client_order_id, status = %order.status, "Entry accepted");
                }
                Err(ExecutionError::Broker(e)) => {
                    // outcome unknown; reconciliation will settle it
                    cycle.counters.orders_submitted += 1;
                    warn!(symbol = %symbol, error = %e, "Entry submission unconfirmed");
                }
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, "Entry not submitted");
                }
            }
        }
    }

    /// Reconcile until every entry of the cycle is terminal or the window closes.
    async fn monitor(&self, handle: &CycleHandle, cycle: &Cycle) -> StageResult {
        let window = Duration::from_secs(self.config.cycle.monitor_window_secs);
        let interval = Duration::from_secs(self.config.execution.reconcile_interval_secs.max(1));
        let deadline = tokio::time::Instant::now() + window;

        loop {
            let report = self.orders.reconcile().await;
            if report.invariant_violations > 0 {
                return Err(AbortReason::InvariantViolation(format!(
                    "{} position(s) without a valid stop-loss",
                    report.invariant_violations
                )));
            }

            self.mark_to_market().await;
            match tokio::time::timeout(self.broker_timeout(), self.broker.get_account()).await {
                Ok(Ok(account)) => {
                    self.check_daily_loss(account.equity, handle.limits.max_daily_loss)
                        .await?
                }
                Ok(Err(e)) => warn!(error = %e, "Account read failed during monitoring"),
                Err(_) => warn!("Account read timed out during monitoring"),
            }
            if let Some(reason) = self.risk.emergency_reason().await {
                return Err(AbortReason::EmergencyMode(reason));
            }
            if handle.is_stop_requested() {
                return Err(AbortReason::Stopped(self.stop_reason().await));
            }

            let working = self.orders.active_entries(cycle.id).await;
            if working == 0 {
                debug!(cycle_id = %cycle.id, "All entries settled");
                return Ok(());
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                warn!(
                    cycle_id = %cycle.id,
                    working,
                    "Monitor window elapsed with entries still working"
                );
                return Ok(());
            }
            tokio::time::sleep(interval.min(deadline - now)).await;
        }
    }

    async fn mark_to_market(&self) {
        let snapshots = match tokio::time::timeout(self.broker_timeout(), self.feed.liquidity_snapshot()).await {
            Ok(Ok(snapshots)) => snapshots,
            _ => {
                debug!("No prices for mark to market");
                return;
            }
        };
        let prices: HashMap<_, _> = snapshots
            .into_iter()
            .map(|s| (s.instrument.id, s.last_price))
            .collect();
        let unrealized = self.orders.mark_to_market(&prices).await;
        debug!(unrealized = %unrealized, "Positions marked to market");
    }

    async fn check_daily_loss(&self, equity: Decimal, max_daily_loss: Decimal) -> StageResult {
        if let Some(loss_pct) = self.risk.record_equity(equity, max_daily_loss, Utc::now()).await {
            let reason = format!("daily loss {loss_pct} breached limit {max_daily_loss}");
            error!(target: "risk_alert", %equity, %loss_pct, "DAILY LOSS LIMIT BREACHED");
            self.sink.emit(&CycleEvent::EmergencyTriggered {
                reason: reason.clone(),
            });
            if let Err(e) = self
                .store
                .record_audit(&AuditEvent::new(AuditKind::EmergencyTriggered, "risk", reason))
            {
                warn!(error = %e, "Failed to persist audit event");
            }
            return Err(AbortReason::DailyLossLimit { loss_pct });
        }
        Ok(())
    }

    // =========================================================================
    // Transitions
    // =========================================================================

    /// Check stop and emergency, then move to the next stage.
    async fn enter(&self, handle: &CycleHandle, cycle: &mut Cycle, to: CycleStatus) -> StageResult {
        if handle.is_stop_requested() {
            return Err(AbortReason::Stopped(self.stop_reason().await));
        }
        if let Some(reason) = self.risk.emergency_reason().await {
            return Err(AbortReason::EmergencyMode(reason));
        }
        self.transition(cycle, to, None).await;
        Ok(())
    }

    async fn transition(&self, cycle: &mut Cycle, to: CycleStatus, note: Option<String>) {
        let Some(transition) = cycle.transition(to, note) else {
            return;
        };

        info!(
            cycle_id = %cycle.id.short(),
            from = %transition.from,
            to = %transition.to,
            "Cycle transition"
        );
        if let Err(e) = self.store.record_transition(cycle.id, &transition) {
            warn!(cycle_id = %cycle.id, error = %e, "Failed to persist transition");
        }
        self.sink.emit(&CycleEvent::Transition {
            cycle_id: cycle.id,
            from: transition.from,
            to: transition.to,
            note: transition.note.clone(),
            at: transition.at,
        });

        let mut slot = self.slot.write().await;
        if slot.active.as_ref().is_some_and(|a| a.cycle_id == cycle.id) {
            slot.current = Some(cycle.clone());
        }
    }

    async fn abort(&self, cycle: &mut Cycle, reason: AbortReason) {
        warn!(cycle_id = %cycle.id, reason = %reason, "Cycle aborting");

        if reason.requires_flatten() {
            let ack = self.orders.force_close_all(&reason.to_string()).await;
            if ack.failures.is_empty() {
                info!(
                    positions = ack.positions,
                    close_orders = ack.close_orders,
                    cancelled = ack.cancelled_orders,
                    "Positions flattened"
                );
            } else {
                error!(
                    target: "risk_alert",
                    failures = ?ack.failures,
                    "Some positions could not be closed"
                );
            }
        }

        let note = reason.to_string();
        cycle.abort_reason = Some(reason);
        self.transition(cycle, CycleStatus::Aborted, Some(note)).await;
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn stage_params(&self, stage: FilterStage, profile: &ModeProfile) -> StageParams {
        let cycle = &self.config.cycle;
        let pipeline = &self.config.pipeline;
        StageParams {
            threshold: match stage {
                FilterStage::Catalyst => profile.catalyst_threshold,
                FilterStage::Pattern => profile.pattern_threshold,
                FilterStage::Technical => profile.technical_threshold,
            },
            min_confirming_indicators: pipeline.min_confirming_indicators,
            concurrency: pipeline.concurrency,
            provider_timeout: Duration::from_millis(cycle.provider_timeout_ms),
            stage_budget: Duration::from_secs(cycle.stage_budget_secs),
            max_failure_fraction: cycle.max_failure_fraction,
            catalyst_window_hours: pipeline.catalyst_window_hours,
            timeframe: pipeline.timeframe,
        }
    }

    fn broker_timeout(&self) -> Duration {
        Duration::from_secs(self.config.execution.broker_timeout_secs)
    }

    async fn stop_reason(&self) -> String {
        self.slot
            .read()
            .await
            .stop_reason
            .clone()
            .unwrap_or_else(|| "stop requested".to_string())
    }

    fn record_candidates(&self, cycle_id: CycleId, stage: Stage, candidates: &[Candidate]) {
        if let Err(e) = self.store.record_candidates(cycle_id, stage, candidates) {
            warn!(cycle_id = %cycle_id, stage = %stage, error = %e, "Failed to persist candidates");
        }
    }
}
