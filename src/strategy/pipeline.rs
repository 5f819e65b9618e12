//! Staged candidate filtering with bounded concurrency and stage deadlines.
//!
//! Every stage fans provider calls out through a semaphore-bounded pool of
//! spawned tasks and waits for all of them (or the stage deadline) before
//! returning. Per-instrument failures remove only that instrument.

use futures_util::future::BoxFuture;
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant as StdInstant};
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};

use super::candidate::{Candidate, FilterStage, Stage};
use crate::error::ProviderError;
use crate::providers::{
    is_unit_score, CatalystScorer, CatalystSignal, InstrumentId, PatternDetector, PatternSignal,
    TechnicalConfirmer, TechnicalSignal, Timeframe,
};
use crate::utils::decimal::safe_div;

/// Parameters for one stage run.
#[derive(Debug, Clone)]
pub struct StageParams {
    /// Minimum score to pass
    pub threshold: Decimal,
    /// Technical stage only
    pub min_confirming_indicators: u32,
    pub concurrency: usize,
    pub provider_timeout: Duration,
    pub stage_budget: Duration,
    pub max_failure_fraction: Decimal,
    pub catalyst_window_hours: u32,
    pub timeframe: Timeframe,
}

/// One failed provider call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderFailure {
    pub instrument: InstrumentId,
    pub symbol: String,
    pub error: String,
    pub timed_out: bool,
}

/// Outcome of a stage run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageReport {
    pub stage: Stage,
    pub input_count: usize,
    pub passed: usize,
    pub below_threshold: usize,
    pub insufficient_confirmation: usize,
    pub out_of_sequence: usize,
    pub provider_errors: usize,
    pub provider_timeouts: usize,
    pub failure_rate: Decimal,
    pub degraded: bool,
    pub aborted: bool,
    pub budget_exceeded: bool,
    pub failures: Vec<ProviderFailure>,
    pub elapsed_ms: u64,
}

impl StageReport {
    fn new(stage: Stage, input_count: usize) -> Self {
        Self {
            stage,
            input_count,
            passed: 0,
            below_threshold: 0,
            insufficient_confirmation: 0,
            out_of_sequence: 0,
            provider_errors: 0,
            provider_timeouts: 0,
            failure_rate: Decimal::ZERO,
            degraded: false,
            aborted: false,
            budget_exceeded: false,
            failures: Vec::new(),
            elapsed_ms: 0,
        }
    }

    /// Calls actually sent to the provider.
    pub fn dispatched(&self) -> usize {
        self.input_count - self.out_of_sequence
    }

    /// Calls that produced an answer, passing or not.
    pub fn responded(&self) -> usize {
        self.dispatched() - self.provider_errors - self.provider_timeouts
    }

    pub fn failed(&self) -> usize {
        self.provider_errors + self.provider_timeouts
    }

    fn finalize(&mut self, max_failure_fraction: Decimal, started: StdInstant) {
        let dispatched = self.dispatched();
        self.failure_rate = safe_div(
            Decimal::from(self.failed() as u64),
            Decimal::from(dispatched as u64),
        );
        self.degraded = self.failure_rate > max_failure_fraction;
        self.aborted = dispatched > 0 && self.responded() == 0;
        self.elapsed_ms = started.elapsed().as_millis() as u64;
    }

    fn record_failure(&mut self, candidate: &Candidate, error: &ProviderError) {
        if error.is_timeout() {
            self.provider_timeouts += 1;
        } else {
            self.provider_errors += 1;
        }
        self.failures.push(ProviderFailure {
            instrument: candidate.id(),
            symbol: candidate.symbol().to_string(),
            error: error.to_string(),
            timed_out: error.is_timeout(),
        });
    }

    /// One-line human summary, e.g. `Catalyst 35/100 passed (2 errors, 1 timeouts)`.
    pub fn summary_line(&self) -> String {
        let mut line = format!("{} {}/{} passed", self.stage, self.passed, self.input_count);
        if self.failed() > 0 {
            line.push_str(&format!(
                " ({} errors, {} timeouts)",
                self.provider_errors, self.provider_timeouts
            ));
        }
        if self.budget_exceeded {
            line.push_str(" [budget exceeded]");
        }
        if self.degraded {
            line.push_str(" [degraded]");
        }
        line
    }
}

/// Signal returned by one provider call.
#[derive(Debug, Clone)]
enum Signal {
    Catalyst(CatalystSignal),
    Pattern(PatternSignal),
    Technical(TechnicalSignal),
}

/// Why an answered candidate did not pass.
#[derive(Debug, Clone, Copy)]
enum Verdict {
    Pass,
    BelowThreshold,
    InsufficientConfirmation,
}

/// Runs the provider-backed filter stages.
pub struct StagePipeline {
    catalyst: Arc<dyn CatalystScorer>,
    pattern: Arc<dyn PatternDetector>,
    technical: Arc<dyn TechnicalConfirmer>,
}

impl StagePipeline {
    pub fn new(
        catalyst: Arc<dyn CatalystScorer>,
        pattern: Arc<dyn PatternDetector>,
        technical: Arc<dyn TechnicalConfirmer>,
    ) -> Self {
        Self {
            catalyst,
            pattern,
            technical,
        }
    }

    /// Filter `candidates` through one stage.
    ///
    /// Returns the survivors (in input order) and the stage report.
    #[instrument(skip(self, candidates, params), fields(stage = %stage, input = candidates.len()))]
    pub async fn filter(
        &self,
        stage: FilterStage,
        candidates: Vec<Candidate>,
        params: &StageParams,
    ) -> (Vec<Candidate>, StageReport) {
        let started = StdInstant::now();
        let mut report = StageReport::new(stage.stage(), candidates.len());

        let (eligible, skipped): (Vec<Candidate>, Vec<Candidate>) = candidates
            .into_iter()
            .partition(|c| c.stage_reached == stage.prerequisite());

        for candidate in &skipped {
            warn!(
                symbol = %candidate.symbol(),
                reached = %candidate.stage_reached,
                required = %stage.prerequisite(),
                "Candidate out of sequence, dropped"
            );
        }
        report.out_of_sequence = skipped.len();

        let (results, budget_exceeded) = self.dispatch(stage, &eligible, params).await;
        report.budget_exceeded = budget_exceeded;

        let mut passed = Vec::with_capacity(eligible.len());
        for (mut candidate, result) in eligible.into_iter().zip(results) {
            match result {
                Ok(signal) => match Self::evaluate(stage, &mut candidate, signal, params) {
                    Ok(Verdict::Pass) => {
                        candidate.stage_reached = stage.stage();
                        passed.push(candidate);
                    }
                    Ok(Verdict::BelowThreshold) => report.below_threshold += 1,
                    Ok(Verdict::InsufficientConfirmation) => report.insufficient_confirmation += 1,
                    Err(e) => {
                        debug!(symbol = %candidate.symbol(), error = %e, "Provider answer rejected");
                        report.record_failure(&candidate, &e);
                    }
                },
                Err(e) => {
                    debug!(symbol = %candidate.symbol(), error = %e, "Provider call failed");
                    report.record_failure(&candidate, &e);
                }
            }
        }

        report.passed = passed.len();
        report.finalize(params.max_failure_fraction, started);

        info!(
            stage = %stage,
            input = report.input_count,
            passed = report.passed,
            below_threshold = report.below_threshold,
            insufficient_confirmation = report.insufficient_confirmation,
            out_of_sequence = report.out_of_sequence,
            provider_errors = report.provider_errors,
            provider_timeouts = report.provider_timeouts,
            degraded = report.degraded,
            elapsed_ms = report.elapsed_ms,
            "Stage complete"
        );

        (passed, report)
    }

    /// Fan out one provider call per candidate. Results are in input order.
    async fn dispatch(
        &self,
        stage: FilterStage,
        candidates: &[Candidate],
        params: &StageParams,
    ) -> (Vec<Result<Signal, ProviderError>>, bool) {
        let semaphore = Arc::new(Semaphore::new(params.concurrency.max(1)));
        let deadline = tokio::time::Instant::now() + params.stage_budget;
        let provider = stage.provider_name();
        let call_timeout = params.provider_timeout;
        let after_ms = call_timeout.as_millis() as u64;

        let mut handles = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let sem = semaphore.clone();
            let call = self.call(stage, candidate.id(), params);

            handles.push(tokio::spawn(async move {
                let _permit = sem.acquire_owned().await.map_err(|e| ProviderError::Failed {
                    provider,
                    reason: e.to_string(),
                })?;

                match tokio::time::timeout(call_timeout, call).await {
                    Ok(result) => result,
                    Err(_) => Err(ProviderError::Timeout { provider, after_ms }),
                }
            }));
        }

        let mut results = Vec::with_capacity(handles.len());
        let mut budget_exceeded = false;
        let budget_ms = params.stage_budget.as_millis() as u64;

        for mut handle in handles {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(result)) => results.push(result),
                Ok(Err(join_err)) => results.push(Err(ProviderError::Failed {
                    provider,
                    reason: format!("provider task failed: {join_err}"),
                })),
                Err(_) => {
                    handle.abort();
                    budget_exceeded = true;
                    results.push(Err(ProviderError::Timeout {
                        provider,
                        after_ms: budget_ms,
                    }));
                }
            }
        }

        if budget_exceeded {
            warn!(stage = %stage, budget_ms, "Stage budget exhausted, outstanding calls timed out");
        }

        (results, budget_exceeded)
    }

    fn call(
        &self,
        stage: FilterStage,
        id: InstrumentId,
        params: &StageParams,
    ) -> BoxFuture<'static, Result<Signal, ProviderError>> {
        match stage {
            FilterStage::Catalyst => {
                let scorer = self.catalyst.clone();
                let window = params.catalyst_window_hours;
                Box::pin(async move { scorer.score(id, window).await.map(Signal::Catalyst) })
            }
            FilterStage::Pattern => {
                let detector = self.pattern.clone();
                let timeframe = params.timeframe;
                Box::pin(async move { detector.detect(id, timeframe).await.map(Signal::Pattern) })
            }
            FilterStage::Technical => {
                let confirmer = self.technical.clone();
                let timeframe = params.timeframe;
                Box::pin(
                    async move { confirmer.confirm(id, timeframe).await.map(Signal::Technical) },
                )
            }
        }
    }

    /// Record the signal on the candidate and decide whether it passes.
    ///
    /// Scores outside [0, 1] are treated as provider errors.
    fn evaluate(
        stage: FilterStage,
        candidate: &mut Candidate,
        signal: Signal,
        params: &StageParams,
    ) -> Result<Verdict, ProviderError> {
        let provider = stage.provider_name();
        let out_of_range = |value: Decimal| ProviderError::Failed {
            provider,
            reason: format!("score {value} outside [0, 1]"),
        };

        let verdict = match (stage, signal) {
            (FilterStage::Catalyst, Signal::Catalyst(s)) => {
                if !is_unit_score(s.strength) {
                    return Err(out_of_range(s.strength));
                }
                let pass = s.strength >= params.threshold;
                candidate.catalyst = Some(s);
                if pass {
                    Verdict::Pass
                } else {
                    Verdict::BelowThreshold
                }
            }
            (FilterStage::Pattern, Signal::Pattern(s)) => {
                if !is_unit_score(s.confidence) {
                    return Err(out_of_range(s.confidence));
                }
                let pass = s.confidence >= params.threshold;
                candidate.pattern = Some(s);
                if pass {
                    Verdict::Pass
                } else {
                    Verdict::BelowThreshold
                }
            }
            (FilterStage::Technical, Signal::Technical(s)) => {
                if !is_unit_score(s.strength) {
                    return Err(out_of_range(s.strength));
                }
                let verdict = if s.strength < params.threshold {
                    Verdict::BelowThreshold
                } else if s.confirming_indicators < params.min_confirming_indicators {
                    Verdict::InsufficientConfirmation
                } else {
                    Verdict::Pass
                };
                candidate.technical = Some(s);
                verdict
            }
            (stage, other) => {
                return Err(ProviderError::Failed {
                    provider,
                    reason: format!("unexpected signal {other:?} for stage {stage}"),
                })
            }
        };

        Ok(verdict)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cycle::CycleId;
    use crate::providers::{
        Fault, InMemoryProviders, Instrument, MockCatalystScorer, MockPatternDetector,
        MockTechnicalConfirmer, SignalKind,
    };
    use rust_decimal_macros::dec;

    fn params(threshold: Decimal) -> StageParams {
        StageParams {
            threshold,
            min_confirming_indicators: 3,
            concurrency: 4,
            provider_timeout: Duration::from_millis(200),
            stage_budget: Duration::from_secs(2),
            max_failure_fraction: dec!(0.5),
            catalyst_window_hours: 24,
            timeframe: Timeframe::Minutes15,
        }
    }

    fn candidates(cycle_id: CycleId, n: u64) -> Vec<Candidate> {
        (1..=n)
            .map(|id| {
                Candidate::new(
                    cycle_id,
                    Instrument::new(id, format!("T{id}")),
                    dec!(25),
                    dec!(50000000),
                )
            })
            .collect()
    }

    fn pipeline(providers: Arc<InMemoryProviders>) -> StagePipeline {
        StagePipeline::new(providers.clone(), providers.clone(), providers)
    }

    // =========================================================================
    // Thresholds
    // =========================================================================

    #[tokio::test]
    async fn test_catalyst_threshold_is_inclusive() {
        let providers = Arc::new(InMemoryProviders::new());
        providers.set_catalyst(InstrumentId(1), dec!(0.30), "earnings").await;
        providers.set_catalyst(InstrumentId(2), dec!(0.29), "earnings").await;
        providers.set_catalyst(InstrumentId(3), dec!(0.95), "fda").await;

        let cycle_id = CycleId::new();
        let (passed, report) = pipeline(providers)
            .filter(FilterStage::Catalyst, candidates(cycle_id, 3), &params(dec!(0.30)))
            .await;

        let ids: Vec<u64> = passed.iter().map(|c| c.id().0).collect();
        assert_eq!(ids, vec![1, 3]);
        assert!(passed.iter().all(|c| c.stage_reached == Stage::Catalyst));
        assert_eq!(passed[1].catalyst.as_ref().unwrap().category, "fda");
        assert_eq!(report.below_threshold, 1);
        assert_eq!(report.passed, 2);
        assert!(!report.degraded);
        assert!(!report.aborted);
    }

    #[tokio::test]
    async fn test_technical_requires_confirming_indicators() {
        let providers = Arc::new(InMemoryProviders::new());
        providers.set_technical(InstrumentId(1), dec!(0.80), 3).await;
        providers.set_technical(InstrumentId(2), dec!(0.80), 2).await;
        providers.set_technical(InstrumentId(3), dec!(0.60), 5).await;

        let mut input = candidates(CycleId::new(), 3);
        for c in &mut input {
            c.stage_reached = Stage::Pattern;
        }

        let (passed, report) = pipeline(providers)
            .filter(FilterStage::Technical, input, &params(dec!(0.70)))
            .await;

        assert_eq!(passed.len(), 1);
        assert_eq!(passed[0].id(), InstrumentId(1));
        assert_eq!(report.insufficient_confirmation, 1);
        assert_eq!(report.below_threshold, 1);
    }

    #[tokio::test]
    async fn test_out_of_sequence_candidates_never_advance() {
        let providers = Arc::new(InMemoryProviders::new());
        providers.set_pattern(InstrumentId(1), "bull_flag", dec!(0.9), None).await;
        providers.set_pattern(InstrumentId(2), "bull_flag", dec!(0.9), None).await;

        let mut input = candidates(CycleId::new(), 2);
        input[0].stage_reached = Stage::Catalyst;
        // instrument 2 never passed the catalyst stage

        let (passed, report) = pipeline(providers.clone())
            .filter(FilterStage::Pattern, input, &params(dec!(0.6)))
            .await;

        assert_eq!(passed.len(), 1);
        assert_eq!(passed[0].id(), InstrumentId(1));
        assert_eq!(report.out_of_sequence, 1);
        assert_eq!(providers.call_count(SignalKind::Pattern).await, 1);
    }

    // =========================================================================
    // Failures
    // =========================================================================

    #[tokio::test]
    async fn test_provider_error_removes_only_that_instrument() {
        let providers = Arc::new(InMemoryProviders::new());
        for id in 1..=4 {
            providers.set_catalyst(InstrumentId(id), dec!(0.8), "merger").await;
        }
        providers
            .inject(SignalKind::Catalyst, InstrumentId(2), Fault::Error("500".into()))
            .await;

        let (passed, report) = pipeline(providers)
            .filter(FilterStage::Catalyst, candidates(CycleId::new(), 4), &params(dec!(0.3)))
            .await;

        assert_eq!(passed.len(), 3);
        assert_eq!(report.provider_errors, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].instrument, InstrumentId(2));
        assert_eq!(report.failure_rate, dec!(0.25));
        assert!(!report.degraded);
    }

    #[tokio::test]
    async fn test_failure_rate_above_fraction_is_degraded() {
        let providers = Arc::new(InMemoryProviders::new());
        for id in 1..=10 {
            providers.set_catalyst(InstrumentId(id), dec!(0.8), "merger").await;
        }
        for id in 1..=6 {
            providers
                .inject(SignalKind::Catalyst, InstrumentId(id), Fault::Error("503".into()))
                .await;
        }

        let (passed, report) = pipeline(providers)
            .filter(FilterStage::Catalyst, candidates(CycleId::new(), 10), &params(dec!(0.3)))
            .await;

        assert_eq!(passed.len(), 4);
        assert_eq!(report.failure_rate, dec!(0.6));
        assert!(report.degraded);
        assert!(!report.aborted);
    }

    #[tokio::test]
    async fn test_exactly_half_failing_is_not_degraded() {
        let providers = Arc::new(InMemoryProviders::new());
        for id in 1..=4 {
            providers.set_catalyst(InstrumentId(id), dec!(0.8), "merger").await;
        }
        for id in 1..=2 {
            providers
                .inject(SignalKind::Catalyst, InstrumentId(id), Fault::Error("503".into()))
                .await;
        }

        let (_, report) = pipeline(providers)
            .filter(FilterStage::Catalyst, candidates(CycleId::new(), 4), &params(dec!(0.3)))
            .await;

        assert_eq!(report.failure_rate, dec!(0.5));
        assert!(!report.degraded);
    }

    #[tokio::test]
    async fn test_all_failing_aborts_stage() {
        let mut scorer = MockCatalystScorer::new();
        scorer.expect_score().returning(|_, _| {
            Err(ProviderError::Failed {
                provider: "catalyst_scorer",
                reason: "down".into(),
            })
        });

        let pipeline = StagePipeline::new(
            Arc::new(scorer),
            Arc::new(MockPatternDetector::new()),
            Arc::new(MockTechnicalConfirmer::new()),
        );
        let (passed, report) = pipeline
            .filter(FilterStage::Catalyst, candidates(CycleId::new(), 3), &params(dec!(0.3)))
            .await;

        assert!(passed.is_empty());
        assert!(report.aborted);
        assert_eq!(report.responded(), 0);
    }

    #[tokio::test]
    async fn test_out_of_range_score_counts_as_error() {
        let providers = Arc::new(InMemoryProviders::new());
        providers.set_catalyst(InstrumentId(1), dec!(1.4), "earnings").await;
        providers.set_catalyst(InstrumentId(2), dec!(0.5), "earnings").await;

        let (passed, report) = pipeline(providers)
            .filter(FilterStage::Catalyst, candidates(CycleId::new(), 2), &params(dec!(0.3)))
            .await;

        assert_eq!(passed.len(), 1);
        assert_eq!(report.provider_errors, 1);
    }

    #[tokio::test]
    async fn test_panicking_provider_is_isolated() {
        let providers = Arc::new(InMemoryProviders::new());
        providers.set_catalyst(InstrumentId(1), dec!(0.9), "earnings").await;
        providers.set_catalyst(InstrumentId(2), dec!(0.9), "earnings").await;
        providers
            .inject(SignalKind::Catalyst, InstrumentId(1), Fault::Panic)
            .await;

        let (passed, report) = pipeline(providers)
            .filter(FilterStage::Catalyst, candidates(CycleId::new(), 2), &params(dec!(0.3)))
            .await;

        assert_eq!(passed.len(), 1);
        assert_eq!(passed[0].id(), InstrumentId(2));
        assert_eq!(report.provider_errors, 1);
    }

    // =========================================================================
    // Timeouts and budget
    // =========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_slow_provider_times_out() {
        let providers = Arc::new(InMemoryProviders::new());
        providers.set_catalyst(InstrumentId(1), dec!(0.9), "earnings").await;
        providers.set_catalyst(InstrumentId(2), dec!(0.9), "earnings").await;
        providers
            .inject(
                SignalKind::Catalyst,
                InstrumentId(2),
                Fault::Delay(Duration::from_secs(10)),
            )
            .await;

        let (passed, report) = pipeline(providers)
            .filter(FilterStage::Catalyst, candidates(CycleId::new(), 2), &params(dec!(0.3)))
            .await;

        assert_eq!(passed.len(), 1);
        assert_eq!(report.provider_timeouts, 1);
        assert!(report.failures[0].timed_out);
        assert!(!report.budget_exceeded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stage_budget_cuts_off_outstanding_calls() {
        let providers = Arc::new(InMemoryProviders::new());
        for id in 1..=3 {
            providers.set_catalyst(InstrumentId(id), dec!(0.9), "earnings").await;
        }
        providers
            .inject(
                SignalKind::Catalyst,
                InstrumentId(3),
                Fault::Delay(Duration::from_secs(60)),
            )
            .await;

        let mut p = params(dec!(0.3));
        p.provider_timeout = Duration::from_secs(120);
        p.stage_budget = Duration::from_secs(5);

        let (passed, report) = pipeline(providers)
            .filter(FilterStage::Catalyst, candidates(CycleId::new(), 3), &p)
            .await;

        assert_eq!(passed.len(), 2);
        assert!(report.budget_exceeded);
        assert_eq!(report.provider_timeouts, 1);
        assert!(!report.aborted);
    }

    #[test]
    fn test_summary_line() {
        let mut report = StageReport::new(Stage::Catalyst, 100);
        report.passed = 35;
        report.provider_errors = 2;
        assert_eq!(
            report.summary_line(),
            "Catalyst 35/100 passed (2 errors, 0 timeouts)"
        );
    }
}
