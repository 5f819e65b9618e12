//! Periodic cycle starts during market hours.

use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, NaiveTime, Utc, Weekday};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::orchestrator::CycleOrchestrator;
use super::types::CycleRequest;
use crate::config::MarketHoursConfig;
use crate::error::CycleError;

/// Regular session window in UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarketHours {
    pub open: NaiveTime,
    pub close: NaiveTime,
    pub weekdays_only: bool,
}

impl MarketHours {
    pub fn from_config(config: &MarketHoursConfig) -> Result<Self> {
        let open = NaiveTime::parse_from_str(&config.open_utc, "%H:%M")
            .with_context(|| format!("Invalid market open time '{}'", config.open_utc))?;
        let close = NaiveTime::parse_from_str(&config.close_utc, "%H:%M")
            .with_context(|| format!("Invalid market close time '{}'", config.close_utc))?;
        if open >= close {
            anyhow::bail!("Market open {} must be before close {}", open, close);
        }
        Ok(Self {
            open,
            close,
            weekdays_only: config.weekdays_only,
        })
    }

    /// Always open; used for paper runs outside the session.
    pub fn always() -> Self {
        Self {
            open: NaiveTime::MIN,
            close: NaiveTime::from_hms_opt(23, 59, 59).unwrap_or(NaiveTime::MIN),
            weekdays_only: false,
        }
    }

    pub fn is_open(&self, at: DateTime<Utc>) -> bool {
        if self.weekdays_only && matches!(at.weekday(), Weekday::Sat | Weekday::Sun) {
            return false;
        }
        let time = at.time();
        time >= self.open && time <= self.close
    }
}

/// Starts a cycle on every tick of the mode's scan interval.
///
/// A tick is skipped while a cycle is still active or the market is closed.
pub struct CycleScheduler {
    orchestrator: Arc<CycleOrchestrator>,
    hours: MarketHours,
    shutdown: Arc<AtomicBool>,
    notify: Notify,
}

impl CycleScheduler {
    pub fn new(orchestrator: Arc<CycleOrchestrator>, hours: MarketHours, shutdown: Arc<AtomicBool>) -> Self {
        Self {
            orchestrator,
            hours,
            shutdown,
            notify: Notify::new(),
        }
    }

    /// Ask `run` to return after the current cycle stops.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    pub async fn run(&self) -> Result<()> {
        let config = self.orchestrator.config();
        let mode = config.cycle.mode;
        let interval_secs = config.modes.profile(mode).scan_interval_secs.max(1);
        let reconcile_every = Duration::from_secs(config.execution.reconcile_interval_secs.max(1));

        info!(
            mode = %mode,
            scan_interval_secs = interval_secs,
            open = %self.hours.open,
            close = %self.hours.close,
            "Scheduler started"
        );

        let reconcile = self
            .orchestrator
            .orders()
            .spawn_reconciliation_loop(reconcile_every, self.shutdown.clone());

        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
        let mut running: Option<JoinHandle<()>> = None;

        while !self.shutdown.load(Ordering::SeqCst) {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.notify.notified() => continue,
            }

            if running.as_ref().is_some_and(|task| task.is_finished()) {
                running = None;
            }
            if !self.hours.is_open(Utc::now()) {
                debug!("Market closed, skipping tick");
                continue;
            }

            match self.orchestrator.start_cycle(CycleRequest::with_mode(mode)).await {
                Ok(handle) => {
                    let orchestrator = self.orchestrator.clone();
                    running = Some(tokio::spawn(async move {
                        orchestrator.run(&handle).await;
                    }));
                }
                Err(CycleError::AlreadyActive { cycle_id }) => {
                    debug!(cycle_id = %cycle_id, "Previous cycle still active, skipping tick");
                }
                Err(e) => {
                    warn!(error = %e, "Could not start cycle");
                }
            }
        }

        info!("Scheduler stopping");
        let ack = self.orchestrator.stop_cycle("shutdown").await;
        if let Some(task) = running {
            if ack.accepted {
                info!(cycle_id = ?ack.cycle_id, "Waiting for active cycle to stop");
            }
            if let Err(e) = task.await {
                warn!(error = %e, "Cycle task ended abnormally");
            }
        }
        reconcile.abort();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{FillMode, PaperBroker};
    use crate::config::Config;
    use crate::cycle::{AbortReason, Collaborators, CycleStatus};
    use crate::events::{CycleEvent, MemorySink};
    use crate::persistence::MemoryStore;
    use crate::providers::{Fault, InMemoryProviders, InstrumentId};
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn hours() -> MarketHours {
        MarketHours::from_config(&MarketHoursConfig::default()).unwrap()
    }

    struct Harness {
        broker: Arc<PaperBroker>,
        sink: Arc<MemorySink>,
        orchestrator: Arc<CycleOrchestrator>,
        scheduler: Arc<CycleScheduler>,
    }

    /// Scans every second; the liquidity feed takes three.
    async fn harness(hours: MarketHours) -> Harness {
        let providers = Arc::new(InMemoryProviders::new());
        for (id, symbol) in [(1, "AAA"), (2, "BBB")] {
            providers.add_listing(id, symbol, dec!(50), dec!(1000000)).await;
            providers.set_catalyst(InstrumentId(id), dec!(0.8), "earnings").await;
            providers.set_pattern(InstrumentId(id), "bull_flag", dec!(0.9), None).await;
            providers.set_technical(InstrumentId(id), dec!(0.9), 4).await;
        }
        providers
            .set_feed_fault(Some(Fault::Delay(Duration::from_secs(3))))
            .await;

        let broker = Arc::new(PaperBroker::new(dec!(100000), FillMode::Immediate));
        broker.set_prices(providers.prices().await).await;
        let sink = Arc::new(MemorySink::new());

        let mut config = Config::default();
        config.modes.normal.scan_interval_secs = 1;
        config.cycle.monitor_window_secs = 5;
        config.execution.reconcile_interval_secs = 1;

        let orchestrator = Arc::new(CycleOrchestrator::new(
            config,
            Collaborators::from_providers(
                providers,
                broker.clone(),
                Arc::new(MemoryStore::new()),
                sink.clone(),
            ),
        ));
        let scheduler = Arc::new(CycleScheduler::new(
            orchestrator.clone(),
            hours,
            Arc::new(AtomicBool::new(false)),
        ));
        Harness {
            broker,
            sink,
            orchestrator,
            scheduler,
        }
    }

    fn cycles_started(sink: &MemorySink) -> usize {
        sink.named("transition")
            .iter()
            .filter(|e| matches!(e, CycleEvent::Transition { to: CycleStatus::Scanning, .. }))
            .count()
    }

    // =========================================================================
    // Scheduling loop
    // =========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_ticks_skipped_while_cycle_active() {
        let h = harness(MarketHours::always()).await;
        let scheduler = h.scheduler.clone();
        let task = tokio::spawn(async move { scheduler.run().await });

        // ticks at 0s, 1s and 2s; the first cycle is still scanning
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(cycles_started(&h.sink), 1);
        assert!(h.orchestrator.status().await.active);

        h.scheduler.shutdown();
        task.await.unwrap().unwrap();

        // run waited for the cycle to stop
        let snapshot = h.orchestrator.status().await;
        assert!(!snapshot.active);
        let cycle = snapshot.cycle.unwrap();
        assert_eq!(cycle.status, CycleStatus::Aborted);
        assert_eq!(cycle.abort_reason, Some(AbortReason::Stopped("shutdown".to_string())));
        assert_eq!(cycles_started(&h.sink), 1);
        assert_eq!(h.sink.named("cycle_completed").len(), 1);
        assert_eq!(h.broker.submitted_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_market_starts_nothing() {
        // open after close never matches
        let closed = MarketHours {
            open: NaiveTime::from_hms_opt(23, 59, 59).unwrap(),
            close: NaiveTime::MIN,
            weekdays_only: false,
        };
        let h = harness(closed).await;
        let scheduler = h.scheduler.clone();
        let task = tokio::spawn(async move { scheduler.run().await });

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(cycles_started(&h.sink), 0);
        assert!(!h.orchestrator.status().await.active);

        h.scheduler.shutdown();
        task.await.unwrap().unwrap();
        assert_eq!(h.orchestrator.status().await.status, CycleStatus::Idle);
        assert_eq!(h.broker.submitted_count().await, 0);
    }

    #[test]
    fn test_open_during_session() {
        // Wednesday
        let at = Utc.with_ymd_and_hms(2026, 10, 14, 15, 0, 0).unwrap();
        assert!(hours().is_open(at));
    }

    #[test]
    fn test_closed_outside_session() {
        let before = Utc.with_ymd_and_hms(2026, 10, 14, 13, 29, 0).unwrap();
        let after = Utc.with_ymd_and_hms(2026, 10, 14, 20, 1, 0).unwrap();
        assert!(!hours().is_open(before));
        assert!(!hours().is_open(after));
    }

    #[test]
    fn test_weekend_closed() {
        let saturday = Utc.with_ymd_and_hms(2026, 10, 17, 15, 0, 0).unwrap();
        assert!(!hours().is_open(saturday));
        assert!(MarketHours::always().is_open(saturday));
    }

    #[test]
    fn test_invalid_hours_rejected() {
        let config = MarketHoursConfig {
            open_utc: "9h30".to_string(),
            close_utc: "20:00".to_string(),
            weekdays_only: true,
        };
        assert!(MarketHours::from_config(&config).is_err());

        let inverted = MarketHoursConfig {
            open_utc: "20:00".to_string(),
            close_utc: "13:30".to_string(),
            weekdays_only: true,
        };
        assert!(MarketHours::from_config(&inverted).is_err());
    }
}
