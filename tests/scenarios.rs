//! End-to-end cycle scenarios against in-memory providers and the paper broker.
//!
//! Tests cover:
//! - Funnel narrowing 100 -> 35 -> 20 -> 10 -> 5
//! - Degraded catalyst stage aborting the cycle
//! - Per-trade risk approved exactly at the limit
//! - Reconciliation discovering a silent fill
//! - Single active cycle, stop-loss coverage and the cumulative risk ceiling

use catalyst_trader::broker::{BrokerClient, FillMode, PaperBroker};
use catalyst_trader::config::{Config, ExecutionConfig, RiskConfig};
use catalyst_trader::cycle::{
    AbortReason, Collaborators, CycleId, CycleLimits, CycleOrchestrator, CycleRequest, CycleStatus,
};
use catalyst_trader::events::MemorySink;
use catalyst_trader::execution::{OrderManager, OrderStatus, PositionSide};
use catalyst_trader::persistence::MemoryStore;
use catalyst_trader::providers::{
    Fault, InMemoryProviders, Instrument, InstrumentId, SignalKind, SyntheticMarket,
};
use catalyst_trader::risk::{RejectionReason, RiskDecision, RiskValidator};
use catalyst_trader::strategy::{Stage, TradeProposal};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashSet;
use std::sync::Arc;

// =============================================================================
// Fixtures
// =============================================================================

struct World {
    providers: Arc<InMemoryProviders>,
    broker: Arc<PaperBroker>,
    store: Arc<MemoryStore>,
    sink: Arc<MemorySink>,
    orchestrator: Arc<CycleOrchestrator>,
}

/// 100 listings engineered so that 35 pass catalyst, 20 pattern and 10 technical.
///
/// Ids 11-15 are strong technically but have too few confirming indicators.
async fn funnel_market() -> InMemoryProviders {
    let providers = InMemoryProviders::new();
    for id in 1..=100u64 {
        providers
            .add_listing(id, &format!("T{id:03}"), dec!(50), dec!(1000000))
            .await;

        let catalyst = if id <= 35 { dec!(0.50) } else { dec!(0.10) };
        providers.set_catalyst(InstrumentId(id), catalyst, "earnings").await;

        let pattern = if id <= 20 { dec!(0.80) } else { dec!(0.40) };
        providers
            .set_pattern(InstrumentId(id), "bull_flag", pattern, None)
            .await;

        let (technical, confirming) = match id {
            1..=10 => (dec!(0.75) + Decimal::from(id) / dec!(100), 4),
            11..=15 => (dec!(0.95), 2),
            _ => (dec!(0.50), 5),
        };
        providers
            .set_technical(InstrumentId(id), technical, confirming)
            .await;
    }
    providers
}

async fn world_with(providers: InMemoryProviders, config: Config) -> World {
    let providers = Arc::new(providers);
    let broker = Arc::new(PaperBroker::new(dec!(100000), FillMode::Immediate));
    broker.set_prices(providers.prices().await).await;
    let store = Arc::new(MemoryStore::new());
    let sink = Arc::new(MemorySink::new());

    let orchestrator = Arc::new(CycleOrchestrator::new(
        config,
        Collaborators::from_providers(
            providers.clone(),
            broker.clone(),
            store.clone(),
            sink.clone(),
        ),
    ));
    World {
        providers,
        broker,
        store,
        sink,
        orchestrator,
    }
}

fn quick_config() -> Config {
    let mut config = Config::default();
    config.cycle.monitor_window_secs = 5;
    config.execution.reconcile_interval_secs = 1;
    config
}

fn ids(candidates: &[catalyst_trader::strategy::Candidate]) -> HashSet<InstrumentId> {
    candidates.iter().map(|c| c.id()).collect()
}

// =============================================================================
// Funnel
// =============================================================================

#[tokio::test]
async fn test_funnel_narrows_to_top_five() {
    let world = world_with(funnel_market().await, quick_config()).await;

    let cycle = world
        .orchestrator
        .run_once(CycleRequest::default())
        .await
        .unwrap()
        .cycle
        .unwrap();

    assert_eq!(cycle.status, CycleStatus::Completed);
    assert!(!cycle.degraded);
    assert_eq!(cycle.counters.scanned, 100);
    assert_eq!(cycle.counters.catalyst_passed, 35);
    assert_eq!(cycle.counters.pattern_passed, 20);
    assert_eq!(cycle.counters.technical_passed, 10);
    assert_eq!(cycle.counters.selected, 5);

    let selected = world.store.candidates(cycle.id, Stage::Selected);
    assert_eq!(ids(&selected).len(), 5);
    // highest technical strength wins when catalyst and pattern tie
    let expected: HashSet<_> = (6..=10).map(InstrumentId).collect();
    assert_eq!(ids(&selected), expected);
    let ranks: Vec<_> = selected.iter().filter_map(|c| c.rank).collect();
    assert_eq!(ranks, vec![1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn test_each_stage_output_is_subset_of_previous() {
    let providers = SyntheticMarket::seeded(150, 42).await;
    let world = world_with(providers, quick_config()).await;

    let cycle = world
        .orchestrator
        .run_once(CycleRequest::default())
        .await
        .unwrap()
        .cycle
        .unwrap();
    assert!(cycle.status.is_terminal());

    let stages = [
        Stage::Universe,
        Stage::Catalyst,
        Stage::Pattern,
        Stage::Technical,
        Stage::Selected,
    ];
    let mut previous: Option<HashSet<InstrumentId>> = None;
    for stage in stages {
        let current = ids(&world.store.candidates(cycle.id, stage));
        if let Some(previous) = &previous {
            assert!(current.is_subset(previous), "{stage} grew");
        }
        previous = Some(current);
    }

    let c = &cycle.counters;
    assert!(c.catalyst_passed <= c.scanned);
    assert!(c.pattern_passed <= c.catalyst_passed);
    assert!(c.technical_passed <= c.pattern_passed);
    assert!(c.selected <= c.technical_passed);
}

// =============================================================================
// Degraded stage
// =============================================================================

#[tokio::test]
async fn test_catalyst_outage_aborts_cycle() {
    let providers = funnel_market().await;
    for id in 1..=60 {
        providers
            .inject(
                SignalKind::Catalyst,
                InstrumentId(id),
                Fault::Error("upstream 503".into()),
            )
            .await;
    }
    let world = world_with(providers, quick_config()).await;

    let cycle = world
        .orchestrator
        .run_once(CycleRequest::default())
        .await
        .unwrap()
        .cycle
        .unwrap();

    assert_eq!(cycle.status, CycleStatus::Aborted);
    assert_eq!(
        cycle.abort_reason,
        Some(AbortReason::StageDegraded(Stage::Catalyst))
    );
    assert!(cycle.degraded);
    let report = &cycle.stage_reports[0];
    assert_eq!(report.provider_errors, 60);
    assert!(report.degraded);
    assert_eq!(world.providers.call_count(SignalKind::Pattern).await, 0);
    assert_eq!(world.broker.submitted_count().await, 0);
    assert!(cycle
        .summary
        .unwrap()
        .contains("aborted: StageDegraded:Catalyst"));
}

#[tokio::test]
async fn test_catalyst_outage_continues_when_configured() {
    let providers = funnel_market().await;
    for id in 1..=60 {
        providers
            .inject(
                SignalKind::Catalyst,
                InstrumentId(id),
                Fault::Error("upstream 503".into()),
            )
            .await;
    }
    let mut config = quick_config();
    config.cycle.abort_on_degraded_stage = false;
    let world = world_with(providers, config).await;

    let cycle = world
        .orchestrator
        .run_once(CycleRequest::default())
        .await
        .unwrap()
        .cycle
        .unwrap();

    // every catalyst winner sat in the failed range
    assert_eq!(cycle.status, CycleStatus::Completed);
    assert!(cycle.degraded);
    assert_eq!(cycle.counters.catalyst_passed, 0);
    assert!(cycle.summary.unwrap().contains("degraded"));
}

// =============================================================================
// Risk gates
// =============================================================================

#[tokio::test]
async fn test_risk_exactly_at_limit_is_approved() {
    let validator = RiskValidator::new(&RiskConfig::default());
    let limits = CycleLimits {
        max_positions: 5,
        max_risk_per_trade: dec!(0.02),
        max_daily_loss: dec!(0.06),
    };
    let proposal = TradeProposal::new(
        CycleId::new(),
        Instrument::new(1, "ACME"),
        PositionSide::Long,
        dec!(500),
        dec!(100.00),
        dec!(98.00),
        dec!(104.00),
        dec!(0.8),
    )
    .unwrap();

    match validator.validate(&proposal, &limits, dec!(50000)).await {
        RiskDecision::Approved(trade) => {
            assert_eq!(trade.risk, dec!(1000));
            assert!(!trade.resized);
        }
        RiskDecision::Rejected(reason) => panic!("rejected at the boundary: {reason}"),
    }

    let over = TradeProposal::new(
        CycleId::new(),
        Instrument::new(2, "BETA"),
        PositionSide::Long,
        dec!(501),
        dec!(100.00),
        dec!(98.00),
        dec!(104.00),
        dec!(0.8),
    )
    .unwrap();
    assert!(matches!(
        validator.validate(&over, &limits, dec!(50000)).await,
        RiskDecision::Rejected(RejectionReason::PerTradeRiskExceeded { .. })
    ));
}

#[tokio::test]
async fn test_open_risk_never_exceeds_daily_budget() {
    let world = world_with(funnel_market().await, quick_config()).await;
    let limits = CycleLimits {
        max_positions: 5,
        max_risk_per_trade: dec!(0.01),
        max_daily_loss: dec!(0.012),
    };

    let cycle = world
        .orchestrator
        .run_once(CycleRequest {
            mode: None,
            limits: Some(limits),
        })
        .await
        .unwrap()
        .cycle
        .unwrap();

    // 500 shares risk $1 each against a $1,200 budget
    assert_eq!(cycle.counters.approved, 2);
    assert_eq!(cycle.counters.rejected, 3);
    let rejections = world.sink.named("risk_rejected");
    assert_eq!(rejections.len(), 3);

    let snapshot = world.orchestrator.risk().snapshot().await;
    assert!(snapshot.open_risk <= dec!(1200));
    let positions = world.orchestrator.orders().open_positions().await;
    let total: Decimal = positions.iter().map(|p| p.risk()).sum();
    assert!(total <= dec!(1200));
}

#[tokio::test]
async fn test_every_open_position_has_stop() {
    let world = world_with(funnel_market().await, quick_config()).await;
    world
        .orchestrator
        .run_once(CycleRequest::default())
        .await
        .unwrap();

    let orders = world.orchestrator.orders();
    let positions = orders.open_positions().await;
    assert_eq!(positions.len(), 5);
    for position in positions {
        assert!(position.has_valid_stop());
        let stops: Vec<_> = orders
            .orders()
            .await
            .into_iter()
            .filter(|o| o.position_id == Some(position.id) && o.stop_price.is_some())
            .collect();
        assert_eq!(stops.len(), 1);
        assert!(stops[0].status.is_active());
        assert_eq!(stops[0].stop_price, Some(position.stop_loss));
    }
}

// =============================================================================
// Cycle slot
// =============================================================================

#[tokio::test]
async fn test_only_one_cycle_active() {
    let world = world_with(funnel_market().await, quick_config()).await;

    let a = world.orchestrator.clone();
    let b = world.orchestrator.clone();
    let (first, second) = tokio::join!(
        a.start_cycle(CycleRequest::default()),
        b.start_cycle(CycleRequest::default())
    );
    assert_eq!(
        usize::from(first.is_ok()) + usize::from(second.is_ok()),
        1
    );

    let handle = first.or(second).unwrap();
    let snapshot = world.orchestrator.run(&handle).await;
    assert!(!snapshot.active);
    assert!(world
        .orchestrator
        .start_cycle(CycleRequest::default())
        .await
        .is_ok());
}

// =============================================================================
// Reconciliation
// =============================================================================

#[tokio::test]
async fn test_silent_fill_discovered_by_reconciliation() {
    let broker = Arc::new(PaperBroker::new(dec!(50000), FillMode::Manual));
    broker.set_price("ACME", dec!(100)).await;
    let risk = Arc::new(RiskValidator::new(&RiskConfig::default()));
    let store = Arc::new(MemoryStore::new());
    let sink = Arc::new(MemorySink::new());
    let manager = OrderManager::new(
        broker.clone(),
        risk.clone(),
        store.clone(),
        sink.clone(),
        ExecutionConfig::default(),
    );

    let limits = CycleLimits {
        max_positions: 5,
        max_risk_per_trade: dec!(0.02),
        max_daily_loss: dec!(0.06),
    };
    let proposal = TradeProposal::new(
        CycleId::new(),
        Instrument::new(1, "ACME"),
        PositionSide::Long,
        dec!(100),
        dec!(100),
        dec!(98),
        dec!(104),
        dec!(0.8),
    )
    .unwrap();
    let RiskDecision::Approved(trade) = risk.validate(&proposal, &limits, dec!(50000)).await else {
        panic!("proposal should pass");
    };

    let handle = manager.submit_order(&trade).await.unwrap();
    assert_eq!(handle.status, OrderStatus::Submitted);

    broker
        .fill_silently(&handle.client_order_id, dec!(100), dec!(100))
        .await
        .unwrap();
    assert_eq!(
        manager.order(&handle.client_order_id).await.unwrap().status,
        OrderStatus::Submitted
    );

    let report = manager.reconcile().await;
    assert_eq!(report.corrections, 1);
    assert_eq!(
        manager.order(&handle.client_order_id).await.unwrap().status,
        OrderStatus::Filled
    );

    let positions = manager.open_positions().await;
    assert_eq!(positions.len(), 1);
    assert_eq!(positions[0].quantity, dec!(100));
    assert!(positions[0].stop_order.is_some());
    assert!(positions[0].target_order.is_some());

    // broker now holds entry, stop and target
    assert_eq!(broker.order_states().await.unwrap().len(), 3);

    let again = manager.reconcile().await;
    assert!(!again.changed());
    assert_eq!(sink.named("reconciliation_correction").len(), 1);
}

#[tokio::test]
async fn test_reconcile_after_cycle_is_noop() {
    let world = world_with(funnel_market().await, quick_config()).await;
    world
        .orchestrator
        .run_once(CycleRequest::default())
        .await
        .unwrap();

    let orders = world.orchestrator.orders();
    let first = orders.reconcile().await;
    let orders_before = orders.orders().await;
    let positions_before = orders.open_positions().await;
    let risk_before = world.orchestrator.risk().snapshot().await.open_risk;
    let submitted_before = world.broker.submitted_count().await;

    let second = orders.reconcile().await;
    assert!(!first.changed());
    assert!(!second.changed());
    assert_eq!(first.checked_orders, second.checked_orders);

    // a second pass leaves local and broker state untouched
    assert_eq!(orders.orders().await, orders_before);
    assert_eq!(orders.open_positions().await, positions_before);
    assert_eq!(world.orchestrator.risk().snapshot().await.open_risk, risk_before);
    assert_eq!(world.broker.submitted_count().await, submitted_before);
    assert!(!positions_before.is_empty());
}

#[tokio::test]
async fn test_stop_hit_closes_position_and_frees_risk() {
    let world = world_with(funnel_market().await, quick_config()).await;
    let cycle = world
        .orchestrator
        .run_once(CycleRequest::default())
        .await
        .unwrap()
        .cycle
        .unwrap();
    assert_eq!(cycle.status, CycleStatus::Completed);

    let orders = world.orchestrator.orders();
    let victim = orders.open_positions().await.remove(0);
    let before = world.orchestrator.risk().snapshot().await.open_risk;

    world.broker.set_price(&victim.symbol, dec!(45)).await;
    orders.reconcile().await;

    let open = orders.open_positions().await;
    assert!(open.iter().all(|p| p.id != victim.id));
    assert_eq!(open.len(), 4);
    let after = world.orchestrator.risk().snapshot().await.open_risk;
    assert!(after < before);
    assert_eq!(world.sink.named("position_closed").len(), 1);
    assert_eq!(
        world
            .orchestrator
            .status()
            .await
            .cycle
            .map(|c| c.status),
        Some(CycleStatus::Completed)
    );
}
