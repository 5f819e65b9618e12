//! Configuration management for the catalyst trader.
//!
//! Loads settings from `.env`, an optional `config.{toml,yaml,json}` file and
//! `CCT__SECTION__FIELD` environment variables.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::providers::Timeframe;
use crate::strategy::TieBreak;

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Cycle orchestration
    #[serde(default)]
    pub cycle: CycleConfig,
    /// Per-mode thresholds and limits
    #[serde(default)]
    pub modes: ModeTable,
    /// Liquidity universe criteria
    #[serde(default)]
    pub universe: UniverseConfig,
    /// Stage pipeline and ranking
    #[serde(default)]
    pub pipeline: PipelineConfig,
    /// Risk gates and position sizing
    #[serde(default)]
    pub risk: RiskConfig,
    /// Order management
    #[serde(default)]
    pub execution: ExecutionConfig,
    /// Broker connectivity
    #[serde(default)]
    pub broker: BrokerConfig,
    /// Trading session window
    #[serde(default)]
    pub market_hours: MarketHoursConfig,
    /// Storage
    #[serde(default)]
    pub persistence: PersistenceConfig,
}

/// Trading aggressiveness. Selects a `ModeProfile`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TradingMode {
    Aggressive,
    #[default]
    Normal,
    Conservative,
}

impl fmt::Display for TradingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TradingMode::Aggressive => write!(f, "aggressive"),
            TradingMode::Normal => write!(f, "normal"),
            TradingMode::Conservative => write!(f, "conservative"),
        }
    }
}

impl FromStr for TradingMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "aggressive" => Ok(TradingMode::Aggressive),
            "normal" => Ok(TradingMode::Normal),
            "conservative" => Ok(TradingMode::Conservative),
            other => anyhow::bail!("unknown trading mode '{}'", other),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleConfig {
    /// Mode used when a request does not name one
    #[serde(default)]
    pub mode: TradingMode,
    /// Wall-clock budget for each filter stage
    #[serde(default = "default_stage_budget_secs")]
    pub stage_budget_secs: u64,
    /// Timeout for a single provider call
    #[serde(default = "default_provider_timeout_ms")]
    pub provider_timeout_ms: u64,
    /// Abort instead of continuing when a stage reports degraded
    #[serde(default = "default_abort_on_degraded_stage")]
    pub abort_on_degraded_stage: bool,
    /// Failure rate above which a stage is degraded (0.0-1.0, strict)
    #[serde(default = "default_max_failure_fraction")]
    pub max_failure_fraction: Decimal,
    /// How long Monitoring waits for entry orders to settle
    #[serde(default = "default_monitor_window_secs")]
    pub monitor_window_secs: u64,
}

/// Thresholds and limits for one trading mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModeProfile {
    /// Seconds between cycle starts
    pub scan_interval_secs: u64,
    /// Minimum catalyst strength (0.0-1.0)
    pub catalyst_threshold: Decimal,
    /// Minimum pattern confidence (0.0-1.0)
    pub pattern_threshold: Decimal,
    /// Minimum technical strength (0.0-1.0)
    pub technical_threshold: Decimal,
    /// Maximum concurrent open positions
    pub max_positions: u32,
    /// Maximum risk per trade as a fraction of equity
    pub risk_per_trade: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModeTable {
    #[serde(default = "default_aggressive_profile")]
    pub aggressive: ModeProfile,
    #[serde(default = "default_normal_profile")]
    pub normal: ModeProfile,
    #[serde(default = "default_conservative_profile")]
    pub conservative: ModeProfile,
}

impl ModeTable {
    pub fn profile(&self, mode: TradingMode) -> &ModeProfile {
        match mode {
            TradingMode::Aggressive => &self.aggressive,
            TradingMode::Normal => &self.normal,
            TradingMode::Conservative => &self.conservative,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UniverseConfig {
    /// Minimum session dollar volume
    #[serde(default = "default_min_dollar_volume")]
    pub min_dollar_volume: Decimal,
    /// Lowest acceptable last price
    #[serde(default = "default_min_price")]
    pub min_price: Decimal,
    /// Highest acceptable last price
    #[serde(default = "default_max_price")]
    pub max_price: Decimal,
    /// Universe size after ranking by dollar volume
    #[serde(default = "default_universe_size")]
    pub universe_size: usize,
    /// Timeout for the liquidity feed call
    #[serde(default = "default_feed_timeout_secs")]
    pub feed_timeout_secs: u64,
}

/// Weights of the three stage scores in the composite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositeWeights {
    #[serde(default = "default_catalyst_weight")]
    pub catalyst: Decimal,
    #[serde(default = "default_pattern_weight")]
    pub pattern: Decimal,
    #[serde(default = "default_technical_weight")]
    pub technical: Decimal,
}

impl CompositeWeights {
    pub fn total(&self) -> Decimal {
        self.catalyst + self.pattern + self.technical
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Minimum number of agreeing indicators at the technical stage
    #[serde(default = "default_min_confirming_indicators")]
    pub min_confirming_indicators: u32,
    /// Candidates kept after ranking
    #[serde(default = "default_final_selection_size")]
    pub final_selection_size: usize,
    /// Concurrent provider calls per stage
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Catalyst lookback window
    #[serde(default = "default_catalyst_window_hours")]
    pub catalyst_window_hours: u32,
    /// Chart timeframe for pattern and technical providers
    #[serde(default)]
    pub timeframe: Timeframe,
    #[serde(default)]
    pub weights: CompositeWeights,
    /// Ordering among equal composite scores
    #[serde(default)]
    pub tie_break: TieBreak,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Maximum daily loss as a fraction of start-of-day equity
    #[serde(default = "default_max_daily_loss")]
    pub max_daily_loss: Decimal,
    /// Shrink oversized proposals to the per-trade limit instead of rejecting
    #[serde(default)]
    pub resize_on_overage: bool,
    /// Stop distance below entry as a fraction of entry price
    #[serde(default = "default_stop_loss_pct")]
    pub stop_loss_pct: Decimal,
    /// Target distance as a multiple of stop distance
    #[serde(default = "default_reward_risk_ratio")]
    pub reward_risk_ratio: Decimal,
    /// Maximum notional of one position as a fraction of equity
    #[serde(default = "default_max_position_pct")]
    pub max_position_pct: Decimal,
    /// Share lot size
    #[serde(default = "default_lot_size")]
    pub lot_size: Decimal,
    /// Price tick for stop and target levels
    #[serde(default = "default_tick_size")]
    pub tick_size: Decimal,

    // Emergency detection
    /// Consecutive broker order failures before emergency mode
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
    /// Broker errors tolerated inside the error window
    #[serde(default = "default_max_errors_per_window")]
    pub max_errors_per_window: u32,
    /// Error window length
    #[serde(default = "default_error_window_secs")]
    pub error_window_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Timeout for each broker call
    #[serde(default = "default_broker_timeout_secs")]
    pub broker_timeout_secs: u64,
    /// Interval between reconciliation passes
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,
    /// Local orders unknown to the broker for this long are cancelled locally
    #[serde(default = "default_orphan_after_secs")]
    pub orphan_after_secs: u64,
    /// Prefix for client order ids
    #[serde(default = "default_client_order_prefix")]
    pub client_order_prefix: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BrokerKind {
    #[default]
    Paper,
    Alpaca,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default)]
    pub kind: BrokerKind,
    /// REST base url
    #[serde(default = "default_broker_base_url")]
    pub base_url: String,
    /// Trade-update websocket url
    #[serde(default = "default_broker_stream_url")]
    pub stream_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub api_secret: String,
    /// Starting equity of the paper broker
    #[serde(default = "default_paper_equity")]
    pub paper_equity: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketHoursConfig {
    /// Session open, UTC, "HH:MM"
    #[serde(default = "default_market_open")]
    pub open_utc: String,
    /// Session close, UTC, "HH:MM"
    #[serde(default = "default_market_close")]
    pub close_utc: String,
    /// Skip Saturdays and Sundays
    #[serde(default = "default_weekdays_only")]
    pub weekdays_only: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

// Default value functions
fn default_stage_budget_secs() -> u64 {
    30
}

fn default_provider_timeout_ms() -> u64 {
    5_000
}

fn default_abort_on_degraded_stage() -> bool {
    true
}

fn default_max_failure_fraction() -> Decimal {
    Decimal::new(50, 2) // 0.50
}

fn default_monitor_window_secs() -> u64 {
    120
}

fn default_aggressive_profile() -> ModeProfile {
    ModeProfile {
        scan_interval_secs: 180,
        catalyst_threshold: Decimal::new(25, 2),
        pattern_threshold: Decimal::new(55, 2),
        technical_threshold: Decimal::new(65, 2),
        max_positions: 5,
        risk_per_trade: Decimal::new(25, 3), // 0.025
    }
}

fn default_normal_profile() -> ModeProfile {
    ModeProfile {
        scan_interval_secs: 300,
        catalyst_threshold: Decimal::new(30, 2),
        pattern_threshold: Decimal::new(60, 2),
        technical_threshold: Decimal::new(70, 2),
        max_positions: 5,
        risk_per_trade: Decimal::new(2, 2), // 0.02
    }
}

fn default_conservative_profile() -> ModeProfile {
    ModeProfile {
        scan_interval_secs: 900,
        catalyst_threshold: Decimal::new(40, 2),
        pattern_threshold: Decimal::new(70, 2),
        technical_threshold: Decimal::new(75, 2),
        max_positions: 3,
        risk_per_trade: Decimal::new(1, 2), // 0.01
    }
}

fn default_min_dollar_volume() -> Decimal {
    Decimal::new(5_000_000, 0) // $5M session dollar volume
}

fn default_min_price() -> Decimal {
    Decimal::new(5, 0)
}

fn default_max_price() -> Decimal {
    Decimal::new(500, 0)
}

fn default_universe_size() -> usize {
    100
}

fn default_feed_timeout_secs() -> u64 {
    15
}

fn default_catalyst_weight() -> Decimal {
    Decimal::new(40, 2) // 0.40
}

fn default_pattern_weight() -> Decimal {
    Decimal::new(30, 2) // 0.30
}

fn default_technical_weight() -> Decimal {
    Decimal::new(30, 2) // 0.30
}

fn default_min_confirming_indicators() -> u32 {
    3
}

fn default_final_selection_size() -> usize {
    5
}

fn default_concurrency() -> usize {
    16
}

fn default_catalyst_window_hours() -> u32 {
    24
}

fn default_max_daily_loss() -> Decimal {
    Decimal::new(6, 2) // 0.06
}

fn default_stop_loss_pct() -> Decimal {
    Decimal::new(2, 2) // 0.02
}

fn default_reward_risk_ratio() -> Decimal {
    Decimal::new(2, 0)
}

fn default_max_position_pct() -> Decimal {
    Decimal::new(25, 2) // 0.25
}

fn default_lot_size() -> Decimal {
    Decimal::ONE
}

fn default_tick_size() -> Decimal {
    Decimal::new(1, 2) // 0.01
}

fn default_max_consecutive_failures() -> u32 {
    3
}

fn default_max_errors_per_window() -> u32 {
    10
}

fn default_error_window_secs() -> u64 {
    300
}

fn default_broker_timeout_secs() -> u64 {
    10
}

fn default_reconcile_interval_secs() -> u64 {
    15
}

fn default_orphan_after_secs() -> u64 {
    60
}

fn default_client_order_prefix() -> String {
    "cct".to_string()
}

fn default_broker_base_url() -> String {
    "https://paper-api.alpaca.markets".to_string()
}

fn default_broker_stream_url() -> String {
    "wss://paper-api.alpaca.markets/stream".to_string()
}

fn default_paper_equity() -> Decimal {
    Decimal::new(100_000, 0)
}

fn default_market_open() -> String {
    "13:30".to_string()
}

fn default_market_close() -> String {
    "20:00".to_string()
}

fn default_weekdays_only() -> bool {
    true
}

fn default_db_path() -> String {
    "data/catalyst_trader.db".to_string()
}

fn is_fraction(value: Decimal) -> bool {
    value > Decimal::ZERO && value <= Decimal::ONE
}

fn is_threshold(value: Decimal) -> bool {
    value >= Decimal::ZERO && value <= Decimal::ONE
}

impl Config {
    /// Load configuration from environment variables and config files.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::default().separator("__").prefix("CCT"))
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.cycle.stage_budget_secs > 0 && self.cycle.provider_timeout_ms > 0,
            "stage_budget_secs and provider_timeout_ms must be positive"
        );

        anyhow::ensure!(
            is_fraction(self.cycle.max_failure_fraction),
            "max_failure_fraction must be between 0 and 1"
        );

        for mode in [
            TradingMode::Aggressive,
            TradingMode::Normal,
            TradingMode::Conservative,
        ] {
            self.validate_profile(mode)?;
        }

        anyhow::ensure!(
            self.universe.min_price > Decimal::ZERO
                && self.universe.min_price <= self.universe.max_price,
            "price band must satisfy 0 < min_price <= max_price"
        );

        anyhow::ensure!(
            self.universe.universe_size > 0,
            "universe_size must be at least 1"
        );

        let weights = &self.pipeline.weights;
        anyhow::ensure!(
            weights.catalyst >= Decimal::ZERO
                && weights.pattern >= Decimal::ZERO
                && weights.technical >= Decimal::ZERO
                && weights.total() > Decimal::ZERO,
            "composite weights must be non-negative with a positive sum"
        );

        anyhow::ensure!(
            self.pipeline.final_selection_size > 0 && self.pipeline.concurrency > 0,
            "final_selection_size and concurrency must be at least 1"
        );

        anyhow::ensure!(
            is_fraction(self.risk.max_daily_loss),
            "max_daily_loss must be between 0 and 1"
        );

        anyhow::ensure!(
            is_fraction(self.risk.stop_loss_pct) && self.risk.stop_loss_pct < Decimal::ONE,
            "stop_loss_pct must be between 0 and 1 (exclusive)"
        );

        anyhow::ensure!(
            is_fraction(self.risk.max_position_pct),
            "max_position_pct must be between 0 and 1"
        );

        anyhow::ensure!(
            self.risk.reward_risk_ratio > Decimal::ZERO
                && self.risk.lot_size > Decimal::ZERO
                && self.risk.tick_size > Decimal::ZERO,
            "reward_risk_ratio, lot_size and tick_size must be positive"
        );

        anyhow::ensure!(
            self.execution.broker_timeout_secs > 0 && self.execution.reconcile_interval_secs > 0,
            "broker_timeout_secs and reconcile_interval_secs must be positive"
        );

        Ok(())
    }

    fn validate_profile(&self, mode: TradingMode) -> Result<()> {
        let profile = self.modes.profile(mode);

        anyhow::ensure!(
            is_threshold(profile.catalyst_threshold)
                && is_threshold(profile.pattern_threshold)
                && is_threshold(profile.technical_threshold),
            "{} thresholds must be between 0 and 1",
            mode
        );

        anyhow::ensure!(
            profile.max_positions > 0,
            "{} max_positions must be at least 1",
            mode
        );

        anyhow::ensure!(
            is_fraction(profile.risk_per_trade),
            "{} risk_per_trade must be between 0 and 1",
            mode
        );

        anyhow::ensure!(
            profile.scan_interval_secs > 0,
            "{} scan_interval_secs must be positive",
            mode
        );

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cycle: CycleConfig::default(),
            modes: ModeTable::default(),
            universe: UniverseConfig::default(),
            pipeline: PipelineConfig::default(),
            risk: RiskConfig::default(),
            execution: ExecutionConfig::default(),
            broker: BrokerConfig::default(),
            market_hours: MarketHoursConfig::default(),
            persistence: PersistenceConfig::default(),
        }
    }
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            mode: TradingMode::default(),
            stage_budget_secs: default_stage_budget_secs(),
            provider_timeout_ms: default_provider_timeout_ms(),
            abort_on_degraded_stage: default_abort_on_degraded_stage(),
            max_failure_fraction: default_max_failure_fraction(),
            monitor_window_secs: default_monitor_window_secs(),
        }
    }
}

impl Default for ModeTable {
    fn default() -> Self {
        Self {
            aggressive: default_aggressive_profile(),
            normal: default_normal_profile(),
            conservative: default_conservative_profile(),
        }
    }
}

impl Default for UniverseConfig {
    fn default() -> Self {
        Self {
            min_dollar_volume: default_min_dollar_volume(),
            min_price: default_min_price(),
            max_price: default_max_price(),
            universe_size: default_universe_size(),
            feed_timeout_secs: default_feed_timeout_secs(),
        }
    }
}

impl Default for CompositeWeights {
    fn default() -> Self {
        Self {
            catalyst: default_catalyst_weight(),
            pattern: default_pattern_weight(),
            technical: default_technical_weight(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            min_confirming_indicators: default_min_confirming_indicators(),
            final_selection_size: default_final_selection_size(),
            concurrency: default_concurrency(),
            catalyst_window_hours: default_catalyst_window_hours(),
            timeframe: Timeframe::default(),
            weights: CompositeWeights::default(),
            tie_break: TieBreak::default(),
        }
    }
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_daily_loss: default_max_daily_loss(),
            resize_on_overage: false,
            stop_loss_pct: default_stop_loss_pct(),
            reward_risk_ratio: default_reward_risk_ratio(),
            max_position_pct: default_max_position_pct(),
            lot_size: default_lot_size(),
            tick_size: default_tick_size(),
            max_consecutive_failures: default_max_consecutive_failures(),
            max_errors_per_window: default_max_errors_per_window(),
            error_window_secs: default_error_window_secs(),
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            broker_timeout_secs: default_broker_timeout_secs(),
            reconcile_interval_secs: default_reconcile_interval_secs(),
            orphan_after_secs: default_orphan_after_secs(),
            client_order_prefix: default_client_order_prefix(),
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            kind: BrokerKind::default(),
            base_url: default_broker_base_url(),
            stream_url: default_broker_stream_url(),
            api_key: String::new(),
            api_secret: String::new(),
            paper_equity: default_paper_equity(),
        }
    }
}

impl Default for MarketHoursConfig {
    fn default() -> Self {
        Self {
            open_utc: default_market_open(),
            close_utc: default_market_close(),
            weekdays_only: default_weekdays_only(),
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_mode_profiles() {
        let modes = ModeTable::default();

        let normal = modes.profile(TradingMode::Normal);
        assert_eq!(normal.catalyst_threshold, dec!(0.30));
        assert_eq!(normal.pattern_threshold, dec!(0.60));
        assert_eq!(normal.technical_threshold, dec!(0.70));
        assert_eq!(normal.max_positions, 5);

        let conservative = modes.profile(TradingMode::Conservative);
        assert_eq!(conservative.max_positions, 3);
        assert_eq!(conservative.risk_per_trade, dec!(0.01));
        assert!(conservative.scan_interval_secs > normal.scan_interval_secs);
    }

    #[test]
    fn test_invalid_failure_fraction_rejected() {
        let mut config = Config::default();
        config.cycle.max_failure_fraction = dec!(1.5);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_weights_rejected() {
        let mut config = Config::default();
        config.pipeline.weights = CompositeWeights {
            catalyst: Decimal::ZERO,
            pattern: Decimal::ZERO,
            technical: Decimal::ZERO,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_inverted_price_band_rejected() {
        let mut config = Config::default();
        config.universe.min_price = dec!(100);
        config.universe.max_price = dec!(10);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_threshold_out_of_range_rejected() {
        let mut config = Config::default();
        config.modes.aggressive.technical_threshold = dec!(1.2);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("aggressive"));
    }

    #[test]
    fn test_trading_mode_parse() {
        assert_eq!(
            "Conservative".parse::<TradingMode>().unwrap(),
            TradingMode::Conservative
        );
        assert!("yolo".parse::<TradingMode>().is_err());
    }

    #[test]
    fn test_deserialize_partial_config() {
        let json = r#"{
            "risk": { "max_daily_loss": "0.05", "resize_on_overage": true },
            "pipeline": { "tie_break": "instrument_id", "timeframe": "1h" }
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.risk.max_daily_loss, dec!(0.05));
        assert!(config.risk.resize_on_overage);
        assert_eq!(config.pipeline.tie_break, TieBreak::InstrumentId);
        assert_eq!(config.pipeline.timeframe, Timeframe::Hour1);
        assert_eq!(config.risk.stop_loss_pct, dec!(0.02));
        assert_eq!(config.modes.normal.max_positions, 5);
    }
}
