//! # Catalyst Trader
//!
//! Trading-cycle engine that narrows a liquid universe through catalyst,
//! pattern and technical filters, gates every proposal through hard risk
//! limits, and manages orders and stop-protected positions at a broker.
//!
//! ## Architecture
//!
//! - `config`: Configuration management and validation
//! - `providers`: Market-data and signal provider traits
//! - `strategy`: Universe selection, filter stages, ranking and sizing
//! - `risk`: Risk validator, daily loss tracking and emergency mode
//! - `broker`: Broker client trait with paper and HTTP implementations
//! - `execution`: Order manager, protective orders and reconciliation
//! - `cycle`: Cycle state machine, orchestrator and scheduler
//! - `persistence`: SQLite-based durable log and current state
//! - `events`: Reporting events for external consumers
//! - `utils`: Shared utilities and decimal arithmetic

pub mod broker;
pub mod config;
pub mod cycle;
pub mod error;
pub mod events;
pub mod execution;
pub mod persistence;
pub mod providers;
pub mod risk;
pub mod strategy;
pub mod utils;

pub use config::Config;
