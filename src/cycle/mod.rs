//! Cycle orchestration.
//!
//! A cycle walks `Scanning -> CatalystFiltering -> PatternFiltering ->
//! TechnicalFiltering -> RiskValidating -> Executing -> Monitoring` and ends
//! in `Completed` or `Aborted`. At most one cycle is active at a time.

mod orchestrator;
mod scheduler;
mod types;

pub use orchestrator::{Collaborators, CycleOrchestrator};
pub use scheduler::{CycleScheduler, MarketHours};
pub use types::*;
