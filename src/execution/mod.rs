//! Order and position lifecycle management.
//!
//! Contains the logic for:
//! - Entry submission with duplicate and halt guards
//! - Broker event application with stale-sequence filtering
//! - Protective stop/target placement and fail-safe closes
//! - Reconciliation against the broker's view of every order

mod manager;
mod types;

pub use manager::OrderManager;
pub use types::*;
