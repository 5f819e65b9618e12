//! Candidate selection.
//!
//! Contains the logic for:
//! - Liquidity universe selection
//! - Catalyst, pattern and technical filter stages
//! - Composite ranking and final selection
//! - Sizing selected candidates into trade proposals

mod candidate;
mod pipeline;
mod proposal;
mod ranking;
mod universe;

pub use candidate::{Candidate, FilterStage, Stage};
pub use pipeline::{ProviderFailure, StagePipeline, StageParams, StageReport};
pub use proposal::{ProposalBuilder, ProposalError, TradeProposal};
pub use ranking::{composite_score, rank_candidates, TieBreak};
pub use universe::{PriceRange, UniverseMember, UniverseSelector};
