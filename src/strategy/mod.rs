//! Strategy layer: spike detection, the risk gate, and exit rules.
//!
//! Nothing in here performs I/O or reads the clock: every operation takes
//! the current time explicitly so the engine and tests drive it.

pub mod detector;
pub mod exit;
pub mod risk;

pub use detector::{DetectorConfig, Opportunity, OpportunityInput, SpikeDetector};
pub use exit::{ExitConfig, ExitDecision, ExitEvaluator};
pub use risk::{RiskConfig, RiskGate, RiskRejection, TradeProposal};
