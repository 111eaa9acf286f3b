//! Grounding：置信度分档与确认管理

pub mod manager;
pub mod policy;

pub use manager::{
    GroundingManager, GroundingReport, GroundingState, PendingConfirmation, Settlement,
};
pub use policy::{
    ConfidenceBand, ConfirmationMode, GroundingAction, GroundingOverride, GroundingPolicy,
    Thresholds, ThresholdPolicy,
};
