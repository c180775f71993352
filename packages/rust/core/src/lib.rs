//! DNA-commit orchestration core.
//!
//! - [`gate`]: pure accept/reject/retry decisions and the status they map to
//! - [`orchestrator`]: runs stages over eligible items with bounded concurrency
//! - [`commit`]: the only writer of the automation branch
//! - [`strategy`]: auditable adjustments to collection parameters
//! - [`scheduler`]: calendar-driven loop around the orchestrator

pub mod commit;
pub mod gate;
pub mod orchestrator;
pub mod scheduler;
pub mod strategy;

pub use commit::{CommitSafetyLayer, requires_manual_approval};
pub use gate::{Decision, StageResult};
pub use orchestrator::{Collaborators, CycleSummary, Orchestrator, ProgressReporter, SilentProgress};
pub use scheduler::{Firing, next_trigger, run_forever};
pub use strategy::AdaptiveStrategy;
