//! Provisio Registry
//!
//! The step registry maps an action identifier to the operation that does
//! the remote work for a step. The orchestrator only sees the
//! [`StepRegistry`] trait; what an action actually does (sync files,
//! install packages, reboot) lives behind it.
//!
//! [`ActionRegistry`] is a map-backed implementation with a few built-in
//! actions (see [`builtin`]).

pub mod builtin;
mod error;
mod registry;
mod types;

pub use error::StepError;
pub use registry::{ActionRegistry, StepAction, StepRegistry};
pub use types::{Progress, StepOutcome, StepRequest};
