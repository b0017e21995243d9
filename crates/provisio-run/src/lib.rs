//! Provisio Run
//!
//! The persisted shape of a provisioning run. A [`Run`] is an ordered list
//! of [`Step`]s executed against one [`TargetDescriptor`]. Each step carries
//! display-only [`Task`] progress items.
//!
//! All writes go through [`RunUpdate`], which applies a partial update
//! atomically and rejects anything that would break the run invariants:
//! - a finished run never changes again
//! - `current_step_index` never decreases, and is pinned while blocked
//! - `block_info` is present exactly while the run is blocked

mod block;
mod error;
mod run;
mod status;
mod step;
mod update;

pub use block::{BlockInfo, BlockReason};
pub use error::RunError;
pub use provisio_config::{RunOptions, StepDef, TargetDescriptor};
pub use run::{Run, RunSummary};
pub use status::{RunStatus, StepStatus};
pub use step::{Step, Task, TaskState, TaskStatus};
pub use update::RunUpdate;
