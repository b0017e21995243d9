//! Provisio Runner
//!
//! This crate drives provisioning runs. A run is an ordered list of steps
//! executed one at a time against a single remote host, on a background
//! worker that is decoupled from whoever started it.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Orchestrator                          │
//! │  - start / get_state / cancel / resolve_block / clear       │
//! │  - owns the single worker slot                              │
//! │  - restart recovery and the retention reaper                │
//! └─────────────────────────────────────────────────────────────┘
//!                │ spawns / wakes              ▲ reads
//!                ▼                             │
//! ┌──────────────────────────────┐   ┌──────────────────────────┐
//! │            Worker            │──▶│          Store           │
//! │  - walks steps in order      │   │  - authoritative record  │
//! │  - persists every transition │   │  - single active slot    │
//! │  - parks while blocked       │   └──────────────────────────┘
//! └──────────────────────────────┘
//!                │ execute(step)
//!                ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       StepRegistry                          │
//! │  - success / failure / blocked(trust decision needed)       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Callers never talk to the worker directly. Control operations write to
//! the store and then nudge the worker, which acts on the stored state at
//! its next checkpoint (between steps, or while parked on a block).
//!
//! # Usage
//!
//! ```ignore
//! let orchestrator = Orchestrator::new(store, registry, trust, OrchestratorConfig::default());
//! orchestrator.recover().await?;
//!
//! let run_id = orchestrator.start(steps, target, None).await?;
//!
//! // Poll until the run settles, answering trust prompts on the way.
//! loop {
//!   let run = orchestrator.get_state(Some(&run_id)).await?;
//!   ...
//! }
//! ```

mod error;
mod events;
mod orchestrator;
mod protocol;
mod retention;
mod worker;

pub use error::OrchestratorError;
pub use events::{ChannelNotifier, NoopNotifier, RunEvent, RunNotifier};
pub use orchestrator::{Orchestrator, RecoveryReport};
pub use protocol::{BlockResolver, RejectAction, Resolution};
