//! Engine modules: the planner that turns a device observation into a
//! partition plan, and the executor that applies it.
//!
//! The planner is pure. Everything that touches the system goes through a
//! [`DiskHost`](crate::tool_runner::DiskHost) inside the executor and unwinder.

pub mod executor;
pub mod planner;
pub mod stage;
pub mod unwind;
