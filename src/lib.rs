//! LnOS disk engine
//!
//! Inspects a target disk, computes a partition plan for the machine's
//! firmware, and applies it: wipe, partition, format (optionally inside
//! LUKS2) and mount under a staging root. Everything acquired is recorded
//! in a [`MountTree`] and released in reverse order on failure.

pub mod cli;
pub mod config_file;
pub mod engine;
pub mod error;
pub mod hardware;
pub mod process_guard;
pub mod sanity;
pub mod tool_runner;
pub mod tool_traits;
pub mod tools;
pub mod types;

// Re-export main types for convenience
pub use config_file::InstallConfig;
pub use error::{LnosError, Result};
pub use process_guard::{ChildRegistry, CommandProcessGroup, ProcessGuard};
pub use tool_runner::{run_tool, DiskHost, DryRunHost, SystemHost, ToolOutput};
pub use tool_traits::ToolArgs;
pub use types::{BiosTable, Filesystem, PartitionRole, PartitionTable, UefiLayout};

// Device inspection
pub use hardware::{BlockHolder, BusKind, DeviceInspector, DeviceObservation, FirmwareMode};

// Planner and executor
pub use engine::executor::{NodePoll, PlanExecutor};
pub use engine::planner::{plan, PartitionPlan, PartitionSize, PartitionSpec, PlanPolicy};
pub use engine::stage::{ExecProgress, ExecStage, StageTransitionError};
pub use engine::unwind::{unwind, Acquired, MountTree, UnwindReport, UnwindScope};
