//! Error handling for the LnOS disk engine
//!
//! Every failure the planner or executor can produce is a variant of
//! [`LnosError`]. Planner errors are raised before anything touches a disk;
//! executor errors are raised only after the mount tree has been unwound.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::engine::stage::StageTransitionError;

/// Main error type for the disk engine
#[derive(Error, Debug)]
pub enum LnosError {
    /// The path is missing, is not a block device, or is a partition
    #[error("Device not found: {}: {reason}", .path.display())]
    DeviceNotFound { path: PathBuf, reason: String },

    /// The disk (or something derived from it) is in use
    #[error("Device busy: {} is in use ({holder})", .path.display())]
    DeviceBusy { path: PathBuf, holder: String },

    /// The computed layout does not fit on the disk
    #[error("Insufficient space: layout needs {required_mib} MiB, disk provides {available_mib} MiB")]
    InsufficientSpace { required_mib: u64, available_mib: u64 },

    /// The requested policy cannot produce a bootable layout on this machine
    #[error("Unsupported combination: {0}")]
    UnsupportedCombination(String),

    /// Partition device nodes did not appear after the table was re-read
    #[error("Partition nodes not ready after {waited:?}: {}", join_paths(.missing))]
    PartitionNodesNotReady {
        missing: Vec<PathBuf>,
        waited: Duration,
    },

    /// An external tool exited unsuccessfully
    #[error("Step '{step}' failed (exit code {exit_code}): {stderr}")]
    ToolFailure {
        step: String,
        exit_code: i32,
        stderr: String,
    },

    /// Some resources could not be released during unwind (logged, never escalated)
    #[error("Unwind left {} resource(s) held: {}", .partial.len(), .partial.join("; "))]
    UnwindFailure { partial: Vec<String> },

    /// The root partition is encrypted but no passphrase was supplied
    #[error("Encrypted root requested but no passphrase was provided")]
    MissingPassphrase,

    /// The plan was computed for a different disk than the one being executed on
    #[error("Plan targets {} but execution was requested on {}", .planned.display(), .requested.display())]
    PlanMismatch { planned: PathBuf, requested: PathBuf },

    /// The plan violates a structural invariant
    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    /// Executor state machine rejected a transition
    #[error(transparent)]
    Transition(#[from] StageTransitionError),

    /// A tool binary could not be spawned at all
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// IO errors (sysfs reads, directory creation, state files)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for disk engine operations
pub type Result<T> = std::result::Result<T, LnosError>;

impl LnosError {
    /// Create a device-not-found error
    pub fn device_not_found(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::DeviceNotFound {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a device-busy error
    pub fn device_busy(path: impl Into<PathBuf>, holder: impl Into<String>) -> Self {
        Self::DeviceBusy {
            path: path.into(),
            holder: holder.into(),
        }
    }

    /// Create an unsupported-combination error
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::UnsupportedCombination(msg.into())
    }

    /// Create an invalid-plan error
    pub fn invalid_plan(msg: impl Into<String>) -> Self {
        Self::InvalidPlan(msg.into())
    }

    /// Name of the executor step that failed, if this error came from a tool.
    pub fn failed_step(&self) -> Option<&str> {
        match self {
            Self::ToolFailure { step, .. } => Some(step),
            _ => None,
        }
    }

    /// Returns true if this error was raised before any disk mutation.
    ///
    /// Planner errors are always safe to retry with a different policy.
    pub fn is_pre_mutation(&self) -> bool {
        matches!(
            self,
            Self::DeviceNotFound { .. }
                | Self::DeviceBusy { .. }
                | Self::InsufficientSpace { .. }
                | Self::UnsupportedCombination(_)
                | Self::MissingPassphrase
                | Self::PlanMismatch { .. }
                | Self::InvalidPlan(_)
        )
    }
}

fn join_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_failure_display_is_verbatim() {
        let err = LnosError::ToolFailure {
            step: "format".to_string(),
            exit_code: 1,
            stderr: "mkfs.ext4: Device size reported to be zero.".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Step 'format' failed (exit code 1): mkfs.ext4: Device size reported to be zero."
        );
        assert_eq!(err.failed_step(), Some("format"));
    }

    #[test]
    fn test_nodes_not_ready_lists_missing_paths() {
        let err = LnosError::PartitionNodesNotReady {
            missing: vec![PathBuf::from("/dev/sda1"), PathBuf::from("/dev/sda2")],
            waited: Duration::from_secs(5),
        };
        let msg = err.to_string();
        assert!(msg.contains("/dev/sda1, /dev/sda2"));
        assert!(msg.contains("5s"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: LnosError = io_err.into();
        assert!(matches!(err, LnosError::Io(_)));
        assert!(!err.is_pre_mutation());
    }

    #[test]
    fn test_planner_errors_are_pre_mutation() {
        assert!(LnosError::unsupported("x").is_pre_mutation());
        assert!(
            LnosError::InsufficientSpace {
                required_mib: 10,
                available_mib: 5
            }
            .is_pre_mutation()
        );
        assert!(LnosError::device_busy("/dev/sda", "/mnt").is_pre_mutation());
    }

    #[test]
    fn test_unwind_failure_display() {
        let err = LnosError::UnwindFailure {
            partial: vec!["umount /mnt: target is busy".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "Unwind left 1 resource(s) held: umount /mnt: target is busy"
        );
    }
}
