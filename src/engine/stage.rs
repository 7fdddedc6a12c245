//! Executor State Machine
//!
//! Tracks how far the executor has taken the target disk. Each stage is a
//! committed step; there is no way back except unwinding and re-planning.
//!
//! # Stage Flow
//!
//! ```text
//! Unwiped
//!     ↓  wipefs
//! Wiped
//!     ↓  mklabel
//! TableCreated
//!     ↓  mkpart + flags, probe, node poll
//! PartitionsCreated
//!     ↓  mkfs / mkswap (luksFormat + open for an encrypted root)
//! Formatted
//!     ↓  (encrypted only) mapper node verified
//! LuksOpened
//!     ↓  mount root, then children, then swapon
//! Mounted
//! ```

use std::fmt;
use std::time::Instant;

use serde::Serialize;
use thiserror::Error;

/// Executor stages in sequential order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum ExecStage {
    /// Nothing has been written to the disk yet
    Unwiped = 0,
    /// Filesystem signatures removed
    Wiped = 1,
    /// Empty partition table written
    TableCreated = 2,
    /// All partitions exist and their nodes are visible
    PartitionsCreated = 3,
    /// Every partition carries its filesystem or swap signature
    Formatted = 4,
    /// Encrypted root is unlocked at its mapper node
    LuksOpened = 5,
    /// Staging tree mounted and swap enabled (terminal)
    Mounted = 6,
}

impl ExecStage {
    #[inline]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Mounted)
    }

    /// Returns true once the disk has been touched.
    #[inline]
    pub const fn is_mutated(self) -> bool {
        !matches!(self, Self::Unwiped)
    }

    /// Next stage for a plan with or without an encrypted root.
    pub const fn next(self, encrypted: bool) -> Option<Self> {
        match self {
            Self::Unwiped => Some(Self::Wiped),
            Self::Wiped => Some(Self::TableCreated),
            Self::TableCreated => Some(Self::PartitionsCreated),
            Self::PartitionsCreated => Some(Self::Formatted),
            Self::Formatted if encrypted => Some(Self::LuksOpened),
            Self::Formatted | Self::LuksOpened => Some(Self::Mounted),
            Self::Mounted => None,
        }
    }

    pub const fn description(self) -> &'static str {
        match self {
            Self::Unwiped => "Disk untouched",
            Self::Wiped => "Signatures wiped",
            Self::TableCreated => "Partition table created",
            Self::PartitionsCreated => "Partitions created",
            Self::Formatted => "Filesystems created",
            Self::LuksOpened => "Encrypted root opened",
            Self::Mounted => "Staging tree mounted",
        }
    }
}

impl fmt::Display for ExecStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unwiped => "UNWIPED",
            Self::Wiped => "WIPED",
            Self::TableCreated => "TABLE_CREATED",
            Self::PartitionsCreated => "PARTITIONS_CREATED",
            Self::Formatted => "FORMATTED",
            Self::LuksOpened => "LUKS_OPENED",
            Self::Mounted => "MOUNTED",
        };
        write!(f, "{}", name)
    }
}

/// Errors that can occur during stage transitions
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StageTransitionError {
    #[error("Cannot skip from {from} to {to} (must transition through intermediate stages)")]
    SkippedStage { from: ExecStage, to: ExecStage },

    #[error("Cannot go backwards from {from} to {to} (execution is forward-only)")]
    BackwardTransition { from: ExecStage, to: ExecStage },

    #[error("Cannot transition from terminal stage {from}")]
    FromTerminalState { from: ExecStage },

    #[error("Already at stage {stage}")]
    AlreadyAtStage { stage: ExecStage },

    /// LUKS_OPENED is only reachable for plans with an encrypted root
    #[error("Stage {stage} does not apply to an unencrypted plan")]
    NotApplicable { stage: ExecStage },
}

/// Progress of one execution.
///
/// Owns the current stage and only allows the exact next stage for the
/// plan being executed.
#[derive(Debug, Clone)]
pub struct ExecProgress {
    current: ExecStage,
    encrypted: bool,
    started: Instant,
    /// Stages entered, with milliseconds since execution start
    history: Vec<(ExecStage, u128)>,
}

impl ExecProgress {
    pub fn new(encrypted: bool) -> Self {
        Self {
            current: ExecStage::Unwiped,
            encrypted,
            started: Instant::now(),
            history: vec![(ExecStage::Unwiped, 0)],
        }
    }

    pub fn current(&self) -> ExecStage {
        self.current
    }

    pub fn is_complete(&self) -> bool {
        self.current.is_terminal()
    }

    pub fn history(&self) -> &[(ExecStage, u128)] {
        &self.history
    }

    /// Stages entered so far, in order.
    pub fn stages(&self) -> Vec<ExecStage> {
        self.history.iter().map(|(stage, _)| *stage).collect()
    }

    /// Transition to `target`, which must be the immediate next stage.
    ///
    /// # Errors
    ///
    /// - `FromTerminalState` if already `Mounted`
    /// - `AlreadyAtStage` if `target` is the current stage
    /// - `BackwardTransition` if `target` is before the current stage
    /// - `NotApplicable` if `target` is `LuksOpened` on an unencrypted plan
    /// - `SkippedStage` if `target` is not the immediate next stage
    pub fn transition_to(&mut self, target: ExecStage) -> Result<ExecStage, StageTransitionError> {
        if self.current.is_terminal() {
            return Err(StageTransitionError::FromTerminalState { from: self.current });
        }
        if target == self.current {
            return Err(StageTransitionError::AlreadyAtStage { stage: target });
        }
        if target < self.current {
            return Err(StageTransitionError::BackwardTransition {
                from: self.current,
                to: target,
            });
        }
        if target == ExecStage::LuksOpened && !self.encrypted {
            return Err(StageTransitionError::NotApplicable { stage: target });
        }
        if self.current.next(self.encrypted) != Some(target) {
            return Err(StageTransitionError::SkippedStage {
                from: self.current,
                to: target,
            });
        }

        self.history
            .push((target, self.started.elapsed().as_millis()));
        self.current = target;
        log::info!("Executor stage: {} ({})", target, target.description());
        Ok(target)
    }

    /// Advance to whatever stage follows the current one.
    pub fn advance(&mut self) -> Result<ExecStage, StageTransitionError> {
        match self.current.next(self.encrypted) {
            Some(next) => self.transition_to(next),
            None => Err(StageTransitionError::FromTerminalState { from: self.current }),
        }
    }
}
