//! Mount-Tree Unwinder
//!
//! The [`MountTree`] is a stack of everything the executor acquired: opened
//! LUKS mappings, mounts and active swap. [`unwind`] releases it in exact
//! reverse order, so a LUKS mapping is closed only after the filesystem on
//! it has been unmounted.
//!
//! Unwinding is best-effort: a release that fails is logged at `warn` and
//! the rest are still attempted. [`UnwindScope`] ties the release to scope
//! exit so an early return or panic inside the executor cannot leak mounts.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::error::{LnosError, Result};
use crate::tool_runner::DiskHost;
use crate::tool_traits::ToolArgs;
use crate::tools::encryption::LuksCloseArgs;
use crate::tools::mount::{SwapoffArgs, UmountArgs};

/// One resource held by the executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Acquired {
    /// `/dev/mapper/<mapper_name>` opened from `device`
    Crypt { device: PathBuf, mapper_name: String },
    /// `device` mounted at `target`
    Mount { device: PathBuf, target: PathBuf },
    /// `device` enabled as swap
    Swap { device: PathBuf },
}

impl Acquired {
    /// The tool invocation that releases this resource.
    fn release_args(&self) -> Box<dyn ToolArgs> {
        match self {
            Self::Crypt { mapper_name, .. } => Box::new(LuksCloseArgs {
                mapper_name: mapper_name.clone(),
            }),
            Self::Mount { target, .. } => Box::new(UmountArgs {
                target: target.clone(),
            }),
            Self::Swap { device } => Box::new(SwapoffArgs {
                device: device.clone(),
            }),
        }
    }
}

impl fmt::Display for Acquired {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Crypt { device, mapper_name } => {
                write!(f, "crypt {} -> /dev/mapper/{}", device.display(), mapper_name)
            }
            Self::Mount { device, target } => {
                write!(f, "mount {} -> {}", device.display(), target.display())
            }
            Self::Swap { device } => write!(f, "swap {}", device.display()),
        }
    }
}

/// Ordered record of acquired resources, oldest first.
///
/// Exists (possibly empty) before the first destructive step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountTree {
    entries: Vec<Acquired>,
}

impl MountTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: Acquired) {
        self.entries.push(entry);
    }

    pub fn pop(&mut self) -> Option<Acquired> {
        self.entries.pop()
    }

    pub fn entries(&self) -> &[Acquired] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Mount targets in the order they were mounted.
    pub fn mount_targets(&self) -> Vec<&Path> {
        self.entries
            .iter()
            .filter_map(|e| match e {
                Acquired::Mount { target, .. } => Some(target.as_path()),
                _ => None,
            })
            .collect()
    }

    /// Persist the tree as JSON so a later `unwind` can release it.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        info!("Mount tree ({} entries) saved to {}", self.len(), path.display());
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }
}

/// Outcome of an unwind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnwindReport {
    /// Resources released, in release order
    pub released: Vec<Acquired>,
    /// Resources whose release failed, with the reason
    pub failed: Vec<(Acquired, String)>,
}

impl UnwindReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }

    /// What is still held, oldest first, ready to be saved for a retry.
    pub fn remaining(&self) -> MountTree {
        MountTree {
            entries: self.failed.iter().rev().map(|(entry, _)| entry.clone()).collect(),
        }
    }

    /// `UnwindFailure` listing what is still held, if anything.
    pub fn into_error(self) -> Option<LnosError> {
        if self.failed.is_empty() {
            None
        } else {
            Some(LnosError::UnwindFailure {
                partial: self
                    .failed
                    .into_iter()
                    .map(|(entry, reason)| format!("{}: {}", entry, reason))
                    .collect(),
            })
        }
    }
}

/// Release every entry of `tree` in reverse order. Never fails.
///
/// The tree is drained: each entry is removed once its release has been
/// attempted, whether or not it succeeded.
pub fn unwind<H: DiskHost + ?Sized>(tree: &mut MountTree, host: &mut H) -> UnwindReport {
    let mut report = UnwindReport::default();
    if tree.is_empty() {
        return report;
    }

    info!("Unwinding {} acquired resource(s)", tree.len());
    while let Some(entry) = tree.pop() {
        match release(&entry, host) {
            Ok(()) => {
                info!("Released {}", entry);
                report.released.push(entry);
            }
            Err(e) => {
                warn!("Failed to release {}: {}", entry, e);
                report.failed.push((entry, e.to_string()));
            }
        }
    }

    if !report.is_clean() {
        warn!(
            "Unwind finished with {} resource(s) still held",
            report.failed.len()
        );
    }
    report
}

/// Bring a state file in line with an unwind of its contents.
///
/// Removed once everything was released; otherwise rewritten with only the
/// entries still held so a later `unwind` retries just those.
pub fn settle_state_file(path: &Path, report: &UnwindReport) -> Result<()> {
    if report.is_clean() {
        fs::remove_file(path)?;
        info!("All resources released, removed {}", path.display());
        return Ok(());
    }
    report.remaining().save(path)
}

fn release<H: DiskHost + ?Sized>(entry: &Acquired, host: &mut H) -> Result<()> {
    let args = entry.release_args();
    host.run_checked(args.as_ref()).map(|_| ())
}

/// Scoped ownership of a host and the live mount tree.
///
/// Every acquisition is recorded through the scope. If the scope is dropped
/// while armed (error return or panic), the tree is unwound. [`disarm`]
/// hands the tree back to the caller on success.
///
/// The tree is shared behind a mutex so a signal handler can unwind the
/// same record.
///
/// [`disarm`]: UnwindScope::disarm
pub struct UnwindScope<'a, H: DiskHost + ?Sized> {
    host: &'a mut H,
    tree: Arc<Mutex<MountTree>>,
    armed: bool,
}

impl<'a, H: DiskHost + ?Sized> UnwindScope<'a, H> {
    pub fn new(host: &'a mut H, tree: Arc<Mutex<MountTree>>) -> Self {
        Self {
            host,
            tree,
            armed: true,
        }
    }

    pub fn host(&mut self) -> &mut H {
        &mut *self.host
    }

    /// Record a resource that has just been acquired.
    pub fn acquired(&mut self, entry: Acquired) {
        log::debug!("Acquired {}", entry);
        self.lock().push(entry);
    }

    /// Release the most recent acquisition immediately.
    ///
    /// The entry is removed only if its release succeeds.
    pub fn release_last(&mut self) -> Result<()> {
        let Some(entry) = self.lock().entries.last().cloned() else {
            return Ok(());
        };
        release(&entry, &mut *self.host)?;
        self.lock().pop();
        info!("Released {}", entry);
        Ok(())
    }

    /// Snapshot of the live tree.
    pub fn snapshot(&self) -> MountTree {
        self.lock().clone()
    }

    /// Keep everything acquired and return a copy of the tree.
    pub fn disarm(mut self) -> MountTree {
        self.armed = false;
        self.snapshot()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MountTree> {
        self.tree.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<H: DiskHost + ?Sized> Drop for UnwindScope<'_, H> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut tree = self.tree.lock().unwrap_or_else(PoisonError::into_inner);
        if tree.is_empty() {
            log::debug!("Unwind scope exited with nothing acquired");
            return;
        }
        warn!("Execution aborted, unwinding {} resource(s)", tree.len());
        let report = unwind(&mut tree, &mut *self.host);
        if let Some(err) = report.into_error() {
            warn!("{}", err);
        }
    }
}
