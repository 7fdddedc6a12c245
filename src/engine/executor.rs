//! Plan Executor
//!
//! Applies a [`PartitionPlan`] to the target disk through a [`DiskHost`].
//!
//! # Steps
//!
//! | Stage entered       | Work done |
//! |---------------------|-----------|
//! | `WIPED`             | `wipefs --all --force` on the whole disk |
//! | `TABLE_CREATED`     | `parted mklabel gpt\|msdos` |
//! | `PARTITIONS_CREATED`| `mkpart` + flag per spec in plan order, `partprobe`, node poll |
//! | `FORMATTED`         | `mkfs.*` / `mkswap`; LUKS format + open first for an encrypted root; btrfs `@` subvolume |
//! | `LUKS_OPENED`       | mapper node verified (encrypted plans only) |
//! | `MOUNTED`           | ROOT at the staging root, children by depth, then `swapon` |
//!
//! Every acquisition goes through an [`UnwindScope`]; any error after the
//! first destructive step unwinds what was acquired before the error is
//! returned. The partition table itself is not rolled back.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use log::{debug, error, info};

use crate::engine::planner::{PartitionPlan, PartitionSize, PartitionSpec};
use crate::engine::stage::{ExecProgress, ExecStage};
use crate::engine::unwind::{unwind, Acquired, MountTree, UnwindReport, UnwindScope};
use crate::error::{LnosError, Result};
use crate::tool_runner::DiskHost;
use crate::tools::disk::{
    MakeLabelArgs, MakePartitionArgs, MkfsArgs, MkfsKind, MkswapArgs, PartitionEnd, PartprobeArgs,
    SetFlagArgs, WipeSignaturesArgs,
};
use crate::tools::encryption::{LuksFormatArgs, LuksOpenArgs, Passphrase, SecretFile};
use crate::tools::mount::{BtrfsSubvolumeCreateArgs, MountArgs, SwaponArgs};
use crate::types::{Filesystem, PartitionRole};

/// Bounded wait for partition device nodes after a table rewrite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodePoll {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for NodePoll {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(200),
            timeout: Duration::from_secs(5),
        }
    }
}

impl NodePoll {
    /// Poll until every node in `nodes` is ready.
    ///
    /// # Errors
    ///
    /// `PartitionNodesNotReady` naming the nodes still missing at the deadline.
    pub fn wait_for<H: DiskHost + ?Sized>(&self, host: &H, nodes: &[PathBuf]) -> Result<Duration> {
        let start = Instant::now();
        loop {
            let missing: Vec<PathBuf> = nodes
                .iter()
                .filter(|node| !host.node_ready(node))
                .cloned()
                .collect();
            let waited = start.elapsed();

            if missing.is_empty() {
                debug!("{} partition node(s) ready after {:?}", nodes.len(), waited);
                return Ok(waited);
            }
            if waited >= self.timeout {
                return Err(LnosError::PartitionNodesNotReady { missing, waited });
            }
            std::thread::sleep(self.interval.min(self.timeout - waited));
        }
    }
}

/// Applies partition plans to block devices.
pub struct PlanExecutor<H: DiskHost> {
    host: H,
    staging_root: PathBuf,
    poll: NodePoll,
    passphrase: Option<Passphrase>,
    keyfile_dir: PathBuf,
    live: Arc<Mutex<MountTree>>,
    last_stage: ExecStage,
}

impl<H: DiskHost> PlanExecutor<H> {
    pub fn new(host: H) -> Self {
        Self {
            host,
            staging_root: PathBuf::from("/mnt"),
            poll: NodePoll::default(),
            passphrase: None,
            keyfile_dir: std::env::temp_dir(),
            live: Arc::new(Mutex::new(MountTree::new())),
            last_stage: ExecStage::Unwiped,
        }
    }

    pub fn with_staging_root(mut self, staging_root: impl Into<PathBuf>) -> Self {
        self.staging_root = staging_root.into();
        self
    }

    pub fn with_poll(mut self, poll: NodePoll) -> Self {
        self.poll = poll;
        self
    }

    pub fn with_passphrase(mut self, passphrase: Passphrase) -> Self {
        self.passphrase = Some(passphrase);
        self
    }

    /// Directory for the temporary LUKS keyfile.
    pub fn with_keyfile_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.keyfile_dir = dir.into();
        self
    }

    /// Share an existing live tree (e.g. one already handed to a signal handler).
    pub fn with_live_tree(mut self, live: Arc<Mutex<MountTree>>) -> Self {
        self.live = live;
        self
    }

    /// Handle to the tree of currently held resources.
    pub fn live_tree(&self) -> Arc<Mutex<MountTree>> {
        Arc::clone(&self.live)
    }

    pub fn staging_root(&self) -> &Path {
        &self.staging_root
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    /// Stage reached by the most recent `execute`.
    pub fn last_stage(&self) -> ExecStage {
        self.last_stage
    }

    /// Apply `plan` to `device_path` and return the mounted tree.
    ///
    /// The plan must have been computed for `device_path`. On success the
    /// tree stays held (and in [`live_tree`](Self::live_tree)) until
    /// [`release`](Self::release) or an external unwind.
    ///
    /// # Errors
    ///
    /// - `PlanMismatch`, `InvalidPlan`, `MissingPassphrase`, `DeviceBusy`:
    ///   raised before anything is written
    /// - `ToolFailure`, `PartitionNodesNotReady`, `Io`: raised after the
    ///   acquired resources have been unwound
    pub fn execute(&mut self, plan: &PartitionPlan, device_path: &Path) -> Result<MountTree> {
        if plan.disk() != device_path {
            return Err(LnosError::PlanMismatch {
                planned: plan.disk().to_path_buf(),
                requested: device_path.to_path_buf(),
            });
        }
        plan.validate()?;
        if plan.is_encrypted() && self.passphrase.is_none() {
            return Err(LnosError::MissingPassphrase);
        }
        if !self.lock_live().is_empty() {
            return Err(LnosError::device_busy(
                &self.staging_root,
                "a previous mount tree is still held",
            ));
        }
        self.check_not_busy(plan)?;

        info!("Executing plan on {}", device_path.display());
        let mut progress = ExecProgress::new(plan.is_encrypted());

        let outcome = {
            let mut run = Run {
                scope: UnwindScope::new(&mut self.host, Arc::clone(&self.live)),
                plan,
                staging_root: &self.staging_root,
                poll: self.poll,
                passphrase: self.passphrase.as_ref(),
                keyfile_dir: &self.keyfile_dir,
                progress: &mut progress,
            };
            match run.all_steps() {
                Ok(()) => Ok(run.scope.disarm()),
                Err(e) => {
                    error!(
                        "Execution failed after reaching {}: {}",
                        run.progress.current(),
                        e
                    );
                    Err(e)
                }
            }
        };

        self.last_stage = progress.current();
        if let Ok(ref tree) = outcome {
            info!(
                "Plan applied: {} resource(s) held under {}",
                tree.len(),
                self.staging_root.display()
            );
        }
        outcome
    }

    /// Unwind everything currently held, in reverse order.
    pub fn release(&mut self) -> UnwindReport {
        let live = Arc::clone(&self.live);
        let mut tree = live.lock().unwrap_or_else(PoisonError::into_inner);
        unwind(&mut tree, &mut self.host)
    }

    /// Refuse to touch a disk that is in use.
    fn check_not_busy(&self, plan: &PartitionPlan) -> Result<()> {
        for mount in self.host.active_mounts()? {
            if plan.observation.owns_node(&mount.source) {
                let holder = match &mount.target {
                    Some(target) => format!("mounted at {}", target.display()),
                    None => "active swap".to_string(),
                };
                return Err(LnosError::device_busy(&mount.source, holder));
            }
            if mount.target.as_deref() == Some(self.staging_root.as_path()) {
                return Err(LnosError::device_busy(
                    &self.staging_root,
                    format!("{} is already mounted there", mount.source.display()),
                ));
            }
        }

        // A partition opened through device-mapper is mounted under its mapper name
        if let Some(held) = self.host.holders(plan.disk())?.into_iter().next() {
            return Err(LnosError::device_busy(
                &held.node,
                format!("held by {}", held.holder),
            ));
        }

        if plan.is_encrypted() && self.host.path_exists(&plan.mapper_path()) {
            return Err(LnosError::device_busy(
                plan.mapper_path(),
                "device-mapper name already in use",
            ));
        }
        Ok(())
    }

    fn lock_live(&self) -> std::sync::MutexGuard<'_, MountTree> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Target path of a mount inside the staging root.
pub fn staging_path(staging_root: &Path, mount_path: &Path) -> PathBuf {
    match mount_path.strip_prefix("/") {
        Ok(rel) if rel.as_os_str().is_empty() => staging_root.to_path_buf(),
        Ok(rel) => staging_root.join(rel),
        Err(_) => staging_root.join(mount_path),
    }
}

/// One execution in flight.
struct Run<'a, H: DiskHost> {
    scope: UnwindScope<'a, H>,
    plan: &'a PartitionPlan,
    staging_root: &'a Path,
    poll: NodePoll,
    passphrase: Option<&'a Passphrase>,
    keyfile_dir: &'a Path,
    progress: &'a mut ExecProgress,
}

impl<H: DiskHost> Run<'_, H> {
    fn all_steps(&mut self) -> Result<()> {
        self.wipe()?;
        self.enter(ExecStage::Wiped)?;

        self.create_table()?;
        self.enter(ExecStage::TableCreated)?;

        self.create_partitions()?;
        self.probe()?;
        self.enter(ExecStage::PartitionsCreated)?;

        self.format()?;
        self.enter(ExecStage::Formatted)?;

        if self.plan.is_encrypted() {
            self.verify_mapper()?;
            self.enter(ExecStage::LuksOpened)?;
        }

        self.mount()?;
        self.enter(ExecStage::Mounted)?;
        Ok(())
    }

    fn enter(&mut self, stage: ExecStage) -> Result<()> {
        self.progress.transition_to(stage)?;
        Ok(())
    }

    fn disk(&self) -> PathBuf {
        self.plan.disk().to_path_buf()
    }

    fn wipe(&mut self) -> Result<()> {
        let args = WipeSignaturesArgs { disk: self.disk() };
        self.scope.host().run_checked(&args)?;
        Ok(())
    }

    fn create_table(&mut self) -> Result<()> {
        let args = MakeLabelArgs {
            disk: self.disk(),
            table: self.plan.table,
        };
        self.scope.host().run_checked(&args)?;
        Ok(())
    }

    fn create_partitions(&mut self) -> Result<()> {
        let plan = self.plan;
        for spec in &plan.specs {
            let end = match spec.size {
                PartitionSize::Fixed(_) => PartitionEnd::Mib(spec.end_mib),
                PartitionSize::Remaining => PartitionEnd::EndOfDisk,
            };
            let mkpart = MakePartitionArgs {
                disk: self.disk(),
                table: plan.table,
                name: spec.role.gpt_name().to_string(),
                filesystem: spec.filesystem,
                start_mib: spec.start_mib,
                end,
            };
            self.scope.host().run_checked(&mkpart)?;

            if let Some(flag) = spec.flag(plan.table) {
                let set = SetFlagArgs {
                    disk: self.disk(),
                    number: spec.number,
                    flag,
                };
                self.scope.host().run_checked(&set)?;
            }
            debug!("Created partition {} ({})", spec.number, spec.role);
        }
        Ok(())
    }

    fn probe(&mut self) -> Result<()> {
        let args = PartprobeArgs { disk: self.disk() };
        self.scope.host().run_checked(&args)?;

        let nodes: Vec<PathBuf> = self
            .plan
            .specs
            .iter()
            .map(|spec| self.plan.node_path(spec))
            .collect();
        self.poll.wait_for(self.scope.host(), &nodes)?;
        Ok(())
    }

    fn format(&mut self) -> Result<()> {
        let plan = self.plan;
        for spec in &plan.specs {
            let node = plan.node_path(spec);
            if spec.filesystem == Filesystem::LinuxSwap {
                let args = MkswapArgs {
                    device: node,
                    label: spec.role.fs_label().to_string(),
                };
                self.scope.host().run_checked(&args)?;
                continue;
            }
            let Some(kind) = MkfsKind::for_filesystem(spec.filesystem) else {
                debug!("Leaving partition {} unformatted ({})", spec.number, spec.role);
                continue;
            };

            let device = if spec.encrypted {
                self.luks_format_and_open(spec, node)?
            } else {
                node
            };
            let args = MkfsArgs {
                device: device.clone(),
                kind,
                label: spec.role.fs_label().to_string(),
            };
            self.scope.host().run_checked(&args)?;

            if spec.role == PartitionRole::Root && kind == MkfsKind::Btrfs {
                self.create_root_subvolume(device)?;
            }
        }
        Ok(())
    }

    /// LUKS2-format `node`, open it, and return the mapper device.
    ///
    /// The keyfile only exists for the duration of this call.
    fn luks_format_and_open(&mut self, spec: &PartitionSpec, node: PathBuf) -> Result<PathBuf> {
        let passphrase = self.passphrase.ok_or(LnosError::MissingPassphrase)?;
        let keyfile = SecretFile::new_in(self.keyfile_dir, passphrase)?;

        let format = LuksFormatArgs {
            device: node.clone(),
            key_file: keyfile.path().to_path_buf(),
        };
        self.scope.host().run_checked(&format)?;

        let open = LuksOpenArgs {
            device: node.clone(),
            mapper_name: self.plan.mapper_name.clone(),
            key_file: keyfile.path().to_path_buf(),
        };
        self.scope.host().run_checked(&open)?;
        self.scope.acquired(Acquired::Crypt {
            device: node,
            mapper_name: self.plan.mapper_name.clone(),
        });

        debug!("Partition {} opened as {}", spec.number, self.plan.mapper_path().display());
        Ok(self.plan.filesystem_device(spec))
    }

    /// Create the `@` subvolume through a temporary mount at the staging root.
    fn create_root_subvolume(&mut self, device: PathBuf) -> Result<()> {
        let root = self.staging_root.to_path_buf();
        self.scope.host().create_dir_all(&root)?;

        let mount = MountArgs {
            device: device.clone(),
            target: root.clone(),
            options: None,
        };
        self.scope.host().run_checked(&mount)?;
        self.scope.acquired(Acquired::Mount {
            device,
            target: root.clone(),
        });

        let subvolume = BtrfsSubvolumeCreateArgs {
            path: root.join("@"),
        };
        self.scope.host().run_checked(&subvolume)?;
        self.scope.release_last()
    }

    fn verify_mapper(&mut self) -> Result<()> {
        let mapper = self.plan.mapper_path();
        self.poll
            .wait_for(self.scope.host(), std::slice::from_ref(&mapper))?;
        Ok(())
    }

    fn mount(&mut self) -> Result<()> {
        let plan = self.plan;
        self.scope.host().create_dir_all(self.staging_root)?;

        for spec in plan.mount_order() {
            let Some(mount_path) = spec.mount_path.as_deref() else {
                continue;
            };
            let target = staging_path(self.staging_root, mount_path);
            if target != self.staging_root {
                self.scope.host().create_dir_all(&target)?;
            }

            let device = plan.filesystem_device(spec);
            let args = MountArgs {
                device: device.clone(),
                target: target.clone(),
                options: spec.mount_options().map(str::to_string),
            };
            self.scope.host().run_checked(&args)?;
            self.scope.acquired(Acquired::Mount { device, target });
        }

        if let Some(swap) = plan.swap() {
            let device = plan.node_path(swap);
            self.scope.host().run_checked(&SwaponArgs {
                device: device.clone(),
            })?;
            self.scope.acquired(Acquired::Swap { device });
        }
        Ok(())
    }
}
