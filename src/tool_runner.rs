//! Type-Safe Tool Execution
//!
//! [`DiskHost`] is the only seam between the engine and the operating system.
//! The executor and unwinder never spawn processes or touch the filesystem
//! directly; they go through a host.
//!
//! - [`SystemHost`] runs real tools through [`run_tool`]
//! - [`DryRunHost`] logs every command and reports success without running anything
//!
//! # Architecture Rule
//!
//! `run_tool` is the execution gatekeeper. Every child is spawned in its own
//! process group with a parent-death signal and registered with
//! [`ChildRegistry`] so an interrupt can terminate it.

use std::fs;
use std::os::unix::fs::FileTypeExt;
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::PoisonError;

use log::info;

use crate::error::{LnosError, Result};
use crate::hardware::{ActiveMount, BlockHolder, DeviceInspector};
use crate::process_guard::{ChildRegistry, CommandProcessGroup};
use crate::tool_traits::ToolArgs;

/// Output from a tool execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    pub stdout: String,
    pub stderr: String,
    /// Exit code (None if terminated by signal)
    pub exit_code: Option<i32>,
    pub success: bool,
}

impl ToolOutput {
    /// A successful run with no output.
    pub fn ok() -> Self {
        Self {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: Some(0),
            success: true,
        }
    }

    /// A failed run with the given exit code and stderr.
    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.into(),
            exit_code: Some(exit_code),
            success: false,
        }
    }

    /// Convert a non-zero exit into `ToolFailure` for `step`.
    pub fn ensure_success(&self, step: &str) -> Result<()> {
        if self.success {
            Ok(())
        } else {
            Err(LnosError::ToolFailure {
                step: step.to_string(),
                exit_code: self.exit_code.unwrap_or(-1),
                stderr: self.stderr.trim().to_string(),
            })
        }
    }
}

/// Everything the engine needs from the operating system.
pub trait DiskHost {
    /// Run one external tool to completion.
    ///
    /// Returns `Err` only if the tool could not be run at all; a non-zero
    /// exit is reported through [`ToolOutput::success`].
    fn run(&mut self, args: &dyn ToolArgs) -> Result<ToolOutput>;

    /// Returns true once `path` exists as a block device node.
    fn node_ready(&self, path: &Path) -> bool;

    /// Returns true if anything exists at `path`.
    fn path_exists(&self, path: &Path) -> bool;

    fn create_dir_all(&mut self, path: &Path) -> Result<()>;

    /// Mounted filesystems and active swap areas.
    fn active_mounts(&self) -> Result<Vec<ActiveMount>>;

    /// Devices (device-mapper, md) stacked on `disk` or its partitions.
    fn holders(&self, disk: &Path) -> Result<Vec<BlockHolder>>;

    /// Run a tool and turn a non-zero exit into `ToolFailure`.
    fn run_checked(&mut self, args: &dyn ToolArgs) -> Result<ToolOutput> {
        let output = self.run(args)?;
        output.ensure_success(args.step())?;
        Ok(output)
    }
}

impl<H: DiskHost + ?Sized> DiskHost for &mut H {
    fn run(&mut self, args: &dyn ToolArgs) -> Result<ToolOutput> {
        (**self).run(args)
    }

    fn node_ready(&self, path: &Path) -> bool {
        (**self).node_ready(path)
    }

    fn path_exists(&self, path: &Path) -> bool {
        (**self).path_exists(path)
    }

    fn create_dir_all(&mut self, path: &Path) -> Result<()> {
        (**self).create_dir_all(path)
    }

    fn active_mounts(&self) -> Result<Vec<ActiveMount>> {
        (**self).active_mounts()
    }

    fn holders(&self, disk: &Path) -> Result<Vec<BlockHolder>> {
        (**self).holders(disk)
    }
}

/// Execute a tool with type-safe arguments.
///
/// # Death Pact Compliance
///
/// - Spawns the tool in a new process group via `.in_new_process_group()`
/// - Registers the child PID with `ChildRegistry::global()` while it runs
pub fn run_tool(args: &dyn ToolArgs) -> Result<ToolOutput> {
    let program = args.program();
    let cli_args = args.to_cli_args();
    let env_vars = args.get_env_vars();
    let env_names: Vec<&str> = env_vars.iter().map(|(k, _)| k.as_str()).collect();

    info!(
        "run_tool: {} args={:?} env={:?}{}",
        program,
        cli_args,
        env_names,
        if args.is_destructive() { " [destructive]" } else { "" }
    );

    let mut cmd = Command::new(program);
    cmd.args(&cli_args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .in_new_process_group();

    for (key, value) in &env_vars {
        cmd.env(key, value);
    }

    let child = cmd.spawn().map_err(|source| LnosError::Spawn {
        program: program.to_string(),
        source,
    })?;
    let pid = child.id();

    ChildRegistry::global()
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .register(pid);

    let waited = child.wait_with_output();

    ChildRegistry::global()
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .unregister(pid);

    let output = waited?;
    let result = ToolOutput {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        exit_code: output.status.code(),
        success: output.status.success(),
    };

    if result.success {
        info!("{} executed successfully", program);
    } else {
        info!(
            "{} failed with exit code {}",
            program,
            result.exit_code.unwrap_or(-1)
        );
    }
    Ok(result)
}

/// Host backed by the running system.
#[derive(Debug, Clone, Default)]
pub struct SystemHost {
    inspector: DeviceInspector,
}

impl SystemHost {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DiskHost for SystemHost {
    fn run(&mut self, args: &dyn ToolArgs) -> Result<ToolOutput> {
        run_tool(args)
    }

    fn node_ready(&self, path: &Path) -> bool {
        fs::metadata(path)
            .map(|m| m.file_type().is_block_device())
            .unwrap_or(false)
    }

    fn path_exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn create_dir_all(&mut self, path: &Path) -> Result<()> {
        fs::create_dir_all(path)?;
        Ok(())
    }

    fn active_mounts(&self) -> Result<Vec<ActiveMount>> {
        self.inspector.active_mounts()
    }

    fn holders(&self, disk: &Path) -> Result<Vec<BlockHolder>> {
        self.inspector.holders(disk)
    }
}

/// Host that mutates nothing.
///
/// Busy checks still read the real mount table and holders so a dry run
/// reports the same refusals a real run would.
#[derive(Debug, Clone, Default)]
pub struct DryRunHost {
    inspector: DeviceInspector,
    commands: Vec<String>,
}

impl DryRunHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Host reading mounts through a custom inspector.
    pub fn with_inspector(inspector: DeviceInspector) -> Self {
        Self {
            inspector,
            commands: Vec::new(),
        }
    }

    /// Every command line that would have run, in order.
    pub fn commands(&self) -> &[String] {
        &self.commands
    }
}

impl DiskHost for DryRunHost {
    fn run(&mut self, args: &dyn ToolArgs) -> Result<ToolOutput> {
        let line = args.command_line();
        info!("[dry-run] {}", line);
        self.commands.push(line);
        Ok(ToolOutput::ok())
    }

    fn node_ready(&self, _path: &Path) -> bool {
        true
    }

    fn path_exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn create_dir_all(&mut self, path: &Path) -> Result<()> {
        let line = format!("mkdir -p {}", path.display());
        info!("[dry-run] {}", line);
        self.commands.push(line);
        Ok(())
    }

    fn active_mounts(&self) -> Result<Vec<ActiveMount>> {
        self.inspector.active_mounts()
    }

    fn holders(&self, disk: &Path) -> Result<Vec<BlockHolder>> {
        self.inspector.holders(disk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::disk::WipeSignaturesArgs;
    use crate::tools::mount::UmountArgs;
    use std::path::PathBuf;

    struct Echo(Vec<String>);

    impl ToolArgs for Echo {
        fn program(&self) -> &'static str {
            "sh"
        }

        fn to_cli_args(&self) -> Vec<String> {
            self.0.clone()
        }

        fn step(&self) -> &'static str {
            "probe"
        }
    }

    #[test]
    fn test_ensure_success_maps_to_tool_failure() {
        let output = ToolOutput::failed(32, "umount: /mnt: target is busy.\n");
        let err = output.ensure_success("unmount").expect_err("failure"); // test: non-zero exit
        match err {
            LnosError::ToolFailure { step, exit_code, stderr } => {
                assert_eq!(step, "unmount");
                assert_eq!(exit_code, 32);
                assert_eq!(stderr, "umount: /mnt: target is busy.");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(ToolOutput::ok().ensure_success("wipe").is_ok());
    }

    #[test]
    fn test_run_tool_captures_output_and_exit_code() {
        let ok = run_tool(&Echo(vec!["-c".into(), "echo hello".into()])).expect("spawn");
        assert!(ok.success);
        assert_eq!(ok.stdout.trim(), "hello");

        let failed = run_tool(&Echo(vec!["-c".into(), "echo oops >&2; exit 3".into()]))
            .expect("spawn");
        assert!(!failed.success);
        assert_eq!(failed.exit_code, Some(3));
        assert_eq!(failed.stderr.trim(), "oops");
    }

    #[test]
    fn test_run_tool_reports_spawn_failure() {
        struct Missing;
        impl ToolArgs for Missing {
            fn program(&self) -> &'static str {
                "lnos-definitely-not-a-binary"
            }
            fn to_cli_args(&self) -> Vec<String> {
                Vec::new()
            }
            fn step(&self) -> &'static str {
                "wipe"
            }
        }
        assert!(matches!(run_tool(&Missing), Err(LnosError::Spawn { .. })));
    }

    #[test]
    fn test_dry_run_records_commands_in_order() {
        let mut host = DryRunHost::new();
        host.run_checked(&WipeSignaturesArgs {
            disk: PathBuf::from("/dev/sda"),
        })
        .expect("dry run");
        host.create_dir_all(Path::new("/mnt/boot")).expect("dry run");
        host.run_checked(&UmountArgs {
            target: PathBuf::from("/mnt"),
        })
        .expect("dry run");

        assert_eq!(
            host.commands(),
            ["wipefs --all --force /dev/sda", "mkdir -p /mnt/boot", "umount /mnt"]
        );
        assert!(host.node_ready(Path::new("/dev/sda1")));
    }

    #[test]
    fn test_system_host_node_ready_requires_block_device() {
        let file = tempfile::NamedTempFile::new().expect("tempfile");
        let host = SystemHost::new();
        assert!(!host.node_ready(file.path()));
        assert!(host.path_exists(file.path()));
        assert!(!host.node_ready(Path::new("/dev/lnos-missing0")));
    }
}
