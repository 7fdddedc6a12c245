//! Shared test doubles for integration tests.
//!
//! `RecordingHost` stands in for the operating system: it records every
//! command line, fails on demand, and reports whatever mounts, holders and
//! device nodes a test configures. No real block device is ever touched.

#![allow(dead_code)]

use std::path::{Path, PathBuf};

use lnos::engine::planner::{plan, PartitionPlan, PlanPolicy, GIB};
use lnos::error::Result;
use lnos::hardware::{ActiveMount, BlockHolder, DeviceObservation, FirmwareMode};
use lnos::tool_runner::{DiskHost, ToolOutput};
use lnos::tool_traits::ToolArgs;

pub const DISK: &str = "/dev/lnos-test-sda";
pub const STAGING: &str = "/lnos-test-root";

#[derive(Debug, Default)]
pub struct RecordingHost {
    /// Every tool command line, in order
    pub commands: Vec<String>,
    /// Directories created, in order
    pub dirs: Vec<PathBuf>,
    /// Commands starting with this prefix exit with status 1
    pub fail_prefix: Option<String>,
    /// Partition and mapper nodes never appear when set
    pub nodes_missing: bool,
    pub mounts: Vec<ActiveMount>,
    pub existing_paths: Vec<PathBuf>,
    /// Devices stacked on the target disk or its partitions
    pub holders: Vec<BlockHolder>,
}

impl RecordingHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_on(prefix: &str) -> Self {
        Self {
            fail_prefix: Some(prefix.to_string()),
            ..Self::default()
        }
    }

    /// Commands whose program is `program`.
    pub fn commands_of(&self, program: &str) -> Vec<&str> {
        self.commands
            .iter()
            .map(String::as_str)
            .filter(|line| line.split_whitespace().next() == Some(program))
            .collect()
    }

    pub fn position(&self, line: &str) -> Option<usize> {
        self.commands.iter().position(|c| c == line)
    }
}

impl DiskHost for RecordingHost {
    fn run(&mut self, args: &dyn ToolArgs) -> Result<ToolOutput> {
        let line = args.command_line();
        let fails = self
            .fail_prefix
            .as_deref()
            .is_some_and(|prefix| line.starts_with(prefix));
        self.commands.push(line);
        if fails {
            Ok(ToolOutput::failed(1, "simulated failure\n"))
        } else {
            Ok(ToolOutput::ok())
        }
    }

    fn node_ready(&self, _path: &Path) -> bool {
        !self.nodes_missing
    }

    fn path_exists(&self, path: &Path) -> bool {
        self.existing_paths.iter().any(|p| p == path)
    }

    fn create_dir_all(&mut self, path: &Path) -> Result<()> {
        self.dirs.push(path.to_path_buf());
        Ok(())
    }

    fn active_mounts(&self) -> Result<Vec<ActiveMount>> {
        Ok(self.mounts.clone())
    }

    fn holders(&self, _disk: &Path) -> Result<Vec<BlockHolder>> {
        Ok(self.holders.clone())
    }
}

pub fn observation(firmware: FirmwareMode, ram_gib: u64, capacity_gib: u64) -> DeviceObservation {
    DeviceObservation::new(firmware, ram_gib * GIB, capacity_gib * GIB, DISK)
}

pub fn uefi_plan(policy: &PlanPolicy) -> PartitionPlan {
    plan(&observation(FirmwareMode::Uefi, 8, 100), policy).expect("test: layout fits 100 GiB")
}
