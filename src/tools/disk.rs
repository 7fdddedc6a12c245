//! Type-safe arguments for partitioning and formatting tools.
//!
//! - `WipeSignaturesArgs` for `wipefs`
//! - `MakeLabelArgs`, `MakePartitionArgs`, `SetFlagArgs` for `parted`
//! - `PartprobeArgs` for `partprobe`
//! - `MkfsArgs` for `mkfs.fat` / `mkfs.ext4` / `mkfs.btrfs`
//! - `MkswapArgs` for `mkswap`

use std::path::PathBuf;

use crate::tool_traits::ToolArgs;
use crate::types::{Filesystem, PartitionTable};

/// `wipefs --all --force <disk>`
///
/// Removes every filesystem, RAID and partition-table signature so stale
/// superblocks cannot confuse the kernel after repartitioning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WipeSignaturesArgs {
    pub disk: PathBuf,
}

impl ToolArgs for WipeSignaturesArgs {
    fn program(&self) -> &'static str {
        "wipefs"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec![
            "--all".to_string(),
            "--force".to_string(),
            self.disk.display().to_string(),
        ]
    }

    fn step(&self) -> &'static str {
        "wipe"
    }

    fn is_destructive(&self) -> bool {
        true
    }
}

/// `parted --script <disk> mklabel gpt|msdos`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MakeLabelArgs {
    pub disk: PathBuf,
    pub table: PartitionTable,
}

impl ToolArgs for MakeLabelArgs {
    fn program(&self) -> &'static str {
        "parted"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec![
            "--script".to_string(),
            self.disk.display().to_string(),
            "mklabel".to_string(),
            self.table.parted_label().to_string(),
        ]
    }

    fn step(&self) -> &'static str {
        "partition-table"
    }

    fn is_destructive(&self) -> bool {
        true
    }
}

/// End boundary of a `mkpart` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionEnd {
    Mib(u64),
    /// `100%`: let parted stop short of the GPT backup header
    EndOfDisk,
}

/// `parted --script --align optimal <disk> mkpart <name> [<fs>] <start>MiB <end>`
///
/// On GPT `<name>` is the partition name; on MBR it is the part-type `primary`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MakePartitionArgs {
    pub disk: PathBuf,
    pub table: PartitionTable,
    pub name: String,
    pub filesystem: Filesystem,
    pub start_mib: u64,
    pub end: PartitionEnd,
}

impl ToolArgs for MakePartitionArgs {
    fn program(&self) -> &'static str {
        "parted"
    }

    fn to_cli_args(&self) -> Vec<String> {
        let mut args = vec![
            "--script".to_string(),
            "--align".to_string(),
            "optimal".to_string(),
            self.disk.display().to_string(),
            "mkpart".to_string(),
        ];

        match self.table {
            PartitionTable::Gpt => args.push(self.name.clone()),
            PartitionTable::Msdos => args.push("primary".to_string()),
        }
        if let Some(fs_type) = self.filesystem.parted_fs_type() {
            args.push(fs_type.to_string());
        }

        args.push(format!("{}MiB", self.start_mib));
        args.push(match self.end {
            PartitionEnd::Mib(end) => format!("{}MiB", end),
            PartitionEnd::EndOfDisk => "100%".to_string(),
        });
        args
    }

    fn step(&self) -> &'static str {
        "partition"
    }

    fn is_destructive(&self) -> bool {
        true
    }
}

/// `parted --script <disk> set <n> <flag> on`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetFlagArgs {
    pub disk: PathBuf,
    pub number: u32,
    pub flag: &'static str,
}

impl ToolArgs for SetFlagArgs {
    fn program(&self) -> &'static str {
        "parted"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec![
            "--script".to_string(),
            self.disk.display().to_string(),
            "set".to_string(),
            self.number.to_string(),
            self.flag.to_string(),
            "on".to_string(),
        ]
    }

    fn step(&self) -> &'static str {
        "partition"
    }
}

/// `partprobe <disk>`: ask the kernel to re-read the partition table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartprobeArgs {
    pub disk: PathBuf,
}

impl ToolArgs for PartprobeArgs {
    fn program(&self) -> &'static str {
        "partprobe"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec![self.disk.display().to_string()]
    }

    fn step(&self) -> &'static str {
        "probe"
    }
}

/// Filesystems an `mkfs.*` tool can create.
///
/// Swap and unformatted partitions have no variant, so they can never be
/// handed to `mkfs` by mistake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MkfsKind {
    Fat32,
    Ext4,
    Btrfs,
}

impl MkfsKind {
    /// `None` for swap (see [`MkswapArgs`]) and for partitions left unformatted.
    pub fn for_filesystem(filesystem: Filesystem) -> Option<Self> {
        match filesystem {
            Filesystem::Fat32 => Some(Self::Fat32),
            Filesystem::Ext4 => Some(Self::Ext4),
            Filesystem::Btrfs => Some(Self::Btrfs),
            Filesystem::LinuxSwap | Filesystem::None => None,
        }
    }
}

/// Filesystem creation for one device.
///
/// | Kind    | Invocation |
/// |---------|------------|
/// | `Fat32` | `mkfs.fat -F 32 -n <label> <dev>` |
/// | `Ext4`  | `mkfs.ext4 -F -L <label> <dev>` |
/// | `Btrfs` | `mkfs.btrfs -f -L <label> <dev>` |
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MkfsArgs {
    pub device: PathBuf,
    pub kind: MkfsKind,
    pub label: String,
}

impl ToolArgs for MkfsArgs {
    fn program(&self) -> &'static str {
        match self.kind {
            MkfsKind::Fat32 => "mkfs.fat",
            MkfsKind::Ext4 => "mkfs.ext4",
            MkfsKind::Btrfs => "mkfs.btrfs",
        }
    }

    fn to_cli_args(&self) -> Vec<String> {
        let mut args: Vec<String> = match self.kind {
            MkfsKind::Fat32 => vec!["-F".into(), "32".into(), "-n".into()],
            MkfsKind::Ext4 => vec!["-F".into(), "-L".into()],
            MkfsKind::Btrfs => vec!["-f".into(), "-L".into()],
        };
        args.push(self.label.clone());
        args.push(self.device.display().to_string());
        args
    }

    fn step(&self) -> &'static str {
        "format"
    }

    fn is_destructive(&self) -> bool {
        true
    }
}

/// `mkswap -L <label> <dev>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MkswapArgs {
    pub device: PathBuf,
    pub label: String,
}

impl ToolArgs for MkswapArgs {
    fn program(&self) -> &'static str {
        "mkswap"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec![
            "-L".to_string(),
            self.label.clone(),
            self.device.display().to_string(),
        ]
    }

    fn step(&self) -> &'static str {
        "format"
    }

    fn is_destructive(&self) -> bool {
        true
    }
}
