//! Device Inspector
//!
//! Reads the facts the planner needs from the running kernel: firmware mode,
//! the target disk's naming convention and capacity, and installed RAM.
//! Nothing here mutates the system.
//!
//! # Sources
//!
//! | Fact          | Source |
//! |---------------|--------|
//! | Firmware mode | presence of `/sys/firmware/efi` |
//! | Whole disk    | `/sys/class/block/<name>` exists without a `partition` file |
//! | Capacity      | `/sys/class/block/<name>/size` (512-byte sectors) |
//! | RAM           | `MemTotal` in `/proc/meminfo` |
//! | Active mounts | `/proc/self/mounts` and `/proc/swaps` |
//!
//! Both roots are injectable so tests can point the inspector at a fake tree.

use std::fmt;
use std::fs;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::error::{LnosError, Result};
use crate::engine::planner::PartitionSpec;

/// Bytes per kernel sector as reported by sysfs `size` files.
const SYSFS_SECTOR_BYTES: u64 = 512;

/// Detected firmware mode of the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FirmwareMode {
    /// UEFI firmware: ESP on GPT
    Uefi,
    /// Legacy BIOS firmware: GPT with bios_grub stub, or MBR
    Bios,
}

impl FirmwareMode {
    /// Returns true if the system booted in UEFI mode.
    pub fn is_uefi(self) -> bool {
        matches!(self, Self::Uefi)
    }
}

impl fmt::Display for FirmwareMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uefi => write!(f, "UEFI"),
            Self::Bios => write!(f, "BIOS"),
        }
    }
}

/// Partition node naming convention of a disk.
///
/// Kernel names ending in a digit (`nvme0n1`, `mmcblk0`, `loop0`) need a
/// literal `p` before the partition number; the rest (`sda`, `vda`) do not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BusKind {
    /// `/dev/nvme0n1` -> `/dev/nvme0n1p1`
    Nvme,
    /// `/dev/sda` -> `/dev/sda1`
    Scsi,
}

impl BusKind {
    /// Classify a device path by its kernel name.
    pub fn from_device_path(path: &Path) -> Self {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if name.ends_with(|c: char| c.is_ascii_digit()) {
            Self::Nvme
        } else {
            Self::Scsi
        }
    }

    /// Separator placed between the disk path and the partition number.
    pub fn partition_separator(self) -> &'static str {
        match self {
            Self::Nvme => "p",
            Self::Scsi => "",
        }
    }
}

impl fmt::Display for BusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nvme => write!(f, "NVMe"),
            Self::Scsi => write!(f, "SCSI"),
        }
    }
}

/// Everything the planner needs to know about the host and target disk.
///
/// Computed fresh on every run; never persisted. Fixed once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceObservation {
    firmware_mode: FirmwareMode,
    bus_kind: BusKind,
    ram_bytes: u64,
    capacity_bytes: u64,
    target_device_path: PathBuf,
}

impl DeviceObservation {
    /// Build an observation from already-known facts (bus kind derived from the path).
    pub fn new(
        firmware_mode: FirmwareMode,
        ram_bytes: u64,
        capacity_bytes: u64,
        target_device_path: impl Into<PathBuf>,
    ) -> Self {
        let target_device_path = target_device_path.into();
        Self {
            firmware_mode,
            bus_kind: BusKind::from_device_path(&target_device_path),
            ram_bytes,
            capacity_bytes,
            target_device_path,
        }
    }

    pub fn firmware_mode(&self) -> FirmwareMode {
        self.firmware_mode
    }

    pub fn bus_kind(&self) -> BusKind {
        self.bus_kind
    }

    pub fn ram_bytes(&self) -> u64 {
        self.ram_bytes
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.capacity_bytes
    }

    /// Kernel node of the whole disk (by-id links already resolved).
    pub fn target_device_path(&self) -> &Path {
        &self.target_device_path
    }

    /// Device node of the `number`-th partition (1-based) on the target disk.
    pub fn partition_node(&self, number: u32) -> PathBuf {
        PathBuf::from(format!(
            "{}{}{}",
            self.target_device_path.display(),
            self.bus_kind.partition_separator(),
            number
        ))
    }

    /// Device node a planned partition will appear as.
    pub fn partition_node_path(&self, spec: &PartitionSpec) -> PathBuf {
        self.partition_node(spec.number)
    }

    /// Returns true if `node` is the target disk or one of its partitions.
    pub fn owns_node(&self, node: &Path) -> bool {
        let disk = self.target_device_path.to_string_lossy();
        let node = node.to_string_lossy();
        let Some(rest) = node.strip_prefix(disk.as_ref()) else {
            return false;
        };
        // `nvme0n11` is another namespace, not partition 1 of `nvme0n1`
        rest.is_empty()
            || rest
                .strip_prefix(self.bus_kind.partition_separator())
                .is_some_and(|digits| {
                    !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
                })
    }

    /// Disk capacity in whole MiB.
    pub fn capacity_mib(&self) -> u64 {
        self.capacity_bytes / crate::engine::planner::MIB
    }
}

impl fmt::Display for DeviceObservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}, {} MiB) on {} firmware, {} MiB RAM",
            self.target_device_path.display(),
            self.bus_kind,
            self.capacity_mib(),
            self.firmware_mode,
            self.ram_bytes / crate::engine::planner::MIB
        )
    }
}

/// One line of `/proc/self/mounts` or `/proc/swaps` that matters for busy checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveMount {
    /// Device (or pseudo-source) backing the mount
    pub source: PathBuf,
    /// Mount point, or `None` for an active swap area
    pub target: Option<PathBuf>,
}

/// A kernel device stacked on the target disk or one of its partitions
/// (`dm-0` for an opened LUKS volume or LVM, `md127` for RAID).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct BlockHolder {
    /// The disk or partition being held
    pub node: PathBuf,
    /// Kernel name of the holder
    pub holder: String,
}

/// Filesystem roots the inspector reads from.
#[derive(Debug, Clone)]
pub struct HostRoots {
    pub sysfs: PathBuf,
    pub procfs: PathBuf,
    /// Require the device path to be a real block special file
    pub verify_node: bool,
}

impl HostRoots {
    /// The running system's `/sys` and `/proc`.
    pub fn system() -> Self {
        Self {
            sysfs: PathBuf::from("/sys"),
            procfs: PathBuf::from("/proc"),
            verify_node: true,
        }
    }
}

impl Default for HostRoots {
    fn default() -> Self {
        Self::system()
    }
}

/// Read-only queries against the host.
#[derive(Debug, Clone, Default)]
pub struct DeviceInspector {
    roots: HostRoots,
}

impl DeviceInspector {
    /// Inspector for the running system.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inspector reading from alternate sysfs/procfs roots.
    pub fn with_roots(roots: HostRoots) -> Self {
        Self { roots }
    }

    /// Inspect `device_path` and the host it is attached to.
    ///
    /// # Errors
    ///
    /// `DeviceNotFound` if the path is not under `/dev/`, is not a block
    /// device known to the kernel, or names a partition instead of a disk.
    pub fn inspect(&self, device_path: &Path) -> Result<DeviceObservation> {
        let device = self.resolve_device(device_path)?;
        let name = kernel_name(&device)?;
        let block_dir = self.roots.sysfs.join("class/block").join(&name);

        if !block_dir.exists() {
            return Err(LnosError::device_not_found(
                device_path,
                "not a block device known to the kernel",
            ));
        }
        if block_dir.join("partition").exists() {
            return Err(LnosError::device_not_found(
                device_path,
                "is a partition, select the whole disk",
            ));
        }

        let sectors = read_trimmed(&block_dir.join("size"))?
            .parse::<u64>()
            .map_err(|e| LnosError::device_not_found(device_path, format!("unreadable size: {}", e)))?;
        if sectors == 0 {
            return Err(LnosError::device_not_found(device_path, "reports zero capacity"));
        }

        let observation = DeviceObservation::new(
            self.firmware_mode(),
            self.ram_bytes()?,
            sectors * SYSFS_SECTOR_BYTES,
            device,
        );

        info!("Device inspection: {}", observation);
        Ok(observation)
    }

    /// Detect firmware mode by checking for the EFI runtime interface in sysfs.
    pub fn firmware_mode(&self) -> FirmwareMode {
        let efi_path = self.roots.sysfs.join("firmware/efi");

        if efi_path.exists() {
            debug!("UEFI firmware detected ({} exists)", efi_path.display());
            FirmwareMode::Uefi
        } else {
            debug!("BIOS firmware detected ({} not found)", efi_path.display());
            FirmwareMode::Bios
        }
    }

    /// Installed RAM in bytes, from `MemTotal`.
    pub fn ram_bytes(&self) -> Result<u64> {
        let meminfo = fs::read_to_string(self.roots.procfs.join("meminfo"))?;
        parse_meminfo_total(&meminfo).ok_or_else(|| {
            LnosError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "MemTotal missing from meminfo",
            ))
        })
    }

    /// Currently mounted filesystems and active swap areas.
    pub fn active_mounts(&self) -> Result<Vec<ActiveMount>> {
        let mounts = fs::read_to_string(self.roots.procfs.join("self/mounts"))?;
        let mut active = parse_mounts(&mounts);

        match fs::read_to_string(self.roots.procfs.join("swaps")) {
            Ok(swaps) => active.extend(parse_swaps(&swaps)),
            Err(e) => warn!("Could not read swaps table: {}", e),
        }

        Ok(active)
    }

    /// Devices stacked on `disk` or on any of its partitions.
    ///
    /// A partition opened through device-mapper shows up in the mount table
    /// only under its mapper name, so this is the only way to see it.
    pub fn holders(&self, disk: &Path) -> Result<Vec<BlockHolder>> {
        let block_dir = self.roots.sysfs.join("class/block").join(kernel_name(disk)?);
        let mut held = read_holders(&block_dir.join("holders"), disk)?;

        let entries = match fs::read_dir(&block_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(held),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let part_dir = entry?.path();
            if !part_dir.join("partition").exists() {
                continue;
            }
            let Some(part_name) = part_dir.file_name() else {
                continue;
            };
            let node = disk.with_file_name(part_name);
            held.extend(read_holders(&part_dir.join("holders"), &node)?);
        }

        held.sort();
        Ok(held)
    }

    /// Validate the path and resolve `/dev/disk/by-*` symlinks to the kernel node.
    fn resolve_device(&self, device_path: &Path) -> Result<PathBuf> {
        if !device_path.starts_with("/dev/") {
            return Err(LnosError::device_not_found(device_path, "path must start with /dev/"));
        }
        if !self.roots.verify_node {
            return Ok(device_path.to_path_buf());
        }

        let resolved = fs::canonicalize(device_path)
            .map_err(|e| LnosError::device_not_found(device_path, e.to_string()))?;
        let meta = fs::metadata(&resolved)
            .map_err(|e| LnosError::device_not_found(device_path, e.to_string()))?;
        if !meta.file_type().is_block_device() {
            return Err(LnosError::device_not_found(device_path, "not a block device"));
        }
        if resolved != device_path {
            debug!("Resolved {} -> {}", device_path.display(), resolved.display());
        }
        Ok(resolved)
    }
}

fn kernel_name(device: &Path) -> Result<String> {
    device
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .filter(|n| !n.is_empty())
        .ok_or_else(|| LnosError::device_not_found(device, "no device name"))
}

fn read_holders(dir: &Path, node: &Path) -> Result<Vec<BlockHolder>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    entries
        .map(|entry| -> Result<BlockHolder> {
            Ok(BlockHolder {
                node: node.to_path_buf(),
                holder: entry?.file_name().to_string_lossy().into_owned(),
            })
        })
        .collect()
}

fn read_trimmed(path: &Path) -> Result<String> {
    Ok(fs::read_to_string(path)?.trim().to_string())
}

/// Parse `MemTotal:  16318480 kB` into bytes.
pub fn parse_meminfo_total(meminfo: &str) -> Option<u64> {
    meminfo.lines().find_map(|line| {
        let rest = line.strip_prefix("MemTotal:")?;
        let mut parts = rest.split_whitespace();
        let value: u64 = parts.next()?.parse().ok()?;
        let multiplier = match parts.next() {
            Some("kB") | Some("KB") | Some("kb") => 1024,
            None => 1,
            Some(_) => return None,
        };
        Some(value * multiplier)
    })
}

/// Parse `/proc/self/mounts` into source/target pairs.
///
/// Octal escapes (`\040` for space) in the target are decoded.
pub fn parse_mounts(mounts: &str) -> Vec<ActiveMount> {
    mounts
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let source = fields.next()?;
            let target = fields.next()?;
            Some(ActiveMount {
                source: PathBuf::from(unescape_octal(source)),
                target: Some(PathBuf::from(unescape_octal(target))),
            })
        })
        .collect()
}

/// Parse `/proc/swaps` (header line skipped).
pub fn parse_swaps(swaps: &str) -> Vec<ActiveMount> {
    swaps
        .lines()
        .skip(1)
        .filter_map(|line| line.split_whitespace().next())
        .map(|source| ActiveMount {
            source: PathBuf::from(unescape_octal(source)),
            target: None,
        })
        .collect()
}

fn unescape_octal(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 4 <= bytes.len() {
            let oct = &bytes[i + 1..i + 4];
            let decoded = std::str::from_utf8(oct)
                .ok()
                .and_then(|s| u8::from_str_radix(s, 8).ok());
            if let Some(v) = decoded {
                out.push(v);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
