//! Partition Planner
//!
//! Turns a [`DeviceObservation`] and a [`PlanPolicy`] into a [`PartitionPlan`]:
//! an ordered list of partitions with absolute MiB offsets, filesystems and
//! mount paths. The executor creates them in exactly this order.
//!
//! # Layouts
//!
//! | Firmware / policy        | Partitions (after the 1 MiB leading gap) |
//! |--------------------------|------------------------------------------|
//! | UEFI, `esp-at-boot-efi`  | ESP `/boot/efi` → [SWAP] → ROOT `/` |
//! | UEFI, `esp-at-boot`      | ESP `/boot` → [SWAP] → ROOT `/` |
//! | UEFI, `split-boot`       | ESP `/boot/efi` → BOOT `/boot` → [SWAP] → ROOT `/` |
//! | BIOS, GPT                | BIOS_BOOT (1 MiB, bios_grub) → BOOT `/boot` → [SWAP] → ROOT `/` |
//! | BIOS, MBR                | BOOT `/boot` (boot flag) → [SWAP] → ROOT `/` |
//!
//! SWAP is inserted when installed RAM is below the policy threshold.
//!
//! # Design
//!
//! - **Pure logic**: no I/O, no clock, no randomness; same inputs give an identical plan
//! - **Contiguous**: each partition starts exactly where the previous one ends
//! - **Validated**: the plan is checked against its structural invariants before returning

use std::fmt;
use std::path::{Component, Path, PathBuf};

use serde::Serialize;

use crate::error::{LnosError, Result};
use crate::hardware::{DeviceObservation, FirmwareMode};
use crate::types::{BiosTable, Filesystem, PartitionRole, PartitionTable, UefiLayout};

pub const MIB: u64 = 1024 * 1024;
pub const GIB: u64 = 1024 * MIB;

/// Alignment headroom left in front of the first partition.
pub const LEADING_GAP_MIB: u64 = 1;

/// Size of the GRUB core-image stub on BIOS+GPT.
pub const BIOS_BOOT_SIZE_MIB: u64 = 1;

/// Largest disk an MBR table can address with 512-byte sectors.
pub const MBR_MAX_BYTES: u64 = 2 * 1024 * GIB;

/// Mount options for a btrfs root mounted through its `@` subvolume.
pub const BTRFS_ROOT_OPTIONS: &str = "subvol=@,compress=zstd,noatime";

/// Mount options keeping the ESP unreadable to unprivileged users.
pub const ESP_OPTIONS: &str = "fmask=0077,dmask=0077";

/// Policy knobs the planner honours.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanPolicy {
    pub root_filesystem: Filesystem,
    pub encrypted: bool,
    pub bios_table: BiosTable,
    pub uefi_layout: UefiLayout,
    /// Swap is planned when RAM is strictly below this many bytes
    pub swap_threshold_bytes: u64,
    pub swap_size_mib: u64,
    pub esp_size_mib: u64,
    pub boot_size_mib: u64,
    /// Smallest acceptable ROOT partition
    pub min_root_mib: u64,
    /// Name under `/dev/mapper/` for the opened LUKS root
    pub mapper_name: String,
}

impl Default for PlanPolicy {
    fn default() -> Self {
        Self {
            root_filesystem: Filesystem::Btrfs,
            encrypted: false,
            bios_table: BiosTable::Gpt,
            uefi_layout: UefiLayout::EspAtBootEfi,
            swap_threshold_bytes: 15 * GIB,
            swap_size_mib: 4096,
            esp_size_mib: 512,
            boot_size_mib: 1024,
            min_root_mib: 8192,
            mapper_name: "cryptroot".to_string(),
        }
    }
}

impl PlanPolicy {
    /// Reject policies that can never produce a valid plan, regardless of disk.
    pub fn validate(&self) -> Result<()> {
        if !self.root_filesystem.is_root_capable() {
            return Err(LnosError::unsupported(format!(
                "root filesystem '{}' is not supported (use ext4 or btrfs)",
                self.root_filesystem
            )));
        }
        for (name, value) in [
            ("swap size", self.swap_size_mib),
            ("ESP size", self.esp_size_mib),
            ("boot size", self.boot_size_mib),
        ] {
            if value == 0 {
                return Err(LnosError::unsupported(format!("{} must be greater than zero", name)));
            }
        }
        if self.encrypted && !is_valid_mapper_name(&self.mapper_name) {
            return Err(LnosError::unsupported(format!(
                "invalid device-mapper name '{}'",
                self.mapper_name
            )));
        }
        Ok(())
    }
}

/// Device-mapper names: non-empty, no path separators, no whitespace.
pub fn is_valid_mapper_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 127
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// Requested size of a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionSize {
    Fixed(u64),
    /// Everything up to the end of the disk (ROOT only, always last)
    Remaining,
}

impl fmt::Display for PartitionSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed(mib) => write!(f, "{} MiB", mib),
            Self::Remaining => write!(f, "REMAINING"),
        }
    }
}

/// One planned partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionSpec {
    /// 1-based partition number, equal to its position on disk
    pub number: u32,
    pub role: PartitionRole,
    pub filesystem: Filesystem,
    pub size: PartitionSize,
    pub start_mib: u64,
    pub end_mib: u64,
    /// Absolute path relative to the staging root (`/` for ROOT)
    pub mount_path: Option<PathBuf>,
    pub encrypted: bool,
}

impl PartitionSpec {
    pub fn size_mib(&self) -> u64 {
        self.end_mib - self.start_mib
    }

    /// Partition flag parted sets on this entry, if any.
    pub fn flag(&self, table: PartitionTable) -> Option<&'static str> {
        match (self.role, table) {
            (PartitionRole::EfiSystem, _) => Some("esp"),
            (PartitionRole::BiosBoot, _) => Some("bios_grub"),
            (PartitionRole::Boot, PartitionTable::Msdos) => Some("boot"),
            _ => None,
        }
    }

    /// Options passed to `mount -o`, if any.
    pub fn mount_options(&self) -> Option<&'static str> {
        match (self.role, self.filesystem) {
            (PartitionRole::Root, Filesystem::Btrfs) => Some(BTRFS_ROOT_OPTIONS),
            (PartitionRole::EfiSystem, _) => Some(ESP_OPTIONS),
            _ => None,
        }
    }

    /// Nesting depth of the mount path (`/` is 0, `/boot/efi` is 2).
    pub fn mount_depth(&self) -> usize {
        self.mount_path
            .as_deref()
            .map(|p| p.components().filter(|c| matches!(c, Component::Normal(_))).count())
            .unwrap_or(usize::MAX)
    }
}

impl fmt::Display for PartitionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:>2}  {:<10} {:>8}-{:<8} {:>10}  {:<10}",
            self.number,
            self.role.to_string(),
            self.start_mib,
            self.end_mib,
            format!("{} MiB", self.size_mib()),
            self.filesystem.to_string(),
        )?;
        match &self.mount_path {
            Some(path) => write!(f, " {}", path.display())?,
            None => write!(f, " -")?,
        }
        if self.encrypted {
            write!(f, " (LUKS2)")?;
        }
        Ok(())
    }
}

/// A complete, validated partition plan for one disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionPlan {
    pub observation: DeviceObservation,
    pub table: PartitionTable,
    /// Physical order on disk
    pub specs: Vec<PartitionSpec>,
    pub mapper_name: String,
}

impl PartitionPlan {
    pub fn disk(&self) -> &Path {
        self.observation.target_device_path()
    }

    pub fn firmware_mode(&self) -> FirmwareMode {
        self.observation.firmware_mode()
    }

    pub fn root(&self) -> Option<&PartitionSpec> {
        self.find(PartitionRole::Root)
    }

    pub fn esp(&self) -> Option<&PartitionSpec> {
        self.find(PartitionRole::EfiSystem)
    }

    pub fn swap(&self) -> Option<&PartitionSpec> {
        self.find(PartitionRole::Swap)
    }

    pub fn find(&self, role: PartitionRole) -> Option<&PartitionSpec> {
        self.specs.iter().find(|s| s.role == role)
    }

    pub fn is_encrypted(&self) -> bool {
        self.specs.iter().any(|s| s.encrypted)
    }

    /// Raw partition node of `spec`.
    pub fn node_path(&self, spec: &PartitionSpec) -> PathBuf {
        self.observation.partition_node_path(spec)
    }

    pub fn mapper_path(&self) -> PathBuf {
        Path::new("/dev/mapper").join(&self.mapper_name)
    }

    /// Device that carries the filesystem of `spec`: the mapper node for an
    /// encrypted partition, the raw node otherwise.
    pub fn filesystem_device(&self, spec: &PartitionSpec) -> PathBuf {
        if spec.encrypted {
            self.mapper_path()
        } else {
            self.node_path(spec)
        }
    }

    /// Mountable partitions in mount order: ROOT first, then by nesting
    /// depth, ties kept in physical order.
    pub fn mount_order(&self) -> Vec<&PartitionSpec> {
        let mut mounts: Vec<&PartitionSpec> =
            self.specs.iter().filter(|s| s.mount_path.is_some()).collect();
        mounts.sort_by_key(|s| s.mount_depth());
        mounts
    }

    /// Mount path of the ESP, for the bootloader installer.
    pub fn esp_mount_path(&self) -> Option<&Path> {
        self.esp().and_then(|s| s.mount_path.as_deref())
    }

    /// Sum of all partition sizes in MiB.
    pub fn allocated_mib(&self) -> u64 {
        self.specs.iter().map(PartitionSpec::size_mib).sum()
    }

    /// Check the plan's structural invariants.
    pub fn validate(&self) -> Result<()> {
        let count = |role| self.specs.iter().filter(|s| s.role == role).count();

        if count(PartitionRole::Root) != 1 {
            return Err(LnosError::invalid_plan("plan must contain exactly one ROOT"));
        }
        if count(PartitionRole::Swap) > 1 {
            return Err(LnosError::invalid_plan("plan contains more than one SWAP"));
        }
        let has_esp = count(PartitionRole::EfiSystem);
        let has_stub = count(PartitionRole::BiosBoot);
        match self.firmware_mode() {
            FirmwareMode::Uefi if has_esp != 1 || has_stub != 0 => {
                return Err(LnosError::invalid_plan("UEFI plan needs exactly one EFI_SYSTEM and no BIOS_BOOT"));
            }
            FirmwareMode::Bios if has_esp != 0 => {
                return Err(LnosError::invalid_plan("BIOS plan must not contain EFI_SYSTEM"));
            }
            _ => {}
        }
        if has_stub > 0 && (self.table != PartitionTable::Gpt || has_stub > 1) {
            return Err(LnosError::invalid_plan("BIOS_BOOT stub requires a single GPT entry"));
        }

        let mut cursor = LEADING_GAP_MIB;
        for (index, spec) in self.specs.iter().enumerate() {
            let last = index + 1 == self.specs.len();
            if spec.number as usize != index + 1 {
                return Err(LnosError::invalid_plan(format!(
                    "partition {} is numbered {}",
                    index + 1,
                    spec.number
                )));
            }
            if spec.start_mib != cursor || spec.end_mib <= spec.start_mib {
                return Err(LnosError::invalid_plan(format!(
                    "partition {} spans {}-{} MiB, expected to start at {}",
                    spec.number, spec.start_mib, spec.end_mib, cursor
                )));
            }
            if let PartitionSize::Fixed(mib) = spec.size {
                if mib != spec.size_mib() {
                    return Err(LnosError::invalid_plan(format!(
                        "partition {} size {} MiB disagrees with its bounds",
                        spec.number, mib
                    )));
                }
            }
            if spec.size == PartitionSize::Remaining && (spec.role != PartitionRole::Root || !last) {
                return Err(LnosError::invalid_plan("REMAINING is only legal for a trailing ROOT"));
            }
            if spec.encrypted && spec.role != PartitionRole::Root {
                return Err(LnosError::invalid_plan(format!("{} cannot be encrypted", spec.role)));
            }
            match (&spec.mount_path, spec.role.requires_mount()) {
                (None, true) => {
                    return Err(LnosError::invalid_plan(format!("{} needs a mount path", spec.role)));
                }
                (Some(_), false) => {
                    return Err(LnosError::invalid_plan(format!("{} cannot be mounted", spec.role)));
                }
                (Some(path), true) => {
                    let is_root_path = path == Path::new("/");
                    if !path.is_absolute() || is_root_path != (spec.role == PartitionRole::Root) {
                        return Err(LnosError::invalid_plan(format!(
                            "{} has mount path {} (ROOT mounts at /, others beneath it)",
                            spec.role,
                            path.display()
                        )));
                    }
                }
                (None, false) => {}
            }
            cursor = spec.end_mib;
        }

        let capacity = self.observation.capacity_mib();
        if cursor > capacity {
            return Err(LnosError::InsufficientSpace {
                required_mib: cursor,
                available_mib: capacity,
            });
        }

        let mut paths: Vec<&Path> = self.specs.iter().filter_map(|s| s.mount_path.as_deref()).collect();
        paths.sort();
        if paths.windows(2).any(|w| w[0] == w[1]) {
            return Err(LnosError::invalid_plan("two partitions share a mount path"));
        }

        Ok(())
    }

    /// Human-readable table shown before the user confirms.
    pub fn summary(&self) -> String {
        let mut lines = vec![
            format!("Partition Plan for {}", self.disk().display()),
            format!("  Firmware: {}", self.firmware_mode()),
            format!("  Table: {}", self.table),
            format!(
                "  Capacity: {} MiB, RAM: {} MiB",
                self.observation.capacity_mib(),
                self.observation.ram_bytes() / MIB
            ),
        ];
        if self.is_encrypted() {
            lines.push(format!("  Encrypted root: {}", self.mapper_path().display()));
        }
        lines.push(format!("  Partitions ({}):", self.specs.len()));
        lines.push("     #  ROLE          START-END (MiB)       SIZE  FS         MOUNT".to_string());
        for spec in &self.specs {
            lines.push(format!("    {} {}", spec, self.node_path(spec).display()));
        }
        lines.join("\n")
    }
}

/// Calculate the partition plan for an inspected disk.
///
/// # Errors
///
/// - `UnsupportedCombination` if the policy cannot produce a bootable layout
///   on this firmware (unsupported root filesystem, encrypted root with
///   `/boot` inside the container, MBR on a disk larger than 2 TiB)
/// - `InsufficientSpace` if ROOT would be smaller than `min_root_mib`
///
/// # What This Explicitly Refuses To Do
///
/// - Touching the disk: this is pure plan generation. No I/O.
/// - Guessing: no fallback layout is chosen when the requested one is refused.
pub fn plan(observation: &DeviceObservation, policy: &PlanPolicy) -> Result<PartitionPlan> {
    policy.validate()?;

    let table = match (observation.firmware_mode(), policy.bios_table) {
        (FirmwareMode::Uefi, _) | (FirmwareMode::Bios, BiosTable::Gpt) => PartitionTable::Gpt,
        (FirmwareMode::Bios, BiosTable::Mbr) => PartitionTable::Msdos,
    };

    if table == PartitionTable::Msdos && observation.capacity_bytes() > MBR_MAX_BYTES {
        return Err(LnosError::unsupported(format!(
            "MBR cannot address {} MiB; use a GPT table on disks larger than 2 TiB",
            observation.capacity_mib()
        )));
    }

    if policy.encrypted
        && observation.firmware_mode().is_uefi()
        && !policy.uefi_layout.has_plain_boot()
    {
        return Err(LnosError::unsupported(
            "encrypted root with the ESP at /boot/efi puts /boot inside LUKS2, \
             which the bootloader cannot read; choose the esp-at-boot or split-boot layout",
        ));
    }

    let mut layout = Layout::new();

    match observation.firmware_mode() {
        FirmwareMode::Uefi => {
            layout.push(
                PartitionRole::EfiSystem,
                Filesystem::Fat32,
                policy.esp_size_mib,
                Some(policy.uefi_layout.esp_mount()),
            );
            if policy.uefi_layout == UefiLayout::SplitBoot {
                layout.push(PartitionRole::Boot, Filesystem::Ext4, policy.boot_size_mib, Some("/boot"));
            }
        }
        FirmwareMode::Bios => {
            if table == PartitionTable::Gpt {
                layout.push(PartitionRole::BiosBoot, Filesystem::None, BIOS_BOOT_SIZE_MIB, None);
            }
            layout.push(PartitionRole::Boot, Filesystem::Ext4, policy.boot_size_mib, Some("/boot"));
        }
    }

    if observation.ram_bytes() < policy.swap_threshold_bytes {
        layout.push(PartitionRole::Swap, Filesystem::LinuxSwap, policy.swap_size_mib, None);
    }

    let capacity = observation.capacity_mib();
    let root_mib = capacity.saturating_sub(layout.cursor);
    if root_mib < policy.min_root_mib.max(1) {
        return Err(LnosError::InsufficientSpace {
            required_mib: layout.cursor + policy.min_root_mib.max(1),
            available_mib: capacity,
        });
    }
    layout.push_root(policy.root_filesystem, capacity, policy.encrypted);

    let plan = PartitionPlan {
        observation: observation.clone(),
        table,
        specs: layout.specs,
        mapper_name: policy.mapper_name.clone(),
    };
    plan.validate()?;

    log::debug!("Planned {} partitions on {}", plan.specs.len(), plan.disk().display());
    Ok(plan)
}

/// Running cursor that hands out contiguous MiB ranges.
struct Layout {
    cursor: u64,
    specs: Vec<PartitionSpec>,
}

impl Layout {
    fn new() -> Self {
        Self {
            cursor: LEADING_GAP_MIB,
            specs: Vec::new(),
        }
    }

    fn next_number(&self) -> u32 {
        self.specs.len() as u32 + 1
    }

    fn push(&mut self, role: PartitionRole, filesystem: Filesystem, size_mib: u64, mount: Option<&str>) {
        let start = self.cursor;
        self.cursor += size_mib;
        self.specs.push(PartitionSpec {
            number: self.next_number(),
            role,
            filesystem,
            size: PartitionSize::Fixed(size_mib),
            start_mib: start,
            end_mib: self.cursor,
            mount_path: mount.map(PathBuf::from),
            encrypted: false,
        });
    }

    fn push_root(&mut self, filesystem: Filesystem, capacity_mib: u64, encrypted: bool) {
        let start = self.cursor;
        self.cursor = capacity_mib;
        self.specs.push(PartitionSpec {
            number: self.next_number(),
            role: PartitionRole::Root,
            filesystem,
            size: PartitionSize::Remaining,
            start_mib: start,
            end_mib: capacity_mib,
            mount_path: Some(PathBuf::from("/")),
            encrypted,
        });
    }
}
