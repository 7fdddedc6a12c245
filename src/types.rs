//! Type-safe configuration types for the disk engine
//!
//! Every user-facing choice is an enum so the planner can match exhaustively
//! and config files fail to parse on typos instead of at partition time.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

/// Filesystem written onto a partition (or onto its LUKS mapping)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "kebab-case")]
#[strum(ascii_case_insensitive)]
pub enum Filesystem {
    /// FAT32 for the EFI System Partition
    #[strum(serialize = "fat32")]
    Fat32,
    #[strum(serialize = "ext4")]
    Ext4,
    #[strum(serialize = "btrfs")]
    Btrfs,
    /// Swap signature (mkswap), not a mountable filesystem
    #[strum(serialize = "linux-swap")]
    LinuxSwap,
    /// Left unformatted (bios_grub stub)
    #[strum(serialize = "none")]
    None,
}

impl Filesystem {
    /// Filesystems the planner accepts for the root partition.
    pub fn is_root_capable(self) -> bool {
        matches!(self, Self::Ext4 | Self::Btrfs)
    }

    /// The `fs-type` hint parted records in the partition entry, if any.
    pub fn parted_fs_type(self) -> Option<&'static str> {
        match self {
            Self::Fat32 => Some("fat32"),
            Self::Ext4 => Some("ext4"),
            Self::Btrfs => Some("btrfs"),
            Self::LinuxSwap => Some("linux-swap"),
            Self::None => None,
        }
    }
}

/// What a partition is for. Determines flags, formatting and mount order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum PartitionRole {
    EfiSystem,
    BiosBoot,
    Boot,
    Swap,
    Root,
}

impl PartitionRole {
    /// GPT partition name written by `parted mkpart`.
    pub fn gpt_name(self) -> &'static str {
        match self {
            Self::EfiSystem => "EFI",
            Self::BiosBoot => "BIOSBOOT",
            Self::Boot => "boot",
            Self::Swap => "swap",
            Self::Root => "root",
        }
    }

    /// Filesystem label written by the formatter.
    pub fn fs_label(self) -> &'static str {
        match self {
            Self::EfiSystem => "EFI",
            Self::BiosBoot => "",
            Self::Boot => "boot",
            Self::Swap => "swap",
            Self::Root => "lnosroot",
        }
    }

    /// Roles that must carry a mount path in a valid plan.
    pub fn requires_mount(self) -> bool {
        matches!(self, Self::EfiSystem | Self::Boot | Self::Root)
    }
}

/// On-disk partition table format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "lowercase")]
pub enum PartitionTable {
    #[strum(serialize = "gpt")]
    Gpt,
    /// Legacy DOS/MBR table (`msdos` in parted terms)
    #[strum(serialize = "msdos")]
    Msdos,
}

impl PartitionTable {
    /// Label name understood by `parted mklabel`.
    pub fn parted_label(self) -> &'static str {
        match self {
            Self::Gpt => "gpt",
            Self::Msdos => "msdos",
        }
    }
}

/// Partition table scheme used when the machine boots in legacy BIOS mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "lowercase")]
#[strum(ascii_case_insensitive)]
pub enum BiosTable {
    /// GPT with a 1 MiB bios_grub stub for GRUB's core image
    #[default]
    #[strum(serialize = "gpt")]
    Gpt,
    /// MBR with the boot flag on the first partition
    #[strum(serialize = "mbr")]
    Mbr,
}

/// Where the ESP is mounted on UEFI machines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "kebab-case")]
#[strum(ascii_case_insensitive)]
pub enum UefiLayout {
    /// ESP at `/boot/efi`; `/boot` lives on the root filesystem
    #[default]
    #[strum(serialize = "esp-at-boot-efi")]
    EspAtBootEfi,
    /// ESP mounted directly at `/boot`; kernels live on the ESP
    #[strum(serialize = "esp-at-boot")]
    EspAtBoot,
    /// ESP at `/boot/efi` plus a separate ext4 partition at `/boot`
    #[strum(serialize = "split-boot")]
    SplitBoot,
}

impl UefiLayout {
    /// Mount path of the ESP relative to the staging root.
    pub fn esp_mount(self) -> &'static str {
        match self {
            Self::EspAtBoot => "/boot",
            Self::EspAtBootEfi | Self::SplitBoot => "/boot/efi",
        }
    }

    /// Returns true if `/boot` is on an unencrypted partition in this layout.
    pub fn has_plain_boot(self) -> bool {
        matches!(self, Self::EspAtBoot | Self::SplitBoot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use strum::IntoEnumIterator;

    #[test]
    fn test_filesystem_parse_is_case_insensitive() {
        assert_eq!(Filesystem::from_str("BTRFS").expect("parse"), Filesystem::Btrfs);
        assert_eq!(Filesystem::from_str("ext4").expect("parse"), Filesystem::Ext4);
        assert!(Filesystem::from_str("xfs").is_err());
    }

    #[test]
    fn test_only_ext4_and_btrfs_are_root_capable() {
        let capable: Vec<Filesystem> = Filesystem::iter().filter(|f| f.is_root_capable()).collect();
        assert_eq!(capable, vec![Filesystem::Ext4, Filesystem::Btrfs]);
    }

    #[test]
    fn test_role_display_matches_serde() {
        for role in PartitionRole::iter() {
            let json = serde_json::to_string(&role).expect("serialize");
            assert_eq!(json, format!("\"{}\"", role));
        }
    }

    #[test]
    fn test_uefi_layout_esp_mounts() {
        assert_eq!(UefiLayout::EspAtBootEfi.esp_mount(), "/boot/efi");
        assert_eq!(UefiLayout::EspAtBoot.esp_mount(), "/boot");
        assert_eq!(UefiLayout::SplitBoot.esp_mount(), "/boot/efi");
        assert!(!UefiLayout::EspAtBootEfi.has_plain_boot());
    }

    #[test]
    fn test_bios_table_serde_matches_strum() {
        for table in BiosTable::iter() {
            let json = serde_json::to_string(&table).expect("serialize");
            assert_eq!(json, format!("\"{}\"", table));
        }
    }
}
