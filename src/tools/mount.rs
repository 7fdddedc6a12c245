//! Type-safe arguments for mount, swap and btrfs subvolume tools.

use std::path::PathBuf;

use crate::tool_traits::ToolArgs;

/// `mount [-o <options>] <device> <target>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountArgs {
    pub device: PathBuf,
    pub target: PathBuf,
    pub options: Option<String>,
}

impl ToolArgs for MountArgs {
    fn program(&self) -> &'static str {
        "mount"
    }

    fn to_cli_args(&self) -> Vec<String> {
        let mut args = Vec::with_capacity(4);
        if let Some(ref options) = self.options {
            args.push("-o".to_string());
            args.push(options.clone());
        }
        args.push(self.device.display().to_string());
        args.push(self.target.display().to_string());
        args
    }

    fn step(&self) -> &'static str {
        "mount"
    }
}

/// `umount <target>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UmountArgs {
    pub target: PathBuf,
}

impl ToolArgs for UmountArgs {
    fn program(&self) -> &'static str {
        "umount"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec![self.target.display().to_string()]
    }

    fn step(&self) -> &'static str {
        "unmount"
    }
}

/// `swapon <device>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwaponArgs {
    pub device: PathBuf,
}

impl ToolArgs for SwaponArgs {
    fn program(&self) -> &'static str {
        "swapon"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec![self.device.display().to_string()]
    }

    fn step(&self) -> &'static str {
        "swap"
    }
}

/// `swapoff <device>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapoffArgs {
    pub device: PathBuf,
}

impl ToolArgs for SwapoffArgs {
    fn program(&self) -> &'static str {
        "swapoff"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec![self.device.display().to_string()]
    }

    fn step(&self) -> &'static str {
        "swapoff"
    }
}

/// `btrfs subvolume create <path>`
///
/// Run against a temporary mount of the freshly created btrfs root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BtrfsSubvolumeCreateArgs {
    pub path: PathBuf,
}

impl ToolArgs for BtrfsSubvolumeCreateArgs {
    fn program(&self) -> &'static str {
        "btrfs"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec![
            "subvolume".to_string(),
            "create".to_string(),
            self.path.display().to_string(),
        ]
    }

    fn step(&self) -> &'static str {
        "format"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mount_with_and_without_options() {
        let plain = MountArgs {
            device: PathBuf::from("/dev/sda2"),
            target: PathBuf::from("/mnt/boot"),
            options: None,
        };
        assert_eq!(plain.command_line(), "mount /dev/sda2 /mnt/boot");

        let btrfs = MountArgs {
            device: PathBuf::from("/dev/sda3"),
            target: PathBuf::from("/mnt"),
            options: Some("subvol=@,compress=zstd,noatime".to_string()),
        };
        assert_eq!(
            btrfs.to_cli_args(),
            vec!["-o", "subvol=@,compress=zstd,noatime", "/dev/sda3", "/mnt"]
        );
    }

    #[test]
    fn test_release_tools_have_their_own_steps() {
        let umount = UmountArgs {
            target: PathBuf::from("/mnt/boot/efi"),
        };
        let swapoff = SwapoffArgs {
            device: PathBuf::from("/dev/sda2"),
        };
        assert_eq!(umount.command_line(), "umount /mnt/boot/efi");
        assert_eq!(umount.step(), "unmount");
        assert_eq!(swapoff.step(), "swapoff");
        assert!(!umount.is_destructive());
    }

    #[test]
    fn test_subvolume_create() {
        let args = BtrfsSubvolumeCreateArgs {
            path: PathBuf::from("/mnt/@"),
        };
        assert_eq!(args.command_line(), "btrfs subvolume create /mnt/@");
    }
}
