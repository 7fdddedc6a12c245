use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

use crate::config_file::InstallConfig;
use crate::types::{BiosTable, Filesystem, UefiLayout};

/// LnOS disk engine - plan, partition, format and mount a target disk
#[derive(Parser)]
#[command(name = "lnos")]
#[command(about = "Partition, format and mount a disk for an LnOS install")]
#[command(version)]
pub struct Cli {
    /// Dry-run mode: print every command instead of running it.
    ///
    /// The device is still inspected and busy checks still read the real
    /// mount table, so the preview matches what a real run would do.
    #[arg(long, global = true)]
    pub dry_run: bool,

    /// Configuration file; flags given on the command line take precedence
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Report firmware mode, bus, RAM and capacity for a disk
    Inspect {
        /// Whole-disk device (e.g., /dev/sda); defaults to the config's device
        device: Option<PathBuf>,
        /// Print the observation as JSON
        #[arg(long)]
        json: bool,
    },
    /// Compute and print the partition plan without touching the disk
    Plan {
        device: Option<PathBuf>,
        #[command(flatten)]
        policy: PolicyArgs,
        /// Print the plan as JSON
        #[arg(long)]
        json: bool,
    },
    /// Wipe, partition, format and mount the disk under the staging root
    Install {
        device: Option<PathBuf>,
        #[command(flatten)]
        policy: PolicyArgs,
        /// Skip the interactive prompt; must repeat the device path exactly
        #[arg(long, value_name = "DEVICE")]
        confirm: Option<PathBuf>,
        /// Leave the tree mounted for later install stages (requires --state)
        #[arg(long, requires = "state")]
        keep_mounted: bool,
        /// Where to record the mount tree for a later `lnos unwind`
        #[arg(long)]
        state: Option<PathBuf>,
        /// File holding the LUKS passphrase (otherwise LNOS_PASSPHRASE)
        #[arg(long)]
        passphrase_file: Option<PathBuf>,
    },
    /// Release a mount tree recorded by `install --keep-mounted`
    Unwind {
        #[arg(long)]
        state: PathBuf,
    },
    /// Validate a configuration file
    Validate {
        /// Path to configuration file to validate
        #[arg(value_name = "CONFIG")]
        file: PathBuf,
    },
}

/// Layout flags shared by `plan` and `install`
#[derive(Args, Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicyArgs {
    /// Root filesystem (ext4 or btrfs)
    #[arg(long)]
    pub root_fs: Option<Filesystem>,
    /// Put ROOT inside a LUKS2 container
    #[arg(long)]
    pub encrypt: bool,
    /// Partition table on BIOS machines (gpt or mbr)
    #[arg(long)]
    pub bios_table: Option<BiosTable>,
    /// ESP placement on UEFI machines (esp-at-boot-efi, esp-at-boot, split-boot)
    #[arg(long)]
    pub uefi_layout: Option<UefiLayout>,
    #[arg(long)]
    pub swap_size_mib: Option<u64>,
    #[arg(long)]
    pub min_root_mib: Option<u64>,
    /// Directory the target tree is mounted under
    #[arg(long)]
    pub staging_root: Option<PathBuf>,
    /// Name under /dev/mapper for the opened root container
    #[arg(long)]
    pub mapper_name: Option<String>,
}

impl PolicyArgs {
    /// Overlay the flags that were given onto `config`.
    pub fn apply(&self, config: &mut InstallConfig) {
        if let Some(fs) = self.root_fs {
            config.root_filesystem = fs;
        }
        if self.encrypt {
            config.encrypted = true;
        }
        if let Some(table) = self.bios_table {
            config.bios_table = table;
        }
        if let Some(layout) = self.uefi_layout {
            config.uefi_layout = layout;
        }
        if let Some(mib) = self.swap_size_mib {
            config.swap_size_mib = mib;
        }
        if let Some(mib) = self.min_root_mib {
            config.min_root_mib = mib;
        }
        if let Some(root) = &self.staging_root {
            config.staging_root = root.clone();
        }
        if let Some(name) = &self.mapper_name {
            config.mapper_name = name.clone();
        }
    }
}

impl Cli {
    pub fn parse_args() -> Self {
        <Self as clap::Parser>::parse()
    }
}

/// Gate in front of a destructive install.
///
/// `node` is the kernel node the plan will wipe and `requested` the path the
/// user gave, which may be a `/dev/disk/by-id` alias of it. `--confirm` or the
/// typed answer must name one of the two.
pub fn confirm_device(
    requested: &Path,
    node: &Path,
    confirm: Option<&Path>,
    input: &mut impl BufRead,
    prompt: &mut impl Write,
) -> Result<()> {
    let names_disk = |answer: &Path| answer == node || answer == requested;

    if let Some(confirm) = confirm {
        if names_disk(confirm) {
            return Ok(());
        }
        bail!(
            "--confirm {} does not match {}; nothing was changed",
            confirm.display(),
            node.display()
        );
    }

    if requested == node {
        write!(prompt, "ALL DATA ON {} WILL BE DESTROYED. ", node.display())?;
    } else {
        write!(
            prompt,
            "ALL DATA ON {} ({}) WILL BE DESTROYED. ",
            node.display(),
            requested.display()
        )?;
    }
    write!(prompt, "Type the device path to continue: ")?;
    prompt.flush()?;

    let mut line = String::new();
    input
        .read_line(&mut line)
        .context("Failed to read confirmation")?;

    if names_disk(Path::new(line.trim())) {
        Ok(())
    } else {
        bail!("Confirmation did not match {}; nothing was changed", node.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_cli_requires_subcommand() {
        assert!(Cli::try_parse_from(["lnos"]).is_err());
    }

    #[test]
    fn test_cli_inspect_json() {
        let cli = Cli::try_parse_from(["lnos", "inspect", "/dev/sda", "--json"]).unwrap();
        match cli.command {
            Commands::Inspect { device, json } => {
                assert_eq!(device, Some(PathBuf::from("/dev/sda")));
                assert!(json);
            }
            _ => panic!("Expected Inspect command"),
        }
    }

    #[test]
    fn test_cli_plan_with_policy_flags() {
        let cli = Cli::try_parse_from([
            "lnos",
            "plan",
            "/dev/nvme0n1",
            "--root-fs",
            "ext4",
            "--encrypt",
            "--uefi-layout",
            "split-boot",
            "--bios-table",
            "mbr",
        ])
        .unwrap();
        match cli.command {
            Commands::Plan { policy, json, .. } => {
                assert!(!json);
                assert_eq!(policy.root_fs, Some(Filesystem::Ext4));
                assert!(policy.encrypt);
                assert_eq!(policy.uefi_layout, Some(UefiLayout::SplitBoot));
                assert_eq!(policy.bios_table, Some(BiosTable::Mbr));
            }
            _ => panic!("Expected Plan command"),
        }
    }

    #[test]
    fn test_cli_rejects_unknown_filesystem() {
        let result = Cli::try_parse_from(["lnos", "plan", "/dev/sda", "--root-fs", "zfs"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_cli_install_with_global_flags() {
        let cli = Cli::try_parse_from([
            "lnos",
            "install",
            "/dev/sda",
            "--confirm",
            "/dev/sda",
            "--dry-run",
            "--config",
            "/etc/lnos.json",
        ])
        .unwrap();
        assert!(cli.dry_run);
        assert_eq!(cli.config, Some(PathBuf::from("/etc/lnos.json")));
        match cli.command {
            Commands::Install {
                confirm,
                keep_mounted,
                ..
            } => {
                assert_eq!(confirm, Some(PathBuf::from("/dev/sda")));
                assert!(!keep_mounted);
            }
            _ => panic!("Expected Install command"),
        }
    }

    #[test]
    fn test_cli_keep_mounted_requires_state() {
        let result = Cli::try_parse_from(["lnos", "install", "/dev/sda", "--keep-mounted"]);
        assert!(result.is_err());

        let result = Cli::try_parse_from([
            "lnos",
            "install",
            "/dev/sda",
            "--keep-mounted",
            "--state",
            "/run/lnos.json",
        ]);
        assert!(result.is_ok());
    }

    #[test]
    fn test_cli_unwind_and_validate() {
        let cli = Cli::try_parse_from(["lnos", "unwind", "--state", "/run/lnos.json"]).unwrap();
        assert!(matches!(cli.command, Commands::Unwind { .. }));

        let cli = Cli::try_parse_from(["lnos", "validate", "/path/to/config.json"]).unwrap();
        match cli.command {
            Commands::Validate { file } => {
                assert_eq!(file, PathBuf::from("/path/to/config.json"));
            }
            _ => panic!("Expected Validate command"),
        }
    }

    #[test]
    fn test_confirm_flag_accepts_node_or_alias() {
        let alias = Path::new("/dev/disk/by-id/ata-TEST");
        let node = Path::new("/dev/sda");
        let mut prompt = Vec::new();

        for answer in [alias, node] {
            confirm_device(alias, node, Some(answer), &mut std::io::empty(), &mut prompt)
                .unwrap();
        }
        assert!(prompt.is_empty());

        let err = confirm_device(
            alias,
            node,
            Some(Path::new("/dev/sdb")),
            &mut std::io::empty(),
            &mut prompt,
        )
        .unwrap_err();
        assert!(err.to_string().contains("nothing was changed"));
    }

    #[test]
    fn test_confirm_prompt_names_the_node_to_be_wiped() {
        let alias = Path::new("/dev/disk/by-id/ata-TEST");
        let node = Path::new("/dev/sda");
        let mut prompt = Vec::new();

        let mut answer = std::io::Cursor::new("/dev/sda\n");
        confirm_device(alias, node, None, &mut answer, &mut prompt).unwrap();

        let shown = String::from_utf8(prompt).unwrap();
        assert!(shown.starts_with("ALL DATA ON /dev/sda (/dev/disk/by-id/ata-TEST)"));
    }

    #[test]
    fn test_confirm_rejects_wrong_or_empty_answer() {
        let node = Path::new("/dev/nvme0n1");
        let mut prompt = Vec::new();

        let mut wrong = std::io::Cursor::new("/dev/nvme0n11\n");
        assert!(confirm_device(node, node, None, &mut wrong, &mut prompt).is_err());

        let mut empty = std::io::Cursor::new("");
        assert!(confirm_device(node, node, None, &mut empty, &mut prompt).is_err());
    }

    #[test]
    fn test_policy_args_override_config() {
        let mut config = InstallConfig {
            swap_size_mib: 2048,
            min_root_mib: 4096,
            ..InstallConfig::default()
        };
        let args = PolicyArgs {
            root_fs: Some(Filesystem::Ext4),
            swap_size_mib: Some(1024),
            ..PolicyArgs::default()
        };
        args.apply(&mut config);

        assert_eq!(config.root_filesystem, Filesystem::Ext4);
        assert_eq!(config.swap_size_mib, 1024);
        // Absent flags keep the config value
        assert_eq!(config.min_root_mib, 4096);
        assert!(!config.encrypted);
    }
}
