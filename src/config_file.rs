//! Configuration file handling for saving and loading install configs.
//!
//! Every field has a serde default, so a file containing only `device` is a
//! complete configuration. CLI flags are applied on top after loading.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::engine::executor::NodePoll;
use crate::engine::planner::{is_valid_mapper_name, PlanPolicy, GIB};
use crate::types::{BiosTable, Filesystem, UefiLayout};

/// Disk layout configuration that can be saved/loaded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct InstallConfig {
    /// Whole-disk path like /dev/sda
    pub device: String,
    pub root_filesystem: Filesystem,
    pub encrypted: bool,
    pub bios_table: BiosTable,
    pub uefi_layout: UefiLayout,

    // Sizes
    pub swap_threshold_gib: u64,
    pub swap_size_mib: u64,
    pub esp_size_mib: u64,
    pub boot_size_mib: u64,
    pub min_root_mib: u64,

    // Execution
    pub staging_root: PathBuf,
    pub mapper_name: String,
    pub poll_interval_ms: u64,
    pub poll_timeout_ms: u64,
}

impl Default for InstallConfig {
    fn default() -> Self {
        let policy = PlanPolicy::default();
        let poll = NodePoll::default();
        Self {
            device: String::new(),
            root_filesystem: policy.root_filesystem,
            encrypted: policy.encrypted,
            bios_table: policy.bios_table,
            uefi_layout: policy.uefi_layout,
            swap_threshold_gib: policy.swap_threshold_bytes / GIB,
            swap_size_mib: policy.swap_size_mib,
            esp_size_mib: policy.esp_size_mib,
            boot_size_mib: policy.boot_size_mib,
            min_root_mib: policy.min_root_mib,
            staging_root: PathBuf::from("/mnt"),
            mapper_name: policy.mapper_name,
            poll_interval_ms: poll.interval.as_millis() as u64,
            poll_timeout_ms: poll.timeout.as_millis() as u64,
        }
    }
}

impl InstallConfig {
    /// Save configuration to a JSON file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .context("Failed to serialize configuration to JSON")?;

        fs::write(&path, json)
            .with_context(|| format!("Failed to write configuration to {:?}", path.as_ref()))?;

        Ok(())
    }

    /// Load configuration from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read configuration from {:?}", path.as_ref()))?;

        let config: Self =
            serde_json::from_str(&content).context("Failed to parse configuration JSON")?;

        Ok(config)
    }

    /// Validate everything except the device, which `inspect` and `plan`
    /// may take from the command line instead.
    pub fn validate_policy(&self) -> Result<()> {
        if !self.staging_root.is_absolute() {
            anyhow::bail!(
                "Staging root must be an absolute path, got {:?}",
                self.staging_root
            );
        }

        for (name, value) in [
            ("swap_threshold_gib", self.swap_threshold_gib),
            ("swap_size_mib", self.swap_size_mib),
            ("esp_size_mib", self.esp_size_mib),
            ("boot_size_mib", self.boot_size_mib),
            ("min_root_mib", self.min_root_mib),
            ("poll_interval_ms", self.poll_interval_ms),
            ("poll_timeout_ms", self.poll_timeout_ms),
        ] {
            if value == 0 {
                anyhow::bail!("{} must be greater than zero", name);
            }
        }

        if !is_valid_mapper_name(&self.mapper_name) {
            anyhow::bail!(
                "Mapper name '{}' must be 1-127 characters of [A-Za-z0-9._-]",
                self.mapper_name
            );
        }

        if self.poll_interval_ms > self.poll_timeout_ms {
            anyhow::bail!(
                "poll_interval_ms ({}) must not exceed poll_timeout_ms ({})",
                self.poll_interval_ms,
                self.poll_timeout_ms
            );
        }

        self.policy()
            .validate()
            .context("Configuration describes an unsupported layout")?;

        Ok(())
    }

    /// Validate the configuration, device included
    pub fn validate(&self) -> Result<()> {
        let device = self.device.trim();
        if device.is_empty() {
            anyhow::bail!("Install device must be specified");
        }
        if !device.starts_with("/dev/") {
            anyhow::bail!("Install device must be a path under /dev/, got '{}'", device);
        }
        self.validate_policy()
    }

    /// Planner policy described by this configuration.
    pub fn policy(&self) -> PlanPolicy {
        PlanPolicy {
            root_filesystem: self.root_filesystem,
            encrypted: self.encrypted,
            bios_table: self.bios_table,
            uefi_layout: self.uefi_layout,
            swap_threshold_bytes: self.swap_threshold_gib.saturating_mul(GIB),
            swap_size_mib: self.swap_size_mib,
            esp_size_mib: self.esp_size_mib,
            boot_size_mib: self.boot_size_mib,
            min_root_mib: self.min_root_mib,
            mapper_name: self.mapper_name.clone(),
        }
    }

    pub fn node_poll(&self) -> NodePoll {
        NodePoll {
            interval: Duration::from_millis(self.poll_interval_ms),
            timeout: Duration::from_millis(self.poll_timeout_ms),
        }
    }

    pub fn device_path(&self) -> PathBuf {
        PathBuf::from(self.device.trim())
    }
}
