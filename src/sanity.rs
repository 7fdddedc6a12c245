//! Pre-flight sanity checks for runtime environment
//!
//! Before a real install the binary verifies:
//! - Every tool the plan will invoke is on `PATH`
//! - The process runs with root privileges (EUID 0)
//!
//! Dry runs skip these checks since nothing is executed.

use std::fmt::Write as _;
use std::process::Command;

use crate::engine::planner::PlanPolicy;
use crate::process_guard::CommandProcessGroup;
use crate::types::Filesystem;

/// Environment variable that skips the root check (development only)
pub const SKIP_ROOT_ENV: &str = "LNOS_SKIP_ROOT_CHECK";

/// Result of environment verification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SanityCheckResult {
    pub missing_binaries: Vec<String>,
    pub is_root: bool,
}

impl SanityCheckResult {
    pub fn is_ok(&self) -> bool {
        self.missing_binaries.is_empty() && self.is_root
    }

    /// Multi-line report with install hints, for stderr.
    pub fn report(&self) -> String {
        let mut out = String::from("LnOS pre-flight check failed\n\n");

        if !self.is_root {
            out.push_str("ERROR: Root privileges required\n");
            out.push_str("   Partitioning and mounting need root. Run with sudo or as root.\n\n");
        }

        if !self.missing_binaries.is_empty() {
            out.push_str("ERROR: Missing required binaries\n");
            for binary in &self.missing_binaries {
                let _ = writeln!(
                    out,
                    "   - {} (install: pacman -S {})",
                    binary,
                    get_package_for_binary(binary)
                );
            }
            let mut packages: Vec<&str> = self
                .missing_binaries
                .iter()
                .map(|b| get_package_for_binary(b))
                .collect();
            packages.sort_unstable();
            packages.dedup();
            let _ = writeln!(out, "\n   Solution: pacman -S {}", packages.join(" "));
        }
        out
    }
}

/// Binaries every install needs
const BASE_BINARIES: &[&str] = &[
    "wipefs",
    "parted",
    "partprobe",
    "mkfs.fat",
    "mkfs.ext4",
    "mkswap",
    "mount",
    "umount",
    "swapon",
    "swapoff",
];

/// Binaries the executor will invoke for `policy`.
pub fn required_binaries(policy: &PlanPolicy) -> Vec<&'static str> {
    let mut binaries = BASE_BINARIES.to_vec();
    if policy.root_filesystem == Filesystem::Btrfs {
        binaries.extend(["mkfs.btrfs", "btrfs"]);
    }
    if policy.encrypted {
        binaries.push("cryptsetup");
    }
    binaries
}

fn binary_exists(name: &str) -> bool {
    Command::new("which")
        .arg(name)
        .in_new_process_group()
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

fn is_running_as_root() -> bool {
    nix::unistd::geteuid().is_root()
}

/// Check `binaries` and root privileges.
pub fn verify_environment(binaries: &[&str]) -> SanityCheckResult {
    let missing_binaries = binaries
        .iter()
        .filter(|binary| !binary_exists(binary))
        .map(|binary| binary.to_string())
        .collect();

    SanityCheckResult {
        missing_binaries,
        is_root: is_running_as_root(),
    }
}

/// Map binary names to their Arch Linux package names
fn get_package_for_binary(binary: &str) -> &'static str {
    match binary {
        "parted" | "partprobe" => "parted",
        "mkfs.fat" => "dosfstools",
        "mkfs.ext4" => "e2fsprogs",
        "mkfs.btrfs" | "btrfs" => "btrfs-progs",
        "cryptsetup" => "cryptsetup",
        "wipefs" | "mkswap" | "mount" | "umount" | "swapon" | "swapoff" => "util-linux",
        _ => "unknown",
    }
}

/// Set LNOS_SKIP_ROOT_CHECK=1 to skip
pub fn should_skip_root_check() -> bool {
    std::env::var(SKIP_ROOT_ENV)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Run all pre-flight checks for `policy`.
pub fn run_preflight_checks(policy: &PlanPolicy) -> SanityCheckResult {
    log::debug!("Running pre-flight sanity checks...");
    let mut result = verify_environment(&required_binaries(policy));

    if should_skip_root_check() {
        log::warn!("Root check skipped ({}=1)", SKIP_ROOT_ENV);
        result.is_root = true;
    }

    if result.is_ok() {
        log::info!("Pre-flight checks passed");
    }
    result
}
