//! Executor integration tests against a recording host.
//!
//! These cover the failure paths: what has been released, what has not,
//! and which commands were never issued.

mod common;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{uefi_plan, RecordingHost, DISK, STAGING};
use lnos::engine::executor::{NodePoll, PlanExecutor};
use lnos::engine::planner::{plan, PlanPolicy, GIB};
use lnos::engine::stage::ExecStage;
use lnos::engine::unwind::{unwind, Acquired, MountTree};
use lnos::error::LnosError;
use lnos::hardware::{ActiveMount, BlockHolder, DeviceObservation, FirmwareMode};
use lnos::tools::encryption::Passphrase;
use lnos::types::UefiLayout;
use tempfile::TempDir;

fn executor(host: RecordingHost) -> PlanExecutor<RecordingHost> {
    PlanExecutor::new(host)
        .with_staging_root(STAGING)
        .with_poll(NodePoll {
            interval: Duration::from_millis(1),
            timeout: Duration::from_millis(20),
        })
}

fn encrypted_policy() -> PlanPolicy {
    PlanPolicy {
        encrypted: true,
        uefi_layout: UefiLayout::SplitBoot,
        ..PlanPolicy::default()
    }
}

fn live_len(executor: &PlanExecutor<RecordingHost>) -> usize {
    executor.live_tree().lock().unwrap().len()
}

// =============================================================================
// Failure before anything is mounted
// =============================================================================

#[test]
fn format_failure_reports_step_and_leaves_nothing_held() {
    let plan = uefi_plan(&PlanPolicy::default());
    let mut executor = executor(RecordingHost::failing_on("mkfs.btrfs"));

    let err = executor.execute(&plan, Path::new(DISK)).unwrap_err();

    match &err {
        LnosError::ToolFailure {
            step,
            exit_code,
            stderr,
        } => {
            assert_eq!(step, "format");
            assert_eq!(*exit_code, 1);
            assert_eq!(stderr, "simulated failure");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(err.failed_step(), Some("format"));
    assert_eq!(executor.last_stage(), ExecStage::PartitionsCreated);
    assert_eq!(live_len(&executor), 0);

    let host = executor.host();
    assert!(host.commands_of("umount").is_empty());
    assert!(host.commands_of("mount").is_empty());
    // ESP and swap were formatted before ROOT failed
    assert_eq!(host.commands_of("mkfs.fat").len(), 1);
    assert_eq!(host.commands_of("mkswap").len(), 1);
}

#[test]
fn partition_nodes_that_never_appear_stop_before_formatting() {
    let plan = uefi_plan(&PlanPolicy::default());
    let host = RecordingHost {
        nodes_missing: true,
        ..RecordingHost::new()
    };
    let mut executor = executor(host);

    let err = executor.execute(&plan, Path::new(DISK)).unwrap_err();

    match err {
        LnosError::PartitionNodesNotReady { missing, waited } => {
            assert_eq!(
                missing,
                vec![
                    PathBuf::from("/dev/lnos-test-sda1"),
                    PathBuf::from("/dev/lnos-test-sda2"),
                    PathBuf::from("/dev/lnos-test-sda3"),
                ]
            );
            assert!(waited >= Duration::from_millis(20));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(executor.last_stage(), ExecStage::TableCreated);
    let host = executor.host();
    assert_eq!(host.commands_of("partprobe"), vec!["partprobe /dev/lnos-test-sda"]);
    assert!(host.commands.iter().all(|c| !c.starts_with("mkfs")));
    assert!(host.commands_of("mkswap").is_empty());
}

#[test]
fn luks_open_failure_does_not_close_an_unopened_mapping() {
    let plan = uefi_plan(&encrypted_policy());
    let keys = TempDir::new().unwrap();
    let mut executor = executor(RecordingHost::failing_on("cryptsetup open"))
        .with_keyfile_dir(keys.path())
        .with_passphrase(Passphrase::new("correct horse").unwrap());

    let err = executor.execute(&plan, Path::new(DISK)).unwrap_err();

    assert_eq!(err.failed_step(), Some("luks-open"));
    assert_eq!(live_len(&executor), 0);
    assert!(executor.host().position("cryptsetup close cryptroot").is_none());
    assert_eq!(std::fs::read_dir(keys.path()).unwrap().count(), 0);
}

// =============================================================================
// Failure after mounts
// =============================================================================

#[test]
fn swapon_failure_unmounts_in_reverse_order() {
    let plan = uefi_plan(&PlanPolicy::default());
    let mut executor = executor(RecordingHost::failing_on("swapon"));

    let err = executor.execute(&plan, Path::new(DISK)).unwrap_err();

    assert_eq!(err.failed_step(), Some("swap"));
    assert_eq!(executor.last_stage(), ExecStage::Formatted);
    assert_eq!(live_len(&executor), 0);

    let commands = &executor.host().commands;
    let tail: Vec<&str> = commands[commands.len() - 3..]
        .iter()
        .map(String::as_str)
        .collect();
    assert_eq!(
        tail,
        vec![
            "swapon /dev/lnos-test-sda2",
            "umount /lnos-test-root/boot/efi",
            "umount /lnos-test-root",
        ]
    );
    assert!(executor.host().commands_of("swapoff").is_empty());
}

#[test]
fn encrypted_failure_after_mount_closes_mapping_last() {
    let plan = uefi_plan(&encrypted_policy());
    let keys = TempDir::new().unwrap();
    let mut executor = executor(RecordingHost::failing_on("mount -o fmask"))
        .with_keyfile_dir(keys.path())
        .with_passphrase(Passphrase::new("correct horse").unwrap());

    let err = executor.execute(&plan, Path::new(DISK)).unwrap_err();

    assert_eq!(err.failed_step(), Some("mount"));
    assert_eq!(executor.last_stage(), ExecStage::LuksOpened);
    let commands = &executor.host().commands;
    assert_eq!(
        commands.last().map(String::as_str),
        Some("cryptsetup close cryptroot")
    );
    let boot = executor.host().position("umount /lnos-test-root/boot").unwrap();
    let root = commands.iter().rposition(|c| c == "umount /lnos-test-root").unwrap();
    assert!(boot < root);
}

// =============================================================================
// Encrypted happy path
// =============================================================================

#[test]
fn encrypted_install_formats_mapper_and_releases_crypt_last() {
    let plan = uefi_plan(&encrypted_policy());
    let keys = TempDir::new().unwrap();
    let mut executor = executor(RecordingHost::new())
        .with_keyfile_dir(keys.path())
        .with_passphrase(Passphrase::new("correct horse").unwrap());

    let tree = executor.execute(&plan, Path::new(DISK)).unwrap();

    assert_eq!(executor.last_stage(), ExecStage::Mounted);
    assert_eq!(
        tree.entries()[0],
        Acquired::Crypt {
            device: PathBuf::from("/dev/lnos-test-sda4"),
            mapper_name: "cryptroot".to_string(),
        }
    );
    assert_eq!(
        tree.mount_targets(),
        vec![
            Path::new(STAGING),
            Path::new("/lnos-test-root/boot"),
            Path::new("/lnos-test-root/boot/efi"),
        ]
    );

    let host = executor.host();
    let format = host
        .commands
        .iter()
        .position(|c| c.starts_with("cryptsetup luksFormat --type luks2 --batch-mode"))
        .unwrap();
    let open = host
        .commands
        .iter()
        .position(|c| c.starts_with("cryptsetup open"))
        .unwrap();
    let mkfs = host.position("mkfs.btrfs -f -L lnosroot /dev/mapper/cryptroot").unwrap();
    assert!(format < open && open < mkfs);
    assert!(host
        .position("mount -o subvol=@,compress=zstd,noatime /dev/mapper/cryptroot /lnos-test-root")
        .is_some());
    // Keyfile only lives for the LUKS calls
    assert_eq!(std::fs::read_dir(keys.path()).unwrap().count(), 0);

    let before = executor.host().commands.len();
    let report = executor.release();
    assert!(report.is_clean());
    assert_eq!(report.released.len(), 5);
    assert_eq!(
        &executor.host().commands[before..],
        [
            "swapoff /dev/lnos-test-sda3",
            "umount /lnos-test-root/boot/efi",
            "umount /lnos-test-root/boot",
            "umount /lnos-test-root",
            "cryptsetup close cryptroot",
        ]
    );
    assert_eq!(live_len(&executor), 0);
}

#[test]
fn missing_passphrase_is_rejected_before_any_command() {
    let plan = uefi_plan(&encrypted_policy());
    let mut executor = executor(RecordingHost::new());

    let err = executor.execute(&plan, Path::new(DISK)).unwrap_err();

    assert!(matches!(err, LnosError::MissingPassphrase));
    assert!(err.is_pre_mutation());
    assert!(executor.host().commands.is_empty());
    assert_eq!(executor.last_stage(), ExecStage::Unwiped);
}

// =============================================================================
// Busy detection
// =============================================================================

fn assert_busy(host: RecordingHost, policy: &PlanPolicy) {
    let plan = uefi_plan(policy);
    let mut executor = executor(host).with_passphrase(Passphrase::new("pw").unwrap());
    let err = executor.execute(&plan, Path::new(DISK)).unwrap_err();
    assert!(matches!(err, LnosError::DeviceBusy { .. }), "got {err}");
    assert!(executor.host().commands.is_empty());
}

#[test]
fn mounted_partition_makes_disk_busy() {
    let host = RecordingHost {
        mounts: vec![ActiveMount {
            source: PathBuf::from("/dev/lnos-test-sda2"),
            target: Some(PathBuf::from("/run/media/usb")),
        }],
        ..RecordingHost::new()
    };
    assert_busy(host, &PlanPolicy::default());
}

#[test]
fn active_swap_makes_disk_busy() {
    let host = RecordingHost {
        mounts: vec![ActiveMount {
            source: PathBuf::from("/dev/lnos-test-sda3"),
            target: None,
        }],
        ..RecordingHost::new()
    };
    assert_busy(host, &PlanPolicy::default());
}

#[test]
fn occupied_staging_root_is_busy() {
    let host = RecordingHost {
        mounts: vec![ActiveMount {
            source: PathBuf::from("/dev/lnos-test-sdb1"),
            target: Some(PathBuf::from(STAGING)),
        }],
        ..RecordingHost::new()
    };
    assert_busy(host, &PlanPolicy::default());
}

#[test]
fn existing_mapper_name_is_busy_only_for_encrypted_plans() {
    let host = RecordingHost {
        existing_paths: vec![PathBuf::from("/dev/mapper/cryptroot")],
        ..RecordingHost::new()
    };
    assert_busy(host, &encrypted_policy());

    let host = RecordingHost {
        existing_paths: vec![PathBuf::from("/dev/mapper/cryptroot")],
        ..RecordingHost::new()
    };
    let plan = uefi_plan(&PlanPolicy::default());
    assert!(executor(host).execute(&plan, Path::new(DISK)).is_ok());
}

#[test]
fn unrelated_mounts_do_not_block() {
    let host = RecordingHost {
        mounts: vec![
            ActiveMount {
                source: PathBuf::from("/dev/lnos-test-sdb1"),
                target: Some(PathBuf::from("/run/archiso/bootmnt")),
            },
            ActiveMount {
                source: PathBuf::from("/dev/lnos-test-sda12x"),
                target: Some(PathBuf::from("/srv")),
            },
        ],
        ..RecordingHost::new()
    };
    let plan = uefi_plan(&PlanPolicy::default());
    assert!(executor(host).execute(&plan, Path::new(DISK)).is_ok());
}

#[test]
fn partition_held_through_device_mapper_is_busy() {
    // The filesystem is mounted under its mapper name, so only the holder reveals it
    let host = RecordingHost {
        mounts: vec![ActiveMount {
            source: PathBuf::from("/dev/mapper/data"),
            target: Some(PathBuf::from("/data")),
        }],
        holders: vec![BlockHolder {
            node: PathBuf::from("/dev/lnos-test-sda2"),
            holder: "dm-0".to_string(),
        }],
        ..RecordingHost::new()
    };
    let plan = uefi_plan(&PlanPolicy::default());
    let mut executor = executor(host);
    let err = executor.execute(&plan, Path::new(DISK)).unwrap_err();

    match err {
        LnosError::DeviceBusy { path, holder } => {
            assert_eq!(path, PathBuf::from("/dev/lnos-test-sda2"));
            assert!(holder.contains("dm-0"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(executor.host().commands.is_empty());
}

#[test]
fn sibling_nvme_namespace_does_not_block() {
    let disk = "/dev/lnos-test-nvme0n1";
    let obs = DeviceObservation::new(FirmwareMode::Uefi, 8 * GIB, 100 * GIB, disk);
    let plan = plan(&obs, &PlanPolicy::default()).unwrap();
    let host = RecordingHost {
        mounts: vec![ActiveMount {
            source: PathBuf::from("/dev/lnos-test-nvme0n11"),
            target: Some(PathBuf::from("/srv")),
        }],
        ..RecordingHost::new()
    };

    let mut executor = executor(host);
    assert!(executor.execute(&plan, Path::new(disk)).is_ok());
    assert_eq!(
        executor.host().commands[0],
        "wipefs --all --force /dev/lnos-test-nvme0n1"
    );
}

#[test]
fn held_tree_blocks_second_execute_until_released() {
    let plan = uefi_plan(&PlanPolicy::default());
    let mut executor = executor(RecordingHost::new());

    executor.execute(&plan, Path::new(DISK)).unwrap();
    let err = executor.execute(&plan, Path::new(DISK)).unwrap_err();
    assert!(matches!(err, LnosError::DeviceBusy { .. }));

    assert!(executor.release().is_clean());
    assert!(executor.execute(&plan, Path::new(DISK)).is_ok());
}

// =============================================================================
// Shared live tree and state files
// =============================================================================

#[test]
fn shared_live_tree_sees_acquisitions() {
    let plan = uefi_plan(&PlanPolicy::default());
    let live = Arc::new(Mutex::new(MountTree::new()));
    let mut executor = executor(RecordingHost::new()).with_live_tree(Arc::clone(&live));

    let tree = executor.execute(&plan, Path::new(DISK)).unwrap();

    assert_eq!(*live.lock().unwrap(), tree);
    assert_eq!(tree.len(), 3);
}

#[test]
fn saved_tree_unwinds_later_in_reverse() {
    let plan = uefi_plan(&PlanPolicy::default());
    let mut executor = executor(RecordingHost::new());
    let tree = executor.execute(&plan, Path::new(DISK)).unwrap();

    let state = TempDir::new().unwrap();
    let path = state.path().join("mount-tree.json");
    tree.save(&path).unwrap();

    let mut loaded = MountTree::load(&path).unwrap();
    assert_eq!(loaded, tree);

    let mut later = RecordingHost::new();
    let report = unwind(&mut loaded, &mut later);
    assert!(report.is_clean());
    assert!(loaded.is_empty());
    assert_eq!(
        later.commands,
        vec![
            "swapoff /dev/lnos-test-sda2",
            "umount /lnos-test-root/boot/efi",
            "umount /lnos-test-root",
        ]
    );
}

#[test]
fn failed_release_is_reported_but_others_continue() {
    let plan = uefi_plan(&PlanPolicy::default());
    let mut executor = executor(RecordingHost::new());
    let mut tree = executor.execute(&plan, Path::new(DISK)).unwrap();

    let mut later = RecordingHost::failing_on("umount /lnos-test-root/boot/efi");
    let report = unwind(&mut tree, &mut later);

    assert!(!report.is_clean());
    assert_eq!(report.released.len(), 2);
    assert_eq!(later.commands.len(), 3);
    match report.into_error() {
        Some(LnosError::UnwindFailure { partial }) => {
            assert_eq!(partial.len(), 1);
            assert!(partial[0].contains("/lnos-test-root/boot/efi"));
        }
        other => panic!("unexpected: {other:?}"),
    }
}
