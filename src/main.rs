//! LnOS disk engine - main entry point
//!
//! Thin command-line shell over the library: load configuration, inspect
//! the device, plan, confirm, then execute through a real or dry-run host.

use anyhow::{bail, Context, Result};
use log::{debug, error, info, warn};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use lnos::cli::{self, Cli, Commands, PolicyArgs};
use lnos::config_file::InstallConfig;
use lnos::engine::executor::PlanExecutor;
use lnos::engine::planner::{plan, PartitionPlan};
use lnos::engine::unwind::{settle_state_file, unwind, MountTree};
use lnos::error::LnosError;
use lnos::hardware::DeviceInspector;
use lnos::process_guard::{self, ProcessGuard};
use lnos::sanity;
use lnos::tool_runner::{DiskHost, DryRunHost, SystemHost};
use lnos::tools::encryption::Passphrase;

/// Initialize the logger with appropriate settings
fn init_logger() {
    use env_logger::Builder;

    Builder::from_default_env()
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {}:{}] {}",
                record.level(),
                record.file().unwrap_or("unknown"),
                record.line().unwrap_or(0),
                record.args()
            )
        })
        .filter_level(log::LevelFilter::Info)
        .parse_default_env() // Allows RUST_LOG env var to override
        .init();
}

fn main() {
    init_logger();
    info!("LnOS disk engine starting up");

    let cli = Cli::parse_args();
    debug!("CLI arguments parsed");

    if let Err(e) = run(cli) {
        error!("{:#}", e);
        eprintln!("✗ {:#}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let dry_run = cli.dry_run;
    if dry_run {
        info!("Dry-run mode: no command will be executed");
    }

    match cli.command {
        Commands::Validate { file } => {
            info!("Validating configuration file: {:?}", file);
            let loaded = InstallConfig::load_from_file(&file)?;
            loaded.validate().context("Configuration validation failed")?;
            println!("✓ Configuration file is valid: {}", file.display());
            Ok(())
        }
        Commands::Inspect { device, json } => {
            let config = load_config(cli.config.as_deref())?;
            let device = resolve_device(device, &config)?;
            let observation = DeviceInspector::new().inspect(&device)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&observation)?);
            } else {
                println!("{}", observation);
            }
            Ok(())
        }
        Commands::Plan {
            device,
            policy,
            json,
        } => {
            let (config, device) = prepare_config(cli.config.as_deref(), device, &policy)?;
            let plan = compute_plan(&config, &device)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&plan)?);
            } else {
                println!("{}", plan.summary());
            }
            Ok(())
        }
        Commands::Install {
            device,
            policy,
            confirm,
            keep_mounted,
            state,
            passphrase_file,
        } => {
            let (config, device) = prepare_config(cli.config.as_deref(), device, &policy)?;
            let request = InstallRequest {
                device,
                confirm,
                keep_mounted,
                state,
                passphrase_file,
            };
            run_install(&config, &request, dry_run)
        }
        Commands::Unwind { state } => run_unwind(&state, dry_run),
    }
}

fn load_config(path: Option<&Path>) -> Result<InstallConfig> {
    match path {
        Some(path) => {
            info!("Loading configuration from: {:?}", path);
            InstallConfig::load_from_file(path)
        }
        None => Ok(InstallConfig::default()),
    }
}

/// Command-line device first, then the config file's.
fn resolve_device(device: Option<PathBuf>, config: &InstallConfig) -> Result<PathBuf> {
    match device {
        Some(device) => Ok(device),
        None if !config.device.trim().is_empty() => Ok(config.device_path()),
        None => bail!("No device given on the command line or in the configuration file"),
    }
}

/// Config file, then flags on top, then validation.
fn prepare_config(
    path: Option<&Path>,
    device: Option<PathBuf>,
    policy: &PolicyArgs,
) -> Result<(InstallConfig, PathBuf)> {
    let mut config = load_config(path)?;
    let device = resolve_device(device, &config)?;
    config.device = device.display().to_string();
    policy.apply(&mut config);
    config.validate()?;
    Ok((config, device))
}

fn compute_plan(config: &InstallConfig, device: &Path) -> Result<PartitionPlan> {
    let observation = DeviceInspector::new().inspect(device)?;
    info!("Inspected {}", observation);
    Ok(plan(&observation, &config.policy())?)
}

struct InstallRequest {
    device: PathBuf,
    confirm: Option<PathBuf>,
    keep_mounted: bool,
    state: Option<PathBuf>,
    passphrase_file: Option<PathBuf>,
}

/// What to do with the mount tree after a successful execute.
enum Finish<'a> {
    Release,
    Persist(&'a Path),
    /// Dry run with `--keep-mounted`: nothing to release, nothing to save
    Leave,
}

fn run_install(config: &InstallConfig, request: &InstallRequest, dry_run: bool) -> Result<()> {
    let policy = config.policy();
    let plan = compute_plan(config, &request.device)?;
    println!("{}\n", plan.summary());

    if !dry_run {
        let check = sanity::run_preflight_checks(&policy);
        if !check.is_ok() {
            eprint!("{}", check.report());
            bail!("Pre-flight checks failed");
        }
        cli::confirm_device(
            &request.device,
            plan.disk(),
            request.confirm.as_deref(),
            &mut std::io::stdin().lock(),
            &mut std::io::stdout(),
        )?;
    }

    let passphrase = if plan.is_encrypted() {
        Some(load_passphrase(request.passphrase_file.as_deref(), dry_run)?)
    } else {
        None
    };

    let finish = match (&request.state, request.keep_mounted) {
        (Some(state), true) if !dry_run => Finish::Persist(state),
        (_, true) => Finish::Leave,
        (_, false) => Finish::Release,
    };

    let live = Arc::new(Mutex::new(MountTree::new()));

    if dry_run {
        let mut executor = build_executor(DryRunHost::new(), config, passphrase, live);
        let outcome = apply_plan(&mut executor, &plan, finish);
        println!("\nCommands that would run:");
        for command in executor.host().commands() {
            println!("  {}", command);
        }
        return outcome;
    }

    if let Err(e) = process_guard::init_signal_handlers(Arc::clone(&live)) {
        warn!("Failed to initialize signal handlers: {}", e);
    }
    let _guard = ProcessGuard::new();
    let mut executor = build_executor(SystemHost::new(), config, passphrase, live);
    apply_plan(&mut executor, &plan, finish)
}

fn build_executor<H: DiskHost>(
    host: H,
    config: &InstallConfig,
    passphrase: Option<Passphrase>,
    live: Arc<Mutex<MountTree>>,
) -> PlanExecutor<H> {
    let executor = PlanExecutor::new(host)
        .with_staging_root(&config.staging_root)
        .with_poll(config.node_poll())
        .with_live_tree(live);
    match passphrase {
        Some(passphrase) => executor.with_passphrase(passphrase),
        None => executor,
    }
}

fn apply_plan<H: DiskHost>(
    executor: &mut PlanExecutor<H>,
    plan: &PartitionPlan,
    finish: Finish<'_>,
) -> Result<()> {
    // The plan holds the resolved kernel node, not a by-id alias
    let device = plan.disk();
    let tree = executor
        .execute(plan, device)
        .with_context(|| format!("Failed to prepare {}", device.display()))?;

    println!("✓ {} reached {}", device.display(), executor.last_stage());
    for entry in tree.entries() {
        println!("  {}", entry);
    }

    match finish {
        Finish::Persist(state) => {
            tree.save(state)
                .with_context(|| format!("Failed to write mount tree to {:?}", state))?;
            println!(
                "Mount tree left in place under {}; release it with: lnos unwind --state {}",
                executor.staging_root().display(),
                state.display()
            );
        }
        Finish::Leave => {
            info!("Leaving mount tree in place (--keep-mounted)");
        }
        Finish::Release => {
            let report = executor.release();
            if let Some(e) = report.into_error() {
                warn!("{}", e);
            }
        }
    }
    Ok(())
}

fn load_passphrase(file: Option<&Path>, dry_run: bool) -> Result<Passphrase> {
    if let Some(path) = file {
        return Passphrase::from_file(path)
            .with_context(|| format!("Failed to read passphrase from {:?}", path));
    }
    if let Some(passphrase) = Passphrase::from_env() {
        return Ok(passphrase);
    }
    if dry_run {
        warn!("No passphrase supplied; dry run continues with a placeholder");
        return Ok(Passphrase::new("dry-run-placeholder")?);
    }
    Err(LnosError::MissingPassphrase.into())
}

fn run_unwind(state: &Path, dry_run: bool) -> Result<()> {
    let mut tree = MountTree::load(state)
        .with_context(|| format!("Failed to read mount tree from {:?}", state))?;
    if tree.is_empty() {
        println!("Nothing to release");
        return Ok(());
    }

    if dry_run {
        let mut host = DryRunHost::new();
        unwind(&mut tree, &mut host);
        println!("Commands that would run:");
        for command in host.commands() {
            println!("  {}", command);
        }
        return Ok(());
    }

    let report = {
        let _guard = ProcessGuard::new();
        unwind(&mut tree, &mut SystemHost::new())
    };
    settle_state_file(state, &report)
        .with_context(|| format!("Failed to update state file {:?}", state))?;

    let released = report.released.len();
    match report.into_error() {
        Some(e) => Err(e.into()),
        None => {
            println!("✓ Released {} resource(s)", released);
            Ok(())
        }
    }
}
