//! hymod - module grafting controller
//!
//! Usage:
//!   hymod mount            - Mount all modules
//!   hymod reload           - Reload HymoFS mappings
//!   hymod modules          - List active modules
//!   hymod storage          - Show storage status
//!   hymod clear            - Clear all HymoFS rules

use clap::{Parser, Subcommand};
use hymod::config::{load_module_modes, load_module_rules, save_module_modes, save_module_rules};
use hymod::defs::{
    BASE_DIR, BUILTIN_PARTITIONS, FALLBACK_CONTENT_DIR, HYMO_MIRROR_DEV, RUN_DIR,
};
use hymod::emitter::{
    add_rules_from_directory, remove_rules_from_directory, update_kernel_mappings,
};
use hymod::error::{Error, Result};
use hymod::executor::{execute_plan, ExecutionResult};
use hymod::inventory::{scan_modules, scan_partition_candidates, Module};
use hymod::kernel::{HymoStatus, KernelBridge};
use hymod::planner::{generate_plan, target_partitions, Mode, MountPlan};
use hymod::report::{print_module_list, update_module_description, RunSummary};
use hymod::state::RuntimeState;
use hymod::storage::{
    finalize_storage_permissions, setup_storage, storage_status_json, StorageHandle, StorageMode,
};
use hymod::sync::perform_sync;
use hymod::utils::{
    camouflage_process, ensure_dir_exists, has_files_recursive, sync_dir,
};
use hymod::Config;
use serde_json::json;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "hymod")]
#[command(author = "Hymo Contributors")]
#[command(version)]
#[command(about = "Userspace controller grafting module trees over read-only partitions")]
struct Cli {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Module directory
    #[arg(short, long)]
    moduledir: Option<PathBuf>,

    /// Temporary directory
    #[arg(short, long)]
    tempdir: Option<PathBuf>,

    /// Mount source name
    #[arg(short = 's', long)]
    mountsource: Option<String>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Add partition (can be used multiple times)
    #[arg(short, long = "partition")]
    partitions: Vec<String>,

    /// Output file (for gen-config)
    #[arg(short, long)]
    output: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Mount all modules
    Mount,

    /// Generate default config file
    GenConfig,

    /// Show current configuration
    ShowConfig,

    /// Show storage status
    Storage,

    /// List active modules
    Modules,

    /// Reload HymoFS mappings
    Reload,

    /// Clear all HymoFS mappings
    Clear,

    /// Show HymoFS protocol versions
    Version,

    /// List all active HymoFS rules
    List,

    /// Enable or disable kernel debug logging
    Debug {
        /// on|off
        state: String,
    },

    /// Execute a raw HymoFS command (add/hide/delete/merge/clear)
    Raw {
        args: Vec<String>,
    },

    /// Add a module's rules to HymoFS
    Add {
        module_id: String,
    },

    /// Delete a module's rules from HymoFS
    Delete {
        module_id: String,
    },

    /// Set the mount mode for a module
    SetMode {
        module_id: String,
        /// auto|hymofs|overlay|magic|none
        mode: String,
    },

    /// Add a custom mount rule for a module
    AddRule {
        module_id: String,
        path: String,
        mode: String,
    },

    /// Remove a custom mount rule for a module
    RemoveRule {
        module_id: String,
        path: String,
    },

    /// Set a custom mirror path for HymoFS
    SetMirror {
        path: PathBuf,
    },

    /// Fix mount namespace issues (reorder mnt_id)
    FixMounts,

    /// Scan modules and auto-add new partitions to the config
    SyncPartitions,
}

fn load_config(cli: &Cli) -> Config {
    match &cli.config {
        Some(path) => Config::from_file(path).unwrap_or_else(|e| {
            error!("error loading config: {}", e);
            Config::load_default()
        }),
        None => Config::load_default(),
    }
}

fn config_file_path(cli: &Cli) -> PathBuf {
    cli.config
        .clone()
        .unwrap_or_else(|| Path::new(BASE_DIR).join("config.toml"))
}

fn main() {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set subscriber");

    let bridge = KernelBridge::connect();
    let is_mount = matches!(cli.command, Commands::Mount);

    if let Err(e) = run_command(cli, &bridge) {
        error!("Error: {}", e);
        if is_mount {
            update_module_description(&RunSummary {
                success: false,
                storage_mode: "error".to_string(),
                ..Default::default()
            });
        }
        std::process::exit(1);
    }
}

fn run_command(cli: Cli, bridge: &KernelBridge) -> Result<()> {
    match &cli.command {
        Commands::Mount => cmd_mount(&cli, bridge),

        Commands::GenConfig => {
            let output = cli
                .output
                .clone()
                .unwrap_or_else(|| PathBuf::from("config.toml"));
            Config::default().save_to_file(&output)?;
            println!("Generated config: {}", output.display());
            Ok(())
        }

        Commands::ShowConfig => {
            let config = load_config(&cli);
            let status = match bridge.status() {
                HymoStatus::Available => 0,
                HymoStatus::NotPresent => 1,
                HymoStatus::KernelTooOld => 2,
                HymoStatus::ModuleTooOld => 3,
            };
            let shown = json!({
                "moduledir": config.moduledir.to_string_lossy(),
                "tempdir": config.tempdir.as_deref().unwrap_or(Path::new("")).to_string_lossy(),
                "mountsource": config.mountsource,
                "verbose": config.verbose,
                "force_ext4": config.force_ext4,
                "disable_umount": config.disable_umount,
                "enable_nuke": config.enable_nuke,
                "ignore_protocol_mismatch": config.ignore_protocol_mismatch,
                "enable_kernel_debug": config.enable_kernel_debug,
                "enable_stealth": config.enable_stealth,
                "hymofs_available": bridge.is_available(),
                "hymofs_status": status,
                "partitions": config.partitions,
            });
            println!("{:#}", shown);
            Ok(())
        }

        Commands::Storage => {
            println!("{:#}", storage_status_json());
            Ok(())
        }

        Commands::Modules => {
            let config = load_config(&cli);
            print_module_list(&config, bridge.is_available());
            Ok(())
        }

        Commands::Reload => cmd_reload(&cli, bridge),

        Commands::Clear => {
            bridge.require_available()?;
            bridge.clear_rules()?;
            println!("Successfully cleared all HymoFS rules.");
            info!("user manually cleared all HymoFS rules via CLI");

            let mut state = RuntimeState::load();
            state.hymofs_module_ids.clear();
            state.save()?;
            Ok(())
        }

        Commands::Version => {
            if bridge.is_available() {
                let version = bridge.protocol_version()?;
                println!(
                    "HymoFS Protocol Version: {}",
                    KernelBridge::EXPECTED_PROTOCOL_VERSION
                );
                println!("HymoFS Kernel Version: {}", version);
            } else {
                println!("HymoFS not available.");
            }
            Ok(())
        }

        Commands::List => {
            if bridge.is_available() {
                print!("{}", bridge.list_rules()?);
            } else {
                println!("HymoFS not available.");
            }
            Ok(())
        }

        Commands::Debug { state } => {
            bridge.require_available()?;
            let enable = state == "on" || state == "1" || state == "true";
            bridge.set_debug(enable)?;
            println!(
                "Kernel debug logging {}.",
                if enable { "enabled" } else { "disabled" }
            );
            Ok(())
        }

        Commands::Raw { args } => cmd_raw(args, bridge),

        Commands::Add { module_id } => cmd_add(&cli, module_id, bridge),

        Commands::Delete { module_id } => cmd_delete(&cli, module_id, bridge),

        Commands::SetMode { module_id, mode } => {
            let mode = Mode::parse(mode)?;
            let mut modes = load_module_modes();
            modes.insert(module_id.clone(), mode);
            save_module_modes(&modes)?;
            println!("Set mode for {} to {}", module_id, mode);
            Ok(())
        }

        Commands::AddRule {
            module_id,
            path,
            mode,
        } => {
            let mode = Mode::parse(mode)?;
            let mut rules = load_module_rules();
            let module_rules = rules.entry(module_id.clone()).or_default();
            match module_rules.iter_mut().find(|r| &r.path == path) {
                Some(rule) => rule.mode = mode,
                None => module_rules.push(hymod::config::RuleConfig {
                    path: path.clone(),
                    mode,
                }),
            }
            save_module_rules(&rules)?;
            println!("Added rule for {}: {} -> {}", module_id, path, mode);
            Ok(())
        }

        Commands::RemoveRule { module_id, path } => {
            let mut rules = load_module_rules();
            let Some(module_rules) = rules.get_mut(module_id) else {
                println!("Module not found in rules.");
                return Ok(());
            };
            let before = module_rules.len();
            module_rules.retain(|r| &r.path != path);
            if module_rules.len() == before {
                println!("Rule not found.");
                return Ok(());
            }
            save_module_rules(&rules)?;
            println!("Removed rule for {}: {}", module_id, path);
            Ok(())
        }

        Commands::SetMirror { path } => {
            let mut config = load_config(&cli);
            config.mirror_path = Some(path.clone());
            config.save_to_file(&config_file_path(&cli))?;
            println!("Mirror path set to: {}", path.display());
            if bridge.is_available() {
                bridge.set_mirror_path(&path.to_string_lossy())?;
                println!("Applied mirror path to kernel.");
            }
            Ok(())
        }

        Commands::FixMounts => {
            bridge.require_available()?;
            bridge.fix_mounts()?;
            println!("Mount namespace fixed (mnt_id reordered).");
            Ok(())
        }

        Commands::SyncPartitions => {
            let mut config = load_config(&cli);
            let candidates = scan_partition_candidates(&config.moduledir);

            let mut added = 0;
            for candidate in candidates {
                let exists = config.partitions.contains(&candidate)
                    || BUILTIN_PARTITIONS.contains(&candidate.as_str());
                if !exists {
                    println!("Added partition: {}", candidate);
                    config.partitions.push(candidate);
                    added += 1;
                }
            }

            if added > 0 {
                config.save_to_file(&config_file_path(&cli))?;
                println!("Updated config with {} new partitions.", added);
            } else {
                println!("No new partitions found.");
            }
            Ok(())
        }
    }
}

fn cmd_raw(args: &[String], bridge: &KernelBridge) -> Result<()> {
    let usage = || Error::Config("usage: hymod raw <add|hide|delete|merge|clear> [args...]".into());
    let cmd = args.first().ok_or_else(usage)?;

    match cmd.as_str() {
        "add" => {
            let src = args.get(1).ok_or_else(usage)?;
            let target = args.get(2).ok_or_else(usage)?;
            let raw_type = match args.get(3) {
                Some(value) => value
                    .parse::<i32>()
                    .map_err(|_| Error::Config(format!("bad rule type: {}", value)))?,
                None => 0,
            };
            bridge.add_rule(src, target, hymod::kernel::RuleFileType::from_raw(raw_type))?;
        }
        "hide" => {
            let path = args.get(1).ok_or_else(usage)?;
            bridge.hide_path(path)?;
        }
        "delete" => {
            let src = args.get(1).ok_or_else(usage)?;
            bridge.delete_rule(src)?;
        }
        "merge" => {
            let src = args.get(1).ok_or_else(usage)?;
            let target = args.get(2).ok_or_else(usage)?;
            bridge.add_merge_rule(src, target)?;
        }
        "clear" => bridge.clear_rules()?,
        other => return Err(Error::Config(format!("unknown raw command: {}", other))),
    }

    println!("Command executed successfully.");
    info!("executed raw command: {}", cmd);
    Ok(())
}

fn cmd_add(cli: &Cli, module_id: &str, bridge: &KernelBridge) -> Result<()> {
    let config = load_config(cli);
    let module_path = config.moduledir.join(module_id);
    if !module_path.exists() {
        return Err(Error::Config(format!("module not found: {}", module_id)));
    }

    let mut partitions = target_partitions(&config);
    partitions.sort();
    partitions.dedup();

    let mut success_count = 0;
    for part in &partitions {
        let src_dir = module_path.join(part);
        if src_dir.is_dir() {
            let target_base = Path::new("/").join(part);
            if add_rules_from_directory(bridge, &target_base, &src_dir).is_ok() {
                success_count += 1;
            }
        }
    }

    if success_count > 0 {
        println!("Successfully added module {}", module_id);
        info!("CLI: added module {}", module_id);

        let mut state = RuntimeState::load();
        if !state.hymofs_module_ids.iter().any(|id| id == module_id) {
            state.hymofs_module_ids.push(module_id.to_string());
            state.save()?;
        }
    } else {
        println!("No content found to add for module {}", module_id);
    }
    Ok(())
}

fn cmd_delete(cli: &Cli, module_id: &str, bridge: &KernelBridge) -> Result<()> {
    let config = load_config(cli);
    let module_path = config.moduledir.join(module_id);

    let mut partitions = target_partitions(&config);
    partitions.sort();
    partitions.dedup();

    let mut success_count = 0;
    for part in &partitions {
        let src_dir = module_path.join(part);
        if src_dir.is_dir() {
            let target_base = Path::new("/").join(part);
            if remove_rules_from_directory(bridge, &target_base, &src_dir).is_ok() {
                success_count += 1;
            }
        }
    }

    if success_count > 0 {
        println!(
            "Successfully removed {} rule sets for module {}",
            success_count, module_id
        );
        info!("CLI: removed rules for module {}", module_id);

        let mut state = RuntimeState::load();
        let before = state.hymofs_module_ids.len();
        state.hymofs_module_ids.retain(|id| id != module_id);
        if state.hymofs_module_ids.len() != before {
            state.save()?;
        }
    } else {
        println!("No active rules found or removed for module {}", module_id);
    }
    Ok(())
}

/// The staging mirror location pushed to the kernel on the fast path:
/// explicit config override, then the scratch dir, then the default.
fn effective_mirror_path(config: &Config) -> PathBuf {
    if let Some(mirror_path) = &config.mirror_path {
        return mirror_path.clone();
    }
    if let Some(tempdir) = &config.tempdir {
        return tempdir.clone();
    }
    PathBuf::from(HYMO_MIRROR_DEV)
}

fn modules_with_content(modules: Vec<Module>, partitions: &[String]) -> Vec<Module> {
    modules
        .into_iter()
        .filter(|module| {
            let keep = partitions
                .iter()
                .any(|part| has_files_recursive(&module.source_path.join(part)));
            if !keep {
                info!("skipping empty module: {}", module.id);
            }
            keep
        })
        .collect()
}

/// Move overlay layers and magic entries that live inside the HymoFS
/// mirror tree into a staging subdirectory, so the kernel's path rules and
/// the mount backends never serve the same subtree.
fn segregate_custom_rules(plan: &mut MountPlan, mirror_dir: &Path) {
    let staging_dir = mirror_dir.join(".overlay_staging");

    let relocate = |path: &mut PathBuf| {
        let rel = match path.strip_prefix(mirror_dir) {
            Ok(rel) => rel.to_path_buf(),
            Err(_) => return,
        };
        if rel.starts_with(".overlay_staging") || !path.exists() {
            return;
        }
        let target = staging_dir.join(&rel);
        if let Some(parent) = target.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                warn!("failed to prepare staging dir: {}", e);
                return;
            }
        }
        match std::fs::rename(path.as_path(), &target) {
            Ok(()) => {
                info!(
                    "segregated backend source: {} -> {}",
                    path.display(),
                    target.display()
                );
                *path = target;
            }
            Err(e) => warn!("failed to segregate {}: {}", path.display(), e),
        }
    };

    for op in &mut plan.overlay_ops {
        for layer in &mut op.lowerdirs {
            relocate(layer);
        }
    }
    for path in &mut plan.magic_module_paths {
        relocate(path);
    }
}

fn compute_active_mounts(config: &Config, modules: &[Module], plan: &MountPlan) -> Vec<String> {
    let mut active: BTreeSet<String> = BTreeSet::new();
    let partitions = target_partitions(config);

    let module_has_part = |id: &String, part: &str| {
        modules
            .iter()
            .find(|m| &m.id == id)
            .map(|m| m.source_path.join(part).exists())
            .unwrap_or(false)
    };

    for part in &partitions {
        let hymofs_hit = plan
            .hymofs_module_ids
            .iter()
            .any(|id| module_has_part(id, part));
        let magic_hit = plan
            .magic_module_ids
            .iter()
            .any(|id| module_has_part(id, part));
        if hymofs_hit || magic_hit {
            active.insert(part.clone());
        }
    }

    for op in &plan.overlay_ops {
        if let Some(name) = Path::new(&op.target).file_name() {
            active.insert(name.to_string_lossy().into_owned());
        }
    }

    active.into_iter().collect()
}

struct PipelineOutcome {
    storage: StorageHandle,
    plan: MountPlan,
    exec: ExecutionResult,
    modules: Vec<Module>,
    hymofs_active: bool,
}

/// HymoFS fast path: stage modules into the kernel mirror and install path
/// rules, executing only the residual overlay/magic plan through mounts.
fn run_fast_path(config: &Config, bridge: &KernelBridge) -> Result<PipelineOutcome> {
    info!("mode: HymoFS fast path");

    let mirror_dir = effective_mirror_path(config);
    if mirror_dir != Path::new(HYMO_MIRROR_DEV) {
        match bridge.set_mirror_path(&mirror_dir.to_string_lossy()) {
            Ok(()) => info!("applied custom mirror path: {}", mirror_dir.display()),
            Err(e) => warn!("failed to apply custom mirror path: {}", e),
        }
    }

    if config.enable_kernel_debug {
        if let Err(e) = bridge.set_debug(true) {
            warn!("failed to enable kernel debug logging: {}", e);
        }
    }
    if let Err(e) = bridge.set_stealth(config.enable_stealth) {
        warn!("failed to set stealth mode: {}", e);
    }

    let image_path = Path::new(BASE_DIR).join("modules.img");
    let partitions = target_partitions(config);

    let mirror_result = (|| -> Result<PipelineOutcome> {
        let storage = match setup_storage(&mirror_dir, &image_path, config.force_ext4) {
            Ok(storage) => storage,
            Err(e) if config.force_ext4 => {
                warn!("forced ext4 failed: {}, falling back to auto", e);
                setup_storage(&mirror_dir, &image_path, false)?
            }
            Err(e) => return Err(e),
        };
        info!("mirror storage setup successful, mode: {}", storage.mode);

        let modules = modules_with_content(
            scan_modules(&config.moduledir, config),
            &partitions,
        );

        info!("syncing {} active modules to mirror", modules.len());
        for module in &modules {
            let dst = mirror_dir.join(&module.id);
            sync_dir(&module.source_path, &dst).map_err(|e| {
                error!("failed to sync module {}: {}", module.id, e);
                e
            })?;
        }

        if storage.mode == StorageMode::Ext4 {
            finalize_storage_permissions(&storage.mount_point);
        }

        let mut plan = generate_plan(config, &modules, &mirror_dir, true);
        segregate_custom_rules(&mut plan, &mirror_dir);
        update_kernel_mappings(bridge, config, &modules, &mirror_dir, &mut plan)?;

        let exec = execute_plan(&plan, config, &mirror_dir, bridge);

        if config.enable_stealth {
            match bridge.fix_mounts() {
                Ok(()) => info!("mount namespace fixed after mounting"),
                Err(e) => warn!("failed to fix mount namespace: {}", e),
            }
        }

        Ok(PipelineOutcome {
            storage,
            plan,
            exec,
            modules,
            hymofs_active: true,
        })
    })();

    match mirror_result {
        Ok(outcome) => Ok(outcome),
        Err(e) => {
            error!("mirror strategy failed: {}", e);
            warn!("falling back to magic mount from the module store");
            let _ = rustix::mount::unmount(&mirror_dir, rustix::mount::UnmountFlags::DETACH);

            let modules = modules_with_content(
                scan_modules(&config.moduledir, config),
                &partitions,
            );

            let plan = MountPlan {
                magic_module_paths: modules.iter().map(|m| m.source_path.clone()).collect(),
                ..Default::default()
            };
            let exec = execute_plan(&plan, config, &config.moduledir, bridge);

            Ok(PipelineOutcome {
                storage: StorageHandle {
                    mount_point: config.moduledir.clone(),
                    mode: StorageMode::MagicOnly,
                },
                plan,
                exec,
                modules,
                hymofs_active: false,
            })
        }
    }
}

/// Standard path: stage into the fallback content dir and commit the plan
/// purely through overlay and magic mounts.
fn run_legacy_path(config: &Config, bridge: &KernelBridge) -> Result<PipelineOutcome> {
    info!("mode: standard overlay/magic");

    let staging_root = PathBuf::from(FALLBACK_CONTENT_DIR);
    let image_path = Path::new(BASE_DIR).join("modules.img");

    let storage = setup_storage(&staging_root, &image_path, config.force_ext4)?;

    let modules = scan_modules(&config.moduledir, config);
    info!("scanned {} active modules", modules.len());

    perform_sync(&modules, &storage.mount_point, config);

    if storage.mode == StorageMode::Ext4 {
        finalize_storage_permissions(&storage.mount_point);
    }

    info!("generating mount plan");
    let plan = generate_plan(config, &modules, &storage.mount_point, false);

    let exec = execute_plan(&plan, config, &storage.mount_point, bridge);

    Ok(PipelineOutcome {
        storage,
        plan,
        exec,
        modules,
        hymofs_active: false,
    })
}

fn cmd_mount(cli: &Cli, bridge: &KernelBridge) -> Result<()> {
    let mut config = load_config(cli);
    config.merge_with_cli(
        cli.moduledir.clone(),
        cli.tempdir.clone(),
        cli.mountsource.clone(),
        cli.verbose,
        cli.partitions.clone(),
    );

    if !camouflage_process("kworker/u9:1") {
        warn!("failed to camouflage process");
    }

    info!("hymo daemon starting");
    if config.disable_umount {
        warn!("namespace detach (try_umount) is DISABLED");
    }
    ensure_dir_exists(Path::new(RUN_DIR))?;

    let status = bridge.status();
    let mut warning_msg = String::new();
    let mut can_use_hymofs = status == HymoStatus::Available;

    if !can_use_hymofs && config.ignore_protocol_mismatch {
        match status {
            HymoStatus::KernelTooOld => {
                warn!("forcing HymoFS despite protocol mismatch");
                can_use_hymofs = true;
                warning_msg =
                    "⚠️Kernel version is lower than module version. Please update your kernel."
                        .to_string();
            }
            HymoStatus::ModuleTooOld => {
                warn!("forcing HymoFS despite protocol mismatch");
                can_use_hymofs = true;
                warning_msg =
                    "⚠️Module version is lower than kernel version. Please update your module."
                        .to_string();
            }
            _ => warn!("cannot force HymoFS: kernel module not present"),
        }
    } else if status == HymoStatus::KernelTooOld {
        warn!("HymoFS protocol mismatch, kernel is too old");
        warning_msg = "⚠️Kernel version is lower than module version. Please update your kernel."
            .to_string();
    } else if status == HymoStatus::ModuleTooOld {
        warn!("HymoFS protocol mismatch, module is too old");
        warning_msg = "⚠️Module version is lower than kernel version. Please update your module."
            .to_string();
    }

    let outcome = if can_use_hymofs {
        run_fast_path(&config, bridge)?
    } else {
        run_legacy_path(&config, bridge)?
    };

    info!(
        "plan: {} OverlayFS modules, {} Magic modules, {} HymoFS modules",
        outcome.exec.overlay_module_ids.len(),
        outcome.exec.magic_module_ids.len(),
        outcome.plan.hymofs_module_ids.len()
    );

    let mut nuke_active = false;
    if outcome.storage.mode == StorageMode::Ext4 && config.enable_nuke {
        info!("nuking ext4 sysfs traces via host kernel");
        match bridge.nuke_sysfs(&outcome.storage.mount_point) {
            Ok(()) => {
                info!("ext4 sysfs traces nuked");
                nuke_active = true;
            }
            Err(e) => warn!("sysfs nuke failed: {}", e),
        }
    }

    let mut state = RuntimeState {
        storage_mode: outcome.storage.mode.to_string(),
        mount_point: outcome.storage.mount_point.to_string_lossy().into_owned(),
        overlay_module_ids: outcome.exec.overlay_module_ids.clone(),
        magic_module_ids: outcome.exec.magic_module_ids.clone(),
        hymofs_module_ids: outcome.plan.hymofs_module_ids.clone(),
        nuke_active,
        active_mounts: compute_active_mounts(&config, &outcome.modules, &outcome.plan),
        ..Default::default()
    };

    if matches!(status, HymoStatus::KernelTooOld | HymoStatus::ModuleTooOld) {
        state.hymofs_mismatch = true;
        state.mismatch_message = warning_msg.clone();
    }

    if let Err(e) = state.save() {
        error!("failed to save runtime state: {}", e);
    }

    update_module_description(&RunSummary {
        success: true,
        storage_mode: outcome.storage.mode.to_string(),
        nuke_active,
        overlay_count: outcome.exec.overlay_module_ids.len(),
        magic_count: outcome.exec.magic_module_ids.len(),
        hymofs_count: outcome.plan.hymofs_module_ids.len(),
        warning_msg,
        hymofs_active: outcome.hymofs_active,
    });

    info!("hymo completed");
    Ok(())
}

fn cmd_reload(cli: &Cli, bridge: &KernelBridge) -> Result<()> {
    let config = load_config(cli);

    if !bridge.is_available() {
        warn!("HymoFS not available, cannot hot reload");
        return Ok(());
    }

    info!("reloading HymoFS mappings");

    let mirror_dir = effective_mirror_path(&config);
    let partitions = target_partitions(&config);

    let modules: Vec<Module> = scan_modules(&config.moduledir, &config)
        .into_iter()
        .filter(|module| {
            let hot_unmounted = Path::new(RUN_DIR)
                .join("hot_unmounted")
                .join(&module.id)
                .exists();
            if hot_unmounted {
                info!("skipping hot-unmounted module: {}", module.id);
            }
            !hot_unmounted
        })
        .filter(|module| {
            partitions
                .iter()
                .any(|part| has_files_recursive(&module.source_path.join(part)))
        })
        .collect();

    info!("syncing modules to mirror");
    for module in &modules {
        let dst = mirror_dir.join(&module.id);
        if let Err(e) = sync_dir(&module.source_path, &dst) {
            error!("failed to sync module {}: {}", module.id, e);
        }
    }

    let mut plan = generate_plan(&config, &modules, &mirror_dir, true);
    update_kernel_mappings(bridge, &config, &modules, &mirror_dir, &mut plan)?;

    if let Err(e) = bridge.set_stealth(config.enable_stealth) {
        warn!("failed to set stealth mode: {}", e);
    }
    if config.enable_stealth {
        match bridge.fix_mounts() {
            Ok(()) => info!("mount namespace fixed after reload"),
            Err(e) => warn!("failed to fix mount namespace after reload: {}", e),
        }
    }

    let mut state = RuntimeState::load();
    if state.storage_mode.is_empty() {
        state.storage_mode = "hymofs".to_string();
    }
    state.mount_point = mirror_dir.to_string_lossy().into_owned();
    state.hymofs_module_ids = plan.hymofs_module_ids.clone();
    state.active_mounts = compute_active_mounts(&config, &modules, &plan);
    state.save()?;

    info!("reload complete");
    Ok(())
}
