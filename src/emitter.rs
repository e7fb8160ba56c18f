//! HymoFS rule emission.
//!
//! Walks HymoFS-assigned module trees in reverse priority (lowest first,
//! so the highest-priority module wins in a last-write-wins kernel table)
//! and translates entries into kernel add/merge/hide rules, excluding any
//! subtree already claimed by an overlay operation.

use crate::config::Config;
use crate::error::Result;
use crate::inventory::Module;
use crate::kernel::{KernelBridge, RuleFileType};
use crate::planner::{resolve_mode, Mode, MountPlan};
use crate::utils::{kind_of_metadata, FileKind};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// One path rewrite handed to the kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddRule {
    pub src: String,
    pub target: PathBuf,
    pub file_type: RuleFileType,
}

/// One directory-union directive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeRule {
    pub src: String,
    pub target: PathBuf,
}

/// The materialized rule relation for one run. Applied as adds, then
/// merges, then hides; the kernel is the source of truth afterwards.
#[derive(Debug, Default)]
pub struct KernelRuleSet {
    pub adds: Vec<AddRule>,
    pub merges: Vec<MergeRule>,
    pub hides: Vec<String>,
}

impl KernelRuleSet {
    pub fn len(&self) -> usize {
        self.adds.len() + self.merges.len() + self.hides.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Resolve symlinks in the directory part of a virtual path while leaving
/// the final filename untouched, so a rule can still target a symlink
/// file itself. Non-existing ancestors are re-appended verbatim after the
/// deepest existing ancestor is canonicalized.
pub fn resolve_path_for_hymofs(path_str: &str) -> String {
    let path = Path::new(path_str);
    let (Some(parent), Some(filename)) = (path.parent(), path.file_name()) else {
        return path_str.to_string();
    };

    let mut curr = parent.to_path_buf();
    let mut suffix: Vec<OsString> = Vec::new();
    while !curr.as_os_str().is_empty() && curr != Path::new("/") && !curr.exists() {
        match curr.file_name() {
            Some(name) => suffix.push(name.to_os_string()),
            None => break,
        }
        if !curr.pop() {
            break;
        }
    }

    if curr.exists() {
        if let Ok(canonical) = curr.canonicalize() {
            curr = canonical;
        }
    }
    for name in suffix.iter().rev() {
        curr.push(name);
    }
    curr.push(filename);
    curr.to_string_lossy().into_owned()
}

/// If `virtual_path` is claimed by an overlay operation, return its index.
fn covering_op(plan: &MountPlan, virtual_path: &str) -> Option<usize> {
    plan.overlay_ops
        .iter()
        .position(|op| crate::planner::prefix_matches(&op.target, virtual_path))
}

struct Walker<'a> {
    module: &'a Module,
    mod_path: PathBuf,
    default_mode: Mode,
}

impl Walker<'_> {
    fn walk(&self, dir: &Path, plan: &mut MountPlan, rules: &mut KernelRuleSet) {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("error scanning module {}: {}", self.module.id, e);
                return;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            let Ok(meta) = std::fs::symlink_metadata(&path) else {
                continue;
            };
            let is_dir = meta.is_dir();

            let Ok(rel) = path.strip_prefix(&self.mod_path) else {
                continue;
            };
            let virtual_path = format!("/{}", rel.to_string_lossy());

            let (mode, _) = resolve_mode(self.module, &virtual_path, self.default_mode);

            // Entries claimed by other backends are not emitted, but their
            // children may still carry deeper hymofs rules.
            if mode != Mode::HymoFs && mode != Mode::Auto {
                if is_dir {
                    self.walk(&path, plan, rules);
                }
                continue;
            }

            if let Some(op_idx) = covering_op(plan, &virtual_path) {
                // The overlay already presents this subtree; graft the
                // module's matching directory into that operation instead
                // of emitting competing kernel rules.
                let op = &mut plan.overlay_ops[op_idx];
                if op.target.len() > 1 {
                    let layer_path = self.mod_path.join(&op.target[1..]);
                    if layer_path.exists() && !op.lowerdirs.contains(&layer_path) {
                        op.lowerdirs.push(layer_path);
                    }
                }
                if is_dir {
                    self.walk(&path, plan, rules);
                }
                continue;
            }

            if is_dir {
                let final_virtual = resolve_path_for_hymofs(&virtual_path);
                if Path::new(&final_virtual).is_dir() {
                    // The kernel merges the two directories; children are
                    // reached through the backing target.
                    rules.merges.push(MergeRule {
                        src: final_virtual,
                        target: path.clone(),
                    });
                    continue;
                }
                self.walk(&path, plan, rules);
                continue;
            }

            let kind = kind_of_metadata(&meta);
            match kind {
                FileKind::Regular | FileKind::Symlink => {
                    // Never replace a live directory with a symlink.
                    if kind == FileKind::Symlink && Path::new(&virtual_path).is_dir() {
                        warn!(
                            "safety: skipping symlink replacement for directory {}",
                            virtual_path
                        );
                        continue;
                    }
                    rules.adds.push(AddRule {
                        src: resolve_path_for_hymofs(&virtual_path),
                        target: path,
                        file_type: RuleFileType::from_metadata(&meta),
                    });
                }
                FileKind::Whiteout => {
                    rules.hides.push(resolve_path_for_hymofs(&virtual_path));
                }
                _ => {}
            }
        }
    }
}

/// Collect the full kernel rule relation for the HymoFS-marked modules.
/// Overlay operations may gain layers as covered subtrees are grafted.
pub fn collect_rules(
    config: &Config,
    modules: &[Module],
    storage_root: &Path,
    plan: &mut MountPlan,
) -> KernelRuleSet {
    let mut rules = KernelRuleSet::default();
    let partitions = crate::planner::target_partitions(config);

    // Explicit hide rules configured on HymoFS modules.
    for module in modules {
        if !plan.hymofs_module_ids.contains(&module.id) {
            continue;
        }
        for rule in &module.rules {
            if rule.mode == Mode::Hide {
                rules.hides.push(resolve_path_for_hymofs(&rule.prefix));
            }
        }
    }

    // Lowest priority first: the kernel keeps the last write.
    for module in modules.iter().rev() {
        if !plan.hymofs_module_ids.contains(&module.id) {
            continue;
        }

        let walker = Walker {
            module,
            mod_path: storage_root.join(&module.id),
            default_mode: module.mode.resolved(true),
        };

        for part in &partitions {
            let part_root = walker.mod_path.join(part);
            if part_root.exists() {
                walker.walk(&part_root, plan, &mut rules);
            }
        }
    }

    rules
}

/// Install a rule set: adds first (the kernel auto-injects parent rules),
/// then merges, then hides. Individual failures are logged and skipped.
pub fn apply_rules(bridge: &KernelBridge, rules: &KernelRuleSet) {
    for rule in &rules.adds {
        if let Err(e) = bridge.add_rule(
            &rule.src,
            &rule.target.to_string_lossy(),
            rule.file_type,
        ) {
            warn!("add_rule {} failed: {}", rule.src, e);
        }
    }
    for rule in &rules.merges {
        if let Err(e) = bridge.add_merge_rule(&rule.src, &rule.target.to_string_lossy()) {
            warn!("add_merge_rule {} failed: {}", rule.src, e);
        }
    }
    for path in &rules.hides {
        if let Err(e) = bridge.hide_path(path) {
            warn!("hide_path {} failed: {}", path, e);
        }
    }
}

fn walk_directory_rules(
    bridge: &KernelBridge,
    target_base: &Path,
    root: &Path,
    dir: &Path,
    delete: bool,
) -> Result<()> {
    for entry in std::fs::read_dir(dir)?.flatten() {
        let path = entry.path();
        let Ok(meta) = std::fs::symlink_metadata(&path) else {
            continue;
        };

        if meta.is_dir() {
            walk_directory_rules(bridge, target_base, root, &path, delete)?;
            continue;
        }

        let Ok(rel) = path.strip_prefix(root) else {
            continue;
        };
        let target_path = target_base.join(rel);
        let target = target_path.to_string_lossy();

        match kind_of_metadata(&meta) {
            FileKind::Regular | FileKind::Symlink => {
                if delete {
                    let _ = bridge.delete_rule(&target);
                } else {
                    let _ = bridge.add_rule(
                        &target,
                        &path.to_string_lossy(),
                        RuleFileType::from_metadata(&meta),
                    );
                }
            }
            FileKind::Whiteout => {
                if delete {
                    let _ = bridge.delete_rule(&target);
                } else {
                    let _ = bridge.hide_path(&target);
                }
            }
            _ => {}
        }
    }
    Ok(())
}

/// Emit kernel rules for every file under `module_dir`, mapped onto
/// `target_base`. Used by the per-module add command.
pub fn add_rules_from_directory(
    bridge: &KernelBridge,
    target_base: &Path,
    module_dir: &Path,
) -> Result<()> {
    if !module_dir.is_dir() {
        return Err(crate::error::Error::Config(format!(
            "not a directory: {}",
            module_dir.display()
        )));
    }
    walk_directory_rules(bridge, target_base, module_dir, module_dir, false)
}

/// Remove the kernel rules a module's tree would have produced.
pub fn remove_rules_from_directory(
    bridge: &KernelBridge,
    target_base: &Path,
    module_dir: &Path,
) -> Result<()> {
    if !module_dir.is_dir() {
        return Err(crate::error::Error::Config(format!(
            "not a directory: {}",
            module_dir.display()
        )));
    }
    walk_directory_rules(bridge, target_base, module_dir, module_dir, true)
}

/// Recompute and install the kernel rule table for the current plan.
/// Clears all existing rules first; the run owns the whole table.
pub fn update_kernel_mappings(
    bridge: &KernelBridge,
    config: &Config,
    modules: &[Module],
    storage_root: &Path,
    plan: &mut MountPlan,
) -> Result<()> {
    if !bridge.usable(config.ignore_protocol_mismatch) {
        return Ok(());
    }

    bridge.clear_rules()?;
    let rules = collect_rules(config, modules, storage_root, plan);
    debug!(
        "collected {} adds, {} merges, {} hides",
        rules.adds.len(),
        rules.merges.len(),
        rules.hides.len()
    );
    apply_rules(bridge, &rules);

    info!("HymoFS mappings updated");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::ModuleRule;
    use crate::planner::OverlayOperation;
    use tempfile::tempdir;

    fn module(id: &str, mode: Mode, rules: Vec<(&str, Mode)>) -> Module {
        Module {
            id: id.to_string(),
            source_path: PathBuf::new(),
            mode,
            name: String::new(),
            version: String::new(),
            author: String::new(),
            description: String::new(),
            rules: rules
                .into_iter()
                .map(|(prefix, mode)| ModuleRule {
                    prefix: prefix.to_string(),
                    mode,
                })
                .collect(),
        }
    }

    fn plan_for(ids: &[&str]) -> MountPlan {
        MountPlan {
            hymofs_module_ids: ids.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_resolve_path_keeps_missing_suffix() {
        let dir = tempdir().unwrap();
        let existing = dir.path().join("a/b");
        std::fs::create_dir_all(&existing).unwrap();

        let input = format!("{}/a/b/c/d/file", dir.path().display());
        let resolved = resolve_path_for_hymofs(&input);
        let canonical_base = dir.path().join("a/b").canonicalize().unwrap();
        assert_eq!(
            resolved,
            format!("{}/c/d/file", canonical_base.display())
        );
    }

    #[test]
    fn test_resolve_path_follows_directory_symlinks() {
        let dir = tempdir().unwrap();
        let real = dir.path().join("real");
        std::fs::create_dir_all(&real).unwrap();
        std::os::unix::fs::symlink(&real, dir.path().join("alias")).unwrap();

        let input = format!("{}/alias/file", dir.path().display());
        let resolved = resolve_path_for_hymofs(&input);
        let canonical_real = real.canonicalize().unwrap();
        assert_eq!(resolved, format!("{}/file", canonical_real.display()));
    }

    #[test]
    fn test_single_file_becomes_add_rule() {
        let storage = tempdir().unwrap();
        let etc = storage.path().join("ZZZ/system/etc");
        std::fs::create_dir_all(&etc).unwrap();
        std::fs::write(etc.join("hosts"), b"127.0.0.1 localhost").unwrap();

        let config = Config::default();
        let modules = vec![module("ZZZ", Mode::Auto, vec![])];
        let mut plan = plan_for(&["ZZZ"]);

        let rules = collect_rules(&config, &modules, storage.path(), &mut plan);
        assert_eq!(rules.adds.len(), 1);
        assert_eq!(rules.adds[0].src, "/system/etc/hosts");
        assert_eq!(rules.adds[0].target, etc.join("hosts"));
        assert_eq!(rules.adds[0].file_type, RuleFileType::Regular);
        assert!(rules.merges.is_empty());
        assert!(rules.hides.is_empty());
    }

    #[test]
    fn test_overlay_covered_subtree_is_excluded_and_grafted() {
        let storage = tempdir().unwrap();
        let etc = storage.path().join("ZZZ/system/etc");
        std::fs::create_dir_all(&etc).unwrap();
        std::fs::write(etc.join("hosts"), b"x").unwrap();

        let config = Config::default();
        let modules = vec![module("ZZZ", Mode::Auto, vec![])];
        let mut plan = plan_for(&["ZZZ"]);
        plan.overlay_ops.push(OverlayOperation {
            target: "/system".to_string(),
            lowerdirs: vec![],
        });

        let rules = collect_rules(&config, &modules, storage.path(), &mut plan);
        assert!(rules.adds.is_empty());
        // The module's /system directory was grafted as an overlay layer.
        assert_eq!(
            plan.overlay_ops[0].lowerdirs,
            vec![storage.path().join("ZZZ/system")]
        );
    }

    #[test]
    fn test_configured_hide_rules_are_emitted() {
        let storage = tempdir().unwrap();
        let bin = storage.path().join("HID/system/bin");
        std::fs::create_dir_all(&bin).unwrap();
        std::fs::write(bin.join("tool"), b"x").unwrap();

        let config = Config::default();
        let modules = vec![module(
            "HID",
            Mode::Auto,
            vec![("/system/app/Bloat", Mode::Hide)],
        )];
        let mut plan = plan_for(&["HID"]);

        let rules = collect_rules(&config, &modules, storage.path(), &mut plan);
        assert_eq!(rules.hides, vec!["/system/app/Bloat".to_string()]);
    }

    #[test]
    fn test_reverse_priority_emission_order() {
        let storage = tempdir().unwrap();
        for id in ["AAA", "ZZZ"] {
            let etc = storage.path().join(id).join("system/etc");
            std::fs::create_dir_all(&etc).unwrap();
            std::fs::write(etc.join("hosts"), id).unwrap();
        }

        let config = Config::default();
        // Priority order Z->A, emission must be A then Z so Z wins.
        let modules = vec![
            module("ZZZ", Mode::Auto, vec![]),
            module("AAA", Mode::Auto, vec![]),
        ];
        let mut plan = plan_for(&["ZZZ", "AAA"]);

        let rules = collect_rules(&config, &modules, storage.path(), &mut plan);
        assert_eq!(rules.adds.len(), 2);
        assert!(rules.adds[0].target.starts_with(storage.path().join("AAA")));
        assert!(rules.adds[1].target.starts_with(storage.path().join("ZZZ")));
    }

    #[test]
    fn test_non_hymofs_rule_subtree_is_skipped_but_descended() {
        let storage = tempdir().unwrap();
        let root = storage.path().join("MIX/system");
        std::fs::create_dir_all(root.join("lib/modules")).unwrap();
        std::fs::write(root.join("lib/libfoo.so"), b"x").unwrap();
        std::fs::write(root.join("lib/modules/a.ko"), b"x").unwrap();

        let config = Config::default();
        let modules = vec![module(
            "MIX",
            Mode::HymoFs,
            vec![
                ("/system/lib", Mode::Magic),
                ("/system/lib/modules", Mode::HymoFs),
            ],
        )];
        let mut plan = plan_for(&["MIX"]);

        let rules = collect_rules(&config, &modules, storage.path(), &mut plan);
        let srcs: Vec<_> = rules.adds.iter().map(|r| r.src.as_str()).collect();
        assert_eq!(srcs, vec!["/system/lib/modules/a.ko"]);
    }

    #[test]
    fn test_symlink_never_replaces_live_directory() {
        // tempdir lives under /tmp, so "/tmp/<name>" is a live directory
        // the module symlink must not shadow.
        let live = tempdir().unwrap();
        let live_name = live.path().file_name().unwrap().to_str().unwrap().to_string();

        let storage = tempdir().unwrap();
        let part = storage.path().join("SYM/tmp");
        std::fs::create_dir_all(&part).unwrap();
        std::os::unix::fs::symlink("/nonexistent", part.join(&live_name)).unwrap();

        let mut config = Config::default();
        config.partitions = vec!["tmp".to_string()];
        let modules = vec![module("SYM", Mode::Auto, vec![])];
        let mut plan = plan_for(&["SYM"]);

        let rules = collect_rules(&config, &modules, storage.path(), &mut plan);
        assert!(rules.adds.is_empty());
    }
}
