//! Mount planning: partitions module trees across the three backends.
//!
//! The planner resolves each module's default mode against backend
//! availability, applies per-path rule overrides by longest-prefix match,
//! and emits a `MountPlan` of overlay operations, magic mount roots and
//! per-backend module id sets.

use crate::config::Config;
use crate::defs::BUILTIN_PARTITIONS;
use crate::error::{Error, Result};
use crate::inventory::Module;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, warn};

/// Per-module or per-path mount mode. Closed set; unknown strings are
/// rejected at parse time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Auto,
    HymoFs,
    Overlay,
    Magic,
    /// Only meaningful for HymoFS: hide the path from lookups.
    Hide,
    None,
}

impl Mode {
    pub fn parse(s: &str) -> Result<Mode> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Mode::Auto),
            "hymofs" => Ok(Mode::HymoFs),
            "overlay" => Ok(Mode::Overlay),
            "magic" => Ok(Mode::Magic),
            "hide" => Ok(Mode::Hide),
            "none" => Ok(Mode::None),
            other => Err(Error::Config(format!(
                "unknown mount mode '{}' (expected auto, hymofs, overlay, magic, hide or none)",
                other
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Auto => "auto",
            Mode::HymoFs => "hymofs",
            Mode::Overlay => "overlay",
            Mode::Magic => "magic",
            Mode::Hide => "hide",
            Mode::None => "none",
        }
    }

    /// Resolve `auto` against backend availability.
    pub fn resolved(self, hymofs_usable: bool) -> Mode {
        match self {
            Mode::Auto => {
                if hymofs_usable {
                    Mode::HymoFs
                } else {
                    Mode::Overlay
                }
            }
            other => other,
        }
    }
}

impl FromStr for Mode {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        Mode::parse(s)
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// True if `prefix` is `path` itself or a directory-prefix of it.
pub fn prefix_matches(prefix: &str, path: &str) -> bool {
    if prefix == "/" {
        return path.starts_with('/');
    }
    path == prefix
        || (path.len() > prefix.len()
            && path.starts_with(prefix)
            && path.as_bytes()[prefix.len()] == b'/')
}

/// Longest-prefix rule resolution over a module's rules. Equal-length
/// prefixes resolve to the first inserted. Returns the module default when
/// nothing matches.
pub fn resolve_mode(module: &Module, path: &str, default_mode: Mode) -> (Mode, bool) {
    let mut mode = default_mode;
    let mut max_len = 0;
    let mut matched = false;
    for rule in &module.rules {
        if prefix_matches(&rule.prefix, path) && rule.prefix.len() > max_len {
            max_len = rule.prefix.len();
            mode = rule.mode;
            matched = true;
        }
    }
    (mode, matched)
}

/// One OverlayFS mount: a canonicalized target and its module layers,
/// highest priority first. The mirror of the live target is appended as
/// the lowest layer at execution time.
#[derive(Debug, Clone)]
pub struct OverlayOperation {
    pub target: String,
    pub lowerdirs: Vec<PathBuf>,
}

/// The partition of module content across backends for one run.
#[derive(Debug, Clone, Default)]
pub struct MountPlan {
    pub overlay_ops: Vec<OverlayOperation>,
    pub magic_module_paths: Vec<PathBuf>,
    pub overlay_module_ids: Vec<String>,
    pub magic_module_ids: Vec<String>,
    pub hymofs_module_ids: Vec<String>,
}

impl MountPlan {
    /// Whether `path` equals an overlay target or lies strictly under one.
    pub fn is_covered_by_overlay(&self, path: &str) -> bool {
        self.overlay_ops
            .iter()
            .any(|op| prefix_matches(&op.target, path))
    }
}

/// Complete partition list for a run: builtin targets plus configured
/// extras.
pub fn target_partitions(config: &Config) -> Vec<String> {
    let mut parts: Vec<String> = BUILTIN_PARTITIONS.iter().map(|s| s.to_string()).collect();
    parts.extend(config.partitions.iter().cloned());
    parts
}

fn has_entries(path: &Path) -> bool {
    path.is_dir()
        && std::fs::read_dir(path)
            .map(|mut d| d.next().is_some())
            .unwrap_or(false)
}

fn has_meaningful_content(base: &Path, partitions: &[String]) -> bool {
    partitions.iter().any(|part| has_entries(&base.join(part)))
}

/// Walk every entry of `dir` depth-first, handing each path and its
/// directory-ness to the visitor.
fn walk_entries(dir: &Path, visit: &mut impl FnMut(&Path, bool)) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
        visit(&path, is_dir);
        if is_dir {
            walk_entries(&path, visit);
        }
    }
}

/// Resolve the target of an overlay operation through at most one symlink
/// hop, then require an existing directory.
fn canonicalize_target(target: &str) -> Option<String> {
    let mut target_path = PathBuf::from(target);
    if target_path.is_symlink() {
        if let Ok(link) = std::fs::read_link(&target_path) {
            let resolved = if link.is_relative() {
                Path::new(target)
                    .parent()
                    .map(|p| p.join(&link))
                    .unwrap_or(link)
            } else {
                link
            };
            if let Ok(canonical) = resolved.canonicalize() {
                target_path = canonical;
            }
        }
    }

    if !target_path.is_dir() {
        return None;
    }
    Some(target_path.to_string_lossy().into_owned())
}

/// Produce the `MountPlan` for the given priority-ordered modules staged
/// under `storage_root`. `use_hymofs` reflects the bridge status combined
/// with the mismatch-override setting.
pub fn generate_plan(
    config: &Config,
    modules: &[Module],
    storage_root: &Path,
    use_hymofs: bool,
) -> MountPlan {
    let mut plan = MountPlan::default();

    let mut overlay_layers: BTreeMap<String, Vec<PathBuf>> = BTreeMap::new();
    let mut magic_paths: BTreeSet<PathBuf> = BTreeSet::new();
    let mut overlay_ids: BTreeSet<String> = BTreeSet::new();
    let mut magic_ids: BTreeSet<String> = BTreeSet::new();

    let partitions = target_partitions(config);

    for module in modules {
        let content_path = storage_root.join(&module.id);

        if !content_path.exists() || !has_meaningful_content(&content_path, &partitions) {
            continue;
        }

        let default_mode = module.mode.resolved(use_hymofs);

        if module.rules.is_empty() {
            match default_mode {
                Mode::None => continue,
                Mode::Magic => {
                    magic_paths.insert(content_path);
                    magic_ids.insert(module.id.clone());
                }
                Mode::Overlay => {
                    push_partition_layers(
                        &content_path,
                        &partitions,
                        &mut overlay_layers,
                        &mut overlay_ids,
                        &module.id,
                    );
                }
                _ if use_hymofs => plan.hymofs_module_ids.push(module.id.clone()),
                _ => {
                    push_partition_layers(
                        &content_path,
                        &partitions,
                        &mut overlay_layers,
                        &mut overlay_ids,
                        &module.id,
                    );
                }
            }
            continue;
        }

        // Mixed mode: per-entry rule resolution over the whole tree.
        let mut hymofs_active = false;
        let mut overlay_active = false;
        let mut magic_active = false;

        for part in &partitions {
            let part_root = content_path.join(part);
            if !part_root.exists() {
                continue;
            }

            // The walk below visits children only; the partition root's own
            // assignment is decided here.
            let part_virtual = format!("/{}", part);
            let (root_mode, root_rule_found) = resolve_mode(module, &part_virtual, default_mode);
            match root_mode {
                Mode::Overlay => {
                    let exact = module
                        .rules
                        .iter()
                        .any(|r| r.prefix == part_virtual && r.mode == Mode::Overlay);
                    if exact || (!root_rule_found && default_mode == Mode::Overlay) {
                        overlay_layers
                            .entry(part_virtual.clone())
                            .or_default()
                            .push(part_root.clone());
                        overlay_active = true;
                    }
                }
                Mode::Magic => {
                    let exact = module
                        .rules
                        .iter()
                        .any(|r| r.prefix == part_virtual && r.mode == Mode::Magic);
                    if exact {
                        magic_paths.insert(part_root.clone());
                        magic_active = true;
                    }
                }
                _ => {}
            }

            walk_entries(&part_root, &mut |entry, is_dir| {
                let Ok(rel) = entry.strip_prefix(&content_path) else {
                    return;
                };
                let path_str = format!("/{}", rel.to_string_lossy());

                let (mode, _) = resolve_mode(module, &path_str, default_mode);

                if mode == Mode::None {
                    return;
                }

                if is_dir {
                    match mode {
                        Mode::Overlay => {
                            let exact = module
                                .rules
                                .iter()
                                .any(|r| r.prefix == path_str && r.mode == Mode::Overlay);
                            if exact {
                                overlay_layers
                                    .entry(path_str.clone())
                                    .or_default()
                                    .push(entry.to_path_buf());
                                overlay_active = true;
                            }
                        }
                        Mode::Magic => {
                            let exact = module
                                .rules
                                .iter()
                                .any(|r| r.prefix == path_str && r.mode == Mode::Magic);
                            if exact {
                                magic_paths.insert(entry.to_path_buf());
                                magic_active = true;
                            }
                        }
                        // Directory contents are claimed later by the rule
                        // emitter.
                        Mode::HymoFs => {}
                        _ => {}
                    }
                }

                if mode == Mode::HymoFs {
                    hymofs_active = true;
                }
            });
        }

        // A declared magic default governs the unmatched remainder of the
        // tree; magic mount is only expressible at module-root granularity,
        // so the whole staged root joins the magic set.
        if default_mode == Mode::Magic && !magic_active {
            magic_paths.insert(content_path.clone());
            magic_ids.insert(module.id.clone());
        }

        if hymofs_active {
            plan.hymofs_module_ids.push(module.id.clone());
        }
        if overlay_active {
            overlay_ids.insert(module.id.clone());
        }
    }

    for (target, layers) in overlay_layers {
        if layers.is_empty() {
            continue;
        }
        match canonicalize_target(&target) {
            Some(resolved) => {
                if resolved != target {
                    debug!("resolved overlay target {} -> {}", target, resolved);
                }
                plan.overlay_ops.push(OverlayOperation {
                    target: resolved,
                    lowerdirs: layers,
                });
            }
            None => {
                warn!("dropping overlay target {}: not an existing directory", target);
            }
        }
    }

    plan.magic_module_paths = magic_paths.into_iter().collect();
    plan.overlay_module_ids = overlay_ids.into_iter().collect();
    plan.magic_module_ids = magic_ids.into_iter().collect();
    plan.hymofs_module_ids.dedup();

    plan
}

fn push_partition_layers(
    content_path: &Path,
    partitions: &[String],
    overlay_layers: &mut BTreeMap<String, Vec<PathBuf>>,
    overlay_ids: &mut BTreeSet<String>,
    module_id: &str,
) {
    let mut participates = false;
    for part in partitions {
        let part_path = content_path.join(part);
        if has_entries(&part_path) {
            overlay_layers
                .entry(format!("/{}", part))
                .or_default()
                .push(part_path);
            participates = true;
        }
    }
    if participates {
        overlay_ids.insert(module_id.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::ModuleRule;
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

    #[test]
    fn test_mode_parse_case_folds() {
        assert_eq!(Mode::parse("HymoFS").unwrap(), Mode::HymoFs);
        assert_eq!(Mode::parse(" overlay ").unwrap(), Mode::Overlay);
        assert_eq!(Mode::parse("MAGIC").unwrap(), Mode::Magic);
    }

    #[test]
    fn test_mode_parse_rejects_unknown() {
        let err = Mode::parse("overlayfs").unwrap_err();
        assert!(err.to_string().contains("overlayfs"));
    }

    #[test]
    fn test_prefix_matching_boundaries() {
        assert!(prefix_matches("/system/lib", "/system/lib"));
        assert!(prefix_matches("/system/lib", "/system/lib/modules/a.ko"));
        assert!(!prefix_matches("/system/lib", "/system/lib64"));
        // Root prefix matches every entry.
        assert!(prefix_matches("/", "/system/etc/hosts"));
    }

    #[test]
    fn test_longest_prefix_wins() {
        let m = module(
            "MMM",
            Mode::Overlay,
            vec![
                ("/system/lib", Mode::Magic),
                ("/system/lib/modules", Mode::HymoFs),
            ],
        );
        assert_eq!(
            resolve_mode(&m, "/system/lib/modules/a.ko", Mode::Overlay).0,
            Mode::HymoFs
        );
        assert_eq!(
            resolve_mode(&m, "/system/lib/libfoo.so", Mode::Overlay).0,
            Mode::Magic
        );
        assert_eq!(
            resolve_mode(&m, "/system/bin/sh", Mode::Overlay),
            (Mode::Overlay, false)
        );
    }

    #[test]
    fn test_equal_prefixes_first_insertion_wins() {
        let m = module(
            "X",
            Mode::Auto,
            vec![("/system/app", Mode::Magic), ("/system/app", Mode::Overlay)],
        );
        assert_eq!(resolve_mode(&m, "/system/app/F.apk", Mode::Auto).0, Mode::Magic);
    }

    #[test]
    fn test_hymofs_only_module_plan() {
        let storage = tempdir().unwrap();
        let hosts = storage.path().join("ZZZ/system/etc");
        std::fs::create_dir_all(&hosts).unwrap();
        std::fs::write(hosts.join("hosts"), b"127.0.0.1 localhost").unwrap();

        let config = Config::default();
        let modules = vec![module("ZZZ", Mode::Auto, vec![])];

        let plan = generate_plan(&config, &modules, storage.path(), true);
        assert_eq!(plan.hymofs_module_ids, vec!["ZZZ"]);
        assert!(plan.overlay_ops.is_empty());
        assert!(plan.magic_module_paths.is_empty());
    }

    #[test]
    fn test_empty_partition_module_is_skipped() {
        let storage = tempdir().unwrap();
        std::fs::create_dir_all(storage.path().join("EEE/system")).unwrap();

        let config = Config::default();
        let modules = vec![module("EEE", Mode::Auto, vec![])];

        let plan = generate_plan(&config, &modules, storage.path(), true);
        assert!(plan.hymofs_module_ids.is_empty());
        assert!(plan.overlay_ops.is_empty());
    }

    #[test]
    fn test_overlay_target_must_exist() {
        let storage = tempdir().unwrap();
        let bin = storage.path().join("AAA/system/bin");
        std::fs::create_dir_all(&bin).unwrap();
        std::fs::write(bin.join("tool"), b"x").unwrap();

        let config = Config::default();
        let modules = vec![module("AAA", Mode::Overlay, vec![])];

        // /system does not exist on the build host, so the op is dropped
        // while the module still counts as overlay-assigned.
        let plan = generate_plan(&config, &modules, storage.path(), false);
        assert!(plan.overlay_ops.is_empty());
        assert_eq!(plan.overlay_module_ids, vec!["AAA"]);
    }

    #[test]
    fn test_overlay_layers_respect_priority() {
        let storage = tempdir().unwrap();
        for id in ["AAA", "ZZZ"] {
            let dir = storage.path().join(id).join("tmp");
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(dir.join("marker"), id).unwrap();
        }

        let mut config = Config::default();
        config.partitions = vec!["tmp".to_string()];

        // Inventory order is Z->A; the planner must preserve it.
        let modules = vec![
            module("ZZZ", Mode::Overlay, vec![]),
            module("AAA", Mode::Overlay, vec![]),
        ];

        let plan = generate_plan(&config, &modules, storage.path(), false);
        assert_eq!(plan.overlay_ops.len(), 1);
        let op = &plan.overlay_ops[0];
        assert_eq!(op.lowerdirs.len(), 2);
        assert!(op.lowerdirs[0].starts_with(storage.path().join("ZZZ")));
        assert!(op.lowerdirs[1].starts_with(storage.path().join("AAA")));
        assert_eq!(plan.overlay_module_ids, vec!["AAA", "ZZZ"]);
    }

    #[test]
    fn test_rule_override_splits_backends() {
        let storage = tempdir().unwrap();
        let root = storage.path().join("MMM/system");
        std::fs::create_dir_all(root.join("lib/modules")).unwrap();
        std::fs::create_dir_all(root.join("bin")).unwrap();
        std::fs::write(root.join("lib/modules/a.ko"), b"x").unwrap();
        std::fs::write(root.join("lib/libfoo.so"), b"x").unwrap();
        std::fs::write(root.join("bin/tool"), b"x").unwrap();

        let config = Config::default();
        let modules = vec![module(
            "MMM",
            Mode::Overlay,
            vec![
                ("/system/lib", Mode::Magic),
                ("/system/lib/modules", Mode::HymoFs),
            ],
        )];

        let plan = generate_plan(&config, &modules, storage.path(), true);
        assert_eq!(plan.hymofs_module_ids, vec!["MMM"]);
        assert_eq!(plan.magic_module_paths, vec![root.join("lib")]);
        assert_eq!(plan.overlay_module_ids, vec!["MMM"]);
    }

    #[test]
    fn default_magic_with_unmatched_rules_takes_module_root() {
        let storage = tempdir().unwrap();
        let root = storage.path().join("GGG/system");
        std::fs::create_dir_all(root.join("bin")).unwrap();
        std::fs::create_dir_all(root.join("etc")).unwrap();
        std::fs::write(root.join("bin/tool"), b"x").unwrap();
        std::fs::write(root.join("etc/conf"), b"x").unwrap();

        let config = Config::default();
        let modules = vec![module(
            "GGG",
            Mode::Magic,
            vec![("/system/bin", Mode::HymoFs)],
        )];

        let plan = generate_plan(&config, &modules, storage.path(), true);
        // No exact magic rule fired, so the declared default claims the
        // whole staged root.
        assert_eq!(plan.magic_module_paths, vec![storage.path().join("GGG")]);
        assert_eq!(plan.magic_module_ids, vec!["GGG"]);
        assert_eq!(plan.hymofs_module_ids, vec!["GGG"]);
    }

    #[test]
    fn test_none_mode_module_is_skipped() {
        let storage = tempdir().unwrap();
        let dir = storage.path().join("NNN/system");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("f"), b"x").unwrap();

        let config = Config::default();
        let modules = vec![module("NNN", Mode::None, vec![])];

        let plan = generate_plan(&config, &modules, storage.path(), true);
        assert!(plan.hymofs_module_ids.is_empty());
        assert!(plan.overlay_module_ids.is_empty());
        assert!(plan.magic_module_ids.is_empty());
    }

    #[test]
    fn test_overlay_coverage_check() {
        let plan = MountPlan {
            overlay_ops: vec![OverlayOperation {
                target: "/system".to_string(),
                lowerdirs: vec![],
            }],
            ..Default::default()
        };
        assert!(plan.is_covered_by_overlay("/system"));
        assert!(plan.is_covered_by_overlay("/system/etc/hosts"));
        assert!(!plan.is_covered_by_overlay("/system_ext/app"));
        assert!(!plan.is_covered_by_overlay("/vendor/lib"));
    }
}
