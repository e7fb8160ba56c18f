//! Module inventory: discovery, property and rule parsing, priority order.

use crate::config::Config;
use crate::defs::{
    BUILTIN_PARTITIONS, DISABLE_FILE_NAME, REMOVE_FILE_NAME, SKIP_MOUNT_FILE_NAME,
};
use crate::planner::Mode;
use crate::utils::is_mountpoint;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{error, warn};

/// A per-path mode override declared by or for a module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleRule {
    pub prefix: String,
    pub mode: Mode,
}

/// One module directory tree, discovered fresh on every run.
#[derive(Debug, Clone)]
pub struct Module {
    pub id: String,
    pub source_path: PathBuf,
    /// Declared default mode; `auto` unless overridden.
    pub mode: Mode,
    pub name: String,
    pub version: String,
    pub author: String,
    pub description: String,
    /// Ordered per-path rules; insertion order breaks prefix-length ties.
    pub rules: Vec<ModuleRule>,
}

fn parse_module_prop(module_path: &Path, module: &mut Module) {
    let prop_file = module_path.join("module.prop");
    let Ok(content) = std::fs::read_to_string(&prop_file) else {
        return;
    };

    for line in content.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        match key {
            "name" => module.name = value.to_string(),
            "version" => module.version = value.to_string(),
            "author" => module.author = value.to_string(),
            "description" => module.description = value.to_string(),
            "mode" => match Mode::parse(value) {
                Ok(mode) => module.mode = mode,
                Err(e) => warn!("module.prop of {}: {}", module.id, e),
            },
            _ => {}
        }
    }
}

fn parse_module_rules(module_path: &Path, module: &mut Module) {
    let rules_file = module_path.join("hymo_rules.conf");
    let Ok(content) = std::fs::read_to_string(&rules_file) else {
        return;
    };

    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let Some((path, mode_str)) = trimmed.split_once('=') else {
            continue;
        };
        match Mode::parse(mode_str) {
            Ok(mode) => module.rules.push(ModuleRule {
                prefix: path.trim().to_string(),
                mode,
            }),
            Err(e) => warn!("hymo_rules.conf of {}: {}", module.id, e),
        }
    }
}

fn has_marker(path: &Path) -> bool {
    path.join(DISABLE_FILE_NAME).exists()
        || path.join(REMOVE_FILE_NAME).exists()
        || path.join(SKIP_MOUNT_FILE_NAME).exists()
}

/// Discover modules under `source_dir`, merging global config overrides.
/// The result is sorted by id descending (Z->A); earlier entries are
/// higher-priority layers everywhere downstream.
pub fn scan_modules(source_dir: &Path, config: &Config) -> Vec<Module> {
    let mut modules = Vec::new();

    let entries = match std::fs::read_dir(source_dir) {
        Ok(entries) => entries,
        Err(e) => {
            if source_dir.exists() {
                error!("failed to scan modules: {}", e);
            }
            return modules;
        }
    };

    for entry in entries.flatten() {
        if !entry.path().is_dir() {
            continue;
        }

        let id = entry.file_name().to_string_lossy().into_owned();
        if id == "hymo" || id == "lost+found" || id == ".git" {
            continue;
        }
        if has_marker(&entry.path()) {
            continue;
        }

        let mut module = Module {
            id: id.clone(),
            source_path: entry.path(),
            mode: Mode::Auto,
            name: String::new(),
            version: String::new(),
            author: String::new(),
            description: String::new(),
            rules: Vec::new(),
        };

        // Global rules take precedence by insertion order over the
        // module's own rule file.
        if let Some(rule_cfgs) = config.module_rules.get(&id) {
            for rule_cfg in rule_cfgs {
                module.rules.push(ModuleRule {
                    prefix: rule_cfg.path.clone(),
                    mode: rule_cfg.mode,
                });
            }
        }

        parse_module_rules(&entry.path(), &mut module);
        parse_module_prop(&entry.path(), &mut module);

        if let Some(global_mode) = config.module_modes.get(&id) {
            module.mode = *global_mode;
        }

        modules.push(module);
    }

    modules.sort_by(|a, b| b.id.cmp(&a.id));
    modules
}

/// Find module subdirectories that look like additional partitions: not a
/// builtin or metadata name, and matching a live-root directory that is a
/// mount point.
pub fn scan_partition_candidates(source_dir: &Path) -> Vec<String> {
    let mut candidates = BTreeSet::new();

    let ignored: BTreeSet<&str> = [
        "META-INF",
        "common",
        ".git",
        ".github",
        "lost+found",
    ]
    .into_iter()
    .chain(BUILTIN_PARTITIONS)
    .collect();

    let Ok(module_entries) = std::fs::read_dir(source_dir) else {
        return Vec::new();
    };

    for module_entry in module_entries.flatten() {
        if !module_entry.path().is_dir() {
            continue;
        }
        let Ok(entries) = std::fs::read_dir(module_entry.path()) else {
            continue;
        };
        for entry in entries.flatten() {
            if !entry.path().is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if ignored.contains(name.as_str()) {
                continue;
            }

            let root_path = Path::new("/").join(&name);
            if root_path.is_dir() && is_mountpoint(&root_path) {
                candidates.insert(name);
            }
        }
    }

    candidates.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn make_module(store: &Path, id: &str) -> PathBuf {
        let dir = store.join(id);
        std::fs::create_dir_all(dir.join("system")).unwrap();
        dir
    }

    #[test]
    fn test_disabled_modules_are_ignored() {
        let store = tempdir().unwrap();
        make_module(store.path(), "active");
        let disabled = make_module(store.path(), "disabled");
        std::fs::write(disabled.join("disable"), b"").unwrap();
        let removed = make_module(store.path(), "removed");
        std::fs::write(removed.join("remove"), b"").unwrap();
        let skipped = make_module(store.path(), "skipped");
        std::fs::write(skipped.join("skip_mount"), b"").unwrap();

        let modules = scan_modules(store.path(), &Config::default());
        let ids: Vec<_> = modules.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["active"]);
    }

    #[test]
    fn test_internal_directories_are_skipped() {
        let store = tempdir().unwrap();
        make_module(store.path(), "hymo");
        make_module(store.path(), "lost+found");
        make_module(store.path(), ".git");
        make_module(store.path(), "real");

        let modules = scan_modules(store.path(), &Config::default());
        assert_eq!(modules.len(), 1);
        assert_eq!(modules[0].id, "real");
    }

    #[test]
    fn test_priority_order_is_descending() {
        let store = tempdir().unwrap();
        make_module(store.path(), "alpha");
        make_module(store.path(), "Mid");
        make_module(store.path(), "zulu");

        let modules = scan_modules(store.path(), &Config::default());
        let ids: Vec<_> = modules.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["zulu", "alpha", "Mid"]);
    }

    #[test]
    fn test_module_prop_parsing() {
        let store = tempdir().unwrap();
        let dir = make_module(store.path(), "propped");
        std::fs::write(
            dir.join("module.prop"),
            "name=Propped\nversion=1.2\nauthor=someone\ndescription=a module\nmode=overlay\nunknown=x\n",
        )
        .unwrap();

        let modules = scan_modules(store.path(), &Config::default());
        let m = &modules[0];
        assert_eq!(m.name, "Propped");
        assert_eq!(m.version, "1.2");
        assert_eq!(m.author, "someone");
        assert_eq!(m.mode, Mode::Overlay);
    }

    #[test]
    fn test_global_mode_overrides_declared_mode() {
        let store = tempdir().unwrap();
        let dir = make_module(store.path(), "ruled");
        std::fs::write(dir.join("module.prop"), "mode=overlay\n").unwrap();

        let mut config = Config::default();
        config.module_modes.insert("ruled".to_string(), Mode::Magic);

        let modules = scan_modules(store.path(), &config);
        assert_eq!(modules[0].mode, Mode::Magic);
    }

    #[test]
    fn test_rule_merge_order_config_first() {
        let store = tempdir().unwrap();
        let dir = make_module(store.path(), "ruled");
        std::fs::write(dir.join("hymo_rules.conf"), "/system/bin = MAGIC\n# c\n").unwrap();

        let mut config = Config::default();
        config.module_rules.insert(
            "ruled".to_string(),
            vec![crate::config::RuleConfig {
                path: "/system/lib".to_string(),
                mode: Mode::HymoFs,
            }],
        );

        let modules = scan_modules(store.path(), &config);
        assert_eq!(
            modules[0].rules,
            vec![
                ModuleRule {
                    prefix: "/system/lib".to_string(),
                    mode: Mode::HymoFs
                },
                ModuleRule {
                    prefix: "/system/bin".to_string(),
                    mode: Mode::Magic
                },
            ]
        );
    }

    #[test]
    fn test_partition_candidates_require_live_mountpoint() {
        let store = tempdir().unwrap();
        let dir = make_module(store.path(), "mod");
        // /proc is always a mount point; a random name is not.
        std::fs::create_dir_all(dir.join("proc")).unwrap();
        std::fs::create_dir_all(dir.join("definitely_not_a_partition")).unwrap();

        let candidates = scan_partition_candidates(store.path());
        assert!(candidates.contains(&"proc".to_string()));
        assert!(!candidates.contains(&"definitely_not_a_partition".to_string()));
    }
}
