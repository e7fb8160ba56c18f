//! Status reporting: host module description updates and module listing.

use crate::config::Config;
use crate::defs::MODULE_PROP_FILE;
use crate::inventory::{scan_modules, Module};
use crate::planner::{target_partitions, Mode};
use crate::utils::has_files_recursive;
use serde_json::json;
use std::fmt::Write as _;
use std::path::Path;
use tracing::{debug, warn};

/// Outcome summary rendered into the host module's description line.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub success: bool,
    pub storage_mode: String,
    pub nuke_active: bool,
    pub overlay_count: usize,
    pub magic_count: usize,
    pub hymofs_count: usize,
    pub warning_msg: String,
    pub hymofs_active: bool,
}

fn render_description(summary: &RunSummary) -> String {
    let mut desc = String::new();
    desc.push_str(if summary.success { "😋" } else { "😭" });
    desc.push_str(" Hymo");
    if summary.nuke_active {
        desc.push_str(" 🐾");
    }
    let _ = write!(
        desc,
        " | fs: {} | Modules: {} HymoFS + {} Overlay + {} Magic",
        summary.storage_mode, summary.hymofs_count, summary.overlay_count, summary.magic_count
    );
    if !summary.warning_msg.is_empty() {
        let _ = write!(desc, " {}", summary.warning_msg);
    }
    desc
}

/// Rewrite the `description=` and `name=` lines of a module property file
/// in place, appending them when absent.
pub fn update_module_description_at(prop_file: &Path, summary: &RunSummary) {
    if !prop_file.exists() {
        warn!("module.prop not found, skipping update");
        return;
    }

    let Ok(content) = std::fs::read_to_string(prop_file) else {
        warn!("module.prop unreadable, skipping update");
        return;
    };

    let desc = render_description(summary);
    let new_name = if summary.hymofs_active {
        "Hymo - HymoFS Enabled"
    } else {
        "Hymo"
    };

    let mut out = String::new();
    let mut desc_updated = false;
    let mut name_updated = false;

    for line in content.lines() {
        if line.starts_with("description=") {
            let _ = writeln!(out, "description={}", desc);
            desc_updated = true;
        } else if line.starts_with("name=") {
            let _ = writeln!(out, "name={}", new_name);
            name_updated = true;
        } else {
            out.push_str(line);
            out.push('\n');
        }
    }
    if !desc_updated {
        let _ = writeln!(out, "description={}", desc);
    }
    if !name_updated {
        let _ = writeln!(out, "name={}", new_name);
    }

    if let Err(e) = std::fs::write(prop_file, out) {
        warn!("failed to write module.prop: {}", e);
        return;
    }
    debug!("updated module description and name");
}

pub fn update_module_description(summary: &RunSummary) {
    update_module_description_at(Path::new(MODULE_PROP_FILE), summary);
}

/// Machine-readable inventory listing with each module's resolved strategy.
pub fn module_list_json(
    config: &Config,
    modules: &[Module],
    hymofs_available: bool,
) -> serde_json::Value {
    let partitions = target_partitions(config);

    let filtered: Vec<&Module> = modules
        .iter()
        .filter(|m| {
            partitions
                .iter()
                .any(|part| has_files_recursive(&m.source_path.join(part)))
        })
        .collect();

    let entries: Vec<serde_json::Value> = filtered
        .iter()
        .map(|m| {
            let strategy = match m.mode {
                Mode::Auto => {
                    if hymofs_available {
                        Mode::HymoFs
                    } else {
                        Mode::Overlay
                    }
                }
                other => other,
            };
            json!({
                "id": m.id,
                "path": m.source_path.to_string_lossy(),
                "mode": m.mode.as_str(),
                "strategy": strategy.as_str(),
                "name": m.name,
                "version": m.version,
                "author": m.author,
                "description": m.description,
                "rules": m.rules.iter().map(|r| json!({
                    "path": r.prefix,
                    "mode": r.mode.as_str(),
                })).collect::<Vec<_>>(),
            })
        })
        .collect();

    json!({
        "count": entries.len(),
        "modules": entries,
    })
}

/// Scan and print the module list for tooling.
pub fn print_module_list(config: &Config, hymofs_available: bool) {
    let modules = scan_modules(&config.moduledir, config);
    let listing = module_list_json(config, &modules, hymofs_available);
    println!("{:#}", listing);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::tempdir;

    fn summary() -> RunSummary {
        RunSummary {
            success: true,
            storage_mode: "tmpfs".to_string(),
            hymofs_count: 2,
            overlay_count: 1,
            magic_count: 0,
            hymofs_active: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_description_rewrite_preserves_other_keys() {
        let dir = tempdir().unwrap();
        let prop = dir.path().join("module.prop");
        std::fs::write(
            &prop,
            "id=hymo\nname=Hymo\nversion=1\ndescription=old\nauthor=x\n",
        )
        .unwrap();

        update_module_description_at(&prop, &summary());

        let content = std::fs::read_to_string(&prop).unwrap();
        assert!(content.contains("id=hymo"));
        assert!(content.contains("author=x"));
        assert!(content.contains("name=Hymo - HymoFS Enabled"));
        assert!(content.contains("description=😋 Hymo | fs: tmpfs | Modules: 2 HymoFS + 1 Overlay + 0 Magic"));
        assert!(!content.contains("description=old"));
    }

    #[test]
    fn test_description_appended_when_missing() {
        let dir = tempdir().unwrap();
        let prop = dir.path().join("module.prop");
        std::fs::write(&prop, "id=hymo\n").unwrap();

        let mut s = summary();
        s.success = false;
        update_module_description_at(&prop, &s);

        let content = std::fs::read_to_string(&prop).unwrap();
        assert!(content.contains("description=😭 Hymo"));
        assert!(content.contains("name=Hymo - HymoFS Enabled"));
    }

    #[test]
    fn test_module_list_filters_empty_modules() {
        let store = tempdir().unwrap();
        let full = store.path().join("full/system");
        std::fs::create_dir_all(&full).unwrap();
        std::fs::write(full.join("f"), b"x").unwrap();
        std::fs::create_dir_all(store.path().join("hollow/system")).unwrap();

        let mut config = Config::default();
        config.moduledir = store.path().to_path_buf();

        let modules = scan_modules(store.path(), &config);
        let listing = module_list_json(&config, &modules, true);
        assert_eq!(listing["count"], 1);
        assert_eq!(listing["modules"][0]["id"], "full");
        assert_eq!(listing["modules"][0]["strategy"], "hymofs");
    }

    #[test]
    fn test_module_list_strategy_without_hymofs() {
        let module = Module {
            id: "m".to_string(),
            source_path: PathBuf::from("/nonexistent"),
            mode: Mode::Auto,
            name: String::new(),
            version: String::new(),
            author: String::new(),
            description: String::new(),
            rules: Vec::new(),
        };
        // No content -> filtered out regardless of strategy.
        let listing = module_list_json(&Config::default(), &[module], false);
        assert_eq!(listing["count"], 0);
    }
}
