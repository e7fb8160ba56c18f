//! Content sync: incrementally mirrors module trees into the staging root.

use crate::config::Config;
use crate::inventory::Module;
use crate::planner::target_partitions;
use crate::utils::{
    copy_path_context, has_files_recursive, lgetfilecon, lsetfilecon, remove_all, sync_dir,
};
use std::collections::BTreeSet;
use std::path::Path;
use tracing::{debug, error, info, warn};

fn has_content(module_path: &Path, partitions: &[String]) -> bool {
    partitions
        .iter()
        .any(|part| has_files_recursive(&module_path.join(part)))
}

/// A module is re-synced when its destination copy is missing or its
/// `module.prop` bytes differ from the source.
fn should_sync(src: &Path, dst: &Path) -> bool {
    if !dst.exists() {
        return true;
    }

    let src_prop = src.join("module.prop");
    let dst_prop = dst.join("module.prop");
    if !src_prop.exists() || !dst_prop.exists() {
        return true;
    }

    match (std::fs::read(&src_prop), std::fs::read(&dst_prop)) {
        (Ok(src_content), Ok(dst_content)) => src_content != dst_content,
        _ => true,
    }
}

/// Remove staging entries that no longer correspond to a current module.
fn prune_orphaned_modules(modules: &[Module], storage_root: &Path) {
    let Ok(entries) = std::fs::read_dir(storage_root) else {
        return;
    };

    let active_ids: BTreeSet<&str> = modules.iter().map(|m| m.id.as_str()).collect();

    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name == "lost+found" || name == "hymo" {
            continue;
        }
        if !active_ids.contains(name.as_str()) {
            info!("pruning orphaned module storage: {}", name);
            if let Err(e) = remove_all(&entry.path()) {
                warn!("failed to remove orphan {}: {}", name, e);
            }
        }
    }
}

/// Re-apply security labels under a synced module: files take the label of
/// their live-root counterpart when it exists; overlay scratch directories
/// inherit their parent's label.
fn recursive_context_repair(base: &Path, current: &Path) {
    if !current.exists() {
        return;
    }

    let file_name = current
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    if file_name == "upperdir" || file_name == "workdir" {
        if let Some(parent) = current.parent() {
            let parent_ctx = lgetfilecon(parent);
            let _ = lsetfilecon(current, &parent_ctx);
        }
    } else if let Ok(relative) = current.strip_prefix(base) {
        let system_path = Path::new("/").join(relative);
        if system_path.exists() {
            if let Err(e) = copy_path_context(&system_path, current) {
                debug!("context repair failed for {}: {}", current.display(), e);
            }
        }
    }

    if current.is_dir() {
        if let Ok(entries) = std::fs::read_dir(current) {
            for entry in entries.flatten() {
                recursive_context_repair(base, &entry.path());
            }
        }
    }
}

fn repair_module_contexts(module_root: &Path, module_id: &str, partitions: &[String]) {
    debug!("repairing security contexts for module {}", module_id);

    for partition in partitions {
        let part_root = module_root.join(partition);
        if part_root.is_dir() {
            recursive_context_repair(module_root, &part_root);
        }
    }
}

/// Mirror all current modules into the staging root, pruning orphans and
/// skipping modules whose staged copy is already up to date. Failures are
/// per-module; the run continues with whatever synced.
pub fn perform_sync(modules: &[Module], storage_root: &Path, config: &Config) {
    info!("starting module sync to {}", storage_root.display());

    let partitions = target_partitions(config);

    prune_orphaned_modules(modules, storage_root);

    for module in modules {
        let dst = storage_root.join(&module.id);

        if !has_content(&module.source_path, &partitions) {
            debug!("skipping empty module: {}", module.id);
            continue;
        }

        if !should_sync(&module.source_path, &dst) {
            debug!("skipping module: {} (up-to-date)", module.id);
            continue;
        }

        debug!("syncing module: {} (updated/new)", module.id);

        if dst.exists() {
            if let Err(e) = remove_all(&dst) {
                warn!("failed to clean target dir for {}: {}", module.id, e);
            }
        }

        match sync_dir(&module.source_path, &dst) {
            Ok(()) => repair_module_contexts(&dst, &module.id, &partitions),
            Err(e) => error!("failed to sync module {}: {}", module.id, e),
        }
    }

    info!("module sync completed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::Mode;
    use std::path::PathBuf;
    use tempfile::tempdir;

    fn module(id: &str, source: PathBuf) -> Module {
        Module {
            id: id.to_string(),
            source_path: source,
            mode: Mode::Auto,
            name: String::new(),
            version: String::new(),
            author: String::new(),
            description: String::new(),
            rules: Vec::new(),
        }
    }

    fn seed_module(store: &Path, id: &str, version: &str) -> PathBuf {
        let dir = store.join(id);
        std::fs::create_dir_all(dir.join("system/etc")).unwrap();
        std::fs::write(dir.join("system/etc/hosts"), id).unwrap();
        std::fs::write(dir.join("module.prop"), format!("version={}\n", version)).unwrap();
        dir
    }

    #[test]
    fn test_sync_copies_new_modules() {
        let store = tempdir().unwrap();
        let storage = tempdir().unwrap();
        let src = seed_module(store.path(), "mod_a", "1");

        perform_sync(
            &[module("mod_a", src)],
            storage.path(),
            &Config::default(),
        );

        assert_eq!(
            std::fs::read(storage.path().join("mod_a/system/etc/hosts")).unwrap(),
            b"mod_a"
        );
    }

    #[test]
    fn test_unchanged_module_is_not_recopied() {
        let store = tempdir().unwrap();
        let storage = tempdir().unwrap();
        let src = seed_module(store.path(), "mod_a", "1");
        let modules = [module("mod_a", src)];

        perform_sync(&modules, storage.path(), &Config::default());

        // Tamper with the staged copy; an up-to-date prop must prevent a
        // re-sync from clobbering it.
        let staged = storage.path().join("mod_a/system/etc/hosts");
        std::fs::write(&staged, b"tampered").unwrap();

        perform_sync(&modules, storage.path(), &Config::default());
        assert_eq!(std::fs::read(&staged).unwrap(), b"tampered");
    }

    #[test]
    fn test_changed_prop_triggers_resync() {
        let store = tempdir().unwrap();
        let storage = tempdir().unwrap();
        let src = seed_module(store.path(), "mod_a", "1");
        let modules = [module("mod_a", src.clone())];

        perform_sync(&modules, storage.path(), &Config::default());

        std::fs::write(src.join("module.prop"), "version=2\n").unwrap();
        std::fs::write(src.join("system/etc/hosts"), b"updated").unwrap();

        perform_sync(&modules, storage.path(), &Config::default());
        assert_eq!(
            std::fs::read(storage.path().join("mod_a/system/etc/hosts")).unwrap(),
            b"updated"
        );
    }

    #[test]
    fn test_orphans_are_pruned_internals_kept() {
        let store = tempdir().unwrap();
        let storage = tempdir().unwrap();
        let src = seed_module(store.path(), "mod_a", "1");

        std::fs::create_dir_all(storage.path().join("old_mod")).unwrap();
        std::fs::create_dir_all(storage.path().join("hymo")).unwrap();
        std::fs::create_dir_all(storage.path().join("lost+found")).unwrap();

        perform_sync(&[module("mod_a", src)], storage.path(), &Config::default());

        assert!(!storage.path().join("old_mod").exists());
        assert!(storage.path().join("hymo").exists());
        assert!(storage.path().join("lost+found").exists());
    }

    #[test]
    fn test_empty_module_is_skipped() {
        let store = tempdir().unwrap();
        let storage = tempdir().unwrap();
        let dir = store.path().join("empty");
        std::fs::create_dir_all(dir.join("system")).unwrap();

        perform_sync(&[module("empty", dir)], storage.path(), &Config::default());
        assert!(!storage.path().join("empty").exists());
    }
}
