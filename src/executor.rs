//! Plan execution: overlay operations with per-operation fallback into a
//! single magic mount pass.

use crate::config::Config;
use crate::kernel::KernelBridge;
use crate::mount::magic::mount_partitions;
use crate::mount::overlay::mount_overlay;
use crate::planner::{target_partitions, MountPlan};
use crate::utils::{cleanup_temp_dir, ensure_temp_dir, select_temp_dir};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

/// Final per-backend assignment after fallbacks.
#[derive(Debug, Clone, Default)]
pub struct ExecutionResult {
    pub overlay_module_ids: Vec<String>,
    pub magic_module_ids: Vec<String>,
}

/// Map a plan path (an overlay layer or magic entry) back to the staged
/// module root and its id. Layers segregated into `.overlay_staging` keep
/// their real module id.
fn module_root_and_id(storage_root: &Path, path: &Path) -> Option<(PathBuf, String)> {
    let rel = path.strip_prefix(storage_root).ok()?;
    let mut components = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned());

    let first = components.next()?;
    if first == ".overlay_staging" {
        let id = components.next()?;
        return Some((storage_root.join(".overlay_staging").join(&id), id));
    }
    Some((storage_root.join(&first), first))
}

fn magic_id_of(storage_root: &Path, path: &Path) -> Option<String> {
    if let Some((_, id)) = module_root_and_id(storage_root, path) {
        return Some(id);
    }
    path.file_name().map(|n| n.to_string_lossy().into_owned())
}

/// Run the plan's overlay operations, demoting every module involved in a
/// failed operation to the magic queue, then run the magic pass once over
/// the union of planned and demoted roots.
pub fn execute_plan(
    plan: &MountPlan,
    config: &Config,
    storage_root: &Path,
    bridge: &KernelBridge,
) -> ExecutionResult {
    if !plan.hymofs_module_ids.is_empty() {
        info!("HymoFS modules are served by the kernel rule table");
    }

    let partitions = target_partitions(config);
    let mut magic_queue: BTreeSet<PathBuf> = plan.magic_module_paths.iter().cloned().collect();
    let mut fallback_ids: BTreeSet<String> = BTreeSet::new();

    for op in &plan.overlay_ops {
        debug!(
            "mounting {} [overlay] ({} layers)",
            op.target,
            op.lowerdirs.len()
        );

        if let Err(e) = mount_overlay(
            &op.target,
            &op.lowerdirs,
            &config.mountsource,
            None,
            None,
            &partitions,
            bridge,
            config.disable_umount,
        ) {
            warn!("OverlayFS failed for {}: {}, triggering fallback", op.target, e);

            for layer in &op.lowerdirs {
                if let Some((root, id)) = module_root_and_id(storage_root, layer) {
                    magic_queue.insert(root);
                    fallback_ids.insert(id);
                } else if let Some(parent) = layer.parent() {
                    magic_queue.insert(parent.to_path_buf());
                    if let Some(name) = parent.file_name() {
                        fallback_ids.insert(name.to_string_lossy().into_owned());
                    }
                }
            }
        }
    }

    let overlay_module_ids: Vec<String> = plan
        .overlay_module_ids
        .iter()
        .filter(|id| !fallback_ids.contains(id.as_str()))
        .cloned()
        .collect();

    if !fallback_ids.is_empty() {
        info!("{} modules fell back to magic mount", fallback_ids.len());
    }

    let mut magic_module_ids: BTreeSet<String> = magic_queue
        .iter()
        .filter_map(|path| magic_id_of(storage_root, path))
        .collect();

    if !magic_queue.is_empty() {
        let tempdir = config.tempdir.clone().unwrap_or_else(select_temp_dir);
        let queue: Vec<PathBuf> = magic_queue.into_iter().collect();

        info!("executing magic mount for {} roots", queue.len());

        if let Err(e) = ensure_temp_dir(&tempdir) {
            error!("cannot prepare magic mount workspace: {}", e);
            magic_module_ids.clear();
        } else {
            if let Err(e) = mount_partitions(
                &tempdir,
                &queue,
                &config.mountsource,
                &config.partitions,
                storage_root,
                bridge,
                config.disable_umount,
            ) {
                error!("magic mount critical failure: {}", e);
                magic_module_ids.clear();
            }
            cleanup_temp_dir(&tempdir);
        }
    }

    ExecutionResult {
        overlay_module_ids,
        magic_module_ids: magic_module_ids.into_iter().collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layer_maps_to_module_root() {
        let storage = Path::new("/mnt/img");
        let (root, id) =
            module_root_and_id(storage, Path::new("/mnt/img/ModuleA/system")).unwrap();
        assert_eq!(root, Path::new("/mnt/img/ModuleA"));
        assert_eq!(id, "ModuleA");

        // Rule-exact layers deep inside a module still yield the module id.
        let (root, id) =
            module_root_and_id(storage, Path::new("/mnt/img/ModuleB/system/lib")).unwrap();
        assert_eq!(root, Path::new("/mnt/img/ModuleB"));
        assert_eq!(id, "ModuleB");
    }

    #[test]
    fn test_segregated_layer_keeps_module_id() {
        let storage = Path::new("/mnt/img");
        let (root, id) = module_root_and_id(
            storage,
            Path::new("/mnt/img/.overlay_staging/ModuleC/system"),
        )
        .unwrap();
        assert_eq!(root, Path::new("/mnt/img/.overlay_staging/ModuleC"));
        assert_eq!(id, "ModuleC");
    }

    #[test]
    fn test_foreign_path_is_rejected() {
        let storage = Path::new("/mnt/img");
        assert!(module_root_and_id(storage, Path::new("/data/adb/modules/X")).is_none());
        assert_eq!(
            magic_id_of(storage, Path::new("/data/adb/modules/X")),
            Some("X".to_string())
        );
    }
}
