//! Magic mount: commits the superposed node tree with tmpfs synthesis and
//! recursive bind mounts.

use crate::error::{Error, Result};
use crate::kernel::KernelBridge;
use crate::mount::node::{collect_magic_tree, Node, NodeFileType};
use crate::utils::{copy_path_context, ensure_dir_exists, lgetfilecon, lsetfilecon};
use rustix::mount::{
    mount, mount_bind, mount_change, mount_move, mount_remount, unmount, MountFlags,
    MountPropagationFlags, UnmountFlags,
};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

fn clone_permissions(src: &Path, dst: &Path) -> Result<()> {
    let metadata = std::fs::metadata(src)?;
    rustix::fs::chmod(dst, rustix::fs::Mode::from_raw_mode(metadata.mode()))?;
    rustix::fs::chown(
        dst,
        Some(unsafe { rustix::fs::Uid::from_raw(metadata.uid()) }),
        Some(unsafe { rustix::fs::Gid::from_raw(metadata.gid()) }),
    )?;
    Ok(())
}

fn clone_symlink(src: &Path, dst: &Path) -> Result<()> {
    let link_target = std::fs::read_link(src)?;
    std::os::unix::fs::symlink(&link_target, dst)?;
    let _ = lsetfilecon(dst, &lgetfilecon(src));
    Ok(())
}

/// Re-create one untouched live entry inside the tmpfs workspace so the
/// synthesized directory still presents the stock content.
fn mount_mirror(path: &Path, work_dir_path: &Path, entry: &std::fs::DirEntry) -> Result<()> {
    let target_path = path.join(entry.file_name());
    let work_path = work_dir_path.join(entry.file_name());
    let file_type = entry.file_type()?;

    if file_type.is_file() {
        std::fs::File::create(&work_path)?;
        mount_bind(&target_path, &work_path)?;
    } else if file_type.is_dir() {
        std::fs::create_dir(&work_path)?;
        clone_permissions(&target_path, &work_path)?;
        let _ = copy_path_context(&target_path, &work_path);
        for sub_entry in std::fs::read_dir(&target_path)?.flatten() {
            mount_mirror(&target_path, &work_path, &sub_entry)?;
        }
    } else if file_type.is_symlink() {
        clone_symlink(&target_path, &work_path)?;
    }

    Ok(())
}

fn mount_file(
    path: &Path,
    work_dir_path: &Path,
    node: &Node,
    has_tmpfs: bool,
    bridge: &KernelBridge,
    disable_umount: bool,
) -> Result<()> {
    let target_path = if has_tmpfs {
        std::fs::File::create(work_dir_path)?;
        work_dir_path
    } else {
        path
    };

    if let Some(module_path) = &node.module_path {
        mount_bind(module_path, target_path)?;
        if !disable_umount {
            bridge.send_unmountable(target_path);
        }
        let _ = mount_remount(target_path, MountFlags::RDONLY | MountFlags::BIND, "");
    }

    Ok(())
}

/// Whether committing this directory requires synthesizing a tmpfs layer:
/// the node replaces its live counterpart, or some child cannot be
/// expressed as a plain bind (symlinks, effective whiteouts, type
/// conflicts, entries with no live counterpart).
fn needs_tmpfs(node: &Node, path: &Path) -> Result<bool> {
    if node.replace && node.module_path.is_some() {
        return Ok(true);
    }

    for (name, child) in &node.children {
        let real_path = path.join(name);
        let need = match child.file_type {
            NodeFileType::Symlink => true,
            NodeFileType::Whiteout => real_path.exists(),
            _ => match std::fs::symlink_metadata(&real_path) {
                Ok(_) => {
                    let real_ft = NodeFileType::from_path(&real_path);
                    real_ft != child.file_type || real_ft == NodeFileType::Symlink
                }
                Err(_) => true,
            },
        };

        if need {
            if node.module_path.is_none() {
                error!(
                    "cannot create tmpfs on {} (no module source)",
                    path.display()
                );
                return Ok(false);
            }
            return Ok(true);
        }
    }

    Ok(false)
}

fn prepare_tmpfs_dir(path: &Path, work_dir_path: &Path, node: &Node) -> Result<()> {
    std::fs::create_dir_all(work_dir_path)?;

    let src_path = if path.exists() {
        path.to_path_buf()
    } else {
        node.module_path
            .clone()
            .ok_or_else(|| Error::Plan(format!("no source for tmpfs dir {}", path.display())))?
    };
    clone_permissions(&src_path, work_dir_path)?;
    let _ = copy_path_context(&src_path, work_dir_path);

    mount_bind(work_dir_path, work_dir_path)?;
    Ok(())
}

fn finalize_tmpfs_dir(
    path: &Path,
    work_dir_path: &Path,
    bridge: &KernelBridge,
    disable_umount: bool,
) -> Result<()> {
    let _ = mount_remount(work_dir_path, MountFlags::RDONLY | MountFlags::BIND, "");
    mount_move(work_dir_path, path)?;
    let _ = mount_change(path, MountPropagationFlags::PRIVATE);

    if !disable_umount {
        bridge.send_unmountable(path);
    }
    Ok(())
}

fn mount_directory(
    path: &Path,
    work_dir_path: &Path,
    node: Node,
    has_tmpfs: bool,
    bridge: &KernelBridge,
    disable_umount: bool,
) -> Result<()> {
    let create_tmpfs = !has_tmpfs && needs_tmpfs(&node, path)?;
    let effective_tmpfs = has_tmpfs || create_tmpfs;

    if create_tmpfs {
        prepare_tmpfs_dir(path, work_dir_path, &node)?;
    } else if has_tmpfs && !work_dir_path.exists() {
        std::fs::create_dir(work_dir_path)?;
        let src_path = if path.exists() {
            path.to_path_buf()
        } else if let Some(module_path) = &node.module_path {
            module_path.clone()
        } else {
            path.to_path_buf()
        };
        let _ = clone_permissions(&src_path, work_dir_path);
        let _ = copy_path_context(&src_path, work_dir_path);
    }

    // Mirror untouched live entries first so the synthesized directory
    // keeps the stock view, unless the module replaces it outright.
    if effective_tmpfs && path.exists() && !node.replace {
        if let Ok(entries) = std::fs::read_dir(path) {
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().into_owned();
                if node.children.contains_key(&name) {
                    continue;
                }
                if let Err(e) = mount_mirror(path, work_dir_path, &entry) {
                    warn!("failed to mirror {}/{}: {}", path.display(), name, e);
                }
            }
        }
    }

    for (_, child) in node.children {
        if child.skip {
            continue;
        }
        let child_name = child.name.clone();
        if let Err(e) = do_magic_mount(
            path,
            work_dir_path,
            child,
            effective_tmpfs,
            bridge,
            disable_umount,
        ) {
            warn!(
                "magic mount of {}/{} failed: {}",
                path.display(),
                child_name,
                e
            );
        }
    }

    if create_tmpfs {
        finalize_tmpfs_dir(path, work_dir_path, bridge, disable_umount)?;
    }

    Ok(())
}

fn do_magic_mount(
    path: &Path,
    work_dir_path: &Path,
    node: Node,
    has_tmpfs: bool,
    bridge: &KernelBridge,
    disable_umount: bool,
) -> Result<()> {
    let target_path = path.join(&node.name);
    let target_work_path = work_dir_path.join(&node.name);

    match node.file_type {
        NodeFileType::RegularFile => mount_file(
            &target_path,
            &target_work_path,
            &node,
            has_tmpfs,
            bridge,
            disable_umount,
        ),
        NodeFileType::Symlink => {
            if let Some(module_path) = &node.module_path {
                clone_symlink(module_path, &target_work_path)?;
            }
            Ok(())
        }
        NodeFileType::Directory => mount_directory(
            &target_path,
            &target_work_path,
            node,
            has_tmpfs,
            bridge,
            disable_umount,
        ),
        // Whiteouts are never committed; hiding happens by omission inside
        // a tmpfs-synthesized parent.
        NodeFileType::Whiteout => Ok(()),
    }
}

/// Graft the given magic entries over the live tree. Builds the superposed
/// node tree, commits it depth-first from a tmpfs scratch workspace, and
/// tears the workspace down afterwards.
#[allow(clippy::too_many_arguments)]
pub fn mount_partitions(
    tmp_path: &Path,
    module_paths: &[PathBuf],
    mount_source: &str,
    extra_partitions: &[String],
    storage_root: &Path,
    bridge: &KernelBridge,
    disable_umount: bool,
) -> Result<()> {
    let Some(root) = collect_magic_tree(module_paths, storage_root, extra_partitions) else {
        info!("no files to magic mount");
        return Ok(());
    };

    let tmp_dir = tmp_path.join("workdir");
    ensure_dir_exists(&tmp_dir)?;

    mount(mount_source, &tmp_dir, "tmpfs", MountFlags::empty(), "").map_err(|e| Error::Mount {
        target: tmp_dir.clone(),
        source: e.into(),
    })?;
    let _ = mount_change(&tmp_dir, MountPropagationFlags::PRIVATE);

    let result = do_magic_mount(Path::new("/"), &tmp_dir, root, false, bridge, disable_umount);

    if let Err(e) = unmount(&tmp_dir, UnmountFlags::DETACH) {
        error!("failed to unmount scratch workspace: {}", e);
    }
    let _ = std::fs::remove_dir(&tmp_dir);

    debug!("magic mount pass finished");
    result
}
