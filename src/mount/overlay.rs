//! OverlayFS execution with mirror-backed child mount restoration.
//!
//! Each target is recursively bind-mounted to a private mirror first; the
//! mirror serves both as the lowest overlay layer and as the restore
//! source for child mounts that the new overlay would otherwise hide.

use crate::defs::OVERLAY_MIRROR_BASE;
use crate::error::{Error, Result};
use crate::kernel::KernelBridge;
use rustix::fs::CWD;
use rustix::mount::{
    fsconfig_create, fsconfig_set_string, fsmount, fsopen, mount, mount_change, move_mount,
    open_tree, unmount, FsMountFlags, FsOpenFlags, MountAttrFlags, MountFlags,
    MountPropagationFlags, MoveMountFlags, OpenTreeFlags, UnmountFlags,
};
use std::os::fd::AsFd;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Per-target mirror location: the target path with separators flattened.
fn mirror_path_for(target_root: &str) -> PathBuf {
    let encoded: String = target_root
        .chars()
        .map(|c| if c == '/' { '_' } else { c })
        .collect();
    Path::new(OVERLAY_MIRROR_BASE).join(encoded)
}

/// Pre-existing mounts strictly below `target_root`, sorted and deduped.
fn get_child_mounts(target_root: &str) -> Vec<String> {
    let Ok(process) = procfs::process::Process::myself() else {
        return Vec::new();
    };
    let Ok(mounts) = process.mountinfo() else {
        return Vec::new();
    };

    let target = Path::new(target_root);
    let mut seq: Vec<String> = mounts
        .0
        .iter()
        .filter(|m| m.mount_point.starts_with(target) && m.mount_point != target)
        .map(|m| m.mount_point.to_string_lossy().into_owned())
        .collect();
    seq.sort();
    seq.dedup();
    seq
}

fn mount_overlayfs_modern(
    lowerdir_config: &str,
    upperdir: Option<&str>,
    workdir: Option<&str>,
    dest: &Path,
    mount_source: &str,
) -> rustix::io::Result<()> {
    let fs = fsopen("overlay", FsOpenFlags::FSOPEN_CLOEXEC)?;
    let fs = fs.as_fd();
    fsconfig_set_string(fs, "lowerdir", lowerdir_config)?;
    if let (Some(upperdir), Some(workdir)) = (upperdir, workdir) {
        fsconfig_set_string(fs, "upperdir", upperdir)?;
        fsconfig_set_string(fs, "workdir", workdir)?;
    }
    fsconfig_set_string(fs, "source", mount_source)?;
    fsconfig_create(fs)?;
    let mnt = fsmount(fs, FsMountFlags::FSMOUNT_CLOEXEC, MountAttrFlags::empty())?;
    move_mount(
        mnt.as_fd(),
        "",
        CWD,
        dest,
        MoveMountFlags::MOVE_MOUNT_F_EMPTY_PATH,
    )
}

fn mount_overlayfs_legacy(
    lowerdir_config: &str,
    upperdir: Option<&str>,
    workdir: Option<&str>,
    dest: &Path,
    mount_source: &str,
) -> rustix::io::Result<()> {
    let mut data = format!("lowerdir={lowerdir_config}");
    if let (Some(upperdir), Some(workdir)) = (upperdir, workdir) {
        data = format!("{data},upperdir={upperdir},workdir={workdir}");
    }
    mount(mount_source, dest, "overlay", MountFlags::empty(), data)
}

fn mount_overlayfs(
    lowerdir_config: &str,
    upperdir: Option<&str>,
    workdir: Option<&str>,
    dest: &Path,
    mount_source: &str,
    bridge: &KernelBridge,
) -> Result<()> {
    debug!("lowerdir={}", lowerdir_config);

    if let Err(e) = mount_overlayfs_modern(lowerdir_config, upperdir, workdir, dest, mount_source)
    {
        warn!("fsopen mount failed: {}, fallback to legacy mount", e);
        mount_overlayfs_legacy(lowerdir_config, upperdir, workdir, dest, mount_source).map_err(
            |e| Error::Mount {
                target: dest.to_path_buf(),
                source: e.into(),
            },
        )?;
    }

    bridge.hide_overlay_xattrs(dest);
    Ok(())
}

/// Bind one path onto another, recursively. Tries the detached-tree API
/// first, then the legacy MS_BIND|MS_REC mount.
pub fn bind_mount(
    from: &Path,
    to: &Path,
    bridge: &KernelBridge,
    disable_umount: bool,
) -> Result<()> {
    debug!("bind mount {} -> {}", from.display(), to.display());

    let modern = open_tree(
        CWD,
        from,
        OpenTreeFlags::OPEN_TREE_CLOEXEC
            | OpenTreeFlags::OPEN_TREE_CLONE
            | OpenTreeFlags::AT_RECURSIVE,
    )
    .and_then(|tree| {
        move_mount(
            tree.as_fd(),
            "",
            CWD,
            to,
            MoveMountFlags::MOVE_MOUNT_F_EMPTY_PATH,
        )
    });

    if let Err(e) = modern {
        debug!(
            "open_tree bind of {} failed: {}, trying legacy mount",
            from.display(),
            e
        );
        rustix::mount::mount_recursive_bind(from, to).map_err(|e| Error::Mount {
            target: to.to_path_buf(),
            source: e.into(),
        })?;
    }

    if !disable_umount {
        bridge.send_unmountable(to);
    }
    Ok(())
}

/// Restore one pre-existing child mount under an overlaid target: plain
/// bind from the mirror when no module touches the subpath, a child
/// overlay when module directories exist, and a bind fallback when a
/// module file shadows the child mount point.
fn mount_overlay_child(
    mount_point: &str,
    relative: &str,
    module_roots: &[PathBuf],
    stock_root: &Path,
    mount_source: &str,
    bridge: &KernelBridge,
    disable_umount: bool,
) -> Result<()> {
    let rel = relative.trim_start_matches('/');

    let has_modification = module_roots.iter().any(|lower| lower.join(rel).exists());
    if !has_modification {
        return bind_mount(stock_root, Path::new(mount_point), bridge, disable_umount);
    }

    if !stock_root.is_dir() {
        return Ok(());
    }

    let mut lower_dirs: Vec<String> = Vec::new();
    for lower in module_roots {
        let path = lower.join(rel);
        if path.is_dir() {
            lower_dirs.push(path.to_string_lossy().into_owned());
        } else if path.exists() {
            // A module file shadows the child mount point; an overlay
            // there would be invalid, so restore the stock view.
            warn!(
                "file modification found at mount point {}, falling back to bind mount",
                mount_point
            );
            return bind_mount(stock_root, Path::new(mount_point), bridge, disable_umount);
        }
    }

    if lower_dirs.is_empty() {
        return bind_mount(stock_root, Path::new(mount_point), bridge, disable_umount);
    }

    let lowerdir_config = format!("{}:{}", lower_dirs.join(":"), stock_root.display());
    if let Err(e) = mount_overlayfs(
        &lowerdir_config,
        None,
        None,
        Path::new(mount_point),
        mount_source,
        bridge,
    ) {
        warn!(
            "failed to overlay child {}: {}, fallback to bind mount",
            mount_point, e
        );
        return bind_mount(stock_root, Path::new(mount_point), bridge, disable_umount);
    }

    if !disable_umount {
        bridge.send_unmountable(Path::new(mount_point));
    }
    Ok(())
}

/// Mount one overlay operation: mirror the target, stack module layers over
/// the mirror, and restore every pre-existing child mount from it.
#[allow(clippy::too_many_arguments)]
pub fn mount_overlay(
    target_root_raw: &str,
    module_roots: &[PathBuf],
    mount_source: &str,
    upperdir: Option<&Path>,
    workdir: Option<&Path>,
    partitions: &[String],
    bridge: &KernelBridge,
    disable_umount: bool,
) -> Result<()> {
    let target_root = match Path::new(target_root_raw).canonicalize() {
        Ok(resolved) => {
            let resolved = resolved.to_string_lossy().into_owned();
            if resolved != target_root_raw {
                debug!("resolved symlink: {} -> {}", target_root_raw, resolved);
            }
            resolved
        }
        Err(e) => {
            warn!("failed to resolve path {}: {}", target_root_raw, e);
            target_root_raw.to_string()
        }
    };

    info!("starting overlay mount for {}", target_root);

    let mirror_path = mirror_path_for(&target_root);
    crate::utils::ensure_dir_exists(&mirror_path)?;

    // Recursive bind captures the target's child mounts in the mirror;
    // marking it private keeps later changes from propagating back.
    rustix::mount::mount_recursive_bind(&target_root, &mirror_path).map_err(|e| {
        Error::Mount {
            target: PathBuf::from(&target_root),
            source: e.into(),
        }
    })?;
    let _ = mount_change(&mirror_path, MountPropagationFlags::PRIVATE);
    debug!("created mirror at {}", mirror_path.display());

    let mount_seq = get_child_mounts(&target_root);
    if !mount_seq.is_empty() {
        debug!(
            "found {} child mounts under {}",
            mount_seq.len(),
            target_root
        );
    }

    let mut lowerdir_config = String::new();
    for root in module_roots {
        lowerdir_config.push_str(&root.to_string_lossy());
        lowerdir_config.push(':');
    }
    lowerdir_config.push_str(&mirror_path.to_string_lossy());

    let upperdir = upperdir
        .filter(|p| p.exists())
        .map(|p| p.to_string_lossy().into_owned());
    let workdir = workdir
        .filter(|p| p.exists())
        .map(|p| p.to_string_lossy().into_owned());

    if let Err(e) = mount_overlayfs(
        &lowerdir_config,
        upperdir.as_deref(),
        workdir.as_deref(),
        Path::new(&target_root),
        mount_source,
        bridge,
    ) {
        // A failed attempt must not leave the mirror pinned.
        let _ = unmount(&mirror_path, UnmountFlags::DETACH);
        return Err(e);
    }

    if !disable_umount {
        bridge.send_unmountable(Path::new(&target_root));
    }

    for mount_point in &mount_seq {
        let relative = mount_point
            .strip_prefix(target_root.as_str())
            .unwrap_or(mount_point.as_str());
        let source_path = mirror_path.join(relative.trim_start_matches('/'));

        debug!(
            "restoring child mount {} from {}",
            mount_point,
            source_path.display()
        );
        if let Err(e) = mount_overlay_child(
            mount_point,
            relative,
            module_roots,
            &source_path,
            mount_source,
            bridge,
            disable_umount,
        ) {
            warn!("failed to restore child mount {}: {}", mount_point, e);
        }
    }

    // Restore partition directories reachable through the target (e.g.
    // /system/vendor) that the overlay now shadows.
    for part in partitions {
        let root_part = Path::new("/").join(part);
        let target_part = Path::new(&target_root).join(part);

        if !root_part.is_dir() {
            continue;
        }
        if !target_part.exists() || target_part.is_symlink() || !target_part.is_dir() {
            continue;
        }
        if mount_seq
            .iter()
            .any(|mp| Path::new(mp) == target_part.as_path())
        {
            continue;
        }

        info!(
            "restoring partition mount: {} -> {}",
            root_part.display(),
            target_part.display()
        );
        if let Err(e) = bind_mount(&root_part, &target_part, bridge, disable_umount) {
            warn!("failed to restore partition {}: {}", part, e);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mirror_path_encoding() {
        assert_eq!(
            mirror_path_for("/system"),
            Path::new("/dev/hymo_mirror/_system")
        );
        assert_eq!(
            mirror_path_for("/system_ext"),
            Path::new("/dev/hymo_mirror/_system_ext")
        );
    }

    #[test]
    fn test_child_mounts_are_strictly_below_target() {
        // The root always has child mounts on a Linux host (/proc at
        // minimum); every entry must be strictly below the target.
        let children = get_child_mounts("/");
        for child in &children {
            assert!(child.starts_with('/'));
            assert_ne!(child, "/");
        }
    }
}
