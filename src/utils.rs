//! Filesystem, xattr and process utilities shared across the pipeline.

use crate::defs::{DEFAULT_SELINUX_CONTEXT, RUN_DIR, SELINUX_XATTR};
use crate::error::{Error, Result};
use std::ffi::CString;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, error, info, warn};

/// Non-follow file typing over a module tree entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Regular,
    Directory,
    Symlink,
    /// Character device with device number 0, marking "hide this path".
    Whiteout,
    Other,
}

/// Type a path without following a trailing symlink.
pub fn file_kind(path: &Path) -> Result<FileKind> {
    let meta = std::fs::symlink_metadata(path)?;
    Ok(kind_of_metadata(&meta))
}

pub fn kind_of_metadata(meta: &std::fs::Metadata) -> FileKind {
    use std::os::unix::fs::FileTypeExt;
    let ft = meta.file_type();
    if ft.is_char_device() && meta.rdev() == 0 {
        FileKind::Whiteout
    } else if ft.is_dir() {
        FileKind::Directory
    } else if ft.is_symlink() {
        FileKind::Symlink
    } else if ft.is_file() {
        FileKind::Regular
    } else {
        FileKind::Other
    }
}

pub fn ensure_dir_exists(path: &Path) -> Result<()> {
    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }
    Ok(())
}

/// Read the security label of a path, not following symlinks.
/// Falls back to the default system label when the xattr is absent.
pub fn lgetfilecon(path: &Path) -> String {
    let mut buf = [0u8; 256];
    match rustix::fs::lgetxattr(path, SELINUX_XATTR, &mut buf) {
        Ok(len) => {
            let raw = &buf[..len];
            // Kernel-returned labels are NUL-terminated.
            let trimmed = raw.strip_suffix(&[0]).unwrap_or(raw);
            String::from_utf8_lossy(trimmed).into_owned()
        }
        Err(_) => DEFAULT_SELINUX_CONTEXT.to_string(),
    }
}

/// Set the security label of a path, not following symlinks.
pub fn lsetfilecon(path: &Path, context: &str) -> Result<()> {
    rustix::fs::lsetxattr(
        path,
        SELINUX_XATTR,
        context.as_bytes(),
        rustix::fs::XattrFlags::empty(),
    )?;
    Ok(())
}

/// Copy the security label from `src` to `dst`.
pub fn copy_path_context(src: &Path, dst: &Path) -> Result<()> {
    let context = if src.exists() {
        lgetfilecon(src)
    } else {
        DEFAULT_SELINUX_CONTEXT.to_string()
    };
    lsetfilecon(dst, &context)
}

/// Probe whether a mount supports security xattrs: write a scratch file,
/// set the label, and require it to read back unchanged.
pub fn is_xattr_supported(path: &Path) -> bool {
    let test_file = path.join(".xattr_test");
    let supported = std::fs::write(&test_file, b"test").is_ok()
        && lsetfilecon(&test_file, DEFAULT_SELINUX_CONTEXT).is_ok()
        && lgetfilecon(&test_file) == DEFAULT_SELINUX_CONTEXT;
    let _ = std::fs::remove_file(&test_file);
    supported
}

/// True if the directory contains at least one regular file or symlink,
/// recursively.
pub fn has_files_recursive(path: &Path) -> bool {
    if !path.is_dir() {
        return false;
    }
    let entries = match std::fs::read_dir(path) {
        Ok(entries) => entries,
        Err(_) => return true,
    };
    for entry in entries.flatten() {
        let ft = match entry.file_type() {
            Ok(ft) => ft,
            Err(_) => return true,
        };
        if ft.is_file() || ft.is_symlink() {
            return true;
        }
        if ft.is_dir() && has_files_recursive(&entry.path()) {
            return true;
        }
    }
    false
}

/// Remove a path of any kind, recursing into real directories.
pub fn remove_all(path: &Path) -> std::io::Result<()> {
    let meta = std::fs::symlink_metadata(path)?;
    if meta.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    }
}

fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    if !dst.exists() {
        std::fs::create_dir_all(dst)?;
        std::fs::set_permissions(dst, std::fs::metadata(src)?.permissions())?;
        let _ = lsetfilecon(dst, DEFAULT_SELINUX_CONTEXT);
    }

    for entry in std::fs::read_dir(src)?.flatten() {
        let dst_path = dst.join(entry.file_name());
        let ft = entry.file_type()?;

        if ft.is_dir() {
            copy_tree(&entry.path(), &dst_path)?;
        } else if ft.is_symlink() {
            let link_target = std::fs::read_link(entry.path())?;
            if dst_path.exists() {
                std::fs::remove_file(&dst_path)?;
            }
            std::os::unix::fs::symlink(&link_target, &dst_path)?;
            let _ = lsetfilecon(&dst_path, DEFAULT_SELINUX_CONTEXT);
        } else {
            std::fs::copy(entry.path(), &dst_path)?;
            std::fs::set_permissions(&dst_path, entry.metadata()?.permissions())?;
            let _ = lsetfilecon(&dst_path, DEFAULT_SELINUX_CONTEXT);
        }
    }
    Ok(())
}

/// Recursively copy `src` into `dst`, preserving permissions and applying
/// the default security label. Missing source is not an error.
pub fn sync_dir(src: &Path, dst: &Path) -> Result<()> {
    if !src.exists() {
        return Ok(());
    }
    ensure_dir_exists(dst)?;
    copy_tree(src, dst).map_err(|e| {
        error!("copy of {} failed: {}", src.display(), e);
        e
    })
}

/// Mount a fresh tmpfs at `target`.
pub fn mount_tmpfs(target: &Path) -> Result<()> {
    ensure_dir_exists(target)?;
    rustix::mount::mount(
        "tmpfs",
        target,
        "tmpfs",
        rustix::mount::MountFlags::empty(),
        "mode=0755",
    )
    .map_err(|e| Error::Mount {
        target: target.to_path_buf(),
        source: e.into(),
    })
}

/// Loop-mount an ext4 image. Delegates to mount(8), which handles loop
/// device setup robustly across devices.
pub fn mount_image(image_path: &Path, target: &Path) -> Result<()> {
    ensure_dir_exists(target)?;

    let status = Command::new("mount")
        .arg("-t")
        .arg("ext4")
        .arg("-o")
        .arg("loop,rw,noatime")
        .arg(image_path)
        .arg(target)
        .status()?;

    if !status.success() {
        return Err(Error::Mount {
            target: target.to_path_buf(),
            source: std::io::Error::other(format!(
                "mount of image {} exited with {}",
                image_path.display(),
                status
            )),
        });
    }
    Ok(())
}

/// Run e2fsck over the image. Exit codes 0-2 mean the filesystem is (now)
/// clean; anything above is a hard failure.
pub fn repair_image(image_path: &Path) -> bool {
    info!("running e2fsck on {}", image_path.display());

    let status = match Command::new("e2fsck")
        .arg("-y")
        .arg("-f")
        .arg(image_path)
        .status()
    {
        Ok(status) => status,
        Err(e) => {
            error!("e2fsck execution failed: {}", e);
            return false;
        }
    };

    match status.code() {
        Some(code) if code <= 2 => {
            info!("image repair successful (code {})", code);
            true
        }
        Some(code) => {
            error!("e2fsck failed with exit code {}", code);
            false
        }
        None => {
            error!("e2fsck terminated by signal");
            false
        }
    }
}

/// Test whether a path is a mount point in the current namespace.
pub fn is_mountpoint(path: &Path) -> bool {
    let mounts = match procfs::process::Process::myself().and_then(|p| p.mountinfo()) {
        Ok(mounts) => mounts,
        Err(_) => return false,
    };
    mounts.0.iter().any(|m| m.mount_point == path)
}

/// Rename the current process as seen in /proc comm.
pub fn camouflage_process(name: &str) -> bool {
    let Ok(name) = CString::new(name) else {
        return false;
    };
    let ret = unsafe { libc::prctl(libc::PR_SET_NAME, name.as_ptr() as libc::c_ulong, 0, 0, 0) };
    if ret != 0 {
        warn!(
            "failed to camouflage process: {}",
            std::io::Error::last_os_error()
        );
        return false;
    }
    true
}

/// Scratch workspace for the magic mount pass.
pub fn select_temp_dir() -> PathBuf {
    let run_dir = PathBuf::from(RUN_DIR);
    let _ = ensure_dir_exists(&run_dir);
    run_dir.join("workdir")
}

pub fn ensure_temp_dir(temp_dir: &Path) -> Result<()> {
    if temp_dir.exists() {
        std::fs::remove_dir_all(temp_dir)?;
    }
    std::fs::create_dir_all(temp_dir)?;
    Ok(())
}

pub fn cleanup_temp_dir(temp_dir: &Path) {
    if temp_dir.exists() {
        if let Err(e) = std::fs::remove_dir_all(temp_dir) {
            debug!("failed to clean up temp dir {}: {}", temp_dir.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_file_kind() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("plain");
        std::fs::write(&file, b"x").unwrap();
        let link = dir.path().join("link");
        std::os::unix::fs::symlink(&file, &link).unwrap();

        assert_eq!(file_kind(&file).unwrap(), FileKind::Regular);
        assert_eq!(file_kind(dir.path()).unwrap(), FileKind::Directory);
        assert_eq!(file_kind(&link).unwrap(), FileKind::Symlink);
    }

    #[test]
    fn test_has_files_recursive() {
        let dir = tempdir().unwrap();
        assert!(!has_files_recursive(dir.path()));

        let nested = dir.path().join("a/b/c");
        std::fs::create_dir_all(&nested).unwrap();
        assert!(!has_files_recursive(dir.path()));

        std::fs::write(nested.join("file"), b"x").unwrap();
        assert!(has_files_recursive(dir.path()));
    }

    #[test]
    fn test_sync_dir_copies_tree() {
        let src = tempdir().unwrap();
        let dst = tempdir().unwrap();

        std::fs::create_dir_all(src.path().join("system/bin")).unwrap();
        std::fs::write(src.path().join("system/bin/tool"), b"payload").unwrap();
        std::os::unix::fs::symlink("tool", src.path().join("system/bin/alias")).unwrap();

        let dest = dst.path().join("mod");
        sync_dir(src.path(), &dest).unwrap();

        assert_eq!(
            std::fs::read(dest.join("system/bin/tool")).unwrap(),
            b"payload"
        );
        assert_eq!(
            std::fs::read_link(dest.join("system/bin/alias")).unwrap(),
            PathBuf::from("tool")
        );
    }

    #[test]
    fn test_sync_dir_missing_source_is_noop() {
        let dst = tempdir().unwrap();
        sync_dir(Path::new("/nonexistent/source"), &dst.path().join("out")).unwrap();
        assert!(!dst.path().join("out").exists());
    }
}
