//! Staging storage backend.
//!
//! The mirror holding synced module content is backed by tmpfs when the
//! mount supports security xattrs, otherwise by an ext4 loop image that is
//! created on demand and repaired with e2fsck when a mount fails.

use crate::defs::{DEFAULT_SELINUX_CONTEXT, IMAGE_SIZE_MB};
use crate::error::{Error, Result};
use crate::state::RuntimeState;
use crate::utils::{
    ensure_dir_exists, is_xattr_supported, lsetfilecon, mount_image, mount_tmpfs, repair_image,
};
use serde_json::json;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, error, info, warn};

/// How the staging root is backed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageMode {
    Tmpfs,
    Ext4,
    /// Mirror setup failed; modules are grafted straight from the store.
    MagicOnly,
}

impl StorageMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageMode::Tmpfs => "tmpfs",
            StorageMode::Ext4 => "ext4",
            StorageMode::MagicOnly => "magic_only",
        }
    }
}

impl fmt::Display for StorageMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The staging mount owned by the current run.
#[derive(Debug, Clone)]
pub struct StorageHandle {
    pub mount_point: PathBuf,
    pub mode: StorageMode,
}

fn try_setup_tmpfs(target: &Path) -> bool {
    debug!("attempting tmpfs mode");

    if let Err(e) = mount_tmpfs(target) {
        warn!("tmpfs mount failed, falling back to image: {}", e);
        return false;
    }

    if is_xattr_supported(target) {
        info!("tmpfs mode active (xattr supported)");
        true
    } else {
        warn!("tmpfs does not support xattrs, unmounting");
        let _ = rustix::mount::unmount(target, rustix::mount::UnmountFlags::DETACH);
        false
    }
}

fn create_image(base_dir: &Path) -> Result<()> {
    info!("creating modules.img");
    let script = base_dir.join("createimg.sh");
    if !script.exists() {
        return Err(Error::Config(format!(
            "createimg.sh not found at {}",
            script.display()
        )));
    }

    let output = Command::new("sh")
        .arg(&script)
        .arg(base_dir)
        .arg(IMAGE_SIZE_MB.to_string())
        .output()?;

    let text = String::from_utf8_lossy(&output.stdout).into_owned()
        + &String::from_utf8_lossy(&output.stderr);
    if !output.status.success() {
        return Err(Error::Config(format!("failed to create image: {}", text)));
    }

    info!("image creation output: {}", text.trim());
    Ok(())
}

fn setup_ext4_image(target: &Path, image_path: &Path) -> Result<StorageMode> {
    debug!("falling back to ext4 image mode");

    if !image_path.exists() {
        warn!("modules.img not found, attempting to create it");
        let parent = image_path
            .parent()
            .ok_or_else(|| Error::Config(format!("image path {} has no parent", image_path.display())))?;
        create_image(parent)?;
    }

    if let Err(e) = mount_image(image_path, target) {
        warn!("initial image mount failed, attempting repair: {}", e);

        if !repair_image(image_path) {
            return Err(Error::Mount {
                target: target.to_path_buf(),
                source: std::io::Error::other("failed to repair modules.img"),
            });
        }
        info!("retrying mount after repair");
        mount_image(image_path, target)?;
    }

    info!("image mode active");
    Ok(StorageMode::Ext4)
}

/// Mount the staging root, preferring tmpfs-with-xattr over the ext4 loop
/// image. Any pre-existing mount at `target` is lazily detached first.
pub fn setup_storage(target: &Path, image_path: &Path, force_ext4: bool) -> Result<StorageHandle> {
    debug!("setting up storage at {}", target.display());

    if target.exists() {
        let _ = rustix::mount::unmount(target, rustix::mount::UnmountFlags::DETACH);
    }
    ensure_dir_exists(target)?;

    let mode = if !force_ext4 && try_setup_tmpfs(target) {
        StorageMode::Tmpfs
    } else {
        setup_ext4_image(target, image_path)?
    };

    Ok(StorageHandle {
        mount_point: target.to_path_buf(),
        mode,
    })
}

/// Fix up ownership, permissions and label on the storage root. Runs after
/// content sync on ext4, where the image's defaults are wrong for a
/// partition mirror.
pub fn finalize_storage_permissions(storage_root: &Path) {
    debug!("repairing storage root permissions");

    if let Err(e) = rustix::fs::chmod(storage_root, rustix::fs::Mode::from_raw_mode(0o755)) {
        warn!("failed to chmod storage root: {}", e);
    }
    if let Err(e) = rustix::fs::chown(
        storage_root,
        Some(rustix::fs::Uid::ROOT),
        Some(rustix::fs::Gid::ROOT),
    ) {
        warn!("failed to chown storage root: {}", e);
    }
    if let Err(e) = lsetfilecon(storage_root, DEFAULT_SELINUX_CONTEXT) {
        warn!("failed to set storage root context: {}", e);
    }
}

fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1}G", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.0}M", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.0}K", bytes as f64 / KB as f64)
    } else {
        format!("{}B", bytes)
    }
}

/// Report the staging filesystem's usage as JSON for tooling.
pub fn storage_status_json() -> serde_json::Value {
    let state = RuntimeState::load();

    let path = if state.mount_point.is_empty() {
        PathBuf::from(crate::defs::FALLBACK_CONTENT_DIR)
    } else {
        PathBuf::from(&state.mount_point)
    };

    if !path.exists() {
        return json!({ "error": "Not mounted" });
    }

    let fs_type = if state.storage_mode.is_empty() {
        "unknown".to_string()
    } else {
        state.storage_mode
    };

    let stats = match rustix::fs::statfs(&path) {
        Ok(stats) => stats,
        Err(e) => {
            error!("statfs failed for {}: {}", path.display(), e);
            return json!({ "error": "statfs failed" });
        }
    };

    let block_size = stats.f_bsize as u64;
    let total = stats.f_blocks as u64 * block_size;
    let free = stats.f_bfree as u64 * block_size;
    let used = total.saturating_sub(free);
    let percent = if total > 0 {
        (used * 100 / total) as u32
    } else {
        0
    };

    json!({
        "size": format_size(total),
        "used": format_size(used),
        "avail": format_size(free),
        "percent": format!("{}%", percent),
        "type": fs_type,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_mode_strings() {
        assert_eq!(StorageMode::Tmpfs.to_string(), "tmpfs");
        assert_eq!(StorageMode::Ext4.to_string(), "ext4");
        assert_eq!(StorageMode::MagicOnly.to_string(), "magic_only");
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512B");
        assert_eq!(format_size(2048), "2K");
        assert_eq!(format_size(5 * 1024 * 1024), "5M");
        assert_eq!(format_size(3 * 1024 * 1024 * 1024 / 2), "1.5G");
    }

    #[test]
    fn test_missing_image_script_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = create_image(dir.path()).unwrap_err();
        assert!(err.to_string().contains("createimg.sh"));
    }
}
