//! Typed capability layer over the HymoFS channel and the host-kernel
//! auxiliary ioctls.
//!
//! All kernel-facing caches (the device channel, the probed protocol status
//! and the host-kernel fd) live in one `KernelBridge` value constructed at
//! startup and passed through the pipeline.

use crate::defs::{
    KSU_INSTALL_MAGIC1, KSU_INSTALL_MAGIC2, KSU_IOCTL_ADD_TRY_UMOUNT, KSU_IOCTL_NUKE_EXT4_SYSFS,
};
use crate::error::{Error, Result};
use crate::kernel::ioctl::{HymoChannel, HYMO_PROTOCOL_VERSION};
use libc::c_int;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::ffi::CString;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Outcome of probing the kernel channel, cached for the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HymoStatus {
    Available,
    NotPresent,
    KernelTooOld,
    ModuleTooOld,
}

/// File-type discriminator carried by ADD_RULE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleFileType {
    Regular,
    Directory,
    Symlink,
    CharDevice,
    BlockDevice,
    Fifo,
    Socket,
    Unknown,
}

impl RuleFileType {
    pub fn from_metadata(meta: &std::fs::Metadata) -> Self {
        use std::os::unix::fs::FileTypeExt;
        let ft = meta.file_type();
        if ft.is_file() {
            RuleFileType::Regular
        } else if ft.is_dir() {
            RuleFileType::Directory
        } else if ft.is_symlink() {
            RuleFileType::Symlink
        } else if ft.is_char_device() {
            RuleFileType::CharDevice
        } else if ft.is_block_device() {
            RuleFileType::BlockDevice
        } else if ft.is_fifo() {
            RuleFileType::Fifo
        } else if ft.is_socket() {
            RuleFileType::Socket
        } else {
            RuleFileType::Unknown
        }
    }

    /// Map a raw DT_* value back; unknown values fall through.
    pub fn from_raw(value: c_int) -> Self {
        match value as u8 {
            libc::DT_REG => RuleFileType::Regular,
            libc::DT_DIR => RuleFileType::Directory,
            libc::DT_LNK => RuleFileType::Symlink,
            libc::DT_CHR => RuleFileType::CharDevice,
            libc::DT_BLK => RuleFileType::BlockDevice,
            libc::DT_FIFO => RuleFileType::Fifo,
            libc::DT_SOCK => RuleFileType::Socket,
            _ => RuleFileType::Unknown,
        }
    }

    /// The kernel shares the dirent DT_* encoding.
    pub fn as_raw(self) -> c_int {
        let dt = match self {
            RuleFileType::Regular => libc::DT_REG,
            RuleFileType::Directory => libc::DT_DIR,
            RuleFileType::Symlink => libc::DT_LNK,
            RuleFileType::CharDevice => libc::DT_CHR,
            RuleFileType::BlockDevice => libc::DT_BLK,
            RuleFileType::Fifo => libc::DT_FIFO,
            RuleFileType::Socket => libc::DT_SOCK,
            RuleFileType::Unknown => libc::DT_UNKNOWN,
        };
        dt as c_int
    }
}

#[repr(C)]
struct KsuAddTryUmount {
    arg: u64,
    flags: u32,
    mode: u8,
}

#[repr(C)]
struct NukeExt4SysfsCmd {
    arg: u64,
}

#[derive(Default)]
struct KsuFd {
    checked: bool,
    fd: c_int,
}

/// Kernel-facing context for one controller run.
pub struct KernelBridge {
    channel: HymoChannel,
    status: HymoStatus,
    ksu: Mutex<KsuFd>,
    sent_unmounts: Mutex<HashSet<PathBuf>>,
}

impl KernelBridge {
    pub const EXPECTED_PROTOCOL_VERSION: i32 = HYMO_PROTOCOL_VERSION;

    /// Open the channel and probe the protocol version once.
    pub fn connect() -> Self {
        let channel = HymoChannel::open();
        let status = match channel.get_version() {
            Err(_) => {
                warn!("HymoFS probe: channel did not answer, treating as not present");
                HymoStatus::NotPresent
            }
            Ok(v) if v < 0 => HymoStatus::NotPresent,
            Ok(v) if v < Self::EXPECTED_PROTOCOL_VERSION => {
                warn!(
                    "HymoFS probe: kernel protocol {} older than expected {}",
                    v,
                    Self::EXPECTED_PROTOCOL_VERSION
                );
                HymoStatus::KernelTooOld
            }
            Ok(v) if v > Self::EXPECTED_PROTOCOL_VERSION => {
                warn!(
                    "HymoFS probe: kernel protocol {} newer than expected {}",
                    v,
                    Self::EXPECTED_PROTOCOL_VERSION
                );
                HymoStatus::ModuleTooOld
            }
            Ok(v) => {
                info!("HymoFS available (protocol {})", v);
                HymoStatus::Available
            }
        };

        Self {
            channel,
            status,
            ksu: Mutex::new(KsuFd::default()),
            sent_unmounts: Mutex::new(HashSet::new()),
        }
    }

    pub fn status(&self) -> HymoStatus {
        self.status
    }

    pub fn is_available(&self) -> bool {
        self.status == HymoStatus::Available
    }

    /// Whether the planner may route modules through HymoFS: a matching
    /// protocol, or a version mismatch the configuration forces past.
    pub fn usable(&self, ignore_protocol_mismatch: bool) -> bool {
        match self.status {
            HymoStatus::Available => true,
            HymoStatus::KernelTooOld | HymoStatus::ModuleTooOld => ignore_protocol_mismatch,
            HymoStatus::NotPresent => false,
        }
    }

    /// Error out unless the kernel speaks exactly our protocol revision.
    pub fn require_available(&self) -> Result<()> {
        match self.status {
            HymoStatus::Available => Ok(()),
            HymoStatus::NotPresent => Err(Error::KernelUnavailable),
            HymoStatus::KernelTooOld => Err(Error::KernelVersionMismatch(
                "kernel protocol is older than this controller".to_string(),
            )),
            HymoStatus::ModuleTooOld => Err(Error::KernelVersionMismatch(
                "kernel protocol is newer than this controller".to_string(),
            )),
        }
    }

    pub fn protocol_version(&self) -> Result<i32> {
        self.channel.get_version().map_err(Error::Io)
    }

    pub fn clear_rules(&self) -> Result<()> {
        debug!("HymoFS: clearing all rules");
        self.channel.clear_rules().map_err(Error::Io)
    }

    pub fn add_rule(&self, src: &str, target: &str, rule_type: RuleFileType) -> Result<()> {
        debug!("HymoFS: add rule {} -> {} ({:?})", src, target, rule_type);
        self.channel
            .add_rule(src, target, rule_type.as_raw())
            .map_err(Error::Io)
    }

    pub fn add_merge_rule(&self, src: &str, target: &str) -> Result<()> {
        debug!("HymoFS: merge rule {} <- {}", src, target);
        self.channel.add_merge_rule(src, target).map_err(Error::Io)
    }

    pub fn delete_rule(&self, src: &str) -> Result<()> {
        debug!("HymoFS: delete rule {}", src);
        self.channel.delete_rule(src).map_err(Error::Io)
    }

    pub fn hide_path(&self, path: &str) -> Result<()> {
        debug!("HymoFS: hide {}", path);
        self.channel.hide_path(path).map_err(Error::Io)
    }

    pub fn set_mirror_path(&self, path: &str) -> Result<()> {
        self.channel.set_mirror_path(path).map_err(Error::Io)
    }

    pub fn set_debug(&self, enable: bool) -> Result<()> {
        self.channel.set_debug(enable).map_err(Error::Io)
    }

    pub fn set_stealth(&self, enable: bool) -> Result<()> {
        self.channel.set_stealth(enable).map_err(Error::Io)
    }

    pub fn set_enabled(&self, enable: bool) -> Result<()> {
        self.channel.set_enabled(enable).map_err(Error::Io)
    }

    pub fn set_uname(&self, release: &str, version: &str) -> Result<()> {
        self.channel.set_uname(release, version).map_err(Error::Io)
    }

    pub fn fix_mounts(&self) -> Result<()> {
        self.channel.fix_mounts().map_err(Error::Io)
    }

    pub fn list_rules(&self) -> Result<String> {
        self.channel.list_rules().map_err(Error::Io)
    }

    /// Suppress overlay-specific xattrs under a freshly mounted target.
    /// Failures are expected when HymoFS is absent and are not propagated.
    pub fn hide_overlay_xattrs(&self, path: &Path) {
        let path = path.to_string_lossy();
        if let Err(e) = self.channel.hide_overlay_xattrs(&path) {
            debug!("hide_overlay_xattrs({}) not applied: {}", path, e);
        }
    }

    fn grab_ksu_fd(&self) -> c_int {
        let mut ksu = self.ksu.lock();
        if !ksu.checked {
            let mut fd: c_int = -1;
            unsafe {
                libc::syscall(
                    libc::SYS_reboot,
                    KSU_INSTALL_MAGIC1 as libc::c_long,
                    KSU_INSTALL_MAGIC2 as libc::c_long,
                    0,
                    &mut fd as *mut c_int,
                );
            }
            ksu.fd = fd;
            ksu.checked = true;
        }
        ksu.fd
    }

    /// Hint the host kernel that `target` should be unmounted when leaving
    /// the controller's namespace. Deduplicated per run.
    pub fn send_unmountable(&self, target: &Path) -> bool {
        if target.as_os_str().is_empty() {
            return true;
        }
        {
            let sent = self.sent_unmounts.lock();
            if sent.contains(target) {
                return true;
            }
        }

        let fd = self.grab_ksu_fd();
        if fd < 0 {
            return false;
        }

        let Ok(path_c) = CString::new(target.to_string_lossy().as_bytes()) else {
            return false;
        };
        let cmd = KsuAddTryUmount {
            arg: path_c.as_ptr() as u64,
            flags: 2,
            mode: 1,
        };

        let ret = unsafe { libc::ioctl(fd, KSU_IOCTL_ADD_TRY_UMOUNT as _, &cmd) };
        if ret == 0 {
            self.sent_unmounts.lock().insert(target.to_path_buf());
            true
        } else {
            false
        }
    }

    /// Suppress the loop/ext4 sysfs traces of the staging image.
    pub fn nuke_sysfs(&self, target: &Path) -> Result<()> {
        let fd = self.grab_ksu_fd();
        if fd < 0 {
            return Err(Error::KernelUnavailable);
        }

        let path_c = CString::new(target.to_string_lossy().as_bytes())
            .map_err(|_| Error::Config(format!("bad path: {}", target.display())))?;
        let cmd = NukeExt4SysfsCmd {
            arg: path_c.as_ptr() as u64,
        };

        let ret = unsafe { libc::ioctl(fd, KSU_IOCTL_NUKE_EXT4_SYSFS as _, &cmd) };
        if ret != 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_file_type_raw_values() {
        assert_eq!(RuleFileType::Regular.as_raw(), libc::DT_REG as c_int);
        assert_eq!(RuleFileType::Directory.as_raw(), libc::DT_DIR as c_int);
        assert_eq!(RuleFileType::Symlink.as_raw(), libc::DT_LNK as c_int);
        assert_eq!(RuleFileType::Unknown.as_raw(), libc::DT_UNKNOWN as c_int);
    }

    #[test]
    fn test_rule_file_type_from_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f");
        std::fs::write(&file, b"x").unwrap();

        let meta = std::fs::symlink_metadata(&file).unwrap();
        assert_eq!(RuleFileType::from_metadata(&meta), RuleFileType::Regular);

        let meta = std::fs::symlink_metadata(dir.path()).unwrap();
        assert_eq!(RuleFileType::from_metadata(&meta), RuleFileType::Directory);
    }
}
