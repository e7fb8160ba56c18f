//! HymoFS ioctl wire layer.
//!
//! Opcodes are carried over `/dev/hymo` when the device exposes an ioctl
//! surface, with a legacy fallback that tunnels the same opcode set through
//! a magic `reboot` syscall carrying two 32-bit magic words.

use libc::{c_char, c_int, c_void};
use std::ffi::CString;
use std::fs::OpenOptions;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};

pub const HYMO_MAGIC1: u32 = 0x4859_4D4F; // "HYMO"
pub const HYMO_MAGIC2: u32 = 0x524F_4F54; // "ROOT"
pub const HYMO_PROTOCOL_VERSION: i32 = 10;
pub const HYMO_DEVICE_PATH: &str = "/dev/hymo";
pub const HYMO_UNAME_LEN: usize = 65;

// Legacy syscall-mode command words.
const HYMO_CMD_ADD_RULE: u32 = 0x48001;
const HYMO_CMD_DEL_RULE: u32 = 0x48002;
const HYMO_CMD_HIDE_RULE: u32 = 0x48003;
const HYMO_CMD_CLEAR_ALL: u32 = 0x48005;
const HYMO_CMD_GET_VERSION: u32 = 0x48006;
const HYMO_CMD_LIST_RULES: u32 = 0x48007;
const HYMO_CMD_SET_DEBUG: u32 = 0x48008;
const HYMO_CMD_REORDER_MNT_ID: u32 = 0x48009;
const HYMO_CMD_SET_STEALTH: u32 = 0x48010;
const HYMO_CMD_HIDE_OVERLAY_XATTRS: u32 = 0x48011;
const HYMO_CMD_ADD_MERGE_RULE: u32 = 0x48012;
const HYMO_CMD_SET_MIRROR_PATH: u32 = 0x48014;
const HYMO_CMD_SET_UNAME: u32 = 0x48017;
const HYMO_CMD_SET_ENABLED: u32 = 0x48020;

/// `{src, target, type}` payload shared by the rule opcodes.
#[repr(C)]
pub struct HymoRuleArg {
    pub src: *const c_char,
    pub target: *const c_char,
    pub rule_type: c_int,
}

/// `{buf, size}` payload for LIST_RULES.
#[repr(C)]
pub struct HymoListArg {
    pub buf: *mut c_char,
    pub size: usize,
}

/// Release/version strings for SET_UNAME.
#[repr(C)]
pub struct HymoSpoofUname {
    pub release: [c_char; HYMO_UNAME_LEN],
    pub version: [c_char; HYMO_UNAME_LEN],
}

// Linux ioctl number encoding (matches the kernel's sys/ioctl.h formula).
#[allow(non_snake_case)]
mod ioc {
    const _IOC_NONE: u32 = 0;
    const _IOC_WRITE: u32 = 1;
    const _IOC_READ: u32 = 2;
    const _IOC_NRSHIFT: u32 = 0;
    const _IOC_TYPESHIFT: u32 = 8;
    const _IOC_SIZESHIFT: u32 = 16;
    const _IOC_DIRSHIFT: u32 = 30;

    const fn _IOC(dir: u32, ty: u32, nr: u32, size: u32) -> u32 {
        (dir << _IOC_DIRSHIFT) | (ty << _IOC_TYPESHIFT) | (nr << _IOC_NRSHIFT) | (size << _IOC_SIZESHIFT)
    }
    pub const fn _IOW(ty: u32, nr: u32, size: u32) -> u32 {
        _IOC(_IOC_WRITE, ty, nr, size)
    }
    pub const fn _IOR(ty: u32, nr: u32, size: u32) -> u32 {
        _IOC(_IOC_READ, ty, nr, size)
    }
    pub const fn _IOWR(ty: u32, nr: u32, size: u32) -> u32 {
        _IOC(_IOC_READ | _IOC_WRITE, ty, nr, size)
    }
    pub const fn _IO(ty: u32, nr: u32) -> u32 {
        _IOC(_IOC_NONE, ty, nr, 0)
    }
}
use ioc::{_IO, _IOR, _IOW, _IOWR};

const HYMO_IOC_MAGIC: u32 = b'H' as u32;

const fn rule_arg_size() -> u32 {
    std::mem::size_of::<HymoRuleArg>() as u32
}

const IOC_ADD_RULE: u32 = _IOW(HYMO_IOC_MAGIC, 1, rule_arg_size());
const IOC_DEL_RULE: u32 = _IOW(HYMO_IOC_MAGIC, 2, rule_arg_size());
const IOC_HIDE_RULE: u32 = _IOW(HYMO_IOC_MAGIC, 3, rule_arg_size());
const IOC_CLEAR_ALL: u32 = _IO(HYMO_IOC_MAGIC, 5);
const IOC_GET_VERSION: u32 = _IOR(HYMO_IOC_MAGIC, 6, 4);
const IOC_LIST_RULES: u32 = _IOWR(HYMO_IOC_MAGIC, 7, std::mem::size_of::<HymoListArg>() as u32);
const IOC_SET_DEBUG: u32 = _IOW(HYMO_IOC_MAGIC, 8, 4);
const IOC_REORDER_MNT_ID: u32 = _IO(HYMO_IOC_MAGIC, 9);
const IOC_SET_STEALTH: u32 = _IOW(HYMO_IOC_MAGIC, 10, 4);
const IOC_HIDE_OVERLAY_XATTRS: u32 = _IOW(HYMO_IOC_MAGIC, 11, rule_arg_size());
const IOC_ADD_MERGE_RULE: u32 = _IOW(HYMO_IOC_MAGIC, 12, rule_arg_size());
const IOC_SET_MIRROR_PATH: u32 = _IOW(HYMO_IOC_MAGIC, 14, rule_arg_size());
const IOC_SET_UNAME: u32 = _IOW(HYMO_IOC_MAGIC, 17, std::mem::size_of::<HymoSpoofUname>() as u32);
const IOC_SET_ENABLED: u32 = _IOW(HYMO_IOC_MAGIC, 20, 4);

fn path_cstring(s: &str) -> io::Result<CString> {
    CString::new(s).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))
}

/// Low-level channel to the HymoFS kernel module.
///
/// When `/dev/hymo` cannot be opened the channel still exists and every
/// command is delivered through the legacy syscall tunnel; presence is
/// ultimately decided by whether GET_VERSION answers.
pub struct HymoChannel {
    fd: Option<OwnedFd>,
}

impl HymoChannel {
    pub fn open() -> Self {
        let fd = OpenOptions::new()
            .read(true)
            .write(true)
            .open(HYMO_DEVICE_PATH)
            .ok()
            .map(OwnedFd::from);
        Self { fd }
    }

    pub fn has_device(&self) -> bool {
        self.fd.is_some()
    }

    fn legacy(&self, legacy_cmd: u32, arg: *mut c_void) -> io::Result<c_int> {
        let ret = unsafe {
            libc::syscall(
                libc::SYS_reboot,
                HYMO_MAGIC1 as libc::c_long,
                HYMO_MAGIC2 as libc::c_long,
                legacy_cmd as libc::c_long,
                arg,
            )
        };
        if ret < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(ret as c_int)
        }
    }

    /// Run a command, preferring the device ioctl and falling back to the
    /// syscall tunnel when the device is absent or answers ENOTTY.
    fn execute(&self, legacy_cmd: u32, ioctl_cmd: u32, arg: *mut c_void) -> io::Result<c_int> {
        if let Some(fd) = &self.fd {
            let ret = unsafe { libc::ioctl(fd.as_raw_fd(), ioctl_cmd as _, arg) };
            if ret >= 0 {
                return Ok(ret);
            }
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ENOTTY) {
                return Err(err);
            }
        }
        self.legacy(legacy_cmd, arg)
    }

    pub fn get_version(&self) -> io::Result<i32> {
        if let Some(fd) = &self.fd {
            let mut version: c_int = 0;
            let ret = unsafe {
                libc::ioctl(
                    fd.as_raw_fd(),
                    IOC_GET_VERSION as _,
                    &mut version as *mut _ as *mut c_void,
                )
            };
            if ret == 0 {
                return Ok(version);
            }
        }
        // Syscall mode reports the version as the return value.
        self.legacy(HYMO_CMD_GET_VERSION, std::ptr::null_mut())
            .map(|v| v as i32)
    }

    fn rule_cmd(
        &self,
        legacy_cmd: u32,
        ioctl_cmd: u32,
        src: &str,
        target: Option<&str>,
        rule_type: c_int,
    ) -> io::Result<()> {
        let src_c = path_cstring(src)?;
        let target_c = target.map(path_cstring).transpose()?;
        let arg = HymoRuleArg {
            src: src_c.as_ptr(),
            target: target_c
                .as_ref()
                .map_or(std::ptr::null(), |t| t.as_ptr()),
            rule_type,
        };
        self.execute(legacy_cmd, ioctl_cmd, &arg as *const _ as *mut c_void)
            .map(|_| ())
    }

    fn flag_cmd(&self, legacy_cmd: u32, ioctl_cmd: u32, enable: bool) -> io::Result<()> {
        let val: c_int = if enable { 1 } else { 0 };
        self.execute(legacy_cmd, ioctl_cmd, &val as *const _ as *mut c_void)
            .map(|_| ())
    }

    pub fn clear_rules(&self) -> io::Result<()> {
        self.execute(HYMO_CMD_CLEAR_ALL, IOC_CLEAR_ALL, std::ptr::null_mut())
            .map(|_| ())
    }

    pub fn add_rule(&self, src: &str, target: &str, rule_type: c_int) -> io::Result<()> {
        self.rule_cmd(HYMO_CMD_ADD_RULE, IOC_ADD_RULE, src, Some(target), rule_type)
    }

    pub fn add_merge_rule(&self, src: &str, target: &str) -> io::Result<()> {
        self.rule_cmd(
            HYMO_CMD_ADD_MERGE_RULE,
            IOC_ADD_MERGE_RULE,
            src,
            Some(target),
            0,
        )
    }

    pub fn delete_rule(&self, src: &str) -> io::Result<()> {
        self.rule_cmd(HYMO_CMD_DEL_RULE, IOC_DEL_RULE, src, None, 0)
    }

    pub fn hide_path(&self, path: &str) -> io::Result<()> {
        self.rule_cmd(HYMO_CMD_HIDE_RULE, IOC_HIDE_RULE, path, None, 0)
    }

    pub fn set_mirror_path(&self, path: &str) -> io::Result<()> {
        self.rule_cmd(HYMO_CMD_SET_MIRROR_PATH, IOC_SET_MIRROR_PATH, path, None, 0)
    }

    pub fn hide_overlay_xattrs(&self, path: &str) -> io::Result<()> {
        self.rule_cmd(
            HYMO_CMD_HIDE_OVERLAY_XATTRS,
            IOC_HIDE_OVERLAY_XATTRS,
            path,
            None,
            0,
        )
    }

    pub fn set_debug(&self, enable: bool) -> io::Result<()> {
        self.flag_cmd(HYMO_CMD_SET_DEBUG, IOC_SET_DEBUG, enable)
    }

    pub fn set_stealth(&self, enable: bool) -> io::Result<()> {
        self.flag_cmd(HYMO_CMD_SET_STEALTH, IOC_SET_STEALTH, enable)
    }

    pub fn set_enabled(&self, enable: bool) -> io::Result<()> {
        self.flag_cmd(HYMO_CMD_SET_ENABLED, IOC_SET_ENABLED, enable)
    }

    pub fn fix_mounts(&self) -> io::Result<()> {
        self.execute(
            HYMO_CMD_REORDER_MNT_ID,
            IOC_REORDER_MNT_ID,
            std::ptr::null_mut(),
        )
        .map(|_| ())
    }

    pub fn set_uname(&self, release: &str, version: &str) -> io::Result<()> {
        let mut arg: HymoSpoofUname = unsafe { std::mem::zeroed() };
        copy_uname_field(&mut arg.release, release);
        copy_uname_field(&mut arg.version, version);
        self.execute(
            HYMO_CMD_SET_UNAME,
            IOC_SET_UNAME,
            &mut arg as *mut _ as *mut c_void,
        )
        .map(|_| ())
    }

    pub fn list_rules(&self) -> io::Result<String> {
        let buf_size = 128 * 1024;
        let mut buf = vec![0u8; buf_size];
        let arg = HymoListArg {
            buf: buf.as_mut_ptr() as *mut c_char,
            size: buf_size,
        };
        self.execute(
            HYMO_CMD_LIST_RULES,
            IOC_LIST_RULES,
            &arg as *const _ as *mut c_void,
        )?;
        let len = buf.iter().position(|&b| b == 0).unwrap_or(buf_size);
        Ok(String::from_utf8_lossy(&buf[..len]).into_owned())
    }
}

fn copy_uname_field(dst: &mut [c_char; HYMO_UNAME_LEN], value: &str) {
    let bytes = value.as_bytes();
    let len = bytes.len().min(HYMO_UNAME_LEN - 1);
    for (i, &b) in bytes.iter().take(len).enumerate() {
        dst[i] = b as c_char;
    }
    dst[len] = 0;
}
