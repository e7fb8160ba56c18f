//! Well-known paths, marker names and protocol constants.

/// Base directory for controller config, logs and the ext4 image.
pub const BASE_DIR: &str = "/data/adb/hymo/";

/// Runtime directory for per-run scratch state.
pub const RUN_DIR: &str = "/data/adb/hymo/run/";

/// Persisted runtime state snapshot.
pub const STATE_FILE: &str = "/data/adb/hymo/run/daemon_state.json";

/// Staging root used when HymoFS is not driving the mirror.
pub const FALLBACK_CONTENT_DIR: &str = "/data/adb/hymo/img_mnt/";

/// The host module's own property file (status reporting target).
pub const MODULE_PROP_FILE: &str = "/data/adb/modules/hymo/module.prop";

/// Default mirror directory pushed to the kernel.
pub const HYMO_MIRROR_DEV: &str = "/dev/hymo_mirror";

/// Parent directory for per-target overlay mirrors.
pub const OVERLAY_MIRROR_BASE: &str = "/dev/hymo_mirror";

// Marker files inside a module directory.
pub const DISABLE_FILE_NAME: &str = "disable";
pub const REMOVE_FILE_NAME: &str = "remove";
pub const SKIP_MOUNT_FILE_NAME: &str = "skip_mount";
pub const REPLACE_DIR_FILE_NAME: &str = ".replace";

// Xattrs.
pub const REPLACE_DIR_XATTR: &str = "trusted.overlay.opaque";
pub const SELINUX_XATTR: &str = "security.selinux";
pub const DEFAULT_SELINUX_CONTEXT: &str = "u:object_r:system_file:s0";

/// Partitions every run targets; extra names come from the config.
pub const BUILTIN_PARTITIONS: [&str; 6] =
    ["system", "vendor", "product", "system_ext", "odm", "oem"];

/// Size argument handed to the image creation helper, in MiB.
pub const IMAGE_SIZE_MB: u32 = 2048;

// Host-kernel (KernelSU) auxiliary ioctl channel.
pub const KSU_INSTALL_MAGIC1: u32 = 0xDEAD_BEEF;
pub const KSU_INSTALL_MAGIC2: u32 = 0xCAFE_BABE;
pub const KSU_IOCTL_NUKE_EXT4_SYSFS: u32 = 0x4000_4b11;
pub const KSU_IOCTL_ADD_TRY_UMOUNT: u32 = 0x4000_4b12;
