//! Kernel bridge: the HymoFS ioctl channel and host-kernel auxiliary ioctls.

mod bridge;
mod ioctl;

pub use bridge::{HymoStatus, KernelBridge, RuleFileType};
pub use ioctl::{HymoChannel, HYMO_DEVICE_PATH, HYMO_PROTOCOL_VERSION};
