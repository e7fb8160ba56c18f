//! Mount backends: OverlayFS stacking and magic (bind) mounting.

pub mod magic;
pub mod node;
pub mod overlay;

pub use magic::mount_partitions;
pub use node::{collect_magic_tree, Node, NodeFileType};
pub use overlay::{bind_mount, mount_overlay};
