//! In-memory superposition of module trees for the magic mount pass.

use crate::defs::{REPLACE_DIR_FILE_NAME, REPLACE_DIR_XATTR};
use crate::error::Result;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeFileType {
    RegularFile,
    Directory,
    Symlink,
    Whiteout,
}

impl NodeFileType {
    pub fn from_path(path: &Path) -> NodeFileType {
        match std::fs::symlink_metadata(path) {
            Ok(meta) => {
                use std::os::unix::fs::{FileTypeExt, MetadataExt};
                let ft = meta.file_type();
                if ft.is_char_device() && meta.rdev() == 0 {
                    NodeFileType::Whiteout
                } else if ft.is_dir() {
                    NodeFileType::Directory
                } else if ft.is_symlink() {
                    NodeFileType::Symlink
                } else {
                    NodeFileType::RegularFile
                }
            }
            Err(_) => NodeFileType::RegularFile,
        }
    }
}

/// One entry in the superposed tree. Directories carry their children by
/// name; `replace` marks a directory that fully shadows its live
/// counterpart, `skip` suppresses commit.
#[derive(Debug, Clone)]
pub struct Node {
    pub name: String,
    pub file_type: NodeFileType,
    pub children: BTreeMap<String, Node>,
    pub module_path: Option<PathBuf>,
    pub replace: bool,
    pub skip: bool,
}

impl Node {
    pub fn new_root(name: &str) -> Node {
        Node {
            name: name.to_string(),
            file_type: NodeFileType::Directory,
            children: BTreeMap::new(),
            module_path: None,
            replace: false,
            skip: false,
        }
    }

    fn new_entry(name: &str, file_type: NodeFileType, module_path: &Path) -> Node {
        Node {
            name: name.to_string(),
            file_type,
            children: BTreeMap::new(),
            module_path: Some(module_path.to_path_buf()),
            replace: false,
            skip: false,
        }
    }

    /// Superpose one module directory onto this node. Directories merge
    /// recursively; anything else replaces an existing entry, so a later
    /// (higher priority) module wins. Returns whether any file was seen.
    pub fn collect_module_files(&mut self, module_dir: &Path) -> Result<bool> {
        let mut has_file = false;

        for entry in std::fs::read_dir(module_dir)?.flatten() {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            let file_type = NodeFileType::from_path(&path);

            match self.children.get_mut(&name) {
                Some(existing)
                    if existing.file_type == NodeFileType::Directory
                        && file_type == NodeFileType::Directory =>
                {
                    existing.replace |= dir_is_replace(&path);
                    existing.module_path = Some(path.clone());
                    has_file |= existing.collect_module_files(&path)? || existing.replace;
                }
                _ => {
                    let mut child = Node::new_entry(&name, file_type, &path);
                    if file_type == NodeFileType::Directory {
                        child.replace = dir_is_replace(&path);
                        has_file |= child.collect_module_files(&path)? || child.replace;
                    } else {
                        has_file = true;
                    }
                    self.children.insert(name, child);
                }
            }
        }

        Ok(has_file)
    }
}

/// A module directory fully shadows its live counterpart when it carries
/// the opaque xattr or a `.replace` marker file.
fn dir_is_replace(path: &Path) -> bool {
    let mut buf = [0u8; 4];
    if let Ok(len) = rustix::fs::lgetxattr(path, REPLACE_DIR_XATTR, &mut buf) {
        if len > 0 && buf[0] == b'y' {
            return true;
        }
    }
    path.join(REPLACE_DIR_FILE_NAME).exists()
}

/// Graft the contents of `dir` below the system node at the location
/// named by `chain` (path components under the partition root), creating
/// intermediate directory nodes as needed.
fn insert_subtree(system: &mut Node, chain: &[String], dir: &Path) -> bool {
    let mut current = system;
    for (i, name) in chain.iter().enumerate() {
        current = current
            .children
            .entry(name.clone())
            .or_insert_with(|| Node::new_root(name));
        if current.file_type != NodeFileType::Directory {
            warn!("magic subtree conflicts with non-directory node {}", name);
            return false;
        }
        if i == chain.len() - 1 {
            current.module_path = Some(dir.to_path_buf());
            current.replace |= dir_is_replace(dir);
            return current.collect_module_files(dir).unwrap_or(false) || current.replace;
        }
    }
    false
}

/// Partitions that commonly live behind a `/system/<name>` symlink; when
/// the real root-level directory exists, the subtree is hoisted so it
/// overlays `/<name>` instead of `/system/<name>`.
const HOISTED_PARTITIONS: [(&str, bool); 4] = [
    ("vendor", true),
    ("system_ext", true),
    ("product", true),
    ("odm", false),
];

fn hoist_partition(root: &mut Node, system: &mut Node, partition: &str) {
    let Some(mut node) = system.children.remove(partition) else {
        return;
    };

    if node.file_type == NodeFileType::Symlink {
        if let Some(module_path) = &node.module_path {
            if module_path.is_dir() {
                node.file_type = NodeFileType::Directory;
            }
        }
    }
    if node.module_path.is_none() {
        node.module_path = Some(Path::new("/").join(partition));
    }

    root.children.insert(partition.to_string(), node);
}

/// Split a magic entry into its module-relative components under the
/// staging root, skipping the segregation directory.
fn staged_components(path: &Path, storage_root: &Path) -> Option<Vec<String>> {
    let rel = path.strip_prefix(storage_root).ok()?;
    let mut components: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    if components.first().map(String::as_str) == Some(".overlay_staging") {
        components.remove(0);
    }
    if components.is_empty() {
        return None;
    }
    Some(components)
}

/// Build the full superposed tree for a set of magic entries. An entry is
/// either a module content root (its `system/` subtree is collected) or a
/// directory inside a module's `system` tree (grafted at its virtual
/// location). Entries are given in ascending order so the
/// lexicographically-last (highest priority) module wins conflicts.
pub fn collect_magic_tree(
    content_paths: &[PathBuf],
    storage_root: &Path,
    extra_partitions: &[String],
) -> Option<Node> {
    let mut root = Node::new_root("");
    let mut system = Node::new_root("system");
    system.module_path = Some(PathBuf::from("/system"));

    let mut has_file = false;
    for path in content_paths {
        debug!("collecting {}", path.display());

        match staged_components(path, storage_root) {
            Some(components) if components.len() > 1 => {
                if components[1] != "system" {
                    warn!(
                        "magic entry {} is outside the system tree, skipping",
                        path.display()
                    );
                    continue;
                }
                if components.len() == 2 {
                    has_file |= system.collect_module_files(path).unwrap_or(false);
                } else {
                    has_file |= insert_subtree(&mut system, &components[2..], path);
                }
            }
            _ => {
                let module_system = path.join("system");
                if module_system.is_dir() {
                    has_file |= system.collect_module_files(&module_system).unwrap_or(false);
                }
            }
        }
    }

    if !has_file {
        return None;
    }

    for (partition, require_symlink) in HOISTED_PARTITIONS {
        let path_of_root = Path::new("/").join(partition);
        let path_of_system = Path::new("/system").join(partition);
        if path_of_root.is_dir() && (!require_symlink || path_of_system.is_symlink()) {
            hoist_partition(&mut root, &mut system, partition);
        }
    }

    for partition in extra_partitions {
        if partition == "system" || HOISTED_PARTITIONS.iter().any(|(p, _)| p == partition) {
            continue;
        }
        let path_of_root = Path::new("/").join(partition);
        if path_of_root.is_dir() && system.children.contains_key(partition.as_str()) {
            debug!("attach extra partition '{}' to root", partition);
            hoist_partition(&mut root, &mut system, partition);
        }
    }

    root.children.insert("system".to_string(), system);
    Some(root)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_collect_merges_directories_across_modules() {
        let store = tempdir().unwrap();
        let mod_a = store.path().join("aaa/system");
        let mod_z = store.path().join("zzz/system");
        std::fs::create_dir_all(mod_a.join("etc")).unwrap();
        std::fs::create_dir_all(mod_z.join("etc")).unwrap();
        std::fs::write(mod_a.join("etc/from_a"), b"a").unwrap();
        std::fs::write(mod_z.join("etc/from_z"), b"z").unwrap();

        let root = collect_magic_tree(
            &[store.path().join("aaa"), store.path().join("zzz")],
            store.path(),
            &[],
        )
        .unwrap();

        let system = &root.children["system"];
        let etc = &system.children["etc"];
        assert!(etc.children.contains_key("from_a"));
        assert!(etc.children.contains_key("from_z"));
    }

    #[test]
    fn test_later_module_wins_file_conflicts() {
        let store = tempdir().unwrap();
        let mod_a = store.path().join("aaa/system");
        let mod_z = store.path().join("zzz/system");
        std::fs::create_dir_all(&mod_a).unwrap();
        std::fs::create_dir_all(&mod_z).unwrap();
        std::fs::write(mod_a.join("build.prop"), b"a").unwrap();
        std::fs::write(mod_z.join("build.prop"), b"z").unwrap();

        let root = collect_magic_tree(
            &[store.path().join("aaa"), store.path().join("zzz")],
            store.path(),
            &[],
        )
        .unwrap();

        let node = &root.children["system"].children["build.prop"];
        assert_eq!(
            node.module_path.as_deref(),
            Some(mod_z.join("build.prop").as_path())
        );
    }

    #[test]
    fn test_subtree_entry_grafts_at_virtual_location() {
        let store = tempdir().unwrap();
        let lib = store.path().join("M/system/lib");
        std::fs::create_dir_all(&lib).unwrap();
        std::fs::write(lib.join("libfoo.so"), b"x").unwrap();

        let root = collect_magic_tree(&[lib.clone()], store.path(), &[]).unwrap();
        let lib_node = &root.children["system"].children["lib"];
        assert_eq!(lib_node.module_path.as_deref(), Some(lib.as_path()));
        assert!(lib_node.children.contains_key("libfoo.so"));
    }

    #[test]
    fn test_replace_marker_file() {
        let store = tempdir().unwrap();
        let app = store.path().join("m/system/app");
        std::fs::create_dir_all(&app).unwrap();
        std::fs::write(app.join(".replace"), b"").unwrap();

        let root = collect_magic_tree(&[store.path().join("m")], store.path(), &[]).unwrap();
        assert!(root.children["system"].children["app"].replace);
    }

    #[test]
    fn test_empty_modules_produce_no_tree() {
        let store = tempdir().unwrap();
        std::fs::create_dir_all(store.path().join("m/system/empty_dir")).unwrap();
        assert!(collect_magic_tree(&[store.path().join("m")], store.path(), &[]).is_none());
    }

    #[test]
    fn test_extra_partition_hoisted_to_root() {
        let store = tempdir().unwrap();
        // "tmp" exists as a live root directory on any build host.
        let part = store.path().join("m/system/tmp");
        std::fs::create_dir_all(&part).unwrap();
        std::fs::write(part.join("f"), b"x").unwrap();

        let root = collect_magic_tree(
            &[store.path().join("m")],
            store.path(),
            &["tmp".to_string()],
        )
        .unwrap();
        assert!(root.children.contains_key("tmp"));
        assert!(!root.children["system"].children.contains_key("tmp"));
    }
}
