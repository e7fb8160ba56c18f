//! Persisted runtime state.
//!
//! A JSON snapshot of what was mounted and by which backend, written
//! atomically at the end of a run. Readers tolerate missing fields.

use crate::defs::STATE_FILE;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeState {
    pub storage_mode: String,
    pub mount_point: String,
    pub nuke_active: bool,
    pub hymofs_mismatch: bool,
    pub mismatch_message: String,
    pub overlay_module_ids: Vec<String>,
    pub magic_module_ids: Vec<String>,
    pub hymofs_module_ids: Vec<String>,
    pub active_mounts: Vec<String>,
}

fn dedup(list: &mut Vec<String>) {
    list.sort();
    list.dedup();
}

impl RuntimeState {
    pub fn load() -> Self {
        Self::load_from(Path::new(STATE_FILE))
    }

    /// Load a snapshot; absent or unreadable files yield the default state.
    pub fn load_from(path: &Path) -> Self {
        let Ok(content) = std::fs::read_to_string(path) else {
            return RuntimeState::default();
        };
        match serde_json::from_str(&content) {
            Ok(state) => state,
            Err(e) => {
                debug!("runtime state unreadable, starting fresh: {}", e);
                RuntimeState::default()
            }
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(Path::new(STATE_FILE))
    }

    /// Write the snapshot atomically: serialize to a sibling temp file and
    /// rename over the target so readers never observe a partial write.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            crate::utils::ensure_dir_exists(parent)?;
        }

        let mut state = self.clone();
        dedup(&mut state.overlay_module_ids);
        dedup(&mut state.magic_module_ids);
        dedup(&mut state.hymofs_module_ids);
        dedup(&mut state.active_mounts);

        let content = serde_json::to_string_pretty(&state)
            .map_err(|e| Error::Config(format!("failed to serialize runtime state: {}", e)))?;

        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, content)?;
        std::fs::rename(&tmp_path, path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("daemon_state.json");

        let state = RuntimeState {
            storage_mode: "tmpfs".to_string(),
            mount_point: "/dev/hymo_mirror".to_string(),
            nuke_active: true,
            overlay_module_ids: vec!["AAA".to_string()],
            hymofs_module_ids: vec!["ZZZ".to_string()],
            active_mounts: vec!["system".to_string(), "vendor".to_string()],
            ..Default::default()
        };
        state.save_to(&path).unwrap();

        let loaded = RuntimeState::load_from(&path);
        assert_eq!(loaded.storage_mode, "tmpfs");
        assert!(loaded.nuke_active);
        assert_eq!(loaded.overlay_module_ids, vec!["AAA"]);
        assert_eq!(loaded.active_mounts, vec!["system", "vendor"]);
    }

    #[test]
    fn test_missing_fields_default() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, r#"{"storage_mode": "ext4"}"#).unwrap();

        let loaded = RuntimeState::load_from(&path);
        assert_eq!(loaded.storage_mode, "ext4");
        assert!(!loaded.nuke_active);
        assert!(loaded.overlay_module_ids.is_empty());
        assert!(loaded.mismatch_message.is_empty());
    }

    #[test]
    fn test_absent_file_defaults() {
        let loaded = RuntimeState::load_from(Path::new("/nonexistent/state.json"));
        assert!(loaded.storage_mode.is_empty());
    }

    #[test]
    fn test_save_deduplicates_id_sets() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");

        let state = RuntimeState {
            magic_module_ids: vec!["B".to_string(), "A".to_string(), "B".to_string()],
            ..Default::default()
        };
        state.save_to(&path).unwrap();

        let loaded = RuntimeState::load_from(&path);
        assert_eq!(loaded.magic_module_ids, vec!["A", "B"]);
    }

    #[test]
    fn test_repeated_save_is_byte_equal() {
        let dir = tempdir().unwrap();
        let first = dir.path().join("a.json");
        let second = dir.path().join("b.json");

        let state = RuntimeState {
            storage_mode: "tmpfs".to_string(),
            hymofs_module_ids: vec!["ZZZ".to_string()],
            ..Default::default()
        };
        state.save_to(&first).unwrap();
        state.save_to(&second).unwrap();

        assert_eq!(
            std::fs::read(&first).unwrap(),
            std::fs::read(&second).unwrap()
        );
    }
}
