//! Controller configuration.
//!
//! The main config and its companion files are line-oriented `key = value`
//! formats: `#` starts a comment, booleans are literal `true`/`false`, the
//! `partitions` key is a comma-separated list. Companions:
//! `module_mode.conf` (`id = mode`) and `module_rules.conf`
//! (`id:path = mode`).

use crate::defs::BASE_DIR;
use crate::error::{Error, Result};
use crate::planner::Mode;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tracing::warn;

/// A per-path mode override configured globally for a module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleConfig {
    pub path: String,
    pub mode: Mode,
}

/// Main configuration structure
#[derive(Debug, Clone)]
pub struct Config {
    /// Module store scanned by the inventory
    pub moduledir: PathBuf,

    /// Scratch directory override for the magic mount pass
    pub tempdir: Option<PathBuf>,

    /// Source name stamped on controller-created mounts
    pub mountsource: String,

    /// Verbose logging
    pub verbose: bool,

    /// Skip the tmpfs attempt and go straight to the ext4 image
    pub force_ext4: bool,

    /// Do not emit unmount hints to the host kernel
    pub disable_umount: bool,

    /// Nuke ext4 sysfs traces after an image-backed run
    pub enable_nuke: bool,

    /// Use HymoFS even when the protocol versions disagree
    pub ignore_protocol_mismatch: bool,

    /// Kernel-side verbose logging
    pub enable_kernel_debug: bool,

    /// Kernel-side hiding of controller mounts and xattrs
    pub enable_stealth: bool,

    /// Mirror directory override pushed to the kernel
    pub mirror_path: Option<PathBuf>,

    /// Extra partition names beyond the builtin set
    pub partitions: Vec<String>,

    /// Global per-module default mode overrides
    pub module_modes: BTreeMap<String, Mode>,

    /// Global per-module path rules
    pub module_rules: BTreeMap<String, Vec<RuleConfig>>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            moduledir: PathBuf::from("/data/adb/modules"),
            tempdir: None,
            mountsource: "KSU".to_string(),
            verbose: false,
            force_ext4: false,
            disable_umount: false,
            enable_nuke: true,
            ignore_protocol_mismatch: false,
            enable_kernel_debug: false,
            enable_stealth: true,
            mirror_path: None,
            partitions: Vec::new(),
            module_modes: BTreeMap::new(),
            module_rules: BTreeMap::new(),
        }
    }
}

fn split_key_value(line: &str) -> Option<(&str, &str)> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let (key, value) = line.split_once('=')?;
    Some((key.trim(), value.trim().trim_matches('"')))
}

impl Config {
    /// Load from the default location, falling back to built-in defaults.
    pub fn load_default() -> Self {
        let default_path = Path::new(BASE_DIR).join("config.toml");
        if default_path.exists() {
            match Config::from_file(&default_path) {
                Ok(config) => return config,
                Err(e) => warn!("failed to load default config: {}", e),
            }
        }
        let mut config = Config::default();
        config.module_modes = load_module_modes();
        config.module_rules = load_module_rules();
        config
    }

    /// Parse the main config file and pick up the companion mode/rule files.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot open config file {}: {}", path.display(), e))
        })?;
        let mut config = Config::parse(&content)?;
        config.module_modes = load_module_modes();
        config.module_rules = load_module_rules();
        Ok(config)
    }

    /// Parse config content without touching companion files.
    pub fn parse(content: &str) -> Result<Self> {
        let mut config = Config::default();

        for line in content.lines() {
            let Some((key, value)) = split_key_value(line) else {
                continue;
            };

            match key {
                "moduledir" => config.moduledir = PathBuf::from(value),
                "tempdir" => {
                    if !value.is_empty() {
                        config.tempdir = Some(PathBuf::from(value));
                    }
                }
                "mountsource" => config.mountsource = value.to_string(),
                "verbose" => config.verbose = value == "true",
                "force_ext4" => config.force_ext4 = value == "true",
                "disable_umount" => config.disable_umount = value == "true",
                "enable_nuke" => config.enable_nuke = value == "true",
                "ignore_protocol_mismatch" => config.ignore_protocol_mismatch = value == "true",
                "enable_kernel_debug" => config.enable_kernel_debug = value == "true",
                "enable_stealth" => config.enable_stealth = value == "true",
                "mirror_path" => {
                    if !value.is_empty() {
                        config.mirror_path = Some(PathBuf::from(value));
                    }
                }
                "partitions" => {
                    config.partitions = value
                        .split(',')
                        .map(|p| p.trim().to_string())
                        .filter(|p| !p.is_empty())
                        .collect();
                }
                _ => {}
            }
        }

        Ok(config)
    }

    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let mut out = String::new();
        out.push_str("# Hymo Configuration\n");
        let _ = writeln!(out, "moduledir = \"{}\"", self.moduledir.display());
        if let Some(tempdir) = &self.tempdir {
            let _ = writeln!(out, "tempdir = \"{}\"", tempdir.display());
        }
        let _ = writeln!(out, "mountsource = \"{}\"", self.mountsource);
        let _ = writeln!(out, "verbose = {}", self.verbose);
        let _ = writeln!(out, "force_ext4 = {}", self.force_ext4);
        let _ = writeln!(out, "disable_umount = {}", self.disable_umount);
        let _ = writeln!(out, "enable_nuke = {}", self.enable_nuke);
        let _ = writeln!(
            out,
            "ignore_protocol_mismatch = {}",
            self.ignore_protocol_mismatch
        );
        let _ = writeln!(out, "enable_kernel_debug = {}", self.enable_kernel_debug);
        let _ = writeln!(out, "enable_stealth = {}", self.enable_stealth);
        if let Some(mirror_path) = &self.mirror_path {
            let _ = writeln!(out, "mirror_path = \"{}\"", mirror_path.display());
        }
        if !self.partitions.is_empty() {
            let _ = writeln!(out, "partitions = \"{}\"", self.partitions.join(","));
        }

        std::fs::write(path, out).map_err(|e| {
            Error::Config(format!(
                "cannot write config file {}: {}",
                path.display(),
                e
            ))
        })
    }

    /// Overlay explicit CLI options on top of the file configuration.
    pub fn merge_with_cli(
        &mut self,
        moduledir: Option<PathBuf>,
        tempdir: Option<PathBuf>,
        mountsource: Option<String>,
        verbose: bool,
        partitions: Vec<String>,
    ) {
        if let Some(moduledir) = moduledir {
            self.moduledir = moduledir;
        }
        if let Some(tempdir) = tempdir {
            self.tempdir = Some(tempdir);
        }
        if let Some(mountsource) = mountsource {
            self.mountsource = mountsource;
        }
        if verbose {
            self.verbose = true;
        }
        if !partitions.is_empty() {
            self.partitions = partitions;
        }
    }
}

fn module_mode_file() -> PathBuf {
    Path::new(BASE_DIR).join("module_mode.conf")
}

fn module_rules_file() -> PathBuf {
    Path::new(BASE_DIR).join("module_rules.conf")
}

/// Parse a `module_mode.conf`-style body (`id = mode`). Unknown modes are
/// diagnosed and skipped.
pub fn parse_module_modes(content: &str) -> BTreeMap<String, Mode> {
    let mut modes = BTreeMap::new();
    for line in content.lines() {
        let Some((id, mode_str)) = split_key_value(line) else {
            continue;
        };
        match Mode::parse(mode_str) {
            Ok(mode) => {
                modes.insert(id.to_string(), mode);
            }
            Err(e) => warn!("module_mode.conf: ignoring entry for '{}': {}", id, e),
        }
    }
    modes
}

pub fn load_module_modes() -> BTreeMap<String, Mode> {
    match std::fs::read_to_string(module_mode_file()) {
        Ok(content) => parse_module_modes(&content),
        Err(_) => BTreeMap::new(),
    }
}

pub fn save_module_modes(modes: &BTreeMap<String, Mode>) -> Result<()> {
    let mut out = String::new();
    out.push_str("# Module mode overrides\n");
    out.push_str("# Format: module_id = mode\n");
    out.push_str("# Modes: auto, hymofs, overlay, magic, none\n\n");
    for (id, mode) in modes {
        let _ = writeln!(out, "{} = {}", id, mode);
    }
    std::fs::write(module_mode_file(), out).map_err(Error::Io)
}

/// Parse a `module_rules.conf`-style body (`id:path = mode`).
pub fn parse_module_rules(content: &str) -> BTreeMap<String, Vec<RuleConfig>> {
    let mut rules: BTreeMap<String, Vec<RuleConfig>> = BTreeMap::new();
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let Some((id, rest)) = trimmed.split_once(':') else {
            continue;
        };
        let Some((path, mode_str)) = rest.split_once('=') else {
            continue;
        };
        let id = id.trim();
        let path = path.trim();
        match Mode::parse(mode_str) {
            Ok(mode) => rules.entry(id.to_string()).or_default().push(RuleConfig {
                path: path.to_string(),
                mode,
            }),
            Err(e) => warn!("module_rules.conf: ignoring rule for '{}': {}", id, e),
        }
    }
    rules
}

pub fn load_module_rules() -> BTreeMap<String, Vec<RuleConfig>> {
    match std::fs::read_to_string(module_rules_file()) {
        Ok(content) => parse_module_rules(&content),
        Err(_) => BTreeMap::new(),
    }
}

pub fn save_module_rules(rules: &BTreeMap<String, Vec<RuleConfig>>) -> Result<()> {
    let mut out = String::new();
    out.push_str("# Per-module path rules\n");
    out.push_str("# Format: module_id:path = mode\n");
    out.push_str("# Modes: auto, hymofs, overlay, magic, hide, none\n\n");
    for (id, module_rules) in rules {
        for rule in module_rules {
            let _ = writeln!(out, "{}:{} = {}", id, rule.path, rule.mode);
        }
    }
    std::fs::write(module_rules_file(), out).map_err(Error::Io)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_defaults_and_overrides() {
        let content = r#"
# comment
moduledir = "/custom/modules"
verbose = true
force_ext4 = true
partitions = "mnt_custom, my_part"
"#;
        let config = Config::parse(content).unwrap();
        assert_eq!(config.moduledir, PathBuf::from("/custom/modules"));
        assert!(config.verbose);
        assert!(config.force_ext4);
        assert_eq!(config.partitions, vec!["mnt_custom", "my_part"]);
        // Untouched keys keep their defaults.
        assert_eq!(config.mountsource, "KSU");
        assert!(config.enable_stealth);
        assert!(config.enable_nuke);
    }

    #[test]
    fn test_save_and_reparse_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = Config::default();
        config.partitions = vec!["my_company".to_string()];
        config.mirror_path = Some(PathBuf::from("/dev/custom_mirror"));
        config.disable_umount = true;
        config.save_to_file(&path).unwrap();

        let reloaded = Config::parse(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(reloaded.moduledir, config.moduledir);
        assert_eq!(reloaded.partitions, config.partitions);
        assert_eq!(reloaded.mirror_path, config.mirror_path);
        assert!(reloaded.disable_umount);
    }

    #[test]
    fn test_parse_module_modes_rejects_unknown() {
        let content = "modA = Overlay\nmodB = bogus\nmodC = NONE\n";
        let modes = parse_module_modes(content);
        assert_eq!(modes.get("modA"), Some(&Mode::Overlay));
        assert_eq!(modes.get("modB"), None);
        assert_eq!(modes.get("modC"), Some(&Mode::None));
    }

    #[test]
    fn test_parse_module_rules() {
        let content =
            "# rules\nmodA:/system/lib = magic\nmodA:/system/lib/modules = HymoFS\nmodB:/vendor = overlay\n";
        let rules = parse_module_rules(content);
        assert_eq!(
            rules["modA"],
            vec![
                RuleConfig {
                    path: "/system/lib".to_string(),
                    mode: Mode::Magic
                },
                RuleConfig {
                    path: "/system/lib/modules".to_string(),
                    mode: Mode::HymoFs
                },
            ]
        );
        assert_eq!(rules["modB"].len(), 1);
    }

    #[test]
    fn test_merge_with_cli() {
        let mut config = Config::default();
        config.merge_with_cli(
            Some(PathBuf::from("/alt/modules")),
            None,
            Some("MAGISK".to_string()),
            true,
            vec![],
        );
        assert_eq!(config.moduledir, PathBuf::from("/alt/modules"));
        assert_eq!(config.mountsource, "MAGISK");
        assert!(config.verbose);
        assert!(config.tempdir.is_none());
    }
}
