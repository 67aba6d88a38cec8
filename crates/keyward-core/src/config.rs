//! Configuration model, on-disk persistence, and the identity lookup store.

use crate::error::{KeywardError, KeywardResult};
use crate::identity::normalize_identity;
use directories_next::ProjectDirs;
use log::{info, warn};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/keyward.toml";
pub const CONFIG_PATH_ENV: &str = "KEYWARD_CONFIG";
/// Token in command templates replaced by the hex key identity.
pub const IDENTITY_PLACEHOLDER: &str = "%s";
const BOOTSTRAP_FILE_NAME: &str = "keyward.toml";
const APP_QUALIFIER: &str = "io";
const APP_ORGANIZATION: &str = "Keyward";
const APP_NAME: &str = "keyward";

pub(crate) fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from(APP_QUALIFIER, APP_ORGANIZATION, APP_NAME)
}

const BOOTSTRAP_TEMPLATE: &str = "\
# Auto-generated keyward configuration bootstrap.
# Register keys with `keyward keys add` once a marker has been forged.

[watch]
# Marker file looked up at the root of every removable volume.
marker_file = \"security_key.dat\"
poll_interval_ms = 1000
read_timeout_ms = 2000
max_marker_bytes = 1048576
# Only volumes mounted below these directories are considered removable.
mount_roots = [\"/media\", \"/run/media\", \"/mnt\"]
# How long a udev arrival waits for the automounter.
mount_wait_secs = 5

[notifications]
enabled = true
command = \"notify-send\"

# [[keys]]
# id = \"<64 hex digits printed by `keyward identify`>\"
# name = \"Office key\"
# command_on_arrival = \"/usr/local/bin/unlock-session %s\"
# command_on_removal = \"loginctl lock-sessions\"
";

/// Emit the commented TOML bootstrap written for fresh installs.
pub fn bootstrap_template() -> String {
    BOOTSTRAP_TEMPLATE.to_string()
}

pub fn default_marker_file() -> &'static str {
    "security_key.dat"
}

pub fn default_config_path() -> &'static str {
    DEFAULT_CONFIG_PATH
}

/// How removable volumes are discovered and how marker files are read.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct WatchCfg {
    #[serde(default = "default_marker_file_owned")]
    pub marker_file: String,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    #[serde(default = "default_max_marker_bytes")]
    pub max_marker_bytes: u64,

    #[serde(default = "default_mount_roots")]
    pub mount_roots: Vec<String>,

    #[serde(default = "default_mount_wait_secs")]
    pub mount_wait_secs: u64,
}

fn default_marker_file_owned() -> String {
    default_marker_file().to_string()
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_read_timeout_ms() -> u64 {
    2_000
}

fn default_max_marker_bytes() -> u64 {
    1024 * 1024
}

fn default_mount_roots() -> Vec<String> {
    vec!["/media".into(), "/run/media".into(), "/mnt".into()]
}

fn default_mount_wait_secs() -> u64 {
    5
}

impl Default for WatchCfg {
    fn default() -> Self {
        Self {
            marker_file: default_marker_file_owned(),
            poll_interval_ms: default_poll_interval_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            max_marker_bytes: default_max_marker_bytes(),
            mount_roots: default_mount_roots(),
            mount_wait_secs: default_mount_wait_secs(),
        }
    }
}

impl WatchCfg {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms.max(1))
    }

    pub fn mount_wait(&self) -> Duration {
        Duration::from_secs(self.mount_wait_secs)
    }
}

/// Desktop notification settings for the daemon's event reporter.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct NotificationCfg {
    #[serde(default = "default_notifications_enabled", alias = "AllowToastNotifications")]
    pub enabled: bool,

    #[serde(default = "default_notification_command")]
    pub command: String,
}

fn default_notifications_enabled() -> bool {
    true
}

fn default_notification_command() -> String {
    "notify-send".to_string()
}

impl Default for NotificationCfg {
    fn default() -> Self {
        Self {
            enabled: default_notifications_enabled(),
            command: default_notification_command(),
        }
    }
}

/// Actions bound to one key identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct KeyConfiguration {
    #[serde(alias = "Id")]
    pub id: String,

    #[serde(default, alias = "Name")]
    pub name: String,

    #[serde(default, alias = "CommandOnPlug")]
    pub command_on_arrival: String,

    #[serde(default, alias = "CommandOnUnplug")]
    pub command_on_removal: String,
}

impl KeyConfiguration {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        command_on_arrival: impl Into<String>,
        command_on_removal: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            command_on_arrival: command_on_arrival.into(),
            command_on_removal: command_on_removal.into(),
        }
    }

    /// True when `identity_hex` refers to this entry (case and separators ignored).
    pub fn matches(&self, identity_hex: &str) -> bool {
        match (normalize_identity(&self.id), normalize_identity(identity_hex)) {
            (Some(ours), Some(theirs)) => ours == theirs,
            _ => false,
        }
    }
}

/// Read-only lookup the engine performs for every transition.
pub trait ConfigStore: Send + Sync {
    /// Return the configuration registered for `identity_hex`, if any.
    fn find_by_identity(&self, identity_hex: &str) -> Option<KeyConfiguration>;
}

/// Top-level configuration snapshot loaded from disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct KeywardConfig {
    #[serde(default)]
    pub watch: WatchCfg,

    #[serde(default, alias = "GlobalConfig")]
    pub notifications: NotificationCfg,

    #[serde(default, alias = "KeyConfigurations", skip_serializing_if = "Vec::is_empty")]
    pub keys: Vec<KeyConfiguration>,

    #[serde(skip)]
    pub path: PathBuf,

    #[serde(skip)]
    pub format: ConfigFormat,
}

/// Tracks which serialisation we parsed so writes preserve it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConfigFormat {
    #[default]
    Toml,
    Yaml,
    Json,
}

impl ConfigFormat {
    /// Pick a format from the file extension; anything unrecognised is YAML.
    pub fn detect(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("toml") => Self::Toml,
            Some(ext) if ext.eq_ignore_ascii_case("json") => Self::Json,
            _ => Self::Yaml,
        }
    }
}

impl KeywardConfig {
    /// Return the canonical system-wide configuration path.
    pub fn default_path() -> &'static Path {
        Path::new(DEFAULT_CONFIG_PATH)
    }

    /// Resolve the per-user configuration path used for bootstrapping.
    pub fn user_config_path() -> Option<PathBuf> {
        project_dirs().map(|dirs| dirs.config_dir().join(BOOTSTRAP_FILE_NAME))
    }

    /// Load configuration from disk, creating a bootstrap copy when missing.
    ///
    /// When the caller asks for the global default and the process cannot create
    /// it, a per-user configuration is written to the platform config directory
    /// instead.
    pub fn load_or_bootstrap<P: AsRef<Path>>(path: P) -> KeywardResult<Self> {
        let target = path.as_ref();
        if target.exists() {
            return Self::load(target);
        }

        match ensure_bootstrap_file(target) {
            Ok(created) => {
                if created {
                    info!("keyward config bootstrap created at {}", target.display());
                }
                Self::load(target)
            }
            Err(err) => {
                if target != Self::default_path() {
                    return Err(KeywardError::InvalidConfig(format!(
                        "failed to initialise configuration at {}: {err}",
                        target.display()
                    )));
                }

                let user_path = Self::user_config_path().ok_or_else(|| {
                    KeywardError::InvalidConfig(
                        "unable to determine user configuration directory; \
                        create /etc/keyward.toml manually"
                            .to_string(),
                    )
                })?;

                let created_user = ensure_bootstrap_file(&user_path).map_err(|io_err| {
                    KeywardError::InvalidConfig(format!(
                        "failed to prepare bootstrap configuration at {}: {io_err}",
                        user_path.display()
                    ))
                })?;

                if created_user {
                    info!("keyward config bootstrap created at {}", user_path.display());
                }

                warn!(
                    "configuration missing at {}; using per-user bootstrap at {}",
                    target.display(),
                    user_path.display()
                );

                Self::load(&user_path)
            }
        }
    }

    /// Read a config file from disk, detect its format, and reject unusable values.
    pub fn load<P: AsRef<Path>>(path: P) -> KeywardResult<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let format = ConfigFormat::detect(path);
        let mut cfg = Self::parse(&contents, format)?;
        cfg.path = path.to_path_buf();
        cfg.format = format;

        if cfg.watch.marker_file.trim().is_empty() {
            return Err(KeywardError::InvalidConfig(
                "watch.marker_file must name a file".to_string(),
            ));
        }

        Ok(cfg)
    }

    /// Parse `contents` in the given format without touching the filesystem.
    pub fn parse(contents: &str, format: ConfigFormat) -> KeywardResult<Self> {
        let cfg = match format {
            ConfigFormat::Toml => toml::from_str::<Self>(contents)?,
            ConfigFormat::Yaml => serde_yaml::from_str::<Self>(contents)?,
            ConfigFormat::Json => serde_json::from_str::<Self>(contents)?,
        };
        Ok(cfg)
    }

    /// Perform a best-effort validation pass and return human-readable issues.
    pub fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();

        let marker = self.watch.marker_file.trim();
        if marker.is_empty() {
            issues.push("watch.marker_file must not be empty".to_string());
        } else if !is_relative_leaf(Path::new(marker)) {
            issues.push(format!(
                "watch.marker_file must be a path relative to the volume root: {marker}"
            ));
        }
        if self.watch.poll_interval_ms == 0 {
            issues.push("watch.poll_interval_ms must be greater than 0".to_string());
        }
        if self.watch.read_timeout_ms == 0 {
            issues.push("watch.read_timeout_ms must be greater than 0".to_string());
        }
        if self.watch.max_marker_bytes == 0 {
            issues.push("watch.max_marker_bytes must be greater than 0".to_string());
        }
        if self.watch.mount_roots.iter().all(|root| root.trim().is_empty()) {
            issues.push("watch.mount_roots must list at least one directory".to_string());
        }
        if self.notifications.enabled && self.notifications.command.trim().is_empty() {
            issues.push(
                "notifications.enabled is true but notifications.command is empty".to_string(),
            );
        }

        let mut seen = HashSet::new();
        for key in &self.keys {
            let label = if key.name.trim().is_empty() {
                key.id.clone()
            } else {
                key.name.clone()
            };
            match normalize_identity(&key.id) {
                Some(normalized) => {
                    if !seen.insert(normalized) {
                        issues.push(format!("duplicate key id detected: {}", key.id));
                    }
                }
                None => issues.push(format!(
                    "key {label} has an invalid id (expected 64 hex digits): {}",
                    key.id
                )),
            }
            if key.command_on_arrival.trim().is_empty() && key.command_on_removal.trim().is_empty()
            {
                issues.push(format!("key {label} has no commands configured"));
            }
        }

        issues
    }

    /// Look up a key entry by identity.
    pub fn find_key(&self, identity_hex: &str) -> Option<&KeyConfiguration> {
        self.keys.iter().find(|key| key.matches(identity_hex))
    }

    /// Insert or replace the entry for `key.id`; returns the replaced entry.
    pub fn upsert_key(&mut self, key: KeyConfiguration) -> Option<KeyConfiguration> {
        match self.keys.iter_mut().find(|existing| existing.matches(&key.id)) {
            Some(existing) => Some(std::mem::replace(existing, key)),
            None => {
                self.keys.push(key);
                None
            }
        }
    }

    /// Remove the entry for `identity_hex`, returning it when present.
    pub fn remove_key(&mut self, identity_hex: &str) -> Option<KeyConfiguration> {
        let index = self.keys.iter().position(|key| key.matches(identity_hex))?;
        Some(self.keys.remove(index))
    }

    /// Persist the configuration back to its original on-disk format.
    pub fn save(&self) -> KeywardResult<()> {
        let payload = match self.format {
            ConfigFormat::Toml => toml::to_string_pretty(self)?,
            ConfigFormat::Yaml => serde_yaml::to_string(self)?,
            ConfigFormat::Json => serde_json::to_string_pretty(self)?,
        };
        fs::write(&self.path, payload)?;
        Ok(())
    }
}

impl ConfigStore for KeywardConfig {
    fn find_by_identity(&self, identity_hex: &str) -> Option<KeyConfiguration> {
        self.find_key(identity_hex).cloned()
    }
}

/// Configuration handle that can be swapped in place while the engine runs.
#[derive(Debug)]
pub struct SharedConfig {
    inner: RwLock<KeywardConfig>,
}

impl SharedConfig {
    pub fn new(config: KeywardConfig) -> Self {
        Self {
            inner: RwLock::new(config),
        }
    }

    /// Clone of the configuration currently in effect.
    pub fn current(&self) -> KeywardConfig {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Re-read the backing file. On failure the previous configuration stays active.
    pub fn reload(&self) -> KeywardResult<usize> {
        let path = self.current().path;
        let fresh = KeywardConfig::load(&path)?;
        let count = fresh.keys.len();
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = fresh;
        Ok(count)
    }
}

impl ConfigStore for SharedConfig {
    fn find_by_identity(&self, identity_hex: &str) -> Option<KeyConfiguration> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .find_by_identity(identity_hex)
    }
}

fn is_relative_leaf(path: &Path) -> bool {
    path.components()
        .all(|component| matches!(component, Component::Normal(_)))
}

fn bootstrap_payload(path: &Path) -> io::Result<String> {
    let format = ConfigFormat::detect(path);
    let defaults = KeywardConfig::default();
    match format {
        ConfigFormat::Toml => Ok(bootstrap_template()),
        ConfigFormat::Yaml => serde_yaml::to_string(&defaults).map_err(io::Error::other),
        ConfigFormat::Json => serde_json::to_string_pretty(&defaults).map_err(io::Error::other),
    }
}

fn ensure_bootstrap_file(path: &Path) -> io::Result<bool> {
    if path.exists() {
        return Ok(false);
    }

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let payload = bootstrap_payload(path)?;
    match OpenOptions::new().create_new(true).write(true).open(path) {
        Ok(mut file) => {
            file.write_all(payload.as_bytes())?;
            file.flush()?;
            #[cfg(unix)]
            {
                let mode = if path.starts_with("/etc/") { 0o644 } else { 0o600 };
                fs::set_permissions(path, PermissionsExt::from_mode(mode))?;
            }
            Ok(true)
        }
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Ok(false),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const ID_A: &str = "0101010101010101010101010101010101010101010101010101010101010101";
    const ID_B: &str = "abababababababababababababababababababababababababababababababab";

    fn sample_config() -> KeywardConfig {
        KeywardConfig {
            keys: vec![
                KeyConfiguration::new(ID_A, "office", "echo %s", ""),
                KeyConfiguration::new(ID_B, "backup", "", "logger removed"),
            ],
            ..KeywardConfig::default()
        }
    }

    #[test]
    fn bootstrap_template_parses_with_defaults() {
        let cfg = KeywardConfig::parse(&bootstrap_template(), ConfigFormat::Toml).unwrap();
        assert_eq!(cfg.watch.marker_file, "security_key.dat");
        assert_eq!(cfg.watch.poll_interval_ms, 1_000);
        assert!(cfg.notifications.enabled);
        assert!(cfg.keys.is_empty());
        assert!(cfg.validate().is_empty());
    }

    #[test]
    fn load_or_bootstrap_creates_missing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("keyward.toml");
        let cfg = KeywardConfig::load_or_bootstrap(&path).unwrap();
        assert!(path.exists());
        assert_eq!(cfg.path, path);
        assert_eq!(cfg.format, ConfigFormat::Toml);
    }

    #[test]
    fn legacy_json_store_is_understood() {
        let dashed_id = vec!["01"; 32].join("-");
        let payload = format!(
            r#"{{
            "GlobalConfig": {{ "AllowToastNotifications": false }},
            "KeyConfigurations": [
                {{ "Id": "{dashed_id}", "Name": "legacy", "CommandOnPlug": "echo %s", "CommandOnUnplug": "" }}
            ]
        }}"#
        );
        let cfg = KeywardConfig::parse(&payload, ConfigFormat::Json).unwrap();
        assert!(!cfg.notifications.enabled);
        let key = cfg.find_by_identity(ID_A).expect("legacy id should match");
        assert_eq!(key.name, "legacy");
        assert_eq!(key.command_on_arrival, "echo %s");
    }

    #[test]
    fn save_round_trips_through_detected_format() {
        let dir = tempdir().unwrap();
        for name in ["keyward.toml", "keyward.yaml", "keyward.json"] {
            let path = dir.path().join(name);
            let mut cfg = sample_config();
            cfg.path = path.clone();
            cfg.format = ConfigFormat::detect(&path);
            cfg.save().unwrap();

            let loaded = KeywardConfig::load(&path).unwrap();
            assert_eq!(loaded.keys, cfg.keys, "{name}");
            assert_eq!(loaded.format, cfg.format);
        }
    }

    #[test]
    fn lookup_ignores_case_and_separators() {
        let cfg = sample_config();
        assert!(cfg.find_by_identity(&ID_B.to_uppercase()).is_some());
        assert!(cfg.find_by_identity(&"cd".repeat(32)).is_none());
        assert!(cfg.find_by_identity("garbage").is_none());
    }

    #[test]
    fn upsert_and_remove_key_entries() {
        let mut cfg = sample_config();
        let replaced = cfg.upsert_key(KeyConfiguration::new(ID_A, "renamed", "true", ""));
        assert_eq!(replaced.map(|k| k.name), Some("office".to_string()));
        assert_eq!(cfg.keys.len(), 2);
        assert_eq!(cfg.find_key(ID_A).unwrap().name, "renamed");

        assert!(cfg.remove_key(&ID_B.to_uppercase()).is_some());
        assert!(cfg.remove_key(ID_B).is_none());
        assert_eq!(cfg.keys.len(), 1);
    }

    #[test]
    fn validate_reports_bad_entries() {
        let mut cfg = sample_config();
        cfg.keys.push(KeyConfiguration::new(ID_A, "dupe", "true", ""));
        cfg.keys.push(KeyConfiguration::new("xyz", "broken", "", ""));
        cfg.watch.marker_file = "../escape.dat".into();
        cfg.watch.poll_interval_ms = 0;

        let issues = cfg.validate();
        assert!(issues.iter().any(|i| i.contains("duplicate key id")));
        assert!(issues.iter().any(|i| i.contains("invalid id")));
        assert!(issues.iter().any(|i| i.contains("broken has no commands")));
        assert!(issues.iter().any(|i| i.contains("relative to the volume root")));
        assert!(issues.iter().any(|i| i.contains("poll_interval_ms")));
    }

    #[test]
    fn shared_config_reload_picks_up_changes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("keyward.toml");
        let mut cfg = KeywardConfig::load_or_bootstrap(&path).unwrap();
        let shared = SharedConfig::new(cfg.clone());
        assert!(shared.find_by_identity(ID_A).is_none());

        cfg.upsert_key(KeyConfiguration::new(ID_A, "office", "echo %s", ""));
        cfg.save().unwrap();
        assert_eq!(shared.reload().unwrap(), 1);
        assert!(shared.find_by_identity(ID_A).is_some());

        fs::write(&path, "[watch\nbroken").unwrap();
        assert!(shared.reload().is_err());
        assert!(shared.find_by_identity(ID_A).is_some());
    }
}
