//! Persisted dashboard settings: binary paths, config bindings and the
//! registered frpc instances.
//!
//! The store re-reads the JSON file on every access so edits made outside
//! the dashboard are picked up without a restart.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Fixed id of the single frps instance
pub const SERVER_ID: &str = "frps";

/// Which frp binary an instance runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    /// frps, the reverse-proxy server
    Server,
    /// frpc, a reverse-proxy client
    Client,
}

impl ServiceKind {
    pub fn of(id: &str) -> Self {
        if id == SERVER_ID {
            ServiceKind::Server
        } else {
            ServiceKind::Client
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("failed to access settings file {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed settings file {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("instance name may only contain letters, digits, '-' and '_'")]
    InvalidInstanceId(String),
    #[error("an instance name or a config file is required")]
    MissingInstanceName,
    #[error("cannot derive an instance name from the config file name")]
    UnderivableInstanceId,
}

/// Read side of the settings consumed by the supervisor.
///
/// Every call is expected to reflect the current persisted state; callers
/// never cache the results.
pub trait SettingsSource: Send + Sync {
    /// Path of the binary for `kind`, empty when unset
    fn binary_path(&self, kind: ServiceKind) -> Result<String, SettingsError>;

    /// Config path bound to `id`. `None` means the client id is not
    /// registered; the server id is always registered.
    fn config_path(&self, id: &str) -> Result<Option<String>, SettingsError>;

    /// Registered client ids, in registration order
    fn instance_ids(&self) -> Result<Vec<String>, SettingsError>;

    /// Drop the descriptor for `id`. Returns whether it existed.
    fn remove_instance(&self, id: &str) -> Result<bool, SettingsError>;
}

/// A registered frpc instance
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceDescriptor {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub config: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceBinding {
    #[serde(default)]
    pub config: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Services {
    #[serde(default)]
    pub frps: ServiceBinding,

    /// Single-client layout from before instances existed; migrated on load
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frpc: Option<ServiceBinding>,
}

/// Contents of the settings file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub managed_dirs: Vec<String>,
    #[serde(default)]
    pub current_dir: String,
    #[serde(default)]
    pub frpc_path: String,
    #[serde(default)]
    pub frps_path: String,
    #[serde(default)]
    pub services: Services,
    #[serde(default)]
    pub frpc_instances: Vec<InstanceDescriptor>,
}

impl Settings {
    pub fn binary_path(&self, kind: ServiceKind) -> &str {
        match kind {
            ServiceKind::Server => &self.frps_path,
            ServiceKind::Client => &self.frpc_path,
        }
    }

    pub fn find_instance(&self, id: &str) -> Option<&InstanceDescriptor> {
        self.frpc_instances.iter().find(|i| i.id == id)
    }

    pub fn find_instance_mut(&mut self, id: &str) -> Option<&mut InstanceDescriptor> {
        self.frpc_instances.iter_mut().find(|i| i.id == id)
    }

    /// Config bound to `id`, covering both the server and clients
    pub fn config_for(&self, id: &str) -> Option<&str> {
        if id == SERVER_ID {
            Some(&self.services.frps.config)
        } else {
            self.find_instance(id).map(|i| i.config.as_str())
        }
    }

    /// Fill in defaults relative to `root`, migrate the legacy single-client
    /// binding and normalize the instance list.
    fn apply_defaults(&mut self, root: &Path) {
        if self.managed_dirs.is_empty() {
            self.managed_dirs.push(root.display().to_string());
        }
        if self.current_dir.is_empty() {
            self.current_dir = self.managed_dirs[0].clone();
        }
        if self.services.frps.config.is_empty() {
            self.services.frps.config = root.join(SERVER_CONFIG_FILE).display().to_string();
        }

        if let Some(legacy) = self.services.frpc.take() {
            if !legacy.config.is_empty()
                && !self.frpc_instances.iter().any(|i| i.config == legacy.config)
            {
                info!(config = %legacy.config, "Migrating legacy frpc binding to instance 'default'");
                self.frpc_instances.push(InstanceDescriptor {
                    id: "default".to_string(),
                    config: legacy.config,
                });
            }
        }

        self.normalize_instances();
    }

    /// Trim fields, drop entries without an id and collapse duplicate ids.
    /// A duplicate keeps the position of its first occurrence and the config
    /// of its last.
    pub fn normalize_instances(&mut self) {
        let mut positions: HashMap<String, usize> = HashMap::new();
        let mut unique: Vec<InstanceDescriptor> = Vec::with_capacity(self.frpc_instances.len());

        for item in self.frpc_instances.drain(..) {
            let id = item.id.trim().to_string();
            if id.is_empty() {
                continue;
            }
            let config = item.config.trim().to_string();
            match positions.get(&id) {
                Some(&idx) => unique[idx].config = config,
                None => {
                    positions.insert(id.clone(), unique.len());
                    unique.push(InstanceDescriptor { id, config });
                }
            }
        }

        self.frpc_instances = unique;
    }
}

/// File name of the server config, kept beside the settings file
pub const SERVER_CONFIG_FILE: &str = "frps.toml";

/// JSON-file backed settings
pub struct SettingsStore {
    path: PathBuf,
    root: PathBuf,
    /// Serializes load-modify-save cycles
    write_lock: Mutex<()>,
}

impl SettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let root = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let root = std::fs::canonicalize(&root).unwrap_or(root);
        Self {
            path,
            root,
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Directory holding the settings file
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Where the server config lives when it is edited through the dashboard
    pub fn server_config_path(&self) -> PathBuf {
        self.root.join(SERVER_CONFIG_FILE)
    }

    /// Load settings, falling back to defaults when the file does not exist
    pub fn load(&self) -> Result<Settings, SettingsError> {
        let mut settings = match std::fs::read_to_string(&self.path) {
            Ok(content) => serde_json::from_str(&content).map_err(|source| SettingsError::Parse {
                path: self.path.clone(),
                source,
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Settings::default(),
            Err(source) => {
                return Err(SettingsError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        settings.apply_defaults(&self.root);
        Ok(settings)
    }

    pub fn save(&self, settings: &mut Settings) -> Result<(), SettingsError> {
        settings.normalize_instances();
        let io_err = |source| SettingsError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let json = serde_json::to_string_pretty(settings).map_err(|source| SettingsError::Parse {
            path: self.path.clone(),
            source,
        })?;
        std::fs::write(&self.path, json).map_err(io_err)?;
        debug!(path = %self.path.display(), "Settings saved");
        Ok(())
    }

    /// Load, apply `f`, save. Concurrent updates are serialized.
    pub fn update<T>(&self, f: impl FnOnce(&mut Settings) -> T) -> Result<T, SettingsError> {
        let _guard = self.write_lock.lock();
        let mut settings = self.load()?;
        let out = f(&mut settings);
        self.save(&mut settings)?;
        Ok(out)
    }

    pub fn set_binary_paths(&self, frpc_path: &str, frps_path: &str) -> Result<(), SettingsError> {
        self.update(|s| {
            s.frpc_path = frpc_path.trim().to_string();
            s.frps_path = frps_path.trim().to_string();
        })
    }

    pub fn set_server_config(&self, config: &Path) -> Result<(), SettingsError> {
        self.update(|s| s.services.frps.config = config.display().to_string())
    }

    /// Register a client instance.
    ///
    /// Without an explicit id the config file stem is sanitized into one.
    /// A taken id gets a numeric suffix instead of failing. The config path
    /// is stored as given; callers check existence and canonicalize.
    pub fn add_instance(
        &self,
        requested_id: Option<&str>,
        config: Option<&Path>,
    ) -> Result<InstanceDescriptor, SettingsError> {
        let requested = requested_id.map(str::trim).filter(|s| !s.is_empty());
        let base_id = match (requested, config) {
            (Some(id), _) => id.to_string(),
            (None, Some(config)) => {
                let stem = config_stem(config);
                let id = sanitize_instance_id(&stem);
                if id.is_empty() {
                    return Err(SettingsError::UnderivableInstanceId);
                }
                id
            }
            (None, None) => return Err(SettingsError::MissingInstanceName),
        };
        if !is_valid_instance_id(&base_id) {
            return Err(SettingsError::InvalidInstanceId(base_id));
        }

        let config = config.map(|c| c.display().to_string()).unwrap_or_default();
        let _guard = self.write_lock.lock();
        let mut settings = self.load()?;
        let id = unique_instance_id(&settings, &base_id);
        let descriptor = InstanceDescriptor { id, config };
        settings.frpc_instances.push(descriptor.clone());
        self.save(&mut settings)?;
        info!(id = %descriptor.id, config = %descriptor.config, "Instance added");
        Ok(descriptor)
    }

    /// Rebind an instance's config. Returns false for an unknown id.
    pub fn set_instance_config(&self, id: &str, config: &str) -> Result<bool, SettingsError> {
        self.update(|s| match s.find_instance_mut(id) {
            Some(instance) => {
                instance.config = config.to_string();
                true
            }
            None => false,
        })
    }

    /// Clear every instance binding that resolves to `file`. Returns the
    /// affected ids.
    pub fn clear_bindings_to(&self, file: &Path) -> Result<Vec<String>, SettingsError> {
        self.update(|s| {
            let mut cleared = Vec::new();
            for instance in &mut s.frpc_instances {
                if !instance.config.is_empty() && same_file(Path::new(&instance.config), file) {
                    instance.config.clear();
                    cleared.push(instance.id.clone());
                }
            }
            cleared
        })
    }
}

impl SettingsSource for SettingsStore {
    fn binary_path(&self, kind: ServiceKind) -> Result<String, SettingsError> {
        Ok(self.load()?.binary_path(kind).to_string())
    }

    fn config_path(&self, id: &str) -> Result<Option<String>, SettingsError> {
        Ok(self.load()?.config_for(id).map(str::to_string))
    }

    fn instance_ids(&self) -> Result<Vec<String>, SettingsError> {
        Ok(self.load()?.frpc_instances.into_iter().map(|i| i.id).collect())
    }

    fn remove_instance(&self, id: &str) -> Result<bool, SettingsError> {
        self.update(|s| {
            let before = s.frpc_instances.len();
            s.frpc_instances.retain(|i| i.id != id);
            s.frpc_instances.len() != before
        })
    }
}

fn config_stem(config: &Path) -> String {
    let name = config
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    match name.strip_suffix(".toml") {
        Some(stem) => stem.to_string(),
        None => name,
    }
}

fn is_id_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '_'
}

pub fn is_valid_instance_id(id: &str) -> bool {
    !id.is_empty() && id.chars().all(is_id_char)
}

/// Replace disallowed characters with '-' and strip leading/trailing '-'/'_'
pub fn sanitize_instance_id(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| if is_id_char(c) { c } else { '-' })
        .collect();
    cleaned.trim_matches(|c| c == '-' || c == '_').to_string()
}

/// `base` if free, otherwise the first free `base-N` for N >= 2. The server
/// id counts as taken.
pub fn unique_instance_id(settings: &Settings, base: &str) -> String {
    let taken = |id: &str| id == SERVER_ID || settings.find_instance(id).is_some();
    if !taken(base) {
        return base.to_string();
    }
    let mut idx = 2;
    loop {
        let candidate = format!("{base}-{idx}");
        if !taken(&candidate) {
            return candidate;
        }
        idx += 1;
    }
}

/// Compare two paths after resolving them; falls back to a literal
/// comparison for paths that cannot be resolved.
pub fn same_file(a: &Path, b: &Path) -> bool {
    match (std::fs::canonicalize(a), std::fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}
