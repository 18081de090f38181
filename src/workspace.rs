//! The `.toml` files the dashboard lets an operator browse and edit.
//!
//! Every file operation is confined to one directory; names are bare file
//! names and resolved paths are checked to stay inside that directory so a
//! symlink cannot point an edit elsewhere.

use crate::settings::Settings;
use std::path::{Component, Path, PathBuf};
use tracing::info;

/// Starting content for a new client config
pub const FRPC_TEMPLATE: &str = r#"serverAddr = "1.1.1.1"
serverPort = 7000

[[proxies]]
name = "ssh"
type = "tcp"
localIP = "127.0.0.1"
localPort = 22
remotePort = 18022
"#;

/// Starting content for the server config
pub const FRPS_TEMPLATE: &str = "bindPort = 7000\n";

#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    #[error("file not found: {0}")]
    NotFound(String),
    #[error("file already exists: {0}")]
    AlreadyExists(String),
    #[error("invalid file name: {0:?}")]
    InvalidName(String),
    #[error("path is outside the managed directory: {}", .0.display())]
    OutsideDirectory(PathBuf),
    #[error("not a usable directory: {0}")]
    InvalidDirectory(String),
    #[error("{}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> WorkspaceError + '_ {
    move |source| WorkspaceError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Expand a leading `~` to the home directory
pub fn expand_home(raw: &str) -> PathBuf {
    if raw == "~" {
        if let Some(home) = dirs_next::home_dir() {
            return home;
        }
    } else if let Some(rest) = raw.strip_prefix("~/") {
        if let Some(home) = dirs_next::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(raw)
}

/// Canonical form of `raw` if it names an existing directory
pub fn safe_dir(raw: &str) -> Option<PathBuf> {
    if raw.trim().is_empty() {
        return None;
    }
    let path = std::fs::canonicalize(expand_home(raw.trim())).ok()?;
    path.is_dir().then_some(path)
}

/// Resolve a directory that may not exist yet; relative paths are taken
/// relative to `base`. `.` and `..` components are folded lexically.
pub fn resolve_new_dir(raw: &str, base: &Path) -> Option<PathBuf> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let path = expand_home(raw);
    let joined = if path.is_absolute() { path } else { base.join(path) };

    let mut out = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other),
        }
    }
    Some(out)
}

/// Whether `path` resolves to somewhere strictly below `dir`
pub fn is_within(path: &Path, dir: &Path) -> bool {
    let (Ok(path), Ok(dir)) = (std::fs::canonicalize(path), std::fs::canonicalize(dir)) else {
        return false;
    };
    path != dir && path.starts_with(&dir)
}

/// Whether `path` lies inside any of the managed directories
pub fn within_managed_dirs(path: &Path, settings: &Settings) -> bool {
    settings
        .managed_dirs
        .iter()
        .filter_map(|d| safe_dir(d))
        .any(|dir| is_within(path, &dir))
}

/// The directory currently being edited: `current_dir` if usable, else
/// the first managed directory.
pub fn current_dir(settings: &Settings) -> Result<PathBuf, WorkspaceError> {
    safe_dir(&settings.current_dir)
        .or_else(|| settings.managed_dirs.first().and_then(|d| safe_dir(d)))
        .ok_or_else(|| WorkspaceError::InvalidDirectory(settings.current_dir.clone()))
}

fn check_name(name: &str) -> Result<(), WorkspaceError> {
    let mut components = Path::new(name).components();
    let bare = matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(part)), None) if part == name
    );
    if bare {
        Ok(())
    } else {
        Err(WorkspaceError::InvalidName(name.to_string()))
    }
}

/// File operations scoped to a single directory
#[derive(Debug, Clone)]
pub struct Workspace {
    dir: PathBuf,
}

impl Workspace {
    /// Workspace over an existing directory
    pub fn new(dir: &Path) -> Result<Self, WorkspaceError> {
        let dir = std::fs::canonicalize(dir)
            .ok()
            .filter(|d| d.is_dir())
            .ok_or_else(|| WorkspaceError::InvalidDirectory(dir.display().to_string()))?;
        Ok(Self { dir })
    }

    /// Workspace over the settings' current directory
    pub fn from_settings(settings: &Settings) -> Result<Self, WorkspaceError> {
        Ok(Self {
            dir: current_dir(settings)?,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Names of the `.toml` files in the directory, sorted
    pub fn list_toml_files(&self) -> Result<Vec<String>, WorkspaceError> {
        let entries = std::fs::read_dir(&self.dir).map_err(io_error(&self.dir))?;
        let mut names: Vec<String> = entries
            .filter_map(Result::ok)
            .filter(|e| e.path().is_file())
            .filter_map(|e| e.file_name().into_string().ok())
            .filter(|n| n.to_lowercase().ends_with(".toml"))
            .collect();
        names.sort();
        Ok(names)
    }

    /// Path for `name`, checked to stay inside the directory.
    ///
    /// Anything already at the path, symlinks included, must resolve inside
    /// the directory. A dangling symlink cannot be resolved and is refused,
    /// since writing through it would create its target.
    pub fn resolve(&self, name: &str) -> Result<PathBuf, WorkspaceError> {
        check_name(name)?;
        let path = self.dir.join(name);
        if std::fs::symlink_metadata(&path).is_err() {
            return Ok(path);
        }
        match std::fs::canonicalize(&path) {
            Ok(target) if target != self.dir && target.starts_with(&self.dir) => Ok(path),
            _ => Err(WorkspaceError::OutsideDirectory(path)),
        }
    }

    fn existing(&self, name: &str) -> Result<PathBuf, WorkspaceError> {
        let path = self.resolve(name)?;
        if !path.is_file() {
            return Err(WorkspaceError::NotFound(name.to_string()));
        }
        Ok(path)
    }

    pub fn read(&self, name: &str) -> Result<String, WorkspaceError> {
        let path = self.existing(name)?;
        std::fs::read_to_string(&path).map_err(io_error(&path))
    }

    /// Write `content` to `name`, creating it if needed
    pub fn save(&self, name: &str, content: &str) -> Result<PathBuf, WorkspaceError> {
        let path = self.resolve(name)?;
        std::fs::write(&path, content).map_err(io_error(&path))?;
        info!(path = %path.display(), bytes = content.len(), "Config saved");
        Ok(path)
    }

    /// Create a client config from the template; `.toml` is appended when
    /// missing. Returns the final file name and path.
    pub fn create(&self, name: &str) -> Result<(String, PathBuf), WorkspaceError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(WorkspaceError::InvalidName(name.to_string()));
        }
        let name = if name.to_lowercase().ends_with(".toml") {
            name.to_string()
        } else {
            format!("{name}.toml")
        };
        let path = self.resolve(&name)?;
        if path.exists() {
            return Err(WorkspaceError::AlreadyExists(name));
        }
        std::fs::write(&path, FRPC_TEMPLATE).map_err(io_error(&path))?;
        info!(path = %path.display(), "Config created");
        Ok((name, path))
    }

    /// Delete `name`, returning the path it had
    pub fn delete(&self, name: &str) -> Result<PathBuf, WorkspaceError> {
        let path = self.existing(name)?;
        let canonical = std::fs::canonicalize(&path).map_err(io_error(&path))?;
        std::fs::remove_file(&path).map_err(io_error(&path))?;
        info!(path = %path.display(), "Config deleted");
        Ok(canonical)
    }
}

/// Read the server config at `path`, creating it from the template first if
/// it does not exist yet.
pub fn read_or_create_server_config(path: &Path) -> Result<String, WorkspaceError> {
    if !path.exists() {
        std::fs::write(path, FRPS_TEMPLATE).map_err(io_error(path))?;
        info!(path = %path.display(), "Server config created from template");
    }
    std::fs::read_to_string(path).map_err(io_error(path))
}
