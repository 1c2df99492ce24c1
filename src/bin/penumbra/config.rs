//! `cli.toml`: where the data directories live and how `gc` behaves.
//!
//! ```toml
//! default_profile = "staging"
//!
//! [data]
//! default = "/var/lib/penumbra"
//!
//! [gc]
//! client_max_inactive_secs = 604800
//! collect_databases = false
//!
//! [profiles.staging]
//! data_dir = "staging"            # relative to this file
//! client_max_inactive_secs = 3600
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// A `[profiles.<name>]` table with relative paths already resolved.
#[derive(Debug, Clone)]
pub struct Profile {
    pub name: String,
    pub data_dir: Option<PathBuf>,
    pub client_max_inactive: Option<Duration>,
    pub collect_databases: Option<bool>,
}

/// Garbage collection settings after applying the active profile.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcDefaults {
    pub client_max_inactive: Option<Duration>,
    pub collect_databases: bool,
}

#[derive(Debug, Default)]
pub struct CliConfig {
    path: Option<PathBuf>,
    file: ConfigFile,
    profiles: BTreeMap<String, Profile>,
}

impl CliConfig {
    /// Reads `explicit`, or the per-user default location. A missing file is
    /// an empty config; a default profile that names no table is an error.
    pub fn load(explicit: Option<PathBuf>) -> Result<Self, ConfigError> {
        let path = explicit.or_else(default_config_path);
        let file = match &path {
            Some(path) if path.exists() => ConfigFile::read(path)?,
            _ => ConfigFile::default(),
        };
        let base = path.as_deref().and_then(Path::parent).unwrap_or(Path::new("."));
        let profiles = file
            .profiles
            .iter()
            .map(|(name, table)| (name.clone(), table.resolve(name, base)))
            .collect::<BTreeMap<_, _>>();
        if let Some(name) = &file.default_profile {
            if !profiles.contains_key(name) {
                return Err(ConfigError::ProfileNotFound { name: name.clone() });
            }
        }
        Ok(Self { path, file, profiles })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn default_profile_name(&self) -> Option<&str> {
        self.file.default_profile.as_deref()
    }

    pub fn profile(&self, name: &str) -> Result<&Profile, ConfigError> {
        self.profiles
            .get(name)
            .ok_or_else(|| ConfigError::ProfileNotFound { name: name.to_string() })
    }

    /// The flag wins, then the active profile, then `[data] default`.
    pub fn resolve_data_dir(&self, flag: Option<PathBuf>, profile: Option<&Profile>) -> Result<PathBuf, ConfigError> {
        flag.or_else(|| profile.and_then(|p| p.data_dir.clone()))
            .or_else(|| self.file.data.default.clone())
            .ok_or(ConfigError::NoDataDir)
    }

    /// `[gc]` with the profile's overrides applied.
    pub fn gc_defaults(&self, profile: Option<&Profile>) -> GcDefaults {
        let gc = &self.file.gc;
        GcDefaults {
            client_max_inactive: profile
                .and_then(|p| p.client_max_inactive)
                .or(gc.client_max_inactive_secs.map(Duration::from_secs)),
            collect_databases: profile
                .and_then(|p| p.collect_databases)
                .or(gc.collect_databases)
                .unwrap_or(false),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    #[serde(default)]
    default_profile: Option<String>,
    #[serde(default)]
    data: DataTable,
    #[serde(default)]
    gc: GcTable,
    #[serde(default)]
    profiles: BTreeMap<String, ProfileTable>,
}

impl ConfigFile {
    fn read(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct DataTable {
    default: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct GcTable {
    client_max_inactive_secs: Option<u64>,
    collect_databases: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ProfileTable {
    data_dir: Option<PathBuf>,
    client_max_inactive_secs: Option<u64>,
    collect_databases: Option<bool>,
}

impl ProfileTable {
    fn resolve(&self, name: &str, base: &Path) -> Profile {
        Profile {
            name: name.to_string(),
            data_dir: self.data_dir.as_ref().map(|dir| base.join(dir)),
            client_max_inactive: self.client_max_inactive_secs.map(Duration::from_secs),
            collect_databases: self.collect_databases,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read { path: PathBuf, source: std::io::Error },
    #[error("invalid config {path}: {source}")]
    Parse { path: PathBuf, source: toml::de::Error },
    #[error("profile '{name}' is not defined")]
    ProfileNotFound { name: String },
    #[error("no data directory; pass --data-dir, set PENUMBRA_DATA_DIR or add [data] default to the config")]
    NoDataDir,
}

pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|base| base.join("penumbra").join("cli.toml"))
}
