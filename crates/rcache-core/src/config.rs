//! Cache configuration.
//!
//! Configuration comes from the environment in practice, but is read
//! through an injected lookup so callers (and tests) can supply it from
//! anywhere.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use rcache_error::{RcacheError, Result};
use rcache_store::{
    Backend, DEFAULT_MAX_PACKET_SIZE, FlatFileBackend, MemoryBackend, SqliteBackend,
};
use serde::{Deserialize, Serialize};

/// Environment variable switching the cache on.
pub const ENV_ENABLED: &str = "RCACHE_ENABLED";
/// Environment variable selecting the backend (`flatfile`, `sqlite`, `memory`).
pub const ENV_BACKEND: &str = "RCACHE_BACKEND";
/// Environment variable naming the flat-file cache directory.
pub const ENV_CACHE_PREFIX: &str = "RCACHE_CACHE_PREFIX";
/// Environment variable naming the SQLite database file.
pub const ENV_SQLITE_PATH: &str = "RCACHE_SQLITE_PATH";
/// Environment variable overriding the packet size bound.
pub const ENV_PACKET_SIZE: &str = "RCACHE_PACKET_SIZE";

/// Smallest accepted packet size bound; leaves room for framing.
pub const MIN_PACKET_SIZE: usize = 256;

const DEFAULT_CACHE_DIR: &str = "cache";
const DEFAULT_SQLITE_FILE: &str = "rcache.db";

// ── Backend selection ────────────────────────────────────────────────

/// Which persistence backend to open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    /// One file per record under `root`.
    FlatFile { root: PathBuf },
    /// A SQLite database file.
    Sqlite { path: PathBuf },
    /// Process-local; nothing survives the process.
    Memory,
}

impl BackendConfig {
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::FlatFile { .. } => "flatfile",
            Self::Sqlite { .. } => "sqlite",
            Self::Memory => "memory",
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self::FlatFile {
            root: PathBuf::from(DEFAULT_CACHE_DIR),
        }
    }
}

impl fmt::Display for BackendConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FlatFile { root } => write!(f, "flatfile:{}", root.display()),
            Self::Sqlite { path } => write!(f, "sqlite:{}", path.display()),
            Self::Memory => f.write_str("memory"),
        }
    }
}

// ── Cache configuration ──────────────────────────────────────────────

/// Top-level switches for the record/replay cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// When off, cached calls and patches pass straight through.
    pub enabled: bool,
    pub backend: BackendConfig,
    /// Upper bound on one stored packet, framing included.
    pub max_packet_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            backend: BackendConfig::default(),
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        }
    }
}

impl CacheConfig {
    /// An enabled configuration using `backend`.
    #[must_use]
    pub fn enabled_with(backend: BackendConfig) -> Self {
        Self {
            enabled: true,
            backend,
            ..Self::default()
        }
    }

    /// Read the configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read the configuration through `lookup`, which maps a variable name
    /// to its value. Unset variables keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(raw) = lookup(ENV_ENABLED) {
            config.enabled = parse_flag(ENV_ENABLED, &raw)?;
        }

        let prefix = lookup(ENV_CACHE_PREFIX)
            .filter(|v| !v.trim().is_empty())
            .map_or_else(|| PathBuf::from(DEFAULT_CACHE_DIR), PathBuf::from);
        let backend = lookup(ENV_BACKEND).unwrap_or_else(|| "flatfile".to_owned());
        config.backend = match backend.trim().to_ascii_lowercase().as_str() {
            "" | "flatfile" | "flat_file" | "files" => BackendConfig::FlatFile { root: prefix },
            "sqlite" => BackendConfig::Sqlite {
                path: lookup(ENV_SQLITE_PATH)
                    .filter(|v| !v.trim().is_empty())
                    .map_or_else(|| prefix.join(DEFAULT_SQLITE_FILE), PathBuf::from),
            },
            "memory" => BackendConfig::Memory,
            other => {
                return Err(RcacheError::Config(format!(
                    "{ENV_BACKEND}: unknown backend `{other}` (expected flatfile, sqlite or memory)"
                )));
            }
        };

        if let Some(raw) = lookup(ENV_PACKET_SIZE) {
            config.max_packet_size = raw.trim().parse().map_err(|err| {
                RcacheError::Config(format!("{ENV_PACKET_SIZE}: `{raw}` is not a size: {err}"))
            })?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_packet_size < MIN_PACKET_SIZE {
            return Err(RcacheError::Config(format!(
                "max_packet_size {} is below the minimum {MIN_PACKET_SIZE}",
                self.max_packet_size
            )));
        }
        Ok(())
    }

    /// Open the configured backend.
    pub fn open_backend(&self) -> Result<Arc<dyn Backend>> {
        Ok(match &self.backend {
            BackendConfig::FlatFile { root } => Arc::new(FlatFileBackend::open(root)?),
            BackendConfig::Sqlite { path } => Arc::new(SqliteBackend::open(path)?),
            BackendConfig::Memory => Arc::new(MemoryBackend::new()),
        })
    }
}

fn parse_flag(name: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "" | "0" | "false" | "no" | "off" => Ok(false),
        other => Err(RcacheError::Config(format!(
            "{name}: `{other}` is not a boolean"
        ))),
    }
}
