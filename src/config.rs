//! Layered configuration store
//!
//! Precedence, highest first: command-line `--key=value` arguments,
//! environment variables (`P2P_FOO_BAR` -> `foo.bar`), a TOML file (nested
//! tables flatten to dotted keys), built-in defaults. The store is
//! read-mostly; `reload` re-reads the file and environment layers and
//! notifies registered listeners.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::Duration;

pub const ENV_PREFIX: &str = "P2P_";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io { path: PathBuf, source: std::io::Error },
    #[error("failed to parse config file {path}: {source}")]
    Parse { path: PathBuf, source: toml::de::Error },
    #[error("bad argument '{0}', expected --key=value")]
    BadArgument(String),
    #[error("no free port found starting from {base}")]
    NoFreePort { base: u16 },
}

/// A failed validation, as reported by [`ConfigStore::validate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigViolation {
    pub key: String,
    pub value: String,
    pub message: String,
}

type Validator = Box<dyn Fn(&str) -> Result<(), String> + Send + Sync>;
type ReloadListener = Box<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Layers {
    defaults: HashMap<String, String>,
    file: HashMap<String, String>,
    env: HashMap<String, String>,
    args: HashMap<String, String>,
    file_path: Option<PathBuf>,
}

impl Layers {
    fn get(&self, key: &str) -> Option<&String> {
        self.args
            .get(key)
            .or_else(|| self.env.get(key))
            .or_else(|| self.file.get(key))
            .or_else(|| self.defaults.get(key))
    }
}

pub struct ConfigStore {
    layers: RwLock<Layers>,
    validators: RwLock<HashMap<String, Validator>>,
    listeners: RwLock<Vec<ReloadListener>>,
}

impl std::fmt::Debug for ConfigStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigStore").finish_non_exhaustive()
    }
}

impl ConfigStore {
    /// A store seeded with the built-in defaults and the current environment.
    pub fn new() -> Self {
        let store = Self {
            layers: RwLock::new(Layers { defaults: builtin_defaults(), ..Default::default() }),
            validators: RwLock::new(HashMap::new()),
            listeners: RwLock::new(Vec::new()),
        };
        store.load_env();
        store
    }

    /// Load (or re-load) a TOML config file into the file layer.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
        let value: toml::Value = raw
            .parse()
            .map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })?;

        let mut flat = HashMap::new();
        flatten_toml(&value, String::new(), &mut flat);

        let mut layers = self.layers.write().unwrap_or_else(|p| p.into_inner());
        layers.file = flat;
        layers.file_path = Some(path.to_path_buf());
        tracing::info!(path = %path.display(), keys = layers.file.len(), "loaded config file");
        Ok(())
    }

    /// Scan the environment for `P2P_`-prefixed variables.
    pub fn load_env(&self) {
        let mut env = HashMap::new();
        for (name, value) in std::env::vars() {
            if let Some(rest) = name.strip_prefix(ENV_PREFIX) {
                env.insert(rest.to_lowercase().replace('_', "."), value);
            }
        }
        self.layers.write().unwrap_or_else(|p| p.into_inner()).env = env;
    }

    /// Apply `--key=value` arguments to the top-precedence layer. Arguments
    /// not starting with `--` or missing `=` are rejected.
    pub fn apply_args<I, S>(&self, args: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut parsed = Vec::new();
        for arg in args {
            let arg = arg.as_ref();
            let body = arg
                .strip_prefix("--")
                .ok_or_else(|| ConfigError::BadArgument(arg.to_string()))?;
            let (key, value) = body
                .split_once('=')
                .ok_or_else(|| ConfigError::BadArgument(arg.to_string()))?;
            if key.is_empty() {
                return Err(ConfigError::BadArgument(arg.to_string()));
            }
            parsed.push((key.to_string(), value.to_string()));
        }
        let mut layers = self.layers.write().unwrap_or_else(|p| p.into_inner());
        for (key, value) in parsed {
            layers.args.insert(key, value);
        }
        Ok(())
    }

    /// Set a single key in the argument layer.
    pub fn set(&self, key: &str, value: impl ToString) {
        self.layers
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .args
            .insert(key.to_string(), value.to_string());
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.layers.read().unwrap_or_else(|p| p.into_inner()).get(key).cloned()
    }

    pub fn get_string(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    pub fn get_int(&self, key: &str, default: i64) -> i64 {
        self.get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.get(key).as_deref() {
            Some("true") | Some("1") | Some("yes") => true,
            Some("false") | Some("0") | Some("no") => false,
            _ => default,
        }
    }

    pub fn get_port(&self, key: &str, default: u16) -> u16 {
        self.get(key)
            .and_then(|v| v.parse().ok())
            .filter(|p| *p > 0)
            .unwrap_or(default)
    }

    pub fn get_millis(&self, key: &str, default: Duration) -> Duration {
        self.get(key)
            .and_then(|v| v.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(default)
    }

    pub fn get_secs(&self, key: &str, default: Duration) -> Duration {
        self.get(key)
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(default)
    }

    /// Re-read the file and environment layers and notify reload listeners.
    pub fn reload(&self) -> Result<(), ConfigError> {
        let path = {
            self.layers.read().unwrap_or_else(|p| p.into_inner()).file_path.clone()
        };
        if let Some(path) = path {
            self.load_file(&path)?;
        }
        self.load_env();
        for listener in self.listeners.read().unwrap_or_else(|p| p.into_inner()).iter() {
            listener();
        }
        Ok(())
    }

    /// Register a callback invoked after every successful reload.
    pub fn on_reload(&self, listener: impl Fn() + Send + Sync + 'static) {
        self.listeners.write().unwrap_or_else(|p| p.into_inner()).push(Box::new(listener));
    }

    /// Register a per-key validation predicate.
    pub fn add_validator(
        &self,
        key: &str,
        validate: impl Fn(&str) -> Result<(), String> + Send + Sync + 'static,
    ) {
        self.validators
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(key.to_string(), Box::new(validate));
    }

    /// Run every registered validator against the effective value of its key.
    pub fn validate(&self) -> Vec<ConfigViolation> {
        let validators = self.validators.read().unwrap_or_else(|p| p.into_inner());
        let mut violations = Vec::new();
        for (key, validate) in validators.iter() {
            let value = self.get(key).unwrap_or_default();
            if let Err(message) = validate(&value) {
                violations.push(ConfigViolation { key: key.clone(), value, message });
            }
        }
        violations.sort_by(|a, b| a.key.cmp(&b.key));
        violations
    }

    /// Probe TCP ports upward from `base` until one binds.
    pub async fn find_available_port(&self, base: u16) -> Result<u16, ConfigError> {
        for port in base..=u16::MAX {
            if tokio::net::TcpListener::bind(("0.0.0.0", port)).await.is_ok() {
                return Ok(port);
            }
        }
        Err(ConfigError::NoFreePort { base })
    }
}

impl Default for ConfigStore {
    fn default() -> Self {
        Self::new()
    }
}

fn flatten_toml(value: &toml::Value, prefix: String, out: &mut HashMap<String, String>) {
    match value {
        toml::Value::Table(table) => {
            for (key, value) in table {
                let full = if prefix.is_empty() { key.clone() } else { format!("{prefix}.{key}") };
                flatten_toml(value, full, out);
            }
        }
        toml::Value::String(s) => {
            out.insert(prefix, s.clone());
        }
        other => {
            out.insert(prefix, other.to_string());
        }
    }
}

fn builtin_defaults() -> HashMap<String, String> {
    let pairs: &[(&str, &str)] = &[
        ("tracker.port", "6000"),
        ("tracker.thread.pool.size", "10"),
        ("tracker.peer.timeout.ms", "90000"),
        ("tracker.cleanup.interval.ms", "60000"),
        ("indexserver.port", "6001"),
        ("indexserver.thread.pool.size", "10"),
        ("indexserver.storage.dir", "data"),
        ("indexserver.storage.file", "file_index.dat"),
        ("indexserver.cache.ttl.ms", "60000"),
        ("indexserver.cache.refresh.ms", "300000"),
        ("indexserver.connection.pool.max", "100"),
        ("indexserver.connection.timeout.ms", "5000"),
        ("peer.port.base", "7000"),
        ("peer.socket.timeout.ms", "30000"),
        ("peer.heartbeat.interval.seconds", "30"),
        ("healthcheck.enabled", "true"),
        ("healthcheck.port", "8080"),
        ("healthcheck.path", "/health"),
        ("bootstrap.auto.start", "true"),
        ("bootstrap.startup.timeout.seconds", "30"),
        ("bootstrap.dynamic.ports", "false"),
        ("discovery.distributed.enabled", "false"),
        ("discovery.gossip.port", "8765"),
        ("discovery.gossip.group", "239.255.0.1"),
        ("discovery.gossip.ttl", "4"),
        ("discovery.gossip.interval.ms", "30000"),
        ("discovery.gossip.expire.ms", "90000"),
        ("discovery.gossip.bootstrap.peers", ""),
    ];
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}
