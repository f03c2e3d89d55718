use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use tracing::{trace, warn};

use crate::util;

/// Storage backend configuration
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StorageConfig {
    /// In-memory storage (no persistence)
    #[serde(rename = "none")]
    None,

    /// SQLite database (default)
    Sqlite {
        /// Path to the SQLite database file
        #[serde(default = "default_sqlite_path")]
        path: PathBuf,

        /// Retention period in days, readings older than this are deleted
        #[serde(default)]
        retention_days: Option<u32>,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Sqlite {
            path: default_sqlite_path(),
            retention_days: None,
        }
    }
}

impl StorageConfig {
    pub fn retention_days(&self) -> Option<u32> {
        match self {
            StorageConfig::None => None,
            StorageConfig::Sqlite { retention_days, .. } => *retention_days,
        }
    }
}

fn default_sqlite_path() -> PathBuf {
    PathBuf::from("data/logs.db")
}

/// How to launch a supervised process
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct CommandSpec {
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<PathBuf>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// File name of the program, used to recognise running instances
    pub fn program_name(&self) -> String {
        file_name(&self.program)
    }

    /// Does a process command line belong to this command?
    ///
    /// Matches on the program's file name plus the exact argument list, so
    /// `sleep 30` never matches `sleep 31` and interpreters like `python3`
    /// only match the configured script.
    pub fn matches(&self, cmd: &[String]) -> bool {
        let Some((program, args)) = cmd.split_first() else {
            return false;
        };

        file_name(Path::new(program)) == self.program_name() && args == self.args.as_slice()
    }
}

impl std::fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| path.to_string_lossy().to_string())
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct CollectorConfig {
    #[serde(default = "default_collector_host")]
    pub host: String,
    #[serde(default = "default_collector_port")]
    pub port: u16,
    #[serde(default = "default_collector_command")]
    pub command: CommandSpec,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            host: default_collector_host(),
            port: default_collector_port(),
            command: default_collector_command(),
        }
    }
}

impl CollectorConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Resolved socket address, used for port probing
    pub fn socket_addr(&self) -> std::io::Result<SocketAddr> {
        use std::net::ToSocketAddrs;

        self.address().to_socket_addrs()?.next().ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{} resolves to no address", self.address()),
            )
        })
    }
}

fn default_collector_host() -> String {
    String::from("127.0.0.1")
}

fn default_collector_port() -> u16 {
    12345
}

fn default_collector_command() -> CommandSpec {
    CommandSpec::new(util::sibling_binary("sysmon-collector"), Vec::<String>::new())
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct IngesterConfig {
    #[serde(default = "default_ingester_command")]
    pub command: CommandSpec,
    #[serde(default = "default_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub read_timeout_ms: u64,
    #[serde(default = "default_reconnect_backoff_secs")]
    pub reconnect_backoff_secs: u64,
    #[serde(default = "default_cycle_interval_secs")]
    pub cycle_interval_secs: u64,
    #[serde(default = "default_read_buffer_bytes")]
    pub read_buffer_bytes: usize,
}

impl Default for IngesterConfig {
    fn default() -> Self {
        Self {
            command: default_ingester_command(),
            connect_timeout_ms: default_timeout_ms(),
            read_timeout_ms: default_timeout_ms(),
            reconnect_backoff_secs: default_reconnect_backoff_secs(),
            cycle_interval_secs: default_cycle_interval_secs(),
            read_buffer_bytes: default_read_buffer_bytes(),
        }
    }
}

impl IngesterConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_secs(self.reconnect_backoff_secs)
    }

    pub fn cycle_interval(&self) -> Duration {
        Duration::from_secs(self.cycle_interval_secs)
    }
}

fn default_ingester_command() -> CommandSpec {
    CommandSpec::new(util::sibling_binary("sysmon-ingest"), Vec::<String>::new())
}

fn default_timeout_ms() -> u64 {
    5000
}

fn default_reconnect_backoff_secs() -> u64 {
    5
}

fn default_cycle_interval_secs() -> u64 {
    1
}

fn default_read_buffer_bytes() -> usize {
    1024
}

/// External remediation programs, one per action
#[derive(Debug, Clone, serde::Deserialize)]
pub struct ActionsConfig {
    #[serde(default = "default_cleanup_script")]
    pub cleanup: PathBuf,
    #[serde(default = "default_alert_script")]
    pub alert: PathBuf,
}

impl Default for ActionsConfig {
    fn default() -> Self {
        Self {
            cleanup: default_cleanup_script(),
            alert: default_alert_script(),
        }
    }
}

fn default_cleanup_script() -> PathBuf {
    PathBuf::from("./scripts/cleanup.sh")
}

fn default_alert_script() -> PathBuf {
    PathBuf::from("./scripts/alert.sh")
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct SupervisorConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_record_file")]
    pub record_file: String,
    #[serde(default = "default_grace_ms")]
    pub grace_ms: u64,
    #[serde(default = "default_port_timeout_ms")]
    pub port_timeout_ms: u64,
    #[serde(default = "default_port_poll_ms")]
    pub port_poll_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            record_file: default_record_file(),
            grace_ms: default_grace_ms(),
            port_timeout_ms: default_port_timeout_ms(),
            port_poll_ms: default_port_poll_ms(),
        }
    }
}

impl SupervisorConfig {
    pub fn record_path(&self) -> PathBuf {
        self.data_dir.join(&self.record_file)
    }

    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }

    pub fn port_timeout(&self) -> Duration {
        Duration::from_millis(self.port_timeout_ms)
    }

    pub fn port_poll(&self) -> Duration {
        Duration::from_millis(self.port_poll_ms)
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_record_file() -> String {
    String::from("monitor.pid")
}

fn default_grace_ms() -> u64 {
    1000
}

fn default_port_timeout_ms() -> u64 {
    10_000
}

fn default_port_poll_ms() -> u64 {
    250
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct Config {
    #[serde(default)]
    pub collector: CollectorConfig,

    #[serde(default)]
    pub ingester: IngesterConfig,

    #[serde(default)]
    pub actions: ActionsConfig,

    /// Storage configuration (defaults to SQLite in `data/logs.db`)
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub supervisor: SupervisorConfig,
}

impl Config {
    /// Apply environment overrides for the collector endpoint.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(host) = util::get_collector_host() {
            self.collector.host = host;
        }
        self.collector.port = util::get_collector_port(self.collector.port);
        self
    }
}

pub fn read_config_file(path: impl AsRef<Path>) -> anyhow::Result<Config> {
    let path = path.as_ref();
    let file_content = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read configuration file {}", path.display()))?;
    serde_json::from_str(&file_content)
        .map_err(|e| anyhow::anyhow!("Invalid configuration file provided: {e}"))
        .inspect(|config| trace!("loaded config: {config:?}"))
}

/// Load the configuration from an explicit path, `SYSMON_CONFIG`, or
/// fall back to the defaults when neither is given or the file does not
/// exist. A file that exists but cannot be read or parsed is an error.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    let path = path
        .map(Path::to_path_buf)
        .or_else(util::get_config_path);

    let config = match path {
        Some(path) if path.exists() => read_config_file(path)?,
        Some(path) => {
            warn!("configuration file {} not found, using defaults", path.display());
            Config::default()
        }
        None => {
            trace!("no configuration file given, using defaults");
            Config::default()
        }
    };

    Ok(config.with_env_overrides())
}
