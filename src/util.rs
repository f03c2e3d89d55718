use std::path::PathBuf;

use tracing::level_filters::LevelFilter;
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

const SYSMON_CONFIG: &str = "SYSMON_CONFIG";

pub fn get_config_path() -> Option<PathBuf> {
    std::env::var(SYSMON_CONFIG).ok().map(PathBuf::from)
}

const COLLECTOR_HOST: &str = "SYSMON_COLLECTOR_HOST";

pub fn get_collector_host() -> Option<String> {
    std::env::var(COLLECTOR_HOST)
        .ok()
        .filter(|host| !host.trim().is_empty())
}

const COLLECTOR_PORT: &str = "SYSMON_COLLECTOR_PORT";

pub fn get_collector_port(default: u16) -> u16 {
    let port_from_env = std::env::var(COLLECTOR_PORT);
    port_from_env.map_or(default, |res| res.parse().unwrap_or(default))
}

const SYSMON_LOG: &str = "SYSMON_LOG";

const DEFAULT_LEVEL: LevelFilter = LevelFilter::INFO;

pub fn get_log_level() -> LevelFilter {
    let level_from_env = std::env::var(SYSMON_LOG);
    level_from_env.map_or(DEFAULT_LEVEL, |res| res.parse().unwrap_or(DEFAULT_LEVEL))
}

/// Path of another binary from this package, next to the running one.
///
/// Falls back to the bare name (resolved through `PATH`) when the current
/// executable cannot be determined.
pub fn sibling_binary(name: &str) -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(name)))
        .unwrap_or_else(|| PathBuf::from(name))
}

/// Install the global tracing subscriber for a binary.
pub fn init_tracing(target: &str) {
    dotenv::dotenv().ok();

    let level = get_log_level();
    let filter = filter::Targets::new().with_targets(vec![("sysmon", level), (target, level)]);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact()
                .with_ansi(false),
        )
        .with(filter)
        .init();
}
