// Relay server configuration.
//
// Centralizes environment variable parsing with defaults for local
// development. The database pool reads its own sizing variables in
// `db::pool`.

use std::net::SocketAddr;
use std::time::Duration;

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_MAX_RESIDENT_DOCS: usize = 10_000;
const DEFAULT_IDLE_TTL_SECS: u64 = 300;
const DEFAULT_PERSIST_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Core relay server configuration.
///
/// Constructed via [`RelayConfig::from_env`] which reads environment
/// variables and falls back to development defaults.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Listen address (host:port).
    pub listen_addr: SocketAddr,
    /// PostgreSQL connection string. Without one the relay keeps its
    /// relational mirror in memory.
    pub database_url: Option<String>,
    /// Comma-separated CORS origins (or `"*"` for any).
    pub cors_origins: Option<String>,
    /// Log filter directive (e.g. `info`, `fieldnotes_relay=debug`).
    pub log_filter: String,
    pub log_format: LogFormat,
    /// Upper bound on parcel documents kept in memory.
    pub max_resident_docs: usize,
    /// Documents untouched for this long are unloaded by the sweeper.
    pub idle_ttl: Duration,
    /// Deadline for hydration and for each reconcile pass.
    pub persist_timeout: Duration,
    /// Deadline for a whole HTTP request.
    pub request_timeout: Duration,
    /// Fail mutating requests when any note cannot be persisted.
    pub strict_reconcile: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self::from_env_fn(|_| Err(std::env::VarError::NotPresent))
    }
}

impl RelayConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `FIELDNOTES_RELAY_HOST` | `0.0.0.0` |
    /// | `FIELDNOTES_RELAY_PORT` | `8080` |
    /// | `FIELDNOTES_RELAY_DATABASE_URL` | *(none, in-memory mirror)* |
    /// | `FIELDNOTES_RELAY_CORS_ORIGINS` | *(none, cors.rs uses dev defaults)* |
    /// | `FIELDNOTES_RELAY_LOG_FILTER` | `info` |
    /// | `FIELDNOTES_RELAY_LOG_FORMAT` | `text` (`json` for structured output) |
    /// | `FIELDNOTES_RELAY_MAX_RESIDENT_DOCS` | `10000` |
    /// | `FIELDNOTES_RELAY_IDLE_TTL_SECS` | `300` |
    /// | `FIELDNOTES_RELAY_PERSIST_TIMEOUT_MS` | `5000` |
    /// | `FIELDNOTES_RELAY_REQUEST_TIMEOUT_SECS` | `30` |
    /// | `FIELDNOTES_RELAY_STRICT_RECONCILE` | `false` |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let host = env("FIELDNOTES_RELAY_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 = parse_or(&env, "FIELDNOTES_RELAY_PORT", DEFAULT_PORT);
        let listen_addr = format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));

        let database_url =
            env("FIELDNOTES_RELAY_DATABASE_URL").ok().filter(|value| !value.trim().is_empty());
        let cors_origins = env("FIELDNOTES_RELAY_CORS_ORIGINS").ok();

        let log_filter = env("FIELDNOTES_RELAY_LOG_FILTER").unwrap_or_else(|_| "info".into());
        let log_format = match env("FIELDNOTES_RELAY_LOG_FORMAT").ok().as_deref().map(str::trim) {
            Some(value) if value.eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Text,
        };

        let max_resident_docs =
            parse_or(&env, "FIELDNOTES_RELAY_MAX_RESIDENT_DOCS", DEFAULT_MAX_RESIDENT_DOCS).max(1);
        let idle_ttl =
            Duration::from_secs(parse_or(&env, "FIELDNOTES_RELAY_IDLE_TTL_SECS", DEFAULT_IDLE_TTL_SECS));
        let persist_timeout = Duration::from_millis(parse_or(
            &env,
            "FIELDNOTES_RELAY_PERSIST_TIMEOUT_MS",
            DEFAULT_PERSIST_TIMEOUT_MS,
        ));
        let request_timeout = Duration::from_secs(parse_or(
            &env,
            "FIELDNOTES_RELAY_REQUEST_TIMEOUT_SECS",
            DEFAULT_REQUEST_TIMEOUT_SECS,
        ));

        let strict_reconcile = env("FIELDNOTES_RELAY_STRICT_RECONCILE")
            .ok()
            .map(|value| matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);

        Self {
            listen_addr,
            database_url,
            cors_origins,
            log_filter,
            log_format,
            max_resident_docs,
            idle_ttl,
            persist_timeout,
            request_timeout,
            strict_reconcile,
        }
    }
}

fn parse_or<F, T>(env: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Result<String, std::env::VarError>,
    T: std::str::FromStr,
{
    env(key).ok().and_then(|value| value.trim().parse().ok()).unwrap_or(default)
}
