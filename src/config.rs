//! Configuration handling for db-kit.
//!
//! Every setting can come from a command-line flag or an environment variable
//! and falls back to a default. The same struct is used by library callers,
//! who can build it programmatically, from the environment or from a URL.

use crate::db::retry::RetryPolicy;
use crate::error::{DbError, DbResult};
use clap::{Args, Parser, ValueEnum};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 5432;
pub const DEFAULT_USER: &str = "postgres";
pub const DEFAULT_PASSWORD: &str = "postgres";
pub const DEFAULT_DATABASE: &str = "postgres";
pub const DEFAULT_LOG_LEVEL: &str = "INFO";
pub const DEFAULT_MIGRATIONS_DIR: &str = "./tmp/migrations";
pub const DEFAULT_BACKUPS_DIR: &str = "./tmp/backups";

// Pool defaults
pub const DEFAULT_MAX_OPEN_CONNS: u32 = 25;
pub const DEFAULT_MAX_IDLE_CONNS: u32 = 5;
pub const DEFAULT_CONN_MAX_LIFETIME: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_CONN_MAX_IDLE_TIME: Duration = Duration::from_secs(60);

// Timeouts
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_STATEMENT_TIMEOUT: Duration = Duration::from_secs(30);

// Retry defaults
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(100);
pub const DEFAULT_RETRY_MAX_DELAY: Duration = Duration::from_secs(5);

const APPLICATION_NAME: &str = "db-kit";

/// TLS negotiation mode, mirroring libpq's `sslmode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum SslMode {
    #[default]
    Disable,
    Allow,
    Prefer,
    Require,
    VerifyCa,
    VerifyFull,
}

impl SslMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disable => "disable",
            Self::Allow => "allow",
            Self::Prefer => "prefer",
            Self::Require => "require",
            Self::VerifyCa => "verify-ca",
            Self::VerifyFull => "verify-full",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        <Self as ValueEnum>::from_str(s, true).ok()
    }
}

impl fmt::Display for SslMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<SslMode> for PgSslMode {
    fn from(mode: SslMode) -> Self {
        match mode {
            SslMode::Disable => PgSslMode::Disable,
            SslMode::Allow => PgSslMode::Allow,
            SslMode::Prefer => PgSslMode::Prefer,
            SslMode::Require => PgSslMode::Require,
            SslMode::VerifyCa => PgSslMode::VerifyCa,
            SslMode::VerifyFull => PgSslMode::VerifyFull,
        }
    }
}

/// Connection, pool, timeout and retry settings.
#[derive(Clone, Args)]
pub struct Config {
    /// PostgreSQL host
    #[arg(long, env = "POSTGRES_HOST", default_value = DEFAULT_HOST)]
    pub host: String,

    /// PostgreSQL port
    #[arg(long, env = "POSTGRES_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// PostgreSQL user
    #[arg(long, env = "POSTGRES_USER", default_value = DEFAULT_USER)]
    pub user: String,

    /// PostgreSQL password
    #[arg(
        long,
        env = "POSTGRES_PASSWORD",
        default_value = DEFAULT_PASSWORD,
        hide_env_values = true,
        hide_default_value = true
    )]
    pub password: String,

    /// PostgreSQL database name
    #[arg(long = "db", env = "POSTGRES_DB", default_value = DEFAULT_DATABASE)]
    pub database: String,

    /// TLS mode
    #[arg(long, value_enum, env = "POSTGRES_SSL_MODE", default_value = "disable")]
    pub ssl_mode: SslMode,

    /// Client certificate path
    #[arg(long, env = "POSTGRES_SSL_CERT")]
    pub ssl_cert: Option<PathBuf>,

    /// Client private key path
    #[arg(long, env = "POSTGRES_SSL_KEY")]
    pub ssl_key: Option<PathBuf>,

    /// Root certificate path
    #[arg(long, env = "POSTGRES_SSL_ROOT_CERT")]
    pub ssl_root_cert: Option<PathBuf>,

    /// Maximum number of open connections
    #[arg(long, env = "POSTGRES_MAX_OPEN_CONNS", default_value_t = DEFAULT_MAX_OPEN_CONNS)]
    pub max_open_conns: u32,

    /// Number of idle connections kept warm
    #[arg(long, env = "POSTGRES_MAX_IDLE_CONNS", default_value_t = DEFAULT_MAX_IDLE_CONNS)]
    pub max_idle_conns: u32,

    /// Maximum lifetime of a connection (e.g. "5m")
    #[arg(
        long,
        env = "POSTGRES_CONN_MAX_LIFETIME",
        default_value = "5m",
        value_parser = humantime::parse_duration
    )]
    pub conn_max_lifetime: Duration,

    /// Maximum idle time of a connection (e.g. "1m")
    #[arg(
        long,
        env = "POSTGRES_CONN_MAX_IDLE_TIME",
        default_value = "1m",
        value_parser = humantime::parse_duration
    )]
    pub conn_max_idle_time: Duration,

    /// Timeout for establishing a connection
    #[arg(
        long,
        env = "POSTGRES_CONNECT_TIMEOUT",
        default_value = "30s",
        value_parser = humantime::parse_duration
    )]
    pub connect_timeout: Duration,

    /// Server-side statement timeout (0 disables it)
    #[arg(
        long,
        env = "POSTGRES_STATEMENT_TIMEOUT",
        default_value = "30s",
        value_parser = humantime::parse_duration
    )]
    pub statement_timeout: Duration,

    /// Attempts per operation for transient failures
    #[arg(long, env = "POSTGRES_RETRY_ATTEMPTS", default_value_t = DEFAULT_RETRY_ATTEMPTS)]
    pub retry_attempts: u32,

    /// Initial delay between retries
    #[arg(
        long,
        env = "POSTGRES_RETRY_DELAY",
        default_value = "100ms",
        value_parser = humantime::parse_duration
    )]
    pub retry_delay: Duration,

    /// Upper bound for the delay between retries
    #[arg(
        long,
        env = "POSTGRES_RETRY_MAX_DELAY",
        default_value = "5s",
        value_parser = humantime::parse_duration
    )]
    pub retry_max_delay: Duration,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "POSTGRES_LOG_LEVEL", default_value = DEFAULT_LOG_LEVEL)]
    pub log_level: String,

    /// Directory holding migration files
    #[arg(long = "migrations", env = "MIGRATIONS_DIR", default_value = DEFAULT_MIGRATIONS_DIR)]
    pub migrations_dir: PathBuf,

    /// Directory receiving backups
    #[arg(long = "backups", env = "BACKUPS_DIR", default_value = DEFAULT_BACKUPS_DIR)]
    pub backups_dir: PathBuf,
}

/// Parser used to read a `Config` from the environment alone.
#[derive(Parser)]
#[command(no_binary_name = true)]
struct EnvConfig {
    #[command(flatten)]
    config: Config,
}

impl Config {
    /// Build a configuration from environment variables and defaults.
    pub fn from_env() -> DbResult<Self> {
        Self::from_args(std::iter::empty::<String>())
    }

    /// Build a configuration from flag-style arguments, the environment and
    /// defaults, in that order of precedence.
    pub fn from_args<I, T>(args: I) -> DbResult<Self>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let parsed = EnvConfig::try_parse_from(args).map_err(|e| {
            DbError::config("failed to parse database configuration")
                .with_source(e)
                .with_operation("load_config")
        })?;
        parsed.config.validate()?;
        Ok(parsed.config)
    }

    /// Build a configuration from a `postgres://` URL on top of the defaults.
    ///
    /// Recognized query parameters: `sslmode`, `sslcert`, `sslkey`,
    /// `sslrootcert`.
    pub fn from_url(url: &str) -> DbResult<Self> {
        let url = Url::parse(url).map_err(|e| {
            DbError::config(format!("invalid database URL: {e}")).with_operation("parse_url")
        })?;

        if !matches!(url.scheme(), "postgres" | "postgresql") {
            return Err(DbError::config(format!(
                "unsupported URL scheme '{}', expected postgres://",
                url.scheme()
            ))
            .with_context("scheme", url.scheme())
            .with_operation("parse_url"));
        }

        let mut config = Self::default();
        if let Some(host) = url.host_str() {
            config.host = host.to_string();
        }
        if let Some(port) = url.port() {
            config.port = port;
        }
        if !url.username().is_empty() {
            config.user = decode(url.username());
        }
        if let Some(password) = url.password() {
            config.password = decode(password);
        }
        if let Some(database) = url.path_segments().and_then(|mut s| s.next()) {
            if !database.is_empty() {
                config.database = decode(database);
            }
        }

        for (key, value) in url.query_pairs() {
            match &*key {
                "sslmode" => {
                    config.ssl_mode = SslMode::parse(&value).ok_or_else(|| {
                        DbError::config(format!("invalid sslmode '{value}'"))
                            .with_context("sslmode", value.to_string())
                            .with_operation("parse_url")
                    })?;
                }
                "sslcert" => config.ssl_cert = Some(PathBuf::from(&*value)),
                "sslkey" => config.ssl_key = Some(PathBuf::from(&*value)),
                "sslrootcert" => config.ssl_root_cert = Some(PathBuf::from(&*value)),
                _ => {}
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that can never connect.
    pub fn validate(&self) -> DbResult<()> {
        let fail = |message: &str| {
            Err(DbError::config(message.to_string()).with_operation("validate_config"))
        };

        if self.host.trim().is_empty() {
            return fail("host must not be empty");
        }
        if self.port == 0 {
            return fail("port must be greater than 0");
        }
        if self.user.trim().is_empty() {
            return fail("user must not be empty");
        }
        if self.database.trim().is_empty() {
            return fail("database name must not be empty");
        }
        if self.max_open_conns == 0 {
            return fail("max open connections must be greater than 0");
        }
        if self.max_idle_conns > self.max_open_conns {
            return Err(DbError::config(format!(
                "max idle connections ({}) cannot exceed max open connections ({})",
                self.max_idle_conns, self.max_open_conns
            ))
            .with_context("max_idle_conns", self.max_idle_conns)
            .with_context("max_open_conns", self.max_open_conns)
            .with_operation("validate_config"));
        }
        if self.retry_delay > self.retry_max_delay && !self.retry_max_delay.is_zero() {
            return fail("retry delay cannot exceed retry max delay");
        }
        Ok(())
    }

    /// Driver connection options for this configuration.
    pub fn connect_options(&self) -> PgConnectOptions {
        let mut options = PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.user)
            .password(&self.password)
            .database(&self.database)
            .ssl_mode(self.ssl_mode.into())
            .application_name(APPLICATION_NAME);

        if let Some(path) = &self.ssl_root_cert {
            options = options.ssl_root_cert(path);
        }
        if let Some(path) = &self.ssl_cert {
            options = options.ssl_client_cert(path);
        }
        if let Some(path) = &self.ssl_key {
            options = options.ssl_client_key(path);
        }
        if !self.statement_timeout.is_zero() {
            options = options.options([(
                "statement_timeout",
                self.statement_timeout.as_millis().to_string(),
            )]);
        }
        options
    }

    /// Pool sizing and lifetime options.
    pub fn pool_options(&self) -> PgPoolOptions {
        let non_zero = |d: Duration| if d.is_zero() { None } else { Some(d) };

        PgPoolOptions::new()
            .max_connections(self.max_open_conns)
            .min_connections(self.max_idle_conns.min(self.max_open_conns))
            .max_lifetime(non_zero(self.conn_max_lifetime))
            .idle_timeout(non_zero(self.conn_max_idle_time))
            .acquire_timeout(self.connect_timeout)
            .test_before_acquire(true)
    }

    /// Retry policy derived from the retry settings.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.retry_attempts,
            base_delay: self.retry_delay,
            max_delay: self.retry_max_delay,
        }
    }

    /// `host:port/database`, safe to log.
    pub fn target(&self) -> String {
        format!("{}:{}/{}", self.host, self.port, self.database)
    }
}

// Percent-decode a URL component without treating '+' as a space.
fn decode(s: &str) -> String {
    let escaped = s
        .replace('+', "%2B")
        .replace('&', "%26")
        .replace('=', "%3D");
    url::form_urlencoded::parse(escaped.as_bytes())
        .next()
        .map(|(k, _)| k.into_owned())
        .unwrap_or_else(|| s.to_string())
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            user: DEFAULT_USER.to_string(),
            password: DEFAULT_PASSWORD.to_string(),
            database: DEFAULT_DATABASE.to_string(),
            ssl_mode: SslMode::Disable,
            ssl_cert: None,
            ssl_key: None,
            ssl_root_cert: None,
            max_open_conns: DEFAULT_MAX_OPEN_CONNS,
            max_idle_conns: DEFAULT_MAX_IDLE_CONNS,
            conn_max_lifetime: DEFAULT_CONN_MAX_LIFETIME,
            conn_max_idle_time: DEFAULT_CONN_MAX_IDLE_TIME,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            statement_timeout: DEFAULT_STATEMENT_TIMEOUT,
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            retry_delay: DEFAULT_RETRY_DELAY,
            retry_max_delay: DEFAULT_RETRY_MAX_DELAY,
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            migrations_dir: PathBuf::from(DEFAULT_MIGRATIONS_DIR),
            backups_dir: PathBuf::from(DEFAULT_BACKUPS_DIR),
        }
    }
}

// Password is never printed.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("database", &self.database)
            .field("ssl_mode", &self.ssl_mode)
            .field("ssl_cert", &self.ssl_cert)
            .field("ssl_key", &self.ssl_key)
            .field("ssl_root_cert", &self.ssl_root_cert)
            .field("max_open_conns", &self.max_open_conns)
            .field("max_idle_conns", &self.max_idle_conns)
            .field("conn_max_lifetime", &self.conn_max_lifetime)
            .field("conn_max_idle_time", &self.conn_max_idle_time)
            .field("connect_timeout", &self.connect_timeout)
            .field("statement_timeout", &self.statement_timeout)
            .field("retry_attempts", &self.retry_attempts)
            .field("retry_delay", &self.retry_delay)
            .field("retry_max_delay", &self.retry_max_delay)
            .field("log_level", &self.log_level)
            .field("migrations_dir", &self.migrations_dir)
            .field("backups_dir", &self.backups_dir)
            .finish()
    }
}
