// Configuration loading and parsing (paywatch.toml).

use serde::Deserialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

use crate::status::CheckoutRequestId;

/// Placeholder substituted with the checkout request ID in URL templates.
pub const CHECKOUT_ID_PLACEHOLDER: &str = "{checkout_request_id}";

const CONFIG_FILE: &str = "paywatch.toml";

/// Ceiling for every millisecond delay and cadence.
const MAX_DELAY_MS: u64 = 3_600_000;
/// Ceiling for `timing.payment_window_secs`.
const MAX_PAYMENT_WINDOW_SECS: u64 = 86_400;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("{path} is not valid paywatch config: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("`{field}` {message}")]
    Invalid { field: String, message: String },

    #[error("no config/paywatch.toml or defaults/paywatch.toml under {}", .base_dir.display())]
    NoDefaults { base_dir: PathBuf },

    #[error("cannot seed {target} from the bundled defaults: {source}")]
    Seed {
        target: PathBuf,
        source: std::io::Error,
    },
}

impl ConfigError {
    fn invalid(field: &str, message: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Top-level assembled Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Config {
    pub endpoints: EndpointConfig,
    pub polling: PollingConfig,
    pub push: PushConfig,
    pub timing: TimingConfig,
    pub db_path: String,
}

/// Raw deserialization target for paywatch.toml.
#[derive(Debug, Clone, Deserialize)]
struct ConfigFile {
    endpoints: EndpointConfig,
    polling: PollingConfig,
    push: PushConfig,
    timing: TimingConfig,
    database: DatabaseSection,
}

#[derive(Debug, Clone, Deserialize)]
struct DatabaseSection {
    path: String,
}

/// URL templates. Any of them may contain `{checkout_request_id}`.
#[derive(Debug, Clone, Deserialize)]
pub struct EndpointConfig {
    pub status: String,
    pub prompt: String,
    pub success: String,
    pub websocket: String,
    pub stream: String,
    pub complete: String,
    pub checkout: String,
}

impl EndpointConfig {
    pub fn complete_url(&self, id: &CheckoutRequestId) -> String {
        render_url(&self.complete, id)
    }

    pub fn checkout_url(&self, id: &CheckoutRequestId) -> String {
        render_url(&self.checkout, id)
    }
}

/// Substitute the checkout request ID into a URL template.
pub fn render_url(template: &str, id: &CheckoutRequestId) -> String {
    template.replace(CHECKOUT_ID_PLACEHOLDER, id.as_str())
}

#[derive(Debug, Clone, Deserialize)]
pub struct PollingConfig {
    pub initial_delay_ms: u64,
    pub interval_ms: u64,
    pub test_interval_ms: u64,
    pub hidden_interval_ms: u64,
    pub max_checks: u32,
    /// Checks after which a failing query shows the connectivity notice.
    pub connection_issue_after: u32,
    pub request_timeout_ms: u64,
}

impl PollingConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    /// Visible-page cadence for the given attempt.
    pub fn interval_for(&self, test_mode: bool) -> Duration {
        if test_mode {
            Duration::from_millis(self.test_interval_ms)
        } else {
            Duration::from_millis(self.interval_ms)
        }
    }

    pub fn hidden_interval(&self) -> Duration {
        Duration::from_millis(self.hidden_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PushConfig {
    pub websocket: bool,
    pub sse: bool,
    /// Connection attempts per push transport before falling back.
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TimingConfig {
    pub success_redirect_delay_ms: u64,
    /// When set, failed/cancelled/timed-out payments redirect back to
    /// checkout after this delay instead of waiting for a retry.
    #[serde(default)]
    pub failure_redirect_delay_ms: Option<u64>,
    /// Overall deadline for the payment, independent of transport.
    #[serde(default)]
    pub payment_window_secs: Option<u64>,
}

impl TimingConfig {
    pub fn success_redirect_delay(&self) -> Duration {
        Duration::from_millis(self.success_redirect_delay_ms)
    }

    pub fn failure_redirect_delay(&self) -> Option<Duration> {
        self.failure_redirect_delay_ms.map(Duration::from_millis)
    }

    pub fn payment_window(&self) -> Option<Duration> {
        self.payment_window_secs.map(Duration::from_secs)
    }
}

// ---------------------------------------------------------------------------
// Loading logic
// ---------------------------------------------------------------------------

/// Load and validate configuration from `config/paywatch.toml` relative to
/// `base_dir`. Does not copy defaults; see `load_config()`.
pub fn load_config_from(base_dir: &Path) -> Result<Config, ConfigError> {
    let path = base_dir.join("config").join(CONFIG_FILE);
    let text = read_file(&path)?;
    let config = parse_config(&text).map_err(|source| ConfigError::Parse {
        path: path.clone(),
        source,
    })?;

    validate(&config)?;

    Ok(config)
}

fn parse_config(text: &str) -> Result<Config, toml::de::Error> {
    let file: ConfigFile = toml::from_str(text)?;
    Ok(Config {
        endpoints: file.endpoints,
        polling: file.polling,
        push: file.push,
        timing: file.timing,
        db_path: file.database.path,
    })
}

/// Seed `config/paywatch.toml` from `defaults/paywatch.toml` if there is no
/// config yet. Returns the path written, or `None` when one was already in
/// place.
pub fn seed_config(base_dir: &Path) -> Result<Option<PathBuf>, ConfigError> {
    let target = base_dir.join("config").join(CONFIG_FILE);
    if target.exists() {
        return Ok(None);
    }
    let default = base_dir.join("defaults").join(CONFIG_FILE);
    if !default.is_file() {
        return Err(ConfigError::NoDefaults {
            base_dir: base_dir.to_path_buf(),
        });
    }

    let seed_err = |source: std::io::Error| ConfigError::Seed {
        target: target.clone(),
        source,
    };
    let text = std::fs::read(&default).map_err(seed_err)?;
    if let Some(dir) = target.parent() {
        std::fs::create_dir_all(dir).map_err(seed_err)?;
    }
    // create_new: never clobber a config another process just wrote.
    let mut dest = match std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&target)
    {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return Ok(None),
        Err(e) => return Err(seed_err(e)),
    };
    dest.write_all(&text).map_err(seed_err)?;

    Ok(Some(target))
}

/// Seed the config if needed, then load it relative to the current working
/// directory.
pub fn load_config() -> Result<Config, ConfigError> {
    let cwd = std::env::current_dir().map_err(|source| ConfigError::Read {
        path: PathBuf::from("."),
        source,
    })?;
    if let Some(path) = seed_config(&cwd)? {
        info!("Seeded {} from defaults", path.display());
    }
    load_config_from(&cwd)
}

fn read_file(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn validate(config: &Config) -> Result<(), ConfigError> {
    let e = &config.endpoints;
    let mut urls: Vec<(&str, &str)> = vec![
        ("endpoints.status", &e.status),
        ("endpoints.complete", &e.complete),
        ("endpoints.checkout", &e.checkout),
    ];
    if config.push.websocket {
        urls.push(("endpoints.websocket", &e.websocket));
    }
    if config.push.sse {
        urls.push(("endpoints.stream", &e.stream));
    }
    for (name, url) in urls {
        if url.trim().is_empty() {
            return Err(ConfigError::invalid(name, "must not be blank"));
        }
    }

    let p = &config.polling;
    let intervals: &[(&str, u64)] = &[
        ("polling.interval_ms", p.interval_ms),
        ("polling.test_interval_ms", p.test_interval_ms),
        ("polling.hidden_interval_ms", p.hidden_interval_ms),
        ("polling.request_timeout_ms", p.request_timeout_ms),
    ];
    for (name, val) in intervals {
        if *val == 0 {
            return Err(ConfigError::invalid(name, "must be > 0"));
        }
    }

    let t = &config.timing;
    let mut delays: Vec<(&str, u64)> = vec![
        ("polling.initial_delay_ms", p.initial_delay_ms),
        ("timing.success_redirect_delay_ms", t.success_redirect_delay_ms),
    ];
    delays.extend(intervals);
    if let Some(ms) = t.failure_redirect_delay_ms {
        delays.push(("timing.failure_redirect_delay_ms", ms));
    }
    for (name, val) in delays {
        if val > MAX_DELAY_MS {
            return Err(ConfigError::invalid(
                name,
                format!("must be at most {MAX_DELAY_MS} (one hour)"),
            ));
        }
    }

    if p.max_checks == 0 {
        return Err(ConfigError::invalid("polling.max_checks", "must be > 0"));
    }

    if (config.push.websocket || config.push.sse) && config.push.max_attempts == 0 {
        return Err(ConfigError::invalid(
            "push.max_attempts",
            "must be > 0 when a push transport is enabled",
        ));
    }

    match t.payment_window_secs {
        Some(0) => {
            return Err(ConfigError::invalid(
                "timing.payment_window_secs",
                "must be > 0 (omit it to disable the window)",
            ));
        }
        Some(secs) if secs > MAX_PAYMENT_WINDOW_SECS => {
            return Err(ConfigError::invalid(
                "timing.payment_window_secs",
                format!("must be at most {MAX_PAYMENT_WINDOW_SECS} (one day)"),
            ));
        }
        _ => {}
    }

    if config.db_path.trim().is_empty() {
        return Err(ConfigError::invalid("database.path", "must not be blank"));
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
