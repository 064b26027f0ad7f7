//! Persisted server settings.
//!
//! Settings live in a plain `key=value` text file, one entry per line:
//!
//! ```text
//! # conductor settings
//! ServerName=Conductor
//! HostAddress=127.0.0.1
//! HostPort=9997
//! CommTickRateMs=50
//! StateTickRateMs=100
//! ```
//!
//! Blank lines and lines starting with `#` are skipped. Unknown keys are
//! ignored. A value that fails to parse keeps the default and logs a warning,
//! so a damaged file never prevents the server from starting.

use std::fs;
use std::path::Path;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::{SettingsError, SettingsResult};

// ============================================================================
// Keys and Defaults
// ============================================================================

const KEY_SERVER_NAME: &str = "ServerName";
const KEY_DEBUG_MODE: &str = "DebugMode";
const KEY_HOST_ADDRESS: &str = "HostAddress";
const KEY_HOST_PORT: &str = "HostPort";
const KEY_COMM_TICK_RATE: &str = "CommTickRateMs";
const KEY_STATE_TICK_RATE: &str = "StateTickRateMs";
const KEY_HEARTBEAT_EVERY: &str = "HeartbeatEvery";
const KEY_GREETING: &str = "Greeting";
const KEY_RESOLVE_TIMEOUT: &str = "ResolveTimeoutMs";

/// Placeholder in the greeting that is replaced by the server name.
pub const SERVER_NAME_PLACEHOLDER: &str = "{ServerName}";

/// Default server name, also used as the heartbeat origin.
pub const DEFAULT_SERVER_NAME: &str = "Conductor";

/// Default listener address.
pub const DEFAULT_HOST_ADDRESS: &str = "127.0.0.1";

/// Default listener port.
pub const DEFAULT_HOST_PORT: u16 = 9997;

/// Default communication tick interval.
pub const DEFAULT_COMM_TICK_RATE: Duration = Duration::from_millis(50);

/// Default state tick interval.
pub const DEFAULT_STATE_TICK_RATE: Duration = Duration::from_millis(100);

/// Heartbeats go out every N communication ticks (about once a second at 20 Hz).
pub const DEFAULT_HEARTBEAT_EVERY: u64 = 20;

/// Default greeting sent to every new connection.
pub const DEFAULT_GREETING: &str = "Welcome to {ServerName}.";

/// Default bound on reverse name resolution.
pub const DEFAULT_RESOLVE_TIMEOUT: Duration = Duration::from_millis(500);

// ============================================================================
// Settings
// ============================================================================

/// Server configuration loaded from the settings file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Name announced in heartbeats and the greeting
    pub server_name: String,

    /// Raises the default log level to debug
    pub debug_mode: bool,

    /// Address the listener binds to
    pub host_address: String,

    /// Port the listener binds to (0 picks an ephemeral port)
    pub host_port: u16,

    /// Interval of the communication (heartbeat) tick
    pub comm_tick_rate: Duration,

    /// Interval of the state (command processing) tick
    pub state_tick_rate: Duration,

    /// Send a heartbeat every N communication ticks
    pub heartbeat_every: u64,

    /// Preamble sent raw to each new connection; empty disables it
    pub greeting: String,

    /// Upper bound for reverse name resolution; zero disables the lookup
    pub resolve_timeout: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_name: DEFAULT_SERVER_NAME.to_string(),
            debug_mode: false,
            host_address: DEFAULT_HOST_ADDRESS.to_string(),
            host_port: DEFAULT_HOST_PORT,
            comm_tick_rate: DEFAULT_COMM_TICK_RATE,
            state_tick_rate: DEFAULT_STATE_TICK_RATE,
            heartbeat_every: DEFAULT_HEARTBEAT_EVERY,
            greeting: DEFAULT_GREETING.to_string(),
            resolve_timeout: DEFAULT_RESOLVE_TIMEOUT,
        }
    }
}

impl Settings {
    /// Parses settings text on top of the defaults.
    pub fn parse(text: &str) -> Self {
        let mut settings = Self::default();
        settings.apply(text);
        settings
    }

    /// Applies every recognised `key=value` line in `text` to these settings.
    pub fn apply(&mut self, text: &str) {
        for (key, value) in parse_pairs(text) {
            self.apply_pair(key, value);
        }
    }

    fn apply_pair(&mut self, key: &str, value: &str) {
        match key {
            KEY_SERVER_NAME => {
                if !value.is_empty() {
                    self.server_name = value.to_string();
                }
            }
            KEY_DEBUG_MODE => match parse_bool(value) {
                Some(enabled) => self.debug_mode = enabled,
                None => reject(key, value, "true or false"),
            },
            KEY_HOST_ADDRESS => {
                if !value.is_empty() {
                    self.host_address = value.to_string();
                }
            }
            KEY_HOST_PORT => match value.parse::<u16>() {
                Ok(port) if port > 0 => self.host_port = port,
                _ => reject(key, value, "a port between 1 and 65535"),
            },
            KEY_COMM_TICK_RATE => match parse_positive_millis(value) {
                Some(rate) => self.comm_tick_rate = rate,
                None => reject(key, value, "a positive number of milliseconds"),
            },
            KEY_STATE_TICK_RATE => match parse_positive_millis(value) {
                Some(rate) => self.state_tick_rate = rate,
                None => reject(key, value, "a positive number of milliseconds"),
            },
            KEY_HEARTBEAT_EVERY => match value.parse::<u64>() {
                Ok(every) if every > 0 => self.heartbeat_every = every,
                _ => reject(key, value, "a positive tick count"),
            },
            KEY_GREETING => self.greeting = value.to_string(),
            KEY_RESOLVE_TIMEOUT => match value.parse::<u64>() {
                Ok(ms) => self.resolve_timeout = Duration::from_millis(ms),
                Err(_) => reject(key, value, "a number of milliseconds"),
            },
            other => debug!(key = other, "Ignoring unknown settings key"),
        }
    }

    /// Renders the settings in file order, one `key=value` per line.
    pub fn to_lines(&self) -> Vec<String> {
        vec![
            format!("{KEY_SERVER_NAME}={}", self.server_name),
            format!("{KEY_DEBUG_MODE}={}", self.debug_mode),
            format!("{KEY_HOST_ADDRESS}={}", self.host_address),
            format!("{KEY_HOST_PORT}={}", self.host_port),
            format!("{KEY_COMM_TICK_RATE}={}", self.comm_tick_rate.as_millis()),
            format!("{KEY_STATE_TICK_RATE}={}", self.state_tick_rate.as_millis()),
            format!("{KEY_HEARTBEAT_EVERY}={}", self.heartbeat_every),
            format!("{KEY_GREETING}={}", self.greeting),
            format!("{KEY_RESOLVE_TIMEOUT}={}", self.resolve_timeout.as_millis()),
        ]
    }

    /// Loads settings from `path`.
    ///
    /// A missing file is not an error: the defaults are written to `path`
    /// and returned.
    pub fn load(path: &Path) -> SettingsResult<Self> {
        if !path.exists() {
            let defaults = Self::default();
            defaults.save(path)?;
            info!(path = %path.display(), "Created default settings file");
            return Ok(defaults);
        }

        let text = fs::read_to_string(path).map_err(|e| io_error(path, e))?;
        let settings = Self::parse(&text);
        debug!(path = %path.display(), "Settings loaded");
        Ok(settings)
    }

    /// Saves settings to `path`, creating parent directories as needed.
    pub fn save(&self, path: &Path) -> SettingsResult<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).map_err(|e| io_error(path, e))?;
            }
        }

        let mut contents = self.to_lines().join("\n");
        contents.push('\n');
        fs::write(path, contents).map_err(|e| io_error(path, e))?;
        debug!(path = %path.display(), "Settings saved");
        Ok(())
    }

    /// Returns `host:port`, bracketing IPv6 literals.
    pub fn bind_address(&self) -> String {
        if self.host_address.contains(':') && !self.host_address.starts_with('[') {
            format!("[{}]:{}", self.host_address, self.host_port)
        } else {
            format!("{}:{}", self.host_address, self.host_port)
        }
    }

    /// Returns the greeting with the server name substituted, or `None`
    /// when greetings are disabled.
    pub fn greeting_line(&self) -> Option<String> {
        if self.greeting.trim().is_empty() {
            return None;
        }
        Some(
            self.greeting
                .replace(SERVER_NAME_PLACEHOLDER, &self.server_name),
        )
    }
}

// ============================================================================
// Parsing Helpers
// ============================================================================

/// Splits settings text into trimmed `(key, value)` pairs.
///
/// Skips blank lines, `#` comments, and lines without `=`. Only the first
/// `=` separates key from value, so values may contain `=`.
pub fn parse_pairs(text: &str) -> impl Iterator<Item = (&str, &str)> {
    text.lines().filter_map(|raw| {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            return None;
        }
        let (key, value) = line.split_once('=')?;
        Some((key.trim(), value.trim()))
    })
}

fn parse_bool(value: &str) -> Option<bool> {
    if value.eq_ignore_ascii_case("true") {
        Some(true)
    } else if value.eq_ignore_ascii_case("false") {
        Some(false)
    } else {
        None
    }
}

fn parse_positive_millis(value: &str) -> Option<Duration> {
    match value.parse::<u64>() {
        Ok(ms) if ms > 0 => Some(Duration::from_millis(ms)),
        _ => None,
    }
}

fn reject(key: &str, value: &str, expected: &str) {
    warn!(key, value, expected, "Invalid settings value, keeping default");
}

fn io_error(path: &Path, error: std::io::Error) -> SettingsError {
    SettingsError::Io {
        path: path.to_path_buf(),
        error: error.to_string(),
    }
}
