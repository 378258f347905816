//! Application configuration.
//!
//! Configuration is loaded from a TOML file at:
//! 1. `$BOUNCEWATCH_CONFIG` (environment variable)
//! 2. `~/.config/bouncewatch/config.toml` (Linux/macOS)
//!    `%APPDATA%\bouncewatch\config.toml` (Windows)
//! 3. Built-in defaults

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, Local, Offset, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Default subject of Postfix bounce notifications.
pub const DEFAULT_SUBJECT: &str = "Undelivered Mail Returned to Sender";

/// Port used when an overridden IMAP port is out of range.
pub const DEFAULT_IMAP_PORT: u16 = 993;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General behavior settings.
    pub general: GeneralConfig,
    /// Which mailbox and messages to watch.
    pub watcher: WatcherConfig,
    /// Where the mail plugin's options are read from.
    pub upstream: UpstreamConfig,
    /// Job scheduling and polling.
    pub schedule: ScheduleConfig,
    /// Network timeouts.
    pub timeouts: TimeoutConfig,
    /// DSN field mapping.
    pub mapper: MapperConfig,
}

/// General behavior settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log level: "error", "warn", "info", "debug", "trace".
    pub log_level: String,
    /// Override directory for the record store, status, queue, and logs.
    pub data_dir: Option<PathBuf>,
    /// Site timezone: "local", "UTC", or a fixed offset like "+02:00".
    pub timezone: String,
}

/// Mailbox selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    /// Mailbox searched for bounces.
    pub mailbox: String,
    /// Exact subject filter; empty searches every unseen message.
    pub subject: String,
    /// Use `imap_port` instead of the SMTP port.
    pub override_port: bool,
    /// IMAP port used when `override_port` is set.
    pub imap_port: u32,
}

/// Upstream mail plugin settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// JSON export of the mail plugin's options.
    pub options_file: Option<PathBuf>,
}

/// Parse job scheduling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Maximum parse jobs scheduled per run.
    pub max_jobs: usize,
    /// Spacing between consecutive parse jobs, in seconds.
    pub delay_step_secs: u64,
    /// Run lock expiry, in seconds.
    pub lock_ttl_secs: u64,
    /// Interval between periodic checks in `watch` mode, in seconds.
    pub poll_interval_secs: u64,
    /// Age after which an unparsed record is eligible for re-scan, in hours.
    pub rescan_after_hours: u64,
}

/// Network timeouts, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub open_secs: u64,
    pub read_secs: u64,
    pub write_secs: u64,
    /// Wall-clock ceiling of an on-demand run.
    pub request_ceiling_secs: u64,
}

/// DSN field mapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MapperConfig {
    /// Per-message fields naming the original sender, tried in order.
    pub sender_keys: Vec<String>,
}

// ── Default implementations ─────────────────────────────────────

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "warn".to_string(),
            data_dir: None,
            timezone: "local".to_string(),
        }
    }
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            mailbox: "INBOX".to_string(),
            subject: DEFAULT_SUBJECT.to_string(),
            override_port: false,
            imap_port: u32::from(DEFAULT_IMAP_PORT),
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            max_jobs: 50,
            delay_step_secs: 10,
            lock_ttl_secs: 300,
            poll_interval_secs: 3600,
            rescan_after_hours: 24,
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            open_secs: 15,
            read_secs: 15,
            write_secs: 15,
            request_ceiling_secs: 25,
        }
    }
}

impl Default for MapperConfig {
    fn default() -> Self {
        Self {
            sender_keys: vec!["X-Postfix-Sender".to_string()],
        }
    }
}

impl WatcherConfig {
    /// IMAP port to connect to, given the upstream SMTP port.
    pub fn effective_port(&self, smtp_port: u16) -> u16 {
        if !self.override_port {
            return smtp_port;
        }
        match u16::try_from(self.imap_port) {
            Ok(port) if port > 0 => port,
            _ => DEFAULT_IMAP_PORT,
        }
    }
}

impl TimeoutConfig {
    pub fn open(&self) -> Duration {
        Duration::from_secs(self.open_secs)
    }

    pub fn read(&self) -> Duration {
        Duration::from_secs(self.read_secs)
    }

    pub fn write(&self) -> Duration {
        Duration::from_secs(self.write_secs)
    }

    pub fn request_ceiling(&self) -> Duration {
        Duration::from_secs(self.request_ceiling_secs)
    }
}

impl Config {
    /// Parsed site timezone; an invalid setting falls back to local time.
    pub fn site_timezone(&self) -> SiteTimezone {
        SiteTimezone::parse(&self.general.timezone).unwrap_or_else(|| {
            tracing::warn!(
                timezone = %self.general.timezone,
                "Invalid timezone, using local time"
            );
            SiteTimezone::Local
        })
    }
}

// ── Site timezone ───────────────────────────────────────────────

/// Timezone in which arrival dates are stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiteTimezone {
    /// The host's local timezone.
    Local,
    Fixed(FixedOffset),
}

impl SiteTimezone {
    /// Parse `local`, `UTC`, `Z`, or an offset such as `+02:00` / `-0530`.
    pub fn parse(input: &str) -> Option<Self> {
        let s = input.trim();
        if s.eq_ignore_ascii_case("local") {
            return Some(Self::Local);
        }
        if s.eq_ignore_ascii_case("utc") || s.eq_ignore_ascii_case("z") {
            return FixedOffset::east_opt(0).map(Self::Fixed);
        }

        let (sign, rest) = match s.as_bytes().first()? {
            b'+' => (1, &s[1..]),
            b'-' => (-1, &s[1..]),
            _ => return None,
        };
        let digits: String = rest.chars().filter(|c| *c != ':').collect();
        if digits.len() != 4 || !digits.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
        let hours: i32 = digits[..2].parse().ok()?;
        let minutes: i32 = digits[2..].parse().ok()?;
        if minutes >= 60 {
            return None;
        }
        FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60)).map(Self::Fixed)
    }

    /// Express `instant` in this timezone.
    pub fn convert<Tz: TimeZone>(&self, instant: &DateTime<Tz>) -> DateTime<FixedOffset> {
        let utc = instant.with_timezone(&Utc);
        match self {
            Self::Local => {
                let local = utc.with_timezone(&Local);
                local.with_timezone(&local.offset().fix())
            }
            Self::Fixed(offset) => utc.with_timezone(offset),
        }
    }
}

// ── Load ────────────────────────────────────────────────────────

/// Load configuration, searching standard locations.
///
/// Returns the default configuration if no file is found or on parse error.
pub fn load_config() -> Config {
    if let Some(path) = config_file_path() {
        if path.exists() {
            match std::fs::read_to_string(&path) {
                Ok(contents) => match toml::from_str::<Config>(&contents) {
                    Ok(cfg) => {
                        tracing::info!(path = %path.display(), "Loaded config");
                        return cfg;
                    }
                    Err(e) => {
                        tracing::warn!(
                            path = %path.display(),
                            error = %e,
                            "Failed to parse config, using defaults"
                        );
                    }
                },
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "Failed to read config file, using defaults"
                    );
                }
            }
        }
    }
    Config::default()
}

/// Determine the config file path (checking env var first, then standard dirs).
pub fn config_file_path() -> Option<PathBuf> {
    if let Ok(env_path) = std::env::var("BOUNCEWATCH_CONFIG") {
        return Some(PathBuf::from(env_path));
    }

    dirs::config_dir().map(|d| d.join("bouncewatch").join("config.toml"))
}

/// Directory holding the record store, status, job queue, and logs.
pub fn data_dir(config: &Config) -> PathBuf {
    if let Some(ref dir) = config.general.data_dir {
        return dir.clone();
    }
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("bouncewatch")
}

/// Return the log file path.
pub fn log_file_path(config: &Config) -> PathBuf {
    data_dir(config).join("bouncewatch.log")
}
