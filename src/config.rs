use crate::error::{Result, VtpError};
use crate::format::ts::{DEFAULT_TS_TIMEOUT, TS_BUFFER_SIZE};
use crate::format::vtp::{
    DEFAULT_BUSY_RETRIES, DEFAULT_BUSY_RETRY_INTERVAL, DEFAULT_CONNECT_TIMEOUT, DEFAULT_PORT,
    DEFAULT_READ_TIMEOUT,
};
use log::{debug, warn};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

/// Files consulted by [`ClientConfig::load`], first readable one wins.
pub const CONFIG_PATHS: [&str; 2] = ["./vtpio.toml", "./config.toml"];

/// Connection and stream settings for a [`PvrClient`](crate::pvr::PvrClient).
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    /// Backend host name or address
    pub host: String,
    /// Backend VTP port
    pub port: u16,
    /// Priority passed to `PROV` when asking for a channel
    pub priority: i32,
    /// TCP connect timeout for the control connection
    pub connect_timeout: Duration,
    /// Per-line reply timeout on the control connection
    pub read_timeout: Duration,
    /// Attempts for list commands answered with "busy"
    pub busy_retries: u32,
    /// Sleep between busy retries
    pub busy_retry_interval: Duration,
    /// How long to wait for the backend to connect a data socket
    pub accept_timeout: Option<Duration>,
    /// Live ring buffer size
    pub ts_buffer_size: usize,
    /// Live poll interval, also the ring buffer wait
    pub poll_interval: Duration,
    /// Consecutive empty live polls before the filler takes over
    pub empty_poll_limit: u32,
    /// Minimum spacing of live recovery attempts after a failed one
    pub recovery_interval: Duration,
    /// Upper bound for discarding in-flight bytes after a recording seek
    pub seek_flush_timeout: Duration,
    /// Optional payload for the "no signal" filler
    pub no_signal_path: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: String::from("127.0.0.1"),
            port: DEFAULT_PORT,
            priority: 0,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            busy_retries: DEFAULT_BUSY_RETRIES,
            busy_retry_interval: DEFAULT_BUSY_RETRY_INTERVAL,
            accept_timeout: Some(Duration::from_secs(10)),
            ts_buffer_size: TS_BUFFER_SIZE,
            poll_interval: DEFAULT_TS_TIMEOUT,
            empty_poll_limit: 20,
            recovery_interval: Duration::from_secs(2),
            seek_flush_timeout: Duration::from_secs(10),
            no_signal_path: None,
        }
    }
}

impl ClientConfig {
    /// Defaults, then environment variables, then the first readable
    /// config file in [`CONFIG_PATHS`].
    pub fn load() -> Self {
        let mut config = Self::default();
        config.apply_env();

        for path in CONFIG_PATHS {
            match std::fs::read_to_string(path) {
                Ok(content) => {
                    debug!("reading configuration from {}", path);
                    if let Err(e) = config.apply_file_contents(&content) {
                        warn!("ignoring rest of {}: {}", path, e);
                    }
                    break;
                }
                Err(_) => continue,
            }
        }
        config
    }

    /// Parses `vtp://host[:port]`.
    pub fn from_url(url: &str) -> Result<Self> {
        let parsed = Url::parse(url).map_err(|e| VtpError::Config(format!("invalid URL: {}", e)))?;
        if parsed.scheme() != "vtp" {
            return Err(VtpError::Config(format!(
                "URL scheme is not 'vtp': {}",
                parsed.scheme()
            )));
        }
        let host = parsed
            .host_str()
            .ok_or_else(|| VtpError::Config("no host in URL".into()))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();

        Ok(Self {
            host,
            port: parsed.port().unwrap_or(DEFAULT_PORT),
            ..Self::default()
        })
    }

    /// Applies `VTPIO_HOST`, `VTPIO_PORT`, `VTPIO_PRIORITY` and
    /// `VTPIO_NO_SIGNAL_PATH`. Unparsable values are logged and skipped.
    pub fn apply_env(&mut self) {
        for (var, key) in [
            ("VTPIO_HOST", "host"),
            ("VTPIO_PORT", "port"),
            ("VTPIO_PRIORITY", "priority"),
            ("VTPIO_NO_SIGNAL_PATH", "no_signal_path"),
        ] {
            if let Ok(value) = env::var(var) {
                if let Err(e) = self.set(key, &value) {
                    warn!("ignoring {}: {}", var, e);
                }
            }
        }
    }

    /// Applies `key = value` lines. Blank lines and `#` comments are
    /// skipped; values may be quoted.
    pub fn apply_file_contents(&mut self, content: &str) -> Result<()> {
        for (number, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with('[') {
                continue;
            }
            let (key, value) = line.split_once('=').ok_or_else(|| {
                VtpError::Config(format!("line {}: expected key = value", number + 1))
            })?;
            let value = value.trim().trim_matches('"').trim_matches('\'');
            self.set(key.trim(), value)?;
        }
        Ok(())
    }

    /// Sets one option by name. Durations are in milliseconds.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let millis = |v: &str| -> Result<Duration> { Ok(Duration::from_millis(v.parse()?)) };

        match key {
            "host" => self.host = value.to_string(),
            "port" => self.port = value.parse()?,
            "priority" => self.priority = value.parse()?,
            "connect_timeout_ms" => self.connect_timeout = millis(value)?,
            "read_timeout_ms" => self.read_timeout = millis(value)?,
            "busy_retries" => self.busy_retries = value.parse()?,
            "busy_retry_interval_ms" => self.busy_retry_interval = millis(value)?,
            "accept_timeout_ms" => {
                self.accept_timeout = match value.parse::<u64>()? {
                    0 => None,
                    ms => Some(Duration::from_millis(ms)),
                }
            }
            "ts_buffer_size" => self.ts_buffer_size = value.parse()?,
            "poll_interval_ms" => self.poll_interval = millis(value)?,
            "empty_poll_limit" => self.empty_poll_limit = value.parse()?,
            "recovery_interval_ms" => self.recovery_interval = millis(value)?,
            "seek_flush_timeout_ms" => self.seek_flush_timeout = millis(value)?,
            "no_signal_path" => {
                self.no_signal_path = (!value.is_empty()).then(|| PathBuf::from(value))
            }
            other => return Err(VtpError::Config(format!("unknown option '{}'", other))),
        }
        Ok(())
    }

    /// Sets the backend endpoint.
    pub fn with_endpoint(mut self, host: &str, port: u16) -> Self {
        self.host = host.to_string();
        self.port = port;
        self
    }

    /// Sets the `PROV` priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the busy retry policy for list commands.
    pub fn with_busy_retry(mut self, retries: u32, interval: Duration) -> Self {
        self.busy_retries = retries;
        self.busy_retry_interval = interval;
        self
    }

    /// Sets the data socket accept timeout; `None` waits forever.
    pub fn with_accept_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.accept_timeout = timeout;
        self
    }

    /// Sets the live poll interval and the empty-poll limit.
    pub fn with_live_polling(mut self, interval: Duration, empty_poll_limit: u32) -> Self {
        self.poll_interval = interval;
        self.empty_poll_limit = empty_poll_limit;
        self
    }

    /// Sets the spacing of live recovery attempts.
    pub fn with_recovery_interval(mut self, interval: Duration) -> Self {
        self.recovery_interval = interval;
        self
    }

    /// Sets the live ring buffer size.
    pub fn with_ts_buffer_size(mut self, size: usize) -> Self {
        self.ts_buffer_size = size;
        self
    }

    /// Sets the filler payload file.
    pub fn with_no_signal_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.no_signal_path = Some(path.as_ref().to_path_buf());
        self
    }
}

/// Writes a commented template to `path` unless the file exists.
pub fn create_default_config_template<P: AsRef<Path>>(path: P) -> std::io::Result<()> {
    if !path.as_ref().exists() {
        let template = r#"# vtpio configuration
# Durations are in milliseconds.

host = "127.0.0.1"
port = 2004
priority = 0

# connect_timeout_ms = 3000
# read_timeout_ms = 10000
# busy_retries = 5
# busy_retry_interval_ms = 750
# accept_timeout_ms = 10000
# empty_poll_limit = 20
# poll_interval_ms = 100

# Payload shown while no live data arrives
# no_signal_path = "/usr/share/vtpio/noSignal.mpg"
"#;
        std::fs::write(path, template)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.port, 2004);
        assert_eq!(config.busy_retries, 5);
        assert_eq!(config.busy_retry_interval, Duration::from_millis(750));
        assert_eq!(config.empty_poll_limit, 20);
        assert_eq!(config.ts_buffer_size, 2 * 1024 * 1024);
    }

    #[test]
    fn test_file_contents() {
        let mut config = ClientConfig::default();
        config
            .apply_file_contents(
                "# backend\nhost = \"vdr.local\"\nport = 2005\n\nbusy_retry_interval_ms = 100\nno_signal_path = '/tmp/ns.mpg'\naccept_timeout_ms = 0\n",
            )
            .unwrap();
        assert_eq!(config.host, "vdr.local");
        assert_eq!(config.port, 2005);
        assert_eq!(config.busy_retry_interval, Duration::from_millis(100));
        assert_eq!(config.no_signal_path, Some(PathBuf::from("/tmp/ns.mpg")));
        assert_eq!(config.accept_timeout, None);
    }

    #[test]
    fn test_file_contents_errors() {
        let mut config = ClientConfig::default();
        assert!(config.apply_file_contents("port = many").is_err());
        assert!(config.apply_file_contents("colour = blue").is_err());
        assert!(config.apply_file_contents("just words").is_err());
    }

    #[test]
    fn test_from_url() {
        let config = ClientConfig::from_url("vtp://192.168.1.5:2010").unwrap();
        assert_eq!(config.host, "192.168.1.5");
        assert_eq!(config.port, 2010);

        let config = ClientConfig::from_url("vtp://vdr").unwrap();
        assert_eq!(config.port, DEFAULT_PORT);

        assert!(ClientConfig::from_url("rtsp://vdr:554").is_err());
        assert!(ClientConfig::from_url("not a url").is_err());
    }

    #[test]
    fn test_template_round_trips() {
        let path = std::env::temp_dir().join(format!("vtpio-template-{}.toml", std::process::id()));
        let _ = std::fs::remove_file(&path);
        create_default_config_template(&path).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let mut config = ClientConfig::default();
        config.apply_file_contents(&content).unwrap();
        assert_eq!(config, ClientConfig::default());
        std::fs::remove_file(&path).unwrap();
    }
}
