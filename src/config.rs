use serde::Deserialize;
use std::fmt;
use std::path::Path;
use std::time::Duration;

/// Environment variable consulted for the power tool when `ipmi_path` is not set
pub const IPMITOOL_ENV: &str = "IPMITOOL";

/// Upper bound for every timeout and interval setting (one year)
pub const MAX_TIMEOUT_SECS: f64 = 365.0 * 24.0 * 60.0 * 60.0;

/// Global configuration for the proxy
///
/// Field names follow the JSON layout of the configuration file. Timeouts
/// and intervals are seconds and may be fractional. A file looks like:
///
/// ```json
/// {
///   "target_host": "192.168.1.50",
///   "port_mappings": [[8080, 80], [8443, 443]],
///   "ipmi_host": "192.168.1.51",
///   "ipmi_user": "ADMIN",
///   "ipmi_password": "secret",
///   "inactivity_timeout": 3600,
///   "check_interval": 0.5
/// }
/// ```
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Address the listeners bind to (default: 0.0.0.0)
    #[serde(default = "default_proxy_host")]
    pub proxy_host: String,

    /// `[listen_port, target_port]` pairs, one listener per pair
    #[serde(default = "default_port_mappings")]
    pub port_mappings: Vec<PortMapping>,

    /// Host name or address of the power-managed backend
    #[serde(default)]
    pub target_host: String,

    /// Out-of-band management endpoint
    #[serde(flatten)]
    pub ipmi: IpmiConfig,

    /// Seconds without traffic before the backend is powered off
    #[serde(default = "default_inactivity_timeout", rename = "inactivity_timeout")]
    pub inactivity_timeout_secs: f64,

    /// Seconds to wait for the backend to become reachable (or unreachable)
    #[serde(default = "default_startup_timeout", rename = "startup_timeout")]
    pub startup_timeout_secs: f64,

    /// Seconds between inactivity checks and between reachability polls
    #[serde(default = "default_check_interval", rename = "check_interval")]
    pub check_interval_secs: f64,

    /// Maximum number of requests held per listener while the backend boots
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,

    /// Seconds a queued request may wait before it expires
    #[serde(default = "default_request_timeout", rename = "request_timeout")]
    pub request_timeout_secs: f64,

    /// Seconds a request may wait to be admitted into a queue
    #[serde(default = "default_queue_admission_timeout", rename = "queue_admission_timeout")]
    pub queue_admission_timeout_secs: f64,

    /// Seconds to wait for the backend's response headers
    #[serde(default = "default_upstream_timeout", rename = "upstream_timeout")]
    pub upstream_timeout_secs: f64,

    /// Seconds allowed for a single reachability connect attempt
    #[serde(default = "default_probe_timeout", rename = "probe_timeout")]
    pub probe_timeout_secs: f64,

    /// Seconds before an idle shutdown is retried after a failed one
    #[serde(default = "default_shutdown_retry_delay", rename = "shutdown_retry_delay")]
    pub shutdown_retry_delay_secs: f64,
}

/// A listener port and the backend port it forwards to
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(from = "(u16, u16)")]
pub struct PortMapping {
    pub listen_port: u16,
    pub target_port: u16,
}

impl PortMapping {
    pub fn new(listen_port: u16, target_port: u16) -> Self {
        Self {
            listen_port,
            target_port,
        }
    }
}

impl From<(u16, u16)> for PortMapping {
    fn from((listen_port, target_port): (u16, u16)) -> Self {
        Self::new(listen_port, target_port)
    }
}

impl fmt::Display for PortMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.listen_port, self.target_port)
    }
}

/// Credentials and tool settings for the management interface
#[derive(Deserialize, Clone)]
pub struct IpmiConfig {
    /// Management controller address
    #[serde(default)]
    pub ipmi_host: String,

    #[serde(default)]
    pub ipmi_user: String,

    #[serde(default)]
    pub ipmi_password: String,

    /// Power tool command line (default: `$IPMITOOL` or `ipmitool`).
    ///
    /// May carry leading arguments, e.g. `"python3 tests/mock_ipmitool.py"`.
    #[serde(default = "default_ipmi_path")]
    pub ipmi_path: String,

    /// Interface passed with `-I` (default: lanplus)
    #[serde(default = "default_ipmi_interface")]
    pub ipmi_interface: String,

    /// Retries after the first failed invocation (default: 3)
    #[serde(default = "default_ipmi_max_retries")]
    pub ipmi_max_retries: u32,

    /// Seconds before a single invocation is abandoned (default: 30)
    #[serde(default = "default_ipmi_command_timeout", rename = "ipmi_command_timeout")]
    pub ipmi_command_timeout_secs: u64,

    /// Base of the exponential backoff between retries (default: 1000ms)
    #[serde(default = "default_ipmi_retry_base_delay")]
    pub ipmi_retry_base_delay_ms: u64,
}

impl fmt::Debug for IpmiConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IpmiConfig")
            .field("ipmi_host", &self.ipmi_host)
            .field("ipmi_user", &"<redacted>")
            .field("ipmi_password", &"<redacted>")
            .field("ipmi_path", &self.ipmi_path)
            .field("ipmi_interface", &self.ipmi_interface)
            .field("ipmi_max_retries", &self.ipmi_max_retries)
            .field("ipmi_command_timeout_secs", &self.ipmi_command_timeout_secs)
            .field("ipmi_retry_base_delay_ms", &self.ipmi_retry_base_delay_ms)
            .finish()
    }
}

impl IpmiConfig {
    /// Create a management config with default tool settings
    pub fn new(host: &str, user: &str, password: &str) -> Self {
        Self {
            ipmi_host: host.to_string(),
            ipmi_user: user.to_string(),
            ipmi_password: password.to_string(),
            ipmi_path: default_ipmi_path(),
            ipmi_interface: default_ipmi_interface(),
            ipmi_max_retries: default_ipmi_max_retries(),
            ipmi_command_timeout_secs: default_ipmi_command_timeout(),
            ipmi_retry_base_delay_ms: default_ipmi_retry_base_delay(),
        }
    }

    /// Set the power tool command line (builder pattern)
    pub fn with_path(mut self, path: &str) -> Self {
        self.ipmi_path = path.to_string();
        self
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.ipmi_command_timeout_secs)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.ipmi_retry_base_delay_ms)
    }

    fn validate(&self, errors: &mut Vec<String>) {
        for (name, value) in [
            ("ipmi_host", &self.ipmi_host),
            ("ipmi_user", &self.ipmi_user),
            ("ipmi_password", &self.ipmi_password),
        ] {
            if value.trim().is_empty() {
                errors.push(format!("'{}' is required", name));
            }
        }

        if shell_words::split(&self.ipmi_path).map_or(true, |parts| parts.is_empty()) {
            errors.push(format!("'ipmi_path' is not a valid command line: {:?}", self.ipmi_path));
        }

        if self.ipmi_interface.trim().is_empty() {
            errors.push("'ipmi_interface' must not be empty".to_string());
        }

        if self.ipmi_command_timeout_secs == 0 {
            errors.push("'ipmi_command_timeout' must be a positive number".to_string());
        } else if self.ipmi_command_timeout_secs as f64 > MAX_TIMEOUT_SECS {
            errors.push(format!(
                "'ipmi_command_timeout' must be at most {} seconds",
                MAX_TIMEOUT_SECS
            ));
        }
    }
}

impl Config {
    /// Create a config for one backend with every optional field defaulted
    pub fn new(target_host: &str, port_mappings: Vec<PortMapping>, ipmi: IpmiConfig) -> Self {
        Self {
            proxy_host: default_proxy_host(),
            port_mappings,
            target_host: target_host.to_string(),
            ipmi,
            inactivity_timeout_secs: default_inactivity_timeout(),
            startup_timeout_secs: default_startup_timeout(),
            check_interval_secs: default_check_interval(),
            max_queue_size: default_max_queue_size(),
            request_timeout_secs: default_request_timeout(),
            queue_admission_timeout_secs: default_queue_admission_timeout(),
            upstream_timeout_secs: default_upstream_timeout(),
            probe_timeout_secs: default_probe_timeout(),
            shutdown_retry_delay_secs: default_shutdown_retry_delay(),
        }
    }

    /// Load and validate a configuration file.
    ///
    /// Files ending in `.toml` are read as TOML, everything else as JSON.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", path.display(), e))?;

        let is_toml = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));

        let config: Config = if is_toml {
            toml::from_str(&content)?
        } else {
            serde_json::from_str(&content)?
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.target_host.trim().is_empty() {
            errors.push("'target_host' is required".to_string());
        }

        self.ipmi.validate(&mut errors);

        if self.port_mappings.is_empty() {
            errors.push(
                "'port_mappings' must be a non-empty list of [listen_port, target_port] pairs"
                    .to_string(),
            );
        }

        for mapping in &self.port_mappings {
            if mapping.listen_port == 0 || mapping.target_port == 0 {
                errors.push(format!(
                    "port mapping [{}, {}]: port numbers must be positive integers",
                    mapping.listen_port, mapping.target_port
                ));
            }
        }

        let mut listen_ports: Vec<u16> = self.port_mappings.iter().map(|m| m.listen_port).collect();
        listen_ports.sort_unstable();
        listen_ports.dedup();
        if listen_ports.len() != self.port_mappings.len() {
            errors.push("'port_mappings' contains the same listen port more than once".to_string());
        }

        if self.max_queue_size == 0 {
            errors.push("'max_queue_size' must be a positive number".to_string());
        }

        let timeouts = [
            ("inactivity_timeout", self.inactivity_timeout_secs),
            ("startup_timeout", self.startup_timeout_secs),
            ("check_interval", self.check_interval_secs),
            ("request_timeout", self.request_timeout_secs),
            ("queue_admission_timeout", self.queue_admission_timeout_secs),
            ("upstream_timeout", self.upstream_timeout_secs),
            ("probe_timeout", self.probe_timeout_secs),
            ("shutdown_retry_delay", self.shutdown_retry_delay_secs),
        ];
        for (name, value) in timeouts {
            if value.is_nan() || value <= 0.0 {
                errors.push(format!("'{}' must be a positive number", name));
            } else if value > MAX_TIMEOUT_SECS {
                errors.push(format!(
                    "'{}' must be at most {} seconds",
                    name, MAX_TIMEOUT_SECS
                ));
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }

    /// Target ports in probe order: the first mapping's port, then the rest
    pub fn target_ports(&self) -> Vec<u16> {
        let mut ports = Vec::with_capacity(self.port_mappings.len());
        for mapping in &self.port_mappings {
            if !ports.contains(&mapping.target_port) {
                ports.push(mapping.target_port);
            }
        }
        ports
    }

    pub fn inactivity_timeout(&self) -> Duration {
        secs_to_duration(self.inactivity_timeout_secs)
    }

    pub fn startup_timeout(&self) -> Duration {
        secs_to_duration(self.startup_timeout_secs)
    }

    pub fn check_interval(&self) -> Duration {
        secs_to_duration(self.check_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        secs_to_duration(self.request_timeout_secs)
    }

    pub fn queue_admission_timeout(&self) -> Duration {
        secs_to_duration(self.queue_admission_timeout_secs)
    }

    pub fn upstream_timeout(&self) -> Duration {
        secs_to_duration(self.upstream_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        secs_to_duration(self.probe_timeout_secs)
    }

    pub fn shutdown_retry_delay(&self) -> Duration {
        secs_to_duration(self.shutdown_retry_delay_secs)
    }
}

/// Seconds, possibly fractional, as a `Duration`. Values `validate` would
/// reject clamp to zero or `Duration::MAX`.
fn secs_to_duration(secs: f64) -> Duration {
    if secs.is_nan() || secs <= 0.0 {
        Duration::ZERO
    } else {
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }
}

// Default value functions
fn default_proxy_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port_mappings() -> Vec<PortMapping> {
    vec![PortMapping::new(8080, 80)]
}

fn default_ipmi_path() -> String {
    std::env::var(IPMITOOL_ENV).unwrap_or_else(|_| "ipmitool".to_string())
}

fn default_ipmi_interface() -> String {
    "lanplus".to_string()
}

fn default_ipmi_max_retries() -> u32 {
    3
}

fn default_ipmi_command_timeout() -> u64 {
    30
}

fn default_ipmi_retry_base_delay() -> u64 {
    1000 // 1s, 2s, 4s, ...
}

fn default_inactivity_timeout() -> f64 {
    3600.0 // 1 hour
}

fn default_startup_timeout() -> f64 {
    300.0 // 5 minutes, server hardware boots slowly
}

fn default_check_interval() -> f64 {
    30.0
}

fn default_max_queue_size() -> usize {
    1000
}

fn default_request_timeout() -> f64 {
    60.0
}

fn default_queue_admission_timeout() -> f64 {
    5.0
}

fn default_upstream_timeout() -> f64 {
    60.0
}

fn default_probe_timeout() -> f64 {
    5.0
}

fn default_shutdown_retry_delay() -> f64 {
    300.0 // 5 minutes
}
