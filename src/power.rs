//! Out-of-band power control for the managed server
//!
//! The [`PowerController`] trait is the seam the lifecycle manager drives.
//! [`IpmiController`] implements it by shelling out to `ipmitool` (or any
//! command line that speaks the same arguments), retrying failed commands
//! with exponential backoff.

use crate::config::IpmiConfig;
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, error, warn};

/// Power state reported by the management endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerStatus {
    On,
    Off,
    /// The status command failed or its output was not recognized
    Unknown,
}

/// Issues power commands to the backend's management endpoint.
///
/// Implementations own their retry policy. Failures are reported as `false`
/// or [`PowerStatus::Unknown`] once retries are exhausted, never as errors.
#[async_trait]
pub trait PowerController: Send + Sync {
    async fn power_on(&self) -> bool;

    /// Soft power-off (ACPI shutdown), or a hard cut when `force` is set
    async fn power_off(&self, force: bool) -> bool;

    async fn power_status(&self) -> PowerStatus;
}

/// Failure of a single management command invocation
#[derive(Debug, thiserror::Error)]
enum CommandError {
    #[error("failed to run power tool: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("power tool timed out after {} seconds", .0.as_secs())]
    Timeout(Duration),

    #[error("power tool exited with {status}: {stderr}")]
    Exit { status: String, stderr: String },
}

/// [`PowerController`] backed by an external `ipmitool`-compatible command
pub struct IpmiController {
    program: String,
    /// Leading arguments from `ipmi_path`, e.g. the script for an interpreter
    leading_args: Vec<String>,
    interface: String,
    host: String,
    user: String,
    password: String,
    max_retries: u32,
    command_timeout: Duration,
    retry_base_delay: Duration,
}

impl IpmiController {
    pub fn new(config: &IpmiConfig) -> anyhow::Result<Self> {
        let mut parts = shell_words::split(&config.ipmi_path)
            .map_err(|e| anyhow::anyhow!("Invalid ipmi_path {:?}: {}", config.ipmi_path, e))?;
        if parts.is_empty() {
            anyhow::bail!("ipmi_path must name a command");
        }
        let program = parts.remove(0);

        Ok(Self {
            program,
            leading_args: parts,
            interface: config.ipmi_interface.clone(),
            host: config.ipmi_host.clone(),
            user: config.ipmi_user.clone(),
            password: config.ipmi_password.clone(),
            max_retries: config.ipmi_max_retries,
            command_timeout: config.command_timeout(),
            retry_base_delay: config.retry_base_delay(),
        })
    }

    /// Run `chassis power <action>` once, returning its stdout
    async fn run_once(&self, action: &str) -> Result<String, CommandError> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.leading_args)
            .args(["-I", self.interface.as_str()])
            .args(["-H", self.host.as_str()])
            .args(["-U", self.user.as_str()])
            .args(["-P", self.password.as_str()])
            .args(["chassis", "power", action])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(self.command_timeout, command.output()).await {
            Ok(result) => result?,
            Err(_) => return Err(CommandError::Timeout(self.command_timeout)),
        };

        if !output.status.success() {
            return Err(CommandError::Exit {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Run a power command, retrying up to `max_retries` times.
    /// Returns `None` once every attempt has failed.
    async fn run_with_retry(&self, action: &str) -> Option<String> {
        for attempt in 0..=self.max_retries {
            debug!(action, attempt, host = %self.host, "Running power command");

            match self.run_once(action).await {
                Ok(stdout) => return Some(stdout),
                Err(e) if attempt < self.max_retries => {
                    let delay = backoff_delay(attempt, self.retry_base_delay);
                    warn!(
                        action,
                        attempt,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %e,
                        "Power command failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    error!(
                        action,
                        attempts = attempt + 1,
                        error = %e,
                        "Power command failed, giving up"
                    );
                }
            }
        }

        None
    }
}

#[async_trait]
impl PowerController for IpmiController {
    async fn power_on(&self) -> bool {
        self.run_with_retry("on").await.is_some()
    }

    async fn power_off(&self, force: bool) -> bool {
        let action = if force { "off" } else { "soft" };
        self.run_with_retry(action).await.is_some()
    }

    async fn power_status(&self) -> PowerStatus {
        match self.run_with_retry("status").await {
            Some(stdout) => parse_power_status(&stdout),
            None => PowerStatus::Unknown,
        }
    }
}

/// Delay before retry number `attempt + 1`: `2^attempt * base`
pub fn backoff_delay(attempt: u32, base: Duration) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt))
}

/// Parse `chassis power status` output
pub fn parse_power_status(output: &str) -> PowerStatus {
    if output.contains("Chassis Power is on") {
        PowerStatus::On
    } else if output.contains("Chassis Power is off") {
        PowerStatus::Off
    } else {
        PowerStatus::Unknown
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_power_status() {
        assert_eq!(parse_power_status("Chassis Power is on\n"), PowerStatus::On);
        assert_eq!(parse_power_status("Chassis Power is off\n"), PowerStatus::Off);
        assert_eq!(parse_power_status(""), PowerStatus::Unknown);
        assert_eq!(
            parse_power_status("Error: Unable to establish IPMI v2 / RMCP+ session"),
            PowerStatus::Unknown
        );
    }

    #[test]
    fn test_backoff_delay() {
        let base = Duration::from_secs(1);
        assert_eq!(backoff_delay(0, base), Duration::from_secs(1));
        assert_eq!(backoff_delay(1, base), Duration::from_secs(2));
        assert_eq!(backoff_delay(2, base), Duration::from_secs(4));
        assert_eq!(backoff_delay(3, base), Duration::from_secs(8));
    }

    #[test]
    fn test_backoff_delay_saturates() {
        let delay = backoff_delay(200, Duration::from_secs(1));
        assert!(delay >= Duration::from_secs(u32::MAX as u64));
    }

    #[test]
    fn test_new_rejects_bad_path() {
        let config = IpmiConfig::new("10.0.0.5", "admin", "secret").with_path("");
        assert!(IpmiController::new(&config).is_err());

        let config = IpmiConfig::new("10.0.0.5", "admin", "secret").with_path("'unterminated");
        assert!(IpmiController::new(&config).is_err());
    }

    #[test]
    fn test_new_splits_path() {
        let config = IpmiConfig::new("10.0.0.5", "admin", "secret")
            .with_path("python3 'mock ipmitool.py' --verbose");
        let controller = IpmiController::new(&config).unwrap();
        assert_eq!(controller.program, "python3");
        assert_eq!(controller.leading_args, vec!["mock ipmitool.py", "--verbose"]);
    }

    #[cfg(unix)]
    mod scripted {
        use super::*;
        use std::path::{Path, PathBuf};
        use tempfile::TempDir;

        /// Write a fake power tool script; it is run through `sh` so it
        /// needs no exec bit
        fn fake_tool(dir: &Path, body: &str) -> PathBuf {
            let path = dir.join("ipmitool.sh");
            std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
            path
        }

        fn controller(script: &Path, max_retries: u32) -> IpmiController {
            let mut config = IpmiConfig::new("10.0.0.5", "admin", "secret")
                .with_path(&format!("sh {}", script.display()));
            config.ipmi_max_retries = max_retries;
            config.ipmi_retry_base_delay_ms = 10;
            config.ipmi_command_timeout_secs = 1;
            IpmiController::new(&config).unwrap()
        }

        fn call_count(dir: &Path) -> usize {
            std::fs::read_to_string(dir.join("calls"))
                .map(|s| s.lines().count())
                .unwrap_or(0)
        }

        #[tokio::test]
        async fn test_power_status_on_and_off() {
            let dir = TempDir::new().unwrap();

            let script = fake_tool(dir.path(), r#"echo "Chassis Power is on""#);
            assert_eq!(controller(&script, 0).power_status().await, PowerStatus::On);

            let script = fake_tool(dir.path(), r#"echo "Chassis Power is off""#);
            assert_eq!(controller(&script, 0).power_status().await, PowerStatus::Off);
        }

        #[tokio::test]
        async fn test_unrecognized_status_is_unknown() {
            let dir = TempDir::new().unwrap();
            let script = fake_tool(dir.path(), r#"echo "something else entirely""#);

            assert_eq!(controller(&script, 0).power_status().await, PowerStatus::Unknown);
        }

        #[tokio::test]
        async fn test_arguments_layout() {
            let dir = TempDir::new().unwrap();
            let script = fake_tool(dir.path(), r#"echo "$@" > "$(dirname "$0")/args""#);
            let ctl = controller(&script, 0);

            assert!(ctl.power_off(false).await);
            let args = std::fs::read_to_string(dir.path().join("args")).unwrap();
            assert_eq!(
                args.trim(),
                "-I lanplus -H 10.0.0.5 -U admin -P secret chassis power soft"
            );

            assert!(ctl.power_off(true).await);
            let args = std::fs::read_to_string(dir.path().join("args")).unwrap();
            assert!(args.trim().ends_with("chassis power off"));

            assert!(ctl.power_on().await);
            let args = std::fs::read_to_string(dir.path().join("args")).unwrap();
            assert!(args.trim().ends_with("chassis power on"));
        }

        #[tokio::test]
        async fn test_failure_retries_then_gives_up() {
            let dir = TempDir::new().unwrap();
            let script = fake_tool(
                dir.path(),
                r#"echo x >> "$(dirname "$0")/calls"; echo "connection refused" >&2; exit 1"#,
            );

            assert!(!controller(&script, 3).power_on().await);
            assert_eq!(call_count(dir.path()), 4);
        }

        #[tokio::test]
        async fn test_failed_status_is_unknown() {
            let dir = TempDir::new().unwrap();
            let script = fake_tool(dir.path(), r#"echo x >> "$(dirname "$0")/calls"; exit 2"#);

            assert_eq!(controller(&script, 1).power_status().await, PowerStatus::Unknown);
            assert_eq!(call_count(dir.path()), 2);
        }

        #[tokio::test]
        async fn test_recovers_after_transient_failure() {
            let dir = TempDir::new().unwrap();
            // Fails on the first call, succeeds afterwards
            let script = fake_tool(
                dir.path(),
                r#"calls="$(dirname "$0")/calls"
echo x >> "$calls"
[ $(wc -l < "$calls") -ge 2 ] || exit 1
echo "Chassis Power Control: Up/On""#,
            );

            assert!(controller(&script, 3).power_on().await);
            assert_eq!(call_count(dir.path()), 2);
        }

        #[tokio::test]
        async fn test_command_timeout_counts_as_failure() {
            let dir = TempDir::new().unwrap();
            let script = fake_tool(dir.path(), "sleep 5");

            let started = std::time::Instant::now();
            assert!(!controller(&script, 0).power_on().await);
            assert!(started.elapsed() < Duration::from_secs(4));
        }

        #[tokio::test]
        async fn test_missing_tool_fails() {
            let mut config = IpmiConfig::new("10.0.0.5", "admin", "secret")
                .with_path("/nonexistent/powergate-ipmitool");
            config.ipmi_max_retries = 1;
            config.ipmi_retry_base_delay_ms = 1;
            let ctl = IpmiController::new(&config).unwrap();

            assert!(!ctl.power_on().await);
            assert_eq!(ctl.power_status().await, PowerStatus::Unknown);
        }
    }
}
