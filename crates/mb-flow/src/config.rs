//! Engine configuration and per-call bootstrap options.
//!
//! [`FlowConfig`] holds process-wide knobs read from environment variables.
//! [`BootstrapOptions`] holds what one bootstrap call needs to reach the
//! configuration server and the target hosts; it is validated before any
//! lock is taken.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use mb_core::Redacted;

use crate::error::{Error, Result};
use crate::job::DEFAULT_JOB_RETENTION;
use crate::lock::{LockOptions, LockPolicy};
use crate::remote::SshCredentials;

/// Default per-command SSH timeout in seconds.
pub const DEFAULT_SSH_TIMEOUT_SECS: u64 = 10;

/// Default provisioner polling interval in seconds.
pub const DEFAULT_PROVISION_POLL_INTERVAL_SECS: u64 = 30;

/// Bootstrap template used when the caller does not name one.
pub const DEFAULT_TEMPLATE: &str = "omnibus";

/// How host failures inside a stage affect the run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostFailurePolicy {
    /// Any failed host fails the run after the stage barrier.
    #[default]
    FailRun,
    /// Failed hosts are reported in the job status and the run continues.
    Tolerate,
}

/// Process-wide engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    /// Per-command SSH timeout when the call does not set one.
    pub ssh_timeout_secs: u64,
    /// Finished jobs kept for lookup.
    pub job_retention: usize,
    /// What a contended lock acquisition does.
    pub lock_policy: LockPolicy,
    /// Upper bound on waiting for a lock. Zero waits forever.
    pub lock_wait_timeout_secs: u64,
    /// Effect of host failures on a run.
    pub host_failure_policy: HostFailurePolicy,
    /// Provisioner id overriding the registry default.
    pub provisioner: Option<String>,
    /// How often provisioners poll for environment readiness.
    pub provision_poll_interval_secs: u64,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            ssh_timeout_secs: DEFAULT_SSH_TIMEOUT_SECS,
            job_retention: DEFAULT_JOB_RETENTION,
            lock_policy: LockPolicy::Wait,
            lock_wait_timeout_secs: 0,
            host_failure_policy: HostFailurePolicy::FailRun,
            provisioner: None,
            provision_poll_interval_secs: DEFAULT_PROVISION_POLL_INTERVAL_SECS,
        }
    }
}

impl FlowConfig {
    /// Loads configuration from the process environment.
    ///
    /// # Environment Variables
    ///
    /// - `MB_SSH_TIMEOUT_SECS` (default 10)
    /// - `MB_JOB_RETENTION` (default 1000)
    /// - `MB_LOCK_POLICY`: `wait` or `fail_fast` (default `wait`)
    /// - `MB_LOCK_WAIT_TIMEOUT_SECS`: 0 waits forever (default 0)
    /// - `MB_HOST_FAILURE_POLICY`: `fail_run` or `tolerate` (default `fail_run`)
    /// - `MB_PROVISIONER`: default provisioner id
    /// - `MB_PROVISION_POLL_INTERVAL_SECS` (default 30)
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set to an unparseable value.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Loads configuration from an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set to an unparseable value.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(secs) = env_u64(&lookup, "MB_SSH_TIMEOUT_SECS")? {
            config.ssh_timeout_secs = secs;
        }
        if let Some(retention) = env_u64(&lookup, "MB_JOB_RETENTION")? {
            config.job_retention = usize::try_from(retention).map_err(|_| {
                invalid("MB_JOB_RETENTION is too large for this platform".to_string())
            })?;
        }
        if let Some(policy) = env_string(&lookup, "MB_LOCK_POLICY") {
            config.lock_policy = parse_lock_policy("MB_LOCK_POLICY", &policy)?;
        }
        if let Some(secs) = env_u64(&lookup, "MB_LOCK_WAIT_TIMEOUT_SECS")? {
            config.lock_wait_timeout_secs = secs;
        }
        if let Some(policy) = env_string(&lookup, "MB_HOST_FAILURE_POLICY") {
            config.host_failure_policy =
                parse_host_failure_policy("MB_HOST_FAILURE_POLICY", &policy)?;
        }
        config.provisioner = env_string(&lookup, "MB_PROVISIONER");
        if let Some(secs) = env_u64(&lookup, "MB_PROVISION_POLL_INTERVAL_SECS")? {
            config.provision_poll_interval_secs = secs;
        }

        config.validate()?;
        Ok(config)
    }

    /// Checks value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] naming every out-of-range field.
    pub fn validate(&self) -> Result<()> {
        let mut fields = Vec::new();
        if self.ssh_timeout_secs == 0 {
            fields.push("ssh_timeout_secs must be positive".to_string());
        }
        if self.job_retention == 0 {
            fields.push("job_retention must be positive".to_string());
        }
        if self.provision_poll_interval_secs == 0 {
            fields.push("provision_poll_interval_secs must be positive".to_string());
        }
        if fields.is_empty() {
            Ok(())
        } else {
            Err(Error::Configuration { fields })
        }
    }

    /// Returns the default per-command SSH timeout.
    #[must_use]
    pub const fn ssh_timeout(&self) -> Duration {
        Duration::from_secs(self.ssh_timeout_secs)
    }

    /// Returns the lock wait bound, `None` meaning forever.
    #[must_use]
    pub const fn lock_wait_timeout(&self) -> Option<Duration> {
        if self.lock_wait_timeout_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.lock_wait_timeout_secs))
        }
    }

    /// Returns the provisioner polling interval.
    #[must_use]
    pub const fn provision_poll_interval(&self) -> Duration {
        Duration::from_secs(self.provision_poll_interval_secs)
    }

    /// Builds lock options for one run from the configured policy.
    #[must_use]
    pub fn lock_options(&self, force: bool) -> LockOptions {
        LockOptions::new()
            .with_force(force)
            .with_policy(self.lock_policy)
            .with_timeout(self.lock_wait_timeout())
    }
}

fn is_hint_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn invalid(message: String) -> Error {
    Error::Core(mb_core::Error::InvalidInput(message))
}

fn env_string<F>(lookup: &F, name: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name).and_then(|v| {
        let trimmed = v.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn env_u64<F>(lookup: &F, name: &str) -> Result<Option<u64>>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(v) = env_string(lookup, name) else {
        return Ok(None);
    };
    v.parse::<u64>()
        .map(Some)
        .map_err(|e| invalid(format!("{name} must be a u64: {e}")))
}

fn parse_lock_policy(name: &str, value: &str) -> Result<LockPolicy> {
    match value.trim().to_ascii_lowercase().as_str() {
        "wait" => Ok(LockPolicy::Wait),
        "fail_fast" => Ok(LockPolicy::FailFast),
        other => Err(invalid(format!(
            "{name} must be 'wait' or 'fail_fast', got '{other}'"
        ))),
    }
}

fn parse_host_failure_policy(name: &str, value: &str) -> Result<HostFailurePolicy> {
    match value.trim().to_ascii_lowercase().as_str() {
        "fail_run" => Ok(HostFailurePolicy::FailRun),
        "tolerate" => Ok(HostFailurePolicy::Tolerate),
        other => Err(invalid(format!(
            "{name} must be 'fail_run' or 'tolerate', got '{other}'"
        ))),
    }
}

const fn default_sudo() -> bool {
    true
}

/// SSH settings for reaching target hosts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SshOptions {
    /// Login user.
    #[serde(default)]
    pub user: String,
    /// Login password.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<Redacted<String>>,
    /// Private key paths, used instead of a password.
    #[serde(default)]
    pub keys: Vec<String>,
    /// Per-command timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<f64>,
    /// Run the bootstrap command through `sudo`.
    #[serde(default = "default_sudo")]
    pub sudo: bool,
}

impl Default for SshOptions {
    fn default() -> Self {
        Self {
            user: String::new(),
            password: None,
            keys: Vec::new(),
            timeout: None,
            sudo: true,
        }
    }
}

impl SshOptions {
    /// Returns the configured timeout, if positive and representable.
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
            .filter(|secs| *secs > 0.0)
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
    }

    /// Returns credentials for the remote executor.
    #[must_use]
    pub fn credentials(&self) -> SshCredentials {
        SshCredentials {
            user: self.user.clone(),
            password: self.password.clone(),
            keys: self.keys.clone(),
            sudo: self.sudo,
        }
    }
}

/// Options for one bootstrap run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapOptions {
    /// Configuration server URL.
    pub server_url: Option<String>,
    /// Client name used against the server.
    pub client_name: Option<String>,
    /// Path to the client's private key.
    pub client_key: Option<String>,
    /// Name of the validator client.
    pub validator_client: Option<String>,
    /// Path to the validator's private key.
    pub validator_path: Option<String>,
    /// SSH settings.
    pub ssh: Option<SshOptions>,
    /// Server organization, if the server is multi-tenant.
    pub organization: Option<String>,
    /// Path to the encrypted data bag secret copied to each node.
    pub encrypted_data_bag_secret_path: Option<String>,
    /// Environment nodes join; defaults to the run's environment.
    pub environment: Option<String>,
    /// Ohai hints written to each node.
    pub hints: Map<String, Value>,
    /// Bootstrap template name or path.
    pub template: Option<String>,
    /// HTTP proxy used while bootstrapping.
    pub bootstrap_proxy: Option<String>,
    /// Pre-empt any current holder of the environment lock.
    pub force: bool,
}

impl BootstrapOptions {
    /// Checks that every required option is present and usable.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] listing every offending field.
    pub fn validate(&self) -> Result<()> {
        let mut fields = Vec::new();

        let required = [
            ("server_url", &self.server_url),
            ("client_name", &self.client_name),
            ("client_key", &self.client_key),
            ("validator_client", &self.validator_client),
            ("validator_path", &self.validator_path),
        ];
        for (name, value) in required {
            if present(value).is_none() {
                fields.push(name.to_string());
            }
        }

        match &self.ssh {
            None => fields.push("ssh".to_string()),
            Some(ssh) => {
                if ssh.user.trim().is_empty() {
                    fields.push("ssh.user".to_string());
                }
                let has_password = ssh
                    .password
                    .as_ref()
                    .is_some_and(|p| !p.expose().is_empty());
                if !has_password && ssh.keys.is_empty() {
                    fields.push("ssh.password or ssh.keys".to_string());
                }
                if ssh.timeout.is_some() && ssh.timeout().is_none() {
                    fields.push("ssh.timeout (must be a positive number of seconds)".to_string());
                }
            }
        }

        // Hint names become file names in a root shell script.
        for name in self.hints.keys() {
            if !is_hint_name(name) {
                fields.push(format!("hints ('{name}' is not [A-Za-z0-9_-]+)"));
            }
        }

        for (name, value) in [
            ("client_key", &self.client_key),
            ("validator_path", &self.validator_path),
        ] {
            if let Some(path) = present(value) {
                if !Path::new(path).exists() {
                    fields.push(format!("{name} (no file at '{path}')"));
                }
            }
        }

        if fields.is_empty() {
            Ok(())
        } else {
            Err(Error::Configuration { fields })
        }
    }

    /// Returns the template name or path.
    #[must_use]
    pub fn template(&self) -> &str {
        present(&self.template).unwrap_or(DEFAULT_TEMPLATE)
    }

    /// Returns the per-command timeout, falling back to `default`.
    #[must_use]
    pub fn ssh_timeout(&self, default: Duration) -> Duration {
        self.ssh
            .as_ref()
            .and_then(SshOptions::timeout)
            .unwrap_or(default)
    }

    /// Returns SSH credentials, empty if no SSH options were given.
    #[must_use]
    pub fn credentials(&self) -> SshCredentials {
        self.ssh
            .as_ref()
            .map(SshOptions::credentials)
            .unwrap_or_default()
    }
}

fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}
