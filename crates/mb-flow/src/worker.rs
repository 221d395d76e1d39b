//! Workers: one node group's remote action.
//!
//! A worker receives a task, the hosts bound to it and the run's options by
//! value, runs its action on every host concurrently and returns one outcome
//! per host. It never touches the job; the manager decides what the outcomes
//! mean for the run.
//!
//! Host failures are reported, not retried and not masked. A worker only
//! returns `Err` when it could not attempt the group at all (for example an
//! unreadable validator key).

use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::task::JoinSet;
use tracing::Instrument;

use mb_core::Redacted;
use mb_core::observability::worker_span;

use crate::config::{BootstrapOptions, DEFAULT_TEMPLATE};
use crate::error::{Error, Result};
use crate::remote::{RemoteExecutor, SshCredentials};
use crate::routine::BootTask;

/// Directory the bootstrap script writes node configuration to.
const CHEF_DIR: &str = "/etc/chef";

/// Installer used by the default template.
const OMNIBUS_INSTALL: &str = "if ! command -v chef-client >/dev/null 2>&1; then\n  \
    curl -L https://www.opscode.com/chef/install.sh | sh\nfi\n";

/// What happened on one host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum HostOutcome {
    /// The command exited 0.
    Ok {
        /// Exit code (always 0).
        exit_code: i32,
        /// Captured output.
        stdout: String,
    },
    /// The command could not run or exited non-zero.
    Failed {
        /// Description of the failure.
        message: String,
    },
    /// The command did not return within the SSH timeout.
    TimedOut,
}

impl HostOutcome {
    /// Returns true for [`HostOutcome::Ok`].
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        matches!(self, Self::Ok { .. })
    }
}

impl fmt::Display for HostOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok { exit_code, .. } => write!(f, "ok (exit {exit_code})"),
            Self::Failed { message } => f.write_str(message),
            Self::TimedOut => f.write_str("timed out"),
        }
    }
}

/// Outcome for one host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostResult {
    /// Target host.
    pub host: String,
    /// What happened.
    pub outcome: HostOutcome,
}

/// Aggregated outcome of one group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupResult {
    /// Node group id.
    pub group_id: String,
    /// One entry per host, in manifest order.
    pub hosts: Vec<HostResult>,
}

impl GroupResult {
    /// Returns true if every host succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.hosts.iter().all(|h| h.outcome.is_ok())
    }

    /// Returns the hosts that did not succeed.
    pub fn failures(&self) -> impl Iterator<Item = &HostResult> {
        self.hosts.iter().filter(|h| !h.outcome.is_ok())
    }
}

/// Performs one task's remote action.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Runs the task against every host.
    ///
    /// # Errors
    ///
    /// Returns an error only if the group could not be attempted at all.
    async fn run(
        &self,
        task: &BootTask,
        hosts: &[String],
        options: &BootstrapOptions,
    ) -> Result<GroupResult>;
}

/// Bootstraps hosts over a [`RemoteExecutor`].
#[derive(Clone)]
pub struct BootstrapWorker {
    executor: Arc<dyn RemoteExecutor>,
    default_timeout: Duration,
}

impl BootstrapWorker {
    /// Creates a worker. `default_timeout` applies when the options carry no
    /// SSH timeout.
    #[must_use]
    pub fn new(executor: Arc<dyn RemoteExecutor>, default_timeout: Duration) -> Self {
        Self {
            executor,
            default_timeout,
        }
    }
}

#[async_trait]
impl Worker for BootstrapWorker {
    async fn run(
        &self,
        task: &BootTask,
        hosts: &[String],
        options: &BootstrapOptions,
    ) -> Result<GroupResult> {
        let span = worker_span(&task.id, hosts.len());
        let script = BootstrapScript::render(task, options).instrument(span.clone()).await?;
        let timeout = options.ssh_timeout(self.default_timeout);
        let credentials = options.credentials();

        let commands = hosts
            .iter()
            .map(|host| (host.clone(), script.command_for(host, credentials.sudo)))
            .collect();
        let hosts = run_on_hosts(
            &self.executor,
            commands,
            &credentials,
            timeout,
            &task.id,
        )
        .instrument(span)
        .await;

        Ok(GroupResult {
            group_id: task.id.clone(),
            hosts,
        })
    }
}

/// Runs one command per host concurrently and collects outcomes in input
/// order. Every host gets an outcome even if its task panicked.
pub(crate) async fn run_on_hosts(
    executor: &Arc<dyn RemoteExecutor>,
    commands: Vec<(String, String)>,
    credentials: &SshCredentials,
    timeout: Duration,
    group_id: &str,
) -> Vec<HostResult> {
    let hosts: Vec<String> = commands.iter().map(|(host, _)| host.clone()).collect();
    let mut set = JoinSet::new();

    for (index, (host, command)) in commands.into_iter().enumerate() {
        let executor = Arc::clone(executor);
        let credentials = credentials.clone();
        set.spawn(async move {
            let outcome = match tokio::time::timeout(
                timeout,
                executor.execute(&host, &command, &credentials, timeout),
            )
            .await
            {
                Err(_) => HostOutcome::TimedOut,
                Ok(Err(err)) => HostOutcome::Failed {
                    message: err.to_string(),
                },
                Ok(Ok(output)) if output.success() => HostOutcome::Ok {
                    exit_code: output.exit_code,
                    stdout: output.stdout,
                },
                Ok(Ok(output)) => HostOutcome::Failed {
                    message: format!(
                        "exited with status {}: {}",
                        output.exit_code,
                        output.stderr.trim()
                    ),
                },
            };
            (index, outcome)
        });
    }

    let mut outcomes: Vec<Option<HostOutcome>> = vec![None; hosts.len()];
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((index, outcome)) => outcomes[index] = Some(outcome),
            Err(err) => tracing::error!(group = group_id, error = %err, "Host task aborted"),
        }
    }

    hosts
        .into_iter()
        .zip(outcomes)
        .map(|(host, outcome)| {
            let outcome = outcome.unwrap_or_else(|| HostOutcome::Failed {
                message: "host task aborted".to_string(),
            });
            if !outcome.is_ok() {
                tracing::warn!(host = %host, group = group_id, outcome = ?outcome, "Host failed");
            }
            HostResult { host, outcome }
        })
        .collect()
}

/// A rendered bootstrap script, minus the per-host node name.
#[derive(Debug, Clone)]
pub struct BootstrapScript {
    install: String,
    validation_key: Redacted<String>,
    data_bag_secret: Option<Redacted<String>>,
    server_url: String,
    validator_client: String,
    environment: String,
    proxy: Option<String>,
    hints: Map<String, Value>,
    first_boot: Value,
}

impl BootstrapScript {
    /// Renders the parts of the script shared by every host of a task.
    ///
    /// # Errors
    ///
    /// Returns an error if a key file or template cannot be read.
    pub async fn render(task: &BootTask, options: &BootstrapOptions) -> Result<Self> {
        let install = if options.template() == DEFAULT_TEMPLATE {
            OMNIBUS_INSTALL.to_string()
        } else {
            read_file("template", options.template()).await?
        };

        let validation_key = match options.validator_path.as_deref() {
            Some(path) => Redacted(read_file("validator_path", path).await?),
            None => Redacted(String::new()),
        };
        let data_bag_secret = match options.encrypted_data_bag_secret_path.as_deref() {
            Some(path) => Some(Redacted(
                read_file("encrypted_data_bag_secret_path", path).await?,
            )),
            None => None,
        };

        let base_url = options.server_url.clone().unwrap_or_default();
        let server_url = match options.organization.as_deref() {
            Some(org) => format!("{}/organizations/{org}", base_url.trim_end_matches('/')),
            None => base_url,
        };

        let mut first_boot = task.group.chef_attributes.clone();
        first_boot.insert(
            "run_list".to_string(),
            Value::from(task.run_list().to_vec()),
        );

        Ok(Self {
            install,
            validation_key,
            data_bag_secret,
            server_url,
            validator_client: options.validator_client.clone().unwrap_or_default(),
            environment: options
                .environment
                .clone()
                .unwrap_or_else(|| "_default".to_string()),
            proxy: options.bootstrap_proxy.clone(),
            hints: options.hints.clone(),
            first_boot: Value::Object(first_boot),
        })
    }

    /// Returns the script for one host.
    #[must_use]
    pub fn script_for(&self, host: &str) -> String {
        let mut script = String::from("set -e\n");

        if let Some(proxy) = &self.proxy {
            let proxy = shell_quote(proxy);
            push_line(&mut script, &format!("export http_proxy={proxy}"));
            push_line(&mut script, &format!("export https_proxy={proxy}"));
        }
        script.push_str(&self.install);
        push_line(&mut script, &format!("mkdir -p {CHEF_DIR}/ohai/hints"));

        heredoc(
            &mut script,
            &format!("{CHEF_DIR}/validation.pem"),
            self.validation_key.expose(),
        );
        push_line(&mut script, &format!("chmod 0600 {CHEF_DIR}/validation.pem"));

        if let Some(secret) = &self.data_bag_secret {
            heredoc(
                &mut script,
                &format!("{CHEF_DIR}/encrypted_data_bag_secret"),
                secret.expose(),
            );
            push_line(
                &mut script,
                &format!("chmod 0600 {CHEF_DIR}/encrypted_data_bag_secret"),
            );
        }

        heredoc(&mut script, &format!("{CHEF_DIR}/client.rb"), &self.client_rb(host));

        for (name, hint) in &self.hints {
            heredoc(
                &mut script,
                &format!("{CHEF_DIR}/ohai/hints/{name}.json"),
                &hint.to_string(),
            );
        }

        heredoc(
            &mut script,
            &format!("{CHEF_DIR}/first-boot.json"),
            &self.first_boot.to_string(),
        );
        push_line(
            &mut script,
            &format!(
                "chef-client -j {CHEF_DIR}/first-boot.json -E {}",
                shell_quote(&self.environment)
            ),
        );
        script
    }

    /// Returns the full command for one host, wrapped for `sh -c`.
    #[must_use]
    pub fn command_for(&self, host: &str, sudo: bool) -> String {
        let quoted = shell_quote(&self.script_for(host));
        if sudo {
            format!("sudo sh -c {quoted}")
        } else {
            format!("sh -c {quoted}")
        }
    }

    fn client_rb(&self, host: &str) -> String {
        let mut rb = String::from("log_location STDOUT\n");
        push_line(
            &mut rb,
            &format!("chef_server_url {}", ruby_string(&self.server_url)),
        );
        push_line(
            &mut rb,
            &format!("validation_client_name {}", ruby_string(&self.validator_client)),
        );
        push_line(&mut rb, &format!("node_name {}", ruby_string(host)));
        push_line(
            &mut rb,
            &format!("environment {}", ruby_string(&self.environment)),
        );
        if let Some(proxy) = &self.proxy {
            push_line(&mut rb, &format!("http_proxy {}", ruby_string(proxy)));
            push_line(&mut rb, &format!("https_proxy {}", ruby_string(proxy)));
        }
        if self.data_bag_secret.is_some() {
            let path = format!("{CHEF_DIR}/encrypted_data_bag_secret");
            push_line(
                &mut rb,
                &format!("encrypted_data_bag_secret {}", ruby_string(&path)),
            );
        }
        rb
    }
}

async fn read_file(field: &str, path: &str) -> Result<String> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|e| Error::Configuration {
            fields: vec![format!("{field} (cannot read '{path}': {e})")],
        })
}

fn shell_quote(value: &str) -> String {
    shell_escape::unix::escape(Cow::Borrowed(value)).into_owned()
}

/// Double-quoted literal; JSON string escaping is valid Ruby.
fn ruby_string(value: &str) -> String {
    Value::from(value).to_string()
}

fn push_line(buf: &mut String, line: &str) {
    buf.push_str(line);
    buf.push('\n');
}

fn heredoc(script: &mut String, path: &str, body: &str) {
    push_line(script, &format!("cat > {} <<'MB_EOF'", shell_quote(path)));
    script.push_str(body);
    if !body.ends_with('\n') {
        script.push('\n');
    }
    script.push_str("MB_EOF\n");
}
