//! Plugin upgrades: pinning component and cookbook versions on an
//! environment, then converging the plugin's nodes.
//!
//! An upgrade is a single-stage run. It reuses the job and lock discipline of
//! the bootstrap manager without compiling a routine: the environment is
//! mutated under the environment lock and, if anything changed, every node
//! of the plugin in that environment runs the configuration client once.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::Instrument;

use mb_core::observability::orchestration_span;

use crate::config::{HostFailurePolicy, SshOptions};
use crate::context::FlowContext;
use crate::error::{Error, Result};
use crate::job::{Job, JobTicket, JobType};
use crate::lock::LockHandle;
use crate::metrics::{FlowMetrics, time_stage};
use crate::plugin::Plugin;
use crate::remote::{EnvironmentObject, NodeObject};
use crate::worker::{HostResult, run_on_hosts};

/// Command run on every node after the environment changed.
pub const CHEF_RUN_COMMAND: &str = "chef-client";

/// Options for one upgrade.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpgradeOptions {
    /// Component name to version.
    pub component_versions: BTreeMap<String, String>,
    /// Cookbook name to version constraint.
    pub cookbook_versions: BTreeMap<String, String>,
    /// Pre-empt any current holder of the environment lock.
    pub force: bool,
    /// SSH settings for the converge step.
    pub ssh: SshOptions,
}

impl UpgradeOptions {
    /// Pins a component to a version.
    #[must_use]
    pub fn with_component_version(
        mut self,
        component: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        self.component_versions.insert(component.into(), version.into());
        self
    }

    /// Pins a cookbook to a version constraint.
    #[must_use]
    pub fn with_cookbook_version(
        mut self,
        cookbook: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        self.cookbook_versions.insert(cookbook.into(), version.into());
        self
    }

    /// Sets whether to pre-empt the environment lock.
    #[must_use]
    pub const fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    fn is_noop(&self) -> bool {
        self.component_versions.is_empty() && self.cookbook_versions.is_empty()
    }
}

/// What an upgrade changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeReport {
    /// Override attributes that were set, by dotted path.
    pub override_attributes: BTreeMap<String, String>,
    /// Cookbook pins after the upgrade.
    pub cookbook_versions: BTreeMap<String, String>,
    /// Per-node outcome of the converge step.
    pub nodes: Vec<HostResult>,
}

/// Runs upgrades.
#[derive(Debug, Clone)]
pub struct Upgrader {
    ctx: FlowContext,
}

impl Upgrader {
    /// Creates an upgrader.
    #[must_use]
    pub const fn new(ctx: FlowContext) -> Self {
        Self { ctx }
    }

    /// Schedules an upgrade and returns its ticket without waiting.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    #[must_use]
    pub fn upgrade(&self, environment: &str, plugin: Plugin, options: UpgradeOptions) -> JobTicket {
        let job = self.ctx.jobs.create(JobType::Upgrade);
        let ticket = job.ticket();
        let span = orchestration_span("upgrade", &job.id().to_string(), environment);

        let upgrader = self.clone();
        let environment = environment.to_string();
        tokio::spawn(
            async move { upgrader.start(&environment, &plugin, &options, &job).await }
                .instrument(span),
        );

        ticket
    }

    /// Runs an upgrade to completion, recording the outcome on `job`.
    pub async fn start(
        &self,
        environment: &str,
        plugin: &Plugin,
        options: &UpgradeOptions,
        job: &Job,
    ) {
        job.set_status("Starting");
        job.report_running();

        match self.run(environment, plugin, options, job).await {
            Ok(report) => {
                job.set_status("Finishing up");
                job.report_success(serde_json::to_value(&report).ok());
            }
            Err(err) => {
                tracing::error!(environment, plugin = %plugin, error = %err, "Upgrade failed");
                job.report_failure(&err);
            }
        }
    }

    /// Validates and applies an upgrade without finishing the job.
    ///
    /// # Errors
    ///
    /// - [`Error::EnvironmentNotFound`] if the environment does not exist
    /// - [`Error::ComponentNotFound`] or [`Error::ComponentNotVersioned`] for
    ///   an unusable component version
    /// - lock errors, server errors, and [`Error::StageFailed`] if the
    ///   converge step fails under the `fail_run` policy
    pub async fn run(
        &self,
        environment: &str,
        plugin: &Plugin,
        options: &UpgradeOptions,
        job: &Job,
    ) -> Result<UpgradeReport> {
        self.find_environment(environment).await?;
        let overrides = override_attributes(plugin, &options.component_versions)?;

        let lock_options = self
            .ctx
            .config
            .lock_options(options.force)
            .with_job(job.clone());
        self.ctx
            .locks
            .synchronize(environment, lock_options, |lease| {
                self.apply(environment, plugin, overrides, options, job, lease)
            })
            .await
    }

    async fn find_environment(&self, environment: &str) -> Result<EnvironmentObject> {
        let chef = &self.ctx.chef;
        chef.find_environment(environment)
            .await?
            .ok_or_else(|| Error::EnvironmentNotFound {
                environment: environment.to_string(),
                server_url: chef.server_url().to_string(),
            })
    }

    async fn apply(
        &self,
        environment: &str,
        plugin: &Plugin,
        overrides: BTreeMap<String, String>,
        options: &UpgradeOptions,
        job: &Job,
        lease: LockHandle,
    ) -> Result<UpgradeReport> {
        let chef = &self.ctx.chef;
        // Read under the lock so writes by the previous holder are kept.
        let mut environment = self.find_environment(environment).await?;

        if !overrides.is_empty() {
            tracing::info!(?overrides, "Setting override attributes");
            job.set_status("Setting override attributes");
            for (path, version) in &overrides {
                environment.set_override_attribute(path, Value::String(version.clone()));
            }
            chef.save_environment(&environment).await?;
        }

        if !options.cookbook_versions.is_empty() {
            tracing::info!(cookbooks = ?options.cookbook_versions, "Setting cookbook versions");
            job.set_status("Setting cookbook versions");
            environment.cookbook_versions.extend(
                options
                    .cookbook_versions
                    .iter()
                    .map(|(name, version)| (name.clone(), version.clone())),
            );
            chef.save_environment(&environment).await?;
        }

        let mut report = UpgradeReport {
            override_attributes: overrides,
            cookbook_versions: environment.cookbook_versions.clone(),
            nodes: Vec::new(),
        };
        if options.is_noop() {
            return Ok(report);
        }

        job.set_status("Looking for nodes");
        let hosts = plugin_hosts(plugin, &chef.find_nodes(&environment.name).await?);
        if hosts.is_empty() {
            tracing::info!(environment = %environment.name, "No nodes in environment");
            return Ok(report);
        }

        if !lease.is_held() {
            return Err(Error::LockPreempted {
                environment: lease.environment().to_string(),
            });
        }

        tracing::info!(?hosts, "Running Chef on nodes");
        job.set_status("Running Chef on nodes");
        report.nodes = self.converge(hosts, options, job).await?;
        Ok(report)
    }

    async fn converge(
        &self,
        hosts: Vec<String>,
        options: &UpgradeOptions,
        job: &Job,
    ) -> Result<Vec<HostResult>> {
        let credentials = options.ssh.credentials();
        let timeout = options
            .ssh
            .timeout()
            .unwrap_or_else(|| self.ctx.config.ssh_timeout());
        let commands = hosts
            .into_iter()
            .map(|host| {
                let command = if credentials.sudo {
                    format!("sudo {CHEF_RUN_COMMAND}")
                } else {
                    CHEF_RUN_COMMAND.to_string()
                };
                (host, command)
            })
            .collect();

        let results = {
            let _timer = time_stage("upgrade");
            run_on_hosts(&self.ctx.executor, commands, &credentials, timeout, "upgrade").await
        };

        let metrics = FlowMetrics::new();
        let failures: Vec<String> = results
            .iter()
            .filter(|r| !r.outcome.is_ok())
            .map(|r| {
                metrics.record_host_failure("upgrade");
                format!("{}: {}", r.host, r.outcome)
            })
            .collect();

        if !failures.is_empty() {
            match self.ctx.config.host_failure_policy {
                HostFailurePolicy::FailRun => {
                    return Err(Error::StageFailed { stage: 0, failures });
                }
                HostFailurePolicy::Tolerate => {
                    tracing::warn!(failed = failures.len(), "Continuing past failed nodes");
                    job.set_status(format!(
                        "Chef run failed on {} node(s): {}",
                        failures.len(),
                        failures.join("; ")
                    ));
                }
            }
        }

        Ok(results)
    }
}

/// Maps component versions to override attribute paths.
fn override_attributes(
    plugin: &Plugin,
    versions: &BTreeMap<String, String>,
) -> Result<BTreeMap<String, String>> {
    versions
        .iter()
        .map(|(name, version)| {
            let component = plugin.component_or_err(name)?;
            let attribute =
                component
                    .version_attribute
                    .clone()
                    .ok_or_else(|| Error::ComponentNotVersioned {
                        component: name.clone(),
                    })?;
            tracing::debug!(component = %name, %attribute, "Component is versioned");
            Ok((attribute, version.clone()))
        })
        .collect()
}

/// Returns the unique hostnames of nodes belonging to any group of the
/// plugin, in node order.
///
/// A node belongs to a group when its run list carries every entry of the
/// group's run list. Groups with an empty run list match nothing.
fn plugin_hosts(plugin: &Plugin, nodes: &[NodeObject]) -> Vec<String> {
    let run_lists: Vec<&[String]> = plugin
        .components
        .iter()
        .flat_map(|c| &c.groups)
        .map(|g| g.run_list.as_slice())
        .filter(|run_list| !run_list.is_empty())
        .collect();

    let mut hosts: Vec<String> = Vec::new();
    for node in nodes {
        let member = run_lists
            .iter()
            .any(|run_list| run_list.iter().all(|entry| node.run_list.contains(entry)));
        if member && !hosts.contains(&node.public_hostname) {
            hosts.push(node.public_hostname.clone());
        }
    }
    hosts
}
