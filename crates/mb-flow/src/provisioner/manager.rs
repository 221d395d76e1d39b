//! Provisioning runs: create machines, then bootstrap them in the same job.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::Instrument;

use mb_core::observability::orchestration_span;

use super::{
    ProvisionManifest, ProvisionOptions, ProvisionedNode, Provisioner, ProvisionerRegistry,
    validate_create,
};
use crate::context::FlowContext;
use crate::error::{Error, Result};
use crate::job::{Job, JobTicket, JobType};
use crate::manager::{BootstrapManager, BootstrapReport};
use crate::manifest::Manifest;
use crate::plugin::Plugin;

/// Result payload of a successful provision job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionReport {
    /// Provisioner that created the machines.
    pub provisioner: String,
    /// Machines created.
    pub nodes: Vec<ProvisionedNode>,
    /// Bootstrap of the created machines, unless skipped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootstrap: Option<BootstrapReport>,
}

/// Result payload of a successful destroy job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DestroyReport {
    /// Whether the provisioner had machines to destroy.
    pub destroyed: bool,
    /// Whether the environment existed on the configuration server.
    pub environment_deleted: bool,
}

/// Drives provisioners under the job and ticket contract.
#[derive(Debug, Clone)]
pub struct ProvisionerManager {
    ctx: FlowContext,
    registry: ProvisionerRegistry,
    bootstrapper: BootstrapManager,
}

impl ProvisionerManager {
    /// Creates a manager bootstrapping through a default [`BootstrapManager`].
    #[must_use]
    pub fn new(ctx: FlowContext, registry: ProvisionerRegistry) -> Self {
        let bootstrapper = BootstrapManager::new(ctx.clone());
        Self::with_bootstrapper(ctx, registry, bootstrapper)
    }

    /// Creates a manager with a specific bootstrap manager.
    #[must_use]
    pub const fn with_bootstrapper(
        ctx: FlowContext,
        registry: ProvisionerRegistry,
        bootstrapper: BootstrapManager,
    ) -> Self {
        Self {
            ctx,
            registry,
            bootstrapper,
        }
    }

    /// Returns the provisioner registry.
    #[must_use]
    pub const fn registry(&self) -> &ProvisionerRegistry {
        &self.registry
    }

    /// Schedules a provision run and returns its ticket without waiting.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    #[must_use]
    pub fn provision(
        &self,
        environment: &str,
        manifest: ProvisionManifest,
        plugin: Plugin,
        options: ProvisionOptions,
    ) -> JobTicket {
        let job = self.ctx.jobs.create(JobType::Provision);
        let ticket = job.ticket();
        let span = orchestration_span("provision", &job.id().to_string(), environment);

        let manager = self.clone();
        let environment = environment.to_string();
        tokio::spawn(
            async move {
                job.report_running();
                let outcome = manager
                    .run_provision(&environment, &manifest, &plugin, options, &job)
                    .await;
                finish(&job, "Provision", outcome);
            }
            .instrument(span),
        );

        ticket
    }

    /// Schedules destruction of an environment's machines and its record on
    /// the configuration server.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    #[must_use]
    pub fn destroy(&self, environment: &str, provisioner: Option<&str>) -> JobTicket {
        let job = self.ctx.jobs.create(JobType::Destroy);
        let ticket = job.ticket();
        let span = orchestration_span("destroy", &job.id().to_string(), environment);

        let manager = self.clone();
        let environment = environment.to_string();
        let provisioner = provisioner.map(str::to_string);
        tokio::spawn(
            async move {
                job.report_running();
                let outcome = manager
                    .run_destroy(&environment, provisioner.as_deref(), &job)
                    .await;
                finish(&job, "Destroy", outcome);
            }
            .instrument(span),
        );

        ticket
    }

    fn resolve(&self, requested: Option<&str>) -> Result<Arc<dyn Provisioner>> {
        let id = requested.or(self.ctx.config.provisioner.as_deref());
        self.registry.resolve(id)
    }

    async fn run_provision(
        &self,
        environment: &str,
        manifest: &ProvisionManifest,
        plugin: &Plugin,
        mut options: ProvisionOptions,
        job: &Job,
    ) -> Result<ProvisionReport> {
        let provisioner = self.resolve(options.provisioner.as_deref())?;
        let routine = if options.skip_bootstrap {
            None
        } else {
            options.bootstrap.validate()?;
            Some(plugin.compile_bootstrap_routine()?.ok_or_else(|| {
                Error::routine_syntax(format!("plugin {plugin} defines no bootstrap routine"))
            })?)
        };
        options
            .poll_interval
            .get_or_insert(self.ctx.config.provision_poll_interval());

        job.set_status(format!(
            "Provisioning {} node(s) with {}",
            manifest.node_count(),
            provisioner.id()
        ));
        tracing::info!(
            provisioner = provisioner.id(),
            nodes = manifest.node_count(),
            "Provisioning environment"
        );
        let nodes = provisioner
            .up(job, environment, manifest, plugin, &options)
            .await?;
        validate_create(&nodes, manifest)?;

        let mut report = ProvisionReport {
            provisioner: provisioner.id().to_string(),
            nodes,
            bootstrap: None,
        };
        let Some(routine) = routine else {
            return Ok(report);
        };

        let bootstrap_manifest = Manifest::from_provisioned(manifest, &report.nodes)?;
        let mut bootstrap = options.bootstrap;
        bootstrap.force |= options.force;
        report.bootstrap = Some(
            self.bootstrapper
                .run(environment, &bootstrap_manifest, &routine, &bootstrap, job)
                .await?,
        );
        Ok(report)
    }

    async fn run_destroy(
        &self,
        environment: &str,
        provisioner: Option<&str>,
        job: &Job,
    ) -> Result<DestroyReport> {
        let provisioner = self.resolve(provisioner)?;
        let lock_options = self.ctx.config.lock_options(false).with_job(job.clone());

        self.ctx
            .locks
            .synchronize(environment, lock_options, |_lease| async {
                job.set_status(format!("Destroying {environment} with {}", provisioner.id()));
                let destroyed = provisioner.down(job, environment).await?;

                job.set_status(format!("Deleting environment {environment}"));
                let environment_deleted = self.ctx.chef.delete_environment(environment).await?;
                Ok::<_, Error>(DestroyReport {
                    destroyed,
                    environment_deleted,
                })
            })
            .await
    }
}

fn finish<T: Serialize>(job: &Job, operation: &str, outcome: Result<T>) {
    match outcome {
        Ok(report) => {
            tracing::info!(operation, "Finished");
            job.report_success(serde_json::to_value(&report).ok());
        }
        Err(err) => {
            tracing::error!(operation, error = %err, "Failed");
            job.report_failure(&err);
        }
    }
}
