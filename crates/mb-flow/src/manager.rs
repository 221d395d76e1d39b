//! The bootstrap manager: staged execution of a routine under the
//! environment lock.
//!
//! ## Run Lifecycle
//!
//! 1. [`BootstrapManager::bootstrap`] creates a job, schedules the run in the
//!    background and returns the job's ticket immediately.
//! 2. The run validates options, then the manifest against the routine,
//!    then that the environment exists. Any failure here ends the run before
//!    a lock is taken or a host is touched.
//! 3. The environment lock is acquired and held for the whole drain.
//! 4. Stages are drained in order. Each stage spawns one worker per task and
//!    waits for all of them (the stage barrier) before looking at results.
//! 5. The lock is released on the single exit path and the job reports
//!    success or failure.
//!
//! No error is ever returned to the caller of `bootstrap`; failures are only
//! observable through the ticket.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tracing::Instrument;

use mb_core::observability::orchestration_span;

use crate::config::{BootstrapOptions, HostFailurePolicy};
use crate::context::FlowContext;
use crate::error::{Error, Result};
use crate::job::{Job, JobTicket, JobType};
use crate::lock::LockHandle;
use crate::manifest::Manifest;
use crate::metrics::{FlowMetrics, time_stage};
use crate::routine::{Routine, Stage};
use crate::worker::{BootstrapWorker, GroupResult, Worker};

/// Outcome of one drained stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageReport {
    /// Zero-based stage index.
    pub index: usize,
    /// Per-group results, in task order.
    pub groups: Vec<GroupResult>,
}

/// Result payload of a successful bootstrap job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapReport {
    /// One entry per stage, in execution order.
    pub stages: Vec<StageReport>,
}

impl BootstrapReport {
    /// Returns the number of hosts that did not succeed.
    #[must_use]
    pub fn failed_hosts(&self) -> usize {
        self.stages
            .iter()
            .flat_map(|s| &s.groups)
            .map(|g| g.failures().count())
            .sum()
    }
}

/// Runs bootstrap routines.
///
/// Cloning is cheap; clones share the context.
#[derive(Clone)]
pub struct BootstrapManager {
    ctx: FlowContext,
    worker: Arc<dyn Worker>,
}

impl BootstrapManager {
    /// Creates a manager that bootstraps hosts over the context's executor.
    #[must_use]
    pub fn new(ctx: FlowContext) -> Self {
        let worker = Arc::new(BootstrapWorker::new(
            Arc::clone(&ctx.executor),
            ctx.config.ssh_timeout(),
        ));
        Self::with_worker(ctx, worker)
    }

    /// Creates a manager with a custom worker.
    #[must_use]
    pub fn with_worker(ctx: FlowContext, worker: Arc<dyn Worker>) -> Self {
        tracing::info!("Bootstrap manager starting");
        Self { ctx, worker }
    }

    /// Returns the manager's context.
    #[must_use]
    pub const fn context(&self) -> &FlowContext {
        &self.ctx
    }

    /// Schedules a bootstrap and returns its ticket without waiting.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    #[must_use]
    pub fn bootstrap(
        &self,
        environment: &str,
        manifest: Manifest,
        routine: Routine,
        options: BootstrapOptions,
    ) -> JobTicket {
        let job = self.ctx.jobs.create(JobType::Bootstrap);
        let ticket = job.ticket();
        let span = orchestration_span("bootstrap", &job.id().to_string(), environment);

        let manager = self.clone();
        let environment = environment.to_string();
        tokio::spawn(
            async move {
                manager
                    .start(&environment, &manifest, &routine, &options, &job)
                    .await;
            }
            .instrument(span),
        );

        ticket
    }

    /// Runs a bootstrap to completion, recording the outcome on `job`.
    ///
    /// Never returns an error; the outcome is only visible through the job.
    pub async fn start(
        &self,
        environment: &str,
        manifest: &Manifest,
        routine: &Routine,
        options: &BootstrapOptions,
        job: &Job,
    ) {
        job.report_running();
        match self.run(environment, manifest, routine, options, job).await {
            Ok(report) => {
                tracing::info!(
                    environment,
                    stages = report.stages.len(),
                    failed_hosts = report.failed_hosts(),
                    "Bootstrap finished"
                );
                job.report_success(serde_json::to_value(&report).ok());
            }
            Err(err) => {
                tracing::error!(environment, error = %err, "Bootstrap failed");
                job.report_failure(&err);
            }
        }
    }

    /// Validates and drains a routine without finishing the job.
    ///
    /// Used by flows that bootstrap as one step of a larger job.
    ///
    /// # Errors
    ///
    /// - [`Error::Configuration`] if required options are missing
    /// - [`Error::ManifestValidation`] if a task has no hosts
    /// - [`Error::EnvironmentNotFound`] if the environment does not exist
    /// - lock errors, [`Error::LockPreempted`] and [`Error::StageFailed`]
    ///   from the drain
    pub async fn run(
        &self,
        environment: &str,
        manifest: &Manifest,
        routine: &Routine,
        options: &BootstrapOptions,
        job: &Job,
    ) -> Result<BootstrapReport> {
        options.validate()?;
        manifest.validate(routine)?;

        let chef = &self.ctx.chef;
        if !chef.environment_exists(environment).await? {
            return Err(Error::EnvironmentNotFound {
                environment: environment.to_string(),
                server_url: chef.server_url().to_string(),
            });
        }

        tracing::info!(
            environment,
            stages = routine.len(),
            fingerprint = routine.fingerprint(),
            "Starting bootstrap of nodes"
        );

        let mut options = options.clone();
        options
            .environment
            .get_or_insert_with(|| environment.to_string());

        let lock_options = self
            .ctx
            .config
            .lock_options(options.force)
            .with_job(job.clone());
        self.ctx
            .locks
            .synchronize(environment, lock_options, |lease| {
                self.drain(routine, manifest, &options, job, lease)
            })
            .await
    }

    async fn drain(
        &self,
        routine: &Routine,
        manifest: &Manifest,
        options: &BootstrapOptions,
        job: &Job,
        lease: LockHandle,
    ) -> Result<BootstrapReport> {
        let mut report = BootstrapReport::default();

        for (index, stage) in routine.task_queue().into_iter().enumerate() {
            if !lease.is_held() {
                return Err(Error::LockPreempted {
                    environment: lease.environment().to_string(),
                });
            }

            let ids = stage.ids().join(", ");
            job.set_status(format!("Bootstrapping {ids}"));
            tracing::info!(stage = index, tasks = %ids, "Entering stage");

            let results = {
                let _timer = time_stage("bootstrap");
                self.concurrent_bootstrap(&stage, manifest, options).await
            };
            report.stages.push(self.settle(index, results, job)?);
        }

        Ok(report)
    }

    /// Runs every task of a stage concurrently and waits for all of them.
    ///
    /// Results come back in task order. A worker that exits without a result
    /// is reported as [`Error::WorkerAborted`].
    async fn concurrent_bootstrap(
        &self,
        stage: &Stage,
        manifest: &Manifest,
        options: &BootstrapOptions,
    ) -> Vec<(String, Result<GroupResult>)> {
        let mut workers = JoinSet::new();
        for task in stage.tasks() {
            let worker = Arc::clone(&self.worker);
            let task = task.clone();
            let hosts = manifest.hosts(&task.id).to_vec();
            let options = options.clone();
            workers.spawn(
                async move {
                    let result = worker.run(&task, &hosts, &options).await;
                    (task.id, result)
                }
                .in_current_span(),
            );
        }

        let mut finished = HashMap::with_capacity(stage.tasks().len());
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok((id, result)) => {
                    finished.insert(id, result);
                }
                Err(err) => tracing::error!(error = %err, "Worker task aborted"),
            }
        }

        stage
            .tasks()
            .iter()
            .map(|task| {
                let result = finished.remove(&task.id).unwrap_or_else(|| {
                    Err(Error::WorkerAborted {
                        group_id: task.id.clone(),
                        message: "worker exited without a result".to_string(),
                    })
                });
                (task.id.clone(), result)
            })
            .collect()
    }

    /// Applies the host failure policy to a finished stage.
    fn settle(
        &self,
        index: usize,
        results: Vec<(String, Result<GroupResult>)>,
        job: &Job,
    ) -> Result<StageReport> {
        let metrics = FlowMetrics::new();
        let mut groups = Vec::with_capacity(results.len());
        let mut worker_errors = Vec::new();
        let mut host_failures = Vec::new();

        for (id, result) in results {
            match result {
                Ok(group) => {
                    for host in group.failures() {
                        metrics.record_host_failure(&id);
                        host_failures.push(format!("{id} on {}: {}", host.host, host.outcome));
                    }
                    groups.push(group);
                }
                Err(err) => worker_errors.push(format!("{id}: {err}")),
            }
        }

        let policy = self.ctx.config.host_failure_policy;
        if !worker_errors.is_empty()
            || (!host_failures.is_empty() && policy == HostFailurePolicy::FailRun)
        {
            worker_errors.extend(host_failures);
            return Err(Error::StageFailed {
                stage: index,
                failures: worker_errors,
            });
        }

        if !host_failures.is_empty() {
            tracing::warn!(
                stage = index,
                failed = host_failures.len(),
                "Continuing past failed hosts"
            );
            job.set_status(format!(
                "Stage {index} finished with {} failed host(s): {}",
                host_failures.len(),
                host_failures.join("; ")
            ));
        }

        Ok(StageReport { index, groups })
    }
}

impl std::fmt::Debug for BootstrapManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BootstrapManager")
            .field("ctx", &self.ctx)
            .finish_non_exhaustive()
    }
}
