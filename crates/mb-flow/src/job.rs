//! Jobs and tickets: observable progress of asynchronous operations.
//!
//! A [`Job`] is the mutable record of one orchestration invocation. Only the
//! component running the operation holds a `Job`; everybody else observes it
//! through a read-only [`JobTicket`].
//!
//! ## State Machine
//!
//! ```text
//! QUEUED ──► RUNNING ──► SUCCESS
//!                  └───► FAILURE
//! ```
//!
//! Terminal states are absorbing. Writes to a terminal job are ignored and
//! the mutator returns `false`.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;

use mb_core::JobId;

use crate::error::Error;
use crate::metrics::FlowMetrics;

/// Default number of finished jobs kept for lookup.
pub const DEFAULT_JOB_RETENTION: usize = 1000;

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    /// Created, not yet started.
    #[default]
    Queued,
    /// Work is in progress.
    Running,
    /// Finished successfully.
    Success,
    /// Finished with an error.
    Failure,
}

impl JobState {
    /// Returns true if this is a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failure)
    }

    /// Returns true if the transition from self to target is valid.
    #[must_use]
    pub const fn can_transition_to(&self, target: Self) -> bool {
        match self {
            Self::Queued => matches!(target, Self::Running),
            Self::Running => matches!(target, Self::Success | Self::Failure),
            Self::Success | Self::Failure => false,
        }
    }

    /// Returns the wire name of the state.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Running => "RUNNING",
            Self::Success => "SUCCESS",
            Self::Failure => "FAILURE",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The kind of operation a job tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    /// Cluster bootstrap.
    Bootstrap,
    /// Component or cookbook version upgrade.
    Upgrade,
    /// Environment provisioning.
    Provision,
    /// Environment teardown.
    Destroy,
}

impl JobType {
    /// Returns the label used in logs and metrics.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Bootstrap => "bootstrap",
            Self::Upgrade => "upgrade",
            Self::Provision => "provision",
            Self::Destroy => "destroy",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a job failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    /// Stable machine-readable error kind.
    pub kind: String,
    /// Human-readable message.
    pub message: String,
}

impl JobFailure {
    /// Creates a failure cause.
    #[must_use]
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

impl From<&Error> for JobFailure {
    fn from(err: &Error) -> Self {
        Self::new(err.kind(), err.to_string())
    }
}

impl From<Error> for JobFailure {
    fn from(err: Error) -> Self {
        Self::from(&err)
    }
}

impl fmt::Display for JobFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Point-in-time snapshot of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    /// Job identifier.
    pub id: JobId,
    /// Operation the job tracks.
    pub job_type: JobType,
    /// Current state.
    pub state: JobState,
    /// Most recent status line.
    pub status: String,
    /// Result payload, set on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Failure cause, set on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<JobFailure>,
    /// When the job was created.
    pub created_at: DateTime<Utc>,
    /// When the job started running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the job reached a terminal state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    fn new(job_type: JobType) -> Self {
        Self {
            id: JobId::generate(),
            job_type,
            state: JobState::Queued,
            status: String::new(),
            result: None,
            failure: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }
}

#[derive(Debug)]
struct Inner {
    record: RwLock<JobRecord>,
    state: watch::Sender<JobState>,
}

/// The writable handle to a job.
///
/// Cloning shares the same record. Mutators take `&self` and are safe to
/// call from any task.
#[derive(Debug, Clone)]
pub struct Job {
    inner: Arc<Inner>,
}

impl Job {
    /// Creates a detached job in the `QUEUED` state.
    ///
    /// Most callers should go through [`JobRegistry::create`] so the job can
    /// be looked up by id.
    #[must_use]
    pub fn new(job_type: JobType) -> Self {
        let (state, _) = watch::channel(JobState::Queued);
        Self {
            inner: Arc::new(Inner {
                record: RwLock::new(JobRecord::new(job_type)),
                state,
            }),
        }
    }

    /// Returns the job id.
    #[must_use]
    pub fn id(&self) -> JobId {
        self.read().id
    }

    /// Returns the job type.
    #[must_use]
    pub fn job_type(&self) -> JobType {
        self.read().job_type
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> JobState {
        self.read().state
    }

    /// Returns a snapshot of the record.
    #[must_use]
    pub fn record(&self) -> JobRecord {
        self.read().clone()
    }

    /// Returns a read-only ticket for this job.
    #[must_use]
    pub fn ticket(&self) -> JobTicket {
        JobTicket {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Moves the job to `RUNNING`.
    ///
    /// Returns false if the job was not `QUEUED`.
    pub fn report_running(&self) -> bool {
        let mut record = self.write();
        if !record.state.can_transition_to(JobState::Running) {
            return false;
        }
        Self::enter_running(&mut record);
        self.inner.state.send_replace(JobState::Running);
        true
    }

    /// Replaces the status line.
    ///
    /// Returns false if the job is already terminal.
    pub fn set_status(&self, status: impl Into<String>) -> bool {
        let mut record = self.write();
        if record.state.is_terminal() {
            return false;
        }
        record.status = status.into();
        true
    }

    /// Marks the job successful with an optional result payload.
    ///
    /// Returns false if the job is already terminal.
    pub fn report_success(&self, result: Option<Value>) -> bool {
        self.finish(JobState::Success, |record| record.result = result)
    }

    /// Marks the job failed.
    ///
    /// Returns false if the job is already terminal.
    pub fn report_failure(&self, cause: impl Into<JobFailure>) -> bool {
        let cause = cause.into();
        self.finish(JobState::Failure, |record| {
            record.status = cause.message.clone();
            record.failure = Some(cause);
        })
    }

    fn finish(&self, target: JobState, apply: impl FnOnce(&mut JobRecord)) -> bool {
        let mut record = self.write();
        if record.state.is_terminal() {
            tracing::debug!(
                job_id = %record.id,
                state = %record.state,
                ignored = %target,
                "Ignoring write to finished job"
            );
            return false;
        }
        if record.state == JobState::Queued {
            Self::enter_running(&mut record);
        }

        apply(&mut record);
        record.state = target;
        record.finished_at = Some(Utc::now());

        let metrics = FlowMetrics::new();
        metrics.job_stopped();
        metrics.record_job_finished(record.job_type.as_str(), target.as_str());
        tracing::info!(
            job_id = %record.id,
            job_type = %record.job_type,
            state = %target,
            "Job finished"
        );

        drop(record);
        self.inner.state.send_replace(target);
        true
    }

    fn enter_running(record: &mut JobRecord) {
        record.state = JobState::Running;
        record.started_at = Some(Utc::now());
        FlowMetrics::new().job_started();
    }

    fn read(&self) -> RwLockReadGuard<'_, JobRecord> {
        self.inner
            .record
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, JobRecord> {
        self.inner
            .record
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// A read-only handle to a job.
///
/// Accessors never block on the job's progress. Use [`JobTicket::wait`] to
/// suspend until the job finishes.
#[derive(Debug, Clone)]
pub struct JobTicket {
    inner: Arc<Inner>,
}

impl JobTicket {
    /// Returns the job id.
    #[must_use]
    pub fn id(&self) -> JobId {
        self.read().id
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> JobState {
        self.read().state
    }

    /// Returns the most recent status line.
    #[must_use]
    pub fn status(&self) -> String {
        self.read().status.clone()
    }

    /// Returns the result payload, if the job succeeded with one.
    #[must_use]
    pub fn result(&self) -> Option<Value> {
        self.read().result.clone()
    }

    /// Returns the failure cause, if the job failed.
    #[must_use]
    pub fn failure(&self) -> Option<JobFailure> {
        self.read().failure.clone()
    }

    /// Returns a snapshot of the record.
    #[must_use]
    pub fn record(&self) -> JobRecord {
        self.read().clone()
    }

    /// Waits until the job is terminal and returns its final record.
    pub async fn wait(&self) -> JobRecord {
        let mut rx = self.inner.state.subscribe();
        // The sender lives in `inner`, which this ticket keeps alive.
        let _ = rx.wait_for(JobState::is_terminal).await;
        self.record()
    }

    fn read(&self) -> RwLockReadGuard<'_, JobRecord> {
        self.inner
            .record
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug)]
struct RegistryInner {
    jobs: BTreeMap<JobId, Job>,
    capacity: usize,
}

/// Bounded registry of jobs, looked up by id.
///
/// Active jobs are always retained. Once more than `capacity` finished jobs
/// exist, the ones that finished earliest are evicted.
#[derive(Debug, Clone)]
pub struct JobRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_JOB_RETENTION)
    }
}

impl JobRegistry {
    /// Creates a registry retaining up to `capacity` finished jobs.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(RegistryInner {
                jobs: BTreeMap::new(),
                capacity,
            })),
        }
    }

    /// Creates and registers a new job.
    #[must_use]
    pub fn create(&self, job_type: JobType) -> Job {
        let job = Job::new(job_type);
        let mut inner = self.lock();
        inner.jobs.insert(job.id(), job.clone());
        Self::prune(&mut inner);
        tracing::debug!(job_id = %job.id(), job_type = %job_type, "Job created");
        job
    }

    /// Returns a ticket for the job with the given id.
    #[must_use]
    pub fn get(&self, id: &JobId) -> Option<JobTicket> {
        self.lock().jobs.get(id).map(Job::ticket)
    }

    /// Returns snapshots of every retained job, oldest first.
    #[must_use]
    pub fn list(&self) -> Vec<JobRecord> {
        let mut records: Vec<JobRecord> = self.lock().jobs.values().map(Job::record).collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        records
    }

    /// Returns snapshots of jobs that are not yet terminal.
    #[must_use]
    pub fn active(&self) -> Vec<JobRecord> {
        self.list()
            .into_iter()
            .filter(|r| !r.state.is_terminal())
            .collect()
    }

    /// Returns the number of retained jobs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().jobs.len()
    }

    /// Returns true if no jobs are retained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().jobs.is_empty()
    }

    fn prune(inner: &mut RegistryInner) {
        let mut finished: Vec<(DateTime<Utc>, JobId)> = inner
            .jobs
            .values()
            .map(Job::record)
            .filter_map(|r| r.finished_at.map(|at| (at, r.id)))
            .collect();
        if finished.len() <= inner.capacity {
            return;
        }

        finished.sort();
        let excess = finished.len() - inner.capacity;
        for (_, id) in finished.into_iter().take(excess) {
            inner.jobs.remove(&id);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn state_transitions_are_one_way() {
        assert!(JobState::Queued.can_transition_to(JobState::Running));
        assert!(JobState::Running.can_transition_to(JobState::Success));
        assert!(JobState::Running.can_transition_to(JobState::Failure));
        assert!(!JobState::Running.can_transition_to(JobState::Queued));
        assert!(!JobState::Success.can_transition_to(JobState::Failure));
        assert!(!JobState::Failure.can_transition_to(JobState::Running));
    }

    #[test]
    fn state_serializes_screaming() {
        assert_eq!(
            serde_json::to_string(&JobState::Success).unwrap(),
            "\"SUCCESS\""
        );
        assert_eq!(JobState::Failure.to_string(), "FAILURE");
    }

    #[test]
    fn job_runs_then_succeeds() {
        let job = Job::new(JobType::Bootstrap);
        assert_eq!(job.state(), JobState::Queued);

        assert!(job.report_running());
        assert!(job.set_status("Bootstrapping a::master"));
        assert!(job.report_success(Some(json!({"ok": true}))));

        let record = job.record();
        assert_eq!(record.state, JobState::Success);
        assert_eq!(record.status, "Bootstrapping a::master");
        assert_eq!(record.result, Some(json!({"ok": true})));
        assert!(record.started_at.is_some());
        assert!(record.finished_at.is_some());
    }

    #[test]
    fn report_running_twice_is_refused() {
        let job = Job::new(JobType::Upgrade);
        assert!(job.report_running());
        assert!(!job.report_running());
    }

    #[test]
    fn terminal_job_ignores_writes() {
        let job = Job::new(JobType::Bootstrap);
        job.report_running();
        job.report_failure(JobFailure::new("internal", "boom"));

        assert!(!job.set_status("later"));
        assert!(!job.report_success(None));
        assert!(!job.report_failure(JobFailure::new("internal", "again")));
        assert!(!job.report_running());

        let record = job.record();
        assert_eq!(record.state, JobState::Failure);
        assert_eq!(record.failure.unwrap().message, "boom");
        assert_eq!(record.status, "boom");
    }

    #[test]
    fn queued_job_can_fail_directly() {
        let job = Job::new(JobType::Bootstrap);
        assert!(job.report_failure(Error::LockPreempted {
            environment: "prod".into()
        }));
        let record = job.record();
        assert_eq!(record.state, JobState::Failure);
        assert!(record.started_at.is_some());
        assert_eq!(record.failure.unwrap().kind, "lock_preempted");
    }

    #[test]
    fn ticket_observes_job() {
        let job = Job::new(JobType::Bootstrap);
        let ticket = job.ticket();
        assert_eq!(ticket.id(), job.id());

        job.report_running();
        job.set_status("working");
        assert_eq!(ticket.state(), JobState::Running);
        assert_eq!(ticket.status(), "working");
        assert!(ticket.result().is_none());
        assert!(ticket.failure().is_none());
    }

    #[tokio::test]
    async fn ticket_wait_resolves_on_terminal_state() {
        let job = Job::new(JobType::Bootstrap);
        let ticket = job.ticket();

        let waiter = tokio::spawn(async move { ticket.wait().await });
        job.report_running();
        job.report_success(None);

        let record = waiter.await.unwrap();
        assert_eq!(record.state, JobState::Success);
    }

    #[test]
    fn ticket_wait_stays_pending_through_status_updates() {
        let job = Job::new(JobType::Upgrade);
        let ticket = job.ticket();
        let mut wait = tokio_test::task::spawn(ticket.wait());

        tokio_test::assert_pending!(wait.poll());
        job.report_running();
        job.set_status("Setting cookbook versions");
        tokio_test::assert_pending!(wait.poll());

        job.report_failure(JobFailure::new("internal", "boom"));
        assert!(wait.is_woken());
        let record = tokio_test::assert_ready!(wait.poll());
        assert_eq!(record.state, JobState::Failure);
    }

    #[tokio::test]
    async fn ticket_wait_returns_immediately_when_finished() {
        let job = Job::new(JobType::Destroy);
        job.report_success(None);
        assert_eq!(job.ticket().wait().await.state, JobState::Success);
    }

    #[test]
    fn record_serializes_for_gateways() {
        let job = Job::new(JobType::Provision);
        job.report_failure(JobFailure::new("provision", "no capacity"));
        let value = serde_json::to_value(job.record()).unwrap();
        assert_eq!(value["state"], "FAILURE");
        assert_eq!(value["jobType"], "provision");
        assert_eq!(value["failure"]["kind"], "provision");
    }

    #[test]
    fn registry_looks_up_by_id() {
        let registry = JobRegistry::new(10);
        let job = registry.create(JobType::Bootstrap);
        let ticket = registry.get(&job.id()).unwrap();
        assert_eq!(ticket.id(), job.id());
        assert!(registry.get(&JobId::generate()).is_none());
    }

    #[test]
    fn registry_lists_active_jobs() {
        let registry = JobRegistry::new(10);
        let running = registry.create(JobType::Bootstrap);
        let done = registry.create(JobType::Upgrade);
        running.report_running();
        done.report_success(None);

        let active = registry.active();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, running.id());
        assert_eq!(registry.list().len(), 2);
    }

    #[test]
    fn registry_evicts_oldest_finished_only() {
        let registry = JobRegistry::new(1);
        let active = registry.create(JobType::Bootstrap);
        active.report_running();

        let first = registry.create(JobType::Bootstrap);
        first.report_success(None);
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = registry.create(JobType::Bootstrap);
        second.report_success(None);

        // Pruning happens on create.
        let _third = registry.create(JobType::Bootstrap);

        assert!(registry.get(&active.id()).is_some());
        assert!(registry.get(&first.id()).is_none());
        assert!(registry.get(&second.id()).is_some());
    }
}
