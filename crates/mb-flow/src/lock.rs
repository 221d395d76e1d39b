//! Environment-scoped mutual exclusion.
//!
//! Every cluster-mutating operation runs inside an exclusive claim on its
//! environment name, so a bootstrap and an upgrade can never touch the same
//! environment's remote state at once.
//!
//! ## Semantics
//!
//! Per environment the lock moves `FREE -> HELD -> FREE`:
//!
//! - **Free**: the caller is granted immediately.
//! - **Held, not forced**: under [`LockPolicy::Wait`] the caller queues and
//!   waiters are granted in arrival order, optionally bounded by a timeout.
//!   Under [`LockPolicy::FailFast`] the caller gets [`Error::LockConflict`].
//! - **Held, forced**: the current holder's job is failed with
//!   [`Error::LockPreempted`], its guard goes stale, and the caller is
//!   granted immediately.
//!
//! Release is idempotent. Releasing a stale guard, releasing twice, or
//! releasing an environment that was never locked is a no-op.
//!
//! ## Example
//!
//! ```rust
//! use mb_flow::lock::{LockCoordinator, LockOptions};
//!
//! # async fn example() -> mb_flow::error::Result<()> {
//! let locks = LockCoordinator::new();
//! let value = locks
//!     .synchronize("production", LockOptions::new(), |lease| async move {
//!         assert!(lease.is_held());
//!         Ok(42)
//!     })
//!     .await?;
//! assert_eq!(value, 42);
//! # Ok(())
//! # }
//! ```

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use mb_core::{JobId, LockToken};

use crate::error::{Error, Result};
use crate::job::Job;
use crate::metrics::FlowMetrics;

/// What to do when the lock is already held.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockPolicy {
    /// Queue until the lock is released.
    #[default]
    Wait,
    /// Fail immediately with [`Error::LockConflict`].
    FailFast,
}

/// Options for one lock acquisition.
#[derive(Debug, Clone, Default)]
pub struct LockOptions {
    /// Pre-empt the current holder instead of waiting.
    pub force: bool,
    /// Job to report waiting status into, and to fail if pre-empted later.
    pub job: Option<Job>,
    /// Contention policy.
    pub policy: LockPolicy,
    /// Upper bound on waiting. `None` waits forever.
    pub timeout: Option<Duration>,
}

impl LockOptions {
    /// Creates default options: wait forever, no job, not forced.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the force flag.
    #[must_use]
    pub const fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Attaches a job.
    #[must_use]
    pub fn with_job(mut self, job: Job) -> Self {
        self.job = Some(job);
        self
    }

    /// Sets the contention policy.
    #[must_use]
    pub const fn with_policy(mut self, policy: LockPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Sets the wait timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Information about a held lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockInfo {
    /// Locked environment.
    pub environment: String,
    /// Token identifying this grant.
    pub token: LockToken,
    /// Job running under the lock, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
    /// When the lock was granted.
    pub acquired_at: DateTime<Utc>,
    /// Whether the grant pre-empted a previous holder.
    pub forced: bool,
}

impl LockInfo {
    fn describe(&self) -> String {
        self.job_id
            .map_or_else(|| format!("lock {}", self.token), |id| format!("job {id}"))
    }
}

#[derive(Debug)]
struct Holder {
    info: LockInfo,
    job: Option<Job>,
}

impl Holder {
    fn new(environment: &str, token: LockToken, job: Option<Job>, forced: bool) -> Self {
        Self {
            info: LockInfo {
                environment: environment.to_string(),
                token,
                job_id: job.as_ref().map(Job::id),
                acquired_at: Utc::now(),
                forced,
            },
            job,
        }
    }
}

#[derive(Debug)]
struct Waiter {
    token: LockToken,
    job: Option<Job>,
    grant: oneshot::Sender<()>,
}

#[derive(Debug, Default)]
struct EnvLock {
    holder: Option<Holder>,
    waiters: VecDeque<Waiter>,
}

type LockTable = HashMap<String, EnvLock>;

/// Converts a lock poison error to an internal error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::internal("lock table poisoned")
}

/// Arbiter of per-environment locks.
///
/// Cloning shares the same lock table.
#[derive(Debug, Clone, Default)]
pub struct LockCoordinator {
    table: Arc<Mutex<LockTable>>,
    metrics: FlowMetrics,
}

impl LockCoordinator {
    /// Creates a coordinator with no locks held.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the lock on an environment.
    ///
    /// # Errors
    ///
    /// - [`Error::LockConflict`] if held and the policy is fail-fast
    /// - [`Error::LockTimeout`] if the wait exceeds `options.timeout`
    pub async fn acquire(&self, environment: &str, options: LockOptions) -> Result<LockGuard> {
        let started = Instant::now();
        let token = LockToken::generate();

        let (granted, holder) = {
            let mut table = self.table.lock().map_err(poison_err)?;
            let entry = table.entry(environment.to_string()).or_default();

            match entry.holder.take() {
                None => {
                    entry.holder = Some(Holder::new(environment, token, options.job, false));
                    tracing::info!(environment, token = %token, "Environment lock granted");
                    self.metrics.observe_lock_wait("granted", started.elapsed());
                    return Ok(self.guard(environment, token));
                }
                Some(previous) if options.force => {
                    entry.holder = Some(Holder::new(environment, token, options.job, true));
                    drop(table);
                    self.preempt(environment, previous);
                    self.metrics.observe_lock_wait("granted", started.elapsed());
                    return Ok(self.guard(environment, token));
                }
                Some(current) => {
                    let holder = current.info.describe();
                    entry.holder = Some(current);

                    if options.policy == LockPolicy::FailFast {
                        self.metrics.observe_lock_wait("conflict", started.elapsed());
                        return Err(Error::LockConflict {
                            environment: environment.to_string(),
                            holder,
                        });
                    }

                    let (grant, granted) = oneshot::channel();
                    entry.waiters.push_back(Waiter {
                        token,
                        job: options.job.clone(),
                        grant,
                    });
                    (granted, holder)
                }
            }
        };

        if let Some(job) = &options.job {
            job.set_status(format!("Waiting for lock on {environment}"));
        }
        tracing::info!(environment, holder = %holder, "Waiting for environment lock");

        let mut pending = PendingAcquire {
            coordinator: self,
            environment,
            token,
            armed: true,
        };

        let received = match options.timeout {
            Some(limit) => {
                if let Ok(received) = tokio::time::timeout(limit, granted).await {
                    received
                } else {
                    drop(pending);
                    self.metrics.observe_lock_wait("timeout", started.elapsed());
                    tracing::warn!(environment, waited = ?limit, "Timed out waiting for environment lock");
                    return Err(Error::LockTimeout {
                        environment: environment.to_string(),
                        waited: limit,
                    });
                }
            }
            None => granted.await,
        };

        if received.is_err() {
            drop(pending);
            return Err(Error::internal(format!(
                "lock grant channel for '{environment}' closed"
            )));
        }

        pending.armed = false;
        self.metrics.observe_lock_wait("granted", started.elapsed());
        tracing::info!(environment, token = %token, "Environment lock granted after wait");
        Ok(self.guard(environment, token))
    }

    /// Runs `body` while holding the environment lock.
    ///
    /// The lock is released on every exit path: success, error, panic, or the
    /// returned future being dropped.
    ///
    /// # Errors
    ///
    /// Returns acquisition errors from [`LockCoordinator::acquire`], or the
    /// body's own error.
    pub async fn synchronize<F, Fut, T>(
        &self,
        environment: &str,
        options: LockOptions,
        body: F,
    ) -> Result<T>
    where
        F: FnOnce(LockHandle) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let guard = self.acquire(environment, options).await?;
        let result = body(guard.handle()).await;
        guard.release();
        result
    }

    /// Releases the grant identified by `token`.
    ///
    /// Returns false if the token does not hold the lock.
    pub fn release(&self, environment: &str, token: LockToken) -> bool {
        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        let released = Self::release_in(&mut table, environment, token);
        if released {
            tracing::info!(environment, token = %token, "Environment lock released");
        }
        released
    }

    /// Returns the current holder of an environment lock.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Internal`] if the lock table is poisoned.
    pub fn holder(&self, environment: &str) -> Result<Option<LockInfo>> {
        let table = self.table.lock().map_err(poison_err)?;
        Ok(table
            .get(environment)
            .and_then(|entry| entry.holder.as_ref())
            .map(|h| h.info.clone()))
    }

    /// Returns every held lock, ordered by environment.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Internal`] if the lock table is poisoned.
    pub fn locks(&self) -> Result<Vec<LockInfo>> {
        let table = self.table.lock().map_err(poison_err)?;
        let mut locks: Vec<LockInfo> = table
            .values()
            .filter_map(|entry| entry.holder.as_ref().map(|h| h.info.clone()))
            .collect();
        locks.sort_by(|a, b| a.environment.cmp(&b.environment));
        Ok(locks)
    }

    /// Returns the number of callers queued on an environment.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Internal`] if the lock table is poisoned.
    pub fn waiting(&self, environment: &str) -> Result<usize> {
        let table = self.table.lock().map_err(poison_err)?;
        Ok(table.get(environment).map_or(0, |entry| entry.waiters.len()))
    }

    fn is_held_by(&self, environment: &str, token: LockToken) -> bool {
        self.table_guard()
            .get(environment)
            .and_then(|entry| entry.holder.as_ref())
            .is_some_and(|h| h.info.token == token)
    }

    fn preempt(&self, environment: &str, previous: Holder) {
        self.metrics.record_lock_preemption();
        tracing::warn!(
            environment,
            holder = %previous.info.describe(),
            "Environment lock forcibly released"
        );
        if let Some(job) = previous.job {
            job.report_failure(&Error::LockPreempted {
                environment: environment.to_string(),
            });
        }
    }

    /// Releases a grant and hands the lock to the first live waiter.
    fn release_in(table: &mut LockTable, environment: &str, token: LockToken) -> bool {
        let Some(entry) = table.get_mut(environment) else {
            return false;
        };
        if !entry
            .holder
            .as_ref()
            .is_some_and(|h| h.info.token == token)
        {
            return false;
        }

        entry.holder = None;
        while let Some(waiter) = entry.waiters.pop_front() {
            entry.holder = Some(Holder::new(environment, waiter.token, waiter.job, false));
            if waiter.grant.send(()).is_ok() {
                break;
            }
            // The waiter gave up between queueing and the handoff.
            entry.holder = None;
        }

        if entry.holder.is_none() && entry.waiters.is_empty() {
            table.remove(environment);
        }
        true
    }

    fn guard(&self, environment: &str, token: LockToken) -> LockGuard {
        LockGuard {
            handle: LockHandle {
                coordinator: self.clone(),
                environment: environment.to_string(),
                token,
            },
            released: false,
        }
    }

    fn table_guard(&self) -> MutexGuard<'_, LockTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Cleans up a queued acquisition that did not complete.
///
/// If the grant already arrived, the lock is released so it passes on to the
/// next waiter instead of leaking.
struct PendingAcquire<'a> {
    coordinator: &'a LockCoordinator,
    environment: &'a str,
    token: LockToken,
    armed: bool,
}

impl Drop for PendingAcquire<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut table = self.coordinator.table_guard();
        if LockCoordinator::release_in(&mut table, self.environment, self.token) {
            return;
        }
        if let Some(entry) = table.get_mut(self.environment) {
            entry.waiters.retain(|w| w.token != self.token);
            if entry.holder.is_none() && entry.waiters.is_empty() {
                table.remove(self.environment);
            }
        }
    }
}

/// A cloneable view of a grant, used to check for pre-emption.
#[derive(Debug, Clone)]
pub struct LockHandle {
    coordinator: LockCoordinator,
    environment: String,
    token: LockToken,
}

impl LockHandle {
    /// Returns the locked environment.
    #[must_use]
    pub fn environment(&self) -> &str {
        &self.environment
    }

    /// Returns the grant token.
    #[must_use]
    pub const fn token(&self) -> LockToken {
        self.token
    }

    /// Returns false once the grant was released or pre-empted.
    #[must_use]
    pub fn is_held(&self) -> bool {
        self.coordinator.is_held_by(&self.environment, self.token)
    }
}

/// RAII guard for a held environment lock.
///
/// The lock is automatically released when the guard is dropped.
#[derive(Debug)]
pub struct LockGuard {
    handle: LockHandle,
    released: bool,
}

impl LockGuard {
    /// Returns the locked environment.
    #[must_use]
    pub fn environment(&self) -> &str {
        &self.handle.environment
    }

    /// Returns the grant token.
    #[must_use]
    pub const fn token(&self) -> LockToken {
        self.handle.token
    }

    /// Returns false once the grant was pre-empted.
    #[must_use]
    pub fn is_held(&self) -> bool {
        !self.released && self.handle.is_held()
    }

    /// Returns a cloneable handle for checking the grant.
    #[must_use]
    pub fn handle(&self) -> LockHandle {
        self.handle.clone()
    }

    /// Explicitly releases the lock.
    ///
    /// Returns false if the grant had already been pre-empted.
    pub fn release(mut self) -> bool {
        self.do_release()
    }

    fn do_release(&mut self) -> bool {
        if self.released {
            return false;
        }
        self.released = true;
        self.handle
            .coordinator
            .release(&self.handle.environment, self.handle.token)
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.do_release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobState, JobType};

    async fn wait_for_waiters(locks: &LockCoordinator, environment: &str, count: usize) {
        while locks.waiting(environment).unwrap() < count {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn free_lock_is_granted() -> Result<()> {
        let locks = LockCoordinator::new();
        let guard = locks.acquire("prod", LockOptions::new()).await?;

        assert!(guard.is_held());
        let holder = locks.holder("prod")?.unwrap();
        assert_eq!(holder.token, guard.token());
        assert!(!holder.forced);
        assert!(guard.release());
        assert!(locks.holder("prod")?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn environments_are_independent() -> Result<()> {
        let locks = LockCoordinator::new();
        let _prod = locks.acquire("prod", LockOptions::new()).await?;
        let _staging = locks.acquire("staging", LockOptions::new()).await?;

        let names: Vec<String> = locks.locks()?.into_iter().map(|l| l.environment).collect();
        assert_eq!(names, vec!["prod", "staging"]);
        Ok(())
    }

    #[tokio::test]
    async fn fail_fast_reports_conflict() -> Result<()> {
        let locks = LockCoordinator::new();
        let job = Job::new(JobType::Bootstrap);
        let _guard = locks
            .acquire("prod", LockOptions::new().with_job(job.clone()))
            .await?;

        let err = locks
            .acquire("prod", LockOptions::new().with_policy(LockPolicy::FailFast))
            .await
            .unwrap_err();
        match err {
            Error::LockConflict { holder, .. } => {
                assert_eq!(holder, format!("job {}", job.id()));
            }
            other => panic!("unexpected error: {other}"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn waiters_are_granted_in_arrival_order() -> Result<()> {
        let locks = LockCoordinator::new();
        let first = locks.acquire("prod", LockOptions::new()).await?;

        let (order_tx, mut order_rx) = tokio::sync::mpsc::unbounded_channel();
        let mut handles = Vec::new();
        for name in ["a", "b", "c"] {
            let task_locks = locks.clone();
            let order_tx = order_tx.clone();
            let queued = locks.waiting("prod")?;
            handles.push(tokio::spawn(async move {
                let guard = task_locks.acquire("prod", LockOptions::new()).await.unwrap();
                order_tx.send(name).unwrap();
                guard.release();
            }));
            wait_for_waiters(&locks, "prod", queued + 1).await;
        }
        drop(order_tx);

        first.release();
        for handle in handles {
            handle.await.unwrap();
        }

        let mut order = Vec::new();
        while let Some(name) = order_rx.recv().await {
            order.push(name);
        }
        assert_eq!(order, vec!["a", "b", "c"]);
        assert!(locks.holder("prod")?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn waiting_job_reports_status() -> Result<()> {
        let locks = LockCoordinator::new();
        let guard = locks.acquire("prod", LockOptions::new()).await?;

        let job = Job::new(JobType::Upgrade);
        job.report_running();
        let waiter = {
            let locks = locks.clone();
            let job = job.clone();
            tokio::spawn(async move {
                locks
                    .acquire("prod", LockOptions::new().with_job(job))
                    .await
                    .map(|g| g.release())
            })
        };
        wait_for_waiters(&locks, "prod", 1).await;
        assert_eq!(job.record().status, "Waiting for lock on prod");

        guard.release();
        assert!(waiter.await.unwrap()?);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn wait_times_out() -> Result<()> {
        let locks = LockCoordinator::new();
        let _guard = locks.acquire("prod", LockOptions::new()).await?;

        let err = locks
            .acquire(
                "prod",
                LockOptions::new().with_timeout(Some(Duration::from_secs(5))),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::LockTimeout { .. }));
        assert_eq!(locks.waiting("prod")?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn forced_acquisition_fails_previous_job() -> Result<()> {
        let locks = LockCoordinator::new();
        let job_a = Job::new(JobType::Bootstrap);
        job_a.report_running();
        let guard_a = locks
            .acquire("prod", LockOptions::new().with_job(job_a.clone()))
            .await?;

        let guard_b = locks
            .acquire("prod", LockOptions::new().with_force(true))
            .await?;

        assert_eq!(job_a.state(), JobState::Failure);
        assert_eq!(job_a.record().failure.unwrap().kind, "lock_preempted");
        assert!(!guard_a.is_held());
        assert!(guard_b.is_held());
        assert!(locks.holder("prod")?.unwrap().forced);

        // The stale guard must not release the new holder's grant.
        assert!(!guard_a.release());
        assert!(guard_b.is_held());
        Ok(())
    }

    #[tokio::test]
    async fn release_is_idempotent() -> Result<()> {
        let locks = LockCoordinator::new();
        let guard = locks.acquire("prod", LockOptions::new()).await?;
        let token = guard.token();

        assert!(guard.release());
        assert!(!locks.release("prod", token));
        assert!(!locks.release("never-locked", LockToken::generate()));
        Ok(())
    }

    #[tokio::test]
    async fn dropping_guard_releases() -> Result<()> {
        let locks = LockCoordinator::new();
        {
            let _guard = locks.acquire("prod", LockOptions::new()).await?;
            assert!(locks.holder("prod")?.is_some());
        }
        assert!(locks.holder("prod")?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn abandoned_wait_leaves_queue() -> Result<()> {
        let locks = LockCoordinator::new();
        let guard = locks.acquire("prod", LockOptions::new()).await?;

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move { locks.acquire("prod", LockOptions::new()).await.map(drop) })
        };
        wait_for_waiters(&locks, "prod", 1).await;
        waiter.abort();
        let _ = waiter.await;

        assert_eq!(locks.waiting("prod")?, 0);
        guard.release();
        assert!(locks.holder("prod")?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn synchronize_releases_on_error() -> Result<()> {
        let locks = LockCoordinator::new();
        let result: Result<()> = locks
            .synchronize("prod", LockOptions::new(), |lease| async move {
                assert!(lease.is_held());
                Err(Error::internal("boom"))
            })
            .await;

        assert!(result.is_err());
        assert!(locks.holder("prod")?.is_none());
        Ok(())
    }
}
