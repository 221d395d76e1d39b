//! Composition context shared by the orchestration front ends.

use std::sync::Arc;

use crate::config::FlowConfig;
use crate::job::JobRegistry;
use crate::lock::LockCoordinator;
use crate::remote::{ChefServer, RemoteExecutor};

/// Everything an orchestration run needs, passed explicitly.
///
/// Cloning is cheap and shares the lock table and job registry, so a
/// bootstrap manager and an upgrader built from clones of one context
/// serialize against each other.
#[derive(Clone)]
pub struct FlowContext {
    /// Engine configuration.
    pub config: Arc<FlowConfig>,
    /// Configuration server client.
    pub chef: Arc<dyn ChefServer>,
    /// Remote command executor.
    pub executor: Arc<dyn RemoteExecutor>,
    /// Environment lock coordinator.
    pub locks: LockCoordinator,
    /// Job registry.
    pub jobs: JobRegistry,
}

impl FlowContext {
    /// Creates a context with a fresh lock table and a job registry sized
    /// from the configuration.
    #[must_use]
    pub fn new(
        config: FlowConfig,
        chef: Arc<dyn ChefServer>,
        executor: Arc<dyn RemoteExecutor>,
    ) -> Self {
        let jobs = JobRegistry::new(config.job_retention);
        Self {
            config: Arc::new(config),
            chef,
            executor,
            locks: LockCoordinator::new(),
            jobs,
        }
    }
}

impl std::fmt::Debug for FlowContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowContext")
            .field("config", &self.config)
            .field("server_url", &self.chef.server_url())
            .field("locks", &self.locks)
            .finish_non_exhaustive()
    }
}
