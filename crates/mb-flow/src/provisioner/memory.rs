//! In-memory provisioner for testing.
//!
//! [`InMemoryProvisioner`] hands out hostnames instead of creating machines.
//! It can be told to come up short, to fail, or to stay pending for a number
//! of polls, and it records every `up` and `down` it serves.
//!
//! ## Limitations
//!
//! - **NOT suitable for production**: No machines are created
//! - **No persistence**: All state is lost when the process exits

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;

use super::{ProvisionManifest, ProvisionOptions, ProvisionedNode, Provisioner};
use crate::error::{Error, Result};
use crate::job::Job;
use crate::plugin::Plugin;

/// Provisioner that fabricates hostnames.
///
/// ## Example
///
/// ```rust
/// use mb_flow::provisioner::memory::InMemoryProvisioner;
///
/// let provisioner = InMemoryProvisioner::new("memory").short_by(1);
/// ```
#[derive(Debug)]
pub struct InMemoryProvisioner {
    id: String,
    short_by: usize,
    failure: Option<String>,
    pending_polls: AtomicU32,
    environments: RwLock<BTreeMap<String, Vec<ProvisionedNode>>>,
    downs: RwLock<Vec<String>>,
}

impl Default for InMemoryProvisioner {
    fn default() -> Self {
        Self::new("memory")
    }
}

impl InMemoryProvisioner {
    /// Creates a provisioner that creates exactly what is requested.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            short_by: 0,
            failure: None,
            pending_polls: AtomicU32::new(0),
            environments: RwLock::new(BTreeMap::new()),
            downs: RwLock::new(Vec::new()),
        }
    }

    /// Creates `count` fewer machines than requested.
    #[must_use]
    pub const fn short_by(mut self, count: usize) -> Self {
        self.short_by = count;
        self
    }

    /// Fails every `up` with `message`.
    #[must_use]
    pub fn failing(mut self, message: impl Into<String>) -> Self {
        self.failure = Some(message.into());
        self
    }

    /// Reports the environment as not ready for `polls` polls before
    /// answering.
    #[must_use]
    pub fn pending_for(self, polls: u32) -> Self {
        self.pending_polls.store(polls, Ordering::SeqCst);
        self
    }

    /// Returns the machines created for an environment.
    #[must_use]
    pub fn nodes(&self, environment: &str) -> Vec<ProvisionedNode> {
        self.environments
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(environment)
            .cloned()
            .unwrap_or_default()
    }

    /// Returns the environments `down` was called for, in call order.
    #[must_use]
    pub fn downs(&self) -> Vec<String> {
        self.downs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn wait_until_ready(&self, job: &Job, environment: &str, interval: Duration) {
        while self
            .pending_polls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            job.set_status(format!("Waiting for {environment} to be created"));
            tokio::time::sleep(interval).await;
        }
    }
}

#[async_trait]
impl Provisioner for InMemoryProvisioner {
    fn id(&self) -> &str {
        &self.id
    }

    async fn up(
        &self,
        job: &Job,
        environment: &str,
        manifest: &ProvisionManifest,
        _plugin: &Plugin,
        options: &ProvisionOptions,
    ) -> Result<Vec<ProvisionedNode>> {
        tracing::debug!(provisioner = %self.id, environment, "Creating environment");
        if let Some(message) = &self.failure {
            return Err(Error::Provision {
                message: message.clone(),
            });
        }

        let interval = options.poll_interval.unwrap_or(Duration::ZERO);
        self.wait_until_ready(job, environment, interval).await;

        let mut created = Vec::with_capacity(manifest.node_count());
        for entry in &manifest.nodes {
            for _ in 0..entry.count {
                let hostname = format!(
                    "{environment}-{}.{}.local",
                    created.len() + 1,
                    entry.instance_type
                );
                created.push(ProvisionedNode::new(&entry.instance_type, hostname));
            }
        }
        created.truncate(created.len().saturating_sub(self.short_by));

        self.environments
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(environment.to_string(), created.clone());
        Ok(created)
    }

    async fn down(&self, _job: &Job, environment: &str) -> Result<bool> {
        tracing::debug!(provisioner = %self.id, environment, "Destroying environment");
        self.downs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(environment.to_string());
        Ok(self
            .environments
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(environment)
            .is_some())
    }
}
