//! Node provisioning behind a pluggable adapter.
//!
//! A [`Provisioner`] creates the machines of an environment from a
//! [`ProvisionManifest`] and tears them down again. Adapters are registered
//! by id in a [`ProvisionerRegistry`]; one of them is the default.
//!
//! - **Testing**: Use [`memory::InMemoryProvisioner`]
//! - **Production**: Wrap an infrastructure provider's API
//!
//! [`manager::ProvisionerManager`] drives an adapter under the same job and
//! ticket contract as a bootstrap, and bootstraps the created nodes.

pub mod manager;
pub mod memory;

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::BootstrapOptions;
use crate::error::{Error, Result};
use crate::job::Job;
use crate::plugin::Plugin;

/// One line of a provision manifest: `count` machines of one instance type
/// serving the listed group ids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionEntry {
    /// Instance type to create.
    #[serde(rename = "type")]
    pub instance_type: String,
    /// Number of machines.
    pub count: usize,
    /// Group ids the machines are bootstrapped into.
    #[serde(rename = "components", default)]
    pub groups: Vec<String>,
}

impl ProvisionEntry {
    /// Creates an entry.
    #[must_use]
    pub fn new<I, S>(instance_type: impl Into<String>, count: usize, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            instance_type: instance_type.into(),
            count,
            groups: groups.into_iter().map(Into::into).collect(),
        }
    }
}

/// Describes the machines an environment should have.
///
/// ```json
/// { "nodes": [ { "type": "m1.large", "count": 2, "components": ["app::web"] } ] }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionManifest {
    /// Requested machines.
    #[serde(default)]
    pub nodes: Vec<ProvisionEntry>,
}

impl ProvisionManifest {
    /// Creates an empty manifest.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an entry.
    #[must_use]
    pub fn with_entry(mut self, entry: ProvisionEntry) -> Self {
        self.nodes.push(entry);
        self
    }

    /// Parses a manifest from JSON.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Serialization`] for malformed JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Returns the total number of machines requested.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.iter().map(|e| e.count).sum()
    }

    /// Returns the requested machine count per instance type.
    #[must_use]
    pub fn counts_by_type(&self) -> BTreeMap<&str, usize> {
        let mut counts = BTreeMap::new();
        for entry in &self.nodes {
            *counts.entry(entry.instance_type.as_str()).or_insert(0) += entry.count;
        }
        counts
    }
}

/// A machine reported by a provisioner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionedNode {
    /// Instance type the machine was created as.
    pub instance_type: String,
    /// Address the machine is reachable at.
    pub public_hostname: String,
}

impl ProvisionedNode {
    /// Creates a node record.
    #[must_use]
    pub fn new(instance_type: impl Into<String>, public_hostname: impl Into<String>) -> Self {
        Self {
            instance_type: instance_type.into(),
            public_hostname: public_hostname.into(),
        }
    }
}

/// Options for one provision run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisionOptions {
    /// Provisioner id; the registry default when absent.
    pub provisioner: Option<String>,
    /// Create the machines without bootstrapping them.
    pub skip_bootstrap: bool,
    /// Options for the bootstrap of the created machines.
    pub bootstrap: BootstrapOptions,
    /// Pre-empt any current holder of the environment lock.
    pub force: bool,
    /// How often a polling provisioner checks for readiness.
    #[serde(skip)]
    pub poll_interval: Option<Duration>,
}

/// Checks that a provisioner created exactly the requested number of
/// machines.
///
/// # Errors
///
/// Returns [`Error::UnexpectedProvisionCount`] on a mismatch.
pub fn validate_create(created: &[ProvisionedNode], manifest: &ProvisionManifest) -> Result<()> {
    let expected = manifest.node_count();
    if created.len() != expected {
        return Err(Error::UnexpectedProvisionCount {
            expected,
            actual: created.len(),
        });
    }
    Ok(())
}

/// Creates and destroys the machines of an environment.
///
/// Implementations may update the job's status line but must not finish the
/// job; the caller owns its terminal state.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Returns the id the provisioner is registered under.
    fn id(&self) -> &str;

    /// Creates the machines described by `manifest`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Provision`] if the provider fails.
    async fn up(
        &self,
        job: &Job,
        environment: &str,
        manifest: &ProvisionManifest,
        plugin: &Plugin,
        options: &ProvisionOptions,
    ) -> Result<Vec<ProvisionedNode>>;

    /// Destroys every machine of an environment.
    ///
    /// Returns false if there was nothing to destroy.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Provision`] if the provider fails.
    async fn down(&self, job: &Job, environment: &str) -> Result<bool>;
}

/// Provisioners by id.
#[derive(Clone, Default)]
pub struct ProvisionerRegistry {
    inner: Arc<RwLock<Registered>>,
}

#[derive(Default)]
struct Registered {
    provisioners: BTreeMap<String, Arc<dyn Provisioner>>,
    default_id: Option<String>,
}

impl ProvisionerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a provisioner, replacing any with the same id.
    ///
    /// The first provisioner registered becomes the default unless a later
    /// one is registered with `default` set.
    pub fn register(&self, provisioner: Arc<dyn Provisioner>, default: bool) {
        let id = provisioner.id().to_string();
        let mut registered = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if default || registered.default_id.is_none() {
            registered.default_id = Some(id.clone());
        }
        tracing::debug!(provisioner = %id, default, "Registered provisioner");
        registered.provisioners.insert(id, provisioner);
    }

    /// Returns the provisioner registered under `id`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ProvisionerNotFound`] if none is.
    pub fn get(&self, id: &str) -> Result<Arc<dyn Provisioner>> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .provisioners
            .get(id)
            .cloned()
            .ok_or_else(|| Error::ProvisionerNotFound { id: id.to_string() })
    }

    /// Returns the default provisioner.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ProvisionerNotFound`] if the registry is empty.
    pub fn default_provisioner(&self) -> Result<Arc<dyn Provisioner>> {
        let default_id = self
            .inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .default_id
            .clone();
        match default_id {
            Some(id) => self.get(&id),
            None => Err(Error::ProvisionerNotFound {
                id: "<default>".to_string(),
            }),
        }
    }

    /// Resolves an optional id, falling back to the default.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ProvisionerNotFound`] if nothing matches.
    pub fn resolve(&self, id: Option<&str>) -> Result<Arc<dyn Provisioner>> {
        id.map_or_else(|| self.default_provisioner(), |id| self.get(id))
    }

    /// Returns the registered ids.
    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .provisioners
            .keys()
            .cloned()
            .collect()
    }
}

impl std::fmt::Debug for ProvisionerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProvisionerRegistry")
            .field("ids", &self.ids())
            .finish()
    }
}
