//! Interfaces to the remote systems an orchestration run drives.
//!
//! Two collaborators sit behind traits so the engine never depends on a
//! concrete transport:
//!
//! - [`ChefServer`]: the configuration-management server holding environments
//!   and node records
//! - [`RemoteExecutor`]: runs one command on one host
//!
//! [`memory`] provides in-memory implementations for tests and local runs.

pub mod memory;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use mb_core::Redacted;

use crate::error::Result;

/// An environment on the configuration server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentObject {
    /// Environment name.
    pub name: String,
    /// Free-form description.
    #[serde(default)]
    pub description: String,
    /// Cookbook version constraints pinned in this environment.
    #[serde(default)]
    pub cookbook_versions: BTreeMap<String, String>,
    /// Default attributes.
    #[serde(default)]
    pub default_attributes: Map<String, Value>,
    /// Override attributes.
    #[serde(default)]
    pub override_attributes: Map<String, Value>,
}

impl EnvironmentObject {
    /// Creates an empty environment.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Sets an override attribute at a dotted path, creating intermediate
    /// objects and replacing non-object values along the way.
    pub fn set_override_attribute(&mut self, path: &str, value: Value) {
        let mut segments = path.split('.').peekable();
        let mut current = &mut self.override_attributes;
        while let Some(segment) = segments.next() {
            if segments.peek().is_none() {
                current.insert(segment.to_string(), value);
                return;
            }
            let slot = current
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !slot.is_object() {
                *slot = Value::Object(Map::new());
            }
            let Value::Object(next) = slot else {
                return;
            };
            current = next;
        }
    }

    /// Reads an override attribute at a dotted path.
    #[must_use]
    pub fn override_attribute(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.');
        let first = segments.next()?;
        segments.try_fold(self.override_attributes.get(first)?, |value, segment| {
            value.as_object()?.get(segment)
        })
    }
}

/// A node registered on the configuration server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeObject {
    /// Node name.
    pub name: String,
    /// Address to reach the node at.
    pub public_hostname: String,
    /// Expanded run list of the node.
    #[serde(default)]
    pub run_list: Vec<String>,
}

impl NodeObject {
    /// Creates a node record.
    #[must_use]
    pub fn new(name: impl Into<String>, public_hostname: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            public_hostname: public_hostname.into(),
            run_list: Vec::new(),
        }
    }

    /// Appends a run list entry.
    #[must_use]
    pub fn with_recipe(mut self, entry: impl Into<String>) -> Self {
        self.run_list.push(entry.into());
        self
    }
}

/// Client for the configuration-management server.
///
/// Connectivity failures surface as [`crate::error::Error::RemoteConnection`].
#[async_trait]
pub trait ChefServer: Send + Sync {
    /// Returns the server URL, for error messages.
    fn server_url(&self) -> &str;

    /// Fetches an environment by name.
    async fn find_environment(&self, name: &str) -> Result<Option<EnvironmentObject>>;

    /// Returns true if the environment exists.
    async fn environment_exists(&self, name: &str) -> Result<bool> {
        Ok(self.find_environment(name).await?.is_some())
    }

    /// Creates or replaces an environment.
    async fn save_environment(&self, environment: &EnvironmentObject) -> Result<()>;

    /// Deletes an environment. Returns false if it did not exist.
    async fn delete_environment(&self, name: &str) -> Result<bool>;

    /// Lists the nodes registered in an environment.
    async fn find_nodes(&self, environment: &str) -> Result<Vec<NodeObject>>;
}

/// Credentials for remote command execution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshCredentials {
    /// Login user.
    pub user: String,
    /// Login password.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<Redacted<String>>,
    /// Private key paths.
    #[serde(default)]
    pub keys: Vec<String>,
    /// Whether the command is wrapped in `sudo`.
    #[serde(default)]
    pub sudo: bool,
}

/// Output of one remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandOutput {
    /// Process exit code.
    pub exit_code: i32,
    /// Captured standard output.
    #[serde(default)]
    pub stdout: String,
    /// Captured standard error.
    #[serde(default)]
    pub stderr: String,
}

impl CommandOutput {
    /// Returns true for a zero exit code.
    #[must_use]
    pub const fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs commands on remote hosts.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Executes `command` on `host`.
    ///
    /// `timeout` bounds the remote command; callers also enforce it locally.
    /// Transport failures are reported as
    /// [`crate::error::Error::RemoteAction`].
    async fn execute(
        &self,
        host: &str,
        command: &str,
        credentials: &SshCredentials,
        timeout: Duration,
    ) -> Result<CommandOutput>;
}
