//! In-memory remote collaborators for testing.
//!
//! - [`InMemoryChefServer`] keeps environments and nodes in process memory.
//! - [`ScriptedExecutor`] answers remote commands from per-host scripts and
//!   records every invocation.
//!
//! ## Limitations
//!
//! - **NOT suitable for production**: nothing leaves the process
//! - **No persistence**: all state is lost when the process exits

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;

use super::{ChefServer, CommandOutput, EnvironmentObject, NodeObject, RemoteExecutor, SshCredentials};
use crate::error::{Error, Result};

/// Converts a lock poison error to an internal error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::internal("lock poisoned")
}

/// In-memory configuration server.
///
/// ## Example
///
/// ```rust
/// use mb_flow::remote::memory::InMemoryChefServer;
///
/// let chef = InMemoryChefServer::new("https://chef.example.com")
///     .with_environment("production");
/// ```
#[derive(Debug)]
pub struct InMemoryChefServer {
    url: String,
    environments: RwLock<BTreeMap<String, EnvironmentObject>>,
    nodes: RwLock<BTreeMap<String, Vec<NodeObject>>>,
    unreachable: AtomicBool,
    saves: AtomicUsize,
}

impl Default for InMemoryChefServer {
    fn default() -> Self {
        Self::new("https://chef.local")
    }
}

impl InMemoryChefServer {
    /// Creates an empty server.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            environments: RwLock::new(BTreeMap::new()),
            nodes: RwLock::new(BTreeMap::new()),
            unreachable: AtomicBool::new(false),
            saves: AtomicUsize::new(0),
        }
    }

    /// Adds an empty environment.
    #[must_use]
    pub fn with_environment(self, name: &str) -> Self {
        self.insert_environment(EnvironmentObject::new(name));
        self
    }

    /// Adds or replaces an environment without counting it as a save.
    pub fn insert_environment(&self, environment: EnvironmentObject) {
        self.environments
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(environment.name.clone(), environment);
    }

    /// Registers a node in an environment.
    pub fn add_node(&self, environment: &str, node: NodeObject) {
        self.nodes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(environment.to_string())
            .or_default()
            .push(node);
    }

    /// Makes every call fail with a connection error.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Returns the number of `save_environment` calls served.
    #[must_use]
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// Returns a copy of a stored environment.
    #[must_use]
    pub fn environment(&self, name: &str) -> Option<EnvironmentObject> {
        self.environments
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    fn check_reachable(&self) -> Result<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(Error::RemoteConnection {
                message: format!("{} is unreachable", self.url),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ChefServer for InMemoryChefServer {
    fn server_url(&self) -> &str {
        &self.url
    }

    async fn find_environment(&self, name: &str) -> Result<Option<EnvironmentObject>> {
        self.check_reachable()?;
        let environments = self.environments.read().map_err(poison_err)?;
        Ok(environments.get(name).cloned())
    }

    async fn save_environment(&self, environment: &EnvironmentObject) -> Result<()> {
        self.check_reachable()?;
        let mut environments = self.environments.write().map_err(poison_err)?;
        environments.insert(environment.name.clone(), environment.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete_environment(&self, name: &str) -> Result<bool> {
        self.check_reachable()?;
        let mut environments = self.environments.write().map_err(poison_err)?;
        self.nodes.write().map_err(poison_err)?.remove(name);
        Ok(environments.remove(name).is_some())
    }

    async fn find_nodes(&self, environment: &str) -> Result<Vec<NodeObject>> {
        self.check_reachable()?;
        let nodes = self.nodes.read().map_err(poison_err)?;
        Ok(nodes.get(environment).cloned().unwrap_or_default())
    }
}

/// What a scripted host does when a command reaches it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostScript {
    /// Exit with this code.
    Exit(i32),
    /// Fail at the transport level.
    Fail(String),
}

impl Default for HostScript {
    fn default() -> Self {
        Self::Exit(0)
    }
}

/// One recorded command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    /// Target host.
    pub host: String,
    /// Command text.
    pub command: String,
    /// Login user.
    pub user: String,
    /// Timeout passed by the caller.
    pub timeout: Duration,
}

/// Whether an [`ExecEvent`] marks the start or end of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecPhase {
    /// The command reached the host.
    Started,
    /// The command returned, successfully or not.
    Finished,
}

/// A timestamped start or finish of a command, ordered by `seq`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecEvent {
    /// Global sequence number.
    pub seq: u64,
    /// Target host.
    pub host: String,
    /// Start or finish.
    pub phase: ExecPhase,
}

/// Remote executor answering from per-host scripts.
///
/// Hosts without a script exit 0 immediately.
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    scripts: RwLock<HashMap<String, HostScript>>,
    delays: RwLock<HashMap<String, Duration>>,
    invocations: Mutex<Vec<Invocation>>,
    events: Mutex<Vec<ExecEvent>>,
    seq: AtomicU64,
}

impl ScriptedExecutor {
    /// Creates an executor where every host succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `host` fail at the transport level.
    #[must_use]
    pub fn failing(self, host: &str, message: &str) -> Self {
        self.script(host, HostScript::Fail(message.to_string()));
        self
    }

    /// Makes `host` exit with `code`.
    #[must_use]
    pub fn exiting(self, host: &str, code: i32) -> Self {
        self.script(host, HostScript::Exit(code));
        self
    }

    /// Makes commands on `host` take `delay` before answering.
    #[must_use]
    pub fn delayed(self, host: &str, delay: Duration) -> Self {
        self.delays
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(host.to_string(), delay);
        self
    }

    /// Sets the script for `host`.
    pub fn script(&self, host: &str, script: HostScript) {
        self.scripts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(host.to_string(), script);
    }

    /// Returns every command executed so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<Invocation> {
        self.invocations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Returns the number of commands executed so far.
    #[must_use]
    pub fn invocation_count(&self) -> usize {
        self.invocations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Returns the hosts commands were sent to, in arrival order.
    #[must_use]
    pub fn hosts(&self) -> Vec<String> {
        self.invocations().into_iter().map(|i| i.host).collect()
    }

    /// Returns start/finish events in sequence order.
    #[must_use]
    pub fn events(&self) -> Vec<ExecEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Returns the sequence number of a host's event, if recorded.
    #[must_use]
    pub fn event_seq(&self, host: &str, phase: ExecPhase) -> Option<u64> {
        self.events()
            .into_iter()
            .find(|e| e.host == host && e.phase == phase)
            .map(|e| e.seq)
    }

    fn record(&self, host: &str, phase: ExecPhase) {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(ExecEvent {
                seq,
                host: host.to_string(),
                phase,
            });
    }
}

#[async_trait]
impl RemoteExecutor for ScriptedExecutor {
    async fn execute(
        &self,
        host: &str,
        command: &str,
        credentials: &SshCredentials,
        timeout: Duration,
    ) -> Result<CommandOutput> {
        self.invocations.lock().map_err(poison_err)?.push(Invocation {
            host: host.to_string(),
            command: command.to_string(),
            user: credentials.user.clone(),
            timeout,
        });
        self.record(host, ExecPhase::Started);

        let delay = self.delays.read().map_err(poison_err)?.get(host).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let script = self
            .scripts
            .read()
            .map_err(poison_err)?
            .get(host)
            .cloned()
            .unwrap_or_default();
        self.record(host, ExecPhase::Finished);

        match script {
            HostScript::Exit(exit_code) => Ok(CommandOutput {
                exit_code,
                stdout: format!("ran on {host}"),
                stderr: String::new(),
            }),
            HostScript::Fail(message) => Err(Error::RemoteAction {
                host: host.to_string(),
                message,
            }),
        }
    }
}
