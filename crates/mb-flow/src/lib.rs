//! # mb-flow
//!
//! Bootstrap and upgrade orchestration for clusters described by plugins.
//!
//! This crate turns a plugin's declarative bootstrap routine into an ordered
//! queue of stages and executes it against a fleet of hosts:
//!
//! - **Routine compilation**: Sequential stages and parallel blocks become a
//!   FIFO stage queue with unique task ids
//! - **Staged execution**: Every task of a stage runs concurrently; the next
//!   stage starts only once all of them finished
//! - **Environment locking**: Operations on one environment are serialized,
//!   with forced takeover for stuck runs
//! - **Jobs and tickets**: Every run reports progress and its outcome through
//!   a job that callers poll or await
//!
//! ## Core Concepts
//!
//! - **Plugin**: Components made of node groups, addressed as
//!   `component::group`
//! - **Routine**: The compiled stage queue of a plugin's bootstrap
//! - **Manifest**: Binds group ids to the hosts that should join them
//! - **Job**: The tracked record of one bootstrap, upgrade, provision or
//!   destroy run
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use mb_flow::prelude::*;
//! use mb_flow::remote::memory::{InMemoryChefServer, ScriptedExecutor};
//!
//! # async fn run() -> Result<()> {
//! let plugin = Plugin::new("app", "1.0.0").with_component(
//!     Component::new("app")
//!         .with_group(Group::new("master"))
//!         .with_group(Group::new("slave")),
//! );
//! let routine = RoutineBuilder::new(&plugin)
//!     .bootstrap("app::master")
//!     .parallel(|p| p.bootstrap("app::slave"))
//!     .build()?;
//! let manifest = Manifest::new()
//!     .with_group("app::master", ["h1"])
//!     .with_group("app::slave", ["h2", "h3"]);
//!
//! let ctx = FlowContext::new(
//!     FlowConfig::from_env()?,
//!     Arc::new(InMemoryChefServer::default().with_environment("prod")),
//!     Arc::new(ScriptedExecutor::new()),
//! );
//! let ticket = BootstrapManager::new(ctx).bootstrap(
//!     "prod",
//!     manifest,
//!     routine,
//!     BootstrapOptions::default(),
//! );
//! let record = ticket.wait().await;
//! println!("{}: {}", record.state, record.status);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod context;
pub mod error;
pub mod job;
pub mod lock;
pub mod manager;
pub mod manifest;
pub mod metrics;
pub mod plugin;
pub mod provisioner;
pub mod remote;
pub mod routine;
pub mod upgrade;
pub mod worker;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::{BootstrapOptions, FlowConfig, HostFailurePolicy, SshOptions};
    pub use crate::context::FlowContext;
    pub use crate::error::{Error, Result};
    pub use crate::job::{Job, JobRecord, JobRegistry, JobState, JobTicket, JobType};
    pub use crate::lock::{LockCoordinator, LockGuard, LockOptions, LockPolicy};
    pub use crate::manager::{BootstrapManager, BootstrapReport};
    pub use crate::manifest::Manifest;
    pub use crate::plugin::{Component, Group, GroupId, Plugin};
    pub use crate::provisioner::manager::ProvisionerManager;
    pub use crate::provisioner::{
        ProvisionManifest, ProvisionOptions, Provisioner, ProvisionerRegistry,
    };
    pub use crate::remote::{ChefServer, RemoteExecutor};
    pub use crate::routine::{Routine, RoutineBuilder, Stage};
    pub use crate::upgrade::{UpgradeOptions, Upgrader};
    pub use crate::worker::{BootstrapWorker, Worker};
}

pub use context::FlowContext;
pub use error::{Error, Result};
pub use manager::BootstrapManager;
