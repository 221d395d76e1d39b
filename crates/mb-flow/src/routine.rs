//! Bootstrap routines: compiled, ordered stage queues.
//!
//! A routine is compiled from a [`RoutineDescription`], an ordered list of
//! stage descriptors produced by whatever loader sits in front of the engine.
//! Compilation resolves every referenced group id against the plugin and
//! produces a FIFO queue of [`Stage`]s:
//!
//! - a **single** task is a sequential boundary: it fully completes before
//!   the next stage starts
//! - a **parallel** group runs all of its tasks concurrently and completes
//!   when every member has finished
//!
//! Parallel groups never nest. Compilation is pure: identical descriptions
//! always produce identical routines (and identical fingerprints).
//!
//! ## Example
//!
//! ```rust
//! use mb_flow::plugin::{Component, Group, Plugin};
//! use mb_flow::routine::RoutineBuilder;
//!
//! # fn main() -> mb_flow::error::Result<()> {
//! let plugin = Plugin::new("app", "1.0.0").with_component(
//!     Component::new("app")
//!         .with_group(Group::new("master"))
//!         .with_group(Group::new("slave")),
//! );
//!
//! let routine = RoutineBuilder::new(&plugin)
//!     .bootstrap("app::master")
//!     .parallel(|p| p.bootstrap("app::slave"))
//!     .build()?;
//!
//! assert_eq!(routine.len(), 2);
//! assert!(routine.has_task("app::slave"));
//! # Ok(())
//! # }
//! ```

use std::collections::{HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::plugin::{Group, GroupId, Plugin};

/// Version of the routine fingerprint preimage format.
const ROUTINE_FINGERPRINT_VERSION: u32 = 1;

/// One unit of bootstrap work: a node group and its definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootTask {
    /// Group id (`component::group`), unique within a routine.
    pub id: String,
    /// The group definition the task was compiled from.
    pub group: Group,
}

impl BootTask {
    /// Returns the run list nodes of this group receive.
    #[must_use]
    pub fn run_list(&self) -> &[String] {
        &self.group.run_list
    }
}

/// One element of a routine's stage queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "tasks", rename_all = "snake_case")]
pub enum Stage {
    /// A single task; a sequential boundary.
    Single(BootTask),
    /// Tasks that run concurrently.
    Parallel(Vec<BootTask>),
}

impl Stage {
    /// Returns the tasks in this stage.
    #[must_use]
    pub fn tasks(&self) -> &[BootTask] {
        match self {
            Self::Single(task) => std::slice::from_ref(task),
            Self::Parallel(tasks) => tasks,
        }
    }

    /// Returns the task ids in this stage, in declaration order.
    #[must_use]
    pub fn ids(&self) -> Vec<&str> {
        self.tasks().iter().map(|t| t.id.as_str()).collect()
    }

    /// Returns true for parallel groups.
    #[must_use]
    pub const fn is_parallel(&self) -> bool {
        matches!(self, Self::Parallel(_))
    }
}

/// Declarative description of one stage, before compilation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageDescriptor {
    /// Bootstrap one group on its own.
    Bootstrap(String),
    /// Bootstrap these groups concurrently.
    Parallel(Vec<String>),
}

/// Declarative description of a routine, as produced by a plugin loader.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutineDescription {
    /// Stages in execution order.
    pub stages: Vec<StageDescriptor>,
}

/// A compiled, immutable bootstrap routine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Routine {
    stages: Vec<Stage>,
    fingerprint: String,
}

impl Routine {
    /// Compiles a description against a plugin.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RoutineSyntax`] if a directive references an unknown
    /// component or group, a group id appears twice, or a parallel block is
    /// empty.
    pub fn compile(plugin: &Plugin, description: &RoutineDescription) -> Result<Self> {
        let mut seen = HashSet::new();
        let mut stages = Vec::with_capacity(description.stages.len());

        for (index, descriptor) in description.stages.iter().enumerate() {
            let stage = match descriptor {
                StageDescriptor::Bootstrap(id) => {
                    Stage::Single(resolve_task(plugin, id, &mut seen)?)
                }
                StageDescriptor::Parallel(ids) => {
                    if ids.is_empty() {
                        return Err(Error::routine_syntax(format!(
                            "parallel block at stage {index} has no bootstrap directives"
                        )));
                    }
                    let tasks = ids
                        .iter()
                        .map(|id| resolve_task(plugin, id, &mut seen))
                        .collect::<Result<Vec<_>>>()?;
                    Stage::Parallel(tasks)
                }
            };
            stages.push(stage);
        }

        let fingerprint = compute_fingerprint(&stages)?;
        Ok(Self {
            stages,
            fingerprint,
        })
    }

    /// Returns the stages in execution order.
    #[must_use]
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Returns a fresh copy of the stage queue for one run to drain.
    #[must_use]
    pub fn task_queue(&self) -> VecDeque<Stage> {
        self.stages.iter().cloned().collect()
    }

    /// Returns the number of stages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Returns true if the routine has no stages.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Iterates every task, top-level and nested, in queue order.
    pub fn tasks(&self) -> impl Iterator<Item = &BootTask> {
        self.stages.iter().flat_map(Stage::tasks)
    }

    /// Returns the task with the given id.
    #[must_use]
    pub fn task(&self, id: &str) -> Option<&BootTask> {
        self.tasks().find(|t| t.id == id)
    }

    /// Returns true if any stage contains a task with the given id.
    #[must_use]
    pub fn has_task(&self, id: &str) -> bool {
        self.task(id).is_some()
    }

    /// Returns the SHA-256 fingerprint of the stage layout.
    #[must_use]
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

/// Resolves one directive to a task, enforcing unique ids.
fn resolve_task(plugin: &Plugin, id: &str, seen: &mut HashSet<String>) -> Result<BootTask> {
    let group_id: GroupId = id
        .parse()
        .map_err(|e: mb_core::Error| Error::routine_syntax(e.to_string()))?;

    let component = plugin.component(&group_id.component).ok_or_else(|| {
        Error::routine_syntax(format!(
            "component '{}' not found on plugin '{plugin}'",
            group_id.component
        ))
    })?;
    let group = component.group(&group_id.group).ok_or_else(|| {
        Error::routine_syntax(format!(
            "group '{}' not found on component '{}'",
            group_id.group, group_id.component
        ))
    })?;

    if !seen.insert(id.to_string()) {
        return Err(Error::routine_syntax(format!(
            "group '{id}' is bootstrapped more than once"
        )));
    }

    Ok(BootTask {
        id: id.to_string(),
        group: group.clone(),
    })
}

/// Normalized routine layout for fingerprinting.
#[derive(Serialize)]
struct FingerprintSpec<'a> {
    version: u32,
    stages: Vec<Vec<&'a str>>,
}

fn compute_fingerprint(stages: &[Stage]) -> Result<String> {
    let spec = FingerprintSpec {
        version: ROUTINE_FINGERPRINT_VERSION,
        stages: stages.iter().map(Stage::ids).collect(),
    };
    let preimage = serde_json::to_vec(&spec).map_err(|e| Error::Serialization {
        message: format!("failed to serialize routine fingerprint preimage: {e}"),
    })?;

    let mut hasher = Sha256::new();
    hasher.update(&preimage);
    Ok(format!("sha256:{}", hex::encode(hasher.finalize())))
}

/// Typed builder standing in for the routine DSL.
///
/// Parallel blocks are built with a [`ParallelBuilder`], which has no way to
/// open another parallel block, so nesting depth is fixed at one.
pub struct RoutineBuilder<'a> {
    plugin: &'a Plugin,
    description: RoutineDescription,
}

impl<'a> RoutineBuilder<'a> {
    /// Starts an empty routine for the plugin.
    #[must_use]
    pub fn new(plugin: &'a Plugin) -> Self {
        Self {
            plugin,
            description: RoutineDescription::default(),
        }
    }

    /// Appends a sequential bootstrap of one group.
    #[must_use]
    pub fn bootstrap(mut self, group_id: impl Into<String>) -> Self {
        self.description
            .stages
            .push(StageDescriptor::Bootstrap(group_id.into()));
        self
    }

    /// Appends a parallel block.
    #[must_use]
    pub fn parallel(mut self, block: impl FnOnce(ParallelBuilder) -> ParallelBuilder) -> Self {
        let built = block(ParallelBuilder::default());
        self.description
            .stages
            .push(StageDescriptor::Parallel(built.ids));
        self
    }

    /// Returns the description built so far.
    #[must_use]
    pub fn description(&self) -> &RoutineDescription {
        &self.description
    }

    /// Compiles the routine.
    ///
    /// # Errors
    ///
    /// See [`Routine::compile`].
    pub fn build(self) -> Result<Routine> {
        Routine::compile(self.plugin, &self.description)
    }
}

/// Builder for the members of one parallel block.
#[derive(Debug, Default)]
pub struct ParallelBuilder {
    ids: Vec<String>,
}

impl ParallelBuilder {
    /// Adds a group to run concurrently with the rest of the block.
    #[must_use]
    pub fn bootstrap(mut self, group_id: impl Into<String>) -> Self {
        self.ids.push(group_id.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::Component;

    fn plugin() -> Plugin {
        Plugin::new("motherbrain", "0.1.0")
            .with_component(
                Component::new("activemq")
                    .with_group(Group::new("master"))
                    .with_group(Group::new("slave")),
            )
            .with_component(
                Component::new("mysql")
                    .with_group(Group::new("master"))
                    .with_group(Group::new("slave")),
            )
            .with_component(Component::new("nginx").with_group(Group::new("master")))
    }

    fn mixed(plugin: &Plugin) -> Routine {
        RoutineBuilder::new(plugin)
            .parallel(|p| p.bootstrap("activemq::master").bootstrap("activemq::slave"))
            .parallel(|p| p.bootstrap("mysql::master").bootstrap("mysql::slave"))
            .bootstrap("nginx::master")
            .build()
            .unwrap()
    }

    #[test]
    fn one_stage_per_directive_in_fifo_order() {
        let plugin = plugin();
        let routine = mixed(&plugin);

        assert_eq!(routine.len(), 3);
        let stages = routine.stages();
        assert!(stages[0].is_parallel());
        assert_eq!(stages[0].ids(), vec!["activemq::master", "activemq::slave"]);
        assert!(stages[1].is_parallel());
        assert_eq!(stages[1].ids(), vec!["mysql::master", "mysql::slave"]);
        assert!(!stages[2].is_parallel());
        assert_eq!(stages[2].ids(), vec!["nginx::master"]);
    }

    #[test]
    fn tasks_carry_their_group_definition() {
        let plugin = plugin();
        let routine = mixed(&plugin);
        let task = routine.task("activemq::slave").unwrap();
        assert_eq!(task.group.name, "slave");
    }

    #[test]
    fn sequential_directives_are_single_stages() {
        let plugin = plugin();
        let routine = RoutineBuilder::new(&plugin)
            .bootstrap("activemq::master")
            .bootstrap("activemq::slave")
            .build()
            .unwrap();

        assert_eq!(routine.len(), 2);
        assert!(routine.stages().iter().all(|s| !s.is_parallel()));
    }

    #[test]
    fn has_task_sees_nested_and_top_level() {
        let plugin = plugin();
        let routine = RoutineBuilder::new(&plugin)
            .parallel(|p| p.bootstrap("activemq::master").bootstrap("activemq::slave"))
            .bootstrap("nginx::master")
            .build()
            .unwrap();

        assert!(routine.has_task("activemq::master"));
        assert!(routine.has_task("activemq::slave"));
        assert!(routine.has_task("nginx::master"));
        assert!(!routine.has_task("not::defined"));
        assert!(!routine.has_task("mysql::master"));
    }

    #[test]
    fn unknown_component_is_a_syntax_error() {
        let plugin = plugin();
        let err = RoutineBuilder::new(&plugin)
            .bootstrap("redis::master")
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::RoutineSyntax { .. }));
        assert!(err.to_string().contains("redis"));
    }

    #[test]
    fn unknown_group_is_a_syntax_error() {
        let plugin = plugin();
        let err = RoutineBuilder::new(&plugin)
            .parallel(|p| p.bootstrap("nginx::slave"))
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::RoutineSyntax { .. }));
    }

    #[test]
    fn malformed_group_id_is_a_syntax_error() {
        let plugin = plugin();
        let err = RoutineBuilder::new(&plugin).bootstrap("nginx").build().unwrap_err();
        assert!(matches!(err, Error::RoutineSyntax { .. }));
    }

    #[test]
    fn duplicate_group_is_rejected() {
        let plugin = plugin();
        let err = RoutineBuilder::new(&plugin)
            .bootstrap("nginx::master")
            .parallel(|p| p.bootstrap("nginx::master"))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn empty_parallel_block_is_rejected() {
        let plugin = plugin();
        let err = RoutineBuilder::new(&plugin).parallel(|p| p).build().unwrap_err();
        assert!(matches!(err, Error::RoutineSyntax { .. }));
    }

    #[test]
    fn compilation_is_deterministic() {
        let plugin = plugin();
        let first = mixed(&plugin);
        let second = mixed(&plugin);
        assert_eq!(first, second);
        assert_eq!(first.fingerprint(), second.fingerprint());
        assert!(first.fingerprint().starts_with("sha256:"));
    }

    #[test]
    fn fingerprint_tracks_stage_layout() {
        let plugin = plugin();
        let sequential = RoutineBuilder::new(&plugin)
            .bootstrap("activemq::master")
            .bootstrap("activemq::slave")
            .build()
            .unwrap();
        let parallel = RoutineBuilder::new(&plugin)
            .parallel(|p| p.bootstrap("activemq::master").bootstrap("activemq::slave"))
            .build()
            .unwrap();
        assert_ne!(sequential.fingerprint(), parallel.fingerprint());
    }

    #[test]
    fn task_queue_is_an_independent_copy() {
        let plugin = plugin();
        let routine = mixed(&plugin);
        let mut queue = routine.task_queue();
        queue.pop_front();
        assert_eq!(queue.len(), 2);
        assert_eq!(routine.len(), 3);
    }

    #[test]
    fn description_roundtrips_through_json() {
        let description = RoutineDescription {
            stages: vec![
                StageDescriptor::Bootstrap("nginx::master".into()),
                StageDescriptor::Parallel(vec!["mysql::master".into()]),
            ],
        };
        let json = serde_json::to_string(&description).unwrap();
        let parsed: RoutineDescription = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, description);
        assert_eq!(Routine::compile(&plugin(), &parsed).unwrap().len(), 2);
    }
}
