//! Read-only plugin model.
//!
//! A plugin describes a cluster as components, each with named node groups.
//! The model is produced by an external loader; the orchestration engine only
//! ever reads it. Node groups are addressed by a group id of the form
//! `component::group`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::routine::{Routine, RoutineDescription};

/// Separator between the component and group halves of a group id.
const GROUP_ID_SEPARATOR: &str = "::";

/// A parsed `component::group` identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupId {
    /// Component name.
    pub component: String,
    /// Group name within the component.
    pub group: String,
}

impl GroupId {
    /// Creates a group id from its parts.
    #[must_use]
    pub fn new(component: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            group: group.into(),
        }
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{GROUP_ID_SEPARATOR}{}", self.component, self.group)
    }
}

impl FromStr for GroupId {
    type Err = mb_core::Error;

    /// Parses `component::group`. Splits on the last separator so the group
    /// half never contains `::`; both halves must be non-empty.
    fn from_str(s: &str) -> mb_core::Result<Self> {
        match s.rsplit_once(GROUP_ID_SEPARATOR) {
            Some((component, group)) if !component.is_empty() && !group.is_empty() => {
                Ok(Self::new(component, group))
            }
            _ => Err(mb_core::Error::InvalidId {
                message: format!("group id '{s}' must look like 'component::group'"),
            }),
        }
    }
}

/// A named group of nodes within a component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    /// Group name.
    pub name: String,
    /// Run list applied to nodes of this group.
    #[serde(default)]
    pub run_list: Vec<String>,
    /// Node attributes applied to nodes of this group.
    #[serde(default)]
    pub chef_attributes: Map<String, Value>,
}

impl Group {
    /// Creates an empty group.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            run_list: Vec::new(),
            chef_attributes: Map::new(),
        }
    }

    /// Appends a run list entry.
    #[must_use]
    pub fn with_recipe(mut self, entry: impl Into<String>) -> Self {
        self.run_list.push(entry.into());
        self
    }

    /// Sets a top-level node attribute.
    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: Value) -> Self {
        self.chef_attributes.insert(key.into(), value);
        self
    }
}

/// A component of a plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Component {
    /// Component name.
    pub name: String,
    /// Node groups making up the component.
    #[serde(default)]
    pub groups: Vec<Group>,
    /// Dotted attribute path holding the component's version, if versioned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_attribute: Option<String>,
}

impl Component {
    /// Creates a component with no groups.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            groups: Vec::new(),
            version_attribute: None,
        }
    }

    /// Adds a group.
    #[must_use]
    pub fn with_group(mut self, group: Group) -> Self {
        self.groups.push(group);
        self
    }

    /// Declares the attribute that pins this component's version.
    #[must_use]
    pub fn versioned_by(mut self, attribute: impl Into<String>) -> Self {
        self.version_attribute = Some(attribute.into());
        self
    }

    /// Returns the group with the given name.
    #[must_use]
    pub fn group(&self, name: &str) -> Option<&Group> {
        self.groups.iter().find(|g| g.name == name)
    }
}

/// A plugin: the declarative model of one clustered application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plugin {
    /// Plugin name.
    pub name: String,
    /// Plugin version.
    pub version: String,
    /// Human-readable description.
    #[serde(default)]
    pub description: String,
    /// Components of the plugin.
    #[serde(default)]
    pub components: Vec<Component>,
    /// How to bootstrap a fresh cluster of this plugin, if defined.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootstrap_routine: Option<RoutineDescription>,
}

impl Plugin {
    /// Creates a plugin with no components.
    #[must_use]
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            description: String::new(),
            components: Vec::new(),
            bootstrap_routine: None,
        }
    }

    /// Adds a component.
    #[must_use]
    pub fn with_component(mut self, component: Component) -> Self {
        self.components.push(component);
        self
    }

    /// Sets the bootstrap routine description.
    #[must_use]
    pub fn with_bootstrap_routine(mut self, description: RoutineDescription) -> Self {
        self.bootstrap_routine = Some(description);
        self
    }

    /// Compiles the plugin's bootstrap routine, if it defines one.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RoutineSyntax`] if the description does not resolve
    /// against this plugin.
    pub fn compile_bootstrap_routine(&self) -> Result<Option<Routine>> {
        self.bootstrap_routine
            .as_ref()
            .map(|description| Routine::compile(self, description))
            .transpose()
    }

    /// Returns the `name-version` key identifying this plugin.
    #[must_use]
    pub fn id(&self) -> String {
        format!("{}-{}", self.name, self.version)
    }

    /// Returns the component with the given name.
    #[must_use]
    pub fn component(&self, name: &str) -> Option<&Component> {
        self.components.iter().find(|c| c.name == name)
    }

    /// Returns the component with the given name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ComponentNotFound`] if the plugin has no such component.
    pub fn component_or_err(&self, name: &str) -> Result<&Component> {
        self.component(name).ok_or_else(|| Error::ComponentNotFound {
            component: name.to_string(),
            plugin: self.to_string(),
        })
    }

    /// Resolves a group id against the plugin.
    #[must_use]
    pub fn group(&self, id: &GroupId) -> Option<&Group> {
        self.component(&id.component)?.group(&id.group)
    }

    /// Returns every group id defined by the plugin, in declaration order.
    #[must_use]
    pub fn group_ids(&self) -> Vec<GroupId> {
        self.components
            .iter()
            .flat_map(|c| c.groups.iter().map(|g| GroupId::new(&c.name, &g.name)))
            .collect()
    }
}

impl fmt::Display for Plugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.version)
    }
}
