//! Bootstrap manifests: node-group ids bound to target hosts.
//!
//! The wire form is a list of entries, each binding a list of group ids to a
//! list of hosts:
//!
//! ```json
//! { "nodes": [ { "groups": ["app::master"], "hosts": ["h1"] } ] }
//! ```
//!
//! Entries may overlap. When two entries name the same group their hosts are
//! appended in document order, keeping the first occurrence of any repeat.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::provisioner::{ProvisionManifest, ProvisionedNode};
use crate::routine::Routine;

/// One entry of a manifest document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Group ids the hosts belong to.
    #[serde(default)]
    pub groups: Vec<String>,
    /// Target host addresses.
    #[serde(default)]
    pub hosts: Vec<String>,
}

/// The exchangeable document form of a manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestDocument {
    /// Group/host bindings.
    #[serde(default)]
    pub nodes: Vec<ManifestEntry>,
}

/// Hosts for each node group of one orchestration run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Manifest {
    groups: BTreeMap<String, Vec<String>>,
}

impl Manifest {
    /// Creates an empty manifest.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds hosts to a group, appending to any hosts it already has.
    #[must_use]
    pub fn with_group<I, S>(mut self, group_id: impl Into<String>, hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.insert(group_id, hosts);
        self
    }

    /// Binds hosts to a group, appending to any hosts it already has.
    ///
    /// Host names are trimmed and blank ones are skipped.
    pub fn insert<I, S>(&mut self, group_id: impl Into<String>, hosts: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let bound = self.groups.entry(group_id.into()).or_default();
        for host in hosts {
            let host: String = host.into();
            let host = host.trim();
            if host.is_empty() {
                continue;
            }
            if !bound.iter().any(|h| h == host) {
                bound.push(host.to_string());
            }
        }
    }

    /// Builds a manifest from its document form.
    #[must_use]
    pub fn from_document(document: &ManifestDocument) -> Self {
        let mut manifest = Self::new();
        for entry in &document.nodes {
            for group in &entry.groups {
                manifest.insert(group.clone(), entry.hosts.iter().cloned());
            }
        }
        manifest
    }

    /// Parses a manifest document from JSON.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Serialization`] if the input is not a manifest document.
    pub fn from_json(json: &str) -> Result<Self> {
        let document: ManifestDocument = serde_json::from_str(json)?;
        Ok(Self::from_document(&document))
    }

    /// Converts to the document form, one entry per group.
    #[must_use]
    pub fn to_document(&self) -> ManifestDocument {
        ManifestDocument {
            nodes: self
                .groups
                .iter()
                .map(|(group, hosts)| ManifestEntry {
                    groups: vec![group.clone()],
                    hosts: hosts.clone(),
                })
                .collect(),
        }
    }

    /// Builds a bootstrap manifest from the nodes a provisioner created.
    ///
    /// Entries of the provision manifest are satisfied in order: each takes
    /// `count` not-yet-assigned nodes of its instance type and binds them to
    /// every group it lists.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnexpectedProvisionCount`] if an entry cannot be
    /// satisfied from the created nodes.
    pub fn from_provisioned(
        requested: &ProvisionManifest,
        created: &[ProvisionedNode],
    ) -> Result<Self> {
        let mut used = vec![false; created.len()];
        let mut manifest = Self::new();

        for entry in &requested.nodes {
            let mut hosts = Vec::with_capacity(entry.count);
            for (index, node) in created.iter().enumerate() {
                if hosts.len() == entry.count {
                    break;
                }
                if !used[index] && node.instance_type == entry.instance_type {
                    used[index] = true;
                    hosts.push(node.public_hostname.clone());
                }
            }
            if hosts.len() < entry.count {
                return Err(Error::UnexpectedProvisionCount {
                    expected: requested.node_count(),
                    actual: created.len(),
                });
            }
            for group in &entry.groups {
                manifest.insert(group.clone(), hosts.iter().cloned());
            }
        }

        Ok(manifest)
    }

    /// Returns the hosts bound to a group.
    #[must_use]
    pub fn hosts(&self, group_id: &str) -> &[String] {
        self.groups.get(group_id).map_or(&[], Vec::as_slice)
    }

    /// Returns the group ids present in the manifest.
    pub fn group_ids(&self) -> impl Iterator<Item = &str> {
        self.groups.keys().map(String::as_str)
    }

    /// Returns every distinct host, in first-seen order.
    #[must_use]
    pub fn all_hosts(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.groups
            .values()
            .flatten()
            .map(String::as_str)
            .filter(|h| seen.insert(*h))
            .collect()
    }

    /// Returns true if no group has hosts.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.groups.values().all(Vec::is_empty)
    }

    /// Checks that every task in the routine has at least one host.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ManifestValidation`] naming every uncovered task.
    pub fn validate(&self, routine: &Routine) -> Result<()> {
        let missing: Vec<String> = routine
            .tasks()
            .filter(|task| self.hosts(&task.id).is_empty())
            .map(|task| task.id.clone())
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(Error::ManifestValidation { missing })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::{Component, Group, Plugin};
    use crate::provisioner::ProvisionEntry;
    use crate::routine::RoutineBuilder;

    fn routine() -> Routine {
        let plugin = Plugin::new("a", "1.0.0").with_component(
            Component::new("a")
                .with_group(Group::new("master"))
                .with_group(Group::new("slave")),
        );
        RoutineBuilder::new(&plugin)
            .bootstrap("a::master")
            .parallel(|p| p.bootstrap("a::slave"))
            .build()
            .unwrap()
    }

    #[test]
    fn parses_document_with_overlapping_entries() {
        let manifest = Manifest::from_json(
            r#"{"nodes": [
                {"groups": ["a::master", "a::slave"], "hosts": ["h1"]},
                {"groups": ["a::slave"], "hosts": ["h2", "h1", "h3"]}
            ]}"#,
        )
        .unwrap();

        assert_eq!(manifest.hosts("a::master"), ["h1"]);
        assert_eq!(manifest.hosts("a::slave"), ["h1", "h2", "h3"]);
        assert_eq!(manifest.all_hosts(), vec!["h1", "h2", "h3"]);
    }

    #[test]
    fn blank_hosts_do_not_cover_a_group() {
        let manifest = Manifest::from_json(
            r#"{"nodes": [
                {"groups": ["a::master"], "hosts": ["", "  "]},
                {"groups": ["a::slave"], "hosts": [" h2 ", "h2", ""]}
            ]}"#,
        )
        .unwrap();

        assert!(manifest.hosts("a::master").is_empty());
        assert_eq!(manifest.hosts("a::slave"), ["h2"]);
        match manifest.validate(&routine()).unwrap_err() {
            Error::ManifestValidation { missing } => assert_eq!(missing, ["a::master"]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn rejects_malformed_json() {
        let err = Manifest::from_json(r#"{"nodes": "nope"}"#).unwrap_err();
        assert!(matches!(err, Error::Serialization { .. }));
    }

    #[test]
    fn validate_accepts_covering_manifest() {
        let manifest = Manifest::new()
            .with_group("a::master", ["h1"])
            .with_group("a::slave", ["h2", "h3"]);
        manifest.validate(&routine()).unwrap();
    }

    #[test]
    fn validate_reports_every_missing_task() {
        let err = Manifest::new().validate(&routine()).unwrap_err();
        match err {
            Error::ManifestValidation { missing } => {
                assert_eq!(missing, vec!["a::master", "a::slave"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn empty_host_list_does_not_cover_a_task() {
        let manifest = Manifest::new()
            .with_group("a::master", ["h1"])
            .with_group("a::slave", Vec::<String>::new());
        let err = manifest.validate(&routine()).unwrap_err();
        assert!(err.to_string().contains("a::slave"));
    }

    #[test]
    fn document_form_roundtrips() {
        let manifest = Manifest::new()
            .with_group("a::master", ["h1"])
            .with_group("a::slave", ["h2"]);
        assert_eq!(Manifest::from_document(&manifest.to_document()), manifest);
    }

    #[test]
    fn assigns_provisioned_nodes_by_type() {
        let requested = ProvisionManifest {
            nodes: vec![
                ProvisionEntry::new("m1.large", 1, ["a::master"]),
                ProvisionEntry::new("m1.small", 2, ["a::slave"]),
            ],
        };
        let created = vec![
            ProvisionedNode::new("m1.small", "s1"),
            ProvisionedNode::new("m1.large", "l1"),
            ProvisionedNode::new("m1.small", "s2"),
        ];

        let manifest = Manifest::from_provisioned(&requested, &created).unwrap();
        assert_eq!(manifest.hosts("a::master"), ["l1"]);
        assert_eq!(manifest.hosts("a::slave"), ["s1", "s2"]);
    }

    #[test]
    fn short_provision_is_rejected() {
        let requested = ProvisionManifest {
            nodes: vec![ProvisionEntry::new("m1.small", 2, ["a::slave"])],
        };
        let created = vec![ProvisionedNode::new("m1.small", "s1")];

        let err = Manifest::from_provisioned(&requested, &created).unwrap_err();
        assert!(matches!(
            err,
            Error::UnexpectedProvisionCount {
                expected: 2,
                actual: 1
            }
        ));
    }
}
