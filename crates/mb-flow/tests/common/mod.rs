//! Fixtures shared by the integration tests.

#![allow(dead_code, clippy::expect_used)]

use std::path::PathBuf;
use std::sync::Arc;

use mb_flow::config::{BootstrapOptions, FlowConfig, SshOptions};
use mb_flow::context::FlowContext;
use mb_flow::manifest::Manifest;
use mb_flow::plugin::{Component, Group, Plugin};
use mb_flow::remote::memory::{InMemoryChefServer, ScriptedExecutor};
use mb_flow::routine::{Routine, RoutineBuilder, RoutineDescription, StageDescriptor};

/// Writes a throwaway key file and returns its path.
pub fn key_file(contents: &str) -> String {
    let path: PathBuf = std::env::temp_dir().join(format!("mb-flow-it-{}.pem", ulid::Ulid::new()));
    std::fs::write(&path, contents).expect("write key file");
    path.to_string_lossy().into_owned()
}

/// Options that pass validation.
pub fn bootstrap_options() -> BootstrapOptions {
    BootstrapOptions {
        server_url: Some("https://chef.local".into()),
        client_name: Some("admin".into()),
        client_key: Some(key_file("client")),
        validator_client: Some("chef-validator".into()),
        validator_path: Some(key_file("validator")),
        ssh: Some(SshOptions {
            user: "root".into(),
            keys: vec!["~/.ssh/id_rsa".into()],
            ..SshOptions::default()
        }),
        ..BootstrapOptions::default()
    }
}

/// Plugin `a` with a master group and a slave group.
pub fn plugin() -> Plugin {
    Plugin::new("a", "1.0.0")
        .with_component(
            Component::new("a")
                .versioned_by("a.version")
                .with_group(Group::new("master").with_recipe("recipe[a::master]"))
                .with_group(Group::new("slave").with_recipe("recipe[a::slave]")),
        )
        .with_bootstrap_routine(RoutineDescription {
            stages: vec![
                StageDescriptor::Bootstrap("a::master".into()),
                StageDescriptor::Parallel(vec!["a::slave".into()]),
            ],
        })
}

/// Master first, then the slaves.
pub fn routine() -> Routine {
    RoutineBuilder::new(&plugin())
        .bootstrap("a::master")
        .parallel(|p| p.bootstrap("a::slave"))
        .build()
        .expect("routine compiles")
}

/// h1 is the master, h2 and h3 are slaves.
pub fn manifest() -> Manifest {
    Manifest::new()
        .with_group("a::master", ["h1"])
        .with_group("a::slave", ["h2", "h3"])
}

/// A context with `prod` defined on the server.
pub fn context(
    config: FlowConfig,
    executor: ScriptedExecutor,
) -> (FlowContext, Arc<InMemoryChefServer>, Arc<ScriptedExecutor>) {
    let chef = Arc::new(InMemoryChefServer::default().with_environment("prod"));
    let executor = Arc::new(executor);
    let ctx = FlowContext::new(config, chef.clone(), executor.clone());
    (ctx, chef, executor)
}
