//! Concurrent runs contending for one environment.

#![allow(clippy::expect_used, clippy::unwrap_used)]

mod common;

use std::time::Duration;

use mb_flow::config::FlowConfig;
use mb_flow::job::{JobState, JobTicket};
use mb_flow::lock::{LockOptions, LockPolicy};
use mb_flow::manager::BootstrapManager;
use mb_flow::manifest::Manifest;
use mb_flow::remote::memory::{ExecPhase, ScriptedExecutor};
use mb_flow::upgrade::{UpgradeOptions, Upgrader};

/// Second cluster in the same environment, on other hosts.
fn other_manifest() -> Manifest {
    Manifest::new()
        .with_group("a::master", ["h4"])
        .with_group("a::slave", ["h5", "h6"])
}

async fn until_status(ticket: &JobTicket, status: &str) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while ticket.status() != status {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("status never reached");
}

async fn until_invoked(executor: &ScriptedExecutor, host: &str) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while executor.event_seq(host, ExecPhase::Started).is_none() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("host never invoked");
}

#[tokio::test]
async fn forced_bootstrap_preempts_the_running_one() {
    let executor = ScriptedExecutor::new().delayed("h1", Duration::from_millis(200));
    let (ctx, _chef, executor) = common::context(FlowConfig::default(), executor);
    let manager = BootstrapManager::new(ctx.clone());

    let first = manager.bootstrap(
        "prod",
        common::manifest(),
        common::routine(),
        common::bootstrap_options(),
    );
    until_invoked(&executor, "h1").await;

    let mut forced = common::bootstrap_options();
    forced.force = true;
    let second = manager.bootstrap("prod", other_manifest(), common::routine(), forced);

    let second_record = second.wait().await;
    let first_record = first.wait().await;
    assert_eq!(second_record.state, JobState::Success);
    assert_eq!(first_record.state, JobState::Failure);
    assert_eq!(first_record.failure.unwrap().kind, "lock_preempted");

    // The preempted run finishes its in-flight stage and stops there.
    tokio::time::sleep(Duration::from_millis(400)).await;
    let hosts = executor.hosts();
    assert!(hosts.contains(&"h1".to_string()));
    assert!(!hosts.contains(&"h2".to_string()), "{hosts:?}");
    assert!(!hosts.contains(&"h3".to_string()), "{hosts:?}");
    assert!(ctx.locks.holder("prod").unwrap().is_none());
}

#[tokio::test]
async fn contending_bootstrap_waits_for_the_holder() {
    let executor = ScriptedExecutor::new().delayed("h1", Duration::from_millis(100));
    let (ctx, _chef, executor) = common::context(FlowConfig::default(), executor);
    let manager = BootstrapManager::new(ctx);

    let first = manager.bootstrap(
        "prod",
        common::manifest(),
        common::routine(),
        common::bootstrap_options(),
    );
    until_invoked(&executor, "h1").await;
    let second = manager.bootstrap(
        "prod",
        other_manifest(),
        common::routine(),
        common::bootstrap_options(),
    );
    until_status(&second, "Waiting for lock on prod").await;

    assert_eq!(first.wait().await.state, JobState::Success);
    assert_eq!(second.wait().await.state, JobState::Success);

    let last_of_first = ["h1", "h2", "h3"]
        .iter()
        .map(|h| executor.event_seq(h, ExecPhase::Finished).unwrap())
        .max()
        .unwrap();
    let first_of_second = executor.event_seq("h4", ExecPhase::Started).unwrap();
    assert!(last_of_first < first_of_second);
}

#[tokio::test]
async fn waiters_are_granted_in_arrival_order() {
    let executor = ScriptedExecutor::new().delayed("h1", Duration::from_millis(100));
    let (ctx, _chef, executor) = common::context(FlowConfig::default(), executor);
    let manager = BootstrapManager::new(ctx.clone());

    let holder = manager.bootstrap(
        "prod",
        common::manifest(),
        common::routine(),
        common::bootstrap_options(),
    );
    until_invoked(&executor, "h1").await;

    let mut waiters = Vec::new();
    for (index, host) in ["w1", "w2", "w3"].into_iter().enumerate() {
        let manifest = Manifest::new()
            .with_group("a::master", [host])
            .with_group("a::slave", [format!("{host}-slave")]);
        let ticket = manager.bootstrap(
            "prod",
            manifest,
            common::routine(),
            common::bootstrap_options(),
        );
        until_status(&ticket, "Waiting for lock on prod").await;
        assert_eq!(ctx.locks.waiting("prod").unwrap(), index + 1);
        waiters.push(ticket);
    }

    assert_eq!(holder.wait().await.state, JobState::Success);
    for ticket in &waiters {
        assert_eq!(ticket.wait().await.state, JobState::Success);
    }

    let starts: Vec<u64> = ["w1", "w2", "w3"]
        .iter()
        .map(|h| executor.event_seq(h, ExecPhase::Started).unwrap())
        .collect();
    assert!(starts.windows(2).all(|pair| pair[0] < pair[1]), "{starts:?}");
}

#[tokio::test]
async fn fail_fast_policy_rejects_a_contended_run() {
    let config = FlowConfig {
        lock_policy: LockPolicy::FailFast,
        ..FlowConfig::default()
    };
    let executor = ScriptedExecutor::new().delayed("h1", Duration::from_millis(100));
    let (ctx, _chef, executor) = common::context(config, executor);
    let manager = BootstrapManager::new(ctx);

    let first = manager.bootstrap(
        "prod",
        common::manifest(),
        common::routine(),
        common::bootstrap_options(),
    );
    until_invoked(&executor, "h1").await;
    let second = manager
        .bootstrap(
            "prod",
            other_manifest(),
            common::routine(),
            common::bootstrap_options(),
        )
        .wait()
        .await;

    assert_eq!(second.state, JobState::Failure);
    let failure = second.failure.unwrap();
    assert_eq!(failure.kind, "lock_conflict");
    assert!(failure.message.contains(&first.id().to_string()));
    assert_eq!(first.wait().await.state, JobState::Success);
    assert!(executor.event_seq("h4", ExecPhase::Started).is_none());
}

#[tokio::test]
async fn lock_wait_times_out() {
    let config = FlowConfig {
        lock_wait_timeout_secs: 1,
        ..FlowConfig::default()
    };
    let executor = ScriptedExecutor::new().delayed("h1", Duration::from_millis(1500));
    let (ctx, _chef, executor) = common::context(config, executor);
    let manager = BootstrapManager::new(ctx);

    let first = manager.bootstrap(
        "prod",
        common::manifest(),
        common::routine(),
        common::bootstrap_options(),
    );
    until_invoked(&executor, "h1").await;
    let second = manager
        .bootstrap(
            "prod",
            other_manifest(),
            common::routine(),
            common::bootstrap_options(),
        )
        .wait()
        .await;

    assert_eq!(second.failure.unwrap().kind, "lock_timeout");
    assert_eq!(first.wait().await.state, JobState::Success);
}

#[tokio::test]
async fn upgrade_waits_for_a_running_bootstrap() {
    let executor = ScriptedExecutor::new().delayed("h1", Duration::from_millis(100));
    let (ctx, chef, executor) = common::context(FlowConfig::default(), executor);

    let bootstrap = BootstrapManager::new(ctx.clone()).bootstrap(
        "prod",
        common::manifest(),
        common::routine(),
        common::bootstrap_options(),
    );
    until_invoked(&executor, "h1").await;

    let upgrade = Upgrader::new(ctx).upgrade(
        "prod",
        common::plugin(),
        UpgradeOptions::default().with_cookbook_version("a", "= 1.1.0"),
    );
    until_status(&upgrade, "Waiting for lock on prod").await;
    assert_eq!(chef.save_count(), 0);

    assert_eq!(bootstrap.wait().await.state, JobState::Success);
    assert_eq!(upgrade.wait().await.state, JobState::Success);
    assert_eq!(chef.save_count(), 1);
}

#[tokio::test]
async fn upgrade_keeps_pins_written_while_it_waited() {
    let (ctx, chef, _executor) = common::context(FlowConfig::default(), ScriptedExecutor::new());
    let guard = ctx.locks.acquire("prod", LockOptions::new()).await.unwrap();

    let upgrade = Upgrader::new(ctx).upgrade(
        "prod",
        common::plugin(),
        UpgradeOptions::default().with_cookbook_version("b", "= 2.0.0"),
    );
    until_status(&upgrade, "Waiting for lock on prod").await;

    let mut environment = chef.environment("prod").unwrap();
    environment
        .cookbook_versions
        .insert("a".into(), "= 1.0.0".into());
    chef.insert_environment(environment);
    assert!(guard.release());

    assert_eq!(upgrade.wait().await.state, JobState::Success);
    let pins = chef.environment("prod").unwrap().cookbook_versions;
    assert_eq!(pins["a"], "= 1.0.0");
    assert_eq!(pins["b"], "= 2.0.0");
}
