//! Property-based tests for routine compilation.
//!
//! Random layouts of sequential stages and parallel blocks are compiled
//! against a plugin and checked against the layout they came from.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use proptest::prelude::*;

use mb_flow::error::Error;
use mb_flow::plugin::{Component, Group, Plugin};
use mb_flow::routine::{Routine, RoutineDescription, StageDescriptor};

/// Groups defined by the plugin but never referenced by a layout.
const SPARE_GROUPS: usize = 2;

/// A stage layout: `None` for a sequential stage, `Some(n)` for a parallel
/// block of `n` groups.
fn arb_layout() -> impl Strategy<Value = Vec<Option<usize>>> {
    prop::collection::vec(prop::option::of(1usize..4), 1..8)
}

fn group_count(layout: &[Option<usize>]) -> usize {
    layout.iter().map(|stage| stage.unwrap_or(1)).sum()
}

fn plugin_with(groups: usize) -> Plugin {
    let component = (0..groups).fold(Component::new("svc"), |component, index| {
        component.with_group(Group::new(format!("g{index}")))
    });
    Plugin::new("svc", "1.0.0").with_component(component)
}

fn describe(layout: &[Option<usize>]) -> RoutineDescription {
    let mut next = 0;
    let mut take = || {
        let id = format!("svc::g{next}");
        next += 1;
        id
    };
    let stages = layout
        .iter()
        .map(|stage| match stage {
            None => StageDescriptor::Bootstrap(take()),
            Some(width) => StageDescriptor::Parallel((0..*width).map(|_| take()).collect()),
        })
        .collect();
    RoutineDescription { stages }
}

fn descriptor_ids(descriptor: &StageDescriptor) -> Vec<String> {
    match descriptor {
        StageDescriptor::Bootstrap(id) => vec![id.clone()],
        StageDescriptor::Parallel(ids) => ids.clone(),
    }
}

proptest! {
    #[test]
    fn queue_preserves_declaration_order(layout in arb_layout()) {
        let plugin = plugin_with(group_count(&layout) + SPARE_GROUPS);
        let description = describe(&layout);
        let routine = Routine::compile(&plugin, &description).unwrap();

        prop_assert_eq!(routine.len(), layout.len());
        let queue = routine.task_queue();
        for (stage, descriptor) in queue.iter().zip(&description.stages) {
            let ids: Vec<String> = stage.ids().into_iter().map(String::from).collect();
            prop_assert_eq!(ids, descriptor_ids(descriptor));
            prop_assert_eq!(
                stage.is_parallel(),
                matches!(descriptor, StageDescriptor::Parallel(_))
            );
        }
    }

    #[test]
    fn has_task_matches_referenced_groups(layout in arb_layout()) {
        let total = group_count(&layout);
        let plugin = plugin_with(total + SPARE_GROUPS);
        let routine = Routine::compile(&plugin, &describe(&layout)).unwrap();

        for index in 0..total {
            let id = format!("svc::g{index}");
            prop_assert!(routine.has_task(&id));
        }
        for index in total..total + SPARE_GROUPS {
            let id = format!("svc::g{index}");
            prop_assert!(!routine.has_task(&id));
        }
        prop_assert_eq!(routine.tasks().count(), total);
    }

    #[test]
    fn compilation_is_deterministic(layout in arb_layout()) {
        let plugin = plugin_with(group_count(&layout));
        let description = describe(&layout);

        let first = Routine::compile(&plugin, &description).unwrap();
        let second = Routine::compile(&plugin, &description).unwrap();

        prop_assert_eq!(first.fingerprint(), second.fingerprint());
        prop_assert!(first.fingerprint().starts_with("sha256:"));
        prop_assert_eq!(first, second);
    }

    #[test]
    fn referencing_a_group_twice_is_rejected(layout in arb_layout(), pick in any::<prop::sample::Index>()) {
        let plugin = plugin_with(group_count(&layout));
        let mut description = describe(&layout);
        let ids: Vec<String> = description.stages.iter().flat_map(descriptor_ids).collect();
        description
            .stages
            .push(StageDescriptor::Bootstrap(pick.get(&ids).clone()));

        let result = Routine::compile(&plugin, &description);
        prop_assert!(
            matches!(result, Err(Error::RoutineSyntax { .. })),
            "expected RoutineSyntax error, got {:?}",
            result
        );
    }
}
