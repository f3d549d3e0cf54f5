//! Composite atomicity under arbitrary batches

use mgmt_controller::prelude::*;
use mgmt_test_utils::{addr, controller_with, new_log, op, runtime_effect, test_registry, Log};
use proptest::prelude::*;
use std::sync::Arc;

const EFFECTS: usize = 4;
const TARGETS: [&str; 3] = ["/subsystem=web", "/subsystem=foo", "/subsystem=foo/deployment=bar"];

#[derive(Debug, Clone)]
enum Step {
    Write { target: usize, value: i64 },
    Effect(usize),
}

impl Step {
    fn operation(&self) -> Operation {
        match self {
            Self::Write { target, value } => op(TARGETS[*target], "write-attribute")
                .with_param("name", "counter")
                .with_param("value", *value),
            Self::Effect(n) => op("/subsystem=web", &format!("effect-{n}")),
        }
    }
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        (0..TARGETS.len(), any::<i64>()).prop_map(|(target, value)| Step::Write { target, value }),
        (0..EFFECTS).prop_map(Step::Effect),
    ]
}

fn controller(log: &Log) -> ModelController {
    let mut registry = test_registry();
    for n in 0..EFFECTS {
        registry.register_global(
            format!("effect-{n}"),
            StageAffinity::Runtime,
            runtime_effect(log, &format!("e{n}"), false),
        );
    }
    registry.register_global("fail-late", StageAffinity::Runtime, runtime_effect(log, "late", true));
    controller_with(registry).0
}

fn block_on<F: std::future::Future>(future: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(future)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn failing_composite_leaves_tree_and_services_untouched(
        steps in proptest::collection::vec(step(), 0..8),
        position in any::<prop::sample::Index>(),
    ) {
        let log = new_log();
        let controller = controller(&log);
        let before = controller.snapshot();

        let fail_at = position.index(steps.len() + 1);
        let mut operations: Vec<Operation> = steps.iter().map(Step::operation).collect();
        operations.insert(fail_at, op("/subsystem=web", "fail-late"));

        let response = block_on(controller.execute_composite(operations));

        // runtime steps run in submission order; undo runs newest first
        let ran: Vec<String> = steps[..fail_at]
            .iter()
            .filter_map(|s| match s {
                Step::Effect(n) => Some(format!("e{n}")),
                Step::Write { .. } => None,
            })
            .collect();
        let wrote = steps.iter().any(|s| matches!(s, Step::Write { .. }));

        let failure = response.failure.unwrap();
        prop_assert_eq!(failure.kind, FailureKind::RuntimeFailure);
        prop_assert_eq!(failure.step_index, Some(fail_at));
        let rollback = if wrote || !ran.is_empty() {
            RollbackStatus::Clean
        } else {
            RollbackStatus::NotRequired
        };
        prop_assert_eq!(failure.rollback, rollback);
        prop_assert!(Arc::ptr_eq(&before, &controller.snapshot()));
        let mut expected = ran.clone();
        expected.push("late".to_string());
        expected.extend(ran.iter().rev().map(|label| format!("undo {label}")));
        prop_assert_eq!(log.lock().clone(), expected);
    }

    #[test]
    fn successful_composite_applies_last_write_per_target(
        steps in proptest::collection::vec(step(), 1..8),
    ) {
        let log = new_log();
        let controller = controller(&log);
        let operations: Vec<Operation> = steps.iter().map(Step::operation).collect();

        let response = block_on(controller.execute_composite(operations));

        prop_assert!(response.is_success());
        prop_assert_eq!(response.result.as_list().unwrap().len(), steps.len());
        for (index, target) in TARGETS.iter().enumerate() {
            let last = steps.iter().rev().find_map(|s| match s {
                Step::Write { target, value } if *target == index => Some(*value),
                _ => None,
            });
            let resource = controller.read_resource(&addr(target)).unwrap();
            let counter = resource.model().get("counter").unwrap();
            match last {
                Some(value) => prop_assert_eq!(counter.as_i64().unwrap(), value),
                None => prop_assert!(!counter.is_defined()),
            }
        }
    }
}
