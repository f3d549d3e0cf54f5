//! Subtree locking, snapshot reads, timeout and cancellation

use mgmt_controller::cancellation;
use mgmt_controller::prelude::*;
use mgmt_test_utils::{
    addr, controller_with, logged_write, new_log, op, test_registry, Gate, RuntimeGate,
    ServiceEvent, Sleep,
};
use std::sync::Arc;
use std::time::Duration;

fn port_of(controller: &ModelController, address: &str) -> i64 {
    controller
        .read_resource(&addr(address))
        .unwrap()
        .model()
        .get("port")
        .unwrap()
        .as_i64()
        .unwrap()
}

fn write_port(address: &str, port: i64) -> Operation {
    op(address, "write-attribute")
        .with_param("name", "port")
        .with_param("value", port)
}

fn gated(gate: &Gate) -> Arc<ModelController> {
    let mut registry = test_registry();
    registry.register(addr("/subsystem=*"), "hold", StageAffinity::Model, Arc::new(gate.clone()));
    let (controller, _) = controller_with(registry);
    Arc::new(controller)
}

#[tokio::test]
async fn overlapping_writer_waits_and_readers_see_committed_state() {
    let gate = Gate::new();
    let controller = gated(&gate);

    let holder = tokio::spawn({
        let controller = Arc::clone(&controller);
        async move {
            controller
                .execute(op("/subsystem=web", "hold").with_param("value", "held"))
                .await
        }
    });
    gate.entered.notified().await;

    let writer = tokio::spawn({
        let controller = Arc::clone(&controller);
        async move { controller.execute(write_port("/subsystem=web", 1)).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!writer.is_finished());

    // the held context's write is invisible to readers
    let read = controller
        .execute(op("/subsystem=web", "read-attribute").with_param("name", "value"))
        .await;
    assert!(read.is_success());
    assert!(!read.result.is_defined());
    assert_eq!(port_of(&controller, "/subsystem=web"), 8080);

    gate.release.notify_one();
    assert!(holder.await.unwrap().is_success());
    assert!(writer.await.unwrap().is_success());

    let web = controller.read_resource(&addr("/subsystem=web")).unwrap();
    assert_eq!(web.model().get("value").unwrap().as_str().unwrap(), "held");
    assert_eq!(web.model().get("port").unwrap().as_i64().unwrap(), 1);
}

#[tokio::test]
async fn disjoint_subtrees_do_not_block() {
    let gate = Gate::new();
    let controller = gated(&gate);

    let holder = tokio::spawn({
        let controller = Arc::clone(&controller);
        async move { controller.execute(op("/subsystem=web", "hold")).await }
    });
    gate.entered.notified().await;

    let other = tokio::time::timeout(
        Duration::from_secs(2),
        controller.execute(
            op("/subsystem=foo", "write-attribute")
                .with_param("name", "mode")
                .with_param("value", "fast"),
        ),
    )
    .await
    .expect("disjoint write must not wait");
    assert!(other.is_success());

    gate.release.notify_one();
    assert!(holder.await.unwrap().is_success());
}

#[tokio::test]
async fn ancestor_lock_blocks_descendant_writer() {
    let gate = Gate::new();
    let controller = gated(&gate);

    let holder = tokio::spawn({
        let controller = Arc::clone(&controller);
        async move { controller.execute(op("/subsystem=foo", "hold")).await }
    });
    gate.entered.notified().await;

    let response = controller
        .submit(
            Submission::single(
                op("/subsystem=foo/deployment=bar", "write-attribute")
                    .with_param("name", "enabled")
                    .with_param("value", false),
            )
            .with_timeout(Duration::from_millis(100)),
        )
        .await;
    assert_eq!(response.failure_kind(), Some(FailureKind::Timeout));

    gate.release.notify_one();
    assert!(holder.await.unwrap().is_success());
}

#[tokio::test]
async fn pushed_step_below_held_address_fails_with_lock_order() {
    let gate = Gate::new();
    let mut registry = test_registry();
    registry
        .register(addr("/subsystem=*"), "hold", StageAffinity::Model, Arc::new(gate.clone()))
        .register(
            addr("/zone=*"),
            "touch-web",
            StageAffinity::Model,
            handler_fn(|ctx, _| {
                ctx.push_operation(write_port("/subsystem=web", 2))?;
                ctx.complete_step()
            }),
        );
    let (controller, _) = controller_with(registry);
    let controller = Arc::new(controller);

    let holder = tokio::spawn({
        let controller = Arc::clone(&controller);
        async move { controller.execute(op("/subsystem=web", "hold")).await }
    });
    gate.entered.notified().await;

    // /subsystem=web sorts before /zone=z, so waiting could deadlock
    let response = tokio::time::timeout(
        Duration::from_secs(2),
        controller.execute(op("/zone=z", "touch-web")),
    )
    .await
    .expect("lock order violations fail fast");
    let failure = response.failure.unwrap();
    assert_eq!(failure.kind, FailureKind::LockOrder);
    assert_eq!(failure.address, addr("/subsystem=web"));
    assert_eq!(failure.operation, "write-attribute");

    gate.release.notify_one();
    assert!(holder.await.unwrap().is_success());
    assert_eq!(port_of(&controller, "/subsystem=web"), 8080);
}

#[tokio::test]
async fn pushed_step_below_held_address_succeeds_when_free() {
    let mut registry = test_registry();
    registry.register(
        addr("/zone=*"),
        "touch-web",
        StageAffinity::Model,
        handler_fn(|ctx, _| {
            ctx.push_operation(write_port("/subsystem=web", 2))?;
            ctx.complete_step()
        }),
    );
    let (controller, _) = controller_with(registry);

    let response = controller.execute(op("/zone=z", "touch-web")).await;

    assert!(response.is_success(), "{:?}", response.failure_description());
    assert_eq!(port_of(&controller, "/subsystem=web"), 2);
}

#[tokio::test]
async fn pushed_step_above_held_addresses_waits() {
    let gate = Gate::new();
    let mut registry = test_registry();
    registry
        .register(addr("/subsystem=*"), "hold", StageAffinity::Model, Arc::new(gate.clone()))
        .register(
            addr("/area=*"),
            "touch-web",
            StageAffinity::Model,
            handler_fn(|ctx, _| {
                ctx.push_operation(write_port("/subsystem=web", 3))?;
                ctx.complete_step()
            }),
        );
    let (controller, _) = controller_with(registry);
    let controller = Arc::new(controller);

    let holder = tokio::spawn({
        let controller = Arc::clone(&controller);
        async move { controller.execute(op("/subsystem=web", "hold")).await }
    });
    gate.entered.notified().await;

    // /area=a sorts before /subsystem=web: waiting is safe
    let waiter = tokio::spawn({
        let controller = Arc::clone(&controller);
        async move { controller.execute(op("/area=a", "touch-web")).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiter.is_finished());

    gate.release.notify_one();
    assert!(holder.await.unwrap().is_success());
    let response = waiter.await.unwrap();
    assert!(response.is_success(), "{:?}", response.failure_description());
    assert_eq!(port_of(&controller, "/subsystem=web"), 3);
}

#[tokio::test]
async fn composite_acquires_locks_in_address_order() {
    let log = new_log();
    let mut registry = test_registry();
    registry.register(addr("/subsystem=*"), "logged", StageAffinity::Model, logged_write(&log, "x"));
    let (controller, _) = controller_with(registry);
    let controller = Arc::new(controller);

    // both batches touch the same two subtrees in opposite submission order
    let a = tokio::spawn({
        let controller = Arc::clone(&controller);
        async move {
            controller
                .execute_composite(vec![
                    op("/subsystem=web", "logged").with_param("value", "a"),
                    op("/subsystem=foo", "logged").with_param("value", "a"),
                ])
                .await
        }
    });
    let b = tokio::spawn({
        let controller = Arc::clone(&controller);
        async move {
            controller
                .execute_composite(vec![
                    op("/subsystem=foo", "logged").with_param("value", "b"),
                    op("/subsystem=web", "logged").with_param("value", "b"),
                ])
                .await
        }
    });

    let (a, b) = tokio::time::timeout(Duration::from_secs(5), async {
        (a.await.unwrap(), b.await.unwrap())
    })
    .await
    .expect("no deadlock");
    assert!(a.is_success());
    assert!(b.is_success());
    assert_eq!(log.lock().len(), 4);

    // one batch committed last, and it won both subtrees
    let web = controller.read_resource(&addr("/subsystem=web")).unwrap();
    let foo = controller.read_resource(&addr("/subsystem=foo")).unwrap();
    assert_eq!(
        web.model().get("value").unwrap().as_str().unwrap(),
        foo.model().get("value").unwrap().as_str().unwrap()
    );
}

#[tokio::test]
async fn timeout_rolls_back_and_releases_locks() {
    let mut registry = test_registry();
    registry.register(
        addr("/subsystem=*"),
        "slow",
        StageAffinity::Model,
        Arc::new(Sleep(Duration::from_secs(30))),
    );
    let (controller, _) = controller_with(registry);

    let response = controller
        .submit(
            Submission::single(op("/subsystem=web", "slow"))
                .with_timeout(Duration::from_millis(50)),
        )
        .await;

    let failure = response.failure.unwrap();
    assert_eq!(failure.kind, FailureKind::Timeout);
    assert_eq!(failure.rollback, RollbackStatus::Clean);
    let web = controller.read_resource(&addr("/subsystem=web")).unwrap();
    assert!(!web.model().has_defined("touched"));

    let next = tokio::time::timeout(
        Duration::from_secs(2),
        controller.execute(write_port("/subsystem=web", 5)),
    )
    .await
    .expect("lock released after timeout");
    assert!(next.is_success());
}

#[tokio::test]
async fn configured_timeout_applies_by_default() {
    let mut registry = test_registry();
    registry.register(
        addr("/subsystem=*"),
        "slow",
        StageAffinity::Model,
        Arc::new(Sleep(Duration::from_secs(30))),
    );
    let (controller, _) = controller_with(registry);
    let controller = controller
        .with_config(ControllerConfig::default().with_operation_timeout(Duration::from_millis(50)));

    let response = controller.execute(op("/subsystem=web", "slow")).await;
    assert_eq!(response.failure_kind(), Some(FailureKind::Timeout));
}

#[tokio::test]
async fn cancellation_before_complete_rolls_back() {
    let gate = Gate::new();
    let controller = gated(&gate);
    let (handle, token) = cancellation();

    let task = tokio::spawn({
        let controller = Arc::clone(&controller);
        async move {
            controller
                .submit(
                    Submission::single(op("/subsystem=web", "hold").with_param("value", "x"))
                        .with_cancel(token),
                )
                .await
        }
    });
    gate.entered.notified().await;
    handle.cancel();

    let response = task.await.unwrap();
    let failure = response.failure.unwrap();
    assert_eq!(failure.kind, FailureKind::Cancelled);
    assert_eq!(failure.rollback, RollbackStatus::Clean);
    let web = controller.read_resource(&addr("/subsystem=web")).unwrap();
    assert!(!web.model().has_defined("value"));
}

#[tokio::test]
async fn cancellation_after_complete_has_no_effect() {
    let (controller, _) = controller_with(test_registry());
    let (handle, token) = cancellation();

    let response = controller
        .submit(Submission::single(write_port("/subsystem=web", 7)).with_cancel(token))
        .await;
    handle.cancel();

    assert!(response.is_success());
    assert_eq!(port_of(&controller, "/subsystem=web"), 7);
}

#[tokio::test]
async fn cancelled_token_fails_before_first_step() {
    let (controller, _) = controller_with(test_registry());
    let (handle, token) = cancellation();
    handle.cancel();

    let response = controller
        .submit(Submission::single(write_port("/subsystem=web", 7)).with_cancel(token))
        .await;

    assert_eq!(response.failure_kind(), Some(FailureKind::Cancelled));
    assert_eq!(port_of(&controller, "/subsystem=web"), 8080);
}

#[tokio::test]
async fn dropping_a_submission_releases_its_locks() {
    let gate = Gate::new();
    let controller = gated(&gate);

    let task = tokio::spawn({
        let controller = Arc::clone(&controller);
        async move {
            controller
                .execute(op("/subsystem=web", "hold").with_param("value", "lost"))
                .await
        }
    });
    gate.entered.notified().await;
    task.abort();
    assert!(task.await.unwrap_err().is_cancelled());

    let next = tokio::time::timeout(
        Duration::from_secs(2),
        controller.execute(write_port("/subsystem=web", 9)),
    )
    .await
    .expect("aborted submission released its lock");
    assert!(next.is_success());
    let web = controller.read_resource(&addr("/subsystem=web")).unwrap();
    assert!(!web.model().has_defined("value"));
}

#[tokio::test]
async fn dropping_a_submission_during_runtime_undoes_its_effects() {
    let gate = Gate::new();
    let mut registry = test_registry();
    registry.register(
        addr("/subsystem=*"),
        "hold-runtime",
        StageAffinity::Runtime,
        Arc::new(RuntimeGate(gate.clone())),
    );
    let (controller, services) = controller_with(registry);
    let controller = Arc::new(controller);

    let task = tokio::spawn({
        let controller = Arc::clone(&controller);
        async move {
            controller
                .execute_composite(vec![
                    op("/subsystem=jca", "add"),
                    op("/subsystem=web", "hold-runtime"),
                ])
                .await
        }
    });
    gate.entered.notified().await;
    assert_eq!(services.installed(), vec!["/subsystem=jca".to_string()]);
    task.abort();
    assert!(task.await.unwrap_err().is_cancelled());

    // the undo runs detached and keeps the locks until it is done
    let next = tokio::time::timeout(
        Duration::from_secs(2),
        controller.execute(op("/subsystem=jca", "add")),
    )
    .await
    .expect("detached rollback released its locks");
    assert!(next.is_success());
    assert_eq!(
        services.events(),
        vec![
            ServiceEvent::Installed("/subsystem=jca".into()),
            ServiceEvent::Removed("/subsystem=jca".into()),
            ServiceEvent::Installed("/subsystem=jca".into()),
        ]
    );
}
