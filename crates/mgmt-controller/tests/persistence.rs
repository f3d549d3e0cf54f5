//! Persistence hook, journal and configuration

use mgmt_controller::prelude::*;
use mgmt_controller::{ConfigurationPersister, JsonFilePersister, PersistenceError};
use mgmt_test_utils::{addr, op, test_controller, ServiceEvent};
use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Rejects every store, counting attempts
#[derive(Debug, Default)]
struct RejectingPersister {
    attempts: AtomicUsize,
}

impl ConfigurationPersister for RejectingPersister {
    fn store(&self, _root: &Resource) -> Result<(), PersistenceError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(PersistenceError::Rejected("disk full".into()))
    }
}

/// Accepts every store after a pause, flagging when one has begun
#[derive(Debug, Default)]
struct SlowPersister {
    storing: AtomicBool,
}

impl ConfigurationPersister for SlowPersister {
    fn store(&self, _root: &Resource) -> Result<(), PersistenceError> {
        self.storing.store(true, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(200));
        Ok(())
    }
}

#[tokio::test]
async fn committed_tree_is_written_and_reloadable() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("model.json");
    let (controller, _) = test_controller();
    let controller = controller.with_persister(Arc::new(JsonFilePersister::new(&path)));

    let response = controller
        .execute(
            op("/subsystem=web", "write-attribute")
                .with_param("name", "port")
                .with_param("value", 9090),
        )
        .await;
    assert!(response.is_success());

    let loaded = JsonFilePersister::new(&path).load().unwrap().unwrap();
    assert_eq!(loaded, *controller.snapshot());
    assert!(!dir.path().join("model.json.tmp").exists());
}

#[tokio::test]
async fn read_only_submissions_do_not_store() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("model.json");
    let (controller, _) = test_controller();
    let controller = controller.with_persister(Arc::new(JsonFilePersister::new(&path)));

    let response = controller.execute(op("/", "read-resource")).await;

    assert!(response.is_success());
    assert!(JsonFilePersister::new(&path).load().unwrap().is_none());
}

#[tokio::test]
async fn restarted_controller_resumes_from_stored_tree() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("model.json");
    {
        let (controller, _) = test_controller();
        let controller = controller.with_persister(Arc::new(JsonFilePersister::new(&path)));
        assert!(controller
            .execute(op("/deployment=new.war", "add"))
            .await
            .is_success());
    }

    let root = JsonFilePersister::new(&path).load().unwrap().unwrap();
    let restarted = ModelController::new(builtin_registry()).with_root(root);
    let response = restarted
        .execute(op("/deployment=new.war", "read-attribute").with_param("name", "enabled"))
        .await;

    assert!(response.is_success());
    assert!(!response.result.as_bool().unwrap());
}

#[tokio::test]
async fn rejected_store_rolls_back_model_and_runtime() {
    let (controller, services) = test_controller();
    let persister = Arc::new(RejectingPersister::default());
    let controller =
        controller.with_persister(Arc::clone(&persister) as Arc<dyn ConfigurationPersister>);
    let before = controller.snapshot();

    let response = controller.execute(op("/subsystem=mail", "add")).await;

    let failure = response.failure.unwrap();
    assert_eq!(failure.kind, FailureKind::RuntimeFailure);
    assert_eq!(failure.rollback, RollbackStatus::Clean);
    assert!(failure.message.contains("disk full"));
    assert_eq!(persister.attempts.load(Ordering::SeqCst), 1);
    assert_eq!(
        services.events(),
        vec![
            ServiceEvent::Installed("/subsystem=mail".into()),
            ServiceEvent::Removed("/subsystem=mail".into()),
        ]
    );
    assert!(Arc::ptr_eq(&before, &controller.snapshot()));
    assert!(controller.read_resource(&addr("/subsystem=mail")).is_none());
}

#[tokio::test]
async fn commit_in_flight_when_dropped_still_lands() {
    let (controller, services) = test_controller();
    let persister = Arc::new(SlowPersister::default());
    let controller = Arc::new(
        controller.with_persister(Arc::clone(&persister) as Arc<dyn ConfigurationPersister>),
    );

    let task = tokio::spawn({
        let controller = Arc::clone(&controller);
        async move { controller.execute(op("/subsystem=mail", "add")).await }
    });
    while !persister.storing.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    task.abort();
    assert!(task.await.unwrap_err().is_cancelled());

    // waits for the detached settlement to let go of the lock
    let next = tokio::time::timeout(
        Duration::from_secs(2),
        controller.execute(
            op("/subsystem=mail", "write-attribute")
                .with_param("name", "host")
                .with_param("value", "smtp"),
        ),
    )
    .await
    .unwrap();
    assert!(next.is_success());
    assert_eq!(
        services.events(),
        vec![ServiceEvent::Installed("/subsystem=mail".into())]
    );
}

#[tokio::test]
async fn journal_records_every_outcome_in_a_valid_chain() {
    let (controller, _) = test_controller();

    controller
        .execute(
            op("/subsystem=web", "write-attribute")
                .with_param("name", "port")
                .with_param("value", 1),
        )
        .await;
    controller.execute(op("/subsystem=web", "read-attribute")).await;
    controller
        .execute_composite(vec![
            op("/subsystem=web", "read-resource"),
            op("/subsystem=foo", "read-resource"),
        ])
        .await;

    let journal = controller.journal().unwrap();
    let entries = journal.entries();
    assert_eq!(entries.len(), 3);
    assert_eq!(entries[0].outcome, "success");
    assert_eq!(entries[0].operations, vec!["write-attribute"]);
    assert_eq!(entries[0].addresses, vec!["/subsystem=web"]);
    assert_eq!(entries[1].outcome, "failed: validation");
    assert_eq!(entries[2].operations, vec!["read-resource", "read-resource"]);
    assert_eq!(
        entries.iter().map(|e| e.sequence).collect::<Vec<_>>(),
        vec![0, 1, 2]
    );
    assert!(journal.verify_integrity().is_ok());
}

#[tokio::test]
async fn bounded_journal_keeps_the_newest_entries() {
    let (controller, _) = test_controller();
    let controller = controller.with_config(ControllerConfig::default().with_journal(true, 2));

    for _ in 0..5 {
        controller.execute(op("/", "read-resource")).await;
    }

    let journal = controller.journal().unwrap();
    let sequences: Vec<u64> = journal.entries().iter().map(|e| e.sequence).collect();
    assert_eq!(sequences, vec![3, 4]);
    assert!(journal.verify_integrity().is_ok());
}

#[tokio::test]
async fn disabled_journal_records_nothing() {
    let (controller, _) = test_controller();
    let controller = controller.with_config(ControllerConfig::default().with_journal(false, 0));

    controller.execute(op("/", "read-resource")).await;

    assert!(controller.journal().is_none());
}

#[test]
fn configuration_round_trips_through_toml() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("controller.toml");
    std::fs::write(
        &path,
        "operation_timeout_ms = 2500\nmax_steps = 64\njournal_enabled = false\n",
    )
    .unwrap();

    let config = ControllerConfig::load(&path).unwrap();

    assert_eq!(config.operation_timeout(), std::time::Duration::from_millis(2500));
    assert_eq!(config.max_steps, 64);
    assert!(!config.journal_enabled);
    assert_eq!(config.journal_capacity, ControllerConfig::default().journal_capacity);
    let rendered = config.to_toml_string().unwrap();
    assert_eq!(ControllerConfig::from_toml_str(&rendered).unwrap(), config);
}

#[test]
fn invalid_configuration_is_rejected() {
    assert!(ControllerConfig::from_toml_str("max_steps = 0").is_err());
    assert!(ControllerConfig::from_toml_str("operation_timeout_ms = \"soon\"").is_err());
    assert!(ControllerConfig::load("/definitely/not/here.toml").is_err());
}
