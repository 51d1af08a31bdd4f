//! Provisioning lifecycle tests against an in-memory vCenter
//!
//! Every reconcile pass either submits one hypervisor task or polls the one
//! already recorded on the Machine; these tests step the fake vCenter's tasks
//! by hand between passes.

mod provisioning_support;

use std::sync::Arc;
use std::time::Duration;

use kube::runtime::controller::Action;

use provisioning_support::{
    sample_cluster, sample_machine, FakeStore, FakeVcenter, RecordedEvents, StaticBootstrap, GIB,
    MACHINE_UID,
};
use vsphere_provisioner::config::ProvisionerConfig;
use vsphere_provisioner::controller::{reconcile, Context};
use vsphere_provisioner::events::reasons;
use vsphere_provisioner::provisioner::{Provisioner, Reconciled};
use vsphere_provisioner::session::SessionManager;
use vsphere_provisioner::status::set_task_ref;
use vsphere_provisioner::{
    ANNOTATION_KUBELET_VERSION, ANNOTATION_TASK_REF, ANNOTATION_VM_IP, ANNOTATION_VM_REF,
    MACHINE_FINALIZER,
};

const POLL: Duration = Duration::from_secs(5);

fn provisioner(vcenter: &FakeVcenter, store: &FakeStore) -> Provisioner {
    recording_provisioner(vcenter, store, &RecordedEvents::default())
}

fn recording_provisioner(
    vcenter: &FakeVcenter,
    store: &FakeStore,
    events: &RecordedEvents,
) -> Provisioner {
    Provisioner::new(
        SessionManager::new(Arc::new(vcenter.clone())),
        Arc::new(store.clone()),
        Arc::new(StaticBootstrap),
        Arc::new(events.clone()),
        ProvisionerConfig::default(),
    )
}

#[tokio::test]
async fn second_create_polls_instead_of_cloning_again() {
    let vcenter = FakeVcenter::default();
    let store = FakeStore::default();
    let provisioner = provisioner(&vcenter, &store);
    let cluster = sample_cluster();
    let mut machine = sample_machine();

    let first = provisioner.create(&cluster, &mut machine).await.unwrap();
    assert_eq!(
        first,
        Reconciled::retry_after(POLL, "clone task task-1 submitted")
    );
    assert_eq!(store.annotation(ANNOTATION_TASK_REF).as_deref(), Some("task-1"));
    assert_eq!(store.provider_status()["taskRef"], "task-1");

    let second = provisioner.create(&cluster, &mut machine).await.unwrap();
    assert!(matches!(second, Reconciled::RetryAfter { delay, .. } if delay == POLL));
    assert_eq!(vcenter.clone_requests().len(), 1);
    assert_eq!(vcenter.logins(), 1);
}

#[tokio::test]
async fn clone_request_carries_machine_settings() {
    let vcenter = FakeVcenter::default();
    let store = FakeStore::default();
    let provisioner = provisioner(&vcenter, &store);
    let mut machine = sample_machine();

    provisioner
        .create(&sample_cluster(), &mut machine)
        .await
        .unwrap();

    let requests = vcenter.clone_requests();
    let spec = &requests[0];
    assert_eq!(spec.name, "prod-worker-0");
    assert!(spec.power_on);
    assert!(spec.config.disk_uuid_enabled);
    assert_eq!(spec.config.instance_uuid.as_deref(), Some(MACHINE_UID));
    assert_eq!(spec.config.num_cpus, Some(4));
    assert_eq!(spec.config.memory_mb, Some(8192));
    assert_eq!(spec.config.disk_resizes.len(), 1);
    assert_eq!(spec.config.disk_resizes[0].capacity_in_bytes, 25 * GIB);

    let hostname = spec
        .config
        .vapp_properties
        .iter()
        .find(|p| p.id == "hostname")
        .unwrap();
    assert_eq!(hostname.value, "prod-worker-0");
    let keys = spec
        .config
        .vapp_properties
        .iter()
        .find(|p| p.id == "public-keys")
        .unwrap();
    assert_eq!(keys.value, "ssh-ed25519 AAAAC3Nza ops@lab");
}

#[tokio::test]
async fn task_handle_survives_a_restart() {
    let vcenter = FakeVcenter::default();
    let store = FakeStore::default();
    let cluster = sample_cluster();

    let mut machine = sample_machine();
    provisioner(&vcenter, &store)
        .create(&cluster, &mut machine)
        .await
        .unwrap();

    // A new process sees only what was persisted.
    let restarted = provisioner(&vcenter, &store);
    let mut reloaded = store.reload(sample_machine());
    let result = restarted.create(&cluster, &mut reloaded).await.unwrap();

    assert!(matches!(result, Reconciled::RetryAfter { .. }));
    assert_eq!(vcenter.clone_requests().len(), 1);
}

#[tokio::test]
async fn unchanged_task_reference_is_not_rewritten() {
    let vcenter = FakeVcenter::default();
    let store = FakeStore::default();
    let mut machine = sample_machine();
    provisioner(&vcenter, &store)
        .create(&sample_cluster(), &mut machine)
        .await
        .unwrap();

    let writes = store.writes();
    let written = set_task_ref(&store, &mut machine, "task-1").await.unwrap();
    assert!(!written);
    assert_eq!(store.writes(), writes);
}

#[tokio::test]
async fn failed_clone_is_retried_from_scratch() {
    let vcenter = FakeVcenter::default();
    let store = FakeStore::default();
    let provisioner = provisioner(&vcenter, &store);
    let cluster = sample_cluster();
    let mut machine = sample_machine();

    provisioner.create(&cluster, &mut machine).await.unwrap();
    vcenter.fail("task-1", "Insufficient disk space on datastore 'ds1'");

    let reset = provisioner.create(&cluster, &mut machine).await.unwrap();
    assert_eq!(reset, Reconciled::Done);
    assert_eq!(store.annotation(ANNOTATION_TASK_REF), None);
    assert_eq!(store.provider_status()["taskRef"], "");

    let retried = provisioner.create(&cluster, &mut machine).await.unwrap();
    assert!(matches!(retried, Reconciled::RetryAfter { .. }));
    assert_eq!(vcenter.clone_requests().len(), 2);
}

#[tokio::test]
async fn machine_lifecycle_from_clone_to_teardown() {
    let vcenter = FakeVcenter::default();
    let store = FakeStore::default();
    let provisioner = provisioner(&vcenter, &store);
    let cluster = sample_cluster();
    let mut machine = sample_machine();

    // clone
    provisioner.create(&cluster, &mut machine).await.unwrap();
    vcenter.finish("task-1", None);
    assert_eq!(
        provisioner.create(&cluster, &mut machine).await.unwrap(),
        Reconciled::Done
    );
    assert_eq!(store.provider_status()["machineRef"], "vm-2");
    assert_eq!(store.provider_status()["taskRef"], "");
    assert!(provisioner.exists(&cluster, &machine).await.unwrap());

    // wait for the guest IP
    let waiting = provisioner.update(&cluster, &mut machine).await.unwrap();
    assert!(matches!(waiting, Reconciled::RetryAfter { delay, .. } if delay == Duration::from_secs(20)));
    vcenter.set_guest_ip("vm-2", "10.20.0.31");
    assert_eq!(
        provisioner.update(&cluster, &mut machine).await.unwrap(),
        Reconciled::Done
    );
    assert_eq!(store.annotation(ANNOTATION_VM_IP).as_deref(), Some("10.20.0.31"));
    assert_eq!(store.annotation(ANNOTATION_VM_REF).as_deref(), Some("vm-2"));
    assert_eq!(store.annotation(ANNOTATION_KUBELET_VERSION).as_deref(), Some("1.31.2"));
    assert!(store.cluster_touched());

    // power off, then destroy
    let powering_off = provisioner.delete(&cluster, &mut machine).await.unwrap();
    assert!(matches!(powering_off, Reconciled::RetryAfter { .. }));
    assert_eq!(store.annotation(ANNOTATION_TASK_REF).as_deref(), Some("task-3"));
    vcenter.finish("task-3", None);

    let destroying = provisioner.delete(&cluster, &mut machine).await.unwrap();
    assert!(matches!(destroying, Reconciled::RetryAfter { .. }));
    assert_eq!(store.annotation(ANNOTATION_TASK_REF).as_deref(), Some("task-4"));
    vcenter.finish("task-4", None);

    assert_eq!(
        provisioner.delete(&cluster, &mut machine).await.unwrap(),
        Reconciled::Done
    );
    assert_eq!(store.provider_status()["machineRef"], "");
    assert!(!provisioner.exists(&cluster, &machine).await.unwrap());
}

#[tokio::test]
async fn stopped_vm_is_powered_back_on() {
    let vcenter = FakeVcenter::default();
    let store = FakeStore::default();
    let events = RecordedEvents::default();
    let provisioner = recording_provisioner(&vcenter, &store, &events);
    let cluster = sample_cluster();
    let mut machine = sample_machine();

    provisioner.create(&cluster, &mut machine).await.unwrap();
    vcenter.finish("task-1", None);
    provisioner.create(&cluster, &mut machine).await.unwrap();

    vcenter.power_off("vm-2");
    let powering_on = provisioner.update(&cluster, &mut machine).await.unwrap();
    assert_eq!(
        powering_on,
        Reconciled::retry_after(POLL, "power-on task task-3 submitted")
    );
    assert_eq!(store.annotation(ANNOTATION_TASK_REF).as_deref(), Some("task-3"));
    assert_eq!(store.provider_status()["taskRef"], "task-3");

    // Still running: the next pass only polls.
    let waiting = provisioner.update(&cluster, &mut machine).await.unwrap();
    assert!(matches!(waiting, Reconciled::RetryAfter { delay, .. } if delay == POLL));

    vcenter.finish("task-3", None);
    vcenter.set_guest_ip("vm-2", "10.20.0.31");
    assert_eq!(
        provisioner.update(&cluster, &mut machine).await.unwrap(),
        Reconciled::Done
    );
    assert_eq!(store.annotation(ANNOTATION_TASK_REF), None);
    assert_eq!(store.annotation(ANNOTATION_VM_IP).as_deref(), Some("10.20.0.31"));
    assert_eq!(
        events.reasons(),
        vec![
            reasons::CREATING,
            reasons::CREATED,
            reasons::POWERING_ON,
            reasons::IP_DETECTED
        ]
    );
}

#[tokio::test]
async fn controller_adds_finalizer_and_requeues_while_cloning() {
    let vcenter = FakeVcenter::default();
    let store = FakeStore::default();
    let ctx = Arc::new(Context::new(
        provisioner(&vcenter, &store),
        Arc::new(store.clone()),
    ));

    let action = reconcile(Arc::new(sample_machine()), ctx.clone())
        .await
        .unwrap();
    assert_eq!(action, Action::requeue(POLL));

    let machine = store.reload(sample_machine());
    assert!(machine
        .metadata
        .finalizers
        .as_ref()
        .unwrap()
        .iter()
        .any(|f| f == MACHINE_FINALIZER));

    let action = reconcile(Arc::new(machine), ctx).await.unwrap();
    assert_eq!(action, Action::requeue(POLL));
    assert_eq!(vcenter.clone_requests().len(), 1);
}
