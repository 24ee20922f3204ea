use std::time::Duration;

use gridlet::resources::Resources;
use gridlet::scheduler::ledger::{PendingWorker, ResourceLedger};
use gridlet::scheduler::RegisterOutcome;

fn res(pairs: &[(&str, f64)]) -> Resources {
    Resources::new(pairs.iter().map(|(n, v)| (n.to_string(), *v))).unwrap()
}

fn ledger() -> ResourceLedger {
    ResourceLedger::new(Duration::from_secs(60))
}

#[test]
fn reserve_is_atomic_and_release_restores() {
    let mut ledger = ledger();
    ledger.register("a1", res(&[("cpu", 4.0), ("memory", 16.0)]), None);

    let requirement = res(&[("cpu", 2.0), ("memory", 8.0)]);
    assert!(ledger.reserve("a1", &requirement));
    assert!(ledger.reserve("a1", &requirement));
    // A third reservation exceeds what's left.
    assert!(!ledger.reserve("a1", &requirement));

    let snapshot = ledger.snapshot().remove(0);
    assert_eq!(snapshot.available_resources.get("cpu"), 0.0);

    ledger.release("a1", &requirement);
    ledger.release("a1", &requirement);
    let snapshot = ledger.snapshot().remove(0);
    assert_eq!(snapshot.available_resources, snapshot.total_resources);
}

#[test]
fn partial_fit_reserves_nothing() {
    let mut ledger = ledger();
    ledger.register("a1", res(&[("cpu", 4.0), ("memory", 4.0)]), None);
    // cpu fits, memory does not; the reservation must not half-apply.
    assert!(!ledger.reserve("a1", &res(&[("cpu", 1.0), ("memory", 8.0)])));
    let snapshot = ledger.snapshot().remove(0);
    assert_eq!(snapshot.available_resources.get("cpu"), 4.0);
}

#[test]
fn release_never_exceeds_totals() {
    let mut ledger = ledger();
    ledger.register("a1", res(&[("cpu", 4.0)]), None);
    ledger.release("a1", &res(&[("cpu", 2.0)]));
    assert_eq!(ledger.snapshot()[0].available_resources.get("cpu"), 4.0);
}

#[test]
fn reregistration_with_same_totals_is_idempotent() {
    let mut ledger = ledger();
    assert_eq!(
        ledger.register("a1", res(&[("cpu", 4.0)]), None),
        RegisterOutcome::New
    );
    assert!(ledger.reserve("a1", &res(&[("cpu", 2.0)])));
    assert_eq!(
        ledger.register("a1", res(&[("cpu", 4.0)]), None),
        RegisterOutcome::Idempotent
    );
    // The reservation survives an idempotent re-registration.
    assert_eq!(ledger.snapshot()[0].available_resources.get("cpu"), 2.0);
}

#[test]
fn conflicting_reregistration_resets_availability() {
    let mut ledger = ledger();
    ledger.register("a1", res(&[("cpu", 4.0)]), None);
    assert!(ledger.reserve("a1", &res(&[("cpu", 3.0)])));
    ledger.add_pending_worker(
        "a1",
        PendingWorker {
            job_id: "j1".to_string(),
            grid_worker_id: None,
        },
    );

    assert_eq!(
        ledger.register("a1", res(&[("cpu", 8.0)]), None),
        RegisterOutcome::Restarted
    );
    let snapshot = ledger.snapshot().remove(0);
    assert_eq!(snapshot.total_resources.get("cpu"), 8.0);
    assert_eq!(snapshot.available_resources.get("cpu"), 8.0);
    // Pending pickups from the previous incarnation are gone.
    assert!(ledger.take_pending_workers("a1").is_empty());
}

#[test]
fn pending_workers_are_taken_once() {
    let mut ledger = ledger();
    ledger.register("a1", res(&[("cpu", 4.0)]), None);
    ledger.add_pending_worker(
        "a1",
        PendingWorker {
            job_id: "j1".to_string(),
            grid_worker_id: Some("w1".to_string()),
        },
    );

    let pending = ledger.take_pending_workers("a1");
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].job_id, "j1");
    assert!(ledger.take_pending_workers("a1").is_empty());
}

#[test]
fn job_affinity_gates_matching() {
    let mut ledger = ledger();
    ledger.register("generic", res(&[("cpu", 4.0)]), None);
    ledger.register("dedicated", res(&[("cpu", 4.0)]), Some("j1".to_string()));

    assert!(ledger.get("generic").unwrap().serves_job("j1"));
    assert!(ledger.get("generic").unwrap().serves_job("j2"));
    assert!(ledger.get("dedicated").unwrap().serves_job("j1"));
    assert!(!ledger.get("dedicated").unwrap().serves_job("j2"));
}

#[test]
fn any_total_fits_considers_affinity() {
    let mut ledger = ledger();
    ledger.register("dedicated", res(&[("cpu", 16.0)]), Some("j1".to_string()));
    ledger.register("small", res(&[("cpu", 1.0)]), None);

    // The only agent big enough is dedicated to j1.
    assert!(ledger.any_total_fits("j1", &res(&[("cpu", 8.0)])));
    assert!(!ledger.any_total_fits("j2", &res(&[("cpu", 8.0)])));
}

#[test]
fn silent_agents_expire() {
    let mut ledger = ResourceLedger::new(Duration::from_millis(100));
    ledger.register("a1", res(&[("cpu", 4.0)]), None);
    assert!(ledger.expired_agents().is_empty());

    std::thread::sleep(Duration::from_millis(150));
    assert_eq!(ledger.expired_agents(), vec!["a1".to_string()]);

    ledger.heartbeat("a1");
    assert!(ledger.expired_agents().is_empty());
}

#[test]
fn snapshot_is_sorted_by_agent_id() {
    let mut ledger = ledger();
    ledger.register("b", res(&[("cpu", 1.0)]), None);
    ledger.register("a", res(&[("cpu", 1.0)]), None);
    let ids: Vec<String> = ledger.snapshot().into_iter().map(|s| s.agent_id).collect();
    assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
}
