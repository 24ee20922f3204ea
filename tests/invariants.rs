//! Property tests for the core bookkeeping invariants.

mod test_harness;

use std::collections::HashMap;
use std::time::Duration;

use proptest::prelude::*;

use gridlet::proto::process_state::ProcessStateEnum;
use gridlet::registry::job::{AddJobResult, JobRegistry};
use gridlet::resources::Resources;
use gridlet::scheduler::ledger::ResourceLedger;
use gridlet::states::is_terminal;
use test_harness::{command_job, state_of};

const RESOURCE_NAMES: [&str; 3] = ["cpu", "memory", "gpu"];

fn arb_resources() -> impl Strategy<Value = Resources> {
    proptest::collection::btree_map(
        proptest::sample::select(RESOURCE_NAMES.to_vec()).prop_map(str::to_string),
        0.0f64..8.0,
        0..=3,
    )
    .prop_map(|map| Resources::new(map).unwrap())
}

#[derive(Debug, Clone)]
enum LedgerOp {
    Reserve(Resources),
    /// Release a previously-successful reservation by index.
    Release(usize),
}

fn arb_ledger_ops() -> impl Strategy<Value = Vec<LedgerOp>> {
    proptest::collection::vec(
        prop_oneof![
            arb_resources().prop_map(LedgerOp::Reserve),
            (0usize..32).prop_map(LedgerOp::Release),
        ],
        0..48,
    )
}

proptest! {
    /// available = total − Σ(active reservations), component-wise, and no
    /// component ever goes negative.
    #[test]
    fn resource_accounting_balances(totals in arb_resources(), ops in arb_ledger_ops()) {
        let mut ledger = ResourceLedger::new(Duration::from_secs(60));
        ledger.register("a1", totals.clone(), None);

        let mut active: Vec<Resources> = Vec::new();
        for op in ops {
            match op {
                LedgerOp::Reserve(requirement) => {
                    if ledger.reserve("a1", &requirement) {
                        active.push(requirement);
                    }
                }
                LedgerOp::Release(index) => {
                    if !active.is_empty() {
                        let requirement = active.swap_remove(index % active.len());
                        ledger.release("a1", &requirement);
                    }
                }
            }

            let snapshot = ledger.snapshot().remove(0);
            let mut reserved: HashMap<&str, f64> = HashMap::new();
            for requirement in &active {
                for (name, value) in requirement.iter() {
                    *reserved.entry(name).or_insert(0.0) += value;
                }
            }
            for name in RESOURCE_NAMES {
                let available = snapshot.available_resources.get(name);
                let expected = totals.get(name) - reserved.get(name).copied().unwrap_or(0.0);
                prop_assert!(available >= -1e-9, "{name} went negative: {available}");
                prop_assert!(
                    (available - expected).abs() < 1e-6,
                    "{name}: available {available}, expected {expected}"
                );
            }
        }
    }

    /// Once a job state is terminal, no later update changes it.
    #[test]
    fn terminal_states_are_monotonic(
        updates in proptest::collection::vec(
            proptest::sample::select(vec![
                ProcessStateEnum::RunRequested,
                ProcessStateEnum::Running,
                ProcessStateEnum::Succeeded,
                ProcessStateEnum::RunRequestFailed,
                ProcessStateEnum::PythonException,
                ProcessStateEnum::NonZeroReturnCode,
                ProcessStateEnum::ResourcesNotAvailable,
                ProcessStateEnum::ErrorGettingState,
            ]),
            1..24,
        )
    ) {
        let mut registry = JobRegistry::new();
        registry.add_job(command_job("j1", 1.0, &[])).unwrap();

        let mut settled: Option<ProcessStateEnum> = None;
        for update in updates {
            registry.update_job_state("j1", state_of(update));
            let current = registry.get("j1").unwrap().reported_state().state();
            match settled {
                Some(terminal) => prop_assert_eq!(current, terminal),
                None if is_terminal(current) => settled = Some(current),
                None => {}
            }
        }
    }

    /// Two submissions with the same id yield (ADDED, IS_DUPLICATE) in
    /// either order; only one job exists afterwards.
    #[test]
    fn duplicate_submission_is_detected(priorities in proptest::collection::vec(0.5f32..50.0, 2)) {
        let mut registry = JobRegistry::new();
        let first = registry.add_job(command_job("j1", priorities[0], &[])).unwrap();
        let second = registry.add_job(command_job("j1", priorities[1], &[])).unwrap();
        prop_assert_eq!(first, AddJobResult::Added);
        prop_assert_eq!(second, AddJobResult::IsDuplicate);
        prop_assert_eq!(registry.len(), 1);
        // The stored job keeps the first submission's contents.
        let stored = registry.get("j1").unwrap();
        prop_assert_eq!(stored.job.priority, priorities[0]);
    }

    /// The longest matching URL prefix wins credential lookup.
    #[test]
    fn credential_lookup_prefers_longer_prefixes(suffix in "[a-z]{1,12}") {
        use gridlet::credentials::CredentialStore;
        use gridlet::proto::add_credentials_request::Source;
        use gridlet::proto::credentials::{Service, Type};
        use gridlet::proto::ServerAvailableFile;

        let file = |path: &str| Source::ServerAvailableFile(ServerAvailableFile {
            credentials_type: Type::SshKey as i32,
            path: path.to_string(),
        });

        let mut store = CredentialStore::new();
        store.add(Service::Git, "host/".to_string(), file("broad"));
        store.add(Service::Git, format!("host/{suffix}"), file("narrow"));

        let url = format!("host/{suffix}/repo.git");
        match store.find(Service::Git, &url).unwrap() {
            Source::ServerAvailableFile(found) => prop_assert_eq!(&found.path, "narrow"),
            _ => prop_assert!(false, "expected the file source"),
        }
    }
}
