pub mod assigner;
pub mod ledger;

pub use assigner::{fail_agent_work, run_scheduling_pass};
pub use ledger::{AgentSnapshot, PendingWorker, RegisterOutcome, ResourceLedger};
