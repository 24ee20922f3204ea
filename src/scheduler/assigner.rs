//! The scheduling pass: decides which pending job gets a worker on which
//! agent next.
//!
//! Agents are considered tightest-fit-first so large agents stay free for
//! large jobs. Among the jobs that fit an agent, one is chosen with
//! probability proportional to its priority, so a job holding fraction p of
//! the total priority receives fraction p of the compute over time.

use rand::distributions::WeightedIndex;
use rand::prelude::*;

use crate::proto::process_state::ProcessStateEnum;
use crate::registry::grid::GridWorkerRecord;
use crate::registry::job::{JobKind, JobRecord, JobRegistry, SimpleWorker};
use crate::scheduler::ledger::{PendingWorker, ResourceLedger};
use crate::states::bare_state;

/// Whether this job wants a worker on this agent right now.
fn wants_worker_on(record: &JobRecord, agent_id: &str) -> bool {
    match &record.kind {
        JobKind::Simple(simple) => {
            simple.state.state() == ProcessStateEnum::RunRequested && simple.worker.is_none()
        }
        // At most one grid worker per agent per grid job.
        JobKind::Grid(grid) => grid.workers_needed() > 0 && !grid.has_worker_on_agent(agent_id),
    }
}

/// Whether this job still needs any worker anywhere.
fn needs_any_worker(record: &JobRecord) -> bool {
    match &record.kind {
        JobKind::Simple(simple) => {
            simple.state.state() == ProcessStateEnum::RunRequested && simple.worker.is_none()
        }
        JobKind::Grid(grid) => grid.unassigned_count() > 0,
    }
}

/// One full scheduling pass over all agents and pending jobs. Returns the
/// number of workers created.
pub fn run_scheduling_pass(jobs: &mut JobRegistry, ledger: &mut ResourceLedger) -> usize {
    let mut rng = rand::thread_rng();
    let mut workers_created = 0;

    // Tightest fit first: agents with the least free capacity are filled
    // before big agents get broken up.
    let mut agent_ids: Vec<(f64, String)> = ledger
        .iter()
        .map(|a| (a.available_resources.magnitude(), a.agent_id.clone()))
        .collect();
    agent_ids.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    for (_, agent_id) in agent_ids {
        loop {
            let Some(agent) = ledger.get(&agent_id) else {
                break;
            };
            // Earliest submission first so equal-priority picks lean toward
            // older jobs.
            let mut candidates: Vec<(u64, String, f32)> = jobs
                .iter()
                .filter(|record| {
                    agent.serves_job(&record.job.job_id)
                        && wants_worker_on(record, &agent_id)
                        && agent
                            .available_resources
                            .fits(&record.resources_required)
                })
                .map(|record| (record.seq, record.job.job_id.clone(), record.job.priority))
                .collect();
            if candidates.is_empty() {
                break;
            }
            candidates.sort_by_key(|(seq, _, _)| *seq);

            let weights: Vec<f64> = candidates.iter().map(|(_, _, p)| *p as f64).collect();
            let chosen = match WeightedIndex::new(&weights) {
                Ok(dist) => dist.sample(&mut rng),
                // All weights zero cannot happen (priority is validated
                // positive); fall back to the earliest submission.
                Err(_) => 0,
            };
            let job_id = candidates[chosen].1.clone();

            let record = jobs
                .get_mut(&job_id)
                .expect("candidate job ids come from the registry");
            if !ledger.reserve(&agent_id, &record.resources_required) {
                break;
            }

            let grid_worker_id = match &mut record.kind {
                JobKind::Simple(simple) => {
                    simple.worker = Some(SimpleWorker {
                        agent_id: agent_id.clone(),
                    });
                    None
                }
                JobKind::Grid(grid) => {
                    let grid_worker_id = uuid::Uuid::new_v4().to_string();
                    grid.workers.insert(
                        grid_worker_id.clone(),
                        GridWorkerRecord {
                            grid_worker_id: grid_worker_id.clone(),
                            agent_id: agent_id.clone(),
                            current_task: None,
                            is_pending: true,
                        },
                    );
                    Some(grid_worker_id)
                }
            };
            tracing::info!(
                job_id = %job_id,
                agent_id = %agent_id,
                grid_worker_id = ?grid_worker_id,
                "Worker assigned"
            );
            ledger.add_pending_worker(
                &agent_id,
                PendingWorker {
                    job_id,
                    grid_worker_id,
                },
            );
            workers_created += 1;
        }
    }

    fail_unsatisfiable_jobs(jobs, ledger);

    workers_created
}

/// Jobs that no registered agent could fit even when completely idle can
/// never run; they fail with RESOURCES_NOT_AVAILABLE. With no agents at all
/// a job stays pending, since agents may still register.
fn fail_unsatisfiable_jobs(jobs: &mut JobRegistry, ledger: &ResourceLedger) {
    if ledger.is_empty() {
        return;
    }
    for record in jobs.iter_mut() {
        if needs_any_worker(record)
            && !ledger.any_total_fits(&record.job.job_id, &record.resources_required)
        {
            tracing::warn!(
                job_id = %record.job.job_id,
                "No agent can ever fit this job; failing it"
            );
            record.fail(bare_state(ProcessStateEnum::ResourcesNotAvailable));
        }
    }
}

/// Declares all of an agent's in-flight work lost: every job and task it
/// owns moves to ERROR_GETTING_STATE (write-once rules still apply) and its
/// grid worker records are dropped. Returns how many jobs/tasks were failed.
///
/// The caller is responsible for the agent's ledger entry: either removing
/// it (agent lost) or having reset its availability (agent restart).
pub fn fail_agent_work(jobs: &mut JobRegistry, agent_id: &str) -> usize {
    let mut failed = 0;
    for record in jobs.iter_mut() {
        let job_id = record.job.job_id.clone();
        match &mut record.kind {
            JobKind::Simple(simple) => {
                let owned = simple
                    .worker
                    .as_ref()
                    .is_some_and(|w| w.agent_id == agent_id);
                if owned {
                    simple.worker = None;
                    if !crate::states::is_terminal(simple.state.state()) {
                        tracing::warn!(job_id = %job_id, agent_id, "Failing job owned by lost agent");
                        simple.state = bare_state(ProcessStateEnum::ErrorGettingState);
                        failed += 1;
                    }
                }
            }
            JobKind::Grid(grid) => {
                let worker_ids: Vec<String> = grid
                    .workers
                    .values()
                    .filter(|w| w.agent_id == agent_id)
                    .map(|w| w.grid_worker_id.clone())
                    .collect();
                for worker_id in worker_ids {
                    if let Some(worker) = grid.workers.remove(&worker_id) {
                        if let Some(task_id) = worker.current_task {
                            tracing::warn!(
                                job_id = %job_id,
                                task_id,
                                agent_id,
                                "Failing grid task owned by lost agent"
                            );
                            if grid.update_task(
                                &job_id,
                                task_id,
                                bare_state(ProcessStateEnum::ErrorGettingState),
                            ) {
                                failed += 1;
                            }
                        }
                    }
                }
            }
        }
    }
    failed
}
