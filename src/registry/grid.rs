//! Per-grid-job task queue and worker bookkeeping.
//!
//! Tasks are dequeued in arrival order. A task handed to a grid worker is
//! owned by that worker until it reaches a terminal state; terminal task
//! states are write-once.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use crate::error::{GridError, Result};
use crate::proto;
use crate::proto::process_state::ProcessStateEnum;
use crate::states::{bare_state, is_failure, is_terminal};

#[derive(Debug, Clone)]
pub struct GridTaskRecord {
    pub task_id: i32,
    pub pickled_function_arguments: Vec<u8>,
    pub state: proto::ProcessState,
    /// The grid worker that owns this task, once dequeued.
    pub worker_id: Option<String>,
}

/// A grid worker as the coordinator sees it: an agent's execution context for
/// one grid job. The id is minted by the coordinator; it is not a host
/// process identifier.
#[derive(Debug, Clone)]
pub struct GridWorkerRecord {
    pub grid_worker_id: String,
    pub agent_id: String,
    /// The task this worker is currently working on, if any.
    pub current_task: Option<i32>,
    /// True until the owning agent picks the worker up on its next poll.
    pub is_pending: bool,
}

pub enum Dequeued {
    Task(proto::GridTask),
    /// Nothing available right now, but more tasks may still arrive.
    Empty,
    /// The queue is closed and drained; the worker should exit.
    Closed,
}

#[derive(Debug, Default)]
pub struct GridJobState {
    tasks: BTreeMap<i32, GridTaskRecord>,
    unassigned: VecDeque<i32>,
    all_tasks_added: bool,
    pub workers: HashMap<String, GridWorkerRecord>,
}

impl GridJobState {
    pub fn is_closed(&self) -> bool {
        self.all_tasks_added
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn unassigned_count(&self) -> usize {
        self.unassigned.len()
    }

    /// Workers that exist but are not currently working on a task. These
    /// already cover some of the unassigned demand.
    pub fn idle_worker_count(&self) -> usize {
        self.workers
            .values()
            .filter(|w| w.current_task.is_none())
            .count()
    }

    /// How many additional workers this job could use right now.
    pub fn workers_needed(&self) -> usize {
        self.unassigned
            .len()
            .saturating_sub(self.idle_worker_count())
    }

    pub fn has_worker_on_agent(&self, agent_id: &str) -> bool {
        self.workers.values().any(|w| w.agent_id == agent_id)
    }

    pub fn append_tasks(
        &mut self,
        job_id: &str,
        tasks: Vec<proto::GridTask>,
        all_tasks_added: bool,
    ) -> Result<()> {
        if self.all_tasks_added {
            return Err(GridError::GridJobClosed(job_id.to_string()));
        }
        for task in &tasks {
            if task.task_id < 0 {
                return Err(GridError::InvalidJob(format!(
                    "grid task id {} is negative",
                    task.task_id
                )));
            }
            if self.tasks.contains_key(&task.task_id) {
                return Err(GridError::InvalidJob(format!(
                    "grid task id {} already exists in job {job_id}",
                    task.task_id
                )));
            }
        }
        for task in tasks {
            self.unassigned.push_back(task.task_id);
            self.tasks.insert(
                task.task_id,
                GridTaskRecord {
                    task_id: task.task_id,
                    pickled_function_arguments: task.pickled_function_arguments,
                    state: bare_state(ProcessStateEnum::RunRequested),
                    worker_id: None,
                },
            );
        }
        if all_tasks_added {
            self.all_tasks_added = true;
        }
        Ok(())
    }

    /// Pops the next task in arrival order and hands it to `worker_id`.
    pub fn dequeue(&mut self, worker_id: &str) -> Dequeued {
        match self.unassigned.pop_front() {
            Some(task_id) => {
                let task = self
                    .tasks
                    .get_mut(&task_id)
                    .expect("unassigned task ids always exist in the task map");
                task.state = bare_state(ProcessStateEnum::RunRequested);
                task.worker_id = Some(worker_id.to_string());
                let dequeued = proto::GridTask {
                    task_id,
                    pickled_function_arguments: task.pickled_function_arguments.clone(),
                };
                if let Some(worker) = self.workers.get_mut(worker_id) {
                    worker.current_task = Some(task_id);
                }
                Dequeued::Task(dequeued)
            }
            None if self.all_tasks_added => Dequeued::Closed,
            None => Dequeued::Empty,
        }
    }

    /// Overwrites the task's state; terminal states are write-once. Returns
    /// false when the update was ignored.
    pub fn update_task(&mut self, job_id: &str, task_id: i32, state: proto::ProcessState) -> bool {
        let Some(task) = self.tasks.get_mut(&task_id) else {
            tracing::warn!(job_id, task_id, "State update for unknown grid task");
            return false;
        };
        let current = task.state.state();
        if is_terminal(current) && current != state.state() {
            tracing::warn!(
                job_id,
                task_id,
                current = ?current,
                requested = ?state.state(),
                "Ignoring state update for grid task already in a terminal state"
            );
            return false;
        }
        task.state = state;
        true
    }

    pub fn task(&self, task_id: i32) -> Option<&GridTaskRecord> {
        self.tasks.get(&task_id)
    }

    /// All task states except those in `ignore`. Clients poll incrementally
    /// with a growing ignore set.
    pub fn states(&self, ignore: &HashSet<i32>) -> Vec<proto::GridTaskState> {
        self.tasks
            .values()
            .filter(|t| !ignore.contains(&t.task_id))
            .map(|t| proto::GridTaskState {
                task_id: t.task_id,
                process_state: Some(t.state.clone()),
            })
            .collect()
    }

    /// The state reported for the grid job as a whole: RUNNING while the
    /// queue is open, any task is non-terminal, or workers still exist;
    /// otherwise SUCCEEDED when every task succeeded, or the first failing
    /// task's state.
    pub fn synthetic_state(&self) -> proto::ProcessState {
        if !self.all_tasks_added || !self.workers.is_empty() {
            return bare_state(ProcessStateEnum::Running);
        }
        let mut first_failure = None;
        for task in self.tasks.values() {
            let state = task.state.state();
            if !is_terminal(state) {
                return bare_state(ProcessStateEnum::Running);
            }
            if is_failure(state) && first_failure.is_none() {
                first_failure = Some(state);
            }
        }
        match first_failure {
            Some(state) => bare_state(state),
            None => bare_state(ProcessStateEnum::Succeeded),
        }
    }

    /// Fails every still-unassigned task, e.g. when no agent can ever fit
    /// the job. Tasks already running on a worker keep going.
    pub fn fail_unassigned_tasks(&mut self, state: &proto::ProcessState) {
        while let Some(task_id) = self.unassigned.pop_front() {
            if let Some(task) = self.tasks.get_mut(&task_id) {
                task.state = state.clone();
            }
        }
    }
}
