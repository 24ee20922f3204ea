//! Canonical store of submitted jobs and their states.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::error::{GridError, Result};
use crate::proto;
use crate::proto::process_state::ProcessStateEnum;
use crate::registry::grid::GridJobState;
use crate::resources::Resources;
use crate::states::{bare_state, is_terminal};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddJobResult {
    Added,
    IsDuplicate,
}

/// The single execution of a non-grid job on an agent.
#[derive(Debug, Clone)]
pub struct SimpleWorker {
    pub agent_id: String,
}

#[derive(Debug)]
pub struct SimpleJobState {
    pub state: proto::ProcessState,
    pub worker: Option<SimpleWorker>,
}

#[derive(Debug)]
pub enum JobKind {
    Simple(SimpleJobState),
    Grid(GridJobState),
}

#[derive(Debug)]
pub struct JobRecord {
    /// Immutable after submission; branch deployments are already resolved
    /// to commits.
    pub job: proto::Job,
    pub resources_required: Resources,
    /// Submission order, used to break scheduling ties.
    pub seq: u64,
    pub submitted_at: DateTime<Utc>,
    pub kind: JobKind,
}

impl JobRecord {
    pub fn is_grid(&self) -> bool {
        matches!(self.kind, JobKind::Grid(_))
    }

    pub fn grid(&self) -> Option<&GridJobState> {
        match &self.kind {
            JobKind::Grid(grid) => Some(grid),
            JobKind::Simple(_) => None,
        }
    }

    pub fn grid_mut(&mut self) -> Option<&mut GridJobState> {
        match &mut self.kind {
            JobKind::Grid(grid) => Some(grid),
            JobKind::Simple(_) => None,
        }
    }

    /// The state reported by get_simple_job_states for this job.
    pub fn reported_state(&self) -> proto::ProcessState {
        match &self.kind {
            JobKind::Simple(simple) => simple.state.clone(),
            JobKind::Grid(grid) => grid.synthetic_state(),
        }
    }

    /// Fails the whole job, e.g. when no agent can ever fit it. For grid
    /// jobs this fails the still-unassigned tasks; running tasks keep going.
    pub fn fail(&mut self, state: proto::ProcessState) {
        match &mut self.kind {
            JobKind::Simple(simple) => {
                if !is_terminal(simple.state.state()) {
                    simple.state = state;
                }
            }
            JobKind::Grid(grid) => grid.fail_unassigned_tasks(&state),
        }
    }
}

fn valid_job_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_')
}

fn validate(job: &proto::Job) -> Result<Resources> {
    if !valid_job_id(&job.job_id) {
        return Err(GridError::InvalidJob(format!(
            "job id {:?} may only contain letters, digits, '.', '-' and '_'",
            job.job_id
        )));
    }
    if !(job.priority > 0.0 && job.priority.is_finite()) {
        return Err(GridError::InvalidJob(format!(
            "priority must be a positive number, got {}",
            job.priority
        )));
    }
    if !(0.0..=100.0).contains(&job.interruption_probability_threshold) {
        return Err(GridError::InvalidJob(format!(
            "interruption probability threshold must be a percentage, got {}",
            job.interruption_probability_threshold
        )));
    }
    if job.code_deployment.is_none() {
        return Err(GridError::InvalidJob(
            "exactly one code deployment is required".to_string(),
        ));
    }
    if job.interpreter_deployment.is_none() {
        return Err(GridError::InvalidJob(
            "exactly one interpreter deployment is required".to_string(),
        ));
    }
    if job.job_spec.is_none() {
        return Err(GridError::InvalidJob("a job spec is required".to_string()));
    }
    Resources::from_proto(&job.resources_required)
}

#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: HashMap<String, JobRecord>,
    next_seq: u64,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates and inserts the job with state RUN_REQUESTED. A known
    /// job_id is a duplicate; its contents are not compared and no state is
    /// altered.
    pub fn add_job(&mut self, job: proto::Job) -> Result<AddJobResult> {
        let resources_required = validate(&job)?;
        if self.jobs.contains_key(&job.job_id) {
            tracing::debug!(job_id = %job.job_id, "Duplicate job submission");
            return Ok(AddJobResult::IsDuplicate);
        }

        let kind = match job.job_spec {
            Some(proto::job::JobSpec::PyGrid(_)) => JobKind::Grid(GridJobState::default()),
            _ => JobKind::Simple(SimpleJobState {
                state: bare_state(ProcessStateEnum::RunRequested),
                worker: None,
            }),
        };
        let seq = self.next_seq;
        self.next_seq += 1;
        tracing::info!(job_id = %job.job_id, grid = matches!(kind, JobKind::Grid(_)), "Job added");
        self.jobs.insert(
            job.job_id.clone(),
            JobRecord {
                job,
                resources_required,
                seq,
                submitted_at: Utc::now(),
                kind,
            },
        );
        Ok(AddJobResult::Added)
    }

    pub fn get(&self, job_id: &str) -> Option<&JobRecord> {
        self.jobs.get(job_id)
    }

    pub fn get_mut(&mut self, job_id: &str) -> Option<&mut JobRecord> {
        self.jobs.get_mut(job_id)
    }

    /// Per id: the job's own state for non-grid jobs, a synthetic state for
    /// grid jobs, UNKNOWN for ids never submitted.
    pub fn simple_job_states(&self, job_ids: &[String]) -> Vec<proto::ProcessState> {
        job_ids
            .iter()
            .map(|id| match self.jobs.get(id) {
                Some(record) => record.reported_state(),
                None => bare_state(ProcessStateEnum::Unknown),
            })
            .collect()
    }

    /// Updates a non-grid job's state. Only allowed while the current state
    /// is non-terminal, or when the new state equals it (idempotent retry);
    /// anything else is ignored and logged. Returns true when the state
    /// changed into a terminal state (the caller releases resources then).
    pub fn update_job_state(&mut self, job_id: &str, state: proto::ProcessState) -> bool {
        let Some(record) = self.jobs.get_mut(job_id) else {
            tracing::warn!(job_id, "State update for unknown job");
            return false;
        };
        let JobKind::Simple(simple) = &mut record.kind else {
            tracing::warn!(job_id, "Plain state update for a grid job");
            return false;
        };
        let current = simple.state.state();
        if is_terminal(current) {
            if current != state.state() {
                tracing::warn!(
                    job_id,
                    current = ?current,
                    requested = ?state.state(),
                    "Ignoring state update for job already in a terminal state"
                );
            }
            return false;
        }
        let became_terminal = is_terminal(state.state());
        tracing::info!(job_id, state = ?state.state(), "Job state updated");
        simple.state = state;
        became_terminal
    }

    pub fn iter(&self) -> impl Iterator<Item = &JobRecord> {
        self.jobs.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut JobRecord> {
        self.jobs.values_mut()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}
