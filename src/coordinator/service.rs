//! The network-facing request router. All mutating operations go through
//! the registry/ledger locks (always acquired jobs before ledger, then
//! credentials); reads tolerate one-tick staleness.

use tonic::{Request, Response, Status};

use crate::coordinator::CoordinatorState;
use crate::credentials::{docker_registry_url, resolve_source};
use crate::deployment;
use crate::error::GridError;
use crate::proto;
use crate::proto::add_job_response::AddJobState;
use crate::proto::credentials::Service as CredentialService;
use crate::proto::health_check_response::ServingStatus;
use crate::proto::meadow_grid_coordinator_server::MeadowGridCoordinator;
use crate::registry::grid::Dequeued;
use crate::registry::job::{AddJobResult, JobKind};
use crate::resources::Resources;
use crate::scheduler::{fail_agent_work, RegisterOutcome};
use crate::states::{is_failure, is_terminal};

/// Marker task ids returned by update_grid_task_state_and_get_next.
pub const GRID_QUEUE_CLOSED: i32 = -1;
pub const GRID_NO_TASK_AVAILABLE: i32 = -2;

pub struct CoordinatorService {
    state: CoordinatorState,
}

impl CoordinatorService {
    pub fn new(state: CoordinatorState) -> Self {
        Self { state }
    }

    /// Rewrites a branch deployment to the commit it points at right now,
    /// so reruns of the stored job are deterministic. When the repo cannot
    /// be reached the branch is left in place for the agent to resolve.
    async fn pin_git_branch(&self, job: &mut proto::Job) {
        let Some(proto::job::CodeDeployment::GitRepoBranch(branch)) = job.code_deployment.clone()
        else {
            return;
        };
        let credentials = self
            .lookup_credentials(CredentialService::Git, &branch.repo_url)
            .await;
        match deployment::resolve_git_branch(&branch.repo_url, &branch.branch, credentials.as_ref())
            .await
        {
            Ok(commit) => {
                tracing::info!(
                    job_id = %job.job_id,
                    branch = %branch.branch,
                    commit = %commit,
                    "Pinned git branch at submission"
                );
                job.code_deployment =
                    Some(proto::job::CodeDeployment::GitRepoCommit(proto::GitRepoCommit {
                        repo_url: branch.repo_url.clone(),
                        commit,
                        path_in_repo: branch.path_in_repo.clone(),
                    }));
            }
            Err(e) => {
                tracing::warn!(
                    job_id = %job.job_id,
                    error = %e,
                    "Could not pin git branch at submission; the agent will resolve it"
                );
            }
        }
    }

    async fn lookup_credentials(
        &self,
        service: CredentialService,
        url: &str,
    ) -> Option<proto::Credentials> {
        let source = self.state.credentials.read().await.find(service, url).cloned()?;
        match resolve_source(&source).await {
            Ok(credentials) => Some(credentials),
            Err(e) => {
                tracing::warn!(url, error = %e, "Could not resolve credentials");
                None
            }
        }
    }

    /// The credentials an agent needs to carry out a job's deployments.
    async fn deployment_credentials(
        &self,
        job: &proto::Job,
    ) -> (Option<proto::Credentials>, Option<proto::Credentials>) {
        use proto::job::{CodeDeployment, InterpreterDeployment};
        let interpreter = match &job.interpreter_deployment {
            Some(InterpreterDeployment::ContainerAtDigest(c)) => Some(c.repository.as_str()),
            Some(InterpreterDeployment::ContainerAtTag(c)) => Some(c.repository.as_str()),
            _ => None,
        };
        let interpreter_credentials = match interpreter {
            Some(repository) => {
                self.lookup_credentials(CredentialService::Docker, docker_registry_url(repository))
                    .await
            }
            None => None,
        };
        let code = match &job.code_deployment {
            Some(CodeDeployment::GitRepoCommit(c)) => Some(c.repo_url.as_str()),
            Some(CodeDeployment::GitRepoBranch(c)) => Some(c.repo_url.as_str()),
            _ => None,
        };
        let code_credentials = match code {
            Some(repo_url) => {
                self.lookup_credentials(CredentialService::Git, repo_url)
                    .await
            }
            None => None,
        };
        (interpreter_credentials, code_credentials)
    }
}

fn grid_error_status(error: GridError) -> Status {
    match error {
        GridError::InvalidJob(_) => Status::invalid_argument(error.to_string()),
        GridError::JobNotFound(_) | GridError::AgentNotFound(_) | GridError::GridWorkerNotFound(_) => {
            Status::not_found(error.to_string())
        }
        GridError::GridJobClosed(_) => Status::failed_precondition(error.to_string()),
        _ => Status::internal(error.to_string()),
    }
}

#[tonic::async_trait]
impl MeadowGridCoordinator for CoordinatorService {
    async fn add_job(
        &self,
        request: Request<proto::Job>,
    ) -> Result<Response<proto::AddJobResponse>, Status> {
        let mut job = request.into_inner();
        self.pin_git_branch(&mut job).await;

        let result = self.state.jobs.write().await.add_job(job);
        match result {
            Ok(AddJobResult::Added) => {
                self.state.wake.notify_one();
                Ok(Response::new(proto::AddJobResponse {
                    state: AddJobState::Added as i32,
                }))
            }
            Ok(AddJobResult::IsDuplicate) => Ok(Response::new(proto::AddJobResponse {
                state: AddJobState::IsDuplicate as i32,
            })),
            Err(e) => Err(grid_error_status(e)),
        }
    }

    async fn add_tasks_to_grid_job(
        &self,
        request: Request<proto::AddTasksToGridJobRequest>,
    ) -> Result<Response<proto::AddJobResponse>, Status> {
        let req = request.into_inner();
        {
            let mut jobs = self.state.jobs.write().await;
            let record = jobs
                .get_mut(&req.job_id)
                .ok_or_else(|| Status::not_found(format!("job not found: {}", req.job_id)))?;
            let grid = record
                .grid_mut()
                .ok_or_else(|| Status::invalid_argument(format!("{} is not a grid job", req.job_id)))?;
            grid.append_tasks(&req.job_id, req.tasks, req.all_tasks_added)
                .map_err(grid_error_status)?;
        }
        self.state.wake.notify_one();
        Ok(Response::new(proto::AddJobResponse {
            state: AddJobState::Added as i32,
        }))
    }

    async fn get_simple_job_states(
        &self,
        request: Request<proto::JobStatesRequest>,
    ) -> Result<Response<proto::ProcessStates>, Status> {
        let req = request.into_inner();
        let jobs = self.state.jobs.read().await;
        Ok(Response::new(proto::ProcessStates {
            process_states: jobs.simple_job_states(&req.job_ids),
        }))
    }

    async fn get_grid_task_states(
        &self,
        request: Request<proto::GridTaskStatesRequest>,
    ) -> Result<Response<proto::GridTaskStatesResponse>, Status> {
        let req = request.into_inner();
        let jobs = self.state.jobs.read().await;
        let record = jobs
            .get(&req.job_id)
            .ok_or_else(|| Status::not_found(format!("job not found: {}", req.job_id)))?;
        let grid = record
            .grid()
            .ok_or_else(|| Status::invalid_argument(format!("{} is not a grid job", req.job_id)))?;
        let ignore = req.task_ids_to_ignore.iter().copied().collect();
        Ok(Response::new(proto::GridTaskStatesResponse {
            task_states: grid.states(&ignore),
        }))
    }

    async fn add_credentials(
        &self,
        request: Request<proto::AddCredentialsRequest>,
    ) -> Result<Response<proto::AddCredentialsResponse>, Status> {
        let req = request.into_inner();
        let service = req.service();
        if service == CredentialService::DefaultService {
            return Err(Status::invalid_argument("a credential service is required"));
        }
        if req.service_url.is_empty() {
            return Err(Status::invalid_argument("a service url is required"));
        }
        let source = req
            .source
            .ok_or_else(|| Status::invalid_argument("a credential source is required"))?;
        self.state
            .credentials
            .write()
            .await
            .add(service, req.service_url, source);
        Ok(Response::new(proto::AddCredentialsResponse {}))
    }

    async fn get_agent_states(
        &self,
        _request: Request<proto::AgentStatesRequest>,
    ) -> Result<Response<proto::AgentStatesResponse>, Status> {
        let ledger = self.state.ledger.read().await;
        let agents = ledger
            .snapshot()
            .into_iter()
            .map(|a| proto::AgentStateResponse {
                agent_id: a.agent_id,
                total_resources: a.total_resources.to_proto(),
                available_resources: a.available_resources.to_proto(),
            })
            .collect();
        Ok(Response::new(proto::AgentStatesResponse { agents }))
    }

    async fn register_agent(
        &self,
        request: Request<proto::RegisterAgentRequest>,
    ) -> Result<Response<proto::RegisterAgentResponse>, Status> {
        let req = request.into_inner();
        if req.agent_id.is_empty() {
            return Err(Status::invalid_argument("an agent id is required"));
        }
        let totals = Resources::from_proto(&req.resources).map_err(grid_error_status)?;
        let affinity = if req.job_id.is_empty() {
            None
        } else {
            Some(req.job_id.clone())
        };
        {
            let mut jobs = self.state.jobs.write().await;
            let mut ledger = self.state.ledger.write().await;
            if ledger.register(&req.agent_id, totals, affinity) == RegisterOutcome::Restarted {
                // The agent restarted: whatever it was running is lost.
                fail_agent_work(&mut jobs, &req.agent_id);
            }
        }
        self.state.wake.notify_one();
        Ok(Response::new(proto::RegisterAgentResponse {}))
    }

    async fn get_next_jobs(
        &self,
        request: Request<proto::NextJobsRequest>,
    ) -> Result<Response<proto::NextJobsResponse>, Status> {
        let req = request.into_inner();
        let mut picked_up: Vec<(proto::Job, Option<String>)> = Vec::new();
        {
            let mut jobs = self.state.jobs.write().await;
            let mut ledger = self.state.ledger.write().await;
            if !ledger.heartbeat(&req.agent_id) {
                return Err(Status::failed_precondition(format!(
                    "agent not registered: {}",
                    req.agent_id
                )));
            }
            for pending in ledger.take_pending_workers(&req.agent_id) {
                let Some(record) = jobs.get_mut(&pending.job_id) else {
                    tracing::warn!(job_id = %pending.job_id, "Pending worker for unknown job");
                    continue;
                };
                let resources = record.resources_required.clone();
                match (&mut record.kind, pending.grid_worker_id) {
                    (JobKind::Grid(grid), Some(grid_worker_id)) => {
                        let Some(worker) = grid.workers.get_mut(&grid_worker_id) else {
                            // The worker was dropped (e.g. the job failed)
                            // between scheduling and pickup.
                            ledger.release(&req.agent_id, &resources);
                            continue;
                        };
                        worker.is_pending = false;
                        picked_up.push((record.job.clone(), Some(grid_worker_id)));
                    }
                    (JobKind::Simple(simple), None) => {
                        if is_terminal(simple.state.state()) {
                            simple.worker = None;
                            ledger.release(&req.agent_id, &resources);
                            continue;
                        }
                        picked_up.push((record.job.clone(), None));
                    }
                    _ => {
                        tracing::error!(job_id = %pending.job_id, "Mismatched pending worker kind");
                    }
                }
            }
        }

        // Resolve credentials outside the registry/ledger locks.
        let mut jobs_to_run = Vec::with_capacity(picked_up.len());
        for (job, grid_worker_id) in picked_up {
            let (interpreter_credentials, code_credentials) =
                self.deployment_credentials(&job).await;
            jobs_to_run.push(proto::JobToRun {
                job: Some(job),
                grid_worker_id: grid_worker_id.unwrap_or_default(),
                interpreter_deployment_credentials: interpreter_credentials,
                code_deployment_credentials: code_credentials,
            });
        }
        Ok(Response::new(proto::NextJobsResponse { jobs_to_run }))
    }

    async fn update_job_states(
        &self,
        request: Request<proto::JobStateUpdates>,
    ) -> Result<Response<proto::UpdateStateResponse>, Status> {
        let req = request.into_inner();
        let mut released_resources = false;
        {
            let mut jobs = self.state.jobs.write().await;
            let mut ledger = self.state.ledger.write().await;
            ledger.heartbeat(&req.agent_id);

            for update in req.job_states {
                let Some(state) = update.process_state else {
                    tracing::warn!(job_id = %update.job_id, "State update without a state");
                    continue;
                };
                if update.grid_worker_id.is_empty() {
                    released_resources |=
                        apply_simple_update(&mut jobs, &mut ledger, &update.job_id, state);
                } else {
                    released_resources |= apply_grid_worker_update(
                        &mut jobs,
                        &mut ledger,
                        &update.job_id,
                        &update.grid_worker_id,
                        state,
                    );
                }
            }
        }
        if released_resources {
            self.state.wake.notify_one();
        }
        Ok(Response::new(proto::UpdateStateResponse {}))
    }

    async fn update_grid_task_state_and_get_next(
        &self,
        request: Request<proto::GridTaskUpdateAndGetNextRequest>,
    ) -> Result<Response<proto::GridTask>, Status> {
        let req = request.into_inner();
        let mut jobs = self.state.jobs.write().await;
        let mut ledger = self.state.ledger.write().await;

        let record = jobs
            .get_mut(&req.job_id)
            .ok_or_else(|| Status::not_found(format!("job not found: {}", req.job_id)))?;
        let resources = record.resources_required.clone();
        let grid = record
            .grid_mut()
            .ok_or_else(|| Status::invalid_argument(format!("{} is not a grid job", req.job_id)))?;

        let agent_id = {
            let worker = grid.workers.get_mut(&req.grid_worker_id).ok_or_else(|| {
                Status::not_found(format!("grid worker not found: {}", req.grid_worker_id))
            })?;
            worker.is_pending = false;
            worker.agent_id.clone()
        };
        ledger.heartbeat(&agent_id);

        if req.task_id >= 0 {
            let state = req
                .process_state
                .ok_or_else(|| Status::invalid_argument("a task state update needs a state"))?;
            grid.update_task(&req.job_id, req.task_id, state);
            if let Some(worker) = grid.workers.get_mut(&req.grid_worker_id) {
                if worker.current_task == Some(req.task_id) {
                    worker.current_task = None;
                }
            }
        }

        let response = match grid.dequeue(&req.grid_worker_id) {
            Dequeued::Task(task) => task,
            Dequeued::Empty => proto::GridTask {
                task_id: GRID_NO_TASK_AVAILABLE,
                pickled_function_arguments: Vec::new(),
            },
            Dequeued::Closed => {
                // The worker is done; its reservation goes back to the agent.
                grid.workers.remove(&req.grid_worker_id);
                ledger.release(&agent_id, &resources);
                self.state.wake.notify_one();
                proto::GridTask {
                    task_id: GRID_QUEUE_CLOSED,
                    pickled_function_arguments: Vec::new(),
                }
            }
        };
        Ok(Response::new(response))
    }

    async fn check(
        &self,
        request: Request<proto::HealthCheckRequest>,
    ) -> Result<Response<proto::HealthCheckResponse>, Status> {
        let service = request.into_inner().service;
        let status = if service.is_empty() || service == "meadowgrid.MeadowGridCoordinator" {
            ServingStatus::Serving
        } else {
            ServingStatus::ServiceUnknown
        };
        Ok(Response::new(proto::HealthCheckResponse {
            status: status as i32,
        }))
    }
}

/// Applies an agent's state report for a non-grid job. Returns true when
/// resources were released.
fn apply_simple_update(
    jobs: &mut crate::registry::JobRegistry,
    ledger: &mut crate::scheduler::ResourceLedger,
    job_id: &str,
    state: proto::ProcessState,
) -> bool {
    let owner = match jobs.get(job_id) {
        Some(record) => match &record.kind {
            JobKind::Simple(simple) => simple.worker.clone(),
            JobKind::Grid(_) => {
                tracing::warn!(job_id, "Plain state update for a grid job");
                return false;
            }
        },
        None => {
            tracing::warn!(job_id, "State update for unknown job");
            return false;
        }
    };
    let became_terminal = jobs.update_job_state(job_id, state);
    if !became_terminal {
        return false;
    }
    if let Some(record) = jobs.get_mut(job_id) {
        let resources = record.resources_required.clone();
        if let JobKind::Simple(simple) = &mut record.kind {
            simple.worker = None;
        }
        if let Some(worker) = owner {
            ledger.release(&worker.agent_id, &resources);
            return true;
        }
    }
    false
}

/// Applies an agent's state report about a grid worker. The agent does not
/// know which task the worker was on, so failures fold into the worker's
/// current task when it has one and otherwise consume-and-fail the next
/// unassigned task, so e.g. an unpullable container surfaces as a task
/// failure. Returns true when resources were released.
fn apply_grid_worker_update(
    jobs: &mut crate::registry::JobRegistry,
    ledger: &mut crate::scheduler::ResourceLedger,
    job_id: &str,
    grid_worker_id: &str,
    state: proto::ProcessState,
) -> bool {
    let Some(record) = jobs.get_mut(job_id) else {
        tracing::warn!(job_id, "State update for unknown job");
        return false;
    };
    let resources = record.resources_required.clone();
    let Some(grid) = record.grid_mut() else {
        tracing::warn!(job_id, grid_worker_id, "Grid worker update for a non-grid job");
        return false;
    };

    let state_enum = state.state();
    if !is_terminal(state_enum) {
        // A worker launching or running is not news; task updates arrive via
        // update_grid_task_state_and_get_next.
        return false;
    }
    let Some(worker) = grid.workers.remove(grid_worker_id) else {
        // Typical for a clean exit: the worker record was already removed
        // when the closed-queue marker was handed out.
        tracing::debug!(job_id, grid_worker_id, "Update for an already-removed grid worker");
        return false;
    };

    if is_failure(state_enum) {
        if let Some(task_id) = worker.current_task {
            grid.update_task(job_id, task_id, state);
        } else {
            match grid.dequeue(grid_worker_id) {
                Dequeued::Task(task) => {
                    grid.update_task(job_id, task.task_id, state);
                }
                _ => {
                    tracing::info!(
                        job_id,
                        grid_worker_id,
                        "Ignoring grid worker failure: no unassigned tasks left"
                    );
                }
            }
        }
    }

    ledger.release(&worker.agent_id, &resources);
    true
}
