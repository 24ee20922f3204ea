//! The agent: registers with the coordinator, polls for work, launches
//! processes or containers, and streams state transitions back.

pub mod runner;

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::client::CoordinatorClient;
use crate::config::AgentConfig;
use crate::coordinator::service::{GRID_NO_TASK_AVAILABLE, GRID_QUEUE_CLOSED};
use crate::deployment;
use crate::error::{GridError, Result};
use crate::proto;
use crate::proto::process_state::ProcessStateEnum;
use crate::resources::Resources;
use runner::{
    finish_simple_job, serialize_failure, GridWorkerChild, JobPayload, LaunchSpec, TaskOutcome,
};

/// Upper bound on resolving a job's deployments (git fetches, image pulls).
const DEPLOYMENT_TIMEOUT: Duration = Duration::from_secs(600);

pub async fn run_agent(config: AgentConfig, shutdown: CancellationToken) -> Result<()> {
    for folder in ["git_repos", "local_copies", "job_logs", "io"] {
        tokio::fs::create_dir_all(config.working_folder.join(folder)).await?;
    }

    let resources = Resources::new(config.resources.clone())?;
    let mut client = CoordinatorClient::connect(config.coordinator_address.clone()).await?;
    client
        .register_agent(&config.agent_id, &resources, config.job_id.as_deref())
        .await?;
    tracing::info!(
        agent_id = %config.agent_id,
        job_affinity = ?config.job_id,
        "Agent registered with coordinator"
    );

    let mut poll = tokio::time::interval(Duration::from_millis(config.poll_interval_ms));
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = poll.tick() => {}
        }

        let jobs_to_run = match client
            .get_next_jobs(&config.agent_id, config.job_id.as_deref())
            .await
        {
            Ok(jobs_to_run) => jobs_to_run,
            Err(e) => {
                tracing::warn!(error = %e, "Polling the coordinator failed");
                continue;
            }
        };

        for job_to_run in jobs_to_run {
            let client = client.clone();
            let config = config.clone();
            tokio::spawn(async move {
                run_assigned_job(client, config, job_to_run).await;
            });
        }
    }
    Ok(())
}

async fn run_assigned_job(
    mut client: CoordinatorClient,
    config: AgentConfig,
    mut job_to_run: proto::JobToRun,
) {
    let Some(job) = job_to_run.job.take() else {
        tracing::error!("JobToRun without a job");
        return;
    };
    let job_id = job.job_id.clone();
    let grid_worker_id = if job_to_run.grid_worker_id.is_empty() {
        None
    } else {
        Some(job_to_run.grid_worker_id.clone())
    };

    let prepared = tokio::time::timeout(
        DEPLOYMENT_TIMEOUT,
        prepare_launch(&config, job, &job_to_run),
    )
    .await
    .unwrap_or_else(|_| {
        Err(GridError::Deployment(
            "timed out resolving deployments".to_string(),
        ))
    });
    let spec = match prepared {
        Ok(spec) => spec,
        Err(e) => {
            tracing::warn!(job_id = %job_id, error = %e, "Deployment failed");
            let state = proto::ProcessState {
                state: ProcessStateEnum::RunRequestFailed as i32,
                pickled_result: serialize_failure("deployment", &e.to_string()),
                ..Default::default()
            };
            report_state(&mut client, &config, &job_id, grid_worker_id.as_deref(), state).await;
            return;
        }
    };

    match grid_worker_id {
        Some(grid_worker_id) => {
            run_grid_worker(client, config, spec, &job_id, &grid_worker_id).await;
        }
        None => run_simple_job(client, config, spec, &job_id).await,
    }
}

/// Resolves the job's code and interpreter deployments into something
/// launchable.
async fn prepare_launch(
    config: &AgentConfig,
    job: proto::Job,
    job_to_run: &proto::JobToRun,
) -> Result<LaunchSpec> {
    let code = match &job.code_deployment {
        Some(code_deployment) => Some(
            deployment::resolve_code(
                &config.working_folder,
                code_deployment,
                job_to_run.code_deployment_credentials.as_ref(),
            )
            .await?,
        ),
        None => None,
    };
    let interpreter_deployment = job
        .interpreter_deployment
        .as_ref()
        .ok_or_else(|| GridError::InvalidJob("job has no interpreter deployment".to_string()))?;
    let interpreter = deployment::resolve_interpreter(
        interpreter_deployment,
        job_to_run.interpreter_deployment_credentials.as_ref(),
    )
    .await?;
    Ok(LaunchSpec {
        working_folder: config.working_folder.clone(),
        job,
        code,
        interpreter,
    })
}

async fn report_state(
    client: &mut CoordinatorClient,
    config: &AgentConfig,
    job_id: &str,
    grid_worker_id: Option<&str>,
    state: proto::ProcessState,
) {
    let update = proto::JobStateUpdate {
        job_id: job_id.to_string(),
        grid_worker_id: grid_worker_id.unwrap_or_default().to_string(),
        process_state: Some(state),
    };
    if let Err(e) = client
        .update_job_states(&config.agent_id, config.job_id.as_deref(), vec![update])
        .await
    {
        tracing::warn!(job_id, error = %e, "Could not report job state");
    }
}

async fn run_simple_job(
    mut client: CoordinatorClient,
    config: AgentConfig,
    spec: LaunchSpec,
    job_id: &str,
) {
    let payload = match &spec.job.job_spec {
        Some(proto::job::JobSpec::PyCommand(command)) => JobPayload::Command(command),
        Some(proto::job::JobSpec::PyFunction(function)) => JobPayload::Function(function),
        _ => {
            tracing::error!(job_id, "Simple job without a command or function spec");
            return;
        }
    };

    let (launched, io) = match spec.launch(payload).await {
        Ok(launched) => launched,
        Err(e) => {
            let state = proto::ProcessState {
                state: ProcessStateEnum::RunRequestFailed as i32,
                pickled_result: serialize_failure("launch", &e.to_string()),
                ..Default::default()
            };
            report_state(&mut client, &config, job_id, None, state).await;
            return;
        }
    };

    report_state(&mut client, &config, job_id, None, launched.running_state()).await;
    let final_state = finish_simple_job(launched, &io).await;
    tracing::info!(job_id, state = ?final_state.state(), "Job finished");
    report_state(&mut client, &config, job_id, None, final_state).await;
}

/// One worker per (agent, grid job): a single child process consumes many
/// tasks through the frame protocol, pulling each from the coordinator
/// until it hands out the closed-queue marker.
async fn run_grid_worker(
    mut client: CoordinatorClient,
    config: AgentConfig,
    spec: LaunchSpec,
    job_id: &str,
    grid_worker_id: &str,
) {
    let Some(proto::job::JobSpec::PyGrid(grid)) = &spec.job.job_spec else {
        tracing::error!(job_id, "Grid worker for a job without a grid spec");
        return;
    };

    let launched = match spec.launch(JobPayload::GridWorker(grid)).await {
        Ok((launched, _io)) => launched,
        Err(e) => {
            // Reported as a worker failure; the coordinator folds it into a
            // task so users see it.
            let state = proto::ProcessState {
                state: ProcessStateEnum::RunRequestFailed as i32,
                pickled_result: serialize_failure("launch", &e.to_string()),
                ..Default::default()
            };
            report_state(&mut client, &config, job_id, Some(grid_worker_id), state).await;
            return;
        }
    };
    report_state(
        &mut client,
        &config,
        job_id,
        Some(grid_worker_id),
        launched.running_state(),
    )
    .await;

    let mut child = match GridWorkerChild::new(launched) {
        Ok(child) => child,
        Err(e) => {
            let state = proto::ProcessState {
                state: ProcessStateEnum::RunRequestFailed as i32,
                pickled_result: serialize_failure("launch", &e.to_string()),
                ..Default::default()
            };
            report_state(&mut client, &config, job_id, Some(grid_worker_id), state).await;
            return;
        }
    };

    let mut completed_task_id = -1;
    let mut completed_state: Option<proto::ProcessState> = None;
    let final_state = loop {
        let task = match client
            .update_grid_task_state_and_get_next(
                job_id,
                grid_worker_id,
                completed_task_id,
                completed_state.take(),
            )
            .await
        {
            Ok(task) => task,
            Err(e) => {
                tracing::warn!(job_id, error = %e, "Task poll failed");
                break child.fail().await;
            }
        };
        completed_task_id = -1;

        if task.task_id == GRID_QUEUE_CLOSED {
            break child.finish().await;
        }
        if task.task_id == GRID_NO_TASK_AVAILABLE {
            tokio::time::sleep(Duration::from_millis(config.poll_interval_ms)).await;
            continue;
        }

        match child.run_task(&task.pickled_function_arguments).await {
            Ok(TaskOutcome::Result(result)) => {
                completed_task_id = task.task_id;
                completed_state = Some(proto::ProcessState {
                    state: ProcessStateEnum::Succeeded as i32,
                    pid: child.launched.pid,
                    container_id: child.launched.container_id.clone(),
                    log_file_name: child.launched.log_file_name.clone(),
                    pickled_result: result,
                    ..Default::default()
                });
            }
            Ok(TaskOutcome::Exception(exception)) => {
                completed_task_id = task.task_id;
                completed_state = Some(proto::ProcessState {
                    state: ProcessStateEnum::PythonException as i32,
                    pid: child.launched.pid,
                    container_id: child.launched.container_id.clone(),
                    log_file_name: child.launched.log_file_name.clone(),
                    pickled_result: exception,
                    ..Default::default()
                });
            }
            Err(e) => {
                tracing::warn!(
                    job_id,
                    task_id = task.task_id,
                    error = %e,
                    "Grid worker child broke mid-task"
                );
                // The worker-level report lets the coordinator fail the task
                // the child was holding.
                break child.fail().await;
            }
        }
    };

    tracing::info!(
        job_id,
        grid_worker_id,
        state = ?final_state.state(),
        "Grid worker exited"
    );
    report_state(
        &mut client,
        &config,
        job_id,
        Some(grid_worker_id),
        final_state,
    )
    .await;
}
