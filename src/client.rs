//! A thin typed wrapper over the generated coordinator client, shared by
//! the agent and the one-shot runner.

use tonic::transport::Channel;

use crate::error::Result;
use crate::proto;
use crate::proto::meadow_grid_coordinator_client::MeadowGridCoordinatorClient;
use crate::resources::Resources;

#[derive(Clone)]
pub struct CoordinatorClient {
    inner: MeadowGridCoordinatorClient<Channel>,
}

impl CoordinatorClient {
    pub async fn connect(address: String) -> Result<Self> {
        let inner = MeadowGridCoordinatorClient::connect(address).await?;
        Ok(Self { inner })
    }

    pub async fn add_job(&mut self, job: proto::Job) -> Result<proto::AddJobResponse> {
        Ok(self.inner.add_job(job).await?.into_inner())
    }

    pub async fn add_tasks_to_grid_job(
        &mut self,
        job_id: &str,
        tasks: Vec<proto::GridTask>,
        all_tasks_added: bool,
    ) -> Result<proto::AddJobResponse> {
        let request = proto::AddTasksToGridJobRequest {
            job_id: job_id.to_string(),
            tasks,
            all_tasks_added,
        };
        Ok(self.inner.add_tasks_to_grid_job(request).await?.into_inner())
    }

    pub async fn get_simple_job_states(
        &mut self,
        job_ids: Vec<String>,
    ) -> Result<Vec<proto::ProcessState>> {
        let request = proto::JobStatesRequest { job_ids };
        Ok(self
            .inner
            .get_simple_job_states(request)
            .await?
            .into_inner()
            .process_states)
    }

    pub async fn get_grid_task_states(
        &mut self,
        job_id: &str,
        task_ids_to_ignore: Vec<i32>,
    ) -> Result<Vec<proto::GridTaskState>> {
        let request = proto::GridTaskStatesRequest {
            job_id: job_id.to_string(),
            task_ids_to_ignore,
        };
        Ok(self
            .inner
            .get_grid_task_states(request)
            .await?
            .into_inner()
            .task_states)
    }

    pub async fn add_credentials(
        &mut self,
        service: proto::credentials::Service,
        service_url: &str,
        source: proto::add_credentials_request::Source,
    ) -> Result<()> {
        let request = proto::AddCredentialsRequest {
            service: service as i32,
            service_url: service_url.to_string(),
            source: Some(source),
        };
        self.inner.add_credentials(request).await?;
        Ok(())
    }

    pub async fn get_agent_states(&mut self) -> Result<Vec<proto::AgentStateResponse>> {
        Ok(self
            .inner
            .get_agent_states(proto::AgentStatesRequest {})
            .await?
            .into_inner()
            .agents)
    }

    pub async fn register_agent(
        &mut self,
        agent_id: &str,
        resources: &Resources,
        job_id: Option<&str>,
    ) -> Result<()> {
        let request = proto::RegisterAgentRequest {
            agent_id: agent_id.to_string(),
            resources: resources.to_proto(),
            job_id: job_id.unwrap_or_default().to_string(),
        };
        self.inner.register_agent(request).await?;
        Ok(())
    }

    pub async fn get_next_jobs(
        &mut self,
        agent_id: &str,
        job_id: Option<&str>,
    ) -> Result<Vec<proto::JobToRun>> {
        let request = proto::NextJobsRequest {
            agent_id: agent_id.to_string(),
            job_id: job_id.unwrap_or_default().to_string(),
        };
        Ok(self
            .inner
            .get_next_jobs(request)
            .await?
            .into_inner()
            .jobs_to_run)
    }

    pub async fn update_job_states(
        &mut self,
        agent_id: &str,
        agent_job_id: Option<&str>,
        job_states: Vec<proto::JobStateUpdate>,
    ) -> Result<()> {
        let request = proto::JobStateUpdates {
            agent_id: agent_id.to_string(),
            agent_job_id: agent_job_id.unwrap_or_default().to_string(),
            job_states,
        };
        self.inner.update_job_states(request).await?;
        Ok(())
    }

    pub async fn update_grid_task_state_and_get_next(
        &mut self,
        job_id: &str,
        grid_worker_id: &str,
        task_id: i32,
        process_state: Option<proto::ProcessState>,
    ) -> Result<proto::GridTask> {
        let request = proto::GridTaskUpdateAndGetNextRequest {
            job_id: job_id.to_string(),
            grid_worker_id: grid_worker_id.to_string(),
            task_id,
            process_state,
        };
        Ok(self
            .inner
            .update_grid_task_state_and_get_next(request)
            .await?
            .into_inner())
    }

    pub async fn check(&mut self) -> Result<proto::HealthCheckResponse> {
        let request = proto::HealthCheckRequest {
            service: String::new(),
        };
        Ok(self.inner.check(request).await?.into_inner())
    }
}
