//! The coordinator: the single logical process that accepts jobs and
//! assigns them to agents.

pub mod dashboard;
pub mod service;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, RwLock};
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;

use crate::config::CoordinatorConfig;
use crate::credentials::CredentialStore;
use crate::error::Result;
use crate::proto::meadow_grid_coordinator_server::MeadowGridCoordinatorServer;
use crate::registry::JobRegistry;
use crate::scheduler::{fail_agent_work, run_scheduling_pass, ResourceLedger};
use service::CoordinatorService;

/// Shared state behind the coordinator's RPC surface. Lock order everywhere
/// is jobs, then ledger, then credentials.
#[derive(Clone)]
pub struct CoordinatorState {
    pub jobs: Arc<RwLock<JobRegistry>>,
    pub ledger: Arc<RwLock<ResourceLedger>>,
    pub credentials: Arc<RwLock<CredentialStore>>,
    /// Wakes the scheduling loop: new submissions, agent registrations, and
    /// resource releases all notify here.
    pub wake: Arc<Notify>,
}

impl CoordinatorState {
    pub fn new(agent_timeout: Duration) -> Self {
        Self {
            jobs: Arc::new(RwLock::new(JobRegistry::new())),
            ledger: Arc::new(RwLock::new(ResourceLedger::new(agent_timeout))),
            credentials: Arc::new(RwLock::new(CredentialStore::new())),
            wake: Arc::new(Notify::new()),
        }
    }
}

pub struct CoordinatorServer {
    config: CoordinatorConfig,
    state: CoordinatorState,
}

impl CoordinatorServer {
    pub fn new(config: CoordinatorConfig) -> Self {
        let state = CoordinatorState::new(Duration::from_millis(config.agent_timeout_ms));
        Self { config, state }
    }

    pub fn state(&self) -> CoordinatorState {
        self.state.clone()
    }

    /// Runs the scheduling loop, the optional dashboard, and the gRPC
    /// server (which blocks until shutdown).
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let scheduler_state = self.state.clone();
        let sweep_interval = Duration::from_millis(self.config.sweep_interval_ms);
        let scheduler_shutdown = shutdown.clone();
        tokio::spawn(async move {
            scheduling_loop(scheduler_state, sweep_interval, scheduler_shutdown).await;
        });

        if let Some(dashboard_addr) = self.config.dashboard_addr {
            let dashboard_state = self.state.clone();
            tokio::spawn(async move {
                dashboard::run_dashboard(dashboard_addr, dashboard_state).await;
            });
        }

        tracing::info!(addr = %self.config.listen_addr, "Starting coordinator gRPC server");
        Server::builder()
            // No handler is allowed to hold a request open indefinitely.
            .timeout(Duration::from_secs(30))
            .add_service(MeadowGridCoordinatorServer::new(CoordinatorService::new(
                self.state,
            )))
            .serve_with_shutdown(self.config.listen_addr, shutdown.cancelled_owned())
            .await?;
        Ok(())
    }
}

/// The scheduler: a background task awakened by submissions, registrations,
/// and resource releases, plus a fixed-interval sweep for lost agents.
pub async fn scheduling_loop(
    state: CoordinatorState,
    sweep_interval: Duration,
    shutdown: CancellationToken,
) {
    let mut sweep = tokio::time::interval(sweep_interval);
    loop {
        tokio::select! {
            _ = state.wake.notified() => {}
            _ = sweep.tick() => {
                expire_lost_agents(&state).await;
            }
            _ = shutdown.cancelled() => break,
        }
        let mut jobs = state.jobs.write().await;
        let mut ledger = state.ledger.write().await;
        run_scheduling_pass(&mut jobs, &mut ledger);
    }
}

/// Declares agents that stopped heartbeating lost: their in-flight work
/// fails with ERROR_GETTING_STATE and their inventory leaves the ledger.
async fn expire_lost_agents(state: &CoordinatorState) {
    let mut jobs = state.jobs.write().await;
    let mut ledger = state.ledger.write().await;
    for agent_id in ledger.expired_agents() {
        tracing::warn!(agent_id = %agent_id, "Agent heartbeat timed out; declaring it lost");
        ledger.remove(&agent_id);
        fail_agent_work(&mut jobs, &agent_id);
    }
}
