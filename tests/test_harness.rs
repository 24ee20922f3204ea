//! Test harness: an in-process coordinator plus helpers for scripted
//! agents and eventually-style assertions.

// Each test crate that includes this module uses a different subset.
#![allow(dead_code)]

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use gridlet::client::CoordinatorClient;
use gridlet::config::CoordinatorConfig;
use gridlet::coordinator::CoordinatorServer;
use gridlet::proto;

/// An in-process coordinator listening on localhost. Dropping it shuts the
/// server down.
pub struct TestCoordinator {
    pub address: String,
    shutdown: CancellationToken,
}

impl TestCoordinator {
    pub async fn start(port: u16) -> Self {
        Self::start_with_agent_timeout(port, 60_000).await
    }

    pub async fn start_with_agent_timeout(port: u16, agent_timeout_ms: u64) -> Self {
        let config = CoordinatorConfig {
            listen_addr: format!("127.0.0.1:{port}").parse().unwrap(),
            dashboard_addr: None,
            agent_timeout_ms,
            // fast sweeps so agent-lost tests finish quickly
            sweep_interval_ms: 50,
        };
        let server = CoordinatorServer::new(config);
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = server.run(token).await {
                tracing::error!(error = %e, "Test coordinator failed");
            }
        });

        let address = format!("http://127.0.0.1:{port}");
        // Wait for the server to come up.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            match CoordinatorClient::connect(address.clone()).await {
                Ok(_) => break,
                Err(_) if tokio::time::Instant::now() < deadline => {
                    tokio::time::sleep(Duration::from_millis(25)).await;
                }
                Err(e) => panic!("test coordinator did not start: {e}"),
            }
        }
        Self { address, shutdown }
    }

    pub async fn client(&self) -> CoordinatorClient {
        CoordinatorClient::connect(self.address.clone())
            .await
            .expect("coordinator is up")
    }
}

impl Drop for TestCoordinator {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

pub fn resources(pairs: &[(&str, f64)]) -> Vec<proto::Resource> {
    pairs
        .iter()
        .map(|(name, value)| proto::Resource {
            name: name.to_string(),
            value: *value,
        })
        .collect()
}

/// A command job with sensible defaults for tests.
pub fn command_job(job_id: &str, priority: f32, required: &[(&str, f64)]) -> proto::Job {
    proto::Job {
        job_id: job_id.to_string(),
        job_friendly_name: job_id.to_string(),
        priority,
        interruption_probability_threshold: 0.0,
        environment_variables: Default::default(),
        resources_required: resources(required),
        result_highest_pickle_protocol: 0,
        code_deployment: Some(proto::job::CodeDeployment::ServerAvailableFolder(
            proto::ServerAvailableFolder { code_paths: vec![] },
        )),
        interpreter_deployment: Some(
            proto::job::InterpreterDeployment::ServerAvailableInterpreter(
                proto::ServerAvailableInterpreter {
                    interpreter_path: String::new(),
                },
            ),
        ),
        job_spec: Some(proto::job::JobSpec::PyCommand(proto::PyCommandJob {
            command_line: vec!["true".to_string()],
            pickled_context_variables: vec![],
        })),
    }
}

pub fn grid_job(job_id: &str, priority: f32, required: &[(&str, f64)]) -> proto::Job {
    proto::Job {
        job_spec: Some(proto::job::JobSpec::PyGrid(proto::PyGridJob {
            function: Some(proto::py_grid_job::Function::PickledFunction(vec![1, 2, 3])),
        })),
        ..command_job(job_id, priority, required)
    }
}

pub fn grid_task(task_id: i32) -> proto::GridTask {
    proto::GridTask {
        task_id,
        pickled_function_arguments: vec![task_id as u8],
    }
}

pub fn state_of(state: gridlet::proto::process_state::ProcessStateEnum) -> proto::ProcessState {
    proto::ProcessState {
        state: state as i32,
        ..Default::default()
    }
}

/// Wait for a condition to become true with timeout.
pub async fn wait_for<F, Fut>(
    condition: F,
    timeout_duration: Duration,
    poll_interval: Duration,
) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout_duration {
        if condition().await {
            return true;
        }
        tokio::time::sleep(poll_interval).await;
    }
    false
}

/// Assert a condition eventually becomes true.
pub async fn assert_eventually<F, Fut>(condition: F, timeout_duration: Duration, message: &str)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = wait_for(condition, timeout_duration, Duration::from_millis(25)).await;
    assert!(result, "{}", message);
}
