//! Agent tests: the child frame protocol, and an end-to-end run with a
//! real agent loop executing command jobs.

mod test_harness;

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use gridlet::agent::run_agent;
use gridlet::agent::runner::{read_frame, serialize_failure, write_frame};
use gridlet::config::AgentConfig;
use gridlet::proto;
use gridlet::proto::process_state::ProcessStateEnum;
use test_harness::{assert_eventually, command_job, TestCoordinator};

#[tokio::test]
async fn frames_round_trip() {
    let (mut a, mut b) = tokio::io::duplex(1024);

    write_frame(&mut a, b"hello").await.unwrap();
    write_frame(&mut a, &[]).await.unwrap();
    write_frame(&mut a, &[0xff; 300]).await.unwrap();

    assert_eq!(read_frame(&mut b).await.unwrap(), b"hello");
    assert_eq!(read_frame(&mut b).await.unwrap(), Vec::<u8>::new());
    assert_eq!(read_frame(&mut b).await.unwrap(), vec![0xff; 300]);
}

#[tokio::test]
async fn truncated_frames_error_out() {
    let (mut a, mut b) = tokio::io::duplex(1024);
    use tokio::io::AsyncWriteExt;
    // A length prefix promising more bytes than ever arrive.
    a.write_all(&10u32.to_le_bytes()).await.unwrap();
    a.write_all(b"abc").await.unwrap();
    drop(a);
    assert!(read_frame(&mut b).await.is_err());
}

#[test]
fn failures_serialize_as_a_triple() {
    let blob = serialize_failure("deployment", "clone failed");
    let triple: Vec<String> = serde_json::from_slice(&blob).unwrap();
    assert_eq!(triple, vec!["deployment", "clone failed", ""]);
}

fn agent_config(address: &str, working_folder: std::path::PathBuf) -> AgentConfig {
    AgentConfig {
        coordinator_address: address.to_string(),
        working_folder,
        agent_id: "e2e-agent".to_string(),
        job_id: None,
        resources: [("cpu".to_string(), 4.0)].into_iter().collect(),
        poll_interval_ms: 50,
    }
}

fn shell_job(job_id: &str, script: &str) -> proto::Job {
    let mut job = command_job(job_id, 1.0, &[("cpu", 1.0)]);
    job.job_spec = Some(proto::job::JobSpec::PyCommand(proto::PyCommandJob {
        command_line: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
        pickled_context_variables: vec![],
    }));
    job
}

async fn final_state(
    coordinator: &TestCoordinator,
    job_id: &str,
    timeout: Duration,
) -> proto::ProcessState {
    let client = coordinator.client().await;
    let id = job_id.to_string();
    assert_eventually(
        || {
            let mut client = client.clone();
            let id = id.clone();
            async move {
                let state = &client.get_simple_job_states(vec![id]).await.unwrap()[0];
                gridlet::states::is_terminal(state.state())
            }
        },
        timeout,
        "job never reached a terminal state",
    )
    .await;
    coordinator
        .client()
        .await
        .get_simple_job_states(vec![job_id.to_string()])
        .await
        .unwrap()
        .remove(0)
}

#[tokio::test]
async fn real_agent_runs_command_jobs() {
    let coordinator = TestCoordinator::start(53431).await;
    let working_folder = tempfile::tempdir().unwrap();

    let shutdown = CancellationToken::new();
    let config = agent_config(&coordinator.address, working_folder.path().to_path_buf());
    let agent_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let _ = run_agent(config, agent_shutdown).await;
    });

    let mut client = coordinator.client().await;
    client.add_job(shell_job("ok", "echo hello")).await.unwrap();
    let state = final_state(&coordinator, "ok", Duration::from_secs(10)).await;
    assert_eq!(state.state(), ProcessStateEnum::Succeeded);
    assert_eq!(state.return_code, 0);
    assert!(state.pid > 0);
    assert!(state.log_file_name.contains("ok"));

    // The log file captured the child's output.
    let log = tokio::fs::read_to_string(&state.log_file_name).await.unwrap();
    assert!(log.contains("hello"));

    // Resources came back once the job finished.
    let agents = client.get_agent_states().await.unwrap();
    let cpu = agents[0]
        .available_resources
        .iter()
        .find(|r| r.name == "cpu")
        .unwrap()
        .value;
    assert_eq!(cpu, 4.0);

    shutdown.cancel();
}

#[tokio::test]
async fn real_agent_reports_exit_codes() {
    let coordinator = TestCoordinator::start(53432).await;
    let working_folder = tempfile::tempdir().unwrap();

    let shutdown = CancellationToken::new();
    let config = agent_config(&coordinator.address, working_folder.path().to_path_buf());
    let agent_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let _ = run_agent(config, agent_shutdown).await;
    });

    let mut client = coordinator.client().await;
    client.add_job(shell_job("fails", "exit 3")).await.unwrap();
    let state = final_state(&coordinator, "fails", Duration::from_secs(10)).await;
    assert_eq!(state.state(), ProcessStateEnum::NonZeroReturnCode);
    assert_eq!(state.return_code, 3);

    shutdown.cancel();
}

#[tokio::test]
async fn real_agent_reports_launch_failures() {
    let coordinator = TestCoordinator::start(53433).await;
    let working_folder = tempfile::tempdir().unwrap();

    let shutdown = CancellationToken::new();
    let config = agent_config(&coordinator.address, working_folder.path().to_path_buf());
    let agent_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let _ = run_agent(config, agent_shutdown).await;
    });

    let mut client = coordinator.client().await;
    let mut job = command_job("no-such-binary", 1.0, &[("cpu", 1.0)]);
    job.job_spec = Some(proto::job::JobSpec::PyCommand(proto::PyCommandJob {
        command_line: vec!["/definitely/not/a/binary".to_string()],
        pickled_context_variables: vec![],
    }));
    client.add_job(job).await.unwrap();

    let state = final_state(&coordinator, "no-such-binary", Duration::from_secs(10)).await;
    assert_eq!(state.state(), ProcessStateEnum::RunRequestFailed);
    // The failure travels as a serialized triple.
    let triple: Vec<String> = serde_json::from_slice(&state.pickled_result).unwrap();
    assert_eq!(triple.len(), 3);

    shutdown.cancel();
}

#[tokio::test]
async fn environment_variables_reach_the_child() {
    let coordinator = TestCoordinator::start(53434).await;
    let working_folder = tempfile::tempdir().unwrap();

    let shutdown = CancellationToken::new();
    let config = agent_config(&coordinator.address, working_folder.path().to_path_buf());
    let agent_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let _ = run_agent(config, agent_shutdown).await;
    });

    let mut client = coordinator.client().await;
    let mut job = shell_job("env-job", "test \"$GREETING\" = bonjour");
    job.environment_variables = [("GREETING".to_string(), "bonjour".to_string())]
        .into_iter()
        .collect();
    client.add_job(job).await.unwrap();

    let state = final_state(&coordinator, "env-job", Duration::from_secs(10)).await;
    assert_eq!(state.state(), ProcessStateEnum::Succeeded);

    shutdown.cancel();
}
