use std::collections::HashMap;
use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use gridlet::agent::run_agent;
use gridlet::config::{default_coordinator_address, AgentConfig, DEFAULT_AGENT_POLL_INTERVAL_MS};
use gridlet::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "gridlet-agent")]
#[command(about = "A worker host that polls the coordinator and runs user code")]
struct Args {
    /// Coordinator address, e.g. http://127.0.0.1:15319
    #[arg(long, default_value_t = default_coordinator_address())]
    coordinator_address: String,

    /// Folder for git caches, job logs, and blob exchange with children
    #[arg(long)]
    working_folder: PathBuf,

    /// Agent id; generated when not provided
    #[arg(long)]
    agent_id: Option<String>,

    /// Makes this a job-specific agent that only runs the given job
    #[arg(long)]
    job_id: Option<String>,

    /// Available resources as NAME VALUE pairs, e.g. --resource cpu 4. Repeatable.
    #[arg(long, num_args = 2, value_names = ["NAME", "VALUE"], action = clap::ArgAction::Append)]
    resource: Vec<String>,

    #[arg(long, default_value_t = DEFAULT_AGENT_POLL_INTERVAL_MS)]
    poll_interval_ms: u64,
}

fn parse_resources(values: &[String]) -> Result<HashMap<String, f64>, String> {
    values
        .chunks(2)
        .map(|chunk| {
            let [name, value] = chunk else {
                return Err("--resource needs NAME VALUE".to_string());
            };
            let value: f64 = value
                .parse()
                .map_err(|_| format!("resource value {value} must be a number"))?;
            Ok((name.clone(), value))
        })
        .collect()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let config = AgentConfig {
        coordinator_address: args.coordinator_address,
        working_folder: args.working_folder,
        agent_id: args
            .agent_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        job_id: args.job_id,
        resources: parse_resources(&args.resource)?,
        poll_interval_ms: args.poll_interval_ms,
    };

    tracing::info!(
        agent_id = %config.agent_id,
        coordinator = %config.coordinator_address,
        working_folder = %config.working_folder.display(),
        "Starting gridlet agent"
    );

    let shutdown = install_shutdown_handler();
    run_agent(config, shutdown).await?;
    Ok(())
}
