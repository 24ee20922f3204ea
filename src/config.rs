use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;

pub const DEFAULT_COORDINATOR_HOST: &str = "127.0.0.1";
pub const DEFAULT_COORDINATOR_PORT: u16 = 15319;

/// Well-known resource names. Anything else is a custom resource.
pub const LOGICAL_CPU: &str = "cpu";
pub const MEMORY: &str = "memory";

pub const DEFAULT_AGENT_POLL_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_AGENT_TIMEOUT_MS: u64 = 60_000;
pub const DEFAULT_AGENT_SWEEP_INTERVAL_MS: u64 = 10_000;

pub fn default_coordinator_address() -> String {
    format!(
        "http://{}:{}",
        DEFAULT_COORDINATOR_HOST, DEFAULT_COORDINATOR_PORT
    )
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub listen_addr: SocketAddr,
    pub dashboard_addr: Option<SocketAddr>,
    /// An agent silent for longer than this is declared lost.
    pub agent_timeout_ms: u64,
    /// How often the scheduler sweeps for lost agents.
    pub sweep_interval_ms: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            listen_addr: format!("{}:{}", DEFAULT_COORDINATOR_HOST, DEFAULT_COORDINATOR_PORT)
                .parse()
                .unwrap(),
            dashboard_addr: None,
            agent_timeout_ms: DEFAULT_AGENT_TIMEOUT_MS,
            sweep_interval_ms: DEFAULT_AGENT_SWEEP_INTERVAL_MS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub coordinator_address: String,
    /// Root for git caches, per-job logs, and blob exchange with children.
    pub working_folder: PathBuf,
    pub agent_id: String,
    /// Set makes this a job-specific agent serving only that job.
    pub job_id: Option<String>,
    pub resources: HashMap<String, f64>,
    pub poll_interval_ms: u64,
}

impl AgentConfig {
    pub fn new(working_folder: PathBuf, agent_id: String) -> Self {
        Self {
            coordinator_address: default_coordinator_address(),
            working_folder,
            agent_id,
            job_id: None,
            resources: HashMap::new(),
            poll_interval_ms: DEFAULT_AGENT_POLL_INTERVAL_MS,
        }
    }
}
