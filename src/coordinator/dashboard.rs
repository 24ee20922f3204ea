//! Read-only HTTP dashboard for the coordinator. Mutations stay on the
//! gRPC surface; this serves snapshots for humans and scripts.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use axum::{
    extract::State,
    response::{Html, IntoResponse},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};

use crate::coordinator::CoordinatorState;
use crate::registry::job::JobKind;

#[derive(Serialize)]
struct AgentResponse {
    agent_id: String,
    total_resources: BTreeMap<String, f64>,
    available_resources: BTreeMap<String, f64>,
}

#[derive(Serialize)]
struct JobResponse {
    job_id: String,
    friendly_name: String,
    kind: &'static str,
    state: String,
    priority: f32,
    submitted_at: chrono::DateTime<chrono::Utc>,
    task_count: Option<usize>,
    worker_count: Option<usize>,
}

pub async fn run_dashboard(addr: SocketAddr, state: CoordinatorState) {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/", get(index_handler))
        .route("/api/agents", get(agents_handler))
        .route("/api/jobs", get(jobs_handler))
        .layer(cors)
        .with_state(state);

    tracing::info!(addr = %addr, "Starting dashboard server");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind dashboard server");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!(error = %e, "Dashboard server failed");
    }
}

async fn index_handler() -> Html<&'static str> {
    Html(include_str!("index.html"))
}

async fn agents_handler(State(state): State<CoordinatorState>) -> impl IntoResponse {
    let ledger = state.ledger.read().await;
    let agents: Vec<AgentResponse> = ledger
        .snapshot()
        .into_iter()
        .map(|a| AgentResponse {
            agent_id: a.agent_id,
            total_resources: a
                .total_resources
                .iter()
                .map(|(n, v)| (n.to_string(), v))
                .collect(),
            available_resources: a
                .available_resources
                .iter()
                .map(|(n, v)| (n.to_string(), v))
                .collect(),
        })
        .collect();
    Json(agents)
}

async fn jobs_handler(State(state): State<CoordinatorState>) -> impl IntoResponse {
    let jobs = state.jobs.read().await;
    let mut listing: Vec<JobResponse> = jobs
        .iter()
        .map(|record| {
            let (kind, task_count, worker_count) = match &record.kind {
                JobKind::Simple(_) => ("simple", None, None),
                JobKind::Grid(grid) => {
                    ("grid", Some(grid.task_count()), Some(grid.workers.len()))
                }
            };
            JobResponse {
                job_id: record.job.job_id.clone(),
                friendly_name: record.job.job_friendly_name.clone(),
                kind,
                state: format!("{:?}", record.reported_state().state()),
                priority: record.job.priority,
                submitted_at: record.submitted_at,
                task_count,
                worker_count,
            }
        })
        .collect();
    listing.sort_by(|a, b| a.submitted_at.cmp(&b.submitted_at));
    Json(listing)
}
