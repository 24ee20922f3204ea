//! One-shot job runner: submits a command job and polls it to a terminal
//! state. Exit code 0 iff the job succeeded.

use std::collections::HashMap;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use gridlet::client::CoordinatorClient;
use gridlet::config::default_coordinator_address;
use gridlet::proto;
use gridlet::proto::add_job_response::AddJobState;
use gridlet::proto::process_state::ProcessStateEnum;
use gridlet::states::is_terminal;

#[derive(Parser, Debug)]
#[command(name = "gridlet-run")]
#[command(about = "Submit a command job and wait for it to finish")]
struct Args {
    /// Coordinator address, e.g. http://127.0.0.1:15319
    #[arg(long, default_value_t = default_coordinator_address())]
    coordinator_address: String,

    /// Job id; generated when not provided
    #[arg(long)]
    job_id: Option<String>,

    #[arg(long, default_value = "")]
    name: String,

    #[arg(long, default_value_t = 100.0)]
    priority: f32,

    /// Resource requirements as NAME VALUE pairs. Repeatable.
    #[arg(long, num_args = 2, value_names = ["NAME", "VALUE"], action = clap::ArgAction::Append)]
    resource: Vec<String>,

    /// Environment variables as NAME VALUE pairs. Repeatable.
    #[arg(long, num_args = 2, value_names = ["NAME", "VALUE"], action = clap::ArgAction::Append)]
    env: Vec<String>,

    /// Code folders available on the agent host. Repeatable; the first is
    /// the working directory.
    #[arg(long)]
    folder: Vec<String>,

    /// Git repository to deploy code from (with --git-commit or --git-branch)
    #[arg(long)]
    git_url: Option<String>,

    #[arg(long, conflicts_with = "git_branch")]
    git_commit: Option<String>,

    #[arg(long)]
    git_branch: Option<String>,

    #[arg(long, default_value = "")]
    path_in_repo: String,

    /// Interpreter path on the agent host
    #[arg(long, conflicts_with = "container_tag")]
    interpreter: Option<String>,

    /// Container image as repository:tag to run the command in
    #[arg(long)]
    container_tag: Option<String>,

    #[arg(long, default_value_t = 1_000)]
    poll_interval_ms: u64,

    /// The command to run
    #[arg(required = true, trailing_var_arg = true)]
    command: Vec<String>,
}

fn pairs(values: &[String], flag: &str) -> Result<Vec<(String, String)>, String> {
    values
        .chunks(2)
        .map(|chunk| match chunk {
            [name, value] => Ok((name.clone(), value.clone())),
            _ => Err(format!("{flag} needs NAME VALUE")),
        })
        .collect()
}

fn build_job(args: &Args) -> Result<proto::Job, String> {
    let job_id = args
        .job_id
        .clone()
        .unwrap_or_else(|| format!("run-{}", uuid::Uuid::new_v4()));

    let code_deployment = match (&args.git_url, &args.git_commit, &args.git_branch) {
        (Some(url), Some(commit), None) => {
            proto::job::CodeDeployment::GitRepoCommit(proto::GitRepoCommit {
                repo_url: url.clone(),
                commit: commit.clone(),
                path_in_repo: args.path_in_repo.clone(),
            })
        }
        (Some(url), None, Some(branch)) => {
            proto::job::CodeDeployment::GitRepoBranch(proto::GitRepoBranch {
                repo_url: url.clone(),
                branch: branch.clone(),
                path_in_repo: args.path_in_repo.clone(),
            })
        }
        (Some(_), None, None) => {
            return Err("--git-url needs --git-commit or --git-branch".to_string())
        }
        (None, None, None) => {
            proto::job::CodeDeployment::ServerAvailableFolder(proto::ServerAvailableFolder {
                code_paths: args.folder.clone(),
            })
        }
        _ => return Err("--git-commit/--git-branch need --git-url".to_string()),
    };

    let interpreter_deployment = match (&args.interpreter, &args.container_tag) {
        (_, Some(image)) => {
            let (repository, tag) = image
                .rsplit_once(':')
                .ok_or_else(|| "--container-tag must look like repository:tag".to_string())?;
            proto::job::InterpreterDeployment::ContainerAtTag(proto::ContainerAtTag {
                repository: repository.to_string(),
                tag: tag.to_string(),
            })
        }
        (interpreter, None) => proto::job::InterpreterDeployment::ServerAvailableInterpreter(
            proto::ServerAvailableInterpreter {
                interpreter_path: interpreter.clone().unwrap_or_default(),
            },
        ),
    };

    let environment_variables: HashMap<String, String> =
        pairs(&args.env, "--env")?.into_iter().collect();
    let resources_required = pairs(&args.resource, "--resource")?
        .into_iter()
        .map(|(name, value)| {
            value
                .parse()
                .map(|value| proto::Resource { name, value })
                .map_err(|_| format!("resource value {value} must be a number"))
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(proto::Job {
        job_id,
        job_friendly_name: args.name.clone(),
        priority: args.priority,
        interruption_probability_threshold: 0.0,
        environment_variables,
        resources_required,
        result_highest_pickle_protocol: 0,
        code_deployment: Some(code_deployment),
        interpreter_deployment: Some(interpreter_deployment),
        job_spec: Some(proto::job::JobSpec::PyCommand(proto::PyCommandJob {
            command_line: args.command.clone(),
            pickled_context_variables: Vec::new(),
        })),
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let job = build_job(&args)?;
    let job_id = job.job_id.clone();

    let mut client = CoordinatorClient::connect(args.coordinator_address.clone()).await?;
    let response = client.add_job(job).await?;
    match response.state() {
        AddJobState::Added => tracing::info!(job_id = %job_id, "Job submitted"),
        AddJobState::IsDuplicate => {
            tracing::warn!(job_id = %job_id, "Job id already exists; watching the existing job")
        }
        AddJobState::Default => return Err("coordinator did not accept the job".into()),
    }

    let final_state = loop {
        let states = client.get_simple_job_states(vec![job_id.clone()]).await?;
        let state = states
            .first()
            .ok_or("coordinator returned no state for the job")?;
        if is_terminal(state.state()) {
            break state.clone();
        }
        tokio::time::sleep(Duration::from_millis(args.poll_interval_ms)).await;
    };

    println!("{job_id}: {:?}", final_state.state());
    if final_state.state() == ProcessStateEnum::Succeeded {
        Ok(())
    } else {
        std::process::exit(1);
    }
}
