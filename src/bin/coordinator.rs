use clap::Parser;
use std::net::SocketAddr;
use tracing_subscriber::EnvFilter;

use gridlet::config::{CoordinatorConfig, DEFAULT_COORDINATOR_PORT};
use gridlet::coordinator::CoordinatorServer;
use gridlet::proto::add_credentials_request::Source;
use gridlet::proto::credentials::{Service, Type};
use gridlet::proto::ServerAvailableFile;
use gridlet::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "gridlet-coordinator")]
#[command(about = "The grid coordinator: accepts jobs and assigns them to agents")]
struct Args {
    /// Host to bind the gRPC server on
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Port to bind the gRPC server on
    #[arg(long, default_value_t = DEFAULT_COORDINATOR_PORT)]
    port: u16,

    /// Port for the web dashboard (optional)
    #[arg(long)]
    dashboard_port: Option<u16>,

    /// Declare an agent lost after this many milliseconds without a poll
    #[arg(long, default_value_t = gridlet::config::DEFAULT_AGENT_TIMEOUT_MS)]
    agent_timeout_ms: u64,

    /// Preload file-based credentials: SERVICE URL TYPE PATH, where SERVICE
    /// is DOCKER or GIT and TYPE is USERNAME_PASSWORD or SSH_KEY. Repeatable.
    #[arg(long, num_args = 4, value_names = ["SERVICE", "URL", "TYPE", "PATH"], action = clap::ArgAction::Append)]
    credentials_file: Vec<String>,
}

fn parse_credentials(values: &[String]) -> Result<Vec<(Service, String, Source)>, String> {
    values
        .chunks(4)
        .map(|chunk| {
            let [service, url, credentials_type, path] = chunk else {
                return Err("--credentials-file needs SERVICE URL TYPE PATH".to_string());
            };
            let service = match service.as_str() {
                "DOCKER" => Service::Docker,
                "GIT" => Service::Git,
                other => return Err(format!("unknown credential service {other}")),
            };
            let credentials_type = match credentials_type.as_str() {
                "USERNAME_PASSWORD" => Type::UsernamePassword,
                "SSH_KEY" => Type::SshKey,
                other => return Err(format!("unknown credential type {other}")),
            };
            Ok((
                service,
                url.clone(),
                Source::ServerAvailableFile(ServerAvailableFile {
                    credentials_type: credentials_type as i32,
                    path: path.clone(),
                }),
            ))
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

    let listen_addr: SocketAddr = format!("{}:{}", args.host, args.port).parse()?;
    let dashboard_addr: Option<SocketAddr> = match args.dashboard_port {
        Some(port) => Some(format!("{}:{}", args.host, port).parse()?),
        None => None,
    };
    let credentials = parse_credentials(&args.credentials_file)?;

    let config = CoordinatorConfig {
        listen_addr,
        dashboard_addr,
        agent_timeout_ms: args.agent_timeout_ms,
        ..Default::default()
    };

    tracing::info!(
        listen_addr = %config.listen_addr,
        dashboard_addr = ?config.dashboard_addr,
        "Starting gridlet coordinator"
    );

    let server = CoordinatorServer::new(config);
    {
        let state = server.state();
        let mut store = state.credentials.write().await;
        for (service, url, source) in credentials {
            store.add(service, url, source);
        }
    }

    let shutdown = install_shutdown_handler();
    server.run(shutdown).await?;
    Ok(())
}
