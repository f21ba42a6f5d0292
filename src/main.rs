use std::net::SocketAddr;

use anyhow::Context;
use tokio::task::JoinHandle;
use tracing::{error, info};

mod api_server;
mod config;
mod error;
mod file_server;
mod utils;
mod vllm;

use api_server::ApiServer;
use config::Config;
use file_server::FileServer;
use utils::init_logging;
use vllm::VllmClient;

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();

    let config = Config::from_env();
    init_logging(&config.log_level);

    if let Err(err) = run(config).await {
        error!("{:#}", err);
        std::process::exit(1);
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    info!("vision upload service starting");
    config.validate().context("invalid configuration")?;

    let file_addr = SocketAddr::from(([0, 0, 0, 0], config.file_server_port()?));
    let api_addr = SocketAddr::from(([0, 0, 0, 0], config.api_server_port()?));

    let vllm = VllmClient::new(
        &config.vllm_base_url,
        &config.vllm_model,
        &config.vllm_prompt,
        config.vllm_timeout()?,
    )
    .context("failed to build inference client")?;
    info!("inference endpoint: {}", vllm.endpoint());

    let files = FileServer::new(&config.file_server_port, &config.file_server_path);
    let api = ApiServer::new(
        &config.file_server_path,
        files.clone(),
        vllm,
        &config.file_server_host,
    )
    .with_body_limit(config.body_limit_bytes()?);

    let mut file_task: JoinHandle<anyhow::Result<()>> = tokio::spawn(files.serve(file_addr));
    let mut api_task: JoinHandle<anyhow::Result<()>> = tokio::spawn(api.serve(api_addr));

    info!("file server: http://localhost:{}", file_addr.port());
    info!("api server: http://localhost:{}", api_addr.port());

    tokio::select! {
        _ = shutdown_signal() => {
            info!("shutdown signal received, stopping");
            Ok(())
        }
        result = &mut file_task => listener_exit("file server", result),
        result = &mut api_task => listener_exit("api server", result),
    }
}

fn listener_exit(
    name: &str,
    result: Result<anyhow::Result<()>, tokio::task::JoinError>,
) -> anyhow::Result<()> {
    match result {
        Ok(Ok(())) => anyhow::bail!("{} stopped unexpectedly", name),
        Ok(Err(err)) => Err(err.context(format!("{} failed", name))),
        Err(err) => Err(anyhow::Error::new(err).context(format!("{} task panicked", name))),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!("failed to listen for ctrl-c: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!("failed to listen for SIGTERM: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
