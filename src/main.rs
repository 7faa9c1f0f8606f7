use std::process::ExitCode;
use std::sync::Arc;

use docker_target::client::Logger;
use docker_target::config::DockerTargetConfig;
use docker_target::target::docker::client::{BollardLogSource, LogSource};
use docker_target::{DockerTarget, FilePositions, Metrics, Target};

mod cli;

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize the logger
    env_logger::init();

    let path = &cli::args().config;
    let config = match DockerTargetConfig::try_init(path) {
        Ok(config) => config,
        Err(e) => {
            log::error!("Unable to read config {path:?}: {e}");
            return ExitCode::FAILURE;
        }
    };
    let relabel_rules: Arc<[_]> = match config.relabel_rules() {
        Ok(rules) => rules.into(),
        Err(e) => {
            log::error!("Invalid relabel configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    let positions = match FilePositions::new(config.positions.clone()) {
        Ok(positions) => positions,
        Err(e) => {
            log::error!("Unable to load positions: {e}");
            return ExitCode::FAILURE;
        }
    };
    let client: Arc<dyn LogSource> = match BollardLogSource::connect() {
        Ok(client) => Arc::new(client),
        Err(e) => {
            log::error!("Unable to connect to the docker daemon: {e}");
            return ExitCode::FAILURE;
        }
    };

    let logger = Logger::new(tokio::io::stdout(), config.client.channel_capacity);
    let metrics = Arc::new(Metrics::new());

    let mut targets = Vec::with_capacity(config.containers.len());
    for container in &config.containers {
        match DockerTarget::new(
            Arc::clone(&metrics),
            logger.sender(),
            positions.clone(),
            container.id.clone(),
            container.discovered_labels(),
            Arc::clone(&relabel_rules),
            Arc::clone(&client),
        ) {
            Ok(target) => {
                log::info!("Following logs of container {}", container.id);
                targets.push(target);
            }
            Err(e) => log::error!("Unable to create target for {}: {e}", container.id),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("Unable to listen for shutdown signal: {e}");
    }
    log::warn!("Received shutdown signal, stopping targets");

    for target in &targets {
        target.stop().await;
        log::debug!("Final state of {}: {}", target.container_id(), target.details());
    }
    // Targets hold senders, the logger only finishes once they are gone
    drop(targets);

    positions.stop().await;
    if let Err(e) = logger.stop().await {
        log::error!("Failed to flush entries: {e}");
    }
    log::info!(
        "Forwarded {} entries, skipped {} lines",
        metrics.entries(),
        metrics.errors()
    );

    ExitCode::SUCCESS
}
