//! ottod entry point.
//!
//! Wires the controller against a local Ollama backend, runs until a
//! shutdown signal, then drains and flushes in order.

use anyhow::Result;
use ottod::backend::OllamaBackend;
use ottod::controller::{Controller, LogSink};
use otto_common::config::KernelConfig;
use otto_common::skill::{EchoSkill, SkillRegistry};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/etc/otto/otto.toml"));
    let config = KernelConfig::load(&config_path)?;

    let mut skills = SkillRegistry::new();
    skills.register(Arc::new(EchoSkill));

    let backend = Arc::new(OllamaBackend::new(config.ollama_url.clone()));
    let controller = Arc::new(Controller::new(
        config,
        backend,
        Arc::new(skills),
        Arc::new(LogSink),
    )?);
    controller.start();
    info!("ottod {} started", env!("CARGO_PKG_VERSION"));

    let runner = Arc::clone(&controller);
    let run_handle = tokio::spawn(async move { runner.run().await });

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    controller.shutdown().await;
    run_handle.await?;
    info!("ottod stopped");
    Ok(())
}
