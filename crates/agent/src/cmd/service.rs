use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use crate::api::{FormulaApi, HttpApi};
use crate::config::AgentConfig;
use crate::supervisor::Supervisor;
use crate::worker::default_registry;

/// Start every configured worker and keep them running until Ctrl+C or SIGTERM.
pub async fn service(cfg: &AgentConfig) -> anyhow::Result<()> {
    let api: Arc<dyn FormulaApi> = Arc::new(HttpApi::new(cfg).context("building API client")?);
    if cfg.service.workers.is_empty() {
        anyhow::bail!("no workers configured under [service]");
    }
    let registry = default_registry(cfg, api);
    info!(targets = ?registry.targets(), workers = cfg.service.workers.len(), "starting service");
    let supervisor = Supervisor::new(Arc::new(registry));
    for spec in &cfg.service.workers {
        supervisor
            .start(spec)
            .await
            .with_context(|| format!("starting worker {}", spec.name))?;
    }

    shutdown_signal().await;
    info!("shutdown signal received, stopping workers");
    for spec in &cfg.service.workers {
        if !supervisor.stop(&spec.name).await {
            warn!(worker = %spec.name, "worker was not running");
        }
    }

    let mut failed = 0usize;
    for (name, res) in supervisor.wait_all().await {
        if let Err(e) = res {
            warn!(worker = %name, error = %e, "worker ended with error");
            failed += 1;
        }
    }
    if failed > 0 {
        anyhow::bail!("{failed} worker(s) ended with an error");
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
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
