//! The long-running agent worker: drains finished result logs to the API server.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::api::FormulaApi;
use crate::config::AgentConfig;
use crate::results::{ReportOutcome, ResultParser, ResultReporter};
use crate::supervisor::{HaltCheck, Worker, WorkerRegistry};

pub const AGENT_TARGET: &str = "agent";

pub struct AgentWorker {
    name: String,
    reporter: ResultReporter,
    poll_secs: u64,
}

impl AgentWorker {
    pub fn new(name: impl Into<String>, cfg: &AgentConfig, api: Arc<dyn FormulaApi>) -> Self {
        Self {
            name: name.into(),
            reporter: ResultReporter::new(ResultParser::new(cfg.results_dir.clone()), api),
            poll_secs: cfg.poll_interval().as_secs(),
        }
    }

    async fn start(&mut self, halt: &HaltCheck) -> anyhow::Result<()> {
        let name = self.name.clone();
        halt.set_halt_handler(move || info!(worker = %name, "halt requested"));
        info!(worker = %self.name, poll_secs = self.poll_secs, "agent worker polling for results");

        loop {
            if halt.check() {
                return Ok(());
            }
            match self.reporter.report_once().await {
                // more may be waiting; go again without sleeping
                Ok(ReportOutcome::Uploaded | ReportOutcome::Rejected) => continue,
                Ok(ReportOutcome::Idle) => debug!(worker = %self.name, "no results ready"),
                Err(e) => warn!(worker = %self.name, error = %e, "result upload failed"),
            }
            if halt.wait(self.poll_secs).await {
                return Ok(());
            }
        }
    }
}

#[async_trait]
impl Worker for AgentWorker {
    async fn invoke(&mut self, method: &str, halt: Arc<HaltCheck>) -> anyhow::Result<()> {
        match method {
            "start" => self.start(&halt).await,
            other => anyhow::bail!("agent worker has no method {other:?}"),
        }
    }
}

/// Registry holding every worker target this binary knows how to run.
pub fn default_registry(cfg: &AgentConfig, api: Arc<dyn FormulaApi>) -> WorkerRegistry {
    let mut registry = WorkerRegistry::new();
    let cfg = cfg.clone();
    registry.register(AGENT_TARGET, move |desc| {
        Ok(Box::new(AgentWorker::new(desc.name.clone(), &cfg, api.clone())) as Box<dyn Worker>)
    });
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ApiError;
    use crate::config::WorkerSpec;
    use crate::supervisor::Supervisor;
    use common::{FormulaResult, RegisterRequest, VerifyRequest};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct CollectingApi {
        uploaded: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl FormulaApi for CollectingApi {
        async fn verify(&self, _req: &VerifyRequest) -> Result<String, ApiError> {
            unreachable!()
        }

        async fn register(&self, _req: &RegisterRequest) -> Result<(), ApiError> {
            unreachable!()
        }

        async fn submit_result(&self, result: &FormulaResult) -> Result<(), ApiError> {
            self.uploaded
                .lock()
                .unwrap()
                .push(result.fields.formula.clone());
            Ok(())
        }
    }

    fn result_log(formula: &str) -> String {
        format!(
            r#"{{"results": {{"formula": "{formula}", "sys_uuid": "h", "end_time": 1714557600, "exit_code": 0, "exit_status": "success"}}}}"#
        )
    }

    fn test_config(results_dir: &std::path::Path) -> AgentConfig {
        let mut cfg = AgentConfig::new("http://127.0.0.1:1/");
        cfg.results_dir = results_dir.to_path_buf();
        cfg.poll_interval_secs = 5;
        cfg
    }

    #[tokio::test]
    async fn drains_every_ready_result_then_stops_on_halt() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a.log"), result_log("pkg-a")).unwrap();
        std::fs::write(tmp.path().join("b.log"), result_log("pkg-b")).unwrap();

        let api = Arc::new(CollectingApi::default());
        let registry = default_registry(&test_config(tmp.path()), api.clone());
        let supervisor = Supervisor::new(Arc::new(registry));
        supervisor
            .start(&WorkerSpec {
                name: "agent".into(),
                target: AGENT_TARGET.into(),
                method: "start".into(),
            })
            .await
            .unwrap();

        for _ in 0..200 {
            if api.uploaded.lock().unwrap().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(supervisor.stop("agent").await);
        let outcomes = tokio::time::timeout(Duration::from_secs(5), supervisor.wait_all())
            .await
            .unwrap();

        assert!(outcomes[0].1.is_ok());
        assert_eq!(*api.uploaded.lock().unwrap(), vec!["pkg-a", "pkg-b"]);
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn unknown_method_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let mut worker = AgentWorker::new("w", &test_config(tmp.path()), Arc::new(CollectingApi::default()));
        let halt = Arc::new(HaltCheck::new(Arc::new(std::sync::atomic::AtomicBool::new(false))));
        let err = worker.invoke("restart", halt).await.unwrap_err();
        assert!(err.to_string().contains("restart"));
    }
}
