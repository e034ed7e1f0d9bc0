use std::sync::Arc;

use anyhow::Context;

use crate::api::HttpApi;
use crate::config::AgentConfig;
use crate::results::{ReportOutcome, ResultParser, ResultReporter};

/// Upload at most one pending result. Run repeatedly (or use `service`) to drain the directory.
pub async fn results_report(cfg: &AgentConfig) -> anyhow::Result<()> {
    let api = HttpApi::new(cfg).context("building API client")?;
    let reporter = ResultReporter::new(ResultParser::new(cfg.results_dir.clone()), Arc::new(api));
    match reporter.report_once().await? {
        ReportOutcome::Uploaded => println!("reported 1 result from {}", cfg.results_dir.display()),
        ReportOutcome::Rejected => println!("1 result in {} was rejected and set aside", cfg.results_dir.display()),
        ReportOutcome::Idle => println!("no results ready in {}", cfg.results_dir.display()),
    }
    Ok(())
}
