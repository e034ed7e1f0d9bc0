//! Pick up finished formula result logs and hand them to the API server, one at a time.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use base64::Engine;
use tracing::{debug, info, warn};

use crate::api::{ApiError, FormulaApi};
use common::{FormulaResult, ResultLog};

const RESULT_SUFFIX: &str = "log";
/// Appended to a result the server refused outright, so it stops blocking the queue.
const REJECTED_SUFFIX: &str = "rejected";

/// A parsed result plus the file it came from, so the caller can remove it once
/// the upload is acknowledged.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedResult {
    pub path: PathBuf,
    pub result: FormulaResult,
}

pub struct ResultParser {
    results_dir: PathBuf,
}

impl ResultParser {
    pub fn new(results_dir: impl Into<PathBuf>) -> Self {
        Self {
            results_dir: results_dir.into(),
        }
    }

    /// Return the first complete result in the results directory, or `None` when
    /// there is nothing ready. Empty or unparsable files are left for a later call.
    /// Nothing is marked as read: the same file is returned until it is removed.
    pub fn parse(&self) -> anyhow::Result<Option<ParsedResult>> {
        if !self.results_dir.exists() {
            std::fs::create_dir_all(&self.results_dir)
                .with_context(|| format!("creating {}", self.results_dir.display()))?;
            info!(dir = %self.results_dir.display(), "created results directory");
            return Ok(None);
        }

        let mut candidates: Vec<PathBuf> = std::fs::read_dir(&self.results_dir)
            .with_context(|| format!("listing {}", self.results_dir.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == RESULT_SUFFIX))
            .collect();
        candidates.sort();

        for path in candidates {
            let raw = match std::fs::read(&path) {
                Ok(raw) => raw,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "cannot read result log");
                    continue;
                }
            };
            if raw.is_empty() {
                debug!(path = %path.display(), "result log still empty");
                continue;
            }
            let log: ResultLog = match common::deserialize_message(&raw) {
                Ok(log) => log,
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "result log not parseable yet");
                    continue;
                }
            };
            let result = FormulaResult {
                fields: log.results,
                log: base64::engine::general_purpose::STANDARD.encode(&raw),
            };
            return Ok(Some(ParsedResult { path, result }));
        }
        Ok(None)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportOutcome {
    /// Nothing was ready.
    Idle,
    /// One result was accepted and its file removed.
    Uploaded,
    /// The server refused one result for good; its file was set aside.
    Rejected,
}

/// Uploads parsed results and deletes each source file after the server accepts it.
pub struct ResultReporter {
    parser: ResultParser,
    api: Arc<dyn FormulaApi>,
}

impl ResultReporter {
    pub fn new(parser: ResultParser, api: Arc<dyn FormulaApi>) -> Self {
        Self { parser, api }
    }

    /// Handle at most one result. Transient failures are returned as errors and the
    /// file is retried on the next call.
    pub async fn report_once(&self) -> anyhow::Result<ReportOutcome> {
        let Some(parsed) = self.parser.parse()? else {
            return Ok(ReportOutcome::Idle);
        };
        match self.api.submit_result(&parsed.result).await {
            Ok(()) => {}
            Err(ApiError::Status { status, body, .. }) if is_permanent_rejection(status) => {
                let mut aside = parsed.path.clone().into_os_string();
                aside.push(format!(".{REJECTED_SUFFIX}"));
                let aside = PathBuf::from(aside);
                warn!(
                    path = %parsed.path.display(),
                    status,
                    body = %body,
                    moved_to = %aside.display(),
                    "result rejected by server"
                );
                tokio::fs::rename(&parsed.path, &aside)
                    .await
                    .with_context(|| format!("setting aside {}", parsed.path.display()))?;
                return Ok(ReportOutcome::Rejected);
            }
            Err(e) => {
                warn!(path = %parsed.path.display(), error = %e, "result upload failed; will retry");
                return Err(anyhow::Error::new(e)
                    .context(format!("uploading {}", parsed.path.display())));
            }
        }
        tokio::fs::remove_file(&parsed.path)
            .await
            .with_context(|| format!("removing {}", parsed.path.display()))?;
        info!(
            formula = %parsed.result.fields.formula,
            exit_code = parsed.result.fields.exit_code,
            "result reported"
        );
        Ok(ReportOutcome::Uploaded)
    }
}

/// Client errors other than auth, timeout and rate limiting will not change on retry.
fn is_permanent_rejection(status: u16) -> bool {
    (400..500).contains(&status) && !matches!(status, 401 | 403 | 408 | 429)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use common::{RegisterRequest, VerifyRequest};
    use std::sync::Mutex;

    const GOOD: &str = r#"{"results": {"formula": "pkg-123", "sys_uuid": "host-1", "end_time": "2024-05-01 10:00:00", "exit_code": 0, "exit_status": "success", "exit_msg": "ok"}}"#;

    #[test]
    fn missing_directory_is_created_and_reports_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("results");
        assert_eq!(ResultParser::new(&dir).parse().unwrap(), None);
        assert!(dir.is_dir());
    }

    #[test]
    fn empty_log_is_skipped_and_left_in_place() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a-empty.log"), "").unwrap();
        std::fs::write(tmp.path().join("b-done.log"), GOOD).unwrap();

        let parsed = ResultParser::new(tmp.path()).parse().unwrap().unwrap();
        assert_eq!(parsed.path, tmp.path().join("b-done.log"));
        assert_eq!(parsed.result.fields.formula, "pkg-123");
        assert_eq!(parsed.result.fields.exit_msg, "ok");
        assert!(tmp.path().join("a-empty.log").exists());
    }

    #[test]
    fn partial_json_and_other_suffixes_are_ignored() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("half.log"), r#"{"results": {"formula""#).unwrap();
        std::fs::write(tmp.path().join("notes.txt"), GOOD).unwrap();
        assert_eq!(ResultParser::new(tmp.path()).parse().unwrap(), None);
    }

    #[test]
    fn log_blob_is_whole_file_base64() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("r.log"), GOOD).unwrap();
        let parsed = ResultParser::new(tmp.path()).parse().unwrap().unwrap();
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(parsed.result.log)
            .unwrap();
        assert_eq!(decoded, GOOD.as_bytes());
    }

    #[test]
    fn parse_does_not_mark_results_as_read() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("r.log"), GOOD).unwrap();
        let parser = ResultParser::new(tmp.path());
        let first = parser.parse().unwrap();
        let second = parser.parse().unwrap();
        assert!(first.is_some());
        assert_eq!(first, second);
    }

    #[derive(Default)]
    struct UploadApi {
        fail_with: Option<u16>,
        uploaded: Mutex<Vec<FormulaResult>>,
    }

    #[async_trait]
    impl FormulaApi for UploadApi {
        async fn verify(&self, _req: &VerifyRequest) -> Result<String, ApiError> {
            unreachable!("reporter never verifies")
        }

        async fn register(&self, _req: &RegisterRequest) -> Result<(), ApiError> {
            unreachable!("reporter never registers")
        }

        async fn submit_result(&self, result: &FormulaResult) -> Result<(), ApiError> {
            if let Some(status) = self.fail_with {
                return Err(ApiError::Status {
                    endpoint: "formula/results".into(),
                    status,
                    body: String::new(),
                });
            }
            self.uploaded.lock().unwrap().push(result.clone());
            Ok(())
        }
    }

    fn failing(status: u16) -> Arc<UploadApi> {
        Arc::new(UploadApi {
            fail_with: Some(status),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn reporter_deletes_file_only_after_upload() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("r.log"), GOOD).unwrap();

        let flaky = ResultReporter::new(ResultParser::new(tmp.path()), failing(502));
        assert!(flaky.report_once().await.is_err());
        assert!(tmp.path().join("r.log").exists());

        let api = Arc::new(UploadApi::default());
        let reporter = ResultReporter::new(ResultParser::new(tmp.path()), api.clone());
        assert_eq!(reporter.report_once().await.unwrap(), ReportOutcome::Uploaded);
        assert!(!tmp.path().join("r.log").exists());
        assert_eq!(api.uploaded.lock().unwrap().len(), 1);
        assert_eq!(reporter.report_once().await.unwrap(), ReportOutcome::Idle);
    }

    #[tokio::test]
    async fn refused_result_is_set_aside_and_stops_blocking_the_rest() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a.log"), GOOD).unwrap();
        std::fs::write(tmp.path().join("b.log"), GOOD).unwrap();

        let refusing = ResultReporter::new(ResultParser::new(tmp.path()), failing(400));
        assert_eq!(refusing.report_once().await.unwrap(), ReportOutcome::Rejected);
        assert!(!tmp.path().join("a.log").exists());
        assert!(tmp.path().join("a.log.rejected").exists());

        let parsed = ResultParser::new(tmp.path()).parse().unwrap().unwrap();
        assert_eq!(parsed.path, tmp.path().join("b.log"));
    }

    #[tokio::test]
    async fn auth_and_rate_limit_errors_are_retried() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("r.log"), GOOD).unwrap();
        for status in [401, 403, 429, 500] {
            let reporter = ResultReporter::new(ResultParser::new(tmp.path()), failing(status));
            assert!(reporter.report_once().await.is_err(), "status {status}");
            assert!(tmp.path().join("r.log").exists());
        }
    }
}
