use serde::{Deserialize, Serialize};

/// Pipeline stages. Runs move strictly forward; `Failed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Start,
    Verifying,
    Decrypting,
    Unpacking,
    Registering,
    Executing,
    Done,
    Failed,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Done | RunState::Failed)
    }
}

/// One execution attempt of a package on this host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub package_uuid: String,
    pub host_uuid: String,
    /// Whether the server has to be told about this run before the script starts.
    pub needs_registration: bool,
    pub registered: bool,
    pub state: RunState,
    pub history: Vec<RunState>,
    pub exit_code: Option<i32>,
    pub exit_status: Option<String>,
    pub exit_msg: Option<String>,
    pub completed_at: Option<String>,
    /// Base64 of the script's standard output.
    pub log_b64: Option<String>,
}

impl RunRecord {
    pub fn new(package_uuid: impl Into<String>, host_uuid: impl Into<String>) -> Self {
        Self {
            package_uuid: package_uuid.into(),
            host_uuid: host_uuid.into(),
            needs_registration: false,
            registered: false,
            state: RunState::Start,
            history: vec![RunState::Start],
            exit_code: None,
            exit_status: None,
            exit_msg: None,
            completed_at: None,
            log_b64: None,
        }
    }

    /// Move to `next`. Backward moves and moves out of a terminal state are ignored
    /// and reported as `false`.
    pub fn advance(&mut self, next: RunState) -> bool {
        if self.state.is_terminal() || (next != RunState::Failed && next <= self.state) {
            return false;
        }
        self.state = next;
        self.history.push(next);
        true
    }

    pub fn finish(&mut self, exit_code: i32, stdout_b64: String, stderr: &str) {
        self.exit_code = Some(exit_code);
        self.exit_status = Some(if exit_code == 0 { "success" } else { "failed" }.to_string());
        self.exit_msg = Some(stderr.trim_end().to_string());
        self.log_b64 = Some(stdout_b64);
        self.completed_at = Some(chrono::Utc::now().to_rfc3339());
    }

    pub fn succeeded(&self) -> bool {
        self.state == RunState::Done && self.exit_code == Some(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_only_moves_forward() {
        let mut rec = RunRecord::new("pkg", "host");
        assert!(rec.advance(RunState::Verifying));
        assert!(rec.advance(RunState::Decrypting));
        assert!(!rec.advance(RunState::Verifying));
        assert_eq!(rec.state, RunState::Decrypting);
    }

    #[test]
    fn failed_is_terminal() {
        let mut rec = RunRecord::new("pkg", "host");
        rec.advance(RunState::Unpacking);
        assert!(rec.advance(RunState::Failed));
        assert!(!rec.advance(RunState::Executing));
        assert!(!rec.advance(RunState::Failed));
        assert_eq!(
            rec.history,
            vec![RunState::Start, RunState::Unpacking, RunState::Failed]
        );
    }

    #[test]
    fn finish_records_exit_details() {
        let mut rec = RunRecord::new("pkg", "host");
        rec.finish(3, "b2s=".into(), "traceback\n");
        assert_eq!(rec.exit_code, Some(3));
        assert_eq!(rec.exit_status.as_deref(), Some("failed"));
        assert_eq!(rec.exit_msg.as_deref(), Some("traceback"));
        assert!(rec.completed_at.is_some());
        assert!(!rec.succeeded());
    }
}
