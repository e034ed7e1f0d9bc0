use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration error: cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("configuration error: invalid TOML in {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("configuration error: {0}")]
    Invalid(String),
}

/// Resolve the agent data directory in a platform-appropriate location.
pub fn agent_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(env::temp_dir)
        .join("cloudscape")
}

pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(env::temp_dir)
        .join("cloudscape")
        .join("agent.toml")
}

fn default_formula_dir() -> PathBuf {
    agent_data_dir().join("formula")
}

fn default_results_dir() -> PathBuf {
    agent_data_dir().join("results")
}

fn default_interpreter() -> String {
    if cfg!(windows) {
        "python.exe".to_string()
    } else {
        "python3".to_string()
    }
}

fn default_http_timeout_secs() -> u64 {
    30
}

fn default_poll_interval_secs() -> u64 {
    10
}

/// One long-running worker the `service` command keeps alive.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkerSpec {
    pub name: String,
    pub target: String,
    #[serde(default = "default_worker_method")]
    pub method: String,
}

fn default_worker_method() -> String {
    "start".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_workers")]
    pub workers: Vec<WorkerSpec>,
}

fn default_workers() -> Vec<WorkerSpec> {
    vec![WorkerSpec {
        name: "agent".to_string(),
        target: "agent".to_string(),
        method: default_worker_method(),
    }]
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
        }
    }
}

/// Agent configuration, handed explicitly to every component that needs it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Base URL of the API server, e.g. `https://portal.example.com/api/`
    pub api_url: String,
    #[serde(default)]
    pub api_token: Option<String>,
    /// Identity reported to the API server (defaults to the hostname)
    #[serde(default)]
    pub host_uuid: Option<String>,
    #[serde(default = "default_formula_dir")]
    pub formula_dir: PathBuf,
    #[serde(default = "default_results_dir")]
    pub results_dir: PathBuf,
    #[serde(default = "default_interpreter")]
    pub interpreter: String,
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default)]
    pub log_file: Option<PathBuf>,
    #[serde(default)]
    pub service: ServiceConfig,
}

impl AgentConfig {
    pub fn new(api_url: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
            api_token: None,
            host_uuid: None,
            formula_dir: default_formula_dir(),
            results_dir: default_results_dir(),
            interpreter: default_interpreter(),
            http_timeout_secs: default_http_timeout_secs(),
            poll_interval_secs: default_poll_interval_secs(),
            log_file: None,
            service: ServiceConfig::default(),
        }
    }

    /// Load from `path` (or the default location), then apply `CLOUDSCAPE_*` overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path.map(Path::to_path_buf).unwrap_or_else(default_config_path);
        let mut cfg = match std::fs::read_to_string(&path) {
            Ok(text) => Self::from_toml(&text).map_err(|source| ConfigError::Parse {
                path: path.clone(),
                source,
            })?,
            // A missing file is fine as long as the environment supplies the API URL.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let url = env::var("CLOUDSCAPE_API_URL").map_err(|_| {
                    ConfigError::Invalid(format!(
                        "{} not found and CLOUDSCAPE_API_URL is not set",
                        path.display()
                    ))
                })?;
                Self::new(url)
            }
            Err(source) => return Err(ConfigError::Read { path, source }),
        };
        cfg.apply_env();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    fn apply_env(&mut self) {
        if let Ok(v) = env::var("CLOUDSCAPE_API_URL") {
            self.api_url = v;
        }
        if let Ok(v) = env::var("CLOUDSCAPE_API_TOKEN") {
            self.api_token = Some(v);
        }
        if let Ok(v) = env::var("CLOUDSCAPE_HOST_UUID") {
            self.host_uuid = Some(v);
        }
        if let Ok(v) = env::var("CLOUDSCAPE_FORMULA_DIR") {
            self.formula_dir = PathBuf::from(v);
        }
        if let Ok(v) = env::var("CLOUDSCAPE_RESULTS_DIR") {
            self.results_dir = PathBuf::from(v);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.api_url.starts_with("http://") || self.api_url.starts_with("https://")) {
            return Err(ConfigError::Invalid(format!(
                "api_url must be an http(s) URL, got {:?}",
                self.api_url
            )));
        }
        if self.interpreter.trim().is_empty() {
            return Err(ConfigError::Invalid("interpreter must not be empty".into()));
        }
        if self.http_timeout_secs == 0 {
            return Err(ConfigError::Invalid("http_timeout_secs must be positive".into()));
        }
        Ok(())
    }

    /// Identity sent with verify/register calls.
    pub fn host_id(&self) -> String {
        self.host_uuid.clone().unwrap_or_else(|| {
            hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "unknown-host".to_string())
        })
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_toml_fills_defaults() {
        let cfg = AgentConfig::from_toml(r#"api_url = "https://portal.example.com/api/""#).unwrap();
        assert_eq!(cfg.api_token, None);
        assert_eq!(cfg.http_timeout_secs, 30);
        assert_eq!(cfg.poll_interval_secs, 10);
        assert_eq!(cfg.service.workers, default_workers());
        assert!(cfg.formula_dir.ends_with("formula"));
        cfg.validate().unwrap();
    }

    #[test]
    fn full_toml_round_trips_workers() {
        let text = r#"
            api_url = "http://localhost:8000/api/"
            api_token = "tok"
            host_uuid = "host-1"
            formula_dir = "/var/lib/cloudscape/formula"
            results_dir = "/var/lib/cloudscape/results"
            interpreter = "python3.11"

            [[service.workers]]
            name = "agent"
            target = "agent"
            method = "start"
        "#;
        let cfg = AgentConfig::from_toml(text).unwrap();
        assert_eq!(cfg.host_id(), "host-1");
        assert_eq!(cfg.interpreter, "python3.11");
        assert_eq!(cfg.service.workers.len(), 1);
        assert_eq!(cfg.formula_dir, PathBuf::from("/var/lib/cloudscape/formula"));
    }

    #[test]
    fn non_http_url_is_invalid() {
        let cfg = AgentConfig::new("ftp://nope");
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("api_url"));
    }

    #[test]
    fn unreadable_toml_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.toml");
        std::fs::write(&path, "api_url = [").unwrap();
        let err = AgentConfig::load(Some(&path)).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }
}
