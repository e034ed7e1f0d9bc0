//! Client for the API server endpoints the agent depends on.

use async_trait::async_trait;
use reqwest::StatusCode;
use thiserror::Error;
use tracing::debug;

use crate::config::AgentConfig;
use common::{FormulaResult, RegisterRequest, VerifyRequest, VerifyResponse};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request to {endpoint} failed: {source}")]
    Transport {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{endpoint} returned HTTP {status}: {body}")]
    Status {
        endpoint: String,
        status: u16,
        body: String,
    },
    #[error("{endpoint} returned an unexpected body: {reason}")]
    UnexpectedResponse { endpoint: String, reason: String },
}

/// The calls a formula run and the result reporter make against the API server.
#[async_trait]
pub trait FormulaApi: Send + Sync {
    /// Exchange a package checksum for its decryption key.
    async fn verify(&self, req: &VerifyRequest) -> Result<String, ApiError>;
    /// Tell the server a run of this package has started on this host.
    async fn register(&self, req: &RegisterRequest) -> Result<(), ApiError>;
    /// Upload one finished result.
    async fn submit_result(&self, result: &FormulaResult) -> Result<(), ApiError>;
}

pub struct HttpApi {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpApi {
    pub fn new(cfg: &AgentConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(cfg.http_timeout())
            .build()?;
        let mut base_url = cfg.api_url.clone();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }
        Ok(Self {
            client,
            base_url,
            token: cfg.api_token.clone(),
        })
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}{}", self.base_url, endpoint)
    }

    async fn post<T: serde::Serialize + ?Sized>(
        &self,
        endpoint: &str,
        body: &T,
    ) -> Result<reqwest::Response, ApiError> {
        let mut req = self.client.post(self.url(endpoint)).json(body);
        if let Some(token) = &self.token {
            req = req.header(reqwest::header::AUTHORIZATION, format!("Token {token}"));
        }
        let resp = req.send().await.map_err(|source| ApiError::Transport {
            endpoint: endpoint.to_string(),
            source,
        })?;
        debug!(endpoint, status = resp.status().as_u16(), "api response");
        if resp.status() != StatusCode::OK {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(ApiError::Status {
                endpoint: endpoint.to_string(),
                status,
                body,
            });
        }
        Ok(resp)
    }
}

#[async_trait]
impl FormulaApi for HttpApi {
    async fn verify(&self, req: &VerifyRequest) -> Result<String, ApiError> {
        const ENDPOINT: &str = "formula/verify";
        let resp = self.post(ENDPOINT, req).await?;
        let parsed: VerifyResponse =
            resp.json()
                .await
                .map_err(|e| ApiError::UnexpectedResponse {
                    endpoint: ENDPOINT.to_string(),
                    reason: e.to_string(),
                })?;
        if parsed.key.trim().is_empty() {
            return Err(ApiError::UnexpectedResponse {
                endpoint: ENDPOINT.to_string(),
                reason: "empty decryption key".to_string(),
            });
        }
        Ok(parsed.key)
    }

    async fn register(&self, req: &RegisterRequest) -> Result<(), ApiError> {
        self.post("formula/register", req).await.map(|_| ())
    }

    async fn submit_result(&self, result: &FormulaResult) -> Result<(), ApiError> {
        self.post("formula/results", result).await.map(|_| ())
    }
}
