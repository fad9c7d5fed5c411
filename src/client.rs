//! HTTP client for the exporter's control plane.

use std::time::Duration;

use relay_protocol::endpoints::{CLEANUP, DOWNLOAD, FILE_PARAM, IMAGE_PARAM};
use reqwest::{Response, Url};
use thiserror::Error;
use tracing::debug;

/// Errors from control-plane requests
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server returned {status}: {body}")]
    Rejected { status: u16, body: String },
}

/// Authenticated client for `/download` and `/cleanup`.
#[derive(Debug, Clone)]
pub struct ExporterClient {
    http: reqwest::Client,
    base: Url,
    token: String,
}

impl ExporterClient {
    pub fn new(
        base: Url,
        token: impl Into<String>,
        connect_timeout: Duration,
    ) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self {
            http,
            base,
            token: token.into(),
        })
    }

    /// `<base><path>?<param>=<value>`, keeping any path prefix of the base.
    fn endpoint(&self, path: &str, param: &str, value: &str) -> Url {
        let mut url = self.base.clone();
        let joined = format!("{}{}", self.base.path().trim_end_matches('/'), path);
        url.set_path(&joined);
        url.query_pairs_mut().clear().append_pair(param, value);
        url
    }

    async fn get(&self, url: Url) -> Result<Response, ClientError> {
        debug!(url = %url, "GET");
        let response = self.http.get(url).bearer_auth(&self.token).send().await?;

        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(ClientError::Rejected {
                status: status.as_u16(),
                body: body.trim().to_string(),
            })
        }
    }

    /// Start an export. The returned response body is the event stream.
    pub async fn download(&self, image: &str) -> Result<Response, ClientError> {
        self.get(self.endpoint(DOWNLOAD, IMAGE_PARAM, image)).await
    }

    /// Ask the exporter to delete `file`. Returns the confirmation text.
    pub async fn cleanup(&self, file: &str) -> Result<String, ClientError> {
        let response = self.get(self.endpoint(CLEANUP, FILE_PARAM, file)).await?;
        Ok(response.text().await?)
    }
}
