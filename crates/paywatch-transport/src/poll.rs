// HTTP status endpoint client used by the polling fallback.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use tracing::debug;

use paywatch_core::config::render_url;
use paywatch_core::status::{CheckoutRequestId, StatusReport};

use crate::{QueryError, StatusQuery};

/// `GET`s the status endpoint and decodes the JSON report.
pub struct HttpStatusQuery {
    http: reqwest::Client,
    url_template: String,
}

impl HttpStatusQuery {
    /// `url_template` may contain `{checkout_request_id}`. `timeout` bounds
    /// each request so a hung server only costs one check.
    pub fn new(url_template: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            url_template: url_template.into(),
        })
    }
}

#[async_trait]
impl StatusQuery for HttpStatusQuery {
    async fn fetch_status(&self, id: &CheckoutRequestId) -> Result<StatusReport, QueryError> {
        let url = render_url(&self.url_template, id);
        let response = self
            .http
            .get(&url)
            .header("X-Requested-With", "XMLHttpRequest")
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| QueryError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(QueryError::Status(status.as_u16()));
        }

        let body = response
            .text()
            .await
            .map_err(|e| QueryError::Transport(e.to_string()))?;
        debug!(%url, body_len = body.len(), "status response");

        Ok(StatusReport::from_json(&body)?)
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
