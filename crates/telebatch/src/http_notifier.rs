//! Ledger notifier that posts anchors to an HTTP endpoint.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use tracing::debug;

use telebatch_core::error::NotifyError;
use telebatch_core::ledger::LedgerNotifier;
use telebatch_core::storage::ContentId;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AnchorRequest<'a> {
    device_id: &'a str,
    content_id: &'a ContentId,
}

#[derive(Deserialize)]
struct AnchorResponse {
    anchored: bool,
}

/// POSTs `{"deviceId", "contentId"}` to the configured endpoint.
///
/// A 2xx answer counts as anchored unless its body says
/// `{"anchored": false}`. 4xx is a rejection; anything else is transport.
#[derive(Debug, Clone)]
pub struct HttpNotifier {
    client: reqwest::Client,
    endpoint: Url,
}

impl HttpNotifier {
    pub fn new(endpoint: &str) -> anyhow::Result<Self> {
        let endpoint = Url::parse(endpoint)
            .with_context(|| format!("invalid ledger endpoint {endpoint:?}"))?;
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { client, endpoint })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait]
impl LedgerNotifier for HttpNotifier {
    async fn notify(&self, device_id: &str, content_id: &ContentId) -> Result<bool, NotifyError> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&AnchorRequest {
                device_id,
                content_id,
            })
            .send()
            .await
            .map_err(|e| NotifyError::Transport(e.to_string()))?;

        let status = response.status();
        debug!(device_id, content_id = %content_id, %status, "ledger responded");
        if status.is_success() {
            let anchored = response
                .json::<AnchorResponse>()
                .await
                .map_or(true, |body| body.anchored);
            Ok(anchored)
        } else if status.is_client_error() {
            Err(NotifyError::Rejected(format!("HTTP {status}")))
        } else {
            Err(NotifyError::Transport(format!("HTTP {status}")))
        }
    }
}
