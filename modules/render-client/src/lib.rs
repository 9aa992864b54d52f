pub mod error;

pub use error::{RenderError, Result};

use std::time::Duration;

use serde::Serialize;

/// Options for one rendered-page fetch.
///
/// Deal and disclosure sources need a selector wait (the tables are
/// filled in by script after load); infinite-scroll news pages need a
/// few scroll passes before the markup is complete.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RenderOptions {
    /// CSS selector to wait for before capturing markup.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wait_for_selector: Option<String>,
    /// Wait budget for the selector, milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wait_timeout_ms: Option<u64>,
    /// Number of viewport-height scrolls to perform before capture.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scroll_passes: Option<u32>,
}

impl RenderOptions {
    pub fn wait_for(selector: &str, timeout_ms: u64) -> Self {
        Self {
            wait_for_selector: Some(selector.to_string()),
            wait_timeout_ms: Some(timeout_ms),
            scroll_passes: None,
        }
    }
}

/// Client for a remote headless-browser rendering service
/// (Browserless-style `/content` endpoint). Each adapter task builds
/// its own client; sessions are never shared across concurrent tasks.
pub struct RenderClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl RenderClient {
    pub fn new(base_url: &str, token: Option<&str>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(45))
            .build()
            .expect("Failed to build HTTP client");

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.map(String::from),
        }
    }

    fn endpoint(&self) -> String {
        let mut endpoint = format!("{}/content", self.base_url);
        if let Some(ref token) = self.token {
            endpoint.push_str(&format!("?token={token}"));
        }
        endpoint
    }

    fn request_body(url: &str, options: &RenderOptions) -> serde_json::Value {
        let mut body = serde_json::json!({ "url": url });
        if let Some(ref selector) = options.wait_for_selector {
            body["waitForSelector"] = serde_json::json!({
                "selector": selector,
                "timeout": options.wait_timeout_ms.unwrap_or(15_000),
            });
        }
        if let Some(passes) = options.scroll_passes {
            body["scrollPasses"] = serde_json::json!(passes);
        }
        body
    }

    /// Navigate to a URL and return the fully-rendered markup.
    pub async fn content(&self, url: &str, options: &RenderOptions) -> Result<String> {
        let endpoint = self.endpoint();
        let body = Self::request_body(url, options);

        let resp = self
            .client
            .post(&endpoint)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            // Browserless reports an exceeded waitForSelector budget as 408.
            if status.as_u16() == 408 {
                return Err(RenderError::WaitTimeout(message));
            }
            return Err(RenderError::Api {
                status: status.as_u16(),
                message,
            });
        }

        Ok(resp.text().await?)
    }
}
