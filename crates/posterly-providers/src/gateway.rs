//! WhatsApp gateway channels.
//!
//! The gateway family takes `receiver`, `msgtext`, `token` and `mediaurl`
//! parameters. The primary channel posts them as a form; the secondary posts
//! the same fields as JSON with explicit headers, which some gateway
//! deployments accept when the form endpoint misbehaves.

use async_trait::async_trait;
use posterly_core::config::ChannelEndpoint;
use posterly_core::error::{PosterlyError, Result};
use posterly_core::traits::Channel;
use posterly_core::types::{OutgoingMedia, Receipt};
use reqwest::StatusCode;
use std::time::Duration;

/// How a gateway request is encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestShape {
    /// `application/x-www-form-urlencoded` POST.
    FormPost,
    /// JSON POST with `Accept` and bearer headers.
    JsonPost,
}

/// A gateway endpoint reached through a pooled client.
pub struct GatewayChannel {
    name: String,
    endpoint: ChannelEndpoint,
    shape: RequestShape,
    client: reqwest::Client,
}

impl GatewayChannel {
    pub fn new(name: &str, endpoint: ChannelEndpoint, shape: RequestShape) -> Self {
        Self {
            name: name.to_string(),
            endpoint,
            shape,
            client: reqwest::Client::new(),
        }
    }

    pub fn shape(&self) -> RequestShape {
        self.shape
    }

    fn params<'a>(&'a self, message: &'a OutgoingMedia) -> [(&'static str, &'a str); 4] {
        [
            ("receiver", message.receiver.as_str()),
            ("msgtext", message.text.as_str()),
            ("token", self.endpoint.token.as_str()),
            ("mediaurl", message.media_url.as_str()),
        ]
    }
}

#[async_trait]
impl Channel for GatewayChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, message: &OutgoingMedia) -> Result<Receipt> {
        let params = self.params(message);
        let req = match self.shape {
            RequestShape::FormPost => self.client.post(&self.endpoint.base_url).form(&params[..]),
            RequestShape::JsonPost => {
                let body: serde_json::Map<String, serde_json::Value> = params
                    .iter()
                    .map(|(k, v)| (k.to_string(), serde_json::Value::from(*v)))
                    .collect();
                self.client
                    .post(&self.endpoint.base_url)
                    .header("Accept", "application/json")
                    .bearer_auth(&self.endpoint.token)
                    .json(&body)
            }
        };

        let resp = req
            .timeout(Duration::from_secs(self.endpoint.timeout_secs))
            .send()
            .await
            .map_err(|e| request_error(&self.name, self.endpoint.timeout_secs, e))?;

        let status = resp.status();
        let body = read_body(&self.name, resp).await;
        let receipt = classify_response(&self.name, status, &body)?;
        tracing::debug!(
            "📨 [{}] accepted message for {} (id={:?})",
            self.name,
            message.receiver,
            receipt.provider_id
        );
        Ok(receipt)
    }
}

/// Map a transport error onto the channel failure taxonomy.
pub(crate) fn request_error(channel: &str, timeout_secs: u64, e: reqwest::Error) -> PosterlyError {
    if e.is_timeout() {
        PosterlyError::ChannelTimeout {
            channel: channel.to_string(),
            secs: timeout_secs,
        }
    } else {
        PosterlyError::ChannelRejected {
            channel: channel.to_string(),
            message: format!("request failed: {e}"),
        }
    }
}

/// Response body as text. A body that cannot be read counts as empty; the
/// status line alone then decides the outcome.
pub(crate) async fn read_body(channel: &str, resp: reqwest::Response) -> String {
    match resp.text().await {
        Ok(body) => body,
        Err(e) => {
            tracing::debug!("📭 [{channel}] could not read response body: {e}");
            String::new()
        }
    }
}

/// Decide whether a gateway response means the message was accepted.
///
/// Non-2xx is a failure. A 2xx whose JSON body carries `success: false` is a
/// failure too. Any other 2xx, JSON or not, is a success.
pub fn classify_response(channel: &str, status: StatusCode, body: &str) -> Result<Receipt> {
    if !status.is_success() {
        return Err(PosterlyError::ChannelRejected {
            channel: channel.to_string(),
            message: format!("HTTP {status}: {}", snippet(body)),
        });
    }

    let Ok(json) = serde_json::from_str::<serde_json::Value>(body) else {
        return Ok(Receipt {
            provider_id: None,
            raw: body.to_string(),
        });
    };

    let flagged_failure = match json.get("success") {
        Some(serde_json::Value::Bool(ok)) => !ok,
        Some(serde_json::Value::String(s)) => s.eq_ignore_ascii_case("false"),
        _ => false,
    };
    if flagged_failure {
        let message = ["message", "error", "msg"]
            .iter()
            .find_map(|k| json.get(*k).and_then(|v| v.as_str()))
            .unwrap_or("success=false");
        return Err(PosterlyError::ChannelRejected {
            channel: channel.to_string(),
            message: message.to_string(),
        });
    }

    Ok(Receipt {
        provider_id: provider_id(&json),
        raw: body.to_string(),
    })
}

fn provider_id(json: &serde_json::Value) -> Option<String> {
    let candidates = [
        json.get("id"),
        json.get("messageId"),
        json.get("message_id"),
        json.get("data").and_then(|d| d.get("id")),
    ];
    candidates.into_iter().flatten().find_map(|v| match v {
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn snippet(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.chars().count() > 200 {
        format!("{}...", trimmed.chars().take(200).collect::<String>())
    } else {
        trimmed.to_string()
    }
}
