//! Last-resort channel: one plain GET with every field in the query string.
//!
//! No connection reuse, no custom headers, HTTP/1.1 only. It exists to get a
//! message through when the pooled gateway clients keep failing.

use async_trait::async_trait;
use posterly_core::config::ChannelEndpoint;
use posterly_core::error::{PosterlyError, Result};
use posterly_core::traits::Channel;
use posterly_core::types::{OutgoingMedia, Receipt};
use reqwest::Url;
use std::time::Duration;

use crate::gateway::{classify_response, read_body, request_error};

pub struct RawHttpChannel {
    name: String,
    endpoint: ChannelEndpoint,
}

impl RawHttpChannel {
    pub fn new(name: &str, endpoint: ChannelEndpoint) -> Self {
        Self {
            name: name.to_string(),
            endpoint,
        }
    }

    /// Full request URL with percent-encoded parameters.
    pub fn request_url(&self, message: &OutgoingMedia) -> Result<Url> {
        Url::parse_with_params(
            &self.endpoint.base_url,
            [
                ("receiver", message.receiver.as_str()),
                ("msgtext", message.text.as_str()),
                ("token", self.endpoint.token.as_str()),
                ("mediaurl", message.media_url.as_str()),
            ],
        )
        .map_err(|e| PosterlyError::ChannelRejected {
            channel: self.name.clone(),
            message: format!("bad endpoint '{}': {e}", self.endpoint.base_url),
        })
    }
}

#[async_trait]
impl Channel for RawHttpChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, message: &OutgoingMedia) -> Result<Receipt> {
        let url = self.request_url(message)?;
        let client = reqwest::Client::builder()
            .http1_only()
            .pool_max_idle_per_host(0)
            .timeout(Duration::from_secs(self.endpoint.timeout_secs))
            .build()
            .map_err(|e| request_error(&self.name, self.endpoint.timeout_secs, e))?;

        let resp = client
            .get(url)
            .send()
            .await
            .map_err(|e| request_error(&self.name, self.endpoint.timeout_secs, e))?;

        let status = resp.status();
        let body = read_body(&self.name, resp).await;
        classify_response(&self.name, status, &body)
    }
}
