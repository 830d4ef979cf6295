//! Seams between the delivery core and its outbound transports.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{OutgoingMedia, Receipt};

/// One outbound transport (gateway endpoint) able to deliver a media message.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Short name used in logs and outcome attribution.
    fn name(&self) -> &str;

    /// Attempt delivery once. Failure must be `ChannelTimeout` or
    /// `ChannelRejected` so a fallback chain can move on.
    async fn send(&self, message: &OutgoingMedia) -> Result<Receipt>;
}

/// Successful delivery through a chain of channels.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// Name of the channel that accepted the message.
    pub channel: String,
    pub provider_id: Option<String>,
    pub raw: String,
}

/// Whatever the dispatcher hands messages to.
#[async_trait]
pub trait Messenger: Send + Sync {
    async fn send(&self, contact_number: &str, media_url: &str, text: &str) -> Result<Delivery>;
}
