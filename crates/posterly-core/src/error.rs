//! Error taxonomy shared by every Posterly crate.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, PosterlyError>;

#[derive(Debug, Error)]
pub enum PosterlyError {
    /// Due date/time could not be parsed at creation time.
    #[error("Invalid time input: {0}")]
    InvalidTimeInput(String),

    /// Transient persistence failure. Retried on the next tick.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Customer {0} has no contact number")]
    MissingContact(String),

    #[error("Payload unavailable: {0}")]
    MissingPayload(String),

    /// Phone number or media URL rejected before any network call.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Channel {channel} timed out after {secs}s")]
    ChannelTimeout { channel: String, secs: u64 },

    #[error("Channel {channel} rejected message: {message}")]
    ChannelRejected { channel: String, message: String },

    #[error("All channels exhausted: {last}")]
    AllChannelsExhausted {
        last: String,
        attempts: Vec<String>,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PosterlyError {
    /// Stable code persisted in a record's `failure_reason` prefix.
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::InvalidTimeInput(_) => "InvalidTimeInput",
            Self::StoreUnavailable(_) => "StoreUnavailable",
            Self::MissingContact(_) => "MissingContact",
            Self::MissingPayload(_) => "MissingPayload",
            Self::InvalidInput(_) => "InvalidInput",
            Self::ChannelTimeout { .. } => "ChannelTimeout",
            Self::ChannelRejected { .. } => "ChannelRejected",
            Self::AllChannelsExhausted { .. } => "AllChannelsExhausted",
            Self::NotFound(_) => "NotFound",
            Self::Config(_) => "Config",
            Self::Io(_) => "Io",
            Self::Json(_) => "Json",
        }
    }

    /// `Code: detail` string stored on failed delivery records.
    pub fn failure_reason(&self) -> String {
        format!("{}: {}", self.reason_code(), self)
    }

    /// Whether the failure belongs to a single channel and the chain should move on.
    pub fn is_channel_failure(&self) -> bool {
        matches!(self, Self::ChannelTimeout { .. } | Self::ChannelRejected { .. })
    }
}
