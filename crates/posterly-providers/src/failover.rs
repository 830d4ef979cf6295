//! Channel failover: try primary → secondary → fallback until one accepts.
//!
//! Validation runs once up front; an invalid recipient or media URL never
//! reaches a channel. Each channel attempt gets its own timeout, and the
//! whole chain shares one budget so a single record cannot stall a tick.

use async_trait::async_trait;
use posterly_core::error::{PosterlyError, Result};
use posterly_core::traits::{Channel, Delivery, Messenger};
use posterly_core::types::OutgoingMedia;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

use crate::validate;

/// Per-channel bookkeeping.
struct ChannelSlot {
    channel: Box<dyn Channel>,
    timeout: Duration,
    /// Consecutive failure count.
    failures: AtomicU32,
    successes: AtomicU64,
}

impl ChannelSlot {
    fn record_success(&self) {
        self.failures.store(0, Ordering::Relaxed);
        self.successes.fetch_add(1, Ordering::Relaxed);
    }

    fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }
}

/// Snapshot of one channel's counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelHealth {
    pub name: String,
    pub consecutive_failures: u32,
    pub successes: u64,
}

/// Ordered chain of channels with a shared time budget.
pub struct FallbackChain {
    slots: Vec<ChannelSlot>,
    budget: Duration,
    default_country_code: String,
    min_phone_digits: usize,
}

impl FallbackChain {
    /// Empty chain; add channels in priority order with [`FallbackChain::with_channel`].
    pub fn new(default_country_code: &str, min_phone_digits: usize) -> Self {
        Self {
            slots: Vec::new(),
            budget: Duration::from_secs(90),
            default_country_code: default_country_code.to_string(),
            min_phone_digits,
        }
    }

    pub fn with_channel(mut self, channel: Box<dyn Channel>, timeout: Duration) -> Self {
        self.slots.push(ChannelSlot {
            channel,
            timeout,
            failures: AtomicU32::new(0),
            successes: AtomicU64::new(0),
        });
        self
    }

    /// Bound on the whole chain for one message.
    pub fn with_budget(mut self, budget: Duration) -> Self {
        self.budget = budget;
        self
    }

    /// Number of channels in the chain.
    pub fn chain_len(&self) -> usize {
        self.slots.len()
    }

    pub fn channel_names(&self) -> Vec<&str> {
        self.slots.iter().map(|s| s.channel.name()).collect()
    }

    pub fn health_status(&self) -> Vec<ChannelHealth> {
        self.slots
            .iter()
            .map(|s| ChannelHealth {
                name: s.channel.name().to_string(),
                consecutive_failures: s.failures.load(Ordering::Relaxed),
                successes: s.successes.load(Ordering::Relaxed),
            })
            .collect()
    }

    /// Validate inputs into a message ready for the channels.
    pub fn prepare(
        &self,
        contact_number: &str,
        media_url: &str,
        text: &str,
    ) -> Result<OutgoingMedia> {
        Ok(OutgoingMedia {
            receiver: validate::normalize_phone(
                contact_number,
                &self.default_country_code,
                self.min_phone_digits,
            )?,
            media_url: validate::media_url(media_url)?,
            text: text.to_string(),
        })
    }

    /// Walk the chain for an already validated message.
    pub async fn deliver(&self, message: &OutgoingMedia) -> Result<Delivery> {
        let deadline = Instant::now() + self.budget;
        let mut attempts: Vec<String> = Vec::new();

        for (idx, slot) in self.slots.iter().enumerate() {
            let name = slot.channel.name();
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                tracing::warn!(
                    "⏱️ Dispatch budget of {}s spent before channel {}",
                    self.budget.as_secs(),
                    name
                );
                attempts.push(format!("{name}: skipped, dispatch budget exhausted"));
                break;
            }

            let limit = slot.timeout.min(remaining);
            let result = match tokio::time::timeout(limit, slot.channel.send(message)).await {
                Ok(result) => result,
                Err(_) => Err(PosterlyError::ChannelTimeout {
                    channel: name.to_string(),
                    secs: whole_secs(limit),
                }),
            };

            match result {
                Ok(receipt) => {
                    if idx > 0 {
                        tracing::info!(
                            "🔄 Failover: {} → {} (success)",
                            self.slots[0].channel.name(),
                            name
                        );
                    }
                    slot.record_success();
                    return Ok(Delivery {
                        channel: name.to_string(),
                        provider_id: receipt.provider_id,
                        raw: receipt.raw,
                    });
                }
                Err(e) => {
                    slot.record_failure();
                    tracing::warn!(
                        "⚠️ Channel {} failed ({} in a row): {}",
                        name,
                        slot.failures.load(Ordering::Relaxed),
                        e
                    );
                    attempts.push(e.to_string());
                }
            }
        }

        let last = attempts
            .last()
            .cloned()
            .unwrap_or_else(|| "no channels configured".to_string());
        Err(PosterlyError::AllChannelsExhausted { last, attempts })
    }
}

/// Seconds, rounded up so a sub-second limit never reads as 0s.
fn whole_secs(d: Duration) -> u64 {
    d.as_millis().div_ceil(1000) as u64
}

#[async_trait]
impl Messenger for FallbackChain {
    async fn send(&self, contact_number: &str, media_url: &str, text: &str) -> Result<Delivery> {
        let message = self.prepare(contact_number, media_url, text)?;
        self.deliver(&message).await
    }
}
