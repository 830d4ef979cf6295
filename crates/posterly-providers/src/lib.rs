//! # Posterly Providers
//!
//! Outbound WhatsApp delivery. Three interchangeable channels sit behind one
//! [`FallbackChain`]:
//!
//! ```text
//! FallbackChain (validate → try in order, shared budget)
//!   ├── primary    GatewayChannel  form POST
//!   ├── secondary  GatewayChannel  JSON POST + headers
//!   └── fallback   RawHttpChannel  bare GET, query string
//! ```

pub mod failover;
pub mod gateway;
pub mod raw_http;
pub mod validate;

pub use failover::{ChannelHealth, FallbackChain};
pub use gateway::{GatewayChannel, RequestShape};
pub use raw_http::RawHttpChannel;

use posterly_core::config::PosterlyConfig;
use posterly_core::error::{PosterlyError, Result};
use std::time::Duration;

/// Build the fallback chain from configuration.
///
/// Disabled endpoints and endpoints without a `base_url` are skipped.
pub fn create_chain(config: &PosterlyConfig) -> Result<FallbackChain> {
    let gateway = &config.gateway;
    let mut chain = FallbackChain::new(
        &config.delivery.default_country_code,
        config.delivery.min_phone_digits,
    )
    .with_budget(Duration::from_secs(config.scheduler.dispatch_budget_secs));

    if usable(&gateway.primary) {
        chain = chain.with_channel(
            Box::new(GatewayChannel::new(
                "primary",
                gateway.primary.clone(),
                RequestShape::FormPost,
            )),
            Duration::from_secs(gateway.primary.timeout_secs),
        );
    }
    if usable(&gateway.secondary) {
        chain = chain.with_channel(
            Box::new(GatewayChannel::new(
                "secondary",
                gateway.secondary.clone(),
                RequestShape::JsonPost,
            )),
            Duration::from_secs(gateway.secondary.timeout_secs),
        );
    }
    if usable(&gateway.fallback) {
        chain = chain.with_channel(
            Box::new(RawHttpChannel::new("fallback", gateway.fallback.clone())),
            Duration::from_secs(gateway.fallback.timeout_secs),
        );
    }

    if chain.chain_len() == 0 {
        return Err(PosterlyError::Config(
            "no gateway channel configured (set gateway.primary.base_url)".into(),
        ));
    }
    tracing::info!("📡 Messaging chain: {}", chain.channel_names().join(" → "));
    Ok(chain)
}

fn usable(endpoint: &posterly_core::config::ChannelEndpoint) -> bool {
    endpoint.enabled && !endpoint.base_url.trim().is_empty()
}
