//! # Posterly Core
//!
//! Shared building blocks for scheduled poster delivery: configuration,
//! the error taxonomy, domain types, canonical-timezone handling and the
//! traits outbound transports implement.

pub mod config;
pub mod error;
pub mod time;
pub mod traits;
pub mod types;

pub use config::PosterlyConfig;
pub use error::{PosterlyError, Result};
pub use time::{CanonicalTz, Clock, FixedClock, SystemClock, TimeInput};
pub use traits::{Channel, Delivery, Messenger};
pub use types::{
    Category, Customer, DeliveryRecord, DeliveryStatus, DueSlot, OutgoingMedia, Poster, Receipt,
};
