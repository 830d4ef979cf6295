//! Domain types: delivery records and the read-only collaborators they point at.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::PosterlyError;

/// Lifecycle of a scheduled delivery.
///
/// Only `Pending` records are scanned. `Sending` is the claim held by the
/// dispatcher that won the conditional update; everything else is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Sending,
    Sent,
    Failed,
    Cancelled,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sending => "sending",
            Self::Sent => "sent",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Sent | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryStatus {
    type Err = PosterlyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "sending" => Ok(Self::Sending),
            "sent" => Ok(Self::Sent),
            "failed" => Ok(Self::Failed),
            "cancelled" | "canceled" => Ok(Self::Cancelled),
            other => Err(PosterlyError::InvalidInput(format!(
                "unknown delivery status '{other}'"
            ))),
        }
    }
}

/// Campaign category a poster is scheduled under.
///
/// Closed set; add a variant here (plus its name in `FromStr`) to extend it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Offers,
    Events,
    Festivals,
    Announcements,
    Promotions,
}

impl Category {
    pub const ALL: [Category; 5] = [
        Self::Offers,
        Self::Events,
        Self::Festivals,
        Self::Announcements,
        Self::Promotions,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Offers => "offers",
            Self::Events => "events",
            Self::Festivals => "festivals",
            Self::Announcements => "announcements",
            Self::Promotions => "promotions",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = PosterlyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "offer" | "offers" => Ok(Self::Offers),
            "event" | "events" => Ok(Self::Events),
            "festival" | "festivals" => Ok(Self::Festivals),
            "announcement" | "announcements" => Ok(Self::Announcements),
            "promotion" | "promotions" => Ok(Self::Promotions),
            other => Err(PosterlyError::InvalidInput(format!(
                "unknown category '{other}'"
            ))),
        }
    }
}

/// A due minute in the canonical timezone, kept as the two strings that get
/// persisted (`YYYY-MM-DD`, `HH:mm`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DueSlot {
    pub date: String,
    pub time: String,
}

impl fmt::Display for DueSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.date, self.time)
    }
}

/// A scheduled delivery of one poster to one customer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub id: String,
    /// Customer id.
    pub target_id: String,
    /// Poster id.
    pub payload_ref: String,
    pub category: Category,
    /// `YYYY-MM-DD` in the canonical timezone.
    pub due_date: String,
    /// `HH:mm` in the canonical timezone.
    pub due_time: String,
    pub status: DeliveryStatus,
    pub attempt_count: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DeliveryRecord {
    /// New pending record. `slot` must already be canonical.
    pub fn pending(
        target_id: &str,
        payload_ref: &str,
        category: Category,
        slot: &DueSlot,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            target_id: target_id.to_string(),
            payload_ref: payload_ref.to_string(),
            category,
            due_date: slot.date.clone(),
            due_time: slot.time.clone(),
            status: DeliveryStatus::Pending,
            attempt_count: 0,
            last_attempt_at: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn slot(&self) -> DueSlot {
        DueSlot {
            date: self.due_date.clone(),
            time: self.due_time.clone(),
        }
    }
}

/// Customer as seen by the delivery core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Customer {
    pub id: String,
    pub contact_number: String,
    pub display_name: String,
    #[serde(default)]
    pub company_name: String,
}

/// Generated poster artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Poster {
    pub id: String,
    pub customer_id: String,
    /// Relative storage path or absolute URL.
    pub media_path: String,
    pub caption: Option<String>,
}

/// What the messaging layer is asked to deliver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutgoingMedia {
    /// Normalized international number, digits only.
    pub receiver: String,
    pub media_url: String,
    pub text: String,
}

/// Successful hand-off to one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Receipt {
    pub provider_id: Option<String>,
    pub raw: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_parse() {
        assert_eq!("Festival".parse::<Category>().unwrap(), Category::Festivals);
        assert_eq!(" offers ".parse::<Category>().unwrap(), Category::Offers);
        assert!("birthdays".parse::<Category>().is_err());
        for c in Category::ALL {
            assert_eq!(c.as_str().parse::<Category>().unwrap(), c);
        }
    }

    #[test]
    fn test_status_terminal() {
        assert!(!DeliveryStatus::Pending.is_terminal());
        assert!(!DeliveryStatus::Sending.is_terminal());
        assert!(DeliveryStatus::Sent.is_terminal());
        assert!(DeliveryStatus::Failed.is_terminal());
        assert_eq!("canceled".parse::<DeliveryStatus>().unwrap(), DeliveryStatus::Cancelled);
    }

    #[test]
    fn test_pending_record() {
        let slot = DueSlot {
            date: "2025-03-10".into(),
            time: "09:00".into(),
        };
        let rec =
            DeliveryRecord::pending("cust-1", "poster-1", Category::Offers, &slot, Utc::now());
        assert_eq!(rec.status, DeliveryStatus::Pending);
        assert_eq!(rec.attempt_count, 0);
        assert_eq!(rec.slot(), slot);
    }
}
