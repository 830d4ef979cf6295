//! Storage seams for delivery records and the collaborators they reference.
//!
//! Every state change out of `pending` or `sending` is a conditional write:
//! the caller learns whether it won, and losing is a no-op.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use posterly_core::error::Result;
use posterly_core::types::{Customer, DeliveryRecord, DeliveryStatus, DueSlot, Poster};

/// Terminal write for a claimed record.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    /// `Sent` or `Failed`.
    pub status: DeliveryStatus,
    pub at: DateTime<Utc>,
    pub failure_reason: Option<String>,
    /// Whether the provider chain was invoked for this attempt.
    pub counted_attempt: bool,
}

/// Filter for dashboard listings.
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub status: Option<DeliveryStatus>,
    pub target_id: Option<String>,
    /// 0 means no limit.
    pub limit: usize,
}

#[async_trait]
pub trait DeliveryStore: Send + Sync {
    async fn insert(&self, record: &DeliveryRecord) -> Result<()>;

    /// All-or-nothing insert.
    async fn insert_batch(&self, records: &[DeliveryRecord]) -> Result<()>;

    async fn get(&self, id: &str) -> Result<Option<DeliveryRecord>>;

    /// Pending records whose slot is at or before `up_to`, oldest first.
    async fn due_pending(&self, up_to: &DueSlot, limit: usize) -> Result<Vec<DeliveryRecord>>;

    /// `pending → sending`. Returns false if someone else got there first.
    async fn try_claim(&self, id: &str, at: DateTime<Utc>) -> Result<bool>;

    /// `sending → sent|failed`. Returns false if the claim no longer holds.
    async fn complete(&self, id: &str, completion: &Completion) -> Result<bool>;

    /// `sending → pending`, handing a claim back untouched.
    async fn release_claim(&self, id: &str, at: DateTime<Utc>) -> Result<bool>;

    /// `pending → cancelled`.
    async fn cancel(&self, id: &str, at: DateTime<Utc>) -> Result<bool>;

    /// Fail claims last touched before `older_than`. Returns how many.
    async fn release_stale_claims(&self, older_than: DateTime<Utc>, at: DateTime<Utc>)
    -> Result<usize>;

    async fn list(&self, filter: &ListFilter) -> Result<Vec<DeliveryRecord>>;
}

/// Read-only lookup of customers and posters.
#[async_trait]
pub trait Directory: Send + Sync {
    async fn customer(&self, id: &str) -> Result<Option<Customer>>;
    async fn poster(&self, id: &str) -> Result<Option<Poster>>;
}
