//! Read-side projection of delivery records for dashboards and the CLI.
//!
//! Nothing here writes to the store.

use chrono::{DateTime, Utc};
use posterly_core::error::Result;
use posterly_core::time::CanonicalTz;
use posterly_core::types::{Category, Customer, DeliveryRecord, DeliveryStatus};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

use crate::store::Directory;

/// A delivery record as a person wants to read it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeliveryView {
    pub id: String,
    pub customer_id: String,
    /// Empty when the customer no longer exists.
    pub customer_name: String,
    pub poster_id: String,
    pub category: Category,
    /// e.g. `Mon, 10 Mar 2025 09:00 AM IST`. Raw slot if unreadable.
    pub scheduled_for: String,
    pub media_url: Option<String>,
    pub status: DeliveryStatus,
    pub attempt_count: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
}

/// Per-status counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusSummary {
    pub pending: usize,
    pub sending: usize,
    pub sent: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl StatusSummary {
    pub fn total(&self) -> usize {
        self.pending + self.sending + self.sent + self.failed + self.cancelled
    }
}

pub struct Reconciler {
    directory: Arc<dyn Directory>,
    tz: CanonicalTz,
    media_base_url: String,
}

impl Reconciler {
    pub fn new(directory: Arc<dyn Directory>, tz: CanonicalTz, media_base_url: &str) -> Self {
        Self {
            directory,
            tz,
            media_base_url: media_base_url.to_string(),
        }
    }

    /// Project records into views, in the order given.
    pub async fn project(&self, records: &[DeliveryRecord]) -> Result<Vec<DeliveryView>> {
        let mut customers: HashMap<String, Option<Customer>> = HashMap::new();
        let mut views = Vec::with_capacity(records.len());

        for record in records {
            if !customers.contains_key(&record.target_id) {
                let customer = self.directory.customer(&record.target_id).await?;
                customers.insert(record.target_id.clone(), customer);
            }
            let customer_name = customers
                .get(&record.target_id)
                .and_then(|c| c.as_ref())
                .map(|c| c.display_name.clone())
                .unwrap_or_default();

            let media_url = self
                .directory
                .poster(&record.payload_ref)
                .await?
                .and_then(|p| media_url(&self.media_base_url, &p.media_path));

            let scheduled_for = self
                .tz
                .display(&record.due_date, &record.due_time)
                .unwrap_or_else(|_| record.slot().to_string());

            views.push(DeliveryView {
                id: record.id.clone(),
                customer_id: record.target_id.clone(),
                customer_name,
                poster_id: record.payload_ref.clone(),
                category: record.category,
                scheduled_for,
                media_url,
                status: record.status,
                attempt_count: record.attempt_count,
                last_attempt_at: record.last_attempt_at,
                failure_reason: record.failure_reason.clone(),
            });
        }
        Ok(views)
    }
}

/// Count records by status.
pub fn summary(records: &[DeliveryRecord]) -> StatusSummary {
    let mut s = StatusSummary::default();
    for record in records {
        match record.status {
            DeliveryStatus::Pending => s.pending += 1,
            DeliveryStatus::Sending => s.sending += 1,
            DeliveryStatus::Sent => s.sent += 1,
            DeliveryStatus::Failed => s.failed += 1,
            DeliveryStatus::Cancelled => s.cancelled += 1,
        }
    }
    s
}

/// Public URL for a poster's media path.
///
/// Absolute `http(s)` paths pass through; relative ones are joined onto
/// `base`. `None` when either side is empty.
pub fn media_url(base: &str, path: &str) -> Option<String> {
    let path = path.trim();
    if path.is_empty() {
        return None;
    }
    if path.starts_with("http://") || path.starts_with("https://") {
        return Some(path.to_string());
    }
    let base = base.trim();
    if base.is_empty() {
        return None;
    }
    Some(format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::SqliteStore;
    use crate::store::DeliveryStore;
    use posterly_core::types::{DueSlot, Poster};

    fn record(target: &str, poster: &str, status: DeliveryStatus) -> DeliveryRecord {
        let mut rec = DeliveryRecord::pending(
            target,
            poster,
            Category::Festivals,
            &DueSlot {
                date: "2025-03-10".into(),
                time: "09:00".into(),
            },
            Utc::now(),
        );
        rec.status = status;
        rec
    }

    #[test]
    fn test_media_url_join() {
        let base = "http://localhost:8080/uploads/";
        assert_eq!(
            media_url(base, "/posters/a.png").as_deref(),
            Some("http://localhost:8080/uploads/posters/a.png")
        );
        assert_eq!(
            media_url("http://cdn.test/u", "a.png").as_deref(),
            Some("http://cdn.test/u/a.png")
        );
        assert_eq!(
            media_url(base, "https://cdn.test/x.jpg").as_deref(),
            Some("https://cdn.test/x.jpg")
        );
        assert_eq!(media_url(base, "  "), None);
        assert_eq!(media_url("", "a.png"), None);
    }

    #[test]
    fn test_summary_counts() {
        let records = vec![
            record("c", "p", DeliveryStatus::Pending),
            record("c", "p", DeliveryStatus::Pending),
            record("c", "p", DeliveryStatus::Sent),
            record("c", "p", DeliveryStatus::Failed),
        ];
        let s = summary(&records);
        assert_eq!(s.pending, 2);
        assert_eq!(s.sent, 1);
        assert_eq!(s.failed, 1);
        assert_eq!(s.total(), 4);
    }

    #[tokio::test]
    async fn test_project_adds_display_fields_without_writing() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        store
            .upsert_customer(&Customer {
                id: "cust-1".into(),
                contact_number: "9876543210".into(),
                display_name: "Asha Traders".into(),
                company_name: String::new(),
            })
            .unwrap();
        store
            .upsert_poster(&Poster {
                id: "poster-1".into(),
                customer_id: "cust-1".into(),
                media_path: "holi.png".into(),
                caption: None,
            })
            .unwrap();

        let mut failed = record("cust-1", "poster-1", DeliveryStatus::Failed);
        failed.failure_reason =
            Some("AllChannelsExhausted: All channels exhausted: HTTP 503".into());
        store.insert(&failed).await.unwrap();
        let orphan = record("ghost", "missing", DeliveryStatus::Pending);

        let reconciler = Reconciler::new(
            store.clone(),
            CanonicalTz::new("Asia/Kolkata").unwrap(),
            "http://localhost:8080/uploads/",
        );
        let views = reconciler.project(&[failed.clone(), orphan]).await.unwrap();

        assert_eq!(views.len(), 2);
        assert_eq!(views[0].customer_name, "Asha Traders");
        assert_eq!(views[0].scheduled_for, "Mon, 10 Mar 2025 09:00 AM IST");
        assert_eq!(
            views[0].media_url.as_deref(),
            Some("http://localhost:8080/uploads/holi.png")
        );
        assert_eq!(views[0].status, DeliveryStatus::Failed);
        assert_eq!(views[0].failure_reason, failed.failure_reason);
        assert_eq!(views[1].customer_name, "");
        assert_eq!(views[1].media_url, None);

        let stored = store.get(&failed.id).await.unwrap().unwrap();
        assert_eq!(stored.status, DeliveryStatus::Failed);
        assert_eq!(stored.failure_reason, failed.failure_reason);
    }
}
