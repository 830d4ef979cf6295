//! Due-job scanner: selects pending records whose due minute has arrived.
//!
//! A record is due when its instant is at or before the end of the current
//! canonical minute. Matching on `<=` rather than "equals this minute" means
//! records whose minute passed while the process was down are still sent on
//! the first tick after restart.
//!
//! The store pre-filters on the lexical `date HH:mm` slot, which stops being
//! monotonic when clocks fall back. The pre-filter bound is therefore padded
//! past any DST shift and the exact cut is made on instants.

use chrono::{DateTime, Duration, Utc};
use posterly_core::error::Result;
use posterly_core::time::CanonicalTz;
use posterly_core::types::DeliveryRecord;
use std::sync::Arc;

use crate::store::DeliveryStore;

/// Wider than any real-world DST shift.
const SLOT_PADDING_HOURS: i64 = 2;

pub struct Scanner {
    store: Arc<dyn DeliveryStore>,
    tz: CanonicalTz,
    limit: usize,
}

impl Scanner {
    pub fn new(store: Arc<dyn DeliveryStore>, tz: CanonicalTz, limit: usize) -> Self {
        Self { store, tz, limit }
    }

    pub fn timezone(&self) -> CanonicalTz {
        self.tz
    }

    /// Pending records due at `now`. Store failures are returned to the caller.
    pub async fn scan(&self, now: DateTime<Utc>) -> Result<Vec<DeliveryRecord>> {
        let (start, end) = self.tz.minute_window(now);
        let current = self.tz.slot_of(start);
        let bound = self.tz.slot_of(end + Duration::hours(SLOT_PADDING_HOURS));

        let candidates = self.store.due_pending(&bound, self.limit).await?;
        let total = candidates.len();

        let due: Vec<DeliveryRecord> = candidates
            .into_iter()
            .filter(|record| match self.tz.due_instant(&record.due_date, &record.due_time) {
                Ok(instant) => instant <= end,
                Err(e) => {
                    tracing::warn!(
                        "⚠️ Skipping delivery {} with unreadable due time: {e}",
                        record.id
                    );
                    false
                }
            })
            .collect();

        let overdue = due
            .iter()
            .filter(|r| {
                !self
                    .tz
                    .is_within_window(&r.due_date, &r.due_time, start, end)
                    .unwrap_or(false)
            })
            .count();
        if overdue > 0 {
            tracing::info!("⏪ {overdue} overdue deliveries picked up (due before {current})");
        }
        tracing::debug!(
            "🔎 Scan at {} {}: {} due of {} candidates",
            current,
            self.tz.name(),
            due.len(),
            total
        );
        Ok(due)
    }
}
