//! Record creation: turns a schedule request into pending deliveries.
//!
//! Conversion to canonical date/time strings happens here, at the boundary,
//! so the scanner only ever compares strings that are already canonical.

use posterly_core::error::{PosterlyError, Result};
use posterly_core::time::{CanonicalTz, Clock, TimeInput};
use posterly_core::types::{Category, DeliveryRecord, DueSlot};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::store::{DeliveryStore, Directory};

/// When a delivery is due, as supplied by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DueSpec {
    /// Separate date (`YYYY-MM-DD`) and time (`HH:mm`) in the canonical zone.
    Parts { date: String, time: String },
    /// RFC 3339, epoch, or zone-less local string.
    DateTime(String),
}

impl DueSpec {
    fn normalize(&self, tz: &CanonicalTz) -> Result<DueSlot> {
        match self {
            Self::Parts { date, time } => tz.from_parts(date, time),
            Self::DateTime(raw) => tz.to_canonical(TimeInput::Text(raw.clone())),
        }
    }
}

/// One schedule submission: every payload × category × time becomes a record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleRequest {
    pub target_id: String,
    pub payload_refs: Vec<String>,
    pub categories: Vec<Category>,
    pub times: Vec<DueSpec>,
}

/// Creates pending delivery records.
pub struct Scheduler {
    store: Arc<dyn DeliveryStore>,
    directory: Arc<dyn Directory>,
    tz: CanonicalTz,
    clock: Arc<dyn Clock>,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn DeliveryStore>,
        directory: Arc<dyn Directory>,
        tz: CanonicalTz,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            directory,
            tz,
            clock,
        }
    }

    /// Validate and persist a request. Nothing is stored unless every time parses.
    ///
    /// Times already in the past are accepted; those records are picked up by
    /// the next tick.
    pub async fn schedule(&self, request: &ScheduleRequest) -> Result<Vec<DeliveryRecord>> {
        if request.payload_refs.is_empty()
            || request.categories.is_empty()
            || request.times.is_empty()
        {
            return Err(PosterlyError::InvalidInput(
                "schedule needs at least one payload, category and time".into(),
            ));
        }

        let slots = request
            .times
            .iter()
            .map(|t| t.normalize(&self.tz))
            .collect::<Result<Vec<_>>>()?;

        if self.directory.customer(&request.target_id).await?.is_none() {
            return Err(PosterlyError::NotFound(format!(
                "customer {}",
                request.target_id
            )));
        }

        let now = self.clock.now();
        let mut records = Vec::with_capacity(
            request.payload_refs.len() * request.categories.len() * slots.len(),
        );
        for payload in &request.payload_refs {
            for category in &request.categories {
                for slot in &slots {
                    records.push(DeliveryRecord::pending(
                        &request.target_id,
                        payload,
                        *category,
                        slot,
                        now,
                    ));
                }
            }
        }

        self.store.insert_batch(&records).await?;
        tracing::info!(
            "📅 Scheduled {} deliveries for customer {}",
            records.len(),
            request.target_id
        );
        Ok(records)
    }

    /// Schedule a single poster at one time.
    pub async fn schedule_one(
        &self,
        target_id: &str,
        payload_ref: &str,
        category: Category,
        due: DueSpec,
    ) -> Result<DeliveryRecord> {
        let request = ScheduleRequest {
            target_id: target_id.to_string(),
            payload_refs: vec![payload_ref.to_string()],
            categories: vec![category],
            times: vec![due],
        };
        self.schedule(&request)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| PosterlyError::InvalidInput("nothing scheduled".into()))
    }
}
