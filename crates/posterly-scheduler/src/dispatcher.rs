//! Dispatcher: claims a due record, resolves what to send, and records the outcome.
//!
//! ```text
//! pending ──try_claim──▶ sending ──complete──▶ sent | failed
//!    │                      │
//!    └─ claim lost: skip    └─ store down while resolving: release_claim
//! ```
//!
//! The claim is taken before any network call and the terminal write is
//! conditional on the claim, so a record is handed to the provider chain at
//! most once no matter how many ticks or processes race for it.
//!
//! A terminal write that fails is kept in memory and replayed by
//! [`Dispatcher::flush_completions`] until the store accepts it.

use posterly_core::config::DeliveryConfig;
use posterly_core::error::PosterlyError;
use posterly_core::time::Clock;
use posterly_core::traits::{Delivery, Messenger};
use posterly_core::types::{DeliveryRecord, DeliveryStatus};
use posterly_providers::validate;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::{AbortHandle, JoinHandle};

use crate::reconciler::media_url;
use crate::store::{Completion, DeliveryStore, Directory};

/// What happened to one record.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Sent {
        channel: String,
        provider_id: Option<String>,
    },
    Failed {
        reason: String,
    },
    /// Claim lost, or handed back untouched. No provider call was made.
    Skipped,
}

/// Why a claimed record could not be delivered.
struct AttemptError {
    error: PosterlyError,
    /// The provider chain was invoked.
    counted: bool,
}

impl AttemptError {
    fn before_send(error: PosterlyError) -> Self {
        Self { error, counted: false }
    }
}

pub struct Dispatcher {
    store: Arc<dyn DeliveryStore>,
    directory: Arc<dyn Directory>,
    messenger: Arc<dyn Messenger>,
    clock: Arc<dyn Clock>,
    media_base_url: String,
    caption: String,
    budget: Duration,
    permits: Arc<Semaphore>,
    jobs: Mutex<HashMap<String, AbortHandle>>,
    /// Outcomes the store refused to record, keyed by record id.
    unwritten: Mutex<HashMap<String, Completion>>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn DeliveryStore>,
        directory: Arc<dyn Directory>,
        messenger: Arc<dyn Messenger>,
        clock: Arc<dyn Clock>,
        delivery: &DeliveryConfig,
    ) -> Self {
        Self {
            store,
            directory,
            messenger,
            clock,
            media_base_url: delivery.media_base_url.clone(),
            caption: delivery.caption.clone(),
            budget: Duration::from_secs(90),
            permits: Arc::new(Semaphore::new(4)),
            jobs: Mutex::new(HashMap::new()),
            unwritten: Mutex::new(HashMap::new()),
        }
    }

    /// Overall time allowed for one provider call, fallbacks included.
    pub fn with_budget(mut self, budget: Duration) -> Self {
        self.budget = budget;
        self
    }

    /// Maximum dispatches running at once through [`Dispatcher::spawn`].
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.permits = Arc::new(Semaphore::new(max.max(1)));
        self
    }

    /// Deliver one record. Never returns an error: every failure ends up in
    /// the record's status or in the log.
    pub async fn dispatch(&self, record: &DeliveryRecord) -> DispatchOutcome {
        match self.store.try_claim(&record.id, self.clock.now()).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!("⏭️ Delivery {} already claimed", record.id);
                return DispatchOutcome::Skipped;
            }
            Err(e) => {
                tracing::warn!("⚠️ Could not claim delivery {}: {e}", record.id);
                return DispatchOutcome::Skipped;
            }
        }

        let attempt = self.attempt(record).await;
        let now = self.clock.now();

        let (completion, outcome) = match attempt {
            Ok(delivery) => {
                tracing::info!(
                    "✅ Delivery {} sent via {} ({} @ {})",
                    record.id,
                    delivery.channel,
                    record.target_id,
                    record.slot()
                );
                (
                    Completion {
                        status: DeliveryStatus::Sent,
                        at: now,
                        failure_reason: None,
                        counted_attempt: true,
                    },
                    DispatchOutcome::Sent {
                        channel: delivery.channel,
                        provider_id: delivery.provider_id,
                    },
                )
            }
            Err(AttemptError {
                error: PosterlyError::StoreUnavailable(msg),
                ..
            }) => {
                tracing::warn!("⚠️ Store unavailable while resolving {}: {msg}", record.id);
                if let Err(e) = self.store.release_claim(&record.id, now).await {
                    tracing::error!("❌ Could not release claim on {}: {e}", record.id);
                }
                return DispatchOutcome::Skipped;
            }
            Err(AttemptError { error, counted }) => {
                let reason = error.failure_reason();
                tracing::warn!("❌ Delivery {} failed: {reason}", record.id);
                (
                    Completion {
                        status: DeliveryStatus::Failed,
                        at: now,
                        failure_reason: Some(reason.clone()),
                        counted_attempt: counted,
                    },
                    DispatchOutcome::Failed { reason },
                )
            }
        };

        match self.store.complete(&record.id, &completion).await {
            Ok(true) => {}
            Ok(false) => tracing::warn!("⚠️ Claim on {} was lost before completion", record.id),
            Err(e) => {
                tracing::error!("❌ Could not record outcome for {}: {e}", record.id);
                self.unwritten().insert(record.id.clone(), completion);
            }
        }
        outcome
    }

    /// Retry terminal writes the store refused earlier.
    ///
    /// Entries leave the queue once the store answers, whether or not the
    /// claim still held. Returns how many were written.
    pub async fn flush_completions(&self) -> usize {
        let queued: Vec<(String, Completion)> = self
            .unwritten()
            .iter()
            .map(|(id, c)| (id.clone(), c.clone()))
            .collect();

        let mut written = 0;
        for (id, completion) in queued {
            match self.store.complete(&id, &completion).await {
                Ok(won) => {
                    self.unwritten().remove(&id);
                    if won {
                        written += 1;
                        tracing::info!("💾 Recorded deferred outcome for {id}");
                    } else {
                        tracing::warn!("⚠️ Claim on {id} was lost before its deferred completion");
                    }
                }
                Err(e) => tracing::warn!("⚠️ Outcome for {id} still unwritten: {e}"),
            }
        }
        written
    }

    /// Ids of records whose outcome is waiting to be written.
    pub fn unwritten_completions(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.unwritten().keys().cloned().collect();
        ids.sort();
        ids
    }

    async fn attempt(&self, record: &DeliveryRecord) -> Result<Delivery, AttemptError> {
        let customer = self
            .directory
            .customer(&record.target_id)
            .await
            .map_err(AttemptError::before_send)?;
        let contact = customer
            .map(|c| c.contact_number)
            .filter(|n| !n.trim().is_empty())
            .ok_or_else(|| {
                AttemptError::before_send(PosterlyError::MissingContact(record.target_id.clone()))
            })?;

        let poster = self
            .directory
            .poster(&record.payload_ref)
            .await
            .map_err(AttemptError::before_send)?
            .ok_or_else(|| {
                AttemptError::before_send(PosterlyError::MissingPayload(format!(
                    "poster {} not found",
                    record.payload_ref
                )))
            })?;
        let url = media_url(&self.media_base_url, &poster.media_path)
            .ok_or_else(|| format!("poster {} has no usable media path", poster.id))
            .and_then(|url| {
                validate::media_url(&url).map_err(|e| format!("poster {}: {e}", poster.id))
            })
            .map_err(|msg| AttemptError::before_send(PosterlyError::MissingPayload(msg)))?;
        let text = poster
            .caption
            .filter(|c| !c.trim().is_empty())
            .unwrap_or_else(|| self.caption.clone());

        match tokio::time::timeout(self.budget, self.messenger.send(&contact, &url, &text)).await {
            Ok(Ok(delivery)) => Ok(delivery),
            Ok(Err(error)) => {
                let counted = !matches!(error, PosterlyError::InvalidInput(_));
                Err(AttemptError { error, counted })
            }
            Err(_) => Err(AttemptError {
                error: PosterlyError::AllChannelsExhausted {
                    last: format!("dispatch budget of {}s spent", self.budget.as_secs()),
                    attempts: Vec::new(),
                },
                counted: true,
            }),
        }
    }

    /// Run [`Dispatcher::dispatch`] on the runtime under the concurrency limit.
    ///
    /// Returns `None` if a job for this record is already in flight.
    pub fn spawn(
        self: &Arc<Self>,
        record: DeliveryRecord,
    ) -> Option<JoinHandle<DispatchOutcome>> {
        let mut jobs = self.jobs();
        if jobs.contains_key(&record.id) {
            tracing::debug!("⏭️ Delivery {} already in flight", record.id);
            return None;
        }

        let this = Arc::clone(self);
        let id = record.id.clone();
        let handle = tokio::spawn(async move {
            // Closed only if the semaphore is dropped, which cannot happen while `this` lives.
            let _permit = this.permits.clone().acquire_owned().await.ok();
            let outcome = this.dispatch(&record).await;
            this.jobs().remove(&record.id);
            outcome
        });
        jobs.insert(id, handle.abort_handle());
        Some(handle)
    }

    /// Cancel a pending record and abort its queued job, if any.
    ///
    /// A record that is already being sent is left alone and `false` is returned.
    pub async fn cancel(&self, id: &str) -> posterly_core::Result<bool> {
        let cancelled = self.store.cancel(id, self.clock.now()).await?;
        if cancelled {
            if let Some(handle) = self.jobs().remove(id) {
                handle.abort();
            }
            tracing::info!("🚫 Delivery {id} cancelled");
        }
        Ok(cancelled)
    }

    /// Ids of records with a job still running.
    pub fn in_flight(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.jobs().keys().cloned().collect();
        ids.sort();
        ids
    }

    fn jobs(&self) -> MutexGuard<'_, HashMap<String, AbortHandle>> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn unwritten(&self) -> MutexGuard<'_, HashMap<String, Completion>> {
        self.unwritten.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::SqliteStore;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use posterly_core::time::FixedClock;
    use posterly_core::types::{Category, Customer, DueSlot, Poster};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts calls; optionally sleeps or fails.
    struct CountingMessenger {
        calls: AtomicUsize,
        delay: Duration,
        fail: bool,
        seen: Mutex<Vec<(String, String, String)>>,
    }

    impl CountingMessenger {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
                fail: false,
                seen: Mutex::new(Vec::new()),
            }
        }
        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Messenger for CountingMessenger {
        async fn send(
            &self,
            contact: &str,
            url: &str,
            text: &str,
        ) -> posterly_core::Result<Delivery> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen
                .lock()
                .unwrap()
                .push((contact.into(), url.into(), text.into()));
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail {
                return Err(PosterlyError::AllChannelsExhausted {
                    last: "HTTP 503".into(),
                    attempts: vec!["primary: HTTP 500".into(), "HTTP 503".into()],
                });
            }
            Ok(Delivery {
                channel: "primary".into(),
                provider_id: Some("m-1".into()),
                raw: "{}".into(),
            })
        }
    }

    struct Fixture {
        store: Arc<SqliteStore>,
        messenger: Arc<CountingMessenger>,
        dispatcher: Arc<Dispatcher>,
    }

    fn fixture(messenger: CountingMessenger) -> Fixture {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        store
            .upsert_customer(&Customer {
                id: "cust-1".into(),
                contact_number: "9876543210".into(),
                display_name: "Asha".into(),
                company_name: "Asha Traders".into(),
            })
            .unwrap();
        store
            .upsert_customer(&Customer {
                id: "cust-mute".into(),
                contact_number: " ".into(),
                display_name: "No Phone".into(),
                company_name: String::new(),
            })
            .unwrap();
        store
            .upsert_poster(&Poster {
                id: "poster-1".into(),
                customer_id: "cust-1".into(),
                media_path: "posters/holi.png".into(),
                caption: None,
            })
            .unwrap();
        let messenger = Arc::new(messenger);
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2025, 3, 10, 3, 30, 0).unwrap(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            store.clone(),
            store.clone(),
            messenger.clone(),
            clock,
            &DeliveryConfig::default(),
        ));
        Fixture {
            store,
            messenger,
            dispatcher,
        }
    }

    async fn seed(store: &SqliteStore, target: &str, poster: &str) -> DeliveryRecord {
        let rec = DeliveryRecord::pending(
            target,
            poster,
            Category::Festivals,
            &DueSlot {
                date: "2025-03-10".into(),
                time: "09:00".into(),
            },
            Utc::now(),
        );
        store.insert(&rec).await.unwrap();
        rec
    }

    #[tokio::test]
    async fn test_sent_at_nine_ist() {
        let f = fixture(CountingMessenger::new());
        let rec = seed(&f.store, "cust-1", "poster-1").await;

        let outcome = f.dispatcher.dispatch(&rec).await;
        assert_eq!(
            outcome,
            DispatchOutcome::Sent {
                channel: "primary".into(),
                provider_id: Some("m-1".into())
            }
        );

        let stored = f.store.get(&rec.id).await.unwrap().unwrap();
        assert_eq!(stored.status, DeliveryStatus::Sent);
        assert_eq!(stored.attempt_count, 1);
        assert!(stored.last_attempt_at.is_some());
        assert_eq!(stored.failure_reason, None);

        let seen = f.messenger.seen.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![(
                "9876543210".to_string(),
                "http://localhost:8080/uploads/posters/holi.png".to_string(),
                "Here is your poster!".to_string()
            )]
        );
    }

    #[tokio::test]
    async fn test_concurrent_double_dispatch_calls_provider_once() {
        let mut messenger = CountingMessenger::new();
        messenger.delay = Duration::from_millis(50);
        let f = fixture(messenger);
        let rec = seed(&f.store, "cust-1", "poster-1").await;

        let (a, b) = tokio::join!(f.dispatcher.dispatch(&rec), f.dispatcher.dispatch(&rec));
        assert_eq!(f.messenger.calls(), 1);
        let skipped = [&a, &b]
            .iter()
            .filter(|o| ***o == DispatchOutcome::Skipped)
            .count();
        assert_eq!(skipped, 1);
    }

    #[tokio::test]
    async fn test_missing_contact_makes_no_provider_call() {
        let f = fixture(CountingMessenger::new());
        let rec = seed(&f.store, "cust-mute", "poster-1").await;
        let gone = seed(&f.store, "cust-deleted", "poster-1").await;

        for r in [&rec, &gone] {
            let outcome = f.dispatcher.dispatch(r).await;
            assert!(matches!(
                outcome,
                DispatchOutcome::Failed { ref reason } if reason.starts_with("MissingContact")
            ));
            let stored = f.store.get(&r.id).await.unwrap().unwrap();
            assert_eq!(stored.status, DeliveryStatus::Failed);
            assert_eq!(stored.attempt_count, 0);
        }
        assert_eq!(f.messenger.calls(), 0);
    }

    #[tokio::test]
    async fn test_missing_poster() {
        let f = fixture(CountingMessenger::new());
        let rec = seed(&f.store, "cust-1", "poster-404").await;

        let outcome = f.dispatcher.dispatch(&rec).await;
        assert!(matches!(
            outcome,
            DispatchOutcome::Failed { ref reason } if reason.starts_with("MissingPayload")
        ));
        assert_eq!(f.messenger.calls(), 0);
    }

    #[tokio::test]
    async fn test_malformed_media_url_is_missing_payload() {
        let f = fixture(CountingMessenger::new());
        let delivery = DeliveryConfig {
            media_base_url: "cdn.example.com/uploads".into(),
            ..DeliveryConfig::default()
        };
        let dispatcher = Dispatcher::new(
            f.store.clone(),
            f.store.clone(),
            f.messenger.clone(),
            Arc::new(FixedClock::new(Utc::now())),
            &delivery,
        );
        let rec = seed(&f.store, "cust-1", "poster-1").await;

        let outcome = dispatcher.dispatch(&rec).await;
        assert!(matches!(
            outcome,
            DispatchOutcome::Failed { ref reason } if reason.starts_with("MissingPayload")
        ));
        let stored = f.store.get(&rec.id).await.unwrap().unwrap();
        assert_eq!(stored.status, DeliveryStatus::Failed);
        assert_eq!(stored.attempt_count, 0);
        assert_eq!(f.messenger.calls(), 0);
    }

    #[tokio::test]
    async fn test_exhaustion_recorded_as_failed() {
        let mut messenger = CountingMessenger::new();
        messenger.fail = true;
        let f = fixture(messenger);
        let rec = seed(&f.store, "cust-1", "poster-1").await;

        f.dispatcher.dispatch(&rec).await;
        let stored = f.store.get(&rec.id).await.unwrap().unwrap();
        assert_eq!(stored.status, DeliveryStatus::Failed);
        assert_eq!(stored.attempt_count, 1);
        assert!(stored
            .failure_reason
            .unwrap()
            .starts_with("AllChannelsExhausted"));

        // Terminal: a second dispatch does nothing.
        assert_eq!(f.dispatcher.dispatch(&rec).await, DispatchOutcome::Skipped);
        assert_eq!(f.messenger.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_bounds_slow_messenger() {
        let mut messenger = CountingMessenger::new();
        messenger.delay = Duration::from_secs(600);
        let f = fixture(messenger);
        let dispatcher = Dispatcher::new(
            f.store.clone(),
            f.store.clone(),
            f.messenger.clone(),
            Arc::new(FixedClock::new(Utc::now())),
            &DeliveryConfig::default(),
        )
        .with_budget(Duration::from_secs(5));
        let rec = seed(&f.store, "cust-1", "poster-1").await;

        let outcome = dispatcher.dispatch(&rec).await;
        assert!(matches!(
            outcome,
            DispatchOutcome::Failed { ref reason } if reason.contains("budget")
        ));
    }

    #[tokio::test]
    async fn test_spawn_deduplicates_and_clears_on_completion() {
        let mut messenger = CountingMessenger::new();
        messenger.delay = Duration::from_millis(50);
        let f = fixture(messenger);
        let rec = seed(&f.store, "cust-1", "poster-1").await;

        let handle = f.dispatcher.spawn(rec.clone()).unwrap();
        assert!(f.dispatcher.spawn(rec.clone()).is_none());
        assert_eq!(f.dispatcher.in_flight(), vec![rec.id.clone()]);

        let outcome = handle.await.unwrap();
        assert!(matches!(outcome, DispatchOutcome::Sent { .. }));
        assert!(f.dispatcher.in_flight().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_pending_aborts_queued_job() {
        let mut messenger = CountingMessenger::new();
        messenger.delay = Duration::from_millis(200);
        let f = fixture(messenger);
        let dispatcher = Arc::new(
            Dispatcher::new(
                f.store.clone(),
                f.store.clone(),
                f.messenger.clone(),
                Arc::new(FixedClock::new(Utc::now())),
                &DeliveryConfig::default(),
            )
            .with_max_concurrent(1),
        );
        let first = seed(&f.store, "cust-1", "poster-1").await;
        let queued = seed(&f.store, "cust-1", "poster-1").await;

        let running = dispatcher.spawn(first.clone()).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let waiting = dispatcher.spawn(queued.clone()).unwrap();

        assert!(dispatcher.cancel(&queued.id).await.unwrap());
        assert!(waiting.await.unwrap_err().is_cancelled());
        // Already sending: cannot be cancelled.
        assert!(!dispatcher.cancel(&first.id).await.unwrap());

        running.await.unwrap();
        assert_eq!(f.messenger.calls(), 1);
        let stored = f.store.get(&queued.id).await.unwrap().unwrap();
        assert_eq!(stored.status, DeliveryStatus::Cancelled);
    }
}
