//! Delivery engine: the periodic loop that scans for due records and dispatches them.
//! Uses tokio::interval so the process sleeps between ticks.

use chrono::Duration as ChronoDuration;
use futures::future::join_all;
use posterly_core::config::PosterlyConfig;
use posterly_core::error::Result;
use posterly_core::time::Clock;
use posterly_core::traits::Messenger;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::dispatcher::{DispatchOutcome, Dispatcher};
use crate::scanner::Scanner;
use crate::store::{DeliveryStore, Directory};

/// Counts for one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub selected: usize,
    pub sent: usize,
    pub failed: usize,
    /// Lost claims, jobs already in flight, aborted jobs.
    pub skipped: usize,
}

/// Ties the clock, scanner and dispatcher together.
pub struct DeliveryEngine {
    store: Arc<dyn DeliveryStore>,
    scanner: Scanner,
    dispatcher: Arc<Dispatcher>,
    clock: Arc<dyn Clock>,
    tick: Duration,
    stale_after: Duration,
}

impl DeliveryEngine {
    pub fn new(
        store: Arc<dyn DeliveryStore>,
        scanner: Scanner,
        dispatcher: Arc<Dispatcher>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            scanner,
            dispatcher,
            clock,
            tick: Duration::from_secs(60),
            stale_after: Duration::from_secs(600),
        }
    }

    /// Wire everything from configuration.
    pub fn from_config(
        config: &PosterlyConfig,
        store: Arc<dyn DeliveryStore>,
        directory: Arc<dyn Directory>,
        messenger: Arc<dyn Messenger>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let sched = &config.scheduler;
        let tz = config.canonical_tz()?;
        let scanner = Scanner::new(store.clone(), tz, sched.scan_limit);
        let dispatcher = Dispatcher::new(
            store.clone(),
            directory,
            messenger,
            clock.clone(),
            &config.delivery,
        )
        .with_budget(Duration::from_secs(sched.dispatch_budget_secs))
        .with_max_concurrent(sched.max_concurrent_dispatches);

        Ok(Self::new(store, scanner, Arc::new(dispatcher), clock)
            .with_tick(Duration::from_secs(sched.tick_secs.max(1)))
            .with_stale_after(Duration::from_secs(sched.stale_claim_secs)))
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Fail records left in `sending` by a process that died mid-dispatch.
    /// They are never re-sent.
    pub async fn release_stale_claims(&self) -> Result<usize> {
        let now = self.clock.now();
        let stale = ChronoDuration::from_std(self.stale_after).unwrap_or(ChronoDuration::zero());
        self.store.release_stale_claims(now - stale, now).await
    }

    /// One scan plus dispatch of everything selected. Returns once every
    /// dispatch started by this tick has finished.
    ///
    /// Outcomes left unwritten by earlier ticks are replayed first.
    pub async fn run_tick(&self) -> Result<TickReport> {
        self.dispatcher.flush_completions().await;
        let due = self.scanner.scan(self.clock.now()).await?;
        let mut report = TickReport {
            selected: due.len(),
            ..Default::default()
        };

        let handles: Vec<_> = due
            .into_iter()
            .filter_map(|record| self.dispatcher.spawn(record))
            .collect();
        report.skipped = report.selected - handles.len();

        for result in join_all(handles).await {
            match result {
                Ok(DispatchOutcome::Sent { .. }) => report.sent += 1,
                Ok(DispatchOutcome::Failed { .. }) => report.failed += 1,
                Ok(DispatchOutcome::Skipped) => report.skipped += 1,
                Err(e) => {
                    if !e.is_cancelled() {
                        tracing::error!("❌ Dispatch task panicked: {e}");
                    }
                    report.skipped += 1;
                }
            }
        }
        Ok(report)
    }
}

/// Run the engine until `shutdown` turns true or its sender is dropped.
///
/// Each tick runs in its own task, so a slow tick never delays the next one.
/// Ticks missed while the runtime was busy are skipped, not replayed.
pub fn spawn_engine(
    engine: Arc<DeliveryEngine>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        match engine.release_stale_claims().await {
            Ok(0) => {}
            Ok(n) => tracing::warn!("⚠️ Marked {n} interrupted deliveries as failed"),
            Err(e) => tracing::warn!("⚠️ Stale claim sweep failed: {e}"),
        }

        tracing::info!(
            "⏰ Delivery engine started (tick every {}s, zone {})",
            engine.tick.as_secs(),
            engine.scanner.timezone().name()
        );

        let mut interval = tokio::time::interval(engine.tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let engine = engine.clone();
                    tokio::spawn(async move {
                        match engine.run_tick().await {
                            Ok(report) if report.selected > 0 => tracing::info!(
                                "📣 Tick: {} selected, {} sent, {} failed, {} skipped",
                                report.selected, report.sent, report.failed, report.skipped
                            ),
                            Ok(_) => {}
                            Err(e) => tracing::warn!("⚠️ Tick skipped: {e}"),
                        }
                    });
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("🛑 Delivery engine stopped");
    })
}
