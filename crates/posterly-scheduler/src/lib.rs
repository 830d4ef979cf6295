//! # Posterly Scheduler
//!
//! Scheduled poster delivery: record creation, due-job scanning, dispatch
//! with at-most-once claims, and read-side projections.
//!
//! ## Design Principles
//! - SQLite persistence, survives restarts
//! - Canonical-zone date/time strings, compared as strings
//! - Claim before send; every transition is a conditional write
//! - Tokio timers only, idle between ticks
//!
//! ## Architecture
//! ```text
//! Scheduler::schedule ──▶ deliveries (pending)
//!
//! DeliveryEngine (tokio interval, one task per tick)
//!   ├── Scanner: due_instant <= end of current minute
//!   └── Dispatcher (semaphore-bounded, one job per record id)
//!         ├── try_claim: pending → sending
//!         ├── Directory: customer contact, poster media
//!         ├── Messenger: primary → secondary → fallback
//!         └── complete: sending → sent | failed
//!
//! Reconciler: records → DeliveryView for dashboards
//! ```

pub mod dispatcher;
pub mod engine;
pub mod persistence;
pub mod reconciler;
pub mod scanner;
pub mod schedule;
pub mod store;

pub use dispatcher::{DispatchOutcome, Dispatcher};
pub use engine::{DeliveryEngine, TickReport, spawn_engine};
pub use persistence::SqliteStore;
pub use reconciler::{DeliveryView, Reconciler, StatusSummary};
pub use scanner::Scanner;
pub use schedule::{DueSpec, ScheduleRequest, Scheduler};
pub use store::{Completion, DeliveryStore, Directory, ListFilter};
