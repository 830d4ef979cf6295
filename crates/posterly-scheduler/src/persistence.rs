//! SQLite-backed persistence for delivery records, customers and posters.
//!
//! Due dates stay as the canonical `YYYY-MM-DD` / `HH:mm` strings. Both are
//! zero-padded and written in one zone, so plain string comparison orders
//! them correctly and the scan query never has to reinterpret an instant.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use posterly_core::error::{PosterlyError, Result};
use posterly_core::types::{Category, Customer, DeliveryRecord, DeliveryStatus, DueSlot, Poster};
use rusqlite::types::Type;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::store::{Completion, DeliveryStore, Directory, ListFilter};

const RECORD_COLUMNS: &str = "id, target_id, payload_ref, category, due_date, due_time, status, \
     attempt_count, last_attempt_at, failure_reason, created_at, updated_at";

/// SQLite-backed store shared by the scanner, dispatcher and CLI.
pub struct SqliteStore {
    conn: Mutex<rusqlite::Connection>,
}

impl SqliteStore {
    /// Open or create the database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let conn = rusqlite::Connection::open(path).map_err(store_err("DB open"))?;
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .map_err(store_err("DB busy timeout"))?;
        Self::init(conn)
    }

    /// Private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        let conn = rusqlite::Connection::open_in_memory().map_err(store_err("DB open"))?;
        Self::init(conn)
    }

    fn init(conn: rusqlite::Connection) -> Result<Self> {
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    /// Run migrations to create tables.
    fn migrate(&self) -> Result<()> {
        self.conn()?
            .execute_batch(
                "
            -- Scheduled poster deliveries
            CREATE TABLE IF NOT EXISTS deliveries (
                id TEXT PRIMARY KEY,
                target_id TEXT NOT NULL,         -- customers.id
                payload_ref TEXT NOT NULL,       -- posters.id
                category TEXT NOT NULL,
                due_date TEXT NOT NULL,          -- YYYY-MM-DD, canonical zone
                due_time TEXT NOT NULL,          -- HH:mm, canonical zone
                status TEXT NOT NULL DEFAULT 'pending',
                attempt_count INTEGER NOT NULL DEFAULT 0,
                last_attempt_at TEXT,
                failure_reason TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_deliveries_due
                ON deliveries (status, due_date, due_time);
            CREATE INDEX IF NOT EXISTS idx_deliveries_target
                ON deliveries (target_id);

            -- Read-only to the delivery core
            CREATE TABLE IF NOT EXISTS customers (
                id TEXT PRIMARY KEY,
                contact_number TEXT NOT NULL DEFAULT '',
                display_name TEXT NOT NULL DEFAULT '',
                company_name TEXT NOT NULL DEFAULT ''
            );

            CREATE TABLE IF NOT EXISTS posters (
                id TEXT PRIMARY KEY,
                customer_id TEXT NOT NULL,
                media_path TEXT NOT NULL,        -- relative path or absolute URL
                caption TEXT
            );
         ",
            )
            .map_err(store_err("Migration"))
    }

    fn conn(&self) -> Result<MutexGuard<'_, rusqlite::Connection>> {
        self.conn
            .lock()
            .map_err(|_| PosterlyError::StoreUnavailable("connection lock poisoned".into()))
    }

    // ─── Customers & Posters ──────────────────────────────────

    pub fn upsert_customer(&self, customer: &Customer) -> Result<()> {
        self.conn()?
            .execute(
                "INSERT OR REPLACE INTO customers (id, contact_number, display_name, company_name)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![
                    customer.id,
                    customer.contact_number,
                    customer.display_name,
                    customer.company_name,
                ],
            )
            .map_err(store_err("Save customer"))?;
        Ok(())
    }

    pub fn upsert_poster(&self, poster: &Poster) -> Result<()> {
        self.conn()?
            .execute(
                "INSERT OR REPLACE INTO posters (id, customer_id, media_path, caption)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![poster.id, poster.customer_id, poster.media_path, poster.caption],
            )
            .map_err(store_err("Save poster"))?;
        Ok(())
    }

    /// Status counts for the whole table.
    pub fn status_counts(&self) -> Result<Vec<(DeliveryStatus, usize)>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT status, COUNT(*) FROM deliveries GROUP BY status ORDER BY status")
            .map_err(store_err("Count"))?;
        let rows = stmt
            .query_map([], |row| {
                let status: String = row.get(0)?;
                let count: i64 = row.get(1)?;
                Ok((parse_col::<DeliveryStatus>(&status, 0)?, count as usize))
            })
            .map_err(store_err("Count"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(store_err("Count"))
    }

    fn insert_with(
        conn: &rusqlite::Connection,
        record: &DeliveryRecord,
    ) -> rusqlite::Result<usize> {
        conn.execute(
            "INSERT INTO deliveries
             (id, target_id, payload_ref, category, due_date, due_time, status,
              attempt_count, last_attempt_at, failure_reason, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            rusqlite::params![
                record.id,
                record.target_id,
                record.payload_ref,
                record.category.as_str(),
                record.due_date,
                record.due_time,
                record.status.as_str(),
                record.attempt_count,
                record.last_attempt_at.map(ts),
                record.failure_reason,
                ts(record.created_at),
                ts(record.updated_at),
            ],
        )
    }
}

#[async_trait]
impl DeliveryStore for SqliteStore {
    async fn insert(&self, record: &DeliveryRecord) -> Result<()> {
        let conn = self.conn()?;
        Self::insert_with(&conn, record).map_err(store_err("Save delivery"))?;
        Ok(())
    }

    async fn insert_batch(&self, records: &[DeliveryRecord]) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(store_err("Begin"))?;
        for record in records {
            Self::insert_with(&tx, record).map_err(store_err("Save delivery"))?;
        }
        tx.commit().map_err(store_err("Commit"))?;
        tracing::debug!("💾 Saved {} deliveries", records.len());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<DeliveryRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!("SELECT {RECORD_COLUMNS} FROM deliveries WHERE id = ?1"))
            .map_err(store_err("Load delivery"))?;
        let mut rows = stmt
            .query_map([id], row_to_record)
            .map_err(store_err("Load delivery"))?;
        rows.next()
            .transpose()
            .map_err(store_err("Load delivery"))
    }

    async fn due_pending(&self, up_to: &DueSlot, limit: usize) -> Result<Vec<DeliveryRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {RECORD_COLUMNS} FROM deliveries
                 WHERE status = 'pending'
                   AND (due_date < ?1 OR (due_date = ?1 AND due_time <= ?2))
                 ORDER BY due_date, due_time, created_at
                 LIMIT ?3"
            ))
            .map_err(store_err("Scan"))?;
        let limit = if limit == 0 { -1 } else { limit as i64 };
        let rows = stmt
            .query_map(rusqlite::params![up_to.date, up_to.time, limit], row_to_record)
            .map_err(store_err("Scan"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(store_err("Scan"))
    }

    async fn try_claim(&self, id: &str, at: DateTime<Utc>) -> Result<bool> {
        let changed = self
            .conn()?
            .execute(
                "UPDATE deliveries SET status = 'sending', updated_at = ?1
                 WHERE id = ?2 AND status = 'pending'",
                rusqlite::params![ts(at), id],
            )
            .map_err(store_err("Claim"))?;
        Ok(changed == 1)
    }

    async fn complete(&self, id: &str, completion: &Completion) -> Result<bool> {
        let changed = self
            .conn()?
            .execute(
                "UPDATE deliveries
                 SET status = ?1,
                     attempt_count = attempt_count + ?2,
                     last_attempt_at = ?3,
                     failure_reason = ?4,
                     updated_at = ?3
                 WHERE id = ?5 AND status = 'sending'",
                rusqlite::params![
                    completion.status.as_str(),
                    u32::from(completion.counted_attempt),
                    ts(completion.at),
                    completion.failure_reason,
                    id,
                ],
            )
            .map_err(store_err("Complete"))?;
        Ok(changed == 1)
    }

    async fn release_claim(&self, id: &str, at: DateTime<Utc>) -> Result<bool> {
        let changed = self
            .conn()?
            .execute(
                "UPDATE deliveries SET status = 'pending', updated_at = ?1
                 WHERE id = ?2 AND status = 'sending'",
                rusqlite::params![ts(at), id],
            )
            .map_err(store_err("Release claim"))?;
        Ok(changed == 1)
    }

    async fn cancel(&self, id: &str, at: DateTime<Utc>) -> Result<bool> {
        let changed = self
            .conn()?
            .execute(
                "UPDATE deliveries SET status = 'cancelled', updated_at = ?1
                 WHERE id = ?2 AND status = 'pending'",
                rusqlite::params![ts(at), id],
            )
            .map_err(store_err("Cancel"))?;
        Ok(changed == 1)
    }

    async fn release_stale_claims(
        &self,
        older_than: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> Result<usize> {
        let changed = self
            .conn()?
            .execute(
                "UPDATE deliveries
                 SET status = 'failed',
                     failure_reason = 'Interrupted: dispatch did not finish',
                     updated_at = ?1
                 WHERE status = 'sending' AND updated_at < ?2",
                rusqlite::params![ts(at), ts(older_than)],
            )
            .map_err(store_err("Release claims"))?;
        Ok(changed)
    }

    async fn list(&self, filter: &ListFilter) -> Result<Vec<DeliveryRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {RECORD_COLUMNS} FROM deliveries
                 WHERE (?1 IS NULL OR status = ?1)
                   AND (?2 IS NULL OR target_id = ?2)
                 ORDER BY due_date DESC, due_time DESC, created_at DESC
                 LIMIT ?3"
            ))
            .map_err(store_err("List"))?;
        let limit = if filter.limit == 0 { -1 } else { filter.limit as i64 };
        let rows = stmt
            .query_map(
                rusqlite::params![
                    filter.status.map(|s| s.as_str()),
                    filter.target_id.as_deref(),
                    limit
                ],
                row_to_record,
            )
            .map_err(store_err("List"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(store_err("List"))
    }
}

#[async_trait]
impl Directory for SqliteStore {
    async fn customer(&self, id: &str) -> Result<Option<Customer>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, contact_number, display_name, company_name \
                 FROM customers WHERE id = ?1",
            )
            .map_err(store_err("Load customer"))?;
        let mut rows = stmt
            .query_map([id], |row| {
                Ok(Customer {
                    id: row.get(0)?,
                    contact_number: row.get(1)?,
                    display_name: row.get(2)?,
                    company_name: row.get(3)?,
                })
            })
            .map_err(store_err("Load customer"))?;
        rows.next()
            .transpose()
            .map_err(store_err("Load customer"))
    }

    async fn poster(&self, id: &str) -> Result<Option<Poster>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT id, customer_id, media_path, caption FROM posters WHERE id = ?1")
            .map_err(store_err("Load poster"))?;
        let mut rows = stmt
            .query_map([id], |row| {
                Ok(Poster {
                    id: row.get(0)?,
                    customer_id: row.get(1)?,
                    media_path: row.get(2)?,
                    caption: row.get(3)?,
                })
            })
            .map_err(store_err("Load poster"))?;
        rows.next()
            .transpose()
            .map_err(store_err("Load poster"))
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<DeliveryRecord> {
    let category: String = row.get(3)?;
    let status: String = row.get(6)?;
    let last_attempt_at: Option<String> = row.get(8)?;
    let created_at: String = row.get(10)?;
    let updated_at: String = row.get(11)?;

    Ok(DeliveryRecord {
        id: row.get(0)?,
        target_id: row.get(1)?,
        payload_ref: row.get(2)?,
        category: parse_col::<Category>(&category, 3)?,
        due_date: row.get(4)?,
        due_time: row.get(5)?,
        status: parse_col::<DeliveryStatus>(&status, 6)?,
        attempt_count: row.get(7)?,
        last_attempt_at: last_attempt_at
            .as_deref()
            .map(|s| parse_ts(s, 8))
            .transpose()?,
        failure_reason: row.get(9)?,
        created_at: parse_ts(&created_at, 10)?,
        updated_at: parse_ts(&updated_at, 11)?,
    })
}

fn parse_col<T>(value: &str, idx: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = PosterlyError>,
{
    value
        .parse()
        .map_err(|e: PosterlyError| {
            rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
        })
}

fn parse_ts(value: &str, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// Fixed-width RFC 3339 so stored timestamps also compare as strings.
fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn store_err(context: &'static str) -> impl Fn(rusqlite::Error) -> PosterlyError {
    move |e| PosterlyError::StoreUnavailable(format!("{context}: {e}"))
}
