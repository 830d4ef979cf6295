//! Canonical time handling.
//!
//! Due dates are persisted as `YYYY-MM-DD` + `HH:mm` strings in one named
//! timezone taken from configuration (never the host zone). Every comparison
//! against "now" first projects the instant into that zone, so a process
//! running in UTC and one running in IST agree on which minute is due.

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use std::sync::Mutex;

use crate::error::{PosterlyError, Result};
use crate::types::DueSlot;

pub const DATE_FORMAT: &str = "%Y-%m-%d";
pub const TIME_FORMAT: &str = "%H:%M";
const DISPLAY_FORMAT: &str = "%a, %d %b %Y %I:%M %p %Z";

/// Zone-less layouts interpreted as canonical local time.
const LOCAL_LAYOUTS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

/// Source of the current instant. Injected so scans can be replayed in tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock.
#[derive(Debug)]
pub struct FixedClock {
    at: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(at: DateTime<Utc>) -> Self {
        Self { at: Mutex::new(at) }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.at.lock().unwrap_or_else(|e| e.into_inner()) = at;
    }

    pub fn advance(&self, by: Duration) {
        let mut at = self.at.lock().unwrap_or_else(|e| e.into_inner());
        *at += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.at.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Raw time input accepted at the record-creation boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum TimeInput {
    /// RFC 3339, numeric epoch, or a zone-less local string.
    Text(String),
    EpochSeconds(i64),
    EpochMillis(i64),
    Instant(DateTime<Utc>),
}

impl From<&str> for TimeInput {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for TimeInput {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<DateTime<Utc>> for TimeInput {
    fn from(dt: DateTime<Utc>) -> Self {
        Self::Instant(dt)
    }
}

/// The canonical timezone and every projection into it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanonicalTz {
    tz: Tz,
}

impl CanonicalTz {
    /// Resolve an IANA zone name such as `Asia/Kolkata`.
    pub fn new(name: &str) -> Result<Self> {
        let tz: Tz = name
            .trim()
            .parse()
            .map_err(|_| PosterlyError::Config(format!("unknown timezone '{name}'")))?;
        Ok(Self { tz })
    }

    pub fn name(&self) -> &'static str {
        self.tz.name()
    }

    /// Current instant as a canonical slot.
    pub fn now(&self, clock: &dyn Clock) -> DueSlot {
        self.slot_of(clock.now())
    }

    /// Project an instant into the canonical zone at minute resolution.
    pub fn slot_of(&self, instant: DateTime<Utc>) -> DueSlot {
        let local = instant.with_timezone(&self.tz);
        DueSlot {
            date: local.format(DATE_FORMAT).to_string(),
            time: local.format(TIME_FORMAT).to_string(),
        }
    }

    /// Normalize arbitrary input into a canonical slot.
    pub fn to_canonical(&self, input: impl Into<TimeInput>) -> Result<DueSlot> {
        Ok(self.slot_of(self.parse_instant(input.into())?))
    }

    /// Validate separately supplied date and time strings.
    pub fn from_parts(&self, date: &str, time: &str) -> Result<DueSlot> {
        let date = parse_date(date)?;
        let time = parse_time(time)?;
        // Rejects local times skipped by a DST transition.
        self.localize(date.and_time(time))?;
        Ok(DueSlot {
            date: date.format(DATE_FORMAT).to_string(),
            time: time.format(TIME_FORMAT).to_string(),
        })
    }

    /// The instant a stored slot refers to.
    pub fn due_instant(&self, date: &str, time: &str) -> Result<DateTime<Utc>> {
        let naive = parse_date(date)?.and_time(parse_time(time)?);
        self.localize(naive)
    }

    /// Closed interval covering the canonical minute that contains `instant`.
    pub fn minute_window(&self, instant: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        let local = instant.with_timezone(&self.tz);
        let start = local
            .with_nanosecond(0)
            .and_then(|t| t.with_second(0))
            .unwrap_or(local)
            .with_timezone(&Utc);
        (start, start + Duration::milliseconds(59_999))
    }

    /// Whether the slot's instant falls inside `[start, end]`, both ends inclusive.
    pub fn is_within_window(
        &self,
        date: &str,
        time: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<bool> {
        let due = self.due_instant(date, time)?;
        Ok(start <= due && due <= end)
    }

    /// Human-readable form, e.g. `Mon, 10 Mar 2025 09:00 AM IST`.
    pub fn display(&self, date: &str, time: &str) -> Result<String> {
        let due = self.due_instant(date, time)?;
        Ok(due.with_timezone(&self.tz).format(DISPLAY_FORMAT).to_string())
    }

    fn parse_instant(&self, input: TimeInput) -> Result<DateTime<Utc>> {
        match input {
            TimeInput::Instant(dt) => Ok(dt),
            TimeInput::EpochSeconds(secs) => from_epoch_secs(secs),
            TimeInput::EpochMillis(ms) => from_epoch_millis(ms),
            TimeInput::Text(raw) => self.parse_text(&raw),
        }
    }

    fn parse_text(&self, raw: &str) -> Result<DateTime<Utc>> {
        let s = raw.trim();
        if s.is_empty() {
            return Err(PosterlyError::InvalidTimeInput("empty time input".into()));
        }

        let digits = s.strip_prefix('-').unwrap_or(s);
        if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
            let n: i64 = s
                .parse()
                .map_err(|_| PosterlyError::InvalidTimeInput(format!("epoch out of range: {s}")))?;
            // Anything beyond ~5138 AD in seconds is taken as milliseconds.
            return if n.unsigned_abs() >= 100_000_000_000 {
                from_epoch_millis(n)
            } else {
                from_epoch_secs(n)
            };
        }

        if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
            return Ok(dt.with_timezone(&Utc));
        }

        for layout in LOCAL_LAYOUTS {
            if let Ok(naive) = NaiveDateTime::parse_from_str(s, layout) {
                return self.localize(naive);
            }
        }

        Err(PosterlyError::InvalidTimeInput(format!(
            "unrecognized date/time '{s}'"
        )))
    }

    fn localize(&self, naive: NaiveDateTime) -> Result<DateTime<Utc>> {
        self.tz
            .from_local_datetime(&naive)
            .earliest()
            .map(|dt| dt.with_timezone(&Utc))
            .ok_or_else(|| {
                PosterlyError::InvalidTimeInput(format!(
                    "{naive} does not exist in {}",
                    self.tz.name()
                ))
            })
    }
}

fn parse_date(date: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(date.trim(), DATE_FORMAT)
        .map_err(|e| PosterlyError::InvalidTimeInput(format!("date '{date}': {e}")))
}

fn parse_time(time: &str) -> Result<NaiveTime> {
    let t = time.trim();
    NaiveTime::parse_from_str(t, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(t, TIME_FORMAT))
        .map(|t| t.with_second(0).unwrap_or(t))
        .map_err(|e| PosterlyError::InvalidTimeInput(format!("time '{time}': {e}")))
}

fn from_epoch_secs(secs: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0).ok_or_else(|| {
        PosterlyError::InvalidTimeInput(format!("epoch seconds out of range: {secs}"))
    })
}

fn from_epoch_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| PosterlyError::InvalidTimeInput(format!("epoch millis out of range: {ms}")))
}
