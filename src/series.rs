//! Time-series store.
//!
//! Raw `(observed_at, plays, listeners)` samples live in `streams.sqlite3`,
//! one series per song ID. Samples are irregular (one per song per hour,
//! at whatever second the server answered); the hourly views resample them
//! onto the wall-clock hour grid and difference consecutive hours.

use std::fmt;
use std::path::Path;

use chrono::{DateTime, Duration, DurationRound, Utc};
use chrono_tz::Tz;
use rusqlite::{params, Connection, OptionalExtension, Rows};
use serde::{Serialize, Serializer};

use crate::error::{StoreError, StoreResult};
use crate::models::{Counter, Sample};

/// File name of the sample database inside a database directory.
pub const SERIES_FILE: &str = "streams.sqlite3";

/// Timezone hourly periods are reported in.
pub const REPORT_TZ: Tz = chrono_tz::Asia::Seoul;

/// Interpolation never bridges two real samples further apart than this.
const MAX_INTERPOLATION_GAP_HOURS: i64 = 1;

/// Extra history `load_recent` reads before a window: the newest period
/// starts up to an hour before the last sample, and the first period in the
/// window may interpolate from a sample an hour before it.
const RECENT_MARGIN_HOURS: i64 = 3;

pub fn floor_hour(t: DateTime<Utc>) -> DateTime<Utc> {
    t.duration_trunc(Duration::hours(1)).unwrap_or(t)
}

pub fn ceil_hour(t: DateTime<Utc>) -> DateTime<Utc> {
    let floor = floor_hour(t);
    if floor == t {
        t
    } else {
        floor + Duration::hours(1)
    }
}

// ============================================================================
// Hour Periods
// ============================================================================

/// One clock hour in Korean Standard Time. `2018-09-18 11:00` covers
/// 11:00 to 11:59 of that day.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct HourPeriod(DateTime<Tz>);

impl HourPeriod {
    pub fn from_utc(start: DateTime<Utc>) -> Self {
        HourPeriod(floor_hour(start).with_timezone(&REPORT_TZ))
    }

    pub fn start(&self) -> &DateTime<Tz> {
        &self.0
    }

    pub fn start_utc(&self) -> DateTime<Utc> {
        self.0.with_timezone(&Utc)
    }
}

impl fmt::Display for HourPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d %H:00"))
    }
}

impl Serialize for HourPeriod {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

// ============================================================================
// In-memory Series
// ============================================================================

/// Samples of one song, ordered by timestamp, one sample per timestamp.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TimeSeries {
    samples: Vec<Sample>,
}

impl TimeSeries {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a series from samples in any order. When two samples share a
    /// timestamp the later one in `samples` wins.
    pub fn from_samples(samples: impl IntoIterator<Item = Sample>) -> Self {
        let mut sorted: Vec<Sample> = samples.into_iter().collect();
        // Stable: equal timestamps keep their arrival order.
        sorted.sort_by_key(|s| s.observed_at);

        let mut deduped: Vec<Sample> = Vec::with_capacity(sorted.len());
        for sample in sorted {
            match deduped.last_mut() {
                Some(last) if last.observed_at == sample.observed_at => *last = sample,
                _ => deduped.push(sample),
            }
        }
        Self { samples: deduped }
    }

    /// Inserts a sample, replacing any sample with the same timestamp.
    pub fn insert(&mut self, sample: Sample) {
        match self
            .samples
            .binary_search_by_key(&sample.observed_at, |s| s.observed_at)
        {
            Ok(pos) => self.samples[pos] = sample,
            Err(pos) => self.samples.insert(pos, sample),
        }
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn last(&self) -> Option<&Sample> {
        self.samples.last()
    }

    /// Hourly plays: `(period, plays during that hour)`.
    pub fn hourly_plays(&self) -> Hourly<'_> {
        Hourly::new(&self.samples, Counter::Plays)
    }

    /// Hourly new listeners: `(period, first-time listeners during that hour)`.
    pub fn hourly_listeners(&self) -> Hourly<'_> {
        Hourly::new(&self.samples, Counter::Listeners)
    }

    /// Mean hourly value over the trailing `window`, anchored at the newest
    /// hour of the series. Missing hours are ignored; `None` if no hour in
    /// the window has a value.
    pub fn recent_mean(&self, counter: Counter, window: Duration) -> Option<f64> {
        // The newest period starts one hour before the last grid point.
        let last = self.samples.last()?;
        let cutoff = floor_hour(last.observed_at) - Duration::hours(1) - window;

        let (sum, count) = Hourly::new(&self.samples, counter)
            .filter(|(period, _)| period.start_utc() > cutoff)
            .filter_map(|(_, value)| value)
            .fold((0i64, 0usize), |(sum, count), value| (sum + value, count + 1));
        (count > 0).then(|| sum as f64 / count as f64)
    }
}

// ============================================================================
// Hourly Resampling
// ============================================================================

/// Lazy hourly view over a sample slice.
///
/// Grid points are the UTC top-of-hour instants from the ceiling of the
/// first sample to the last sample. The value at a grid point is the sample
/// taken exactly then, or the time-weighted interpolation of the two samples
/// around it, floored to an integer. Around a gap longer than one hour there
/// is no value. Each item is the forward difference `v[h+1] - v[h]`
/// attributed to hour `h`; the last grid point has no successor and yields
/// nothing. Clone the iterator, or ask the series again, to restart.
#[derive(Clone, Debug)]
pub struct Hourly<'a> {
    samples: &'a [Sample],
    counter: Counter,
    hour: Option<DateTime<Utc>>,
    end: DateTime<Utc>,
    // First sample at or after the last grid point looked at.
    cursor: usize,
    carried: Option<Option<i64>>,
}

impl<'a> Hourly<'a> {
    fn new(samples: &'a [Sample], counter: Counter) -> Self {
        let (hour, end) = match (samples.first(), samples.last()) {
            (Some(first), Some(last)) if samples.len() >= 2 => {
                (Some(ceil_hour(first.observed_at)), last.observed_at)
            }
            _ => (None, DateTime::<Utc>::MIN_UTC),
        };
        Self {
            samples,
            counter,
            hour,
            end,
            cursor: 0,
            carried: None,
        }
    }

    fn value_at(&mut self, t: DateTime<Utc>) -> Option<i64> {
        while self.samples.get(self.cursor)?.observed_at < t {
            self.cursor += 1;
        }
        let next = self.samples.get(self.cursor)?;
        if next.observed_at == t {
            return Some(next.value(self.counter));
        }
        let prev = self.samples.get(self.cursor.checked_sub(1)?)?;

        let span = next.observed_at - prev.observed_at;
        if span > Duration::hours(MAX_INTERPOLATION_GAP_HOURS) {
            return None;
        }
        // Exact rational arithmetic, floored.
        let elapsed = i128::from((t - prev.observed_at).num_milliseconds());
        let span = i128::from(span.num_milliseconds());
        let from = i128::from(prev.value(self.counter));
        let to = i128::from(next.value(self.counter));
        let value = from + ((to - from) * elapsed).div_euclid(span);
        i64::try_from(value).ok()
    }
}

impl Iterator for Hourly<'_> {
    type Item = (HourPeriod, Option<i64>);

    fn next(&mut self) -> Option<Self::Item> {
        let hour = self.hour?;
        let next_hour = hour + Duration::hours(1);
        if next_hour > self.end {
            self.hour = None;
            return None;
        }

        let current = match self.carried.take() {
            Some(value) => value,
            None => self.value_at(hour),
        };
        let following = self.value_at(next_hour);
        self.carried = Some(following);
        self.hour = Some(next_hour);

        let delta = current.zip(following).map(|(a, b)| b - a);
        Some((HourPeriod::from_utc(hour), delta))
    }
}

// ============================================================================
// SQLite Persistence
// ============================================================================

/// Append-only sample storage for every song of one database.
pub struct SeriesStore {
    conn: Connection,
}

impl SeriesStore {
    /// Opens (creating if needed) the sample database at `path`.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> StoreResult<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS series (
                song_id TEXT PRIMARY KEY,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS samples (
                song_id TEXT NOT NULL,
                observed_at INTEGER NOT NULL,
                plays INTEGER NOT NULL,
                listeners INTEGER NOT NULL,
                PRIMARY KEY (song_id, observed_at)
            ) WITHOUT ROWID;",
        )?;
        Ok(Self { conn })
    }

    /// Creates an empty series for `song_id`, discarding any samples left
    /// behind under the same ID.
    pub fn create(&self, song_id: &str) -> StoreResult<()> {
        self.conn
            .execute("DELETE FROM samples WHERE song_id = ?1", [song_id])?;
        self.conn.execute(
            "INSERT OR REPLACE INTO series (song_id, created_at) VALUES (?1, ?2)",
            params![song_id, Utc::now().timestamp()],
        )?;
        Ok(())
    }

    pub fn exists(&self, song_id: &str) -> StoreResult<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM series WHERE song_id = ?1",
                [song_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Durably records one sample. A sample already stored at the same
    /// timestamp is replaced.
    pub fn append(&self, song_id: &str, sample: &Sample) -> StoreResult<()> {
        if !self.exists(song_id)? {
            return Err(StoreError::UnknownSong(song_id.to_string()));
        }
        self.conn.execute(
            "INSERT OR REPLACE INTO samples (song_id, observed_at, plays, listeners)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                song_id,
                sample.observed_at.timestamp(),
                sample.plays,
                sample.listeners
            ],
        )?;
        Ok(())
    }

    pub fn load(&self, song_id: &str) -> StoreResult<TimeSeries> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT observed_at, plays, listeners FROM samples
             WHERE song_id = ?1
             ORDER BY observed_at",
        )?;
        let rows = stmt.query([song_id])?;
        read_samples(song_id, rows)
    }

    /// The samples `recent_mean` needs for a trailing `window`: everything
    /// from two hours before the window's first period onwards.
    pub fn load_recent(&self, song_id: &str, window: Duration) -> StoreResult<TimeSeries> {
        let lookback = window.num_seconds() + RECENT_MARGIN_HOURS * 3600;
        let mut stmt = self.conn.prepare_cached(
            "SELECT observed_at, plays, listeners FROM samples
             WHERE song_id = ?1
               AND observed_at >= (SELECT MAX(observed_at) FROM samples WHERE song_id = ?1) - ?2
             ORDER BY observed_at",
        )?;
        let rows = stmt.query(params![song_id, lookback])?;
        read_samples(song_id, rows)
    }

    pub fn sample_count(&self, song_id: &str) -> StoreResult<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM samples WHERE song_id = ?1",
            [song_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

fn read_samples(song_id: &str, mut rows: Rows<'_>) -> StoreResult<TimeSeries> {
    let mut samples = Vec::new();
    while let Some(row) = rows.next()? {
        let secs: i64 = row.get(0)?;
        let observed_at = DateTime::from_timestamp(secs, 0).ok_or_else(|| StoreError::Corrupt {
            song_id: song_id.to_string(),
            detail: format!("timestamp {} out of range", secs),
        })?;
        samples.push(Sample::new(observed_at, row.get(1)?, row.get(2)?));
    }
    Ok(TimeSeries::from_samples(samples))
}

// ============================================================================
// TESTS
// ============================================================================
