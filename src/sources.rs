//! Collaborator contracts the database and reconciliation consume.
//!
//! The chart site is reached only through these traits. [`crate::genie`]
//! implements them over HTTP; tests use in-memory fakes.

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};

use crate::error::SourceError;
use crate::models::{AlbumInfo, ChartEntry, SongDetail};
use crate::series::floor_hour;

/// Pages of the real-time chart read per reconciliation pass.
pub const CHART_PAGES: usize = 4;

/// Hour of day (UTC) a release is assumed to go live when the site only
/// states the date.
pub const DEFAULT_RELEASE_HOUR: i64 = 9;

pub trait ChartSource {
    /// One page of the real-time chart, in rank order. Pages are 0-based.
    fn fetch_chart_page(&self, page: usize) -> Result<Vec<ChartEntry>, SourceError>;
}

pub trait NewestSource {
    /// Songs from the newest releases list. Inclusion implies eligibility.
    fn fetch_newest(&self) -> Result<Vec<ChartEntry>, SourceError>;
}

pub trait SongDetailSource {
    /// Current counters and credits of one song.
    fn fetch_song_detail(&self, song_id: &str) -> Result<SongDetail, SourceError>;

    /// Title, artist and album of one song, for adding it by ID.
    fn fetch_song_entry(&self, song_id: &str) -> Result<ChartEntry, SourceError>;
}

pub trait AlbumSource {
    fn fetch_album(&self, album_id: &str) -> Result<AlbumInfo, SourceError>;
}

/// Release instant for a release the site dates only by day: 09:00 UTC that
/// day, unless that lies after `now`, in which case the top of the previous
/// clock hour.
pub fn infer_release_date(date: NaiveDate, now: DateTime<Utc>) -> DateTime<Utc> {
    let assumed = date.and_time(NaiveTime::default()).and_utc() + Duration::hours(DEFAULT_RELEASE_HOUR);
    if assumed > now {
        floor_hour(now) - Duration::hours(1)
    } else {
        assumed
    }
}
