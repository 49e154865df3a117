//! Song entity.
//!
//! A [`Song`] pairs one metadata record with its time series. The series is
//! read from the [`SeriesStore`] on first use and cached for as long as the
//! entity lives; the owning database drops every entity on reload.

use chrono::{DateTime, Duration, FixedOffset};
use once_cell::unsync::OnceCell;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::StoreResult;
use crate::models::{Counter, Credits, Sample, SongDetail, SongInfo};
use crate::series::{Hourly, SeriesStore, TimeSeries};

/// Minutes songs are spread over. Minute 0 is left free.
pub const FETCH_MINUTES: u64 = 59;

/// Deterministic fetch minute for a song ID, in `1..=59`.
///
/// The first 8 bytes of SHA-256 over the UTF-8 ID, read big-endian, modulo 59,
/// plus one.
pub fn fetch_minute(song_id: &str) -> u32 {
    let digest = Sha256::digest(song_id.as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(head) % FETCH_MINUTES) as u32 + 1
}

fn is_valid_minute(minute: u32) -> bool {
    (1..=FETCH_MINUTES as u32).contains(&minute)
}

pub struct Song {
    id: String,
    info: SongInfo,
    series: OnceCell<TimeSeries>,
}

impl Song {
    /// Wraps a metadata record, deriving its fetch minute if the record
    /// has none yet.
    pub(crate) fn new(id: String, mut info: SongInfo) -> Self {
        if !info.fetch_minute.is_some_and(is_valid_minute) {
            info.fetch_minute = Some(fetch_minute(&id));
        }
        Self {
            id,
            info,
            series: OnceCell::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn info(&self) -> &SongInfo {
        &self.info
    }

    pub fn title(&self) -> &str {
        &self.info.title
    }

    pub fn artist(&self) -> &str {
        &self.info.artist
    }

    pub fn agency(&self) -> &str {
        &self.info.agency
    }

    pub fn release_date(&self) -> DateTime<FixedOffset> {
        self.info.release_date
    }

    pub fn credits(&self) -> &Credits {
        &self.info.credits
    }

    pub fn is_tracking(&self) -> bool {
        self.info.is_tracking
    }

    pub(crate) fn set_tracking(&mut self, value: bool) {
        self.info.is_tracking = value;
    }

    pub fn fetch_minute(&self) -> u32 {
        self.info
            .fetch_minute
            .unwrap_or_else(|| fetch_minute(&self.id))
    }

    /// The song's samples, read from `store` on first access.
    pub fn series(&self, store: &SeriesStore) -> StoreResult<&TimeSeries> {
        self.series.get_or_try_init(|| store.load(&self.id))
    }

    pub fn hourly_plays<'s>(&'s self, store: &SeriesStore) -> StoreResult<Hourly<'s>> {
        Ok(self.series(store)?.hourly_plays())
    }

    pub fn hourly_listeners<'s>(&'s self, store: &SeriesStore) -> StoreResult<Hourly<'s>> {
        Ok(self.series(store)?.hourly_listeners())
    }

    /// Mean hourly plays over the trailing `window`. `None` means no data
    /// and ranks below every real average.
    ///
    /// Uses the cached series when it is already loaded. Otherwise only the
    /// recent samples are read, and nothing is cached.
    pub fn recent_average_plays(
        &self,
        store: &SeriesStore,
        window: Duration,
    ) -> StoreResult<Option<f64>> {
        let mean = match self.series.get() {
            Some(series) => series.recent_mean(Counter::Plays, window),
            None => store
                .load_recent(&self.id, window)?
                .recent_mean(Counter::Plays, window),
        };
        Ok(mean)
    }

    /// Records one successful detail fetch: the sample is persisted first,
    /// then mirrored into the cached series. Credits are filled only while
    /// still empty. Returns whether credits were filled by this call.
    pub fn record_fetch(&mut self, store: &SeriesStore, detail: SongDetail) -> StoreResult<bool> {
        let sample = Sample::from(&detail);
        store.append(&self.id, &sample)?;
        if let Some(series) = self.series.get_mut() {
            series.insert(sample);
        }

        let fill_credits = self.info.credits.is_empty() && !detail.credits.is_empty();
        if fill_credits {
            self.info.credits = detail.credits;
            debug!(song_id = %self.id, "Credits stored ({} by {})", self.info.title, self.info.artist);
        }
        Ok(fill_credits)
    }
}

// ============================================================================
// TESTS
// ============================================================================
