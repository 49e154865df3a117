//! Core data models for the streaming statistics database.
//!
//! This module contains the metadata record persisted in `songs.json`,
//! the records exchanged with the chart site, and per-pass statistics.

use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

// ============================================================================
// Song Metadata
// ============================================================================

/// Songwriting credits as reported on the song detail page.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credits {
    #[serde(default)]
    pub lyrics: Vec<String>,
    #[serde(default)]
    pub composition: Vec<String>,
    #[serde(default)]
    pub arrangement: Vec<String>,
}

impl Credits {
    pub fn is_empty(&self) -> bool {
        self.lyrics.is_empty() && self.composition.is_empty() && self.arrangement.is_empty()
    }
}

/// Metadata record for one song, keyed by song ID in `songs.json`.
///
/// Records are never deleted: a song that stops performing only has
/// `is_tracking` flipped off.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SongInfo {
    pub title: String,
    pub artist: String,
    #[serde(default)]
    pub agency: String,
    pub release_date: DateTime<FixedOffset>,
    pub is_tracking: bool,
    #[serde(default)]
    pub credits: Credits,
    /// Minute of the hour the song is fetched at. Derived from the ID on
    /// first access, then persisted as is.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fetch_minute: Option<u32>,
}

/// Everything needed to start tracking a song that is not in the database.
#[derive(Clone, Debug, PartialEq)]
pub struct NewSong {
    pub id: String,
    pub title: String,
    pub artist: String,
    pub agency: String,
    pub release_date: DateTime<FixedOffset>,
}

impl NewSong {
    pub fn from_entry(entry: &ChartEntry, album: &AlbumInfo) -> Self {
        Self {
            id: entry.id.clone(),
            title: entry.title.clone(),
            artist: entry.artist.clone(),
            agency: album.agency.clone(),
            release_date: album.release_date,
        }
    }
}

// ============================================================================
// Chart Site Records
// ============================================================================

/// One row of the real-time chart or of the newest releases list.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChartEntry {
    pub id: String,
    pub title: String,
    pub artist: String,
    pub album_id: String,
}

/// Album-level metadata and the eligibility flags derived from the album page.
#[derive(Clone, Debug, PartialEq)]
pub struct AlbumInfo {
    pub release_date: DateTime<FixedOffset>,
    pub agency: String,
    /// Genre field carries the local-language tag.
    pub is_local_language: bool,
    /// Song IDs marked as title tracks on the album page.
    pub title_tracks: Vec<String>,
}

impl AlbumInfo {
    pub fn is_title_track(&self, song_id: &str) -> bool {
        self.title_tracks.iter().any(|id| id == song_id)
    }

    /// Both content checks automatic ingestion requires.
    pub fn is_eligible(&self, song_id: &str) -> bool {
        self.is_local_language && self.is_title_track(song_id)
    }
}

/// Counters read from a song detail page.
#[derive(Clone, Debug, PartialEq)]
pub struct SongDetail {
    /// Server-reported response time, used verbatim as the sample timestamp.
    pub observed_at: DateTime<Utc>,
    pub plays: i64,
    pub listeners: i64,
    pub credits: Credits,
}

// ============================================================================
// Time Series
// ============================================================================

/// Raw cumulative counters observed at one instant.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Sample {
    pub observed_at: DateTime<Utc>,
    pub plays: i64,
    pub listeners: i64,
}

/// Which cumulative counter a derived view is computed from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Counter {
    Plays,
    Listeners,
}

impl Sample {
    pub fn new(observed_at: DateTime<Utc>, plays: i64, listeners: i64) -> Self {
        Self {
            observed_at,
            plays,
            listeners,
        }
    }

    pub fn value(&self, counter: Counter) -> i64 {
        match counter {
            Counter::Plays => self.plays,
            Counter::Listeners => self.listeners,
        }
    }
}

impl From<&SongDetail> for Sample {
    fn from(detail: &SongDetail) -> Self {
        Sample::new(detail.observed_at, detail.plays, detail.listeners)
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// Outcome counts of one reconciliation pass.
#[derive(Default, Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpdateStats {
    pub discovery: bool,

    // Input
    pub chart_entries: usize,
    pub chart_pages_failed: usize,
    pub newest_entries: usize,

    // Per-entry classification
    pub skipped_blacklisted: usize,
    pub skipped_tracking: usize,
    pub skipped_known: usize,
    pub skipped_duplicate: usize,
    pub skipped_failed: usize,
    pub blacklisted: usize,

    // Applied changes
    pub resumed: usize,
    pub added: usize,
    pub pruned: usize,

    // Tracking counts
    pub tracking_before: usize,
    pub tracking_tally: usize,
    pub tracking_after: usize,
}

impl UpdateStats {
    pub fn log_summary(&self) {
        info!(
            entries = self.chart_entries,
            newest = self.newest_entries,
            blacklisted = self.blacklisted,
            failed = self.skipped_failed,
            "{} songs: tracking resumed, {} songs: added to the database, {} songs: pruned",
            self.resumed,
            self.added,
            self.pruned
        );
        info!(
            "Tracking {} songs (was {}, tally before quota check {})",
            self.tracking_after, self.tracking_before, self.tracking_tally
        );
    }

    /// Write stats to a JSON file
    pub fn write_to_file(&self, path: &std::path::Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

/// Outcome counts of one fetch dispatch.
#[derive(Default, Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FetchStats {
    pub minute: u32,
    pub due: usize,
    pub fetched: usize,
    pub failed: usize,
    pub credits_filled: usize,
}

impl FetchStats {
    pub fn log_summary(&self) {
        info!(
            "Minute {}: fetched {}/{} songs ({} failed, {} credits filled)",
            self.minute, self.fetched, self.due, self.failed, self.credits_filled
        );
    }

    /// Write stats to a JSON file
    pub fn write_to_file(&self, path: &std::path::Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}
