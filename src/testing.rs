//! In-memory chart site for unit tests.

use std::cell::RefCell;

use chrono::{DateTime, TimeZone, Utc};
use rustc_hash::FxHashMap;

use crate::error::SourceError;
use crate::models::{AlbumInfo, ChartEntry, Credits, NewSong, SongDetail};
use crate::sources::{AlbumSource, ChartSource, NewestSource, SongDetailSource};

pub(crate) fn release_date() -> DateTime<chrono::FixedOffset> {
    Utc.with_ymd_and_hms(2018, 6, 15, 9, 0, 0).unwrap().fixed_offset()
}

pub(crate) fn new_song(id: &str) -> NewSong {
    NewSong {
        id: id.to_string(),
        title: format!("Song {}", id),
        artist: format!("Artist {}", id),
        agency: "Agency".to_string(),
        release_date: release_date(),
    }
}

/// Every page and album lookup is answered from maps filled by the builder
/// methods. Anything not registered fails like a missing page would.
#[derive(Default)]
pub(crate) struct FakeSite {
    songs: FxHashMap<String, ChartEntry>,
    albums: FxHashMap<String, AlbumInfo>,
    details: FxHashMap<String, SongDetail>,
    pages: Vec<Option<Vec<String>>>,
    newest: Option<Vec<String>>,
    album_calls: RefCell<Vec<String>>,
}

impl FakeSite {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Registers a song on album `album_id`. The album is created on first
    /// mention with the given language flag.
    pub(crate) fn with_song(mut self, id: &str, album_id: &str, local: bool, title: bool) -> Self {
        self.songs.insert(
            id.to_string(),
            ChartEntry {
                id: id.to_string(),
                title: format!("Song {}", id),
                artist: format!("Artist {}", id),
                album_id: album_id.to_string(),
            },
        );
        let album = self
            .albums
            .entry(album_id.to_string())
            .or_insert_with(|| AlbumInfo {
                release_date: release_date(),
                agency: format!("Agency {}", album_id),
                is_local_language: local,
                title_tracks: Vec::new(),
            });
        if title {
            album.title_tracks.push(id.to_string());
        }
        self
    }

    /// Registers a song whose album page cannot be fetched.
    pub(crate) fn with_broken_album(mut self, id: &str) -> Self {
        self.songs.insert(
            id.to_string(),
            ChartEntry {
                id: id.to_string(),
                title: format!("Song {}", id),
                artist: format!("Artist {}", id),
                album_id: format!("missing-{}", id),
            },
        );
        self
    }

    pub(crate) fn with_detail(mut self, id: &str, observed_at: DateTime<Utc>, plays: i64, listeners: i64) -> Self {
        self.details.insert(
            id.to_string(),
            SongDetail {
                observed_at,
                plays,
                listeners,
                credits: Credits {
                    lyrics: vec!["Lyricist".to_string()],
                    composition: vec!["Composer".to_string()],
                    arrangement: Vec::new(),
                },
            },
        );
        self
    }

    pub(crate) fn with_page(mut self, ids: &[&str]) -> Self {
        self.pages.push(Some(ids.iter().map(|id| id.to_string()).collect()));
        self
    }

    pub(crate) fn with_failed_page(mut self) -> Self {
        self.pages.push(None);
        self
    }

    pub(crate) fn with_newest(mut self, ids: &[&str]) -> Self {
        self.newest = Some(ids.iter().map(|id| id.to_string()).collect());
        self
    }

    pub(crate) fn album_calls(&self) -> Vec<String> {
        self.album_calls.borrow().clone()
    }

    fn entries(&self, ids: &[String]) -> Vec<ChartEntry> {
        ids.iter().filter_map(|id| self.songs.get(id).cloned()).collect()
    }
}

impl ChartSource for FakeSite {
    fn fetch_chart_page(&self, page: usize) -> Result<Vec<ChartEntry>, SourceError> {
        match self.pages.get(page) {
            Some(Some(ids)) => Ok(self.entries(ids)),
            Some(None) => Err(SourceError::missing("chart page", page.to_string())),
            None => Ok(Vec::new()),
        }
    }
}

impl NewestSource for FakeSite {
    fn fetch_newest(&self) -> Result<Vec<ChartEntry>, SourceError> {
        match &self.newest {
            Some(ids) => Ok(self.entries(ids)),
            None => Err(SourceError::missing("newest releases", "")),
        }
    }
}

impl SongDetailSource for FakeSite {
    fn fetch_song_detail(&self, song_id: &str) -> Result<SongDetail, SourceError> {
        self.details
            .get(song_id)
            .cloned()
            .ok_or_else(|| SourceError::missing("song detail", song_id))
    }

    fn fetch_song_entry(&self, song_id: &str) -> Result<ChartEntry, SourceError> {
        self.songs
            .get(song_id)
            .cloned()
            .ok_or_else(|| SourceError::missing("song", song_id))
    }
}

impl AlbumSource for FakeSite {
    fn fetch_album(&self, album_id: &str) -> Result<AlbumInfo, SourceError> {
        self.album_calls.borrow_mut().push(album_id.to_string());
        self.albums
            .get(album_id)
            .cloned()
            .ok_or_else(|| SourceError::missing("album", album_id))
    }
}
