//! Tracking database.
//!
//! A database directory holds three things:
//! - `songs.json`: song ID -> metadata record, in insertion order
//! - `blacklist.json`: IDs automatic ingestion must never reconsider
//! - `streams.sqlite3`: the per-song sample series
//!
//! The metadata and the blacklist are held in memory between [`SongDb::load`]
//! and [`SongDb::save`]; samples go to disk as soon as they are recorded.
//!
//! At most [`SongDb::quota`] songs are tracked at a time. Each tracked song
//! is fetched once an hour at its own minute, so with the default quota of
//! 3540 the site sees about one request per second on average.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Duration;
use rustc_hash::FxHashMap;
use serde::Serialize;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::error::{AddError, StoreError, StoreResult};
use crate::models::{FetchStats, NewSong, SongDetail, SongInfo};
use crate::progress::PassObserver;
use crate::series::{SeriesStore, SERIES_FILE};
use crate::song::Song;
use crate::sources::{AlbumSource, SongDetailSource};

pub const SONGS_FILE: &str = "songs.json";
pub const BLACKLIST_FILE: &str = "blacklist.json";

/// Default maximum number of tracked songs.
pub const DEFAULT_QUOTA: usize = 3540;

/// Trailing window songs are ranked over when pruning.
pub const RANKING_WINDOW_DAYS: i64 = 10;

/// Creates an empty database at `path`, creating the directory if needed.
/// Existing metadata documents at that location are overwritten.
pub fn init_db(path: &Path) -> StoreResult<SongDb> {
    fs::create_dir_all(path).map_err(|e| StoreError::io(path, e))?;
    write_json_atomic(path, &path.join(SONGS_FILE), &serde_json::Map::new())?;
    write_json_atomic(path, &path.join(BLACKLIST_FILE), &Vec::<String>::new())?;
    info!("Initialized empty database at {}", path.display());
    SongDb::open(path)
}

pub struct SongDb {
    root: PathBuf,
    quota: usize,
    songs: Vec<Song>,
    index: FxHashMap<String, usize>,
    blacklist: BTreeSet<String>,
    store: SeriesStore,
}

impl SongDb {
    /// Opens the database at `path` and loads its metadata and blacklist.
    pub fn open(path: &Path) -> StoreResult<Self> {
        // Metadata first: a directory without it must not gain a sample file.
        let documents = Documents::read(path)?;
        let store = SeriesStore::open(&path.join(SERIES_FILE))?;
        let mut db = Self {
            root: path.to_path_buf(),
            quota: DEFAULT_QUOTA,
            songs: Vec::new(),
            index: FxHashMap::default(),
            blacklist: BTreeSet::new(),
            store,
        };
        db.install(documents);
        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn quota(&self) -> usize {
        self.quota
    }

    pub fn set_quota(&mut self, quota: usize) {
        self.quota = quota;
    }

    pub fn store(&self) -> &SeriesStore {
        &self.store
    }

    // ------------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------------

    /// Replaces all in-memory state with what was last saved. Unsaved
    /// changes and every cached song entity are discarded.
    pub fn load(&mut self) -> StoreResult<()> {
        let documents = Documents::read(&self.root)?;
        self.install(documents);
        Ok(())
    }

    fn install(&mut self, documents: Documents) {
        self.songs = documents.songs;
        self.index = documents.index;
        self.blacklist = documents.blacklist;
        info!(
            songs = self.songs.len(),
            blacklisted = self.blacklist.len(),
            "Song metadata DB and blacklist loaded"
        );
    }

    /// Writes metadata and blacklist. Each document is replaced atomically.
    pub fn save(&self) -> StoreResult<()> {
        let songs_path = self.root.join(SONGS_FILE);
        let mut doc = serde_json::Map::with_capacity(self.songs.len());
        for song in &self.songs {
            let value =
                serde_json::to_value(song.info()).map_err(|e| StoreError::json(&songs_path, e))?;
            doc.insert(song.id().to_string(), value);
        }
        write_json_atomic(&self.root, &songs_path, &doc)?;

        let blacklist: Vec<&String> = self.blacklist.iter().collect();
        write_json_atomic(&self.root, &self.root.join(BLACKLIST_FILE), &blacklist)?;
        info!("Changes to the DB in memory saved on disk");
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Lookup
    // ------------------------------------------------------------------------

    pub fn get(&self, id: &str) -> StoreResult<&Song> {
        self.index
            .get(id)
            .map(|&idx| &self.songs[idx])
            .ok_or_else(|| StoreError::UnknownSong(id.to_string()))
    }

    fn get_mut(&mut self, id: &str) -> StoreResult<&mut Song> {
        match self.index.get(id) {
            Some(&idx) => Ok(&mut self.songs[idx]),
            None => Err(StoreError::UnknownSong(id.to_string())),
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.songs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.songs.is_empty()
    }

    /// Songs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Song> {
        self.songs.iter()
    }

    /// False for unknown IDs.
    pub fn is_tracking(&self, id: &str) -> bool {
        self.get(id).map(Song::is_tracking).unwrap_or(false)
    }

    pub fn count_tracking(&self) -> usize {
        self.songs.iter().filter(|s| s.is_tracking()).count()
    }

    pub fn set_tracking(&mut self, id: &str, value: bool) -> StoreResult<()> {
        self.get_mut(id)?.set_tracking(value);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Blacklist
    // ------------------------------------------------------------------------

    pub fn is_blacklisted(&self, id: &str) -> bool {
        self.blacklist.contains(id)
    }

    /// Returns false if the ID was already blacklisted.
    pub fn blacklist_song(&mut self, id: &str) -> bool {
        self.blacklist.insert(id.to_string())
    }

    pub fn blacklist(&self) -> impl Iterator<Item = &str> {
        self.blacklist.iter().map(String::as_str)
    }

    // ------------------------------------------------------------------------
    // Tracking changes
    // ------------------------------------------------------------------------

    /// Stops tracking the `n` tracked songs with the lowest average hourly
    /// plays over the last [`RANKING_WINDOW_DAYS`]. Songs without data go
    /// first; ties keep insertion order. Returns the IDs pruned.
    pub fn prune(&mut self, n: usize) -> StoreResult<Vec<String>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let window = Duration::days(RANKING_WINDOW_DAYS);

        let mut ranked: Vec<(usize, Option<f64>)> = Vec::new();
        for (idx, song) in self.songs.iter().enumerate() {
            if song.is_tracking() {
                ranked.push((idx, song.recent_average_plays(&self.store, window)?));
            }
        }
        ranked.sort_by(|a, b| compare_rank(a.1, b.1));

        let mut pruned = Vec::with_capacity(n.min(ranked.len()));
        for (idx, average) in ranked.into_iter().take(n) {
            let song = &mut self.songs[idx];
            song.set_tracking(false);
            debug!(
                average = average.unwrap_or(f64::NAN),
                "Tracking disabled ({} by {})",
                song.title(),
                song.artist()
            );
            pruned.push(song.id().to_string());
        }
        info!("Disabled tracking of {} songs", pruned.len());
        Ok(pruned)
    }

    /// Adds a song with the given metadata, tracking it with empty credits
    /// and an empty series. Fails if the ID is already known.
    pub fn add_from_info(&mut self, new: NewSong) -> StoreResult<&Song> {
        if self.contains(&new.id) {
            return Err(StoreError::DuplicateSong(new.id));
        }
        self.store.create(&new.id)?;

        let info = SongInfo {
            title: new.title,
            artist: new.artist,
            agency: new.agency,
            release_date: new.release_date,
            is_tracking: true,
            credits: Default::default(),
            fetch_minute: None,
        };
        let idx = self.songs.len();
        self.index.insert(new.id.clone(), idx);
        self.songs.push(Song::new(new.id, info));

        let song = &self.songs[idx];
        info!(
            minute = song.fetch_minute(),
            "Added to database ({} by {})",
            song.title(),
            song.artist()
        );
        Ok(song)
    }

    /// Looks the song up on the site and adds it, bypassing the blacklist
    /// and the eligibility checks.
    pub fn add_from_song_id<S>(&mut self, id: &str, source: &S) -> Result<&Song, AddError>
    where
        S: SongDetailSource + AlbumSource + ?Sized,
    {
        if self.contains(id) {
            return Err(StoreError::DuplicateSong(id.to_string()).into());
        }
        let entry = source.fetch_song_entry(id)?;
        let album = source.fetch_album(&entry.album_id)?;
        Ok(self.add_from_info(NewSong::from_entry(&entry, &album))?)
    }

    // ------------------------------------------------------------------------
    // Fetching
    // ------------------------------------------------------------------------

    /// Records a fetched detail for a known song.
    pub fn record_fetch(&mut self, id: &str, detail: SongDetail) -> StoreResult<bool> {
        let idx = *self
            .index
            .get(id)
            .ok_or_else(|| StoreError::UnknownSong(id.to_string()))?;
        self.songs[idx].record_fetch(&self.store, detail)
    }

    /// Fetches every tracked song scheduled for `minute`. A failed fetch is
    /// logged and skipped; a failed write aborts the pass.
    pub fn fetch_due(
        &mut self,
        minute: u32,
        source: &dyn SongDetailSource,
        observer: &dyn PassObserver,
    ) -> StoreResult<FetchStats> {
        let due: Vec<usize> = self
            .songs
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_tracking() && s.fetch_minute() == minute)
            .map(|(idx, _)| idx)
            .collect();
        info!("{} songs will be fetched for minute {}", due.len(), minute);

        let mut stats = FetchStats {
            minute,
            due: due.len(),
            ..Default::default()
        };
        observer.start(&format!("Fetching minute {}", minute), due.len() as u64);
        for idx in due {
            let song = &mut self.songs[idx];
            match source.fetch_song_detail(song.id()) {
                Ok(detail) => {
                    if song.record_fetch(&self.store, detail)? {
                        stats.credits_filled += 1;
                    }
                    stats.fetched += 1;
                    debug!("Fetching completed: {} by {}", song.title(), song.artist());
                }
                Err(err) => {
                    stats.failed += 1;
                    warn!(song_id = song.id(), error = %err, "Fetch failed, skipping");
                }
            }
            observer.step();
        }
        observer.finish(&format!(
            "Fetched {}/{} songs for minute {}",
            stats.fetched, stats.due, minute
        ));
        Ok(stats)
    }
}

/// Lowest average first; no data below everything.
fn compare_rank(a: Option<f64>, b: Option<f64>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(x), Some(y)) => x.total_cmp(&y),
    }
}

// ============================================================================
// JSON documents
// ============================================================================

/// The two metadata documents of a database directory, parsed.
struct Documents {
    songs: Vec<Song>,
    index: FxHashMap<String, usize>,
    blacklist: BTreeSet<String>,
}

impl Documents {
    fn read(root: &Path) -> StoreResult<Self> {
        let songs_path = root.join(SONGS_FILE);
        let doc: serde_json::Map<String, serde_json::Value> = read_json(&songs_path)?;

        let mut songs = Vec::with_capacity(doc.len());
        let mut index = FxHashMap::default();
        for (id, value) in doc {
            let info: SongInfo =
                serde_json::from_value(value).map_err(|e| StoreError::json(&songs_path, e))?;
            index.insert(id.clone(), songs.len());
            songs.push(Song::new(id, info));
        }

        let blacklist: Vec<String> = read_json(&root.join(BLACKLIST_FILE))?;
        Ok(Self {
            songs,
            index,
            blacklist: blacklist.into_iter().collect(),
        })
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> StoreResult<T> {
    let text = fs::read_to_string(path).map_err(|e| StoreError::io(path, e))?;
    serde_json::from_str(&text).map_err(|e| StoreError::json(path, e))
}

/// Writes to a temporary file in `dir`, then renames it over `path`.
fn write_json_atomic<T: Serialize + ?Sized>(dir: &Path, path: &Path, value: &T) -> StoreResult<()> {
    let mut tmp = NamedTempFile::new_in(dir).map_err(|e| StoreError::io(dir, e))?;
    serde_json::to_writer_pretty(tmp.as_file_mut(), value).map_err(|e| StoreError::json(path, e))?;
    tmp.as_file_mut()
        .flush()
        .and_then(|_| tmp.as_file().sync_all())
        .map_err(|e| StoreError::io(path, e))?;
    tmp.persist(path).map_err(|e| StoreError::io(path, e.error))?;
    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Credits;
    use crate::progress::NoopObserver;
    use crate::song::fetch_minute;
    use crate::testing::{new_song, FakeSite};
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    fn setup() -> (TempDir, SongDb) {
        let dir = TempDir::new().unwrap();
        let db = init_db(dir.path()).unwrap();
        (dir, db)
    }

    /// Records hourly samples so the song averages `per_hour` plays.
    fn record_hours(db: &mut SongDb, id: &str, per_hour: i64) {
        for hour in 0..5 {
            let detail = SongDetail {
                observed_at: Utc.with_ymd_and_hms(2018, 9, 18, hour, 0, 0).unwrap(),
                plays: per_hour * hour as i64,
                listeners: 0,
                credits: Credits::default(),
            };
            db.record_fetch(id, detail).unwrap();
        }
    }

    #[test]
    fn test_init_creates_empty_database() {
        let (dir, db) = setup();
        assert!(db.is_empty());
        assert_eq!(db.quota(), DEFAULT_QUOTA);
        assert!(dir.path().join(SONGS_FILE).exists());
        assert!(dir.path().join(BLACKLIST_FILE).exists());
        assert!(dir.path().join(SERIES_FILE).exists());
    }

    #[test]
    fn test_init_fails_on_unwritable_path() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("not-a-dir");
        fs::write(&file, "x").unwrap();
        assert!(init_db(&file.join("db")).is_err());
    }

    #[test]
    fn test_open_missing_database_fails() {
        let dir = TempDir::new().unwrap();
        let result = SongDb::open(dir.path());
        assert!(matches!(result, Err(StoreError::Io { .. })));
        assert!(!dir.path().join(SERIES_FILE).exists());
    }

    #[test]
    fn test_open_nonexistent_directory_creates_nothing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nowhere");
        assert!(matches!(SongDb::open(&path), Err(StoreError::Io { .. })));
        assert!(!path.exists());
    }

    #[test]
    fn test_add_and_lookup() {
        let (_dir, mut db) = setup();
        db.add_from_info(new_song("1")).unwrap();

        assert!(db.contains("1"));
        assert_eq!(db.len(), 1);
        assert!(db.is_tracking("1"));
        assert_eq!(db.count_tracking(), 1);

        let song = db.get("1").unwrap();
        assert_eq!(song.title(), "Song 1");
        assert!(song.credits().is_empty());
        assert_eq!(song.fetch_minute(), fetch_minute("1"));
        assert!(db.store().exists("1").unwrap());
    }

    #[test]
    fn test_add_duplicate_fails() {
        let (_dir, mut db) = setup();
        db.add_from_info(new_song("1")).unwrap();
        let result = db.add_from_info(new_song("1"));
        assert!(matches!(result, Err(StoreError::DuplicateSong(id)) if id == "1"));
        assert_eq!(db.len(), 1);
    }

    #[test]
    fn test_unknown_ids() {
        let (_dir, mut db) = setup();
        assert!(!db.is_tracking("nope"));
        assert!(matches!(db.get("nope"), Err(StoreError::UnknownSong(_))));
        assert!(db.set_tracking("nope", true).is_err());
    }

    #[test]
    fn test_prune_lowest_ranked() {
        let (_dir, mut db) = setup();
        for (id, per_hour) in [("a", 500), ("b", 100), ("c", 300), ("d", 200)] {
            db.add_from_info(new_song(id)).unwrap();
            record_hours(&mut db, id, per_hour);
        }

        let pruned = db.prune(2).unwrap();
        assert_eq!(pruned, vec!["b".to_string(), "d".to_string()]);
        assert!(!db.is_tracking("b"));
        assert!(!db.is_tracking("d"));
        assert!(db.is_tracking("a"));
        assert!(db.is_tracking("c"));
        // Records and series stay.
        assert_eq!(db.len(), 4);
        assert_eq!(db.store().sample_count("b").unwrap(), 5);
    }

    #[test]
    fn test_prune_no_data_goes_first_and_ties_keep_insertion_order() {
        let (_dir, mut db) = setup();
        for id in ["x", "y", "z", "w"] {
            db.add_from_info(new_song(id)).unwrap();
        }
        record_hours(&mut db, "x", 100);
        record_hours(&mut db, "w", 100);
        // y and z have no data; x and w tie.
        assert_eq!(db.prune(3).unwrap(), vec!["y", "z", "x"]);
        assert!(db.is_tracking("w"));
    }

    #[test]
    fn test_prune_only_considers_tracking_songs() {
        let (_dir, mut db) = setup();
        for id in ["a", "b", "c"] {
            db.add_from_info(new_song(id)).unwrap();
        }
        db.set_tracking("a", false).unwrap();
        let pruned = db.prune(10).unwrap();
        assert_eq!(pruned, vec!["b", "c"]);
        assert_eq!(db.count_tracking(), 0);
    }

    #[test]
    fn test_prune_zero_is_noop() {
        let (_dir, mut db) = setup();
        db.add_from_info(new_song("a")).unwrap();
        assert!(db.prune(0).unwrap().is_empty());
        assert!(db.is_tracking("a"));
    }

    #[test]
    fn test_prune_is_repeatable() {
        let (_dir, mut db) = setup();
        for (id, per_hour) in [("a", 300), ("b", 100), ("c", 200)] {
            db.add_from_info(new_song(id)).unwrap();
            record_hours(&mut db, id, per_hour);
        }
        assert_eq!(db.prune(1).unwrap(), vec!["b"]);
        assert_eq!(db.prune(1).unwrap(), vec!["c"]);
        assert_eq!(db.count_tracking(), 1);
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let (dir, mut db) = setup();
        for id in ["3", "1", "2"] {
            db.add_from_info(new_song(id)).unwrap();
        }
        db.set_tracking("1", false).unwrap();
        db.blacklist_song("99");
        db.blacklist_song("42");
        db.save().unwrap();

        let reopened = SongDb::open(dir.path()).unwrap();
        let ids: Vec<&str> = reopened.iter().map(|s| s.id()).collect();
        assert_eq!(ids, vec!["3", "1", "2"]);
        for song in db.iter() {
            assert_eq!(reopened.get(song.id()).unwrap().info(), song.info());
        }
        assert_eq!(reopened.blacklist().collect::<Vec<_>>(), vec!["42", "99"]);
    }

    #[test]
    fn test_load_discards_unsaved_changes() {
        let (_dir, mut db) = setup();
        db.add_from_info(new_song("1")).unwrap();
        db.save().unwrap();

        db.add_from_info(new_song("2")).unwrap();
        db.set_tracking("1", false).unwrap();
        db.blacklist_song("3");
        db.load().unwrap();

        assert_eq!(db.len(), 1);
        assert!(db.is_tracking("1"));
        assert!(!db.contains("2"));
        assert!(!db.is_blacklisted("3"));
    }

    #[test]
    fn test_saved_document_keeps_non_ascii() {
        let (dir, mut db) = setup();
        let mut song = new_song("1");
        song.title = "뚜두뚜두".to_string();
        db.add_from_info(song).unwrap();
        db.save().unwrap();
        let text = fs::read_to_string(dir.path().join(SONGS_FILE)).unwrap();
        assert!(text.contains("뚜두뚜두"));
        assert!(text.contains("\"fetch_minute\""));
    }

    #[test]
    fn test_add_from_song_id() {
        let (_dir, mut db) = setup();
        let site = FakeSite::new().with_song("7", "A7", true, true);
        db.blacklist_song("7");
        let song = db.add_from_song_id("7", &site).unwrap();
        assert_eq!(song.artist(), "Artist 7");
        assert_eq!(song.agency(), "Agency A7");
        assert!(db.is_tracking("7"));

        assert!(matches!(
            db.add_from_song_id("7", &site),
            Err(AddError::Store(StoreError::DuplicateSong(_)))
        ));
        assert!(matches!(
            db.add_from_song_id("8", &site),
            Err(AddError::Source(_))
        ));
    }

    #[test]
    fn test_fetch_due_isolates_failures() {
        let (_dir, mut db) = setup();
        // Pick IDs sharing one minute.
        let minute = fetch_minute("1");
        let ids: Vec<String> = (1..2000)
            .map(|n| n.to_string())
            .filter(|id| fetch_minute(id) == minute)
            .take(3)
            .collect();
        let other = (1..2000)
            .map(|n| n.to_string())
            .find(|id| fetch_minute(id) != minute)
            .unwrap();
        for id in ids.iter().chain([&other]) {
            db.add_from_info(new_song(id)).unwrap();
        }
        db.set_tracking(&ids[2], false).unwrap();

        let observed_at = Utc.with_ymd_and_hms(2018, 9, 18, 10, 0, 0).unwrap();
        let site = FakeSite::new().with_detail(&ids[0], observed_at, 1000, 50);

        let stats = db.fetch_due(minute, &site, &NoopObserver).unwrap();
        assert_eq!(stats.due, 2);
        assert_eq!(stats.fetched, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.credits_filled, 1);

        assert_eq!(db.store().sample_count(&ids[0]).unwrap(), 1);
        assert_eq!(db.store().sample_count(&ids[1]).unwrap(), 0);
        assert!(!db.get(&ids[0]).unwrap().credits().is_empty());
        assert!(db.get(&ids[1]).unwrap().credits().is_empty());
    }

    #[test]
    fn test_fetch_due_other_minute_fetches_nothing() {
        let (_dir, mut db) = setup();
        db.add_from_info(new_song("1")).unwrap();
        let minute = if fetch_minute("1") == 59 { 1 } else { fetch_minute("1") + 1 };
        let stats = db.fetch_due(minute, &FakeSite::new(), &NoopObserver).unwrap();
        assert_eq!(stats.due, 0);
    }
}
