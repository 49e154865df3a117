//! Chart reconciliation.
//!
//! Merges the current real-time chart into the database. Each entry is
//! classified in chart order:
//!
//! 1. blacklisted: skipped
//! 2. known and tracking: skipped
//! 3. known but not tracking: resumed after the scan
//! 4. unknown: the album page decides. Eligible songs are added after the
//!    scan, ineligible ones are blacklisted on the spot, and songs whose
//!    album page could not be fetched are left for the next pass.
//!
//! Every resume and add bumps a running tally. Once the scan is done and the
//! tally exceeds the quota, the excess is pruned from the songs tracked
//! before the pass. Resumes and adds are applied only after that, so a song
//! picked up in this pass is never pruned in the same pass.
//!
//! In discovery mode the newest releases list is scanned before the chart.
//! Inclusion in that list implies eligibility, so its songs skip the
//! language and title-track checks. Songs already known are left to the
//! chart scan.

use rustc_hash::FxHashSet;
use tracing::{debug, info, warn};

use crate::db::SongDb;
use crate::error::StoreResult;
use crate::models::{ChartEntry, NewSong, UpdateStats};
use crate::progress::{NoopObserver, PassObserver};
use crate::sources::{AlbumSource, ChartSource, NewestSource, CHART_PAGES};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Origin {
    Newest,
    Chart,
}

/// Decisions collected during the scan, applied after it.
#[derive(Default)]
struct Plan {
    tally: usize,
    resume: Vec<String>,
    add: Vec<NewSong>,
    seen: FxHashSet<String>,
}

pub struct Reconciler<'a> {
    chart: &'a dyn ChartSource,
    albums: &'a dyn AlbumSource,
    newest: Option<&'a dyn NewestSource>,
    observer: &'a dyn PassObserver,
}

impl<'a> Reconciler<'a> {
    pub fn new(chart: &'a dyn ChartSource, albums: &'a dyn AlbumSource) -> Self {
        Self {
            chart,
            albums,
            newest: None,
            observer: &NoopObserver,
        }
    }

    /// Enables discovery mode.
    pub fn with_newest(mut self, newest: &'a dyn NewestSource) -> Self {
        self.newest = Some(newest);
        self
    }

    pub fn with_observer(mut self, observer: &'a dyn PassObserver) -> Self {
        self.observer = observer;
        self
    }

    /// Runs one pass against `db`. Source failures skip the affected page or
    /// entry; storage failures abort the pass.
    pub fn run(&self, db: &mut SongDb) -> StoreResult<UpdateStats> {
        let tracking_before = db.count_tracking();
        let mut stats = UpdateStats {
            discovery: self.newest.is_some(),
            tracking_before,
            ..Default::default()
        };
        let mut plan = Plan {
            tally: tracking_before,
            ..Default::default()
        };

        let newest = self.fetch_newest(&mut stats);
        let chart = self.fetch_chart(&mut stats);

        let total = newest.len() + chart.len();
        self.observer.start("Reconciling chart", total as u64);
        for entry in &newest {
            self.classify(db, entry, Origin::Newest, &mut plan, &mut stats);
            self.observer.step();
        }
        for entry in &chart {
            self.classify(db, entry, Origin::Chart, &mut plan, &mut stats);
            self.observer.step();
        }
        self.observer.finish(&format!(
            "Scanned {} entries: {} to resume, {} to add",
            total,
            plan.resume.len(),
            plan.add.len()
        ));

        self.apply(db, plan, &mut stats)?;
        stats.log_summary();
        Ok(stats)
    }

    fn fetch_newest(&self, stats: &mut UpdateStats) -> Vec<ChartEntry> {
        let Some(source) = self.newest else {
            return Vec::new();
        };
        match source.fetch_newest() {
            Ok(entries) => {
                info!("{} songs found in the newest releases", entries.len());
                stats.newest_entries = entries.len();
                entries
            }
            Err(err) => {
                warn!(error = %err, "Could not read the newest releases, continuing with the chart");
                Vec::new()
            }
        }
    }

    fn fetch_chart(&self, stats: &mut UpdateStats) -> Vec<ChartEntry> {
        let mut entries = Vec::new();
        for page in 0..CHART_PAGES {
            match self.chart.fetch_chart_page(page) {
                Ok(page_entries) => entries.extend(page_entries),
                Err(err) => {
                    stats.chart_pages_failed += 1;
                    warn!(page = page + 1, error = %err, "Could not read chart page, skipping");
                }
            }
        }
        info!("{} songs found in the real-time chart", entries.len());
        stats.chart_entries = entries.len();
        entries
    }

    fn classify(
        &self,
        db: &mut SongDb,
        entry: &ChartEntry,
        origin: Origin,
        plan: &mut Plan,
        stats: &mut UpdateStats,
    ) {
        let id = entry.id.as_str();

        if origin == Origin::Newest && db.contains(id) {
            stats.skipped_known += 1;
            return;
        }
        if !plan.seen.insert(id.to_string()) {
            stats.skipped_duplicate += 1;
            return;
        }
        if db.is_blacklisted(id) {
            stats.skipped_blacklisted += 1;
            debug!("Skipping blacklisted ({} by {})", entry.title, entry.artist);
            return;
        }
        if db.contains(id) {
            if db.is_tracking(id) {
                stats.skipped_tracking += 1;
                debug!("Already tracking ({} by {})", entry.title, entry.artist);
            } else {
                plan.resume.push(id.to_string());
                plan.tally += 1;
                debug!("Will resume tracking ({} by {})", entry.title, entry.artist);
            }
            return;
        }

        let album = match self.albums.fetch_album(&entry.album_id) {
            Ok(album) => album,
            Err(err) => {
                stats.skipped_failed += 1;
                warn!(
                    song_id = id,
                    album_id = %entry.album_id,
                    error = %err,
                    "Could not read album info, will retry next pass"
                );
                return;
            }
        };

        if origin == Origin::Newest || album.is_eligible(id) {
            plan.add.push(NewSong::from_entry(entry, &album));
            plan.tally += 1;
            debug!("Will add ({} by {})", entry.title, entry.artist);
        } else {
            db.blacklist_song(id);
            stats.blacklisted += 1;
            debug!(
                local = album.is_local_language,
                title_track = album.is_title_track(id),
                "Blacklisted ({} by {})",
                entry.title,
                entry.artist
            );
        }
    }

    fn apply(&self, db: &mut SongDb, plan: Plan, stats: &mut UpdateStats) -> StoreResult<()> {
        stats.tracking_tally = plan.tally;
        if plan.tally > db.quota() {
            stats.pruned = db.prune(plan.tally - db.quota())?.len();
        }
        for id in &plan.resume {
            db.set_tracking(id, true)?;
            stats.resumed += 1;
        }
        for new in plan.add {
            db.add_from_info(new)?;
            stats.added += 1;
        }
        stats.tracking_after = db.count_tracking();
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================
