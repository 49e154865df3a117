//! kstreams library - streaming statistics tracking for the genie.co.kr chart.

pub mod db;
pub mod error;
pub mod genie;
pub mod models;
pub mod progress;
pub mod reconcile;
pub mod series;
pub mod song;
pub mod sources;

#[cfg(test)]
mod testing;

pub use db::{init_db, SongDb};
pub use error::{AddError, SourceError, StoreError, StoreResult};
pub use reconcile::Reconciler;
pub use series::{HourPeriod, TimeSeries};
pub use song::{fetch_minute, Song};
