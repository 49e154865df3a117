use anyhow::{bail, Context, Result};
use chrono::{Timelike, Utc};
use clap::{Parser, Subcommand};
use kstreams::db::{init_db, SongDb, DEFAULT_QUOTA};
use kstreams::genie::GenieClient;
use kstreams::progress::{format_duration, set_log_only, ProgressObserver};
use kstreams::reconcile::Reconciler;
use kstreams::series::Hourly;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "kstreams")]
#[command(about = "Track hourly plays of songs on the genie.co.kr real-time chart")]
struct Args {
    /// Database directory
    #[arg(long, global = true, env = "KSTREAMS_DB", default_value = "db")]
    db: PathBuf,

    /// Maximum number of tracked songs
    #[arg(long, global = true, env = "KSTREAMS_QUOTA")]
    quota: Option<usize>,

    /// Verbose logging (debug level)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log-only mode: disable progress bars, log progress periodically (for tail -f)
    #[arg(long, global = true)]
    log_only: bool,

    /// Write pass statistics to a JSON file
    #[arg(long, global = true)]
    stats: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create an empty database
    Init,

    /// Reconcile the real-time chart with the database
    Update,

    /// Like update, but also pick up songs from the newest releases
    UpdateNewest,

    /// Fetch every tracked song scheduled for a minute of the hour
    Fetch {
        /// Minute to fetch for (1-59); defaults to the current minute
        #[arg(long, value_parser = clap::value_parser!(u32).range(1..=59))]
        minute: Option<u32>,
    },

    /// Start tracking a song by ID, ignoring the blacklist and eligibility
    Add { song_id: String },

    /// Print the hourly series of one song
    Plays {
        song_id: String,

        /// New listeners instead of plays
        #[arg(long)]
        listeners: bool,

        /// Print JSON instead of tab-separated lines
        #[arg(long)]
        json: bool,
    },

    /// Print database counts
    Status,
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .init();
}

fn open_db(args: &Args) -> Result<SongDb> {
    let mut db = SongDb::open(&args.db)
        .with_context(|| format!("Failed to open database at {}", args.db.display()))?;
    db.set_quota(args.quota.unwrap_or(DEFAULT_QUOTA));
    Ok(db)
}

fn run_update(args: &Args, discovery: bool) -> Result<()> {
    let mut db = open_db(args)?;
    let client = GenieClient::new().context("Failed to build HTTP client")?;
    let observer = ProgressObserver::default();

    let mut reconciler = Reconciler::new(&client, &client).with_observer(&observer);
    if discovery {
        reconciler = reconciler.with_newest(&client);
    }
    let stats = reconciler.run(&mut db).context("Reconciliation failed")?;
    db.save().context("Failed to save database")?;

    if let Some(path) = &args.stats {
        stats.write_to_file(path).context("Failed to write stats")?;
    }
    Ok(())
}

fn run_fetch(args: &Args, minute: Option<u32>) -> Result<()> {
    let minute = minute.unwrap_or_else(|| Utc::now().minute());
    if minute == 0 {
        info!("No songs are scheduled for minute 0");
        return Ok(());
    }

    let mut db = open_db(args)?;
    let client = GenieClient::new().context("Failed to build HTTP client")?;
    let observer = ProgressObserver::default();

    let stats = db
        .fetch_due(minute, &client, &observer)
        .context("Fetch pass failed")?;
    db.save().context("Failed to save database")?;
    stats.log_summary();

    if let Some(path) = &args.stats {
        stats.write_to_file(path).context("Failed to write stats")?;
    }
    Ok(())
}

fn run_add(args: &Args, song_id: &str) -> Result<()> {
    let mut db = open_db(args)?;
    let client = GenieClient::new().context("Failed to build HTTP client")?;
    let song = db
        .add_from_song_id(song_id, &client)
        .with_context(|| format!("Failed to add song {}", song_id))?;
    println!("Added {} by {} (fetched at minute {})", song.title(), song.artist(), song.fetch_minute());
    db.save().context("Failed to save database")?;
    Ok(())
}

fn print_hourly(hourly: Hourly<'_>, json: bool) -> Result<()> {
    if json {
        let rows: Vec<_> = hourly.collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
    } else {
        for (period, value) in hourly {
            match value {
                Some(v) => println!("{}\t{}", period, v),
                None => println!("{}\t", period),
            }
        }
    }
    Ok(())
}

fn run_plays(args: &Args, song_id: &str, listeners: bool, json: bool) -> Result<()> {
    let db = open_db(args)?;
    let song = db.get(song_id)?;
    let hourly = if listeners {
        song.hourly_listeners(db.store())?
    } else {
        song.hourly_plays(db.store())?
    };
    print_hourly(hourly, json)
}

fn run_status(args: &Args) -> Result<()> {
    let db = open_db(args)?;
    println!("Database:    {}", db.path().display());
    println!("Songs:       {}", db.len());
    println!("Tracking:    {} / {}", db.count_tracking(), db.quota());
    println!("Blacklisted: {}", db.blacklist().count());
    Ok(())
}

fn run_init(path: &Path) -> Result<()> {
    if path.is_file() {
        bail!("{} is a file", path.display());
    }
    init_db(path).with_context(|| format!("Failed to create database at {}", path.display()))?;
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);
    set_log_only(args.log_only);

    let start = Instant::now();
    match &args.command {
        Command::Init => run_init(&args.db)?,
        Command::Update => run_update(&args, false)?,
        Command::UpdateNewest => run_update(&args, true)?,
        Command::Fetch { minute } => run_fetch(&args, *minute)?,
        Command::Add { song_id } => run_add(&args, song_id)?,
        Command::Plays {
            song_id,
            listeners,
            json,
        } => run_plays(&args, song_id, *listeners, *json)?,
        Command::Status => run_status(&args)?,
    }
    info!("Done in {}", format_duration(start.elapsed()));

    Ok(())
}
