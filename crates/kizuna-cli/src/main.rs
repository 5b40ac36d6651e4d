mod oauth;

use anyhow::{anyhow, bail, Result};
use chrono::{Datelike, Utc};
use clap::{Parser, Subcommand};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use kizuna_api::ReqwestTransport;
use kizuna_core::config::AppConfig;
use kizuna_core::models::{AnimeSeason, LibraryEntry, MediaEntry, ServiceKind, WatchStatus};
use kizuna_runtime::{MutationHandle, Runtime, SyncOrchestrator};

/// Keep a local anime library in sync with AniList, Kitsu or MyAnimeList
#[derive(Parser)]
#[command(name = "kizuna", version)]
struct Cli {
    /// Service to talk to instead of the configured primary one
    #[arg(long, global = true, value_parser = parse_service)]
    service: Option<ServiceKind>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Authenticate with the service
    Login {
        /// Username or email (Kitsu only)
        #[arg(long)]
        username: Option<String>,
    },
    /// Forget the stored credential
    Logout,
    /// Fetch the remote library and reconcile it with the local one
    Sync {
        #[arg(long)]
        json: bool,
    },
    /// Show the local library
    List {
        #[arg(long)]
        json: bool,
    },
    /// Search the service catalogue
    Search { query: String },
    /// List the anime of a season (defaults to the current one)
    Season {
        #[arg(value_parser = parse_season)]
        season: Option<AnimeSeason>,
        year: Option<u32>,
    },
    /// Show details for one anime
    Info { id: u64 },
    /// Add an anime to the library
    Add {
        id: u64,
        #[arg(long, value_parser = parse_status, default_value = "plan_to_watch")]
        status: WatchStatus,
        #[arg(long, default_value_t = 0)]
        episodes: u32,
    },
    /// Change an existing library entry
    Update {
        id: u64,
        #[arg(long, value_parser = parse_status)]
        status: Option<WatchStatus>,
        #[arg(long)]
        episodes: Option<u32>,
        /// Score on a 0-10 scale, 0 clears it
        #[arg(long)]
        score: Option<f32>,
    },
    /// Remove an anime from the library
    Delete { id: u64 },
    /// Push every local change the service has not confirmed yet
    Resync,
}

fn parse_service(s: &str) -> Result<ServiceKind, String> {
    ServiceKind::from_key(&s.to_ascii_lowercase())
        .ok_or_else(|| format!("unknown service '{s}' (expected anilist, kitsu or mal)"))
}

fn parse_status(s: &str) -> Result<WatchStatus, String> {
    WatchStatus::from_db_str(&s.to_ascii_lowercase()).ok_or_else(|| {
        let known: Vec<_> = WatchStatus::ALL.iter().map(|s| s.as_db_str()).collect();
        format!("unknown status '{s}' (expected one of {})", known.join(", "))
    })
}

fn parse_season(s: &str) -> Result<AnimeSeason, String> {
    AnimeSeason::from_key(s).ok_or_else(|| format!("unknown season '{s}'"))
}

/// Stderr for the user, a daily file in the data dir for later.
fn init_logging() -> tracing_appender::non_blocking::WorkerGuard {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("kizuna=info"));
    let appender = tracing_appender::rolling::daily(AppConfig::log_dir(), "kizuna.log");
    let (file, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(fmt::layer().with_ansi(false).with_writer(file))
        .init();
    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = init_logging();

    let runtime = Runtime::new().await?;
    if let Some(kind) = cli.service {
        runtime.switch_service(kind).await?;
    }

    let result = run(&runtime, cli.command).await;
    runtime.shutdown().await;
    result
}

async fn run(runtime: &Runtime, command: Commands) -> Result<()> {
    let sync = runtime.orchestrator().await;
    let service = sync.service();

    match command {
        Commands::Login { username } => {
            let request = oauth::login_request(service, &runtime.config().services, username).await?;
            sync.authenticate(request).await?;
            println!("Logged in to {service}");
        }
        Commands::Logout => {
            sync.logout();
            println!("Logged out of {service}");
        }
        Commands::Sync { json } => {
            let report = sync.fetch_library().await?;
            // Wait for the re-pushes the reconciliation queued.
            sync.wait_idle().await;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!(
                    "{service}: {} remote, {} added, {} replaced, {} kept, {} removed, {} pushed",
                    report.remote,
                    report.added,
                    report.replaced,
                    report.kept_local,
                    report.removed,
                    report.repushed
                );
            }
        }
        Commands::List { json } => {
            let entries = sync.entries();
            if json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else if entries.is_empty() {
                println!("Library is empty. Run `kizuna sync` to fetch it.");
            } else {
                for tracked in entries {
                    let entry = &tracked.entry;
                    let score = entry.score.map(|s| format!("{s:.1}")).unwrap_or_else(|| "-".into());
                    let flag = if tracked.needs_resync { " (pending)" } else { "" };
                    println!(
                        "{:>8}  {:<14} ep {:>4}  score {:>4}{flag}",
                        entry.media_id, entry.status.as_str(), entry.watched_episodes, score
                    );
                }
            }
        }
        Commands::Search { query } => print_media(&sync.search(&query).await?),
        Commands::Season { season, year } => {
            let season = season.unwrap_or_else(AnimeSeason::current);
            let year = year.unwrap_or_else(|| Utc::now().year() as u32);
            print_media(&sync.season(season, year).await?);
        }
        Commands::Info { id } => {
            let media = sync.metadata(id).await?;
            println!("{} [{}]", media.title, media.id);
            if !media.synonyms.is_empty() {
                println!("  aka {}", media.synonyms.join(", "));
            }
            if let Some(count) = media.episode_count {
                println!("  episodes: {count}");
            }
            if let Some(season) = media.season {
                println!("  season: {} {}", season.season, season.year);
            }
            if let Some(status) = media.status {
                println!("  airing: {}", status.as_str());
            }
            if let Some(score) = media.aggregate_score {
                println!("  score: {score:.1}");
            }
            if !media.genres.is_empty() {
                println!("  genres: {}", media.genres.join(", "));
            }
            if let Some(tracked) = sync.entry(id) {
                println!(
                    "  library: {}, {} episodes watched",
                    tracked.entry.status.as_str(),
                    tracked.entry.watched_episodes
                );
            }
            if let Some(synopsis) = media.synopsis {
                println!("\n{synopsis}");
            }
        }
        Commands::Add { id, status, episodes } => {
            if sync.entry(id).is_some() {
                bail!("{id} is already in the library, use `kizuna update`");
            }
            let mut entry = LibraryEntry::new(id, status);
            entry.watched_episodes = episodes;
            confirm(&sync, sync.add(entry)).await?;
        }
        Commands::Update {
            id,
            status,
            episodes,
            score,
        } => {
            let mut entry = sync
                .entry(id)
                .map(|tracked| tracked.entry)
                .ok_or_else(|| anyhow!("{id} is not in the library, use `kizuna add`"))?;
            if let Some(status) = status {
                entry.status = status;
            }
            if let Some(episodes) = episodes {
                entry.watched_episodes = episodes;
            }
            if let Some(score) = score {
                if !(0.0..=10.0).contains(&score) {
                    bail!("score must be between 0 and 10");
                }
                entry.score = (score > 0.0).then_some(score);
            }
            entry.last_updated = Utc::now();
            confirm(&sync, sync.update(entry)).await?;
        }
        Commands::Delete { id } => {
            sync.delete(id).outcome().await?;
            println!("Removed {id}");
        }
        Commands::Resync => {
            let handles = sync.resync();
            if handles.is_empty() {
                println!("Nothing to resync");
                return Ok(());
            }
            let total = handles.len();
            let mut failed = 0;
            for handle in handles {
                let media_id = handle.media_id();
                if let Err(e) = handle.outcome().await {
                    tracing::warn!(media_id, "resync failed: {e}");
                    failed += 1;
                }
            }
            println!("Pushed {} of {total} entries", total - failed);
            if failed > 0 {
                bail!("{failed} entries are still pending");
            }
        }
    }
    Ok(())
}

async fn confirm(sync: &SyncOrchestrator<ReqwestTransport>, handle: MutationHandle) -> Result<()> {
    let media_id = handle.media_id();
    match handle.outcome().await {
        Ok(_) => {
            if let Some(tracked) = sync.entry(media_id) {
                let entry = tracked.entry;
                println!(
                    "{media_id}: {}, {} episodes watched",
                    entry.status.as_str(),
                    entry.watched_episodes
                );
            }
            Ok(())
        }
        Err(e) => {
            if sync.entry(media_id).is_some_and(|t| t.needs_resync) {
                eprintln!("Saved locally; run `kizuna resync` to push it later.");
            }
            Err(e.into())
        }
    }
}

fn print_media(media: &[MediaEntry]) {
    if media.is_empty() {
        println!("No results");
        return;
    }
    for item in media {
        let episodes = item
            .episode_count
            .map(|n| n.to_string())
            .unwrap_or_else(|| "?".into());
        println!("{:>8}  {} ({episodes} eps)", item.id, item.title);
    }
}
