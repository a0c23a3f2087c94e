use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use resilience_core::{
    CopingCatalog, Mood, MoodEntry, MoodEntryPatch, NewMoodEntry, ResilienceConfig, User,
    COMMON_TRIGGERS,
};
use resilience_store::{FileRepository, MirrorHandle, ResilienceStore, RestMirror, RetryConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

const DEFAULT_USER: &str = "local";

#[derive(Parser, Debug)]
#[command(name = "resilience", author, version, about, long_about = None)]
struct Args {
    /// Path to the TOML config file
    #[arg(short, long, env = "RESILIENCE_CONFIG", default_value = "resilience.toml")]
    config: PathBuf,

    /// Directory holding the journal (overrides config)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Active user id; created on first use
    #[arg(short, long, env = "RESILIENCE_USER")]
    user: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Record how you feel right now
    Log {
        mood: Mood,
        /// 1 to 10
        intensity: u8,
        #[arg(short, long = "trigger")]
        triggers: Vec<String>,
        #[arg(short, long, default_value = "")]
        notes: String,
        /// Coping technique ids used
        #[arg(short, long = "coping")]
        coping: Vec<String>,
    },
    /// Amend the notes or coping usage of an entry
    Amend {
        id: Uuid,
        #[arg(short, long)]
        notes: Option<String>,
        #[arg(short, long = "coping")]
        coping: Vec<String>,
        /// Remove all recorded coping techniques
        #[arg(long, conflicts_with = "coping")]
        clear_coping: bool,
    },
    /// Delete an entry
    Delete { id: Uuid },
    /// Show the journal, newest first
    List {
        /// Only the last N days
        #[arg(short, long)]
        days: Option<u32>,
        #[arg(long)]
        json: bool,
    },
    /// Show resilience metrics
    Metrics {
        #[arg(long)]
        json: bool,
    },
    /// Toggle a coping technique in or out of your favorites
    Favorite { id: String },
    /// List coping techniques
    Catalog {
        /// Include premium techniques
        #[arg(long)]
        premium: bool,
    },
    /// List suggested trigger labels
    Triggers,
    /// Pull the remote journal, merge it and push local changes
    Sync,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();
    init_tracing(args.log_json);

    let config = ResilienceConfig::load_or_default(&args.config);
    let data_dir = args
        .data_dir
        .clone()
        .unwrap_or_else(|| default_data_dir(&config));

    let catalog = match &config.storage.catalog_path {
        Some(path) => CopingCatalog::load(path)?,
        None => CopingCatalog::builtin(),
    };

    let repo = FileRepository::open_dir(&data_dir)
        .with_context(|| format!("Failed to open data directory {}", data_dir.display()))?;
    let mut store = ResilienceStore::open(Arc::new(repo), Arc::new(catalog), config.metrics.clone())?
        .with_premium(config.features.enable_premium_features);

    let mut mirror = None;
    if let Some(mirror_cfg) = config.mirror.as_ref().filter(|m| !m.base_url.is_empty()) {
        let rest = RestMirror::new(mirror_cfg).context("Failed to build mirror client")?;
        let (handle, _worker) = MirrorHandle::spawn(Arc::new(rest), RetryConfig::from(mirror_cfg));
        info!("Mirroring to {}", mirror_cfg.base_url);
        store = store.with_mirror(handle.clone());
        mirror = Some(handle);
    }

    ensure_user(&store, args.user.as_deref()).await?;
    run(&store, args.command, config.features.enable_premium_features).await?;

    if let Some(handle) = mirror {
        if tokio::time::timeout(Duration::from_secs(60), handle.idle())
            .await
            .is_err()
        {
            warn!("Remote mirror still busy; pending changes were not uploaded");
        }
    }
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Config value if it was changed, otherwise the platform data directory.
fn default_data_dir(config: &ResilienceConfig) -> PathBuf {
    let configured = &config.storage.data_dir;
    if configured != Path::new("resilience_data") {
        return configured.clone();
    }
    dirs::data_dir()
        .map(|d| d.join("resilience"))
        .unwrap_or_else(|| configured.clone())
}

async fn ensure_user(store: &ResilienceStore, requested: Option<&str>) -> Result<()> {
    let current = store.snapshot().user.clone();
    let wanted = match (requested, &current) {
        (Some(id), _) => id.to_string(),
        (None, Some(user)) => user.id.clone(),
        (None, None) => DEFAULT_USER.to_string(),
    };
    if current.as_ref().map(|u| u.id.as_str()) != Some(wanted.as_str()) {
        info!("Activating user {}", wanted);
        store.set_user(User::new(wanted)).await?;
    }
    Ok(())
}

async fn run(store: &ResilienceStore, command: Command, premium_enabled: bool) -> Result<()> {
    match command {
        Command::Log {
            mood,
            intensity,
            triggers,
            notes,
            coping,
        } => {
            let draft = NewMoodEntry::new(mood, intensity)
                .with_triggers(triggers)
                .with_notes(notes)
                .with_coping(coping);
            let entry = store.add_entry(draft).await?;
            println!("Logged {}", entry.id);
            print_metrics_line(store);
        }
        Command::Amend {
            id,
            notes,
            coping,
            clear_coping,
        } => {
            let patch = MoodEntryPatch {
                notes,
                coping_mechanisms_used: if clear_coping || !coping.is_empty() {
                    Some(coping.into_iter().collect())
                } else {
                    None
                },
            };
            if patch.is_empty() {
                anyhow::bail!("Nothing to amend: pass --notes, --coping or --clear-coping");
            }
            let entry = store.update_entry(id, patch).await?;
            println!("{}", format_entry(&entry));
        }
        Command::Delete { id } => {
            store.delete_entry(id).await?;
            println!("Deleted {}", id);
            print_metrics_line(store);
        }
        Command::List { days, json } => {
            let entries = match days {
                Some(days) => store.recent_entries(days),
                None => store.entries(),
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else if entries.is_empty() {
                println!("No entries yet.");
            } else {
                for entry in &entries {
                    println!("{}", format_entry(entry));
                }
            }
        }
        Command::Metrics { json } => {
            let metrics = store.metrics();
            if json {
                println!("{}", serde_json::to_string_pretty(&metrics)?);
            } else {
                println!("Overall score:  {}", metrics.overall_score);
                println!("Mood stability: {}", metrics.mood_stability);
                println!("Coping usage:   {}%", metrics.coping_usage);
                println!("Streak:         {} day(s)", metrics.streak_days);
                println!("Trend:          {}", metrics.improvement_trend.as_str());
            }
        }
        Command::Favorite { id } => {
            let now_favorite = store.toggle_favorite(&id).await?;
            let name = store
                .catalog()
                .get(&id)
                .map(|m| m.name.clone())
                .unwrap_or_else(|| id.clone());
            if now_favorite {
                println!("Added {} to favorites", name);
            } else {
                println!("Removed {} from favorites", name);
            }
        }
        Command::Catalog { premium } => {
            let favorites = store.snapshot().favorites.clone();
            for m in store.catalog().list(premium || premium_enabled) {
                let star = if favorites.contains(&m.id) { "*" } else { " " };
                let lock = if m.is_premium { " [premium]" } else { "" };
                println!(
                    "{}{:>3}  {:<28} {:<13} {:>2} min  {}{}",
                    star,
                    m.id,
                    m.name,
                    m.kind.as_str(),
                    m.duration,
                    m.difficulty.as_str(),
                    lock
                );
            }
        }
        Command::Triggers => {
            for trigger in COMMON_TRIGGERS {
                println!("{}", trigger);
            }
        }
        Command::Sync => {
            let report = store.pull_from_mirror().await?;
            println!(
                "Synced: pulled {}, pushed {}, {} entries total",
                report.pulled, report.pushed, report.total
            );
        }
    }
    Ok(())
}

fn format_entry(entry: &MoodEntry) -> String {
    let mut line = format!(
        "{}  {}  {} {:<11} {:>2}/10",
        entry.id,
        entry.timestamp.format("%Y-%m-%d %H:%M"),
        entry.mood.emoji(),
        entry.mood.label(),
        entry.intensity.get()
    );
    if !entry.triggers.is_empty() {
        let triggers: Vec<&str> = entry.triggers.iter().map(String::as_str).collect();
        line.push_str(&format!("  [{}]", triggers.join(", ")));
    }
    if !entry.notes.is_empty() {
        line.push_str(&format!("  {}", entry.notes));
    }
    line
}

fn print_metrics_line(store: &ResilienceStore) {
    let m = store.metrics();
    println!(
        "Resilience {} (stability {}, coping {}%, streak {}, trend {})",
        m.overall_score,
        m.mood_stability,
        m.coping_usage,
        m.streak_days,
        m.improvement_trend.as_str()
    );
}
