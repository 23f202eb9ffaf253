use anyhow::{bail, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

use mealdiary::config;
use mealdiary::model::{ConflictResolution, EntryPatch, MealType, NewEntry, SearchOptions};
use mealdiary::remote::{Connectivity, HttpDiaryApi, SharedApi};
use mealdiary::repo::FoodDiaryRepository;
use mealdiary::storage::SqliteStorage;
use mealdiary::store::DiaryStore;
use mealdiary::sync::{SyncEngine, SyncKick};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
    /// Treat the remote as unreachable and work from the cache alone
    #[arg(long)]
    offline: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Log a meal
    Add {
        date: NaiveDate,
        meal_type: MealType,
        name: String,
        #[arg(long)]
        calories: Option<f64>,
        #[arg(long)]
        protein: Option<f64>,
        #[arg(long)]
        carbs: Option<f64>,
        #[arg(long)]
        fat: Option<f64>,
        #[arg(long)]
        notes: Option<String>,
    },
    /// Show one entry
    Get { id: String },
    /// Entries logged on a day
    List { date: NaiveDate },
    /// Every cached entry
    All,
    /// Search the diary
    Search {
        #[arg(long)]
        date: Option<NaiveDate>,
        #[arg(long)]
        meal_type: Option<MealType>,
        #[arg(long, default_value_t = 1)]
        page: u32,
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
    /// Patch fields on an entry (field=value; values may be JSON)
    Update {
        id: String,
        #[arg(required = true)]
        fields: Vec<String>,
    },
    /// Delete an entry
    Delete { id: String },
    /// Show queued offline work
    Tasks {
        /// Only terminally failed tasks
        #[arg(long)]
        failed: bool,
    },
    /// Retry a failed task from a clean slate
    Retry { task_id: Uuid },
    /// Drop a failed task (a failed create takes its local entry with it)
    Discard { task_id: Uuid },
    /// Settle a conflicted task: discard-local or force-overwrite
    Resolve {
        task_id: Uuid,
        resolution: ConflictResolution,
    },
    /// Replay queued work until the queue is idle
    Sync,
    /// Keep the sync engine running, probing the remote for connectivity
    Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(cfg.app.log_filter.as_deref().unwrap_or("info"))
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    let database_url =
        std::env::var("DATABASE_URL").unwrap_or_else(|_| cfg.database_url());
    let storage = Arc::new(SqliteStorage::connect(&database_url).await?);
    let store = Arc::new(DiaryStore::open(storage).await);

    let api: SharedApi = Arc::new(HttpDiaryApi::new(
        cfg.remote_url()?,
        cfg.remote.token.clone(),
        cfg.request_timeout(),
    ));
    let probe_api = api.clone();
    let connectivity = Connectivity::new(!args.offline);
    let kick = SyncKick::new();
    let repo = FoodDiaryRepository::new(
        store.clone(),
        api.clone(),
        connectivity.clone(),
        kick.clone(),
    );
    let engine = SyncEngine::new(store, api, connectivity.clone(), cfg.sync_options(), kick);

    match args.command {
        Command::Add {
            date,
            meal_type,
            name,
            calories,
            protein,
            carbs,
            fat,
            notes,
        } => {
            let entry = repo
                .save(NewEntry {
                    date,
                    meal_type,
                    name,
                    calories,
                    protein_g: protein,
                    carbs_g: carbs,
                    fat_g: fat,
                    notes,
                    extra: Map::new(),
                })
                .await;
            print_json(&entry)?;
        }
        Command::Get { id } => match repo.get(&id).await? {
            Some(entry) => print_json(&entry)?,
            None => bail!("entry {id} not found"),
        },
        Command::List { date } => {
            print_json(&repo.get_by_date(date).await)?;
        }
        Command::All => {
            print_json(&repo.get_all_local().await)?;
        }
        Command::Search {
            date,
            meal_type,
            page,
            limit,
        } => {
            let options = SearchOptions {
                page: Some(page),
                limit: Some(limit),
                date,
                meal_type,
            };
            print_json(&repo.search(&options).await?)?;
        }
        Command::Update { id, fields } => {
            let entry = repo.update(&id, parse_patch(&fields)?).await?;
            print_json(&entry)?;
        }
        Command::Delete { id } => {
            repo.delete(&id).await?;
            println!("deleted {id}");
        }
        Command::Tasks { failed } => {
            let tasks = if failed {
                repo.failed_tasks().await
            } else {
                repo.tasks().await
            };
            print_json(&tasks)?;
        }
        Command::Retry { task_id } => {
            repo.retry_task(task_id).await?;
            println!("task {task_id} queued for retry");
        }
        Command::Discard { task_id } => {
            repo.discard_task(task_id).await?;
            println!("task {task_id} discarded");
        }
        Command::Resolve {
            task_id,
            resolution,
        } => {
            repo.resolve_conflict(task_id, resolution).await?;
            println!("task {task_id} resolved");
        }
        Command::Sync => {
            if args.offline {
                bail!("sync needs the network; drop --offline");
            }
            if let Err(err) = repo.ping_remote().await {
                bail!("remote unreachable: {err}");
            }
            let mut completed = 0;
            loop {
                let summary = engine.drain().await;
                completed += summary.completed;
                let stats = repo.queue_stats().await;
                if stats.is_idle() {
                    println!("synced {completed} tasks");
                    if stats.failed > 0 {
                        bail!(
                            "{} tasks failed; inspect them with `tasks --failed`",
                            stats.failed
                        );
                    }
                    break;
                }
                // Remaining work is backing off; wait for it to come due.
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
        Command::Watch => {
            if !args.offline {
                let connectivity = connectivity.clone();
                let interval = Duration::from_secs(cfg.sync.poll_interval_secs);
                tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(interval);
                    loop {
                        ticker.tick().await;
                        let online = probe_api.ping().await.is_ok();
                        connectivity.set_online(online);
                    }
                });
            }
            info!("starting sync watch");
            engine.run().await;
        }
    }

    Ok(())
}

fn parse_patch(fields: &[String]) -> Result<EntryPatch> {
    let mut patch = EntryPatch::new();
    for field in fields {
        let Some((key, raw)) = field.split_once('=') else {
            bail!("expected field=value, got '{field}'");
        };
        // Try JSON first so numbers, booleans and null come through typed;
        // anything else is a plain string.
        let value = serde_json::from_str::<Value>(raw)
            .unwrap_or_else(|_| Value::String(raw.to_string()));
        patch = patch.set(key, value);
    }
    Ok(patch)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
