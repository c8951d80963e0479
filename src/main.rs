//! LP Event Queue CLI
//!
//! Drives the capture queue against the SQLite store in the storage
//! directory. The host read model tables live in the same database.
//!
//! ## Usage
//!
//! ```bash
//! # Create the database and install default settings
//! lp-event-queue init
//!
//! # Capture host callbacks from a JSON file (object or array)
//! lp-event-queue capture --file events.json
//!
//! # Run the bulk initializer until done, one slice per tick
//! lp-event-queue backfill --watch
//!
//! # Page through the queue
//! lp-event-queue query --event-type lp_event --page-start 500
//! lp-event-queue query --filter '{"eventHappenedStart": 1700000000}' --export
//!
//! # Provider register
//! lp-event-queue register "Course extras" course_extras course_extras --overrides
//! lp-event-queue providers
//! ```

use clap::{Parser, Subcommand};
use lp_event_queue::backfill::BackfillJob;
use lp_event_queue::services::spawn_logging_listener;
use lp_event_queue::{Config, EventParams, QueueDb, QueueFilter, RoutineTable, Services, SqliteHost};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "lp-event-queue")]
#[command(about = "Learning-progress event capture queue")]
struct Args {
    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Storage directory
    #[arg(long, global = true, env = "LERQ_STORAGE_DIR")]
    storage_dir: Option<PathBuf>,

    /// Public base URL of the host, used in object links
    #[arg(long, global = true, env = "LERQ_HTTP_PATH")]
    http_path: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the schema and install default settings
    Init,

    /// Capture host callbacks read from a JSON file, or stdin when omitted
    Capture {
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Run the bulk initializer
    Backfill {
        /// Keep invoking slices until the run is no longer pending
        #[arg(long)]
        watch: bool,
    },

    /// Print queue records as JSON
    Query {
        /// Full filter as JSON (camelCase keys)
        #[arg(long)]
        filter: Option<String>,

        #[arg(long)]
        event_type: Option<String>,

        #[arg(long)]
        event: Option<String>,

        #[arg(long)]
        progress: Option<String>,

        #[arg(long)]
        page_start: Option<i64>,

        #[arg(long)]
        page_length: Option<i64>,

        #[arg(long)]
        negative_pager: bool,

        /// Rows as stored, blobs left encoded
        #[arg(long, conflicts_with = "export")]
        raw: bool,

        /// Documents with ISO-8601 timestamps
        #[arg(long)]
        export: bool,
    },

    /// Print the collection schema
    Schema,

    /// List registered providers
    Providers {
        #[arg(long, conflicts_with = "namespace")]
        name: Option<String>,

        #[arg(long)]
        namespace: Option<String>,
    },

    /// Register a provider
    Register {
        name: String,
        namespace: String,
        /// Routine table key
        path: String,
        #[arg(long)]
        overrides: bool,
    },

    /// Update a registered provider
    Update {
        name: String,
        namespace: String,
        path: String,
        #[arg(long)]
        overrides: Option<bool>,
    },

    /// Remove a provider
    Unregister { name: String, namespace: String },

    /// Show or change capture settings
    Settings {
        #[command(subcommand)]
        action: Option<SettingsAction>,
    },

    /// Show backfill task info and queue statistics
    Status,

    /// Truncate the queue and reset backfill state
    Reset {
        /// Required, the queue is emptied
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Subcommand, Debug)]
enum SettingsAction {
    Set {
        keyword: String,
        value: String,
        #[arg(long = "type", default_value = "boolean")]
        value_type: String,
    },
    Remove {
        keyword: String,
    },
}

/// One host callback as read by `capture`
#[derive(Debug, Deserialize)]
struct CaptureRequest {
    component: String,
    event: String,
    #[serde(default)]
    params: EventParams,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CaptureInput {
    One(CaptureRequest),
    Many(Vec<CaptureRequest>),
}

#[derive(Serialize)]
struct StatusReport<T: Serialize, S: Serialize> {
    backfill: T,
    queue: S,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Args::parse();

    // Load config
    let mut config = if let Some(config_path) = &args.config {
        Config::load(config_path)?
    } else {
        Config::default()
    };

    // Apply CLI overrides
    if let Some(dir) = args.storage_dir {
        config.storage_dir = dir;
    }
    if let Some(http_path) = args.http_path {
        config.http_path = http_path;
    }

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(config.log_filter.parse()?))
        .with_writer(std::io::stderr)
        .init();

    // Ensure storage directory exists
    tokio::fs::create_dir_all(&config.storage_dir).await?;

    // Save default config if it doesn't exist
    let config_path = config.config_path();
    if !config_path.exists() {
        config.save(&config_path)?;
        info!(path = %config_path.display(), "Created default config");
    }

    let db = Arc::new(QueueDb::open(&config.storage_dir)?);
    let host = Arc::new(SqliteHost::new(db.clone()));
    let services = Arc::new(Services::new(db, host, RoutineTable::new(), config.http_path.clone()));
    let listener = spawn_logging_listener(services.events.clone());

    match args.command {
        Command::Init => {
            let installed = services.settings.install_defaults()?;
            info!(installed, storage_dir = %config.storage_dir.display(), "Queue initialized");
        }

        Command::Capture { file } => {
            let content = match file {
                Some(path) => tokio::fs::read_to_string(path).await?,
                None => tokio::task::spawn_blocking(|| std::io::read_to_string(std::io::stdin())).await??,
            };
            let requests = match serde_json::from_str::<CaptureInput>(&content)? {
                CaptureInput::One(request) => vec![request],
                CaptureInput::Many(requests) => requests,
            };

            let capture = services.capture.clone();
            let written = tokio::task::spawn_blocking(move || {
                requests
                    .iter()
                    .filter(|r| capture.handle_event(&r.component, &r.event, &r.params))
                    .count()
            })
            .await?;
            info!(written, "Capture done");
        }

        Command::Backfill { watch } => {
            let job = Arc::new(BackfillJob::new(&services, config.backfill.clone()));
            let tick = Duration::from_secs(config.backfill.tick_interval_secs.max(1));

            loop {
                let slice = job.clone();
                let outcome = tokio::task::spawn_blocking(move || slice.run()).await?;
                info!(outcome = %outcome, "Backfill invocation returned");

                if !(watch && outcome.is_pending()) {
                    break;
                }
                tokio::select! {
                    _ = tokio::time::sleep(tick) => {}
                    _ = tokio::signal::ctrl_c() => {
                        warn!("Interrupted, the next invocation resumes from the last checkpoint");
                        break;
                    }
                }
            }

            println!("{}", serde_json::to_string_pretty(&job.status()?)?);
        }

        Command::Query {
            filter,
            event_type,
            event,
            progress,
            page_start,
            page_length,
            negative_pager,
            raw,
            export,
        } => {
            let mut filter: QueueFilter = match filter {
                Some(json) => serde_json::from_str(&json)?,
                None => QueueFilter::default(),
            };
            if let Some(event_type) = event_type {
                filter = filter.event_type(event_type);
            }
            if let Some(event) = event {
                filter = filter.event(event);
            }
            if let Some(progress) = progress {
                filter = filter.progress(progress);
            }
            if let Some(start) = page_start {
                filter = filter.page_start(start);
            }
            if let Some(length) = page_length {
                filter = filter.page_length(length);
            }
            if negative_pager {
                filter = filter.negative_pager(true);
            }

            let output = if raw {
                serde_json::to_string_pretty(&services.query.collect_raw(&filter)?)?
            } else if export {
                serde_json::to_string_pretty(&services.query.export_documents(&filter)?)?
            } else {
                serde_json::to_string_pretty(&services.query.collect(&filter)?)?
            };
            println!("{}", output);
        }

        Command::Schema => {
            println!("{}", serde_json::to_string_pretty(&services.query.collection_schema())?);
        }

        Command::Providers { name, namespace } => {
            let registry = &services.registry;
            let providers = match (name, namespace) {
                (Some(name), _) => registry.load_by_name(&name)?,
                (None, Some(namespace)) => registry.load_by_namespace(&namespace)?,
                (None, None) => registry.load()?,
            };
            println!("{}", serde_json::to_string_pretty(&providers)?);
        }

        Command::Register { name, namespace, path, overrides } => {
            if !services.registry.register(&name, &namespace, &path, overrides) {
                error!(name = %name, "Provider not registered");
            }
        }

        Command::Update { name, namespace, path, overrides } => {
            if !services.registry.update(&name, &namespace, &path, overrides) {
                error!(name = %name, "Provider not updated");
            }
        }

        Command::Unregister { name, namespace } => {
            if !services.registry.unregister(&name, &namespace) {
                warn!(name = %name, namespace = %namespace, "No provider removed");
            }
        }

        Command::Settings { action } => match action {
            None => {
                println!("{}", serde_json::to_string_pretty(&services.settings.load()?.rows())?);
            }
            Some(SettingsAction::Set { keyword, value, value_type }) => {
                services.settings.set(&keyword, &value, &value_type)?;
                info!(keyword = %keyword, value = %value, "Setting stored");
            }
            Some(SettingsAction::Remove { keyword }) => {
                if !services.settings.remove(&keyword)? {
                    warn!(keyword = %keyword, "No such setting");
                }
            }
        },

        Command::Status => {
            let job = BackfillJob::new(&services, config.backfill.clone());
            let report = StatusReport {
                backfill: job.status()?,
                queue: services.db.stats()?,
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
        }

        Command::Reset { yes } => {
            if !yes {
                error!("Refusing to reset without --yes");
                return Err("reset requires --yes".into());
            }
            let job = BackfillJob::new(&services, config.backfill.clone());
            let removed = job.reset()?;
            info!(removed, "Reset complete");
        }
    }

    // Closing the bus lets the listener drain what the command emitted
    drop(services);
    if timeout(Duration::from_secs(2), listener).await.is_err() {
        warn!("Event listener did not drain in time");
    }

    Ok(())
}
