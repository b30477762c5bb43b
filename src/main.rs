//! # ops CLI
//!
//! Thin client over the event store. Every command prints JSON on stdout;
//! logs go to stderr (`RUST_LOG` controls the level).
//!
//! Commands that touch the workspace go to the daemon when it answers on the
//! configured endpoint and fall back to an in-process, locked path when it
//! does not (or with `--offline`).
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `ops init` | Write a default config and create the workspace |
//! | `ops serve` | Run the single-writer daemon |
//! | `ops health` | Ask the daemon for its health |
//! | `ops ingest <file>` | Ingest raw records (JSON array or JSON Lines) |
//! | `ops search <q>` | Full-text search with filters |
//! | `ops show <id>` | Print one event record |
//! | `ops index rebuild` | Rebuild the index from the canonical log |
//! | `ops job add/list/show/delete/run/runs` | Manage and run jobs |
//! | `ops artifacts` | List produced artifacts |
//! | `ops pack <tag>` | Bundle every event with a tag into an artifact pack |

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

use opslog::client::{self, DaemonClient, Route};
use opslog::config::{self, Config};
use opslog::fallback;
use opslog::jobs::{ArtifactPackConfig, JobRegistry, NewJob};
use opslog::search::SearchQuery;
use opslog::server;
use opslog::workspace::Workspace;

#[derive(Parser)]
#[command(
    name = "ops",
    about = "Local append-only event store with a rebuildable full-text index",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./ops.toml")]
    config: PathBuf,

    /// Skip the daemon and run in-process under the workspace lock.
    #[arg(long, global = true)]
    offline: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default config (if missing) and create the workspace layout.
    Init,

    /// Run the daemon. Holds the workspace lock until stopped.
    Serve,

    /// Query daemon health.
    Health,

    /// Ingest raw records from a file (`-` for stdin).
    ///
    /// Accepts a JSON array of records or one record per line.
    Ingest {
        file: PathBuf,

        /// Extra tag added to every record. Repeatable.
        #[arg(long = "tag")]
        tags: Vec<String>,
    },

    /// Search events.
    Search {
        /// FTS5 query. Omit to list by filters only.
        query: Option<String>,

        #[arg(long = "type")]
        types: Vec<String>,

        /// Leave out events of this type. Repeatable.
        #[arg(long = "not-type")]
        not_types: Vec<String>,

        #[arg(long = "tag")]
        tags: Vec<String>,

        #[arg(long)]
        source: Option<String>,

        /// Inclusive RFC 3339 lower bound.
        #[arg(long)]
        after: Option<String>,

        /// Inclusive RFC 3339 upper bound.
        #[arg(long)]
        before: Option<String>,

        #[arg(long)]
        limit: Option<i64>,
    },

    /// Print one event by id.
    Show { id: i64 },

    /// Index maintenance.
    Index {
        #[command(subcommand)]
        action: IndexAction,
    },

    /// Job management.
    Job {
        #[command(subcommand)]
        action: JobAction,
    },

    /// List artifacts, newest first.
    Artifacts {
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },

    /// Write an artifact pack for one tag: pack.json, README.md and copies
    /// of the files tagged artifact events point at.
    Pack {
        tag: String,

        /// Directory under `<workspace>/artifacts`.
        #[arg(long, default_value = "packs")]
        out_dir: String,

        #[arg(long, default_value_t = 500)]
        limit: i64,
    },
}

#[derive(Subcommand)]
enum IndexAction {
    /// Rebuild the index from the canonical log.
    Rebuild {
        /// Catch up from the stored position instead of starting over.
        #[arg(long)]
        no_wipe: bool,
    },
}

#[derive(Subcommand)]
enum JobAction {
    /// Create or replace a job.
    Add {
        name: String,

        /// Job kind, e.g. `index_rebuild` or `daily_digest`.
        #[arg(long)]
        kind: String,

        /// JSON config for the kind. Named apart from the global `--config`.
        #[arg(long = "job-config", value_name = "JSON")]
        job_config: Option<String>,

        #[arg(long)]
        disabled: bool,
    },
    /// List jobs.
    List,
    /// Print one job.
    Show { name: String },
    /// Delete a job. Its run history is kept.
    Delete { name: String },
    /// Run a job now.
    Run { name: String },
    /// Show recent runs of a job.
    Runs {
        name: String,

        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Reads a JSON array or JSON Lines file of raw records.
fn read_records(path: &Path) -> Result<Vec<Value>> {
    let text = if path == Path::new("-") {
        std::io::read_to_string(std::io::stdin()).context("Failed to read stdin")?
    } else {
        std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?
    };

    if text.trim_start().starts_with('[') {
        return serde_json::from_str(&text).context("Failed to parse JSON array");
    }
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(n, line)| {
            serde_json::from_str(line).with_context(|| format!("line {}: invalid JSON", n + 1))
        })
        .collect()
}

fn add_tags(events: &mut [Value], tags: &[String]) {
    if tags.is_empty() {
        return;
    }
    for event in events.iter_mut() {
        let Some(object) = event.as_object_mut() else {
            continue;
        };
        let entry = object
            .entry("tags")
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Some(list) = entry.as_array_mut() {
            list.extend(tags.iter().cloned().map(Value::String));
        }
    }
}

async fn init_workspace(path: &Path, config: &Config, created: bool) -> Result<()> {
    let ws = Workspace::open(config, config.lock_timeout()).await?;
    let root = ws.paths().root.clone();
    ws.close().await;

    print_json(&serde_json::json!({
        "config": path.display().to_string(),
        "config_created": created,
        "workspace": root.display().to_string(),
    }))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let created = matches!(cli.command, Commands::Init) && !cli.config.exists();
    if created {
        config::write_default_config(&cli.config)?;
    }
    let config: Config = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => init_workspace(&cli.config, &config, created).await?,
        Commands::Serve => {
            if cli.offline {
                bail!("--offline has no meaning for serve");
            }
            server::run_daemon(&config).await?;
        }
        Commands::Health => {
            let client = DaemonClient::from_config(&config)?;
            print_json(&client.health().await?)?;
        }
        Commands::Ingest { file, tags } => {
            let mut events = read_records(&file)?;
            add_tags(&mut events, &tags);
            let result = match client::resolve_route(&config, cli.offline).await {
                Route::Daemon(c) => c.ingest(events).await?,
                Route::Fallback => fallback::ingest(&config, events).await?,
            };
            print_json(&result)?;
        }
        Commands::Search {
            query,
            types,
            not_types,
            tags,
            source,
            after,
            before,
            limit,
        } => {
            let query = SearchQuery {
                q: query,
                types,
                exclude_types: not_types,
                tags,
                source_name: source,
                after,
                before,
                limit,
            };
            let hits = match client::resolve_route(&config, cli.offline).await {
                Route::Daemon(c) => c.search(&query).await?,
                Route::Fallback => fallback::search(&config, &query).await?,
            };
            print_json(&hits)?;
        }
        Commands::Show { id } => {
            let record = match client::resolve_route(&config, cli.offline).await {
                Route::Daemon(c) => c.get_event(id).await?,
                Route::Fallback => fallback::show(&config, id).await?,
            };
            print_json(&record)?;
        }
        Commands::Index {
            action: IndexAction::Rebuild { no_wipe },
        } => {
            let report = match client::resolve_route(&config, cli.offline).await {
                Route::Daemon(c) => c.rebuild(!no_wipe).await?,
                Route::Fallback => fallback::rebuild(&config, !no_wipe).await?,
            };
            print_json(&report)?;
        }
        Commands::Job { action } => {
            let route = client::resolve_route(&config, cli.offline).await;
            let registry = JobRegistry::with_builtins();
            match action {
                JobAction::Add {
                    name,
                    kind,
                    job_config,
                    disabled,
                } => {
                    let job_config: Value = match job_config {
                        Some(text) => {
                            serde_json::from_str(&text).context("--job-config is not valid JSON")?
                        }
                        None => Value::Null,
                    };
                    let new = NewJob {
                        name,
                        kind,
                        config: job_config,
                        enabled: !disabled,
                    };
                    let job = match route {
                        Route::Daemon(c) => c.add_job(&new).await?,
                        Route::Fallback => fallback::add_job(&config, &registry, new).await?,
                    };
                    print_json(&job)?;
                }
                JobAction::List => {
                    let jobs = match route {
                        Route::Daemon(c) => c.list_jobs().await?,
                        Route::Fallback => fallback::list_jobs(&config).await?,
                    };
                    print_json(&jobs)?;
                }
                JobAction::Show { name } => {
                    let job = match route {
                        Route::Daemon(c) => c.get_job(&name).await?,
                        Route::Fallback => fallback::get_job(&config, &name).await?,
                    };
                    print_json(&job)?;
                }
                JobAction::Delete { name } => {
                    match route {
                        Route::Daemon(c) => c.delete_job(&name).await?,
                        Route::Fallback => fallback::delete_job(&config, &name).await?,
                    }
                    print_json(&serde_json::json!({ "ok": true, "deleted": name }))?;
                }
                JobAction::Run { name } => {
                    let run = match route {
                        Route::Daemon(c) => c.run_job(&name).await?,
                        Route::Fallback => fallback::run_job(&config, &registry, &name).await?,
                    };
                    print_json(&run)?;
                }
                JobAction::Runs { name, limit } => {
                    let runs = match route {
                        Route::Daemon(c) => c.list_runs(&name, limit).await?,
                        Route::Fallback => fallback::list_runs(&config, &name, limit).await?,
                    };
                    print_json(&runs)?;
                }
            }
        }
        Commands::Artifacts { limit } => {
            let entries = match client::resolve_route(&config, cli.offline).await {
                Route::Daemon(c) => c.artifacts(limit).await?,
                Route::Fallback => fallback::artifacts(&config, limit).await?,
            };
            print_json(&entries)?;
        }
        Commands::Pack {
            tag,
            out_dir,
            limit,
        } => {
            let request = ArtifactPackConfig {
                tag,
                out_dir,
                limit,
            };
            let run = match client::resolve_route(&config, cli.offline).await {
                Route::Daemon(c) => c.pack(&request).await?,
                Route::Fallback => {
                    let registry = JobRegistry::with_builtins();
                    fallback::pack(&config, &registry, &request).await?
                }
            };
            print_json(&run)?;
        }
    }

    Ok(())
}
