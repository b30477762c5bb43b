//! # opslog
//!
//! A local-first event store. Every record lands in an append-only JSON
//! Lines log first; a SQLite/FTS5 index is derived from that log and can be
//! thrown away and rebuilt at any time.
//!
//! A single daemon owns the workspace lock and serializes writes. The CLI
//! talks to it over loopback HTTP, or runs the same pipeline in-process
//! under the same lock when no daemon is running.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐    ┌───────────┐    ┌──────────────┐
//! │  CLI     │───▶│  Daemon   │───▶│ canonical    │  events.jsonl (truth)
//! │  (ops)   │    │  (axum)   │    │ log          │
//! └────┬─────┘    └─────┬─────┘    └──────┬───────┘
//!      │ fallback       │                 │ index / rebuild
//!      ▼                ▼                 ▼
//! ┌──────────────────────────┐      ┌──────────────┐
//! │ Workspace (lock held)    │─────▶│ SQLite FTS5  │  derived
//! └──────────────────────────┘      └──────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! ops init                           # write ops.toml, create workspace
//! ops serve &                        # start the daemon
//! ops ingest events.jsonl
//! ops search "deploy" --type chat.message
//! ops job add digest --kind daily_digest --job-config '{"day":"2026-01-21"}'
//! ops job run digest
//! ops pack incident-42                 # bundle every event tagged incident-42
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Record and result types |
//! | [`dedupe`] | Canonical JSON, hashes, dedupe keys |
//! | [`canonical`] | Append-only JSONL log |
//! | [`lock`] | Workspace lock file |
//! | [`workspace`] | Lock + log + index + state, opened together |
//! | [`ingest`] | Normalize, dedupe, append, index |
//! | [`index`] | Derived SQLite index and rebuild |
//! | [`search`] | FTS5 search with filters |
//! | [`get`] | Fetch one event |
//! | [`artifact`] | Atomic artifact files |
//! | [`jobs`] | Job registry, store, and built-in jobs |
//! | [`server`] | Daemon HTTP API |
//! | [`client`] | Daemon HTTP client and route selection |
//! | [`fallback`] | In-process operations for the CLI |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`error`] | Error type and wire codes |

pub mod artifact;
pub mod canonical;
pub mod client;
pub mod config;
pub mod db;
pub mod dedupe;
pub mod error;
pub mod fallback;
pub mod get;
pub mod index;
pub mod ingest;
pub mod jobs;
pub mod lock;
pub mod migrate;
pub mod models;
pub mod search;
pub mod server;
pub mod workspace;
