//! # catalog-sync
//!
//! Resolve loosely specified track records against an external catalog and
//! reconcile them into a managed collection, resiliently.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌──────────────┐   ┌──────────────┐
//! │ Candidates │──▶│ MatchScorer  │──▶│  Reconciler  │──▶ collection writes
//! │ CSV / JSON │   │ query+score  │   │ snapshot/diff│──▶ report + audit CSV
//! └────────────┘   └──────┬───────┘   └──────┬───────┘
//!                         │ BatchScheduler    │
//!                         ▼                   ▼
//!                  ┌──────────────────────────────┐
//!                  │ call_with_retry ─▶ TtlCache  │
//!                  │      ─▶ Catalog (HTTP)       │
//!                  └──────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! export CATALOG_TOKEN=...
//! csync sync ./tracks.csv --collection 37i9dQZF1DX --audit ./audit.csv
//! csync match --artist "Bladee" --title "Be Nice 2 Me"
//! csync cache clear-expired
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`error`] | Remote failure taxonomy |
//! | [`retry`] | Backoff policy and `call_with_retry` |
//! | [`cache`] | File-backed TTL cache for reads |
//! | [`scheduler`] | Bounded-concurrency batch executor |
//! | [`similarity`] | Text similarity and shorthand normalization |
//! | [`matcher`] | Candidate resolution |
//! | [`memo`] | Per-run match memo |
//! | [`catalog`] | Catalog service trait |
//! | [`http_catalog`] | HTTP catalog client |
//! | [`reconcile`] | Snapshot, diff, write, report |
//! | [`candidates`] | Candidate file loading |
//! | [`progress`] | Progress reporting on stderr |
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |

pub mod cache;
pub mod candidates;
pub mod catalog;
pub mod config;
pub mod error;
pub mod http_catalog;
pub mod matcher;
pub mod memo;
pub mod models;
pub mod progress;
pub mod reconcile;
pub mod retry;
pub mod scheduler;
pub mod similarity;
pub mod sync_cmd;
