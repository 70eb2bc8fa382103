//! # Synopsis
//!
//! A REST API for long-running text summarization. Identical requests are
//! deduplicated by content, each distinct job runs through a staged
//! pipeline in the background, and clients poll for the result.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌─────────────┐   ┌───────────┐   ┌──────────────┐
//! │   HTTP   │──▶│ Coordinator │──▶│ Job queue │──▶│   Pipeline   │
//! │  (axum)  │   │ dedup+ids   │   │ mpsc+sem  │   │    runner    │
//! └──────────┘   └──────┬──────┘   └───────────┘   └──────┬───────┘
//!                       │                                 │
//!                       ▼                                 ▼
//!                  ┌─────────────────────────────────────────┐
//!                  │     Store (in-memory or SQLite)         │
//!                  └─────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! synopsis init                         # create database
//! synopsis serve                        # start HTTP server
//! synopsis summarize article.txt        # summarize a file locally
//! synopsis detect "Le chat est noir."   # detect a language
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`coordinator`] | Submission validation, dedup and polling |
//! | [`pipeline`] | Stage-by-stage summary runner |
//! | [`queue`] | Bounded job queue and worker limit |
//! | [`text`] | Built-in preprocessing, encoding, summarizing and detection |
//! | [`sqlite_store`] | SQLite job store |
//! | [`server`] | REST API |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod config;
pub mod coordinator;
pub mod db;
pub mod error;
pub mod migrate;
pub mod pipeline;
pub mod queue;
pub mod server;
pub mod sqlite_store;
pub mod text;

pub use synopsis_core::{capability, identity, models, params, store};
