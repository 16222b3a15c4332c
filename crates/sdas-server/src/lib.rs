//! SDAS Server Library
//!
//! Archive lifecycle orchestrator for relational databases archived into a
//! data lake.
//!
//! # Overview
//!
//! - **Archive workflow** ([`archive`]): provisions the catalog connection,
//!   database, tables and one ETL job per table, fans out validation queries
//!   as tables finish, and counts validation completions until the archive
//!   is `Archived`
//! - **Record store**: PostgreSQL via SQLx, or in memory
//! - **Gateways**: catalog, job runner, query engine and secret store behind
//!   async traits, reached over HTTP in production
//! - **HTTP API** ([`features`]): run archives, lifecycle event callbacks,
//!   interactive queries, views, downloads and expiration
//!
//! # Architecture
//!
//! Features are vertical slices split into commands (writes) and queries
//! (reads). All archive state changes go through [`archive::RecordStore`]
//! conditional updates so concurrent callbacks cannot regress a status.
//!
//! # Example
//!
//! ```no_run
//! use sdas_server::config::Config;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = Config::load()?;
//!     println!("binding {}:{}", config.server.host, config.server.port);
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod archive;
pub mod config;
pub mod error;
pub mod features;
pub mod middleware;
pub mod storage;

// Re-export commonly used types
pub use error::AppError;
