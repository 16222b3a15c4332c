//! Archives feature module
//!
//! Starts archive workflows, receives job and query lifecycle events, and
//! exposes the archived data for interactive queries, views and downloads.

pub mod commands;
pub mod queries;
pub mod routes;


pub use routes::archives_routes;
