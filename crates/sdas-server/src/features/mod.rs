//! Feature modules implementing the SDAS API
//!
//! Each feature is a vertical slice with its own commands, queries, and routes:
//! - `commands/` - Write operations (run, event callbacks, expiration, view removal)
//! - `queries/` - Read operations (archive lookup, interactive query, views, downloads)
//! - `routes.rs` - HTTP route definitions
//!
//! Every command and query implements `mediator::Request` with its own error
//! enum; the routes map those errors onto HTTP responses.
//!
//! # Features
//!
//! - **archives**: archive lifecycle, lifecycle event callbacks and data access

pub mod archives;

use std::sync::Arc;

use axum::Router;

use crate::archive::gateway::{CatalogGateway, QueryEngine};
use crate::archive::{ArchiveCoordinator, RecordStore};
use crate::config::{ArchiveConfig, QueryConfig};
use crate::storage::Storage;

/// Shared state for all feature routes
#[derive(Clone)]
pub struct FeatureState {
    pub coordinator: Arc<ArchiveCoordinator>,
    /// Absent when no object storage is configured; downloads and
    /// expiration rules are then unavailable
    pub storage: Option<Storage>,
    pub archive: ArchiveConfig,
    pub query: QueryConfig,
}

impl FeatureState {
    pub fn new(
        coordinator: Arc<ArchiveCoordinator>,
        storage: Option<Storage>,
        archive: ArchiveConfig,
        query: QueryConfig,
    ) -> Self {
        Self {
            coordinator,
            storage,
            archive,
            query,
        }
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        self.coordinator.store()
    }

    pub fn catalog(&self) -> &Arc<dyn CatalogGateway> {
        &self.coordinator.gateways().catalog
    }

    pub fn engine(&self) -> &Arc<dyn QueryEngine> {
        &self.coordinator.gateways().engine
    }
}

/// Creates the API router with all feature routes mounted
pub fn router(state: FeatureState) -> Router<()> {
    Router::new().merge(archives::archives_routes().with_state(state))
}
