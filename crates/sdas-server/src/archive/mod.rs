//! Archive lifecycle domain
//!
//! Catalog naming and SQL rewriting, validation planning, completion counting,
//! the status state machine, the record store and external gateways.

pub mod coordinator;
pub mod counter;
pub mod error;
pub mod gateway;
pub mod naming;
pub mod planner;
pub mod rewrite;
pub mod store;
pub mod types;

pub use coordinator::{
    ArchiveCoordinator, Gateways, JobEventOutcome, JobStateEvent, QueryEventOutcome,
    QueryStateEvent,
};
pub use counter::{CompletionCounter, CompletionOutcome, ValidationCompletion};
pub use error::{ArchiveError, ArchiveResult, ProvisionStep};
pub use naming::{CatalogNames, JobCorrelation};
pub use planner::{ValidationPlanner, ValidationTask};
pub use store::{MemoryRecordStore, PgRecordStore, RecordStore, StatusUpdate, TableExtraction};
pub use types::{Archive, ArchiveStatus, ArchiveTable, DatabaseEngine};
