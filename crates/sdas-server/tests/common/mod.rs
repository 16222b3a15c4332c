//! Shared harness for archive workflow integration tests
//!
//! Wires an [`ArchiveCoordinator`] to the in-memory record store and gateway.
//! The coordinator reaches the store through [`FaultyStore`], which can fail
//! chosen operations a set number of times before passing them through.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use sdas_server::archive::gateway::memory::MemoryGateway;
use sdas_server::archive::gateway::SecretStore;
use sdas_server::archive::types::{
    Column, ConnectionDetails, Counter, Counters, EtlConfiguration, ExpirationSettings, JobLookup,
    JobRecord, JobRunState, JobStatus, ValidationKind, ValidationResult,
};
use sdas_server::archive::{
    Archive, ArchiveCoordinator, ArchiveError, ArchiveResult, ArchiveStatus, ArchiveTable,
    DatabaseEngine, Gateways, JobStateEvent, MemoryRecordStore, RecordStore, StatusUpdate,
    TableExtraction,
};
use sdas_server::config::{ArchiveConfig, QueryConfig};

/// Record store that fails selected operations before delegating
///
/// Operations are keyed by method name; status transitions by
/// `transition_status:<target>`.
pub struct FaultyStore {
    inner: Arc<MemoryRecordStore>,
    faults: Mutex<HashMap<String, usize>>,
}

impl FaultyStore {
    pub fn new(inner: Arc<MemoryRecordStore>) -> Self {
        Self {
            inner,
            faults: Mutex::new(HashMap::new()),
        }
    }

    /// Fail the next `times` calls of `operation`
    pub fn fail(&self, operation: &str, times: usize) {
        self.faults
            .lock()
            .unwrap()
            .insert(operation.to_string(), times);
    }

    fn check(&self, operation: &str) -> ArchiveResult<()> {
        let mut faults = self.faults.lock().unwrap();
        match faults.get_mut(operation) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(ArchiveError::Store(format!("{operation}: connection reset")))
            },
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl RecordStore for FaultyStore {
    async fn get_archive(&self, id: &str) -> ArchiveResult<Archive> {
        self.check("get_archive")?;
        self.inner.get_archive(id).await
    }

    async fn put_archive(&self, archive: &Archive) -> ArchiveResult<()> {
        self.check("put_archive")?;
        self.inner.put_archive(archive).await
    }

    async fn transition_status(&self, id: &str, to: ArchiveStatus) -> ArchiveResult<StatusUpdate> {
        self.check(&format!("transition_status:{to}"))?;
        self.inner.transition_status(id, to).await
    }

    async fn set_job_status(&self, id: &str, status: JobStatus) -> ArchiveResult<()> {
        self.check("set_job_status")?;
        self.inner.set_job_status(id, status).await
    }

    async fn record_job(&self, id: &str, record: &JobRecord) -> ArchiveResult<bool> {
        self.check("record_job")?;
        self.inner.record_job(id, record).await
    }

    async fn atomic_increment(
        &self,
        id: &str,
        counter: Counter,
        delta: i64,
    ) -> ArchiveResult<Counters> {
        self.check("atomic_increment")?;
        self.inner.atomic_increment(id, counter, delta).await
    }

    async fn mark_table_extracted(
        &self,
        id: &str,
        table_index: usize,
        validation_tasks: i64,
    ) -> ArchiveResult<Option<TableExtraction>> {
        self.check("mark_table_extracted")?;
        self.inner
            .mark_table_extracted(id, table_index, validation_tasks)
            .await
    }

    async fn count_completion(&self, execution_id: &str) -> ArchiveResult<Option<Counters>> {
        self.check("count_completion")?;
        self.inner.count_completion(execution_id).await
    }

    async fn set_table_validation(
        &self,
        id: &str,
        table_index: usize,
        kind: ValidationKind,
        result: &ValidationResult,
    ) -> ArchiveResult<bool> {
        self.check("set_table_validation")?;
        self.inner
            .set_table_validation(id, table_index, kind, result)
            .await
    }

    async fn set_etl_configuration(&self, id: &str, etl: &EtlConfiguration) -> ArchiveResult<()> {
        self.check("set_etl_configuration")?;
        self.inner.set_etl_configuration(id, etl).await
    }

    async fn set_expiration(&self, id: &str, expiration: &ExpirationSettings) -> ArchiveResult<()> {
        self.check("set_expiration")?;
        self.inner.set_expiration(id, expiration).await
    }

    async fn put_job_lookup(&self, lookup: &JobLookup) -> ArchiveResult<bool> {
        self.check("put_job_lookup")?;
        self.inner.put_job_lookup(lookup).await
    }

    async fn get_job_lookup(&self, execution_id: &str) -> ArchiveResult<Option<JobLookup>> {
        self.check("get_job_lookup")?;
        self.inner.get_job_lookup(execution_id).await
    }
}

pub struct TestEnvironment {
    /// Direct view of the records, bypassing injected faults
    pub store: Arc<MemoryRecordStore>,
    pub faults: Arc<FaultyStore>,
    pub gateway: Arc<MemoryGateway>,
    pub coordinator: ArchiveCoordinator,
}

impl TestEnvironment {
    pub fn new() -> Self {
        let store = Arc::new(MemoryRecordStore::new());
        let faults = Arc::new(FaultyStore::new(store.clone()));
        let gateway = Arc::new(MemoryGateway::new());

        let coordinator = ArchiveCoordinator::new(
            faults.clone(),
            Gateways {
                catalog: gateway.clone(),
                jobs: gateway.clone(),
                engine: gateway.clone(),
                secrets: gateway.clone(),
            },
            ArchiveConfig::default(),
            QueryConfig::default(),
        );

        Self {
            store,
            faults,
            gateway,
            coordinator,
        }
    }

    /// Store a `Queued` archive whose tables each get a count, string and
    /// numeric validation
    pub async fn queued_archive(&self, tables: &[&str]) -> Archive {
        let secret_ref = self
            .gateway
            .create_secret("source", "pw")
            .await
            .expect("Failed to create secret");
        let archive = Archive::new(
            "finance",
            DatabaseEngine::Postgresql,
            ConnectionDetails {
                hostname: "pg.local".to_string(),
                port: 5432,
                username: "etl".to_string(),
                secret_ref,
                database: "finance".to_string(),
                owner: None,
            },
            tables
                .iter()
                .map(|t| {
                    ArchiveTable::new(*t, vec![column("name", "string"), column("amount", "int")])
                })
                .collect(),
        );
        self.store
            .put_archive(&archive)
            .await
            .expect("Failed to store archive");
        archive
    }

    /// Terminal or running event for the run that extracts `table`
    pub async fn job_event(
        &self,
        archive: &Archive,
        table: &str,
        state: JobRunState,
    ) -> JobStateEvent {
        let job_name = archive.names().job(table);
        let stored = self
            .store
            .get_archive(&archive.id)
            .await
            .expect("Failed to load archive");
        let job_run_id = stored
            .jobs
            .values()
            .find(|j| j.job_name == job_name)
            .map(|j| j.job_run_id.clone())
            .expect("No run recorded for table");

        JobStateEvent {
            job_name,
            job_run_id,
            state,
            message: String::new(),
            started_on: None,
            completed_on: None,
            correlation: None,
        }
    }
}

pub fn column(key: &str, ty: &str) -> Column {
    Column {
        key: key.to_string(),
        normalized_type: ty.to_string(),
        origin_type: ty.to_string(),
        nullable: true,
    }
}
