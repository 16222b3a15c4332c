//! In-process record store

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use super::{RecordStore, StatusUpdate, TableExtraction};
use crate::archive::error::{ArchiveError, ArchiveResult};
use crate::archive::types::{
    Archive, ArchiveStatus, Counter, Counters, EtlConfiguration, ExpirationSettings, JobLookup,
    JobRecord, JobStatus, ValidationKind, ValidationResult,
};

#[derive(Default)]
struct Tables {
    archives: HashMap<String, Archive>,
    lookups: HashMap<String, JobLookup>,
    /// Executions whose completion has been counted
    counted: HashSet<String>,
}

/// Record store over a mutex-guarded map
///
/// Every operation holds the lock for its whole read-modify-write, which makes
/// each call atomic with respect to the others.
#[derive(Default)]
pub struct MemoryRecordStore {
    inner: Mutex<Tables>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> ArchiveResult<MutexGuard<'_, Tables>> {
        self.inner
            .lock()
            .map_err(|_| ArchiveError::Store("record store lock poisoned".to_string()))
    }

    fn with_archive<T>(
        &self,
        id: &str,
        f: impl FnOnce(&mut Archive) -> ArchiveResult<T>,
    ) -> ArchiveResult<T> {
        let mut tables = self.lock()?;
        let archive = tables
            .archives
            .get_mut(id)
            .ok_or_else(|| ArchiveError::NotFound(id.to_string()))?;
        f(archive)
    }
}

fn missing_table(id: &str, table_index: usize) -> ArchiveError {
    ArchiveError::Store(format!("archive {id} has no table at index {table_index}"))
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn get_archive(&self, id: &str) -> ArchiveResult<Archive> {
        self.with_archive(id, |archive| Ok(archive.clone()))
    }

    async fn put_archive(&self, archive: &Archive) -> ArchiveResult<()> {
        self.lock()?
            .archives
            .insert(archive.id.clone(), archive.clone());
        Ok(())
    }

    async fn transition_status(&self, id: &str, to: ArchiveStatus) -> ArchiveResult<StatusUpdate> {
        self.with_archive(id, |archive| {
            let current = archive.archive_status;
            if current.can_transition_to(to) {
                archive.archive_status = to;
                Ok(StatusUpdate::Applied { from: current })
            } else {
                Ok(StatusUpdate::Rejected { current })
            }
        })
    }

    async fn set_job_status(&self, id: &str, status: JobStatus) -> ArchiveResult<()> {
        self.with_archive(id, |archive| {
            if archive.job_status != JobStatus::Failed {
                archive.job_status = status;
            }
            Ok(())
        })
    }

    async fn record_job(&self, id: &str, record: &JobRecord) -> ArchiveResult<bool> {
        self.with_archive(id, |archive| {
            if let Some(existing) = archive.jobs.get(&record.job_run_id) {
                if existing.state.is_terminal() {
                    return Ok(false);
                }
            }
            archive
                .jobs
                .insert(record.job_run_id.clone(), record.clone());
            Ok(true)
        })
    }

    async fn atomic_increment(
        &self,
        id: &str,
        counter: Counter,
        delta: i64,
    ) -> ArchiveResult<Counters> {
        self.with_archive(id, |archive| {
            archive.counters.bump(counter, delta);
            Ok(archive.counters)
        })
    }

    async fn mark_table_extracted(
        &self,
        id: &str,
        table_index: usize,
        validation_tasks: i64,
    ) -> ArchiveResult<Option<TableExtraction>> {
        self.with_archive(id, |archive| {
            let total = i64::try_from(archive.table_details.len()).unwrap_or(i64::MAX);
            let table = archive
                .table_details
                .get_mut(table_index)
                .ok_or_else(|| missing_table(id, table_index))?;
            if table.extracted {
                return Ok(None);
            }
            table.extracted = true;

            archive.counters.bump(Counter::ValidationCount, validation_tasks);
            archive.counters.bump(Counter::EtlSucceeded, 1);
            let all_tables_extracted = archive.counters.etl.succeeded == total;
            if all_tables_extracted {
                if archive.job_status != JobStatus::Failed {
                    archive.job_status = JobStatus::Succeeded;
                }
                if archive.archive_status == ArchiveStatus::Archiving {
                    archive.archive_status = ArchiveStatus::Validating;
                }
            }

            Ok(Some(TableExtraction {
                counters: archive.counters,
                all_tables_extracted,
                archive_status: archive.archive_status,
            }))
        })
    }

    async fn count_completion(&self, execution_id: &str) -> ArchiveResult<Option<Counters>> {
        let mut tables = self.lock()?;
        let archive_id = tables
            .lookups
            .get(execution_id)
            .map(|lookup| lookup.archive_id.clone())
            .ok_or_else(|| ArchiveError::UnknownExecution(execution_id.to_string()))?;
        if tables.counted.contains(execution_id) {
            return Ok(None);
        }

        let archive = tables
            .archives
            .get_mut(&archive_id)
            .ok_or_else(|| ArchiveError::NotFound(archive_id.clone()))?;
        archive.counters.bump(Counter::ValidationCompleted, 1);
        let counters = archive.counters;
        tables.counted.insert(execution_id.to_string());
        Ok(Some(counters))
    }

    async fn set_table_validation(
        &self,
        id: &str,
        table_index: usize,
        kind: ValidationKind,
        result: &ValidationResult,
    ) -> ArchiveResult<bool> {
        self.with_archive(id, |archive| {
            let table = archive
                .table_details
                .get_mut(table_index)
                .ok_or_else(|| missing_table(id, table_index))?;
            Ok(table.set_validation(kind, result.clone()))
        })
    }

    async fn set_etl_configuration(&self, id: &str, etl: &EtlConfiguration) -> ArchiveResult<()> {
        self.with_archive(id, |archive| {
            if archive.archive_status != ArchiveStatus::Queued {
                return Err(ArchiveError::Frozen(id.to_string()));
            }
            archive.configuration.etl = etl.clone();
            Ok(())
        })
    }

    async fn set_expiration(&self, id: &str, expiration: &ExpirationSettings) -> ArchiveResult<()> {
        self.with_archive(id, |archive| {
            archive.expiration = expiration.clone();
            Ok(())
        })
    }

    async fn put_job_lookup(&self, lookup: &JobLookup) -> ArchiveResult<bool> {
        let mut tables = self.lock()?;
        if tables.lookups.contains_key(&lookup.execution_id) {
            return Ok(false);
        }
        tables
            .lookups
            .insert(lookup.execution_id.clone(), lookup.clone());
        Ok(true)
    }

    async fn get_job_lookup(&self, execution_id: &str) -> ArchiveResult<Option<JobLookup>> {
        Ok(self.lock()?.lookups.get(execution_id).cloned())
    }
}
