//! Validation completion counting
//!
//! Each finished validation query claims its execution id and bumps
//! `validation_completed` in one atomic store operation that also returns the
//! post-increment counters. Only the caller whose value equals the target (as
//! read in that same operation) may move the archive to `Archived`, so the
//! terminal transition happens at most once no matter how many completions
//! race.
//!
//! A redelivered completion is never counted twice. If it finds the target
//! reached while the archive is still `Validating`, the earlier attempt lost
//! its terminal transition and the redelivery performs it.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::error::ArchiveResult;
use super::store::{RecordStore, StatusUpdate};
use super::types::{ArchiveStatus, ValidationKind, ValidationResult};

/// Attempts at the `Validating -> Archived` update before giving up
const TRANSITION_ATTEMPTS: u32 = 4;

/// Delay before the second attempt; doubled after each failure
const INITIAL_BACKOFF_MS: u64 = 50;

/// A validation query that finished successfully
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationCompletion {
    pub archive_id: String,
    pub table_name: String,
    pub kind: ValidationKind,
    pub result: ValidationResult,
}

impl ValidationCompletion {
    pub fn execution_id(&self) -> &str {
        &self.result.query_execution_id
    }
}

/// What a single completion did to the archive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "completion", rename_all = "snake_case")]
pub enum CompletionOutcome {
    /// Target not reached yet
    Pending { completed: i64, target: i64 },
    /// This completion moved the archive to `Archived`
    Archived,
    /// Target reached but the archive was not `Validating`
    NotValidating { current: ArchiveStatus },
    /// More completions than reserved tasks; transition suppressed
    Overflow { completed: i64, target: i64 },
    /// The execution had already been counted
    Duplicate,
}

pub struct CompletionCounter {
    store: Arc<dyn RecordStore>,
}

impl CompletionCounter {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    /// Count one finished validation and store its result
    ///
    /// An error means nothing was counted, or the count landed but the
    /// terminal transition did not; in both cases delivering the same
    /// completion again finishes the work.
    #[tracing::instrument(
        skip(self, completion),
        fields(
            archive_id = %completion.archive_id,
            table = %completion.table_name,
            kind = %completion.kind,
            execution_id = %completion.execution_id(),
        )
    )]
    pub async fn record_completion(
        &self,
        completion: &ValidationCompletion,
    ) -> ArchiveResult<CompletionOutcome> {
        let counted = self
            .store
            .count_completion(completion.execution_id())
            .await?;

        self.write_result(completion).await;

        let Some(counters) = counted else {
            return self.redelivered(&completion.archive_id).await;
        };
        let completed = counters.validation.validation_completed;
        let target = counters.validation.validation_count;

        if completed < target {
            debug!(completed, target, "Validation progress");
            return Ok(CompletionOutcome::Pending { completed, target });
        }

        if completed > target {
            error!(
                completed,
                target,
                "Validation completions exceed reserved tasks, suppressing terminal transition"
            );
            return Ok(CompletionOutcome::Overflow { completed, target });
        }

        match self.archive(&completion.archive_id).await? {
            StatusUpdate::Applied { .. } => {
                info!(completed, "All validations finished, archive is Archived");
                Ok(CompletionOutcome::Archived)
            },
            StatusUpdate::Rejected { current } => {
                warn!(%current, "Validation target reached while archive is not Validating");
                Ok(CompletionOutcome::NotValidating { current })
            },
        }
    }

    /// Finish an archive whose last completion was counted by an earlier
    /// delivery that failed before its terminal transition
    async fn redelivered(&self, archive_id: &str) -> ArchiveResult<CompletionOutcome> {
        let archive = self.store.get_archive(archive_id).await?;
        let counters = archive.counters.validation;
        let target_reached = counters.validation_completed == counters.validation_count;

        if !target_reached || archive.archive_status != ArchiveStatus::Validating {
            debug!("Completion already counted");
            return Ok(CompletionOutcome::Duplicate);
        }

        warn!(
            completed = counters.validation_completed,
            "Validation target reached but archive still Validating, retrying terminal transition"
        );
        match self.archive(archive_id).await? {
            StatusUpdate::Applied { .. } => {
                info!("All validations finished, archive is Archived");
                Ok(CompletionOutcome::Archived)
            },
            StatusUpdate::Rejected { .. } => Ok(CompletionOutcome::Duplicate),
        }
    }

    /// Conditional `Validating -> Archived`, retried on transient store faults
    async fn archive(&self, archive_id: &str) -> ArchiveResult<StatusUpdate> {
        let mut attempt = 0;

        loop {
            attempt += 1;

            match self
                .store
                .transition_status(archive_id, ArchiveStatus::Archived)
                .await
            {
                Ok(update) => return Ok(update),
                Err(e) if e.is_transient() && attempt < TRANSITION_ATTEMPTS => {
                    let backoff_ms = INITIAL_BACKOFF_MS * 2_u64.pow(attempt - 1);
                    warn!(
                        attempt,
                        backoff_ms,
                        error = %e,
                        "Terminal transition failed, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                },
                Err(e) => {
                    error!(attempt, error = %e, "Terminal transition failed");
                    return Err(e);
                },
            }
        }
    }

    /// Best-effort write of the result into its table entry
    async fn write_result(&self, completion: &ValidationCompletion) {
        let archive = match self.store.get_archive(&completion.archive_id).await {
            Ok(archive) => archive,
            Err(e) => {
                warn!(error = %e, "Could not load archive to store validation result");
                return;
            },
        };

        let Some(index) = archive.table_index(&completion.table_name) else {
            warn!("Validation result refers to a table the archive does not have");
            return;
        };

        match self
            .store
            .set_table_validation(
                &completion.archive_id,
                index,
                completion.kind,
                &completion.result,
            )
            .await
        {
            Ok(true) => {},
            Ok(false) => debug!("Validation result already stored"),
            Err(e) => warn!(error = %e, "Failed to store validation result"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::store::MemoryRecordStore;
    use crate::archive::types::{
        Archive, ArchiveTable, ConnectionDetails, Counter, DatabaseEngine, JobLookup, QueryState,
        ResultRow,
    };

    fn hr_archive() -> Archive {
        Archive::new(
            "hr",
            DatabaseEngine::Mysql,
            ConnectionDetails {
                hostname: "mysql.local".to_string(),
                port: 3306,
                username: "etl".to_string(),
                secret_ref: "hr-secret".to_string(),
                database: "hr".to_string(),
                owner: None,
            },
            vec![ArchiveTable::new("employees", vec![])],
        )
    }

    async fn validating_archive(store: &MemoryRecordStore, target: i64) -> Archive {
        let archive = hr_archive();
        store.put_archive(&archive).await.unwrap();
        store
            .atomic_increment(&archive.id, Counter::ValidationCount, target)
            .await
            .unwrap();
        store
            .transition_status(&archive.id, ArchiveStatus::Archiving)
            .await
            .unwrap();
        store
            .transition_status(&archive.id, ArchiveStatus::Validating)
            .await
            .unwrap();
        archive
    }

    /// Register the execution's lookup and build its completion
    async fn completion(
        store: &MemoryRecordStore,
        archive_id: &str,
        execution_id: &str,
    ) -> ValidationCompletion {
        let lookup = JobLookup {
            execution_id: execution_id.to_string(),
            archive_id: archive_id.to_string(),
            table_name: "employees".to_string(),
            validation_type: ValidationKind::Count,
            query: "SELECT COUNT(*)".to_string(),
        };
        store.put_job_lookup(&lookup).await.unwrap();

        ValidationCompletion {
            archive_id: archive_id.to_string(),
            table_name: "employees".to_string(),
            kind: ValidationKind::Count,
            result: ValidationResult {
                query_execution_id: execution_id.to_string(),
                query: "SELECT COUNT(*)".to_string(),
                state: QueryState::Succeeded,
                results: vec![ResultRow::new(["_col0"]), ResultRow::new(["42"])],
            },
        }
    }

    #[tokio::test]
    async fn test_last_completion_archives() {
        let store = Arc::new(MemoryRecordStore::new());
        let archive = validating_archive(&store, 2).await;
        let counter = CompletionCounter::new(store.clone());

        let first = completion(&store, &archive.id, "q-1").await;
        assert_eq!(
            counter.record_completion(&first).await.unwrap(),
            CompletionOutcome::Pending { completed: 1, target: 2 }
        );

        let second = completion(&store, &archive.id, "q-2").await;
        assert_eq!(
            counter.record_completion(&second).await.unwrap(),
            CompletionOutcome::Archived
        );

        let stored = store.get_archive(&archive.id).await.unwrap();
        assert_eq!(stored.archive_status, ArchiveStatus::Archived);
        assert_eq!(
            stored.table_details[0].count_validation.as_ref(),
            Some(&first.result)
        );
    }

    #[tokio::test]
    async fn test_redelivery_is_not_counted_twice() {
        let store = Arc::new(MemoryRecordStore::new());
        let archive = validating_archive(&store, 1).await;
        let counter = CompletionCounter::new(store.clone());
        let only = completion(&store, &archive.id, "q-1").await;

        assert_eq!(
            counter.record_completion(&only).await.unwrap(),
            CompletionOutcome::Archived
        );
        assert_eq!(
            counter.record_completion(&only).await.unwrap(),
            CompletionOutcome::Duplicate
        );

        let stored = store.get_archive(&archive.id).await.unwrap();
        assert_eq!(stored.counters.validation.validation_completed, 1);
    }

    #[tokio::test]
    async fn test_overflow_is_suppressed() {
        let store = Arc::new(MemoryRecordStore::new());
        let archive = validating_archive(&store, 1).await;
        let counter = CompletionCounter::new(store.clone());

        let first = completion(&store, &archive.id, "q-1").await;
        let stray = completion(&store, &archive.id, "q-2").await;
        assert_eq!(
            counter.record_completion(&first).await.unwrap(),
            CompletionOutcome::Archived
        );
        assert_eq!(
            counter.record_completion(&stray).await.unwrap(),
            CompletionOutcome::Overflow { completed: 2, target: 1 }
        );
    }

    #[tokio::test]
    async fn test_concurrent_completions_archive_once() {
        let store = Arc::new(MemoryRecordStore::new());
        let archive = validating_archive(&store, 12).await;
        let counter = Arc::new(CompletionCounter::new(store.clone()));

        let mut handles = Vec::new();
        for i in 0..12 {
            let counter = counter.clone();
            let done = completion(&store, &archive.id, &format!("q-{i}")).await;
            handles.push(tokio::spawn(async move {
                counter.record_completion(&done).await.unwrap()
            }));
        }

        let mut archived = 0;
        for handle in handles {
            if handle.await.unwrap() == CompletionOutcome::Archived {
                archived += 1;
            }
        }
        assert_eq!(archived, 1);
    }

    #[tokio::test]
    async fn test_target_reached_before_validating() {
        let store = Arc::new(MemoryRecordStore::new());
        let archive = hr_archive();
        store.put_archive(&archive).await.unwrap();
        store
            .atomic_increment(&archive.id, Counter::ValidationCount, 1)
            .await
            .unwrap();

        let counter = CompletionCounter::new(store.clone());
        let early = completion(&store, &archive.id, "q-1").await;
        assert_eq!(
            counter.record_completion(&early).await.unwrap(),
            CompletionOutcome::NotValidating { current: ArchiveStatus::Queued }
        );
    }

    #[tokio::test]
    async fn test_unknown_execution_is_rejected() {
        let store = Arc::new(MemoryRecordStore::new());
        let archive = validating_archive(&store, 1).await;
        let counter = CompletionCounter::new(store.clone());

        let mut stray = completion(&store, &archive.id, "q-1").await;
        stray.result.query_execution_id = "q-unregistered".to_string();
        assert!(counter.record_completion(&stray).await.is_err());
    }
}
