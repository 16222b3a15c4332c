//! PostgreSQL record store
//!
//! Counters are plain `BIGINT` columns so that an increment and the read of
//! its result are a single `UPDATE ... RETURNING` statement. Nested record
//! fields are JSONB and are written in place with `jsonb_set`.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};

use super::{RecordStore, StatusUpdate, TableExtraction};
use crate::archive::error::{ArchiveError, ArchiveResult};
use crate::archive::types::{
    Archive, ArchiveStatus, ArchiveTable, Configuration, ConnectionDetails, Counter, Counters,
    EtlConfiguration, EtlCounters, ExpirationSettings, JobLookup, JobRecord, JobStatus,
    ValidationCounters, ValidationKind, ValidationResult,
};

#[derive(Debug, FromRow)]
struct ArchiveRow {
    id: String,
    archive_name: String,
    database_engine: String,
    connection: Json<ConnectionDetails>,
    table_details: Json<Vec<ArchiveTable>>,
    archive_status: String,
    job_status: String,
    jobs: Json<BTreeMap<String, JobRecord>>,
    validation_count: i64,
    validation_completed: i64,
    etl_succeeded: i64,
    configuration: Json<Configuration>,
    legal_hold: bool,
    expiration: Json<ExpirationSettings>,
    time_submitted: DateTime<Utc>,
}

impl TryFrom<ArchiveRow> for Archive {
    type Error = ArchiveError;

    fn try_from(row: ArchiveRow) -> Result<Self, Self::Error> {
        Ok(Archive {
            database_engine: row.database_engine.parse()?,
            archive_status: row.archive_status.parse()?,
            job_status: JobStatus::from(row.job_status),
            id: row.id,
            archive_name: row.archive_name,
            connection: row.connection.0,
            table_details: row.table_details.0,
            jobs: row.jobs.0,
            counters: Counters {
                validation: ValidationCounters {
                    validation_count: row.validation_count,
                    validation_completed: row.validation_completed,
                },
                etl: EtlCounters {
                    succeeded: row.etl_succeeded,
                },
            },
            configuration: row.configuration.0,
            legal_hold: row.legal_hold,
            expiration: row.expiration.0,
            time_submitted: row.time_submitted,
        })
    }
}

#[derive(Debug, FromRow)]
struct CounterRow {
    validation_count: i64,
    validation_completed: i64,
    etl_succeeded: i64,
}

#[derive(Debug, FromRow)]
struct ExtractionRow {
    validation_count: i64,
    validation_completed: i64,
    etl_succeeded: i64,
    table_count: i32,
    archive_status: String,
}

impl From<CounterRow> for Counters {
    fn from(row: CounterRow) -> Self {
        Counters {
            validation: ValidationCounters {
                validation_count: row.validation_count,
                validation_completed: row.validation_completed,
            },
            etl: EtlCounters {
                succeeded: row.etl_succeeded,
            },
        }
    }
}

#[derive(Debug, FromRow)]
struct LookupRow {
    execution_id: String,
    archive_id: String,
    table_name: String,
    validation_type: String,
    query: String,
}

impl TryFrom<LookupRow> for JobLookup {
    type Error = ArchiveError;

    fn try_from(row: LookupRow) -> Result<Self, Self::Error> {
        Ok(JobLookup {
            validation_type: row.validation_type.parse()?,
            execution_id: row.execution_id,
            archive_id: row.archive_id,
            table_name: row.table_name,
            query: row.query,
        })
    }
}

fn table_position(table_index: usize) -> ArchiveResult<i64> {
    i64::try_from(table_index)
        .map_err(|_| ArchiveError::Store(format!("table index {table_index} out of range")))
}

fn counter_column(counter: Counter) -> &'static str {
    match counter {
        Counter::ValidationCount => "validation_count",
        Counter::ValidationCompleted => "validation_completed",
        Counter::EtlSucceeded => "etl_succeeded",
    }
}

/// Record store backed by the `archives` and `job_lookups` tables
#[derive(Clone)]
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Distinguish a missing archive from a missing table entry
    async fn check_table(&self, id: &str, table_index: i64) -> ArchiveResult<()> {
        let tables: Option<i32> = sqlx::query_scalar(
            "SELECT jsonb_array_length(table_details) FROM archives WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match tables {
            None => Err(ArchiveError::NotFound(id.to_string())),
            Some(count) if i64::from(count) <= table_index => Err(ArchiveError::Store(format!(
                "archive {id} has no table at index {table_index}"
            ))),
            Some(_) => Ok(()),
        }
    }

    async fn current_status(&self, id: &str) -> ArchiveResult<ArchiveStatus> {
        let status: Option<String> =
            sqlx::query_scalar("SELECT archive_status FROM archives WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        status
            .ok_or_else(|| ArchiveError::NotFound(id.to_string()))?
            .parse()
            .map_err(ArchiveError::from)
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    #[tracing::instrument(skip(self))]
    async fn get_archive(&self, id: &str) -> ArchiveResult<Archive> {
        let row = sqlx::query_as::<_, ArchiveRow>(
            r#"
            SELECT id, archive_name, database_engine, connection, table_details,
                   archive_status, job_status, jobs, validation_count,
                   validation_completed, etl_succeeded, configuration, legal_hold,
                   expiration, time_submitted
            FROM archives
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| ArchiveError::NotFound(id.to_string()))?;

        Archive::try_from(row)
    }

    #[tracing::instrument(skip(self, archive), fields(archive_id = %archive.id))]
    async fn put_archive(&self, archive: &Archive) -> ArchiveResult<()> {
        sqlx::query(
            r#"
            INSERT INTO archives (
                id, archive_name, database_engine, connection, table_details,
                archive_status, job_status, jobs, validation_count,
                validation_completed, etl_succeeded, configuration, legal_hold,
                expiration, time_submitted
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            ON CONFLICT (id) DO UPDATE SET
                archive_name = EXCLUDED.archive_name,
                database_engine = EXCLUDED.database_engine,
                connection = EXCLUDED.connection,
                table_details = EXCLUDED.table_details,
                archive_status = EXCLUDED.archive_status,
                job_status = EXCLUDED.job_status,
                jobs = EXCLUDED.jobs,
                validation_count = EXCLUDED.validation_count,
                validation_completed = EXCLUDED.validation_completed,
                etl_succeeded = EXCLUDED.etl_succeeded,
                configuration = EXCLUDED.configuration,
                legal_hold = EXCLUDED.legal_hold,
                expiration = EXCLUDED.expiration,
                time_submitted = EXCLUDED.time_submitted,
                updated_at = NOW()
            "#,
        )
        .bind(&archive.id)
        .bind(&archive.archive_name)
        .bind(archive.database_engine.as_str())
        .bind(Json(&archive.connection))
        .bind(Json(&archive.table_details))
        .bind(archive.archive_status.as_str())
        .bind(archive.job_status.as_str())
        .bind(Json(&archive.jobs))
        .bind(archive.counters.validation.validation_count)
        .bind(archive.counters.validation.validation_completed)
        .bind(archive.counters.etl.succeeded)
        .bind(Json(&archive.configuration))
        .bind(archive.legal_hold)
        .bind(Json(&archive.expiration))
        .bind(archive.time_submitted)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn transition_status(&self, id: &str, to: ArchiveStatus) -> ArchiveResult<StatusUpdate> {
        let allowed: Vec<String> = to
            .predecessors()
            .iter()
            .map(|s| s.as_str().to_string())
            .collect();

        let previous: Option<String> = sqlx::query_scalar(
            r#"
            WITH prev AS (
                SELECT id, archive_status FROM archives WHERE id = $1 FOR UPDATE
            )
            UPDATE archives a
            SET archive_status = $2, updated_at = NOW()
            FROM prev
            WHERE a.id = prev.id AND prev.archive_status = ANY($3)
            RETURNING prev.archive_status
            "#,
        )
        .bind(id)
        .bind(to.as_str())
        .bind(&allowed)
        .fetch_optional(&self.pool)
        .await?;

        match previous {
            Some(from) => Ok(StatusUpdate::Applied {
                from: from.parse()?,
            }),
            None => Ok(StatusUpdate::Rejected {
                current: self.current_status(id).await?,
            }),
        }
    }

    #[tracing::instrument(skip(self))]
    async fn set_job_status(&self, id: &str, status: JobStatus) -> ArchiveResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE archives
            SET job_status = CASE WHEN job_status = 'Failed' THEN job_status ELSE $2 END,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(ArchiveError::NotFound(id.to_string()));
        }
        Ok(())
    }

    #[tracing::instrument(skip(self, record), fields(job_run_id = %record.job_run_id))]
    async fn record_job(&self, id: &str, record: &JobRecord) -> ArchiveResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE archives
            SET jobs = jsonb_set(jobs, ARRAY[$2::text], $3::jsonb, true),
                updated_at = NOW()
            WHERE id = $1
              AND COALESCE(jobs -> $2::text ->> 'state', '') NOT IN ('SUCCEEDED', 'FAILED')
            "#,
        )
        .bind(id)
        .bind(&record.job_run_id)
        .bind(Json(record))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        self.current_status(id).await?;
        Ok(false)
    }

    #[tracing::instrument(skip(self))]
    async fn atomic_increment(
        &self,
        id: &str,
        counter: Counter,
        delta: i64,
    ) -> ArchiveResult<Counters> {
        let column = counter_column(counter);
        let sql = format!(
            r#"
            UPDATE archives
            SET {column} = {column} + $2, updated_at = NOW()
            WHERE id = $1
            RETURNING validation_count, validation_completed, etl_succeeded
            "#
        );

        let row = sqlx::query_as::<_, CounterRow>(&sql)
            .bind(id)
            .bind(delta)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| ArchiveError::NotFound(id.to_string()))?;

        Ok(row.into())
    }

    #[tracing::instrument(skip(self))]
    async fn mark_table_extracted(
        &self,
        id: &str,
        table_index: usize,
        validation_tasks: i64,
    ) -> ArchiveResult<Option<TableExtraction>> {
        let index = table_position(table_index)?;

        // SET expressions read the pre-update row
        let row = sqlx::query_as::<_, ExtractionRow>(
            r#"
            UPDATE archives
            SET table_details = jsonb_set(
                    table_details, ARRAY[$2::text, 'extracted'], 'true'::jsonb, true
                ),
                validation_count = validation_count + $3,
                etl_succeeded = etl_succeeded + 1,
                job_status = CASE
                    WHEN etl_succeeded + 1 = jsonb_array_length(table_details)
                         AND job_status <> 'Failed'
                    THEN 'Succeeded'
                    ELSE job_status
                END,
                archive_status = CASE
                    WHEN etl_succeeded + 1 = jsonb_array_length(table_details)
                         AND archive_status = 'Archiving'
                    THEN 'Validating'
                    ELSE archive_status
                END,
                updated_at = NOW()
            WHERE id = $1
              AND jsonb_array_length(table_details) > $4
              AND NOT COALESCE((table_details -> $4::int ->> 'extracted')::boolean, false)
            RETURNING validation_count, validation_completed, etl_succeeded,
                      jsonb_array_length(table_details) AS table_count, archive_status
            "#,
        )
        .bind(id)
        .bind(index.to_string())
        .bind(validation_tasks)
        .bind(index)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            self.check_table(id, index).await?;
            return Ok(None);
        };

        Ok(Some(TableExtraction {
            all_tables_extracted: row.etl_succeeded == i64::from(row.table_count),
            archive_status: row.archive_status.parse()?,
            counters: Counters {
                validation: ValidationCounters {
                    validation_count: row.validation_count,
                    validation_completed: row.validation_completed,
                },
                etl: EtlCounters {
                    succeeded: row.etl_succeeded,
                },
            },
        }))
    }

    #[tracing::instrument(skip(self))]
    async fn count_completion(&self, execution_id: &str) -> ArchiveResult<Option<Counters>> {
        let mut tx = self.pool.begin().await?;

        let claimed: Option<String> = sqlx::query_scalar(
            r#"
            UPDATE job_lookups
            SET counted_at = NOW()
            WHERE execution_id = $1 AND counted_at IS NULL
            RETURNING archive_id
            "#,
        )
        .bind(execution_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(archive_id) = claimed else {
            tx.rollback().await?;
            return match self.get_job_lookup(execution_id).await? {
                Some(_) => Ok(None),
                None => Err(ArchiveError::UnknownExecution(execution_id.to_string())),
            };
        };

        let row = sqlx::query_as::<_, CounterRow>(
            r#"
            UPDATE archives
            SET validation_completed = validation_completed + 1, updated_at = NOW()
            WHERE id = $1
            RETURNING validation_count, validation_completed, etl_succeeded
            "#,
        )
        .bind(&archive_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| ArchiveError::NotFound(archive_id.clone()))?;

        tx.commit().await?;
        Ok(Some(row.into()))
    }

    #[tracing::instrument(skip(self, result))]
    async fn set_table_validation(
        &self,
        id: &str,
        table_index: usize,
        kind: ValidationKind,
        result: &ValidationResult,
    ) -> ArchiveResult<bool> {
        let index = table_position(table_index)?;

        let updated = sqlx::query(
            r#"
            UPDATE archives
            SET table_details = jsonb_set(
                    table_details, ARRAY[$2::text, $3::text], $4::jsonb, true
                ),
                updated_at = NOW()
            WHERE id = $1
              AND jsonb_array_length(table_details) > $5
              AND COALESCE(table_details -> $5::int -> $3::text, 'null'::jsonb) = 'null'::jsonb
            "#,
        )
        .bind(id)
        .bind(index.to_string())
        .bind(kind.field_name())
        .bind(Json(result))
        .bind(index)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            self.check_table(id, index).await?;
            return Ok(false);
        }
        Ok(true)
    }

    #[tracing::instrument(skip(self))]
    async fn set_etl_configuration(&self, id: &str, etl: &EtlConfiguration) -> ArchiveResult<()> {
        let updated = sqlx::query(
            r#"
            UPDATE archives
            SET configuration = jsonb_set(configuration, '{etl}', $2::jsonb, true),
                updated_at = NOW()
            WHERE id = $1 AND archive_status = 'Queued'
            "#,
        )
        .bind(id)
        .bind(Json(etl))
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            self.current_status(id).await?;
            return Err(ArchiveError::Frozen(id.to_string()));
        }
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn set_expiration(&self, id: &str, expiration: &ExpirationSettings) -> ArchiveResult<()> {
        let updated = sqlx::query(
            "UPDATE archives SET expiration = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(Json(expiration))
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(ArchiveError::NotFound(id.to_string()));
        }
        Ok(())
    }

    #[tracing::instrument(skip(self, lookup), fields(execution_id = %lookup.execution_id))]
    async fn put_job_lookup(&self, lookup: &JobLookup) -> ArchiveResult<bool> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO job_lookups (execution_id, archive_id, table_name, validation_type, query)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (execution_id) DO NOTHING
            "#,
        )
        .bind(&lookup.execution_id)
        .bind(&lookup.archive_id)
        .bind(&lookup.table_name)
        .bind(lookup.validation_type.field_name())
        .bind(&lookup.query)
        .execute(&self.pool)
        .await?;

        Ok(inserted.rows_affected() == 1)
    }

    #[tracing::instrument(skip(self))]
    async fn get_job_lookup(&self, execution_id: &str) -> ArchiveResult<Option<JobLookup>> {
        let row = sqlx::query_as::<_, LookupRow>(
            r#"
            SELECT execution_id, archive_id, table_name, validation_type, query
            FROM job_lookups
            WHERE execution_id = $1
            "#,
        )
        .bind(execution_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(JobLookup::try_from).transpose()
    }
}

#[cfg(test)]
mod tests {
    //! Runs only when `DATABASE_URL` points at a PostgreSQL instance.

    use std::sync::Arc;

    use sqlx::postgres::PgPoolOptions;

    use super::*;
    use crate::archive::types::{DatabaseEngine, JobRunState};

    async fn store() -> Option<PgRecordStore> {
        let url = std::env::var("DATABASE_URL").ok()?;
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(&url)
            .await
            .ok()?;
        sqlx::migrate!("../../migrations").run(&pool).await.ok()?;
        Some(PgRecordStore::new(pool))
    }

    fn sample_archive() -> Archive {
        Archive::new(
            "erp",
            DatabaseEngine::Mssql,
            ConnectionDetails {
                hostname: "sql.local".to_string(),
                port: 1433,
                username: "etl".to_string(),
                secret_ref: "erp-secret".to_string(),
                database: "erp".to_string(),
                owner: Some("dbo".to_string()),
            },
            vec![ArchiveTable::new("invoices", vec![])],
        )
    }

    #[tokio::test]
    async fn test_round_trip_and_transition() {
        let Some(store) = store().await else {
            eprintln!("DATABASE_URL not set, skipping");
            return;
        };
        let archive = sample_archive();
        store.put_archive(&archive).await.unwrap();

        let loaded = store.get_archive(&archive.id).await.unwrap();
        assert_eq!(loaded.connection, archive.connection);
        assert_eq!(loaded.archive_status, ArchiveStatus::Queued);

        let update = store
            .transition_status(&archive.id, ArchiveStatus::Archived)
            .await
            .unwrap();
        assert_eq!(update, StatusUpdate::Rejected { current: ArchiveStatus::Queued });

        let update = store
            .transition_status(&archive.id, ArchiveStatus::Failed)
            .await
            .unwrap();
        assert_eq!(update, StatusUpdate::Applied { from: ArchiveStatus::Queued });
    }

    #[tokio::test]
    async fn test_concurrent_increments() {
        let Some(store) = store().await else {
            eprintln!("DATABASE_URL not set, skipping");
            return;
        };
        let store = Arc::new(store);
        let archive = sample_archive();
        store.put_archive(&archive).await.unwrap();
        store
            .atomic_increment(&archive.id, Counter::ValidationCount, 20)
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..20 {
            let store = store.clone();
            let id = archive.id.clone();
            handles.push(tokio::spawn(async move {
                store
                    .atomic_increment(&id, Counter::ValidationCompleted, 1)
                    .await
                    .unwrap()
            }));
        }

        let mut at_target = 0;
        for handle in handles {
            let counters = handle.await.unwrap();
            if counters.validation.validation_completed == counters.validation.validation_count {
                at_target += 1;
            }
        }
        assert_eq!(at_target, 1);
    }

    #[tokio::test]
    async fn test_nested_writes() {
        let Some(store) = store().await else {
            eprintln!("DATABASE_URL not set, skipping");
            return;
        };
        let archive = sample_archive();
        store.put_archive(&archive).await.unwrap();

        let record = JobRecord {
            job_name: "erp-invoices".to_string(),
            job_run_id: "jr_1".to_string(),
            state: JobRunState::Succeeded,
            message: String::new(),
            started_on: None,
            completed_on: None,
            recorded_at: Utc::now(),
        };
        assert!(store.record_job(&archive.id, &record).await.unwrap());
        assert!(!store.record_job(&archive.id, &record).await.unwrap());

        let result = ValidationResult {
            query_execution_id: "q-1".to_string(),
            query: "SELECT COUNT(*)".to_string(),
            state: crate::archive::types::QueryState::Succeeded,
            results: vec![],
        };
        assert!(store
            .set_table_validation(&archive.id, 0, ValidationKind::Count, &result)
            .await
            .unwrap());
        let replacement = ValidationResult {
            query_execution_id: "q-2".to_string(),
            ..result.clone()
        };
        assert!(!store
            .set_table_validation(&archive.id, 0, ValidationKind::Count, &replacement)
            .await
            .unwrap());

        let loaded = store.get_archive(&archive.id).await.unwrap();
        assert_eq!(loaded.jobs["jr_1"].state, JobRunState::Succeeded);
        assert_eq!(loaded.table_details[0].count_validation, Some(result));
    }

    #[tokio::test]
    async fn test_extraction_and_completion_claims() {
        let Some(store) = store().await else {
            eprintln!("DATABASE_URL not set, skipping");
            return;
        };
        let archive = sample_archive();
        store.put_archive(&archive).await.unwrap();
        store
            .transition_status(&archive.id, ArchiveStatus::Archiving)
            .await
            .unwrap();

        let extraction = store
            .mark_table_extracted(&archive.id, 0, 1)
            .await
            .unwrap()
            .unwrap();
        assert!(extraction.all_tables_extracted);
        assert_eq!(extraction.archive_status, ArchiveStatus::Validating);
        assert!(store
            .mark_table_extracted(&archive.id, 0, 1)
            .await
            .unwrap()
            .is_none());
        assert!(store.mark_table_extracted(&archive.id, 4, 1).await.is_err());

        let execution_id = format!("q-{}", archive.id);
        store
            .put_job_lookup(&JobLookup {
                execution_id: execution_id.clone(),
                archive_id: archive.id.clone(),
                table_name: "invoices".to_string(),
                validation_type: ValidationKind::Count,
                query: "SELECT COUNT(*)".to_string(),
            })
            .await
            .unwrap();

        let counters = store.count_completion(&execution_id).await.unwrap().unwrap();
        assert_eq!(counters.validation.validation_completed, 1);
        assert_eq!(counters.validation.validation_count, 1);
        assert!(store.count_completion(&execution_id).await.unwrap().is_none());

        let loaded = store.get_archive(&archive.id).await.unwrap();
        assert_eq!(loaded.job_status, JobStatus::Succeeded);
        assert!(loaded.table_details[0].extracted);
    }
}
