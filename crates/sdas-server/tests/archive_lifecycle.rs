//! End-to-end archive workflow tests
//!
//! Drives an archive from `Queued` to a terminal status through the
//! coordinator and the completion counter, all backed by in-memory
//! collaborators. Store faults are injected to check that a redelivered
//! event finishes whatever the failed delivery left undone.

mod common;

use common::TestEnvironment;
use sdas_server::archive::gateway::memory::StartedQuery;
use sdas_server::archive::types::{JobRunState, JobStatus, QueryState};
use sdas_server::archive::{
    ArchiveError, ArchiveResult, ArchiveStatus, CompletionOutcome, JobEventOutcome,
    ProvisionStep, QueryEventOutcome, QueryStateEvent, RecordStore,
};

fn validation_queries(env: &TestEnvironment) -> Vec<StartedQuery> {
    env.gateway.started_queries()
}

async fn try_report_query(
    env: &TestEnvironment,
    execution_id: &str,
    state: QueryState,
) -> ArchiveResult<QueryEventOutcome> {
    env.coordinator
        .handle_query_event(QueryStateEvent {
            execution_id: execution_id.to_string(),
            current_state: state,
        })
        .await
}

async fn report_query(
    env: &TestEnvironment,
    execution_id: &str,
    state: QueryState,
) -> QueryEventOutcome {
    try_report_query(env, execution_id, state)
        .await
        .expect("Query event failed")
}

/// Start a one-table archive and extract it, leaving three validations running
async fn validating_archive(env: &TestEnvironment) -> String {
    let archive = env.queued_archive(&["ledger"]).await;
    env.coordinator.start(&archive.id).await.unwrap();
    let event = env.job_event(&archive, "ledger", JobRunState::Succeeded).await;
    env.coordinator.handle_job_event(event).await.unwrap();
    archive.id
}

#[tokio::test]
async fn test_archive_reaches_archived_exactly_once() {
    let env = TestEnvironment::new();
    let archive = env.queued_archive(&["ledger", "invoices"]).await;

    env.coordinator.start(&archive.id).await.unwrap();

    let event = env.job_event(&archive, "ledger", JobRunState::Succeeded).await;
    let outcome = env.coordinator.handle_job_event(event).await.unwrap();
    assert_eq!(
        outcome,
        JobEventOutcome::ValidationDispatched {
            started: 3,
            failed: 0,
            all_tables_extracted: false,
        }
    );
    let stored = env.store.get_archive(&archive.id).await.unwrap();
    assert_eq!(stored.archive_status, ArchiveStatus::Archiving);
    assert_eq!(stored.counters.validation.validation_count, 3);

    let event = env.job_event(&archive, "invoices", JobRunState::Succeeded).await;
    let outcome = env.coordinator.handle_job_event(event).await.unwrap();
    assert_eq!(
        outcome,
        JobEventOutcome::ValidationDispatched {
            started: 3,
            failed: 0,
            all_tables_extracted: true,
        }
    );
    let stored = env.store.get_archive(&archive.id).await.unwrap();
    assert_eq!(stored.archive_status, ArchiveStatus::Validating);
    assert_eq!(stored.job_status, JobStatus::Succeeded);
    assert_eq!(stored.counters.validation.validation_count, 6);

    let queries = validation_queries(&env);
    assert_eq!(queries.len(), 6);
    for (i, query) in queries.iter().take(5).enumerate() {
        assert_eq!(
            report_query(&env, &query.execution_id, QueryState::Succeeded).await,
            QueryEventOutcome::Completed(CompletionOutcome::Pending {
                completed: i as i64 + 1,
                target: 6,
            })
        );
        let stored = env.store.get_archive(&archive.id).await.unwrap();
        assert_eq!(stored.archive_status, ArchiveStatus::Validating);
    }
    assert_eq!(
        report_query(&env, &queries[5].execution_id, QueryState::Succeeded).await,
        QueryEventOutcome::Completed(CompletionOutcome::Archived)
    );

    // redelivered callbacks are recognised by execution id and not counted
    for query in [&queries[0], &queries[5]] {
        assert_eq!(
            report_query(&env, &query.execution_id, QueryState::Succeeded).await,
            QueryEventOutcome::Completed(CompletionOutcome::Duplicate)
        );
    }

    let stored = env.store.get_archive(&archive.id).await.unwrap();
    assert_eq!(stored.archive_status, ArchiveStatus::Archived);
    assert_eq!(stored.counters.validation.validation_completed, 6);
    for table in &stored.table_details {
        assert!(table.count_validation.is_some());
        assert!(table.string_validation.is_some());
        assert!(table.number_validation.is_some());
    }
}

#[tokio::test]
async fn test_early_validations_wait_for_last_table() {
    let env = TestEnvironment::new();
    let archive = env.queued_archive(&["ledger", "invoices"]).await;
    env.coordinator.start(&archive.id).await.unwrap();

    let event = env.job_event(&archive, "ledger", JobRunState::Succeeded).await;
    env.coordinator.handle_job_event(event).await.unwrap();

    // the first table's validations all finish while the second still extracts
    let mut outcomes = Vec::new();
    for query in validation_queries(&env) {
        outcomes.push(report_query(&env, &query.execution_id, QueryState::Succeeded).await);
    }
    assert_eq!(
        outcomes.last(),
        Some(&QueryEventOutcome::Completed(CompletionOutcome::NotValidating {
            current: ArchiveStatus::Archiving,
        }))
    );

    let event = env.job_event(&archive, "invoices", JobRunState::Succeeded).await;
    env.coordinator.handle_job_event(event).await.unwrap();

    let mut outcomes = Vec::new();
    for query in validation_queries(&env).iter().skip(3) {
        outcomes.push(report_query(&env, &query.execution_id, QueryState::Succeeded).await);
    }
    let archived = QueryEventOutcome::Completed(CompletionOutcome::Archived);
    assert_eq!(outcomes.len(), 3);
    assert_eq!(outcomes.last(), Some(&archived));
    assert_eq!(outcomes.iter().filter(|o| **o == archived).count(), 1);
}

#[tokio::test]
async fn test_concurrent_table_completions_reserve_every_task() {
    let env = TestEnvironment::new();
    let archive = env.queued_archive(&["ledger", "invoices", "payments"]).await;
    env.coordinator.start(&archive.id).await.unwrap();

    let ledger = env.job_event(&archive, "ledger", JobRunState::Succeeded).await;
    let invoices = env.job_event(&archive, "invoices", JobRunState::Succeeded).await;
    let payments = env.job_event(&archive, "payments", JobRunState::Succeeded).await;

    let (a, b, c) = tokio::join!(
        env.coordinator.handle_job_event(ledger),
        env.coordinator.handle_job_event(invoices),
        env.coordinator.handle_job_event(payments),
    );

    let last_table_count = [a.unwrap(), b.unwrap(), c.unwrap()]
        .iter()
        .filter(|o| {
            matches!(
                o,
                JobEventOutcome::ValidationDispatched {
                    all_tables_extracted: true,
                    ..
                }
            )
        })
        .count();
    assert_eq!(last_table_count, 1);

    let stored = env.store.get_archive(&archive.id).await.unwrap();
    assert_eq!(stored.archive_status, ArchiveStatus::Validating);
    assert_eq!(stored.counters.validation.validation_count, 9);
    assert_eq!(stored.counters.etl.succeeded, 3);
}

#[tokio::test]
async fn test_duplicate_job_event_is_ignored() {
    let env = TestEnvironment::new();
    let archive = env.queued_archive(&["ledger", "invoices"]).await;
    env.coordinator.start(&archive.id).await.unwrap();

    let event = env.job_event(&archive, "ledger", JobRunState::Succeeded).await;
    env.coordinator.handle_job_event(event.clone()).await.unwrap();

    let outcome = env.coordinator.handle_job_event(event).await.unwrap();
    assert_eq!(outcome, JobEventOutcome::Duplicate);

    // a contradictory terminal state for the same run is dropped as well
    let contradicting = env.job_event(&archive, "ledger", JobRunState::Failed).await;
    assert_eq!(
        env.coordinator.handle_job_event(contradicting).await.unwrap(),
        JobEventOutcome::Duplicate
    );

    let stored = env.store.get_archive(&archive.id).await.unwrap();
    assert_eq!(stored.archive_status, ArchiveStatus::Archiving);
    assert_eq!(stored.counters.validation.validation_count, 3);
    assert_eq!(stored.counters.etl.succeeded, 1);
    assert_eq!(validation_queries(&env).len(), 3);
}

#[tokio::test]
async fn test_etl_failure_fails_archive() {
    let env = TestEnvironment::new();
    let archive = env.queued_archive(&["ledger", "invoices"]).await;
    env.coordinator.start(&archive.id).await.unwrap();

    let running = env.job_event(&archive, "invoices", JobRunState::Running).await;
    assert_eq!(
        env.coordinator.handle_job_event(running).await.unwrap(),
        JobEventOutcome::Recorded
    );

    let mut failed = env.job_event(&archive, "ledger", JobRunState::Failed).await;
    failed.message = "connection refused".to_string();
    assert_eq!(
        env.coordinator.handle_job_event(failed).await.unwrap(),
        JobEventOutcome::ArchiveFailed
    );

    let stored = env.store.get_archive(&archive.id).await.unwrap();
    assert_eq!(stored.archive_status, ArchiveStatus::Failed);
    assert_eq!(stored.job_status, JobStatus::Failed);
    let record = stored
        .jobs
        .values()
        .find(|j| j.state == JobRunState::Failed)
        .unwrap();
    assert_eq!(record.message, "connection refused");

    // a late success neither revives the archive nor dispatches validations
    let late = env.job_event(&archive, "invoices", JobRunState::Succeeded).await;
    assert_eq!(
        env.coordinator.handle_job_event(late).await.unwrap(),
        JobEventOutcome::ValidationSkipped
    );
    let stored = env.store.get_archive(&archive.id).await.unwrap();
    assert_eq!(stored.archive_status, ArchiveStatus::Failed);
    assert_eq!(stored.job_status, JobStatus::Failed);
    assert!(validation_queries(&env).is_empty());
}

#[tokio::test]
async fn test_failed_validation_query_fails_archive() {
    let env = TestEnvironment::new();
    let archive_id = validating_archive(&env).await;

    let queries = validation_queries(&env);
    assert_eq!(
        report_query(&env, &queries[0].execution_id, QueryState::Running).await,
        QueryEventOutcome::Ignored
    );
    assert_eq!(
        report_query(&env, &queries[0].execution_id, QueryState::Failed).await,
        QueryEventOutcome::ArchiveFailed
    );

    let stored = env.store.get_archive(&archive_id).await.unwrap();
    assert_eq!(stored.archive_status, ArchiveStatus::Failed);
    assert!(stored.table_details[0].count_validation.is_none());

    // the remaining validations still count but cannot archive a failed archive
    let mut outcomes = Vec::new();
    for query in queries.iter().skip(1) {
        outcomes.push(report_query(&env, &query.execution_id, QueryState::Succeeded).await);
    }
    assert_eq!(
        outcomes,
        vec![
            QueryEventOutcome::Completed(CompletionOutcome::Pending {
                completed: 1,
                target: 3,
            }),
            QueryEventOutcome::Completed(CompletionOutcome::Pending {
                completed: 2,
                target: 3,
            }),
        ]
    );
    let stored = env.store.get_archive(&archive_id).await.unwrap();
    assert_eq!(stored.archive_status, ArchiveStatus::Failed);
}

#[tokio::test]
async fn test_provisioning_failure_and_retry() {
    let env = TestEnvironment::new();
    let archive = env.queued_archive(&["ledger", "invoices"]).await;
    env.gateway.fail("create_job");

    let result = env.coordinator.start(&archive.id).await;
    assert!(matches!(
        result,
        Err(ArchiveError::Provisioning {
            step: ProvisionStep::Job,
            ..
        })
    ));
    let stored = env.store.get_archive(&archive.id).await.unwrap();
    assert_eq!(stored.archive_status, ArchiveStatus::Failed);
    assert!(env.gateway.job_runs().is_empty());

    // Failed is terminal
    env.gateway.clear_failures();
    assert!(matches!(
        env.coordinator.start(&archive.id).await,
        Err(ArchiveError::IllegalTransition { .. })
    ));

    let second = env.queued_archive(&["ledger", "invoices"]).await;
    env.coordinator.start(&second.id).await.unwrap();
    assert_eq!(env.gateway.job_runs().len(), 2);
    assert_eq!(env.gateway.create_calls("database"), 2);
}

#[tokio::test(start_paused = true)]
async fn test_terminal_transition_survives_a_store_fault() {
    let env = TestEnvironment::new();
    let archive_id = validating_archive(&env).await;
    let queries = validation_queries(&env);

    for query in &queries[..2] {
        report_query(&env, &query.execution_id, QueryState::Succeeded).await;
    }

    env.faults.fail("transition_status:Archived", 1);
    assert_eq!(
        report_query(&env, &queries[2].execution_id, QueryState::Succeeded).await,
        QueryEventOutcome::Completed(CompletionOutcome::Archived)
    );

    let stored = env.store.get_archive(&archive_id).await.unwrap();
    assert_eq!(stored.archive_status, ArchiveStatus::Archived);
    assert_eq!(stored.counters.validation.validation_completed, 3);
}

#[tokio::test(start_paused = true)]
async fn test_redelivered_completion_finishes_archive() {
    let env = TestEnvironment::new();
    let archive_id = validating_archive(&env).await;
    let queries = validation_queries(&env);

    for query in &queries[..2] {
        report_query(&env, &query.execution_id, QueryState::Succeeded).await;
    }

    // every retry of the terminal transition fails during the first delivery
    env.faults.fail("transition_status:Archived", 10);
    let last = &queries[2].execution_id;
    assert!(try_report_query(&env, last, QueryState::Succeeded).await.is_err());

    let stored = env.store.get_archive(&archive_id).await.unwrap();
    assert_eq!(stored.archive_status, ArchiveStatus::Validating);
    assert_eq!(stored.counters.validation.validation_completed, 3);

    env.faults.fail("transition_status:Archived", 0);
    assert_eq!(
        report_query(&env, last, QueryState::Succeeded).await,
        QueryEventOutcome::Completed(CompletionOutcome::Archived)
    );
    assert_eq!(
        report_query(&env, last, QueryState::Succeeded).await,
        QueryEventOutcome::Completed(CompletionOutcome::Duplicate)
    );

    let stored = env.store.get_archive(&archive_id).await.unwrap();
    assert_eq!(stored.archive_status, ArchiveStatus::Archived);
    assert_eq!(stored.counters.validation.validation_completed, 3);
}

#[tokio::test]
async fn test_counting_fault_leaves_completion_for_redelivery() {
    let env = TestEnvironment::new();
    let archive_id = validating_archive(&env).await;
    let queries = validation_queries(&env);

    env.faults.fail("count_completion", 1);
    let first = &queries[0].execution_id;
    assert!(try_report_query(&env, first, QueryState::Succeeded).await.is_err());
    let stored = env.store.get_archive(&archive_id).await.unwrap();
    assert_eq!(stored.counters.validation.validation_completed, 0);

    let mut outcomes = Vec::new();
    for query in &queries {
        outcomes.push(report_query(&env, &query.execution_id, QueryState::Succeeded).await);
    }
    assert_eq!(
        outcomes.last(),
        Some(&QueryEventOutcome::Completed(CompletionOutcome::Archived))
    );

    let stored = env.store.get_archive(&archive_id).await.unwrap();
    assert_eq!(stored.archive_status, ArchiveStatus::Archived);
    assert_eq!(stored.counters.validation.validation_completed, 3);
}

#[tokio::test]
async fn test_redelivered_success_finishes_table_after_store_fault() {
    let env = TestEnvironment::new();
    let archive = env.queued_archive(&["ledger"]).await;
    env.coordinator.start(&archive.id).await.unwrap();
    let event = env.job_event(&archive, "ledger", JobRunState::Succeeded).await;

    env.faults.fail("mark_table_extracted", 1);
    assert!(env.coordinator.handle_job_event(event.clone()).await.is_err());

    // the terminal run record landed, the table was not counted
    let stored = env.store.get_archive(&archive.id).await.unwrap();
    assert_eq!(stored.jobs[&event.job_run_id].state, JobRunState::Succeeded);
    assert_eq!(stored.archive_status, ArchiveStatus::Archiving);
    assert_eq!(stored.counters.etl.succeeded, 0);
    assert_eq!(stored.counters.validation.validation_count, 0);

    assert_eq!(
        env.coordinator.handle_job_event(event.clone()).await.unwrap(),
        JobEventOutcome::ValidationDispatched {
            started: 3,
            failed: 0,
            all_tables_extracted: true,
        }
    );
    assert_eq!(
        env.coordinator.handle_job_event(event).await.unwrap(),
        JobEventOutcome::Duplicate
    );

    let stored = env.store.get_archive(&archive.id).await.unwrap();
    assert_eq!(stored.archive_status, ArchiveStatus::Validating);
    assert_eq!(stored.job_status, JobStatus::Succeeded);
    assert_eq!(stored.counters.etl.succeeded, 1);
    assert_eq!(stored.counters.validation.validation_count, 3);
    assert_eq!(validation_queries(&env).len(), 3);
}

#[tokio::test]
async fn test_redelivered_failure_fails_archive_after_store_fault() {
    let env = TestEnvironment::new();
    let archive = env.queued_archive(&["ledger", "invoices"]).await;
    env.coordinator.start(&archive.id).await.unwrap();
    let failed = env.job_event(&archive, "ledger", JobRunState::Failed).await;

    env.faults.fail("set_job_status", 1);
    assert!(env.coordinator.handle_job_event(failed.clone()).await.is_err());
    let stored = env.store.get_archive(&archive.id).await.unwrap();
    assert_eq!(stored.archive_status, ArchiveStatus::Archiving);

    assert_eq!(
        env.coordinator.handle_job_event(failed).await.unwrap(),
        JobEventOutcome::ArchiveFailed
    );
    let stored = env.store.get_archive(&archive.id).await.unwrap();
    assert_eq!(stored.archive_status, ArchiveStatus::Failed);
    assert_eq!(stored.job_status, JobStatus::Failed);
}
