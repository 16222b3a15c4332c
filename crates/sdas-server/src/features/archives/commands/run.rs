//! Run archive command
//!
//! Sets the ETL worker configuration and optionally starts the workflow on a
//! background task. Workflow failures after the start surface only through
//! `archive_status`.

use mediator::Request;
use serde::{Deserialize, Serialize};
use tracing::{error, Instrument};

use crate::archive::types::{ArchiveStatus, EtlConfiguration};
use crate::archive::ArchiveError;
use crate::features::FeatureState;

fn default_run_now() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunArchiveCommand {
    #[serde(skip)]
    pub archive_id: String,
    #[serde(default)]
    pub worker_type: Option<String>,
    #[serde(default)]
    pub worker_count: Option<u32>,
    #[serde(default = "default_run_now")]
    pub run_now: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunArchiveResponse {
    pub archive_id: String,
    pub configuration: EtlConfiguration,
    pub started: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum RunArchiveError {
    /// Only `Queued` archives can be started
    #[error("Archive {archive_id} is {status} and cannot be started")]
    NotQueued {
        archive_id: String,
        status: ArchiveStatus,
    },
    #[error(transparent)]
    Archive(#[from] ArchiveError),
}

impl Request<Result<RunArchiveResponse, RunArchiveError>> for RunArchiveCommand {}

#[tracing::instrument(skip(state), fields(archive_id = %command.archive_id))]
pub async fn handle(
    state: &FeatureState,
    command: RunArchiveCommand,
) -> Result<RunArchiveResponse, RunArchiveError> {
    let archive = state.store().get_archive(&command.archive_id).await?;

    let mut configuration = archive.configuration.etl.clone();
    if command.worker_type.is_some() || command.worker_count.is_some() {
        configuration = EtlConfiguration {
            worker_type: command
                .worker_type
                .unwrap_or_else(|| state.archive.default_worker_type.clone()),
            worker_count: command
                .worker_count
                .unwrap_or(state.archive.default_worker_count),
        };
        state
            .coordinator
            .configure_etl(&archive.id, configuration.clone())
            .await?;
    }

    if !command.run_now {
        return Ok(RunArchiveResponse {
            archive_id: archive.id,
            configuration,
            started: false,
        });
    }

    if archive.archive_status != ArchiveStatus::Queued {
        return Err(RunArchiveError::NotQueued {
            archive_id: archive.id,
            status: archive.archive_status,
        });
    }

    let coordinator = state.coordinator.clone();
    let archive_id = archive.id.clone();
    let span = tracing::info_span!("archive_workflow", archive_id = %archive_id);
    tokio::spawn(
        async move {
            if let Err(e) = coordinator.start(&archive_id).await {
                error!(error = %e, "Archive workflow did not start");
            }
        }
        .instrument(span),
    );

    Ok(RunArchiveResponse {
        archive_id: archive.id,
        configuration,
        started: true,
    })
}
