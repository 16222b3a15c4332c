//! Set archive expiration command
//!
//! Records the retention settings of an archive. When `delete_data` is set an
//! S3 lifecycle rule on the archive data bucket expires the archive's prefix
//! on the given date; the rule is disabled again when `delete_data` is
//! cleared. Archives under legal hold never accept `delete_data`.

use chrono::NaiveDate;
use mediator::Request;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::archive::types::ExpirationSettings;
use crate::archive::ArchiveError;
use crate::features::FeatureState;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetExpirationCommand {
    #[serde(skip)]
    pub archive_id: String,
    pub expiration_status: bool,
    #[serde(default)]
    pub expiration_date: Option<NaiveDate>,
    #[serde(default)]
    pub delete_data: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum SetExpirationError {
    #[error("expiration_date is required when expiration or data deletion is enabled")]
    MissingDate,
    #[error("archive {0} is under legal hold; its data cannot be scheduled for deletion")]
    LegalHold(String),
    #[error("object storage is not configured")]
    StorageNotConfigured,
    #[error("Lifecycle rule update failed: {0}")]
    Lifecycle(#[from] anyhow::Error),
    #[error(transparent)]
    Archive(#[from] ArchiveError),
}

impl Request<Result<ExpirationSettings, SetExpirationError>> for SetExpirationCommand {}

impl SetExpirationCommand {
    pub fn validate(&self) -> Result<(), SetExpirationError> {
        if (self.expiration_status || self.delete_data) && self.expiration_date.is_none() {
            return Err(SetExpirationError::MissingDate);
        }
        Ok(())
    }
}

#[tracing::instrument(skip(state), fields(archive_id = %command.archive_id))]
pub async fn handle(
    state: &FeatureState,
    command: SetExpirationCommand,
) -> Result<ExpirationSettings, SetExpirationError> {
    command.validate()?;

    let archive = state.store().get_archive(&command.archive_id).await?;
    if command.delete_data && archive.legal_hold {
        return Err(SetExpirationError::LegalHold(archive.id));
    }

    // a rule only exists once deletion has been enabled
    if command.delete_data || archive.expiration.delete_data {
        state
            .storage
            .as_ref()
            .ok_or(SetExpirationError::StorageNotConfigured)?
            .put_expiration_rule(
                &state.archive.data_bucket,
                &archive.id,
                &format!("{}/", archive.id),
                command.expiration_date,
                command.delete_data,
            )
            .await?;
    }

    let settings = ExpirationSettings {
        expiration_status: command.expiration_status,
        expiration_date: if command.expiration_status {
            command.expiration_date
        } else {
            None
        },
        delete_data: command.delete_data,
    };
    state.store().set_expiration(&archive.id, &settings).await?;

    info!(
        expiration_status = settings.expiration_status,
        delete_data = settings.delete_data,
        "Archive expiration updated"
    );
    Ok(settings)
}
