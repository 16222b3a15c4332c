use mediator::Request;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::archive::gateway::GatewayError;
use crate::archive::ArchiveError;
use crate::features::FeatureState;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteViewCommand {
    pub archive_id: String,
    pub view_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteViewResponse {
    pub message: String,
    pub view_name: String,
    pub database: String,
}

#[derive(Debug, thiserror::Error)]
pub enum DeleteViewError {
    #[error("view name cannot be empty")]
    EmptyName,
    /// Archived tables are never removed through this path
    #[error("'{0}' is an archived table, not a view")]
    NotAView(String),
    #[error(transparent)]
    Catalog(#[from] GatewayError),
    #[error(transparent)]
    Archive(#[from] ArchiveError),
}

impl Request<Result<DeleteViewResponse, DeleteViewError>> for DeleteViewCommand {}

impl DeleteViewCommand {
    pub fn validate(&self) -> Result<(), DeleteViewError> {
        if self.view_name.trim().is_empty() {
            return Err(DeleteViewError::EmptyName);
        }
        Ok(())
    }
}

/// Remove a view from the archive's catalog database
#[tracing::instrument(skip(state))]
pub async fn handle(
    state: &FeatureState,
    command: DeleteViewCommand,
) -> Result<DeleteViewResponse, DeleteViewError> {
    command.validate()?;

    let archive = state.store().get_archive(&command.archive_id).await?;
    let database = archive.names().database();

    let entry = state.catalog().get_table(&database, &command.view_name).await?;
    if !entry.is_view() {
        return Err(DeleteViewError::NotAView(command.view_name));
    }

    state
        .catalog()
        .delete_table(&database, &command.view_name)
        .await?;
    info!(view = %command.view_name, %database, "View deleted");

    Ok(DeleteViewResponse {
        message: format!("View '{}' successfully deleted", command.view_name),
        view_name: command.view_name,
        database,
    })
}
