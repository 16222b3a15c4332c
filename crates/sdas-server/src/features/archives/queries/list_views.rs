//! List the views of an archive's catalog database
//!
//! View SQL is returned in logical names, the inverse of the query rewrite.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use mediator::Request;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::archive::gateway::{CatalogColumn, GatewayError};
use crate::archive::rewrite::unqualify;
use crate::archive::ArchiveError;
use crate::features::FeatureState;

#[derive(Debug, Clone, Deserialize)]
pub struct ListViewsQuery {
    pub archive_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewSummary {
    pub name: String,
    pub view_original_text: String,
    pub view_expanded_text: Option<String>,
    pub created_time: Option<DateTime<Utc>>,
    pub updated_time: Option<DateTime<Utc>>,
    pub columns: Vec<CatalogColumn>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListViewsResponse {
    pub views: Vec<ViewSummary>,
    pub database_name: String,
    pub count: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum ListViewsError {
    #[error(transparent)]
    Catalog(#[from] GatewayError),
    #[error(transparent)]
    Archive(#[from] ArchiveError),
}

impl Request<Result<ListViewsResponse, ListViewsError>> for ListViewsQuery {}

#[derive(Deserialize)]
struct EncodedView {
    #[serde(rename = "originalSql")]
    original_sql: String,
}

/// Decode `/* Presto View: <base64 JSON> */` to its original SQL; anything
/// else is returned unchanged
pub fn decode_view_text(text: &str) -> String {
    let Ok(pattern) = Regex::new(r"/\* Presto View: ([A-Za-z0-9+/=]+) \*/") else {
        return text.to_string();
    };
    let Some(encoded) = pattern.captures(text).and_then(|c| c.get(1)) else {
        return text.to_string();
    };

    let decoded = STANDARD
        .decode(encoded.as_str())
        .map_err(|e| e.to_string())
        .and_then(|bytes| {
            serde_json::from_slice::<EncodedView>(&bytes).map_err(|e| e.to_string())
        });
    match decoded {
        Ok(view) => view.original_sql,
        Err(e) => {
            warn!(error = %e, "Failed to decode view text");
            text.to_string()
        },
    }
}

#[tracing::instrument(skip(state))]
pub async fn handle(
    state: &FeatureState,
    query: ListViewsQuery,
) -> Result<ListViewsResponse, ListViewsError> {
    let archive = state.store().get_archive(&query.archive_id).await?;
    let database_name = archive.names().database();

    let views: Vec<ViewSummary> = state
        .catalog()
        .list_tables(&database_name)
        .await?
        .into_iter()
        .filter(|t| t.is_view())
        .map(|t| {
            let original = decode_view_text(t.view_original_text.as_deref().unwrap_or_default());
            ViewSummary {
                view_original_text: unqualify(&original, &archive.id, &archive.connection.database),
                name: t.name,
                view_expanded_text: t.view_expanded_text,
                created_time: t.created_at,
                updated_time: t.updated_at,
                columns: t.columns,
            }
        })
        .collect();

    Ok(ListViewsResponse {
        count: views.len(),
        views,
        database_name,
    })
}
