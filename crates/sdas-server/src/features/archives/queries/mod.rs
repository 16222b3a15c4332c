pub mod download;
pub mod get;
pub mod list_views;
pub mod run_query;

pub use download::{DownloadError, DownloadQuery, DownloadResponse};
pub use get::{GetArchiveError, GetArchiveQuery};
pub use list_views::{ListViewsError, ListViewsQuery, ListViewsResponse, ViewSummary};
pub use run_query::{QueryPage, RunQueryError, RunQueryRequest};
