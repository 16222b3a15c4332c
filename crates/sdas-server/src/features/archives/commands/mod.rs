pub mod delete_view;
pub mod events;
pub mod expiration;
pub mod run;

pub use delete_view::{DeleteViewCommand, DeleteViewError, DeleteViewResponse};
pub use events::EventError;
pub use expiration::{SetExpirationCommand, SetExpirationError};
pub use run::{RunArchiveCommand, RunArchiveError, RunArchiveResponse};
