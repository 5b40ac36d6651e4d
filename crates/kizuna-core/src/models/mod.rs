mod credential;
mod library;
mod media;
mod service;

pub use credential::Credential;
pub use library::{LibraryEntry, WatchStatus};
pub use media::{AiringStatus, AnimeSeason, MediaEntry, SeasonInfo};
pub use service::ServiceKind;
