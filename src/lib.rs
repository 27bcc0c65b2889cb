pub mod accounts;
pub mod cancel;
pub mod config;
pub mod connection;
pub mod credentials;
pub mod error;
pub mod fingerprint;
pub mod folders;
pub mod imap_client;
pub mod mirror;
pub mod runlog;
pub mod scheduler;
pub mod store;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use accounts::{Account, ServerConnectionSpec};
pub use cancel::CancellationToken;
pub use config::Config;
pub use connection::{Connector, MailboxConnection, MessageMeta};
pub use error::{MigrateError, Result};
pub use fingerprint::{fingerprint, MessageInfo};
pub use folders::{map_folder_name, FolderMap, FolderNode};
pub use imap_client::ImapConnector;
pub use mirror::{MailboxMirror, MirrorReport};
pub use scheduler::{JobOutcome, JobSummary, ScheduleStats, Scheduler};
pub use store::{SqliteTrackingStore, TrackingStore};
