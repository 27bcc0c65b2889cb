use thiserror::Error;

pub type Result<T> = std::result::Result<T, MigrateError>;

#[derive(Error, Debug)]
pub enum MigrateError {
    #[error("Could not connect to IMAP server {host}: {reason}")]
    Connection { host: String, reason: String },

    #[error("IMAP error on '{folder}': {reason}")]
    Protocol { folder: String, reason: String },

    /// The folder exists only to hold other folders. Callers skip it and
    /// recurse into its children.
    #[error("Folder '{folder}' cannot contain messages")]
    NoSelect { folder: String },

    #[error("Malformed message in '{folder}': {reason}")]
    MalformedMessage { folder: String, reason: String },

    #[error("Tracking store error: {0}")]
    Store(String),

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Account list error: {0}")]
    AccountList(String),

    #[error("Unknown account id(s) requested: {}", .0.join(", "))]
    UnknownAccounts(Vec<String>),

    #[error("TLS error: {0}")]
    Tls(#[from] native_tls::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl MigrateError {
    pub fn protocol(folder: &str, reason: impl ToString) -> Self {
        MigrateError::Protocol {
            folder: folder.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn is_no_select(&self) -> bool {
        matches!(self, MigrateError::NoSelect { .. })
    }
}

impl From<rusqlite::Error> for MigrateError {
    fn from(e: rusqlite::Error) -> Self {
        MigrateError::Store(e.to_string())
    }
}

impl From<r2d2::Error> for MigrateError {
    fn from(e: r2d2::Error) -> Self {
        MigrateError::Store(e.to_string())
    }
}
