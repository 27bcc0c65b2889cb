use chrono::{DateTime, FixedOffset};

use crate::accounts::ServerConnectionSpec;
use crate::error::Result;
use crate::folders::FolderNode;

/// Protocol-level metadata of one message in the open folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageMeta {
    pub uid: u32,
    pub message_id: Option<String>,
    pub subject: Option<String>,
    pub sender: Option<String>,
    pub size: u32,
    pub internal_date: Option<DateTime<FixedOffset>>,
    pub flags: Vec<String>,
}

/// A stateful mailbox-access session against one server.
///
/// At most one folder is open at a time. Implementations are not shared
/// between threads.
pub trait MailboxConnection {
    fn separator(&mut self) -> Result<char>;

    /// Direct children of `parent`, in server order.
    fn list_children(&mut self, parent: &FolderNode) -> Result<Vec<FolderNode>>;

    fn folder_exists(&mut self, path: &str) -> Result<bool>;

    /// Returns `false` if the folder already existed.
    fn create_folder(&mut self, path: &str) -> Result<bool>;

    /// Fails with `MigrateError::NoSelect` for container-only folders.
    fn open_read_only(&mut self, folder: &FolderNode) -> Result<()>;

    fn open_read_write(&mut self, path: &str) -> Result<()>;

    /// Messages of the open folder, in the order the server lists them.
    fn list_messages(&mut self) -> Result<Vec<MessageMeta>>;

    /// Full RFC 822 content of a message in the open folder.
    fn fetch_message(&mut self, uid: u32) -> Result<Vec<u8>>;

    /// Appends `content` to `path`, keeping the flags and internal date of `meta`.
    fn append_message(&mut self, path: &str, content: &[u8], meta: &MessageMeta) -> Result<()>;

    /// Closes the open folder without expunging.
    fn close_folder(&mut self) -> Result<()>;

    fn logout(&mut self) -> Result<()>;
}

/// Opens connections for the scheduler's workers.
pub trait Connector: Send + Sync {
    fn connect(&self, spec: &ServerConnectionSpec) -> Result<Box<dyn MailboxConnection>>;
}
