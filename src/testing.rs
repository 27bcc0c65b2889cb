//! In-memory mailbox servers for unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, FixedOffset, TimeZone};

use crate::accounts::{Account, ServerConnectionSpec};
use crate::config::AdminLoginMode;
use crate::connection::{Connector, MailboxConnection, MessageMeta};
use crate::error::{MigrateError, Result};
use crate::folders::FolderNode;

#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub meta: MessageMeta,
    pub content: Vec<u8>,
}

#[derive(Debug, Clone)]
struct Folder {
    path: String,
    no_select: bool,
    messages: Vec<StoredMessage>,
    next_uid: u32,
}

type Hook = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct ServerState {
    folders: Vec<Folder>,
    appends: usize,
    after_appends: Option<(usize, Hook)>,
    fail_open: HashSet<String>,
    fail_create: HashSet<String>,
    fail_append_after: Option<usize>,
    op_delay: Duration,
    refuse_connect: bool,
    sessions: usize,
}

/// One mailbox (or the mailbox of one proxied user) on a fake server.
#[derive(Clone)]
pub struct MemoryServer {
    separator: char,
    state: Arc<Mutex<ServerState>>,
}

impl MemoryServer {
    pub fn new(separator: char) -> Self {
        Self {
            separator,
            state: Arc::new(Mutex::new(ServerState::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ServerState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Adds a folder and any missing ancestors (as `\Noselect` containers).
    pub fn add_folder(&self, path: &str, no_select: bool) {
        let mut state = self.lock();
        self.insert_folder(&mut state, path, no_select, true);
    }

    fn insert_folder(
        &self,
        state: &mut ServerState,
        path: &str,
        no_select: bool,
        ancestors_no_select: bool,
    ) {
        let mut prefix = String::new();
        for (i, part) in path.split(self.separator).enumerate() {
            if i > 0 {
                prefix.push(self.separator);
            }
            prefix.push_str(part);
            if state.folders.iter().any(|f| f.path == prefix) {
                continue;
            }
            let is_leaf = prefix == path;
            state.folders.push(Folder {
                path: prefix.clone(),
                no_select: if is_leaf { no_select } else { ancestors_no_select },
                messages: Vec::new(),
                next_uid: 1,
            });
        }
    }

    /// Adds a message with a unique internal date and returns its metadata.
    pub fn add_message(&self, path: &str, subject: &str, message_id: Option<&str>) -> MessageMeta {
        let mut state = self.lock();
        self.insert_folder(&mut state, path, false, true);
        let serial = state.folders.iter().map(|f| f.messages.len()).sum::<usize>() as i64;
        let date = internal_date(serial);
        let content = format!(
            "Message-ID: <{}>\r\nSubject: {}\r\n\r\nbody of {}\r\n",
            message_id.unwrap_or("none"),
            subject,
            subject
        )
        .into_bytes();

        let meta = MessageMeta {
            uid: 0,
            message_id: message_id.map(str::to_string),
            subject: Some(subject.to_string()),
            sender: Some("sender@example.com".to_string()),
            size: content.len() as u32,
            internal_date: Some(date),
            flags: vec!["\\Seen".to_string()],
        };
        push_message(&mut state, path, meta, content)
    }

    /// Adds a message with arbitrary metadata; the uid is assigned here.
    pub fn add_raw_message(&self, path: &str, meta: MessageMeta, content: &[u8]) -> MessageMeta {
        let mut state = self.lock();
        self.insert_folder(&mut state, path, false, true);
        push_message(&mut state, path, meta, content.to_vec())
    }

    pub fn folder_paths(&self) -> Vec<String> {
        self.lock().folders.iter().map(|f| f.path.clone()).collect()
    }

    pub fn messages(&self, path: &str) -> Vec<StoredMessage> {
        self.lock()
            .folders
            .iter()
            .find(|f| f.path == path)
            .map(|f| f.messages.clone())
            .unwrap_or_default()
    }

    pub fn total_messages(&self) -> usize {
        self.lock().folders.iter().map(|f| f.messages.len()).sum()
    }

    pub fn appends(&self) -> usize {
        self.lock().appends
    }

    pub fn open_sessions(&self) -> usize {
        self.lock().sessions
    }

    /// Runs `hook` once, right after the `count`-th append.
    pub fn after_appends(&self, count: usize, hook: impl Fn() + Send + Sync + 'static) {
        self.lock().after_appends = Some((count, Arc::new(hook)));
    }

    pub fn fail_open(&self, path: &str) {
        self.lock().fail_open.insert(path.to_string());
    }

    pub fn fail_create(&self, path: &str) {
        self.lock().fail_create.insert(path.to_string());
    }

    /// Appends beyond the first `count` fail.
    pub fn fail_append_after(&self, count: usize) {
        self.lock().fail_append_after = Some(count);
    }

    pub fn set_op_delay(&self, delay: Duration) {
        self.lock().op_delay = delay;
    }

    pub fn refuse_connect(&self) {
        self.lock().refuse_connect = true;
    }

    pub fn connect(&self) -> Result<MemoryConnection> {
        let mut state = self.lock();
        if state.refuse_connect {
            return Err(MigrateError::Connection {
                host: "memory".to_string(),
                reason: "connection refused".to_string(),
            });
        }
        state.sessions += 1;
        Ok(MemoryConnection {
            server: self.clone(),
            selected: None,
            gauge: None,
        })
    }

    fn delay(&self) {
        let delay = self.lock().op_delay;
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
    }
}

fn push_message(
    state: &mut ServerState,
    path: &str,
    mut meta: MessageMeta,
    content: Vec<u8>,
) -> MessageMeta {
    let folder = state
        .folders
        .iter_mut()
        .find(|f| f.path == path)
        .expect("folder was just inserted");
    meta.uid = folder.next_uid;
    folder.next_uid += 1;
    folder.messages.push(StoredMessage {
        meta: meta.clone(),
        content,
    });
    meta
}

pub fn internal_date(serial: i64) -> DateTime<FixedOffset> {
    FixedOffset::east_opt(3600)
        .unwrap()
        .timestamp_opt(1_600_000_000 + serial * 60, 0)
        .unwrap()
}

pub struct MemoryConnection {
    server: MemoryServer,
    selected: Option<String>,
    gauge: Option<Arc<SessionGauge>>,
}

impl MemoryConnection {
    fn selected(&self) -> Result<String> {
        self.selected
            .clone()
            .ok_or_else(|| MigrateError::protocol("", "no folder selected"))
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.server.lock().sessions -= 1;
        if let Some(gauge) = &self.gauge {
            gauge.open.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl MailboxConnection for MemoryConnection {
    fn separator(&mut self) -> Result<char> {
        Ok(self.server.separator)
    }

    fn list_children(&mut self, parent: &FolderNode) -> Result<Vec<FolderNode>> {
        let separator = self.server.separator;
        let prefix = if parent.is_root() {
            String::new()
        } else {
            format!("{}{}", parent.path, separator)
        };
        let state = self.server.lock();
        Ok(state
            .folders
            .iter()
            .filter(|f| f.path.starts_with(&prefix) && !f.path[prefix.len()..].contains(separator))
            .map(|f| FolderNode::new(&f.path, separator, f.no_select))
            .collect())
    }

    fn folder_exists(&mut self, path: &str) -> Result<bool> {
        Ok(self.server.lock().folders.iter().any(|f| f.path == path))
    }

    fn create_folder(&mut self, path: &str) -> Result<bool> {
        let mut state = self.server.lock();
        if state.fail_create.contains(path) {
            return Err(MigrateError::protocol(path, "NO [NOPERM] permission denied"));
        }
        if state.folders.iter().any(|f| f.path == path) {
            return Ok(false);
        }
        self.server.insert_folder(&mut state, path, false, false);
        Ok(true)
    }

    fn open_read_only(&mut self, folder: &FolderNode) -> Result<()> {
        self.server.delay();
        let status = {
            let state = self.server.lock();
            if state.fail_open.contains(&folder.path) {
                return Err(MigrateError::protocol(&folder.path, "NO [SERVERBUG] internal error"));
            }
            state
                .folders
                .iter()
                .find(|f| f.path == folder.path)
                .map(|f| f.no_select)
        };
        match status {
            Some(true) => Err(MigrateError::NoSelect {
                folder: folder.path.clone(),
            }),
            Some(false) => {
                self.selected = Some(folder.path.clone());
                Ok(())
            }
            None => Err(MigrateError::protocol(&folder.path, "NO mailbox does not exist")),
        }
    }

    fn open_read_write(&mut self, path: &str) -> Result<()> {
        let selectable = {
            let state = self.server.lock();
            if state.fail_open.contains(path) {
                return Err(MigrateError::protocol(path, "NO [SERVERBUG] internal error"));
            }
            state.folders.iter().any(|f| f.path == path && !f.no_select)
        };
        if !selectable {
            return Err(MigrateError::protocol(path, "NO mailbox does not exist"));
        }
        self.selected = Some(path.to_string());
        Ok(())
    }

    fn list_messages(&mut self) -> Result<Vec<MessageMeta>> {
        let path = self.selected()?;
        Ok(self
            .server
            .messages(&path)
            .into_iter()
            .map(|m| m.meta)
            .collect())
    }

    fn fetch_message(&mut self, uid: u32) -> Result<Vec<u8>> {
        let path = self.selected()?;
        self.server
            .messages(&path)
            .into_iter()
            .find(|m| m.meta.uid == uid)
            .map(|m| m.content)
            .ok_or_else(|| MigrateError::protocol(&path, format!("no message with UID {}", uid)))
    }

    fn append_message(&mut self, path: &str, content: &[u8], meta: &MessageMeta) -> Result<()> {
        self.server.delay();
        let hook = {
            let mut state = self.server.lock();
            if let Some(limit) = state.fail_append_after {
                if state.appends >= limit {
                    return Err(MigrateError::protocol(path, "NO [OVERQUOTA] quota exceeded"));
                }
            }
            if !state.folders.iter().any(|f| f.path == path && !f.no_select) {
                return Err(MigrateError::protocol(path, "NO [TRYCREATE] no such mailbox"));
            }
            push_message(&mut state, path, meta.clone(), content.to_vec());
            state.appends += 1;
            match &state.after_appends {
                Some((count, hook)) if *count == state.appends => Some(hook.clone()),
                _ => None,
            }
        };
        if let Some(hook) = hook {
            hook();
        }
        Ok(())
    }

    fn close_folder(&mut self) -> Result<()> {
        self.selected = None;
        Ok(())
    }

    fn logout(&mut self) -> Result<()> {
        self.selected = None;
        Ok(())
    }
}

/// Open and high-water session counts for one host, across all users.
#[derive(Default)]
struct SessionGauge {
    open: AtomicUsize,
    peak: AtomicUsize,
}

impl SessionGauge {
    fn enter(&self) {
        let open = self.open.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(open, Ordering::SeqCst);
    }
}

/// Routes connection specs to servers by `host/effective user`.
#[derive(Default)]
pub struct MemoryConnector {
    servers: Mutex<HashMap<String, MemoryServer>>,
    gauges: Mutex<HashMap<String, Arc<SessionGauge>>>,
    connects: AtomicUsize,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, host: &str, user: &str, server: MemoryServer) {
        self.servers
            .lock()
            .unwrap()
            .insert(format!("{}/{}", host, user), server);
    }

    pub fn server(&self, host: &str, user: &str) -> MemoryServer {
        self.servers.lock().unwrap()[&format!("{}/{}", host, user)].clone()
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Most sessions ever open at once against `host`.
    pub fn peak_sessions(&self, host: &str) -> usize {
        self.gauge(host).peak.load(Ordering::SeqCst)
    }

    pub fn open_sessions(&self, host: &str) -> usize {
        self.gauge(host).open.load(Ordering::SeqCst)
    }

    fn gauge(&self, host: &str) -> Arc<SessionGauge> {
        self.gauges
            .lock()
            .unwrap()
            .entry(host.to_string())
            .or_default()
            .clone()
    }
}

impl Connector for MemoryConnector {
    fn connect(&self, spec: &ServerConnectionSpec) -> Result<Box<dyn MailboxConnection>> {
        let key = format!("{}/{}", spec.host, spec.effective_user());
        let server = self
            .servers
            .lock()
            .unwrap()
            .get(&key)
            .cloned()
            .ok_or_else(|| MigrateError::Connection {
                host: spec.host.clone(),
                reason: format!("unknown mailbox {}", key),
            })?;
        let mut connection = server.connect()?;
        self.connects.fetch_add(1, Ordering::SeqCst);
        let gauge = self.gauge(&spec.host);
        gauge.enter();
        connection.gauge = Some(gauge);
        Ok(Box::new(connection))
    }
}

pub fn spec(host: &str, user: &str) -> ServerConnectionSpec {
    ServerConnectionSpec {
        host: host.to_string(),
        port: 993,
        username: "admin".to_string(),
        password: "secret".to_string(),
        use_tls: true,
        proxy_user: Some(user.to_string()),
        admin_mode: AdminLoginMode::Proxyauth,
        connect_timeout: Duration::from_secs(45),
        read_timeout: Duration::from_secs(45),
    }
}

/// An account whose source lives on `old` and destination on `new`.
pub fn account(id: &str) -> Account {
    Account {
        canonical_id: id.to_string(),
        source: spec("old", id),
        destination: spec("new", id),
    }
}

/// Registers fresh source and destination servers for `id`.
pub fn register(
    connector: &MemoryConnector,
    id: &str,
    separator: char,
) -> (MemoryServer, MemoryServer) {
    let source = MemoryServer::new(separator);
    let destination = MemoryServer::new(separator);
    connector.add("old", id, source.clone());
    connector.add("new", id, destination.clone());
    (source, destination)
}
