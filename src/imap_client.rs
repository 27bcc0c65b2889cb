use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use imap::types::{Flag, NameAttribute};
use imap::{Authenticator, Client, Session};
use native_tls::{TlsConnector, TlsStream};

use crate::accounts::ServerConnectionSpec;
use crate::config::AdminLoginMode;
use crate::connection::{Connector, MailboxConnection, MessageMeta};
use crate::error::{MigrateError, Result};
use crate::folders::FolderNode;

const LIST_QUERY: &str = "(UID RFC822.SIZE INTERNALDATE FLAGS BODY.PEEK[HEADER])";

/// Plain or TLS socket, so one `Session` type serves both.
pub enum Transport {
    Plain(TcpStream),
    Tls(TlsStream<TcpStream>),
}

impl Read for Transport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Transport::Plain(stream) => stream.read(buf),
            Transport::Tls(stream) => stream.read(buf),
        }
    }
}

impl Write for Transport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Transport::Plain(stream) => stream.write(buf),
            Transport::Tls(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Transport::Plain(stream) => stream.flush(),
            Transport::Tls(stream) => stream.flush(),
        }
    }
}

/// SASL PLAIN with a separate authorization identity.
struct PlainAuthenticator<'a> {
    authzid: &'a str,
    authcid: &'a str,
    password: &'a str,
}

impl Authenticator for PlainAuthenticator<'_> {
    type Response = String;

    fn process(&self, _challenge: &[u8]) -> Self::Response {
        format!("{}\0{}\0{}", self.authzid, self.authcid, self.password)
    }
}

/// Tries each resolved address in turn and keeps the last error.
fn connect_any<I>(addrs: I, timeout: Duration) -> io::Result<TcpStream>
where
    I: IntoIterator<Item = SocketAddr>,
{
    let mut last_error = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                log::debug!("Connecting to {} failed: {}", addr, e);
                last_error = Some(e);
            }
        }
    }
    Err(last_error.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::NotFound, "host name did not resolve")
    }))
}

pub struct ImapConnection {
    session: Session<Transport>,
    host: String,
    separator: Option<char>,
    selected: Option<String>,
    selected_exists: u32,
    can_unselect: bool,
}

impl ImapConnection {
    pub fn connect(spec: &ServerConnectionSpec) -> Result<Self> {
        let fail = |reason: String| MigrateError::Connection {
            host: spec.host.clone(),
            reason,
        };

        let addrs = (spec.host.as_str(), spec.port)
            .to_socket_addrs()
            .map_err(|e| fail(e.to_string()))?;
        let tcp_stream =
            connect_any(addrs, spec.connect_timeout).map_err(|e| fail(e.to_string()))?;
        tcp_stream.set_read_timeout(Some(spec.read_timeout))?;
        tcp_stream.set_write_timeout(Some(spec.read_timeout))?;

        let transport = if spec.use_tls {
            let tls = TlsConnector::builder().build()?;
            let stream = tls
                .connect(&spec.host, tcp_stream)
                .map_err(|e| fail(format!("TLS handshake failed: {}", e)))?;
            Transport::Tls(stream)
        } else {
            Transport::Plain(tcp_stream)
        };

        let mut client = Client::new(transport);
        client
            .read_greeting()
            .map_err(|e| fail(format!("no greeting: {}", e)))?;

        let mut session = match (&spec.proxy_user, spec.admin_mode) {
            (Some(user), AdminLoginMode::SaslPlain) => {
                let auth = PlainAuthenticator {
                    authzid: user,
                    authcid: &spec.username,
                    password: &spec.password,
                };
                client
                    .authenticate("PLAIN", &auth)
                    .map_err(|e| fail(format!("authentication failed: {}", e.0)))?
            }
            _ => client
                .login(&spec.username, &spec.password)
                .map_err(|e| fail(format!("login failed: {}", e.0)))?,
        };

        if let (Some(user), AdminLoginMode::Proxyauth) = (&spec.proxy_user, spec.admin_mode) {
            session
                .run_command_and_check_ok(&format!("PROXYAUTH {}", quote(user)))
                .map_err(|e| fail(format!("PROXYAUTH as {} failed: {}", user, e)))?;
        }

        let can_unselect = session
            .capabilities()
            .map(|caps| caps.has_str("UNSELECT"))
            .unwrap_or(false);

        log::debug!(
            "Connected to {}:{} as {} (unselect: {})",
            spec.host,
            spec.port,
            spec.effective_user(),
            can_unselect
        );

        Ok(Self {
            session,
            host: spec.host.clone(),
            separator: None,
            selected: None,
            selected_exists: 0,
            can_unselect,
        })
    }
}

fn parse_fetch(fetch: &imap::types::Fetch, folder: &str) -> Result<MessageMeta> {
    let uid = fetch.uid.ok_or_else(|| {
        MigrateError::protocol(folder, format!("message {} returned without UID", fetch.message))
    })?;

    let flags = fetch.flags().iter().map(|f| f.to_string()).collect();

    let (message_id, subject, sender) = match fetch.header().and_then(mail_parser::Message::parse) {
        Some(parsed) => (
            parsed.message_id().map(str::to_string),
            parsed.subject().map(str::to_string),
            first_address(parsed.from()),
        ),
        None => (None, None, None),
    };

    Ok(MessageMeta {
        uid,
        message_id,
        subject,
        sender,
        size: fetch.size.unwrap_or(0),
        internal_date: fetch.internal_date(),
        flags,
    })
}

fn first_address(value: &mail_parser::HeaderValue) -> Option<String> {
    match value {
        mail_parser::HeaderValue::Address(addr) => addr.address.as_ref().map(|s| s.to_string()),
        mail_parser::HeaderValue::AddressList(addrs) => addrs
            .iter()
            .find_map(|addr| addr.address.as_ref().map(|s| s.to_string())),
        _ => None,
    }
}

/// Quotes a mailbox name or pattern as an IMAP quoted string.
fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

fn is_container_error(reason: &str) -> bool {
    let reason = reason.to_lowercase();
    reason.contains("cannot contain messages")
        || reason.contains("noselect")
        || reason.contains("not selectable")
}

impl MailboxConnection for ImapConnection {
    fn separator(&mut self) -> Result<char> {
        if let Some(separator) = self.separator {
            return Ok(separator);
        }
        let names = self
            .session
            .list(Some(""), Some("\"\""))
            .map_err(|e| MigrateError::protocol("", e))?;
        let separator = names
            .iter()
            .filter_map(|name| name.delimiter())
            .find_map(|d| d.chars().next())
            .unwrap_or('/');
        self.separator = Some(separator);
        Ok(separator)
    }

    fn list_children(&mut self, parent: &FolderNode) -> Result<Vec<FolderNode>> {
        let pattern = if parent.is_root() {
            "%".to_string()
        } else {
            format!("{}{}%", parent.path, parent.separator)
        };

        let names = self
            .session
            .list(Some(""), Some(quote(&pattern).as_str()))
            .map_err(|e| MigrateError::protocol(&parent.path, e))?;

        let children = names
            .iter()
            .filter(|name| name.name() != parent.path)
            .map(|name| {
                let separator = name
                    .delimiter()
                    .and_then(|d| d.chars().next())
                    .unwrap_or(parent.separator);
                let no_select = name
                    .attributes()
                    .iter()
                    .any(|attr| matches!(attr, NameAttribute::NoSelect));
                FolderNode::new(name.name(), separator, no_select)
            })
            .collect();
        Ok(children)
    }

    fn folder_exists(&mut self, path: &str) -> Result<bool> {
        let names = self
            .session
            .list(Some(""), Some(quote(path).as_str()))
            .map_err(|e| MigrateError::protocol(path, e))?;
        Ok(!names.is_empty())
    }

    fn create_folder(&mut self, path: &str) -> Result<bool> {
        match self.session.create(path) {
            Ok(()) => Ok(true),
            Err(e) if e.to_string().to_lowercase().contains("already exists") => Ok(false),
            Err(e) => Err(MigrateError::protocol(path, e)),
        }
    }

    fn open_read_only(&mut self, folder: &FolderNode) -> Result<()> {
        if folder.no_select {
            return Err(MigrateError::NoSelect {
                folder: folder.path.clone(),
            });
        }
        match self.session.examine(&folder.path) {
            Ok(mailbox) => {
                self.selected = Some(folder.path.clone());
                self.selected_exists = mailbox.exists;
                Ok(())
            }
            Err(e) if is_container_error(&e.to_string()) => Err(MigrateError::NoSelect {
                folder: folder.path.clone(),
            }),
            Err(e) => Err(MigrateError::protocol(&folder.path, e)),
        }
    }

    fn open_read_write(&mut self, path: &str) -> Result<()> {
        let mailbox = self
            .session
            .select(path)
            .map_err(|e| MigrateError::protocol(path, e))?;
        self.selected = Some(path.to_string());
        self.selected_exists = mailbox.exists;
        Ok(())
    }

    fn list_messages(&mut self) -> Result<Vec<MessageMeta>> {
        let folder = self.selected.clone().unwrap_or_default();
        if self.selected_exists == 0 {
            return Ok(Vec::new());
        }

        let fetches = self
            .session
            .fetch("1:*", LIST_QUERY)
            .map_err(|e| MigrateError::protocol(&folder, e))?;

        let mut ordered: Vec<&imap::types::Fetch> = fetches.iter().collect();
        ordered.sort_by_key(|fetch| fetch.message);

        ordered
            .into_iter()
            .map(|fetch| parse_fetch(fetch, &folder))
            .collect()
    }

    fn fetch_message(&mut self, uid: u32) -> Result<Vec<u8>> {
        let folder = self.selected.clone().unwrap_or_default();
        let fetches = self
            .session
            .uid_fetch(uid.to_string(), "BODY.PEEK[]")
            .map_err(|e| MigrateError::protocol(&folder, e))?;

        fetches
            .iter()
            .find_map(|fetch| fetch.body())
            .map(|body| body.to_vec())
            .ok_or_else(|| {
                MigrateError::protocol(&folder, format!("server returned no body for UID {}", uid))
            })
    }

    fn append_message(&mut self, path: &str, content: &[u8], meta: &MessageMeta) -> Result<()> {
        let flags: Vec<Flag> = meta
            .flags
            .iter()
            .filter(|flag| !flag.eq_ignore_ascii_case("\\Recent"))
            .map(|flag| Flag::from(flag.clone()))
            .collect();

        self.session
            .append_with_flags_and_date(path, content, &flags, meta.internal_date)
            .map_err(|e| MigrateError::protocol(path, e))
    }

    fn close_folder(&mut self) -> Result<()> {
        let folder = match self.selected.take() {
            Some(folder) => folder,
            None => return Ok(()),
        };
        self.selected_exists = 0;
        // Without UNSELECT the next SELECT/EXAMINE deselects; CLOSE would expunge.
        if self.can_unselect {
            self.session
                .run_command_and_check_ok("UNSELECT")
                .map_err(|e| MigrateError::protocol(&folder, e))?;
        }
        Ok(())
    }

    fn logout(&mut self) -> Result<()> {
        self.session.logout().map_err(|e| MigrateError::Connection {
            host: self.host.clone(),
            reason: format!("logout failed: {}", e),
        })
    }
}

/// Connects to real IMAP servers.
pub struct ImapConnector;

impl Connector for ImapConnector {
    fn connect(&self, spec: &ServerConnectionSpec) -> Result<Box<dyn MailboxConnection>> {
        Ok(Box::new(ImapConnection::connect(spec)?))
    }
}
