use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::config::{AdminLoginMode, Config, ConfigError, ServerSettings};
use crate::credentials::CredentialManager;
use crate::error::{MigrateError, Result};

/// One parsed line of the accounts file: `canonical|sourceUser|destinationUser`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountListLine {
    pub canonical_id: String,
    pub source_user: String,
    pub destination_user: String,
}

impl AccountListLine {
    /// Returns `Ok(None)` for blank and comment-only lines.
    pub fn parse(line: &str) -> std::result::Result<Option<Self>, String> {
        let content = match line.find('#') {
            Some(pos) => &line[..pos],
            None => line,
        };
        let content = content.trim();
        if content.is_empty() {
            return Ok(None);
        }

        let terms: Vec<&str> = content.split('|').map(str::trim).collect();
        if terms.len() != 3 || terms.iter().any(|t| t.is_empty()) {
            return Err(format!("Malformed input line: {}", line));
        }

        Ok(Some(Self {
            canonical_id: terms[0].to_string(),
            source_user: terms[1].to_string(),
            destination_user: terms[2].to_string(),
        }))
    }
}

pub fn parse_account_list(content: &str) -> Result<Vec<AccountListLine>> {
    let mut seen = HashSet::new();
    let mut lines = Vec::new();

    for (index, raw) in content.lines().enumerate() {
        let line = AccountListLine::parse(raw)
            .map_err(|e| MigrateError::AccountList(format!("line {}: {}", index + 1, e)))?;
        if let Some(line) = line {
            if !seen.insert(line.canonical_id.clone()) {
                return Err(MigrateError::AccountList(format!(
                    "Duplicate username ({}) in account list file",
                    line.canonical_id
                )));
            }
            lines.push(line);
        }
    }

    if lines.is_empty() {
        return Err(MigrateError::AccountList(
            "Account list file contained no entries".to_string(),
        ));
    }
    Ok(lines)
}

pub fn load_account_list(path: &Path) -> Result<Vec<AccountListLine>> {
    let content = fs::read_to_string(path).map_err(|e| {
        MigrateError::AccountList(format!("Could not read account list file {:?}: {}", path, e))
    })?;
    parse_account_list(&content)
}

/// Everything needed to open one protocol session against one server.
#[derive(Clone)]
pub struct ServerConnectionSpec {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub use_tls: bool,
    /// When set, `username`/`password` are the admin identity and all folder
    /// operations run as this user.
    pub proxy_user: Option<String>,
    pub admin_mode: AdminLoginMode,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
}

impl ServerConnectionSpec {
    /// The identity whose mailbox is being read or written.
    pub fn effective_user(&self) -> &str {
        self.proxy_user.as_deref().unwrap_or(&self.username)
    }
}

impl fmt::Debug for ServerConnectionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConnectionSpec")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("use_tls", &self.use_tls)
            .field("proxy_user", &self.proxy_user)
            .field("admin_mode", &self.admin_mode)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct Account {
    pub canonical_id: String,
    pub source: ServerConnectionSpec,
    pub destination: ServerConnectionSpec,
}

/// Builds per-account connection specs for one side of the migration.
pub struct SpecResolver {
    role: &'static str,
    settings: ServerSettings,
    connect_timeout: Duration,
    read_timeout: Duration,
    admin_password: Option<String>,
    credentials: CredentialManager,
}

impl SpecResolver {
    pub fn new(
        role: &'static str,
        settings: ServerSettings,
        connect_timeout: Duration,
        read_timeout: Duration,
        credentials: CredentialManager,
    ) -> std::result::Result<Self, ConfigError> {
        let admin_password = match &settings.admin {
            Some(admin) => Some(match &admin.password {
                Some(password) => password.clone(),
                None => lookup_password(&credentials, role, &admin.username)?,
            }),
            None => None,
        };

        Ok(Self {
            role,
            settings,
            connect_timeout,
            read_timeout,
            admin_password,
            credentials,
        })
    }

    pub fn resolve(&self, user: &str) -> std::result::Result<ServerConnectionSpec, ConfigError> {
        let login = self.settings.login_for(user);
        let (username, password, proxy_user, admin_mode) =
            match (&self.settings.admin, &self.admin_password) {
                (Some(admin), Some(admin_password)) => (
                    admin.username.clone(),
                    admin_password.clone(),
                    Some(login),
                    admin.mode,
                ),
                _ => {
                    let password = match &self.settings.password {
                        Some(password) => password.clone(),
                        None => lookup_password(&self.credentials, self.role, &login)?,
                    };
                    (login, password, None, AdminLoginMode::default())
                }
            };

        Ok(ServerConnectionSpec {
            host: self.settings.hostname.clone(),
            port: self.settings.port(),
            username,
            password,
            use_tls: self.settings.use_tls,
            proxy_user,
            admin_mode,
            connect_timeout: self.connect_timeout,
            read_timeout: self.read_timeout,
        })
    }
}

fn lookup_password(
    credentials: &CredentialManager,
    role: &str,
    login: &str,
) -> std::result::Result<String, ConfigError> {
    match credentials.get_password(role, login) {
        Ok(Some(password)) => Ok(password),
        Ok(None) => Err(ConfigError::Password {
            login: login.to_string(),
            reason: "no keyring entry".to_string(),
        }),
        Err(e) => Err(ConfigError::Password {
            login: login.to_string(),
            reason: e.to_string(),
        }),
    }
}

/// Resolves every account-list line into an `Account`, preserving file order.
pub fn resolve_accounts(
    config: &Config,
    lines: &[AccountListLine],
    credentials: &CredentialManager,
) -> Result<Vec<Account>> {
    let source = SpecResolver::new(
        "source",
        config.source.clone(),
        config.connect_timeout(),
        config.read_timeout(),
        credentials.clone(),
    )?;
    let destination = SpecResolver::new(
        "destination",
        config.destination.clone(),
        config.connect_timeout(),
        config.read_timeout(),
        credentials.clone(),
    )?;

    lines
        .iter()
        .map(|line| -> Result<Account> {
            Ok(Account {
                canonical_id: line.canonical_id.clone(),
                source: source.resolve(&line.source_user)?,
                destination: destination.resolve(&line.destination_user)?,
            })
        })
        .collect()
}
