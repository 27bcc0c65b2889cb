use anyhow::{Context, Result};
use keyring::{Entry, Error as KeyringError};

/// Password lookup in the system keyring, for server logins whose password
/// is left out of the config file.
#[derive(Clone)]
pub struct CredentialManager {
    app_name: String,
}

impl CredentialManager {
    pub fn new() -> Self {
        Self {
            app_name: "imapmigrate".to_string(),
        }
    }

    fn entry(&self, server_role: &str, login: &str) -> Result<Entry> {
        let service = format!("{}-{}", self.app_name, server_role);
        Entry::new(&service, login).context("Failed to create keyring entry")
    }

    /// Store a password for `login` on the `source` or `destination` server.
    pub fn store_password(&self, server_role: &str, login: &str, password: &str) -> Result<()> {
        self.entry(server_role, login)?
            .set_password(password)
            .context("Failed to store password in keyring")?;

        log::debug!("Password stored securely for {} ({})", login, server_role);
        Ok(())
    }

    pub fn get_password(&self, server_role: &str, login: &str) -> Result<Option<String>> {
        match self.entry(server_role, login)?.get_password() {
            Ok(password) => Ok(Some(password)),
            Err(KeyringError::NoEntry) => Ok(None),
            Err(e) => Err(anyhow::anyhow!("Failed to retrieve password: {}", e)),
        }
    }
}

impl Default for CredentialManager {
    fn default() -> Self {
        Self::new()
    }
}
