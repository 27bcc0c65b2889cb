//! Stable content identifiers for messages.
//!
//! A fingerprint is derived only from protocol metadata (message id, size,
//! internal date and the containing folder), so it can be recomputed on every
//! run without downloading message bodies.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::connection::MessageMeta;
use crate::error::{MigrateError, Result};

/// Metadata recorded alongside every migrated message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageInfo {
    #[serde(rename = "Source-Folder")]
    pub source_folder: String,
    #[serde(rename = "Message-ID")]
    pub message_id: String,
    #[serde(rename = "Size")]
    pub size: u32,
    #[serde(rename = "Internal-Date")]
    pub internal_date_ms: i64,
    #[serde(rename = "Subject", skip_serializing_if = "Option::is_none", default)]
    pub subject: Option<String>,
    #[serde(rename = "Sender", skip_serializing_if = "Option::is_none", default)]
    pub sender: Option<String>,
    #[serde(rename = "Fingerprint")]
    pub fingerprint: String,
}

impl MessageInfo {
    /// Fails only when the message carries no internal date.
    pub fn from_message(meta: &MessageMeta, folder_path: &str) -> Result<Self> {
        let internal_date_ms = meta
            .internal_date
            .map(|date| date.timestamp_millis())
            .ok_or_else(|| MigrateError::MalformedMessage {
                folder: folder_path.to_string(),
                reason: format!("message UID {} has no internal date", meta.uid),
            })?;

        let message_id = match &meta.message_id {
            Some(id) => id.trim().to_lowercase(),
            None => format!(
                "{}|{}|{}",
                meta.subject.as_deref().unwrap_or_default(),
                meta.sender.as_deref().unwrap_or_default(),
                internal_date_ms
            ),
        };

        let fingerprint = digest(&message_id, meta.size, internal_date_ms, folder_path);

        Ok(Self {
            source_folder: folder_path.to_string(),
            message_id,
            size: meta.size,
            internal_date_ms,
            subject: meta.subject.clone(),
            sender: meta.sender.clone(),
            fingerprint,
        })
    }

    pub fn to_payload(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

pub fn fingerprint(meta: &MessageMeta, folder_path: &str) -> Result<String> {
    Ok(MessageInfo::from_message(meta, folder_path)?.fingerprint)
}

fn digest(message_id: &str, size: u32, internal_date_ms: i64, folder_path: &str) -> String {
    let input = format!(
        "{}|{}|{}|{}",
        message_id,
        size,
        internal_date_ms,
        folder_path.trim().to_lowercase()
    );
    format!("{:x}", Sha256::digest(input.as_bytes()))
}

/// One-line description of a message for error reports.
pub fn diagnostics(meta: &MessageMeta) -> String {
    format!(
        "UID: {} Message ID: {} Subject: {} Sender: {} Flags: {}",
        meta.uid,
        meta.message_id.as_deref().unwrap_or("<none>"),
        meta.subject.as_deref().unwrap_or("<none>"),
        meta.sender.as_deref().unwrap_or("<none>"),
        describe_flags(&meta.flags)
    )
}

/// Splits flags into system (`\Seen` -> `SEEN`) and user keywords.
pub fn describe_flags(flags: &[String]) -> String {
    let mut system = Vec::new();
    let mut user = Vec::new();
    for flag in flags {
        match flag.strip_prefix('\\') {
            Some(name) => system.push(name.to_uppercase()),
            None => user.push(flag.as_str()),
        }
    }
    format!("SYS: [{}] USER: [{}]", system.join(" "), user.join(" "))
}
