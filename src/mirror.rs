//! Per-account mailbox mirroring.
//!
//! A session walks the source folder tree depth-first, current folder before
//! its children, and appends every message whose fingerprint is not yet
//! recorded for the account. Each copy is recorded durably right after the
//! append, so an aborted session resumes where it stopped.

use std::collections::HashSet;

use chrono::Local;

use crate::cancel::CancellationToken;
use crate::connection::{MailboxConnection, MessageMeta};
use crate::error::Result;
use crate::fingerprint::{self, MessageInfo};
use crate::folders::{FolderMap, FolderNode};
use crate::store::TrackingStore;

/// System name used for the durable log trail.
pub const LOG_SYSTEM: &str = "imapsync";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MirrorReport {
    pub copied: u64,
    pub skipped: u64,
    /// The whole tree was walked without a shutdown request.
    pub completed_fully: bool,
    pub error_summary: Option<String>,
}

pub struct MailboxMirror<'a> {
    account_id: &'a str,
    source: &'a mut dyn MailboxConnection,
    destination: &'a mut dyn MailboxConnection,
    store: &'a dyn TrackingStore,
    folder_map: &'a FolderMap,
    cancel: CancellationToken,
    done: HashSet<String>,
    copied: u64,
    skipped: u64,
    interrupted: bool,
    completed_fully: bool,
    error_summary: Option<String>,
}

impl<'a> MailboxMirror<'a> {
    /// `done_fingerprints` seeds the session's dedup cache; it is owned by
    /// the session and grows as messages are copied.
    pub fn new(
        account_id: &'a str,
        source: &'a mut dyn MailboxConnection,
        destination: &'a mut dyn MailboxConnection,
        store: &'a dyn TrackingStore,
        done_fingerprints: HashSet<String>,
        folder_map: &'a FolderMap,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            account_id,
            source,
            destination,
            store,
            folder_map,
            cancel,
            done: done_fingerprints,
            copied: 0,
            skipped: 0,
            interrupted: false,
            completed_fully: false,
            error_summary: None,
        }
    }

    /// Counts so far. After a failed `run` this also carries the error summary.
    pub fn report(&self) -> MirrorReport {
        MirrorReport {
            copied: self.copied,
            skipped: self.skipped,
            completed_fully: self.completed_fully,
            error_summary: self.error_summary.clone(),
        }
    }

    pub fn run(&mut self) -> Result<MirrorReport> {
        self.log("INFO: Starting IMAPSync Session");
        self.log(&format!(
            "INFO: Found {} entries in migration cache",
            self.done.len()
        ));

        match self.mirror() {
            Ok(()) => {
                self.log("INFO: Done with IMAPSync Session");
                Ok(self.report())
            }
            Err(e) => {
                self.log(&format!("ERROR: IMAPSync failed: {}", e));
                self.error_summary = Some(format!(
                    "IMAP Sync Failed (@ {}): {}",
                    Local::now().to_rfc2822(),
                    e
                ));
                Err(e)
            }
        }
    }

    fn mirror(&mut self) -> Result<()> {
        let source_root = FolderNode::root(self.source.separator()?);
        let destination_root = FolderNode::root(self.destination.separator()?);

        self.mirror_folder(&source_root, &destination_root)?;

        if !self.interrupted {
            self.completed_fully = true;
        }
        Ok(())
    }

    /// Returns true, and logs once, when a shutdown has been requested.
    fn shutdown_requested(&mut self) -> bool {
        if !self.cancel.is_cancelled() {
            return false;
        }
        if !self.interrupted {
            self.interrupted = true;
            self.log("INFO: Terminating early due to shutdown request.");
        }
        true
    }

    fn mirror_folder(&mut self, source: &FolderNode, destination: &FolderNode) -> Result<()> {
        if self.shutdown_requested() {
            return Ok(());
        }

        if !source.is_root() {
            self.ensure_destination(&destination.path);

            match self.source.open_read_only(source) {
                Ok(()) => {}
                Err(e) if e.is_no_select() => {
                    self.log(&format!(
                        "WARNING: Source directory '{}' cannot contain messages.  Skipping.",
                        source.path
                    ));
                    return self.mirror_children(source, destination);
                }
                Err(e) => {
                    self.log(&format!(
                        "ERROR: Could not open source directory '{}': {}",
                        source.path, e
                    ));
                    return Err(e);
                }
            }

            if let Err(e) = self.destination.open_read_write(&destination.path) {
                self.log(&format!(
                    "ERROR: Could not open destination directory '{}': {}",
                    destination.path, e
                ));
                self.close_folders();
                return Err(e);
            }

            let result = self.copy_messages(source, destination);
            self.close_folders();
            if !result? {
                return Ok(());
            }
        }

        self.mirror_children(source, destination)
    }

    fn mirror_children(&mut self, source: &FolderNode, destination: &FolderNode) -> Result<()> {
        let children = self.source.list_children(source).map_err(|e| {
            self.log(&format!(
                "ERROR: Could not list children of '{}': {}",
                source.path, e
            ));
            e
        })?;

        for child in children {
            if self.shutdown_requested() {
                return Ok(());
            }

            match self.folder_map.map_name(&child.name, destination.separator) {
                Some(name) => {
                    let path = destination.child_path(&name);
                    let child_destination = FolderNode::new(&path, destination.separator, false);
                    self.mirror_folder(&child, &child_destination)?;
                }
                None => {
                    self.log(&format!(
                        "INFO: Not mirroring '{}', descending into its children",
                        child.path
                    ));
                    self.mirror_children(&child, destination)?;
                }
            }
        }
        Ok(())
    }

    /// Creation failures are only warned about; opening the folder afterwards
    /// is what fails the session.
    fn ensure_destination(&mut self, path: &str) {
        match self.destination.folder_exists(path) {
            Ok(true) => {}
            Ok(false) => match self.destination.create_folder(path) {
                Ok(true) => self.log(&format!("INFO: Created destination directory '{}'", path)),
                Ok(false) => {}
                Err(e) => self.log(&format!(
                    "WARNING: Could not create destination directory '{}', but wanted to: {}",
                    path, e
                )),
            },
            Err(e) => self.log(&format!(
                "WARNING: Could not check destination directory '{}': {}",
                path, e
            )),
        }
    }

    /// Returns false if a shutdown request stopped the copy early.
    fn copy_messages(&mut self, source: &FolderNode, destination: &FolderNode) -> Result<bool> {
        let mut local_copied = 0u64;
        let mut local_skipped = 0u64;

        self.log(&format!(
            "INFO: Copying '{}' --> '{}'",
            source.path, destination.path
        ));

        let messages = self.source.list_messages().map_err(|e| {
            self.log(&format!(
                "ERROR: Could not list messages in '{}': {}",
                source.path, e
            ));
            e
        })?;

        for meta in &messages {
            if self.shutdown_requested() {
                self.log(&format!(
                    "INFO: Copied {} Skipped {}",
                    local_copied, local_skipped
                ));
                return Ok(false);
            }

            match self.copy_message(source, destination, meta) {
                Ok(true) => local_copied += 1,
                Ok(false) => local_skipped += 1,
                Err(e) => {
                    self.log(&format!(
                        "INFO: Copied {} Skipped {} before this error.",
                        local_copied, local_skipped
                    ));
                    self.log(&format!("ERROR: {}", e));
                    self.log(&format!("TRACE: Message Info: {}", fingerprint::diagnostics(meta)));
                    return Err(e);
                }
            }
        }

        self.log(&format!(
            "INFO: Copied {} Skipped {}",
            local_copied, local_skipped
        ));
        Ok(true)
    }

    /// Returns true if the message was copied, false if it was already migrated.
    fn copy_message(
        &mut self,
        source: &FolderNode,
        destination: &FolderNode,
        meta: &MessageMeta,
    ) -> Result<bool> {
        let info = MessageInfo::from_message(meta, &source.path).map_err(|e| {
            log::error!(
                "[{}] Malformed message in '{}': {}",
                self.account_id,
                source.path,
                fingerprint::diagnostics(meta)
            );
            e
        })?;

        if self.done.contains(&info.fingerprint) {
            self.skipped += 1;
            return Ok(false);
        }

        let content = self.source.fetch_message(meta.uid)?;
        self.destination
            .append_message(&destination.path, &content, meta)?;
        self.done.insert(info.fingerprint.clone());
        self.store
            .record_migration(self.account_id, &info.fingerprint, meta.size, &info.to_payload()?)?;
        self.copied += 1;
        Ok(true)
    }

    fn close_folders(&mut self) {
        if let Err(e) = self.source.close_folder() {
            log::debug!("[{}] Closing source folder failed: {}", self.account_id, e);
        }
        if let Err(e) = self.destination.close_folder() {
            log::debug!("[{}] Closing destination folder failed: {}", self.account_id, e);
        }
    }

    fn log(&self, message: &str) {
        log::debug!("[{}] {}", self.account_id, message);
        if let Err(e) = self.store.append_log(LOG_SYSTEM, self.account_id, message) {
            log::warn!(
                "[{}] Could not write to tracking store log, continuing: {}",
                self.account_id,
                e
            );
        }
    }
}
