use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Local;

use crate::error::{MigrateError, Result};

pub const DATE_PLACEHOLDER: &str = "%%DATE%%";

/// Operator-facing log of one program run, shared by all workers.
///
/// Every line is also forwarded to the `log` facade.
pub struct RunLog {
    file: Option<Mutex<File>>,
    path: Option<PathBuf>,
}

impl RunLog {
    /// Creates the log file named by `pattern` (with `%%DATE%%` replaced by the
    /// local start time). An existing file is never overwritten.
    pub fn create(pattern: &str, task: &str) -> Result<Self> {
        let now = Local::now();
        let path = PathBuf::from(pattern.replace(
            DATE_PLACEHOLDER,
            &now.format("%Y%m%d.%H%M%S").to_string(),
        ));

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::AlreadyExists => MigrateError::Io(std::io::Error::new(
                    e.kind(),
                    format!("Will not overwrite existing logfile: {}", path.display()),
                )),
                _ => MigrateError::Io(e),
            })?;

        writeln!(file, "#Program:    imapmigrate")?;
        writeln!(file, "#Started-At: {}", now.to_rfc2822())?;
        writeln!(file, "#Task:       {}", task)?;

        Ok(Self {
            file: Some(Mutex::new(file)),
            path: Some(path),
        })
    }

    /// A run log that only forwards to the `log` facade.
    pub fn sink() -> Self {
        Self {
            file: None,
            path: None,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn info(&self, text: &str) {
        log::info!("{}", text);
        self.write_line("INFO", text);
    }

    pub fn warn(&self, text: &str) {
        log::warn!("{}", text);
        self.write_line("WARNING", text);
    }

    pub fn error(&self, text: &str) {
        log::error!("{}", text);
        self.write_line("ERROR", text);
    }

    fn write_line(&self, level: &str, text: &str) {
        if let Some(file) = &self.file {
            let mut file = match file.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S");
            if let Err(e) = writeln!(file, "[{}] {}: {}", timestamp, level, text) {
                log::warn!("Could not write to run log: {}", e);
            }
        }
    }
}
