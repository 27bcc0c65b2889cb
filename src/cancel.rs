use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cooperative shutdown signal shared by the scheduler and every running
/// mirror session. Once cancelled it stays cancelled.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[cfg(unix)]
pub mod signals {
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    /// Runs `on_signal` on a watcher thread after the first SIGINT or
    /// SIGTERM. A second signal exits the process without waiting.
    pub fn on_termination_signal<F>(on_signal: F) -> std::io::Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut signals = Signals::new([SIGINT, SIGTERM])?;
        let mut on_signal = Some(on_signal);

        std::thread::Builder::new()
            .name("signal-watcher".to_string())
            .spawn(move || {
                for signal in signals.forever() {
                    match on_signal.take() {
                        Some(f) => {
                            log::warn!("Signal {} received, shutting down workers", signal);
                            f();
                        }
                        None => {
                            log::error!("Signal {} received again, exiting immediately", signal);
                            std::process::exit(128 + signal);
                        }
                    }
                }
            })?;
        Ok(())
    }
}

#[cfg(not(unix))]
pub mod signals {
    pub fn on_termination_signal<F>(_on_signal: F) -> std::io::Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        log::debug!("Termination signal handling is not available on this platform");
        Ok(())
    }
}
