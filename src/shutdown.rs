//! SIGINT/SIGTERM turned into a stop flag
//!
//! The signals are blocked in the installing thread, which every thread
//! spawned afterwards inherits, and collected synchronously by a watcher
//! thread. A second signal exits the process immediately.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::error::Result;

#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    requested: Arc<AtomicBool>,
}

impl ShutdownSignal {
    /// Flag that is only raised through [`ShutdownSignal::request`]
    pub fn manual() -> Self {
        Self::default()
    }

    /// Watch SIGINT and SIGTERM. Call before any stream thread is spawned.
    #[cfg(unix)]
    pub fn install() -> Result<Self> {
        use nix::sys::signal::{SigSet, Signal};

        let mut set = SigSet::empty();
        set.add(Signal::SIGINT);
        set.add(Signal::SIGTERM);
        set.thread_block().map_err(std::io::Error::from)?;

        let shutdown = Self::manual();
        let flag = shutdown.requested.clone();
        thread::Builder::new()
            .name("signal-watch".into())
            .spawn(move || loop {
                match set.wait() {
                    Ok(signal) if flag.swap(true, Ordering::SeqCst) => {
                        tracing::warn!("Second {:?}, exiting", signal);
                        std::process::exit(130);
                    }
                    Ok(signal) => tracing::info!("Received {:?}, stopping", signal),
                    Err(e) => {
                        tracing::error!("Signal wait failed: {}", e);
                        return;
                    }
                }
            })?;
        Ok(shutdown)
    }

    #[cfg(not(unix))]
    pub fn install() -> Result<Self> {
        Ok(Self::manual())
    }

    pub fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Poll until a stop is requested or `done` reports true. Returns true
    /// when the exit was requested rather than reached.
    pub fn wait_until<F>(&self, poll: Duration, mut done: F) -> bool
    where
        F: FnMut() -> bool,
    {
        loop {
            if self.is_requested() {
                return true;
            }
            if done() {
                return false;
            }
            thread::sleep(poll);
        }
    }
}
