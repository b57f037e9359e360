//! Stream threads: ingest (listener) and egress (talker)
//!
//! Each running loop is owned by a [`StreamHandle`]: a stop flag checked once
//! per iteration, the join handle, and a completion signal that fires when the
//! thread has released its socket and buffers.

pub mod egress;
pub mod ingest;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::config::{SchedPolicy, SchedulingConfig};
use crate::error::Result;

pub use egress::{EgressOptions, EgressStats, EgressWorker, StreamEgress};
pub use ingest::{
    ChannelSink, FileSink, IngestOptions, IngestState, IngestStats, PayloadSink, ReceivedPayload,
    StreamContext, StreamIngest, WriterSink,
};

/// Cloneable view of a stream's stop flag, handed to the loop body
#[derive(Debug, Clone)]
pub struct StopSignal {
    running: Arc<AtomicBool>,
}

impl StopSignal {
    pub fn is_stopped(&self) -> bool {
        !self.running.load(Ordering::Relaxed)
    }
}

/// Owner of one stream thread
pub struct StreamHandle<T> {
    name: String,
    running: Arc<AtomicBool>,
    /// Disconnects when the thread exits
    done_rx: Receiver<()>,
    thread_handle: Option<JoinHandle<T>>,
}

impl<T: Send + 'static> StreamHandle<T> {
    /// Spawn `body` on a named thread with the requested scheduling class.
    /// The body must return soon after its [`StopSignal`] reports stopped.
    pub fn spawn<F>(name: &str, scheduling: SchedulingConfig, body: F) -> Result<Self>
    where
        F: FnOnce(StopSignal) -> T + Send + 'static,
    {
        let running = Arc::new(AtomicBool::new(true));
        let signal = StopSignal {
            running: running.clone(),
        };
        let (done_tx, done_rx) = bounded::<()>(0);

        let thread_name = name.to_string();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let _done: Sender<()> = done_tx;
                if let Err(e) = apply_scheduling(&scheduling) {
                    tracing::warn!(
                        "{}: could not apply {:?} scheduling: {}",
                        thread_name,
                        scheduling.policy,
                        e
                    );
                }
                body(signal)
            })?;

        tracing::info!("Started stream thread {}", name);
        Ok(Self {
            name: name.to_string(),
            running,
            done_rx,
            thread_handle: Some(handle),
        })
    }
}

impl<T> StreamHandle<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// True until a stop is requested
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// True once the thread body has returned
    pub fn is_finished(&self) -> bool {
        matches!(
            self.done_rx.try_recv(),
            Err(crossbeam_channel::TryRecvError::Disconnected)
        )
    }

    /// Ask the loop to exit without waiting
    pub fn request_stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Wait for the thread to finish; false on timeout
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        matches!(
            self.done_rx.recv_timeout(timeout),
            Err(RecvTimeoutError::Disconnected)
        )
    }

    /// Block until the thread body returns on its own
    pub fn wait(&self) {
        let _ = self.done_rx.recv();
    }

    /// Stop the loop and join the thread. Returns the loop's result the first
    /// time; later calls are no-ops returning `None`.
    pub fn stop(&mut self) -> Option<T> {
        self.request_stop();
        let handle = self.thread_handle.take()?;
        match handle.join() {
            Ok(result) => {
                tracing::info!("Stopped stream thread {}", self.name);
                Some(result)
            }
            Err(_) => {
                tracing::error!("Stream thread {} panicked", self.name);
                None
            }
        }
    }
}

impl<T> Drop for StreamHandle<T> {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Switch the calling thread to the configured scheduling class
pub fn apply_scheduling(scheduling: &SchedulingConfig) -> std::io::Result<()> {
    if scheduling.policy == SchedPolicy::Other {
        return Ok(());
    }
    set_scheduler(scheduling)
}

#[cfg(target_os = "linux")]
fn set_scheduler(scheduling: &SchedulingConfig) -> std::io::Result<()> {
    use nix::libc;

    let policy = match scheduling.policy {
        SchedPolicy::Fifo => libc::SCHED_FIFO,
        SchedPolicy::Rr => libc::SCHED_RR,
        SchedPolicy::Other => libc::SCHED_OTHER,
    };
    // SAFETY: sched_param is plain data; zero is a valid initial value.
    let mut param: libc::sched_param = unsafe { std::mem::zeroed() };
    param.sched_priority = scheduling.priority as libc::c_int;
    // SAFETY: pid 0 targets the calling thread; `param` outlives the call.
    let rc = unsafe { libc::sched_setscheduler(0, policy, &param) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    tracing::debug!(
        "Scheduling set to {:?} priority {}",
        scheduling.policy,
        scheduling.priority
    );
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn set_scheduler(_scheduling: &SchedulingConfig) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "real-time scheduling is only supported on Linux",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_stop_returns_result_once() {
        let mut handle = StreamHandle::spawn("test-loop", SchedulingConfig::default(), |stop| {
            let mut spins = 0u64;
            while !stop.is_stopped() {
                spins += 1;
                thread::sleep(Duration::from_millis(1));
            }
            spins
        })
        .unwrap();

        assert!(handle.is_running());
        thread::sleep(Duration::from_millis(10));
        assert!(handle.stop().is_some());
        assert!(!handle.is_running());
        assert!(handle.is_finished());
        assert_eq!(handle.stop(), None);
    }

    #[test]
    fn test_wait_timeout_sees_completion() {
        let handle =
            StreamHandle::spawn("test-short", SchedulingConfig::default(), |_stop| 7u8).unwrap();
        assert!(handle.wait_timeout(Duration::from_secs(1)));
        assert!(handle.is_finished());
    }

    #[test]
    fn test_request_stop_bounded_by_poll() {
        let handle = StreamHandle::spawn("test-poll", SchedulingConfig::default(), |stop| {
            while !stop.is_stopped() {
                thread::sleep(Duration::from_millis(20));
            }
        })
        .unwrap();

        let start = Instant::now();
        handle.request_stop();
        assert!(handle.wait_timeout(Duration::from_secs(1)));
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn test_default_scheduling_is_noop() {
        apply_scheduling(&SchedulingConfig::default()).unwrap();
    }
}
