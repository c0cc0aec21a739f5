//! Background workers: relay, cleanup loop, consumer runtime.
//!
//! Every worker is a named OS thread with an mpsc shutdown channel. The
//! channel doubles as the worker's timer: `recv_timeout(interval)` returns
//! early on shutdown.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::Duration;

pub mod cleanup;
pub mod consumer;
pub mod relay;

pub use cleanup::{CleanupConfig, CleanupLoop, CleanupStats};
pub use consumer::{ConsumerConfig, ConsumerHandle, ConsumerStats, ConsumerWorker, member_name};
pub use relay::{Relay, RelayConfig, RelayCycle, RelayStats};

/// Handle to control and join a background worker.
///
/// Stopping is idempotent. Dropping the handle stops the worker.
#[derive(Debug)]
pub struct WorkerHandle {
    name: String,
    shutdown: Mutex<Option<Sender<()>>>,
    join: Mutex<Option<thread::JoinHandle<()>>>,
}

impl WorkerHandle {
    /// Spawn `body` on a named thread. `body` receives the shutdown receiver.
    pub(crate) fn spawn<F>(name: impl Into<String>, body: F) -> std::io::Result<Self>
    where
        F: FnOnce(Receiver<()>) + Send + 'static,
    {
        let name = name.into();
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let join = thread::Builder::new()
            .name(name.clone())
            .spawn(move || body(shutdown_rx))?;

        Ok(Self {
            name,
            shutdown: Mutex::new(Some(shutdown_tx)),
            join: Mutex::new(Some(join)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ask the worker to stop without waiting for it.
    pub fn signal(&self) {
        let sender = self
            .shutdown
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(tx) = sender {
            let _ = tx.send(());
        }
    }

    /// Request graceful shutdown and wait for the worker to stop.
    ///
    /// Called from the worker's own thread (e.g. inside a handler) this only
    /// signals; the worker exits once the current step returns.
    pub fn stop(&self) {
        self.signal();

        let mut join = self.join.lock().unwrap_or_else(PoisonError::into_inner);
        let own_thread = join
            .as_ref()
            .is_some_and(|j| j.thread().id() == thread::current().id());
        if own_thread {
            return;
        }
        if let Some(j) = join.take() {
            if j.join().is_err() {
                tracing::error!(worker = %self.name, "worker thread panicked");
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.join
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_none_or(|j| j.is_finished())
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Outcome of waiting for the next tick.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Tick {
    Run,
    Stop,
}

/// Sleep for `interval` or until shutdown is requested.
pub(crate) fn wait_tick(shutdown_rx: &Receiver<()>, interval: Duration) -> Tick {
    match shutdown_rx.recv_timeout(interval) {
        Err(RecvTimeoutError::Timeout) => Tick::Run,
        Ok(()) | Err(RecvTimeoutError::Disconnected) => Tick::Stop,
    }
}

/// Non-blocking shutdown check.
pub(crate) fn stop_requested(shutdown_rx: &Receiver<()>) -> bool {
    match shutdown_rx.try_recv() {
        Err(TryRecvError::Empty) => false,
        Ok(()) | Err(TryRecvError::Disconnected) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn stop_is_idempotent_and_joins() {
        let ticks = Arc::new(AtomicU32::new(0));
        let counter = ticks.clone();
        let handle = WorkerHandle::spawn("test-worker", move |rx| {
            while wait_tick(&rx, Duration::from_millis(5)) == Tick::Run {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        })
        .unwrap();

        thread::sleep(Duration::from_millis(30));
        handle.stop();
        assert!(handle.is_finished());
        let after = ticks.load(Ordering::SeqCst);
        handle.stop();
        thread::sleep(Duration::from_millis(20));
        assert_eq!(ticks.load(Ordering::SeqCst), after);
    }

    #[test]
    fn dropped_sender_reads_as_stop() {
        let (tx, rx) = mpsc::channel::<()>();
        assert!(!stop_requested(&rx));
        drop(tx);
        assert!(stop_requested(&rx));
        assert_eq!(wait_tick(&rx, Duration::from_secs(5)), Tick::Stop);
    }
}
