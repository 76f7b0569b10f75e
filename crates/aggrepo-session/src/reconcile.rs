//! Background reconciliation.
//!
//! A [`Reconciler`] owns one thread that wakes every interval and sweeps the
//! context. It holds only a weak handle, so dropping the last `Arc` of the
//! context ends the loop at the next wake-up.

use crate::context::PersistenceContext;
use aggrepo_core::Result;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Handle to a running reconciliation thread. Stops the thread on drop.
#[derive(Debug)]
pub struct Reconciler {
    stop: Option<mpsc::Sender<()>>,
    handle: Option<JoinHandle<()>>,
    sweeps: Arc<AtomicU64>,
    interval: Duration,
}

impl Reconciler {
    /// Start sweeping at the context's configured interval.
    pub fn spawn(context: &Arc<PersistenceContext>) -> Result<Self> {
        let interval = context.config().gc_interval;
        Self::with_interval(context, interval)
    }

    /// Start sweeping every `interval`.
    pub fn with_interval(context: &Arc<PersistenceContext>, interval: Duration) -> Result<Self> {
        let (stop, stopped) = mpsc::channel();
        let sweeps = Arc::new(AtomicU64::new(0));
        let context = Arc::downgrade(context);
        let counter = Arc::clone(&sweeps);
        let handle = thread::Builder::new()
            .name("aggrepo-reconciler".to_string())
            .spawn(move || reconcile_loop(&context, &stopped, interval, &counter))?;
        tracing::debug!(interval_ms = interval.as_millis(), "reconciler started");
        Ok(Self {
            stop: Some(stop),
            handle: Some(handle),
            sweeps,
            interval,
        })
    }

    /// Completed sweeps so far.
    pub fn sweeps(&self) -> u64 {
        self.sweeps.load(Ordering::Relaxed)
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Wake the thread, wait for it to exit. Idempotent.
    pub fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("reconciler thread panicked");
            }
            tracing::debug!(sweeps = self.sweeps(), "reconciler stopped");
        }
    }
}

impl Drop for Reconciler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn reconcile_loop(
    context: &Weak<PersistenceContext>,
    stopped: &mpsc::Receiver<()>,
    interval: Duration,
    sweeps: &AtomicU64,
) {
    loop {
        match stopped.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
        let Some(context) = context.upgrade() else {
            tracing::debug!("context dropped, reconciler exiting");
            break;
        };
        match panic::catch_unwind(AssertUnwindSafe(|| context.gc())) {
            Ok(report) => {
                sweeps.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(?report, "reconciler sweep");
            }
            Err(payload) => {
                tracing::error!(panic = %panic_message(payload.as_ref()), "sweep panicked, reconciler continues");
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
