//! Deferred streams and events for the simulated runtime
//!
//! Work queued on a [`SimStream`] is stored, not executed. It runs in issue
//! order when the stream is synchronized, which makes any missing barrier in
//! the caller show up as stale output instead of passing by luck.

use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;

type Op = Box<dyn FnOnce() -> Result<()> + Send>;

/// Ordered queue of deferred device work
pub struct SimStream {
    pub(super) device: usize,
    pub(super) id: usize,
    queue: Mutex<Vec<Op>>,
}

impl std::fmt::Debug for SimStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimStream")
            .field("device", &self.device)
            .field("id", &self.id)
            .field("pending", &self.pending())
            .finish()
    }
}

impl SimStream {
    pub(super) fn new(device: usize, id: usize) -> Self {
        Self {
            device,
            id,
            queue: Mutex::new(Vec::new()),
        }
    }

    /// Number of queued, not yet executed operations
    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    pub(super) fn push(&self, op: impl FnOnce() -> Result<()> + Send + 'static) {
        self.queue.lock().push(Box::new(op));
    }

    /// Execute everything queued so far.
    ///
    /// Like a device stream, a failing operation does not stop later ones;
    /// the first error is reported.
    pub(super) fn drain(&self) -> Result<()> {
        let ops = std::mem::take(&mut *self.queue.lock());
        let mut first_error = None;
        for op in ops {
            if let Err(e) = op() {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

/// Timestamp taken when the stream reaches the event
#[derive(Clone, Debug, Default)]
pub struct SimEvent {
    pub(super) device: usize,
    pub(super) stamp: Arc<Mutex<Option<Instant>>>,
}

impl SimEvent {
    pub(super) fn new(device: usize) -> Self {
        Self {
            device,
            stamp: Arc::new(Mutex::new(None)),
        }
    }

    pub(super) fn mark(&self) {
        *self.stamp.lock() = Some(Instant::now());
    }

    /// Returns true once the stream has executed past this event
    pub fn is_complete(&self) -> bool {
        self.stamp.lock().is_some()
    }

    pub(super) fn elapsed_to(&self, end: &SimEvent) -> Result<f64> {
        let start = *self.stamp.lock();
        let stop = *end.stamp.lock();
        match (start, stop) {
            (Some(start), Some(stop)) => Ok(stop.saturating_duration_since(start).as_secs_f64()),
            _ => Err(Error::device(
                self.device,
                "event elapsed",
                "event has not completed",
            )),
        }
    }
}
