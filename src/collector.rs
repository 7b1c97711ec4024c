use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::trace;

use crate::error::WaitError;
use crate::link::LinkStatus;
use crate::stanza::{Stanza, StanzaFilter};

pub const DEFAULT_COLLECTOR_CAPACITY: usize = 5000;

/// Builder for a [Collector]. With no filter set, every stanza matches.
pub struct CollectorConfig<M> {
    filter: Option<Box<dyn StanzaFilter<M>>>,
    capacity: usize,
    collector_to_reset: Option<Weak<Collector<M>>>,
}

impl<M: Stanza> CollectorConfig<M> {
    pub fn new() -> CollectorConfig<M> {
        CollectorConfig {
            filter: None,
            capacity: DEFAULT_COLLECTOR_CAPACITY,
            collector_to_reset: None,
        }
    }

    pub fn set_filter(mut self, filter: impl StanzaFilter<M> + 'static) -> Self {
        self.filter = Some(Box::new(filter));
        self
    }

    /// Maximum number of stanzas retained before the oldest ones are dropped.
    pub fn set_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// The collector whose wait clock is restarted whenever *this* collector accepts a
    ///  stanza - "reset the sibling's timeout on progress" semantics, used e.g. while
    ///  fetching large multi-part results.
    pub fn set_collector_to_reset(mut self, collector: &Arc<Collector<M>>) -> Self {
        self.collector_to_reset = Some(Arc::downgrade(collector));
        self
    }

    pub fn build(self, link: Arc<LinkStatus>, default_timeout: Duration) -> Arc<Collector<M>> {
        Arc::new(Collector {
            filter: self.filter,
            capacity: self.capacity,
            collector_to_reset: self.collector_to_reset,
            default_timeout,
            link,
            inner: Mutex::new(CollectorInner {
                queue: VecDeque::new(),
                cancelled: false,
                wait_start: Instant::now(),
            }),
            arrived: Condvar::new(),
        })
    }
}

impl<M: Stanza> Default for CollectorConfig<M> {
    fn default() -> Self {
        CollectorConfig::new()
    }
}

struct CollectorInner<M> {
    queue: VecDeque<M>,
    cancelled: bool,
    /// Captured start of the currently pending wait; a sibling collector may move it
    ///  forward to extend that wait's deadline.
    wait_start: Instant,
}

enum WaitOutcome<M> {
    Collected(M),
    TimedOut,
    Cancelled,
}

/// Collects incoming stanzas that pass a filter into a bounded result queue, decoupling
///  "a reply is logically expected" (this collector's lifetime) from "a reply physically
///  arrived" (an asynchronous callback on a different thread).
///
/// The queue never blocks the producer: once `capacity` is reached, the oldest entry is
///  dropped. A cancelled collector accepts no further stanzas and its waits return
///  immediately.
pub struct Collector<M> {
    filter: Option<Box<dyn StanzaFilter<M>>>,
    capacity: usize,
    collector_to_reset: Option<Weak<Collector<M>>>,
    default_timeout: Duration,
    link: Arc<LinkStatus>,
    inner: Mutex<CollectorInner<M>>,
    arrived: Condvar,
}

impl<M: Stanza> Collector<M> {
    /// Called by the dispatch pipeline for every inbound stanza. Safe to call concurrently
    ///  with `cancel` and with waiting threads.
    pub fn offer(&self, stanza: &M) {
        if let Some(filter) = &self.filter {
            if !filter.accept(stanza) {
                return;
            }
        }

        {
            let mut inner = self.inner.lock();
            if inner.cancelled {
                return;
            }
            while inner.queue.len() >= self.capacity {
                // drop the oldest entry rather than blocking the producer
                inner.queue.pop_front();
            }
            inner.queue.push_back(stanza.clone());
        }
        self.arrived.notify_all();

        if let Some(sibling) = &self.collector_to_reset {
            if let Some(sibling) = sibling.upgrade() {
                sibling.restart_wait_clock();
            }
        }
    }

    /// Non-blocking: the next collected stanza if one is available.
    pub fn poll(&self) -> Option<M> {
        self.inner.lock().queue.pop_front()
    }

    /// Blocks until a stanza is collected or `timeout` elapses.
    pub fn await_up_to(&self, timeout: Duration) -> Option<M> {
        match self.next_or_outcome(timeout) {
            WaitOutcome::Collected(stanza) => Some(stanza),
            WaitOutcome::TimedOut | WaitOutcome::Cancelled => None,
        }
    }

    /// Blocks until a stanza is collected or the connection's default reply timeout
    ///  elapses.
    pub fn await_next(&self) -> Option<M> {
        self.await_up_to(self.default_timeout)
    }

    /// Blocks until a stanza is collected, with no deadline. Returns `Cancelled` if the
    ///  collector is (or becomes) cancelled.
    pub fn await_forever(&self) -> Result<M, WaitError> {
        let mut inner = self.inner.lock();
        loop {
            if let Some(stanza) = inner.queue.pop_front() {
                return Ok(stanza);
            }
            if inner.cancelled {
                return Err(WaitError::Cancelled);
            }
            self.arrived.wait(&mut inner);
        }
    }

    /// Like [Self::await_or_fail] with the connection's default reply timeout.
    pub fn await_next_or_fail(&self) -> Result<M, WaitError> {
        self.await_or_fail(self.default_timeout)
    }

    /// Blocks until a stanza is collected or `timeout` elapses, and cancels the collector
    ///  on every exit path - this is a one-shot request/response wait.
    ///
    /// The three failure causes are distinguished: nothing arrived in time
    ///  ([WaitError::NoResponse]), the connection died while waiting
    ///  ([WaitError::NotConnected]), or a stanza matched but itself carries an error
    ///  payload ([WaitError::ErrorReply]).
    pub fn await_or_fail(&self, timeout: Duration) -> Result<M, WaitError> {
        let outcome = self.next_or_outcome(timeout);
        self.cancel();

        match outcome {
            WaitOutcome::Collected(stanza) => {
                if let Some(error) = stanza.error_payload() {
                    return Err(WaitError::ErrorReply(error));
                }
                Ok(stanza)
            }
            WaitOutcome::Cancelled => Err(WaitError::Cancelled),
            WaitOutcome::TimedOut => {
                if !self.link.is_connected() {
                    Err(WaitError::NotConnected)
                } else {
                    Err(WaitError::NoResponse(timeout))
                }
            }
        }
    }

    /// Cancels the collector so that no more results are queued up. Idempotent and
    ///  terminal: a cancelled collector cannot be re-enabled. Waiting threads wake
    ///  promptly.
    pub fn cancel(&self) {
        {
            let mut inner = self.inner.lock();
            if inner.cancelled {
                return;
            }
            inner.cancelled = true;
        }
        trace!("collector cancelled");
        self.arrived.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.lock().cancelled
    }

    pub fn collected_count(&self) -> usize {
        self.inner.lock().queue.len()
    }

    fn next_or_outcome(&self, timeout: Duration) -> WaitOutcome<M> {
        let mut inner = self.inner.lock();
        inner.wait_start = Instant::now();
        loop {
            if let Some(stanza) = inner.queue.pop_front() {
                return WaitOutcome::Collected(stanza);
            }
            if inner.cancelled {
                return WaitOutcome::Cancelled;
            }

            // the remaining budget is recomputed against wait_start on every wake: this
            //  keeps the wait correct across spurious wakeups, and lets a sibling extend
            //  the deadline by moving wait_start forward
            let elapsed = inner.wait_start.elapsed();
            if elapsed >= timeout {
                return WaitOutcome::TimedOut;
            }
            self.arrived.wait_for(&mut inner, timeout - elapsed);
        }
    }

    fn restart_wait_clock(&self) {
        self.inner.lock().wait_start = Instant::now();
        self.arrived.notify_all();
    }
}
