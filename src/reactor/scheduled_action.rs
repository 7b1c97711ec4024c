use std::cmp::Ordering;
use std::sync::atomic::{self, AtomicBool};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

/// A deferred one-shot action in the reactor's timer queue.
///
/// The boxed closure is consumed either by the worker that runs it or by `cancel`,
///  whichever comes first; the loser of that race sees `None` and does nothing.
pub struct ScheduledAction {
    due_at: Instant,
    seq: u64,
    action: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    cancelled: AtomicBool,
}

impl ScheduledAction {
    pub(crate) fn new(
        due_at: Instant,
        seq: u64,
        action: Box<dyn FnOnce() + Send>,
    ) -> Arc<ScheduledAction> {
        Arc::new(ScheduledAction {
            due_at,
            seq,
            action: Mutex::new(Some(action)),
            cancelled: AtomicBool::new(false),
        })
    }

    /// Returns true if the action had not run yet, i.e. the cancellation actually
    ///  prevented something. Cancelling after the action ran is a no-op.
    pub fn cancel(&self) -> bool {
        let was_pending = self.action.lock().take().is_some();
        self.cancelled.store(true, atomic::Ordering::SeqCst);
        was_pending
    }

    pub(crate) fn due_at(&self) -> Instant {
        self.due_at
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(atomic::Ordering::SeqCst)
    }

    pub(crate) fn run(&self) {
        let action = self.action.lock().take();
        if let Some(action) = action {
            action();
        }
    }
}

/// Heap entry ordering: `BinaryHeap` is a max-heap, so the comparison is reversed to pop
///  the earliest due time first, with the submission sequence breaking ties.
pub(crate) struct DueOrdered(pub Arc<ScheduledAction>);

impl PartialEq for DueOrdered {
    fn eq(&self, other: &Self) -> bool {
        self.0.due_at == other.0.due_at && self.0.seq == other.0.seq
    }
}
impl Eq for DueOrdered {}

impl PartialOrd for DueOrdered {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for DueOrdered {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .0
            .due_at
            .cmp(&self.0.due_at)
            .then_with(|| other.0.seq.cmp(&self.0.seq))
    }
}
