use std::collections::{BinaryHeap, VecDeque};
use std::io::ErrorKind;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::Context;
use mio::unix::SourceFd;
use mio::{Events, Poll, Registry, Token, Waker};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::{debug, error, trace};

use crate::config::SubstrateConfig;
use crate::util::permits::Permits;

mod scheduled_action;

pub use mio::Interest;
pub use scheduled_action::ScheduledAction;

use scheduled_action::DueOrdered;

const WAKER_TOKEN: Token = Token(usize::MAX);

/// Interest changes applied per poll round before one round can starve sibling threads
const MAX_INTEREST_BATCH: usize = 1024;

/// Poll budget floor while an overdue action waits for a run permit: the permit holders
///  claim the action when they finish, and the poller keeps serving I/O meanwhile.
const OVERDUE_POLL_BUDGET: Duration = Duration::from_millis(1);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
}

/// Invoked on a reactor worker thread when a registered channel becomes ready.
///
/// The registration's interest is cleared before the callback runs, so the callback must
///  call `RegistrationHandle::set_interest` to receive further events, and
///  `RegistrationHandle::reset_racing` once it is done reacting.
pub trait ChannelReadyCallback: Send + Sync {
    fn on_channel_ready(&self, handle: &RegistrationHandle, readiness: Readiness);
}

struct Registration {
    token: Token,
    fd: RawFd,
    callback: Weak<dyn ChannelReadyCallback>,
    /// set while a readiness callback for this channel is in flight
    racing: AtomicBool,
    /// whether the fd is currently registered with the OS selector
    armed: AtomicBool,
}

/// Caller-side view of one registered channel. Cheap to clone.
#[derive(Clone)]
pub struct RegistrationHandle {
    registration: Arc<Registration>,
    shared: Arc<ReactorShared>,
}

impl RegistrationHandle {
    /// Queues an interest change, `None` meaning "no events". Never blocks the caller:
    ///  the change is applied by a worker before its next poll.
    pub fn set_interest(&self, interest: Option<Interest>) {
        self.shared
            .pending_interest
            .lock()
            .push_back((self.registration.clone(), interest));
        self.shared.wake();
    }

    /// Marks the in-flight readiness callback as finished, allowing the next selection of
    ///  this channel to be delivered.
    pub fn reset_racing(&self) {
        self.registration.racing.store(false, Ordering::SeqCst);
    }

    /// Permanently removes the channel from the reactor.
    pub fn deregister(&self) {
        self.shared.handlers.lock().remove(&self.registration.token);
        self.set_interest(None);
    }
}

struct PollState {
    poll: Poll,
    events: Events,
}

struct ReactorShared {
    /// whoever holds this is the one thread blocked in the OS poll
    poll: Mutex<PollState>,
    registry: Registry,
    waker: Waker,
    handlers: Mutex<FxHashMap<Token, Arc<Registration>>>,
    scheduled: Mutex<BinaryHeap<DueOrdered>>,
    pending_interest: Mutex<VecDeque<(Arc<Registration>, Option<Interest>)>>,
    /// ready channels a poller selected but handed off for sibling workers to process
    pending_ready: Mutex<VecDeque<(Arc<Registration>, Readiness)>>,
    /// one permit fewer than the worker count, bounding concurrent scheduled-action
    ///  execution so one thread always remains for the poll
    action_permits: Permits,
    next_token: AtomicUsize,
    next_seq: AtomicU64,
    worker_count: AtomicUsize,
    #[cfg(test)]
    polls_in_flight: AtomicUsize,
    #[cfg(test)]
    max_concurrent_polls: AtomicUsize,
}

impl ReactorShared {
    fn wake(&self) {
        if let Err(e) = self.waker.wake() {
            debug!("waking the readiness poll failed: {}", e);
        }
    }
}

struct WorkerHandle {
    shutdown: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

/// The event multiplexer: one OS-level readiness selector, a resizable pool of worker
///  threads, and a due-time-ordered timer queue.
///
/// Workers race to either run a due timer action (bounded by the permit pool) or become
///  the single poller. A poller fans selected channels out across the pool proportionally
///  so callback handling scales with concurrent I/O load.
pub struct Reactor {
    shared: Arc<ReactorShared>,
    workers: Mutex<Vec<WorkerHandle>>,
}

impl Reactor {
    pub fn new(config: &SubstrateConfig) -> anyhow::Result<Reactor> {
        let poll = Poll::new().context("creating the readiness selector")?;
        let registry = poll
            .registry()
            .try_clone()
            .context("cloning the selector registry")?;
        let waker =
            Waker::new(poll.registry(), WAKER_TOKEN).context("creating the selector waker")?;

        let reactor = Reactor {
            shared: Arc::new(ReactorShared {
                poll: Mutex::new(PollState {
                    poll,
                    events: Events::with_capacity(256),
                }),
                registry,
                waker,
                handlers: Mutex::new(FxHashMap::default()),
                scheduled: Mutex::new(BinaryHeap::new()),
                pending_interest: Mutex::new(VecDeque::new()),
                pending_ready: Mutex::new(VecDeque::new()),
                action_permits: Permits::new(-1),
                next_token: AtomicUsize::new(0),
                next_seq: AtomicU64::new(0),
                worker_count: AtomicUsize::new(0),
                #[cfg(test)]
                polls_in_flight: AtomicUsize::new(0),
                #[cfg(test)]
                max_concurrent_polls: AtomicUsize::new(0),
            }),
            workers: Mutex::new(Vec::new()),
        };
        reactor.set_worker_count(config.reactor_worker_count)?;
        Ok(reactor)
    }

    /// Registers a file descriptor for readiness callbacks. The callback is held weakly;
    ///  once its owner is dropped, the registration cleans itself up on the next event.
    pub fn register(
        &self,
        fd: RawFd,
        interest: Interest,
        callback: Weak<dyn ChannelReadyCallback>,
    ) -> anyhow::Result<RegistrationHandle> {
        let token = Token(self.shared.next_token.fetch_add(1, Ordering::SeqCst));
        let registration = Arc::new(Registration {
            token,
            fd,
            callback,
            racing: AtomicBool::new(false),
            armed: AtomicBool::new(true),
        });

        // the handler entry must exist before the selector can produce events for the
        //  token
        self.shared.handlers.lock().insert(token, registration.clone());
        if let Err(e) = self.shared.registry.register(&mut SourceFd(&fd), token, interest) {
            self.shared.handlers.lock().remove(&token);
            return Err(e).context("registering the channel with the readiness selector");
        }

        Ok(RegistrationHandle {
            registration,
            shared: self.shared.clone(),
        })
    }

    /// Schedules a one-shot action to run on a reactor worker after the given delay. The
    ///  returned handle can cancel it as long as it has not started.
    pub fn schedule(
        &self,
        delay: Duration,
        action: impl FnOnce() + Send + 'static,
    ) -> Arc<ScheduledAction> {
        let action = ScheduledAction::new(
            Instant::now() + delay,
            self.shared.next_seq.fetch_add(1, Ordering::SeqCst),
            Box::new(action),
        );
        self.shared.scheduled.lock().push(DueOrdered(action.clone()));
        // the current poll budget may be longer than the new delay
        self.shared.wake();
        action
    }

    /// Grows or shrinks the worker pool. Shrinking first claims the departing workers'
    ///  run permits, so it blocks until that much in-flight scheduled work has finished
    ///  and the capacity cannot be claimed again.
    pub fn set_worker_count(&self, n: usize) -> anyhow::Result<()> {
        if n < 2 {
            anyhow::bail!("the reactor needs at least two worker threads, got {}", n);
        }

        let mut workers = self.workers.lock();
        let current = workers.len();
        if n > current {
            let delta = n - current;
            for _ in 0..delta {
                let shutdown = Arc::new(AtomicBool::new(false));
                let shared = self.shared.clone();
                let flag = shutdown.clone();
                let thread = thread::Builder::new()
                    .name("stanza-io reactor".to_string())
                    .spawn(move || worker_loop(shared, flag))
                    .context("spawning a reactor worker thread")?;
                workers.push(WorkerHandle { shutdown, thread });
            }
            self.shared.worker_count.store(n, Ordering::SeqCst);
            // the new threads are running before their permits become available
            self.shared.action_permits.release(delta as isize);
        } else if n < current {
            let delta = current - n;
            for _ in 0..delta {
                self.shared.action_permits.acquire();
            }
            self.shared.worker_count.store(n, Ordering::SeqCst);
            for handle in workers.drain(n..) {
                // not joined: the thread exits on its own once it observes the flag
                handle.shutdown.store(true, Ordering::SeqCst);
            }
            self.shared.wake();
        }
        Ok(())
    }

    #[cfg(test)]
    fn max_concurrent_polls(&self) -> usize {
        self.shared.max_concurrent_polls.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    fn handler_count(&self) -> usize {
        self.shared.handlers.lock().len()
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        let workers: Vec<WorkerHandle> = self.workers.lock().drain(..).collect();
        for worker in &workers {
            worker.shutdown.store(true, Ordering::SeqCst);
        }
        self.shared.wake();
        for worker in workers {
            let _ = worker.thread.join();
        }
    }
}

fn worker_loop(shared: Arc<ReactorShared>, shutdown: Arc<AtomicBool>) {
    trace!("reactor worker starting");
    while !shutdown.load(Ordering::SeqCst) {
        if handle_one_pending_ready(&shared) {
            continue;
        }
        if shared.action_permits.try_acquire() {
            let ran = run_one_due_action(&shared);
            shared.action_permits.release(1);
            if ran {
                continue;
            }
        }
        poll_round(&shared, &shutdown);
    }
    // each exiting worker wakes the current poller so shutdown ripples through the pool
    shared.wake();
    trace!("reactor worker exiting");
}

fn handle_one_pending_ready(shared: &Arc<ReactorShared>) -> bool {
    let handed_off = shared.pending_ready.lock().pop_front();
    match handed_off {
        Some((registration, readiness)) => {
            deliver(shared, registration, readiness);
            true
        }
        None => false,
    }
}

/// Pops and runs the next due scheduled action, if any. Caller must hold a run permit.
fn run_one_due_action(shared: &ReactorShared) -> bool {
    let action = {
        let mut scheduled = shared.scheduled.lock();
        loop {
            match scheduled.peek() {
                Some(entry) if entry.0.is_cancelled() => {
                    scheduled.pop();
                }
                Some(entry) if entry.0.due_at() <= Instant::now() => {
                    break scheduled.pop().map(|entry| entry.0);
                }
                _ => break None,
            }
        }
    };
    match action {
        Some(action) => {
            action.run();
            true
        }
        None => false,
    }
}

/// Time until the next non-cancelled scheduled action is due, `None` if there is none.
fn next_poll_budget(shared: &ReactorShared) -> Option<Duration> {
    let mut scheduled = shared.scheduled.lock();
    while let Some(entry) = scheduled.peek() {
        if entry.0.is_cancelled() {
            scheduled.pop();
            continue;
        }
        return Some(entry.0.due_at().saturating_duration_since(Instant::now()));
    }
    None
}

fn poll_round(shared: &Arc<ReactorShared>, shutdown: &AtomicBool) {
    let mut poll_state = shared.poll.lock();
    // state may have changed while this thread waited to become the poller
    if shutdown.load(Ordering::SeqCst) || !shared.pending_ready.lock().is_empty() {
        return;
    }
    apply_pending_interest(shared);

    let budget = match next_poll_budget(shared) {
        Some(budget) if budget.is_zero() => Some(OVERDUE_POLL_BUDGET),
        other => other,
    };

    #[cfg(test)]
    {
        let polling = shared.polls_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        shared.max_concurrent_polls.fetch_max(polling, Ordering::SeqCst);
    }
    let state = &mut *poll_state;
    let poll_result = state.poll.poll(&mut state.events, budget);
    #[cfg(test)]
    shared.polls_in_flight.fetch_sub(1, Ordering::SeqCst);

    if let Err(e) = poll_result {
        if e.kind() != ErrorKind::Interrupted {
            error!("readiness poll failed: {} - continuing", e);
        }
        return;
    }

    let mut selected = Vec::new();
    {
        let handlers = shared.handlers.lock();
        for event in state.events.iter() {
            if event.token() == WAKER_TOKEN {
                continue;
            }
            let Some(registration) = handlers.get(&event.token()) else {
                // deregistered concurrently
                continue;
            };
            if registration.racing.swap(true, Ordering::SeqCst) {
                // the previous callback is still reacting; its interest re-arm will
                //  re-report current readiness
                continue;
            }
            // clear interest before the callback runs so the same readiness is not
            //  delivered twice
            disarm(shared, registration);
            let readiness = Readiness {
                readable: event.is_readable() || event.is_read_closed(),
                writable: event.is_writable() || event.is_write_closed(),
            };
            selected.push((registration.clone(), readiness));
        }
    }
    drop(poll_state);

    if selected.is_empty() {
        return;
    }

    // handle a proportional share locally, hand the rest to sibling workers
    let worker_count = shared.worker_count.load(Ordering::SeqCst).max(1);
    let local_count = if selected.len() <= worker_count {
        selected.len()
    } else {
        selected.len() / worker_count
    };
    let handed_off = selected.split_off(local_count);
    if !handed_off.is_empty() {
        shared.pending_ready.lock().extend(handed_off);
        shared.wake();
    }
    for (registration, readiness) in selected {
        deliver(shared, registration, readiness);
    }
}

fn apply_pending_interest(shared: &ReactorShared) {
    let mut applied = 0;
    while applied < MAX_INTEREST_BATCH {
        let change = shared.pending_interest.lock().pop_front();
        let Some((registration, interest)) = change else {
            return;
        };
        apply_interest(shared, &registration, interest);
        applied += 1;
    }
    if !shared.pending_interest.lock().is_empty() {
        // leave the excess for the next round so this round cannot starve the poll
        shared.wake();
    }
}

fn apply_interest(shared: &ReactorShared, registration: &Registration, interest: Option<Interest>) {
    let result = match interest {
        Some(interest) => {
            if registration.armed.swap(true, Ordering::SeqCst) {
                shared.registry.reregister(
                    &mut SourceFd(&registration.fd),
                    registration.token,
                    interest,
                )
            } else {
                shared.registry.register(
                    &mut SourceFd(&registration.fd),
                    registration.token,
                    interest,
                )
            }
        }
        None => {
            if registration.armed.swap(false, Ordering::SeqCst) {
                shared.registry.deregister(&mut SourceFd(&registration.fd))
            } else {
                Ok(())
            }
        }
    };
    if let Err(e) = result {
        debug!("applying an interest change failed: {}", e);
    }
}

fn disarm(shared: &ReactorShared, registration: &Registration) {
    if registration.armed.swap(false, Ordering::SeqCst) {
        if let Err(e) = shared.registry.deregister(&mut SourceFd(&registration.fd)) {
            debug!("deregistering a selected channel failed: {}", e);
        }
    }
}

fn deliver(shared: &Arc<ReactorShared>, registration: Arc<Registration>, readiness: Readiness) {
    let Some(callback) = registration.callback.upgrade() else {
        // the channel owner is gone
        trace!("dropping registration with a dead callback");
        shared.handlers.lock().remove(&registration.token);
        return;
    };
    let handle = RegistrationHandle {
        registration,
        shared: shared.clone(),
    };
    callback.on_channel_ready(&handle, readiness);
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::sync::atomic::AtomicUsize;

    use super::*;

    fn new_reactor(worker_count: usize) -> Reactor {
        let mut config = SubstrateConfig::new();
        config.reactor_worker_count = worker_count;
        Reactor::new(&config).unwrap()
    }

    fn await_condition(deadline: Duration, condition: impl Fn() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    #[test]
    fn test_scheduled_action_fires_after_delay() {
        let reactor = new_reactor(2);
        let fired = Arc::new(AtomicBool::new(false));

        let start = Instant::now();
        {
            let fired = fired.clone();
            reactor.schedule(Duration::from_millis(50), move || {
                fired.store(true, Ordering::SeqCst);
            });
        }

        assert!(await_condition(Duration::from_secs(5), || fired
            .load(Ordering::SeqCst)));
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_scheduled_actions_fire_in_due_time_order() {
        let reactor = new_reactor(2);
        let order: Arc<Mutex<Vec<&str>>> = Default::default();

        {
            let order = order.clone();
            reactor.schedule(Duration::from_millis(80), move || order.lock().push("late"));
        }
        {
            let order = order.clone();
            reactor.schedule(Duration::from_millis(30), move || order.lock().push("early"));
        }

        assert!(await_condition(Duration::from_secs(5), || order.lock().len() == 2));
        assert_eq!(*order.lock(), vec!["early", "late"]);
    }

    #[test]
    fn test_cancelled_action_does_not_fire() {
        let reactor = new_reactor(2);
        let fired = Arc::new(AtomicBool::new(false));

        let action = {
            let fired = fired.clone();
            reactor.schedule(Duration::from_millis(50), move || {
                fired.store(true, Ordering::SeqCst);
            })
        };

        assert!(action.cancel());
        assert!(!action.cancel());
        thread::sleep(Duration::from_millis(200));
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[test]
    fn test_cancelling_after_firing_reports_no_effect() {
        let reactor = new_reactor(2);
        let fired = Arc::new(AtomicBool::new(false));

        let action = {
            let fired = fired.clone();
            reactor.schedule(Duration::from_millis(10), move || {
                fired.store(true, Ordering::SeqCst);
            })
        };

        assert!(await_condition(Duration::from_secs(5), || fired
            .load(Ordering::SeqCst)));
        assert!(!action.cancel());
    }

    struct DrainingCallback {
        stream: Mutex<UnixStream>,
        received: Mutex<Vec<u8>>,
        deliveries: AtomicUsize,
    }
    impl ChannelReadyCallback for DrainingCallback {
        fn on_channel_ready(&self, handle: &RegistrationHandle, readiness: Readiness) {
            assert!(readiness.readable);
            self.deliveries.fetch_add(1, Ordering::SeqCst);

            let mut buf = [0u8; 256];
            loop {
                match self.stream.lock().read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => self.received.lock().extend_from_slice(&buf[..n]),
                    Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(e) => panic!("read failed: {}", e),
                }
            }
            handle.reset_racing();
            handle.set_interest(Some(Interest::READABLE));
        }
    }

    #[test]
    fn test_channel_readiness_is_delivered_and_rearmed() {
        let reactor = new_reactor(2);

        let (mut writer, reader) = UnixStream::pair().unwrap();
        reader.set_nonblocking(true).unwrap();
        let fd = reader.as_raw_fd();

        let callback = Arc::new(DrainingCallback {
            stream: Mutex::new(reader),
            received: Default::default(),
            deliveries: AtomicUsize::new(0),
        });
        let weak_callback = Arc::downgrade(&callback);
        let weak_callback: Weak<dyn ChannelReadyCallback> = weak_callback;
        let _handle = reactor.register(fd, Interest::READABLE, weak_callback).unwrap();

        writer.write_all(b"hello").unwrap();
        assert!(await_condition(Duration::from_secs(5), || {
            *callback.received.lock() == b"hello"
        }));

        // the callback re-armed its interest, so a second write is delivered too
        writer.write_all(b" world").unwrap();
        assert!(await_condition(Duration::from_secs(5), || {
            *callback.received.lock() == b"hello world"
        }));
        assert!(callback.deliveries.load(Ordering::SeqCst) >= 2);

        assert!(reactor.max_concurrent_polls() <= 1);
    }

    struct InertCallback;
    impl ChannelReadyCallback for InertCallback {
        fn on_channel_ready(&self, _handle: &RegistrationHandle, _readiness: Readiness) {}
    }

    #[test]
    fn test_dead_callback_cleans_up_its_registration() {
        let reactor = new_reactor(2);

        // the test keeps the stream alive; only the callback goes away, so the next
        //  readiness event still fires and finds the callback dead
        let (mut writer, reader) = UnixStream::pair().unwrap();
        reader.set_nonblocking(true).unwrap();
        let fd = reader.as_raw_fd();

        let callback = Arc::new(InertCallback);
        let weak_callback = Arc::downgrade(&callback);
        let weak_callback: Weak<dyn ChannelReadyCallback> = weak_callback;
        let _handle = reactor.register(fd, Interest::READABLE, weak_callback).unwrap();
        assert_eq!(reactor.handler_count(), 1);

        drop(callback);
        writer.write_all(b"nobody is listening").unwrap();

        assert!(await_condition(Duration::from_secs(5), || {
            reactor.handler_count() == 0
        }));
    }

    #[test]
    fn test_at_most_one_worker_polls_at_a_time() {
        let reactor = new_reactor(4);
        let completed = Arc::new(AtomicUsize::new(0));

        // a burst of due timer actions keeps all workers competing for the poll
        for _ in 0..40 {
            let completed = completed.clone();
            reactor.schedule(Duration::from_millis(1), move || {
                thread::sleep(Duration::from_millis(2));
                completed.fetch_add(1, Ordering::SeqCst);
            });
        }

        assert!(await_condition(Duration::from_secs(10), || {
            completed.load(Ordering::SeqCst) == 40
        }));
        assert!(reactor.max_concurrent_polls() <= 1);
    }

    #[test]
    fn test_shrink_waits_for_in_flight_actions() {
        let reactor = new_reactor(4);

        // three actions occupy all three run permits
        for _ in 0..3 {
            reactor.schedule(Duration::ZERO, || {
                thread::sleep(Duration::from_millis(200));
            });
        }
        thread::sleep(Duration::from_millis(50));

        let start = Instant::now();
        reactor.set_worker_count(2).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(100));

        // the shrunk pool still runs timers
        let fired = Arc::new(AtomicBool::new(false));
        {
            let fired = fired.clone();
            reactor.schedule(Duration::from_millis(20), move || {
                fired.store(true, Ordering::SeqCst);
            });
        }
        assert!(await_condition(Duration::from_secs(5), || fired
            .load(Ordering::SeqCst)));
    }

    #[test]
    fn test_worker_count_below_two_is_rejected() {
        let reactor = new_reactor(2);
        assert!(reactor.set_worker_count(1).is_err());
        assert!(reactor.set_worker_count(0).is_err());
    }
}
