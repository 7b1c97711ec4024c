use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::config::SubstrateConfig;
use crate::util::random::{Random, RngRandom};

/// Everything the retry loop needs from the owning connection. A seam so the controller
///  can be exercised without a real connection.
#[cfg_attr(test, mockall::automock)]
pub trait ConnectionOps: Send + Sync + 'static {
    fn connect(&self) -> anyhow::Result<()>;
    fn login(&self) -> anyhow::Result<()>;
    fn is_connected(&self) -> bool;
}

pub trait ReconnectionListener: Send + Sync {
    /// Called once per second while the controller waits for the next attempt, with the
    ///  remaining seconds.
    fn reconnecting_in(&self, seconds: u32);
    fn reconnection_failed(&self, error: &anyhow::Error);
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ReconnectionPolicy {
    /// A fixed delay between attempts, independent of how many attempts have failed.
    FixedDelay { seconds: u32 },

    /// A tiered, jittered delay: the per-controller random base for the first attempts
    ///  (when transient blips are likely), six times that for the next tier, thirty times
    ///  that indefinitely thereafter (when the outage is likely sustained). Unbounded
    ///  immediate retries would amplify an outage into thundering-herd load on the server.
    RandomIncreasingDelay,
}

/// Observes connection lifecycle transitions and, on abrupt loss while armed, drives a
///  capped-exponential backoff retry loop with per-attempt cancellation.
pub struct ReconnectionController {
    ops: Arc<dyn ConnectionOps>,
    policy: ReconnectionPolicy,
    /// drawn once per controller so independent clients spread their retries across time
    random_base: u32,
    enabled: AtomicBool,
    /// set on a deliberate (non-error) close, cleared on (re)authentication
    done: AtomicBool,
    abort: AtomicBool,
    listeners: Mutex<Vec<Arc<dyn ReconnectionListener>>>,
    retry_thread: Mutex<Option<JoinHandle<()>>>,
}

impl ReconnectionController {
    pub fn new(ops: Arc<dyn ConnectionOps>, config: &SubstrateConfig) -> Arc<ReconnectionController> {
        Self::new_with_random::<RngRandom>(ops, config)
    }

    fn new_with_random<R: Random>(
        ops: Arc<dyn ConnectionOps>,
        config: &SubstrateConfig,
    ) -> Arc<ReconnectionController> {
        let random_base = R::gen_u32_range(config.reconnect_random_base_range.clone());
        Self::with_random_base(ops, config.reconnect_policy.clone(), random_base)
    }

    fn with_random_base(
        ops: Arc<dyn ConnectionOps>,
        policy: ReconnectionPolicy,
        random_base: u32,
    ) -> Arc<ReconnectionController> {
        Arc::new(ReconnectionController {
            ops,
            policy,
            random_base,
            enabled: AtomicBool::new(false),
            done: AtomicBool::new(false),
            abort: AtomicBool::new(false),
            listeners: Mutex::new(Vec::new()),
            retry_thread: Mutex::new(None),
        })
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::SeqCst);
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn add_listener(&self, listener: Arc<dyn ReconnectionListener>) {
        self.listeners.lock().push(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn ReconnectionListener>) -> bool {
        let mut listeners = self.listeners.lock();
        let len_before = listeners.len();
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
        listeners.len() != len_before
    }

    pub fn on_connected(&self) {
        // nothing to do here: a successful reconnect is detected via is_connected, and
        //  the terminal flag is only cleared once authentication went through
    }

    pub fn on_authenticated(&self) {
        self.done.store(false, Ordering::SeqCst);
    }

    /// The application deliberately closed the connection - do not reconnect.
    pub fn on_closed(&self) {
        self.done.store(true, Ordering::SeqCst);
    }

    /// The connection was lost abruptly - start the retry loop if armed.
    pub fn on_closed_with_error(self: &Arc<Self>, error: &anyhow::Error) {
        self.done.store(false, Ordering::SeqCst);
        if !self.is_enabled() {
            return;
        }
        debug!("connection closed on error: {:#} - triggering reconnection", error);
        self.reconnect();
    }

    /// Starts the retry loop unless one is already running.
    pub fn reconnect(self: &Arc<Self>) {
        let mut retry_thread = self.retry_thread.lock();
        if let Some(running) = retry_thread.as_ref() {
            if !running.is_finished() {
                return;
            }
        }
        self.abort.store(false, Ordering::SeqCst);

        let controller = self.clone();
        let handle = thread::Builder::new()
            .name("stanza-io reconnection".to_string())
            .spawn(move || controller.retry_loop())
            .expect("failed to spawn reconnection thread");
        *retry_thread = Some(handle);
    }

    /// Aborts a possibly running retry loop; it notices within one second.
    pub fn abort_possibly_running_reconnection(&self) {
        self.abort.store(true, Ordering::SeqCst);
    }

    fn reconnection_possible(&self) -> bool {
        !self.done.load(Ordering::SeqCst)
            && !self.abort.load(Ordering::SeqCst)
            && !self.ops.is_connected()
            && self.is_enabled()
    }

    fn retry_loop(&self) {
        let mut attempts = 0u32;
        while self.reconnection_possible() {
            attempts += 1;
            let delay = Self::delay_for_attempt(&self.policy, self.random_base, attempts);

            // sleep in one-second increments so cancellation is noticed promptly and
            //  listeners can show a countdown; the final iteration announces zero
            let mut remaining_seconds = delay.as_secs();
            while remaining_seconds > 0 {
                if !self.reconnection_possible() {
                    return;
                }
                thread::sleep(Duration::from_secs(1));
                remaining_seconds -= 1;
                self.notify_reconnecting_in(remaining_seconds as u32);
            }

            if !self.reconnection_possible() {
                return;
            }
            match self.ops.connect().and_then(|_| self.ops.login()) {
                Ok(()) => {
                    info!("reconnection successful after {} attempts", attempts);
                    return;
                }
                Err(e) => {
                    debug!("reconnection attempt {} failed: {:#}", attempts, e);
                    for listener in self.listeners.lock().iter() {
                        listener.reconnection_failed(&e);
                    }
                }
            }
        }
    }

    /// The delay before the given (1-based) attempt. Short for the first attempts, when
    ///  transient blips are likely, then tiered upwards.
    fn delay_for_attempt(policy: &ReconnectionPolicy, random_base: u32, attempts: u32) -> Duration {
        let seconds = match policy {
            ReconnectionPolicy::FixedDelay { seconds } => *seconds,
            ReconnectionPolicy::RandomIncreasingDelay => {
                if attempts > 20 {
                    random_base * 30
                } else if attempts > 13 {
                    random_base * 6
                } else {
                    random_base
                }
            }
        };
        Duration::from_secs(seconds as u64)
    }

    fn notify_reconnecting_in(&self, seconds: u32) {
        for listener in self.listeners.lock().iter() {
            listener.reconnecting_in(seconds);
        }
    }
}
