use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::trace;

/// Outcome of a negotiation step that did not succeed.
///
/// `NoResponse` is deliberately distinct from `Failure`: it means the deadline elapsed
///  without either `report_success` or `report_failure` being called, and callers surface
///  a response-timeout error rather than a protocol error.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum GateFailure<F> {
    /// The peer answered the request with a failure payload.
    Failure(F),
    /// The deadline elapsed without any resolution.
    NoResponse,
    /// The wait was aborted, e.g. by a deliberate disconnect.
    Interrupted,
}

#[derive(Clone, Debug, Eq, PartialEq)]
enum GateState<F> {
    Initial,
    RequestSent,
    Success,
    Failure(F),
    NoResponse,
    Interrupted,
}

impl<F> GateState<F> {
    fn is_terminal(&self) -> bool {
        !matches!(self, GateState::Initial | GateState::RequestSent)
    }
}

/// A reusable, resettable synchronization object representing one outstanding
///  request/response exchange that changes connection state, e.g. "start encryption",
///  "authenticate" or "enable compression".
///
/// Every multi-step handshake has the same shape - send a request, block the initiating
///  thread until a counterpart callback resolves the outcome, or time out - so this is
///  factored into one primitive instead of being re-implemented per handshake step. Each
///  handshake step owns one gate instance and calls `init` to reuse it across reconnects.
///
/// Once the gate reaches a terminal state it stays there until the next `init`.
pub struct NegotiationGate<F> {
    state: Mutex<GateState<F>>,
    resolved: Condvar,
    reply_timeout: Duration,
}

impl<F: Clone + Send> NegotiationGate<F> {
    pub fn new(reply_timeout: Duration) -> NegotiationGate<F> {
        NegotiationGate {
            state: Mutex::new(GateState::Initial),
            resolved: Condvar::new(),
            reply_timeout,
        }
    }

    /// Resets the gate for (re)use. Any previous outcome is discarded.
    pub fn init(&self) {
        *self.state.lock() = GateState::Initial;
    }

    /// Sends the request by invoking the provided closure and blocks the calling thread
    ///  until a counterpart callback resolves the outcome, or the reply timeout elapses.
    ///
    /// The outer result is the send itself (transport errors); the inner result is the
    ///  negotiation outcome.
    pub fn send_and_await(
        &self,
        send_request: impl FnOnce() -> anyhow::Result<()>,
    ) -> anyhow::Result<Result<(), GateFailure<F>>> {
        *self.state.lock() = GateState::RequestSent;
        send_request()?;
        Ok(self.check_or_await())
    }

    /// Returns the outcome if the gate is already resolved, otherwise blocks until it
    ///  resolves or the reply timeout elapses.
    pub fn check_or_await(&self) -> Result<(), GateFailure<F>> {
        let wait_start = Instant::now();
        let mut state = self.state.lock();
        loop {
            match &*state {
                GateState::Success => return Ok(()),
                GateState::Failure(failure) => return Err(GateFailure::Failure(failure.clone())),
                GateState::NoResponse => return Err(GateFailure::NoResponse),
                GateState::Interrupted => return Err(GateFailure::Interrupted),
                GateState::Initial | GateState::RequestSent => {}
            }

            // recompute the remaining budget against the captured start on every wake, so
            //  spurious wakeups do not shorten or extend the wait
            let elapsed = wait_start.elapsed();
            if elapsed >= self.reply_timeout {
                trace!("negotiation gate timed out after {:?}", self.reply_timeout);
                *state = GateState::NoResponse;
                return Err(GateFailure::NoResponse);
            }
            self.resolved.wait_for(&mut state, self.reply_timeout - elapsed);
        }
    }

    /// Resolves the gate successfully, waking all waiters. A no-op if the gate is already
    ///  in a terminal state.
    pub fn report_success(&self) {
        let mut state = self.state.lock();
        if state.is_terminal() {
            return;
        }
        *state = GateState::Success;
        drop(state);
        self.resolved.notify_all();
    }

    /// Resolves the gate with a failure payload, waking all waiters. A no-op if the gate
    ///  is already in a terminal state.
    pub fn report_failure(&self, failure: F) {
        let mut state = self.state.lock();
        if state.is_terminal() {
            return;
        }
        *state = GateState::Failure(failure);
        drop(state);
        self.resolved.notify_all();
    }

    /// Aborts a possibly pending wait, e.g. on deliberate disconnect. Waiters wake
    ///  promptly and observe `Interrupted`.
    pub fn interrupt(&self) {
        let mut state = self.state.lock();
        if state.is_terminal() {
            return;
        }
        *state = GateState::Interrupted;
        drop(state);
        self.resolved.notify_all();
    }

    pub fn was_successful(&self) -> bool {
        matches!(&*self.state.lock(), GateState::Success)
    }

    pub fn is_request_sent(&self) -> bool {
        matches!(&*self.state.lock(), GateState::RequestSent)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::success_first(true)]
    #[case::failure_first(false)]
    fn test_terminal_state_is_stable(#[case] success_first: bool) {
        let gate: NegotiationGate<String> = NegotiationGate::new(Duration::from_millis(100));

        if success_first {
            gate.report_success();
            gate.report_failure("too late".to_string());
            assert!(gate.was_successful());
        } else {
            gate.report_failure("rejected".to_string());
            gate.report_success();
            assert!(!gate.was_successful());
        }

        // only an explicit init releases the terminal state
        gate.init();
        assert!(!gate.was_successful());
        gate.report_success();
        assert!(gate.was_successful());
    }

    #[test]
    fn test_await_without_resolution_is_no_response() {
        let gate: NegotiationGate<String> = NegotiationGate::new(Duration::from_millis(200));

        let start = Instant::now();
        let result = gate.send_and_await(|| Ok(())).unwrap();
        let elapsed = start.elapsed();

        assert_eq!(result, Err(GateFailure::NoResponse));
        assert!(elapsed >= Duration::from_millis(195), "returned early: {:?}", elapsed);
        assert!(elapsed <= Duration::from_millis(400), "returned late: {:?}", elapsed);
        assert!(!gate.was_successful());
    }

    #[test]
    fn test_await_resolved_from_other_thread() {
        let gate: Arc<NegotiationGate<String>> =
            Arc::new(NegotiationGate::new(Duration::from_millis(1000)));

        let resolver = {
            let gate = gate.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                gate.report_success();
            })
        };

        let start = Instant::now();
        let result = gate.send_and_await(|| Ok(())).unwrap();
        let elapsed = start.elapsed();

        assert_eq!(result, Ok(()));
        assert!(elapsed >= Duration::from_millis(50), "returned early: {:?}", elapsed);
        assert!(elapsed <= Duration::from_millis(150), "returned late: {:?}", elapsed);
        assert!(gate.was_successful());

        resolver.join().unwrap();
    }

    #[test]
    fn test_failure_payload_reaches_the_waiter() {
        let gate: Arc<NegotiationGate<String>> =
            Arc::new(NegotiationGate::new(Duration::from_millis(1000)));

        let resolver = {
            let gate = gate.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                gate.report_failure("not-authorized".to_string());
            })
        };

        let result = gate.send_and_await(|| Ok(())).unwrap();
        assert_eq!(result, Err(GateFailure::Failure("not-authorized".to_string())));

        resolver.join().unwrap();
    }

    #[test]
    fn test_interrupt_wakes_waiter_promptly() {
        let gate: Arc<NegotiationGate<String>> =
            Arc::new(NegotiationGate::new(Duration::from_secs(10)));

        let interrupter = {
            let gate = gate.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                gate.interrupt();
            })
        };

        let start = Instant::now();
        let result = gate.send_and_await(|| Ok(())).unwrap();

        assert_eq!(result, Err(GateFailure::Interrupted));
        assert!(start.elapsed() < Duration::from_secs(1));

        interrupter.join().unwrap();
    }

    #[test]
    fn test_send_error_propagates() {
        let gate: NegotiationGate<String> = NegotiationGate::new(Duration::from_millis(100));

        let result = gate.send_and_await(|| anyhow::bail!("transport is gone"));
        assert!(result.is_err());
    }

    #[test]
    fn test_check_or_await_after_resolution_returns_immediately() {
        let gate: NegotiationGate<String> = NegotiationGate::new(Duration::from_secs(10));
        gate.report_success();

        let start = Instant::now();
        assert_eq!(gate.check_or_await(), Ok(()));
        assert!(start.elapsed() < Duration::from_millis(100));
    }
}
