//! TLS support: the record engine and the pipeline stage built on it.

pub(crate) mod engine;
pub(crate) mod stage;

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::Error;

/// Cross-thread latch for handshake completion. Dispatcher-side code
/// completes it exactly once per handshake; foreign threads block on
/// [`wait`](HandshakeGate::wait) with a deadline. Re-armed when TLS is
/// activated mid-stream.
pub(crate) struct HandshakeGate {
    state: Mutex<GateState>,
    cond: Condvar,
}

#[derive(Clone)]
enum GateState {
    Pending,
    Done,
    Failed(String),
}

impl HandshakeGate {
    pub fn new() -> Self {
        HandshakeGate {
            state: Mutex::new(GateState::Pending),
            cond: Condvar::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, GateState> {
        match self.state.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Mark the handshake complete and release all waiters.
    pub fn complete(&self) {
        let mut state = self.lock();
        if matches!(*state, GateState::Pending) {
            *state = GateState::Done;
            self.cond.notify_all();
        }
    }

    /// Mark the handshake failed. No-op once completed.
    pub fn fail(&self, reason: &str) {
        let mut state = self.lock();
        if matches!(*state, GateState::Pending) {
            *state = GateState::Failed(reason.to_string());
            self.cond.notify_all();
        }
    }

    /// Re-arm for a new handshake (mid-stream TLS activation).
    pub fn rearm(&self) {
        let mut state = self.lock();
        *state = GateState::Pending;
    }

    /// Block until the handshake settles or the deadline passes. Robust
    /// against spurious wakeups.
    pub fn wait(&self, timeout: Duration) -> Result<(), Error> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            match &*state {
                GateState::Done => return Ok(()),
                GateState::Failed(reason) => {
                    return Err(Error::Tls(rustls::Error::General(reason.clone())));
                }
                GateState::Pending => {}
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::HandshakeTimeout);
            }
            let (guard, _) = match self.cond.wait_timeout(state, deadline - now) {
                Ok(r) => r,
                Err(poisoned) => poisoned.into_inner(),
            };
            state = guard;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn wait_times_out_when_pending() {
        let gate = HandshakeGate::new();
        let err = gate.wait(Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, Error::HandshakeTimeout));
    }

    #[test]
    fn complete_releases_waiter() {
        let gate = Arc::new(HandshakeGate::new());
        let g2 = gate.clone();
        let t = std::thread::spawn(move || g2.wait(Duration::from_secs(5)));
        std::thread::sleep(Duration::from_millis(10));
        gate.complete();
        t.join().unwrap().unwrap();
    }

    #[test]
    fn fail_surfaces_reason() {
        let gate = HandshakeGate::new();
        gate.fail("peer rejected certificate");
        let err = gate.wait(Duration::from_secs(1)).unwrap_err();
        assert!(err.to_string().contains("peer rejected certificate"));
    }

    #[test]
    fn rearm_resets_a_settled_gate() {
        let gate = HandshakeGate::new();
        gate.complete();
        gate.wait(Duration::from_millis(1)).unwrap();
        gate.rearm();
        assert!(matches!(
            gate.wait(Duration::from_millis(5)),
            Err(Error::HandshakeTimeout)
        ));
    }
}
