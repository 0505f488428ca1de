//! Producer/hardware rendezvous for period-synchronous playback.
//!
//! Two threads meet here once per hardware period: the producer thread
//! blocks in [`CallbackGate::wait_for_callback`] until the hardware side
//! announces that a period has elapsed, fills its buffer, and answers with
//! [`CallbackGate::signal_finish`]; the hardware side blocks in
//! [`CallbackGate::wait_for_finish`] until that answer arrives. Every wait
//! is bounded and re-checks the cooperative shutdown flag on wakeup, so
//! `stop()` can never deadlock either side.

use core::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::lockfree::AtomicFlag;

/// Synchronization phase of the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncState {
    /// Both waits are disabled; periods run back-to-back (offline export).
    PassThrough,
    /// `start()` has run but the hardware has not called back yet. The
    /// first callback skips the finish wait: there is no previous period
    /// to wait for.
    InitialCallback,
    /// Producer is blocked waiting for the period-elapsed signal.
    AwaitCallback,
    /// Period elapsed; producer is running.
    CallbackReady,
    /// Hardware is blocked waiting for the buffer-filled signal.
    AwaitFinish,
    /// Buffer filled; hardware is consuming.
    FinishReady,
    #[default]
    Stopped,
}

/// How a bounded wait resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Signalled,
    TimedOut,
    Shutdown,
}

/// One (mutex, condvar) pair with a latched ready flag.
///
/// The scoped lock guard guarantees release on every exit path, including
/// timeout and shutdown. A signal that lands while nobody is waiting stays
/// latched for the next waiter; a signal racing `stop()` is benign and is
/// simply consumed or discarded.
struct Rendezvous {
    ready: Mutex<bool>,
    cond: Condvar,
}

impl Rendezvous {
    fn new() -> Self {
        Self {
            ready: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    fn wait(&self, timeout: Duration, shutdown: &AtomicFlag) -> WaitOutcome {
        let mut ready = self.ready.lock();
        loop {
            if shutdown.get() {
                return WaitOutcome::Shutdown;
            }
            if *ready {
                *ready = false;
                return WaitOutcome::Signalled;
            }
            if self.cond.wait_for(&mut ready, timeout).timed_out() {
                // The signal may have raced the timeout; prefer it.
                if *ready {
                    *ready = false;
                    return WaitOutcome::Signalled;
                }
                if shutdown.get() {
                    return WaitOutcome::Shutdown;
                }
                return WaitOutcome::TimedOut;
            }
        }
    }

    fn signal(&self) {
        let mut ready = self.ready.lock();
        *ready = true;
        self.cond.notify_one();
    }

    /// Wake any waiter without latching a signal. Taking the lock first
    /// closes the window where a waiter has checked the shutdown flag but
    /// not yet parked.
    fn wake_all(&self) {
        let _ready = self.ready.lock();
        self.cond.notify_all();
    }

    fn clear(&self) {
        *self.ready.lock() = false;
    }
}

/// Two-phase rendezvous between the producer and hardware-callback threads.
pub struct CallbackGate {
    state: Mutex<SyncState>,
    callback: Rendezvous,
    finish: Rendezvous,
    shutdown: AtomicFlag,
    initial: AtomicFlag,
    timeout: Duration,
}

impl CallbackGate {
    pub fn new(timeout: Duration) -> Self {
        Self {
            state: Mutex::new(SyncState::Stopped),
            callback: Rendezvous::new(),
            finish: Rendezvous::new(),
            shutdown: AtomicFlag::new(false),
            initial: AtomicFlag::new(false),
            timeout,
        }
    }

    pub fn state(&self) -> SyncState {
        *self.state.lock()
    }

    /// Deadline applied to every bounded wait.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_state(&self, state: SyncState) {
        *self.state.lock() = state;
    }

    pub fn is_pass_through(&self) -> bool {
        self.state() == SyncState::PassThrough
    }

    /// Disable both waits; used for offline/batch export where periods run
    /// at full speed on a single thread.
    pub fn set_pass_through(&self) {
        self.set_state(SyncState::PassThrough);
    }

    /// Arm the gate for a new playback run.
    pub fn start(&self) {
        self.shutdown.set(false);
        self.initial.set(true);
        self.callback.clear();
        self.finish.clear();
        self.set_state(SyncState::InitialCallback);
    }

    /// Request cooperative shutdown. Idempotent; both sides unblock within
    /// their bounded timeout, usually immediately.
    pub fn stop(&self) {
        self.shutdown.set(true);
        self.callback.wake_all();
        self.finish.wake_all();
        self.set_state(SyncState::Stopped);
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.get()
    }

    /// Producer side: block until the hardware reports a period elapsed.
    pub fn wait_for_callback(&self) -> WaitOutcome {
        if self.is_pass_through() {
            return WaitOutcome::Signalled;
        }
        self.set_state(SyncState::AwaitCallback);
        let outcome = self.callback.wait(self.timeout, &self.shutdown);
        if outcome == WaitOutcome::Signalled {
            self.set_state(SyncState::CallbackReady);
        }
        outcome
    }

    /// Hardware side: report that a period has elapsed.
    pub fn signal_callback(&self) {
        if self.is_pass_through() || self.shutdown.get() {
            return;
        }
        self.callback.signal();
    }

    /// Producer side: report that the period buffer is filled.
    pub fn signal_finish(&self) {
        if self.is_pass_through() || self.shutdown.get() {
            return;
        }
        self.set_state(SyncState::FinishReady);
        self.finish.signal();
    }

    /// Hardware side: block until the producer has filled the buffer.
    ///
    /// The very first callback after `start()` returns immediately: the
    /// producer has not been released for period zero yet.
    pub fn wait_for_finish(&self) -> WaitOutcome {
        if self.is_pass_through() {
            return WaitOutcome::Signalled;
        }
        if self.initial.swap(false) {
            return WaitOutcome::Signalled;
        }
        self.set_state(SyncState::AwaitFinish);
        let outcome = self.finish.wait(self.timeout, &self.shutdown);
        if outcome == WaitOutcome::Signalled {
            self.set_state(SyncState::FinishReady);
        }
        outcome
    }
}
