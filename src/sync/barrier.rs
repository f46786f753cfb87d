//! Cooperative pause barrier between the update session and peripheral
//! tasks.
//!
//! Peripheral tasks join once and call [`PauseBarrier::checkpoint`] at a
//! safe point in their loop. While a pause is requested the checkpoint
//! acknowledges and parks the task until [`PauseBarrier::resume`]. The
//! requester waits, bounded, for every joined task to acknowledge.
//!
//! ```text
//!   update ── request_pause ──▶ [requested] ◀── checkpoint (ack, park)
//!          ◀── all acked / timeout
//!   update ── resume ─────────▶ parked tasks continue
//! ```

use core::cell::RefCell;
use core::time::Duration;

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;
use log::{info, warn};

use crate::sync::timed;

/// Most peripheral tasks that can take part in a pause.
pub const MAX_PARTICIPANTS: usize = 4;

/// Handle returned by [`PauseBarrier::join`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParticipantId(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseOutcome {
    /// Every participant acknowledged (or none are joined).
    Paused,
    /// The wait elapsed first.
    TimedOut { acknowledged: usize, expected: usize },
}

#[derive(Default)]
struct State {
    joined: [bool; MAX_PARTICIPANTS],
    paused: [bool; MAX_PARTICIPANTS],
    requested: bool,
}

impl State {
    fn expected(&self) -> usize {
        self.joined.iter().filter(|j| **j).count()
    }

    fn acknowledged(&self) -> usize {
        self.paused.iter().filter(|p| **p).count()
    }
}

pub struct PauseBarrier {
    state: Mutex<CriticalSectionRawMutex, RefCell<State>>,
    all_paused: Signal<CriticalSectionRawMutex, ()>,
    resumed: [Signal<CriticalSectionRawMutex, ()>; MAX_PARTICIPANTS],
}

impl Default for PauseBarrier {
    fn default() -> Self {
        Self::new()
    }
}

impl PauseBarrier {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RefCell::new(State::default())),
            all_paused: Signal::new(),
            resumed: core::array::from_fn(|_| Signal::new()),
        }
    }

    /// Register a peripheral task. `None` when every slot is taken.
    pub fn join(&self) -> Option<ParticipantId> {
        self.state.lock(|s| {
            let mut s = s.borrow_mut();
            let slot = s.joined.iter().position(|j| !*j)?;
            s.joined[slot] = true;
            Some(ParticipantId(slot))
        })
    }

    /// Unregister a peripheral task.
    pub fn leave(&self, id: ParticipantId) {
        let complete = self.state.lock(|s| {
            let mut s = s.borrow_mut();
            s.joined[id.0] = false;
            s.paused[id.0] = false;
            s.requested && s.acknowledged() >= s.expected()
        });
        if complete {
            self.all_paused.signal(());
        }
    }

    /// Count of tasks a pause waits for.
    pub fn expected(&self) -> usize {
        self.state.lock(|s| s.borrow().expected())
    }

    pub fn is_pause_requested(&self) -> bool {
        self.state.lock(|s| s.borrow().requested)
    }

    /// Ask every joined task to pause and wait up to `timeout` for all of
    /// them to acknowledge. Tasks still parked from an earlier pause count
    /// as acknowledged. On timeout the request stays raised; the caller
    /// decides whether to [`resume`](Self::resume).
    pub fn request_pause(&self, timeout: Duration) -> PauseOutcome {
        self.all_paused.reset();
        let (acknowledged, expected) = self.state.lock(|s| {
            let mut s = s.borrow_mut();
            s.requested = true;
            (s.acknowledged(), s.expected())
        });
        if acknowledged >= expected {
            return PauseOutcome::Paused;
        }

        info!("TASK: pausing {} peripheral task(s)", expected);
        if timed::wait_within(self.all_paused.wait(), timeout) {
            return PauseOutcome::Paused;
        }

        let (acknowledged, expected) = self
            .state
            .lock(|s| (s.borrow().acknowledged(), s.borrow().expected()));
        if acknowledged >= expected {
            return PauseOutcome::Paused;
        }
        warn!(
            "TASK: pause timed out ({}/{} acknowledged)",
            acknowledged, expected
        );
        PauseOutcome::TimedOut {
            acknowledged,
            expected,
        }
    }

    /// Release every paused task and clear the request.
    pub fn resume(&self) {
        let parked = self.state.lock(|s| {
            let mut s = s.borrow_mut();
            s.requested = false;
            let parked = s.paused;
            s.paused = [false; MAX_PARTICIPANTS];
            parked
        });
        for (slot, was_parked) in parked.iter().enumerate() {
            if *was_parked {
                self.resumed[slot].signal(());
            }
        }
        info!("TASK: peripherals resumed");
    }

    /// Safe point for a peripheral task. Returns immediately unless a pause
    /// is requested; otherwise acknowledges and blocks until resumed.
    /// Returns whether the task was parked.
    pub fn checkpoint(&self, id: ParticipantId) -> bool {
        let (park, complete) = self.state.lock(|s| {
            let mut s = s.borrow_mut();
            if !s.requested || !s.joined[id.0] || s.paused[id.0] {
                return (false, false);
            }
            s.paused[id.0] = true;
            (true, s.acknowledged() >= s.expected())
        });
        if !park {
            return false;
        }
        if complete {
            self.all_paused.signal(());
        }
        futures_lite::future::block_on(self.resumed[id.0].wait());
        true
    }
}
