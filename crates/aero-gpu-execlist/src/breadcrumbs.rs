//! Breadcrumb waiters.
//!
//! Every request ends with a breadcrumb that writes its seqno to the engine's completion counter
//! and raises the user interrupt. Waiters are kept sorted by target seqno; the first one is the
//! "bottom half" and is the only one the interrupt path needs to look at. One coherent read of
//! the counter wakes every waiter that has been passed and hands the duty to the next.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use crate::hw::EngineHw;
use crate::request::{seqno_passed, Seqno};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[derive(Debug, Default)]
struct WakeState {
    woken: Mutex<bool>,
    cv: Condvar,
}

/// Handle to a registered wait. Clones observe the same wake-up.
///
/// Being woken means "look at the request again", not "the request completed". Waiters are also
/// woken when a preemption releases their seqno or when the device is wedged, so callers check the
/// request state after every wake. Seqno 0 (a request not yet handed to the hardware) counts as
/// passed: register the wait after the request has a seqno.
#[derive(Debug, Clone)]
pub struct Waiter {
    id: u64,
    seqno: Seqno,
    state: Arc<WakeState>,
}

impl Waiter {
    fn new(id: u64, seqno: Seqno) -> Self {
        Self {
            id,
            seqno,
            state: Arc::new(WakeState::default()),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn seqno(&self) -> Seqno {
        self.seqno
    }

    pub fn is_signaled(&self) -> bool {
        *lock(&self.state.woken)
    }

    /// Blocks until the waiter is woken or `timeout` elapses. Returns whether it was woken, which
    /// does not by itself mean the request completed.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let guard = lock(&self.state.woken);
        match self.state.cv.wait_timeout_while(guard, timeout, |woken| !*woken) {
            Ok((guard, _)) => *guard,
            Err(poisoned) => *poisoned.into_inner().0,
        }
    }

    fn wake(&self) {
        *lock(&self.state.woken) = true;
        self.state.cv.notify_all();
    }
}

#[derive(Debug, Default)]
pub struct Breadcrumbs {
    /// Sorted by seqno (wrap-safe), FIFO among equal seqnos. The front is the bottom half.
    waiters: VecDeque<Waiter>,
    next_id: u64,
    irq_armed: bool,
}

impl Breadcrumbs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }

    /// Whether the user interrupt is currently enabled on behalf of the waiters.
    pub fn is_armed(&self) -> bool {
        self.irq_armed
    }

    /// Id of the waiter currently holding bottom-half duty.
    pub fn bottom_half(&self) -> Option<u64> {
        self.waiters.front().map(Waiter::id)
    }

    fn arm<H: EngineHw + ?Sized>(&mut self, hw: &mut H) {
        if !self.irq_armed {
            hw.irq_enable();
            self.irq_armed = true;
            tracing::debug!("breadcrumb irq armed");
        }
    }

    fn disarm<H: EngineHw + ?Sized>(&mut self, hw: &mut H) {
        if self.irq_armed {
            hw.irq_disable();
            self.irq_armed = false;
            tracing::debug!("breadcrumb irq disarmed");
        }
    }

    /// Registers a wait for the completion counter to reach `seqno`.
    ///
    /// A seqno that has already passed yields a waiter that is signaled on return and never
    /// registered.
    pub fn add_waiter<H: EngineHw + ?Sized>(&mut self, seqno: Seqno, hw: &mut H) -> Waiter {
        self.next_id += 1;
        let waiter = Waiter::new(self.next_id, seqno);
        if seqno_passed(hw.read_completion_counter(), seqno) {
            waiter.wake();
            return waiter;
        }

        let pos = self
            .waiters
            .iter()
            .position(|w| !seqno_passed(seqno, w.seqno))
            .unwrap_or(self.waiters.len());
        self.waiters.insert(pos, waiter.clone());
        self.arm(hw);

        if pos == 0 {
            tracing::debug!(waiter = waiter.id, seqno, "new breadcrumb bottom half");
            // The breadcrumb may have landed before the interrupt was enabled.
            let counter = hw.read_completion_counter();
            if seqno_passed(counter, seqno) {
                self.signal(counter, hw);
            }
        }
        waiter
    }

    /// Unlinks a waiter that no longer wants to be woken. Returns `false` if it was not
    /// registered (already woken or removed).
    pub fn remove_waiter<H: EngineHw + ?Sized>(&mut self, id: u64, hw: &mut H) -> bool {
        let Some(pos) = self.waiters.iter().position(|w| w.id == id) else {
            return false;
        };
        self.waiters.remove(pos);
        if pos == 0 {
            if let Some(next) = self.waiters.front() {
                tracing::debug!(waiter = next.id, seqno = next.seqno, "bottom half promoted");
            }
        }
        if self.waiters.is_empty() {
            self.disarm(hw);
        }
        true
    }

    /// Wakes every waiter whose seqno `counter` has passed. Returns the number woken.
    pub fn signal<H: EngineHw + ?Sized>(&mut self, counter: Seqno, hw: &mut H) -> usize {
        let mut woken = 0;
        while let Some(front) = self.waiters.front() {
            if !seqno_passed(counter, front.seqno) {
                break;
            }
            if let Some(waiter) = self.waiters.pop_front() {
                waiter.wake();
                woken += 1;
            }
        }
        if self.waiters.is_empty() {
            self.disarm(hw);
        }
        woken
    }

    /// Wakes waiters targeting `first` or any later seqno.
    ///
    /// Used when seqnos are released by a preemption: those waiters must look at their request
    /// again rather than wait for a seqno that now belongs to different work.
    pub fn wake_from<H: EngineHw + ?Sized>(&mut self, first: Seqno, hw: &mut H) -> usize {
        let before = self.waiters.len();
        self.waiters.retain(|w| {
            let released = seqno_passed(w.seqno, first);
            if released {
                w.wake();
            }
            !released
        });
        if self.waiters.is_empty() {
            self.disarm(hw);
        }
        before - self.waiters.len()
    }

    /// Wakes everyone (device wedged).
    pub fn wake_all<H: EngineHw + ?Sized>(&mut self, hw: &mut H) -> usize {
        let woken = self.waiters.len();
        for waiter in self.waiters.drain(..) {
            waiter.wake();
        }
        self.disarm(hw);
        woken
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedEngine;
    use pretty_assertions::assert_eq;

    #[test]
    fn first_waiter_arms_and_last_disarms() {
        let mut hw = SimulatedEngine::default();
        let mut b = Breadcrumbs::new();
        assert!(!hw.irq_enabled());

        let w = b.add_waiter(3, &mut hw);
        assert!(hw.irq_enabled());
        assert_eq!(b.bottom_half(), Some(w.id()));

        assert!(b.remove_waiter(w.id(), &mut hw));
        assert!(!hw.irq_enabled());
        assert!(!b.remove_waiter(w.id(), &mut hw));
    }

    #[test]
    fn waiters_are_sorted_and_bottom_half_moves_on() {
        let mut hw = SimulatedEngine::default();
        let mut b = Breadcrumbs::new();
        let w5 = b.add_waiter(5, &mut hw);
        let w2 = b.add_waiter(2, &mut hw);
        let w2b = b.add_waiter(2, &mut hw);
        let w9 = b.add_waiter(9, &mut hw);
        assert_eq!(b.bottom_half(), Some(w2.id()));

        assert_eq!(b.signal(4, &mut hw), 2);
        assert!(w2.is_signaled() && w2b.is_signaled());
        assert!(!w5.is_signaled());
        assert_eq!(b.bottom_half(), Some(w5.id()));
        assert!(hw.irq_enabled());

        assert_eq!(b.signal(9, &mut hw), 2);
        assert!(w9.is_signaled());
        assert!(b.is_empty());
        assert!(!hw.irq_enabled());
    }

    #[test]
    fn removing_the_bottom_half_promotes_the_next_waiter() {
        let mut hw = SimulatedEngine::default();
        let mut b = Breadcrumbs::new();
        let first = b.add_waiter(1, &mut hw);
        let second = b.add_waiter(2, &mut hw);

        b.remove_waiter(first.id(), &mut hw);
        assert_eq!(b.bottom_half(), Some(second.id()));
        assert!(hw.irq_enabled());
        assert!(!first.is_signaled());
    }

    #[test]
    fn already_passed_seqno_is_signaled_immediately() {
        let mut hw = SimulatedEngine::default();
        hw.set_completion_counter(10);
        let mut b = Breadcrumbs::new();
        let w = b.add_waiter(7, &mut hw);
        assert!(w.is_signaled());
        assert!(b.is_empty());
        assert!(!hw.irq_enabled());
        assert!(w.wait_timeout(Duration::from_millis(1)));
    }

    #[test]
    fn ordering_survives_seqno_wraparound() {
        let mut hw = SimulatedEngine::default();
        hw.set_completion_counter(u32::MAX - 4);
        let mut b = Breadcrumbs::new();
        let late = b.add_waiter(3, &mut hw);
        let early = b.add_waiter(u32::MAX - 1, &mut hw);
        assert_eq!(b.bottom_half(), Some(early.id()));

        assert_eq!(b.signal(u32::MAX, &mut hw), 1);
        assert!(!late.is_signaled());
        assert_eq!(b.signal(3, &mut hw), 1);
        assert!(late.is_signaled());
    }

    #[test]
    fn wake_from_releases_later_waiters_only() {
        let mut hw = SimulatedEngine::default();
        let mut b = Breadcrumbs::new();
        let keep = b.add_waiter(2, &mut hw);
        let gone = b.add_waiter(4, &mut hw);
        assert_eq!(b.wake_from(3, &mut hw), 1);
        assert!(gone.is_signaled());
        assert!(!keep.is_signaled());
        assert_eq!(b.len(), 1);

        assert_eq!(b.wake_all(&mut hw), 1);
        assert!(keep.is_signaled());
        assert!(!b.is_armed());
    }

    #[test]
    fn wait_timeout_returns_once_woken_from_another_thread() {
        let mut hw = SimulatedEngine::default();
        let mut b = Breadcrumbs::new();
        let w = b.add_waiter(1, &mut hw);
        let handle = {
            let w = w.clone();
            std::thread::spawn(move || w.wait_timeout(Duration::from_secs(5)))
        };
        b.signal(1, &mut hw);
        assert!(handle.join().unwrap());
    }
}
