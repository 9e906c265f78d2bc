//! Requests: the schedulable unit of GPU work, and the fence state consumers observe.

use core::sync::atomic::{AtomicI32, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

/// Hardware completion counter value.
pub type Seqno = u32;

/// Hardware context identifier as written into the execlist submit ports.
pub type ContextId = u32;

pub type RequestRef = Arc<Request>;

pub const PRIORITY_MIN: i32 = -1023;
pub const PRIORITY_NORMAL: i32 = 0;
pub const PRIORITY_MAX: i32 = 1023;

/// Bytes reserved at the end of every request for the completion breadcrumb (seqno store +
/// user interrupt).
pub const BREADCRUMB_BYTES: u32 = 8;

/// `MI_USER_INTERRUPT`, the second dword of every breadcrumb.
pub const MI_USER_INTERRUPT: u32 = 0x02 << 23;

/// Wrap-safe "has `seq1` reached `seq2`".
#[inline]
pub fn seqno_passed(seq1: Seqno, seq2: Seqno) -> bool {
    (seq1.wrapping_sub(seq2) as i32) >= 0
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// Waiting in the priority queue.
    Queued = 0,
    /// Handed to an execlist port.
    InFlight = 1,
    Completed = 2,
    /// Completed without hardware acknowledgement (device wedged).
    Failed = 3,
}

impl RequestState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => RequestState::Queued,
            1 => RequestState::InFlight,
            2 => RequestState::Completed,
            _ => RequestState::Failed,
        }
    }
}

/// Location of a request inside its context ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingSpan {
    /// First byte of the request's commands.
    pub head: u32,
    /// Offset of the breadcrumb slot.
    pub breadcrumb: u32,
    /// One past the last byte (what the hardware tail is set to).
    pub tail: u32,
}

#[derive(Debug)]
pub struct Request {
    id: u64,
    engine: usize,
    context_id: ContextId,
    span: RingSpan,
    /// Requests that must run (or be running on this engine) first. A dependency that has been
    /// dropped by everyone else was retired long ago.
    deps: Vec<Weak<Request>>,
    priority: AtomicI32,
    seqno: AtomicU32,
    state: AtomicU8,
    /// Engine reset epoch the request's ring span belongs to.
    epoch: u32,
}

impl Request {
    pub fn new(
        id: u64,
        engine: usize,
        context_id: ContextId,
        priority: i32,
        span: RingSpan,
        deps: Vec<RequestRef>,
    ) -> Self {
        Self {
            id,
            engine,
            context_id,
            span,
            deps: deps.iter().map(Arc::downgrade).collect(),
            priority: AtomicI32::new(priority.clamp(PRIORITY_MIN, PRIORITY_MAX)),
            seqno: AtomicU32::new(0),
            state: AtomicU8::new(RequestState::Queued as u8),
            epoch: 0,
        }
    }

    pub(crate) fn with_epoch(mut self, epoch: u32) -> Self {
        self.epoch = epoch;
        self
    }

    /// Creation order on the owning engine.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn engine(&self) -> usize {
        self.engine
    }

    pub fn context_id(&self) -> ContextId {
        self.context_id
    }

    pub fn span(&self) -> RingSpan {
        self.span
    }

    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    /// Dependencies that are still alive.
    pub fn dependencies(&self) -> Vec<RequestRef> {
        self.deps.iter().filter_map(Weak::upgrade).collect()
    }

    pub fn priority(&self) -> i32 {
        self.priority.load(Ordering::Relaxed)
    }

    pub(crate) fn set_priority(&self, priority: i32) {
        self.priority.store(
            priority.clamp(PRIORITY_MIN, PRIORITY_MAX),
            Ordering::Relaxed,
        );
    }

    /// Execution-order seqno, or 0 while the request has not been handed to the hardware.
    pub fn seqno(&self) -> Seqno {
        self.seqno.load(Ordering::Acquire)
    }

    pub(crate) fn set_seqno(&self, seqno: Seqno) {
        self.seqno.store(seqno, Ordering::Release);
    }

    pub fn state(&self) -> RequestState {
        RequestState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: RequestState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Whether the fence has signaled, successfully or not.
    pub fn is_signaled(&self) -> bool {
        matches!(
            self.state(),
            RequestState::Completed | RequestState::Failed
        )
    }

    pub fn is_completed(&self) -> bool {
        self.state() == RequestState::Completed
    }

    pub fn is_failed(&self) -> bool {
        self.state() == RequestState::Failed
    }

    pub fn is_in_flight(&self) -> bool {
        self.state() == RequestState::InFlight
    }

    pub fn is_queued(&self) -> bool {
        self.state() == RequestState::Queued
    }

    /// Whether every dependency allows this request to be handed to `engine`.
    ///
    /// Work already in flight on the same engine counts as satisfied: the hardware executes
    /// submissions in order.
    pub fn is_ready(&self) -> bool {
        self.deps.iter().all(|dep| {
            dep.upgrade().map_or(true, |dep| {
                dep.is_signaled() || (dep.engine == self.engine && dep.is_in_flight())
            })
        })
    }
}
