//! Priority-ordered queue of requests waiting for an execlist port.
//!
//! Requests are grouped into FIFO buckets keyed by priority. Equal-priority work is never
//! reordered: later requests may depend on earlier ones without an explicit fence.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use crate::request::{Request, RequestRef, PRIORITY_NORMAL};

/// Hint value while nothing is queued.
pub const NO_PRIORITY_HINT: i32 = i32::MIN;

/// Whether queued work at priority `hint` should preempt a running request at `running`.
///
/// Low (negative) priority work never preempts anything, and nothing preempts work of the same
/// priority: the running request keeps running to preserve FIFO ordering of dependencies.
#[inline]
pub fn need_preempt(hint: i32, running: i32) -> bool {
    hint > running.max(PRIORITY_NORMAL - 1)
}

#[derive(Debug)]
pub struct PriorityQueue {
    /// Almost everything is submitted at the default priority; keep that bucket out of the map.
    default_bucket: VecDeque<RequestRef>,
    buckets: BTreeMap<i32, VecDeque<RequestRef>>,
    len: usize,
    queue_priority_hint: i32,
}

impl Default for PriorityQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl PriorityQueue {
    pub fn new() -> Self {
        Self {
            default_bucket: VecDeque::new(),
            buckets: BTreeMap::new(),
            len: 0,
            queue_priority_hint: NO_PRIORITY_HINT,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Highest priority of anything queued, or [`NO_PRIORITY_HINT`].
    pub fn queue_priority_hint(&self) -> i32 {
        self.queue_priority_hint
    }

    fn bucket_mut(&mut self, priority: i32) -> &mut VecDeque<RequestRef> {
        if priority == PRIORITY_NORMAL {
            &mut self.default_bucket
        } else {
            self.buckets.entry(priority).or_default()
        }
    }

    fn bucket(&self, priority: i32) -> Option<&VecDeque<RequestRef>> {
        if priority == PRIORITY_NORMAL {
            Some(&self.default_bucket)
        } else {
            self.buckets.get(&priority)
        }
    }

    /// Appends `rq` to the tail of its priority bucket.
    pub fn insert(&mut self, rq: RequestRef) {
        let priority = rq.priority();
        self.bucket_mut(priority).push_back(rq);
        self.len += 1;
        self.queue_priority_hint = self.queue_priority_hint.max(priority);
    }

    /// Puts `rq` back at the head of its priority bucket.
    ///
    /// Used when unwinding preempted work; calling it newest-first restores the original order.
    pub fn requeue_front(&mut self, rq: RequestRef) {
        let priority = rq.priority();
        self.bucket_mut(priority).push_front(rq);
        self.len += 1;
        self.queue_priority_hint = self.queue_priority_hint.max(priority);
    }

    pub fn contains(&self, rq: &Request) -> bool {
        self.bucket(rq.priority())
            .is_some_and(|b| b.iter().any(|x| core::ptr::eq(&**x, rq)))
    }

    /// Removes `rq` from its bucket. Returns `false` if it was not queued.
    pub fn remove(&mut self, rq: &Request) -> bool {
        let priority = rq.priority();
        let bucket = if priority == PRIORITY_NORMAL {
            &mut self.default_bucket
        } else {
            match self.buckets.get_mut(&priority) {
                Some(bucket) => bucket,
                None => return false,
            }
        };
        let Some(pos) = bucket.iter().position(|x| core::ptr::eq(&**x, rq)) else {
            return false;
        };
        bucket.remove(pos);
        let emptied = bucket.is_empty();
        self.len -= 1;

        if emptied {
            if priority != PRIORITY_NORMAL {
                self.buckets.remove(&priority);
            }
            // Only losing the last request of the highest bucket can lower the hint.
            if priority == self.queue_priority_hint {
                self.recompute_hint();
            }
        }
        true
    }

    fn recompute_hint(&mut self) {
        let mapped = self.buckets.keys().next_back().copied();
        let default = (!self.default_bucket.is_empty()).then_some(PRIORITY_NORMAL);
        self.queue_priority_hint = mapped.max(default).unwrap_or(NO_PRIORITY_HINT);
    }

    /// Moves a queued request to the tail of the `priority` bucket.
    ///
    /// Returns `false` (and leaves the priority alone) if the request is not queued here.
    pub fn reprioritize(&mut self, rq: &RequestRef, priority: i32) -> bool {
        if !self.contains(rq) {
            return false;
        }
        if rq.priority() == priority {
            return true;
        }
        self.remove(rq);
        rq.set_priority(priority);
        self.insert(Arc::clone(rq));
        true
    }

    /// Queued requests in dequeue order: highest priority first, FIFO within a priority.
    pub fn iter(&self) -> impl Iterator<Item = &RequestRef> + '_ {
        let high = self
            .buckets
            .range(PRIORITY_NORMAL + 1..)
            .rev()
            .flat_map(|(_, b)| b.iter());
        let low = self
            .buckets
            .range(..PRIORITY_NORMAL)
            .rev()
            .flat_map(|(_, b)| b.iter());
        high.chain(self.default_bucket.iter()).chain(low)
    }

    /// The first request in dequeue order accepted by `is_ready`, without consuming it.
    pub fn first_ready(&self, mut is_ready: impl FnMut(&Request) -> bool) -> Option<RequestRef> {
        self.iter().find(|rq| is_ready(rq)).cloned()
    }

    /// Consumes the next request whose dependencies are satisfied.
    ///
    /// Requests that are not ready yet are skipped, not consumed.
    pub fn dequeue_ready(&mut self, is_ready: impl FnMut(&Request) -> bool) -> Option<RequestRef> {
        let rq = self.first_ready(is_ready)?;
        self.remove(&rq);
        Some(rq)
    }

    /// Empties the queue, returning everything in dequeue order.
    pub fn drain(&mut self) -> Vec<RequestRef> {
        let drained: Vec<RequestRef> = self.iter().cloned().collect();
        self.default_bucket.clear();
        self.buckets.clear();
        self.len = 0;
        self.queue_priority_hint = NO_PRIORITY_HINT;
        drained
    }
}
