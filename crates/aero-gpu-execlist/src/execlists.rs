//! Per-engine execlist scheduler.
//!
//! Requests wait in a [`PriorityQueue`] until their dependencies allow them to run, are then
//! handed to the submit ports (receiving their seqno in hardware execution order) and retire
//! when the context status buffer reports their context switched out. Work of higher priority
//! than the active port preempts it: the hardware switches to an idle preempt context, everything
//! that had not completed is unwound back into the queue and the ports are reloaded in priority
//! order.
//!
//! All methods expect to run under the engine lock (see [`crate::Gpu`]); nothing here blocks.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Weak};

use bitflags::bitflags;

use crate::breadcrumbs::{Breadcrumbs, Waiter};
use crate::config::ExeclistConfig;
use crate::csb::{decode, CsbCursor, CsbEntry, CsbEvent};
use crate::error::{ExeclistError, Result, RingError};
use crate::hw::{ElspElement, EngineHw};
use crate::port::Ports;
use crate::priolist::{need_preempt, PriorityQueue, NO_PRIORITY_HINT};
use crate::request::{
    seqno_passed, ContextId, Request, RequestRef, RequestState, RingSpan, Seqno,
    BREADCRUMB_BYTES, MI_USER_INTERRUPT, PRIORITY_MAX, PRIORITY_MIN,
};
use crate::ring::{Ring, MI_NOOP, RING_OFFSET_ALIGN};
use crate::stats::EngineStats;

bitflags! {
    /// Engine activity. The bits are independent and overlap during transitions.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
    pub struct ActiveFlags: u8 {
        /// User work is loaded in the ports.
        const USER = 1 << 0;
        /// A preemption was injected and has not completed yet.
        const PREEMPT = 1 << 1;
        /// The last submit port write has not been acknowledged by the hardware.
        const HWACK = 1 << 2;
    }
}

#[derive(Debug)]
struct ContextState {
    ring: Ring,
    /// Most recently created request; the next one is ordered after it.
    last: Option<Weak<Request>>,
}

/// Outcome of one pass over the context status buffer.
#[derive(Debug, Default)]
pub struct CsbReport {
    /// Status entries consumed.
    pub processed: usize,
    /// Requests retired during the pass, in completion order.
    pub retired: Vec<RequestRef>,
    /// Entries that matched nothing this engine expected. They were skipped.
    pub unexpected: Vec<ExeclistError>,
    pub preemption_completed: bool,
    /// Breadcrumb waiters woken.
    pub woken: usize,
}

#[derive(Debug)]
pub struct Execlists<H> {
    engine: usize,
    cfg: ExeclistConfig,
    hw: H,
    queue: PriorityQueue,
    ports: Ports,
    active: ActiveFlags,
    csb: CsbCursor,
    contexts: BTreeMap<ContextId, ContextState>,
    /// Requests handed to the ports and not yet retired, oldest seqno first.
    inflight: VecDeque<RequestRef>,
    timeline_seqno: Seqno,
    next_request_id: u64,
    breadcrumbs: Breadcrumbs,
    stats: Arc<EngineStats>,
    /// `now_ns` at the time the outstanding preemption was injected.
    preempt_started_ns: Option<u64>,
    now_ns: u64,
    wedged: bool,
    /// Bumped by every reset; requests from an earlier epoch refer to rings that no longer exist.
    epoch: u32,
}

impl<H: EngineHw> Execlists<H> {
    pub fn new(engine: usize, cfg: ExeclistConfig, hw: H) -> Result<Self> {
        cfg.validate()?;
        Ok(Self {
            engine,
            queue: PriorityQueue::new(),
            ports: Ports::new(cfg.num_ports),
            active: ActiveFlags::empty(),
            csb: CsbCursor::new(cfg.csb_entries),
            contexts: BTreeMap::new(),
            inflight: VecDeque::new(),
            timeline_seqno: 0,
            next_request_id: 0,
            breadcrumbs: Breadcrumbs::new(),
            stats: Arc::new(EngineStats::new()),
            preempt_started_ns: None,
            now_ns: 0,
            wedged: false,
            epoch: 0,
            cfg,
            hw,
        })
    }

    pub fn engine(&self) -> usize {
        self.engine
    }

    pub fn config(&self) -> &ExeclistConfig {
        &self.cfg
    }

    pub fn hw(&self) -> &H {
        &self.hw
    }

    pub fn hw_mut(&mut self) -> &mut H {
        &mut self.hw
    }

    pub fn queue(&self) -> &PriorityQueue {
        &self.queue
    }

    pub fn ports(&self) -> &Ports {
        &self.ports
    }

    pub fn active(&self) -> ActiveFlags {
        self.active
    }

    pub fn breadcrumbs(&self) -> &Breadcrumbs {
        &self.breadcrumbs
    }

    pub fn stats(&self) -> &Arc<EngineStats> {
        &self.stats
    }

    /// Index of the last status buffer entry consumed.
    pub fn csb_head(&self) -> u8 {
        self.csb.head()
    }

    /// Seqno of the most recent hand-off to the ports.
    pub fn timeline_seqno(&self) -> Seqno {
        self.timeline_seqno
    }

    pub fn inflight(&self) -> impl Iterator<Item = &RequestRef> + '_ {
        self.inflight.iter()
    }

    pub fn ring(&self, context_id: ContextId) -> Option<&Ring> {
        self.contexts.get(&context_id).map(|ctx| &ctx.ring)
    }

    pub fn is_wedged(&self) -> bool {
        self.wedged
    }

    /// Nothing queued, nothing in the ports and no outstanding hardware transition.
    pub fn is_idle(&self) -> bool {
        self.active.is_empty()
            && self.ports.is_empty()
            && self.inflight.is_empty()
            && self.queue.is_empty()
    }

    pub fn create_request(
        &mut self,
        context_id: ContextId,
        priority: i32,
        commands: &[u32],
    ) -> Result<RequestRef> {
        self.create_request_with_deps(context_id, priority, commands, &[])
    }

    /// Emits `commands` plus a breadcrumb into the context's ring and wraps them in a request.
    ///
    /// The request is ordered after the previous request of the same context and after every
    /// request in `deps`. It does not run until passed to [`Execlists::submit`].
    pub fn create_request_with_deps(
        &mut self,
        context_id: ContextId,
        priority: i32,
        commands: &[u32],
        deps: &[RequestRef],
    ) -> Result<RequestRef> {
        if self.wedged {
            return Err(ExeclistError::DeviceWedged);
        }
        if context_id == self.cfg.preempt_context_id {
            return Err(ExeclistError::ReservedContext(context_id));
        }

        let ctx = match self.contexts.entry(context_id) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(e) => e.insert(ContextState {
                ring: Ring::new(self.cfg.ring_size)?,
                last: None,
            }),
        };

        let cmd_bytes =
            (commands.len() as u64 * 4).next_multiple_of(u64::from(RING_OFFSET_ALIGN));
        let total = u32::try_from(cmd_bytes + u64::from(BREADCRUMB_BYTES)).map_err(|_| {
            RingError::TooLarge {
                requested: u32::MAX,
                size: ctx.ring.size(),
            }
        })?;
        let cmd_bytes = total - BREADCRUMB_BYTES;

        let cs = match ctx.ring.reserve(total) {
            Ok(cs) => cs,
            Err(err) => {
                if matches!(err, RingError::OutOfSpace { .. }) {
                    self.stats.inc_ring_out_of_space();
                }
                return Err(err.into());
            }
        };
        let (body, breadcrumb) = cs.split_at_mut(cmd_bytes as usize);
        let dwords = commands.iter().copied().chain(std::iter::repeat(MI_NOOP));
        for (dst, dw) in body.chunks_exact_mut(4).zip(dwords) {
            dst.copy_from_slice(&dw.to_le_bytes());
        }
        // The seqno is filled in when the request is handed to the ports.
        breadcrumb[..4].copy_from_slice(&0u32.to_le_bytes());
        breadcrumb[4..].copy_from_slice(&MI_USER_INTERRUPT.to_le_bytes());

        let head = ctx.ring.wrap(ctx.ring.emit().wrapping_sub(total));
        let span = RingSpan {
            head,
            breadcrumb: head + cmd_bytes,
            tail: ctx.ring.wrap(head + total),
        };

        let mut all_deps = deps.to_vec();
        if let Some(prev) = ctx.last.as_ref().and_then(Weak::upgrade) {
            if !prev.is_signaled() {
                all_deps.push(prev);
            }
        }

        self.next_request_id += 1;
        let rq = Arc::new(Request::new(
            self.next_request_id,
            self.engine,
            context_id,
            priority,
            span,
            all_deps,
        )
        .with_epoch(self.epoch));
        ctx.last = Some(Arc::downgrade(&rq));

        tracing::trace!(
            engine = self.engine,
            context_id,
            head = span.head,
            tail = span.tail,
            "request emitted"
        );
        Ok(rq)
    }

    /// Queues `rq` and kicks the ports.
    ///
    /// On a wedged engine the request is failed immediately.
    pub fn submit(&mut self, rq: RequestRef) -> Result<()> {
        if rq.engine() != self.engine {
            return Err(ExeclistError::WrongEngine {
                expected: self.engine,
                found: rq.engine(),
            });
        }
        if self.wedged {
            rq.set_state(RequestState::Failed);
            self.stats.add_requests_cancelled(1);
            return Err(ExeclistError::DeviceWedged);
        }
        if rq.epoch() != self.epoch || !self.contexts.contains_key(&rq.context_id()) {
            return Err(ExeclistError::UnknownContext(rq.context_id()));
        }
        if !rq.is_queued() || self.queue.contains(&rq) {
            tracing::debug!(engine = self.engine, id = rq.id(), "request already submitted");
            return Ok(());
        }

        self.stats.inc_requests_submitted();
        self.bump_dependencies(&rq, rq.priority());
        self.queue.insert(rq);
        self.dequeue()
    }

    /// Changes the priority of a queued or running request.
    ///
    /// Raising a priority is inherited by everything the request waits on. Returns whether
    /// anything changed.
    pub fn reprioritize(&mut self, rq: &RequestRef, priority: i32) -> Result<bool> {
        if rq.engine() != self.engine {
            return Err(ExeclistError::WrongEngine {
                expected: self.engine,
                found: rq.engine(),
            });
        }
        let priority = priority.clamp(PRIORITY_MIN, PRIORITY_MAX);
        let old = rq.priority();
        if self.wedged || rq.is_signaled() || old == priority {
            return Ok(false);
        }

        if !self.queue.reprioritize(rq, priority) {
            rq.set_priority(priority);
        }
        if priority > old {
            self.bump_dependencies(rq, priority);
        }
        tracing::debug!(
            engine = self.engine,
            id = rq.id(),
            old,
            new = priority,
            "request reprioritized"
        );
        self.dequeue()?;
        Ok(true)
    }

    /// Raises every unsignaled dependency on this engine to at least `priority`.
    fn bump_dependencies(&mut self, rq: &Request, priority: i32) {
        let mut stack = rq.dependencies();
        while let Some(dep) = stack.pop() {
            if dep.engine() != self.engine || dep.is_signaled() || dep.priority() >= priority {
                continue;
            }
            if !self.queue.reprioritize(&dep, priority) {
                dep.set_priority(priority);
            }
            stack.extend(dep.dependencies());
        }
    }

    fn dequeue(&mut self) -> Result<()> {
        if self.wedged || self.active.contains(ActiveFlags::PREEMPT) || self.queue.is_empty() {
            return Ok(());
        }

        let on_hw = self.ports.occupied();
        if let Some(front) = self.ports.front() {
            // Every event caused by the previous write must be seen before touching the ports
            // again, otherwise the next switch-out cannot be attributed.
            let pending_restore = self.ports.get(0).map_or(0, |p| p.count) > 0;
            if pending_restore || self.active.contains(ActiveFlags::HWACK) {
                return Ok(());
            }

            // Only work that could be loaded right after the switch may preempt.
            let ready_priority = self
                .queue
                .first_ready(|rq| rq.is_ready())
                .map_or(NO_PRIORITY_HINT, |rq| rq.priority());
            let running = front.priority();
            let done = seqno_passed(self.hw.read_completion_counter(), front.seqno());
            if self.cfg.preemption && !done && need_preempt(ready_priority, running) {
                self.inject_preempt(ready_priority);
                return Ok(());
            }

            if self.ports.num_ports() > 1 && self.ports.is_full() {
                return Ok(());
            }
        }

        let mut loaded = false;
        let mut result = Ok(());
        while let Some(rq) = self.queue.first_ready(|rq| rq.is_ready()) {
            let merge = self.ports.last_busy().filter(|&idx| {
                self.ports
                    .get(idx)
                    .and_then(|p| p.request.as_ref())
                    .is_some_and(|last| last.context_id() == rq.context_id())
            });
            let Some(idx) = merge.or_else(|| self.ports.first_free()) else {
                break;
            };

            self.queue.remove(&rq);
            if let Err(err) = self.hand_off(&rq) {
                result = Err(err);
                break;
            }
            if merge.is_some() {
                self.ports.replace(idx, rq);
            } else {
                self.ports.load(std::iter::once(rq));
            }
            loaded = true;
        }

        if loaded {
            // Ports already on the hardware are resubmitted: each produces one more switch-out.
            for idx in 0..on_hw {
                self.ports.resubmit(idx);
                self.stats.inc_lite_restores();
            }
            self.write_ports();
        }
        result
    }

    /// Assigns the next seqno to `rq`, stamps its breadcrumb and exposes it to the hardware.
    fn hand_off(&mut self, rq: &RequestRef) -> Result<()> {
        let span = rq.span();
        let Some(ctx) = self.contexts.get_mut(&rq.context_id()) else {
            self.queue.requeue_front(Arc::clone(rq));
            return Err(ExeclistError::UnknownContext(rq.context_id()));
        };
        if let Err(err) = ctx.ring.set_tail(span.tail) {
            self.queue.requeue_front(Arc::clone(rq));
            return Err(err.into());
        }

        let mut seqno = self.timeline_seqno.wrapping_add(1);
        if seqno == 0 {
            seqno = 1;
        }
        self.timeline_seqno = seqno;
        ctx.ring.write_u32(span.breadcrumb, seqno);

        rq.set_seqno(seqno);
        rq.set_state(RequestState::InFlight);
        self.inflight.push_back(Arc::clone(rq));
        Ok(())
    }

    fn write_ports(&mut self) {
        let elements: Vec<Option<ElspElement>> = self
            .ports
            .iter()
            .map(|p| {
                p.request.as_ref().map(|rq| ElspElement {
                    context_id: rq.context_id(),
                    ring_tail: rq.span().tail,
                    seqno: rq.seqno(),
                })
            })
            .collect();
        tracing::debug!(engine = self.engine, ports = ?elements, "submitting execlist ports");
        self.hw.submit_ports(&elements);
        self.active.insert(ActiveFlags::USER | ActiveFlags::HWACK);
        self.stats.inc_elsp_writes();
    }

    fn inject_preempt(&mut self, priority: i32) {
        tracing::debug!(engine = self.engine, priority, "injecting preemption");
        self.hw.inject_preempt(self.cfg.preempt_context_id);
        self.active.insert(ActiveFlags::PREEMPT | ActiveFlags::HWACK);
        self.preempt_started_ns = Some(self.now_ns);
        self.stats.inc_preemptions_requested();
    }

    /// Drains the context status buffer, retires completed work, wakes breadcrumb waiters and
    /// refills the ports.
    ///
    /// Entries are consumed strictly in order and the read cursor is kept across calls, so a
    /// partially drained buffer resumes where it left off.
    pub fn on_interrupt(&mut self) -> Result<CsbReport> {
        let mut report = CsbReport::default();
        if self.wedged {
            return Ok(report);
        }

        let write = self.hw.csb_write_pointer();
        if write >= self.csb.entries() {
            tracing::warn!(
                engine = self.engine,
                write,
                entries = self.csb.entries(),
                "status buffer write pointer out of range"
            );
            return Ok(report);
        }

        while self.csb.has_pending(write) {
            let index = self.csb.advance();
            let entry = self.hw.read_status_entry(index);
            self.stats.inc_csb_entries();
            report.processed += 1;
            tracing::trace!(
                engine = self.engine,
                index,
                status = entry.status,
                context_id = entry.context_id,
                "status entry"
            );

            if let Err(err) = self.process_csb_entry(index, entry, &mut report) {
                tracing::warn!(engine = self.engine, %err, "skipping status entry");
                self.stats.inc_unexpected_csb_entries();
                report.unexpected.push(err);
            }
        }

        if self.ports.is_empty() {
            self.active.remove(ActiveFlags::USER);
        }

        let counter = self.hw.read_completion_counter();
        let woken = self.breadcrumbs.signal(counter, &mut self.hw);
        self.stats.add_breadcrumb_wakeups(woken as u64);
        report.woken += woken;

        self.dequeue()?;
        Ok(report)
    }

    fn process_csb_entry(
        &mut self,
        index: u8,
        entry: CsbEntry,
        report: &mut CsbReport,
    ) -> Result<()> {
        let unexpected = || ExeclistError::UnexpectedStatusCode {
            index,
            status: entry.status,
            context_id: entry.context_id,
        };

        match decode(entry, self.cfg.preempt_context_id) {
            CsbEvent::Unknown => Err(unexpected()),
            CsbEvent::Ack => {
                self.active.remove(ActiveFlags::HWACK);
                Ok(())
            }
            CsbEvent::PreemptComplete => {
                if !self.active.contains(ActiveFlags::PREEMPT) {
                    return Err(unexpected());
                }
                self.complete_preemption(report);
                Ok(())
            }
            CsbEvent::SwitchOut {
                context_id,
                preempted,
            } => {
                if preempted && self.active.contains(ActiveFlags::PREEMPT) {
                    // The preemption itself; the preempt context completing is what matters.
                    self.active.remove(ActiveFlags::HWACK);
                    return Ok(());
                }
                let Some(front) = self.ports.get(0).filter(|p| p.is_set()) else {
                    return Err(unexpected());
                };
                let front_ctx = front.request.as_ref().map(|rq| rq.context_id());
                if front_ctx != Some(context_id) || (preempted && front.count == 0) {
                    return Err(unexpected());
                }

                self.active.remove(ActiveFlags::HWACK);
                if let Some(rq) = self.ports.on_switch_out() {
                    self.retire_through(&rq, report);
                }
                Ok(())
            }
        }
    }

    /// Retires the oldest in-flight requests up to and including `last`.
    ///
    /// Earlier requests of the same context were merged into its port and finished with it.
    fn retire_through(&mut self, last: &RequestRef, report: &mut CsbReport) {
        while let Some(rq) = self.inflight.pop_front() {
            debug_assert_eq!(rq.context_id(), last.context_id());
            let done = Arc::ptr_eq(&rq, last);
            self.retire(&rq);
            report.retired.push(rq);
            if done {
                break;
            }
        }
    }

    fn retire(&mut self, rq: &Request) {
        let span = rq.span();
        if let Some(ctx) = self.contexts.get(&rq.context_id()) {
            ctx.ring.publish_head(span.tail);
        }
        rq.set_state(RequestState::Completed);
        self.stats.add_requests_retired(1);
        tracing::debug!(
            engine = self.engine,
            context_id = rq.context_id(),
            seqno = rq.seqno(),
            "request retired"
        );
    }

    /// Every port has been switched out: retire whatever finished before the switch and put the
    /// rest back in the queue, newest first, releasing their seqnos.
    fn complete_preemption(&mut self, report: &mut CsbReport) {
        let counter = self.hw.read_completion_counter();
        while self
            .inflight
            .front()
            .is_some_and(|rq| seqno_passed(counter, rq.seqno()))
        {
            if let Some(rq) = self.inflight.pop_front() {
                self.retire(&rq);
                report.retired.push(rq);
            }
        }

        self.ports.take_all();
        let mut released = None;
        let mut unwound = 0usize;
        while let Some(rq) = self.inflight.pop_back() {
            released = Some(rq.seqno());
            rq.set_seqno(0);
            rq.set_state(RequestState::Queued);
            self.queue.requeue_front(rq);
            unwound += 1;
        }
        if let Some(first) = released {
            self.timeline_seqno = first.wrapping_sub(1);
            let woken = self.breadcrumbs.wake_from(first, &mut self.hw);
            self.stats.add_breadcrumb_wakeups(woken as u64);
            report.woken += woken;
        }

        self.active
            .remove(ActiveFlags::PREEMPT | ActiveFlags::HWACK | ActiveFlags::USER);
        self.preempt_started_ns = None;
        self.stats.inc_preemptions_completed();
        report.preemption_completed = true;
        tracing::debug!(engine = self.engine, unwound, "preemption complete");
    }

    /// Advances the engine clock and checks the preemption watchdog.
    pub fn tick(&mut self, now_ns: u64) -> Result<()> {
        self.now_ns = now_ns;
        let (Some(started), Some(timeout)) = (self.preempt_started_ns, self.cfg.preempt_timeout_ns)
        else {
            return Ok(());
        };
        let elapsed_ns = now_ns.saturating_sub(started);
        if elapsed_ns >= timeout {
            tracing::warn!(
                engine = self.engine,
                elapsed_ns,
                "preemption not acknowledged"
            );
            return Err(ExeclistError::PreemptionTimeout { elapsed_ns });
        }
        Ok(())
    }

    /// Fails every queued and in-flight request and marks the engine wedged.
    ///
    /// Returns the number of requests cancelled.
    pub fn cancel_all_requests(&mut self) -> usize {
        self.ports.take_all();
        let mut cancelled = 0usize;
        for rq in self.inflight.drain(..).chain(self.queue.drain()) {
            rq.set_state(RequestState::Failed);
            cancelled += 1;
        }

        self.active = ActiveFlags::empty();
        self.preempt_started_ns = None;
        self.wedged = true;

        let woken = self.breadcrumbs.wake_all(&mut self.hw);
        self.stats.add_requests_cancelled(cancelled as u64);
        self.stats.add_breadcrumb_wakeups(woken as u64);
        tracing::warn!(engine = self.engine, cancelled, "engine wedged, requests cancelled");
        cancelled
    }

    /// Brings a wedged (or idle) engine back into service.
    ///
    /// Outstanding work is cancelled first. Context rings are dropped, so requests created
    /// before the reset can no longer be submitted.
    pub fn reset(&mut self) {
        if !self.is_idle() {
            self.cancel_all_requests();
        }
        self.breadcrumbs.wake_all(&mut self.hw);
        self.hw.reset();
        self.csb.reset();
        self.contexts.clear();
        self.epoch = self.epoch.wrapping_add(1);
        self.active = ActiveFlags::empty();
        self.preempt_started_ns = None;
        self.timeline_seqno = self.hw.read_completion_counter();
        self.wedged = false;
        tracing::debug!(engine = self.engine, "engine reset");
    }

    /// Registers a wait for the completion counter to reach `seqno`.
    pub fn add_waiter(&mut self, seqno: Seqno) -> Waiter {
        let waiter = self.breadcrumbs.add_waiter(seqno, &mut self.hw);
        if self.wedged {
            self.breadcrumbs.wake_all(&mut self.hw);
        }
        waiter
    }

    pub fn remove_waiter(&mut self, id: u64) -> bool {
        self.breadcrumbs.remove_waiter(id, &mut self.hw)
    }
}
