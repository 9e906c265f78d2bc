use std::sync::Arc;

use aero_gpu_execlist::sim::SimulatedEngine;
use aero_gpu_execlist::{
    ActiveFlags, EngineHw, ExeclistConfig, ExeclistError, Execlists, RequestRef, RequestState,
    RingError,
};
use pretty_assertions::assert_eq;

fn engine_with(cfg: ExeclistConfig) -> Execlists<SimulatedEngine> {
    let hw = SimulatedEngine::new(cfg.csb_entries);
    Execlists::new(0, cfg, hw).unwrap()
}

fn engine() -> Execlists<SimulatedEngine> {
    engine_with(ExeclistConfig::default())
}

fn port_ids(el: &Execlists<SimulatedEngine>) -> Vec<Option<u64>> {
    el.ports()
        .iter()
        .map(|p| p.request.as_ref().map(|rq| rq.id()))
        .collect()
}

fn submit_new(
    el: &mut Execlists<SimulatedEngine>,
    context_id: u32,
    priority: i32,
) -> RequestRef {
    let rq = el.create_request(context_id, priority, &[0x1234]).unwrap();
    el.submit(Arc::clone(&rq)).unwrap();
    rq
}

#[test]
fn dequeue_order_is_priority_then_submission_order() {
    let mut el = engine_with(ExeclistConfig {
        num_ports: 1,
        preemption: false,
        ..Default::default()
    });
    let blocker = submit_new(&mut el, 10, 0);
    let a = submit_new(&mut el, 1, 0);
    let b = submit_new(&mut el, 2, 0);
    let c = submit_new(&mut el, 3, 5);
    let d = submit_new(&mut el, 4, 0);
    assert_eq!(el.queue().len(), 4);

    let mut order = Vec::new();
    loop {
        el.hw_mut().complete_front();
        el.on_interrupt().unwrap();
        match el.ports().front() {
            Some(rq) => order.push((rq.id(), rq.priority())),
            None => break,
        }
    }

    assert_eq!(
        order,
        vec![(c.id(), 5), (a.id(), 0), (b.id(), 0), (d.id(), 0)]
    );
    assert!(blocker.is_completed());
    assert!(el.is_idle());
}

#[test]
fn ring_space_returns_once_the_request_retires() {
    let mut el = engine_with(ExeclistConfig {
        ring_size: 4096,
        ..Default::default()
    });

    // 3992 bytes of commands plus the breadcrumb: 4000 bytes.
    let big = el.create_request(1, 0, &[0; 998]).unwrap();
    assert_eq!(big.span().tail, 4000);

    let err = el.create_request(1, 0, &[0; 48]).unwrap_err();
    assert!(matches!(
        err,
        ExeclistError::Ring(RingError::OutOfSpace { .. })
    ));

    el.submit(Arc::clone(&big)).unwrap();
    el.hw_mut().complete_front();
    el.on_interrupt().unwrap();
    assert!(big.is_completed());
    assert_eq!(el.ring(1).unwrap().head(), 4000);

    // The tail end of the ring is too short, so the next request starts at offset 0.
    let small = el.create_request(1, 0, &[0; 48]).unwrap();
    assert_eq!(small.span().head, 0);
    assert_eq!(small.span().tail, 200);
    el.submit(Arc::clone(&small)).unwrap();
    assert_eq!(el.ring(1).unwrap().tail(), 200);
}

#[test]
fn completing_port_zero_promotes_port_one_and_wakes_one_waiter() {
    let mut el = engine();
    let a = submit_new(&mut el, 1, 0);
    let b = submit_new(&mut el, 2, 0);
    // Ack of the first write loads the second port, whose write is a lite restore of port 0.
    el.on_interrupt().unwrap();
    el.on_interrupt().unwrap();
    assert_eq!(port_ids(&el), vec![Some(a.id()), Some(b.id())]);
    assert_eq!(el.ports().get(0).unwrap().count, 0);

    let wa = el.add_waiter(a.seqno());
    let wb = el.add_waiter(b.seqno());
    assert_eq!(el.breadcrumbs().bottom_half(), Some(wa.id()));
    assert!(el.hw().irq_enabled());

    el.hw_mut().complete_front();
    let report = el.on_interrupt().unwrap();

    assert_eq!(port_ids(&el), vec![Some(b.id()), None]);
    assert_eq!(el.ports().get(1).unwrap().count, 0);
    assert_eq!(report.retired.len(), 1);
    assert!(Arc::ptr_eq(&report.retired[0], &a));
    assert_eq!(report.woken, 1);
    assert!(wa.is_signaled());
    assert!(!wb.is_signaled());
    assert_eq!(el.breadcrumbs().bottom_half(), Some(wb.id()));
    assert_eq!(el.stats().snapshot().breadcrumb_wakeups, 1);
    assert_eq!(a.state(), RequestState::Completed);
    assert!(b.is_in_flight());
}

#[test]
fn cancel_fails_queued_and_in_flight_work() {
    let mut el = engine();
    let a = submit_new(&mut el, 1, 0);
    let b = submit_new(&mut el, 2, 0);
    el.on_interrupt().unwrap();
    let queued: Vec<RequestRef> = (3..6).map(|ctx| submit_new(&mut el, ctx, 0)).collect();
    assert_eq!(el.ports().occupied(), 2);
    assert_eq!(el.queue().len(), 3);
    let w = el.add_waiter(b.seqno());

    assert_eq!(el.cancel_all_requests(), 5);

    for rq in [&a, &b].into_iter().chain(queued.iter()) {
        assert_eq!(rq.state(), RequestState::Failed);
    }
    assert!(el.queue().is_empty());
    assert!(el.ports().is_empty());
    assert_eq!(el.active(), ActiveFlags::empty());
    assert!(w.is_signaled());
    assert!(el.is_idle());
    assert_eq!(el.stats().snapshot().requests_cancelled, 5);

    // Status entries arriving afterwards are ignored.
    el.hw_mut().complete_front();
    let report = el.on_interrupt().unwrap();
    assert_eq!(report.processed, 0);
    assert!(report.retired.is_empty());
    assert!(a.is_failed());
}

#[test]
fn status_buffer_cursor_wraps_and_resumes() {
    let mut el = engine();
    let mut seen = 0;
    for i in 0..10u32 {
        let rq = submit_new(&mut el, 1 + i % 3, 0);
        el.hw_mut().complete_front();
        let report = el.on_interrupt().unwrap();
        assert!(report.unexpected.is_empty());
        assert!(rq.is_completed());
        seen += report.processed;
        assert_eq!(el.csb_head(), el.hw().csb_write_pointer());
    }
    // Idle-to-active plus completion for every request.
    assert_eq!(seen, 20);
    assert_eq!(el.stats().snapshot().csb_entries, 20);
    assert_eq!(el.stats().snapshot().requests_retired, 10);
}

#[test]
fn several_events_are_drained_by_one_interrupt() {
    let mut el = engine();
    let a = submit_new(&mut el, 1, 0);
    let b = submit_new(&mut el, 2, 0);
    el.on_interrupt().unwrap();

    // Lite restore of port 0, then both contexts finish before the interrupt is serviced.
    el.hw_mut().complete_front();
    el.hw_mut().complete_front();
    let report = el.on_interrupt().unwrap();
    assert_eq!(report.processed, 3);
    let retired: Vec<u64> = report.retired.iter().map(|rq| rq.id()).collect();
    assert_eq!(retired, vec![a.id(), b.id()]);
    assert!(el.is_idle());
    assert!(!el.active().contains(ActiveFlags::USER));
}

#[test]
fn waiting_on_a_later_request_of_the_same_context() {
    let mut el = engine();
    let a1 = submit_new(&mut el, 1, 0);
    let a2 = el.create_request(1, 0, &[1]).unwrap();
    assert!(!a2.is_ready());
    el.on_interrupt().unwrap();
    el.submit(Arc::clone(&a2)).unwrap();
    assert!(a2.is_in_flight());

    let w = el.add_waiter(a2.seqno());
    let first = el.add_waiter(a1.seqno());
    assert_eq!(el.breadcrumbs().bottom_half(), Some(first.id()));
    // The bottom half gives up; the later waiter takes over.
    assert!(el.remove_waiter(first.id()));
    assert_eq!(el.breadcrumbs().bottom_half(), Some(w.id()));

    el.on_interrupt().unwrap();
    el.hw_mut().complete_front();
    let report = el.on_interrupt().unwrap();
    assert_eq!(report.retired.len(), 2);
    assert!(w.is_signaled());
    assert!(!first.is_signaled());
    assert!(!el.hw().irq_enabled());
}

#[test]
fn logging_does_not_disturb_processing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::TRACE)
        .try_init();

    let mut el = engine();
    let rq = submit_new(&mut el, 1, 0);
    el.hw_mut().push_raw(aero_gpu_execlist::csb::CsbEntry {
        status: 0x8000_0000,
        context_id: 77,
    });
    el.hw_mut().complete_front();
    let report = el.on_interrupt().unwrap();
    assert_eq!(report.unexpected.len(), 1);
    assert!(rq.is_completed());
}
