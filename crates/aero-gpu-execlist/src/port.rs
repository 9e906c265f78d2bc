//! Execlist submission ports.
//!
//! The ports mirror what the hardware is executing: port 0 is the active context, higher ports
//! are queued behind it. The ports behave as a queue; only the front is ever completed.

use crate::request::{Request, RequestRef};

/// Number of submission ports the hardware exposes.
pub const EXECLIST_MAX_PORTS: usize = 2;

#[derive(Debug, Clone, Default)]
pub struct Port {
    pub request: Option<RequestRef>,
    /// Outstanding lite-restore resubmissions of this port's context.
    pub count: u32,
}

impl Port {
    pub fn is_set(&self) -> bool {
        self.request.is_some()
    }
}

#[derive(Debug)]
pub struct Ports {
    ports: [Port; EXECLIST_MAX_PORTS],
    num_ports: usize,
}

impl Ports {
    pub fn new(num_ports: usize) -> Self {
        assert!((1..=EXECLIST_MAX_PORTS).contains(&num_ports));
        Self {
            ports: Default::default(),
            num_ports,
        }
    }

    pub fn num_ports(&self) -> usize {
        self.num_ports
    }

    pub fn get(&self, idx: usize) -> Option<&Port> {
        self.ports[..self.num_ports].get(idx)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Port> + '_ {
        self.ports[..self.num_ports].iter()
    }

    /// The request in the active port.
    pub fn front(&self) -> Option<&RequestRef> {
        self.ports[0].request.as_ref()
    }

    pub fn is_empty(&self) -> bool {
        !self.ports[0].is_set()
    }

    pub fn is_full(&self) -> bool {
        self.ports[self.num_ports - 1].is_set()
    }

    /// Index of the first free port. Ports fill from 0 upward, so everything after it is free too.
    pub fn first_free(&self) -> Option<usize> {
        self.ports[..self.num_ports].iter().position(|p| !p.is_set())
    }

    /// Index of the last occupied port.
    pub fn last_busy(&self) -> Option<usize> {
        self.ports[..self.num_ports].iter().rposition(|p| p.is_set())
    }

    pub fn occupied(&self) -> usize {
        self.ports[..self.num_ports]
            .iter()
            .filter(|p| p.is_set())
            .count()
    }

    /// Loads requests into the free ports, lowest index first, each with `count = 0`.
    ///
    /// Ports that still hold work are never overwritten. Returns how many requests were taken;
    /// the rest are left in the iterator.
    pub fn load<I>(&mut self, requests: I) -> usize
    where
        I: IntoIterator<Item = RequestRef>,
    {
        let mut loaded = 0;
        let mut requests = requests.into_iter();
        while let Some(idx) = self.first_free() {
            let Some(rq) = requests.next() else {
                break;
            };
            self.ports[idx] = Port {
                request: Some(rq),
                count: 0,
            };
            loaded += 1;
        }
        loaded
    }

    /// Replaces the request held by an occupied port with a later request of the same context.
    pub fn replace(&mut self, idx: usize, rq: RequestRef) -> Option<RequestRef> {
        let port = &mut self.ports[idx];
        debug_assert!(port.is_set());
        port.request.replace(rq)
    }

    /// Records that the hardware was handed port `idx` again without a full context switch.
    pub fn resubmit(&mut self, idx: usize) {
        let port = &mut self.ports[idx];
        debug_assert!(port.is_set());
        port.count += 1;
    }

    /// Pops the active port: everything shifts down by one and the last slot is cleared.
    pub fn complete_front(&mut self) -> Option<RequestRef> {
        let n = self.num_ports;
        let retired = self.ports[0].request.take();
        self.ports[..n].rotate_left(1);
        self.ports[n - 1] = Port::default();
        retired
    }

    /// The hardware switched away from the context in port 0.
    ///
    /// A pending lite restore absorbs the event; otherwise the port is complete and its request is
    /// returned.
    pub fn on_switch_out(&mut self) -> Option<RequestRef> {
        let front = &mut self.ports[0];
        if !front.is_set() {
            return None;
        }
        if front.count > 0 {
            front.count -= 1;
            return None;
        }
        self.complete_front()
    }

    pub fn position(&self, rq: &Request) -> Option<usize> {
        self.ports[..self.num_ports].iter().position(|p| {
            p.request
                .as_ref()
                .is_some_and(|r| core::ptr::eq(&**r, rq))
        })
    }

    /// Empties every port, returning the requests front to back.
    pub fn take_all(&mut self) -> Vec<RequestRef> {
        self.ports
            .iter_mut()
            .filter_map(|p| core::mem::take(p).request)
            .collect()
    }
}
