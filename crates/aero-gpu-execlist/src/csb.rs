//! Context status buffer (CSB).
//!
//! The hardware reports context switches by writing entries into a small circular buffer and
//! bumping a write pointer. Each entry is two dwords: the status bits and the id of the context
//! the event refers to. The driver keeps its own read cursor and drains entries in order.

use bitflags::bitflags;

/// Status buffer size on the original execlist hardware.
pub const GEN8_CSB_ENTRIES: u8 = 6;
/// Status buffer size on later hardware.
pub const GEN11_CSB_ENTRIES: u8 = 12;
pub const CSB_MAX_ENTRIES: u8 = 16;

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct CsbStatus: u32 {
        const IDLE_ACTIVE = 1 << 0;
        const PREEMPTED = 1 << 1;
        const ELEMENT_SWITCH = 1 << 2;
        const ACTIVE_IDLE = 1 << 3;
        const COMPLETE = 1 << 4;
        const LITE_RESTORE = 1 << 15;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CsbEntry {
    pub status: u32,
    pub context_id: u32,
}

impl CsbEntry {
    pub fn new(status: CsbStatus, context_id: u32) -> Self {
        Self {
            status: status.bits(),
            context_id,
        }
    }

    pub fn flags(&self) -> CsbStatus {
        CsbStatus::from_bits_truncate(self.status)
    }

    /// Status bits this driver does not know about.
    pub fn unknown_bits(&self) -> u32 {
        self.status & !CsbStatus::all().bits()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CsbEvent {
    /// The preempt-to-idle context completed: every port has been switched out.
    PreemptComplete,
    /// The hardware switched away from `context_id`, either because it finished or because a
    /// newer submission of the same context (lite restore) or a preemption replaced it.
    SwitchOut { context_id: u32, preempted: bool },
    /// Pure acknowledgement (idle to active, element switch, active to idle).
    Ack,
    /// Nothing this driver recognises.
    Unknown,
}

/// Classifies `entry`; `preempt_complete_status` is the context id of the preempt context.
pub fn decode(entry: CsbEntry, preempt_complete_status: u32) -> CsbEvent {
    let flags = entry.flags();
    if flags.is_empty() {
        return CsbEvent::Unknown;
    }
    if flags.contains(CsbStatus::COMPLETE) && entry.context_id == preempt_complete_status {
        return CsbEvent::PreemptComplete;
    }
    if flags.intersects(CsbStatus::COMPLETE | CsbStatus::PREEMPTED) {
        return CsbEvent::SwitchOut {
            context_id: entry.context_id,
            preempted: flags.contains(CsbStatus::PREEMPTED),
        };
    }
    CsbEvent::Ack
}

/// Driver-side read cursor into the status buffer.
///
/// `head` is the index of the last entry consumed; after reset it sits on the final slot so the
/// first entry the hardware writes (index 0) is the first one read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CsbCursor {
    head: u8,
    entries: u8,
}

impl CsbCursor {
    pub fn new(entries: u8) -> Self {
        debug_assert!(entries > 0 && entries <= CSB_MAX_ENTRIES);
        Self {
            head: entries - 1,
            entries,
        }
    }

    pub fn head(&self) -> u8 {
        self.head
    }

    pub fn entries(&self) -> u8 {
        self.entries
    }

    pub fn reset(&mut self) {
        self.head = self.entries - 1;
    }

    /// Whether entries up to the hardware write pointer `write` remain unread.
    pub fn has_pending(&self, write: u8) -> bool {
        self.head != write
    }

    /// Steps to the next entry and returns its index.
    pub fn advance(&mut self) -> u8 {
        self.head = (self.head + 1) % self.entries;
        self.head
    }
}
