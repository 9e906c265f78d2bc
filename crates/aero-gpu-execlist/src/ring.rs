//! Per-context circular command ring.
//!
//! The hardware consumes commands from `head` towards `tail`; the driver writes new commands at
//! `emit`. Free space is always computed from the *last known* hardware head, so it may be
//! under-reported when the hardware has made progress we have not observed yet, but never
//! over-reported.
//!
//! Hardware rule ("Ring Buffer Use"): if the head and tail pointers are in the same cacheline, the
//! head must not be greater than the tail. The allocator therefore keeps one cacheline of slack
//! between `emit` and `head` at all times.

use core::sync::atomic::{AtomicU32, Ordering};

use crate::error::RingError;

pub const CACHELINE_BYTES: u32 = 64;

/// Ring offsets handed to the hardware must be qword aligned.
pub const RING_OFFSET_ALIGN: u32 = 8;

/// Encoding of the no-op command used to pad the ring.
pub const MI_NOOP: u32 = 0;

#[inline]
fn cacheline(pos: u32) -> u32 {
    pos & !(CACHELINE_BYTES - 1)
}

/// Free bytes between `emit` and `head`, minus the cacheline of slack.
#[inline]
pub fn ring_space(head: u32, emit: u32, size: u32) -> u32 {
    debug_assert!(size.is_power_of_two());
    head.wrapping_sub(emit).wrapping_sub(CACHELINE_BYTES) & (size - 1)
}

pub struct Ring {
    storage: Box<[u8]>,
    size: u32,
    effective_size: u32,
    /// Last known hardware read position. Published by the retirement path.
    head: AtomicU32,
    tail: u32,
    emit: u32,
    space: u32,
}

impl core::fmt::Debug for Ring {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Ring")
            .field("size", &self.size)
            .field("head", &self.head())
            .field("tail", &self.tail)
            .field("emit", &self.emit)
            .field("space", &self.space)
            .finish()
    }
}

impl Ring {
    pub fn new(size: u32) -> Result<Self, RingError> {
        Self::with_effective_size(size, size)
    }

    /// Creates a ring whose last `size - effective_size` bytes are never used for commands.
    ///
    /// Some hardware misbehaves when a command ends right at the end of the buffer; the
    /// remainder is only ever filled with padding.
    pub fn with_effective_size(size: u32, effective_size: u32) -> Result<Self, RingError> {
        if !size.is_power_of_two() || size < 2 * CACHELINE_BYTES {
            return Err(RingError::InvalidSize(size));
        }
        if effective_size > size
            || effective_size < 2 * CACHELINE_BYTES
            || effective_size % RING_OFFSET_ALIGN != 0
        {
            return Err(RingError::InvalidSize(effective_size));
        }

        let mut ring = Self {
            storage: vec![0u8; size as usize].into_boxed_slice(),
            size,
            effective_size,
            head: AtomicU32::new(0),
            tail: 0,
            emit: 0,
            space: 0,
        };
        ring.update_space();
        Ok(ring)
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn effective_size(&self) -> u32 {
        self.effective_size
    }

    pub fn head(&self) -> u32 {
        self.head.load(Ordering::Relaxed)
    }

    pub fn tail(&self) -> u32 {
        self.tail
    }

    pub fn emit(&self) -> u32 {
        self.emit
    }

    /// Free space as of the last [`Ring::update_space`] (or reservation).
    pub fn space(&self) -> u32 {
        self.space
    }

    #[inline]
    pub fn wrap(&self, pos: u32) -> u32 {
        pos & (self.size - 1)
    }

    /// Whether `pos` may be programmed into the hardware: strictly inside the ring and qword
    /// aligned.
    pub fn offset_valid(&self, pos: u32) -> bool {
        pos & !(self.size - 1) == 0 && pos % RING_OFFSET_ALIGN == 0
    }

    /// Recomputes free space from the last published hardware head.
    ///
    /// This is a single unsynchronized load; racing with a concurrent [`Ring::publish_head`] can
    /// only make the result smaller than the truth.
    pub fn update_space(&mut self) -> u32 {
        let head = self.head.load(Ordering::Relaxed);
        self.space = ring_space(head, self.emit, self.size);
        self.space
    }

    /// Records the last known hardware read position (called when requests retire).
    pub fn publish_head(&self, head: u32) {
        self.head.store(self.wrap(head), Ordering::Relaxed);
    }

    /// Reserves `len` contiguous bytes at `emit` and returns them for writing.
    ///
    /// A reservation never straddles the end of the ring: when it does not fit before
    /// `effective_size`, the rest of the ring is padded with [`MI_NOOP`] and the region starts at
    /// offset 0. The padding is charged against the reservation, except on an empty ring, where
    /// all cursors move back to 0 instead.
    pub fn reserve(&mut self, len: u32) -> Result<&mut [u8], RingError> {
        if len % RING_OFFSET_ALIGN != 0 {
            return Err(RingError::Misaligned { len });
        }
        if len > self.effective_size - CACHELINE_BYTES {
            return Err(RingError::TooLarge {
                requested: len,
                size: self.size,
            });
        }

        let remain_usable = self.effective_size.saturating_sub(self.emit);
        let mut padding = if len > remain_usable {
            self.size - self.emit
        } else {
            0
        };
        if padding != 0
            && len + padding > self.space
            && len + padding > self.update_space()
            && self.head() == self.emit
        {
            // Nothing outstanding: restart at offset 0 rather than pad past an empty ring.
            self.reset(0);
            padding = 0;
        }
        let total = len + padding;

        if total > self.space && total > self.update_space() {
            return Err(RingError::OutOfSpace {
                requested: total,
                available: self.space,
            });
        }

        if padding != 0 {
            let start = self.emit as usize;
            fill_noop(&mut self.storage[start..]);
            self.emit = 0;
        }

        let start = self.emit;
        self.emit = self.wrap(start + len);
        self.space -= total;

        let start = start as usize;
        Ok(&mut self.storage[start..start + len as usize])
    }

    /// Pads `emit` with no-ops up to the next cacheline boundary.
    pub fn cacheline_align(&mut self) -> Result<(), RingError> {
        let misalignment = self.emit % CACHELINE_BYTES;
        if misalignment == 0 {
            return Ok(());
        }
        let cs = self.reserve(CACHELINE_BYTES - misalignment)?;
        fill_noop(cs);
        Ok(())
    }

    /// Hands the ring contents up to `tail` to the hardware.
    pub fn set_tail(&mut self, tail: u32) -> Result<u32, RingError> {
        if !self.offset_valid(tail) {
            return Err(RingError::InvalidTail {
                tail,
                size: self.size,
            });
        }

        // `head` may have advanced since we last looked, but in the worst case it is still where
        // we think it is, so never let the tail land behind it inside the same cacheline.
        let head = self.head();
        if cacheline(tail) == cacheline(head) && tail < head {
            return Err(RingError::TailBehindHead { tail, head });
        }

        self.tail = tail;
        Ok(tail)
    }

    /// Resets all cursors to `tail` (engine reset / context rebind).
    pub fn reset(&mut self, tail: u32) {
        let tail = self.wrap(tail);
        self.head.store(tail, Ordering::Relaxed);
        self.tail = tail;
        self.emit = tail;
        self.update_space();
    }

    pub fn write_u32(&mut self, offset: u32, value: u32) {
        let start = self.wrap(offset) as usize;
        self.storage[start..start + 4].copy_from_slice(&value.to_le_bytes());
    }

    pub fn read_u32(&self, offset: u32) -> u32 {
        let start = self.wrap(offset) as usize;
        let mut buf = [0u8; 4];
        buf.copy_from_slice(&self.storage[start..start + 4]);
        u32::from_le_bytes(buf)
    }
}

fn fill_noop(buf: &mut [u8]) {
    for dw in buf.chunks_exact_mut(4) {
        dw.copy_from_slice(&MI_NOOP.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::VecDeque;

    #[test]
    fn new_rejects_bad_sizes() {
        assert_eq!(Ring::new(0).unwrap_err(), RingError::InvalidSize(0));
        assert_eq!(Ring::new(96).unwrap_err(), RingError::InvalidSize(96));
        assert_eq!(Ring::new(64).unwrap_err(), RingError::InvalidSize(64));
        assert!(Ring::new(128).is_ok());
        assert!(Ring::with_effective_size(4096, 4097).is_err());
    }

    #[test]
    fn empty_ring_keeps_one_cacheline_of_slack() {
        let ring = Ring::new(4096).unwrap();
        assert_eq!(ring.space(), 4096 - CACHELINE_BYTES);
    }

    #[test]
    fn out_of_space_until_retirement_frees_bytes() {
        let mut ring = Ring::new(4096).unwrap();
        ring.reserve(4000).unwrap();
        assert_eq!(ring.space(), 32);

        assert!(matches!(
            ring.reserve(200),
            Err(RingError::OutOfSpace { available: 32, .. })
        ));
        // A failed reservation leaves the cursors alone.
        assert_eq!(ring.emit(), 4000);

        // The hardware consumed everything we wrote.
        ring.publish_head(4000);
        let cs = ring.reserve(200).unwrap();
        assert_eq!(cs.len(), 200);
        // The tail end of the ring was padded and the reservation starts at offset 0.
        assert_eq!(ring.emit(), 200);
    }

    #[test]
    fn large_reservation_on_an_empty_ring_restarts_at_zero() {
        let mut ring = Ring::new(4096).unwrap();
        ring.reserve(2048).unwrap();
        ring.publish_head(2048);

        // Padding to the end would need 6048 bytes; the ring is empty, so it starts over instead.
        let cs = ring.reserve(4000).unwrap();
        assert_eq!(cs.len(), 4000);
        assert_eq!(ring.emit(), 4000);
        assert_eq!(ring.head(), 0);
        assert_eq!(ring.tail(), 0);
        assert_eq!(ring.space(), 32);
    }

    #[test]
    fn large_reservation_waits_while_work_is_outstanding() {
        let mut ring = Ring::new(4096).unwrap();
        ring.reserve(2048).unwrap();
        ring.publish_head(1024);
        assert!(matches!(
            ring.reserve(4000),
            Err(RingError::OutOfSpace { .. })
        ));
        assert_eq!(ring.emit(), 2048);

        ring.publish_head(2048);
        ring.reserve(4000).unwrap();
        assert_eq!(ring.emit(), 4000);
    }

    #[test]
    fn wrap_padding_is_filled_with_noops() {
        let mut ring = Ring::new(512).unwrap();
        ring.reserve(400).unwrap().fill(0xAA);
        ring.publish_head(400);

        // 112 bytes remain before the end; 128 do not fit there.
        ring.reserve(128).unwrap().fill(0xBB);
        assert_eq!(ring.emit(), 128);
        for off in (400..512).step_by(4) {
            assert_eq!(ring.read_u32(off), MI_NOOP);
        }
        assert_eq!(ring.read_u32(0), 0xBBBB_BBBB);
        assert_eq!(ring.space(), ring_space(400, 128, 512));
    }

    #[test]
    fn reserve_validates_length() {
        let mut ring = Ring::new(4096).unwrap();
        assert_eq!(ring.reserve(12).unwrap_err(), RingError::Misaligned { len: 12 });
        assert_eq!(
            ring.reserve(4096).unwrap_err(),
            RingError::TooLarge {
                requested: 4096,
                size: 4096
            }
        );
    }

    #[test]
    fn effective_size_forces_an_early_wrap() {
        let mut ring = Ring::with_effective_size(512, 448).unwrap();
        ring.reserve(320).unwrap();
        ring.publish_head(320);
        // 128 usable bytes remain before `effective_size`, so 192 bytes wrap to the start.
        ring.reserve(192).unwrap();
        assert_eq!(ring.emit(), 192);
    }

    #[test]
    fn cacheline_align_pads_to_the_next_boundary() {
        let mut ring = Ring::new(4096).unwrap();
        ring.reserve(24).unwrap();
        ring.cacheline_align().unwrap();
        assert_eq!(ring.emit(), 64);
        // Already aligned: nothing is reserved.
        ring.cacheline_align().unwrap();
        assert_eq!(ring.emit(), 64);
    }

    #[test]
    fn set_tail_enforces_hardware_rules() {
        let mut ring = Ring::new(4096).unwrap();
        assert_eq!(
            ring.set_tail(4096).unwrap_err(),
            RingError::InvalidTail {
                tail: 4096,
                size: 4096
            }
        );
        assert_eq!(
            ring.set_tail(12).unwrap_err(),
            RingError::InvalidTail {
                tail: 12,
                size: 4096
            }
        );

        ring.publish_head(0x148);
        assert_eq!(
            ring.set_tail(0x140).unwrap_err(),
            RingError::TailBehindHead {
                tail: 0x140,
                head: 0x148
            }
        );
        // Behind the head but in an earlier cacheline is fine (wrapped tail).
        assert_eq!(ring.set_tail(0x100), Ok(0x100));
        assert_eq!(ring.set_tail(0x150), Ok(0x150));
        assert_eq!(ring.tail(), 0x150);
    }

    #[test]
    fn reset_moves_every_cursor() {
        let mut ring = Ring::new(1024).unwrap();
        ring.reserve(256).unwrap();
        ring.reset(512);
        assert_eq!(
            (ring.head(), ring.tail(), ring.emit()),
            (512, 512, 512)
        );
        assert_eq!(ring.space(), 1024 - CACHELINE_BYTES);
    }

    #[derive(Clone, Debug)]
    enum Op {
        Reserve(u32),
        Retire,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (1u32..=64).prop_map(|qw| Op::Reserve(qw * 8)),
            Just(Op::Retire),
        ]
    }

    proptest! {
        #[test]
        fn space_accounts_for_every_live_byte(ops in proptest::collection::vec(op(), 1..200)) {
            let mut ring = Ring::new(1024).unwrap();
            let mut live: VecDeque<u32> = VecDeque::new();

            for op in ops {
                match op {
                    Op::Reserve(len) => {
                        if ring.reserve(len).is_ok() {
                            live.push_back(ring.emit());
                        }
                    }
                    Op::Retire => {
                        if let Some(end) = live.pop_front() {
                            ring.publish_head(end);
                        }
                    }
                }

                prop_assert!(ring.space() <= ring.size());
                let reported = ring.space();
                let fresh = ring.update_space();
                // Stale space is never larger than the truth.
                prop_assert!(reported <= fresh);

                let used = ring.emit().wrapping_sub(ring.head()) & (ring.size() - 1);
                prop_assert_eq!(used + fresh, ring.size() - CACHELINE_BYTES);
            }
        }
    }
}
