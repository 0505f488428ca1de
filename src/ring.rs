//! Rotating period buffers shared between producer and hardware threads.
//!
//! A [`RingBufferSet`] owns N raw byte buffers cycling through
//! `Free → Writing → Ready → Reading → Free`. The producer claims the next
//! free slot, fills it (optionally through per-region sub-block locks that
//! admit concurrent disjoint writers), and releases it as ready; the
//! hardware side claims ready slots in the same order and releases them as
//! free. The slot state machine is the only place the two threads meet, so
//! the buffer currently in flight to hardware can never also be a write
//! target.
//!
//! All waits are bounded. A missed deadline is an xrun, not an error: the
//! read side gets substitute bytes per [`XrunPolicy`] and playback carries
//! on.

use core::cell::UnsafeCell;
use core::time::Duration;
use std::time::Instant;

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::config::{StreamParams, XrunPolicy};
use crate::lockfree::AtomicFlag;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Free,
    Writing,
    Ready,
    Reading,
}

#[derive(Debug)]
struct RingState {
    slots: Vec<SlotState>,
    write_index: usize,
    read_index: usize,
}

/// How a bounded slot acquisition resolved.
#[derive(Debug)]
pub enum SlotWait<T> {
    Acquired(T),
    TimedOut,
    Shutdown,
}

/// Outcome of a read-side acquisition, with deadline substitution applied.
#[derive(Debug)]
pub enum ReadWait<'a> {
    Acquired(ReadSlot<'a>),
    /// Deadline missed; serve these bytes instead (silence or the previous
    /// period, per policy).
    Substitute(SubstitutePeriod<'a>),
    Shutdown,
}

/// Bytes served in place of a missed period.
///
/// For [`XrunPolicy::RepeatLast`] this holds the lock on the repeat buffer,
/// so the bytes cannot change underneath the holder; releasing a later read
/// slot blocks until the guard is dropped.
pub struct SubstitutePeriod<'a> {
    bytes: SubstituteBytes<'a>,
}

enum SubstituteBytes<'a> {
    Silence(&'a [u8]),
    Repeat(MutexGuard<'a, Vec<u8>>),
}

impl core::ops::Deref for SubstitutePeriod<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match &self.bytes {
            SubstituteBytes::Silence(bytes) => bytes,
            SubstituteBytes::Repeat(guard) => guard.as_slice(),
        }
    }
}

impl core::fmt::Debug for SubstitutePeriod<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SubstitutePeriod")
            .field("len", &self.len())
            .finish()
    }
}

/// N rotating period buffers with sub-block locks.
pub struct RingBufferSet {
    inner: Mutex<RingState>,
    freed: Condvar,
    ready: Condvar,
    buffers: Vec<UnsafeCell<Vec<u8>>>,
    sub_locks: Vec<Vec<Mutex<()>>>,
    /// Copy of the last period released by the read side.
    repeat: Mutex<Vec<u8>>,
    silence: Vec<u8>,
    sub_block_count: usize,
    period_bytes: usize,
    policy: XrunPolicy,
    shutdown: AtomicFlag,
}

// SAFETY: a buffer is only dereferenced by the holder of its slot (the slot
// state machine under `inner` hands out each index to at most one side at a
// time), or through a held sub-block mutex for a disjoint region.
unsafe impl Send for RingBufferSet {}
unsafe impl Sync for RingBufferSet {}

impl RingBufferSet {
    pub fn new(
        params: &StreamParams,
        ring_count: usize,
        sub_block_count: usize,
        policy: XrunPolicy,
    ) -> Result<Self> {
        if ring_count < 3 {
            return Err(Error::InvalidConfig(format!(
                "ring_count {} too small (minimum 3)",
                ring_count
            )));
        }
        if sub_block_count == 0 {
            return Err(Error::InvalidConfig("sub_block_count must be non-zero".into()));
        }
        params.validate()?;

        let period_bytes = params.period_bytes();
        let buffers = (0..ring_count)
            .map(|_| UnsafeCell::new(vec![0u8; period_bytes]))
            .collect();
        let sub_locks = (0..ring_count)
            .map(|_| (0..sub_block_count).map(|_| Mutex::new(())).collect())
            .collect();

        Ok(Self {
            inner: Mutex::new(RingState {
                slots: vec![SlotState::Free; ring_count],
                write_index: 0,
                read_index: 0,
            }),
            freed: Condvar::new(),
            ready: Condvar::new(),
            buffers,
            sub_locks,
            repeat: Mutex::new(vec![0u8; period_bytes]),
            silence: vec![0u8; period_bytes],
            sub_block_count,
            period_bytes,
            policy,
            shutdown: AtomicFlag::new(false),
        })
    }

    pub fn ring_count(&self) -> usize {
        self.buffers.len()
    }

    pub fn period_bytes(&self) -> usize {
        self.period_bytes
    }

    pub fn sub_block_count(&self) -> usize {
        self.sub_block_count
    }

    pub fn policy(&self) -> XrunPolicy {
        self.policy
    }

    /// Unblock both sides and refuse further acquisitions. Idempotent.
    pub fn shutdown(&self) {
        self.shutdown.set(true);
        let _state = self.inner.lock();
        self.freed.notify_all();
        self.ready.notify_all();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.get()
    }

    /// Producer side: claim the next slot for writing.
    pub fn acquire_write_slot(&self, timeout: Duration) -> SlotWait<WriteSlot<'_>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.lock();
        loop {
            if self.shutdown.get() {
                return SlotWait::Shutdown;
            }
            let index = state.write_index;
            if state.slots[index] == SlotState::Free {
                state.slots[index] = SlotState::Writing;
                // SAFETY: the slot just moved to Writing, so no other
                // reference to this buffer can exist until the handle is
                // released. The base pointer is taken once here; all slices
                // handed out by the guard derive from it, never from a
                // whole-buffer reference.
                let base = unsafe { (*self.buffers[index].get()).as_mut_ptr() };
                return SlotWait::Acquired(WriteSlot {
                    set: self,
                    index,
                    base,
                    done: false,
                });
            }
            if self.freed.wait_until(&mut state, deadline).timed_out() {
                if self.shutdown.get() {
                    return SlotWait::Shutdown;
                }
                if state.slots[state.write_index] != SlotState::Free {
                    return SlotWait::TimedOut;
                }
            }
        }
    }

    /// Hardware side: claim the next ready slot, or substitute bytes when
    /// the deadline passes.
    pub fn acquire_read_slot(&self, timeout: Duration) -> ReadWait<'_> {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.lock();
        loop {
            if self.shutdown.get() {
                return ReadWait::Shutdown;
            }
            let index = state.read_index;
            if state.slots[index] == SlotState::Ready {
                state.slots[index] = SlotState::Reading;
                return ReadWait::Acquired(ReadSlot {
                    set: self,
                    index,
                    done: false,
                });
            }
            if self.ready.wait_until(&mut state, deadline).timed_out() {
                if self.shutdown.get() {
                    return ReadWait::Shutdown;
                }
                if state.slots[state.read_index] != SlotState::Ready {
                    drop(state);
                    return ReadWait::Substitute(self.substitute());
                }
            }
        }
    }

    fn substitute(&self) -> SubstitutePeriod<'_> {
        let bytes = match self.policy {
            XrunPolicy::Silence => SubstituteBytes::Silence(&self.silence),
            XrunPolicy::RepeatLast => SubstituteBytes::Repeat(self.repeat.lock()),
        };
        SubstitutePeriod { bytes }
    }

    fn release_written(&self, index: usize) {
        let mut state = self.inner.lock();
        debug_assert_eq!(state.slots[index], SlotState::Writing);
        state.slots[index] = SlotState::Ready;
        state.write_index = (index + 1) % state.slots.len();
        self.ready.notify_all();
    }

    fn cancel_written(&self, index: usize) {
        let mut state = self.inner.lock();
        debug_assert_eq!(state.slots[index], SlotState::Writing);
        state.slots[index] = SlotState::Free;
        self.freed.notify_all();
    }

    fn release_read(&self, index: usize) {
        if self.policy == XrunPolicy::RepeatLast {
            let mut repeat = self.repeat.lock();
            // SAFETY: `index` is still in Reading state, so the producer
            // cannot touch this buffer.
            let src = unsafe { (*self.buffers[index].get()).as_slice() };
            repeat.copy_from_slice(src);
        }
        let mut state = self.inner.lock();
        debug_assert_eq!(state.slots[index], SlotState::Reading);
        state.slots[index] = SlotState::Free;
        state.read_index = (index + 1) % state.slots.len();
        self.freed.notify_all();
    }
}

/// Exclusive handle to a buffer being filled. Dropping the handle releases
/// the slot as ready; [`WriteSlot::cancel`] frees it unfilled instead.
pub struct WriteSlot<'a> {
    set: &'a RingBufferSet,
    index: usize,
    /// Start of the slot's buffer; every slice the handle hands out is
    /// carved from this pointer so sub-block borrows never overlap.
    base: *mut u8,
    done: bool,
}

// SAFETY: `base` points into a buffer owned by the ring and is only
// dereferenced while the slot is in Writing state; whole-buffer access
// requires `&mut self` and sub-block regions are serialized by their
// mutexes, so handing the slot (or `&WriteSlot` for sub-block fills) to
// another thread cannot create overlapping access.
unsafe impl Send for WriteSlot<'_> {}
unsafe impl Sync for WriteSlot<'_> {}

impl<'a> WriteSlot<'a> {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn len(&self) -> usize {
        self.set.period_bytes
    }

    pub fn is_empty(&self) -> bool {
        self.set.period_bytes == 0
    }

    /// Whole-period access.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: exclusive borrow of the only handle to a Writing slot;
        // `base` spans exactly `period_bytes`.
        unsafe { core::slice::from_raw_parts_mut(self.base, self.set.period_bytes) }
    }

    /// Try-lock one sub-block for a concurrent disjoint writer. Returns
    /// `None` if that region is already locked.
    pub fn sub_block(&self, index: usize) -> Option<SubBlock<'_>> {
        let locks = &self.set.sub_locks[self.index];
        if index >= locks.len() {
            return None;
        }
        let guard = locks[index].try_lock()?;

        let len = self.set.period_bytes;
        let region = len / self.set.sub_block_count;
        let start = index * region;
        let end = if index + 1 == self.set.sub_block_count {
            len
        } else {
            start + region
        };

        // SAFETY: the slot is in Writing state; the region [start, end) is
        // covered exclusively by the sub-block mutex held in `guard`, and
        // distinct sub-blocks never overlap. Carving the region straight
        // from `base` means no reference over the whole buffer is formed,
        // so live sibling guards stay valid.
        let bytes =
            unsafe { core::slice::from_raw_parts_mut(self.base.add(start), end - start) };

        Some(SubBlock {
            _guard: guard,
            bytes,
        })
    }

    /// Mark the slot ready and advance the write index.
    pub fn release(mut self) {
        self.finish();
    }

    /// Return the slot unfilled (shutdown path); the write index does not
    /// advance.
    pub fn cancel(mut self) {
        self.done = true;
        self.set.cancel_written(self.index);
    }

    fn finish(&mut self) {
        if !self.done {
            self.done = true;
            self.set.release_written(self.index);
        }
    }
}

impl Drop for WriteSlot<'_> {
    fn drop(&mut self) {
        self.finish();
    }
}

impl core::fmt::Debug for WriteSlot<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WriteSlot")
            .field("index", &self.index)
            .finish()
    }
}

/// One independently locked region of a buffer being filled.
pub struct SubBlock<'a> {
    _guard: MutexGuard<'a, ()>,
    bytes: &'a mut [u8],
}

impl core::ops::Deref for SubBlock<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.bytes
    }
}

impl core::ops::DerefMut for SubBlock<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.bytes
    }
}

/// Exclusive handle to a buffer in flight to hardware. Dropping releases
/// the slot back to the producer.
pub struct ReadSlot<'a> {
    set: &'a RingBufferSet,
    index: usize,
    done: bool,
}

impl<'a> ReadSlot<'a> {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn bytes(&self) -> &[u8] {
        // SAFETY: this slot is in Reading state and we hold the only handle.
        unsafe { (*self.set.buffers[self.index].get()).as_slice() }
    }

    pub fn release(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        if !self.done {
            self.done = true;
            self.set.release_read(self.index);
        }
    }
}

impl Drop for ReadSlot<'_> {
    fn drop(&mut self) {
        self.finish();
    }
}

impl core::fmt::Debug for ReadSlot<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ReadSlot")
            .field("index", &self.index)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    const TIMEOUT: Duration = Duration::from_millis(200);

    fn small_ring(policy: XrunPolicy) -> RingBufferSet {
        let params = StreamParams {
            buffer_size: 16,
            channels: 1,
            ..Default::default()
        };
        RingBufferSet::new(&params, 3, 4, policy).unwrap()
    }

    fn write_period(ring: &RingBufferSet, fill: u8) {
        match ring.acquire_write_slot(TIMEOUT) {
            SlotWait::Acquired(mut slot) => {
                slot.bytes_mut().fill(fill);
                slot.release();
            }
            other => panic!("expected write slot, got {:?}", other),
        }
    }

    #[test]
    fn test_rejects_too_few_buffers() {
        let params = StreamParams::default();
        assert!(RingBufferSet::new(&params, 2, 4, XrunPolicy::Silence).is_err());
    }

    #[test]
    fn test_write_read_roundtrip() {
        let ring = small_ring(XrunPolicy::Silence);

        write_period(&ring, 0xAB);

        match ring.acquire_read_slot(TIMEOUT) {
            ReadWait::Acquired(slot) => {
                assert!(slot.bytes().iter().all(|&b| b == 0xAB));
                slot.release();
            }
            other => panic!("expected read slot, got {:?}", other),
        };
    }

    #[test]
    fn test_slots_rotate_in_order() {
        let ring = small_ring(XrunPolicy::Silence);

        for fill in 0..3u8 {
            write_period(&ring, fill);
        }
        for fill in 0..3u8 {
            match ring.acquire_read_slot(TIMEOUT) {
                ReadWait::Acquired(slot) => {
                    assert!(slot.bytes().iter().all(|&b| b == fill));
                }
                other => panic!("expected read slot, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_writer_blocks_when_ring_full() {
        let ring = small_ring(XrunPolicy::Silence);

        for _ in 0..3 {
            write_period(&ring, 0);
        }
        // All three slots are Ready; the fourth write times out (overrun).
        assert!(matches!(
            ring.acquire_write_slot(Duration::from_millis(20)),
            SlotWait::TimedOut
        ));
    }

    #[test]
    fn test_read_timeout_substitutes_silence() {
        let ring = small_ring(XrunPolicy::Silence);
        match ring.acquire_read_slot(Duration::from_millis(20)) {
            ReadWait::Substitute(bytes) => assert!(bytes.iter().all(|&b| b == 0)),
            other => panic!("expected substitute, got {:?}", other),
        };
    }

    #[test]
    fn test_read_timeout_repeats_last_period() {
        let ring = small_ring(XrunPolicy::RepeatLast);

        write_period(&ring, 0x5A);
        match ring.acquire_read_slot(TIMEOUT) {
            ReadWait::Acquired(slot) => slot.release(),
            other => panic!("expected read slot, got {:?}", other),
        }

        // Nothing ready: the previous period is served unchanged.
        match ring.acquire_read_slot(Duration::from_millis(20)) {
            ReadWait::Substitute(bytes) => assert!(bytes.iter().all(|&b| b == 0x5A)),
            other => panic!("expected substitute, got {:?}", other),
        };
    }

    #[test]
    fn test_cancel_leaves_slot_free() {
        let ring = small_ring(XrunPolicy::Silence);

        match ring.acquire_write_slot(TIMEOUT) {
            SlotWait::Acquired(slot) => slot.cancel(),
            other => panic!("expected write slot, got {:?}", other),
        }
        // Slot is free again and the write index did not advance, so the
        // reader sees nothing ready.
        assert!(matches!(
            ring.acquire_read_slot(Duration::from_millis(20)),
            ReadWait::Substitute(_)
        ));
        write_period(&ring, 1);
        assert!(matches!(
            ring.acquire_read_slot(TIMEOUT),
            ReadWait::Acquired(_)
        ));
    }

    #[test]
    fn test_sub_blocks_are_disjoint_and_exclusive() {
        let ring = small_ring(XrunPolicy::Silence);

        let slot = match ring.acquire_write_slot(TIMEOUT) {
            SlotWait::Acquired(slot) => slot,
            other => panic!("expected write slot, got {:?}", other),
        };

        let mut a = slot.sub_block(0).unwrap();
        // Same region is locked.
        assert!(slot.sub_block(0).is_none());
        // A different region is not.
        let mut b = slot.sub_block(1).unwrap();

        a.fill(1);
        b.fill(2);
        assert_eq!(a.len() + b.len(), ring.period_bytes() / 2);
        drop(a);

        // Released regions can be relocked.
        assert!(slot.sub_block(0).is_some());
    }

    #[test]
    fn test_sub_block_writes_land_in_their_regions() {
        let ring = small_ring(XrunPolicy::Silence);

        let slot = match ring.acquire_write_slot(TIMEOUT) {
            SlotWait::Acquired(slot) => slot,
            other => panic!("expected write slot, got {:?}", other),
        };
        for i in 0..ring.sub_block_count() {
            let mut block = slot.sub_block(i).unwrap();
            block.fill(i as u8 + 1);
        }
        slot.release();

        let region = ring.period_bytes() / ring.sub_block_count();
        match ring.acquire_read_slot(TIMEOUT) {
            ReadWait::Acquired(slot) => {
                for i in 0..ring.sub_block_count() {
                    let bytes = &slot.bytes()[i * region..(i + 1) * region];
                    assert!(bytes.iter().all(|&b| b == i as u8 + 1), "region {}", i);
                }
            }
            other => panic!("expected read slot, got {:?}", other),
        };
    }

    #[test]
    fn test_substitute_is_stable_while_held() {
        let ring = Arc::new(small_ring(XrunPolicy::RepeatLast));

        write_period(&ring, 0x11);
        match ring.acquire_read_slot(TIMEOUT) {
            ReadWait::Acquired(slot) => slot.release(),
            other => panic!("expected read slot, got {:?}", other),
        };

        let substitute = match ring.acquire_read_slot(Duration::from_millis(20)) {
            ReadWait::Substitute(substitute) => substitute,
            other => panic!("expected substitute, got {:?}", other),
        };
        assert!(substitute.iter().all(|&b| b == 0x11));

        // A newer period being consumed cannot rewrite the bytes we hold;
        // its release parks until the substitute is dropped.
        write_period(&ring, 0x22);
        let consumer = {
            let ring = Arc::clone(&ring);
            thread::spawn(move || {
                match ring.acquire_read_slot(TIMEOUT) {
                    ReadWait::Acquired(slot) => slot.release(),
                    other => panic!("expected read slot, got {:?}", other),
                };
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(substitute.iter().all(|&b| b == 0x11));
        drop(substitute);
        consumer.join().unwrap();

        match ring.acquire_read_slot(Duration::from_millis(20)) {
            ReadWait::Substitute(substitute) => {
                assert!(substitute.iter().all(|&b| b == 0x22));
            }
            other => panic!("expected substitute, got {:?}", other),
        };
    }

    #[test]
    fn test_shutdown_unblocks_reader() {
        let ring = Arc::new(small_ring(XrunPolicy::Silence));

        let reader = {
            let ring = Arc::clone(&ring);
            thread::spawn(move || {
                let unblocked = matches!(
                    ring.acquire_read_slot(Duration::from_secs(10)),
                    ReadWait::Shutdown
                );
                unblocked
            })
        };

        thread::sleep(Duration::from_millis(50));
        ring.shutdown();
        assert!(reader.join().unwrap());

        // Further acquisitions refuse immediately.
        assert!(matches!(
            ring.acquire_write_slot(TIMEOUT),
            SlotWait::Shutdown
        ));
    }

    #[test]
    fn test_concurrent_producer_consumer() {
        let ring = Arc::new(small_ring(XrunPolicy::Silence));
        let periods = 200u32;

        let producer = {
            let ring = Arc::clone(&ring);
            thread::spawn(move || {
                for i in 0..periods {
                    match ring.acquire_write_slot(Duration::from_secs(5)) {
                        SlotWait::Acquired(mut slot) => {
                            slot.bytes_mut().fill((i % 251) as u8);
                            slot.release();
                        }
                        other => panic!("producer stalled: {:?}", other),
                    }
                }
            })
        };

        for i in 0..periods {
            match ring.acquire_read_slot(Duration::from_secs(5)) {
                ReadWait::Acquired(slot) => {
                    let expected = (i % 251) as u8;
                    assert!(slot.bytes().iter().all(|&b| b == expected));
                }
                other => panic!("consumer stalled: {:?}", other),
            }
        }

        producer.join().unwrap();
    }
}
