//! Lock-free SPSC byte ring
//!
//! The ring carries a raw byte stream between exactly one producer and one
//! consumer, possibly in different processes. Indices are 64-bit monotonic
//! counters in the shared [`RingHeader`](crate::layout::RingHeader); byte
//! positions are `idx & (capacity - 1)`, so a copy that crosses the end of
//! the region is split in two.
//!
//! # Protocol
//! - Producer: load own `write_idx` relaxed, load `read_idx` acquire,
//!   copy into free space, publish `write_idx` with release.
//! - Consumer: load own `read_idx` relaxed, load `write_idx` acquire,
//!   copy out queued bytes, publish `read_idx` with release.
//!
//! The acquire/release pair on each index is what makes the bytes written
//! before a publish visible to the other side after it observes the new
//! index. Neither operation blocks or spins.

use crate::layout::RingHeader;
use std::sync::atomic::Ordering;

/// Write end of one ring
pub struct RingProducer {
    header: *const RingHeader,
    data: *mut u8,
    capacity: u64,
    mask: u64,
}

// SAFETY: the SPSC protocol partitions all mutable state; a producer may be
// moved to (and used from) one thread at a time.
unsafe impl Send for RingProducer {}

impl RingProducer {
    /// Create a producer over an initialized ring.
    ///
    /// # Safety
    /// `header` must point to a validated `RingHeader` and `data` to its
    /// `capacity` bytes of ring storage; at most one producer may exist
    /// per ring across all processes.
    pub unsafe fn from_raw(header: *const RingHeader, data: *mut u8) -> Self {
        let capacity = (*header).capacity() as u64;
        Self {
            header,
            data,
            capacity,
            mask: capacity - 1,
        }
    }

    /// Copy up to `src.len()` bytes into the ring.
    ///
    /// Returns the number of bytes actually queued: 0 if the ring is full
    /// (or `src` is empty), less than `src.len()` if only partial space was
    /// free. Never blocks.
    pub fn push(&mut self, src: &[u8]) -> usize {
        if src.is_empty() {
            return 0;
        }

        let header = unsafe { &*self.header };
        let w = header.write_idx().load(Ordering::Relaxed);
        let r = header.read_idx().load(Ordering::Acquire);

        let free = self.capacity - w.wrapping_sub(r);
        if free == 0 {
            return 0;
        }

        let n = (src.len() as u64).min(free) as usize;
        let pos = (w & self.mask) as usize;
        let first = n.min(self.capacity as usize - pos);

        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), self.data.add(pos), first);
            if n > first {
                std::ptr::copy_nonoverlapping(src.as_ptr().add(first), self.data, n - first);
            }
        }

        header.write_idx().store(w + n as u64, Ordering::Release);
        n
    }

    /// Free bytes at this instant. A hint only: the consumer may free more
    /// space at any time.
    #[inline]
    pub fn free_bytes(&self) -> usize {
        let header = unsafe { &*self.header };
        let w = header.write_idx().load(Ordering::Relaxed);
        let r = header.read_idx().load(Ordering::Acquire);
        (self.capacity - w.wrapping_sub(r)) as usize
    }
}

/// Read end of one ring
pub struct RingConsumer {
    header: *const RingHeader,
    data: *const u8,
    capacity: u64,
    mask: u64,
}

// SAFETY: same partitioning argument as `RingProducer`.
unsafe impl Send for RingConsumer {}

impl RingConsumer {
    /// Create a consumer over an initialized ring.
    ///
    /// # Safety
    /// Same contract as [`RingProducer::from_raw`], with at most one
    /// consumer per ring.
    pub unsafe fn from_raw(header: *const RingHeader, data: *const u8) -> Self {
        let capacity = (*header).capacity() as u64;
        Self {
            header,
            data,
            capacity,
            mask: capacity - 1,
        }
    }

    /// Copy up to `dst.len()` queued bytes out of the ring.
    ///
    /// Returns 0 if the ring is empty (or `dst` is empty). Never blocks.
    pub fn pop(&mut self, dst: &mut [u8]) -> usize {
        if dst.is_empty() {
            return 0;
        }

        let header = unsafe { &*self.header };
        let r = header.read_idx().load(Ordering::Relaxed);
        let w = header.write_idx().load(Ordering::Acquire);

        let avail = w.wrapping_sub(r);
        if avail == 0 {
            return 0;
        }

        let n = (dst.len() as u64).min(avail) as usize;
        let pos = (r & self.mask) as usize;
        let first = n.min(self.capacity as usize - pos);

        unsafe {
            std::ptr::copy_nonoverlapping(self.data.add(pos), dst.as_mut_ptr(), first);
            if n > first {
                std::ptr::copy_nonoverlapping(self.data, dst.as_mut_ptr().add(first), n - first);
            }
        }

        header.read_idx().store(r + n as u64, Ordering::Release);
        n
    }

    /// Queued bytes at this instant. A hint only: the producer may queue
    /// more at any time.
    #[inline]
    pub fn available_bytes(&self) -> usize {
        let header = unsafe { &*self.header };
        let r = header.read_idx().load(Ordering::Relaxed);
        let w = header.write_idx().load(Ordering::Acquire);
        w.wrapping_sub(r) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{RingHeader, CACHE_LINE_SIZE, HEADER_SIZE};
    use std::alloc::{alloc_zeroed, dealloc, Layout};
    use std::sync::atomic::Ordering;

    struct TestRing {
        ptr: *mut u8,
        layout: Layout,
    }

    impl TestRing {
        fn new(capacity: u32) -> Self {
            let layout =
                Layout::from_size_align(HEADER_SIZE + capacity as usize, CACHE_LINE_SIZE)
                    .unwrap();
            let ptr = unsafe { alloc_zeroed(layout) };
            unsafe {
                RingHeader::init(ptr as *mut RingHeader, capacity, HEADER_SIZE as u32);
            }
            Self { ptr, layout }
        }

        fn header(&self) -> *const RingHeader {
            self.ptr as *const RingHeader
        }

        fn data(&self) -> *mut u8 {
            unsafe { self.ptr.add(HEADER_SIZE) }
        }

        fn endpoints(&self) -> (RingProducer, RingConsumer) {
            unsafe {
                (
                    RingProducer::from_raw(self.header(), self.data()),
                    RingConsumer::from_raw(self.header(), self.data()),
                )
            }
        }
    }

    impl Drop for TestRing {
        fn drop(&mut self) {
            unsafe { dealloc(self.ptr, self.layout) };
        }
    }

    #[test]
    fn test_push_pop_roundtrip() {
        let ring = TestRing::new(64);
        let (mut tx, mut rx) = ring.endpoints();

        assert_eq!(tx.push(b"hello"), 5);
        assert_eq!(rx.available_bytes(), 5);

        let mut buf = [0u8; 16];
        assert_eq!(rx.pop(&mut buf), 5);
        assert_eq!(&buf[..5], b"hello");
        assert_eq!(rx.pop(&mut buf), 0);
    }

    #[test]
    fn test_full_and_partial_push() {
        let ring = TestRing::new(8);
        let (mut tx, mut rx) = ring.endpoints();

        assert_eq!(tx.push(&[0, 1, 2, 3, 4, 5, 6, 7]), 8);
        assert_eq!(tx.free_bytes(), 0);
        assert_eq!(tx.push(&[8]), 0);

        let mut buf = [0u8; 5];
        assert_eq!(rx.pop(&mut buf), 5);
        assert_eq!(&buf, &[0, 1, 2, 3, 4]);

        // Only 5 bytes free, larger input is truncated.
        assert_eq!(tx.push(&[8, 9, 10, 11, 12, 13, 14]), 5);

        let mut buf = [0u8; 8];
        assert_eq!(rx.pop(&mut buf), 8);
        assert_eq!(&buf, &[5, 6, 7, 8, 9, 10, 11, 12]);
    }

    #[test]
    fn test_zero_length_ops() {
        let ring = TestRing::new(8);
        let (mut tx, mut rx) = ring.endpoints();

        assert_eq!(tx.push(&[]), 0);
        let mut empty: [u8; 0] = [];
        assert_eq!(rx.pop(&mut empty), 0);

        tx.push(b"xy");
        assert_eq!(rx.pop(&mut empty), 0);
        assert_eq!(rx.available_bytes(), 2);
    }

    #[test]
    fn test_wraparound_stream() {
        // Push/pop 3*C + k bytes for every k and verify the byte stream.
        let cap = 16u32;
        for k in 0..cap as usize {
            let ring = TestRing::new(cap);
            let (mut tx, mut rx) = ring.endpoints();

            let total = 3 * cap as usize + k;
            let payload: Vec<u8> = (0..total).map(|i| (i * 7 + 13) as u8).collect();

            let mut sent = 0;
            let mut received = Vec::new();
            let mut buf = [0u8; 5];
            while received.len() < total {
                sent += tx.push(&payload[sent..]);
                let n = rx.pop(&mut buf);
                received.extend_from_slice(&buf[..n]);
            }
            assert_eq!(received, payload);
        }
    }

    #[test]
    fn test_indices_past_u32() {
        let ring = TestRing::new(8);
        let header = unsafe { &*ring.header() };

        // Pretend this ring has been running for a long while.
        let base = (u32::MAX as u64) * 3 + 5;
        header.read_idx().store(base, Ordering::Relaxed);
        header.write_idx().store(base, Ordering::Relaxed);

        let (mut tx, mut rx) = ring.endpoints();
        assert_eq!(tx.push(b"abcdefgh"), 8);
        assert_eq!(tx.push(b"x"), 0);

        let mut buf = [0u8; 8];
        assert_eq!(rx.pop(&mut buf), 8);
        assert_eq!(&buf, b"abcdefgh");
        assert_eq!(header.read_idx().load(Ordering::Relaxed), base + 8);
    }

    #[test]
    fn test_concurrent_byte_integrity() {
        let ring = TestRing::new(64);
        let (mut tx, mut rx) = ring.endpoints();

        const TOTAL: usize = 1 << 20;
        let payload: Vec<u8> = (0..TOTAL).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();

        let producer = std::thread::spawn(move || {
            let mut sent = 0;
            while sent < TOTAL {
                let n = tx.push(&payload[sent..]);
                if n == 0 {
                    std::hint::spin_loop();
                }
                sent += n;
            }
        });

        let mut received = Vec::with_capacity(TOTAL);
        let mut buf = [0u8; 113];
        while received.len() < TOTAL {
            let n = rx.pop(&mut buf);
            if n == 0 {
                std::hint::spin_loop();
            }
            received.extend_from_slice(&buf[..n]);
        }

        producer.join().unwrap();
        assert_eq!(received, expected);
    }
}
