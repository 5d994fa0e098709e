//! Lock-free single-producer single-consumer ring buffer (component J).
//!
//! One producer thread, one consumer thread, enforced by construction (the
//! type is `!Clone`, handed out as a producer half and a consumer half that
//! do not implement `Sync` with each other — see [`SpscRing::split`]).
//! Capacity is a power of two; one slot is reserved so `head == tail` is
//! unambiguously "empty" and never aliases "full".

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::QueueFull;

/// Pads a value out to a full cache line so the producer's `head` and the
/// consumer's `tail` never false-share.
#[repr(align(64))]
struct CachePadded<T>(T);

struct Ring<T> {
    buf: Box<[UnsafeCell<MaybeUninit<T>>]>,
    mask: usize,
    head: CachePadded<AtomicUsize>,
    tail: CachePadded<AtomicUsize>,
}

// SAFETY: access to `buf` is disciplined by the head/tail protocol below —
// the producer only ever writes cell `head & mask` and the consumer only
// ever reads/drops a cell after observing `head` with Acquire ordering.
unsafe impl<T: Send> Send for Ring<T> {}
unsafe impl<T: Send> Sync for Ring<T> {}

/// A bounded SPSC ring of capacity `size - 1` (one slot reserved to
/// distinguish full from empty). `size` must be a power of two.
pub struct SpscRing<T> {
    ring: std::sync::Arc<Ring<T>>,
}

/// The producer half of a split [`SpscRing`]. Not `Clone` — only one
/// producer thread may hold this.
pub struct Producer<T> {
    ring: std::sync::Arc<Ring<T>>,
}

/// The consumer half of a split [`SpscRing`]. Not `Clone` — only one
/// consumer thread may hold this.
pub struct Consumer<T> {
    ring: std::sync::Arc<Ring<T>>,
}

unsafe impl<T: Send> Send for Producer<T> {}
unsafe impl<T: Send> Send for Consumer<T> {}

// Cloning a `Producer` hands out another reference to the same ring, not a
// second independent producer role — used by the output router to stash one
// clone per TCP slot while still treating "the output router thread" as the
// sole caller of `enqueue` for any given ring.
impl<T> Clone for Producer<T> {
    fn clone(&self) -> Self {
        Self { ring: self.ring.clone() }
    }
}

impl<T> SpscRing<T> {
    /// `size` must be a power of two; usable capacity is `size - 1`.
    pub fn new(size: usize) -> Self {
        assert!(size.is_power_of_two() && size >= 2, "SpscRing size must be a power of two >= 2");
        let buf = (0..size)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let ring = std::sync::Arc::new(Ring {
            buf,
            mask: size - 1,
            head: CachePadded(AtomicUsize::new(0)),
            tail: CachePadded(AtomicUsize::new(0)),
        });
        Self { ring }
    }

    /// Capacity reported per spec §3: `size - 1`.
    pub fn capacity(&self) -> usize {
        self.ring.mask
    }

    /// Split into single-producer and single-consumer handles.
    pub fn split(self) -> (Producer<T>, Consumer<T>) {
        (Producer { ring: self.ring.clone() }, Consumer { ring: self.ring })
    }
}

impl<T> Producer<T> {
    /// Enqueue `v`. Returns the value back inside `Err` without blocking if
    /// the ring is at capacity; never retries internally.
    pub fn enqueue(&self, v: T) -> Result<(), (QueueFull, T)> {
        let ring = &*self.ring;
        let head = ring.head.0.load(Ordering::Relaxed);
        let tail = ring.tail.0.load(Ordering::Acquire);
        if (head.wrapping_add(1)) & ring.mask == tail & ring.mask {
            return Err((QueueFull, v));
        }
        let idx = head & ring.mask;
        // SAFETY: this slot is not owned by the consumer — the full check
        // above guarantees `idx` is strictly behind `tail`.
        unsafe {
            (*ring.buf[idx].get()).write(v);
        }
        ring.head.0.store(head.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Retry `enqueue` with an adaptive spin/yield/sleep backoff, up to
    /// `max_iters` attempts. Used by the UDP receiver (§4.5) and processor
    /// output path (§4.6), both of which are permitted brief backpressure
    /// tolerance that the ingress TCP path is not.
    pub fn enqueue_retrying(&self, v: T, max_iters: u32) -> Result<(), QueueFull> {
        let mut k = 0u32;
        let mut v = v;
        for _ in 0..max_iters {
            match self.enqueue(v) {
                Ok(()) => return Ok(()),
                Err((QueueFull, returned)) => {
                    v = returned;
                    adaptive_yield(&mut k);
                }
            }
        }
        Err(QueueFull)
    }

    /// Approximate size: `head` and `tail` are both monotonically
    /// increasing cursors (only their low bits, masked at index time, ever
    /// wrap), so the live count is simply their difference.
    pub fn len(&self) -> usize {
        let ring = &*self.ring;
        let head = ring.head.0.load(Ordering::Relaxed);
        let tail = ring.tail.0.load(Ordering::Relaxed);
        head.wrapping_sub(tail)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Consumer<T> {
    /// Dequeue one value, or `None` if the ring is empty.
    pub fn dequeue(&self) -> Option<T> {
        let ring = &*self.ring;
        let tail = ring.tail.0.load(Ordering::Relaxed);
        let head = ring.head.0.load(Ordering::Acquire);
        if tail == head {
            return None;
        }
        let idx = tail & ring.mask;
        // SAFETY: `idx` was published by the producer (Release store to
        // `head` observed above via Acquire) and has not yet been read.
        let v = unsafe { (*ring.buf[idx].get()).assume_init_read() };
        ring.tail.0.store(tail.wrapping_add(1), Ordering::Release);
        Some(v)
    }

    /// Dequeue up to `n` values into `out`, returning the number dequeued.
    pub fn dequeue_batch(&self, out: &mut Vec<T>, n: usize) -> usize {
        let mut count = 0;
        while count < n {
            match self.dequeue() {
                Some(v) => {
                    out.push(v);
                    count += 1;
                }
                None => break,
            }
        }
        count
    }

    pub fn len(&self) -> usize {
        let ring = &*self.ring;
        let head = ring.head.0.load(Ordering::Relaxed);
        let tail = ring.tail.0.load(Ordering::Relaxed);
        head.wrapping_sub(tail)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Drop for Ring<T> {
    fn drop(&mut self) {
        // Drain any remaining initialized elements so `T`'s destructor runs.
        let mut tail = *self.tail.0.get_mut();
        let head = *self.head.0.get_mut();
        while tail != head {
            let idx = tail & self.mask;
            unsafe {
                (*self.buf[idx].get()).assume_init_drop();
            }
            tail = tail.wrapping_add(1);
        }
    }
}

/// Adaptive backoff matching the codebase's existing spin → yield → sleep
/// ladder (see the pack's `spin_lock` idiom): busy-spin briefly, then a CPU
/// pause hint, then a thread yield, then a short sleep.
pub fn adaptive_yield(k: &mut u32) {
    if *k < 4 {
        // busy spin
    } else if *k < 16 {
        std::hint::spin_loop();
    } else if *k < 32 {
        std::thread::yield_now();
    } else {
        std::thread::sleep(std::time::Duration::from_micros(100));
        return;
    }
    *k += 1;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enqueue_dequeue_roundtrip() {
        let (p, c) = SpscRing::<u32>::new(8).split();
        assert_eq!(p.enqueue(1), Ok(()));
        assert_eq!(p.enqueue(2), Ok(()));
        assert_eq!(c.dequeue(), Some(1));
        assert_eq!(c.dequeue(), Some(2));
        assert_eq!(c.dequeue(), None);
    }

    #[test]
    fn capacity_is_size_minus_one() {
        let ring = SpscRing::<u32>::new(8);
        assert_eq!(ring.capacity(), 7);
        let (p, _c) = ring.split();
        for i in 0..7 {
            assert_eq!(p.enqueue(i), Ok(()));
        }
        assert_eq!(p.enqueue(99), Err((QueueFull, 99)));
    }

    #[test]
    fn fifo_order_preserved_under_interleaving() {
        let (p, c) = SpscRing::<u32>::new(4).split();
        p.enqueue(1).unwrap();
        p.enqueue(2).unwrap();
        assert_eq!(c.dequeue(), Some(1));
        p.enqueue(3).unwrap();
        assert_eq!(c.dequeue(), Some(2));
        assert_eq!(c.dequeue(), Some(3));
        assert_eq!(c.dequeue(), None);
    }

    #[test]
    fn concurrent_producer_consumer_preserves_prefix() {
        let ring = SpscRing::<u64>::new(1024);
        let (p, c) = ring.split();
        let n = 100_000u64;
        let producer = std::thread::spawn(move || {
            for i in 0..n {
                while p.enqueue(i).is_err() {
                    std::thread::yield_now();
                }
            }
        });
        let mut received = Vec::with_capacity(n as usize);
        while (received.len() as u64) < n {
            if let Some(v) = c.dequeue() {
                received.push(v);
            }
        }
        producer.join().unwrap();
        for (i, v) in received.iter().enumerate() {
            assert_eq!(*v, i as u64);
        }
    }

    #[test]
    fn drop_runs_destructors_for_remaining_elements() {
        use std::sync::atomic::AtomicUsize as AU;
        use std::sync::Arc;
        #[derive(Debug)]
        struct Counted(Arc<AU>);
        impl Drop for Counted {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::Relaxed);
            }
        }
        let counter = Arc::new(AU::new(0));
        {
            let (p, _c) = SpscRing::<Counted>::new(4).split();
            p.enqueue(Counted(counter.clone())).unwrap();
            p.enqueue(Counted(counter.clone())).unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 2);
    }
}
