//! Lock-free SPSC ring of fixed-size byte frames.

use std::cell::UnsafeCell;
use std::fmt;
#[cfg(not(loom))]
use std::sync::atomic::AtomicUsize;
#[cfg(not(loom))]
use std::sync::atomic::Ordering::{Acquire, Relaxed, Release};
#[cfg(not(loom))]
use std::sync::Arc;

use crossbeam_utils::CachePadded;
#[cfg(loom)]
use loom::sync::atomic::AtomicUsize;
#[cfg(loom)]
use loom::sync::atomic::Ordering::{Acquire, Relaxed, Release};
#[cfg(loom)]
use loom::sync::Arc;

/// Creates a ring holding at least `frames` frames of `frame_size` bytes each.
///
/// Capacity is rounded up to a power of two.
///
/// # Panics
///
/// Panics if `frame_size` is zero.
pub fn ring(frames: usize, frame_size: usize) -> (Producer, Consumer) {
    assert!(frame_size > 0, "frame size must be positive");

    let capacity = frames.max(1).next_power_of_two();
    let data = (0..capacity * frame_size).map(|_| UnsafeCell::new(0)).collect();

    let shared = Arc::new(Shared {
        data,
        capacity,
        frame_size,
        read: CachePadded::new(AtomicUsize::new(0)),
        write: CachePadded::new(AtomicUsize::new(0)),
    });

    let producer = Producer {
        shared: shared.clone(),
    };
    let consumer = Consumer { shared };
    (producer, consumer)
}

struct Shared {
    data: Box<[UnsafeCell<u8>]>,
    /// In frames, a power of two.
    capacity: usize,
    frame_size: usize,
    /// Frames consumed so far, wrapping.
    read: CachePadded<AtomicUsize>,
    /// Frames produced so far, wrapping.
    write: CachePadded<AtomicUsize>,
}

// SAFETY: frame bytes are only touched by the producer in the free region and by the consumer in
// the filled region. The regions are handed over with Release/Acquire on the cursors.
unsafe impl Sync for Shared {}

impl Shared {
    fn data_ptr(&self) -> *mut u8 {
        UnsafeCell::raw_get(self.data.as_ptr())
    }

    fn len(&self) -> usize {
        // Read first: the write cursor never falls behind a read cursor observed earlier.
        let read = self.read.load(Acquire);
        let write = self.write.load(Acquire);
        write.wrapping_sub(read).min(self.capacity)
    }

    /// Splits `frames` frames starting at cursor `at` into the part before the wrap and the part
    /// after it, in bytes.
    fn spans(&self, at: usize, frames: usize) -> (usize, usize, usize) {
        let start = at & (self.capacity - 1);
        let first = frames.min(self.capacity - start);
        (
            start * self.frame_size,
            first * self.frame_size,
            (frames - first) * self.frame_size,
        )
    }
}

/// Writing side of the ring.
pub struct Producer {
    shared: Arc<Shared>,
}

impl Producer {
    /// Capacity in frames.
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn frame_size(&self) -> usize {
        self.shared.frame_size
    }

    /// Frames currently stored.
    pub fn len(&self) -> usize {
        self.shared.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Frames that can be written right now.
    pub fn free(&self) -> usize {
        self.shared.capacity - self.len()
    }

    /// Writes as many whole frames of `data` as fit, returning the number of frames written.
    pub fn write(&mut self, data: &[u8]) -> usize {
        let shared = &*self.shared;

        let write = shared.write.load(Relaxed);
        // Acquire pairs with the consumer's Release, so the frames it freed are really free.
        let read = shared.read.load(Acquire);

        let free = shared.capacity - write.wrapping_sub(read);
        let frames = (data.len() / shared.frame_size).min(free);
        if frames == 0 {
            return 0;
        }

        let (start, first, second) = shared.spans(write, frames);

        // SAFETY: the span lies in the free region which only the producer touches, and `data`
        // holds `first + second` bytes.
        unsafe {
            let ptr = shared.data_ptr();
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.add(start), first);
            std::ptr::copy_nonoverlapping(data.as_ptr().add(first), ptr, second);
        }

        shared.write.store(write.wrapping_add(frames), Release);
        frames
    }

    /// Returns a handle for inspecting the ring from a third party.
    pub fn handle(&self) -> RingHandle {
        RingHandle {
            shared: self.shared.clone(),
        }
    }
}

impl fmt::Debug for Producer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Producer")
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .finish()
    }
}

/// Reading side of the ring.
pub struct Consumer {
    shared: Arc<Shared>,
}

impl Consumer {
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn frame_size(&self) -> usize {
        self.shared.frame_size
    }

    /// Frames available for reading.
    pub fn len(&self) -> usize {
        self.shared.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reads up to `out.len() / frame_size` frames, returning the number of frames read.
    pub fn read(&mut self, out: &mut [u8]) -> usize {
        let shared = &*self.shared;

        let read = shared.read.load(Relaxed);
        // Acquire pairs with the producer's Release, making the written frames visible.
        let write = shared.write.load(Acquire);

        let frames = (out.len() / shared.frame_size).min(write.wrapping_sub(read));
        if frames == 0 {
            return 0;
        }

        let (start, first, second) = shared.spans(read, frames);

        // SAFETY: the span lies in the filled region which only the consumer touches, and `out`
        // holds `first + second` bytes.
        unsafe {
            let ptr = shared.data_ptr();
            std::ptr::copy_nonoverlapping(ptr.add(start), out.as_mut_ptr(), first);
            std::ptr::copy_nonoverlapping(ptr, out.as_mut_ptr().add(first), second);
        }

        shared.read.store(read.wrapping_add(frames), Release);
        frames
    }

    /// Drops up to `frames` frames without reading them.
    pub fn skip(&mut self, frames: usize) -> usize {
        let shared = &*self.shared;
        let read = shared.read.load(Relaxed);
        let write = shared.write.load(Acquire);
        let frames = frames.min(write.wrapping_sub(read));
        shared.read.store(read.wrapping_add(frames), Release);
        frames
    }

    pub fn handle(&self) -> RingHandle {
        RingHandle {
            shared: self.shared.clone(),
        }
    }
}

impl fmt::Debug for Consumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer")
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .finish()
    }
}

/// Observer of a ring, held by neither end.
#[derive(Clone)]
pub struct RingHandle {
    shared: Arc<Shared>,
}

impl RingHandle {
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn len(&self) -> usize {
        self.shared.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Empties the ring.
    ///
    /// # Safety
    ///
    /// Neither the producer nor the consumer may be used concurrently with this call.
    pub unsafe fn reset(&self) {
        let write = self.shared.write.load(Acquire);
        self.shared.read.store(write, Release);
    }
}

impl fmt::Debug for RingHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingHandle")
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .finish()
    }
}
