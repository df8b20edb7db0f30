//! Wait-free single-producer/single-consumer frame hand-off.
//!
//! A [`TripleBuffer`] lives inside a shared-memory region and is operated on
//! concurrently by two processes: one writer (an input worker, or the router
//! for an output region) and one reader (the router, or an output worker).
//! Three slots are the minimum that lets each side hold one slot privately
//! while a third carries the in-flight hand-off, so neither side ever blocks
//! the other. If the writer outruns the reader, intermediate frames are
//! dropped and the reader always lands on the latest completed frame; if the
//! reader outruns the writer, it re-reads the last frame.
//!
//! The four position markers are slot *indices* (0–2), never pointers, so
//! the record is position-independent and each process resolves a slot
//! address from its own view of the mapping.

use std::cell::UnsafeCell;
use std::sync::atomic::{fence, AtomicU32, AtomicU8, Ordering};
use std::time::{Duration, Instant};

use crate::frame::Frame;

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;

/// Busy-spin iterations before falling back to yielding.
const SPIN_LIMIT: u32 = 4096;

/// How long a contended acquire waits before deciding the holder is dead.
///
/// Marker rotation is four byte stores; a live holder is gone in well under
/// a microsecond. A peer that crashed while holding the lock must not stall
/// the compositor tick, so after this budget the lock is reclaimed.
const RECLAIM_AFTER: Duration = Duration::from_millis(50);

/// Process-shared lock word guarding marker rotation.
///
/// A plain atomic spin lock with a bounded acquire path standing in for a
/// robust mutex: the critical sections it guards are a handful of relaxed
/// byte stores, so any wait longer than [`RECLAIM_AFTER`] means the holder
/// died mid-rotation and the lock is taken over by force. The marker state
/// is re-validated after every rotation, so a torn rotation from a dead
/// peer is caught rather than propagated.
#[repr(C)]
struct RegionLock {
    word: AtomicU32,
}

struct RegionLockGuard<'a> {
    lock: &'a RegionLock,
}

impl RegionLock {
    fn try_acquire(&self) -> bool {
        self.word
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    fn acquire(&self) -> RegionLockGuard<'_> {
        for _ in 0..SPIN_LIMIT {
            if self.try_acquire() {
                return RegionLockGuard { lock: self };
            }
            std::hint::spin_loop();
        }
        let deadline = Instant::now() + RECLAIM_AFTER;
        while Instant::now() < deadline {
            if self.try_acquire() {
                return RegionLockGuard { lock: self };
            }
            std::thread::yield_now();
        }
        // Stale holder: the owning process died inside a rotation. Take the
        // lock over; the caller's rotation re-establishes a consistent
        // marker state or aborts on the post-rotation check.
        tracing::warn!("reclaiming shared-region lock from dead peer");
        self.word.swap(LOCKED, Ordering::AcqRel);
        RegionLockGuard { lock: self }
    }
}

impl Drop for RegionLockGuard<'_> {
    fn drop(&mut self) {
        self.lock.word.store(UNLOCKED, Ordering::Release);
    }
}

/// Three frame slots plus the four rotation markers, in shared memory.
///
/// At all times the markers cover exactly three distinct slots (one slot is
/// referenced twice: the freshly written frame pending hand-off, or the
/// currently read one when the reader has caught up), and the writer's and
/// reader's current slots are never the same. Violation of either property
/// means the region has been corrupted and aborts the process.
///
/// The slot accessors are `unsafe`: the caller warrants that this process
/// is the region's only writer (for [`write`](Self::write)) or only reader
/// (for [`read`](Self::read)). The device and link types in this crate wrap
/// them so each process can only ever drive one side.
#[repr(C)]
pub struct TripleBuffer {
    lock: RegionLock,
    read_current: AtomicU8,
    read_next: AtomicU8,
    write_current: AtomicU8,
    write_next: AtomicU8,
    slots: [UnsafeCell<Frame>; 3],
}

// The whole point of the type is cross-thread (and cross-process) sharing;
// slot aliasing is excluded by the marker invariants plus the single-writer/
// single-reader contract on the unsafe accessors.
unsafe impl Send for TripleBuffer {}
unsafe impl Sync for TripleBuffer {}

impl TripleBuffer {
    /// Initialise an already-zeroed allocation as a `TripleBuffer`.
    ///
    /// # Safety
    ///
    /// `mem` must point to at least `size_of::<TripleBuffer>()` zeroed,
    /// suitably aligned, writable bytes that outlive the returned reference.
    pub(crate) unsafe fn init<'a>(mem: *mut u8) -> &'a TripleBuffer {
        let buf = &*(mem as *const TripleBuffer);
        buf.lock.word.store(UNLOCKED, Ordering::Relaxed);
        buf.read_current.store(0, Ordering::Relaxed);
        buf.read_next.store(0, Ordering::Relaxed);
        buf.write_current.store(1, Ordering::Relaxed);
        buf.write_next.store(2, Ordering::Relaxed);
        fence(Ordering::SeqCst);
        buf
    }

    /// Reinterpret a mapped region as an already-constructed `TripleBuffer`.
    ///
    /// # Safety
    ///
    /// `mem` must point to at least `size_of::<TripleBuffer>()` bytes that
    /// were initialised by [`init`](Self::init) (in any process) and that
    /// outlive the returned reference.
    pub(crate) unsafe fn from_raw<'a>(mem: *mut u8) -> &'a TripleBuffer {
        &*(mem as *const TripleBuffer)
    }

    /// Whether a frame newer than the last one read has been published.
    pub fn has_new(&self) -> bool {
        fence(Ordering::SeqCst);
        self.read_current.load(Ordering::Relaxed) != self.read_next.load(Ordering::Relaxed)
    }

    /// Advance the reader to the most recently published frame, if any.
    ///
    /// Non-blocking. When nothing new was published the read slot is
    /// unchanged and a subsequent [`read`](Self::read) re-reads the last
    /// frame.
    pub fn about_to_read(&self) {
        let _guard = self.lock.acquire();
        let read_current = self.read_current.load(Ordering::Relaxed);
        let read_next = self.read_next.load(Ordering::Relaxed);
        if read_current != read_next {
            self.write_next.store(read_current, Ordering::Relaxed);
        }
        self.read_current.store(read_next, Ordering::Relaxed);
        fence(Ordering::SeqCst);
        self.check_markers();
    }

    /// Publish the frame written into the current write slot.
    ///
    /// Rotates `read_next` onto the finished slot and swaps in a free write
    /// slot. Holds the region lock only for the marker updates, never for
    /// the frame bytes.
    pub fn done_writing(&self) {
        let _guard = self.lock.acquire();
        fence(Ordering::SeqCst);
        let write_current = self.write_current.load(Ordering::Relaxed);
        let write_next = self.write_next.load(Ordering::Relaxed);
        self.read_next.store(write_current, Ordering::Relaxed);
        self.write_current.store(write_next, Ordering::Relaxed);
        self.write_next.store(write_current, Ordering::Relaxed);
        self.check_markers();
    }

    /// The writer's current slot.
    ///
    /// # Safety
    ///
    /// This process must be the region's only writer, and the returned
    /// reference must not outlive the next [`done_writing`](Self::done_writing).
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn write(&self) -> &mut Frame {
        &mut *self.slot(self.write_current.load(Ordering::Relaxed))
    }

    /// The reader's current slot.
    ///
    /// # Safety
    ///
    /// This process must be the region's only reader, and the returned
    /// reference must not outlive the next [`about_to_read`](Self::about_to_read).
    pub unsafe fn read(&self) -> &Frame {
        &*self.slot(self.read_current.load(Ordering::Relaxed))
    }

    fn slot(&self, index: u8) -> *mut Frame {
        match self.slots.get(index as usize) {
            Some(slot) => slot.get(),
            None => die("slot marker out of range"),
        }
    }

    /// Abort on a broken marker set: the four markers must cover exactly
    /// three distinct slots and the writer and reader must hold different
    /// slots. Anything else is memory corruption, not a recoverable error.
    fn check_markers(&self) {
        let markers = [
            self.read_current.load(Ordering::Relaxed),
            self.read_next.load(Ordering::Relaxed),
            self.write_current.load(Ordering::Relaxed),
            self.write_next.load(Ordering::Relaxed),
        ];
        let mut seen = [false; 3];
        for &m in &markers {
            match seen.get_mut(m as usize) {
                Some(s) => *s = true,
                None => die("slot marker out of range"),
            }
        }
        if !(seen.iter().all(|&s| s) && markers[0] != markers[2]) {
            die("triple-buffer marker invariant violated");
        }
    }

    #[cfg(test)]
    pub(crate) fn markers(&self) -> [u8; 4] {
        [
            self.read_current.load(Ordering::Relaxed),
            self.read_next.load(Ordering::Relaxed),
            self.write_current.load(Ordering::Relaxed),
            self.write_next.load(Ordering::Relaxed),
        ]
    }

    #[cfg(test)]
    pub(crate) fn new_boxed() -> Box<TripleBuffer> {
        let layout = std::alloc::Layout::new::<TripleBuffer>();
        unsafe {
            let ptr = std::alloc::alloc_zeroed(layout);
            if ptr.is_null() {
                std::alloc::handle_alloc_error(layout);
            }
            TripleBuffer::init(ptr);
            Box::from_raw(ptr as *mut TripleBuffer)
        }
    }

    #[cfg(test)]
    pub(crate) fn poison_lock(&self) {
        std::mem::forget(self.lock.acquire());
    }
}

fn die(reason: &str) -> ! {
    tracing::error!(reason, "shared region corrupted, aborting");
    std::process::abort()
}
