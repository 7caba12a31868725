//! Physical memory allocator, for user processes, page-table pages,
//! and trap-frame pages. Allocates whole 4096-byte frames.
//!
//! The free list is threaded through the free frames themselves; a
//! parallel array carries the per-frame reference counts that make
//! copy-on-write sharing possible. One lock guards both: every stored
//! mapping of a frame must be matched by exactly one `incref`, every
//! unmap by exactly one `decref`, and a frame whose count reaches zero
//! goes back on the free list.

use num_iter::range_step;

use crate::addr::{PAddr, PGSIZE};
use crate::hal::Ram;
use crate::lock::Spinlock;

/// Frames are filled with this on free, to catch dangling references.
const FREE_POISON: u8 = 1;
/// And with this on allocation, to catch reads of uninitialized memory.
const ALLOC_POISON: u8 = 5;

/// Quiescent-state counters for the conservation invariant:
/// `free + live` frames account for every usable frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KmemStats {
    /// Frames on the free list.
    pub free: usize,
    /// Sum of the reference counts of allocated frames.
    pub live_refs: usize,
    /// Frames currently allocated (refcount > 0).
    pub live: usize,
    /// Total frames managed by the allocator.
    pub total: usize,
}

pub struct Kmem {
    ram: Ram,
    /// Head of the free list, or `PAddr::NULL`. The first word of each
    /// free frame holds the address of the next.
    head: PAddr,
    /// First usable frame (everything below stands in for the kernel
    /// image).
    base: usize,
    /// One past the last usable byte.
    limit: usize,
    nfree: usize,
    refcount: Vec<u32>,
}

impl Kmem {
    /// Builds the allocator over every frame of `ram` above the kernel
    /// image and puts them all on the free list.
    pub fn new(ram: Ram) -> Kmem {
        let base = PGSIZE;
        let limit = ram.size();
        let mut kmem = Kmem {
            ram,
            head: PAddr::NULL,
            base,
            limit,
            nfree: 0,
            refcount: vec![0; limit / PGSIZE],
        };
        for pa in range_step(base, limit, PGSIZE) {
            kmem.free(PAddr::new(pa));
        }
        kmem
    }

    fn frame_index(&self, pa: PAddr) -> usize {
        pa.value() / PGSIZE
    }

    fn check_frame(&self, pa: PAddr, what: &str) {
        if pa.value() % PGSIZE != 0 || pa.value() < self.base || pa.value() >= self.limit {
            panic!("{}: bad frame {:#x}", what, pa.value());
        }
    }

    /// Allocate one frame, filled with poison, refcount 1.
    pub fn alloc(&mut self) -> Option<PAddr> {
        if self.head.is_null() {
            return None;
        }
        let pa = self.head;
        // SAFETY: frames on the free list are owned by the allocator.
        unsafe {
            let frame = self.ram.frame_mut(pa);
            self.head = PAddr::new(usize::from_ne_bytes(frame[..8].try_into().unwrap()));
            frame.fill(ALLOC_POISON);
        }
        let idx = self.frame_index(pa);
        debug_assert_eq!(self.refcount[idx], 0, "alloc: frame in use");
        self.refcount[idx] = 1;
        self.nfree -= 1;
        Some(pa)
    }

    /// Free the frame at `pa`, which normally should have been returned
    /// by a call to `alloc`. Freeing a frame someone still references
    /// is fatal.
    pub fn free(&mut self, pa: PAddr) {
        self.check_frame(pa, "kfree");
        let idx = self.frame_index(pa);
        self.refcount[idx] = 0;
        // SAFETY: the frame is transitioning to the free list; no live
        // mapping may reference it (the refcount invariant).
        unsafe {
            let frame = self.ram.frame_mut(pa);
            frame.fill(FREE_POISON);
            frame[..8].copy_from_slice(&self.head.value().to_ne_bytes());
        }
        self.head = pa;
        self.nfree += 1;
    }

    /// Record one more live mapping of the frame.
    pub fn incref(&mut self, pa: PAddr) {
        self.check_frame(pa, "incref");
        let idx = self.frame_index(pa);
        assert!(self.refcount[idx] >= 1, "incref: free frame");
        self.refcount[idx] += 1;
    }

    /// Drop one mapping of the frame; frees it on the transition to
    /// zero and reports whether that happened.
    pub fn decref(&mut self, pa: PAddr) -> bool {
        self.check_frame(pa, "decref");
        let idx = self.frame_index(pa);
        if self.refcount[idx] < 1 {
            panic!("decref: refcount < 1");
        }
        self.refcount[idx] -= 1;
        if self.refcount[idx] == 0 {
            self.free(pa);
            return true;
        }
        false
    }

    pub fn refcount(&self, pa: PAddr) -> u32 {
        self.check_frame(pa, "refcount");
        self.refcount[self.frame_index(pa)]
    }

    pub fn stats(&self) -> KmemStats {
        let mut live = 0;
        let mut live_refs = 0;
        for idx in self.base / PGSIZE..self.limit / PGSIZE {
            if self.refcount[idx] > 0 {
                live += 1;
                live_refs += self.refcount[idx] as usize;
            }
        }
        KmemStats {
            free: self.nfree,
            live_refs,
            live,
            total: (self.limit - self.base) / PGSIZE,
        }
    }
}

/// The memory subsystem: the RAM arena plus the locked allocator.
pub struct Mm {
    pub ram: Ram,
    pub kmem: Spinlock<Kmem>,
}

impl Mm {
    pub fn new(ram: Ram) -> Mm {
        Mm {
            ram,
            kmem: Spinlock::new("kmem", Kmem::new(ram)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_mm() -> &'static Mm {
        Box::leak(Box::new(Mm::new(Ram::new(16))))
    }

    #[test]
    fn conservation_over_alloc_free() {
        let mm = small_mm();
        let mut kmem = mm.kmem.lock();
        let total = kmem.stats().total;
        assert_eq!(kmem.stats().free, total);

        let a = kmem.alloc().unwrap();
        let b = kmem.alloc().unwrap();
        assert_ne!(a, b);
        let st = kmem.stats();
        assert_eq!(st.free + st.live, total);
        assert_eq!(st.live_refs, 2);

        kmem.incref(a);
        assert_eq!(kmem.refcount(a), 2);
        assert!(!kmem.decref(a));
        assert!(kmem.decref(a));
        kmem.free(b);
        let st = kmem.stats();
        assert_eq!(st.free, total);
        assert_eq!(st.live_refs, 0);
    }

    #[test]
    fn alloc_poisons_and_free_poisons() {
        let mm = small_mm();
        let mut kmem = mm.kmem.lock();
        let pa = kmem.alloc().unwrap();
        // SAFETY: we own the frame we just allocated.
        let frame = unsafe { mm.ram.frame_mut(pa) };
        assert!(frame.iter().all(|&b| b == ALLOC_POISON));
        frame.fill(0xAA);
        kmem.free(pa);
        // SAFETY: the test is single threaded; nothing else touches it.
        let frame = unsafe { mm.ram.frame_mut(pa) };
        assert!(frame[8..].iter().all(|&b| b == FREE_POISON));
    }

    #[test]
    fn exhaustion_returns_none() {
        let mm = small_mm();
        let mut kmem = mm.kmem.lock();
        let mut held = Vec::new();
        while let Some(pa) = kmem.alloc() {
            held.push(pa);
        }
        assert_eq!(held.len(), kmem.stats().total);
        assert!(kmem.alloc().is_none());
        for pa in held {
            kmem.free(pa);
        }
    }

    #[test]
    #[should_panic(expected = "decref")]
    fn decref_of_free_frame_panics() {
        let mm = small_mm();
        let mut kmem = mm.kmem.lock();
        let pa = kmem.alloc().unwrap();
        kmem.free(pa);
        let _ = kmem.decref(pa);
    }

    #[test]
    #[should_panic(expected = "kfree")]
    fn free_unaligned_panics() {
        let mm = small_mm();
        let mut kmem = mm.kmem.lock();
        kmem.free(PAddr::new(PGSIZE + 1));
    }
}
