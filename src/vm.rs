//! User address spaces.
//!
//! A `UserMemory` owns an Sv39-shaped three-level page table whose
//! page-table pages live in frames, exactly like the hardware tables it
//! models. The walker, the copy-on-write fault handler and the lazy
//! sbrk fill are all here; the trap layer routes user faults to them,
//! and the kernel copy routines resolve faults inline the way the
//! hardware paths do.
//!
//! Every page-table entry holds a frame number plus flag bits,
//! including the software COW tag. A live leaf mapping always accounts
//! for exactly one reference on its frame.

use core::ptr;

use bitflags::bitflags;

use crate::addr::{pg_round_down, pg_round_up, PAddr, UVAddr, PGSIZE};
use crate::errno::KernelError;
use crate::kalloc::Mm;

bitflags! {
    /// PTE permission and tag bits.
    pub struct PteFlags: u64 {
        /// Valid.
        const V = 1 << 0;
        /// Readable.
        const R = 1 << 1;
        /// Writable.
        const W = 1 << 2;
        /// Executable.
        const X = 1 << 3;
        /// User-accessible.
        const U = 1 << 4;
        /// Copy-on-write mapping (software tag).
        const COW = 1 << 8;
    }
}

/// One beyond the largest user virtual address. As on Sv39, one bit
/// short of the architectural maximum.
pub const MAXVA: usize = 1 << 38;

/// Shared read-only page mapped at the top of every address space.
pub const TRAMPOLINE: usize = MAXVA - PGSIZE;

/// Per-process page holding the user register file, just under the
/// trampoline.
pub const TRAPFRAME: usize = TRAMPOLINE - PGSIZE;

/// PTEs per page-table page.
const NPTE: usize = PGSIZE / 8;

const fn px(level: usize, va: usize) -> usize {
    (va >> (12 + 9 * level)) & (NPTE - 1)
}

const fn pte_new(pa: PAddr, flags: PteFlags) -> u64 {
    ((pa.value() as u64 >> 12) << 10) | flags.bits()
}

const fn pte_pa(pte: u64) -> PAddr {
    PAddr::new(((pte >> 10) << 12) as usize)
}

fn pte_flags(pte: u64) -> PteFlags {
    PteFlags::from_bits_truncate(pte)
}

/// A user address space: the root page table plus the logical size of
/// the user region. `size` may run ahead of the mapped region when the
/// process grew lazily; the first touch faults the page in.
pub struct UserMemory {
    mm: &'static Mm,
    page_table: PAddr,
    size: usize,
}

impl UserMemory {
    /// An empty address space holding only the trampoline and the given
    /// trap-frame page.
    pub fn new(mm: &'static Mm, trampoline: PAddr, trap_frame: PAddr) -> Result<Self, KernelError> {
        let page_table = alloc_zeroed(mm).ok_or(KernelError::NoMemory)?;
        let mut memory = UserMemory {
            mm,
            page_table,
            size: 0,
        };
        let tramp = PteFlags::R | PteFlags::X;
        let tf = PteFlags::R | PteFlags::W;
        if memory.map_page(TRAMPOLINE, trampoline, tramp).is_err()
            || memory.map_page(TRAPFRAME, trap_frame, tf).is_err()
        {
            // Drop unwinds whatever was mapped.
            return Err(KernelError::NoMemory);
        }
        Ok(memory)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Grow the logical size without mapping anything; the pages
    /// materialize on first touch.
    pub fn lazy_grow(&mut self, n: usize) -> usize {
        self.size += n;
        self.size
    }

    /// The PTE for `va`, allocating intermediate table pages if asked.
    fn walk(&self, va: usize, alloc: bool) -> Option<*mut u64> {
        assert!(va < MAXVA, "walk");
        let mut table = self.page_table;
        for level in [2, 1] {
            let slot = self.pte_slot(table, px(level, va));
            // SAFETY: `slot` points into a page-table page this address
            // space owns; table pages are only touched through &mut
            // self or during construction.
            let pte = unsafe { *slot };
            if pte_flags(pte).contains(PteFlags::V) {
                table = pte_pa(pte);
            } else {
                if !alloc {
                    return None;
                }
                let new = alloc_zeroed(self.mm)?;
                // SAFETY: as above.
                unsafe { *slot = pte_new(new, PteFlags::V) };
                table = new;
            }
        }
        Some(self.pte_slot(table, px(0, va)))
    }

    fn pte_slot(&self, table: PAddr, idx: usize) -> *mut u64 {
        // SAFETY: `table` is a page-table page owned by this address
        // space; the index is in range by construction of `px`.
        unsafe { (self.mm.ram.ptr(table) as *mut u64).add(idx) }
    }

    /// Install a mapping for the page at `va`. Remapping is fatal.
    pub fn map_page(&mut self, va: usize, pa: PAddr, perm: PteFlags) -> Result<(), KernelError> {
        assert!(va % PGSIZE == 0, "map_page: va not aligned");
        let slot = self.walk(va, true).ok_or(KernelError::NoMemory)?;
        // SAFETY: slot comes from our own walk.
        unsafe {
            assert!(!pte_flags(*slot).contains(PteFlags::V), "mappages: remap");
            *slot = pte_new(pa, perm | PteFlags::V);
        }
        Ok(())
    }

    /// Remove up to `npages` mappings starting at `va`. Holes are
    /// tolerated (lazily grown regions may never have been touched).
    /// With `free`, each unmapped frame loses one reference.
    fn unmap_range(&mut self, va: usize, npages: usize, free: bool) {
        assert!(va % PGSIZE == 0, "unmap_range");
        for page in 0..npages {
            let addr = va + page * PGSIZE;
            let Some(slot) = self.walk(addr, false) else {
                continue;
            };
            // SAFETY: slot comes from our own walk.
            let pte = unsafe { *slot };
            if !pte_flags(pte).contains(PteFlags::V) {
                continue;
            }
            assert!(
                pte_flags(pte).intersects(PteFlags::R | PteFlags::W | PteFlags::X),
                "unmap_range: not a leaf"
            );
            if free {
                let _ = self.mm.kmem.lock().decref(pte_pa(pte));
            }
            // SAFETY: as above.
            unsafe { *slot = 0 };
        }
    }

    /// Grow the user region to `new_size`, allocating and mapping
    /// eagerly. On failure the region is left at its old size.
    pub fn alloc(&mut self, new_size: usize) -> Result<usize, KernelError> {
        if new_size <= self.size {
            return Ok(self.size);
        }
        let old_size = self.size;
        let mut va = pg_round_up(old_size);
        while va < new_size {
            let pa = match self.mm.kmem.lock().alloc() {
                Some(pa) => pa,
                None => {
                    self.size = va;
                    self.dealloc(old_size);
                    return Err(KernelError::NoMemory);
                }
            };
            // SAFETY: we own the fresh frame.
            unsafe { self.mm.ram.frame_mut(pa).fill(0) };
            let perm = PteFlags::R | PteFlags::W | PteFlags::U;
            if self.map_page(va, pa, perm).is_err() {
                self.mm.kmem.lock().free(pa);
                self.size = va;
                self.dealloc(old_size);
                return Err(KernelError::NoMemory);
            }
            va += PGSIZE;
        }
        self.size = new_size;
        Ok(self.size)
    }

    /// Shrink the user region to `new_size`, releasing the frames.
    pub fn dealloc(&mut self, new_size: usize) -> usize {
        if new_size >= self.size {
            return self.size;
        }
        let first = pg_round_up(new_size);
        let last = pg_round_up(self.size);
        if first < last {
            self.unmap_range(first, (last - first) / PGSIZE, true);
        }
        self.size = new_size;
        self.size
    }

    /// Duplicate this address space for a forked child: every mapped
    /// page is shared, writable pages become read-only COW in both
    /// tables, and each shared frame gains a reference.
    pub fn clone_cow(
        &mut self,
        trampoline: PAddr,
        child_trap_frame: PAddr,
    ) -> Result<UserMemory, KernelError> {
        let mut child = UserMemory::new(self.mm, trampoline, child_trap_frame)?;
        let mut va = 0;
        while va < self.size {
            if let Some(slot) = self.walk(va, false) {
                // SAFETY: slot comes from our own walk.
                let pte = unsafe { *slot };
                let mut flags = pte_flags(pte);
                if flags.contains(PteFlags::V) {
                    let pa = pte_pa(pte);
                    if flags.contains(PteFlags::W) {
                        flags.remove(PteFlags::W);
                        flags.insert(PteFlags::COW);
                        // SAFETY: as above.
                        unsafe { *slot = pte_new(pa, flags) };
                    }
                    self.mm.kmem.lock().incref(pa);
                    if child.map_page(va, pa, flags & !PteFlags::V).is_err() {
                        let _ = self.mm.kmem.lock().decref(pa);
                        return Err(KernelError::NoMemory);
                    }
                }
            }
            va += PGSIZE;
        }
        child.size = self.size;
        Ok(child)
    }

    /// The copy-on-write write-fault handler. Returns Err for a fault
    /// that is not a COW write, which is fatal to the process.
    pub fn cow_fault(&mut self, va: usize) -> Result<(), KernelError> {
        if va >= MAXVA {
            return Err(KernelError::Invalid);
        }
        let slot = self.walk(pg_round_down(va), false).ok_or(KernelError::Invalid)?;
        // SAFETY: slot comes from our own walk.
        let pte = unsafe { *slot };
        let mut flags = pte_flags(pte);
        if !flags.contains(PteFlags::V | PteFlags::U | PteFlags::COW) {
            return Err(KernelError::Invalid);
        }
        let old = pte_pa(pte);
        flags.remove(PteFlags::COW);
        flags.insert(PteFlags::W);
        let mut kmem = self.mm.kmem.lock();
        if kmem.refcount(old) == 1 {
            // Sole owner: upgrade the mapping in place.
            // SAFETY: as above.
            unsafe { *slot = pte_new(old, flags) };
            return Ok(());
        }
        let new = kmem.alloc().ok_or(KernelError::NoMemory)?;
        // SAFETY: `new` is exclusively ours; `old` is readable and
        // cannot be freed while we hold a reference to it.
        unsafe {
            ptr::copy_nonoverlapping(self.mm.ram.ptr(old), self.mm.ram.ptr(new), PGSIZE);
            *slot = pte_new(new, flags);
        }
        let _ = kmem.decref(old);
        // The simulated MMU has no TLB to flush.
        Ok(())
    }

    /// Fill in one lazily grown page. Err when `va` is outside the
    /// logical user region or the page is already mapped.
    pub fn lazy_fault(&mut self, va: usize) -> Result<(), KernelError> {
        if va >= self.size {
            return Err(KernelError::Invalid);
        }
        let base = pg_round_down(va);
        if let Some(slot) = self.walk(base, false) {
            // SAFETY: slot comes from our own walk.
            if pte_flags(unsafe { *slot }).contains(PteFlags::V) {
                return Err(KernelError::Invalid);
            }
        }
        let pa = self.mm.kmem.lock().alloc().ok_or(KernelError::NoMemory)?;
        // SAFETY: we own the fresh frame.
        unsafe { self.mm.ram.frame_mut(pa).fill(0) };
        let perm = PteFlags::R | PteFlags::W | PteFlags::U;
        if self.map_page(base, pa, perm).is_err() {
            self.mm.kmem.lock().free(pa);
            return Err(KernelError::NoMemory);
        }
        Ok(())
    }

    /// Physical address of the user page holding `va`, for a write
    /// access: resolves COW and lazy faults inline, like the hardware
    /// fault path the kernel copy routines ride on.
    fn resolve_write(&mut self, va: usize) -> Result<PAddr, KernelError> {
        let base = pg_round_down(va);
        for _ in 0..2 {
            match self.walk(base, false) {
                // SAFETY: slot comes from our own walk.
                Some(slot) => {
                    let pte = unsafe { *slot };
                    let flags = pte_flags(pte);
                    if !flags.contains(PteFlags::V) {
                        self.lazy_fault(base)?;
                        continue;
                    }
                    if !flags.contains(PteFlags::U) {
                        return Err(KernelError::Invalid);
                    }
                    if flags.contains(PteFlags::W) {
                        return Ok(pte_pa(pte));
                    }
                    if flags.contains(PteFlags::COW) {
                        self.cow_fault(base)?;
                        continue;
                    }
                    return Err(KernelError::Invalid);
                }
                None => {
                    self.lazy_fault(base)?;
                }
            }
        }
        // Two rounds of fault service always suffice.
        panic!("resolve_write: fault loop");
    }

    /// Physical address of the user page holding `va`, for a read.
    fn resolve_read(&mut self, va: usize) -> Result<PAddr, KernelError> {
        let base = pg_round_down(va);
        for _ in 0..2 {
            match self.walk(base, false) {
                Some(slot) => {
                    // SAFETY: slot comes from our own walk.
                    let pte = unsafe { *slot };
                    let flags = pte_flags(pte);
                    if !flags.contains(PteFlags::V) {
                        self.lazy_fault(base)?;
                        continue;
                    }
                    if !flags.contains(PteFlags::U) || !flags.contains(PteFlags::R) {
                        return Err(KernelError::Invalid);
                    }
                    return Ok(pte_pa(pte));
                }
                None => {
                    self.lazy_fault(base)?;
                }
            }
        }
        panic!("resolve_read: fault loop");
    }

    /// Copy from kernel memory into user memory at `dst`.
    pub fn copy_out(&mut self, dst: UVAddr, src: &[u8]) -> Result<(), KernelError> {
        let mut va = dst.value();
        let mut copied = 0;
        while copied < src.len() {
            let pa = self.resolve_write(va)?;
            let off = va % PGSIZE;
            let n = usize::min(PGSIZE - off, src.len() - copied);
            // SAFETY: `pa` is a resolved, writable user frame; `off+n`
            // stays inside it.
            unsafe {
                ptr::copy_nonoverlapping(
                    src.as_ptr().add(copied),
                    self.mm.ram.ptr(pa).add(off),
                    n,
                );
            }
            copied += n;
            va += n;
        }
        Ok(())
    }

    /// Copy from user memory at `src` into kernel memory.
    pub fn copy_in(&mut self, dst: &mut [u8], src: UVAddr) -> Result<(), KernelError> {
        let mut va = src.value();
        let mut copied = 0;
        while copied < dst.len() {
            let pa = self.resolve_read(va)?;
            let off = va % PGSIZE;
            let n = usize::min(PGSIZE - off, dst.len() - copied);
            // SAFETY: `pa` is a resolved readable user frame.
            unsafe {
                ptr::copy_nonoverlapping(
                    self.mm.ram.ptr(pa).add(off),
                    dst.as_mut_ptr().add(copied),
                    n,
                );
            }
            copied += n;
            va += n;
        }
        Ok(())
    }

    /// Copy a NUL-terminated string from user memory into `dst`.
    /// Returns its length, without the terminator.
    pub fn copy_in_str(&mut self, dst: &mut [u8], src: UVAddr) -> Result<usize, KernelError> {
        let mut va = src.value();
        let mut copied = 0;
        loop {
            let pa = self.resolve_read(va)?;
            let off = va % PGSIZE;
            let avail = PGSIZE - off;
            for i in 0..avail {
                // SAFETY: inside the resolved frame.
                let b = unsafe { *self.mm.ram.ptr(pa).add(off + i) };
                if b == 0 {
                    return Ok(copied);
                }
                if copied >= dst.len() {
                    return Err(KernelError::NameTooLong);
                }
                dst[copied] = b;
                copied += 1;
            }
            va += avail;
        }
    }
}

impl Drop for UserMemory {
    fn drop(&mut self) {
        let pages = pg_round_up(self.size) / PGSIZE;
        self.unmap_range(0, pages, true);
        // The trampoline is shared and the trap-frame page is owned by
        // the process, so neither loses a reference here.
        self.unmap_range(TRAMPOLINE, 1, false);
        self.unmap_range(TRAPFRAME, 1, false);
        free_walk(self.mm, self.page_table);
    }
}

fn alloc_zeroed(mm: &Mm) -> Option<PAddr> {
    let pa = mm.kmem.lock().alloc()?;
    // SAFETY: we own the fresh frame.
    unsafe { mm.ram.frame_mut(pa).fill(0) };
    Some(pa)
}

/// Free a page-table page and all its descendants. Leaf mappings must
/// already have been removed.
fn free_walk(mm: &Mm, table: PAddr) {
    for idx in 0..NPTE {
        // SAFETY: the table page belongs to the address space being
        // torn down; nothing else references it.
        let pte = unsafe { *(mm.ram.ptr(table) as *const u64).add(idx) };
        let flags = pte_flags(pte);
        if flags.contains(PteFlags::V) {
            assert!(
                !flags.intersects(PteFlags::R | PteFlags::W | PteFlags::X),
                "freewalk: leaf"
            );
            free_walk(mm, pte_pa(pte));
        }
    }
    mm.kmem.lock().free(table);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::Ram;

    fn mm() -> &'static Mm {
        Box::leak(Box::new(Mm::new(Ram::new(256))))
    }

    fn scratch_frame(mm: &Mm) -> PAddr {
        let pa = mm.kmem.lock().alloc().unwrap();
        // SAFETY: we own the fresh frame.
        unsafe { mm.ram.frame_mut(pa).fill(0) };
        pa
    }

    fn fresh(mm: &'static Mm) -> (UserMemory, PAddr, PAddr) {
        let tramp = scratch_frame(mm);
        let tf = scratch_frame(mm);
        (UserMemory::new(mm, tramp, tf).unwrap(), tramp, tf)
    }

    #[test]
    fn grow_copy_roundtrip() {
        let mm = mm();
        let (mut m, ..) = fresh(mm);
        m.alloc(3 * PGSIZE).unwrap();
        let msg = b"hello, address space";
        m.copy_out(UVAddr::new(PGSIZE + 100), msg).unwrap();
        let mut back = [0u8; 20];
        m.copy_in(&mut back, UVAddr::new(PGSIZE + 100)).unwrap();
        assert_eq!(&back, msg);
    }

    #[test]
    fn copy_spans_pages() {
        let mm = mm();
        let (mut m, ..) = fresh(mm);
        m.alloc(2 * PGSIZE).unwrap();
        let data: Vec<u8> = (0..300u32).map(|i| i as u8).collect();
        m.copy_out(UVAddr::new(PGSIZE - 150), &data).unwrap();
        let mut back = vec![0u8; 300];
        m.copy_in(&mut back, UVAddr::new(PGSIZE - 150)).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn lazy_pages_fault_in_zeroed() {
        let mm = mm();
        let (mut m, ..) = fresh(mm);
        m.lazy_grow(4 * PGSIZE);
        assert_eq!(m.size(), 4 * PGSIZE);
        let mut buf = [0xFFu8; 16];
        m.copy_in(&mut buf, UVAddr::new(2 * PGSIZE + 8)).unwrap();
        assert_eq!(buf, [0u8; 16]);
        m.copy_out(UVAddr::new(3 * PGSIZE), b"lazy").unwrap();
        let mut back = [0u8; 4];
        m.copy_in(&mut back, UVAddr::new(3 * PGSIZE)).unwrap();
        assert_eq!(&back, b"lazy");
    }

    #[test]
    fn out_of_range_access_fails() {
        let mm = mm();
        let (mut m, ..) = fresh(mm);
        m.alloc(PGSIZE).unwrap();
        assert!(m.copy_out(UVAddr::new(5 * PGSIZE), b"x").is_err());
        let mut b = [0u8; 1];
        assert!(m.copy_in(&mut b, UVAddr::new(5 * PGSIZE)).is_err());
    }

    #[test]
    fn cow_isolates_parent_and_child() {
        let mm = mm();
        let (mut parent, tramp, _) = fresh(mm);
        parent.alloc(2 * PGSIZE).unwrap();
        parent.copy_out(UVAddr::new(64), &42u64.to_ne_bytes()).unwrap();

        let child_tf = scratch_frame(mm);
        let mut child = parent.clone_cow(tramp, child_tf).unwrap();
        assert_eq!(child.size(), parent.size());

        // The shared frame now carries both mappings.
        let pa = parent.resolve_read(64).unwrap();
        assert_eq!(mm.kmem.lock().refcount(pa), 2);

        let mut word = [0u8; 8];
        child.copy_in(&mut word, UVAddr::new(64)).unwrap();
        assert_eq!(u64::from_ne_bytes(word), 42);

        // Child write materializes a private frame.
        child.copy_out(UVAddr::new(64), &100u64.to_ne_bytes()).unwrap();
        child.copy_in(&mut word, UVAddr::new(64)).unwrap();
        assert_eq!(u64::from_ne_bytes(word), 100);
        parent.copy_in(&mut word, UVAddr::new(64)).unwrap();
        assert_eq!(u64::from_ne_bytes(word), 42);

        // Parent's page is back to a single owner and upgrades in
        // place on its next write.
        let pa = parent.resolve_read(64).unwrap();
        assert_eq!(mm.kmem.lock().refcount(pa), 1);
        parent.copy_out(UVAddr::new(64), &7u64.to_ne_bytes()).unwrap();
        child.copy_in(&mut word, UVAddr::new(64)).unwrap();
        assert_eq!(u64::from_ne_bytes(word), 100);
    }

    #[test]
    fn teardown_conserves_frames() {
        let mm = mm();
        let before = mm.kmem.lock().stats();
        let tramp = scratch_frame(mm);
        let tf = scratch_frame(mm);
        {
            let mut m = UserMemory::new(mm, tramp, tf).unwrap();
            m.alloc(6 * PGSIZE).unwrap();
            let tf2 = scratch_frame(mm);
            let child = m.clone_cow(tramp, tf2).unwrap();
            drop(child);
            mm.kmem.lock().free(tf2);
        }
        // The two scratch frames are still ours; everything else went
        // back to the free list.
        let mut kmem = mm.kmem.lock();
        kmem.free(tramp);
        kmem.free(tf);
        let after = kmem.stats();
        assert_eq!(before, after);
    }
}
