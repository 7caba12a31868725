//! Physical and user-virtual address newtypes.

/// Bytes per page and per frame.
pub const PGSIZE: usize = 4096;

/// Round up to the next page boundary.
pub const fn pg_round_up(addr: usize) -> usize {
    (addr + PGSIZE - 1) & !(PGSIZE - 1)
}

/// Round down to the current page boundary.
pub const fn pg_round_down(addr: usize) -> usize {
    addr & !(PGSIZE - 1)
}

pub const fn pg_aligned(addr: usize) -> bool {
    addr % PGSIZE == 0
}

/// A physical address: a byte offset into the machine's RAM arena.
/// Frame 0 stands in for the kernel image and is never handed out, so
/// a zero `PAddr` doubles as "no frame".
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct PAddr(usize);

impl PAddr {
    pub const NULL: PAddr = PAddr(0);

    pub const fn new(addr: usize) -> Self {
        PAddr(addr)
    }

    pub const fn value(self) -> usize {
        self.0
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// A user virtual address, meaningful only relative to some process's
/// page table.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct UVAddr(usize);

impl UVAddr {
    pub const fn new(addr: usize) -> Self {
        UVAddr(addr)
    }

    pub const fn value(self) -> usize {
        self.0
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl core::ops::Add<usize> for UVAddr {
    type Output = UVAddr;

    fn add(self, rhs: usize) -> UVAddr {
        UVAddr(self.0 + rhs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounding() {
        assert_eq!(pg_round_up(0), 0);
        assert_eq!(pg_round_up(1), PGSIZE);
        assert_eq!(pg_round_up(PGSIZE), PGSIZE);
        assert_eq!(pg_round_down(PGSIZE + 7), PGSIZE);
        assert!(pg_aligned(2 * PGSIZE));
        assert!(!pg_aligned(PGSIZE + 1));
    }
}
