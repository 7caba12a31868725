/// Maximum number of processes.
pub const NPROC: usize = 64;

/// Maximum number of CPUs.
pub const NCPU: usize = 8;

/// Open files per process.
pub const NOFILE: usize = 16;

/// Open files per system.
pub const NFILE: usize = 100;

/// Maximum number of active i-nodes.
pub const NINODE: usize = 50;

/// Maximum major device number.
pub const NDEV: usize = 10;

/// Device number of file system root disk.
pub const ROOTDEV: u32 = 1;

/// Max exec arguments.
pub const MAXARG: usize = 32;

/// Block size.
pub const BSIZE: usize = 4096;

/// Max # of blocks any FS op writes.
pub const MAXOPBLOCKS: usize = 10;

/// Max data blocks in on-disk log.
pub const LOGSIZE: usize = MAXOPBLOCKS * 3;

/// Size of disk block cache.
pub const NBUF: usize = MAXOPBLOCKS * 3;

/// Maximum file path name.
pub const MAXPATH: usize = 128;

/// Maximum length of process name.
pub const MAXPROCNAME: usize = 16;

/// Pool sizes for the id-keyed synchronization primitives.
pub const NSEM: usize = 32;
pub const NMUTEX: usize = 32;
pub const NCOND: usize = 32;
pub const NRWLOCK: usize = 32;

/// Number of MLFQ levels. Level 0 is the highest priority.
pub const NMLFQ: usize = 5;

/// Default scheduling priority for a fresh process (range 0..=9).
pub const DEFAULT_PRIORITY: u8 = 5;
