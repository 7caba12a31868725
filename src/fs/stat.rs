use zerocopy::{AsBytes, FromBytes};

/// File metadata as returned by `fstat`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, AsBytes, FromBytes)]
pub struct Stat {
    /// Device the file lives on.
    pub dev: i32,
    /// Inode number.
    pub ino: u32,
    /// 0 free, 1 directory, 2 file, 3 device, 4 symlink.
    pub typ: i16,
    /// Number of hard links.
    pub nlink: i16,
    pub _pad: u32,
    /// Size in bytes.
    pub size: u64,
}

static_assertions::const_assert_eq!(core::mem::size_of::<Stat>(), 24);
