//! Path resolution.
//!
//! Paths are byte strings resolved component by component, starting
//! from the root for absolute paths and from the calling process's
//! working directory otherwise. A symbolic link met along the way is
//! spliced in front of the remaining components and the walk restarts,
//! up to a nesting bound; the final component is only followed for
//! callers that ask (open does, link/unlink/readlink do not).

use arrayvec::ArrayVec;

use crate::errno::KernelError;
use crate::fs::{InodeType, RcInode, DIRSIZ};
use crate::kernel::KernelCtx;
use crate::param::MAXPATH;

use super::FsTransaction;

/// Nested symbolic-link follows tolerated before giving up.
const MAX_SYMLINK_DEPTH: usize = 16;

/// One path component, truncated to DIRSIZ like the on-disk name.
pub type FileName = ArrayVec<u8, DIRSIZ>;

/// Split the next element from `path[pos..]`.
///
/// Returns the element's range and the position of the remainder, with
/// leading slashes skipped on both sides, or None when nothing is
/// left.
///
/// Examples:
///   skipelem("a/bb/c", 0) = ("a", 2)
///   skipelem("///a//bb", 0) = ("a", 6)
///   skipelem("a", 0) = ("a", 1)
///   skipelem("", 0) = skipelem("////", 0) = None
fn skipelem(path: &[u8], mut pos: usize) -> Option<(core::ops::Range<usize>, usize)> {
    while pos < path.len() && path[pos] == b'/' {
        pos += 1;
    }
    if pos == path.len() {
        return None;
    }
    let start = pos;
    while pos < path.len() && path[pos] != b'/' {
        pos += 1;
    }
    let end = pos;
    while pos < path.len() && path[pos] == b'/' {
        pos += 1;
    }
    Some((start..end, pos))
}

fn component(path: &[u8], range: core::ops::Range<usize>) -> FileName {
    let mut name = FileName::new();
    let bytes = &path[range];
    let n = usize::min(bytes.len(), DIRSIZ);
    name.try_extend_from_slice(&bytes[..n]).unwrap();
    name
}

enum NameMode {
    /// Resolve the whole path; follow a symlink in the final component
    /// only when asked.
    Find { follow_final: bool },
    /// Stop one level early, returning the parent directory and the
    /// final name.
    Parent,
}

fn namex(
    ctx: &KernelCtx,
    tx: &FsTransaction<'_>,
    path: &[u8],
    mode: NameMode,
) -> Result<(RcInode, Option<FileName>), KernelError> {
    let kernel = ctx.kernel();
    if path.is_empty() {
        return Err(KernelError::NoEntry);
    }
    if path.len() > MAXPATH {
        return Err(KernelError::NameTooLong);
    }

    let mut buf: ArrayVec<u8, MAXPATH> = ArrayVec::new();
    buf.try_extend_from_slice(path).unwrap();
    let mut depth = 0;

    'restart: loop {
        let mut pos = 0;
        let mut ip = if buf.first() == Some(&b'/') {
            kernel.fs.itable.root()
        } else {
            ctx.data().cwd.as_ref().expect("namex: no cwd").dup(kernel)
        };

        loop {
            let Some((range, rest)) = skipelem(&buf, pos) else {
                // Ran out of components.
                match mode {
                    NameMode::Parent => {
                        // e.g. "/" — there is no final name.
                        ip.put(tx, ctx);
                        return Err(KernelError::NoEntry);
                    }
                    NameMode::Find { .. } => return Ok((ip, None)),
                }
            };
            let name = component(&buf, range);
            let is_last = skipelem(&buf, rest).is_none();

            let mut guard = ip.lock(ctx);
            if guard.typ != InodeType::Dir {
                guard.free(ctx);
                ip.put(tx, ctx);
                return Err(KernelError::NotDirectory);
            }
            if is_last {
                if let NameMode::Parent = mode {
                    // Stop one level early.
                    guard.free(ctx);
                    return Ok((ip, Some(name)));
                }
            }
            let next = match guard.dirlookup(&name, ctx) {
                Ok((next, _off)) => next,
                Err(e) => {
                    guard.free(ctx);
                    ip.put(tx, ctx);
                    return Err(e);
                }
            };
            guard.free(ctx);
            ip.put(tx, ctx);

            // Follow symbolic links inline, except in the final
            // component when the caller wants the link itself.
            let follow = match mode {
                NameMode::Find { follow_final } => follow_final || !is_last,
                NameMode::Parent => !is_last,
            };
            if follow {
                let mut guard = next.lock(ctx);
                if guard.typ == InodeType::Symlink {
                    depth += 1;
                    if depth > MAX_SYMLINK_DEPTH {
                        guard.free(ctx);
                        next.put(tx, ctx);
                        return Err(KernelError::SymlinkLoop);
                    }
                    let size = guard.size as usize;
                    if size == 0 || size > MAXPATH {
                        guard.free(ctx);
                        next.put(tx, ctx);
                        return Err(KernelError::Invalid);
                    }
                    let mut target = [0u8; MAXPATH];
                    let read = guard.read_bytes_kernel(&mut target[..size], 0, ctx);
                    guard.free(ctx);
                    next.put(tx, ctx);
                    if read != size {
                        return Err(KernelError::Io);
                    }
                    if target[0] != b'/' {
                        // Relative targets are not resolved.
                        return Err(KernelError::Invalid);
                    }
                    // Splice: target, then whatever was left to walk.
                    let remainder: ArrayVec<u8, MAXPATH> =
                        buf[rest..].iter().copied().collect();
                    buf.clear();
                    buf.try_extend_from_slice(&target[..size])
                        .map_err(|_| KernelError::NameTooLong)?;
                    if !remainder.is_empty() {
                        buf.try_push(b'/').map_err(|_| KernelError::NameTooLong)?;
                        buf.try_extend_from_slice(&remainder)
                            .map_err(|_| KernelError::NameTooLong)?;
                    }
                    continue 'restart;
                }
                guard.free(ctx);
            }

            ip = next;
            pos = rest;
        }
    }
}

/// Look up the inode for a path, following symbolic links.
pub fn namei(
    ctx: &KernelCtx,
    tx: &FsTransaction<'_>,
    path: &[u8],
) -> Result<RcInode, KernelError> {
    namex(ctx, tx, path, NameMode::Find { follow_final: true }).map(|(ip, _)| ip)
}

/// Look up the inode for a path without following a symbolic link in
/// the final component.
pub fn namei_nofollow(
    ctx: &KernelCtx,
    tx: &FsTransaction<'_>,
    path: &[u8],
) -> Result<RcInode, KernelError> {
    namex(ctx, tx, path, NameMode::Find { follow_final: false }).map(|(ip, _)| ip)
}

/// Look up the parent directory of a path; also yields the final path
/// element.
pub fn nameiparent(
    ctx: &KernelCtx,
    tx: &FsTransaction<'_>,
    path: &[u8],
) -> Result<(RcInode, FileName), KernelError> {
    let (ip, name) = namex(ctx, tx, path, NameMode::Parent)?;
    let name = name.expect("nameiparent: no final component");
    Ok((ip, name))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn elems(path: &[u8]) -> Vec<(Vec<u8>, usize)> {
        let mut out = Vec::new();
        let mut pos = 0;
        while let Some((range, rest)) = skipelem(path, pos) {
            out.push((path[range].to_vec(), rest));
            pos = rest;
        }
        out
    }

    #[test]
    fn skipelem_examples() {
        assert_eq!(
            elems(b"a/bb/c"),
            vec![
                (b"a".to_vec(), 2),
                (b"bb".to_vec(), 5),
                (b"c".to_vec(), 6)
            ]
        );
        let got = elems(b"///a//bb");
        assert_eq!(got[0].0, b"a".to_vec());
        assert_eq!(got[1].0, b"bb".to_vec());
        assert_eq!(got.len(), 2);
        assert_eq!(elems(b"a"), vec![(b"a".to_vec(), 1)]);
        assert!(elems(b"").is_empty());
        assert!(elems(b"////").is_empty());
    }

    #[test]
    fn component_truncates_to_dirsiz() {
        let long: Vec<u8> = core::iter::repeat(b'n').take(100).collect();
        let (range, _) = skipelem(&long, 0).unwrap();
        let name = component(&long, range);
        assert_eq!(name.len(), DIRSIZ);
    }
}
