//! Byte-level operations over a file's block tree.
//!
//! A file is either one direct block, or a top block whose `iptrs` point
//! at leaf blocks covering contiguous, offset-ordered byte ranges. Only
//! the last leaf may be shorter than the splitter's block size. Holes are
//! zero-filled.

use async_trait::async_trait;

use crate::block::{BlockInfo, BlockPointer, FileBlock, IndirectFilePtr};
use crate::error::{BlockError, Result};
use crate::splitter::BlockSplitter;

/// Writable access to one file's blocks. Handing out a block for writing
/// dirties it, copying it first if an upload still needs the old bytes.
#[async_trait]
pub trait FileBlockAccess: Send {
    /// Read-only view of the top block. Does not dirty it.
    async fn top(&mut self) -> Result<&FileBlock>;

    async fn top_mut(&mut self) -> Result<&mut FileBlock>;

    async fn leaf_mut(&mut self, info: &BlockInfo) -> Result<&mut FileBlock>;

    /// Store a new dirty leaf under a temporary pointer.
    fn add_leaf(&mut self, block: FileBlock) -> BlockPointer;

    fn remove_leaf(&mut self, info: &BlockInfo);

    /// Read-only view of a leaf, if it is dirty.
    fn dirty_leaf(&self, ptr: &BlockPointer) -> Option<&FileBlock>;

    /// Bring leaves into memory without dirtying them, so that a later
    /// `leaf_mut` on them cannot fail halfway through an operation.
    async fn load_leaves(&mut self, infos: &[BlockInfo]) -> Result<()>;
}

fn check_leaf_limit(splitter: &dyn BlockSplitter, needed: usize) -> Result<()> {
    let limit = splitter.max_ptrs_per_block();
    if needed > limit {
        return Err(BlockError::FileTooLarge { needed, limit });
    }
    Ok(())
}

/// Move a direct file's bytes into its first leaf.
async fn make_indirect<A: FileBlockAccess + ?Sized>(acc: &mut A) -> Result<()> {
    let top = acc.top_mut().await?;
    let contents = std::mem::take(&mut top.contents);
    top.is_ind = true;
    let ptr = acc.add_leaf(FileBlock::direct(contents));
    acc.top_mut().await?.iptrs = vec![IndirectFilePtr {
        info: BlockInfo::unfinalized(ptr),
        off: 0,
    }];
    Ok(())
}

/// Reject a write the file cannot hold, before any block is touched.
/// Returns the offset the write ends at.
pub fn check_write(top: &FileBlock, splitter: &dyn BlockSplitter, curr_size: u64, off: u64, len: usize) -> Result<u64> {
    let limit = splitter.max_ptrs_per_block();
    let too_large = |needed: u64| BlockError::FileTooLarge {
        needed: usize::try_from(needed).unwrap_or(usize::MAX),
        limit,
    };
    let end = off.checked_add(len as u64).ok_or_else(|| too_large(u64::MAX))?;
    let max = splitter.max_size() as u64;

    // Leaves in place once the file is indirect, and the offset where the
    // last of them stops taking bytes. New leaves only ever go after it.
    let (leaves, cap_end) = match top.iptrs.last() {
        Some(last) if top.is_ind => (
            top.iptrs.len() as u64,
            last.off.saturating_add(curr_size.saturating_sub(last.off).max(max)),
        ),
        _ => (1, max),
    };
    if end <= cap_end {
        return Ok(end);
    }
    let needed = leaves.saturating_add((end - cap_end).div_ceil(max));
    if needed > limit as u64 {
        return Err(too_large(needed));
    }
    Ok(end)
}

/// Write `data` at `off`, growing the file as needed. Nothing is modified
/// unless the whole write fits. Returns the new file size.
pub async fn write<A: FileBlockAccess + ?Sized>(
    acc: &mut A,
    splitter: &dyn BlockSplitter,
    data: &[u8],
    off: u64,
    curr_size: u64,
) -> Result<u64> {
    if data.is_empty() {
        return Ok(curr_size);
    }
    let (end, touched) = {
        let top = acc.top().await?;
        let end = check_write(top, splitter, curr_size, off, data.len())?;
        let touched: Vec<BlockInfo> = if top.is_ind {
            leaves_in_range(top, off, end).iter().map(|p| p.info).collect()
        } else {
            Vec::new()
        };
        (end, touched)
    };
    acc.load_leaves(&touched).await?;

    let max = splitter.max_size() as u64;
    let mut written = 0usize;
    let top = acc.top_mut().await?;
    if !top.is_ind {
        written = splitter.copy_until_split(top, true, data, off);
        if written == data.len() {
            return Ok(curr_size.max(end));
        }
        make_indirect(acc).await?;
    }

    while written < data.len() {
        let cur = off + written as u64;
        let (idx, iptr, next_off, num_leaves) = {
            let top = acc.top_mut().await?;
            let idx = top.leaf_index(cur);
            (idx, top.iptrs[idx], top.next_leaf_off(idx), top.iptrs.len())
        };

        let mut chunk = &data[written..];
        if let Some(next) = next_off {
            chunk = &chunk[..chunk.len().min((next - cur) as usize)];
        }
        let is_last = next_off.is_none();
        let local = cur - iptr.off;

        let leaf = acc.leaf_mut(&iptr.info).await?;
        let n = splitter.copy_until_split(leaf, is_last, chunk, local);
        written += n;

        let mut new_leaf_off = None;
        if n == 0 && is_last {
            // The last leaf is full, or the write starts past its end.
            let len = leaf.contents.len() as u64;
            if local > len && len < max {
                let fill = vec![0u8; (local.min(max) - len) as usize];
                splitter.copy_until_split(leaf, true, &fill, len);
            }
            new_leaf_off = Some(iptr.off + leaf.contents.len() as u64);
        }

        if let Some(leaf_off) = new_leaf_off {
            check_leaf_limit(splitter, num_leaves + 1)?;
            let ptr = acc.add_leaf(FileBlock::default());
            acc.top_mut().await?.iptrs.push(IndirectFilePtr {
                info: BlockInfo::unfinalized(ptr),
                off: leaf_off,
            });
        }
        acc.top_mut().await?.iptrs[idx].info.encoded_size = 0;
    }
    Ok(curr_size.max(end))
}

/// Number of leaves left once an indirect file is cut to `size`.
fn kept_leaves(top: &FileBlock, size: u64) -> usize {
    let idx = top.leaf_index(size);
    if idx > 0 && top.iptrs[idx].off == size {
        idx
    } else {
        idx + 1
    }
}

/// Shrink or zero-extend the file to `size`.
pub async fn truncate<A: FileBlockAccess + ?Sized>(
    acc: &mut A,
    splitter: &dyn BlockSplitter,
    size: u64,
    curr_size: u64,
) -> Result<()> {
    if size > curr_size {
        write(acc, splitter, &[0], size - 1, curr_size).await?;
        return Ok(());
    }

    let kept = {
        let top = acc.top().await?;
        top.is_ind.then(|| top.iptrs[kept_leaves(top, size) - 1].info)
    };
    if let Some(info) = kept {
        acc.load_leaves(&[info]).await?;
    }

    let (removed, last) = {
        let top = acc.top_mut().await?;
        if !top.is_ind {
            top.contents.truncate(size as usize);
            return Ok(());
        }
        let keep = kept_leaves(top, size);
        let removed: Vec<BlockInfo> = top.iptrs.split_off(keep).into_iter().map(|p| p.info).collect();
        let last = top.iptrs[keep - 1];
        top.iptrs[keep - 1].info.encoded_size = 0;
        (removed, last)
    };

    for info in &removed {
        acc.remove_leaf(info);
    }
    let leaf = acc.leaf_mut(&last.info).await?;
    leaf.contents.truncate((size - last.off) as usize);
    Ok(())
}

/// Fix leaf boundaries around dirty leaves: cut oversized leaves and push
/// the rest into the next leaf (creating it at the end of the file), and
/// fill short leaves from their next sibling.
pub async fn split_leaves<A: FileBlockAccess + ?Sized>(acc: &mut A, splitter: &dyn BlockSplitter) -> Result<()> {
    let mut idx = 0;
    loop {
        let (iptr, next, num_leaves) = {
            let top = acc.top_mut().await?;
            if !top.is_ind || idx >= top.iptrs.len() {
                return Ok(());
            }
            (top.iptrs[idx], top.iptrs.get(idx + 1).copied(), top.iptrs.len())
        };
        let Some(split) = acc.dirty_leaf(&iptr.info.ptr).map(|leaf| splitter.check_split(leaf)) else {
            idx += 1;
            continue;
        };

        if split > 0 {
            let leaf = acc.leaf_mut(&iptr.info).await?;
            let at = split as usize;
            assert!(
                at < leaf.contents.len(),
                "split at {at} outside a {}-byte block",
                leaf.contents.len()
            );
            let rest = leaf.contents.split_off(at);
            let rest_off = iptr.off + at as u64;
            match next {
                Some(next) => {
                    let next_leaf = acc.leaf_mut(&next.info).await?;
                    let mut contents = rest;
                    contents.extend_from_slice(&next_leaf.contents);
                    next_leaf.contents = contents;
                    let top = acc.top_mut().await?;
                    top.iptrs[idx + 1].off = rest_off;
                    top.iptrs[idx + 1].info.encoded_size = 0;
                }
                None => {
                    check_leaf_limit(splitter, num_leaves + 1)?;
                    let ptr = acc.add_leaf(FileBlock::direct(rest));
                    acc.top_mut().await?.iptrs.insert(
                        idx + 1,
                        IndirectFilePtr {
                            info: BlockInfo::unfinalized(ptr),
                            off: rest_off,
                        },
                    );
                }
            }
            idx += 1;
            continue;
        }

        let Some(next) = next.filter(|_| split < 0) else {
            // Exact fit, or a short last leaf.
            idx += 1;
            continue;
        };

        let pulled = std::mem::take(&mut acc.leaf_mut(&next.info).await?.contents);
        let leaf = acc.leaf_mut(&iptr.info).await?;
        let len = leaf.contents.len() as u64;
        let n = splitter.copy_until_split(leaf, true, &pulled, len);
        if n == pulled.len() {
            acc.remove_leaf(&next.info);
            acc.top_mut().await?.iptrs.remove(idx + 1);
            // Stay on this leaf: it may need bytes from the one after.
        } else {
            acc.leaf_mut(&next.info).await?.contents = pulled[n..].to_vec();
            let top = acc.top_mut().await?;
            top.iptrs[idx + 1].off += n as u64;
            top.iptrs[idx + 1].info.encoded_size = 0;
            idx += 1;
        }
    }
}

/// Leaves overlapping `[off, end)`, with their index in `top.iptrs`.
pub fn leaves_in_range(top: &FileBlock, off: u64, end: u64) -> Vec<IndirectFilePtr> {
    if off >= end || top.iptrs.is_empty() {
        return Vec::new();
    }
    let first = top.leaf_index(off);
    top.iptrs[first..]
        .iter()
        .take_while(|p| p.off < end)
        .copied()
        .collect()
}

/// Copy the part of `contents`, which starts at file offset `block_off`,
/// that overlaps `[off, end)` into `out`, which starts at `off`.
pub fn copy_range(contents: &[u8], block_off: u64, off: u64, end: u64, out: &mut [u8]) {
    let start = off.max(block_off);
    let stop = end.min(block_off + contents.len() as u64);
    if start >= stop {
        return;
    }
    let src = &contents[(start - block_off) as usize..(stop - block_off) as usize];
    out[(start - off) as usize..(stop - off) as usize].copy_from_slice(src);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::UserId;
    use crate::splitter::BlockSplitterSimple;
    use std::collections::{HashMap, HashSet};

    /// A file held entirely in memory. Leaves start out clean.
    #[derive(Default)]
    struct MemFile {
        top: FileBlock,
        leaves: HashMap<BlockPointer, FileBlock>,
        dirty: HashSet<BlockPointer>,
        removed: Vec<BlockInfo>,
    }

    impl MemFile {
        fn with_leaves(parts: &[&[u8]]) -> Self {
            let mut f = MemFile::default();
            f.top.is_ind = true;
            let mut off = 0;
            for part in parts {
                let ptr = BlockPointer::temporary(1, UserId::default());
                f.leaves.insert(ptr, FileBlock::direct(part.to_vec()));
                f.top.iptrs.push(IndirectFilePtr {
                    info: BlockInfo { ptr, encoded_size: 10 },
                    off,
                });
                off += part.len() as u64;
            }
            f
        }

        fn contents(&self) -> Vec<u8> {
            if !self.top.is_ind {
                return self.top.contents.clone();
            }
            let mut out = Vec::new();
            for p in &self.top.iptrs {
                assert_eq!(p.off as usize, out.len(), "leaves must be contiguous");
                out.extend_from_slice(&self.leaves[&p.info.ptr].contents);
            }
            out
        }

        fn leaf_sizes(&self) -> Vec<usize> {
            self.top
                .iptrs
                .iter()
                .map(|p| self.leaves[&p.info.ptr].contents.len())
                .collect()
        }
    }

    #[async_trait]
    impl FileBlockAccess for MemFile {
        async fn top(&mut self) -> Result<&FileBlock> {
            Ok(&self.top)
        }

        async fn top_mut(&mut self) -> Result<&mut FileBlock> {
            Ok(&mut self.top)
        }

        async fn leaf_mut(&mut self, info: &BlockInfo) -> Result<&mut FileBlock> {
            self.dirty.insert(info.ptr);
            self.leaves
                .get_mut(&info.ptr)
                .ok_or(BlockError::NoSuchBlock(info.ptr.id))
        }

        fn add_leaf(&mut self, block: FileBlock) -> BlockPointer {
            let ptr = BlockPointer::temporary(1, UserId::default());
            self.leaves.insert(ptr, block);
            self.dirty.insert(ptr);
            ptr
        }

        fn remove_leaf(&mut self, info: &BlockInfo) {
            self.leaves.remove(&info.ptr);
            self.dirty.remove(&info.ptr);
            self.removed.push(*info);
        }

        fn dirty_leaf(&self, ptr: &BlockPointer) -> Option<&FileBlock> {
            if !self.dirty.contains(ptr) {
                return None;
            }
            self.leaves.get(ptr)
        }

        async fn load_leaves(&mut self, infos: &[BlockInfo]) -> Result<()> {
            match infos.iter().find(|info| !self.leaves.contains_key(&info.ptr)) {
                Some(info) => Err(BlockError::NoSuchBlock(info.ptr.id)),
                None => Ok(()),
            }
        }
    }

    fn splitter() -> BlockSplitterSimple {
        BlockSplitterSimple::new(4, 8, 1024).unwrap()
    }

    #[tokio::test]
    async fn test_write_direct_then_indirect() {
        let s = splitter();
        let mut f = MemFile::default();
        write(&mut f, &s, b"abc", 0, 0).await.unwrap();
        assert!(!f.top.is_ind);

        write(&mut f, &s, b"defghij", 3, 3).await.unwrap();
        assert!(f.top.is_ind);
        assert_eq!(f.contents(), b"abcdefghij");
        assert_eq!(f.leaf_sizes(), vec![4, 4, 2]);

        // Overwrite across a boundary.
        write(&mut f, &s, b"XYZ", 3, 10).await.unwrap();
        assert_eq!(f.contents(), b"abcXYZghij");
        assert!(f.top.iptrs.iter().all(|p| !p.info.is_committed()));
    }

    #[tokio::test]
    async fn test_write_past_end_zero_fills() {
        let s = splitter();
        let mut f = MemFile::default();
        write(&mut f, &s, b"ab", 0, 0).await.unwrap();
        write(&mut f, &s, b"z", 9, 2).await.unwrap();
        assert_eq!(f.contents(), b"ab\0\0\0\0\0\0\0z");
        assert_eq!(f.leaf_sizes(), vec![4, 4, 2]);
    }

    #[tokio::test]
    async fn test_write_too_large() {
        let s = BlockSplitterSimple::new(4, 2, 1024).unwrap();
        let mut f = MemFile::default();
        let err = write(&mut f, &s, &[7; 9], 0, 0).await.unwrap_err();
        assert_eq!(err, BlockError::FileTooLarge { needed: 3, limit: 2 });
        assert!(f.contents().is_empty());
        assert!(f.dirty.is_empty());

        write(&mut f, &s, b"abcdef", 0, 0).await.unwrap();
        let err = write(&mut f, &s, b"XYZ", 6, 6).await.unwrap_err();
        assert_eq!(err, BlockError::FileTooLarge { needed: 3, limit: 2 });
        assert_eq!(f.contents(), b"abcdef");
        assert_eq!(f.leaf_sizes(), vec![4, 2]);
    }

    #[tokio::test]
    async fn test_write_far_past_end_is_too_large() {
        let s = splitter();
        let mut f = MemFile::default();
        write(&mut f, &s, b"ab", 0, 0).await.unwrap();
        let err = write(&mut f, &s, b"x", 1 << 50, 2).await.unwrap_err();
        assert!(matches!(err, BlockError::FileTooLarge { limit: 8, .. }), "{err:?}");
        let err = write(&mut f, &s, b"xy", u64::MAX, 2).await.unwrap_err();
        assert_eq!(err, BlockError::FileTooLarge { needed: usize::MAX, limit: 8 });
        assert_eq!(f.contents(), b"ab");

        // The largest file that fits still works.
        assert_eq!(write(&mut f, &s, b"z", 31, 2).await.unwrap(), 32);
        assert_eq!(f.leaf_sizes(), vec![4; 8]);
        assert!(write(&mut f, &s, b"z", 32, 32).await.is_err());
    }

    #[test]
    fn test_check_write_counts_oversized_last_leaf() {
        let s = splitter();
        let f = MemFile::with_leaves(&[b"abcd", b"efghijk"]);
        // The 7-byte last leaf takes bytes up to offset 11 before a new leaf.
        assert_eq!(check_write(&f.top, &s, 11, 10, 1).unwrap(), 11);
        assert_eq!(check_write(&f.top, &s, 11, 11, 4).unwrap(), 15);
        let s = BlockSplitterSimple::new(4, 2, 1024).unwrap();
        assert!(check_write(&f.top, &s, 11, 11, 1).is_err());
    }

    #[tokio::test]
    async fn test_truncate_shrink_and_extend() {
        let s = splitter();
        let mut f = MemFile::default();
        write(&mut f, &s, b"0123456789", 0, 0).await.unwrap();

        truncate(&mut f, &s, 4, 10).await.unwrap();
        assert_eq!(f.contents(), b"0123");
        assert_eq!(f.top.iptrs.len(), 1);
        assert_eq!(f.removed.len(), 2);

        truncate(&mut f, &s, 6, 4).await.unwrap();
        assert_eq!(f.contents(), b"0123\0\0");

        truncate(&mut f, &s, 5, 6).await.unwrap();
        assert_eq!(f.contents(), b"0123\0");
    }

    #[tokio::test]
    async fn test_split_pushes_into_next() {
        let s = splitter();
        let mut f = MemFile::with_leaves(&[b"abcdef", b"gh"]);
        let first = f.top.iptrs[0].info;
        f.dirty.insert(first.ptr);

        split_leaves(&mut f, &s).await.unwrap();
        assert_eq!(f.contents(), b"abcdefgh");
        assert_eq!(f.leaf_sizes(), vec![4, 4]);
        assert_eq!(f.top.iptrs[1].off, 4);
    }

    #[tokio::test]
    async fn test_split_creates_next() {
        let s = splitter();
        let mut f = MemFile::with_leaves(&[b"abcd", b"efghijk"]);
        let last = f.top.iptrs[1].info;
        f.dirty.insert(last.ptr);

        split_leaves(&mut f, &s).await.unwrap();
        assert_eq!(f.contents(), b"abcdefghijk");
        assert_eq!(f.leaf_sizes(), vec![4, 4, 3]);
    }

    #[tokio::test]
    async fn test_split_pulls_from_next() {
        let s = splitter();
        let mut f = MemFile::with_leaves(&[b"ab", b"c", b"defg"]);
        let first = f.top.iptrs[0].info;
        f.dirty.insert(first.ptr);

        split_leaves(&mut f, &s).await.unwrap();
        assert_eq!(f.contents(), b"abcdefg");
        assert_eq!(f.leaf_sizes(), vec![4, 3]);
        // The emptied middle leaf is gone.
        assert_eq!(f.removed.len(), 1);
    }

    #[test]
    fn test_leaves_in_range_and_copy() {
        let f = MemFile::with_leaves(&[b"abcd", b"efgh", b"ij"]);
        let hits = leaves_in_range(&f.top, 3, 6);
        assert_eq!(hits.iter().map(|p| p.off).collect::<Vec<_>>(), vec![0, 4]);

        let mut out = vec![0u8; 3];
        for p in &hits {
            copy_range(&f.leaves[&p.info.ptr].contents, p.off, 3, 6, &mut out);
        }
        assert_eq!(out, b"def");
    }
}
