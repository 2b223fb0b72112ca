/*
 * Copyright 2025 Luc Lenôtre
 *
 * This file is part of Maestro.
 *
 * Maestro is free software: you can redistribute it and/or modify it under the
 * terms of the GNU General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or (at your option) any later
 * version.
 *
 * Maestro is distributed in the hope that it will be useful, but WITHOUT ANY
 * WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR
 * A PARTICULAR PURPOSE. See the GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License along with
 * Maestro. If not, see <https://www.gnu.org/licenses/>.
 */

//! Deallocation of a range of an inode's logical blocks.
//!
//! [`punch`] frees all logical blocks in `start..=end`, leaving a hole that
//! reads back as zeros. Classic inodes are handled by a bounded recursion
//! over the indirect tree; extent inodes by shrinking and splitting extents.
//! Under bigalloc a physical block is only freed when it is the last
//! reference to its cluster.

use crate::bmap::map_cluster_block;
use crate::error::{Error, Result};
use crate::extent::{Extent, ExtentHandle};
use crate::fs::Ext2Fs;
use crate::inode::{EXTENTS_FL, INLINE_DATA_FL, Inode, NDIR_BLOCKS};
use crate::{Blk, Ino};

/// Tells whether the buffer is all zeros.
fn check_zero_block(buf: &[u8]) -> bool {
    buf.iter().all(|b| *b == 0)
}

/// Frees blocks in one level of the indirect tree.
///
/// `slots` spans the entries of one node (or the inode's direct slots);
/// entry `i` covers `incr` logical blocks starting at `offset + i * incr`.
/// Returns the number of blocks freed underneath.
fn ind_punch(
    fs: &mut Ext2Fs,
    slots: &mut [u8],
    level: u32,
    start: Blk,
    count: Blk,
    max: usize,
) -> Result<u64> {
    let incr = 1u64 << ((fs.sb.block_size_bits() - 2) * level);
    let mut freed = 0u64;
    let mut offset = 0u64;
    for i in 0..max {
        if offset >= start + count {
            break;
        }
        let off = i * 4;
        let blk = u32::from_le_bytes(slots[off..off + 4].try_into().unwrap());
        if blk == 0 || offset + incr <= start {
            offset += incr;
            continue;
        }
        if level > 0 {
            let mut buf = vec![0u8; fs.block_size() as usize];
            fs.read_blk(u64::from(blk), &mut buf)?;
            // Clamp the punch range to this child's span
            let start2 = start.saturating_sub(offset);
            let end2 = (start + count - offset).min(incr);
            freed += ind_punch(
                fs,
                &mut buf,
                level - 1,
                start2,
                end2 - start2,
                fs.block_size() as usize / 4,
            )?;
            fs.write_blk(u64::from(blk), &buf)?;
            if !check_zero_block(&buf) {
                offset += incr;
                continue;
            }
        }
        fs.block_alloc_stats(u64::from(blk), -1);
        slots[off..off + 4].copy_from_slice(&0u32.to_le_bytes());
        freed += 1;
        offset += incr;
    }
    Ok(freed)
}

/// Punches a classic indirect-map inode.
fn punch_ind(fs: &mut Ext2Fs, inode: &mut Inode, start: Blk, end: Blk) -> Result<()> {
    // The indirect map cannot address blocks past 2^32 - 1
    let blk_max = u64::from(u32::MAX);
    if start > blk_max {
        return Ok(());
    }
    let count = if end >= blk_max || end - start + 1 >= blk_max {
        blk_max - start
    } else {
        end - start + 1
    };

    // Snapshot the inode's 15 slots as raw little-endian entries
    let mut slots = [0u8; crate::INODE_BLOCK_BYTES];
    for i in 0..crate::inode::N_BLOCKS {
        slots[i * 4..(i + 1) * 4].copy_from_slice(&inode.block(i).to_le_bytes());
    }

    let addr_per_block = u64::from(fs.block_size() >> 2);
    let mut freed = 0u64;
    let mut start = start;
    let mut count = count;
    let mut max = NDIR_BLOCKS as u64;
    let mut num = NDIR_BLOCKS;
    let mut bp = 0usize;
    for level in 0..4u32 {
        if start < max {
            freed += ind_punch(
                fs,
                &mut slots[bp * 4..(bp + num) * 4],
                level,
                start,
                count,
                num,
            )?;
            if count > max {
                count -= max - start;
            } else {
                break;
            }
            start = 0;
        } else {
            start -= max;
        }
        bp += num;
        if level == 0 {
            num = 1;
            max = 1;
        }
        max *= addr_per_block;
    }

    for i in 0..crate::inode::N_BLOCKS {
        inode.set_block(i, u32::from_le_bytes(slots[i * 4..(i + 1) * 4].try_into().unwrap()));
    }
    inode.iblk_sub_blocks(fs.block_size(), freed);
    Ok(())
}

/// Frees a physical range, respecting cluster boundaries under bigalloc.
fn punch_extent_blocks(
    fs: &mut Ext2Fs,
    ino: Ino,
    inode: &Inode,
    mut lfree_start: Blk,
    mut free_start: Blk,
    mut free_count: u64,
    freed: &mut u64,
) -> Result<()> {
    if fs.cluster_ratio() == 1 {
        *freed += free_count;
        while free_count > 0 {
            fs.block_alloc_stats(free_start, -1);
            free_start += 1;
            free_count -= 1;
        }
        return Ok(());
    }

    // Free up to the next cluster boundary; blocks of a logical cluster are
    // assumed to map into the same physical cluster at the same offsets
    if free_start & fs.cluster_mask() != 0 {
        let pblk = map_cluster_block(fs, ino, inode, lfree_start)?;
        if pblk == 0 {
            fs.block_alloc_stats(free_start, -1);
            *freed += 1;
        }
        let cluster_freed =
            (u64::from(fs.cluster_ratio()) - (free_start & fs.cluster_mask())).min(free_count);
        free_count -= cluster_freed;
        free_start += cluster_freed;
        lfree_start += cluster_freed;
    }

    // Whole clusters in the middle of the range
    while free_count >= u64::from(fs.cluster_ratio()) {
        fs.block_alloc_stats(free_start, -1);
        *freed += 1;
        let ratio = u64::from(fs.cluster_ratio());
        free_count -= ratio;
        free_start += ratio;
        lfree_start += ratio;
    }

    // The trailing partial cluster
    if free_count > 0 {
        let pblk = map_cluster_block(fs, ino, inode, lfree_start)?;
        if pblk == 0 {
            fs.block_alloc_stats(free_start, -1);
            *freed += 1;
        }
    }
    Ok(())
}

/// Punches an extent-tree inode.
fn punch_extent(
    fs: &mut Ext2Fs,
    ino: Ino,
    inode: &mut Inode,
    start: Blk,
    end: Blk,
) -> Result<()> {
    let mut handle = ExtentHandle::open(ino, inode)?;
    let mut freed = 0u64;

    // goto leaves the cursor at the closest extent when `start` is in a
    // hole; a missing current node means nothing is mapped past this point
    match handle.goto(fs, start) {
        Ok(()) | Err(Error::ExtentNotFound) => {}
        Err(e) => return Err(e),
    }
    let mut extent = match handle.current() {
        Ok(extent) => extent,
        Err(Error::NoCurrentNode) => {
            *inode = *handle.inode();
            return Ok(());
        }
        Err(e) => return Err(e),
    };
    loop {
        let next = extent.next_lblk();
        // The stored key survives the shrink arithmetic below
        let stored_lblk = extent.e_lblk;
        let mut advance_to: Option<Blk> = None;
        let free_start;
        let lfree_start;
        let free_count;
        if start <= extent.e_lblk {
            // Iterated past the end of the punch region?
            if end < extent.e_lblk {
                break;
            }
            // Shrink from the left
            free_start = extent.e_pblk;
            lfree_start = extent.e_lblk;
            free_count = if next > end {
                end - extent.e_lblk + 1
            } else {
                u64::from(extent.e_len)
            };
            extent.e_len -= free_count as u32;
            extent.e_lblk += free_count;
            extent.e_pblk += free_count;
        } else if end >= next - 1 {
            // The punch region may lie entirely beyond this extent when
            // `start` was inside a hole
            if start >= next {
                extent = match handle.next_leaf(fs) {
                    Ok(extent) => extent,
                    Err(Error::ExtentNoNext) | Err(Error::NoCurrentNode) => break,
                    Err(e) => return Err(e),
                };
                continue;
            }
            // Shrink from the right
            let newlen = (start - extent.e_lblk) as u32;
            free_start = extent.e_pblk + u64::from(newlen);
            lfree_start = extent.e_lblk + u64::from(newlen);
            free_count = u64::from(extent.e_len - newlen);
            extent.e_len = newlen;
        } else {
            // Interior hole: split off the right remainder
            let newex = Extent {
                e_lblk: end + 1,
                e_pblk: extent.e_pblk + (end + 1 - extent.e_lblk),
                e_len: (next - end - 1) as u32,
                uninit: extent.uninit,
            };
            extent.e_len = (start - extent.e_lblk) as u32;
            free_start = extent.e_pblk + u64::from(extent.e_len);
            lfree_start = extent.e_lblk + u64::from(extent.e_len);
            free_count = end - start + 1;

            handle.insert(fs, &newex)?;
            handle.fix_parents(fs)?;
            // Step back to the extent being shrunk
            handle.goto(fs, extent.e_lblk)?;
        }
        if extent.e_len > 0 {
            handle.replace(fs, &extent)?;
            handle.fix_parents(fs)?;
        } else {
            // Remember where to resume before deleting the emptied extent
            let next_lblk = match handle.next_leaf(fs) {
                Ok(next_extent) => Some(next_extent.e_lblk),
                Err(Error::ExtentNoNext) => None,
                Err(e) => return Err(e),
            };
            handle.goto(fs, stored_lblk).or_else(|e| match e {
                Error::ExtentNotFound => Ok(()),
                e => Err(e),
            })?;
            handle.delete(fs)?;
            match handle.fix_parents(fs) {
                Ok(()) | Err(Error::NoCurrentNode) => {}
                Err(e) => return Err(e),
            }
            advance_to = next_lblk;
            if advance_to.is_none() {
                // Nothing mapped past the deleted extent
                let snapshot = *handle.inode();
                punch_extent_blocks(
                    fs, ino, &snapshot, lfree_start, free_start, free_count, &mut freed,
                )?;
                break;
            }
        }
        {
            let snapshot = *handle.inode();
            punch_extent_blocks(
                fs, ino, &snapshot, lfree_start, free_start, free_count, &mut freed,
            )?;
        }
        extent = match advance_to {
            Some(lblk) => {
                match handle.goto(fs, lblk) {
                    Ok(()) | Err(Error::ExtentNotFound) => {}
                    Err(e) => return Err(e),
                }
                match handle.current() {
                    Ok(extent) => extent,
                    Err(Error::NoCurrentNode) => break,
                    Err(e) => return Err(e),
                }
            }
            None => match handle.next_leaf(fs) {
                Ok(extent) => extent,
                Err(Error::ExtentNoNext) | Err(Error::NoCurrentNode) => break,
                Err(e) => return Err(e),
            },
        };
    }
    *inode = *handle.inode();
    inode.iblk_sub_blocks(fs.block_size(), freed);
    Ok(())
}

/// Zeroes an inline-data inode when the punch covers its head.
fn punch_inline_data(
    fs: &mut Ext2Fs,
    ino: Ino,
    inode: &mut Inode,
    start: Blk,
) -> Result<()> {
    // Punching is block-granular; inline data fits in block 0
    if start > 0 {
        return Ok(());
    }
    inode.i_block = [0; crate::inode::N_BLOCKS];
    inode.set_size(0);
    fs.write_inode(ino, inode)?;
    crate::inline::ea_remove(fs, ino)
}

/// Deallocates all logical blocks of `ino` from `start` to `end` inclusive.
///
/// With `end == u64::MAX` this truncates everything from `start` on.
pub fn punch(
    fs: &mut Ext2Fs,
    ino: Ino,
    inode: &mut Inode,
    start: Blk,
    end: Blk,
) -> Result<()> {
    if start > end {
        return Err(Error::InvalidArgument);
    }
    if inode.flags() & INLINE_DATA_FL != 0 {
        return punch_inline_data(fs, ino, inode, start);
    }
    if inode.flags() & EXTENTS_FL != 0 {
        punch_extent(fs, ino, inode, start, end)?;
    } else {
        punch_ind(fs, inode, start, end)?;
    }
    fs.write_inode(ino, inode)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::bmap::{BMAP_ALLOC, bmap2};
    use crate::extent::test::extent_fs;
    use crate::inode::S_IFREG;

    fn new_file(fs: &mut Ext2Fs, extents: bool) -> (Ino, Inode) {
        let ino = fs.new_inode(0).unwrap();
        fs.inode_alloc_stats(ino, 1, false);
        let mut inode = Inode::new();
        inode.i_mode = (S_IFREG | 0o644).to_le();
        inode.i_links_count = 1u16.to_le();
        if extents {
            inode.flags_set(EXTENTS_FL);
        }
        fs.write_new_inode(ino, &mut inode).unwrap();
        (ino, inode)
    }

    fn map_range(fs: &mut Ext2Fs, ino: Ino, inode: &mut Inode, blocks: u64) -> Vec<Blk> {
        (0..blocks)
            .map(|lblk| {
                let mut phys = 0;
                bmap2(fs, ino, inode, BMAP_ALLOC, lblk, &mut phys).unwrap();
                phys
            })
            .collect()
    }

    fn lookup(fs: &mut Ext2Fs, ino: Ino, inode: &mut Inode, lblk: u64) -> Blk {
        let mut phys = 0;
        bmap2(fs, ino, inode, 0, lblk, &mut phys).unwrap();
        phys
    }

    #[test]
    fn middle_hole_in_extent_file() {
        let (path, mut fs) = extent_fs();
        let (ino, mut inode) = new_file(&mut fs, true);
        let mapped = map_range(&mut fs, ino, &mut inode, 16);
        let blocks_before = inode.blocks_count();
        let free_before = fs.sb.free_blocks_count();

        punch(&mut fs, ino, &mut inode, 4, 7).unwrap();

        for (lblk, phys) in mapped.iter().enumerate() {
            let now = lookup(&mut fs, ino, &mut inode, lblk as u64);
            if (4..=7).contains(&lblk) {
                assert_eq!(now, 0, "block {lblk} still mapped");
            } else {
                assert_eq!(now, *phys, "block {lblk} moved");
            }
        }
        assert_eq!(
            inode.blocks_count(),
            blocks_before - 4 * u64::from(fs.block_size() / 512)
        );
        assert_eq!(fs.sb.free_blocks_count(), free_before + 4);
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn middle_hole_in_indirect_file() {
        let (path, mut fs) = extent_fs();
        let (ino, mut inode) = new_file(&mut fs, false);
        let mapped = map_range(&mut fs, ino, &mut inode, 20);

        punch(&mut fs, ino, &mut inode, 4, 7).unwrap();

        for (lblk, phys) in mapped.iter().enumerate() {
            let now = lookup(&mut fs, ino, &mut inode, lblk as u64);
            if (4..=7).contains(&lblk) {
                assert_eq!(now, 0, "block {lblk} still mapped");
            } else {
                assert_eq!(now, *phys, "block {lblk} moved");
            }
        }
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn truncate_frees_indirect_chain() {
        let (path, mut fs) = extent_fs();
        let (ino, mut inode) = new_file(&mut fs, false);
        // Far enough to need the indirect block (1 KiB blocks)
        map_range(&mut fs, ino, &mut inode, 20);
        assert_ne!(inode.block(crate::inode::IND_BLOCK), 0);

        punch(&mut fs, ino, &mut inode, 0, u64::MAX).unwrap();

        assert_eq!(inode.block(crate::inode::IND_BLOCK), 0);
        for lblk in 0..20 {
            assert_eq!(lookup(&mut fs, ino, &mut inode, lblk), 0);
        }
        assert_eq!(inode.blocks_count(), 0);
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn truncate_extent_file_completely() {
        let (path, mut fs) = extent_fs();
        let (ino, mut inode) = new_file(&mut fs, true);
        map_range(&mut fs, ino, &mut inode, 30);
        let free_before = fs.sb.free_blocks_count();

        punch(&mut fs, ino, &mut inode, 0, u64::MAX).unwrap();

        for lblk in 0..30 {
            assert_eq!(lookup(&mut fs, ino, &mut inode, lblk), 0);
        }
        assert_eq!(fs.sb.free_blocks_count(), free_before + 30);
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn punch_left_edge_of_extent() {
        let (path, mut fs) = extent_fs();
        let (ino, mut inode) = new_file(&mut fs, true);
        let mapped = map_range(&mut fs, ino, &mut inode, 8);

        punch(&mut fs, ino, &mut inode, 0, 2).unwrap();

        for lblk in 0..3u64 {
            assert_eq!(lookup(&mut fs, ino, &mut inode, lblk), 0);
        }
        for lblk in 3..8u64 {
            assert_eq!(
                lookup(&mut fs, ino, &mut inode, lblk),
                mapped[lblk as usize]
            );
        }
        std::fs::remove_file(path).unwrap();
    }
}
