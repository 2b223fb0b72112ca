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

//! Iteration over an inode's mapped blocks.
//!
//! The callback receives the filesystem, the physical block number (which it
//! may rewrite), the logical block index, and the referencing block and
//! offset (0 for blocks mapped directly from the inode). Unless the
//! iteration is read-only, a rewritten block number is stored back into the
//! map.

use crate::error::{Error, Result};
use crate::extent::ExtentHandle;
use crate::fs::Ext2Fs;
use crate::inode::{
    DIND_BLOCK, EXTENTS_FL, IND_BLOCK, INLINE_DATA_FL, Inode, NDIR_BLOCKS, TIND_BLOCK,
};
use crate::{Blk, Ino};

/// Never write changed block numbers back.
pub const BLOCK_FLAG_READ_ONLY: u32 = 0x0001;

/// Callback result: the block number was changed.
pub const BLOCK_CHANGED: u32 = 0x0001;
/// Callback result: stop the iteration.
pub const BLOCK_ABORT: u32 = 0x0002;

/// The callback invoked for every mapped block.
///
/// Arguments: filesystem, physical block (rewritable), logical block count,
/// referencing block, offset within the referencing block.
pub type BlockFn<'f> = dyn FnMut(&mut Ext2Fs, &mut Blk, i64, Blk, usize) -> Result<u32> + 'f;

struct IterCtx<'f> {
    func: &'f mut BlockFn<'f>,
    flags: u32,
    blockcnt: i64,
    aborted: bool,
}

/// Walks an indirect block at `level` (1 = indirect, 3 = triple), invoking
/// the callback on every data block underneath.
fn iterate_ind(
    fs: &mut Ext2Fs,
    ctx: &mut IterCtx<'_>,
    ind: u32,
    level: u32,
) -> Result<bool> {
    if ind == 0 {
        // A hole spans the whole subtree
        let span = i64::from(fs.block_size() / 4).pow(level);
        ctx.blockcnt += span;
        return Ok(false);
    }
    let mut buf = vec![0u8; fs.block_size() as usize];
    fs.read_blk(u64::from(ind), &mut buf)?;
    let mut changed = false;
    for off in (0..buf.len()).step_by(4) {
        if ctx.aborted {
            break;
        }
        let entry = u32::from_le_bytes(buf[off..off + 4].try_into().unwrap());
        if level > 1 {
            iterate_ind(fs, ctx, entry, level - 1)?;
            continue;
        }
        if entry == 0 {
            ctx.blockcnt += 1;
            continue;
        }
        let mut blk = u64::from(entry);
        let ret = (ctx.func)(fs, &mut blk, ctx.blockcnt, u64::from(ind), off)?;
        if ret & BLOCK_CHANGED != 0 && blk != u64::from(entry) {
            buf[off..off + 4].copy_from_slice(&(blk as u32).to_le_bytes());
            changed = true;
        }
        if ret & BLOCK_ABORT != 0 {
            ctx.aborted = true;
        }
        ctx.blockcnt += 1;
    }
    if changed && ctx.flags & BLOCK_FLAG_READ_ONLY == 0 {
        fs.write_blk(u64::from(ind), &buf)?;
    }
    Ok(false)
}

/// Iterates over every mapped block of the inode, in logical order.
///
/// The callback may rewrite the physical block number by returning
/// [`BLOCK_CHANGED`]; with [`BLOCK_FLAG_READ_ONLY`] the rewrite is dropped.
/// Returning [`BLOCK_ABORT`] stops the walk.
pub fn block_iterate(
    fs: &mut Ext2Fs,
    ino: Ino,
    flags: u32,
    func: &mut BlockFn<'_>,
) -> Result<()> {
    let mut inode = fs.read_inode(ino)?;
    if inode.flags() & INLINE_DATA_FL != 0 {
        return Err(Error::InlineDataNoBlock);
    }
    if inode.flags() & EXTENTS_FL != 0 {
        return extent_iterate(fs, ino, &mut inode, flags, func);
    }

    let mut ctx = IterCtx {
        func,
        flags,
        blockcnt: 0,
        aborted: false,
    };
    let mut inode_dirty = false;
    for slot in 0..NDIR_BLOCKS {
        if ctx.aborted {
            break;
        }
        let entry = inode.block(slot);
        if entry == 0 {
            ctx.blockcnt += 1;
            continue;
        }
        let mut blk = u64::from(entry);
        let ret = (ctx.func)(fs, &mut blk, ctx.blockcnt, 0, slot)?;
        if ret & BLOCK_CHANGED != 0 && blk != u64::from(entry) {
            inode.set_block(slot, blk as u32);
            inode_dirty = true;
        }
        if ret & BLOCK_ABORT != 0 {
            ctx.aborted = true;
        }
        ctx.blockcnt += 1;
    }
    for (slot, level) in [(IND_BLOCK, 1u32), (DIND_BLOCK, 2), (TIND_BLOCK, 3)] {
        if ctx.aborted {
            break;
        }
        iterate_ind(fs, &mut ctx, inode.block(slot), level)?;
    }
    if inode_dirty && flags & BLOCK_FLAG_READ_ONLY == 0 {
        fs.write_inode(ino, &inode)?;
    }
    Ok(())
}

fn extent_iterate(
    fs: &mut Ext2Fs,
    ino: Ino,
    inode: &mut Inode,
    flags: u32,
    func: &mut BlockFn<'_>,
) -> Result<()> {
    let mut handle = ExtentHandle::open(ino, inode)?;
    match handle.goto(fs, 0) {
        Ok(()) | Err(Error::ExtentNotFound) => {}
        Err(e) => return Err(e),
    }
    let mut remaps: Vec<(Blk, Blk, bool)> = Vec::new();
    let mut extent = match handle.current() {
        Ok(extent) => extent,
        Err(Error::NoCurrentNode) => return Ok(()),
        Err(e) => return Err(e),
    };
    'outer: loop {
        for i in 0..u64::from(extent.e_len) {
            let mut blk = extent.e_pblk + i;
            let orig = blk;
            let ret = func(fs, &mut blk, (extent.e_lblk + i) as i64, 0, 0)?;
            if ret & BLOCK_CHANGED != 0 && blk != orig {
                remaps.push((extent.e_lblk + i, blk, extent.uninit));
            }
            if ret & BLOCK_ABORT != 0 {
                break 'outer;
            }
        }
        extent = match handle.next_leaf(fs) {
            Ok(extent) => extent,
            Err(Error::ExtentNoNext) => break,
            Err(e) => return Err(e),
        };
    }
    if flags & BLOCK_FLAG_READ_ONLY == 0 {
        for (lblk, pblk, uninit) in remaps {
            handle.set_bmap(fs, lblk, pblk, uninit)?;
        }
        *inode = *handle.inode();
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::bmap::{BMAP_ALLOC, bmap2};
    use crate::extent::test::extent_fs;
    use crate::inode::S_IFREG;

    #[test]
    fn visits_all_mapped_blocks_in_order() {
        let (path, mut fs) = extent_fs();
        let ino = fs.new_inode(0).unwrap();
        fs.inode_alloc_stats(ino, 1, false);
        let mut inode = Inode::new();
        inode.i_mode = (S_IFREG | 0o644).to_le();
        inode.i_links_count = 1u16.to_le();
        fs.write_new_inode(ino, &mut inode).unwrap();

        let mut expect = Vec::new();
        for lblk in [0u64, 1, 2, 13, 300] {
            let mut phys = 0;
            bmap2(&mut fs, ino, &mut inode, BMAP_ALLOC, lblk, &mut phys).unwrap();
            expect.push((lblk as i64, phys));
        }
        let mut seen = Vec::new();
        block_iterate(
            &mut fs,
            ino,
            BLOCK_FLAG_READ_ONLY,
            &mut |_fs, blk, blockcnt, _ref_blk, _ref_off| {
                seen.push((blockcnt, *blk));
                Ok(0)
            },
        )
        .unwrap();
        assert_eq!(seen, expect);
        std::fs::remove_file(path).unwrap();
    }
}
