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

//! Logical to physical block mapping.
//!
//! [`bmap2`] translates an inode's logical block to its physical block, for
//! both classic indirect-map inodes and extent-tree inodes. Flags request
//! on-demand allocation, remapping, zeroing of the resulting block, and
//! unwritten-extent handling.
//!
//! The caller's inode copy is the source of truth: it is read to find
//! existing mappings and updated in place when new ones are recorded. The
//! handle's inode cache is refreshed through the write-back performed here.

use crate::error::{Error, Result};
use crate::extent::ExtentHandle;
use crate::fs::Ext2Fs;
use crate::inode::{
    DIND_BLOCK, EXTENTS_FL, IND_BLOCK, INLINE_DATA_FL, Inode, NDIR_BLOCKS, TIND_BLOCK,
};
use crate::{Blk, Ino};

/// Allocate a block when the logical block is unmapped.
pub const BMAP_ALLOC: u32 = 0x0001;
/// Record the physical block passed in instead of reading the mapping.
pub const BMAP_SET: u32 = 0x0002;
/// With `BMAP_SET` or allocation, mark the extent unwritten.
pub const BMAP_UNINIT: u32 = 0x0004;
/// Zero the physical block after mapping it.
pub const BMAP_ZERO: u32 = 0x0008;

/// Returned flag: the mapping is an unwritten extent.
pub const BMAP_RET_UNINIT: u32 = 0x0001;

/// Tells whether a logical block is beyond what the inode's map can address.
pub fn file_block_offset_too_big(fs: &Ext2Fs, inode: &Inode, offset: Blk) -> bool {
    // The kernel cuts off at 2^32 - 2 blocks
    if offset >= u64::from(u32::MAX) - 1 {
        return true;
    }
    if inode.flags() & EXTENTS_FL != 0 {
        return false;
    }
    let addr_per_block = u64::from(fs.block_size() >> 2);
    let max_map_block =
        addr_per_block + addr_per_block * addr_per_block + addr_per_block.pow(3) + 12;
    offset >= max_map_block
}

/// Reads slot `nr` of the indirect block `ind`, allocating or storing
/// through it per `flags`.
fn block_ind_bmap(
    fs: &mut Ext2Fs,
    flags: u32,
    ind: u32,
    blocks_alloc: &mut u64,
    nr: u32,
    ret_blk: &mut u32,
) -> Result<()> {
    if ind == 0 {
        if flags & BMAP_SET != 0 {
            return Err(Error::SetBmapNoInd);
        }
        *ret_blk = 0;
        return Ok(());
    }
    let mut buf = vec![0u8; fs.block_size() as usize];
    fs.read_blk(u64::from(ind), &mut buf)?;
    let off = nr as usize * 4;

    if flags & BMAP_SET != 0 {
        buf[off..off + 4].copy_from_slice(&ret_blk.to_le_bytes());
        return fs.write_blk(u64::from(ind), &buf);
    }

    let mut b = u32::from_le_bytes(buf[off..off + 4].try_into().unwrap());
    if b == 0 && flags & BMAP_ALLOC != 0 {
        let goal = if nr > 0 {
            u32::from_le_bytes(buf[off - 4..off].try_into().unwrap())
        } else {
            ind
        };
        b = fs.alloc_block(u64::from(goal))? as u32;
        buf[off..off + 4].copy_from_slice(&b.to_le_bytes());
        fs.write_blk(u64::from(ind), &buf)?;
        *blocks_alloc += 1;
    }
    *ret_blk = b;
    Ok(())
}

fn block_dind_bmap(
    fs: &mut Ext2Fs,
    flags: u32,
    dind: u32,
    blocks_alloc: &mut u64,
    nr: u32,
    ret_blk: &mut u32,
) -> Result<()> {
    let addr_per_block = fs.block_size() >> 2;
    let mut b = 0;
    block_ind_bmap(
        fs,
        flags & !BMAP_SET,
        dind,
        blocks_alloc,
        nr / addr_per_block,
        &mut b,
    )?;
    block_ind_bmap(fs, flags, b, blocks_alloc, nr % addr_per_block, ret_blk)
}

fn block_tind_bmap(
    fs: &mut Ext2Fs,
    flags: u32,
    tind: u32,
    blocks_alloc: &mut u64,
    nr: u32,
    ret_blk: &mut u32,
) -> Result<()> {
    let addr_per_block = fs.block_size() >> 2;
    let mut b = 0;
    block_dind_bmap(
        fs,
        flags & !BMAP_SET,
        tind,
        blocks_alloc,
        nr / addr_per_block,
        &mut b,
    )?;
    block_ind_bmap(fs, flags, b, blocks_alloc, nr % addr_per_block, ret_blk)
}

/// Looks a logical block up in the tree without allocating.
fn extent_lookup(fs: &mut Ext2Fs, handle: &mut ExtentHandle, block: Blk) -> Result<Blk> {
    match handle.goto(fs, block) {
        Ok(()) => {}
        Err(Error::ExtentNotFound) => return Ok(0),
        Err(e) => return Err(e),
    }
    let extent = handle.current()?;
    if block >= extent.e_lblk && block < extent.next_lblk() {
        Ok(extent.e_pblk + (block - extent.e_lblk))
    } else {
        Ok(0)
    }
}

/// Under bigalloc, derives the physical block for `lblk` from any sibling
/// logical block already mapped in the same cluster.
fn implied_cluster_alloc(
    fs: &mut Ext2Fs,
    handle: &mut ExtentHandle,
    lblk: Blk,
) -> Result<Blk> {
    if !fs.sb.has_feature_bigalloc() {
        return Ok(0);
    }
    let base_block = lblk & !fs.cluster_mask();
    for i in 0..u64::from(fs.cluster_ratio()) {
        if base_block + i == lblk {
            continue;
        }
        let pblock = extent_lookup(fs, handle, base_block + i)?;
        if pblock != 0 {
            return Ok(pblock - i + (lblk - base_block));
        }
    }
    Ok(0)
}

/// Tries to map a logical block to an already-allocated physical cluster.
pub fn map_cluster_block(fs: &mut Ext2Fs, ino: Ino, inode: &Inode, lblk: Blk) -> Result<Blk> {
    if !fs.sb.has_feature_bigalloc() || inode.flags() & EXTENTS_FL == 0 {
        return Ok(0);
    }
    let mut handle = ExtentHandle::open(ino, inode)?;
    implied_cluster_alloc(fs, &mut handle, lblk)
}

/// The extent-tree arm of [`bmap2`].
fn extent_bmap(
    fs: &mut Ext2Fs,
    ino: Ino,
    inode: &mut Inode,
    handle: &mut ExtentHandle,
    bmap_flags: u32,
    block: Blk,
    blocks_alloc: &mut u64,
    phys_blk: &mut Blk,
) -> Result<u32> {
    let mut ret_flags = 0;
    let uninit = bmap_flags & BMAP_UNINIT != 0;

    if bmap_flags & BMAP_SET != 0 {
        handle.set_bmap(fs, block, *phys_blk, uninit)?;
        *inode = *handle.inode();
        return Ok(ret_flags);
    }
    match handle.goto(fs, block) {
        Ok(()) => {
            let extent = handle.current()?;
            if block >= extent.e_lblk && block < extent.next_lblk() {
                *phys_blk = extent.e_pblk + (block - extent.e_lblk);
                if extent.uninit {
                    ret_flags |= BMAP_RET_UNINIT;
                }
            }
        }
        Err(Error::ExtentNotFound) => {}
        Err(e) => return Err(e),
    }
    if *phys_blk == 0 && bmap_flags & BMAP_ALLOC != 0 {
        let mut blk64 = implied_cluster_alloc(fs, handle, block)?;
        let mut alloc = 0;
        if blk64 == 0 {
            // Use the previous logical block as the allocation goal
            let goal = if block > 0 {
                extent_lookup(fs, handle, block - 1)?
            } else {
                0
            };
            let goal = if goal != 0 {
                goal
            } else {
                fs.find_inode_goal(ino, inode)
            };
            blk64 = fs.alloc_block(goal)?;
            blk64 &= !fs.cluster_mask();
            blk64 += fs.cluster_mask() & block;
            alloc += 1;
        }
        if let Err(e) = handle.set_bmap(fs, block, blk64, uninit) {
            fs.block_alloc_stats(blk64, -1);
            return Err(e);
        }
        // The insert may have grown the tree; resync the caller's inode
        *inode = fs.read_inode(ino)?;
        *blocks_alloc += alloc as u64;
        *phys_blk = blk64;
    }
    Ok(ret_flags)
}

/// Translates `(inode, logical block)` to a physical block.
///
/// Arguments:
/// - `inode` is the caller's inode copy, updated in place when mappings are
///   recorded; the caller persists it through the write-back done here.
/// - `bmap_flags` is a combination of the `BMAP_*` flags.
/// - `phys_blk` carries the block to record with [`BMAP_SET`], and receives
///   the mapping otherwise.
///
/// Returns the `BMAP_RET_*` flags of the mapping.
pub fn bmap2(
    fs: &mut Ext2Fs,
    ino: Ino,
    inode: &mut Inode,
    bmap_flags: u32,
    block: Blk,
    phys_blk: &mut Blk,
) -> Result<u32> {
    if bmap_flags & BMAP_SET == 0 {
        *phys_blk = 0;
    }
    let mut ret_flags = 0;
    let mut blocks_alloc = 0u64;
    let mut inode_dirty = false;

    if file_block_offset_too_big(fs, inode, block) {
        return Err(Error::FileTooBig);
    }
    // An inline inode has no blocks to map
    if inode.flags() & INLINE_DATA_FL != 0 {
        return Err(Error::InlineDataNoBlock);
    }
    let addr_per_block = u64::from(fs.block_size() >> 2);

    if inode.flags() & EXTENTS_FL != 0 {
        let mut handle = ExtentHandle::open(ino, inode)?;
        ret_flags = extent_bmap(
            fs,
            ino,
            inode,
            &mut handle,
            bmap_flags,
            block,
            &mut blocks_alloc,
            phys_blk,
        )?;
    } else if block < NDIR_BLOCKS as u64 {
        let slot = block as usize;
        if bmap_flags & BMAP_SET != 0 {
            inode.set_block(slot, *phys_blk as u32);
            inode_dirty = true;
        } else {
            *phys_blk = u64::from(inode.block(slot));
            if *phys_blk == 0 && bmap_flags & BMAP_ALLOC != 0 {
                let goal = if block > 0 {
                    u64::from(inode.block(slot - 1))
                } else {
                    fs.find_inode_goal(ino, inode)
                };
                let b = fs.alloc_block(goal)?;
                inode.set_block(slot, b as u32);
                blocks_alloc += 1;
                *phys_blk = b;
            }
        }
    } else {
        // Pick the indirection level and ensure its top block exists
        let mut nr = block - NDIR_BLOCKS as u64;
        let (slot, goal_slot, level) = if nr < addr_per_block {
            (IND_BLOCK, IND_BLOCK - 1, 1u32)
        } else {
            nr -= addr_per_block;
            if nr < addr_per_block * addr_per_block {
                (DIND_BLOCK, IND_BLOCK, 2)
            } else {
                nr -= addr_per_block * addr_per_block;
                (TIND_BLOCK, DIND_BLOCK, 3)
            }
        };
        let mut top = inode.block(slot);
        if top == 0 {
            if bmap_flags & BMAP_ALLOC == 0 {
                if bmap_flags & BMAP_SET != 0 {
                    return Err(Error::SetBmapNoInd);
                }
                return finish(fs, ino, inode, bmap_flags, phys_blk, 0, false, ret_flags);
            }
            let goal = u64::from(inode.block(goal_slot));
            top = fs.alloc_block(goal)? as u32;
            inode.set_block(slot, top);
            blocks_alloc += 1;
        }
        let mut blk32 = *phys_blk as u32;
        match level {
            1 => block_ind_bmap(fs, bmap_flags, top, &mut blocks_alloc, nr as u32, &mut blk32)?,
            2 => block_dind_bmap(fs, bmap_flags, top, &mut blocks_alloc, nr as u32, &mut blk32)?,
            _ => block_tind_bmap(fs, bmap_flags, top, &mut blocks_alloc, nr as u32, &mut blk32)?,
        }
        *phys_blk = u64::from(blk32);
        if bmap_flags & BMAP_SET != 0 {
            inode_dirty = true;
        }
    }

    finish(
        fs,
        ino,
        inode,
        bmap_flags,
        phys_blk,
        blocks_alloc,
        inode_dirty,
        ret_flags,
    )
}

/// 32-bit variant of [`bmap2`] for callers that cannot carry 64-bit block
/// numbers.
pub fn bmap(
    fs: &mut Ext2Fs,
    ino: Ino,
    inode: &mut Inode,
    bmap_flags: u32,
    block: u32,
    phys_blk: &mut u32,
) -> Result<()> {
    let mut phys64 = u64::from(*phys_blk);
    bmap2(fs, ino, inode, bmap_flags, u64::from(block), &mut phys64)?;
    if phys64 >= 1 << 32 {
        return Err(Error::Overflow);
    }
    *phys_blk = phys64 as u32;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn finish(
    fs: &mut Ext2Fs,
    ino: Ino,
    inode: &mut Inode,
    bmap_flags: u32,
    phys_blk: &mut Blk,
    blocks_alloc: u64,
    inode_dirty: bool,
    ret_flags: u32,
) -> Result<u32> {
    if *phys_blk != 0 && bmap_flags & BMAP_ZERO != 0 {
        fs.zero_blocks(*phys_blk, 1)?;
    }
    if blocks_alloc > 0 || inode_dirty {
        inode.iblk_add_blocks(fs.block_size(), blocks_alloc);
        fs.write_inode(ino, inode)?;
    }
    Ok(ret_flags)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::alloc_tables::allocate_tables;
    use crate::fs::FsParams;
    use crate::inode::S_IFREG;
    use crate::io::{FileIo, IoChannel};
    use crate::sb;

    fn classic_fs() -> (std::path::PathBuf, Ext2Fs) {
        let path = std::env::temp_dir().join(format!("e2img-bmap-{}", uuid::Uuid::new_v4()));
        let file = std::fs::File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .unwrap();
        file.set_len(32 << 20).unwrap();
        let io: Box<dyn IoChannel> = Box::new(FileIo::from_file(file));
        let mut fs = Ext2Fs::initialize(io, &FsParams::default()).unwrap();
        allocate_tables(&mut fs).unwrap();
        (path, fs)
    }

    fn new_file(fs: &mut Ext2Fs, extents: bool) -> (crate::Ino, Inode) {
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

    #[test]
    fn oversize_offsets_are_rejected() {
        let (path, mut fs) = classic_fs();
        let (ino, mut inode) = new_file(&mut fs, false);
        let mut phys = 0;
        assert!(matches!(
            bmap2(&mut fs, ino, &mut inode, 0, u64::from(u32::MAX) - 1, &mut phys),
            Err(Error::FileTooBig)
        ));
        // Largest classic-map block for 1 KiB blocks: 12 + 256 + 256^2 + 256^3
        let n = 256u64;
        assert!(matches!(
            bmap2(&mut fs, ino, &mut inode, 0, 12 + n + n * n + n * n * n, &mut phys),
            Err(Error::FileTooBig)
        ));
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn alloc_is_monotone_and_idempotent() {
        let (path, mut fs) = classic_fs();
        let (ino, mut inode) = new_file(&mut fs, false);
        let mut phys = 0;
        bmap2(&mut fs, ino, &mut inode, 0, 5, &mut phys).unwrap();
        assert_eq!(phys, 0);
        bmap2(&mut fs, ino, &mut inode, BMAP_ALLOC, 5, &mut phys).unwrap();
        assert_ne!(phys, 0);
        let first = phys;
        bmap2(&mut fs, ino, &mut inode, 0, 5, &mut phys).unwrap();
        assert_eq!(phys, first);
        bmap2(&mut fs, ino, &mut inode, BMAP_ALLOC, 5, &mut phys).unwrap();
        assert_eq!(phys, first);
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn indirect_levels_allocate_chain() {
        let (path, mut fs) = classic_fs();
        let (ino, mut inode) = new_file(&mut fs, false);
        let mut phys = 0;
        // 1 KiB blocks: block 12 needs the indirect block, 12+256 the dind
        bmap2(&mut fs, ino, &mut inode, BMAP_ALLOC, 12, &mut phys).unwrap();
        assert_ne!(phys, 0);
        assert_ne!(inode.block(IND_BLOCK), 0);
        // One data block + one indirect block
        assert_eq!(inode.blocks_count(), 2 * 2);
        bmap2(&mut fs, ino, &mut inode, BMAP_ALLOC, 12 + 256, &mut phys).unwrap();
        assert_ne!(inode.block(DIND_BLOCK), 0);
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn extent_alloc_and_readback() {
        let (path, mut fs) = classic_fs();
        let (ino, mut inode) = new_file(&mut fs, true);
        let mut phys = 0;
        bmap2(&mut fs, ino, &mut inode, BMAP_ALLOC, 0, &mut phys).unwrap();
        let b0 = phys;
        assert_ne!(b0, 0);
        bmap2(&mut fs, ino, &mut inode, BMAP_ALLOC, 1, &mut phys).unwrap();
        let mut back = 0;
        bmap2(&mut fs, ino, &mut inode, 0, 0, &mut back).unwrap();
        assert_eq!(back, b0);
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn set_remaps_block() {
        let (path, mut fs) = classic_fs();
        let (ino, mut inode) = new_file(&mut fs, true);
        let mut phys = 0;
        bmap2(&mut fs, ino, &mut inode, BMAP_ALLOC, 3, &mut phys).unwrap();
        let target = fs.alloc_block(0).unwrap();
        let mut set = target;
        bmap2(&mut fs, ino, &mut inode, BMAP_SET, 3, &mut set).unwrap();
        let mut back = 0;
        bmap2(&mut fs, ino, &mut inode, 0, 3, &mut back).unwrap();
        assert_eq!(back, target);
        std::fs::remove_file(path).unwrap();
    }
}
