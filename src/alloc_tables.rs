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

//! Placement of per-group metadata for a fresh or growing filesystem.
//!
//! Each group needs a block bitmap (1 block), an inode bitmap (1 block) and
//! a slice of the inode table. With `flex_bg`, the metadata of a whole flex
//! group is consolidated at its start, each artifact kind contiguous with
//! the previous group's.

use crate::error::{Error, Result};
use crate::fs::Ext2Fs;
use crate::group::BG_BLOCK_UNINIT;
use crate::{Blk, Group};

/// Searches for room to place `rem_grp * elem_size` blocks of flex-group
/// metadata, falling back to progressively smaller and wider searches.
fn flexbg_offset(
    fs: &mut Ext2Fs,
    group: Group,
    start_blk: Blk,
    rem_grp: u32,
    elem_size: u64,
) -> Blk {
    let flexbg_size = 1u32 << fs.sb.s_log_groups_per_flex;
    let flexbg = group / flexbg_size;
    let mut size = u64::from(rem_grp) * elem_size;
    let bpg = u64::from(u32::from_le(fs.sb.s_blocks_per_group));
    if size > bpg / 4 {
        size = bpg / 4;
    }

    // Don't do a long search if the previous block search is still valid,
    // but skip minor obstructions such as group descriptor backups.
    if start_blk != 0 && start_blk < fs.sb.blocks_count() {
        if let Ok(first_free) = fs.get_free_blocks(start_blk, start_blk + size, elem_size) {
            return first_free;
        }
    }

    let start_blk = fs.group_first_block(flexbg_size * flexbg);
    let last_grp = (group | (flexbg_size - 1)).min(fs.group_count() - 1);
    let last_blk = fs.group_last_block(last_grp);

    if let Ok(first_free) = fs.get_free_blocks(start_blk, last_blk, size) {
        return first_free;
    }
    if let Ok(first_free) = fs.get_free_blocks(start_blk, last_blk, elem_size) {
        return first_free;
    }
    fs.get_free_blocks(0, last_blk, elem_size).unwrap_or(0)
}

/// Marks `num` blocks at `blk` used and keeps every touched group's
/// accounting and checksum current.
fn mark_table_blocks(fs: &mut Ext2Fs, blk: Blk, num: u64) {
    fs.block_map.as_mut().unwrap().mark_range(blk, num);
    let ratio = u64::from(fs.cluster_ratio());
    let mut blk = blk;
    let mut num = num;
    while num > 0 {
        let group = fs.group_of_blk(blk);
        let last_blk = fs.group_last_block(group);
        let n = num.min(last_blk - blk + 1);

        let desc = fs.group_desc_mut(group);
        let freed = crate::ceil_div(n, ratio) as u32;
        desc.set_free_blocks_count(desc.free_blocks_count().saturating_sub(freed));
        desc.flags_clear(BG_BLOCK_UNINIT);
        fs.group_desc_csum_set(group);
        fs.sb.free_blocks_count_add(-(n as i64));
        blk += n;
        num -= n;
    }
}

/// Places the block bitmap, inode bitmap and inode table of one group.
pub fn allocate_group_table(fs: &mut Ext2Fs, group: Group) -> Result<()> {
    fs.read_bitmaps()?;
    let mut group_blk = fs.group_first_block(group);
    let mut last_blk = fs.group_last_block(group);

    let mut last_grp = 0;
    let mut rem_grps = 0u32;
    let mut flexbg_size = 0u32;
    let mut table_offset = 0u64;
    if fs.sb.has_feature_flex_bg() && fs.sb.s_log_groups_per_flex != 0 {
        flexbg_size = 1 << fs.sb.s_log_groups_per_flex;
        last_grp = (group | (flexbg_size - 1)).min(fs.group_count() - 1);
        rem_grps = last_grp - group + 1;
    }

    // Allocate the block and inode bitmaps, if necessary
    let mut start_blk = group_blk;
    if fs.stride != 0 && flexbg_size == 0 {
        let blk = fs.get_free_blocks(group_blk, last_blk, 1)?;
        let s = blk + u64::from(fs.inode_blocks_per_group());
        start_blk = if s >= last_blk {
            group_blk
        } else {
            let s = s + u64::from(fs.stride) * u64::from(group) % (last_blk - s + 1);
            if s >= last_blk { group_blk } else { s }
        };
    }

    if flexbg_size != 0 {
        let mut prev_block = 0;
        table_offset = u64::from(flexbg_size);
        if group % flexbg_size != 0 {
            prev_block = fs.group_desc(group - 1).block_bitmap_loc() + 1;
        } else if last_grp == fs.group_count() - 1 {
            // Keep the metadata tables of the trailing flex group contiguous
            table_offset = u64::from(last_grp & (flexbg_size - 1));
            if table_offset == 0 {
                table_offset = u64::from(flexbg_size);
            } else {
                table_offset += 1;
            }
        }
        start_blk = flexbg_offset(fs, group, prev_block, rem_grps, 1);
        last_blk = fs.group_last_block(last_grp);
    }

    if fs.group_desc(group).block_bitmap_loc() == 0 {
        let blk = match fs.get_free_blocks(start_blk, last_blk, 1) {
            Ok(blk) => blk,
            Err(Error::BlockAllocFail) => fs.get_free_blocks(group_blk, last_blk, 1)?,
            Err(e) => return Err(e),
        };
        mark_table_blocks(fs, blk, 1);
        fs.group_desc_mut(group).set_block_bitmap_loc(blk);
    }

    if flexbg_size != 0 {
        let prev_block = if group % flexbg_size != 0 {
            fs.group_desc(group - 1).inode_bitmap_loc() + 1
        } else {
            fs.group_desc(group).block_bitmap_loc() + table_offset
        };
        start_blk = flexbg_offset(fs, group, prev_block, rem_grps, 1);
        last_blk = fs.group_last_block(last_grp);
    }

    if fs.group_desc(group).inode_bitmap_loc() == 0 {
        let blk = match fs.get_free_blocks(start_blk, last_blk, 1) {
            Ok(blk) => blk,
            Err(Error::BlockAllocFail) => fs.get_free_blocks(group_blk, last_blk, 1)?,
            Err(e) => return Err(e),
        };
        mark_table_blocks(fs, blk, 1);
        fs.group_desc_mut(group).set_inode_bitmap_loc(blk);
    }

    // Allocate the inode table
    let itab_blocks = u64::from(fs.inode_blocks_per_group());
    if flexbg_size != 0 {
        let prev_block = if group % flexbg_size != 0 {
            fs.group_desc(group - 1).inode_table_loc() + itab_blocks
        } else {
            fs.group_desc(group).inode_bitmap_loc() + table_offset
        };
        group_blk = flexbg_offset(fs, group, prev_block, rem_grps, itab_blocks);
        last_blk = fs.group_last_block(last_grp);
    }

    if fs.group_desc(group).inode_table_loc() == 0 {
        let blk = fs.get_free_blocks(group_blk, last_blk, itab_blocks)?;
        mark_table_blocks(fs, blk, itab_blocks);
        fs.group_desc_mut(group).set_inode_table_loc(blk);
    }
    fs.group_desc_csum_set(group);
    Ok(())
}

/// Places the metadata of every group.
pub fn allocate_tables(fs: &mut Ext2Fs) -> Result<()> {
    let mut progress = fs.progress.take();
    if let Some(p) = &mut progress {
        p.init("Allocating group tables", u64::from(fs.group_count()));
    }
    for group in 0..fs.group_count() {
        if let Some(p) = &mut progress {
            p.update(u64::from(group));
        }
        let res = allocate_group_table(fs, group);
        if res.is_err() {
            fs.progress = progress;
            return res;
        }
    }
    if let Some(p) = &mut progress {
        p.close("done");
    }
    fs.progress = progress;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fs::FsParams;
    use crate::io::{FileIo, IoChannel};

    fn fresh(len: u64, params: &FsParams) -> (std::path::PathBuf, Ext2Fs) {
        let path = std::env::temp_dir().join(format!("e2img-tables-{}", uuid::Uuid::new_v4()));
        let file = std::fs::File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .unwrap();
        file.set_len(len).unwrap();
        let io: Box<dyn IoChannel> = Box::new(FileIo::from_file(file));
        (path, Ext2Fs::initialize(io, params).unwrap())
    }

    fn check_consistency(fs: &Ext2Fs) {
        let mut free = 0u64;
        for group in 0..fs.group_count() {
            let desc = fs.group_desc(group);
            assert_ne!(desc.block_bitmap_loc(), 0);
            assert_ne!(desc.inode_bitmap_loc(), 0);
            assert_ne!(desc.inode_table_loc(), 0);
            free += u64::from(desc.free_blocks_count());
        }
        assert_eq!(free, fs.sb.free_blocks_count());
    }

    #[test]
    fn classic_layout_stays_in_group() {
        let (path, mut fs) = fresh(16 << 20, &FsParams::default());
        allocate_tables(&mut fs).unwrap();
        for group in 0..fs.group_count() {
            let desc = fs.group_desc(group);
            let first = fs.group_first_block(group);
            let last = fs.group_last_block(group);
            for blk in [
                desc.block_bitmap_loc(),
                desc.inode_bitmap_loc(),
                desc.inode_table_loc(),
            ] {
                assert!((first..=last).contains(&blk), "group {group} block {blk}");
            }
        }
        check_consistency(&fs);
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn flex_bg_consolidates_metadata() {
        let params = FsParams {
            block_size: 1024,
            log_groups_per_flex: 2,
            ..Default::default()
        };
        let (path, mut fs) = fresh(64 << 20, &params);
        allocate_tables(&mut fs).unwrap();
        check_consistency(&fs);
        // Bitmaps of the groups of one flex group are contiguous
        let flex_first = fs.group_desc(0).block_bitmap_loc();
        for group in 1..4 {
            assert_eq!(
                fs.group_desc(group).block_bitmap_loc(),
                flex_first + u64::from(group),
            );
        }
        std::fs::remove_file(path).unwrap();
    }
}
