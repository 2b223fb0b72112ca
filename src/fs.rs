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

//! The filesystem handle.
//!
//! [`Ext2Fs`] binds an I/O channel to an in-memory superblock, group
//! descriptor table, block and inode bitmaps, inode cache and bad blocks
//! list. Mutations accumulate in memory; [`Ext2Fs::flush`] commits them in
//! an order that makes the primary superblock the publication point:
//! bitmaps, then group descriptors, then backup superblocks, then the
//! primary superblock last.

use crate::badblocks::BadBlocksList;
use crate::bitmap::{Bitmap, BitmapKind, BitmapTarget};
use crate::error::{Error, Result};
use crate::group::{BG_BLOCK_UNINIT, BG_INODE_UNINIT, GroupDesc};
use crate::inode::{Inode, InodeCache, inode_csum_set};
use crate::io::IoChannel;
use crate::sb::{
    self, EXT2_MAGIC, STATE_VALID_FS, SUPERBLOCK_OFFSET, SUPERBLOCK_SIZE, Superblock,
};
use crate::{Blk, Group, Ino, as_bytes, as_bytes_mut, ceil_div, from_bytes};

/// Number of inodes kept in the handle's cache.
const INODE_CACHE_SIZE: usize = 4;

/// Directory-density threshold under which `AutoDir` picks the extent
/// back-end. Empirical.
const AUTODIR_DIR_RATIO: u32 = 320;

/// Parameters for creating a fresh filesystem.
pub struct FsParams {
    /// The block size in bytes.
    pub block_size: u32,
    /// The size of the filesystem in bytes. Defaults to the channel size.
    pub len: Option<u64>,
    /// The number of inodes per group. Derived from the size by default.
    pub inodes_per_group: Option<u32>,
    /// The size of an inode record.
    pub inode_size: u16,
    /// Compatible feature flags.
    pub feature_compat: u32,
    /// Incompatible feature flags.
    pub feature_incompat: u32,
    /// Read-only compatible feature flags.
    pub feature_ro_compat: u32,
    /// log2 of the number of groups per flex group, 0 to disable.
    pub log_groups_per_flex: u8,
    /// The volume label.
    pub label: Option<String>,
    /// The filesystem UUID. Random by default.
    pub fs_id: Option<[u8; 16]>,
    /// RAID stride hint in blocks.
    pub stride: u32,
}

impl Default for FsParams {
    fn default() -> Self {
        Self {
            block_size: 1024,
            len: None,
            inodes_per_group: None,
            inode_size: 256,
            feature_compat: 0,
            feature_incompat: sb::FEATURE_INCOMPAT_FILETYPE,
            feature_ro_compat: sb::FEATURE_RO_COMPAT_SPARSE_SUPER,
            log_groups_per_flex: 0,
            label: None,
            fs_id: None,
            stride: 0,
        }
    }
}

/// The default number of mounts before a fsck pass is required.
const DEFAULT_FSCK_MOUNT_COUNT: u16 = 1024;
/// The default interval in seconds before a fsck pass is required.
const DEFAULT_FSCK_INTERVAL: u32 = 2678400;
/// Bytes of filesystem per inode when deriving the inode count.
const DEFAULT_INODE_RATIO: u64 = 16384;

/// Progress reporting for long operations.
///
/// Optional; operations proceed silently without a reporter.
pub trait Progress {
    /// Starts a phase covering `max` steps.
    fn init(&mut self, label: &str, max: u64);
    /// Reports the current step.
    fn update(&mut self, val: u64);
    /// Ends the phase.
    fn close(&mut self, msg: &str);
}

/// Returns the current UNIX timestamp.
fn timestamp() -> u32 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

/// An open filesystem.
pub struct Ext2Fs {
    io: Box<dyn IoChannel>,
    /// The in-memory superblock.
    pub sb: Superblock,
    /// Copy of the superblock as last read or written, for byte-diff commits.
    orig_sb: Option<Superblock>,
    group_desc: Vec<GroupDesc>,
    /// The block (or cluster) allocation bitmap, once read or created.
    pub block_map: Option<Bitmap>,
    /// The inode allocation bitmap, once read or created.
    pub inode_map: Option<Bitmap>,
    /// The bad blocks list.
    pub badblocks: BadBlocksList,
    icache: InodeCache,
    /// Raw copy of the MMP block, when read.
    pub mmp_buf: Option<Vec<u8>>,
    /// The back-end used for freshly allocated bitmaps.
    pub default_bitmap_kind: BitmapKind,
    /// Charset used to fold names of case-insensitive directories.
    pub charset: Option<Box<dyn crate::dir::hash::Charset>>,
    /// Progress reporter for long operations.
    pub progress: Option<Box<dyn Progress>>,
    /// Mode bits removed from newly created files.
    pub umask: u16,
    /// RAID stride hint used by the table allocator.
    pub stride: u32,

    rw: bool,
    dirty: bool,
    /// Restrict flush to the primary superblock and descriptors.
    pub master_sb_only: bool,
    /// Skip descriptor writes entirely on flush.
    pub super_only: bool,

    blocksize: u32,
    cluster_ratio_bits: u32,
    desc_blocks: Blk,
    inode_blocks_per_group: u32,
    group_desc_count: Group,
}

impl Ext2Fs {
    /// Opens an existing filesystem on the given channel.
    ///
    /// `rw` tells whether modifications are allowed.
    pub fn open(mut io: Box<dyn IoChannel>, rw: bool) -> Result<Self> {
        io.set_block_size(1024)?;
        let mut buf = vec![0u8; SUPERBLOCK_SIZE];
        io.read_block(SUPERBLOCK_OFFSET / 1024, &mut buf)?;
        let sb: Superblock = from_bytes(&buf);

        if u16::from_le(sb.s_magic) != EXT2_MAGIC {
            return Err(Error::BadMagic);
        }
        if u32::from_le(sb.s_log_block_size) > 6
            || u32::from_le(sb.s_blocks_per_group) == 0
            || u32::from_le(sb.s_inodes_per_group) == 0
            || sb.blocks_count() == 0
        {
            return Err(Error::BadMagic);
        }
        if !sb.csum_verify() {
            return Err(Error::BadChecksum);
        }

        let blocksize = sb.block_size();
        io.set_block_size(blocksize)?;

        let group_desc_count = sb.group_count();
        let desc_size = u64::from(sb.desc_size());
        let desc_blocks = ceil_div(u64::from(group_desc_count) * desc_size, blocksize as u64);
        let inode_blocks_per_group = ceil_div(
            u64::from(u32::from_le(sb.s_inodes_per_group)) * u64::from(sb.inode_size()),
            blocksize as u64,
        ) as u32;

        let mut fs = Self {
            io,
            sb,
            orig_sb: Some(sb),
            group_desc: Vec::new(),
            block_map: None,
            inode_map: None,
            badblocks: BadBlocksList::default(),
            icache: InodeCache::new(INODE_CACHE_SIZE),
            mmp_buf: None,
            default_bitmap_kind: BitmapKind::BitArray,
            charset: None,
            progress: None,
            umask: 0o022,
            stride: u32::from(u16::from_le(sb.s_raid_stride)),
            rw,
            dirty: false,
            master_sb_only: false,
            super_only: false,
            blocksize,
            cluster_ratio_bits: sb.cluster_ratio_bits(),
            desc_blocks,
            inode_blocks_per_group,
            group_desc_count,
        };
        fs.read_group_desc()?;
        Ok(fs)
    }

    /// Creates a fresh filesystem on the given channel.
    ///
    /// The handle is left dirty; tables still have to be placed with
    /// [`crate::alloc_tables::allocate_tables`] and the result committed with
    /// [`Ext2Fs::flush`].
    pub fn initialize(mut io: Box<dyn IoChannel>, params: &FsParams) -> Result<Self> {
        let block_size = params.block_size;
        if !block_size.is_power_of_two() || !(1024..=65536).contains(&block_size) {
            return Err(Error::InvalidArgument);
        }
        let len = match params.len {
            Some(len) => len,
            None => io.size()?,
        };
        io.set_block_size(block_size)?;

        let now = timestamp();
        let mut s = Superblock::new();
        s.s_magic = EXT2_MAGIC.to_le();
        s.s_log_block_size = (block_size.trailing_zeros() - 10).to_le();
        s.s_log_cluster_size = s.s_log_block_size;
        s.s_feature_compat = params.feature_compat.to_le();
        s.s_feature_incompat = params.feature_incompat.to_le();
        s.s_feature_ro_compat = params.feature_ro_compat.to_le();
        s.s_rev_level = sb::DYNAMIC_REV.to_le();
        s.s_first_ino = sb::GOOD_OLD_FIRST_INO.to_le();
        s.s_inode_size = params.inode_size.to_le();
        if params.inode_size > 128 {
            s.s_min_extra_isize = 32u16.to_le();
            s.s_want_extra_isize = 32u16.to_le();
        }
        s.s_first_data_block = u32::from(block_size == 1024).to_le();
        s.s_blocks_per_group = (block_size * 8).to_le();
        s.s_clusters_per_group = s.s_blocks_per_group;
        s.s_log_groups_per_flex = params.log_groups_per_flex;
        if params.log_groups_per_flex != 0 {
            s.s_feature_incompat =
                (params.feature_incompat | sb::FEATURE_INCOMPAT_FLEX_BG).to_le();
        }
        s.s_raid_stride = (params.stride as u16).to_le();
        s.s_max_mnt_count = DEFAULT_FSCK_MOUNT_COUNT.to_le();
        s.s_checkinterval = DEFAULT_FSCK_INTERVAL.to_le();
        s.s_mkfs_time = now.to_le();
        s.s_wtime = now.to_le();
        s.s_lastcheck = now.to_le();
        s.s_state = STATE_VALID_FS.to_le();
        s.s_errors = 1u16.to_le(); // continue on error
        s.s_def_hash_version = 1; // half MD4
        s.s_flags = sb::FLAGS_UNSIGNED_HASH.to_le();
        let seed_uuid = *uuid::Uuid::new_v4().as_bytes();
        let mut hash_seed = [0u32; 4];
        for (i, seed) in hash_seed.iter_mut().enumerate() {
            *seed =
                u32::from_le_bytes(seed_uuid[i * 4..(i + 1) * 4].try_into().unwrap()).to_le();
        }
        s.s_hash_seed = hash_seed;
        s.s_uuid = params.fs_id.unwrap_or_else(|| *uuid::Uuid::new_v4().as_bytes());
        if let Some(label) = &params.label {
            let bytes = label.as_bytes();
            let n = bytes.len().min(16);
            s.s_volume_name[..n].copy_from_slice(&bytes[..n]);
        }

        let total_blocks = len / u64::from(block_size);
        let first_data_block = u64::from(u32::from_le(s.s_first_data_block));
        if total_blocks <= first_data_block + 1 {
            return Err(Error::InvalidArgument);
        }
        s.set_blocks_count(total_blocks);

        let blocks_per_group = u64::from(block_size * 8);
        let group_count =
            ceil_div(total_blocks - first_data_block, blocks_per_group) as u32;

        let inodes_per_group = match params.inodes_per_group {
            Some(ipg) => ipg,
            None => {
                let wanted = ceil_div(len / DEFAULT_INODE_RATIO, u64::from(group_count));
                (ceil_div(wanted, 8) * 8).clamp(8, u64::from(block_size) * 8) as u32
            }
        };
        s.s_inodes_per_group = inodes_per_group.to_le();
        s.s_inodes_count = (inodes_per_group * group_count).to_le();
        s.s_free_inodes_count = s.s_inodes_count;

        let mut fs = Self {
            io,
            sb: s,
            orig_sb: None,
            group_desc: vec![GroupDesc::default(); group_count as usize],
            block_map: None,
            inode_map: None,
            badblocks: BadBlocksList::default(),
            icache: InodeCache::new(INODE_CACHE_SIZE),
            mmp_buf: None,
            default_bitmap_kind: BitmapKind::BitArray,
            charset: None,
            progress: None,
            umask: 0o022,
            stride: params.stride,
            rw: true,
            dirty: true,
            master_sb_only: false,
            super_only: false,
            blocksize: block_size,
            cluster_ratio_bits: 0,
            desc_blocks: ceil_div(
                u64::from(group_count) * u64::from(s.desc_size()),
                u64::from(block_size),
            ),
            inode_blocks_per_group: ceil_div(
                u64::from(inodes_per_group) * u64::from(s.inode_size()),
                u64::from(block_size),
            ) as u32,
            group_desc_count: group_count,
        };

        let mut block_map = fs.allocate_block_bitmap("block bitmap")?;
        let inode_map = fs.allocate_inode_bitmap("inode bitmap")?;

        // Reserve the superblock and descriptor copies of every group
        for group in 0..group_count {
            let (super_blk, old_desc_blk, new_desc_blk, _) = fs.super_and_bgd_loc(group);
            if fs.bg_has_super(group) {
                block_map.mark(super_blk);
            }
            if old_desc_blk != 0 {
                let count = fs.desc_blocks
                    + u64::from(u16::from_le(fs.sb.s_reserved_gdt_blocks));
                block_map.mark_range(old_desc_blk, count);
            }
            if new_desc_blk != 0 {
                block_map.mark(new_desc_blk);
            }
        }
        // Per-group free block counts
        let mut free_blocks = 0u64;
        for group in 0..group_count {
            let first = fs.group_first_block(group);
            let last = fs.group_last_block(group);
            let mut free = 0u32;
            for blk in first..=last {
                if !block_map.test(blk) {
                    free += 1;
                }
            }
            fs.group_desc[group as usize].set_free_blocks_count(free);
            fs.group_desc[group as usize].set_free_inodes_count(inodes_per_group);
            free_blocks += u64::from(free);
        }
        fs.sb.set_free_blocks_count(free_blocks);

        fs.block_map = Some(block_map);
        fs.inode_map = Some(inode_map);

        // Reserve the low inodes
        for ino in 1..=fs.sb.first_ino() {
            fs.inode_alloc_stats(ino, 1, false);
        }

        fs.refresh_group_csums();
        fs.sb.csum_set();
        Ok(fs)
    }

    /// Returns the block size in bytes.
    pub fn block_size(&self) -> u32 {
        self.blocksize
    }

    /// Returns the number of blocks per allocation cluster.
    pub fn cluster_ratio(&self) -> u32 {
        1 << self.cluster_ratio_bits
    }

    /// Returns `log2` of the cluster ratio.
    pub fn cluster_ratio_bits(&self) -> u32 {
        self.cluster_ratio_bits
    }

    /// Returns the mask of block bits inside a cluster.
    pub fn cluster_mask(&self) -> u64 {
        u64::from(self.cluster_ratio()) - 1
    }

    /// Converts a block number to a cluster number.
    pub fn b2c(&self, blk: Blk) -> u64 {
        blk >> self.cluster_ratio_bits
    }

    /// Tells whether the handle allows writes.
    pub fn is_rw(&self) -> bool {
        self.rw
    }

    /// Marks the in-memory state as needing a flush.
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Tells whether the in-memory state needs a flush.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Returns the number of block groups.
    pub fn group_count(&self) -> Group {
        self.group_desc_count
    }

    /// Returns the number of blocks holding the group descriptor table.
    pub fn desc_blocks(&self) -> Blk {
        self.desc_blocks
    }

    /// Returns the number of blocks in each group's slice of the inode table.
    pub fn inode_blocks_per_group(&self) -> u32 {
        self.inode_blocks_per_group
    }

    /// Returns the descriptor of the given group.
    pub fn group_desc(&self, group: Group) -> &GroupDesc {
        &self.group_desc[group as usize]
    }

    /// Returns the descriptor of the given group, mutably.
    ///
    /// The caller is responsible for refreshing the descriptor checksum.
    pub fn group_desc_mut(&mut self, group: Group) -> &mut GroupDesc {
        self.dirty = true;
        &mut self.group_desc[group as usize]
    }

    /// Refreshes the checksum of the given group's descriptor.
    pub fn group_desc_csum_set(&mut self, group: Group) {
        let sb = self.sb;
        self.group_desc[group as usize].csum_set(&sb, group);
    }

    /// Refreshes every group descriptor checksum.
    pub fn refresh_group_csums(&mut self) {
        let sb = self.sb;
        for (i, desc) in self.group_desc.iter_mut().enumerate() {
            desc.csum_set(&sb, i as Group);
        }
    }

    /// Returns the first block of the given group.
    pub fn group_first_block(&self, group: Group) -> Blk {
        u64::from(u32::from_le(self.sb.s_first_data_block))
            + u64::from(group) * u64::from(u32::from_le(self.sb.s_blocks_per_group))
    }

    /// Returns the last block of the given group.
    pub fn group_last_block(&self, group: Group) -> Blk {
        let next = self.group_first_block(group)
            + u64::from(u32::from_le(self.sb.s_blocks_per_group));
        (next - 1).min(self.sb.blocks_count() - 1)
    }

    /// Returns the group containing the given block.
    pub fn group_of_blk(&self, blk: Blk) -> Group {
        ((blk - u64::from(u32::from_le(self.sb.s_first_data_block)))
            / u64::from(u32::from_le(self.sb.s_blocks_per_group))) as Group
    }

    /// Returns the group containing the given inode.
    pub fn group_of_ino(&self, ino: Ino) -> Group {
        (ino - 1) / u32::from_le(self.sb.s_inodes_per_group)
    }

    /// Reads blocks from the channel.
    pub fn read_blk(&mut self, blk: Blk, buf: &mut [u8]) -> Result<()> {
        self.io.read_block(blk, buf)
    }

    /// Writes blocks to the channel.
    pub fn write_blk(&mut self, blk: Blk, buf: &[u8]) -> Result<()> {
        self.io.write_block(blk, buf)
    }

    /// Writes `count` zeroed blocks starting at `blk`.
    pub fn zero_blocks(&mut self, blk: Blk, count: u64) -> Result<()> {
        let zero = vec![0u8; self.blocksize as usize];
        for i in 0..count {
            self.io.write_block(blk + i, &zero)?;
        }
        Ok(())
    }

    /// Returns the channel's statistics.
    pub fn io_stats(&self) -> crate::io::IoStats {
        self.io.stats()
    }

    // ------------------------------------------------------------------
    // Bitmaps

    /// Resolves the `AutoDir` back-end choice.
    ///
    /// The extent back-end pays off when the map is expected to be sparse;
    /// the cutover ratio is empirical.
    fn resolve_bitmap_kind(&self) -> BitmapKind {
        match self.default_bitmap_kind {
            BitmapKind::AutoDir => {
                let num_dirs = self.num_dirs();
                if num_dirs > u32::from_le(self.sb.s_inodes_count) / AUTODIR_DIR_RATIO {
                    BitmapKind::BitArray
                } else {
                    BitmapKind::RbTree
                }
            }
            kind => kind,
        }
    }

    /// Returns the number of directories as reported by the descriptors.
    pub fn num_dirs(&self) -> u32 {
        let max_dirs = u32::from_le(self.sb.s_inodes_per_group);
        let mut num_dirs = 0u32;
        for desc in &self.group_desc {
            let count = desc.used_dirs_count();
            num_dirs += if count > max_dirs { max_dirs / 8 } else { count };
        }
        num_dirs.min(u32::from_le(self.sb.s_inodes_count))
    }

    /// Allocates an empty block (cluster) bitmap for this filesystem.
    pub fn allocate_block_bitmap(&self, descr: &str) -> Result<Bitmap> {
        let start = self.b2c(u64::from(u32::from_le(self.sb.s_first_data_block)));
        let end = self.b2c(self.sb.blocks_count() - 1);
        let real_end = u64::from(u32::from_le(self.sb.s_clusters_per_group))
            * u64::from(self.group_desc_count)
            - 1
            + start;
        let mut map = Bitmap::alloc(
            self.resolve_bitmap_kind(),
            BitmapTarget::Block,
            start,
            end,
            real_end,
            descr,
        )?;
        map.set_cluster_bits(self.cluster_ratio_bits);
        Ok(map)
    }

    /// Allocates an empty inode bitmap for this filesystem.
    pub fn allocate_inode_bitmap(&self, descr: &str) -> Result<Bitmap> {
        let start = 1;
        let end = u64::from(u32::from_le(self.sb.s_inodes_count));
        let real_end = u64::from(u32::from_le(self.sb.s_inodes_per_group))
            * u64::from(self.group_desc_count);
        Bitmap::alloc(
            self.resolve_bitmap_kind(),
            BitmapTarget::Inode,
            start,
            end,
            real_end,
            descr,
        )
    }

    /// Reads the block and inode bitmaps from disk.
    pub fn read_bitmaps(&mut self) -> Result<()> {
        if self.block_map.is_some() && self.inode_map.is_some() {
            return Ok(());
        }
        let mut block_map = self.allocate_block_bitmap("block bitmap")?;
        let mut inode_map = self.allocate_inode_bitmap("inode bitmap")?;

        let cpg = u64::from(u32::from_le(self.sb.s_clusters_per_group));
        let ipg = u64::from(u32::from_le(self.sb.s_inodes_per_group));
        let mut blk_itr = block_map.start();
        let mut ino_itr = 1u64;
        let mut buf = vec![0u8; self.blocksize as usize];

        for group in 0..self.group_desc_count {
            let desc = self.group_desc[group as usize];

            if desc.flags_test(BG_BLOCK_UNINIT) {
                // Nothing on disk; the group's metadata is still in use
                self.uninit_group_blocks(group, &mut block_map);
            } else {
                self.io.read_block(desc.block_bitmap_loc(), &mut buf)?;
                if !self.block_bitmap_csum_valid(group, &desc, &buf) {
                    return Err(Error::BadChecksum);
                }
                block_map.set_range(blk_itr, cpg, &buf)?;
            }
            blk_itr += cpg;

            if desc.flags_test(BG_INODE_UNINIT) {
                // All inodes free
            } else {
                self.io.read_block(desc.inode_bitmap_loc(), &mut buf)?;
                if !self.inode_bitmap_csum_valid(group, &desc, &buf) {
                    return Err(Error::BadChecksum);
                }
                inode_map.set_range(ino_itr, ipg, &buf)?;
            }
            ino_itr += ipg;
        }

        self.block_map = Some(block_map);
        self.inode_map = Some(inode_map);
        Ok(())
    }

    /// Marks the metadata blocks of a `BLOCK_UNINIT` group.
    fn uninit_group_blocks(&self, group: Group, map: &mut Bitmap) {
        let (super_blk, old_desc_blk, new_desc_blk, _) = self.super_and_bgd_loc(group);
        if self.bg_has_super(group) {
            map.mark(super_blk);
        }
        if old_desc_blk != 0 {
            let count =
                self.desc_blocks + u64::from(u16::from_le(self.sb.s_reserved_gdt_blocks));
            map.mark_range(old_desc_blk, count);
        }
        if new_desc_blk != 0 {
            map.mark(new_desc_blk);
        }
        let desc = &self.group_desc[group as usize];
        map.mark(desc.block_bitmap_loc());
        map.mark(desc.inode_bitmap_loc());
        map.mark_range(
            desc.inode_table_loc(),
            u64::from(self.inode_blocks_per_group),
        );
    }

    fn bitmap_csum(&self, buf: &[u8]) -> u32 {
        crate::csum::crc32c(self.sb.csum_seed(), buf)
    }

    fn block_bitmap_csum_valid(&self, _group: Group, desc: &GroupDesc, buf: &[u8]) -> bool {
        if !self.sb.has_feature_metadata_csum() {
            return true;
        }
        let crc = self.bitmap_csum(buf);
        let mut stored = u32::from(u16::from_le(desc.bg_block_bitmap_csum_lo));
        if usize::from(self.sb.desc_size()) >= 64 {
            stored |= u32::from(u16::from_le(desc.bg_block_bitmap_csum_hi)) << 16;
            crc == stored
        } else {
            crc as u16 == stored as u16
        }
    }

    fn inode_bitmap_csum_valid(&self, _group: Group, desc: &GroupDesc, buf: &[u8]) -> bool {
        if !self.sb.has_feature_metadata_csum() {
            return true;
        }
        let crc = self.bitmap_csum(buf);
        let mut stored = u32::from(u16::from_le(desc.bg_inode_bitmap_csum_lo));
        if usize::from(self.sb.desc_size()) >= 64 {
            stored |= u32::from(u16::from_le(desc.bg_inode_bitmap_csum_hi)) << 16;
            crc == stored
        } else {
            crc as u16 == stored as u16
        }
    }

    /// Writes the block and inode bitmaps to disk.
    ///
    /// Bitmap checksums live in the group descriptors, so this must run
    /// before the descriptors are written.
    pub fn write_bitmaps(&mut self) -> Result<()> {
        if !self.rw {
            return Err(Error::ReadOnlyFilesystem);
        }
        let cpg = u64::from(u32::from_le(self.sb.s_clusters_per_group));
        let ipg = u64::from(u32::from_le(self.sb.s_inodes_per_group));
        let metadata_csum = self.sb.has_feature_metadata_csum();
        let wide_csum = usize::from(self.sb.desc_size()) >= 64;

        if let Some(map) = &mut self.block_map {
            map.set_padding();
        }
        if let Some(map) = &mut self.inode_map {
            map.set_padding();
        }

        let mut buf = vec![0u8; self.blocksize as usize];
        for group in 0..self.group_desc_count {
            let desc = self.group_desc[group as usize];

            if let Some(map) = &self.block_map {
                let itr = map.start() + u64::from(group) * cpg;
                buf.fill(0xFF);
                map.get_range(itr, cpg, &mut buf)?;
                if metadata_csum {
                    let crc = self.bitmap_csum(&buf);
                    let desc = &mut self.group_desc[group as usize];
                    desc.bg_block_bitmap_csum_lo = (crc as u16).to_le();
                    if wide_csum {
                        desc.bg_block_bitmap_csum_hi = ((crc >> 16) as u16).to_le();
                    }
                }
                self.io.write_block(desc.block_bitmap_loc(), &buf)?;
            }

            if let Some(map) = &self.inode_map {
                let itr = 1 + u64::from(group) * ipg;
                buf.fill(0xFF);
                map.get_range(itr, ipg, &mut buf)?;
                if metadata_csum {
                    let crc = self.bitmap_csum(&buf);
                    let desc = &mut self.group_desc[group as usize];
                    desc.bg_inode_bitmap_csum_lo = (crc as u16).to_le();
                    if wide_csum {
                        desc.bg_inode_bitmap_csum_hi = ((crc >> 16) as u16).to_le();
                    }
                }
                self.io.write_block(desc.inode_bitmap_loc(), &buf)?;
            }
            self.group_desc_csum_set(group);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Allocation

    /// Updates the accounting for a block allocation (`inuse > 0`) or
    /// release (`inuse < 0`).
    pub fn block_alloc_stats(&mut self, blk: Blk, inuse: i32) {
        let group = self.group_of_blk(blk);
        if let Some(map) = &mut self.block_map {
            let prev = if inuse > 0 {
                map.mark(blk)
            } else {
                map.unmark(blk)
            };
            // Counts follow the bitmap; a no-op mark must not skew them
            if prev == (inuse > 0) {
                return;
            }
        }
        let sb = self.sb;
        let desc = &mut self.group_desc[group as usize];
        desc.set_free_blocks_count((desc.free_blocks_count() as i64 - i64::from(inuse)) as u32);
        if inuse > 0 {
            desc.flags_clear(BG_BLOCK_UNINIT);
        }
        desc.csum_set(&sb, group);
        self.sb.free_blocks_count_add(-i64::from(inuse));
        self.dirty = true;
    }

    /// Updates the accounting for an inode allocation or release.
    pub fn inode_alloc_stats(&mut self, ino: Ino, inuse: i32, is_dir: bool) {
        let group = self.group_of_ino(ino);
        if let Some(map) = &mut self.inode_map {
            let prev = if inuse > 0 {
                map.mark(u64::from(ino))
            } else {
                map.unmark(u64::from(ino))
            };
            if prev == (inuse > 0) {
                return;
            }
        }
        let sb = self.sb;
        let desc = &mut self.group_desc[group as usize];
        desc.set_free_inodes_count((desc.free_inodes_count() as i64 - i64::from(inuse)) as u32);
        if is_dir {
            desc.set_used_dirs_count((desc.used_dirs_count() as i64 + i64::from(inuse)) as u32);
        }
        if inuse > 0 {
            desc.flags_clear(BG_INODE_UNINIT);
        }
        desc.csum_set(&sb, group);
        self.sb.s_free_inodes_count =
            ((u32::from_le(self.sb.s_free_inodes_count) as i64 - i64::from(inuse)) as u32)
                .to_le();
        self.dirty = true;
    }

    /// Finds a free block (cluster-aligned under bigalloc) near `goal`.
    ///
    /// The block is not marked; use [`Ext2Fs::block_alloc_stats`] or
    /// [`Ext2Fs::alloc_block`].
    pub fn new_block(&mut self, goal: Blk) -> Result<Blk> {
        self.read_bitmaps()?;
        let first = u64::from(u32::from_le(self.sb.s_first_data_block));
        let last = self.sb.blocks_count() - 1;
        let goal = if goal == 0 || goal > last { first } else { goal };
        let map = self.block_map.as_ref().unwrap();
        if let Some(blk) = map.find_first_zero(goal, last) {
            return Ok(blk);
        }
        if goal > first {
            if let Some(blk) = map.find_first_zero(first, goal - 1) {
                return Ok(blk);
            }
        }
        Err(Error::BlockAllocFail)
    }

    /// Allocates a block near `goal`: finds it, zeroes it and marks it used.
    pub fn alloc_block(&mut self, goal: Blk) -> Result<Blk> {
        let blk = self.new_block(goal)?;
        self.zero_blocks(blk, 1)?;
        self.block_alloc_stats(blk, 1);
        Ok(blk)
    }

    /// Finds a free inode, preferring the group holding `dir`.
    ///
    /// The inode is not marked; use [`Ext2Fs::inode_alloc_stats`].
    pub fn new_inode(&mut self, dir: Ino) -> Result<Ino> {
        self.read_bitmaps()?;
        let ipg = u32::from_le(self.sb.s_inodes_per_group);
        let count = u32::from_le(self.sb.s_inodes_count);
        let first = self.sb.first_ino().max(1);
        let start = if dir > 0 {
            (self.group_of_ino(dir) * ipg + 1).max(first)
        } else {
            first
        };
        let map = self.inode_map.as_ref().unwrap();
        if let Some(ino) = map.find_first_zero(u64::from(start), u64::from(count)) {
            return Ok(ino as Ino);
        }
        if start > first {
            if let Some(ino) = map.find_first_zero(u64::from(first), u64::from(start) - 1) {
                return Ok(ino as Ino);
            }
        }
        Err(Error::InodeAllocFail)
    }

    /// Finds a run of `num` free blocks in `start..=finish`.
    pub fn get_free_blocks(&mut self, start: Blk, finish: Blk, num: u64) -> Result<Blk> {
        self.read_bitmaps()?;
        let first = u64::from(u32::from_le(self.sb.s_first_data_block));
        let mut b = if start == 0 { first } else { start };
        let finish = finish.min(self.sb.blocks_count() - 1);
        let map = self.block_map.as_ref().unwrap();
        while b + num - 1 <= finish {
            let Some(found) = map.find_first_zero(b, finish) else {
                break;
            };
            if found + num - 1 > finish {
                break;
            }
            if map.test_clear_range(found, num) {
                return Ok(found);
            }
            b = found + u64::from(self.cluster_ratio());
        }
        Err(Error::BlockAllocFail)
    }

    /// Returns an allocation goal derived from the inode's location.
    pub fn find_inode_goal(&self, ino: Ino, inode: &Inode) -> Blk {
        // Prefer the neighborhood of the inode's existing blocks
        if inode.flags() & crate::inode::EXTENTS_FL == 0 {
            for i in (0..crate::inode::N_BLOCKS).rev() {
                let blk = inode.block(i);
                if blk != 0 {
                    return u64::from(blk);
                }
            }
        }
        let group = self.group_of_ino(ino);
        self.group_first_block(group) + u64::from(self.inode_blocks_per_group)
    }

    // ------------------------------------------------------------------
    // Inode table access

    /// Returns the byte offset of the given inode in its table.
    fn inode_offset(&self, ino: Ino) -> Result<(Blk, u64)> {
        if ino == 0 || ino > u32::from_le(self.sb.s_inodes_count) {
            return Err(Error::InvalidArgument);
        }
        let ipg = u32::from_le(self.sb.s_inodes_per_group);
        let group = (ino - 1) / ipg;
        let index = u64::from((ino - 1) % ipg);
        let table = self.group_desc[group as usize].inode_table_loc();
        if table == 0 {
            return Err(Error::InvalidArgument);
        }
        let off = index * u64::from(self.sb.inode_size());
        Ok((
            table + off / u64::from(self.blocksize),
            off % u64::from(self.blocksize),
        ))
    }

    /// Reads the raw on-disk record of the given inode.
    pub fn read_inode_full(&mut self, ino: Ino) -> Result<Vec<u8>> {
        let (blk, off) = self.inode_offset(ino)?;
        let inode_size = usize::from(self.sb.inode_size());
        let mut block = vec![0u8; self.blocksize as usize];
        self.io.read_block(blk, &mut block)?;
        Ok(block[off as usize..off as usize + inode_size].to_vec())
    }

    /// Writes the raw on-disk record of the given inode.
    pub fn write_inode_full(&mut self, ino: Ino, buf: &mut [u8]) -> Result<()> {
        if !self.rw {
            return Err(Error::ReadOnlyFilesystem);
        }
        inode_csum_set(&self.sb, ino, buf);
        let (blk, off) = self.inode_offset(ino)?;
        let mut block = vec![0u8; self.blocksize as usize];
        self.io.read_block(blk, &mut block)?;
        block[off as usize..off as usize + buf.len()].copy_from_slice(buf);
        self.io.write_block(blk, &block)?;
        self.icache.invalidate(ino);
        self.dirty = true;
        Ok(())
    }

    /// Reads the given inode.
    pub fn read_inode(&mut self, ino: Ino) -> Result<Inode> {
        if let Some(inode) = self.icache.get(ino) {
            return Ok(*inode);
        }
        let raw = self.read_inode_full(ino)?;
        let mut inode = Inode::new();
        let n = raw.len().min(size_of::<Inode>());
        as_bytes_mut(&mut inode)[..n].copy_from_slice(&raw[..n]);
        self.icache.put(ino, inode);
        Ok(inode)
    }

    /// Writes the given inode, preserving any in-inode extended attributes
    /// beyond the record.
    pub fn write_inode(&mut self, ino: Ino, inode: &Inode) -> Result<()> {
        let mut raw = self.read_inode_full(ino)?;
        let n = raw.len().min(size_of::<Inode>());
        raw[..n].copy_from_slice(&as_bytes(inode)[..n]);
        self.write_inode_full(ino, &mut raw)?;
        self.icache.put(ino, *inode);
        Ok(())
    }

    /// Writes a freshly created inode, stamping times and generation.
    pub fn write_new_inode(&mut self, ino: Ino, inode: &mut Inode) -> Result<()> {
        let now = timestamp();
        inode.i_atime = now.to_le();
        inode.i_ctime = now.to_le();
        inode.i_mtime = now.to_le();
        inode.i_crtime = now.to_le();
        if u16::from_le(self.sb.s_min_extra_isize) > 0 {
            inode.i_extra_isize = self.sb.s_min_extra_isize;
        } else if usize::from(self.sb.inode_size()) > 128 {
            inode.i_extra_isize = 32u16.to_le();
        }
        self.write_inode(ino, inode)
    }

    /// Ensures the given inode refers to a directory.
    pub fn check_directory(&mut self, ino: Ino) -> Result<()> {
        let inode = self.read_inode(ino)?;
        if inode.is_dir() {
            Ok(())
        } else {
            Err(Error::NotADirectory)
        }
    }

    // ------------------------------------------------------------------
    // Superblock and descriptor locations

    fn test_root(mut a: u32, b: u32) -> bool {
        loop {
            if a < b {
                return false;
            }
            if a == b {
                return true;
            }
            if a % b != 0 {
                return false;
            }
            a /= b;
        }
    }

    /// Tells whether the given group holds a superblock backup.
    pub fn bg_has_super(&self, group: Group) -> bool {
        if group == 0 {
            return true;
        }
        if self.sb.has_feature_sparse_super2() {
            return group == u32::from_le(self.sb.s_backup_bgs[0])
                || group == u32::from_le(self.sb.s_backup_bgs[1]);
        }
        if group <= 1 || !self.sb.has_feature_sparse_super() {
            return true;
        }
        if group & 1 == 0 {
            return false;
        }
        Self::test_root(group, 3) || Self::test_root(group, 5) || Self::test_root(group, 7)
    }

    /// Returns `(super_blk, old_desc_blk, new_desc_blk, used_blks)` for the
    /// given group, honoring `sparse_super`, `sparse_super2` and `meta_bg`.
    pub fn super_and_bgd_loc(&self, group: Group) -> (Blk, Blk, Blk, u32) {
        let mut group_block = self.group_first_block(group);
        if group_block == 0 && self.blocksize == 1024 {
            // 1 KiB blocksize with bigalloc: the superblock lives in block 1
            group_block = 1;
        }
        let old_desc_blocks = if self.sb.has_feature_meta_bg() {
            u64::from(u32::from_le(self.sb.s_first_meta_bg))
        } else {
            self.desc_blocks + u64::from(u16::from_le(self.sb.s_reserved_gdt_blocks))
        };

        let has_super = self.bg_has_super(group);
        let mut super_blk = 0;
        let mut old_desc_blk = 0;
        let mut new_desc_blk = 0;
        let mut numblocks = 0u32;
        if has_super {
            super_blk = group_block;
            numblocks += 1;
        }
        let meta_bg_size = self.sb.desc_per_block();
        let meta_bg = group / meta_bg_size;
        if !self.sb.has_feature_meta_bg() || meta_bg < u32::from_le(self.sb.s_first_meta_bg) {
            if has_super {
                old_desc_blk = group_block + 1;
                numblocks += old_desc_blocks as u32;
            }
        } else if group % meta_bg_size == 0
            || group % meta_bg_size == 1
            || group % meta_bg_size == meta_bg_size - 1
        {
            new_desc_blk = group_block + u64::from(has_super);
            numblocks += 1;
        }
        (super_blk, old_desc_blk, new_desc_blk, numblocks)
    }

    // ------------------------------------------------------------------
    // Group descriptor table I/O

    fn read_group_desc(&mut self) -> Result<()> {
        let desc_size = usize::from(self.sb.desc_size());
        let first = u64::from(u32::from_le(self.sb.s_first_data_block));
        let mut buf = vec![0u8; (self.desc_blocks * u64::from(self.blocksize)) as usize];
        if !self.sb.has_feature_meta_bg() {
            self.io.read_block(first + 1, &mut buf)?;
        } else {
            let first_meta_bg = u64::from(u32::from_le(self.sb.s_first_meta_bg));
            let classic = first_meta_bg.min(self.desc_blocks);
            if classic > 0 {
                self.io.read_block(
                    first + 1,
                    &mut buf[..(classic * u64::from(self.blocksize)) as usize],
                )?;
            }
            // Each meta group keeps its descriptor block in its first group
            let per_block = u64::from(self.sb.desc_per_block());
            let mut blk_index = classic;
            while blk_index < self.desc_blocks {
                let meta_group = blk_index; // one descriptor block per meta group
                let first_group = (meta_group * per_block) as Group;
                let (_, _, new_desc_blk, _) = self.super_and_bgd_loc(first_group);
                let off = (blk_index * u64::from(self.blocksize)) as usize;
                self.io.read_block(
                    new_desc_blk,
                    &mut buf[off..off + self.blocksize as usize],
                )?;
                blk_index += 1;
            }
        }
        let sb = self.sb;
        self.group_desc = (0..self.group_desc_count as usize)
            .map(|i| {
                let mut desc = GroupDesc::default();
                let src = &buf[i * desc_size..(i + 1) * desc_size];
                as_bytes_mut(&mut desc)[..desc_size].copy_from_slice(src);
                if !desc.csum_verify(&sb, i as Group) {
                    log::warn!("group descriptor {i} checksum invalid");
                }
                desc
            })
            .collect();
        Ok(())
    }

    /// Serializes the whole descriptor table.
    fn group_desc_table_bytes(&self) -> Vec<u8> {
        let desc_size = usize::from(self.sb.desc_size());
        let mut buf = vec![0u8; (self.desc_blocks * u64::from(self.blocksize)) as usize];
        for (i, desc) in self.group_desc.iter().enumerate() {
            buf[i * desc_size..(i + 1) * desc_size]
                .copy_from_slice(&as_bytes(desc)[..desc_size]);
        }
        buf
    }

    // ------------------------------------------------------------------
    // Flush

    fn write_backup_super(&mut self, group: Group, blk: Blk) -> Result<()> {
        let mut shadow = self.sb;
        shadow.s_block_group_nr = (group.min((1 << 16) - 1) as u16).to_le();
        shadow.csum_set();
        let bytes = as_bytes(&shadow).to_vec();
        self.io.write_block(blk, &bytes)
    }

    /// Writes only the superblock fields that changed since the last read
    /// or commit, falling back to a whole-record write.
    fn write_primary_superblock(&mut self) -> Result<()> {
        let new_bytes = as_bytes(&self.sb).to_vec();
        let fallback = match &self.orig_sb {
            Some(orig) => {
                let old_bytes = as_bytes(orig);
                let mut i = 0;
                let mut err = None;
                while i < SUPERBLOCK_SIZE {
                    if old_bytes[i] == new_bytes[i] {
                        i += 1;
                        continue;
                    }
                    let start = i;
                    while i < SUPERBLOCK_SIZE && old_bytes[i] != new_bytes[i] {
                        i += 1;
                    }
                    match self.io.write_byte(
                        SUPERBLOCK_OFFSET + start as u64,
                        &new_bytes[start..i],
                    ) {
                        Ok(()) => {}
                        Err(Error::Unimplemented) => {
                            err = Some(Error::Unimplemented);
                            break;
                        }
                        Err(e) => return Err(e),
                    }
                }
                err.is_some()
            }
            None => true,
        };
        if fallback {
            let blocksize = self.blocksize;
            self.io.set_block_size(1024)?;
            let res = self.io.write_block(SUPERBLOCK_OFFSET / 1024, &new_bytes);
            self.io.set_block_size(blocksize)?;
            res?;
        }
        self.orig_sb = Some(self.sb);
        Ok(())
    }

    /// Commits all in-memory state to disk.
    ///
    /// Ordering is an invariant: bitmaps before descriptors (descriptors
    /// hold bitmap checksums), descriptors and backups before the primary
    /// superblock (the commit point).
    pub fn flush(&mut self) -> Result<()> {
        self.flush2(false)
    }

    /// Like [`Ext2Fs::flush`], optionally skipping the final sync.
    pub fn flush2(&mut self, no_sync: bool) -> Result<()> {
        if !self.rw {
            return Err(Error::ReadOnlyFilesystem);
        }
        let fs_state = self.sb.s_state;
        let feature_incompat = self.sb.s_feature_incompat;
        self.sb.s_wtime = timestamp().to_le();
        self.sb.s_block_group_nr = 0;

        if self.block_map.is_some() || self.inode_map.is_some() {
            self.write_bitmaps()?;
        }

        // Invalid until the primary superblock goes out
        self.sb.s_state = (u16::from_le(self.sb.s_state) & !STATE_VALID_FS).to_le();
        self.sb.s_feature_incompat =
            (u32::from_le(self.sb.s_feature_incompat) & !sb::FEATURE_INCOMPAT_RECOVER).to_le();

        let res = self.flush_descriptors_and_backups();

        self.sb.s_block_group_nr = 0;
        self.sb.s_state = fs_state;
        self.sb.s_feature_incompat = feature_incompat;
        res?;

        if !no_sync {
            self.io.flush()?;
        }
        self.sb.csum_set();
        self.write_primary_superblock()?;
        self.dirty = false;
        if !no_sync {
            self.io.flush()?;
        }
        Ok(())
    }

    fn flush_descriptors_and_backups(&mut self) -> Result<()> {
        // External journal devices carry no descriptors or backups
        if self.sb.has_feature_journal_dev() {
            return Ok(());
        }
        let group_ptr = self.group_desc_table_bytes();
        let old_desc_blocks = if self.sb.has_feature_meta_bg() {
            u64::from(u32::from_le(self.sb.s_first_meta_bg)).min(self.desc_blocks)
        } else {
            self.desc_blocks
        };
        let desc_per_block = u64::from(self.sb.desc_per_block());

        for group in 0..self.group_desc_count {
            let (super_blk, old_desc_blk, new_desc_blk, _) = self.super_and_bgd_loc(group);

            if !self.master_sb_only && group != 0 && super_blk != 0 {
                self.write_backup_super(group, super_blk)?;
            }
            if self.super_only {
                continue;
            }
            if old_desc_blk != 0 && (!self.master_sb_only || group == 0) {
                let len = (old_desc_blocks * u64::from(self.blocksize)) as usize;
                self.io.write_block(old_desc_blk, &group_ptr[..len])?;
            }
            if new_desc_blk != 0 {
                let meta_bg = u64::from(group) / desc_per_block;
                let off = (meta_bg * u64::from(self.blocksize)) as usize;
                self.io.write_block(
                    new_desc_blk,
                    &group_ptr[off..off + self.blocksize as usize],
                )?;
            }
        }
        Ok(())
    }

    /// Flushes if dirty, accounts written kilobytes, and consumes the handle.
    pub fn close(mut self) -> Result<()> {
        if self.rw {
            let stats = self.io.stats();
            if u64::from_le(self.sb.s_kbytes_written) != 0 || stats.bytes_written != 0 {
                self.sb.s_kbytes_written = (u64::from_le(self.sb.s_kbytes_written)
                    + (stats.bytes_written >> 10))
                    .to_le();
                self.dirty = true;
            }
            if self.dirty {
                self.flush()?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::io::FileIo;

    pub(crate) fn temp_image(len: u64) -> (std::path::PathBuf, Box<dyn IoChannel>) {
        let path = std::env::temp_dir().join(format!("e2img-fs-{}", uuid::Uuid::new_v4()));
        let file = std::fs::File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .unwrap();
        file.set_len(len).unwrap();
        (path, Box::new(FileIo::from_file(file)))
    }

    #[test]
    fn initialize_small_image() {
        let (path, io) = temp_image(16 << 20);
        let fs = Ext2Fs::initialize(io, &FsParams::default()).unwrap();
        assert_eq!(fs.sb.blocks_count(), 16384);
        assert_eq!(fs.group_count(), 2);
        assert_eq!(
            u32::from_le(fs.sb.s_free_inodes_count),
            u32::from_le(fs.sb.s_inodes_count) - 11
        );
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn bg_has_super_powers() {
        let (path, io) = temp_image(1 << 20);
        let mut fs = Ext2Fs::initialize(io, &FsParams::default()).unwrap();
        fs.sb.s_feature_ro_compat = sb::FEATURE_RO_COMPAT_SPARSE_SUPER.to_le();
        for (group, expect) in [
            (0u32, true),
            (1, true),
            (2, false),
            (3, true),
            (5, true),
            (7, true),
            (9, true),
            (10, false),
            (25, true),
            (27, true),
            (49, true),
            (50, false),
        ] {
            assert_eq!(fs.bg_has_super(group), expect, "group {group}");
        }
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn alloc_stats_roundtrip() {
        let (path, io) = temp_image(8 << 20);
        let mut fs = Ext2Fs::initialize(io, &FsParams::default()).unwrap();
        let free = fs.sb.free_blocks_count();
        let blk = fs.new_block(0).unwrap();
        fs.block_alloc_stats(blk, 1);
        assert_eq!(fs.sb.free_blocks_count(), free - 1);
        assert!(fs.block_map.as_ref().unwrap().test(blk));
        fs.block_alloc_stats(blk, -1);
        assert_eq!(fs.sb.free_blocks_count(), free);
        assert!(!fs.block_map.as_ref().unwrap().test(blk));
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn flush_and_reopen_roundtrip() {
        let path = std::env::temp_dir().join(format!("e2img-flush-{}", uuid::Uuid::new_v4()));
        let file = std::fs::File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .unwrap();
        file.set_len(16 << 20).unwrap();
        let io: Box<dyn IoChannel> = Box::new(FileIo::from_file(file));

        let mut fs = Ext2Fs::initialize(io, &FsParams::default()).unwrap();
        crate::alloc_tables::allocate_tables(&mut fs).unwrap();
        crate::dir::mkdir(&mut fs, crate::ROOT_INO, Some(crate::ROOT_INO), None).unwrap();
        let uuid = fs.sb.s_uuid;
        let free_blocks = fs.sb.free_blocks_count();
        let free_inodes = u32::from_le(fs.sb.s_free_inodes_count);
        let bitmap_loc = fs.group_desc(0).block_bitmap_loc();
        fs.close().unwrap();

        // The primary superblock sits at byte 1024 with the magic at +56
        let raw = std::fs::read(&path).unwrap();
        assert_eq!(&raw[1080..1082], &[0x53, 0xEF]);

        let io: Box<dyn IoChannel> = Box::new(FileIo::open(&path, true).unwrap());
        let mut back = Ext2Fs::open(io, true).unwrap();
        back.read_bitmaps().unwrap();
        assert_eq!(back.sb.s_uuid, uuid);
        assert_eq!(back.sb.free_blocks_count(), free_blocks);
        assert_eq!(u32::from_le(back.sb.s_free_inodes_count), free_inodes);
        assert_eq!(back.group_desc(0).block_bitmap_loc(), bitmap_loc);
        // Metadata read back as allocated
        assert!(back.block_map.as_ref().unwrap().test(bitmap_loc));
        let root = back.read_inode(crate::ROOT_INO).unwrap();
        assert!(root.is_dir());
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn get_free_blocks_finds_runs() {
        let (path, io) = temp_image(8 << 20);
        let mut fs = Ext2Fs::initialize(io, &FsParams::default()).unwrap();
        let run = fs.get_free_blocks(0, fs.sb.blocks_count() - 1, 64).unwrap();
        assert!(
            fs.block_map
                .as_ref()
                .unwrap()
                .test_clear_range(run, 64)
        );
        std::fs::remove_file(path).unwrap();
    }
}
