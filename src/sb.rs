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

//! The on-disk superblock.
//!
//! All multi-byte fields are little-endian on disk. Fields split into lo/hi
//! halves are accessed through the typed accessors so byte order and width
//! handling stay in one place.

use crate::csum::crc32c;

/// The offset of the primary superblock from the beginning of the device.
pub const SUPERBLOCK_OFFSET: u64 = 1024;
/// The size of the superblock record in bytes.
pub const SUPERBLOCK_SIZE: usize = 1024;
/// The filesystem's signature, at offset 56 of the superblock.
pub const EXT2_MAGIC: u16 = 0xEF53;

/// First non-reserved inode for old-revision filesystems.
pub const GOOD_OLD_FIRST_INO: u32 = 11;
/// Inode size for old-revision filesystems.
pub const GOOD_OLD_INODE_SIZE: u16 = 128;
/// Revision with dynamic inode sizes and feature flags.
pub const DYNAMIC_REV: u32 = 1;

/// Filesystem state: cleanly unmounted.
pub const STATE_VALID_FS: u16 = 0x0001;
/// Filesystem state: errors detected.
pub const STATE_ERROR_FS: u16 = 0x0002;

/// Superblock flag: signed directory hash in use.
pub const FLAGS_SIGNED_HASH: u32 = 0x0001;
/// Superblock flag: unsigned directory hash in use.
pub const FLAGS_UNSIGNED_HASH: u32 = 0x0002;

// Compatible feature flags
pub const FEATURE_COMPAT_DIR_PREALLOC: u32 = 0x0001;
pub const FEATURE_COMPAT_HAS_JOURNAL: u32 = 0x0004;
pub const FEATURE_COMPAT_EXT_ATTR: u32 = 0x0008;
pub const FEATURE_COMPAT_RESIZE_INODE: u32 = 0x0010;
pub const FEATURE_COMPAT_DIR_INDEX: u32 = 0x0020;
pub const FEATURE_COMPAT_SPARSE_SUPER2: u32 = 0x0200;

// Incompatible feature flags
pub const FEATURE_INCOMPAT_COMPRESSION: u32 = 0x0001;
pub const FEATURE_INCOMPAT_FILETYPE: u32 = 0x0002;
pub const FEATURE_INCOMPAT_RECOVER: u32 = 0x0004;
pub const FEATURE_INCOMPAT_JOURNAL_DEV: u32 = 0x0008;
pub const FEATURE_INCOMPAT_META_BG: u32 = 0x0010;
pub const FEATURE_INCOMPAT_EXTENTS: u32 = 0x0040;
pub const FEATURE_INCOMPAT_64BIT: u32 = 0x0080;
pub const FEATURE_INCOMPAT_MMP: u32 = 0x0100;
pub const FEATURE_INCOMPAT_FLEX_BG: u32 = 0x0200;
pub const FEATURE_INCOMPAT_CSUM_SEED: u32 = 0x2000;
pub const FEATURE_INCOMPAT_LARGEDIR: u32 = 0x4000;
pub const FEATURE_INCOMPAT_INLINE_DATA: u32 = 0x8000;
pub const FEATURE_INCOMPAT_CASEFOLD: u32 = 0x20000;

// Read-only compatible feature flags
pub const FEATURE_RO_COMPAT_SPARSE_SUPER: u32 = 0x0001;
pub const FEATURE_RO_COMPAT_LARGE_FILE: u32 = 0x0002;
pub const FEATURE_RO_COMPAT_HUGE_FILE: u32 = 0x0008;
pub const FEATURE_RO_COMPAT_GDT_CSUM: u32 = 0x0010;
pub const FEATURE_RO_COMPAT_DIR_NLINK: u32 = 0x0020;
pub const FEATURE_RO_COMPAT_EXTRA_ISIZE: u32 = 0x0040;
pub const FEATURE_RO_COMPAT_BIGALLOC: u32 = 0x0200;
pub const FEATURE_RO_COMPAT_METADATA_CSUM: u32 = 0x0400;

/// The ext2/3/4 superblock.
///
/// A fixed 1024-byte record beginning at byte offset 1024 of the device.
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct Superblock {
    pub s_inodes_count: u32,
    pub s_blocks_count_lo: u32,
    pub s_r_blocks_count_lo: u32,
    pub s_free_blocks_count_lo: u32,
    pub s_free_inodes_count: u32,
    pub s_first_data_block: u32,
    pub s_log_block_size: u32,
    pub s_log_cluster_size: u32,
    pub s_blocks_per_group: u32,
    pub s_clusters_per_group: u32,
    pub s_inodes_per_group: u32,
    pub s_mtime: u32,
    pub s_wtime: u32,
    pub s_mnt_count: u16,
    pub s_max_mnt_count: u16,
    pub s_magic: u16,
    pub s_state: u16,
    pub s_errors: u16,
    pub s_minor_rev_level: u16,
    pub s_lastcheck: u32,
    pub s_checkinterval: u32,
    pub s_creator_os: u32,
    pub s_rev_level: u32,
    pub s_def_resuid: u16,
    pub s_def_resgid: u16,

    // Dynamic revision fields
    pub s_first_ino: u32,
    pub s_inode_size: u16,
    pub s_block_group_nr: u16,
    pub s_feature_compat: u32,
    pub s_feature_incompat: u32,
    pub s_feature_ro_compat: u32,
    pub s_uuid: [u8; 16],
    pub s_volume_name: [u8; 16],
    pub s_last_mounted: [u8; 64],
    pub s_algorithm_usage_bitmap: u32,

    // Performance hints
    pub s_prealloc_blocks: u8,
    pub s_prealloc_dir_blocks: u8,
    pub s_reserved_gdt_blocks: u16,

    // Journaling support
    pub s_journal_uuid: [u8; 16],
    pub s_journal_inum: u32,
    pub s_journal_dev: u32,
    pub s_last_orphan: u32,
    pub s_hash_seed: [u32; 4],
    pub s_def_hash_version: u8,
    pub s_jnl_backup_type: u8,
    pub s_desc_size: u16,
    pub s_default_mount_opts: u32,
    pub s_first_meta_bg: u32,
    pub s_mkfs_time: u32,
    pub s_jnl_blocks: [u32; 17],

    // 64-bit support
    pub s_blocks_count_hi: u32,
    pub s_r_blocks_count_hi: u32,
    pub s_free_blocks_count_hi: u32,
    pub s_min_extra_isize: u16,
    pub s_want_extra_isize: u16,
    pub s_flags: u32,
    pub s_raid_stride: u16,
    pub s_mmp_interval: u16,
    pub s_mmp_block: u64,
    pub s_raid_stripe_width: u32,
    pub s_log_groups_per_flex: u8,
    pub s_checksum_type: u8,
    pub s_reserved_pad: u16,
    pub s_kbytes_written: u64,
    pub s_snapshot_inum: u32,
    pub s_snapshot_id: u32,
    pub s_snapshot_r_blocks_count: u64,
    pub s_snapshot_list: u32,
    pub s_error_count: u32,
    pub s_first_error_time: u32,
    pub s_first_error_ino: u32,
    pub s_first_error_block: u64,
    pub s_first_error_func: [u8; 32],
    pub s_first_error_line: u32,
    pub s_last_error_time: u32,
    pub s_last_error_ino: u32,
    pub s_last_error_line: u32,
    pub s_last_error_block: u64,
    pub s_last_error_func: [u8; 32],
    pub s_mount_opts: [u8; 64],
    pub s_usr_quota_inum: u32,
    pub s_grp_quota_inum: u32,
    pub s_overhead_blocks: u32,
    pub s_backup_bgs: [u32; 2],
    pub s_encrypt_algos: [u8; 4],
    pub s_encrypt_pw_salt: [u8; 16],
    pub s_lpf_ino: u32,
    pub s_prj_quota_inum: u32,
    pub s_checksum_seed: u32,
    pub s_reserved: [u32; 98],
    pub s_checksum: u32,
}

const _: () = assert!(size_of::<Superblock>() == SUPERBLOCK_SIZE);

impl Superblock {
    /// Returns a zeroed superblock.
    pub fn new() -> Self {
        unsafe { std::mem::zeroed() }
    }

    /// Returns the size of a block in bytes.
    pub fn block_size(&self) -> u32 {
        1024 << u32::from_le(self.s_log_block_size)
    }

    /// Returns `log2(block_size)`.
    pub fn block_size_bits(&self) -> u32 {
        10 + u32::from_le(self.s_log_block_size)
    }

    /// Returns the size of an allocation cluster in bytes.
    pub fn cluster_size(&self) -> u32 {
        1024 << u32::from_le(self.s_log_cluster_size)
    }

    /// Returns the number of blocks per allocation cluster.
    pub fn cluster_ratio_bits(&self) -> u32 {
        u32::from_le(self.s_log_cluster_size) - u32::from_le(self.s_log_block_size)
    }

    /// Returns the total number of blocks.
    pub fn blocks_count(&self) -> u64 {
        if self.has_feature_64bit() {
            u64::from(u32::from_le(self.s_blocks_count_lo))
                | (u64::from(u32::from_le(self.s_blocks_count_hi)) << 32)
        } else {
            u64::from(u32::from_le(self.s_blocks_count_lo))
        }
    }

    /// Sets the total number of blocks.
    pub fn set_blocks_count(&mut self, count: u64) {
        self.s_blocks_count_lo = (count as u32).to_le();
        self.s_blocks_count_hi = ((count >> 32) as u32).to_le();
    }

    /// Returns the number of free blocks.
    pub fn free_blocks_count(&self) -> u64 {
        u64::from(u32::from_le(self.s_free_blocks_count_lo))
            | (u64::from(u32::from_le(self.s_free_blocks_count_hi)) << 32)
    }

    /// Sets the number of free blocks.
    pub fn set_free_blocks_count(&mut self, count: u64) {
        self.s_free_blocks_count_lo = (count as u32).to_le();
        self.s_free_blocks_count_hi = ((count >> 32) as u32).to_le();
    }

    /// Adds `delta` to the free blocks count.
    pub fn free_blocks_count_add(&mut self, delta: i64) {
        let count = self.free_blocks_count() as i64 + delta;
        self.set_free_blocks_count(count as u64);
    }

    /// Returns the number of block groups.
    pub fn group_count(&self) -> u32 {
        let blocks = self.blocks_count() - u64::from(u32::from_le(self.s_first_data_block));
        crate::ceil_div(blocks, u64::from(u32::from_le(self.s_blocks_per_group))) as u32
    }

    /// Returns the size of an inode record in bytes.
    pub fn inode_size(&self) -> u16 {
        if u32::from_le(self.s_rev_level) >= DYNAMIC_REV {
            u16::from_le(self.s_inode_size)
        } else {
            GOOD_OLD_INODE_SIZE
        }
    }

    /// Returns the first non-reserved inode.
    pub fn first_ino(&self) -> u32 {
        if u32::from_le(self.s_rev_level) >= DYNAMIC_REV {
            u32::from_le(self.s_first_ino)
        } else {
            GOOD_OLD_FIRST_INO
        }
    }

    /// Returns the size of a group descriptor record in bytes.
    pub fn desc_size(&self) -> u16 {
        if self.has_feature_64bit() {
            let size = u16::from_le(self.s_desc_size);
            if size == 0 { 64 } else { size }
        } else {
            32
        }
    }

    /// Returns the number of group descriptors per block.
    pub fn desc_per_block(&self) -> u32 {
        self.block_size() / u32::from(self.desc_size())
    }

    pub fn has_feature_dir_index(&self) -> bool {
        u32::from_le(self.s_feature_compat) & FEATURE_COMPAT_DIR_INDEX != 0
    }

    pub fn has_feature_resize_inode(&self) -> bool {
        u32::from_le(self.s_feature_compat) & FEATURE_COMPAT_RESIZE_INODE != 0
    }

    pub fn has_feature_sparse_super2(&self) -> bool {
        u32::from_le(self.s_feature_compat) & FEATURE_COMPAT_SPARSE_SUPER2 != 0
    }

    pub fn has_feature_filetype(&self) -> bool {
        u32::from_le(self.s_feature_incompat) & FEATURE_INCOMPAT_FILETYPE != 0
    }

    pub fn has_feature_journal_dev(&self) -> bool {
        u32::from_le(self.s_feature_incompat) & FEATURE_INCOMPAT_JOURNAL_DEV != 0
    }

    pub fn has_feature_meta_bg(&self) -> bool {
        u32::from_le(self.s_feature_incompat) & FEATURE_INCOMPAT_META_BG != 0
    }

    pub fn has_feature_extents(&self) -> bool {
        u32::from_le(self.s_feature_incompat) & FEATURE_INCOMPAT_EXTENTS != 0
    }

    pub fn has_feature_64bit(&self) -> bool {
        u32::from_le(self.s_feature_incompat) & FEATURE_INCOMPAT_64BIT != 0
    }

    pub fn has_feature_flex_bg(&self) -> bool {
        u32::from_le(self.s_feature_incompat) & FEATURE_INCOMPAT_FLEX_BG != 0
    }

    pub fn has_feature_csum_seed(&self) -> bool {
        u32::from_le(self.s_feature_incompat) & FEATURE_INCOMPAT_CSUM_SEED != 0
    }

    pub fn has_feature_largedir(&self) -> bool {
        u32::from_le(self.s_feature_incompat) & FEATURE_INCOMPAT_LARGEDIR != 0
    }

    pub fn has_feature_inline_data(&self) -> bool {
        u32::from_le(self.s_feature_incompat) & FEATURE_INCOMPAT_INLINE_DATA != 0
    }

    pub fn has_feature_casefold(&self) -> bool {
        u32::from_le(self.s_feature_incompat) & FEATURE_INCOMPAT_CASEFOLD != 0
    }

    pub fn has_feature_sparse_super(&self) -> bool {
        u32::from_le(self.s_feature_ro_compat) & FEATURE_RO_COMPAT_SPARSE_SUPER != 0
    }

    pub fn has_feature_gdt_csum(&self) -> bool {
        u32::from_le(self.s_feature_ro_compat) & FEATURE_RO_COMPAT_GDT_CSUM != 0
    }

    pub fn has_feature_bigalloc(&self) -> bool {
        u32::from_le(self.s_feature_ro_compat) & FEATURE_RO_COMPAT_BIGALLOC != 0
    }

    pub fn has_feature_metadata_csum(&self) -> bool {
        u32::from_le(self.s_feature_ro_compat) & FEATURE_RO_COMPAT_METADATA_CSUM != 0
    }

    /// Tells whether group descriptors carry a checksum.
    pub fn has_group_desc_csum(&self) -> bool {
        self.has_feature_gdt_csum() || self.has_feature_metadata_csum()
    }

    /// Returns the seed used by all metadata checksums.
    pub fn csum_seed(&self) -> u32 {
        if self.has_feature_csum_seed() {
            u32::from_le(self.s_checksum_seed)
        } else {
            crc32c(!0, &self.s_uuid)
        }
    }

    /// Computes the superblock checksum.
    pub fn compute_csum(&self) -> u32 {
        let bytes = crate::as_bytes(self);
        crc32c(!0, &bytes[..SUPERBLOCK_SIZE - 4])
    }

    /// Refreshes the superblock checksum field.
    pub fn csum_set(&mut self) {
        if self.has_feature_metadata_csum() {
            self.s_checksum = self.compute_csum().to_le();
        }
    }

    /// Verifies the superblock checksum.
    pub fn csum_verify(&self) -> bool {
        !self.has_feature_metadata_csum() || u32::from_le(self.s_checksum) == self.compute_csum()
    }
}

impl Default for Superblock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample() -> Superblock {
        let mut sb = Superblock::new();
        sb.s_magic = EXT2_MAGIC.to_le();
        sb.s_log_block_size = 2u32.to_le(); // 4096
        sb.s_log_cluster_size = 2u32.to_le();
        sb.s_blocks_per_group = 32768u32.to_le();
        sb.s_inodes_per_group = 8192u32.to_le();
        sb.s_inodes_count = 8192u32.to_le();
        sb.s_rev_level = DYNAMIC_REV.to_le();
        sb.s_inode_size = 256u16.to_le();
        sb.s_first_ino = 11u32.to_le();
        sb.set_blocks_count(32768);
        sb
    }

    #[test]
    fn block_size_from_log() {
        let sb = sample();
        assert_eq!(sb.block_size(), 4096);
        assert_eq!(sb.block_size_bits(), 12);
    }

    #[test]
    fn split_counts_roundtrip() {
        let mut sb = sample();
        sb.s_feature_incompat = FEATURE_INCOMPAT_64BIT.to_le();
        sb.set_blocks_count(0x1_2345_6789);
        assert_eq!(sb.blocks_count(), 0x1_2345_6789);
        sb.set_free_blocks_count(0x2_0000_0001);
        sb.free_blocks_count_add(-2);
        assert_eq!(sb.free_blocks_count(), 0x1_FFFF_FFFF);
    }

    #[test]
    fn group_count_rounds_up() {
        let mut sb = sample();
        sb.set_blocks_count(32769);
        assert_eq!(sb.group_count(), 2);
    }

    #[test]
    fn csum_covers_all_but_last_field() {
        let mut sb = sample();
        sb.s_feature_ro_compat = FEATURE_RO_COMPAT_METADATA_CSUM.to_le();
        sb.csum_set();
        assert!(sb.csum_verify());
        sb.s_inodes_count = 1u32.to_le();
        assert!(!sb.csum_verify());
    }
}
