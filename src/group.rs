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

//! Block group descriptors.
//!
//! Descriptors are 32 bytes on classic filesystems and 64 bytes when the
//! `64bit` feature is set. The in-memory representation is always the 64-byte
//! record; on a 32-byte filesystem the high halves stay zero and only the
//! first 32 bytes are serialized.

use crate::Group;
use crate::csum::{crc16, crc32c};
use crate::sb::Superblock;

/// Group flag: inode table and bitmap are unused.
pub const BG_INODE_UNINIT: u16 = 0x0001;
/// Group flag: block bitmap is unused.
pub const BG_BLOCK_UNINIT: u16 = 0x0002;
/// Group flag: inode table is zeroed.
pub const BG_INODE_ZEROED: u16 = 0x0004;

/// Offset of the `bg_checksum` field inside the descriptor.
const CHECKSUM_OFFSET: usize = 0x1E;

/// A block group descriptor.
#[repr(C, packed)]
#[derive(Clone, Copy, Default)]
pub struct GroupDesc {
    pub bg_block_bitmap_lo: u32,
    pub bg_inode_bitmap_lo: u32,
    pub bg_inode_table_lo: u32,
    pub bg_free_blocks_count_lo: u16,
    pub bg_free_inodes_count_lo: u16,
    pub bg_used_dirs_count_lo: u16,
    pub bg_flags: u16,
    pub bg_exclude_bitmap_lo: u32,
    pub bg_block_bitmap_csum_lo: u16,
    pub bg_inode_bitmap_csum_lo: u16,
    pub bg_itable_unused_lo: u16,
    pub bg_checksum: u16,
    pub bg_block_bitmap_hi: u32,
    pub bg_inode_bitmap_hi: u32,
    pub bg_inode_table_hi: u32,
    pub bg_free_blocks_count_hi: u16,
    pub bg_free_inodes_count_hi: u16,
    pub bg_used_dirs_count_hi: u16,
    pub bg_itable_unused_hi: u16,
    pub bg_exclude_bitmap_hi: u32,
    pub bg_block_bitmap_csum_hi: u16,
    pub bg_inode_bitmap_csum_hi: u16,
    pub bg_reserved: u32,
}

const _: () = assert!(size_of::<GroupDesc>() == 64);

impl GroupDesc {
    /// Returns the location of the block bitmap.
    pub fn block_bitmap_loc(&self) -> u64 {
        u64::from(u32::from_le(self.bg_block_bitmap_lo))
            | (u64::from(u32::from_le(self.bg_block_bitmap_hi)) << 32)
    }

    /// Sets the location of the block bitmap.
    pub fn set_block_bitmap_loc(&mut self, blk: u64) {
        self.bg_block_bitmap_lo = (blk as u32).to_le();
        self.bg_block_bitmap_hi = ((blk >> 32) as u32).to_le();
    }

    /// Returns the location of the inode bitmap.
    pub fn inode_bitmap_loc(&self) -> u64 {
        u64::from(u32::from_le(self.bg_inode_bitmap_lo))
            | (u64::from(u32::from_le(self.bg_inode_bitmap_hi)) << 32)
    }

    /// Sets the location of the inode bitmap.
    pub fn set_inode_bitmap_loc(&mut self, blk: u64) {
        self.bg_inode_bitmap_lo = (blk as u32).to_le();
        self.bg_inode_bitmap_hi = ((blk >> 32) as u32).to_le();
    }

    /// Returns the first block of the inode table.
    pub fn inode_table_loc(&self) -> u64 {
        u64::from(u32::from_le(self.bg_inode_table_lo))
            | (u64::from(u32::from_le(self.bg_inode_table_hi)) << 32)
    }

    /// Sets the first block of the inode table.
    pub fn set_inode_table_loc(&mut self, blk: u64) {
        self.bg_inode_table_lo = (blk as u32).to_le();
        self.bg_inode_table_hi = ((blk >> 32) as u32).to_le();
    }

    /// Returns the number of free blocks in the group.
    pub fn free_blocks_count(&self) -> u32 {
        u32::from(u16::from_le(self.bg_free_blocks_count_lo))
            | (u32::from(u16::from_le(self.bg_free_blocks_count_hi)) << 16)
    }

    /// Sets the number of free blocks in the group.
    pub fn set_free_blocks_count(&mut self, count: u32) {
        self.bg_free_blocks_count_lo = (count as u16).to_le();
        self.bg_free_blocks_count_hi = ((count >> 16) as u16).to_le();
    }

    /// Returns the number of free inodes in the group.
    pub fn free_inodes_count(&self) -> u32 {
        u32::from(u16::from_le(self.bg_free_inodes_count_lo))
            | (u32::from(u16::from_le(self.bg_free_inodes_count_hi)) << 16)
    }

    /// Sets the number of free inodes in the group.
    pub fn set_free_inodes_count(&mut self, count: u32) {
        self.bg_free_inodes_count_lo = (count as u16).to_le();
        self.bg_free_inodes_count_hi = ((count >> 16) as u16).to_le();
    }

    /// Returns the number of directories in the group.
    pub fn used_dirs_count(&self) -> u32 {
        u32::from(u16::from_le(self.bg_used_dirs_count_lo))
            | (u32::from(u16::from_le(self.bg_used_dirs_count_hi)) << 16)
    }

    /// Sets the number of directories in the group.
    pub fn set_used_dirs_count(&mut self, count: u32) {
        self.bg_used_dirs_count_lo = (count as u16).to_le();
        self.bg_used_dirs_count_hi = ((count >> 16) as u16).to_le();
    }

    /// Returns the number of unused inodes at the end of the group's table.
    pub fn itable_unused(&self) -> u32 {
        u32::from(u16::from_le(self.bg_itable_unused_lo))
            | (u32::from(u16::from_le(self.bg_itable_unused_hi)) << 16)
    }

    /// Sets the number of unused inodes at the end of the group's table.
    pub fn set_itable_unused(&mut self, count: u32) {
        self.bg_itable_unused_lo = (count as u16).to_le();
        self.bg_itable_unused_hi = ((count >> 16) as u16).to_le();
    }

    /// Tells whether the given group flags are all set.
    pub fn flags_test(&self, flags: u16) -> bool {
        u16::from_le(self.bg_flags) & flags == flags
    }

    /// Sets the given group flags.
    pub fn flags_set(&mut self, flags: u16) {
        self.bg_flags = (u16::from_le(self.bg_flags) | flags).to_le();
    }

    /// Clears the given group flags.
    pub fn flags_clear(&mut self, flags: u16) {
        self.bg_flags = (u16::from_le(self.bg_flags) & !flags).to_le();
    }

    /// Computes the descriptor checksum for group `group`.
    pub fn compute_csum(&self, sb: &Superblock, group: Group) -> u16 {
        let bytes = crate::as_bytes(self);
        let size = usize::from(sb.desc_size());
        if sb.has_feature_metadata_csum() {
            let mut crc = crc32c(sb.csum_seed(), &group.to_le_bytes());
            crc = crc32c(crc, &bytes[..CHECKSUM_OFFSET]);
            crc = crc32c(crc, &[0, 0]);
            if size > 32 {
                crc = crc32c(crc, &bytes[CHECKSUM_OFFSET + 2..size]);
            }
            crc as u16
        } else if sb.has_feature_gdt_csum() {
            let mut crc = crc16(!0, &sb.s_uuid);
            crc = crc16(crc, &group.to_le_bytes());
            crc = crc16(crc, &bytes[..CHECKSUM_OFFSET]);
            if size > 32 {
                crc = crc16(crc, &bytes[CHECKSUM_OFFSET + 2..size]);
            }
            crc
        } else {
            0
        }
    }

    /// Refreshes the descriptor checksum.
    pub fn csum_set(&mut self, sb: &Superblock, group: Group) {
        if sb.has_group_desc_csum() {
            self.bg_checksum = self.compute_csum(sb, group).to_le();
        }
    }

    /// Verifies the descriptor checksum.
    pub fn csum_verify(&self, sb: &Superblock, group: Group) -> bool {
        !sb.has_group_desc_csum() || u16::from_le(self.bg_checksum) == self.compute_csum(sb, group)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sb;

    #[test]
    fn split_fields_roundtrip() {
        let mut desc = GroupDesc::default();
        desc.set_block_bitmap_loc(0x1_0000_0042);
        desc.set_free_blocks_count(0x12345);
        desc.set_itable_unused(7);
        assert_eq!(desc.block_bitmap_loc(), 0x1_0000_0042);
        assert_eq!(desc.free_blocks_count(), 0x12345);
        assert_eq!(desc.itable_unused(), 7);
    }

    #[test]
    fn flags() {
        let mut desc = GroupDesc::default();
        desc.flags_set(BG_BLOCK_UNINIT | BG_INODE_UNINIT);
        assert!(desc.flags_test(BG_BLOCK_UNINIT));
        desc.flags_clear(BG_BLOCK_UNINIT);
        assert!(!desc.flags_test(BG_BLOCK_UNINIT));
        assert!(desc.flags_test(BG_INODE_UNINIT));
    }

    #[test]
    fn csum_detects_change() {
        let mut s = Superblock::new();
        s.s_feature_ro_compat = sb::FEATURE_RO_COMPAT_METADATA_CSUM.to_le();
        s.s_uuid = [7; 16];
        let mut desc = GroupDesc::default();
        desc.set_block_bitmap_loc(12);
        desc.csum_set(&s, 3);
        assert!(desc.csum_verify(&s, 3));
        // Same descriptor hashed for another group must differ
        assert!(!desc.csum_verify(&s, 4));
        desc.set_free_blocks_count(9);
        assert!(!desc.csum_verify(&s, 3));
    }
}
