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

//! Directory blocks and operations.
//!
//! A directory block is a run of variable-length records
//! `{ inode, rec_len, name_len, file_type, name }`, each padded to a 4-byte
//! boundary, the last one stretching to the end of the block (minus the
//! checksum tail under `metadata_csum`). On 64 KiB blocks `rec_len` uses a
//! 16-bit wrap encoding.

pub mod hash;
pub mod htree;

use crate::blockiter::{BLOCK_ABORT, BLOCK_FLAG_READ_ONLY, block_iterate};
use crate::bmap::{BMAP_ALLOC, BMAP_RET_UNINIT, BMAP_ZERO, bmap2};
use crate::csum::crc32c;
use crate::error::{Error, Result};
use crate::extent::ExtentHandle;
use crate::fs::Ext2Fs;
use crate::inline;
use crate::inode::{EXTENTS_FL, INDEX_FL, INLINE_DATA_FL, Inode, S_IFDIR};
use crate::{Blk, Ino};

/// Directory entry type: unknown.
pub const FT_UNKNOWN: u8 = 0;
/// Directory entry type: regular file.
pub const FT_REG_FILE: u8 = 1;
/// Directory entry type: directory.
pub const FT_DIR: u8 = 2;
/// Directory entry type: symbolic link.
pub const FT_SYMLINK: u8 = 7;

/// Encoded `name_len`/`file_type` pair marking a checksum tail record.
const DIR_NAME_LEN_CSUM: u16 = 0xDE00;
/// Size of the checksum tail record.
pub const DIRENT_TAIL_SIZE: usize = 12;
/// Maximum encodable record length.
const MAX_REC_LEN: u32 = (1 << 16) - 1;

/// Iteration flag: report empty (deleted) records too.
pub const DIRENT_FLAG_INCLUDE_EMPTY: u32 = 0x0001;
/// Iteration flag: scan the slack of coalesced records for removed entries.
pub const DIRENT_FLAG_INCLUDE_REMOVED: u32 = 0x0002;
/// Iteration flag: report the checksum tail record.
pub const DIRENT_FLAG_INCLUDE_CSUM: u32 = 0x0004;

/// Callback result: the record was modified in place.
pub const DIRENT_CHANGED: u32 = 0x0001;
/// Callback result: stop iterating.
pub const DIRENT_ABORT: u32 = 0x0002;

/// What kind of record the iteration callback is looking at.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DirentKind {
    Dot,
    DotDot,
    Other,
    Deleted,
    Checksum,
}

/// The directory iteration callback.
///
/// Arguments: record kind, byte offset of the record, the block buffer.
pub type DirentFn<'f> = dyn FnMut(DirentKind, usize, &mut [u8]) -> Result<u32> + 'f;

// ------------------------------------------------------------------
// Record accessors

/// Returns the inode field of the record at `off`.
pub fn dirent_ino(buf: &[u8], off: usize) -> Ino {
    u32::from_le_bytes(buf[off..off + 4].try_into().unwrap())
}

/// Sets the inode field of the record at `off`.
pub fn set_dirent_ino(buf: &mut [u8], off: usize, ino: Ino) {
    buf[off..off + 4].copy_from_slice(&ino.to_le_bytes());
}

/// Returns the name length of the record at `off`.
pub fn dirent_name_len(buf: &[u8], off: usize) -> usize {
    usize::from(buf[off + 6])
}

/// Returns the file type of the record at `off`.
pub fn dirent_file_type(buf: &[u8], off: usize) -> u8 {
    buf[off + 7]
}

/// Returns the name bytes of the record at `off`.
pub fn dirent_name(buf: &[u8], off: usize) -> &[u8] {
    let len = dirent_name_len(buf, off);
    &buf[off + 8..off + 8 + len]
}

/// Decodes the record length at `off`, undoing the 64 KiB wrap encoding.
pub fn get_rec_len(block_size: u32, buf: &[u8], off: usize) -> u32 {
    let stored = u32::from(u16::from_le_bytes([buf[off + 4], buf[off + 5]]));
    if block_size < 65536 {
        stored
    } else if stored == MAX_REC_LEN || stored == 0 {
        block_size
    } else {
        (stored & 65532) | ((stored & 3) << 16)
    }
}

/// Encodes the record length at `off`.
pub fn set_rec_len(block_size: u32, len: u32, buf: &mut [u8], off: usize) -> Result<()> {
    if len > block_size || block_size > (1 << 18) || len & 3 != 0 {
        return Err(Error::InvalidArgument);
    }
    let stored = if len < 65536 {
        len as u16
    } else if len == block_size {
        if block_size == 65536 {
            MAX_REC_LEN as u16
        } else {
            0
        }
    } else {
        ((len & 65532) | ((len >> 16) & 3)) as u16
    };
    buf[off + 4..off + 6].copy_from_slice(&stored.to_le_bytes());
    Ok(())
}

/// Returns the space needed by a record with an `name_len`-byte name.
pub const fn dir_rec_len(name_len: usize) -> u32 {
    ((name_len + 8 + 3) & !3) as u32
}

/// Writes a complete record at `off`.
#[allow(clippy::too_many_arguments)]
fn put_dirent(
    block_size: u32,
    buf: &mut [u8],
    off: usize,
    ino: Ino,
    rec_len: u32,
    name: &[u8],
    file_type: u8,
    filetype_feature: bool,
) -> Result<()> {
    set_dirent_ino(buf, off, ino);
    set_rec_len(block_size, rec_len, buf, off)?;
    buf[off + 6] = name.len() as u8;
    buf[off + 7] = if filetype_feature { file_type } else { 0 };
    buf[off + 8..off + 8 + name.len()].copy_from_slice(name);
    Ok(())
}

// ------------------------------------------------------------------
// Block checksums

/// Writes the checksum tail record at the end of the block.
pub fn initialize_dirent_tail(block_size: u32, buf: &mut [u8]) {
    let off = block_size as usize - DIRENT_TAIL_SIZE;
    buf[off..off + 4].fill(0);
    buf[off + 4..off + 6].copy_from_slice(&(DIRENT_TAIL_SIZE as u16).to_le_bytes());
    buf[off + 6..off + 8].copy_from_slice(&DIR_NAME_LEN_CSUM.to_le_bytes());
    buf[off + 8..off + 12].fill(0);
}

/// Tells whether the block carries a checksum tail record.
fn has_dirent_tail(block_size: u32, buf: &[u8]) -> bool {
    let off = block_size as usize - DIRENT_TAIL_SIZE;
    u16::from_le_bytes([buf[off + 4], buf[off + 5]]) == DIRENT_TAIL_SIZE as u16
        && u16::from_le_bytes([buf[off + 6], buf[off + 7]]) == DIR_NAME_LEN_CSUM
}

fn dir_block_csum(fs: &mut Ext2Fs, dir: Ino, buf: &[u8]) -> Result<u32> {
    let inode = fs.read_inode(dir)?;
    let mut crc = crc32c(fs.sb.csum_seed(), &dir.to_le_bytes());
    crc = crc32c(crc, &u32::from_le(inode.i_generation).to_le_bytes());
    Ok(crc32c(crc, &buf[..buf.len() - DIRENT_TAIL_SIZE]))
}

/// Reads a directory block, verifying its checksum when present.
///
/// HTree index blocks carry their own tail and are verified by the HTree
/// code; they pass through here unchecked.
pub fn read_dir_block(fs: &mut Ext2Fs, blk: Blk, buf: &mut [u8], dir: Ino) -> Result<()> {
    fs.read_blk(blk, buf)?;
    if fs.sb.has_feature_metadata_csum() && has_dirent_tail(fs.block_size(), buf) {
        let tail_off = fs.block_size() as usize - DIRENT_TAIL_SIZE;
        let stored = u32::from_le_bytes(buf[tail_off + 8..tail_off + 12].try_into().unwrap());
        if stored != dir_block_csum(fs, dir, buf)? {
            return Err(Error::BadChecksum);
        }
    }
    Ok(())
}

/// Writes a directory block, refreshing its checksum when present.
pub fn write_dir_block(fs: &mut Ext2Fs, blk: Blk, buf: &mut [u8], dir: Ino) -> Result<()> {
    if fs.sb.has_feature_metadata_csum() && has_dirent_tail(fs.block_size(), buf) {
        let crc = dir_block_csum(fs, dir, buf)?;
        let tail_off = fs.block_size() as usize - DIRENT_TAIL_SIZE;
        buf[tail_off + 8..tail_off + 12].copy_from_slice(&crc.to_le_bytes());
    }
    fs.write_blk(blk, buf)
}

/// Maps a directory's logical block and reads it.
pub(crate) fn load_logical_dir_block(
    fs: &mut Ext2Fs,
    dir: Ino,
    diri: &mut Inode,
    lblk: Blk,
    buf: &mut [u8],
) -> Result<Blk> {
    let mut pblk = 0;
    let ret_flags = bmap2(fs, dir, diri, 0, lblk, &mut pblk)?;
    if ret_flags & BMAP_RET_UNINIT != 0 || pblk == 0 {
        return Err(Error::DirCorrupted);
    }
    read_dir_block(fs, pblk, buf, dir)?;
    Ok(pblk)
}

// ------------------------------------------------------------------
// Iteration

/// Checks that a potential deleted record and its successors chain cleanly
/// up to `final_offset`.
fn validate_entry(block_size: u32, buf: &[u8], mut offset: usize, final_offset: usize) -> bool {
    const DIRENT_MIN_LENGTH: usize = 12;
    while offset < final_offset && offset <= block_size as usize - DIRENT_MIN_LENGTH {
        let rec_len = get_rec_len(block_size, buf, offset) as usize;
        offset += rec_len;
        if rec_len < 8 || rec_len % 4 != 0 || dirent_name_len(buf, offset - rec_len) + 8 > rec_len
        {
            return false;
        }
    }
    offset == final_offset
}

/// Walks the records of one directory block, invoking the callback.
///
/// Returns `(changed, abort)`.
fn process_dir_block(
    fs: &mut Ext2Fs,
    pblk: Blk,
    blockcnt: i64,
    flags: u32,
    dir: Ino,
    func: &mut DirentFn<'_>,
) -> Result<bool> {
    let block_size = fs.block_size();
    let buflen = block_size as usize;
    let mut buf = vec![0u8; buflen];
    read_dir_block(fs, pblk, &mut buf, dir)?;

    let csum_size = if fs.sb.has_feature_metadata_csum() {
        DIRENT_TAIL_SIZE
    } else {
        0
    };
    let mut entry = if blockcnt == 0 {
        DirentKind::Dot
    } else {
        DirentKind::Other
    };
    let mut offset = 0usize;
    let mut next_real_entry = 0usize;
    let mut changed = false;
    let mut do_abort = false;

    while offset < buflen - 8 {
        let mut rec_len = get_rec_len(block_size, &buf, offset) as usize;
        if offset + rec_len > buflen
            || rec_len < 8
            || rec_len % 4 != 0
            || dirent_name_len(&buf, offset) + 8 > rec_len
        {
            return Err(Error::DirCorrupted);
        }
        let mut kind = if next_real_entry > offset {
            DirentKind::Deleted
        } else {
            entry
        };
        let mut skip = false;
        if dirent_ino(&buf, offset) == 0 {
            let is_tail = offset == buflen - csum_size.max(DIRENT_TAIL_SIZE)
                && rec_len == DIRENT_TAIL_SIZE
                && u16::from_le_bytes([buf[offset + 6], buf[offset + 7]]) == DIR_NAME_LEN_CSUM;
            if is_tail && csum_size != 0 {
                if flags & DIRENT_FLAG_INCLUDE_CSUM == 0 {
                    skip = true;
                } else {
                    kind = DirentKind::Checksum;
                }
            } else if flags & DIRENT_FLAG_INCLUDE_EMPTY == 0 {
                skip = true;
            }
        }

        if !skip {
            let ret = func(kind, offset, &mut buf)?;
            if matches!(entry, DirentKind::Dot | DirentKind::DotDot) {
                entry = match entry {
                    DirentKind::Dot => DirentKind::DotDot,
                    _ => DirentKind::Other,
                };
            }
            if ret & DIRENT_CHANGED != 0 {
                rec_len = get_rec_len(block_size, &buf, offset) as usize;
                changed = true;
            }
            if ret & DIRENT_ABORT != 0 {
                do_abort = true;
                break;
            }
        }

        if next_real_entry == offset {
            next_real_entry += rec_len;
        }
        if flags & DIRENT_FLAG_INCLUDE_REMOVED != 0 {
            let size = (dirent_name_len(&buf, offset) + 11) & !3;
            if rec_len != size {
                let final_offset = offset + rec_len;
                offset += size;
                while offset < final_offset
                    && !validate_entry(block_size, &buf, offset, final_offset)
                {
                    offset += 4;
                }
                continue;
            }
        }
        offset += rec_len;
    }

    if changed {
        write_dir_block(fs, pblk, &mut buf, dir)?;
    }
    Ok(do_abort)
}

/// Iterates over every record of the directory.
pub fn dir_iterate(fs: &mut Ext2Fs, dir: Ino, flags: u32, func: &mut DirentFn<'_>) -> Result<()> {
    fs.check_directory(dir)?;
    let inode = fs.read_inode(dir)?;
    if inode.flags() & INLINE_DATA_FL != 0 {
        return inline::dir_iterate(fs, dir, flags, func);
    }
    block_iterate(
        fs,
        dir,
        BLOCK_FLAG_READ_ONLY,
        &mut |fs, blk, blockcnt, _ref_blk, _ref_off| {
            let abort = process_dir_block(fs, *blk, blockcnt, flags, dir, func)?;
            Ok(if abort { BLOCK_ABORT } else { 0 })
        },
    )
}

// ------------------------------------------------------------------
// Lookup

/// Finds `name` in the directory and returns its inode number.
pub fn lookup(fs: &mut Ext2Fs, dir: Ino, name: &str) -> Result<Ino> {
    let diri = fs.read_inode(dir)?;
    if !diri.is_dir() {
        return Err(Error::NotADirectory);
    }
    if diri.flags() & INDEX_FL != 0 {
        let mut diri = diri;
        return htree::dx_lookup_ino(fs, dir, &mut diri, name);
    }
    linear_lookup(fs, dir, name)
}

pub(crate) fn linear_lookup(fs: &mut Ext2Fs, dir: Ino, name: &str) -> Result<Ino> {
    let mut found = None;
    dir_iterate(fs, dir, 0, &mut |_kind, off, buf| {
        if dirent_name(buf, off) == name.as_bytes() {
            found = Some(dirent_ino(buf, off));
            return Ok(DIRENT_ABORT);
        }
        Ok(0)
    })?;
    found.ok_or(Error::FileNotFound)
}

// ------------------------------------------------------------------
// Link

/// Tries to fit a new record into the given directory block buffer.
///
/// In order: coalesce a following unused record, split a used record's
/// slack, or claim an unused record. Returns `false` when nothing fits.
pub(crate) fn add_dirent_to_buf(
    fs: &Ext2Fs,
    buf: &mut [u8],
    name: &str,
    ino: Ino,
    file_type: u8,
) -> Result<bool> {
    let block_size = fs.block_size();
    let buflen = block_size as usize;
    let csum_size = if fs.sb.has_feature_metadata_csum() {
        DIRENT_TAIL_SIZE
    } else {
        0
    };
    let needed = dir_rec_len(name.len()) as usize;
    let filetype_feature = fs.sb.has_feature_filetype();

    let mut offset = 0usize;
    while offset < buflen - 8 {
        let mut curr_rec_len = get_rec_len(block_size, buf, offset) as usize;
        if curr_rec_len < 8 || curr_rec_len % 4 != 0 || offset + curr_rec_len > buflen {
            return Err(Error::DirCorrupted);
        }
        // Never touch the checksum tail
        if csum_size != 0
            && offset == buflen - DIRENT_TAIL_SIZE
            && curr_rec_len == DIRENT_TAIL_SIZE
            && u16::from_le_bytes([buf[offset + 6], buf[offset + 7]]) == DIR_NAME_LEN_CSUM
        {
            break;
        }
        // Absorb a following unused record
        let next = offset + curr_rec_len;
        if next < buflen - (8 + csum_size) && dirent_ino(buf, next) == 0 {
            let next_rec_len = get_rec_len(block_size, buf, next) as usize;
            if next + next_rec_len <= buflen {
                curr_rec_len += next_rec_len;
                set_rec_len(block_size, curr_rec_len as u32, buf, offset)?;
            }
        }
        if dirent_ino(buf, offset) != 0 {
            // Split the used record's slack
            let min_rec_len = dir_rec_len(dirent_name_len(buf, offset)) as usize;
            if curr_rec_len >= min_rec_len + needed {
                let rest = curr_rec_len - min_rec_len;
                set_rec_len(block_size, min_rec_len as u32, buf, offset)?;
                let empty = offset + min_rec_len;
                put_dirent(
                    block_size,
                    buf,
                    empty,
                    ino,
                    rest as u32,
                    name.as_bytes(),
                    file_type,
                    filetype_feature,
                )?;
                return Ok(true);
            }
        } else if curr_rec_len >= needed {
            // Claim the unused record
            let name_bytes = name.as_bytes();
            set_dirent_ino(buf, offset, ino);
            buf[offset + 6] = name_bytes.len() as u8;
            buf[offset + 7] = if filetype_feature { file_type } else { 0 };
            buf[offset + 8..offset + 8 + name_bytes.len()].copy_from_slice(name_bytes);
            set_rec_len(block_size, curr_rec_len as u32, buf, offset)?;
            return Ok(true);
        }
        offset += curr_rec_len;
    }
    Ok(false)
}

/// Appends one empty block to a linear directory.
fn expand_dir(fs: &mut Ext2Fs, dir: Ino, diri: &mut Inode) -> Result<()> {
    let block_size = fs.block_size();
    let lblk = diri.size() / u64::from(block_size);
    let mut pblk = 0;
    bmap2(fs, dir, diri, BMAP_ALLOC | BMAP_ZERO, lblk, &mut pblk)?;

    let mut buf = vec![0u8; block_size as usize];
    if fs.sb.has_feature_metadata_csum() {
        set_rec_len(
            block_size,
            block_size - DIRENT_TAIL_SIZE as u32,
            &mut buf,
            0,
        )?;
        initialize_dirent_tail(block_size, &mut buf);
    } else {
        set_rec_len(block_size, block_size, &mut buf, 0)?;
    }
    write_dir_block(fs, pblk, &mut buf, dir)?;

    diri.set_size(diri.size() + u64::from(block_size));
    fs.write_inode(dir, diri)
}

/// Adds `name` to the directory, pointing at inode `ino`.
///
/// HTree directories split leaves and grow depth as needed; linear
/// directories are converted to HTree on overflow when the filesystem
/// indexes directories, and simply extended otherwise.
pub fn link(fs: &mut Ext2Fs, dir: Ino, name: &str, ino: Ino, file_type: u8) -> Result<()> {
    if !fs.is_rw() {
        return Err(Error::ReadOnlyFilesystem);
    }
    if name.is_empty() || name.len() > 255 {
        return Err(Error::InvalidArgument);
    }
    let mut diri = fs.read_inode(dir)?;
    if diri.flags() & INDEX_FL != 0 {
        return htree::dx_link(fs, dir, &mut diri, name, ino, file_type);
    }
    if diri.flags() & INLINE_DATA_FL != 0 {
        match inline::dir_link(fs, dir, &mut diri, name, ino, file_type) {
            Err(Error::InlineDataNoSpace) => {
                // Promote to a block-backed directory and retry below
                inline::expand(fs, dir)?;
                diri = fs.read_inode(dir)?;
            }
            other => return other,
        }
    }

    // Linear scan over the directory's blocks
    let blocks = diri.size().div_ceil(u64::from(fs.block_size()));
    let mut buf = vec![0u8; fs.block_size() as usize];
    for lblk in 0..blocks {
        let pblk = load_logical_dir_block(fs, dir, &mut diri, lblk, &mut buf)?;
        if add_dirent_to_buf(fs, &mut buf, name, ino, file_type)? {
            return write_dir_block(fs, pblk, &mut buf, dir);
        }
    }

    if fs.sb.has_feature_dir_index() && blocks == 1 {
        htree::dx_convert(fs, dir, &mut diri)?;
        return htree::dx_link(fs, dir, &mut diri, name, ino, file_type);
    }
    expand_dir(fs, dir, &mut diri)?;
    let lblk = blocks;
    let pblk = load_logical_dir_block(fs, dir, &mut diri, lblk, &mut buf)?;
    if add_dirent_to_buf(fs, &mut buf, name, ino, file_type)? {
        write_dir_block(fs, pblk, &mut buf, dir)
    } else {
        Err(Error::DirNoSpace)
    }
}

// ------------------------------------------------------------------
// Directory creation

/// Builds a fresh directory block holding "." and "..".
pub fn new_dir_block(fs: &Ext2Fs, ino: Ino, parent: Ino) -> Result<Vec<u8>> {
    let block_size = fs.block_size();
    let mut buf = vec![0u8; block_size as usize];
    let filetype = fs.sb.has_feature_filetype();
    let csum_size = if fs.sb.has_feature_metadata_csum() {
        DIRENT_TAIL_SIZE as u32
    } else {
        0
    };
    put_dirent(block_size, &mut buf, 0, ino, 12, b".", FT_DIR, filetype)?;
    put_dirent(
        block_size,
        &mut buf,
        12,
        parent,
        block_size - 12 - csum_size,
        b"..",
        FT_DIR,
        filetype,
    )?;
    if csum_size != 0 {
        initialize_dirent_tail(block_size, &mut buf);
    }
    Ok(buf)
}

/// Creates a directory under `parent`.
///
/// Arguments:
/// - `inum` reuses the given inode number; a fresh one is allocated
///   otherwise.
/// - `name` links the new directory into `parent`; without it, only the
///   inode and its first block are created.
///
/// Returns the new directory's inode number.
pub fn mkdir(fs: &mut Ext2Fs, parent: Ino, inum: Option<Ino>, name: Option<&str>) -> Result<Ino> {
    if !fs.is_rw() {
        return Err(Error::ReadOnlyFilesystem);
    }
    // New directories are inline when the feature allows it
    let inline_data = fs.sb.has_feature_inline_data()
        && inum.is_none_or(|ino| ino >= fs.sb.first_ino());

    let ino = match inum {
        Some(ino) => ino,
        None => fs.new_inode(parent)?,
    };

    let mut blk = 0;
    let mut inode = Inode::new();
    if !inline_data {
        blk = fs.new_block(fs.find_inode_goal(ino, &inode))?;
    }

    inode.i_mode = (S_IFDIR | (0o777 & !fs.umask)).to_le();
    inode.i_links_count = 2u16.to_le();
    if inline_data {
        inode.flags_set(INLINE_DATA_FL);
        inode.set_size(crate::INODE_BLOCK_BYTES as u64);
        inline::new_dir_inline_data(&mut inode, parent);
    } else {
        if fs.sb.has_feature_extents() {
            inode.flags_set(EXTENTS_FL);
        } else {
            inode.set_block(0, blk as u32);
        }
        inode.set_size(u64::from(fs.block_size()));
        inode.set_blocks_count(u64::from(fs.block_size() / 512));
    }
    fs.write_new_inode(ino, &mut inode)?;

    if inline_data {
        inline::init(fs, ino)?;
    } else {
        let mut block = new_dir_block(fs, ino, parent)?;
        write_dir_block(fs, blk, &mut block, ino)?;
        if fs.sb.has_feature_extents() {
            let mut handle = ExtentHandle::open(ino, &inode)?;
            handle.set_bmap(fs, 0, blk, false)?;
            inode = *handle.inode();
        }
    }

    // Link the directory into the hierarchy
    if let Some(name) = name {
        match lookup(fs, parent, name) {
            Ok(_) => return Err(Error::DirExists),
            Err(Error::FileNotFound) => {}
            Err(e) => return Err(e),
        }
        link(fs, parent, name, ino, FT_DIR)?;
    }

    // Account the parent's new subdirectory
    if parent != ino {
        let mut parent_inode = fs.read_inode(parent)?;
        parent_inode.i_links_count =
            (u16::from_le(parent_inode.i_links_count) + 1).to_le();
        fs.write_inode(parent, &parent_inode)?;
    }

    if !inline_data {
        fs.block_alloc_stats(blk, 1);
    }
    fs.inode_alloc_stats(ino, 1, true);
    Ok(ino)
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use crate::alloc_tables::allocate_tables;
    use crate::fs::FsParams;
    use crate::io::{FileIo, IoChannel};
    use crate::{ROOT_INO, sb};

    pub(crate) fn dir_fs(feature_compat: u32, feature_incompat: u32) -> (std::path::PathBuf, Ext2Fs) {
        let path = std::env::temp_dir().join(format!("e2img-dir-{}", uuid::Uuid::new_v4()));
        let file = std::fs::File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .unwrap();
        file.set_len(32 << 20).unwrap();
        let io: Box<dyn IoChannel> = Box::new(FileIo::from_file(file));
        let params = FsParams {
            block_size: 1024,
            feature_compat,
            feature_incompat: sb::FEATURE_INCOMPAT_FILETYPE | feature_incompat,
            ..Default::default()
        };
        let mut fs = Ext2Fs::initialize(io, &params).unwrap();
        allocate_tables(&mut fs).unwrap();
        // The root directory is its own parent
        mkdir(&mut fs, ROOT_INO, Some(ROOT_INO), None).unwrap();
        (path, fs)
    }

    #[test]
    fn rec_len_roundtrip() {
        let mut buf = vec![0u8; 16];
        for (block_size, len) in [(1024u32, 1024u32), (4096, 268), (65536, 65536), (65536, 132)]
        {
            set_rec_len(block_size, len, &mut buf, 0).unwrap();
            assert_eq!(get_rec_len(block_size, &buf, 0), len, "bs {block_size}");
        }
        // The wrap value decodes to the full 64 KiB block
        buf[4..6].copy_from_slice(&0u16.to_le_bytes());
        assert_eq!(get_rec_len(65536, &buf, 0), 65536);
    }

    #[test]
    fn mkdir_and_lookup_entries() {
        let (path, mut fs) = dir_fs(0, 0);
        let sub = mkdir(&mut fs, ROOT_INO, None, Some("docs")).unwrap();
        assert_eq!(lookup(&mut fs, ROOT_INO, "docs").unwrap(), sub);
        assert_eq!(lookup(&mut fs, sub, ".").unwrap(), sub);
        assert_eq!(lookup(&mut fs, sub, "..").unwrap(), ROOT_INO);
        assert!(matches!(
            lookup(&mut fs, ROOT_INO, "missing"),
            Err(Error::FileNotFound)
        ));
        assert!(matches!(
            mkdir(&mut fs, ROOT_INO, None, Some("docs")),
            Err(Error::DirExists)
        ));
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn link_order_does_not_matter() {
        let (path, mut fs) = dir_fs(0, 0);
        let a = mkdir(&mut fs, ROOT_INO, None, None).unwrap();
        let b = mkdir(&mut fs, ROOT_INO, None, None).unwrap();
        link(&mut fs, ROOT_INO, "beta", b, FT_DIR).unwrap();
        link(&mut fs, ROOT_INO, "alpha", a, FT_DIR).unwrap();
        assert_eq!(lookup(&mut fs, ROOT_INO, "alpha").unwrap(), a);
        assert_eq!(lookup(&mut fs, ROOT_INO, "beta").unwrap(), b);
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn iterate_sees_dot_entries_first() {
        let (path, mut fs) = dir_fs(0, 0);
        let sub = mkdir(&mut fs, ROOT_INO, None, Some("sub")).unwrap();
        let mut names = Vec::new();
        let mut kinds = Vec::new();
        dir_iterate(&mut fs, sub, 0, &mut |kind, off, buf| {
            names.push(dirent_name(buf, off).to_vec());
            kinds.push(kind);
            Ok(0)
        })
        .unwrap();
        assert_eq!(names, vec![b".".to_vec(), b"..".to_vec()]);
        assert_eq!(kinds, vec![DirentKind::Dot, DirentKind::DotDot]);
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn linear_directory_expands_without_index() {
        let (path, mut fs) = dir_fs(0, 0);
        let sub = mkdir(&mut fs, ROOT_INO, None, Some("big")).unwrap();
        let files: Vec<String> = (0..120).map(|i| format!("file{i:04}")).collect();
        for name in &files {
            let ino = mkdir(&mut fs, sub, None, None).unwrap();
            link(&mut fs, sub, name, ino, FT_DIR).unwrap();
        }
        for name in &files {
            lookup(&mut fs, sub, name).unwrap();
        }
        let inode = fs.read_inode(sub).unwrap();
        assert!(inode.size() > u64::from(fs.block_size()));
        assert_eq!(inode.flags() & INDEX_FL, 0);
        std::fs::remove_file(path).unwrap();
    }
}
