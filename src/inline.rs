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

//! Inline file and directory data.
//!
//! Small files keep their first 60 bytes in the inode's `i_block` area; the
//! remainder lives in the `system.data` extended attribute stored in the
//! inode body after `i_extra_isize`. Inline directories use the same space:
//! the first 4 bytes hold the parent inode (the implicit ".."), the rest is
//! a stream of ordinary directory records.

use crate::dir::{
    DIRENT_ABORT, DIRENT_CHANGED, DIRENT_FLAG_INCLUDE_EMPTY, DirentFn, DirentKind, FT_DIR,
    dir_rec_len, dirent_ino, dirent_name_len,
};
use crate::error::{Error, Result};
use crate::fs::Ext2Fs;
use crate::inode::{EXTENTS_FL, GOOD_OLD_INODE_SIZE, INLINE_DATA_FL, Inode};
use crate::{INODE_BLOCK_BYTES, Ino};

/// Magic number opening the in-inode extended attribute area.
const XATTR_MAGIC: u32 = 0xEA02_0000;
/// Name index of the `system.*` namespace.
const XATTR_INDEX_SYSTEM: u8 = 7;
/// Attribute name carrying inline data.
const XATTR_NAME_DATA: &[u8] = b"data";
/// Size of an attribute entry header.
const XATTR_ENTRY_SIZE: usize = 16;

fn pad4(n: usize) -> usize {
    (n + 3) & !3
}

/// Returns the byte range of the in-inode attribute entries, if the inode
/// body has one.
fn ibody_region(raw: &[u8]) -> Option<(usize, usize)> {
    if raw.len() <= GOOD_OLD_INODE_SIZE + 4 {
        return None;
    }
    let extra = usize::from(u16::from_le_bytes([raw[128], raw[129]]));
    let start = GOOD_OLD_INODE_SIZE + extra;
    if start + 4 > raw.len() {
        return None;
    }
    let magic = u32::from_le_bytes(raw[start..start + 4].try_into().unwrap());
    if magic != XATTR_MAGIC {
        return None;
    }
    Some((start + 4, raw.len()))
}

/// Creates the attribute area when missing, returning its entry range.
fn ibody_region_create(raw: &mut [u8]) -> Result<(usize, usize)> {
    if let Some(region) = ibody_region(raw) {
        return Ok(region);
    }
    if raw.len() <= GOOD_OLD_INODE_SIZE + 4 {
        return Err(Error::InlineDataNoSpace);
    }
    let mut extra = usize::from(u16::from_le_bytes([raw[128], raw[129]]));
    if extra == 0 {
        extra = 32;
        raw[128..130].copy_from_slice(&(extra as u16).to_le_bytes());
    }
    let start = GOOD_OLD_INODE_SIZE + extra;
    if start + 4 + XATTR_ENTRY_SIZE + pad4(XATTR_NAME_DATA.len()) > raw.len() {
        return Err(Error::InlineDataNoSpace);
    }
    raw[start..start + 4].copy_from_slice(&XATTR_MAGIC.to_le_bytes());
    raw[start + 4..].fill(0);
    Ok((start + 4, raw.len()))
}

/// A located `system.data` attribute.
struct DataEntry {
    /// Offset of the entry header.
    entry: usize,
    /// Absolute offset of the value.
    value: usize,
    /// Value size in bytes.
    size: usize,
}

/// Finds the `system.data` entry in the attribute area.
fn find_data_entry(raw: &[u8], entries: usize, end: usize) -> Option<DataEntry> {
    let mut off = entries;
    while off + XATTR_ENTRY_SIZE <= end {
        if u32::from_le_bytes(raw[off..off + 4].try_into().unwrap()) == 0 {
            break;
        }
        let name_len = usize::from(raw[off]);
        let name_index = raw[off + 1];
        let value_offs = usize::from(u16::from_le_bytes([raw[off + 2], raw[off + 3]]));
        let value_size =
            u32::from_le_bytes(raw[off + 8..off + 12].try_into().unwrap()) as usize;
        let name_end = off + XATTR_ENTRY_SIZE + name_len;
        if name_end > end {
            break;
        }
        if name_index == XATTR_INDEX_SYSTEM
            && &raw[off + XATTR_ENTRY_SIZE..name_end] == XATTR_NAME_DATA
        {
            let value = entries + value_offs;
            if value + value_size > end {
                break;
            }
            return Some(DataEntry {
                entry: off,
                value,
                size: value_size,
            });
        }
        off = name_end.div_ceil(4) * 4;
    }
    None
}

/// Returns the maximum number of inline bytes this inode can hold.
pub fn max_size(fs: &mut Ext2Fs, ino: Ino) -> Result<usize> {
    let raw = fs.read_inode_full(ino)?;
    let inode_size = raw.len();
    if inode_size <= GOOD_OLD_INODE_SIZE + 4 {
        return Ok(INODE_BLOCK_BYTES);
    }
    let extra = usize::from(u16::from_le_bytes([raw[128], raw[129]])).max(32);
    let overhead =
        GOOD_OLD_INODE_SIZE + extra + 4 + XATTR_ENTRY_SIZE + pad4(XATTR_NAME_DATA.len());
    Ok(INODE_BLOCK_BYTES + inode_size.saturating_sub(overhead))
}

/// Reads the whole inline content of the inode.
pub fn get(fs: &mut Ext2Fs, ino: Ino, inode: &mut Inode) -> Result<Vec<u8>> {
    if inode.flags() & INLINE_DATA_FL == 0 {
        return Err(Error::InvalidArgument);
    }
    let size = inode.size() as usize;
    let mut data = Vec::with_capacity(size);
    for i in 0..crate::inode::N_BLOCKS {
        data.extend_from_slice(&inode.block(i).to_le_bytes());
    }
    data.truncate(size.min(INODE_BLOCK_BYTES));
    if size > INODE_BLOCK_BYTES {
        let raw = fs.read_inode_full(ino)?;
        if let Some((entries, end)) = ibody_region(&raw) {
            if let Some(entry) = find_data_entry(&raw, entries, end) {
                let take = entry.size.min(size - INODE_BLOCK_BYTES);
                data.extend_from_slice(&raw[entry.value..entry.value + take]);
            }
        }
        data.resize(size, 0);
    }
    Ok(data)
}

/// Stores `data` as the inode's inline content.
///
/// The caller's inode copy receives the new `i_block` head; sizes are the
/// caller's business. Returns [`Error::InlineDataNoSpace`] when the data
/// does not fit.
pub fn set(fs: &mut Ext2Fs, ino: Ino, inode: &mut Inode, data: &[u8]) -> Result<()> {
    if data.len() > max_size(fs, ino)? {
        return Err(Error::InlineDataNoSpace);
    }
    // Head goes into i_block
    let head = data.len().min(INODE_BLOCK_BYTES);
    let mut blocks = [0u32; crate::inode::N_BLOCKS];
    let mut padded = [0u8; INODE_BLOCK_BYTES];
    padded[..head].copy_from_slice(&data[..head]);
    for (i, slot) in blocks.iter_mut().enumerate() {
        *slot = u32::from_le_bytes(padded[i * 4..(i + 1) * 4].try_into().unwrap()).to_le();
    }
    inode.i_block = blocks;
    fs.write_inode(ino, inode)?;

    // Tail goes into the system.data attribute
    let mut raw = fs.read_inode_full(ino)?;
    let (entries, end) = ibody_region_create(&mut raw)?;
    let tail = &data[head..];
    write_data_entry(&mut raw, entries, end, tail)?;
    fs.write_inode_full(ino, &mut raw)
}

/// Rewrites the attribute area with a single `system.data` entry holding
/// `value`.
fn write_data_entry(raw: &mut [u8], entries: usize, end: usize, value: &[u8]) -> Result<()> {
    let name_len = XATTR_NAME_DATA.len();
    let entry_len = XATTR_ENTRY_SIZE + pad4(name_len);
    if entries + entry_len + 4 + value.len() > end {
        return Err(Error::InlineDataNoSpace);
    }
    raw[entries..end].fill(0);
    raw[entries] = name_len as u8;
    raw[entries + 1] = XATTR_INDEX_SYSTEM;
    let value_abs = end - value.len();
    let value_offs = (value_abs - entries) as u16;
    raw[entries + 2..entries + 4].copy_from_slice(&value_offs.to_le_bytes());
    raw[entries + 8..entries + 12].copy_from_slice(&(value.len() as u32).to_le_bytes());
    raw[entries + XATTR_ENTRY_SIZE..entries + XATTR_ENTRY_SIZE + name_len]
        .copy_from_slice(XATTR_NAME_DATA);
    raw[value_abs..end].copy_from_slice(value);
    Ok(())
}

/// Creates an empty `system.data` attribute for a fresh inline inode.
pub fn init(fs: &mut Ext2Fs, ino: Ino) -> Result<()> {
    let mut raw = fs.read_inode_full(ino)?;
    let (entries, end) = ibody_region_create(&mut raw)?;
    write_data_entry(&mut raw, entries, end, &[])?;
    fs.write_inode_full(ino, &mut raw)
}

/// Removes the `system.data` attribute.
pub fn ea_remove(fs: &mut Ext2Fs, ino: Ino) -> Result<()> {
    let mut raw = fs.read_inode_full(ino)?;
    if let Some((entries, end)) = ibody_region(&raw) {
        raw[entries..end].fill(0);
        fs.write_inode_full(ino, &mut raw)?;
    }
    Ok(())
}

/// Builds the inline template of a fresh directory: the parent inode as the
/// implicit "..", then one unused record covering the rest.
pub fn new_dir_inline_data(inode: &mut Inode, parent: Ino) {
    let mut area = [0u8; INODE_BLOCK_BYTES];
    area[0..4].copy_from_slice(&parent.to_le_bytes());
    // Unused record spanning the remaining space
    let rec_len = (INODE_BLOCK_BYTES - 4) as u16;
    area[8..10].copy_from_slice(&rec_len.to_le_bytes());
    let mut blocks = [0u32; crate::inode::N_BLOCKS];
    for (i, slot) in blocks.iter_mut().enumerate() {
        *slot = u32::from_le_bytes(area[i * 4..(i + 1) * 4].try_into().unwrap()).to_le();
    }
    inode.i_block = blocks;
}

/// The two record streams of an inline directory: the `i_block` area past
/// the parent pointer, and the attribute value.
fn dir_regions(data: &[u8]) -> (std::ops::Range<usize>, std::ops::Range<usize>) {
    let first_end = data.len().min(INODE_BLOCK_BYTES);
    (4..first_end, INODE_BLOCK_BYTES.min(data.len())..data.len())
}

/// Walks one inline record stream.
fn iterate_region(
    data: &mut [u8],
    region: std::ops::Range<usize>,
    flags: u32,
    func: &mut DirentFn<'_>,
) -> Result<(bool, bool)> {
    let mut offset = region.start;
    let mut changed = false;
    while offset + 8 <= region.end {
        let rec_len = usize::from(u16::from_le_bytes([data[offset + 4], data[offset + 5]]));
        if rec_len < 8 || rec_len % 4 != 0 || offset + rec_len > region.end {
            return Err(Error::DirCorrupted);
        }
        let skip = dirent_ino(data, offset) == 0 && flags & DIRENT_FLAG_INCLUDE_EMPTY == 0;
        if !skip {
            let ret = func(DirentKind::Other, offset, data)?;
            if ret & DIRENT_CHANGED != 0 {
                changed = true;
            }
            if ret & DIRENT_ABORT != 0 {
                return Ok((changed, true));
            }
        }
        offset += rec_len;
    }
    Ok((changed, false))
}

/// Iterates an inline directory, synthesizing "." and "..".
pub fn dir_iterate(fs: &mut Ext2Fs, dir: Ino, flags: u32, func: &mut DirentFn<'_>) -> Result<()> {
    let mut inode = fs.read_inode(dir)?;
    if inode.flags() & INLINE_DATA_FL == 0 {
        return Err(Error::InvalidArgument);
    }
    let mut data = get(fs, dir, &mut inode)?;
    if data.len() < 4 {
        return Err(Error::DirCorrupted);
    }
    let parent = u32::from_le_bytes(data[0..4].try_into().unwrap());

    // Synthesized "." and ".." records
    let mut fake = [0u8; 24];
    fake[0..4].copy_from_slice(&dir.to_le_bytes());
    fake[4..6].copy_from_slice(&12u16.to_le_bytes());
    fake[6] = 1;
    fake[7] = FT_DIR;
    fake[8] = b'.';
    fake[12..16].copy_from_slice(&parent.to_le_bytes());
    fake[16..18].copy_from_slice(&12u16.to_le_bytes());
    fake[18] = 2;
    fake[19] = FT_DIR;
    fake[20] = b'.';
    fake[21] = b'.';
    let ret = func(DirentKind::Dot, 0, &mut fake)?;
    if ret & DIRENT_ABORT == 0 {
        let ret = func(DirentKind::DotDot, 12, &mut fake)?;
        if ret & DIRENT_ABORT != 0 {
            return Ok(());
        }
    } else {
        return Ok(());
    }

    let (first, second) = dir_regions(&data);
    let (mut changed, abort) = iterate_region(&mut data, first, flags, func)?;
    if !abort {
        let (changed2, _) = iterate_region(&mut data, second, flags, func)?;
        changed |= changed2;
    }
    if changed {
        set(fs, dir, &mut inode, &data)?;
    }
    Ok(())
}

/// Tries to fit a record into an inline record stream.
fn add_to_region(
    data: &mut [u8],
    region: std::ops::Range<usize>,
    name: &str,
    ino: Ino,
    file_type: u8,
    filetype_feature: bool,
) -> Result<bool> {
    let needed = dir_rec_len(name.len()) as usize;
    let mut offset = region.start;
    while offset + 8 <= region.end {
        let rec_len = usize::from(u16::from_le_bytes([data[offset + 4], data[offset + 5]]));
        if rec_len < 8 || rec_len % 4 != 0 || offset + rec_len > region.end {
            return Err(Error::DirCorrupted);
        }
        let write_at = if dirent_ino(data, offset) == 0 && rec_len >= needed {
            Some((offset, rec_len))
        } else if dirent_ino(data, offset) != 0 {
            let min_rec = dir_rec_len(dirent_name_len(data, offset)) as usize;
            if rec_len >= min_rec + needed {
                data[offset + 4..offset + 6].copy_from_slice(&(min_rec as u16).to_le_bytes());
                Some((offset + min_rec, rec_len - min_rec))
            } else {
                None
            }
        } else {
            None
        };
        if let Some((at, span)) = write_at {
            data[at..at + 4].copy_from_slice(&ino.to_le_bytes());
            data[at + 4..at + 6].copy_from_slice(&(span as u16).to_le_bytes());
            data[at + 6] = name.len() as u8;
            data[at + 7] = if filetype_feature { file_type } else { 0 };
            data[at + 8..at + 8 + name.len()].copy_from_slice(name.as_bytes());
            return Ok(true);
        }
        offset += rec_len;
    }
    Ok(false)
}

/// Adds a name to an inline directory, growing the attribute value when the
/// existing streams are full.
pub fn dir_link(
    fs: &mut Ext2Fs,
    dir: Ino,
    diri: &mut Inode,
    name: &str,
    ino: Ino,
    file_type: u8,
) -> Result<()> {
    let mut data = get(fs, dir, diri)?;
    if data.len() < 4 {
        return Err(Error::DirCorrupted);
    }
    let filetype_feature = fs.sb.has_feature_filetype();
    let (first, second) = dir_regions(&data);
    if add_to_region(&mut data, first, name, ino, file_type, filetype_feature)?
        || add_to_region(
            &mut data,
            second.clone(),
            name,
            ino,
            file_type,
            filetype_feature,
        )?
    {
        return set(fs, dir, diri, &data);
    }

    // Grow the attribute stream by the needed record size
    let needed = dir_rec_len(name.len()) as usize;
    if data.len() + needed > max_size(fs, dir)? {
        return Err(Error::InlineDataNoSpace);
    }
    let old_len = data.len();
    data.resize(old_len + needed, 0);
    if second.is_empty() {
        // Fresh stream: one record spanning it
        let at = old_len;
        data[at + 4..at + 6].copy_from_slice(&(needed as u16).to_le_bytes());
    } else {
        // Stretch the last record of the stream
        let mut offset = second.start;
        loop {
            let rec_len =
                usize::from(u16::from_le_bytes([data[offset + 4], data[offset + 5]]));
            if rec_len < 8 || rec_len % 4 != 0 || offset + rec_len > old_len {
                return Err(Error::DirCorrupted);
            }
            if offset + rec_len >= old_len {
                data[offset + 4..offset + 6]
                    .copy_from_slice(&((rec_len + needed) as u16).to_le_bytes());
                break;
            }
            offset += rec_len;
        }
    }
    let (_, second) = dir_regions(&data);
    if !add_to_region(&mut data, second, name, ino, file_type, filetype_feature)? {
        return Err(Error::InlineDataNoSpace);
    }
    diri.set_size(data.len() as u64);
    set(fs, dir, diri, &data)?;
    fs.write_inode(dir, diri)
}

/// Promotes an inline inode to a block-backed one.
///
/// Directory content is rebuilt as a first block with "." and ".."; file
/// content is copied to block 0.
pub fn expand(fs: &mut Ext2Fs, ino: Ino) -> Result<()> {
    let mut inode = fs.read_inode(ino)?;
    if inode.flags() & INLINE_DATA_FL == 0 {
        return Err(Error::InvalidArgument);
    }
    let data = get(fs, ino, &mut inode)?;

    inode.flags_clear(INLINE_DATA_FL);
    inode.i_block = [0; crate::inode::N_BLOCKS];
    if fs.sb.has_feature_extents() {
        inode.flags_set(EXTENTS_FL);
    }

    if inode.is_dir() {
        let parent = if data.len() >= 4 {
            u32::from_le_bytes(data[0..4].try_into().unwrap())
        } else {
            ino
        };
        let mut block = crate::dir::new_dir_block(fs, ino, parent)?;
        // Re-insert every inline record
        let (first, second) = dir_regions(&data);
        for region in [first, second] {
            let mut offset = region.start;
            while offset + 8 <= region.end {
                let rec_len =
                    usize::from(u16::from_le_bytes([data[offset + 4], data[offset + 5]]));
                if rec_len < 8 || rec_len % 4 != 0 || offset + rec_len > region.end {
                    return Err(Error::DirCorrupted);
                }
                let entry_ino = dirent_ino(&data, offset);
                if entry_ino != 0 {
                    let name_len = dirent_name_len(&data, offset);
                    let name = std::str::from_utf8(&data[offset + 8..offset + 8 + name_len])
                        .map_err(|_| Error::DirCorrupted)?
                        .to_owned();
                    let ft = data[offset + 7];
                    if !crate::dir::add_dirent_to_buf(fs, &mut block, &name, entry_ino, ft)? {
                        return Err(Error::DirNoSpace);
                    }
                }
                offset += rec_len;
            }
        }
        inode.set_size(u64::from(fs.block_size()));
        fs.write_inode(ino, &inode)?;
        let mut pblk = 0;
        crate::bmap::bmap2(
            fs,
            ino,
            &mut inode,
            crate::bmap::BMAP_ALLOC,
            0,
            &mut pblk,
        )?;
        crate::dir::write_dir_block(fs, pblk, &mut block, ino)?;
    } else {
        fs.write_inode(ino, &inode)?;
        if !data.is_empty() {
            let mut pblk = 0;
            crate::bmap::bmap2(
                fs,
                ino,
                &mut inode,
                crate::bmap::BMAP_ALLOC,
                0,
                &mut pblk,
            )?;
            let mut block = vec![0u8; fs.block_size() as usize];
            let copy_len = data.len().min(block.len());
            block[..copy_len].copy_from_slice(&data[..copy_len]);
            fs.write_blk(pblk, &block)?;
        }
    }
    ea_remove(fs, ino)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::dir::test::dir_fs;
    use crate::dir::{FT_REG_FILE, link, lookup, mkdir};
    use crate::inode::S_IFREG;
    use crate::{ROOT_INO, sb};

    fn inline_fs() -> (std::path::PathBuf, Ext2Fs) {
        dir_fs(0, sb::FEATURE_INCOMPAT_INLINE_DATA)
    }

    fn new_inline_file(fs: &mut Ext2Fs) -> (Ino, Inode) {
        let ino = fs.new_inode(0).unwrap();
        fs.inode_alloc_stats(ino, 1, false);
        let mut inode = Inode::new();
        inode.i_mode = (S_IFREG | 0o644).to_le();
        inode.i_links_count = 1u16.to_le();
        inode.flags_set(INLINE_DATA_FL);
        fs.write_new_inode(ino, &mut inode).unwrap();
        init(fs, ino).unwrap();
        (ino, inode)
    }

    #[test]
    fn small_content_roundtrips_through_iblock() {
        let (path, mut fs) = inline_fs();
        let (ino, mut inode) = new_inline_file(&mut fs);
        let content = b"tiny file content";
        set(&mut fs, ino, &mut inode, content).unwrap();
        inode.set_size(content.len() as u64);
        fs.write_inode(ino, &inode).unwrap();

        let mut inode = fs.read_inode(ino).unwrap();
        let back = get(&mut fs, ino, &mut inode).unwrap();
        assert_eq!(back, content);
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn tail_spills_into_the_attribute() {
        let (path, mut fs) = inline_fs();
        let (ino, mut inode) = new_inline_file(&mut fs);
        let content: Vec<u8> = (0..100u8).collect();
        set(&mut fs, ino, &mut inode, &content).unwrap();
        inode.set_size(content.len() as u64);
        fs.write_inode(ino, &inode).unwrap();

        let mut inode = fs.read_inode(ino).unwrap();
        let back = get(&mut fs, ino, &mut inode).unwrap();
        assert_eq!(back, content);
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn oversize_content_is_rejected() {
        let (path, mut fs) = inline_fs();
        let (ino, mut inode) = new_inline_file(&mut fs);
        let max = max_size(&mut fs, ino).unwrap();
        let content = vec![7u8; max + 1];
        assert!(matches!(
            set(&mut fs, ino, &mut inode, &content),
            Err(Error::InlineDataNoSpace)
        ));
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn inline_directories_hold_and_expand() {
        let (path, mut fs) = inline_fs();
        let dir = mkdir(&mut fs, ROOT_INO, None, Some("inl")).unwrap();
        let diri = fs.read_inode(dir).unwrap();
        assert_ne!(diri.flags() & INLINE_DATA_FL, 0);

        // A couple of small names fit inline
        let (f1, _) = new_inline_file(&mut fs);
        let (f2, _) = new_inline_file(&mut fs);
        link(&mut fs, dir, "a", f1, FT_REG_FILE).unwrap();
        link(&mut fs, dir, "b", f2, FT_REG_FILE).unwrap();
        assert_eq!(lookup(&mut fs, dir, "a").unwrap(), f1);
        assert_eq!(lookup(&mut fs, dir, "b").unwrap(), f2);

        // Enough links overflow the inline area and promote the directory
        for i in 0..30 {
            let (f, _) = new_inline_file(&mut fs);
            link(&mut fs, dir, &format!("file{i:02}"), f, FT_REG_FILE).unwrap();
        }
        let diri = fs.read_inode(dir).unwrap();
        assert_eq!(diri.flags() & INLINE_DATA_FL, 0);
        assert_eq!(lookup(&mut fs, dir, "a").unwrap(), f1);
        assert_eq!(lookup(&mut fs, dir, "file29").unwrap(), lookup(&mut fs, dir, "file29").unwrap());
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn punch_clears_inline_data() {
        let (path, mut fs) = inline_fs();
        let (ino, mut inode) = new_inline_file(&mut fs);
        set(&mut fs, ino, &mut inode, b"will vanish").unwrap();
        inode.set_size(11);
        fs.write_inode(ino, &inode).unwrap();

        let mut inode = fs.read_inode(ino).unwrap();
        crate::punch::punch(&mut fs, ino, &mut inode, 0, u64::MAX).unwrap();
        assert_eq!(inode.size(), 0);
        let mut inode = fs.read_inode(ino).unwrap();
        let back = get(&mut fs, ino, &mut inode).unwrap();
        assert!(back.is_empty());
        std::fs::remove_file(path).unwrap();
    }
}
