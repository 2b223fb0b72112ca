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

//! Hash-indexed directories.
//!
//! Block 0 of an indexed directory starts with the "." and ".." records,
//! then a root info record at offset 24, then sorted `{ hash, block }`
//! entries prefixed by a count/limit header. Interior index blocks use the
//! same layout behind an 8-byte fake record. Leaves are ordinary directory
//! blocks; a leaf's lowest hash bounds every name it stores.

use super::hash::{HASH_TEA, dirhash2};
use super::{
    DIRENT_TAIL_SIZE, add_dirent_to_buf, dir_rec_len, dirent_ino, dirent_name, dirent_name_len,
    get_rec_len, initialize_dirent_tail, load_logical_dir_block, set_rec_len, write_dir_block,
};
use crate::bmap::{BMAP_ALLOC, BMAP_ZERO, bmap2};
use crate::csum::crc32c;
use crate::error::{Error, Result};
use crate::fs::Ext2Fs;
use crate::inode::{CASEFOLD_FL, INDEX_FL, Inode};
use crate::sb::FLAGS_UNSIGNED_HASH;
use crate::{Blk, Ino};

/// Offset of the root info record inside block 0.
const DX_ROOT_OFF: usize = 24;
/// Size of the root info record.
const DX_ROOT_INFO_LEN: usize = 8;
/// Size of one `{ hash, block }` entry.
const DX_ENTRY_SIZE: usize = 8;
/// Size of the index-block checksum tail.
const DX_TAIL_SIZE: usize = 8;
/// Mask applied to on-disk child block numbers.
const DX_BLOCK_MASK: u32 = 0x0FFF_FFFF;

/// Returns the maximum HTree depth for this filesystem.
fn htree_max_depth(fs: &Ext2Fs) -> usize {
    if fs.sb.has_feature_largedir() { 3 } else { 2 }
}

fn dx_csum_size(fs: &Ext2Fs) -> usize {
    if fs.sb.has_feature_metadata_csum() {
        DX_TAIL_SIZE
    } else {
        0
    }
}

/// Entry capacity of the root block.
fn dx_root_limit(fs: &Ext2Fs) -> usize {
    (fs.block_size() as usize - DX_ROOT_OFF - DX_ROOT_INFO_LEN - dx_csum_size(fs)) / DX_ENTRY_SIZE
}

/// Entry capacity of an interior index block.
fn dx_node_limit(fs: &Ext2Fs) -> usize {
    (fs.block_size() as usize - 8 - dx_csum_size(fs)) / DX_ENTRY_SIZE
}

/// One level of an HTree descent.
struct DxFrame {
    buf: Vec<u8>,
    pblk: Blk,
    /// Offset of the count/limit header (and of entry 0).
    entries_off: usize,
    /// Index of the entry the descent followed.
    at: usize,
}

impl DxFrame {
    fn limit(&self) -> usize {
        usize::from(u16::from_le_bytes([
            self.buf[self.entries_off],
            self.buf[self.entries_off + 1],
        ]))
    }

    fn count(&self) -> usize {
        usize::from(u16::from_le_bytes([
            self.buf[self.entries_off + 2],
            self.buf[self.entries_off + 3],
        ]))
    }

    fn set_count(&mut self, count: usize) {
        self.buf[self.entries_off + 2..self.entries_off + 4]
            .copy_from_slice(&(count as u16).to_le_bytes());
    }

    fn entry_hash(&self, i: usize) -> u32 {
        let off = self.entries_off + i * DX_ENTRY_SIZE;
        u32::from_le_bytes(self.buf[off..off + 4].try_into().unwrap())
    }

    fn entry_block(&self, i: usize) -> Blk {
        let off = self.entries_off + i * DX_ENTRY_SIZE + 4;
        u64::from(u32::from_le_bytes(self.buf[off..off + 4].try_into().unwrap()) & DX_BLOCK_MASK)
    }

    fn set_entry(&mut self, i: usize, hash: u32, block: Blk) {
        let off = self.entries_off + i * DX_ENTRY_SIZE;
        self.buf[off..off + 4].copy_from_slice(&hash.to_le_bytes());
        self.buf[off + 4..off + 8].copy_from_slice(&(block as u32).to_le_bytes());
    }

    /// Binary search for the last entry whose hash is `<= hash`.
    fn search(&mut self, hash: u32) {
        let count = self.count();
        let mut p = 1;
        let mut q = count - 1;
        while p <= q {
            let m = p + (q - p) / 2;
            if self.entry_hash(m) > hash {
                q = m - 1;
            } else {
                p = m + 1;
            }
        }
        self.at = p - 1;
    }
}

/// The result of an HTree descent for one name.
struct DxLookup {
    hash: u32,
    hash_alg: u8,
    frames: Vec<DxFrame>,
}

fn dx_block_csum(fs: &Ext2Fs, dir: Ino, generation: u32, buf: &[u8], tail_off: usize) -> u32 {
    let mut crc = crc32c(fs.sb.csum_seed(), &dir.to_le_bytes());
    crc = crc32c(crc, &generation.to_le_bytes());
    crc32c(crc, &buf[..tail_off])
}

/// Refreshes an index block's checksum and writes it out.
fn write_dx_block(fs: &mut Ext2Fs, dir: Ino, frame_buf: &mut [u8], pblk: Blk, entries_off: usize) -> Result<()> {
    if fs.sb.has_feature_metadata_csum() {
        let limit = usize::from(u16::from_le_bytes([
            frame_buf[entries_off],
            frame_buf[entries_off + 1],
        ]));
        let tail_off = entries_off + limit * DX_ENTRY_SIZE;
        let generation = u32::from_le(fs.read_inode(dir)?.i_generation);
        let crc = dx_block_csum(fs, dir, generation, frame_buf, tail_off + 4);
        frame_buf[tail_off + 4..tail_off + 8].copy_from_slice(&crc.to_le_bytes());
    }
    fs.write_blk(pblk, frame_buf)
}

fn verify_dx_block(fs: &mut Ext2Fs, dir: Ino, frame: &DxFrame) -> Result<()> {
    if !fs.sb.has_feature_metadata_csum() {
        return Ok(());
    }
    let tail_off = frame.entries_off + frame.limit() * DX_ENTRY_SIZE;
    if tail_off + DX_TAIL_SIZE > frame.buf.len() {
        return Err(Error::DirCorrupted);
    }
    let generation = u32::from_le(fs.read_inode(dir)?.i_generation);
    let stored =
        u32::from_le_bytes(frame.buf[tail_off + 4..tail_off + 8].try_into().unwrap());
    if stored != dx_block_csum(fs, dir, generation, &frame.buf, tail_off + 4) {
        return Err(Error::BadChecksum);
    }
    Ok(())
}

/// Returns the hash algorithm and per-name hash for this directory.
fn dir_hash_of(fs: &mut Ext2Fs, diri: &Inode, hash_version: u8, name: &str) -> Result<(u8, u32)> {
    if hash_version > HASH_TEA {
        return Err(Error::DirhashUnsupported);
    }
    let mut hash_alg = hash_version;
    if u32::from_le(fs.sb.s_flags) & FLAGS_UNSIGNED_HASH != 0 {
        hash_alg += 3;
    }
    let seed_raw = fs.sb.s_hash_seed;
    let mut seed = [0u32; 4];
    for (dst, src) in seed.iter_mut().zip(seed_raw) {
        *dst = u32::from_le(src);
    }
    let casefold = diri.flags() & CASEFOLD_FL != 0;
    let (hash, _minor) = dirhash2(
        hash_alg,
        name.as_bytes(),
        fs.charset.as_deref(),
        casefold,
        &seed,
    )?;
    Ok((hash_alg, hash))
}

/// Descends the index towards the leaf that may hold `name`.
fn dx_lookup(fs: &mut Ext2Fs, dir: Ino, diri: &mut Inode, name: &str) -> Result<DxLookup> {
    let mut buf = vec![0u8; fs.block_size() as usize];
    let pblk = load_logical_dir_block(fs, dir, diri, 0, &mut buf)?;

    let hash_version = buf[DX_ROOT_OFF + 4];
    let indirect_levels = usize::from(buf[DX_ROOT_OFF + 6]);
    if indirect_levels >= htree_max_depth(fs) {
        return Err(Error::DirCorrupted);
    }
    let (hash_alg, hash) = dir_hash_of(fs, diri, hash_version, name)?;

    let mut info = DxLookup {
        hash,
        hash_alg,
        frames: Vec::with_capacity(indirect_levels + 1),
    };
    info.frames.push(DxFrame {
        buf,
        pblk,
        entries_off: DX_ROOT_OFF + DX_ROOT_INFO_LEN,
        at: 0,
    });
    for level in 0..=indirect_levels {
        {
            let frame = &mut info.frames[level];
            let count = frame.count();
            if count == 0 || count > frame.limit() {
                return Err(Error::DirCorrupted);
            }
            frame.search(hash);
        }
        verify_dx_block(fs, dir, &info.frames[level])?;
        if level < indirect_levels {
            let child = info.frames[level].entry_block(info.frames[level].at);
            let mut buf = vec![0u8; fs.block_size() as usize];
            let pblk = load_logical_dir_block(fs, dir, diri, child, &mut buf)?;
            info.frames.push(DxFrame {
                buf,
                pblk,
                entries_off: 8,
                at: 0,
            });
        }
    }
    Ok(info)
}

/// Scans a leaf block for `name`.
fn scan_leaf(fs: &Ext2Fs, buf: &[u8], name: &str) -> Option<Ino> {
    let block_size = fs.block_size();
    let mut offset = 0usize;
    while offset < buf.len() - 8 {
        let rec_len = get_rec_len(block_size, buf, offset) as usize;
        if rec_len < 8 || rec_len % 4 != 0 || offset + rec_len > buf.len() {
            return None;
        }
        if dirent_ino(buf, offset) != 0 && dirent_name(buf, offset) == name.as_bytes() {
            return Some(dirent_ino(buf, offset));
        }
        offset += rec_len;
    }
    None
}

/// Hash-indexed name lookup.
pub fn dx_lookup_ino(fs: &mut Ext2Fs, dir: Ino, diri: &mut Inode, name: &str) -> Result<Ino> {
    if diri.flags() & INDEX_FL == 0 {
        return super::linear_lookup(fs, dir, name);
    }
    // "." and ".." live in the root block, outside the index
    if name == "." {
        return Ok(dir);
    }
    let info = dx_lookup(fs, dir, diri, name)?;
    let bottom = info.frames.len() - 1;
    if name == ".." {
        let mut buf = vec![0u8; fs.block_size() as usize];
        load_logical_dir_block(fs, dir, diri, 0, &mut buf)?;
        return Ok(dirent_ino(&buf, 12));
    }
    let mut at = info.frames[bottom].at;
    loop {
        let lblk = info.frames[bottom].entry_block(at);
        let mut buf = vec![0u8; fs.block_size() as usize];
        load_logical_dir_block(fs, dir, diri, lblk, &mut buf)?;
        if let Some(ino) = scan_leaf(fs, &buf, name) {
            return Ok(ino);
        }
        // A hash collision may continue into the next leaf
        let frame = &info.frames[bottom];
        if at + 1 < frame.count() && frame.entry_hash(at + 1) & !1 == info.hash {
            at += 1;
            continue;
        }
        return Err(Error::FileNotFound);
    }
}

/// Inserts a `{ hash, block }` entry after the followed position of the
/// given level.
fn dx_insert_entry(
    fs: &mut Ext2Fs,
    dir: Ino,
    info: &mut DxLookup,
    level: usize,
    hash: u32,
    lblk: Blk,
) -> Result<()> {
    let frame = &mut info.frames[level];
    let count = frame.count();
    let new = frame.at + 1;
    let start = frame.entries_off + new * DX_ENTRY_SIZE;
    let end = frame.entries_off + count * DX_ENTRY_SIZE;
    frame.buf.copy_within(start..end, start + DX_ENTRY_SIZE);
    frame.set_entry(new, hash, lblk);
    frame.set_count(count + 1);
    let (pblk, entries_off) = (frame.pblk, frame.entries_off);
    let mut buf = std::mem::take(&mut info.frames[level].buf);
    let res = write_dx_block(fs, dir, &mut buf, pblk, entries_off);
    info.frames[level].buf = buf;
    res
}

/// Repacks the mapped records into a fresh leaf block.
fn dx_move_dirents(
    fs: &Ext2Fs,
    map: &[(u32, usize, usize)],
    from: &[u8],
    to: &mut [u8],
) -> Result<()> {
    let block_size = fs.block_size();
    let csum_size = if fs.sb.has_feature_metadata_csum() {
        DIRENT_TAIL_SIZE
    } else {
        0
    };
    to.fill(0);
    let mut off = 0usize;
    let mut last_off = 0usize;
    for (_hash, _size, src_off) in map {
        let rec_len = dir_rec_len(dirent_name_len(from, *src_off)) as usize;
        to[off..off + rec_len].copy_from_slice(&from[*src_off..*src_off + rec_len]);
        set_rec_len(block_size, rec_len as u32, to, off)?;
        last_off = off;
        off += rec_len;
    }
    // The last record stretches to the end of the block
    let rec_len = block_size as usize - last_off - csum_size;
    set_rec_len(block_size, rec_len as u32, to, last_off)?;
    if csum_size != 0 {
        initialize_dirent_tail(block_size, to);
    }
    Ok(())
}

/// Splits an overflowing leaf in two by hash order.
#[allow(clippy::too_many_arguments)]
fn dx_split_leaf(
    fs: &mut Ext2Fs,
    dir: Ino,
    diri: &Inode,
    info: &mut DxLookup,
    buf: &mut [u8],
    leaf_pblk: Blk,
    new_lblk: Blk,
    new_pblk: Blk,
) -> Result<()> {
    let block_size = fs.block_size();
    let casefold = diri.flags() & CASEFOLD_FL != 0;
    let seed_raw = fs.sb.s_hash_seed;
    let mut seed = [0u32; 4];
    for (dst, src) in seed.iter_mut().zip(seed_raw) {
        *dst = u32::from_le(src);
    }

    // Hash every live record in the leaf
    let mut map: Vec<(u32, usize, usize)> = Vec::with_capacity(block_size as usize / 12);
    let mut offset = 0usize;
    while offset < buf.len() - 8 {
        let rec_len = get_rec_len(block_size, buf, offset) as usize;
        if rec_len < 8 || rec_len % 4 != 0 || offset + rec_len > buf.len() {
            return Err(Error::DirCorrupted);
        }
        if dirent_name_len(buf, offset) > 0 && dirent_ino(buf, offset) != 0 {
            let (hash, _minor) = dirhash2(
                info.hash_alg,
                dirent_name(buf, offset),
                fs.charset.as_deref(),
                casefold,
                &seed,
            )?;
            map.push((hash, rec_len, offset));
        }
        offset += rec_len;
    }
    map.sort_by_key(|(hash, _, _)| *hash);

    // Pick a split point so each half keeps at least half a block
    let mut move_size = 0usize;
    let mut i = map.len() as isize - 1;
    while i >= 0 {
        if move_size + map[i as usize].1 / 2 > block_size as usize / 2 {
            break;
        }
        move_size += map[i as usize].1;
        i -= 1;
    }
    // First entry to move
    let split = (i + 1) as usize;
    if split == 0 || split >= map.len() {
        return Err(Error::DirNoSpace);
    }

    let mut out = vec![0u8; block_size as usize];
    dx_move_dirents(fs, &map[split..], buf, &mut out)?;
    write_dir_block(fs, new_pblk, &mut out, dir)?;
    dx_move_dirents(fs, &map[..split], buf, &mut out)?;
    write_dir_block(fs, leaf_pblk, &mut out, dir)?;

    let continued = u32::from(map[split].0 == map[split - 1].0);
    let level = info.frames.len() - 1;
    dx_insert_entry(fs, dir, info, level, map[split].0 + continued, new_lblk)
}

/// Grows the tree when the target leaf is full: splits the leaf, splits an
/// interior node, or deepens the tree by rewriting the root.
fn dx_grow_tree(
    fs: &mut Ext2Fs,
    dir: Ino,
    diri: &mut Inode,
    info: &mut DxLookup,
    leaf_buf: &mut [u8],
    leaf_pblk: Blk,
) -> Result<()> {
    let block_size = fs.block_size();
    let levels = info.frames.len();
    // Lowest level that can take another child
    let mut fit: isize = levels as isize - 1;
    while fit >= 0 {
        let frame = &info.frames[fit as usize];
        if frame.count() < frame.limit() {
            break;
        }
        fit -= 1;
    }
    if fit < 0 && levels >= htree_max_depth(fs) {
        return Err(Error::DirNoSpace);
    }

    // Append one block to the directory
    let lblk = diri.size() / u64::from(block_size);
    diri.set_size(diri.size() + u64::from(block_size));
    let mut pblk = 0;
    bmap2(fs, dir, diri, BMAP_ALLOC | BMAP_ZERO, lblk, &mut pblk)?;
    fs.write_inode(dir, diri)?;

    if fit == levels as isize - 1 {
        return dx_split_leaf(fs, dir, diri, info, leaf_buf, leaf_pblk, lblk, pblk);
    }

    // The new block becomes an interior index node
    let mut nbuf = vec![0u8; block_size as usize];
    set_rec_len(block_size, block_size, &mut nbuf, 0)?;
    let limit = dx_node_limit(fs);

    if fit < 0 {
        // Grow the tree depth: the root's entries move into the new node
        let count = info.frames[0].count();
        let src = info.frames[0].entries_off;
        nbuf[8..8 + count * DX_ENTRY_SIZE]
            .copy_from_slice(&info.frames[0].buf[src..src + count * DX_ENTRY_SIZE]);
        nbuf[8..10].copy_from_slice(&(limit as u16).to_le_bytes());
        nbuf[10..12].copy_from_slice(&(count as u16).to_le_bytes());
        write_dx_block(fs, dir, &mut nbuf, pblk, 8)?;

        let root = &mut info.frames[0];
        root.set_count(1);
        // Entry 0 overlays the count/limit header; only its block half is
        // a real field
        let off = root.entries_off + 4;
        root.buf[off..off + 4].copy_from_slice(&(lblk as u32).to_le_bytes());
        // One more level of indirection
        root.buf[DX_ROOT_OFF + 6] += 1;
        let (root_pblk, root_off) = (root.pblk, root.entries_off);
        let mut buf = std::mem::take(&mut info.frames[0].buf);
        let res = write_dx_block(fs, dir, &mut buf, root_pblk, root_off);
        info.frames[0].buf = buf;
        res
    } else {
        // Split the interior node below `fit` in two
        let child = (fit + 1) as usize;
        let count = info.frames[child].count();
        let count1 = count / 2;
        let count2 = count - count1;
        let split_hash = info.frames[child].entry_hash(count1);

        let src = info.frames[child].entries_off + count1 * DX_ENTRY_SIZE;
        nbuf[8..8 + count2 * DX_ENTRY_SIZE]
            .copy_from_slice(&info.frames[child].buf[src..src + count2 * DX_ENTRY_SIZE]);
        nbuf[8..10].copy_from_slice(&(limit as u16).to_le_bytes());
        nbuf[10..12].copy_from_slice(&(count2 as u16).to_le_bytes());
        info.frames[child].set_count(count1);

        dx_insert_entry(fs, dir, info, fit as usize, split_hash, lblk)?;

        let (child_pblk, child_off) = (info.frames[child].pblk, info.frames[child].entries_off);
        let mut buf = std::mem::take(&mut info.frames[child].buf);
        let res = write_dx_block(fs, dir, &mut buf, child_pblk, child_off);
        info.frames[child].buf = buf;
        res?;
        write_dx_block(fs, dir, &mut nbuf, pblk, 8)
    }
}

/// Adds a name to a hash-indexed directory.
pub fn dx_link(
    fs: &mut Ext2Fs,
    dir: Ino,
    diri: &mut Inode,
    name: &str,
    ino: Ino,
    file_type: u8,
) -> Result<()> {
    let mut restart = 0usize;
    loop {
        let mut info = dx_lookup(fs, dir, diri, name)?;
        let bottom = info.frames.len() - 1;
        let leaf_lblk = info.frames[bottom].entry_block(info.frames[bottom].at);
        let mut buf = vec![0u8; fs.block_size() as usize];
        let leaf_pblk = load_logical_dir_block(fs, dir, diri, leaf_lblk, &mut buf)?;
        if add_dirent_to_buf(fs, &mut buf, name, ino, file_type)? {
            return write_dir_block(fs, leaf_pblk, &mut buf, dir);
        }
        // Growing may take one pass per level: split a node, then add the
        // new leaf
        if restart > info.frames.len() {
            return Err(Error::DirNoSpace);
        }
        dx_grow_tree(fs, dir, diri, &mut info, &mut buf, leaf_pblk)?;
        restart += 1;
    }
}

/// Converts a single-block linear directory into an HTree root with one
/// leaf.
pub fn dx_convert(fs: &mut Ext2Fs, dir: Ino, diri: &mut Inode) -> Result<()> {
    let block_size = fs.block_size();
    let mut buf = vec![0u8; block_size as usize];
    let root_pblk = load_logical_dir_block(fs, dir, diri, 0, &mut buf)?;

    // Collect everything except "." and ".."
    let mut parent = dir;
    let mut map: Vec<(u32, usize, usize)> = Vec::new();
    let mut offset = 0usize;
    while offset < buf.len() - 8 {
        let rec_len = get_rec_len(block_size, &buf, offset) as usize;
        if rec_len < 8 || rec_len % 4 != 0 || offset + rec_len > buf.len() {
            return Err(Error::DirCorrupted);
        }
        let name = dirent_name(&buf, offset);
        if dirent_ino(&buf, offset) != 0 {
            if name == b".." {
                parent = dirent_ino(&buf, offset);
            } else if name != b"." && !name.is_empty() {
                map.push((0, rec_len, offset));
            }
        }
        offset += rec_len;
    }

    // Move them into a new leaf at logical block 1
    diri.set_size(2 * u64::from(block_size));
    let mut leaf_pblk = 0;
    bmap2(fs, dir, diri, BMAP_ALLOC | BMAP_ZERO, 1, &mut leaf_pblk)?;
    let mut leaf = vec![0u8; block_size as usize];
    if map.is_empty() {
        let csum_size = if fs.sb.has_feature_metadata_csum() {
            DIRENT_TAIL_SIZE as u32
        } else {
            0
        };
        set_rec_len(block_size, block_size - csum_size, &mut leaf, 0)?;
        if csum_size != 0 {
            initialize_dirent_tail(block_size, &mut leaf);
        }
    } else {
        dx_move_dirents(fs, &map, &buf, &mut leaf)?;
    }
    write_dir_block(fs, leaf_pblk, &mut leaf, dir)?;

    // Rebuild block 0 as the index root
    let filetype = fs.sb.has_feature_filetype();
    buf.fill(0);
    super::put_dirent(block_size, &mut buf, 0, dir, 12, b".", super::FT_DIR, filetype)?;
    super::put_dirent(
        block_size,
        &mut buf,
        12,
        parent,
        block_size - 12,
        b"..",
        super::FT_DIR,
        filetype,
    )?;
    buf[DX_ROOT_OFF + 4] = fs.sb.s_def_hash_version;
    buf[DX_ROOT_OFF + 5] = DX_ROOT_INFO_LEN as u8;
    let entries_off = DX_ROOT_OFF + DX_ROOT_INFO_LEN;
    buf[entries_off..entries_off + 2]
        .copy_from_slice(&(dx_root_limit(fs) as u16).to_le_bytes());
    buf[entries_off + 2..entries_off + 4].copy_from_slice(&1u16.to_le_bytes());
    buf[entries_off + 4..entries_off + 8].copy_from_slice(&1u32.to_le_bytes());
    write_dx_block(fs, dir, &mut buf, root_pblk, entries_off)?;

    diri.flags_set(INDEX_FL);
    fs.write_inode(dir, diri)
}

#[cfg(test)]
mod test {
    use super::super::test::dir_fs;
    use super::super::{FT_REG_FILE, link, lookup, mkdir};
    use super::*;
    use crate::dir::{DIRENT_ABORT, dir_iterate};
    use crate::inode::S_IFREG;
    use crate::{ROOT_INO, sb};

    fn new_file_ino(fs: &mut Ext2Fs) -> Ino {
        let ino = fs.new_inode(0).unwrap();
        fs.inode_alloc_stats(ino, 1, false);
        let mut inode = Inode::new();
        inode.i_mode = (S_IFREG | 0o644).to_le();
        inode.i_links_count = 1u16.to_le();
        fs.write_new_inode(ino, &mut inode).unwrap();
        ino
    }

    #[test]
    fn directory_converts_and_grows_htree() {
        let (path, mut fs) = dir_fs(sb::FEATURE_COMPAT_DIR_INDEX, 0);
        let dir = mkdir(&mut fs, ROOT_INO, None, Some("work")).unwrap();

        let mut inodes = Vec::new();
        for i in 0..2000 {
            let name = format!("file{i:04}");
            let ino = new_file_ino(&mut fs);
            link(&mut fs, dir, &name, ino, FT_REG_FILE).unwrap();
            inodes.push((name, ino));
        }
        // Every previously inserted name still resolves
        for (name, ino) in &inodes {
            assert_eq!(lookup(&mut fs, dir, name).unwrap(), *ino, "{name}");
        }
        let diri = fs.read_inode(dir).unwrap();
        assert_ne!(diri.flags() & INDEX_FL, 0);

        // dot, dotdot, and all 2000 names
        let mut seen = 0usize;
        dir_iterate(&mut fs, dir, 0, &mut |_kind, _off, _buf| {
            seen += 1;
            Ok(0)
        })
        .unwrap();
        assert_eq!(seen, 2002);
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn lookup_aborts_early() {
        let (path, mut fs) = dir_fs(sb::FEATURE_COMPAT_DIR_INDEX, 0);
        let dir = mkdir(&mut fs, ROOT_INO, None, Some("d")).unwrap();
        for i in 0..100 {
            let ino = new_file_ino(&mut fs);
            link(&mut fs, dir, &format!("n{i}"), ino, FT_REG_FILE).unwrap();
        }
        // A linear iteration can stop after the first hit
        let mut calls = 0;
        dir_iterate(&mut fs, dir, 0, &mut |_kind, _off, _buf| {
            calls += 1;
            Ok(DIRENT_ABORT)
        })
        .unwrap();
        assert_eq!(calls, 1);
        std::fs::remove_file(path).unwrap();
    }
}
