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

//! Extent tree cursor.
//!
//! An extent-mapped inode stores its block map as a tree whose root lives in
//! the 60-byte `i_block` area. Every node starts with a header
//! `{ magic, entries, max, depth, generation }` followed by 12-byte records:
//! leaf extents `{ logical, length, physical }` at depth 0, index records
//! `{ logical, child block }` above. Entries are sorted by logical block and
//! extents never overlap.
//!
//! [`ExtentHandle`] keeps a private copy of the inode and a path of loaded
//! nodes from the root to the current position. Root mutations are written
//! through to the inode table immediately; callers holding their own inode
//! copy refresh it from [`ExtentHandle::inode`] when done.

use crate::csum::crc32c;
use crate::error::{Error, Result};
use crate::fs::Ext2Fs;
use crate::inode::{EXTENTS_FL, Inode};
use crate::{Blk, INODE_BLOCK_BYTES, Ino};

/// Magic number of an extent node header.
pub const EXTENT_MAGIC: u16 = 0xF30A;
/// Size of a node header or entry.
const ENTRY_SIZE: usize = 12;
/// Maximum length of an initialized extent.
pub const INIT_MAX_LEN: u32 = 32768;
/// Maximum depth of an extent tree.
const MAX_DEPTH: u16 = 5;

/// A decoded leaf extent.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Extent {
    /// First logical block covered.
    pub e_lblk: Blk,
    /// First physical block.
    pub e_pblk: Blk,
    /// Number of blocks covered.
    pub e_len: u32,
    /// The extent reserves space but reads as zeros.
    pub uninit: bool,
}

impl Extent {
    /// Returns the first logical block past the extent.
    pub fn next_lblk(&self) -> Blk {
        self.e_lblk + u64::from(self.e_len)
    }
}

fn get_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([buf[off], buf[off + 1]])
}

fn get_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(buf[off..off + 4].try_into().unwrap())
}

fn put_u16(buf: &mut [u8], off: usize, val: u16) {
    buf[off..off + 2].copy_from_slice(&val.to_le_bytes());
}

fn put_u32(buf: &mut [u8], off: usize, val: u32) {
    buf[off..off + 4].copy_from_slice(&val.to_le_bytes());
}

/// One level of the cursor's root-to-leaf path.
struct PathNode {
    /// Raw node: the inode's `i_block` area for the root, a block otherwise.
    buf: Vec<u8>,
    /// Physical block of the node, 0 for the root.
    pblk: Blk,
    /// Current entry.
    index: usize,
}

impl PathNode {
    fn entries(&self) -> usize {
        usize::from(get_u16(&self.buf, 2))
    }

    fn set_entries(&mut self, count: usize) {
        put_u16(&mut self.buf, 2, count as u16);
    }

    fn max_entries(&self) -> usize {
        usize::from(get_u16(&self.buf, 4))
    }

    fn depth(&self) -> u16 {
        get_u16(&self.buf, 6)
    }

    fn is_leaf(&self) -> bool {
        self.depth() == 0
    }

    /// Returns the logical block of entry `i` (leaf or index).
    fn entry_lblk(&self, i: usize) -> Blk {
        u64::from(get_u32(&self.buf, ENTRY_SIZE * (i + 1)))
    }

    /// Decodes leaf entry `i`.
    fn extent(&self, i: usize) -> Extent {
        let off = ENTRY_SIZE * (i + 1);
        let raw_len = u32::from(get_u16(&self.buf, off + 4));
        let (e_len, uninit) = if raw_len > INIT_MAX_LEN {
            (raw_len - INIT_MAX_LEN, true)
        } else {
            (raw_len, false)
        };
        let pblk_hi = u64::from(get_u16(&self.buf, off + 6));
        let pblk_lo = u64::from(get_u32(&self.buf, off + 8));
        Extent {
            e_lblk: u64::from(get_u32(&self.buf, off)),
            e_pblk: pblk_lo | (pblk_hi << 32),
            e_len,
            uninit,
        }
    }

    /// Encodes leaf entry `i`.
    fn set_extent(&mut self, i: usize, ext: &Extent) {
        let off = ENTRY_SIZE * (i + 1);
        let raw_len = if ext.uninit {
            ext.e_len + INIT_MAX_LEN
        } else {
            ext.e_len
        };
        put_u32(&mut self.buf, off, ext.e_lblk as u32);
        put_u16(&mut self.buf, off + 4, raw_len as u16);
        put_u16(&mut self.buf, off + 6, (ext.e_pblk >> 32) as u16);
        put_u32(&mut self.buf, off + 8, ext.e_pblk as u32);
    }

    /// Returns the child block of index entry `i`.
    fn child(&self, i: usize) -> Blk {
        let off = ENTRY_SIZE * (i + 1);
        let lo = u64::from(get_u32(&self.buf, off + 4));
        let hi = u64::from(get_u16(&self.buf, off + 8));
        lo | (hi << 32)
    }

    /// Encodes index entry `i`.
    fn set_index(&mut self, i: usize, lblk: Blk, child: Blk) {
        let off = ENTRY_SIZE * (i + 1);
        put_u32(&mut self.buf, off, lblk as u32);
        put_u32(&mut self.buf, off + 4, child as u32);
        put_u16(&mut self.buf, off + 8, (child >> 32) as u16);
        put_u16(&mut self.buf, off + 10, 0);
    }

    /// Shifts entries `from..entries` right by one slot.
    fn open_slot(&mut self, from: usize) {
        let entries = self.entries();
        let start = ENTRY_SIZE * (from + 1);
        let end = ENTRY_SIZE * (entries + 1);
        self.buf.copy_within(start..end, start + ENTRY_SIZE);
    }

    /// Removes entry `i`, shifting the tail left.
    fn remove_slot(&mut self, i: usize) {
        let entries = self.entries();
        let start = ENTRY_SIZE * (i + 2);
        let end = ENTRY_SIZE * (entries + 1);
        self.buf.copy_within(start..end, start - ENTRY_SIZE);
        self.set_entries(entries - 1);
    }

    /// Returns the position of the last entry whose logical block is
    /// `<= lblk`, if any.
    fn search(&self, lblk: Blk) -> Option<usize> {
        let entries = self.entries();
        if entries == 0 || self.entry_lblk(0) > lblk {
            return None;
        }
        let mut lo = 0;
        let mut hi = entries - 1;
        while lo < hi {
            let mid = (lo + hi + 1) / 2;
            if self.entry_lblk(mid) <= lblk {
                lo = mid;
            } else {
                hi = mid - 1;
            }
        }
        Some(lo)
    }
}

/// Writes a fresh node header.
fn init_header(buf: &mut [u8], max: usize, depth: u16) {
    put_u16(buf, 0, EXTENT_MAGIC);
    put_u16(buf, 2, 0);
    put_u16(buf, 4, max as u16);
    put_u16(buf, 6, depth);
    put_u32(buf, 8, 0);
}

/// A cursor over an inode's extent tree.
pub struct ExtentHandle {
    ino: Ino,
    inode: Inode,
    path: Vec<PathNode>,
}

impl ExtentHandle {
    /// Opens a cursor on the given inode's extent tree.
    ///
    /// The handle works on a private copy of `inode`; the caller refreshes
    /// its own copy from [`ExtentHandle::inode`] after mutating operations.
    pub fn open(ino: Ino, inode: &Inode) -> Result<Self> {
        if inode.flags() & EXTENTS_FL == 0 {
            return Err(Error::InvalidArgument);
        }
        let blocks = inode.i_block;
        let mut root = vec![0u8; INODE_BLOCK_BYTES];
        for (i, slot) in blocks.iter().enumerate() {
            root[i * 4..(i + 1) * 4].copy_from_slice(&u32::from_le(*slot).to_le_bytes());
        }
        if root.iter().all(|b| *b == 0) {
            // Fresh inode: start an empty tree
            init_header(&mut root, (INODE_BLOCK_BYTES - ENTRY_SIZE) / ENTRY_SIZE, 0);
        }
        if get_u16(&root, 0) != EXTENT_MAGIC {
            return Err(Error::BadMagic);
        }
        if get_u16(&root, 6) > MAX_DEPTH {
            return Err(Error::DirCorrupted);
        }
        Ok(Self {
            ino,
            inode: *inode,
            path: vec![PathNode {
                buf: root,
                pblk: 0,
                index: 0,
            }],
        })
    }

    /// Returns the handle's (current) copy of the inode.
    pub fn inode(&self) -> &Inode {
        &self.inode
    }

    /// Maximum entries of a non-root node.
    fn node_max(&self, fs: &Ext2Fs) -> usize {
        let tail = if fs.sb.has_feature_metadata_csum() {
            4
        } else {
            0
        };
        (fs.block_size() as usize - ENTRY_SIZE - tail) / ENTRY_SIZE
    }

    fn block_csum(&self, fs: &Ext2Fs, buf: &[u8]) -> u32 {
        let max = usize::from(get_u16(buf, 4));
        let tail_off = ENTRY_SIZE * (max + 1);
        let mut crc = crc32c(fs.sb.csum_seed(), &self.ino.to_le_bytes());
        crc = crc32c(crc, &u32::from_le(self.inode.i_generation).to_le_bytes());
        crc32c(crc, &buf[..tail_off])
    }

    /// Reads and validates a non-root node.
    fn read_node(&self, fs: &mut Ext2Fs, pblk: Blk) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; fs.block_size() as usize];
        fs.read_blk(pblk, &mut buf)?;
        if get_u16(&buf, 0) != EXTENT_MAGIC {
            return Err(Error::BadMagic);
        }
        let entries = usize::from(get_u16(&buf, 2));
        let max = usize::from(get_u16(&buf, 4));
        if entries > max || ENTRY_SIZE * (max + 1) + 4 > buf.len() {
            return Err(Error::DirCorrupted);
        }
        if fs.sb.has_feature_metadata_csum() {
            let tail_off = ENTRY_SIZE * (max + 1);
            let stored = get_u32(&buf, tail_off);
            if stored != self.block_csum(fs, &buf) {
                return Err(Error::BadChecksum);
            }
        }
        Ok(buf)
    }

    /// Writes the node at the given path level back to disk.
    fn write_node(&mut self, fs: &mut Ext2Fs, level: usize) -> Result<()> {
        if level == 0 {
            let buf = &self.path[0].buf;
            let mut blocks = [0u32; crate::inode::N_BLOCKS];
            for (i, slot) in blocks.iter_mut().enumerate() {
                *slot = u32::from_le_bytes(buf[i * 4..(i + 1) * 4].try_into().unwrap()).to_le();
            }
            self.inode.i_block = blocks;
            fs.write_inode(self.ino, &self.inode)
        } else {
            if fs.sb.has_feature_metadata_csum() {
                let crc = self.block_csum(fs, &self.path[level].buf);
                let max = self.path[level].max_entries();
                put_u32(&mut self.path[level].buf, ENTRY_SIZE * (max + 1), crc);
            }
            let node = &self.path[level];
            let (pblk, buf) = (node.pblk, node.buf.clone());
            fs.write_blk(pblk, &buf)
        }
    }

    /// Positions the cursor at the extent containing `lblk`, or at the
    /// closest extent before or after it.
    ///
    /// Returns [`Error::ExtentNotFound`] when `lblk` falls before the first
    /// extent or the tree is empty; the cursor is then left at the first
    /// extent, if any.
    pub fn goto(&mut self, fs: &mut Ext2Fs, lblk: Blk) -> Result<()> {
        self.path.truncate(1);
        self.path[0].index = 0;
        let mut level = 0;
        loop {
            let node = &self.path[level];
            if node.entries() == 0 {
                return if level == 0 {
                    Err(Error::ExtentNotFound)
                } else {
                    Err(Error::DirCorrupted)
                };
            }
            let hit = node.search(lblk);
            let index = hit.unwrap_or(0);
            self.path[level].index = index;
            if self.path[level].is_leaf() {
                return match hit {
                    Some(_) => Ok(()),
                    None => Err(Error::ExtentNotFound),
                };
            }
            let child = self.path[level].child(index);
            let buf = self.read_node(fs, child)?;
            self.path.push(PathNode {
                buf,
                pblk: child,
                index: 0,
            });
            level += 1;
        }
    }

    /// Returns the extent under the cursor.
    pub fn current(&self) -> Result<Extent> {
        let node = self.path.last().unwrap();
        if !node.is_leaf() || node.index >= node.entries() {
            return Err(Error::NoCurrentNode);
        }
        Ok(node.extent(node.index))
    }

    /// Advances to the next leaf extent and returns it.
    pub fn next_leaf(&mut self, fs: &mut Ext2Fs) -> Result<Extent> {
        let bottom = self.path.len() - 1;
        if !self.path[bottom].is_leaf() {
            return Err(Error::NoCurrentNode);
        }
        if self.path[bottom].index + 1 < self.path[bottom].entries() {
            self.path[bottom].index += 1;
            return self.current();
        }
        // Climb to the first ancestor with a next entry
        let mut level = bottom;
        loop {
            if level == 0 {
                return Err(Error::ExtentNoNext);
            }
            level -= 1;
            if self.path[level].index + 1 < self.path[level].entries() {
                break;
            }
        }
        self.path[level].index += 1;
        self.path.truncate(level + 1);
        // Descend along the leftmost edge
        while !self.path.last().unwrap().is_leaf() {
            let node = self.path.last().unwrap();
            let child = node.child(node.index);
            let buf = self.read_node(fs, child)?;
            self.path.push(PathNode {
                buf,
                pblk: child,
                index: 0,
            });
        }
        self.current()
    }

    /// Overwrites the extent under the cursor.
    pub fn replace(&mut self, fs: &mut Ext2Fs, ext: &Extent) -> Result<()> {
        let bottom = self.path.len() - 1;
        let node = &mut self.path[bottom];
        if !node.is_leaf() || node.index >= node.entries() {
            return Err(Error::NoCurrentNode);
        }
        let index = node.index;
        node.set_extent(index, ext);
        self.write_node(fs, bottom)
    }

    /// Propagates the first logical block of each node up to its parent.
    ///
    /// Needed after an operation that changed the lowest key of a node.
    pub fn fix_parents(&mut self, fs: &mut Ext2Fs) -> Result<()> {
        if self.path.last().unwrap().entries() == 0 {
            return Ok(());
        }
        for level in (1..self.path.len()).rev() {
            let first = self.path[level].entry_lblk(0);
            let parent = &mut self.path[level - 1];
            let index = parent.index;
            let child = parent.child(index);
            if parent.entry_lblk(index) != first {
                parent.set_index(index, first, child);
                self.write_node(fs, level - 1)?;
            }
        }
        Ok(())
    }

    /// Splits a full node on the path (or grows the root) to make room,
    /// then leaves the path in need of a fresh [`ExtentHandle::goto`].
    fn make_room(&mut self, fs: &mut Ext2Fs) -> Result<()> {
        // Deepest level that still has room
        let mut level = None;
        for (i, node) in self.path.iter().enumerate() {
            if node.entries() < node.max_entries() {
                level = Some(i);
            }
        }
        match level {
            Some(parent) if parent + 1 < self.path.len() => self.split_child(fs, parent),
            _ => self.grow_root(fs),
        }
    }

    /// Moves the root's entries into a fresh block, deepening the tree.
    fn grow_root(&mut self, fs: &mut Ext2Fs) -> Result<()> {
        let root_depth = self.path[0].depth();
        if root_depth + 1 > MAX_DEPTH {
            return Err(Error::FileTooBig);
        }
        let goal = fs.find_inode_goal(self.ino, &self.inode);
        let blk = fs.alloc_block(goal)?;
        self.inode.iblk_add_blocks(fs.block_size(), 1);

        let entries = self.path[0].entries();
        let mut buf = vec![0u8; fs.block_size() as usize];
        init_header(&mut buf, self.node_max(fs), root_depth);
        put_u16(&mut buf, 2, entries as u16);
        buf[ENTRY_SIZE..ENTRY_SIZE * (entries + 1)]
            .copy_from_slice(&self.path[0].buf[ENTRY_SIZE..ENTRY_SIZE * (entries + 1)]);

        let first_lblk = self.path[0].entry_lblk(0);
        let node = PathNode {
            buf,
            pblk: blk,
            index: 0,
        };
        self.path.truncate(1);
        self.path.push(node);
        self.write_node(fs, 1)?;

        let root = &mut self.path[0];
        root.buf[ENTRY_SIZE..].fill(0);
        put_u16(&mut root.buf, 6, root_depth + 1);
        root.set_entries(1);
        root.set_index(0, first_lblk, blk);
        root.index = 0;
        self.write_node(fs, 0)
    }

    /// Splits the full child under `parent`, which has room for the new
    /// sibling's index entry.
    fn split_child(&mut self, fs: &mut Ext2Fs, parent: usize) -> Result<()> {
        let child = parent + 1;
        let entries = self.path[child].entries();
        let keep = entries / 2;
        let moved = entries - keep;

        let goal = self.path[child].pblk;
        let blk = fs.alloc_block(goal)?;
        self.inode.iblk_add_blocks(fs.block_size(), 1);
        fs.write_inode(self.ino, &self.inode)?;

        let mut buf = vec![0u8; fs.block_size() as usize];
        init_header(&mut buf, self.node_max(fs), self.path[child].depth());
        put_u16(&mut buf, 2, moved as u16);
        buf[ENTRY_SIZE..ENTRY_SIZE * (moved + 1)].copy_from_slice(
            &self.path[child].buf[ENTRY_SIZE * (keep + 1)..ENTRY_SIZE * (entries + 1)],
        );
        let split_lblk = self.path[child].entry_lblk(keep);

        self.path[child].set_entries(keep);
        self.write_node(fs, child)?;

        // Write the new sibling through a temporary path slot
        let insert_at = self.path[parent].index + 1;
        self.path.truncate(child);
        self.path.push(PathNode {
            buf,
            pblk: blk,
            index: 0,
        });
        self.write_node(fs, child)?;
        self.path.truncate(child);

        let parent_node = &mut self.path[parent];
        parent_node.open_slot(insert_at);
        parent_node.set_entries(parent_node.entries() + 1);
        parent_node.set_index(insert_at, split_lblk, blk);
        self.write_node(fs, parent)
    }

    /// Inserts a new extent at its ordered position.
    pub fn insert(&mut self, fs: &mut Ext2Fs, ext: &Extent) -> Result<()> {
        if ext.e_len == 0 || ext.e_len > INIT_MAX_LEN {
            return Err(Error::InvalidArgument);
        }
        loop {
            match self.goto(fs, ext.e_lblk) {
                Ok(()) | Err(Error::ExtentNotFound) => {}
                Err(e) => return Err(e),
            }
            let bottom = self.path.len() - 1;
            let node = &self.path[bottom];
            if node.entries() < node.max_entries() {
                break;
            }
            self.make_room(fs)?;
        }
        let bottom = self.path.len() - 1;
        let node = &mut self.path[bottom];
        let pos = match node.search(ext.e_lblk) {
            Some(i) => i + 1,
            None => 0,
        };
        if pos < node.entries() {
            node.open_slot(pos);
        }
        node.set_entries(node.entries() + 1);
        node.set_extent(pos, ext);
        node.index = pos;
        self.write_node(fs, bottom)?;
        if pos == 0 {
            self.fix_parents(fs)?;
        }
        Ok(())
    }

    /// Deletes the extent under the cursor.
    ///
    /// Emptied interior nodes are freed and unlinked from their parents.
    pub fn delete(&mut self, fs: &mut Ext2Fs) -> Result<()> {
        let bottom = self.path.len() - 1;
        {
            let node = &self.path[bottom];
            if !node.is_leaf() || node.index >= node.entries() {
                return Err(Error::NoCurrentNode);
            }
        }
        let mut level = bottom;
        loop {
            let index = self.path[level].index;
            self.path[level].remove_slot(index);
            if self.path[level].entries() > 0 || level == 0 {
                self.write_node(fs, level)?;
                break;
            }
            // The node is empty: release it and unlink from the parent
            let pblk = self.path[level].pblk;
            fs.block_alloc_stats(pblk, -1);
            self.inode.iblk_sub_blocks(fs.block_size(), 1);
            fs.write_inode(self.ino, &self.inode)?;
            self.path.truncate(level);
            level -= 1;
        }
        Ok(())
    }

    /// Maps `lblk` to `pblk`, replacing any previous mapping.
    ///
    /// Splits the covering extent as needed; `uninit` marks the new
    /// single-block mapping as unwritten.
    pub fn set_bmap(&mut self, fs: &mut Ext2Fs, lblk: Blk, pblk: Blk, uninit: bool) -> Result<()> {
        let single = Extent {
            e_lblk: lblk,
            e_pblk: pblk,
            e_len: 1,
            uninit,
        };
        match self.goto(fs, lblk) {
            Ok(()) => {}
            Err(Error::ExtentNotFound) => return self.insert(fs, &single),
            Err(e) => return Err(e),
        }
        let ext = self.current()?;
        let covered = lblk >= ext.e_lblk && lblk < ext.next_lblk();
        if !covered {
            // Hole right after the current extent: extend it when contiguous
            if ext.next_lblk() == lblk
                && ext.e_pblk + u64::from(ext.e_len) == pblk
                && ext.uninit == uninit
                && ext.e_len + 1 <= extent_max_len(uninit)
            {
                let grown = Extent {
                    e_len: ext.e_len + 1,
                    ..ext
                };
                return self.replace(fs, &grown);
            }
            return self.insert(fs, &single);
        }

        let off = (lblk - ext.e_lblk) as u32;
        if ext.e_pblk + u64::from(off) == pblk && ext.uninit == uninit {
            return Ok(());
        }
        // Split into up to three parts around the remapped block
        let mut parts = Vec::with_capacity(3);
        if off > 0 {
            parts.push(Extent {
                e_len: off,
                ..ext
            });
        }
        parts.push(single);
        if off + 1 < ext.e_len {
            parts.push(Extent {
                e_lblk: lblk + 1,
                e_pblk: ext.e_pblk + u64::from(off) + 1,
                e_len: ext.e_len - off - 1,
                uninit: ext.uninit,
            });
        }
        self.replace(fs, &parts[0])?;
        for part in &parts[1..] {
            self.insert(fs, part)?;
        }
        self.goto(fs, lblk)?;
        self.fix_parents(fs)
    }
}

/// Maximum encodable length for an extent.
fn extent_max_len(uninit: bool) -> u32 {
    if uninit {
        INIT_MAX_LEN - 1
    } else {
        INIT_MAX_LEN
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use crate::alloc_tables::allocate_tables;
    use crate::fs::FsParams;
    use crate::inode::S_IFREG;
    use crate::io::{FileIo, IoChannel};
    use crate::sb;

    pub(crate) fn extent_fs() -> (std::path::PathBuf, Ext2Fs) {
        let path = std::env::temp_dir().join(format!("e2img-extent-{}", uuid::Uuid::new_v4()));
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
            feature_incompat: sb::FEATURE_INCOMPAT_FILETYPE | sb::FEATURE_INCOMPAT_EXTENTS,
            ..Default::default()
        };
        let mut fs = Ext2Fs::initialize(io, &params).unwrap();
        allocate_tables(&mut fs).unwrap();
        (path, fs)
    }

    fn new_extent_inode(fs: &mut Ext2Fs) -> (crate::Ino, Inode) {
        let ino = fs.new_inode(0).unwrap();
        fs.inode_alloc_stats(ino, 1, false);
        let mut inode = Inode::new();
        inode.i_mode = (S_IFREG | 0o644).to_le();
        inode.i_links_count = 1u16.to_le();
        inode.flags_set(EXTENTS_FL);
        fs.write_new_inode(ino, &mut inode).unwrap();
        (ino, inode)
    }

    #[test]
    fn empty_tree_reports_not_found() {
        let (path, mut fs) = extent_fs();
        let (ino, inode) = new_extent_inode(&mut fs);
        let mut handle = ExtentHandle::open(ino, &inode).unwrap();
        assert!(matches!(
            handle.goto(&mut fs, 0),
            Err(Error::ExtentNotFound)
        ));
        assert!(matches!(handle.current(), Err(Error::NoCurrentNode)));
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn set_and_lookup_single_blocks() {
        let (path, mut fs) = extent_fs();
        let (ino, mut inode) = new_extent_inode(&mut fs);
        let mut handle = ExtentHandle::open(ino, &inode).unwrap();
        let b1 = fs.alloc_block(0).unwrap();
        let b2 = fs.alloc_block(b1).unwrap();
        handle.set_bmap(&mut fs, 0, b1, false).unwrap();
        handle.set_bmap(&mut fs, 1, b2, false).unwrap();
        inode = *handle.inode();

        let mut handle = ExtentHandle::open(ino, &inode).unwrap();
        handle.goto(&mut fs, 0).unwrap();
        let ext = handle.current().unwrap();
        assert_eq!(ext.e_lblk, 0);
        assert_eq!(ext.e_pblk, b1);
        handle.goto(&mut fs, 1).unwrap();
        let ext = handle.current().unwrap();
        assert!(ext.e_lblk <= 1 && ext.next_lblk() > 1);
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn contiguous_mappings_merge() {
        let (path, mut fs) = extent_fs();
        let (ino, inode) = new_extent_inode(&mut fs);
        let mut handle = ExtentHandle::open(ino, &inode).unwrap();
        let base = fs.get_free_blocks(0, fs.sb.blocks_count() - 1, 8).unwrap();
        for i in 0..8u64 {
            fs.block_alloc_stats(base + i, 1);
            handle.set_bmap(&mut fs, i, base + i, false).unwrap();
        }
        handle.goto(&mut fs, 0).unwrap();
        let ext = handle.current().unwrap();
        assert_eq!(ext.e_len, 8);
        assert_eq!(ext.e_pblk, base);
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn root_overflow_grows_depth() {
        let (path, mut fs) = extent_fs();
        let (ino, mut inode) = new_extent_inode(&mut fs);
        let mut handle = ExtentHandle::open(ino, &inode).unwrap();
        // Discontiguous logical blocks defeat merging, overflowing the
        // 4-entry root
        let mut mappings = Vec::new();
        for i in 0..12u64 {
            let blk = fs.alloc_block(0).unwrap();
            handle.set_bmap(&mut fs, i * 10, blk, false).unwrap();
            mappings.push((i * 10, blk));
        }
        inode = *handle.inode();
        assert!(get_u16(&inode.i_block[0].to_le_bytes(), 0) == EXTENT_MAGIC);

        let mut handle = ExtentHandle::open(ino, &inode).unwrap();
        for (lblk, pblk) in mappings {
            handle.goto(&mut fs, lblk).unwrap();
            let ext = handle.current().unwrap();
            assert_eq!(ext.e_lblk, lblk);
            assert_eq!(ext.e_pblk, pblk);
        }
        // Depth must have grown past the inline root
        assert!(get_u16(&handle.path[0].buf, 6) >= 1);
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn uninit_split_on_remap() {
        let (path, mut fs) = extent_fs();
        let (ino, mut inode) = new_extent_inode(&mut fs);
        let mut handle = ExtentHandle::open(ino, &inode).unwrap();
        let base = fs.get_free_blocks(0, fs.sb.blocks_count() - 1, 10).unwrap();
        for i in 0..10 {
            fs.block_alloc_stats(base + i, 1);
        }
        handle
            .insert(
                &mut fs,
                &Extent {
                    e_lblk: 0,
                    e_pblk: base,
                    e_len: 10,
                    uninit: true,
                },
            )
            .unwrap();
        // Clear the uninit flag on block 4 only
        handle.set_bmap(&mut fs, 4, base + 4, false).unwrap();
        inode = *handle.inode();

        let mut handle = ExtentHandle::open(ino, &inode).unwrap();
        handle.goto(&mut fs, 0).unwrap();
        let left = handle.current().unwrap();
        assert!(left.uninit);
        assert_eq!(left.e_len, 4);
        let mid = handle.next_leaf(&mut fs).unwrap();
        assert!(!mid.uninit);
        assert_eq!(mid.e_lblk, 4);
        assert_eq!(mid.e_len, 1);
        let right = handle.next_leaf(&mut fs).unwrap();
        assert!(right.uninit);
        assert_eq!(right.e_lblk, 5);
        assert_eq!(right.e_len, 5);
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn delete_collapses_empty_nodes() {
        let (path, mut fs) = extent_fs();
        let (ino, mut inode) = new_extent_inode(&mut fs);
        let mut handle = ExtentHandle::open(ino, &inode).unwrap();
        for i in 0..8u64 {
            let blk = fs.alloc_block(0).unwrap();
            handle.set_bmap(&mut fs, i * 100, blk, false).unwrap();
        }
        inode = *handle.inode();
        let mut handle = ExtentHandle::open(ino, &inode).unwrap();
        for i in 0..8u64 {
            handle.goto(&mut fs, i * 100).unwrap();
            handle.delete(&mut fs).unwrap();
        }
        let mut handle = ExtentHandle::open(ino, handle.inode()).unwrap();
        assert!(matches!(
            handle.goto(&mut fs, 0),
            Err(Error::ExtentNotFound) | Err(Error::NoCurrentNode)
        ));
        std::fs::remove_file(path).unwrap();
    }
}
