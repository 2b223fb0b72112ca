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

//! Positioned file I/O over an inode.
//!
//! An [`Ext2File`] buffers one logical block and keeps a private inode copy,
//! so its writes never race with other users of the handle's inode cache.
//! Inline-data inodes are promoted to block-backed storage when a write
//! outgrows the inline area.

use crate::bmap::{BMAP_ALLOC, BMAP_RET_UNINIT, BMAP_SET, bmap2, file_block_offset_too_big};
use crate::error::{Error, Result};
use crate::fs::Ext2Fs;
use crate::inline;
use crate::inode::{EXTENTS_FL, INLINE_DATA_FL, Inode};
use crate::punch::punch;
use crate::{Blk, Ino};
use std::io::SeekFrom;

/// Open flag: the file may be written.
pub const FILE_WRITE: u32 = 0x0001;
/// Open flag: the file is being created.
pub const FILE_CREATE: u32 = 0x0002;

/// An open file.
///
/// The file holds a private copy of the inode; it is written back as the
/// file grows and on flush.
pub struct Ext2File<'fs> {
    fs: &'fs mut Ext2Fs,
    ino: Ino,
    inode: Inode,
    flags: u32,
    pos: u64,
    /// Logical block currently buffered.
    blockno: Blk,
    /// Physical block backing the buffer, 0 when unmapped.
    physblock: Blk,
    buf: Vec<u8>,
    buf_valid: bool,
    buf_dirty: bool,
}

impl<'fs> Ext2File<'fs> {
    /// Opens inode `ino`.
    ///
    /// `inode` supplies the caller's inode copy; the inode is read from the
    /// table otherwise.
    pub fn open(
        fs: &'fs mut Ext2Fs,
        ino: Ino,
        flags: u32,
        inode: Option<&Inode>,
    ) -> Result<Self> {
        if flags & (FILE_WRITE | FILE_CREATE) != 0 && !fs.is_rw() {
            return Err(Error::ReadOnlyFilesystem);
        }
        let inode = match inode {
            Some(inode) => *inode,
            None => fs.read_inode(ino)?,
        };
        let block_size = fs.block_size() as usize;
        Ok(Self {
            fs,
            ino,
            inode,
            flags,
            pos: 0,
            blockno: 0,
            physblock: 0,
            buf: vec![0u8; block_size],
            buf_valid: false,
            buf_dirty: false,
        })
    }

    /// Returns the file's inode number.
    pub fn ino(&self) -> Ino {
        self.ino
    }

    /// Returns the file's private inode copy.
    pub fn inode(&self) -> &Inode {
        &self.inode
    }

    /// Returns the size of the file according to the inode.
    pub fn size(&self) -> u64 {
        self.inode.size()
    }

    /// Writes the buffered block out if it is dirty.
    pub fn flush(&mut self) -> Result<()> {
        if !self.buf_valid || !self.buf_dirty {
            return Ok(());
        }
        // An unwritten extent must be rewritten as initialized before data
        // lands in it
        if self.physblock != 0 && self.inode.flags() & EXTENTS_FL != 0 {
            let mut dontcare = 0;
            let ret_flags = bmap2(
                self.fs,
                self.ino,
                &mut self.inode,
                0,
                self.blockno,
                &mut dontcare,
            )?;
            if ret_flags & BMAP_RET_UNINIT != 0 {
                let mut phys = self.physblock;
                bmap2(
                    self.fs,
                    self.ino,
                    &mut self.inode,
                    BMAP_SET,
                    self.blockno,
                    &mut phys,
                )?;
            }
        }
        // Allocate the physical block if it still does not exist
        if self.physblock == 0 {
            let flags = if self.ino != 0 { BMAP_ALLOC } else { 0 };
            bmap2(
                self.fs,
                self.ino,
                &mut self.inode,
                flags,
                self.blockno,
                &mut self.physblock,
            )?;
        }
        self.fs.write_blk(self.physblock, &self.buf)?;
        self.buf_dirty = false;
        Ok(())
    }

    /// Aligns the buffer with the current position, flushing as needed.
    fn sync_buffer_position(&mut self) -> Result<()> {
        let b = self.pos / u64::from(self.fs.block_size());
        if b != self.blockno {
            self.flush()?;
            self.buf_valid = false;
        }
        self.blockno = b;
        Ok(())
    }

    /// Loads the buffer from disk.
    ///
    /// With `dontfill`, only the mapping is resolved since the whole buffer
    /// is about to be overwritten.
    fn load_buffer(&mut self, dontfill: bool) -> Result<()> {
        if self.buf_valid {
            return Ok(());
        }
        let ret_flags = bmap2(
            self.fs,
            self.ino,
            &mut self.inode,
            0,
            self.blockno,
            &mut self.physblock,
        )?;
        if !dontfill {
            if self.physblock != 0 && ret_flags & BMAP_RET_UNINIT == 0 {
                self.fs.read_blk(self.physblock, &mut self.buf)?;
            } else {
                self.buf.fill(0);
            }
        }
        self.buf_valid = true;
        Ok(())
    }

    fn read_inline_data(&mut self, out: &mut [u8]) -> Result<usize> {
        let data = inline::get(self.fs, self.ino, &mut self.inode)?;
        if self.pos >= data.len() as u64 {
            return Ok(0);
        }
        let start = self.pos as usize;
        let count = (data.len() - start).min(out.len());
        out[..count].copy_from_slice(&data[start..start + count]);
        self.pos += count as u64;
        Ok(count)
    }

    /// Reads up to `out.len()` bytes at the current position.
    pub fn read(&mut self, out: &mut [u8]) -> Result<usize> {
        if self.inode.flags() & INLINE_DATA_FL != 0 {
            return self.read_inline_data(out);
        }
        let block_size = u64::from(self.fs.block_size());
        let mut count = 0usize;
        let mut wanted = out.len();
        while self.pos < self.inode.size() && wanted > 0 {
            self.sync_buffer_position()?;
            self.load_buffer(false)?;

            let start = (self.pos % block_size) as usize;
            let mut c = block_size as usize - start;
            c = c.min(wanted);
            let left = self.inode.size() - self.pos;
            c = c.min(left as usize);

            out[count..count + c].copy_from_slice(&self.buf[start..start + c]);
            self.pos += c as u64;
            count += c;
            wanted -= c;
        }
        Ok(count)
    }

    fn write_inline_data(&mut self, data: &[u8]) -> Result<usize> {
        let mut content = inline::get(self.fs, self.ino, &mut self.inode)?;
        let end = self.pos as usize + data.len();
        if end <= inline::max_size(self.fs, self.ino)? {
            if content.len() < end {
                content.resize(end, 0);
            }
            content[self.pos as usize..end].copy_from_slice(data);
            inline::set(self.fs, self.ino, &mut self.inode, &content)?;
            self.pos = end as u64;
            if self.inode.size() < self.pos {
                self.inode.set_size(self.pos);
                self.fs.write_inode(self.ino, &self.inode)?;
            }
            return Ok(data.len());
        }
        // The write outgrows the inline area: promote, then retry as a
        // block-backed write
        inline::expand(self.fs, self.ino)?;
        self.inode = self.fs.read_inode(self.ino)?;
        Err(Error::InlineDataNoSpace)
    }

    /// Writes `data` at the current position.
    pub fn write(&mut self, data: &[u8]) -> Result<usize> {
        if self.flags & FILE_WRITE == 0 {
            return Err(Error::ReadOnlyFilesystem);
        }
        if self.inode.flags() & INLINE_DATA_FL != 0 {
            match self.write_inline_data(data) {
                Err(Error::InlineDataNoSpace) => {} // fall through
                other => return other,
            }
        }
        let block_size = u64::from(self.fs.block_size());
        let mut count = 0usize;
        let mut rest = data.len();
        let res = loop {
            if rest == 0 {
                break Ok(());
            }
            if let Err(e) = self.sync_buffer_position() {
                break Err(e);
            }
            let start = (self.pos % block_size) as usize;
            let c = (block_size as usize - start).min(rest);

            // A full-block overwrite needs no read-modify-write cycle
            if let Err(e) = self.load_buffer(c == block_size as usize) {
                break Err(e);
            }
            if self.physblock == 0 {
                let flags = if self.ino != 0 { BMAP_ALLOC } else { 0 };
                if let Err(e) = bmap2(
                    self.fs,
                    self.ino,
                    &mut self.inode,
                    flags,
                    self.blockno,
                    &mut self.physblock,
                ) {
                    break Err(e);
                }
            }
            self.buf_dirty = true;
            self.buf[start..start + c].copy_from_slice(&data[count..count + c]);
            self.pos += c as u64;
            count += c;
            rest -= c;
        };
        // Grow the size to cover what was written, even on partial failure
        if count != 0 && self.inode.size() < self.pos {
            let rc = self.set_size(self.pos);
            res.and(rc)?;
        } else {
            res?;
        }
        Ok(count)
    }

    /// Moves the file position. Returns the new position.
    pub fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        self.pos = match pos {
            SeekFrom::Start(offset) => offset,
            SeekFrom::Current(delta) => (self.pos as i64 + delta) as u64,
            SeekFrom::End(delta) => (self.inode.size() as i64 + delta) as u64,
        };
        Ok(self.pos)
    }

    /// Returns the current position.
    pub fn pos(&self) -> u64 {
        self.pos
    }

    /// Zeroes the mapped tail of the last block past `offset`.
    fn zero_past_offset(&mut self, offset: u64) -> Result<()> {
        let block_size = u64::from(self.fs.block_size());
        let off = offset % block_size;
        if off == 0 {
            return Ok(());
        }
        self.sync_buffer_position()?;

        let mut blk = 0;
        let ret_flags = bmap2(
            self.fs,
            self.ino,
            &mut self.inode,
            0,
            offset / block_size,
            &mut blk,
        )?;
        if blk == 0 || ret_flags & BMAP_RET_UNINIT != 0 {
            return Ok(());
        }
        let mut buf = vec![0u8; block_size as usize];
        self.fs.read_blk(blk, &mut buf)?;
        buf[off as usize..].fill(0);
        self.fs.write_blk(blk, &buf)
    }

    /// Sets the size of the file, truncating it if necessary.
    pub fn set_size(&mut self, size: u64) -> Result<()> {
        let block_size = u64::from(self.fs.block_size());
        if size != 0
            && file_block_offset_too_big(self.fs, &self.inode, (size - 1) / block_size)
        {
            return Err(Error::FileTooBig);
        }
        let truncate_block = size.div_ceil(block_size);
        let old_size = self.inode.size();
        let old_truncate = old_size.div_ceil(block_size);

        self.inode.set_size(size);
        if self.ino != 0 {
            self.fs.write_inode(self.ino, &self.inode)?;
        }
        if self.inode.flags() & INLINE_DATA_FL != 0 {
            return Ok(());
        }
        self.zero_past_offset(size)?;

        if truncate_block >= old_truncate {
            return Ok(());
        }
        punch(self.fs, self.ino, &mut self.inode, truncate_block, u64::MAX)
    }

    /// Flushes the buffer and gives the filesystem handle back.
    pub fn close(mut self) -> Result<()> {
        self.flush()
    }
}

impl Drop for Ext2File<'_> {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::dir::test::dir_fs;
    use crate::dir::{FT_REG_FILE, link};
    use crate::inode::S_IFREG;
    use crate::namei::namei;
    use crate::{ROOT_INO, sb};

    fn new_file(fs: &mut Ext2Fs, name: &str, extents: bool) -> Ino {
        let ino = fs.new_inode(0).unwrap();
        fs.inode_alloc_stats(ino, 1, false);
        let mut inode = Inode::new();
        inode.i_mode = (S_IFREG | 0o644).to_le();
        inode.i_links_count = 1u16.to_le();
        if extents {
            inode.flags_set(EXTENTS_FL);
        }
        fs.write_new_inode(ino, &mut inode).unwrap();
        link(fs, ROOT_INO, name, ino, FT_REG_FILE).unwrap();
        ino
    }

    #[test]
    fn write_read_roundtrip_via_namei() {
        let (path, mut fs) = dir_fs(0, sb::FEATURE_INCOMPAT_EXTENTS);
        new_file(&mut fs, "a.txt", true);

        let content = vec![b'A'; 5000];
        {
            let ino = namei(&mut fs, ROOT_INO, ROOT_INO, "/a.txt").unwrap();
            let mut file = Ext2File::open(&mut fs, ino, FILE_WRITE, None).unwrap();
            assert_eq!(file.write(&content).unwrap(), 5000);
            file.close().unwrap();
        }
        {
            let ino = namei(&mut fs, ROOT_INO, ROOT_INO, "/a.txt").unwrap();
            let mut file = Ext2File::open(&mut fs, ino, 0, None).unwrap();
            let mut back = vec![0u8; 6000];
            let got = file.read(&mut back).unwrap();
            assert_eq!(got, 5000);
            assert!(back[..5000].iter().all(|b| *b == b'A'));
        }
        // Patch five bytes in the middle
        {
            let ino = namei(&mut fs, ROOT_INO, ROOT_INO, "/a.txt").unwrap();
            let mut file = Ext2File::open(&mut fs, ino, FILE_WRITE, None).unwrap();
            file.seek(SeekFrom::Start(100)).unwrap();
            file.write(b"HELLO").unwrap();
            file.close().unwrap();
        }
        {
            let ino = namei(&mut fs, ROOT_INO, ROOT_INO, "/a.txt").unwrap();
            let mut file = Ext2File::open(&mut fs, ino, 0, None).unwrap();
            let mut back = vec![0u8; 5000];
            file.read(&mut back).unwrap();
            assert_eq!(&back[100..105], b"HELLO");
            assert!(back[..100].iter().all(|b| *b == b'A'));
            assert!(back[105..].iter().all(|b| *b == b'A'));
        }
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn truncate_then_extend_zero_fills() {
        let (path, mut fs) = dir_fs(0, 0);
        let ino = new_file(&mut fs, "t.bin", false);
        let content: Vec<u8> = (0..10_000u32).map(|i| i as u8).collect();
        {
            let mut file = Ext2File::open(&mut fs, ino, FILE_WRITE, None).unwrap();
            file.write(&content).unwrap();
            file.close().unwrap();
        }
        {
            let mut file = Ext2File::open(&mut fs, ino, FILE_WRITE, None).unwrap();
            file.set_size(3000).unwrap();
            file.set_size(10_000).unwrap();
            file.close().unwrap();
        }
        {
            let mut file = Ext2File::open(&mut fs, ino, 0, None).unwrap();
            let mut back = vec![0u8; 10_000];
            assert_eq!(file.read(&mut back).unwrap(), 10_000);
            assert_eq!(&back[..3000], &content[..3000]);
            assert!(back[3000..].iter().all(|b| *b == 0), "tail must read back zero");
        }
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn sparse_reads_return_zeros() {
        let (path, mut fs) = dir_fs(0, 0);
        let ino = new_file(&mut fs, "sparse", false);
        {
            let mut file = Ext2File::open(&mut fs, ino, FILE_WRITE, None).unwrap();
            file.seek(SeekFrom::Start(5000)).unwrap();
            file.write(b"end").unwrap();
            file.close().unwrap();
        }
        {
            let mut file = Ext2File::open(&mut fs, ino, 0, None).unwrap();
            let mut back = vec![0xFFu8; 5003];
            assert_eq!(file.read(&mut back).unwrap(), 5003);
            assert!(back[..5000].iter().all(|b| *b == 0));
            assert_eq!(&back[5000..], b"end");
        }
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn seek_modes() {
        let (path, mut fs) = dir_fs(0, 0);
        let ino = new_file(&mut fs, "s", false);
        let mut file = Ext2File::open(&mut fs, ino, FILE_WRITE, None).unwrap();
        file.write(&[0u8; 100]).unwrap();
        assert_eq!(file.seek(SeekFrom::Start(10)).unwrap(), 10);
        assert_eq!(file.seek(SeekFrom::Current(5)).unwrap(), 15);
        assert_eq!(file.seek(SeekFrom::End(-20)).unwrap(), 80);
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn inline_write_promotes_on_overflow() {
        let (path, mut fs) = dir_fs(0, sb::FEATURE_INCOMPAT_INLINE_DATA);
        let ino = fs.new_inode(0).unwrap();
        fs.inode_alloc_stats(ino, 1, false);
        let mut inode = Inode::new();
        inode.i_mode = (S_IFREG | 0o644).to_le();
        inode.i_links_count = 1u16.to_le();
        inode.flags_set(INLINE_DATA_FL);
        fs.write_new_inode(ino, &mut inode).unwrap();
        crate::inline::init(&mut fs, ino).unwrap();

        // Small write stays inline
        {
            let mut file = Ext2File::open(&mut fs, ino, FILE_WRITE, None).unwrap();
            file.write(b"short").unwrap();
            file.close().unwrap();
        }
        assert_ne!(
            fs.read_inode(ino).unwrap().flags() & INLINE_DATA_FL,
            0
        );
        // A large write promotes the inode to blocks
        let big = vec![3u8; 4000];
        {
            let mut file = Ext2File::open(&mut fs, ino, FILE_WRITE, None).unwrap();
            file.seek(SeekFrom::Start(0)).unwrap();
            file.write(&big).unwrap();
            file.close().unwrap();
        }
        assert_eq!(fs.read_inode(ino).unwrap().flags() & INLINE_DATA_FL, 0);
        {
            let mut file = Ext2File::open(&mut fs, ino, 0, None).unwrap();
            let mut back = vec![0u8; 4000];
            assert_eq!(file.read(&mut back).unwrap(), 4000);
            assert_eq!(back, big);
        }
        std::fs::remove_file(path).unwrap();
    }
}
