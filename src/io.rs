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

//! Block-addressable I/O channel over a device file or image.

use crate::Blk;
use crate::error::{Error, Result};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

/// I/O statistics collected by a channel.
#[derive(Clone, Copy, Debug, Default)]
pub struct IoStats {
    /// Number of bytes read through the channel.
    pub bytes_read: u64,
    /// Number of bytes written through the channel.
    pub bytes_written: u64,
}

/// A block-addressable channel over a file or device.
///
/// Blocks are addressed in units of the channel's current block size. The
/// byte-granular operations are optional; callers fall back to whole-block
/// writes when they return [`Error::Unimplemented`].
pub trait IoChannel {
    /// Returns the current block size in bytes.
    fn block_size(&self) -> u32;

    /// Sets the block size used to address blocks.
    fn set_block_size(&mut self, size: u32) -> Result<()>;

    /// Reads `buf.len()` bytes starting at block `blk`.
    fn read_block(&mut self, blk: Blk, buf: &mut [u8]) -> Result<()>;

    /// Writes `buf` starting at block `blk`.
    fn write_block(&mut self, blk: Blk, buf: &[u8]) -> Result<()>;

    /// Reads `buf.len()` bytes at byte offset `off`.
    fn read_byte(&mut self, _off: u64, _buf: &mut [u8]) -> Result<()> {
        Err(Error::Unimplemented)
    }

    /// Writes `buf` at byte offset `off`.
    fn write_byte(&mut self, _off: u64, _buf: &[u8]) -> Result<()> {
        Err(Error::Unimplemented)
    }

    /// Flushes pending writes to the underlying storage.
    fn flush(&mut self) -> Result<()>;

    /// Returns the channel's I/O statistics.
    fn stats(&self) -> IoStats;

    /// Returns the total size of the underlying storage in bytes.
    fn size(&mut self) -> Result<u64>;
}

/// An I/O channel backed by a regular file or a block device.
pub struct FileIo {
    file: File,
    block_size: u32,
    stats: IoStats,
}

impl FileIo {
    /// Opens the file or device at `path`.
    ///
    /// `write` tells whether the channel allows writes.
    pub fn open(path: &Path, write: bool) -> Result<Self> {
        let file = File::options().read(true).write(write).open(path)?;
        Ok(Self::from_file(file))
    }

    /// Creates a channel over an already opened file.
    pub fn from_file(file: File) -> Self {
        Self {
            file,
            block_size: 1024,
            stats: IoStats::default(),
        }
    }
}

impl IoChannel for FileIo {
    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn set_block_size(&mut self, size: u32) -> Result<()> {
        if !size.is_power_of_two() || size < 512 {
            return Err(Error::InvalidArgument);
        }
        self.block_size = size;
        Ok(())
    }

    fn read_block(&mut self, blk: Blk, buf: &mut [u8]) -> Result<()> {
        self.read_byte(blk * self.block_size as u64, buf)
    }

    fn write_block(&mut self, blk: Blk, buf: &[u8]) -> Result<()> {
        self.write_byte(blk * self.block_size as u64, buf)
    }

    fn read_byte(&mut self, off: u64, buf: &mut [u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(off))?;
        self.file.read_exact(buf)?;
        self.stats.bytes_read += buf.len() as u64;
        Ok(())
    }

    fn write_byte(&mut self, off: u64, buf: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(off))?;
        self.file.write_all(buf)?;
        self.stats.bytes_written += buf.len() as u64;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    fn stats(&self) -> IoStats {
        self.stats
    }

    fn size(&mut self) -> Result<u64> {
        device_size(&self.file)
    }
}

/// Builds a read-direction `ioctl` request code out of its group, number
/// and payload type.
#[cfg(unix)]
macro_rules! ior {
    ($group:expr, $nr:expr, $ty:ty) => {
        (2 << 30) | (($group) << 8) | ($nr) | ((size_of::<$ty>() as std::ffi::c_long) << 16)
    };
}

/// `ioctl` request asking a block device for its size in bytes.
#[cfg(unix)]
const BLKGETSIZE64: std::ffi::c_long = ior!(0x12, 114, u64);

/// Returns the size in bytes of the given device or image file.
#[cfg(unix)]
pub fn device_size(dev: &File) -> Result<u64> {
    use std::os::fd::AsRawFd;
    use std::os::unix::fs::FileTypeExt;

    let metadata = dev.metadata()?;
    let file_type = metadata.file_type();
    if file_type.is_block_device() || file_type.is_char_device() {
        let mut size = 0u64;
        let ret = unsafe { libc::ioctl(dev.as_raw_fd(), BLKGETSIZE64 as _, &mut size) };
        if ret < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(size)
    } else {
        Ok(metadata.len())
    }
}

/// Returns the size in bytes of the given device or image file.
#[cfg(not(unix))]
pub fn device_size(dev: &File) -> Result<u64> {
    Ok(dev.metadata()?.len())
}

#[cfg(test)]
mod test {
    use super::*;

    fn temp_image(len: u64) -> (std::path::PathBuf, File) {
        let path = std::env::temp_dir().join(format!("e2img-io-{}", uuid::Uuid::new_v4()));
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .unwrap();
        file.set_len(len).unwrap();
        (path, file)
    }

    #[test]
    fn block_roundtrip() {
        let (path, file) = temp_image(1 << 20);
        let mut io = FileIo::from_file(file);
        io.set_block_size(4096).unwrap();

        let data = vec![0xA5u8; 4096];
        io.write_block(3, &data).unwrap();
        let mut back = vec![0u8; 4096];
        io.read_block(3, &mut back).unwrap();
        assert_eq!(data, back);

        let stats = io.stats();
        assert_eq!(stats.bytes_written, 4096);
        assert_eq!(stats.bytes_read, 4096);

        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn byte_writes_land_at_offset() {
        let (path, file) = temp_image(1 << 16);
        let mut io = FileIo::from_file(file);
        io.write_byte(1024, b"hello").unwrap();
        let mut buf = [0u8; 5];
        io.read_byte(1024, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn rejects_bad_block_size() {
        let (path, file) = temp_image(4096);
        let mut io = FileIo::from_file(file);
        assert!(io.set_block_size(3000).is_err());
        assert!(io.set_block_size(256).is_err());
        std::fs::remove_file(path).unwrap();
    }
}
