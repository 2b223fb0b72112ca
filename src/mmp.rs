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

//! Multi-mount protection block.
//!
//! Only raw access to the MMP block is provided; the protection protocol
//! itself is the mounting program's business.

use crate::csum::crc32c;
use crate::error::{Error, Result};
use crate::fs::Ext2Fs;
use crate::from_bytes;

/// Magic number of the MMP block.
pub const MMP_MAGIC: u32 = 0x004D4D50;

/// The multi-mount protection record, at the start of its block.
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct MmpBlock {
    pub mmp_magic: u32,
    pub mmp_seq: u32,
    pub mmp_time: u64,
    pub mmp_nodename: [u8; 64],
    pub mmp_bdevname: [u8; 32],
    pub mmp_check_interval: u16,
    pub mmp_pad1: u16,
    pub mmp_pad2: [u32; 226],
    pub mmp_checksum: u32,
}

const _: () = assert!(size_of::<MmpBlock>() == 1024);

impl MmpBlock {
    /// Returns a zeroed record carrying the magic number.
    pub fn new() -> Self {
        let mut mmp: Self = unsafe { std::mem::zeroed() };
        mmp.mmp_magic = MMP_MAGIC.to_le();
        mmp
    }

    /// Computes the record checksum with the filesystem seed.
    pub fn compute_csum(&self, seed: u32) -> u32 {
        let bytes = crate::as_bytes(self);
        crc32c(seed, &bytes[..bytes.len() - 4])
    }
}

impl Default for MmpBlock {
    fn default() -> Self {
        Self::new()
    }
}

/// Reads and validates the MMP block, caching its raw copy in the handle.
pub fn read_mmp(fs: &mut Ext2Fs) -> Result<MmpBlock> {
    let blk = u64::from_le(fs.sb.s_mmp_block);
    if blk < 1 || blk >= fs.sb.blocks_count() {
        return Err(Error::InvalidArgument);
    }
    let mut buf = vec![0u8; fs.block_size() as usize];
    fs.read_blk(blk, &mut buf)?;
    let mmp: MmpBlock = from_bytes(&buf);
    if u32::from_le(mmp.mmp_magic) != MMP_MAGIC {
        return Err(Error::BadMagic);
    }
    if fs.sb.has_feature_metadata_csum()
        && u32::from_le(mmp.mmp_checksum) != mmp.compute_csum(fs.sb.csum_seed())
    {
        return Err(Error::BadChecksum);
    }
    fs.mmp_buf = Some(buf);
    Ok(mmp)
}

/// Writes the MMP block, refreshing its checksum.
pub fn write_mmp(fs: &mut Ext2Fs, mmp: &mut MmpBlock) -> Result<()> {
    let blk = u64::from_le(fs.sb.s_mmp_block);
    if blk < 1 || blk >= fs.sb.blocks_count() {
        return Err(Error::InvalidArgument);
    }
    if fs.sb.has_feature_metadata_csum() {
        mmp.mmp_checksum = mmp.compute_csum(fs.sb.csum_seed()).to_le();
    }
    let mut buf = vec![0u8; fs.block_size() as usize];
    buf[..size_of::<MmpBlock>()].copy_from_slice(crate::as_bytes(mmp));
    fs.write_blk(blk, &buf)?;
    fs.mmp_buf = Some(buf);
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fs::FsParams;
    use crate::io::{FileIo, IoChannel};
    use crate::sb;

    fn mmp_fs(feature_ro_compat: u32) -> (std::path::PathBuf, Ext2Fs) {
        let path = std::env::temp_dir().join(format!("e2img-mmp-{}", uuid::Uuid::new_v4()));
        let file = std::fs::File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .unwrap();
        file.set_len(8 << 20).unwrap();
        let io: Box<dyn IoChannel> = Box::new(FileIo::from_file(file));
        let params = FsParams {
            block_size: 1024,
            feature_ro_compat: sb::FEATURE_RO_COMPAT_SPARSE_SUPER | feature_ro_compat,
            ..Default::default()
        };
        let mut fs = Ext2Fs::initialize(io, &params).unwrap();
        fs.sb.s_mmp_block = 40u64.to_le();
        (path, fs)
    }

    #[test]
    fn roundtrip_with_checksum() {
        let (path, mut fs) = mmp_fs(sb::FEATURE_RO_COMPAT_METADATA_CSUM);
        let mut mmp = MmpBlock::new();
        mmp.mmp_seq = 7u32.to_le();
        mmp.mmp_time = 12345u64.to_le();
        mmp.mmp_nodename[..4].copy_from_slice(b"host");
        mmp.mmp_check_interval = 5u16.to_le();
        write_mmp(&mut fs, &mut mmp).unwrap();
        // The write stamped a checksum that verifies against the seed
        assert_eq!(
            u32::from_le(mmp.mmp_checksum),
            mmp.compute_csum(fs.sb.csum_seed())
        );

        let back = read_mmp(&mut fs).unwrap();
        assert_eq!(u32::from_le(back.mmp_seq), 7);
        assert_eq!(u64::from_le(back.mmp_time), 12345);
        assert_eq!(&back.mmp_nodename[..4], b"host");
        assert_eq!(u16::from_le(back.mmp_check_interval), 5);
        assert!(fs.mmp_buf.is_some());
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn rejects_bad_magic() {
        let (path, mut fs) = mmp_fs(0);
        let mut mmp = MmpBlock::new();
        write_mmp(&mut fs, &mut mmp).unwrap();
        let blk = u64::from_le(fs.sb.s_mmp_block);
        let mut buf = vec![0u8; fs.block_size() as usize];
        fs.read_blk(blk, &mut buf).unwrap();
        buf[0..4].copy_from_slice(&0x0BAD_C0DEu32.to_le_bytes());
        fs.write_blk(blk, &buf).unwrap();
        assert!(matches!(read_mmp(&mut fs), Err(Error::BadMagic)));
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn rejects_corrupted_record() {
        let (path, mut fs) = mmp_fs(sb::FEATURE_RO_COMPAT_METADATA_CSUM);
        let mut mmp = MmpBlock::new();
        mmp.mmp_seq = 1u32.to_le();
        write_mmp(&mut fs, &mut mmp).unwrap();
        // Flip one nodename byte behind the library's back
        let blk = u64::from_le(fs.sb.s_mmp_block);
        let mut buf = vec![0u8; fs.block_size() as usize];
        fs.read_blk(blk, &mut buf).unwrap();
        buf[20] ^= 0xFF;
        fs.write_blk(blk, &buf).unwrap();
        assert!(matches!(read_mmp(&mut fs), Err(Error::BadChecksum)));
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn rejects_out_of_range_block() {
        let (path, mut fs) = mmp_fs(0);
        fs.sb.s_mmp_block = 0u64.to_le();
        assert!(matches!(read_mmp(&mut fs), Err(Error::InvalidArgument)));
        let mut mmp = MmpBlock::new();
        fs.sb.s_mmp_block = fs.sb.blocks_count().to_le();
        assert!(matches!(
            write_mmp(&mut fs, &mut mmp),
            Err(Error::InvalidArgument)
        ));
        std::fs::remove_file(path).unwrap();
    }
}
