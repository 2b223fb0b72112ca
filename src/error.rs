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

//! Errors returned by filesystem operations.

use std::fmt;
use std::io;

/// Result alias for all filesystem operations.
pub type Result<T> = std::result::Result<T, Error>;

/// An error returned by a filesystem operation.
///
/// OS errors are converted from [`io::Error`] at the I/O channel boundary;
/// everything else is produced by the library itself.
#[derive(Debug)]
pub enum Error {
    /// An I/O operation on the underlying channel failed.
    Io(io::Error),
    /// A memory allocation failed.
    NoMemory,
    /// An argument is out of the accepted domain.
    InvalidArgument,
    /// No free block could be found.
    BlockAllocFail,
    /// No free inode could be found.
    InodeAllocFail,
    /// The requested offset is beyond what the inode's block map can address.
    FileTooBig,
    /// A directory block contains an invalid entry.
    DirCorrupted,
    /// A directory has no room left for a new entry.
    DirNoSpace,
    /// The directory entry to create already exists.
    DirExists,
    /// The named file does not exist.
    FileNotFound,
    /// The inode is not a directory.
    NotADirectory,
    /// The inode is a directory.
    IsADirectory,
    /// Too many nested symbolic links.
    SymlinkLoop,
    /// A structure's magic number is wrong.
    BadMagic,
    /// A metadata checksum does not verify.
    BadChecksum,
    /// The filesystem was opened read-only.
    ReadOnlyFilesystem,
    /// Remapping requires an indirect block that is not allocated.
    SetBmapNoInd,
    /// No extent covers the requested logical block.
    ExtentNotFound,
    /// The extent cursor is at the last extent.
    ExtentNoNext,
    /// The extent cursor does not point at a node.
    NoCurrentNode,
    /// The inode stores its data inline and has no blocks to map.
    InlineDataNoBlock,
    /// The inline data area cannot hold the requested content.
    InlineDataNoSpace,
    /// The filesystem is too large for legacy 32-bit bitmaps.
    CantUseLegacyBitmaps,
    /// The directory hash version is not supported.
    DirhashUnsupported,
    /// The new block bitmap end is beyond the allocated storage.
    FudgeBlockBitmapEnd,
    /// The new inode bitmap end is beyond the allocated storage.
    FudgeInodeBitmapEnd,
    /// A value does not fit in its on-disk field.
    Overflow,
    /// The I/O channel does not implement the requested operation.
    Unimplemented,
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(fmt, "i/o error: {err}"),
            Self::NoMemory => write!(fmt, "out of memory"),
            Self::InvalidArgument => write!(fmt, "invalid argument"),
            Self::BlockAllocFail => write!(fmt, "could not allocate block"),
            Self::InodeAllocFail => write!(fmt, "could not allocate inode"),
            Self::FileTooBig => write!(fmt, "file too big"),
            Self::DirCorrupted => write!(fmt, "corrupted directory entry"),
            Self::DirNoSpace => write!(fmt, "no space in directory"),
            Self::DirExists => write!(fmt, "directory entry exists"),
            Self::FileNotFound => write!(fmt, "file not found"),
            Self::NotADirectory => write!(fmt, "not a directory"),
            Self::IsADirectory => write!(fmt, "is a directory"),
            Self::SymlinkLoop => write!(fmt, "too many nested symbolic links"),
            Self::BadMagic => write!(fmt, "bad magic number"),
            Self::BadChecksum => write!(fmt, "metadata checksum mismatch"),
            Self::ReadOnlyFilesystem => write!(fmt, "filesystem is read-only"),
            Self::SetBmapNoInd => write!(fmt, "no indirect block to remap through"),
            Self::ExtentNotFound => write!(fmt, "extent not found"),
            Self::ExtentNoNext => write!(fmt, "no next extent"),
            Self::NoCurrentNode => write!(fmt, "no current extent node"),
            Self::InlineDataNoBlock => write!(fmt, "inode stores data inline"),
            Self::InlineDataNoSpace => write!(fmt, "no space in inline data"),
            Self::CantUseLegacyBitmaps => write!(fmt, "filesystem too large for legacy bitmaps"),
            Self::DirhashUnsupported => write!(fmt, "unsupported directory hash version"),
            Self::FudgeBlockBitmapEnd => write!(fmt, "block bitmap end out of range"),
            Self::FudgeInodeBitmapEnd => write!(fmt, "inode bitmap end out of range"),
            Self::Overflow => write!(fmt, "value overflows on-disk field"),
            Self::Unimplemented => write!(fmt, "operation not implemented by the channel"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}
