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

//! Path resolution.
//!
//! A path is interpreted relative to a root and a current directory inode,
//! following at most [`MAX_NESTED_LINKS`] nested symbolic links. Symlink
//! targets live in `i_block` (fast symlinks), in inline data, or in the
//! first data block.

use crate::bmap::bmap2;
use crate::error::{Error, Result};
use crate::fs::Ext2Fs;
use crate::inline;
use crate::inode::INLINE_DATA_FL;
use crate::{Ino, dir};

/// Maximum number of nested symbolic links followed during resolution.
pub const MAX_NESTED_LINKS: usize = 8;

/// Resolves `inode` to its target when it is a symbolic link.
fn follow_link_at(
    fs: &mut Ext2Fs,
    root: Ino,
    dir: Ino,
    inode: Ino,
    link_count: usize,
) -> Result<Ino> {
    let ei = fs.read_inode(inode)?;
    if !ei.is_symlink() {
        return Ok(inode);
    }
    if link_count >= MAX_NESTED_LINKS {
        return Err(Error::SymlinkLoop);
    }
    let size = ei.size() as usize;
    let pathname: Vec<u8> = if ei.is_fast_symlink(fs.block_size()) {
        let mut buf = [0u8; crate::INODE_BLOCK_BYTES];
        for i in 0..crate::inode::N_BLOCKS {
            buf[i * 4..(i + 1) * 4].copy_from_slice(&ei.block(i).to_le_bytes());
        }
        buf[..size.min(buf.len())].to_vec()
    } else if ei.flags() & INLINE_DATA_FL != 0 {
        let mut ei = ei;
        let data = inline::get(fs, inode, &mut ei)?;
        data[..size.min(data.len())].to_vec()
    } else {
        let mut ei = ei;
        let mut blk = 0;
        bmap2(fs, inode, &mut ei, 0, 0, &mut blk)?;
        let mut buf = vec![0u8; fs.block_size() as usize];
        fs.read_blk(blk, &mut buf)?;
        buf.truncate(size.min(buf.len()));
        buf
    };
    open_namei(fs, root, dir, &pathname, true, link_count + 1)
}

/// Resolves the directory part of a path.
///
/// Returns the final component and the inode of its containing directory.
fn dir_namei<'p>(
    fs: &mut Ext2Fs,
    root: Ino,
    mut dir: Ino,
    mut pathname: &'p [u8],
    link_count: usize,
) -> Result<(&'p [u8], Ino)> {
    if pathname.first() == Some(&b'/') {
        dir = root;
        pathname = &pathname[1..];
    }
    loop {
        let Some(slash) = pathname.iter().position(|c| *c == b'/') else {
            return Ok((pathname, dir));
        };
        let component = &pathname[..slash];
        pathname = &pathname[slash + 1..];
        let name = std::str::from_utf8(component).map_err(|_| Error::InvalidArgument)?;
        let inode = dir::lookup(fs, dir, name)?;
        dir = follow_link_at(fs, root, dir, inode, link_count)?;
    }
}

fn open_namei(
    fs: &mut Ext2Fs,
    root: Ino,
    base: Ino,
    pathname: &[u8],
    follow: bool,
    link_count: usize,
) -> Result<Ino> {
    let (base_name, dir) = dir_namei(fs, root, base, pathname, link_count)?;
    // Special case: a path like "/usr/" names the directory itself
    if base_name.is_empty() {
        return Ok(dir);
    }
    let name = std::str::from_utf8(base_name).map_err(|_| Error::InvalidArgument)?;
    let mut inode = dir::lookup(fs, dir, name)?;
    if follow {
        inode = follow_link_at(fs, root, dir, inode, link_count)?;
    }
    Ok(inode)
}

/// Resolves a path to an inode, without following a final symlink.
pub fn namei(fs: &mut Ext2Fs, root: Ino, cwd: Ino, name: &str) -> Result<Ino> {
    open_namei(fs, root, cwd, name.as_bytes(), false, 0)
}

/// Resolves a path to an inode, following a final symlink.
pub fn namei_follow(fs: &mut Ext2Fs, root: Ino, cwd: Ino, name: &str) -> Result<Ino> {
    open_namei(fs, root, cwd, name.as_bytes(), true, 0)
}

/// Follows the symlink `inode`, resolving its target relative to `cwd`.
pub fn follow_link(fs: &mut Ext2Fs, root: Ino, cwd: Ino, inode: Ino) -> Result<Ino> {
    follow_link_at(fs, root, cwd, inode, 0)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::dir::test::dir_fs;
    use crate::dir::{FT_SYMLINK, link, mkdir};
    use crate::inode::{Inode, S_IFLNK};
    use crate::{ROOT_INO, as_bytes_mut};

    /// Creates a fast symlink pointing at `target`.
    fn new_symlink(fs: &mut Ext2Fs, target: &str) -> Ino {
        let ino = fs.new_inode(0).unwrap();
        fs.inode_alloc_stats(ino, 1, false);
        let mut inode = Inode::new();
        inode.i_mode = (S_IFLNK | 0o777).to_le();
        inode.i_links_count = 1u16.to_le();
        inode.set_size(target.len() as u64);
        let bytes = as_bytes_mut(&mut inode);
        bytes[40..40 + target.len()].copy_from_slice(target.as_bytes());
        fs.write_new_inode(ino, &mut inode).unwrap();
        ino
    }

    #[test]
    fn resolves_nested_paths() {
        let (path, mut fs) = dir_fs(0, 0);
        let a = mkdir(&mut fs, ROOT_INO, None, Some("a")).unwrap();
        let b = mkdir(&mut fs, a, None, Some("b")).unwrap();
        let c = mkdir(&mut fs, b, None, Some("c")).unwrap();

        assert_eq!(namei(&mut fs, ROOT_INO, ROOT_INO, "/a/b/c").unwrap(), c);
        assert_eq!(namei(&mut fs, ROOT_INO, ROOT_INO, "/a/b/").unwrap(), b);
        assert_eq!(namei(&mut fs, ROOT_INO, a, "b/c").unwrap(), c);
        assert_eq!(namei(&mut fs, ROOT_INO, b, "../b/c").unwrap(), c);
        assert!(matches!(
            namei(&mut fs, ROOT_INO, ROOT_INO, "/a/x"),
            Err(Error::FileNotFound)
        ));
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn follows_fast_symlinks() {
        let (path, mut fs) = dir_fs(0, 0);
        let a = mkdir(&mut fs, ROOT_INO, None, Some("a")).unwrap();
        let sym = new_symlink(&mut fs, "/a");
        link(&mut fs, ROOT_INO, "s", sym, FT_SYMLINK).unwrap();

        assert_eq!(namei(&mut fs, ROOT_INO, ROOT_INO, "/s").unwrap(), sym);
        assert_eq!(
            namei_follow(&mut fs, ROOT_INO, ROOT_INO, "/s").unwrap(),
            a
        );
        // A symlink in the middle of a path is always followed
        let b = mkdir(&mut fs, a, None, Some("b")).unwrap();
        assert_eq!(namei(&mut fs, ROOT_INO, ROOT_INO, "/s/b").unwrap(), b);
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn symlink_loops_are_bounded() {
        let (path, mut fs) = dir_fs(0, 0);
        let s1 = new_symlink(&mut fs, "/loop2");
        let s2 = new_symlink(&mut fs, "/loop1");
        link(&mut fs, ROOT_INO, "loop1", s1, FT_SYMLINK).unwrap();
        link(&mut fs, ROOT_INO, "loop2", s2, FT_SYMLINK).unwrap();
        assert!(matches!(
            namei_follow(&mut fs, ROOT_INO, ROOT_INO, "/loop1"),
            Err(Error::SymlinkLoop)
        ));
        std::fs::remove_file(path).unwrap();
    }
}
