//! Filesystem operations.
//!
//! The public surface the userspace binding drives: path resolution plus getattr, open,
//! read, write, readdir, mkdir, mknod, rmdir and unlink, all methods on [`HybridFs`].
//! Paths are absolute; handles are inode numbers. Read-only operations take the metadata
//! lock shared; anything that can allocate or free holds it exclusively for the whole
//! operation, so a bitmap scan never interleaves with another allocator's persist.

use log::debug;

use crate::block_grp::Metadata;
use crate::dir::{self, DirCursor, FileType, MAX_NAME_LEN};
use crate::err::{FsError, FsResult};
use crate::inode::{self, Inode, InodeNo};
use crate::HybridFs;

/// Attribute projection of an inode, mirroring what stat reports.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FileAttr {
    pub ino: u64,
    /// File mode: type and permission bits.
    pub mode: u32,
    pub nlink: u32,
    /// File size in bytes.
    pub size: u64,
    /// Block count in 512-byte units.
    pub blocks: u64,
    pub uid: u32,
    pub gid: u32,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
}

/// Free-space counters, per tier.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FsStat {
    pub block_size: u32,
    pub free_ssd_blocks: u64,
    pub free_hdd_blocks: u64,
    pub free_inodes: u64,
}

/// Splits an absolute path into its parent directory and final component, ignoring
/// trailing slashes.
fn split_path(path: &str) -> (&str, &str) {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) => ("/", &trimmed[1..]),
        Some(i) => (&trimmed[..i], &trimmed[i + 1..]),
        None => ("/", trimmed),
    }
}

fn attr_of(inode: &Inode, ino: InodeNo) -> FileAttr {
    FileAttr {
        ino: ino.as_u64(),
        mode: u32::from(inode.i_mode),
        nlink: u32::from(inode.i_links_count),
        size: inode.size(),
        blocks: u64::from(inode.i_blocks_lo),
        uid: u32::from(inode.i_uid),
        gid: u32::from(inode.i_gid),
        atime: i64::from(inode.i_atime),
        mtime: i64::from(inode.i_mtime),
        ctime: i64::from(inode.i_ctime),
    }
}

impl HybridFs {
    /// Walks `path` component by component through the cache, scanning directories on a
    /// miss. Returns `None` when any component is missing or a prefix is not a directory.
    pub(crate) fn resolve_in(&self, meta: &Metadata, path: &str) -> Option<InodeNo> {
        assert!(path.starts_with('/'), "paths from the binding are absolute");
        debug!("look up: {path}");

        let bytes = path.as_bytes();
        let mut node_id = self.dcache.root();
        let mut pos = 0usize;

        loop {
            while pos < bytes.len() && bytes[pos] == b'/' {
                pos += 1;
            }
            let start = pos;
            while pos < bytes.len() && bytes[pos] != b'/' {
                pos += 1;
            }
            let comp = &bytes[start..pos];

            // a zero-length tail means the walk already sits on the answer
            if comp.is_empty() {
                break;
            }
            if comp == b"." {
                continue;
            }
            if comp == b".." {
                node_id = self.dcache.node(node_id).parent;
                continue;
            }

            if let Some(hit) = self.dcache.lookup(comp, node_id) {
                node_id = hit;
                continue;
            }

            // miss: the current prefix must be a directory, and every live entry it
            // holds is worth caching while the block is hot
            let cur = self.dcache.node(node_id);
            let dir_inode = inode::read_inode(&self.disk, meta, cur.ino).ok()?;
            if !dir_inode.is_dir() {
                debug!("prefix of {path} is not a directory");
                return None;
            }

            let mut cursor = DirCursor::new(meta.block_size());
            let mut offset = 0u64;
            while let Some(entry) = cursor.dentry_at(&self.disk, meta, &dir_inode, offset) {
                offset += u64::from(entry.rec_len);

                if entry.inode.is_null() || entry.name == b"." || entry.name == b".." {
                    continue;
                }
                let (name, child) = (entry.name.to_vec(), entry.inode);
                self.dcache.insert(&name, child, node_id);
            }

            match self.dcache.lookup(comp, node_id) {
                Some(hit) => node_id = hit,
                None => {
                    debug!("cannot find {} in {path}", String::from_utf8_lossy(comp));
                    return None;
                }
            }
        }

        Some(self.dcache.node(node_id).ino)
    }

    /// Resolves an absolute path to its inode number.
    pub fn resolve(&self, path: &str) -> FsResult<InodeNo> {
        let meta = self.meta.read();
        self.resolve_in(&meta, path).ok_or(FsError::NotFound)
    }

    /// Resolves `path` and hands back its inode number as the file handle.
    pub fn open(&self, path: &str) -> FsResult<InodeNo> {
        let ino = self.resolve(path)?;
        debug!("open {path} as inode {ino}");
        Ok(ino)
    }

    pub fn getattr(&self, path: &str) -> FsResult<FileAttr> {
        let meta = self.meta.read();
        let ino = self.resolve_in(&meta, path).ok_or(FsError::NotFound)?;
        let inode = inode::read_inode(&self.disk, &meta, ino)?;
        Ok(attr_of(&inode, ino))
    }

    /// Attribute lookup through an already-open handle.
    pub fn getattr_ino(&self, ino: InodeNo) -> FsResult<FileAttr> {
        let meta = self.meta.read();
        let inode = inode::read_inode(&self.disk, &meta, ino)?;
        Ok(attr_of(&inode, ino))
    }

    /// Reads up to `buf.len()` bytes at `offset`. Requests past the end of file shrink
    /// silently; holes read back as zeros without touching disk.
    pub fn read(&self, ino: InodeNo, buf: &mut [u8], offset: u64) -> FsResult<usize> {
        let meta = self.meta.read();
        let inode = inode::read_inode(&self.disk, &meta, ino)?;
        let bs = meta.block_size();

        let file_size = inode.size();
        if offset >= file_size {
            return Ok(0);
        }
        let len = (buf.len() as u64).min(file_size - offset) as usize;
        let buf = &mut buf[..len];

        let mut done = 0usize;

        // unaligned head: only up to the next block boundary
        let head_offset = (offset % u64::from(bs)) as u32;
        if len > 0 && head_offset != 0 {
            let head = len.min((bs - head_offset) as usize);
            let lblock = (offset / u64::from(bs)) as u32;
            let pblock = inode::data_pblock(&self.disk, &meta, &inode, lblock);
            if pblock.is_null() {
                debug!("sparse head, skipping {head} bytes");
            } else {
                self.disk.read(&mut buf[..head], pblock, head_offset);
            }
            done = head;
        }

        let mut pos = offset + done as u64;
        while done < len {
            let lblock = (pos / u64::from(bs)) as u32;
            let chunk = (len - done).min(bs as usize);
            let pblock = inode::data_pblock(&self.disk, &meta, &inode, lblock);
            if pblock.is_null() {
                buf[done..done + chunk].fill(0);
                debug!("sparse file, zero-filling {chunk} bytes");
            } else {
                self.disk.read(&mut buf[done..done + chunk], pblock, 0);
            }
            done += chunk;
            pos += chunk as u64;
        }

        Ok(done)
    }

    /// Writes `data` at `offset`, allocating blocks for holes along the way and growing
    /// the file size when the write reaches past it.
    pub fn write(&self, ino: InodeNo, data: &[u8], offset: u64) -> FsResult<usize> {
        let mut meta = self.meta.write();
        let mut inode = inode::read_inode(&self.disk, &meta, ino)?;
        let bs = meta.block_size();
        let len = data.len();

        let mut done = 0usize;

        let head_offset = (offset % u64::from(bs)) as u32;
        if len > 0 && head_offset != 0 {
            let head = len.min((bs - head_offset) as usize);
            let lblock = (offset / u64::from(bs)) as u32;
            let mut pblock = inode::data_pblock(&self.disk, &meta, &inode, lblock);
            if pblock.is_null() {
                pblock = meta.alloc_data_pblock(&self.disk, lblock);
                inode::set_data_pblock(&self.disk, &mut meta, &mut inode, lblock, pblock);
            }
            self.disk.write(&data[..head], pblock, head_offset);
            done = head;
        }

        let mut pos = offset + done as u64;
        while done < len {
            let lblock = (pos / u64::from(bs)) as u32;
            let chunk = (len - done).min(bs as usize);
            let mut pblock = inode::data_pblock(&self.disk, &meta, &inode, lblock);
            if pblock.is_null() {
                pblock = meta.alloc_data_pblock(&self.disk, lblock);
                inode::set_data_pblock(&self.disk, &mut meta, &mut inode, lblock, pblock);
            }
            self.disk.write(&data[done..done + chunk], pblock, 0);
            done += chunk;
            pos += chunk as u64;
        }

        if offset + len as u64 > inode.size() {
            inode.set_size(offset + len as u64);
        }
        inode::write_inode(&self.disk, &meta, ino, &inode);

        Ok(len)
    }

    /// Iterates the live entries of a directory through one reusable block buffer,
    /// feeding each to `filler`. A `true` return from the filler stops the listing.
    pub fn readdir<F>(&self, path: &str, mut filler: F) -> FsResult<()>
    where
        F: FnMut(&[u8], InodeNo, FileType) -> bool,
    {
        let meta = self.meta.read();
        let ino = self.resolve_in(&meta, path).ok_or(FsError::NotFound)?;
        let inode = inode::read_inode(&self.disk, &meta, ino)?;
        if !inode.is_dir() {
            return Err(FsError::NotADirectory);
        }

        let mut cursor = DirCursor::new(meta.block_size());
        let mut offset = 0u64;
        while let Some(entry) = cursor.dentry_at(&self.disk, &meta, &inode, offset) {
            offset += u64::from(entry.rec_len);

            if entry.inode.is_null() {
                continue;
            }
            if filler(entry.name, entry.inode, entry.file_type) {
                break;
            }
        }

        Ok(())
    }

    /// Creates a directory: a fresh inode with "." and ".." entries, plus a record in
    /// the parent.
    pub fn mkdir(&self, path: &str, mode: u32) -> FsResult<()> {
        let (parent_path, name) = split_path(path);
        if name.len() > MAX_NAME_LEN {
            return Err(FsError::NameTooLong);
        }
        if name.is_empty() {
            return Err(FsError::NotFound);
        }
        debug!("mkdir {name} under {parent_path}");

        let mut meta = self.meta.write();
        let parent_ino = self
            .resolve_in(&meta, parent_path)
            .ok_or(FsError::NotFound)?;
        let mut parent_inode = inode::read_inode(&self.disk, &meta, parent_ino)?;
        if !parent_inode.is_dir() {
            return Err(FsError::NotADirectory);
        }

        let child_ino = meta.alloc_inode(&self.disk);
        let mut child = Inode::default();
        child.i_mode = (mode | u32::from(libc::S_IFDIR)) as u16;
        child.i_links_count = 2;

        dir::add_dentry(
            &self.disk,
            &mut meta,
            &mut child,
            child_ino,
            FileType::DIRECTORY,
            b".",
        );
        dir::add_dentry(
            &self.disk,
            &mut meta,
            &mut child,
            parent_ino,
            FileType::DIRECTORY,
            b"..",
        );
        dir::add_dentry(
            &self.disk,
            &mut meta,
            &mut parent_inode,
            child_ino,
            FileType::DIRECTORY,
            name.as_bytes(),
        );
        parent_inode.i_links_count += 1;

        inode::write_inode(&self.disk, &meta, child_ino, &child);
        inode::write_inode(&self.disk, &meta, parent_ino, &parent_inode);
        Ok(())
    }

    /// Creates a regular file: a fresh inode and a record in the parent.
    pub fn mknod(&self, path: &str, mode: u32) -> FsResult<()> {
        let (parent_path, name) = split_path(path);
        if name.len() > MAX_NAME_LEN {
            return Err(FsError::NameTooLong);
        }
        if name.is_empty() {
            return Err(FsError::NotFound);
        }
        debug!("mknod {name} under {parent_path}");

        let mut meta = self.meta.write();
        let parent_ino = self
            .resolve_in(&meta, parent_path)
            .ok_or(FsError::NotFound)?;
        let mut parent_inode = inode::read_inode(&self.disk, &meta, parent_ino)?;
        if !parent_inode.is_dir() {
            return Err(FsError::NotADirectory);
        }

        let child_ino = meta.alloc_inode(&self.disk);
        let mut child = Inode::default();
        child.i_mode = mode as u16;
        child.i_links_count = 1;

        dir::add_dentry(
            &self.disk,
            &mut meta,
            &mut parent_inode,
            child_ino,
            FileType::REGULAR,
            name.as_bytes(),
        );

        inode::write_inode(&self.disk, &meta, child_ino, &child);
        inode::write_inode(&self.disk, &meta, parent_ino, &parent_inode);
        Ok(())
    }

    /// Removes a directory tree: the parent's record first, then the target and
    /// everything below it.
    pub fn rmdir(&self, path: &str) -> FsResult<()> {
        let (parent_path, _) = split_path(path);
        debug!("rmdir {path}");

        let mut meta = self.meta.write();
        let target_ino = self.resolve_in(&meta, path).ok_or(FsError::NotFound)?;
        let target_inode = inode::read_inode(&self.disk, &meta, target_ino)?;
        let parent_ino = self
            .resolve_in(&meta, parent_path)
            .ok_or(FsError::NotFound)?;
        let mut parent_inode = inode::read_inode(&self.disk, &meta, parent_ino)?;

        dir::rm_dentry(
            &self.disk,
            &meta,
            &parent_inode,
            parent_ino,
            target_ino,
            &self.dcache,
        );
        dir::rm_dir(&self.disk, &mut meta, &target_inode, target_ino, &self.dcache);

        parent_inode.i_links_count = parent_inode.i_links_count.saturating_sub(1);
        inode::write_inode(&self.disk, &meta, parent_ino, &parent_inode);
        Ok(())
    }

    /// Removes a regular file: the parent's record, the file's blocks, and its inode.
    pub fn unlink(&self, path: &str) -> FsResult<()> {
        let (parent_path, _) = split_path(path);
        debug!("unlink {path}");

        let mut meta = self.meta.write();
        let target_ino = self.resolve_in(&meta, path).ok_or(FsError::NotFound)?;
        let target_inode = inode::read_inode(&self.disk, &meta, target_ino)?;
        let parent_ino = self
            .resolve_in(&meta, parent_path)
            .ok_or(FsError::NotFound)?;
        let parent_inode = inode::read_inode(&self.disk, &meta, parent_ino)?;

        dir::rm_dentry(
            &self.disk,
            &meta,
            &parent_inode,
            parent_ino,
            target_ino,
            &self.dcache,
        );
        dir::rm_file(&self.disk, &mut meta, &target_inode, target_ino);
        Ok(())
    }

    /// Free-space counters for both tiers.
    pub fn statfs(&self) -> FsStat {
        let meta = self.meta.read();
        let (free_ssd_blocks, free_hdd_blocks, free_inodes) = meta.free_counts();
        FsStat {
            block_size: meta.block_size(),
            free_ssd_blocks,
            free_hdd_blocks,
            free_inodes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_path_variants() {
        assert_eq!(split_path("/a"), ("/", "a"));
        assert_eq!(split_path("/a/b"), ("/a", "b"));
        assert_eq!(split_path("/a/b/"), ("/a", "b"));
        assert_eq!(split_path("/x/y/z"), ("/x/y", "z"));
    }
}
