//! Directory records.
//!
//! Directories are files whose blocks hold variable-length records: a 32-bit inode, a
//! 16-bit record length, a name length, a file type byte, and the raw name. Record lengths
//! are 4-byte aligned, and the last record of each block stretches to the block boundary,
//! so the records of one block always sum to exactly the block size. An inode of zero
//! marks a tombstone.
//!
//! Records are encoded and decoded explicitly over byte slices; nothing ever overlays a
//! struct on the variable-length tail.

use log::debug;

use crate::block_grp::Metadata;
use crate::dcache::DCache;
use crate::disk::DiskManager;
use crate::err::fatal;
use crate::inode::{self, Inode, InodeNo};

/// Maximum file name length in bytes.
pub const MAX_NAME_LEN: usize = 255;

/// File type byte of a directory record.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FileType(u8);

impl FileType {
    pub const REGULAR: Self = Self(0x1);
    pub const DIRECTORY: Self = Self(0x2);

    pub(crate) fn from_raw(raw: u8) -> Self {
        Self(raw)
    }

    pub fn is_directory(self) -> bool {
        self.0 & 0x2 != 0
    }
}

/// A decoded directory record, borrowing its name from the block buffer.
pub(crate) struct DirEntry<'a> {
    pub(crate) inode: InodeNo,
    pub(crate) rec_len: u16,
    pub(crate) file_type: FileType,
    pub(crate) name: &'a [u8],
}

/// Smallest record length able to hold a name of `name_len` bytes: the 8-byte header plus
/// the name, rounded up to a multiple of 4.
pub(crate) fn min_rec_len(name_len: usize) -> u16 {
    assert!(name_len <= MAX_NAME_LEN);
    ((8 + name_len + 3) & !3) as u16
}

/// Decodes the record at `offset` inside a directory block.
pub(crate) fn decode(block: &[u8], offset: usize) -> DirEntry<'_> {
    if offset + 8 > block.len() {
        fatal!("directory record header at offset {offset} runs past the block");
    }

    let inode = u32::from_le_bytes(block[offset..offset + 4].try_into().unwrap());
    let rec_len = u16::from_le_bytes(block[offset + 4..offset + 6].try_into().unwrap());
    let name_len = block[offset + 6] as usize;
    let file_type = FileType::from_raw(block[offset + 7]);

    if rec_len < 8
        || rec_len % 4 != 0
        || offset + rec_len as usize > block.len()
        || 8 + name_len > rec_len as usize
    {
        fatal!("corrupt directory record at offset {offset} (rec_len = {rec_len})");
    }

    DirEntry {
        inode: InodeNo::from_raw(inode),
        rec_len,
        file_type,
        name: &block[offset + 8..offset + 8 + name_len],
    }
}

/// Encodes a record at `offset` inside a directory block.
pub(crate) fn encode(
    block: &mut [u8],
    offset: usize,
    ino: InodeNo,
    rec_len: u16,
    file_type: FileType,
    name: &[u8],
) {
    assert!(rec_len >= min_rec_len(name.len()));
    assert!(offset + rec_len as usize <= block.len());

    block[offset..offset + 4].copy_from_slice(&ino.raw().to_le_bytes());
    block[offset + 4..offset + 6].copy_from_slice(&rec_len.to_le_bytes());
    block[offset + 6] = name.len() as u8;
    block[offset + 7] = file_type.0;
    block[offset + 8..offset + 8 + name.len()].copy_from_slice(name);
}

fn patch_rec_len(block: &mut [u8], offset: usize, rec_len: u16) {
    block[offset + 4..offset + 6].copy_from_slice(&rec_len.to_le_bytes());
}

fn patch_tombstone(block: &mut [u8], offset: usize) {
    block[offset..offset + 4].copy_from_slice(&0u32.to_le_bytes());
}

/// Cursor over a directory's records: a one-block buffer plus the logical block it holds,
/// reloaded only when iteration crosses a block boundary. Callers advance their byte
/// offset by each record's `rec_len`.
pub(crate) struct DirCursor {
    buf: Vec<u8>,
    lblock: Option<u32>,
}

impl DirCursor {
    pub(crate) fn new(block_size: u32) -> Self {
        Self {
            buf: vec![0u8; block_size as usize],
            lblock: None,
        }
    }

    /// The record at byte `offset` of the directory, or `None` past the last block.
    pub(crate) fn dentry_at(
        &mut self,
        disk: &DiskManager,
        meta: &Metadata,
        inode: &Inode,
        offset: u64,
    ) -> Option<DirEntry<'_>> {
        let bs = meta.block_size();
        let lblock = (offset / u64::from(bs)) as u32;
        if lblock >= inode.block_count(bs) {
            return None;
        }

        if self.lblock != Some(lblock) {
            let pblock = inode::data_pblock(disk, meta, inode, lblock);
            if pblock.is_null() {
                fatal!("hole at logical block {lblock} of a directory");
            }
            disk.block_read(&mut self.buf, pblock);
            self.lblock = Some(lblock);
        }

        Some(decode(&self.buf, (offset % u64::from(bs)) as usize))
    }
}

/// Inserts a record into a directory, preferring space already on disk: a whole-block
/// tombstone first, then slack carved off an existing record, and only then a fresh
/// fast-tier block appended to the directory.
pub(crate) fn add_dentry(
    disk: &DiskManager,
    meta: &mut Metadata,
    dir_inode: &mut Inode,
    ino: InodeNo,
    file_type: FileType,
    name: &[u8],
) {
    let bs = meta.block_size() as usize;
    let needed = min_rec_len(name.len());
    let nblocks = dir_inode.block_count(bs as u32);

    let mut buf = vec![0u8; bs];
    for lblock in 0..nblocks {
        let pblock = inode::data_pblock(disk, meta, dir_inode, lblock);
        if pblock.is_null() {
            fatal!("hole at logical block {lblock} of a directory");
        }
        disk.block_read(&mut buf, pblock);

        let mut offset = 0usize;
        while offset < bs {
            let entry = decode(&buf, offset);
            let (e_ino, e_rec_len, e_name_len) = (entry.inode, entry.rec_len, entry.name.len());

            // a tombstone holding a whole slot at the head of the block is reused in place
            if offset == 0 && e_ino.is_null() && e_rec_len >= needed {
                encode(&mut buf, 0, ino, e_rec_len, file_type, name);
                disk.block_write(&buf, pblock);
                return;
            }

            if !e_ino.is_null() {
                let e_min = min_rec_len(e_name_len);
                if e_min + needed <= e_rec_len {
                    let leftover = e_rec_len - e_min;
                    patch_rec_len(&mut buf, offset, e_min);
                    encode(
                        &mut buf,
                        offset + e_min as usize,
                        ino,
                        leftover,
                        file_type,
                        name,
                    );
                    disk.block_write(&buf, pblock);
                    return;
                }
            }

            offset += e_rec_len as usize;
        }
    }

    // no block had room: append a fresh one, the new record spanning all of it
    let pblock = meta.alloc_ssd_block(disk);
    inode::set_data_pblock(disk, meta, dir_inode, nblocks, pblock);
    dir_inode.set_size(dir_inode.size() + bs as u64);

    buf.fill(0);
    encode(&mut buf, 0, ino, bs as u16, file_type, name);
    disk.block_write(&buf, pblock);
    debug!("directory grew to {} blocks", nblocks + 1);
}

/// Removes the record naming `target` from a directory. "." and ".." are never candidates.
/// A record alone in its block becomes a tombstone; otherwise the previous record absorbs
/// its length. The matching path-cache entry is dropped alongside.
///
/// Returns whether the target was found.
pub(crate) fn rm_dentry(
    disk: &DiskManager,
    meta: &Metadata,
    parent_inode: &Inode,
    parent_ino: InodeNo,
    target: InodeNo,
    dcache: &DCache,
) -> bool {
    let bs = meta.block_size() as usize;
    let nblocks = parent_inode.block_count(bs as u32);

    let mut buf = vec![0u8; bs];
    for lblock in 0..nblocks {
        let pblock = inode::data_pblock(disk, meta, parent_inode, lblock);
        if pblock.is_null() {
            fatal!("hole at logical block {lblock} of a directory");
        }
        disk.block_read(&mut buf, pblock);

        // block 0 starts with ".": skip it so the leading entries stay intact
        let mut offset = if lblock == 0 {
            decode(&buf, 0).rec_len as usize
        } else {
            0
        };
        let mut prev_offset = if lblock == 0 { Some(0) } else { None };

        while offset < bs {
            let entry = decode(&buf, offset);
            let (e_ino, e_rec_len) = (entry.inode, entry.rec_len);

            if e_ino == target {
                let name = entry.name.to_vec();

                if e_rec_len as usize == bs {
                    patch_tombstone(&mut buf, offset);
                } else if let Some(prev) = prev_offset {
                    let prev_rec_len = decode(&buf, prev).rec_len;
                    patch_rec_len(&mut buf, prev, prev_rec_len + e_rec_len);
                    patch_tombstone(&mut buf, offset);
                } else {
                    // head of a later block with live followers: tombstone in place,
                    // reusable through the whole-slot path
                    patch_tombstone(&mut buf, offset);
                }

                disk.block_write(&buf, pblock);
                dcache.remove(&name, parent_ino);
                return true;
            }

            prev_offset = Some(offset);
            offset += e_rec_len as usize;
        }
    }

    false
}

/// Recursively deletes a directory's contents, then the directory's own blocks and inode.
/// The caller removes the directory's record from its parent beforehand.
pub(crate) fn rm_dir(
    disk: &DiskManager,
    meta: &mut Metadata,
    dir_inode: &Inode,
    dir_ino: InodeNo,
    dcache: &DCache,
) {
    let bs = meta.block_size();

    let mut children: Vec<(Vec<u8>, InodeNo, FileType)> = Vec::new();
    let mut cursor = DirCursor::new(bs);
    let mut offset = 0u64;
    while let Some(entry) = cursor.dentry_at(disk, meta, dir_inode, offset) {
        offset += u64::from(entry.rec_len);

        if entry.inode.is_null() || entry.name == b"." || entry.name == b".." {
            continue;
        }
        children.push((entry.name.to_vec(), entry.inode, entry.file_type));
    }

    for (name, child_ino, file_type) in children {
        dcache.remove(&name, dir_ino);

        let child_inode = match inode::read_inode(disk, meta, child_ino) {
            Ok(i) => i,
            Err(_) => fatal!("directory {dir_ino} references inode 0"),
        };
        if file_type.is_directory() {
            rm_dir(disk, meta, &child_inode, child_ino, dcache);
        } else {
            rm_file(disk, meta, &child_inode, child_ino);
        }
    }

    rm_file(disk, meta, dir_inode, dir_ino);
}

/// Releases every block a file references, then its inode.
pub(crate) fn rm_file(disk: &DiskManager, meta: &mut Metadata, inode: &Inode, ino: InodeNo) {
    let pblocks = inode::collect_pblocks(disk, meta, inode);
    meta.free_pblocks(disk, &pblocks);
    meta.free_inode(disk, ino);
    debug!("removed inode {ino} ({} blocks)", pblocks.len());
}
