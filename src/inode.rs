//! Inodes and the logical-to-physical block map.
//!
//! Inodes are read from the fast-tier inode table on demand into caller-owned values and
//! written straight back; there is no in-memory inode cache. The block map is the classic
//! direct / single / double / triple indirect scheme over 32-bit [`PBlock`] slots: a zero
//! slot is a hole at any depth, and missing index blocks materialize lazily on the fast
//! tier when a mapping is installed.

use bytemuck::{bytes_of, pod_read_unaligned, Pod, Zeroable};

use crate::block_grp::Metadata;
use crate::disk::{DiskManager, PBlock};
use crate::err::{fatal, FsError, FsResult};

/// Number of direct slots in `i_block`.
pub(crate) const NDIR_BLOCKS: usize = 12;

/// `i_block` slot of the single-indirect index block.
pub(crate) const IND_BLOCK: usize = 12;

/// `i_block` slot of the double-indirect index block.
pub(crate) const DIND_BLOCK: usize = 13;

/// `i_block` slot of the triple-indirect index block.
pub(crate) const TIND_BLOCK: usize = 14;

/// A 1-based inode number. Zero never names an inode on disk; it marks unused directory
/// entries and failed lookups.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Pod, Zeroable)]
#[repr(transparent)]
pub struct InodeNo(u32);

impl InodeNo {
    /// The unused / not-found marker.
    pub const NULL: Self = Self(0);

    /// The root directory, inode 2 by ext4 convention.
    pub const ROOT: Self = Self(2);

    pub(crate) fn new(n: u32) -> Self {
        Self(n)
    }

    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    /// The number as a binding-friendly file handle.
    pub fn as_u64(self) -> u64 {
        u64::from(self.0)
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Index into the on-disk tables, where inode 1 sits at slot 0.
    pub(crate) fn index_0based(self) -> u32 {
        assert!(self.0 != 0, "inode 0 does not exist on disk");
        self.0 - 1
    }
}

impl core::fmt::Display for InodeNo {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_fmt(format_args!("#{}", self.0))
    }
}

/// The on-disk ext4 inode, in its 160-byte form.
///
/// Images may carry larger inode records; only `min(record size, this struct)` bytes are
/// read and written, which covers every field the engine touches.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
#[allow(dead_code)]
pub(crate) struct Inode {
    /// File mode: type in the high nibble, permissions below.
    pub(crate) i_mode: u16,

    /// Low 16-bits of the owner uid.
    pub(crate) i_uid: u16,

    /// Low 32-bits of the size in bytes.
    pub(crate) i_size_lo: u32,

    /// Last access time, seconds since the epoch.
    pub(crate) i_atime: u32,

    /// Last inode change time.
    pub(crate) i_ctime: u32,

    /// Last data modification time.
    pub(crate) i_mtime: u32,

    /// Deletion time.
    pub(crate) i_dtime: u32,

    /// Low 16-bits of the gid.
    pub(crate) i_gid: u16,

    /// Hard link count.
    pub(crate) i_links_count: u16,

    /// Block count in 512-byte units.
    pub(crate) i_blocks_lo: u32,

    /// Inode flags.
    pub(crate) i_flags: u32,

    /// OS-dependent field (inode version on Linux).
    pub(crate) i_version: u32,

    /// The block map: 12 direct slots, then single, double and triple indirect.
    pub(crate) i_block: [PBlock; 15],

    /// File version for NFS.
    pub(crate) i_generation: u32,

    /// Low 32-bits of the extended attribute block.
    pub(crate) i_file_acl_lo: u32,

    /// High 32-bits of the size in bytes.
    pub(crate) i_size_high: u32,

    /// Obsolete fragment address.
    i_obso_faddr: u32,

    /// High 16-bits of the block count.
    pub(crate) i_blocks_high: u16,

    /// High 16-bits of the extended attribute block.
    pub(crate) i_file_acl_high: u16,

    /// High 16-bits of the owner uid.
    pub(crate) i_uid_high: u16,

    /// High 16-bits of the gid.
    pub(crate) i_gid_high: u16,

    /// Low 16-bits of the inode checksum.
    pub(crate) i_checksum_lo: u16,

    reserved: u16,

    /// Size of this inode record beyond the original 128 bytes.
    pub(crate) i_extra_isize: u16,

    /// High 16-bits of the inode checksum.
    pub(crate) i_checksum_hi: u16,

    /// Extra change time bits.
    pub(crate) i_ctime_extra: u32,

    /// Extra modification time bits.
    pub(crate) i_mtime_extra: u32,

    /// Extra access time bits.
    pub(crate) i_atime_extra: u32,

    /// File creation time.
    pub(crate) i_crtime: u32,

    /// Extra file creation time bits.
    pub(crate) i_crtime_extra: u32,

    /// High 32-bits of the version number.
    pub(crate) i_version_hi: u32,

    /// Project id.
    pub(crate) i_projid: u32,
}

impl Inode {
    /// File size in bytes, composed from the split halves.
    pub(crate) fn size(&self) -> u64 {
        u64::from(self.i_size_lo) | (u64::from(self.i_size_high) << 32)
    }

    pub(crate) fn set_size(&mut self, size: u64) {
        self.i_size_lo = (size & 0xffff_ffff) as u32;
        self.i_size_high = (size >> 32) as u32;
    }

    /// Block count in filesystem blocks. `i_blocks_lo` counts 512-byte sectors.
    pub(crate) fn block_count(&self, block_size: u32) -> u32 {
        self.i_blocks_lo / (block_size / 512)
    }

    pub(crate) fn set_block_count(&mut self, blocks: u32, block_size: u32) {
        self.i_blocks_lo = blocks * (block_size / 512);
    }

    pub(crate) fn is_dir(&self) -> bool {
        self.i_mode & (libc::S_IFMT as u16) == libc::S_IFDIR as u16
    }
}

/// Reads inode `ino` from the fast-tier inode table.
pub(crate) fn read_inode(disk: &DiskManager, meta: &Metadata, ino: InodeNo) -> FsResult<Inode> {
    if ino.is_null() {
        return Err(FsError::NotFound);
    }

    let nbytes = (meta.inode_size() as usize).min(core::mem::size_of::<Inode>());
    let mut raw = [0u8; core::mem::size_of::<Inode>()];
    disk.metadata_read(&mut raw[..nbytes], meta.inode_table_entry_offset(ino));

    Ok(pod_read_unaligned(&raw))
}

/// Writes inode `ino` back to the fast-tier inode table.
pub(crate) fn write_inode(disk: &DiskManager, meta: &Metadata, ino: InodeNo, inode: &Inode) {
    assert!(!ino.is_null());

    let nbytes = (meta.inode_size() as usize).min(core::mem::size_of::<Inode>());
    disk.metadata_write(&bytes_of(inode)[..nbytes], meta.inode_table_entry_offset(ino));
}

/// Entries per index block.
fn entries_per_block(block_size: u32) -> u64 {
    u64::from(block_size / 4)
}

/// Resolves logical block `lblock` of a file to its physical block, or [`PBlock::NULL`]
/// if any slot along the way is a hole.
pub(crate) fn data_pblock(
    disk: &DiskManager,
    meta: &Metadata,
    inode: &Inode,
    lblock: u32,
) -> PBlock {
    let n = entries_per_block(meta.block_size());
    let l = u64::from(lblock);

    if l < NDIR_BLOCKS as u64 {
        inode.i_block[lblock as usize]
    } else if l < NDIR_BLOCKS as u64 + n {
        ind_lookup(disk, inode.i_block[IND_BLOCK], l - NDIR_BLOCKS as u64)
    } else if l < NDIR_BLOCKS as u64 + n + n * n {
        dind_lookup(
            disk,
            meta,
            inode.i_block[DIND_BLOCK],
            l - NDIR_BLOCKS as u64 - n,
        )
    } else if l < NDIR_BLOCKS as u64 + n + n * n + n * n * n {
        tind_lookup(
            disk,
            meta,
            inode.i_block[TIND_BLOCK],
            l - NDIR_BLOCKS as u64 - n - n * n,
        )
    } else {
        fatal!("logical block {lblock} exceeds the block map capacity");
    }
}

/// Installs a mapping for logical block `lblock`, materializing any missing index blocks
/// from the fast tier, and bumps the inode's block count when the file grows.
pub(crate) fn set_data_pblock(
    disk: &DiskManager,
    meta: &mut Metadata,
    inode: &mut Inode,
    lblock: u32,
    pblock: PBlock,
) {
    let bs = meta.block_size();
    let n = entries_per_block(bs);
    let l = u64::from(lblock);

    if l < NDIR_BLOCKS as u64 {
        inode.i_block[lblock as usize] = pblock;
    } else if l < NDIR_BLOCKS as u64 + n {
        if inode.i_block[IND_BLOCK].is_null() {
            inode.i_block[IND_BLOCK] = meta.alloc_index_pblock(disk);
        }
        ind_install(disk, inode.i_block[IND_BLOCK], l - NDIR_BLOCKS as u64, pblock);
    } else if l < NDIR_BLOCKS as u64 + n + n * n {
        if inode.i_block[DIND_BLOCK].is_null() {
            inode.i_block[DIND_BLOCK] = meta.alloc_index_pblock(disk);
        }
        dind_install(
            disk,
            meta,
            inode.i_block[DIND_BLOCK],
            l - NDIR_BLOCKS as u64 - n,
            pblock,
        );
    } else if l < NDIR_BLOCKS as u64 + n + n * n + n * n * n {
        if inode.i_block[TIND_BLOCK].is_null() {
            inode.i_block[TIND_BLOCK] = meta.alloc_index_pblock(disk);
        }
        tind_install(
            disk,
            meta,
            inode.i_block[TIND_BLOCK],
            l - NDIR_BLOCKS as u64 - n - n * n,
            pblock,
        );
    } else {
        fatal!("logical block {lblock} exceeds the block map capacity");
    }

    if lblock + 1 > inode.block_count(bs) {
        inode.set_block_count(lblock + 1, bs);
    }
}

fn index_entry(disk: &DiskManager, index_pblock: PBlock, idx: u64) -> PBlock {
    let mut raw = [0u8; 4];
    disk.read(&mut raw, index_pblock, idx as u32 * 4);
    PBlock::from_raw(u32::from_le_bytes(raw))
}

fn write_index_entry(disk: &DiskManager, index_pblock: PBlock, idx: u64, pblock: PBlock) {
    disk.write(&pblock.raw().to_le_bytes(), index_pblock, idx as u32 * 4);
}

fn ind_lookup(disk: &DiskManager, index_pblock: PBlock, idx: u64) -> PBlock {
    if index_pblock.is_null() {
        return PBlock::NULL;
    }
    index_entry(disk, index_pblock, idx)
}

fn dind_lookup(disk: &DiskManager, meta: &Metadata, dind_pblock: PBlock, idx: u64) -> PBlock {
    if dind_pblock.is_null() {
        return PBlock::NULL;
    }

    let n = entries_per_block(meta.block_size());
    let ind = index_entry(disk, dind_pblock, idx / n);
    ind_lookup(disk, ind, idx % n)
}

fn tind_lookup(disk: &DiskManager, meta: &Metadata, tind_pblock: PBlock, idx: u64) -> PBlock {
    if tind_pblock.is_null() {
        return PBlock::NULL;
    }

    let n = entries_per_block(meta.block_size());
    let dind = index_entry(disk, tind_pblock, idx / (n * n));
    dind_lookup(disk, meta, dind, idx % (n * n))
}

fn ind_install(disk: &DiskManager, index_pblock: PBlock, idx: u64, pblock: PBlock) {
    write_index_entry(disk, index_pblock, idx, pblock);
}

fn dind_install(
    disk: &DiskManager,
    meta: &mut Metadata,
    dind_pblock: PBlock,
    idx: u64,
    pblock: PBlock,
) {
    let n = entries_per_block(meta.block_size());
    let mut ind = index_entry(disk, dind_pblock, idx / n);
    if ind.is_null() {
        ind = meta.alloc_index_pblock(disk);
        write_index_entry(disk, dind_pblock, idx / n, ind);
    }

    ind_install(disk, ind, idx % n, pblock);
}

fn tind_install(
    disk: &DiskManager,
    meta: &mut Metadata,
    tind_pblock: PBlock,
    idx: u64,
    pblock: PBlock,
) {
    let n = entries_per_block(meta.block_size());
    let mut dind = index_entry(disk, tind_pblock, idx / (n * n));
    if dind.is_null() {
        dind = meta.alloc_index_pblock(disk);
        write_index_entry(disk, tind_pblock, idx / (n * n), dind);
    }

    dind_install(disk, meta, dind, idx % (n * n), pblock);
}

/// Gathers every physical block a file references, data blocks first and each index block
/// after its subtree, ready to be handed to the batch free path.
pub(crate) fn collect_pblocks(disk: &DiskManager, meta: &Metadata, inode: &Inode) -> Vec<PBlock> {
    let mut out = Vec::new();

    for &slot in &inode.i_block[..NDIR_BLOCKS] {
        if !slot.is_null() {
            out.push(slot);
        }
    }

    if !inode.i_block[IND_BLOCK].is_null() {
        collect_ind(disk, meta, inode.i_block[IND_BLOCK], &mut out);
    }
    if !inode.i_block[DIND_BLOCK].is_null() {
        collect_dind(disk, meta, inode.i_block[DIND_BLOCK], &mut out);
    }
    if !inode.i_block[TIND_BLOCK].is_null() {
        collect_tind(disk, meta, inode.i_block[TIND_BLOCK], &mut out);
    }

    out
}

fn read_index_block(disk: &DiskManager, meta: &Metadata, index_pblock: PBlock) -> Vec<PBlock> {
    let mut raw = vec![0u8; meta.block_size() as usize];
    disk.block_read(&mut raw, index_pblock);
    raw.chunks_exact(4)
        .map(|entry| PBlock::from_raw(u32::from_le_bytes(entry.try_into().unwrap())))
        .collect()
}

fn collect_ind(disk: &DiskManager, meta: &Metadata, index_pblock: PBlock, out: &mut Vec<PBlock>) {
    for entry in read_index_block(disk, meta, index_pblock) {
        if !entry.is_null() {
            out.push(entry);
        }
    }
    out.push(index_pblock);
}

fn collect_dind(disk: &DiskManager, meta: &Metadata, dind_pblock: PBlock, out: &mut Vec<PBlock>) {
    for entry in read_index_block(disk, meta, dind_pblock) {
        if !entry.is_null() {
            collect_ind(disk, meta, entry, out);
        }
    }
    out.push(dind_pblock);
}

fn collect_tind(disk: &DiskManager, meta: &Metadata, tind_pblock: PBlock, out: &mut Vec<PBlock>) {
    for entry in read_index_block(disk, meta, tind_pblock) {
        if !entry.is_null() {
            collect_dind(disk, meta, entry, out);
        }
    }
    out.push(tind_pblock);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inode_layout_matches_ext4() {
        assert_eq!(core::mem::size_of::<Inode>(), 160);
        assert_eq!(core::mem::offset_of!(Inode, i_block), 0x28);
        assert_eq!(core::mem::offset_of!(Inode, i_generation), 0x64);
        assert_eq!(core::mem::offset_of!(Inode, i_extra_isize), 0x80);
    }

    #[test]
    fn size_split_round_trip() {
        let mut inode = Inode::zeroed();

        inode.set_size(5);
        assert_eq!(inode.size(), 5);
        assert_eq!(inode.i_size_lo, 5);

        let big = 7 * (1u64 << 32) + 123;
        inode.set_size(big);
        assert_eq!(inode.size(), big);
        assert_eq!(inode.i_size_high, 7);
    }

    #[test]
    fn block_count_in_sectors() {
        let mut inode = Inode::zeroed();

        inode.set_block_count(3, 4096);
        assert_eq!(inode.i_blocks_lo, 24);
        assert_eq!(inode.block_count(4096), 3);

        inode.set_block_count(3, 1024);
        assert_eq!(inode.i_blocks_lo, 6);
        assert_eq!(inode.block_count(1024), 3);
    }

    #[test]
    fn mode_type_check() {
        let mut inode = Inode::zeroed();
        inode.i_mode = libc::S_IFDIR as u16 | 0o755;
        assert!(inode.is_dir());

        inode.i_mode = libc::S_IFREG as u16 | 0o644;
        assert!(!inode.is_dir());
    }

    #[test]
    fn inode_zero_is_not_found() {
        assert!(InodeNo::NULL.is_null());
        assert_eq!(InodeNo::ROOT.raw(), 2);
        assert_eq!(InodeNo::ROOT.index_0based(), 1);
    }
}
