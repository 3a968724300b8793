//! Block groups, descriptor tables and the allocation policy.
//!
//! Both tiers are carved into block groups, each tracked by a descriptor and a one-block
//! bitmap. The fast tier reuses the ext4 group descriptor layout; the slow tier uses a
//! private 16-byte descriptor. This module owns both tables and routes every allocation:
//! data blocks below the configured logical threshold (and all index blocks, inodes and
//! directory blocks) land on the fast tier, data blocks at or above it on the slow tier.
//!
//! Allocation and freeing mutate a bitmap, the matching descriptor free count, and disk,
//! in that order; callers serialize these paths through an exclusive lock on [`Metadata`]
//! so the scan-set-persist sequence is never interleaved.

use bytemuck::{bytes_of, cast_slice, pod_read_unaligned, Pod, Zeroable};
use hashbrown::HashMap;
use log::{debug, info};

use crate::bitmap::Bitmap;
use crate::disk::{DiskManager, PBlock};
use crate::err::fatal;
use crate::inode::InodeNo;
use crate::sb::{HddGroupDesc, HddSuperblock, Superblock};

/// An ext4 block group descriptor, in its full 64-byte form.
///
/// Images formatted with 32-byte descriptors only populate the first half; the `_hi`
/// fields then stay zero and only the `_lo` halves are consumed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
#[allow(dead_code)]
pub(crate) struct GroupDescriptor {
    /// Low 32-bits of the block bitmap location.
    pub(crate) block_bitmap_lo: u32,

    /// Low 32-bits of the inode bitmap location.
    pub(crate) inode_bitmap_lo: u32,

    /// Low 32-bits of the inode table location.
    pub(crate) inode_table_lo: u32,

    /// Low 16-bits of the free block count.
    pub(crate) free_blocks_count_lo: u16,

    /// Low 16-bits of the free inode count.
    pub(crate) free_inodes_count_lo: u16,

    /// Low 16-bits of the directory count.
    pub(crate) used_dirs_count_lo: u16,

    /// Block group flags.
    pub(crate) flags: u16,

    /// Low 32-bits of the snapshot exclusion bitmap location.
    pub(crate) exclude_bitmap_lo: u32,

    /// Low 16-bits of the block bitmap checksum.
    pub(crate) block_bitmap_csum_lo: u16,

    /// Low 16-bits of the inode bitmap checksum.
    pub(crate) inode_bitmap_csum_lo: u16,

    /// Low 16-bits of the unused inode count.
    pub(crate) itable_unused_lo: u16,

    /// Group descriptor checksum.
    pub(crate) checksum: u16,

    /// High 32-bits of the block bitmap location.
    pub(crate) block_bitmap_hi: u32,

    /// High 32-bits of the inode bitmap location.
    pub(crate) inode_bitmap_hi: u32,

    /// High 32-bits of the inode table location.
    pub(crate) inode_table_hi: u32,

    /// High 16-bits of the free block count.
    pub(crate) free_blocks_count_hi: u16,

    /// High 16-bits of the free inode count.
    pub(crate) free_inodes_count_hi: u16,

    /// High 16-bits of the directory count.
    pub(crate) used_dirs_count_hi: u16,

    /// High 16-bits of the unused inode count.
    pub(crate) itable_unused_hi: u16,

    /// High 32-bits of the snapshot exclusion bitmap location.
    pub(crate) exclude_bitmap_hi: u32,

    /// High 16-bits of the block bitmap checksum.
    pub(crate) block_bitmap_csum_hi: u16,

    /// High 16-bits of the inode bitmap checksum.
    pub(crate) inode_bitmap_csum_hi: u16,

    reserved: u32,
}

/// Process-wide filesystem metadata: the fast-tier superblock and descriptor table, the
/// slow-tier superblock and descriptor table, and the tier-placement threshold.
///
/// Lives behind a `RwLock` in the filesystem handle; allocation and free paths take the
/// write half.
pub(crate) struct Metadata {
    sb: Superblock,
    gdt: Vec<GroupDescriptor>,
    hdd_sb: HddSuperblock,
    hdd_gdt: Vec<HddGroupDesc>,
    ssd_max_lblock: u32,
}

impl Metadata {
    /// Loads both descriptor tables, initializing the slow tier's metadata if the file is
    /// blank. The disk layer's block size must already be configured.
    pub(crate) fn load(disk: &DiskManager, sb: Superblock, ssd_max_lblock: u32) -> Self {
        let desc_size = sb.group_desc_size() as usize;
        let gdt_offset = sb.gdt_offset();

        let mut gdt = Vec::with_capacity(sb.group_count() as usize);
        for i in 0..sb.group_count() {
            let mut raw = [0u8; core::mem::size_of::<GroupDescriptor>()];
            disk.metadata_read(
                &mut raw[..desc_size],
                gdt_offset + u64::from(i) * desc_size as u64,
            );
            gdt.push(pod_read_unaligned(&raw));
        }

        // a file shorter than the superblock is blank by definition
        let hdd_sb = if disk.hdd_len() < core::mem::size_of::<HddSuperblock>() as u64 {
            HddSuperblock::zeroed()
        } else {
            let mut raw_hdd_sb = [0u8; core::mem::size_of::<HddSuperblock>()];
            disk.hdd_metadata_read(&mut raw_hdd_sb, 0);
            pod_read_unaligned(&raw_hdd_sb)
        };

        let (hdd_sb, hdd_gdt) = if hdd_sb.group_count == 0 {
            Self::init_hdd(disk, &sb)
        } else {
            let mut hdd_gdt = vec![HddGroupDesc::zeroed(); hdd_sb.group_count as usize];
            disk.hdd_metadata_read(
                bytemuck::cast_slice_mut(&mut hdd_gdt),
                core::mem::size_of::<HddSuperblock>() as u64,
            );
            (hdd_sb, hdd_gdt)
        };

        let meta = Self {
            sb,
            gdt,
            hdd_sb,
            hdd_gdt,
            ssd_max_lblock,
        };
        info!(
            "hdd tier: {} groups over {} bytes",
            meta.hdd_sb.group_count, meta.hdd_sb.file_size
        );
        meta
    }

    /// Lays out a blank slow-tier file: groups sized so one block of bitmap bits covers
    /// exactly `block_size * 8` blocks. Group 0 reserves the leading metadata blocks plus
    /// its bitmap block, every other group only its bitmap block.
    fn init_hdd(disk: &DiskManager, sb: &Superblock) -> (HddSuperblock, Vec<HddGroupDesc>) {
        let bs = u64::from(sb.block_size());
        let file_size = disk.hdd_len();
        let blocks_per_group = bs * 8;
        let group_count = file_size / (bs * bs * 8);

        let meta_bytes = core::mem::size_of::<HddSuperblock>() as u64
            + group_count * core::mem::size_of::<HddGroupDesc>() as u64;
        let meta_blocks = u64::from(sb.bytes_to_blocks(meta_bytes));

        let mut hdd_gdt = Vec::with_capacity(group_count as usize);
        for g in 0..group_count {
            let reserved = if g == 0 { meta_blocks + 1 } else { 1 };
            let bitmap_block = g * blocks_per_group + if g == 0 { meta_blocks } else { 0 };

            let mut bitmap = Bitmap::new(sb.block_size());
            assert!(reserved <= u64::from(bitmap.size()));
            for bit in 0..reserved {
                bitmap.set(bit as u32);
            }
            bitmap.save(disk, PBlock::hdd(bitmap_block as u32));

            hdd_gdt.push(HddGroupDesc {
                free_blocks_count: blocks_per_group - reserved,
                block_bitmap: bitmap_block,
            });
        }

        let hdd_sb = HddSuperblock {
            file_size,
            group_count,
        };
        disk.hdd_metadata_write(bytes_of(&hdd_sb), 0);
        if !hdd_gdt.is_empty() {
            disk.hdd_metadata_write(
                cast_slice(&hdd_gdt),
                core::mem::size_of::<HddSuperblock>() as u64,
            );
        }

        info!("initialized hdd tier: {group_count} groups of {blocks_per_group} blocks");
        (hdd_sb, hdd_gdt)
    }

    pub(crate) fn block_size(&self) -> u32 {
        self.sb.block_size()
    }

    pub(crate) fn inode_size(&self) -> u32 {
        u32::from(self.sb.inode_size)
    }

    /// Byte offset of inode `ino`'s slot in the fast-tier inode table.
    pub(crate) fn inode_table_entry_offset(&self, ino: InodeNo) -> u64 {
        let index = ino.index_0based();
        let group = (index / self.sb.inodes_per_group) as usize;
        assert!(group < self.gdt.len(), "inode {ino} beyond the last group");

        let table_block = u64::from(self.gdt[group].inode_table_lo);
        table_block * u64::from(self.block_size())
            + u64::from(index % self.sb.inodes_per_group) * u64::from(self.inode_size())
    }

    /// Picks the tier for a new data block: fast below the threshold, slow at or above.
    pub(crate) fn alloc_data_pblock(&mut self, disk: &DiskManager, lblock: u32) -> PBlock {
        if lblock < self.ssd_max_lblock {
            self.alloc_ssd_block(disk)
        } else {
            self.alloc_hdd_block(disk)
        }
    }

    /// Index blocks always come from the fast tier, wherever the data they map lives.
    pub(crate) fn alloc_index_pblock(&mut self, disk: &DiskManager) -> PBlock {
        self.alloc_ssd_block(disk)
    }

    /// First-fit block allocation on the fast tier: first group with a nonzero free count,
    /// first clear bit in its bitmap (block 0 of group 0 is never handed out).
    pub(crate) fn alloc_ssd_block(&mut self, disk: &DiskManager) -> PBlock {
        let bs = self.sb.block_size();
        for g in 0..self.gdt.len() {
            if self.gdt[g].free_blocks_count_lo == 0 {
                continue;
            }
            let bitmap_block = PBlock::ssd(self.gdt[g].block_bitmap_lo);

            let mut bitmap = Bitmap::new(bs);
            bitmap.load(disk, bitmap_block);

            let start = if g == 0 { 1 } else { 0 };
            let Some(bit) = bitmap.first_clear(start) else {
                continue;
            };

            bitmap.set(bit);
            bitmap.save(disk, bitmap_block);
            self.gdt[g].free_blocks_count_lo -= 1;
            self.persist_ssd_desc(disk, g);

            let pblock = PBlock::ssd(g as u32 * self.sb.blocks_per_group + bit);
            debug!(
                "allocated {pblock} ({} left in group {g})",
                self.gdt[g].free_blocks_count_lo
            );
            return pblock;
        }

        fatal!("no free block left on the ssd tier");
    }

    /// First-fit block allocation on the slow tier.
    pub(crate) fn alloc_hdd_block(&mut self, disk: &DiskManager) -> PBlock {
        let bs = self.sb.block_size();
        let blocks_per_group = bs * 8;
        for g in 0..self.hdd_gdt.len() {
            if self.hdd_gdt[g].free_blocks_count == 0 {
                continue;
            }
            let bitmap_block = PBlock::hdd(self.hdd_gdt[g].block_bitmap as u32);

            let mut bitmap = Bitmap::new(bs);
            bitmap.load(disk, bitmap_block);

            let Some(bit) = bitmap.first_clear(0) else {
                continue;
            };

            bitmap.set(bit);
            bitmap.save(disk, bitmap_block);
            self.hdd_gdt[g].free_blocks_count -= 1;
            self.persist_hdd_desc(disk, g);

            let pblock = PBlock::hdd(g as u32 * blocks_per_group + bit);
            debug!(
                "allocated {pblock} ({} left in group {g})",
                self.hdd_gdt[g].free_blocks_count
            );
            return pblock;
        }

        fatal!("no free block left on the hdd tier");
    }

    /// Allocates an inode on the fast tier. Inode numbers are 1-based; the scan starts at
    /// bit 11 in group 0, leaving the reserved low inodes alone.
    pub(crate) fn alloc_inode(&mut self, disk: &DiskManager) -> InodeNo {
        let bs = self.sb.block_size();
        for g in 0..self.gdt.len() {
            if self.gdt[g].free_inodes_count_lo == 0 {
                continue;
            }
            let bitmap_block = PBlock::ssd(self.gdt[g].inode_bitmap_lo);

            let mut bitmap = Bitmap::new(bs);
            bitmap.load(disk, bitmap_block);

            let start = if g == 0 { 11 } else { 0 };
            let Some(bit) = bitmap.first_clear(start) else {
                continue;
            };

            bitmap.set(bit);
            bitmap.save(disk, bitmap_block);
            self.gdt[g].free_inodes_count_lo -= 1;
            self.persist_ssd_desc(disk, g);

            let ino = InodeNo::new(g as u32 * self.sb.inodes_per_group + bit + 1);
            debug!("allocated inode {ino}");
            return ino;
        }

        fatal!("no free inode left");
    }

    /// Frees a batch of physical blocks: clears each bit in its tier's bitmap (loaded
    /// lazily, once per group), bumps the group's free count, and zeroes the block on
    /// disk. Dirty bitmaps and descriptors are persisted once at the end; the slow-tier
    /// descriptor table goes out as a single contiguous write.
    pub(crate) fn free_pblocks(&mut self, disk: &DiskManager, pblocks: &[PBlock]) {
        let bs = self.sb.block_size();
        let zero = vec![0u8; bs as usize];

        let mut ssd_bitmaps: HashMap<u32, Bitmap> = HashMap::new();
        let mut hdd_bitmaps: HashMap<u32, Bitmap> = HashMap::new();

        for &pblock in pblocks {
            if pblock.is_null() {
                continue;
            }

            if pblock.is_hdd() {
                let group = pblock.index() / (bs * 8);
                let bit = pblock.index() % (bs * 8);
                assert!(
                    (group as usize) < self.hdd_gdt.len(),
                    "freed {pblock} beyond the last hdd group"
                );

                let desc = &mut self.hdd_gdt[group as usize];
                let bitmap = hdd_bitmaps.entry(group).or_insert_with(|| {
                    let mut bm = Bitmap::new(bs);
                    bm.load(disk, PBlock::hdd(desc.block_bitmap as u32));
                    bm
                });
                bitmap.unset(bit);
                desc.free_blocks_count += 1;
            } else {
                let group = pblock.index() / self.sb.blocks_per_group;
                let bit = pblock.index() % self.sb.blocks_per_group;
                assert!(
                    (group as usize) < self.gdt.len(),
                    "freed {pblock} beyond the last ssd group"
                );

                let desc = &mut self.gdt[group as usize];
                let bitmap = ssd_bitmaps.entry(group).or_insert_with(|| {
                    let mut bm = Bitmap::new(bs);
                    bm.load(disk, PBlock::ssd(desc.block_bitmap_lo));
                    bm
                });
                bitmap.unset(bit);
                desc.free_blocks_count_lo += 1;
            }

            disk.block_write(&zero, pblock);
            debug!("freed {pblock}");
        }

        for (&group, bitmap) in &ssd_bitmaps {
            bitmap.save(disk, PBlock::ssd(self.gdt[group as usize].block_bitmap_lo));
            self.persist_ssd_desc(disk, group as usize);
        }
        for (&group, bitmap) in &hdd_bitmaps {
            bitmap.save(
                disk,
                PBlock::hdd(self.hdd_gdt[group as usize].block_bitmap as u32),
            );
        }
        if !hdd_bitmaps.is_empty() {
            self.persist_hdd_table(disk);
        }
    }

    /// Releases an inode: clears its bitmap bit and gives the free count back.
    pub(crate) fn free_inode(&mut self, disk: &DiskManager, ino: InodeNo) {
        let bs = self.sb.block_size();
        let index = ino.index_0based();
        let group = (index / self.sb.inodes_per_group) as usize;
        assert!(group < self.gdt.len(), "freed inode {ino} beyond the last group");

        let desc = &mut self.gdt[group];
        let mut bitmap = Bitmap::new(bs);
        bitmap.load(disk, PBlock::ssd(desc.inode_bitmap_lo));
        bitmap.unset(index % self.sb.inodes_per_group);
        bitmap.save(disk, PBlock::ssd(desc.inode_bitmap_lo));

        desc.free_inodes_count_lo += 1;
        self.persist_ssd_desc(disk, group);
        debug!("freed inode {ino}");
    }

    /// Free block and inode counts, per tier, for statfs.
    pub(crate) fn free_counts(&self) -> (u64, u64, u64) {
        let ssd_blocks = self
            .gdt
            .iter()
            .map(|d| u64::from(d.free_blocks_count_lo))
            .sum();
        let hdd_blocks = self.hdd_gdt.iter().map(|d| d.free_blocks_count).sum();
        let inodes = self
            .gdt
            .iter()
            .map(|d| u64::from(d.free_inodes_count_lo))
            .sum();
        (ssd_blocks, hdd_blocks, inodes)
    }

    fn persist_ssd_desc(&self, disk: &DiskManager, group: usize) {
        let desc_size = self.sb.group_desc_size() as usize;
        let offset = self.sb.gdt_offset() + group as u64 * desc_size as u64;
        disk.metadata_write(&bytes_of(&self.gdt[group])[..desc_size], offset);
    }

    fn persist_hdd_desc(&self, disk: &DiskManager, group: usize) {
        let offset = core::mem::size_of::<HddSuperblock>() as u64
            + group as u64 * core::mem::size_of::<HddGroupDesc>() as u64;
        disk.hdd_metadata_write(bytes_of(&self.hdd_gdt[group]), offset);
    }

    fn persist_hdd_table(&self, disk: &DiskManager) {
        disk.hdd_metadata_write(
            cast_slice(&self.hdd_gdt),
            core::mem::size_of::<HddSuperblock>() as u64,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_descriptor_is_64_bytes() {
        assert_eq!(core::mem::size_of::<GroupDescriptor>(), 64);
        assert_eq!(core::mem::offset_of!(GroupDescriptor, free_blocks_count_lo), 12);
        assert_eq!(core::mem::offset_of!(GroupDescriptor, checksum), 30);
    }

    fn scratch_disk(
        ssd_len: u64,
        hdd_len: u64,
    ) -> (DiskManager, tempfile::NamedTempFile, tempfile::NamedTempFile) {
        let ssd = tempfile::NamedTempFile::new().unwrap();
        let hdd = tempfile::NamedTempFile::new().unwrap();
        ssd.as_file().set_len(ssd_len).unwrap();
        hdd.as_file().set_len(hdd_len).unwrap();

        let disk = DiskManager::open(ssd.path(), hdd.path());
        (disk, ssd, hdd)
    }

    #[test]
    fn hdd_init_geometry() {
        let mut sb = Superblock::zeroed();
        sb.log_block_size = 0; // 1 KiB blocks, 8 MiB per group

        let (disk, _ssd, _hdd) = scratch_disk(4096, 16 * 1024 * 1024);
        disk.set_block_size(1024);

        let (hdd_sb, hdd_gdt) = Metadata::init_hdd(&disk, &sb);
        assert_eq!(hdd_sb.group_count, 2);
        assert_eq!(hdd_gdt.len(), 2);

        // 16 bytes of superblock + 32 bytes of descriptors fit in one metadata block.
        assert_eq!(hdd_gdt[0].block_bitmap, 1);
        assert_eq!(hdd_gdt[0].free_blocks_count, 8192 - 2);
        assert_eq!(hdd_gdt[1].block_bitmap, 8192);
        assert_eq!(hdd_gdt[1].free_blocks_count, 8192 - 1);
    }

    #[test]
    fn hdd_init_with_empty_file_yields_no_groups() {
        let sb = Superblock::zeroed();
        let (disk, _ssd, _hdd) = scratch_disk(4096, 0);
        disk.set_block_size(1024);

        let (hdd_sb, hdd_gdt) = Metadata::init_hdd(&disk, &sb);
        assert_eq!(hdd_sb.group_count, 0);
        assert!(hdd_gdt.is_empty());
    }

    #[test]
    fn hdd_alloc_and_free_round_trip() {
        let mut sb = Superblock::zeroed();
        sb.log_block_size = 0;
        sb.blocks_per_group = 8192;
        sb.inodes_per_group = 128;

        let (disk, _ssd, _hdd) = scratch_disk(4096, 16 * 1024 * 1024);
        disk.set_block_size(1024);

        let (hdd_sb, hdd_gdt) = Metadata::init_hdd(&disk, &sb);
        let mut meta = Metadata {
            sb,
            gdt: vec![],
            hdd_sb,
            hdd_gdt,
            ssd_max_lblock: 0,
        };

        let free_before = meta.hdd_gdt[0].free_blocks_count;
        let pb = meta.alloc_hdd_block(&disk);
        assert!(pb.is_hdd());
        // group 0: blocks 0 (metadata) and 1 (bitmap) are reserved
        assert_eq!(pb.index(), 2);
        assert_eq!(meta.hdd_gdt[0].free_blocks_count, free_before - 1);

        // routing: lblock at or above the threshold goes to the slow tier
        let pb2 = meta.alloc_data_pblock(&disk, 5);
        assert!(pb2.is_hdd());
        assert_eq!(pb2.index(), 3);

        meta.free_pblocks(&disk, &[pb, pb2]);
        assert_eq!(meta.hdd_gdt[0].free_blocks_count, free_before);

        // the same blocks come back on the next allocations
        assert_eq!(meta.alloc_hdd_block(&disk).index(), 2);
    }
}
