//! Superblock structures for both tiers.
//!
//! The fast tier is an ext4-compatible image: its superblock lives at byte 1024 and is laid
//! out exactly as the standard formatter writes it. Only a subset of the fields is consumed
//! (geometry and sizes); the rest ride along as reserved words so the struct can be
//! overlaid on the raw bytes and written back unchanged.
//!
//! The slow tier uses a private, much smaller layout: a 16-byte superblock at byte 0
//! followed by an array of 16-byte group descriptors.

use bytemuck::{pod_read_unaligned, Pod, Zeroable};
use log::info;

use crate::disk::DiskManager;
use crate::err::{FsError, FsResult};

/// Absolute byte offset of the ext4 superblock on the fast tier.
pub(crate) const SUPERBLOCK_OFFSET: u64 = 1024;

/// `s_magic` value of a valid ext4 superblock.
pub(crate) const EXT4_SIGNATURE: u16 = 0xEF53;

/// Group descriptor size used when the superblock's `desc_size` field is zero.
pub(crate) const GROUP_DESC_MIN_SIZE: u32 = 0x20;

/// Rounds `n` up to the next multiple of `align` (a power of two).
pub(crate) fn align_to(n: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    (n + align - 1) & !(align - 1)
}

/// The ext4 superblock, as found at byte 1024 of the fast-tier image.
///
/// Field names follow the on-disk layout with the `s_` prefix dropped; fields past
/// `default_mount_opts` are never interpreted and are carried as reserved words.
#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C)]
#[allow(dead_code)]
pub(crate) struct Superblock {
    /// Total inode count.
    pub(crate) inodes_count: u32,

    /// Low 32-bits of the total block count.
    pub(crate) blocks_count_lo: u32,

    /// Low 32-bits of the reserved block count.
    pub(crate) r_blocks_count_lo: u32,

    /// Low 32-bits of the free block count.
    pub(crate) free_blocks_count_lo: u32,

    /// Free inode count.
    pub(crate) free_inodes_count: u32,

    /// First data block (1 for 1 KiB blocks, 0 otherwise).
    pub(crate) first_data_block: u32,

    /// Block size is `2 ^ (10 + log_block_size)`.
    pub(crate) log_block_size: u32,

    /// Cluster size exponent (bigalloc); unused here.
    pub(crate) log_cluster_size: u32,

    /// Blocks per block group.
    pub(crate) blocks_per_group: u32,

    /// Clusters per block group (bigalloc); unused here.
    pub(crate) clusters_per_group: u32,

    /// Inodes per block group.
    pub(crate) inodes_per_group: u32,

    /// Last mount time.
    pub(crate) mtime: u32,

    /// Last write time.
    pub(crate) wtime: u32,

    /// Mount count since the last check.
    pub(crate) mnt_count: u16,

    /// Mount count limit before a check is required.
    pub(crate) max_mnt_count: u16,

    /// Magic signature, [`EXT4_SIGNATURE`].
    pub(crate) magic: u16,

    /// Filesystem state flags.
    pub(crate) state: u16,

    /// Behavior on error detection.
    pub(crate) errors: u16,

    /// Minor revision level.
    pub(crate) minor_rev_level: u16,

    /// Time of the last check.
    pub(crate) lastcheck: u32,

    /// Maximum interval between checks.
    pub(crate) checkinterval: u32,

    /// Creator OS.
    pub(crate) creator_os: u32,

    /// Revision level.
    pub(crate) rev_level: u32,

    /// Default uid for reserved blocks.
    pub(crate) def_resuid: u16,

    /// Default gid for reserved blocks.
    pub(crate) def_resgid: u16,

    /// First non-reserved inode.
    pub(crate) first_ino: u32,

    /// On-disk inode record size in bytes.
    pub(crate) inode_size: u16,

    /// Block group number of this superblock copy.
    pub(crate) block_group_nr: u16,

    /// Compatible feature set.
    pub(crate) feature_compat: u32,

    /// Incompatible feature set.
    pub(crate) feature_incompat: u32,

    /// Read-only compatible feature set.
    pub(crate) feature_ro_compat: u32,

    /// Filesystem UUID.
    pub(crate) uuid: [u8; 16],

    /// Volume label.
    pub(crate) volume_name: [u8; 16],

    /// Directory of the last mount point.
    pub(crate) last_mounted: [u8; 64],

    /// Compression algorithm usage bitmap.
    pub(crate) algorithm_usage_bitmap: u32,

    /// Blocks preallocated for files.
    pub(crate) prealloc_blocks: u8,

    /// Blocks preallocated for directories.
    pub(crate) prealloc_dir_blocks: u8,

    /// Reserved GDT entries for growth.
    pub(crate) reserved_gdt_blocks: u16,

    /// Journal UUID.
    pub(crate) journal_uuid: [u8; 16],

    /// Journal inode number.
    pub(crate) journal_inum: u32,

    /// Journal device number.
    pub(crate) journal_dev: u32,

    /// Head of the orphaned inode list.
    pub(crate) last_orphan: u32,

    /// HTREE hash seed.
    pub(crate) hash_seed: [u32; 4],

    /// Default hash algorithm for directories.
    pub(crate) def_hash_version: u8,

    /// Journal backup type.
    pub(crate) jnl_backup_type: u8,

    /// Group descriptor size; 0 means the 32-byte minimum applies.
    pub(crate) desc_size: u16,

    /// Default mount options.
    pub(crate) default_mount_opts: u32,

    reserved: [u32; 191],
}

impl Superblock {
    /// Reads and validates the superblock from the fast tier.
    pub(crate) fn load(disk: &DiskManager) -> FsResult<Self> {
        let mut raw = [0u8; core::mem::size_of::<Superblock>()];
        disk.metadata_read(&mut raw, SUPERBLOCK_OFFSET);

        let sb: Superblock = pod_read_unaligned(&raw);
        if sb.magic != EXT4_SIGNATURE {
            return Err(FsError::BadSuperblock);
        }

        info!(
            "block_size = {}    groups = {}    inode_size = {}    inodes_per_group = {}",
            sb.block_size(),
            sb.group_count(),
            sb.inode_size,
            sb.inodes_per_group
        );

        Ok(sb)
    }

    /// Block size in bytes, `2 ^ (10 + log_block_size)`.
    pub(crate) fn block_size(&self) -> u32 {
        1u32 << (10 + self.log_block_size)
    }

    /// Number of block groups on the fast tier, at least 1.
    pub(crate) fn group_count(&self) -> u32 {
        let n = (self.blocks_count_lo + self.blocks_per_group - 1) / self.blocks_per_group;
        n.max(1)
    }

    /// Effective group descriptor size in bytes.
    pub(crate) fn group_desc_size(&self) -> u32 {
        if self.desc_size == 0 {
            GROUP_DESC_MIN_SIZE
        } else {
            u32::from(self.desc_size)
        }
    }

    /// Byte offset of the group descriptor table: the superblock is followed by the
    /// descriptors, padded to the next block boundary.
    pub(crate) fn gdt_offset(&self) -> u64 {
        align_to(
            SUPERBLOCK_OFFSET + core::mem::size_of::<Superblock>() as u64,
            u64::from(self.block_size()),
        )
    }

    /// Rounds a byte count up to whole blocks.
    pub(crate) fn bytes_to_blocks(&self, bytes: u64) -> u32 {
        let bs = u64::from(self.block_size());
        ((bytes + bs - 1) / bs) as u32
    }
}

/// The slow-tier superblock, at byte 0 of the HDD file.
///
/// A `group_count` of zero marks a blank file that must be initialized on first mount.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub(crate) struct HddSuperblock {
    /// Byte length of the backing file, persisted at initialization.
    pub(crate) file_size: u64,

    /// Number of block groups.
    pub(crate) group_count: u64,
}

/// One slow-tier group descriptor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub(crate) struct HddGroupDesc {
    /// Free block count for the group.
    pub(crate) free_blocks_count: u64,

    /// Absolute block index (within the slow tier) of the group's block bitmap.
    pub(crate) block_bitmap: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn superblock_layout_matches_ext4() {
        assert_eq!(core::mem::size_of::<Superblock>(), 1024);
        assert_eq!(core::mem::offset_of!(Superblock, magic), 0x38);
        assert_eq!(core::mem::offset_of!(Superblock, inode_size), 0x58);
        assert_eq!(core::mem::offset_of!(Superblock, desc_size), 0xFE);
    }

    #[test]
    fn hdd_layout_is_two_u64_pairs() {
        assert_eq!(core::mem::size_of::<HddSuperblock>(), 16);
        assert_eq!(core::mem::size_of::<HddGroupDesc>(), 16);
    }

    #[test]
    fn geometry_derivations() {
        let mut sb = Superblock::zeroed();
        sb.log_block_size = 0;
        sb.blocks_count_lo = 1024;
        sb.blocks_per_group = 8192;

        assert_eq!(sb.block_size(), 1024);
        assert_eq!(sb.group_count(), 1);
        assert_eq!(sb.group_desc_size(), GROUP_DESC_MIN_SIZE);
        // 1024-byte superblock at byte 1024, padded to the next 1 KiB boundary.
        assert_eq!(sb.gdt_offset(), 2048);

        sb.log_block_size = 2;
        assert_eq!(sb.block_size(), 4096);
        assert_eq!(sb.gdt_offset(), 4096);

        sb.desc_size = 64;
        assert_eq!(sb.group_desc_size(), 64);
    }

    #[test]
    fn align_to_rounds_up() {
        assert_eq!(align_to(0, 1024), 0);
        assert_eq!(align_to(1, 1024), 1024);
        assert_eq!(align_to(1024, 1024), 1024);
        assert_eq!(align_to(2049, 1024), 3072);
    }
}
