//! Fast-tier image formatter.
//!
//! Lays out a minimal single-group ext4-compatible image the mount path can consume:
//! superblock, descriptor table, both bitmaps, the inode table and a root directory.
//! Meant for fresh deployments and test fixtures; images produced by the standard
//! formatter work just as well.

use std::fs::OpenOptions;
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;

use bytemuck::{bytes_of, Zeroable};
use log::info;

use crate::block_grp::GroupDescriptor;
use crate::dir::{self, FileType};
use crate::inode::{Inode, InodeNo};
use crate::sb::{Superblock, EXT4_SIGNATURE, SUPERBLOCK_OFFSET};

/// Geometry of a fresh image.
#[derive(Clone, Copy, Debug)]
pub struct Geometry {
    /// Block size in bytes; a power of two, at least 1024.
    pub block_size: u32,

    /// Total block count.
    pub blocks: u32,

    /// Total inode count.
    pub inodes: u32,

    /// On-disk inode record size.
    pub inode_size: u16,
}

impl Default for Geometry {
    fn default() -> Self {
        Self {
            block_size: 1024,
            blocks: 1024,
            inodes: 128,
            inode_size: 256,
        }
    }
}

/// Number of reserved low inodes; allocation starts past them.
const RESERVED_INODES: u32 = 11;

/// Writes a fresh image at `path`, truncating whatever was there.
pub fn format_ssd(path: &Path, geo: &Geometry) -> io::Result<()> {
    assert!(geo.block_size.is_power_of_two() && geo.block_size >= 1024);
    assert!(u32::from(geo.inode_size) >= 160);
    assert!(geo.inodes > RESERVED_INODES);
    // one group: a single block of bitmap bits must cover every block and inode
    assert!(geo.blocks <= geo.block_size * 8);
    assert!(geo.inodes <= geo.block_size * 8);

    let bs = geo.block_size;
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    file.set_len(u64::from(geo.blocks) * u64::from(bs))?;

    let mut sb = Superblock::zeroed();
    sb.magic = EXT4_SIGNATURE;
    sb.log_block_size = bs.trailing_zeros() - 10;
    sb.blocks_count_lo = geo.blocks;
    sb.blocks_per_group = bs * 8;
    sb.inodes_count = geo.inodes;
    sb.inodes_per_group = geo.inodes;
    sb.inode_size = geo.inode_size;
    sb.first_ino = RESERVED_INODES;
    sb.rev_level = 1;

    // layout, in blocks: [boot+superblock][gdt][block bitmap][inode bitmap][inode
    // table...][root dir][data...]
    let gdt_block = (sb.gdt_offset() / u64::from(bs)) as u32;
    let block_bitmap = gdt_block + 1;
    let inode_bitmap = gdt_block + 2;
    let inode_table = gdt_block + 3;
    let itable_blocks =
        sb.bytes_to_blocks(u64::from(geo.inodes) * u64::from(geo.inode_size));
    let root_block = inode_table + itable_blocks;
    let used_blocks = root_block + 1;
    assert!(used_blocks < geo.blocks, "image too small for its own metadata");

    sb.free_blocks_count_lo = geo.blocks - used_blocks;
    sb.free_inodes_count = geo.inodes - RESERVED_INODES;

    let mut desc = GroupDescriptor::zeroed();
    desc.block_bitmap_lo = block_bitmap;
    desc.inode_bitmap_lo = inode_bitmap;
    desc.inode_table_lo = inode_table;
    desc.free_blocks_count_lo = (geo.blocks - used_blocks) as u16;
    desc.free_inodes_count_lo = (geo.inodes - RESERVED_INODES) as u16;

    // block bitmap: everything up to and including the root block is in use
    let mut bitmap = vec![0u8; bs as usize];
    for block in 0..used_blocks {
        bitmap[block as usize / 8] |= 1 << (block % 8);
    }
    file.write_all_at(&bitmap, u64::from(block_bitmap) * u64::from(bs))?;

    // inode bitmap: the reserved inodes 1..=11, root among them
    bitmap.fill(0);
    for bit in 0..RESERVED_INODES {
        bitmap[bit as usize / 8] |= 1 << (bit % 8);
    }
    file.write_all_at(&bitmap, u64::from(inode_bitmap) * u64::from(bs))?;

    // root directory: one block holding "." and ".."
    let mut root = Inode::zeroed();
    root.i_mode = libc::S_IFDIR as u16 | 0o755;
    root.i_links_count = 2;
    root.set_size(u64::from(bs));
    root.set_block_count(1, bs);
    root.i_block[0] = crate::PBlock::ssd(root_block);

    let mut root_data = vec![0u8; bs as usize];
    let dot_len = dir::min_rec_len(1);
    dir::encode(&mut root_data, 0, InodeNo::ROOT, dot_len, FileType::DIRECTORY, b".");
    dir::encode(
        &mut root_data,
        dot_len as usize,
        InodeNo::ROOT,
        bs as u16 - dot_len,
        FileType::DIRECTORY,
        b"..",
    );
    file.write_all_at(&root_data, u64::from(root_block) * u64::from(bs))?;

    let root_slot = u64::from(inode_table) * u64::from(bs)
        + u64::from(InodeNo::ROOT.raw() - 1) * u64::from(geo.inode_size);
    file.write_all_at(bytes_of(&root), root_slot)?;

    // descriptors go out in the 32-byte form the zeroed desc_size field announces
    file.write_all_at(
        &bytes_of(&desc)[..crate::sb::GROUP_DESC_MIN_SIZE as usize],
        sb.gdt_offset(),
    )?;
    file.write_all_at(bytes_of(&sb), SUPERBLOCK_OFFSET)?;
    file.sync_all()?;

    info!(
        "formatted {}: {} blocks of {}, {} inodes",
        path.display(),
        geo.blocks,
        bs,
        geo.inodes
    );
    Ok(())
}
