//! Two-device block I/O.
//!
//! The filesystem spreads its contents across two backing files: a fast tier (SSD) holding
//! all metadata plus hot data blocks, and a slow tier (HDD) holding cold overflow data
//! blocks. Every physical block id ([`PBlock`]) carries its tier in the top bit, and this
//! module demultiplexes each access onto the right file.
//!
//! Positioned reads and writes acquire the tier's lock in shared mode for the duration of
//! the syscall, and always loop until the full byte count is transferred.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};

use bytemuck::{Pod, Zeroable};
use parking_lot::RwLock;

use crate::err::fatal;

/// Backing tier selector encoded in the top bit of a [`PBlock`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Tier {
    Ssd,
    Hdd,
}

/// A 32-bit physical block id.
///
/// Bit 31 selects the tier (clear = SSD, set = HDD); the low 31 bits index blocks within
/// that tier. The encoding is a wire contract: inode `i_block` slots and index-block
/// entries store it verbatim, so it must survive round-trips through disk unchanged.
///
/// The all-zero value doubles as the hole marker in block maps (SSD block 0 holds the boot
/// sector and is never addressable as file data).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Pod, Zeroable)]
#[repr(transparent)]
pub struct PBlock(u32);

impl PBlock {
    const HDD_FLAG: u32 = 1 << 31;

    /// Hole marker in block maps.
    pub const NULL: Self = Self(0);

    /// A fast-tier block id.
    pub fn ssd(index: u32) -> Self {
        assert!(index & Self::HDD_FLAG == 0, "ssd block index {index:#x} overflows 31 bits");
        Self(index)
    }

    /// A slow-tier block id.
    pub fn hdd(index: u32) -> Self {
        assert!(index & Self::HDD_FLAG == 0, "hdd block index {index:#x} overflows 31 bits");
        Self(index | Self::HDD_FLAG)
    }

    /// Reinterprets a raw 32-bit value from disk (an `i_block` slot or index-block entry).
    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    /// Block index within the tier, with the tier flag cleared.
    pub fn index(self) -> u32 {
        self.0 & !Self::HDD_FLAG
    }

    pub fn tier(self) -> Tier {
        if self.0 & Self::HDD_FLAG == 0 {
            Tier::Ssd
        } else {
            Tier::Hdd
        }
    }

    pub fn is_hdd(self) -> bool {
        self.tier() == Tier::Hdd
    }

    /// Whether this slot marks a hole.
    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl core::fmt::Display for PBlock {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.tier() {
            Tier::Ssd => f.write_fmt(format_args!("ssd:{}", self.index())),
            Tier::Hdd => f.write_fmt(format_args!("hdd:{}", self.index())),
        }
    }
}

/// The two backing files and their tier locks.
///
/// `block_size` is configured once, after the superblock has been parsed; byte-addressed
/// metadata access works before that point.
pub(crate) struct DiskManager {
    ssd: RwLock<File>,
    hdd: RwLock<File>,
    block_size: AtomicU32,
}

impl DiskManager {
    /// Opens both backing files read/write. Failure to open either is fatal.
    pub(crate) fn open(ssd_path: &Path, hdd_path: &Path) -> Self {
        let ssd = match OpenOptions::new().read(true).write(true).open(ssd_path) {
            Ok(f) => f,
            Err(e) => fatal!("open {} failed: {e}", ssd_path.display()),
        };
        let hdd = match OpenOptions::new().read(true).write(true).open(hdd_path) {
            Ok(f) => f,
            Err(e) => fatal!("open {} failed: {e}", hdd_path.display()),
        };

        Self {
            ssd: RwLock::new(ssd),
            hdd: RwLock::new(hdd),
            block_size: AtomicU32::new(0),
        }
    }

    pub(crate) fn set_block_size(&self, block_size: u32) {
        // upper bound keeps a whole-block directory record representable in a u16 rec_len
        assert!(block_size.is_power_of_two() && (1024..=32768).contains(&block_size));
        self.block_size.store(block_size, Ordering::Release);
    }

    pub(crate) fn block_size(&self) -> u32 {
        let bs = self.block_size.load(Ordering::Acquire);
        assert!(bs != 0, "block size queried before superblock parse");
        bs
    }

    /// Byte length of the slow-tier backing file, discovered via stat.
    pub(crate) fn hdd_len(&self) -> u64 {
        let hdd = self.hdd.read();
        match hdd.metadata() {
            Ok(md) => md.len(),
            Err(e) => fatal!("stat of hdd backing file failed: {e}"),
        }
    }

    /// Byte-addressed read from the fast tier; serves the superblock, descriptor table,
    /// inode table and bitmap loads.
    pub(crate) fn metadata_read(&self, buf: &mut [u8], offset: u64) {
        let ssd = self.ssd.read();
        full_read_at(&ssd, buf, offset);
    }

    /// Byte-addressed write to the fast tier.
    pub(crate) fn metadata_write(&self, buf: &[u8], offset: u64) {
        let ssd = self.ssd.read();
        full_write_at(&ssd, buf, offset);
    }

    /// Byte-addressed read from the slow tier's metadata region (superblock + descriptors).
    pub(crate) fn hdd_metadata_read(&self, buf: &mut [u8], offset: u64) {
        let hdd = self.hdd.read();
        full_read_at(&hdd, buf, offset);
    }

    /// Byte-addressed write to the slow tier's metadata region.
    pub(crate) fn hdd_metadata_write(&self, buf: &[u8], offset: u64) {
        let hdd = self.hdd.read();
        full_write_at(&hdd, buf, offset);
    }

    /// Tier-demultiplexed read of `buf.len()` bytes starting `offset` bytes into `pblock`.
    pub(crate) fn read(&self, buf: &mut [u8], pblock: PBlock, offset: u32) {
        let byte_off = self.pblock_byte_offset(pblock, offset, buf.len());
        match pblock.tier() {
            Tier::Ssd => {
                let ssd = self.ssd.read();
                full_read_at(&ssd, buf, byte_off);
            }
            Tier::Hdd => {
                let hdd = self.hdd.read();
                full_read_at(&hdd, buf, byte_off);
            }
        }
    }

    /// Tier-demultiplexed write of `buf.len()` bytes starting `offset` bytes into `pblock`.
    pub(crate) fn write(&self, buf: &[u8], pblock: PBlock, offset: u32) {
        let byte_off = self.pblock_byte_offset(pblock, offset, buf.len());
        match pblock.tier() {
            Tier::Ssd => {
                let ssd = self.ssd.read();
                full_write_at(&ssd, buf, byte_off);
            }
            Tier::Hdd => {
                let hdd = self.hdd.read();
                full_write_at(&hdd, buf, byte_off);
            }
        }
    }

    /// Reads one whole block.
    pub(crate) fn block_read(&self, buf: &mut [u8], pblock: PBlock) {
        assert!(buf.len() == self.block_size() as usize);
        self.read(buf, pblock, 0);
    }

    /// Writes one whole block.
    pub(crate) fn block_write(&self, buf: &[u8], pblock: PBlock) {
        assert!(buf.len() == self.block_size() as usize);
        self.write(buf, pblock, 0);
    }

    fn pblock_byte_offset(&self, pblock: PBlock, offset: u32, len: usize) -> u64 {
        let bs = self.block_size();
        assert!(
            offset as usize + len <= bs as usize,
            "access of {len} bytes at intra-block offset {offset} crosses block {pblock}"
        );
        u64::from(pblock.index()) * u64::from(bs) + u64::from(offset)
    }
}

/// Loops a positioned read until `buf` is filled. Short files and I/O errors are fatal.
fn full_read_at(file: &File, mut buf: &mut [u8], mut offset: u64) {
    while !buf.is_empty() {
        match file.read_at(buf, offset) {
            Ok(0) => fatal!("backing file ends short at byte {offset}"),
            Ok(n) => {
                buf = &mut buf[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => fatal!("read at byte {offset} failed: {e}"),
        }
    }
}

/// Loops a positioned write until `buf` is drained. I/O errors are fatal.
fn full_write_at(file: &File, mut buf: &[u8], mut offset: u64) {
    while !buf.is_empty() {
        match file.write_at(buf, offset) {
            Ok(0) => fatal!("backing file refused data at byte {offset}"),
            Ok(n) => {
                buf = &buf[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => fatal!("write at byte {offset} failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pblock_tier_encoding() {
        let s = PBlock::ssd(42);
        let h = PBlock::hdd(42);

        assert_eq!(s.tier(), Tier::Ssd);
        assert_eq!(h.tier(), Tier::Hdd);
        assert_eq!(s.index(), 42);
        assert_eq!(h.index(), 42);
        assert_ne!(s.raw(), h.raw());
        assert_eq!(h.raw(), 42 | 1 << 31);
    }

    #[test]
    fn pblock_raw_round_trip() {
        for raw in [0, 1, 7, 1 << 31, (1 << 31) | 12345, u32::MAX] {
            assert_eq!(PBlock::from_raw(raw).raw(), raw);
        }
    }

    #[test]
    fn null_is_ssd_zero() {
        assert!(PBlock::NULL.is_null());
        assert!(!PBlock::NULL.is_hdd());
        assert!(!PBlock::hdd(0).is_null());
    }

    #[test]
    fn tier_demux_hits_the_right_file() {
        use std::io::Write;

        let mut ssd = tempfile::NamedTempFile::new().unwrap();
        let mut hdd = tempfile::NamedTempFile::new().unwrap();
        ssd.write_all(&[0xAA; 4096]).unwrap();
        hdd.write_all(&[0xBB; 4096]).unwrap();

        let disk = DiskManager::open(ssd.path(), hdd.path());
        disk.set_block_size(1024);

        let mut buf = [0u8; 16];
        disk.read(&mut buf, PBlock::ssd(1), 0);
        assert_eq!(buf, [0xAA; 16]);
        disk.read(&mut buf, PBlock::hdd(1), 0);
        assert_eq!(buf, [0xBB; 16]);

        disk.write(&[0xCC; 16], PBlock::hdd(2), 8);
        disk.read(&mut buf, PBlock::hdd(2), 8);
        assert_eq!(buf, [0xCC; 16]);
        disk.read(&mut buf, PBlock::ssd(2), 8);
        assert_eq!(buf, [0xAA; 16]);
    }
}
