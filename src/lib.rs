//! A two-tier userspace filesystem engine.
//!
//! `hybridfs` exposes a POSIX directory hierarchy stored in an ext4-compatible layout
//! spread over two backing files: a fast tier (SSD) holding all metadata and the leading
//! blocks of each file, and a slow tier (HDD) holding cold overflow data. Placement is a
//! single threshold over the logical block number; there is no migration, no journal and
//! no block cache.
//!
//! The host binding (FUSE or similar) owns argument parsing, the syscall surface and the
//! process entry point; it drives this crate through a [`HybridFs`] handle.
//!
//! ```no_run
//! use hybridfs::{HybridFs, MountOptions};
//!
//! let fs = HybridFs::mount(&MountOptions::new("ssd.img", "hdd.img")).unwrap();
//! fs.mkdir("/logs", 0o755).unwrap();
//! let attr = fs.getattr("/logs").unwrap();
//! assert_eq!(attr.nlink, 2);
//! ```

use std::path::PathBuf;

use log::info;
use parking_lot::RwLock;

mod bitmap;
mod block_grp;
mod dcache;
mod dir;
mod disk;
pub mod err;
mod inode;
pub mod mkfs;
mod ops;
mod sb;

pub use dir::{FileType, MAX_NAME_LEN};
pub use disk::{PBlock, Tier};
pub use err::{FsError, FsResult};
pub use inode::InodeNo;
pub use ops::{FileAttr, FsStat};

use block_grp::Metadata;
use dcache::DCache;
use disk::DiskManager;
use sb::Superblock;

/// Default logical-block threshold below which file data lands on the fast tier.
pub const DEFAULT_SSD_MAX_LBLOCK: u32 = 12;

/// Mount-time configuration.
#[derive(Clone, Debug)]
pub struct MountOptions {
    /// Path of the fast-tier (SSD) image; must carry an ext4 superblock at byte 1024.
    pub ssd_path: PathBuf,

    /// Path of the slow-tier (HDD) file; a blank file is laid out on first mount.
    pub hdd_path: PathBuf,

    /// Logical blocks below this threshold allocate on the fast tier, the rest on the
    /// slow tier.
    pub ssd_max_lblock: u32,
}

impl MountOptions {
    pub fn new(ssd_path: impl Into<PathBuf>, hdd_path: impl Into<PathBuf>) -> Self {
        Self {
            ssd_path: ssd_path.into(),
            hdd_path: hdd_path.into(),
            ssd_max_lblock: DEFAULT_SSD_MAX_LBLOCK,
        }
    }
}

/// An open filesystem.
///
/// All operations go through this handle; it is `Sync` and meant to be shared across the
/// binding's worker threads.
pub struct HybridFs {
    pub(crate) disk: DiskManager,
    pub(crate) meta: RwLock<Metadata>,
    pub(crate) dcache: DCache,
}

impl HybridFs {
    /// Opens both backing files, parses the fast-tier superblock and descriptor table,
    /// initializes the slow tier's metadata if the file is blank, and seeds the path
    /// cache with the root directory.
    pub fn mount(opts: &MountOptions) -> FsResult<Self> {
        let disk = DiskManager::open(&opts.ssd_path, &opts.hdd_path);

        let sb = Superblock::load(&disk)?;
        disk.set_block_size(sb.block_size());

        let meta = Metadata::load(&disk, sb, opts.ssd_max_lblock);

        let dcache = DCache::new();
        dcache.init_root(InodeNo::ROOT)?;

        info!(
            "mounted: ssd = {}, hdd = {}, ssd_max_lblock = {}",
            opts.ssd_path.display(),
            opts.hdd_path.display(),
            opts.ssd_max_lblock
        );

        Ok(Self {
            disk,
            meta: RwLock::new(meta),
            dcache,
        })
    }
}
