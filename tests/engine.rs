//! End-to-end tests over scratch images: format, mount, operate.

use std::fs::OpenOptions;

use hybridfs::{mkfs, FsError, HybridFs, MountOptions};

struct Fixture {
    fs: HybridFs,
    ssd: std::path::PathBuf,
    hdd: std::path::PathBuf,
    _dir: tempfile::TempDir,
}

fn mount_fixture(geo: mkfs::Geometry, hdd_len: u64, ssd_max_lblock: u32) -> Fixture {
    let _ = env_logger::builder().is_test(true).try_init();

    let dir = tempfile::tempdir().unwrap();
    let ssd = dir.path().join("ssd.img");
    let hdd = dir.path().join("hdd.img");

    mkfs::format_ssd(&ssd, &geo).unwrap();
    let hdd_file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&hdd)
        .unwrap();
    hdd_file.set_len(hdd_len).unwrap();

    let mut opts = MountOptions::new(&ssd, &hdd);
    opts.ssd_max_lblock = ssd_max_lblock;
    let fs = HybridFs::mount(&opts).unwrap();

    Fixture {
        fs,
        ssd,
        hdd,
        _dir: dir,
    }
}

fn small() -> Fixture {
    // 1 MiB fast tier, 16 MiB slow tier (two groups of 1 KiB blocks)
    mount_fixture(mkfs::Geometry::default(), 16 * 1024 * 1024, 12)
}

fn listing(fs: &HybridFs, path: &str) -> Vec<String> {
    let mut names = Vec::new();
    fs.readdir(path, |name, _ino, _ft| {
        names.push(String::from_utf8_lossy(name).into_owned());
        false
    })
    .unwrap();
    names.sort();
    names
}

#[test]
fn fresh_root_lists_only_dot_entries() {
    // 1 MiB fast tier, blank zero-length slow tier
    let fx = mount_fixture(mkfs::Geometry::default(), 0, 12);
    assert_eq!(listing(&fx.fs, "/"), vec![".".to_string(), "..".to_string()]);
}

#[test]
fn write_then_read_back() {
    let fx = small();
    fx.fs.mknod("/a", 0o100644).unwrap();

    let ino = fx.fs.open("/a").unwrap();
    assert_eq!(fx.fs.write(ino, b"hello", 0).unwrap(), 5);

    let mut buf = [0u8; 5];
    assert_eq!(fx.fs.read(ino, &mut buf, 0).unwrap(), 5);
    assert_eq!(&buf, b"hello");

    let attr = fx.fs.getattr("/a").unwrap();
    assert_eq!(attr.size, 5);
    assert_eq!(attr.nlink, 1);
    assert_eq!(attr.mode, 0o100644);
}

#[test]
fn reads_past_eof_shrink_silently() {
    let fx = small();
    fx.fs.mknod("/short", 0o100644).unwrap();
    let ino = fx.fs.open("/short").unwrap();
    fx.fs.write(ino, b"abc", 0).unwrap();

    let mut buf = [0xFFu8; 16];
    assert_eq!(fx.fs.read(ino, &mut buf, 0).unwrap(), 3);
    assert_eq!(&buf[..3], b"abc");
    assert_eq!(fx.fs.read(ino, &mut buf, 3).unwrap(), 0);
    assert_eq!(fx.fs.read(ino, &mut buf, 1000).unwrap(), 0);
}

#[test]
fn unaligned_write_crosses_block_boundary() {
    let fx = small();
    fx.fs.mknod("/u", 0o100644).unwrap();
    let ino = fx.fs.open("/u").unwrap();

    let pattern: Vec<u8> = (0..2000u32).map(|i| (i * 7) as u8).collect();
    fx.fs.write(ino, &pattern, 100).unwrap();
    assert_eq!(fx.fs.getattr("/u").unwrap().size, 2100);

    let mut buf = vec![0u8; 2000];
    assert_eq!(fx.fs.read(ino, &mut buf, 100).unwrap(), 2000);
    assert_eq!(buf, pattern);

    // the head of the file was never written and reads back as zeros
    let mut head = [0xFFu8; 100];
    assert_eq!(fx.fs.read(ino, &mut head, 0).unwrap(), 100);
    assert_eq!(head, [0u8; 100]);
}

#[test]
fn tier_threshold_routes_cold_blocks_to_hdd() {
    // threshold 4: logical blocks 0..=3 on the fast tier, 4 and up on the slow one
    let fx = mount_fixture(mkfs::Geometry::default(), 16 * 1024 * 1024, 4);
    fx.fs.mknod("/b", 0o100644).unwrap();
    let ino = fx.fs.open("/b").unwrap();

    let before = fx.fs.statfs();
    let pattern: Vec<u8> = (0..1024u32 * 5).map(|i| (i % 251) as u8).collect();
    fx.fs.write(ino, &pattern, 0).unwrap();
    let after = fx.fs.statfs();

    assert_eq!(before.free_ssd_blocks - after.free_ssd_blocks, 4);
    assert_eq!(before.free_hdd_blocks - after.free_hdd_blocks, 1);

    let mut buf = vec![0u8; 1024 * 5];
    assert_eq!(fx.fs.read(ino, &mut buf, 0).unwrap(), 1024 * 5);
    assert_eq!(buf, pattern);
}

#[test]
fn directory_grows_and_shrinks_through_200_files() {
    let geo = mkfs::Geometry {
        block_size: 1024,
        blocks: 2048,
        inodes: 512,
        inode_size: 256,
    };
    let fx = mount_fixture(geo, 0, 12);

    fx.fs.mkdir("/d", 0o755).unwrap();
    let stat_empty = fx.fs.statfs();

    let names: Vec<String> = (0..200).map(|i| format!("file{i:03}")).collect();
    for name in &names {
        fx.fs.mknod(&format!("/d/{name}"), 0o100644).unwrap();
    }

    let mut expected: Vec<String> = names.clone();
    expected.push(".".into());
    expected.push("..".into());
    expected.sort();
    assert_eq!(listing(&fx.fs, "/d"), expected);

    for name in &names {
        fx.fs.unlink(&format!("/d/{name}")).unwrap();
    }
    assert_eq!(listing(&fx.fs, "/d"), vec![".".to_string(), "..".to_string()]);

    // every inode freed on the way out
    assert_eq!(fx.fs.statfs().free_inodes, stat_empty.free_inodes);
}

#[test]
fn sparse_write_leaves_a_hole() {
    let fx = small();
    fx.fs.mknod("/sparse", 0o100644).unwrap();
    let ino = fx.fs.open("/sparse").unwrap();

    let before = fx.fs.statfs();
    let offset = 4096u64 * 1000;
    fx.fs.write(ino, b"tail bytes", offset).unwrap();
    let after = fx.fs.statfs();

    // the hole reads back as zeros without consuming blocks
    let mut buf = vec![0xFFu8; 4096];
    assert_eq!(fx.fs.read(ino, &mut buf, 0).unwrap(), 4096);
    assert!(buf.iter().all(|&b| b == 0));

    assert_eq!(fx.fs.getattr("/sparse").unwrap().size, offset + 10);

    // one cold data block, plus the two fast-tier index blocks that map it
    assert_eq!(before.free_hdd_blocks - after.free_hdd_blocks, 1);
    assert_eq!(before.free_ssd_blocks - after.free_ssd_blocks, 2);
}

#[test]
fn recursive_rmdir_returns_every_block_and_inode() {
    let fx = small();
    let before = fx.fs.statfs();

    fx.fs.mkdir("/x", 0o755).unwrap();
    fx.fs.mkdir("/x/y", 0o755).unwrap();
    fx.fs.mknod("/x/y/z", 0o100644).unwrap();
    let z = fx.fs.open("/x/y/z").unwrap();
    fx.fs.write(z, &[7u8; 3000], 0).unwrap();

    fx.fs.rmdir("/x").unwrap();

    assert_eq!(fx.fs.resolve("/x"), Err(FsError::NotFound));
    assert_eq!(fx.fs.resolve("/x/y/z"), Err(FsError::NotFound));

    let after = fx.fs.statfs();
    assert_eq!(after.free_ssd_blocks, before.free_ssd_blocks);
    assert_eq!(after.free_hdd_blocks, before.free_hdd_blocks);
    assert_eq!(after.free_inodes, before.free_inodes);
}

#[test]
fn resolution_is_stable_across_cache_states() {
    let fx = small();
    fx.fs.mkdir("/p", 0o755).unwrap();
    fx.fs.mknod("/p/q", 0o100644).unwrap();

    // warm walk twice through the same handle
    let first = fx.fs.resolve("/p/q").unwrap();
    let second = fx.fs.resolve("/p/q").unwrap();
    assert_eq!(first, second);

    // a second mount starts with a cold cache and must agree
    let opts = MountOptions::new(&fx.ssd, &fx.hdd);
    let cold = HybridFs::mount(&opts).unwrap();
    assert_eq!(cold.resolve("/p/q").unwrap(), first);

    // dot components collapse onto the same inode
    assert_eq!(fx.fs.resolve("/p/./q").unwrap(), first);
    assert_eq!(fx.fs.resolve("//p//q").unwrap(), first);
    assert_eq!(fx.fs.resolve("/p/../p/q").unwrap(), first);
}

#[test]
fn lookup_through_file_prefix_fails() {
    let fx = small();
    fx.fs.mknod("/plain", 0o100644).unwrap();

    assert_eq!(fx.fs.resolve("/plain/inside"), Err(FsError::NotFound));
    assert_eq!(
        fx.fs.readdir("/plain", |_, _, _| false),
        Err(FsError::NotADirectory)
    );
}

#[test]
fn name_length_is_bounded() {
    let fx = small();
    let long = format!("/{}", "n".repeat(256));
    assert_eq!(fx.fs.mkdir(&long, 0o755), Err(FsError::NameTooLong));
    assert_eq!(fx.fs.mknod(&long, 0o100644), Err(FsError::NameTooLong));

    let just_fits = format!("/{}", "n".repeat(255));
    fx.fs.mknod(&just_fits, 0o100644).unwrap();
    assert!(fx.fs.resolve(&just_fits).is_ok());
}

#[test]
fn removed_names_are_reusable() {
    let fx = small();
    fx.fs.mkdir("/d", 0o755).unwrap();
    fx.fs.mknod("/d/a", 0o100644).unwrap();
    fx.fs.mknod("/d/b", 0o100644).unwrap();

    fx.fs.unlink("/d/a").unwrap();
    assert_eq!(fx.fs.resolve("/d/a"), Err(FsError::NotFound));

    fx.fs.mknod("/d/c", 0o100644).unwrap();
    assert_eq!(
        listing(&fx.fs, "/d"),
        vec![
            ".".to_string(),
            "..".to_string(),
            "b".to_string(),
            "c".to_string()
        ]
    );

    // recreating the same name maps to the fresh file
    fx.fs.mknod("/d/a", 0o100644).unwrap();
    let a = fx.fs.open("/d/a").unwrap();
    fx.fs.write(a, b"new", 0).unwrap();
    assert_eq!(fx.fs.getattr("/d/a").unwrap().size, 3);
}

#[test]
fn readdir_stops_when_filler_saturates() {
    let fx = small();
    fx.fs.mknod("/one", 0o100644).unwrap();
    fx.fs.mknod("/two", 0o100644).unwrap();

    let mut seen = 0;
    fx.fs
        .readdir("/", |_, _, _| {
            seen += 1;
            true
        })
        .unwrap();
    assert_eq!(seen, 1);
}

#[test]
fn mkdir_updates_link_counts() {
    let fx = small();
    let root_links = fx.fs.getattr("/").unwrap().nlink;

    fx.fs.mkdir("/sub", 0o755).unwrap();
    assert_eq!(fx.fs.getattr("/sub").unwrap().nlink, 2);
    assert_eq!(fx.fs.getattr("/").unwrap().nlink, root_links + 1);

    fx.fs.rmdir("/sub").unwrap();
    assert_eq!(fx.fs.getattr("/").unwrap().nlink, root_links);
}

#[test]
fn hdd_layout_survives_remount() {
    let fx = small();
    fx.fs.mknod("/cold", 0o100644).unwrap();
    let ino = fx.fs.open("/cold").unwrap();

    // push a block past the threshold so it lands on the slow tier
    let pattern = vec![0x5Au8; 1024];
    fx.fs.write(ino, &pattern, 12 * 1024).unwrap();
    let free_hdd = fx.fs.statfs().free_hdd_blocks;
    drop(fx.fs);

    let cold = HybridFs::mount(&MountOptions::new(&fx.ssd, &fx.hdd)).unwrap();
    // the slow tier was not re-initialized: its free counts carried over
    assert_eq!(cold.statfs().free_hdd_blocks, free_hdd);

    let ino = cold.open("/cold").unwrap();
    let mut buf = vec![0u8; 1024];
    assert_eq!(cold.read(ino, &mut buf, 12 * 1024).unwrap(), 1024);
    assert_eq!(buf, pattern);
}
