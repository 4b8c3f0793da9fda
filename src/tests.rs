//! End-to-end tests over a RAM-backed block device.
//!
//! The suite formats an in-memory image, mounts it and drives the
//! public surface the way a host would: file round-trips across
//! remounts, hole punching, directory indexing, allocator consistency
//! and journal crash behavior (a write failure before the commit block
//! rolls the transaction back; one after it replays on the next
//! mount).

use std::boxed::Box;
use std::cell::RefCell;
use std::rc::Rc;
use std::vec::Vec;

use crate::blockdev::{BdevGeometry, BlockDevice};
use crate::errors::{CanFail, Ext4Error, FsResult};
use crate::fs::ext4::extent;
use crate::fs::ext4::inode::{InodeFlags, GOOD_OLD_FIRST_INO};
use crate::{mkfs, FileSystem, MkfsOptions, MountOptions, OpenFlags, Seek};

const SECTOR: u32 = 512;

/// RAM-backed device. Instances created through [`RamDev::share`] view
/// the same storage, so a formatted image survives the mkfs handle.
struct RamDev {
    data: Rc<RefCell<Vec<u8>>>,
    part_offset: u64,
    /// Fail every write call past this many successful ones.
    fail_after_writes: Option<u64>,
    writes_seen: u64,
}

impl RamDev {
    fn new(bytes: usize) -> Self {
        Self {
            data: Rc::new(RefCell::new(vec![0u8; bytes])),
            part_offset: 0,
            fail_after_writes: None,
            writes_seen: 0,
        }
    }

    fn share(&self) -> Self {
        Self {
            data: self.data.clone(),
            part_offset: self.part_offset,
            fail_after_writes: None,
            writes_seen: 0,
        }
    }

    fn share_failing_after(&self, writes: u64) -> Self {
        Self {
            fail_after_writes: Some(writes),
            ..self.share()
        }
    }

    /// Deep copy of the current image.
    fn snapshot(&self) -> Self {
        Self {
            data: Rc::new(RefCell::new(self.data.borrow().clone())),
            part_offset: self.part_offset,
            fail_after_writes: None,
            writes_seen: 0,
        }
    }
}

impl BlockDevice for RamDev {
    fn open(&mut self) -> FsResult<BdevGeometry> {
        Ok(BdevGeometry {
            block_size: SECTOR,
            block_count: self.data.borrow().len() as u64 / u64::from(SECTOR),
            part_offset: self.part_offset,
        })
    }

    fn bread(&mut self, buf: &mut [u8], lba: u64, cnt: u32) -> CanFail<Ext4Error> {
        let from = lba as usize * SECTOR as usize;
        let to = from + cnt as usize * SECTOR as usize;
        let data = self.data.borrow();
        if to > data.len() {
            return Err(Ext4Error::IO);
        }
        buf[..to - from].copy_from_slice(&data[from..to]);
        Ok(())
    }

    fn bwrite(&mut self, buf: &[u8], lba: u64, cnt: u32) -> CanFail<Ext4Error> {
        if let Some(limit) = self.fail_after_writes {
            if self.writes_seen >= limit {
                return Err(Ext4Error::IO);
            }
        }
        self.writes_seen += 1;

        let from = lba as usize * SECTOR as usize;
        let to = from + cnt as usize * SECTOR as usize;
        let mut data = self.data.borrow_mut();
        if to > data.len() {
            return Err(Ext4Error::IO);
        }
        data[from..to].copy_from_slice(&buf[..to - from]);
        Ok(())
    }

    fn close(&mut self) -> CanFail<Ext4Error> {
        Ok(())
    }
}

fn format_image(bytes: usize) -> RamDev {
    let dev = RamDev::new(bytes);
    mkfs(Box::new(dev.share()), &MkfsOptions::default()).unwrap();
    dev
}

fn mount(dev: &RamDev) -> FileSystem {
    FileSystem::mount(Box::new(dev.share()), MountOptions::default()).unwrap()
}

fn mount_opts(dev: &RamDev, opts: MountOptions) -> FileSystem {
    FileSystem::mount(Box::new(dev.share()), opts).unwrap()
}

/// The file content used across the remount tests: the name repeated
/// to the requested length.
fn name_pattern(name: &str, len: usize) -> Vec<u8> {
    name.bytes().cycle().take(len).collect()
}

#[test]
fn mkfs_mount_lists_lost_and_found() {
    let dev = format_image(8 << 20);
    let fs = mount(&dev);

    let mut root = fs.dir_open("/").unwrap();
    let mut names = Vec::new();
    while let Some(entry) = fs.dir_next(&mut root).unwrap() {
        names.push((String::from_utf8(entry.name).unwrap(), entry.inode));
    }

    assert!(names.contains(&(".".into(), 2)));
    assert!(names.contains(&("..".into(), 2)));
    assert!(names.contains(&("lost+found".into(), GOOD_OLD_FIRST_INO)));
    fs.unmount().unwrap();
}

#[test]
fn mount_respects_partition_offset() {
    let mut dev = RamDev::new(8 << 20);
    dev.part_offset = 1 << 20;
    mkfs(Box::new(dev.share()), &MkfsOptions::default()).unwrap();

    let fs = mount(&dev);
    let mut f = fs
        .open("/offset.bin", OpenFlags::CREAT | OpenFlags::RDWR)
        .unwrap();
    fs.write(&mut f, b"data behind a partition table").unwrap();
    fs.unmount().unwrap();

    // the first megabyte stayed untouched
    assert!(dev.data.borrow()[..1 << 20].iter().all(|&b| b == 0));
}

#[test]
fn file_roundtrip_across_remounts() {
    let dev = format_image(48 << 20);

    {
        let fs = mount(&dev);
        fs.mkdir("/data").unwrap();

        for i in 0..1024 {
            let name = format!("f{i:04}");
            let mut f = fs
                .open(&format!("/data/{name}"), OpenFlags::CREAT | OpenFlags::RDWR)
                .unwrap();
            let content = name_pattern(&name, 8192);
            assert_eq!(fs.write(&mut f, &content).unwrap(), 8192);
        }
        fs.unmount().unwrap();
    }

    let fs = mount(&dev);
    for i in (0..1024).step_by(61) {
        let name = format!("f{i:04}");
        let mut f = fs.open(&format!("/data/{name}"), OpenFlags::RDONLY).unwrap();
        let mut buf = vec![0u8; 8192];
        assert_eq!(fs.read(&mut f, &mut buf).unwrap(), 8192);
        assert_eq!(buf, name_pattern(&name, 8192));
    }

    // 1024 entries forced the directory into its indexed form
    let dir_ino = fs.stat("/data").unwrap().inode;
    fs.with_fs_mut(|fs| {
        let iref = fs.get_inode_ref(dir_ino).unwrap();
        assert!(iref.inode.flags().includes(InodeFlags::INDEX_FL));
        fs.put_inode_ref(iref).unwrap();
    });
    fs.unmount().unwrap();
}

#[test]
fn sparse_reads_return_zeroes() {
    let dev = format_image(8 << 20);
    let fs = mount(&dev);

    let mut f = fs
        .open("/sparse", OpenFlags::CREAT | OpenFlags::RDWR)
        .unwrap();
    fs.seek(&mut f, Seek::Set(100_000)).unwrap();
    fs.write(&mut f, b"tail").unwrap();

    fs.seek(&mut f, Seek::Set(0)).unwrap();
    let mut buf = vec![0xAAu8; 4096];
    assert_eq!(fs.read(&mut f, &mut buf).unwrap(), 4096);
    assert!(buf.iter().all(|&b| b == 0));

    fs.seek(&mut f, Seek::Set(100_000)).unwrap();
    let mut tail = [0u8; 4];
    fs.read(&mut f, &mut tail).unwrap();
    assert_eq!(&tail, b"tail");
    fs.unmount().unwrap();
}

#[test]
fn hole_punch_leaves_two_extents() {
    let dev = format_image(16 << 20);
    let fs = mount(&dev);

    let mut f = fs
        .open("/big", OpenFlags::CREAT | OpenFlags::RDWR)
        .unwrap();
    let content = name_pattern("big", 2 << 20);
    assert_eq!(fs.write(&mut f, &content).unwrap(), 2 << 20);

    fs.punch_hole(&f, 512 << 10, 512 << 10).unwrap();

    // the hole reads back as zeroes, the rest is intact
    fs.seek(&mut f, Seek::Set(512 << 10)).unwrap();
    let mut hole = vec![0xAAu8; 512 << 10];
    assert_eq!(fs.read(&mut f, &mut hole).unwrap(), 512 << 10);
    assert!(hole.iter().all(|&b| b == 0));

    fs.seek(&mut f, Seek::Set(0)).unwrap();
    let mut head = vec![0u8; 512 << 10];
    fs.read(&mut f, &mut head).unwrap();
    assert_eq!(head, content[..512 << 10]);

    fs.seek(&mut f, Seek::Set(1 << 20)).unwrap();
    let mut tail = vec![0u8; 1 << 20];
    fs.read(&mut f, &mut tail).unwrap();
    assert_eq!(tail, content[1 << 20..]);

    // exactly two extents remain, separated by the gap
    let ino = fs.stat("/big").unwrap().inode;
    fs.with_fs_mut(|fs| {
        let iref = fs.get_inode_ref(ino).unwrap();
        let extents = extent::extent_walk(fs, &iref).unwrap();
        fs.put_inode_ref(iref).unwrap();

        assert_eq!(extents.len(), 2);
        // blocks are 1 KiB: [0, 512) and [1024, 2048)
        assert_eq!(extents[0].first_block(), 0);
        assert_eq!(extents[0].block_count(), 512);
        assert_eq!(extents[1].first_block(), 1024);
        assert_eq!(extents[1].block_count(), 1024);
    });
    fs.unmount().unwrap();
}

#[test]
fn writing_inside_an_unwritten_extent_keeps_zeroes() {
    let dev = format_image(8 << 20);
    let fs = mount(&dev);

    let mut f = fs
        .open("/prealloc", OpenFlags::CREAT | OpenFlags::RDWR)
        .unwrap();
    let ino = fs.stat("/prealloc").unwrap().inode;

    // hand-craft a preallocated file the way fallocate lays one out:
    // a contiguous run of allocated blocks mapped by one unwritten
    // extent, with stale bytes on disk underneath
    fs.with_fs_mut(|fs| {
        let first = fs.balloc_alloc_block(fs.sb.bg_first_block(0)).unwrap();
        let mut prev = first;
        for _ in 1..8 {
            let next = fs.balloc_alloc_block(prev + 1).unwrap();
            assert_eq!(next, prev + 1);
            prev = next;
        }
        let junk = vec![0xABu8; 1024];
        for i in 0..8 {
            fs.bdev.blocks_write_direct(first + i, 1, &junk).unwrap();
        }

        let mut iref = fs.get_inode_ref(ino).unwrap();
        let mut ext = extent::Ext4Extent::new(0, first, 8);
        ext.len = (8 + extent::EXT_INIT_MAX_LEN).to_le();
        iref.inode.block[2..4].copy_from_slice(&1u16.to_le_bytes());
        iref.inode.block[12..24].copy_from_slice(bytemuck::bytes_of(&ext));
        iref.inode.set_size(8 * 1024);
        iref.inode.adjust_blocks_count(&fs.sb, 8);
        iref.dirty = true;
        fs.put_inode_ref(iref).unwrap();
    });

    // the whole preallocated range reads back as zeroes
    let mut buf = vec![0xCDu8; 8 * 1024];
    assert_eq!(fs.read(&mut f, &mut buf).unwrap(), 8 * 1024);
    assert!(buf.iter().all(|&b| b == 0));

    // write into the strict interior; the surviving fragments on both
    // sides must keep reading as zeroes, not the stale bytes
    fs.seek(&mut f, Seek::Set(3 * 1024)).unwrap();
    let payload = name_pattern("prealloc", 1024);
    assert_eq!(fs.write(&mut f, &payload).unwrap(), 1024);

    fs.seek(&mut f, Seek::Set(0)).unwrap();
    let mut buf = vec![0xCDu8; 8 * 1024];
    assert_eq!(fs.read(&mut f, &mut buf).unwrap(), 8 * 1024);
    assert!(buf[..3 * 1024].iter().all(|&b| b == 0));
    assert_eq!(&buf[3 * 1024..4 * 1024], payload.as_slice());
    assert!(buf[4 * 1024..].iter().all(|&b| b == 0));

    // and the surviving tail is still a single unwritten extent
    fs.with_fs_mut(|fs| {
        let iref = fs.get_inode_ref(ino).unwrap();
        let extents = extent::extent_walk(fs, &iref).unwrap();
        fs.put_inode_ref(iref).unwrap();

        assert_eq!(extents.len(), 3);
        assert!(!extents[0].is_written());
        assert_eq!(extents[0].block_count(), 3);
        assert!(extents[1].is_written());
        assert!(!extents[2].is_written());
        assert_eq!(extents[2].first_block(), 4);
        assert_eq!(extents[2].block_count(), 4);
    });
    fs.unmount().unwrap();
}

/// Runs `op` against a snapshot and returns how many device writes it
/// issued.
fn count_op_writes(base: &RamDev, op: impl Fn(&FileSystem)) -> u64 {
    let copy = base.snapshot();
    let fs = mount(&copy);
    let (_, before) = fs.device_stats();
    op(&fs);
    let (_, after) = fs.device_stats();
    fs.unmount().unwrap();
    after - before
}

fn write_50_blocks(fs: &FileSystem) {
    let mut f = fs
        .open("/victim", OpenFlags::CREAT | OpenFlags::RDWR)
        .unwrap();
    let content = name_pattern("victim", 50 * 1024);
    fs.write(&mut f, &content).unwrap();
}

#[test]
fn torn_commit_is_discarded_on_remount() {
    let dev = format_image(16 << 20);

    // create the (empty) victim so only the data write runs under the
    // failure, then snapshot the clean state
    {
        let fs = mount(&dev);
        let f = fs
            .open("/victim", OpenFlags::CREAT | OpenFlags::RDWR)
            .unwrap();
        drop(f);
        fs.unmount().unwrap();
    }

    let free_before = {
        let fs = mount(&dev.snapshot());
        let free = fs.with_fs_mut(|fs| fs.count_free_blocks_from_bitmaps().unwrap());
        fs.unmount().unwrap();
        free
    };

    // writes during mount, before the failing operation starts
    let mount_writes = {
        let copy = dev.snapshot();
        let fs = mount(&copy);
        let (_, w) = fs.device_stats();
        fs.unmount().unwrap();
        w
    };

    // fail a few writes into the journal phase: 50 data-block writes
    // come first, the descriptor and journal copies follow, the commit
    // block comes last
    let failing = dev.snapshot();
    let crashed = failing.share_failing_after(mount_writes + 52);
    {
        let fs = FileSystem::mount(Box::new(crashed), MountOptions::default()).unwrap();
        let mut f = fs
            .open("/victim", OpenFlags::RDWR)
            .unwrap();
        let content = name_pattern("victim", 50 * 1024);
        assert!(fs.write(&mut f, &content).is_err());
        let _ = fs.unmount();
    }

    // recovery discards the unfinished transaction
    let fs = mount(&failing);
    assert_eq!(fs.stat("/victim").unwrap().size, 0);
    let free_after = fs.with_fs_mut(|fs| fs.count_free_blocks_from_bitmaps().unwrap());
    assert_eq!(free_before, free_after);
    fs.unmount().unwrap();
}

#[test]
fn committed_transaction_survives_checkpoint_failure() {
    let dev = format_image(16 << 20);
    {
        let fs = mount(&dev);
        let f = fs
            .open("/victim", OpenFlags::CREAT | OpenFlags::RDWR)
            .unwrap();
        drop(f);
        fs.unmount().unwrap();
    }

    let op_writes = count_op_writes(&dev, write_50_blocks);
    let mount_writes = {
        let copy = dev.snapshot();
        let fs = mount(&copy);
        let (_, w) = fs.device_stats();
        fs.unmount().unwrap();
        w
    };

    // everything succeeds except the very last write of the operation
    // (the journal superblock update closing the checkpoint)
    let failing = dev.snapshot();
    let crashed = failing.share_failing_after(mount_writes + op_writes - 1);
    {
        let fs = FileSystem::mount(Box::new(crashed), MountOptions::default()).unwrap();
        let mut f = fs.open("/victim", OpenFlags::RDWR).unwrap();
        let content = name_pattern("victim", 50 * 1024);
        let _ = fs.write(&mut f, &content);
        let _ = fs.unmount();
    }

    // the commit block was durable: recovery replays the transaction
    let fs = mount(&failing);
    assert_eq!(fs.stat("/victim").unwrap().size, 50 * 1024);
    let mut f = fs.open("/victim", OpenFlags::RDONLY).unwrap();
    let mut buf = vec![0u8; 50 * 1024];
    assert_eq!(fs.read(&mut f, &mut buf).unwrap(), 50 * 1024);
    assert_eq!(buf, name_pattern("victim", 50 * 1024));
    fs.unmount().unwrap();
}

#[test]
fn htree_directory_survives_mass_deletion() {
    let dev = format_image(64 << 20);
    let fs = mount(&dev);

    fs.mkdir("/many").unwrap();
    for i in 0..5000 {
        let f = fs
            .open(
                &format!("/many/entry{i:04}"),
                OpenFlags::CREAT | OpenFlags::WRONLY,
            )
            .unwrap();
        drop(f);
    }

    let dir_ino = fs.stat("/many").unwrap().inode;
    fs.with_fs_mut(|fs| {
        let iref = fs.get_inode_ref(dir_ino).unwrap();
        assert!(iref.inode.flags().includes(InodeFlags::INDEX_FL));
        fs.put_inode_ref(iref).unwrap();
    });

    for i in (0..5000).step_by(2) {
        fs.remove(&format!("/many/entry{i:04}")).unwrap();
    }

    // every survivor is still reachable through the index
    for i in (1..5000).step_by(2) {
        fs.stat(&format!("/many/entry{i:04}")).unwrap();
    }
    for i in (0..5000).step_by(2) {
        assert_eq!(
            fs.stat(&format!("/many/entry{i:04}")),
            Err(Ext4Error::NotFound)
        );
    }

    let mut dir = fs.dir_open("/many").unwrap();
    let mut count = 0;
    while let Some(entry) = fs.dir_next(&mut dir).unwrap() {
        if entry.name != b"." && entry.name != b".." {
            count += 1;
        }
    }
    assert_eq!(count, 2500);
    fs.unmount().unwrap();
}

#[test]
fn alloc_free_keeps_counters_consistent() {
    let dev = format_image(8 << 20);
    let fs = mount(&dev);

    fs.with_fs_mut(|fs| {
        let goal = fs.sb.bg_first_block(0);
        for i in 0..10_000u64 {
            let block = fs.balloc_alloc_block(goal + (i % 512)).unwrap();
            fs.balloc_free_blocks(block, 1).unwrap();

            if i % 250 == 0 {
                let from_bitmaps = fs.count_free_blocks_from_bitmaps().unwrap();
                assert_eq!(fs.sb.free_blk_count(), from_bitmaps);
            }
        }
        let from_bitmaps = fs.count_free_blocks_from_bitmaps().unwrap();
        assert_eq!(fs.sb.free_blk_count(), from_bitmaps);
    });
    fs.unmount().unwrap();
}

#[test]
fn xattr_roundtrip_and_persistence() {
    let dev = format_image(8 << 20);

    {
        let fs = mount(&dev);
        let f = fs
            .open("/tagged", OpenFlags::CREAT | OpenFlags::WRONLY)
            .unwrap();
        drop(f);

        fs.setxattr("/tagged", "user.comment", b"small value").unwrap();
        // too large for the inode body: lands in the attribute block
        let big = name_pattern("big-attribute", 600);
        fs.setxattr("/tagged", "user.payload", &big).unwrap();

        assert_eq!(fs.getxattr("/tagged", "user.comment").unwrap(), b"small value");
        assert_eq!(fs.getxattr("/tagged", "user.payload").unwrap(), big);

        let names = fs.listxattr("/tagged").unwrap();
        assert!(names.contains(&"user.comment".into()));
        assert!(names.contains(&"user.payload".into()));
        fs.unmount().unwrap();
    }

    let fs = mount(&dev);
    assert_eq!(
        fs.getxattr("/tagged", "user.comment").unwrap(),
        b"small value"
    );
    fs.removexattr("/tagged", "user.comment").unwrap();
    assert_eq!(
        fs.getxattr("/tagged", "user.comment"),
        Err(Ext4Error::NoData)
    );
    assert_eq!(
        fs.getxattr("/tagged", "user.payload").unwrap(),
        name_pattern("big-attribute", 600)
    );
    fs.unmount().unwrap();
}

#[test]
fn namespace_operations() {
    let dev = format_image(8 << 20);
    let fs = mount(&dev);

    fs.mkdir("/a").unwrap();
    fs.mkdir("/a/b").unwrap();
    assert_eq!(fs.mkdir("/a"), Err(Ext4Error::AlreadyExists));

    let mut f = fs
        .open("/a/b/file", OpenFlags::CREAT | OpenFlags::RDWR)
        .unwrap();
    fs.write(&mut f, b"content").unwrap();

    assert_eq!(fs.rmdir("/a/b"), Err(Ext4Error::NotEmpty));
    assert_eq!(fs.rmdir("/a/b/file"), Err(Ext4Error::NotADirectory));
    assert_eq!(fs.remove("/a/b"), Err(Ext4Error::IsADirectory));

    fs.rename("/a/b/file", "/a/renamed").unwrap();
    assert_eq!(fs.stat("/a/b/file"), Err(Ext4Error::NotFound));
    assert_eq!(fs.stat("/a/renamed").unwrap().size, 7);

    // moving a directory updates its `..`
    fs.mkdir("/target").unwrap();
    fs.rename("/a/b", "/target/b").unwrap();
    let mut moved = fs.dir_open("/target/b").unwrap();
    let mut parent_ino = 0;
    while let Some(entry) = fs.dir_next(&mut moved).unwrap() {
        if entry.name == b".." {
            parent_ino = entry.inode;
        }
    }
    assert_eq!(parent_ino, fs.stat("/target").unwrap().inode);

    fs.remove("/a/renamed").unwrap();
    fs.rmdir("/target/b").unwrap();
    fs.rmdir("/target").unwrap();
    fs.rmdir("/a").unwrap();
    assert_eq!(fs.stat("/a"), Err(Ext4Error::NotFound));
    fs.unmount().unwrap();
}

#[test]
fn truncate_shrinks_and_extends() {
    let dev = format_image(8 << 20);
    let fs = mount(&dev);

    let mut f = fs
        .open("/trunc", OpenFlags::CREAT | OpenFlags::RDWR)
        .unwrap();
    let content = name_pattern("trunc", 100_000);
    fs.write(&mut f, &content).unwrap();

    fs.truncate(&mut f, 10_000).unwrap();
    assert_eq!(fs.stat("/trunc").unwrap().size, 10_000);

    fs.seek(&mut f, Seek::Set(0)).unwrap();
    let mut buf = vec![0u8; 10_000];
    assert_eq!(fs.read(&mut f, &mut buf).unwrap(), 10_000);
    assert_eq!(buf, content[..10_000]);

    // sparse extension reads back as zeroes
    fs.truncate(&mut f, 20_000).unwrap();
    fs.seek(&mut f, Seek::Set(10_000)).unwrap();
    let mut tail = vec![0xAAu8; 10_000];
    assert_eq!(fs.read(&mut f, &mut tail).unwrap(), 10_000);
    assert!(tail.iter().all(|&b| b == 0));
    fs.unmount().unwrap();
}

#[test]
fn removing_files_releases_their_blocks() {
    let dev = format_image(8 << 20);
    let fs = mount(&dev);

    let free_before = fs.with_fs_mut(|fs| fs.count_free_blocks_from_bitmaps().unwrap());

    let mut f = fs
        .open("/doomed", OpenFlags::CREAT | OpenFlags::RDWR)
        .unwrap();
    fs.write(&mut f, &name_pattern("doomed", 200_000)).unwrap();
    drop(f);

    let free_during = fs.with_fs_mut(|fs| fs.count_free_blocks_from_bitmaps().unwrap());
    assert!(free_during < free_before);

    fs.remove("/doomed").unwrap();
    let free_after = fs.with_fs_mut(|fs| fs.count_free_blocks_from_bitmaps().unwrap());
    assert_eq!(free_before, free_after);
    fs.unmount().unwrap();
}

#[test]
fn mode_strings_map_to_flags() {
    assert_eq!(OpenFlags::from_mode_str("r").unwrap(), OpenFlags::RDONLY);
    assert_eq!(OpenFlags::from_mode_str("r+").unwrap(), OpenFlags::RDWR);
    assert_eq!(
        OpenFlags::from_mode_str("w").unwrap(),
        OpenFlags::WRONLY | OpenFlags::CREAT | OpenFlags::TRUNC
    );
    assert_eq!(
        OpenFlags::from_mode_str("a+").unwrap(),
        OpenFlags::RDWR | OpenFlags::CREAT | OpenFlags::APPEND
    );
    assert!(OpenFlags::from_mode_str("x").is_err());
}

#[test]
fn append_mode_writes_at_the_end() {
    let dev = format_image(8 << 20);
    let fs = mount(&dev);

    let mut f = fs.open_with_mode("/log", "w").unwrap();
    fs.write(&mut f, b"first-").unwrap();
    fs.close(f);

    let mut f = fs.open_with_mode("/log", "a").unwrap();
    fs.write(&mut f, b"second").unwrap();
    fs.close(f);

    let mut f = fs.open_with_mode("/log", "r").unwrap();
    let mut buf = [0u8; 12];
    assert_eq!(fs.read(&mut f, &mut buf).unwrap(), 12);
    assert_eq!(&buf, b"first-second");
    fs.unmount().unwrap();
}

#[test]
fn unjournaled_mount_works() {
    let dev = RamDev::new(8 << 20);
    mkfs(
        Box::new(dev.share()),
        &MkfsOptions {
            journal: false,
            ..MkfsOptions::default()
        },
    )
    .unwrap();

    let fs = mount_opts(
        &dev,
        MountOptions {
            journal: false,
            ..MountOptions::default()
        },
    );
    assert!(!fs.journal_enabled());

    let mut f = fs.open("/plain", OpenFlags::CREAT | OpenFlags::RDWR).unwrap();
    fs.write(&mut f, b"no journal here").unwrap();
    fs.unmount().unwrap();

    let fs = mount_opts(
        &dev,
        MountOptions {
            journal: false,
            ..MountOptions::default()
        },
    );
    let mut f = fs.open("/plain", OpenFlags::RDONLY).unwrap();
    let mut buf = [0u8; 15];
    fs.read(&mut f, &mut buf).unwrap();
    assert_eq!(&buf, b"no journal here");
    fs.unmount().unwrap();
}
