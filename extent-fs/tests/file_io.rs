mod common;

use enumflags2::BitFlags;
use extent_fs::{Config, Error, FileDescriptor, OpenFlag, Volume, Whence};

use self::common::{mount, pattern};

fn rdonly() -> BitFlags<OpenFlag> {
    BitFlags::from_bits_truncate(OpenFlag::RDONLY)
}

fn create() -> BitFlags<OpenFlag> {
    OpenFlag::CREATE | OpenFlag::WRONLY
}

fn write_file(volume: &mut Volume, name: &str, data: &[u8]) {
    let root = volume.root();
    let fd = volume.open(&root, name, create()).unwrap();
    assert_eq!(volume.write(fd, data).unwrap(), data.len());
    volume.close(fd).unwrap();
}

fn read_file(volume: &mut Volume, name: &str) -> Vec<u8> {
    let root = volume.root();
    let fd = volume.open(&root, name, rdonly()).unwrap();
    let mut buf = vec![0; volume.stat(&root, name).unwrap().size as usize + 100];
    let len = volume.read(fd, &mut buf).unwrap();
    assert_eq!(volume.read(fd, &mut buf).unwrap(), 0);
    volume.close(fd).unwrap();
    buf.truncate(len);
    buf
}

#[test]
fn round_trip_sizes() {
    let (_, mut volume) = mount(4096, Config::default());
    for (i, len) in [100, 512, 2048, 1000, 100_000].into_iter().enumerate() {
        let name = format!("file-{len}");
        let data = pattern(len, i as u8);
        write_file(&mut volume, &name, &data);
        assert_eq!(read_file(&mut volume, &name), data, "{name}");
    }
}

#[test]
fn growth_beyond_initial_grant() {
    let config = Config {
        initial_grant: 2,
        ..Config::default()
    };
    let (_, mut volume) = mount(4096, config);
    let root = volume.root();
    let data = pattern(20_000, 3);

    // 零碎的写入经过缓冲区，每次扩容翻倍
    let fd = volume.open(&root, "chunks", create()).unwrap();
    for chunk in data.chunks(97) {
        assert_eq!(volume.write(fd, chunk).unwrap(), chunk.len());
    }
    volume.close(fd).unwrap();
    assert_eq!(read_file(&mut volume, "chunks"), data);

    // 缓冲与直写交替
    let fd = volume.open(&root, "mixed", create()).unwrap();
    let mut rest = &data[..];
    for step in [37, 1500, 512, 3, 4096, 700].into_iter().cycle() {
        if rest.is_empty() {
            break;
        }
        let (head, tail) = rest.split_at(step.min(rest.len()));
        assert_eq!(volume.write(fd, head).unwrap(), head.len());
        rest = tail;
    }
    volume.close(fd).unwrap();
    assert_eq!(read_file(&mut volume, "mixed"), data);

    let stat = volume.stat(&root, "mixed").unwrap();
    assert_eq!(stat.size, 20_000);
    assert_eq!(stat.blocks, 20_000u32.div_ceil(512));
}

#[test]
fn reads_in_small_steps() {
    let (_, mut volume) = mount(4096, Config::default());
    let root = volume.root();
    let data = pattern(5000, 9);
    write_file(&mut volume, "f", &data);

    let fd = volume.open(&root, "f", rdonly()).unwrap();
    let mut out = Vec::new();
    let mut buf = [0; 333];
    loop {
        let n = volume.read(fd, &mut buf).unwrap();
        if n == 0 {
            break;
        }
        out.extend_from_slice(&buf[..n]);
    }
    assert_eq!(out, data);
    volume.close(fd).unwrap();
}

#[test]
fn close_trims_to_size() {
    let (_, mut volume) = mount(4096, Config::default());
    let root = volume.root();
    let free = volume.free_blocks();

    write_file(&mut volume, "small", &pattern(1000, 1));
    let stat = volume.stat(&root, "small").unwrap();
    assert_eq!((stat.size, stat.blocks), (1000, 2));
    assert_eq!(volume.free_blocks(), free - 2);

    // 截断后写得更短，多余的块还给分配器
    let fd = volume
        .open(&root, "small", OpenFlag::WRONLY | OpenFlag::TRUNC)
        .unwrap();
    assert_eq!(volume.free_blocks(), free);
    volume.write(fd, &pattern(300, 2)).unwrap();
    volume.close(fd).unwrap();
    assert_eq!(volume.stat(&root, "small").unwrap().blocks, 1);
    assert_eq!(volume.free_blocks(), free - 1);
    assert_eq!(read_file(&mut volume, "small"), pattern(300, 2));
}

#[test]
fn explicit_trim() {
    let (_, mut volume) = mount(4096, Config::default());
    let root = volume.root();
    let free = volume.free_blocks();

    let fd = volume.open(&root, "t", create()).unwrap();
    volume.write(fd, &pattern(700, 4)).unwrap();
    assert_eq!(volume.free_blocks(), free - 100);

    // 还在缓冲区里的字节也计入大小
    assert_eq!(volume.stat(&root, "t").unwrap().size, 700);

    volume.trim(fd).unwrap();
    assert_eq!(volume.stat(&root, "t").unwrap().blocks, 2);
    assert_eq!(volume.free_blocks(), free - 2);

    // 再写需要重新扩容
    volume.write(fd, &pattern(1000, 5)).unwrap();
    volume.close(fd).unwrap();
    assert_eq!(volume.stat(&root, "t").unwrap().blocks, 4);
    assert_eq!(volume.free_blocks(), free - 4);

    let mut expected = pattern(700, 4);
    expected.extend(pattern(1000, 5));
    assert_eq!(read_file(&mut volume, "t"), expected);

    let fd = volume.open(&root, "t", rdonly()).unwrap();
    assert_eq!(volume.trim(fd), Err(Error::PermissionMismatch));
    volume.close(fd).unwrap();
}

#[test]
fn seek_bounds() {
    let (_, mut volume) = mount(4096, Config::default());
    let root = volume.root();
    let data = pattern(1000, 6);
    write_file(&mut volume, "s", &data);

    let fd = volume.open(&root, "s", rdonly()).unwrap();
    assert_eq!(volume.seek(fd, 1001, Whence::Start), Err(Error::InvalidArgument));
    assert_eq!(volume.seek(fd, 1, Whence::End), Err(Error::InvalidArgument));
    assert_eq!(volume.seek(fd, -1, Whence::Start), Err(Error::InvalidArgument));

    let mut buf = [0; 64];
    assert_eq!(volume.seek(fd, 0, Whence::End).unwrap(), 1000);
    assert_eq!(volume.read(fd, &mut buf).unwrap(), 0);
    assert_eq!(volume.seek(fd, 1000, Whence::Start).unwrap(), 1000);
    assert_eq!(volume.read(fd, &mut buf).unwrap(), 0);

    assert_eq!(volume.seek(fd, -10, Whence::End).unwrap(), 990);
    assert_eq!(volume.read(fd, &mut buf).unwrap(), 10);
    assert_eq!(buf[..10], data[990..]);

    assert_eq!(volume.seek(fd, 500, Whence::Start).unwrap(), 500);
    assert_eq!(volume.seek(fd, -20, Whence::Current).unwrap(), 480);
    assert_eq!(volume.tell(fd).unwrap(), 480);
    assert_eq!(volume.read(fd, &mut buf).unwrap(), 64);
    assert_eq!(buf, data[480..544]);
    volume.close(fd).unwrap();
}

#[test]
fn overwrite_in_place_keeps_neighbours() {
    let (_, mut volume) = mount(4096, Config::default());
    let root = volume.root();
    let mut data = pattern(3000, 7);
    write_file(&mut volume, "o", &data);

    let fd = volume.open(&root, "o", OpenFlag::RDWR.into()).unwrap();
    volume.seek(fd, 300, Whence::Start).unwrap();
    volume.write(fd, &[0xFF; 10]).unwrap();
    data[300..310].fill(0xFF);

    // 读之前先把缓冲区落盘
    volume.seek(fd, 290, Whence::Start).unwrap();
    let mut buf = [0; 30];
    assert_eq!(volume.read(fd, &mut buf).unwrap(), 30);
    assert_eq!(buf, data[290..320]);

    // 跨越块边界的整块覆盖
    volume.seek(fd, 1024, Whence::Start).unwrap();
    volume.write(fd, &[0xAB; 1024]).unwrap();
    data[1024..2048].fill(0xAB);
    volume.close(fd).unwrap();

    assert_eq!(volume.stat(&root, "o").unwrap().size, 3000);
    assert_eq!(read_file(&mut volume, "o"), data);
}

#[test]
fn append_extends_partial_block() {
    let (_, mut volume) = mount(4096, Config::default());
    let root = volume.root();
    write_file(&mut volume, "log", &pattern(700, 1));

    let fd = volume
        .open(&root, "log", OpenFlag::WRONLY | OpenFlag::APPEND)
        .unwrap();
    assert_eq!(volume.tell(fd).unwrap(), 700);
    volume.write(fd, &pattern(100, 2)).unwrap();
    volume.close(fd).unwrap();

    let mut expected = pattern(700, 1);
    expected.extend(pattern(100, 2));
    assert_eq!(read_file(&mut volume, "log"), expected);
}

#[test]
fn truncate_on_open() {
    let (_, mut volume) = mount(4096, Config::default());
    let root = volume.root();
    let free = volume.free_blocks();
    write_file(&mut volume, "big", &pattern(10_000, 1));

    let fd = volume
        .open(&root, "big", OpenFlag::WRONLY | OpenFlag::TRUNC)
        .unwrap();
    volume.close(fd).unwrap();

    let stat = volume.stat(&root, "big").unwrap();
    assert_eq!((stat.size, stat.blocks), (0, 0));
    assert_eq!(volume.free_blocks(), free);
    assert!(read_file(&mut volume, "big").is_empty());
}

#[test]
fn open_mode_mismatch() {
    let (_, mut volume) = mount(4096, Config::default());
    let root = volume.root();
    write_file(&mut volume, "m", b"abc");

    let fd = volume.open(&root, "m", rdonly()).unwrap();
    assert_eq!(volume.write(fd, b"x"), Err(Error::PermissionMismatch));
    volume.close(fd).unwrap();

    let fd = volume.open(&root, "m", OpenFlag::WRONLY.into()).unwrap();
    let mut buf = [0; 3];
    assert_eq!(volume.read(fd, &mut buf), Err(Error::PermissionMismatch));
    volume.close(fd).unwrap();

    // 只读打开时忽略截断
    let fd = volume
        .open(&root, "m", BitFlags::from(OpenFlag::TRUNC))
        .unwrap();
    assert_eq!(volume.read(fd, &mut buf).unwrap(), 3);
    volume.close(fd).unwrap();
}

#[test]
fn open_errors() {
    let (_, mut volume) = mount(4096, Config::default());
    let root = volume.root();
    volume.mkdir(&root, "dir").unwrap();

    assert_eq!(volume.open(&root, "nope", rdonly()), Err(Error::NotFound));
    assert_eq!(volume.open(&root, "dir", create()), Err(Error::PermissionMismatch));
    assert_eq!(volume.open(&root, ".", create()), Err(Error::InvalidArgument));
    assert_eq!(volume.open(&root, "", create()), Err(Error::InvalidArgument));
    let long = "n".repeat(32);
    assert_eq!(volume.open(&root, &long, create()), Err(Error::InvalidArgument));
    assert!(volume.open(&root, &long[..31], create()).is_ok());
}

#[test]
fn bad_descriptors() {
    let (_, mut volume) = mount(4096, Config::default());
    let root = volume.root();
    let mut buf = [0; 8];

    assert_eq!(
        volume.read(FileDescriptor::from(99), &mut buf),
        Err(Error::BadDescriptor)
    );
    assert_eq!(volume.close(FileDescriptor::from(0)), Err(Error::BadDescriptor));

    let fd = volume.open(&root, "f", create()).unwrap();
    volume.close(fd).unwrap();
    assert_eq!(volume.write(fd, b"late"), Err(Error::BadDescriptor));
    assert_eq!(volume.seek(fd, 0, Whence::Start), Err(Error::BadDescriptor));
    assert_eq!(volume.close(fd), Err(Error::BadDescriptor));
}

#[test]
fn descriptor_pool_exhaustion() {
    let config = Config {
        max_open_files: 3,
        ..Config::default()
    };
    let (_, mut volume) = mount(4096, config);
    let root = volume.root();

    let fds: Vec<_> = (0..3)
        .map(|i| volume.open(&root, &format!("f{i}"), create()).unwrap())
        .collect();
    assert_eq!(volume.open(&root, "f3", create()), Err(Error::TooManyOpenFiles));
    // 失败的打开不会留下目录项
    assert_eq!(volume.stat(&root, "f3"), Err(Error::NotFound));

    volume.close(fds[1]).unwrap();
    let fd = volume.open(&root, "f3", create()).unwrap();
    assert_eq!(fd, fds[1]);
}

#[test]
fn open_file_cannot_be_removed() {
    let (_, mut volume) = mount(4096, Config::default());
    let root = volume.root();
    let fd = volume.open(&root, "busy", create()).unwrap();
    assert_eq!(volume.remove_file(&root, "busy"), Err(Error::PermissionMismatch));
    volume.close(fd).unwrap();
    volume.remove_file(&root, "busy").unwrap();
}

#[test]
fn partial_read_on_disk_error() {
    let (disk, mut volume) = mount(4096, Config::default());
    let root = volume.root();
    let data = pattern(4096, 8);
    write_file(&mut volume, "frail", &data);

    let start = {
        let dir = root.lock();
        let index = dir.find("frail").unwrap();
        dir.entry(index).unwrap().extents()[0].start as usize
    };

    let fd = volume.open(&root, "frail", rdonly()).unwrap();
    volume.seek(fd, 100, Whence::Start).unwrap();
    disk.fail_reads_from(start + 3);

    // 第一块的剩余部分已经拷出，后面的整块读取失败
    let mut buf = vec![0; 4096];
    assert_eq!(volume.read(fd, &mut buf).unwrap(), 412);
    assert_eq!(buf[..412], data[100..512]);
    assert_eq!(volume.read(fd, &mut buf), Err(Error::DiskIo));

    disk.heal();
    let mut rest = vec![0; 4096];
    assert_eq!(volume.read(fd, &mut rest).unwrap(), 4096 - 512);
    assert_eq!(rest[..4096 - 512], data[512..]);
    volume.close(fd).unwrap();
}

#[test]
fn write_error_surfaces_on_close() {
    let (disk, mut volume) = mount(4096, Config::default());
    let root = volume.root();
    let fd = volume.open(&root, "w", create()).unwrap();
    volume.write(fd, b"pending").unwrap();

    disk.fail_writes_from(0);
    assert_eq!(volume.close(fd), Err(Error::DiskIo));
    // 描述符照样被释放
    assert_eq!(volume.close(fd), Err(Error::BadDescriptor));
    disk.heal();
}

#[test]
fn out_of_space() {
    let (_, mut volume) = mount(300, Config::default());
    let root = volume.root();
    let free = volume.free_blocks();

    let fd = volume.open(&root, "huge", create()).unwrap();
    let data = pattern((free as usize + 1) * 512, 1);
    assert_eq!(volume.write(fd, &data), Err(Error::OutOfSpace));
    volume.close(fd).unwrap();
    assert_eq!(volume.free_blocks(), free);

    // 空间刚好够时，首次申请被压到剩余量
    let fd = volume.open(&root, "exact", create()).unwrap();
    let data = pattern(free as usize * 512, 2);
    assert_eq!(volume.write(fd, &data).unwrap(), data.len());
    assert_eq!(volume.free_blocks(), 0);
    volume.close(fd).unwrap();
    assert_eq!(read_file(&mut volume, "exact"), data);
}

#[test]
fn too_many_extents() {
    let config = Config {
        initial_grant: 1,
        ..Config::default()
    };
    let (_, mut volume) = mount(1000, config);
    let root = volume.root();

    // 连续的单块文件，删掉一半留下互不相邻的空洞
    for i in 0..40 {
        write_file(&mut volume, &format!("f{i:02}"), b"x");
    }
    for i in (0..40).step_by(2) {
        volume.remove_file(&root, &format!("f{i:02}")).unwrap();
    }
    let free = volume.free_blocks();

    let fd = volume.open(&root, "scattered", create()).unwrap();
    assert_eq!(
        volume.write(fd, &pattern(20 * 512, 1)),
        Err(Error::TooManyExtents)
    );
    volume.close(fd).unwrap();
    assert_eq!(volume.free_blocks(), free);
}

#[test]
fn timestamps_from_clock() {
    let config = Config {
        clock: || 1_700_000_000,
        ..Config::default()
    };
    let (_, mut volume) = mount(4096, config);
    let root = volume.root();
    write_file(&mut volume, "t", b"time");

    let stat = volume.stat(&root, "t").unwrap();
    assert_eq!(stat.created, 1_700_000_000);
    assert_eq!(stat.modified, 1_700_000_000);
    assert_eq!(stat.accessed, 1_700_000_000);
    assert_eq!(stat.block_size, 512);
    assert!(!stat.is_dir);
}

#[test]
fn remount_keeps_everything() {
    let (disk, mut volume) = mount(4096, Config::default());
    let root = volume.root();
    let data = pattern(30_000, 5);
    let docs = volume.mkdir(&root, "docs").unwrap();
    let fd = volume.open(&docs, "report", create()).unwrap();
    volume.write(fd, &data).unwrap();
    // 未关闭的文件由卸载负责落盘
    let info = volume.info();
    drop((root, docs));
    volume.unmount().unwrap();

    let mut volume = Volume::mount(disk, Config::default()).unwrap();
    assert_eq!(volume.info().name, info.name);
    assert_eq!(volume.info().total_blocks, 4096);
    let root = volume.root();
    let docs = volume.open_dir(&root, "docs").unwrap();
    let fd = volume.open(&docs, "report", rdonly()).unwrap();
    let mut buf = vec![0; data.len()];
    assert_eq!(volume.read(fd, &mut buf).unwrap(), data.len());
    assert_eq!(buf, data);
    volume.close(fd).unwrap();

    let stat = volume.stat(&docs, "report").unwrap();
    assert_eq!(stat.blocks, 30_000u32.div_ceil(512));
    assert_eq!(volume.free_blocks(), 4096 - 5 - 14 - 14 - stat.blocks);
}
