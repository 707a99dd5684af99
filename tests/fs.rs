//! End-to-end tests over the simulated NAND chip: a freshly formatted
//! 128-block, 32-pages-per-block, 512+16 device unless stated otherwise.

use nand_flash::sim::{geometry_512, SimNand};
use nand_flash::NandFlash;
use nandfs::{
    Device, DeviceConfig, Error, FileSystem, Whence, O_APPEND, O_CREATE, O_DIR, O_EXCL, O_RDONLY,
    O_RDWR, O_TRUNC,
};

use test_log::test;

const BLOCKS: u32 = 128;
const PAGES: u32 = 32;

fn fresh_device(flash: SimNand) -> Device<SimNand> {
    let end = flash.geometry().total_blocks as u16 - 1;
    let mut dev = Device::new(flash, DeviceConfig::new(0, end)).unwrap();
    dev.format().unwrap();
    dev
}

fn fresh_fs() -> FileSystem<SimNand> {
    let dev = fresh_device(SimNand::new(geometry_512(BLOCKS, PAGES)));
    let mut fs = FileSystem::new();
    fs.mount("/", dev).unwrap();
    fs
}

fn pattern(len: usize, seed: u32) -> Vec<u8> {
    let mut state = seed.wrapping_mul(2654435761).max(1);
    (0..len)
        .map(|_| {
            state = state.wrapping_mul(1103515245).wrapping_add(12345);
            (state >> 16) as u8
        })
        .collect()
}

fn write_all(fs: &mut FileSystem<SimNand>, fd: i32, mut data: &[u8]) {
    while !data.is_empty() {
        let n = fs.write(fd, data).unwrap();
        assert!(n > 0, "write made no progress");
        data = &data[n..];
    }
}

fn read_all(fs: &mut FileSystem<SimNand>, fd: i32, len: usize) -> Vec<u8> {
    let mut out = vec![0u8; len];
    let mut done = 0;
    while done < len {
        let n = fs.read(fd, &mut out[done..]).unwrap();
        if n == 0 {
            break;
        }
        done += n;
    }
    out.truncate(done);
    out
}

/// S1: a file in a subdirectory, write then seek and read a window.
#[test]
fn subdir_write_seek_read() {
    let mut fs = fresh_fs();
    fs.mkdir("/abc").unwrap();

    let fd = fs.open("/abc/test.txt", O_RDWR | O_CREATE).unwrap();
    fs.write(fd, b"123456789ABCDEF").unwrap();
    fs.seek(fd, 3, Whence::Set).unwrap();
    let mut buf = [0u8; 5];
    assert_eq!(fs.read(fd, &mut buf).unwrap(), 5);
    assert_eq!(&buf, b"45678");
    fs.close(fd).unwrap();
}

/// S2: many append sessions; the reassembled byte stream must match.
#[test]
fn append_sessions_accumulate() {
    let mut fs = fresh_fs();
    let mut expect = Vec::new();

    let mut i = 1usize;
    while i < 500 {
        let fd = fs.open("/x", O_RDWR | O_APPEND | O_CREATE).unwrap();
        fs.seek(fd, 0, Whence::End).unwrap();
        let chunk: Vec<u8> = (0..i).map(|k| (k & 0xFF) as u8).collect();
        write_all(&mut fs, fd, &chunk);
        fs.close(fd).unwrap();
        expect.extend_from_slice(&chunk);
        i += 29;
    }

    let fd = fs.open("/x", O_RDONLY).unwrap();
    let got = read_all(&mut fs, fd, expect.len() + 16);
    fs.close(fd).unwrap();
    assert_eq!(got, expect);
}

/// S3: 80 files under the root; readdir sees each exactly once and each
/// file holds its own path.
#[test]
fn eighty_files_and_readdir() {
    let mut fs = fresh_fs();

    for i in 0..80 {
        let path = format!("/File{:03}", i);
        let fd = fs.open(&path, O_RDWR | O_CREATE).unwrap();
        write_all(&mut fs, fd, path.as_bytes());
        fs.close(fd).unwrap();
    }

    let dh = fs.opendir("/").unwrap();
    let mut seen = std::collections::BTreeMap::new();
    while let Some(entry) = fs.readdir(dh).unwrap() {
        let name = String::from_utf8(entry.info.name().to_vec()).unwrap();
        *seen.entry(name).or_insert(0) += 1;
    }
    fs.closedir(dh).unwrap();

    assert_eq!(seen.len(), 80);
    assert!(seen.values().all(|&c| c == 1));

    for i in 0..80 {
        let path = format!("/File{:03}", i);
        let fd = fs.open(&path, O_RDONLY).unwrap();
        let got = read_all(&mut fs, fd, path.len() + 8);
        fs.close(fd).unwrap();
        assert_eq!(got, path.as_bytes());
    }
}

/// S4: a factory bad block survives format and remount without taking any
/// file down with it.
#[test]
fn factory_bad_block_is_isolated() {
    let flash = SimNand::new(geometry_512(BLOCKS, PAGES)).with_bad_blocks(&[5]);
    let dev = fresh_device(flash);
    assert_eq!(dev.bad_blocks(), 1);

    let mut fs = FileSystem::new();
    fs.mount("/", dev).unwrap();

    let mut files = Vec::new();
    for i in 0..10 {
        let path = format!("/f{}", i);
        let data = pattern(2000, i);
        let fd = fs.open(&path, O_RDWR | O_CREATE).unwrap();
        write_all(&mut fs, fd, &data);
        fs.close(fd).unwrap();
        files.push((path, data));
    }

    let dev = fs.unmount("/").unwrap();
    let flash = dev.release();

    let mut dev = Device::new(flash, DeviceConfig::new(0, (BLOCKS - 1) as u16)).unwrap();
    dev.mount().unwrap();
    assert_eq!(dev.bad_blocks(), 1);

    let mut fs = FileSystem::new();
    fs.mount("/", dev).unwrap();
    for (path, data) in files {
        let fd = fs.open(&path, O_RDONLY).unwrap();
        let got = read_all(&mut fs, fd, data.len());
        fs.close(fd).unwrap();
        assert_eq!(got, data, "{} lost data", path);
    }
}

/// S5: two files open at once on one device, writes interleaved.
#[test]
fn interleaved_writes_two_files() {
    let mut fs = fresh_fs();
    let fa = fs.open("/a", O_RDWR | O_CREATE).unwrap();
    let fb = fs.open("/b", O_RDWR | O_CREATE).unwrap();

    fs.write(fa, b"Hello,").unwrap();
    fs.write(fb, b"Hello,").unwrap();
    fs.write(fa, b"World.").unwrap();
    fs.write(fb, b"World.").unwrap();

    fs.close(fa).unwrap();
    fs.close(fb).unwrap();

    for path in ["/a", "/b"] {
        let fd = fs.open(path, O_RDONLY).unwrap();
        let got = read_all(&mut fs, fd, 32);
        fs.close(fd).unwrap();
        assert_eq!(got, b"Hello,World.");
    }
}

/// Property 6: a multi-block write reads back byte-identical, before and
/// after close/reopen, and after a full unmount/remount cycle.
#[test]
fn large_file_roundtrip_and_remount() {
    let mut fs = fresh_fs();
    let block_bytes = fs.device("/").unwrap().block_data_size() as usize;
    let data = pattern(block_bytes * 5 / 2, 42);

    let fd = fs.open("/big.bin", O_RDWR | O_CREATE).unwrap();
    write_all(&mut fs, fd, &data);
    fs.seek(fd, 0, Whence::Set).unwrap();
    assert_eq!(read_all(&mut fs, fd, data.len()), data);
    fs.close(fd).unwrap();

    let fd = fs.open("/big.bin", O_RDONLY).unwrap();
    assert_eq!(read_all(&mut fs, fd, data.len()), data);
    assert!(fs.eof(fd).unwrap());
    fs.close(fd).unwrap();

    // property 8: remount yields the same contents
    let dev = fs.unmount("/").unwrap();
    let flash = dev.release();
    let mut dev = Device::new(flash, DeviceConfig::new(0, (BLOCKS - 1) as u16)).unwrap();
    dev.mount().unwrap();
    let mut fs = FileSystem::new();
    fs.mount("/", dev).unwrap();

    let info = fs.stat("/big.bin").unwrap();
    assert_eq!(info.len as usize, data.len());

    let fd = fs.open("/big.bin", O_RDONLY).unwrap();
    assert_eq!(read_all(&mut fs, fd, data.len()), data);
    fs.close(fd).unwrap();
}

/// Property 7: format then readdir("/") is empty.
#[test]
fn format_leaves_empty_root() {
    let mut fs = fresh_fs();
    let fd = fs.open("/junk", O_RDWR | O_CREATE).unwrap();
    fs.write(fd, b"junk").unwrap();
    fs.close(fd).unwrap();

    fs.format("/").unwrap();

    let dh = fs.opendir("/").unwrap();
    assert!(fs.readdir(dh).unwrap().is_none());
    fs.closedir(dh).unwrap();
}

/// Property 9: a rename round trip is an identity on content and lookup.
#[test]
fn rename_round_trip() {
    let mut fs = fresh_fs();
    let data = pattern(900, 7);
    let fd = fs.open("/a", O_RDWR | O_CREATE).unwrap();
    write_all(&mut fs, fd, &data);
    fs.close(fd).unwrap();

    fs.rename("/a", "/b").unwrap();
    assert_eq!(fs.open("/a", O_RDONLY).unwrap_err(), Error::NotFound);
    let fd = fs.open("/b", O_RDONLY).unwrap();
    assert_eq!(read_all(&mut fs, fd, data.len()), data);
    fs.close(fd).unwrap();

    fs.rename("/b", "/a").unwrap();
    let fd = fs.open("/a", O_RDONLY).unwrap();
    assert_eq!(read_all(&mut fs, fd, data.len()), data);
    fs.close(fd).unwrap();
}

/// Moving a file into a subdirectory updates the parent.
#[test]
fn move_into_subdir() {
    let mut fs = fresh_fs();
    fs.mkdir("/sub").unwrap();
    let fd = fs.open("/item", O_RDWR | O_CREATE).unwrap();
    fs.write(fd, b"payload").unwrap();
    fs.close(fd).unwrap();

    fs.rename("/item", "/sub/item2").unwrap();
    assert_eq!(fs.open("/item", O_RDONLY).unwrap_err(), Error::NotFound);

    let fd = fs.open("/sub/item2", O_RDONLY).unwrap();
    assert_eq!(read_all(&mut fs, fd, 16), b"payload");
    fs.close(fd).unwrap();
}

/// Property 10: truncating to a block boundary frees the tail block;
/// one byte less rewrites the final partial page.
#[test]
fn truncate_at_and_near_block_boundary() {
    let mut fs = fresh_fs();
    let pgd = fs.device("/").unwrap().page_data_size() as usize;
    let head_cap = pgd * (PAGES as usize - 1);
    let block_cap = pgd * PAGES as usize;

    let total = head_cap + block_cap; // head block + one full data block
    let data = pattern(total, 99);
    let fd = fs.open("/t", O_RDWR | O_CREATE).unwrap();
    write_all(&mut fs, fd, &data);
    fs.flush(fd).unwrap();

    let free_before = fs.device("/").unwrap().erased_blocks();
    fs.ftruncate(fd, head_cap as u32).unwrap();
    assert_eq!(fs.fstat(fd).unwrap().len as usize, head_cap);
    let free_after = fs.device("/").unwrap().erased_blocks();
    assert_eq!(free_after, free_before + 1, "tail block was not freed");

    fs.ftruncate(fd, (head_cap - 1) as u32).unwrap();
    assert_eq!(fs.fstat(fd).unwrap().len as usize, head_cap - 1);

    fs.seek(fd, 0, Whence::Set).unwrap();
    let got = read_all(&mut fs, fd, head_cap);
    assert_eq!(got.len(), head_cap - 1);
    assert_eq!(&got[..], &data[..head_cap - 1]);
    fs.close(fd).unwrap();
}

/// Truncation to zero then rewrite works and keeps the length honest.
#[test]
fn truncate_to_zero_and_rewrite() {
    let mut fs = fresh_fs();
    let fd = fs.open("/z", O_RDWR | O_CREATE).unwrap();
    write_all(&mut fs, fd, &pattern(3000, 5));
    fs.ftruncate(fd, 0).unwrap();
    assert_eq!(fs.fstat(fd).unwrap().len, 0);

    fs.seek(fd, 0, Whence::Set).unwrap();
    fs.write(fd, b"fresh").unwrap();
    fs.seek(fd, 0, Whence::Set).unwrap();
    let got = read_all(&mut fs, fd, 16);
    fs.close(fd).unwrap();
    assert_eq!(got, b"fresh");
}

/// Open with O_TRUNC drops the old content.
#[test]
fn open_trunc_discards_content() {
    let mut fs = fresh_fs();
    let fd = fs.open("/c", O_RDWR | O_CREATE).unwrap();
    write_all(&mut fs, fd, &pattern(2000, 3));
    fs.close(fd).unwrap();

    let fd = fs.open("/c", O_RDWR | O_TRUNC).unwrap();
    assert_eq!(fs.fstat(fd).unwrap().len, 0);
    fs.close(fd).unwrap();
}

/// Property 12: a nearly full device refuses creation and fresh appends
/// with NoMem instead of corrupting anything.
#[test]
fn full_device_returns_nomem() {
    let mut fs = fresh_fs();
    let block_bytes = fs.device("/").unwrap().block_data_size() as usize;

    let fd = fs.open("/hog", O_RDWR | O_CREATE).unwrap();
    let chunk = pattern(block_bytes, 11);
    let mut hit_nomem = false;
    for _ in 0..BLOCKS as usize + 8 {
        let mut data = &chunk[..];
        let mut stalled = false;
        while !data.is_empty() {
            match fs.write(fd, data) {
                Ok(0) => {
                    stalled = true;
                    break;
                }
                Ok(n) => data = &data[n..],
                Err(Error::NoMem) => {
                    hit_nomem = true;
                    break;
                }
                Err(e) => panic!("unexpected write error: {:?}", e),
            }
        }
        if hit_nomem || stalled {
            break;
        }
    }
    assert!(hit_nomem, "device never reported NoMem");
    fs.close(fd).unwrap();

    assert_eq!(
        fs.open("/another", O_RDWR | O_CREATE).unwrap_err(),
        Error::NoMem
    );
    assert_eq!(fs.get_error(), -Error::NoMem.errno());

    // everything written so far is still intact after remount
    let dev = fs.unmount("/").unwrap();
    let flash = dev.release();
    let mut dev = Device::new(flash, DeviceConfig::new(0, (BLOCKS - 1) as u16)).unwrap();
    dev.mount().unwrap();
}

/// Directories: nesting, non-empty protection, removal.
#[test]
fn directory_lifecycle() {
    let mut fs = fresh_fs();
    fs.mkdir("/d1").unwrap();
    fs.mkdir("/d1/d2").unwrap();
    assert_eq!(fs.mkdir("/d1").unwrap_err(), Error::Exist);

    let fd = fs.open("/d1/d2/f", O_RDWR | O_CREATE).unwrap();
    fs.write(fd, b"x").unwrap();
    fs.close(fd).unwrap();

    assert_eq!(fs.rmdir("/d1").unwrap_err(), Error::NotEmpty);
    assert_eq!(fs.rmdir("/d1/d2").unwrap_err(), Error::NotEmpty);

    fs.remove("/d1/d2/f").unwrap();
    fs.rmdir("/d1/d2").unwrap();
    fs.rmdir("/d1").unwrap();

    let dh = fs.opendir("/").unwrap();
    assert!(fs.readdir(dh).unwrap().is_none());
    fs.closedir(dh).unwrap();
}

/// stat reports directory and file attributes.
#[test]
fn stat_reports_attributes() {
    let mut fs = fresh_fs();
    fs.mkdir("/dir").unwrap();
    let fd = fs.open("/dir/file", O_RDWR | O_CREATE).unwrap();
    fs.write(fd, b"abcde").unwrap();
    fs.close(fd).unwrap();

    let d = fs.stat("/dir").unwrap();
    assert!(d.info.is_dir());

    let f = fs.stat("/dir/file").unwrap();
    assert!(!f.info.is_dir());
    assert_eq!(f.len, 5);
    assert_eq!(f.info.name(), b"file");

    let root = fs.stat("/").unwrap();
    assert!(root.info.is_dir());
}

/// O_EXCL refuses an existing file; plain O_CREATE truncates it.
#[test]
fn create_excl_semantics() {
    let mut fs = fresh_fs();
    let fd = fs.open("/e", O_RDWR | O_CREATE).unwrap();
    fs.write(fd, b"old").unwrap();
    fs.close(fd).unwrap();

    assert_eq!(
        fs.open("/e", O_RDWR | O_CREATE | O_EXCL).unwrap_err(),
        Error::Exist
    );

    let fd = fs.open("/e", O_RDWR | O_CREATE).unwrap();
    assert_eq!(fs.fstat(fd).unwrap().len, 0);
    fs.close(fd).unwrap();
}

/// A missing path reports NotFound and feeds the errno mirror.
#[test]
fn missing_paths() {
    let mut fs = fresh_fs();
    assert_eq!(fs.open("/nope", O_RDONLY).unwrap_err(), Error::NotFound);
    assert_eq!(fs.get_error(), -Error::NotFound.errno());
    assert_eq!(
        fs.open("/no/dir/file", O_RDONLY).unwrap_err(),
        Error::NotFound
    );
    assert_eq!(fs.remove("/nope").unwrap_err(), Error::NotFound);
}

/// Rewinddir restarts the walk from the first entry.
#[test]
fn rewinddir_restarts() {
    let mut fs = fresh_fs();
    for name in ["/one", "/two", "/three"] {
        let fd = fs.open(name, O_RDWR | O_CREATE).unwrap();
        fs.close(fd).unwrap();
    }
    let dh = fs.opendir("/").unwrap();
    let mut first = 0;
    while fs.readdir(dh).unwrap().is_some() {
        first += 1;
    }
    fs.rewinddir(dh).unwrap();
    let mut second = 0;
    while fs.readdir(dh).unwrap().is_some() {
        second += 1;
    }
    fs.closedir(dh).unwrap();
    assert_eq!(first, 3);
    assert_eq!(second, 3);
}

/// The commit protocol never programs a spare more than twice between
/// erases, across a busy workload.
#[test]
fn spare_write_budget_holds() {
    let mut fs = fresh_fs();
    for i in 0..20 {
        let path = format!("/w{}", i);
        let fd = fs.open(&path, O_RDWR | O_CREATE).unwrap();
        write_all(&mut fs, fd, &pattern(1500, i));
        fs.close(fd).unwrap();
    }
    fs.remove("/w3").unwrap();
    fs.rename("/w4", "/w4x").unwrap();

    let dev = fs.unmount("/").unwrap();
    let flash = dev.release();
    assert!(flash.max_spare_writes() <= 2);
}

/// A single flipped bit anywhere in a page is healed transparently.
#[test]
fn bit_rot_is_corrected_end_to_end() {
    let mut fs = fresh_fs();
    let data = pattern(4000, 77);
    let fd = fs.open("/rot", O_RDWR | O_CREATE).unwrap();
    write_all(&mut fs, fd, &data);
    fs.close(fd).unwrap();

    // find the file's blocks by reading after poking bits in every block
    // that holds sealed data: flip one bit in page 1 of block 2 onwards
    let dev = fs.unmount("/").unwrap();
    let mut flash = dev.release();
    // locate a programmed page and flip one data bit
    let mut flipped = false;
    'outer: for block in 0..BLOCKS as u16 {
        for page in 1..PAGES as u16 {
            if flash.raw_data(block, page).iter().any(|&b| b != 0xFF) {
                flash.corrupt_bit(block, page, 17, 2);
                flipped = true;
                break 'outer;
            }
        }
    }
    assert!(flipped);

    let mut dev = Device::new(flash, DeviceConfig::new(0, (BLOCKS - 1) as u16)).unwrap();
    dev.mount().unwrap();
    let mut fs = FileSystem::new();
    fs.mount("/", dev).unwrap();

    let fd = fs.open("/rot", O_RDONLY).unwrap();
    let got = read_all(&mut fs, fd, data.len());
    fs.close(fd).unwrap();
    assert_eq!(got, data);
}

/// A block that starts failing on program is evacuated and retired without
/// losing the file.
#[test]
fn program_failure_triggers_block_cover() {
    let mut fs = fresh_fs();
    let data = pattern(2600, 13);
    let fd = fs.open("/victim", O_RDWR | O_CREATE).unwrap();
    write_all(&mut fs, fd, &data);
    fs.close(fd).unwrap();

    // make the file's head block fail on the next program
    let dev = fs.unmount("/").unwrap();
    let mut flash = dev.release();
    let mut target = None;
    'outer: for block in 0..BLOCKS as u16 {
        for page in 2..PAGES as u16 {
            if flash.raw_data(block, page).iter().any(|&b| b != 0xFF) {
                target = Some(block);
                break 'outer;
            }
        }
    }
    let target = target.unwrap();
    flash.inject_program_failure(target);

    let mut dev = Device::new(flash, DeviceConfig::new(0, (BLOCKS - 1) as u16)).unwrap();
    dev.mount().unwrap();
    let mut fs = FileSystem::new();
    fs.mount("/", dev).unwrap();

    // appending forces a write into the failing block; the engine must
    // cover to a fresh block and keep every byte
    let fd = fs.open("/victim", O_RDWR | O_APPEND).unwrap();
    write_all(&mut fs, fd, b"tail");
    fs.close(fd).unwrap();

    let fd = fs.open("/victim", O_RDONLY).unwrap();
    let got = read_all(&mut fs, fd, data.len() + 4);
    fs.close(fd).unwrap();
    assert_eq!(&got[..data.len()], &data[..]);
    assert_eq!(&got[data.len()..], b"tail");

    assert!(fs.device("/").unwrap().bad_blocks() >= 1);
}

/// Space accounting stays coherent through create and delete.
#[test]
fn space_accounting() {
    let mut fs = fresh_fs();
    let total = fs.space_total("/").unwrap();
    let free0 = fs.space_free("/").unwrap();
    assert_eq!(total, fs.space_used("/").unwrap() + free0);

    let fd = fs.open("/s", O_RDWR | O_CREATE).unwrap();
    write_all(&mut fs, fd, &pattern(5000, 1));
    fs.close(fd).unwrap();

    let free1 = fs.space_free("/").unwrap();
    assert!(free1 < free0);
    assert_eq!(total, fs.space_used("/").unwrap() + free1);

    fs.remove("/s").unwrap();
    let free2 = fs.space_free("/").unwrap();
    assert!(free2 >= free1);
}

/// Two devices mounted side by side stay independent.
#[test]
fn two_mounts_are_independent() {
    let dev_a = fresh_device(SimNand::new(geometry_512(64, 16)));
    let dev_b = fresh_device(SimNand::new(geometry_512(64, 16)));

    let mut fs = FileSystem::new();
    fs.mount("/a", dev_a).unwrap();
    fs.mount("/b", dev_b).unwrap();

    let fd = fs.open("/a/common", O_RDWR | O_CREATE).unwrap();
    fs.write(fd, b"alpha").unwrap();
    fs.close(fd).unwrap();

    let fd = fs.open("/b/common", O_RDWR | O_CREATE).unwrap();
    fs.write(fd, b"beta!").unwrap();
    fs.close(fd).unwrap();

    let fd = fs.open("/a/common", O_RDONLY).unwrap();
    assert_eq!(read_all(&mut fs, fd, 8), b"alpha");
    fs.close(fd).unwrap();

    let fd = fs.open("/b/common", O_RDONLY).unwrap();
    assert_eq!(read_all(&mut fs, fd, 8), b"beta!");
    fs.close(fd).unwrap();

    assert_eq!(fs.rename("/a/common", "/b/moved").unwrap_err(), Error::Inval);
}

/// In-place page updates: overwrite the middle of a file repeatedly.
#[test]
fn overwrite_in_place() {
    let mut fs = fresh_fs();
    let base = pattern(4000, 21);
    let fd = fs.open("/ow", O_RDWR | O_CREATE).unwrap();
    write_all(&mut fs, fd, &base);

    let mut expect = base.clone();
    for round in 0..8u32 {
        let patch = pattern(700, 1000 + round);
        let ofs = 512 + (round as usize * 311) % 2500;
        fs.seek(fd, ofs as i64, Whence::Set).unwrap();
        write_all(&mut fs, fd, &patch);
        expect[ofs..ofs + patch.len()].copy_from_slice(&patch);
    }

    fs.seek(fd, 0, Whence::Set).unwrap();
    assert_eq!(read_all(&mut fs, fd, expect.len()), expect);
    fs.close(fd).unwrap();

    // and it all still holds after a remount
    let dev = fs.unmount("/").unwrap();
    let flash = dev.release();
    let mut dev = Device::new(flash, DeviceConfig::new(0, (BLOCKS - 1) as u16)).unwrap();
    dev.mount().unwrap();
    let mut fs = FileSystem::new();
    fs.mount("/", dev).unwrap();
    let fd = fs.open("/ow", O_RDONLY).unwrap();
    assert_eq!(read_all(&mut fs, fd, expect.len()), expect);
    fs.close(fd).unwrap();
}

/// Opening a directory as a file (and vice versa) is rejected.
#[test]
fn type_confusion_rejected() {
    let mut fs = fresh_fs();
    fs.mkdir("/d").unwrap();
    assert!(fs.open("/d", O_RDONLY).is_err());

    let fd = fs.open("/f", O_RDWR | O_CREATE).unwrap();
    fs.close(fd).unwrap();
    assert!(fs.open("/f", O_RDONLY | O_DIR).is_err());
    // a file cannot shadow a directory name
    assert_eq!(fs.open("/d", O_RDWR | O_CREATE).unwrap_err(), Error::Exist);
}
