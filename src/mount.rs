//! The mount table and the fd-flavoured public API.
//!
//! A [`FileSystem`] owns any number of mounted devices plus the tables of
//! open file and directory handles. Every call resolves its path against the
//! longest matching mount point and runs on that device. Errors come back as
//! [`Error`] values; the classic negative-errno mirror is maintained on the
//! side for callers that expect it, and each open object keeps its own last
//! error as well.

use alloc::string::String;
use alloc::vec::Vec;

use nand_flash::NandFlash;

use crate::device::Device;
use crate::error::{Error, Result};
use crate::find::DirFinder;
use crate::object::{Object, ObjectInfo, Whence};
use crate::{O_DIR, O_RDONLY, O_RDWR, ROOT_DIR_SERIAL};

/// Open object handles per file system.
pub const MAX_OBJECT_HANDLES: usize = 10;
/// Open directory handles per file system.
pub const MAX_DIR_HANDLES: usize = 10;
/// File descriptors start here, leaving room for std streams.
pub const FD_OFFSET: i32 = 3;

struct Mount<F: NandFlash> {
    /// Normalized to always end with '/'.
    point: String,
    dev: Device<F>,
}

struct FdEntry {
    mount: usize,
    obj: Object,
}

struct DirHandle {
    mount: usize,
    finder: DirFinder,
}

/// The top-level file system context.
pub struct FileSystem<F: NandFlash> {
    mounts: Vec<Mount<F>>,
    fds: Vec<Option<FdEntry>>,
    dirs: Vec<Option<DirHandle>>,
    errno: i32,
}

impl<F: NandFlash> Default for FileSystem<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: NandFlash> FileSystem<F> {
    pub fn new() -> FileSystem<F> {
        FileSystem {
            mounts: Vec::new(),
            fds: (0..MAX_OBJECT_HANDLES).map(|_| None).collect(),
            dirs: (0..MAX_DIR_HANDLES).map(|_| None).collect(),
            errno: 0,
        }
    }

    fn normalize(point: &str) -> String {
        let mut p = String::from(point);
        if !p.ends_with('/') {
            p.push('/');
        }
        p
    }

    /// Mount a device. The device is scanned here if it wasn't already.
    pub fn mount(&mut self, point: &str, mut dev: Device<F>) -> Result<()> {
        let point = Self::normalize(point);
        if self.mounts.iter().any(|m| m.point == point) {
            return self.fail(Error::Exist);
        }
        if !dev.is_mounted() {
            if let Err(e) = dev.mount() {
                return self.fail(e);
            }
        }
        info!("mounted device at {}", point.as_str());
        self.mounts.push(Mount { point, dev });
        Ok(())
    }

    /// Unmount and hand the device back. Refused while handles are open.
    pub fn unmount(&mut self, point: &str) -> Result<Device<F>> {
        let point = Self::normalize(point);
        let idx = match self.mounts.iter().position(|m| m.point == point) {
            Some(i) => i,
            None => return self.fail(Error::NotFound),
        };
        let busy = self
            .fds
            .iter()
            .flatten()
            .any(|e| e.mount == idx)
            || self.dirs.iter().flatten().any(|d| d.mount == idx);
        if busy {
            return self.fail(Error::Access);
        }

        let r = self.mounts[idx].dev.unmount();
        self.track(r)?;
        let m = self.mounts.remove(idx);
        // surviving handles keep referring to their mounts by index
        for e in self.fds.iter_mut().flatten() {
            if e.mount > idx {
                e.mount -= 1;
            }
        }
        for d in self.dirs.iter_mut().flatten() {
            if d.mount > idx {
                d.mount -= 1;
            }
        }
        Ok(m.dev)
    }

    /// Longest-prefix mount lookup; returns the mount index and the path
    /// remainder relative to it.
    fn resolve<'a>(&self, path: &'a str) -> Result<(usize, &'a str)> {
        let mut best: Option<(usize, usize)> = None;
        for (i, m) in self.mounts.iter().enumerate() {
            let point = m.point.as_str();
            let matched = if path.starts_with(point) {
                Some(point.len())
            } else if path == &point[..point.len() - 1] {
                Some(path.len())
            } else {
                None
            };
            if let Some(len) = matched {
                if best.map_or(true, |(_, l)| len > l) {
                    best = Some((i, len));
                }
            }
        }
        match best {
            Some((i, len)) => Ok((i, &path[len.min(path.len())..])),
            None => Err(Error::NotFound),
        }
    }

    fn fail<T>(&mut self, e: Error) -> Result<T> {
        self.errno = -e.errno();
        Err(e)
    }

    fn track<T>(&mut self, r: Result<T>) -> Result<T> {
        if let Err(e) = &r {
            self.errno = -e.errno();
        }
        r
    }

    /// The process-wide errno mirror (negative error codes).
    pub fn get_error(&self) -> i32 {
        self.errno
    }

    pub fn set_error(&mut self, err: i32) -> i32 {
        self.errno = err;
        err
    }

    /// Last error recorded on one open object, taking priority over the
    /// mirror when both are set.
    pub fn object_error(&self, fd: i32) -> Result<Option<Error>> {
        let idx = self.fd_index(fd)?;
        Ok(self.fds[idx].as_ref().and_then(|e| e.obj.last_error()))
    }

    /// Validate an fd and return the table index.
    fn fd_index(&self, fd: i32) -> Result<usize> {
        let idx = fd - FD_OFFSET;
        if idx < 0
            || idx as usize >= MAX_OBJECT_HANDLES
            || self.fds[idx as usize].is_none()
        {
            return Err(Error::BadHandle);
        }
        Ok(idx as usize)
    }

    fn dir_index(&self, dirh: i32) -> Result<usize> {
        if dirh < 0 || dirh as usize >= MAX_DIR_HANDLES || self.dirs[dirh as usize].is_none() {
            return Err(Error::BadHandle);
        }
        Ok(dirh as usize)
    }

    // ---- file API ----

    pub fn open(&mut self, path: &str, oflag: u32) -> Result<i32> {
        let slot = match self.fds.iter().position(|e| e.is_none()) {
            Some(s) => s,
            None => return self.fail(Error::TooManyHandles),
        };
        let r = self.resolve(path);
        let (mount, rel) = self.track(r)?;
        let r = self.mounts[mount].dev.open_object(rel, oflag);
        let obj = self.track(r)?;
        self.fds[slot] = Some(FdEntry { mount, obj });
        Ok(slot as i32 + FD_OFFSET)
    }

    pub fn close(&mut self, fd: i32) -> Result<()> {
        let r = self.fd_index(fd);
        let idx = self.track(r)?;
        let entry = self.fds[idx].take().ok_or(Error::BadHandle)?;
        let mut obj = entry.obj;
        let r = self.mounts[entry.mount].dev.object_close(&mut obj);
        self.track(r)
    }

    pub fn read(&mut self, fd: i32, out: &mut [u8]) -> Result<usize> {
        let r = self.fd_index(fd);
        let idx = self.track(r)?;
        let e = self.fds[idx].as_mut().ok_or(Error::BadHandle)?;
        let m = e.mount;
        let r = self.mounts[m].dev.object_read(&mut e.obj, out);
        self.track(r)
    }

    pub fn write(&mut self, fd: i32, data: &[u8]) -> Result<usize> {
        let r = self.fd_index(fd);
        let idx = self.track(r)?;
        let e = self.fds[idx].as_mut().ok_or(Error::BadHandle)?;
        let m = e.mount;
        let r = self.mounts[m].dev.object_write(&mut e.obj, data);
        self.track(r)
    }

    pub fn seek(&mut self, fd: i32, offset: i64, whence: Whence) -> Result<u32> {
        let r = self.fd_index(fd);
        let idx = self.track(r)?;
        let e = self.fds[idx].as_mut().ok_or(Error::BadHandle)?;
        let m = e.mount;
        let r = self.mounts[m].dev.object_seek(&mut e.obj, offset, whence);
        self.track(r)
    }

    pub fn tell(&mut self, fd: i32) -> Result<u32> {
        let r = self.fd_index(fd);
        let idx = self.track(r)?;
        let e = self.fds[idx].as_ref().ok_or(Error::BadHandle)?;
        let m = e.mount;
        Ok(self.mounts[m].dev.object_tell(&e.obj))
    }

    pub fn eof(&mut self, fd: i32) -> Result<bool> {
        let r = self.fd_index(fd);
        let idx = self.track(r)?;
        let e = self.fds[idx].as_ref().ok_or(Error::BadHandle)?;
        let m = e.mount;
        Ok(self.mounts[m].dev.object_eof(&e.obj))
    }

    pub fn flush(&mut self, fd: i32) -> Result<()> {
        let r = self.fd_index(fd);
        let idx = self.track(r)?;
        let e = self.fds[idx].as_ref().ok_or(Error::BadHandle)?;
        let m = e.mount;
        let obj = e.obj.clone();
        let r = self.mounts[m].dev.object_flush(&obj);
        self.track(r)
    }

    pub fn ftruncate(&mut self, fd: i32, len: u32) -> Result<()> {
        let r = self.fd_index(fd);
        let idx = self.track(r)?;
        let e = self.fds[idx].as_mut().ok_or(Error::BadHandle)?;
        let m = e.mount;
        let r = self.mounts[m].dev.object_truncate(&mut e.obj, len);
        self.track(r)
    }

    pub fn fstat(&mut self, fd: i32) -> Result<ObjectInfo> {
        let r = self.fd_index(fd);
        let idx = self.track(r)?;
        let e = self.fds[idx].as_ref().ok_or(Error::BadHandle)?;
        let m = e.mount;
        let obj = e.obj.clone();
        let r = self.mounts[m].dev.object_stat(&obj);
        self.track(r)
    }

    pub fn stat(&mut self, path: &str) -> Result<ObjectInfo> {
        let r = self.resolve(path);
        let (mount, rel) = self.track(r)?;
        let dev = &mut self.mounts[mount].dev;
        let opened = match dev.open_object(rel, O_RDONLY) {
            Ok(obj) => Ok(obj),
            Err(_) => dev.open_object(rel, O_RDONLY | O_DIR),
        };
        let r = match opened {
            Ok(obj) => dev.object_stat(&obj),
            Err(e) => Err(e),
        };
        self.track(r)
    }

    /// No symlinks exist down here; identical to [`FileSystem::stat`].
    pub fn lstat(&mut self, path: &str) -> Result<ObjectInfo> {
        self.stat(path)
    }

    pub fn rename(&mut self, old_path: &str, new_path: &str) -> Result<()> {
        let r = self.resolve(old_path);
        let (old_mount, old_rel) = self.track(r)?;
        let r = self.resolve(new_path);
        let (new_mount, new_rel) = self.track(r)?;
        if old_mount != new_mount {
            warn!("rename across mount points");
            return self.fail(Error::Inval);
        }
        let r = self.mounts[old_mount].dev.rename_object(old_rel, new_rel);
        self.track(r)
    }

    pub fn remove(&mut self, path: &str) -> Result<()> {
        let r = self.resolve(path);
        let (mount, rel) = self.track(r)?;
        let r = self.mounts[mount].dev.delete_object(rel, false);
        self.track(r)
    }

    pub fn mkdir(&mut self, path: &str) -> Result<()> {
        let fd = self.open(path, O_RDWR | crate::O_CREATE | crate::O_EXCL | O_DIR)?;
        self.close(fd)
    }

    pub fn rmdir(&mut self, path: &str) -> Result<()> {
        let r = self.resolve(path);
        let (mount, rel) = self.track(r)?;
        let r = self.mounts[mount].dev.delete_object(rel, true);
        self.track(r)
    }

    // ---- directory iteration ----

    pub fn opendir(&mut self, path: &str) -> Result<i32> {
        let slot = match self.dirs.iter().position(|e| e.is_none()) {
            Some(s) => s,
            None => return self.fail(Error::TooManyHandles),
        };
        let r = self.resolve(path);
        let (mount, rel) = self.track(r)?;
        let r = self.mounts[mount].dev.open_object(rel, O_RDONLY | O_DIR);
        let obj = self.track(r)?;
        let serial = if rel.is_empty() {
            ROOT_DIR_SERIAL
        } else {
            obj.serial()
        };
        self.dirs[slot] = Some(DirHandle {
            mount,
            finder: DirFinder::new(serial),
        });
        Ok(slot as i32)
    }

    pub fn readdir(&mut self, dirh: i32) -> Result<Option<ObjectInfo>> {
        let r = self.dir_index(dirh);
        let idx = self.track(r)?;
        let d = self.dirs[idx].as_mut().ok_or(Error::BadHandle)?;
        let m = d.mount;
        let mut finder = d.finder.clone();
        let r = self.mounts[m].dev.find_next_object(&mut finder);
        if let Some(d) = self.dirs[idx].as_mut() {
            d.finder = finder;
        }
        self.track(r)
    }

    pub fn rewinddir(&mut self, dirh: i32) -> Result<()> {
        let r = self.dir_index(dirh);
        let idx = self.track(r)?;
        if let Some(d) = self.dirs[idx].as_mut() {
            d.finder.rewind();
        }
        Ok(())
    }

    pub fn closedir(&mut self, dirh: i32) -> Result<()> {
        let r = self.dir_index(dirh);
        let idx = self.track(r)?;
        self.dirs[idx] = None;
        Ok(())
    }

    // ---- whole-device operations ----

    pub fn format(&mut self, point: &str) -> Result<()> {
        let r = self.resolve(point);
        let (mount, _) = self.track(r)?;
        let busy = self.fds.iter().flatten().any(|e| e.mount == mount)
            || self.dirs.iter().flatten().any(|d| d.mount == mount);
        if busy {
            return self.fail(Error::Access);
        }
        let r = self.mounts[mount].dev.format();
        self.track(r)
    }

    pub fn space_total(&mut self, point: &str) -> Result<u32> {
        let r = self.resolve(point);
        let (mount, _) = self.track(r)?;
        Ok(self.mounts[mount].dev.space_total())
    }

    pub fn space_used(&mut self, point: &str) -> Result<u32> {
        let r = self.resolve(point);
        let (mount, _) = self.track(r)?;
        Ok(self.mounts[mount].dev.space_used())
    }

    pub fn space_free(&mut self, point: &str) -> Result<u32> {
        let r = self.resolve(point);
        let (mount, _) = self.track(r)?;
        Ok(self.mounts[mount].dev.space_free())
    }

    /// Borrow a mounted device, e.g. for statistics.
    pub fn device(&self, point: &str) -> Option<&Device<F>> {
        let point = Self::normalize(point);
        self.mounts
            .iter()
            .find(|m| m.point == point)
            .map(|m| &m.dev)
    }
}
