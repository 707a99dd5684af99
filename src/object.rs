//! The object layer: files and directories over the tree and buffers.
//!
//! An [`Object`] is a lightweight open handle: the object's identity plus a
//! byte position. All real state lives in the tree (looked up by serial on
//! every call), so handles survive block covers and recovery without
//! invalidation.

use nand_flash::NandFlash;

use crate::blockinfo::ALL_PAGES;
use crate::device::Device;
use crate::error::{Error, Result};
use crate::tag::{next_block_ts, sum16, ObjectType, Tag};
use crate::tree::NodeData;
use crate::{
    FILE_ATTR_DIR, FILE_ATTR_WRITE, MAX_FILENAME_LENGTH, O_APPEND, O_CREATE, O_DIR, O_EXCL,
    O_RDWR, O_TRUNC, O_WRONLY, PARENT_OF_ROOT, ROOT_DIR_SERIAL,
};

/// The on-flash info record in page 0 of every FILE and DIR block. The
/// encoded layout (24 bytes of little-endian fields plus the name area) is
/// part of the persistent format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileInfo {
    pub attr: u32,
    pub create_time: u32,
    pub last_modify: u32,
    pub access: u32,
    pub reserved: u32,
    pub name_len: u32,
    pub name: [u8; MAX_FILENAME_LENGTH],
}

impl FileInfo {
    pub const ENCODED_LEN: usize = 24 + MAX_FILENAME_LENGTH;

    pub fn new(name: &[u8], attr: u32, now: u32) -> FileInfo {
        let mut fi = FileInfo {
            attr,
            create_time: now,
            last_modify: now,
            access: 0,
            reserved: 0,
            name_len: name.len() as u32,
            name: [0; MAX_FILENAME_LENGTH],
        };
        fi.name[..name.len()].copy_from_slice(name);
        fi
    }

    pub fn name(&self) -> &[u8] {
        let len = (self.name_len as usize).min(MAX_FILENAME_LENGTH);
        &self.name[..len]
    }

    pub fn set_name(&mut self, name: &[u8]) {
        self.name = [0; MAX_FILENAME_LENGTH];
        self.name[..name.len()].copy_from_slice(name);
        self.name_len = name.len() as u32;
    }

    pub fn is_dir(&self) -> bool {
        self.attr & FILE_ATTR_DIR != 0
    }

    pub fn encode(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&self.attr.to_le_bytes());
        out[4..8].copy_from_slice(&self.create_time.to_le_bytes());
        out[8..12].copy_from_slice(&self.last_modify.to_le_bytes());
        out[12..16].copy_from_slice(&self.access.to_le_bytes());
        out[16..20].copy_from_slice(&self.reserved.to_le_bytes());
        out[20..24].copy_from_slice(&self.name_len.to_le_bytes());
        out[24..24 + MAX_FILENAME_LENGTH].copy_from_slice(&self.name);
    }

    pub fn decode(data: &[u8]) -> FileInfo {
        let mut name = [0u8; MAX_FILENAME_LENGTH];
        name.copy_from_slice(&data[24..24 + MAX_FILENAME_LENGTH]);
        FileInfo {
            attr: u32::from_le_bytes(data[0..4].try_into().unwrap()),
            create_time: u32::from_le_bytes(data[4..8].try_into().unwrap()),
            last_modify: u32::from_le_bytes(data[8..12].try_into().unwrap()),
            access: u32::from_le_bytes(data[12..16].try_into().unwrap()),
            reserved: u32::from_le_bytes(data[16..20].try_into().unwrap()),
            name_len: u32::from_le_bytes(data[20..24].try_into().unwrap()),
            name,
        }
    }
}

/// Info record plus the derived bits callers usually want.
#[derive(Debug, Clone, Copy)]
pub struct ObjectInfo {
    pub info: FileInfo,
    pub len: u32,
    pub serial: u16,
}

/// Where to seek from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Cur = 0,
    Set = 1,
    End = 2,
}

/// An open file or directory.
#[derive(Debug, Clone)]
pub struct Object {
    pub(crate) kind: ObjectType,
    pub(crate) parent: u16,
    pub(crate) serial: u16,
    pub(crate) oflag: u32,
    pub(crate) pos: u32,
    pub(crate) open_ok: bool,
    /// Object-scoped error, the last one recorded on this handle.
    pub(crate) err: Option<Error>,
}

impl Object {
    fn root() -> Object {
        Object {
            kind: ObjectType::Dir,
            parent: PARENT_OF_ROOT,
            serial: ROOT_DIR_SERIAL,
            oflag: O_DIR,
            pos: 0,
            open_ok: true,
            err: None,
        }
    }

    pub fn serial(&self) -> u16 {
        self.serial
    }

    pub fn is_dir(&self) -> bool {
        self.kind == ObjectType::Dir
    }

    pub fn last_error(&self) -> Option<Error> {
        self.err
    }

    fn writable(&self) -> bool {
        self.oflag & (O_WRONLY | O_RDWR) != 0
    }

    fn readable(&self) -> bool {
        self.oflag & O_WRONLY == 0
    }
}

fn strip_dir_slash(name: &str) -> &str {
    name.strip_suffix('/').unwrap_or(name)
}

impl<F: NandFlash> Device<F> {
    /// Resolve a mount-relative path into `(parent dir serial, entry name)`.
    /// The empty path resolves to the root itself.
    pub(crate) fn parse_path<'a>(&mut self, path: &'a str) -> Result<(u16, &'a str)> {
        if path.is_empty() {
            return Ok((PARENT_OF_ROOT, ""));
        }

        let trimmed = path.strip_suffix('/').unwrap_or(path);
        let (dir_part, name) = match trimmed.rfind('/') {
            Some(idx) => (&path[..idx], &path[idx + 1..]),
            None => ("", path),
        };

        let mut dir = ROOT_DIR_SERIAL;
        for comp in dir_part.split('/').filter(|c| !c.is_empty()) {
            let sum = sum16(comp.as_bytes());
            match self.find_dir_by_name(comp.as_bytes(), sum, dir)? {
                Some(node) => dir = self.tree.node(node).data.serial(),
                None => return Err(Error::NotFound),
            }
        }
        Ok((dir, name))
    }

    /// Open (and possibly create) an object by mount-relative path.
    pub(crate) fn open_object(&mut self, path: &str, oflag: u32) -> Result<Object> {
        if oflag & O_WRONLY != 0 && oflag & O_RDWR != 0 {
            return Err(Error::Inval);
        }
        let is_dir = oflag & O_DIR != 0;
        let (parent, raw_name) = self.parse_path(path)?;

        let name = if is_dir {
            strip_dir_slash(raw_name)
        } else {
            if raw_name.is_empty() || raw_name.ends_with('/') {
                return Err(Error::Inval);
            }
            raw_name
        };

        if is_dir && name.is_empty() {
            // only the mount root has an empty name
            if parent != PARENT_OF_ROOT {
                return Err(Error::Inval);
            }
            let mut root = Object::root();
            root.oflag = oflag | O_DIR;
            return Ok(root);
        }
        let parent = if parent == PARENT_OF_ROOT {
            return Err(Error::Inval);
        } else {
            parent
        };
        if name.len() > MAX_FILENAME_LENGTH {
            return Err(Error::Inval);
        }

        let sum = sum16(name.as_bytes());
        let node = if is_dir {
            self.find_dir_by_name(name.as_bytes(), sum, parent)?
        } else {
            self.find_file_by_name(name.as_bytes(), sum, parent)?
        };

        match node {
            None => {
                if oflag & O_CREATE != 0 {
                    self.create_object(parent, name, oflag)
                } else {
                    Err(Error::NotFound)
                }
            }
            Some(node) => {
                if oflag & (O_CREATE | O_EXCL) == (O_CREATE | O_EXCL) {
                    return Err(Error::Exist);
                }
                let serial = self.tree.node(node).data.serial();
                let mut obj = Object {
                    kind: if is_dir { ObjectType::Dir } else { ObjectType::File },
                    parent,
                    serial,
                    oflag,
                    pos: 0,
                    open_ok: true,
                    err: None,
                };
                if oflag & O_TRUNC != 0 && !is_dir {
                    self.object_truncate(&mut obj, 0)?;
                }
                Ok(obj)
            }
        }
    }

    /// Create a fresh object under `parent`: allocate a serial, lay down the
    /// info page and flush so the tree node exists before returning.
    pub(crate) fn create_object(&mut self, parent: u16, name: &str, oflag: u32) -> Result<Object> {
        let is_dir = oflag & O_DIR != 0;
        let name = strip_dir_slash(name);
        if name.is_empty() {
            return Err(Error::NotFound);
        }
        if name.len() > MAX_FILENAME_LENGTH {
            return Err(Error::Inval);
        }
        let sum = sum16(name.as_bytes());

        // a name is unique across both namespaces of its directory
        if is_dir {
            if self.find_file_by_name(name.as_bytes(), sum, parent)?.is_some()
                || self.find_dir_by_name(name.as_bytes(), sum, parent)?.is_some()
            {
                return Err(Error::Exist);
            }
        } else {
            if self.find_dir_by_name(name.as_bytes(), sum, parent)?.is_some() {
                return Err(Error::Exist);
            }
            if let Some(node) = self.find_file_by_name(name.as_bytes(), sum, parent)? {
                // creating over an existing file truncates it
                let mut obj = Object {
                    kind: ObjectType::File,
                    parent,
                    serial: self.tree.node(node).data.serial(),
                    oflag,
                    pos: 0,
                    open_ok: true,
                    err: None,
                };
                self.object_truncate(&mut obj, 0)?;
                return Ok(obj);
            }
        }

        let serial = self.tree.find_free_serial().ok_or(Error::NoMem)?;
        if self.tree.erased_count < self.cfg.min_erased_blocks {
            debug!("create refused, only {} erased blocks", self.tree.erased_count);
            return Err(Error::NoMem);
        }
        self.tree.reserve_serial(serial);

        let kind = if is_dir { ObjectType::Dir } else { ObjectType::File };
        let result: Result<()> = (|| {
            let attr = FILE_ATTR_WRITE | if is_dir { FILE_ATTR_DIR } else { 0 };
            let fi = FileInfo::new(name.as_bytes(), attr, (self.cfg.now)());
            let mut enc = [0u8; FileInfo::ENCODED_LEN];
            fi.encode(&mut enc);

            let b = self.buf_new(kind, parent, serial, 0)?;
            let w = self.buf_write(b, &enc, 0, FileInfo::ENCODED_LEN as u32);
            self.buf_put(b);
            w?;
            self.buf_flush_group(parent, serial, false)
        })();
        self.tree.release_serial(serial);
        result?;

        let node = match kind {
            ObjectType::Dir => self.tree.find_dir(serial),
            _ => self.tree.find_file(serial),
        };
        if node.is_none() {
            error!("created object {} did not reach the tree", serial);
            return Err(Error::Io);
        }

        self.drain_pending();
        Ok(Object {
            kind,
            parent,
            serial,
            oflag,
            pos: 0,
            open_ok: true,
            err: None,
        })
    }

    pub(crate) fn obj_node(&self, obj: &Object) -> Result<u16> {
        match obj.kind {
            ObjectType::Dir => self.tree.find_dir(obj.serial),
            _ => self.tree.find_file(obj.serial),
        }
        .ok_or(Error::BadHandle)
    }

    pub(crate) fn obj_len(&self, obj: &Object) -> u32 {
        match obj.kind {
            ObjectType::File => match self.obj_node(obj) {
                Ok(n) => match self.tree.node(n).data {
                    NodeData::File { len, .. } => len,
                    _ => 0,
                },
                Err(_) => 0,
            },
            _ => 0,
        }
    }

    fn set_file_len(&mut self, obj: &Object, new_len: u32) {
        if let Ok(n) = self.obj_node(obj) {
            if let NodeData::File { len, .. } = &mut self.tree.node_mut(n).data {
                *len = new_len;
            }
        }
    }

    // ---- byte-position to block/page addressing ----

    fn head_capacity(&self) -> u32 {
        (self.com.pages_per_block as u32 - 1) * self.com.pg_data_size
    }

    fn block_capacity(&self) -> u32 {
        self.com.pages_per_block as u32 * self.com.pg_data_size
    }

    /// The file-block index holding byte `pos`: 0 is the head block, data
    /// blocks count from 1.
    fn fdn_of(&self, pos: u32) -> u16 {
        let head = self.head_capacity();
        if pos < head {
            0
        } else {
            (1 + (pos - head) / self.block_capacity()) as u16
        }
    }

    fn fdn_start(&self, fdn: u16) -> u32 {
        if fdn == 0 {
            0
        } else {
            self.head_capacity() + (fdn as u32 - 1) * self.block_capacity()
        }
    }

    // ---- read / write / seek ----

    pub(crate) fn object_read(&mut self, obj: &mut Object, out: &mut [u8]) -> Result<usize> {
        if !obj.open_ok {
            return Err(Error::BadHandle);
        }
        if obj.kind == ObjectType::Dir {
            return Err(Error::Access);
        }
        if !obj.readable() {
            return Err(Error::Access);
        }
        let node = self.obj_node(obj)?;
        let flen = self.obj_len(obj);
        if obj.pos > flen {
            return Ok(0);
        }

        let pgd = self.com.pg_data_size;
        let mut done = 0usize;
        while done < out.len() {
            let read_start = obj.pos + done as u32;
            if read_start >= flen {
                break;
            }

            let fdn = self.fdn_of(read_start);
            let (kind, dnode) = if fdn == 0 {
                (ObjectType::File, node)
            } else {
                match self.tree.find_data(obj.serial, fdn) {
                    Some(n) => (ObjectType::Data, n),
                    None => {
                        error!("file {} lost data block {}", obj.serial, fdn);
                        obj.err = Some(Error::Io);
                        break;
                    }
                }
            };

            let mut page_id = ((read_start - self.fdn_start(fdn)) / pgd) as u16;
            if fdn == 0 {
                // page 0 of the head block is the info record
                page_id += 1;
            }

            let b = self.buf_get_ex(kind, dnode, page_id)?;
            let page_ofs = read_start % pgd;
            let data_len = self.buf.buf(b).data_len as u32;
            if page_ofs >= data_len {
                self.buf_put(b);
                break;
            }
            let want = (out.len() - done) as u32;
            let size = want.min(data_len - page_ofs);
            self.buf_read(b, &mut out[done..done + size as usize], page_ofs);
            self.buf_put(b);
            done += size as usize;
        }

        obj.pos += done as u32;
        self.drain_pending();
        Ok(done)
    }

    pub(crate) fn object_write(&mut self, obj: &mut Object, data: &[u8]) -> Result<usize> {
        if !obj.open_ok {
            return Err(Error::BadHandle);
        }
        if obj.kind == ObjectType::Dir {
            return Err(Error::Access);
        }
        if !obj.writable() {
            return Err(Error::Access);
        }
        self.obj_node(obj)?;

        if obj.oflag & O_APPEND != 0 {
            obj.pos = self.obj_len(obj);
        }
        if obj.pos > self.obj_len(obj) {
            return Ok(0);
        }

        let mut done = 0usize;
        while done < data.len() {
            let write_start = obj.pos + done as u32;
            let flen = self.obj_len(obj);
            if write_start > flen {
                break;
            }
            let fdn = self.fdn_of(write_start);

            let n = if write_start == flen && fdn > 0 && write_start == self.fdn_start(fdn) {
                // a brand-new data block
                if self.tree.erased_count < self.cfg.min_erased_blocks {
                    debug!("append refused, device nearly full");
                    if done == 0 {
                        obj.err = Some(Error::NoMem);
                        return Err(Error::NoMem);
                    }
                    break;
                }
                let n = self.write_new_block(obj, &data[done..], fdn)?;
                // flush now so the data node reaches the tree
                self.buf_flush_group(obj.serial, fdn, false)?;
                n
            } else {
                let dnode = if fdn == 0 {
                    self.obj_node(obj)?
                } else {
                    self.tree
                        .find_data(obj.serial, fdn)
                        .ok_or(Error::Io)?
                };
                self.write_internal_block(
                    obj,
                    dnode,
                    fdn,
                    &data[done..],
                    write_start - self.fdn_start(fdn),
                )?
            };

            if n == 0 {
                break;
            }
            done += n;
        }

        obj.pos += done as u32;
        self.drain_pending();
        Ok(done)
    }

    /// Fill a fresh DATA block through new buffers.
    fn write_new_block(&mut self, obj: &Object, data: &[u8], fdn: u16) -> Result<usize> {
        let pgd = self.com.pg_data_size as usize;
        let mut wrote = 0usize;

        for page_id in 0..self.com.pages_per_block {
            let size = pgd.min(data.len() - wrote);
            if size == 0 {
                break;
            }
            let b = self.buf_new(ObjectType::Data, obj.serial, fdn, page_id)?;
            let res = self.buf_write(b, &data[wrote..wrote + size], 0, size as u32);
            self.buf_put(b);
            res?;
            wrote += size;
            let flen = self.obj_len(obj);
            self.set_file_len(obj, flen + size as u32);
        }
        Ok(wrote)
    }

    /// Write into the head block or an existing data block, page by page.
    fn write_internal_block(
        &mut self,
        obj: &Object,
        dnode: u16,
        fdn: u16,
        data: &[u8],
        mut block_ofs: u32,
    ) -> Result<usize> {
        let pgd = self.com.pg_data_size;
        let block_start = self.fdn_start(fdn);

        // head-page ids run 1..=ppb-1, data-page ids 0..=ppb-1
        let max_page_id = self.com.pages_per_block - 1;
        let (kind, parent, serial) = if fdn == 0 {
            let parent = self.tree.node(dnode).data.parent();
            (ObjectType::File, parent, obj.serial)
        } else {
            (ObjectType::Data, obj.serial, fdn)
        };

        let mut wrote = 0usize;
        while wrote < data.len() {
            let mut page_id = (block_ofs / pgd) as u16;
            if fdn == 0 {
                page_id += 1;
            }
            if page_id > max_page_id {
                break;
            }

            let page_ofs = block_ofs % pgd;
            let size = ((pgd - page_ofs) as usize).min(data.len() - wrote);
            let flen = self.obj_len(obj);

            let b = if flen % pgd == 0 && block_start + block_ofs == flen {
                // appending exactly at a page boundary: nothing to load
                self.buf_new(kind, parent, serial, page_id)?
            } else {
                self.buf_get_ex(kind, dnode, page_id)?
            };
            let res = self.buf_write(b, &data[wrote..wrote + size], page_ofs, size as u32);
            self.buf_put(b);
            res?;

            wrote += size;
            block_ofs += size as u32;
            if block_start + block_ofs > flen {
                self.set_file_len(obj, block_start + block_ofs);
            }
        }
        Ok(wrote)
    }

    pub(crate) fn object_seek(&mut self, obj: &mut Object, offset: i64, whence: Whence) -> Result<u32> {
        if !obj.open_ok {
            return Err(Error::BadHandle);
        }
        if obj.kind == ObjectType::Dir {
            return Err(Error::Access);
        }
        let len = self.obj_len(obj) as i64;
        let base = match whence {
            Whence::Cur => obj.pos as i64,
            Whence::Set => 0,
            Whence::End => len,
        };
        let target = (base + offset).clamp(0, len);
        obj.pos = target as u32;
        Ok(obj.pos)
    }

    pub(crate) fn object_tell(&self, obj: &Object) -> u32 {
        obj.pos
    }

    pub(crate) fn object_eof(&self, obj: &Object) -> bool {
        obj.kind == ObjectType::File && obj.pos >= self.obj_len(obj)
    }

    // ---- truncate ----

    pub(crate) fn object_truncate(&mut self, obj: &mut Object, remain: u32) -> Result<()> {
        if !obj.open_ok {
            return Err(Error::BadHandle);
        }
        if obj.kind == ObjectType::Dir {
            return Err(Error::Exist);
        }
        self.obj_node(obj)?;
        if remain >= self.obj_len(obj) {
            return Ok(());
        }

        // a dry run first: nothing is destroyed if some buffer is pinned
        self.truncate_pass(obj, remain, true)?;
        self.truncate_pass(obj, remain, false)?;
        self.drain_pending();
        Ok(())
    }

    fn truncate_pass(&mut self, obj: &mut Object, remain: u32, dry_run: bool) -> Result<()> {
        let mut flen = self.obj_len(obj);

        while flen > remain {
            let fdn = self.fdn_of(flen - 1);
            let block_start = self.fdn_start(fdn);

            if remain <= block_start && fdn > 0 {
                // the whole data block goes away
                let node = self.tree.find_data(obj.serial, fdn).ok_or(Error::Io)?;
                for page in 0..self.com.pages_per_block {
                    if let Some(b) = self.buf_find(obj.serial, fdn, page) {
                        if !self.buf_is_free(b) {
                            obj.err = Some(Error::Exist);
                            return Err(Error::Exist);
                        }
                        if !dry_run {
                            self.buf_mark_empty(b);
                        }
                    }
                }
                if !dry_run {
                    let block = self.tree.node(node).data.block();
                    let h = self.bc_get(block);
                    self.bc_expire(h, ALL_PAGES);
                    self.bc_put(h);
                    self.tree.break_from(node);
                    self.tree.node_mut(node).data = NodeData::List {
                        block,
                        need_check: false,
                    };
                    if self.tree_erase_node(node)? {
                        self.tree.push_erased_tail(node, Some(false));
                    }
                    self.set_file_len(obj, block_start);
                }
                flen = block_start;
            } else {
                self.truncate_within_block(obj, fdn, remain, dry_run)?;
                if !dry_run {
                    self.set_file_len(obj, remain);
                }
                flen = remain;
            }
        }
        Ok(())
    }

    /// Rewrite one block via cover, cutting it at `remain` and zero-filling
    /// the partial page.
    fn truncate_within_block(
        &mut self,
        obj: &mut Object,
        fdn: u16,
        remain: u32,
        dry_run: bool,
    ) -> Result<()> {
        let file_node = self.obj_node(obj)?;
        let (node, kind, max_page_id, bparent, bserial) = if fdn == 0 {
            let parent = self.tree.node(file_node).data.parent();
            (
                file_node,
                ObjectType::File,
                self.com.pages_per_block - 1,
                parent,
                obj.serial,
            )
        } else {
            let n = self.tree.find_data(obj.serial, fdn).ok_or(Error::Io)?;
            (
                n,
                ObjectType::Data,
                self.com.pages_per_block - 1,
                obj.serial,
                fdn,
            )
        };

        if dry_run {
            for page_id in 0..=max_page_id {
                if let Some(b) = self.buf_find(bparent, bserial, page_id) {
                    if !self.buf_is_free(b) {
                        obj.err = Some(Error::Exist);
                        return Err(Error::Exist);
                    }
                }
            }
            return Ok(());
        }

        // settle pending writes for this block before copying it
        self.buf_flush_group(bparent, bserial, false)?;

        let block = self.tree.node(node).data.block();
        let block_start = self.fdn_start(fdn);
        let pgd = self.com.pg_data_size;

        let h = self.bc_get(block);
        let result: Result<()> = (|| {
            if self.bc_load(h, ALL_PAGES).is_err() {
                return Err(Error::Io);
            }
            let ts = next_block_ts(self.block_ts_of(h).map_err(|_| Error::Io)?);

            let new_node = self.get_erased_node()?;
            let new_block = self.tree.node(new_node).data.block();
            let nh = self.bc_get(new_block);

            let mut failed = false;
            for page_id in 0..=max_page_id {
                let page = match self.find_page_with_id(h, page_id as u8) {
                    Ok(Some(p)) => p,
                    _ => {
                        if page_id == 0 || (fdn == 0 && page_id == 1) {
                            failed = true; // a block can't lose its first pages
                        }
                        break;
                    }
                };
                let page = match self.find_best_page(h, page) {
                    Ok(p) => p,
                    Err(_) => {
                        failed = true;
                        break;
                    }
                };
                let old_tag = self.bc_tag(h, page);

                let cidx = self.buf_clone(None)?;
                if self.read_into_buf(cidx, block, page, true).is_err() {
                    self.buf_free_clone(cidx);
                    failed = true;
                    break;
                }

                let mut tag = Tag::new(kind, old_tag.parent, old_tag.serial, page_id as u8);
                tag.block_ts = ts;

                let mut stop = false;
                if fdn == 0 && page_id == 0 {
                    // the info page is copied untouched
                    tag.data_len = old_tag.data_len;
                    tag.data_sum = old_tag.data_sum;
                } else {
                    let content_pages =
                        (page_id as u32) - if fdn == 0 { 1 } else { 0 };
                    let end = block_start + content_pages * pgd + old_tag.data_len as u32;
                    if remain >= end {
                        tag.data_len = old_tag.data_len;
                        tag.data_sum = old_tag.data_sum;
                    } else {
                        let cut = end - remain;
                        if cut >= old_tag.data_len as u32 {
                            // the page is entirely beyond the new length
                            self.buf_free_clone(cidx);
                            break;
                        }
                        let keep = old_tag.data_len as u32 - cut;
                        {
                            let b = self.buf.buf_mut(cidx);
                            b.data[keep as usize..pgd as usize].fill(0);
                            b.data_len = keep as u16;
                        }
                        tag.data_len = keep as u16;
                        stop = true;
                    }
                }
                {
                    let b = self.buf.buf_mut(cidx);
                    b.kind_raw = kind as u8;
                    b.parent = old_tag.parent;
                    b.serial = old_tag.serial;
                    b.page_id = page_id;
                    b.data_len = tag.data_len;
                }

                let w = self.write_cover_page(new_block, page_id, &mut tag, cidx);
                self.buf_free_clone(cidx);
                match w {
                    Ok(()) => self.bc_set_tag(nh, page_id, tag),
                    Err(_) => {
                        failed = true;
                        break;
                    }
                }
                if stop {
                    break;
                }
            }

            self.bc_expire(h, ALL_PAGES);
            self.bc_expire(nh, ALL_PAGES);
            self.bc_put(nh);

            if failed {
                self.tree.node_mut(new_node).data = NodeData::List {
                    block: new_block,
                    need_check: false,
                };
                if self.tree_erase_node(new_node)? {
                    self.tree.push_erased_tail(new_node, Some(false));
                }
                obj.err = Some(Error::Io);
                return Err(Error::Io);
            }

            self.tree.node_mut(node).data.set_block(new_block);
            self.tree.node_mut(new_node).data = NodeData::List {
                block,
                need_check: false,
            };
            if self.tree_erase_node(new_node)? {
                self.tree.push_erased_tail(new_node, Some(false));
            }

            // pool copies of the rewritten pages are stale now
            for page_id in 0..=max_page_id {
                if let Some(b) = self.buf_find(bparent, bserial, page_id) {
                    self.buf_mark_empty(b);
                }
            }
            Ok(())
        })();
        self.bc_put(h);
        result
    }

    fn write_cover_page(
        &mut self,
        block: u16,
        page: u16,
        tag: &mut Tag,
        idx: u16,
    ) -> core::result::Result<(), crate::flash::FlashError> {
        let data = &mut self.buf.pool[idx as usize].data;
        crate::flash::write_page(
            &mut self.flash,
            &self.com,
            &mut self.st,
            block,
            page,
            tag,
            data,
        )
    }

    // ---- flush / close ----

    pub(crate) fn object_flush(&mut self, obj: &Object) -> Result<()> {
        if !obj.open_ok {
            return Err(Error::BadHandle);
        }
        if obj.kind == ObjectType::File {
            // data groups first, then the head block group
            self.buf_flush_groups_with_parent(obj.serial)?;
        }
        if let Ok(node) = self.obj_node(obj) {
            let parent = self.tree.node(node).data.parent();
            self.buf_flush_group(parent, obj.serial, false)?;
        }
        Ok(())
    }

    pub(crate) fn object_close(&mut self, obj: &mut Object) -> Result<()> {
        if !obj.open_ok {
            return Err(Error::BadHandle);
        }

        if obj.oflag & (O_WRONLY | O_RDWR | O_APPEND | O_CREATE | O_TRUNC) != 0 {
            if let Ok(node) = self.obj_node(obj) {
                // refresh the modify time on the way out
                if let Ok(b) = self.buf_get_ex(obj.kind, node, 0) {
                    let mut fi = FileInfo::decode(self.buf_data(b));
                    fi.last_modify = (self.cfg.now)();
                    let mut enc = [0u8; FileInfo::ENCODED_LEN];
                    fi.encode(&mut enc);
                    let w = self.buf_write(b, &enc, 0, FileInfo::ENCODED_LEN as u32);
                    self.buf_put(b);
                    w?;
                }
            }
            self.object_flush(obj)?;
        }

        self.drain_pending();
        obj.open_ok = false;
        Ok(())
    }

    // ---- delete / rename ----

    /// Remove an object by path. Directories must be empty; file content is
    /// truncated away first, then every block returns to the free list.
    pub(crate) fn delete_object(&mut self, path: &str, dir: bool) -> Result<()> {
        let oflag = O_RDWR | if dir { O_DIR } else { 0 };
        let mut obj = self.open_object(path, oflag)?;
        if obj.serial == ROOT_DIR_SERIAL {
            return Err(Error::Access);
        }

        if dir {
            if self.tree.find_dir_with_parent(obj.serial).is_some()
                || self.tree.find_file_with_parent(obj.serial).is_some()
            {
                return Err(Error::NotEmpty);
            }
        } else {
            self.object_truncate(&mut obj, 0)?;
        }

        let node = self.obj_node(&obj)?;
        self.buf_flush_all()?;
        self.drain_pending();

        // stale pool entries must not alias a future object with this serial
        let parent = self.tree.node(node).data.parent();
        if let Some(b) = self.buf_find(parent, obj.serial, 0) {
            if !self.buf_is_free(b) {
                warn!("delete with a referenced buffer");
                return Err(Error::Access);
            }
        }
        self.evict_object_bufs(obj.serial);

        let block = self.tree.node(node).data.block();
        self.tree.break_from(node);
        self.tree.node_mut(node).data = NodeData::List {
            block,
            need_check: false,
        };
        if self.tree_erase_node(node)? {
            self.tree.push_erased_tail(node, Some(false));
        }
        Ok(())
    }

    /// Rename or move an object inside one device. The info page is
    /// rewritten and the block force-covered so no stale spare still matches
    /// the old name.
    pub(crate) fn rename_object(&mut self, old_path: &str, new_path: &str) -> Result<()> {
        if self.open_object(new_path, crate::O_RDONLY).is_ok()
            || self.open_object(new_path, crate::O_RDONLY | O_DIR).is_ok()
        {
            return Err(Error::Exist);
        }

        let (new_parent, raw_new_name) = self.parse_path(new_path)?;
        let new_name = strip_dir_slash(raw_new_name);
        if new_name.is_empty() || new_parent == PARENT_OF_ROOT {
            return Err(Error::Inval);
        }
        if new_name.len() > MAX_FILENAME_LENGTH {
            return Err(Error::Inval);
        }

        let mut obj = match self.open_object(old_path, crate::O_RDONLY) {
            Ok(o) => o,
            Err(_) => self.open_object(old_path, crate::O_RDONLY | O_DIR)?,
        };
        if obj.serial == ROOT_DIR_SERIAL {
            return Err(Error::Access);
        }
        let node = self.obj_node(&obj)?;
        let old_parent = self.tree.node(node).data.parent();

        // settle pending writes under the old identity first
        self.buf_flush_groups_with_parent(obj.serial)?;
        self.buf_flush_group(old_parent, obj.serial, false)?;

        let b = self.buf_get_ex(obj.kind, node, 0)?;
        let mut fi = FileInfo::decode(self.buf_data(b));
        fi.set_name(new_name.as_bytes());
        fi.last_modify = (self.cfg.now)();
        let mut enc = [0u8; FileInfo::ENCODED_LEN];
        fi.encode(&mut enc);
        // the rewritten pages must carry the new parent in their tags
        self.buf.buf_mut(b).parent = new_parent;
        let w = self.buf_write(b, &enc, 0, FileInfo::ENCODED_LEN as u32);
        self.buf_put(b);
        w?;

        // force a cover so every spare of the old generation goes away
        self.buf_flush_group(new_parent, obj.serial, true)?;

        let sum = sum16(new_name.as_bytes());
        match &mut self.tree.node_mut(node).data {
            NodeData::Dir {
                parent, checksum, ..
            }
            | NodeData::File {
                parent, checksum, ..
            } => {
                *parent = new_parent;
                *checksum = sum;
            }
            _ => {}
        }

        obj.parent = new_parent;
        self.object_close(&mut obj)?;
        Ok(())
    }

    // ---- stat ----

    pub(crate) fn load_object_info(&mut self, node: u16, kind: ObjectType) -> Result<ObjectInfo> {
        let b = self.buf_get_ex(kind, node, 0)?;
        let info = FileInfo::decode(self.buf_data(b));
        self.buf_put(b);
        let d = self.tree.node(node).data;
        Ok(ObjectInfo {
            info,
            len: match d {
                NodeData::File { len, .. } => len,
                _ => 0,
            },
            serial: d.serial(),
        })
    }

    pub(crate) fn object_stat(&mut self, obj: &Object) -> Result<ObjectInfo> {
        if obj.serial == ROOT_DIR_SERIAL && obj.kind == ObjectType::Dir {
            // the root has no block; synthesize it
            return Ok(ObjectInfo {
                info: FileInfo::new(b"", FILE_ATTR_DIR | FILE_ATTR_WRITE, 0),
                len: 0,
                serial: ROOT_DIR_SERIAL,
            });
        }
        let node = self.obj_node(obj)?;
        self.load_object_info(node, obj.kind)
    }
}
