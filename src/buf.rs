//! Page buffers: the write-back cache every byte of file data moves through.
//!
//! Buffers live in a fixed arena with u16 index links: an LRU chain over the
//! whole pool plus per-group dirty chains. A dirty group collects all dirty
//! pages of one `(parent, serial)` object and is flushed as a unit with one
//! of three strategies: onto a fresh block when the object has none, appended
//! into erased tail pages when the current block has room, or by block cover
//! (copy-forward into a fresh block) when it doesn't. Block cover is also the
//! mechanism behind truncation, rename sealing and bad-block evacuation.

use alloc::vec;
use alloc::vec::Vec;

use nand_flash::NandFlash;

use crate::badblock::PendingIntent;
use crate::blockinfo::ALL_PAGES;
use crate::device::Device;
use crate::error::{Error, Result};
use crate::flash::{self, FlashError};
use crate::object::FileInfo;
use crate::tag::{first_block_ts, next_block_ts, sum16, ObjectType, Tag};
use crate::tree::NodeData;

pub(crate) const NO_BUF: u16 = 0xFFFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BufMark {
    Empty,
    Valid,
    Dirty,
}

#[derive(Debug)]
pub(crate) struct PageBuf {
    pub mark: BufMark,
    /// Taken off the LRU for private use (block recovery, mount scratch).
    pub is_clone: bool,
    pub kind_raw: u8,
    pub parent: u16,
    pub serial: u16,
    pub page_id: u16,
    pub data_len: u16,
    pub ref_count: u16,
    next: u16,
    prev: u16,
    next_dirty: u16,
    prev_dirty: u16,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy)]
struct DirtyGroup {
    head: u16,
    count: u16,
}

#[derive(Debug)]
pub(crate) struct PageBufPool {
    pub pool: Vec<PageBuf>,
    head: u16,
    tail: u16,
    groups: Vec<DirtyGroup>,
    max_dirty: u16,
    /// Bitmask of groups with a flush in progress; guards against
    /// re-entering one when a clone allocation inside a flush has to make
    /// room by flushing another group.
    active_flush: u32,
}

impl PageBufPool {
    pub fn new(max_bufs: u16, pg_size: u32, dirty_groups: u16, max_dirty: u16) -> PageBufPool {
        let mut pool = Vec::with_capacity(max_bufs as usize);
        for i in 0..max_bufs {
            pool.push(PageBuf {
                mark: BufMark::Empty,
                is_clone: false,
                kind_raw: 0,
                parent: 0,
                serial: 0,
                page_id: 0,
                data_len: 0,
                ref_count: 0,
                next: if i + 1 < max_bufs { i + 1 } else { NO_BUF },
                prev: if i > 0 { i - 1 } else { NO_BUF },
                next_dirty: NO_BUF,
                prev_dirty: NO_BUF,
                data: vec![0xFF; pg_size as usize],
            });
        }
        PageBufPool {
            pool,
            head: 0,
            tail: max_bufs - 1,
            groups: vec![
                DirtyGroup {
                    head: NO_BUF,
                    count: 0
                };
                dirty_groups as usize
            ],
            max_dirty,
            active_flush: 0,
        }
    }

    pub fn buf(&self, idx: u16) -> &PageBuf {
        &self.pool[idx as usize]
    }

    pub fn buf_mut(&mut self, idx: u16) -> &mut PageBuf {
        &mut self.pool[idx as usize]
    }

    /// Find a matching non-empty buffer in the pool.
    pub fn find(&self, parent: u16, serial: u16, page_id: u16) -> Option<u16> {
        let mut x = self.head;
        while x != NO_BUF {
            let b = &self.pool[x as usize];
            if b.parent == parent
                && b.serial == serial
                && b.page_id == page_id
                && b.mark != BufMark::Empty
            {
                return Some(x);
            }
            x = b.next;
        }
        None
    }

    fn break_from_list(&mut self, idx: u16) {
        let (prev, next) = {
            let b = &self.pool[idx as usize];
            (b.prev, b.next)
        };
        if prev != NO_BUF {
            self.pool[prev as usize].next = next;
        }
        if next != NO_BUF {
            self.pool[next as usize].prev = prev;
        }
        if self.head == idx {
            self.head = next;
        }
        if self.tail == idx {
            self.tail = prev;
        }
        self.pool[idx as usize].next = NO_BUF;
        self.pool[idx as usize].prev = NO_BUF;
    }

    fn link_head(&mut self, idx: u16) {
        if self.head == idx {
            return;
        }
        self.pool[idx as usize].prev = NO_BUF;
        self.pool[idx as usize].next = self.head;
        if self.head != NO_BUF {
            self.pool[self.head as usize].prev = idx;
        }
        if self.tail == NO_BUF {
            self.tail = idx;
        }
        self.head = idx;
    }

    fn link_tail(&mut self, idx: u16) {
        if self.tail == idx {
            return;
        }
        self.pool[idx as usize].next = NO_BUF;
        self.pool[idx as usize].prev = self.tail;
        if self.tail != NO_BUF {
            self.pool[self.tail as usize].next = idx;
        }
        if self.head == NO_BUF {
            self.head = idx;
        }
        self.tail = idx;
    }

    pub fn move_to_head(&mut self, idx: u16) {
        if self.head == idx {
            return;
        }
        self.break_from_list(idx);
        self.link_head(idx);
    }

    /// MRU-first scan for a reclaimable buffer.
    fn find_free(&self) -> Option<u16> {
        let mut x = self.head;
        while x != NO_BUF {
            let b = &self.pool[x as usize];
            if b.ref_count == 0 && b.mark != BufMark::Dirty && !b.is_clone {
                return Some(x);
            }
            x = b.next;
        }
        None
    }

    fn link_dirty(&mut self, slot: usize, idx: u16) {
        let head = self.groups[slot].head;
        self.pool[idx as usize].mark = BufMark::Dirty;
        self.pool[idx as usize].prev_dirty = NO_BUF;
        self.pool[idx as usize].next_dirty = head;
        if head != NO_BUF {
            self.pool[head as usize].prev_dirty = idx;
        }
        self.groups[slot].head = idx;
        self.groups[slot].count += 1;
    }

    fn break_dirty(&mut self, slot: usize, idx: u16) {
        let (prev, next) = {
            let b = &self.pool[idx as usize];
            (b.prev_dirty, b.next_dirty)
        };
        if prev != NO_BUF {
            self.pool[prev as usize].next_dirty = next;
        }
        if next != NO_BUF {
            self.pool[next as usize].prev_dirty = prev;
        }
        if self.groups[slot].head == idx {
            self.groups[slot].head = next;
        }
        self.pool[idx as usize].next_dirty = NO_BUF;
        self.pool[idx as usize].prev_dirty = NO_BUF;
        self.groups[slot].count -= 1;
    }

    /// The group currently collecting `(parent, serial)`, if any.
    fn group_slot(&self, parent: u16, serial: u16) -> Option<usize> {
        self.groups.iter().position(|g| {
            g.head != NO_BUF && {
                let b = &self.pool[g.head as usize];
                b.parent == parent && b.serial == serial
            }
        })
    }

    fn free_group_slot(&self) -> Option<usize> {
        self.groups.iter().position(|g| g.head == NO_BUF)
    }

    fn most_dirty_group(&self) -> Option<usize> {
        self.groups
            .iter()
            .enumerate()
            .filter(|(i, g)| g.head != NO_BUF && self.active_flush & (1 << i) == 0)
            .max_by_key(|(_, g)| g.count)
            .map(|(i, _)| i)
    }

    fn find_in_dirty(&self, slot: usize, page_id: u16) -> Option<u16> {
        let mut x = self.groups[slot].head;
        while x != NO_BUF {
            if self.pool[x as usize].page_id == page_id {
                return Some(x);
            }
            x = self.pool[x as usize].next_dirty;
        }
        None
    }

    fn min_page_id_buf(&self, slot: usize) -> Option<u16> {
        let mut best = NO_BUF;
        let mut x = self.groups[slot].head;
        while x != NO_BUF {
            if best == NO_BUF || self.pool[x as usize].page_id < self.pool[best as usize].page_id {
                best = x;
            }
            x = self.pool[x as usize].next_dirty;
        }
        (best != NO_BUF).then_some(best)
    }

    pub fn group_count(&self, slot: usize) -> u16 {
        self.groups[slot].count
    }

    pub fn all_free(&self) -> bool {
        self.pool.iter().all(|b| b.ref_count == 0 && !b.is_clone)
    }

    pub fn any_dirty(&self) -> bool {
        self.groups.iter().any(|g| g.head != NO_BUF)
    }

    pub fn set_all_empty(&mut self) {
        for b in &mut self.pool {
            b.mark = BufMark::Empty;
        }
    }
}

impl<F: NandFlash> Device<F> {
    /// Look a buffer up without taking a reference.
    pub(crate) fn buf_find(&self, parent: u16, serial: u16, page_id: u16) -> Option<u16> {
        self.buf.find(parent, serial, page_id)
    }

    pub(crate) fn buf_is_free(&self, idx: u16) -> bool {
        self.buf.buf(idx).ref_count == 0
    }

    pub(crate) fn buf_data(&self, idx: u16) -> &[u8] {
        &self.buf.buf(idx).data
    }

    pub(crate) fn buf_mark_empty(&mut self, idx: u16) {
        self.buf.buf_mut(idx).mark = BufMark::Empty;
    }

    /// A fresh, zero-length buffer for a page about to be written.
    pub(crate) fn buf_new(
        &mut self,
        kind: ObjectType,
        parent: u16,
        serial: u16,
        page_id: u16,
    ) -> Result<u16> {
        if let Some(idx) = self.buf.find(parent, serial, page_id) {
            self.buf.buf_mut(idx).ref_count += 1;
            self.buf.move_to_head(idx);
            if self.buf.buf(idx).ref_count > 1 {
                warn!("new buffer over one still referenced");
            } else {
                self.buf.buf_mut(idx).data_len = 0;
            }
            return Ok(idx);
        }

        let idx = self.take_free_buf()?;
        let b = self.buf.buf_mut(idx);
        b.mark = BufMark::Empty;
        b.is_clone = false;
        b.kind_raw = kind as u8;
        b.parent = parent;
        b.serial = serial;
        b.page_id = page_id;
        b.data_len = 0;
        b.ref_count = 1;
        b.data.fill(0xFF);
        self.buf.move_to_head(idx);
        Ok(idx)
    }

    /// Get a buffer for an existing page, populating it from flash if the
    /// pool doesn't hold it yet.
    pub(crate) fn buf_get_ex(&mut self, kind: ObjectType, node: u16, page_id: u16) -> Result<u16> {
        let d = self.tree.node(node).data;
        let (parent, serial, block) = (d.parent(), d.serial(), d.block());

        if let Some(idx) = self.buf.find(parent, serial, page_id) {
            self.buf.buf_mut(idx).ref_count += 1;
            return Ok(idx);
        }

        let idx = self.take_free_buf()?;

        let h = self.bc_get(block);
        let loaded: Result<(Tag, u16)> = (|| {
            let page = self
                .find_page_with_id(h, page_id as u8)
                .map_err(|_| Error::Io)?
                .ok_or(Error::Io)?;
            let best = self.find_best_page(h, page).map_err(|_| Error::Io)?;
            Ok((self.bc_tag(h, best), best))
        })();
        let (t, best) = match loaded {
            Ok(v) => v,
            Err(e) => {
                self.bc_put(h);
                return Err(e);
            }
        };

        let read = self.read_into_buf(idx, block, best, true);
        self.bc_put(h);
        match read {
            Ok(corrected) => {
                if corrected > 0 {
                    self.bad.add(block, PendingIntent::Recover);
                }
            }
            Err(FlashError::Uncorrectable) | Err(FlashError::BadBlock) => {
                self.bad.add(block, PendingIntent::Recover);
                self.buf.buf_mut(idx).mark = BufMark::Empty;
                return Err(Error::Io);
            }
            Err(FlashError::Io) => {
                self.buf.buf_mut(idx).mark = BufMark::Empty;
                return Err(Error::Io);
            }
        }

        let b = self.buf.buf_mut(idx);
        b.mark = BufMark::Valid;
        b.is_clone = false;
        b.kind_raw = kind as u8;
        b.parent = parent;
        b.serial = serial;
        b.page_id = page_id;
        b.data_len = t.data_len.min(self.com.pg_data_size as u16);
        b.ref_count = 1;
        self.buf.move_to_head(idx);
        Ok(idx)
    }

    pub(crate) fn buf_put(&mut self, idx: u16) {
        let b = self.buf.buf_mut(idx);
        debug_assert!(b.ref_count > 0, "putting an unreferenced buffer");
        if b.ref_count > 0 {
            b.ref_count -= 1;
        }
    }

    /// Take a buffer off the LRU for private use. Pass `src` to copy an
    /// existing buffer's identity and content.
    pub(crate) fn buf_clone(&mut self, src: Option<u16>) -> Result<u16> {
        let idx = self.take_free_buf()?;
        self.buf.break_from_list(idx);
        if let Some(s) = src {
            let (kind_raw, parent, serial, page_id, data_len) = {
                let b = self.buf.buf(s);
                (b.kind_raw, b.parent, b.serial, b.page_id, b.data_len)
            };
            let data = self.buf.buf(s).data.clone();
            let b = self.buf.buf_mut(idx);
            b.kind_raw = kind_raw;
            b.parent = parent;
            b.serial = serial;
            b.page_id = page_id;
            b.data_len = data_len;
            b.data.copy_from_slice(&data);
        }
        let b = self.buf.buf_mut(idx);
        b.is_clone = true;
        b.ref_count = 0;
        b.mark = BufMark::Empty;
        Ok(idx)
    }

    pub(crate) fn buf_free_clone(&mut self, idx: u16) {
        let b = self.buf.buf_mut(idx);
        debug_assert!(b.is_clone, "freeing a non-clone buffer");
        b.is_clone = false;
        b.ref_count = 0;
        b.mark = BufMark::Empty;
        self.buf.link_tail(idx);
    }

    fn take_free_buf(&mut self) -> Result<u16> {
        if let Some(idx) = self.buf.find_free() {
            return Ok(idx);
        }
        self.buf_flush_most_dirty()?;
        // pools are sized so that a flush always frees a victim
        Ok(self.buf.find_free().expect("page buffer pool exhausted"))
    }

    /// Copy into a buffer and enroll it in its object's dirty group. The
    /// group auto-flushes when it reaches the dirty-page cap.
    pub(crate) fn buf_write(&mut self, idx: u16, src: &[u8], ofs: u32, len: u32) -> Result<()> {
        if ofs + len > self.com.pg_data_size {
            error!("buffer write out of range: {}+{}", ofs, len);
            return Err(Error::Inval);
        }
        let (parent, serial) = {
            let b = self.buf.buf(idx);
            (b.parent, b.serial)
        };

        let slot = match self.buf.group_slot(parent, serial) {
            Some(s) => s,
            None => match self.buf.free_group_slot() {
                Some(s) => s,
                None => {
                    self.buf_flush_most_dirty()?;
                    self.buf.free_group_slot().ok_or(Error::Io)?
                }
            },
        };

        let was_dirty = {
            let b = self.buf.buf_mut(idx);
            let was = b.mark == BufMark::Dirty;
            b.data[ofs as usize..(ofs + len) as usize].copy_from_slice(&src[..len as usize]);
            if ofs + len > b.data_len as u32 {
                b.data_len = (ofs + len) as u16;
            }
            was
        };
        if !was_dirty {
            self.buf.link_dirty(slot, idx);
        }

        if self.buf.group_count(slot) >= self.buf.max_dirty {
            self.buf_flush_group(parent, serial, false)?;
        }
        Ok(())
    }

    pub(crate) fn buf_read(&self, idx: u16, dst: &mut [u8], ofs: u32) {
        let pg_data_size = self.com.pg_data_size;
        let b = self.buf.buf(idx);
        let len = dst.len() as u32;
        let read = if ofs >= pg_data_size {
            0
        } else {
            len.min(pg_data_size - ofs)
        };
        dst[..read as usize].copy_from_slice(&b.data[ofs as usize..(ofs + read) as usize]);
    }

    // ---- flush machinery ----

    fn buf_flush_most_dirty(&mut self) -> Result<()> {
        match self.buf.most_dirty_group() {
            Some(slot) => self.flush_slot(slot, false),
            None => Ok(()),
        }
    }

    /// Flush the dirty group of one object, optionally forcing block cover
    /// even when the current block could absorb the pages in place.
    pub(crate) fn buf_flush_group(&mut self, parent: u16, serial: u16, force: bool) -> Result<()> {
        match self.buf.group_slot(parent, serial) {
            Some(slot) => self.flush_slot(slot, force),
            None if force => {
                // nothing dirty; a forced seal still covers the block so
                // stale spares of the old generation drop out of lookup
                self.forced_cover_without_dirty(parent, serial)
            }
            None => Ok(()),
        }
    }

    /// Flush every dirty group whose pages belong to objects under `parent`
    /// (the data groups of one file).
    pub(crate) fn buf_flush_groups_with_parent(&mut self, parent: u16) -> Result<()> {
        for slot in 0..self.buf.groups.len() {
            let head = self.buf.groups[slot].head;
            if head != NO_BUF && self.buf.buf(head).parent == parent {
                self.flush_slot(slot, false)?;
            }
        }
        Ok(())
    }

    /// Drop every clean pool entry belonging to an object (by serial, both as
    /// owner and as parent of its data pages), so a reused serial never
    /// aliases stale content.
    pub(crate) fn evict_object_bufs(&mut self, serial: u16) {
        for b in &mut self.buf.pool {
            if (b.serial == serial || b.parent == serial)
                && b.mark == BufMark::Valid
                && b.ref_count == 0
                && !b.is_clone
            {
                b.mark = BufMark::Empty;
            }
        }
    }

    pub(crate) fn buf_flush_all(&mut self) -> Result<()> {
        for slot in 0..self.buf.groups.len() {
            if self.buf.groups[slot].head != NO_BUF {
                self.flush_slot(slot, false)?;
            }
        }
        Ok(())
    }

    fn flush_slot(&mut self, slot: usize, force: bool) -> Result<()> {
        if self.buf.active_flush & (1 << slot) != 0 {
            return Ok(());
        }
        self.buf.active_flush |= 1 << slot;
        let r = self.flush_slot_inner(slot, force);
        self.buf.active_flush &= !(1 << slot);
        r
    }

    fn flush_slot_inner(&mut self, slot: usize, force: bool) -> Result<()> {
        if self.buf.groups[slot].count == 0 {
            return Ok(());
        }

        let head = self.buf.groups[slot].head;
        let (kind_raw, parent, serial) = {
            let b = self.buf.buf(head);
            (b.kind_raw, b.parent, b.serial)
        };
        let kind = ObjectType::from_raw(kind_raw).ok_or(Error::Io)?;

        #[cfg(debug_assertions)]
        {
            let mut x = self.buf.groups[slot].head;
            while x != NO_BUF {
                let b = self.buf.buf(x);
                debug_assert!(
                    b.parent == parent && b.serial == serial && b.mark == BufMark::Dirty,
                    "mixed dirty group"
                );
                x = b.next_dirty;
            }
        }

        match self.tree.find_from_tree(kind, parent, serial) {
            None => self.flush_new_block(slot, kind, parent, serial),
            Some(node) => {
                let block = self.tree.node(node).data.block();
                let h = self.bc_get(block);
                let result = (|| {
                    if self.bc_load(h, ALL_PAGES).is_err() {
                        self.bad.add(block, PendingIntent::Recover);
                    }
                    let free = self.free_pages_count(h).map_err(|_| Error::Io)?;
                    if free >= self.buf.groups[slot].count && !force {
                        self.flush_append(slot, node, h)
                    } else {
                        self.flush_cover(slot, node, h, false)
                    }
                })();
                self.bc_put(h);
                result
            }
        }
    }

    fn data_sum_of(&self, idx: u16) -> u16 {
        let b = self.buf.buf(idx);
        // only the info page of a file or directory carries a name sum
        if b.page_id == 0
            && (b.kind_raw == ObjectType::File as u8 || b.kind_raw == ObjectType::Dir as u8)
        {
            let fi = FileInfo::decode(&b.data);
            sum16(fi.name())
        } else {
            0
        }
    }

    fn write_buf_page(
        &mut self,
        block: u16,
        page: u16,
        tag: &mut Tag,
        idx: u16,
    ) -> core::result::Result<(), FlashError> {
        let data = &mut self.buf.pool[idx as usize].data;
        flash::write_page(
            &mut self.flash,
            &self.com,
            &mut self.st,
            block,
            page,
            tag,
            data,
        )
    }

    pub(crate) fn read_into_buf(
        &mut self,
        idx: u16,
        block: u16,
        page: u16,
        ecc_care: bool,
    ) -> core::result::Result<u32, FlashError> {
        let data = &mut self.buf.pool[idx as usize].data;
        flash::read_page(
            &mut self.flash,
            &self.com,
            &mut self.st,
            block,
            page,
            data,
            ecc_care,
        )
    }

    /// Strategy 1: the object has no block yet; write the group onto a fresh
    /// erased block and insert the new tree node.
    fn flush_new_block(
        &mut self,
        slot: usize,
        kind: ObjectType,
        parent: u16,
        serial: u16,
    ) -> Result<()> {
        loop {
            let node = self.get_erased_node()?;
            let block = self.tree.node(node).data.block();
            let h = self.bc_get(block);

            let mut went_bad = false;
            let mut io_err = false;
            let mut info_sum = 0u16;
            // buffers leave the dirty group only once the whole block is
            // written, so a mid-flush bad block loses nothing on retry
            let mut written: Vec<u16> = Vec::new();

            for i in 0..self.com.pages_per_block {
                let Some(bidx) = self.buf.find_in_dirty(slot, i) else {
                    break;
                };
                let mut tag = Tag::new(kind, parent, serial, i as u8);
                tag.block_ts = first_block_ts();
                tag.data_len = self.buf.buf(bidx).data_len;
                tag.data_sum = self.data_sum_of(bidx);
                if i == 0 {
                    info_sum = tag.data_sum;
                }
                match self.write_buf_page(block, i, &mut tag, bidx) {
                    Ok(()) => {
                        self.bc_set_tag(h, i, tag);
                        written.push(bidx);
                    }
                    Err(FlashError::BadBlock) => {
                        went_bad = true;
                        break;
                    }
                    Err(_) => {
                        io_err = true;
                        break;
                    }
                }
            }

            if went_bad || io_err {
                self.bc_expire(h, ALL_PAGES);
                self.bc_put(h);
                if went_bad {
                    warn!("block {} failed during first write, retrying", block);
                    self.bad_block_process_node(node);
                    continue;
                }
                if self.tree_erase_node(node)? {
                    self.tree.push_erased_tail(node, Some(false));
                }
                return Err(Error::Io);
            }

            for bidx in written {
                self.buf.break_dirty(slot, bidx);
                self.buf.buf_mut(bidx).mark = BufMark::Valid;
                self.buf.move_to_head(bidx);
            }
            self.bc_put(h);
            self.tree.node_mut(node).data = match kind {
                ObjectType::Dir => NodeData::Dir {
                    block,
                    parent,
                    serial,
                    checksum: info_sum,
                },
                ObjectType::File => NodeData::File {
                    block,
                    parent,
                    serial,
                    checksum: info_sum,
                    len: 0,
                },
                ObjectType::Data => NodeData::Data {
                    block,
                    parent,
                    serial,
                    len: 0,
                },
            };
            self.tree.insert(node);
            return Ok(());
        }
    }

    /// Strategy 2: the current block has room; append the dirty pages into
    /// its tail in page-id order. No tree change.
    fn flush_append(&mut self, slot: usize, node: u16, h: u16) -> Result<()> {
        let block = self.bc.entry(h).block;
        let ts = self.block_ts_of(h).map_err(|_| Error::Io)?;
        let free = self.free_pages_count(h).map_err(|_| Error::Io)?;
        let mut page = self.com.pages_per_block - free;

        while self.buf.groups[slot].count > 0 {
            let bidx = self.buf.min_page_id_buf(slot).ok_or(Error::Io)?;
            let (kind_raw, parent, serial, page_id, data_len) = {
                let b = self.buf.buf(bidx);
                (b.kind_raw, b.parent, b.serial, b.page_id, b.data_len)
            };
            let kind = ObjectType::from_raw(kind_raw).ok_or(Error::Io)?;
            let mut tag = Tag::new(kind, parent, serial, page_id as u8);
            tag.block_ts = ts;
            tag.data_len = data_len;
            tag.data_sum = self.data_sum_of(bidx);

            match self.write_buf_page(block, page, &mut tag, bidx) {
                Ok(()) => {
                    self.bc_set_tag(h, page, tag);
                    self.buf.break_dirty(slot, bidx);
                    self.buf.buf_mut(bidx).mark = BufMark::Valid;
                    self.buf.move_to_head(bidx);
                    page += 1;
                }
                Err(FlashError::BadBlock) => {
                    // evacuate everything to a fresh block and retire this one
                    warn!("block {} failed during append, covering", block);
                    self.bad.add(block, PendingIntent::MarkBad);
                    return self.flush_cover(slot, node, h, true);
                }
                Err(_) => return Err(Error::Io),
            }
        }
        Ok(())
    }

    /// Strategy 3: block cover. Copy the object forward onto a fresh block,
    /// preferring dirty buffers over the old block's pages, then retire the
    /// old block.
    fn flush_cover(&mut self, slot: usize, node: u16, h: u16, old_is_bad: bool) -> Result<()> {
        let head = self.buf.groups[slot].head;
        let (kind_raw, parent, serial) = if head != NO_BUF {
            let b = self.buf.buf(head);
            (b.kind_raw, b.parent, b.serial)
        } else {
            let d = self.tree.node(node).data;
            (
                d.kind().ok_or(Error::Io)? as u8,
                d.parent(),
                d.serial(),
            )
        };
        let kind = ObjectType::from_raw(kind_raw).ok_or(Error::Io)?;
        let old_block = self.bc.entry(h).block;
        let ts = next_block_ts(self.block_ts_of(h).map_err(|_| Error::Io)?);

        loop {
            let new_node = self.get_erased_node()?;
            let new_block = self.tree.node(new_node).data.block();
            let nh = self.bc_get(new_block);
            debug!("cover ({},{}) from block {} to {}", parent, serial, old_block, new_block);

            let mut failure: Option<FlashError> = None;
            let mut info_sum = 0u16;
            // dirty buffers stay grouped until the cover fully succeeds
            let mut written: Vec<u16> = Vec::new();

            for i in 0..self.com.pages_per_block {
                let mut tag = Tag::new(kind, parent, serial, i as u8);
                tag.block_ts = ts;

                if let Some(bidx) = self.buf.find_in_dirty(slot, i) {
                    tag.data_len = self.buf.buf(bidx).data_len;
                    tag.data_sum = self.data_sum_of(bidx);
                    if i == 0 {
                        info_sum = tag.data_sum;
                    }
                    match self.write_buf_page(new_block, i, &mut tag, bidx) {
                        Ok(()) => {
                            self.bc_set_tag(nh, i, tag);
                            written.push(bidx);
                        }
                        Err(e) => {
                            failure = Some(e);
                            break;
                        }
                    }
                } else {
                    let found = self
                        .find_page_with_id(h, i as u8)
                        .map_err(|_| FlashError::Io);
                    let page = match found {
                        Ok(Some(p)) => p,
                        Ok(None) => break, // tail gap: end of the object
                        Err(e) => {
                            failure = Some(e);
                            break;
                        }
                    };
                    let page = match self.find_best_page(h, page) {
                        Ok(p) => p,
                        Err(e) => {
                            failure = Some(e);
                            break;
                        }
                    };
                    let old_tag = self.bc_tag(h, page);

                    let cidx = self.buf_clone(None)?;
                    if self
                        .read_into_buf(cidx, old_block, page, !old_is_bad)
                        .is_err()
                    {
                        self.buf_free_clone(cidx);
                        failure = Some(FlashError::Io);
                        break;
                    }
                    {
                        let b = self.buf.buf_mut(cidx);
                        b.kind_raw = kind_raw;
                        b.parent = parent;
                        b.serial = serial;
                        b.page_id = old_tag.page_id as u16;
                        b.data_len = old_tag.data_len.min(self.com.pg_data_size as u16);
                        b.mark = BufMark::Valid;
                    }
                    tag.data_len = self.buf.buf(cidx).data_len;
                    tag.data_sum = self.data_sum_of(cidx);
                    if i == 0 {
                        info_sum = tag.data_sum;
                    }
                    let res = self.write_buf_page(new_block, i, &mut tag, cidx);
                    self.buf_free_clone(cidx);
                    match res {
                        Ok(()) => self.bc_set_tag(nh, i, tag),
                        Err(e) => {
                            failure = Some(e);
                            break;
                        }
                    }
                }
            }

            match failure {
                None => {
                    for bidx in written {
                        self.buf.break_dirty(slot, bidx);
                        self.buf.buf_mut(bidx).mark = BufMark::Valid;
                        self.buf.move_to_head(bidx);
                    }
                    // swap: the live node keeps its identity, only the block
                    // moves; the freed node inherits the old block
                    self.tree.node_mut(node).data.set_block(new_block);
                    if let NodeData::Dir { checksum, .. } | NodeData::File { checksum, .. } =
                        &mut self.tree.node_mut(node).data
                    {
                        *checksum = info_sum;
                    }
                    self.bc_expire(h, ALL_PAGES);
                    self.bc_put(nh);
                    self.tree.node_mut(new_node).data = NodeData::List {
                        block: old_block,
                        need_check: false,
                    };
                    if old_is_bad || self.bad.is_pending(old_block) {
                        self.bad.remove(old_block);
                        self.bad_block_process_node(new_node);
                    } else if self.tree_erase_node(new_node)? {
                        self.tree.push_erased_tail(new_node, Some(false));
                    }
                    return Ok(());
                }
                Some(FlashError::BadBlock) => {
                    warn!("fresh block {} failed during cover, retrying", new_block);
                    self.bc_expire(nh, ALL_PAGES);
                    self.bc_put(nh);
                    self.tree.node_mut(new_node).data = NodeData::List {
                        block: new_block,
                        need_check: false,
                    };
                    self.bad_block_process_node(new_node);
                    continue;
                }
                Some(_) => {
                    self.bc_expire(nh, ALL_PAGES);
                    self.bc_put(nh);
                    self.tree.node_mut(new_node).data = NodeData::List {
                        block: new_block,
                        need_check: false,
                    };
                    if self.tree_erase_node(new_node)? {
                        self.tree.push_erased_tail(new_node, Some(false));
                    }
                    return Err(Error::Io);
                }
            }
        }
    }

    /// A forced cover with an empty dirty group: rewrites the object's block
    /// so that superseded in-place page generations disappear.
    fn forced_cover_without_dirty(&mut self, parent: u16, serial: u16) -> Result<()> {
        // the caller names a file or dir; data groups always carry pages
        let node = match self
            .tree
            .find_file(serial)
            .or_else(|| self.tree.find_dir(serial))
        {
            Some(n) => n,
            None => return Ok(()),
        };
        if self.tree.node(node).data.parent() != parent {
            return Ok(());
        }
        let block = self.tree.node(node).data.block();
        let h = self.bc_get(block);
        let result = (|| {
            if self.bc_load(h, ALL_PAGES).is_err() {
                self.bad.add(block, PendingIntent::Recover);
            }
            // any free dirty slot works: the group is empty
            let slot = self.buf.free_group_slot().ok_or(Error::Io)?;
            self.flush_cover(slot, node, h, false)
        })();
        self.bc_put(h);
        result
    }
}
