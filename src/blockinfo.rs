//! Block-info cache: the only component that reads page spares.
//!
//! A bounded pool of per-block spare-tag arrays. Entries are refcounted and
//! recycled LRU; every spare slot carries an `expired` flag so a `load` after
//! an `expire` re-reads from flash and nothing ever consumes stale tags.

use alloc::vec::Vec;

use nand_flash::NandFlash;

use crate::device::Device;
use crate::flash::{self, FlashResult};
use crate::tag::{self, Tag};

/// Request all pages of a block at once.
pub(crate) const ALL_PAGES: u16 = 0xFFFF;

pub(crate) const NO_ENTRY: u16 = 0xFFFF;

#[derive(Debug, Clone, Copy)]
pub(crate) struct SpareSlot {
    pub tag: Tag,
    pub expired: bool,
}

#[derive(Debug)]
pub(crate) struct BlockInfo {
    pub block: u16,
    pub spares: Vec<SpareSlot>,
    pub expired_count: u16,
    pub ref_count: u16,
    next: u16,
    prev: u16,
}

#[derive(Debug)]
pub(crate) struct BlockInfoCache {
    pool: Vec<BlockInfo>,
    head: u16,
    tail: u16,
}

impl BlockInfoCache {
    pub fn new(max_cached: u16, pages_per_block: u16) -> BlockInfoCache {
        let mut pool = Vec::with_capacity(max_cached as usize);
        for i in 0..max_cached {
            pool.push(BlockInfo {
                block: crate::INVALID_BLOCK,
                spares: alloc::vec![
                    SpareSlot { tag: Tag::erased(), expired: true };
                    pages_per_block as usize
                ],
                expired_count: pages_per_block,
                ref_count: 0,
                next: if i + 1 < max_cached { i + 1 } else { NO_ENTRY },
                prev: if i > 0 { i - 1 } else { NO_ENTRY },
            });
        }
        BlockInfoCache {
            pool,
            head: 0,
            tail: max_cached - 1,
        }
    }

    pub fn entry(&self, h: u16) -> &BlockInfo {
        &self.pool[h as usize]
    }

    pub fn entry_mut(&mut self, h: u16) -> &mut BlockInfo {
        &mut self.pool[h as usize]
    }

    fn find(&self, block: u16) -> Option<u16> {
        self.pool
            .iter()
            .position(|e| e.block == block)
            .map(|i| i as u16)
    }

    fn break_from_list(&mut self, h: u16) {
        let (prev, next) = {
            let e = &self.pool[h as usize];
            (e.prev, e.next)
        };
        if prev != NO_ENTRY {
            self.pool[prev as usize].next = next;
        }
        if next != NO_ENTRY {
            self.pool[next as usize].prev = prev;
        }
        if self.head == h {
            self.head = next;
        }
        if self.tail == h {
            self.tail = prev;
        }
    }

    fn move_to_tail(&mut self, h: u16) {
        if self.tail == h {
            return;
        }
        self.break_from_list(h);
        let old_tail = self.tail;
        self.pool[h as usize].prev = old_tail;
        self.pool[h as usize].next = NO_ENTRY;
        if old_tail != NO_ENTRY {
            self.pool[old_tail as usize].next = h;
        }
        self.tail = h;
        if self.head == NO_ENTRY {
            self.head = h;
        }
    }

    /// First reclaimable entry, scanning from the LRU end.
    fn take_lru(&self) -> Option<u16> {
        let mut h = self.head;
        while h != NO_ENTRY {
            let e = &self.pool[h as usize];
            if e.ref_count == 0 {
                return Some(h);
            }
            h = e.next;
        }
        None
    }

    pub fn all_free(&self) -> bool {
        self.pool.iter().all(|e| e.ref_count == 0)
    }

    pub fn expire_all(&mut self) {
        for e in &mut self.pool {
            for s in &mut e.spares {
                if !s.expired {
                    s.expired = true;
                    e.expired_count += 1;
                }
            }
        }
    }
}

impl<F: NandFlash> Device<F> {
    /// Get a cache handle for `block`, loading nothing yet. The handle must
    /// be returned with [`Device::bc_put`].
    pub(crate) fn bc_get(&mut self, block: u16) -> u16 {
        if let Some(h) = self.bc.find(block) {
            self.bc.entry_mut(h).ref_count += 1;
            self.bc.move_to_tail(h);
            return h;
        }

        // the pools are sized for the worst case at init; running out is a
        // bug in the caller's get/put pairing
        let h = self.bc.take_lru().expect("block info cache exhausted");
        let pages = self.com.pages_per_block;
        let e = self.bc.entry_mut(h);
        e.block = block;
        e.ref_count = 1;
        e.expired_count = pages;
        for s in &mut e.spares {
            s.expired = true;
        }
        self.bc.move_to_tail(h);
        h
    }

    pub(crate) fn bc_put(&mut self, h: u16) {
        let e = self.bc.entry_mut(h);
        debug_assert!(e.ref_count > 0, "putting an unused block info entry");
        if e.ref_count > 0 {
            e.ref_count -= 1;
        }
    }

    /// Populate the spare slots for `page` (or [`ALL_PAGES`]) from flash.
    /// Idempotent through the per-page expired flags.
    pub(crate) fn bc_load(&mut self, h: u16, page: u16) -> FlashResult<()> {
        let block = self.bc.entry(h).block;
        if page == ALL_PAGES {
            if self.bc.entry(h).expired_count == 0 {
                return Ok(());
            }
            for p in 0..self.com.pages_per_block {
                if !self.bc.entry(h).spares[p as usize].expired {
                    continue;
                }
                let t = flash::load_tag(&mut self.flash, &self.com, &mut self.st, block, p)?;
                let e = self.bc.entry_mut(h);
                e.spares[p as usize] = SpareSlot {
                    tag: t,
                    expired: false,
                };
                e.expired_count -= 1;
            }
        } else {
            debug_assert!(page < self.com.pages_per_block);
            if self.bc.entry(h).spares[page as usize].expired {
                let t = flash::load_tag(&mut self.flash, &self.com, &mut self.st, block, page)?;
                let e = self.bc.entry_mut(h);
                e.spares[page as usize] = SpareSlot {
                    tag: t,
                    expired: false,
                };
                e.expired_count -= 1;
            }
        }
        Ok(())
    }

    /// Copy out a loaded tag.
    pub(crate) fn bc_tag(&self, h: u16, page: u16) -> Tag {
        let s = &self.bc.entry(h).spares[page as usize];
        debug_assert!(!s.expired, "reading an expired spare slot");
        s.tag
    }

    pub(crate) fn bc_set_tag(&mut self, h: u16, page: u16, t: Tag) {
        let e = self.bc.entry_mut(h);
        let s = &mut e.spares[page as usize];
        if s.expired {
            e.expired_count -= 1;
        }
        s.tag = t;
        s.expired = false;
    }

    /// Mark cached spares stale so the next load re-reads flash.
    pub(crate) fn bc_expire(&mut self, h: u16, page: u16) {
        let e = self.bc.entry_mut(h);
        if page == ALL_PAGES {
            for s in &mut e.spares {
                if !s.expired {
                    s.expired = true;
                    e.expired_count += 1;
                }
            }
        } else {
            let s = &mut e.spares[page as usize];
            if !s.expired {
                s.expired = true;
                e.expired_count += 1;
            }
        }
    }

    /// Pre-fill a handle for a block known to be erased, skipping flash.
    pub(crate) fn bc_init_erased(&mut self, h: u16) {
        let e = self.bc.entry_mut(h);
        for s in &mut e.spares {
            s.tag = Tag::erased();
            s.expired = false;
        }
        e.expired_count = 0;
    }

    // ---- derived per-block queries ----

    /// Lowest physical page carrying `page_id`, if any.
    pub(crate) fn find_page_with_id(&mut self, h: u16, page_id: u8) -> FlashResult<Option<u16>> {
        // the physical page can only be at or after the logical one
        for page in page_id as u16..self.com.pages_per_block {
            self.bc_load(h, page)?;
            if self.bc_tag(h, page).page_id == page_id {
                return Ok(Some(page));
            }
        }
        Ok(None)
    }

    /// The authoritative page for the `page_id` found at `page`: the highest
    /// physical page with the same id, owner and a committed tag.
    pub(crate) fn find_best_page(&mut self, h: u16, page: u16) -> FlashResult<u16> {
        if page == self.com.pages_per_block - 1 {
            return Ok(page);
        }
        self.bc_load(h, page)?;
        let old = self.bc_tag(h, page);

        self.bc_load(h, ALL_PAGES)?;
        let mut best = page;
        for i in page + 1..self.com.pages_per_block {
            let t = self.bc_tag(h, i);
            if t.page_id == old.page_id
                && t.parent == old.parent
                && t.serial == old.serial
                && t.used
                && t.committed
            {
                best = i;
            }
        }
        Ok(best)
    }

    pub(crate) fn is_page_erased(&mut self, h: u16, page: u16) -> FlashResult<bool> {
        self.bc_load(h, page)?;
        Ok(self.bc_tag(h, page).is_erased())
    }

    /// Erased pages at the tail of the block.
    pub(crate) fn free_pages_count(&mut self, h: u16) -> FlashResult<u16> {
        let mut count = 0;
        for page in (0..self.com.pages_per_block).rev() {
            if self.is_page_erased(h, page)? {
                count += 1;
            } else {
                break;
            }
        }
        Ok(count)
    }

    /// Timestamp of a block; a fresh block starts the cycle.
    pub(crate) fn block_ts_of(&mut self, h: u16) -> FlashResult<u8> {
        self.bc_load(h, 0)?;
        let t = self.bc_tag(h, 0);
        if t.used {
            Ok(t.block_ts)
        } else {
            Ok(tag::first_block_ts())
        }
    }

    /// Sum of the authoritative page lengths in a FILE or DATA block.
    pub(crate) fn block_data_len(&mut self, h: u16, kind: crate::tag::ObjectType) -> FlashResult<u32> {
        let last = self.com.pages_per_block - 1;
        let full = self.com.pg_data_size;

        // fast path: a fully loaded block ends with a full page at the
        // highest possible page id
        self.bc_load(h, last)?;
        let t = self.bc_tag(h, last);
        match kind {
            crate::tag::ObjectType::File => {
                if t.page_id as u16 == last - 1 && t.data_len as u32 == full {
                    return Ok(full * (last as u32));
                }
            }
            _ => {
                if t.page_id as u16 == last && t.data_len as u32 == full {
                    return Ok(full * self.com.pages_per_block as u32);
                }
            }
        }

        self.bc_load(h, ALL_PAGES)?;
        let mut size: u32 = 0;
        let (mut page_id, start) = if kind == crate::tag::ObjectType::File {
            // page 0 of a file head block holds the info record
            (1u8, 1u16)
        } else {
            (0u8, 0u16)
        };
        for i in start..self.com.pages_per_block {
            let t = self.bc_tag(h, i);
            if t.page_id == page_id {
                let best = self.find_best_page(h, i)?;
                size += self.bc_tag(h, best).data_len as u32;
                page_id = page_id.wrapping_add(1);
            }
        }
        Ok(size)
    }

}
