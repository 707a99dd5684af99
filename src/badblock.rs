//! Bad-block tracking and recovery.
//!
//! Failures never propagate past a safe point: a block that errors during
//! read ECC, program or erase is queued here with an intent and drained at
//! the next flush/close/mount boundary. Recovery copies whatever is legible
//! onto a fresh erased block (ECC failures tolerated), swaps the tree node
//! over and retires the failed block with a bad mark.

use alloc::vec::Vec;

use nand_flash::NandFlash;

use crate::blockinfo::ALL_PAGES;
use crate::device::Device;
use crate::flash;
use crate::tag::{next_block_ts, Tag};
use crate::tree::NodeData;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PendingIntent {
    /// Erase and put back on the free list (crash garbage, no live data).
    Cleanup,
    /// Evacuate live data, then mark bad.
    Recover,
    /// Mark bad without evacuation.
    MarkBad,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct PendingBlock {
    pub block: u16,
    pub intent: PendingIntent,
}

/// The design keeps the pending set tiny: one block per operation plus
/// whatever a mount scan queues before draining.
#[derive(Debug, Default)]
pub(crate) struct BadBlockTracker {
    pending: Vec<PendingBlock>,
}

impl BadBlockTracker {
    pub fn new() -> BadBlockTracker {
        BadBlockTracker {
            pending: Vec::new(),
        }
    }

    pub fn add(&mut self, block: u16, intent: PendingIntent) {
        if let Some(p) = self.pending.iter_mut().find(|p| p.block == block) {
            // a stronger intent wins over a weaker one
            if intent == PendingIntent::MarkBad {
                p.intent = intent;
            }
            return;
        }
        self.pending.push(PendingBlock { block, intent });
    }

    pub fn get(&self, block: u16) -> Option<PendingIntent> {
        self.pending
            .iter()
            .find(|p| p.block == block)
            .map(|p| p.intent)
    }

    pub fn is_pending(&self, block: u16) -> bool {
        self.get(block).is_some()
    }

    pub fn remove(&mut self, block: u16) {
        self.pending.retain(|p| p.block != block);
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    fn next_recover(&self) -> Option<u16> {
        self.pending
            .iter()
            .find(|p| p.intent != PendingIntent::Cleanup)
            .map(|p| p.block)
    }
}

impl<F: NandFlash> Device<F> {
    /// Erase (best effort), write the bad mark and park the node on the bad
    /// list. The node must already be off every hash chain.
    pub(crate) fn bad_block_process_node(&mut self, node: u16) {
        let block = self.tree.node(node).data.block();
        self.bad.remove(block);
        let _ = flash::erase_block(&mut self.flash, &mut self.st, block);
        let _ = flash::mark_bad_block(&mut self.flash, block);
        self.tree.node_mut(node).data = NodeData::List {
            block,
            need_check: false,
        };
        self.tree.push_bad(node);
    }

    /// Drain every pending block that still holds live data.
    pub(crate) fn bad_block_recover_all(&mut self) {
        while let Some(block) = self.bad.next_recover() {
            self.bad_block_recover_one(block);
        }
        // anything left is cleanup-only: erase and refill the free list
        while let Some(p) = self.bad.pending.first().copied() {
            self.bad.remove(p.block);
            if let Some((idx, _)) = self.tree.find_node_by_block(p.block) {
                self.retire_live_node(idx);
            }
        }
    }

    /// Copy the failing block's content to a fresh block, swap the owning
    /// tree node over and retire the failing block.
    fn bad_block_recover_one(&mut self, bad_block: u16) {
        self.bad.remove(bad_block);

        let good = match self.get_erased_node() {
            Ok(n) => n,
            Err(_) => {
                error!("no free block to replace bad block {}", bad_block);
                return;
            }
        };
        let good_block = self.tree.node(good).data.block();

        let h = self.bc_get(bad_block);
        let mut good_dirty = false;
        let mut salvaged = true;

        for i in 0..self.com.pages_per_block {
            let page = match self.find_page_with_id(h, i as u8) {
                Ok(Some(p)) => p,
                Ok(None) => break, // past the last live page
                Err(_) => {
                    salvaged = false;
                    break;
                }
            };
            let page = match self.find_best_page(h, page) {
                Ok(p) => p,
                Err(_) => {
                    salvaged = false;
                    break;
                }
            };
            let old_tag = self.bc_tag(h, page);

            let cidx = match self.buf_clone(None) {
                Ok(c) => c,
                Err(_) => {
                    salvaged = false;
                    break;
                }
            };
            // the block is failing; take the bits as they are
            if self.read_into_buf(cidx, bad_block, page, false).is_err() {
                self.buf_free_clone(cidx);
                salvaged = false;
                break;
            }

            let mut tag = Tag {
                block_ts: next_block_ts(old_tag.block_ts),
                ..old_tag
            };
            tag.data_len = old_tag.data_len.min(self.com.pg_data_size as u16);
            {
                let b = self.buf.buf_mut(cidx);
                b.kind_raw = old_tag.kind_raw;
                b.parent = old_tag.parent;
                b.serial = old_tag.serial;
                b.page_id = old_tag.page_id as u16;
                b.data_len = tag.data_len;
            }

            let res = {
                let data = &mut self.buf.buf_mut(cidx).data;
                flash::write_page(
                    &mut self.flash,
                    &self.com,
                    &mut self.st,
                    good_block,
                    i,
                    &mut tag,
                    data,
                )
            };
            good_dirty = true;
            self.buf_free_clone(cidx);
            if res.is_err() {
                salvaged = false;
                break;
            }
        }
        self.bc_expire(h, ALL_PAGES);
        self.bc_put(h);

        if good_dirty {
            // the cached all-erased image of the fresh block is stale now
            let gh = self.bc_get(good_block);
            self.bc_expire(gh, ALL_PAGES);
            self.bc_put(gh);
        }

        if salvaged {
            if let Some((owner, _)) = self.tree.find_node_by_block(bad_block) {
                info!("bad block {} replaced by {}", bad_block, good_block);
                self.tree.node_mut(owner).data.set_block(good_block);
                self.tree.node_mut(good).data = NodeData::List {
                    block: bad_block,
                    need_check: false,
                };
                self.bad_block_process_node(good);
                return;
            }
            // nothing in the tree points at it; block was already orphaned
            warn!("pending bad block {} has no owner in the tree", bad_block);
        }

        // recovery did not pan out: put the good block back unused
        let mut needs_check = false;
        if good_dirty {
            needs_check = flash::erase_block(&mut self.flash, &mut self.st, good_block).is_err();
        }
        self.tree.push_erased_tail(good, Some(needs_check));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_log::test;

    #[test]
    fn add_is_idempotent_and_upgrades() {
        let mut t = BadBlockTracker::new();
        t.add(7, PendingIntent::Recover);
        t.add(7, PendingIntent::Recover);
        assert_eq!(t.pending.len(), 1);
        assert_eq!(t.get(7), Some(PendingIntent::Recover));

        t.add(7, PendingIntent::MarkBad);
        assert_eq!(t.get(7), Some(PendingIntent::MarkBad));

        t.remove(7);
        assert!(!t.has_pending());
    }
}
