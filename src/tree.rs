//! The in-memory index of every block on the device.
//!
//! One node per physical block, kept in a dense arena and linked by small
//! integer indices: live DIR/FILE/DATA nodes hang off chained hash tables,
//! free and bad blocks sit on doubly linked lists threaded through the same
//! two link fields. The tree is rebuilt from page-0 spares at mount.

use alloc::vec;
use alloc::vec::Vec;

use nand_flash::NandFlash;

use crate::badblock::PendingIntent;
use crate::blockinfo::ALL_PAGES;
use crate::device::Device;
use crate::error::{Error, Result};
use crate::flash::{self, FlashError};
use crate::object::FileInfo;
use crate::tag::{next_block_ts, sum16, ts_newer_than, ObjectType};
use crate::{INVALID_BLOCK, INVALID_SERIAL, ROOT_DIR_SERIAL};

pub(crate) const EMPTY_NODE: u16 = 0xFFFF;

const DIR_HASH_MASK: u16 = 0x1F;
const FILE_HASH_MASK: u16 = 0x3F;
const DATA_HASH_MASK: u16 = 0x1FF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NodeData {
    Free,
    Dir {
        block: u16,
        parent: u16,
        serial: u16,
        checksum: u16,
    },
    File {
        block: u16,
        parent: u16,
        serial: u16,
        checksum: u16,
        len: u32,
    },
    Data {
        block: u16,
        parent: u16,
        /// Block index within the file, starting at 1.
        serial: u16,
        len: u32,
    },
    List {
        block: u16,
        need_check: bool,
    },
}

impl NodeData {
    pub fn block(&self) -> u16 {
        match *self {
            NodeData::Dir { block, .. }
            | NodeData::File { block, .. }
            | NodeData::Data { block, .. }
            | NodeData::List { block, .. } => block,
            NodeData::Free => INVALID_BLOCK,
        }
    }

    pub fn set_block(&mut self, b: u16) {
        match self {
            NodeData::Dir { block, .. }
            | NodeData::File { block, .. }
            | NodeData::Data { block, .. }
            | NodeData::List { block, .. } => *block = b,
            NodeData::Free => {}
        }
    }

    pub fn parent(&self) -> u16 {
        match *self {
            NodeData::Dir { parent, .. }
            | NodeData::File { parent, .. }
            | NodeData::Data { parent, .. } => parent,
            _ => INVALID_SERIAL,
        }
    }

    pub fn serial(&self) -> u16 {
        match *self {
            NodeData::Dir { serial, .. }
            | NodeData::File { serial, .. }
            | NodeData::Data { serial, .. } => serial,
            _ => INVALID_SERIAL,
        }
    }

    pub fn kind(&self) -> Option<ObjectType> {
        match self {
            NodeData::Dir { .. } => Some(ObjectType::Dir),
            NodeData::File { .. } => Some(ObjectType::File),
            NodeData::Data { .. } => Some(ObjectType::Data),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct TreeNode {
    pub data: NodeData,
    pub next: u16,
    pub prev: u16,
}

/// One chained hash table; the three live-node tables are instances of this
/// with different bucket masks.
#[derive(Debug)]
struct HashChains {
    buckets: Vec<u16>,
    mask: u16,
}

impl HashChains {
    fn new(mask: u16) -> HashChains {
        HashChains {
            buckets: vec![EMPTY_NODE; mask as usize + 1],
            mask,
        }
    }

    fn slot(&self, hash: u16) -> usize {
        (hash & self.mask) as usize
    }

    fn insert(&mut self, nodes: &mut [TreeNode], hash: u16, idx: u16) {
        let slot = self.slot(hash);
        let head = self.buckets[slot];
        nodes[idx as usize].next = head;
        nodes[idx as usize].prev = EMPTY_NODE;
        if head != EMPTY_NODE {
            nodes[head as usize].prev = idx;
        }
        self.buckets[slot] = idx;
    }

    fn remove(&mut self, nodes: &mut [TreeNode], hash: u16, idx: u16) {
        let slot = self.slot(hash);
        let (prev, next) = (nodes[idx as usize].prev, nodes[idx as usize].next);
        if prev != EMPTY_NODE {
            nodes[prev as usize].next = next;
        }
        if next != EMPTY_NODE {
            nodes[next as usize].prev = prev;
        }
        if self.buckets[slot] == idx {
            self.buckets[slot] = next;
        }
        nodes[idx as usize].next = EMPTY_NODE;
        nodes[idx as usize].prev = EMPTY_NODE;
    }
}

#[derive(Debug)]
pub(crate) struct Tree {
    nodes: Vec<TreeNode>,
    free: u16,
    dirs: HashChains,
    files: HashChains,
    datas: HashChains,
    pub erased: u16,
    pub erased_tail: u16,
    pub erased_count: u16,
    pub bad: u16,
    pub bad_count: u16,
    pub max_serial: u16,
    /// Serials handed out but not yet visible in the hash tables (objects
    /// being created); keeps concurrent creates from colliding.
    reserved: Vec<u16>,
}

impl Tree {
    pub fn new(num_blocks: u16) -> Tree {
        let mut nodes = Vec::with_capacity(num_blocks as usize);
        for i in 0..num_blocks {
            nodes.push(TreeNode {
                data: NodeData::Free,
                next: if i + 1 < num_blocks { i + 1 } else { EMPTY_NODE },
                prev: EMPTY_NODE,
            });
        }
        Tree {
            nodes,
            free: if num_blocks > 0 { 0 } else { EMPTY_NODE },
            dirs: HashChains::new(DIR_HASH_MASK),
            files: HashChains::new(FILE_HASH_MASK),
            datas: HashChains::new(DATA_HASH_MASK),
            erased: EMPTY_NODE,
            erased_tail: EMPTY_NODE,
            erased_count: 0,
            bad: EMPTY_NODE,
            bad_count: 0,
            max_serial: ROOT_DIR_SERIAL,
            reserved: Vec::new(),
        }
    }

    pub fn reset(&mut self) {
        *self = Tree::new(self.nodes.len() as u16);
    }

    pub fn node(&self, idx: u16) -> &TreeNode {
        &self.nodes[idx as usize]
    }

    pub fn node_mut(&mut self, idx: u16) -> &mut TreeNode {
        &mut self.nodes[idx as usize]
    }

    pub fn alloc_node(&mut self) -> u16 {
        // exactly one node exists per block; running out is a logic bug
        let idx = self.free;
        assert!(idx != EMPTY_NODE, "tree node pool exhausted");
        self.free = self.nodes[idx as usize].next;
        let n = &mut self.nodes[idx as usize];
        n.next = EMPTY_NODE;
        n.prev = EMPTY_NODE;
        n.data = NodeData::Free;
        idx
    }

    fn hash_of(&self, data: &NodeData) -> Option<(u8, u16)> {
        match *data {
            NodeData::Dir { serial, .. } => Some((0, serial & DIR_HASH_MASK)),
            NodeData::File { serial, .. } => Some((1, serial & FILE_HASH_MASK)),
            NodeData::Data { parent, serial, .. } => {
                Some((2, parent.wrapping_add(serial) & DATA_HASH_MASK))
            }
            _ => None,
        }
    }

    /// Hook a DIR/FILE/DATA node into its hash table.
    pub fn insert(&mut self, idx: u16) {
        let data = self.nodes[idx as usize].data;
        let (table, hash) = self.hash_of(&data).expect("inserting a non-object node");
        match table {
            0 => self.dirs.insert(&mut self.nodes, hash, idx),
            1 => self.files.insert(&mut self.nodes, hash, idx),
            _ => self.datas.insert(&mut self.nodes, hash, idx),
        }
        let serial = data.serial();
        if !matches!(data, NodeData::Data { .. }) && serial != INVALID_SERIAL {
            if serial > self.max_serial {
                self.max_serial = serial;
            }
        }
    }

    /// Unhook a DIR/FILE/DATA node from its hash table.
    pub fn break_from(&mut self, idx: u16) {
        let data = self.nodes[idx as usize].data;
        let (table, hash) = self.hash_of(&data).expect("breaking a non-object node");
        match table {
            0 => self.dirs.remove(&mut self.nodes, hash, idx),
            1 => self.files.remove(&mut self.nodes, hash, idx),
            _ => self.datas.remove(&mut self.nodes, hash, idx),
        }
    }

    pub fn find_dir(&self, serial: u16) -> Option<u16> {
        let mut x = self.dirs.buckets[self.dirs.slot(serial)];
        while x != EMPTY_NODE {
            if self.nodes[x as usize].data.serial() == serial {
                return Some(x);
            }
            x = self.nodes[x as usize].next;
        }
        None
    }

    pub fn find_file(&self, serial: u16) -> Option<u16> {
        let mut x = self.files.buckets[self.files.slot(serial)];
        while x != EMPTY_NODE {
            if self.nodes[x as usize].data.serial() == serial {
                return Some(x);
            }
            x = self.nodes[x as usize].next;
        }
        None
    }

    pub fn find_data(&self, parent: u16, serial: u16) -> Option<u16> {
        let mut x = self.datas.buckets[self.datas.slot(parent.wrapping_add(serial))];
        while x != EMPTY_NODE {
            let d = &self.nodes[x as usize].data;
            if d.parent() == parent && d.serial() == serial {
                return Some(x);
            }
            x = self.nodes[x as usize].next;
        }
        None
    }

    pub fn find_from_tree(&self, kind: ObjectType, parent: u16, serial: u16) -> Option<u16> {
        match kind {
            ObjectType::Dir => self.find_dir(serial),
            ObjectType::File => self.find_file(serial),
            ObjectType::Data => self.find_data(parent, serial),
        }
    }

    /// Any DIR under `parent`?
    pub fn find_dir_with_parent(&self, parent: u16) -> Option<u16> {
        self.collect_dirs()
            .into_iter()
            .find(|&i| self.nodes[i as usize].data.parent() == parent)
    }

    /// Any FILE under `parent`?
    pub fn find_file_with_parent(&self, parent: u16) -> Option<u16> {
        self.collect_files()
            .into_iter()
            .find(|&i| self.nodes[i as usize].data.parent() == parent)
    }

    fn collect_chains(chains: &HashChains, nodes: &[TreeNode]) -> Vec<u16> {
        let mut out = Vec::new();
        for &head in &chains.buckets {
            let mut x = head;
            while x != EMPTY_NODE {
                out.push(x);
                x = nodes[x as usize].next;
            }
        }
        out
    }

    pub fn collect_dirs(&self) -> Vec<u16> {
        Self::collect_chains(&self.dirs, &self.nodes)
    }

    pub fn collect_files(&self) -> Vec<u16> {
        Self::collect_chains(&self.files, &self.nodes)
    }

    pub fn collect_datas(&self) -> Vec<u16> {
        Self::collect_chains(&self.datas, &self.nodes)
    }

    /// Bucket-ordered walk used by directory iteration: entries of `table`
    /// (0 dir, 1 file) whose parent is `parent`, starting after `after`.
    pub fn next_child(&self, table: u8, parent: u16, after: Option<u16>) -> Option<u16> {
        let chains = if table == 0 { &self.dirs } else { &self.files };
        let all = Self::collect_chains(chains, &self.nodes);
        let start = match after {
            None => 0,
            Some(idx) => match all.iter().position(|&i| i == idx) {
                Some(p) => p + 1,
                None => 0,
            },
        };
        all[start..]
            .iter()
            .copied()
            .find(|&i| self.nodes[i as usize].data.parent() == parent)
    }

    pub fn find_node_by_block(&self, block: u16) -> Option<(u16, ObjectType)> {
        for idx in self.collect_datas() {
            if self.nodes[idx as usize].data.block() == block {
                return Some((idx, ObjectType::Data));
            }
        }
        for idx in self.collect_files() {
            if self.nodes[idx as usize].data.block() == block {
                return Some((idx, ObjectType::File));
            }
        }
        for idx in self.collect_dirs() {
            if self.nodes[idx as usize].data.block() == block {
                return Some((idx, ObjectType::Dir));
            }
        }
        None
    }

    // ---- erased / bad lists ----

    pub fn push_erased_tail(&mut self, idx: u16, need_check: Option<bool>) {
        if let Some(nc) = need_check {
            if let NodeData::List { need_check, .. } = &mut self.nodes[idx as usize].data {
                *need_check = nc;
            } else {
                let block = self.nodes[idx as usize].data.block();
                self.nodes[idx as usize].data = NodeData::List {
                    block,
                    need_check: nc,
                };
            }
        } else if !matches!(self.nodes[idx as usize].data, NodeData::List { .. }) {
            let block = self.nodes[idx as usize].data.block();
            self.nodes[idx as usize].data = NodeData::List {
                block,
                need_check: false,
            };
        }

        self.nodes[idx as usize].next = EMPTY_NODE;
        self.nodes[idx as usize].prev = self.erased_tail;
        if self.erased_tail != EMPTY_NODE {
            self.nodes[self.erased_tail as usize].next = idx;
        }
        self.erased_tail = idx;
        if self.erased == EMPTY_NODE {
            self.erased = idx;
        }
        self.erased_count += 1;
    }

    /// Pop the next erased block without verifying it.
    pub fn pop_erased_raw(&mut self) -> Option<u16> {
        let idx = self.erased;
        if idx == EMPTY_NODE {
            return None;
        }
        let next = self.nodes[idx as usize].next;
        self.erased = next;
        if next != EMPTY_NODE {
            self.nodes[next as usize].prev = EMPTY_NODE;
        } else {
            self.erased_tail = EMPTY_NODE;
        }
        self.nodes[idx as usize].next = EMPTY_NODE;
        self.erased_count -= 1;
        Some(idx)
    }

    pub fn push_bad(&mut self, idx: u16) {
        if !matches!(self.nodes[idx as usize].data, NodeData::List { .. }) {
            let block = self.nodes[idx as usize].data.block();
            self.nodes[idx as usize].data = NodeData::List {
                block,
                need_check: false,
            };
        }
        self.nodes[idx as usize].prev = EMPTY_NODE;
        self.nodes[idx as usize].next = self.bad;
        if self.bad != EMPTY_NODE {
            self.nodes[self.bad as usize].prev = idx;
        }
        self.bad = idx;
        self.bad_count += 1;
    }

    // ---- serial numbers ----

    /// A free object serial, or None when the space is exhausted. Creation
    /// windows are covered by [`Tree::reserve_serial`].
    pub fn find_free_serial(&self) -> Option<u16> {
        for serial in ROOT_DIR_SERIAL + 1..crate::PARENT_OF_ROOT {
            if self.find_dir(serial).is_none()
                && self.find_file(serial).is_none()
                && !self.reserved.contains(&serial)
            {
                return Some(serial);
            }
        }
        None
    }

    pub fn reserve_serial(&mut self, serial: u16) {
        if !self.reserved.contains(&serial) {
            self.reserved.push(serial);
        }
    }

    pub fn release_serial(&mut self, serial: u16) {
        self.reserved.retain(|&s| s != serial);
    }
}

struct BlockTypeStats {
    dir: u32,
    file: u32,
    data: u32,
}

impl<F: NandFlash> Device<F> {
    /// Take a verified erased block off the free list, preparing its block
    /// info as all-erased. `Err(NoMem)` when the device is out of space.
    pub(crate) fn get_erased_node(&mut self) -> Result<u16> {
        loop {
            let idx = match self.tree.pop_erased_raw() {
                Some(i) => i,
                None => {
                    warn!("no erased block available");
                    return Err(Error::NoMem);
                }
            };
            if let NodeData::List {
                block,
                need_check: true,
            } = self.tree.node(idx).data
            {
                let clean =
                    flash::check_erased_block(&mut self.flash, &self.com, &mut self.st, block)
                        .unwrap_or(false);
                if !clean {
                    debug!("block {} not fully erased, erasing now", block);
                    if !self.tree_erase_node(idx)? {
                        // node went to the bad list, take another
                        continue;
                    }
                }
                if let NodeData::List { need_check, .. } = &mut self.tree.node_mut(idx).data {
                    *need_check = false;
                }
            }
            let block = self.tree.node(idx).data.block();
            let h = self.bc_get(block);
            self.bc_init_erased(h);
            self.bc_put(h);
            return Ok(idx);
        }
    }

    /// Erase the block a list node points at. On a bad-block failure the
    /// node is swapped onto the bad list and `Ok(false)` is returned.
    pub(crate) fn tree_erase_node(&mut self, idx: u16) -> Result<bool> {
        let block = self.tree.node(idx).data.block();
        match flash::erase_block(&mut self.flash, &mut self.st, block) {
            Ok(()) => Ok(true),
            Err(FlashError::BadBlock) => {
                self.bad_block_process_node(idx);
                Ok(false)
            }
            Err(_) => Err(Error::Io),
        }
    }

    // ---- name lookup (needs flash access for the name bytes) ----

    /// Compare `name` against the object stored in `node`'s page 0.
    pub(crate) fn compare_object_name(
        &mut self,
        node: u16,
        kind: ObjectType,
        name: &[u8],
        sum: u16,
    ) -> Result<bool> {
        let b = self.buf_get_ex(kind, node, 0)?;
        let fi = FileInfo::decode(self.buf_data(b));
        let stored_sum = sum16(fi.name());
        let matched = stored_sum == sum && fi.name() == name;
        self.buf_put(b);
        Ok(matched)
    }

    pub(crate) fn find_dir_by_name(
        &mut self,
        name: &[u8],
        sum: u16,
        parent: u16,
    ) -> Result<Option<u16>> {
        for idx in self.tree.collect_dirs() {
            let d = self.tree.node(idx).data;
            if let NodeData::Dir {
                checksum,
                parent: p,
                ..
            } = d
            {
                if checksum == sum
                    && p == parent
                    && self.compare_object_name(idx, ObjectType::Dir, name, sum)?
                {
                    return Ok(Some(idx));
                }
            }
        }
        Ok(None)
    }

    pub(crate) fn find_file_by_name(
        &mut self,
        name: &[u8],
        sum: u16,
        parent: u16,
    ) -> Result<Option<u16>> {
        for idx in self.tree.collect_files() {
            let d = self.tree.node(idx).data;
            if let NodeData::File {
                checksum,
                parent: p,
                ..
            } = d
            {
                if checksum == sum
                    && p == parent
                    && self.compare_object_name(idx, ObjectType::File, name, sum)?
                {
                    return Ok(Some(idx));
                }
            }
        }
        Ok(None)
    }

    // ---- mount: the three build passes ----

    pub(crate) fn build_tree(&mut self) -> Result<()> {
        self.tree.reset();
        self.build_step_one()?;
        self.bad_block_recover_all();
        self.build_step_two();
        self.build_step_three();
        self.bad_block_recover_all();
        info!(
            "tree built: {} erased, {} bad, max serial {}",
            self.tree.erased_count, self.tree.bad_count, self.tree.max_serial
        );
        Ok(())
    }

    /// Classify every block in the partition.
    fn build_step_one(&mut self) -> Result<()> {
        let mut st = BlockTypeStats {
            dir: 0,
            file: 0,
            data: 0,
        };

        for block in self.cfg.start_block..=self.cfg.end_block {
            let node = self.tree.alloc_node();
            self.tree.node_mut(node).data = NodeData::List {
                block,
                need_check: false,
            };

            if flash::is_bad_block(&mut self.flash, block) {
                info!("found bad block {}", block);
                self.tree.push_bad(node);
                continue;
            }

            let h = self.bc_get(block);
            let classify = self.classify_block(node, h, block, &mut st);
            self.bc_put(h);
            classify?;
        }

        debug!(
            "scan: {} dirs, {} files, {} data blocks",
            st.dir, st.file, st.data
        );
        Ok(())
    }

    fn classify_block(
        &mut self,
        node: u16,
        h: u16,
        block: u16,
        st: &mut BlockTypeStats,
    ) -> Result<()> {
        let page0_erased = match self.is_page_erased(h, 0) {
            Ok(v) => v,
            Err(_) => {
                // spare unreadable; treat as a block to retire
                self.bad_block_process_node(node);
                return Ok(());
            }
        };

        if page0_erased {
            // tag says erased; make sure the data was never touched
            let head =
                flash::read_page_head_byte(&mut self.flash, &mut self.st, block, 0).unwrap_or(0);
            if head != 0xFF {
                warn!("block {} page 0 unclean under an erased tag, erasing", block);
                match flash::erase_block(&mut self.flash, &mut self.st, block) {
                    Ok(()) => self.tree.push_erased_tail(node, Some(false)),
                    Err(_) => self.bad_block_process_node(node),
                }
            } else {
                // clean page 0 does not vouch for the rest of the block
                self.tree.push_erased_tail(node, Some(true));
            }
            return Ok(());
        }

        // live block: first look for a trailing unclean page
        if self.scan_unclean_pages(h, block).is_err() {
            return Err(Error::Io);
        }
        if self.process_pending_block(node, block) {
            return Ok(());
        }
        self.build_valid_node(node, h, block, st)
    }

    /// Scan a used block from the tail for half-written pages (crash damage).
    /// Queues the block for cleanup or recovery via the pending tracker.
    fn scan_unclean_pages(&mut self, h: u16, block: u16) -> core::result::Result<(), FlashError> {
        for page in (1..self.com.pages_per_block).rev() {
            let load = self.bc_load(h, page);
            if let Ok(()) = load {
                let t = self.bc_tag(h, page);
                if t.is_sealed() {
                    break;
                }
                if t.is_half_written() || (t.used && !t.check_ok) {
                    warn!("unclean page found, block {} page {}", block, page);
                    self.bad.add(block, PendingIntent::Cleanup);
                    break;
                }
                if t.is_erased() {
                    // clean tag; the data itself must be untouched too
                    let head =
                        flash::read_page_head_byte(&mut self.flash, &mut self.st, block, page)?;
                    if head != 0xFF {
                        warn!("dirty data under clean tag, block {} page {}", block, page);
                        self.bad.add(block, PendingIntent::Cleanup);
                        break;
                    }
                    continue;
                }
                // used but not sealed and not half-written: checksum damage
                self.bad.add(block, PendingIntent::Cleanup);
                break;
            } else {
                warn!("spare unreadable, block {} page {}", block, page);
                self.bad.add(block, PendingIntent::Recover);
                break;
            }
        }
        Ok(())
    }

    /// Handle a block queued as pending during the scan. Returns true when
    /// consumed (node parked on a list).
    pub(crate) fn process_pending_block(&mut self, node: u16, block: u16) -> bool {
        match self.bad.get(block) {
            Some(PendingIntent::Cleanup) => {
                self.bad.remove(block);
                self.tree.node_mut(node).data = NodeData::List {
                    block,
                    need_check: false,
                };
                match flash::erase_block(&mut self.flash, &mut self.st, block) {
                    Ok(()) => self.tree.push_erased_tail(node, Some(false)),
                    Err(_) => self.bad_block_process_node(node),
                }
                true
            }
            Some(PendingIntent::MarkBad) => {
                self.bad.remove(block);
                self.tree.node_mut(node).data = NodeData::List {
                    block,
                    need_check: false,
                };
                self.bad_block_process_node(node);
                true
            }
            Some(PendingIntent::Recover) | None => false,
        }
    }

    fn build_valid_node(
        &mut self,
        node: u16,
        h: u16,
        block: u16,
        st: &mut BlockTypeStats,
    ) -> Result<()> {
        if self.bc_load(h, 0).is_err() {
            // page 0 unreadable: nothing to rebuild from, retire the block
            self.bad.add(block, PendingIntent::MarkBad);
            self.process_pending_block(node, block);
            return Ok(());
        }
        let tag0 = self.bc_tag(h, 0);

        if !tag0.is_sealed() {
            // page 0 never finished; the whole block is garbage
            warn!("block {} page 0 not sealed, erasing", block);
            match flash::erase_block(&mut self.flash, &mut self.st, block) {
                Ok(()) => self.tree.push_erased_tail(node, Some(false)),
                Err(_) => self.bad_block_process_node(node),
            }
            return Ok(());
        }

        let kind = match tag0.kind() {
            Some(k) => k,
            None => {
                warn!("block {} has unknown type {}, erasing", block, tag0.kind_raw);
                match flash::erase_block(&mut self.flash, &mut self.st, block) {
                    Ok(()) => self.tree.push_erased_tail(node, Some(false)),
                    Err(_) => self.bad_block_process_node(node),
                }
                return Ok(());
            }
        };

        let (parent, serial) = (tag0.parent, tag0.serial);

        // alternate with the same identity? newer timestamp wins
        let mut node = node;
        if let Some(alt) = self.tree.find_from_tree(kind, parent, serial) {
            let alt_block = self.tree.node(alt).data.block();
            info!(
                "two generations of ({} {}): blocks {} and {}",
                parent, serial, block, alt_block
            );
            let ah = self.bc_get(alt_block);
            let alt_loaded = self.bc_load(ah, 0);
            let alt_ts = if alt_loaded.is_ok() {
                self.bc_tag(ah, 0).block_ts
            } else {
                // unreadable alternate loses: pretend it is one generation back
                next_block_ts(next_block_ts(tag0.block_ts))
            };
            self.bc_put(ah);

            let loser_block = if ts_newer_than(tag0.block_ts, alt_ts) {
                // this block is newer: retire the alternate, reuse its node
                self.tree.break_from(alt);
                self.tree.node_mut(node).data = NodeData::List {
                    block: alt_block,
                    need_check: false,
                };
                let old_node = node;
                node = alt;
                self.tree.node_mut(node).data = NodeData::List {
                    block,
                    need_check: false,
                };
                match flash::erase_block(&mut self.flash, &mut self.st, alt_block) {
                    Ok(()) => self.tree.push_erased_tail(old_node, Some(false)),
                    Err(_) => self.bad_block_process_node(old_node),
                }
                alt_block
            } else {
                // the alternate stays; this block is stale
                self.tree.node_mut(node).data = NodeData::List {
                    block,
                    need_check: false,
                };
                match flash::erase_block(&mut self.flash, &mut self.st, block) {
                    Ok(()) => self.tree.push_erased_tail(node, Some(false)),
                    Err(_) => self.bad_block_process_node(node),
                }
                block
            };
            if loser_block == block {
                return Ok(());
            }
        }

        // name checksum comes from the stored info record, not the tag
        let mut name_sum = 0u16;
        if kind != ObjectType::Data {
            if self.bc_load(h, ALL_PAGES).is_err() {
                self.bad.add(block, PendingIntent::MarkBad);
                self.process_pending_block(node, block);
                return Ok(());
            }
            let page = match self.find_page_with_id(h, 0) {
                Ok(Some(p)) => p,
                Ok(None) => {
                    warn!("block {}: no page carries id 0, erasing", block);
                    match flash::erase_block(&mut self.flash, &mut self.st, block) {
                        Ok(()) => self.tree.push_erased_tail(node, Some(false)),
                        Err(_) => self.bad_block_process_node(node),
                    }
                    return Ok(());
                }
                Err(_) => {
                    self.bad.add(block, PendingIntent::MarkBad);
                    self.process_pending_block(node, block);
                    return Ok(());
                }
            };
            let best = match self.find_best_page(h, page) {
                Ok(p) => p,
                Err(_) => {
                    self.bad.add(block, PendingIntent::MarkBad);
                    self.process_pending_block(node, block);
                    return Ok(());
                }
            };
            let mut scratch = vec![0u8; self.com.pg_size as usize];
            match flash::read_page(
                &mut self.flash,
                &self.com,
                &mut self.st,
                block,
                best,
                &mut scratch,
                true,
            ) {
                Ok(corrected) => {
                    if corrected > 0 {
                        self.bad.add(block, PendingIntent::Recover);
                    }
                }
                Err(FlashError::Uncorrectable) | Err(FlashError::BadBlock) => {
                    self.bad.add(block, PendingIntent::Recover);
                }
                Err(FlashError::Io) => return Err(Error::Io),
            }
            let fi = FileInfo::decode(&scratch);
            name_sum = sum16(fi.name());
        }

        match kind {
            ObjectType::Dir => {
                self.tree.node_mut(node).data = NodeData::Dir {
                    block,
                    parent,
                    serial,
                    checksum: name_sum,
                };
                st.dir += 1;
            }
            ObjectType::File => {
                let len = self.block_data_len(h, ObjectType::File).map_err(|_| Error::Io)?;
                self.tree.node_mut(node).data = NodeData::File {
                    block,
                    parent,
                    serial,
                    checksum: name_sum,
                    len,
                };
                st.file += 1;
            }
            ObjectType::Data => {
                let len = self.block_data_len(h, ObjectType::Data).map_err(|_| Error::Io)?;
                self.tree.node_mut(node).data = NodeData::Data {
                    block,
                    parent,
                    serial,
                    len,
                };
                st.data += 1;
            }
        }
        self.tree.insert(node);
        Ok(())
    }

    /// Rotate the erased list by a wall-clock amount so allocation doesn't
    /// always start at the lowest block.
    fn build_step_two(&mut self) {
        let count = self.tree.erased_count as u32;
        let rotate = (self.cfg.now)() % (count + 1);
        for _ in 0..rotate {
            if let Some(idx) = self.tree.pop_erased_raw() {
                self.tree.push_erased_tail(idx, None);
            }
        }
    }

    /// Consistency sweep: orphans are erased, file lengths are summed up.
    fn build_step_three(&mut self) {
        // directories whose parent is gone
        for idx in self.tree.collect_dirs() {
            let parent = self.tree.node(idx).data.parent();
            if parent != ROOT_DIR_SERIAL && self.tree.find_dir(parent).is_none() {
                warn!(
                    "orphan directory block {}, erasing",
                    self.tree.node(idx).data.block()
                );
                self.retire_live_node(idx);
            }
        }

        // files missing their highest data block (a hole we can't represent)
        for idx in self.tree.collect_files() {
            let serial = self.tree.node(idx).data.serial();
            let max = self
                .tree
                .collect_datas()
                .into_iter()
                .filter(|&d| self.tree.node(d).data.parent() == serial)
                .map(|d| self.tree.node(d).data.serial())
                .max()
                .unwrap_or(0);
            let mut broken = false;
            for s in 1..=max {
                if self.tree.find_data(serial, s).is_none() {
                    broken = true;
                    break;
                }
            }
            if broken {
                warn!(
                    "file {} is missing a data block, erasing head block {}",
                    serial,
                    self.tree.node(idx).data.block()
                );
                self.retire_live_node(idx);
            }
        }

        // files whose parent directory is gone
        for idx in self.tree.collect_files() {
            let parent = self.tree.node(idx).data.parent();
            if parent != ROOT_DIR_SERIAL && self.tree.find_dir(parent).is_none() {
                warn!(
                    "orphan file block {}, erasing",
                    self.tree.node(idx).data.block()
                );
                self.retire_live_node(idx);
            }
        }

        // data blocks: drop orphans, add lengths onto their file
        for idx in self.tree.collect_datas() {
            let (parent, len) = {
                let d = self.tree.node(idx).data;
                (d.parent(), match d {
                    NodeData::Data { len, .. } => len,
                    _ => 0,
                })
            };
            match self.tree.find_file(parent) {
                None => {
                    warn!(
                        "orphan data block {}, erasing",
                        self.tree.node(idx).data.block()
                    );
                    self.retire_live_node(idx);
                }
                Some(f) => {
                    if let NodeData::File { len: flen, .. } = &mut self.tree.node_mut(f).data {
                        *flen += len;
                    }
                }
            }
        }
    }

    /// Break a live node out of its hash table and erase its block back onto
    /// the erased list (or the bad list if the erase fails).
    pub(crate) fn retire_live_node(&mut self, idx: u16) {
        let block = self.tree.node(idx).data.block();
        self.tree.break_from(idx);
        self.tree.node_mut(idx).data = NodeData::List {
            block,
            need_check: false,
        };
        match flash::erase_block(&mut self.flash, &mut self.st, block) {
            Ok(()) => self.tree.push_erased_tail(idx, Some(false)),
            Err(_) => self.bad_block_process_node(idx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_log::test;

    #[test]
    fn hash_chain_insert_and_remove() {
        let mut tree = Tree::new(16);
        for serial in 1..=5u16 {
            let idx = tree.alloc_node();
            tree.node_mut(idx).data = NodeData::File {
                block: serial + 10,
                parent: 0,
                serial,
                checksum: 0,
                len: 0,
            };
            tree.insert(idx);
        }
        assert!(tree.find_file(3).is_some());
        assert_eq!(tree.max_serial, 5);

        let idx = tree.find_file(3).unwrap();
        tree.break_from(idx);
        assert!(tree.find_file(3).is_none());
        assert!(tree.find_file(2).is_some());
        assert!(tree.find_file(4).is_some());
    }

    #[test]
    fn colliding_serials_chain() {
        let mut tree = Tree::new(300);
        // 1 and 1 + 64 collide in the file table
        for serial in [1u16, 65u16] {
            let idx = tree.alloc_node();
            tree.node_mut(idx).data = NodeData::File {
                block: serial,
                parent: 0,
                serial,
                checksum: 0,
                len: 0,
            };
            tree.insert(idx);
        }
        assert!(tree.find_file(1).is_some());
        assert!(tree.find_file(65).is_some());
    }

    #[test]
    fn erased_list_fifo() {
        let mut tree = Tree::new(8);
        for block in 0..4u16 {
            let idx = tree.alloc_node();
            tree.node_mut(idx).data = NodeData::List {
                block,
                need_check: false,
            };
            tree.push_erased_tail(idx, None);
        }
        assert_eq!(tree.erased_count, 4);
        let first = tree.pop_erased_raw().unwrap();
        assert_eq!(tree.node(first).data.block(), 0);
        tree.push_erased_tail(first, None);
        let second = tree.pop_erased_raw().unwrap();
        assert_eq!(tree.node(second).data.block(), 1);
    }

    #[test]
    fn serial_allocation_skips_taken_and_reserved() {
        let mut tree = Tree::new(8);
        let idx = tree.alloc_node();
        tree.node_mut(idx).data = NodeData::File {
            block: 1,
            parent: 0,
            serial: 1,
            checksum: 0,
            len: 0,
        };
        tree.insert(idx);
        tree.reserve_serial(2);
        assert_eq!(tree.find_free_serial(), Some(3));
        tree.release_serial(2);
        assert_eq!(tree.find_free_serial(), Some(2));
    }

    #[test]
    fn data_nodes_key_on_parent_and_serial() {
        let mut tree = Tree::new(8);
        for (parent, serial) in [(7u16, 1u16), (7, 2), (8, 1)] {
            let idx = tree.alloc_node();
            tree.node_mut(idx).data = NodeData::Data {
                block: serial,
                parent,
                serial,
                len: 0,
            };
            tree.insert(idx);
        }
        assert!(tree.find_data(7, 1).is_some());
        assert!(tree.find_data(7, 2).is_some());
        assert!(tree.find_data(8, 1).is_some());
        assert!(tree.find_data(8, 2).is_none());
    }
}
