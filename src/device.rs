//! One mounted partition: the driver plus every per-device subsystem.

use nand_flash::{EccMode, NandFlash};

use crate::badblock::BadBlockTracker;
use crate::blockinfo::BlockInfoCache;
use crate::buf::PageBufPool;
use crate::error::{Error, Result};
use crate::flash::{self, Com, Statistics};
use crate::tag;
use crate::tree::Tree;

fn zero_seconds() -> u32 {
    0
}

/// Per-device tunables. The defaults match the sizes the engine was designed
/// around; raise the buffer counts for throughput, never below the defaults.
#[derive(Debug, Clone, Copy)]
pub struct DeviceConfig {
    /// First block of the partition (absolute chip block).
    pub start_block: u16,
    /// Last block of the partition, inclusive.
    pub end_block: u16,
    /// Page buffers in the pool.
    pub max_page_buffers: u16,
    /// Dirty pages a group may hold before it auto-flushes; clamped to
    /// pages-per-block.
    pub max_dirty_pages: u16,
    /// Concurrent dirty groups (objects with pending writes).
    pub dirty_groups: u16,
    /// Block-info cache entries.
    pub max_cached_blocks: u16,
    /// Creation and append stop when fewer erased blocks remain.
    pub min_erased_blocks: u16,
    /// Store an 8-bit checksum in every tag.
    pub tag_checksum: bool,
    /// Wall clock for timestamps and the mount-time wear rotation.
    pub now: fn() -> u32,
}

impl DeviceConfig {
    pub fn new(start_block: u16, end_block: u16) -> DeviceConfig {
        DeviceConfig {
            start_block,
            end_block,
            max_page_buffers: 40,
            max_dirty_pages: 32,
            dirty_groups: 3,
            max_cached_blocks: 10,
            min_erased_blocks: 2,
            tag_checksum: true,
            now: zero_seconds,
        }
    }

    pub fn with_clock(mut self, now: fn() -> u32) -> DeviceConfig {
        self.now = now;
        self
    }
}

/// A device owns a contiguous block range of one NAND chip and everything
/// needed to run a file system on it.
pub struct Device<F: NandFlash> {
    pub(crate) flash: F,
    pub(crate) cfg: DeviceConfig,
    pub(crate) com: Com,
    pub(crate) st: Statistics,
    pub(crate) bc: BlockInfoCache,
    pub(crate) buf: PageBufPool,
    pub(crate) tree: Tree,
    pub(crate) bad: BadBlockTracker,
    mounted: bool,
}

impl<F: NandFlash> Device<F> {
    /// Validate the geometry and size every pool. No flash I/O happens here;
    /// call [`Device::mount`] to scan the media.
    pub fn new(flash: F, mut cfg: DeviceConfig) -> Result<Device<F>> {
        let geo = flash.geometry();

        if !matches!(geo.page_data_size, 256 | 512 | 1024 | 2048) {
            error!("unsupported page size {}", geo.page_data_size);
            return Err(Error::Inval);
        }
        if geo.spare_size < tag::spare_bytes_needed() as u32 || geo.spare_size > 64 {
            error!("spare size {} out of range", geo.spare_size);
            return Err(Error::Inval);
        }
        if geo.block_status_offs >= geo.spare_size {
            return Err(Error::Inval);
        }
        if geo.pages_per_block < 2 || geo.pages_per_block > 256 {
            return Err(Error::Inval);
        }
        if cfg.start_block > cfg.end_block || cfg.end_block as u32 >= geo.total_blocks {
            return Err(Error::Inval);
        }

        let com = Com::new(&geo, cfg.tag_checksum);
        cfg.max_dirty_pages = cfg.max_dirty_pages.min(com.pages_per_block).max(2);
        cfg.dirty_groups = cfg.dirty_groups.clamp(1, 32);
        // block cover needs headroom beyond one full dirty group
        if cfg.max_page_buffers < com.pages_per_block + 4 {
            cfg.max_page_buffers = com.pages_per_block + 4;
        }
        if cfg.max_cached_blocks < 3 {
            cfg.max_cached_blocks = 3;
        }

        let num_blocks = cfg.end_block - cfg.start_block + 1;
        Ok(Device {
            bc: BlockInfoCache::new(cfg.max_cached_blocks, com.pages_per_block),
            buf: PageBufPool::new(
                cfg.max_page_buffers,
                com.pg_size,
                cfg.dirty_groups,
                cfg.max_dirty_pages,
            ),
            tree: Tree::new(num_blocks),
            bad: BadBlockTracker::new(),
            st: Statistics::default(),
            flash,
            cfg,
            com,
            mounted: false,
        })
    }

    /// Scan the partition and build the block index.
    pub fn mount(&mut self) -> Result<()> {
        if self.mounted {
            return Err(Error::Inval);
        }
        info!(
            "mounting blocks {}..={}",
            self.cfg.start_block, self.cfg.end_block
        );
        self.build_tree()?;
        self.mounted = true;
        Ok(())
    }

    /// Flush everything and drop the index. Fails while objects still hold
    /// buffers.
    pub fn unmount(&mut self) -> Result<()> {
        if !self.mounted {
            return Err(Error::Inval);
        }
        if !self.buf.all_free() {
            warn!("unmount with referenced buffers");
            return Err(Error::Access);
        }
        self.buf_flush_all()?;
        self.drain_pending();
        self.buf.set_all_empty();
        self.bc.expire_all();
        self.mounted = false;
        Ok(())
    }

    /// Erase every good block of the partition and rebuild an empty tree.
    /// Refused while any buffer is referenced or dirty.
    pub fn format(&mut self) -> Result<()> {
        if !self.buf.all_free() {
            warn!("format with referenced buffers");
            return Err(Error::Access);
        }
        if self.buf.any_dirty() {
            warn!("format with dirty buffers");
            return Err(Error::Access);
        }
        self.buf.set_all_empty();

        if !self.bc.all_free() {
            warn!("format with referenced block info");
            return Err(Error::Access);
        }
        self.bc.expire_all();

        for block in self.cfg.start_block..=self.cfg.end_block {
            if flash::is_bad_block(&mut self.flash, block) {
                debug!("format keeps bad block {}", block);
                continue;
            }
            if flash::erase_block(&mut self.flash, &mut self.st, block).is_err() {
                let _ = flash::mark_bad_block(&mut self.flash, block);
            }
        }

        self.build_tree()?;
        self.mounted = true;
        Ok(())
    }

    /// Drain pending bad blocks; called at operation safe points.
    pub(crate) fn drain_pending(&mut self) {
        if self.bad.has_pending() {
            self.bad_block_recover_all();
        }
    }

    pub fn is_mounted(&self) -> bool {
        self.mounted
    }

    /// Usable payload bytes per page (ECC tail excluded).
    pub fn page_data_size(&self) -> u32 {
        self.com.pg_data_size
    }

    pub fn pages_per_block(&self) -> u32 {
        self.com.pages_per_block as u32
    }

    /// Usable bytes per block.
    pub fn block_data_size(&self) -> u32 {
        self.com.block_data_size()
    }

    pub fn total_blocks(&self) -> u16 {
        self.cfg.end_block - self.cfg.start_block + 1
    }

    pub fn erased_blocks(&self) -> u16 {
        self.tree.erased_count
    }

    pub fn bad_blocks(&self) -> u16 {
        self.tree.bad_count
    }

    pub fn space_total(&self) -> u32 {
        self.total_blocks() as u32 * self.com.block_data_size()
    }

    pub fn space_free(&self) -> u32 {
        self.tree.erased_count as u32 * self.com.block_data_size()
    }

    pub fn space_used(&self) -> u32 {
        (self.total_blocks() - self.tree.bad_count - self.tree.erased_count) as u32
            * self.com.block_data_size()
    }

    pub fn stats(&self) -> &Statistics {
        &self.st
    }

    pub fn ecc_mode(&self) -> EccMode {
        self.com.ecc_mode
    }

    /// Consume the device and hand the driver back.
    pub fn release(self) -> F {
        self.flash
    }
}
