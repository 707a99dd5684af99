//! An in-RAM NAND flash simulation for testing the layers above.
//!
//! Pages program with AND semantics (bits can only be cleared), blocks erase
//! to 0xFF, factory-bad blocks carry a cleared status byte, and erase/program
//! failures can be injected per block to exercise bad-block handling.

use alloc::vec;
use alloc::vec::Vec;

use crate::{
    check_block, check_page, EccMode, ErrorType, Geometry, NandFlash, NandFlashError,
    NandFlashErrorKind, ReadStatus,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SimError {
    /// Erase or program failed; the block should be retired.
    BadBlock(u16),
    /// Out of bounds access.
    OutOfBounds,
    /// Anything else.
    Io,
}

impl NandFlashError for SimError {
    fn kind(&self) -> NandFlashErrorKind {
        match self {
            SimError::BadBlock(b) => NandFlashErrorKind::BadBlock(Some(*b)),
            SimError::OutOfBounds => NandFlashErrorKind::OutOfBounds,
            SimError::Io => NandFlashErrorKind::Other,
        }
    }
}

impl From<NandFlashErrorKind> for SimError {
    fn from(kind: NandFlashErrorKind) -> Self {
        match kind {
            NandFlashErrorKind::OutOfBounds => SimError::OutOfBounds,
            _ => SimError::Io,
        }
    }
}

#[derive(Debug, Clone)]
struct SimPage {
    data: Vec<u8>,
    spare: Vec<u8>,
    /// Spare programs since the last erase of the owning block.
    spare_writes: u32,
}

/// The simulated chip.
#[derive(Debug, Clone)]
pub struct SimNand {
    geo: Geometry,
    pages: Vec<SimPage>,
    fail_erase: Vec<bool>,
    fail_program: Vec<bool>,
    pub erase_count: Vec<u32>,
    pub page_read_count: u32,
    pub page_write_count: u32,
    pub spare_read_count: u32,
    pub spare_write_count: u32,
}

impl SimNand {
    pub fn new(geo: Geometry) -> Self {
        let pages = (0..geo.total_pages())
            .map(|_| SimPage {
                data: vec![0xFF; geo.page_data_size as usize],
                spare: vec![0xFF; geo.spare_size as usize],
                spare_writes: 0,
            })
            .collect();
        SimNand {
            geo,
            pages,
            fail_erase: vec![false; geo.total_blocks as usize],
            fail_program: vec![false; geo.total_blocks as usize],
            erase_count: vec![0; geo.total_blocks as usize],
            page_read_count: 0,
            page_write_count: 0,
            spare_read_count: 0,
            spare_write_count: 0,
        }
    }

    /// Stock factory bad-block marks, like a chip fresh from the fab.
    pub fn with_bad_blocks(mut self, blocks: &[u16]) -> Self {
        for &b in blocks {
            let idx = self.page_index(b, 0);
            self.pages[idx].spare[self.geo.block_status_offs as usize] = 0x00;
        }
        self
    }

    /// Make future erases of `block` fail with `BadBlock`.
    pub fn inject_erase_failure(&mut self, block: u16) {
        self.fail_erase[block as usize] = true;
    }

    /// Make future programs of `block` fail with `BadBlock`.
    pub fn inject_program_failure(&mut self, block: u16) {
        self.fail_program[block as usize] = true;
    }

    /// Flip one bit in the stored page data, simulating NAND bit rot.
    pub fn corrupt_bit(&mut self, block: u16, page: u16, byte: usize, bit: u8) {
        let idx = self.page_index(block, page);
        self.pages[idx].data[byte] ^= 1 << bit;
    }

    /// Largest number of spare programs any page saw between erases.
    pub fn max_spare_writes(&self) -> u32 {
        self.pages.iter().map(|p| p.spare_writes).max().unwrap_or(0)
    }

    pub fn raw_spare(&self, block: u16, page: u16) -> &[u8] {
        &self.pages[self.page_index(block, page)].spare
    }

    pub fn raw_data(&self, block: u16, page: u16) -> &[u8] {
        &self.pages[self.page_index(block, page)].data
    }

    fn page_index(&self, block: u16, page: u16) -> usize {
        (block as usize) * (self.geo.pages_per_block as usize) + page as usize
    }
}

impl ErrorType for SimNand {
    type Error = SimError;
}

impl NandFlash for SimNand {
    fn geometry(&self) -> Geometry {
        self.geo
    }

    fn read_page_data(
        &mut self,
        block: u16,
        page: u16,
        data: &mut [u8],
        _ecc: Option<&mut [u8]>,
    ) -> Result<ReadStatus, Self::Error> {
        check_page(self, block, page)?;
        if data.len() > self.geo.page_data_size as usize {
            return Err(SimError::OutOfBounds);
        }
        let idx = self.page_index(block, page);
        data.copy_from_slice(&self.pages[idx].data[..data.len()]);
        self.page_read_count += 1;
        Ok(ReadStatus::Ok)
    }

    fn read_page_spare(
        &mut self,
        block: u16,
        page: u16,
        spare: &mut [u8],
        offs: u32,
    ) -> Result<(), Self::Error> {
        check_page(self, block, page)?;
        let offs = offs as usize;
        if offs + spare.len() > self.geo.spare_size as usize {
            return Err(SimError::OutOfBounds);
        }
        let idx = self.page_index(block, page);
        spare.copy_from_slice(&self.pages[idx].spare[offs..offs + spare.len()]);
        self.spare_read_count += 1;
        Ok(())
    }

    fn write_page_data(
        &mut self,
        block: u16,
        page: u16,
        data: &[u8],
        _ecc: Option<&[u8]>,
    ) -> Result<(), Self::Error> {
        check_page(self, block, page)?;
        if data.len() > self.geo.page_data_size as usize {
            return Err(SimError::OutOfBounds);
        }
        if self.fail_program[block as usize] {
            return Err(SimError::BadBlock(block));
        }
        let idx = self.page_index(block, page);
        for (cell, byte) in self.pages[idx].data.iter_mut().zip(data.iter()) {
            *cell &= *byte;
        }
        self.page_write_count += 1;
        Ok(())
    }

    fn write_page_spare(
        &mut self,
        block: u16,
        page: u16,
        spare: &[u8],
        offs: u32,
    ) -> Result<(), Self::Error> {
        check_page(self, block, page)?;
        let offs = offs as usize;
        if offs + spare.len() > self.geo.spare_size as usize {
            return Err(SimError::OutOfBounds);
        }
        if self.fail_program[block as usize] {
            return Err(SimError::BadBlock(block));
        }
        let idx = self.page_index(block, page);
        for (cell, byte) in self.pages[idx].spare[offs..].iter_mut().zip(spare.iter()) {
            *cell &= *byte;
        }
        self.pages[idx].spare_writes += 1;
        self.spare_write_count += 1;
        Ok(())
    }

    fn erase_block(&mut self, block: u16) -> Result<(), Self::Error> {
        check_block(self, block)?;
        if self.fail_erase[block as usize] {
            return Err(SimError::BadBlock(block));
        }
        trace!("sim: erase block {}", block);
        let start = self.page_index(block, 0);
        for page in &mut self.pages[start..start + self.geo.pages_per_block as usize] {
            page.data.fill(0xFF);
            page.spare.fill(0xFF);
            page.spare_writes = 0;
        }
        self.erase_count[block as usize] += 1;
        Ok(())
    }
}

/// A convenient small-page geometry: 512+16 pages, software ECC.
pub fn geometry_512(total_blocks: u32, pages_per_block: u32) -> Geometry {
    Geometry {
        total_blocks,
        page_data_size: 512,
        spare_size: 16,
        pages_per_block,
        block_status_offs: 5,
        ecc: EccMode::Soft,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Adds logging to the test automatically
    // control with RUST_LOG="LEVEL"
    // requires --features log passed to cargo test
    use test_log::test;

    fn chip() -> SimNand {
        SimNand::new(geometry_512(8, 4))
    }

    #[test]
    fn erased_chip_reads_ff() {
        let mut flash = chip();
        let mut buf = [0u8; 512];
        flash.read_page_data(3, 2, &mut buf, None).unwrap();
        assert!(buf.iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn program_is_and_semantics() {
        let mut flash = chip();
        flash.write_page_data(0, 0, &[0xF0; 16], None).unwrap();
        flash.write_page_data(0, 0, &[0x0F; 16], None).unwrap();
        let mut buf = [0u8; 16];
        flash.read_page_data(0, 0, &mut buf, None).unwrap();
        assert!(buf.iter().all(|&b| b == 0x00));
    }

    #[test]
    fn erase_restores_ff() {
        let mut flash = chip();
        flash.write_page_data(1, 0, &[0u8; 512], None).unwrap();
        flash.write_page_spare(1, 0, &[0u8; 16], 0).unwrap();
        flash.erase_block(1).unwrap();
        let mut buf = [1u8; 512];
        flash.read_page_data(1, 0, &mut buf, None).unwrap();
        assert!(buf.iter().all(|&b| b == 0xFF));
        let mut spare = [0u8; 16];
        flash.read_page_spare(1, 0, &mut spare, 0).unwrap();
        assert!(spare.iter().all(|&b| b == 0xFF));
        assert_eq!(flash.erase_count[1], 1);
    }

    #[test]
    fn factory_bad_block_mark() {
        let mut flash = chip().with_bad_blocks(&[5]);
        assert!(flash.is_bad_block(5).unwrap());
        assert!(!flash.is_bad_block(4).unwrap());
    }

    #[test]
    fn mark_bad_block_clears_status() {
        let mut flash = chip();
        flash.mark_bad_block(2).unwrap();
        assert!(flash.is_bad_block(2).unwrap());
    }

    #[test]
    fn injected_erase_failure() {
        let mut flash = chip();
        flash.inject_erase_failure(3);
        let err = flash.erase_block(3).unwrap_err();
        assert_eq!(err.kind(), NandFlashErrorKind::BadBlock(Some(3)));
    }

    #[test]
    fn spare_write_counter_resets_on_erase() {
        let mut flash = chip();
        flash.write_page_spare(0, 1, &[0xAA; 4], 0).unwrap();
        flash.write_page_spare(0, 1, &[0xAA; 4], 0).unwrap();
        assert_eq!(flash.max_spare_writes(), 2);
        flash.erase_block(0).unwrap();
        assert_eq!(flash.max_spare_writes(), 0);
    }
}
