#![no_std]

extern crate alloc;

// Must be first to share macros across crate
pub(crate) mod fmt;

pub mod sim;

use core::fmt::Debug;

/// ECC handling split between the core and the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum EccMode {
    /// No ECC at all.
    None,
    /// The core calculates and corrects ECC in software.
    Soft,
    /// The driver (or hardware) owns ECC; `ecc` buffers are opaque to the core.
    Hw,
    /// Like [`EccMode::Hw`], and the hardware additionally writes the ECC
    /// region of the spare by itself. The core must not overwrite that region
    /// and collapses its two spare programs into one.
    HwAuto,
}

/// Physical layout of a NAND chip, fixed at format time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Geometry {
    /// Total erase blocks on the chip.
    pub total_blocks: u32,
    /// Data bytes per page: 256, 512, 1024 or 2048.
    pub page_data_size: u32,
    /// Out-of-band bytes per page.
    pub spare_size: u32,
    /// Pages per erase block.
    pub pages_per_block: u32,
    /// Offset of the factory bad-block status byte within the spare.
    pub block_status_offs: u32,
    /// Who computes ECC.
    pub ecc: EccMode,
}

impl Geometry {
    /// Data bytes per erase block.
    pub const fn block_data_size(&self) -> u32 {
        self.page_data_size * self.pages_per_block
    }

    /// Total pages on the chip.
    pub const fn total_pages(&self) -> u32 {
        self.total_blocks * self.pages_per_block
    }
}

/// NAND flash error kinds.
///
/// Driver implementations map their concrete error onto these generic kinds
/// through the [`NandFlashError`] trait.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum NandFlashErrorKind {
    /// The arguments are out of bounds.
    OutOfBounds,

    /// The block failed during erase or program and must be retired.
    /// Contains the block index, or [None] if the specific block is unknown.
    BadBlock(Option<u16>),

    /// Read data failed ECC and could not be corrected.
    Corrupt,

    /// Error specific to the implementation.
    Other,
}

/// Convert a specific NAND flash error into a generic error kind.
pub trait NandFlashError: Debug {
    fn kind(&self) -> NandFlashErrorKind;
}

/// A trait that NandFlash implementations can use to share an error type.
pub trait ErrorType {
    /// Errors returned by this NAND flash.
    type Error: NandFlashError;
}

/// Outcome of a successful page-data read.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ReadStatus {
    /// Data read back clean.
    Ok,
    /// The driver corrected this many bit errors. Only reported when the
    /// driver owns ECC ([`EccMode::Hw`] / [`EccMode::HwAuto`]).
    Corrected(u32),
}

/// Raw NAND flash driver, page and spare granular.
///
/// Five operations are mandatory; `is_bad_block` and `mark_bad_block` have
/// default implementations in terms of the spare accessors and the status
/// byte from [`Geometry::block_status_offs`].
///
/// Program operations may only clear bits (NAND semantics); callers erase a
/// block before reusing any of its pages.
pub trait NandFlash: ErrorType {
    /// The chip layout. Must be constant for the lifetime of the device.
    fn geometry(&self) -> Geometry;

    /// Read `data.len()` bytes from the start of a page's data area.
    ///
    /// When the driver owns ECC, `ecc` (if given) receives the stored ECC
    /// bytes and the returned [`ReadStatus`] reflects correction; an
    /// uncorrectable page surfaces as an error of kind
    /// [`NandFlashErrorKind::Corrupt`]. When the core owns ECC the driver
    /// returns the raw bits and always reports [`ReadStatus::Ok`].
    fn read_page_data(
        &mut self,
        block: u16,
        page: u16,
        data: &mut [u8],
        ecc: Option<&mut [u8]>,
    ) -> Result<ReadStatus, Self::Error>;

    /// Read `spare.len()` bytes of a page's spare starting at `offs`.
    fn read_page_spare(
        &mut self,
        block: u16,
        page: u16,
        spare: &mut [u8],
        offs: u32,
    ) -> Result<(), Self::Error>;

    /// Program a page's data area. `ecc` carries the core-computed ECC when
    /// the driver is expected to store it ([`EccMode::Hw`]), otherwise `None`.
    fn write_page_data(
        &mut self,
        block: u16,
        page: u16,
        data: &[u8],
        ecc: Option<&[u8]>,
    ) -> Result<(), Self::Error>;

    /// Program `spare.len()` bytes of a page's spare starting at `offs`.
    ///
    /// With [`EccMode::HwAuto`] the driver must leave its reserved ECC region
    /// untouched regardless of the bytes passed here.
    fn write_page_spare(
        &mut self,
        block: u16,
        page: u16,
        spare: &[u8],
        offs: u32,
    ) -> Result<(), Self::Error>;

    /// Erase a block. A failing block reports
    /// [`NandFlashErrorKind::BadBlock`].
    fn erase_block(&mut self, block: u16) -> Result<(), Self::Error>;

    /// Check the factory/driver bad-block mark.
    fn is_bad_block(&mut self, block: u16) -> Result<bool, Self::Error> {
        let offs = self.geometry().block_status_offs;
        let mut status = [0xFFu8; 1];
        self.read_page_spare(block, 0, &mut status, offs)?;
        Ok(status[0] != 0xFF)
    }

    /// Write the bad-block mark: erase (best effort), then clear the status
    /// byte of page 0.
    fn mark_bad_block(&mut self, block: u16) -> Result<(), Self::Error> {
        let offs = self.geometry().block_status_offs;
        let _ = self.erase_block(block);
        self.write_page_spare(block, 0, &[0x00], offs)
    }
}

/// Return whether a page access is within the chip.
pub fn check_page<F: NandFlash>(
    flash: &F,
    block: u16,
    page: u16,
) -> Result<(), NandFlashErrorKind> {
    let g = flash.geometry();
    if (block as u32) < g.total_blocks && (page as u32) < g.pages_per_block {
        Ok(())
    } else {
        Err(NandFlashErrorKind::OutOfBounds)
    }
}

/// Return whether a block access is within the chip.
pub fn check_block<F: NandFlash>(flash: &F, block: u16) -> Result<(), NandFlashErrorKind> {
    if (block as u32) < flash.geometry().total_blocks {
        Ok(())
    } else {
        Err(NandFlashErrorKind::OutOfBounds)
    }
}
