//! Page-IO: everything that touches the driver goes through here.
//!
//! A page is committed in three steps so that power loss never leaves an
//! ambiguous page: (1) program the spare with the pending flag set, (2)
//! program the data (ECC computed inline for soft ECC), (3) re-program the
//! spare clearing the pending flag and sealing the checksum. A crash between
//! the steps leaves a half-written tag which mount discards. With
//! `EccMode::HwAuto` step 1 is skipped so the spare is programmed exactly
//! once. Either way each spare sees at most
//! [`PAGE_SPARE_WRITE_COUNT_LIMIT`](crate::tag::PAGE_SPARE_WRITE_COUNT_LIMIT)
//! programs between erases.

use nand_flash::{EccMode, NandFlash, NandFlashError, NandFlashErrorKind, ReadStatus};

use crate::ecc::{self, EccOutcome};
use crate::tag::{self, Tag};

/// Geometry digested for the engine: what the caches and the object layer
/// actually compute with.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Com {
    /// Bytes stored in a page's data area (payload plus soft-ECC tail).
    pub pg_size: u32,
    /// Usable payload bytes per page.
    pub pg_data_size: u32,
    /// ECC bytes per page.
    pub ecc_size: u32,
    pub pages_per_block: u16,
    pub spare_size: u32,
    pub status_offs: u32,
    pub ecc_mode: EccMode,
    pub tag_checksum: bool,
}

impl Com {
    pub fn new(geo: &nand_flash::Geometry, tag_checksum: bool) -> Com {
        let ecc_size = ecc::ecc_size(geo.page_data_size);
        let pg_data_size = match geo.ecc {
            // soft ECC lives at the tail of the data area; reserve it for
            // EccMode::None too so the format does not depend on the mode
            EccMode::None | EccMode::Soft => geo.page_data_size - ecc_size,
            // the driver owns ECC placement, the whole page is payload
            EccMode::Hw | EccMode::HwAuto => geo.page_data_size,
        };
        Com {
            pg_size: geo.page_data_size,
            pg_data_size,
            ecc_size,
            pages_per_block: geo.pages_per_block as u16,
            spare_size: geo.spare_size,
            status_offs: geo.block_status_offs,
            ecc_mode: geo.ecc,
            tag_checksum,
        }
    }

    pub fn block_data_size(&self) -> u32 {
        self.pg_data_size * self.pages_per_block as u32
    }
}

/// Flash activity counters.
#[derive(Debug, Default, Clone, Copy)]
pub struct Statistics {
    pub block_erase_count: u32,
    pub page_write_count: u32,
    pub page_read_count: u32,
    pub spare_write_count: u32,
    pub spare_read_count: u32,
}

/// How a page-IO operation went wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FlashError {
    /// The block failed and must be retired.
    BadBlock,
    /// Data came back with more bit errors than ECC can fix.
    Uncorrectable,
    /// Any other driver error.
    Io,
}

pub(crate) type FlashResult<T> = core::result::Result<T, FlashError>;

fn map_err<E: NandFlashError>(e: E) -> FlashError {
    match e.kind() {
        NandFlashErrorKind::BadBlock(_) => FlashError::BadBlock,
        NandFlashErrorKind::Corrupt => FlashError::Uncorrectable,
        _ => FlashError::Io,
    }
}

/// Read a page's full data area into `data` (`pg_size` bytes) and verify ECC.
/// Returns the number of corrected bits. With `ecc_care == false` a failed
/// check is reported as corrected-0 instead of an error; block recovery uses
/// this to salvage what it can from a dying block.
pub(crate) fn read_page<F: NandFlash>(
    flash: &mut F,
    com: &Com,
    st: &mut Statistics,
    block: u16,
    page: u16,
    data: &mut [u8],
    ecc_care: bool,
) -> FlashResult<u32> {
    debug_assert_eq!(data.len(), com.pg_size as usize);
    st.page_read_count += 1;

    match com.ecc_mode {
        EccMode::None => {
            flash
                .read_page_data(block, page, data, None)
                .map_err(map_err)?;
            Ok(0)
        }
        EccMode::Soft => {
            flash
                .read_page_data(block, page, data, None)
                .map_err(map_err)?;
            let (payload, stored) = data.split_at_mut(com.pg_data_size as usize);
            let mut calc = [0u8; 24];
            let calc = &mut calc[..com.ecc_size as usize];
            ecc::make(payload, calc);
            match ecc::correct(payload, stored, calc) {
                EccOutcome::Clean => Ok(0),
                EccOutcome::Corrected(n) => {
                    warn!("ecc corrected {} bit(s) in block {} page {}", n, block, page);
                    Ok(n)
                }
                EccOutcome::Unrecoverable if ecc_care => {
                    error!("uncorrectable ecc in block {} page {}", block, page);
                    Err(FlashError::Uncorrectable)
                }
                EccOutcome::Unrecoverable => Ok(0),
            }
        }
        EccMode::Hw | EccMode::HwAuto => {
            let mut hw_ecc = [0u8; 24];
            let res = flash.read_page_data(
                block,
                page,
                data,
                Some(&mut hw_ecc[..com.ecc_size as usize]),
            );
            match res {
                Ok(ReadStatus::Ok) => Ok(0),
                Ok(ReadStatus::Corrected(n)) => Ok(n),
                Err(e) if !ecc_care && e.kind() == NandFlashErrorKind::Corrupt => Ok(0),
                Err(e) => Err(map_err(e)),
            }
        }
    }
}

/// Read a page's spare and decode the tag.
pub(crate) fn load_tag<F: NandFlash>(
    flash: &mut F,
    com: &Com,
    st: &mut Statistics,
    block: u16,
    page: u16,
) -> FlashResult<Tag> {
    let mut spare = [0xFFu8; 64];
    let spare = &mut spare[..com.spare_size as usize];
    flash
        .read_page_spare(block, page, spare, 0)
        .map_err(map_err)?;
    st.spare_read_count += 1;
    Ok(tag::spare_decode(
        spare,
        com.status_offs as usize,
        com.tag_checksum,
    ))
}

fn write_spare<F: NandFlash>(
    flash: &mut F,
    com: &Com,
    st: &mut Statistics,
    block: u16,
    page: u16,
    t: &Tag,
) -> FlashResult<()> {
    let mut spare = [0xFFu8; 64];
    let spare = &mut spare[..com.spare_size as usize];
    tag::spare_encode(t, spare, com.status_offs as usize, com.tag_checksum);
    flash
        .write_page_spare(block, page, spare, 0)
        .map_err(map_err)?;
    st.spare_write_count += 1;
    Ok(())
}

/// Commit one page: tag metadata plus the full data area.
///
/// The target page must be erased. `data` is the `pg_size`-long buffer whose
/// ECC tail is (re)computed here for soft ECC. On return the tag is sealed
/// (`used`, `committed`, checksum written).
pub(crate) fn write_page<F: NandFlash>(
    flash: &mut F,
    com: &Com,
    st: &mut Statistics,
    block: u16,
    page: u16,
    t: &mut Tag,
    data: &mut [u8],
) -> FlashResult<()> {
    debug_assert_eq!(data.len(), com.pg_size as usize);
    trace!(
        "write block {} page {} id {} serial {} len {}",
        block,
        page,
        t.page_id,
        t.serial,
        t.data_len
    );

    t.used = true;
    t.committed = false;

    // step 1: open the page (skipped when hardware auto-writes the spare)
    if com.ecc_mode != EccMode::HwAuto {
        write_spare(flash, com, st, block, page, t)?;
    }

    // step 2: page data, ECC inline
    match com.ecc_mode {
        EccMode::Soft => {
            let (payload, ecc_area) = data.split_at_mut(com.pg_data_size as usize);
            ecc::make(payload, ecc_area);
            flash
                .write_page_data(block, page, data, None)
                .map_err(map_err)?;
        }
        EccMode::None => {
            flash
                .write_page_data(block, page, data, None)
                .map_err(map_err)?;
        }
        EccMode::Hw | EccMode::HwAuto => {
            flash
                .write_page_data(block, page, data, None)
                .map_err(map_err)?;
        }
    }
    st.page_write_count += 1;

    // step 3: seal
    t.committed = true;
    write_spare(flash, com, st, block, page, t)?;

    Ok(())
}

pub(crate) fn erase_block<F: NandFlash>(
    flash: &mut F,
    st: &mut Statistics,
    block: u16,
) -> FlashResult<()> {
    st.block_erase_count += 1;
    flash.erase_block(block).map_err(map_err)
}

pub(crate) fn is_bad_block<F: NandFlash>(flash: &mut F, block: u16) -> bool {
    flash.is_bad_block(block).unwrap_or(true)
}

pub(crate) fn mark_bad_block<F: NandFlash>(flash: &mut F, block: u16) -> FlashResult<()> {
    warn!("marking block {} bad", block);
    flash.mark_bad_block(block).map_err(map_err)
}

/// Read the first byte of a page's data area without ECC involvement. Mount
/// uses it to tell an erased page from one whose tag write was lost.
pub(crate) fn read_page_head_byte<F: NandFlash>(
    flash: &mut F,
    st: &mut Statistics,
    block: u16,
    page: u16,
) -> FlashResult<u8> {
    let mut head = [0xFFu8; 1];
    st.page_read_count += 1;
    flash
        .read_page_data(block, page, &mut head, None)
        .map_err(map_err)?;
    Ok(head[0])
}

/// Verify every page of a block shows the erased tag pattern.
pub(crate) fn check_erased_block<F: NandFlash>(
    flash: &mut F,
    com: &Com,
    st: &mut Statistics,
    block: u16,
) -> FlashResult<bool> {
    for page in 0..com.pages_per_block {
        let t = load_tag(flash, com, st, block, page)?;
        if !t.is_erased() {
            return Ok(false);
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tag::ObjectType;
    use alloc::vec;
    use nand_flash::sim::{geometry_512, SimNand};

    use test_log::test;

    fn setup() -> (SimNand, Com, Statistics) {
        let flash = SimNand::new(geometry_512(16, 8));
        let com = Com::new(&flash.geometry(), true);
        (flash, com, Statistics::default())
    }

    /// Hand-built DATA tag on an erased block: data and every tag field must
    /// read back exactly, with the page sealed.
    #[test]
    fn page_roundtrip_with_hand_built_tag() {
        let (mut flash, com, mut st) = setup();

        let mut t = Tag::new(ObjectType::Data, 100, 10, 3);
        t.block_ts = 1;
        t.data_len = com.pg_data_size as u16;

        let mut data = vec![0u8; com.pg_size as usize];
        for (i, b) in data[..com.pg_data_size as usize].iter_mut().enumerate() {
            *b = (i & 0xFF) as u8;
        }

        write_page(&mut flash, &com, &mut st, 2, 3, &mut t, &mut data).unwrap();

        let back = load_tag(&mut flash, &com, &mut st, 2, 3).unwrap();
        assert!(back.is_sealed());
        assert!(back.used && back.committed);
        assert_eq!(back.kind(), Some(ObjectType::Data));
        assert_eq!(back.page_id, 3);
        assert_eq!(back.parent, 100);
        assert_eq!(back.serial, 10);
        assert_eq!(back.block_ts, 1);
        assert_eq!(back.data_len, com.pg_data_size as u16);

        let mut read = vec![0u8; com.pg_size as usize];
        read_page(&mut flash, &com, &mut st, 2, 3, &mut read, true).unwrap();
        for (i, &b) in read[..com.pg_data_size as usize].iter().enumerate() {
            assert_eq!(b, (i & 0xFF) as u8);
        }
    }

    #[test]
    fn spare_write_budget_respected() {
        let (mut flash, com, mut st) = setup();
        let mut t = Tag::new(ObjectType::Data, 1, 1, 0);
        let mut data = vec![0xA5u8; com.pg_size as usize];
        write_page(&mut flash, &com, &mut st, 0, 0, &mut t, &mut data).unwrap();
        assert!(flash.max_spare_writes() <= tag::PAGE_SPARE_WRITE_COUNT_LIMIT);
    }

    #[test]
    fn single_bit_rot_corrected_on_read() {
        let (mut flash, com, mut st) = setup();
        let mut t = Tag::new(ObjectType::Data, 1, 1, 0);
        t.data_len = 16;
        let mut data = vec![0x5Au8; com.pg_size as usize];
        write_page(&mut flash, &com, &mut st, 1, 0, &mut t, &mut data).unwrap();

        flash.corrupt_bit(1, 0, 100, 4);

        let mut read = vec![0u8; com.pg_size as usize];
        let corrected = read_page(&mut flash, &com, &mut st, 1, 0, &mut read, true).unwrap();
        assert_eq!(corrected, 1);
        assert_eq!(read[100], 0x5A);
    }

    #[test]
    fn double_bit_rot_is_uncorrectable() {
        let (mut flash, com, mut st) = setup();
        let mut t = Tag::new(ObjectType::Data, 1, 1, 0);
        let mut data = vec![0x33u8; com.pg_size as usize];
        write_page(&mut flash, &com, &mut st, 1, 0, &mut t, &mut data).unwrap();

        flash.corrupt_bit(1, 0, 10, 0);
        flash.corrupt_bit(1, 0, 11, 0);

        let mut read = vec![0u8; com.pg_size as usize];
        let err = read_page(&mut flash, &com, &mut st, 1, 0, &mut read, true).unwrap_err();
        assert_eq!(err, FlashError::Uncorrectable);

        // the salvage path still reads it
        read_page(&mut flash, &com, &mut st, 1, 0, &mut read, false).unwrap();
    }

    #[test]
    fn erased_block_detected() {
        let (mut flash, com, mut st) = setup();
        assert!(check_erased_block(&mut flash, &com, &mut st, 4).unwrap());
        let mut t = Tag::new(ObjectType::Data, 1, 1, 0);
        let mut data = vec![0u8; com.pg_size as usize];
        write_page(&mut flash, &com, &mut st, 4, 0, &mut t, &mut data).unwrap();
        assert!(!check_erased_block(&mut flash, &com, &mut st, 4).unwrap());
    }

    #[test]
    fn bad_block_error_maps() {
        let (mut flash, com, mut st) = setup();
        flash.inject_program_failure(7);
        let mut t = Tag::new(ObjectType::Data, 1, 1, 0);
        let mut data = vec![0u8; com.pg_size as usize];
        let err = write_page(&mut flash, &com, &mut st, 7, 0, &mut t, &mut data).unwrap_err();
        assert_eq!(err, FlashError::BadBlock);
    }
}
