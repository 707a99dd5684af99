//! Directory iteration: walk the dir hash chains, then the file chains,
//! yielding every child of one directory.

use nand_flash::NandFlash;

use crate::device::Device;
use crate::error::Result;
use crate::object::ObjectInfo;
use crate::tag::ObjectType;

/// Iteration state over one directory's children. The position survives
/// across calls; entries created or removed mid-iteration may or may not be
/// observed, like any hash-order readdir.
#[derive(Debug, Clone)]
pub struct DirFinder {
    serial: u16,
    /// 0: walking subdirectories, 1: walking files, 2: exhausted.
    stage: u8,
    last: Option<u16>,
}

impl DirFinder {
    pub fn new(dir_serial: u16) -> DirFinder {
        DirFinder {
            serial: dir_serial,
            stage: 0,
            last: None,
        }
    }

    pub fn rewind(&mut self) {
        self.stage = 0;
        self.last = None;
    }
}

impl<F: NandFlash> Device<F> {
    /// Next child of the directory, or None when done.
    pub(crate) fn find_next_object(&mut self, f: &mut DirFinder) -> Result<Option<ObjectInfo>> {
        loop {
            match f.stage {
                0 | 1 => {
                    match self.tree.next_child(f.stage, f.serial, f.last) {
                        Some(node) => {
                            f.last = Some(node);
                            let kind = if f.stage == 0 {
                                ObjectType::Dir
                            } else {
                                ObjectType::File
                            };
                            return Ok(Some(self.load_object_info(node, kind)?));
                        }
                        None => {
                            f.stage += 1;
                            f.last = None;
                        }
                    }
                }
                _ => return Ok(None),
            }
        }
    }
}
