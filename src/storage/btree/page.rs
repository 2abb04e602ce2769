use crate::core::errors::{BrackenError, StorageError};
use crate::storage::block::file::BlockFile;

use super::cell::{CellIter, CellKind, CellUnpack};
use super::disk::{self, PageKind, DISK_HEADER_SIZE};

/// One revision in an update chain, newest first. A tombstone marks the
/// key or slot as deleted.
#[derive(Debug, Clone, Default)]
pub struct Update {
    pub tombstone: bool,
    pub value: Vec<u8>,
}

/// A key/value pair added in memory between on-disk slots.
#[derive(Debug, Clone)]
pub struct Insert {
    pub key: Vec<u8>,
    pub upd: Vec<Update>,
}

impl Insert {
    pub fn is_live(&self) -> bool {
        self.upd.first().map_or(true, |u| !u.tombstone)
    }
}

/// Where a key or value is stored: inline in the page image, or on a
/// separate overflow page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CellRef {
    Inline(Vec<u8>),
    Ovfl { addr: u32, size: u32 },
}

#[derive(Debug, Clone)]
pub struct RowSlot {
    pub key: CellRef,
    pub value: CellRef,
}

/// A col-var-leaf slot's unpacked cell; `None` slots stand for a single
/// deleted record.
#[derive(Debug, Clone, Copy)]
pub struct ColVarCell {
    pub rle: u64,
    pub data_len: usize,
    pub ovfl: Option<(u32, u32)>,
}

/// A column-store child reference carrying the subtree's starting record
/// number.
#[derive(Debug, Clone, Copy)]
pub struct ColRef {
    pub recno: u64,
    pub addr: u32,
    pub size: u32,
}

/// A row-store child reference bounded by a fence key.
#[derive(Debug, Clone)]
pub struct RowRef {
    pub fence: CellRef,
    pub addr: u32,
    pub size: u32,
}

#[derive(Debug)]
pub enum PageContent {
    ColFixLeaf {
        recno: u64,
        records: Vec<u8>,
        updates: Vec<Vec<Update>>,
    },
    ColVarLeaf {
        recno: u64,
        slots: Vec<Option<ColVarCell>>,
        inserts: Vec<Vec<Update>>,
    },
    ColInternal {
        recno: u64,
        children: Vec<ColRef>,
    },
    RowLeaf {
        slots: Vec<RowSlot>,
        smallest: Vec<Insert>,
        inserts: Vec<Vec<Insert>>,
        updates: Vec<Vec<Update>>,
    },
    RowInternal {
        children: Vec<RowRef>,
    },
    Overflow {
        data: Vec<u8>,
    },
}

/// An in-memory page mirroring its on-disk image.
///
/// `disk` retains the raw image the page was built from; row-internal
/// pages holding no overflow cells discard it after load.
#[derive(Debug)]
pub struct Page {
    pub addr: u32,
    pub size: u32,
    pub entries: u32,
    pub disk: Option<Vec<u8>>,
    pub content: PageContent,
}

impl Page {
    pub fn kind(&self) -> PageKind {
        match self.content {
            PageContent::ColFixLeaf { .. } => PageKind::ColFixLeaf,
            PageContent::ColVarLeaf { .. } => PageKind::ColVarLeaf,
            PageContent::ColInternal { .. } => PageKind::ColInternal,
            PageContent::RowLeaf { .. } => PageKind::RowLeaf,
            PageContent::RowInternal { .. } => PageKind::RowInternal,
            PageContent::Overflow { .. } => PageKind::Overflow,
        }
    }

    /// The starting record number for column-store pages.
    pub(crate) fn recno(&self) -> Option<u64> {
        match &self.content {
            PageContent::ColFixLeaf { recno, .. }
            | PageContent::ColVarLeaf { recno, .. }
            | PageContent::ColInternal { recno, .. } => Some(*recno),
            _ => None,
        }
    }

    /// Build the in-memory form of a validated page image.
    pub(crate) fn from_image(
        addr: u32,
        size: u32,
        image: Vec<u8>,
        fixed_len: u32,
    ) -> Result<Page, StorageError> {
        let hdr = disk::parse_header(&image, addr)?;
        let entries = hdr.entries as usize;
        let payload = &image[DISK_HEADER_SIZE..hdr.datalen as usize];

        let mut saw_ovfl = false;
        let content = match hdr.kind {
            PageKind::ColFixLeaf => {
                let need = entries * fixed_len as usize;
                if payload.len() < need {
                    return Err(StorageError(format!(
                        "page at addr {addr} is too small for {entries} fixed-length records"
                    )));
                }
                PageContent::ColFixLeaf {
                    recno: hdr.recno,
                    records: payload[..need].to_vec(),
                    updates: vec![Vec::new(); entries],
                }
            }
            PageKind::ColVarLeaf => {
                let mut cells = CellIter::new(payload);
                let mut slots = Vec::with_capacity(entries);
                for _ in 0..entries {
                    let cell = next_cell(&mut cells, addr, hdr.kind)?;
                    saw_ovfl |= cell.off.is_some();
                    slots.push(match cell.kind {
                        CellKind::Del => None,
                        CellKind::Value | CellKind::ValueOvfl => Some(ColVarCell {
                            rle: cell.rle,
                            data_len: cell.data.len(),
                            ovfl: cell.off,
                        }),
                        other => return Err(unexpected_cell(addr, hdr.kind, other)),
                    });
                }
                PageContent::ColVarLeaf {
                    recno: hdr.recno,
                    slots,
                    inserts: vec![Vec::new(); entries],
                }
            }
            PageKind::ColInternal => {
                let mut cells = CellIter::new(payload);
                let mut children = Vec::with_capacity(entries);
                for _ in 0..entries {
                    let cell = next_cell(&mut cells, addr, hdr.kind)?;
                    let (caddr, csize) = match (cell.kind, cell.off) {
                        (CellKind::ChildRecno, Some(off)) => off,
                        (other, _) => return Err(unexpected_cell(addr, hdr.kind, other)),
                    };
                    children.push(ColRef {
                        recno: cell.recno,
                        addr: caddr,
                        size: csize,
                    });
                }
                PageContent::ColInternal {
                    recno: hdr.recno,
                    children,
                }
            }
            PageKind::RowLeaf => {
                let mut cells = CellIter::new(payload);
                let mut slots = Vec::with_capacity(entries);
                for _ in 0..entries {
                    let key = next_cell(&mut cells, addr, hdr.kind)?;
                    let key = match key.kind {
                        CellKind::Key => CellRef::Inline(key.data),
                        CellKind::KeyOvfl => {
                            saw_ovfl = true;
                            let (a, s) = key.off.unwrap_or((0, 0));
                            CellRef::Ovfl { addr: a, size: s }
                        }
                        other => return Err(unexpected_cell(addr, hdr.kind, other)),
                    };
                    let value = next_cell(&mut cells, addr, hdr.kind)?;
                    let value = match value.kind {
                        CellKind::Value => CellRef::Inline(value.data),
                        CellKind::ValueOvfl => {
                            saw_ovfl = true;
                            let (a, s) = value.off.unwrap_or((0, 0));
                            CellRef::Ovfl { addr: a, size: s }
                        }
                        other => return Err(unexpected_cell(addr, hdr.kind, other)),
                    };
                    slots.push(RowSlot { key, value });
                }
                PageContent::RowLeaf {
                    slots,
                    smallest: Vec::new(),
                    inserts: vec![Vec::new(); entries],
                    updates: vec![Vec::new(); entries],
                }
            }
            PageKind::RowInternal => {
                let mut cells = CellIter::new(payload);
                let mut children = Vec::with_capacity(entries);
                for _ in 0..entries {
                    let fence = next_cell(&mut cells, addr, hdr.kind)?;
                    let fence = match fence.kind {
                        CellKind::Key => CellRef::Inline(fence.data),
                        CellKind::KeyOvfl => {
                            saw_ovfl = true;
                            let (a, s) = fence.off.unwrap_or((0, 0));
                            CellRef::Ovfl { addr: a, size: s }
                        }
                        other => return Err(unexpected_cell(addr, hdr.kind, other)),
                    };
                    let child = next_cell(&mut cells, addr, hdr.kind)?;
                    let (caddr, csize) = match (child.kind, child.off) {
                        (CellKind::Child, Some(off)) => off,
                        (other, _) => return Err(unexpected_cell(addr, hdr.kind, other)),
                    };
                    children.push(RowRef {
                        fence,
                        addr: caddr,
                        size: csize,
                    });
                }
                PageContent::RowInternal { children }
            }
            PageKind::Overflow => PageContent::Overflow {
                data: payload.to_vec(),
            },
        };

        // Row-internal images exist only to carry overflow fence keys; with
        // none present the image is dropped after load.
        let disk = match &content {
            PageContent::RowInternal { .. } if !saw_ovfl => None,
            _ => Some(image),
        };

        Ok(Page {
            addr,
            size,
            entries: hdr.entries as u32,
            disk,
            content,
        })
    }
}

fn next_cell(
    cells: &mut CellIter<'_>,
    addr: u32,
    kind: PageKind,
) -> Result<CellUnpack, StorageError> {
    match cells.next() {
        Some(cell) => cell,
        None => Err(StorageError(format!(
            "page at addr {addr} ({}) has fewer cells than its entry count",
            kind.name()
        ))),
    }
}

fn unexpected_cell(addr: u32, kind: PageKind, cell: CellKind) -> StorageError {
    StorageError(format!(
        "page at addr {addr} ({}) holds an unexpected {cell:?} cell",
        kind.name()
    ))
}

/// Materialize a logical key into a caller-owned buffer, reading the
/// overflow page when the key is stored out-of-line.
pub(crate) fn materialize_key(bf: &mut BlockFile, key: &CellRef) -> Result<Vec<u8>, BrackenError> {
    match key {
        CellRef::Inline(bytes) => Ok(bytes.clone()),
        CellRef::Ovfl { addr, size } => {
            let image = bf.read_frags(*addr, *size)?;
            let hdr = disk::verify_chunk(&image, *addr, *size)?;
            if hdr.kind != PageKind::Overflow {
                return Err(StorageError(format!(
                    "page at addr {addr} is a {} where an overflow page was expected",
                    hdr.kind.name()
                ))
                .into());
            }
            Ok(image[DISK_HEADER_SIZE..hdr.datalen as usize].to_vec())
        }
    }
}
