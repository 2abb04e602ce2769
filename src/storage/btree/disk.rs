use byteorder::{ByteOrder, LittleEndian};
use crc32fast::Hasher;

use crate::core::errors::StorageError;

use super::cell;

// Image header layout (little-endian), offsets in bytes:
//   0: checksum (u32)  - crc32 of bytes 4..datalen
//   4: datalen (u32)   - meaningful bytes, header included
//   8: kind (u8)
//   9: pad (u8)
//  10: entries (u16)
//  12: recno (u64)     - column-store starting record number, else 0
//  20: reserved (u32)
pub(crate) const DISK_HEADER_SIZE: usize = 24;

const HDR_CHECKSUM: usize = 0;
const HDR_DATALEN: usize = 4;
const HDR_KIND: usize = 8;
const HDR_ENTRIES: usize = 10;
const HDR_RECNO: usize = 12;

const KIND_COL_FIX_LEAF: u8 = 1;
const KIND_COL_VAR_LEAF: u8 = 2;
const KIND_COL_INTERNAL: u8 = 3;
const KIND_ROW_LEAF: u8 = 4;
const KIND_ROW_INTERNAL: u8 = 5;
const KIND_OVERFLOW: u8 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    ColFixLeaf,
    ColVarLeaf,
    ColInternal,
    RowLeaf,
    RowInternal,
    Overflow,
}

impl PageKind {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            KIND_COL_FIX_LEAF => Some(Self::ColFixLeaf),
            KIND_COL_VAR_LEAF => Some(Self::ColVarLeaf),
            KIND_COL_INTERNAL => Some(Self::ColInternal),
            KIND_ROW_LEAF => Some(Self::RowLeaf),
            KIND_ROW_INTERNAL => Some(Self::RowInternal),
            KIND_OVERFLOW => Some(Self::Overflow),
            _ => None,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::ColFixLeaf => KIND_COL_FIX_LEAF,
            Self::ColVarLeaf => KIND_COL_VAR_LEAF,
            Self::ColInternal => KIND_COL_INTERNAL,
            Self::RowLeaf => KIND_ROW_LEAF,
            Self::RowInternal => KIND_ROW_INTERNAL,
            Self::Overflow => KIND_OVERFLOW,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::ColFixLeaf => "col-fix-leaf",
            Self::ColVarLeaf => "col-var-leaf",
            Self::ColInternal => "col-internal",
            Self::RowLeaf => "row-leaf",
            Self::RowInternal => "row-internal",
            Self::Overflow => "overflow",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct DiskHeader {
    pub datalen: u32,
    pub kind: PageKind,
    pub entries: u16,
    pub recno: u64,
}

/// Parse an image header without validating the checksum.
pub(crate) fn parse_header(image: &[u8], addr: u32) -> Result<DiskHeader, StorageError> {
    if image.len() < DISK_HEADER_SIZE {
        return Err(StorageError(format!(
            "page at addr {addr} is too small for an image header"
        )));
    }
    let kind_byte = image[HDR_KIND];
    let kind = PageKind::from_u8(kind_byte)
        .ok_or_else(|| StorageError(format!("unknown page kind {kind_byte} at addr {addr}")))?;
    Ok(DiskHeader {
        datalen: LittleEndian::read_u32(&image[HDR_DATALEN..]),
        kind,
        entries: LittleEndian::read_u16(&image[HDR_ENTRIES..]),
        recno: LittleEndian::read_u64(&image[HDR_RECNO..]),
    })
}

fn image_checksum(image: &[u8], datalen: usize) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(&image[HDR_DATALEN..datalen]);
    hasher.finalize()
}

/// Validate an on-disk page image's header and declared data length.
///
/// Shared between the page-in path and the overflow checker; `size` is the
/// number of bytes actually read for the page.
pub(crate) fn verify_chunk(image: &[u8], addr: u32, size: u32) -> Result<DiskHeader, StorageError> {
    if image.len() != size as usize {
        return Err(StorageError(format!(
            "page at addr {addr} image is {} bytes where {size} were expected",
            image.len()
        )));
    }
    let hdr = parse_header(image, addr)?;
    if (hdr.datalen as usize) < DISK_HEADER_SIZE || hdr.datalen > size {
        return Err(StorageError(format!(
            "page at addr {addr} has impossible datalen {} for size {size}",
            hdr.datalen
        )));
    }
    let stored = LittleEndian::read_u32(&image[HDR_CHECKSUM..]);
    if stored != image_checksum(image, hdr.datalen as usize) {
        return Err(StorageError(format!("page at addr {addr} checksum mismatch")));
    }
    Ok(hdr)
}

/// Builds a well-formed page image the way the reconciliation path lays one
/// out: header first, cells in storage order, padding to a whole number of
/// fragments, checksum last.
#[derive(Debug)]
pub struct ImageBuilder {
    kind: PageKind,
    allocsize: u32,
    recno: u64,
    entries: u16,
    body: Vec<u8>,
}

impl ImageBuilder {
    pub fn new(kind: PageKind, allocsize: u32) -> Self {
        Self {
            kind,
            allocsize,
            recno: 0,
            entries: 0,
            body: Vec::new(),
        }
    }

    /// Starting record number for column-store pages.
    pub fn set_recno(&mut self, recno: u64) -> &mut Self {
        self.recno = recno;
        self
    }

    /// Raw fixed-length records for a col-fix-leaf page.
    pub fn fix_records(&mut self, records: &[u8], count: u16) -> &mut Self {
        self.body.extend_from_slice(records);
        self.entries = count;
        self
    }

    pub fn col_value(&mut self, rle: u64, value: &[u8]) -> &mut Self {
        cell::pack_value(&mut self.body, rle, value);
        self.entries += 1;
        self
    }

    pub fn col_value_ovfl(&mut self, rle: u64, addr: u32, size: u32) -> &mut Self {
        cell::pack_value_ovfl(&mut self.body, rle, addr, size);
        self.entries += 1;
        self
    }

    pub fn col_del(&mut self) -> &mut Self {
        cell::pack_del(&mut self.body);
        self.entries += 1;
        self
    }

    pub fn col_child(&mut self, recno: u64, addr: u32, size: u32) -> &mut Self {
        cell::pack_child_recno(&mut self.body, recno, addr, size);
        self.entries += 1;
        self
    }

    pub fn row_pair(&mut self, key: &[u8], value: &[u8]) -> &mut Self {
        cell::pack_key(&mut self.body, key);
        cell::pack_value(&mut self.body, 1, value);
        self.entries += 1;
        self
    }

    pub fn row_pair_ovfl_key(&mut self, addr: u32, size: u32, value: &[u8]) -> &mut Self {
        cell::pack_key_ovfl(&mut self.body, addr, size);
        cell::pack_value(&mut self.body, 1, value);
        self.entries += 1;
        self
    }

    pub fn row_pair_ovfl_value(&mut self, key: &[u8], addr: u32, size: u32) -> &mut Self {
        cell::pack_key(&mut self.body, key);
        cell::pack_value_ovfl(&mut self.body, 1, addr, size);
        self.entries += 1;
        self
    }

    /// A row-internal child reference bounded by `fence`. The 0th fence is
    /// conventionally empty.
    pub fn row_child(&mut self, fence: &[u8], addr: u32, size: u32) -> &mut Self {
        cell::pack_key(&mut self.body, fence);
        cell::pack_child(&mut self.body, addr, size);
        self.entries += 1;
        self
    }

    pub fn row_child_ovfl_fence(
        &mut self,
        fence_addr: u32,
        fence_size: u32,
        addr: u32,
        size: u32,
    ) -> &mut Self {
        cell::pack_key_ovfl(&mut self.body, fence_addr, fence_size);
        cell::pack_child(&mut self.body, addr, size);
        self.entries += 1;
        self
    }

    /// The single large key or value held by an overflow page.
    pub fn overflow_data(&mut self, data: &[u8]) -> &mut Self {
        self.body.extend_from_slice(data);
        self.entries = 1;
        self
    }

    pub fn finish(&self) -> Vec<u8> {
        let datalen = DISK_HEADER_SIZE + self.body.len();
        let allocsize = self.allocsize as usize;
        let size = datalen.div_ceil(allocsize).max(1) * allocsize;

        let mut image = vec![0u8; size];
        LittleEndian::write_u32(&mut image[HDR_DATALEN..], datalen as u32);
        image[HDR_KIND] = self.kind.as_u8();
        LittleEndian::write_u16(&mut image[HDR_ENTRIES..], self.entries);
        LittleEndian::write_u64(&mut image[HDR_RECNO..], self.recno);
        image[DISK_HEADER_SIZE..datalen].copy_from_slice(&self.body);

        let checksum = image_checksum(&image, datalen);
        LittleEndian::write_u32(&mut image[HDR_CHECKSUM..], checksum);
        image
    }
}
