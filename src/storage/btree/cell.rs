use byteorder::{ByteOrder, LittleEndian};

use crate::core::errors::StorageError;

// Cell layout within a page image, after the disk header. Every cell is a
// one-byte type followed by type-specific fields (little-endian):
//
//   Key        klen (u32), key bytes
//   Value      rle (u64), vlen (u32), value bytes
//   KeyOvfl    addr (u32), size (u32)
//   ValueOvfl  rle (u64), addr (u32), size (u32)
//   Del        nothing; one deleted record
//   Child      addr (u32), size (u32)
//   ChildRecno recno (u64), addr (u32), size (u32)
const CELL_KEY: u8 = 1;
const CELL_VALUE: u8 = 2;
const CELL_KEY_OVFL: u8 = 3;
const CELL_VALUE_OVFL: u8 = 4;
const CELL_DEL: u8 = 5;
const CELL_CHILD: u8 = 6;
const CELL_CHILD_RECNO: u8 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CellKind {
    Key,
    Value,
    KeyOvfl,
    ValueOvfl,
    Del,
    Child,
    ChildRecno,
}

/// A decoded cell header.
///
/// `off` carries the overflow reference for `KeyOvfl`/`ValueOvfl` and the
/// child reference for `Child`/`ChildRecno`; `rle` defaults to 1 for cell
/// kinds that don't carry a run length.
#[derive(Debug, Clone)]
pub(crate) struct CellUnpack {
    pub kind: CellKind,
    pub rle: u64,
    pub recno: u64,
    pub data: Vec<u8>,
    pub off: Option<(u32, u32)>,
    pub len: usize,
}

fn take(buf: &[u8], off: usize, n: usize) -> Result<&[u8], StorageError> {
    buf.get(off..off + n)
        .ok_or_else(|| StorageError(format!("cell truncated at offset {off}")))
}

fn read_u32(buf: &[u8], off: usize) -> Result<u32, StorageError> {
    Ok(LittleEndian::read_u32(take(buf, off, 4)?))
}

fn read_u64(buf: &[u8], off: usize) -> Result<u64, StorageError> {
    Ok(LittleEndian::read_u64(take(buf, off, 8)?))
}

/// Decode the cell starting at `off`.
pub(crate) fn unpack(buf: &[u8], off: usize) -> Result<CellUnpack, StorageError> {
    let kind_byte = *buf
        .get(off)
        .ok_or_else(|| StorageError(format!("cell truncated at offset {off}")))?;
    let mut at = off + 1;

    let mut cell = CellUnpack {
        kind: CellKind::Del,
        rle: 1,
        recno: 0,
        data: Vec::new(),
        off: None,
        len: 0,
    };

    match kind_byte {
        CELL_KEY => {
            cell.kind = CellKind::Key;
            let klen = read_u32(buf, at)? as usize;
            at += 4;
            cell.data = take(buf, at, klen)?.to_vec();
            at += klen;
        }
        CELL_VALUE => {
            cell.kind = CellKind::Value;
            cell.rle = read_u64(buf, at)?;
            at += 8;
            let vlen = read_u32(buf, at)? as usize;
            at += 4;
            cell.data = take(buf, at, vlen)?.to_vec();
            at += vlen;
        }
        CELL_KEY_OVFL => {
            cell.kind = CellKind::KeyOvfl;
            cell.off = Some((read_u32(buf, at)?, read_u32(buf, at + 4)?));
            at += 8;
        }
        CELL_VALUE_OVFL => {
            cell.kind = CellKind::ValueOvfl;
            cell.rle = read_u64(buf, at)?;
            at += 8;
            cell.off = Some((read_u32(buf, at)?, read_u32(buf, at + 4)?));
            at += 8;
        }
        CELL_DEL => {
            cell.kind = CellKind::Del;
        }
        CELL_CHILD => {
            cell.kind = CellKind::Child;
            cell.off = Some((read_u32(buf, at)?, read_u32(buf, at + 4)?));
            at += 8;
        }
        CELL_CHILD_RECNO => {
            cell.kind = CellKind::ChildRecno;
            cell.recno = read_u64(buf, at)?;
            at += 8;
            cell.off = Some((read_u32(buf, at)?, read_u32(buf, at + 4)?));
            at += 8;
        }
        other => {
            return Err(StorageError(format!(
                "unknown cell type {other} at offset {off}"
            )));
        }
    }

    cell.len = at - off;
    Ok(cell)
}

/// Iterates the cells of a page image payload in storage order.
pub(crate) struct CellIter<'a> {
    buf: &'a [u8],
    off: usize,
}

impl<'a> CellIter<'a> {
    pub fn new(payload: &'a [u8]) -> Self {
        Self {
            buf: payload,
            off: 0,
        }
    }
}

impl Iterator for CellIter<'_> {
    type Item = Result<CellUnpack, StorageError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.off >= self.buf.len() {
            return None;
        }
        match unpack(self.buf, self.off) {
            Ok(cell) => {
                self.off += cell.len;
                Some(Ok(cell))
            }
            Err(err) => {
                self.off = self.buf.len();
                Some(Err(err))
            }
        }
    }
}

fn push_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn push_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_le_bytes());
}

pub(crate) fn pack_key(out: &mut Vec<u8>, key: &[u8]) {
    out.push(CELL_KEY);
    push_u32(out, key.len() as u32);
    out.extend_from_slice(key);
}

pub(crate) fn pack_value(out: &mut Vec<u8>, rle: u64, value: &[u8]) {
    out.push(CELL_VALUE);
    push_u64(out, rle);
    push_u32(out, value.len() as u32);
    out.extend_from_slice(value);
}

pub(crate) fn pack_key_ovfl(out: &mut Vec<u8>, addr: u32, size: u32) {
    out.push(CELL_KEY_OVFL);
    push_u32(out, addr);
    push_u32(out, size);
}

pub(crate) fn pack_value_ovfl(out: &mut Vec<u8>, rle: u64, addr: u32, size: u32) {
    out.push(CELL_VALUE_OVFL);
    push_u64(out, rle);
    push_u32(out, addr);
    push_u32(out, size);
}

pub(crate) fn pack_del(out: &mut Vec<u8>) {
    out.push(CELL_DEL);
}

pub(crate) fn pack_child(out: &mut Vec<u8>, addr: u32, size: u32) {
    out.push(CELL_CHILD);
    push_u32(out, addr);
    push_u32(out, size);
}

pub(crate) fn pack_child_recno(out: &mut Vec<u8>, recno: u64, addr: u32, size: u32) {
    out.push(CELL_CHILD_RECNO);
    push_u64(out, recno);
    push_u32(out, addr);
    push_u32(out, size);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_unpack_each_kind() {
        let mut buf = Vec::new();
        pack_key(&mut buf, b"apple");
        pack_value(&mut buf, 3, b"juice");
        pack_key_ovfl(&mut buf, 7, 512);
        pack_value_ovfl(&mut buf, 9, 8, 1024);
        pack_del(&mut buf);
        pack_child(&mut buf, 2, 512);
        pack_child_recno(&mut buf, 42, 3, 512);

        let cells: Vec<CellUnpack> = CellIter::new(&buf).map(|c| c.unwrap()).collect();
        assert_eq!(cells.len(), 7);

        assert_eq!(cells[0].kind, CellKind::Key);
        assert_eq!(cells[0].data, b"apple");
        assert_eq!(cells[0].rle, 1);

        assert_eq!(cells[1].kind, CellKind::Value);
        assert_eq!(cells[1].rle, 3);
        assert_eq!(cells[1].data, b"juice");

        assert_eq!(cells[2].kind, CellKind::KeyOvfl);
        assert_eq!(cells[2].off, Some((7, 512)));

        assert_eq!(cells[3].kind, CellKind::ValueOvfl);
        assert_eq!(cells[3].rle, 9);
        assert_eq!(cells[3].off, Some((8, 1024)));

        assert_eq!(cells[4].kind, CellKind::Del);

        assert_eq!(cells[5].kind, CellKind::Child);
        assert_eq!(cells[5].off, Some((2, 512)));

        assert_eq!(cells[6].kind, CellKind::ChildRecno);
        assert_eq!(cells[6].recno, 42);
        assert_eq!(cells[6].off, Some((3, 512)));
    }

    #[test]
    fn truncated_cell_rejected() {
        let mut buf = Vec::new();
        pack_value(&mut buf, 1, b"abcdef");
        buf.truncate(buf.len() - 2);

        let err = CellIter::new(&buf).next().unwrap().unwrap_err();
        assert!(err.to_string().contains("truncated"));
    }

    #[test]
    fn unknown_cell_type_rejected() {
        let err = unpack(&[0xEE], 0).unwrap_err();
        assert!(err.to_string().contains("unknown cell type"));
    }

    #[test]
    fn iterator_stops_after_error() {
        let mut buf = vec![0xEE];
        pack_del(&mut buf);

        let mut iter = CellIter::new(&buf);
        assert!(iter.next().unwrap().is_err());
        assert!(iter.next().is_none());
    }
}
