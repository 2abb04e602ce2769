#![allow(dead_code)]

use std::path::Path;

use brackendb::{BTree, BTreeConfig, BlockFile, ImageBuilder, PageKind};

pub const ALLOC: u32 = 512;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Append an image to the file body, returning its (addr, size) reference.
pub fn write_image(bf: &mut BlockFile, image: &[u8]) -> (u32, u32) {
    let addr = bf.alloc_frags(image.len() as u32).unwrap();
    bf.write_frags(addr, image).unwrap();
    (addr, image.len() as u32)
}

pub fn open_tree(path: &Path) -> BTree {
    BTree::open(path, BTreeConfig::default()).unwrap()
}

pub fn row_leaf(pairs: &[(&[u8], &[u8])]) -> Vec<u8> {
    let mut b = ImageBuilder::new(PageKind::RowLeaf, ALLOC);
    for (key, value) in pairs {
        b.row_pair(key, value);
    }
    b.finish()
}

/// A row leaf with `n` generated pairs, big enough to span several
/// fragments when `n` is large. Keys sort by their zero-padded index.
pub fn big_row_leaf(prefix: &str, n: usize) -> Vec<u8> {
    let mut b = ImageBuilder::new(PageKind::RowLeaf, ALLOC);
    for i in 0..n {
        let key = format!("{prefix}{i:03}");
        b.row_pair(key.as_bytes(), &[b'v'; 40]);
    }
    b.finish()
}

pub fn row_internal(children: &[(&[u8], u32, u32)]) -> Vec<u8> {
    let mut b = ImageBuilder::new(PageKind::RowInternal, ALLOC);
    for (fence, addr, size) in children {
        b.row_child(fence, *addr, *size);
    }
    b.finish()
}

pub fn col_fix_leaf(recno: u64, entries: u16, fixed_len: u32) -> Vec<u8> {
    let mut b = ImageBuilder::new(PageKind::ColFixLeaf, ALLOC);
    b.set_recno(recno);
    let records = vec![0u8; entries as usize * fixed_len as usize];
    b.fix_records(&records, entries);
    b.finish()
}

pub fn col_internal(recno: u64, children: &[(u64, u32, u32)]) -> Vec<u8> {
    let mut b = ImageBuilder::new(PageKind::ColInternal, ALLOC);
    b.set_recno(recno);
    for (child_recno, addr, size) in children {
        b.col_child(*child_recno, *addr, *size);
    }
    b.finish()
}

pub fn overflow(data: &[u8]) -> Vec<u8> {
    let mut b = ImageBuilder::new(PageKind::Overflow, ALLOC);
    b.overflow_data(data);
    b.finish()
}

/// Write a file holding two row leaves under one internal root.
pub fn two_leaf_row_tree(
    path: &Path,
    leaf1: &[(&[u8], &[u8])],
    leaf2: &[(&[u8], &[u8])],
    fence2: &[u8],
) {
    let mut bf = BlockFile::create(path, ALLOC).unwrap();
    let (a1, s1) = write_image(&mut bf, &row_leaf(leaf1));
    let (a2, s2) = write_image(&mut bf, &row_leaf(leaf2));
    let (ra, rs) = write_image(&mut bf, &row_internal(&[(b"", a1, s1), (fence2, a2, s2)]));
    bf.set_root_ref(ra, rs).unwrap();
    bf.close().unwrap();
}
