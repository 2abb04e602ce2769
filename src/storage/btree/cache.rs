use std::collections::HashMap;

use crate::core::errors::{BrackenError, StorageError};
use crate::storage::block::file::BlockFile;

use super::disk;
use super::page::Page;

#[derive(Debug)]
struct CacheEntry {
    image: Vec<u8>,
    pin_count: u32,
}

/// Raw page images keyed by fragment address, each with a pin count.
///
/// A pinned entry is under hazard: it may not be evicted until the holder
/// clears the hazard. The verification walk pins one page per tree level,
/// evicting each child as soon as its subtree has been inspected, so
/// residency stays bounded for arbitrarily deep trees.
#[derive(Debug, Default)]
pub(crate) struct PageCache {
    entries: HashMap<u32, CacheEntry>,
}

impl PageCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Materialize the page at `(addr, size)` and establish a hazard on it.
    pub fn page_in(
        &mut self,
        bf: &mut BlockFile,
        addr: u32,
        size: u32,
        fixed_len: u32,
    ) -> Result<Page, BrackenError> {
        let image = match self.entries.get_mut(&addr) {
            Some(entry) => {
                entry.pin_count += 1;
                entry.image.clone()
            }
            None => {
                let image = bf.read_frags(addr, size)?;
                disk::verify_chunk(&image, addr, size)?;
                self.entries.insert(
                    addr,
                    CacheEntry {
                        image: image.clone(),
                        pin_count: 1,
                    },
                );
                image
            }
        };
        Ok(Page::from_image(addr, size, image, fixed_len)?)
    }

    /// Release the caller's hazard on the page at `addr`.
    pub fn hazard_clear(&mut self, addr: u32) {
        match self.entries.get_mut(&addr) {
            Some(entry) if entry.pin_count > 0 => entry.pin_count -= 1,
            _ => debug_assert!(false, "hazard underflow for page {addr}"),
        }
    }

    /// Exclusively evict the page at `addr`.
    pub fn reconcile_evict(&mut self, addr: u32) -> Result<(), BrackenError> {
        match self.entries.remove(&addr) {
            Some(entry) if entry.pin_count > 0 => {
                self.entries.insert(addr, entry);
                Err(StorageError(format!("cannot evict pinned page {addr}")).into())
            }
            Some(_) => Ok(()),
            None => Err(StorageError(format!("page cache miss for {addr}")).into()),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::super::disk::{ImageBuilder, PageKind};
    use super::*;

    fn fixture() -> (tempfile::TempDir, BlockFile, u32) {
        let tmp = tempdir().unwrap();
        let mut bf = BlockFile::create(tmp.path().join("cache.bdb"), 512).unwrap();
        let mut b = ImageBuilder::new(PageKind::RowLeaf, 512);
        b.row_pair(b"k", b"v");
        let image = b.finish();
        let addr = bf.alloc_frags(image.len() as u32).unwrap();
        bf.write_frags(addr, &image).unwrap();
        (tmp, bf, addr)
    }

    #[test]
    fn page_in_pins_until_cleared() {
        let (_tmp, mut bf, addr) = fixture();
        let mut cache = PageCache::new();

        let page = cache.page_in(&mut bf, addr, 512, 0).unwrap();
        assert_eq!(page.entries, 1);

        let err = cache.reconcile_evict(addr).unwrap_err();
        assert!(err.to_string().contains("pinned"));
        assert_eq!(cache.len(), 1);

        cache.hazard_clear(addr);
        cache.reconcile_evict(addr).unwrap();
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn second_page_in_hits_cache() {
        let (_tmp, mut bf, addr) = fixture();
        let mut cache = PageCache::new();

        cache.page_in(&mut bf, addr, 512, 0).unwrap();
        cache.page_in(&mut bf, addr, 512, 0).unwrap();

        cache.hazard_clear(addr);
        assert!(cache.reconcile_evict(addr).is_err());
        cache.hazard_clear(addr);
        cache.reconcile_evict(addr).unwrap();
    }

    #[test]
    fn evicting_unknown_page_is_an_error() {
        let mut cache = PageCache::new();
        let err = cache.reconcile_evict(3).unwrap_err();
        assert!(err.to_string().contains("page cache miss"));
    }
}
