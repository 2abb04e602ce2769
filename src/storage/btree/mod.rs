use std::cmp::Ordering;
use std::io;
use std::path::Path;

mod cache;
mod cell;
mod disk;
mod page;
mod stat;
mod verify;

pub use disk::{ImageBuilder, PageKind};
pub use stat::BtreeStats;

use crate::core::errors::BrackenError;
use crate::storage::block::file::{BlockFile, DEFAULT_ALLOC_SIZE};

use cache::PageCache;

/// Total order over keys, configured per tree.
pub type KeyComparator = fn(&[u8], &[u8]) -> Ordering;

fn lex_compare(a: &[u8], b: &[u8]) -> Ordering {
    a.cmp(b)
}

#[derive(Debug, Clone, Copy)]
pub struct BTreeConfig {
    pub allocsize: u32,
    /// Record width for column-store fixed-length leaf pages.
    pub fixed_len: u32,
    pub compare: KeyComparator,
}

impl Default for BTreeConfig {
    fn default() -> Self {
        Self {
            allocsize: DEFAULT_ALLOC_SIZE,
            fixed_len: 8,
            compare: lex_compare,
        }
    }
}

/// An opened on-disk B-tree.
#[derive(Debug)]
pub struct BTree {
    bf: BlockFile,
    cache: PageCache,
    config: BTreeConfig,
}

impl BTree {
    pub fn create<P: AsRef<Path>>(path: P, config: BTreeConfig) -> Result<Self, BrackenError> {
        let bf = BlockFile::create(path, config.allocsize)?;
        Ok(Self {
            bf,
            cache: PageCache::new(),
            config,
        })
    }

    /// Open an existing tree; the file's allocation size overrides the
    /// configured one.
    pub fn open<P: AsRef<Path>>(path: P, mut config: BTreeConfig) -> Result<Self, BrackenError> {
        let bf = BlockFile::open(path)?;
        config.allocsize = bf.allocsize;
        Ok(Self {
            bf,
            cache: PageCache::new(),
            config,
        })
    }

    pub fn allocsize(&self) -> u32 {
        self.config.allocsize
    }

    pub fn root_ref(&self) -> (u32, u32) {
        self.bf.root_ref()
    }

    /// Check every logical and structural invariant of the tree: key and
    /// record-number ordering, overflow chains, and that the referenced
    /// file fragments exactly partition the file body.
    ///
    /// Verification is read-only and assumes a quiescent tree. It either
    /// succeeds silently or fails with diagnostics naming the offending
    /// page addresses.
    pub fn verify(&mut self) -> Result<(), BrackenError> {
        verify::verify(self, None)
    }

    /// Run a verification pass, dumping a human-readable rendition of each
    /// page to `out` before descending below it.
    pub fn dump_file(&mut self, out: &mut dyn io::Write) -> Result<(), BrackenError> {
        verify::verify(self, Some(out))
    }

    /// Traverse the tree and report per-kind page counts and live record
    /// counts.
    pub fn stat(&mut self) -> Result<BtreeStats, BrackenError> {
        stat::stat(self)
    }
}
