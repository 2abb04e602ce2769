use std::cmp::Ordering;
use std::io::Write;

use log::{debug, error};

use crate::core::errors::{BrackenError, VerifyError};
use crate::storage::block::file::{BlockFile, DESC_SECTOR, INVALID_ADDR};

use super::cell::{CellIter, CellKind};
use super::disk::{self, PageKind, DISK_HEADER_SIZE};
use super::page::{materialize_key, CellRef, Insert, Page, PageContent, Update};
use super::BTree;

/// One bit per body fragment, tracking which parts of the file have been
/// accounted for during a verification pass.
#[derive(Debug)]
struct FragBits {
    words: Vec<u64>,
    nbits: u32,
}

impl FragBits {
    fn new(nbits: u32) -> Self {
        Self {
            words: vec![0u64; (nbits as usize).div_ceil(64)],
            nbits,
        }
    }

    fn test(&self, bit: u32) -> bool {
        debug_assert!(bit < self.nbits);
        self.words[bit as usize / 64] >> (bit % 64) & 1 == 1
    }

    fn set(&mut self, bit: u32) {
        debug_assert!(bit < self.nbits);
        self.words[bit as usize / 64] |= 1u64 << (bit % 64);
    }

    fn set_range(&mut self, start: u32, count: u32) {
        for bit in start..start + count {
            self.set(bit);
        }
    }

    fn find_first_clear(&self, from: u32) -> Option<u32> {
        (from..self.nbits).find(|&bit| !self.test(bit))
    }
}

/// The lexicographically greatest key seen so far, with the page that
/// produced it. `Empty` until the first row-store key is recorded: the 0th
/// fences on the internal pages leading to the smallest leaf in the tree
/// are all empty entries.
#[derive(Debug)]
enum KeyMonitor {
    Empty,
    Seen { key: Vec<u8>, addr: u32 },
}

/// Everything carried through a single verification pass.
struct VerifyPass<'a> {
    tree: &'a mut BTree,
    dump: Option<&'a mut dyn Write>,
    frags: u32,
    fragbits: FragBits,
    record_total: u64,
    max_key: KeyMonitor,
    fcnt: u64,
}

/// Verify the tree rooted in `tree`'s file, optionally dumping each page.
///
/// The tree is assumed quiescent: no concurrent writer, no concurrent
/// evictor other than this pass's own reconciliation calls.
pub(super) fn verify<'a>(
    tree: &'a mut BTree,
    dump: Option<&'a mut dyn Write>,
) -> Result<(), BrackenError> {
    let file_size = tree.bf.file_size()?;
    let allocsize = u64::from(tree.config.allocsize);

    if file_size <= DESC_SECTOR {
        return Err(
            VerifyError("the file contains no data pages and cannot be verified".into()).into(),
        );
    }
    if (file_size - DESC_SECTOR) % allocsize != 0 {
        return Err(VerifyError("the file size is not valid for the allocation size".into()).into());
    }

    // One bit per fragment; verifying a 1TB file with 512B fragments costs
    // a 256MB bit array, and the index space is capped at i32::MAX.
    let frags = (file_size - DESC_SECTOR) / allocsize;
    if frags > i32::MAX as u64 {
        return Err(VerifyError("file is too large to verify".into()).into());
    }
    let frags = frags as u32;

    let mut pass = VerifyPass {
        tree,
        dump,
        frags,
        fragbits: FragBits::new(frags),
        record_total: 0,
        max_key: KeyMonitor::Empty,
        fcnt: 0,
    };

    let mut ret = pass.walk_tree();
    if ret.is_ok() {
        ret = pass.verify_freelist();
    }
    if ret.is_ok() {
        ret = pass.check_frags();
    }

    // Wrap up reporting. Every page held during the walk must have been
    // released for eviction, even on failure paths.
    debug!("verify progress: {} pages", pass.fcnt);
    debug_assert_eq!(pass.tree.cache.len(), 0, "pages left resident after verification");
    ret
}

/// Keep the primary result; a secondary failure is observed in the log.
pub(super) fn merge_ret(
    primary: Result<(), BrackenError>,
    secondary: Result<(), BrackenError>,
) -> Result<(), BrackenError> {
    match (primary, secondary) {
        (Ok(()), secondary) => secondary,
        (primary, Ok(())) => primary,
        (Err(primary), Err(secondary)) => {
            error!("error merged during verification: {secondary}");
            Err(primary)
        }
    }
}

impl VerifyPass<'_> {
    fn walk_tree(&mut self) -> Result<(), BrackenError> {
        let (root_addr, root_size) = self.tree.bf.root_ref();
        if root_addr == INVALID_ADDR {
            return Ok(());
        }
        // The tree's first record is record 1.
        self.hold_and_walk(root_addr, root_size, 1)
    }

    /// Page in a referenced page, walk its subtree, and release it for
    /// eviction. The page is reconciled on success and failure alike;
    /// eviction errors are merged into the walk's result.
    fn hold_and_walk(&mut self, addr: u32, size: u32, parent_recno: u64) -> Result<(), BrackenError> {
        let fixed_len = self.tree.config.fixed_len;
        let page = self
            .tree
            .cache
            .page_in(&mut self.tree.bf, addr, size, fixed_len)?;
        let ret = self.walk(&page, parent_recno);
        self.tree.cache.hazard_clear(addr);
        merge_ret(ret, self.tree.cache.reconcile_evict(addr))
    }

    /// Check the logical consistency of one page and recursively descend
    /// through its children, depth first and left to right.
    ///
    /// The page's physical structure was validated when it was read; this
    /// pass checks the page's relationships within the tree.
    fn walk(&mut self, page: &Page, parent_recno: u64) -> Result<(), BrackenError> {
        // Report progress every 10 pages.
        self.fcnt += 1;
        if self.fcnt % 10 == 0 {
            debug!("verify progress: {} pages", self.fcnt);
        }

        self.addfrag(page.addr, page.size)?;

        if let Some(out) = self.dump.as_mut() {
            dump_page(&mut self.tree.bf, page, &mut **out)?;
        }

        // Column-store pages must start at the record number carried by the
        // parent's reference.
        if let Some(recno) = page.recno() {
            if recno != parent_recno {
                return Err(VerifyError(format!(
                    "page at addr {} has a starting record of {recno} where the expected \
                     starting record was {parent_recno}",
                    page.addr
                ))
                .into());
            }
        }

        match &page.content {
            PageContent::ColFixLeaf { .. } => self.record_total += u64::from(page.entries),
            PageContent::ColVarLeaf { slots, .. } => {
                let mut recno = 0u64;
                for slot in slots {
                    // A null slot stands for a single deleted record.
                    recno += match slot {
                        None => 1,
                        Some(cell) => cell.rle,
                    };
                }
                self.record_total += recno;
            }
            _ => {}
        }

        // Depth-first traversal: the first key on a row-store leaf must be
        // larger than any key previously seen.
        if let PageContent::RowLeaf { .. } = page.content {
            self.row_leaf_key_order(page)?;
        }

        // Overflow cells are checked separately from the walks above; it's
        // simpler, and verification is not a hot path.
        match page.kind() {
            PageKind::ColVarLeaf | PageKind::RowLeaf | PageKind::RowInternal => {
                self.overflow_cells(page)?;
            }
            _ => {}
        }

        match &page.content {
            PageContent::ColInternal { children, .. } => {
                for child in children {
                    // This entry's starting record number must be one past
                    // the records reviewed to this point.
                    if child.recno != self.record_total + 1 {
                        return Err(VerifyError(format!(
                            "page at addr {} has a starting record of {} where the expected \
                             starting record was {}",
                            child.addr,
                            child.recno,
                            self.record_total + 1
                        ))
                        .into());
                    }
                    self.hold_and_walk(child.addr, child.size, child.recno)?;
                }
            }
            PageContent::RowInternal { children } => {
                for (entry, child) in children.iter().enumerate() {
                    // The 0th key of any internal page is magic and can't
                    // be checked against anything.
                    if entry != 0 {
                        self.row_int_key_order(page, child, entry)?;
                    }
                    self.hold_and_walk(child.addr, child.size, 0)?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Charge a page's fragments to the map, complaining if any of them
    /// has already been accounted for.
    fn addfrag(&mut self, addr: u32, size: u32) -> Result<(), BrackenError> {
        let k = size / self.tree.config.allocsize;
        if u64::from(addr) + u64::from(k) > u64::from(self.frags) {
            return Err(VerifyError(format!(
                "file fragment at addr {addr} references non-existent file pages"
            ))
            .into());
        }
        for i in 0..k {
            if self.fragbits.test(addr + i) {
                return Err(
                    VerifyError(format!("file fragment at addr {addr} already verified")).into(),
                );
            }
        }
        if k > 0 {
            self.fragbits.set_range(addr, k);
        }
        Ok(())
    }

    /// Compare the first key on a leaf page to the largest key seen so
    /// far, then remember the page's last key as the new maximum.
    fn row_leaf_key_order(&mut self, page: &Page) -> Result<(), BrackenError> {
        let PageContent::RowLeaf { slots, .. } = &page.content else {
            return Ok(());
        };
        if slots.is_empty() {
            return Ok(());
        }
        let cmp = self.tree.config.compare;

        // When the maximum was set by an internal page, skip the check: a
        // fence key is often a copy of its subtree's first leaf key, and
        // comparing equal is the expected path. Before any key has been
        // seen, the first key is still checked against the empty maximum.
        if let KeyMonitor::Empty = self.max_key {
            let first = materialize_key(&mut self.tree.bf, &slots[0].key)?;
            if cmp(&first, &[]) == Ordering::Less {
                return Err(VerifyError(format!(
                    "the first key on the page at addr {} sorts equal or less than a key \
                     appearing on page {INVALID_ADDR}",
                    page.addr
                ))
                .into());
            }
        }

        let last = materialize_key(&mut self.tree.bf, &slots[slots.len() - 1].key)?;
        self.max_key = KeyMonitor::Seen {
            key: last,
            addr: page.addr,
        };
        Ok(())
    }

    /// Compare an internal page's fence key to the largest key seen so
    /// far, then make the fence the new maximum. Fences must sort strictly
    /// greater: equality here would mean the fence repeats a key from a
    /// previous leaf page.
    fn row_int_key_order(
        &mut self,
        page: &Page,
        child: &super::page::RowRef,
        entry: usize,
    ) -> Result<(), BrackenError> {
        debug_assert!(!matches!(self.max_key, KeyMonitor::Empty));

        let fence = materialize_key(&mut self.tree.bf, &child.fence)?;
        let cmp = self.tree.config.compare;
        let (max, max_addr) = match &self.max_key {
            KeyMonitor::Empty => (&[] as &[u8], INVALID_ADDR),
            KeyMonitor::Seen { key, addr } => (key.as_slice(), *addr),
        };
        if cmp(&fence, max) != Ordering::Greater {
            return Err(VerifyError(format!(
                "the internal key in entry {entry} on the page at addr {} sorts before the \
                 last key appearing on page {max_addr}",
                page.addr
            ))
            .into());
        }
        self.max_key = KeyMonitor::Seen {
            key: fence,
            addr: page.addr,
        };
        Ok(())
    }

    /// Verify the overflow pages referenced by this page's cells.
    fn overflow_cells(&mut self, page: &Page) -> Result<(), BrackenError> {
        // Row-store internal page disk images are discarded after load
        // when there are no overflow cells on the page. No image, done.
        let Some(image) = page.disk.as_ref() else {
            debug_assert_eq!(page.kind(), PageKind::RowInternal);
            return Ok(());
        };

        let hdr = disk::parse_header(image, page.addr)?;
        let payload = &image[DISK_HEADER_SIZE..hdr.datalen as usize];
        for cell in CellIter::new(payload) {
            let cell = cell?;
            if let (CellKind::KeyOvfl | CellKind::ValueOvfl, Some((addr, size))) =
                (cell.kind, cell.off)
            {
                self.verify_overflow(addr, size)?;
            }
        }
        Ok(())
    }

    /// Read an overflow page and check it.
    ///
    /// Overflow pages are read synchronously rather than through the page
    /// cache: they are referenced, not indexed, so a cache entry would
    /// serve no one, and verification wants residency bounded.
    fn verify_overflow(&mut self, addr: u32, size: u32) -> Result<(), BrackenError> {
        let image = self.tree.bf.read_frags(addr, size)?;
        let hdr = disk::verify_chunk(&image, addr, size)?;
        if hdr.kind != PageKind::Overflow {
            return Err(VerifyError(format!(
                "page at addr {addr} is a {} where an overflow page was expected",
                hdr.kind.name()
            ))
            .into());
        }
        self.addfrag(addr, size)
    }

    /// Charge every free-list entry's fragments to the map. The duplicate
    /// check doubles as proof the free list overlaps neither live pages
    /// nor itself; overlaps are reported per entry and the first becomes
    /// the result.
    fn verify_freelist(&mut self) -> Result<(), BrackenError> {
        let body_size = self.tree.bf.body_size()?;
        let allocsize = u64::from(self.tree.config.allocsize);

        let mut ret = Ok(());
        let entries = self.tree.bf.free_list().entries().to_vec();
        for fe in entries {
            if u64::from(fe.addr) * allocsize + u64::from(fe.size) > body_size {
                return Err(VerifyError(format!(
                    "free-list entry addr {} references non-existent file pages",
                    fe.addr
                ))
                .into());
            }
            if let Err(err) = self.addfrag(fe.addr, fe.size) {
                if ret.is_ok() {
                    ret = Err(err);
                } else {
                    error!("{err}");
                }
            }
        }
        ret
    }

    /// Check that every fragment in the file was verified, reporting
    /// maximal runs of unverified fragments.
    fn check_frags(&mut self) -> Result<(), BrackenError> {
        let mut ret = Ok(());
        let mut from = 0;
        while let Some(start) = self.fragbits.find_first_clear(from) {
            // Extend the run, setting bits as we go; the map is about to
            // be discarded.
            let mut end = start;
            self.fragbits.set(start);
            while end + 1 < self.frags && !self.fragbits.test(end + 1) {
                end += 1;
                self.fragbits.set(end);
            }

            let msg = if start == end {
                format!("file fragment {start} was never verified")
            } else {
                format!("file fragments {start}-{end} were never verified")
            };
            if ret.is_ok() {
                ret = Err(VerifyError(msg).into());
            } else {
                error!("{msg}");
            }
            from = end + 1;
        }
        ret
    }
}

/// Emit a human-readable dump of one page.
fn dump_page(bf: &mut BlockFile, page: &Page, out: &mut dyn Write) -> Result<(), BrackenError> {
    writeln!(
        out,
        "page {} size {} {} entries {}",
        page.addr,
        page.size,
        page.kind().name(),
        page.entries
    )?;
    match &page.content {
        PageContent::ColFixLeaf {
            recno,
            records,
            updates,
        } => {
            writeln!(out, "\tstarting recno {recno}, {} record bytes", records.len())?;
            for (slot, chain) in updates.iter().enumerate() {
                for upd in chain {
                    dump_update(out, slot, upd)?;
                }
            }
        }
        PageContent::ColVarLeaf {
            recno,
            slots,
            inserts,
        } => {
            writeln!(out, "\tstarting recno {recno}")?;
            for (i, slot) in slots.iter().enumerate() {
                match slot {
                    None => writeln!(out, "\t{i}: deleted")?,
                    Some(cell) => match cell.ovfl {
                        None => writeln!(out, "\t{i}: rle {} len {}", cell.rle, cell.data_len)?,
                        Some((addr, size)) => {
                            writeln!(out, "\t{i}: rle {} ovfl {addr}/{size}", cell.rle)?;
                        }
                    },
                }
                for upd in &inserts[i] {
                    dump_update(out, i, upd)?;
                }
            }
        }
        PageContent::ColInternal { recno, children } => {
            writeln!(out, "\tstarting recno {recno}")?;
            for child in children {
                writeln!(
                    out,
                    "\tchild recno {} addr {} size {}",
                    child.recno, child.addr, child.size
                )?;
            }
        }
        PageContent::RowLeaf {
            slots,
            smallest,
            inserts,
            updates,
        } => {
            for ins in smallest {
                dump_insert(out, "insert (smallest)", ins)?;
            }
            for (i, slot) in slots.iter().enumerate() {
                let key = materialize_key(bf, &slot.key)?;
                match &slot.value {
                    CellRef::Inline(value) => writeln!(
                        out,
                        "\t{i}: key {} value len {}",
                        String::from_utf8_lossy(&key),
                        value.len()
                    )?,
                    CellRef::Ovfl { addr, size } => writeln!(
                        out,
                        "\t{i}: key {} value ovfl {addr}/{size}",
                        String::from_utf8_lossy(&key)
                    )?,
                }
                for upd in &updates[i] {
                    dump_update(out, i, upd)?;
                }
                for ins in &inserts[i] {
                    dump_insert(out, "insert", ins)?;
                }
            }
        }
        PageContent::RowInternal { children } => {
            for (i, child) in children.iter().enumerate() {
                let fence = materialize_key(bf, &child.fence)?;
                writeln!(
                    out,
                    "\t{i}: fence {} child addr {} size {}",
                    String::from_utf8_lossy(&fence),
                    child.addr,
                    child.size
                )?;
            }
        }
        PageContent::Overflow { data } => {
            writeln!(out, "\t{} data bytes", data.len())?;
        }
    }
    Ok(())
}

fn dump_update(out: &mut dyn Write, slot: usize, upd: &Update) -> Result<(), BrackenError> {
    if upd.tombstone {
        writeln!(out, "\tupdate slot {slot}: deleted")?;
    } else {
        writeln!(out, "\tupdate slot {slot}: value len {}", upd.value.len())?;
    }
    Ok(())
}

fn dump_insert(out: &mut dyn Write, label: &str, ins: &Insert) -> Result<(), BrackenError> {
    let state = if ins.is_live() { "live" } else { "deleted" };
    writeln!(
        out,
        "\t{label} key {} ({state})",
        String::from_utf8_lossy(&ins.key)
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fragbits_set_and_test() {
        let mut bits = FragBits::new(130);
        assert!(!bits.test(0));
        bits.set(0);
        bits.set(129);
        assert!(bits.test(0));
        assert!(bits.test(129));
        assert!(!bits.test(64));
    }

    #[test]
    fn fragbits_set_range_spans_words() {
        let mut bits = FragBits::new(200);
        bits.set_range(60, 10);
        for bit in 60..70 {
            assert!(bits.test(bit));
        }
        assert!(!bits.test(59));
        assert!(!bits.test(70));
    }

    #[test]
    fn fragbits_find_first_clear() {
        let mut bits = FragBits::new(10);
        bits.set_range(0, 4);
        bits.set_range(6, 4);
        assert_eq!(bits.find_first_clear(0), Some(4));
        assert_eq!(bits.find_first_clear(5), Some(5));
        assert_eq!(bits.find_first_clear(6), None);

        bits.set_range(4, 2);
        assert_eq!(bits.find_first_clear(0), None);
    }

    #[test]
    fn merge_ret_keeps_primary() {
        let primary: Result<(), BrackenError> = Err(VerifyError("first".into()).into());
        let secondary: Result<(), BrackenError> = Err(VerifyError("second".into()).into());
        let err = merge_ret(primary, secondary).unwrap_err();
        assert!(err.to_string().contains("first"));

        let secondary: Result<(), BrackenError> = Err(VerifyError("second".into()).into());
        let err = merge_ret(Ok(()), secondary).unwrap_err();
        assert!(err.to_string().contains("second"));

        assert!(merge_ret(Ok(()), Ok(())).is_ok());
    }
}
