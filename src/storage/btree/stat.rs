use crate::core::errors::BrackenError;
use crate::storage::block::file::INVALID_ADDR;

use super::page::{Insert, Page, PageContent, Update};
use super::verify::merge_ret;
use super::BTree;

/// Per-tree statistics gathered by a full traversal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BtreeStats {
    pub allocsize: u32,
    pub fixed_len: u32,
    pub freelist_entries: u64,
    pub col_fix_pages: u64,
    pub col_int_pages: u64,
    pub col_var_pages: u64,
    pub row_int_pages: u64,
    pub row_leaf_pages: u64,
    pub ovfl_pages: u64,
    /// Live data items, tombstones and inserts accounted for.
    pub total_entries: u64,
    /// Live keys; row-store keys and data move in lockstep.
    pub total_keys: u64,
    /// Column-store deleted records.
    pub col_deleted: u64,
}

/// Walk the tree and report per-kind page counts and live item counts.
///
/// Shares the verifier's walk discipline: children are visited left to
/// right and each page is paged in, inspected, and evicted before its
/// parent releases it.
pub(super) fn stat(tree: &mut BTree) -> Result<BtreeStats, BrackenError> {
    let mut stats = BtreeStats {
        allocsize: tree.config.allocsize,
        fixed_len: tree.config.fixed_len,
        freelist_entries: tree.bf.free_list().len() as u64,
        ..Default::default()
    };

    let (root_addr, root_size) = tree.bf.root_ref();
    if root_addr == INVALID_ADDR {
        return Ok(stats);
    }
    walk(tree, root_addr, root_size, &mut stats)?;
    Ok(stats)
}

fn walk(tree: &mut BTree, addr: u32, size: u32, stats: &mut BtreeStats) -> Result<(), BrackenError> {
    let fixed_len = tree.config.fixed_len;
    let page = tree.cache.page_in(&mut tree.bf, addr, size, fixed_len)?;

    stat_page(&page, stats);

    let ret = match &page.content {
        PageContent::ColInternal { children, .. } => children
            .iter()
            .try_for_each(|child| walk(tree, child.addr, child.size, stats)),
        PageContent::RowInternal { children } => children
            .iter()
            .try_for_each(|child| walk(tree, child.addr, child.size, stats)),
        _ => Ok(()),
    };

    tree.cache.hazard_clear(addr);
    merge_ret(ret, tree.cache.reconcile_evict(addr))
}

/// Account one page. Internal and overflow pages are trivial; all that is
/// tracked is a count of the page kind.
pub(crate) fn stat_page(page: &Page, stats: &mut BtreeStats) {
    match &page.content {
        PageContent::ColFixLeaf { .. } => {
            stats.col_fix_pages += 1;
            stats.total_entries += u64::from(page.entries);
        }
        PageContent::ColInternal { .. } => stats.col_int_pages += 1,
        PageContent::ColVarLeaf { slots, inserts, .. } => {
            stats.col_var_pages += 1;
            stat_col_var(slots, inserts, stats);
        }
        PageContent::RowInternal { .. } => stats.row_int_pages += 1,
        PageContent::RowLeaf {
            slots,
            smallest,
            inserts,
            updates,
        } => {
            stats.row_leaf_pages += 1;
            stat_row_leaf(slots.len(), smallest, inserts, updates, stats);
        }
        PageContent::Overflow { .. } => stats.ovfl_pages += 1,
    }
}

/// Count regular and deleted col-var records, then reconcile each slot's
/// insert list against the slot's original state: a tombstone over a live
/// slot moves one record from data to deleted, an insert over a deleted
/// slot moves it back.
fn stat_col_var(
    slots: &[Option<super::page::ColVarCell>],
    inserts: &[Vec<Update>],
    stats: &mut BtreeStats,
) {
    for (slot, ins_list) in slots.iter().zip(inserts) {
        let orig_deleted = match slot {
            None => {
                stats.col_deleted += 1;
                true
            }
            Some(cell) => {
                stats.total_entries += cell.rle;
                false
            }
        };

        for upd in ins_list {
            if upd.tombstone {
                if orig_deleted {
                    continue;
                }
                stats.col_deleted += 1;
                stats.total_entries -= 1;
            } else {
                if !orig_deleted {
                    continue;
                }
                stats.col_deleted -= 1;
                stats.total_entries += 1;
            }
        }
    }
}

/// Count a row-leaf page's live entries: the "smallest" insert list, the
/// on-disk slots, and each slot's insert list. A slot is live when its
/// update chain head is absent or not a tombstone.
fn stat_row_leaf(
    nslots: usize,
    smallest: &[Insert],
    inserts: &[Vec<Insert>],
    updates: &[Vec<Update>],
    stats: &mut BtreeStats,
) {
    let mut cnt = 0u64;

    for ins in smallest {
        if ins.is_live() {
            cnt += 1;
        }
    }

    for slot in 0..nslots {
        let live = updates
            .get(slot)
            .and_then(|chain| chain.first())
            .map_or(true, |upd| !upd.tombstone);
        if live {
            cnt += 1;
        }
        if let Some(ins_list) = inserts.get(slot) {
            for ins in ins_list {
                if ins.is_live() {
                    cnt += 1;
                }
            }
        }
    }

    stats.total_keys += cnt;
    stats.total_entries += cnt;
}

#[cfg(test)]
mod tests {
    use super::super::disk::{ImageBuilder, PageKind};
    use super::super::page::Page;
    use super::*;

    fn page_from(builder: &ImageBuilder) -> Page {
        let image = builder.finish();
        let size = image.len() as u32;
        Page::from_image(0, size, image, 4).unwrap()
    }

    #[test]
    fn col_var_tombstone_over_live_slot() {
        let mut b = ImageBuilder::new(PageKind::ColVarLeaf, 512);
        b.set_recno(1).col_value(3, b"v").col_del();
        let mut page = page_from(&b);

        let PageContent::ColVarLeaf { inserts, .. } = &mut page.content else {
            panic!("expected a col-var leaf");
        };
        // tombstone the live run, resurrect the deleted slot
        inserts[0].push(Update {
            tombstone: true,
            value: Vec::new(),
        });
        inserts[1].push(Update {
            tombstone: false,
            value: b"back".to_vec(),
        });

        let mut stats = BtreeStats::default();
        stat_page(&page, &mut stats);
        assert_eq!(stats.col_var_pages, 1);
        // 3 on-disk records, minus one tombstoned, plus one resurrected
        assert_eq!(stats.total_entries, 3);
        assert_eq!(stats.col_deleted, 1);
    }

    #[test]
    fn col_var_inserts_compare_against_original_state() {
        let mut b = ImageBuilder::new(PageKind::ColVarLeaf, 512);
        b.set_recno(1).col_value(3, b"v");
        let mut page = page_from(&b);

        let PageContent::ColVarLeaf { inserts, .. } = &mut page.content else {
            panic!("expected a col-var leaf");
        };
        // two tombstones within the same originally-live run each count
        inserts[0].push(Update {
            tombstone: true,
            value: Vec::new(),
        });
        inserts[0].push(Update {
            tombstone: true,
            value: Vec::new(),
        });

        let mut stats = BtreeStats::default();
        stat_page(&page, &mut stats);
        assert_eq!(stats.col_deleted, 2);
        assert_eq!(stats.total_entries, 1);
    }

    #[test]
    fn row_leaf_counts_live_entries() {
        let mut b = ImageBuilder::new(PageKind::RowLeaf, 512);
        b.row_pair(b"banana", b"1").row_pair(b"cherry", b"2");
        let mut page = page_from(&b);

        let PageContent::RowLeaf {
            smallest,
            inserts,
            updates,
            ..
        } = &mut page.content
        else {
            panic!("expected a row leaf");
        };
        smallest.push(Insert {
            key: b"apple".to_vec(),
            upd: vec![Update::default()],
        });
        smallest.push(Insert {
            key: b"apricot".to_vec(),
            upd: vec![Update {
                tombstone: true,
                value: Vec::new(),
            }],
        });
        // tombstone the first on-disk slot
        updates[0].push(Update {
            tombstone: true,
            value: Vec::new(),
        });
        // two inserts after the second slot, one dead
        inserts[1].push(Insert {
            key: b"damson".to_vec(),
            upd: vec![Update::default()],
        });
        inserts[1].push(Insert {
            key: b"elderberry".to_vec(),
            upd: vec![Update {
                tombstone: true,
                value: Vec::new(),
            }],
        });

        let mut stats = BtreeStats::default();
        stat_page(&page, &mut stats);
        assert_eq!(stats.row_leaf_pages, 1);
        // live: "apple", "cherry", "damson"
        assert_eq!(stats.total_keys, 3);
        assert_eq!(stats.total_entries, 3);
    }

    #[test]
    fn col_fix_counts_entries() {
        let mut b = ImageBuilder::new(PageKind::ColFixLeaf, 512);
        b.set_recno(1).fix_records(&[0u8; 48], 12);
        let page = page_from(&b);

        let mut stats = BtreeStats::default();
        stat_page(&page, &mut stats);
        assert_eq!(stats.col_fix_pages, 1);
        assert_eq!(stats.total_entries, 12);
    }
}
