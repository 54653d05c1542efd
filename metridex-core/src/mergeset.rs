//! Ordered item store backing one index generation
//!
//! The index engine consumes a small contract from its key/value store:
//! lexicographically ordered items, batched inserts, prefix seeks, a
//! flush callback fired whenever new items become visible, and a merge
//! callback invoked over sorted adjacent items so neighbouring rows can
//! be coalesced. `Table` is the in-process implementation of that
//! contract. Each table owns one directory on disk; the directory is
//! the unit of generation rollover and is removed by the owning
//! database when it is dropped.

use crate::Result;
use parking_lot::{Mutex, RwLock};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Invoked after every flush, once newly added items are visible
pub type FlushCallback = Box<dyn Fn() + Send + Sync>;

/// Invoked over a sorted run of items; may coalesce adjacent items.
/// The returned items must preserve sort order.
pub type MergeCallback = fn(Vec<Vec<u8>>) -> Vec<Vec<u8>>;

/// Sorted, deduplicated item store for one index generation
pub struct Table {
    path: PathBuf,
    /// Immutable snapshot of all visible items, in lexicographic order
    items: RwLock<Arc<Vec<Vec<u8>>>>,
    pending: Mutex<Vec<Vec<u8>>>,
    flush_callback: Option<FlushCallback>,
    merge_callback: Option<MergeCallback>,
}

impl Table {
    /// Open a table rooted at `path`, creating the directory if needed
    pub fn open(
        path: impl AsRef<Path>,
        flush_callback: Option<FlushCallback>,
        merge_callback: Option<MergeCallback>,
    ) -> Result<Table> {
        let path = path.as_ref().to_path_buf();
        fs::create_dir_all(&path)?;
        info!("opened table at {:?}", path);

        Ok(Table {
            path,
            items: RwLock::new(Arc::new(Vec::new())),
            pending: Mutex::new(Vec::new()),
            flush_callback,
            merge_callback,
        })
    }

    /// Directory backing this table
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of visible items
    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    /// Check whether the table holds no visible items
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Add a batch of items.
    ///
    /// The batch becomes visible atomically: concurrent searches observe
    /// either none or all of it. The flush callback fires before this
    /// returns, so version counters derived from it always run ahead of
    /// the data.
    pub fn add_items(&self, batch: Vec<Vec<u8>>) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        self.pending.lock().extend(batch);
        self.flush();
        Ok(())
    }

    /// Merge pending items into the visible snapshot
    pub fn flush(&self) {
        let mut pending = std::mem::take(&mut *self.pending.lock());
        if pending.is_empty() {
            return;
        }
        pending.sort_unstable();

        let current = self.items.read().clone();
        let mut merged = Vec::with_capacity(current.len() + pending.len());
        let mut i = 0;
        let mut j = 0;
        while i < current.len() && j < pending.len() {
            match current[i].cmp(&pending[j]) {
                std::cmp::Ordering::Less => {
                    merged.push(current[i].clone());
                    i += 1;
                }
                std::cmp::Ordering::Equal => {
                    // Re-submitted rows are harmless duplicates.
                    merged.push(current[i].clone());
                    i += 1;
                    j += 1;
                }
                std::cmp::Ordering::Greater => {
                    merged.push(std::mem::take(&mut pending[j]));
                    j += 1;
                }
            }
        }
        merged.extend(current[i..].iter().cloned());
        merged.extend(pending.drain(j..));
        merged.dedup();

        let merged = match self.merge_callback {
            Some(cb) => {
                // The callback keeps boundary rows verbatim next to
                // their union row, which may locally reorder the run.
                let mut out = cb(merged);
                out.sort_unstable();
                out.dedup();
                out
            }
            None => merged,
        };

        *self.items.write() = Arc::new(merged);
        if let Some(cb) = &self.flush_callback {
            cb();
        }
    }

    /// Open a search handle over the current snapshot
    pub fn search(&self) -> TableSearch {
        TableSearch {
            items: self.items.read().clone(),
            idx: 0,
        }
    }

    /// Close the table. Dropping the on-disk directory is the owner's
    /// decision, not the table's.
    pub fn must_close(&self) {
        info!("closed table at {:?}", self.path);
    }
}

/// Cursor over an immutable table snapshot.
///
/// Writers that run concurrently with an open search are invisible to
/// it; a new search observes them.
pub struct TableSearch {
    items: Arc<Vec<Vec<u8>>>,
    /// Index one past the current item; 0 means "before first"
    idx: usize,
}

impl TableSearch {
    /// Position the cursor so the next item is the first one ≥ `prefix`
    pub fn seek(&mut self, prefix: &[u8]) {
        self.idx = self.items.partition_point(|item| item.as_slice() < prefix);
    }

    /// Advance to the next item. Returns false at the end of the snapshot.
    pub fn next(&mut self) -> bool {
        if self.idx >= self.items.len() {
            return false;
        }
        self.idx += 1;
        true
    }

    /// The item the cursor is on. Only valid after `next` returned true.
    pub fn current_item(&self) -> &[u8] {
        &self.items[self.idx - 1]
    }

    /// Seek to the first item starting with `prefix`. Returns false if
    /// no such item exists.
    pub fn first_item_with_prefix(&mut self, prefix: &[u8]) -> bool {
        self.seek(prefix);
        self.next() && self.current_item().starts_with(prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn items(table: &Table) -> Vec<Vec<u8>> {
        let mut ts = table.search();
        let mut out = Vec::new();
        ts.seek(b"");
        while ts.next() {
            out.push(ts.current_item().to_vec());
        }
        out
    }

    #[test]
    fn test_add_items_sorted_and_deduped() {
        let dir = TempDir::new().unwrap();
        let table = Table::open(dir.path().join("t"), None, None).unwrap();

        table
            .add_items(vec![b"b".to_vec(), b"a".to_vec(), b"b".to_vec()])
            .unwrap();
        table.add_items(vec![b"a".to_vec(), b"c".to_vec()]).unwrap();

        assert_eq!(items(&table), vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn test_seek_and_prefix_scan() {
        let dir = TempDir::new().unwrap();
        let table = Table::open(dir.path().join("t"), None, None).unwrap();
        table
            .add_items(vec![
                b"aa1".to_vec(),
                b"ab2".to_vec(),
                b"ab3".to_vec(),
                b"ac4".to_vec(),
            ])
            .unwrap();

        let mut ts = table.search();
        ts.seek(b"ab");
        let mut found = Vec::new();
        while ts.next() {
            if !ts.current_item().starts_with(b"ab") {
                break;
            }
            found.push(ts.current_item().to_vec());
        }
        assert_eq!(found, vec![b"ab2".to_vec(), b"ab3".to_vec()]);

        let mut ts = table.search();
        assert!(ts.first_item_with_prefix(b"ac"));
        assert_eq!(ts.current_item(), b"ac4");
        let mut ts = table.search();
        assert!(!ts.first_item_with_prefix(b"zz"));
    }

    #[test]
    fn test_flush_callback_fires_per_batch() {
        static FLUSHES: AtomicUsize = AtomicUsize::new(0);
        let dir = TempDir::new().unwrap();
        let table = Table::open(
            dir.path().join("t"),
            Some(Box::new(|| {
                FLUSHES.fetch_add(1, Ordering::Relaxed);
            })),
            None,
        )
        .unwrap();

        let before = FLUSHES.load(Ordering::Relaxed);
        table.add_items(vec![b"x".to_vec()]).unwrap();
        table.add_items(vec![b"y".to_vec()]).unwrap();
        assert_eq!(FLUSHES.load(Ordering::Relaxed) - before, 2);
    }

    #[test]
    fn test_merge_callback_sees_sorted_run() {
        fn drop_mid(items: Vec<Vec<u8>>) -> Vec<Vec<u8>> {
            let mut prev: Option<&[u8]> = None;
            for item in &items {
                if let Some(p) = prev {
                    assert!(p <= item.as_slice());
                }
                prev = Some(item);
            }
            items
        }

        let dir = TempDir::new().unwrap();
        let table = Table::open(dir.path().join("t"), None, Some(drop_mid)).unwrap();
        table
            .add_items(vec![b"c".to_vec(), b"a".to_vec(), b"b".to_vec()])
            .unwrap();
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn test_search_snapshot_isolation() {
        let dir = TempDir::new().unwrap();
        let table = Table::open(dir.path().join("t"), None, None).unwrap();
        table.add_items(vec![b"a".to_vec()]).unwrap();

        let mut old = table.search();
        table.add_items(vec![b"b".to_vec()]).unwrap();

        old.seek(b"");
        let mut seen = 0;
        while old.next() {
            seen += 1;
        }
        assert_eq!(seen, 1);

        assert_eq!(table.len(), 2);
    }
}
