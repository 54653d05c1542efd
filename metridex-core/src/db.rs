//! Index database shell: caches, tombstones and generation rollover
//!
//! An `IndexDb` is one generation of the inverted index. During
//! retention rollover two generations coexist: the current one takes
//! all writes while the previous one stays reachable read-only through
//! the external-DB pointer, until the pointer is swapped away and the
//! last borrower drops its handle. `Arc<IndexDb>` carries the reference
//! count; `schedule_to_drop` arms removal of the on-disk directory once
//! the count reaches zero.

use crate::cache::{invalidate_tag_cache, WorkingSetCache};
use crate::filters::{marshal_tag_filters_key, TagFilters};
use crate::keys::{
    marshal_common_prefix, NS_DATE_TO_METRIC_ID, NS_DELETED_METRIC_ID,
    NS_METRIC_ID_TO_METRIC_NAME, NS_METRIC_ID_TO_TSID, NS_METRIC_NAME_TO_TSID,
    NS_TAG_TO_METRIC_IDS,
};
use crate::mergeset::Table;
use crate::metric_name::{MetricName, TAG_SEPARATOR};
use crate::rows::merge_tag_rows;
use crate::search::IndexSearch;
use crate::time_index::{SharedHourMetricIds, TimeRange};
use crate::tsid::{marshal_tsids, unmarshal_tsids, Tsid, MARSHALED_TSID_LEN};
use crate::{IndexError, MetricId, Result};
use bytes::BufMut;
use lz4_flex::{compress_prepend_size, decompress_size_prepended};
use parking_lot::{Mutex, RwLock};
use std::cell::Cell;
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{info, warn};
use xxhash_rust::xxh3::xxh3_64;

/// Upper bound used when resolving ids for deletion
const DELETE_MAX_METRICS: usize = 1_000_000_000;

/// Internal planner signals must never cross the public boundary.
fn seal(err: IndexError) -> IndexError {
    debug_assert!(!err.is_internal(), "internal planner signal escaped: {err}");
    err
}

/// One generation of the inverted index
pub struct IndexDb {
    name: String,
    pub(crate) tb: Table,

    ext_db: Mutex<Option<Arc<IndexDb>>>,

    /// Tag filters → compressed TSID list, versioned keys
    pub(crate) tag_cache: WorkingSetCache,
    /// Filter shapes known to match too many series
    pub(crate) useless_tag_filters_cache: WorkingSetCache,
    /// MetricID → TSID, shared across generations
    pub(crate) metric_id_cache: Arc<WorkingSetCache>,
    /// MetricID → MetricName, shared across generations
    pub(crate) metric_name_cache: Arc<WorkingSetCache>,

    /// Tombstones of this generation plus the external one, published
    /// as an immutable set
    deleted_metric_ids: RwLock<Arc<HashSet<MetricId>>>,
    deleted_metric_ids_update_lock: Mutex<()>,

    pub(crate) curr_hour_metric_ids: SharedHourMetricIds,
    pub(crate) prev_hour_metric_ids: SharedHourMetricIds,

    scan_loops_per_metric: AtomicUsize,

    /// Ids found without their MetricID→TSID row; a high rate points at
    /// a corrupted generation
    pub(crate) missing_tsids_for_metric_id: AtomicU64,
    pub(crate) recent_hour_metric_ids_search_calls: AtomicU64,
    pub(crate) recent_hour_metric_ids_search_hits: AtomicU64,
    pub(crate) date_metric_ids_search_calls: AtomicU64,
    pub(crate) date_metric_ids_search_hits: AtomicU64,

    must_drop: AtomicBool,
}

impl IndexDb {
    /// Open a generation rooted at `path`.
    ///
    /// The id→TSID and id→name caches and the hour snapshots outlive any
    /// single generation, so the caller owns them and passes them in.
    pub fn open(
        path: impl AsRef<Path>,
        metric_id_cache: Arc<WorkingSetCache>,
        metric_name_cache: Arc<WorkingSetCache>,
        curr_hour_metric_ids: SharedHourMetricIds,
        prev_hour_metric_ids: SharedHourMetricIds,
    ) -> Result<Arc<IndexDb>> {
        let path = path.as_ref();
        let tb = Table::open(
            path,
            Some(Box::new(invalidate_tag_cache)),
            Some(merge_tag_rows),
        )?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let db = IndexDb {
            name,
            tb,
            ext_db: Mutex::new(None),
            tag_cache: WorkingSetCache::new(crate::config::TAG_CACHE_CAPACITY),
            useless_tag_filters_cache: WorkingSetCache::new(
                crate::config::USELESS_TAG_FILTERS_CACHE_CAPACITY,
            ),
            metric_id_cache,
            metric_name_cache,
            deleted_metric_ids: RwLock::new(Arc::new(HashSet::new())),
            deleted_metric_ids_update_lock: Mutex::new(()),
            curr_hour_metric_ids,
            prev_hour_metric_ids,
            scan_loops_per_metric: AtomicUsize::new(
                crate::config::MAX_INDEX_SCAN_LOOPS_PER_METRIC,
            ),
            missing_tsids_for_metric_id: AtomicU64::new(0),
            recent_hour_metric_ids_search_calls: AtomicU64::new(0),
            recent_hour_metric_ids_search_hits: AtomicU64::new(0),
            date_metric_ids_search_calls: AtomicU64::new(0),
            date_metric_ids_search_hits: AtomicU64::new(0),
            must_drop: AtomicBool::new(false),
        };

        let mut is = IndexSearch::new(&db);
        let dmis = is.load_deleted_metric_ids()?;
        drop(is);
        *db.deleted_metric_ids.write() = Arc::new(dmis);

        info!("opened index db {:?}", db.name);
        Ok(Arc::new(db))
    }

    /// Generation name (the directory base name)
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current loop budget multiplier for bounded scans
    pub(crate) fn scan_loops_per_metric(&self) -> usize {
        self.scan_loops_per_metric.load(Ordering::Relaxed)
    }

    /// Tune the loop budget multiplier
    pub fn set_scan_loops_per_metric(&self, loops: usize) {
        self.scan_loops_per_metric.store(loops, Ordering::Relaxed);
    }

    /// Arm removal of the on-disk directory once the last handle drops
    pub fn schedule_to_drop(&self) {
        self.must_drop.store(true, Ordering::Relaxed);
    }

    // ---- external generation ----------------------------------------

    /// Swap the external (previous-generation) database.
    ///
    /// Tombstones of the external generation are copied into this one
    /// first, so deletes survive rollover. The handle that is swapped
    /// out drops here, which may release its generation entirely.
    pub fn set_ext_db(&self, ext_db: Option<Arc<IndexDb>>) {
        if let Some(ext) = &ext_db {
            let dmis_ext = ext.deleted_metric_ids();
            let ids: Vec<MetricId> = dmis_ext.iter().copied().collect();
            self.update_deleted_metric_ids(&ids);
        }
        let _prev = {
            let mut guard = self.ext_db.lock();
            std::mem::replace(&mut *guard, ext_db)
        };
    }

    /// Run `f` against the external database, if one is set.
    ///
    /// The pointer lock is held only long enough to clone the handle;
    /// this is the single serialization point between rollover and
    /// readers.
    pub(crate) fn do_ext_db(&self, f: impl FnOnce(&IndexDb)) -> bool {
        let ext = self.ext_db.lock().clone();
        match ext {
            Some(ext) => {
                f(&ext);
                true
            }
            None => false,
        }
    }

    // ---- deletion set -----------------------------------------------

    /// The published tombstone set
    pub(crate) fn deleted_metric_ids(&self) -> Arc<HashSet<MetricId>> {
        self.deleted_metric_ids.read().clone()
    }

    /// Number of tombstoned ids known to this generation
    pub fn deleted_metric_ids_len(&self) -> usize {
        self.deleted_metric_ids.read().len()
    }

    fn update_deleted_metric_ids(&self, metric_ids: &[MetricId]) {
        if metric_ids.is_empty() {
            return;
        }
        let _guard = self.deleted_metric_ids_update_lock.lock();
        let old = self.deleted_metric_ids();
        let mut new = HashSet::with_capacity(old.len() + metric_ids.len());
        new.extend(old.iter().copied());
        new.extend(metric_ids.iter().copied());
        *self.deleted_metric_ids.write() = Arc::new(new);
    }

    // ---- caches -----------------------------------------------------

    pub(crate) fn get_from_tag_cache(&self, key: &[u8]) -> Option<Vec<Tsid>> {
        let compressed = self.tag_cache.get(key)?;
        let buf = decompress_size_prepended(&compressed)
            .unwrap_or_else(|e| panic!("FATAL: cannot decompress tsids from the tag cache: {e}"));
        let tsids = unmarshal_tsids(&buf)
            .unwrap_or_else(|e| panic!("FATAL: cannot unmarshal tsids from the tag cache: {e}"));
        Some(tsids)
    }

    pub(crate) fn put_to_tag_cache(&self, tsids: &[Tsid], key: &[u8]) {
        let mut buf = Vec::with_capacity(8 + tsids.len() * MARSHALED_TSID_LEN);
        marshal_tsids(&mut buf, tsids);
        self.tag_cache.set(key, &compress_prepend_size(&buf));
    }

    pub(crate) fn get_from_metric_id_cache(&self, metric_id: MetricId) -> Result<Option<Tsid>> {
        // The key needs no tenant: metric ids are globally unique.
        // Tombstones are the caller's concern.
        let Some(buf) = self.metric_id_cache.get(&metric_id.to_be_bytes()) else {
            return Ok(None);
        };
        if buf.len() != MARSHALED_TSID_LEN {
            return Err(IndexError::Corruption(format!(
                "corrupted MetricID->TSID cache: unexpected value size for metric_id={metric_id}; got {} bytes; want {MARSHALED_TSID_LEN} bytes",
                buf.len()
            )));
        }
        let (tsid, _) = Tsid::unmarshal(&buf)?;
        Ok(Some(tsid))
    }

    pub(crate) fn put_to_metric_id_cache(&self, metric_id: MetricId, tsid: &Tsid) {
        let mut buf = Vec::with_capacity(MARSHALED_TSID_LEN);
        tsid.marshal(&mut buf);
        self.metric_id_cache.set(&metric_id.to_be_bytes(), &buf);
    }

    // ---- series creation --------------------------------------------

    /// Return the TSID for a marshaled metric name, creating the series
    /// on first sight.
    ///
    /// Concurrent creators may race and produce duplicate TSIDs for the
    /// same name; the query path deduplicates by metric id and a later
    /// read finds one of the duplicates, so the race is left alone.
    pub fn get_or_create_tsid_by_name(&self, metric_name: &[u8]) -> Result<Tsid> {
        const MAX_MISSES: u32 = 100;
        const MAX_SKIPS: u32 = 10_000;
        thread_local! {
            static TSID_BY_NAME_MISSES: Cell<u32> = const { Cell::new(0) };
            static TSID_BY_NAME_SKIPS: Cell<u32> = const { Cell::new(0) };
        }

        // Skip the lookup after many serial misses: bulk inserts of new
        // series would otherwise pay for a fruitless search every time.
        let misses = TSID_BY_NAME_MISSES.with(|c| c.get());
        if misses < MAX_MISSES {
            let mut is = IndexSearch::new(self);
            let found = is.get_tsid_by_metric_name(metric_name)?;
            drop(is);
            if let Some(tsid) = found {
                TSID_BY_NAME_MISSES.with(|c| c.set(0));
                return Ok(tsid);
            }
            TSID_BY_NAME_MISSES.with(|c| c.set(misses + 1));
        } else {
            let skips = TSID_BY_NAME_SKIPS.with(|c| c.get()) + 1;
            TSID_BY_NAME_SKIPS.with(|c| c.set(skips));
            if skips > MAX_SKIPS {
                TSID_BY_NAME_SKIPS.with(|c| c.set(0));
                TSID_BY_NAME_MISSES.with(|c| c.set(0));
            }
        }

        self.create_tsid_by_name(metric_name)
    }

    fn create_tsid_by_name(&self, metric_name: &[u8]) -> Result<Tsid> {
        let mut mn = MetricName::unmarshal(metric_name)?;
        mn.sort_tags();
        let tsid = self.generate_tsid(metric_name, &mn)?;
        self.create_indexes(&tsid, &mn)?;
        // The tag cache needs no explicit invalidation here: the store's
        // flush callback has already moved the generation forward.
        Ok(tsid)
    }

    fn generate_tsid(&self, metric_name: &[u8], mn: &MetricName) -> Result<Tsid> {
        // Probe the previous generation first so ids survive rollover.
        let mut ext_result: Option<Result<Option<Tsid>>> = None;
        self.do_ext_db(|ext| {
            let mut is = IndexSearch::new(ext);
            ext_result = Some(is.get_tsid_by_metric_name(metric_name));
        });
        if let Some(res) = ext_result {
            if let Some(tsid) = res? {
                return Ok(tsid);
            }
        }

        let mut tsid = Tsid {
            account_id: mn.account_id,
            project_id: mn.project_id,
            metric_group_id: xxh3_64(&mn.metric_group),
            job_id: 0,
            instance_id: 0,
            metric_id: next_metric_id(),
        };
        if let Some(tag) = mn.tags.first() {
            tsid.job_id = xxh3_64(&tag.value) as u32;
        }
        if let Some(tag) = mn.tags.get(1) {
            tsid.instance_id = xxh3_64(&tag.value) as u32;
        }
        Ok(tsid)
    }

    /// Emit every index row for one new series as a single batch.
    ///
    /// The row order is fixed: a partially visible batch must never
    /// expose a name→TSID row before its id→TSID counterpart in the
    /// store's iteration order.
    fn create_indexes(&self, tsid: &Tsid, mn: &MetricName) -> Result<()> {
        let mut items: Vec<Vec<u8>> = Vec::with_capacity(4 + mn.tags.len());

        // MetricName -> TSID
        let mut row = Vec::with_capacity(64);
        row.push(NS_METRIC_NAME_TO_TSID);
        mn.marshal(&mut row);
        row.push(TAG_SEPARATOR);
        tsid.marshal(&mut row);
        items.push(row);

        // MetricID -> MetricName
        let mut row = Vec::with_capacity(64);
        marshal_common_prefix(
            &mut row,
            NS_METRIC_ID_TO_METRIC_NAME,
            mn.account_id,
            mn.project_id,
        );
        row.put_u64(tsid.metric_id);
        mn.marshal(&mut row);
        items.push(row);

        // MetricID -> TSID
        let mut row = Vec::with_capacity(32 + MARSHALED_TSID_LEN);
        marshal_common_prefix(&mut row, NS_METRIC_ID_TO_TSID, mn.account_id, mn.project_id);
        row.put_u64(tsid.metric_id);
        tsid.marshal(&mut row);
        items.push(row);

        let mut common_prefix = Vec::with_capacity(16);
        marshal_common_prefix(
            &mut common_prefix,
            NS_TAG_TO_METRIC_IDS,
            mn.account_id,
            mn.project_id,
        );

        // MetricGroup -> MetricID; the empty tag key carries the group.
        let mut row = common_prefix.clone();
        crate::metric_name::marshal_tag_value(&mut row, b"");
        crate::metric_name::marshal_tag_value(&mut row, &mn.metric_group);
        row.put_u64(tsid.metric_id);
        items.push(row);

        // Tag -> MetricID per label.
        for tag in &mn.tags {
            let mut row = common_prefix.clone();
            tag.marshal(&mut row);
            row.put_u64(tsid.metric_id);
            items.push(row);
        }

        self.tb.add_items(items)
    }

    /// Record that `metric_id` was seen on `date` (days since epoch)
    pub fn store_date_metric_id(
        &self,
        date: u64,
        metric_id: MetricId,
        account_id: u32,
        project_id: u32,
    ) -> Result<()> {
        let mut is = IndexSearch::new(self);
        let exists = is.has_date_metric_id(date, metric_id, account_id, project_id)?;
        drop(is);
        if exists {
            return Ok(());
        }

        let mut row = Vec::with_capacity(25);
        marshal_common_prefix(&mut row, NS_DATE_TO_METRIC_ID, account_id, project_id);
        row.put_u64(date);
        row.put_u64(metric_id);
        self.tb.add_items(vec![row])
    }

    // ---- queries ----------------------------------------------------

    /// Resolve tag filters to TSIDs over a time range, sorted by full
    /// TSID order with no duplicate metric ids
    pub fn search_tsids(
        &self,
        tfss: &[TagFilters],
        tr: TimeRange,
        max_metrics: usize,
    ) -> Result<Vec<Tsid>> {
        if tfss.is_empty() {
            return Ok(Vec::new());
        }

        let mut tf_key = Vec::with_capacity(64);
        marshal_tag_filters_key(&mut tf_key, tfss, true);
        if let Some(tsids) = self.get_from_tag_cache(&tf_key) {
            return Ok(tsids);
        }

        let mut is = IndexSearch::new(self);
        let local_tsids = is.search_tsids(tfss, tr, max_metrics).map_err(seal)?;
        drop(is);

        let mut ext_tsids: Vec<Tsid> = Vec::new();
        let mut ext_err: Option<IndexError> = None;
        self.do_ext_db(|ext| {
            // The external generation is read-only; its cache keys need
            // no version.
            let mut ext_key = Vec::with_capacity(64);
            marshal_tag_filters_key(&mut ext_key, tfss, false);
            if let Some(tsids) = ext.get_from_tag_cache(&ext_key) {
                ext_tsids = tsids;
                return;
            }
            let mut is = IndexSearch::new(ext);
            match is.search_tsids(tfss, tr, max_metrics) {
                Ok(mut tsids) => {
                    tsids.sort_unstable();
                    ext.put_to_tag_cache(&tsids, &ext_key);
                    ext_tsids = tsids;
                }
                Err(e) => ext_err = Some(e),
            }
        });
        if let Some(e) = ext_err {
            return Err(e);
        }

        let mut tsids = merge_tsids(local_tsids, ext_tsids);

        // Tombstones beat every cached or external hit, including ones
        // recorded after the external cache entry was built.
        let dmis = self.deleted_metric_ids();
        if !dmis.is_empty() {
            tsids.retain(|tsid| !dmis.contains(&tsid.metric_id));
        }

        tsids.sort_unstable();
        self.put_to_tag_cache(&tsids, &tf_key);
        Ok(tsids)
    }

    /// All tag keys of a tenant, across both generations.
    ///
    /// The order is unspecified; callers sort as needed.
    pub fn search_tag_keys(
        &self,
        account_id: u32,
        project_id: u32,
        max_tag_keys: usize,
    ) -> Result<Vec<Vec<u8>>> {
        let mut tks = HashSet::new();
        let mut is = IndexSearch::new(self);
        is.search_tag_keys(account_id, project_id, &mut tks, max_tag_keys)?;
        drop(is);

        let mut ext_err = None;
        self.do_ext_db(|ext| {
            let mut is = IndexSearch::new(ext);
            if let Err(e) = is.search_tag_keys(account_id, project_id, &mut tks, max_tag_keys) {
                ext_err = Some(e);
            }
        });
        if let Some(e) = ext_err {
            return Err(e);
        }
        Ok(tks.into_iter().collect())
    }

    /// All values of one tag key, across both generations.
    ///
    /// The order is unspecified; callers sort as needed.
    pub fn search_tag_values(
        &self,
        account_id: u32,
        project_id: u32,
        tag_key: &[u8],
        max_tag_values: usize,
    ) -> Result<Vec<Vec<u8>>> {
        let mut tvs = HashSet::new();
        let mut is = IndexSearch::new(self);
        is.search_tag_values(account_id, project_id, tag_key, &mut tvs, max_tag_values)?;
        drop(is);

        let mut ext_err = None;
        self.do_ext_db(|ext| {
            let mut is = IndexSearch::new(ext);
            if let Err(e) =
                is.search_tag_values(account_id, project_id, tag_key, &mut tvs, max_tag_values)
            {
                ext_err = Some(e);
            }
        });
        if let Some(e) = ext_err {
            return Err(e);
        }
        Ok(tvs.into_iter().collect())
    }

    /// Approximate series count for a tenant. Includes deleted series
    /// and may count a series twice across generations.
    pub fn get_series_count(&self, account_id: u32, project_id: u32) -> Result<u64> {
        let mut is = IndexSearch::new(self);
        let n = is.get_series_count(account_id, project_id)?;
        drop(is);

        let mut ext_n = 0u64;
        let mut ext_err = None;
        self.do_ext_db(|ext| {
            let mut is = IndexSearch::new(ext);
            match is.get_series_count(account_id, project_id) {
                Ok(n) => ext_n = n,
                Err(e) => ext_err = Some(e),
            }
        });
        if let Some(e) = ext_err {
            return Err(e);
        }
        Ok(n + ext_n)
    }

    /// Resolve a metric id to its marshaled name, probing the external
    /// generation on a local miss.
    ///
    /// `Ok(None)` is an incomplete snapshot (unflushed entries or a
    /// snapshot cut), not corruption.
    pub fn search_metric_name(
        &self,
        metric_id: MetricId,
        account_id: u32,
        project_id: u32,
    ) -> Result<Option<Vec<u8>>> {
        let mut is = IndexSearch::new(self);
        let found = is.search_metric_name(metric_id, account_id, project_id)?;
        drop(is);
        if found.is_some() {
            return Ok(found);
        }

        let mut ext_found = None;
        let mut ext_err = None;
        self.do_ext_db(|ext| {
            let mut is = IndexSearch::new(ext);
            match is.search_metric_name(metric_id, account_id, project_id) {
                Ok(f) => ext_found = f,
                Err(e) => ext_err = Some(e),
            }
        });
        if let Some(e) = ext_err {
            return Err(e);
        }
        Ok(ext_found)
    }

    /// Tombstone every series matching the filters, in this generation
    /// and the external one. Returns the number of ids marked.
    ///
    /// The in-memory set makes the deletion visible to queries in this
    /// process before the tombstone rows are flushed anywhere.
    pub fn delete_tsids(&self, tfss: &[TagFilters]) -> Result<usize> {
        if tfss.is_empty() {
            return Ok(0);
        }

        let mut is = IndexSearch::new(self);
        let metric_ids = is
            .search_metric_ids(tfss, TimeRange::zero(), DELETE_MAX_METRICS)
            .map_err(seal)?;
        drop(is);
        if metric_ids.is_empty() {
            return Ok(0);
        }

        let mut items = Vec::with_capacity(metric_ids.len());
        for &metric_id in &metric_ids {
            let mut row = Vec::with_capacity(9);
            row.push(NS_DELETED_METRIC_ID);
            row.put_u64(metric_id);
            items.push(row);
        }
        self.tb.add_items(items)?;
        let mut deleted_count = metric_ids.len();

        self.update_deleted_metric_ids(&metric_ids);

        // Versioned tag-cache entries may hold the deleted ids.
        invalidate_tag_cache();
        // The useless-filter cache is left alone: candidates found on a
        // miss are filtered through the deletion set anyway.

        let mut ext_err = None;
        self.do_ext_db(|ext| match ext.delete_tsids(tfss) {
            Ok(n) => deleted_count += n,
            Err(e) => ext_err = Some(e),
        });
        if let Some(e) = ext_err {
            return Err(e);
        }
        Ok(deleted_count)
    }

    /// Fill `m` with a counter snapshot of this generation and, where
    /// shared, of the external one
    pub fn update_metrics(self: &Arc<Self>, m: &mut IndexDbMetrics) {
        m.tag_cache_size += self.tag_cache.entry_count();
        m.tag_cache_size_bytes += self.tag_cache.size_bytes();
        m.tag_cache_requests += self.tag_cache.requests();
        m.tag_cache_misses += self.tag_cache.misses();

        m.useless_tag_filters_cache_size += self.useless_tag_filters_cache.entry_count();
        m.useless_tag_filters_cache_requests += self.useless_tag_filters_cache.requests();
        m.useless_tag_filters_cache_misses += self.useless_tag_filters_cache.misses();

        m.deleted_metrics_count += self.deleted_metric_ids_len() as u64;
        m.index_db_ref_count += Arc::strong_count(self) as u64;
        m.missing_tsids_for_metric_id += self.missing_tsids_for_metric_id.load(Ordering::Relaxed);
        m.recent_hour_metric_ids_search_calls += self
            .recent_hour_metric_ids_search_calls
            .load(Ordering::Relaxed);
        m.recent_hour_metric_ids_search_hits += self
            .recent_hour_metric_ids_search_hits
            .load(Ordering::Relaxed);
        m.date_metric_ids_search_calls +=
            self.date_metric_ids_search_calls.load(Ordering::Relaxed);
        m.date_metric_ids_search_hits += self.date_metric_ids_search_hits.load(Ordering::Relaxed);
        m.items_count += self.tb.len() as u64;

        self.do_ext_db(|ext| {
            m.items_count += ext.tb.len() as u64;
        });
    }
}

impl Drop for IndexDb {
    fn drop(&mut self) {
        self.tb.must_close();
        if self.must_drop.load(Ordering::Relaxed) {
            info!("dropping index db {:?}", self.name);
            if let Err(e) = fs::remove_dir_all(self.tb.path()) {
                warn!("cannot remove dropped index db {:?}: {}", self.name, e);
            }
        }
    }
}

/// Counter snapshot filled by [`IndexDb::update_metrics`]
#[derive(Debug, Default, Clone)]
pub struct IndexDbMetrics {
    pub tag_cache_size: u64,
    pub tag_cache_size_bytes: u64,
    pub tag_cache_requests: u64,
    pub tag_cache_misses: u64,

    pub useless_tag_filters_cache_size: u64,
    pub useless_tag_filters_cache_requests: u64,
    pub useless_tag_filters_cache_misses: u64,

    pub deleted_metrics_count: u64,
    pub index_db_ref_count: u64,
    pub missing_tsids_for_metric_id: u64,

    pub recent_hour_metric_ids_search_calls: u64,
    pub recent_hour_metric_ids_search_hits: u64,
    pub date_metric_ids_search_calls: u64,
    pub date_metric_ids_search_hits: u64,

    pub items_count: u64,
}

/// Union two TSID lists, deduplicating by metric id
fn merge_tsids(a: Vec<Tsid>, b: Vec<Tsid>) -> Vec<Tsid> {
    let (mut big, small) = if a.len() >= b.len() { (a, b) } else { (b, a) };
    if small.is_empty() {
        return big;
    }
    let mut seen: HashSet<MetricId> = big.iter().map(|t| t.metric_id).collect();
    for tsid in small {
        if seen.insert(tsid.metric_id) {
            big.push(tsid);
        }
    }
    big
}

/// Allocate a process-global metric id.
///
/// The counter is seeded from wall-clock nanoseconds at first use so a
/// restarted process cannot reuse ids of its predecessor. The clock
/// must not move backwards between restarts.
fn next_metric_id() -> MetricId {
    static METRIC_ID_COUNTER: OnceLock<AtomicU64> = OnceLock::new();
    let counter = METRIC_ID_COUNTER.get_or_init(|| {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock is before the unix epoch")
            .as_nanos() as u64;
        AtomicU64::new(nanos)
    });
    counter.fetch_add(1, Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_metric_id_monotonic() {
        let a = next_metric_id();
        let b = next_metric_id();
        assert!(b > a);
        // Seeded from the wall clock, never from zero.
        assert!(a > 1_000_000_000);
    }

    #[test]
    fn test_merge_tsids_dedups_by_metric_id() {
        let t = |id: u64| Tsid {
            metric_id: id,
            ..Tsid::default()
        };
        let merged = merge_tsids(vec![t(1), t(2)], vec![t(2), t(3)]);
        let mut ids: Vec<u64> = merged.iter().map(|t| t.metric_id).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn test_merge_tsids_empty_sides() {
        let t = |id: u64| Tsid {
            metric_id: id,
            ..Tsid::default()
        };
        assert_eq!(merge_tsids(vec![t(1)], Vec::new()).len(), 1);
        assert_eq!(merge_tsids(Vec::new(), vec![t(1)]).len(), 1);
    }
}
