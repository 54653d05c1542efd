//! Search primitives and the filter planner
//!
//! `IndexSearch` is the per-call scratch for every read path: it owns a
//! snapshot cursor over the store, a reusable key buffer and a tag-row
//! parser. The planner resolves one filter set by picking the cheapest
//! positive filter (the pivot), intersecting the rest against the pivot
//! set, and falling back to in-memory metric-name matching when a scan
//! outruns its loop budget.
//!
//! Scans are bounded by loop budgets instead of wall-clock timeouts:
//! `max_metrics × MAX_INDEX_SCAN_LOOPS_PER_METRIC` index loops cost
//! more than directly matching the names of the candidates already
//! found.

use crate::cache::{
    USELESS_MULTI_TAG_FILTERS_KEY_PREFIX, USELESS_NEGATIVE_TAG_FILTER_KEY_PREFIX,
    USELESS_SINGLE_TAG_FILTER_KEY_PREFIX, USELESS_TAG_FILTER_CACHE_VALUE,
};
use crate::config::MAX_DAYS_FOR_DATE_METRIC_IDS;
use crate::db::IndexDb;
use crate::filters::{TagFilter, TagFilters};
use crate::keys::{
    marshal_common_prefix, NS_DATE_TO_METRIC_ID, NS_DELETED_METRIC_ID, NS_METRIC_ID_TO_METRIC_NAME,
    NS_METRIC_ID_TO_TSID, NS_METRIC_NAME_TO_TSID, NS_TAG_TO_METRIC_IDS,
};
use crate::mergeset::TableSearch;
use crate::metric_name::{marshal_tag_value, MetricName, TAG_SEPARATOR};
use crate::rows::TagRowParser;
use crate::time_index::TimeRange;
use crate::tsid::Tsid;
use crate::{IndexError, MetricId, Result};
use bytes::BufMut;
use std::collections::HashSet;
use std::sync::atomic::Ordering;

/// Per-call scratch for one search against one index generation
pub(crate) struct IndexSearch<'a> {
    db: &'a IndexDb,
    ts: TableSearch,
    kb: Vec<u8>,
    mp: TagRowParser,
}

impl<'a> IndexSearch<'a> {
    pub(crate) fn new(db: &'a IndexDb) -> Self {
        Self {
            db,
            ts: db.tb.search(),
            kb: Vec::with_capacity(64),
            mp: TagRowParser::default(),
        }
    }

    /// Look up the TSID stored for a metric name, skipping tombstones
    pub(crate) fn get_tsid_by_metric_name(&mut self, metric_name: &[u8]) -> Result<Option<Tsid>> {
        let dmis = self.db.deleted_metric_ids();
        self.kb.clear();
        self.kb.push(NS_METRIC_NAME_TO_TSID);
        self.kb.extend_from_slice(metric_name);
        self.kb.push(TAG_SEPARATOR);
        self.ts.seek(&self.kb);
        while self.ts.next() {
            let item = self.ts.current_item();
            if !item.starts_with(&self.kb) {
                break;
            }
            let v = &item[self.kb.len()..];
            let (tsid, tail) = Tsid::unmarshal(v)?;
            if !tail.is_empty() {
                return Err(IndexError::Corruption(format!(
                    "unexpected non-empty tail of {} bytes left after unmarshaling TSID",
                    tail.len()
                )));
            }
            if dmis.contains(&tsid.metric_id) {
                // Deleted entry; a duplicate may follow.
                continue;
            }
            return Ok(Some(tsid));
        }
        Ok(None)
    }

    /// Resolve a metric id to its name via the cache or namespace 3
    pub(crate) fn search_metric_name(
        &mut self,
        metric_id: MetricId,
        account_id: u32,
        project_id: u32,
    ) -> Result<Option<Vec<u8>>> {
        if let Some(name) = self.db.metric_name_cache.get(&metric_id.to_be_bytes()) {
            return Ok(Some(name));
        }
        self.kb.clear();
        marshal_common_prefix(
            &mut self.kb,
            NS_METRIC_ID_TO_METRIC_NAME,
            account_id,
            project_id,
        );
        self.kb.put_u64(metric_id);
        if !self.ts.first_item_with_prefix(&self.kb) {
            return Ok(None);
        }
        let name = self.ts.current_item()[self.kb.len()..].to_vec();
        // Deleted ids are filtered before this point.
        self.db
            .metric_name_cache
            .set(&metric_id.to_be_bytes(), &name);
        Ok(Some(name))
    }

    /// Resolve a metric id to its TSID via namespace 2
    pub(crate) fn get_tsid_by_metric_id(
        &mut self,
        metric_id: MetricId,
        account_id: u32,
        project_id: u32,
    ) -> Result<Option<Tsid>> {
        self.kb.clear();
        marshal_common_prefix(&mut self.kb, NS_METRIC_ID_TO_TSID, account_id, project_id);
        self.kb.put_u64(metric_id);
        if !self.ts.first_item_with_prefix(&self.kb) {
            return Ok(None);
        }
        let v = &self.ts.current_item()[self.kb.len()..];
        let (tsid, tail) = Tsid::unmarshal(v)?;
        if !tail.is_empty() {
            return Err(IndexError::Corruption(format!(
                "unexpected non-empty tail of {} bytes left after unmarshaling TSID",
                tail.len()
            )));
        }
        Ok(Some(tsid))
    }

    /// Count the series of a tenant, tombstoned ones included
    pub(crate) fn get_series_count(&mut self, account_id: u32, project_id: u32) -> Result<u64> {
        self.kb.clear();
        marshal_common_prefix(&mut self.kb, NS_METRIC_ID_TO_TSID, account_id, project_id);
        let prefix = self.kb.clone();
        self.ts.seek(&prefix);
        let mut n = 0u64;
        while self.ts.next() {
            if !self.ts.current_item().starts_with(&prefix) {
                break;
            }
            n += 1;
        }
        Ok(n)
    }

    /// Collect up to `max_tag_keys` distinct tag keys of a tenant
    pub(crate) fn search_tag_keys(
        &mut self,
        account_id: u32,
        project_id: u32,
        tks: &mut HashSet<Vec<u8>>,
        max_tag_keys: usize,
    ) -> Result<()> {
        let dmis = self.db.deleted_metric_ids();
        self.kb.clear();
        marshal_common_prefix(&mut self.kb, NS_TAG_TO_METRIC_IDS, account_id, project_id);
        let prefix = self.kb.clone();
        self.ts.seek(&prefix);
        while tks.len() < max_tag_keys && self.ts.next() {
            let item = self.ts.current_item();
            if !item.starts_with(&prefix) {
                break;
            }
            self.mp.init(item)?;
            if self.mp.is_deleted_tag(&dmis) {
                continue;
            }
            tks.insert(self.mp.tag.key.clone());

            // Jump past every row of this tag key: the key buffer ends
            // with the separator, so incrementing it seeks to the next
            // key.
            self.kb.clear();
            self.kb.extend_from_slice(&prefix);
            marshal_tag_value(&mut self.kb, &self.mp.tag.key);
            *self.kb.last_mut().unwrap() += 1;
            self.ts.seek(&self.kb);
        }
        Ok(())
    }

    /// Collect up to `max_tag_values` distinct values of one tag key
    pub(crate) fn search_tag_values(
        &mut self,
        account_id: u32,
        project_id: u32,
        tag_key: &[u8],
        tvs: &mut HashSet<Vec<u8>>,
        max_tag_values: usize,
    ) -> Result<()> {
        let dmis = self.db.deleted_metric_ids();
        self.kb.clear();
        marshal_common_prefix(&mut self.kb, NS_TAG_TO_METRIC_IDS, account_id, project_id);
        marshal_tag_value(&mut self.kb, tag_key);
        let prefix = self.kb.clone();
        self.ts.seek(&prefix);
        while tvs.len() < max_tag_values && self.ts.next() {
            let item = self.ts.current_item();
            if !item.starts_with(&prefix) {
                break;
            }
            self.mp.init(item)?;
            if self.mp.is_deleted_tag(&dmis) {
                continue;
            }
            tvs.insert(self.mp.tag.value.clone());

            // Jump past the remaining rows of this value.
            self.kb.clear();
            self.kb.extend_from_slice(&prefix);
            marshal_tag_value(&mut self.kb, &self.mp.tag.value);
            *self.kb.last_mut().unwrap() += 1;
            self.ts.seek(&self.kb);
        }
        Ok(())
    }

    /// Load every persisted tombstone from namespace 4
    pub(crate) fn load_deleted_metric_ids(&mut self) -> Result<HashSet<MetricId>> {
        let mut dmis = HashSet::new();
        self.kb.clear();
        self.kb.push(NS_DELETED_METRIC_ID);
        self.ts.seek(&self.kb);
        while self.ts.next() {
            let item = self.ts.current_item();
            if !item.starts_with(&self.kb) {
                break;
            }
            let tail = &item[self.kb.len()..];
            if tail.len() != 8 {
                return Err(IndexError::Corruption(format!(
                    "unexpected tombstone row length; got {} bytes; want 8 bytes",
                    tail.len()
                )));
            }
            dmis.insert(u64::from_be_bytes(tail.try_into().unwrap()));
        }
        Ok(dmis)
    }

    /// Resolve a filter set to TSIDs over the time range
    pub(crate) fn search_tsids(
        &mut self,
        tfss: &[TagFilters],
        tr: TimeRange,
        max_metrics: usize,
    ) -> Result<Vec<Tsid>> {
        if tfss.is_empty() {
            return Ok(Vec::new());
        }
        let account_id = tfss[0].account_id;
        let project_id = tfss[0].project_id;

        if !self.contains_time_range(tr, account_id, project_id)? {
            // This generation holds no data for the range.
            return Ok(Vec::new());
        }
        let metric_ids = self.search_metric_ids(tfss, tr, max_metrics)?;
        if metric_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut tsids = Vec::with_capacity(metric_ids.len());
        for metric_id in metric_ids {
            if let Some(tsid) = self.db.get_from_metric_id_cache(metric_id)? {
                tsids.push(tsid);
                continue;
            }
            match self.get_tsid_by_metric_id(metric_id, account_id, project_id)? {
                Some(tsid) => {
                    self.db.put_to_metric_id_cache(metric_id, &tsid);
                    tsids.push(tsid);
                }
                None => {
                    // Known id without its TSID row: an incomplete
                    // snapshot, not corruption. Count it and move on.
                    self.db
                        .missing_tsids_for_metric_id
                        .fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        // Sorting happens after the external generation is merged in.
        Ok(tsids)
    }

    /// Resolve a filter set to sorted metric ids with tombstones removed
    pub(crate) fn search_metric_ids(
        &mut self,
        tfss: &[TagFilters],
        tr: TimeRange,
        max_metrics: usize,
    ) -> Result<Vec<MetricId>> {
        let mut metric_ids: HashSet<MetricId> = HashSet::new();
        for tfs in tfss {
            if tfs.is_empty() {
                // An empty clause matches every series of the tenant.
                self.update_metric_ids_all(
                    &mut metric_ids,
                    tfs.account_id,
                    tfs.project_id,
                    max_metrics + 1,
                )?;
                if metric_ids.len() > max_metrics {
                    return Err(IndexError::TooManyMatches { max_metrics });
                }
                break;
            }
            self.update_metric_ids_for_tag_filters(&mut metric_ids, tfs, tr, max_metrics + 1)?;
            if metric_ids.len() > max_metrics {
                return Err(IndexError::TooManyMatches { max_metrics });
            }
        }
        if metric_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut sorted: Vec<MetricId> = metric_ids.into_iter().collect();
        sorted.sort_unstable();

        let dmis = self.db.deleted_metric_ids();
        if !dmis.is_empty() {
            sorted.retain(|id| !dmis.contains(id));
        }
        Ok(sorted)
    }

    /// Resolve one clause and add its matches to `metric_ids`
    fn update_metric_ids_for_tag_filters(
        &mut self,
        metric_ids: &mut HashSet<MetricId>,
        tfs: &TagFilters,
        tr: TimeRange,
        max_metrics: usize,
    ) -> Result<()> {
        // Sort filters by row prefix for seek locality on the store.
        let mut idxs: Vec<usize> = (0..tfs.filters().len()).collect();
        idxs.sort_by(|&a, &b| tfs.filters()[a].prefix().cmp(tfs.filters()[b].prefix()));

        let (min_idx, mut min_metric_ids) =
            self.get_tag_filter_with_min_metric_ids_count_optimized(tfs, &idxs, tr, max_metrics)?;

        // Intersect the pivot set with the remaining filters.
        let mut postponed: Vec<usize> = Vec::new();
        let mut successful_intersects = 0;
        for &i in &idxs {
            if Some(i) == min_idx {
                continue;
            }
            let tf = &tfs.filters()[i];
            match self.intersect_metric_ids_with_tag_filter(tf, &min_metric_ids) {
                Ok(ids) => {
                    min_metric_ids = ids;
                    successful_intersects += 1;
                }
                Err(IndexError::FallbackToNameMatch) => {
                    // Too expensive now; cheaper filters may shrink the
                    // candidate set first.
                    postponed.push(i);
                }
                Err(e) => return Err(e),
            }
        }
        if !postponed.is_empty() && successful_intersects == 0 {
            let tfs_postponed: Vec<&TagFilter> =
                postponed.iter().map(|&i| &tfs.filters()[i]).collect();
            return self.update_metric_ids_by_metric_name_match(
                metric_ids,
                &min_metric_ids,
                &tfs_postponed,
                tfs.account_id,
                tfs.project_id,
            );
        }
        for (pos, &i) in postponed.iter().enumerate() {
            let tf = &tfs.filters()[i];
            match self.intersect_metric_ids_with_tag_filter(tf, &min_metric_ids) {
                Ok(ids) => min_metric_ids = ids,
                Err(IndexError::FallbackToNameMatch) => {
                    let rest: Vec<&TagFilter> =
                        postponed[pos..].iter().map(|&j| &tfs.filters()[j]).collect();
                    return self.update_metric_ids_by_metric_name_match(
                        metric_ids,
                        &min_metric_ids,
                        &rest,
                        tfs.account_id,
                        tfs.project_id,
                    );
                }
                Err(e) => return Err(e),
            }
        }
        metric_ids.extend(min_metric_ids);
        Ok(())
    }

    /// Fetch each candidate's metric name and evaluate the postponed
    /// filters against the fully parsed name in memory
    fn update_metric_ids_by_metric_name_match(
        &mut self,
        metric_ids: &mut HashSet<MetricId>,
        src_metric_ids: &HashSet<MetricId>,
        tfs_postponed: &[&TagFilter],
        account_id: u32,
        project_id: u32,
    ) -> Result<()> {
        // Sorted candidates keep the namespace-3 seeks sequential.
        let mut sorted: Vec<MetricId> = src_metric_ids.iter().copied().collect();
        sorted.sort_unstable();

        for metric_id in sorted {
            let name = self
                .search_metric_name(metric_id, account_id, project_id)?
                .ok_or_else(|| {
                    IndexError::Corruption(format!(
                        "cannot find metric name for metric id {metric_id}"
                    ))
                })?;
            let mn = MetricName::unmarshal(&name)?;
            if match_tag_filters(&mn, tfs_postponed, &mut self.kb)? {
                metric_ids.insert(metric_id);
            }
        }
        Ok(())
    }

    /// Pick the pivot filter, falling back to the time-range index and
    /// then to a plain maximum-limit pass when every filter is too broad
    fn get_tag_filter_with_min_metric_ids_count_optimized(
        &mut self,
        tfs: &TagFilters,
        idxs: &[usize],
        tr: TimeRange,
        max_metrics: usize,
    ) -> Result<(Option<usize>, HashSet<MetricId>)> {
        let max_metrics_adjusted = self.adjust_max_metrics_adaptive(tr, max_metrics);
        match self.get_tag_filter_with_min_metric_ids_count_adaptive(tfs, idxs, max_metrics_adjusted)
        {
            Ok(r) => return Ok(r),
            Err(IndexError::TooManyMatches { .. }) => {}
            Err(e) => return Err(e),
        }

        // Every tag filter matches too many metrics. Try narrowing by
        // the time range; over-fetching is fine because the remaining
        // filters run over the result.
        let max_time_range_metrics = 20 * max_metrics;
        match self.get_metric_ids_for_time_range(
            tr,
            max_time_range_metrics + 1,
            tfs.account_id,
            tfs.project_id,
        ) {
            Ok(ids) => {
                if ids.len() <= max_time_range_metrics {
                    return Ok((None, ids));
                }
            }
            Err(IndexError::MissingDateIndex) => {}
            Err(e) => return Err(e),
        }

        // Last resort: retry without the adaptive ceiling.
        match self.get_tag_filter_with_min_metric_ids_count_adaptive(tfs, idxs, max_metrics) {
            Ok(r) => Ok(r),
            Err(IndexError::TooManyMatches { .. }) => {
                Err(IndexError::TooManyMatches { max_metrics })
            }
            Err(e) => Err(e),
        }
    }

    /// Lower `max_metrics` when the previous hour's id set is small and
    /// complete: matching against it is cheaper than any tag scan
    fn adjust_max_metrics_adaptive(&self, tr: TimeRange, max_metrics: usize) -> usize {
        if tr.max_date().saturating_sub(tr.min_date()) > MAX_DAYS_FOR_DATE_METRIC_IDS {
            // Extracting ids for a long range is itself expensive.
            return max_metrics;
        }
        let hm_prev = self.db.prev_hour_metric_ids.read().clone();
        if !hm_prev.is_full {
            return max_metrics;
        }
        let hour_metrics = hm_prev.metric_ids.len();
        if hour_metrics >= 256 && max_metrics > hour_metrics / 4 {
            return hour_metrics / 4;
        }
        max_metrics
    }

    /// Grow the allowed match count geometrically so one enormous filter
    /// cannot consume the whole budget before a cheap one is found
    fn get_tag_filter_with_min_metric_ids_count_adaptive(
        &mut self,
        tfs: &TagFilters,
        idxs: &[usize],
        max_metrics: usize,
    ) -> Result<(Option<usize>, HashSet<MetricId>)> {
        self.kb.clear();
        self.kb.push(USELESS_MULTI_TAG_FILTERS_KEY_PREFIX);
        self.kb.put_u64(max_metrics as u64);
        tfs.marshal(&mut self.kb);
        if self.db.useless_tag_filters_cache.get(&self.kb).is_some() {
            // Every filter in this set is known to match at least
            // max_metrics series.
            return Err(IndexError::TooManyMatches { max_metrics });
        }

        let mut max_allowed_metrics = 16.min(max_metrics);
        loop {
            match self.get_tag_filter_with_min_metric_ids_count(tfs, idxs, max_allowed_metrics) {
                Ok((min_idx, min_metric_ids)) => {
                    if min_metric_ids.len() < max_allowed_metrics {
                        return Ok((min_idx, min_metric_ids));
                    }
                }
                Err(IndexError::TooManyMatches { .. }) => {}
                Err(e) => return Err(e),
            }

            if max_allowed_metrics >= max_metrics {
                self.kb.clear();
                self.kb.push(USELESS_MULTI_TAG_FILTERS_KEY_PREFIX);
                self.kb.put_u64(max_metrics as u64);
                tfs.marshal(&mut self.kb);
                self.db
                    .useless_tag_filters_cache
                    .set(&self.kb, USELESS_TAG_FILTER_CACHE_VALUE);
                return Err(IndexError::TooManyMatches { max_metrics });
            }
            max_allowed_metrics = (max_allowed_metrics * 4).min(max_metrics);
        }
    }

    fn get_tag_filter_with_min_metric_ids_count(
        &mut self,
        tfs: &TagFilters,
        idxs: &[usize],
        max_metrics: usize,
    ) -> Result<(Option<usize>, HashSet<MetricId>)> {
        let initial_max_metrics = max_metrics;
        let mut max_metrics = max_metrics;
        let mut min_idx: Option<usize> = None;
        let mut min_metric_ids: Option<HashSet<MetricId>> = None;
        let mut useless_tag_filters = 0;

        for &i in idxs {
            let tf = &tfs.filters()[i];
            if tf.is_negative {
                // Negative filters only ever subtract.
                continue;
            }

            self.kb.clear();
            self.kb.push(USELESS_SINGLE_TAG_FILTER_KEY_PREFIX);
            self.kb.put_u64(max_metrics as u64);
            tf.marshal(&mut self.kb, tfs.account_id, tfs.project_id);
            if self.db.useless_tag_filters_cache.get(&self.kb).is_some() {
                useless_tag_filters += 1;
                continue;
            }

            let metric_ids = match self.get_metric_ids_for_tag_filter(tf, max_metrics) {
                Ok(ids) => ids,
                Err(IndexError::FallbackToNameMatch) => {
                    // Scanning this filter costs more than name matching
                    // ever would; remember that.
                    self.mark_useless_single(tf, tfs, max_metrics);
                    useless_tag_filters += 1;
                    continue;
                }
                Err(e) => return Err(e),
            };
            if metric_ids.len() >= max_metrics {
                self.mark_useless_single(tf, tfs, max_metrics);
                useless_tag_filters += 1;
                continue;
            }

            max_metrics = metric_ids.len();
            min_idx = Some(i);
            min_metric_ids = Some(metric_ids);
            if max_metrics <= 1 {
                // No other filter can beat a pivot of at most one id.
                break;
            }
        }

        if let (Some(i), Some(ids)) = (min_idx, min_metric_ids) {
            return Ok((Some(i), ids));
        }
        if useless_tag_filters == tfs.filters().len() {
            return Err(IndexError::TooManyMatches {
                max_metrics: initial_max_metrics,
            });
        }

        // Only negative filters remain; start from every id of the
        // tenant and let the intersection subtract.
        self.kb.clear();
        self.kb.push(USELESS_NEGATIVE_TAG_FILTER_KEY_PREFIX);
        self.kb.put_u64(max_metrics as u64);
        tfs.marshal(&mut self.kb);
        if self.db.useless_tag_filters_cache.get(&self.kb).is_some() {
            return Err(IndexError::TooManyMatches {
                max_metrics: initial_max_metrics,
            });
        }
        let mut metric_ids = HashSet::new();
        self.update_metric_ids_all(&mut metric_ids, tfs.account_id, tfs.project_id, max_metrics)?;
        if metric_ids.len() >= max_metrics {
            self.kb.clear();
            self.kb.push(USELESS_NEGATIVE_TAG_FILTER_KEY_PREFIX);
            self.kb.put_u64(max_metrics as u64);
            tfs.marshal(&mut self.kb);
            self.db
                .useless_tag_filters_cache
                .set(&self.kb, USELESS_TAG_FILTER_CACHE_VALUE);
        }
        Ok((None, metric_ids))
    }

    fn mark_useless_single(&mut self, tf: &TagFilter, tfs: &TagFilters, max_metrics: usize) {
        self.kb.clear();
        self.kb.push(USELESS_SINGLE_TAG_FILTER_KEY_PREFIX);
        self.kb.put_u64(max_metrics as u64);
        tf.marshal(&mut self.kb, tfs.account_id, tfs.project_id);
        self.db
            .useless_tag_filters_cache
            .set(&self.kb, USELESS_TAG_FILTER_CACHE_VALUE);
    }

    /// Collect ids matching one positive filter
    fn get_metric_ids_for_tag_filter(
        &mut self,
        tf: &TagFilter,
        max_metrics: usize,
    ) -> Result<HashSet<MetricId>> {
        debug_assert!(!tf.is_negative);
        let mut metric_ids = HashSet::with_capacity(max_metrics.min(1024));
        if !tf.or_suffixes().is_empty() {
            // Fast path: seek to the exact rows of each alternative.
            self.update_metric_ids_for_or_suffixes_no_filter(tf, max_metrics, &mut metric_ids)?;
            return Ok(metric_ids);
        }

        // Slow path: scan the tag-key subspace, matching each value.
        let max_loops = max_metrics.saturating_mul(self.db.scan_loops_per_metric());
        self.get_metric_ids_for_tag_filter_slow(tf, max_loops, &mut |metric_id| {
            metric_ids.insert(metric_id);
            metric_ids.len() < max_metrics
        })?;
        Ok(metric_ids)
    }

    /// Scan every row under the filter's tag key, calling `f` for each
    /// id whose value suffix matches. `f` returns false to stop early.
    fn get_metric_ids_for_tag_filter_slow(
        &mut self,
        tf: &TagFilter,
        max_loops: usize,
        f: &mut dyn FnMut(MetricId) -> bool,
    ) -> Result<()> {
        debug_assert!(tf.or_suffixes().is_empty());
        let prefix = tf.prefix().to_vec();
        let mut loops = 0usize;
        let mut prev_matching_suffix: Vec<u8> = Vec::new();
        let mut prev_match = false;
        self.mp.reset();
        self.ts.seek(&prefix);
        while self.ts.next() {
            let item = self.ts.current_item();
            if !item.starts_with(&prefix) {
                return Ok(());
            }
            let tail = &item[prefix.len()..];
            let Some(n) = tail.iter().position(|&b| b == TAG_SEPARATOR) else {
                return Err(IndexError::Corruption(
                    "invalid tag->metric ids row: cannot find the tag value separator".to_string(),
                ));
            };
            let suffix_end = prefix.len() + n + 1;
            self.mp.init_only_tail(&item[suffix_end..])?;
            let suffix = &item[prefix.len()..suffix_end];

            if prev_match && suffix == prev_matching_suffix.as_slice() {
                // The same tag value as the previous row; skip the
                // potentially slow suffix match.
                loops += self.mp.metric_ids_len();
                if loops > max_loops {
                    return Err(IndexError::FallbackToNameMatch);
                }
                self.mp.parse_metric_ids();
                for &metric_id in &self.mp.metric_ids {
                    if !f(metric_id) {
                        return Ok(());
                    }
                }
                continue;
            }

            if !tf.match_suffix(suffix)? {
                prev_match = false;
                // Skip every id of this non-matching value in one seek:
                // the byte before the id list is the separator, so
                // incrementing it jumps to the next value.
                self.kb.clear();
                self.kb.extend_from_slice(&item[..suffix_end]);
                if self.kb.last() != Some(&TAG_SEPARATOR) {
                    return Err(IndexError::Corruption(format!(
                        "the byte before the id list must be the tag separator {TAG_SEPARATOR}"
                    )));
                }
                *self.kb.last_mut().unwrap() += 1;
                self.ts.seek(&self.kb);
                continue;
            }
            prev_match = true;
            prev_matching_suffix.clear();
            prev_matching_suffix.extend_from_slice(suffix);
            loops += self.mp.metric_ids_len();
            if loops > max_loops {
                return Err(IndexError::FallbackToNameMatch);
            }
            self.mp.parse_metric_ids();
            for &metric_id in &self.mp.metric_ids {
                if !f(metric_id) {
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    fn update_metric_ids_for_or_suffixes_no_filter(
        &mut self,
        tf: &TagFilter,
        max_metrics: usize,
        metric_ids: &mut HashSet<MetricId>,
    ) -> Result<()> {
        debug_assert!(!tf.is_negative);
        for or_suffix in tf.or_suffixes() {
            let mut prefix = Vec::with_capacity(tf.prefix().len() + or_suffix.len() + 1);
            prefix.extend_from_slice(tf.prefix());
            prefix.extend_from_slice(or_suffix);
            prefix.push(TAG_SEPARATOR);
            self.update_metric_ids_for_or_suffix_no_filter(&prefix, max_metrics, metric_ids)?;
            if metric_ids.len() >= max_metrics {
                return Ok(());
            }
        }
        Ok(())
    }

    fn update_metric_ids_for_or_suffix_no_filter(
        &mut self,
        prefix: &[u8],
        max_metrics: usize,
        metric_ids: &mut HashSet<MetricId>,
    ) -> Result<()> {
        let max_loops = max_metrics.saturating_mul(self.db.scan_loops_per_metric());
        let mut loops = 0usize;
        self.mp.reset();
        self.ts.seek(prefix);
        while metric_ids.len() < max_metrics && self.ts.next() {
            let item = self.ts.current_item();
            if !item.starts_with(prefix) {
                return Ok(());
            }
            self.mp.init_only_tail(&item[prefix.len()..])?;
            loops += self.mp.metric_ids_len();
            if loops > max_loops {
                return Err(IndexError::FallbackToNameMatch);
            }
            self.mp.parse_metric_ids();
            for &metric_id in &self.mp.metric_ids {
                metric_ids.insert(metric_id);
            }
        }
        Ok(())
    }

    fn update_metric_ids_for_or_suffixes_with_filter(
        &mut self,
        tf: &TagFilter,
        metric_ids: &mut HashSet<MetricId>,
        filter: &HashSet<MetricId>,
    ) -> Result<()> {
        let mut sorted_filter: Vec<MetricId> = filter.iter().copied().collect();
        sorted_filter.sort_unstable();
        for or_suffix in tf.or_suffixes() {
            let mut prefix = Vec::with_capacity(tf.prefix().len() + or_suffix.len() + 1);
            prefix.extend_from_slice(tf.prefix());
            prefix.extend_from_slice(or_suffix);
            prefix.push(TAG_SEPARATOR);
            self.update_metric_ids_for_or_suffix_with_filter(
                &prefix,
                metric_ids,
                &sorted_filter,
                tf.is_negative,
            )?;
        }
        Ok(())
    }

    fn update_metric_ids_for_or_suffix_with_filter(
        &mut self,
        prefix: &[u8],
        metric_ids: &mut HashSet<MetricId>,
        sorted_filter: &[MetricId],
        is_negative: bool,
    ) -> Result<()> {
        if sorted_filter.is_empty() {
            return Ok(());
        }
        let first_filter_metric_id = sorted_filter[0];
        let last_filter_metric_id = *sorted_filter.last().unwrap();
        let max_loops = sorted_filter
            .len()
            .saturating_mul(self.db.scan_loops_per_metric());
        let mut loops = 0usize;
        self.mp.reset();
        self.ts.seek(prefix);
        while self.ts.next() {
            let item = self.ts.current_item();
            if !item.starts_with(prefix) {
                return Ok(());
            }
            self.mp.init_only_tail(&item[prefix.len()..])?;
            let (first_metric_id, last_metric_id) = self.mp.first_and_last_metric_ids();
            if last_metric_id < first_filter_metric_id {
                // Everything in this row is below the candidate set.
                continue;
            }
            if first_metric_id > last_filter_metric_id {
                // This row and everything after it is above the
                // candidate set.
                return Ok(());
            }
            loops += self.mp.metric_ids_len();
            if loops > max_loops {
                return Err(IndexError::FallbackToNameMatch);
            }
            self.mp.parse_metric_ids();
            let mut sf = sorted_filter;
            for &metric_id in &self.mp.metric_ids {
                if sf.is_empty() {
                    break;
                }
                if metric_id > sf[0] {
                    let n = sf.partition_point(|&x| x < metric_id);
                    sf = &sf[n..];
                    if sf.is_empty() {
                        break;
                    }
                }
                if metric_id < sf[0] {
                    continue;
                }
                if is_negative {
                    metric_ids.remove(&metric_id);
                } else {
                    metric_ids.insert(metric_id);
                }
                sf = &sf[1..];
            }
        }
        Ok(())
    }

    /// Intersect (or, for a negative filter, subtract) one filter with
    /// the candidate set
    fn intersect_metric_ids_with_tag_filter(
        &mut self,
        tf: &TagFilter,
        filter: &HashSet<MetricId>,
    ) -> Result<HashSet<MetricId>> {
        if filter.is_empty() {
            return Ok(HashSet::new());
        }
        let mut metric_ids = if tf.is_negative {
            // Negative filters remove matches from a copy of the
            // candidate set.
            filter.clone()
        } else {
            HashSet::with_capacity(filter.len())
        };
        if !tf.or_suffixes().is_empty() {
            self.update_metric_ids_for_or_suffixes_with_filter(tf, &mut metric_ids, filter)?;
            return Ok(metric_ids);
        }

        let max_loops = filter.len().saturating_mul(self.db.scan_loops_per_metric());
        let is_negative = tf.is_negative;
        self.get_metric_ids_for_tag_filter_slow(tf, max_loops, &mut |metric_id| {
            if is_negative {
                metric_ids.remove(&metric_id);
            } else if filter.contains(&metric_id) {
                metric_ids.insert(metric_id);
            }
            true
        })?;
        Ok(metric_ids)
    }

    /// Resolve the time range to metric ids via the hour snapshots or
    /// the per-day index
    fn get_metric_ids_for_time_range(
        &mut self,
        tr: TimeRange,
        max_metrics: usize,
        account_id: u32,
        project_id: u32,
    ) -> Result<HashSet<MetricId>> {
        if tr.is_zero() {
            return Err(IndexError::MissingDateIndex);
        }
        self.db
            .recent_hour_metric_ids_search_calls
            .fetch_add(1, Ordering::Relaxed);
        if let Some(metric_ids) =
            self.get_metric_ids_for_recent_hours(tr, max_metrics, account_id, project_id)?
        {
            self.db
                .recent_hour_metric_ids_search_hits
                .fetch_add(1, Ordering::Relaxed);
            return Ok(metric_ids);
        }

        self.db
            .date_metric_ids_search_calls
            .fetch_add(1, Ordering::Relaxed);
        let min_date = tr.min_date();
        let max_date = tr.max_date();
        if max_date.saturating_sub(min_date) > MAX_DAYS_FOR_DATE_METRIC_IDS {
            // Too many days to walk; callers degrade to a pivot scan.
            return Err(IndexError::MissingDateIndex);
        }
        let mut metric_ids = HashSet::with_capacity(max_metrics.min(1024));
        for date in min_date..=max_date {
            self.get_metric_ids_for_date(date, &mut metric_ids, max_metrics, account_id, project_id)?;
        }
        self.db
            .date_metric_ids_search_hits
            .fetch_add(1, Ordering::Relaxed);
        Ok(metric_ids)
    }

    fn get_metric_ids_for_recent_hours(
        &mut self,
        tr: TimeRange,
        max_metrics: usize,
        account_id: u32,
        project_id: u32,
    ) -> Result<Option<HashSet<MetricId>>> {
        let Some(mut metric_ids) = self.get_metric_ids_for_recent_hours_all(tr, max_metrics) else {
            return Ok(None);
        };

        // The hour snapshots span all tenants; keep only ids that have a
        // MetricID→TSID row under this tenant.
        let mut sorted: Vec<MetricId> = metric_ids.iter().copied().collect();
        sorted.sort_unstable();
        self.kb.clear();
        marshal_common_prefix(&mut self.kb, NS_METRIC_ID_TO_TSID, account_id, project_id);
        let prefix_len = self.kb.len();
        for metric_id in sorted {
            self.kb.truncate(prefix_len);
            self.kb.put_u64(metric_id);
            self.ts.seek(&self.kb);
            if !self.ts.next() {
                break;
            }
            if !self.ts.current_item().starts_with(&self.kb) {
                metric_ids.remove(&metric_id);
            }
        }
        Ok(Some(metric_ids))
    }

    /// The tenant-blind union of the hour snapshots, if the range fits
    /// the one-or-two-hour window and the snapshots are complete
    fn get_metric_ids_for_recent_hours_all(
        &self,
        tr: TimeRange,
        max_metrics: usize,
    ) -> Option<HashSet<MetricId>> {
        let min_hour = tr.min_hour();
        let max_hour = tr.max_hour();
        let hm_curr = self.db.curr_hour_metric_ids.read().clone();
        if max_hour == hm_curr.hour && min_hour == max_hour && hm_curr.is_full {
            if hm_curr.metric_ids.len() > max_metrics {
                return None;
            }
            return Some(hm_curr.metric_ids.clone());
        }
        let hm_prev = self.db.prev_hour_metric_ids.read().clone();
        if max_hour == hm_prev.hour && min_hour == max_hour && hm_prev.is_full {
            if hm_prev.metric_ids.len() > max_metrics {
                return None;
            }
            return Some(hm_prev.metric_ids.clone());
        }
        if max_hour == hm_curr.hour
            && min_hour == hm_prev.hour
            && hm_curr.is_full
            && hm_prev.is_full
        {
            if hm_curr.metric_ids.len() + hm_prev.metric_ids.len() > max_metrics {
                return None;
            }
            let mut metric_ids = hm_curr.metric_ids.clone();
            metric_ids.extend(hm_prev.metric_ids.iter().copied());
            return Some(metric_ids);
        }
        None
    }

    /// Collect ids recorded for one day in namespace 5
    fn get_metric_ids_for_date(
        &mut self,
        date: u64,
        metric_ids: &mut HashSet<MetricId>,
        max_metrics: usize,
        account_id: u32,
        project_id: u32,
    ) -> Result<()> {
        self.kb.clear();
        marshal_common_prefix(&mut self.kb, NS_DATE_TO_METRIC_ID, account_id, project_id);
        self.kb.put_u64(date);
        self.ts.seek(&self.kb);
        let mut items = 0usize;
        while metric_ids.len() < max_metrics && self.ts.next() {
            let item = self.ts.current_item();
            if !item.starts_with(&self.kb) {
                break;
            }
            let v = &item[self.kb.len()..];
            if v.len() != 8 {
                return Err(IndexError::Corruption(format!(
                    "cannot extract metric id from a date row; want 8 bytes; got {} bytes",
                    v.len()
                )));
            }
            metric_ids.insert(u64::from_be_bytes(v.try_into().unwrap()));
            items += 1;
        }
        if items == 0 {
            // No rows for this day; older data predates the per-day
            // index.
            return Err(IndexError::MissingDateIndex);
        }
        Ok(())
    }

    /// Check whether a (date, id) row already exists.
    ///
    /// A prefix hit whose item differs from the full key is reported as
    /// corruption. Whether this can occur legitimately under concurrent
    /// compaction is unknown; the check is deliberately preserved.
    pub(crate) fn has_date_metric_id(
        &mut self,
        date: u64,
        metric_id: MetricId,
        account_id: u32,
        project_id: u32,
    ) -> Result<bool> {
        self.kb.clear();
        marshal_common_prefix(&mut self.kb, NS_DATE_TO_METRIC_ID, account_id, project_id);
        self.kb.put_u64(date);
        self.kb.put_u64(metric_id);
        if !self.ts.first_item_with_prefix(&self.kb) {
            return Ok(false);
        }
        if self.ts.current_item() != self.kb.as_slice() {
            return Err(IndexError::Corruption(format!(
                "unexpected entry for (date={date}, metric_id={metric_id})"
            )));
        }
        Ok(true)
    }

    /// Check whether this generation has any per-day rows covering the
    /// start of the range
    fn contains_time_range(&mut self, tr: TimeRange, account_id: u32, project_id: u32) -> Result<bool> {
        self.kb.clear();
        marshal_common_prefix(&mut self.kb, NS_DATE_TO_METRIC_ID, account_id, project_id);
        self.kb.put_u64(tr.min_date());
        self.ts.seek(&self.kb);
        if !self.ts.next() {
            return Ok(false);
        }
        // Any later per-day row means the range start is covered.
        Ok(self.ts.current_item().first() == Some(&NS_DATE_TO_METRIC_ID))
    }

    /// Enumerate every id of the tenant, bounded by `max_metrics`
    fn update_metric_ids_all(
        &mut self,
        metric_ids: &mut HashSet<MetricId>,
        account_id: u32,
        project_id: u32,
        max_metrics: usize,
    ) -> Result<()> {
        self.kb.clear();
        marshal_common_prefix(&mut self.kb, NS_METRIC_ID_TO_TSID, account_id, project_id);
        let prefix = self.kb.clone();
        self.ts.seek(&prefix);
        while self.ts.next() {
            let item = self.ts.current_item();
            if !item.starts_with(&prefix) {
                return Ok(());
            }
            let tail = &item[prefix.len()..];
            if tail.len() < 8 {
                return Err(IndexError::Corruption(format!(
                    "cannot unmarshal metric id from a row of {} bytes; need at least 8 bytes",
                    tail.len()
                )));
            }
            metric_ids.insert(u64::from_be_bytes(tail[..8].try_into().unwrap()));
            if metric_ids.len() >= max_metrics {
                return Ok(());
            }
        }
        Ok(())
    }
}

/// Match a fully parsed metric name against a list of filters
pub(crate) fn match_tag_filters(
    mn: &MetricName,
    tfs: &[&TagFilter],
    kb: &mut Vec<u8>,
) -> Result<bool> {
    kb.clear();
    marshal_common_prefix(kb, NS_TAG_TO_METRIC_IDS, mn.account_id, mn.project_id);
    let base_len = kb.len();
    for &tf in tfs {
        if tf.key.is_empty() {
            // Match against the metric group.
            kb.truncate(base_len);
            marshal_tag_value(kb, b"");
            marshal_tag_value(kb, &mn.metric_group);
            if !match_tag_filter(kb, tf)? {
                return Ok(false);
            }
            continue;
        }

        let mut tag_matched = false;
        for tag in &mn.tags {
            if tag.key != tf.key {
                continue;
            }
            kb.truncate(base_len);
            tag.marshal(kb);
            if !match_tag_filter(kb, tf)? {
                return Ok(false);
            }
            tag_matched = true;
            break;
        }
        if !tag_matched && !tf.is_negative {
            // A positive filter needs its tag to exist.
            return Ok(false);
        }
    }
    Ok(true)
}

fn match_tag_filter(b: &[u8], tf: &TagFilter) -> Result<bool> {
    if !b.starts_with(tf.prefix()) {
        return Ok(tf.is_negative);
    }
    let ok = tf.match_suffix(&b[tf.prefix().len()..])?;
    if !ok {
        return Ok(tf.is_negative);
    }
    Ok(!tf.is_negative)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::TagFilters;

    fn name() -> MetricName {
        let mut mn = MetricName::new(1, 2, "cpu")
            .with_tag("host", "a")
            .with_tag("dc", "x");
        mn.sort_tags();
        mn
    }

    fn filters_of(specs: &[(&str, &str, bool, bool)]) -> TagFilters {
        let mut tfs = TagFilters::new(1, 2);
        for &(key, value, is_negative, is_regexp) in specs {
            tfs.add(key, value, is_negative, is_regexp).unwrap();
        }
        tfs
    }

    #[test]
    fn test_match_tag_filters_positive() {
        let mn = name();
        let tfs = filters_of(&[("host", "a", false, false)]);
        let refs: Vec<&TagFilter> = tfs.filters().iter().collect();
        let mut kb = Vec::new();
        assert!(match_tag_filters(&mn, &refs, &mut kb).unwrap());

        let tfs = filters_of(&[("host", "b", false, false)]);
        let refs: Vec<&TagFilter> = tfs.filters().iter().collect();
        assert!(!match_tag_filters(&mn, &refs, &mut kb).unwrap());
    }

    #[test]
    fn test_match_tag_filters_negative() {
        let mn = name();
        let tfs = filters_of(&[("host", "b", true, false)]);
        let refs: Vec<&TagFilter> = tfs.filters().iter().collect();
        let mut kb = Vec::new();
        assert!(match_tag_filters(&mn, &refs, &mut kb).unwrap());

        let tfs = filters_of(&[("host", "a", true, false)]);
        let refs: Vec<&TagFilter> = tfs.filters().iter().collect();
        assert!(!match_tag_filters(&mn, &refs, &mut kb).unwrap());
    }

    #[test]
    fn test_match_tag_filters_missing_tag() {
        let mn = name();
        // A positive filter over an absent tag never matches.
        let tfs = filters_of(&[("rack", "r1", false, false)]);
        let refs: Vec<&TagFilter> = tfs.filters().iter().collect();
        let mut kb = Vec::new();
        assert!(!match_tag_filters(&mn, &refs, &mut kb).unwrap());

        // A negative filter over an absent tag matches.
        let tfs = filters_of(&[("rack", "r1", true, false)]);
        let refs: Vec<&TagFilter> = tfs.filters().iter().collect();
        assert!(match_tag_filters(&mn, &refs, &mut kb).unwrap());
    }

    #[test]
    fn test_match_tag_filters_metric_group() {
        let mn = name();
        let tfs = filters_of(&[("", "cpu", false, false)]);
        let refs: Vec<&TagFilter> = tfs.filters().iter().collect();
        let mut kb = Vec::new();
        assert!(match_tag_filters(&mn, &refs, &mut kb).unwrap());

        let tfs = filters_of(&[("", "mem", false, false)]);
        let refs: Vec<&TagFilter> = tfs.filters().iter().collect();
        assert!(!match_tag_filters(&mn, &refs, &mut kb).unwrap());
    }

    #[test]
    fn test_match_tag_filters_regexp() {
        let mn = name();
        let tfs = filters_of(&[("host", "a|b", false, true)]);
        let refs: Vec<&TagFilter> = tfs.filters().iter().collect();
        let mut kb = Vec::new();
        assert!(match_tag_filters(&mn, &refs, &mut kb).unwrap());

        let tfs = filters_of(&[("host", "[xy]", false, true)]);
        let refs: Vec<&TagFilter> = tfs.filters().iter().collect();
        assert!(!match_tag_filters(&mn, &refs, &mut kb).unwrap());
    }
}
