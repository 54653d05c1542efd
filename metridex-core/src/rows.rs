//! Tag→MetricIDs row parsing and merge-time coalescing
//!
//! A tag row is `ns byte ‖ tenant ‖ escaped tag key ‖ SEP ‖ escaped tag
//! value ‖ SEP ‖ id…id`, where the id list is a multiple of 8 bytes.
//! Rows sharing (tenant, tag) accumulate one id each at write time and
//! are coalesced into a single row by the merge callback.

use crate::keys::{marshal_common_prefix, unmarshal_common_prefix, NS_TAG_TO_METRIC_IDS};
use crate::metric_name::{unmarshal_tag_value, Tag};
use crate::{IndexError, MetricId, Result};
use bytes::BufMut;
use std::collections::HashSet;

/// Reusable parser for one tag→metric ids row
#[derive(Debug, Default)]
pub struct TagRowParser {
    /// Parsed after `init`
    pub account_id: u32,
    /// Parsed after `init`
    pub project_id: u32,
    /// Parsed after `init`
    pub tag: Tag,
    /// Parsed after `parse_metric_ids`
    pub metric_ids: Vec<MetricId>,
    /// Raw id-list bytes of the current row
    tail: Vec<u8>,
}

impl TagRowParser {
    /// Clear all parsed state
    pub fn reset(&mut self) {
        self.account_id = 0;
        self.project_id = 0;
        self.tag.key.clear();
        self.tag.value.clear();
        self.metric_ids.clear();
        self.tail.clear();
    }

    /// Parse a full tag row: tenant, tag and the id-list tail
    pub fn init(&mut self, row: &[u8]) -> Result<()> {
        let (ns, account_id, project_id, tail) = unmarshal_common_prefix(row)
            .map_err(|e| IndexError::Corruption(format!("invalid tag->metric ids row: {e}")))?;
        if ns != NS_TAG_TO_METRIC_IDS {
            return Err(IndexError::Corruption(format!(
                "invalid prefix for tag->metric ids row; got {ns}; want {NS_TAG_TO_METRIC_IDS}"
            )));
        }
        self.account_id = account_id;
        self.project_id = project_id;
        let (key, tail) = unmarshal_tag_value(tail)
            .map_err(|e| IndexError::Corruption(format!("cannot unmarshal tag key: {e}")))?;
        let (value, tail) = unmarshal_tag_value(tail)
            .map_err(|e| IndexError::Corruption(format!("cannot unmarshal tag value: {e}")))?;
        self.tag.key = key;
        self.tag.value = value;
        self.init_only_tail(tail)
    }

    /// Initialize only the id-list tail; the caller already consumed the
    /// key part of the row
    pub fn init_only_tail(&mut self, tail: &[u8]) -> Result<()> {
        if tail.is_empty() {
            return Err(IndexError::Corruption(
                "missing metric id in tag->metric ids row".to_string(),
            ));
        }
        if tail.len() % 8 != 0 {
            return Err(IndexError::Corruption(format!(
                "invalid tail length in tag->metric ids row; got {} bytes; must be a multiple of 8",
                tail.len()
            )));
        }
        self.metric_ids.clear();
        self.tail.clear();
        self.tail.extend_from_slice(tail);
        Ok(())
    }

    /// Number of ids in the current row
    pub fn metric_ids_len(&self) -> usize {
        self.tail.len() / 8
    }

    /// First and last ids of the row without parsing the whole list
    pub fn first_and_last_metric_ids(&self) -> (MetricId, MetricId) {
        let first = u64::from_be_bytes(self.tail[..8].try_into().unwrap());
        let last = u64::from_be_bytes(self.tail[self.tail.len() - 8..].try_into().unwrap());
        (first, last)
    }

    /// Decode the id list into `metric_ids`
    pub fn parse_metric_ids(&mut self) {
        self.metric_ids.clear();
        for chunk in self.tail.chunks_exact(8) {
            self.metric_ids
                .push(u64::from_be_bytes(chunk.try_into().unwrap()));
        }
    }

    /// True if every id in the row is tombstoned
    pub fn is_deleted_tag(&mut self, deleted: &HashSet<MetricId>) -> bool {
        if deleted.is_empty() {
            return false;
        }
        self.parse_metric_ids();
        self.metric_ids.iter().all(|id| deleted.contains(id))
    }

    /// True if both parsers hold the same (tenant, tag)
    pub fn equal_prefix(&self, other: &TagRowParser) -> bool {
        self.account_id == other.account_id
            && self.project_id == other.project_id
            && self.tag == other.tag
    }
}

/// Merge callback: coalesce adjacent tag rows sharing (tenant, tag).
///
/// For every maximal window of rows with equal (tenant, tag) a single
/// row carrying the sorted, deduplicated union of the window's ids is
/// emitted. The first and last rows of the run additionally pass
/// through verbatim so that ordering relative to neighbouring blocks is
/// preserved. Rows from other namespaces pass through untouched, and a
/// row whose ids are all tombstoned is still emitted (cleanup of
/// deleted ids is not this function's job).
///
/// Panics on unparseable tag rows: continuing past corrupt index rows
/// would poison every cache built on top of them.
pub fn merge_tag_rows(items: Vec<Vec<u8>>) -> Vec<Vec<u8>> {
    if items.len() < 2 {
        return items;
    }
    // Quick checks based on the fact that items are sorted: no tag rows
    // can be present if the whole run lies before or after namespace 1.
    if items
        .first()
        .map_or(false, |it| !it.is_empty() && it[0] > NS_TAG_TO_METRIC_IDS)
    {
        return items;
    }
    if items
        .last()
        .map_or(false, |it| !it.is_empty() && it[0] < NS_TAG_TO_METRIC_IDS)
    {
        return items;
    }

    let n = items.len();
    let mut dst: Vec<Vec<u8>> = Vec::with_capacity(n);
    let mut pending: Vec<MetricId> = Vec::new();
    let mut mp = TagRowParser::default();
    let mut mp_prev = TagRowParser::default();

    for (i, item) in items.into_iter().enumerate() {
        let is_tag_row = item.first() == Some(&NS_TAG_TO_METRIC_IDS);
        if !is_tag_row {
            if !pending.is_empty() {
                flush_pending(&mut dst, &mut pending, &mp_prev);
            }
            dst.push(item);
            continue;
        }

        if let Err(err) = mp.init(&item) {
            panic!("FATAL: cannot parse tag->metric ids row during merge: {err}");
        }
        if !pending.is_empty() && !mp.equal_prefix(&mp_prev) {
            flush_pending(&mut dst, &mut pending, &mp_prev);
        }
        mp.parse_metric_ids();
        pending.extend_from_slice(&mp.metric_ids);
        std::mem::swap(&mut mp, &mut mp_prev);

        if i == 0 {
            dst.push(item);
        } else if i == n - 1 {
            // The union row would duplicate the verbatim boundary row
            // whenever the window holds nothing else; skip it then.
            flush_pending_skipping(&mut dst, &mut pending, &mp_prev, Some(&item));
            dst.push(item);
        }
    }
    if !pending.is_empty() {
        flush_pending(&mut dst, &mut pending, &mp_prev);
    }
    dst
}

fn flush_pending(dst: &mut Vec<Vec<u8>>, pending: &mut Vec<MetricId>, mp: &TagRowParser) {
    flush_pending_skipping(dst, pending, mp, None);
}

fn flush_pending_skipping(
    dst: &mut Vec<Vec<u8>>,
    pending: &mut Vec<MetricId>,
    mp: &TagRowParser,
    skip_if_equal: Option<&[u8]>,
) {
    pending.sort_unstable();
    pending.dedup();

    let mut row = Vec::with_capacity(32 + pending.len() * 8);
    marshal_common_prefix(&mut row, NS_TAG_TO_METRIC_IDS, mp.account_id, mp.project_id);
    mp.tag.marshal(&mut row);
    for &metric_id in pending.iter() {
        row.put_u64(metric_id);
    }
    pending.clear();
    if skip_if_equal == Some(row.as_slice()) {
        return;
    }
    if dst.last() != Some(&row) {
        dst.push(row);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag_row(account_id: u32, project_id: u32, key: &[u8], value: &[u8], ids: &[u64]) -> Vec<u8> {
        let mut row = Vec::new();
        marshal_common_prefix(&mut row, NS_TAG_TO_METRIC_IDS, account_id, project_id);
        let tag = Tag {
            key: key.to_vec(),
            value: value.to_vec(),
        };
        tag.marshal(&mut row);
        for &id in ids {
            row.put_u64(id);
        }
        row
    }

    #[test]
    fn test_parser_roundtrip() {
        let row = tag_row(1, 2, b"host", b"a", &[5, 9]);
        let mut mp = TagRowParser::default();
        mp.init(&row).unwrap();
        assert_eq!(mp.account_id, 1);
        assert_eq!(mp.project_id, 2);
        assert_eq!(mp.tag.key, b"host");
        assert_eq!(mp.tag.value, b"a");
        assert_eq!(mp.metric_ids_len(), 2);
        assert_eq!(mp.first_and_last_metric_ids(), (5, 9));
        mp.parse_metric_ids();
        assert_eq!(mp.metric_ids, vec![5, 9]);
    }

    #[test]
    fn test_parser_rejects_ragged_tail() {
        let mut row = tag_row(1, 2, b"k", b"v", &[5]);
        row.push(0);
        let mut mp = TagRowParser::default();
        assert!(mp.init(&row).is_err());
    }

    #[test]
    fn test_parser_rejects_empty_tail() {
        let row = tag_row(1, 2, b"k", b"v", &[]);
        let mut mp = TagRowParser::default();
        assert!(mp.init(&row).is_err());
    }

    #[test]
    fn test_is_deleted_tag() {
        let row = tag_row(1, 2, b"k", b"v", &[5, 9]);
        let mut mp = TagRowParser::default();
        mp.init(&row).unwrap();

        let mut deleted = HashSet::new();
        assert!(!mp.is_deleted_tag(&deleted));
        deleted.insert(5);
        assert!(!mp.is_deleted_tag(&deleted));
        deleted.insert(9);
        assert!(mp.is_deleted_tag(&deleted));
    }

    #[test]
    fn test_merge_coalesces_window_and_keeps_boundaries() {
        let items = vec![
            tag_row(1, 2, b"k", b"v", &[5]),
            tag_row(1, 2, b"k", b"v", &[3, 9]),
            tag_row(1, 2, b"k", b"v", &[3, 7]),
        ];
        let out = merge_tag_rows(items.clone());
        assert_eq!(out.len(), 3);
        assert_eq!(out[0], items[0]);
        assert_eq!(out[2], items[2]);

        let mut mp = TagRowParser::default();
        mp.init(&out[1]).unwrap();
        mp.parse_metric_ids();
        assert_eq!(mp.metric_ids, vec![3, 5, 7, 9]);
        assert_eq!((mp.account_id, mp.project_id), (1, 2));
        assert_eq!(mp.tag.key, b"k");
        assert_eq!(mp.tag.value, b"v");
    }

    #[test]
    fn test_merge_splits_windows_on_tag_change() {
        let items = vec![
            tag_row(1, 2, b"a", b"v", &[1]),
            tag_row(1, 2, b"a", b"v", &[2]),
            tag_row(1, 2, b"b", b"v", &[3]),
            tag_row(1, 2, b"b", b"v", &[4]),
            tag_row(1, 2, b"b", b"v", &[5]),
        ];
        let out = merge_tag_rows(items);

        let mut parsed: Vec<(Vec<u8>, Vec<u64>)> = Vec::new();
        for row in &out {
            let mut mp = TagRowParser::default();
            mp.init(row).unwrap();
            mp.parse_metric_ids();
            parsed.push((mp.tag.key.clone(), mp.metric_ids.clone()));
        }
        // The "a" window is coalesced into [1, 2]; the "b" window into
        // [3, 4, 5]; run boundaries stay verbatim.
        assert!(parsed.contains(&(b"a".to_vec(), vec![1, 2])));
        assert!(parsed.contains(&(b"b".to_vec(), vec![3, 4, 5])));
        assert_eq!(parsed[0], (b"a".to_vec(), vec![1]));
        assert_eq!(parsed.last().unwrap(), &(b"b".to_vec(), vec![5]));
    }

    #[test]
    fn test_merge_passes_other_namespaces_verbatim() {
        let foreign = vec![crate::keys::NS_METRIC_ID_TO_TSID, 0, 0, 0, 1];
        let items = vec![
            tag_row(1, 2, b"k", b"v", &[1]),
            tag_row(1, 2, b"k", b"v", &[2]),
            foreign.clone(),
        ];
        let out = merge_tag_rows(items);
        assert!(out.contains(&foreign));
    }

    #[test]
    fn test_merge_keeps_fully_tombstoned_rows() {
        // Tombstone handling happens at query time; the merge never
        // consults the deletion set.
        let items = vec![
            tag_row(1, 2, b"k", b"v", &[1]),
            tag_row(1, 2, b"k", b"v", &[2]),
            tag_row(1, 2, b"k", b"v", &[3]),
        ];
        let out = merge_tag_rows(items);
        let mut mp = TagRowParser::default();
        mp.init(&out[1]).unwrap();
        mp.parse_metric_ids();
        assert_eq!(mp.metric_ids, vec![1, 2, 3]);
    }

    #[test]
    fn test_merge_short_runs_untouched() {
        let items = vec![tag_row(1, 2, b"k", b"v", &[1])];
        assert_eq!(merge_tag_rows(items.clone()), items);
    }
}
