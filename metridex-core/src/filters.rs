//! Tag filter expressions
//!
//! A query clause is a set of tag filters for one tenant. Each filter
//! compares one tag (or the metric group, addressed by the empty key)
//! against a value, negated or not, literally or as a regular
//! expression. Filters whose value set is enumerable carry
//! `or_suffixes`, which lets the planner seek straight to the matching
//! rows instead of scanning the whole tag-key subspace.

use crate::cache::tag_filters_key_gen;
use crate::keys::marshal_common_prefix;
use crate::keys::NS_TAG_TO_METRIC_IDS;
use crate::metric_name::{marshal_tag_value, unmarshal_tag_value};
use crate::{IndexError, Result};
use bytes::BufMut;
use regex::bytes::Regex;
use std::fmt;

/// Bytes with a regex meaning; alternations containing any of these are
/// not expanded into or-suffixes
const REGEX_META_CHARS: &[u8] = b".+*?()[]{}^$|\\";

/// One tag comparison inside a query clause
pub struct TagFilter {
    /// Tag key; empty addresses the metric group
    pub key: Vec<u8>,
    /// Literal value or regular expression source
    pub value: Vec<u8>,
    /// True for `!=` and `!~`
    pub is_negative: bool,
    /// True for `=~` and `!~`
    pub is_regexp: bool,

    /// Common prefix of every row this filter can match:
    /// ns byte ‖ tenant ‖ escaped key ‖ SEP
    prefix: Vec<u8>,
    /// Escaped alternative values without the trailing SEP; empty when
    /// the value set is not enumerable
    or_suffixes: Vec<Vec<u8>>,
    /// Compiled anchored expression for the non-enumerable case
    re: Option<Regex>,
}

impl TagFilter {
    fn new(
        account_id: u32,
        project_id: u32,
        key: Vec<u8>,
        value: Vec<u8>,
        is_negative: bool,
        is_regexp: bool,
    ) -> Result<Self> {
        let mut prefix = Vec::with_capacity(16 + key.len());
        marshal_common_prefix(&mut prefix, NS_TAG_TO_METRIC_IDS, account_id, project_id);
        marshal_tag_value(&mut prefix, &key);

        let mut or_suffixes = Vec::new();
        let mut re = None;
        if !is_regexp {
            or_suffixes.push(escape_no_separator(&value));
        } else if let Some(alternatives) = extract_or_values(&value) {
            or_suffixes = alternatives
                .iter()
                .map(|alt| escape_no_separator(alt))
                .collect();
            or_suffixes.sort();
            or_suffixes.dedup();
        } else {
            let pattern = std::str::from_utf8(&value).map_err(|_| {
                IndexError::InvalidFilter(format!(
                    "regexp for tag {:?} is not valid utf-8",
                    String::from_utf8_lossy(&key)
                ))
            })?;
            re = Some(
                Regex::new(&format!("^(?:{pattern})$"))
                    .map_err(|e| IndexError::InvalidFilter(e.to_string()))?,
            );
        }

        Ok(Self {
            key,
            value,
            is_negative,
            is_regexp,
            prefix,
            or_suffixes,
            re,
        })
    }

    /// Row prefix covering the whole tag-key subspace of this filter
    pub fn prefix(&self) -> &[u8] {
        &self.prefix
    }

    /// Enumerable alternatives; empty means the slow scan path applies
    pub fn or_suffixes(&self) -> &[Vec<u8>] {
        &self.or_suffixes
    }

    /// Match the escaped value suffix of a row (including its trailing
    /// SEP) against this filter, ignoring negation.
    pub fn match_suffix(&self, suffix: &[u8]) -> Result<bool> {
        let (value, tail) = unmarshal_tag_value(suffix)?;
        if !tail.is_empty() {
            return Err(IndexError::Corruption(format!(
                "unexpected tail of {} bytes after the tag value suffix",
                tail.len()
            )));
        }
        if !self.is_regexp {
            return Ok(value == self.value);
        }
        match &self.re {
            Some(re) => Ok(re.is_match(&value)),
            None => {
                let escaped = escape_no_separator(&value);
                Ok(self.or_suffixes.iter().any(|s| *s == escaped))
            }
        }
    }

    fn op_byte(&self) -> u8 {
        match (self.is_negative, self.is_regexp) {
            (false, false) => 0,
            (true, false) => 1,
            (false, true) => 2,
            (true, true) => 3,
        }
    }

    /// Cache-key form including the tenant
    pub(crate) fn marshal(&self, dst: &mut Vec<u8>, account_id: u32, project_id: u32) {
        dst.put_u32(account_id);
        dst.put_u32(project_id);
        self.marshal_no_tenant(dst);
    }

    /// Cache-key form without the tenant
    pub(crate) fn marshal_no_tenant(&self, dst: &mut Vec<u8>) {
        dst.push(self.op_byte());
        marshal_tag_value(dst, &self.key);
        marshal_tag_value(dst, &self.value);
    }
}

impl fmt::Display for TagFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match (self.is_negative, self.is_regexp) {
            (false, false) => "=",
            (true, false) => "!=",
            (false, true) => "=~",
            (true, true) => "!~",
        };
        write!(
            f,
            "{}{}{:?}",
            String::from_utf8_lossy(&self.key),
            op,
            String::from_utf8_lossy(&self.value)
        )
    }
}

/// A set of tag filters for one tenant; one disjunction clause of a query
pub struct TagFilters {
    pub account_id: u32,
    pub project_id: u32,
    tfs: Vec<TagFilter>,
}

impl TagFilters {
    /// Create an empty filter set for the tenant
    pub fn new(account_id: u32, project_id: u32) -> Self {
        Self {
            account_id,
            project_id,
            tfs: Vec::new(),
        }
    }

    /// Add one filter. An empty `key` addresses the metric group.
    pub fn add(
        &mut self,
        key: impl Into<Vec<u8>>,
        value: impl Into<Vec<u8>>,
        is_negative: bool,
        is_regexp: bool,
    ) -> Result<()> {
        let tf = TagFilter::new(
            self.account_id,
            self.project_id,
            key.into(),
            value.into(),
            is_negative,
            is_regexp,
        )?;
        self.tfs.push(tf);
        Ok(())
    }

    /// The filters in insertion order
    pub fn filters(&self) -> &[TagFilter] {
        &self.tfs
    }

    /// Check whether the set holds no filters
    pub fn is_empty(&self) -> bool {
        self.tfs.is_empty()
    }

    /// Cache-key form of the whole set
    pub(crate) fn marshal(&self, dst: &mut Vec<u8>) {
        dst.put_u32(self.account_id);
        dst.put_u32(self.project_id);
        for tf in &self.tfs {
            tf.marshal_no_tenant(dst);
        }
    }
}

impl fmt::Display for TagFilters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, tf) in self.tfs.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{tf}")?;
        }
        write!(f, "}}")
    }
}

/// Build the tag-cache key for a query over `tfss`.
///
/// Versioned keys embed the current cache generation, so entries become
/// unreachable whenever the generation moves. The read-only external DB
/// uses unversioned keys because its data cannot change.
pub(crate) fn marshal_tag_filters_key(dst: &mut Vec<u8>, tfss: &[TagFilters], versioned: bool) {
    let prefix = if versioned {
        tag_filters_key_gen()
    } else {
        u64::MAX
    };
    dst.put_u64(prefix);
    if tfss.is_empty() {
        return;
    }
    dst.put_u32(tfss[0].account_id);
    dst.put_u32(tfss[0].project_id);
    for tfs in tfss {
        dst.push(0); // separator between filter groups
        for tf in &tfs.tfs {
            tf.marshal_no_tenant(dst);
        }
    }
}

/// Escape a tag value without the trailing separator
fn escape_no_separator(value: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(value.len() + 1);
    marshal_tag_value(&mut buf, value);
    buf.pop();
    buf
}

/// Expand a regexp into its literal alternatives, if it is a plain
/// top-level alternation like `a|b|c`. Returns None for anything that
/// needs the real regex engine.
fn extract_or_values(expr: &[u8]) -> Option<Vec<Vec<u8>>> {
    let s = std::str::from_utf8(expr).ok()?;
    let mut values = Vec::new();
    for alt in s.split('|') {
        if alt.bytes().any(|b| REGEX_META_CHARS.contains(&b)) {
            return None;
        }
        values.push(alt.as_bytes().to_vec());
    }
    Some(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric_name::TAG_SEPARATOR;

    fn filter(key: &str, value: &str, is_negative: bool, is_regexp: bool) -> TagFilter {
        TagFilter::new(
            1,
            2,
            key.as_bytes().to_vec(),
            value.as_bytes().to_vec(),
            is_negative,
            is_regexp,
        )
        .unwrap()
    }

    fn suffix_of(value: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        marshal_tag_value(&mut buf, value);
        buf
    }

    #[test]
    fn test_prefix_layout() {
        let tf = filter("host", "a", false, false);
        let mut want = Vec::new();
        marshal_common_prefix(&mut want, NS_TAG_TO_METRIC_IDS, 1, 2);
        marshal_tag_value(&mut want, b"host");
        assert_eq!(tf.prefix(), want.as_slice());
        assert_eq!(*tf.prefix().last().unwrap(), TAG_SEPARATOR);
    }

    #[test]
    fn test_plain_filter_has_single_or_suffix() {
        let tf = filter("host", "a", false, false);
        assert_eq!(tf.or_suffixes(), &[b"a".to_vec()]);
    }

    #[test]
    fn test_alternation_expands_to_or_suffixes() {
        let tf = filter("host", "b|a|c|a", false, true);
        assert_eq!(
            tf.or_suffixes(),
            &[b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]
        );
    }

    #[test]
    fn test_real_regexp_uses_slow_path() {
        let tf = filter("host", "h[0-4].*", false, true);
        assert!(tf.or_suffixes().is_empty());
        assert!(tf.match_suffix(&suffix_of(b"h3abc")).unwrap());
        assert!(!tf.match_suffix(&suffix_of(b"h7abc")).unwrap());
    }

    #[test]
    fn test_regexp_is_anchored() {
        let tf = filter("host", "h1", false, true);
        // `h1` as a regexp must not match `xh1y`.
        assert!(tf.match_suffix(&suffix_of(b"h1")).unwrap());
        assert!(!tf.match_suffix(&suffix_of(b"xh1y")).unwrap());
    }

    #[test]
    fn test_match_suffix_literal() {
        let tf = filter("host", "a", true, false);
        // Negation is applied by the caller, never here.
        assert!(tf.match_suffix(&suffix_of(b"a")).unwrap());
        assert!(!tf.match_suffix(&suffix_of(b"b")).unwrap());
    }

    #[test]
    fn test_invalid_regexp_is_rejected() {
        let mut tfs = TagFilters::new(1, 2);
        assert!(matches!(
            tfs.add("host", "h[", false, true),
            Err(IndexError::InvalidFilter(_))
        ));
    }

    #[test]
    fn test_versioned_key_changes_with_generation() {
        let mut tfs = TagFilters::new(1, 2);
        tfs.add("host", "a", false, false).unwrap();
        let tfss = vec![tfs];

        let mut k1 = Vec::new();
        marshal_tag_filters_key(&mut k1, &tfss, true);
        crate::cache::invalidate_tag_cache();
        let mut k2 = Vec::new();
        marshal_tag_filters_key(&mut k2, &tfss, true);
        assert_ne!(k1, k2);

        let mut u1 = Vec::new();
        marshal_tag_filters_key(&mut u1, &tfss, false);
        crate::cache::invalidate_tag_cache();
        let mut u2 = Vec::new();
        marshal_tag_filters_key(&mut u2, &tfss, false);
        assert_eq!(u1, u2);
    }

    #[test]
    fn test_or_value_extraction_rules() {
        assert_eq!(
            extract_or_values(b"a|b"),
            Some(vec![b"a".to_vec(), b"b".to_vec()])
        );
        assert_eq!(extract_or_values(b""), Some(vec![Vec::new()]));
        assert!(extract_or_values(b"a.*|b").is_none());
        assert!(extract_or_values(b"a\\|b").is_none());
        assert!(extract_or_values(b"(a|b)").is_none());
    }
}
