//! Metric names and tag escaping
//!
//! A `MetricName` is the parsed identity of a series: tenant, metric
//! group and a sorted label set. Its marshaled form is embedded in the
//! MetricName→TSID and MetricID→MetricName index rows.
//!
//! Tag keys and values are escaped so that the separator byte can never
//! occur inside them. This keeps "seek past all rows for this value" as
//! cheap as incrementing the trailing separator.

use crate::{IndexError, Result};
use bytes::{Buf, BufMut};
use std::fmt;

/// Byte terminating every escaped tag key and value
pub const TAG_SEPARATOR: u8 = 1;

/// Escape prefix byte inside tag keys and values
const ESCAPE_CHAR: u8 = 0;

// Next-prefix navigation increments a trailing separator, which must
// therefore never be 0xff.
const _: () = assert!(TAG_SEPARATOR < 0xff);

/// One label of a series
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Tag {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl Tag {
    /// Append the escaped key and value, each with a trailing separator
    pub fn marshal(&self, dst: &mut Vec<u8>) {
        marshal_tag_value(dst, &self.key);
        marshal_tag_value(dst, &self.value);
    }
}

/// Parsed identity of one series
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricName {
    pub account_id: u32,
    pub project_id: u32,
    /// The bare metric name, e.g. `cpu_usage`
    pub metric_group: Vec<u8>,
    /// Labels, kept sorted by key for a canonical marshaled form
    pub tags: Vec<Tag>,
}

impl MetricName {
    /// Create a metric name for the given tenant
    pub fn new(account_id: u32, project_id: u32, metric_group: impl Into<Vec<u8>>) -> Self {
        Self {
            account_id,
            project_id,
            metric_group: metric_group.into(),
            tags: Vec::new(),
        }
    }

    /// Add a tag, builder style
    pub fn with_tag(mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        self.add_tag(key, value);
        self
    }

    /// Add a tag
    pub fn add_tag(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.tags.push(Tag {
            key: key.into(),
            value: value.into(),
        });
    }

    /// Sort tags by key, then value. Must be called before `marshal`
    /// so that equal label sets produce equal byte forms.
    pub fn sort_tags(&mut self) {
        self.tags.sort();
    }

    /// Append the canonical byte form to `dst`
    pub fn marshal(&self, dst: &mut Vec<u8>) {
        dst.put_u32(self.account_id);
        dst.put_u32(self.project_id);
        marshal_tag_value(dst, &self.metric_group);
        for tag in &self.tags {
            tag.marshal(dst);
        }
    }

    /// Convenience wrapper: sort tags and return the marshaled form
    pub fn marshaled(&mut self) -> Vec<u8> {
        self.sort_tags();
        let mut dst = Vec::with_capacity(64);
        self.marshal(&mut dst);
        dst
    }

    /// Decode a metric name; `src` must be consumed exactly
    pub fn unmarshal(mut src: &[u8]) -> Result<MetricName> {
        if src.len() < 8 {
            return Err(IndexError::Corruption(format!(
                "cannot unmarshal metric name from {} bytes; need at least 8 bytes",
                src.len()
            )));
        }
        let account_id = src.get_u32();
        let project_id = src.get_u32();
        let (metric_group, mut tail) = unmarshal_tag_value(src)?;
        let mut mn = MetricName {
            account_id,
            project_id,
            metric_group,
            tags: Vec::new(),
        };
        while !tail.is_empty() {
            let (key, rest) = unmarshal_tag_value(tail)?;
            let (value, rest) = unmarshal_tag_value(rest)?;
            mn.tags.push(Tag { key, value });
            tail = rest;
        }
        Ok(mn)
    }
}

impl fmt::Display for MetricName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.account_id,
            self.project_id,
            String::from_utf8_lossy(&self.metric_group)
        )?;
        write!(f, "{{")?;
        for (i, tag) in self.tags.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(
                f,
                "{}={}",
                String::from_utf8_lossy(&tag.key),
                String::from_utf8_lossy(&tag.value)
            )?;
        }
        write!(f, "}}")
    }
}

/// Append `src` escaped and terminated with [`TAG_SEPARATOR`]
pub fn marshal_tag_value(dst: &mut Vec<u8>, src: &[u8]) {
    if !src
        .iter()
        .any(|&b| b == ESCAPE_CHAR || b == TAG_SEPARATOR)
    {
        // Fast path: nothing to escape.
        dst.extend_from_slice(src);
        dst.push(TAG_SEPARATOR);
        return;
    }
    for &b in src {
        match b {
            ESCAPE_CHAR => {
                dst.push(ESCAPE_CHAR);
                dst.push(b'0');
            }
            TAG_SEPARATOR => {
                dst.push(ESCAPE_CHAR);
                dst.push(b'1');
            }
            _ => dst.push(b),
        }
    }
    dst.push(TAG_SEPARATOR);
}

/// Decode one escaped value terminated by [`TAG_SEPARATOR`], returning
/// the value and the remaining tail
pub fn unmarshal_tag_value(src: &[u8]) -> Result<(Vec<u8>, &[u8])> {
    let mut value = Vec::new();
    let mut i = 0;
    while i < src.len() {
        match src[i] {
            TAG_SEPARATOR => return Ok((value, &src[i + 1..])),
            ESCAPE_CHAR => {
                let next = src.get(i + 1).ok_or_else(|| {
                    IndexError::Corruption("truncated escape sequence in tag value".to_string())
                })?;
                match next {
                    b'0' => value.push(ESCAPE_CHAR),
                    b'1' => value.push(TAG_SEPARATOR),
                    _ => {
                        return Err(IndexError::Corruption(format!(
                            "unexpected escape sequence 0x00 0x{next:02x} in tag value"
                        )))
                    }
                }
                i += 2;
            }
            b => {
                value.push(b);
                i += 1;
            }
        }
    }
    Err(IndexError::Corruption(
        "missing tag separator at the end of tag value".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_value_roundtrip_plain() {
        let mut buf = Vec::new();
        marshal_tag_value(&mut buf, b"hello");
        assert_eq!(buf, b"hello\x01");
        let (value, tail) = unmarshal_tag_value(&buf).unwrap();
        assert_eq!(value, b"hello");
        assert!(tail.is_empty());
    }

    #[test]
    fn test_tag_value_roundtrip_escaped() {
        let raw = b"\x00a\x01b\x00";
        let mut buf = Vec::new();
        marshal_tag_value(&mut buf, raw);
        assert!(!buf[..buf.len() - 1].contains(&TAG_SEPARATOR));
        let (value, tail) = unmarshal_tag_value(&buf).unwrap();
        assert_eq!(value, raw);
        assert!(tail.is_empty());
    }

    #[test]
    fn test_tag_value_empty() {
        let mut buf = Vec::new();
        marshal_tag_value(&mut buf, b"");
        assert_eq!(buf, [TAG_SEPARATOR]);
        let (value, tail) = unmarshal_tag_value(&buf).unwrap();
        assert!(value.is_empty());
        assert!(tail.is_empty());
    }

    #[test]
    fn test_tag_value_missing_separator() {
        assert!(unmarshal_tag_value(b"abc").is_err());
    }

    #[test]
    fn test_metric_name_roundtrip() {
        let mut mn = MetricName::new(1, 2, "cpu")
            .with_tag("host", "a")
            .with_tag("dc", "x");
        let buf = mn.marshaled();

        let decoded = MetricName::unmarshal(&buf).unwrap();
        assert_eq!(decoded.account_id, 1);
        assert_eq!(decoded.project_id, 2);
        assert_eq!(decoded.metric_group, b"cpu");
        // Tags come back in sorted order.
        assert_eq!(decoded.tags[0].key, b"dc");
        assert_eq!(decoded.tags[1].key, b"host");
    }

    #[test]
    fn test_metric_name_canonical_order() {
        let mut a = MetricName::new(1, 2, "m").with_tag("b", "2").with_tag("a", "1");
        let mut b = MetricName::new(1, 2, "m").with_tag("a", "1").with_tag("b", "2");
        assert_eq!(a.marshaled(), b.marshaled());
    }

    #[test]
    fn test_metric_name_rejects_dangling_key() {
        let mut mn = MetricName::new(1, 2, "m");
        let mut buf = mn.marshaled();
        // A key without its value cannot be decoded.
        marshal_tag_value(&mut buf, b"orphan");
        assert!(MetricName::unmarshal(&buf).is_err());
    }
}
