//! Key encoding shared by all index namespaces
//!
//! Every row in the store starts with a single namespace prefix byte.
//! Namespaces 1, 2, 3 and 5 follow it with the tenant pair encoded
//! big-endian, so byte order equals (tenant, …) logical order.

use crate::{IndexError, Result};
use bytes::{Buf, BufMut};

/// Prefix for MetricName → TSID rows
pub const NS_METRIC_NAME_TO_TSID: u8 = 0;

/// Prefix for Tag → MetricIDs rows
pub const NS_TAG_TO_METRIC_IDS: u8 = 1;

/// Prefix for MetricID → TSID rows
pub const NS_METRIC_ID_TO_TSID: u8 = 2;

/// Prefix for MetricID → MetricName rows
pub const NS_METRIC_ID_TO_METRIC_NAME: u8 = 3;

/// Prefix for deleted-MetricID tombstone rows
pub const NS_DELETED_METRIC_ID: u8 = 4;

/// Prefix for Date → MetricID rows
pub const NS_DATE_TO_METRIC_ID: u8 = 5;

/// 1 byte namespace prefix + 4 bytes account id + 4 bytes project id
pub const COMMON_PREFIX_LEN: usize = 9;

/// Append the common key prefix: namespace byte, account id, project id
pub fn marshal_common_prefix(dst: &mut Vec<u8>, ns_prefix: u8, account_id: u32, project_id: u32) {
    dst.push(ns_prefix);
    dst.put_u32(account_id);
    dst.put_u32(project_id);
}

/// Decode the common key prefix, returning (ns, account, project, tail)
pub fn unmarshal_common_prefix(mut src: &[u8]) -> Result<(u8, u32, u32, &[u8])> {
    if src.len() < COMMON_PREFIX_LEN {
        return Err(IndexError::Corruption(format!(
            "cannot unmarshal common prefix from {} bytes; need at least {} bytes",
            src.len(),
            COMMON_PREFIX_LEN
        )));
    }
    let ns_prefix = src.get_u8();
    let account_id = src.get_u32();
    let project_id = src.get_u32();
    Ok((ns_prefix, account_id, project_id, src))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_common_prefix_roundtrip() {
        let mut buf = Vec::new();
        marshal_common_prefix(&mut buf, NS_TAG_TO_METRIC_IDS, 42, 7);
        assert_eq!(buf.len(), COMMON_PREFIX_LEN);

        let (ns, account_id, project_id, tail) = unmarshal_common_prefix(&buf).unwrap();
        assert_eq!(ns, NS_TAG_TO_METRIC_IDS);
        assert_eq!(account_id, 42);
        assert_eq!(project_id, 7);
        assert!(tail.is_empty());
    }

    #[test]
    fn test_common_prefix_sorts_by_tenant() {
        let mut a = Vec::new();
        let mut b = Vec::new();
        marshal_common_prefix(&mut a, NS_TAG_TO_METRIC_IDS, 1, 200);
        marshal_common_prefix(&mut b, NS_TAG_TO_METRIC_IDS, 2, 1);
        // Big-endian tenant encoding keeps byte order aligned with
        // numeric order.
        assert!(a < b);
    }

    #[test]
    fn test_common_prefix_too_short() {
        assert!(unmarshal_common_prefix(&[1, 2, 3]).is_err());
    }
}
