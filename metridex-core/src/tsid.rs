//! Series identifiers
//!
//! A `Tsid` names one time series. Besides the globally unique
//! `MetricId` it carries denormalized hashes of the metric group and of
//! the first two label values, so that sorting a result set groups
//! related series together without touching the metric names.

use crate::{IndexError, Result};
use bytes::{Buf, BufMut};

/// Globally unique 64-bit series identifier. Never reused.
pub type MetricId = u64;

/// Size of a marshaled [`Tsid`] in bytes
pub const MARSHALED_TSID_LEN: usize = 32;

/// Identifier record for one time series.
///
/// The derive order of the fields is the sort order used when returning
/// query results: tenant first, then metric group, then job/instance
/// hashes, then the metric id.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tsid {
    /// Tenant account id
    pub account_id: u32,
    /// Tenant project id
    pub project_id: u32,
    /// Hash of the metric group (the bare metric name)
    pub metric_group_id: u64,
    /// Hash of the first label value
    pub job_id: u32,
    /// Hash of the second label value
    pub instance_id: u32,
    /// Globally unique series id
    pub metric_id: MetricId,
}

impl Tsid {
    /// Append the fixed-width big-endian form to `dst`
    pub fn marshal(&self, dst: &mut Vec<u8>) {
        dst.put_u32(self.account_id);
        dst.put_u32(self.project_id);
        dst.put_u64(self.metric_group_id);
        dst.put_u32(self.job_id);
        dst.put_u32(self.instance_id);
        dst.put_u64(self.metric_id);
    }

    /// Decode a `Tsid` from the head of `src`, returning the remaining tail
    pub fn unmarshal(mut src: &[u8]) -> Result<(Tsid, &[u8])> {
        if src.len() < MARSHALED_TSID_LEN {
            return Err(IndexError::Corruption(format!(
                "cannot unmarshal TSID from {} bytes; need at least {} bytes",
                src.len(),
                MARSHALED_TSID_LEN
            )));
        }
        let tsid = Tsid {
            account_id: src.get_u32(),
            project_id: src.get_u32(),
            metric_group_id: src.get_u64(),
            job_id: src.get_u32(),
            instance_id: src.get_u32(),
            metric_id: src.get_u64(),
        };
        Ok((tsid, src))
    }
}

/// Append a count-prefixed list of TSIDs to `dst`.
///
/// This is the uncompressed form of a tag-cache value.
pub fn marshal_tsids(dst: &mut Vec<u8>, tsids: &[Tsid]) {
    dst.put_u64(tsids.len() as u64);
    for tsid in tsids {
        tsid.marshal(dst);
    }
}

/// Decode a count-prefixed list of TSIDs
pub fn unmarshal_tsids(mut src: &[u8]) -> Result<Vec<Tsid>> {
    if src.len() < 8 {
        return Err(IndexError::Corruption(format!(
            "cannot unmarshal the number of tsids from {} bytes; need at least 8 bytes",
            src.len()
        )));
    }
    let n = src.get_u64() as usize;
    let mut tsids = Vec::with_capacity(n);
    for i in 0..n {
        let (tsid, tail) = Tsid::unmarshal(src).map_err(|e| {
            IndexError::Corruption(format!("cannot unmarshal tsid #{i} out of {n}: {e}"))
        })?;
        tsids.push(tsid);
        src = tail;
    }
    if !src.is_empty() {
        return Err(IndexError::Corruption(format!(
            "non-empty tail left after unmarshaling {} tsids; tail length {}",
            n,
            src.len()
        )));
    }
    Ok(tsids)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Tsid {
        Tsid {
            account_id: 1,
            project_id: 2,
            metric_group_id: 0xdead_beef_cafe_f00d,
            job_id: 77,
            instance_id: 88,
            metric_id: 1_000_001,
        }
    }

    #[test]
    fn test_tsid_roundtrip() {
        let tsid = sample();
        let mut buf = Vec::new();
        tsid.marshal(&mut buf);
        assert_eq!(buf.len(), MARSHALED_TSID_LEN);

        let (decoded, tail) = Tsid::unmarshal(&buf).unwrap();
        assert_eq!(decoded, tsid);
        assert!(tail.is_empty());
    }

    #[test]
    fn test_tsid_unmarshal_short_buffer() {
        let err = Tsid::unmarshal(&[0u8; 10]).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_tsid_ordering() {
        let mut a = sample();
        let mut b = sample();
        a.account_id = 1;
        b.account_id = 2;
        assert!(a < b);

        b.account_id = 1;
        a.metric_group_id = 1;
        b.metric_group_id = 2;
        assert!(a < b);

        b.metric_group_id = 1;
        a.metric_id = 10;
        b.metric_id = 20;
        assert!(a < b);
    }

    #[test]
    fn test_tsids_list_roundtrip() {
        let tsids = vec![sample(), sample(), Tsid::default()];
        let mut buf = Vec::new();
        marshal_tsids(&mut buf, &tsids);
        let decoded = unmarshal_tsids(&buf).unwrap();
        assert_eq!(decoded, tsids);
    }

    #[test]
    fn test_tsids_list_rejects_trailing_garbage() {
        let mut buf = Vec::new();
        marshal_tsids(&mut buf, &[sample()]);
        buf.push(0);
        assert!(unmarshal_tsids(&buf).is_err());
    }
}
