//! Wire format shared by single-key gossip and full-state push/pull.
//!
//! A gossip message is one protobuf-encoded [`KeyValuePair`]. Full state is a
//! sequence of `[u32 big-endian length][KeyValuePair]` records.

use bytes::BufMut;
use chrono::{DateTime, TimeZone, Utc};
use prost::Message;

use crate::error::WireError;

#[derive(Clone, PartialEq, Message)]
pub struct KeyValuePair {
    #[prost(string, tag = "1")]
    pub key: String,
    #[prost(bytes = "vec", tag = "2")]
    pub value: Vec<u8>,
    #[prost(string, tag = "3")]
    pub codec: String,
    #[prost(bool, tag = "4")]
    pub deleted: bool,
    #[prost(int64, tag = "5")]
    pub update_time_millis: i64,
}

impl KeyValuePair {
    pub fn update_time(&self) -> Option<DateTime<Utc>> {
        millis_to_time(self.update_time_millis)
    }
}

pub(crate) fn time_to_millis(time: Option<DateTime<Utc>>) -> i64 {
    time.map(|t| t.timestamp_millis()).unwrap_or(0)
}

pub(crate) fn millis_to_time(millis: i64) -> Option<DateTime<Utc>> {
    if millis == 0 {
        return None;
    }
    Utc.timestamp_millis_opt(millis).single()
}

/// Appends one length-prefixed record to `buf`.
pub fn put_frame(buf: &mut Vec<u8>, pair: &KeyValuePair) -> Result<(), WireError> {
    let len = pair.encoded_len();
    let len32 = u32::try_from(len).map_err(|_| WireError::TooLarge(len))?;
    buf.reserve(4 + len);
    buf.put_u32(len32);
    pair.encode(buf).map_err(|_| WireError::TooLarge(len))?;
    Ok(())
}

/// Iterator over length-prefixed records. Stops after the first error.
pub struct Frames<'a> {
    data: &'a [u8],
    failed: bool,
}

pub fn frames(data: &[u8]) -> Frames<'_> {
    Frames {
        data,
        failed: false,
    }
}

impl Iterator for Frames<'_> {
    type Item = Result<KeyValuePair, WireError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.data.is_empty() {
            return None;
        }
        if self.data.len() < 4 {
            self.failed = true;
            return Some(Err(WireError::Truncated {
                needed: 4,
                remaining: self.data.len(),
            }));
        }
        let len = u32::from_be_bytes([self.data[0], self.data[1], self.data[2], self.data[3]])
            as usize;
        let rest = &self.data[4..];
        if rest.len() < len {
            self.failed = true;
            return Some(Err(WireError::Truncated {
                needed: len,
                remaining: rest.len(),
            }));
        }
        let (record, tail) = rest.split_at(len);
        self.data = tail;
        match KeyValuePair::decode(record) {
            Ok(pair) => Some(Ok(pair)),
            Err(e) => {
                self.failed = true;
                Some(Err(WireError::Decode(e)))
            }
        }
    }
}
