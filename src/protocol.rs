//! Trim counter wire protocol
//!
//! Gateways in a zone exchange their bucket change counters through
//! notifications on the shared control object. Every notification starts with
//! a one byte [`TrimNotifyType`]; the rest is the message for that type.
//!
//! `TrimRequest` and `TrimResponse` carry a versioned header
//! (`struct_v: u8`, `struct_compat: u8`, `struct_len: u32`) so fields can be
//! appended later. `BucketCounter` entries inside a response have no header of
//! their own; changing their layout requires bumping the response version.
//! All integers are little-endian.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;

/// Highest struct version this build can decode
pub const TRIM_PROTOCOL_VERSION: u8 = 1;

/// Upper bound on entries accepted in a single response
pub const MAX_RESPONSE_ENTRIES: usize = u16::MAX as usize;

const VERSION_HEADER_LEN: usize = 6;
// u32 string length + i32 count
const MIN_ENTRY_LEN: usize = 8;

pub type ProtocolResult<T> = std::result::Result<T, ProtocolError>;

/// Notification types understood on the trim control object
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum TrimNotifyType {
    /// Query a gateway's hottest bucket counters
    TrimCounters = 0,
}

impl TrimNotifyType {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for TrimNotifyType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(TrimNotifyType::TrimCounters),
            other => Err(other),
        }
    }
}

impl fmt::Display for TrimNotifyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrimNotifyType::TrimCounters => write!(f, "trim-counters"),
        }
    }
}

/// Type tag plus message body, as carried by a notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyEnvelope {
    pub notify_type: u8,
    pub payload: Bytes,
}

impl NotifyEnvelope {
    pub fn new(notify_type: TrimNotifyType, payload: Bytes) -> Self {
        Self {
            notify_type: notify_type.as_u8(),
            payload,
        }
    }

    pub fn encode(&self, out: &mut BytesMut) {
        out.put_u8(self.notify_type);
        out.put_slice(&self.payload);
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(1 + self.payload.len());
        self.encode(&mut out);
        out.freeze()
    }

    pub fn decode(buf: &mut Bytes) -> ProtocolResult<Self> {
        let notify_type = read_u8(buf)?;
        let payload = buf.split_to(buf.len());
        Ok(Self {
            notify_type,
            payload,
        })
    }
}

/// Counter for a single bucket instance
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BucketCounter {
    pub bucket: String,
    pub count: i32,
}

impl BucketCounter {
    pub fn new(bucket: impl Into<String>, count: i32) -> Self {
        Self {
            bucket: bucket.into(),
            count,
        }
    }

    // no version header to keep per-entry overhead down
    pub fn encode(&self, out: &mut BytesMut) {
        write_string(out, &self.bucket);
        out.put_i32_le(self.count);
    }

    pub fn decode(buf: &mut Bytes) -> ProtocolResult<Self> {
        let bucket = read_string(buf)?;
        let count = read_i32(buf)?;
        Ok(Self { bucket, count })
    }
}

impl fmt::Display for BucketCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.bucket, self.count)
    }
}

/// Ask a peer for its hottest bucket counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrimRequest {
    /// Maximum number of counters to return; the responder may return fewer
    pub max_buckets: u16,
}

impl TrimRequest {
    pub fn encode(&self, out: &mut BytesMut) {
        encode_versioned(out, TRIM_PROTOCOL_VERSION, 1, |body| {
            body.put_u16_le(self.max_buckets);
        });
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(VERSION_HEADER_LEN + 2);
        self.encode(&mut out);
        out.freeze()
    }

    pub fn decode(buf: &mut Bytes) -> ProtocolResult<Self> {
        decode_versioned(buf, "TrimRequest", |body| {
            let max_buckets = read_u16(body)?;
            Ok(Self { max_buckets })
        })
    }
}

/// A peer's hottest bucket counters, highest count first
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrimResponse {
    pub bucket_counters: Vec<BucketCounter>,
}

impl TrimResponse {
    pub fn new(bucket_counters: Vec<BucketCounter>) -> Self {
        Self { bucket_counters }
    }

    /// Entries past [`MAX_RESPONSE_ENTRIES`] are not written, so the output
    /// always decodes.
    pub fn encode(&self, out: &mut BytesMut) {
        let limit = self.bucket_counters.len().min(MAX_RESPONSE_ENTRIES);
        let entries = &self.bucket_counters[..limit];
        encode_versioned(out, TRIM_PROTOCOL_VERSION, 1, |body| {
            body.put_u32_le(entries.len() as u32);
            for counter in entries {
                counter.encode(body);
            }
        });
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut out = BytesMut::new();
        self.encode(&mut out);
        out.freeze()
    }

    pub fn decode(buf: &mut Bytes) -> ProtocolResult<Self> {
        decode_versioned(buf, "TrimResponse", |body| {
            let n = read_u32(body)? as usize;
            if n > MAX_RESPONSE_ENTRIES {
                return Err(ProtocolError::malformed(format!(
                    "response declares {} entries, limit is {}",
                    n, MAX_RESPONSE_ENTRIES
                )));
            }
            if n.saturating_mul(MIN_ENTRY_LEN) > body.remaining() {
                return Err(ProtocolError::malformed(format!(
                    "response declares {} entries but only {} bytes remain",
                    n,
                    body.remaining()
                )));
            }

            let mut bucket_counters = Vec::with_capacity(n);
            for _ in 0..n {
                bucket_counters.push(BucketCounter::decode(body)?);
            }
            Ok(Self { bucket_counters })
        })
    }
}

/// Write `v`, `compat` and a length prefix around whatever `f` appends.
fn encode_versioned(out: &mut BytesMut, version: u8, compat: u8, f: impl FnOnce(&mut BytesMut)) {
    out.put_u8(version);
    out.put_u8(compat);
    let len_at = out.len();
    out.put_u32_le(0);

    let body_start = out.len();
    f(out);
    let body_len = (out.len() - body_start) as u32;
    out[len_at..len_at + 4].copy_from_slice(&body_len.to_le_bytes());
}

/// Check the versioned header, hand exactly the declared body to `f`, and skip
/// any trailing fields appended by newer encoders.
fn decode_versioned<T>(
    buf: &mut Bytes,
    message: &'static str,
    f: impl FnOnce(&mut Bytes) -> ProtocolResult<T>,
) -> ProtocolResult<T> {
    if buf.remaining() < VERSION_HEADER_LEN {
        return Err(ProtocolError::malformed(format!(
            "{} header truncated: {} bytes",
            message,
            buf.remaining()
        )));
    }
    let _version = buf.get_u8();
    let compat = buf.get_u8();
    if compat > TRIM_PROTOCOL_VERSION {
        return Err(ProtocolError::UnsupportedVersion {
            message,
            compat,
            supported: TRIM_PROTOCOL_VERSION,
        });
    }

    let len = buf.get_u32_le() as usize;
    if len > buf.remaining() {
        return Err(ProtocolError::malformed(format!(
            "{} declares {} body bytes but only {} remain",
            message,
            len,
            buf.remaining()
        )));
    }

    let mut body = buf.split_to(len);
    f(&mut body)
}

fn ensure(buf: &Bytes, needed: usize, what: &str) -> ProtocolResult<()> {
    if buf.remaining() < needed {
        return Err(ProtocolError::malformed(format!(
            "truncated {}: need {} bytes, have {}",
            what,
            needed,
            buf.remaining()
        )));
    }
    Ok(())
}

fn read_u8(buf: &mut Bytes) -> ProtocolResult<u8> {
    ensure(buf, 1, "u8")?;
    Ok(buf.get_u8())
}

fn read_u16(buf: &mut Bytes) -> ProtocolResult<u16> {
    ensure(buf, 2, "u16")?;
    Ok(buf.get_u16_le())
}

fn read_u32(buf: &mut Bytes) -> ProtocolResult<u32> {
    ensure(buf, 4, "u32")?;
    Ok(buf.get_u32_le())
}

fn read_i32(buf: &mut Bytes) -> ProtocolResult<i32> {
    ensure(buf, 4, "i32")?;
    Ok(buf.get_i32_le())
}

fn read_string(buf: &mut Bytes) -> ProtocolResult<String> {
    let len = read_u32(buf)? as usize;
    ensure(buf, len, "string")?;
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec())
        .map_err(|e| ProtocolError::malformed(format!("invalid utf-8 in string: {}", e)))
}

fn write_string(out: &mut BytesMut, s: &str) {
    debug_assert!(
        u32::try_from(s.len()).is_ok(),
        "string of {} bytes does not fit a u32 length",
        s.len()
    );
    out.put_u32_le(s.len() as u32);
    out.put_slice(s.as_bytes());
}
