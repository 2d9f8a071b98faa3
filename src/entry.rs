//! The entry capability and its serialized form.
//!
//! The cache never sees concrete payload types: clients hand it an object
//! implementing [`CacheEntry`], and the cache drives serialization into a
//! [`PropertyMap`] — an ordered name → typed-vector map with a compact tagged
//! binary encoding. The encoder appends the entry hash as a trailing canary;
//! the decoder rejects any blob whose canary does not match the hash the
//! entry was looked up under.

use std::sync::Arc;

use crate::error::{CacheError, Result};

/// Outcome of [`CacheEntry::deserialize`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeserializeStatus {
    /// The payload was reconstructed faithfully.
    Ok,
    /// The stored data does not describe this entry type; the cached entry
    /// must be discarded.
    Failed,
    /// Deserialization has side effects on the stored entry and must be
    /// retried under the bucket write lock.
    NeedsWriteLock,
}

/// Capability object describing one cache entry.
///
/// `serialize` must leave `props` cleared when it fails. `deserialize` is
/// handed `has_write_rights = false` on the read path first and may answer
/// [`DeserializeStatus::NeedsWriteLock`] to be retried under the write lock;
/// the retry happens at most once.
pub trait CacheEntry: Send + Sync {
    /// 64-bit content fingerprint. Unique per logical entry.
    fn hash(&self) -> u64;

    /// Upper bound on the serialized metadata size in bytes, excluding tile
    /// bytes. Used for cache size accounting.
    fn metadata_size(&self) -> usize;

    /// Identifier of the plugin that produced this entry, for memory reports.
    fn plugin_id(&self) -> &str;

    fn serialize(&self, props: &mut PropertyMap) -> Result<()>;

    fn deserialize(&self, props: &PropertyMap, has_write_rights: bool) -> DeserializeStatus;

    /// Whether the same thread may hold several lockers on this hash at
    /// once. When false, a second fetch from the thread that owns the
    /// pending computation takes the entry over instead of deadlocking.
    fn allow_multiple_fetch_per_thread(&self) -> bool {
        false
    }
}

pub type CacheEntryPtr = Arc<dyn CacheEntry>;

/// One typed property value. Scalar properties are one-element vectors.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Bool(Vec<bool>),
    Int(Vec<i64>),
    UInt(Vec<u64>),
    Double(Vec<f64>),
    Str(Vec<String>),
    Bytes(Vec<u8>),
}

const TAG_BOOL: u8 = 1;
const TAG_INT: u8 = 2;
const TAG_UINT: u8 = 3;
const TAG_DOUBLE: u8 = 4;
const TAG_STR: u8 = 5;
const TAG_BYTES: u8 = 6;

/// Ordered name → value map carrying the serialized form of an entry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PropertyMap {
    props: Vec<(String, PropertyValue)>,
}

impl PropertyMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.props.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.props.is_empty()
    }

    pub fn len(&self) -> usize {
        self.props.len()
    }

    /// Insert or replace a property, preserving first-insertion order.
    pub fn set(&mut self, name: &str, value: PropertyValue) {
        for (n, v) in &mut self.props {
            if n == name {
                *v = value;
                return;
            }
        }
        self.props.push((name.to_owned(), value));
    }

    pub fn get(&self, name: &str) -> Option<&PropertyValue> {
        self.props.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn set_u64(&mut self, name: &str, value: u64) {
        self.set(name, PropertyValue::UInt(vec![value]));
    }

    pub fn get_u64(&self, name: &str) -> Option<u64> {
        match self.get(name)? {
            PropertyValue::UInt(v) => v.first().copied(),
            _ => None,
        }
    }

    pub fn set_i64(&mut self, name: &str, value: i64) {
        self.set(name, PropertyValue::Int(vec![value]));
    }

    pub fn get_i64(&self, name: &str) -> Option<i64> {
        match self.get(name)? {
            PropertyValue::Int(v) => v.first().copied(),
            _ => None,
        }
    }

    pub fn set_f64(&mut self, name: &str, value: f64) {
        self.set(name, PropertyValue::Double(vec![value]));
    }

    pub fn get_f64(&self, name: &str) -> Option<f64> {
        match self.get(name)? {
            PropertyValue::Double(v) => v.first().copied(),
            _ => None,
        }
    }

    pub fn set_str(&mut self, name: &str, value: &str) {
        self.set(name, PropertyValue::Str(vec![value.to_owned()]));
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        match self.get(name)? {
            PropertyValue::Str(v) => v.first().map(String::as_str),
            _ => None,
        }
    }

    pub fn set_bytes(&mut self, name: &str, value: &[u8]) {
        self.set(name, PropertyValue::Bytes(value.to_vec()));
    }

    pub fn get_bytes(&self, name: &str) -> Option<&[u8]> {
        match self.get(name)? {
            PropertyValue::Bytes(v) => Some(v.as_slice()),
            _ => None,
        }
    }

    /// Encode to the tagged binary form, closing with `hash` as the canary.
    pub fn encode(&self, hash: u64) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64);
        for (name, value) in &self.props {
            let name_bytes = name.as_bytes();
            buf.push(tag_of(value));
            buf.extend_from_slice(&(name_bytes.len() as u32).to_le_bytes());
            buf.extend_from_slice(name_bytes);
            encode_value(value, &mut buf);
        }
        buf.extend_from_slice(&hash.to_le_bytes());
        buf
    }

    /// Decode a blob previously produced by [`PropertyMap::encode`].
    ///
    /// Fails with [`CacheError::SerializationFailed`] when the trailing
    /// canary does not equal `expected_hash` or the blob is malformed.
    pub fn decode(data: &[u8], expected_hash: u64) -> Result<Self> {
        if data.len() < 8 {
            return Err(CacheError::SerializationFailed);
        }
        let (body, canary) = data.split_at(data.len() - 8);
        let stored = u64::from_le_bytes(canary.try_into().unwrap());
        if stored != expected_hash {
            return Err(CacheError::SerializationFailed);
        }

        let mut props = Vec::new();
        let mut cur = body;
        while !cur.is_empty() {
            let tag = cur[0];
            cur = &cur[1..];
            let name_len = read_u32(&mut cur)? as usize;
            if cur.len() < name_len {
                return Err(CacheError::SerializationFailed);
            }
            let name = std::str::from_utf8(&cur[..name_len])
                .map_err(|_| CacheError::SerializationFailed)?
                .to_owned();
            cur = &cur[name_len..];
            let value = decode_value(tag, &mut cur)?;
            props.push((name, value));
        }
        Ok(PropertyMap { props })
    }
}

fn tag_of(value: &PropertyValue) -> u8 {
    match value {
        PropertyValue::Bool(_) => TAG_BOOL,
        PropertyValue::Int(_) => TAG_INT,
        PropertyValue::UInt(_) => TAG_UINT,
        PropertyValue::Double(_) => TAG_DOUBLE,
        PropertyValue::Str(_) => TAG_STR,
        PropertyValue::Bytes(_) => TAG_BYTES,
    }
}

fn encode_value(value: &PropertyValue, buf: &mut Vec<u8>) {
    match value {
        PropertyValue::Bool(v) => {
            buf.extend_from_slice(&(v.len() as u32).to_le_bytes());
            buf.extend(v.iter().map(|b| *b as u8));
        }
        PropertyValue::Int(v) => {
            buf.extend_from_slice(&(v.len() as u32).to_le_bytes());
            for x in v {
                buf.extend_from_slice(&x.to_le_bytes());
            }
        }
        PropertyValue::UInt(v) => {
            buf.extend_from_slice(&(v.len() as u32).to_le_bytes());
            for x in v {
                buf.extend_from_slice(&x.to_le_bytes());
            }
        }
        PropertyValue::Double(v) => {
            buf.extend_from_slice(&(v.len() as u32).to_le_bytes());
            for x in v {
                buf.extend_from_slice(&x.to_le_bytes());
            }
        }
        PropertyValue::Str(v) => {
            buf.extend_from_slice(&(v.len() as u32).to_le_bytes());
            for s in v {
                buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
                buf.extend_from_slice(s.as_bytes());
            }
        }
        PropertyValue::Bytes(v) => {
            buf.extend_from_slice(&(v.len() as u32).to_le_bytes());
            buf.extend_from_slice(v);
        }
    }
}

fn decode_value(tag: u8, cur: &mut &[u8]) -> Result<PropertyValue> {
    let count = read_u32(cur)? as usize;
    match tag {
        TAG_BOOL => {
            if cur.len() < count {
                return Err(CacheError::SerializationFailed);
            }
            let v = cur[..count].iter().map(|b| *b != 0).collect();
            *cur = &cur[count..];
            Ok(PropertyValue::Bool(v))
        }
        TAG_INT => {
            let mut v = Vec::with_capacity(count.min(4096));
            for _ in 0..count {
                v.push(read_u64(cur)? as i64);
            }
            Ok(PropertyValue::Int(v))
        }
        TAG_UINT => {
            let mut v = Vec::with_capacity(count.min(4096));
            for _ in 0..count {
                v.push(read_u64(cur)?);
            }
            Ok(PropertyValue::UInt(v))
        }
        TAG_DOUBLE => {
            let mut v = Vec::with_capacity(count.min(4096));
            for _ in 0..count {
                v.push(f64::from_bits(read_u64(cur)?));
            }
            Ok(PropertyValue::Double(v))
        }
        TAG_STR => {
            let mut v = Vec::with_capacity(count.min(4096));
            for _ in 0..count {
                let len = read_u32(cur)? as usize;
                if cur.len() < len {
                    return Err(CacheError::SerializationFailed);
                }
                let s = std::str::from_utf8(&cur[..len])
                    .map_err(|_| CacheError::SerializationFailed)?
                    .to_owned();
                *cur = &cur[len..];
                v.push(s);
            }
            Ok(PropertyValue::Str(v))
        }
        TAG_BYTES => {
            if cur.len() < count {
                return Err(CacheError::SerializationFailed);
            }
            let v = cur[..count].to_vec();
            *cur = &cur[count..];
            Ok(PropertyValue::Bytes(v))
        }
        _ => Err(CacheError::SerializationFailed),
    }
}

fn read_u32(cur: &mut &[u8]) -> Result<u32> {
    if cur.len() < 4 {
        return Err(CacheError::SerializationFailed);
    }
    let v = u32::from_le_bytes(cur[..4].try_into().unwrap());
    *cur = &cur[4..];
    Ok(v)
}

fn read_u64(cur: &mut &[u8]) -> Result<u64> {
    if cur.len() < 8 {
        return Err(CacheError::SerializationFailed);
    }
    let v = u64::from_le_bytes(cur[..8].try_into().unwrap());
    *cur = &cur[8..];
    Ok(v)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_all_types() {
        let mut m = PropertyMap::new();
        m.set("flags", PropertyValue::Bool(vec![true, false, true]));
        m.set_i64("origin_x", -42);
        m.set_u64("frame", 12);
        m.set_f64("par", 1.5);
        m.set_str("layer", "rgba");
        m.set_bytes("blob", &[1, 2, 3, 4, 5]);

        let encoded = m.encode(0xdeadbeef);
        let decoded = PropertyMap::decode(&encoded, 0xdeadbeef).unwrap();
        assert_eq!(m, decoded);
    }

    #[test]
    fn canary_mismatch_rejected() {
        let mut m = PropertyMap::new();
        m.set_u64("frame", 12);
        let encoded = m.encode(1);
        assert!(matches!(
            PropertyMap::decode(&encoded, 2),
            Err(CacheError::SerializationFailed)
        ));
    }

    #[test]
    fn truncated_blob_rejected() {
        let mut m = PropertyMap::new();
        m.set_bytes("blob", &[0u8; 32]);
        let mut encoded = m.encode(7);
        // Drop bytes from the middle, keeping the 8-byte canary intact.
        let canary: Vec<u8> = encoded.split_off(encoded.len() - 8);
        encoded.truncate(encoded.len() / 2);
        encoded.extend_from_slice(&canary);
        assert!(PropertyMap::decode(&encoded, 7).is_err());
    }

    #[test]
    fn set_replaces_in_place() {
        let mut m = PropertyMap::new();
        m.set_u64("a", 1);
        m.set_u64("b", 2);
        m.set_u64("a", 3);
        assert_eq!(m.len(), 2);
        assert_eq!(m.get_u64("a"), Some(3));
    }

    #[test]
    fn empty_map_is_just_a_canary() {
        let m = PropertyMap::new();
        let encoded = m.encode(99);
        assert_eq!(encoded.len(), 8);
        let decoded = PropertyMap::decode(&encoded, 99).unwrap();
        assert!(decoded.is_empty());
    }
}
