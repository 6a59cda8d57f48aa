//! Record and fence-key representation.
//!
//! A record is stored in its wire layout so that deltas, base pages and log
//! blocks all share one encoding:
//!
//! ```text
//! +------------+--------------+-----+------------+-------+
//! | header:u32 | opt klen:u32 | key | opt sn:u64 | value |
//! +------------+--------------+-----+------------+-------+
//! ```
//!
//! Header bits: `insert` (record vs tombstone), `has-value`, `has-sn`, and a
//! 29-bit length field covering the key (and, for valued records, the value
//! plus the key-length word). Records stamped with sequence numbers at or
//! below the initial snapshot omit the sn field and decode as sn 0.
//!
//! All multi-byte integers are big-endian.

use std::cmp::Ordering;

use byteorder::{BigEndian, ByteOrder};

use crate::error::{Error, Result};

const ITM_INSERT_FLAG: u32 = 0x8000_0000;
const ITM_HAS_VAL_FLAG: u32 = 0x4000_0000;
const ITM_SN_FLAG: u32 = 0x2000_0000;
const ITM_LEN_MASK: u32 = 0x1fff_ffff;
const ITM_HDR_LEN: usize = 4;
const ITM_SN_SIZE: usize = 8;
const ITM_KLEN_SIZE: usize = 4;

/// A single record in its encoded form.
#[derive(Clone, PartialEq, Eq)]
pub struct Item {
    raw: Box<[u8]>,
}

impl Item {
    /// Encode a record. `value: None` with `insert: false` is a tombstone.
    pub fn new(key: &[u8], value: Option<&[u8]>, sn: u64, insert: bool) -> Result<Item> {
        let kl = key.len();
        let vl = value.map_or(0, |v| v.len());
        let has_sn = sn > 1;
        let sn_size = if has_sn { ITM_SN_SIZE } else { 0 };

        let len_field = if vl > 0 { kl + vl + ITM_KLEN_SIZE } else { kl };
        if len_field > ITM_LEN_MASK as usize {
            return Err(Error::KeyTooLarge);
        }

        let mut hdr = len_field as u32;
        if insert {
            hdr |= ITM_INSERT_FLAG;
        }
        if has_sn {
            hdr |= ITM_SN_FLAG;
        }

        let size = if vl > 0 {
            ITM_HDR_LEN + ITM_KLEN_SIZE + kl + sn_size + vl
        } else {
            ITM_HDR_LEN + kl + sn_size
        };

        let mut raw = vec![0u8; size];
        if vl > 0 {
            hdr |= ITM_HAS_VAL_FLAG;
            BigEndian::write_u32(&mut raw[0..4], hdr);
            BigEndian::write_u32(&mut raw[4..8], kl as u32);
            let koff = ITM_HDR_LEN + ITM_KLEN_SIZE;
            raw[koff..koff + kl].copy_from_slice(key);
            if has_sn {
                BigEndian::write_u64(&mut raw[koff + kl..koff + kl + 8], sn);
            }
            let voff = koff + kl + sn_size;
            raw[voff..voff + vl].copy_from_slice(value.unwrap());
        } else {
            BigEndian::write_u32(&mut raw[0..4], hdr);
            raw[ITM_HDR_LEN..ITM_HDR_LEN + kl].copy_from_slice(key);
            if has_sn {
                BigEndian::write_u64(&mut raw[ITM_HDR_LEN + kl..ITM_HDR_LEN + kl + 8], sn);
            }
        }

        Ok(Item { raw: raw.into() })
    }

    /// Byte length of the encoded record starting at `data`. Used by the
    /// page decoder to advance past inline records.
    pub fn encoded_size(data: &[u8]) -> usize {
        let hdr = BigEndian::read_u32(&data[0..4]);
        let l = (hdr & ITM_LEN_MASK) as usize;
        let sn_size = if hdr & ITM_SN_FLAG != 0 { ITM_SN_SIZE } else { 0 };
        ITM_HDR_LEN + l + sn_size
    }

    /// Copy an encoded record out of a larger slice.
    pub fn from_encoded(data: &[u8]) -> Item {
        let size = Self::encoded_size(data);
        Item {
            raw: data[..size].to_vec().into(),
        }
    }

    fn hdr(&self) -> u32 {
        BigEndian::read_u32(&self.raw[0..4])
    }

    pub fn is_insert(&self) -> bool {
        self.hdr() & ITM_INSERT_FLAG != 0
    }

    pub fn has_value(&self) -> bool {
        self.hdr() & ITM_HAS_VAL_FLAG != 0
    }

    pub fn sn(&self) -> u64 {
        let hdr = self.hdr();
        if hdr & ITM_SN_FLAG == 0 {
            return 0;
        }
        let (koff, klen) = self.key_span();
        BigEndian::read_u64(&self.raw[koff + klen..koff + klen + 8])
    }

    fn key_span(&self) -> (usize, usize) {
        if self.has_value() {
            let klen = BigEndian::read_u32(&self.raw[4..8]) as usize;
            (ITM_HDR_LEN + ITM_KLEN_SIZE, klen)
        } else {
            let l = (self.hdr() & ITM_LEN_MASK) as usize;
            (ITM_HDR_LEN, l)
        }
    }

    pub fn key(&self) -> &[u8] {
        let (off, len) = self.key_span();
        &self.raw[off..off + len]
    }

    pub fn value(&self) -> &[u8] {
        let hdr = self.hdr();
        let (koff, klen) = self.key_span();
        let sn_size = if hdr & ITM_SN_FLAG != 0 { ITM_SN_SIZE } else { 0 };
        let l = (hdr & ITM_LEN_MASK) as usize;
        let vlen = l - klen - ITM_KLEN_SIZE;
        let voff = koff + klen + sn_size;
        &self.raw[voff..voff + vlen]
    }

    /// Encoded size, used for memory and flush accounting.
    pub fn size(&self) -> usize {
        self.raw.len()
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn cmp_key(&self, other: &Item) -> Ordering {
        self.key().cmp(other.key())
    }
}

impl std::fmt::Debug for Item {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Item")
            .field("key", &String::from_utf8_lossy(self.key()))
            .field("sn", &self.sn())
            .field("insert", &self.is_insert())
            .field("has_value", &self.has_value())
            .finish()
    }
}

/// A page boundary: below every key, a concrete separator key, or above
/// every key. The derived order (`Lo < Key < Hi`, keys by byte order) makes
/// fences usable directly as separator-index keys.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Fence {
    Lo,
    Key(Box<[u8]>),
    Hi,
}

impl Fence {
    pub fn from_key(key: &[u8]) -> Fence {
        Fence::Key(key.to_vec().into())
    }

    /// Order of this fence relative to a record key.
    pub fn cmp_key(&self, key: &[u8]) -> Ordering {
        match self {
            Fence::Lo => Ordering::Less,
            Fence::Key(b) => b.as_ref().cmp(key),
            Fence::Hi => Ordering::Greater,
        }
    }

    /// True when `key` lies below this fence.
    pub fn covers(&self, key: &[u8]) -> bool {
        self.cmp_key(key) == Ordering::Greater
    }

    pub fn as_key(&self) -> Option<&[u8]> {
        match self {
            Fence::Key(b) => Some(b),
            _ => None,
        }
    }

    /// Heap footprint for memory accounting.
    pub fn heap_size(&self) -> usize {
        match self {
            Fence::Key(b) => b.len(),
            _ => 0,
        }
    }
}

impl std::fmt::Debug for Fence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Fence::Lo => write!(f, "-inf"),
            Fence::Key(b) => write!(f, "{:?}", String::from_utf8_lossy(b)),
            Fence::Hi => write!(f, "+inf"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_with_value() {
        let itm = Item::new(b"key1", Some(b"value1"), 7, true).unwrap();
        assert_eq!(itm.key(), b"key1");
        assert_eq!(itm.value(), b"value1");
        assert_eq!(itm.sn(), 7);
        assert!(itm.is_insert());
        assert!(itm.has_value());
    }

    #[test]
    fn test_roundtrip_tombstone() {
        let itm = Item::new(b"key1", None, 9, false).unwrap();
        assert_eq!(itm.key(), b"key1");
        assert_eq!(itm.sn(), 9);
        assert!(!itm.is_insert());
        assert!(!itm.has_value());
    }

    #[test]
    fn test_low_sn_not_stored() {
        let itm = Item::new(b"k", Some(b"v"), 1, true).unwrap();
        assert_eq!(itm.sn(), 0);
        let itm = Item::new(b"k", Some(b"v"), 0, true).unwrap();
        assert_eq!(itm.sn(), 0);
    }

    #[test]
    fn test_encoded_size_matches() {
        for (val, sn) in [(Some(&b"abc"[..]), 5u64), (None, 0), (Some(&b"x"[..]), 2)] {
            let itm = Item::new(b"some-key", val, sn, true).unwrap();
            assert_eq!(Item::encoded_size(itm.raw()), itm.size());
            let back = Item::from_encoded(itm.raw());
            assert_eq!(back, itm);
        }
    }

    #[test]
    fn test_fence_order() {
        let a = Fence::from_key(b"aaa");
        let b = Fence::from_key(b"bbb");
        assert!(Fence::Lo < a);
        assert!(a < b);
        assert!(b < Fence::Hi);

        assert!(Fence::Hi.covers(b"zzzz"));
        assert!(!a.covers(b"aaa"));
        assert!(b.covers(b"aaa"));
        assert!(!Fence::Lo.covers(b""));
    }
}
