use byteorder::{BigEndian, ByteOrder};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Byte length of an encoded revision.
pub const REV_BYTES_LEN: usize = 16;

/// Byte length of an encoded revision carrying a tombstone mark.
pub const MARKED_REV_BYTES_LEN: usize = REV_BYTES_LEN + 1;

const MARK_TOMBSTONE: u8 = b't';

/// A revision identifies a single mutation of the store.
///
/// `main` advances by one per committed write transaction. `sub` counts the
/// mutations within one transaction, starting at 0. Ordering is
/// lexicographic on `(main, sub)`, which the derived `Ord` provides.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Revision {
    pub main: i64,
    pub sub: i64,
}

impl Revision {
    pub fn new(main: i64, sub: i64) -> Self {
        Self { main, sub }
    }

    /// Encodes the revision as 16 big-endian bytes (8 for `main`, 8 for
    /// `sub`) so that byte order equals revision order.
    pub fn to_bytes(self) -> Vec<u8> {
        let mut buf = vec![0; REV_BYTES_LEN];
        BigEndian::write_i64(&mut buf[0..8], self.main);
        BigEndian::write_i64(&mut buf[8..16], self.sub);
        buf
    }

    /// Encodes the revision as a 17-byte tombstone key.
    pub fn to_tombstone_bytes(self) -> Vec<u8> {
        let mut buf = self.to_bytes();
        buf.push(MARK_TOMBSTONE);
        buf
    }

    /// Decodes a 16-byte revision key or a 17-byte tombstone key. Any other
    /// length is invalid input.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        match bytes.len() {
            REV_BYTES_LEN => {}
            MARKED_REV_BYTES_LEN if bytes[REV_BYTES_LEN] == MARK_TOMBSTONE => {}
            n => {
                return Err(Error::InvalidData(format!(
                    "invalid revision key length {n}"
                )))
            }
        }
        Ok(Self {
            main: BigEndian::read_i64(&bytes[0..8]),
            sub: BigEndian::read_i64(&bytes[8..16]),
        })
    }
}

/// Reports whether the encoded revision key carries the tombstone mark.
pub fn is_tombstone(bytes: &[u8]) -> bool {
    bytes.len() == MARKED_REV_BYTES_LEN && bytes[MARKED_REV_BYTES_LEN - 1] == MARK_TOMBSTONE
}

/// Returns the `[start, end)` byte range that selects exactly the rows stored
/// at `rev`, including a tombstone row (the 17-byte key sorts between the
/// 16-byte keys of `rev` and its successor).
pub fn rev_bytes_range(rev: Revision) -> (Vec<u8>, Vec<u8>) {
    let start = rev.to_bytes();
    let end = Revision::new(rev.main, rev.sub + 1).to_bytes();
    (start, end)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoding_round_trip() {
        let revs = [
            Revision::new(0, 0),
            Revision::new(1, 0),
            Revision::new(1, 7),
            Revision::new(i64::MAX, i64::MAX),
        ];
        for rev in revs {
            let bytes = rev.to_bytes();
            assert_eq!(bytes.len(), REV_BYTES_LEN);
            assert_eq!(Revision::from_bytes(&bytes).unwrap(), rev);

            let marked = rev.to_tombstone_bytes();
            assert_eq!(marked.len(), MARKED_REV_BYTES_LEN);
            assert!(is_tombstone(&marked));
            assert_eq!(Revision::from_bytes(&marked).unwrap(), rev);
        }
    }

    #[test]
    fn test_byte_order_matches_revision_order() {
        let revs = [
            Revision::new(1, 0),
            Revision::new(1, 1),
            Revision::new(2, 0),
            Revision::new(2, 5),
            Revision::new(3, 0),
        ];
        let encoded: Vec<_> = revs.iter().map(|r| r.to_bytes()).collect();
        for i in 1..encoded.len() {
            assert!(encoded[i - 1] < encoded[i]);
        }
    }

    #[test]
    fn test_invalid_length_rejected() {
        assert!(Revision::from_bytes(&[0; 8]).is_err());
        assert!(Revision::from_bytes(&[0; 18]).is_err());
        // 17 bytes without the tombstone mark is not a valid key either.
        let mut bytes = Revision::new(1, 0).to_bytes();
        bytes.push(b'x');
        assert!(Revision::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_tombstone_sorts_after_live_revision() {
        let rev = Revision::new(4, 2);
        let (start, end) = rev_bytes_range(rev);
        let tomb = rev.to_tombstone_bytes();
        assert!(start < tomb);
        assert!(tomb < end);
    }
}
