use byteorder::{BigEndian, ByteOrder};
use crc::{Crc, Digest};

pub const CRC_64_ECMA: crc::Algorithm<u64> = crc::CRC_64_ECMA_182;

static CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA);

/// A sequential CRC-64 digest over bucket entries.
///
/// Entries must be fed in deterministic (bucket name, key) order: the digest
/// is order-sensitive, which is what makes it comparable across peers that
/// applied the same writes. Each field is length-prefixed so the stream has
/// an unambiguous framing.
pub struct Hasher {
    digest: Digest<'static, u64>,
}

impl Hasher {
    pub fn new() -> Self {
        Self {
            digest: CRC64.digest(),
        }
    }

    /// Feeds one bucket entry into the digest.
    pub fn update(&mut self, bucket: &[u8], key: &[u8], value: &[u8]) {
        for field in [bucket, key, value] {
            let mut len = [0; 4];
            BigEndian::write_u32(&mut len, field.len() as u32);
            self.digest.update(&len);
            self.digest.update(field);
        }
    }

    /// Consumes the hasher and returns the digest value.
    pub fn finish(self) -> u64 {
        self.digest.finalize()
    }
}

impl Default for Hasher {
    fn default() -> Self {
        Self::new()
    }
}
