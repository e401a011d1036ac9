//! Checksum dispatch.
//!
//! The superblock's `csum_type` tag selects one of four algorithms. Every
//! digest is stored in a 32-byte on-disk field; shorter digests occupy the
//! leading bytes with the remainder zeroed.

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest as _};
use rfs_types::{
    read_le_u16, ParseError, CSUM_SIZE, CSUM_TYPE_BLAKE2B, CSUM_TYPE_CRC32C, CSUM_TYPE_SHA256,
    CSUM_TYPE_XXHASH64,
};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;
use twox_hash::XxHash64;

type Blake2b256 = Blake2b<U32>;

/// A digest padded to the fixed 32-byte on-disk checksum field.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Csum(pub [u8; CSUM_SIZE]);

impl Csum {
    pub const ZERO: Self = Self([0; CSUM_SIZE]);

    /// The leading `len` bytes, as stored in CSUM-tree runs.
    #[must_use]
    pub fn short(&self, len: usize) -> &[u8] {
        &self.0[..len.min(CSUM_SIZE)]
    }
}

impl fmt::Debug for Csum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Csum({self})")
    }
}

impl fmt::Display for Csum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// The checksum algorithm in use, from the superblock `csum_type` tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChecksumType {
    Crc32c,
    XxHash64,
    Sha256,
    Blake2b,
}

impl ChecksumType {
    pub fn from_tag(tag: u16) -> Result<Self, ParseError> {
        match tag {
            CSUM_TYPE_CRC32C => Ok(Self::Crc32c),
            CSUM_TYPE_XXHASH64 => Ok(Self::XxHash64),
            CSUM_TYPE_SHA256 => Ok(Self::Sha256),
            CSUM_TYPE_BLAKE2B => Ok(Self::Blake2b),
            _ => Err(ParseError::InvalidField {
                field: "csum_type",
                reason: "unknown checksum algorithm tag",
            }),
        }
    }

    #[must_use]
    pub fn tag(self) -> u16 {
        match self {
            Self::Crc32c => CSUM_TYPE_CRC32C,
            Self::XxHash64 => CSUM_TYPE_XXHASH64,
            Self::Sha256 => CSUM_TYPE_SHA256,
            Self::Blake2b => CSUM_TYPE_BLAKE2B,
        }
    }

    /// Bytes of the digest that are meaningful (the rest of the field is
    /// zero padding). Also the per-4KiB entry width in CSUM-tree runs.
    #[must_use]
    pub fn digest_len(self) -> usize {
        match self {
            Self::Crc32c => 4,
            Self::XxHash64 => 8,
            Self::Sha256 | Self::Blake2b => 32,
        }
    }

    /// Checksum `data`, padded into the fixed-size field.
    #[must_use]
    pub fn sum(self, data: &[u8]) -> Csum {
        let mut out = [0_u8; CSUM_SIZE];
        match self {
            Self::Crc32c => {
                out[..4].copy_from_slice(&crc32c::crc32c(data).to_le_bytes());
            }
            Self::XxHash64 => {
                out[..8].copy_from_slice(&XxHash64::oneshot(0, data).to_le_bytes());
            }
            Self::Sha256 => {
                out.copy_from_slice(&Sha256::digest(data));
            }
            Self::Blake2b => {
                out.copy_from_slice(&Blake2b256::digest(data));
            }
        }
        Csum(out)
    }

    /// Whether `stored` (a full 32-byte field) matches the digest of `data`.
    #[must_use]
    pub fn verify(self, data: &[u8], stored: &[u8]) -> bool {
        let len = self.digest_len();
        stored.len() >= len && self.sum(data).short(len) == &stored[..len]
    }
}

/// Read the `csum_type` tag out of a superblock region.
pub(crate) fn csum_type_of_region(region: &[u8]) -> Result<ChecksumType, ParseError> {
    ChecksumType::from_tag(read_le_u16(region, 0xC4)?)
}
