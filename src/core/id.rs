//! Protocol identifier types.

use std::{fmt, str::FromStr};

use bincode::{Decode, Encode};
use sha2::{Digest, Sha256};

use crate::core::error::Error;

/// A 160-bit identifier that implements a non-euclidian XOR-based distance metric.
///
/// The bytes are interpreted big-endian: `bytes[0]` holds the most-significant bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Encode, Decode)]
pub struct Id {
    bytes: [u8; Self::BYTES],
}

impl Id {
    /// The size of the identifier in bytes.
    pub const BYTES: usize = 20;

    /// The size of the identifier in bits.
    pub const BITS: usize = 20 * 8;

    /// Creates a new identifier from the supplied bytes.
    pub fn new(bytes: [u8; Self::BYTES]) -> Self {
        Id { bytes }
    }

    /// Derives an identifier from an arbitrary input (an address, a public key, a time bucket).
    ///
    /// This is the leading 160 bits of the SHA-256 digest of the input, so the same input always
    /// yields the same identifier.
    pub fn generate(input: &str) -> Self {
        let digest = Sha256::digest(input.as_bytes());
        let mut bytes = [0u8; Self::BYTES];
        bytes.copy_from_slice(&digest[..Self::BYTES]);

        Self { bytes }
    }

    /// Returns the bytes backing the identifier.
    pub fn bytes(&self) -> [u8; Self::BYTES] {
        self.bytes
    }

    #[doc(hidden)]
    /// Convenience function for working with small identifiers during testing, the value is
    /// placed in the least-significant bytes.
    pub fn from_u16(raw: u16) -> Self {
        let mut bytes = [0u8; Self::BYTES];
        bytes[Self::BYTES - 2..].copy_from_slice(&raw.to_be_bytes());

        Self { bytes }
    }

    #[doc(hidden)]
    /// Convenience function for generating random identifiers during testing.
    pub fn rand() -> Self {
        use rand::{thread_rng, Fill};

        let mut rng = thread_rng();
        let mut bytes = [0u8; Self::BYTES];
        assert!(bytes.try_fill(&mut rng).is_ok());

        Self { bytes }
    }

    /// Returns the XOR distance between two identifiers.
    pub fn distance(&self, other: &Id) -> Distance {
        let mut bytes = [0u8; Self::BYTES];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = self.bytes[i] ^ other.bytes[i];
        }

        Distance(bytes)
    }

    /// Computes the log2 of the XOR-based distance between two identifiers, `None` if they are
    /// equal.
    pub fn log2_distance(&self, other: &Id) -> Option<u32> {
        // Search process:
        //
        // [0, 0, 1, 2] <- array bytes in BE
        //  0  1  2  3  <- i
        //
        // The first non-zero byte holds the most-significant bit, it sits (BYTES - 1 - i) bytes
        // above the least-significant byte. The bit position is that offset in bits plus the
        // position of the most-significant bit in the byte itself.
        self.bytes
            .iter()
            .zip(other.bytes.iter())
            .map(|(&a, &b)| a ^ b)
            .enumerate()
            .find(|(_, byte)| byte != &0b0)
            // The left shift multiplies the byte offset by 8 to get its value in bits.
            .map(|(i, byte)| Self::msb(byte) + (((Self::BYTES - 1 - i) as u32) << 3))
    }

    /// Returns the routing table bucket index for the other identifier: the bit length of the
    /// distance minus one, clamped to 0. Equal identifiers map to bucket 0.
    pub fn bucket_index(&self, other: &Id) -> usize {
        self.log2_distance(other).unwrap_or(0) as usize
    }

    // Returns the position of the most-significant bit set in a byte (0-indexed).
    fn msb(n: u8) -> u32 {
        debug_assert_ne!(n, 0);
        // Safety: can't be 0 - 1.
        u8::BITS - n.leading_zeros() - 1
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.bytes {
            write!(f, "{byte:02x}")?;
        }

        Ok(())
    }
}

impl FromStr for Id {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != Self::BYTES * 2 || !s.is_ascii() {
            return Err(Error::InvalidId(s.to_owned()));
        }

        let mut bytes = [0u8; Self::BYTES];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)
                .map_err(|_| Error::InvalidId(s.to_owned()))?;
        }

        Ok(Self { bytes })
    }
}

/// The XOR of two identifiers, ordered as a big-endian unsigned integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Distance([u8; Id::BYTES]);

impl Distance {
    /// The zero distance, only an identifier has it to itself.
    pub const ZERO: Distance = Distance([0u8; Id::BYTES]);

    /// Returns the bytes backing the distance.
    pub fn bytes(&self) -> [u8; Id::BYTES] {
        self.0
    }

    /// The number of significant bits in the distance (0 for the zero distance).
    pub fn bit_length(&self) -> u32 {
        self.0
            .iter()
            .enumerate()
            .find(|(_, byte)| **byte != 0)
            .map(|(i, byte)| ((Id::BYTES - i) as u32) * 8 - byte.leading_zeros())
            .unwrap_or(0)
    }
}
