//! Kademlia node Id or a lookup target
use rand::RngCore;
use sha1_smol::Sha1;
use std::{
    fmt::{self, Debug, Display, Formatter},
    ops::BitXor,
    str::FromStr,
};

use crate::{Error, Result};

/// The size of node IDs in bytes.
pub const ID_SIZE: usize = 64;
/// The size of node IDs in bits.
pub const ID_BITS: usize = ID_SIZE * 8;

/// Bytes taken from each digest when filling an [Id] from hashes.
const DIGEST_CHUNK: usize = ID_SIZE / 4;

/// Leading zero bits of every byte value, so `PREFIX_LENGTH[a ^ b]` is the
/// number of leading bits `a` and `b` share.
const PREFIX_LENGTH: [u8; 256] = {
    let mut table = [0u8; 256];
    let mut i = 0;
    while i < 256 {
        table[i] = (i as u8).leading_zeros() as u8;
        i += 1;
    }
    table
};

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
/// Kademlia node Id or a lookup target.
///
/// Ordering is lexicographic over the bytes, which for XOR distances is the
/// same as numeric ordering.
pub struct Id([u8; ID_SIZE]);

impl Id {
    /// The all zero Id, which is also the distance from any Id to itself.
    pub const ZERO: Id = Id([0; ID_SIZE]);

    pub fn random() -> Id {
        let mut bytes = [0u8; ID_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);

        Id(bytes)
    }

    /// Create a new Id from some bytes. Returns Err if `bytes` is not of length
    /// [ID_SIZE](crate::common::ID_SIZE).
    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<Id> {
        let bytes = bytes.as_ref();
        if bytes.len() != ID_SIZE {
            return Err(Error::InvalidIdSize(bytes.len()));
        }

        let mut tmp: [u8; ID_SIZE] = [0; ID_SIZE];
        tmp.copy_from_slice(bytes);

        Ok(Id(tmp))
    }

    /// Create a new Id from at most [ID_SIZE] bytes, padding the tail with zeros.
    pub fn from_prefix<T: AsRef<[u8]>>(bytes: T) -> Result<Id> {
        let bytes = bytes.as_ref();
        if bytes.len() > ID_SIZE {
            return Err(Error::InvalidIdSize(bytes.len()));
        }

        let mut tmp: [u8; ID_SIZE] = [0; ID_SIZE];
        tmp[..bytes.len()].copy_from_slice(bytes);

        Ok(Id(tmp))
    }

    /// Derive an Id from a string seed.
    ///
    /// The seed digest is repeated to fill the width, then [Self::rehash]ed so
    /// that the four quarters differ.
    pub fn from_seed(seed: &str) -> Id {
        Self::from_digest_of(seed.as_bytes())
    }

    /// Derive an Id from an integer seed, see [Self::from_seed].
    pub fn from_u64(seed: u64) -> Id {
        Self::from_digest_of(&seed.to_be_bytes())
    }

    /// Hash this Id and three successors of it into a new, well distributed Id.
    pub fn rehash(&self) -> Id {
        let mut bytes = [0u8; ID_SIZE];

        for (i, chunk) in bytes.chunks_exact_mut(DIGEST_CHUNK).enumerate() {
            let digest = sha1(self.wrapping_add(i as u32).as_bytes());
            chunk.copy_from_slice(&digest[..DIGEST_CHUNK]);
        }

        Id(bytes)
    }

    /// Big endian wrapping addition.
    pub fn wrapping_add(&self, value: u32) -> Id {
        let mut bytes = self.0;
        let mut carry = value as u64;

        for byte in bytes.iter_mut().rev() {
            if carry == 0 {
                break;
            }

            let sum = *byte as u64 + (carry & 0xff);
            *byte = sum as u8;
            carry = (carry >> 8) + (sum >> 8);
        }

        Id(bytes)
    }

    /// XOR distance between this Id and a target Id.
    ///
    /// Distance to self is [Id::ZERO].
    pub fn distance(&self, other: &Id) -> Id {
        *self ^ *other
    }

    /// Number of leading bits shared by `self` and `other`.
    ///
    /// Returns [ID_BITS] for equal ids.
    pub fn common_prefix_length(&self, other: &Id) -> usize {
        for i in 0..ID_SIZE {
            let a = self.0[i];
            let b = other.0[i];

            if a != b {
                return i * 8 + PREFIX_LENGTH[(a ^ b) as usize] as usize;
            }
        }

        ID_BITS
    }

    /// Number of leading zero bits.
    pub fn leading_zeros(&self) -> usize {
        self.common_prefix_length(&Id::ZERO)
    }

    /// Random Id sharing exactly `common_bits` leading bits with this one.
    ///
    /// The bit right after the shared prefix is flipped, the rest are random.
    /// Returns `self` if `common_bits` covers the whole width.
    pub fn random_with_prefix(&self, common_bits: usize) -> Id {
        if common_bits >= ID_BITS {
            return *self;
        }

        let mut bytes = Id::random().0;

        let full = common_bits / 8;
        let rem = common_bits % 8;

        bytes[..full].copy_from_slice(&self.0[..full]);

        let keep = !(0xffu8 >> rem);
        let flip = 0x80u8 >> rem;
        let free = flip - 1;

        bytes[full] = (self.0[full] & keep) | (!self.0[full] & flip) | (bytes[full] & free);

        Id(bytes)
    }

    /// Returns whichever of `a` and `b` is closer to `target`, `b` on a tie.
    pub fn select_closest(a: Id, b: Id, target: &Id) -> Id {
        if a.distance(target) < b.distance(target) {
            a
        } else {
            b
        }
    }

    pub fn is_zero(&self) -> bool {
        self == &Id::ZERO
    }

    pub fn as_bytes(&self) -> &[u8; ID_SIZE] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }

    // === Private Methods ===

    fn from_digest_of(seed: &[u8]) -> Id {
        let digest = sha1(seed);

        let mut bytes = [0u8; ID_SIZE];
        for chunk in bytes.chunks_exact_mut(DIGEST_CHUNK) {
            chunk.copy_from_slice(&digest[..DIGEST_CHUNK]);
        }

        Id(bytes).rehash()
    }
}

fn sha1(data: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.digest().bytes()
}

impl BitXor for Id {
    type Output = Id;

    fn bitxor(self, rhs: Id) -> Id {
        let mut bytes = self.0;
        for (a, b) in bytes.iter_mut().zip(rhs.0.iter()) {
            *a ^= b;
        }

        Id(bytes)
    }
}

impl From<[u8; ID_SIZE]> for Id {
    fn from(bytes: [u8; ID_SIZE]) -> Id {
        Id(bytes)
    }
}

impl Display for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{:02x}", byte)?;
        }

        Ok(())
    }
}

impl Debug for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Id({})", self)
    }
}

impl FromStr for Id {
    type Err = Error;

    fn from_str(s: &str) -> Result<Id> {
        if !s.is_ascii() {
            return Err(Error::InvalidIdEncoding);
        }
        if s.len() != ID_SIZE * 2 {
            return Err(Error::InvalidIdSize(s.len() / 2));
        }

        let mut bytes = [0u8; ID_SIZE];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)
                .map_err(|_| Error::InvalidIdEncoding)?;
        }

        Ok(Id(bytes))
    }
}
