//! Identifier newtypes shared across the mixing engine.

use blake2::{Blake2b512, Digest};
use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! hash_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub [u8; 32]);

        impl $name {
            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }
        }

        impl From<[u8; 32]> for $name {
            fn from(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&hex::encode(self.0))
            }
        }

        // Short form keeps log lines readable.
        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), hex::encode(&self.0[..6]))
            }
        }
    };
}

hash_newtype!(
    /// Public identity of a mixing participant.
    PeerId
);
hash_newtype!(
    /// Commitment to an output offered for mixing.
    OutputCommitment
);
hash_newtype!(
    /// Deterministic identifier of a session, derived from its pair requests.
    SessionId
);
hash_newtype!(
    /// Content hash of a pair request.
    PairRequestId
);

/// Equal-value bucket a pair request mixes into, in atoms.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Denomination(pub u64);

impl fmt::Display for Denomination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Blake2b-512 truncated to 32 bytes, with a domain tag prefix.
pub(crate) fn tagged_hash(tag: &[u8], parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Blake2b512::new();
    hasher.update((tag.len() as u64).to_le_bytes());
    hasher.update(tag);
    for part in parts {
        hasher.update(part);
    }
    let digest = hasher.finalize();
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest[..32]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_full_hex() {
        let id = PeerId([0xab; 32]);
        assert_eq!(id.to_string(), "ab".repeat(32));
        assert_eq!(format!("{:?}", id), "PeerId(abababababab)");
    }

    #[test]
    fn tagged_hash_separates_domains() {
        let a = tagged_hash(b"one", &[&b"payload"[..]]);
        let b = tagged_hash(b"two", &[&b"payload"[..]]);
        assert_ne!(a, b);
        assert_eq!(a, tagged_hash(b"one", &[&b"payload"[..]]));
    }
}
