//! Candidate key search.

use crate::{
    channel::{DeviceId, MessageId},
    Error, Result,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use sha2::{Digest, Sha256};
use tracing::{debug, trace};

/// Length of a candidate key, the size of a compressed P-224 x coordinate.
pub const KEY_LEN: usize = 28;

/// Marker opening every candidate key.
pub const KEY_MARKER: [u8; 2] = [0xBA, 0xBE];

/// SEC1 tag of a compressed point with even y.
const COMPRESSED_EVEN: u8 = 0x02;

/// One forged key standing for one value of one bit.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EncodingKey {
    position: u32,
    value: bool,
    public_key: [u8; KEY_LEN],
    key_hash: [u8; 32],
    attempts: u32,
}

impl EncodingKey {
    /// Bit position this key encodes.
    #[must_use]
    pub fn position(&self) -> u32 {
        self.position
    }

    /// Bit value this key encodes.
    #[must_use]
    pub fn value(&self) -> bool {
        self.value
    }

    /// Raw candidate bytes.
    #[must_use]
    pub fn public_key(&self) -> &[u8; KEY_LEN] {
        &self.public_key
    }

    /// SHA-256 of [`public_key`][Self::public_key].
    #[must_use]
    pub fn key_hash(&self) -> &[u8; 32] {
        &self.key_hash
    }

    /// The hash as the report service spells it.
    #[must_use]
    pub fn hash_base64(&self) -> String {
        BASE64.encode(self.key_hash)
    }

    /// Number of candidates tested, including the winning one.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

/// Lays out the candidate for the given bit and attempt counter.
#[must_use]
pub fn candidate(
    device: DeviceId,
    message: MessageId,
    position: u32,
    value: bool,
    counter: u32,
) -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    key[0..2].copy_from_slice(&KEY_MARKER);
    key[2..6].copy_from_slice(&position.to_be_bytes());
    key[6..10].copy_from_slice(&message.0.to_be_bytes());
    key[10..14].copy_from_slice(&device.0.to_be_bytes());
    key[14..18].copy_from_slice(&counter.to_be_bytes());
    key[24..28].copy_from_slice(&u32::from(value).to_be_bytes());
    key
}

/// Returns `true` if `key` is the x coordinate of a point on P-224.
#[must_use]
pub fn is_valid_point(key: &[u8; KEY_LEN]) -> bool {
    let mut sec1 = [0u8; KEY_LEN + 1];
    sec1[0] = COMPRESSED_EVEN;
    sec1[1..].copy_from_slice(key);
    p224::PublicKey::from_sec1_bytes(&sec1).is_ok()
}

/// Searches for the key representing `value` at `position`.
///
/// Candidates are tested with the attempt counter starting at zero, so the search is
/// deterministic: the same inputs always yield the same key.
///
/// # Errors
///
/// Returns [`Error::KeyForgeExhausted`] if none of the first `max_attempts` candidates
/// is a valid point.
///
/// # Examples
///
/// ```
/// use crowdbits::channel::{forge_key, DeviceId, MessageId};
///
/// let key = forge_key(DeviceId(0xDEAD_BEEF), MessageId(0), 5, true, 4096)?;
/// assert_eq!(key.position(), 5);
/// assert!(key.value());
/// # Ok::<(), crowdbits::Error>(())
/// ```
pub fn forge_key(
    device: DeviceId,
    message: MessageId,
    position: u32,
    value: bool,
    max_attempts: u32,
) -> Result<EncodingKey> {
    for counter in 0..max_attempts {
        let public_key = candidate(device, message, position, value, counter);
        if !is_valid_point(&public_key) {
            trace!(position, value, counter, "candidate is not on the curve");
            continue;
        }

        let key_hash: [u8; 32] = Sha256::digest(public_key).into();
        debug!(position, value, attempts = counter + 1, "forged key");

        return Ok(EncodingKey {
            position,
            value,
            public_key,
            key_hash,
            attempts: counter + 1,
        });
    }

    Err(Error::KeyForgeExhausted {
        position,
        value,
        attempts: max_attempts,
    })
}
