//! Bit layout of outbound payloads.
//!
//! Bytes are sent in order, most significant bit first, so bit `i` of byte `b` travels at
//! position `8 * b + i`.

/// Iterator over the bits of one byte, most significant first.
#[derive(Debug, Clone)]
pub struct Bits {
    byte: u8,
    offset: u32,
}

impl From<u8> for Bits {
    fn from(value: u8) -> Self {
        Self {
            byte: value,
            offset: 0,
        }
    }
}

impl Iterator for Bits {
    type Item = bool;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset == 8 {
            return None;
        }

        let bit = self.byte & (0x80 >> self.offset) != 0;
        self.offset += 1;
        Some(bit)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = (8 - self.offset) as usize;
        (left, Some(left))
    }
}

impl ExactSizeIterator for Bits {}

/// Returns `(position, value)` for every bit of `payload`.
///
/// # Examples
///
/// ```
/// use crowdbits::channel::bits;
///
/// let positions: Vec<_> = bits::positions(b"\x81").collect();
/// assert_eq!(positions[0], (0, true));
/// assert_eq!(positions[1], (1, false));
/// assert_eq!(positions[7], (7, true));
/// ```
pub fn positions(payload: &[u8]) -> impl Iterator<Item = (u32, bool)> + '_ {
    payload
        .iter()
        .flat_map(|&byte| Bits::from(byte))
        .zip(0u32..)
        .map(|(bit, position)| (position, bit))
}

/// Packs eight bits, most significant first.
pub(crate) fn pack(bits: [bool; 8]) -> u8 {
    bits.iter().fold(0u8, |byte, &bit| (byte << 1) | u8::from(bit))
}
