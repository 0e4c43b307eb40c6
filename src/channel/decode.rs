//! Reduction of reports to bits and bytes.

use crate::{
    channel::{bits, EncodingKey, Message},
    Error,
};
use std::{
    cmp::Ordering,
    collections::{BTreeMap, HashMap},
};
use tracing::{debug, trace, warn};

/// How a bit is resolved when reports name both of its keys.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConflictPolicy {
    /// The key of the later report in arrival order wins.
    LastWins,
    /// The bit is treated as unknown.
    Unknown,
    /// The key with strictly more reports wins; a tie leaves the bit unknown.
    #[default]
    Majority,
}

/// What the decoder concluded about the message's extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// A byte without a single reported bit was found; the message ends before it.
    EndOfMessage,
    /// No such byte yet.
    Incomplete {
        /// Highest bit position with a known value, zero if none is known.
        next_start: u32,
    },
}

/// The outcome of decoding a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeResult {
    /// One character per scanned position: `0`, `1`, or `?` for unknown.
    pub bits: String,

    /// Scanned bytes rendered as text. Non-ASCII and partially known bytes show as `?`.
    pub text: String,

    /// Scanned bytes, `None` where any bit is unknown.
    pub bytes: Vec<Option<u8>>,

    /// Whether the end of the message was seen.
    pub verdict: Verdict,

    /// Positions whose both keys were reported.
    pub conflicts: Vec<u32>,
}

impl DecodeResult {
    fn empty() -> Self {
        Self {
            bits: String::new(),
            text: String::new(),
            bytes: Vec::new(),
            verdict: Verdict::Incomplete { next_start: 0 },
            conflicts: Vec::new(),
        }
    }

    /// Returns `true` if any bit was recovered.
    #[must_use]
    pub fn has_output(&self) -> bool {
        !self.bits.is_empty()
    }

    /// Returns the scanned bytes if every one of them is fully known.
    #[must_use]
    pub fn payload(&self) -> Option<Vec<u8>> {
        self.bytes.iter().copied().collect()
    }
}

#[derive(Debug, Default)]
struct Tally {
    hits: [u32; 2],
    last: bool,
}

/// Decodes the reports accumulated in `message`.
///
/// Only positions below [`Message::fetched_bits`] are scanned, eight at a time. Scanning
/// stops at the first byte without any known bit. Reports whose id matches none of the
/// message's keys are ignored.
///
/// The function is pure: decoding an unchanged message twice gives the same result.
#[must_use]
pub fn decode(message: &Message, policy: ConflictPolicy) -> DecodeResult {
    let keys: HashMap<String, &EncodingKey> = message
        .keys()
        .iter()
        .map(|key| (key.hash_base64(), key))
        .collect();

    let mut tallies: BTreeMap<u32, Tally> = BTreeMap::new();
    for report in message.reports() {
        let Some(key) = keys.get(&report.id) else {
            trace!(id = %report.id, "report matches no key");
            continue;
        };

        let tally = tallies.entry(key.position()).or_default();
        tally.hits[usize::from(key.value())] += 1;
        tally.last = key.value();
    }

    let mut known = BTreeMap::new();
    let mut conflicts = Vec::new();
    for (position, tally) in tallies {
        let bit = match tally.hits {
            [_, 0] => Some(false),
            [0, _] => Some(true),
            [zeros, ones] => {
                let err = Error::DecodeAmbiguous { position };
                warn!(message_id = %message.id(), zeros, ones, ?policy, "{err}");
                conflicts.push(position);

                match policy {
                    ConflictPolicy::LastWins => Some(tally.last),
                    ConflictPolicy::Unknown => None,
                    ConflictPolicy::Majority => match zeros.cmp(&ones) {
                        Ordering::Greater => Some(false),
                        Ordering::Less => Some(true),
                        Ordering::Equal => None,
                    },
                }
            }
        };

        if let Some(bit) = bit {
            known.insert(position, bit);
        }
    }

    let Some(&highest) = known.keys().next_back() else {
        debug!(message_id = %message.id(), "no reports matched yet");
        return DecodeResult {
            conflicts,
            ..DecodeResult::empty()
        };
    };

    let mut result = DecodeResult {
        bits: String::with_capacity(message.fetched_bits() as usize),
        text: String::new(),
        bytes: Vec::new(),
        verdict: Verdict::Incomplete {
            next_start: highest,
        },
        conflicts,
    };

    let mut byte = [None; 8];
    for position in 0..message.fetched_bits() {
        let bit = known.get(&position).copied();
        result.bits.push(match bit {
            Some(true) => '1',
            Some(false) => '0',
            None => '?',
        });

        byte[(position % 8) as usize] = bit;
        if position % 8 != 7 {
            continue;
        }

        if byte.iter().all(Option::is_none) {
            debug!(message_id = %message.id(), byte = position / 8, "found an empty byte");
            result.verdict = Verdict::EndOfMessage;
            break;
        }

        let value = byte
            .iter()
            .all(Option::is_some)
            .then(|| bits::pack(byte.map(Option::unwrap_or_default)));

        result.text.push(match value {
            Some(value) if value.is_ascii() => char::from(value),
            _ => '?',
        });
        result.bytes.push(value);
        byte = [None; 8];
    }

    debug!(
        message_id = %message.id(),
        bits = %result.bits,
        text = %result.text,
        verdict = ?result.verdict,
        "decoded reports"
    );

    result
}
