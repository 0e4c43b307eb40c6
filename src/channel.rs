//! Key forging, report fetching and bit decoding for the covert channel.
//!
//! The [`Fetcher`] drives a message through rounds. Each round forges the keys of the next
//! window of bits, queries the [`ReportSource`][crate::ReportSource] for the hashes of every
//! key forged so far, and hands the accumulated reports to the [decoder][decode::decode].
//!
//! ## Key layout
//!
//! Every bit is represented by two 28-byte candidate keys, one per bit value:
//!
//! | bytes  | content                         |
//! |--------|---------------------------------|
//! | 0..2   | marker `BA BE`                  |
//! | 2..6   | bit position, big endian        |
//! | 6..10  | message id, big endian          |
//! | 10..14 | device id, big endian           |
//! | 14..18 | attempt counter, big endian     |
//! | 18..24 | zero                            |
//! | 24..28 | bit value, big endian           |
//!
//! A candidate is only usable if it is the x coordinate of a point on P-224, so the
//! attempt counter is incremented until it is. The SHA-256 of the winning candidate,
//! base64 encoded, is the hash the report service knows it by.
//!
//! ## End of message
//!
//! Bits nobody reported are unknown. A byte whose eight bits are all unknown is taken to
//! lie past the end of the message, so decoding stops there.
//!
//! ## Examples
//!
//! Fetching a whole message:
//!
//! ```no_run
//! use crowdbits::channel::{DeviceId, Fetcher, MessageId, RoundOutcome};
//! use crowdbits::{FetchConfig, ReportSource, SearchPartyToken};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run(source: impl ReportSource + 'static) -> crowdbits::Result<()> {
//! let fetcher = Fetcher::new(source, FetchConfig::default())?;
//! let token = SearchPartyToken::new(b"token".to_vec())?;
//!
//! let outcome = fetcher
//!     .fetch_message(DeviceId(0xDEAD_BEEF), MessageId(0), &token, &CancellationToken::new())
//!     .await;
//!
//! if let RoundOutcome::Done(text) = outcome {
//!     println!("{text}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod bits;
pub mod decode;
mod fetch;
pub mod key;
mod message;
pub mod report;

pub use decode::{ConflictPolicy, DecodeResult, Verdict};
pub use fetch::{Fetcher, RoundOutcome};
pub use key::{forge_key, EncodingKey};
pub use message::{DeviceId, Message, MessageId, MessageStore, RoundState, StoreEvent};
