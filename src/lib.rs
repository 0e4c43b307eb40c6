//! # crowdbits
//!
//! The **crowdbits** library receives messages smuggled through a crowd-sourced Bluetooth
//! location-reporting network. A sender represents every bit of its message as one of two
//! predictable public keys; whichever key passers-by report having seen carries the bit.
//!
//! ## Channel implementation
//!
//! The [`channel`] module forges the candidate keys, queries a [`ReportSource`] for their
//! hashes round after round, and decodes the reports back into bytes. See its
//! [documentation][`channel`] for the key layout and the end-of-message rule.

use async_trait::async_trait;
use std::{fmt, sync::Arc};

pub mod channel;
mod config;
mod error;

pub use config::FetchConfig;
pub use error::{Error, Result};

use channel::report::{ReportQuery, ReportRecord};

/// An opaque bearer token authorizing report queries.
///
/// Tokens are never empty.
#[derive(Clone, PartialEq, Eq)]
pub struct SearchPartyToken(Vec<u8>);

impl SearchPartyToken {
    /// Wraps raw token bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AuthTokenUnavailable`] if `token` is empty.
    pub fn new(token: impl Into<Vec<u8>>) -> Result<Self> {
        let token = token.into();
        if token.is_empty() {
            return Err(Error::AuthTokenUnavailable("token is empty".into()));
        }
        Ok(Self(token))
    }

    /// Returns the raw token bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for SearchPartyToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SearchPartyToken(<{} bytes>)", self.0.len())
    }
}

/// A trait for objects able to supply search party tokens.
///
/// Token acquisition (account login, device attestation) lives outside this crate; a
/// fixed [`SearchPartyToken`] is itself a source that always returns a copy of itself.
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Returns a token valid for report queries.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AuthTokenUnavailable`] when no token can be obtained.
    async fn search_party_token(&self) -> Result<SearchPartyToken>;
}

#[async_trait]
impl TokenSource for SearchPartyToken {
    async fn search_party_token(&self) -> Result<SearchPartyToken> {
        Ok(self.clone())
    }
}

/// A trait for objects able to look up crowd-sourced reports, or report sources.
///
/// Report sources are defined by a single required method, [`query`][ReportSource::query],
/// which returns every report matching any of the query's key hashes.
///
/// Implementations own the transport: headers, HTTP retries and response parsing. Records
/// may arrive in any order and may repeat. Sources receiving the raw JSON envelope can use
/// [`channel::report::parse_results`].
#[async_trait]
pub trait ReportSource: Send + Sync {
    /// Returns the reports matching `query`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ReportQueryFailed`] or [`Error::MalformedReportPayload`] when the
    /// service cannot be reached or its answer cannot be read. Callers treat either as
    /// a round without new reports.
    async fn query(
        &self,
        query: &ReportQuery,
        token: &SearchPartyToken,
    ) -> Result<Vec<ReportRecord>>;
}

#[async_trait]
impl<T: ReportSource + ?Sized> ReportSource for Arc<T> {
    async fn query(
        &self,
        query: &ReportQuery,
        token: &SearchPartyToken,
    ) -> Result<Vec<ReportRecord>> {
        (**self).query(query, token).await
    }
}
