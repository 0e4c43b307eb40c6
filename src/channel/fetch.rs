//! Round orchestration.

use crate::{
    channel::{
        decode::{decode, Verdict},
        forge_key,
        report::{ReportQuery, ReportRecord},
        DeviceId, EncodingKey, Message, MessageId, MessageStore, RoundState,
    },
    Error, FetchConfig, ReportSource, Result, SearchPartyToken, TokenSource,
};
use chrono::Utc;
use parking_lot::Mutex;
use std::{collections::HashSet, ops::Range, sync::Arc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How a round ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoundOutcome {
    /// The end of the message was not found yet; carries the highest recovered position.
    Continue(u32),
    /// The end of the message was found; carries the decoded text.
    Done(String),
    /// The round failed. Data committed by earlier rounds is kept.
    Failed(Error),
}

/// Drives messages through forge, query and decode rounds.
///
/// At most one round per message runs at a time; rounds of different messages may run
/// concurrently on the same fetcher.
///
/// # Examples
///
/// Running rounds by hand:
///
/// ```no_run
/// use crowdbits::channel::{DeviceId, Fetcher, MessageId, RoundOutcome};
/// use crowdbits::{FetchConfig, ReportSource, SearchPartyToken};
/// use tokio_util::sync::CancellationToken;
///
/// # async fn run(source: impl ReportSource + 'static) -> crowdbits::Result<()> {
/// let fetcher = Fetcher::new(source, FetchConfig::default())?;
/// let token = SearchPartyToken::new(b"token".to_vec())?;
/// let cancel = CancellationToken::new();
///
/// fetcher.create_message(DeviceId(0x4242_4242), MessageId(1));
/// while let RoundOutcome::Continue(_) =
///     fetcher.fetch_window(MessageId(1), 64, &token, &cancel).await
/// {}
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Fetcher<S> {
    source: S,
    store: Arc<MessageStore>,
    config: FetchConfig,
    in_flight: Mutex<HashSet<MessageId>>,
}

struct RoundGuard<'a> {
    in_flight: &'a Mutex<HashSet<MessageId>>,
    id: MessageId,
}

impl Drop for RoundGuard<'_> {
    fn drop(&mut self) {
        self.in_flight.lock().remove(&self.id);
    }
}

impl<S: ReportSource> Fetcher<S> {
    /// Creates a fetcher with its own message store.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if `config` does not validate.
    pub fn new(source: S, config: FetchConfig) -> Result<Self> {
        Self::with_store(source, config, Arc::new(MessageStore::new()))
    }

    /// Creates a fetcher writing to a shared store.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if `config` does not validate.
    pub fn with_store(source: S, config: FetchConfig, store: Arc<MessageStore>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            source,
            store,
            config,
            in_flight: Mutex::new(HashSet::new()),
        })
    }

    /// The store this fetcher writes to.
    #[must_use]
    pub fn store(&self) -> &Arc<MessageStore> {
        &self.store
    }

    /// The configuration rounds run with.
    #[must_use]
    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    /// Registers an empty message, replacing any message with the same id.
    pub fn create_message(&self, device: DeviceId, id: MessageId) -> Arc<Message> {
        self.store.create(device, id)
    }

    /// Forgets every message, e.g. when switching devices.
    pub fn clear_all(&self) {
        self.store.clear_all();
    }

    /// Runs one round for message `id`, growing it by `window_size` bits.
    ///
    /// The round forges both keys of every position in the new window, queries reports for
    /// every key of the message, and decodes. A window of zero re-queries without forging.
    ///
    /// New keys are committed together with the query's reports, or not at all when the
    /// round fails before that. A query that keeps failing commits the keys, keeps the
    /// previous reports and ends the round with [`Error::ReportQueryFailed`] rather than
    /// trusting a verdict drawn from missing data.
    pub async fn fetch_window(
        &self,
        id: MessageId,
        window_size: u32,
        token: &SearchPartyToken,
        cancel: &CancellationToken,
    ) -> RoundOutcome {
        match self.begin(id) {
            Ok(guard) => self.guarded_window(&guard, window_size, token, cancel).await,
            Err(err) => {
                warn!(message_id = %id, error = %err, "round refused");
                RoundOutcome::Failed(err)
            }
        }
    }

    /// Fetches message `id` of `device` from scratch until its end is found.
    ///
    /// Rounds of [`FetchConfig::window_size`] bits run until one returns
    /// [`RoundOutcome::Done`] or fails, or [`FetchConfig::max_rounds`] rounds have run.
    /// Failed queries are retried with re-query rounds, up to
    /// [`FetchConfig::query_retries`] times over the whole message.
    ///
    /// The message is held for the whole fetch: while a round of `id` is running this
    /// returns [`Error::RoundInFlight`] and leaves the message untouched.
    pub async fn fetch_message<T>(
        &self,
        device: DeviceId,
        id: MessageId,
        tokens: &T,
        cancel: &CancellationToken,
    ) -> RoundOutcome
    where
        T: TokenSource + ?Sized,
    {
        let token = match tokens.search_party_token().await {
            Ok(token) => token,
            Err(err) => {
                warn!(message_id = %id, error = %err, "no token");
                return RoundOutcome::Failed(err);
            }
        };

        let guard = match self.begin(id) {
            Ok(guard) => guard,
            Err(err) => {
                warn!(message_id = %id, error = %err, "fetch refused");
                return RoundOutcome::Failed(err);
            }
        };
        self.store.create(device, id);

        let mut recoveries = self.config.query_retries;
        let mut window = self.config.window_size;
        let mut outcome = RoundOutcome::Continue(0);

        for round in 0..self.config.max_rounds {
            outcome = self.guarded_window(&guard, window, &token, cancel).await;
            debug!(message_id = %id, round, ?outcome, "round complete");

            match &outcome {
                RoundOutcome::Continue(_) => window = self.config.window_size,
                RoundOutcome::Failed(Error::ReportQueryFailed(_)) if recoveries > 0 => {
                    recoveries -= 1;
                    window = 0;
                }
                _ => return outcome,
            }
        }

        info!(message_id = %id, rounds = self.config.max_rounds, "round limit reached");
        outcome
    }

    /// Fetches an existing message again from scratch.
    pub async fn reload<T>(
        &self,
        id: MessageId,
        tokens: &T,
        cancel: &CancellationToken,
    ) -> RoundOutcome
    where
        T: TokenSource + ?Sized,
    {
        match self.store.get(id) {
            Some(message) => {
                self.fetch_message(message.device(), id, tokens, cancel)
                    .await
            }
            None => RoundOutcome::Failed(Error::MessageNotFound(id)),
        }
    }

    fn begin(&self, id: MessageId) -> Result<RoundGuard<'_>> {
        if !self.in_flight.lock().insert(id) {
            return Err(Error::RoundInFlight(id));
        }
        Ok(RoundGuard {
            in_flight: &self.in_flight,
            id,
        })
    }

    async fn guarded_window(
        &self,
        guard: &RoundGuard<'_>,
        window_size: u32,
        token: &SearchPartyToken,
        cancel: &CancellationToken,
    ) -> RoundOutcome {
        match self.run_round(guard.id, window_size, token, cancel).await {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(message_id = %guard.id, error = %err, "round failed");
                RoundOutcome::Failed(err)
            }
        }
    }

    /// Runs one round; the caller holds the message's [`RoundGuard`].
    async fn run_round(
        &self,
        id: MessageId,
        window_size: u32,
        token: &SearchPartyToken,
        cancel: &CancellationToken,
    ) -> Result<RoundOutcome> {
        let mut current = self.store.get(id).ok_or(Error::MessageNotFound(id))?;
        if current.state().is_running() {
            // Left behind by a round whose future was dropped.
            debug!(message_id = %id, state = ?current.state(), "taking over abandoned round");
        }

        let result = self.round(&mut current, window_size, token, cancel).await;
        if let Err(err) = &result {
            let state = match err {
                Error::Cancelled => RoundState::Cancelled,
                err => RoundState::Failed(err.to_string()),
            };
            // Fails only if the message was reset meanwhile.
            let _ = self.store.swap(&current, current.with_state(state));
        }
        result
    }

    async fn round(
        &self,
        current: &mut Arc<Message>,
        window_size: u32,
        token: &SearchPartyToken,
        cancel: &CancellationToken,
    ) -> Result<RoundOutcome> {
        let device = current.device();
        let id = current.id();
        let start = current.fetched_bits();
        let end = start
            .checked_add(window_size)
            .ok_or_else(|| Error::InvalidConfig(format!("window {window_size} overflows")))?;

        info!(message_id = %id, %device, start, end, "starting round");
        *current = self
            .store
            .swap(current, current.with_state(RoundState::Forging))?;

        let keys = tokio::select! {
            () = cancel.cancelled() => return Err(Error::Cancelled),
            keys = self.forge_window(device, id, start..end, cancel) => keys?,
        };

        let mut next = current.with_state(RoundState::Decoding);
        next.keys.extend(keys);
        next.fetched_bits = end;

        *current = self
            .store
            .swap(current, current.with_state(RoundState::Querying))?;

        let hashes = next.keys.iter().map(EncodingKey::hash_base64).collect();
        let query = ReportQuery::ending_at(hashes, Utc::now(), self.config.lookback)?;

        let queried = tokio::select! {
            () = cancel.cancelled() => return Err(Error::Cancelled),
            result = self.query(&query, token) => result,
        };
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let query_error = match queried {
            Ok(records) => {
                let received = records.len();
                let added = next.merge_reports(records);
                debug!(message_id = %id, received, added, "merged reports");
                None
            }
            Err(err) => {
                warn!(message_id = %id, error = %err, "keeping previous reports");
                Some(err)
            }
        };

        *current = self.store.swap(current, next)?;

        let result = decode(current, self.config.conflict_policy);
        let mut next = (**current).clone();
        if result.has_output() {
            next.decoded = Some(result.text.clone());
        }

        let outcome = match (query_error, result.verdict) {
            (Some(err), _) => {
                next.state = RoundState::Failed(err.to_string());
                RoundOutcome::Failed(err)
            }
            (None, Verdict::EndOfMessage) => {
                next.state = RoundState::Done;
                RoundOutcome::Done(result.text)
            }
            (None, Verdict::Incomplete { next_start }) => {
                next.state = RoundState::Continuing { next_start };
                RoundOutcome::Continue(next_start)
            }
        };

        *current = self.store.swap(current, next)?;
        info!(
            message_id = %id,
            fetched_bits = current.fetched_bits(),
            keys = current.keys().len(),
            reports = current.reports().len(),
            ?outcome,
            "round finished"
        );

        Ok(outcome)
    }

    async fn forge_window(
        &self,
        device: DeviceId,
        id: MessageId,
        positions: Range<u32>,
        cancel: &CancellationToken,
    ) -> Result<Vec<EncodingKey>> {
        let max_attempts = self.config.max_forge_attempts;

        // Dropping the set does not stop blocking tasks already running.
        let mut tasks = JoinSet::new();
        for position in positions {
            let cancel = cancel.clone();
            tasks.spawn_blocking(move || -> Result<[EncodingKey; 2]> {
                let forge = |value| {
                    if cancel.is_cancelled() {
                        return Err(Error::Cancelled);
                    }
                    forge_key(device, id, position, value, max_attempts)
                };
                Ok([forge(false)?, forge(true)?])
            });
        }

        let mut pairs = Vec::with_capacity(tasks.len());
        while let Some(joined) = tasks.join_next().await {
            let pair = joined.map_err(|e| Error::ForgeTaskFailed(e.to_string()))??;
            pairs.push(pair);
        }

        pairs.sort_unstable_by_key(|[zero, _]| zero.position());
        Ok(pairs.into_iter().flatten().collect())
    }

    async fn query(
        &self,
        query: &ReportQuery,
        token: &SearchPartyToken,
    ) -> Result<Vec<ReportRecord>> {
        let mut attempt = 0;
        loop {
            let answer =
                tokio::time::timeout(self.config.query_timeout, self.source.query(query, token))
                    .await;

            let err = match answer {
                Ok(Ok(records)) => return Ok(records),
                Ok(Err(err @ Error::ReportQueryFailed(_))) => err,
                Ok(Err(err)) => Error::ReportQueryFailed(err.to_string()),
                Err(_) => Error::ReportQueryFailed(format!(
                    "no answer within {:?}",
                    self.config.query_timeout
                )),
            };

            if attempt >= self.config.query_retries {
                return Err(err);
            }

            let delay = self.config.backoff(attempt);
            warn!(attempt, ?delay, error = %err, "report query failed, retrying");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct Nobody;

    #[async_trait]
    impl ReportSource for Nobody {
        async fn query(
            &self,
            _query: &ReportQuery,
            _token: &SearchPartyToken,
        ) -> Result<Vec<ReportRecord>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn forging_stops_once_cancelled() {
        let fetcher = Fetcher::new(Nobody, FetchConfig::default()).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let forged = fetcher
            .forge_window(DeviceId(1), MessageId(0), 0..256, &cancel)
            .await;
        assert_eq!(forged, Err(Error::Cancelled));
    }

    #[tokio::test]
    async fn forging_sorts_pairs_by_position() {
        let fetcher = Fetcher::new(Nobody, FetchConfig::default()).unwrap();

        let keys = fetcher
            .forge_window(DeviceId(1), MessageId(0), 4..12, &CancellationToken::new())
            .await
            .unwrap();
        let layout: Vec<(u32, bool)> = keys.iter().map(|k| (k.position(), k.value())).collect();
        let expected: Vec<(u32, bool)> = (4..12).flat_map(|p| [(p, false), (p, true)]).collect();
        assert_eq!(layout, expected);
    }
}
