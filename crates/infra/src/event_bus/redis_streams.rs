//! Redis Streams-backed transport (durable, at-least-once delivery).
//!
//! - **Stream key**: `<EVENT_STREAM_KEY>.<AGGREGATE_ID>`, i.e. one stream per
//!   aggregate type
//! - **Consumer group**: created on startup if missing; every projector
//!   instance of a service shares one group
//! - **Entries**: flat field lists (`action`, `payload`, `event_id`,
//!   `correlation_id`, `ordering_key`, `timestamp`, `source`)
//!
//! Reads run on a dedicated thread with a blocking connection and are handed
//! to the supervisor through a [`ChannelTransport`]. An entry is acknowledged
//! (XACK) only after the supervisor has handled it; the poller applies those
//! acknowledgements between reads. Entries never handled stay pending:
//!
//! - on startup the poller claims entries other consumers left idle for
//!   `claim_min_idle` (XPENDING + XCLAIM), then replays its own pending
//!   backlog before reading new entries
//! - a blocking read that returns nothing is forwarded as the end-of-stream
//!   token
//! - malformed entries are logged and acknowledged at once

use std::str::FromStr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use redis::streams::{StreamId, StreamReadReply};
use tracing::{debug, error, info, instrument, warn};

use readmodel_core::{AGGREGATE_ID, CorrelationId, EventId};
use tokio::sync::mpsc;

use readmodel_events::{
    Acknowledge, ChannelTransport, EndOfStreamToken, Envelope, EnvelopeMetadata,
    TransportSender, channel,
};

const DEFAULT_BLOCK_MS: u64 = 1000;
const DEFAULT_BATCH_SIZE: usize = 32;
const DEFAULT_BUFFER: usize = 256;
const DEFAULT_MAX_CONSECUTIVE_FAILURES: u32 = 10;
const DEFAULT_RETRY_BACKOFF_MS: u64 = 500;
const DEFAULT_CLAIM_MIN_IDLE_MS: u64 = 60_000;

#[derive(Debug, thiserror::Error)]
pub enum RedisStreamsError {
    #[error("Redis connection error: {0}")]
    Connection(String),

    #[error("Redis command error: {0}")]
    Command(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Malformed stream entry {id}: {reason}")]
    MalformedEntry { id: String, reason: String },
}

/// Consumer settings for one stream.
#[derive(Debug, Clone)]
pub struct RedisStreamsConfig {
    /// Base stream key; the aggregate id is appended.
    pub stream_key: String,
    pub group: String,
    pub consumer: String,
    /// Forwarded whenever a blocking read comes back empty.
    pub end_of_stream: EndOfStreamToken,
    /// `BLOCK` milliseconds per read.
    pub block_ms: u64,
    /// `COUNT` per read.
    pub batch_size: usize,
    /// Capacity of the hand-off channel to the supervisor.
    pub buffer: usize,
    /// Consecutive read/connect failures before the transport closes.
    pub max_consecutive_failures: u32,
    pub retry_backoff: Duration,
    /// Pending entries of other consumers idle this long are claimed on
    /// startup.
    pub claim_min_idle: Duration,
}

impl RedisStreamsConfig {
    pub fn new(
        stream_key: impl Into<String>,
        group: impl Into<String>,
        consumer: impl Into<String>,
        end_of_stream: EndOfStreamToken,
    ) -> Self {
        Self {
            stream_key: stream_key.into(),
            group: group.into(),
            consumer: consumer.into(),
            end_of_stream,
            block_ms: DEFAULT_BLOCK_MS,
            batch_size: DEFAULT_BATCH_SIZE,
            buffer: DEFAULT_BUFFER,
            max_consecutive_failures: DEFAULT_MAX_CONSECUTIVE_FAILURES,
            retry_backoff: Duration::from_millis(DEFAULT_RETRY_BACKOFF_MS),
            claim_min_idle: Duration::from_millis(DEFAULT_CLAIM_MIN_IDLE_MS),
        }
    }

    pub fn with_claim_min_idle(mut self, min_idle: Duration) -> Self {
        self.claim_min_idle = min_idle;
        self
    }

    /// The key actually read from: `<stream_key>.<AGGREGATE_ID>`.
    pub fn full_stream_key(&self) -> String {
        format!("{}.{}", self.stream_key, AGGREGATE_ID)
    }
}

#[derive(Debug, Clone)]
pub struct RedisStreamsTransport {
    client: redis::Client,
    config: RedisStreamsConfig,
    stream_key: String,
}

impl RedisStreamsTransport {
    pub fn new(
        redis_url: impl AsRef<str>,
        config: RedisStreamsConfig,
    ) -> Result<Self, RedisStreamsError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| RedisStreamsError::Connection(e.to_string()))?;
        let stream_key = config.full_stream_key();

        Ok(Self {
            client,
            config,
            stream_key,
        })
    }

    pub fn stream_key(&self) -> &str {
        &self.stream_key
    }

    pub fn config(&self) -> &RedisStreamsConfig {
        &self.config
    }

    fn connection(&self) -> Result<redis::Connection, RedisStreamsError> {
        self.client
            .get_connection()
            .map_err(|e| RedisStreamsError::Connection(e.to_string()))
    }

    /// Ensure the consumer group exists (idempotent).
    ///
    /// `MKSTREAM` creates the stream too; a fresh group starts at the
    /// beginning of the stream.
    pub fn ensure_consumer_group(&self) -> Result<(), RedisStreamsError> {
        let mut conn = self.connection()?;

        let res: redis::RedisResult<String> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.stream_key)
            .arg(&self.config.group)
            .arg("0")
            .arg("MKSTREAM")
            .query(&mut conn);

        match res {
            Ok(_) => {
                info!(stream_key = %self.stream_key, group = %self.config.group, "consumer group created");
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(RedisStreamsError::Command(format!("XGROUP CREATE failed: {}", e))),
        }
    }

    /// Append an envelope to the stream. Returns the entry id.
    #[instrument(
        skip(self, envelope),
        fields(
            stream_key = %self.stream_key,
            action = envelope.action(),
            event_id = %envelope.event_id()
        ),
        err
    )]
    pub fn publish(&self, envelope: &Envelope) -> Result<String, RedisStreamsError> {
        let mut cmd = redis::cmd("XADD");
        cmd.arg(&self.stream_key).arg("*");
        for (name, value) in entry_fields(envelope)? {
            cmd.arg(name).arg(value);
        }

        let mut conn = self.connection()?;
        cmd.query(&mut conn)
            .map_err(|e| RedisStreamsError::Command(format!("XADD failed: {}", e)))
    }

    /// XREADGROUP from `cursor`: `>` blocks for new entries, any other id
    /// replays this consumer's pending entries after it.
    fn read_batch(
        &self,
        conn: &mut redis::Connection,
        cursor: &str,
    ) -> Result<Vec<StreamId>, RedisStreamsError> {
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(&self.config.group)
            .arg(&self.config.consumer)
            .arg("COUNT")
            .arg(self.config.batch_size);
        if cursor == ">" {
            cmd.arg("BLOCK").arg(self.config.block_ms);
        }
        cmd.arg("STREAMS").arg(&self.stream_key).arg(cursor);

        // Nil reply when BLOCK times out without new entries.
        let reply: Option<StreamReadReply> = cmd
            .query(conn)
            .map_err(|e| RedisStreamsError::Command(format!("XREADGROUP failed: {}", e)))?;

        Ok(reply
            .map(|r| r.keys.into_iter().flat_map(|k| k.ids).collect())
            .unwrap_or_default())
    }

    /// Move entries other consumers left pending for at least
    /// `claim_min_idle` to this consumer. Returns how many were claimed.
    fn claim_stale(&self, conn: &mut redis::Connection) -> Result<usize, RedisStreamsError> {
        let pending: Vec<(String, String, u64, u64)> = redis::cmd("XPENDING")
            .arg(&self.stream_key)
            .arg(&self.config.group)
            .arg("-")
            .arg("+")
            .arg(self.config.batch_size)
            .query(conn)
            .map_err(|e| RedisStreamsError::Command(format!("XPENDING failed: {}", e)))?;

        let ids: Vec<String> = pending
            .into_iter()
            .filter(|(_, consumer, _, _)| *consumer != self.config.consumer)
            .map(|(id, _, _, _)| id)
            .collect();
        if ids.is_empty() {
            return Ok(0);
        }

        let claimed: Vec<String> = redis::cmd("XCLAIM")
            .arg(&self.stream_key)
            .arg(&self.config.group)
            .arg(&self.config.consumer)
            .arg(self.config.claim_min_idle.as_millis() as u64)
            .arg(&ids[..])
            .arg("JUSTID")
            .query(conn)
            .map_err(|e| RedisStreamsError::Command(format!("XCLAIM failed: {}", e)))?;

        Ok(claimed.len())
    }

    fn acknowledge(
        &self,
        conn: &mut redis::Connection,
        entry_id: &str,
    ) -> Result<(), RedisStreamsError> {
        let _: u64 = redis::cmd("XACK")
            .arg(&self.stream_key)
            .arg(&self.config.group)
            .arg(entry_id)
            .query(conn)
            .map_err(|e| RedisStreamsError::Command(format!("XACK failed: {}", e)))?;
        Ok(())
    }

    /// Create the consumer group and start the poller thread.
    ///
    /// The returned transport acknowledges handled entries back to the
    /// poller. It closes when the poller gives up after
    /// `max_consecutive_failures`; the poller stops when the transport is
    /// dropped.
    pub fn spawn(self) -> Result<(ChannelTransport, thread::JoinHandle<()>), RedisStreamsError> {
        self.ensure_consumer_group()?;

        let (tx, transport) = channel(self.config.buffer);
        let (ack_tx, ack_rx) = mpsc::unbounded_channel();
        let handle = thread::Builder::new()
            .name(format!("redis-streams-{}", self.config.consumer))
            .spawn(move || self.poll_loop(tx, ack_rx))
            .map_err(|e| RedisStreamsError::Connection(e.to_string()))?;

        let transport = transport.with_acknowledger(Arc::new(RedisAcker { tx: ack_tx }));
        Ok((transport, handle))
    }

    /// Count a failure; closes the transport and returns `true` once the
    /// limit is reached, otherwise backs off.
    fn give_up(&self, tx: &TransportSender, failures: &mut u32, e: &RedisStreamsError) -> bool {
        *failures += 1;
        if *failures >= self.config.max_consecutive_failures {
            error!(stream_key = %self.stream_key, failures = *failures, error = %e, "giving up on redis");
            tx.blocking_close(format!("redis unavailable: {}", e));
            return true;
        }
        warn!(stream_key = %self.stream_key, failures = *failures, error = %e, "redis read failed; retrying");
        thread::sleep(self.config.retry_backoff);
        false
    }

    /// XACK every entry the supervisor has finished with so far.
    fn flush_acks(&self, conn: &mut redis::Connection, acks: &mut mpsc::UnboundedReceiver<String>) {
        while let Ok(entry_id) = acks.try_recv() {
            if let Err(e) = self.acknowledge(conn, &entry_id) {
                warn!(entry_id = %entry_id, error = %e, "failed to acknowledge stream entry");
            }
        }
    }

    fn poll_loop(self, tx: TransportSender, mut acks: mpsc::UnboundedReceiver<String>) {
        info!(
            stream_key = %self.stream_key,
            group = %self.config.group,
            consumer = %self.config.consumer,
            "redis streams poller started"
        );

        let mut conn: Option<redis::Connection> = None;
        let mut failures = 0u32;
        let mut reclaimed = false;
        // Replay of this consumer's pending entries; `None` once caught up.
        let mut backlog: Option<String> = Some("0".to_string());

        loop {
            if tx.is_closed() {
                if let Some(c) = conn.as_mut() {
                    self.flush_acks(c, &mut acks);
                }
                debug!(stream_key = %self.stream_key, "transport dropped; poller exiting");
                return;
            }

            if conn.is_none() {
                match self.connection() {
                    Ok(c) => conn = Some(c),
                    Err(e) => {
                        if self.give_up(&tx, &mut failures, &e) {
                            return;
                        }
                        continue;
                    }
                }
            }
            let Some(c) = conn.as_mut() else { continue };

            self.flush_acks(c, &mut acks);

            if !reclaimed {
                match self.claim_stale(c) {
                    Ok(claimed) => {
                        reclaimed = true;
                        if claimed > 0 {
                            info!(stream_key = %self.stream_key, claimed, "claimed stale pending entries");
                        }
                    }
                    Err(e) => {
                        conn = None;
                        if self.give_up(&tx, &mut failures, &e) {
                            return;
                        }
                        continue;
                    }
                }
            }

            let cursor = backlog.as_deref().unwrap_or(">");
            let entries = match self.read_batch(c, cursor) {
                Ok(entries) => entries,
                Err(e) => {
                    conn = None;
                    if self.give_up(&tx, &mut failures, &e) {
                        return;
                    }
                    continue;
                }
            };
            failures = 0;

            if backlog.is_some() {
                backlog = entries.last().map(|entry| entry.id.clone());
                if backlog.is_none() {
                    debug!(stream_key = %self.stream_key, "pending backlog replayed");
                    continue;
                }
            } else if entries.is_empty() {
                let sentinel = Envelope::new(self.config.end_of_stream.as_str(), Vec::new())
                    .with_metadata(EnvelopeMetadata {
                        source: Some(self.stream_key.clone()),
                        ..EnvelopeMetadata::default()
                    });
                if tx.blocking_send(sentinel).is_err() {
                    return;
                }
                continue;
            }

            for entry in &entries {
                match entry_to_envelope(entry, &self.stream_key) {
                    Ok(envelope) => {
                        if tx.blocking_send(envelope).is_err() {
                            // Unacknowledged entries stay pending for the next consumer.
                            return;
                        }
                    }
                    Err(e) => {
                        warn!(stream_key = %self.stream_key, error = %e, "skipping malformed stream entry");
                        if let Err(e) = self.acknowledge(c, &entry.id) {
                            warn!(entry_id = %entry.id, error = %e, "failed to acknowledge stream entry");
                        }
                    }
                }
            }
        }
    }
}

/// Hands the positions of handled envelopes back to the poller thread.
#[derive(Debug, Clone)]
struct RedisAcker {
    tx: mpsc::UnboundedSender<String>,
}

impl Acknowledge for RedisAcker {
    fn ack(&self, metadata: &EnvelopeMetadata) {
        // End-of-stream sentinels carry no position.
        if let Some(entry_id) = &metadata.position {
            let _ = self.tx.send(entry_id.clone());
        }
    }
}

/// Field list for one XADD entry; the inverse of [`entry_to_envelope`].
fn entry_fields(envelope: &Envelope) -> Result<Vec<(&'static str, String)>, RedisStreamsError> {
    let payload = std::str::from_utf8(envelope.payload())
        .map_err(|e| RedisStreamsError::Serialization(e.to_string()))?;
    let meta = envelope.metadata();

    let mut fields = vec![
        ("action", envelope.action().to_string()),
        ("payload", payload.to_string()),
        ("event_id", meta.event_id.to_string()),
    ];
    if let Some(correlation_id) = &meta.correlation_id {
        fields.push(("correlation_id", correlation_id.to_string()));
    }
    if let Some(key) = &meta.ordering_key {
        fields.push(("ordering_key", key.clone()));
    }
    if let Some(source) = &meta.source {
        fields.push(("source", source.clone()));
    }
    let timestamp = meta.timestamp.unwrap_or_else(Utc::now);
    fields.push(("timestamp", timestamp.to_rfc3339()));

    Ok(fields)
}

fn field(entry: &StreamId, name: &str) -> Option<String> {
    entry.get::<String>(name).filter(|v| !v.is_empty())
}

fn malformed(entry: &StreamId, reason: impl Into<String>) -> RedisStreamsError {
    RedisStreamsError::MalformedEntry {
        id: entry.id.clone(),
        reason: reason.into(),
    }
}

/// Decode one stream entry. Only `action` is required.
fn entry_to_envelope(entry: &StreamId, stream_key: &str) -> Result<Envelope, RedisStreamsError> {
    let action = field(entry, "action").ok_or_else(|| malformed(entry, "missing action"))?;
    let payload = entry.get::<Vec<u8>>("payload").unwrap_or_default();

    let event_id = match field(entry, "event_id") {
        Some(raw) => EventId::from_str(&raw).map_err(|e| malformed(entry, e.to_string()))?,
        None => EventId::new(),
    };
    let correlation_id = field(entry, "correlation_id")
        .map(|raw| CorrelationId::from_str(&raw))
        .transpose()
        .map_err(|e| malformed(entry, e.to_string()))?;
    let timestamp = field(entry, "timestamp")
        .map(|raw| DateTime::parse_from_rfc3339(&raw).map(|t| t.with_timezone(&Utc)))
        .transpose()
        .map_err(|e| malformed(entry, format!("invalid timestamp: {}", e)))?;

    Ok(Envelope::new(action, payload).with_metadata(EnvelopeMetadata {
        event_id,
        correlation_id,
        ordering_key: field(entry, "ordering_key"),
        position: Some(entry.id.clone()),
        source: field(entry, "source").or_else(|| Some(stream_key.to_string())),
        timestamp,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn entry(id: &str, fields: &[(&str, &str)]) -> StreamId {
        StreamId {
            id: id.to_string(),
            map: fields
                .iter()
                .map(|(k, v)| (k.to_string(), redis::Value::Data(v.as_bytes().to_vec())))
                .collect::<HashMap<_, _>>(),
        }
    }

    #[test]
    fn stream_key_carries_the_aggregate_id() {
        let config = RedisStreamsConfig::new(
            "events.users",
            "users-projector",
            "c1",
            EndOfStreamToken::new("EOS").unwrap(),
        );
        assert_eq!(config.full_stream_key(), "events.users.1");
    }

    #[test]
    fn decodes_a_full_entry() {
        let event_id = EventId::new();
        let correlation_id = CorrelationId::new();
        let raw = entry(
            "1700000000000-0",
            &[
                ("action", "UserRegistered"),
                ("payload", r#"{"userID":"u1"}"#),
                ("event_id", &event_id.to_string()),
                ("correlation_id", &correlation_id.to_string()),
                ("ordering_key", "u1"),
                ("timestamp", "2024-01-02T03:04:05Z"),
            ],
        );

        let envelope = entry_to_envelope(&raw, "events.1").unwrap();

        assert_eq!(envelope.action(), "UserRegistered");
        assert_eq!(envelope.payload(), br#"{"userID":"u1"}"#);
        assert_eq!(envelope.event_id(), event_id);
        assert_eq!(envelope.metadata().correlation_id, Some(correlation_id));
        assert_eq!(envelope.ordering_key(), Some("u1"));
        assert_eq!(envelope.metadata().position.as_deref(), Some("1700000000000-0"));
        assert_eq!(envelope.metadata().source.as_deref(), Some("events.1"));
        assert!(envelope.metadata().timestamp.is_some());
    }

    #[test]
    fn optional_fields_may_be_missing() {
        let envelope = entry_to_envelope(&entry("1-0", &[("action", "UserDeleted")]), "s.1").unwrap();
        assert!(envelope.payload().is_empty());
        assert_eq!(envelope.metadata().correlation_id, None);
        assert_eq!(envelope.ordering_key(), None);
    }

    #[test]
    fn entry_without_action_is_malformed() {
        let err = entry_to_envelope(&entry("1-0", &[("payload", "{}")]), "s.1").unwrap_err();
        assert!(matches!(err, RedisStreamsError::MalformedEntry { ref id, .. } if id == "1-0"));
    }

    #[test]
    fn bad_event_id_is_malformed() {
        let raw = entry("1-0", &[("action", "UserDeleted"), ("event_id", "nope")]);
        assert!(matches!(
            entry_to_envelope(&raw, "s.1"),
            Err(RedisStreamsError::MalformedEntry { .. })
        ));
    }

    fn entry_from_fields(id: &str, fields: Vec<(&'static str, String)>) -> StreamId {
        StreamId {
            id: id.to_string(),
            map: fields
                .into_iter()
                .map(|(k, v)| (k.to_string(), redis::Value::Data(v.into_bytes())))
                .collect(),
        }
    }

    #[test]
    fn published_fields_decode_to_the_same_envelope() {
        let correlation_id = CorrelationId::new();
        let envelope = Envelope::new("UserUpdated", r#"{"filter":{"userID":"u1"}}"#)
            .with_correlation_id(correlation_id)
            .with_ordering_key("u1");

        let fields = entry_fields(&envelope).unwrap();
        let decoded = entry_to_envelope(&entry_from_fields("5-0", fields), "events.1").unwrap();

        assert_eq!(decoded.action(), envelope.action());
        assert_eq!(decoded.payload(), envelope.payload());
        assert_eq!(decoded.event_id(), envelope.event_id());
        assert_eq!(decoded.metadata().correlation_id, Some(correlation_id));
        assert_eq!(decoded.ordering_key(), Some("u1"));
        assert_eq!(decoded.metadata().position.as_deref(), Some("5-0"));
        assert!(decoded.metadata().timestamp.is_some());
    }

    #[test]
    fn non_utf8_payload_cannot_be_published() {
        let envelope = Envelope::new("UserRegistered", vec![0xff, 0xfe]);
        assert!(matches!(
            entry_fields(&envelope),
            Err(RedisStreamsError::Serialization(_))
        ));
    }

    #[test]
    fn acker_forwards_positions_and_skips_sentinels() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let acker = RedisAcker { tx };

        let handled = entry_to_envelope(&entry("7-0", &[("action", "UserDeleted")]), "s.1").unwrap();
        acker.ack(handled.metadata());
        acker.ack(Envelope::new("EOS", Vec::new()).metadata());

        assert_eq!(rx.try_recv().unwrap(), "7-0");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn claim_min_idle_is_configurable() {
        let config = RedisStreamsConfig::new("s", "g", "c", EndOfStreamToken::new("EOS").unwrap());
        assert_eq!(config.claim_min_idle, Duration::from_secs(60));
        let config = config.with_claim_min_idle(Duration::from_secs(5));
        assert_eq!(config.claim_min_idle, Duration::from_secs(5));
    }
}
