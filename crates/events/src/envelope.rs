use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use readmodel_core::{CorrelationId, EventId};

/// Transport-assigned metadata carried alongside an event.
///
/// The projector does not interpret these beyond routing (`ordering_key`)
/// and log context.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeMetadata {
    pub event_id: EventId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<CorrelationId>,
    /// Key the transport partitions/orders by, if it exposes one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ordering_key: Option<String>,
    /// Transport position (e.g. stream entry id), for diagnostics only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// The decoded unit of work delivered by the transport.
///
/// - `action` is a domain action tag or the end-of-stream token
/// - `payload` is an opaque JSON blob whose schema depends on `action`
///
/// The projector owns the envelope once delivered and keeps no reference to
/// it after handling completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    action: String,
    payload: Vec<u8>,
    metadata: EnvelopeMetadata,
}

impl Envelope {
    pub fn new(action: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            action: action.into(),
            payload: payload.into(),
            metadata: EnvelopeMetadata::default(),
        }
    }

    /// Build an envelope whose payload is the JSON encoding of `payload`.
    pub fn from_json<T: Serialize + ?Sized>(
        action: impl Into<String>,
        payload: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(action, serde_json::to_vec(payload)?))
    }

    pub fn with_metadata(mut self, metadata: EnvelopeMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_ordering_key(mut self, key: impl Into<String>) -> Self {
        self.metadata.ordering_key = Some(key.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: CorrelationId) -> Self {
        self.metadata.correlation_id = Some(correlation_id);
        self
    }

    pub fn action(&self) -> &str {
        &self.action
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn metadata(&self) -> &EnvelopeMetadata {
        &self.metadata
    }

    pub fn event_id(&self) -> EventId {
        self.metadata.event_id
    }

    pub fn ordering_key(&self) -> Option<&str> {
        self.metadata.ordering_key.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_json_encodes_payload() {
        let env = Envelope::from_json("UserDeleted", &serde_json::json!({ "userID": "u1" })).unwrap();
        assert_eq!(env.action(), "UserDeleted");
        assert_eq!(env.payload(), br#"{"userID":"u1"}"#);
        assert_eq!(env.ordering_key(), None);
    }

    #[test]
    fn each_envelope_gets_its_own_event_id() {
        let a = Envelope::new("UserDeleted", "{}");
        let b = Envelope::new("UserDeleted", "{}");
        assert_ne!(a.event_id(), b.event_id());
    }
}
