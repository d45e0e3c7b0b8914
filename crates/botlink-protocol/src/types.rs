use std::fmt;

use serde::{Deserialize, Serialize};

/// An addressable endpoint — the hub or a named bot.
///
/// Peers are identified by name on the wire (`sender`/`receiver`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

/// Opaque identifier linking a request envelope to its eventual reply.
///
/// Generated as UUID v4 at send time; globally unique per originating
/// peer for the lifetime of the pending call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Generate a fresh correlation id (UUID v4).
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CorrelationId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Current Unix time in milliseconds.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system time before epoch")
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_id_roundtrip_msgpack() {
        let peer = PeerId::new("hub");
        let bytes = rmp_serde::to_vec(&peer).expect("serialize");
        let decoded: PeerId = rmp_serde::from_slice(&bytes).expect("deserialize");
        assert_eq!(peer, decoded);
    }

    #[test]
    fn peer_id_serializes_as_bare_string() {
        let peer = PeerId::new("bot-7");
        let json = serde_json::to_string(&peer).expect("json");
        assert_eq!(json, "\"bot-7\"");
    }

    #[test]
    fn correlation_ids_are_unique() {
        let a = CorrelationId::generate();
        let b = CorrelationId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn correlation_id_from_str() {
        let id = CorrelationId::from("q1");
        assert_eq!(id.as_str(), "q1");
        assert!(!id.is_empty());
        assert!(CorrelationId::from("").is_empty());
    }

    #[test]
    fn now_ms_is_monotonic_enough() {
        let a = now_ms();
        let b = now_ms();
        assert!(b >= a);
    }
}
