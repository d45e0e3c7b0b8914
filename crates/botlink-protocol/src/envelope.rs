use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::handshake::HandshakeFlags;
use crate::types::{now_ms, CorrelationId, PeerId};

/// An envelope body — raw bytes (sealed payloads, key material) or a
/// JSON record (operation arguments and results).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Body {
    Bytes(Vec<u8>),
    Record(serde_json::Value),
}

impl Body {
    /// An empty byte body, used by acks and control messages.
    pub fn empty() -> Self {
        Body::Bytes(Vec::new())
    }

    /// Build a record body from any serializable value.
    pub fn record(value: impl Serialize) -> Result<Self, ProtocolError> {
        let value =
            serde_json::to_value(value).map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        Ok(Body::Record(value))
    }

    /// Serialize to MessagePack bytes (the plaintext fed to the sealer).
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        rmp_serde::to_vec(self).map_err(Into::into)
    }

    /// Deserialize from MessagePack bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        rmp_serde::from_slice(data).map_err(Into::into)
    }
}

/// How an inbound envelope should be routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundKind {
    /// Carries handshake flags — feed the key-exchange state machine.
    Handshake,
    /// Carries a `promise_id` — resolve the matching pending call.
    Reply,
    /// A fresh call — decrypt if needed, then dispatch.
    Call,
}

/// The addressed, correlated message unit carried over the socket.
///
/// Serialized as MessagePack. `query_id` is the originator's correlation
/// id; a reply carries it back as `promise_id`. The `reached`/`read`
/// timestamps are stamped by the transport layer only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub sender: PeerId,
    pub receiver: PeerId,
    pub query_id: CorrelationId,
    /// On a reply: the `query_id` of the call being answered.
    pub promise_id: Option<CorrelationId>,
    /// Declared operation name for fresh calls.
    pub operation: Option<String>,
    pub body: Body,
    /// Failure outcome of the call this envelope replies to.
    pub error: Option<String>,
    /// Whether `body` is a sealed ciphertext.
    pub encrypted: bool,
    /// Handshake progress markers. Owned by the key-exchange state
    /// machine for the peer pair; absent on ordinary traffic.
    pub handshake: Option<HandshakeFlags>,
    /// Unix-ms timestamps: stamped at send / on arrival / on processing.
    pub sent: Option<u64>,
    pub reached: Option<u64>,
    pub read: Option<u64>,
}

impl Envelope {
    /// Create a fresh outbound call with a generated correlation id.
    pub fn call(
        sender: PeerId,
        receiver: PeerId,
        operation: impl Into<String>,
        body: Body,
    ) -> Self {
        Self {
            sender,
            receiver,
            query_id: CorrelationId::generate(),
            promise_id: None,
            operation: Some(operation.into()),
            body,
            error: None,
            encrypted: false,
            handshake: None,
            sent: Some(now_ms()),
            reached: None,
            read: None,
        }
    }

    /// Create a handshake envelope carrying the given progress flags.
    pub fn handshake(sender: PeerId, receiver: PeerId, flags: HandshakeFlags, body: Body) -> Self {
        Self {
            sender,
            receiver,
            query_id: CorrelationId::generate(),
            promise_id: None,
            operation: None,
            body,
            error: None,
            encrypted: false,
            handshake: Some(flags),
            sent: Some(now_ms()),
            reached: None,
            read: None,
        }
    }

    /// Build the success reply to this envelope.
    ///
    /// The reply's `promise_id` is this envelope's `query_id`, addressed
    /// back to the sender.
    pub fn reply(&self, body: Body) -> Self {
        Self {
            sender: self.receiver.clone(),
            receiver: self.sender.clone(),
            query_id: CorrelationId::generate(),
            promise_id: Some(self.query_id.clone()),
            operation: None,
            body,
            error: None,
            encrypted: false,
            handshake: None,
            sent: Some(now_ms()),
            reached: None,
            read: None,
        }
    }

    /// Build the failure reply to this envelope.
    pub fn reply_error(&self, message: impl Into<String>) -> Self {
        let mut reply = self.reply(Body::empty());
        reply.error = Some(message.into());
        reply
    }

    /// Serialize to MessagePack bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        rmp_serde::to_vec(self).map_err(Into::into)
    }

    /// Deserialize from MessagePack bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        rmp_serde::from_slice(data).map_err(Into::into)
    }

    /// Validate the addressing and flag invariants.
    ///
    /// Caller-supplied handshake flags are not trusted: a flag set with
    /// gaps in the progression (e.g. `message_read` without `new_key`)
    /// is rejected here rather than normalized downstream.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.sender.is_empty() {
            return Err(ProtocolError::InvalidEnvelope {
                reason: "empty sender".into(),
            });
        }
        if self.receiver.is_empty() {
            return Err(ProtocolError::InvalidEnvelope {
                reason: "empty receiver".into(),
            });
        }
        if self.query_id.is_empty() {
            return Err(ProtocolError::InvalidEnvelope {
                reason: "empty query id".into(),
            });
        }
        if let Some(promise_id) = &self.promise_id {
            if promise_id.is_empty() {
                return Err(ProtocolError::InvalidEnvelope {
                    reason: "empty promise id".into(),
                });
            }
        }
        if let Some(flags) = &self.handshake {
            if !flags.is_well_formed() {
                return Err(ProtocolError::InvalidEnvelope {
                    reason: format!("non-monotonic handshake flags: {flags:?}"),
                });
            }
        }
        Ok(())
    }

    /// Classify for inbound routing: handshake → key exchange,
    /// reply → pending-call registry, otherwise a fresh call.
    pub fn classify(&self) -> InboundKind {
        if self.handshake.is_some() {
            InboundKind::Handshake
        } else if self.promise_id.is_some() {
            InboundKind::Reply
        } else {
            InboundKind::Call
        }
    }

    /// Stamp the arrival timestamp. Transport layer only.
    pub fn mark_reached(&mut self) {
        self.reached = Some(now_ms());
    }

    /// Stamp the processed timestamp. Transport layer only.
    pub fn mark_read(&mut self) {
        self.read = Some(now_ms());
    }

    /// MessagePack size of this envelope in bytes.
    pub fn wire_size(&self) -> usize {
        self.to_bytes().map(|b| b.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::HandshakeStage;

    fn make_call() -> Envelope {
        Envelope::call(
            PeerId::new("bot-1"),
            PeerId::new("hub"),
            "echo",
            Body::record(serde_json::json!({"text": "hi"})).unwrap(),
        )
    }

    #[test]
    fn roundtrip_msgpack() {
        let env = make_call();
        let bytes = env.to_bytes().expect("serialize");
        let decoded = Envelope::from_bytes(&bytes).expect("deserialize");
        assert_eq!(env, decoded);
    }

    #[test]
    fn roundtrip_bytes_body() {
        let mut env = make_call();
        env.body = Body::Bytes(vec![0xAB; 4096]);
        let bytes = env.to_bytes().expect("serialize");
        let decoded = Envelope::from_bytes(&bytes).expect("deserialize");
        assert_eq!(env.body, decoded.body);
    }

    #[test]
    fn invalid_bytes_rejected() {
        assert!(Envelope::from_bytes(b"not valid msgpack").is_err());
    }

    #[test]
    fn call_generates_unique_query_ids() {
        let a = make_call();
        let b = make_call();
        assert_ne!(a.query_id, b.query_id);
    }

    #[test]
    fn call_stamps_sent() {
        let env = make_call();
        assert!(env.sent.is_some());
        assert!(env.reached.is_none());
        assert!(env.read.is_none());
    }

    #[test]
    fn reply_carries_promise_id_back() {
        let call = make_call();
        let reply = call.reply(Body::record(serde_json::json!({"ok": true})).unwrap());

        assert_eq!(reply.promise_id.as_ref(), Some(&call.query_id));
        assert_eq!(reply.sender, call.receiver);
        assert_eq!(reply.receiver, call.sender);
        assert_ne!(reply.query_id, call.query_id);
        assert!(reply.error.is_none());
    }

    #[test]
    fn reply_error_sets_error() {
        let call = make_call();
        let reply = call.reply_error("no such bot");
        assert_eq!(reply.error.as_deref(), Some("no such bot"));
        assert_eq!(reply.promise_id.as_ref(), Some(&call.query_id));
    }

    #[test]
    fn classify_call_reply_handshake() {
        let call = make_call();
        assert_eq!(call.classify(), InboundKind::Call);

        let reply = call.reply(Body::empty());
        assert_eq!(reply.classify(), InboundKind::Reply);

        let hs = Envelope::handshake(
            PeerId::new("bot-1"),
            PeerId::new("hub"),
            HandshakeFlags::up_to(HandshakeStage::NewKey),
            Body::Bytes(vec![0u8; 32]),
        );
        assert_eq!(hs.classify(), InboundKind::Handshake);
    }

    #[test]
    fn validate_rejects_empty_ids() {
        let mut env = make_call();
        env.sender = PeerId::new("");
        assert!(env.validate().is_err());

        let mut env = make_call();
        env.receiver = PeerId::new("");
        assert!(env.validate().is_err());

        let mut env = make_call();
        env.query_id = CorrelationId::from("");
        assert!(env.validate().is_err());

        let mut env = make_call();
        env.promise_id = Some(CorrelationId::from(""));
        assert!(env.validate().is_err());

        assert!(make_call().validate().is_ok());
    }

    #[test]
    fn validate_rejects_gapped_flags() {
        let mut flags = HandshakeFlags::default();
        flags.message_read = true; // set without the earlier markers

        let mut env = make_call();
        env.handshake = Some(flags);
        assert!(matches!(
            env.validate(),
            Err(ProtocolError::InvalidEnvelope { .. })
        ));
    }

    #[test]
    fn transport_stamps() {
        let mut env = make_call();
        env.mark_reached();
        env.mark_read();
        assert!(env.reached.is_some());
        assert!(env.read.is_some());
    }

    #[test]
    fn wire_size_compact_vs_json() {
        let env = make_call();
        let msgpack_size = env.wire_size();
        let json_size = serde_json::to_vec(&env).expect("json").len();
        assert!(msgpack_size < json_size);
    }

    #[test]
    fn body_record_helper() {
        #[derive(Serialize)]
        struct Args {
            count: u32,
        }
        let body = Body::record(Args { count: 3 }).unwrap();
        match body {
            Body::Record(value) => assert_eq!(value["count"], 3),
            Body::Bytes(_) => panic!("expected record"),
        }
    }

    #[test]
    fn body_roundtrip_through_bytes() {
        let body = Body::record(serde_json::json!({"nested": {"list": [1, 2, 3]}})).unwrap();
        let bytes = body.to_bytes().unwrap();
        let decoded = Body::from_bytes(&bytes).unwrap();
        assert_eq!(body, decoded);
    }
}
