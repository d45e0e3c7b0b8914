/// Secure channel: per-envelope encryption over the pending-call
/// registry, gated on the key exchange having reached `Secure`.
///
/// Plaintext control traffic (lifecycle notifications, the handshake
/// itself) never passes through this component.
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::crypto::{self, SealedBody};
use crate::envelope::{Body, Envelope};
use crate::error::ProtocolError;
use crate::handshake::KeyExchange;
use crate::registry::{PendingCalls, PendingReply};
use crate::transport::Transport;
use crate::types::PeerId;

pub struct SecureChannel {
    local: PeerId,
    exchange: Arc<Mutex<KeyExchange>>,
    calls: Arc<PendingCalls>,
    transport: Arc<dyn Transport>,
}

impl SecureChannel {
    pub fn new(
        local: PeerId,
        exchange: Arc<Mutex<KeyExchange>>,
        calls: Arc<PendingCalls>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            local,
            exchange,
            calls,
            transport,
        }
    }

    /// Seal a call body for `receiver`, register the correlation and
    /// hand the envelope to the transport.
    ///
    /// Fails with `ChannelNotSecure` unless the peer's handshake phase
    /// is `Secure`. The registration is rolled back if delivery fails.
    pub async fn encrypt_and_send(
        &self,
        receiver: &PeerId,
        operation: &str,
        body: &Body,
        timeout: Duration,
    ) -> Result<PendingReply, ProtocolError> {
        let key = self
            .exchange
            .lock()
            .expect("key-exchange lock poisoned")
            .secure_key(receiver)
            .ok_or_else(|| ProtocolError::ChannelNotSecure(receiver.clone()))?;

        let sealed = crypto::seal(&key, &body.to_bytes()?)?;
        let mut envelope = Envelope::call(
            self.local.clone(),
            receiver.clone(),
            operation,
            Body::Bytes(sealed.to_bytes()?),
        );
        envelope.encrypted = true;

        let pending = self
            .calls
            .register(envelope.query_id.clone(), receiver.clone(), timeout)?;

        if let Err(e) = self.transport.deliver(envelope).await {
            self.calls.cancel(pending.correlation_id());
            return Err(e);
        }
        Ok(pending)
    }

    /// Seal a reply body for `receiver`. Replies reuse the caller's
    /// channel key; no correlation entry is registered.
    pub fn encrypt_reply(
        &self,
        receiver: &PeerId,
        reply: &mut Envelope,
    ) -> Result<(), ProtocolError> {
        let key = self
            .exchange
            .lock()
            .expect("key-exchange lock poisoned")
            .secure_key(receiver)
            .ok_or_else(|| ProtocolError::ChannelNotSecure(receiver.clone()))?;

        let sealed = crypto::seal(&key, &reply.body.to_bytes()?)?;
        reply.body = Body::Bytes(sealed.to_bytes()?);
        reply.encrypted = true;
        Ok(())
    }

    /// Decrypt an inbound encrypted envelope's body.
    ///
    /// `DecryptionFailed` (stale key, tampered or malformed ciphertext)
    /// is reported to the caller, never swallowed — the caller decides
    /// whether to drop the connection or re-handshake.
    pub fn decrypt_received(&self, envelope: &Envelope) -> Result<Body, ProtocolError> {
        if !envelope.encrypted {
            return Ok(envelope.body.clone());
        }

        let key = self
            .exchange
            .lock()
            .expect("key-exchange lock poisoned")
            .secure_key(&envelope.sender)
            .ok_or_else(|| ProtocolError::ChannelNotSecure(envelope.sender.clone()))?;

        let Body::Bytes(bytes) = &envelope.body else {
            return Err(ProtocolError::DecryptionFailed(
                "encrypted envelope without byte body".into(),
            ));
        };
        let sealed = SealedBody::from_bytes(bytes)?;
        let plaintext = crypto::open(&key, &sealed)?;
        Body::from_bytes(&plaintext)
            .map_err(|e| ProtocolError::DecryptionFailed(format!("bad plaintext body: {e}")))
    }
}
