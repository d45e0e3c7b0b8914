/// Per-session context: one of these exists per connected socket,
/// created on connect and torn down on disconnect. It owns the
/// pending-call registry, the key-exchange state (single-writer lock),
/// the secure channel and the dispatcher, and routes every inbound
/// envelope to the right component.
///
/// Failures are local to the affected peer: a handshake or call failure
/// with one bot never disturbs the others served by the same session.
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::dispatch::{Context, Dispatcher};
use crate::envelope::{Body, Envelope, InboundKind};
use crate::error::ProtocolError;
use crate::handshake::{HandshakeAction, HandshakePhase, HandshakeStage, KeyExchange};
use crate::registry::{PendingCalls, PendingReply};
use crate::secure::SecureChannel;
use crate::token::{TokenRecord, TokenRefresher};
use crate::transport::Transport;
use crate::types::{CorrelationId, PeerId};

/// Operation name of the token-refresh round-trip.
pub const REFRESH_OPERATION: &str = "refreshAccessToken";

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub local_id: PeerId,
    /// Deadline for every registered call. Mandatory — there is no
    /// unbounded wait.
    pub call_timeout: Duration,
    /// Deadline for an in-flight handshake attempt.
    pub handshake_timeout: Duration,
}

impl SessionConfig {
    pub fn new(local_id: PeerId) -> Self {
        Self {
            local_id,
            call_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(30),
        }
    }
}

/// Plaintext connection notifications fired by the transport. Consumed
/// by bootstrap code; the core only reacts to disconnects.
#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    Connected,
    Ready,
    Disconnected { reason: String },
    SocketError { reason: String },
    ReadyToFetch,
}

pub struct Session {
    config: SessionConfig,
    calls: Arc<PendingCalls>,
    exchange: Arc<Mutex<KeyExchange>>,
    secure: SecureChannel,
    dispatcher: Arc<Dispatcher>,
    transport: Arc<dyn Transport>,
}

impl Session {
    pub fn new(
        config: SessionConfig,
        transport: Arc<dyn Transport>,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        let calls = Arc::new(PendingCalls::new());
        let exchange = Arc::new(Mutex::new(KeyExchange::new(config.local_id.clone())));
        let secure = SecureChannel::new(
            config.local_id.clone(),
            exchange.clone(),
            calls.clone(),
            transport.clone(),
        );
        Self {
            config,
            calls,
            exchange,
            secure,
            dispatcher,
            transport,
        }
    }

    pub fn local_id(&self) -> &PeerId {
        &self.config.local_id
    }

    pub fn pending_calls(&self) -> usize {
        self.calls.len()
    }

    // ── Outbound calls ─────────────────────────────────────────────────

    /// Plaintext correlated call. Control/meta operations only — data
    /// traffic belongs on `call_secure`.
    pub async fn call(
        &self,
        receiver: &PeerId,
        operation: &str,
        body: Body,
    ) -> Result<Envelope, ProtocolError> {
        let envelope = Envelope::call(
            self.config.local_id.clone(),
            receiver.clone(),
            operation,
            body,
        );
        let pending = self.calls.register(
            envelope.query_id.clone(),
            receiver.clone(),
            self.config.call_timeout,
        )?;
        if let Err(e) = self.transport.deliver(envelope).await {
            self.calls.cancel(pending.correlation_id());
            return Err(e);
        }
        self.await_reply(pending).await
    }

    /// Encrypted correlated call over the secure channel. Fails with
    /// `ChannelNotSecure` until the handshake with `receiver` finishes.
    /// The reply body is returned decrypted.
    pub async fn call_secure(
        &self,
        receiver: &PeerId,
        operation: &str,
        body: Body,
    ) -> Result<Envelope, ProtocolError> {
        let pending = self
            .secure
            .encrypt_and_send(receiver, operation, &body, self.config.call_timeout)
            .await?;
        let mut reply = self.await_reply(pending).await?;
        if reply.encrypted {
            reply.body = self.secure.decrypt_received(&reply)?;
            reply.encrypted = false;
        }
        Ok(reply)
    }

    /// Cancel a still-pending call. Idempotent against a racing reply.
    pub fn cancel(&self, correlation_id: &CorrelationId) -> bool {
        self.calls.cancel(correlation_id)
    }

    // ── Handshake ──────────────────────────────────────────────────────

    /// Start a key exchange with `peer`. Completion is event-driven:
    /// inbound handshake envelopes advance the state machine until
    /// `handshake_phase(peer)` reaches `Secure`.
    pub async fn initiate_handshake(&self, peer: &PeerId) -> Result<(), ProtocolError> {
        let action = self
            .exchange
            .lock()
            .expect("key-exchange lock poisoned")
            .initiate(peer)?;
        self.send_action(action).await
    }

    pub fn handshake_phase(&self, peer: &PeerId) -> HandshakePhase {
        self.exchange
            .lock()
            .expect("key-exchange lock poisoned")
            .phase(peer)
    }

    pub fn is_secure(&self, peer: &PeerId) -> bool {
        self.handshake_phase(peer) == HandshakePhase::Secure
    }

    // ── Inbound routing ────────────────────────────────────────────────

    /// Route one inbound envelope: handshake messages feed the key
    /// exchange, replies resolve pending calls, fresh calls are
    /// decrypted and dispatched.
    pub async fn handle_inbound(&self, mut envelope: Envelope) -> Result<(), ProtocolError> {
        envelope.mark_reached();
        envelope.validate()?;

        match envelope.classify() {
            InboundKind::Handshake => self.handle_handshake(envelope).await,
            InboundKind::Reply => {
                self.handle_reply(envelope);
                Ok(())
            }
            InboundKind::Call => self.handle_call(envelope).await,
        }
    }

    /// Lifecycle notification for the socket carrying `peer`. On
    /// disconnect, every pending call for that peer is rejected with
    /// `ConnectionLost` and its key state resets to `Idle`.
    pub fn handle_lifecycle(&self, peer: &PeerId, event: LifecycleEvent) {
        match event {
            LifecycleEvent::Disconnected { reason } => {
                tracing::info!("socket to {peer} disconnected: {reason}");
                self.on_disconnect(peer);
            }
            LifecycleEvent::SocketError { reason } => {
                tracing::warn!("socket error from {peer}: {reason}");
            }
            LifecycleEvent::Connected | LifecycleEvent::Ready | LifecycleEvent::ReadyToFetch => {
                tracing::debug!("lifecycle event from {peer}: {event:?}");
            }
        }
    }

    /// Periodic maintenance: expire overdue calls and stale handshakes.
    pub fn tick(&self) {
        self.calls.expire();
        self.exchange
            .lock()
            .expect("key-exchange lock poisoned")
            .expire(self.config.handshake_timeout);
    }

    /// Build the refresh collaborator for the token manager, performing
    /// the refresh round-trip against `auth_peer` over this session's
    /// registry and transport.
    pub fn token_refresher(&self, auth_peer: PeerId) -> SocketTokenRefresher {
        SocketTokenRefresher {
            local: self.config.local_id.clone(),
            auth_peer,
            calls: self.calls.clone(),
            transport: self.transport.clone(),
            timeout: self.config.call_timeout,
        }
    }

    // ── Internal ───────────────────────────────────────────────────────

    fn on_disconnect(&self, peer: &PeerId) {
        let rejected = self.calls.reject_peer(peer);
        if rejected > 0 {
            tracing::debug!("rejected {rejected} pending calls to {peer}");
        }
        self.exchange
            .lock()
            .expect("key-exchange lock poisoned")
            .reset(peer);
    }

    async fn await_reply(&self, pending: PendingReply) -> Result<Envelope, ProtocolError> {
        let correlation_id = pending.correlation_id().clone();
        match tokio::time::timeout(self.config.call_timeout, pending.wait()).await {
            Ok(outcome) => outcome,
            Err(_) => {
                self.calls.cancel(&correlation_id);
                Err(ProtocolError::Timeout(correlation_id))
            }
        }
    }

    fn handle_reply(&self, envelope: Envelope) {
        let promise_id = envelope
            .promise_id
            .clone()
            .expect("classified replies always carry a promise id");
        match envelope.error.clone() {
            Some(message) => {
                self.calls.reject(&promise_id, ProtocolError::Remote(message));
            }
            None => {
                self.calls.resolve(&promise_id, envelope);
            }
        }
    }

    async fn handle_handshake(&self, envelope: Envelope) -> Result<(), ProtocolError> {
        let flags = envelope
            .handshake
            .expect("classified handshake envelopes always carry flags");
        let stage = flags.stage()?;
        let sender = envelope.sender.clone();

        // Transitions run under the key-exchange lock; sends happen
        // after it is released.
        let actions: Vec<HandshakeAction> = {
            let mut exchange = self.exchange.lock().expect("key-exchange lock poisoned");
            match stage {
                HandshakeStage::NewKey => {
                    let public_key = Self::key_bytes(&envelope.body)?;
                    if exchange.phase(&sender) == HandshakePhase::AwaitingNewKey {
                        // Answer to our own offer: derive and probe.
                        exchange.peer_key_received(&sender, public_key)?;
                        vec![exchange.send_encrypted_probe(&sender)?]
                    } else {
                        vec![exchange.respond(&sender, public_key)?]
                    }
                }
                HandshakeStage::ImportKey => {
                    let Body::Bytes(bytes) = &envelope.body else {
                        return Err(ProtocolError::InvalidEnvelope {
                            reason: "probe without byte body".into(),
                        });
                    };
                    let sealed = crate::crypto::SealedBody::from_bytes(bytes)?;
                    let ack = exchange.probe_received(&sender, &sealed)?;
                    let read_ack = exchange.confirm_read(&sender)?;
                    vec![ack, read_ack]
                }
                HandshakeStage::MessageReceived => {
                    exchange.probe_acknowledged(&sender)?;
                    Vec::new()
                }
                HandshakeStage::MessageRead => {
                    exchange.read_confirmed(&sender)?;
                    vec![exchange.finalize(&sender)?]
                }
                HandshakeStage::ProcessFinished => {
                    exchange.finish_received(&sender)?;
                    Vec::new()
                }
            }
        };

        for action in actions {
            self.send_action(action).await?;
        }
        Ok(())
    }

    async fn handle_call(&self, mut envelope: Envelope) -> Result<(), ProtocolError> {
        let caller = envelope.sender.clone();
        let was_encrypted = envelope.encrypted;

        let body = if was_encrypted {
            match self.secure.decrypt_received(&envelope) {
                Ok(body) => body,
                Err(e) => {
                    tracing::warn!("decrypt failed from {caller}: {e}");
                    let reply = envelope.reply_error(e.to_string());
                    self.transport.deliver(reply).await?;
                    return Err(e);
                }
            }
        } else {
            envelope.body.clone()
        };

        let Some(operation) = envelope.operation.clone() else {
            let reply = envelope.reply_error("missing operation name");
            self.transport.deliver(reply).await?;
            return Err(ProtocolError::InvalidEnvelope {
                reason: "call without operation name".into(),
            });
        };

        envelope.mark_read();
        let ctx = Context::new(caller.clone(), operation, body, was_encrypted);

        // Handler and middleware failures become error replies; they are
        // never fatal to the session.
        match self.dispatcher.dispatch(ctx).await {
            Ok(result) => {
                let mut reply = envelope.reply(result);
                if was_encrypted {
                    self.secure.encrypt_reply(&caller, &mut reply)?;
                }
                self.transport.deliver(reply).await
            }
            Err(e) => {
                tracing::debug!("operation failed for {caller}: {e}");
                let reply = envelope.reply_error(e.to_string());
                self.transport.deliver(reply).await
            }
        }
    }

    async fn send_action(&self, action: HandshakeAction) -> Result<(), ProtocolError> {
        let local = self.config.local_id.clone();
        let envelope = match action {
            HandshakeAction::SendKey {
                to,
                public_key,
                flags,
            } => Envelope::handshake(local, to, flags, Body::Bytes(public_key.to_vec())),
            HandshakeAction::SendProbe { to, sealed, flags } => {
                Envelope::handshake(local, to, flags, Body::Bytes(sealed.to_bytes()?))
            }
            HandshakeAction::SendAck { to, flags }
            | HandshakeAction::SendReadAck { to, flags }
            | HandshakeAction::SendFinish { to, flags } => {
                Envelope::handshake(local, to, flags, Body::empty())
            }
        };
        self.transport.deliver(envelope).await
    }

    fn key_bytes(body: &Body) -> Result<[u8; 32], ProtocolError> {
        let Body::Bytes(bytes) = body else {
            return Err(ProtocolError::InvalidEnvelope {
                reason: "key offer without byte body".into(),
            });
        };
        bytes
            .as_slice()
            .try_into()
            .map_err(|_| ProtocolError::InvalidEnvelope {
                reason: format!("public key must be 32 bytes, got {}", bytes.len()),
            })
    }
}

/// Token refresh over the socket: a correlated plaintext call to the
/// auth peer carrying the current refresh token, answered with the
/// rotated record.
pub struct SocketTokenRefresher {
    local: PeerId,
    auth_peer: PeerId,
    calls: Arc<PendingCalls>,
    transport: Arc<dyn Transport>,
    timeout: Duration,
}

#[async_trait::async_trait]
impl TokenRefresher for SocketTokenRefresher {
    async fn refresh(&self, refresh_token: &str) -> Result<TokenRecord, ProtocolError> {
        let body = Body::record(serde_json::json!({ "refreshToken": refresh_token }))?;
        let envelope = Envelope::call(
            self.local.clone(),
            self.auth_peer.clone(),
            REFRESH_OPERATION,
            body,
        );
        let pending = self.calls.register(
            envelope.query_id.clone(),
            self.auth_peer.clone(),
            self.timeout,
        )?;
        if let Err(e) = self.transport.deliver(envelope).await {
            self.calls.cancel(pending.correlation_id());
            return Err(e);
        }

        let correlation_id = pending.correlation_id().clone();
        let reply = match tokio::time::timeout(self.timeout, pending.wait()).await {
            Ok(outcome) => outcome?,
            Err(_) => {
                self.calls.cancel(&correlation_id);
                return Err(ProtocolError::Timeout(correlation_id));
            }
        };

        let Body::Record(value) = reply.body else {
            return Err(ProtocolError::Deserialization(
                "refresh reply is not a record".into(),
            ));
        };
        serde_json::from_value(value).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}
