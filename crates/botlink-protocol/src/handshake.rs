/// Key-exchange state machine.
///
/// One `PeerKeyState` per remote peer, advancing through the phases
/// `Idle → AwaitingNewKey → KeySent → AwaitingImport → AwaitingAck →
/// AwaitingReadAck → Secure` (terminal) or `Failed` (terminal). The
/// wire-visible progress markers (`HandshakeFlags`) are cumulative and
/// strictly monotonic within one attempt; a restart creates a fresh
/// state with all markers unset.
///
/// Pure logic — every transition returns a `HandshakeAction` for the
/// caller to turn into an outbound envelope. No I/O, no transport.
use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::crypto::{self, SealedBody, SharedKey};
use crate::error::ProtocolError;
use crate::types::PeerId;

/// Wire-visible handshake progress markers.
///
/// These are cumulative: a later marker implies every earlier one. The
/// source of truth is the phase; the flags exist so the peer can route
/// a handshake envelope without shared state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeFlags {
    #[serde(default)]
    pub new_key: bool,
    #[serde(default)]
    pub import_key: bool,
    #[serde(default)]
    pub message_received: bool,
    #[serde(default)]
    pub message_read: bool,
    #[serde(default)]
    pub process_finished: bool,
}

/// The handshake step a flag set denotes — its highest marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HandshakeStage {
    NewKey,
    ImportKey,
    MessageReceived,
    MessageRead,
    ProcessFinished,
}

impl HandshakeFlags {
    /// Cumulative flag set up to and including `stage`.
    pub fn up_to(stage: HandshakeStage) -> Self {
        Self {
            new_key: stage >= HandshakeStage::NewKey,
            import_key: stage >= HandshakeStage::ImportKey,
            message_received: stage >= HandshakeStage::MessageReceived,
            message_read: stage >= HandshakeStage::MessageRead,
            process_finished: stage >= HandshakeStage::ProcessFinished,
        }
    }

    /// A later marker must imply every earlier one. The raw wire type
    /// allows invalid combinations; they are rejected, not normalized.
    pub fn is_well_formed(&self) -> bool {
        let order = [
            self.new_key,
            self.import_key,
            self.message_received,
            self.message_read,
            self.process_finished,
        ];
        order.windows(2).all(|pair| pair[0] || !pair[1])
    }

    /// The stage this flag set denotes. Fails on an empty or gapped set.
    pub fn stage(&self) -> Result<HandshakeStage, ProtocolError> {
        if !self.is_well_formed() {
            return Err(ProtocolError::InvalidEnvelope {
                reason: format!("non-monotonic handshake flags: {self:?}"),
            });
        }
        if self.process_finished {
            Ok(HandshakeStage::ProcessFinished)
        } else if self.message_read {
            Ok(HandshakeStage::MessageRead)
        } else if self.message_received {
            Ok(HandshakeStage::MessageReceived)
        } else if self.import_key {
            Ok(HandshakeStage::ImportKey)
        } else if self.new_key {
            Ok(HandshakeStage::NewKey)
        } else {
            Err(ProtocolError::InvalidEnvelope {
                reason: "empty handshake flags".into(),
            })
        }
    }
}

/// Named step in establishing a shared secret with a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakePhase {
    /// No handshake attempt exists for this peer.
    Idle,
    /// Initiator: key pair generated and offered, waiting for the
    /// peer's public key.
    AwaitingNewKey,
    /// Both public keys exchanged, shared secret derived.
    KeySent,
    /// Initiator: encrypted probe sent, waiting for the receipt ack.
    AwaitingImport,
    /// Probe receipt confirmed (`message_received`).
    AwaitingAck,
    /// Probe processing confirmed (`message_read`).
    AwaitingReadAck,
    /// Terminal: the shared secret is usable by the secure channel.
    Secure,
    /// Terminal: restart from `Idle` required. No key material retained.
    Failed,
}

impl HandshakePhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, HandshakePhase::Secure | HandshakePhase::Failed)
    }
}

/// What the caller must send to the peer after a transition.
#[derive(Debug)]
pub enum HandshakeAction {
    /// Our public key, with `new_key` set.
    SendKey {
        to: PeerId,
        public_key: [u8; 32],
        flags: HandshakeFlags,
    },
    /// An encrypted challenge proving possession of the derived secret.
    SendProbe {
        to: PeerId,
        sealed: SealedBody,
        flags: HandshakeFlags,
    },
    /// Probe receipt confirmation (`message_received`).
    SendAck { to: PeerId, flags: HandshakeFlags },
    /// Probe processing confirmation (`message_read`).
    SendReadAck { to: PeerId, flags: HandshakeFlags },
    /// Handshake completion (`process_finished`).
    SendFinish { to: PeerId, flags: HandshakeFlags },
}

/// Per-peer handshake state. Exactly one instance per remote peer,
/// owned by the `KeyExchange` under a single-writer discipline.
pub struct PeerKeyState {
    peer: PeerId,
    phase: HandshakePhase,
    flags: HandshakeFlags,
    local_secret: Option<StaticSecret>,
    peer_public: Option<PublicKey>,
    shared: Option<SharedKey>,
    last_updated: Instant,
}

impl PeerKeyState {
    fn fresh(peer: PeerId) -> Self {
        Self {
            peer,
            phase: HandshakePhase::Idle,
            flags: HandshakeFlags::default(),
            local_secret: None,
            peer_public: None,
            shared: None,
            last_updated: Instant::now(),
        }
    }

    pub fn phase(&self) -> HandshakePhase {
        self.phase
    }

    pub fn flags(&self) -> HandshakeFlags {
        self.flags
    }

    fn advance(&mut self, phase: HandshakePhase, stage: HandshakeStage) {
        self.phase = phase;
        self.flags = HandshakeFlags::up_to(stage);
        self.last_updated = Instant::now();
    }

    /// Drop all key material. No partial secret is ever exposed.
    fn clear_secrets(&mut self) {
        self.local_secret = None;
        self.peer_public = None;
        self.shared = None;
    }
}

impl fmt::Debug for PeerKeyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerKeyState")
            .field("peer", &self.peer)
            .field("phase", &self.phase)
            .field("flags", &self.flags)
            .finish_non_exhaustive()
    }
}

/// The key-exchange state machine for all peers of one session.
///
/// Only one handshake attempt per peer pair may be in flight; a second
/// `initiate` while not `Idle`/`Failed` fails with `HandshakeInProgress`.
pub struct KeyExchange {
    local: PeerId,
    states: HashMap<PeerId, PeerKeyState>,
}

impl KeyExchange {
    pub fn new(local: PeerId) -> Self {
        Self {
            local,
            states: HashMap::new(),
        }
    }

    pub fn local_id(&self) -> &PeerId {
        &self.local
    }

    /// Current phase for a peer. `Idle` if no attempt exists.
    pub fn phase(&self, peer: &PeerId) -> HandshakePhase {
        self.states
            .get(peer)
            .map(|s| s.phase)
            .unwrap_or(HandshakePhase::Idle)
    }

    /// Current wire flags for a peer's attempt.
    pub fn flags(&self, peer: &PeerId) -> HandshakeFlags {
        self.states
            .get(peer)
            .map(|s| s.flags)
            .unwrap_or_default()
    }

    pub fn is_secure(&self, peer: &PeerId) -> bool {
        self.phase(peer) == HandshakePhase::Secure
    }

    /// Immutable snapshot of the shared key, only once `Secure`.
    pub fn secure_key(&self, peer: &PeerId) -> Option<SharedKey> {
        let state = self.states.get(peer)?;
        if state.phase == HandshakePhase::Secure {
            state.shared.clone()
        } else {
            None
        }
    }

    // ── Initiator transitions ──────────────────────────────────────────

    /// Start a handshake: generate a key pair and offer the public key.
    pub fn initiate(&mut self, peer: &PeerId) -> Result<HandshakeAction, ProtocolError> {
        if let Some(state) = self.states.get(peer) {
            if !matches!(state.phase, HandshakePhase::Idle | HandshakePhase::Failed) {
                return Err(ProtocolError::HandshakeInProgress(peer.clone()));
            }
        }

        let (secret, public) = crypto::generate_key_pair();
        let mut state = PeerKeyState::fresh(peer.clone());
        state.local_secret = Some(secret);
        state.advance(HandshakePhase::AwaitingNewKey, HandshakeStage::NewKey);
        self.states.insert(peer.clone(), state);

        Ok(HandshakeAction::SendKey {
            to: peer.clone(),
            public_key: public.to_bytes(),
            flags: HandshakeFlags::up_to(HandshakeStage::NewKey),
        })
    }

    /// The peer answered our key offer with its own public key.
    pub fn peer_key_received(
        &mut self,
        peer: &PeerId,
        peer_public: [u8; 32],
    ) -> Result<(), ProtocolError> {
        let state = self.expect_state(peer)?;
        if state.phase != HandshakePhase::AwaitingNewKey {
            return Err(Self::unexpected(state, "peer key"));
        }

        let public = PublicKey::from(peer_public);
        let secret = state
            .local_secret
            .as_ref()
            .expect("AwaitingNewKey state always holds a local secret");
        state.shared = Some(crypto::derive_shared_key(secret, &public));
        state.peer_public = Some(public);
        state.advance(HandshakePhase::KeySent, HandshakeStage::NewKey);
        Ok(())
    }

    /// Send a small encrypted challenge proving possession of the
    /// derived secret.
    pub fn send_encrypted_probe(&mut self, peer: &PeerId) -> Result<HandshakeAction, ProtocolError> {
        let state = self.expect_state(peer)?;
        if state.phase != HandshakePhase::KeySent {
            return Err(Self::unexpected(state, "probe request"));
        }

        let key = state
            .shared
            .as_ref()
            .expect("KeySent state always holds a shared key");
        let sealed = crypto::seal(key, &crypto::probe_challenge())?;
        state.advance(HandshakePhase::AwaitingImport, HandshakeStage::ImportKey);

        Ok(HandshakeAction::SendProbe {
            to: peer.clone(),
            sealed,
            flags: HandshakeFlags::up_to(HandshakeStage::ImportKey),
        })
    }

    /// The peer decrypted our probe and confirmed receipt.
    pub fn probe_acknowledged(&mut self, peer: &PeerId) -> Result<(), ProtocolError> {
        let state = self.expect_state(peer)?;
        if state.phase != HandshakePhase::AwaitingImport {
            return Err(Self::unexpected(state, "probe ack"));
        }
        state.advance(HandshakePhase::AwaitingAck, HandshakeStage::MessageReceived);
        Ok(())
    }

    /// The peer confirmed it processed (not merely received) the probe.
    pub fn read_confirmed(&mut self, peer: &PeerId) -> Result<(), ProtocolError> {
        let state = self.expect_state(peer)?;
        if state.phase != HandshakePhase::AwaitingAck {
            return Err(Self::unexpected(state, "read ack"));
        }
        state.advance(HandshakePhase::AwaitingReadAck, HandshakeStage::MessageRead);
        Ok(())
    }

    /// Close out the attempt; the shared key becomes usable.
    pub fn finalize(&mut self, peer: &PeerId) -> Result<HandshakeAction, ProtocolError> {
        let state = self.expect_state(peer)?;
        if state.phase != HandshakePhase::AwaitingReadAck {
            return Err(Self::unexpected(state, "finalize"));
        }
        state.advance(HandshakePhase::Secure, HandshakeStage::ProcessFinished);

        Ok(HandshakeAction::SendFinish {
            to: peer.clone(),
            flags: HandshakeFlags::up_to(HandshakeStage::ProcessFinished),
        })
    }

    // ── Responder transitions ──────────────────────────────────────────

    /// A peer offered a new key: generate our pair, derive the secret,
    /// answer with our public key. A new offer supersedes any prior
    /// attempt with that peer — the initiator restarted from `Idle`.
    pub fn respond(
        &mut self,
        peer: &PeerId,
        peer_public: [u8; 32],
    ) -> Result<HandshakeAction, ProtocolError> {
        let (secret, public) = crypto::generate_key_pair();
        let peer_key = PublicKey::from(peer_public);

        let mut state = PeerKeyState::fresh(peer.clone());
        state.shared = Some(crypto::derive_shared_key(&secret, &peer_key));
        state.local_secret = Some(secret);
        state.peer_public = Some(peer_key);
        state.advance(HandshakePhase::KeySent, HandshakeStage::NewKey);
        self.states.insert(peer.clone(), state);

        Ok(HandshakeAction::SendKey {
            to: peer.clone(),
            public_key: public.to_bytes(),
            flags: HandshakeFlags::up_to(HandshakeStage::NewKey),
        })
    }

    /// The initiator's encrypted probe arrived: decrypt it to verify the
    /// derived secret matches, then confirm receipt.
    pub fn probe_received(
        &mut self,
        peer: &PeerId,
        sealed: &SealedBody,
    ) -> Result<HandshakeAction, ProtocolError> {
        let state = self.expect_state(peer)?;
        if state.phase != HandshakePhase::KeySent {
            return Err(Self::unexpected(state, "probe"));
        }

        let key = state
            .shared
            .as_ref()
            .expect("KeySent state always holds a shared key");
        if let Err(e) = crypto::open(key, sealed) {
            let reason = format!("probe verification failed: {e}");
            state.phase = HandshakePhase::Failed;
            state.clear_secrets();
            tracing::warn!("handshake with {peer} failed: {reason}");
            return Err(ProtocolError::HandshakeFailed {
                peer: peer.clone(),
                reason,
            });
        }

        state.advance(HandshakePhase::AwaitingAck, HandshakeStage::MessageReceived);
        Ok(HandshakeAction::SendAck {
            to: peer.clone(),
            flags: HandshakeFlags::up_to(HandshakeStage::MessageReceived),
        })
    }

    /// We processed the probe — confirm that to the initiator.
    pub fn confirm_read(&mut self, peer: &PeerId) -> Result<HandshakeAction, ProtocolError> {
        let state = self.expect_state(peer)?;
        if state.phase != HandshakePhase::AwaitingAck {
            return Err(Self::unexpected(state, "read confirmation"));
        }
        state.advance(HandshakePhase::AwaitingReadAck, HandshakeStage::MessageRead);

        Ok(HandshakeAction::SendReadAck {
            to: peer.clone(),
            flags: HandshakeFlags::up_to(HandshakeStage::MessageRead),
        })
    }

    /// The initiator finished the attempt; the shared key is live.
    pub fn finish_received(&mut self, peer: &PeerId) -> Result<(), ProtocolError> {
        let state = self.expect_state(peer)?;
        if state.phase != HandshakePhase::AwaitingReadAck {
            return Err(Self::unexpected(state, "finish"));
        }
        state.advance(HandshakePhase::Secure, HandshakeStage::ProcessFinished);
        Ok(())
    }

    // ── Failure / lifecycle ────────────────────────────────────────────

    /// Fail the attempt with a peer. All key material is dropped.
    pub fn fail(&mut self, peer: &PeerId, reason: &str) {
        if let Some(state) = self.states.get_mut(peer) {
            tracing::warn!("handshake with {peer} failed: {reason}");
            state.phase = HandshakePhase::Failed;
            state.clear_secrets();
            state.last_updated = Instant::now();
        }
    }

    /// Reset a peer to `Idle` (disconnect teardown).
    pub fn reset(&mut self, peer: &PeerId) {
        self.states.remove(peer);
    }

    pub fn reset_all(&mut self) {
        self.states.clear();
    }

    /// Fail every in-flight attempt older than `timeout`. Returns the
    /// affected peers.
    pub fn expire(&mut self, timeout: Duration) -> Vec<PeerId> {
        let now = Instant::now();
        let stale: Vec<PeerId> = self
            .states
            .values()
            .filter(|s| {
                !s.phase.is_terminal()
                    && s.phase != HandshakePhase::Idle
                    && now.duration_since(s.last_updated) >= timeout
            })
            .map(|s| s.peer.clone())
            .collect();
        for peer in &stale {
            self.fail(peer, "handshake timed out");
        }
        stale
    }

    // ── Internal ───────────────────────────────────────────────────────

    fn expect_state(&mut self, peer: &PeerId) -> Result<&mut PeerKeyState, ProtocolError> {
        self.states
            .get_mut(peer)
            .ok_or_else(|| ProtocolError::HandshakeFailed {
                peer: peer.clone(),
                reason: "no handshake in flight".into(),
            })
    }

    /// A message arrived in a phase that cannot accept it. An in-flight
    /// attempt fails; a `Secure` channel is never downgraded by a stray
    /// or replayed handshake message.
    fn unexpected(state: &mut PeerKeyState, event: &str) -> ProtocolError {
        let phase = state.phase;
        if phase != HandshakePhase::Secure {
            state.phase = HandshakePhase::Failed;
            state.clear_secrets();
            state.last_updated = Instant::now();
        }
        ProtocolError::HandshakeFailed {
            peer: state.peer.clone(),
            reason: format!("unexpected {event} in phase {phase:?}"),
        }
    }
}
