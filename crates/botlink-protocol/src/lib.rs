//! Botlink protocol layer.
//!
//! Implements the hub↔bot socket RPC: correlated request/reply
//! envelopes, a key-exchange handshake establishing a per-peer shared
//! secret, encrypted payload transfer, token lifecycle management and
//! operation dispatch.
//!
//! Wire format: MessagePack (compact binary).
//! Crypto: X25519 key agreement + XChaCha20-Poly1305 encryption.

pub mod crypto;
pub mod dispatch;
pub mod envelope;
pub mod error;
pub mod handshake;
pub mod registry;
pub mod secure;
pub mod session;
pub mod token;
pub mod transport;
pub mod types;

pub use crypto::{SealedBody, SharedKey};
pub use dispatch::{ChannelKind, Context, Dispatcher, Middleware, OperationHandler, SyncHandler};
pub use envelope::{Body, Envelope, InboundKind};
pub use error::ProtocolError;
pub use handshake::{
    HandshakeAction, HandshakeFlags, HandshakePhase, HandshakeStage, KeyExchange,
};
pub use registry::{PendingCalls, PendingReply};
pub use secure::SecureChannel;
pub use session::{
    LifecycleEvent, Session, SessionConfig, SocketTokenRefresher, REFRESH_OPERATION,
};
pub use token::{TokenManager, TokenRecord, TokenRefresher, TokenStore, DEFAULT_RENEWAL_SKEW};
pub use transport::Transport;
pub use types::{now_ms, CorrelationId, PeerId};
