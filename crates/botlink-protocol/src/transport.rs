use crate::envelope::Envelope;
use crate::error::ProtocolError;

/// Outbound half of the transport collaborator.
///
/// The transport delivers whole envelopes — the core never frames or
/// fragments bytes. Inbound envelopes are pushed into the session via
/// `Session::handle_inbound`.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    async fn deliver(&self, envelope: Envelope) -> Result<(), ProtocolError>;
}
