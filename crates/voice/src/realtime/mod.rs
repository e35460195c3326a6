//! Upstream realtime socket abstraction.

pub mod events;
pub mod openai;

use {async_trait::async_trait, secrecy::Secret, tokio::sync::mpsc};

use crate::error::VoiceError;

/// Something that happened on the upstream socket.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamEvent {
    /// A text frame, in arrival order.
    Message(String),
    Closed,
    Error(String),
}

/// An open upstream socket. Dropping `outbound` closes it; `inbound` ends
/// with `Closed` or `Error`.
#[derive(Debug)]
pub struct RealtimeSocket {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<UpstreamEvent>,
}

#[async_trait]
pub trait RealtimeConnector: Send + Sync {
    /// Open the realtime socket for `call_id`. Returns once the handshake
    /// has completed.
    async fn connect(
        &self,
        call_id: &str,
        ephemeral_key: &Secret<String>,
    ) -> Result<RealtimeSocket, VoiceError>;
}
