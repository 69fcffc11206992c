use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
#[cfg(test)] use mockall::automock;
use std::net::SocketAddr;

/// Application callbacks for the events of an established session. They are called while the
///  session is locked and must not block.
#[cfg_attr(test, automock)]
pub trait SessionHandler: Send + Sync + 'static {
    /// The peer started writing to a new flow. Returning `false` rejects the flow: the peer is
    ///  notified with a flow exception, and no data is delivered for it.
    fn on_flow_opened(&self, session_id: u32, flow_id: u64, signature: &[u8]) -> bool;

    fn on_message(&self, session_id: u32, flow_id: u64, signature: &[u8], message: Bytes);

    /// The peer finished the flow
    fn on_flow_closed(&self, session_id: u32, flow_id: u64);

    fn on_session_died(&self, session_id: u32);
}

/// Receives packets addressed to session id 0, i.e. the handshake that establishes a session.
///  The handshake itself is not part of this crate; implementations call
///  [crate::end_point::EndPoint::create_session] once keys are negotiated.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait HandshakeHandler: Send + Sync + 'static {
    /// `body` holds the sub-messages of a decoded handshake packet. A returned buffer is sent
    ///  back to `from` as the sub-messages of a handshake response.
    async fn on_handshake(&self, from: SocketAddr, body: Bytes) -> Option<BytesMut>;
}
