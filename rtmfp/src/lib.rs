//! This crate implements the transport core of RTMFP, a message oriented protocol on top of UDP
//!  with encryption, per-flow reliability and in-order delivery.
//!
//! ## Layers
//!
//! * Every datagram is framed by the [codec]: a scrambled 32-bit session id, followed by an
//!    AES-128-CBC encrypted block that starts with a checksum. The session id selects the keys;
//!    id 0 is reserved for the handshake, which uses a well-known default key.
//! * Inside the encrypted block, a packet has a marker, a 16-bit time stamp (4ms units), an
//!    optional echo of the peer's time stamp, and a sequence of [sub_message]s.
//! * A [session::Session] is the state shared with one peer. It owns
//!   * [writer::Writer]s that fragment outgoing messages, number fragments with consecutive
//!      *stages*, and re-send them until they are acknowledged (or written off for unreliable
//!      writers)
//!   * [flow::Flow]s that reassemble incoming fragments into messages, deliver them in order
//!      and acknowledge them, reporting gaps as lost ranges
//! * The [end_point::EndPoint] owns the UDP socket, dispatches datagrams to sessions and calls
//!    each session's periodic work (retransmission, keepalive, timeouts).
//!
//! ## Session lifecycle
//!
//! A session is *connected* once it received a valid packet. After a period without packets
//!  from the peer it sends keepalive requests; when those stay unanswered or an unrecoverable
//!  protocol error occurs, it *fails*. A failed session sends nothing but fail signals, one per
//!  tick, and *dies* after a bounded number of them or after the death timeout. Dead sessions
//!  release all flows and writers and are removed by the end point.
//!
//! ## Out of scope
//!
//! The handshake (cookie exchange, Diffie-Hellman, certificates) is done by application code
//!  behind [handler::HandshakeHandler], which registers the resulting session with
//!  [end_point::EndPoint::create_session]. Keys for a session can be derived with
//!  [crypto::derive_keys]. Rendezvous and peer address exchange, as well as the application
//!  level message formats carried in flows, are not part of this crate either.

pub mod atomic_map;
pub mod buffer_pool;
pub mod codec;
pub mod config;
pub mod crypto;
pub mod end_point;
pub mod error;
pub mod flow;
pub mod fragment_flags;
pub mod handler;
mod message;
pub mod outgoing;
pub mod packet_sink;
pub mod qos;
mod repeat_trigger;
pub mod rolling_mean;
pub mod safe_converter;
pub mod session;
pub mod stage;
pub mod sub_message;
pub mod varint;
pub mod writer;

#[cfg(test)]
mod test_util;

#[cfg(test)]
mod tests {
    use tracing::Level;

    #[ctor::ctor]
    unsafe fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
