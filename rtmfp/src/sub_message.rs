use num_enum::{IntoPrimitive, TryFromPrimitive};

/// type byte and 16-bit length
pub const SUB_MESSAGE_HEADER_SIZE: usize = 3;

/// Marker sent by this end point, `MARKER_ECHO_BIT` is added when an echo time follows
pub const MARKER_SERVER: u8 = 0x4a;
pub const MARKER_ECHO_BIT: u8 = 0x04;
/// Marker of handshake packets, which are addressed to session id 0
pub const MARKER_HANDSHAKE: u8 = 0x0b;

/// A type byte of 0xFF ends the sub-messages of a packet: it is the padding byte
pub const END_OF_SUB_MESSAGES: u8 = 0xff;

/// Length of the complete sub-messages at the start of `body`, excluding the padding that
///  follows them. A truncated sub-message ends the sequence.
pub fn sub_messages_len(body: &[u8]) -> usize {
    let mut len = 0;
    while let Some(&kind) = body.get(len) {
        if kind == END_OF_SUB_MESSAGES {
            break;
        }
        let Some(&[hi, lo]) = body.get(len + 1..len + SUB_MESSAGE_HEADER_SIZE) else {
            break;
        };
        let end = len + SUB_MESSAGE_HEADER_SIZE + u16::from_be_bytes([hi, lo]) as usize;
        if end > body.len() {
            break;
        }
        len = end;
    }
    len
}

/// Returns `Some(has_echo_time)` for the markers defined by the protocol, `None` otherwise.
pub fn parse_marker(marker: u8) -> Option<bool> {
    match marker | 0xf0 {
        0xf9 | 0xfa => Some(false),
        0xfd | 0xfe => Some(true),
        _ => None,
    }
}

#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
pub enum SubMessageType {
    KeepaliveRequest = 0x01,
    KeepaliveAck = 0x41,
    /// the session failed on the sender's side
    Fail = 0x0c,
    /// the session is gone on the sender's side
    Death = 0x4c,
    /// data fragment starting with flags, flow id, stage and ack delta
    Data = 0x10,
    /// data fragment following a [SubMessageType::Data] sub-message in the same packet
    DataContinuation = 0x11,
    Ack = 0x51,
    FlowException = 0x5e,
    NegativeAck = 0x18,
    /// peer address exchange, handled by rendezvous outside this crate
    PeerAddress = 0x0f,
}
