use bytes::BytesMut;
use crate::stage::Stage;
use crate::sub_message::SubMessageType;

/// The packet a session is currently assembling. Writers and flows append sub-messages to it;
///  the session decides when it is framed, encrypted and sent.
pub trait OutgoingPacket {
    /// bytes that can still be appended before the packet reaches its maximum size
    fn available(&self) -> usize;

    /// `true` if the last sub-message in the packet is the data fragment `stage` of this
    ///  writer, so that the fragment for the next stage can follow it without header
    fn can_write_following(&self, writer_id: u64, stage: Stage) -> bool;

    /// Appends a sub-message header and returns the buffer to write exactly `len` payload
    ///  bytes into. If the sub-message does not fit, the current packet is sent first.
    ///
    /// `fragment` identifies data fragments by writer id and stage, see
    ///  [OutgoingPacket::can_write_following].
    fn write_sub_message(&mut self, kind: SubMessageType, len: u16, fragment: Option<(u64, Stage)>) -> &mut BytesMut;

    /// Sends the current packet (if it contains any sub-messages)
    fn flush(&mut self, echo_time: bool);

    /// `true` once the session failed; writers stop producing data then
    fn is_failed(&self) -> bool;
}
