use bytes::{Buf, Bytes, BytesMut};
use crate::flow::FlowHeader;
use crate::fragment_flags::FragmentFlags;
use crate::outgoing::OutgoingPacket;
use crate::stage::Stage;
use crate::sub_message::{SubMessageType, SUB_MESSAGE_HEADER_SIZE};
use crate::varint::SevenBitSupport;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectedSubMessage {
    pub kind: SubMessageType,
    pub declared_len: u16,
    pub payload: Bytes,
}

/// [OutgoingPacket] that records sub-messages instead of sending them. Each flush with content
///  closes a 'packet', so tests can check how sub-messages were distributed over packets.
pub struct CollectingPacket {
    capacity: usize,
    current: Vec<(SubMessageType, u16, BytesMut)>,
    last_fragment: Option<(u64, Stage)>,
    pub packets: Vec<Vec<CollectedSubMessage>>,
    pub echo_flags: Vec<bool>,
    pub failed: bool,
}

impl CollectingPacket {
    /// `capacity` is the room for sub-messages (including their headers) per packet
    pub fn new(capacity: usize) -> CollectingPacket {
        CollectingPacket {
            capacity,
            current: vec![],
            last_fragment: None,
            packets: vec![],
            echo_flags: vec![],
            failed: false,
        }
    }

    fn used(&self) -> usize {
        self.current.iter()
            .map(|(_, _, payload)| SUB_MESSAGE_HEADER_SIZE + payload.len())
            .sum()
    }

    /// all sub-messages sent so far, flushing the current packet first
    pub fn take_all(&mut self) -> Vec<CollectedSubMessage> {
        self.flush(false);
        let result = self.packets.iter().flatten().cloned().collect();
        self.packets.clear();
        self.echo_flags.clear();
        result
    }
}

impl OutgoingPacket for CollectingPacket {
    fn available(&self) -> usize {
        self.capacity.saturating_sub(self.used())
    }

    fn can_write_following(&self, writer_id: u64, stage: Stage) -> bool {
        self.last_fragment == Some((writer_id, stage))
    }

    fn write_sub_message(&mut self, kind: SubMessageType, len: u16, fragment: Option<(u64, Stage)>) -> &mut BytesMut {
        if SUB_MESSAGE_HEADER_SIZE + len as usize > self.available() {
            self.flush(false);
        }
        self.last_fragment = fragment;
        self.current.push((kind, len, BytesMut::new()));
        let idx = self.current.len() - 1;
        &mut self.current[idx].2
    }

    fn flush(&mut self, echo_time: bool) {
        self.last_fragment = None;
        if self.current.is_empty() {
            return;
        }
        let packet = std::mem::take(&mut self.current).into_iter()
            .map(|(kind, declared_len, payload)| {
                assert_eq!(declared_len as usize, payload.len(), "declared length of {:?} sub-message does not match its payload", kind);
                CollectedSubMessage { kind, declared_len, payload: payload.freeze() }
            })
            .collect();
        self.packets.push(packet);
        self.echo_flags.push(echo_time);
    }

    fn is_failed(&self) -> bool {
        self.failed
    }
}

#[derive(Debug, Clone)]
pub struct ParsedFragment {
    pub writer_id: u64,
    pub stage: u64,
    pub delta_nack: u64,
    pub flags: FragmentFlags,
    pub header: Option<FlowHeader>,
    pub data: Bytes,
}

/// Decodes the data fragments among `sub_messages` the way a receiving session does
pub fn parse_fragments(sub_messages: &[CollectedSubMessage]) -> Vec<ParsedFragment> {
    let mut result: Vec<ParsedFragment> = vec![];
    for sub in sub_messages {
        let mut buf: &[u8] = &sub.payload;
        match sub.kind {
            SubMessageType::Data => {
                let flags = FragmentFlags::from_bits_retain(buf.get_u8());
                let writer_id = buf.try_get_7bit_u64().unwrap();
                let stage = buf.try_get_7bit_u64().unwrap();
                let delta_nack = buf.try_get_7bit_u64().unwrap();
                let header = flags.contains(FragmentFlags::HEADER)
                    .then(|| FlowHeader::deser(&mut buf).unwrap());
                result.push(ParsedFragment { writer_id, stage, delta_nack, flags, header, data: Bytes::copy_from_slice(buf) });
            }
            SubMessageType::DataContinuation => {
                let prev = result.last().expect("continuation without preceding fragment").clone();
                let flags = FragmentFlags::from_bits_retain(buf.get_u8());
                result.push(ParsedFragment {
                    writer_id: prev.writer_id,
                    stage: prev.stage + 1,
                    delta_nack: prev.delta_nack + 1,
                    flags,
                    header: None,
                    data: Bytes::copy_from_slice(buf),
                });
            }
            _ => {}
        }
    }
    result
}
