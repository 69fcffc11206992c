use std::collections::VecDeque;
use std::ops::Range;
use bytes::{Buf, BufMut, Bytes};
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};
use crate::config::RtmfpConfig;
use crate::error::RtmfpError;
use crate::flow::FlowHeader;
use crate::fragment_flags::FragmentFlags;
use crate::message::OutgoingMessage;
use crate::outgoing::OutgoingPacket;
use crate::qos::QualityOfService;
use crate::repeat_trigger::RepeatTrigger;
use crate::safe_converter::{PrecheckedCast, SafeCast};
use crate::stage::Stage;
use crate::sub_message::{SubMessageType, SUB_MESSAGE_HEADER_SIZE};
use crate::varint::{size_7bit_u64, SevenBitSupport, SevenBitSupportMut};

/// A fragment is only started if at least this much room (on top of its header) is left in the
///  current packet - otherwise the packet is sent first
pub(crate) const MIN_FRAGMENT_ROOM: usize = 12;

/// Acknowledgment sub-message content following the writer id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acknowledgment {
    /// free buffer space reported by the receiver, 0 is a hard rejection
    pub buffer_size: u32,
    /// cumulative ack: the receiver has everything up to this stage
    pub stage: Stage,
    /// `(lost - 1, received - 1)` pairs describing alternating gaps and received runs after `stage`
    pub lost_ranges: Vec<(u64, u64)>,
}

impl Acknowledgment {
    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<Acknowledgment> {
        let buffer_size = buf.try_get_7bit_u32()?;
        let stage = Stage::from_raw(buf.try_get_7bit_u64()?);

        let mut lost_ranges = vec![];
        while buf.has_remaining() {
            match (buf.try_get_7bit_u64(), buf.try_get_7bit_u64()) {
                (Ok(lost), Ok(received)) => lost_ranges.push((lost, received)),
                _ => {
                    warn!("malformed lost range in acknowledgment for stage {} - ignoring the rest", stage);
                    break;
                }
            }
        }

        Ok(Acknowledgment { buffer_size, stage, lost_ranges })
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_7bit_u32(self.buffer_size);
        buf.put_7bit_u64(self.stage.to_raw());
        for (lost, received) in &self.lost_ranges {
            buf.put_7bit_u64(*lost);
            buf.put_7bit_u64(*received);
        }
    }

    /// highest stage the receiver has seen
    pub fn max_stage_received(&self) -> Stage {
        self.valid_lost_ranges().1
    }

    /// The lost ranges up to the first one that reaches beyond the highest possible stage,
    ///  and the highest stage received according to them
    fn valid_lost_ranges(&self) -> (&[(u64, u64)], Stage) {
        let mut max_stage = self.stage;
        for (idx, &(lost, received)) in self.lost_ranges.iter().enumerate() {
            let next = lost.checked_add(received)
                .and_then(|n| n.checked_add(2))
                .and_then(|n| max_stage.checked_add(n));
            match next {
                Some(stage) => max_stage = stage,
                None => {
                    warn!("lost range ({}, {}) after stage {} exceeds the stage range - ignoring the rest", lost, received, max_stage);
                    return (&self.lost_ranges[..idx], max_stage);
                }
            }
        }
        (&self.lost_ranges, max_stage)
    }
}

/// Sending side of a logical sub-channel. Messages written to it are queued until the session
///  flushes, then cut into fragments that fill the session's outgoing packet. Each fragment gets
///  the next stage; fragments stay in the 'sent' queue until they are acknowledged or written off.
pub struct Writer {
    id: u64,
    signature: Bytes,
    /// flow in the opposite direction this writer belongs to, announced in the flow header
    flow_id: Option<u64>,
    reliable: bool,
    critical: bool,
    closed: bool,
    failed: bool,

    stage: Stage,
    stage_ack: Stage,

    messages: VecDeque<OutgoingMessage>,
    messages_sent: VecDeque<OutgoingMessage>,
    /// number of messages in `messages_sent` that are repeatable
    repeatable: u32,

    ack_count: u64,
    lost_count: u64,
    trigger: RepeatTrigger,
    qos: QualityOfService,
}

impl Writer {
    pub fn new(id: u64, signature: Bytes, flow_id: Option<u64>, reliable: bool, critical: bool, config: &RtmfpConfig) -> Writer {
        Writer {
            id,
            signature,
            flow_id,
            reliable,
            critical,
            closed: false,
            failed: false,
            stage: Stage::ZERO,
            stage_ack: Stage::ZERO,
            messages: VecDeque::default(),
            messages_sent: VecDeque::default(),
            repeatable: 0,
            ack_count: 0,
            lost_count: 0,
            trigger: RepeatTrigger::new(config),
            qos: QualityOfService::default(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn signature(&self) -> &Bytes {
        &self.signature
    }

    pub fn flow_id(&self) -> Option<u64> {
        self.flow_id
    }

    pub fn is_critical(&self) -> bool {
        self.critical
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn is_failed(&self) -> bool {
        self.failed
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn stage_ack(&self) -> Stage {
        self.stage_ack
    }

    pub fn qos(&self) -> &QualityOfService {
        &self.qos
    }

    /// number of fragments written off without delivery
    pub fn lost_count(&self) -> u64 {
        self.lost_count
    }

    /// A writer can be discarded once it is closed and all its data is acknowledged (or dropped)
    pub fn consumed(&self) -> bool {
        self.closed && self.messages.is_empty() && self.messages_sent.is_empty()
    }

    pub fn write(&mut self, data: Bytes) -> anyhow::Result<()> {
        if self.closed {
            return Err(RtmfpError::protocol(format!("writer {} is closed", self.id)));
        }
        if data.is_empty() {
            // an empty fragment would signal abandonment to the peer
            debug!("writer {}: ignoring empty message", self.id);
            return Ok(());
        }
        trace!("writer {}: queueing message of {} bytes", self.id, data.len());
        self.messages.push_back(OutgoingMessage::new(data, self.reliable));
        Ok(())
    }

    /// Closes the writer. If the peer may know the flow, an END fragment is queued to tell it.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        debug!("closing writer {}", self.id);
        if !self.stage.is_zero() || !self.messages.is_empty() {
            self.messages.push_back(OutgoingMessage::end_marker(self.reliable));
        }
        self.closed = true;
    }

    /// Drops all data, counting unacknowledged fragments as lost, and closes the writer
    pub fn fail(&mut self, reason: &str) {
        if self.failed {
            return;
        }
        warn!("writer {} failed: {}", self.id, reason);
        for mut message in self.messages.drain(..).chain(self.messages_sent.drain(..)) {
            let dropped: u64 = message.abandon().max(1).safe_cast();
            self.lost_count += dropped;
        }
        self.repeatable = 0;
        self.trigger.stop();
        self.closed = true;
        self.failed = true;
    }

    fn header_size(&self, stage: Stage) -> usize {
        let mut result = size_7bit_u64(self.id)
            + size_7bit_u64(stage.to_raw())
            + size_7bit_u64(stage.distance_from(self.stage_ack));
        if self.stage_ack.is_zero() {
            result += FlowHeader::serialized_len(&self.signature, self.flow_id);
        }
        result
    }

    /// payload length of a fragment sub-message
    fn fragment_len(&self, stage: Stage, header: bool, content_len: usize) -> usize {
        let header_len = if header { self.header_size(stage) } else { 0 };
        1 + header_len + content_len
    }

    fn write_fragment(&self, out: &mut dyn OutgoingPacket, stage: Stage, flags: FragmentFlags, header: bool, message: &OutgoingMessage, range: Range<usize>) {
        let mut flags = flags;
        if header && self.stage_ack.is_zero() {
            flags |= FragmentFlags::HEADER;
        }
        if range.is_empty() {
            flags |= FragmentFlags::ABANDONMENT;
        }
        if message.is_end() {
            flags |= FragmentFlags::END;
        }

        let kind = if header { SubMessageType::Data } else { SubMessageType::DataContinuation };
        let len = self.fragment_len(stage, header, range.len());

        let buf = out.write_sub_message(kind, len.prechecked_cast(), Some((self.id, stage)));
        buf.put_u8(flags.bits());
        if header {
            buf.put_7bit_u64(self.id);
            buf.put_7bit_u64(stage.to_raw());
            buf.put_7bit_u64(stage.distance_from(self.stage_ack));
            if flags.contains(FragmentFlags::HEADER) {
                FlowHeader::ser(buf, &self.signature, self.flow_id);
            }
        }
        buf.put_slice(&message.data()[range]);
    }

    /// Fragments all pending messages into the outgoing packet, sending the packet whenever it
    ///  is full
    pub fn flush(&mut self, out: &mut dyn OutgoingPacket, now: Instant) {
        if self.messages.is_empty() {
            return;
        }
        if out.is_failed() {
            debug!("writer {}: session failed, not sending", self.id);
            return;
        }

        let mut header = !out.can_write_following(self.id, self.stage);

        while let Some(mut message) = self.messages.pop_front() {
            if message.is_repeatable() {
                self.repeatable += 1;
                self.trigger.start(now);
            }

            let mut offset = 0;
            loop {
                self.stage += 1;
                let stage = self.stage;

                let header_size = if header { self.header_size(stage) } else { 0 };
                if out.available() < header_size + MIN_FRAGMENT_ROOM {
                    out.flush(false);
                    header = true;
                }

                let overhead = SUB_MESSAGE_HEADER_SIZE + self.fragment_len(stage, header, 0);
                let available = out.available();

                let mut flags = FragmentFlags::empty();
                if offset > 0 {
                    flags |= FragmentFlags::BEFORE_PART;
                }
                let fragment_header = header;

                let mut content_len = message.len() - offset;
                if overhead + content_len.min(1) > available {
                    error!("writer {}: no room for a fragment in an empty packet ({} bytes available, {} needed)", self.id, available, overhead + 1);
                    self.stage = Stage::from_raw(stage.to_raw() - 1);
                    self.messages.push_front(message);
                    self.fail("packets are too small for fragments");
                    return;
                }
                if overhead + content_len > available {
                    flags |= FragmentFlags::AFTER_PART;
                    content_len = available.saturating_sub(overhead);
                    header = true;
                }
                else {
                    header = false;
                }

                trace!("writer {}: stage {} with {} bytes from offset {}", self.id, stage, content_len, offset);
                self.write_fragment(out, stage, flags, fragment_header, &message, offset..offset + content_len);
                message.on_fragment_sent(offset, stage, now);

                offset += content_len;
                if offset >= message.len() {
                    break;
                }
            }

            self.messages_sent.push_back(message);
        }
    }

    /// Applies an acknowledgment: releases acknowledged fragments, writes off lost fragments of
    ///  non-repeatable messages and re-sends lost fragments of repeatable ones.
    pub fn acknowledgment(&mut self, ack: &Acknowledgment, out: &mut dyn OutgoingPacket, now: Instant) -> anyhow::Result<()> {
        if ack.buffer_size == 0 {
            // re-sending would loop: the receiver refuses the data
            self.fail("negative acknowledgment");
            return Err(RtmfpError::protocol(format!("negative acknowledgment for writer {}", self.id)));
        }

        let stage_ack_before = self.stage_ack;
        let mut stage_readen = ack.stage;
        let mut stage = self.stage_ack.next();

        if stage_readen > self.stage {
            error!("writer {}: acknowledgment for stage {} beyond the current stage {}", self.id, stage_readen, self.stage);
            self.stage_ack = self.stage;
        }
        else if stage_readen <= self.stage_ack {
            if ack.lost_ranges.is_empty() {
                debug!("writer {}: obsolete acknowledgment for stage {}", self.id, stage_readen);
            }
        }
        else {
            self.stage_ack = stage_readen;
        }

        let (lost_ranges, max_stage_received) = ack.valid_lost_ranges();
        let mut lost_ranges = lost_ranges.iter();

        let mut lost_count = 0u64;
        let mut lost_stage = Stage::ZERO;
        let mut repeated = false;
        let mut header = true;
        let mut stop = false;

        let mut sent = std::mem::take(&mut self.messages_sent);
        let mut idx = 0;
        while !stop && idx < sent.len() {
            let message = &mut sent[idx];

            if !message.has_pending_fragments() {
                error!("writer {}: sent message without fragments after stage {}", self.id, stage);
                idx += 1;
                continue;
            }

            let mut cursor = message.first_pending_offset();
            while let Some(offset) = cursor {
                if self.stage_ack >= stage {
                    message.acknowledge_fragment(offset);
                    cursor = message.first_pending_offset();
                    self.ack_count += 1;
                    stage += 1;
                    continue;
                }

                // next lost stage that is not acknowledged yet
                while !stop {
                    if lost_count == 0 {
                        match lost_ranges.next() {
                            Some(&(lost, received)) => {
                                lost_count = lost + 1;
                                lost_stage = stage_readen.next();
                                stage_readen = lost_stage + (lost_count + received);
                            }
                            None => {
                                stop = true;
                                break;
                            }
                        }
                    }
                    if lost_stage > self.stage {
                        error!("writer {}: lost stage {} was not sent yet", self.id, lost_stage);
                        stop = true;
                    }
                    else if lost_stage <= self.stage_ack {
                        lost_count -= 1;
                        lost_stage += 1;
                        continue;
                    }
                    break;
                }
                if stop {
                    break;
                }

                if lost_stage != stage {
                    // `stage` was received
                    if repeated {
                        stage += 1;
                        cursor = message.next_pending_offset(offset);
                        header = true;
                    }
                    else {
                        self.stage_ack = stage;
                    }
                    continue;
                }

                if !message.is_repeatable() {
                    if repeated {
                        cursor = message.next_pending_offset(offset);
                        stage += 1;
                        header = true;
                    }
                    else {
                        info!("writer {}: fragment {} lost", self.id, stage);
                        self.lost_count += 1;
                        self.stage_ack = stage;
                        message.acknowledge_fragment(offset);
                        cursor = message.first_pending_offset();
                        stage += 1;
                    }
                    lost_count -= 1;
                    lost_stage += 1;
                    continue;
                }

                repeated = true;

                // the previous copy may still be on its way
                if message.last_sent_stage(offset).is_some_and(|s| s >= max_stage_received) {
                    stage += 1;
                    header = true;
                    lost_count -= 1;
                    lost_stage += 1;
                    cursor = message.next_pending_offset(offset);
                    continue;
                }

                debug!("writer {}: repeating stage {}", self.id, stage);
                message.set_last_sent_stage(offset, self.stage);

                let (range, has_more) = message.fragment_range(offset);
                let mut flags = FragmentFlags::empty();
                if offset > 0 {
                    flags |= FragmentFlags::BEFORE_PART;
                }
                if has_more {
                    flags |= FragmentFlags::AFTER_PART;
                }

                let len = SUB_MESSAGE_HEADER_SIZE + self.fragment_len(stage, false, range.len());
                if !header && len > out.available() {
                    out.flush(false);
                    header = true;
                }
                if SUB_MESSAGE_HEADER_SIZE + self.fragment_len(stage, header, range.len()) > out.available() {
                    out.flush(false);
                }

                self.write_fragment(out, stage, flags, header, message, range);
                header = false;
                lost_count -= 1;
                lost_stage += 1;
                stage += 1;
                cursor = message.next_pending_offset(offset);
            }

            if message.has_pending_fragments() {
                idx += 1;
            }
            else {
                if message.is_repeatable() {
                    self.repeatable = self.repeatable.saturating_sub(1);
                }
                if self.ack_count > 0 {
                    let latency = message.first_sent()
                        .map(|t| now.saturating_duration_since(t))
                        .unwrap_or_default();
                    self.qos.add(latency, message.len(), self.ack_count, self.lost_count);
                    self.ack_count = 0;
                    self.lost_count = 0;
                }
                sent.remove(idx);
            }
        }
        self.messages_sent = sent;

        if lost_count > 0 && lost_ranges.next().is_some() {
            error!("writer {}: lost ranges for stages that were not sent yet", self.id);
        }

        if self.repeatable == 0 {
            self.trigger.stop();
        }
        else if self.stage_ack > stage_ack_before || repeated {
            self.trigger.reset(now);
        }
        Ok(())
    }

    /// Re-sends the oldest unacknowledged fragments of repeatable messages, as many as fit into
    ///  the current packet. The rest waits for the next round.
    fn raise_message(&mut self, out: &mut dyn OutgoingPacket) {
        let mut header = true;
        let mut nothing_repeatable = true;
        let mut sent_any = false;
        let mut stage = self.stage_ack.next();

        for message in &self.messages_sent {
            if !message.has_pending_fragments() {
                break;
            }
            if !message.is_repeatable() {
                let skipped: u64 = message.num_pending_fragments().safe_cast();
                stage += skipped;
                header = true;
                continue;
            }

            if nothing_repeatable {
                // data waiting in the current packet goes first
                out.flush(true);
                nothing_repeatable = false;
            }

            for offset in message.pending_offsets() {
                let (range, has_more) = message.fragment_range(offset);
                let mut flags = FragmentFlags::empty();
                if offset > 0 {
                    flags |= FragmentFlags::BEFORE_PART;
                }
                if has_more {
                    flags |= FragmentFlags::AFTER_PART;
                }

                if SUB_MESSAGE_HEADER_SIZE + self.fragment_len(stage, header, range.len()) > out.available() {
                    if !sent_any {
                        error!("writer {}: fragment {} does not fit into an empty packet", self.id, stage);
                    }
                    debug!("writer {}: packet is full, repeating from stage {} later", self.id, stage);
                    return;
                }

                sent_any = true;
                debug!("writer {}: repeating stage {} on timeout", self.id, stage);
                self.write_fragment(out, stage, flags, header, message, range);
                stage += 1;
                header = false;
            }
        }

        if nothing_repeatable {
            self.trigger.stop();
        }
    }

    /// Periodic work: re-sends unacknowledged data when the retransmission trigger is due and
    ///  flushes pending messages. Fails if the trigger gave up, or if this writer is critical
    ///  and closed.
    pub fn manage(&mut self, out: &mut dyn OutgoingPacket, now: Instant) -> anyhow::Result<()> {
        if !self.consumed() && !out.is_failed() {
            match self.trigger.raise(now) {
                Ok(true) => self.raise_message(out),
                Ok(false) => {}
                Err(e) => {
                    self.fail(&format!("can't deliver data: {}", e));
                    return Err(e);
                }
            }
        }

        if self.critical && self.closed {
            return Err(RtmfpError::network(format!("main writer {} closed, session is closing", self.id)));
        }

        self.flush(out, now);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::Flow;
    use crate::test_util::packet::{parse_fragments, CollectingPacket, ParsedFragment};
    use rstest::rstest;
    use std::time::Duration;

    const ID: u64 = 2;

    fn writer(reliable: bool) -> Writer {
        Writer::new(ID, Bytes::from_static(b"\x00TC\x04\x00\x00"), None, reliable, false, &RtmfpConfig::default())
    }

    fn ack(stage: u64, lost_ranges: Vec<(u64, u64)>) -> Acknowledgment {
        Acknowledgment { buffer_size: 0x7f, stage: Stage::from_raw(stage), lost_ranges }
    }

    fn data(len: usize) -> Bytes {
        (0..len).map(|i| (i % 251) as u8).collect::<Vec<_>>().into()
    }

    /// writes single-fragment messages for stages 1..=n
    fn writer_with_stages(n: usize, reliable: bool, out: &mut CollectingPacket, now: Instant) -> Writer {
        let mut writer = writer(reliable);
        for i in 0..n {
            writer.write(Bytes::from(vec![i as u8; 10])).unwrap();
        }
        writer.flush(out, now);
        out.take_all();
        assert_eq!(writer.stage(), Stage::from_raw(n as u64));
        writer
    }

    #[test]
    fn test_fragmentation_and_reassembly() {
        let now = Instant::now();
        let mut writer = writer(true);

        // room for exactly 1200 bytes of content per packet
        let capacity = SUB_MESSAGE_HEADER_SIZE + 1 + writer.header_size(Stage::from_raw(1)) + 1200;
        let mut out = CollectingPacket::new(capacity);

        let message = data(3000);
        writer.write(message.clone()).unwrap();
        writer.flush(&mut out, now);

        let fragments = parse_fragments(&out.take_all());
        assert_eq!(fragments.len(), 3);
        assert_eq!(fragments.iter().map(|f| f.data.len()).collect::<Vec<_>>(), vec![1200, 1200, 600]);
        assert_eq!(fragments.iter().map(|f| f.stage).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(writer.messages_sent[0].pending_offsets(), vec![0, 1200, 2400]);

        assert_eq!(fragments[0].flags & (FragmentFlags::BEFORE_PART | FragmentFlags::AFTER_PART), FragmentFlags::AFTER_PART);
        assert_eq!(fragments[1].flags & (FragmentFlags::BEFORE_PART | FragmentFlags::AFTER_PART), FragmentFlags::BEFORE_PART | FragmentFlags::AFTER_PART);
        assert_eq!(fragments[2].flags & (FragmentFlags::BEFORE_PART | FragmentFlags::AFTER_PART), FragmentFlags::BEFORE_PART);

        let header = fragments[0].header.as_ref().unwrap();
        assert_eq!(header.signature.as_ref(), b"\x00TC\x04\x00\x00");
        assert_eq!(header.back_reference, None);

        let mut flow = Flow::new(ID, header.signature.clone(), &RtmfpConfig::default());
        let mut delivered = vec![];
        for f in fragments {
            delivered.extend(flow.fragment_handler(Stage::from_raw(f.stage), f.delta_nack, f.flags, f.data));
        }
        assert_eq!(delivered, vec![message]);
    }

    #[rstest]
    #[case::tiny(1, 100)]
    #[case::exact(1000, 1000)]
    #[case::one_more(1001, 1000)]
    #[case::many(10_000, 300)]
    fn test_fragments_partition_message(#[case] len: usize, #[case] content_per_packet: usize) {
        let now = Instant::now();
        let mut writer = writer(true);
        let capacity = SUB_MESSAGE_HEADER_SIZE + 1 + writer.header_size(Stage::from_raw(1)) + content_per_packet;
        let mut out = CollectingPacket::new(capacity);

        writer.write(data(len)).unwrap();
        writer.flush(&mut out, now);
        let fragments = parse_fragments(&out.take_all());

        assert_eq!(fragments.len(), len.div_ceil(content_per_packet));
        let reassembled = fragments.iter()
            .flat_map(|f| f.data.iter().copied())
            .collect::<Vec<_>>();
        assert_eq!(Bytes::from(reassembled), data(len));
    }

    #[test]
    fn test_small_messages_share_a_packet() {
        let now = Instant::now();
        let mut writer = writer(true);
        let mut out = CollectingPacket::new(1000);

        writer.write(Bytes::from_static(b"abc")).unwrap();
        writer.write(Bytes::from_static(b"def")).unwrap();
        writer.flush(&mut out, now);
        writer.write(Bytes::from_static(b"ghi")).unwrap();
        writer.flush(&mut out, now);

        let sub_messages = out.take_all();
        assert_eq!(out.packets.len(), 0);
        assert_eq!(sub_messages.iter().map(|s| s.kind).collect::<Vec<_>>(),
                   vec![SubMessageType::Data, SubMessageType::DataContinuation, SubMessageType::DataContinuation]);

        let fragments = parse_fragments(&sub_messages);
        assert_eq!(fragments.iter().map(|f| f.stage).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(fragments.iter().map(|f| f.data.as_ref()).collect::<Vec<_>>(), vec![b"abc".as_ref(), b"def", b"ghi"]);
        assert!(fragments.iter().all(|f| f.flags.is_complete_message()));
    }

    #[test]
    fn test_header_until_first_ack() {
        let now = Instant::now();
        let mut out = CollectingPacket::new(1000);
        let mut writer = Writer::new(ID, Bytes::from_static(b"sig"), Some(9), true, false, &RtmfpConfig::default());

        writer.write(Bytes::from_static(b"a")).unwrap();
        writer.flush(&mut out, now);
        let first = parse_fragments(&out.take_all());
        assert_eq!(first[0].header, Some(FlowHeader { signature: Bytes::from_static(b"sig"), back_reference: Some(9) }));

        writer.acknowledgment(&ack(1, vec![]), &mut out, now).unwrap();
        assert!(out.take_all().is_empty());

        writer.write(Bytes::from_static(b"b")).unwrap();
        writer.flush(&mut out, now);
        let second = parse_fragments(&out.take_all());
        assert_eq!(second[0].header, None);
        assert_eq!(second[0].stage, 2);
        assert_eq!(second[0].delta_nack, 1);
    }

    #[test]
    fn test_ack_releases_messages() {
        let now = Instant::now();
        let mut out = CollectingPacket::new(1000);
        let mut writer = writer_with_stages(3, true, &mut out, now);

        writer.acknowledgment(&ack(2, vec![]), &mut out, now + Duration::from_millis(50)).unwrap();
        assert_eq!(writer.stage_ack(), Stage::from_raw(2));
        assert_eq!(writer.messages_sent.len(), 1);
        assert_eq!(writer.repeatable, 1);
        assert!(writer.trigger.is_running());
        assert_eq!(writer.qos().acknowledged_fragments(), 2);

        writer.acknowledgment(&ack(3, vec![]), &mut out, now).unwrap();
        assert!(writer.messages_sent.is_empty());
        assert_eq!(writer.repeatable, 0);
        assert!(!writer.trigger.is_running());
        assert!(out.take_all().is_empty());
    }

    #[test]
    fn test_ack_monotonicity() {
        let now = Instant::now();
        let mut out = CollectingPacket::new(1000);
        let mut writer = writer_with_stages(10, true, &mut out, now);

        let acks = vec![
            ack(3, vec![]),
            ack(2, vec![]),
            ack(5, vec![(0, 1)]),
            ack(4, vec![(1, 0)]),
            ack(50, vec![]),
            ack(7, vec![]),
            ack(0, vec![(3, 2)]),
        ];

        let mut previous = writer.stage_ack();
        for a in acks {
            writer.acknowledgment(&a, &mut out, now).unwrap();
            assert!(writer.stage_ack() >= previous);
            assert!(writer.stage_ack() <= writer.stage());
            previous = writer.stage_ack();
        }
        assert_eq!(writer.stage_ack(), Stage::from_raw(10));
    }

    #[test]
    fn test_negative_ack_fails_writer() {
        let now = Instant::now();
        let mut out = CollectingPacket::new(1000);
        let mut writer = writer_with_stages(3, true, &mut out, now);

        let negative = Acknowledgment { buffer_size: 0, stage: Stage::from_raw(1), lost_ranges: vec![] };
        let e = writer.acknowledgment(&negative, &mut out, now).unwrap_err();
        assert!(matches!(RtmfpError::of(&e), Some(RtmfpError::Protocol(_))));
        assert!(writer.is_failed());
        assert!(writer.consumed());
        assert!(writer.write(Bytes::from_static(b"x")).is_err());
        assert!(out.take_all().is_empty());
    }

    #[test]
    fn test_selective_retransmission() {
        let now = Instant::now();
        let mut out = CollectingPacket::new(1000);
        let mut writer = writer_with_stages(8, true, &mut out, now);

        // stages 1-5 received, 6 lost, 7 and 8 received
        let a = ack(5, vec![(0, 1)]);
        assert_eq!(a.max_stage_received(), Stage::from_raw(8));

        writer.acknowledgment(&a, &mut out, now).unwrap();
        let repeated = parse_fragments(&out.take_all());
        assert_eq!(repeated.len(), 1);
        assert_eq!(repeated[0].stage, 6);
        assert_eq!(repeated[0].data.as_ref(), &[5u8; 10]);
        assert_eq!(writer.stage_ack(), Stage::from_raw(5));

        // the fragment's bookkeeping now points past everything sent before the retransmission
        assert_eq!(writer.messages_sent[0].last_sent_stage(0), Some(Stage::from_raw(8)));

        // the same information again: the repeated copy may still be in flight
        writer.acknowledgment(&a, &mut out, now).unwrap();
        assert!(out.take_all().is_empty());

        // after the receiver saw a later stage, the fragment is repeated again
        writer.write(Bytes::from_static(b"later")).unwrap();
        writer.flush(&mut out, now);
        out.take_all();
        writer.acknowledgment(&ack(5, vec![(0, 2)]), &mut out, now).unwrap();
        let repeated = parse_fragments(&out.take_all());
        assert_eq!(repeated.iter().map(|f| f.stage).collect::<Vec<_>>(), vec![6]);

        writer.acknowledgment(&ack(9, vec![]), &mut out, now).unwrap();
        assert!(writer.messages_sent.is_empty());
        assert_eq!(writer.repeatable, 0);
    }

    #[test]
    fn test_retransmission_keeps_stage_on_the_wire() {
        let now = Instant::now();
        let mut out = CollectingPacket::new(1000);
        let mut writer = writer_with_stages(3, true, &mut out, now);
        let max_stage_before = writer.stage();

        // stage 2 lost, 3 received
        writer.acknowledgment(&ack(1, vec![(0, 0)]), &mut out, now).unwrap();
        let repeated = parse_fragments(&out.take_all());
        assert_eq!(repeated.iter().map(|f| f.stage).collect::<Vec<_>>(), vec![2]);
        assert_eq!(repeated[0].data.as_ref(), &[1u8; 10]);

        // no stage is consumed by the retransmission, its bookkeeping moves to the current stage
        assert_eq!(writer.stage(), max_stage_before);
        let last_sent = writer.messages_sent[0].last_sent_stage(0).unwrap();
        assert!(last_sent >= max_stage_before);
    }

    #[rstest]
    #[case::lost_overflows(vec![(u64::MAX, 0)], 0)]
    #[case::received_overflows(vec![(0, u64::MAX - 1)], 0)]
    #[case::later_range_overflows(vec![(0, 0), (u64::MAX / 2, u64::MAX / 2)], 1)]
    fn test_ack_with_overflowing_lost_ranges(#[case] lost_ranges: Vec<(u64, u64)>, #[case] num_valid: usize) {
        let now = Instant::now();
        let mut out = CollectingPacket::new(1000);
        let mut writer = writer_with_stages(3, true, &mut out, now);

        let a = ack(1, lost_ranges.clone());
        assert_eq!(a.valid_lost_ranges().0, &lost_ranges[..num_valid]);
        assert!(a.max_stage_received() >= Stage::from_raw(1));

        writer.acknowledgment(&a, &mut out, now).unwrap();
        out.take_all();
        assert_eq!(writer.stage_ack(), Stage::from_raw(1));
        assert!(!writer.is_failed());
    }

    #[test]
    fn test_packet_too_small_for_a_fragment() {
        let now = Instant::now();
        let mut writer = writer(true);
        let mut out = CollectingPacket::new(12);

        writer.write(Bytes::from_static(b"hello")).unwrap();
        writer.flush(&mut out, now);

        assert!(writer.is_failed());
        assert_eq!(writer.stage(), Stage::ZERO);
        assert_eq!(writer.lost_count(), 1);
        assert!(parse_fragments(&out.take_all()).is_empty());
    }

    #[test]
    fn test_non_repeatable_loss_is_written_off() {
        let now = Instant::now();
        let mut out = CollectingPacket::new(1000);
        let mut writer = writer_with_stages(4, false, &mut out, now);
        assert!(!writer.trigger.is_running());

        // stage 2 lost, 3 and 4 received
        writer.acknowledgment(&ack(1, vec![(0, 1)]), &mut out, now).unwrap();
        assert!(out.take_all().is_empty());
        assert_eq!(writer.stage_ack(), Stage::from_raw(2));
        assert_eq!(writer.messages_sent.len(), 2);

        // the receiver skipped the lost stage and acknowledges the rest cumulatively
        writer.acknowledgment(&ack(4, vec![]), &mut out, now).unwrap();
        assert!(writer.messages_sent.is_empty());
        assert_eq!(writer.qos().lost_fragments(), 1);
        assert_eq!(writer.qos().acknowledged_fragments(), 3);
    }

    #[test]
    fn test_lost_range_beyond_sent() {
        let now = Instant::now();
        let mut out = CollectingPacket::new(1000);
        let mut writer = writer_with_stages(2, true, &mut out, now);

        // claims stages 2 to 7 lost although only 2 was sent: 2 is repeated, the rest ignored
        writer.acknowledgment(&ack(1, vec![(5, 0)]), &mut out, now).unwrap();
        let repeated = parse_fragments(&out.take_all());
        assert_eq!(repeated.iter().map(|f| f.stage).collect::<Vec<_>>(), vec![2]);
        assert_eq!(writer.stage_ack(), Stage::from_raw(1));
        assert!(!writer.is_failed());
    }

    #[test]
    fn test_timeout_repeats_unacknowledged() {
        let now = Instant::now();
        let mut out = CollectingPacket::new(1000);
        let mut writer = writer_with_stages(3, true, &mut out, now);
        writer.acknowledgment(&ack(1, vec![]), &mut out, now).unwrap();

        writer.manage(&mut out, now + Duration::from_millis(500)).unwrap();
        assert!(out.take_all().is_empty());

        writer.manage(&mut out, now + Duration::from_secs(1)).unwrap();
        let sub_messages = out.take_all();
        let repeated = parse_fragments(&sub_messages);
        assert_eq!(repeated.iter().map(|f| f.stage).collect::<Vec<_>>(), vec![2, 3]);
        assert_eq!(repeated[0].delta_nack, 1);
        assert!(repeated[0].header.is_none());
    }

    #[test]
    fn test_timeout_repeats_stop_when_packet_is_full() {
        let now = Instant::now();
        let mut out = CollectingPacket::new(1000);
        let mut writer = writer_with_stages(3, true, &mut out, now);
        writer.acknowledgment(&ack(1, vec![]), &mut out, now).unwrap();

        let mut small = CollectingPacket::new(30);
        writer.manage(&mut small, now + Duration::from_secs(1)).unwrap();
        let repeated = parse_fragments(&small.take_all());
        assert_eq!(repeated.iter().map(|f| f.stage).collect::<Vec<_>>(), vec![2]);
        assert!(!writer.is_failed());
    }

    #[test]
    fn test_trigger_failure_fails_writer() {
        let config = RtmfpConfig {
            max_repeat_cycles: 2,
            ..Default::default()
        };
        let now = Instant::now();
        let mut out = CollectingPacket::new(1000);
        let mut writer = Writer::new(ID, Bytes::new(), None, true, false, &config);
        writer.write(Bytes::from_static(b"abc")).unwrap();
        writer.flush(&mut out, now);

        writer.manage(&mut out, now + Duration::from_secs(1)).unwrap();
        writer.manage(&mut out, now + Duration::from_secs(3)).unwrap();
        let e = writer.manage(&mut out, now + Duration::from_secs(6)).unwrap_err();
        assert!(matches!(RtmfpError::of(&e), Some(RtmfpError::Protocol(_))));
        assert!(writer.is_failed());
        assert!(writer.consumed());
        assert_eq!(writer.lost_count(), 1);
    }

    #[test]
    fn test_close() {
        let now = Instant::now();
        let mut out = CollectingPacket::new(1000);
        let mut writer = writer_with_stages(1, true, &mut out, now);

        writer.close();
        assert!(writer.write(Bytes::from_static(b"x")).is_err());
        assert!(!writer.consumed());

        writer.manage(&mut out, now).unwrap();
        let fragments: Vec<ParsedFragment> = parse_fragments(&out.take_all());
        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0].stage, 2);
        assert!(fragments[0].flags.contains(FragmentFlags::END | FragmentFlags::ABANDONMENT));
        assert!(fragments[0].data.is_empty());

        writer.acknowledgment(&ack(2, vec![]), &mut out, now).unwrap();
        assert!(writer.consumed());
    }

    #[test]
    fn test_close_unused() {
        let mut writer = writer(true);
        writer.close();
        assert!(writer.consumed());
    }

    #[test]
    fn test_critical_closed() {
        let mut out = CollectingPacket::new(1000);
        let mut writer = Writer::new(ID, Bytes::new(), None, true, true, &RtmfpConfig::default());
        writer.manage(&mut out, Instant::now()).unwrap();

        writer.close();
        let e = writer.manage(&mut out, Instant::now()).unwrap_err();
        assert!(matches!(RtmfpError::of(&e), Some(RtmfpError::Network(_))));
    }

    #[test]
    fn test_no_data_on_failed_session() {
        let mut out = CollectingPacket::new(1000);
        out.failed = true;
        let mut writer = writer(true);
        writer.write(Bytes::from_static(b"abc")).unwrap();
        writer.manage(&mut out, Instant::now()).unwrap();
        assert!(out.take_all().is_empty());
    }

    #[rstest]
    #[case::cumulative(vec![0x7f, 5], ack(5, vec![]))]
    #[case::ranges(vec![0x7f, 5, 0, 1, 2, 3], ack(5, vec![(0, 1), (2, 3)]))]
    #[case::truncated_range(vec![0x7f, 5, 0, 1, 2], ack(5, vec![(0, 1)]))]
    fn test_ack_deser(#[case] raw: Vec<u8>, #[case] expected: Acknowledgment) {
        let mut b: &[u8] = &raw;
        assert_eq!(Acknowledgment::deser(&mut b).unwrap(), expected);

        if raw.len() % 2 == 0 {
            let mut buf = bytes::BytesMut::new();
            expected.ser(&mut buf);
            assert_eq!(buf.as_ref(), raw.as_slice());
        }
    }
}
