use std::collections::BTreeMap;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::{debug, error, trace, warn};
use crate::config::RtmfpConfig;
use crate::error::RtmfpError;
use crate::fragment_flags::FragmentFlags;
use crate::outgoing::OutgoingPacket;
use crate::safe_converter::PrecheckedCast;
use crate::stage::Stage;
use crate::sub_message::SubMessageType;
use crate::varint::{size_7bit_u32, size_7bit_u64, SevenBitSupport, SevenBitSupportMut, MAX_LEN_U64};

const FULL_DUPLEX_PART: u8 = 0x0a;

/// the signature length is a single byte on the wire
pub const MAX_SIGNATURE_LEN: usize = u8::MAX as usize;
/// serialized flow header with the longest signature and a back reference
pub const MAX_FLOW_HEADER_LEN: usize = 1 + MAX_SIGNATURE_LEN + 2 + MAX_LEN_U64 + 1;

/// buffer size hint sent while no message is partially reassembled
const BUFFER_SIZE_IDLE: u32 = 0x7f;
/// buffer size hint with a partial message, reduced by the number of fragments held
const BUFFER_SIZE_BASE: u32 = 0x3f00;

/// fragments after which the sender writes nothing more to the flow
const FINAL_FLAGS: FragmentFlags = FragmentFlags::END.union(FragmentFlags::ABANDONMENT);

/// Header carried by the first fragment that a writer sends for a flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowHeader {
    pub signature: Bytes,
    /// id of a flow in the opposite direction that the sending writer belongs to
    pub back_reference: Option<u64>,
}

impl FlowHeader {
    pub fn serialized_len(signature: &[u8], back_reference: Option<u64>) -> usize {
        let back_reference_len = match back_reference {
            Some(flow_id) => 2 + size_7bit_u64(flow_id),
            None => 0,
        };
        1 + signature.len() + back_reference_len + 1
    }

    pub fn ser(buf: &mut impl BufMut, signature: &[u8], back_reference: Option<u64>) {
        buf.put_u8(signature.len().prechecked_cast());
        buf.put_slice(signature);
        if let Some(flow_id) = back_reference {
            buf.put_u8((1 + size_7bit_u64(flow_id)).prechecked_cast());
            buf.put_u8(FULL_DUPLEX_PART);
            buf.put_7bit_u64(flow_id);
        }
        buf.put_u8(0);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<FlowHeader> {
        let signature_len = buf.try_get_u8()
            .map_err(|_| RtmfpError::formatting("missing flow signature"))? as usize;
        if buf.remaining() < signature_len {
            return Err(RtmfpError::formatting("truncated flow signature"));
        }
        let signature = buf.copy_to_bytes(signature_len);

        let mut back_reference = None;
        let first_part_len = buf.try_get_u8()
            .map_err(|_| RtmfpError::formatting("flow header without terminator"))?;

        if first_part_len > 0 {
            match buf.try_get_u8() {
                Ok(FULL_DUPLEX_PART) => {
                    back_reference = Some(buf.try_get_7bit_u64()?);
                }
                Ok(other) => {
                    warn!("unknown flow header part {:02x} - skipping", other);
                    let skip = (first_part_len as usize - 1).min(buf.remaining());
                    buf.advance(skip);
                }
                Err(_) => return Err(RtmfpError::formatting("truncated flow header part")),
            }

            loop {
                let part_len = buf.try_get_u8()
                    .map_err(|_| RtmfpError::formatting("flow header ended before its terminator"))? as usize;
                if part_len == 0 {
                    break;
                }
                warn!("unknown flow header part of {} bytes - skipping", part_len);
                if buf.remaining() < part_len {
                    return Err(RtmfpError::formatting("flow header ended before its terminator"));
                }
                buf.advance(part_len);
            }
        }

        Ok(FlowHeader { signature, back_reference })
    }
}

#[derive(Clone, Copy, Debug)]
struct FlowLimits {
    max_message_size: usize,
    receive_window_size: u64,
    max_lost_ranges: usize,
}

impl From<&RtmfpConfig> for FlowLimits {
    fn from(config: &RtmfpConfig) -> Self {
        FlowLimits {
            max_message_size: config.max_message_size,
            receive_window_size: config.receive_window_size,
            max_lost_ranges: config.max_lost_ranges_per_ack,
        }
    }
}

struct BufferedFragment {
    flags: FragmentFlags,
    data: Bytes,
}

struct PartialMessage {
    data: BytesMut,
    num_fragments: u32,
}

/// Receiving side of a logical sub-channel: puts fragments back into stage order, reassembles
///  fragmented messages and acknowledges what was received.
pub struct Flow {
    id: u64,
    signature: Bytes,
    /// highest stage that was handled in order
    stage: Stage,
    out_of_order: BTreeMap<Stage, BufferedFragment>,
    partial: Option<PartialMessage>,
    completed: bool,
    lost_messages: u64,
    limits: FlowLimits,
}

impl Flow {
    pub fn new(id: u64, signature: Bytes, config: &RtmfpConfig) -> Flow {
        Flow::with_limits(id, signature, config.into())
    }

    fn with_limits(id: u64, signature: Bytes, limits: FlowLimits) -> Flow {
        Flow {
            id,
            signature,
            stage: Stage::ZERO,
            out_of_order: BTreeMap::default(),
            partial: None,
            completed: false,
            lost_messages: 0,
            limits,
        }
    }

    /// Placeholder for fragments addressed to flows that are unknown. It acknowledges them so
    ///  that the peer's writer can make progress, but never delivers anything.
    pub fn null(config: &RtmfpConfig) -> Flow {
        Flow::new(0, Bytes::new(), config)
    }

    /// Points the null flow at a different unknown flow id, discarding state of the previous one
    pub fn retarget(&mut self, id: u64) {
        if self.id != id {
            *self = Flow::with_limits(id, Bytes::new(), self.limits);
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn signature(&self) -> &Bytes {
        &self.signature
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn next_stage(&self) -> Stage {
        self.stage.next()
    }

    pub fn lost_messages(&self) -> u64 {
        self.lost_messages
    }

    /// a flow is consumed after its last fragment was received, or after the sender abandoned it
    pub fn consumed(&self) -> bool {
        self.completed
    }

    /// Handles a data fragment, returning the messages that became complete, in order.
    ///
    /// `delta_nack` is the distance between the fragment's stage and the stage up to which the
    ///  sender considers its data acknowledged or written off.
    pub fn fragment_handler(&mut self, stage: Stage, delta_nack: u64, flags: FragmentFlags, fragment: Bytes) -> Vec<Bytes> {
        let mut delivered = vec![];

        if self.completed {
            debug!("flow {}: fragment {} after the flow was consumed - ignoring", self.id, stage);
            return delivered;
        }
        if stage <= self.stage {
            debug!("flow {}: stage {} was already received", self.id, stage);
            return delivered;
        }

        let delta_nack = if delta_nack > stage.to_raw() {
            error!("flow {}: ack delta {} exceeds stage {}", self.id, delta_nack, stage);
            stage.to_raw()
        }
        else {
            delta_nack
        };

        let sender_watermark = Stage::from_raw(stage.to_raw() - delta_nack);
        if self.stage < sender_watermark {
            // the sender gave up on the stages we are still waiting for
            debug!("flow {}: sender skipped from {} to {}", self.id, self.stage, sender_watermark);
            let skipped: Vec<Stage> = self.out_of_order.range(..stage).map(|(s, _)| *s).collect();
            for s in skipped {
                if let Some(f) = self.out_of_order.remove(&s) {
                    self.discard_partial_on_gap(s);
                    delivered.extend(self.sorted_handler(s, f.flags, f.data));
                    if f.flags.intersects(FINAL_FLAGS) {
                        self.complete();
                        return delivered;
                    }
                }
            }
            self.discard_partial_on_gap(stage);
            if let Some(before) = stage.checked_minus(1) {
                self.stage = self.stage.max(before);
            }
        }

        if stage > self.stage.next() {
            if stage.distance_from(self.stage) > self.limits.receive_window_size {
                debug!("flow {}: stage {} is outside the receive window after {} - discarding", self.id, stage, self.stage);
                return delivered;
            }
            trace!("flow {}: buffering out-of-order stage {} (expecting {})", self.id, stage, self.stage.next());
            self.out_of_order.entry(stage)
                .or_insert(BufferedFragment { flags, data: fragment });
            return delivered;
        }

        delivered.extend(self.sorted_handler(stage, flags, fragment));
        if flags.intersects(FINAL_FLAGS) {
            self.complete();
            return delivered;
        }

        while let Some(entry) = self.out_of_order.first_entry() {
            if *entry.key() <= self.stage {
                entry.remove();
                continue;
            }
            if *entry.key() != self.stage.next() {
                break;
            }
            let (s, f) = entry.remove_entry();
            delivered.extend(self.sorted_handler(s, f.flags, f.data));
            if f.flags.intersects(FINAL_FLAGS) {
                self.complete();
                break;
            }
        }
        delivered
    }

    fn discard_partial_on_gap(&mut self, stage: Stage) {
        if stage != self.stage.next() && self.partial.take().is_some() {
            debug!("flow {}: fragments before stage {} are lost - dropping partial message", self.id, stage);
            self.lost_messages += 1;
        }
    }

    fn sorted_handler(&mut self, stage: Stage, flags: FragmentFlags, fragment: Bytes) -> Option<Bytes> {
        self.stage = stage;

        if flags.contains(FragmentFlags::ABANDONMENT) {
            if self.partial.take().is_some() {
                debug!("flow {}: sender abandoned partial message", self.id);
                self.lost_messages += 1;
            }
            return None;
        }

        if flags.contains(FragmentFlags::BEFORE_PART) {
            let Some(partial) = self.partial.as_mut() else {
                warn!("flow {}: continuation fragment {} without the start of its message - message lost", self.id, stage);
                self.lost_messages += 1;
                return None;
            };

            if partial.data.len() + fragment.len() > self.limits.max_message_size {
                warn!("flow {}: message exceeds maximum size of {} bytes - dropping", self.id, self.limits.max_message_size);
                self.partial = None;
                self.lost_messages += 1;
                return None;
            }
            partial.data.extend_from_slice(&fragment);
            partial.num_fragments += 1;

            if flags.contains(FragmentFlags::AFTER_PART) {
                return None;
            }
            return self.partial.take().map(|p| p.data.freeze());
        }

        if self.partial.take().is_some() {
            warn!("flow {}: new message at stage {} while the previous one is incomplete - dropping it", self.id, stage);
            self.lost_messages += 1;
        }

        if flags.contains(FragmentFlags::AFTER_PART) {
            self.partial = Some(PartialMessage {
                data: BytesMut::from(fragment.as_ref()),
                num_fragments: 1,
            });
            return None;
        }

        Some(fragment)
    }

    fn complete(&mut self) {
        debug!("flow {} is consumed", self.id);
        self.completed = true;
        self.out_of_order.clear();
        self.partial = None;
    }

    fn buffer_size_hint(&self) -> u32 {
        match &self.partial {
            None => BUFFER_SIZE_IDLE,
            Some(partial) => BUFFER_SIZE_BASE.saturating_sub(partial.num_fragments),
        }
    }

    /// `(lost - 1, received - 1)` for each gap / run pair in the out-of-order buffer, the first
    ///  `max_lost_ranges` of them
    fn lost_ranges(&self) -> Vec<(u64, u64)> {
        let mut result = vec![];
        let mut last = self.stage;
        let mut run: Option<(u64, u64)> = None;

        for &s in self.out_of_order.keys() {
            if s != last.next() && result.len() + usize::from(run.is_some()) >= self.limits.max_lost_ranges {
                break;
            }
            if s == last.next() {
                if let Some((_, received)) = run.as_mut() {
                    *received += 1;
                }
            }
            else {
                result.extend(run.take());
                run = Some((s.distance_from(last) - 1, 0));
            }
            last = s;
        }
        result.extend(run);
        result.into_iter()
            .map(|(gap, received)| (gap - 1, received))
            .collect()
    }

    /// Acknowledges everything received so far
    pub fn commit(&mut self, out: &mut dyn OutgoingPacket) {
        let buffer_size = self.buffer_size_hint();
        let ranges = self.lost_ranges();

        let len = size_7bit_u64(self.id)
            + size_7bit_u32(buffer_size)
            + size_7bit_u64(self.stage.to_raw())
            + ranges.iter()
                .map(|(lost, received)| size_7bit_u64(*lost) + size_7bit_u64(*received))
                .sum::<usize>();

        trace!("flow {}: acknowledging stage {} with {} lost ranges", self.id, self.stage, ranges.len());

        let buf = out.write_sub_message(SubMessageType::Ack, len.prechecked_cast(), None);
        buf.put_7bit_u64(self.id);
        buf.put_7bit_u32(buffer_size);
        buf.put_7bit_u64(self.stage.to_raw());
        for (lost, received) in ranges {
            buf.put_7bit_u64(lost);
            buf.put_7bit_u64(received);
        }
    }
}
