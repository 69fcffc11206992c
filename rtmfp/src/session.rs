use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};
use crate::buffer_pool::BufferPool;
use crate::codec::{self, protocol_time, CHECKSUM_SIZE, HEADER_SIZE, ID_SIZE, TIMESTAMP_SCALE};
use crate::config::RtmfpConfig;
use crate::crypto::{RtmfpEngine, BLOCK_SIZE};
use crate::error::RtmfpError;
use crate::flow::{Flow, FlowHeader, MAX_SIGNATURE_LEN};
use crate::fragment_flags::FragmentFlags;
use crate::handler::SessionHandler;
use crate::outgoing::OutgoingPacket;
use crate::packet_sink::PacketSink;
use crate::rolling_mean::RollingMean;
use crate::safe_converter::PrecheckedCast;
use crate::stage::Stage;
use crate::sub_message::{parse_marker, SubMessageType, END_OF_SUB_MESSAGES, MARKER_ECHO_BIT, MARKER_SERVER, SUB_MESSAGE_HEADER_SIZE};
use crate::varint::{SevenBitSupport, SevenBitSupportMut};
use crate::writer::{Acknowledgment, Writer};

const PING_WINDOW: usize = 8;

/// An echoed time stamp at most this many units ahead of the local clock is taken as a round
///  trip of zero rather than a wrap-around
const ECHO_CLOCK_TOLERANCE: u16 = 30;

/// The outgoing packet of a session: sub-messages are collected here and sent as one datagram
///  when the packet is full or the session flushes.
struct Band {
    far_id: u32,
    peer_addr: SocketAddr,
    encrypt: RtmfpEngine,
    sink: Arc<dyn PacketSink>,
    buffer_pool: Arc<BufferPool>,
    max_packet_size: usize,
    echo_time_validity: Duration,

    /// reference point for the local protocol time
    epoch: Instant,
    now: Instant,
    /// time stamp of the last packet received from the peer, and when it was received
    peer_time: Option<(u16, Instant)>,

    body: BytesMut,
    /// writer id and stage of the data fragment that ends `body`
    last_fragment: Option<(u64, Stage)>,
    /// a failed session sends nothing but fail signals: everything else is written here and dropped
    discarded: BytesMut,
    failed: bool,
}

impl Band {
    /// biggest packet (up to and including padding) that does not exceed the maximum packet size
    fn capacity(&self) -> usize {
        ID_SIZE + (self.max_packet_size - ID_SIZE) / BLOCK_SIZE * BLOCK_SIZE
    }

    fn time(&self) -> u16 {
        protocol_time(self.now.saturating_duration_since(self.epoch))
    }

    /// The peer's time stamp advanced by the time since it was received, as long as it is fresh
    fn echo_time(&self) -> Option<u16> {
        let (peer_time, received_at) = self.peer_time?;
        let age = self.now.saturating_duration_since(received_at);
        if age >= self.echo_time_validity {
            return None;
        }
        Some(peer_time.wrapping_add(protocol_time(age)))
    }

    fn write_control(&mut self, kind: SubMessageType, payload: &[u8]) {
        self.write_sub_message(kind, payload.len().prechecked_cast(), None)
            .put_slice(payload);
    }

    /// replaces all pending content by a fail signal and sends it immediately
    fn send_fail_signal(&mut self) {
        self.body.clear();
        self.body.put_u8(SubMessageType::Fail.into());
        self.body.put_u16(0);
        self.flush(false);
    }

    fn clear(&mut self) {
        self.body.clear();
        self.last_fragment = None;
    }
}

impl OutgoingPacket for Band {
    fn available(&self) -> usize {
        self.capacity().saturating_sub(HEADER_SIZE + self.body.len())
    }

    fn can_write_following(&self, writer_id: u64, stage: Stage) -> bool {
        self.last_fragment == Some((writer_id, stage))
    }

    fn write_sub_message(&mut self, kind: SubMessageType, len: u16, fragment: Option<(u64, Stage)>) -> &mut BytesMut {
        if self.failed {
            self.discarded.clear();
            return &mut self.discarded;
        }

        let size = SUB_MESSAGE_HEADER_SIZE + len as usize;
        if size > self.available() {
            self.flush(false);
            if size > self.available() {
                error!("{:?} sub-message of {} bytes exceeds the maximum packet size", kind, len);
            }
        }

        self.last_fragment = fragment;
        self.body.put_u8(kind.into());
        self.body.put_u16(len);
        &mut self.body
    }

    fn flush(&mut self, echo_time: bool) {
        self.last_fragment = None;
        if self.body.is_empty() {
            return;
        }

        let echo = if echo_time { self.echo_time() } else { None };

        let mut packet = self.buffer_pool.get_from_pool();
        packet.put_bytes(0, ID_SIZE + CHECKSUM_SIZE);
        match echo {
            Some(echo) => {
                packet.put_u8(MARKER_SERVER | MARKER_ECHO_BIT);
                packet.put_u16(self.time());
                packet.put_u16(echo);
            }
            None => {
                packet.put_u8(MARKER_SERVER);
                packet.put_u16(self.time());
            }
        }
        packet.put_slice(&self.body);
        self.body.clear();

        if packet.len() > self.max_packet_size {
            error!("packet of {} bytes to {:?} exceeds the maximum packet size - sending anyway", packet.len(), self.peer_addr);
        }

        match codec::encode(&self.encrypt, &mut packet).and_then(|_| codec::pack(&mut packet, self.far_id)) {
            Ok(()) => {
                trace!("sending packet of {} bytes to {:?}", packet.len(), self.peer_addr);
                self.sink.send_packet(self.peer_addr, &packet);
            }
            Err(e) => error!("failed to encode packet for {:?}: {}", self.peer_addr, e),
        }
        self.buffer_pool.return_to_pool(packet);
    }

    fn is_failed(&self) -> bool {
        self.failed
    }
}

/// Parsing state carried from one data sub-message to the continuations that follow it
#[derive(Default)]
struct FragmentCursor {
    flow_id: Option<u64>,
    stage: u64,
    delta_nack: u64,
}

/// Protocol state of one peer: owns the flows the peer writes to and the writers for sending to
///  the peer, and aggregates everything they send into the session's outgoing packet.
///
/// A session is driven from outside: [Session::decode] for every datagram received from the peer,
///  [Session::manage] on a regular tick. All time dependent behavior uses the `now` passed in.
pub struct Session {
    id: u32,
    decrypt: RtmfpEngine,
    config: Arc<RtmfpConfig>,
    handler: Arc<dyn SessionHandler>,
    band: Band,

    flows: BTreeMap<u64, Flow>,
    null_flow: Flow,
    writers: BTreeMap<u64, Writer>,
    next_writer_id: u64,

    connected: bool,
    failed: bool,
    died: bool,
    fail_signals: u32,
    keepalive_attempts: u32,
    last_received: Instant,
    ping: RollingMean<PING_WINDOW>,
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: u32,
        far_id: u32,
        peer_addr: SocketAddr,
        decrypt: RtmfpEngine,
        encrypt: RtmfpEngine,
        config: Arc<RtmfpConfig>,
        sink: Arc<dyn PacketSink>,
        handler: Arc<dyn SessionHandler>,
        buffer_pool: Arc<BufferPool>,
        now: Instant,
    ) -> Session {
        debug!("new session {} for peer {:?} (far id {})", id, peer_addr, far_id);

        let band = Band {
            far_id,
            peer_addr,
            encrypt,
            sink,
            buffer_pool,
            max_packet_size: config.max_packet_size,
            echo_time_validity: config.echo_time_validity,
            epoch: now,
            now,
            peer_time: None,
            body: BytesMut::with_capacity(config.max_packet_size),
            last_fragment: None,
            discarded: BytesMut::new(),
            failed: false,
        };

        Session {
            id,
            decrypt,
            null_flow: Flow::null(&config),
            config,
            handler,
            band,
            flows: BTreeMap::default(),
            writers: BTreeMap::default(),
            next_writer_id: 0,
            connected: false,
            failed: false,
            died: false,
            fail_signals: 0,
            keepalive_attempts: 0,
            last_received: now,
            ping: RollingMean::default(),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn far_id(&self) -> u32 {
        self.band.far_id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.band.peer_addr
    }

    pub fn is_failed(&self) -> bool {
        self.failed
    }

    pub fn is_died(&self) -> bool {
        self.died
    }

    /// smoothed round trip time, based on the time stamps the peer echoes back
    pub fn ping(&self) -> Option<Duration> {
        self.ping.mean()
            .map(|millis| Duration::from_secs_f64(millis / 1000.0))
    }

    pub fn num_flows(&self) -> usize {
        self.flows.len()
    }

    pub fn num_writers(&self) -> usize {
        self.writers.len()
    }

    pub fn writer(&self, id: u64) -> Option<&Writer> {
        self.writers.get(&id)
    }

    fn idle(&self) -> Duration {
        self.band.now.saturating_duration_since(self.last_received)
    }

    /// Decrypts and verifies a datagram in place and handles its content. A datagram that fails
    ///  verification has no effect on the session.
    pub fn decode(&mut self, datagram: &mut [u8], now: Instant) -> anyhow::Result<()> {
        if self.died {
            debug!("session {}: datagram for dead session - dropping", self.id);
            return Ok(());
        }
        codec::decode(&self.decrypt, datagram)?;
        self.packet_handler(&datagram[ID_SIZE + CHECKSUM_SIZE..], now);
        Ok(())
    }

    /// Handles the decrypted content of a packet: marker, time stamps and sub-messages
    pub fn packet_handler(&mut self, packet: &[u8], now: Instant) {
        if self.died {
            return;
        }
        self.band.now = now;
        self.last_received = now;
        self.connected = true;

        let mut buf = packet;
        if buf.remaining() < 3 {
            warn!("session {}: packet without marker and time stamp - dropping", self.id);
            return;
        }
        let marker = buf.get_u8();
        let time = buf.get_u16();
        self.band.peer_time = Some((time, now));

        let has_echo = match parse_marker(marker) {
            Some(has_echo) => has_echo,
            None => {
                warn!("session {}: unknown packet marker {:02x}", self.id, marker);
                marker & MARKER_ECHO_BIT != 0
            }
        };
        if has_echo {
            if buf.remaining() < 2 {
                warn!("session {}: packet without announced echo time - dropping", self.id);
                return;
            }
            let echo = buf.get_u16();
            self.on_echo_time(echo);
        }

        let mut cursor = FragmentCursor::default();
        let mut kind = buf.first().copied().unwrap_or(END_OF_SUB_MESSAGES);
        while kind != END_OF_SUB_MESSAGES {
            buf.advance(1);
            if buf.remaining() < 2 {
                warn!("session {}: truncated sub-message header", self.id);
                break;
            }
            let len = buf.get_u16() as usize;
            if len > buf.remaining() {
                warn!("session {}: sub-message of type {:02x} with {} bytes exceeds the packet - dropping the rest", self.id, kind, len);
                break;
            }
            let (message, rest) = buf.split_at(len);
            buf = rest;

            match self.handle_sub_message(kind, message, &mut cursor, now) {
                Ok(true) => {}
                Ok(false) => return,
                Err(e) => warn!("session {}: malformed sub-message of type {:02x} - skipping: {}", self.id, kind, e),
            }

            kind = buf.first().copied().unwrap_or(END_OF_SUB_MESSAGES);

            if kind != u8::from(SubMessageType::DataContinuation) {
                if let Some(flow_id) = cursor.flow_id.take() {
                    self.commit_flow(flow_id);
                }
            }
        }

        self.flush(now);
    }

    fn on_echo_time(&mut self, echo: u16) {
        let mut time = self.band.time();
        let mut echo = echo;
        if echo > time {
            if echo - time < ECHO_CLOCK_TOLERANCE {
                time = 0;
            }
            else {
                time += u16::MAX - echo;
            }
            echo = 0;
        }
        let millis = (time - echo) as u64 * TIMESTAMP_SCALE;
        trace!("session {}: round trip of {} ms", self.id, millis);
        self.ping.add_value(millis as f64);
    }

    /// Returns `false` if the session died while handling the sub-message
    fn handle_sub_message(&mut self, kind: u8, mut message: &[u8], cursor: &mut FragmentCursor, now: Instant) -> anyhow::Result<bool> {
        let Ok(kind) = SubMessageType::try_from(kind) else {
            error!("session {}: unknown sub-message type {:02x}", self.id, kind);
            return Ok(true);
        };

        match kind {
            SubMessageType::Fail => {
                self.fail("failed on peer side");
            }
            SubMessageType::Death => {
                // no fail signal in reply
                self.set_failed();
                self.kill();
                return Ok(false);
            }
            SubMessageType::KeepaliveRequest => {
                self.band.write_control(SubMessageType::KeepaliveAck, &[]);
                self.keepalive_attempts = 0;
            }
            SubMessageType::KeepaliveAck => {
                self.keepalive_attempts = 0;
            }
            SubMessageType::FlowException => {
                let writer_id = message.try_get_7bit_u64()?;
                match self.writers.get_mut(&writer_id) {
                    Some(writer) => {
                        writer.fail("rejected by peer");
                        if writer.is_critical() {
                            self.fail(&format!("critical writer {} rejected by peer", writer_id));
                        }
                    }
                    None => warn!("session {}: flow exception for unknown writer {}", self.id, writer_id),
                }
            }
            SubMessageType::NegativeAck => {
                self.fail("negative acknowledgment from peer");
            }
            SubMessageType::Ack => {
                let writer_id = message.try_get_7bit_u64()?;
                let ack = Acknowledgment::deser(&mut message)?;
                let Some(writer) = self.writers.get_mut(&writer_id) else {
                    warn!("session {}: acknowledgment for unknown writer {}", self.id, writer_id);
                    return Ok(true);
                };
                if let Err(e) = writer.acknowledgment(&ack, &mut self.band, now) {
                    if writer.is_critical() {
                        self.fail(&format!("critical writer {} failed: {}", writer_id, e));
                    }
                    else {
                        debug!("session {}: writer {} failed: {}", self.id, writer_id, e);
                    }
                }
            }
            SubMessageType::Data => {
                cursor.flow_id = None;

                let flags = FragmentFlags::from_bits_retain(message.try_get_u8()?);
                let flow_id = message.try_get_7bit_u64()?;
                let stage = message.try_get_7bit_u64()?;
                let delta_nack = message.try_get_7bit_u64()?;

                if self.failed {
                    return Ok(true);
                }
                if stage == 0 {
                    return Err(RtmfpError::protocol(format!("data fragment with stage 0 for flow {}", flow_id)));
                }

                let header = if flags.contains(FragmentFlags::HEADER) {
                    Some(FlowHeader::deser(&mut message)?)
                }
                else {
                    None
                };

                if !self.flows.contains_key(&flow_id) {
                    match header {
                        Some(header) => {
                            if !self.create_flow(flow_id, header.signature) {
                                return Ok(true);
                            }
                        }
                        None => {
                            warn!("session {}: flow {} is unknown", self.id, flow_id);
                            self.null_flow.retarget(flow_id);
                        }
                    }
                }

                cursor.flow_id = Some(flow_id);
                cursor.stage = stage;
                cursor.delta_nack = delta_nack;
                self.deliver(flow_id, cursor.stage, cursor.delta_nack, flags, message);
            }
            SubMessageType::DataContinuation => {
                let flags = FragmentFlags::from_bits_retain(message.try_get_u8()?);
                cursor.stage += 1;
                cursor.delta_nack += 1;
                match cursor.flow_id {
                    Some(flow_id) => self.deliver(flow_id, cursor.stage, cursor.delta_nack, flags, message),
                    None => debug!("session {}: continuation fragment without a flow - ignoring", self.id),
                }
            }
            SubMessageType::PeerAddress => {
                debug!("session {}: ignoring peer address exchange", self.id);
            }
        }
        Ok(true)
    }

    fn create_flow(&mut self, flow_id: u64, signature: Bytes) -> bool {
        if self.died {
            error!("session {} is dead, no flow can be created", self.id);
            return false;
        }

        if !self.handler.on_flow_opened(self.id, flow_id, &signature) {
            info!("session {}: flow {} with signature {:?} rejected", self.id, flow_id, signature);
            let mut payload = BytesMut::new();
            payload.put_7bit_u64(flow_id);
            payload.put_u8(0);
            self.band.write_control(SubMessageType::FlowException, &payload);
            return false;
        }

        debug!("session {}: new flow {} with signature {:?}", self.id, flow_id, signature);
        self.flows.insert(flow_id, Flow::new(flow_id, signature, &self.config));
        true
    }

    fn deliver(&mut self, flow_id: u64, stage: u64, delta_nack: u64, flags: FragmentFlags, fragment: &[u8]) {
        let stage = Stage::from_raw(stage);
        let fragment = Bytes::copy_from_slice(fragment);

        match self.flows.get_mut(&flow_id) {
            Some(flow) => {
                for message in flow.fragment_handler(stage, delta_nack, flags, fragment) {
                    self.handler.on_message(self.id, flow_id, flow.signature(), message);
                }
            }
            None => {
                let discarded = self.null_flow.fragment_handler(stage, delta_nack, flags, fragment);
                if !discarded.is_empty() {
                    debug!("session {}: discarding {} messages for unknown flow {}", self.id, discarded.len(), flow_id);
                }
            }
        }
    }

    fn commit_flow(&mut self, flow_id: u64) {
        if let Some(flow) = self.flows.get_mut(&flow_id) {
            flow.commit(&mut self.band);
            if flow.consumed() {
                debug!("session {}: flow {} is finished", self.id, flow_id);
                self.flows.remove(&flow_id);
                self.handler.on_flow_closed(self.id, flow_id);
            }
        }
        else if self.null_flow.id() == flow_id {
            self.null_flow.commit(&mut self.band);
        }
    }

    /// Periodic work: fail signal repetition, timeouts, keepalive and writer retransmissions
    pub fn manage(&mut self, now: Instant) {
        if self.died {
            return;
        }
        self.band.now = now;

        if self.failed {
            self.fail_signal();
            return;
        }

        if self.idle() >= self.config.session_death_timeout {
            self.fail("timeout: no message from peer");
            return;
        }

        if self.idle() >= self.config.keepalive_after && !self.keep_alive() {
            return;
        }

        let mut critical_failure = None;
        for writer in self.writers.values_mut() {
            if let Err(e) = writer.manage(&mut self.band, now) {
                if writer.is_critical() {
                    critical_failure = Some(e);
                    break;
                }
                debug!("session {}: writer {} failed: {}", self.id, writer.id(), e);
            }
        }
        if let Some(e) = critical_failure {
            self.fail(&e.to_string());
            return;
        }

        self.writers.retain(|id, writer| {
            if writer.consumed() {
                debug!("writer {} is consumed", id);
            }
            !writer.consumed()
        });

        self.band.flush(true);
    }

    fn keep_alive(&mut self) -> bool {
        if !self.connected {
            self.fail("timeout: peer never connected");
            return false;
        }
        if self.keepalive_attempts >= self.config.max_keepalive_attempts {
            self.fail("timeout: keepalive attempts");
            return false;
        }
        debug!("session {}: keepalive", self.id);
        self.keepalive_attempts += 1;
        self.band.write_control(SubMessageType::KeepaliveRequest, &[]);
        true
    }

    /// Sends everything pending: data queued in writers, then the outgoing packet
    pub fn flush(&mut self, now: Instant) {
        if self.died {
            return;
        }
        self.band.now = now;
        for writer in self.writers.values_mut() {
            writer.flush(&mut self.band, now);
        }
        self.band.flush(true);
    }

    /// Creates a writer for sending to the peer, returning its id
    pub fn create_writer(&mut self, signature: Bytes, reliable: bool, critical: bool) -> anyhow::Result<u64> {
        if self.died {
            return Err(RtmfpError::protocol(format!("session {} is dead, no writer can be created", self.id)));
        }
        if signature.len() > MAX_SIGNATURE_LEN {
            return Err(RtmfpError::protocol(format!("flow signature of {} bytes exceeds the maximum of {}", signature.len(), MAX_SIGNATURE_LEN)));
        }

        loop {
            self.next_writer_id = self.next_writer_id.wrapping_add(1);
            if self.next_writer_id != 0 && !self.writers.contains_key(&self.next_writer_id) {
                break;
            }
        }
        let id = self.next_writer_id;
        let flow_id = self.flows.keys().next().copied();

        debug!("session {}: new writer {} (flow {:?})", self.id, id, flow_id);
        self.writers.insert(id, Writer::new(id, signature, flow_id, reliable, critical, &self.config));
        Ok(id)
    }

    /// Queues a message on a writer. It is sent on the next flush.
    pub fn write(&mut self, writer_id: u64, data: Bytes) -> anyhow::Result<()> {
        match self.writers.get_mut(&writer_id) {
            Some(writer) => writer.write(data),
            None => Err(RtmfpError::protocol(format!("session {}: no writer {}", self.id, writer_id))),
        }
    }

    pub fn close_writer(&mut self, writer_id: u64) -> anyhow::Result<()> {
        match self.writers.get_mut(&writer_id) {
            Some(writer) => {
                writer.close();
                Ok(())
            }
            None => Err(RtmfpError::protocol(format!("session {}: no writer {}", self.id, writer_id))),
        }
    }

    /// Marks the session as failed and notifies the peer. The session dies after repeated fail
    ///  signals.
    pub fn fail(&mut self, reason: &str) {
        if self.failed || self.died {
            return;
        }
        warn!("session {} failed: {}", self.id, reason);
        self.fail_signal();
    }

    fn set_failed(&mut self) {
        self.failed = true;
        self.band.failed = true;
    }

    fn fail_signal(&mut self) {
        self.set_failed();
        if self.died {
            return;
        }

        self.fail_signals += 1;
        self.band.send_fail_signal();

        if self.fail_signals >= self.config.max_fail_signals || self.idle() >= self.config.session_death_timeout {
            self.kill();
        }
    }

    /// Ends the session for good, releasing all flows and writers
    pub fn kill(&mut self) {
        if !self.failed {
            self.fail_signal();
        }
        if self.died {
            return;
        }

        info!("session {} died", self.id);
        self.died = true;
        self.flows.clear();
        self.null_flow = Flow::null(&self.config);
        self.writers.clear();
        self.band.clear();
        self.handler.on_session_died(self.id);
    }
}
