use std::net::SocketAddr;
use std::time::Duration;
use anyhow::bail;
use crate::codec::{HEADER_SIZE, MAX_PACKET_SIZE};
use crate::crypto::BLOCK_SIZE;
use crate::flow::MAX_FLOW_HEADER_LEN;
use crate::sub_message::SUB_MESSAGE_HEADER_SIZE;
use crate::varint::{MAX_LEN_U32, MAX_LEN_U64};
use crate::writer::MIN_FRAGMENT_ROOM;

/// Framing plus the worst case loss to padding
const PACKET_OVERHEAD: usize = HEADER_SIZE + BLOCK_SIZE - 1;

/// Smallest packet size that fits a first data fragment with the longest possible flow header
pub const MIN_CONFIGURED_PACKET_SIZE: usize = PACKET_OVERHEAD
    + SUB_MESSAGE_HEADER_SIZE + 1 + 3 * MAX_LEN_U64 + MAX_FLOW_HEADER_LEN + MIN_FRAGMENT_ROOM;

#[derive(Clone, Debug)]
pub struct RtmfpConfig {
    /// The address the end point's UDP socket binds to
    pub self_addr: SocketAddr,

    /// Upper bound for a packet including its outer framing. Packets are assembled up to this
    ///  size before they are sent; peers drop bigger packets.
    pub max_packet_size: usize,

    /// A session that has not received anything from its peer for this long dies
    pub session_death_timeout: Duration,
    /// After this much peer inactivity, the session starts sending keepalive requests
    pub keepalive_after: Duration,
    pub max_keepalive_attempts: u32,
    /// A failed session repeats its fail signal on every tick; it dies after this many signals
    pub max_fail_signals: u32,
    /// The peer's time stamp is echoed back only while it is fresher than this, to avoid
    ///  skewing the peer's round trip estimation
    pub echo_time_validity: Duration,

    /// Delay before a writer first re-sends unacknowledged fragments
    pub repeat_initial_delay: Duration,
    /// Number of unanswered retransmission cycles after which a writer gives up
    pub max_repeat_cycles: u32,

    /// Interval between two calls to each session's `manage`
    pub manage_interval: Duration,

    /// Reassembled messages bigger than this are dropped
    pub max_message_size: usize,
    /// A flow buffers out-of-order fragments up to this many stages ahead of the last one it
    ///  received in order. Fragments further ahead are discarded and must be re-sent.
    pub receive_window_size: u64,
    /// Upper bound for the number of lost ranges reported in a single acknowledgment
    pub max_lost_ranges_per_ack: usize,
    /// Number of received datagrams that can be queued for a session before further datagrams
    ///  for that session are dropped
    pub session_queue_len: usize,
    /// Number of outgoing datagrams queued for the socket before further datagrams are dropped
    pub send_queue_len: usize,
    /// This is the number of packet buffers that will be pooled at a given time - buffers in
    ///  excess of this number are discarded when they are returned.
    pub buffer_pool_size: usize,
}

impl Default for RtmfpConfig {
    fn default() -> Self {
        RtmfpConfig {
            self_addr: SocketAddr::from(([0, 0, 0, 0], 1935)),
            max_packet_size: MAX_PACKET_SIZE,
            session_death_timeout: Duration::from_secs(360),
            keepalive_after: Duration::from_secs(120),
            max_keepalive_attempts: 10,
            max_fail_signals: 10,
            echo_time_validity: Duration::from_secs(30),
            repeat_initial_delay: Duration::from_secs(1),
            max_repeat_cycles: 7,
            manage_interval: Duration::from_secs(2),
            max_message_size: 16*1024*1024,
            receive_window_size: 1024,
            max_lost_ranges_per_ack: 32,
            session_queue_len: 256,
            send_queue_len: 1024,
            buffer_pool_size: 1024,
        }
    }
}

impl RtmfpConfig {
    /// longest acknowledgment a flow sends, including its sub-message header
    fn max_ack_size(&self) -> usize {
        SUB_MESSAGE_HEADER_SIZE + 2 * MAX_LEN_U64 + MAX_LEN_U32
            + self.max_lost_ranges_per_ack.saturating_mul(2 * MAX_LEN_U64)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_packet_size < MIN_CONFIGURED_PACKET_SIZE {
            bail!("max packet size {} is too small, it must be at least {}", self.max_packet_size, MIN_CONFIGURED_PACKET_SIZE);
        }
        if self.max_packet_size > 65507 {
            bail!("max packet size {} does not fit into a UDP datagram", self.max_packet_size);
        }
        if self.keepalive_after >= self.session_death_timeout {
            bail!("keepalive must start before the session death timeout");
        }
        if self.max_keepalive_attempts == 0 || self.max_fail_signals == 0 || self.max_repeat_cycles == 0 {
            bail!("attempt bounds must be positive");
        }
        if self.manage_interval.is_zero() || self.repeat_initial_delay.is_zero() {
            bail!("intervals must be positive");
        }
        if self.session_queue_len == 0 || self.send_queue_len == 0 {
            bail!("queues must hold at least one datagram");
        }
        if self.receive_window_size == 0 {
            bail!("receive window must be positive");
        }
        if self.max_ack_size() > self.max_packet_size - PACKET_OVERHEAD {
            bail!("an acknowledgment with {} lost ranges does not fit into a packet of {} bytes", self.max_lost_ranges_per_ack, self.max_packet_size);
        }
        Ok(())
    }
}
