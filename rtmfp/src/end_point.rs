use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use bytes::{BufMut, Bytes, BytesMut};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, span, trace, warn, Instrument, Level, Span};
use uuid::Uuid;
use crate::buffer_pool::BufferPool;
use crate::codec::{self, protocol_time, CHECKSUM_SIZE, ID_SIZE};
use crate::config::RtmfpConfig;
use crate::crypto::{Direction, RtmfpEngine, RtmfpKey};
use crate::atomic_map::AtomicMap;
use crate::error::RtmfpError;
use crate::handler::{HandshakeHandler, SessionHandler};
use crate::packet_sink::{PacketSink, SocketSink};
use crate::session::Session;
use crate::sub_message::{sub_messages_len, MARKER_HANDSHAKE};

/// session id of packets that belong to the handshake
const HANDSHAKE_SESSION_ID: u32 = 0;

/// marker and time stamp in front of a handshake packet's sub-messages
const HANDSHAKE_PREFIX_SIZE: usize = 3;

#[derive(Clone)]
struct SessionEntry {
    session: Arc<Mutex<Session>>,
    inbox: mpsc::Sender<BytesMut>,
}

/// EndPoint is where the parts of the protocol come together: it listens on a UDP socket,
///  routes incoming packets to their sessions (or to the handshake handler for session id 0),
///  drives the sessions' periodic work, and has an API for application code to send messages.
///
/// Each session has a queue of received datagrams and a task that decodes them, so that one
///  session's work does not hold up the receive loop or other sessions.
pub struct EndPoint {
    socket: Arc<UdpSocket>,
    sink: Arc<dyn PacketSink>,
    config: Arc<RtmfpConfig>,
    sessions: AtomicMap<u32, SessionEntry>,
    next_session_id: AtomicU32,
    handshake_handler: Arc<dyn HandshakeHandler>,
    buffer_pool: Arc<BufferPool>,
    handshake_decrypt: RtmfpEngine,
    handshake_encrypt: RtmfpEngine,
    epoch: Instant,
}

impl EndPoint {
    pub async fn new(config: Arc<RtmfpConfig>, handshake_handler: Arc<dyn HandshakeHandler>) -> anyhow::Result<EndPoint> {
        config.validate()?;

        let socket = Arc::new(UdpSocket::bind(config.self_addr).await?);
        info!("bound socket to {:?}", socket.local_addr()?);

        Ok(EndPoint {
            sink: Arc::new(SocketSink::spawn(socket.clone(), config.send_queue_len)),
            socket,
            buffer_pool: Arc::new(BufferPool::new(config.max_packet_size, config.buffer_pool_size)),
            config,
            sessions: AtomicMap::default(),
            next_session_id: AtomicU32::new(0),
            handshake_handler,
            handshake_decrypt: RtmfpEngine::default_decrypt(),
            handshake_encrypt: RtmfpEngine::default_encrypt(),
            epoch: Instant::now(),
        })
    }

    pub fn self_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn num_sessions(&self) -> usize {
        self.sessions.load().len()
    }

    /// Registers a session after a successful handshake and returns its (near) id. Packets from
    ///  the peer must carry this id; `far_id` is the peer's id for the session.
    ///
    /// This spawns the session's decode task, so it must be called from inside a tokio runtime.
    pub fn create_session(
        &self,
        far_id: u32,
        peer_addr: SocketAddr,
        encrypt_key: Arc<RtmfpKey>,
        decrypt_key: Arc<RtmfpKey>,
        handler: Arc<dyn SessionHandler>,
    ) -> u32 {
        let (inbox, receiver) = mpsc::channel(self.config.session_queue_len);

        let id = self.sessions.update(|sessions| {
            let id = loop {
                let candidate = self.next_session_id.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
                if candidate != HANDSHAKE_SESSION_ID && !sessions.contains_key(&candidate) {
                    break candidate;
                }
            };

            let session = Session::new(
                id,
                far_id,
                peer_addr,
                RtmfpEngine::new(decrypt_key, Direction::Decrypt),
                RtmfpEngine::new(encrypt_key, Direction::Encrypt),
                self.config.clone(),
                self.sink.clone(),
                handler,
                self.buffer_pool.clone(),
                Instant::now(),
            );
            let session = Arc::new(Mutex::new(session));
            tokio::spawn(Self::decode_loop(id, session.clone(), receiver, self.buffer_pool.clone()));

            sessions.insert(id, SessionEntry { session, inbox });
            id
        });

        info!("created session {} for peer {:?}", id, peer_addr);
        id
    }

    async fn decode_loop(id: u32, session: Arc<Mutex<Session>>, mut inbox: mpsc::Receiver<BytesMut>, buffer_pool: Arc<BufferPool>) {
        while let Some(mut datagram) = inbox.recv().await {
            let mut session = session.lock().await;
            if let Err(e) = session.decode(&mut datagram, Instant::now()) {
                debug!("session {}: invalid datagram - dropping: {}", id, e);
            }
            let died = session.is_died();
            drop(session);

            buffer_pool.return_to_pool(datagram);
            if died {
                break;
            }
        }
        debug!("session {}: decode loop terminated", id);
    }

    fn session(&self, session_id: u32) -> anyhow::Result<Arc<Mutex<Session>>> {
        self.sessions.get(&session_id)
            .map(|entry| entry.session)
            .ok_or_else(|| RtmfpError::protocol(format!("no session {}", session_id)))
    }

    /// Opens a writer for sending messages to the peer
    pub async fn open_writer(&self, session_id: u32, signature: Bytes, reliable: bool, critical: bool) -> anyhow::Result<u64> {
        self.session(session_id)?
            .lock().await
            .create_writer(signature, reliable, critical)
    }

    /// Queues a message on a writer and sends it right away
    pub async fn write(&self, session_id: u32, writer_id: u64, message: Bytes) -> anyhow::Result<()> {
        let session = self.session(session_id)?;
        let mut session = session.lock().await;
        session.write(writer_id, message)?;
        session.flush(Instant::now());
        Ok(())
    }

    pub async fn close_writer(&self, session_id: u32, writer_id: u64) -> anyhow::Result<()> {
        let session = self.session(session_id)?;
        let mut session = session.lock().await;
        session.close_writer(writer_id)?;
        session.flush(Instant::now());
        Ok(())
    }

    pub async fn kill_session(&self, session_id: u32) -> anyhow::Result<()> {
        self.session(session_id)?
            .lock().await
            .kill();
        self.sessions.update(|sessions| sessions.remove(&session_id));
        Ok(())
    }

    /// Calls every session's periodic work in the configured interval, removing sessions that
    ///  died
    pub async fn manage_loop(&self) {
        info!("starting manage loop");

        let mut ticks = interval(self.config.manage_interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticks.tick().await;
            self.manage_sessions().await;
        }
    }

    async fn manage_sessions(&self) {
        let mut died = vec![];
        for (id, entry) in self.sessions.load().iter() {
            let mut session = entry.session.lock().await;
            session.manage(Instant::now());
            if session.is_died() {
                died.push(*id);
            }
        }

        if !died.is_empty() {
            debug!("removing dead sessions {:?}", died);
            self.sessions.update(|sessions| {
                for id in &died {
                    sessions.remove(id);
                }
            });
        }
    }

    pub async fn recv_loop(&self) {
        info!("starting receive loop");

        loop {
            let mut buf = self.buffer_pool.get_from_pool();
            buf.resize(self.buffer_pool.buf_size(), 0);

            let (num_read, from) = match self.socket.recv_from(buf.as_mut()).await {
                Ok(x) => x,
                Err(e) => {
                    error!("socket error: {}", e);
                    self.buffer_pool.return_to_pool(buf);
                    continue;
                }
            };
            buf.truncate(num_read);

            let correlation_id = Uuid::new_v4();
            let span = span!(Level::TRACE, "packet_received", ?correlation_id);

            self.on_datagram(from, buf).instrument(span).await;
        }
    }

    async fn on_datagram(&self, from: SocketAddr, buf: BytesMut) {
        trace!("received datagram of {} bytes from {:?}", buf.len(), from);

        let session_id = match codec::unpack(&buf) {
            Ok(id) => id,
            Err(_) => {
                debug!("datagram of {} bytes is too short - dropping", buf.len());
                self.buffer_pool.return_to_pool(buf);
                return;
            }
        };

        if session_id == HANDSHAKE_SESSION_ID {
            self.on_handshake_packet(from, buf).instrument(Span::current()).await;
            return;
        }

        let Some(entry) = self.sessions.get(&session_id) else {
            debug!("datagram from {:?} for unknown session {} - dropping", from, session_id);
            self.buffer_pool.return_to_pool(buf);
            return;
        };

        if let Err(e) = entry.inbox.try_send(buf) {
            match e {
                mpsc::error::TrySendError::Full(buf) => {
                    debug!("session {}: receive queue is full - dropping datagram", session_id);
                    self.buffer_pool.return_to_pool(buf);
                }
                mpsc::error::TrySendError::Closed(_) => {
                    debug!("session {} is gone - dropping datagram", session_id);
                }
            }
        }
    }

    async fn on_handshake_packet(&self, from: SocketAddr, mut buf: BytesMut) {
        if let Err(e) = codec::decode(&self.handshake_decrypt, &mut buf) {
            debug!("invalid handshake packet from {:?} - dropping: {}", from, e);
            self.buffer_pool.return_to_pool(buf);
            return;
        }

        let offset = ID_SIZE + CHECKSUM_SIZE + HANDSHAKE_PREFIX_SIZE;
        let body = buf.get(offset..).unwrap_or_default();
        let body = Bytes::copy_from_slice(&body[..sub_messages_len(body)]);
        self.buffer_pool.return_to_pool(buf);

        if let Some(response) = self.handshake_handler.on_handshake(from, body).await {
            self.send_handshake_response(from, &response);
        }
    }

    fn send_handshake_response(&self, to: SocketAddr, response: &[u8]) {
        let mut packet = self.buffer_pool.get_from_pool();
        packet.put_bytes(0, ID_SIZE + CHECKSUM_SIZE);
        packet.put_u8(MARKER_HANDSHAKE);
        packet.put_u16(protocol_time(self.epoch.elapsed()));
        packet.put_slice(response);

        if packet.len() > self.config.max_packet_size {
            warn!("handshake response of {} bytes to {:?} exceeds the maximum packet size", packet.len(), to);
        }

        let result = codec::encode(&self.handshake_encrypt, &mut packet)
            .and_then(|_| codec::pack(&mut packet, HANDSHAKE_SESSION_ID));
        match result {
            Ok(()) => self.sink.send_packet(to, &packet),
            Err(e) => error!("failed to encode handshake response for {:?}: {}", to, e),
        }
        self.buffer_pool.return_to_pool(packet);
    }
}
