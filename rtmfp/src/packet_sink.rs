#[cfg(test)] use mockall::automock;
use std::net::SocketAddr;
use std::sync::Arc;
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error, trace};

/// This is an abstraction for sending a finished packet on a UDP socket, introduced to facilitate
///  mocking the I/O part away for testing.
///
/// Sessions send while holding their lock, so this is not async.
#[cfg_attr(test, automock)]
pub trait PacketSink: Send + Sync + 'static {
    fn send_packet(&self, to: SocketAddr, packet: &[u8]);
}

/// Hands packets to a task that sends them on the socket, waiting for the socket to become
///  writable. Packets are dropped only when the queue in front of that task is full.
pub struct SocketSink {
    queue: mpsc::Sender<(SocketAddr, Bytes)>,
}

impl SocketSink {
    /// Spawns the send task, so this must be called from inside a tokio runtime. The task
    ///  terminates when the sink is dropped.
    pub fn spawn(socket: Arc<UdpSocket>, queue_len: usize) -> SocketSink {
        let (queue, receiver) = mpsc::channel(queue_len);
        tokio::spawn(Self::send_loop(socket, receiver));
        SocketSink { queue }
    }

    async fn send_loop(socket: Arc<UdpSocket>, mut receiver: mpsc::Receiver<(SocketAddr, Bytes)>) {
        while let Some((to, packet)) = receiver.recv().await {
            trace!("UDP socket: sending packet of {} bytes to {:?}", packet.len(), to);
            if let Err(e) = socket.send_to(&packet, to).await {
                error!("error sending UDP packet to {:?}: {}", to, e);
            }
        }
        debug!("send loop terminated");
    }
}

impl PacketSink for SocketSink {
    fn send_packet(&self, to: SocketAddr, packet: &[u8]) {
        match self.queue.try_send((to, Bytes::copy_from_slice(packet))) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                debug!("send queue is full - dropping packet to {:?}", to);
            }
            Err(TrySendError::Closed(_)) => {
                error!("send loop is gone - dropping packet to {:?}", to);
            }
        }
    }
}
