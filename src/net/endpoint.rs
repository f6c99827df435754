//! A single UDP datagram endpoint: non-blocking send/recv, plus chunked
//! send for oversize payloads.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::UdpSocket;

use crate::codec::{self, Message, MessageType};

/// Maximum UDP datagram size we'll attempt to read. Generously above any
/// realistic MTU; a bigger incoming packet is rejected by the OS before it
/// reaches us.
const RECV_BUFFER_SIZE: usize = 65536;

/// Payload size above which `send_chunked` splits into `CHUNK` datagrams,
/// to stay clear of common MTUs.
pub const SAFE_DATAGRAM_PAYLOAD: usize = 1400;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// How much physical wire traffic a send actually produced: a plain `send`
/// is always one datagram, but `send_chunked` may have written several —
/// callers that feed these counts into `Counters` need both numbers, not
/// just the byte total.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendReport {
    pub datagrams: usize,
    pub bytes: usize,
}

/// A bound, non-blocking UDP socket.
pub struct Endpoint {
    socket: UdpSocket,
}

impl Endpoint {
    /// Bind to `addr` (typically `0.0.0.0:<port>`).
    pub async fn bind(addr: SocketAddr) -> Result<Self, Error> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self { socket })
    }

    /// The socket address this endpoint is actually bound to — useful when
    /// binding to port 0 and letting the OS choose, as tests do.
    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok(self.socket.local_addr()?)
    }

    /// Send one datagram, exactly the codec's encoding of `msg`. Returns
    /// the number of bytes written.
    pub async fn send(&self, msg: &Message, addr: SocketAddr) -> Result<usize, Error> {
        let bytes = codec::encode(msg);
        let n = self.socket.send_to(&bytes, addr).await?;
        Ok(n)
    }

    /// Poll for one datagram for up to `timeout`. Returns `None` if no
    /// traffic arrived in the window, or if a datagram arrived but failed
    /// to decode (discarded silently per the wire protocol).
    pub async fn recv(&self, timeout: Duration) -> Option<(Message, SocketAddr)> {
        let mut buf = [0u8; RECV_BUFFER_SIZE];
        let (n, from) = match tokio::time::timeout(timeout, self.socket.recv_from(&mut buf)).await
        {
            Ok(Ok(result)) => result,
            Ok(Err(_)) | Err(_) => return None,
        };
        codec::decode(&buf[..n]).map(|msg| (msg, from))
    }

    /// Send `msg`, splitting its payload into `CHUNK` datagrams if it
    /// exceeds [`SAFE_DATAGRAM_PAYLOAD`]. Chunks share `msg.sequence`; the
    /// receiver reorders by index and verifies the checksum on assembly.
    /// Order between chunk sends is not guaranteed to matter, and isn't
    /// enforced here. Reports how many physical datagrams were actually
    /// written, since that can be more than one even though this is a
    /// single logical send from the caller's point of view.
    pub async fn send_chunked(&self, msg: &Message, addr: SocketAddr) -> Result<SendReport, Error> {
        if msg.payload.len() <= SAFE_DATAGRAM_PAYLOAD {
            let bytes = self.send(msg, addr).await?;
            return Ok(SendReport {
                datagrams: 1,
                bytes,
            });
        }

        let checksum = crc32fast::hash(&msg.payload);
        let chunks: Vec<&[u8]> = msg.payload.chunks(SAFE_DATAGRAM_PAYLOAD).collect();
        let total_chunks = chunks.len() as u32;
        let mut total_bytes = 0;
        for (index, chunk) in chunks.into_iter().enumerate() {
            let payload = codec::encode_chunk_payload(total_chunks, index as u32, checksum, chunk);
            let chunk_msg = Message {
                msg_type: MessageType::Chunk,
                sequence: msg.sequence,
                timestamp: msg.timestamp,
                payload,
            };
            total_bytes += self.send(&chunk_msg, addr).await?;
        }
        Ok(SendReport {
            datagrams: total_chunks as usize,
            bytes: total_bytes,
        })
    }

    /// Idempotent close: dropping the socket is sufficient under Tokio, but
    /// this gives callers an explicit lifecycle hook to call regardless.
    pub fn close(&self) {
        // UdpSocket has no explicit close; drop does the work. Kept as a
        // named no-op so `Controller::shutdown` has something to call.
    }
}
