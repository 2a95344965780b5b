//! SIP transport listeners
//!
//! UDP datagrams and Content-Length framed TCP segments both surface as the
//! same `CoreEvent::Inbound`, carrying the bytes, the transport peer and a
//! sink for replies. The core stays oblivious to which transport delivered a
//! message; the sink guarantees that TCP responses ride the request's
//! connection.

use crate::error::{RelayError, RelayResult};
use crate::message;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

const MAX_STREAM_BUFFER: usize = 256 * 1024;

/// Where a reply to an inbound message should go
#[derive(Clone)]
pub enum ReplySink {
    /// Reply over the shared UDP socket to any address
    Udp(Arc<UdpSocket>),
    /// Reply on the TCP connection the request arrived on
    Tcp(mpsc::UnboundedSender<Vec<u8>>),
    /// Hand replies to an in-process consumer (test harnesses)
    Channel(std::sync::mpsc::Sender<(Vec<u8>, SocketAddr)>),
}

impl ReplySink {
    /// Synchronous send so state-mutating handlers never suspend
    pub fn send(&self, bytes: &[u8], addr: SocketAddr) -> RelayResult<()> {
        match self {
            ReplySink::Udp(socket) => socket
                .try_send_to(bytes, addr)
                .map(|_| ())
                .map_err(|e| {
                    let recoverable = e.kind() == std::io::ErrorKind::WouldBlock;
                    RelayError::transport_error(addr.to_string(), e.to_string(), recoverable)
                }),
            ReplySink::Tcp(tx) => tx
                .send(bytes.to_vec())
                .map_err(|_| {
                    RelayError::transport_error(addr.to_string(), "connection closed", false)
                }),
            ReplySink::Channel(tx) => tx
                .send((bytes.to_vec(), addr))
                .map_err(|_| RelayError::transport_error(addr.to_string(), "receiver gone", false)),
        }
    }
}

impl std::fmt::Debug for ReplySink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplySink::Udp(_) => write!(f, "ReplySink::Udp"),
            ReplySink::Tcp(_) => write!(f, "ReplySink::Tcp"),
            ReplySink::Channel(_) => write!(f, "ReplySink::Channel"),
        }
    }
}

/// Input to the single-owner core task
#[derive(Debug)]
pub enum CoreEvent {
    Inbound {
        bytes: Vec<u8>,
        peer: SocketAddr,
        sink: ReplySink,
    },
    SweepRegistrations,
    SweepDialogs,
    SweepBranches,
    SweepPending,
    NatKeepalive,
    Shutdown,
}

/// Empty or CRLF-only datagrams are UA keep-alives, not SIP messages
pub fn is_keepalive(data: &[u8]) -> bool {
    data.iter().all(|&b| b == b'\r' || b == b'\n')
}

/// Pump UDP datagrams into the core channel until the socket closes
pub async fn run_udp_listener(socket: Arc<UdpSocket>, tx: mpsc::Sender<CoreEvent>) {
    let mut buf = vec![0u8; 65535];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, peer)) => {
                let data = &buf[..len];
                if is_keepalive(data) {
                    continue;
                }
                let event = CoreEvent::Inbound {
                    bytes: data.to_vec(),
                    peer,
                    sink: ReplySink::Udp(Arc::clone(&socket)),
                };
                if tx.send(event).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                error!(error = %e, "UDP recv failed, listener exiting");
                return;
            }
        }
    }
}

/// Accept TCP connections and frame SIP messages off each
pub async fn run_tcp_listener(listener: TcpListener, tx: mpsc::Sender<CoreEvent>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                info!(%peer, "SIP/TCP connection established");
                tokio::spawn(serve_tcp_connection(stream, peer, tx.clone()));
            }
            Err(e) => {
                error!(error = %e, "TCP accept failed, listener exiting");
                return;
            }
        }
    }
}

async fn serve_tcp_connection(stream: TcpStream, peer: SocketAddr, tx: mpsc::Sender<CoreEvent>) {
    let (mut read_half, mut write_half) = stream.into_split();
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<Vec<u8>>();

    let writer = tokio::spawn(async move {
        while let Some(bytes) = reply_rx.recv().await {
            if write_half.write_all(&bytes).await.is_err() {
                break;
            }
        }
    });

    let mut buf: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 8192];
    'conn: loop {
        let n = match read_half.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!(%peer, error = %e, "TCP read failed");
                break;
            }
        };
        buf.extend_from_slice(&chunk[..n]);
        if buf.len() > MAX_STREAM_BUFFER {
            warn!(%peer, "stream buffer overflow, closing connection");
            break;
        }

        loop {
            // CRLF keep-alives between messages
            while buf.starts_with(b"\r\n") {
                buf.drain(..2);
            }
            let total = match message::frame_length(&buf) {
                Ok(Some(total)) => total,
                Ok(None) => break,
                Err(e) => {
                    // a poisoned stream cannot be re-framed
                    warn!(%peer, error = %e, "malformed stream, closing connection");
                    break 'conn;
                }
            };
            if buf.len() < total {
                break;
            }
            let bytes: Vec<u8> = buf.drain(..total).collect();
            let event = CoreEvent::Inbound {
                bytes,
                peer,
                sink: ReplySink::Tcp(reply_tx.clone()),
            };
            if tx.send(event).await.is_err() {
                break 'conn;
            }
        }
    }

    info!(%peer, "SIP/TCP connection closed");
    drop(reply_tx);
    let _ = writer.await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration};

    #[test]
    fn test_is_keepalive() {
        assert!(is_keepalive(b""));
        assert!(is_keepalive(b"\r\n"));
        assert!(is_keepalive(b"\r\n\r\n"));
        assert!(!is_keepalive(b"OPTIONS sip:h SIP/2.0\r\n"));
    }

    #[tokio::test]
    async fn test_udp_listener_drops_keepalives() {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let addr = socket.local_addr().unwrap();
        let (tx, mut rx) = mpsc::channel(16);
        tokio::spawn(run_udp_listener(Arc::clone(&socket), tx));

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"\r\n\r\n", addr).await.unwrap();
        client
            .send_to(b"OPTIONS sip:x SIP/2.0\r\nCall-ID: u1\r\n\r\n", addr)
            .await
            .unwrap();

        let event = timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            CoreEvent::Inbound { bytes, peer, .. } => {
                assert!(bytes.starts_with(b"OPTIONS"));
                assert_eq!(peer, client.local_addr().unwrap());
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_tcp_framing_and_reply_path() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, mut rx) = mpsc::channel(16);
        tokio::spawn(run_tcp_listener(listener, tx));

        let mut client = TcpStream::connect(addr).await.unwrap();
        // two messages and a keep-alive arrive in a single write
        let payload = b"MESSAGE sip:a SIP/2.0\r\nCall-ID: t1\r\nContent-Length: 5\r\n\r\nhello\
\r\n\
MESSAGE sip:b SIP/2.0\r\nCall-ID: t2\r\nContent-Length: 0\r\n\r\n";
        client.write_all(payload).await.unwrap();

        let first = timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let sink = match first {
            CoreEvent::Inbound { bytes, sink, .. } => {
                assert!(bytes.ends_with(b"hello"));
                sink
            }
            other => panic!("unexpected event {:?}", other),
        };
        match timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap() {
            CoreEvent::Inbound { bytes, .. } => {
                let text = String::from_utf8(bytes).unwrap();
                assert!(text.contains("Call-ID: t2"));
            }
            other => panic!("unexpected event {:?}", other),
        }

        // replies ride the same connection regardless of the addr argument
        sink.send(b"SIP/2.0 200 OK\r\n\r\n", "9.9.9.9:9".parse().unwrap())
            .unwrap();
        let mut reply = vec![0u8; 64];
        let n = timeout(Duration::from_secs(2), client.read(&mut reply))
            .await
            .unwrap()
            .unwrap();
        assert!(String::from_utf8_lossy(&reply[..n]).starts_with("SIP/2.0 200 OK"));
    }
}
